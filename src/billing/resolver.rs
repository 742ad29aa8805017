use serde::Serialize;

use crate::bookings::{Booking, BookingStatus, PaymentMethod, PaymentStatus};
use crate::tenants::TenantPaymentConfig;

/// key: booking-payment-resolver -> amount due, eligibility, candidate gateways
///
/// Pure over a booking snapshot and the tenant's payment configuration. No
/// clock input on purpose: bookings whose start time has passed stay payable
/// (settling after the fact is allowed).
#[derive(Debug, Clone, Serialize)]
pub struct PaymentResolution {
    pub payable: bool,
    pub amount_due_cents: Option<i64>,
    pub available_providers: Vec<String>,
    pub reason: ResolutionReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionReason {
    Cancelled,
    AlreadyPaid,
    CashOnly,
    DepositSettledRemainderInPerson,
    DepositCoversTotal,
    NoGatewayConfigured,
    DepositDue,
    RemainderDue,
    FullAmountDue,
}

impl ResolutionReason {
    /// Human-readable form surfaced to customers, never raw provider text.
    pub fn message(&self) -> &'static str {
        match self {
            ResolutionReason::Cancelled => "this booking has been cancelled",
            ResolutionReason::AlreadyPaid => "this booking is already paid",
            ResolutionReason::CashOnly => "this booking is payable in cash at the venue",
            ResolutionReason::DepositSettledRemainderInPerson => {
                "the deposit is settled; the remainder is due in person"
            }
            ResolutionReason::DepositCoversTotal => "the deposit already covers the full price",
            ResolutionReason::NoGatewayConfigured => "online payment is not available",
            ResolutionReason::DepositDue => "a deposit is due to secure this booking",
            ResolutionReason::RemainderDue => "the remaining balance after the deposit is due",
            ResolutionReason::FullAmountDue => "the full price is due",
        }
    }
}

pub fn resolve(booking: &Booking, config: &TenantPaymentConfig) -> PaymentResolution {
    if booking.status() == BookingStatus::Cancelled {
        return not_payable(ResolutionReason::Cancelled);
    }
    if booking.payment_status() == PaymentStatus::Paid {
        return not_payable(ResolutionReason::AlreadyPaid);
    }

    // Cash-only bookings with no deposit requirement never expose an online
    // payment path; paying twice at the venue is worse than paying late.
    if booking.payment_method() == PaymentMethod::Cash && booking.deposit_cents.is_none() {
        return not_payable(ResolutionReason::CashOnly);
    }

    let (amount_due, reason) = match booking.deposit_cents {
        Some(deposit) if !booking.deposit_paid => (deposit, ResolutionReason::DepositDue),
        Some(deposit) => {
            // Deposit settled. Online settlement of the remainder only applies
            // when the booking is marked for online payment; otherwise the
            // remainder is collected in person.
            if booking.payment_method() == PaymentMethod::Cash {
                return not_payable(ResolutionReason::DepositSettledRemainderInPerson);
            }
            let remainder = booking.total_price_cents - deposit;
            if remainder <= 0 {
                return not_payable(ResolutionReason::DepositCoversTotal);
            }
            (remainder, ResolutionReason::RemainderDue)
        }
        None => (booking.total_price_cents, ResolutionReason::FullAmountDue),
    };

    let available_providers = config.enabled_gateways.clone();
    if available_providers.is_empty() {
        return not_payable(ResolutionReason::NoGatewayConfigured);
    }

    PaymentResolution {
        payable: true,
        amount_due_cents: Some(amount_due),
        available_providers,
        reason,
    }
}

fn not_payable(reason: ResolutionReason) -> PaymentResolution {
    PaymentResolution {
        payable: false,
        amount_due_cents: None,
        available_providers: Vec::new(),
        reason,
    }
}
