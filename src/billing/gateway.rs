use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::bookings::Booking;
use crate::config;
use crate::error::AppError;
use crate::tenants::Tenant;

use super::gateways::{payu::PayuGateway, stripe::StripeGateway};
use super::models::SubscriptionPlan;

/// key: gateway-error -> provider failure taxonomy
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("gateway unavailable: {0}")]
    Unavailable(String),
    #[error("gateway rejected credentials: {0}")]
    InvalidCredentials(String),
    #[error("gateway rejected request: {0}")]
    InvalidRequest(String),
    #[error("no billing customer on file")]
    NoCustomerOnFile,
    #[error("currency '{0}' is not supported by this gateway")]
    UnsupportedCurrency(String),
    #[error("invalid webhook signature")]
    InvalidSignature,
    #[error("malformed webhook payload: {0}")]
    MalformedPayload(String),
}

impl From<GatewayError> for AppError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Unavailable(msg) => AppError::GatewayUnavailable(msg),
            GatewayError::InvalidCredentials(msg) => AppError::InvalidCredentials(msg),
            GatewayError::InvalidRequest(msg) => AppError::Validation(msg),
            GatewayError::NoCustomerOnFile => {
                AppError::Validation("no billing customer on file; complete checkout first".into())
            }
            GatewayError::UnsupportedCurrency(currency) => {
                AppError::Validation(format!("currency '{currency}' is not supported"))
            }
            GatewayError::InvalidSignature => AppError::InvalidSignature,
            GatewayError::MalformedPayload(msg) => AppError::Validation(msg),
        }
    }
}

/// A provider-hosted flow the caller redirects to.
#[derive(Debug, Clone, Serialize)]
pub struct CheckoutSession {
    pub redirect_url: String,
    pub provider_session_ref: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PortalSession {
    pub redirect_url: String,
}

/// key: gateway-event -> normalized provider webhook
///
/// `seq` is the provider-side event timestamp/sequence; the reconciler uses it
/// as a per-entity monotone high-water mark to discard stale redeliveries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayEvent {
    pub provider: String,
    pub event_id: String,
    pub seq: i64,
    pub kind: GatewayEventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum GatewayEventKind {
    /// First successful provider confirmation of a tenant checkout.
    CheckoutCompleted {
        tenant_id: i32,
        customer_ref: String,
        subscription_ref: Option<String>,
    },
    /// A period payment settled. Covers trial conversion, renewal, and
    /// past-due recovery; the reconciler picks the transition from the
    /// subscription's current status.
    SubscriptionPaid {
        subscription_ref: String,
        period_end: Option<DateTime<Utc>>,
        invoice: Option<InvoiceDraft>,
    },
    SubscriptionPaymentFailed {
        subscription_ref: String,
        error: String,
    },
    /// Provider-side termination (trial ran out, retries exhausted).
    SubscriptionEnded { subscription_ref: String },
    /// Non-transition bookkeeping: mirror payment-method and cancellation
    /// flags the provider reports. Never changes status.
    SubscriptionSynced {
        subscription_ref: String,
        payment_method_ref: Option<String>,
        cancel_at_period_end: Option<bool>,
    },
    BookingPaymentSucceeded {
        booking_id: Uuid,
        amount_cents: i64,
    },
    Unknown { event_type: String },
}

impl GatewayEvent {
    /// Entity key used to serialize reconciliation per subscription/booking.
    pub fn entity_key(&self) -> String {
        match &self.kind {
            GatewayEventKind::CheckoutCompleted { tenant_id, .. } => format!("tenant:{tenant_id}"),
            GatewayEventKind::SubscriptionPaid {
                subscription_ref, ..
            }
            | GatewayEventKind::SubscriptionPaymentFailed {
                subscription_ref, ..
            }
            | GatewayEventKind::SubscriptionEnded { subscription_ref }
            | GatewayEventKind::SubscriptionSynced {
                subscription_ref, ..
            } => format!("subscription:{subscription_ref}"),
            GatewayEventKind::BookingPaymentSucceeded { booking_id, .. } => {
                format!("booking:{booking_id}")
            }
            GatewayEventKind::Unknown { .. } => format!("unknown:{}", self.event_id),
        }
    }
}

/// key: invoice-draft -> ledger row parsed from a provider payment event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceDraft {
    pub provider_invoice_ref: String,
    pub amount_cents: i64,
    pub currency: String,
    pub document_url: Option<String>,
}

/// key: gateway-adapter -> uniform contract over payment providers
///
/// Pure translation; no business logic, no retries, no provider selection.
/// Callers pick the provider from tenant configuration.
#[async_trait]
pub trait GatewayAdapter: Send + Sync {
    fn key(&self) -> &'static str;

    /// HTTP header carrying the provider's webhook signature.
    fn signature_header(&self) -> &'static str;

    async fn create_checkout_session(
        &self,
        tenant: &Tenant,
        plan: &SubscriptionPlan,
        customer_email: &str,
    ) -> Result<CheckoutSession, GatewayError>;

    async fn create_billing_portal_session(
        &self,
        tenant: &Tenant,
        customer_ref: Option<&str>,
    ) -> Result<PortalSession, GatewayError>;

    async fn create_booking_payment_session(
        &self,
        booking: &Booking,
        amount_due_cents: i64,
        currency: &str,
        customer_email: &str,
    ) -> Result<CheckoutSession, GatewayError>;

    /// Rejecting unverifiable payloads is a security boundary, not best-effort.
    fn verify_and_parse_webhook(
        &self,
        raw_payload: &[u8],
        signature_header: &str,
    ) -> Result<GatewayEvent, GatewayError>;

    /// Idempotent: cancelling an already-cancelled (or absent) subscription is
    /// a no-op.
    async fn cancel_subscription(
        &self,
        subscription_ref: Option<&str>,
        at_period_end: bool,
    ) -> Result<(), GatewayError>;

    async fn resume_subscription(&self, subscription_ref: Option<&str>)
        -> Result<(), GatewayError>;
}

/// key: gateway-registry -> adapters keyed by tenant-configurable gateway key
pub struct GatewayRegistry {
    adapters: HashMap<&'static str, Arc<dyn GatewayAdapter>>,
}

impl GatewayRegistry {
    pub fn empty() -> Self {
        Self {
            adapters: HashMap::new(),
        }
    }

    /// Registers every gateway whose credentials are present in the
    /// environment. A tenant can only enable gateways registered here.
    pub fn from_env() -> Self {
        let client = outbound_client();
        let mut registry = Self::empty();
        if let Some(adapter) = StripeGateway::from_env(client.clone()) {
            registry.register(Arc::new(adapter));
        }
        if let Some(adapter) = PayuGateway::from_env(client) {
            registry.register(Arc::new(adapter));
        }
        if registry.adapters.is_empty() {
            tracing::warn!("no payment gateway credentials configured; online payment disabled");
        }
        registry
    }

    pub fn register(&mut self, adapter: Arc<dyn GatewayAdapter>) {
        self.adapters.insert(adapter.key(), adapter);
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn GatewayAdapter>> {
        self.adapters.get(key).cloned()
    }

    pub fn keys(&self) -> Vec<&'static str> {
        self.adapters.keys().copied().collect()
    }
}

/// Shared outbound client. Bounded timeout; on timeout the call fails with
/// `GatewayError::Unavailable` and the caller decides whether to retry.
pub fn outbound_client() -> Client {
    Client::builder()
        .timeout(Duration::from_secs(*config::GATEWAY_TIMEOUT_SECS))
        .build()
        .expect("gateway http client build")
}

pub(crate) fn map_send_error(err: reqwest::Error) -> GatewayError {
    if err.is_timeout() {
        GatewayError::Unavailable("request timed out".to_string())
    } else {
        GatewayError::Unavailable(err.to_string())
    }
}

pub(crate) fn map_error_status(status: reqwest::StatusCode, body: String) -> GatewayError {
    if status.is_server_error() {
        GatewayError::Unavailable(format!("provider returned {status}"))
    } else if status == reqwest::StatusCode::UNAUTHORIZED
        || status == reqwest::StatusCode::FORBIDDEN
    {
        GatewayError::InvalidCredentials(format!("provider returned {status}"))
    } else {
        GatewayError::InvalidRequest(format!("provider returned {status}: {body}"))
    }
}

/// Constant-time signature comparison.
pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0, |acc, (x, y)| acc | (x ^ y)) == 0
}
