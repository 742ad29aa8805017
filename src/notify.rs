use serde_json::json;

use crate::bookings::Booking;
use crate::config;

/// Fire-and-forget hand-off to the notification dispatcher after a booking
/// payment is confirmed. Delivery is someone else's job; reconciliation never
/// waits on it and never fails because of it.
pub fn booking_payment_confirmed(booking: &Booking) {
    let booking = booking.clone();
    tokio::spawn(async move {
        let Some(url) = config::NOTIFY_WEBHOOK_URL.clone() else {
            tracing::info!(
                booking = %booking.id,
                customer = %booking.customer_email,
                "booking payment confirmed (no notification endpoint configured)"
            );
            return;
        };

        let payload = json!({
            "event": "booking.payment_confirmed",
            "booking_id": booking.id,
            "tenant_id": booking.tenant_id,
            "customer_email": booking.customer_email,
            "payment_status": booking.payment_status,
            "deposit_paid": booking.deposit_paid,
            "status": booking.status,
        });
        if let Err(err) = reqwest::Client::new().post(&url).json(&payload).send().await {
            tracing::warn!(?err, booking = %booking.id, "notification dispatch failed");
        }
    });
}
