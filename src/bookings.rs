use axum::{
    extract::{Extension, Path},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use std::sync::Arc;
use uuid::Uuid;

use crate::billing::gateway::GatewayRegistry;
use crate::billing::resolver::{self, PaymentResolution};
use crate::error::{AppError, AppResult};
use crate::tenants;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Cancelled,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentStatus {
    Unpaid,
    Paid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentMethod {
    Cash,
    Online,
}

/// key: booking-model -> payment fields owned by the reconciler once online
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Booking {
    pub id: Uuid,
    pub tenant_id: i32,
    pub customer_email: String,
    pub service_name: String,
    pub start_time: DateTime<Utc>,
    pub total_price_cents: i64,
    pub currency: String,
    pub deposit_cents: Option<i64>,
    pub deposit_paid: bool,
    pub payment_status: String,
    pub payment_method: String,
    pub status: String,
    pub provider_session_ref: Option<String>,
    pub last_event_seq: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Booking {
    pub fn status(&self) -> BookingStatus {
        match self.status.as_str() {
            "confirmed" => BookingStatus::Confirmed,
            "cancelled" => BookingStatus::Cancelled,
            "completed" => BookingStatus::Completed,
            _ => BookingStatus::Pending,
        }
    }

    pub fn payment_status(&self) -> PaymentStatus {
        if self.payment_status == "paid" {
            PaymentStatus::Paid
        } else {
            PaymentStatus::Unpaid
        }
    }

    pub fn payment_method(&self) -> PaymentMethod {
        if self.payment_method == "cash" {
            PaymentMethod::Cash
        } else {
            PaymentMethod::Online
        }
    }
}

pub async fn fetch_booking(pool: &PgPool, id: Uuid) -> AppResult<Booking> {
    sqlx::query_as::<_, Booking>("SELECT * FROM bookings WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or(AppError::NotFound)
}

/// key: booking-payment-api -> resolution + session creation
pub async fn booking_payment(
    Extension(pool): Extension<PgPool>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<PaymentResolution>> {
    let booking = fetch_booking(&pool, id).await?;
    let config = tenants::fetch_payment_config(&pool, booking.tenant_id).await?;
    let resolution = resolver::resolve(&booking, &config);
    if !resolution.payable {
        return Err(AppError::NotPayable(resolution.reason.message().to_string()));
    }
    Ok(Json(resolution))
}

#[derive(Debug, Deserialize)]
pub struct PayBookingRequest {
    #[serde(default)]
    pub provider: Option<String>,
    pub email: String,
}

#[derive(Debug, Serialize)]
pub struct PayBookingResponse {
    pub redirect_url: String,
}

pub async fn pay_booking(
    Extension(pool): Extension<PgPool>,
    Extension(registry): Extension<Arc<GatewayRegistry>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<PayBookingRequest>,
) -> AppResult<Json<PayBookingResponse>> {
    if !payload.email.contains('@') {
        return Err(AppError::Validation("a valid email is required".into()));
    }

    let booking = fetch_booking(&pool, id).await?;
    let config = tenants::fetch_payment_config(&pool, booking.tenant_id).await?;
    let resolution = resolver::resolve(&booking, &config);
    if !resolution.payable {
        return Err(AppError::NotPayable(resolution.reason.message().to_string()));
    }
    let amount_due = resolution
        .amount_due_cents
        .ok_or_else(|| AppError::Message("payable resolution without amount".into()))?;

    // First enabled gateway is the default pre-selection.
    let provider = match payload.provider {
        Some(provider) => {
            if !resolution.available_providers.iter().any(|p| p == &provider) {
                return Err(AppError::Validation(format!(
                    "payment provider '{provider}' is not enabled for this business"
                )));
            }
            provider
        }
        None => resolution.available_providers[0].clone(),
    };

    let adapter = registry.get(&provider).ok_or_else(|| {
        AppError::Configuration(format!(
            "gateway '{provider}' is enabled for the tenant but has no platform credentials"
        ))
    })?;

    let session = adapter
        .create_booking_payment_session(&booking, amount_due, &booking.currency, &payload.email)
        .await?;

    sqlx::query("UPDATE bookings SET provider_session_ref = $2, updated_at = NOW() WHERE id = $1")
        .bind(booking.id)
        .bind(&session.provider_session_ref)
        .execute(&pool)
        .await?;

    tracing::info!(
        booking = %booking.id,
        provider = %provider,
        amount_cents = amount_due,
        "booking payment session created"
    );
    Ok(Json(PayBookingResponse {
        redirect_url: session.redirect_url,
    }))
}
