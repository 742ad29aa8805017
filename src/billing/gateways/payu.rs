use async_trait::async_trait;
use chrono::DateTime;
use reqwest::Client;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::bookings::Booking;
use crate::config;
use crate::tenants::Tenant;

use super::super::gateway::{
    constant_time_eq, map_error_status, map_send_error, CheckoutSession, GatewayAdapter,
    GatewayError, GatewayEvent, GatewayEventKind, PortalSession,
};
use super::super::models::SubscriptionPlan;

const SUPPORTED_CURRENCIES: &[&str] = &["pln", "eur", "czk", "usd", "gbp", "huf", "ron", "sek"];

/// key: gateway-payu -> bank-redirect provider
///
/// Orders carry our entity reference in `extOrderId` (`tenant-<id>` or
/// `booking-<uuid>`); notifications echo it back, which is how asynchronous
/// order updates find their way to the right entity.
pub struct PayuGateway {
    pos_id: String,
    second_key: String,
    api_base: String,
    client: Client,
}

impl PayuGateway {
    pub fn new(
        pos_id: impl Into<String>,
        second_key: impl Into<String>,
        api_base: impl Into<String>,
        client: Client,
    ) -> Self {
        Self {
            pos_id: pos_id.into(),
            second_key: second_key.into(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
            client,
        }
    }

    pub fn from_env(client: Client) -> Option<Self> {
        let pos_id = config::PAYU_POS_ID.clone()?;
        let second_key = config::PAYU_SECOND_KEY.clone()?;
        Some(Self::new(
            pos_id,
            second_key,
            config::PAYU_API_BASE.clone(),
            client,
        ))
    }

    async fn create_order(
        &self,
        ext_order_id: String,
        description: String,
        amount_cents: i64,
        currency: &str,
        customer_email: &str,
    ) -> Result<CheckoutSession, GatewayError> {
        let url = format!("{}/api/v2_1/orders", self.api_base);
        let body = json!({
            "merchantPosId": self.pos_id,
            "extOrderId": ext_order_id,
            "description": description,
            "currencyCode": currency.to_ascii_uppercase(),
            "totalAmount": amount_cents.to_string(),
            "continueUrl": config::CHECKOUT_RETURN_URL.clone(),
            "buyer": { "email": customer_email },
        });

        let response = self
            .client
            .post(&url)
            .basic_auth(&self.pos_id, Some(&self.second_key))
            .json(&body)
            .send()
            .await
            .map_err(map_send_error)?;

        let status = response.status();
        let text = response.text().await.map_err(map_send_error)?;
        if !status.is_success() {
            return Err(map_error_status(status, text));
        }
        let parsed: Value = serde_json::from_str(&text)
            .map_err(|err| GatewayError::Unavailable(format!("unexpected response body: {err}")))?;

        let status_code = parsed
            .pointer("/status/statusCode")
            .and_then(Value::as_str)
            .unwrap_or("");
        if status_code != "SUCCESS" {
            return Err(GatewayError::InvalidRequest(format!(
                "order rejected with status {status_code}"
            )));
        }

        let redirect_url = parsed
            .get("redirectUri")
            .and_then(Value::as_str)
            .ok_or_else(|| GatewayError::MalformedPayload("missing redirectUri".into()))?;
        let order_id = parsed
            .get("orderId")
            .and_then(Value::as_str)
            .ok_or_else(|| GatewayError::MalformedPayload("missing orderId".into()))?;

        Ok(CheckoutSession {
            redirect_url: redirect_url.to_string(),
            provider_session_ref: order_id.to_string(),
        })
    }

    fn verify_signature(&self, payload: &[u8], header: &str) -> Result<(), GatewayError> {
        let mut signature: Option<&str> = None;
        let mut algorithm: Option<&str> = None;
        for part in header.split(';') {
            if let Some((key, value)) = part.trim().split_once('=') {
                match key {
                    "signature" => signature = Some(value),
                    "algorithm" => algorithm = Some(value),
                    _ => {}
                }
            }
        }
        let signature = signature.ok_or(GatewayError::InvalidSignature)?;
        if algorithm != Some("SHA-256") {
            return Err(GatewayError::InvalidSignature);
        }

        let mut hasher = Sha256::new();
        hasher.update(payload);
        hasher.update(self.second_key.as_bytes());
        let expected = hex::encode(hasher.finalize());

        if !constant_time_eq(signature.as_bytes(), expected.as_bytes()) {
            return Err(GatewayError::InvalidSignature);
        }
        Ok(())
    }

    fn parse_notification(&self, payload: &[u8]) -> Result<GatewayEvent, GatewayError> {
        let parsed: Value = serde_json::from_slice(payload)
            .map_err(|err| GatewayError::MalformedPayload(err.to_string()))?;
        let order = parsed
            .get("order")
            .ok_or_else(|| GatewayError::MalformedPayload("missing order".into()))?;

        let order_id = order
            .get("orderId")
            .and_then(Value::as_str)
            .ok_or_else(|| GatewayError::MalformedPayload("missing orderId".into()))?;
        let order_status = order.get("status").and_then(Value::as_str).unwrap_or("");
        let ext_order_id = order.get("extOrderId").and_then(Value::as_str).unwrap_or("");

        let seq = parsed
            .get("localReceiptDateTime")
            .and_then(Value::as_str)
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|dt| dt.timestamp())
            .unwrap_or(0);

        let kind = if order_status == "COMPLETED" {
            if let Some(raw) = ext_order_id.strip_prefix("booking-") {
                let booking_id = Uuid::parse_str(raw).map_err(|_| {
                    GatewayError::MalformedPayload("bad booking reference in extOrderId".into())
                })?;
                let amount_cents = order
                    .get("totalAmount")
                    .and_then(Value::as_str)
                    .and_then(|raw| raw.parse::<i64>().ok())
                    .unwrap_or(0);
                GatewayEventKind::BookingPaymentSucceeded {
                    booking_id,
                    amount_cents,
                }
            } else if let Some(raw) = ext_order_id.strip_prefix("tenant-") {
                let tenant_id = raw.parse::<i32>().map_err(|_| {
                    GatewayError::MalformedPayload("bad tenant reference in extOrderId".into())
                })?;
                GatewayEventKind::CheckoutCompleted {
                    tenant_id,
                    customer_ref: order_id.to_string(),
                    subscription_ref: Some(order_id.to_string()),
                }
            } else {
                GatewayEventKind::Unknown {
                    event_type: format!("order.completed:{ext_order_id}"),
                }
            }
        } else {
            GatewayEventKind::Unknown {
                event_type: format!("order.{}", order_status.to_ascii_lowercase()),
            }
        };

        Ok(GatewayEvent {
            provider: "payu".to_string(),
            // Notifications carry no event id of their own; order id plus
            // status is stable across redeliveries of the same update.
            event_id: format!("{order_id}:{order_status}"),
            seq,
            kind,
        })
    }
}

#[async_trait]
impl GatewayAdapter for PayuGateway {
    fn key(&self) -> &'static str {
        "payu"
    }

    fn signature_header(&self) -> &'static str {
        "OpenPayu-Signature"
    }

    async fn create_checkout_session(
        &self,
        tenant: &Tenant,
        plan: &SubscriptionPlan,
        customer_email: &str,
    ) -> Result<CheckoutSession, GatewayError> {
        if !SUPPORTED_CURRENCIES.contains(&plan.currency.as_str()) {
            return Err(GatewayError::UnsupportedCurrency(plan.currency.clone()));
        }
        self.create_order(
            format!("tenant-{}", tenant.id),
            plan.name.clone(),
            plan.amount_cents,
            &plan.currency,
            customer_email,
        )
        .await
    }

    async fn create_billing_portal_session(
        &self,
        _tenant: &Tenant,
        customer_ref: Option<&str>,
    ) -> Result<PortalSession, GatewayError> {
        let customer = customer_ref.ok_or(GatewayError::NoCustomerOnFile)?;
        Ok(PortalSession {
            redirect_url: format!("{}/panel/orders/{customer}", self.api_base),
        })
    }

    async fn create_booking_payment_session(
        &self,
        booking: &Booking,
        amount_due_cents: i64,
        currency: &str,
        customer_email: &str,
    ) -> Result<CheckoutSession, GatewayError> {
        if !SUPPORTED_CURRENCIES.contains(&currency) {
            return Err(GatewayError::UnsupportedCurrency(currency.to_string()));
        }
        self.create_order(
            format!("booking-{}", booking.id),
            booking.service_name.clone(),
            amount_due_cents,
            currency,
            customer_email,
        )
        .await
    }

    fn verify_and_parse_webhook(
        &self,
        raw_payload: &[u8],
        signature_header: &str,
    ) -> Result<GatewayEvent, GatewayError> {
        self.verify_signature(raw_payload, signature_header)?;
        self.parse_notification(raw_payload)
    }

    async fn cancel_subscription(
        &self,
        subscription_ref: Option<&str>,
        _at_period_end: bool,
    ) -> Result<(), GatewayError> {
        // No scheduled-cancel notion here; stopping future charges covers
        // both modes, and a missing order is already cancelled.
        let Some(subscription_ref) = subscription_ref else {
            return Ok(());
        };
        let url = format!("{}/api/v2_1/orders/{subscription_ref}", self.api_base);
        let response = self
            .client
            .delete(&url)
            .basic_auth(&self.pos_id, Some(&self.second_key))
            .send()
            .await
            .map_err(map_send_error)?;
        let status = response.status();
        if status.is_success() || status == reqwest::StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(map_error_status(status, String::new()))
        }
    }

    async fn resume_subscription(
        &self,
        subscription_ref: Option<&str>,
    ) -> Result<(), GatewayError> {
        // Recurring agreements resume implicitly on the next charge attempt.
        tracing::debug!(?subscription_ref, "payu resume is a provider-side no-op");
        Ok(())
    }
}
