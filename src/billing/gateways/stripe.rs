use async_trait::async_trait;
use base64::Engine;
use chrono::{TimeZone, Utc};
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;
use uuid::Uuid;

use crate::bookings::Booking;
use crate::config;
use crate::tenants::Tenant;

use super::super::gateway::{
    constant_time_eq, map_error_status, map_send_error, CheckoutSession, GatewayAdapter,
    GatewayError, GatewayEvent, GatewayEventKind, InvoiceDraft, PortalSession,
};
use super::super::models::SubscriptionPlan;

/// Signature timestamps older than this are rejected as replays.
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

const SUPPORTED_CURRENCIES: &[&str] = &[
    "usd", "eur", "gbp", "pln", "czk", "chf", "cad", "aud", "sek", "nok", "dkk",
];

/// key: gateway-stripe -> card-based provider
pub struct StripeGateway {
    secret_key: String,
    webhook_secret: String,
    api_base: String,
    client: Client,
}

impl StripeGateway {
    pub fn new(
        secret_key: impl Into<String>,
        webhook_secret: impl Into<String>,
        api_base: impl Into<String>,
        client: Client,
    ) -> Self {
        Self {
            secret_key: secret_key.into(),
            webhook_secret: webhook_secret.into(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
            client,
        }
    }

    pub fn from_env(client: Client) -> Option<Self> {
        let secret_key = config::STRIPE_SECRET_KEY.clone()?;
        let webhook_secret = config::STRIPE_WEBHOOK_SECRET.clone()?;
        Some(Self::new(
            secret_key,
            webhook_secret,
            config::STRIPE_API_BASE.clone(),
            client,
        ))
    }

    async fn post_form(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<Value, GatewayError> {
        let url = format!("{}{}", self.api_base, path);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.secret_key)
            .form(params)
            .send()
            .await
            .map_err(map_send_error)?;

        let status = response.status();
        let body = response.text().await.map_err(map_send_error)?;
        if !status.is_success() {
            return Err(map_error_status(status, body));
        }
        serde_json::from_str(&body)
            .map_err(|err| GatewayError::Unavailable(format!("unexpected response body: {err}")))
    }

    async fn delete(&self, path: &str) -> Result<reqwest::StatusCode, GatewayError> {
        let url = format!("{}{}", self.api_base, path);
        let response = self
            .client
            .delete(&url)
            .bearer_auth(&self.secret_key)
            .send()
            .await
            .map_err(map_send_error)?;
        Ok(response.status())
    }

    /// Webhook secrets are distributed as `whsec_<base64>`; fall back to raw
    /// bytes for secrets that do not carry the prefix.
    fn signing_key(&self) -> Vec<u8> {
        match self.webhook_secret.strip_prefix("whsec_") {
            Some(encoded) => base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .unwrap_or_else(|_| self.webhook_secret.as_bytes().to_vec()),
            None => self.webhook_secret.as_bytes().to_vec(),
        }
    }

    fn verify_signature(&self, payload: &[u8], header: &str) -> Result<(), GatewayError> {
        let mut timestamp: Option<&str> = None;
        let mut sig_v1: Option<&str> = None;
        for part in header.split(',') {
            if let Some((key, value)) = part.trim().split_once('=') {
                match key {
                    "t" => timestamp = Some(value),
                    "v1" => sig_v1 = Some(value),
                    _ => {}
                }
            }
        }
        let timestamp = timestamp.ok_or(GatewayError::InvalidSignature)?;
        let sig_v1 = sig_v1.ok_or(GatewayError::InvalidSignature)?;

        let payload_str =
            std::str::from_utf8(payload).map_err(|_| GatewayError::InvalidSignature)?;
        let signed_payload = format!("{timestamp}.{payload_str}");

        let mut mac = Hmac::<Sha256>::new_from_slice(&self.signing_key())
            .map_err(|_| GatewayError::InvalidSignature)?;
        mac.update(signed_payload.as_bytes());
        let expected = hex::encode(mac.finalize().into_bytes());

        if !constant_time_eq(sig_v1.as_bytes(), expected.as_bytes()) {
            return Err(GatewayError::InvalidSignature);
        }

        let ts: i64 = timestamp
            .parse()
            .map_err(|_| GatewayError::InvalidSignature)?;
        if (Utc::now().timestamp() - ts).abs() > SIGNATURE_TOLERANCE_SECS {
            return Err(GatewayError::InvalidSignature);
        }
        Ok(())
    }

    fn parse_event(&self, payload: &[u8]) -> Result<GatewayEvent, GatewayError> {
        let raw: RawEvent = serde_json::from_slice(payload)
            .map_err(|err| GatewayError::MalformedPayload(err.to_string()))?;
        let object = raw.data.object;

        let kind = match raw.event_type.as_str() {
            "checkout.session.completed" => parse_checkout_completed(&object)?,
            "invoice.paid" => {
                let subscription_ref = require_str(&object, "subscription")?;
                let period_end = object
                    .get("period_end")
                    .and_then(Value::as_i64)
                    .and_then(|ts| Utc.timestamp_opt(ts, 0).single());
                let invoice = object.get("id").and_then(Value::as_str).map(|id| {
                    InvoiceDraft {
                        provider_invoice_ref: id.to_string(),
                        amount_cents: object
                            .get("amount_paid")
                            .and_then(Value::as_i64)
                            .unwrap_or(0),
                        currency: object
                            .get("currency")
                            .and_then(Value::as_str)
                            .unwrap_or("usd")
                            .to_string(),
                        document_url: object
                            .get("hosted_invoice_url")
                            .and_then(Value::as_str)
                            .map(|s| s.to_string()),
                    }
                });
                GatewayEventKind::SubscriptionPaid {
                    subscription_ref,
                    period_end,
                    invoice,
                }
            }
            "invoice.payment_failed" => GatewayEventKind::SubscriptionPaymentFailed {
                subscription_ref: require_str(&object, "subscription")?,
                error: object
                    .get("last_payment_error")
                    .and_then(|e| e.get("message"))
                    .and_then(Value::as_str)
                    .unwrap_or("payment failed")
                    .to_string(),
            },
            "customer.subscription.deleted" => GatewayEventKind::SubscriptionEnded {
                subscription_ref: require_str(&object, "id")?,
            },
            "customer.subscription.updated" => GatewayEventKind::SubscriptionSynced {
                subscription_ref: require_str(&object, "id")?,
                payment_method_ref: object
                    .get("default_payment_method")
                    .and_then(Value::as_str)
                    .map(|s| s.to_string()),
                cancel_at_period_end: object.get("cancel_at_period_end").and_then(Value::as_bool),
            },
            other => GatewayEventKind::Unknown {
                event_type: other.to_string(),
            },
        };

        Ok(GatewayEvent {
            provider: "stripe".to_string(),
            event_id: raw.id,
            seq: raw.created,
            kind,
        })
    }
}

fn parse_checkout_completed(object: &Value) -> Result<GatewayEventKind, GatewayError> {
    let metadata = object.get("metadata").cloned().unwrap_or(Value::Null);
    if let Some(booking_id) = metadata.get("booking_id").and_then(Value::as_str) {
        let booking_id = Uuid::parse_str(booking_id)
            .map_err(|_| GatewayError::MalformedPayload("bad booking_id metadata".into()))?;
        return Ok(GatewayEventKind::BookingPaymentSucceeded {
            booking_id,
            amount_cents: object.get("amount_total").and_then(Value::as_i64).unwrap_or(0),
        });
    }
    let tenant_id = metadata
        .get("tenant_id")
        .and_then(Value::as_str)
        .and_then(|raw| raw.parse::<i32>().ok())
        .ok_or_else(|| GatewayError::MalformedPayload("missing tenant_id metadata".into()))?;
    Ok(GatewayEventKind::CheckoutCompleted {
        tenant_id,
        customer_ref: require_str(object, "customer")?,
        subscription_ref: object
            .get("subscription")
            .and_then(Value::as_str)
            .map(|s| s.to_string()),
    })
}

fn require_str(object: &Value, field: &str) -> Result<String, GatewayError> {
    object
        .get(field)
        .and_then(Value::as_str)
        .map(|s| s.to_string())
        .ok_or_else(|| GatewayError::MalformedPayload(format!("missing field '{field}'")))
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    created: i64,
    data: RawEventData,
}

#[derive(Debug, Deserialize)]
struct RawEventData {
    object: Value,
}

#[async_trait]
impl GatewayAdapter for StripeGateway {
    fn key(&self) -> &'static str {
        "stripe"
    }

    fn signature_header(&self) -> &'static str {
        "Stripe-Signature"
    }

    async fn create_checkout_session(
        &self,
        tenant: &Tenant,
        plan: &SubscriptionPlan,
        customer_email: &str,
    ) -> Result<CheckoutSession, GatewayError> {
        let return_url = config::CHECKOUT_RETURN_URL.clone();
        let mut params = vec![
            ("mode", "subscription".to_string()),
            ("customer_email", customer_email.to_string()),
            ("success_url", return_url.clone()),
            ("cancel_url", return_url),
            ("line_items[0][quantity]", "1".to_string()),
            ("line_items[0][price_data][currency]", plan.currency.clone()),
            (
                "line_items[0][price_data][unit_amount]",
                plan.amount_cents.to_string(),
            ),
            (
                "line_items[0][price_data][recurring][interval]",
                "month".to_string(),
            ),
            (
                "line_items[0][price_data][product_data][name]",
                plan.name.clone(),
            ),
            ("metadata[tenant_id]", tenant.id.to_string()),
        ];
        if plan.trial_days > 0 {
            params.push((
                "subscription_data[trial_period_days]",
                plan.trial_days.to_string(),
            ));
        }

        let body = self.post_form("/v1/checkout/sessions", &params).await?;
        Ok(CheckoutSession {
            redirect_url: require_str(&body, "url")?,
            provider_session_ref: require_str(&body, "id")?,
        })
    }

    async fn create_billing_portal_session(
        &self,
        _tenant: &Tenant,
        customer_ref: Option<&str>,
    ) -> Result<PortalSession, GatewayError> {
        let customer = customer_ref.ok_or(GatewayError::NoCustomerOnFile)?;
        let params = vec![
            ("customer", customer.to_string()),
            ("return_url", config::CHECKOUT_RETURN_URL.clone()),
        ];
        let body = self.post_form("/v1/billing_portal/sessions", &params).await?;
        Ok(PortalSession {
            redirect_url: require_str(&body, "url")?,
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
        let return_url = config::CHECKOUT_RETURN_URL.clone();
        let params = vec![
            ("mode", "payment".to_string()),
            ("customer_email", customer_email.to_string()),
            ("success_url", return_url.clone()),
            ("cancel_url", return_url),
            ("line_items[0][quantity]", "1".to_string()),
            ("line_items[0][price_data][currency]", currency.to_string()),
            (
                "line_items[0][price_data][unit_amount]",
                amount_due_cents.to_string(),
            ),
            (
                "line_items[0][price_data][product_data][name]",
                booking.service_name.clone(),
            ),
            ("metadata[booking_id]", booking.id.to_string()),
        ];

        let body = self.post_form("/v1/checkout/sessions", &params).await?;
        Ok(CheckoutSession {
            redirect_url: require_str(&body, "url")?,
            provider_session_ref: require_str(&body, "id")?,
        })
    }

    fn verify_and_parse_webhook(
        &self,
        raw_payload: &[u8],
        signature_header: &str,
    ) -> Result<GatewayEvent, GatewayError> {
        self.verify_signature(raw_payload, signature_header)?;
        self.parse_event(raw_payload)
    }

    async fn cancel_subscription(
        &self,
        subscription_ref: Option<&str>,
        at_period_end: bool,
    ) -> Result<(), GatewayError> {
        // Nothing on file: already effectively cancelled.
        let Some(subscription_ref) = subscription_ref else {
            return Ok(());
        };
        if at_period_end {
            match self
                .post_form(
                    &format!("/v1/subscriptions/{subscription_ref}"),
                    &[("cancel_at_period_end", "true".to_string())],
                )
                .await
            {
                Ok(_) => Ok(()),
                Err(GatewayError::InvalidRequest(msg)) if msg.contains("404") => Ok(()),
                Err(err) => Err(err),
            }
        } else {
            let status = self
                .delete(&format!("/v1/subscriptions/{subscription_ref}"))
                .await?;
            if status.is_success() || status == reqwest::StatusCode::NOT_FOUND {
                Ok(())
            } else {
                Err(map_error_status(status, String::new()))
            }
        }
    }

    async fn resume_subscription(
        &self,
        subscription_ref: Option<&str>,
    ) -> Result<(), GatewayError> {
        let Some(subscription_ref) = subscription_ref else {
            return Ok(());
        };
        match self
            .post_form(
                &format!("/v1/subscriptions/{subscription_ref}"),
                &[("cancel_at_period_end", "false".to_string())],
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(GatewayError::InvalidRequest(msg)) if msg.contains("404") => Ok(()),
            Err(err) => Err(err),
        }
    }
}
