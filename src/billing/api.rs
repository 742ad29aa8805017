use axum::{
    extract::{Extension, Query},
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::sync::Arc;

use crate::error::{AppError, AppResult};
use crate::extractor::AuthTenant;
use crate::tenants::{self, TenantPaymentConfig};

use super::gateway::{GatewayAdapter, GatewayRegistry};
use super::ledger::BillingInvoiceLedger;
use super::lifecycle::SubscriptionLifecycleManager;
use super::models::{Invoice, Subscription, SubscriptionPlan};
use super::reconciler::{self, WebhookEventRecord};

/// key: billing-api -> rest endpoints
#[derive(Debug, Serialize)]
pub struct SubscriptionEnvelope {
    pub subscription: Subscription,
    pub plan: SubscriptionPlan,
    pub remaining_trial_days: i64,
}

pub async fn list_plans(
    Extension(pool): Extension<PgPool>,
) -> AppResult<Json<Vec<SubscriptionPlan>>> {
    let plans = sqlx::query_as::<_, SubscriptionPlan>(
        "SELECT * FROM subscription_plans WHERE active = TRUE ORDER BY amount_cents ASC",
    )
    .fetch_all(&pool)
    .await?;
    Ok(Json(plans))
}

pub async fn get_subscription(
    Extension(pool): Extension<PgPool>,
    tenant: AuthTenant,
) -> AppResult<Json<Option<SubscriptionEnvelope>>> {
    let lifecycle = SubscriptionLifecycleManager::new(pool);
    let Some(subscription) = lifecycle.for_tenant(tenant.tenant_id).await? else {
        return Ok(Json(None));
    };
    let plan = lifecycle.plan(subscription.plan_id).await?;
    let remaining_trial_days = subscription.remaining_trial_days(Utc::now());
    Ok(Json(Some(SubscriptionEnvelope {
        subscription,
        plan,
        remaining_trial_days,
    })))
}

#[derive(Debug, Deserialize)]
pub struct CheckoutSessionRequest {
    pub plan_code: String,
    #[serde(default)]
    pub provider: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RedirectResponse {
    pub redirect_url: String,
}

pub async fn create_checkout_session(
    Extension(pool): Extension<PgPool>,
    Extension(registry): Extension<Arc<GatewayRegistry>>,
    tenant: AuthTenant,
    Json(payload): Json<CheckoutSessionRequest>,
) -> AppResult<Json<RedirectResponse>> {
    let record = tenants::fetch_tenant(&pool, tenant.tenant_id).await?;
    let config = tenants::fetch_payment_config(&pool, tenant.tenant_id).await?;
    let gateway = select_gateway(&config, &registry, payload.provider.as_deref())?;

    let plan = sqlx::query_as::<_, SubscriptionPlan>(
        "SELECT * FROM subscription_plans WHERE code = $1 AND active = TRUE",
    )
    .bind(&payload.plan_code)
    .fetch_optional(&pool)
    .await?
    .ok_or_else(|| AppError::Validation(format!("unknown plan '{}'", payload.plan_code)))?;

    let lifecycle = SubscriptionLifecycleManager::new(pool);
    let session = lifecycle
        .start_checkout(&record, &plan, gateway, &record.contact_email)
        .await?;
    Ok(Json(RedirectResponse {
        redirect_url: session.redirect_url,
    }))
}

pub async fn create_portal_session(
    Extension(pool): Extension<PgPool>,
    Extension(registry): Extension<Arc<GatewayRegistry>>,
    tenant: AuthTenant,
) -> AppResult<Json<RedirectResponse>> {
    let record = tenants::fetch_tenant(&pool, tenant.tenant_id).await?;
    let lifecycle = SubscriptionLifecycleManager::new(pool);
    let subscription = lifecycle.for_tenant(tenant.tenant_id).await?;
    let gateway = gateway_for_subscription(&registry, subscription.as_ref())?;
    let session = lifecycle.portal_session(&record, gateway).await?;
    Ok(Json(RedirectResponse {
        redirect_url: session.redirect_url,
    }))
}

/// User intent: request cancellation. Only ever flips `cancel_at_period_end`.
pub async fn cancel_subscription(
    Extension(pool): Extension<PgPool>,
    Extension(registry): Extension<Arc<GatewayRegistry>>,
    tenant: AuthTenant,
) -> AppResult<Json<Subscription>> {
    let lifecycle = SubscriptionLifecycleManager::new(pool);
    let subscription = lifecycle.for_tenant(tenant.tenant_id).await?;
    let gateway = gateway_for_subscription(&registry, subscription.as_ref())?;
    let updated = lifecycle.request_cancel(tenant.tenant_id, gateway).await?;
    Ok(Json(updated))
}

/// User intent: undo a pending cancellation.
pub async fn resume_subscription(
    Extension(pool): Extension<PgPool>,
    Extension(registry): Extension<Arc<GatewayRegistry>>,
    tenant: AuthTenant,
) -> AppResult<Json<Subscription>> {
    let lifecycle = SubscriptionLifecycleManager::new(pool);
    let subscription = lifecycle.for_tenant(tenant.tenant_id).await?;
    let gateway = gateway_for_subscription(&registry, subscription.as_ref())?;
    let updated = lifecycle.request_resume(tenant.tenant_id, gateway).await?;
    Ok(Json(updated))
}

pub async fn list_invoices(
    Extension(pool): Extension<PgPool>,
    tenant: AuthTenant,
) -> AppResult<Json<Vec<Invoice>>> {
    let lifecycle = SubscriptionLifecycleManager::new(pool.clone());
    let Some(subscription) = lifecycle.for_tenant(tenant.tenant_id).await? else {
        return Ok(Json(Vec::new()));
    };
    let ledger = BillingInvoiceLedger::new(pool);
    Ok(Json(ledger.list_for_subscription(subscription.id).await?))
}

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    #[serde(default)]
    pub page: Option<i64>,
    #[serde(default)]
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct SubscriptionPage {
    pub subscriptions: Vec<Subscription>,
    pub page: i64,
    pub limit: i64,
    pub total: i64,
}

/// Read-only operator listing.
pub async fn admin_list_subscriptions(
    Extension(pool): Extension<PgPool>,
    tenant: AuthTenant,
    Query(query): Query<PageQuery>,
) -> AppResult<Json<SubscriptionPage>> {
    if !tenant.is_operator() {
        return Err(AppError::Forbidden);
    }
    let page = query.page.unwrap_or(1).max(1);
    let limit = query.limit.unwrap_or(25).clamp(1, 100);

    let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM subscriptions")
        .fetch_one(&pool)
        .await?;
    let subscriptions = sqlx::query_as::<_, Subscription>(
        "SELECT * FROM subscriptions ORDER BY updated_at DESC LIMIT $1 OFFSET $2",
    )
    .bind(limit)
    .bind((page - 1) * limit)
    .fetch_all(&pool)
    .await?;

    Ok(Json(SubscriptionPage {
        subscriptions,
        page,
        limit,
        total,
    }))
}

#[derive(Debug, Deserialize)]
pub struct EventQuery {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub limit: Option<i64>,
}

/// Operator view over the idempotency store, chiefly for parked events.
pub async fn admin_list_webhook_events(
    Extension(pool): Extension<PgPool>,
    tenant: AuthTenant,
    Query(query): Query<EventQuery>,
) -> AppResult<Json<Vec<WebhookEventRecord>>> {
    if !tenant.is_operator() {
        return Err(AppError::Forbidden);
    }
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    let events = reconciler::list_events(&pool, query.status.as_deref(), limit).await?;
    Ok(Json(events))
}

fn select_gateway(
    config: &TenantPaymentConfig,
    registry: &GatewayRegistry,
    requested: Option<&str>,
) -> AppResult<Arc<dyn GatewayAdapter>> {
    let key = match requested {
        Some(key) => {
            if !config.gateway_enabled(key) {
                return Err(AppError::Validation(format!(
                    "payment provider '{key}' is not enabled for this business"
                )));
            }
            key
        }
        None => config.default_gateway().ok_or_else(|| {
            AppError::Validation("no payment gateway enabled for this business".into())
        })?,
    };
    registry.get(key).ok_or_else(|| {
        AppError::Configuration(format!(
            "gateway '{key}' is enabled for the tenant but has no platform credentials"
        ))
    })
}

fn gateway_for_subscription(
    registry: &GatewayRegistry,
    subscription: Option<&Subscription>,
) -> AppResult<Arc<dyn GatewayAdapter>> {
    let key = subscription
        .and_then(|s| s.provider.as_deref())
        .ok_or(AppError::NotFound)?;
    registry.get(key).ok_or_else(|| {
        AppError::Configuration(format!(
            "gateway '{key}' has no platform credentials configured"
        ))
    })
}
