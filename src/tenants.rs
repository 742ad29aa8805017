use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{FromRow, PgPool};

use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Tenant {
    pub id: i32,
    pub name: String,
    pub contact_email: String,
    pub created_at: DateTime<Utc>,
}

/// key: tenant-payment-config -> gateway priority, cash policy, auto-confirm
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct TenantPaymentConfig {
    pub tenant_id: i32,
    pub enabled_gateways: Vec<String>,
    pub accept_cash: bool,
    pub auto_confirm_bookings: bool,
}

impl TenantPaymentConfig {
    /// The first enabled gateway is the default pre-selection.
    pub fn default_gateway(&self) -> Option<&str> {
        self.enabled_gateways.first().map(|s| s.as_str())
    }

    pub fn gateway_enabled(&self, key: &str) -> bool {
        self.enabled_gateways.iter().any(|g| g == key)
    }
}

pub async fn fetch_tenant(pool: &PgPool, tenant_id: i32) -> AppResult<Tenant> {
    sqlx::query_as::<_, Tenant>("SELECT * FROM tenants WHERE id = $1")
        .bind(tenant_id)
        .fetch_optional(pool)
        .await?
        .ok_or(AppError::NotFound)
}

/// Missing config rows fall back to cash-only with no online gateways, so a
/// half-onboarded tenant never exposes a broken payment path.
pub async fn fetch_payment_config(pool: &PgPool, tenant_id: i32) -> AppResult<TenantPaymentConfig> {
    let config = sqlx::query_as::<_, TenantPaymentConfig>(
        "SELECT * FROM tenant_payment_configs WHERE tenant_id = $1",
    )
    .bind(tenant_id)
    .fetch_optional(pool)
    .await?;

    Ok(config.unwrap_or(TenantPaymentConfig {
        tenant_id,
        enabled_gateways: Vec::new(),
        accept_cash: true,
        auto_confirm_bookings: false,
    }))
}
