use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::AppResult;

use super::gateway::InvoiceDraft;
use super::models::Invoice;

/// key: invoice-ledger -> append-only, paid_at attaches at most once
#[derive(Clone)]
pub struct BillingInvoiceLedger {
    pool: PgPool,
}

impl BillingInvoiceLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Records a provider invoice. Replays of the same provider reference are
    /// absorbed: the row is inserted once, and `paid_at` is only ever attached
    /// to a row that does not have one yet.
    pub async fn record(
        &self,
        subscription_id: Uuid,
        draft: &InvoiceDraft,
        paid_at: Option<DateTime<Utc>>,
    ) -> AppResult<Invoice> {
        let status = if paid_at.is_some() { "paid" } else { "pending" };
        sqlx::query(
            r#"
            INSERT INTO invoices (
                id, subscription_id, amount_cents, currency, status,
                provider_invoice_ref, document_url, paid_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (provider_invoice_ref) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(subscription_id)
        .bind(draft.amount_cents)
        .bind(&draft.currency)
        .bind(status)
        .bind(&draft.provider_invoice_ref)
        .bind(draft.document_url.as_deref())
        .bind(paid_at)
        .execute(&self.pool)
        .await?;

        if let Some(paid_at) = paid_at {
            sqlx::query(
                r#"
                UPDATE invoices
                SET status = 'paid', paid_at = $2
                WHERE provider_invoice_ref = $1 AND paid_at IS NULL
                "#,
            )
            .bind(&draft.provider_invoice_ref)
            .bind(paid_at)
            .execute(&self.pool)
            .await?;
        }

        let row = sqlx::query_as::<_, Invoice>(
            "SELECT * FROM invoices WHERE provider_invoice_ref = $1",
        )
        .bind(&draft.provider_invoice_ref)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn list_for_subscription(&self, subscription_id: Uuid) -> AppResult<Vec<Invoice>> {
        let rows = sqlx::query_as::<_, Invoice>(
            "SELECT * FROM invoices WHERE subscription_id = $1 ORDER BY created_at DESC",
        )
        .bind(subscription_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
