use chrono::{DateTime, Duration, Months, Utc};
use sqlx::PgPool;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::tenants::Tenant;

use super::gateway::{CheckoutSession, GatewayAdapter, PortalSession};
use super::models::{Subscription, SubscriptionPlan, SubscriptionStatus};

/// key: lifecycle-events -> everything that may move a subscription
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    /// First successful provider confirmation after checkout.
    CheckoutCompleted {
        provider: String,
        customer_ref: String,
        subscription_ref: Option<String>,
        trial_days: i32,
    },
    TrialConverted {
        period_end: Option<DateTime<Utc>>,
    },
    RenewalSucceeded {
        period_end: Option<DateTime<Utc>>,
    },
    PaymentRecovered {
        period_end: Option<DateTime<Utc>>,
    },
    PaymentFailed {
        error: String,
    },
    TrialExpired,
    GraceExhausted,
    PeriodEndedCancelRequested,
}

impl LifecycleEvent {
    fn name(&self) -> &'static str {
        match self {
            LifecycleEvent::CheckoutCompleted { .. } => "checkout_completed",
            LifecycleEvent::TrialConverted { .. } => "trial_converted",
            LifecycleEvent::RenewalSucceeded { .. } => "renewal_succeeded",
            LifecycleEvent::PaymentRecovered { .. } => "payment_recovered",
            LifecycleEvent::PaymentFailed { .. } => "payment_failed",
            LifecycleEvent::TrialExpired => "trial_expired",
            LifecycleEvent::GraceExhausted => "grace_exhausted",
            LifecycleEvent::PeriodEndedCancelRequested => "period_ended_cancel_requested",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("transition rejected: {from:?} cannot accept {event}")]
pub struct TransitionRejected {
    pub from: SubscriptionStatus,
    pub event: &'static str,
}

/// key: lifecycle-table -> the only legal edges
///
/// Anything not listed is rejected so out-of-order or duplicated provider
/// events cannot corrupt state. User intents (cancel/resume) are not edges:
/// they only flip `cancel_at_period_end`.
pub fn next_status(
    current: SubscriptionStatus,
    event: &LifecycleEvent,
) -> Result<SubscriptionStatus, TransitionRejected> {
    use LifecycleEvent as E;
    use SubscriptionStatus as S;

    let next = match (current, event) {
        (S::Incomplete, E::CheckoutCompleted { trial_days, .. }) if *trial_days > 0 => S::Trialing,
        (S::Incomplete, E::CheckoutCompleted { .. }) => S::Active,
        (S::Trialing, E::TrialConverted { .. }) => S::Active,
        (S::Trialing, E::TrialExpired) => S::Cancelled,
        (S::Active, E::RenewalSucceeded { .. }) => S::Active,
        (S::Active, E::PaymentFailed { .. }) => S::PastDue,
        (S::PastDue, E::PaymentRecovered { .. }) => S::Active,
        (S::PastDue, E::GraceExhausted) => S::Cancelled,
        (S::Active | S::Trialing | S::PastDue, E::PeriodEndedCancelRequested) => S::Cancelled,
        (from, event) => {
            return Err(TransitionRejected {
                from,
                event: event.name(),
            })
        }
    };
    Ok(next)
}

/// key: lifecycle-manager -> subscription state machine + user intents
#[derive(Clone)]
pub struct SubscriptionLifecycleManager {
    pool: PgPool,
}

impl SubscriptionLifecycleManager {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn for_tenant(&self, tenant_id: i32) -> AppResult<Option<Subscription>> {
        let row =
            sqlx::query_as::<_, Subscription>("SELECT * FROM subscriptions WHERE tenant_id = $1")
                .bind(tenant_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row)
    }

    pub async fn by_provider_subscription_ref(
        &self,
        provider: &str,
        subscription_ref: &str,
    ) -> AppResult<Option<Subscription>> {
        let row = sqlx::query_as::<_, Subscription>(
            "SELECT * FROM subscriptions WHERE provider = $1 AND provider_subscription_ref = $2",
        )
        .bind(provider)
        .bind(subscription_ref)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn plan(&self, plan_id: Uuid) -> AppResult<SubscriptionPlan> {
        sqlx::query_as::<_, SubscriptionPlan>("SELECT * FROM subscription_plans WHERE id = $1")
            .bind(plan_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(AppError::NotFound)
    }

    /// Starts (or restarts, after cancellation) a checkout. The row is parked
    /// in `incomplete` until the provider confirms via webhook; `status` is
    /// never set here beyond that.
    pub async fn start_checkout(
        &self,
        tenant: &Tenant,
        plan: &SubscriptionPlan,
        gateway: Arc<dyn GatewayAdapter>,
        customer_email: &str,
    ) -> AppResult<CheckoutSession> {
        if let Some(existing) = self.for_tenant(tenant.id).await? {
            if existing.status().grants_access() {
                return Err(AppError::Validation(
                    "an active subscription already exists; use the billing portal to change plans"
                        .into(),
                ));
            }
        }

        // One subscription row per tenant. A post-cancellation checkout reuses
        // the row as a fresh lifecycle; `last_event_seq` is retained so
        // replayed events from the old lifecycle stay stale.
        sqlx::query(
            r#"
            INSERT INTO subscriptions (id, tenant_id, plan_id, status, provider, current_period_start)
            VALUES ($1, $2, $3, 'incomplete', $4, NOW())
            ON CONFLICT (tenant_id)
            DO UPDATE SET
                plan_id = EXCLUDED.plan_id,
                status = 'incomplete',
                provider = EXCLUDED.provider,
                trial_start = NULL,
                trial_end = NULL,
                current_period_start = NOW(),
                current_period_end = NULL,
                cancel_at_period_end = FALSE,
                provider_customer_ref = NULL,
                provider_subscription_ref = NULL,
                provider_payment_method_ref = NULL,
                last_payment_status = NULL,
                last_payment_error = NULL,
                updated_at = NOW()
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(tenant.id)
        .bind(plan.id)
        .bind(gateway.key())
        .execute(&self.pool)
        .await?;

        let session = gateway
            .create_checkout_session(tenant, plan, customer_email)
            .await?;
        Ok(session)
    }

    pub async fn portal_session(
        &self,
        tenant: &Tenant,
        gateway: Arc<dyn GatewayAdapter>,
    ) -> AppResult<PortalSession> {
        let subscription = self.for_tenant(tenant.id).await?;
        let customer_ref = subscription
            .as_ref()
            .and_then(|s| s.provider_customer_ref.as_deref());
        let session = gateway
            .create_billing_portal_session(tenant, customer_ref)
            .await?;
        Ok(session)
    }

    /// User intent: request cancellation. Flips `cancel_at_period_end` only;
    /// the status change happens at period end via the scheduled sweep.
    pub async fn request_cancel(
        &self,
        tenant_id: i32,
        gateway: Arc<dyn GatewayAdapter>,
    ) -> AppResult<Subscription> {
        let subscription = self
            .for_tenant(tenant_id)
            .await?
            .ok_or(AppError::NotFound)?;
        if !subscription.status().grants_access() {
            return Err(AppError::Validation(
                "no active subscription to cancel".into(),
            ));
        }

        gateway
            .cancel_subscription(subscription.provider_subscription_ref.as_deref(), true)
            .await?;

        let updated = sqlx::query_as::<_, Subscription>(
            r#"
            UPDATE subscriptions
            SET cancel_at_period_end = TRUE, updated_at = NOW()
            WHERE id = $1 AND status IN ('active', 'trialing', 'past_due')
            RETURNING *
            "#,
        )
        .bind(subscription.id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(AppError::NotFound)?;
        tracing::info!(
            tenant_id,
            subscription = %updated.id,
            "cancellation requested; subscription runs until period end"
        );
        Ok(updated)
    }

    /// User intent: undo a pending cancellation. Clears the flag; never
    /// touches `status`.
    pub async fn request_resume(
        &self,
        tenant_id: i32,
        gateway: Arc<dyn GatewayAdapter>,
    ) -> AppResult<Subscription> {
        let subscription = self
            .for_tenant(tenant_id)
            .await?
            .ok_or(AppError::NotFound)?;
        if !subscription.status().grants_access() || !subscription.cancel_at_period_end {
            return Err(AppError::Validation(
                "no pending cancellation to resume from".into(),
            ));
        }

        gateway
            .resume_subscription(subscription.provider_subscription_ref.as_deref())
            .await?;

        let updated = sqlx::query_as::<_, Subscription>(
            r#"
            UPDATE subscriptions
            SET cancel_at_period_end = FALSE, updated_at = NOW()
            WHERE id = $1 AND status IN ('active', 'trialing', 'past_due')
            RETURNING *
            "#,
        )
        .bind(subscription.id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(AppError::NotFound)?;
        tracing::info!(tenant_id, subscription = %updated.id, "pending cancellation cleared");
        Ok(updated)
    }

    /// Applies a table-driven transition. The UPDATE re-checks the current
    /// status so a concurrent writer supersedes us cleanly (`Ok(None)`).
    /// Rejected transitions are logged as anomalies and surfaced as errors.
    pub async fn execute_transition(
        &self,
        subscription: &Subscription,
        event: &LifecycleEvent,
        now: DateTime<Utc>,
    ) -> AppResult<Option<Subscription>> {
        let current = subscription.status();
        let next = match next_status(current, event) {
            Ok(next) => next,
            Err(rejected) => {
                tracing::warn!(
                    subscription = %subscription.id,
                    from = current.as_str(),
                    event = rejected.event,
                    "anomalous transition rejected"
                );
                return Err(AppError::Validation(rejected.to_string()));
            }
        };

        let updated = match event {
            LifecycleEvent::CheckoutCompleted {
                provider,
                customer_ref,
                subscription_ref,
                trial_days,
            } => {
                let (trial_start, trial_end) = if *trial_days > 0 {
                    (Some(now), Some(now + Duration::days(*trial_days as i64)))
                } else {
                    (None, None)
                };
                let period_end = now
                    .checked_add_months(Months::new(1))
                    .unwrap_or(now);
                sqlx::query_as::<_, Subscription>(
                    r#"
                    UPDATE subscriptions
                    SET status = $2,
                        trial_start = $3,
                        trial_end = $4,
                        current_period_start = $5,
                        current_period_end = $6,
                        provider = $7,
                        provider_customer_ref = $8,
                        provider_subscription_ref = $9,
                        last_payment_status = 'succeeded',
                        last_payment_error = NULL,
                        updated_at = NOW()
                    WHERE id = $1 AND status = 'incomplete'
                    RETURNING *
                    "#,
                )
                .bind(subscription.id)
                .bind(next.as_str())
                .bind(trial_start)
                .bind(trial_end)
                .bind(now)
                .bind(period_end)
                .bind(provider)
                .bind(customer_ref)
                .bind(subscription_ref.as_deref())
                .fetch_optional(&self.pool)
                .await?
            }
            LifecycleEvent::TrialConverted { period_end }
            | LifecycleEvent::RenewalSucceeded { period_end }
            | LifecycleEvent::PaymentRecovered { period_end } => {
                let period_end = period_end
                    .unwrap_or_else(|| now.checked_add_months(Months::new(1)).unwrap_or(now));
                sqlx::query_as::<_, Subscription>(
                    r#"
                    UPDATE subscriptions
                    SET status = 'active',
                        current_period_start = $3,
                        current_period_end = $4,
                        last_payment_status = 'succeeded',
                        last_payment_error = NULL,
                        updated_at = NOW()
                    WHERE id = $1 AND status = $2
                    RETURNING *
                    "#,
                )
                .bind(subscription.id)
                .bind(current.as_str())
                .bind(now)
                .bind(period_end)
                .fetch_optional(&self.pool)
                .await?
            }
            LifecycleEvent::PaymentFailed { error } => {
                sqlx::query_as::<_, Subscription>(
                    r#"
                    UPDATE subscriptions
                    SET status = 'past_due',
                        last_payment_status = 'failed',
                        last_payment_error = $2,
                        updated_at = NOW()
                    WHERE id = $1 AND status = 'active'
                    RETURNING *
                    "#,
                )
                .bind(subscription.id)
                .bind(error)
                .fetch_optional(&self.pool)
                .await?
            }
            LifecycleEvent::TrialExpired
            | LifecycleEvent::GraceExhausted
            | LifecycleEvent::PeriodEndedCancelRequested => {
                sqlx::query_as::<_, Subscription>(
                    r#"
                    UPDATE subscriptions
                    SET status = 'cancelled', updated_at = NOW()
                    WHERE id = $1 AND status = $2
                    RETURNING *
                    "#,
                )
                .bind(subscription.id)
                .bind(current.as_str())
                .fetch_optional(&self.pool)
                .await?
            }
        };

        if updated.is_none() {
            tracing::info!(
                subscription = %subscription.id,
                event = event.name(),
                "transition superseded by a concurrent update"
            );
        }
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checkout(trial_days: i32) -> LifecycleEvent {
        LifecycleEvent::CheckoutCompleted {
            provider: "stripe".to_string(),
            customer_ref: "cus_1".to_string(),
            subscription_ref: Some("sub_1".to_string()),
            trial_days,
        }
    }

    #[test]
    fn checkout_grants_trial_or_activates() {
        assert_eq!(
            next_status(SubscriptionStatus::Incomplete, &checkout(14)),
            Ok(SubscriptionStatus::Trialing)
        );
        assert_eq!(
            next_status(SubscriptionStatus::Incomplete, &checkout(0)),
            Ok(SubscriptionStatus::Active)
        );
    }

    #[test]
    fn trial_converts_or_expires() {
        assert_eq!(
            next_status(
                SubscriptionStatus::Trialing,
                &LifecycleEvent::TrialConverted { period_end: None }
            ),
            Ok(SubscriptionStatus::Active)
        );
        assert_eq!(
            next_status(SubscriptionStatus::Trialing, &LifecycleEvent::TrialExpired),
            Ok(SubscriptionStatus::Cancelled)
        );
    }

    #[test]
    fn payment_failure_and_recovery() {
        assert_eq!(
            next_status(
                SubscriptionStatus::Active,
                &LifecycleEvent::PaymentFailed {
                    error: "card declined".into()
                }
            ),
            Ok(SubscriptionStatus::PastDue)
        );
        assert_eq!(
            next_status(
                SubscriptionStatus::PastDue,
                &LifecycleEvent::PaymentRecovered { period_end: None }
            ),
            Ok(SubscriptionStatus::Active)
        );
        assert_eq!(
            next_status(SubscriptionStatus::PastDue, &LifecycleEvent::GraceExhausted),
            Ok(SubscriptionStatus::Cancelled)
        );
    }

    #[test]
    fn cancel_at_period_end_completes_from_any_access_state() {
        for status in [
            SubscriptionStatus::Active,
            SubscriptionStatus::Trialing,
            SubscriptionStatus::PastDue,
        ] {
            assert_eq!(
                next_status(status, &LifecycleEvent::PeriodEndedCancelRequested),
                Ok(SubscriptionStatus::Cancelled)
            );
        }
    }

    #[test]
    fn cancelled_accepts_nothing() {
        let events = [
            checkout(14),
            LifecycleEvent::TrialConverted { period_end: None },
            LifecycleEvent::RenewalSucceeded { period_end: None },
            LifecycleEvent::PaymentRecovered { period_end: None },
            LifecycleEvent::PaymentFailed {
                error: "x".to_string(),
            },
            LifecycleEvent::TrialExpired,
            LifecycleEvent::GraceExhausted,
            LifecycleEvent::PeriodEndedCancelRequested,
        ];
        for event in &events {
            assert!(
                next_status(SubscriptionStatus::Cancelled, event).is_err(),
                "cancelled must not accept {}",
                event.name()
            );
        }
    }

    #[test]
    fn out_of_table_edges_rejected() {
        assert!(next_status(
            SubscriptionStatus::Trialing,
            &LifecycleEvent::PaymentFailed {
                error: "x".to_string()
            }
        )
        .is_err());
        assert!(next_status(
            SubscriptionStatus::Active,
            &LifecycleEvent::PaymentRecovered { period_end: None }
        )
        .is_err());
        assert!(next_status(SubscriptionStatus::Incomplete, &LifecycleEvent::TrialExpired).is_err());
        assert!(next_status(SubscriptionStatus::Active, &checkout(0)).is_err());
    }
}
