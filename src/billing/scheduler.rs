use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use tokio::time::{self, Duration as TokioDuration};
use tracing::{info, warn};

use crate::config;

use super::lifecycle::{LifecycleEvent, SubscriptionLifecycleManager};
use super::models::Subscription;

/// key: billing-sweep -> scheduled transitions no webhook will deliver
///
/// Safe to run concurrently with webhook processing: every candidate is
/// re-applied through the lifecycle table, whose UPDATEs re-check the current
/// status, so a last-minute renewal webhook wins.
pub fn spawn(pool: PgPool) {
    let interval = TokioDuration::from_secs(*config::BILLING_SWEEP_INTERVAL_SECS);
    let grace_days = *config::BILLING_PAST_DUE_GRACE_DAYS;

    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        loop {
            ticker.tick().await;
            let now = Utc::now();
            if let Err(err) = process_tick(&pool, now, grace_days).await {
                warn!(?err, "billing sweep tick failed");
            }
        }
    });
}

/// key: billing-sweep -> tick handler
pub async fn process_tick(pool: &PgPool, now: DateTime<Utc>, grace_days: i64) -> Result<()> {
    let lifecycle = SubscriptionLifecycleManager::new(pool.clone());

    // Trials that ran out with no payment method on file. Trials with a
    // payment method convert through the provider's own invoice webhook.
    let expired_trials = sqlx::query_as::<_, Subscription>(
        r#"
        SELECT * FROM subscriptions
        WHERE status = 'trialing'
          AND trial_end IS NOT NULL
          AND trial_end < $1
          AND provider_payment_method_ref IS NULL
        "#,
    )
    .bind(now)
    .fetch_all(pool)
    .await?;

    for subscription in expired_trials {
        match lifecycle
            .execute_transition(&subscription, &LifecycleEvent::TrialExpired, now)
            .await
        {
            Ok(Some(updated)) => info!(
                tenant_id = updated.tenant_id,
                subscription = %updated.id,
                "trial expired without payment method; subscription cancelled"
            ),
            Ok(None) => {}
            Err(err) => warn!(
                ?err,
                subscription = %subscription.id,
                "failed to cancel expired trial"
            ),
        }
    }

    // Requested cancellations whose period has ended.
    let ending = sqlx::query_as::<_, Subscription>(
        r#"
        SELECT * FROM subscriptions
        WHERE status IN ('active', 'trialing', 'past_due')
          AND cancel_at_period_end = TRUE
          AND current_period_end IS NOT NULL
          AND current_period_end < $1
        "#,
    )
    .bind(now)
    .fetch_all(pool)
    .await?;

    for subscription in ending {
        match lifecycle
            .execute_transition(
                &subscription,
                &LifecycleEvent::PeriodEndedCancelRequested,
                now,
            )
            .await
        {
            Ok(Some(updated)) => info!(
                tenant_id = updated.tenant_id,
                subscription = %updated.id,
                "requested cancellation completed at period end"
            ),
            Ok(None) => {}
            Err(err) => warn!(
                ?err,
                subscription = %subscription.id,
                "failed to complete requested cancellation"
            ),
        }
    }

    // Past-due accounts whose grace window is exhausted. `updated_at` marks
    // when the payment failure moved them to past_due.
    let grace_cutoff = now - Duration::days(grace_days);
    let overdue =
        sqlx::query_as::<_, Subscription>("SELECT * FROM subscriptions WHERE status = 'past_due'")
            .fetch_all(pool)
            .await?;

    for subscription in overdue {
        if subscription.updated_at > grace_cutoff {
            continue;
        }
        match lifecycle
            .execute_transition(&subscription, &LifecycleEvent::GraceExhausted, now)
            .await
        {
            Ok(Some(updated)) => info!(
                tenant_id = updated.tenant_id,
                subscription = %updated.id,
                "grace period exhausted; subscription cancelled"
            ),
            Ok(None) => {}
            Err(err) => warn!(
                ?err,
                subscription = %subscription.id,
                "failed to cancel past_due subscription"
            ),
        }
    }

    Ok(())
}
