use anyhow::{anyhow, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use sqlx::{FromRow, PgPool};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use tokio::sync::mpsc::{channel, Receiver, Sender};
use tokio::time::{sleep, Duration};
use uuid::Uuid;

use crate::bookings::Booking;
use crate::config;
use crate::error::AppError;
use crate::notify;
use crate::tenants;

use super::gateway::{GatewayEvent, GatewayEventKind};
use super::ledger::BillingInvoiceLedger;
use super::lifecycle::{LifecycleEvent, SubscriptionLifecycleManager};
use super::models::{Subscription, SubscriptionStatus};

/// key: reconciler -> the only writer of authoritative billing state
///
/// Events are routed to a worker by entity key, so all events for one
/// subscription or booking are applied by a single writer in arrival order.
#[derive(Clone)]
pub struct ReconcilerHandle {
    senders: Vec<Sender<GatewayEvent>>,
}

impl ReconcilerHandle {
    pub async fn dispatch(&self, event: GatewayEvent) -> Result<()> {
        let index = worker_index(&event.entity_key(), self.senders.len());
        self.senders[index]
            .send(event)
            .await
            .map_err(|err| anyhow!("failed to enqueue webhook event: {err}"))
    }
}

fn worker_index(entity_key: &str, workers: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    entity_key.hash(&mut hasher);
    (hasher.finish() % workers as u64) as usize
}

/// How a processed event ended up. Persisted verbatim on the event record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    Stale,
    Skipped,
}

impl Outcome {
    fn as_str(&self) -> &'static str {
        match self {
            Outcome::Applied => "applied",
            Outcome::Stale => "stale",
            Outcome::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct WebhookEventRecord {
    pub id: i64,
    pub provider: String,
    pub event_id: String,
    pub entity_key: String,
    pub seq: i64,
    pub status: String,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub received_at: DateTime<Utc>,
}

pub fn start_reconciler_pool(pool: PgPool) -> ReconcilerHandle {
    let workers = *config::WEBHOOK_WORKER_COUNT;
    let mut senders = Vec::with_capacity(workers);
    for worker in 0..workers {
        let (tx, rx) = channel(64);
        senders.push(tx);
        let worker_pool = pool.clone();
        tokio::spawn(async move {
            run_worker(worker, worker_pool, rx).await;
        });
    }

    let handle = ReconcilerHandle { senders };

    // Events caught mid-flight by a restart are resumed, the same way the
    // provider would redeliver them.
    let replay_pool = pool;
    let replay_handle = handle.clone();
    tokio::spawn(async move {
        if let Err(err) = replay_unfinished(&replay_pool, &replay_handle).await {
            tracing::warn!(?err, "failed to replay unfinished webhook events");
        }
    });

    handle
}

async fn replay_unfinished(pool: &PgPool, handle: &ReconcilerHandle) -> Result<()> {
    let rows: Vec<(serde_json::Value,)> = sqlx::query_as(
        "SELECT payload FROM billing_webhook_events WHERE status = 'processing' ORDER BY id",
    )
    .fetch_all(pool)
    .await?;
    for (payload,) in rows {
        match serde_json::from_value::<GatewayEvent>(payload) {
            Ok(event) => handle.dispatch(event).await?,
            Err(err) => tracing::warn!(?err, "unreadable stored webhook payload; leaving parked"),
        }
    }
    Ok(())
}

async fn run_worker(worker: usize, pool: PgPool, mut rx: Receiver<GatewayEvent>) {
    let lifecycle = SubscriptionLifecycleManager::new(pool.clone());
    let ledger = BillingInvoiceLedger::new(pool.clone());
    while let Some(event) = rx.recv().await {
        process_with_retry(worker, &pool, &lifecycle, &ledger, event).await;
    }
}

async fn process_with_retry(
    worker: usize,
    pool: &PgPool,
    lifecycle: &SubscriptionLifecycleManager,
    ledger: &BillingInvoiceLedger,
    event: GatewayEvent,
) {
    match admit(pool, &event).await {
        Ok(true) => {}
        Ok(false) => {
            tracing::debug!(
                provider = %event.provider,
                event_id = %event.event_id,
                "webhook replay short-circuited"
            );
            return;
        }
        Err(err) => {
            tracing::error!(?err, event_id = %event.event_id, "webhook admission failed");
            return;
        }
    }

    let max_attempts = *config::WEBHOOK_MAX_ATTEMPTS;
    let mut attempt = 0;
    loop {
        attempt += 1;
        match apply(pool, lifecycle, ledger, &event).await {
            Ok(outcome) => {
                if let Err(err) = finalize(pool, &event, outcome, attempt).await {
                    tracing::error!(?err, event_id = %event.event_id, "failed to record outcome");
                }
                tracing::info!(
                    worker,
                    provider = %event.provider,
                    event_id = %event.event_id,
                    entity = %event.entity_key(),
                    outcome = outcome.as_str(),
                    "webhook event processed"
                );
                return;
            }
            Err(err) if attempt < max_attempts => {
                tracing::warn!(
                    ?err,
                    attempt,
                    event_id = %event.event_id,
                    "webhook apply failed; backing off"
                );
                let _ = record_attempt(pool, &event, attempt, &err.to_string()).await;
                sleep(backoff(attempt)).await;
            }
            Err(err) => {
                tracing::error!(
                    ?err,
                    attempts = attempt,
                    event_id = %event.event_id,
                    "webhook apply exhausted retries; parking for inspection"
                );
                let _ = park(pool, &event, attempt, &err.to_string()).await;
                return;
            }
        }
    }
}

fn backoff(attempt: i32) -> Duration {
    Duration::from_secs(1u64 << attempt.min(6) as u64)
}

/// Atomic check-and-insert on (provider, event_id). Two workers racing on the
/// same id cannot both proceed; re-delivery of a finished event is a replay.
async fn admit(pool: &PgPool, event: &GatewayEvent) -> Result<bool> {
    let payload = serde_json::to_value(event)?;
    let inserted = sqlx::query(
        r#"
        INSERT INTO billing_webhook_events (provider, event_id, entity_key, seq, status, payload)
        VALUES ($1, $2, $3, $4, 'processing', $5)
        ON CONFLICT (provider, event_id) DO NOTHING
        "#,
    )
    .bind(&event.provider)
    .bind(&event.event_id)
    .bind(event.entity_key())
    .bind(event.seq)
    .bind(payload)
    .execute(pool)
    .await?
    .rows_affected();
    if inserted > 0 {
        return Ok(true);
    }

    // An existing row still marked processing is a resumed crash, not a
    // replay; pick it back up.
    let status: Option<String> = sqlx::query_scalar(
        "SELECT status FROM billing_webhook_events WHERE provider = $1 AND event_id = $2",
    )
    .bind(&event.provider)
    .bind(&event.event_id)
    .fetch_optional(pool)
    .await?;
    Ok(status.as_deref() == Some("processing"))
}

async fn finalize(
    pool: &PgPool,
    event: &GatewayEvent,
    outcome: Outcome,
    attempts: i32,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE billing_webhook_events
        SET status = $3, attempts = $4, last_error = NULL
        WHERE provider = $1 AND event_id = $2
        "#,
    )
    .bind(&event.provider)
    .bind(&event.event_id)
    .bind(outcome.as_str())
    .bind(attempts)
    .execute(pool)
    .await?;
    Ok(())
}

async fn record_attempt(
    pool: &PgPool,
    event: &GatewayEvent,
    attempts: i32,
    error: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE billing_webhook_events
        SET attempts = $3, last_error = $4
        WHERE provider = $1 AND event_id = $2
        "#,
    )
    .bind(&event.provider)
    .bind(&event.event_id)
    .bind(attempts)
    .bind(error)
    .execute(pool)
    .await?;
    Ok(())
}

async fn park(pool: &PgPool, event: &GatewayEvent, attempts: i32, error: &str) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE billing_webhook_events
        SET status = 'parked', attempts = $3, last_error = $4
        WHERE provider = $1 AND event_id = $2
        "#,
    )
    .bind(&event.provider)
    .bind(&event.event_id)
    .bind(attempts)
    .bind(error)
    .execute(pool)
    .await?;
    Ok(())
}

/// Admission, apply, and outcome recording as one unit: the `apply(event)`
/// contract. Returns `None` when the event id was already processed, so
/// replays cannot re-run side effects. Workers wrap this with retry/backoff.
pub async fn ingest(
    pool: &PgPool,
    lifecycle: &SubscriptionLifecycleManager,
    ledger: &BillingInvoiceLedger,
    event: &GatewayEvent,
) -> Result<Option<Outcome>> {
    if !admit(pool, event).await? {
        return Ok(None);
    }
    let outcome = apply(pool, lifecycle, ledger, event).await?;
    finalize(pool, event, outcome, 1).await?;
    Ok(Some(outcome))
}

/// key: reconciler-apply -> one event against authoritative state
pub async fn apply(
    pool: &PgPool,
    lifecycle: &SubscriptionLifecycleManager,
    ledger: &BillingInvoiceLedger,
    event: &GatewayEvent,
) -> Result<Outcome> {
    match &event.kind {
        GatewayEventKind::CheckoutCompleted {
            tenant_id,
            customer_ref,
            subscription_ref,
        } => {
            let Some(subscription) = lifecycle.for_tenant(*tenant_id).await? else {
                tracing::warn!(tenant_id, event_id = %event.event_id, "checkout event without subscription row");
                return Ok(Outcome::Skipped);
            };
            if event.seq <= subscription.last_event_seq {
                return Ok(Outcome::Stale);
            }
            let plan = lifecycle.plan(subscription.plan_id).await?;
            let transition = LifecycleEvent::CheckoutCompleted {
                provider: event.provider.clone(),
                customer_ref: customer_ref.clone(),
                subscription_ref: subscription_ref.clone(),
                trial_days: plan.trial_days,
            };
            transition_and_advance(pool, lifecycle, &subscription, &transition, event.seq).await
        }
        GatewayEventKind::SubscriptionPaid {
            subscription_ref,
            period_end,
            invoice,
        } => {
            let Some(subscription) = lifecycle
                .by_provider_subscription_ref(&event.provider, subscription_ref)
                .await?
            else {
                tracing::warn!(%subscription_ref, event_id = %event.event_id, "payment event for unknown subscription");
                return Ok(Outcome::Skipped);
            };
            if event.seq <= subscription.last_event_seq {
                return Ok(Outcome::Stale);
            }
            let transition = match subscription.status() {
                SubscriptionStatus::Trialing => LifecycleEvent::TrialConverted {
                    period_end: *period_end,
                },
                SubscriptionStatus::Active => LifecycleEvent::RenewalSucceeded {
                    period_end: *period_end,
                },
                SubscriptionStatus::PastDue => LifecycleEvent::PaymentRecovered {
                    period_end: *period_end,
                },
                other => {
                    tracing::warn!(
                        subscription = %subscription.id,
                        status = other.as_str(),
                        event_id = %event.event_id,
                        "payment event in non-payable status rejected"
                    );
                    return Ok(Outcome::Skipped);
                }
            };
            let outcome =
                transition_and_advance(pool, lifecycle, &subscription, &transition, event.seq)
                    .await?;
            if outcome == Outcome::Applied {
                if let Some(draft) = invoice {
                    let paid_at = Utc
                        .timestamp_opt(event.seq, 0)
                        .single()
                        .unwrap_or_else(Utc::now);
                    ledger.record(subscription.id, draft, Some(paid_at)).await?;
                }
            }
            Ok(outcome)
        }
        GatewayEventKind::SubscriptionPaymentFailed {
            subscription_ref,
            error,
        } => {
            let Some(subscription) = lifecycle
                .by_provider_subscription_ref(&event.provider, subscription_ref)
                .await?
            else {
                tracing::warn!(%subscription_ref, event_id = %event.event_id, "failure event for unknown subscription");
                return Ok(Outcome::Skipped);
            };
            if event.seq <= subscription.last_event_seq {
                return Ok(Outcome::Stale);
            }
            let transition = LifecycleEvent::PaymentFailed {
                error: error.clone(),
            };
            transition_and_advance(pool, lifecycle, &subscription, &transition, event.seq).await
        }
        GatewayEventKind::SubscriptionEnded { subscription_ref } => {
            let Some(subscription) = lifecycle
                .by_provider_subscription_ref(&event.provider, subscription_ref)
                .await?
            else {
                tracing::warn!(%subscription_ref, event_id = %event.event_id, "end event for unknown subscription");
                return Ok(Outcome::Skipped);
            };
            if event.seq <= subscription.last_event_seq {
                return Ok(Outcome::Stale);
            }
            let transition = match subscription.status() {
                SubscriptionStatus::Trialing => LifecycleEvent::TrialExpired,
                SubscriptionStatus::PastDue => LifecycleEvent::GraceExhausted,
                other => {
                    tracing::warn!(
                        subscription = %subscription.id,
                        status = other.as_str(),
                        event_id = %event.event_id,
                        "provider end event in unexpected status rejected"
                    );
                    return Ok(Outcome::Skipped);
                }
            };
            transition_and_advance(pool, lifecycle, &subscription, &transition, event.seq).await
        }
        GatewayEventKind::SubscriptionSynced {
            subscription_ref,
            payment_method_ref,
            cancel_at_period_end,
        } => {
            let Some(subscription) = lifecycle
                .by_provider_subscription_ref(&event.provider, subscription_ref)
                .await?
            else {
                return Ok(Outcome::Skipped);
            };
            if event.seq <= subscription.last_event_seq {
                return Ok(Outcome::Stale);
            }
            sqlx::query(
                r#"
                UPDATE subscriptions
                SET provider_payment_method_ref = COALESCE($2, provider_payment_method_ref),
                    cancel_at_period_end = COALESCE($3, cancel_at_period_end),
                    last_event_seq = $4,
                    updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(subscription.id)
            .bind(payment_method_ref.as_deref())
            .bind(*cancel_at_period_end)
            .bind(event.seq)
            .execute(pool)
            .await?;
            Ok(Outcome::Applied)
        }
        GatewayEventKind::BookingPaymentSucceeded {
            booking_id,
            amount_cents,
        } => apply_booking_payment(pool, *booking_id, *amount_cents, event.seq).await,
        GatewayEventKind::Unknown { event_type } => {
            tracing::info!(
                provider = %event.provider,
                event_id = %event.event_id,
                event_type = %event_type,
                "unhandled webhook event discarded"
            );
            Ok(Outcome::Skipped)
        }
    }
}

/// Runs the table transition and advances the per-entity sequence high-water
/// mark. A rejected transition is an anomaly (skip), not a retryable failure.
async fn transition_and_advance(
    pool: &PgPool,
    lifecycle: &SubscriptionLifecycleManager,
    subscription: &Subscription,
    transition: &LifecycleEvent,
    seq: i64,
) -> Result<Outcome> {
    match lifecycle
        .execute_transition(subscription, transition, Utc::now())
        .await
    {
        Ok(Some(updated)) => {
            sqlx::query("UPDATE subscriptions SET last_event_seq = $2 WHERE id = $1")
                .bind(updated.id)
                .bind(seq)
                .execute(pool)
                .await?;
            Ok(Outcome::Applied)
        }
        Ok(None) => Ok(Outcome::Skipped),
        Err(AppError::Validation(_)) => Ok(Outcome::Skipped),
        Err(err) => Err(err.into()),
    }
}

async fn apply_booking_payment(
    pool: &PgPool,
    booking_id: Uuid,
    amount_cents: i64,
    seq: i64,
) -> Result<Outcome> {
    let Some(booking) =
        sqlx::query_as::<_, Booking>("SELECT * FROM bookings WHERE id = $1")
            .bind(booking_id)
            .fetch_optional(pool)
            .await?
    else {
        tracing::warn!(%booking_id, "payment event for unknown booking");
        return Ok(Outcome::Skipped);
    };
    if seq <= booking.last_event_seq {
        return Ok(Outcome::Stale);
    }
    if booking.payment_status == "paid" {
        return Ok(Outcome::Skipped);
    }

    let deposit_only = match booking.deposit_cents {
        Some(deposit) if !booking.deposit_paid => amount_cents == deposit,
        _ => false,
    };

    let config = tenants::fetch_payment_config(pool, booking.tenant_id).await?;
    let confirm = config.auto_confirm_bookings && booking.status == "pending";

    let updated = if deposit_only {
        sqlx::query_as::<_, Booking>(
            r#"
            UPDATE bookings
            SET deposit_paid = TRUE,
                status = CASE WHEN $3 THEN 'confirmed' ELSE status END,
                last_event_seq = $2,
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(booking.id)
        .bind(seq)
        .bind(confirm)
        .fetch_one(pool)
        .await?
    } else {
        sqlx::query_as::<_, Booking>(
            r#"
            UPDATE bookings
            SET payment_status = 'paid',
                deposit_paid = CASE WHEN deposit_cents IS NOT NULL THEN TRUE ELSE deposit_paid END,
                status = CASE WHEN $3 THEN 'confirmed' ELSE status END,
                last_event_seq = $2,
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(booking.id)
        .bind(seq)
        .bind(confirm)
        .fetch_one(pool)
        .await?
    };

    tracing::info!(
        booking = %updated.id,
        deposit_only,
        confirmed = confirm,
        "booking payment reconciled"
    );
    notify::booking_payment_confirmed(&updated);
    Ok(Outcome::Applied)
}

pub async fn list_events(
    pool: &PgPool,
    status: Option<&str>,
    limit: i64,
) -> Result<Vec<WebhookEventRecord>, sqlx::Error> {
    match status {
        Some(status) => {
            sqlx::query_as::<_, WebhookEventRecord>(
                r#"
                SELECT id, provider, event_id, entity_key, seq, status, attempts, last_error, received_at
                FROM billing_webhook_events
                WHERE status = $1
                ORDER BY id DESC
                LIMIT $2
                "#,
            )
            .bind(status)
            .bind(limit)
            .fetch_all(pool)
            .await
        }
        None => {
            sqlx::query_as::<_, WebhookEventRecord>(
                r#"
                SELECT id, provider, event_id, entity_key, seq, status, attempts, last_error, received_at
                FROM billing_webhook_events
                ORDER BY id DESC
                LIMIT $1
                "#,
            )
            .bind(limit)
            .fetch_all(pool)
            .await
        }
    }
}
