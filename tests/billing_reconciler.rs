use chrono::{Duration, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use backend::billing::gateway::InvoiceDraft;
use backend::billing::reconciler::{self, Outcome};
use backend::billing::{
    BillingInvoiceLedger, GatewayEvent, GatewayEventKind, SubscriptionLifecycleManager,
};

// key: reconciler-tests -> idempotency, ordering tolerance, booking payments

async fn seed_tenant(pool: &PgPool) -> i32 {
    sqlx::query_scalar("INSERT INTO tenants (name, contact_email) VALUES ($1, $2) RETURNING id")
        .bind("Clipper & Co")
        .bind("owner@clipper.example")
        .fetch_one(pool)
        .await
        .unwrap()
}

async fn seed_config(pool: &PgPool, tenant_id: i32, auto_confirm: bool) {
    sqlx::query(
        "INSERT INTO tenant_payment_configs (tenant_id, enabled_gateways, accept_cash, auto_confirm_bookings) VALUES ($1, $2, TRUE, $3)",
    )
    .bind(tenant_id)
    .bind(vec!["stripe".to_string(), "payu".to_string()])
    .bind(auto_confirm)
    .execute(pool)
    .await
    .unwrap();
}

async fn seed_plan(pool: &PgPool, trial_days: i32) -> Uuid {
    let plan_id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO subscription_plans (id, code, name, amount_cents, trial_days) VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(plan_id)
    .bind(format!("plan-{plan_id}"))
    .bind("Pro Plan")
    .bind(4900_i64)
    .bind(trial_days)
    .execute(pool)
    .await
    .unwrap();
    plan_id
}

async fn seed_subscription(
    pool: &PgPool,
    tenant_id: i32,
    plan_id: Uuid,
    status: &str,
    subscription_ref: &str,
) -> Uuid {
    let id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO subscriptions (id, tenant_id, plan_id, status, provider, provider_customer_ref, provider_subscription_ref, current_period_start)
        VALUES ($1, $2, $3, $4, 'stripe', 'cus_test', $5, NOW())
        "#,
    )
    .bind(id)
    .bind(tenant_id)
    .bind(plan_id)
    .bind(status)
    .bind(subscription_ref)
    .execute(pool)
    .await
    .unwrap();
    id
}

async fn seed_booking(
    pool: &PgPool,
    tenant_id: i32,
    total_cents: i64,
    deposit_cents: Option<i64>,
) -> Uuid {
    let id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO bookings (id, tenant_id, customer_email, service_name, start_time, total_price_cents, deposit_cents)
        VALUES ($1, $2, 'guest@example.com', 'Haircut', $3, $4, $5)
        "#,
    )
    .bind(id)
    .bind(tenant_id)
    .bind(Utc::now() + Duration::days(2))
    .bind(total_cents)
    .bind(deposit_cents)
    .execute(pool)
    .await
    .unwrap();
    id
}

fn paid_event(event_id: &str, seq: i64, subscription_ref: &str) -> GatewayEvent {
    GatewayEvent {
        provider: "stripe".to_string(),
        event_id: event_id.to_string(),
        seq,
        kind: GatewayEventKind::SubscriptionPaid {
            subscription_ref: subscription_ref.to_string(),
            period_end: Some(Utc::now() + Duration::days(30)),
            invoice: Some(InvoiceDraft {
                provider_invoice_ref: format!("in_{event_id}"),
                amount_cents: 4900,
                currency: "usd".to_string(),
                document_url: None,
            }),
        },
    }
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn same_event_id_applies_exactly_once(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let tenant_id = seed_tenant(&pool).await;
    let plan_id = seed_plan(&pool, 0).await;
    let sub_id = seed_subscription(&pool, tenant_id, plan_id, "active", "sub_idem").await;

    let lifecycle = SubscriptionLifecycleManager::new(pool.clone());
    let ledger = BillingInvoiceLedger::new(pool.clone());
    let event = paid_event("evt_idem", 10, "sub_idem");

    let first = reconciler::ingest(&pool, &lifecycle, &ledger, &event)
        .await
        .unwrap();
    assert_eq!(first, Some(Outcome::Applied));

    let second = reconciler::ingest(&pool, &lifecycle, &ledger, &event)
        .await
        .unwrap();
    assert_eq!(second, None, "replay must short-circuit");

    let (status, seq): (String, i64) =
        sqlx::query_as("SELECT status, last_event_seq FROM subscriptions WHERE id = $1")
            .bind(sub_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(status, "active");
    assert_eq!(seq, 10);

    let invoices: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM invoices WHERE subscription_id = $1")
            .bind(sub_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(invoices, 1, "replay must not duplicate the invoice");
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn out_of_order_failure_is_discarded_as_stale(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let tenant_id = seed_tenant(&pool).await;
    let plan_id = seed_plan(&pool, 0).await;
    let sub_id = seed_subscription(&pool, tenant_id, plan_id, "active", "sub_ooo").await;

    let lifecycle = SubscriptionLifecycleManager::new(pool.clone());
    let ledger = BillingInvoiceLedger::new(pool.clone());

    // seq=7 (payment succeeded) delivered before seq=5 (payment failed).
    let succeeded = paid_event("evt_seq7", 7, "sub_ooo");
    let failed = GatewayEvent {
        provider: "stripe".to_string(),
        event_id: "evt_seq5".to_string(),
        seq: 5,
        kind: GatewayEventKind::SubscriptionPaymentFailed {
            subscription_ref: "sub_ooo".to_string(),
            error: "card declined".to_string(),
        },
    };

    let first = reconciler::ingest(&pool, &lifecycle, &ledger, &succeeded)
        .await
        .unwrap();
    assert_eq!(first, Some(Outcome::Applied));

    let second = reconciler::ingest(&pool, &lifecycle, &ledger, &failed)
        .await
        .unwrap();
    assert_eq!(second, Some(Outcome::Stale));

    let status: String = sqlx::query_scalar("SELECT status FROM subscriptions WHERE id = $1")
        .bind(sub_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(status, "active", "stale failure must not regress the status");
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn in_order_failure_then_recovery(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let tenant_id = seed_tenant(&pool).await;
    let plan_id = seed_plan(&pool, 0).await;
    let sub_id = seed_subscription(&pool, tenant_id, plan_id, "active", "sub_rec").await;

    let lifecycle = SubscriptionLifecycleManager::new(pool.clone());
    let ledger = BillingInvoiceLedger::new(pool.clone());

    let failed = GatewayEvent {
        provider: "stripe".to_string(),
        event_id: "evt_fail".to_string(),
        seq: 5,
        kind: GatewayEventKind::SubscriptionPaymentFailed {
            subscription_ref: "sub_rec".to_string(),
            error: "card declined".to_string(),
        },
    };
    reconciler::ingest(&pool, &lifecycle, &ledger, &failed)
        .await
        .unwrap();

    let (status, error): (String, Option<String>) =
        sqlx::query_as("SELECT status, last_payment_error FROM subscriptions WHERE id = $1")
            .bind(sub_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(status, "past_due");
    assert_eq!(error.as_deref(), Some("card declined"));

    let recovered = paid_event("evt_recover", 7, "sub_rec");
    let outcome = reconciler::ingest(&pool, &lifecycle, &ledger, &recovered)
        .await
        .unwrap();
    assert_eq!(outcome, Some(Outcome::Applied));

    let status: String = sqlx::query_scalar("SELECT status FROM subscriptions WHERE id = $1")
        .bind(sub_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(status, "active");
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn checkout_confirmation_grants_trial(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let tenant_id = seed_tenant(&pool).await;
    let plan_id = seed_plan(&pool, 14).await;
    let sub_id = sqlx::query_scalar::<_, Uuid>(
        r#"
        INSERT INTO subscriptions (id, tenant_id, plan_id, status, provider, current_period_start)
        VALUES ($1, $2, $3, 'incomplete', 'stripe', NOW())
        RETURNING id
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(tenant_id)
    .bind(plan_id)
    .fetch_one(&pool)
    .await
    .unwrap();

    let lifecycle = SubscriptionLifecycleManager::new(pool.clone());
    let ledger = BillingInvoiceLedger::new(pool.clone());
    let event = GatewayEvent {
        provider: "stripe".to_string(),
        event_id: "evt_checkout".to_string(),
        seq: 3,
        kind: GatewayEventKind::CheckoutCompleted {
            tenant_id,
            customer_ref: "cus_new".to_string(),
            subscription_ref: Some("sub_new".to_string()),
        },
    };
    let outcome = reconciler::ingest(&pool, &lifecycle, &ledger, &event)
        .await
        .unwrap();
    assert_eq!(outcome, Some(Outcome::Applied));

    let sub = lifecycle.for_tenant(tenant_id).await.unwrap().unwrap();
    assert_eq!(sub.id, sub_id);
    assert_eq!(sub.status, "trialing");
    assert!(sub.trial_end.is_some());
    assert_eq!(sub.provider_customer_ref.as_deref(), Some("cus_new"));
    assert_eq!(sub.provider_subscription_ref.as_deref(), Some("sub_new"));
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn deposit_payment_flips_deposit_only_and_auto_confirms(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let tenant_id = seed_tenant(&pool).await;
    seed_config(&pool, tenant_id, true).await;
    let booking_id = seed_booking(&pool, tenant_id, 20000, Some(5000)).await;

    let lifecycle = SubscriptionLifecycleManager::new(pool.clone());
    let ledger = BillingInvoiceLedger::new(pool.clone());
    let event = GatewayEvent {
        provider: "payu".to_string(),
        event_id: "order_1:COMPLETED".to_string(),
        seq: 4,
        kind: GatewayEventKind::BookingPaymentSucceeded {
            booking_id,
            amount_cents: 5000,
        },
    };
    let outcome = reconciler::ingest(&pool, &lifecycle, &ledger, &event)
        .await
        .unwrap();
    assert_eq!(outcome, Some(Outcome::Applied));

    let (deposit_paid, payment_status, status): (bool, String, String) = sqlx::query_as(
        "SELECT deposit_paid, payment_status, status FROM bookings WHERE id = $1",
    )
    .bind(booking_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert!(deposit_paid);
    assert_eq!(payment_status, "unpaid", "deposit alone is not full payment");
    assert_eq!(status, "confirmed", "auto-confirm policy advances pending bookings");

    // Redelivery of the same notification must not double-flip anything.
    let replay = reconciler::ingest(&pool, &lifecycle, &ledger, &event)
        .await
        .unwrap();
    assert_eq!(replay, None);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn full_payment_marks_booking_paid_without_auto_confirm(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let tenant_id = seed_tenant(&pool).await;
    seed_config(&pool, tenant_id, false).await;
    let booking_id = seed_booking(&pool, tenant_id, 20000, None).await;

    let lifecycle = SubscriptionLifecycleManager::new(pool.clone());
    let ledger = BillingInvoiceLedger::new(pool.clone());
    let event = GatewayEvent {
        provider: "stripe".to_string(),
        event_id: "evt_full".to_string(),
        seq: 8,
        kind: GatewayEventKind::BookingPaymentSucceeded {
            booking_id,
            amount_cents: 20000,
        },
    };
    reconciler::ingest(&pool, &lifecycle, &ledger, &event)
        .await
        .unwrap();

    let (payment_status, status): (String, String) =
        sqlx::query_as("SELECT payment_status, status FROM bookings WHERE id = $1")
            .bind(booking_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(payment_status, "paid");
    assert_eq!(status, "pending", "auto-confirm disabled leaves status alone");
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn unknown_and_unmatched_events_are_discarded_not_fatal(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let lifecycle = SubscriptionLifecycleManager::new(pool.clone());
    let ledger = BillingInvoiceLedger::new(pool.clone());

    let unknown = GatewayEvent {
        provider: "stripe".to_string(),
        event_id: "evt_unknown".to_string(),
        seq: 1,
        kind: GatewayEventKind::Unknown {
            event_type: "charge.refunded".to_string(),
        },
    };
    let outcome = reconciler::ingest(&pool, &lifecycle, &ledger, &unknown)
        .await
        .unwrap();
    assert_eq!(outcome, Some(Outcome::Skipped));

    let unmatched = paid_event("evt_nobody", 2, "sub_missing");
    let outcome = reconciler::ingest(&pool, &lifecycle, &ledger, &unmatched)
        .await
        .unwrap();
    assert_eq!(outcome, Some(Outcome::Skipped));
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn provider_end_event_cancels_exhausted_trial(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let tenant_id = seed_tenant(&pool).await;
    let plan_id = seed_plan(&pool, 14).await;
    let sub_id = seed_subscription(&pool, tenant_id, plan_id, "trialing", "sub_trial").await;

    let lifecycle = SubscriptionLifecycleManager::new(pool.clone());
    let ledger = BillingInvoiceLedger::new(pool.clone());
    let event = GatewayEvent {
        provider: "stripe".to_string(),
        event_id: "evt_ended".to_string(),
        seq: 12,
        kind: GatewayEventKind::SubscriptionEnded {
            subscription_ref: "sub_trial".to_string(),
        },
    };
    let outcome = reconciler::ingest(&pool, &lifecycle, &ledger, &event)
        .await
        .unwrap();
    assert_eq!(outcome, Some(Outcome::Applied));

    let status: String = sqlx::query_scalar("SELECT status FROM subscriptions WHERE id = $1")
        .bind(sub_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(status, "cancelled");
}
