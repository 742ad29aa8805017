use std::sync::Arc;

use httpmock::prelude::*;
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use backend::billing::gateway::outbound_client;
use backend::billing::gateways::stripe::StripeGateway;
use backend::billing::{GatewayAdapter, SubscriptionLifecycleManager};
use backend::tenants::Tenant;

// key: lifecycle-tests -> checkout bootstrap and user intents

async fn seed_tenant(pool: &PgPool) -> Tenant {
    sqlx::query_as::<_, Tenant>(
        "INSERT INTO tenants (name, contact_email) VALUES ($1, $2) RETURNING *",
    )
    .bind("Lifecycle Spa")
    .bind("owner@spa.example")
    .fetch_one(pool)
    .await
    .unwrap()
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

fn mock_gateway(server: &MockServer) -> Arc<dyn GatewayAdapter> {
    Arc::new(StripeGateway::new(
        "sk_test_abc",
        "whsec_x",
        server.base_url(),
        outbound_client(),
    ))
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn start_checkout_parks_subscription_incomplete(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let server = MockServer::start_async().await;
    server.mock(|when, then| {
        when.method(POST).path("/v1/checkout/sessions");
        then.status(200).json_body(json!({
            "id": "cs_1",
            "url": "https://checkout.stripe.example/cs_1"
        }));
    });

    let tenant = seed_tenant(&pool).await;
    let plan_id = seed_plan(&pool, 14).await;
    let lifecycle = SubscriptionLifecycleManager::new(pool.clone());
    let plan = lifecycle.plan(plan_id).await.unwrap();

    let session = lifecycle
        .start_checkout(&tenant, &plan, mock_gateway(&server), &tenant.contact_email)
        .await
        .unwrap();
    assert_eq!(session.redirect_url, "https://checkout.stripe.example/cs_1");

    let sub = lifecycle.for_tenant(tenant.id).await.unwrap().unwrap();
    assert_eq!(sub.status, "incomplete");
    assert_eq!(sub.provider.as_deref(), Some("stripe"));
    assert!(sub.provider_subscription_ref.is_none());
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn checkout_rejected_while_subscription_grants_access(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let server = MockServer::start_async().await;
    let tenant = seed_tenant(&pool).await;
    let plan_id = seed_plan(&pool, 0).await;

    sqlx::query(
        "INSERT INTO subscriptions (id, tenant_id, plan_id, status, provider, current_period_start) VALUES ($1, $2, $3, 'active', 'stripe', NOW())",
    )
    .bind(Uuid::new_v4())
    .bind(tenant.id)
    .bind(plan_id)
    .execute(&pool)
    .await
    .unwrap();

    let lifecycle = SubscriptionLifecycleManager::new(pool.clone());
    let plan = lifecycle.plan(plan_id).await.unwrap();
    let err = lifecycle
        .start_checkout(&tenant, &plan, mock_gateway(&server), &tenant.contact_email)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("already exists"));
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn cancelled_subscription_restarts_as_new_lifecycle(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let server = MockServer::start_async().await;
    server.mock(|when, then| {
        when.method(POST).path("/v1/checkout/sessions");
        then.status(200).json_body(json!({
            "id": "cs_2",
            "url": "https://checkout.stripe.example/cs_2"
        }));
    });

    let tenant = seed_tenant(&pool).await;
    let plan_id = seed_plan(&pool, 0).await;
    sqlx::query(
        r#"
        INSERT INTO subscriptions (
            id, tenant_id, plan_id, status, provider, current_period_start,
            cancel_at_period_end, provider_customer_ref, provider_subscription_ref, last_event_seq
        ) VALUES ($1, $2, $3, 'cancelled', 'stripe', NOW(), TRUE, 'cus_old', 'sub_old', 40)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(tenant.id)
    .bind(plan_id)
    .execute(&pool)
    .await
    .unwrap();

    let lifecycle = SubscriptionLifecycleManager::new(pool.clone());
    let plan = lifecycle.plan(plan_id).await.unwrap();
    lifecycle
        .start_checkout(&tenant, &plan, mock_gateway(&server), &tenant.contact_email)
        .await
        .unwrap();

    let sub = lifecycle.for_tenant(tenant.id).await.unwrap().unwrap();
    assert_eq!(sub.status, "incomplete");
    assert!(!sub.cancel_at_period_end);
    assert!(sub.provider_customer_ref.is_none());
    assert_eq!(
        sub.last_event_seq, 40,
        "sequence high-water mark survives so old events stay stale"
    );
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn request_cancel_flips_flag_without_touching_status(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let server = MockServer::start_async().await;
    let provider_mock = server.mock(|when, then| {
        when.method(POST)
            .path("/v1/subscriptions/sub_live")
            .body_contains("cancel_at_period_end=true");
        then.status(200).json_body(json!({"id": "sub_live"}));
    });

    let tenant = seed_tenant(&pool).await;
    let plan_id = seed_plan(&pool, 0).await;
    sqlx::query(
        r#"
        INSERT INTO subscriptions (id, tenant_id, plan_id, status, provider, current_period_start, provider_subscription_ref)
        VALUES ($1, $2, $3, 'active', 'stripe', NOW(), 'sub_live')
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(tenant.id)
    .bind(plan_id)
    .execute(&pool)
    .await
    .unwrap();

    let lifecycle = SubscriptionLifecycleManager::new(pool.clone());
    let updated = lifecycle
        .request_cancel(tenant.id, mock_gateway(&server))
        .await
        .unwrap();
    provider_mock.assert();
    assert_eq!(updated.status, "active");
    assert!(updated.cancel_at_period_end);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn request_resume_clears_pending_cancellation(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let server = MockServer::start_async().await;
    server.mock(|when, then| {
        when.method(POST)
            .path("/v1/subscriptions/sub_live")
            .body_contains("cancel_at_period_end=false");
        then.status(200).json_body(json!({"id": "sub_live"}));
    });

    let tenant = seed_tenant(&pool).await;
    let plan_id = seed_plan(&pool, 0).await;
    sqlx::query(
        r#"
        INSERT INTO subscriptions (id, tenant_id, plan_id, status, provider, current_period_start, provider_subscription_ref, cancel_at_period_end)
        VALUES ($1, $2, $3, 'active', 'stripe', NOW(), 'sub_live', TRUE)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(tenant.id)
    .bind(plan_id)
    .execute(&pool)
    .await
    .unwrap();

    let lifecycle = SubscriptionLifecycleManager::new(pool.clone());
    let updated = lifecycle
        .request_resume(tenant.id, mock_gateway(&server))
        .await
        .unwrap();
    assert_eq!(updated.status, "active");
    assert!(!updated.cancel_at_period_end);

    // Nothing pending any more: a second resume is rejected as input error.
    let err = lifecycle
        .request_resume(tenant.id, mock_gateway(&server))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("no pending cancellation"));
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn cancelled_subscription_accepts_no_user_intents(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let server = MockServer::start_async().await;
    let tenant = seed_tenant(&pool).await;
    let plan_id = seed_plan(&pool, 0).await;
    sqlx::query(
        "INSERT INTO subscriptions (id, tenant_id, plan_id, status, provider, current_period_start) VALUES ($1, $2, $3, 'cancelled', 'stripe', NOW())",
    )
    .bind(Uuid::new_v4())
    .bind(tenant.id)
    .bind(plan_id)
    .execute(&pool)
    .await
    .unwrap();

    let lifecycle = SubscriptionLifecycleManager::new(pool.clone());
    assert!(lifecycle
        .request_cancel(tenant.id, mock_gateway(&server))
        .await
        .is_err());
    assert!(lifecycle
        .request_resume(tenant.id, mock_gateway(&server))
        .await
        .is_err());
}
