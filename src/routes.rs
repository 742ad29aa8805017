use axum::{
    routing::{get, post},
    Router,
};

use crate::{billing, bookings, webhooks};

pub fn api_routes() -> Router {
    Router::new()
        .route("/api/bookings/:id/payment", get(bookings::booking_payment))
        .route("/api/bookings/:id/pay", post(bookings::pay_booking))
        .route("/api/billing/plans", get(billing::api::list_plans))
        .route(
            "/api/billing/subscription",
            get(billing::api::get_subscription).delete(billing::api::cancel_subscription),
        )
        .route(
            "/api/billing/subscription/resume",
            post(billing::api::resume_subscription),
        )
        .route(
            "/api/billing/checkout-session",
            post(billing::api::create_checkout_session),
        )
        .route(
            "/api/billing/portal-session",
            post(billing::api::create_portal_session),
        )
        .route("/api/billing/invoices", get(billing::api::list_invoices))
        .route(
            "/api/admin/subscriptions",
            get(billing::api::admin_list_subscriptions),
        )
        .route(
            "/api/admin/webhook-events",
            get(billing::api::admin_list_webhook_events),
        )
        .route("/api/webhooks/:provider", post(webhooks::provider_webhook))
}
