pub mod billing;
pub mod bookings;
pub mod config;
pub mod error;
pub mod extractor;
pub mod notify;
pub mod routes;
pub mod tenants;
pub mod webhooks;
