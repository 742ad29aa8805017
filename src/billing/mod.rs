pub mod api;
pub mod gateway;
pub mod gateways;
pub mod ledger;
pub mod lifecycle;
pub mod models;
pub mod reconciler;
pub mod resolver;
pub mod scheduler;

pub use gateway::{GatewayAdapter, GatewayError, GatewayEvent, GatewayEventKind, GatewayRegistry};
pub use ledger::BillingInvoiceLedger;
pub use lifecycle::{LifecycleEvent, SubscriptionLifecycleManager, TransitionRejected};
pub use models::{Invoice, Subscription, SubscriptionPlan, SubscriptionStatus};
pub use reconciler::{start_reconciler_pool, ReconcilerHandle};
pub use scheduler::{process_tick as run_billing_sweep_tick, spawn as spawn_billing_sweep};
