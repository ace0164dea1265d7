//! Southbound core for hardware_vtep devices.
//!
//! - [`ConnectionManager`]: one owned connection per device, ownership
//!   hand-off, transport supervision.
//! - [`DeviceConnectionInstance`]: per-connection lifecycle and first-update
//!   reconciliation.
//! - [`TransactionInvoker`]: ordered, single-in-flight device writes.
//! - [`DataChangeReconciler`]: store deltas to device transactions, with
//!   device-originated echoes suppressed.
//! - [`TransactionHistory`]: bounded audit log.
mod history;
mod instance;
mod invoker;
mod lifecycle;
mod manager;
mod reconciler;
mod runtime;

pub use history::TransactionHistory;
pub use instance::{
    plan_first_update, ConnectionState, DeviceConnectionInstance, ReconcilePlan,
    ReconciliationState,
};
pub use invoker::{InvokerConfig, InvokerState, TransactionInvoker};
pub use lifecycle::{start_with_policy, StartPolicy};
pub use manager::ConnectionManager;
pub use reconciler::{translate, DataChangeReconciler, ReconcilerStats};
pub use runtime::SouthboundRuntime;
