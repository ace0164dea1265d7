use crate::{
    identity::ConnectionInfo,
    model::{DatabaseSchema, DeviceOperation, DeviceUpdate, EntityData, OperationResult},
};
use async_trait::async_trait;
use hwvtep_southbound_error::SouthboundResult;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Opens management connections to devices.
#[async_trait]
pub trait DeviceTransport: Send + Sync {
    async fn connect(&self, info: &ConnectionInfo) -> SouthboundResult<Arc<dyn DeviceClient>>;
}

/// One live management session with a device.
///
/// # Error contract
/// - `Err(Transport | Timeout)` means the session is unusable; callers stop
///   using this client.
/// - A device-level rejection is reported inside the returned
///   [`OperationResult`] list, never as `Err`.
#[async_trait]
pub trait DeviceClient: Send + Sync {
    fn connection_info(&self) -> ConnectionInfo;

    /// Fetch the schema of `database` (e.g. `hardware_vtep`).
    async fn get_schema(&self, database: &str) -> SouthboundResult<DatabaseSchema>;

    /// Execute `operations` atomically. Returns one result per operation, in order.
    async fn transact(
        &self,
        schema: &DatabaseSchema,
        operations: &[DeviceOperation],
    ) -> SouthboundResult<Vec<OperationResult>>;

    /// Full snapshot of the rows this core manages.
    async fn dump(&self, schema: &DatabaseSchema) -> SouthboundResult<Vec<EntityData>>;

    fn is_active(&self) -> bool;

    /// Hand the asynchronous update stream to a new holder. A previously
    /// taken stream ends; every stream ends when the session is lost.
    /// `None` when the session cannot report updates.
    fn take_updates(&self) -> Option<mpsc::UnboundedReceiver<DeviceUpdate>>;

    async fn disconnect(&self);
}
