use crate::identity::DeviceIdentity;
use async_trait::async_trait;
use hwvtep_southbound_error::SouthboundResult;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OwnershipDecision {
    Granted,
    Denied,
}

impl OwnershipDecision {
    #[inline]
    pub fn is_granted(&self) -> bool {
        matches!(self, OwnershipDecision::Granted)
    }
}

/// Notification that this process gained or lost a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnershipChange {
    pub device: DeviceIdentity,
    pub owned: bool,
}

/// Cluster-wide single-writer arbitration.
///
/// At any instant at most one process may hold ownership of a device. A
/// holder learns about revocation through [`OwnershipService::subscribe`] and
/// must stop writing as soon as it is notified.
#[async_trait]
pub trait OwnershipService: Send + Sync {
    /// Ask for exclusive ownership of `device`.
    async fn request_ownership(&self, device: &DeviceIdentity)
        -> SouthboundResult<OwnershipDecision>;

    /// Give up ownership; a no-op when not held.
    async fn release_ownership(&self, device: &DeviceIdentity) -> SouthboundResult<()>;

    /// Grant and revocation notifications for this process, in order.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<OwnershipChange>;
}
