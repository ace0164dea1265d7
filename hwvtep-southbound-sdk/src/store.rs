use crate::{
    identity::DeviceIdentity,
    model::{EntityData, EntityKey, Origin},
};
use async_trait::async_trait;
use hwvtep_southbound_error::SouthboundResult;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::mpsc;

/// Snapshot of one device subtree in the operational store.
pub type DeviceSubtree = BTreeMap<EntityKey, EntityData>;

/// Ordered stream of committed change batches.
pub type StoreSubscription = mpsc::UnboundedReceiver<Vec<StoreChange>>;

/// One write inside a [`StoreTransaction`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreWrite {
    /// Replace the entity entirely.
    Put {
        device: DeviceIdentity,
        data: EntityData,
    },
    /// Overlay present fields onto the existing entity, creating it if absent.
    Merge {
        device: DeviceIdentity,
        data: EntityData,
    },
    Delete {
        device: DeviceIdentity,
        key: EntityKey,
    },
}

impl StoreWrite {
    #[inline]
    pub fn device(&self) -> &DeviceIdentity {
        match self {
            StoreWrite::Put { device, .. }
            | StoreWrite::Merge { device, .. }
            | StoreWrite::Delete { device, .. } => device,
        }
    }

    pub fn key(&self) -> EntityKey {
        match self {
            StoreWrite::Put { data, .. } | StoreWrite::Merge { data, .. } => data.key(),
            StoreWrite::Delete { key, .. } => key.clone(),
        }
    }
}

/// Atomic group of writes tagged with the side that produced them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreTransaction {
    pub origin: Origin,
    pub writes: Vec<StoreWrite>,
}

impl StoreTransaction {
    #[inline]
    pub fn new(origin: Origin) -> Self {
        Self {
            origin,
            writes: Vec::new(),
        }
    }

    pub fn put(&mut self, device: &DeviceIdentity, data: EntityData) -> &mut Self {
        self.writes.push(StoreWrite::Put {
            device: device.clone(),
            data,
        });
        self
    }

    pub fn merge(&mut self, device: &DeviceIdentity, data: EntityData) -> &mut Self {
        self.writes.push(StoreWrite::Merge {
            device: device.clone(),
            data,
        });
        self
    }

    pub fn delete(&mut self, device: &DeviceIdentity, key: EntityKey) -> &mut Self {
        self.writes.push(StoreWrite::Delete {
            device: device.clone(),
            key,
        });
        self
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.writes.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    Created,
    Updated,
    Deleted,
    Unchanged,
}

/// A committed change to one entity, with before/after snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreChange {
    pub device: DeviceIdentity,
    pub key: EntityKey,
    pub before: Option<EntityData>,
    pub after: Option<EntityData>,
    pub origin: Origin,
}

impl StoreChange {
    pub fn change_type(&self) -> ChangeType {
        match (&self.before, &self.after) {
            (None, Some(_)) => ChangeType::Created,
            (Some(_), None) => ChangeType::Deleted,
            (Some(b), Some(a)) if b != a => ChangeType::Updated,
            _ => ChangeType::Unchanged,
        }
    }
}

/// Operational data store holding controller intent and device state.
///
/// Implementations must deliver change batches to every subscriber in commit
/// order, and tag each change with the origin of the transaction that caused
/// it. Writes are applied atomically per [`StoreTransaction`].
#[async_trait]
pub trait DataStore: Send + Sync {
    /// Current subtree of one device. Missing devices read as empty.
    async fn read(&self, device: &DeviceIdentity) -> SouthboundResult<DeviceSubtree>;

    /// Apply all writes or none.
    async fn commit(&self, transaction: StoreTransaction) -> SouthboundResult<()>;

    /// Receive every batch committed after this call.
    fn subscribe(&self) -> StoreSubscription;
}
