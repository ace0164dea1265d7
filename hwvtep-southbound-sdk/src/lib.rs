mod identity;
mod model;
mod options;
mod ownership;
mod retry;
mod store;
mod transaction;
mod transport;
mod version;

/// Internal re-exports so downstream crates agree on versions.
pub mod export {
    pub use serde_json;
    pub use uuid;
}

pub use hwvtep_southbound_error::{ParseError, SouthboundError, SouthboundResult};
pub use identity::{ConnectionInfo, DeviceIdentity, HWVTEP_URI_PREFIX};
pub use model::{
    Authority, DatabaseSchema, DeviceChange, DeviceOperation, DeviceUpdate, EntityData,
    EntityKey, EntityKind, LocalUcastMac, LogicalSwitch, OperationKind, OperationResult, Origin,
    RemoteMcastMac, RemoteUcastMac, TerminationPoint, HARDWARE_VTEP, VERSIONED_COLUMNS,
    VXLAN_OVER_IPV4,
};
pub use options::SouthboundOptions;
pub use ownership::{OwnershipChange, OwnershipDecision, OwnershipService};
pub use retry::{build_exponential_backoff, RetryPolicy};
pub use store::{
    ChangeType, DataStore, DeviceSubtree, StoreChange, StoreSubscription, StoreTransaction,
    StoreWrite,
};
pub use transaction::{
    Direction, PendingTransaction, RecordOutcome, TransactionOutcome, TransactionRecord,
    TransactionRequest,
};
pub use transport::{DeviceClient, DeviceTransport};
pub use version::{Version, NULL_VERSION_STRING};
