#![allow(dead_code)]

use async_trait::async_trait;
use hwvtep_southbound_sdk::{
    ConnectionInfo, DataStore, DatabaseSchema, DeviceChange, DeviceClient, DeviceIdentity,
    DeviceOperation, DeviceSubtree, DeviceTransport, DeviceUpdate, EntityData, EntityKey,
    LogicalSwitch, OperationKind, OperationResult, OwnershipChange, OwnershipDecision,
    OwnershipService, RemoteUcastMac, RetryPolicy, SouthboundError, SouthboundOptions,
    SouthboundResult, StoreChange, StoreSubscription, StoreTransaction, StoreWrite,
    TerminationPoint, HARDWARE_VTEP,
};
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    future::Future,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
        Arc, Mutex, Once,
    },
    time::Duration,
};
use tokio::sync::{mpsc, watch};
use tracing::Level;

static INIT_TRACING: Once = Once::new();

pub fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(Level::DEBUG)
            .with_target(false)
            .without_time()
            .with_test_writer()
            .try_init();
    });
}

/// Options with short timeouts so failure paths finish quickly.
pub fn fast_options() -> SouthboundOptions {
    SouthboundOptions {
        history_capacity: 64,
        history_log_threshold: 16,
        reconcile_timeout: 2_000,
        transact_timeout: 500,
        ownership_timeout: 500,
        reconcile_retry: RetryPolicy::fixed(2, 20),
    }
}

pub fn device_info(last_octet: u8) -> ConnectionInfo {
    ConnectionInfo::new(format!("10.0.0.{last_octet}").parse().unwrap(), 6640)
}

/// Poll `cond` until it holds or `timeout` elapses.
pub async fn eventually<F>(timeout: Duration, mut cond: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub async fn within<T>(fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .expect("operation did not finish in time")
}

// ============================================================================
// Entities
// ============================================================================

pub fn ls(name: &str) -> EntityData {
    EntityData::LogicalSwitch(LogicalSwitch {
        name: name.into(),
        tunnel_key: None,
        description: None,
        replication_mode: None,
    })
}

pub fn ls_with_key(name: &str, tunnel_key: u32) -> EntityData {
    EntityData::LogicalSwitch(LogicalSwitch {
        name: name.into(),
        tunnel_key: Some(tunnel_key),
        description: None,
        replication_mode: None,
    })
}

pub fn tp(ip: &str) -> EntityData {
    EntityData::TerminationPoint(TerminationPoint::vxlan(ip.parse().unwrap()))
}

pub fn ucast(mac: &str, switch: &str, ip: &str) -> EntityData {
    EntityData::RemoteUcastMac(RemoteUcastMac {
        mac: mac.into(),
        logical_switch: switch.into(),
        locator: TerminationPoint::vxlan(ip.parse().unwrap()).key().name.to_string(),
        ip: None,
    })
}

pub fn insert_ls(name: &str) -> DeviceOperation {
    DeviceOperation::insert(&ls(name)).unwrap()
}

// ============================================================================
// Data store
// ============================================================================

#[derive(Default)]
pub struct InMemoryStore {
    data: Mutex<HashMap<DeviceIdentity, DeviceSubtree>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<Vec<StoreChange>>>>,
    commits: Mutex<Vec<StoreTransaction>>,
    fail_reads: AtomicU32,
    stall_device_commits: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Preload rows without notifying subscribers.
    pub fn seed(&self, device: &DeviceIdentity, rows: Vec<EntityData>) {
        let mut data = self.data.lock().unwrap();
        let subtree = data.entry(device.clone()).or_default();
        for row in rows {
            subtree.insert(row.key(), row);
        }
    }

    pub fn get(&self, device: &DeviceIdentity, key: &EntityKey) -> Option<EntityData> {
        self.data
            .lock()
            .unwrap()
            .get(device)
            .and_then(|s| s.get(key).cloned())
    }

    pub fn commits(&self) -> Vec<StoreTransaction> {
        self.commits.lock().unwrap().clone()
    }

    pub fn fail_next_reads(&self, n: u32) {
        self.fail_reads.store(n, Ordering::SeqCst);
    }

    /// Device-originated commits never complete.
    pub fn stall_device_commits(&self) {
        self.stall_device_commits.store(true, Ordering::SeqCst);
    }

    pub async fn controller_put(&self, device: &DeviceIdentity, rows: Vec<EntityData>) {
        let mut tx = StoreTransaction::new(hwvtep_southbound_sdk::Origin::Controller);
        for row in rows {
            tx.put(device, row);
        }
        self.commit(tx).await.unwrap();
    }
}

#[async_trait]
impl DataStore for InMemoryStore {
    async fn read(&self, device: &DeviceIdentity) -> SouthboundResult<DeviceSubtree> {
        let remaining = self.fail_reads.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_reads.store(remaining - 1, Ordering::SeqCst);
            return Err(SouthboundError::Store("injected read failure".into()));
        }
        Ok(self
            .data
            .lock()
            .unwrap()
            .get(device)
            .cloned()
            .unwrap_or_default())
    }

    async fn commit(&self, transaction: StoreTransaction) -> SouthboundResult<()> {
        if transaction.origin == hwvtep_southbound_sdk::Origin::Device
            && self.stall_device_commits.load(Ordering::SeqCst)
        {
            std::future::pending::<()>().await;
        }
        let mut data = self.data.lock().unwrap();
        let mut changes = Vec::with_capacity(transaction.writes.len());
        for write in &transaction.writes {
            let device = write.device().clone();
            let key = write.key();
            let subtree = data.entry(device.clone()).or_default();
            let before = subtree.get(&key).cloned();
            let after = match write {
                StoreWrite::Put { data, .. } => Some(data.clone()),
                StoreWrite::Merge { data, .. } => Some(match &before {
                    Some(existing) => existing.merged_with(data)?,
                    None => data.clone(),
                }),
                StoreWrite::Delete { .. } => None,
            };
            match &after {
                Some(row) => subtree.insert(key.clone(), row.clone()),
                None => subtree.remove(&key),
            };
            changes.push(StoreChange {
                device,
                key,
                before,
                after,
                origin: transaction.origin,
            });
        }
        self.commits.lock().unwrap().push(transaction);
        // Notify while holding the data lock so batches keep commit order.
        self.subscribers
            .lock()
            .unwrap()
            .retain(|tx| tx.send(changes.clone()).is_ok());
        drop(data);
        Ok(())
    }

    fn subscribe(&self) -> StoreSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().unwrap().push(tx);
        rx
    }
}

// ============================================================================
// Ownership
// ============================================================================

#[derive(Default)]
pub struct FakeOwnership {
    denied: Mutex<HashSet<DeviceIdentity>>,
    owned: Mutex<HashSet<DeviceIdentity>>,
    released: Mutex<Vec<DeviceIdentity>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<OwnershipChange>>>,
    stall: AtomicBool,
    late_denials: Mutex<HashSet<DeviceIdentity>>,
}

impl FakeOwnership {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn deny(&self, device: &DeviceIdentity) {
        self.denied.lock().unwrap().insert(device.clone());
    }

    /// Never answer ownership requests.
    pub fn stall(&self) {
        self.stall.store(true, Ordering::SeqCst);
    }

    /// The next request for `device` announces a grant, then answers with a
    /// stale denial.
    pub fn grant_before_stale_denial(&self, device: &DeviceIdentity) {
        self.late_denials.lock().unwrap().insert(device.clone());
    }

    pub fn grant(&self, device: &DeviceIdentity) {
        self.denied.lock().unwrap().remove(device);
        self.owned.lock().unwrap().insert(device.clone());
        self.notify(device, true);
    }

    pub fn revoke(&self, device: &DeviceIdentity) {
        self.owned.lock().unwrap().remove(device);
        self.denied.lock().unwrap().insert(device.clone());
        self.notify(device, false);
    }

    pub fn is_owned(&self, device: &DeviceIdentity) -> bool {
        self.owned.lock().unwrap().contains(device)
    }

    pub fn released(&self) -> Vec<DeviceIdentity> {
        self.released.lock().unwrap().clone()
    }

    fn notify(&self, device: &DeviceIdentity, owned: bool) {
        let change = OwnershipChange {
            device: device.clone(),
            owned,
        };
        self.subscribers
            .lock()
            .unwrap()
            .retain(|tx| tx.send(change.clone()).is_ok());
    }
}

#[async_trait]
impl OwnershipService for FakeOwnership {
    async fn request_ownership(
        &self,
        device: &DeviceIdentity,
    ) -> SouthboundResult<OwnershipDecision> {
        if self.stall.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let late_denial = self.late_denials.lock().unwrap().remove(device);
        if late_denial {
            self.grant(device);
            tokio::time::sleep(Duration::from_millis(50)).await;
            return Ok(OwnershipDecision::Denied);
        }
        if self.denied.lock().unwrap().contains(device) {
            return Ok(OwnershipDecision::Denied);
        }
        self.owned.lock().unwrap().insert(device.clone());
        Ok(OwnershipDecision::Granted)
    }

    async fn release_ownership(&self, device: &DeviceIdentity) -> SouthboundResult<()> {
        self.owned.lock().unwrap().remove(device);
        self.released.lock().unwrap().push(device.clone());
        Ok(())
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<OwnershipChange> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().unwrap().push(tx);
        rx
    }
}

// ============================================================================
// Device
// ============================================================================

#[derive(Debug, Clone)]
pub enum TransactFailure {
    Transport,
    Reject(String),
}

pub struct FakeDeviceClient {
    info: ConnectionInfo,
    schema_version: Mutex<String>,
    rows: Mutex<BTreeMap<EntityKey, EntityData>>,
    batches: Mutex<Vec<Vec<DeviceOperation>>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    transact_delay: Mutex<Duration>,
    transact_gate: watch::Sender<bool>,
    dump_gate: watch::Sender<bool>,
    next_failure: Mutex<Option<TransactFailure>>,
    fail_dumps: AtomicU32,
    dumps: AtomicUsize,
    echo: AtomicBool,
    active: AtomicBool,
    updates_tx: Mutex<Option<mpsc::UnboundedSender<DeviceUpdate>>>,
    disconnects: AtomicUsize,
}

impl FakeDeviceClient {
    pub fn new(info: ConnectionInfo) -> Arc<Self> {
        Arc::new(Self {
            info,
            schema_version: Mutex::new("1.2.0".into()),
            rows: Mutex::new(BTreeMap::new()),
            batches: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            transact_delay: Mutex::new(Duration::ZERO),
            transact_gate: watch::Sender::new(true),
            dump_gate: watch::Sender::new(true),
            next_failure: Mutex::new(None),
            fail_dumps: AtomicU32::new(0),
            dumps: AtomicUsize::new(0),
            echo: AtomicBool::new(false),
            active: AtomicBool::new(true),
            updates_tx: Mutex::new(None),
            disconnects: AtomicUsize::new(0),
        })
    }

    pub fn identity(&self) -> DeviceIdentity {
        self.info.identity()
    }

    pub fn set_schema_version(&self, version: &str) {
        *self.schema_version.lock().unwrap() = version.into();
    }

    pub fn set_rows(&self, rows: Vec<EntityData>) {
        let mut current = self.rows.lock().unwrap();
        current.clear();
        for row in rows {
            current.insert(row.key(), row);
        }
    }

    pub fn row(&self, key: &EntityKey) -> Option<EntityData> {
        self.rows.lock().unwrap().get(key).cloned()
    }

    pub fn batches(&self) -> Vec<Vec<DeviceOperation>> {
        self.batches.lock().unwrap().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn dumps(&self) -> usize {
        self.dumps.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn set_transact_delay(&self, delay: Duration) {
        *self.transact_delay.lock().unwrap() = delay;
    }

    pub fn hold_transactions(&self) {
        self.transact_gate.send_replace(false);
    }

    pub fn release_transactions(&self) {
        self.transact_gate.send_replace(true);
    }

    pub fn hold_dump(&self) {
        self.dump_gate.send_replace(false);
    }

    pub fn release_dump(&self) {
        self.dump_gate.send_replace(true);
    }

    pub fn fail_next_transact(&self, failure: TransactFailure) {
        *self.next_failure.lock().unwrap() = Some(failure);
    }

    pub fn fail_next_dumps(&self, n: u32) {
        self.fail_dumps.store(n, Ordering::SeqCst);
    }

    /// Report applied operations back through the update stream.
    pub fn enable_echo(&self) {
        self.echo.store(true, Ordering::SeqCst);
    }

    /// Send an unsolicited device notification.
    pub fn notify(&self, update: DeviceUpdate) -> bool {
        match self.updates_tx.lock().unwrap().as_ref() {
            Some(tx) => tx.send(update).is_ok(),
            None => false,
        }
    }

    /// Simulate the session dying under us.
    pub fn kill(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.updates_tx.lock().unwrap().take();
    }

    fn apply(&self, ops: &[DeviceOperation]) -> Vec<DeviceChange> {
        let mut rows = self.rows.lock().unwrap();
        let mut changes = Vec::with_capacity(ops.len());
        for op in ops {
            match op.kind {
                OperationKind::Insert | OperationKind::Update => {
                    let row = op.row.clone().unwrap_or_default();
                    let entity: EntityData = serde_json::from_value(
                        serde_json::json!({ "kind": op.key.kind, "row": row }),
                    )
                    .expect("fake device received a malformed row");
                    rows.insert(op.key.clone(), entity.clone());
                    changes.push(DeviceChange {
                        key: op.key.clone(),
                        row: Some(entity),
                    });
                }
                OperationKind::Delete => {
                    rows.remove(&op.key);
                    changes.push(DeviceChange {
                        key: op.key.clone(),
                        row: None,
                    });
                }
            }
        }
        changes
    }
}

#[async_trait]
impl DeviceClient for FakeDeviceClient {
    fn connection_info(&self) -> ConnectionInfo {
        self.info
    }

    async fn get_schema(&self, database: &str) -> SouthboundResult<DatabaseSchema> {
        if !self.is_active() {
            return Err(SouthboundError::Transport("session closed".into()));
        }
        if database != HARDWARE_VTEP {
            return Err(SouthboundError::Schema(format!("unknown database {database}")));
        }
        Ok(DatabaseSchema {
            name: HARDWARE_VTEP.into(),
            version: self.schema_version.lock().unwrap().clone(),
            tables: vec!["Logical_Switch".into(), "Physical_Locator".into()],
        })
    }

    async fn transact(
        &self,
        _schema: &DatabaseSchema,
        operations: &[DeviceOperation],
    ) -> SouthboundResult<Vec<OperationResult>> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let mut gate = self.transact_gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;
        let delay = *self.transact_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let failure = self.next_failure.lock().unwrap().take();
        let result = if !self.is_active() {
            Err(SouthboundError::Transport("connection reset".into()))
        } else {
            match failure {
                Some(TransactFailure::Transport) => {
                    self.kill();
                    Err(SouthboundError::Transport("broken pipe".into()))
                }
                Some(TransactFailure::Reject(detail)) => {
                    self.batches.lock().unwrap().push(operations.to_vec());
                    let mut results = vec![OperationResult::ok(); operations.len()];
                    if let Some(last) = results.last_mut() {
                        *last = OperationResult::failed("constraint violation", Some(detail));
                    }
                    Ok(results)
                }
                None => {
                    self.batches.lock().unwrap().push(operations.to_vec());
                    let changes = self.apply(operations);
                    if self.echo.load(Ordering::SeqCst) {
                        self.notify(DeviceUpdate { changes });
                    }
                    Ok(vec![OperationResult::ok(); operations.len()])
                }
            }
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn dump(&self, _schema: &DatabaseSchema) -> SouthboundResult<Vec<EntityData>> {
        self.dumps.fetch_add(1, Ordering::SeqCst);
        let mut gate = self.dump_gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;
        let remaining = self.fail_dumps.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_dumps.store(remaining - 1, Ordering::SeqCst);
            return Err(SouthboundError::Reconciliation("injected dump failure".into()));
        }
        Ok(self.rows.lock().unwrap().values().cloned().collect())
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn take_updates(&self) -> Option<mpsc::UnboundedReceiver<DeviceUpdate>> {
        if !self.is_active() {
            return None;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *self.updates_tx.lock().unwrap() = Some(tx);
        Some(rx)
    }

    async fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.kill();
    }
}

#[derive(Default)]
pub struct FakeTransport {
    devices: Mutex<HashMap<ConnectionInfo, Arc<FakeDeviceClient>>>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, client: &Arc<FakeDeviceClient>) {
        self.devices
            .lock()
            .unwrap()
            .insert(client.connection_info(), Arc::clone(client));
    }
}

#[async_trait]
impl DeviceTransport for FakeTransport {
    async fn connect(&self, info: &ConnectionInfo) -> SouthboundResult<Arc<dyn DeviceClient>> {
        let client = self
            .devices
            .lock()
            .unwrap()
            .get(info)
            .cloned()
            .ok_or_else(|| SouthboundError::Transport(format!("{info} unreachable")))?;
        Ok(client as Arc<dyn DeviceClient>)
    }
}
