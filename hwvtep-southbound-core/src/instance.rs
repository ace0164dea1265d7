use crate::{
    history::TransactionHistory,
    invoker::{InvokerConfig, TransactionInvoker},
    reconciler::translate,
};
use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use hwvtep_southbound_error::{SouthboundError, SouthboundResult};
use hwvtep_southbound_sdk::{
    Authority, ConnectionInfo, DataStore, DatabaseSchema, DeviceClient, DeviceIdentity,
    DeviceOperation, DeviceSubtree, DeviceUpdate, Direction, EntityData, EntityKey, OperationKind,
    OperationResult, Origin, PendingTransaction, RecordOutcome, SouthboundOptions, StoreChange,
    StoreTransaction, TransactionRecord, TransactionRequest, Version, HARDWARE_VTEP,
};
use std::{
    collections::{BTreeMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU8, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::{sync::watch, time};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Lifecycle of one device connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Active = 1,
    ReconcilingFirst = 2,
    Steady = 3,
    Closing = 4,
    Closed = 5,
}

impl ConnectionState {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Closing | ConnectionState::Closed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReconciliationState {
    NotStarted = 0,
    InProgress = 1,
    Done = 2,
}

impl From<u8> for ReconciliationState {
    fn from(value: u8) -> Self {
        match value {
            0 => ReconciliationState::NotStarted,
            1 => ReconciliationState::InProgress,
            _ => ReconciliationState::Done,
        }
    }
}

/// Store writes and device operations that bring one device in line with the
/// store after it (re)connects.
#[derive(Debug, Default)]
pub struct ReconcilePlan {
    pub store_writes: Option<StoreTransaction>,
    pub device_operations: Vec<DeviceOperation>,
    pub conflicts: Vec<SouthboundError>,
}

/// Merge device state with store state.
///
/// Device-authority kinds: the device wins and the store is corrected.
/// Controller-authority kinds: the store wins and device operations are
/// produced, ordered so referenced rows exist before their referrers.
pub fn plan_first_update(
    device: &DeviceIdentity,
    device_rows: Vec<EntityData>,
    store_rows: DeviceSubtree,
) -> SouthboundResult<ReconcilePlan> {
    let device_rows: BTreeMap<EntityKey, EntityData> =
        device_rows.into_iter().map(|row| (row.key(), row)).collect();

    let mut store_tx = StoreTransaction::new(Origin::Device);
    let mut changes = Vec::new();
    let mut conflicts = Vec::new();

    let keys: std::collections::BTreeSet<&EntityKey> =
        device_rows.keys().chain(store_rows.keys()).collect();
    for key in keys {
        let on_device = device_rows.get(key);
        let in_store = store_rows.get(key);
        if on_device == in_store {
            continue;
        }
        match key.kind.authority() {
            Authority::Device => {
                if let (Some(d), Some(s)) = (on_device, in_store) {
                    conflicts.push(conflict(key, "store", s, "device", d));
                }
                match on_device {
                    Some(row) => store_tx.put(device, row.clone()),
                    None => store_tx.delete(device, key.clone()),
                };
            }
            Authority::Controller => {
                if let (Some(d), Some(s)) = (on_device, in_store) {
                    conflicts.push(conflict(key, "device", d, "store", s));
                }
                changes.push(StoreChange {
                    device: device.clone(),
                    key: key.clone(),
                    before: on_device.cloned(),
                    after: in_store.cloned(),
                    origin: Origin::Controller,
                });
            }
        }
    }

    Ok(ReconcilePlan {
        store_writes: (!store_tx.is_empty()).then_some(store_tx),
        device_operations: translate(&changes)?,
        conflicts,
    })
}

fn conflict(
    key: &EntityKey,
    loser: &str,
    loser_row: &EntityData,
    winner: &str,
    winner_row: &EntityData,
) -> SouthboundError {
    SouthboundError::ReconciliationConflict {
        key: key.to_string(),
        detail: format!("{loser} has {loser_row:?}, keeping {winner} {winner_row:?}"),
    }
}

/// Rows on the device, as JSON, keyed by entity.
type DeviceView = BTreeMap<EntityKey, serde_json::Value>;

fn apply_to_view(view: &mut DeviceView, op: &DeviceOperation) {
    match (op.kind, &op.row) {
        (OperationKind::Delete, _) | (_, None) => {
            view.remove(&op.key);
        }
        (_, Some(row)) => {
            view.insert(op.key.clone(), row.clone());
        }
    }
}

/// Rewrite `operations` for a device already holding `view`, then apply them
/// to it. Operations with no effect are dropped; an insert of a present row
/// becomes an update and an update of a missing row becomes an insert.
fn resolve_against_view(
    view: &mut DeviceView,
    operations: &[DeviceOperation],
) -> Vec<DeviceOperation> {
    let mut resolved = Vec::with_capacity(operations.len());
    for op in operations {
        let kind = match (op.kind, view.get(&op.key), &op.row) {
            (OperationKind::Delete, None, _) => continue,
            (OperationKind::Delete, Some(_), _) => OperationKind::Delete,
            (_, Some(current), Some(row)) if current == row => continue,
            (_, Some(_), Some(_)) => OperationKind::Update,
            (_, None, Some(_)) => OperationKind::Insert,
            (kind, _, None) => kind,
        };
        let op = DeviceOperation { kind, ..op.clone() };
        apply_to_view(view, &op);
        resolved.push(op);
    }
    resolved
}

/// One live, owned connection to a device.
///
/// Writes submitted before the first reconciliation completes are deferred
/// and flushed, in submission order, right before the instance turns
/// `Steady`. Closing fails every deferred or queued write with
/// `ConnectionClosed`.
pub struct DeviceConnectionInstance {
    device: DeviceIdentity,
    info: ConnectionInfo,
    client: Arc<dyn DeviceClient>,
    options: Arc<SouthboundOptions>,
    schema: ArcSwapOption<DatabaseSchema>,
    version: ArcSwapOption<Version>,
    invoker: ArcSwapOption<TransactionInvoker>,
    controller_history: Arc<TransactionHistory>,
    device_history: Arc<TransactionHistory>,
    state_tx: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,
    reconciliation: AtomicU8,
    first_update_triggered: AtomicBool,
    deferred: Mutex<VecDeque<TransactionRequest>>,
    cancel: CancellationToken,
    created_at: DateTime<Utc>,
}

impl std::fmt::Debug for DeviceConnectionInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceConnectionInstance")
            .field("device", &self.device)
            .field("info", &self.info)
            .field("state", &self.state())
            .field("reconciliation", &self.reconciliation_state())
            .finish()
    }
}

impl DeviceConnectionInstance {
    pub fn new(
        device: DeviceIdentity,
        client: Arc<dyn DeviceClient>,
        options: Arc<SouthboundOptions>,
        parent_cancel: &CancellationToken,
    ) -> Arc<Self> {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        Arc::new(Self {
            info: client.connection_info(),
            controller_history: Arc::new(TransactionHistory::named(
                "controller",
                options.history_capacity,
                options.history_log_threshold,
            )),
            device_history: Arc::new(TransactionHistory::named(
                "device",
                options.history_capacity,
                options.history_log_threshold,
            )),
            device,
            client,
            options,
            schema: ArcSwapOption::from(None),
            version: ArcSwapOption::from(None),
            invoker: ArcSwapOption::from(None),
            state_tx,
            state_rx,
            reconciliation: AtomicU8::new(ReconciliationState::NotStarted as u8),
            first_update_triggered: AtomicBool::new(false),
            deferred: Mutex::new(VecDeque::new()),
            cancel: parent_cancel.child_token(),
            created_at: Utc::now(),
        })
    }

    // === Accessors ===

    #[inline]
    pub fn device(&self) -> &DeviceIdentity {
        &self.device
    }

    #[inline]
    pub fn connection_info(&self) -> &ConnectionInfo {
        &self.info
    }

    #[inline]
    pub fn client(&self) -> Arc<dyn DeviceClient> {
        Arc::clone(&self.client)
    }

    #[inline]
    pub fn schema(&self) -> Option<Arc<DatabaseSchema>> {
        self.schema.load_full()
    }

    /// Parsed schema version, known once activated.
    #[inline]
    pub fn version(&self) -> Option<Version> {
        self.version.load_full().map(|v| *v)
    }

    #[inline]
    pub fn invoker(&self) -> Option<Arc<TransactionInvoker>> {
        self.invoker.load_full()
    }

    #[inline]
    pub fn controller_history(&self) -> &Arc<TransactionHistory> {
        &self.controller_history
    }

    #[inline]
    pub fn device_history(&self) -> &Arc<TransactionHistory> {
        &self.device_history
    }

    #[inline]
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    #[inline]
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    #[inline]
    pub fn reconciliation_state(&self) -> ReconciliationState {
        ReconciliationState::from(self.reconciliation.load(Ordering::Acquire))
    }

    #[inline]
    pub fn first_update_triggered(&self) -> bool {
        self.first_update_triggered.load(Ordering::Acquire)
    }

    #[inline]
    pub fn deferred_len(&self) -> usize {
        self.deferred.lock().unwrap().len()
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.state().is_terminal()
    }

    #[inline]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    #[inline]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Whether the device schema is at least `min`; false before activation.
    pub fn supports(&self, min: &Version) -> bool {
        self.version().is_some_and(|v| v.is_at_least(min))
    }

    /// Leave out row columns the device schema predates.
    fn fit_to_schema(&self, operations: &mut [DeviceOperation]) {
        let Some(version) = self.version() else {
            return;
        };
        for op in operations {
            for column in op.strip_unsupported(&version) {
                debug!(
                    device = %self.device,
                    key = %op.key,
                    column,
                    %version,
                    "Column unknown to device schema, left out"
                );
            }
        }
    }

    // === Lifecycle ===

    fn transition(&self, from: &[ConnectionState], to: ConnectionState) -> bool {
        let changed = self.state_tx.send_if_modified(|current| {
            if from.contains(current) {
                *current = to;
                true
            } else {
                false
            }
        });
        if changed {
            debug!(device = %self.device, state = ?to, "Connection state changed");
        }
        changed
    }

    /// Race `fut` against the instance token and `limit`.
    async fn bounded<T, F>(&self, limit: Duration, fut: F) -> SouthboundResult<T>
    where
        F: std::future::Future<Output = SouthboundResult<T>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(SouthboundError::closed(format!("{} closed", self.device))),
            res = time::timeout(limit, fut) => res.map_err(|_| SouthboundError::Timeout(limit))?,
        }
    }

    /// Fetch and parse the device schema, then start the invoker.
    ///
    /// A malformed schema version fails activation; no default is assumed.
    pub async fn activate(&self) -> SouthboundResult<Version> {
        if self.state() != ConnectionState::Connecting {
            return Err(SouthboundError::InvalidState(format!(
                "cannot activate {} from {:?}",
                self.device,
                self.state()
            )));
        }

        let schema = self
            .bounded(
                self.options.reconcile_timeout(),
                self.client.get_schema(HARDWARE_VTEP),
            )
            .await?;
        let version = Version::parse(&schema.version)?;
        let schema = Arc::new(schema);

        let invoker = TransactionInvoker::spawn(
            self.device.clone(),
            Arc::clone(&self.client),
            Arc::clone(&schema),
            Arc::clone(&self.controller_history),
            InvokerConfig::from(self.options.as_ref()),
            &self.cancel,
        );
        self.schema.store(Some(schema));
        self.version.store(Some(Arc::new(version)));
        self.invoker.store(Some(Arc::clone(&invoker)));

        if !self.transition(&[ConnectionState::Connecting], ConnectionState::Active) {
            invoker.stop();
            return Err(SouthboundError::closed(format!(
                "{} closed during activation",
                self.device
            )));
        }
        info!(device = %self.device, %version, "Device connection active");
        Ok(version)
    }

    /// First-update reconciliation. May be called again after a failure; the
    /// instance stays in `ReconcilingFirst` until an attempt succeeds.
    pub async fn reconcile_first(&self, store: &dyn DataStore) -> SouthboundResult<()> {
        if !self.transition(
            &[ConnectionState::Active, ConnectionState::ReconcilingFirst],
            ConnectionState::ReconcilingFirst,
        ) {
            return Err(SouthboundError::InvalidState(format!(
                "cannot reconcile {} from {:?}",
                self.device,
                self.state()
            )));
        }
        self.reconciliation
            .store(ReconciliationState::InProgress as u8, Ordering::Release);

        let view = match self
            .bounded(self.options.reconcile_timeout(), self.reconcile_once(store))
            .await
        {
            Ok(view) => view,
            Err(e) => {
                warn!(device = %self.device, error = %e, "First-update reconciliation failed");
                return Err(e);
            }
        };

        self.enter_steady(view)?;
        self.first_update_triggered.store(true, Ordering::Release);
        self.reconciliation
            .store(ReconciliationState::Done as u8, Ordering::Release);
        info!(device = %self.device, "First-update reconciliation done");
        Ok(())
    }

    /// One reconciliation attempt. Returns the rows the device holds once the
    /// plan is applied.
    async fn reconcile_once(&self, store: &dyn DataStore) -> SouthboundResult<DeviceView> {
        let schema = self
            .schema()
            .ok_or_else(|| SouthboundError::InvalidState("schema not loaded".into()))?;
        let invoker = self
            .invoker()
            .ok_or_else(|| SouthboundError::InvalidState("invoker not started".into()))?;

        let device_rows = self.client.dump(&schema).await?;
        let mut view = device_rows
            .iter()
            .map(|row| -> SouthboundResult<_> { Ok((row.key(), row.to_row()?)) })
            .collect::<SouthboundResult<DeviceView>>()?;
        let store_rows = store.read(&self.device).await?;
        let plan = plan_first_update(&self.device, device_rows, store_rows)?;

        for c in &plan.conflicts {
            warn!(device = %self.device, "{c}");
        }
        if let Some(writes) = plan.store_writes {
            debug!(device = %self.device, writes = writes.len(), "Correcting store from device");
            store.commit(writes).await?;
        }
        let mut operations = plan.device_operations;
        if !operations.is_empty() {
            debug!(
                device = %self.device,
                operations = operations.len(),
                "Pushing store intent to device"
            );
            self.fit_to_schema(&mut operations);
            for op in &operations {
                apply_to_view(&mut view, op);
            }
            invoker.transact(operations)?.await?;
        }
        Ok(view)
    }

    /// Flush deferred writes in order and turn `Steady`, atomically with
    /// respect to [`DeviceConnectionInstance::submit`].
    ///
    /// Deferred writes are resolved against `view` first: operations the
    /// reconciliation already applied are dropped, and a request left with
    /// nothing to send completes at once.
    fn enter_steady(&self, mut view: DeviceView) -> SouthboundResult<()> {
        let invoker = self
            .invoker()
            .ok_or_else(|| SouthboundError::InvalidState("invoker not started".into()))?;
        let mut deferred = self.deferred.lock().unwrap();
        if self.state() != ConnectionState::ReconcilingFirst {
            return Err(SouthboundError::closed(format!(
                "{} closed during reconciliation",
                self.device
            )));
        }
        let (mut flushed, mut subsumed) = (0usize, 0usize);
        for mut request in deferred.drain(..) {
            self.fit_to_schema(request.operations_mut());
            let operations = resolve_against_view(&mut view, request.operations());
            if operations.is_empty() {
                let results = vec![OperationResult::ok(); request.len()];
                request.resolve(Ok(results));
                subsumed += 1;
                continue;
            }
            // A rejected request has already been resolved with the error.
            let _ = invoker.submit(request.with_operations(operations));
            flushed += 1;
        }
        self.transition(&[ConnectionState::ReconcilingFirst], ConnectionState::Steady);
        if flushed + subsumed > 0 {
            debug!(device = %self.device, flushed, subsumed, "Flushed deferred transactions");
        }
        Ok(())
    }

    /// Route a write: straight to the invoker once `Steady`, deferred before,
    /// rejected with `ConnectionClosed` once closing.
    pub fn submit(&self, mut request: TransactionRequest) -> SouthboundResult<()> {
        let mut deferred = self.deferred.lock().unwrap();
        match self.state() {
            ConnectionState::Steady => {
                drop(deferred);
                self.fit_to_schema(request.operations_mut());
                match self.invoker() {
                    Some(invoker) => invoker.submit(request),
                    None => {
                        let err = SouthboundError::InvalidState("invoker not started".into());
                        request.fail(SouthboundError::closed(err.to_string()));
                        Err(err)
                    }
                }
            }
            ConnectionState::Connecting
            | ConnectionState::Active
            | ConnectionState::ReconcilingFirst => {
                debug!(device = %self.device, id = %request.id(), "Deferring transaction until steady");
                deferred.push_back(request);
                Ok(())
            }
            ConnectionState::Closing | ConnectionState::Closed => {
                let reason = format!("{} is closed", self.device);
                request.fail(SouthboundError::closed(reason.clone()));
                Err(SouthboundError::closed(reason))
            }
        }
    }

    pub fn transact(&self, operations: Vec<DeviceOperation>) -> SouthboundResult<PendingTransaction> {
        let (request, pending) = TransactionRequest::new(operations);
        self.submit(request)?;
        Ok(pending)
    }

    /// Write a device notification into the store tagged `Origin::Device`.
    ///
    /// Before the first update was triggered rows replace the store entry;
    /// afterwards they are merged into it. Closing the instance abandons a
    /// commit still waiting for the store.
    pub async fn apply_device_update(
        &self,
        update: DeviceUpdate,
        store: &dyn DataStore,
    ) -> SouthboundResult<()> {
        if update.changes.is_empty() {
            return Ok(());
        }
        let initial = !self.first_update_triggered();
        let mut tx = StoreTransaction::new(Origin::Device);
        for change in update.changes {
            match change.row {
                Some(row) if initial => tx.put(&self.device, row),
                Some(row) => tx.merge(&self.device, row),
                None => tx.delete(&self.device, change.key),
            };
        }
        let summary = match tx.writes.as_slice() {
            [only] => format!("{} {}", if initial { "put" } else { "merge" }, only.key()),
            writes => format!("{} device rows", writes.len()),
        };

        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(SouthboundError::closed(format!("{} closed", self.device))),
            res = store.commit(tx) => res,
        };
        self.device_history.record(TransactionRecord::new(
            Direction::DeviceToController,
            self.device.as_str(),
            Uuid::new_v4(),
            summary,
            RecordOutcome::from_result(&result),
        ));
        result
    }

    /// Wait until the instance reaches `target`. Reaching `Closed` first
    /// fails with `ConnectionClosed` unless `Closed` is the target.
    pub async fn wait_for_state(
        &self,
        target: ConnectionState,
        timeout: Duration,
    ) -> SouthboundResult<()> {
        let mut rx = self.subscribe_state();
        let reached = time::timeout(
            timeout,
            rx.wait_for(|s| *s == target || *s == ConnectionState::Closed),
        )
        .await
        .map_err(|_| SouthboundError::Timeout(timeout))?
        .map(|s| *s)
        .map_err(|_| SouthboundError::closed("state channel closed"))?;
        if reached == target {
            Ok(())
        } else {
            Err(SouthboundError::closed(format!(
                "{} closed before reaching {target:?}",
                self.device
            )))
        }
    }

    /// Tear down. Idempotent; only the first call does any work.
    pub async fn close(&self, reason: &str, disconnect_transport: bool) {
        let drained: Vec<TransactionRequest> = {
            let mut deferred = self.deferred.lock().unwrap();
            if !self.transition(
                &[
                    ConnectionState::Connecting,
                    ConnectionState::Active,
                    ConnectionState::ReconcilingFirst,
                    ConnectionState::Steady,
                ],
                ConnectionState::Closing,
            ) {
                return;
            }
            deferred.drain(..).collect()
        };
        info!(device = %self.device, reason, "Closing device connection");

        self.cancel.cancel();
        for request in drained {
            request.fail(SouthboundError::closed(format!(
                "{} closed: {reason}",
                self.device
            )));
        }
        if let Some(invoker) = self.invoker() {
            invoker.shutdown().await;
        }
        if disconnect_transport {
            self.client.disconnect().await;
        }
        self.transition(&[ConnectionState::Closing], ConnectionState::Closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hwvtep_southbound_sdk::{
        EntityKind, LocalUcastMac, LogicalSwitch, OperationKind, RemoteUcastMac,
        TerminationPoint,
    };

    fn device() -> DeviceIdentity {
        DeviceIdentity::from_node_id("hwvtep://10.0.0.1:6640")
    }

    fn ls(name: &str, tunnel_key: u32) -> EntityData {
        EntityData::LogicalSwitch(LogicalSwitch {
            name: name.into(),
            tunnel_key: Some(tunnel_key),
            description: None,
            replication_mode: None,
        })
    }

    fn tp(ip: &str) -> EntityData {
        EntityData::TerminationPoint(TerminationPoint::vxlan(ip.parse().unwrap()))
    }

    fn remote_mac(mac: &str, switch: &str, ip: &str) -> EntityData {
        EntityData::RemoteUcastMac(RemoteUcastMac {
            mac: mac.into(),
            logical_switch: switch.into(),
            locator: TerminationPoint::vxlan(ip.parse().unwrap()).key().name.to_string(),
            ip: None,
        })
    }

    fn local_mac(mac: &str) -> EntityData {
        EntityData::LocalUcastMac(LocalUcastMac {
            mac: mac.into(),
            logical_switch: "ls0".into(),
            locator: "vxlan_over_ipv4:10.0.0.1".into(),
            ip: None,
        })
    }

    fn subtree(rows: Vec<EntityData>) -> DeviceSubtree {
        rows.into_iter().map(|r| (r.key(), r)).collect()
    }

    #[test]
    fn store_intent_pushed_in_dependency_order() {
        let store = subtree(vec![
            remote_mac("00:00:00:00:00:01", "ls0", "10.0.0.9"),
            ls("ls0", 5000),
            tp("10.0.0.9"),
        ]);
        let plan = plan_first_update(&device(), Vec::new(), store).unwrap();
        assert!(plan.store_writes.is_none());
        assert!(plan.conflicts.is_empty());
        let kinds: Vec<_> = plan.device_operations.iter().map(|o| o.key.kind).collect();
        assert_eq!(kinds.len(), 3);
        assert_eq!(kinds[2], EntityKind::RemoteUcastMac);
        assert!(plan
            .device_operations
            .iter()
            .all(|o| o.kind == OperationKind::Insert));
    }

    #[test]
    fn stale_device_config_removed_referrers_first() {
        let on_device = vec![ls("stale", 1), remote_mac("00:00:00:00:00:02", "stale", "10.0.0.9")];
        let plan = plan_first_update(&device(), on_device, DeviceSubtree::new()).unwrap();
        let ops: Vec<_> = plan
            .device_operations
            .iter()
            .map(|o| (o.kind, o.key.kind))
            .collect();
        assert_eq!(
            ops,
            [
                (OperationKind::Delete, EntityKind::RemoteUcastMac),
                (OperationKind::Delete, EntityKind::LogicalSwitch),
            ]
        );
    }

    #[test]
    fn store_wins_for_controller_kinds_with_conflict() {
        let plan = plan_first_update(
            &device(),
            vec![ls("ls0", 1)],
            subtree(vec![ls("ls0", 2)]),
        )
        .unwrap();
        assert_eq!(plan.conflicts.len(), 1);
        assert!(matches!(
            plan.conflicts[0],
            SouthboundError::ReconciliationConflict { .. }
        ));
        assert_eq!(plan.device_operations.len(), 1);
        assert_eq!(plan.device_operations[0].kind, OperationKind::Update);
        assert_eq!(plan.device_operations[0].row.as_ref().unwrap()["tunnelKey"], 2);
    }

    #[test]
    fn device_wins_for_device_kinds() {
        let learned = local_mac("00:00:00:00:00:0a");
        let gone = local_mac("00:00:00:00:00:0b");
        let plan = plan_first_update(
            &device(),
            vec![learned.clone()],
            subtree(vec![gone.clone()]),
        )
        .unwrap();
        assert!(plan.device_operations.is_empty());
        let writes = plan.store_writes.unwrap();
        assert_eq!(writes.origin, Origin::Device);
        assert_eq!(writes.len(), 2);
        assert!(writes.writes.iter().any(|w| w.key() == learned.key()));
        assert!(writes.writes.iter().any(|w| w.key() == gone.key()));
    }

    #[test]
    fn in_sync_device_needs_nothing() {
        let rows = vec![ls("ls0", 1), tp("10.0.0.9"), local_mac("00:00:00:00:00:0a")];
        let plan = plan_first_update(&device(), rows.clone(), subtree(rows)).unwrap();
        assert!(plan.store_writes.is_none());
        assert!(plan.device_operations.is_empty());
        assert!(plan.conflicts.is_empty());
    }

    #[test]
    fn reconciliation_state_from_u8() {
        assert_eq!(ReconciliationState::from(0), ReconciliationState::NotStarted);
        assert_eq!(ReconciliationState::from(2), ReconciliationState::Done);
        assert!(ConnectionState::Closing.is_terminal());
        assert!(!ConnectionState::Steady.is_terminal());
    }

    #[test]
    fn deferred_operations_resolved_against_reconciled_rows() {
        let mut view = DeviceView::new();
        let ls0 = ls("ls0", 1);
        apply_to_view(&mut view, &DeviceOperation::insert(&ls0).unwrap());

        let ops = vec![
            DeviceOperation::insert(&ls0).unwrap(),
            DeviceOperation::insert(&ls("ls0", 2)).unwrap(),
            DeviceOperation::update(&ls("ls1", 3)).unwrap(),
            DeviceOperation::delete(EntityKey::logical_switch("gone")),
            DeviceOperation::delete(EntityKey::logical_switch("ls1")),
        ];
        let resolved = resolve_against_view(&mut view, &ops);
        let kinds: Vec<(OperationKind, &str)> = resolved
            .iter()
            .map(|op| (op.kind, op.key.name.as_ref()))
            .collect();
        assert_eq!(
            kinds,
            vec![
                (OperationKind::Update, "ls0"),
                (OperationKind::Insert, "ls1"),
                (OperationKind::Delete, "ls1"),
            ]
        );
        assert_eq!(view.len(), 1);
        assert!(resolve_against_view(&mut view, &ops[1..2]).is_empty());
    }
}
