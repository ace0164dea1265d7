use crate::manager::ConnectionManager;
use hwvtep_southbound_error::{SouthboundError, SouthboundResult};
use hwvtep_southbound_sdk::{
    Authority, ChangeType, DataStore, DeviceIdentity, DeviceOperation, Origin, StoreChange,
    TransactionRequest,
};
use std::{
    cmp::Reverse,
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Translate controller-authority store changes into device operations.
///
/// Creations and updates come first, by ascending dependency rank, then
/// deletions by descending rank, so a referenced row always exists while
/// anything points at it. Unchanged updates and device-authority kinds are
/// dropped. Relative order inside one rank follows the input.
pub fn translate(changes: &[StoreChange]) -> SouthboundResult<Vec<DeviceOperation>> {
    let mut upserts = Vec::new();
    let mut deletes = Vec::new();
    for change in changes {
        if change.key.kind.authority() == Authority::Device {
            continue;
        }
        match (change.change_type(), &change.after) {
            (ChangeType::Created, Some(after)) => upserts.push(DeviceOperation::insert(after)?),
            (ChangeType::Updated, Some(after)) => upserts.push(DeviceOperation::update(after)?),
            (ChangeType::Deleted, _) => deletes.push(DeviceOperation::delete(change.key.clone())),
            _ => {}
        }
    }
    upserts.sort_by_key(|op| op.key.kind.dependency_rank());
    deletes.sort_by_key(|op| Reverse(op.key.kind.dependency_rank()));
    upserts.extend(deletes);
    Ok(upserts)
}

/// Counters exposed for observability and tests.
#[derive(Debug, Default)]
pub struct ReconcilerStats {
    batches: AtomicU64,
    submitted: AtomicU64,
    suppressed: AtomicU64,
    unowned: AtomicU64,
}

impl ReconcilerStats {
    pub fn batches(&self) -> u64 {
        self.batches.load(Ordering::Acquire)
    }

    /// Device transactions handed to connection instances.
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Acquire)
    }

    /// Changes dropped because the device produced them.
    pub fn suppressed(&self) -> u64 {
        self.suppressed.load(Ordering::Acquire)
    }

    /// Device batches skipped because this process does not own the device.
    pub fn unowned(&self) -> u64 {
        self.unowned.load(Ordering::Acquire)
    }
}

/// Listens to store change batches and forwards controller intent to the
/// owning device connection.
pub struct DataChangeReconciler {
    manager: Arc<ConnectionManager>,
    store: Arc<dyn DataStore>,
    stats: Arc<ReconcilerStats>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DataChangeReconciler {
    pub fn new(manager: Arc<ConnectionManager>, store: Arc<dyn DataStore>) -> Arc<Self> {
        Arc::new(Self {
            manager,
            store,
            stats: Arc::new(ReconcilerStats::default()),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        })
    }

    #[inline]
    pub fn stats(&self) -> &ReconcilerStats {
        &self.stats
    }

    /// Subscribe to the store and start the processing loop.
    pub fn start(self: &Arc<Self>) -> SouthboundResult<()> {
        let mut task = self.task.lock().unwrap();
        if task.is_some() {
            return Err(SouthboundError::InvalidState(
                "reconciler already started".into(),
            ));
        }
        if self.cancel.is_cancelled() {
            return Err(SouthboundError::InvalidState("reconciler stopped".into()));
        }
        let mut changes = self.store.subscribe();
        let this = Arc::clone(self);
        *task = Some(tokio::spawn(async move {
            info!("Data change reconciler started");
            loop {
                tokio::select! {
                    biased;
                    _ = this.cancel.cancelled() => break,
                    batch = changes.recv() => match batch {
                        Some(batch) => {
                            this.process_batch(batch);
                        }
                        None => {
                            warn!("Store change stream ended");
                            break;
                        }
                    },
                }
            }
            info!("Data change reconciler stopped");
        }));
        Ok(())
    }

    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.task.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Handle one committed batch. Returns the number of device transactions
    /// submitted. Never waits for device acknowledgement.
    pub fn process_batch(&self, batch: Vec<StoreChange>) -> usize {
        self.stats.batches.fetch_add(1, Ordering::AcqRel);

        let mut order: Vec<DeviceIdentity> = Vec::new();
        let mut per_device: HashMap<DeviceIdentity, Vec<StoreChange>> = HashMap::new();
        for change in batch {
            if change.origin == Origin::Device {
                self.stats.suppressed.fetch_add(1, Ordering::AcqRel);
                continue;
            }
            per_device
                .entry(change.device.clone())
                .or_insert_with(|| {
                    order.push(change.device.clone());
                    Vec::new()
                })
                .push(change);
        }

        let mut submitted = 0;
        for device in order {
            let Some(changes) = per_device.remove(&device) else {
                continue;
            };
            if self.submit_for_device(&device, &changes) {
                submitted += 1;
            }
        }
        submitted
    }

    fn submit_for_device(&self, device: &DeviceIdentity, changes: &[StoreChange]) -> bool {
        let Some(instance) = self.manager.get_connection_instance(device) else {
            self.stats.unowned.fetch_add(1, Ordering::AcqRel);
            debug!(%device, changes = changes.len(), "Skipping changes for device not connected here");
            return false;
        };
        let operations = match translate(changes) {
            Ok(ops) if ops.is_empty() => return false,
            Ok(ops) => ops,
            Err(e) => {
                warn!(%device, error = %e, "Failed to translate store changes");
                return false;
            }
        };

        let (request, pending) = TransactionRequest::new(operations);
        let id = request.id();
        let summary = request.summary();
        if let Err(e) = instance.submit(request) {
            warn!(%device, %id, error = %e, "Device transaction rejected");
            return false;
        }
        self.stats.submitted.fetch_add(1, Ordering::AcqRel);

        let device = device.clone();
        tokio::spawn(async move {
            match pending.await {
                Ok(_) => debug!(%device, %id, %summary, "Device transaction applied"),
                Err(e) => warn!(%device, %id, %summary, error = %e, "Device transaction failed"),
            }
        });
        true
    }
}
