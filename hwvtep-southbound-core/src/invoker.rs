use crate::history::TransactionHistory;
use hwvtep_southbound_error::{SouthboundError, SouthboundResult};
use hwvtep_southbound_sdk::{
    DatabaseSchema, DeviceClient, DeviceIdentity, DeviceOperation, Direction, OperationResult,
    PendingTransaction, RecordOutcome, SouthboundOptions, TransactionOutcome, TransactionRecord,
    TransactionRequest,
};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum InvokerState {
    Running = 0,
    Stopped = 1,
    /// Transport failure; the instance that owns this invoker must be torn down.
    Failed = 2,
}

impl From<u8> for InvokerState {
    fn from(value: u8) -> Self {
        match value {
            0 => InvokerState::Running,
            1 => InvokerState::Stopped,
            _ => InvokerState::Failed,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct InvokerConfig {
    pub transact_timeout: Duration,
}

impl From<&SouthboundOptions> for InvokerConfig {
    fn from(options: &SouthboundOptions) -> Self {
        Self {
            transact_timeout: options.transact_timeout(),
        }
    }
}

impl Default for InvokerConfig {
    fn default() -> Self {
        Self::from(&SouthboundOptions::default())
    }
}

#[derive(Debug)]
struct Shared {
    state_tx: watch::Sender<InvokerState>,
    in_flight: AtomicBool,
    queued: AtomicUsize,
}

impl Shared {
    /// Leave `Running` exactly once; later transitions are ignored.
    fn finish(&self, state: InvokerState) -> bool {
        self.state_tx.send_if_modified(|current| {
            if *current == InvokerState::Running {
                *current = state;
                true
            } else {
                false
            }
        })
    }
}

/// Per-device serializer of outbound transactions.
///
/// One worker task dequeues requests in submission order and keeps at most one
/// transaction in flight. A transport failure moves the invoker to
/// [`InvokerState::Failed`] and fails everything still queued; nothing is
/// retried here.
#[derive(Debug)]
pub struct TransactionInvoker {
    device: DeviceIdentity,
    request_tx: mpsc::UnboundedSender<TransactionRequest>,
    state_rx: watch::Receiver<InvokerState>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TransactionInvoker {
    pub fn spawn(
        device: DeviceIdentity,
        client: Arc<dyn DeviceClient>,
        schema: Arc<DatabaseSchema>,
        history: Arc<TransactionHistory>,
        config: InvokerConfig,
        parent_cancel: &CancellationToken,
    ) -> Arc<Self> {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(InvokerState::Running);
        let shared = Arc::new(Shared {
            state_tx,
            in_flight: AtomicBool::new(false),
            queued: AtomicUsize::new(0),
        });
        let cancel = parent_cancel.child_token();

        let worker = Worker {
            device: device.clone(),
            client,
            schema,
            history,
            timeout: config.transact_timeout,
            shared: Arc::clone(&shared),
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(worker.run(request_rx));

        Arc::new(Self {
            device,
            request_tx,
            state_rx,
            shared,
            cancel,
            worker: Mutex::new(Some(handle)),
        })
    }

    #[inline]
    pub fn device(&self) -> &DeviceIdentity {
        &self.device
    }

    #[inline]
    pub fn state(&self) -> InvokerState {
        *self.state_rx.borrow()
    }

    #[inline]
    pub fn subscribe_state(&self) -> watch::Receiver<InvokerState> {
        self.state_rx.clone()
    }

    /// Whether a transaction is currently awaiting its device reply.
    #[inline]
    pub fn in_flight(&self) -> bool {
        self.shared.in_flight.load(Ordering::Acquire)
    }

    /// Requests accepted but not yet picked up by the worker.
    #[inline]
    pub fn queued(&self) -> usize {
        self.shared.queued.load(Ordering::Acquire)
    }

    /// Enqueue without waiting. A stopped or failed invoker resolves the
    /// request's handle with `ConnectionClosed` and returns the same error.
    pub fn submit(&self, request: TransactionRequest) -> SouthboundResult<()> {
        let state = self.state();
        if state != InvokerState::Running {
            return Err(reject(request, &self.device, state));
        }
        self.shared.queued.fetch_add(1, Ordering::AcqRel);
        match self.request_tx.send(request) {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendError(request)) => {
                self.shared.queued.fetch_sub(1, Ordering::AcqRel);
                Err(reject(request, &self.device, self.state()))
            }
        }
    }

    /// Build a request from `operations`, submit it and hand back its handle.
    pub fn transact(&self, operations: Vec<DeviceOperation>) -> SouthboundResult<PendingTransaction> {
        let (request, pending) = TransactionRequest::new(operations);
        self.submit(request)?;
        Ok(pending)
    }

    /// Stop accepting work and cancel the in-flight wait. Already acknowledged
    /// transactions are unaffected.
    pub fn stop(&self) {
        if self.shared.finish(InvokerState::Stopped) {
            info!(device = %self.device, "Transaction invoker stopping");
        }
        self.cancel.cancel();
    }

    /// Stop and wait for the worker to drain.
    pub async fn shutdown(&self) {
        self.stop();
        let handle = self.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl Drop for TransactionInvoker {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn reject(request: TransactionRequest, device: &DeviceIdentity, state: InvokerState) -> SouthboundError {
    let reason = format!("invoker for {device} is {state:?}");
    request.fail(SouthboundError::closed(reason.clone()));
    SouthboundError::closed(reason)
}

/// Turn a device reply into the caller-facing outcome.
///
/// The first operation carrying an error fails the transaction.
pub(crate) fn classify(results: Vec<OperationResult>) -> TransactionOutcome {
    if let Some((index, failed)) = results.iter().enumerate().find(|(_, r)| r.is_error()) {
        let mut detail = failed.error.clone().unwrap_or_default();
        if let Some(details) = &failed.details {
            detail = format!("{detail}: {details}");
        }
        return Err(SouthboundError::OperationFailed { index, detail });
    }
    Ok(results)
}

struct Worker {
    device: DeviceIdentity,
    client: Arc<dyn DeviceClient>,
    schema: Arc<DatabaseSchema>,
    history: Arc<TransactionHistory>,
    timeout: Duration,
    shared: Arc<Shared>,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(self, mut request_rx: mpsc::UnboundedReceiver<TransactionRequest>) {
        debug!(device = %self.device, "Transaction invoker started");
        let exit = loop {
            let request = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break InvokerState::Stopped,
                req = request_rx.recv() => match req {
                    Some(request) => request,
                    None => break InvokerState::Stopped,
                },
            };
            self.shared.queued.fetch_sub(1, Ordering::AcqRel);
            self.shared.in_flight.store(true, Ordering::Release);

            let sent = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                res = time::timeout(
                    self.timeout,
                    self.client.transact(&self.schema, request.operations()),
                ) => Some(match res {
                    Ok(r) => r.and_then(classify),
                    Err(_) => Err(SouthboundError::Timeout(self.timeout)),
                }),
            };
            self.shared.in_flight.store(false, Ordering::Release);

            let Some(outcome) = sent else {
                let err = SouthboundError::closed("invoker stopped while awaiting device reply");
                self.record(&request, RecordOutcome::Failure(err.to_string()));
                request.fail(err);
                break InvokerState::Stopped;
            };

            let transport_failed = matches!(&outcome, Err(e) if e.is_transport());
            match &outcome {
                Ok(_) => debug!(device = %self.device, id = %request.id(), "Transaction acknowledged"),
                Err(e) if transport_failed => {
                    warn!(device = %self.device, id = %request.id(), error = %e, "Transaction failed on transport")
                }
                Err(e) => {
                    warn!(device = %self.device, id = %request.id(), error = %e, "Transaction rejected by device")
                }
            }
            self.record(&request, RecordOutcome::from_result(&outcome));
            request.resolve(outcome);

            if transport_failed {
                break InvokerState::Failed;
            }
        };

        // Publish before closing so concurrent submitters fail fast.
        if self.shared.finish(exit) {
            info!(device = %self.device, state = ?exit, "Transaction invoker exited");
        }
        request_rx.close();
        let reason = match exit {
            InvokerState::Failed => "device transport failed",
            _ => "invoker stopped",
        };
        let mut drained = 0usize;
        while let Ok(request) = request_rx.try_recv() {
            self.shared.queued.fetch_sub(1, Ordering::AcqRel);
            request.fail(SouthboundError::closed(reason));
            drained += 1;
        }
        if drained > 0 {
            debug!(device = %self.device, drained, "Failed queued transactions");
        }
    }

    fn record(&self, request: &TransactionRequest, outcome: RecordOutcome) {
        self.history.record(TransactionRecord::new(
            Direction::ControllerToDevice,
            self.device.as_str(),
            request.id(),
            request.summary(),
            outcome,
        ));
    }
}
