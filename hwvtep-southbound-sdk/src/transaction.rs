use crate::model::{DeviceOperation, OperationResult, Origin};
use chrono::{DateTime, Utc};
use hwvtep_southbound_error::{SouthboundError, SouthboundResult};
use serde::{Deserialize, Serialize};
use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};
use tokio::sync::oneshot;
use uuid::Uuid;

/// Result delivered to the submitter of a device transaction.
pub type TransactionOutcome = SouthboundResult<Vec<OperationResult>>;

/// An ordered batch of device operations waiting for the invoker.
///
/// Built together with its [`PendingTransaction`]; the batch is immutable once
/// handed to an invoker and the responder is consumed exactly once.
#[derive(Debug)]
pub struct TransactionRequest {
    id: Uuid,
    origin: Origin,
    operations: Vec<DeviceOperation>,
    created_at: DateTime<Utc>,
    responder: oneshot::Sender<TransactionOutcome>,
}

impl TransactionRequest {
    pub fn new(operations: Vec<DeviceOperation>) -> (Self, PendingTransaction) {
        Self::with_origin(operations, Origin::Controller)
    }

    pub fn with_origin(
        operations: Vec<DeviceOperation>,
        origin: Origin,
    ) -> (Self, PendingTransaction) {
        let (tx, rx) = oneshot::channel();
        let id = Uuid::new_v4();
        (
            Self {
                id,
                origin,
                operations,
                created_at: Utc::now(),
                responder: tx,
            },
            PendingTransaction { id, rx },
        )
    }

    #[inline]
    pub fn id(&self) -> Uuid {
        self.id
    }

    #[inline]
    pub fn origin(&self) -> Origin {
        self.origin
    }

    #[inline]
    pub fn operations(&self) -> &[DeviceOperation] {
        &self.operations
    }

    #[inline]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Short human readable description for logs and history.
    pub fn summary(&self) -> String {
        match self.operations.as_slice() {
            [] => "empty".to_string(),
            [only] => only.summary(),
            [first, rest @ ..] => format!("{} (+{} more)", first.summary(), rest.len()),
        }
    }

    /// Adjust the batch before it is handed to an invoker.
    #[inline]
    pub fn operations_mut(&mut self) -> &mut [DeviceOperation] {
        &mut self.operations
    }

    /// Same request and responder with a replacement batch, for writes held
    /// back before submission.
    pub fn with_operations(mut self, operations: Vec<DeviceOperation>) -> Self {
        self.operations = operations;
        self
    }

    /// Complete the request. Returns false when the submitter dropped its handle.
    pub fn resolve(self, outcome: TransactionOutcome) -> bool {
        self.responder.send(outcome).is_ok()
    }

    #[inline]
    pub fn fail(self, error: SouthboundError) -> bool {
        self.resolve(Err(error))
    }
}

/// Handle returned to the submitter; resolves exactly once.
///
/// Dropping the request side without resolving yields `ConnectionClosed`.
#[derive(Debug)]
pub struct PendingTransaction {
    id: Uuid,
    rx: oneshot::Receiver<TransactionOutcome>,
}

impl PendingTransaction {
    #[inline]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Non-blocking check; `None` while the transaction is still queued or in flight.
    pub fn try_outcome(&mut self) -> Option<TransactionOutcome> {
        match self.rx.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(dropped())),
        }
    }
}

fn dropped() -> SouthboundError {
    SouthboundError::closed("transaction dropped before completion")
}

impl Future for PendingTransaction {
    type Output = TransactionOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or_else(|_| Err(dropped())))
    }
}

/// Direction of a recorded transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    ControllerToDevice,
    DeviceToController,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail")]
pub enum RecordOutcome {
    Success,
    Failure(String),
}

impl RecordOutcome {
    pub fn from_result<T>(result: &SouthboundResult<T>) -> Self {
        match result {
            Ok(_) => RecordOutcome::Success,
            Err(e) => RecordOutcome::Failure(e.to_string()),
        }
    }

    #[inline]
    pub fn is_success(&self) -> bool {
        matches!(self, RecordOutcome::Success)
    }
}

/// Audit entry kept in a transaction history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRecord {
    pub timestamp: DateTime<Utc>,
    pub direction: Direction,
    pub device: String,
    pub correlation_id: Uuid,
    pub summary: String,
    pub outcome: RecordOutcome,
}

impl TransactionRecord {
    pub fn new(
        direction: Direction,
        device: impl Into<String>,
        correlation_id: Uuid,
        summary: impl Into<String>,
        outcome: RecordOutcome,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            direction,
            device: device.into(),
            correlation_id,
            summary: summary.into(),
            outcome,
        }
    }
}
