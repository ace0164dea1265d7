use config::ConfigError;
use serde_json::Error as SerdeJsonError;
use std::error::Error as StdError;
use thiserror::Error;
use tokio::{task::JoinError, time::Duration};

pub type SouthboundResult<T, E = SouthboundError> = Result<T, E>;

/// Raised when a textual value does not match its expected pattern.
///
/// Fatal to the parse call only; callers must not substitute a default.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("<{input}> does not match format {format}")]
pub struct ParseError {
    pub input: String,
    pub format: &'static str,
}

impl ParseError {
    #[inline]
    pub fn new(input: impl Into<String>, format: &'static str) -> Self {
        Self {
            input: input.into(),
            format,
        }
    }
}

#[derive(Error, Debug, Default)]
pub enum SouthboundError {
    #[error("service unavailable")]
    #[default]
    ServiceUnavailable,
    #[error("{0}")]
    Parse(#[from] ParseError),
    /// Connection reset, broken pipe or any other transport level failure.
    #[error("transport error: {0}")]
    Transport(String),
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    /// The owning connection was closed before the request could complete.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),
    #[error("ownership lost for device {0}")]
    OwnershipLost(String),
    #[error("device {0} is not owned by this node")]
    NotOwner(String),
    #[error("reconciliation conflict on {key}: {detail}")]
    ReconciliationConflict { key: String, detail: String },
    #[error("reconciliation error: {0}")]
    Reconciliation(String),
    /// The device rejected one of the operations of a transaction.
    #[error("operation {index} rejected by device: {detail}")]
    OperationFailed { index: usize, detail: String },
    #[error("store error: {0}")]
    Store(String),
    #[error("schema error: {0}")]
    Schema(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("{0}")]
    Config(#[from] ConfigError),
    #[error("{0}")]
    Json(#[from] SerdeJsonError),
    #[error("{0}")]
    Join(#[from] JoinError),
    #[error("{0}")]
    StdError(#[from] Box<dyn StdError + Send + Sync>),
    #[error("{0}")]
    Msg(String),
}

impl SouthboundError {
    /// Whether the error means the connection is gone and the invoker must stop.
    #[inline]
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            SouthboundError::Transport(_) | SouthboundError::Timeout(_)
        )
    }

    #[inline]
    pub fn closed(reason: impl Into<String>) -> Self {
        SouthboundError::ConnectionClosed(reason.into())
    }
}

impl From<String> for SouthboundError {
    #[inline]
    fn from(e: String) -> Self {
        SouthboundError::Msg(e)
    }
}

impl From<&str> for SouthboundError {
    #[inline]
    fn from(e: &str) -> Self {
        SouthboundError::Msg(e.to_string())
    }
}

impl From<&SouthboundError> for SouthboundError {
    #[inline]
    fn from(e: &SouthboundError) -> Self {
        SouthboundError::Msg(e.to_string())
    }
}
