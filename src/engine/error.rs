use std::io;

use ulid::Ulid;

use crate::model::ItemStatus;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("user {0} is not allowed to do this")]
    Forbidden(Ulid),
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    #[error("conflict with booking: {0}")]
    Conflict(Ulid),
    #[error("duplicate of pending request: {0}")]
    DuplicateActiveRequest(Ulid),
    #[error("invalid request: {0}")]
    InvalidRequest(&'static str),
    #[error("item {item} is not available ({status})")]
    ItemUnavailable { item: Ulid, status: ItemStatus },
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    /// Persistence failure. The I/O detail stays on `source` and out of the message.
    #[error("internal storage error during {op}")]
    Storage {
        op: &'static str,
        #[source]
        source: io::Error,
    },
}

impl EngineError {
    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::Forbidden(_) => "forbidden",
            EngineError::InvalidState(_) => "invalid_state",
            EngineError::Conflict(_) => "conflict",
            EngineError::DuplicateActiveRequest(_) => "duplicate",
            EngineError::InvalidRequest(_) => "invalid_request",
            EngineError::ItemUnavailable { .. } => "item_unavailable",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::Storage { .. } => "storage",
        }
    }

    pub(crate) fn storage(op: &'static str, source: io::Error) -> Self {
        EngineError::Storage { op, source }
    }
}
