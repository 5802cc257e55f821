//! Error types for the block store.
//!
//! Domain errors (`NotFound`, `NotPending`, `MatchNotFound`, `AlreadyExists`)
//! go back to the caller unmodified: they need a human or agent decision.
//! `Busy` may be retried internally a bounded number of times. `Corrupt` is
//! fatal for one block only.

use thiserror::Error;

use kioku_types::{BlockKey, LabelError, OperationError, ProposalId, ProposalStatus, VersionId};

use crate::diff::ApplyError;

/// Errors from store, proposal and workflow operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Block, version, or proposal does not exist under the given owner.
    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: String },

    /// Duplicate block creation.
    #[error("block already exists: {0}")]
    AlreadyExists(BlockKey),

    /// Approve called on a proposal that is no longer pending.
    #[error("proposal {id} is not pending (status: {status})")]
    NotPending { id: ProposalId, status: ProposalStatus },

    /// Status change out of a terminal state.
    #[error("invalid transition for proposal {id}: {from} -> {to}")]
    InvalidTransition {
        id: ProposalId,
        from: ProposalStatus,
        to: ProposalStatus,
    },

    /// `ReplaceSubstring` match text is absent from the current body.
    #[error("match text not found in current body of '{label}'")]
    MatchNotFound { label: String },

    /// Lock contention on a block.
    #[error("block {0} is busy, retry later")]
    Busy(BlockKey),

    /// Head moved between read and commit.
    #[error("head of {key} moved: expected {expected:?}, found {actual}")]
    HeadMoved {
        key: BlockKey,
        expected: Option<VersionId>,
        actual: VersionId,
    },

    /// Version chain invariant violated on read.
    #[error("version chain of {key} is corrupt: {detail}")]
    Corrupt { key: BlockKey, detail: String },

    #[error("invalid label: {0}")]
    InvalidLabel(#[from] LabelError),

    #[error("invalid operation: {0}")]
    InvalidOperation(#[from] OperationError),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

/// Coarse classification used by transports to pick a status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    MatchNotFound,
    Busy,
    InvalidInput,
    Corrupt,
    Storage,
}

impl StoreError {
    pub fn not_found(what: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            what,
            id: id.to_string(),
        }
    }

    pub fn block_not_found(key: &BlockKey) -> Self {
        Self::not_found("block", key)
    }

    pub fn proposal_not_found(id: ProposalId) -> Self {
        Self::not_found("proposal", id)
    }

    pub fn corrupt(key: &BlockKey, detail: impl Into<String>) -> Self {
        Self::Corrupt {
            key: key.clone(),
            detail: detail.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::NotFound { .. } => ErrorKind::NotFound,
            StoreError::AlreadyExists(_)
            | StoreError::NotPending { .. }
            | StoreError::InvalidTransition { .. } => ErrorKind::Conflict,
            StoreError::MatchNotFound { .. } => ErrorKind::MatchNotFound,
            StoreError::Busy(_) | StoreError::HeadMoved { .. } => ErrorKind::Busy,
            StoreError::InvalidLabel(_) | StoreError::InvalidOperation(_) => {
                ErrorKind::InvalidInput
            }
            StoreError::Corrupt { .. } => ErrorKind::Corrupt,
            StoreError::Database(_) => ErrorKind::Storage,
        }
    }

    /// Whether the approval loop should re-read the head and try again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Busy(_) | StoreError::HeadMoved { .. })
    }

    /// Attach the block label to a bare apply failure.
    pub fn from_apply(err: ApplyError, key: &BlockKey) -> Self {
        match err {
            ApplyError::MatchNotFound => StoreError::MatchNotFound {
                label: key.label.clone(),
            },
        }
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
