// SPDX-FileCopyrightText: 2023 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Per-module error taxonomy. Each boundary owns its own enum; these are
//! folded into `{status, data}` only at the outermost JSON-emitting
//! boundary (see [`crate::connection::frame::Status`]).

use thiserror::Error;

/// Errors raised by the store adapter (§4.1).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// `put` with `ifAbsent` found an existing item at the sort key.
    #[error("conflict: item already present")]
    Conflict,
    /// `get`/`range` found nothing at the requested key.
    #[error("not found")]
    NotFound,
    /// A conditional write inside a `batch` failed its precondition.
    #[error("condition failed")]
    ConditionFailed,
    /// A `batch` could not be applied atomically due to concurrent writers.
    #[error("transaction conflict")]
    TxConflict,
    /// The underlying store is unreachable or errored.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Errors raised while appending to, opening, or bundling a transaction log
/// (§4.4).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LogError {
    /// `Insert` of a key that is already live, or `Update`/`Delete` of a key
    /// that is not live (§3 transaction invariants).
    #[error("item key invariant violated")]
    KeyInvariantViolated,
    /// A record, once framed, would exceed the 400 KiB per-record ceiling.
    #[error("record too large")]
    RecordTooLarge,
    /// A `BatchTransaction` requested more than the configured batch size
    /// ceiling.
    #[error("batch too large")]
    BatchTooLarge,
    /// Every retry attempt to allocate a free seqNo collided.
    #[error("service unavailable after seqNo retries exhausted")]
    ServiceUnavailable,
    /// A bundle publish named a `seqNo` at or below the current bundle, or
    /// above the current max seqNo.
    #[error("bundle seqNo out of range")]
    InvalidBundleSeqNo,
    /// `reopenAtSeqNo` was below the current bundle's seqNo, so replay from
    /// that point is no longer possible.
    #[error("reopen seqNo precedes retained bundle")]
    SeqNoBelowBundle,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors raised by the session registry (§4.2).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("connection not found")]
    NotFound,
}

/// Errors raised by the connection core's action dispatch (§4.3, §7).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ActionError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden")]
    Forbidden,
    #[error("not found")]
    NotFound,
    #[error("too many requests")]
    TooManyRequests,
    #[error("internal error: {0}")]
    Internal(String),
    #[error("service unavailable")]
    ServiceUnavailable,
    #[error("gateway timeout")]
    GatewayTimeout,
}

impl From<LogError> for ActionError {
    fn from(err: LogError) -> Self {
        match err {
            LogError::KeyInvariantViolated => {
                ActionError::BadRequest("item key invariant violated".into())
            }
            LogError::RecordTooLarge => ActionError::BadRequest("record too large".into()),
            LogError::BatchTooLarge => ActionError::BadRequest("batch too large".into()),
            LogError::InvalidBundleSeqNo => {
                ActionError::BadRequest("bundle seqNo out of range".into())
            }
            LogError::SeqNoBelowBundle => {
                ActionError::BadRequest("reopen seqNo precedes retained bundle".into())
            }
            LogError::ServiceUnavailable => ActionError::ServiceUnavailable,
            LogError::Store(StoreError::Unavailable(_)) => ActionError::ServiceUnavailable,
            LogError::Store(_) => ActionError::Internal("store error".into()),
        }
    }
}

/// Errors raised by the user directory (§4.7).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("username already taken")]
    UsernameTaken,
    #[error("user not found")]
    UserNotFound,
    #[error("session not found")]
    SessionNotFound,
    #[error("session invalidated")]
    SessionInvalidated,
}

impl From<DirectoryError> for ActionError {
    fn from(err: DirectoryError) -> Self {
        match err {
            DirectoryError::UsernameTaken => ActionError::BadRequest("username taken".into()),
            DirectoryError::UserNotFound
            | DirectoryError::SessionNotFound
            | DirectoryError::SessionInvalidated => ActionError::Unauthorized,
        }
    }
}
