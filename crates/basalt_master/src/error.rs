//! Error types for catalog mutations and tablet-server RPCs.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::catalog::{LeaderTerm, SchemaVersion, TableId};
use crate::clock::HybridTime;

/// Errors raised by catalog mutations.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// Another actor already advanced the schema past the version the caller
    /// expected. Treated as "someone else did it" by the sweep.
    #[error("table {table_id}: schema already at version {actual}, expected {expected}")]
    VersionMismatch {
        table_id: TableId,
        expected: SchemaVersion,
        actual: SchemaVersion,
    },

    /// The sys catalog rejected a write stamped with a stale leader term.
    #[error("catalog write fenced: term {submitted} is stale (highest accepted {accepted})")]
    LeaderChanged {
        submitted: LeaderTerm,
        accepted: LeaderTerm,
    },

    #[error("table {0} not found")]
    TableNotFound(TableId),

    /// A backfill is already running for the indexed table.
    #[error("a backfill is already in progress for table {0}")]
    BackfillInProgress(TableId),
}

impl CatalogError {
    /// True when the error means another actor already performed the step,
    /// so the caller should return without retrying.
    pub fn is_benign_race(&self) -> bool {
        matches!(self, CatalogError::VersionMismatch { .. })
    }
}

/// Error codes a tablet server attaches to a failed admin RPC.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TabletServerErrorCode {
    TabletNotFound,
    MismatchedSchema,
    TabletHasANewerSchema,
    OperationNotSupported,
    /// Timeouts, refused connections, and other delivery failures.
    TransportError,
    Unknown,
}

impl TabletServerErrorCode {
    /// Fatal codes are never retried; they fail the whole backfill.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            TabletServerErrorCode::TabletNotFound
                | TabletServerErrorCode::MismatchedSchema
                | TabletServerErrorCode::TabletHasANewerSchema
                | TabletServerErrorCode::OperationNotSupported
        )
    }
}

/// A failed tablet-server RPC.
#[derive(Clone, Debug, Error)]
#[error("tablet server error ({code:?}): {message}")]
pub struct TabletServerError {
    pub code: TabletServerErrorCode,
    pub message: String,
    /// Clock reading carried on the error response, when the server got far
    /// enough to stamp one.
    pub propagated_hybrid_time: Option<HybridTime>,
}

impl TabletServerError {
    pub fn new(code: TabletServerErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            propagated_hybrid_time: None,
        }
    }

    pub fn timed_out(what: &str) -> Self {
        Self::new(
            TabletServerErrorCode::TransportError,
            format!("{what} timed out"),
        )
    }
}
