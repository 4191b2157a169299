//! Error types and the per-tick accumulation sink (spec §7, §9).

use std::net::SocketAddr;

use thiserror::Error;

use crate::rdma::CmErrorKind;

/// Errors surfaced by individual reactor handlers.
#[derive(Debug, Error)]
pub enum ReaderError {
    #[error("CM error on {addr}: {kind:?}")]
    Cm { addr: SocketAddr, kind: CmErrorKind },

    #[error("verbs error: {0}")]
    Verbs(String),

    #[error("setup failed: {0}")]
    Setup(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A single accumulated error record, carrying enough context to end up in
/// the final `End` message's `syserr_desc` (spec §7).
#[derive(Debug)]
pub struct ErrorRecord {
    pub description: String,
}

impl ErrorRecord {
    pub fn new(err: impl std::fmt::Display) -> ErrorRecord {
        ErrorRecord {
            description: err.to_string(),
        }
    }
}

/// The single sink errors accumulate into during a tick (spec §9, "Error-record
/// list threaded through every call"). A non-empty sink at end-of-tick forces
/// the reactor from `run` into `quit` (spec §4.1).
#[derive(Debug, Default)]
pub struct ErrorSink {
    records: Vec<ErrorRecord>,
}

impl ErrorSink {
    pub fn new() -> ErrorSink {
        ErrorSink::default()
    }

    pub fn push(&mut self, err: impl std::fmt::Display) {
        error!("{}", err);
        self.records.push(ErrorRecord::new(err));
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn take(&mut self) -> Vec<ErrorRecord> {
        std::mem::take(&mut self.records)
    }

    /// Concatenates accumulated descriptions for the final `End` message.
    pub fn describe(records: &[ErrorRecord]) -> String {
        records
            .iter()
            .map(|r| r.description.as_str())
            .collect::<Vec<_>>()
            .join("; ")
    }
}
