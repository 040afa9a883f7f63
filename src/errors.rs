//! # Error Taxonomy
//!
//! All fallible operations in this crate return `eyre::Result` with context
//! attached via `wrap_err_with`, matching the rest of the storage layer. On
//! top of that, failures a caller may want to branch on carry a
//! [`StorageError`] as the report's source, so callers can distinguish a
//! retriable timeout from corruption:
//!
//! ```ignore
//! match env.wait_for_durable(id, timeout) {
//!     Ok(()) => {}
//!     Err(report) => match report.downcast_ref::<StorageError>() {
//!         Some(StorageError::Timeout { .. }) => retry(),
//!         _ => return Err(report),
//!     },
//! }
//! ```
//!
//! ## Categories
//!
//! - **Usage errors** (`InvalidArgument`): caller contract violations such as
//!   shrinking the pager. Fail synchronously, state unchanged.
//! - **Corruption** (`Corruption`): checksum mismatches, invalid page flags,
//!   broken structural invariants. Fatal for the affected transaction; a
//!   corrupt journal interior fails engine startup.
//! - **Resource exhaustion** (`DiskFull`, `TooManyTransactions`): surfaced to
//!   the writer, which rolls back; no partial state becomes visible.
//! - **Timeouts** (`Timeout`): durability waits never hang by default; the
//!   error carries the last transaction id known durable.
//! - **Version conflicts** (`Concurrency`): a guarded write found a version
//!   other than the one the caller expected. The write is not applied.

use crate::txn::TxnId;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("data corruption: {0}")]
    Corruption(String),

    #[error("timed out waiting for durability; last durable transaction is {last_durable}")]
    Timeout { last_durable: TxnId },

    #[error("out of disk space: {0}")]
    DiskFull(String),

    #[error("version conflict: expected {expected}, found {actual}")]
    Concurrency { expected: u64, actual: u64 },

    #[error("too many concurrent transactions (max {max})")]
    TooManyTransactions { max: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downcast_through_eyre_report() {
        let report: eyre::Report = StorageError::Timeout { last_durable: 7 }.into();

        match report.downcast_ref::<StorageError>() {
            Some(StorageError::Timeout { last_durable }) => assert_eq!(*last_durable, 7),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn messages_name_the_condition() {
        let err = StorageError::InvalidArgument("cannot shrink".into());
        assert!(err.to_string().contains("invalid argument"));

        let err = StorageError::DiskFull("/var/data".into());
        assert!(err.to_string().contains("disk"));
    }
}
