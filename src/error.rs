//! # Error Model
//!
//! stratadb propagates failures as `eyre::Result` throughout, with a typed
//! [`ErrorKind`] attached to every externally distinguishable outcome so
//! callers can branch on the kind instead of matching message strings.
//!
//! ## Kinds
//!
//! Every visible failure maps to exactly one kind:
//!
//! - `KeyNotFound` / `DatabaseNotFound`: the addressed item does not exist
//! - `DuplicateKey` / `DatabaseExists`: the item exists and the flags did
//!   not permit replacing it
//! - `InvalidArg`, `InvalidKeySize`, `InvalidRecordSize`: argument errors
//! - `LimitsReached`: a key/record layout refused to grow, or the file
//!   size limit was exceeded
//! - `TxnConflict`, `CursorStillOpen`, `WouldBlock`: concurrency conflicts
//! - `Io`: device read/write failure (fatal for the environment)
//! - `IntegrityViolated`: CRC mismatch, unknown journal entry type, or an
//!   inconsistent header (fatal)
//! - `OutOfMemory`, `NotImplemented`, `ReadOnly`, `Internal`
//!
//! ## Policy
//!
//! Recoverable kinds are handled where they occur (`LimitsReached` inside
//! b-tree erase triggers a split-and-retry). Conflicts and not-found pass
//! through to the caller unchanged. `Io` and `IntegrityViolated` flip the
//! environment to read-only; subsequent mutations fail with `ReadOnly`.
//!
//! Read-path absence is expressed as `Ok(None)`, not as an error.

use eyre::Report;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ErrorKind {
    #[error("key not found")]
    KeyNotFound,
    #[error("database not found")]
    DatabaseNotFound,
    #[error("duplicate key")]
    DuplicateKey,
    #[error("database already exists")]
    DatabaseExists,
    #[error("invalid argument")]
    InvalidArg,
    #[error("invalid key size")]
    InvalidKeySize,
    #[error("invalid record size")]
    InvalidRecordSize,
    #[error("limits reached")]
    LimitsReached,
    #[error("transaction conflict")]
    TxnConflict,
    #[error("cursor still open")]
    CursorStillOpen,
    #[error("operation would block")]
    WouldBlock,
    #[error("device i/o error")]
    Io,
    #[error("integrity violated")]
    IntegrityViolated,
    #[error("out of memory")]
    OutOfMemory,
    #[error("operation not implemented for this device")]
    NotImplemented,
    #[error("environment is read-only")]
    ReadOnly,
    #[error("internal error")]
    Internal,
}

/// Returns the typed kind attached to a report, if any.
pub fn kind_of(report: &Report) -> Option<ErrorKind> {
    report.downcast_ref::<ErrorKind>().copied()
}

/// True if the report carries exactly this kind.
pub fn is_kind(report: &Report, kind: ErrorKind) -> bool {
    kind_of(report) == Some(kind)
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::WrapErr;

    #[test]
    fn kind_survives_downcast() {
        let report = Report::new(ErrorKind::TxnConflict);
        assert_eq!(kind_of(&report), Some(ErrorKind::TxnConflict));
        assert!(is_kind(&report, ErrorKind::TxnConflict));
        assert!(!is_kind(&report, ErrorKind::KeyNotFound));
    }

    #[test]
    fn kind_survives_context_wrapping() {
        let result: eyre::Result<()> =
            Err(Report::new(ErrorKind::LimitsReached)).wrap_err("while splitting leaf");
        let report = result.unwrap_err();
        assert_eq!(kind_of(&report), Some(ErrorKind::LimitsReached));
    }

    #[test]
    fn foreign_report_has_no_kind() {
        let report = eyre::eyre!("plain message");
        assert_eq!(kind_of(&report), None);
    }
}
