//! Error taxonomy shared by every stage of a GC pass.
//!
//! Each error carries a [`Severity`]: recoverable errors are logged and the
//! offending record or batch is skipped, fatal errors end the run.

use std::io;
use thiserror::Error;

/// How far an error is allowed to propagate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Skip the record or batch and keep streaming.
    Recoverable,
    /// Stop the whole pass; output already written must be discarded.
    Fatal,
}

#[derive(Debug, Error)]
pub enum GcError {
    #[error("line {line}: {reason}")]
    MalformedRecord { line: u64, reason: String },
    #[error("dropping batch for upload `{upload_id}`: {reason}")]
    InvalidBatch { upload_id: String, reason: String },
    #[error("{operation} failed: {message}")]
    External { operation: String, message: String },
    #[error("input is not sorted: `{current}` follows `{previous}`")]
    OutOfOrder { previous: String, current: String },
    #[error("upload `{upload_id}` reappeared after its batch was closed")]
    UploadReappeared { upload_id: String },
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type GcResult<T> = Result<T, GcError>;

impl GcError {
    /// Shortcut for a per-line decode or parse failure.
    pub fn malformed(line: u64, reason: impl Into<String>) -> Self {
        Self::MalformedRecord {
            line,
            reason: reason.into(),
        }
    }

    /// Shortcut for a batch that failed verification.
    pub fn invalid_batch(upload_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidBatch {
            upload_id: upload_id.into(),
            reason: reason.into(),
        }
    }

    pub fn external(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::External {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            GcError::MalformedRecord { .. }
            | GcError::InvalidBatch { .. }
            | GcError::External { .. } => Severity::Recoverable,
            GcError::OutOfOrder { .. } | GcError::UploadReappeared { .. } | GcError::Io(_) => {
                Severity::Fatal
            }
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Fatal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integrity_faults_are_fatal() {
        let err = GcError::UploadReappeared {
            upload_id: "abc".into(),
        };
        assert!(err.is_fatal());
        let err = GcError::OutOfOrder {
            previous: "b".into(),
            current: "a".into(),
        };
        assert_eq!(err.severity(), Severity::Fatal);
    }

    #[test]
    fn record_and_batch_errors_are_recoverable() {
        assert!(!GcError::malformed(3, "bad json").is_fatal());
        assert!(!GcError::invalid_batch("u", "two finalizing records").is_fatal());
        assert!(!GcError::external("unlink", "503").is_fatal());
        assert_eq!(GcError::malformed(7, "oops").to_string(), "line 7: oops");
    }
}
