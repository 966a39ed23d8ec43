use crate::model::Status;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum LedgerError {
    #[error("incorrect arguments, expecting {expected} args: {fields}")]
    ArgumentCount { expected: usize, fields: String },
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("inconsistent dataset: {0}")]
    InconsistentDataset(String),
    #[error("unknown parent model: {0}")]
    UnknownParentModel(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("invalid transition: not possible to change status from {from} to {to}")]
    InvalidTransition { from: Status, to: Status },
    #[error("log too large: {size} bytes exceeds the maximum of {max}")]
    LogTooLarge { size: usize, max: usize },
    #[error("index consistency error: {0}")]
    IndexConsistency(String),
    #[error("ledger write failure: {0}")]
    LedgerWriteFailure(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl LedgerError {
    /// Stable machine-readable code carried in error envelopes.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::ArgumentCount { .. } => "ledger.argument_count",
            Self::InvalidIdentifier(_) => "ledger.invalid_identifier",
            Self::AlreadyExists(_) => "ledger.already_exists",
            Self::NotFound(_) => "ledger.not_found",
            Self::InconsistentDataset(_) => "ledger.inconsistent_dataset",
            Self::UnknownParentModel(_) => "ledger.unknown_parent_model",
            Self::Unauthorized(_) => "ledger.unauthorized",
            Self::InvalidTransition { .. } => "ledger.invalid_transition",
            Self::LogTooLarge { .. } => "ledger.log_too_large",
            Self::IndexConsistency(_) => "ledger.index_consistency",
            Self::LedgerWriteFailure(_) => "ledger.write_failure",
            Self::InvalidArgument(_) => "ledger.invalid_argument",
            Self::Configuration(_) => "ledger.configuration",
        }
    }

    /// True when the failure may have happened after writes were issued, so the
    /// enclosing transaction must be aborted rather than merely reported.
    #[must_use]
    pub fn may_leave_inconsistent(&self) -> bool {
        matches!(
            self,
            Self::IndexConsistency(_) | Self::LedgerWriteFailure(_)
        )
    }

    pub(crate) fn argument_count(fields: &[&str]) -> Self {
        Self::ArgumentCount {
            expected: fields.len(),
            fields: fields.join(", "),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(
            LedgerError::AlreadyExists("x".to_string()).code(),
            "ledger.already_exists"
        );
        assert_eq!(
            LedgerError::InvalidTransition {
                from: Status::Done,
                to: Status::Training,
            }
            .code(),
            "ledger.invalid_transition"
        );
        assert_eq!(
            LedgerError::LedgerWriteFailure("disk".to_string()).code(),
            "ledger.write_failure"
        );
    }

    #[test]
    fn only_index_and_write_failures_flag_inconsistency() {
        assert!(LedgerError::IndexConsistency("x".to_string()).may_leave_inconsistent());
        assert!(LedgerError::LedgerWriteFailure("x".to_string()).may_leave_inconsistent());
        assert!(!LedgerError::NotFound("x".to_string()).may_leave_inconsistent());
        assert!(!LedgerError::Unauthorized("x".to_string()).may_leave_inconsistent());
        assert!(!LedgerError::LogTooLarge { size: 3, max: 2 }.may_leave_inconsistent());
    }

    #[test]
    fn argument_count_names_expected_fields() {
        let err = LedgerError::argument_count(&["hashes", "datasetKey", "testOnly"]);
        assert_eq!(
            err.to_string(),
            "incorrect arguments, expecting 3 args: hashes, datasetKey, testOnly"
        );
    }
}
