//! Error types for rewind operations.
//!
//! Every variant carries the identifiers (branch, turn, logical key, namespace)
//! needed by the caller to decide whether to retry, fork a new branch, or abort.
//! Errors fall into four classes, see [`ErrorClass`].

use std::time::Duration;

use thiserror::Error;

use crate::types::{BranchId, TurnId, TurnStatus};

/// Result type alias for rewind operations.
pub type RewindResult<T> = Result<T, RewindError>;

/// Main error type for all rewind operations.
#[derive(Error, Debug)]
pub enum RewindError {
    /// Fork point lies past the parent's turn counter.
    #[error("Invalid fork point: turn index {fork_turn_index} on branch {parent_branch_id} (turn counter {turn_counter})")]
    InvalidForkPoint {
        parent_branch_id: BranchId,
        fork_turn_index: i64,
        turn_counter: i64,
    },

    /// The branch already has a STAGED turn.
    #[error("Branch {branch_id} already has staged turn {staged_turn_id}")]
    TurnAlreadyStaged {
        branch_id: BranchId,
        staged_turn_id: TurnId,
    },

    /// The turn is not in the state the operation requires.
    #[error("Turn {turn_id} is {status}, expected {expected}")]
    InvalidTurnState {
        turn_id: TurnId,
        status: TurnStatus,
        expected: TurnStatus,
    },

    /// A conditional ledger update lost a race. Retried internally.
    #[error("Conflicting update on branch {branch_id}")]
    Conflict { branch_id: BranchId },

    /// Conditional updates kept conflicting after every retry.
    #[error("Turn contention on branch {branch_id} after {attempts} attempts")]
    TurnContention { branch_id: BranchId, attempts: usize },

    /// Branch not found.
    #[error("Branch not found: {branch_id}")]
    BranchNotFound { branch_id: BranchId },

    /// Turn not found.
    #[error("Turn not found: {turn_id}")]
    TurnNotFound { turn_id: TurnId },

    /// The branch lineage loops back on itself.
    #[error("Corrupt ancestry for branch {branch_id}: {message}")]
    CorruptAncestry { branch_id: BranchId, message: String },

    /// A turn references a branch that does not exist.
    #[error("Turn {turn_id} references missing branch {branch_id}")]
    OrphanedTurn { turn_id: TurnId, branch_id: BranchId },

    /// Writes are refused until the branch is repaired.
    #[error("Branch {branch_id} is quarantined after an invariant violation")]
    BranchQuarantined { branch_id: BranchId },

    /// The namespace was used before it was created.
    #[error("Namespace not found: {namespace}")]
    NamespaceNotFound { namespace: String },

    /// Two writes for the same logical key in one turn.
    #[error("Duplicate logical key '{logical_key}' in turn {turn_id} of namespace {namespace}")]
    DuplicateLogicalKeyInTurn {
        namespace: String,
        logical_key: String,
        turn_id: TurnId,
    },

    /// Predicate cannot be executed by the target backend.
    #[error("Unsupported predicate for namespace {namespace}: {message}")]
    UnsupportedPredicate { namespace: String, message: String },

    /// Field is not part of the registered schema.
    #[error("Unknown field '{field}' in namespace {namespace}")]
    UnknownField { namespace: String, field: String },

    /// The repo cursor points at a historical turn.
    #[error("Repo is detached at turn {turn_id} of branch {branch_id}; writes are not allowed")]
    DetachedRepo { branch_id: BranchId, turn_id: TurnId },

    /// Input validation failed.
    #[error("Validation error: {message}")]
    Validation {
        message: String,
        code: ErrorCode,
        suggestion: Option<String>,
    },

    /// Backend could not be reached. Retryable by the caller.
    #[error("Backend unavailable: {message}")]
    BackendUnavailable {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The operation did not finish within the configured timeout.
    #[error("Operation '{operation}' timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    /// Database operation failed.
    #[error("Database error: {message}")]
    Database {
        message: String,
        code: ErrorCode,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Error codes for programmatic handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    // Validation (VAL_xxx)
    ValInvalidInput,
    ValInvalidForkPoint,
    ValDuplicateKey,
    ValUnsupportedPredicate,
    ValUnknownField,
    ValMissingKey,
    ValDetachedRepo,
    ValInvalidSchema,

    // Ledger (LEDGER_xxx)
    LedgerTurnAlreadyStaged,
    LedgerInvalidTurnState,
    LedgerConflict,
    LedgerContention,
    LedgerBranchNotFound,
    LedgerTurnNotFound,
    LedgerBranchQuarantined,

    // Store (STORE_xxx)
    StoreNamespaceNotFound,
    StoreUnavailable,
    StoreTimeout,

    // Database (DB_xxx)
    DbConnectionFailed,
    DbOperationFailed,

    // Corruption (CORRUPT_xxx)
    CorruptAncestry,
    CorruptOrphanedTurn,

    Configuration,
    Internal,
}

impl ErrorCode {
    /// Get the string representation of the error code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ValInvalidInput => "VAL_001",
            ErrorCode::ValInvalidForkPoint => "VAL_002",
            ErrorCode::ValDuplicateKey => "VAL_003",
            ErrorCode::ValUnsupportedPredicate => "VAL_004",
            ErrorCode::ValUnknownField => "VAL_005",
            ErrorCode::ValMissingKey => "VAL_006",
            ErrorCode::ValDetachedRepo => "VAL_007",
            ErrorCode::ValInvalidSchema => "VAL_008",
            ErrorCode::LedgerTurnAlreadyStaged => "LEDGER_001",
            ErrorCode::LedgerInvalidTurnState => "LEDGER_002",
            ErrorCode::LedgerConflict => "LEDGER_003",
            ErrorCode::LedgerContention => "LEDGER_004",
            ErrorCode::LedgerBranchNotFound => "LEDGER_005",
            ErrorCode::LedgerTurnNotFound => "LEDGER_006",
            ErrorCode::LedgerBranchQuarantined => "LEDGER_007",
            ErrorCode::StoreNamespaceNotFound => "STORE_001",
            ErrorCode::StoreUnavailable => "STORE_002",
            ErrorCode::StoreTimeout => "STORE_003",
            ErrorCode::DbConnectionFailed => "DB_001",
            ErrorCode::DbOperationFailed => "DB_002",
            ErrorCode::CorruptAncestry => "CORRUPT_001",
            ErrorCode::CorruptOrphanedTurn => "CORRUPT_002",
            ErrorCode::Configuration => "CFG_001",
            ErrorCode::Internal => "INT_001",
        }
    }
}

/// Broad handling class of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Rejected synchronously, never retried.
    Validation,
    /// Concurrent mutation of the same branch.
    Contention,
    /// Timeout or unavailable backend; the caller may retry.
    Transient,
    /// Invariant violation; the affected branch stops accepting writes.
    Corruption,
    /// Everything else (IO, serialization, internal).
    Other,
}

impl RewindError {
    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            code: ErrorCode::ValInvalidInput,
            suggestion: None,
        }
    }

    /// Create a validation error with a specific code.
    pub fn validation_code(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            code,
            suggestion: None,
        }
    }

    /// Create a validation error with suggestion.
    pub fn validation_with_suggestion(
        message: impl Into<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::Validation {
            message: message.into(),
            code: ErrorCode::ValInvalidInput,
            suggestion: Some(suggestion.into()),
        }
    }

    /// Create a database error.
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database {
            message: message.into(),
            code: ErrorCode::DbOperationFailed,
            source: None,
        }
    }

    /// Create a backend-unavailable error.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::BackendUnavailable {
            message: message.into(),
            source: None,
        }
    }

    /// Create an unsupported-predicate error.
    pub fn unsupported(namespace: impl Into<String>, message: impl Into<String>) -> Self {
        Self::UnsupportedPredicate {
            namespace: namespace.into(),
            message: message.into(),
        }
    }

    /// Get the error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidForkPoint { .. } => ErrorCode::ValInvalidForkPoint,
            Self::TurnAlreadyStaged { .. } => ErrorCode::LedgerTurnAlreadyStaged,
            Self::InvalidTurnState { .. } => ErrorCode::LedgerInvalidTurnState,
            Self::Conflict { .. } => ErrorCode::LedgerConflict,
            Self::TurnContention { .. } => ErrorCode::LedgerContention,
            Self::BranchNotFound { .. } => ErrorCode::LedgerBranchNotFound,
            Self::TurnNotFound { .. } => ErrorCode::LedgerTurnNotFound,
            Self::CorruptAncestry { .. } => ErrorCode::CorruptAncestry,
            Self::OrphanedTurn { .. } => ErrorCode::CorruptOrphanedTurn,
            Self::BranchQuarantined { .. } => ErrorCode::LedgerBranchQuarantined,
            Self::NamespaceNotFound { .. } => ErrorCode::StoreNamespaceNotFound,
            Self::DuplicateLogicalKeyInTurn { .. } => ErrorCode::ValDuplicateKey,
            Self::UnsupportedPredicate { .. } => ErrorCode::ValUnsupportedPredicate,
            Self::UnknownField { .. } => ErrorCode::ValUnknownField,
            Self::DetachedRepo { .. } => ErrorCode::ValDetachedRepo,
            Self::Validation { code, .. } => *code,
            Self::BackendUnavailable { .. } => ErrorCode::StoreUnavailable,
            Self::Timeout { .. } => ErrorCode::StoreTimeout,
            Self::Database { code, .. } => *code,
            Self::Configuration(_) => ErrorCode::Configuration,
            _ => ErrorCode::Internal,
        }
    }

    /// Classify the error for retry and quarantine decisions.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::InvalidForkPoint { .. }
            | Self::TurnAlreadyStaged { .. }
            | Self::InvalidTurnState { .. }
            | Self::BranchNotFound { .. }
            | Self::TurnNotFound { .. }
            | Self::BranchQuarantined { .. }
            | Self::NamespaceNotFound { .. }
            | Self::DuplicateLogicalKeyInTurn { .. }
            | Self::UnsupportedPredicate { .. }
            | Self::UnknownField { .. }
            | Self::DetachedRepo { .. }
            | Self::Validation { .. } => ErrorClass::Validation,
            Self::Conflict { .. } | Self::TurnContention { .. } => ErrorClass::Contention,
            Self::BackendUnavailable { .. } | Self::Timeout { .. } => ErrorClass::Transient,
            Self::CorruptAncestry { .. } | Self::OrphanedTurn { .. } => ErrorClass::Corruption,
            _ => ErrorClass::Other,
        }
    }

    /// Whether the caller may retry the operation as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::BackendUnavailable { .. } | Self::Timeout { .. } | Self::TurnContention { .. }
        )
    }

    /// Whether the error reports a broken invariant.
    pub fn is_fatal(&self) -> bool {
        self.class() == ErrorClass::Corruption
    }

    /// Get a user-friendly suggestion for resolving this error.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::TurnAlreadyStaged { .. } => {
                Some("Commit or revert the staged turn before opening a new one")
            }
            Self::InvalidForkPoint { .. } => {
                Some("Fork at or before the parent's current turn counter")
            }
            Self::NamespaceNotFound { .. } => Some("Register the model before using it"),
            Self::DetachedRepo { .. } => Some("Check out a branch tip or fork a new branch"),
            Self::BranchQuarantined { .. } => {
                Some("Repair the branch lineage and release the quarantine")
            }
            Self::Validation { suggestion, .. } => suggestion.as_deref(),
            _ => None,
        }
    }

    /// Branch the error is about, if any.
    pub fn branch_id(&self) -> Option<BranchId> {
        match self {
            Self::InvalidForkPoint {
                parent_branch_id, ..
            } => Some(*parent_branch_id),
            Self::TurnAlreadyStaged { branch_id, .. }
            | Self::Conflict { branch_id }
            | Self::TurnContention { branch_id, .. }
            | Self::BranchNotFound { branch_id }
            | Self::CorruptAncestry { branch_id, .. }
            | Self::OrphanedTurn { branch_id, .. }
            | Self::BranchQuarantined { branch_id }
            | Self::DetachedRepo { branch_id, .. } => Some(*branch_id),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for RewindError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode as SqliteCode;

        let code = match &err {
            rusqlite::Error::SqliteFailure(e, _)
                if matches!(
                    e.code,
                    SqliteCode::DatabaseBusy | SqliteCode::DatabaseLocked
                ) =>
            {
                return Self::BackendUnavailable {
                    message: err.to_string(),
                    source: Some(Box::new(err)),
                };
            }
            rusqlite::Error::SqliteFailure(e, _) if e.code == SqliteCode::CannotOpen => {
                ErrorCode::DbConnectionFailed
            }
            _ => ErrorCode::DbOperationFailed,
        };

        Self::Database {
            message: err.to_string(),
            code,
            source: Some(Box::new(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error() {
        let err = RewindError::validation("Invalid input");
        assert_eq!(err.code(), ErrorCode::ValInvalidInput);
        assert_eq!(err.class(), ErrorClass::Validation);
        assert!(err.to_string().contains("Invalid input"));
    }

    #[test]
    fn test_error_carries_identifiers() {
        let err = RewindError::TurnAlreadyStaged {
            branch_id: BranchId(3),
            staged_turn_id: TurnId(9),
        };
        assert_eq!(err.branch_id(), Some(BranchId(3)));
        assert!(err.to_string().contains('9'));
        assert!(err.suggestion().is_some());
    }

    #[test]
    fn test_classes() {
        let timeout = RewindError::Timeout {
            operation: "scan",
            timeout: Duration::from_millis(10),
        };
        assert!(timeout.is_retryable());
        assert_eq!(timeout.class(), ErrorClass::Transient);

        let cycle = RewindError::CorruptAncestry {
            branch_id: BranchId(1),
            message: "cycle".into(),
        };
        assert!(cycle.is_fatal());
        assert!(!cycle.is_retryable());

        let contention = RewindError::TurnContention {
            branch_id: BranchId(1),
            attempts: 5,
        };
        assert_eq!(contention.class(), ErrorClass::Contention);
    }

    fn sqlite_failure(code: std::os::raw::c_int) -> rusqlite::Error {
        rusqlite::Error::SqliteFailure(rusqlite::ffi::Error::new(code), None)
    }

    #[test]
    fn test_busy_and_locked_are_unavailable() {
        for code in [rusqlite::ffi::SQLITE_BUSY, rusqlite::ffi::SQLITE_LOCKED] {
            let err = RewindError::from(sqlite_failure(code));
            assert!(matches!(err, RewindError::BackendUnavailable { .. }));
            assert!(err.is_retryable());
            assert!(!err.is_fatal());
            assert_eq!(err.code(), ErrorCode::StoreUnavailable);
            assert_eq!(err.class(), ErrorClass::Transient);
        }

        let cant_open = RewindError::from(sqlite_failure(rusqlite::ffi::SQLITE_CANTOPEN));
        assert_eq!(cant_open.code(), ErrorCode::DbConnectionFailed);
        assert!(!cant_open.is_retryable());

        let other = RewindError::from(rusqlite::Error::QueryReturnedNoRows);
        assert_eq!(other.code(), ErrorCode::DbOperationFailed);
    }

    #[test]
    fn test_locked_database_file_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("busy.db");

        let holder = rusqlite::Connection::open(&path).unwrap();
        holder
            .execute_batch("CREATE TABLE t (x INTEGER); BEGIN EXCLUSIVE;")
            .unwrap();

        let writer = rusqlite::Connection::open(&path).unwrap();
        writer.busy_timeout(Duration::ZERO).unwrap();
        let err: RewindError = writer
            .execute("INSERT INTO t (x) VALUES (1)", [])
            .unwrap_err()
            .into();
        assert!(matches!(err, RewindError::BackendUnavailable { .. }));
        assert!(err.is_retryable());

        holder.execute_batch("COMMIT;").unwrap();
        writer.execute("INSERT INTO t (x) VALUES (1)", []).unwrap();
    }

    #[test]
    fn test_error_code_as_str() {
        assert_eq!(ErrorCode::ValInvalidForkPoint.as_str(), "VAL_002");
        assert_eq!(ErrorCode::LedgerContention.as_str(), "LEDGER_004");
    }
}
