//! Error types for the router coordinator

use crate::info::StatementType;
use std::fmt;
use thiserror::Error;

/// Why a transaction was killed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// The process-default transaction timeout elapsed.
    Timeout,
    /// A timeout the client configured for this transaction elapsed.
    ClientConfiguredTimeout,
    /// An administrator killed the transaction.
    Killed,
    /// The cluster role of a member changed while the transaction was open.
    LeadershipChanged,
    /// The process is shutting down.
    ShuttingDown,
    /// A child transaction detected its own termination and signaled it.
    ChildSignaled,
}

impl TerminationReason {
    /// Stable classification code surfaced to clients and logs. The two
    /// timeout variants differ here, not in mechanics: one is the client's
    /// configuration, the other is the operator's.
    pub fn code(self) -> &'static str {
        match self {
            TerminationReason::Timeout => "Transaction.TransactionTimedOut",
            TerminationReason::ClientConfiguredTimeout => {
                "Transaction.TransactionTimedOutClientConfiguration"
            }
            TerminationReason::Killed => "Transaction.Terminated",
            TerminationReason::LeadershipChanged => "Transaction.LeaderSwitch",
            TerminationReason::ShuttingDown => "Transaction.Shutdown",
            TerminationReason::ChildSignaled => "Transaction.ChildTerminated",
        }
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = match self {
            TerminationReason::Timeout => "the transaction timed out",
            TerminationReason::ClientConfiguredTimeout => {
                "the client-configured transaction timeout elapsed"
            }
            TerminationReason::Killed => "the transaction was terminated by request",
            TerminationReason::LeadershipChanged => "a cluster leadership change occurred",
            TerminationReason::ShuttingDown => "the process is shutting down",
            TerminationReason::ChildSignaled => "a participating transaction was terminated",
        };
        write!(f, "{}", message)
    }
}

/// Immutable record of when and why a transaction was terminated. Written
/// exactly once, when the state leaves `Open` for `Terminated`.
#[derive(Debug, Clone, Copy)]
pub struct TerminationMark {
    pub reason: TerminationReason,
    /// Monotonic timestamp from the injected [`crate::clock::Clock`].
    pub at_nanos: u64,
}

/// Stable classification handed to the [`ErrorReporter`] alongside each
/// non-primary failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    CommitFailed,
    RollbackFailed,
    TerminationFailed,
    Terminated,
    StatementMix,
    Routing,
    Internal,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::CommitFailed => "Transaction.CommitFailed",
            ErrorCode::RollbackFailed => "Transaction.RollbackFailed",
            ErrorCode::TerminationFailed => "Transaction.TerminationFailed",
            ErrorCode::Terminated => "Transaction.Terminated",
            ErrorCode::StatementMix => "Statement.TypeMixNotAllowed",
            ErrorCode::Routing => "Routing.WriteTargetChanged",
            ErrorCode::Internal => "Internal.UnexpectedState",
        }
    }
}

/// Router coordinator error types
#[derive(Debug, Error)]
pub enum RouterError {
    /// One or more children failed during commit fan-out. The primary cause
    /// is the first failure encountered; the rest were reported through the
    /// [`ErrorReporter`] and kept here as suppressed causes.
    #[error("Failed to commit composite transaction")]
    CommitFailed {
        #[source]
        primary: Box<RouterError>,
        suppressed: Vec<RouterError>,
    },

    #[error("Failed to rollback composite transaction")]
    RollbackFailed {
        #[source]
        primary: Box<RouterError>,
        suppressed: Vec<RouterError>,
    },

    #[error("Failed to terminate composite transaction")]
    TerminationFailed {
        #[source]
        primary: Box<RouterError>,
        suppressed: Vec<RouterError>,
    },

    #[error("Tried to execute {next} after executing {recorded} in the same transaction")]
    ForbiddenStatementMix {
        recorded: StatementType,
        next: StatementType,
    },

    /// The write target's physical address changed mid-transaction for the
    /// same logical database. Transient: the transaction can be retried.
    #[error(
        "The leader of database `{database}` changed while the transaction was writing to it; \
         retry the transaction"
    )]
    LeaderSwitch { database: String },

    /// Attempted to write to a second, genuinely different database.
    #[error(
        "Writing to more than one database per transaction is not allowed; \
         already writing to `{current}`, attempted to write to `{attempted}`"
    )]
    MultiDatabaseWrite { current: String, attempted: String },

    #[error("{0}")]
    ClosedTransaction(String),

    #[error("The transaction has been terminated: {reason}")]
    Terminated { reason: TerminationReason },

    #[error("Invalid transaction state: {0}")]
    InvalidState(String),

    /// Failure surfaced by a child transaction implementation.
    #[error("Child transaction failed: {0}")]
    Child(String),

    #[error("{0}")]
    Other(String),
}

impl RouterError {
    /// Whether the whole transaction can be retried verbatim by the client.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RouterError::LeaderSwitch { .. })
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            RouterError::CommitFailed { .. } => ErrorCode::CommitFailed,
            RouterError::RollbackFailed { .. } => ErrorCode::RollbackFailed,
            RouterError::TerminationFailed { .. } => ErrorCode::TerminationFailed,
            RouterError::Terminated { .. } => ErrorCode::Terminated,
            RouterError::ForbiddenStatementMix { .. } => ErrorCode::StatementMix,
            RouterError::LeaderSwitch { .. } | RouterError::MultiDatabaseWrite { .. } => {
                ErrorCode::Routing
            }
            RouterError::ClosedTransaction(_)
            | RouterError::InvalidState(_)
            | RouterError::Child(_)
            | RouterError::Other(_) => ErrorCode::Internal,
        }
    }
}

/// Result type for coordinator operations
pub type Result<T> = std::result::Result<T, RouterError>;

/// Sink for failures that are not the primary cause of a raised error.
///
/// When a fan-out over children collects several failures, only the first one
/// travels up the call stack for the caller to log; every other failure is
/// handed to the reporter so nothing is silently dropped and nothing is
/// double-logged.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, message: &str, error: &RouterError, code: ErrorCode);
}

/// Reporter that routes through `tracing`.
#[derive(Debug, Default)]
pub struct LogErrorReporter;

impl ErrorReporter for LogErrorReporter {
    fn report(&self, message: &str, error: &RouterError, code: ErrorCode) {
        tracing::error!(code = code.as_str(), error = %error, "{message}");
    }
}
