//! Coordinator for client transactions that span multiple backends
//!
//! A client sees one logical transaction; underneath, its statements may
//! touch several independently-transacted locations: local graph partitions
//! and remote peers or shards. This crate coordinates the child transactions
//! those locations require, presenting commit/rollback/termination semantics
//! with three hard guarantees:
//!
//! - at most one child ever writes,
//! - every child is closed exactly once, whatever the outcome,
//! - a write is never finalized behind a read whose outcome is in doubt.
//!
//! All of it has to hold while termination can arrive from any thread at any
//! time: a timeout sweep, an administrative kill, or a cluster role change.
//! The [`transaction::RouterTransaction`] is driven by a single statement
//! execution thread; [`transaction::RouterTransaction::mark_for_termination`]
//! is the one sanctioned cross-thread entry point.
//!
//! The [`registry::TransactionRegistry`] tracks live transactions and maps
//! low-level local engine handles back to their owners; the
//! [`monitor::TimeoutMonitor`] supervises deadlines and classifies breaches
//! by whether the client or the process configured the timeout.
//!
//! What a child transaction is — how it reaches its backend, how it makes
//! its effects durable — is behind the [`child::ChildTransaction`] trait;
//! this crate only consumes the coordination capability.

pub mod child;
pub mod clock;
pub mod error;
pub mod info;
pub mod location;
pub mod monitor;
pub mod registry;
pub mod transaction;

pub use child::{
    BookmarkManager, ChildTerminationCallback, ChildTransaction, ChildTransactionFactories,
    ChildTransactionFactory, LocalHandle, LocationService, TransactionMode,
};
pub use clock::{Clock, SystemClock};
pub use error::{
    ErrorCode, ErrorReporter, LogErrorReporter, Result, RouterError, TerminationMark,
    TerminationReason,
};
pub use info::{StatementType, TransactionInfo};
pub use location::{DatabaseRef, Location, RemoteAddress};
pub use monitor::{MonitoredTransaction, TimeoutMonitor, TransactionTimeout};
pub use registry::TransactionRegistry;
pub use transaction::{RouterTransaction, TransactionId, TransactionStatus};
