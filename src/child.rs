//! Child transaction capability and the factories that produce them
//!
//! A child transaction is one backend's transaction handle, owned by exactly
//! one [`RouterTransaction`](crate::transaction::RouterTransaction). The
//! coordinator consumes the capability defined here; how a child achieves
//! durability or isolation is its own engine's business.

use crate::error::{Result, TerminationReason};
use crate::info::TransactionInfo;
use crate::location::Location;
use std::sync::Arc;

/// Opaque handle identifying a local storage-engine transaction. Used only
/// for reverse lookup from kernel-level tooling back to the owning router
/// transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LocalHandle(pub u64);

/// How the statement that needs a child intends to use it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionMode {
    /// The statement will write; the child must become the writer.
    DefinitelyWrite,
    /// The statement may write; the child starts in the reading set but can
    /// later be upgraded to the writer.
    MaybeWrite,
    /// The statement only reads; the child may never become the writer.
    DefinitelyRead,
}

/// One backend's transaction, located at a [`Location`].
///
/// Implementations must be safe to call from the termination path while the
/// driver thread is using the same handle: `terminate` in particular can
/// arrive at any time, more than once, and concurrently with any other
/// method.
pub trait ChildTransaction: std::fmt::Debug + Send + Sync {
    fn commit(&self) -> Result<()>;

    fn rollback(&self) -> Result<()>;

    /// Ask the child's engine to stop at its next safe point. Cooperative:
    /// in-flight work is not interrupted.
    fn terminate(&self, reason: TerminationReason) -> Result<()>;

    /// Release per-location resources. Called exactly once by the owning
    /// coordinator after commit or rollback, in either order of outcome.
    fn close(&self) -> Result<()>;

    fn is_open(&self) -> bool;

    fn location(&self) -> &Location;

    /// `Some` only for children backed by the local storage engine. Doubles
    /// as the local/remote tag the coordinator consults when draining remote
    /// children at shutdown and when resolving reverse lookups.
    fn local_handle(&self) -> Option<&LocalHandle> {
        None
    }
}

/// Opaque causal-consistency token manager, handed unchanged to factories.
pub trait BookmarkManager: Send + Sync {}

/// Opaque resolver of logical locations, handed unchanged to factories.
pub trait LocationService: Send + Sync {}

/// Callback a child uses to tell its coordinator that it detected its own
/// termination, e.g. a remote peer signaled it.
pub type ChildTerminationCallback = Arc<dyn Fn(TerminationReason) + Send + Sync>;

/// Produces child transactions for one location kind.
pub trait ChildTransactionFactory: Send + Sync {
    fn begin_transaction(
        &self,
        location: &Location,
        info: &TransactionInfo,
        bookmark_manager: &Arc<dyn BookmarkManager>,
        location_service: &Arc<dyn LocationService>,
        on_child_terminated: ChildTerminationCallback,
    ) -> Result<Arc<dyn ChildTransaction>>;
}

/// Factory pair keyed on location kind.
#[derive(Clone)]
pub struct ChildTransactionFactories {
    pub local: Arc<dyn ChildTransactionFactory>,
    pub remote: Arc<dyn ChildTransactionFactory>,
}

impl ChildTransactionFactories {
    pub fn new(
        local: Arc<dyn ChildTransactionFactory>,
        remote: Arc<dyn ChildTransactionFactory>,
    ) -> Self {
        Self { local, remote }
    }

    pub fn for_location(&self, location: &Location) -> &Arc<dyn ChildTransactionFactory> {
        if location.is_local() {
            &self.local
        } else {
            &self.remote
        }
    }
}
