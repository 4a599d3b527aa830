//! The router transaction: one client-visible transaction spanning children
//!
//! A [`RouterTransaction`] owns the full lifecycle of one logical
//! transaction. It hands out child transactions per location, enforces the
//! single-writer rule, and holds the termination machinery together: the
//! driver thread calls everything here except [`RouterTransaction::mark_for_termination`],
//! which may arrive from any thread at any time.

use crate::child::{
    BookmarkManager, ChildTerminationCallback, ChildTransaction, ChildTransactionFactories,
    LocalHandle, LocationService, TransactionMode,
};
use crate::clock::Clock;
use crate::error::{
    ErrorCode, ErrorReporter, Result, RouterError, TerminationMark, TerminationReason,
};
use crate::info::{StatementType, TransactionInfo};
use crate::location::Location;
use crate::monitor::TimeoutMonitor;
use crate::registry::TransactionRegistry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Identity of one router transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionId(Uuid);

impl TransactionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a router transaction. Leaves `Open` exactly once, via
/// compare-and-swap, and never returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Open,
    Closed,
    Terminated,
}

const OPEN: u8 = 0;
const CLOSED: u8 = 1;
const TERMINATED: u8 = 2;

fn status_from_raw(raw: u8) -> TransactionStatus {
    match raw {
        OPEN => TransactionStatus::Open,
        CLOSED => TransactionStatus::Closed,
        _ => TransactionStatus::Terminated,
    }
}

/// How often the shutdown drain re-checks remote children.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A child in the reading set, tagged with whether it may ever be upgraded
/// to the writer.
struct ReadingChild {
    child: Arc<dyn ChildTransaction>,
    read_only: bool,
}

/// Which fan-out a collected set of failures belongs to.
#[derive(Clone, Copy)]
enum FanOut {
    Commit,
    Rollback,
    Termination,
}

impl FanOut {
    fn report_message(self) -> &'static str {
        match self {
            FanOut::Commit => "Failed to commit a child transaction",
            FanOut::Rollback => "Failed to rollback a child transaction",
            FanOut::Termination => "Failed to terminate a child transaction",
        }
    }

    fn default_code(self) -> ErrorCode {
        match self {
            FanOut::Commit => ErrorCode::CommitFailed,
            FanOut::Rollback => ErrorCode::RollbackFailed,
            FanOut::Termination => ErrorCode::TerminationFailed,
        }
    }
}

fn same_child(a: &Arc<dyn ChildTransaction>, b: &Arc<dyn ChildTransaction>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

/// Coordinator for one logical transaction spanning N child transactions.
pub struct RouterTransaction {
    id: TransactionId,

    info: TransactionInfo,

    /// CAS-driven state; see [`TransactionStatus`].
    status: AtomicU8,

    /// Held across the status CAS in `mark_for_termination`, so any observer
    /// holding this lock that sees `Terminated` also sees the mark.
    termination_mark: Mutex<Option<TerminationMark>>,

    /// Reading children in registration order. Snapshot-under-lock: the
    /// termination path clones the set and fans out without the lock, so the
    /// driver thread can keep appending.
    readers: Mutex<Vec<ReadingChild>>,

    /// The single writer slot.
    writer: Mutex<Option<Arc<dyn ChildTransaction>>>,

    /// One child per distinct database id; repeated requests for the same
    /// database reuse the cached handle. Concurrently readable because the
    /// registry's reverse lookup scans it from foreign threads.
    children_by_db: DashMap<Uuid, Arc<dyn ChildTransaction>>,

    /// Most permissive statement type seen so far.
    statement_type: Mutex<Option<StatementType>>,

    factories: ChildTransactionFactories,
    bookmark_manager: Arc<dyn BookmarkManager>,
    location_service: Arc<dyn LocationService>,
    reporter: Arc<dyn ErrorReporter>,
    clock: Arc<dyn Clock>,
    registry: Arc<TransactionRegistry>,
    monitor: Arc<TimeoutMonitor>,
}

impl RouterTransaction {
    /// Begin a new logical transaction and register it with the registry and
    /// the timeout monitor.
    #[allow(clippy::too_many_arguments)]
    pub fn begin(
        info: TransactionInfo,
        factories: ChildTransactionFactories,
        bookmark_manager: Arc<dyn BookmarkManager>,
        location_service: Arc<dyn LocationService>,
        reporter: Arc<dyn ErrorReporter>,
        clock: Arc<dyn Clock>,
        registry: Arc<TransactionRegistry>,
        monitor: Arc<TimeoutMonitor>,
    ) -> Arc<Self> {
        let tx = Arc::new(Self {
            id: TransactionId::new(),
            info,
            status: AtomicU8::new(OPEN),
            termination_mark: Mutex::new(None),
            readers: Mutex::new(Vec::new()),
            writer: Mutex::new(None),
            children_by_db: DashMap::new(),
            statement_type: Mutex::new(None),
            factories,
            bookmark_manager,
            location_service,
            reporter,
            clock,
            registry,
            monitor,
        });
        tx.registry.register_transaction(&tx);
        tx.monitor.register_transaction(&tx);
        tracing::debug!(transaction = %tx.id, "began router transaction");
        tx
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn info(&self) -> &TransactionInfo {
        &self.info
    }

    pub fn status(&self) -> TransactionStatus {
        status_from_raw(self.status.load(Ordering::SeqCst))
    }

    pub fn is_open(&self) -> bool {
        self.status() == TransactionStatus::Open
    }

    pub fn termination_mark(&self) -> Option<TerminationMark> {
        *self.termination_mark.lock()
    }

    /// Most permissive statement type executed so far, if any.
    pub fn last_statement_type(&self) -> Option<StatementType> {
        *self.statement_type.lock()
    }

    /// Whether one of this transaction's local children is backed by the
    /// given storage-engine handle.
    pub fn contains_local_handle(&self, handle: &LocalHandle) -> bool {
        self.children_by_db
            .iter()
            .any(|entry| entry.value().local_handle() == Some(handle))
    }

    /// Look up or lazily create the child transaction for `location`.
    ///
    /// Children are created once per distinct database id; repeated calls
    /// return the cached handle. A `DefinitelyWrite` request against a cached
    /// child that is not yet the writer triggers the upgrade path.
    pub fn transaction_for(
        self: &Arc<Self>,
        location: Location,
        mode: TransactionMode,
    ) -> Result<Arc<dyn ChildTransaction>> {
        let db_id = location.database().id;
        if let Some(existing) = self
            .children_by_db
            .get(&db_id)
            .map(|entry| entry.value().clone())
        {
            if mode == TransactionMode::DefinitelyWrite && !self.is_writer(&existing) {
                self.upgrade_to_writing_transaction(&existing)?;
            }
            return Ok(existing);
        }

        let factory = self.factories.for_location(&location).clone();
        let info = self.info.clone();
        let bookmark_manager = self.bookmark_manager.clone();
        let location_service = self.location_service.clone();
        let on_terminated = self.child_termination_callback();
        let supplier_location = location.clone();
        self.register_new_child_transaction(location, mode, move || {
            factory.begin_transaction(
                &supplier_location,
                &info,
                &bookmark_manager,
                &location_service,
                on_terminated,
            )
        })
    }

    /// Create and track a new child transaction produced by `supplier`.
    pub fn register_new_child_transaction<F>(
        &self,
        location: Location,
        mode: TransactionMode,
        supplier: F,
    ) -> Result<Arc<dyn ChildTransaction>>
    where
        F: FnOnce() -> Result<Arc<dyn ChildTransaction>>,
    {
        match mode {
            TransactionMode::DefinitelyWrite => self.register_writing_child(location, supplier),
            TransactionMode::MaybeWrite => self.register_reading_child(location, supplier, false),
            TransactionMode::DefinitelyRead => {
                self.register_reading_child(location, supplier, true)
            }
        }
    }

    fn register_writing_child<F>(
        &self,
        location: Location,
        supplier: F,
    ) -> Result<Arc<dyn ChildTransaction>>
    where
        F: FnOnce() -> Result<Arc<dyn ChildTransaction>>,
    {
        self.check_open_for_statement_execution()?;
        {
            let writer = self.writer.lock();
            if let Some(current) = writer.as_ref() {
                if current.location() != &location {
                    return Err(writer_conflict(current.location(), &location));
                }
            }
        }

        // Child creation can involve the network, so it runs outside every
        // lock. Termination recorded while it was in flight is re-applied
        // below.
        let child = supplier()?;
        self.children_by_db
            .insert(location.database().id, child.clone());
        *self.writer.lock() = Some(child.clone());

        self.terminate_if_marked(&child);
        Ok(child)
    }

    fn register_reading_child<F>(
        &self,
        location: Location,
        supplier: F,
        read_only: bool,
    ) -> Result<Arc<dyn ChildTransaction>>
    where
        F: FnOnce() -> Result<Arc<dyn ChildTransaction>>,
    {
        let child = supplier()?;
        self.children_by_db
            .insert(location.database().id, child.clone());
        self.readers.lock().push(ReadingChild {
            child: child.clone(),
            read_only,
        });

        self.terminate_if_marked(&child);
        Ok(child)
    }

    /// Promote a reading child to the single writer.
    ///
    /// The writer lock is held across the whole find/remove/install sequence,
    /// so a concurrent termination either still finds the child in the
    /// reading set or finds it installed as the writer; the mark is
    /// re-applied after installation as well, covering a termination that
    /// fanned out before the installation became visible.
    pub fn upgrade_to_writing_transaction(&self, child: &Arc<dyn ChildTransaction>) -> Result<()> {
        let mut writer = self.writer.lock();

        if let Some(current) = writer.as_ref() {
            if same_child(current, child) {
                return Ok(());
            }
            return Err(writer_conflict(current.location(), child.location()));
        }

        let reading = {
            let mut readers = self.readers.lock();
            let index = readers
                .iter()
                .position(|reading| same_child(&reading.child, child))
                .ok_or_else(|| {
                    RouterError::InvalidState(
                        "only a tracked reading transaction can be upgraded to a writing \
                         transaction"
                            .to_string(),
                    )
                })?;
            if readers[index].read_only {
                return Err(RouterError::InvalidState(
                    "a read-only transaction cannot be upgraded to a writing transaction"
                        .to_string(),
                ));
            }
            readers.remove(index)
        };

        *writer = Some(reading.child);
        drop(writer);

        self.terminate_if_marked(child);
        Ok(())
    }

    /// Record the type of a statement about to execute and reject forbidden
    /// mixes within this transaction.
    pub fn verify_statement_type(&self, statement_type: StatementType) -> Result<()> {
        let mut recorded = self.statement_type.lock();
        match *recorded {
            None => {
                *recorded = Some(statement_type);
                Ok(())
            }
            Some(current) => match current.merge(statement_type) {
                Some(next) => {
                    *recorded = Some(next);
                    Ok(())
                }
                None => Err(RouterError::ForbiddenStatementMix {
                    recorded: current,
                    next: statement_type,
                }),
            },
        }
    }

    /// Commit the logical transaction.
    ///
    /// All reading children commit (or are found failed) strictly before the
    /// writer is touched; the writer is rolled back instead of committed when
    /// any reader failed, so a write is never finalized behind a read whose
    /// outcome is in doubt.
    pub fn commit(&self) -> Result<()> {
        if let Err(lost) = self.transition_from_open(CLOSED) {
            return Err(self.finish_after_lost_transition(lost, "commit"));
        }

        let mut failures: Vec<RouterError> = Vec::new();

        let readers = std::mem::take(&mut *self.readers.lock());
        let mut reader_failed = false;
        for reading in &readers {
            if let Err(e) = reading.child.commit() {
                reader_failed = true;
                failures.push(e);
            }
        }

        if let Some(writer) = self.writer.lock().take() {
            let result = if reader_failed {
                writer.rollback()
            } else {
                writer.commit()
            };
            if let Err(e) = result {
                failures.push(e);
            }
        }

        self.close_children(&mut failures);
        self.deregister();

        self.raise_if_failed(FanOut::Commit, failures)
    }

    /// Roll back the logical transaction: every known child, unconditionally.
    pub fn rollback(&self) -> Result<()> {
        if let Err(lost) = self.transition_from_open(CLOSED) {
            return Err(self.finish_after_lost_transition(lost, "rollback"));
        }

        let mut failures: Vec<RouterError> = Vec::new();

        let readers = std::mem::take(&mut *self.readers.lock());
        for reading in &readers {
            if let Err(e) = reading.child.rollback() {
                failures.push(e);
            }
        }
        if let Some(writer) = self.writer.lock().take() {
            if let Err(e) = writer.rollback() {
                failures.push(e);
            }
        }

        self.close_children(&mut failures);
        self.deregister();

        self.raise_if_failed(FanOut::Rollback, failures)
    }

    /// Kill the transaction. Single-shot: only an `Open` transaction can be
    /// marked, and `Ok(false)` means someone else already closed or
    /// terminated it.
    ///
    /// May be called from any thread, concurrently with any driver-thread
    /// operation. Unlike the cleanup rollback performed when commit/rollback
    /// lose a termination race, failures to terminate children are NOT
    /// swallowed here.
    pub fn mark_for_termination(&self, reason: TerminationReason) -> Result<bool> {
        {
            let mut mark = self.termination_mark.lock();
            if self
                .status
                .compare_exchange(OPEN, TERMINATED, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                return Ok(false);
            }
            *mark = Some(TerminationMark {
                reason,
                at_nanos: self.clock.nanos(),
            });
        }
        tracing::debug!(transaction = %self.id, reason = %reason, "transaction marked for termination");

        let mut failures: Vec<RouterError> = Vec::new();
        for child in self.known_children() {
            if let Err(e) = child.terminate(reason) {
                failures.push(e);
            }
        }

        if failures.is_empty() {
            Ok(true)
        } else {
            Err(self.aggregate(FanOut::Termination, failures))
        }
    }

    /// Callback for a child that detected its own termination, e.g. a remote
    /// peer signaled it. Forwards to [`RouterTransaction::mark_for_termination`].
    pub fn child_transaction_terminated(&self, reason: TerminationReason) {
        if let Err(e) = self.mark_for_termination(reason) {
            self.reporter.report(
                "Failed to terminate composite transaction after a child signaled termination",
                &e,
                ErrorCode::TerminationFailed,
            );
        }
    }

    /// Remove and close one tracked reading child, e.g. because its result
    /// stream was fully consumed. No-op when `child` is not currently
    /// tracked as a reading child.
    pub fn close_child_transaction(&self, child: &Arc<dyn ChildTransaction>) -> Result<()> {
        let removed = {
            let mut readers = self.readers.lock();
            readers
                .iter()
                .position(|reading| same_child(&reading.child, child))
                .map(|index| readers.remove(index))
        };
        match removed {
            Some(reading) => {
                self.children_by_db
                    .remove(&reading.child.location().database().id);
                reading.child.close()
            }
            None => Ok(()),
        }
    }

    /// Guard before accepting new statement work.
    pub fn throw_if_terminated_or_closed(&self, message: impl FnOnce() -> String) -> Result<()> {
        let mark = self.termination_mark.lock();
        if let Some(mark) = *mark {
            return Err(RouterError::Terminated {
                reason: mark.reason,
            });
        }
        match status_from_raw(self.status.load(Ordering::SeqCst)) {
            TransactionStatus::Open => Ok(()),
            TransactionStatus::Closed => Err(RouterError::ClosedTransaction(message())),
            // Unreachable while the mark lock is held, kept as a safety net.
            TransactionStatus::Terminated => Err(RouterError::Terminated {
                reason: TerminationReason::Killed,
            }),
        }
    }

    /// Shutdown drain: give non-local children up to `timeout` to close on
    /// their own, then force-terminate any still open. The one place in this
    /// crate where blocking is permitted.
    pub fn stop_remote_dbs_after_timeout(&self, timeout: Duration) {
        let remotes: Vec<Arc<dyn ChildTransaction>> = self
            .children_by_db
            .iter()
            .map(|entry| entry.value().clone())
            .filter(|child| child.local_handle().is_none())
            .collect();

        let deadline = self.clock.millis() + timeout.as_millis() as u64;
        while remotes.iter().any(|child| child.is_open()) {
            if self.clock.millis() >= deadline {
                break;
            }
            std::thread::sleep(DRAIN_POLL_INTERVAL);
        }

        for child in remotes.iter().filter(|child| child.is_open()) {
            if let Err(e) = child.terminate(TerminationReason::ShuttingDown) {
                tracing::warn!(
                    transaction = %self.id,
                    location = %child.location(),
                    error = %e,
                    "failed to terminate remote child during shutdown drain"
                );
            }
        }
    }

    fn check_open_for_statement_execution(&self) -> Result<()> {
        self.throw_if_terminated_or_closed(|| {
            "Trying to execute a statement in a transaction that has already been closed"
                .to_string()
        })
    }

    /// CAS away from `Open`. On failure reports what the transaction lost to.
    fn transition_from_open(&self, target: u8) -> std::result::Result<(), LostTransition> {
        // Holding the mark lock across the CAS guarantees that losing to a
        // termination also observes the termination mark.
        let mark = self.termination_mark.lock();
        match self
            .status
            .compare_exchange(OPEN, target, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => Ok(()),
            Err(raw) if raw == TERMINATED => Err(LostTransition::Terminated(
                mark.map(|m| m.reason).unwrap_or(TerminationReason::Killed),
            )),
            Err(_) => Err(LostTransition::Closed),
        }
    }

    /// Cleanup when commit/rollback lost the race against termination or a
    /// previous close. The termination cleanup rolls children back
    /// best-effort: the user-visible outcome is "transaction was killed",
    /// not cleanup noise.
    fn finish_after_lost_transition(&self, lost: LostTransition, operation: &str) -> RouterError {
        match lost {
            LostTransition::Terminated(reason) => {
                let readers = std::mem::take(&mut *self.readers.lock());
                for reading in &readers {
                    if let Err(e) = reading.child.rollback() {
                        tracing::debug!(transaction = %self.id, error = %e, "ignored rollback failure of terminated child");
                    }
                }
                if let Some(writer) = self.writer.lock().take() {
                    if let Err(e) = writer.rollback() {
                        tracing::debug!(transaction = %self.id, error = %e, "ignored rollback failure of terminated writer");
                    }
                }
                let mut swallowed = Vec::new();
                self.close_children(&mut swallowed);
                for e in swallowed {
                    tracing::debug!(transaction = %self.id, error = %e, "ignored close failure of terminated child");
                }
                self.deregister();
                RouterError::Terminated { reason }
            }
            LostTransition::Closed => RouterError::ClosedTransaction(format!(
                "Trying to {} a transaction that has already been closed",
                operation
            )),
        }
    }

    /// Terminations recorded while a child was being created or upgraded
    /// must still reach the child that missed the fan-out.
    fn terminate_if_marked(&self, child: &Arc<dyn ChildTransaction>) {
        if let Some(mark) = self.termination_mark() {
            if let Err(e) = child.terminate(mark.reason) {
                tracing::debug!(
                    transaction = %self.id,
                    error = %e,
                    "failed to terminate child created during termination"
                );
            }
        }
    }

    fn is_writer(&self, child: &Arc<dyn ChildTransaction>) -> bool {
        self.writer
            .lock()
            .as_ref()
            .is_some_and(|writer| same_child(writer, child))
    }

    /// Snapshot of every currently known child. Never holds both collection
    /// locks at once.
    fn known_children(&self) -> Vec<Arc<dyn ChildTransaction>> {
        let mut children: Vec<Arc<dyn ChildTransaction>> = self
            .readers
            .lock()
            .iter()
            .map(|reading| reading.child.clone())
            .collect();
        if let Some(writer) = self.writer.lock().clone() {
            children.push(writer);
        }
        children
    }

    fn child_termination_callback(self: &Arc<Self>) -> ChildTerminationCallback {
        let weak = Arc::downgrade(self);
        Arc::new(move |reason| {
            if let Some(tx) = weak.upgrade() {
                tx.child_transaction_terminated(reason);
            }
        })
    }

    /// Close every per-location context, collecting failures.
    fn close_children(&self, failures: &mut Vec<RouterError>) {
        let children: Vec<Arc<dyn ChildTransaction>> = self
            .children_by_db
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.children_by_db.clear();
        for child in children {
            if let Err(e) = child.close() {
                failures.push(e);
            }
        }
    }

    fn deregister(&self) {
        self.registry.unregister_transaction(self.id);
        self.monitor.unregister_transaction(self.id);
    }

    fn raise_if_failed(&self, fan_out: FanOut, failures: Vec<RouterError>) -> Result<()> {
        if failures.is_empty() {
            Ok(())
        } else {
            Err(self.aggregate(fan_out, failures))
        }
    }

    /// Build the aggregate error for a failed fan-out: the first failure is
    /// the primary cause left for the caller to log, every later failure is
    /// kept as suppressed and independently reported.
    fn aggregate(&self, fan_out: FanOut, mut failures: Vec<RouterError>) -> RouterError {
        let primary = Box::new(failures.remove(0));
        for failure in &failures {
            self.reporter
                .report(fan_out.report_message(), failure, fan_out.default_code());
        }
        match fan_out {
            FanOut::Commit => RouterError::CommitFailed {
                primary,
                suppressed: failures,
            },
            FanOut::Rollback => RouterError::RollbackFailed {
                primary,
                suppressed: failures,
            },
            FanOut::Termination => RouterError::TerminationFailed {
                primary,
                suppressed: failures,
            },
        }
    }
}

enum LostTransition {
    Terminated(TerminationReason),
    Closed,
}

fn writer_conflict(current: &Location, requested: &Location) -> RouterError {
    if current.database().id == requested.database().id {
        RouterError::LeaderSwitch {
            database: requested.database().name.clone(),
        }
    } else {
        RouterError::MultiDatabaseWrite {
            current: current.database().name.clone(),
            attempted: requested.database().name.clone(),
        }
    }
}

impl fmt::Debug for RouterTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouterTransaction")
            .field("id", &self.id)
            .field("status", &self.status())
            .field("session_database", &self.info.session_database.name)
            .finish_non_exhaustive()
    }
}
