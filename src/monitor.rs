//! Deadline supervision for live router transactions
//!
//! The monitor keeps one bookkeeping record per registered transaction and
//! offers a sweep that marks overdue ones for termination. A generic external
//! supervising loop decides how often the sweep runs; the monitor itself
//! spawns nothing.

use crate::clock::Clock;
use crate::error::{Result, TerminationMark, TerminationReason};
use crate::info::StatementType;
use crate::transaction::{RouterTransaction, TransactionId};
use dashmap::DashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// The effective timeout of one transaction, tagged with the termination
/// reason a breach will be classified as: a client-configured override
/// surfaces as the client's doing, the process default as the system's.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionTimeout {
    pub duration: Duration,
    pub reason: TerminationReason,
}

impl TransactionTimeout {
    pub(crate) fn effective(override_timeout: Option<Duration>, default: Duration) -> Self {
        match override_timeout {
            Some(duration) => Self {
                duration,
                reason: TerminationReason::ClientConfiguredTimeout,
            },
            None => Self {
                duration: default,
                reason: TerminationReason::Timeout,
            },
        }
    }

    /// A zero duration disables deadline supervision for the transaction.
    pub fn is_unbounded(&self) -> bool {
        self.duration.is_zero()
    }
}

struct MonitorEntry {
    tx: Weak<RouterTransaction>,
    started_at_nanos: u64,
    timeout: TransactionTimeout,
}

/// Supervises registered transactions against their deadlines.
pub struct TimeoutMonitor {
    clock: Arc<dyn Clock>,
    default_timeout: Duration,
    entries: DashMap<TransactionId, MonitorEntry>,
}

impl TimeoutMonitor {
    pub fn new(clock: Arc<dyn Clock>, default_timeout: Duration) -> Self {
        Self {
            clock,
            default_timeout,
            entries: DashMap::new(),
        }
    }

    pub fn register_transaction(&self, tx: &Arc<RouterTransaction>) {
        let timeout = TransactionTimeout::effective(tx.info().timeout, self.default_timeout);
        self.entries.insert(
            tx.id(),
            MonitorEntry {
                tx: Arc::downgrade(tx),
                started_at_nanos: self.clock.nanos(),
                timeout,
            },
        );
    }

    pub fn unregister_transaction(&self, id: TransactionId) {
        self.entries.remove(&id);
    }

    /// Snapshot view of every supervised transaction.
    pub fn active_transactions(&self) -> Vec<MonitoredTransaction> {
        self.entries
            .iter()
            .filter_map(|entry| {
                entry.tx.upgrade().map(|tx| MonitoredTransaction {
                    tx,
                    started_at_nanos: entry.started_at_nanos,
                    timeout: entry.timeout,
                })
            })
            .collect()
    }

    /// Mark every overdue transaction for termination, classified by its
    /// timeout tag. Returns how many transactions this sweep marked.
    pub fn terminate_expired(&self) -> usize {
        let now = self.clock.nanos();
        let mut marked = 0;
        for entry in self.entries.iter() {
            if entry.timeout.is_unbounded() {
                continue;
            }
            let elapsed = now.saturating_sub(entry.started_at_nanos);
            if elapsed < entry.timeout.duration.as_nanos() as u64 {
                continue;
            }
            let Some(tx) = entry.tx.upgrade() else {
                continue;
            };
            match tx.mark_for_termination(entry.timeout.reason) {
                Ok(true) => {
                    tracing::info!(
                        transaction = %tx.id(),
                        reason = %entry.timeout.reason,
                        "terminated overdue transaction"
                    );
                    marked += 1;
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(
                        transaction = %tx.id(),
                        error = %e,
                        "failed to terminate overdue transaction"
                    );
                    marked += 1;
                }
            }
        }
        marked
    }
}

/// Read-only supervision view of one live transaction.
pub struct MonitoredTransaction {
    tx: Arc<RouterTransaction>,
    started_at_nanos: u64,
    timeout: TransactionTimeout,
}

impl MonitoredTransaction {
    pub fn id(&self) -> TransactionId {
        self.tx.id()
    }

    /// Monotonic timestamp at registration, same epoch as the injected clock.
    pub fn started_at_nanos(&self) -> u64 {
        self.started_at_nanos
    }

    pub fn timeout(&self) -> TransactionTimeout {
        self.timeout
    }

    pub fn is_schema_transaction(&self) -> bool {
        matches!(
            self.tx.last_statement_type(),
            Some(StatementType::SchemaCommand)
        )
    }

    pub fn termination_mark(&self) -> Option<TerminationMark> {
        self.tx.termination_mark()
    }

    /// Redacted identification for supervision output: the client address,
    /// and the executing user only when the session is authenticated.
    pub fn description(&self) -> String {
        let info = self.tx.info();
        match &info.authenticated_user {
            Some(user) => format!("transaction from {} by {}", info.client_address, user),
            None => format!("transaction from {}", info.client_address),
        }
    }

    pub fn mark_for_termination(&self, reason: TerminationReason) -> Result<bool> {
        self.tx.mark_for_termination(reason)
    }

    pub fn transaction(&self) -> &Arc<RouterTransaction> {
        &self.tx
    }
}
