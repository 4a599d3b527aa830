//! Concurrent set of all live router transactions
//!
//! Injected and explicitly lifecycled: constructed once per process,
//! register/unregister paired 1:1 with coordinator creation and final close.
//! Never a global.

use crate::child::LocalHandle;
use crate::transaction::{RouterTransaction, TransactionId};
use dashmap::DashMap;
use std::sync::Arc;

#[derive(Default)]
pub struct TransactionRegistry {
    transactions: DashMap<TransactionId, Arc<RouterTransaction>>,
}

impl TransactionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_transaction(&self, tx: &Arc<RouterTransaction>) {
        self.transactions.insert(tx.id(), tx.clone());
    }

    pub fn unregister_transaction(&self, id: TransactionId) {
        self.transactions.remove(&id);
    }

    /// Map a low-level local engine handle back to the router transaction
    /// that owns it. Scans every registered transaction's local children:
    /// O(live transactions x local children each), bounded by the number of
    /// concurrently active client transactions in the process.
    pub fn find_transaction_containing(
        &self,
        handle: &LocalHandle,
    ) -> Option<Arc<RouterTransaction>> {
        self.transactions
            .iter()
            .find(|entry| entry.value().contains_local_handle(handle))
            .map(|entry| entry.value().clone())
    }

    /// Snapshot of every live transaction, for admin listings.
    pub fn active_transactions(&self) -> Vec<Arc<RouterTransaction>> {
        self.transactions
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }
}
