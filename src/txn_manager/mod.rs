use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::debug;

use crate::lock_manager::LockManager;
use crate::pages::{Latch, PageId};
use crate::tuple::Rid;

pub type TxnId = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionState {
    Growing,
    Shrinking,
    Committed,
    Aborted,
}

/// A transaction: its 2PL state, the tuple locks it holds, and the scratch
/// space tree operations use for crabbing (ordered set of latched pages plus
/// the pages scheduled for deletion).
#[derive(Debug)]
pub struct Transaction {
    txn_id: TxnId,
    state: TransactionState,
    shared_lock_set: HashSet<Rid>,
    exclusive_lock_set: HashSet<Rid>,
    page_set: VecDeque<(PageId, Arc<Latch>)>,
    deleted_page_set: HashSet<PageId>,
}

impl Transaction {
    pub fn new(txn_id: TxnId) -> Self {
        Self {
            txn_id,
            state: TransactionState::Growing,
            shared_lock_set: HashSet::new(),
            exclusive_lock_set: HashSet::new(),
            page_set: VecDeque::new(),
            deleted_page_set: HashSet::new(),
        }
    }

    pub fn id(&self) -> TxnId {
        self.txn_id
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn set_state(&mut self, state: TransactionState) {
        self.state = state;
    }

    pub fn shared_lock_set(&self) -> &HashSet<Rid> {
        &self.shared_lock_set
    }

    pub fn shared_lock_set_mut(&mut self) -> &mut HashSet<Rid> {
        &mut self.shared_lock_set
    }

    pub fn exclusive_lock_set(&self) -> &HashSet<Rid> {
        &self.exclusive_lock_set
    }

    pub fn exclusive_lock_set_mut(&mut self) -> &mut HashSet<Rid> {
        &mut self.exclusive_lock_set
    }

    /// record a page latched during descent, released in order later
    pub fn add_into_page_set(&mut self, page_id: PageId, latch: Arc<Latch>) {
        self.page_set.push_back((page_id, latch));
    }

    pub fn pop_front_page(&mut self) -> Option<(PageId, Arc<Latch>)> {
        self.page_set.pop_front()
    }

    pub fn page_set_len(&self) -> usize {
        self.page_set.len()
    }

    pub fn add_deleted_page(&mut self, page_id: PageId) {
        self.deleted_page_set.insert(page_id);
    }

    pub fn deleted_page_set(&self) -> &HashSet<PageId> {
        &self.deleted_page_set
    }

    pub fn take_deleted_pages(&mut self) -> Vec<PageId> {
        self.deleted_page_set.drain().collect()
    }
}

/// Hands out transaction ids and drives commit/abort through the lock
/// manager.
pub struct TransactionManager {
    next_txn_id: AtomicU64,
    lock_manager: Arc<LockManager>,
}

pub type ArcTransactionManager = Arc<TransactionManager>;

impl TransactionManager {
    pub fn new(lock_manager: Arc<LockManager>) -> Self {
        Self {
            next_txn_id: AtomicU64::new(0),
            lock_manager,
        }
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lock_manager
    }

    pub fn begin(&self) -> Transaction {
        let id = self.next_txn_id.fetch_add(1, Ordering::Relaxed);
        debug!("starting txn {id}");
        Transaction::new(id)
    }

    pub fn commit(&self, txn: &mut Transaction) {
        txn.set_state(TransactionState::Committed);
        self.release_locks(txn);
        debug!("txn {} committed", txn.id());
    }

    pub fn abort(&self, txn: &mut Transaction) {
        txn.set_state(TransactionState::Aborted);
        self.release_locks(txn);
        debug!("txn {} aborted", txn.id());
    }

    fn release_locks(&self, txn: &mut Transaction) {
        let rids: Vec<Rid> = txn
            .shared_lock_set()
            .iter()
            .chain(txn.exclusive_lock_set().iter())
            .copied()
            .collect();
        for rid in rids {
            self.lock_manager.unlock(txn, rid);
        }
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    pub fn test_arc_txn_manager(strict_2pl: bool) -> ArcTransactionManager {
        Arc::new(TransactionManager::new(Arc::new(LockManager::new(
            strict_2pl,
        ))))
    }

    #[test]
    fn test_begin_assigns_increasing_ids() {
        let tm = test_arc_txn_manager(false);
        let t0 = tm.begin();
        let t1 = tm.begin();
        assert!(t0.id() < t1.id());
        assert_eq!(t0.state(), TransactionState::Growing);
    }

    #[test]
    fn test_commit_releases_all_locks() {
        let tm = test_arc_txn_manager(true);
        let lm = tm.lock_manager().clone();

        let mut txn = tm.begin();
        assert!(lm.lock_shared(&mut txn, Rid::new(1, 1)));
        assert!(lm.lock_exclusive(&mut txn, Rid::new(2, 2)));

        tm.commit(&mut txn);
        assert_eq!(txn.state(), TransactionState::Committed);
        assert!(txn.shared_lock_set().is_empty());
        assert!(txn.exclusive_lock_set().is_empty());
        assert!(lm.is_clean());
    }
}
