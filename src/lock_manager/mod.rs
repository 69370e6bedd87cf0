use std::collections::HashMap;
use std::sync::Arc;

use log::debug;
use parking_lot::{Condvar, Mutex};

use crate::tuple::Rid;
use crate::txn_manager::{Transaction, TransactionState, TxnId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LockMode {
    Shared,
    Exclusive,
    /// queued upgrade from shared, granted as exclusive
    Update,
    /// tombstone of a released entry, swept after wake-ups
    Released,
}

/// One-shot completion signal per waiter: `true` grants the lock, `false`
/// evicts the waiter because its transaction died.
struct LockSignal {
    state: Mutex<Option<bool>>,
    cv: Condvar,
}

impl LockSignal {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(None),
            cv: Condvar::new(),
        })
    }

    fn wait(&self) -> bool {
        let mut state = self.state.lock();
        while state.is_none() {
            self.cv.wait(&mut state);
        }
        state.unwrap()
    }

    fn complete(&self, granted: bool) {
        *self.state.lock() = Some(granted);
        self.cv.notify_one();
    }
}

struct LockEntry {
    txn_id: TxnId,
    mode: LockMode,
    granted: bool,
    signal: Option<Arc<LockSignal>>,
}

impl LockEntry {
    fn granted(txn_id: TxnId, mode: LockMode) -> Self {
        Self {
            txn_id,
            mode,
            granted: true,
            signal: None,
        }
    }

    fn waiting(txn_id: TxnId, mode: LockMode, signal: Arc<LockSignal>) -> Self {
        Self {
            txn_id,
            mode,
            granted: false,
            signal: Some(signal),
        }
    }

    fn is_live(&self) -> bool {
        self.mode != LockMode::Released
    }
}

/// Per-RID lock list in admission order. `granted` is the authoritative
/// count of granted live entries; they always form the list's prefix.
#[derive(Default)]
struct LockList {
    entries: Vec<LockEntry>,
    granted: usize,
}

impl LockList {
    fn head_mode(&self) -> Option<LockMode> {
        self.entries
            .iter()
            .find(|entry| entry.granted)
            .map(|entry| entry.mode)
    }

    fn tail_is_granted(&self) -> bool {
        self.entries
            .iter()
            .rev()
            .find(|entry| entry.is_live())
            .map(|entry| entry.granted)
            .unwrap_or(true)
    }

    /// wait-die: a requester may wait only behind transactions that are all
    /// younger (larger ids); a smaller id anywhere in the list kills it
    fn wait_allowed(&self, txn_id: TxnId) -> bool {
        self.entries
            .iter()
            .filter(|entry| entry.is_live())
            .all(|entry| entry.txn_id >= txn_id)
    }

    fn grant(&mut self, index: usize) {
        let entry = &mut self.entries[index];
        debug_assert!(!entry.granted && entry.is_live());
        entry.granted = true;
        self.granted += 1;
        if let Some(signal) = &entry.signal {
            signal.complete(true);
        }
    }

    fn release(&mut self, index: usize) {
        let entry = &mut self.entries[index];
        debug_assert!(entry.granted);
        entry.granted = false;
        entry.mode = LockMode::Released;
        self.granted -= 1;
    }

    /// Promote successors after a release. With nothing granted, the head of
    /// the queue gets the lock (a shared head pulls every contiguous shared
    /// waiter with it). With a single holder left, a queued upgrade of that
    /// same holder collapses into an exclusive grant.
    fn wake_successors(&mut self) {
        if self.granted == 0 {
            let Some(first) = self
                .entries
                .iter()
                .position(|entry| entry.is_live() && !entry.granted)
            else {
                return;
            };
            match self.entries[first].mode {
                LockMode::Shared => {
                    self.grant(first);
                    let mut next = first + 1;
                    while next < self.entries.len() {
                        let entry = &self.entries[next];
                        if !entry.is_live() {
                            next += 1;
                            continue;
                        }
                        if entry.mode != LockMode::Shared || entry.granted {
                            break;
                        }
                        self.grant(next);
                        next += 1;
                    }
                }
                LockMode::Exclusive | LockMode::Update => {
                    self.entries[first].mode = LockMode::Exclusive;
                    self.grant(first);
                }
                LockMode::Released => unreachable!(),
            }
        } else if self.granted == 1 {
            let holder = self
                .entries
                .iter()
                .position(|entry| entry.granted)
                .expect("granted count out of sync");
            let holder_txn = self.entries[holder].txn_id;
            let waiter = self
                .entries
                .iter()
                .position(|entry| entry.is_live() && !entry.granted);
            if let Some(waiter) = waiter {
                if self.entries[waiter].mode == LockMode::Update
                    && self.entries[waiter].txn_id == holder_txn
                {
                    // the upgrade was only waiting for the other readers
                    self.release(holder);
                    self.entries[waiter].mode = LockMode::Exclusive;
                    self.grant(waiter);
                }
            }
        }
    }

    fn sweep_tombstones(&mut self) {
        self.entries.retain(|entry| entry.is_live());
    }
}

/// Tuple-level pessimistic lock manager with wait-die deadlock prevention.
/// With `strict_2pl` every unlock must happen at commit/abort; otherwise the
/// first unlock moves the transaction to SHRINKING.
pub struct LockManager {
    strict_2pl: bool,
    lock_table: Mutex<HashMap<Rid, LockList>>,
}

impl LockManager {
    pub fn new(strict_2pl: bool) -> Self {
        Self {
            strict_2pl,
            lock_table: Mutex::new(HashMap::new()),
        }
    }

    /// a lock may only be requested while the transaction is growing
    fn admissible(txn: &Transaction) -> bool {
        debug_assert!(
            txn.state() != TransactionState::Shrinking,
            "lock request on a shrinking transaction"
        );
        txn.state() == TransactionState::Growing
    }

    pub fn lock_shared(&self, txn: &mut Transaction, rid: Rid) -> bool {
        if !Self::admissible(txn) {
            return false;
        }

        let signal = {
            let mut table = self.lock_table.lock();
            let list = table.entry(rid).or_default();

            if list.entries.is_empty() {
                list.entries
                    .push(LockEntry::granted(txn.id(), LockMode::Shared));
                list.granted = 1;
                txn.shared_lock_set_mut().insert(rid);
                return true;
            }

            // reentrant request against our own grant
            if txn.shared_lock_set().contains(&rid) || txn.exclusive_lock_set().contains(&rid) {
                txn.shared_lock_set_mut().insert(rid);
                return true;
            }

            // piggyback on a shared crowd with no one queued behind it
            if list.head_mode() == Some(LockMode::Shared) && list.tail_is_granted() {
                list.entries
                    .push(LockEntry::granted(txn.id(), LockMode::Shared));
                list.granted += 1;
                txn.shared_lock_set_mut().insert(rid);
                return true;
            }

            if !list.wait_allowed(txn.id()) {
                txn.set_state(TransactionState::Aborted);
                debug!("txn {} died requesting shared {rid}", txn.id());
                return false;
            }
            let signal = LockSignal::new();
            list.entries
                .push(LockEntry::waiting(txn.id(), LockMode::Shared, signal.clone()));
            signal
        };

        if !signal.wait() || txn.state() == TransactionState::Aborted {
            txn.set_state(TransactionState::Aborted);
            return false;
        }
        txn.shared_lock_set_mut().insert(rid);
        true
    }

    pub fn lock_exclusive(&self, txn: &mut Transaction, rid: Rid) -> bool {
        if !Self::admissible(txn) {
            return false;
        }

        let signal = {
            let mut table = self.lock_table.lock();
            let list = table.entry(rid).or_default();

            if list.entries.is_empty() {
                list.entries
                    .push(LockEntry::granted(txn.id(), LockMode::Exclusive));
                list.granted = 1;
                txn.exclusive_lock_set_mut().insert(rid);
                return true;
            }

            if txn.exclusive_lock_set().contains(&rid) {
                return true;
            }

            if !list.wait_allowed(txn.id()) {
                txn.set_state(TransactionState::Aborted);
                debug!("txn {} died requesting exclusive {rid}", txn.id());
                return false;
            }
            let signal = LockSignal::new();
            list.entries.push(LockEntry::waiting(
                txn.id(),
                LockMode::Exclusive,
                signal.clone(),
            ));
            signal
        };

        if !signal.wait() || txn.state() == TransactionState::Aborted {
            txn.set_state(TransactionState::Aborted);
            return false;
        }
        txn.exclusive_lock_set_mut().insert(rid);
        true
    }

    /// Promote an already-held shared lock. The sole shared holder promotes
    /// in place; otherwise an Update waiter is queued under wait-die and
    /// serviced when the remaining readers drain.
    pub fn lock_upgrade(&self, txn: &mut Transaction, rid: Rid) -> bool {
        if !Self::admissible(txn) {
            return false;
        }

        let signal = {
            let mut table = self.lock_table.lock();
            let Some(list) = table.get_mut(&rid) else {
                debug_assert!(false, "upgrade without a lock list");
                return false;
            };
            let Some(position) = list.entries.iter().position(|entry| {
                entry.granted && entry.txn_id == txn.id() && entry.mode == LockMode::Shared
            }) else {
                debug_assert!(false, "upgrade without a granted shared lock");
                return false;
            };

            if list.granted == 1 {
                list.entries[position].mode = LockMode::Exclusive;
                txn.shared_lock_set_mut().remove(&rid);
                txn.exclusive_lock_set_mut().insert(rid);
                return true;
            }

            if !list.wait_allowed(txn.id()) {
                txn.set_state(TransactionState::Aborted);
                debug!("txn {} died upgrading {rid}", txn.id());
                return false;
            }
            let signal = LockSignal::new();
            list.entries
                .push(LockEntry::waiting(txn.id(), LockMode::Update, signal.clone()));
            signal
        };

        if !signal.wait() || txn.state() == TransactionState::Aborted {
            txn.set_state(TransactionState::Aborted);
            return false;
        }
        txn.shared_lock_set_mut().remove(&rid);
        txn.exclusive_lock_set_mut().insert(rid);
        true
    }

    /// Release the granted entry, wake whoever is unblocked by it, and sweep
    /// tombstones out of the list.
    pub fn unlock(&self, txn: &mut Transaction, rid: Rid) -> bool {
        let mut table = self.lock_table.lock();

        if self.strict_2pl {
            let at_end = matches!(
                txn.state(),
                TransactionState::Committed | TransactionState::Aborted
            );
            debug_assert!(at_end, "strict 2PL unlock outside commit/abort");
            if !at_end {
                return false;
            }
        } else if txn.state() == TransactionState::Growing {
            txn.set_state(TransactionState::Shrinking);
        }

        let Some(list) = table.get_mut(&rid) else {
            debug_assert!(false, "unlock of an unheld rid");
            return false;
        };
        let Some(position) = list
            .entries
            .iter()
            .position(|entry| entry.granted && entry.txn_id == txn.id())
        else {
            debug_assert!(false, "unlock of an unheld rid");
            return false;
        };

        list.release(position);
        txn.shared_lock_set_mut().remove(&rid);
        txn.exclusive_lock_set_mut().remove(&rid);

        list.wake_successors();
        list.sweep_tombstones();
        if list.entries.is_empty() {
            table.remove(&rid);
        }
        true
    }

    /// test support: no lock list holds any entry
    pub fn is_clean(&self) -> bool {
        self.lock_table
            .lock()
            .values()
            .all(|list| list.entries.is_empty())
    }

    /// test support: `txn` appears in no lock list
    pub fn is_clean_for(&self, txn_id: TxnId) -> bool {
        self.lock_table
            .lock()
            .values()
            .all(|list| list.entries.iter().all(|entry| entry.txn_id != txn_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::txn_manager::TransactionManager;
    use std::thread;

    use rand::prelude::*;

    #[test]
    fn test_two_shared_holders() {
        let lm = Arc::new(LockManager::new(false));
        let tm = Arc::new(TransactionManager::new(lm.clone()));
        let rid = Rid::new(0, 0);

        let mut handles = vec![];
        for _ in 0..2 {
            let lm = lm.clone();
            let tm = tm.clone();
            handles.push(thread::spawn(move || {
                let mut txn = tm.begin();
                assert!(lm.lock_shared(&mut txn, rid));
                assert_eq!(txn.state(), TransactionState::Growing);
                tm.commit(&mut txn);
                assert_eq!(txn.state(), TransactionState::Committed);
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(lm.is_clean());
    }

    #[test]
    fn test_shared_then_exclusive_conflicts() {
        let lm = Arc::new(LockManager::new(false));
        let rid = Rid::new(1, 1);

        // older txn 0 holds shared, younger txn 1 dies asking for exclusive
        let mut t0 = Transaction::new(0);
        let mut t1 = Transaction::new(1);
        assert!(lm.lock_shared(&mut t0, rid));
        assert!(!lm.lock_exclusive(&mut t1, rid));
        assert_eq!(t1.state(), TransactionState::Aborted);

        assert!(lm.unlock(&mut t0, rid));
        assert!(lm.is_clean());
    }

    #[test]
    fn test_older_txn_waits_for_younger_holder() {
        let lm = Arc::new(LockManager::new(false));
        let rid = Rid::new(2, 2);

        let mut t1 = Transaction::new(1);
        assert!(lm.lock_exclusive(&mut t1, rid));

        let lm2 = lm.clone();
        let waiter = thread::spawn(move || {
            let mut t0 = Transaction::new(0);
            // wait-die lets the older transaction block until the grant
            assert!(lm2.lock_exclusive(&mut t0, rid));
            assert!(lm2.unlock(&mut t0, rid));
        });

        thread::sleep(std::time::Duration::from_millis(50));
        assert!(lm.unlock(&mut t1, rid));
        waiter.join().unwrap();
        assert!(lm.is_clean());
    }

    #[test]
    fn test_shared_crowd_wakes_together() {
        let lm = Arc::new(LockManager::new(false));
        let rid = Rid::new(3, 3);

        let mut holder = Transaction::new(9);
        assert!(lm.lock_exclusive(&mut holder, rid));

        // older readers queue behind the younger holder, descending ids so
        // wait-die admits each of them
        let mut handles = vec![];
        for id in [3u64, 2, 1] {
            let lm = lm.clone();
            handles.push(thread::spawn(move || {
                let mut txn = Transaction::new(id);
                assert!(lm.lock_shared(&mut txn, rid));
                assert!(lm.unlock(&mut txn, rid));
            }));
            thread::sleep(std::time::Duration::from_millis(20));
        }

        assert!(lm.unlock(&mut holder, rid));
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(lm.is_clean());
    }

    #[test]
    fn test_upgrade_sole_holder_promotes_in_place() {
        let lm = LockManager::new(false);
        let rid = Rid::new(4, 4);

        let mut txn = Transaction::new(0);
        assert!(lm.lock_shared(&mut txn, rid));
        assert!(lm.lock_upgrade(&mut txn, rid));
        assert!(txn.exclusive_lock_set().contains(&rid));
        assert!(!txn.shared_lock_set().contains(&rid));

        // a younger reader now dies instead of waiting
        let mut young = Transaction::new(5);
        assert!(!lm.lock_shared(&mut young, rid));

        assert!(lm.unlock(&mut txn, rid));
        assert!(lm.is_clean());
    }

    #[test]
    fn test_upgrade_waits_for_other_reader() {
        let lm = Arc::new(LockManager::new(false));
        let rid = Rid::new(5, 5);

        let mut t1 = Transaction::new(1);
        assert!(lm.lock_shared(&mut t1, rid));

        let lm2 = lm.clone();
        let upgrader = thread::spawn(move || {
            let mut t0 = Transaction::new(0);
            assert!(lm2.lock_shared(&mut t0, rid));
            // blocks until t1 lets go, then holds exclusive
            assert!(lm2.lock_upgrade(&mut t0, rid));
            assert!(t0.exclusive_lock_set().contains(&rid));
            assert!(lm2.unlock(&mut t0, rid));
        });

        thread::sleep(std::time::Duration::from_millis(50));
        assert!(lm.unlock(&mut t1, rid));
        upgrader.join().unwrap();
        assert!(lm.is_clean());
    }

    #[test]
    fn test_non_strict_unlock_shrinks() {
        let lm = LockManager::new(false);
        let rid = Rid::new(6, 6);

        let mut txn = Transaction::new(0);
        assert!(lm.lock_shared(&mut txn, rid));
        assert!(lm.unlock(&mut txn, rid));
        assert_eq!(txn.state(), TransactionState::Shrinking);

        // no further lock is granted once shrinking
        assert!(!lm.lock_shared(&mut txn, Rid::new(6, 7)));
    }

    #[test]
    fn test_wait_die_storm_makes_progress() {
        const TXNS: u64 = 10;
        const RIDS: u32 = 1_000;

        let lm = Arc::new(LockManager::new(false));
        let tm = Arc::new(TransactionManager::new(lm.clone()));

        let mut handles = vec![];
        for id in 0..TXNS {
            let lm = lm.clone();
            let tm = tm.clone();
            handles.push(thread::spawn(move || {
                let mut rids: Vec<Rid> = (0..RIDS).map(|i| Rid::new(i as i32, i)).collect();
                rids.shuffle(&mut StdRng::seed_from_u64(id));

                loop {
                    let mut txn = Transaction::new(id);
                    let mut acquired_all = true;
                    for rid in &rids {
                        if !lm.lock_exclusive(&mut txn, *rid) {
                            tm.abort(&mut txn);
                            acquired_all = false;
                            break;
                        }
                    }
                    if acquired_all {
                        assert_eq!(txn.exclusive_lock_set().len(), RIDS as usize);
                        tm.commit(&mut txn);
                        return;
                    }
                    thread::yield_now();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(lm.is_clean());
    }

    #[test]
    fn test_strict_2pl_holds_locks_to_commit() {
        let lm = Arc::new(LockManager::new(true));
        let tm = Arc::new(TransactionManager::new(lm.clone()));
        let rid = Rid::new(7, 7);

        let mut txn = tm.begin();
        assert!(lm.lock_exclusive(&mut txn, rid));
        tm.commit(&mut txn);
        assert!(lm.is_clean());
        assert!(lm.is_clean_for(txn.id()));
    }
}
