use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::common::types::{Rid, TxnId};
use crate::transaction::transaction::{
    IsolationLevel, Result, Transaction, TransactionError, TransactionState,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Debug, Clone)]
pub struct LockManagerConfig {
    /// How often the background detector looks for waits-for cycles
    pub detection_interval: Duration,
}

impl Default for LockManagerConfig {
    fn default() -> Self {
        Self {
            detection_interval: Duration::from_millis(50),
        }
    }
}

struct LockRequest {
    txn: Arc<Transaction>,
    mode: LockMode,
}

#[derive(Default)]
struct LockEntry {
    /// Shared holders
    sharing: BTreeSet<TxnId>,
    /// At most one exclusive holder
    exclusive: Option<TxnId>,
    /// An upgrade from S to X is in flight; at most one per RID
    upgrading: bool,
    /// Blocked requests
    requests: Vec<LockRequest>,
    cv: Arc<Condvar>,
}

impl LockEntry {
    fn is_unused(&self) -> bool {
        self.sharing.is_empty()
            && self.exclusive.is_none()
            && self.requests.is_empty()
            && !self.upgrading
    }
}

struct LockState {
    table: HashMap<Rid, LockEntry>,
    /// waits_for[t1] contains t2 when t1 is blocked behind t2
    waits_for: BTreeMap<TxnId, BTreeSet<TxnId>>,
}

/// Tuple-granularity strict two-phase lock manager.
///
/// Waiters block on their RID's condition variable and re-check the grant
/// predicate on every wakeup. Deadlocks are handled by detection: a
/// background thread periodically rebuilds the waits-for graph from the
/// lock table, and victimises the youngest transaction of every cycle
/// until the graph is acyclic.
pub struct LockManager {
    config: LockManagerConfig,
    state: Mutex<LockState>,
    enabled: AtomicBool,
    detector: Mutex<Option<JoinHandle<()>>>,
}

impl LockManager {
    pub fn new(config: LockManagerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(LockState {
                table: HashMap::new(),
                waits_for: BTreeMap::new(),
            }),
            enabled: AtomicBool::new(false),
            detector: Mutex::new(None),
        }
    }

    /// Acquire a shared lock. Rejected outright at read-uncommitted
    /// isolation and in the shrinking phase; blocks until compatible.
    pub fn lock_shared(&self, txn: &Arc<Transaction>, rid: Rid) -> Result<()> {
        if txn.isolation_level() == IsolationLevel::ReadUncommitted {
            txn.set_state(TransactionState::Aborted);
            return Err(TransactionError::LockSharedOnReadUncommitted(txn.id()));
        }
        self.check_lockable(txn)?;
        if txn.is_shared_locked(rid) || txn.is_exclusive_locked(rid) {
            return Ok(());
        }
        self.wait_for_grant(txn, rid, LockMode::Shared)
    }

    /// Acquire an exclusive lock; blocks until no other holder remains.
    pub fn lock_exclusive(&self, txn: &Arc<Transaction>, rid: Rid) -> Result<()> {
        self.check_lockable(txn)?;
        if txn.is_exclusive_locked(rid) {
            return Ok(());
        }
        self.wait_for_grant(txn, rid, LockMode::Exclusive)
    }

    /// Atomically trade a shared lock for a queued exclusive request. At
    /// most one transaction may be upgrading a RID at a time; the loser
    /// of a race aborts with UPGRADE_CONFLICT.
    pub fn lock_upgrade(&self, txn: &Arc<Transaction>, rid: Rid) -> Result<()> {
        self.check_lockable(txn)?;
        if txn.is_exclusive_locked(rid) {
            return Ok(());
        }

        {
            let mut state = self.state.lock();
            let entry = state.table.entry(rid).or_default();
            if entry.upgrading {
                txn.set_state(TransactionState::Aborted);
                return Err(TransactionError::UpgradeConflict(txn.id()));
            }
            entry.upgrading = true;
            if entry.sharing.remove(&txn.id()) {
                txn.remove_shared_lock(rid);
            }
        }

        let result = self.wait_for_grant(txn, rid, LockMode::Exclusive);

        let mut state = self.state.lock();
        if let Some(entry) = state.table.get_mut(&rid) {
            entry.upgrading = false;
            entry.cv.notify_all();
        }
        result
    }

    /// Release one lock. Repeatable-read transactions transition to the
    /// shrinking phase; read-committed keeps growing across S releases.
    pub fn unlock(&self, txn: &Transaction, rid: Rid) -> Result<()> {
        let (held, was_exclusive) = {
            let mut state = self.state.lock();
            let mut held = false;
            let mut was_exclusive = false;
            if let Some(entry) = state.table.get_mut(&rid) {
                if entry.exclusive == Some(txn.id()) {
                    entry.exclusive = None;
                    held = true;
                    was_exclusive = true;
                } else if entry.sharing.remove(&txn.id()) {
                    held = true;
                }
                entry.cv.notify_all();
                if entry.is_unused() {
                    state.table.remove(&rid);
                }
            }
            (held, was_exclusive)
        };

        if held {
            if was_exclusive {
                txn.remove_exclusive_lock(rid);
            } else {
                txn.remove_shared_lock(rid);
            }
            let shrinks = was_exclusive
                || txn.isolation_level() != IsolationLevel::ReadCommitted;
            if shrinks && txn.state() == TransactionState::Growing {
                txn.set_state(TransactionState::Shrinking);
            }
        }
        Ok(())
    }

    /// Release everything a finished transaction still holds.
    pub fn release_all(&self, txn: &Transaction) {
        for rid in txn.exclusive_locks() {
            let _ = self.unlock(txn, rid);
        }
        for rid in txn.shared_locks() {
            let _ = self.unlock(txn, rid);
        }
    }

    fn check_lockable(&self, txn: &Transaction) -> Result<()> {
        match txn.state() {
            TransactionState::Growing => Ok(()),
            TransactionState::Shrinking => {
                txn.set_state(TransactionState::Aborted);
                Err(TransactionError::LockOnShrinking(txn.id()))
            }
            TransactionState::Aborted => Err(TransactionError::Deadlock(txn.id())),
            TransactionState::Committed => Err(TransactionError::InvalidState(txn.id())),
        }
    }

    /// Queue a request and block on the RID's condvar until the grant
    /// predicate holds or the transaction is aborted from outside.
    fn wait_for_grant(&self, txn: &Arc<Transaction>, rid: Rid, mode: LockMode) -> Result<()> {
        let txn_id = txn.id();
        let mut state = self.state.lock();
        let cv = {
            let entry = state.table.entry(rid).or_default();
            entry.requests.push(LockRequest {
                txn: Arc::clone(txn),
                mode,
            });
            entry.cv.clone()
        };

        loop {
            if txn.state() == TransactionState::Aborted {
                if let Some(entry) = state.table.get_mut(&rid) {
                    entry.requests.retain(|r| r.txn.id() != txn_id);
                    if entry.is_unused() {
                        state.table.remove(&rid);
                    }
                }
                return Err(TransactionError::Deadlock(txn_id));
            }

            let entry = state.table.entry(rid).or_default();
            let granted = match mode {
                // a request only conflicts with locks held by others
                LockMode::Shared => entry.exclusive.is_none(),
                LockMode::Exclusive => {
                    entry.exclusive.is_none()
                        && entry.sharing.iter().all(|&holder| holder == txn_id)
                }
            };
            if granted {
                entry.requests.retain(|r| r.txn.id() != txn_id);
                match mode {
                    LockMode::Shared => {
                        entry.sharing.insert(txn_id);
                        txn.add_shared_lock(rid);
                    }
                    LockMode::Exclusive => {
                        if entry.sharing.remove(&txn_id) {
                            txn.remove_shared_lock(rid);
                        }
                        entry.exclusive = Some(txn_id);
                        txn.add_exclusive_lock(rid);
                    }
                }
                return Ok(());
            }
            cv.wait(&mut state);
        }
    }

    // --- waits-for graph ---

    pub fn add_edge(&self, t1: TxnId, t2: TxnId) {
        self.state
            .lock()
            .waits_for
            .entry(t1)
            .or_default()
            .insert(t2);
    }

    pub fn remove_edge(&self, t1: TxnId, t2: TxnId) {
        let mut state = self.state.lock();
        if let Some(targets) = state.waits_for.get_mut(&t1) {
            targets.remove(&t2);
            if targets.is_empty() {
                state.waits_for.remove(&t1);
            }
        }
    }

    /// Every (waiter, holder) edge, sorted.
    pub fn get_edge_list(&self) -> Vec<(TxnId, TxnId)> {
        let state = self.state.lock();
        state
            .waits_for
            .iter()
            .flat_map(|(&t1, targets)| targets.iter().map(move |&t2| (t1, t2)))
            .collect()
    }

    /// Search the current graph for a cycle; returns the youngest (max
    /// txn id) member of the first one found.
    pub fn has_cycle(&self) -> Option<TxnId> {
        Self::find_victim(&self.state.lock().waits_for)
    }

    /// One detection round: rebuild the graph from the lock table and
    /// abort victims until it is acyclic. Also runs standalone in tests.
    pub fn run_detection_round(&self) {
        let mut state = self.state.lock();
        loop {
            Self::build_graph(&mut state);
            let Some(victim) = Self::find_victim(&state.waits_for) else {
                break;
            };

            let victim_txn = state
                .table
                .values()
                .flat_map(|entry| entry.requests.iter())
                .find(|r| r.txn.id() == victim)
                .map(|r| Arc::clone(&r.txn));
            let Some(victim_txn) = victim_txn else {
                // every cycle member is blocked, so this cannot happen;
                // bail rather than spin
                log::error!("deadlock victim {victim} has no pending request");
                break;
            };

            log::warn!("deadlock detected, aborting youngest txn {victim}");
            victim_txn.set_state(TransactionState::Aborted);

            // strip the victim's requests and held locks, then wake every
            // condvar it might be involved with
            let mut cvs = Vec::new();
            for entry in state.table.values_mut() {
                let mut touched = false;
                if entry.requests.iter().any(|r| r.txn.id() == victim) {
                    entry.requests.retain(|r| r.txn.id() != victim);
                    touched = true;
                }
                if entry.sharing.remove(&victim) {
                    touched = true;
                }
                if entry.exclusive == Some(victim) {
                    entry.exclusive = None;
                    touched = true;
                }
                if touched {
                    cvs.push(entry.cv.clone());
                }
            }
            for rid in victim_txn.shared_locks() {
                victim_txn.remove_shared_lock(rid);
            }
            for rid in victim_txn.exclusive_locks() {
                victim_txn.remove_exclusive_lock(rid);
            }
            state.table.retain(|_, entry| !entry.is_unused());
            for cv in cvs {
                cv.notify_all();
            }
        }
        state.waits_for.clear();
    }

    fn build_graph(state: &mut LockState) {
        let LockState { table, waits_for } = state;
        waits_for.clear();
        for entry in table.values() {
            for request in &entry.requests {
                let waiter = request.txn.id();
                if let Some(holder) = entry.exclusive {
                    if holder != waiter {
                        waits_for.entry(waiter).or_default().insert(holder);
                    }
                }
                if request.mode == LockMode::Exclusive {
                    for &holder in &entry.sharing {
                        if holder != waiter {
                            waits_for.entry(waiter).or_default().insert(holder);
                        }
                    }
                }
            }
        }
    }

    fn find_victim(graph: &BTreeMap<TxnId, BTreeSet<TxnId>>) -> Option<TxnId> {
        let mut visited = BTreeSet::new();
        let mut path = Vec::new();
        for &start in graph.keys() {
            if visited.contains(&start) {
                continue;
            }
            if let Some(victim) = Self::dfs(graph, start, &mut visited, &mut path) {
                return Some(victim);
            }
        }
        None
    }

    fn dfs(
        graph: &BTreeMap<TxnId, BTreeSet<TxnId>>,
        node: TxnId,
        visited: &mut BTreeSet<TxnId>,
        path: &mut Vec<TxnId>,
    ) -> Option<TxnId> {
        if let Some(pos) = path.iter().position(|&t| t == node) {
            return path[pos..].iter().copied().max();
        }
        if !visited.insert(node) {
            return None;
        }
        path.push(node);
        if let Some(targets) = graph.get(&node) {
            for &next in targets {
                if let Some(victim) = Self::dfs(graph, next, visited, path) {
                    return Some(victim);
                }
            }
        }
        path.pop();
        None
    }

    // --- background detector ---

    /// Spawn the cycle-detection thread.
    pub fn start_detection(self: &Arc<Self>) {
        let mut handle = self.detector.lock();
        if handle.is_some() {
            return;
        }
        self.enabled.store(true, Ordering::SeqCst);
        let manager = Arc::clone(self);
        *handle = Some(std::thread::spawn(move || {
            log::debug!("deadlock detector started");
            while manager.enabled.load(Ordering::SeqCst) {
                std::thread::sleep(manager.config.detection_interval);
                if !manager.enabled.load(Ordering::SeqCst) {
                    break;
                }
                manager.run_detection_round();
            }
            log::debug!("deadlock detector stopped");
        }));
    }

    /// Stop and join the detector.
    pub fn shutdown(&self) {
        self.enabled.store(false, Ordering::SeqCst);
        let handle = self.detector.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

impl Drop for LockManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
