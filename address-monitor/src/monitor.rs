//! Address-scoped locking with priority preemption and index-ordered commit.
//!
//! Every account touched during a batch gets an [`AddressResource`] holding
//! its current owner and the tasks waiting for it, ordered by index. A request
//! from a task with a lower index than the current owner aborts the owner, so
//! the lowest-index contender never waits on a higher one and the batch always
//! makes progress. Commits are serialized by a counter: task `k` commits only
//! once tasks `0..k` have committed or been rejected.
//!
//! All monitor state sits behind one mutex with one condition variable.
//! Preemption touches another task's ownership and must be observed together
//! with the wait-queue update, so the lock is not split per resource.

use crate::task::{TaskHandle, TransactionTask};
use crate::types::{Address, TxnIndex};
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, trace};

/// Lock record for one account.
#[derive(Debug, Default)]
struct AddressResource {
    owner: Option<Arc<TaskHandle>>,
    /// Tasks registered on this resource, owner included, keyed by index.
    waiting: BTreeMap<TxnIndex, Arc<TaskHandle>>,
}

impl AddressResource {
    fn owner_index(&self) -> Option<TxnIndex> {
        self.owner.as_ref().map(|owner| owner.index())
    }

    fn first_waiter(&self) -> Option<TxnIndex> {
        self.waiting.keys().next().copied()
    }
}

#[derive(Debug, Default)]
struct MonitorState {
    resources: HashMap<Address, AddressResource>,
    /// Resources each task is registered on, for release without a scan.
    ownerships: HashMap<TxnIndex, HashSet<Address>>,
    /// Next index allowed to commit.
    commit_counter: TxnIndex,
    commit_log: Vec<TxnIndex>,
}

impl MonitorState {
    fn release(&mut self, index: TxnIndex) -> usize {
        let Some(addresses) = self.ownerships.remove(&index) else {
            return 0;
        };
        let count = addresses.len();
        for address in addresses {
            if let Some(resource) = self.resources.get_mut(&address) {
                resource.waiting.remove(&index);
                if resource.owner_index() == Some(index) {
                    resource.owner = None;
                }
            }
        }
        count
    }
}

/// Lock manager for one batch of transactions.
#[derive(Debug, Default)]
pub struct AddressResourceMonitor {
    state: Mutex<MonitorState>,
    cond: Condvar,
}

impl AddressResourceMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires `address` for `task`.
    ///
    /// Returns `true` once the task owns the resource, and `false` if the
    /// task got aborted while waiting. Acquiring a resource already held is a
    /// no-op success.
    pub fn acquire(&self, address: Address, task: &Arc<TaskHandle>) -> bool {
        let index = task.index();
        let mut state = self.state.lock();
        let MonitorState {
            resources,
            ownerships,
            ..
        } = &mut *state;

        let resource = resources.entry(address).or_default();
        if resource.owner_index() == Some(index) {
            return true;
        }
        resource
            .waiting
            .entry(index)
            .or_insert_with(|| task.clone());
        ownerships.entry(index).or_default().insert(address);

        if resource.first_waiter() == Some(index) {
            if let Some(owner) = &resource.owner {
                trace!(index, owner = owner.index(), %address, "preempting owner");
                owner.set_abort_state();
                self.cond.notify_all();
            }
        }

        loop {
            if task.is_aborted() {
                if let Some(resource) = state.resources.get_mut(&address) {
                    resource.waiting.remove(&index);
                }
                self.cond.notify_all();
                return false;
            }
            if let Some(resource) = state.resources.get_mut(&address) {
                if resource.owner.is_none() && resource.first_waiter() == Some(index) {
                    resource.owner = Some(task.clone());
                    return true;
                }
            }
            self.cond.wait(&mut state);
        }
    }

    /// Drops every registration and ownership of `task`.
    pub fn release_all(&self, task: &TaskHandle) {
        let released = self.state.lock().release(task.index());
        if released > 0 {
            trace!(index = task.index(), released, "released resources");
        }
        self.cond.notify_all();
    }

    /// Waits for the task's turn to commit, then applies its overlay (unless
    /// `rejected`) and releases everything it holds.
    ///
    /// Returns `false` if the task was aborted before its turn came; the
    /// caller must then start a new attempt.
    pub fn commit(&self, task: &mut TransactionTask, rejected: bool) -> bool {
        let index = task.index();
        let mut state = self.state.lock();
        while state.commit_counter != index && !task.is_aborted() {
            self.cond.wait(&mut state);
        }

        let committed = !task.is_aborted();
        if committed {
            if !rejected {
                let written = task.commit_state();
                task.output_flush();
                trace!(index, written, "committed");
            } else {
                debug!(index, "rejected transaction skipped");
            }
            state.commit_counter += 1;
            state.commit_log.push(index);
        }
        state.release(index);
        drop(state);
        self.cond.notify_all();
        committed
    }

    /// Aborts a task from outside and wakes it if it is waiting here.
    pub fn abort(&self, task: &TaskHandle) {
        let _state = self.state.lock();
        task.set_abort_state();
        self.cond.notify_all();
    }

    /// Resets the monitor for a new batch.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        *state = MonitorState::default();
        self.cond.notify_all();
    }

    pub fn commit_counter(&self) -> TxnIndex {
        self.state.lock().commit_counter
    }

    /// Indices in the order they committed.
    pub fn commit_log(&self) -> Vec<TxnIndex> {
        self.state.lock().commit_log.clone()
    }

    pub fn owner_of(&self, address: &Address) -> Option<TxnIndex> {
        self.state
            .lock()
            .resources
            .get(address)
            .and_then(AddressResource::owner_index)
    }

    /// Number of resources currently owned by `index`.
    pub fn held_count(&self, index: TxnIndex) -> usize {
        self.state
            .lock()
            .resources
            .values()
            .filter(|resource| resource.owner_index() == Some(index))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::WorldState;
    use alloy_primitives::U256;
    use std::thread;
    use std::time::Duration;

    fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..2000 {
            if cond() {
                return;
            }
            thread::sleep(Duration::from_millis(1));
        }
        panic!("condition not reached");
    }

    #[test]
    fn test_reentrant_acquire() {
        let monitor = AddressResourceMonitor::new();
        let task = TaskHandle::new(0);
        let a = Address::external(1);

        assert!(monitor.acquire(a, &task));
        assert!(monitor.acquire(a, &task));
        assert_eq!(monitor.owner_of(&a), Some(0));

        monitor.release_all(&task);
        assert_eq!(monitor.owner_of(&a), None);
        assert_eq!(monitor.held_count(0), 0);
    }

    #[test]
    fn test_lower_index_preempts_owner() {
        let monitor = Arc::new(AddressResourceMonitor::new());
        let a = Address::external(1);
        let low = TaskHandle::new(0);
        let high = TaskHandle::new(1);

        assert!(monitor.acquire(a, &high));

        let waiter = {
            let monitor = monitor.clone();
            let low = low.clone();
            thread::spawn(move || monitor.acquire(a, &low))
        };

        wait_until(|| high.is_aborted());
        monitor.release_all(&high);

        assert!(waiter.join().unwrap());
        assert_eq!(monitor.owner_of(&a), Some(0));
    }

    #[test]
    fn test_higher_index_waits_without_preempting() {
        let monitor = Arc::new(AddressResourceMonitor::new());
        let a = Address::external(1);
        let low = TaskHandle::new(0);
        let high = TaskHandle::new(1);

        assert!(monitor.acquire(a, &low));

        let waiter = {
            let monitor = monitor.clone();
            let high = high.clone();
            thread::spawn(move || monitor.acquire(a, &high))
        };

        thread::sleep(Duration::from_millis(20));
        assert!(!low.is_aborted());
        assert_eq!(monitor.owner_of(&a), Some(0));

        monitor.release_all(&low);
        assert!(waiter.join().unwrap());
        assert_eq!(monitor.owner_of(&a), Some(1));
    }

    #[test]
    fn test_abort_wakes_waiter() {
        let monitor = Arc::new(AddressResourceMonitor::new());
        let a = Address::external(1);
        let low = TaskHandle::new(0);
        let high = TaskHandle::new(1);

        assert!(monitor.acquire(a, &low));

        let waiter = {
            let monitor = monitor.clone();
            let high = high.clone();
            thread::spawn(move || monitor.acquire(a, &high))
        };

        thread::sleep(Duration::from_millis(10));
        monitor.abort(&high);
        assert!(!waiter.join().unwrap());
    }

    #[test]
    fn test_commit_in_index_order_and_releases() {
        let world = Arc::new(WorldState::new());
        let monitor = Arc::new(AddressResourceMonitor::new());
        let a = Address::external(1);
        let b = Address::external(2);

        let mut first = TransactionTask::new(0, world.clone());
        let mut second = TransactionTask::new(1, world.clone());
        first.start_new_transaction();
        second.start_new_transaction();

        assert!(monitor.acquire(b, second.handle()));
        second.state_mut().account_mut(&b).balance = U256::from(7);

        let committer = {
            let monitor = monitor.clone();
            thread::spawn(move || {
                let committed = monitor.commit(&mut second, false);
                (committed, second)
            })
        };

        thread::sleep(Duration::from_millis(10));
        assert_eq!(monitor.commit_counter(), 0);
        assert_eq!(world.balance(&b), U256::ZERO);

        assert!(monitor.acquire(a, first.handle()));
        assert!(monitor.commit(&mut first, true));
        assert_eq!(monitor.held_count(0), 0);

        let (committed, _second) = committer.join().unwrap();
        assert!(committed);
        assert_eq!(monitor.commit_counter(), 2);
        assert_eq!(monitor.commit_log(), vec![0, 1]);
        assert_eq!(monitor.held_count(1), 0);
        assert_eq!(world.balance(&b), U256::from(7));
    }

    #[test]
    fn test_clear_resets_batch() {
        let monitor = AddressResourceMonitor::new();
        let world = Arc::new(WorldState::new());
        let mut task = TransactionTask::new(0, world);
        task.start_new_transaction();

        assert!(monitor.acquire(Address::external(1), task.handle()));
        assert!(monitor.commit(&mut task, false));
        assert_eq!(monitor.commit_counter(), 1);

        monitor.clear();
        assert_eq!(monitor.commit_counter(), 0);
        assert!(monitor.commit_log().is_empty());
    }
}
