//! Parallel batch executor driven by the address resource monitor.

use crate::monitor::AddressResourceMonitor;
use crate::state::{Account, WorldState};
use crate::task::{Event, TransactionTask};
use crate::types::{Address, Incarnation, TxnIndex};
use crossbeam::channel;
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// The current attempt of a task was preempted and has to be restarted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("transaction {0} aborted")]
pub struct Aborted(pub TxnIndex);

/// Final outcome of one transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxOutcome {
    Success,
    /// The transaction failed for good; its state writes are discarded but it
    /// still takes its commit slot.
    Rejected(String),
}

/// Configuration for parallel execution.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Number of worker threads.
    pub num_threads: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            num_threads: thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
        }
    }
}

/// What a committed transaction left behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub index: TxnIndex,
    pub outcome: TxOutcome,
    pub events: Vec<Event>,
    /// Attempt that finally committed.
    pub incarnation: Incarnation,
}

/// Result of executing one batch.
#[derive(Debug, Clone)]
pub struct BatchExecutionResult {
    pub successful: usize,
    pub rejected: usize,
    /// Attempts started, restarts included.
    pub attempts: usize,
    pub aborts: usize,
    /// Indices in the order they committed.
    pub commit_order: Vec<TxnIndex>,
    /// Receipts ordered by index.
    pub receipts: Vec<Receipt>,
    pub duration: Duration,
}

/// View of a task handed to transaction logic. Every account access goes
/// through the monitor first.
pub struct TaskContext<'a> {
    task: &'a mut TransactionTask,
    monitor: &'a AddressResourceMonitor,
}

impl<'a> TaskContext<'a> {
    pub fn new(task: &'a mut TransactionTask, monitor: &'a AddressResourceMonitor) -> Self {
        Self { task, monitor }
    }

    pub fn index(&self) -> TxnIndex {
        self.task.index()
    }

    pub fn incarnation(&self) -> Incarnation {
        self.task.incarnation()
    }

    pub fn check_abort(&self) -> Result<(), Aborted> {
        if self.task.is_aborted() {
            Err(Aborted(self.task.index()))
        } else {
            Ok(())
        }
    }

    pub fn acquire(&mut self, address: Address) -> Result<(), Aborted> {
        if self.monitor.acquire(address, self.task.handle()) {
            Ok(())
        } else {
            Err(Aborted(self.task.index()))
        }
    }

    pub fn account(&mut self, address: Address) -> Result<&Account, Aborted> {
        self.acquire(address)?;
        Ok(self.task.state_mut().account(&address))
    }

    pub fn account_mut(&mut self, address: Address) -> Result<&mut Account, Aborted> {
        self.acquire(address)?;
        Ok(self.task.state_mut().account_mut(&address))
    }

    pub fn storage_get(&mut self, address: Address, key: &[u8]) -> Result<Option<Vec<u8>>, Aborted> {
        Ok(self.account(address)?.storage.get(key).cloned())
    }

    /// Writes or deletes a storage slot, returning the previous value's size.
    pub fn storage_set(
        &mut self,
        address: Address,
        key: Vec<u8>,
        value: Option<Vec<u8>>,
    ) -> Result<Option<usize>, Aborted> {
        Ok(self.account_mut(address)?.set_storage(key, value))
    }

    pub fn enter_call(&mut self) -> Result<usize, Aborted> {
        self.check_abort()?;
        Ok(self.task.enter_call())
    }

    pub fn exit_call(&mut self, success: bool) {
        self.task.exit_call(success);
    }

    pub fn emit_event(&mut self, event: Event) {
        self.task.emit_event(event);
    }

    pub fn print(&mut self, text: &str) {
        self.task.output_println(text);
    }
}

/// Runs a batch of transactions on a worker pool, committing in index order.
pub struct ParallelExecutor {
    config: ExecutorConfig,
}

impl ParallelExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }

    /// Executes `transactions` against `world`.
    ///
    /// `logic` runs once per attempt. It returns `Err(Aborted)` when an
    /// account access was preempted; the attempt is then thrown away and run
    /// again. A panic in `logic` rejects the transaction.
    pub fn execute<T, F>(
        &self,
        world: Arc<WorldState>,
        transactions: &[T],
        logic: F,
    ) -> BatchExecutionResult
    where
        T: Sync,
        F: Fn(&T, &mut TaskContext<'_>) -> Result<TxOutcome, Aborted> + Sync,
    {
        let start = Instant::now();
        let num_txns = transactions.len();
        let num_threads = self.config.num_threads.max(1);
        let monitor = AddressResourceMonitor::new();

        // Indices go out in order, so the lowest uncommitted task always has
        // a worker.
        let (tx, rx) = channel::unbounded();
        for index in 0..num_txns {
            let _ = tx.send(index);
        }
        drop(tx);

        let attempts = AtomicUsize::new(0);
        let aborts = AtomicUsize::new(0);
        let receipts: Mutex<Vec<Option<Receipt>>> = Mutex::new(vec![None; num_txns]);

        thread::scope(|scope| {
            for worker_id in 0..num_threads {
                let rx = rx.clone();
                let world = &world;
                let monitor = &monitor;
                let logic = &logic;
                let attempts = &attempts;
                let aborts = &aborts;
                let receipts = &receipts;

                scope.spawn(move || {
                    let mut executed = 0usize;
                    for index in rx.iter() {
                        let receipt = Self::run_task(
                            index,
                            &transactions[index],
                            world,
                            monitor,
                            logic,
                            attempts,
                            aborts,
                        );
                        receipts.lock()[index] = Some(receipt);
                        executed += 1;
                    }
                    trace!(worker_id, executed, "worker done");
                });
            }
        });

        let receipts: Vec<Receipt> = receipts.into_inner().into_iter().flatten().collect();
        let rejected = receipts
            .iter()
            .filter(|r| matches!(r.outcome, TxOutcome::Rejected(_)))
            .count();
        let result = BatchExecutionResult {
            successful: receipts.len() - rejected,
            rejected,
            attempts: attempts.load(Ordering::Acquire),
            aborts: aborts.load(Ordering::Acquire),
            commit_order: monitor.commit_log(),
            receipts,
            duration: start.elapsed(),
        };

        info!(
            transactions = num_txns,
            threads = num_threads,
            successful = result.successful,
            rejected = result.rejected,
            aborts = result.aborts,
            elapsed_ms = result.duration.as_millis() as u64,
            "batch executed"
        );
        result
    }

    /// Retry loop of one transaction, until it commits.
    fn run_task<T, F>(
        index: TxnIndex,
        transaction: &T,
        world: &Arc<WorldState>,
        monitor: &AddressResourceMonitor,
        logic: &F,
        attempts: &AtomicUsize,
        aborts: &AtomicUsize,
    ) -> Receipt
    where
        F: Fn(&T, &mut TaskContext<'_>) -> Result<TxOutcome, Aborted>,
    {
        let mut task = TransactionTask::new(index, world.clone());
        loop {
            task.start_new_transaction();
            attempts.fetch_add(1, Ordering::Relaxed);

            let result = {
                let mut ctx = TaskContext::new(&mut task, monitor);
                panic::catch_unwind(AssertUnwindSafe(|| logic(transaction, &mut ctx)))
            };
            let outcome = match result {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(Aborted(_))) => {
                    aborts.fetch_add(1, Ordering::Relaxed);
                    monitor.release_all(task.handle());
                    debug!(index, incarnation = task.incarnation(), "attempt aborted, restarting");
                    continue;
                }
                Err(_) => {
                    warn!(index, "transaction logic panicked");
                    TxOutcome::Rejected("transaction logic panicked".to_string())
                }
            };

            let rejected = matches!(outcome, TxOutcome::Rejected(_));
            if monitor.commit(&mut task, rejected) {
                let events = if rejected { Vec::new() } else { task.take_events() };
                return Receipt {
                    index,
                    outcome,
                    events,
                    incarnation: task.incarnation(),
                };
            }
            aborts.fetch_add(1, Ordering::Relaxed);
            debug!(index, incarnation = task.incarnation(), "aborted before commit, restarting");
        }
    }
}
