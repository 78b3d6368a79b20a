//! Parallel executor on top of the address resource monitor.

use super::{apply_transfer, BatchExecutor, ExecutionResult};
use crate::workload::{Transfer, Workload};
use address_monitor::{Aborted, ExecutorConfig, TaskContext, TxOutcome, WorldState};
use std::sync::Arc;

/// Runs transfers on a worker pool; commits stay in index order.
#[derive(Debug, Clone, Default)]
pub struct ParallelExecutor {
    pub config: ExecutorConfig,
}

impl ParallelExecutor {
    pub fn new(num_threads: usize) -> Self {
        Self {
            config: ExecutorConfig { num_threads },
        }
    }
}

/// Transfer logic run once per attempt.
fn run_transfer(tx: &Transfer, ctx: &mut TaskContext<'_>) -> Result<TxOutcome, Aborted> {
    // Lock in address order so both ends are held before either is read.
    let (first, second) = if tx.from <= tx.to { (tx.from, tx.to) } else { (tx.to, tx.from) };
    ctx.acquire(first)?;
    ctx.acquire(second)?;

    let mut from = ctx.account(tx.from)?.clone();
    let mut to = ctx.account(tx.to)?.clone();
    if let Err(reason) = apply_transfer(tx, &mut from, &mut to) {
        return Ok(TxOutcome::Rejected(reason));
    }
    *ctx.account_mut(tx.from)? = from;
    *ctx.account_mut(tx.to)? = to;
    Ok(TxOutcome::Success)
}

impl BatchExecutor for ParallelExecutor {
    fn execute(&self, state: Arc<WorldState>, workload: &Workload) -> ExecutionResult {
        let executor = address_monitor::ParallelExecutor::new(self.config.clone());
        let batch = executor.execute(state, &workload.transactions, run_transfer);
        ExecutionResult {
            successful: batch.successful,
            failed: batch.rejected,
            aborts: batch.aborts,
        }
    }

    fn name(&self) -> &'static str {
        "parallel"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::SequentialExecutor;
    use crate::workload::WorkloadConfig;

    fn compare(config: WorkloadConfig, threads: usize) {
        let workload = Workload::generate(config);

        let expected = Arc::new(workload.create_state());
        let seq = SequentialExecutor::new().execute(expected.clone(), &workload);

        let actual = Arc::new(workload.create_state());
        let par = ParallelExecutor::new(threads).execute(actual.clone(), &workload);

        assert_eq!(seq.successful, par.successful);
        assert_eq!(seq.failed, par.failed);
        assert_eq!(expected.snapshot(), actual.snapshot());
    }

    #[test]
    fn test_matches_sequential_without_conflicts() {
        compare(
            WorkloadConfig {
                num_accounts: 200,
                num_transactions: 100,
                conflict_factor: 0.0,
                seed: 1,
                ..Default::default()
            },
            4,
        );
    }

    #[test]
    fn test_matches_sequential_under_full_conflict() {
        compare(
            WorkloadConfig {
                num_accounts: 50,
                num_transactions: 200,
                conflict_factor: 1.0,
                seed: 2,
                ..Default::default()
            },
            8,
        );
    }

    #[test]
    fn test_matches_sequential_with_rejections() {
        compare(
            WorkloadConfig {
                num_accounts: 6,
                num_transactions: 150,
                conflict_factor: 0.5,
                seed: 3,
                initial_balance: 150,
            },
            4,
        );
    }
}
