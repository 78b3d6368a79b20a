//! Sequential reference executor.

use super::{apply_transfer, BatchExecutor, ExecutionResult};
use crate::workload::Workload;
use address_monitor::WorldState;
use std::sync::Arc;
use tracing::trace;

/// Processes transfers one at a time, in order.
#[derive(Debug, Clone, Default)]
pub struct SequentialExecutor;

impl SequentialExecutor {
    pub fn new() -> Self {
        Self
    }
}

impl BatchExecutor for SequentialExecutor {
    fn execute(&self, state: Arc<WorldState>, workload: &Workload) -> ExecutionResult {
        let mut result = ExecutionResult::default();

        for (index, tx) in workload.transactions.iter().enumerate() {
            let mut from = state.account(&tx.from).unwrap_or_default();
            let mut to = state.account(&tx.to).unwrap_or_default();
            match apply_transfer(tx, &mut from, &mut to) {
                Ok(()) => {
                    state.apply([(tx.from, from), (tx.to, to)]);
                    result.successful += 1;
                }
                Err(reason) => {
                    trace!(index, reason = %reason, "transfer rejected");
                    result.failed += 1;
                }
            }
        }

        result
    }

    fn name(&self) -> &'static str {
        "sequential"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workload::WorkloadConfig;

    #[test]
    fn test_sequential_executor() {
        let config = WorkloadConfig {
            num_accounts: 10,
            num_transactions: 5,
            seed: 42,
            ..Default::default()
        };

        let workload = Workload::generate(config);
        let state = Arc::new(workload.create_state());

        let result = SequentialExecutor::new().execute(state, &workload);

        assert_eq!(result.successful, 5);
        assert_eq!(result.failed, 0);
    }

    #[test]
    fn test_insufficient_balance_rejected() {
        let config = WorkloadConfig {
            num_accounts: 4,
            num_transactions: 50,
            initial_balance: 0,
            ..Default::default()
        };

        let workload = Workload::generate(config);
        let state = Arc::new(workload.create_state());
        let result = SequentialExecutor::new().execute(state.clone(), &workload);

        assert_eq!(result.successful, 0);
        assert_eq!(result.failed, 50);
        assert!(state.snapshot().values().all(|a| a.nonce == 0));
    }
}
