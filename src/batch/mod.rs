//! Batch execution strategies for transfer workloads.
//!
//! [`SequentialExecutor`] is the reference: one transfer after another on the
//! calling thread. [`ParallelExecutor`] runs the same batch on a worker pool
//! under the address resource monitor and must end in the same state.

mod parallel;
mod sequential;

pub use parallel::ParallelExecutor;
pub use sequential::SequentialExecutor;

use crate::workload::{Transfer, Workload};
use address_monitor::{Account, WorldState};
use std::sync::Arc;

/// Result of executing a workload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionResult {
    /// Number of transfers applied.
    pub successful: usize,
    /// Number of transfers rejected (bad nonce or insufficient balance).
    pub failed: usize,
    /// Attempts thrown away after preemption. Always zero when sequential.
    pub aborts: usize,
}

impl ExecutionResult {
    pub fn new(successful: usize, failed: usize) -> Self {
        Self {
            successful,
            failed,
            aborts: 0,
        }
    }

    /// Total number of transactions processed.
    pub fn total(&self) -> usize {
        self.successful + self.failed
    }
}

/// A strategy for executing a transfer batch.
pub trait BatchExecutor {
    /// Executes the workload against `state`, leaving the result in it.
    fn execute(&self, state: Arc<WorldState>, workload: &Workload) -> ExecutionResult;

    /// Returns a human-readable name for this executor.
    fn name(&self) -> &'static str {
        "unknown"
    }
}

/// Applies one transfer to the sender and recipient records.
///
/// Returns the reason on rejection, in which case neither record changed.
pub(crate) fn apply_transfer(
    tx: &Transfer,
    from: &mut Account,
    to: &mut Account,
) -> Result<(), String> {
    if from.nonce != tx.nonce {
        return Err(format!("nonce {} expected, got {}", from.nonce, tx.nonce));
    }
    if from.balance < tx.value {
        return Err("insufficient balance".to_string());
    }
    from.balance -= tx.value;
    from.nonce += 1;
    to.balance += tx.value;
    Ok(())
}
