//! Address-scoped concurrency control for parallel transaction execution.
//!
//! A batch of transactions, each with a fixed index giving its commit order,
//! runs on a pool of worker threads against a shared account store. The
//! result is the same as running them one by one in index order.
//!
//! # Core Components
//!
//! - **WorldState / TransactionalState**: shared account store and the private
//!   overlay each attempt writes to
//! - **TransactionTask**: one transaction across its attempts: abort flag,
//!   call depth, side-effect scopes, buffered output
//! - **AddressResourceMonitor**: per-address locks with priority preemption and
//!   index-ordered commit
//! - **ParallelExecutor**: worker pool and retry loop
//!
//! # Algorithm Overview
//!
//! 1. A task locks every address before touching its account
//! 2. If a lower-index task asks for an address held by a higher-index task,
//!    the holder is aborted
//! 3. An aborted task drops its overlay, releases its locks and starts over
//! 4. A task commits only when every lower index has committed
//!
//! # Example
//!
//! ```rust,ignore
//! use address_monitor::{Address, ExecutorConfig, ParallelExecutor, TxOutcome, WorldState};
//! use std::sync::Arc;
//!
//! let world = Arc::new(WorldState::new());
//! let executor = ParallelExecutor::new(ExecutorConfig { num_threads: 4 });
//! let result = executor.execute(world, &transfers, |tx, ctx| {
//!     ctx.account_mut(tx.from)?.nonce += 1;
//!     Ok(TxOutcome::Success)
//! });
//!
//! println!("Successful: {}, Rejected: {}", result.successful, result.rejected);
//! ```

pub mod executor;
pub mod monitor;
pub mod state;
pub mod task;
pub mod types;

pub use executor::{
    Aborted, BatchExecutionResult, ExecutorConfig, ParallelExecutor, Receipt, TaskContext,
    TxOutcome,
};
pub use monitor::AddressResourceMonitor;
pub use state::{Account, TransactionalState, WorldState};
pub use task::{Event, Instrumentation, TaskHandle, TransactionTask};
pub use types::{Address, AddressError, Incarnation, TxnIndex, ADDRESS_LEN};
