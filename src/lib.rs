//! Sandboxed contract execution engine.
//!
//! A service manager hands transactions to the engine over a local socket.
//! The engine runs one executor per transaction id, answers INVOKE with the
//! help of a [`ContractRuntime`], and reports state reads and writes back
//! over the same connection.
//!
//! # Architecture
//!
//! - **ipc**: RLP-framed protocol, the endpoint shared by every role, and the
//!   engine, executor-manager and service-manager specializations
//! - **runtime**: the seam to the code that runs contracts, with a native
//!   runtime and an engine-wide object-graph cache
//! - **executor / manager**: per-transaction executors and the manager that
//!   spawns and kills them
//! - **batch**: sequential and parallel execution of transfer workloads, the
//!   latter on the address resource monitor from [`address_monitor`]
//!
//! # Quick Start
//!
//! ```
//! use contract_engine::{BatchExecutor, ParallelExecutor, Workload, WorkloadConfig};
//! use std::sync::Arc;
//!
//! let workload = Workload::generate(WorkloadConfig {
//!     num_accounts: 100,
//!     num_transactions: 50,
//!     ..Default::default()
//! });
//! let state = Arc::new(workload.create_state());
//!
//! let result = ParallelExecutor::new(4).execute(state, &workload);
//! println!("Successful: {}", result.successful);
//! ```

pub mod batch;
pub mod config;
pub mod error;
pub mod executor;
pub mod ipc;
pub mod manager;
pub mod runtime;
pub mod types;
pub mod workload;

pub use batch::{BatchExecutor, ExecutionResult, ParallelExecutor, SequentialExecutor};
pub use config::EngineConfig;
pub use error::{IpcError, IpcResult, ProtocolError};
pub use executor::TransactionExecutor;
pub use manager::ExecutorManager;
pub use runtime::{ContractRuntime, Host, NativeRuntime, ObjectGraphCache, RuntimeError};
pub use types::{InvokeRequest, InvokeResult, Method, Status};
pub use workload::{Transfer, Workload, WorkloadConfig};

// Re-export the concurrency-control crate.
pub use address_monitor;
