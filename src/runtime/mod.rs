//! The seam between the engine and the code that actually runs contracts.
//!
//! A [`ContractRuntime`] answers GETAPI and INVOKE. While it runs it talks
//! back to the service manager through a [`Host`], which the engine endpoint
//! implements by issuing protocol requests.

mod builtin;
mod graph_cache;
mod native;

pub use builtin::CounterContract;
pub use graph_cache::ObjectGraphCache;
pub use native::{
    CallContext, NativeContract, NativeRuntime, STEP_EVENT, STEP_GET, STEP_INVOKE, STEP_SET,
};

use crate::error::IpcError;
use crate::ipc::value::{BigInt, Value};
use crate::types::{InvokeRequest, InvokeResult, LogLevel, Method, ObjectGraph, Status};
use address_monitor::Address;
use alloy_primitives::U256;
use std::any::Any;
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors a runtime can raise while handling a request.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The contract reverted on purpose.
    #[error("reverted with code {code}: {message}")]
    Revert {
        code: u32,
        step_used: BigInt,
        message: String,
    },

    /// The invocation failed; reported to the peer with zero steps used.
    #[error("{status}: {message}")]
    Failure { status: Status, message: String },

    /// The connection to the service manager broke.
    #[error(transparent)]
    Ipc(#[from] IpcError),
}

impl RuntimeError {
    pub fn failure(status: Status, message: impl Into<String>) -> Self {
        RuntimeError::Failure {
            status,
            message: message.into(),
        }
    }
}

/// State access offered to a running contract.
///
/// Every call is a blocking round trip to the service manager (or a
/// fire-and-forget notification where noted).
pub trait Host {
    fn get_info(&mut self) -> Result<BTreeMap<String, Value>, RuntimeError>;

    fn get_balance(&mut self, address: &Address) -> Result<U256, RuntimeError>;

    fn get_value(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, RuntimeError>;

    /// Writes (`Some`) or deletes (`None`) a storage value. Fire-and-forget.
    fn set_value(&mut self, key: &[u8], value: Option<&[u8]>) -> Result<(), RuntimeError>;

    /// Like [`Host::set_value`] but waits for the size of the value that was
    /// replaced, `None` if there was none.
    fn set_value_returning_size(
        &mut self,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> Result<Option<usize>, RuntimeError>;

    /// Calls another contract. The service manager may re-enter this engine
    /// with INVOKE before the result comes back.
    fn call(
        &mut self,
        to: &Address,
        value: U256,
        step_limit: U256,
        method: &str,
        params: Vec<Value>,
    ) -> Result<InvokeResult, RuntimeError>;

    /// Emits an event. Fire-and-forget.
    fn event(&mut self, indexed: Vec<Vec<u8>>, data: Vec<Vec<u8>>) -> Result<(), RuntimeError>;

    /// Forwards a log line to the service manager. Fire-and-forget.
    fn log(&mut self, level: LogLevel, message: &str) -> Result<(), RuntimeError>;

    /// Fetches the contract's object graph; the graph bytes are only sent
    /// when `want_full` is set.
    fn get_object_graph(&mut self, want_full: bool) -> Result<ObjectGraph, RuntimeError>;

    /// Stores the object graph. With `include_graph` unset only `next_hash`
    /// is updated.
    fn set_object_graph(
        &mut self,
        include_graph: bool,
        next_hash: u32,
        graph: &[u8],
    ) -> Result<(), RuntimeError>;

    fn set_code(&mut self, code: &[u8]) -> Result<(), RuntimeError>;

    fn set_fee_proportion(&mut self, proportion: i64) -> Result<(), RuntimeError>;

    /// Whether the current invocation asked for tracing.
    fn is_trace(&self) -> bool;
}

/// Runs contracts on behalf of the engine.
pub trait ContractRuntime: Send + Sync {
    /// API table of the contract stored at `path`.
    fn get_api(&self, path: &str) -> Result<Vec<Method>, RuntimeError>;

    fn invoke(&self, host: &mut dyn Host, request: &InvokeRequest) -> Result<InvokeResult, RuntimeError>;
}

/// Text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "runtime panicked".to_string()
    }
}
