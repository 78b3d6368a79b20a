//! Engine side of a transaction connection.
//!
//! [`EngineProxy`] answers GETAPI and INVOKE from the service manager by
//! calling into a [`ContractRuntime`], and implements [`Host`] so the runtime
//! can reach back for state while it runs.

use crate::config::EngineConfig;
use crate::error::{IpcError, IpcResult, ProtocolError};
use crate::ipc::message::{Message, MsgType};
use crate::ipc::proxy::{MessageSender, Proxy};
use crate::ipc::transport::Transport;
use crate::ipc::value::Value;
use crate::runtime::{panic_message, ContractRuntime, Host, RuntimeError};
use crate::types::{
    set_value_flags, to_b256, to_u32, InvokeRequest, InvokeResult, LogLevel, ObjectGraph,
    Status,
};
use address_monitor::Address;
use alloy_primitives::U256;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, warn};

/// GETOBJGRAPH / SETOBJGRAPH flag: the graph bytes are included.
const GRAPH_INCLUDED: i64 = 1;

/// What one dispatched message amounts to.
enum Dispatch {
    Handled,
    Result(Message),
    Close,
}

pub struct EngineProxy<T: Transport> {
    proxy: Proxy<T>,
    runtime: Arc<dyn ContractRuntime>,
    trace: bool,
}

impl<T: Transport> EngineProxy<T> {
    pub fn new(proxy: Proxy<T>, runtime: Arc<dyn ContractRuntime>) -> Self {
        Self {
            proxy,
            runtime,
            trace: false,
        }
    }

    /// Sends VERSION with the version and client kind from `config`.
    pub fn connect(&mut self, uuid: &str, config: &EngineConfig) -> IpcResult<()> {
        self.proxy
            .connect_as(uuid, config.protocol_version, &config.client_kind)
    }

    pub fn sender(&self) -> Arc<MessageSender<T>> {
        self.proxy.sender()
    }

    pub fn close(&self) {
        self.proxy.close();
    }

    /// Serves requests until CLOSE or end of stream.
    pub fn handle_messages(&mut self) -> IpcResult<()> {
        loop {
            let msg = match self.proxy.recv() {
                Ok(msg) => msg,
                Err(e) if e.is_disconnect() => return Ok(()),
                Err(e) => return Err(e),
            };
            match self.dispatch(msg) {
                Ok(Dispatch::Handled) => {}
                Ok(Dispatch::Close) => return Ok(()),
                Ok(Dispatch::Result(_)) => {
                    return Err(self.violation("RESULT without a pending CALL"));
                }
                Err(e) if e.is_disconnect() => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    fn dispatch(&mut self, msg: Message) -> IpcResult<Dispatch> {
        match msg.msg_type {
            MsgType::GetApi => self.handle_get_api(&msg.payload).map(|_| Dispatch::Handled),
            MsgType::Invoke => self.handle_invoke(&msg.payload).map(|_| Dispatch::Handled),
            MsgType::Result => Ok(Dispatch::Result(msg)),
            MsgType::Close => Ok(Dispatch::Close),
            other => Err(self.violation(&format!("{other} sent to engine"))),
        }
    }

    fn handle_get_api(&mut self, payload: &Value) -> IpcResult<()> {
        let path = payload
            .as_str()
            .map_err(|e| self.proxy.violation(e))?
            .to_string();
        let runtime = self.runtime.clone();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| runtime.get_api(&path)));
        let reply = match outcome {
            Ok(Ok(methods)) => vec![
                Value::from(Status::Success.code()),
                Value::List(methods.iter().map(|m| m.to_value()).collect()),
            ],
            Ok(Err(RuntimeError::Ipc(e))) => return Err(e),
            Ok(Err(e)) => {
                debug!(path = %path, error = %e, "GETAPI failed");
                let status = match e {
                    RuntimeError::Failure { status, .. } => status,
                    _ => Status::UnknownFailure,
                };
                vec![Value::from(status.code()), Value::Nil]
            }
            Err(payload) => {
                warn!(path = %path, panic = %panic_message(&*payload), "runtime panicked in GETAPI");
                vec![Value::from(Status::UnknownFailure.code()), Value::Nil]
            }
        };
        self.proxy.send(MsgType::GetApi, reply)
    }

    fn handle_invoke(&mut self, payload: &Value) -> IpcResult<()> {
        let request = InvokeRequest::from_value(payload).map_err(|e| self.proxy.violation(e))?;
        debug!(code = %request.code, method = %request.method, "invoke");

        let saved_trace = std::mem::replace(&mut self.trace, request.is_trace());
        let runtime = self.runtime.clone();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| runtime.invoke(self, &request)));
        self.trace = saved_trace;

        let result = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(RuntimeError::Revert {
                code,
                step_used,
                message,
            })) => InvokeResult {
                status: Status::UserReversion(code),
                step_used,
                result: Value::from(message),
            },
            Ok(Err(RuntimeError::Failure { status, message })) => {
                InvokeResult::failure(status, 0i64, &message)
            }
            Ok(Err(RuntimeError::Ipc(e))) => return Err(e),
            Err(payload) => {
                let message = panic_message(&*payload);
                warn!(method = %request.method, panic = %message, "runtime panicked in INVOKE");
                InvokeResult::failure(Status::UnknownFailure, 0i64, &message)
            }
        };
        self.proxy.send(MsgType::Result, result.to_value())
    }

    fn request(&mut self, msg_type: MsgType, payload: impl Into<Value>) -> Result<Value, RuntimeError> {
        Ok(self.proxy.send_request(msg_type, payload)?.payload)
    }

    fn notify(&mut self, msg_type: MsgType, payload: impl Into<Value>) -> Result<(), RuntimeError> {
        Ok(self.proxy.send(msg_type, payload)?)
    }

    /// Closes the connection over a malformed reply.
    fn malformed(&self, err: ProtocolError) -> RuntimeError {
        RuntimeError::Ipc(self.proxy.violation(err))
    }

    fn violation(&self, what: &str) -> IpcError {
        self.proxy
            .violation(ProtocolError::UnexpectedMessage(what.to_string()))
    }
}

fn parse_object_graph(payload: &Value) -> Result<ObjectGraph, ProtocolError> {
    let items = payload.as_list()?;
    if items.len() != 2 && items.len() != 3 {
        return Err(ProtocolError::Arity {
            expected: 3,
            got: items.len(),
        });
    }
    Ok(ObjectGraph {
        next_hash: to_u32(items[0].as_u64()?)?,
        graph_hash: to_b256(items[1].as_bytes()?)?,
        graph_data: match items.get(2) {
            Some(graph) => Some(graph.as_bytes()?.to_vec()),
            None => None,
        },
    })
}

fn set_value_args(key: &[u8], value: Option<&[u8]>, flags: i64) -> Vec<Value> {
    match value {
        Some(v) => vec![Value::Bytes(key.to_vec()), Value::from(flags), Value::Bytes(v.to_vec())],
        None => vec![
            Value::Bytes(key.to_vec()),
            Value::from(flags | set_value_flags::DELETE),
            Value::Nil,
        ],
    }
}

impl<T: Transport> Host for EngineProxy<T> {
    fn get_info(&mut self) -> Result<BTreeMap<String, Value>, RuntimeError> {
        let reply = self.request(MsgType::GetInfo, Value::Nil)?;
        match reply {
            Value::Map(map) => Ok(map),
            other => Err(self.malformed(ProtocolError::UnexpectedValue {
                expected: "map",
                got: other.kind(),
            })),
        }
    }

    fn get_balance(&mut self, address: &Address) -> Result<U256, RuntimeError> {
        let reply = self.request(MsgType::GetBalance, *address)?;
        reply.as_u256().map_err(|e| self.malformed(e))
    }

    fn get_value(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, RuntimeError> {
        let reply = self.request(MsgType::GetValue, key.to_vec())?;
        let parsed = reply.as_tuple(2).and_then(|items| {
            if items[0].as_bool()? {
                Ok(Some(items[1].as_bytes()?.to_vec()))
            } else {
                Ok(None)
            }
        });
        parsed.map_err(|e| self.malformed(e))
    }

    fn set_value(&mut self, key: &[u8], value: Option<&[u8]>) -> Result<(), RuntimeError> {
        self.notify(MsgType::SetValue, set_value_args(key, value, 0))
    }

    fn set_value_returning_size(
        &mut self,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> Result<Option<usize>, RuntimeError> {
        let args = set_value_args(key, value, set_value_flags::OLDVALUE);
        let reply = self.request(MsgType::SetValue, args)?;
        let parsed = reply.as_tuple(2).and_then(|items| {
            if !items[0].as_bool()? {
                return Ok(None);
            }
            let size = items[1].as_u64()?;
            usize::try_from(size)
                .map(Some)
                .map_err(|_| ProtocolError::Malformed(format!("value size {size}")))
        });
        parsed.map_err(|e| self.malformed(e))
    }

    fn call(
        &mut self,
        to: &Address,
        value: U256,
        step_limit: U256,
        method: &str,
        params: Vec<Value>,
    ) -> Result<InvokeResult, RuntimeError> {
        self.notify(
            MsgType::Call,
            vec![
                Value::from(*to),
                Value::from(value),
                Value::from(step_limit),
                Value::from(method),
                Value::List(params),
            ],
        )?;
        // The manager may re-enter this engine before the RESULT arrives.
        loop {
            let msg = self.proxy.recv()?;
            match self.dispatch(msg)? {
                Dispatch::Handled => {}
                Dispatch::Result(reply) => {
                    return InvokeResult::from_value(&reply.payload).map_err(|e| self.malformed(e));
                }
                Dispatch::Close => return Err(IpcError::Disconnected.into()),
            }
        }
    }

    fn event(&mut self, indexed: Vec<Vec<u8>>, data: Vec<Vec<u8>>) -> Result<(), RuntimeError> {
        let indexed = indexed.into_iter().map(Value::Bytes).collect::<Vec<_>>();
        let data = data.into_iter().map(Value::Bytes).collect::<Vec<_>>();
        self.notify(MsgType::Event, vec![Value::List(indexed), Value::List(data)])
    }

    fn log(&mut self, level: LogLevel, message: &str) -> Result<(), RuntimeError> {
        let flag = if self.trace { crate::types::LOG_FLAG_TRACE } else { 0 };
        self.notify(
            MsgType::Log,
            vec![Value::from(level.code()), Value::from(flag), Value::from(message)],
        )
    }

    fn get_object_graph(&mut self, want_full: bool) -> Result<ObjectGraph, RuntimeError> {
        let flags = if want_full { GRAPH_INCLUDED } else { 0 };
        let reply = self.request(MsgType::GetObjGraph, flags)?;
        let graph = parse_object_graph(&reply).map_err(|e| self.malformed(e))?;
        if want_full && graph.graph_data.is_none() {
            return Err(self.malformed(ProtocolError::Malformed(
                "object graph requested but not sent".into(),
            )));
        }
        Ok(graph)
    }

    fn set_object_graph(
        &mut self,
        include_graph: bool,
        next_hash: u32,
        graph: &[u8],
    ) -> Result<(), RuntimeError> {
        let (flags, graph) = if include_graph {
            (GRAPH_INCLUDED, Value::Bytes(graph.to_vec()))
        } else {
            (0, Value::Nil)
        };
        self.notify(
            MsgType::SetObjGraph,
            vec![Value::from(flags), Value::from(u64::from(next_hash)), graph],
        )
    }

    fn set_code(&mut self, code: &[u8]) -> Result<(), RuntimeError> {
        self.notify(MsgType::SetCode, code.to_vec())
    }

    fn set_fee_proportion(&mut self, proportion: i64) -> Result<(), RuntimeError> {
        self.notify(MsgType::SetFeePct, proportion)
    }

    fn is_trace(&self) -> bool {
        self.trace
    }
}
