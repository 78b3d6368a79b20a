//! Service-manager side of the protocol.
//!
//! The engine process is normally driven by an external service manager.
//! These endpoints let an embedder (or a test) take that role:
//! [`EngineManagerClient`] sends RUN and KILL over the control connection,
//! and [`ServiceManagerProxy`] drives one transaction connection, answering
//! the engine's state requests from a [`StateBackend`].

use crate::error::{IpcError, IpcResult, ProtocolError};
use crate::ipc::message::{Message, MsgType};
use crate::ipc::proxy::Proxy;
use crate::ipc::transport::Transport;
use crate::ipc::value::Value;
use crate::types::{
    set_value_flags, InvokeRequest, InvokeResult, LogLevel, Method, ObjectGraph, Status,
};
use address_monitor::{Address, Event, WorldState};
use alloy_primitives::U256;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, trace};

/// How the service manager answers a CALL from a running contract.
#[derive(Debug, Clone)]
pub enum CallAction {
    /// Run the callee on the same engine, re-entering it with INVOKE.
    Invoke(InvokeRequest),
    /// Answer the call directly.
    Result(InvokeResult),
}

/// Authoritative state behind a [`ServiceManagerProxy`].
pub trait StateBackend {
    /// Called before an INVOKE goes out, including nested ones.
    fn begin_invoke(&mut self, _request: &InvokeRequest) {}

    /// Called once the matching RESULT came back.
    fn end_invoke(&mut self, _result: &InvokeResult) {}

    fn get_info(&mut self) -> BTreeMap<String, Value> {
        BTreeMap::new()
    }

    fn get_balance(&mut self, address: &Address) -> U256;

    fn get_value(&mut self, key: &[u8]) -> Option<Vec<u8>>;

    /// Writes or deletes a value of the running contract and returns the
    /// size of the value it replaced.
    fn set_value(&mut self, key: &[u8], value: Option<Vec<u8>>) -> Option<usize>;

    fn call(
        &mut self,
        to: &Address,
        value: U256,
        step_limit: U256,
        method: &str,
        params: Vec<Value>,
    ) -> CallAction;

    fn event(&mut self, _indexed: Vec<Vec<u8>>, _data: Vec<Vec<u8>>) {}

    fn log(&mut self, level: LogLevel, trace: bool, message: &str) {
        debug!(?level, trace, msg = message, "contract log");
    }

    /// Current object graph of the running contract, bytes included.
    fn object_graph(&mut self) -> ObjectGraph;

    fn set_object_graph(&mut self, next_hash: u32, graph: Option<Vec<u8>>);

    fn set_code(&mut self, _code: Vec<u8>) {}

    fn set_fee_proportion(&mut self, _proportion: i64) {}
}

/// Counters of object-graph traffic on one connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GraphStats {
    pub requests: u64,
    /// GETOBJGRAPH replies that carried the graph bytes.
    pub full_transfers: u64,
    /// SETOBJGRAPH messages that carried the graph bytes.
    pub uploads: u64,
}

/// Drives one transaction connection from the service-manager side.
pub struct ServiceManagerProxy<T: Transport> {
    proxy: Proxy<T>,
    peer: Option<String>,
    stats: GraphStats,
}

impl<T: Transport> ServiceManagerProxy<T> {
    pub fn new(proxy: Proxy<T>) -> Self {
        Self {
            proxy,
            peer: None,
            stats: GraphStats::default(),
        }
    }

    /// Waits for the engine's VERSION and returns the transaction id it
    /// announced.
    pub fn accept(&mut self) -> IpcResult<String> {
        let identity = self.proxy.accept()?;
        self.peer = Some(identity.clone());
        Ok(identity)
    }

    pub fn peer(&self) -> Option<&str> {
        self.peer.as_deref()
    }

    pub fn stats(&self) -> GraphStats {
        self.stats
    }

    /// Asks for a contract's API table; `Err` holds the failure status.
    pub fn get_api(&mut self, path: &str) -> IpcResult<Result<Vec<Method>, Status>> {
        let reply = self.proxy.send_request(MsgType::GetApi, path)?;
        let parsed = reply.payload.as_tuple(2).and_then(|items| {
            let code = items[0].as_i64()?;
            let status = Status::from_code(code)
                .ok_or_else(|| ProtocolError::Malformed(format!("invalid status {code}")))?;
            if !status.is_success() {
                return Ok(Err(status));
            }
            let methods = items[1]
                .as_list()?
                .iter()
                .map(Method::from_value)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Ok(methods))
        });
        self.parse(parsed)
    }

    /// Runs a method on the engine, serving its state requests until the
    /// RESULT comes back.
    pub fn invoke(
        &mut self,
        backend: &mut dyn StateBackend,
        request: &InvokeRequest,
    ) -> IpcResult<InvokeResult> {
        backend.begin_invoke(request);
        self.proxy.send(MsgType::Invoke, request.to_value())?;
        loop {
            let msg = self.proxy.recv()?;
            if let Some(result) = self.serve(backend, msg)? {
                backend.end_invoke(&result);
                return Ok(result);
            }
        }
    }

    /// Sends CLOSE so the executor ends, then drops the connection.
    pub fn close(&self) -> IpcResult<()> {
        let sent = match self.proxy.send(MsgType::Close, Value::Nil) {
            Err(e) if e.is_disconnect() => Ok(()),
            other => other,
        };
        self.proxy.close();
        sent
    }

    /// Reads one message while no request is outstanding. Used to observe an
    /// engine going away.
    pub fn recv(&mut self) -> IpcResult<Message> {
        self.proxy.recv()
    }

    fn parse<V>(&self, parsed: Result<V, ProtocolError>) -> IpcResult<V> {
        parsed.map_err(|e| self.proxy.violation(e))
    }

    fn serve(
        &mut self,
        backend: &mut dyn StateBackend,
        msg: Message,
    ) -> IpcResult<Option<InvokeResult>> {
        let payload = &msg.payload;
        match msg.msg_type {
            MsgType::Result => {
                return self.parse(InvokeResult::from_value(payload)).map(Some);
            }
            MsgType::GetValue => {
                let key = self.parse(payload.as_bytes())?;
                let reply = match backend.get_value(key) {
                    Some(v) => vec![Value::Bool(true), Value::Bytes(v)],
                    None => vec![Value::Bool(false), Value::Nil],
                };
                self.proxy.send(MsgType::GetValue, reply)?;
            }
            MsgType::SetValue => {
                let (key, flags, value) = self.parse(parse_set_value(payload))?;
                let value = if flags & set_value_flags::DELETE != 0 {
                    None
                } else {
                    Some(value.ok_or_else(|| {
                        self.proxy
                            .violation(ProtocolError::Malformed("SETVALUE without value".into()))
                    })?)
                };
                let prev = backend.set_value(&key, value);
                if flags & set_value_flags::OLDVALUE != 0 {
                    let size = prev.unwrap_or(0) as u64;
                    self.proxy.send(
                        MsgType::SetValue,
                        vec![Value::Bool(prev.is_some()), Value::from(size)],
                    )?;
                }
            }
            MsgType::GetBalance => {
                let address = self.parse(payload.as_address())?;
                let balance = backend.get_balance(&address);
                self.proxy.send(MsgType::GetBalance, balance)?;
            }
            MsgType::GetInfo => {
                let info = backend.get_info();
                self.proxy.send(MsgType::GetInfo, info)?;
            }
            MsgType::Call => {
                let (to, value, limit, method, params) = self.parse(parse_call(payload))?;
                let result = match backend.call(&to, value, limit, &method, params) {
                    CallAction::Invoke(request) => self.invoke(backend, &request)?,
                    CallAction::Result(result) => result,
                };
                self.proxy.send(MsgType::Result, result.to_value())?;
            }
            MsgType::Event => {
                let (indexed, data) = self.parse(parse_event(payload))?;
                backend.event(indexed, data);
            }
            MsgType::Log => {
                let (level, flag, message) = self.parse(parse_log(payload))?;
                backend.log(level, flag & crate::types::LOG_FLAG_TRACE != 0, &message);
            }
            MsgType::GetObjGraph => {
                let flags = self.parse(payload.as_i64())?;
                let graph = backend.object_graph();
                self.stats.requests += 1;
                let mut reply = vec![
                    Value::from(u64::from(graph.next_hash)),
                    Value::Bytes(graph.graph_hash.to_vec()),
                ];
                if flags & 1 != 0 {
                    self.stats.full_transfers += 1;
                    reply.push(Value::Bytes(graph.graph_data.unwrap_or_default()));
                }
                self.proxy.send(MsgType::GetObjGraph, reply)?;
            }
            MsgType::SetObjGraph => {
                let (next_hash, graph) = self.parse(parse_set_object_graph(payload))?;
                if graph.is_some() {
                    self.stats.uploads += 1;
                }
                backend.set_object_graph(next_hash, graph);
            }
            MsgType::SetCode => {
                let code = self.parse(payload.as_bytes())?.to_vec();
                backend.set_code(code);
            }
            MsgType::SetFeePct => {
                let proportion = self.parse(payload.as_i64())?;
                backend.set_fee_proportion(proportion);
            }
            other => {
                return Err(self.proxy.violation(ProtocolError::UnexpectedMessage(format!(
                    "{other} from engine"
                ))))
            }
        }
        Ok(None)
    }
}

fn parse_set_value(payload: &Value) -> Result<(Vec<u8>, i64, Option<Vec<u8>>), ProtocolError> {
    let items = payload.as_tuple(3)?;
    Ok((
        items[0].as_bytes()?.to_vec(),
        items[1].as_i64()?,
        items[2].as_opt_bytes()?.map(<[u8]>::to_vec),
    ))
}

type CallArgs = (Address, U256, U256, String, Vec<Value>);

fn parse_call(payload: &Value) -> Result<CallArgs, ProtocolError> {
    let items = payload.as_tuple(5)?;
    Ok((
        items[0].as_address()?,
        items[1].as_u256()?,
        items[2].as_u256()?,
        items[3].as_str()?.to_string(),
        items[4].as_list()?.to_vec(),
    ))
}

fn parse_topics(value: &Value) -> Result<Vec<Vec<u8>>, ProtocolError> {
    value
        .as_list()?
        .iter()
        .map(|v| v.as_bytes().map(<[u8]>::to_vec))
        .collect()
}

fn parse_event(payload: &Value) -> Result<(Vec<Vec<u8>>, Vec<Vec<u8>>), ProtocolError> {
    let items = payload.as_tuple(2)?;
    Ok((parse_topics(&items[0])?, parse_topics(&items[1])?))
}

fn parse_log(payload: &Value) -> Result<(LogLevel, i64, String), ProtocolError> {
    let items = payload.as_tuple(3)?;
    let code = items[0].as_i64()?;
    let level = LogLevel::from_code(code)
        .ok_or_else(|| ProtocolError::Malformed(format!("invalid log level {code}")))?;
    Ok((level, items[1].as_i64()?, items[2].as_str()?.to_string()))
}

fn parse_set_object_graph(payload: &Value) -> Result<(u32, Option<Vec<u8>>), ProtocolError> {
    let items = payload.as_tuple(3)?;
    let flags = items[0].as_i64()?;
    let next_hash = crate::types::to_u32(items[1].as_u64()?)?;
    let graph = items[2].as_opt_bytes()?.map(<[u8]>::to_vec);
    if flags & 1 != 0 && graph.is_none() {
        return Err(ProtocolError::Malformed("SETOBJGRAPH flagged without graph".into()));
    }
    Ok((next_hash, graph))
}

/// Control client for an executor manager: sends RUN and KILL, receives END.
pub struct EngineManagerClient<T: Transport> {
    proxy: Proxy<T>,
}

impl<T: Transport> EngineManagerClient<T> {
    pub fn new(proxy: Proxy<T>) -> Self {
        Self { proxy }
    }

    /// Waits for the executor manager's VERSION.
    pub fn accept(&mut self) -> IpcResult<String> {
        self.proxy.accept()
    }

    pub fn run(&self, uuid: &str) -> IpcResult<()> {
        self.proxy.send(MsgType::Run, uuid)
    }

    pub fn kill(&self, uuid: &str) -> IpcResult<()> {
        self.proxy.send(MsgType::Kill, uuid)
    }

    /// Blocks for the next END and returns its transaction id.
    pub fn next_end(&mut self) -> IpcResult<String> {
        let msg = self.proxy.recv()?;
        if msg.msg_type != MsgType::End {
            return Err(self.proxy.violation(ProtocolError::UnexpectedMessage(format!(
                "{} on control connection",
                msg.msg_type
            ))));
        }
        let uuid = msg
            .payload
            .as_str()
            .map_err(|e| self.proxy.violation(e))?
            .to_string();
        trace!(uuid = %uuid, "END received");
        Ok(uuid)
    }

    /// Sends CLOSE, which stops the executor manager.
    pub fn close(&self) -> IpcResult<()> {
        let sent = match self.proxy.send(MsgType::Close, Value::Nil) {
            Err(IpcError::Disconnected) | Err(IpcError::Closed) => Ok(()),
            other => other,
        };
        self.proxy.close();
        sent
    }
}

/// A [`StateBackend`] over a [`WorldState`].
///
/// Contracts are deployed at addresses and routed to code paths; CALLs to a
/// deployed address re-enter the engine, anything else fails with
/// `ContractNotFound`.
pub struct WorldStateBackend {
    world: Arc<WorldState>,
    routes: HashMap<Address, String>,
    info: BTreeMap<String, Value>,
    frames: Vec<Address>,
    events: Vec<Event>,
    logs: Vec<(LogLevel, String)>,
}

impl WorldStateBackend {
    pub fn new(world: Arc<WorldState>) -> Self {
        Self {
            world,
            routes: HashMap::new(),
            info: BTreeMap::new(),
            frames: Vec::new(),
            events: Vec::new(),
            logs: Vec::new(),
        }
    }

    /// Routes `address` to the contract at `path`.
    pub fn deploy(&mut self, address: Address, path: &str) {
        self.routes.insert(address, path.to_string());
        self.world
            .update(address, |account| account.code = Some(path.as_bytes().to_vec()));
    }

    pub fn set_info(&mut self, key: &str, value: Value) {
        self.info.insert(key.to_string(), value);
    }

    /// Request for `method` on the contract deployed at `to`.
    pub fn request(&self, from: Address, to: Address, method: &str, params: Vec<Value>) -> InvokeRequest {
        InvokeRequest {
            code: self.routes.get(&to).cloned().unwrap_or_default(),
            option: 0,
            from: Some(from),
            to: Some(to),
            value: U256::ZERO,
            limit: U256::from(10_000_000u64),
            method: method.to_string(),
            params,
            info: self.info.clone(),
            contract_id: to.to_vec(),
            eid: 0,
            graph: None,
        }
    }

    pub fn world(&self) -> &Arc<WorldState> {
        &self.world
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn logs(&self) -> &[(LogLevel, String)] {
        &self.logs
    }

    fn current(&self) -> Option<Address> {
        self.frames.last().copied()
    }
}

impl StateBackend for WorldStateBackend {
    fn begin_invoke(&mut self, request: &InvokeRequest) {
        if let Some(to) = request.to {
            self.frames.push(to);
        }
    }

    fn end_invoke(&mut self, _result: &InvokeResult) {
        self.frames.pop();
    }

    fn get_info(&mut self) -> BTreeMap<String, Value> {
        self.info.clone()
    }

    fn get_balance(&mut self, address: &Address) -> U256 {
        self.world.balance(address)
    }

    fn get_value(&mut self, key: &[u8]) -> Option<Vec<u8>> {
        let contract = self.current()?;
        self.world.account(&contract)?.storage.get(key).cloned()
    }

    fn set_value(&mut self, key: &[u8], value: Option<Vec<u8>>) -> Option<usize> {
        let contract = self.current()?;
        self.world
            .update(contract, |account| account.set_storage(key.to_vec(), value))
    }

    fn call(
        &mut self,
        to: &Address,
        value: U256,
        step_limit: U256,
        method: &str,
        params: Vec<Value>,
    ) -> CallAction {
        let Some(code) = self.routes.get(to) else {
            return CallAction::Result(InvokeResult::failure(
                Status::ContractNotFound,
                0i64,
                &format!("nothing deployed at {to}"),
            ));
        };
        CallAction::Invoke(InvokeRequest {
            code: code.clone(),
            option: 0,
            from: self.current(),
            to: Some(*to),
            value,
            limit: step_limit,
            method: method.to_string(),
            params,
            info: self.info.clone(),
            contract_id: to.to_vec(),
            eid: 0,
            graph: None,
        })
    }

    fn event(&mut self, indexed: Vec<Vec<u8>>, data: Vec<Vec<u8>>) {
        if let Some(address) = self.current() {
            self.events.push(Event {
                address,
                indexed,
                data,
            });
        }
    }

    fn log(&mut self, level: LogLevel, _trace: bool, message: &str) {
        self.logs.push((level, message.to_string()));
    }

    fn object_graph(&mut self) -> ObjectGraph {
        let account = self
            .current()
            .and_then(|contract| self.world.account(&contract))
            .unwrap_or_default();
        ObjectGraph {
            next_hash: account.next_hash,
            graph_hash: account.object_graph_hash,
            graph_data: Some(account.object_graph),
        }
    }

    fn set_object_graph(&mut self, next_hash: u32, graph: Option<Vec<u8>>) {
        if let Some(contract) = self.current() {
            self.world
                .update(contract, |account| account.set_object_graph(next_hash, graph));
        }
    }

    fn set_code(&mut self, code: Vec<u8>) {
        if let Some(contract) = self.current() {
            self.world.update(contract, |account| account.code = Some(code));
        }
    }
}
