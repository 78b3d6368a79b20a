//! Typed payloads of the engine protocol.

use crate::error::ProtocolError;
use crate::ipc::value::{BigInt, Value};
use address_monitor::Address;
use alloy_primitives::{B256, U256};
use std::collections::BTreeMap;
use std::fmt;

/// Protocol version spoken by this crate.
pub const PROTOCOL_VERSION: i64 = 1;

/// Client kind announced in VERSION.
pub const CLIENT_KIND: &str = "rust";

/// Result status of an invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Success,
    UnknownFailure,
    ContractNotFound,
    MethodNotFound,
    MethodNotPayable,
    IllegalFormat,
    InvalidParameter,
    InvalidInstance,
    InvalidContainerAccess,
    AccessDenied,
    OutOfStep,
    OutOfBalance,
    Timeout,
    StackOverflow,
    SkipTransaction,
    PackageError,
    /// Revert raised by the contract itself, with its code (0-based).
    UserReversion(u32),
}

impl Status {
    pub const USER_REVERSION_START: i64 = 32;

    pub fn code(self) -> i64 {
        match self {
            Status::Success => 0,
            Status::UnknownFailure => 1,
            Status::ContractNotFound => 2,
            Status::MethodNotFound => 3,
            Status::MethodNotPayable => 4,
            Status::IllegalFormat => 5,
            Status::InvalidParameter => 6,
            Status::InvalidInstance => 7,
            Status::InvalidContainerAccess => 8,
            Status::AccessDenied => 9,
            Status::OutOfStep => 10,
            Status::OutOfBalance => 11,
            Status::Timeout => 12,
            Status::StackOverflow => 13,
            Status::SkipTransaction => 14,
            Status::PackageError => 15,
            Status::UserReversion(code) => Self::USER_REVERSION_START + i64::from(code),
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        let status = match code {
            0 => Status::Success,
            1 => Status::UnknownFailure,
            2 => Status::ContractNotFound,
            3 => Status::MethodNotFound,
            4 => Status::MethodNotPayable,
            5 => Status::IllegalFormat,
            6 => Status::InvalidParameter,
            7 => Status::InvalidInstance,
            8 => Status::InvalidContainerAccess,
            9 => Status::AccessDenied,
            10 => Status::OutOfStep,
            11 => Status::OutOfBalance,
            12 => Status::Timeout,
            13 => Status::StackOverflow,
            14 => Status::SkipTransaction,
            15 => Status::PackageError,
            c if c >= Self::USER_REVERSION_START => {
                Status::UserReversion(u32::try_from(c - Self::USER_REVERSION_START).ok()?)
            }
            _ => return None,
        };
        Some(status)
    }

    pub fn is_success(self) -> bool {
        self == Status::Success
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::UserReversion(code) => write!(f, "UserReversion({code})"),
            other => write!(f, "{other:?}"),
        }
    }
}

/// Invocation option bits.
pub mod options {
    pub const READ_ONLY: i64 = 1;
    pub const TRACE: i64 = 2;
}

/// SETVALUE flag bits.
pub mod set_value_flags {
    pub const DELETE: i64 = 1;
    pub const OLDVALUE: i64 = 2;
}

/// Keys of the GETINFO / INVOKE info map.
pub mod info {
    pub const BLOCK_HEIGHT: &str = "B.height";
    pub const BLOCK_TIMESTAMP: &str = "B.timestamp";
    pub const TX_HASH: &str = "T.hash";
    pub const TX_INDEX: &str = "T.index";
    pub const TX_FROM: &str = "T.from";
    pub const TX_TIMESTAMP: &str = "T.timestamp";
    pub const TX_NONCE: &str = "T.nonce";
    pub const STEP_COSTS: &str = "StepCosts";
    pub const CONTRACT_OWNER: &str = "C.owner";
    pub const REVISION: &str = "Revision";
}

/// LOG message flag: the message is an execution trace.
pub const LOG_FLAG_TRACE: i64 = 1;

/// Severity of a LOG message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Panic = 0,
    Fatal = 1,
    Error = 2,
    Warn = 3,
    Info = 4,
    Debug = 5,
    Trace = 6,
}

impl LogLevel {
    pub fn from_code(code: i64) -> Option<Self> {
        let level = match code {
            0 => LogLevel::Panic,
            1 => LogLevel::Fatal,
            2 => LogLevel::Error,
            3 => LogLevel::Warn,
            4 => LogLevel::Info,
            5 => LogLevel::Debug,
            6 => LogLevel::Trace,
            _ => return None,
        };
        Some(level)
    }

    pub fn code(self) -> i64 {
        self as i64
    }
}

/// Object-graph bookkeeping sent with an INVOKE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphState {
    pub next_hash: u32,
    pub graph_hash: B256,
    pub prev_eid: i64,
}

/// Request to run a contract method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvokeRequest {
    pub code: String,
    pub option: i64,
    pub from: Option<Address>,
    pub to: Option<Address>,
    pub value: U256,
    pub limit: U256,
    pub method: String,
    pub params: Vec<Value>,
    pub info: BTreeMap<String, Value>,
    pub contract_id: Vec<u8>,
    pub eid: i64,
    pub graph: Option<GraphState>,
}

impl InvokeRequest {
    pub fn is_read_only(&self) -> bool {
        self.option & options::READ_ONLY != 0
    }

    pub fn is_trace(&self) -> bool {
        self.option & options::TRACE != 0
    }

    pub fn to_value(&self) -> Value {
        let graph = match &self.graph {
            Some(g) => Value::List(vec![
                Value::from(u64::from(g.next_hash)),
                Value::Bytes(g.graph_hash.to_vec()),
                Value::from(g.prev_eid),
            ]),
            None => Value::Nil,
        };
        Value::List(vec![
            Value::from(self.code.as_str()),
            Value::from(self.option),
            Value::from(self.from),
            Value::from(self.to),
            Value::from(self.value),
            Value::from(self.limit),
            Value::from(self.method.as_str()),
            Value::List(self.params.clone()),
            Value::Map(self.info.clone()),
            Value::Bytes(self.contract_id.clone()),
            Value::from(self.eid),
            graph,
        ])
    }

    pub fn from_value(value: &Value) -> Result<Self, ProtocolError> {
        let items = value.as_tuple(12)?;
        let graph = if items[11].is_nil() {
            None
        } else {
            let g = items[11].as_tuple(3)?;
            Some(GraphState {
                next_hash: to_u32(g[0].as_u64()?)?,
                graph_hash: to_b256(g[1].as_bytes()?)?,
                prev_eid: g[2].as_i64()?,
            })
        };
        Ok(Self {
            code: items[0].as_str()?.to_string(),
            option: items[1].as_i64()?,
            from: items[2].as_opt_address()?,
            to: items[3].as_opt_address()?,
            value: items[4].as_u256()?,
            limit: items[5].as_u256()?,
            method: items[6].as_str()?.to_string(),
            params: items[7].as_list()?.to_vec(),
            info: items[8].as_map()?.clone(),
            contract_id: items[9].as_bytes()?.to_vec(),
            eid: items[10].as_i64()?,
            graph,
        })
    }
}

/// Outcome of an invocation, as carried by RESULT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvokeResult {
    pub status: Status,
    pub step_used: BigInt,
    pub result: Value,
}

impl InvokeResult {
    pub fn success(step_used: impl Into<BigInt>, result: Value) -> Self {
        Self {
            status: Status::Success,
            step_used: step_used.into(),
            result,
        }
    }

    pub fn failure(status: Status, step_used: impl Into<BigInt>, message: &str) -> Self {
        Self {
            status,
            step_used: step_used.into(),
            result: Value::from(message),
        }
    }

    pub fn to_value(&self) -> Value {
        Value::List(vec![
            Value::from(self.status.code()),
            Value::Int(self.step_used.clone()),
            self.result.clone(),
        ])
    }

    pub fn from_value(value: &Value) -> Result<Self, ProtocolError> {
        let items = value.as_tuple(3)?;
        let code = items[0].as_i64()?;
        let status = Status::from_code(code)
            .ok_or_else(|| ProtocolError::Malformed(format!("invalid status {code}")))?;
        Ok(Self {
            status,
            step_used: items[1].as_int()?.clone(),
            result: items[2].clone(),
        })
    }
}

/// Kind of an API table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodType {
    Function = 0,
    Fallback = 1,
    Event = 2,
}

impl MethodType {
    fn from_code(code: i64) -> Result<Self, ProtocolError> {
        match code {
            0 => Ok(MethodType::Function),
            1 => Ok(MethodType::Fallback),
            2 => Ok(MethodType::Event),
            other => Err(ProtocolError::Malformed(format!("invalid method type {other}"))),
        }
    }
}

/// Method flag bits.
pub mod method_flags {
    pub const READONLY: i64 = 1;
    pub const EXTERNAL: i64 = 2;
    pub const PAYABLE: i64 = 4;
    pub const ISOLATED: i64 = 8;
}

/// Parameter and return type codes.
pub mod data_type {
    pub const NONE: i64 = 0;
    pub const INTEGER: i64 = 1;
    pub const STRING: i64 = 2;
    pub const BYTES: i64 = 3;
    pub const BOOL: i64 = 4;
    pub const ADDRESS: i64 = 5;
    pub const LIST: i64 = 6;
    pub const DICT: i64 = 7;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parameter {
    pub name: String,
    pub descriptor: String,
    pub data_type: i64,
    pub optional: bool,
}

impl Parameter {
    pub fn new(name: &str, descriptor: &str, data_type: i64) -> Self {
        Self {
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            data_type,
            optional: false,
        }
    }

    fn to_value(&self) -> Value {
        Value::List(vec![
            Value::from(self.name.as_str()),
            Value::from(self.descriptor.as_str()),
            Value::from(self.data_type),
            Value::Bool(self.optional),
        ])
    }

    fn from_value(value: &Value) -> Result<Self, ProtocolError> {
        let items = value.as_tuple(4)?;
        Ok(Self {
            name: items[0].as_str()?.to_string(),
            descriptor: items[1].as_str()?.to_string(),
            data_type: items[2].as_i64()?,
            optional: items[3].as_bool()?,
        })
    }
}

/// One entry of a contract's API table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Method {
    pub method_type: MethodType,
    pub name: String,
    pub flags: i64,
    pub indexed: i64,
    pub inputs: Vec<Parameter>,
    pub output: i64,
    pub output_descriptor: String,
}

impl Method {
    pub fn function(name: &str, flags: i64, inputs: Vec<Parameter>, output: i64) -> Self {
        Self {
            method_type: MethodType::Function,
            name: name.to_string(),
            flags,
            indexed: 0,
            inputs,
            output,
            output_descriptor: String::new(),
        }
    }

    pub fn is_payable(&self) -> bool {
        self.flags & method_flags::PAYABLE != 0
    }

    pub fn is_readonly(&self) -> bool {
        self.flags & method_flags::READONLY != 0
    }

    pub fn to_value(&self) -> Value {
        Value::List(vec![
            Value::from(self.method_type as i64),
            Value::from(self.name.as_str()),
            Value::from(self.flags),
            Value::from(self.indexed),
            Value::List(self.inputs.iter().map(Parameter::to_value).collect()),
            Value::from(self.output),
            Value::from(self.output_descriptor.as_str()),
        ])
    }

    pub fn from_value(value: &Value) -> Result<Self, ProtocolError> {
        let items = value.as_tuple(7)?;
        Ok(Self {
            method_type: MethodType::from_code(items[0].as_i64()?)?,
            name: items[1].as_str()?.to_string(),
            flags: items[2].as_i64()?,
            indexed: items[3].as_i64()?,
            inputs: items[4]
                .as_list()?
                .iter()
                .map(Parameter::from_value)
                .collect::<Result<_, _>>()?,
            output: items[5].as_i64()?,
            output_descriptor: items[6].as_str()?.to_string(),
        })
    }
}

/// Object graph of a contract as exchanged by GETOBJGRAPH.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectGraph {
    pub next_hash: u32,
    pub graph_hash: B256,
    /// Missing when the peer only confirmed the hash.
    pub graph_data: Option<Vec<u8>>,
}

pub(crate) fn to_u32(v: u64) -> Result<u32, ProtocolError> {
    u32::try_from(v).map_err(|_| ProtocolError::Malformed(format!("{v} does not fit in u32")))
}

pub(crate) fn to_b256(bytes: &[u8]) -> Result<B256, ProtocolError> {
    if bytes.len() != 32 {
        return Err(ProtocolError::Malformed(format!(
            "hash must be 32 bytes, got {}",
            bytes.len()
        )));
    }
    Ok(B256::from_slice(bytes))
}
