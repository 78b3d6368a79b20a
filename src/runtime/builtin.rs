//! Contracts shipped with the engine.

use super::native::{CallContext, NativeContract};
use super::RuntimeError;
use crate::ipc::value::Value;
use crate::types::{data_type, method_flags, Method, Parameter, Status};
use alloy_primitives::U256;

const COUNT_KEY: &[u8] = b"count";

/// A counter kept in storage, with a label kept in the object graph.
///
/// Small, but it touches every host call a real contract makes, which is
/// what the binary and the integration tests need from it.
#[derive(Debug, Clone, Copy, Default)]
pub struct CounterContract;

impl CounterContract {
    pub const PATH: &'static str = "builtin/counter";

    fn read_count(ctx: &mut CallContext<'_>) -> Result<u64, RuntimeError> {
        match ctx.get_value(COUNT_KEY)? {
            None => Ok(0),
            Some(bytes) => {
                let raw: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
                    RuntimeError::failure(Status::InvalidInstance, "corrupt counter value")
                })?;
                Ok(u64::from_be_bytes(raw))
            }
        }
    }

    fn int_param(params: &[Value], index: usize, default: i64) -> Result<i64, RuntimeError> {
        match params.get(index) {
            None | Some(Value::Nil) => Ok(default),
            Some(v) => v
                .as_i64()
                .map_err(|e| RuntimeError::failure(Status::InvalidParameter, e.to_string())),
        }
    }

    fn str_param(params: &[Value], index: usize) -> Result<&str, RuntimeError> {
        params
            .get(index)
            .ok_or_else(|| RuntimeError::failure(Status::InvalidParameter, "missing parameter"))?
            .as_str()
            .map_err(|e| RuntimeError::failure(Status::InvalidParameter, e.to_string()))
    }
}

impl NativeContract for CounterContract {
    fn api(&self) -> Vec<Method> {
        let external = method_flags::EXTERNAL;
        let readonly = method_flags::EXTERNAL | method_flags::READONLY;
        let mut amount = Parameter::new("amount", "int", data_type::INTEGER);
        amount.optional = true;
        vec![
            Method::function("get", readonly, vec![], data_type::INTEGER),
            Method::function("increment", external, vec![amount], data_type::INTEGER),
            Method::function("label", readonly, vec![], data_type::STRING),
            Method::function(
                "setLabel",
                external,
                vec![Parameter::new("label", "str", data_type::STRING)],
                data_type::NONE,
            ),
            Method::function("balance", readonly, vec![], data_type::INTEGER),
            Method::function(
                "deposit",
                external | method_flags::PAYABLE,
                vec![],
                data_type::INTEGER,
            ),
            Method::function(
                "forward",
                external,
                vec![
                    Parameter::new("target", "address", data_type::ADDRESS),
                    Parameter::new("method", "str", data_type::STRING),
                ],
                data_type::NONE,
            ),
            Method::function(
                "fail",
                external,
                vec![Parameter::new("code", "int", data_type::INTEGER)],
                data_type::NONE,
            ),
        ]
    }

    fn invoke(
        &self,
        ctx: &mut CallContext<'_>,
        method: &str,
        params: &[Value],
    ) -> Result<Value, RuntimeError> {
        match method {
            "get" => Ok(Value::from(Self::read_count(ctx)?)),
            "increment" => {
                let amount = Self::int_param(params, 0, 1)?;
                let amount = u64::try_from(amount).map_err(|_| {
                    RuntimeError::failure(Status::InvalidParameter, "amount must not be negative")
                })?;
                let count = Self::read_count(ctx)?.checked_add(amount).ok_or_else(|| {
                    RuntimeError::failure(Status::InvalidParameter, "counter overflow")
                })?;
                ctx.set_value(COUNT_KEY, Some(&count.to_be_bytes()))?;
                ctx.event(
                    vec![b"Incremented(int)".to_vec()],
                    vec![count.to_be_bytes().to_vec()],
                )?;
                if ctx.host().is_trace() {
                    ctx.host()
                        .log(crate::types::LogLevel::Trace, &format!("count={count}"))?;
                }
                Ok(Value::from(count))
            }
            "label" => {
                let graph = ctx.load_graph()?;
                let bytes = graph.graph_data.unwrap_or_default();
                let label = String::from_utf8(bytes).map_err(|_| {
                    RuntimeError::failure(Status::InvalidInstance, "label is not utf-8")
                })?;
                Ok(Value::from(label))
            }
            "setLabel" => {
                let label = Self::str_param(params, 0)?.to_string();
                let graph = ctx.load_graph()?;
                let next_hash = graph.next_hash.wrapping_add(1);
                ctx.store_graph(&graph, next_hash, label.into_bytes())?;
                Ok(Value::Nil)
            }
            "balance" => {
                let Some(me) = ctx.request().to else {
                    return Err(RuntimeError::failure(
                        Status::InvalidInstance,
                        "invocation has no target address",
                    ));
                };
                Ok(Value::from(ctx.host().get_balance(&me)?))
            }
            "deposit" => Ok(Value::from(ctx.request().value)),
            "forward" => {
                let target = params
                    .first()
                    .ok_or_else(|| RuntimeError::failure(Status::InvalidParameter, "missing target"))?
                    .as_address()
                    .map_err(|e| RuntimeError::failure(Status::InvalidParameter, e.to_string()))?;
                let method = Self::str_param(params, 1)?.to_string();
                let remaining = ctx
                    .request()
                    .limit
                    .saturating_sub(U256::from(ctx.steps_used()));
                let result = ctx
                    .host()
                    .call(&target, U256::ZERO, remaining, &method, Vec::new())?;
                if let Some(used) = result.step_used.to_u64() {
                    ctx.charge(used)?;
                }
                if !result.status.is_success() {
                    return Err(ctx.revert(0, format!("forwarded call failed: {}", result.status)));
                }
                Ok(result.result)
            }
            "fail" => {
                let code = Self::int_param(params, 0, 0)?;
                let code = u32::try_from(code).map_err(|_| {
                    RuntimeError::failure(Status::InvalidParameter, "invalid reversion code")
                })?;
                Err(ctx.revert(code, "requested failure"))
            }
            other => Err(RuntimeError::failure(
                Status::MethodNotFound,
                format!("no method {other}"),
            )),
        }
    }
}
