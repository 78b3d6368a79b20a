//! A contract runtime backed by contracts compiled into the engine.

use super::{ContractRuntime, Host, ObjectGraphCache, RuntimeError};
use crate::ipc::value::{BigInt, Value};
use crate::types::{InvokeRequest, InvokeResult, Method, MethodType, ObjectGraph, Status};
use alloy_primitives::U256;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Flat cost of entering a method.
pub const STEP_INVOKE: u64 = 1_000;
/// Cost of one storage read.
pub const STEP_GET: u64 = 25;
/// Cost of one storage write, plus one step per value byte.
pub const STEP_SET: u64 = 50;
/// Cost of one event.
pub const STEP_EVENT: u64 = 100;

/// A contract implemented in Rust.
pub trait NativeContract: Send + Sync {
    fn api(&self) -> Vec<Method>;

    fn invoke(
        &self,
        ctx: &mut CallContext<'_>,
        method: &str,
        params: &[Value],
    ) -> Result<Value, RuntimeError>;
}

/// What a [`NativeContract`] sees of the invocation it is running.
///
/// Host access goes through here so every operation is charged against the
/// request's step limit.
pub struct CallContext<'a> {
    host: &'a mut dyn Host,
    request: &'a InvokeRequest,
    cache: &'a ObjectGraphCache,
    steps_used: u64,
}

impl<'a> CallContext<'a> {
    pub fn new(
        host: &'a mut dyn Host,
        request: &'a InvokeRequest,
        cache: &'a ObjectGraphCache,
    ) -> Self {
        Self {
            host,
            request,
            cache,
            steps_used: 0,
        }
    }

    pub fn request(&self) -> &InvokeRequest {
        self.request
    }

    pub fn host(&mut self) -> &mut dyn Host {
        &mut *self.host
    }

    pub fn steps_used(&self) -> u64 {
        self.steps_used
    }

    /// Charges `steps`, failing with `OutOfStep` once the limit is passed.
    pub fn charge(&mut self, steps: u64) -> Result<(), RuntimeError> {
        self.steps_used = self.steps_used.saturating_add(steps);
        if U256::from(self.steps_used) > self.request.limit {
            return Err(RuntimeError::failure(
                Status::OutOfStep,
                format!("step limit {} exceeded", self.request.limit),
            ));
        }
        Ok(())
    }

    pub fn get_value(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, RuntimeError> {
        self.charge(STEP_GET)?;
        self.host.get_value(key)
    }

    pub fn set_value(&mut self, key: &[u8], value: Option<&[u8]>) -> Result<(), RuntimeError> {
        self.check_writable()?;
        self.charge(STEP_SET + value.map_or(0, |v| v.len() as u64))?;
        self.host.set_value(key, value)
    }

    pub fn event(&mut self, indexed: Vec<Vec<u8>>, data: Vec<Vec<u8>>) -> Result<(), RuntimeError> {
        self.check_writable()?;
        self.charge(STEP_EVENT)?;
        self.host.event(indexed, data)
    }

    pub fn load_graph(&mut self) -> Result<ObjectGraph, RuntimeError> {
        self.cache.load(&mut *self.host)
    }

    pub fn store_graph(
        &mut self,
        loaded: &ObjectGraph,
        next_hash: u32,
        graph: Vec<u8>,
    ) -> Result<(), RuntimeError> {
        self.check_writable()?;
        self.charge(graph.len() as u64)?;
        self.cache.store(&mut *self.host, loaded, next_hash, graph)
    }

    /// Builds the error for a deliberate revert, carrying the steps used so far.
    pub fn revert(&self, code: u32, message: impl Into<String>) -> RuntimeError {
        RuntimeError::Revert {
            code,
            step_used: BigInt::from(self.steps_used),
            message: message.into(),
        }
    }

    fn check_writable(&self) -> Result<(), RuntimeError> {
        if self.request.is_read_only() {
            return Err(RuntimeError::failure(
                Status::AccessDenied,
                "write in read-only invocation",
            ));
        }
        Ok(())
    }
}

/// Registry of native contracts keyed by code path.
pub struct NativeRuntime {
    contracts: HashMap<String, Arc<dyn NativeContract>>,
    cache: Arc<ObjectGraphCache>,
}

impl NativeRuntime {
    pub fn new(cache: Arc<ObjectGraphCache>) -> Self {
        Self {
            contracts: HashMap::new(),
            cache,
        }
    }

    /// Runtime with the contracts shipped in this crate.
    pub fn with_builtins(cache: Arc<ObjectGraphCache>) -> Self {
        let mut runtime = Self::new(cache);
        runtime.register(super::CounterContract::PATH, super::CounterContract);
        runtime
    }

    pub fn register(&mut self, path: impl Into<String>, contract: impl NativeContract + 'static) {
        self.contracts.insert(path.into(), Arc::new(contract));
    }

    pub fn cache(&self) -> &Arc<ObjectGraphCache> {
        &self.cache
    }

    fn contract(&self, path: &str) -> Result<&Arc<dyn NativeContract>, RuntimeError> {
        self.contracts.get(path).ok_or_else(|| {
            RuntimeError::failure(Status::ContractNotFound, format!("no contract at {path}"))
        })
    }
}

impl ContractRuntime for NativeRuntime {
    fn get_api(&self, path: &str) -> Result<Vec<Method>, RuntimeError> {
        Ok(self.contract(path)?.api())
    }

    fn invoke(&self, host: &mut dyn Host, request: &InvokeRequest) -> Result<InvokeResult, RuntimeError> {
        let contract = self.contract(&request.code)?;
        let api = contract.api();
        let method = api
            .iter()
            .find(|m| m.method_type == MethodType::Function && m.name == request.method)
            .ok_or_else(|| {
                RuntimeError::failure(
                    Status::MethodNotFound,
                    format!("no method {} in {}", request.method, request.code),
                )
            })?;
        if !request.value.is_zero() && !method.is_payable() {
            return Err(RuntimeError::failure(
                Status::MethodNotPayable,
                format!("{} does not accept value", request.method),
            ));
        }
        let required = method.inputs.iter().filter(|p| !p.optional).count();
        if request.params.len() < required || request.params.len() > method.inputs.len() {
            return Err(RuntimeError::failure(
                Status::InvalidParameter,
                format!(
                    "{} takes {} parameters, got {}",
                    request.method,
                    method.inputs.len(),
                    request.params.len()
                ),
            ));
        }

        let mut ctx = CallContext::new(host, request, &self.cache);
        ctx.charge(STEP_INVOKE)?;
        let result = contract.invoke(&mut ctx, &request.method, &request.params)?;
        debug!(
            code = %request.code,
            method = %request.method,
            steps = ctx.steps_used(),
            "invocation finished"
        );
        Ok(InvokeResult::success(ctx.steps_used(), result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::CounterContract;
    use crate::types::{options, LogLevel};
    use address_monitor::Address;
    use alloy_primitives::keccak256;
    use std::collections::BTreeMap;

    #[derive(Default)]
    struct MemoryHost {
        storage: BTreeMap<Vec<u8>, Vec<u8>>,
        events: usize,
        next_hash: u32,
        graph: Vec<u8>,
    }

    impl Host for MemoryHost {
        fn get_info(&mut self) -> Result<BTreeMap<String, Value>, RuntimeError> {
            Ok(BTreeMap::new())
        }
        fn get_balance(&mut self, _: &Address) -> Result<U256, RuntimeError> {
            Ok(U256::from(500))
        }
        fn get_value(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, RuntimeError> {
            Ok(self.storage.get(key).cloned())
        }
        fn set_value(&mut self, key: &[u8], value: Option<&[u8]>) -> Result<(), RuntimeError> {
            match value {
                Some(v) => self.storage.insert(key.to_vec(), v.to_vec()),
                None => self.storage.remove(key),
            };
            Ok(())
        }
        fn set_value_returning_size(
            &mut self,
            key: &[u8],
            value: Option<&[u8]>,
        ) -> Result<Option<usize>, RuntimeError> {
            let old = self.storage.get(key).map(Vec::len);
            self.set_value(key, value)?;
            Ok(old)
        }
        fn call(
            &mut self,
            _: &Address,
            _: U256,
            _: U256,
            _: &str,
            _: Vec<Value>,
        ) -> Result<InvokeResult, RuntimeError> {
            Ok(InvokeResult::success(10i64, Value::from("pong")))
        }
        fn event(&mut self, _: Vec<Vec<u8>>, _: Vec<Vec<u8>>) -> Result<(), RuntimeError> {
            self.events += 1;
            Ok(())
        }
        fn log(&mut self, _: LogLevel, _: &str) -> Result<(), RuntimeError> {
            Ok(())
        }
        fn get_object_graph(&mut self, want_full: bool) -> Result<ObjectGraph, RuntimeError> {
            Ok(ObjectGraph {
                next_hash: self.next_hash,
                graph_hash: keccak256(&self.graph),
                graph_data: want_full.then(|| self.graph.clone()),
            })
        }
        fn set_object_graph(
            &mut self,
            include_graph: bool,
            next_hash: u32,
            graph: &[u8],
        ) -> Result<(), RuntimeError> {
            self.next_hash = next_hash;
            if include_graph {
                self.graph = graph.to_vec();
            }
            Ok(())
        }
        fn set_code(&mut self, _: &[u8]) -> Result<(), RuntimeError> {
            Ok(())
        }
        fn set_fee_proportion(&mut self, _: i64) -> Result<(), RuntimeError> {
            Ok(())
        }
        fn is_trace(&self) -> bool {
            false
        }
    }

    fn request(method: &str, params: Vec<Value>) -> InvokeRequest {
        InvokeRequest {
            code: CounterContract::PATH.to_string(),
            option: 0,
            from: Some(Address::external(1)),
            to: Some(Address::contract(1)),
            value: U256::ZERO,
            limit: U256::from(1_000_000),
            method: method.to_string(),
            params,
            info: BTreeMap::new(),
            contract_id: Vec::new(),
            eid: 0,
            graph: None,
        }
    }

    fn runtime() -> NativeRuntime {
        NativeRuntime::with_builtins(Arc::new(ObjectGraphCache::new(8)))
    }

    #[test]
    fn test_increment_charges_steps() {
        let runtime = runtime();
        let mut host = MemoryHost::default();

        let result = runtime
            .invoke(&mut host, &request("increment", vec![Value::from(5i64)]))
            .unwrap();
        assert_eq!(result.status, Status::Success);
        assert_eq!(result.result.as_u64().unwrap(), 5);
        assert_eq!(
            result.step_used.to_u64(),
            Some(STEP_INVOKE + STEP_GET + STEP_SET + 8 + STEP_EVENT)
        );
        assert_eq!(host.events, 1);

        let result = runtime.invoke(&mut host, &request("get", vec![])).unwrap();
        assert_eq!(result.result.as_u64().unwrap(), 5);
    }

    #[test]
    fn test_lookup_failures() {
        let runtime = runtime();
        let mut host = MemoryHost::default();

        let mut missing = request("get", vec![]);
        missing.code = "builtin/none".into();
        assert!(matches!(
            runtime.invoke(&mut host, &missing),
            Err(RuntimeError::Failure { status: Status::ContractNotFound, .. })
        ));
        assert!(matches!(
            runtime.invoke(&mut host, &request("nope", vec![])),
            Err(RuntimeError::Failure { status: Status::MethodNotFound, .. })
        ));

        let mut paid = request("increment", vec![]);
        paid.value = U256::from(1);
        assert!(matches!(
            runtime.invoke(&mut host, &paid),
            Err(RuntimeError::Failure { status: Status::MethodNotPayable, .. })
        ));

        let mut deposit = request("deposit", vec![]);
        deposit.value = U256::from(7);
        let result = runtime.invoke(&mut host, &deposit).unwrap();
        assert_eq!(result.result.as_u256().unwrap(), U256::from(7));
    }

    #[test]
    fn test_out_of_step() {
        let runtime = runtime();
        let mut host = MemoryHost::default();
        let mut req = request("increment", vec![]);
        req.limit = U256::from(STEP_INVOKE + 10);
        assert!(matches!(
            runtime.invoke(&mut host, &req),
            Err(RuntimeError::Failure { status: Status::OutOfStep, .. })
        ));
        assert!(host.storage.is_empty());
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let runtime = runtime();
        let mut host = MemoryHost::default();
        let mut req = request("increment", vec![]);
        req.option = options::READ_ONLY;
        assert!(matches!(
            runtime.invoke(&mut host, &req),
            Err(RuntimeError::Failure { status: Status::AccessDenied, .. })
        ));
    }

    #[test]
    fn test_revert_carries_code() {
        let runtime = runtime();
        let mut host = MemoryHost::default();
        match runtime.invoke(&mut host, &request("fail", vec![Value::from(3i64)])) {
            Err(RuntimeError::Revert { code, step_used, .. }) => {
                assert_eq!(code, 3);
                assert_eq!(step_used.to_u64(), Some(STEP_INVOKE));
            }
            other => panic!("expected revert, got {other:?}"),
        }
    }

    #[test]
    fn test_label_goes_through_graph() {
        let runtime = runtime();
        let mut host = MemoryHost::default();
        runtime
            .invoke(&mut host, &request("setLabel", vec![Value::from("hello")]))
            .unwrap();
        assert_eq!(host.graph, b"hello");
        assert_eq!(host.next_hash, 1);

        let result = runtime.invoke(&mut host, &request("label", vec![])).unwrap();
        assert_eq!(result.result.as_str().unwrap(), "hello");
        assert!(runtime.cache().hits() >= 1);
    }
}
