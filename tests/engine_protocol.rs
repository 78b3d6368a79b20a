//! Transaction connections end to end: a real executor on one side of a
//! socket pair, the service-manager endpoint on the other.

mod common;

use alloy_primitives::U256;
use common::*;
use contract_engine::address_monitor::Address;
use contract_engine::ipc::{MsgType, Proxy, Value, WorldStateBackend};
use contract_engine::runtime::{
    CallContext, CounterContract, NativeContract, STEP_EVENT, STEP_GET, STEP_INVOKE, STEP_SET,
};
use contract_engine::types::{data_type, method_flags, LogLevel, Method, Parameter};
use contract_engine::{
    EngineConfig, IpcError, NativeRuntime, ObjectGraphCache, RuntimeError, Status,
    TransactionExecutor,
};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::thread;

fn count_of(backend: &WorldStateBackend, id: u64) -> u64 {
    let account = backend.world().account(&Address::contract(id)).unwrap();
    let raw = account.storage.get(b"count".as_slice()).unwrap();
    u64::from_be_bytes(raw.as_slice().try_into().unwrap())
}

#[test]
fn test_invoke_round_trip() {
    let (mut service, handle) = spawn_executor("tx-1", runtime());
    let mut backend = backend();
    let alice = Address::external(ALICE);
    let counter = Address::contract(COUNTER_A);

    let req = backend.request(alice, counter, "increment", vec![Value::from(3i64)]);
    let result = service.invoke(&mut backend, &req).unwrap();
    assert_eq!(result.status, Status::Success);
    assert_eq!(result.result.as_u64().unwrap(), 3);
    assert_eq!(
        result.step_used.to_u64(),
        Some(STEP_INVOKE + STEP_GET + STEP_SET + 8 + STEP_EVENT)
    );

    let req = backend.request(alice, counter, "increment", vec![]);
    let result = service.invoke(&mut backend, &req).unwrap();
    assert_eq!(result.result.as_u64().unwrap(), 4);
    assert_eq!(count_of(&backend, COUNTER_A), 4);
    assert_eq!(backend.events().len(), 2);
    assert_eq!(backend.events()[1].address, counter);

    backend
        .world()
        .update(counter, |account| account.balance = U256::from(77));
    let req = backend.request(alice, counter, "balance", vec![]);
    let result = service.invoke(&mut backend, &req).unwrap();
    assert_eq!(result.result.as_u256().unwrap(), U256::from(77));

    service.close().unwrap();
    assert!(handle.join().unwrap().is_ok());
}

#[test]
fn test_get_api() {
    let (mut service, handle) = spawn_executor("tx-api", runtime());

    let methods = service.get_api(CounterContract::PATH).unwrap().unwrap();
    assert!(methods.iter().any(|m| m.name == "deposit" && m.is_payable()));
    assert!(methods.iter().any(|m| m.name == "get" && m.is_readonly()));
    assert!(methods.iter().all(|m| m.name != "crash"));

    assert_eq!(
        service.get_api("nowhere").unwrap(),
        Err(Status::ContractNotFound)
    );

    service.close().unwrap();
    assert!(handle.join().unwrap().is_ok());
}

#[test]
fn test_runtime_panic_becomes_failure() {
    let (mut service, handle) = spawn_executor("tx-crash", runtime());
    let mut backend = backend();
    let alice = Address::external(ALICE);
    let counter = Address::contract(COUNTER_A);

    let req = backend.request(alice, Address::contract(CRASHER), "crash", vec![]);
    let result = service.invoke(&mut backend, &req).unwrap();
    assert_eq!(result.status, Status::UnknownFailure);
    assert!(result.step_used.is_zero());
    assert_eq!(result.result.as_str().unwrap(), "contract crashed");

    // The executor keeps serving after the panic.
    let req = backend.request(alice, counter, "increment", vec![]);
    let result = service.invoke(&mut backend, &req).unwrap();
    assert_eq!(result.status, Status::Success);

    service.close().unwrap();
    assert!(handle.join().unwrap().is_ok());
}

#[test]
fn test_failures_and_reverts() {
    let (mut service, handle) = spawn_executor("tx-fail", runtime());
    let mut backend = backend();
    let alice = Address::external(ALICE);
    let counter = Address::contract(COUNTER_A);

    let req = backend.request(alice, counter, "fail", vec![Value::from(2i64)]);
    let result = service.invoke(&mut backend, &req).unwrap();
    assert_eq!(result.status, Status::UserReversion(2));
    assert_eq!(result.step_used.to_u64(), Some(STEP_INVOKE));

    let req = backend.request(alice, counter, "missing", vec![]);
    let result = service.invoke(&mut backend, &req).unwrap();
    assert_eq!(result.status, Status::MethodNotFound);
    assert!(result.step_used.is_zero());

    let mut req = backend.request(alice, counter, "increment", vec![]);
    req.value = U256::from(5);
    let result = service.invoke(&mut backend, &req).unwrap();
    assert_eq!(result.status, Status::MethodNotPayable);

    let mut req = backend.request(alice, counter, "increment", vec![]);
    req.limit = U256::from(STEP_INVOKE + 10);
    let result = service.invoke(&mut backend, &req).unwrap();
    assert_eq!(result.status, Status::OutOfStep);

    service.close().unwrap();
    assert!(handle.join().unwrap().is_ok());
}

#[test]
fn test_nested_call_reenters_engine() {
    let (mut service, handle) = spawn_executor("tx-nested", runtime());
    let mut backend = backend();
    let alice = Address::external(ALICE);
    let a = Address::contract(COUNTER_A);
    let b = Address::contract(COUNTER_B);

    let req = backend.request(
        alice,
        a,
        "forward",
        vec![Value::from(b), Value::from("increment")],
    );
    let result = service.invoke(&mut backend, &req).unwrap();
    assert_eq!(result.status, Status::Success);
    assert_eq!(result.result.as_u64().unwrap(), 1);

    // The nested invocation wrote to B, not to A.
    assert_eq!(count_of(&backend, COUNTER_B), 1);
    assert!(backend.world().account(&a).unwrap().storage.is_empty());
    assert_eq!(backend.events()[0].address, b);

    // Nothing deployed at the target: the callee fails and the caller reverts.
    let req = backend.request(
        alice,
        a,
        "forward",
        vec![Value::from(Address::contract(99)), Value::from("get")],
    );
    let result = service.invoke(&mut backend, &req).unwrap();
    assert_eq!(result.status, Status::UserReversion(0));

    service.close().unwrap();
    assert!(handle.join().unwrap().is_ok());
}

#[test]
fn test_object_graph_cache_skips_full_transfer() {
    let cache = Arc::new(ObjectGraphCache::new(16));
    let warm_runtime = Arc::new(NativeRuntime::with_builtins(cache.clone()));
    let (mut service, handle) = spawn_executor("tx-graph", warm_runtime);
    let mut backend = backend();
    let alice = Address::external(ALICE);
    let counter = Address::contract(COUNTER_A);

    let req = backend.request(alice, counter, "setLabel", vec![Value::from("hello")]);
    let result = service.invoke(&mut backend, &req).unwrap();
    assert_eq!(result.status, Status::Success);
    assert_eq!(service.stats().full_transfers, 1);
    assert_eq!(service.stats().uploads, 1);

    let stored = backend.world().account(&counter).unwrap();
    assert_eq!(stored.object_graph, b"hello");
    assert_eq!(stored.next_hash, 1);

    // The engine still holds the graph it just stored.
    let req = backend.request(alice, counter, "label", vec![]);
    let cached = service.invoke(&mut backend, &req).unwrap();
    assert_eq!(cached.result.as_str().unwrap(), "hello");
    assert_eq!(service.stats().requests, 2);
    assert_eq!(service.stats().full_transfers, 1);

    // Storing an identical graph only moves the hash counter.
    let req = backend.request(alice, counter, "setLabel", vec![Value::from("hello")]);
    service.invoke(&mut backend, &req).unwrap();
    assert_eq!(service.stats().uploads, 1);
    let stored = backend.world().account(&counter).unwrap();
    assert_eq!(stored.next_hash, 2);
    assert_eq!(stored.object_graph, b"hello");

    service.close().unwrap();
    assert!(handle.join().unwrap().is_ok());
    assert!(cache.hits() >= 2);

    // A cold engine fetches the graph in full and decodes the same value.
    let (mut cold, handle) = spawn_executor("tx-cold", runtime());
    let req = backend.request(alice, counter, "label", vec![]);
    let fetched = cold.invoke(&mut backend, &req).unwrap();
    assert_eq!(cold.stats().full_transfers, 1);
    assert_eq!(fetched.result, cached.result);

    cold.close().unwrap();
    assert!(handle.join().unwrap().is_ok());
}

/// Uses the host calls the counter leaves alone.
struct Registry;

impl NativeContract for Registry {
    fn api(&self) -> Vec<Method> {
        vec![
            Method::function(
                "put",
                method_flags::EXTERNAL,
                vec![
                    Parameter::new("key", "str", data_type::STRING),
                    Parameter::new("value", "str", data_type::STRING),
                ],
                data_type::INTEGER,
            ),
            Method::function("height", method_flags::EXTERNAL, vec![], data_type::INTEGER),
        ]
    }

    fn invoke(
        &self,
        ctx: &mut CallContext<'_>,
        method: &str,
        params: &[Value],
    ) -> Result<Value, RuntimeError> {
        let host = ctx.host();
        match method {
            "put" => {
                let key = params[0].as_str().unwrap_or_default().as_bytes().to_vec();
                let value = params[1].as_str().unwrap_or_default().as_bytes().to_vec();
                let prev = host.set_value_returning_size(&key, Some(value.as_slice()))?;
                host.set_fee_proportion(50)?;
                host.log(LogLevel::Info, "stored")?;
                Ok(Value::from(prev.map_or(-1, |n| n as i64)))
            }
            "height" => {
                let info = host.get_info()?;
                host.set_code(b"new code")?;
                Ok(info.get("B.height").cloned().unwrap_or(Value::Nil))
            }
            other => Err(RuntimeError::failure(Status::MethodNotFound, other)),
        }
    }
}

#[test]
fn test_remaining_host_calls() {
    let mut registry_runtime = NativeRuntime::new(Arc::new(ObjectGraphCache::new(4)));
    registry_runtime.register("test/registry", Registry);
    let (mut service, handle) = spawn_executor("tx-registry", Arc::new(registry_runtime));

    let mut backend = backend();
    let registry = Address::contract(7);
    backend.deploy(registry, "test/registry");
    backend.set_info("B.height", Value::from(12i64));
    let alice = Address::external(ALICE);

    let req = backend.request(alice, registry, "put", vec![Value::from("k"), Value::from("abc")]);
    let first = service.invoke(&mut backend, &req).unwrap();
    assert_eq!(first.result.as_i64().unwrap(), -1);

    let req = backend.request(alice, registry, "put", vec![Value::from("k"), Value::from("z")]);
    let second = service.invoke(&mut backend, &req).unwrap();
    assert_eq!(second.result.as_i64().unwrap(), 3);
    assert_eq!(backend.logs().len(), 2);
    assert_eq!(backend.logs()[0], (LogLevel::Info, "stored".to_string()));

    let req = backend.request(alice, registry, "height", vec![]);
    let height = service.invoke(&mut backend, &req).unwrap();
    assert_eq!(height.result.as_i64().unwrap(), 12);
    assert_eq!(
        backend.world().account(&registry).unwrap().code.as_deref(),
        Some(b"new code".as_slice())
    );

    service.close().unwrap();
    assert!(handle.join().unwrap().is_ok());
}

#[test]
fn test_malformed_invoke_closes_connection() {
    let (engine_side, service_side) = UnixStream::pair().unwrap();
    let executor = TransactionExecutor::new(
        "tx-bad".to_string(),
        engine_side,
        runtime(),
        EngineConfig {
            max_frame_size: MAX_FRAME,
            ..Default::default()
        },
    )
    .unwrap();
    let handle = thread::spawn(move || executor.run());

    let mut raw = Proxy::new(service_side, MAX_FRAME).unwrap();
    assert_eq!(raw.accept().unwrap(), "tx-bad");
    raw.send(MsgType::Invoke, "not a request").unwrap();

    assert!(matches!(handle.join().unwrap(), Err(IpcError::Protocol(_))));
    assert!(matches!(raw.recv(), Err(IpcError::Disconnected)));
}
