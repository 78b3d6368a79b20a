#![allow(dead_code)]

use contract_engine::address_monitor::{Account, Address, WorldState};
use contract_engine::ipc::{Proxy, ServiceManagerProxy, WorldStateBackend};
use contract_engine::ipc::Value;
use contract_engine::runtime::{CallContext, CounterContract, NativeContract};
use contract_engine::types::{data_type, method_flags, Method};
use contract_engine::{
    ContractRuntime, EngineConfig, IpcResult, NativeRuntime, ObjectGraphCache, RuntimeError,
    TransactionExecutor,
};
use alloy_primitives::U256;
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

pub const MAX_FRAME: usize = 1 << 20;

pub const ALICE: u64 = 1;
pub const COUNTER_A: u64 = 1;
pub const COUNTER_B: u64 = 2;
pub const CRASHER: u64 = 3;

pub const CRASHER_PATH: &str = "test/crasher";

/// Contract whose only method panics.
pub struct Crasher;

impl NativeContract for Crasher {
    fn api(&self) -> Vec<Method> {
        vec![Method::function("crash", method_flags::EXTERNAL, vec![], data_type::NONE)]
    }

    fn invoke(
        &self,
        _ctx: &mut CallContext<'_>,
        _method: &str,
        _params: &[Value],
    ) -> Result<Value, RuntimeError> {
        panic!("contract crashed")
    }
}

/// Builtins plus [`Crasher`].
pub fn runtime() -> Arc<NativeRuntime> {
    let mut runtime = NativeRuntime::with_builtins(Arc::new(ObjectGraphCache::new(16)));
    runtime.register(CRASHER_PATH, Crasher);
    Arc::new(runtime)
}

/// Executor for `uuid` on one end of a socket pair, service manager on the
/// other, VERSION already exchanged.
pub fn spawn_executor(
    uuid: &str,
    runtime: Arc<dyn ContractRuntime>,
) -> (ServiceManagerProxy<UnixStream>, JoinHandle<IpcResult<()>>) {
    let (engine_side, service_side) = UnixStream::pair().unwrap();
    let executor = TransactionExecutor::new(
        uuid.to_string(),
        engine_side,
        runtime,
        EngineConfig {
            max_frame_size: MAX_FRAME,
            ..Default::default()
        },
    )
    .unwrap();
    let handle = thread::spawn(move || executor.run());

    let mut service = ServiceManagerProxy::new(Proxy::new(service_side, MAX_FRAME).unwrap());
    assert_eq!(service.accept().unwrap(), uuid);
    (service, handle)
}

/// World with Alice funded, two counters and the crasher deployed.
pub fn backend() -> WorldStateBackend {
    let world = Arc::new(WorldState::new());
    world.insert(Address::external(ALICE), Account::with_balance(U256::from(1_000)));
    let mut backend = WorldStateBackend::new(world);
    backend.deploy(Address::contract(COUNTER_A), CounterContract::PATH);
    backend.deploy(Address::contract(COUNTER_B), CounterContract::PATH);
    backend.deploy(Address::contract(CRASHER), CRASHER_PATH);
    backend
}

/// Accepts one executor connection and returns it with the uuid it announced.
pub fn accept_executor(listener: &UnixListener) -> (String, ServiceManagerProxy<UnixStream>) {
    let (stream, _) = listener.accept().unwrap();
    let mut service = ServiceManagerProxy::new(Proxy::new(stream, MAX_FRAME).unwrap());
    let uuid = service.accept().unwrap();
    (uuid, service)
}
