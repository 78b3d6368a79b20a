//! Per-transaction executor.

use crate::config::EngineConfig;
use crate::error::IpcResult;
use crate::ipc::{EngineProxy, MessageSender, Proxy, Transport};
use crate::runtime::ContractRuntime;
use std::io;
use std::sync::Arc;
use tracing::{debug, warn};

/// Serves one transaction id over its own connection.
///
/// Runs `connect -> handle_messages -> close`. Runtime failures are answered
/// with RESULT and never end the loop; only the connection ending does.
pub struct TransactionExecutor<T: Transport> {
    uuid: String,
    proxy: EngineProxy<T>,
    config: EngineConfig,
}

impl<T: Transport> TransactionExecutor<T> {
    pub fn new(
        uuid: String,
        transport: T,
        runtime: Arc<dyn ContractRuntime>,
        config: EngineConfig,
    ) -> io::Result<Self> {
        let proxy = Proxy::new(transport, config.max_frame_size)?;
        Ok(Self {
            uuid,
            proxy: EngineProxy::new(proxy, runtime),
            config,
        })
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// Write half, used by the manager to tear the connection down.
    pub fn sender(&self) -> Arc<MessageSender<T>> {
        self.proxy.sender()
    }

    pub fn run(mut self) -> IpcResult<()> {
        let result = self
            .proxy
            .connect(&self.uuid, &self.config)
            .and_then(|_| self.proxy.handle_messages());
        self.proxy.close();
        match &result {
            Ok(()) => debug!(uuid = %self.uuid, "executor finished"),
            Err(e) => warn!(uuid = %self.uuid, error = %e, "executor failed"),
        }
        result
    }
}
