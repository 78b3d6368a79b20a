//! Control connection between the executor manager and the service manager.

use crate::config::EngineConfig;
use crate::error::{IpcError, IpcResult, ProtocolError};
use crate::ipc::message::MsgType;
use crate::ipc::proxy::{MessageSender, Proxy};
use crate::ipc::transport::Transport;
use std::sync::Arc;
use tracing::debug;

/// A lifecycle command from the service manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagerCommand {
    /// Start an executor for the transaction id.
    Run(String),
    /// Tear down the executor for the transaction id.
    Kill(String),
}

pub struct ManagerProxy<T: Transport> {
    proxy: Proxy<T>,
}

impl<T: Transport> ManagerProxy<T> {
    pub fn new(proxy: Proxy<T>) -> Self {
        Self { proxy }
    }

    /// Sends VERSION with the version and client kind from `config`.
    pub fn connect(&mut self, identity: &str, config: &EngineConfig) -> IpcResult<()> {
        self.proxy
            .connect_as(identity, config.protocol_version, &config.client_kind)
    }

    pub fn sender(&self) -> Arc<MessageSender<T>> {
        self.proxy.sender()
    }

    /// Waits for the next RUN or KILL. `None` once the service manager sent
    /// CLOSE or went away.
    pub fn next_command(&mut self) -> IpcResult<Option<ManagerCommand>> {
        let msg = match self.proxy.recv() {
            Ok(msg) => msg,
            Err(e) if e.is_disconnect() => return Ok(None),
            Err(e) => return Err(e),
        };
        let command = match msg.msg_type {
            MsgType::Run => ManagerCommand::Run(self.uuid(&msg.payload)?),
            MsgType::Kill => ManagerCommand::Kill(self.uuid(&msg.payload)?),
            MsgType::Close => {
                debug!("service manager closed the control connection");
                return Ok(None);
            }
            other => {
                return Err(self.proxy.violation(ProtocolError::UnexpectedMessage(format!(
                    "{other} on control connection"
                ))))
            }
        };
        Ok(Some(command))
    }

    fn uuid(&self, payload: &crate::ipc::value::Value) -> IpcResult<String> {
        payload
            .as_str()
            .map(str::to_string)
            .map_err(|e| self.proxy.violation(e))
    }

    pub fn close(&self) {
        self.proxy.close();
    }
}

/// Tells the service manager the executor for `uuid` is gone.
pub fn send_end<T: Transport>(sender: &MessageSender<T>, uuid: &str) -> IpcResult<()> {
    match sender.send_message(MsgType::End, uuid) {
        Ok(()) => {
            debug!(uuid, "END sent");
            Ok(())
        }
        Err(IpcError::Closed) => {
            debug!(uuid, "control connection closed, END dropped");
            Ok(())
        }
        Err(e) => Err(e),
    }
}
