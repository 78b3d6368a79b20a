//! Executor manager: one executor thread per outstanding transaction id.

use crate::config::EngineConfig;
use crate::error::IpcResult;
use crate::executor::TransactionExecutor;
use crate::ipc::{send_end, Connector, ManagerCommand, ManagerProxy, MessageSender, Proxy};
use crate::runtime::ContractRuntime;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

type Sender<C> = Arc<MessageSender<<C as Connector>::Transport>>;

struct ExecutorRecord<C: Connector> {
    sender: Sender<C>,
    handle: Option<JoinHandle<()>>,
}

/// Spawns executors on RUN, tears them down on KILL, and reports natural
/// exits with END.
///
/// END is sent only when the executor's own exit path removes its record.
/// After a KILL the record is already gone, so no END follows.
pub struct ExecutorManager<C: Connector> {
    connector: Arc<C>,
    runtime: Arc<dyn ContractRuntime>,
    config: EngineConfig,
    executors: Arc<DashMap<String, ExecutorRecord<C>>>,
}

impl<C: Connector> ExecutorManager<C> {
    pub fn new(connector: C, runtime: Arc<dyn ContractRuntime>, config: EngineConfig) -> Self {
        Self {
            connector: Arc::new(connector),
            runtime,
            config,
            executors: Arc::new(DashMap::new()),
        }
    }

    /// Number of live executors.
    pub fn active(&self) -> usize {
        self.executors.len()
    }

    pub fn is_running(&self, uuid: &str) -> bool {
        self.executors.contains_key(uuid)
    }

    /// Connects to the service manager and serves RUN/KILL until it closes
    /// the control connection. Live executors are shut down on return.
    pub fn run(&self) -> IpcResult<()> {
        let transport = self.connector.connect()?;
        let mut proxy = ManagerProxy::new(Proxy::new(transport, self.config.max_frame_size)?);
        proxy.connect(&self.config.uuid, &self.config)?;
        info!(uuid = %self.config.uuid, "executor manager connected");

        let end_sender = proxy.sender();
        let result = loop {
            match proxy.next_command() {
                Ok(Some(ManagerCommand::Run(uuid))) => self.on_run(uuid, &end_sender),
                Ok(Some(ManagerCommand::Kill(uuid))) => self.on_kill(&uuid),
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            }
        };

        self.shutdown();
        proxy.close();
        info!("executor manager stopped");
        result
    }

    /// Starts an executor for `uuid` unless one is already live.
    ///
    /// The connection is opened before the executor table is touched, so a
    /// slow connect never holds a table shard that an exiting executor needs.
    pub fn on_run(&self, uuid: String, end_sender: &Sender<C>) {
        if self.executors.contains_key(&uuid) {
            debug!(uuid = %uuid, "executor already running");
            return;
        }

        let transport = match self.connector.connect() {
            Ok(transport) => transport,
            Err(e) => {
                error!(uuid = %uuid, error = %e, "executor connect failed");
                Self::report_end(end_sender, &uuid);
                return;
            }
        };
        let executor = match TransactionExecutor::new(
            uuid.clone(),
            transport,
            self.runtime.clone(),
            self.config.clone(),
        ) {
            Ok(executor) => executor,
            Err(e) => {
                error!(uuid = %uuid, error = %e, "executor setup failed");
                Self::report_end(end_sender, &uuid);
                return;
            }
        };
        let sender = executor.sender();

        // The record exists before the thread starts, so the thread's exit
        // path always finds it unless a KILL got there first.
        match self.executors.entry(uuid.clone()) {
            Entry::Occupied(_) => {
                debug!(uuid = %uuid, "executor already running");
                sender.close();
                return;
            }
            Entry::Vacant(entry) => {
                entry.insert(ExecutorRecord {
                    sender: sender.clone(),
                    handle: None,
                });
            }
        }

        let executors = self.executors.clone();
        let end = end_sender.clone();
        let thread_uuid = uuid.clone();
        let spawned = thread::Builder::new()
            .name(format!("executor-{uuid}"))
            .spawn(move || {
                let _ = executor.run();
                if executors.remove(&thread_uuid).is_some() {
                    Self::report_end(&end, &thread_uuid);
                } else {
                    debug!(uuid = %thread_uuid, "executor was killed, no END");
                }
            });

        match spawned {
            Ok(handle) => {
                // Already gone if the executor finished first; the handle is
                // then dropped and the thread detaches.
                if let Some(mut record) = self.executors.get_mut(&uuid) {
                    record.handle = Some(handle);
                }
                debug!(uuid = %uuid, "executor started");
            }
            Err(e) => {
                error!(uuid = %uuid, error = %e, "executor spawn failed");
                sender.close();
                if self.executors.remove(&uuid).is_some() {
                    Self::report_end(end_sender, &uuid);
                }
            }
        }
    }

    /// Tears down the executor for `uuid`. Unknown ids are ignored.
    pub fn on_kill(&self, uuid: &str) {
        match self.executors.remove(uuid) {
            Some((_, record)) => {
                record.sender.close();
                debug!(uuid, "executor killed");
            }
            None => debug!(uuid, "KILL for unknown executor"),
        }
    }

    /// Closes every live executor and waits for its thread.
    pub fn shutdown(&self) {
        let uuids: Vec<String> = self.executors.iter().map(|e| e.key().clone()).collect();
        for uuid in uuids {
            if let Some((_, mut record)) = self.executors.remove(&uuid) {
                record.sender.close();
                if let Some(handle) = record.handle.take() {
                    if handle.join().is_err() {
                        warn!(uuid = %uuid, "executor thread panicked");
                    }
                }
            }
        }
    }

    fn report_end(sender: &Sender<C>, uuid: &str) {
        if let Err(e) = send_end(sender, uuid) {
            warn!(uuid, error = %e, "failed to send END");
        }
    }
}
