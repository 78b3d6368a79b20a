//! Engine configuration.

use crate::types::{CLIENT_KIND, PROTOCOL_VERSION};
use std::path::PathBuf;

/// Settings of an engine process.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Socket of the service manager. Executors connect to the same path.
    pub socket_path: PathBuf,
    /// Identity the executor manager announces in VERSION.
    pub uuid: String,
    pub client_kind: String,
    pub protocol_version: i64,
    /// Largest frame accepted from the peer, in bytes.
    pub max_frame_size: usize,
    /// Object graphs kept by the engine-wide cache.
    pub graph_cache_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/tmp/contract-engine.sock"),
            uuid: "engine".to_string(),
            client_kind: CLIENT_KIND.to_string(),
            protocol_version: PROTOCOL_VERSION,
            max_frame_size: 64 * 1024 * 1024,
            graph_cache_capacity: 64,
        }
    }
}
