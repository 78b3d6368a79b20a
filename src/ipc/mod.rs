//! The engine protocol: transports, the value codec, and the endpoints
//! built on them.

pub mod codec;
pub mod engine;
pub mod manager;
pub mod message;
pub mod proxy;
pub mod service;
pub mod transport;
pub mod value;

pub use codec::{FrameDecoder, FrameReader};
pub use engine::EngineProxy;
pub use manager::{send_end, ManagerCommand, ManagerProxy};
pub use message::{Message, MsgType};
pub use proxy::{MessageSender, Proxy, ProxyState};
pub use service::{
    CallAction, EngineManagerClient, GraphStats, ServiceManagerProxy, StateBackend,
    WorldStateBackend,
};
pub use transport::{Connector, Transport, UnixConnector};
pub use value::{BigInt, Value};
