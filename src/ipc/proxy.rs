//! Protocol endpoint shared by every role.
//!
//! A [`Proxy`] owns the read half of a transport and an [`Arc`] to the
//! [`MessageSender`] owning the write half. Reads happen on the thread running
//! the endpoint's dispatch loop; the sender may be shared with other threads
//! (the executor manager sends END from executor threads, and KILL tears a
//! connection down from the manager thread).

use crate::error::{IpcError, IpcResult, ProtocolError};
use crate::ipc::codec::FrameReader;
use crate::ipc::message::{Message, MsgType};
use crate::ipc::transport::Transport;
use crate::ipc::value::Value;
use crate::types::{CLIENT_KIND, PROTOCOL_VERSION};
use parking_lot::Mutex;
use std::io::{self, ErrorKind, Write};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Lifecycle of an endpoint: `Init -> Connected -> Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    Init,
    Connected,
    Closed,
}

impl ProxyState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ProxyState::Init,
            1 => ProxyState::Connected,
            _ => ProxyState::Closed,
        }
    }
}

/// Write half of an endpoint.
///
/// Each message is encoded up front and written under one lock, so frames
/// from different threads never interleave.
pub struct MessageSender<T: Transport> {
    writer: Mutex<T>,
    closer: T,
    state: AtomicU8,
}

impl<T: Transport> MessageSender<T> {
    fn new(writer: T, closer: T) -> Self {
        Self {
            writer: Mutex::new(writer),
            closer,
            state: AtomicU8::new(ProxyState::Init as u8),
        }
    }

    pub fn state(&self) -> ProxyState {
        ProxyState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ProxyState::Closed
    }

    fn mark_connected(&self) {
        let _ = self.state.compare_exchange(
            ProxyState::Init as u8,
            ProxyState::Connected as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    pub fn send(&self, msg: &Message) -> IpcResult<()> {
        if self.is_closed() {
            return Err(IpcError::Closed);
        }
        let frame = msg.encode();
        let mut writer = self.writer.lock();
        write_frame(&mut *writer, &frame)?;
        trace!(msg = %msg, "send");
        Ok(())
    }

    pub fn send_message(&self, msg_type: MsgType, payload: impl Into<Value>) -> IpcResult<()> {
        self.send(&Message::new(msg_type, payload))
    }

    /// Closes the connection. Idempotent. A reader blocked on the other half
    /// sees end of stream.
    pub fn close(&self) {
        let prev = self.state.swap(ProxyState::Closed as u8, Ordering::AcqRel);
        if prev != ProxyState::Closed as u8 {
            if let Err(e) = self.closer.shutdown() {
                if e.kind() != ErrorKind::NotConnected {
                    debug!(error = %e, "shutdown failed");
                }
            }
        }
    }
}

fn write_frame<W: Write>(writer: &mut W, frame: &[u8]) -> IpcResult<()> {
    let result = writer.write_all(frame).and_then(|_| writer.flush());
    result.map_err(|e| match e.kind() {
        ErrorKind::BrokenPipe | ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted => {
            IpcError::Disconnected
        }
        _ => IpcError::Io(e),
    })
}

/// Returns the identity carried by a VERSION payload.
fn parse_version(payload: &Value) -> Result<String, ProtocolError> {
    let items = payload.as_tuple(3)?;
    let version = items[0].as_i64()?;
    if version != PROTOCOL_VERSION {
        return Err(ProtocolError::Version(version));
    }
    Ok(items[1].as_str()?.to_string())
}

/// A protocol endpoint over one transport.
pub struct Proxy<T: Transport> {
    reader: FrameReader<T>,
    sender: Arc<MessageSender<T>>,
}

impl<T: Transport> Proxy<T> {
    pub fn new(transport: T, max_frame_size: usize) -> io::Result<Self> {
        let writer = transport.try_clone()?;
        let closer = transport.try_clone()?;
        Ok(Self {
            reader: FrameReader::new(transport, max_frame_size),
            sender: Arc::new(MessageSender::new(writer, closer)),
        })
    }

    pub fn sender(&self) -> Arc<MessageSender<T>> {
        self.sender.clone()
    }

    pub fn state(&self) -> ProxyState {
        self.sender.state()
    }

    /// Announces this endpoint with VERSION. No reply is expected.
    pub fn connect(&mut self, identity: &str) -> IpcResult<()> {
        self.connect_as(identity, PROTOCOL_VERSION, CLIENT_KIND)
    }

    /// Like [`connect`](Self::connect) with an explicit version and client kind.
    pub fn connect_as(&mut self, identity: &str, version: i64, kind: &str) -> IpcResult<()> {
        self.sender.send_message(
            MsgType::Version,
            vec![Value::from(version), Value::from(identity), Value::from(kind)],
        )?;
        self.sender.mark_connected();
        debug!(identity, "connected");
        Ok(())
    }

    /// Waits for the peer's VERSION and returns its identity.
    pub fn accept(&mut self) -> IpcResult<String> {
        let msg = self.recv()?;
        if msg.msg_type != MsgType::Version {
            return Err(self.violation(ProtocolError::UnexpectedMessage(format!(
                "{} before VERSION",
                msg.msg_type
            ))));
        }
        let identity = parse_version(&msg.payload).map_err(|e| self.violation(e))?;
        self.sender.mark_connected();
        debug!(identity = %identity, "peer connected");
        Ok(identity)
    }

    pub fn send(&self, msg_type: MsgType, payload: impl Into<Value>) -> IpcResult<()> {
        self.sender.send_message(msg_type, payload)
    }

    /// Reads the next message. A malformed frame closes the endpoint.
    pub fn recv(&mut self) -> IpcResult<Message> {
        if self.sender.is_closed() {
            return Err(IpcError::Closed);
        }
        match self.reader.read_message() {
            Ok(msg) => Ok(msg),
            Err(IpcError::Protocol(e)) => Err(self.violation(e)),
            Err(IpcError::Disconnected) if self.sender.is_closed() => Err(IpcError::Closed),
            Err(e) => Err(e),
        }
    }

    /// Sends a request and waits for the reply of the same type.
    ///
    /// Only one request may be outstanding; `&mut self` enforces it.
    pub fn send_request(&mut self, msg_type: MsgType, payload: impl Into<Value>) -> IpcResult<Message> {
        self.send(msg_type, payload)?;
        let reply = self.recv()?;
        if reply.msg_type != msg_type {
            return Err(self.violation(ProtocolError::UnexpectedMessage(format!(
                "{} while waiting for {}",
                reply.msg_type, msg_type
            ))));
        }
        Ok(reply)
    }

    /// Closes the endpoint after a protocol violation and returns the error.
    pub fn violation(&self, err: ProtocolError) -> IpcError {
        warn!(error = %err, "protocol violation, closing connection");
        self.sender.close();
        IpcError::Protocol(err)
    }

    pub fn close(&self) {
        self.sender.close();
    }
}
