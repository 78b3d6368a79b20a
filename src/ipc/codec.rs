//! Streaming frame decoding.
//!
//! Frames are self-delimiting RLP lists. Bytes arrive in arbitrary chunks;
//! [`FrameDecoder`] buffers them until a whole frame is present and never
//! consumes part of one.

use crate::error::{IpcError, IpcResult, ProtocolError};
use crate::ipc::message::Message;
use std::io::{ErrorKind, Read};
use tracing::trace;

const READ_CHUNK: usize = 16 * 1024;

/// Total length of the frame at the start of `buf`, or `None` if the header
/// itself is still incomplete.
fn frame_length(buf: &[u8], max_frame_size: usize) -> Result<Option<usize>, ProtocolError> {
    let Some(&first) = buf.first() else {
        return Ok(None);
    };
    let (header_len, payload_len) = match first {
        0xc0..=0xf7 => (1, usize::from(first - 0xc0)),
        0xf8..=0xff => {
            let len_of_len = usize::from(first - 0xf7);
            if buf.len() < 1 + len_of_len {
                return Ok(None);
            }
            let len_bytes = &buf[1..1 + len_of_len];
            if len_bytes[0] == 0 {
                return Err(ProtocolError::Malformed("length with leading zero".into()));
            }
            let mut len: u64 = 0;
            for b in len_bytes {
                len = (len << 8) | u64::from(*b);
            }
            let len = usize::try_from(len).map_err(|_| ProtocolError::FrameTooLarge {
                size: usize::MAX,
                limit: max_frame_size,
            })?;
            (1 + len_of_len, len)
        }
        _ => return Err(ProtocolError::Malformed("frame must be a list".into())),
    };
    let total = header_len.saturating_add(payload_len);
    if total > max_frame_size {
        return Err(ProtocolError::FrameTooLarge {
            size: total,
            limit: max_frame_size,
        });
    }
    Ok(Some(total))
}

/// Accumulates bytes and yields complete messages.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    max_frame_size: usize,
}

impl FrameDecoder {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_frame_size,
        }
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes held that do not yet form a message.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Takes the next complete message off the buffer.
    pub fn decode(&mut self) -> Result<Option<Message>, ProtocolError> {
        let Some(len) = frame_length(&self.buf, self.max_frame_size)? else {
            return Ok(None);
        };
        if self.buf.len() < len {
            return Ok(None);
        }
        let frame: Vec<u8> = self.buf.drain(..len).collect();
        Message::decode(&frame).map(Some)
    }
}

/// Reads messages off a byte stream.
pub struct FrameReader<R> {
    inner: R,
    decoder: FrameDecoder,
    chunk: Box<[u8]>,
}

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R, max_frame_size: usize) -> Self {
        Self {
            inner,
            decoder: FrameDecoder::new(max_frame_size),
            chunk: vec![0u8; READ_CHUNK].into_boxed_slice(),
        }
    }

    /// Blocks until one whole message is available.
    ///
    /// End of stream between messages is [`IpcError::Disconnected`]; in the
    /// middle of a frame it is a protocol error.
    pub fn read_message(&mut self) -> IpcResult<Message> {
        loop {
            if let Some(msg) = self.decoder.decode()? {
                trace!(msg = %msg, "recv");
                return Ok(msg);
            }
            let n = match self.inner.read(&mut self.chunk) {
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe
                    ) =>
                {
                    return Err(IpcError::Disconnected)
                }
                Err(e) => return Err(e.into()),
            };
            if n == 0 {
                return Err(if self.decoder.buffered() == 0 {
                    IpcError::Disconnected
                } else {
                    ProtocolError::Malformed("stream ended inside a frame".into()).into()
                });
            }
            self.decoder.extend(&self.chunk[..n]);
        }
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }
}
