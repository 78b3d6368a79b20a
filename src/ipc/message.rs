//! Message types of the engine protocol.

use crate::error::ProtocolError;
use crate::ipc::value::{list_items, Value};
use rlp::{Rlp, RlpStream};
use std::fmt;

/// Message type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MsgType {
    Version = 0,
    Invoke = 1,
    Result = 2,
    GetValue = 3,
    SetValue = 4,
    Call = 5,
    Event = 6,
    GetInfo = 7,
    GetBalance = 8,
    GetApi = 9,
    Log = 10,
    Close = 11,
    SetCode = 12,
    GetObjGraph = 13,
    SetObjGraph = 14,
    SetFeePct = 15,
    Run = 32,
    Kill = 33,
    End = 34,
}

impl MsgType {
    pub fn from_u64(tag: u64) -> Result<Self, ProtocolError> {
        let ty = match tag {
            0 => MsgType::Version,
            1 => MsgType::Invoke,
            2 => MsgType::Result,
            3 => MsgType::GetValue,
            4 => MsgType::SetValue,
            5 => MsgType::Call,
            6 => MsgType::Event,
            7 => MsgType::GetInfo,
            8 => MsgType::GetBalance,
            9 => MsgType::GetApi,
            10 => MsgType::Log,
            11 => MsgType::Close,
            12 => MsgType::SetCode,
            13 => MsgType::GetObjGraph,
            14 => MsgType::SetObjGraph,
            15 => MsgType::SetFeePct,
            32 => MsgType::Run,
            33 => MsgType::Kill,
            34 => MsgType::End,
            other => return Err(ProtocolError::UnknownMessageType(other)),
        };
        Ok(ty)
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            MsgType::Version => "VERSION",
            MsgType::Invoke => "INVOKE",
            MsgType::Result => "RESULT",
            MsgType::GetValue => "GETVALUE",
            MsgType::SetValue => "SETVALUE",
            MsgType::Call => "CALL",
            MsgType::Event => "EVENT",
            MsgType::GetInfo => "GETINFO",
            MsgType::GetBalance => "GETBALANCE",
            MsgType::GetApi => "GETAPI",
            MsgType::Log => "LOG",
            MsgType::Close => "CLOSE",
            MsgType::SetCode => "SETCODE",
            MsgType::GetObjGraph => "GETOBJGRAPH",
            MsgType::SetObjGraph => "SETOBJGRAPH",
            MsgType::SetFeePct => "SETFEEPCT",
            MsgType::Run => "RUN",
            MsgType::Kill => "KILL",
            MsgType::End => "END",
        }
    }
}

impl fmt::Display for MsgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One protocol message: `[type, payload]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub msg_type: MsgType,
    pub payload: Value,
}

impl Message {
    pub fn new(msg_type: MsgType, payload: impl Into<Value>) -> Self {
        Self {
            msg_type,
            payload: payload.into(),
        }
    }

    /// Message with a list payload.
    pub fn with_args(msg_type: MsgType, args: Vec<Value>) -> Self {
        Self {
            msg_type,
            payload: Value::List(args),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut s = RlpStream::new_list(2);
        s.append(&self.msg_type.as_u8());
        s.append(&self.payload);
        s.out().to_vec()
    }

    /// Decodes exactly one frame.
    pub fn decode(frame: &[u8]) -> Result<Self, ProtocolError> {
        let rlp = Rlp::new(frame);
        if !rlp.is_list() {
            return Err(ProtocolError::Malformed("message must be a list".into()));
        }
        if rlp.payload_info()?.total() != frame.len() {
            return Err(ProtocolError::Malformed("trailing bytes after message".into()));
        }
        let items = list_items(&rlp)?;
        let [msg_type, payload] = items.as_slice() else {
            return Err(ProtocolError::Arity {
                expected: 2,
                got: items.len(),
            });
        };
        let msg_type = MsgType::from_u64(msg_type.as_val()?)?;
        let payload = Value::from_rlp(payload)?;
        Ok(Self { msg_type, payload })
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:?}", self.msg_type, self.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_round_trip() {
        let msg = Message::with_args(
            MsgType::Version,
            vec![Value::from(1i64), Value::from("engine"), Value::from("rust")],
        );
        assert_eq!(Message::decode(&msg.encode()).unwrap(), msg);

        let close = Message::new(MsgType::Close, Value::Nil);
        assert_eq!(Message::decode(&close.encode()).unwrap(), close);
    }

    #[test]
    fn test_unknown_type_rejected() {
        let mut s = RlpStream::new_list(2);
        s.append(&200u8);
        s.append(&Value::Nil);
        assert!(matches!(
            Message::decode(&s.out()),
            Err(ProtocolError::UnknownMessageType(200))
        ));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut frame = Message::new(MsgType::Close, Value::Nil).encode();
        frame.push(0x80);
        assert!(Message::decode(&frame).is_err());
    }

    #[test]
    fn test_broken_payload_item_rejects_frame() {
        // GETAPI whose list payload ends in an item claiming 5 bytes but holding 1.
        let mut items = rlp::encode(&Value::from(1i64)).to_vec();
        items.extend_from_slice(&[0xc5, 0x01]);
        let mut body = vec![0xc0 + items.len() as u8];
        body.extend_from_slice(&items);

        let mut payload = RlpStream::new_list(2);
        payload.append(&2u8);
        payload.append_raw(&body, 1);

        let mut s = RlpStream::new_list(2);
        s.append(&MsgType::GetApi.as_u8());
        s.append_raw(&payload.out(), 1);
        assert!(Message::decode(&s.out()).is_err());
    }
}
