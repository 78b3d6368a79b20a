//! Self-describing value model carried in every message.
//!
//! # Wire Format
//!
//! A value is the RLP list `[tag, body]`:
//!
//! ```text
//! Nil      0   empty string
//! Map      1   [[key, value], ...] sorted by key
//! List     2   [value, ...]
//! Bytes    3   byte string
//! Str      4   utf-8 byte string
//! Bool     5   0x00 or 0x01
//! Address  10  21-byte string
//! Int      11  minimal big-endian two's complement
//! ```

use crate::error::ProtocolError;
use address_monitor::Address;
use alloy_primitives::U256;
use rlp::{Decodable, DecoderError, Encodable, Rlp, RlpStream};
use std::collections::BTreeMap;
use std::fmt;

const TAG_NIL: u8 = 0;
const TAG_MAP: u8 = 1;
const TAG_LIST: u8 = 2;
const TAG_BYTES: u8 = 3;
const TAG_STR: u8 = 4;
const TAG_BOOL: u8 = 5;
const TAG_ADDRESS: u8 = 10;
const TAG_INT: u8 = 11;

/// Deepest container nesting accepted from the wire.
pub const MAX_NESTING: usize = 64;

/// Items of an RLP list. Unlike `Rlp::iter`, a malformed item is an error
/// rather than the end of the list, and the items must fill the payload
/// exactly.
pub(crate) fn list_items<'a>(rlp: &Rlp<'a>) -> Result<Vec<Rlp<'a>>, ProtocolError> {
    let payload = rlp.payload_info()?.value_len;
    let mut items = Vec::new();
    let mut consumed = 0;
    while consumed < payload {
        let item = rlp.at(items.len())?;
        consumed += item.as_raw().len();
        items.push(item);
    }
    if consumed != payload {
        return Err(ProtocolError::Malformed("list items overrun their payload".into()));
    }
    Ok(items)
}

/// Arbitrary-precision integer as big-endian two's complement bytes.
///
/// Always stored in minimal form, so equal numbers have equal encodings.
/// Zero is `[0x00]`.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct BigInt(Vec<u8>);

impl BigInt {
    pub fn zero() -> Self {
        Self(vec![0])
    }

    /// Wraps two's complement bytes, normalizing them.
    pub fn from_be_bytes(bytes: &[u8]) -> Self {
        if bytes.is_empty() {
            return Self::zero();
        }
        let mut start = 0;
        while start + 1 < bytes.len() {
            let (head, next) = (bytes[start], bytes[start + 1]);
            let redundant = (head == 0x00 && next & 0x80 == 0) || (head == 0xff && next & 0x80 != 0);
            if !redundant {
                break;
            }
            start += 1;
        }
        Self(bytes[start..].to_vec())
    }

    /// Non-negative integer from unsigned big-endian bytes.
    pub fn from_unsigned_be_bytes(bytes: &[u8]) -> Self {
        let mut signed = Vec::with_capacity(bytes.len() + 1);
        signed.push(0);
        signed.extend_from_slice(bytes);
        Self::from_be_bytes(&signed)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_negative(&self) -> bool {
        self.0[0] & 0x80 != 0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0]
    }

    pub fn to_i64(&self) -> Option<i64> {
        if self.0.len() > 8 {
            return None;
        }
        let fill = if self.is_negative() { 0xff } else { 0x00 };
        let mut buf = [fill; 8];
        buf[8 - self.0.len()..].copy_from_slice(&self.0);
        Some(i64::from_be_bytes(buf))
    }

    pub fn to_u64(&self) -> Option<u64> {
        if self.is_negative() {
            return None;
        }
        let magnitude = self.magnitude();
        if magnitude.len() > 8 {
            return None;
        }
        let mut buf = [0u8; 8];
        buf[8 - magnitude.len()..].copy_from_slice(magnitude);
        Some(u64::from_be_bytes(buf))
    }

    pub fn to_u256(&self) -> Option<U256> {
        if self.is_negative() {
            return None;
        }
        let magnitude = self.magnitude();
        if magnitude.len() > 32 {
            return None;
        }
        Some(U256::from_be_slice(magnitude))
    }

    /// Unsigned bytes of a non-negative value, without leading zeros.
    fn magnitude(&self) -> &[u8] {
        let start = self.0.iter().position(|b| *b != 0).unwrap_or(self.0.len());
        &self.0[start..]
    }
}

impl Default for BigInt {
    fn default() -> Self {
        Self::zero()
    }
}

impl From<i64> for BigInt {
    fn from(v: i64) -> Self {
        Self::from_be_bytes(&v.to_be_bytes())
    }
}

impl From<i32> for BigInt {
    fn from(v: i32) -> Self {
        Self::from(i64::from(v))
    }
}

impl From<u64> for BigInt {
    fn from(v: u64) -> Self {
        Self::from_unsigned_be_bytes(&v.to_be_bytes())
    }
}

impl From<U256> for BigInt {
    fn from(v: U256) -> Self {
        Self::from_unsigned_be_bytes(&v.to_be_bytes::<32>())
    }
}

impl fmt::Debug for BigInt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_i64() {
            Some(v) => write!(f, "{v}"),
            None => write!(f, "0x{}", alloy_primitives::hex::encode(&self.0)),
        }
    }
}

/// A protocol value.
#[derive(Clone, PartialEq, Eq)]
pub enum Value {
    Nil,
    Bool(bool),
    Bytes(Vec<u8>),
    Str(String),
    Int(BigInt),
    Address(Address),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Bytes(_) => "bytes",
            Value::Str(_) => "str",
            Value::Int(_) => "int",
            Value::Address(_) => "address",
            Value::List(_) => "list",
            Value::Map(_) => "map",
        }
    }

    fn tag(&self) -> u8 {
        match self {
            Value::Nil => TAG_NIL,
            Value::Map(_) => TAG_MAP,
            Value::List(_) => TAG_LIST,
            Value::Bytes(_) => TAG_BYTES,
            Value::Str(_) => TAG_STR,
            Value::Bool(_) => TAG_BOOL,
            Value::Address(_) => TAG_ADDRESS,
            Value::Int(_) => TAG_INT,
        }
    }

    fn unexpected(&self, expected: &'static str) -> ProtocolError {
        ProtocolError::UnexpectedValue {
            expected,
            got: self.kind(),
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn as_bool(&self) -> Result<bool, ProtocolError> {
        match self {
            Value::Bool(b) => Ok(*b),
            other => Err(other.unexpected("bool")),
        }
    }

    pub fn as_int(&self) -> Result<&BigInt, ProtocolError> {
        match self {
            Value::Int(i) => Ok(i),
            other => Err(other.unexpected("int")),
        }
    }

    pub fn as_i64(&self) -> Result<i64, ProtocolError> {
        self.as_int()?
            .to_i64()
            .ok_or_else(|| ProtocolError::Malformed("integer does not fit in i64".into()))
    }

    pub fn as_u64(&self) -> Result<u64, ProtocolError> {
        self.as_int()?
            .to_u64()
            .ok_or_else(|| ProtocolError::Malformed("integer does not fit in u64".into()))
    }

    pub fn as_u256(&self) -> Result<U256, ProtocolError> {
        self.as_int()?
            .to_u256()
            .ok_or_else(|| ProtocolError::Malformed("integer does not fit in u256".into()))
    }

    pub fn as_bytes(&self) -> Result<&[u8], ProtocolError> {
        match self {
            Value::Bytes(b) => Ok(b),
            other => Err(other.unexpected("bytes")),
        }
    }

    /// Bytes, or `None` for Nil.
    pub fn as_opt_bytes(&self) -> Result<Option<&[u8]>, ProtocolError> {
        match self {
            Value::Nil => Ok(None),
            other => other.as_bytes().map(Some),
        }
    }

    pub fn as_str(&self) -> Result<&str, ProtocolError> {
        match self {
            Value::Str(s) => Ok(s),
            other => Err(other.unexpected("str")),
        }
    }

    pub fn as_address(&self) -> Result<Address, ProtocolError> {
        match self {
            Value::Address(a) => Ok(*a),
            other => Err(other.unexpected("address")),
        }
    }

    /// Address, or `None` for Nil.
    pub fn as_opt_address(&self) -> Result<Option<Address>, ProtocolError> {
        match self {
            Value::Nil => Ok(None),
            other => other.as_address().map(Some),
        }
    }

    pub fn as_list(&self) -> Result<&[Value], ProtocolError> {
        match self {
            Value::List(items) => Ok(items),
            other => Err(other.unexpected("list")),
        }
    }

    /// List with exactly `n` items.
    pub fn as_tuple(&self, n: usize) -> Result<&[Value], ProtocolError> {
        let items = self.as_list()?;
        if items.len() != n {
            return Err(ProtocolError::Arity {
                expected: n,
                got: items.len(),
            });
        }
        Ok(items)
    }

    pub fn as_map(&self) -> Result<&BTreeMap<String, Value>, ProtocolError> {
        match self {
            Value::Map(map) => Ok(map),
            other => Err(other.unexpected("map")),
        }
    }

    pub fn into_bytes(self) -> Result<Vec<u8>, ProtocolError> {
        match self {
            Value::Bytes(b) => Ok(b),
            other => Err(other.unexpected("bytes")),
        }
    }

    pub fn into_list(self) -> Result<Vec<Value>, ProtocolError> {
        match self {
            Value::List(items) => Ok(items),
            other => Err(other.unexpected("list")),
        }
    }

    /// Decodes a value from an RLP item.
    pub fn from_rlp(rlp: &Rlp<'_>) -> Result<Self, ProtocolError> {
        Self::decode_nested(rlp, 0)
    }

    fn decode_nested(rlp: &Rlp<'_>, depth: usize) -> Result<Self, ProtocolError> {
        if depth > MAX_NESTING {
            return Err(ProtocolError::Malformed("nesting too deep".into()));
        }
        if !rlp.is_list() {
            return Err(ProtocolError::Malformed("value must be a [tag, body] pair".into()));
        }
        let pair = list_items(rlp)?;
        let [tag, body] = pair.as_slice() else {
            return Err(ProtocolError::Malformed("value must be a [tag, body] pair".into()));
        };
        let tag: u8 = tag.as_val()?;
        let value = match tag {
            TAG_NIL => {
                if !body.is_empty() {
                    return Err(ProtocolError::Malformed("nil with a body".into()));
                }
                Value::Nil
            }
            TAG_MAP => {
                if !body.is_list() {
                    return Err(ProtocolError::Malformed("map body is not a list".into()));
                }
                let mut map = BTreeMap::new();
                for entry in list_items(body)? {
                    if !entry.is_list() {
                        return Err(ProtocolError::Malformed("map entry must be a pair".into()));
                    }
                    let pair = list_items(&entry)?;
                    let [key, value] = pair.as_slice() else {
                        return Err(ProtocolError::Malformed("map entry must be a pair".into()));
                    };
                    let key = String::from_utf8(key.data()?.to_vec())
                        .map_err(|_| ProtocolError::Malformed("map key is not utf-8".into()))?;
                    map.insert(key, Value::decode_nested(value, depth + 1)?);
                }
                Value::Map(map)
            }
            TAG_LIST => {
                if !body.is_list() {
                    return Err(ProtocolError::Malformed("list body is not a list".into()));
                }
                Value::List(
                    list_items(body)?
                        .iter()
                        .map(|item| Value::decode_nested(item, depth + 1))
                        .collect::<Result<_, _>>()?,
                )
            }
            TAG_BYTES => Value::Bytes(body.data()?.to_vec()),
            TAG_STR => Value::Str(
                String::from_utf8(body.data()?.to_vec())
                    .map_err(|_| ProtocolError::Malformed("string is not utf-8".into()))?,
            ),
            TAG_BOOL => match body.data()? {
                [0] => Value::Bool(false),
                [1] => Value::Bool(true),
                _ => return Err(ProtocolError::Malformed("invalid bool".into())),
            },
            TAG_ADDRESS => Value::Address(Address::from_slice(body.data()?)?),
            TAG_INT => {
                let bytes = body.data()?;
                if bytes.is_empty() {
                    return Err(ProtocolError::Malformed("empty integer".into()));
                }
                Value::Int(BigInt::from_be_bytes(bytes))
            }
            other => return Err(ProtocolError::UnknownTag(other)),
        };
        Ok(value)
    }
}

impl Encodable for Value {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(2);
        s.append(&self.tag());
        match self {
            Value::Nil => {
                s.append_empty_data();
            }
            Value::Map(map) => {
                s.begin_list(map.len());
                for (key, value) in map {
                    s.begin_list(2);
                    s.encoder().encode_value(key.as_bytes());
                    s.append(value);
                }
            }
            Value::List(items) => {
                s.begin_list(items.len());
                for item in items {
                    s.append(item);
                }
            }
            Value::Bytes(bytes) => s.encoder().encode_value(bytes),
            Value::Str(text) => s.encoder().encode_value(text.as_bytes()),
            Value::Bool(b) => s.encoder().encode_value(&[u8::from(*b)]),
            Value::Address(address) => s.encoder().encode_value(address.as_bytes()),
            Value::Int(int) => s.encoder().encode_value(int.as_bytes()),
        }
    }
}

impl Decodable for Value {
    fn decode(rlp: &Rlp<'_>) -> Result<Self, DecoderError> {
        Value::from_rlp(rlp).map_err(|_| DecoderError::Custom("invalid value"))
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Bytes(b) => write!(f, "0x{}", alloy_primitives::hex::encode(b)),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::Int(i) => write!(f, "{i:?}"),
            Value::Address(a) => write!(f, "{a}"),
            Value::List(items) => f.debug_list().entries(items).finish(),
            Value::Map(map) => f.debug_map().entries(map).finish(),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v.into())
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v.into())
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Int(v.into())
    }
}

impl From<U256> for Value {
    fn from(v: U256) -> Self {
        Value::Int(v.into())
    }
}

impl From<BigInt> for Value {
    fn from(v: BigInt) -> Self {
        Value::Int(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<Address> for Value {
    fn from(v: Address) -> Self {
        Value::Address(v)
    }
}

impl From<Option<Address>> for Value {
    fn from(v: Option<Address>) -> Self {
        v.map(Value::Address).unwrap_or(Value::Nil)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(v: BTreeMap<String, Value>) -> Self {
        Value::Map(v)
    }
}
