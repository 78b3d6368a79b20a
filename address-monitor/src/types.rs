//! Core types shared by the monitor, the tasks and the world state.

use alloy_primitives::hex;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Transaction index in the batch (0-based). Also the task's priority: the
/// lower the index, the higher the priority.
pub type TxnIndex = usize;

/// Attempt number (how many times a task has been restarted after an abort).
pub type Incarnation = usize;

/// Length in bytes of an encoded [`Address`].
pub const ADDRESS_LEN: usize = 21;

const PREFIX_EXTERNAL: u8 = 0;
const PREFIX_CONTRACT: u8 = 1;

/// Errors raised while building an [`Address`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("address must be {ADDRESS_LEN} bytes, got {0}")]
    InvalidLength(usize),

    #[error("unknown address prefix byte {0:#04x}")]
    InvalidPrefix(u8),

    #[error("malformed address string: {0}")]
    Malformed(String),
}

/// Account identifier.
///
/// The first byte tells an external (user) account from a contract account,
/// the remaining 20 bytes are the account id.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address([u8; ADDRESS_LEN]);

impl Address {
    /// Builds an address from its 21-byte encoding.
    pub fn new(bytes: [u8; ADDRESS_LEN]) -> Result<Self, AddressError> {
        match bytes[0] {
            PREFIX_EXTERNAL | PREFIX_CONTRACT => Ok(Self(bytes)),
            other => Err(AddressError::InvalidPrefix(other)),
        }
    }

    /// Builds an address from a byte slice, checking length and prefix.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, AddressError> {
        let fixed: [u8; ADDRESS_LEN] = bytes
            .try_into()
            .map_err(|_| AddressError::InvalidLength(bytes.len()))?;
        Self::new(fixed)
    }

    /// External account whose id ends with the big-endian `id`.
    pub fn external(id: u64) -> Self {
        Self::with_prefix(PREFIX_EXTERNAL, id)
    }

    /// Contract account whose id ends with the big-endian `id`.
    pub fn contract(id: u64) -> Self {
        Self::with_prefix(PREFIX_CONTRACT, id)
    }

    fn with_prefix(prefix: u8, id: u64) -> Self {
        let mut bytes = [0u8; ADDRESS_LEN];
        bytes[0] = prefix;
        bytes[ADDRESS_LEN - 8..].copy_from_slice(&id.to_be_bytes());
        Self(bytes)
    }

    pub fn is_contract(&self) -> bool {
        self.0[0] == PREFIX_CONTRACT
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = if self.is_contract() { "cx" } else { "hx" };
        write!(f, "{}{}", prefix, hex::encode(&self.0[1..]))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (prefix, body) = if let Some(body) = s.strip_prefix("hx") {
            (PREFIX_EXTERNAL, body)
        } else if let Some(body) = s.strip_prefix("cx") {
            (PREFIX_CONTRACT, body)
        } else {
            return Err(AddressError::Malformed(s.to_string()));
        };
        let id = hex::decode(body).map_err(|e| AddressError::Malformed(e.to_string()))?;
        if id.len() != ADDRESS_LEN - 1 {
            return Err(AddressError::InvalidLength(id.len() + 1));
        }
        let mut bytes = [0u8; ADDRESS_LEN];
        bytes[0] = prefix;
        bytes[1..].copy_from_slice(&id);
        Ok(Self(bytes))
    }
}

impl TryFrom<&[u8]> for Address {
    type Error = AddressError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        Self::from_slice(bytes)
    }
}
