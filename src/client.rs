//! Client identifiers.
//!
//! A lease is keyed by the client's hardware address rendered as lowercase,
//! colon-separated hex (`aa:bb:cc:dd:ee:ff`). The same string is embedded in
//! the store's data and sentinel keys, so the rendering must stay stable.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Longest hardware address carried in a DHCP `chaddr` field.
const MAX_HARDWARE_ADDR_LEN: usize = 16;

/// Encodes raw bytes as a colon-separated hex string.
fn encode_hardware_addr(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|byte| format!("{:02x}", byte))
        .collect::<Vec<_>>()
        .join(":")
}

/// Canonical client identifier derived from a hardware address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(String);

impl ClientId {
    /// Builds the identifier for a raw hardware address.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the address is empty or longer than
    /// a `chaddr` field.
    pub fn from_hardware_addr(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() || bytes.len() > MAX_HARDWARE_ADDR_LEN {
            return Err(Error::InvalidConfig(format!(
                "hardware address must be 1..={} bytes, got {}",
                MAX_HARDWARE_ADDR_LEN,
                bytes.len()
            )));
        }
        Ok(Self(encode_hardware_addr(bytes)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for ClientId {
    type Err = Error;

    /// Parses `AA:BB:..`, `aa-bb-..` or already-canonical identifiers.
    fn from_str(value: &str) -> Result<Self> {
        let normalized = value.trim().to_lowercase().replace('-', ":");
        let mut bytes = Vec::new();
        for part in normalized.split(':') {
            let byte = u8::from_str_radix(part, 16)
                .ok()
                .filter(|_| part.len() == 2)
                .ok_or_else(|| {
                    Error::InvalidConfig(format!("invalid hardware address: {}", value))
                })?;
            bytes.push(byte);
        }
        Self::from_hardware_addr(&bytes)
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}
