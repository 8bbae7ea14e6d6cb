//! Lease persistence in a TTL store.
//!
//! Each lease is written as two keys:
//!
//! - a data key `mac:<client>` holding the JSON [`LeaseRecord`], expiring at
//!   `expires + GRACE_PERIOD`;
//! - a sentinel key `shadow:mac:<client>` with an empty value, expiring at
//!   `expires`.
//!
//! The sentinel's expiration event is the release signal. Because the data key
//! outlives it, the record is still readable when that event is handled.
//!
//! The key prefixes must not change for a deployment with existing leases;
//! records under the old prefixes become invisible.

use std::net::Ipv4Addr;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::client::ClientId;
use crate::error::{Error, Result};

pub mod memory;
pub mod redis;
pub mod uri;

pub use self::memory::MemoryLeaseStore;
pub use self::redis::RedisLeaseStore;
pub use self::uri::{Backend, StoreUri};

/// Prefix of data keys.
pub const DATA_KEY_PREFIX: &str = "mac:";

/// Prefix of sentinel keys.
pub const SENTINEL_KEY_PREFIX: &str = "shadow:mac:";

/// How long the data key outlives its sentinel.
pub const GRACE_PERIOD_SECONDS: i64 = 10;

/// Receiving end of a store's key-expiration feed. Each item is the name of
/// an expired key; unrelated keys are included.
pub type ExpirationFeed = mpsc::UnboundedReceiver<String>;

pub fn grace_period() -> TimeDelta {
    TimeDelta::seconds(GRACE_PERIOD_SECONDS)
}

pub fn data_key(client_id: &ClientId) -> String {
    format!("{}{}", DATA_KEY_PREFIX, client_id)
}

pub fn sentinel_key(client_id: &ClientId) -> String {
    format!("{}{}", SENTINEL_KEY_PREFIX, client_id)
}

/// Extracts the client from a sentinel key name, or `None` for any other key.
pub fn client_from_sentinel_key(key: &str) -> Option<&str> {
    key.strip_prefix(SENTINEL_KEY_PREFIX)
}

/// A persisted lease: which address, until when.
///
/// The client identifier is the store key, not part of the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    #[serde(rename = "IP")]
    pub ip: Ipv4Addr,
    #[serde(rename = "Expires")]
    pub expires: DateTime<Utc>,
}

impl LeaseRecord {
    pub fn new(ip: Ipv4Addr, expires: DateTime<Utc>) -> Self {
        Self { ip, expires }
    }

    /// When the sentinel key expires and the release signal fires.
    pub fn sentinel_expiry(&self) -> DateTime<Utc> {
        self.expires
    }

    /// When the data key itself disappears from the store.
    pub fn data_expiry(&self) -> DateTime<Utc> {
        self.expires + grace_period()
    }

    /// Returns true once the lease's nominal expiry has passed.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires <= now
    }

    /// Seconds remaining until expiration, or 0 if expired.
    pub fn remaining_seconds(&self, now: DateTime<Utc>) -> i64 {
        (self.expires - now).num_seconds().max(0)
    }
}

/// A record together with the client it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredLease {
    pub client_id: ClientId,
    pub record: LeaseRecord,
}

/// Encodes a record as the data key's value.
pub fn encode_record(record: &LeaseRecord) -> Result<String> {
    Ok(serde_json::to_string(record)?)
}

/// Decodes a data key's value.
///
/// A record whose address is `0.0.0.0` means "no lease" and decodes to `None`.
///
/// # Errors
///
/// Returns [`Error::DataCorruption`] if the payload is not a valid record.
pub fn decode_record(key: &str, payload: &str) -> Result<Option<LeaseRecord>> {
    let record: LeaseRecord =
        serde_json::from_str(payload).map_err(|error| Error::DataCorruption {
            key: key.to_string(),
            reason: error.to_string(),
        })?;
    Ok((!record.ip.is_unspecified()).then_some(record))
}

/// Backend-agnostic lease persistence.
///
/// `get` returns `Ok(None)` when the client has no lease; errors are reserved
/// for store failures and corrupted payloads.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Looks up the lease for one client.
    async fn get(&self, client_id: &ClientId) -> Result<Option<LeaseRecord>>;

    /// Enumerates every lease currently stored.
    ///
    /// Keys that vanish between enumeration and read, and corrupted payloads,
    /// are skipped.
    async fn get_all(&self) -> Result<Vec<StoredLease>>;

    /// Writes the data key and the sentinel key for a client in one step.
    async fn save(&self, client_id: &ClientId, record: &LeaseRecord) -> Result<()>;

    /// Returns true if the client's sentinel key exists and has not expired.
    ///
    /// Every `save` writes a fresh sentinel, so a live sentinel after an
    /// expiration event means the lease was renewed since.
    async fn has_live_sentinel(&self, client_id: &ClientId) -> Result<bool>;

    /// Subscribes to the store's key-expiration events.
    ///
    /// The feed closes when the subscription ends.
    async fn subscribe_expirations(&self) -> Result<ExpirationFeed>;

    /// The store's notion of the current time.
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
