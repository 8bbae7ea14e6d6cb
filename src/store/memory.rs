//! In-process TTL store.
//!
//! Behaves like the Redis backend from the lease store's point of view: keys
//! carry absolute expiries, expired keys are removed and announced on every
//! subscribed feed. Time only moves when [`MemoryLeaseStore::advance`] or
//! [`MemoryLeaseStore::set_now`] is called, which makes expiry ordering
//! reproducible in tests.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::client::ClientId;
use crate::error::{Error, Result};
use crate::store::{
    DATA_KEY_PREFIX, ExpirationFeed, LeaseRecord, LeaseStore, StoredLease, data_key,
    decode_record, encode_record, sentinel_key,
};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug)]
struct MemoryState {
    now: DateTime<Utc>,
    entries: BTreeMap<String, Entry>,
    subscribers: Vec<mpsc::UnboundedSender<String>>,
    unavailable: bool,
    writes: usize,
}

#[derive(Debug)]
pub struct MemoryLeaseStore {
    state: Mutex<MemoryState>,
}

impl Default for MemoryLeaseStore {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl MemoryLeaseStore {
    /// Creates an empty store whose clock reads `now`.
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                now,
                entries: BTreeMap::new(),
                subscribers: Vec::new(),
                unavailable: false,
                writes: 0,
            }),
        }
    }

    /// Moves the clock forward, expiring keys along the way.
    pub fn advance(&self, by: TimeDelta) {
        let now = self.state.lock().now + by;
        self.set_now(now);
    }

    /// Sets the clock, expiring every key whose expiry is at or before `now`.
    ///
    /// Expired keys are announced in expiry order.
    pub fn set_now(&self, now: DateTime<Utc>) {
        let mut state = self.state.lock();
        state.now = now;

        let mut expired: Vec<(DateTime<Utc>, String)> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(key, entry)| (entry.expires_at, key.clone()))
            .collect();
        expired.sort();

        for (_, key) in expired {
            state.entries.remove(&key);
            debug!("Key {} expired", key);
            state
                .subscribers
                .retain(|subscriber| subscriber.send(key.clone()).is_ok());
        }
    }

    /// Makes every operation fail with [`Error::StoreUnavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unavailable = unavailable;
    }

    /// Writes a raw value, bypassing record encoding.
    pub fn insert_raw(&self, key: &str, value: &str, expires_at: DateTime<Utc>) {
        self.state.lock().entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at,
            },
        );
    }

    /// Announces an expiration without touching the stored keys, as a store
    /// redelivering or reordering events would.
    pub fn emit_expiration(&self, key: &str) {
        self.state
            .lock()
            .subscribers
            .retain(|subscriber| subscriber.send(key.to_string()).is_ok());
    }

    /// Closes every expiration feed handed out so far.
    pub fn close_feeds(&self) {
        self.state.lock().subscribers.clear();
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.state.lock().entries.contains_key(key)
    }

    pub fn expiry_of(&self, key: &str) -> Option<DateTime<Utc>> {
        self.state.lock().entries.get(key).map(|entry| entry.expires_at)
    }

    /// Number of successful `save` calls.
    pub fn write_count(&self) -> usize {
        self.state.lock().writes
    }

    fn check_available(state: &MemoryState) -> Result<()> {
        if state.unavailable {
            return Err(Error::StoreUnavailable(
                "memory store marked unavailable".to_string(),
            ));
        }
        Ok(())
    }

    fn read(state: &MemoryState, key: &str) -> Option<String> {
        state
            .entries
            .get(key)
            .filter(|entry| entry.expires_at > state.now)
            .map(|entry| entry.value.clone())
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn get(&self, client_id: &ClientId) -> Result<Option<LeaseRecord>> {
        let key = data_key(client_id);
        let payload = {
            let state = self.state.lock();
            Self::check_available(&state)?;
            Self::read(&state, &key)
        };
        match payload {
            Some(payload) => decode_record(&key, &payload),
            None => Ok(None),
        }
    }

    async fn get_all(&self) -> Result<Vec<StoredLease>> {
        let payloads: Vec<(String, String)> = {
            let state = self.state.lock();
            Self::check_available(&state)?;
            state
                .entries
                .keys()
                .filter(|key| key.starts_with(DATA_KEY_PREFIX))
                .filter_map(|key| Self::read(&state, key).map(|value| (key.clone(), value)))
                .collect()
        };

        let mut leases = Vec::with_capacity(payloads.len());
        for (key, payload) in payloads {
            let Ok(client_id) = key[DATA_KEY_PREFIX.len()..].parse::<ClientId>() else {
                debug!("Skipping lease key {}", key);
                continue;
            };
            match decode_record(&key, &payload) {
                Ok(Some(record)) => leases.push(StoredLease { client_id, record }),
                Ok(None) => {}
                Err(error) => debug!("Skipping {}", error),
            }
        }
        Ok(leases)
    }

    async fn save(&self, client_id: &ClientId, record: &LeaseRecord) -> Result<()> {
        let payload = encode_record(record)?;
        let mut state = self.state.lock();
        Self::check_available(&state)?;

        state.entries.insert(
            data_key(client_id),
            Entry {
                value: payload,
                expires_at: record.data_expiry(),
            },
        );
        state.entries.insert(
            sentinel_key(client_id),
            Entry {
                value: String::new(),
                expires_at: record.sentinel_expiry(),
            },
        );
        state.writes += 1;
        Ok(())
    }

    async fn has_live_sentinel(&self, client_id: &ClientId) -> Result<bool> {
        let state = self.state.lock();
        Self::check_available(&state)?;
        Ok(Self::read(&state, &sentinel_key(client_id)).is_some())
    }

    async fn subscribe_expirations(&self) -> Result<ExpirationFeed> {
        let mut state = self.state.lock();
        Self::check_available(&state)?;
        let (sender, receiver) = mpsc::unbounded_channel();
        state.subscribers.push(sender);
        Ok(receiver)
    }

    fn now(&self) -> DateTime<Utc> {
        self.state.lock().now
    }
}
