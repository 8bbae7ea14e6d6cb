//! DHCPv4 request handling.
//!
//! For each request the [`LeaseManager`] looks up the client's lease, allocates
//! an address for a new client, extends a lease that would otherwise end before
//! a freshly granted one, and persists what changed.
//!
//! # Lease decisions
//!
//! 1. No record: allocate the lowest free address and persist a new record.
//! 2. Record whose address the expiry reconciler already released: re-reserve
//!    that address if it is still free, otherwise allocate a fresh one.
//! 3. Record expiring before `now + lease_time`: extend and persist. This
//!    includes records whose expiry passed but whose expiration has not been
//!    handled yet; their address is still reserved for the client.
//! 4. Otherwise the record is returned untouched and nothing is written.
//!
//! Persistence failures after an allocation or renewal are logged and the
//! address is still handed out. Lookup failures and range exhaustion fail the
//! request.
//!
//! # Concurrency
//!
//! Requests and expirations for the same client are serialized through
//! [`ClientLocks`]. The allocator lock is only taken inside [`Ipv4Allocator`]
//! calls and never across a store round-trip.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, error, info, warn};

use crate::allocator::{Allocation, Ipv4Allocator};
use crate::client::ClientId;
use crate::error::{Error, Result};
use crate::locks::ClientLocks;
use crate::store::{LeaseRecord, LeaseStore};

/// DHCP option 51, IP Address Lease Time (RFC 2132 §9.2).
pub const OPTION_IP_ADDRESS_LEASE_TIME: u8 = 51;

/// Rounds up to the next whole second.
fn ceil_to_second(time: DateTime<Utc>) -> DateTime<Utc> {
    if time.timestamp_subsec_nanos() == 0 {
        return time;
    }
    DateTime::from_timestamp(time.timestamp() + 1, 0).unwrap_or(time)
}

/// The parts of an incoming DHCPv4 message this handler reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseRequest {
    /// Client hardware address (`chaddr`, trimmed to `hlen`).
    pub client_hw_addr: Vec<u8>,
}

impl LeaseRequest {
    pub fn new(client_hw_addr: impl Into<Vec<u8>>) -> Self {
        Self {
            client_hw_addr: client_hw_addr.into(),
        }
    }

    pub fn client_id(&self) -> Result<ClientId> {
        ClientId::from_hardware_addr(&self.client_hw_addr)
    }
}

/// What the handler contributes to the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseReply {
    /// Address for the `yiaddr` field.
    pub your_ip_addr: Ipv4Addr,
    /// Lease time in whole seconds.
    pub lease_time: u32,
}

impl LeaseReply {
    /// Encodes the lease time as an option 51 TLV.
    pub fn lease_time_option(&self) -> [u8; 6] {
        let value = self.lease_time.to_be_bytes();
        [
            OPTION_IP_ADDRESS_LEASE_TIME,
            4,
            value[0],
            value[1],
            value[2],
            value[3],
        ]
    }
}

/// Result of handling one request in a handler chain.
///
/// `reply == None` is the failure signal: no response is sent for this request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerOutput {
    pub reply: Option<LeaseReply>,
    /// Whether later handlers in the chain should run.
    pub continue_chain: bool,
}

impl HandlerOutput {
    fn answered(reply: LeaseReply) -> Self {
        Self {
            reply: Some(reply),
            continue_chain: false,
        }
    }

    fn failed() -> Self {
        Self {
            reply: None,
            continue_chain: false,
        }
    }
}

/// Hands out and renews leases.
pub struct LeaseManager {
    store: Arc<dyn LeaseStore>,
    allocator: Arc<Ipv4Allocator>,
    locks: Arc<ClientLocks>,
    lease_time: TimeDelta,
    lease_time_seconds: u32,
}

impl LeaseManager {
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `lease_time` is zero or too large.
    pub fn new(
        store: Arc<dyn LeaseStore>,
        allocator: Arc<Ipv4Allocator>,
        locks: Arc<ClientLocks>,
        lease_time: Duration,
    ) -> Result<Self> {
        let lease_time_seconds = u32::try_from(lease_time.as_secs())
            .ok()
            .filter(|seconds| *seconds > 0)
            .ok_or_else(|| {
                Error::InvalidConfig(format!(
                    "lease time must be between 1s and {}s, got {:?}",
                    u32::MAX,
                    lease_time
                ))
            })?;

        Ok(Self {
            store,
            allocator,
            locks,
            lease_time: TimeDelta::seconds(i64::from(lease_time_seconds)),
            lease_time_seconds,
        })
    }

    pub fn allocator(&self) -> &Arc<Ipv4Allocator> {
        &self.allocator
    }

    pub fn client_locks(&self) -> &Arc<ClientLocks> {
        &self.locks
    }

    /// Handles one DHCPv4 request.
    ///
    /// Never continues the chain: on success the reply is final, and on
    /// failure no later handler can supply a missing address.
    pub async fn handle(&self, request: &LeaseRequest) -> HandlerOutput {
        let client_id = match request.client_id() {
            Ok(client_id) => client_id,
            Err(error) => {
                warn!("Rejecting request: {}", error);
                return HandlerOutput::failed();
            }
        };

        match self.lease(&client_id).await {
            Ok(record) => {
                info!("Found IP address {} for MAC {}", record.ip, client_id);
                HandlerOutput::answered(LeaseReply {
                    your_ip_addr: record.ip,
                    lease_time: self.lease_time_seconds,
                })
            }
            Err(error) => {
                error!("Could not lease an address to MAC {}: {}", client_id, error);
                HandlerOutput::failed()
            }
        }
    }

    /// Returns the client's current lease, creating or extending it as needed.
    ///
    /// # Errors
    ///
    /// - Store lookup failures ([`Error::StoreUnavailable`], [`Error::DataCorruption`]).
    /// - [`Error::RangeExhausted`] when a new address is needed and none is free.
    pub async fn lease(&self, client_id: &ClientId) -> Result<LeaseRecord> {
        let _serialized = self.locks.lock(client_id).await;
        let now = self.store.now();

        let Some(mut record) = self.store.get(client_id).await? else {
            info!("MAC address {} is new, leasing new IPv4 address", client_id);
            let record = self.grant(client_id, Allocation::Any, now).await?;
            self.locks.clear_released(client_id);
            return Ok(record);
        };

        if self.locks.released(client_id) == Some(record.ip) {
            let record = self.regrant_released(client_id, record, now).await?;
            self.locks.clear_released(client_id);
            return Ok(record);
        }

        let horizon = now + self.lease_time;
        if record.expires < horizon {
            if record.is_expired_at(now) {
                info!(
                    "Lease {} for MAC {} lapsed before its expiration was handled, renewing",
                    record.ip, client_id
                );
            }
            record.expires = ceil_to_second(horizon);
            if let Err(error) = self.store.save(client_id, &record).await {
                error!("Could not persist lease for MAC {}: {}", client_id, error);
            } else {
                debug!("Extended lease {} for {} until {}", record.ip, client_id, record.expires);
            }
        }

        Ok(record)
    }

    async fn grant(
        &self,
        client_id: &ClientId,
        allocation: Allocation,
        now: DateTime<Utc>,
    ) -> Result<LeaseRecord> {
        let ip = self.allocator.allocate(allocation)?;
        let record = LeaseRecord::new(ip, ceil_to_second(now + self.lease_time));

        if let Err(error) = self.store.save(client_id, &record).await {
            error!("Saving lease {} for MAC {} failed: {}", ip, client_id, error);
        }

        Ok(record)
    }

    async fn regrant_released(
        &self,
        client_id: &ClientId,
        released: LeaseRecord,
        now: DateTime<Utc>,
    ) -> Result<LeaseRecord> {
        match self.grant(client_id, Allocation::Specific(released.ip), now).await {
            Ok(record) => {
                info!("Released lease {} for MAC {} re-reserved", record.ip, client_id);
                Ok(record)
            }
            Err(Error::AlreadyAllocated(_) | Error::AddressOutOfRange(_)) => {
                info!(
                    "Released lease {} for MAC {} was reissued, leasing new IPv4 address",
                    released.ip, client_id
                );
                self.grant(client_id, Allocation::Any, now).await
            }
            Err(error) => Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::ExpiryReconciler;
    use crate::store::{MemoryLeaseStore, data_key, sentinel_key};

    fn epoch() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn client(last: u8) -> ClientId {
        ClientId::from_hardware_addr(&[0xaa, 0xaa, 0xaa, 0xaa, 0xaa, last]).unwrap()
    }

    fn setup(lease_secs: u64) -> (Arc<MemoryLeaseStore>, LeaseManager) {
        let store = Arc::new(MemoryLeaseStore::new(epoch()));
        let allocator = Arc::new(
            Ipv4Allocator::new(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 3)).unwrap(),
        );
        let manager = LeaseManager::new(
            store.clone(),
            allocator,
            Arc::new(ClientLocks::new()),
            Duration::from_secs(lease_secs),
        )
        .unwrap();
        (store, manager)
    }

    fn reconciler(store: &Arc<MemoryLeaseStore>, manager: &LeaseManager) -> ExpiryReconciler {
        ExpiryReconciler::new(
            store.clone(),
            Arc::clone(manager.allocator()),
            Arc::clone(manager.client_locks()),
        )
    }

    #[test]
    fn test_ceil_to_second() {
        let exact = epoch();
        assert_eq!(ceil_to_second(exact), exact);
        let fractional = epoch() + TimeDelta::milliseconds(1);
        assert_eq!(ceil_to_second(fractional), epoch() + TimeDelta::seconds(1));
    }

    #[test]
    fn test_lease_time_option_encoding() {
        let reply = LeaseReply {
            your_ip_addr: Ipv4Addr::new(10, 0, 0, 1),
            lease_time: 3600,
        };
        assert_eq!(reply.lease_time_option(), [51, 4, 0x00, 0x00, 0x0e, 0x10]);
    }

    #[test]
    fn test_rejects_zero_lease_time() {
        let store = Arc::new(MemoryLeaseStore::new(epoch()));
        let allocator = Arc::new(
            Ipv4Allocator::new(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 3)).unwrap(),
        );
        assert!(
            LeaseManager::new(store, allocator, Arc::new(ClientLocks::new()), Duration::ZERO)
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_new_client_gets_lowest_free_address() {
        let (store, manager) = setup(60);
        let output = manager.handle(&LeaseRequest::new([0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0x01])).await;

        let reply = output.reply.unwrap();
        assert_eq!(reply.your_ip_addr, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(reply.lease_time, 60);
        assert!(!output.continue_chain);

        let stored = store.get(&client(1)).await.unwrap().unwrap();
        assert_eq!(stored.ip, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(stored.expires, epoch() + TimeDelta::seconds(60));
    }

    #[tokio::test]
    async fn test_same_client_keeps_address() {
        let (_store, manager) = setup(60);
        let first = manager.lease(&client(1)).await.unwrap();
        let second = manager.lease(&client(1)).await.unwrap();
        assert_eq!(first.ip, second.ip);
        assert_eq!(manager.allocator().allocated_count(), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_fails_without_reply() {
        let (_store, manager) = setup(60);
        for last in 1..=3 {
            manager.lease(&client(last)).await.unwrap();
        }
        assert!(matches!(
            manager.lease(&client(4)).await,
            Err(Error::RangeExhausted)
        ));

        let output = manager.handle(&LeaseRequest::new([0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0x04])).await;
        assert_eq!(output.reply, None);
        assert!(!output.continue_chain);
    }

    #[tokio::test]
    async fn test_renewal_extends_near_expiry() {
        let (store, manager) = setup(60);
        let original = manager.lease(&client(1)).await.unwrap();
        assert_eq!(store.write_count(), 1);

        // T - leaseTime + 1s
        store.set_now(original.expires - TimeDelta::seconds(60) + TimeDelta::seconds(1));
        let renewed = manager.lease(&client(1)).await.unwrap();
        assert!(renewed.expires >= original.expires);
        assert_eq!(renewed.expires, original.expires + TimeDelta::seconds(1));
        assert_eq!(renewed.ip, original.ip);
        assert_eq!(store.write_count(), 2);
        assert_eq!(store.get(&client(1)).await.unwrap(), Some(renewed));
    }

    #[tokio::test]
    async fn test_far_from_expiry_is_not_rewritten() {
        let (store, manager) = setup(60);
        let long = LeaseRecord::new(Ipv4Addr::new(10, 0, 0, 2), epoch() + TimeDelta::seconds(600));
        store.save(&client(1), &long).await.unwrap();
        manager
            .allocator()
            .allocate(Allocation::Specific(long.ip))
            .unwrap();

        let record = manager.lease(&client(1)).await.unwrap();
        assert_eq!(record, long);
        assert_eq!(store.write_count(), 1);
    }

    #[tokio::test]
    async fn test_lookup_failure_fails_request() {
        let (store, manager) = setup(60);
        manager.lease(&client(1)).await.unwrap();

        store.set_now(epoch() + TimeDelta::seconds(30));
        store.set_unavailable(true);
        assert!(manager.lease(&client(1)).await.unwrap_err().is_retryable());
        store.set_unavailable(false);
        assert_eq!(manager.lease(&client(1)).await.unwrap().ip, Ipv4Addr::new(10, 0, 0, 1));
    }

    #[tokio::test]
    async fn test_new_lease_kept_in_memory_when_save_fails() {
        let failing_store = Arc::new(FailingWrites(MemoryLeaseStore::new(epoch())));
        let manager = LeaseManager::new(
            failing_store,
            Arc::new(
                Ipv4Allocator::new(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 3))
                    .unwrap(),
            ),
            Arc::new(ClientLocks::new()),
            Duration::from_secs(60),
        )
        .unwrap();
        let record = manager.lease(&client(1)).await.unwrap();
        assert_eq!(record.ip, Ipv4Addr::new(10, 0, 0, 1));
        assert!(manager.allocator().is_allocated(record.ip));

        // nothing was persisted, so the next request allocates again
        let next = manager.lease(&client(1)).await.unwrap();
        assert_eq!(next.ip, Ipv4Addr::new(10, 0, 0, 2));
    }

    #[tokio::test]
    async fn test_lapsed_lease_renewed_in_place_before_expiry_is_handled() {
        let (store, manager) = setup(60);
        let reconciler = reconciler(&store, &manager);
        let original = manager.lease(&client(1)).await.unwrap();

        store.set_now(original.expires + TimeDelta::seconds(1));
        let again = manager.lease(&client(1)).await.unwrap();
        assert_eq!(again.ip, original.ip);
        assert!(again.expires > store.now());
        assert_eq!(manager.allocator().allocated_addresses(), vec![original.ip]);

        // the expiration of the old sentinel arrives late
        let freed = reconciler
            .handle_expired_key(&sentinel_key(&client(1)))
            .await
            .unwrap();
        assert_eq!(freed, None);
        assert_eq!(manager.allocator().allocated_addresses(), vec![original.ip]);
    }

    #[tokio::test]
    async fn test_released_lease_reuses_freed_address() {
        let (store, manager) = setup(60);
        let reconciler = reconciler(&store, &manager);
        let original = manager.lease(&client(1)).await.unwrap();

        store.set_now(original.expires + TimeDelta::seconds(1));
        let freed = reconciler
            .handle_expired_key(&sentinel_key(&client(1)))
            .await
            .unwrap();
        assert_eq!(freed, Some(original.ip));
        assert!(store.contains_key(&data_key(&client(1))));

        let again = manager.lease(&client(1)).await.unwrap();
        assert_eq!(again.ip, original.ip);
        assert!(manager.allocator().is_allocated(original.ip));
        assert!(again.expires > store.now());
        assert_eq!(manager.client_locks().released(&client(1)), None);
    }

    #[tokio::test]
    async fn test_released_lease_taken_by_other_client_gets_new_address() {
        let (store, manager) = setup(60);
        let reconciler = reconciler(&store, &manager);
        let original = manager.lease(&client(1)).await.unwrap();

        store.set_now(original.expires + TimeDelta::seconds(1));
        reconciler
            .handle_expired_key(&sentinel_key(&client(1)))
            .await
            .unwrap();
        let other = manager.lease(&client(2)).await.unwrap();
        assert_eq!(other.ip, original.ip);

        let again = manager.lease(&client(1)).await.unwrap();
        assert_ne!(again.ip, original.ip);
        assert_eq!(manager.allocator().allocated_count(), 2);
    }

    #[tokio::test]
    async fn test_released_mark_survives_failed_regrant() {
        let (store, manager) = setup(60);
        let reconciler = reconciler(&store, &manager);
        for last in 1..=3 {
            manager.lease(&client(last)).await.unwrap();
        }

        store.set_now(epoch() + TimeDelta::seconds(61));
        reconciler
            .handle_expired_key(&sentinel_key(&client(1)))
            .await
            .unwrap();
        assert_eq!(manager.lease(&client(4)).await.unwrap().ip, Ipv4Addr::new(10, 0, 0, 1));
        assert!(matches!(
            manager.lease(&client(1)).await,
            Err(Error::RangeExhausted)
        ));

        reconciler
            .handle_expired_key(&sentinel_key(&client(2)))
            .await
            .unwrap();
        assert_eq!(manager.lease(&client(1)).await.unwrap().ip, Ipv4Addr::new(10, 0, 0, 2));
    }

    #[tokio::test]
    async fn test_invalid_hardware_address_fails() {
        let (_store, manager) = setup(60);
        let output = manager.handle(&LeaseRequest::new(Vec::new())).await;
        assert_eq!(output.reply, None);
    }

    #[tokio::test]
    async fn test_concurrent_clients_get_distinct_addresses() {
        let (_store, manager) = setup(60);
        let manager = Arc::new(manager);

        let mut handles = vec![];
        for last in 1..=3u8 {
            let manager = Arc::clone(&manager);
            handles.push(tokio::spawn(async move { manager.lease(&client(last)).await }));
        }

        let mut allocated = std::collections::HashSet::new();
        for handle in handles {
            let ip = handle.await.unwrap().unwrap().ip;
            assert!(allocated.insert(ip), "Duplicate IP allocated: {}", ip);
        }
        assert_eq!(allocated.len(), 3);
    }

    #[tokio::test]
    async fn test_concurrent_requests_same_client_allocate_once() {
        let (_store, manager) = setup(60);
        let manager = Arc::new(manager);

        let mut handles = vec![];
        for _ in 0..8 {
            let manager = Arc::clone(&manager);
            handles.push(tokio::spawn(async move { manager.lease(&client(1)).await }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap().ip, Ipv4Addr::new(10, 0, 0, 1));
        }
        assert_eq!(manager.allocator().allocated_count(), 1);
    }

    struct FailingWrites(MemoryLeaseStore);

    #[async_trait::async_trait]
    impl LeaseStore for FailingWrites {
        async fn get(&self, client_id: &ClientId) -> Result<Option<LeaseRecord>> {
            self.0.get(client_id).await
        }

        async fn get_all(&self) -> Result<Vec<crate::store::StoredLease>> {
            self.0.get_all().await
        }

        async fn save(&self, _client_id: &ClientId, _record: &LeaseRecord) -> Result<()> {
            Err(Error::StoreUnavailable("write timed out".to_string()))
        }

        async fn has_live_sentinel(&self, client_id: &ClientId) -> Result<bool> {
            self.0.has_live_sentinel(client_id).await
        }

        async fn subscribe_expirations(&self) -> Result<crate::store::ExpirationFeed> {
            self.0.subscribe_expirations().await
        }

        fn now(&self) -> DateTime<Utc> {
            self.0.now()
        }
    }
}
