//! Keeping the allocator in step with the lease store.
//!
//! - [`reconcile_startup`] runs once before serving: every stored lease is
//!   re-reserved in the allocator, and any failure aborts startup.
//! - [`ExpiryReconciler`] runs for the process lifetime: each sentinel-key
//!   expiration resolves the client's record and frees its address, unless
//!   the lease was renewed in the meantime.
//!
//! Expiry handling never retries. A dropped event leaves the address marked
//! allocated until the next restart, which re-seeds from the store.

use std::net::Ipv4Addr;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::allocator::{Allocation, Ipv4Allocator};
use crate::client::ClientId;
use crate::error::{Error, Result};
use crate::locks::ClientLocks;
use crate::store::{ExpirationFeed, LeaseStore, client_from_sentinel_key};

/// Marks every stored lease's address allocated.
///
/// Returns the number of leases re-reserved.
///
/// # Errors
///
/// - Store failures while enumerating leases.
/// - [`Error::AllocatorInconsistency`] if an address is out of range, already
///   taken, or not the one requested. The allocator must then not be used.
pub async fn reconcile_startup(store: &dyn LeaseStore, allocator: &Ipv4Allocator) -> Result<usize> {
    let leases = store.get_all().await?;

    for lease in &leases {
        let requested = lease.record.ip;
        let allocated = allocator
            .allocate(Allocation::Specific(requested))
            .map_err(|error| Error::AllocatorInconsistency {
                requested,
                detail: format!("lease of {}: {}", lease.client_id, error),
            })?;
        if allocated != requested {
            return Err(Error::AllocatorInconsistency {
                requested,
                detail: format!("allocator returned {}", allocated),
            });
        }
        debug!("Re-reserved {} for {}", requested, lease.client_id);
    }

    Ok(leases.len())
}

/// Releases addresses whose leases expired.
pub struct ExpiryReconciler {
    store: Arc<dyn LeaseStore>,
    allocator: Arc<Ipv4Allocator>,
    locks: Arc<ClientLocks>,
}

impl ExpiryReconciler {
    /// `locks` must be the ones the [`LeaseManager`](crate::LeaseManager)
    /// serving the same allocator uses.
    pub fn new(
        store: Arc<dyn LeaseStore>,
        allocator: Arc<Ipv4Allocator>,
        locks: Arc<ClientLocks>,
    ) -> Self {
        Self {
            store,
            allocator,
            locks,
        }
    }

    /// Runs [`run`](Self::run) on a background task.
    pub fn spawn(self, feed: ExpirationFeed) -> JoinHandle<()> {
        tokio::spawn(self.run(feed))
    }

    /// Consumes expiration events until the feed closes.
    pub async fn run(self, mut feed: ExpirationFeed) {
        info!("Expiry reconciler started");

        while let Some(key) = feed.recv().await {
            if let Err(error) = self.handle_expired_key(&key).await {
                warn!("Dropping expiration of {}: {}", key, error);
            }
        }

        info!("Expiration feed closed, expiry reconciler stopped");
    }

    /// Handles one expired key.
    ///
    /// Returns the freed address, or `None` if the key is not a sentinel or
    /// the lease was renewed after the sentinel expired.
    ///
    /// # Errors
    ///
    /// Store failures, a missing or corrupted record, or a recorded address
    /// outside the range.
    pub async fn handle_expired_key(&self, key: &str) -> Result<Option<Ipv4Addr>> {
        let Some(client) = client_from_sentinel_key(key) else {
            return Ok(None);
        };
        let client_id: ClientId = client.parse()?;
        let _serialized = self.locks.lock(&client_id).await;

        let record = self
            .store
            .get(&client_id)
            .await?
            .ok_or_else(|| Error::LeaseNotFound(client_id.to_string()))?;

        // A renewal after this sentinel expired wrote a new one.
        if self.store.has_live_sentinel(&client_id).await? {
            debug!(
                "Lease {} for MAC {} was renewed until {}, keeping it",
                record.ip, client_id, record.expires
            );
            return Ok(None);
        }

        self.allocator.free(record.ip)?;
        self.locks.mark_released(&client_id, record.ip);
        info!("IP lease {} for MAC address {} expired", record.ip, client_id);

        Ok(Some(record.ip))
    }
}
