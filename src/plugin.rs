//! Setup of the range allocator as a DHCPv4 handler.
//!
//! Setup is all-or-nothing: the configuration is validated, the store is
//! reached, every stored lease is re-reserved, and only then does the expiry
//! reconciler start and the handler become available. Any failure on the way
//! aborts setup, so a partially seeded allocator never serves a request.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::info;

use crate::allocator::Ipv4Allocator;
use crate::config::Config;
use crate::error::Result;
use crate::handler::{HandlerOutput, LeaseManager, LeaseRequest};
use crate::locks::ClientLocks;
use crate::reconcile::{ExpiryReconciler, reconcile_startup};
use crate::store::LeaseStore;

/// A ready-to-serve handler plus its background expiry reconciler.
pub struct RangePlugin {
    manager: LeaseManager,
    store: Arc<dyn LeaseStore>,
    reconciler: JoinHandle<()>,
}

impl RangePlugin {
    /// Validates `config`, connects to the store named by its URI and seeds
    /// the allocator from it.
    ///
    /// # Errors
    ///
    /// Configuration errors, [`Error::StoreUnavailable`](crate::Error::StoreUnavailable)
    /// when the store cannot be reached, and
    /// [`Error::AllocatorInconsistency`](crate::Error::AllocatorInconsistency)
    /// when stored leases do not fit the configured range.
    pub async fn setup(config: &Config) -> Result<Self> {
        config.validate()?;
        let uri = config.store_uri()?;
        let store = uri.backend.open(&uri, config.notify_keyspace_events).await?;
        info!("Loading DHCPv4 leases from {}", uri);
        Self::with_store(config, store).await
    }

    /// Like [`setup`](Self::setup), with an already connected store.
    pub async fn with_store(config: &Config, store: Arc<dyn LeaseStore>) -> Result<Self> {
        config.validate()?;
        let allocator = Arc::new(Ipv4Allocator::new(config.range_start, config.range_end)?);
        let locks = Arc::new(ClientLocks::new());
        let manager = LeaseManager::new(
            Arc::clone(&store),
            Arc::clone(&allocator),
            Arc::clone(&locks),
            config.lease_duration(),
        )?;

        // Subscribe first so expirations during the seeding are queued, not lost.
        let feed = store.subscribe_expirations().await?;

        let loaded = reconcile_startup(store.as_ref(), &allocator).await?;
        info!(
            "Loaded {} DHCPv4 leases, {} of {} addresses free ({} - {})",
            loaded,
            allocator.free_count(),
            allocator.capacity(),
            config.range_start,
            config.range_end
        );

        let reconciler = ExpiryReconciler::new(Arc::clone(&store), allocator, locks).spawn(feed);

        Ok(Self {
            manager,
            store,
            reconciler,
        })
    }

    /// Handles one DHCPv4 request. See [`LeaseManager::handle`].
    pub async fn handle(&self, request: &LeaseRequest) -> HandlerOutput {
        self.manager.handle(request).await
    }

    pub fn manager(&self) -> &LeaseManager {
        &self.manager
    }

    pub fn allocator(&self) -> &Arc<Ipv4Allocator> {
        self.manager.allocator()
    }

    pub fn store(&self) -> &Arc<dyn LeaseStore> {
        &self.store
    }

    /// Returns true once the expiry reconciler has stopped (its feed closed).
    pub fn reconciler_finished(&self) -> bool {
        self.reconciler.is_finished()
    }

    /// Stops the expiry reconciler.
    pub async fn shutdown(self) {
        self.reconciler.abort();
        let _ = self.reconciler.await;
        info!("Range allocator stopped");
    }
}
