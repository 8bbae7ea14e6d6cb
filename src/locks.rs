//! Per-client coordination between request handling and expiry handling.
//!
//! Both the [`LeaseManager`](crate::LeaseManager) and the
//! [`ExpiryReconciler`](crate::ExpiryReconciler) take the client's lock before
//! touching its record or its address, so a request and an expiration for the
//! same client never interleave.
//!
//! The reconciler also notes each address it releases. A request that finds a
//! lapsed record uses that note to tell "my address was released and must be
//! re-reserved" apart from "the expiration has not been handled yet and the
//! address is still mine".

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::Ipv4Addr;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard};

use crate::client::ClientId;

const CLIENT_LOCK_STRIPES: usize = 64;

pub struct ClientLocks {
    stripes: Box<[AsyncMutex<()>]>,
    released: Mutex<HashMap<ClientId, Ipv4Addr>>,
}

impl Default for ClientLocks {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientLocks {
    pub fn new() -> Self {
        Self {
            stripes: (0..CLIENT_LOCK_STRIPES).map(|_| AsyncMutex::new(())).collect(),
            released: Mutex::new(HashMap::new()),
        }
    }

    /// Serializes work on one client. Distinct clients may share a stripe.
    pub async fn lock(&self, client_id: &ClientId) -> MutexGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        client_id.hash(&mut hasher);
        let stripe = hasher.finish() as usize % self.stripes.len();
        self.stripes[stripe].lock().await
    }

    /// Records that `ip` was freed because the client's lease expired.
    pub fn mark_released(&self, client_id: &ClientId, ip: Ipv4Addr) {
        self.released.lock().insert(client_id.clone(), ip);
    }

    /// The address last released for the client, if not yet claimed again.
    pub fn released(&self, client_id: &ClientId) -> Option<Ipv4Addr> {
        self.released.lock().get(client_id).copied()
    }

    pub fn clear_released(&self, client_id: &ClientId) {
        self.released.lock().remove(client_id);
    }
}
