//! # rangelease
//!
//! DHCPv4 address allocation from a fixed range, with leases persisted in a
//! TTL store (Redis) so that restarts and multiple instances see the same
//! lease state.
//!
//! ## Features
//!
//! - Lowest-free-first allocation from an inclusive `[start, end]` range
//! - Leases stored as a data key plus a shorter-lived sentinel key
//! - Addresses released when the store reports the sentinel's expiration
//! - Allocator re-seeded from the store before serving, failing fast on mismatch
//! - Async/await with Tokio
//!
//! ## Quick Start
//!
//! ```no_run
//! use rangelease::{Config, LeaseRequest, RangePlugin};
//!
//! #[tokio::main]
//! async fn main() -> rangelease::Result<()> {
//!     let config = Config::load_or_create("config.json")?;
//!     let plugin = RangePlugin::setup(&config).await?;
//!     let output = plugin.handle(&LeaseRequest::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff])).await;
//!     println!("{:?}", output.reply);
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`Config`] - Range, lease duration and store URI
//! - [`Ipv4Allocator`] - Thread-safe free/used bitmap over the range
//! - [`LeaseStore`] - Lease persistence; [`RedisLeaseStore`] and [`MemoryLeaseStore`]
//! - [`LeaseManager`] - Per-request lease lookup, allocation and renewal
//! - [`ClientLocks`] - Per-client serialization shared by requests and expirations
//! - [`ExpiryReconciler`] / [`reconcile_startup`] - Allocator/store synchronization
//! - [`RangePlugin`] - Setup tying it all together

pub mod allocator;
pub mod client;
pub mod config;
pub mod error;
pub mod handler;
pub mod locks;
pub mod plugin;
pub mod reconcile;
pub mod store;

pub use allocator::{Allocation, Ipv4Allocator};
pub use client::ClientId;
pub use config::Config;
pub use error::{Error, Result};
pub use handler::{HandlerOutput, LeaseManager, LeaseReply, LeaseRequest};
pub use locks::ClientLocks;
pub use plugin::RangePlugin;
pub use reconcile::{ExpiryReconciler, reconcile_startup};
pub use store::{
    Backend, LeaseRecord, LeaseStore, MemoryLeaseStore, RedisLeaseStore, StoreUri, StoredLease,
};
