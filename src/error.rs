//! Error types for the range allocator.
//!
//! All fallible operations in this crate return [`Result<T>`], which uses
//! the [`Error`] enum for error variants.

use std::net::Ipv4Addr;

/// Errors that can occur while allocating, persisting, or reconciling leases.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// File system I/O error (config file).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error (config file).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid configuration.
    ///
    /// Returned by [`Config::validate`](crate::Config::validate) when the
    /// configuration contains invalid values (e.g., range_start >= range_end).
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The store URI could not be parsed.
    #[error("Malformed store URI: {0}")]
    MalformedUri(String),

    /// The store URI names a scheme with no registered backend.
    #[error("Unknown store protocol: {0}")]
    UnknownProtocol(String),

    /// The TTL store could not be reached or did not answer in time.
    ///
    /// This is the only retryable error kind. At setup it is fatal; at request
    /// time it fails the affected request only.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// The store answered with an error reply that is not a connectivity problem.
    #[error("Store error: {0}")]
    Store(redis::RedisError),

    /// A stored lease payload could not be decoded.
    #[error("Corrupted lease record at {key}: {reason}")]
    DataCorruption { key: String, reason: String },

    /// Every address in the configured range is allocated.
    #[error("No available IP addresses in range")]
    RangeExhausted,

    /// Requested address is outside the configured range.
    #[error("Address {0} is outside the configured range")]
    AddressOutOfRange(Ipv4Addr),

    /// Requested address is already marked allocated.
    #[error("Address {0} is already allocated")]
    AlreadyAllocated(Ipv4Addr),

    /// Startup reconciliation could not re-reserve a leased address.
    ///
    /// The durable store disagrees with the configured range; the process
    /// must not serve traffic.
    #[error("Could not re-reserve leased address {requested}: {detail}")]
    AllocatorInconsistency { requested: Ipv4Addr, detail: String },

    /// No lease record exists for the specified client.
    #[error("Client {0} not found in leases")]
    LeaseNotFound(String),
}

impl Error {
    /// Returns true if retrying the same operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::StoreUnavailable(_))
    }
}

impl From<redis::RedisError> for Error {
    fn from(error: redis::RedisError) -> Self {
        if error.is_io_error()
            || error.is_timeout()
            || error.is_connection_dropped()
            || error.is_connection_refusal()
        {
            Error::StoreUnavailable(error.to_string())
        } else {
            Error::Store(error)
        }
    }
}

/// A specialized Result type for lease operations.
pub type Result<T> = std::result::Result<T, Error>;
