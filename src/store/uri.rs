//! Store URI parsing and backend selection.
//!
//! The scheme picks the backend once at setup; adding a backend means adding
//! a [`Backend`] variant and a row in the scheme table. The rest of the URI is
//! parsed by the backend's own client library, so the address, credentials
//! and database seen here are the ones the connection will use.

use std::fmt;
use std::sync::Arc;

use redis::{ConnectionAddr, IntoConnectionInfo};

use crate::error::{Error, Result};
use crate::store::{LeaseStore, RedisLeaseStore};

/// A storage backend, keyed by URI scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Redis,
}

const SCHEMES: &[(&str, Backend)] = &[("redis", Backend::Redis)];

impl Backend {
    pub fn from_scheme(scheme: &str) -> Option<Self> {
        SCHEMES
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(scheme))
            .map(|(_, backend)| *backend)
    }

    /// Connects to the store described by `uri`.
    ///
    /// `enable_notifications` asks the store to emit key-expiration events.
    pub async fn open(
        &self,
        uri: &StoreUri,
        enable_notifications: bool,
    ) -> Result<Arc<dyn LeaseStore>> {
        match self {
            Backend::Redis => Ok(Arc::new(
                RedisLeaseStore::connect(uri, enable_notifications).await?,
            )),
        }
    }
}

/// A parsed store URI.
#[derive(Clone, PartialEq, Eq)]
pub struct StoreUri {
    raw: String,
    pub backend: Backend,
    pub username: Option<String>,
    pub password: Option<String>,
    pub host: String,
    pub port: u16,
    pub db: i64,
}

impl StoreUri {
    /// Parses and validates a store URI.
    ///
    /// # Errors
    ///
    /// - [`Error::MalformedUri`] if there is no `scheme://` prefix or the
    ///   backend's parser rejects the rest (missing host, bad port or db).
    /// - [`Error::UnknownProtocol`] if no backend handles the scheme.
    pub fn parse(uri: &str) -> Result<Self> {
        let malformed = |reason: &dyn fmt::Display| {
            Error::MalformedUri(format!("{}: {}", redact_raw(uri), reason))
        };

        let (scheme, _) = uri
            .split_once("://")
            .filter(|(scheme, _)| !scheme.is_empty())
            .ok_or_else(|| malformed(&"missing scheme"))?;
        let backend =
            Backend::from_scheme(scheme).ok_or_else(|| Error::UnknownProtocol(redact_raw(uri)))?;

        let info = match backend {
            Backend::Redis => uri.into_connection_info().map_err(|error| malformed(&error))?,
        };
        let (host, port) = match info.addr {
            ConnectionAddr::Tcp(host, port) => (host, port),
            other => return Err(malformed(&format!("unsupported address {:?}", other))),
        };
        if host.is_empty() {
            return Err(malformed(&"missing host"));
        }

        Ok(Self {
            raw: uri.to_string(),
            backend,
            username: info.redis.username,
            password: info.redis.password,
            host,
            port,
            db: info.redis.db,
        })
    }

    /// The URI as given, credentials included.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// A form safe to log: the password is masked.
    pub fn redacted(&self) -> String {
        let scheme = self.raw.split_once("://").map_or("", |(scheme, _)| scheme);
        let userinfo = match (&self.username, &self.password) {
            (Some(user), Some(_)) => format!("{}:***@", user),
            (None, Some(_)) => ":***@".to_string(),
            (Some(user), None) => format!("{}@", user),
            (None, None) => String::new(),
        };
        format!(
            "{}://{}{}:{}/{}",
            scheme, userinfo, self.host, self.port, self.db
        )
    }
}

/// Masks the password of a URI that may not parse.
fn redact_raw(uri: &str) -> String {
    let Some((prefix, rest)) = uri.split_once("://") else {
        return uri.to_string();
    };
    let authority_end = rest.find('/').unwrap_or(rest.len());
    match rest[..authority_end].rsplit_once('@') {
        Some((userinfo, host)) => match userinfo.split_once(':') {
            Some((user, _)) => format!("{}://{}:***@{}{}", prefix, user, host, &rest[authority_end..]),
            None => uri.to_string(),
        },
        None => uri.to_string(),
    }
}

impl fmt::Debug for StoreUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StoreUri").field(&self.redacted()).finish()
    }
}

impl fmt::Display for StoreUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted())
    }
}
