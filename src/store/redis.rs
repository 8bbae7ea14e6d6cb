//! Redis-backed [`LeaseStore`].
//!
//! Data and sentinel keys are written in one `MULTI`/`EXEC` with absolute
//! `PXAT` expiries. Expiration events come from the keyspace notification
//! channel `__keyevent@<db>__:expired`, which Redis only publishes when
//! `notify-keyspace-events` contains `Ex`.
//!
//! The pub/sub connection does not survive a server restart or a network
//! failure. The forwarding task resubscribes with backoff and keeps the feed
//! open until its receiver is dropped. Expirations published while no
//! subscription was active are lost, which leaves those addresses reserved
//! until the next startup reconciliation.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{BoxStream, Stream, StreamExt};
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::client::ClientId;
use crate::error::{Error, Result};
use crate::store::uri::StoreUri;
use crate::store::{
    DATA_KEY_PREFIX, ExpirationFeed, LeaseRecord, LeaseStore, StoredLease, data_key,
    decode_record, encode_record, sentinel_key,
};

const NOTIFY_KEYSPACE_EVENTS: &str = "Ex";

/// Delays between resubscription attempts.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

const RESUBSCRIBE_BACKOFF: Backoff = Backoff {
    initial: Duration::from_millis(200),
    max: Duration::from_secs(10),
};

pub struct RedisLeaseStore {
    client: redis::Client,
    connection: MultiplexedConnection,
    uri: StoreUri,
}

impl RedisLeaseStore {
    /// Opens a connection and checks it with `PING`.
    ///
    /// When `enable_notifications` is set, also configures the server to emit
    /// expiration events. Servers that refuse `CONFIG SET` only get a warning;
    /// they must then be configured out of band.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreUnavailable`] if the server cannot be reached.
    pub async fn connect(uri: &StoreUri, enable_notifications: bool) -> Result<Self> {
        let client = redis::Client::open(uri.as_str())
            .map_err(|error| Error::MalformedUri(format!("{}: {}", uri, error)))?;
        let mut connection = client.get_multiplexed_async_connection().await?;

        let pong: String = redis::cmd("PING").query_async(&mut connection).await?;
        debug!("{} answered {}", uri, pong);

        if enable_notifications {
            let result: redis::RedisResult<()> = redis::cmd("CONFIG")
                .arg("SET")
                .arg("notify-keyspace-events")
                .arg(NOTIFY_KEYSPACE_EVENTS)
                .query_async(&mut connection)
                .await;
            if let Err(error) = result {
                warn!(
                    "Could not enable keyspace notifications on {}: {}. Expired leases will not be released until restart unless notify-keyspace-events includes 'Ex'",
                    uri, error
                );
            }
        }

        info!("Set storage to {}", uri);

        Ok(Self {
            client,
            connection,
            uri: uri.clone(),
        })
    }
}

/// Builds the transaction writing both keys of a lease.
fn save_pipeline(
    client_id: &ClientId,
    payload: String,
    record: &LeaseRecord,
) -> redis::Pipeline {
    let mut pipe = redis::pipe();
    pipe.atomic()
        .cmd("SET")
        .arg(data_key(client_id))
        .arg(payload)
        .arg("PXAT")
        .arg(record.data_expiry().timestamp_millis())
        .ignore()
        .cmd("SET")
        .arg(sentinel_key(client_id))
        .arg("")
        .arg("PXAT")
        .arg(record.sentinel_expiry().timestamp_millis())
        .ignore();
    pipe
}

/// Opens a pub/sub connection listening on `channel`.
async fn subscribe_channel(
    client: redis::Client,
    channel: String,
) -> Result<BoxStream<'static, String>> {
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.subscribe(&channel).await?;

    let keys = pubsub.into_on_message().filter_map(|message| {
        let key = match message.get_payload::<String>() {
            Ok(key) => Some(key),
            Err(error) => {
                warn!("Ignoring undecodable expiration event: {}", error);
                None
            }
        };
        futures::future::ready(key)
    });
    Ok(keys.boxed())
}

/// Forwards expired keys into `sender`, resubscribing whenever a subscription
/// ends or cannot be established.
///
/// Returns once the receiving side of `sender` is dropped.
pub(crate) async fn forward_expirations<F, Fut, S>(
    mut subscribe: F,
    mut current: Option<S>,
    sender: mpsc::UnboundedSender<String>,
    backoff: Backoff,
    source: String,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<S>>,
    S: Stream<Item = String> + Unpin,
{
    let mut delay = backoff.initial;

    loop {
        if let Some(mut keys) = current.take() {
            loop {
                tokio::select! {
                    key = keys.next() => match key {
                        Some(key) => {
                            if sender.send(key).is_err() {
                                return;
                            }
                        }
                        None => break,
                    },
                    _ = sender.closed() => return,
                }
            }
            warn!("Expiration subscription to {} ended, resubscribing", source);
        }

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = sender.closed() => return,
        }

        match subscribe().await {
            Ok(keys) => {
                info!("Resubscribed to expiration events on {}", source);
                delay = backoff.initial;
                current = Some(keys);
            }
            Err(error) => {
                warn!(
                    "Could not resubscribe to {} (retrying in {:?}): {}",
                    source, delay, error
                );
                delay = (delay * 2).min(backoff.max);
            }
        }
    }
}

#[async_trait]
impl LeaseStore for RedisLeaseStore {
    async fn get(&self, client_id: &ClientId) -> Result<Option<LeaseRecord>> {
        let key = data_key(client_id);
        let mut connection = self.connection.clone();
        let payload: Option<String> = connection.get(&key).await?;
        match payload {
            Some(payload) => decode_record(&key, &payload),
            None => Ok(None),
        }
    }

    async fn get_all(&self) -> Result<Vec<StoredLease>> {
        let mut connection = self.connection.clone();
        let keys: Vec<String> = connection.keys(format!("{}*", DATA_KEY_PREFIX)).await?;

        let mut leases = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(client) = key.strip_prefix(DATA_KEY_PREFIX) else {
                continue;
            };
            let client_id = match client.parse::<ClientId>() {
                Ok(client_id) => client_id,
                Err(error) => {
                    warn!("Skipping lease key {}: {}", key, error);
                    continue;
                }
            };
            match self.get(&client_id).await {
                Ok(Some(record)) => leases.push(StoredLease { client_id, record }),
                Ok(None) => debug!("Lease key {} vanished before it was read", key),
                Err(Error::DataCorruption { key, reason }) => {
                    warn!("Skipping corrupted lease {}: {}", key, reason);
                }
                Err(error) => return Err(error),
            }
        }

        Ok(leases)
    }

    async fn save(&self, client_id: &ClientId, record: &LeaseRecord) -> Result<()> {
        let pipe = save_pipeline(client_id, encode_record(record)?, record);
        let mut connection = self.connection.clone();
        let _: () = pipe.query_async(&mut connection).await?;
        Ok(())
    }

    async fn has_live_sentinel(&self, client_id: &ClientId) -> Result<bool> {
        let mut connection = self.connection.clone();
        Ok(connection.exists(sentinel_key(client_id)).await?)
    }

    async fn subscribe_expirations(&self) -> Result<ExpirationFeed> {
        let channel = format!("__keyevent@{}__:expired", self.uri.db);
        let first = subscribe_channel(self.client.clone(), channel.clone()).await?;
        info!("Subscribed to {} on {}", channel, self.uri);

        let (sender, receiver) = mpsc::unbounded_channel();
        let client = self.client.clone();
        let source = format!("{} on {}", channel, self.uri);
        tokio::spawn(forward_expirations(
            move || subscribe_channel(client.clone(), channel.clone()),
            Some(first),
            sender,
            RESUBSCRIBE_BACKOFF,
            source,
        ));

        Ok(receiver)
    }
}
