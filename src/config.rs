use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::store::StoreUri;

fn default_notify_keyspace_events() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub range_start: Ipv4Addr,
    pub range_end: Ipv4Addr,
    pub lease_duration_seconds: u32,
    pub store_uri: String,
    /// Ask the store to publish key-expiration events at startup.
    #[serde(default = "default_notify_keyspace_events")]
    pub notify_keyspace_events: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            range_start: Ipv4Addr::new(192, 168, 1, 100),
            range_end: Ipv4Addr::new(192, 168, 1, 200),
            lease_duration_seconds: 3600,
            store_uri: "redis://127.0.0.1:6379/0".to_string(),
            notify_keyspace_events: true,
        }
    }
}

impl Config {
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path)?;
            Ok(config)
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if u32::from(self.range_start) >= u32::from(self.range_end) {
            return Err(Error::InvalidConfig(
                "range_start must be lower than range_end".to_string(),
            ));
        }

        if self.lease_duration_seconds == 0 {
            return Err(Error::InvalidConfig(
                "lease_duration_seconds must be greater than 0".to_string(),
            ));
        }

        if self.store_uri.is_empty() {
            return Err(Error::InvalidConfig("store_uri cannot be empty".to_string()));
        }
        StoreUri::parse(&self.store_uri)?;

        Ok(())
    }

    pub fn store_uri(&self) -> Result<StoreUri> {
        StoreUri::parse(&self.store_uri)
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(u64::from(self.lease_duration_seconds))
    }

    pub fn ip_in_range(&self, ip: Ipv4Addr) -> bool {
        let addr = u32::from(ip);
        addr >= u32::from(self.range_start) && addr <= u32::from(self.range_end)
    }

    pub fn pool_size(&self) -> u32 {
        u32::from(self.range_end) - u32::from(self.range_start) + 1
    }
}
