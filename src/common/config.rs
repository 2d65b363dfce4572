//! Configuration for sharekv

use crate::common::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment prefix for overrides, e.g. `SHAREKV__LOCK_RETRY_DELAY_MS=250`
pub const ENV_PREFIX: &str = "SHAREKV";

/// Configuration shared by every participant at a location
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareConfig {
    /// File name of the rendezvous socket inside the store directory
    #[serde(default = "default_socket_name")]
    pub socket_name: String,

    /// Delay before retrying when the store is locked and no leader answered
    #[serde(default = "default_lock_retry_delay")]
    pub lock_retry_delay_ms: u64,

    /// First non-zero delay after losing a leader we were connected to
    #[serde(default = "default_contention_backoff_initial")]
    pub contention_backoff_initial_ms: u64,

    /// How long a follower waits for the leader's hello frame
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,

    /// Entries fetched per round trip by cursors
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Storage engine options
    #[serde(default)]
    pub engine: EngineConfig,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_socket_name() -> String {
    "sharekv.sock".to_string()
}
fn default_lock_retry_delay() -> u64 {
    100
}
fn default_contention_backoff_initial() -> u64 {
    5
}
fn default_handshake_timeout() -> u64 {
    1_000
}
fn default_page_size() -> usize {
    256
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ShareConfig {
    fn default() -> Self {
        Self {
            socket_name: default_socket_name(),
            lock_retry_delay_ms: default_lock_retry_delay(),
            contention_backoff_initial_ms: default_contention_backoff_initial(),
            handshake_timeout_ms: default_handshake_timeout(),
            page_size: default_page_size(),
            engine: EngineConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl ShareConfig {
    /// Load from an optional TOML file, then apply `SHAREKV__*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        let config: ShareConfig = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.socket_name.is_empty() || self.socket_name.contains('/') {
            return Err(crate::Error::InvalidConfig(format!(
                "socket_name must be a plain file name, got {:?}",
                self.socket_name
            )));
        }
        if self.page_size == 0 {
            return Err(crate::Error::InvalidConfig(
                "page_size must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn lock_retry_delay(&self) -> Duration {
        Duration::from_millis(self.lock_retry_delay_ms)
    }

    pub fn contention_backoff_initial(&self) -> Duration {
        Duration::from_millis(self.contention_backoff_initial_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

/// Storage engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Create the database if the directory holds none yet
    #[serde(default = "default_create_if_missing")]
    pub create_if_missing: bool,
}

fn default_create_if_missing() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            create_if_missing: default_create_if_missing(),
        }
    }
}
