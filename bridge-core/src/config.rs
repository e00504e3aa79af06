use crate::error::ConfigError;
use serde::Deserialize;
use std::time::Duration;

/// Policy knobs for one bridge context.
///
/// Every section is optional in TOML; missing values fall back to the
/// defaults below.
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct BridgeConfig {
    #[serde(default)]
    pub keepalive: KeepaliveConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub correlator: CorrelatorConfig,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct KeepaliveConfig {
    #[serde(default = "default_ping_interval_ms")]
    pub interval_ms: u64,
    /// Grace window for a pong; must be shorter than the interval
    #[serde(default = "default_pong_timeout_ms")]
    pub pong_timeout_ms: u64,
    #[serde(default = "default_max_missed")]
    pub max_missed: u32,
}

impl KeepaliveConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_millis(self.pong_timeout_ms)
    }
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_ping_interval_ms(),
            pong_timeout_ms: default_pong_timeout_ms(),
            max_missed: default_max_missed(),
        }
    }
}

fn default_ping_interval_ms() -> u64 {
    5_000
}

fn default_pong_timeout_ms() -> u64 {
    2_000
}

fn default_max_missed() -> u32 {
    2
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct RouterConfig {
    /// Envelopes held per dead port before the oldest is dropped
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// How long a content script keeps the return path of a relayed request.
    /// Callers on the page must not wait longer than this.
    #[serde(default = "default_relay_ttl_ms")]
    pub relay_ttl_ms: u64,
}

impl RouterConfig {
    pub fn relay_ttl(&self) -> Duration {
        Duration::from_millis(self.relay_ttl_ms)
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            relay_ttl_ms: default_relay_ttl_ms(),
        }
    }
}

fn default_queue_capacity() -> usize {
    16
}

fn default_relay_ttl_ms() -> u64 {
    300_000
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct CorrelatorConfig {
    #[serde(default = "default_request_timeout_ms")]
    pub default_timeout_ms: u64,
}

impl CorrelatorConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_request_timeout_ms(),
        }
    }
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

impl BridgeConfig {
    /// Reports the first inconsistent setting, if any.
    pub fn check(&self) -> Result<(), ConfigError> {
        if self.keepalive.interval_ms == 0 {
            return Err(ConfigError::Zero("keepalive.interval_ms"));
        }
        if self.keepalive.pong_timeout_ms >= self.keepalive.interval_ms {
            return Err(ConfigError::PongTimeoutTooLong {
                pong_timeout_ms: self.keepalive.pong_timeout_ms,
                interval_ms: self.keepalive.interval_ms,
            });
        }
        if self.keepalive.max_missed == 0 {
            return Err(ConfigError::Zero("keepalive.max_missed"));
        }
        if self.router.queue_capacity == 0 {
            return Err(ConfigError::Zero("router.queue_capacity"));
        }
        if self.correlator.default_timeout_ms == 0 {
            return Err(ConfigError::Zero("correlator.default_timeout_ms"));
        }
        if self.router.relay_ttl_ms < self.correlator.default_timeout_ms {
            return Err(ConfigError::RelayTtlTooShort {
                relay_ttl_ms: self.router.relay_ttl_ms,
                default_timeout_ms: self.correlator.default_timeout_ms,
            });
        }
        Ok(())
    }
}
