use anyhow::{Context, Result};
use bridge_core::storage::WalletInfo;
use bridge_core::BridgeConfig;
use serde::Deserialize;
use std::fs;

#[derive(Debug, Deserialize)]
pub struct ConfigFile {
    pub host: HostConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
    /// Seeded into the store on first start
    #[serde(default)]
    pub wallet: Option<WalletInfo>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HostConfig {
    pub extension_origin: String,
    pub page_origin: String,
    #[serde(default = "default_store_path")]
    pub store_path: String,
    /// Seconds between stats log lines, 0 disables
    #[serde(default = "default_stats_interval_secs")]
    pub stats_interval_secs: u64,
}

fn default_store_path() -> String {
    "./data/bridge-store.json".to_string()
}

fn default_stats_interval_secs() -> u64 {
    30
}

impl ConfigFile {
    pub fn load(path: &str) -> Result<Self> {
        let content =
            fs::read_to_string(path).context(format!("Failed to read config file: {}", path))?;
        toml::from_str(&content).context("Failed to parse config file")
    }

    pub fn validate(&self) -> Result<()> {
        for (name, origin) in [
            ("host.extension_origin", &self.host.extension_origin),
            ("host.page_origin", &self.host.page_origin),
        ] {
            if !origin.contains("://") {
                anyhow::bail!("{} must be a scheme://host origin, got '{}'", name, origin);
            }
        }
        if self.host.extension_origin == self.host.page_origin {
            anyhow::bail!("Extension and page must not share an origin");
        }
        self.bridge.check().context("Invalid [bridge] config")?;
        Ok(())
    }
}
