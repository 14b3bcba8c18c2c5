use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use steelnet::{DEFAULT_PORT, NetworkConfig, UdpSettings};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub level: String,
    pub orb_count: u32,
    pub projectile_interval_ticks: u32,
    pub network: NetworkConfig,
    pub udp: UdpSettings,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            level: "arena".to_string(),
            orb_count: 8,
            projectile_interval_ticks: 90,
            network: NetworkConfig::default(),
            udp: UdpSettings::default(),
        }
    }
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Self =
            toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("validating {}", path.display()))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.network.validate()?;
        self.udp.validate()?;
        Ok(())
    }
}
