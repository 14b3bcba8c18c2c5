use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use steelnet::{DEFAULT_PORT, NetworkConfig, ReconciliationConfig, UdpSettings};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub server: String,
    /// Frames between position reports, 0 disables them.
    pub report_interval: u32,
    pub network: NetworkConfig,
    pub reconciliation: ReconciliationConfig,
    pub udp: UdpSettings,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: format!("127.0.0.1:{DEFAULT_PORT}"),
            report_interval: 120,
            network: NetworkConfig::default(),
            reconciliation: ReconciliationConfig::default(),
            udp: UdpSettings::default(),
        }
    }
}

impl ClientConfig {
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
        self.reconciliation.validate()?;
        self.udp.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconciliation_section_overrides() {
        let config: ClientConfig = toml::from_str(
            r#"
            server = "10.0.0.2:4000"

            [reconciliation]
            preferred_buffered_commands = 4
            "#,
        )
        .unwrap();
        assert_eq!(config.server, "10.0.0.2:4000");
        assert_eq!(config.reconciliation.preferred_buffered_commands, 4);
        assert_eq!(config.reconciliation.hard_catchup_ticks, 3);
    }

    #[test]
    fn test_inverted_render_catchup_is_rejected() {
        let config: ClientConfig = toml::from_str(
            r#"
            [reconciliation]
            render_catchup_ticks = 4
            render_catchup_target_ticks = 8
            "#,
        )
        .unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("render_catchup_target_ticks"));
    }
}
