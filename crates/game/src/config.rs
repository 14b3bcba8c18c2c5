use serde::{Deserialize, Serialize};

use crate::net::DEFAULT_TICK_RATE;

/// Slowest tick rate whose interval still fits the 8-bit sim time in ms.
pub const MIN_TICK_RATE: u32 = 4;
/// Fastest tick rate `ClientInfo` can carry.
pub const MAX_TICK_RATE: u32 = 255;
const MIN_CACHE_SIZE: usize = 4;
const MAX_CACHE_SIZE: usize = 1 << 16;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("{field} = {value} must be a power of two in 4..=65536")]
    CacheSize { field: &'static str, value: usize },
    #[error("{field} = {value} is outside {min}..={max}")]
    OutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
}

fn check_range(field: &'static str, value: f64, min: f64, max: f64) -> Result<(), ConfigError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            field,
            value,
            min,
            max,
        })
    }
}

fn check_cache_size(field: &'static str, value: usize) -> Result<(), ConfigError> {
    if value.is_power_of_two() && (MIN_CACHE_SIZE..=MAX_CACHE_SIZE).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::CacheSize { field, value })
    }
}

/// Knobs shared by client and server network code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub server_tick_rate: u32,
    /// Encode snapshots against three baselines when the history allows it.
    pub network_prediction: bool,
    /// Log the connection statistics table every N frames, 0 disables.
    pub stats_interval: u32,
    pub snapshot_delta_cache_size: usize,
    pub client_ack_cache_size: usize,
    pub connect_timeout_secs: f64,
    /// Bytes per second the client asks the server to stay under.
    pub client_update_rate: u32,
    /// Ticks between snapshots the client asks for.
    pub client_update_interval: u32,
    pub commands_per_package: usize,
    pub max_tick_backlog_secs: f64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            server_tick_rate: DEFAULT_TICK_RATE,
            network_prediction: true,
            stats_interval: 0,
            snapshot_delta_cache_size: 128,
            client_ack_cache_size: 1024,
            connect_timeout_secs: 10.0,
            client_update_rate: 30_000,
            client_update_interval: 1,
            commands_per_package: 3,
            max_tick_backlog_secs: 0.25,
        }
    }
}

impl NetworkConfig {
    /// Rejects values the network code would otherwise assert on or clamp.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range(
            "server_tick_rate",
            self.server_tick_rate as f64,
            MIN_TICK_RATE as f64,
            MAX_TICK_RATE as f64,
        )?;
        check_cache_size("snapshot_delta_cache_size", self.snapshot_delta_cache_size)?;
        check_cache_size("client_ack_cache_size", self.client_ack_cache_size)?;
        check_range("connect_timeout_secs", self.connect_timeout_secs, 0.1, 3600.0)?;
        check_range(
            "client_update_interval",
            self.client_update_interval as f64,
            1.0,
            255.0,
        )?;
        check_range("commands_per_package", self.commands_per_package as f64, 1.0, 64.0)?;
        check_range("max_tick_backlog_secs", self.max_tick_backlog_secs, 0.0, 10.0)
    }
}

/// Thresholds for the client timeline corrections, in ticks unless noted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconciliationConfig {
    pub preferred_buffered_commands: u32,
    /// Predicted time further behind the preferred tick than this snaps forward.
    pub hard_catchup_ticks: i64,
    /// Predicted time further ahead of the preferred tick than this snaps back.
    pub hard_slowdown_ticks: i64,
    /// Render time further behind the server than this snaps forward.
    pub render_catchup_ticks: i64,
    /// Distance behind the server render time snaps to.
    pub render_catchup_target_ticks: i64,
    /// Fraction of the frame added to render time while it trails the server.
    pub render_nudge: f64,
    /// Frame time scale adjustment while commands are under or over buffered.
    pub drift_correction: f64,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            preferred_buffered_commands: 2,
            hard_catchup_ticks: 3,
            hard_slowdown_ticks: 6,
            render_catchup_ticks: 10,
            render_catchup_target_ticks: 8,
            render_nudge: 0.01,
            drift_correction: 0.01,
        }
    }
}

impl ReconciliationConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range(
            "preferred_buffered_commands",
            self.preferred_buffered_commands as f64,
            0.0,
            64.0,
        )?;
        check_range("hard_catchup_ticks", self.hard_catchup_ticks as f64, 1.0, 1000.0)?;
        check_range("hard_slowdown_ticks", self.hard_slowdown_ticks as f64, 1.0, 1000.0)?;
        check_range("render_catchup_ticks", self.render_catchup_ticks as f64, 1.0, 1000.0)?;
        check_range(
            "render_catchup_target_ticks",
            self.render_catchup_target_ticks as f64,
            0.0,
            self.render_catchup_ticks as f64,
        )?;
        check_range("render_nudge", self.render_nudge, 0.0, 1.0)?;
        check_range("drift_correction", self.drift_correction, 0.0, 1.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UdpSettings {
    pub connect_retry_ms: u64,
    pub max_connect_attempts: u32,
    pub peer_timeout_ms: u64,
}

impl Default for UdpSettings {
    fn default() -> Self {
        Self {
            connect_retry_ms: 500,
            max_connect_attempts: 20,
            peer_timeout_ms: 10_000,
        }
    }
}

impl UdpSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range("connect_retry_ms", self.connect_retry_ms as f64, 1.0, 60_000.0)?;
        check_range(
            "max_connect_attempts",
            self.max_connect_attempts as f64,
            1.0,
            u32::MAX as f64,
        )?;
        check_range("peer_timeout_ms", self.peer_timeout_ms as f64, 1.0, 3_600_000.0)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert_eq!(NetworkConfig::default().validate(), Ok(()));
        assert_eq!(ReconciliationConfig::default().validate(), Ok(()));
        assert_eq!(UdpSettings::default().validate(), Ok(()));
    }

    #[rstest]
    #[case(0)]
    #[case(3)]
    #[case(256)]
    #[case(1000)]
    fn test_tick_rate_out_of_range(#[case] tick_rate: u32) {
        let config = NetworkConfig {
            server_tick_rate: tick_rate,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::OutOfRange {
                field: "server_tick_rate",
                ..
            })
        ));
    }

    #[rstest]
    #[case(0)]
    #[case(2)]
    #[case(100)]
    #[case(1 << 17)]
    fn test_cache_size_must_be_power_of_two(#[case] size: usize) {
        let config = NetworkConfig {
            snapshot_delta_cache_size: size,
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::CacheSize {
                field: "snapshot_delta_cache_size",
                value: size,
            })
        );

        let config = NetworkConfig {
            client_ack_cache_size: size,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_nan_threshold_is_rejected() {
        let config = ReconciliationConfig {
            render_nudge: f64::NAN,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ReconciliationConfig {
            render_catchup_target_ticks: 12,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_timeouts_are_rejected() {
        let config = NetworkConfig {
            connect_timeout_secs: 0.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let settings = UdpSettings {
            peer_timeout_ms: 0,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }
}
