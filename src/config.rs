use std::collections::HashMap;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::command::CommandKind;

/// Session configuration. Everything here is supplied at construction time:
/// endpoint, timeouts, backoff schedule, stream rates and the flight-mode
/// lookup table are never hardcoded in the session logic.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct LinkConfig {
    pub connection: ConnectionConfig,
    pub timing: TimingConfig,
    pub streams: StreamConfig,
    /// Per-command-kind ack timeout overrides in seconds, keyed by the
    /// lowercase kind name (e.g. `takeoff = 10`).
    pub command_timeouts_s: HashMap<String, u64>,
    pub modes: ModeTable,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    /// Our own MAVLink source ids on the link.
    pub system_id: u8,
    pub component_id: u8,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5760,
            system_id: 255,
            component_id: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// How long to wait for the first heartbeat after the socket opens.
    pub connect_timeout_s: u64,
    /// Silence window after which a Connected link is marked Degraded.
    pub heartbeat_timeout_s: u64,
    /// Default command ack timeout.
    pub command_timeout_s: u64,
    /// Monitor tick; also paces our outgoing GCS heartbeat.
    pub monitor_interval_ms: u64,
    pub backoff_initial_s: u64,
    pub backoff_max_s: u64,
    /// Abort a mission/fence readback after this long without progress.
    pub readback_timeout_s: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            connect_timeout_s: 15,
            heartbeat_timeout_s: 15,
            command_timeout_s: 5,
            monitor_interval_ms: 1000,
            backoff_initial_s: 1,
            backoff_max_s: 30,
            readback_timeout_s: 5,
        }
    }
}

impl TimingConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_s)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_s)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_s)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    pub fn backoff_initial(&self) -> Duration {
        Duration::from_secs(self.backoff_initial_s)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_secs(self.backoff_max_s)
    }

    pub fn readback_timeout(&self) -> Duration {
        Duration::from_secs(self.readback_timeout_s)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Rate requested for the fast telemetry streams (position, attitude,
    /// VFR_HUD) via MAV_CMD_SET_MESSAGE_INTERVAL.
    pub telemetry_rate_hz: f32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            telemetry_rate_hz: 4.0,
        }
    }
}

impl LinkConfig {
    /// Load from the TOML file named by `GROUNDLINK_CONFIG` (default
    /// `config/groundlink.toml`), with `GROUNDLINK__*` environment overrides
    /// (e.g. `GROUNDLINK__CONNECTION__PORT=14550`). A missing file yields the
    /// defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("GROUNDLINK_CONFIG")
            .unwrap_or_else(|_| "config/groundlink.toml".to_string());

        let settings = Config::builder()
            .add_source(File::with_name(&path).required(false))
            .add_source(
                Environment::with_prefix("GROUNDLINK")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        settings.try_deserialize()
    }

    /// Ack timeout for a command kind, honoring per-kind overrides.
    pub fn command_timeout_for(&self, kind: CommandKind) -> Duration {
        self.command_timeouts_s
            .get(kind.config_key())
            .map(|s| Duration::from_secs(*s))
            .unwrap_or_else(|| self.timing.command_timeout())
    }
}

/// Vendor-specific custom-mode table: mode name to custom_mode bit pattern.
/// Mode encodings vary by firmware, so the table is injected configuration;
/// the default is the ArduPilot Copter set.
#[derive(Debug, Clone, Deserialize)]
#[serde(transparent)]
pub struct ModeTable(HashMap<String, u32>);

impl ModeTable {
    pub fn new(table: HashMap<String, u32>) -> Self {
        Self(table)
    }

    pub fn name_for(&self, custom_mode: u32) -> Option<&str> {
        self.0
            .iter()
            .find(|(_, id)| **id == custom_mode)
            .map(|(name, _)| name.as_str())
    }

    pub fn id_for(&self, name: &str) -> Option<u32> {
        self.0.get(&name.to_uppercase()).copied()
    }
}

impl Default for ModeTable {
    fn default() -> Self {
        let table = [
            ("STABILIZE", 0),
            ("ACRO", 1),
            ("ALT_HOLD", 2),
            ("AUTO", 3),
            ("GUIDED", 4),
            ("LOITER", 5),
            ("RTL", 6),
            ("LAND", 9),
            ("POS_HOLD", 16),
            ("BRAKE", 17),
            ("THROW", 18),
            ("AVOID_ADSB", 19),
            ("GUIDED_NOGPS", 20),
            ("SMART_RTL", 21),
            ("FLOWHOLD", 22),
            ("FOLLOW", 23),
            ("ZIGZAG", 24),
            ("SYSTEMID", 25),
            ("AUTOROTATE", 26),
            ("AUTO_RTL", 27),
        ]
        .into_iter()
        .map(|(name, id)| (name.to_string(), id))
        .collect();
        Self(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_mode_table_resolves_both_ways() {
        let modes = ModeTable::default();
        assert_eq!(modes.name_for(4), Some("GUIDED"));
        assert_eq!(modes.id_for("guided"), Some(4));
        assert_eq!(modes.id_for("RTL"), Some(6));
        assert_eq!(modes.name_for(999), None);
        assert_eq!(modes.id_for("WARP"), None);
    }

    #[test]
    fn environment_override_reaches_nested_field() {
        std::env::set_var("GROUNDLINK__CONNECTION__PORT", "14550");
        let cfg = LinkConfig::load().unwrap();
        std::env::remove_var("GROUNDLINK__CONNECTION__PORT");

        assert_eq!(cfg.connection.port, 14550);
    }

    #[test]
    fn per_kind_timeout_overrides_default() {
        let mut cfg = LinkConfig::default();
        cfg.command_timeouts_s.insert("takeoff".to_string(), 12);

        assert_eq!(
            cfg.command_timeout_for(CommandKind::Takeoff),
            Duration::from_secs(12)
        );
        assert_eq!(
            cfg.command_timeout_for(CommandKind::Arm),
            Duration::from_secs(5)
        );
    }
}
