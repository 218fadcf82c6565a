use std::collections::BTreeMap;
use std::fmt;
use std::sync::RwLock;
use std::time::Instant;

use anyhow::{anyhow, Result};
use serde::Serialize;

use crate::command::PendingCommand;
use crate::mission::MissionReadback;

/// Session connection state. Owned by the link manager's state machine; the
/// heartbeat processor may only apply the "refresh" transitions
/// (AwaitingFirstHeartbeat/Degraded back to Connected).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    AwaitingFirstHeartbeat,
    Connected,
    Degraded,
    Reconnecting,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::AwaitingFirstHeartbeat => "awaiting first heartbeat",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Degraded => "degraded",
            ConnectionStatus::Reconnecting => "reconnecting",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct Position {
    pub lat: f64,
    pub lon: f64,
    pub alt_relative: f64,
    pub alt_absolute: f64,
    /// Degrees, 0 = north. Kept at the last known value when the vehicle
    /// reports heading unknown.
    pub heading: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct Attitude {
    pub roll: f32,
    pub pitch: f32,
    pub yaw: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct Battery {
    pub voltage_v: f32,
    pub current_a: f32,
    pub remaining_pct: i8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum GpsFix {
    NoGps,
    #[default]
    NoFix,
    Fix2D,
    Fix3D,
    Dgps,
    RtkFloat,
    RtkFixed,
    Static,
    Ppp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Gps {
    pub fix_type: GpsFix,
    pub satellites: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum EkfStatus {
    #[default]
    Ok,
    Warn,
    Error,
}

/// VFR_HUD-derived fields (speeds, throttle, climb rate).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct Hud {
    pub airspeed: f32,
    pub groundspeed: f32,
    pub throttle: u16,
    pub climb: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HomePosition {
    pub lat: f64,
    pub lon: f64,
    pub alt: f64,
}

/// Best-known vehicle status for one session. A single instance exists per
/// session and every mutation happens under the `Vehicle` lock; readers get
/// cloned snapshots.
#[derive(Debug, Clone, Serialize)]
pub struct VehicleState {
    pub connection_status: ConnectionStatus,
    /// Latched from the first heartbeat, immutable until the session restarts.
    pub system_id: Option<u8>,
    pub component_id: Option<u8>,
    pub armed: bool,
    pub flight_mode: String,
    pub position: Position,
    pub attitude: Attitude,
    pub battery: Battery,
    pub gps: Gps,
    pub ekf_status: EkfStatus,
    pub hud: Hud,
    pub home: Option<HomePosition>,
    pub mission_current: u16,
    /// Sole basis for link-health decisions, independent of socket status.
    #[serde(skip)]
    pub last_heartbeat_at: Option<Instant>,
    pub pending_commands: BTreeMap<u64, PendingCommand>,
    pub mission_readback: Option<MissionReadback>,
}

impl Default for VehicleState {
    fn default() -> Self {
        Self {
            connection_status: ConnectionStatus::Disconnected,
            system_id: None,
            component_id: None,
            armed: false,
            flight_mode: "UNKNOWN".to_string(),
            position: Position::default(),
            attitude: Attitude::default(),
            battery: Battery::default(),
            gps: Gps::default(),
            ekf_status: EkfStatus::default(),
            hud: Hud::default(),
            home: None,
            mission_current: 0,
            last_heartbeat_at: None,
            pending_commands: BTreeMap::new(),
            mission_readback: None,
        }
    }
}

/// Lock owner for the shared vehicle state. Writers go through `with_state`,
/// readers take `snapshot` copies; nothing else touches the record.
#[derive(Debug, Default)]
pub struct Vehicle {
    state: RwLock<VehicleState>,
}

impl Vehicle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Result<VehicleState> {
        let state = self.state.read().map_err(|e| anyhow!("lock error: {e}"))?;
        Ok(state.clone())
    }

    pub fn with_state<R>(&self, f: impl FnOnce(&mut VehicleState) -> R) -> Result<R> {
        let mut state = self.state.write().map_err(|e| anyhow!("lock error: {e}"))?;
        Ok(f(&mut state))
    }

    pub fn status(&self) -> Result<ConnectionStatus> {
        let state = self.state.read().map_err(|e| anyhow!("lock error: {e}"))?;
        Ok(state.connection_status)
    }

    /// Move the state machine; returns true if the status actually changed.
    pub fn set_status(&self, status: ConnectionStatus) -> Result<bool> {
        self.with_state(|s| {
            if s.connection_status == status {
                false
            } else {
                s.connection_status = status;
                true
            }
        })
    }

    /// Reset to initial values for a fresh session.
    pub fn reset(&self) -> Result<()> {
        self.with_state(|s| *s = VehicleState::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_is_detached_copy() {
        let vehicle = Vehicle::new();
        vehicle.with_state(|s| s.armed = true).unwrap();

        let snap = vehicle.snapshot().unwrap();
        vehicle.with_state(|s| s.armed = false).unwrap();

        assert!(snap.armed);
        assert!(!vehicle.snapshot().unwrap().armed);
    }

    #[test]
    fn set_status_reports_change() {
        let vehicle = Vehicle::new();
        assert!(vehicle.set_status(ConnectionStatus::Connecting).unwrap());
        assert!(!vehicle.set_status(ConnectionStatus::Connecting).unwrap());
        assert_eq!(vehicle.status().unwrap(), ConnectionStatus::Connecting);
    }

    #[test]
    fn reset_restores_defaults() {
        let vehicle = Vehicle::new();
        vehicle
            .with_state(|s| {
                s.system_id = Some(1);
                s.flight_mode = "GUIDED".to_string();
                s.connection_status = ConnectionStatus::Connected;
            })
            .unwrap();

        vehicle.reset().unwrap();
        let snap = vehicle.snapshot().unwrap();
        assert_eq!(snap.system_id, None);
        assert_eq!(snap.flight_mode, "UNKNOWN");
        assert_eq!(snap.connection_status, ConnectionStatus::Disconnected);
    }
}
