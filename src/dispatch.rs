use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use mavlink::ardupilotmega::{
    MavMessage, MavModeFlag, MavSysStatusSensor, ATTITUDE_DATA, GLOBAL_POSITION_INT_DATA,
    GPS_RAW_INT_DATA, HEARTBEAT_DATA, HOME_POSITION_DATA, SYS_STATUS_DATA, VFR_HUD_DATA,
};
use mavlink::MavHeader;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::command;
use crate::config::ModeTable;
use crate::events::LinkEvent;
use crate::mission;
use crate::vehicle::{
    Attitude, Battery, ConnectionStatus, EkfStatus, Gps, GpsFix, HomePosition, Hud, Position,
    Vehicle, VehicleState,
};

/// What the session loop should do after a message was dispatched: transmit
/// any replies the handlers produced (handlers never touch the socket).
#[derive(Debug, Default)]
pub struct DispatchOutcome {
    pub changed: bool,
    pub replies: Vec<MavMessage>,
}

/// Routes decoded messages to their processors and broadcasts the resulting
/// events. All state mutation funnels through the vehicle lock; unknown
/// message kinds are a no-op.
pub struct Dispatcher {
    vehicle: Arc<Vehicle>,
    modes: ModeTable,
    events: broadcast::Sender<LinkEvent>,
}

impl Dispatcher {
    pub fn new(
        vehicle: Arc<Vehicle>,
        modes: ModeTable,
        events: broadcast::Sender<LinkEvent>,
    ) -> Self {
        Self {
            vehicle,
            modes,
            events,
        }
    }

    pub fn dispatch(&self, header: &MavHeader, msg: &MavMessage) -> Result<DispatchOutcome> {
        // Single tracked vehicle: once ids are latched, traffic from anything
        // else on the link is discarded. Before the latch only heartbeats are
        // meaningful.
        let latched = self.vehicle.with_state(|s| s.system_id)?;
        match latched {
            Some(sys) if sys != header.system_id => {
                debug!(
                    from = header.system_id,
                    tracked = sys,
                    "ignoring message from other system"
                );
                return Ok(DispatchOutcome::default());
            }
            None if !matches!(msg, MavMessage::HEARTBEAT(_)) => {
                debug!(from = header.system_id, "ignoring message before first heartbeat");
                return Ok(DispatchOutcome::default());
            }
            _ => {}
        }

        let mut outcome = DispatchOutcome::default();
        match msg {
            MavMessage::HEARTBEAT(data) => {
                let update = self.vehicle.with_state(|s| {
                    heartbeat(header, data, s, &self.modes, Instant::now())
                })?;
                if let Some(status) = update.transition {
                    info!(%status, system_id = header.system_id, "link state changed by heartbeat");
                    self.emit(LinkEvent::Connection { status });
                }
                outcome.changed = update.changed;
                if outcome.changed {
                    self.emit_state("heartbeat")?;
                }
            }
            MavMessage::GLOBAL_POSITION_INT(data) => {
                outcome.changed = self.apply("position", |s| position(data, s))?;
            }
            MavMessage::ATTITUDE(data) => {
                outcome.changed = self.apply("attitude", |s| attitude(data, s))?;
            }
            MavMessage::SYS_STATUS(data) => {
                outcome.changed = self.apply("sys_status", |s| sys_status(data, s))?;
            }
            MavMessage::GPS_RAW_INT(data) => {
                outcome.changed = self.apply("gps", |s| gps_raw(data, s))?;
            }
            MavMessage::VFR_HUD(data) => {
                outcome.changed = self.apply("vfr_hud", |s| vfr_hud(data, s))?;
            }
            MavMessage::HOME_POSITION(data) => {
                outcome.changed = self.apply("home_position", |s| home_position(data, s))?;
            }
            MavMessage::MISSION_CURRENT(data) => {
                outcome.changed = self.apply("mission_current", |s| {
                    let changed = s.mission_current != data.seq;
                    s.mission_current = data.seq;
                    changed
                })?;
            }
            MavMessage::STATUSTEXT(data) => {
                // Informational only; forwarded, never merged into state.
                let text = String::from_utf8_lossy(&data.text)
                    .trim_end_matches('\0')
                    .to_string();
                debug!(severity = ?data.severity, "statustext: {text}");
                self.emit(LinkEvent::StatusText {
                    severity: data.severity.into(),
                    text,
                });
            }
            MavMessage::COMMAND_ACK(data) => {
                let update = self
                    .vehicle
                    .with_state(|s| command::resolve_ack(s, data.command, data.result))?;
                match update {
                    Some(update) => command::publish_update(&self.events, update),
                    None => debug!(command = ?data.command, "ack with no pending command"),
                }
            }
            MavMessage::MISSION_COUNT(data) => {
                let step = self
                    .vehicle
                    .with_state(|s| mission::on_count(s, data, Instant::now()))?;
                self.finish_mission_step(step, &mut outcome);
            }
            MavMessage::MISSION_ITEM(data) => {
                let step = self
                    .vehicle
                    .with_state(|s| mission::on_item(s, data, Instant::now()))?;
                self.finish_mission_step(step, &mut outcome);
            }
            _ => {}
        }

        Ok(outcome)
    }

    fn apply(
        &self,
        source: &'static str,
        f: impl FnOnce(&mut VehicleState) -> bool,
    ) -> Result<bool> {
        let changed = self.vehicle.with_state(f)?;
        if changed {
            self.emit_state(source)?;
        }
        Ok(changed)
    }

    fn finish_mission_step(&self, step: mission::MissionStep, outcome: &mut DispatchOutcome) {
        if let Some(reply) = step.reply {
            outcome.replies.push(reply);
        }
        if let Some((kind, points)) = step.complete {
            info!(?kind, items = points.len(), "readback complete");
            self.emit(LinkEvent::Mission { kind, points });
        }
    }

    fn emit_state(&self, source: &'static str) -> Result<()> {
        let state = self.vehicle.snapshot()?;
        self.emit(LinkEvent::State { state, source });
        Ok(())
    }

    fn emit(&self, event: LinkEvent) {
        let _ = self.events.send(event);
    }
}

struct HeartbeatUpdate {
    changed: bool,
    transition: Option<ConnectionStatus>,
}

/// Fold a heartbeat into the state: refresh the liveness timestamp, latch the
/// vehicle ids on first contact, decode the armed bit and the vendor custom
/// mode, and apply the refresh transitions back to Connected.
fn heartbeat(
    header: &MavHeader,
    data: &HEARTBEAT_DATA,
    state: &mut VehicleState,
    modes: &ModeTable,
    now: Instant,
) -> HeartbeatUpdate {
    if state.system_id.is_none() {
        state.system_id = Some(header.system_id);
        state.component_id = Some(header.component_id);
    }

    let was_armed = state.armed;
    let prev_mode = std::mem::take(&mut state.flight_mode);

    state.armed = data
        .base_mode
        .contains(MavModeFlag::MAV_MODE_FLAG_SAFETY_ARMED);
    state.flight_mode = modes
        .name_for(data.custom_mode)
        .map(str::to_string)
        .unwrap_or_else(|| format!("CUSTOM_MODE({})", data.custom_mode));
    state.last_heartbeat_at = Some(now);

    let transition = match state.connection_status {
        ConnectionStatus::AwaitingFirstHeartbeat | ConnectionStatus::Degraded => {
            state.connection_status = ConnectionStatus::Connected;
            Some(ConnectionStatus::Connected)
        }
        _ => None,
    };

    HeartbeatUpdate {
        changed: state.armed != was_armed
            || state.flight_mode != prev_mode
            || transition.is_some(),
        transition,
    }
}

/// GLOBAL_POSITION_INT: 1e7-scaled degrees, millimeter altitudes,
/// centidegree heading (UINT16_MAX when unknown, keeping the last value).
fn position(data: &GLOBAL_POSITION_INT_DATA, state: &mut VehicleState) -> bool {
    let next = Position {
        lat: data.lat as f64 / 1e7,
        lon: data.lon as f64 / 1e7,
        alt_relative: data.relative_alt as f64 / 1000.0,
        alt_absolute: data.alt as f64 / 1000.0,
        heading: if data.hdg == u16::MAX {
            state.position.heading
        } else {
            data.hdg as f64 / 100.0
        },
    };
    if next == state.position {
        return false;
    }
    state.position = next;
    true
}

fn attitude(data: &ATTITUDE_DATA, state: &mut VehicleState) -> bool {
    let next = Attitude {
        roll: data.roll,
        pitch: data.pitch,
        yaw: data.yaw,
    };
    if next == state.attitude {
        return false;
    }
    state.attitude = next;
    true
}

/// SYS_STATUS: battery in mV / 10 mA / percent (negative values mean
/// unknown and keep the last reading), plus an EKF health summary derived
/// from the sensor flags.
fn sys_status(data: &SYS_STATUS_DATA, state: &mut VehicleState) -> bool {
    let next = Battery {
        voltage_v: data.voltage_battery as f32 / 1000.0,
        current_a: if data.current_battery >= 0 {
            data.current_battery as f32 / 100.0
        } else {
            state.battery.current_a
        },
        remaining_pct: if data.battery_remaining >= 0 {
            data.battery_remaining
        } else {
            state.battery.remaining_pct
        },
    };
    let ekf = ekf_from_sensor_health(
        data.onboard_control_sensors_enabled,
        data.onboard_control_sensors_health,
    );

    let changed = next != state.battery || ekf != state.ekf_status;
    state.battery = next;
    state.ekf_status = ekf;
    changed
}

fn ekf_from_sensor_health(
    enabled: MavSysStatusSensor,
    health: MavSysStatusSensor,
) -> EkfStatus {
    let unhealthy = enabled.bits() & !health.bits();
    if unhealthy == 0 {
        return EkfStatus::Ok;
    }
    let critical = MavSysStatusSensor::MAV_SYS_STATUS_AHRS.bits()
        | MavSysStatusSensor::MAV_SYS_STATUS_SENSOR_3D_GYRO.bits()
        | MavSysStatusSensor::MAV_SYS_STATUS_SENSOR_3D_ACCEL.bits()
        | MavSysStatusSensor::MAV_SYS_STATUS_SENSOR_GPS.bits();
    if unhealthy & critical != 0 {
        EkfStatus::Error
    } else {
        EkfStatus::Warn
    }
}

fn gps_raw(data: &GPS_RAW_INT_DATA, state: &mut VehicleState) -> bool {
    use mavlink::ardupilotmega::GpsFixType::*;
    let next = Gps {
        fix_type: match data.fix_type {
            GPS_FIX_TYPE_NO_GPS => GpsFix::NoGps,
            GPS_FIX_TYPE_NO_FIX => GpsFix::NoFix,
            GPS_FIX_TYPE_2D_FIX => GpsFix::Fix2D,
            GPS_FIX_TYPE_3D_FIX => GpsFix::Fix3D,
            GPS_FIX_TYPE_DGPS => GpsFix::Dgps,
            GPS_FIX_TYPE_RTK_FLOAT => GpsFix::RtkFloat,
            GPS_FIX_TYPE_RTK_FIXED => GpsFix::RtkFixed,
            GPS_FIX_TYPE_STATIC => GpsFix::Static,
            GPS_FIX_TYPE_PPP => GpsFix::Ppp,
        },
        satellites: data.satellites_visible,
    };
    if next == state.gps {
        return false;
    }
    state.gps = next;
    true
}

fn vfr_hud(data: &VFR_HUD_DATA, state: &mut VehicleState) -> bool {
    let next = Hud {
        airspeed: data.airspeed,
        groundspeed: data.groundspeed,
        throttle: data.throttle,
        climb: data.climb,
    };
    if next == state.hud {
        return false;
    }
    state.hud = next;
    true
}

fn home_position(data: &HOME_POSITION_DATA, state: &mut VehicleState) -> bool {
    let next = HomePosition {
        lat: data.latitude as f64 / 1e7,
        lon: data.longitude as f64 / 1e7,
        alt: data.altitude as f64 / 1000.0,
    };
    if state.home == Some(next) {
        return false;
    }
    state.home = Some(next);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use mavlink::ardupilotmega::{
        MavAutopilot, MavResult, MavState, MavType, COMMAND_ACK_DATA,
    };

    fn test_dispatcher() -> (Dispatcher, Arc<Vehicle>, broadcast::Receiver<LinkEvent>) {
        let vehicle = Arc::new(Vehicle::new());
        let (tx, rx) = broadcast::channel(64);
        let dispatcher = Dispatcher::new(vehicle.clone(), ModeTable::default(), tx);
        (dispatcher, vehicle, rx)
    }

    fn header(system_id: u8) -> MavHeader {
        MavHeader {
            system_id,
            component_id: 1,
            sequence: 0,
        }
    }

    fn heartbeat_msg(custom_mode: u32, armed: bool) -> MavMessage {
        let mut base_mode = MavModeFlag::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED;
        if armed {
            base_mode |= MavModeFlag::MAV_MODE_FLAG_SAFETY_ARMED;
        }
        MavMessage::HEARTBEAT(HEARTBEAT_DATA {
            custom_mode,
            mavtype: MavType::MAV_TYPE_QUADROTOR,
            autopilot: MavAutopilot::MAV_AUTOPILOT_ARDUPILOTMEGA,
            base_mode,
            system_status: MavState::MAV_STATE_ACTIVE,
            mavlink_version: 3,
        })
    }

    fn position_msg(relative_alt_mm: i32) -> MavMessage {
        MavMessage::GLOBAL_POSITION_INT(GLOBAL_POSITION_INT_DATA {
            lat: 446_500_000,
            lon: -635_700_000,
            alt: 45_000,
            relative_alt: relative_alt_mm,
            hdg: 9_000,
            ..Default::default()
        })
    }

    #[test]
    fn first_heartbeat_latches_ids_and_connects() {
        let (dispatcher, vehicle, _rx) = test_dispatcher();
        vehicle
            .set_status(ConnectionStatus::AwaitingFirstHeartbeat)
            .unwrap();

        let outcome = dispatcher
            .dispatch(&header(1), &heartbeat_msg(4, false))
            .unwrap();
        assert!(outcome.changed);

        let snap = vehicle.snapshot().unwrap();
        assert_eq!(snap.connection_status, ConnectionStatus::Connected);
        assert_eq!(snap.system_id, Some(1));
        assert_eq!(snap.component_id, Some(1));
        assert_eq!(snap.flight_mode, "GUIDED");
        assert!(snap.last_heartbeat_at.is_some());
    }

    #[test]
    fn heartbeat_recovers_degraded_link() {
        let (dispatcher, vehicle, _rx) = test_dispatcher();
        vehicle
            .with_state(|s| {
                s.system_id = Some(1);
                s.component_id = Some(1);
                s.connection_status = ConnectionStatus::Degraded;
            })
            .unwrap();

        dispatcher
            .dispatch(&header(1), &heartbeat_msg(0, false))
            .unwrap();
        assert_eq!(
            vehicle.status().unwrap(),
            ConnectionStatus::Connected
        );
    }

    #[test]
    fn repeated_heartbeat_reports_no_change() {
        let (dispatcher, vehicle, _rx) = test_dispatcher();
        vehicle
            .set_status(ConnectionStatus::AwaitingFirstHeartbeat)
            .unwrap();

        let first = dispatcher
            .dispatch(&header(1), &heartbeat_msg(0, false))
            .unwrap();
        assert!(first.changed);
        let second = dispatcher
            .dispatch(&header(1), &heartbeat_msg(0, false))
            .unwrap();
        assert!(!second.changed);
    }

    #[test]
    fn arming_and_mode_changes_are_observable() {
        let (dispatcher, vehicle, _rx) = test_dispatcher();
        vehicle
            .set_status(ConnectionStatus::AwaitingFirstHeartbeat)
            .unwrap();
        dispatcher
            .dispatch(&header(1), &heartbeat_msg(0, false))
            .unwrap();

        let outcome = dispatcher
            .dispatch(&header(1), &heartbeat_msg(0, true))
            .unwrap();
        assert!(outcome.changed);
        assert!(vehicle.snapshot().unwrap().armed);

        let outcome = dispatcher
            .dispatch(&header(1), &heartbeat_msg(6, true))
            .unwrap();
        assert!(outcome.changed);
        assert_eq!(vehicle.snapshot().unwrap().flight_mode, "RTL");
    }

    #[test]
    fn unknown_custom_mode_gets_fallback_name() {
        let (dispatcher, vehicle, _rx) = test_dispatcher();
        vehicle
            .set_status(ConnectionStatus::AwaitingFirstHeartbeat)
            .unwrap();
        dispatcher
            .dispatch(&header(1), &heartbeat_msg(999, false))
            .unwrap();
        assert_eq!(
            vehicle.snapshot().unwrap().flight_mode,
            "CUSTOM_MODE(999)"
        );
    }

    #[test]
    fn messages_from_other_systems_are_filtered() {
        let (dispatcher, vehicle, _rx) = test_dispatcher();
        vehicle
            .set_status(ConnectionStatus::AwaitingFirstHeartbeat)
            .unwrap();
        dispatcher
            .dispatch(&header(1), &heartbeat_msg(0, false))
            .unwrap();

        // A different vehicle arming on the same link must not leak in.
        let outcome = dispatcher
            .dispatch(&header(2), &heartbeat_msg(0, true))
            .unwrap();
        assert!(!outcome.changed);
        assert!(!vehicle.snapshot().unwrap().armed);
    }

    #[test]
    fn telemetry_before_first_heartbeat_is_dropped() {
        let (dispatcher, vehicle, _rx) = test_dispatcher();
        vehicle
            .set_status(ConnectionStatus::AwaitingFirstHeartbeat)
            .unwrap();

        let outcome = dispatcher.dispatch(&header(1), &position_msg(12_340)).unwrap();
        assert!(!outcome.changed);
        assert_eq!(vehicle.snapshot().unwrap().position.lat, 0.0);
    }

    #[test]
    fn position_change_detection_is_idempotent() {
        let (dispatcher, vehicle, _rx) = test_dispatcher();
        vehicle
            .set_status(ConnectionStatus::AwaitingFirstHeartbeat)
            .unwrap();
        dispatcher
            .dispatch(&header(1), &heartbeat_msg(0, false))
            .unwrap();

        let first = dispatcher.dispatch(&header(1), &position_msg(12_340)).unwrap();
        assert!(first.changed);
        let snap = vehicle.snapshot().unwrap();
        assert_eq!(snap.position.alt_relative, 12.34);
        assert_eq!(snap.position.heading, 90.0);

        let second = dispatcher.dispatch(&header(1), &position_msg(12_340)).unwrap();
        assert!(!second.changed);
    }

    #[test]
    fn unknown_heading_keeps_last_value() {
        let mut state = VehicleState::default();
        position(
            &GLOBAL_POSITION_INT_DATA {
                hdg: 9_000,
                ..Default::default()
            },
            &mut state,
        );
        let changed = position(
            &GLOBAL_POSITION_INT_DATA {
                lat: 1,
                hdg: u16::MAX,
                ..Default::default()
            },
            &mut state,
        );
        assert!(changed);
        assert_eq!(state.position.heading, 90.0);
    }

    #[test]
    fn sys_status_updates_battery_and_ekf() {
        let mut state = VehicleState::default();
        let enabled = MavSysStatusSensor::MAV_SYS_STATUS_AHRS
            | MavSysStatusSensor::MAV_SYS_STATUS_SENSOR_GPS;
        let changed = sys_status(
            &SYS_STATUS_DATA {
                voltage_battery: 12_600,
                current_battery: 1_500,
                battery_remaining: 88,
                onboard_control_sensors_enabled: enabled,
                onboard_control_sensors_health: enabled,
                ..Default::default()
            },
            &mut state,
        );
        assert!(changed);
        assert_eq!(state.battery.voltage_v, 12.6);
        assert_eq!(state.battery.current_a, 15.0);
        assert_eq!(state.battery.remaining_pct, 88);
        assert_eq!(state.ekf_status, EkfStatus::Ok);

        // GPS goes unhealthy: critical sensor, EKF reports Error.
        let changed = sys_status(
            &SYS_STATUS_DATA {
                voltage_battery: 12_600,
                current_battery: 1_500,
                battery_remaining: 88,
                onboard_control_sensors_enabled: enabled,
                onboard_control_sensors_health: MavSysStatusSensor::MAV_SYS_STATUS_AHRS,
                ..Default::default()
            },
            &mut state,
        );
        assert!(changed);
        assert_eq!(state.ekf_status, EkfStatus::Error);
    }

    #[test]
    fn negative_battery_readings_keep_last_values() {
        let mut state = VehicleState::default();
        state.battery = Battery {
            voltage_v: 12.0,
            current_a: 3.0,
            remaining_pct: 50,
        };
        sys_status(
            &SYS_STATUS_DATA {
                voltage_battery: 12_000,
                current_battery: -1,
                battery_remaining: -1,
                ..Default::default()
            },
            &mut state,
        );
        assert_eq!(state.battery.current_a, 3.0);
        assert_eq!(state.battery.remaining_pct, 50);
    }

    #[test]
    fn gps_raw_maps_fix_type() {
        let mut state = VehicleState::default();
        let changed = gps_raw(
            &GPS_RAW_INT_DATA {
                fix_type: mavlink::ardupilotmega::GpsFixType::GPS_FIX_TYPE_3D_FIX,
                satellites_visible: 11,
                ..Default::default()
            },
            &mut state,
        );
        assert!(changed);
        assert_eq!(state.gps.fix_type, GpsFix::Fix3D);
        assert_eq!(state.gps.satellites, 11);
    }

    #[test]
    fn statustext_is_forwarded_not_stored() {
        let (dispatcher, vehicle, mut rx) = test_dispatcher();
        vehicle
            .with_state(|s| {
                s.system_id = Some(1);
                s.connection_status = ConnectionStatus::Connected;
            })
            .unwrap();

        let mut text = [0u8; 50];
        text[..11].copy_from_slice(b"EKF2 ready!");
        let msg = MavMessage::STATUSTEXT(mavlink::ardupilotmega::STATUSTEXT_DATA {
            severity: mavlink::ardupilotmega::MavSeverity::MAV_SEVERITY_INFO,
            text,
            ..Default::default()
        });
        let outcome = dispatcher.dispatch(&header(1), &msg).unwrap();
        assert!(!outcome.changed);

        match rx.try_recv().unwrap() {
            LinkEvent::StatusText { text, .. } => assert_eq!(text, "EKF2 ready!"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn command_ack_emits_terminal_update() {
        let (dispatcher, vehicle, mut rx) = test_dispatcher();
        vehicle
            .with_state(|s| {
                s.system_id = Some(1);
                s.component_id = Some(1);
                s.connection_status = ConnectionStatus::Connected;
            })
            .unwrap();
        vehicle
            .with_state(|s| {
                s.pending_commands.insert(
                    1,
                    crate::command::PendingCommand {
                        id: 1,
                        command: crate::command::Command::Arm,
                        sent_at: Instant::now(),
                        timeout_at: Instant::now() + std::time::Duration::from_secs(5),
                        status: crate::command::CommandStatus::Pending,
                        result_code: None,
                        user_message: String::new(),
                    },
                );
            })
            .unwrap();

        let msg = MavMessage::COMMAND_ACK(COMMAND_ACK_DATA {
            command: mavlink::ardupilotmega::MavCmd::MAV_CMD_COMPONENT_ARM_DISARM,
            result: MavResult::MAV_RESULT_ACCEPTED,
            ..Default::default()
        });
        dispatcher.dispatch(&header(1), &msg).unwrap();

        assert!(vehicle.snapshot().unwrap().pending_commands.is_empty());
        match rx.try_recv().unwrap() {
            LinkEvent::Command { update } => {
                assert_eq!(update.status, crate::command::CommandStatus::Acked)
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
