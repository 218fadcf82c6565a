use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use mavlink::ardupilotmega::{MavCmd, MavMessage, MavModeFlag, MavResult, COMMAND_LONG_DATA};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::config::{LinkConfig, ModeTable};
use crate::events::LinkEvent;
use crate::transport::{MavSender, TransportError};
use crate::vehicle::{ConnectionStatus, Vehicle, VehicleState};

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("cannot issue command while {0}")]
    InvalidState(ConnectionStatus),
    #[error("a {0:?} command is already pending")]
    AlreadyPending(CommandKind),
    #[error("unknown flight mode '{0}'")]
    UnknownMode(String),
    #[error("invalid parameter: {0}")]
    InvalidParam(String),
    #[error("a mission readback is already in progress")]
    ReadbackBusy,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("state error: {0}")]
    State(String),
}

/// A discrete command the UI layer can issue.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Command {
    Arm,
    Disarm,
    SetMode { mode: String },
    Takeoff { altitude: f32 },
    Land,
    ReturnToLaunch,
    Goto { lat: f64, lon: f64, alt: f32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CommandKind {
    Arm,
    Disarm,
    SetMode,
    Takeoff,
    Land,
    ReturnToLaunch,
    Goto,
}

impl CommandKind {
    pub fn config_key(self) -> &'static str {
        match self {
            CommandKind::Arm => "arm",
            CommandKind::Disarm => "disarm",
            CommandKind::SetMode => "set_mode",
            CommandKind::Takeoff => "takeoff",
            CommandKind::Land => "land",
            CommandKind::ReturnToLaunch => "rtl",
            CommandKind::Goto => "goto",
        }
    }
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::Arm => CommandKind::Arm,
            Command::Disarm => CommandKind::Disarm,
            Command::SetMode { .. } => CommandKind::SetMode,
            Command::Takeoff { .. } => CommandKind::Takeoff,
            Command::Land => CommandKind::Land,
            Command::ReturnToLaunch => CommandKind::ReturnToLaunch,
            Command::Goto { .. } => CommandKind::Goto,
        }
    }

    pub fn mav_cmd(&self) -> MavCmd {
        match self {
            Command::Arm | Command::Disarm => MavCmd::MAV_CMD_COMPONENT_ARM_DISARM,
            Command::SetMode { .. } => MavCmd::MAV_CMD_DO_SET_MODE,
            Command::Takeoff { .. } => MavCmd::MAV_CMD_NAV_TAKEOFF,
            Command::Land => MavCmd::MAV_CMD_NAV_LAND,
            Command::ReturnToLaunch => MavCmd::MAV_CMD_NAV_RETURN_TO_LAUNCH,
            Command::Goto { .. } => MavCmd::MAV_CMD_NAV_WAYPOINT,
        }
    }

    fn validate(&self, modes: &ModeTable) -> Result<(), CommandError> {
        match self {
            Command::SetMode { mode } => {
                if modes.id_for(mode).is_none() {
                    return Err(CommandError::UnknownMode(mode.clone()));
                }
            }
            Command::Takeoff { altitude } => {
                if !(*altitude > 0.0 && *altitude <= 1000.0) {
                    return Err(CommandError::InvalidParam(format!(
                        "takeoff altitude {altitude} out of range (0, 1000]"
                    )));
                }
            }
            Command::Goto { lat, lon, .. } => {
                if !(-90.0..=90.0).contains(lat) || !(-180.0..=180.0).contains(lon) {
                    return Err(CommandError::InvalidParam(format!(
                        "goto coordinates {lat},{lon} out of range"
                    )));
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Build the COMMAND_LONG frame for this command. Parameter slots follow
    /// the MAV_CMD definitions the original ground station used.
    fn build_frame(
        &self,
        modes: &ModeTable,
        target_system: u8,
        target_component: u8,
    ) -> Result<MavMessage, CommandError> {
        let mut data = COMMAND_LONG_DATA {
            command: self.mav_cmd(),
            target_system,
            target_component,
            confirmation: 0,
            ..Default::default()
        };

        match self {
            Command::Arm => data.param1 = 1.0,
            Command::Disarm => data.param1 = 0.0,
            Command::SetMode { mode } => {
                let mode_id = modes
                    .id_for(mode)
                    .ok_or_else(|| CommandError::UnknownMode(mode.clone()))?;
                data.param1 = MavModeFlag::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED.bits() as f32;
                data.param2 = mode_id as f32;
            }
            Command::Takeoff { altitude } => data.param7 = *altitude,
            Command::Land | Command::ReturnToLaunch => {}
            Command::Goto { lat, lon, alt } => {
                data.param5 = *lat as f32;
                data.param6 = *lon as f32;
                data.param7 = *alt;
            }
        }

        Ok(MavMessage::COMMAND_LONG(data))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CommandStatus {
    Pending,
    Acked,
    Rejected,
    TimedOut,
}

/// Mirror of the MAV_RESULT values we can receive back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AckResult {
    Accepted,
    TemporarilyRejected,
    Denied,
    Unsupported,
    Failed,
    InProgress,
    Cancelled,
    Other,
}

/// An issued command awaiting acknowledgment or timeout. Lives in
/// `VehicleState::pending_commands` from issuance until a terminal outcome is
/// reported, and is only ever removed by the ack processor or the sweep.
#[derive(Debug, Clone, Serialize)]
pub struct PendingCommand {
    pub id: u64,
    pub command: Command,
    #[serde(skip)]
    pub sent_at: Instant,
    #[serde(skip)]
    pub timeout_at: Instant,
    pub status: CommandStatus,
    pub result_code: Option<AckResult>,
    pub user_message: String,
}

impl PendingCommand {
    pub fn kind(&self) -> CommandKind {
        self.command.kind()
    }
}

/// Outcome notification for a pending command: terminal (Acked, Rejected,
/// TimedOut) or an in-progress note.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandUpdate {
    pub id: u64,
    pub kind: CommandKind,
    pub status: CommandStatus,
    pub result_code: Option<AckResult>,
    pub message: String,
}

/// Send side of the command protocol: allocates correlation ids, records
/// pending entries and transmits COMMAND_LONG frames. Resolution happens
/// asynchronously in the ack processor or the timeout sweep.
#[derive(Clone)]
pub struct CommandTracker {
    vehicle: Arc<Vehicle>,
    sender: MavSender,
    cfg: Arc<LinkConfig>,
    next_id: Arc<AtomicU64>,
}

impl CommandTracker {
    pub fn new(vehicle: Arc<Vehicle>, sender: MavSender, cfg: Arc<LinkConfig>) -> Self {
        Self {
            vehicle,
            sender,
            cfg,
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Issue a command. Returns the correlation id once the frame is on the
    /// wire and the pending entry is recorded; does not wait for the ack.
    pub async fn issue(&self, command: Command) -> Result<u64, CommandError> {
        command.validate(&self.cfg.modes)?;
        let kind = command.kind();
        let timeout = self.cfg.command_timeout_for(kind);

        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let now = Instant::now();

        let frame = self
            .vehicle
            .with_state(|state| {
                record_pending(state, &self.cfg.modes, command.clone(), id, timeout, now)
            })
            .map_err(|e| CommandError::State(e.to_string()))??;

        if let Err(e) = self.sender.send(&frame).await {
            // Roll the entry back so a failed send leaves nothing pending.
            let _ = self
                .vehicle
                .with_state(|state| state.pending_commands.remove(&id));
            return Err(e.into());
        }

        info!(command = ?kind, id, "command sent");
        Ok(id)
    }
}

/// Pre-flight checks and pending-entry insertion, done under the state lock.
/// Policy: a second command of a kind that is already pending is rejected
/// rather than superseding the older entry.
fn record_pending(
    state: &mut VehicleState,
    modes: &ModeTable,
    command: Command,
    id: u64,
    timeout: std::time::Duration,
    now: Instant,
) -> Result<MavMessage, CommandError> {
    let kind = command.kind();

    match state.connection_status {
        ConnectionStatus::Connected | ConnectionStatus::Degraded => {}
        other => return Err(CommandError::InvalidState(other)),
    }
    if state
        .pending_commands
        .values()
        .any(|p| p.kind() == kind && p.status == CommandStatus::Pending)
    {
        return Err(CommandError::AlreadyPending(kind));
    }

    let target_system = state
        .system_id
        .ok_or(CommandError::InvalidState(state.connection_status))?;
    let target_component = state.component_id.unwrap_or(1);

    let frame = command.build_frame(modes, target_system, target_component)?;
    state.pending_commands.insert(
        id,
        PendingCommand {
            id,
            command,
            sent_at: now,
            timeout_at: now + timeout,
            status: CommandStatus::Pending,
            result_code: None,
            user_message: String::new(),
        },
    );
    Ok(frame)
}

/// Resolve a COMMAND_ACK against the pending set.
///
/// The MAVLink ack carries the acknowledged MAV_CMD, not our correlation id,
/// so this matches the oldest pending entry issued with that MAV_CMD (ids are
/// monotonic, so the smallest id is the oldest). ACCEPTED resolves the entry,
/// IN_PROGRESS leaves it pending with a progress note, anything else rejects
/// it.
pub fn resolve_ack(
    state: &mut VehicleState,
    command: MavCmd,
    result: MavResult,
) -> Option<CommandUpdate> {
    let (id, entry) = state
        .pending_commands
        .iter_mut()
        .find(|(_, p)| p.command.mav_cmd() == command && p.status == CommandStatus::Pending)
        .map(|(id, p)| (*id, p))?;

    let (ack, explanation) = describe_result(result);
    let terminal = !matches!(ack, AckResult::InProgress);
    let status = match ack {
        AckResult::Accepted => CommandStatus::Acked,
        AckResult::InProgress => CommandStatus::Pending,
        _ => CommandStatus::Rejected,
    };

    entry.status = status;
    entry.result_code = Some(ack);
    entry.user_message = explanation.to_string();

    let update = CommandUpdate {
        id,
        kind: entry.kind(),
        status,
        result_code: Some(ack),
        message: explanation.to_string(),
    };

    if terminal {
        state.pending_commands.remove(&id);
    }
    Some(update)
}

fn describe_result(result: MavResult) -> (AckResult, &'static str) {
    match result {
        MavResult::MAV_RESULT_ACCEPTED => (AckResult::Accepted, "command accepted by vehicle"),
        MavResult::MAV_RESULT_TEMPORARILY_REJECTED => (
            AckResult::TemporarilyRejected,
            "command temporarily rejected - vehicle might be in wrong state",
        ),
        MavResult::MAV_RESULT_DENIED => {
            (AckResult::Denied, "command denied - vehicle rejected the command")
        }
        MavResult::MAV_RESULT_UNSUPPORTED => {
            (AckResult::Unsupported, "command unsupported by vehicle")
        }
        MavResult::MAV_RESULT_FAILED => (AckResult::Failed, "command failed during execution"),
        MavResult::MAV_RESULT_IN_PROGRESS => {
            (AckResult::InProgress, "command accepted and in progress")
        }
        MavResult::MAV_RESULT_CANCELLED => (AckResult::Cancelled, "command cancelled"),
        _ => (AckResult::Other, "command response unknown"),
    }
}

/// Expire pending commands past their deadline. Terminal updates are returned
/// for notification; expired entries are removed. Called from the monitor
/// tick, never from the receive loop.
pub fn sweep_timeouts(state: &mut VehicleState, now: Instant) -> Vec<CommandUpdate> {
    let expired: Vec<u64> = state
        .pending_commands
        .iter()
        .filter(|(_, p)| p.status == CommandStatus::Pending && p.timeout_at <= now)
        .map(|(id, _)| *id)
        .collect();

    let mut updates = Vec::with_capacity(expired.len());
    for id in expired {
        if let Some(entry) = state.pending_commands.remove(&id) {
            let elapsed = now.duration_since(entry.sent_at).as_secs_f64();
            updates.push(CommandUpdate {
                id,
                kind: entry.kind(),
                status: CommandStatus::TimedOut,
                result_code: None,
                message: format!("command timed out after {elapsed:.1}s with no acknowledgment"),
            });
        }
    }
    updates
}

/// Log and broadcast a command update from the monitor or dispatcher.
pub(crate) fn publish_update(events: &broadcast::Sender<LinkEvent>, update: CommandUpdate) {
    match update.status {
        CommandStatus::Acked | CommandStatus::Pending => {
            info!(id = update.id, kind = ?update.kind, "{}", update.message)
        }
        CommandStatus::Rejected | CommandStatus::TimedOut => {
            warn!(id = update.id, kind = ?update.kind, "{}", update.message)
        }
    }
    let _ = events.send(LinkEvent::Command { update });
}
