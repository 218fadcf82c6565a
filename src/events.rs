use mavlink::ardupilotmega::MavSeverity;
use serde::Serialize;

use crate::command::CommandUpdate;
use crate::mission::{MissionKind, MissionPoint};
use crate::vehicle::{ConnectionStatus, VehicleState};

/// Severity of a vehicle STATUSTEXT, mirrored from MAV_SEVERITY.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusSeverity {
    Emergency,
    Alert,
    Critical,
    Error,
    Warning,
    Notice,
    Info,
    Debug,
}

impl From<MavSeverity> for StatusSeverity {
    fn from(s: MavSeverity) -> Self {
        match s {
            MavSeverity::MAV_SEVERITY_EMERGENCY => StatusSeverity::Emergency,
            MavSeverity::MAV_SEVERITY_ALERT => StatusSeverity::Alert,
            MavSeverity::MAV_SEVERITY_CRITICAL => StatusSeverity::Critical,
            MavSeverity::MAV_SEVERITY_ERROR => StatusSeverity::Error,
            MavSeverity::MAV_SEVERITY_WARNING => StatusSeverity::Warning,
            MavSeverity::MAV_SEVERITY_NOTICE => StatusSeverity::Notice,
            MavSeverity::MAV_SEVERITY_INFO => StatusSeverity::Info,
            MavSeverity::MAV_SEVERITY_DEBUG => StatusSeverity::Debug,
        }
    }
}

/// Outbound change events for the external broadcaster/UI layer. Emitted on
/// every connection-state transition, whenever a processor reports an
/// observable state change, and for each pending-command outcome.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LinkEvent {
    Connection {
        status: ConnectionStatus,
    },
    State {
        state: VehicleState,
        /// Which message kind produced the change.
        source: &'static str,
    },
    Command {
        update: CommandUpdate,
    },
    StatusText {
        severity: StatusSeverity,
        text: String,
    },
    Mission {
        kind: MissionKind,
        points: Vec<MissionPoint>,
    },
    MissionFailed {
        kind: MissionKind,
        reason: String,
    },
}
