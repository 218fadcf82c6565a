use std::time::Instant;

use mavlink::ardupilotmega::{
    MavMissionResult, MavMissionType, MavMessage, MISSION_ACK_DATA, MISSION_COUNT_DATA,
    MISSION_ITEM_DATA, MISSION_REQUEST_DATA, MISSION_REQUEST_LIST_DATA,
};
use serde::Serialize;

use crate::command::CommandError;
use crate::vehicle::{ConnectionStatus, VehicleState};

/// Which onboard item list to read back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MissionKind {
    Mission,
    Fence,
}

impl MissionKind {
    fn mav_type(self) -> MavMissionType {
        match self {
            MissionKind::Mission => MavMissionType::MAV_MISSION_TYPE_MISSION,
            MissionKind::Fence => MavMissionType::MAV_MISSION_TYPE_FENCE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MissionPoint {
    pub seq: u16,
    pub lat: f64,
    pub lon: f64,
    pub alt: f32,
}

/// An in-flight readback: request-list sent, waiting on the count and then
/// each item in sequence. At most one exists per session at a time.
#[derive(Debug, Clone, Serialize)]
pub struct MissionReadback {
    pub kind: MissionKind,
    pub expected: Option<u16>,
    pub points: Vec<MissionPoint>,
    #[serde(skip)]
    pub started_at: Instant,
    #[serde(skip)]
    pub last_progress_at: Instant,
}

/// What the dispatcher should do after a readback message: transmit a reply
/// and/or report a completed item list.
#[derive(Debug, Default)]
pub struct MissionStep {
    pub reply: Option<MavMessage>,
    pub complete: Option<(MissionKind, Vec<MissionPoint>)>,
}

/// Start a readback: checks session preconditions, records the in-flight
/// transfer and returns the MISSION_REQUEST_LIST frame to send. The caller
/// must clear the readback again if the send fails.
pub(crate) fn begin(
    state: &mut VehicleState,
    kind: MissionKind,
    now: Instant,
) -> Result<MavMessage, CommandError> {
    match state.connection_status {
        ConnectionStatus::Connected | ConnectionStatus::Degraded => {}
        other => return Err(CommandError::InvalidState(other)),
    }
    if state.mission_readback.is_some() {
        return Err(CommandError::ReadbackBusy);
    }
    let target_system = state
        .system_id
        .ok_or(CommandError::InvalidState(state.connection_status))?;
    let target_component = state.component_id.unwrap_or(1);

    state.mission_readback = Some(MissionReadback {
        kind,
        expected: None,
        points: Vec::new(),
        started_at: now,
        last_progress_at: now,
    });

    Ok(MavMessage::MISSION_REQUEST_LIST(MISSION_REQUEST_LIST_DATA {
        target_system,
        target_component,
        mission_type: kind.mav_type(),
        ..Default::default()
    }))
}

pub(crate) fn abort(state: &mut VehicleState) {
    state.mission_readback = None;
}

/// MISSION_COUNT processor step: latch the expected count and request the
/// first item, or complete immediately on an empty list.
pub(crate) fn on_count(
    state: &mut VehicleState,
    data: &MISSION_COUNT_DATA,
    now: Instant,
) -> MissionStep {
    let (target_system, target_component) = targets(state);
    let Some(readback) = state.mission_readback.as_mut() else {
        return MissionStep::default();
    };
    if data.mission_type != readback.kind.mav_type() || readback.expected.is_some() {
        return MissionStep::default();
    }

    readback.last_progress_at = now;
    if data.count == 0 {
        let kind = readback.kind;
        state.mission_readback = None;
        return MissionStep {
            reply: None,
            complete: Some((kind, Vec::new())),
        };
    }

    readback.expected = Some(data.count);
    MissionStep {
        reply: Some(request_item(readback.kind, 0, target_system, target_component)),
        complete: None,
    }
}

/// MISSION_ITEM processor step: record the point, then either request the
/// next item or finish with MISSION_ACK.
pub(crate) fn on_item(
    state: &mut VehicleState,
    data: &MISSION_ITEM_DATA,
    now: Instant,
) -> MissionStep {
    let (target_system, target_component) = targets(state);
    let Some(readback) = state.mission_readback.as_mut() else {
        return MissionStep::default();
    };
    let Some(expected) = readback.expected else {
        return MissionStep::default();
    };
    if data.seq != readback.points.len() as u16 {
        // Out-of-sequence duplicate; the pending request will re-elicit it.
        return MissionStep::default();
    }

    readback.last_progress_at = now;
    readback.points.push(MissionPoint {
        seq: data.seq,
        lat: descale(data.x),
        lon: descale(data.y),
        alt: data.z,
    });

    let next = data.seq + 1;
    if next < expected {
        return MissionStep {
            reply: Some(request_item(readback.kind, next, target_system, target_component)),
            complete: None,
        };
    }

    let kind = readback.kind;
    let points = std::mem::take(&mut readback.points);
    state.mission_readback = None;
    MissionStep {
        reply: Some(MavMessage::MISSION_ACK(MISSION_ACK_DATA {
            target_system,
            target_component,
            mavtype: MavMissionResult::MAV_MISSION_ACCEPTED,
            mission_type: kind.mav_type(),
            ..Default::default()
        })),
        complete: Some((kind, points)),
    }
}

/// Abort a readback that has made no progress within the window. Returns the
/// kind and a reason for the failure event.
pub(crate) fn sweep_stalled(
    state: &mut VehicleState,
    timeout: std::time::Duration,
    now: Instant,
) -> Option<(MissionKind, String)> {
    let readback = state.mission_readback.as_ref()?;
    if now.duration_since(readback.last_progress_at) <= timeout {
        return None;
    }
    let kind = readback.kind;
    let got = readback.points.len();
    let expected = readback.expected;
    state.mission_readback = None;
    Some((
        kind,
        match expected {
            Some(n) => format!("readback stalled after {got} of {n} items"),
            None => "no response to item list request".to_string(),
        },
    ))
}

fn request_item(
    kind: MissionKind,
    seq: u16,
    target_system: u8,
    target_component: u8,
) -> MavMessage {
    MavMessage::MISSION_REQUEST(MISSION_REQUEST_DATA {
        seq,
        target_system,
        target_component,
        mission_type: kind.mav_type(),
        ..Default::default()
    })
}

fn targets(state: &VehicleState) -> (u8, u8) {
    (
        state.system_id.unwrap_or(0),
        state.component_id.unwrap_or(1),
    )
}

/// Some firmwares report fence points in 1e7-scaled integer degrees even in
/// the float fields; anything outside valid degrees gets descaled.
fn descale(v: f32) -> f64 {
    let v = v as f64;
    if v.abs() > 180.0 {
        v / 1e7
    } else {
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connected_state() -> VehicleState {
        VehicleState {
            connection_status: ConnectionStatus::Connected,
            system_id: Some(1),
            component_id: Some(1),
            ..Default::default()
        }
    }

    fn count(n: u16, kind: MissionKind) -> MISSION_COUNT_DATA {
        MISSION_COUNT_DATA {
            count: n,
            target_system: 255,
            target_component: 0,
            mission_type: kind.mav_type(),
            ..Default::default()
        }
    }

    fn item(seq: u16, lat: f32, lon: f32, alt: f32) -> MISSION_ITEM_DATA {
        MISSION_ITEM_DATA {
            seq,
            x: lat,
            y: lon,
            z: alt,
            ..Default::default()
        }
    }

    #[test]
    fn begin_requires_connected_session() {
        let mut state = VehicleState::default();
        assert!(matches!(
            begin(&mut state, MissionKind::Fence, Instant::now()),
            Err(CommandError::InvalidState(_))
        ));
    }

    #[test]
    fn begin_rejects_concurrent_readback() {
        let mut state = connected_state();
        begin(&mut state, MissionKind::Mission, Instant::now()).unwrap();
        assert!(matches!(
            begin(&mut state, MissionKind::Fence, Instant::now()),
            Err(CommandError::ReadbackBusy)
        ));
    }

    #[test]
    fn empty_list_completes_immediately() {
        let mut state = connected_state();
        begin(&mut state, MissionKind::Fence, Instant::now()).unwrap();

        let step = on_count(&mut state, &count(0, MissionKind::Fence), Instant::now());
        assert!(step.reply.is_none());
        let (kind, points) = step.complete.unwrap();
        assert_eq!(kind, MissionKind::Fence);
        assert!(points.is_empty());
        assert!(state.mission_readback.is_none());
    }

    #[test]
    fn full_walk_requests_each_item_then_acks() {
        let mut state = connected_state();
        let now = Instant::now();
        begin(&mut state, MissionKind::Mission, now).unwrap();

        let step = on_count(&mut state, &count(2, MissionKind::Mission), now);
        match step.reply {
            Some(MavMessage::MISSION_REQUEST(req)) => assert_eq!(req.seq, 0),
            other => panic!("expected MISSION_REQUEST, got {other:?}"),
        }

        let step = on_item(&mut state, &item(0, 44.65, -63.57, 30.0), now);
        match step.reply {
            Some(MavMessage::MISSION_REQUEST(req)) => assert_eq!(req.seq, 1),
            other => panic!("expected MISSION_REQUEST, got {other:?}"),
        }
        assert!(step.complete.is_none());

        let step = on_item(&mut state, &item(1, 44.66, -63.58, 35.0), now);
        assert!(matches!(step.reply, Some(MavMessage::MISSION_ACK(_))));
        let (_, points) = step.complete.unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[1].seq, 1);
        assert!((points[0].lat - 44.65).abs() < 1e-3);
        assert!(state.mission_readback.is_none());
    }

    #[test]
    fn duplicate_item_is_ignored() {
        let mut state = connected_state();
        let now = Instant::now();
        begin(&mut state, MissionKind::Mission, now).unwrap();
        on_count(&mut state, &count(2, MissionKind::Mission), now);
        on_item(&mut state, &item(0, 1.0, 2.0, 3.0), now);

        let step = on_item(&mut state, &item(0, 1.0, 2.0, 3.0), now);
        assert!(step.reply.is_none());
        assert!(step.complete.is_none());
        assert_eq!(
            state.mission_readback.as_ref().unwrap().points.len(),
            1
        );
    }

    #[test]
    fn scaled_integer_degrees_are_descaled() {
        let mut state = connected_state();
        let now = Instant::now();
        begin(&mut state, MissionKind::Fence, now).unwrap();
        on_count(&mut state, &count(1, MissionKind::Fence), now);

        let step = on_item(&mut state, &item(0, 446_500_000.0, -635_700_000.0, 0.0), now);
        let (_, points) = step.complete.unwrap();
        assert!((points[0].lat - 44.65).abs() < 1e-2);
        assert!((points[0].lon + 63.57).abs() < 1e-2);
    }

    #[test]
    fn stalled_readback_is_swept() {
        let mut state = connected_state();
        let t0 = Instant::now();
        begin(&mut state, MissionKind::Mission, t0).unwrap();

        let timeout = std::time::Duration::from_secs(5);
        assert!(sweep_stalled(&mut state, timeout, t0 + std::time::Duration::from_secs(4)).is_none());

        let (kind, reason) =
            sweep_stalled(&mut state, timeout, t0 + std::time::Duration::from_secs(6)).unwrap();
        assert_eq!(kind, MissionKind::Mission);
        assert!(reason.contains("no response"));
        assert!(state.mission_readback.is_none());
    }

    #[test]
    fn count_for_wrong_type_is_ignored() {
        let mut state = connected_state();
        let now = Instant::now();
        begin(&mut state, MissionKind::Fence, now).unwrap();

        let step = on_count(&mut state, &count(3, MissionKind::Mission), now);
        assert!(step.reply.is_none());
        assert!(state.mission_readback.as_ref().unwrap().expected.is_none());
    }
}
