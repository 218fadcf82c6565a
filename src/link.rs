use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use mavlink::ardupilotmega::{
    MavAutopilot, MavMessage, MavModeFlag, MavState, MavType, COMMAND_LONG_DATA, HEARTBEAT_DATA,
};
use mavlink::ardupilotmega::MavCmd::MAV_CMD_SET_MESSAGE_INTERVAL;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::command::{self, CommandError, CommandTracker};
use crate::config::LinkConfig;
use crate::dispatch::Dispatcher;
use crate::events::LinkEvent;
use crate::mission::{self, MissionKind};
use crate::transport::{self, MavSender};
use crate::vehicle::{ConnectionStatus, Vehicle, VehicleState};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Message ids requested from the autopilot once a session reaches
/// Connected, with their rates. Slow channels (heartbeat, sys status, GPS,
/// home) stay at 1 Hz or below; the fast channels follow the configured
/// telemetry rate.
const STREAM_REQUESTS: &[(u32, StreamRate)] = &[
    (0, StreamRate::OneHz),    // HEARTBEAT
    (1, StreamRate::OneHz),    // SYS_STATUS
    (24, StreamRate::OneHz),   // GPS_RAW_INT
    (33, StreamRate::Fast),    // GLOBAL_POSITION_INT
    (30, StreamRate::Fast),    // ATTITUDE
    (74, StreamRate::Fast),    // VFR_HUD
    (242, StreamRate::FifthHz), // HOME_POSITION
];

#[derive(Clone, Copy)]
enum StreamRate {
    OneHz,
    Fast,
    FifthHz,
}

impl StreamRate {
    fn interval_us(self, telemetry_rate_hz: f32) -> f32 {
        match self {
            StreamRate::OneHz => 1_000_000.0,
            StreamRate::Fast => 1_000_000.0 / telemetry_rate_hz.max(0.1),
            StreamRate::FifthHz => 5_000_000.0,
        }
    }
}

struct SessionHandles {
    session: JoinHandle<()>,
    monitor: JoinHandle<()>,
}

/// Owns one vehicle link end to end: the TCP session with its reconnect
/// loop, the watchdog that degrades a silent link and times out commands,
/// and the event fan-out consumers subscribe to.
pub struct LinkManager {
    cfg: Arc<LinkConfig>,
    vehicle: Arc<Vehicle>,
    sender: MavSender,
    tracker: CommandTracker,
    events: broadcast::Sender<LinkEvent>,
    shutdown: broadcast::Sender<()>,
    session: Mutex<Option<SessionHandles>>,
}

impl LinkManager {
    pub fn new(cfg: LinkConfig) -> Self {
        let cfg = Arc::new(cfg);
        let vehicle = Arc::new(Vehicle::new());
        let sender = MavSender::new(cfg.connection.system_id, cfg.connection.component_id);
        let tracker = CommandTracker::new(vehicle.clone(), sender.clone(), cfg.clone());
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (shutdown, _) = broadcast::channel(1);
        Self {
            cfg,
            vehicle,
            sender,
            tracker,
            events,
            shutdown,
            session: Mutex::new(None),
        }
    }

    pub fn vehicle(&self) -> Arc<Vehicle> {
        self.vehicle.clone()
    }

    pub fn commands(&self) -> CommandTracker {
        self.tracker.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }

    pub fn status(&self) -> Result<ConnectionStatus> {
        self.vehicle.status()
    }

    /// Spawn the session and monitor tasks. Rejects a second connect while a
    /// session is active; disconnect first.
    pub async fn connect(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        if session.is_some() {
            return Err(anyhow!("link already active"));
        }

        self.set_status(ConnectionStatus::Connecting)?;

        let session_task = tokio::spawn(session_loop(
            self.cfg.clone(),
            self.vehicle.clone(),
            self.sender.clone(),
            self.events.clone(),
            self.shutdown.subscribe(),
        ));
        let monitor_task = tokio::spawn(monitor_loop(
            self.cfg.clone(),
            self.vehicle.clone(),
            self.sender.clone(),
            self.events.clone(),
            self.shutdown.subscribe(),
        ));

        *session = Some(SessionHandles {
            session: session_task,
            monitor: monitor_task,
        });
        Ok(())
    }

    /// Tear the session down and reset the vehicle state for a fresh connect.
    pub async fn disconnect(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        let Some(handles) = session.take() else {
            return Ok(());
        };

        info!("disconnecting link");
        let _ = self.shutdown.send(());
        self.sender.clear().await;
        let _ = handles.session.await;
        let _ = handles.monitor.await;

        self.vehicle.reset()?;
        let _ = self.events.send(LinkEvent::Connection {
            status: ConnectionStatus::Disconnected,
        });
        Ok(())
    }

    /// Start a mission or fence readback. Fails if the link is down or a
    /// readback is already running.
    pub async fn request_mission(&self, kind: MissionKind) -> Result<(), CommandError> {
        let request = self
            .vehicle
            .with_state(|s| mission::begin(s, kind, Instant::now()))
            .map_err(|e| CommandError::State(e.to_string()))??;

        if let Err(e) = self.sender.send(&request).await {
            let _ = self.vehicle.with_state(mission::abort);
            return Err(e.into());
        }
        info!(?kind, "readback started");
        Ok(())
    }

    fn set_status(&self, status: ConnectionStatus) -> Result<()> {
        if self.vehicle.set_status(status)? {
            let _ = self.events.send(LinkEvent::Connection { status });
        }
        Ok(())
    }
}

/// Why a session attempt ended. A connect timeout (socket open but no
/// heartbeat) re-enters Connecting directly; transport failures go through
/// Reconnecting with backoff.
enum SessionEnd {
    ConnectTimeout,
    Failed(anyhow::Error),
}

/// Reconnect delay: doubles from the initial value up to the cap, reset on
/// every successful session.
struct Backoff {
    initial: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            next: initial,
        }
    }

    fn delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        delay
    }

    fn reset(&mut self) {
        self.next = self.initial;
    }
}

async fn session_loop(
    cfg: Arc<LinkConfig>,
    vehicle: Arc<Vehicle>,
    sender: MavSender,
    events: broadcast::Sender<LinkEvent>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut backoff = Backoff::new(
        cfg.timing.backoff_initial(),
        cfg.timing.backoff_max(),
    );
    let dispatcher = Dispatcher::new(vehicle.clone(), cfg.modes.clone(), events.clone());

    loop {
        let result = tokio::select! {
            r = run_session(&cfg, &vehicle, &sender, &events, &dispatcher, &mut backoff) => r,
            _ = shutdown.recv() => {
                debug!("session loop stopped");
                return;
            }
        };

        sender.clear().await;
        match result {
            Ok(()) => return,
            Err(SessionEnd::ConnectTimeout) => {
                // No heartbeat on a fresh socket: retry the dial right away,
                // without the reconnect backoff.
                warn!("no heartbeat within connect timeout, retrying");
                continue;
            }
            Err(SessionEnd::Failed(e)) => warn!("session ended: {e:#}"),
        }

        set_status(&vehicle, &events, ConnectionStatus::Reconnecting);
        let delay = backoff.delay();
        info!(delay_s = delay.as_secs(), "reconnecting after backoff");
        tokio::select! {
            _ = sleep(delay) => {}
            _ = shutdown.recv() => return,
        }
    }
}

/// One full session attempt: dial, wait for the first heartbeat, request the
/// telemetry channels, then pump frames until the transport fails.
async fn run_session(
    cfg: &LinkConfig,
    vehicle: &Arc<Vehicle>,
    sender: &MavSender,
    events: &broadcast::Sender<LinkEvent>,
    dispatcher: &Dispatcher,
    backoff: &mut Backoff,
) -> Result<(), SessionEnd> {
    set_status(vehicle, events, ConnectionStatus::Connecting);
    let (mut reader, write_half) =
        transport::connect(&cfg.connection.host, cfg.connection.port)
            .await
            .map_err(|e| SessionEnd::Failed(e.into()))?;
    sender.install(write_half).await;

    set_status(vehicle, events, ConnectionStatus::AwaitingFirstHeartbeat);
    let deadline = Instant::now() + cfg.timing.connect_timeout();
    while vehicle.status().map_err(SessionEnd::Failed)? != ConnectionStatus::Connected {
        let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
            return Err(SessionEnd::ConnectTimeout);
        };
        let (header, msg) = match timeout(remaining, reader.recv_frame()).await {
            Err(_) => return Err(SessionEnd::ConnectTimeout),
            Ok(frame) => frame.map_err(|e| SessionEnd::Failed(e.into()))?,
        };
        handle_frame(dispatcher, sender, &header, &msg)
            .await
            .map_err(SessionEnd::Failed)?;
    }

    backoff.reset();
    let (target_system, target_component) = vehicle
        .with_state(|s| (s.system_id.unwrap_or(1), s.component_id.unwrap_or(1)))
        .map_err(SessionEnd::Failed)?;
    request_telemetry(cfg, sender, target_system, target_component)
        .await
        .map_err(SessionEnd::Failed)?;

    loop {
        let (header, msg) = reader
            .recv_frame()
            .await
            .map_err(|e| SessionEnd::Failed(e.into()))?;
        handle_frame(dispatcher, sender, &header, &msg)
            .await
            .map_err(SessionEnd::Failed)?;
    }
}

async fn handle_frame(
    dispatcher: &Dispatcher,
    sender: &MavSender,
    header: &mavlink::MavHeader,
    msg: &MavMessage,
) -> Result<()> {
    let outcome = dispatcher.dispatch(header, msg)?;
    for reply in outcome.replies {
        sender.send(&reply).await?;
    }
    Ok(())
}

async fn request_telemetry(
    cfg: &LinkConfig,
    sender: &MavSender,
    target_system: u8,
    target_component: u8,
) -> Result<()> {
    for &(msg_id, rate) in STREAM_REQUESTS {
        let request = MavMessage::COMMAND_LONG(COMMAND_LONG_DATA {
            command: MAV_CMD_SET_MESSAGE_INTERVAL,
            target_system,
            target_component,
            param1: msg_id as f32,
            param2: rate.interval_us(cfg.streams.telemetry_rate_hz),
            ..Default::default()
        });
        sender.send(&request).await?;
        // The autopilot drops back-to-back commands; pace the burst.
        sleep(Duration::from_millis(50)).await;
    }
    debug!(count = STREAM_REQUESTS.len(), "telemetry channels requested");
    Ok(())
}

async fn monitor_loop(
    cfg: Arc<LinkConfig>,
    vehicle: Arc<Vehicle>,
    sender: MavSender,
    events: broadcast::Sender<LinkEvent>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut tick = tokio::time::interval(cfg.timing.monitor_interval());
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = shutdown.recv() => {
                debug!("monitor loop stopped");
                return;
            }
        }
        if let Err(e) = monitor_tick(&cfg, &vehicle, &sender, &events).await {
            error!("monitor tick failed: {e:#}");
        }
    }
}

async fn monitor_tick(
    cfg: &LinkConfig,
    vehicle: &Arc<Vehicle>,
    sender: &MavSender,
    events: &broadcast::Sender<LinkEvent>,
) -> Result<()> {
    let now = Instant::now();

    let degraded =
        vehicle.with_state(|s| degrade_if_stale(s, cfg.timing.heartbeat_timeout(), now))?;
    if degraded {
        warn!(
            timeout_s = cfg.timing.heartbeat_timeout().as_secs(),
            "heartbeat lost, degrading link"
        );
        let _ = events.send(LinkEvent::Connection {
            status: ConnectionStatus::Degraded,
        });
    }

    for update in vehicle.with_state(|s| command::sweep_timeouts(s, now))? {
        command::publish_update(events, update);
    }

    let stalled = vehicle.with_state(|s| {
        mission::sweep_stalled(s, cfg.timing.readback_timeout(), now)
    })?;
    if let Some((kind, reason)) = stalled {
        warn!(?kind, %reason, "readback stalled, aborting");
        let _ = events.send(LinkEvent::MissionFailed { kind, reason });
    }

    if sender.is_connected().await {
        sender.send(&gcs_heartbeat()).await.ok();
    }
    Ok(())
}

/// Degrade a Connected link with no heartbeat inside the timeout window.
/// Runs inside one lock acquisition so a heartbeat cannot land between the
/// staleness decision and the status write.
fn degrade_if_stale(state: &mut VehicleState, timeout: Duration, now: Instant) -> bool {
    if state.connection_status != ConnectionStatus::Connected {
        return false;
    }
    let stale = match state.last_heartbeat_at {
        Some(at) => now.duration_since(at) > timeout,
        None => false,
    };
    if stale {
        state.connection_status = ConnectionStatus::Degraded;
    }
    stale
}

fn gcs_heartbeat() -> MavMessage {
    MavMessage::HEARTBEAT(HEARTBEAT_DATA {
        custom_mode: 0,
        mavtype: MavType::MAV_TYPE_GCS,
        autopilot: MavAutopilot::MAV_AUTOPILOT_INVALID,
        base_mode: MavModeFlag::empty(),
        system_status: MavState::MAV_STATE_ACTIVE,
        mavlink_version: 3,
    })
}

fn set_status(
    vehicle: &Arc<Vehicle>,
    events: &broadcast::Sender<LinkEvent>,
    status: ConnectionStatus,
) {
    match vehicle.set_status(status) {
        Ok(true) => {
            info!(%status, "link state changed");
            let _ = events.send(LinkEvent::Connection { status });
        }
        Ok(false) => {}
        Err(e) => error!("failed to update link state: {e:#}"),
    }
}
