//! [`TransportManager`]: the three backend channels behind one handle.
//!
//! | Channel | Direction | Payload |
//! |---|---|---|
//! | Control | both | JSON roster updates, robot / mode switching |
//! | Telemetry | both | JSON velocity commands out, robot telemetry in |
//! | Streaming | in | Binary point-cloud frames, decoded off-thread |
//!
//! Each channel reconnects on its own after a fixed interval.  Sends are
//! fire-and-forget: when the target channel is not open they return `false`
//! and nothing is queued.

use std::num::NonZeroU32;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use serde::{Deserialize, Serialize};
use teleop_perception::PointCloudObject;
use teleop_stream::{DecoderEvent, DecoderHandle, WireEncoding};
use teleop_types::{
    ChannelKind, ChannelState, DecodedFrame, RobotId, RobotRecord, TeleopError, VelocityCommand,
};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::channel::{ChannelHandler, ChannelTask, Outbound, publish, send_on, supervise};
use crate::hub::{FrameHub, Subscription};
use crate::protocol::{ControlEvent, ControlRequest, TelemetryRequest, to_json};

/// Buffered telemetry messages per subscriber before the oldest are dropped.
const TELEMETRY_CAPACITY: usize = 256;

/// Backend addresses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Endpoints {
    pub control: String,
    pub telemetry: String,
    pub streaming: String,
    /// Signaling server announced to the backend with `initBridge`.
    pub signaling: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            control: "ws://localhost:8085".to_string(),
            telemetry: "ws://localhost:8090".to_string(),
            streaming: "ws://localhost:8095".to_string(),
            signaling: "ws://localhost:3002".to_string(),
        }
    }
}

/// Transport settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub endpoints: Endpoints,
    pub reconnect_interval_ms: u64,
    /// Wire encoding tag of the streaming channel.  Kept as a string so an
    /// unknown tag surfaces as decode errors rather than a startup failure.
    pub encoding: String,
    /// Maximum velocity commands per second; `None` sends every command.
    pub command_rate_limit: Option<u32>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            endpoints: Endpoints::default(),
            reconnect_interval_ms: 5000,
            encoding: WireEncoding::XyzRgb16I16.tag().to_string(),
            command_rate_limit: None,
        }
    }
}

impl TransportConfig {
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }
}

/// Roster and robot selection as last reported by the backend.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SelectionState {
    pub roster: Vec<RobotRecord>,
    pub selected: Option<RobotRecord>,
    /// True between a switch request and its confirmation.
    pub switching: bool,
    /// Set when a switch is confirmed.
    pub session_started_at: Option<DateTime<Utc>>,
}

/// State shared between the manager and its tasks.
struct Shared {
    control_state: watch::Sender<ChannelState>,
    telemetry_state: watch::Sender<ChannelState>,
    streaming_state: watch::Sender<ChannelState>,
    control_out: Outbound,
    telemetry_out: Outbound,
    selection: watch::Sender<SelectionState>,
    telemetry_in: broadcast::Sender<serde_json::Value>,
    hub: FrameHub,
    point_cloud: Option<Arc<PointCloudObject>>,
}

impl Shared {
    fn state(&self, kind: ChannelKind) -> &watch::Sender<ChannelState> {
        match kind {
            ChannelKind::Control => &self.control_state,
            ChannelKind::Telemetry => &self.telemetry_state,
            ChannelKind::Streaming => &self.streaming_state,
        }
    }
}

/// Client side of the robot backend.
pub struct TransportManager {
    config: TransportConfig,
    shared: Arc<Shared>,
    limiter: Option<DefaultDirectRateLimiter>,
    /// Cancels the running connection set; `None` when disconnected.
    session: Mutex<Option<CancellationToken>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl TransportManager {
    pub fn new(config: TransportConfig) -> Self {
        let limiter = config
            .command_rate_limit
            .and_then(NonZeroU32::new)
            .map(|per_second| RateLimiter::direct(Quota::per_second(per_second)));
        let (telemetry_in, _) = broadcast::channel(TELEMETRY_CAPACITY);
        let shared = Shared {
            control_state: watch::Sender::new(ChannelState::Initializing),
            telemetry_state: watch::Sender::new(ChannelState::Initializing),
            streaming_state: watch::Sender::new(ChannelState::Initializing),
            control_out: watch::Sender::new(None),
            telemetry_out: watch::Sender::new(None),
            selection: watch::Sender::new(SelectionState::default()),
            telemetry_in,
            hub: FrameHub::new(),
            point_cloud: None,
        };
        Self {
            config,
            shared: Arc::new(shared),
            limiter,
            session: Mutex::new(None),
        }
    }

    /// Feed every decoded frame into `cloud` before subscribers see it.
    ///
    /// Must be called before [`connect_all`](Self::connect_all).
    pub fn with_point_cloud(mut self, cloud: Arc<PointCloudObject>) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.point_cloud = Some(cloud);
        } else {
            warn!("point cloud attached after connecting; ignored");
        }
        self
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Start the control, telemetry and streaming channels.
    ///
    /// Idempotent while connected.  Must be called from within a Tokio
    /// runtime.
    pub fn connect_all(
        &self,
        endpoints: Endpoints,
        reconnect_interval: Duration,
    ) -> Result<(), TeleopError> {
        let mut session = lock(&self.session);
        if session.is_some() {
            debug!("connect_all: already connected");
            return Ok(());
        }

        let (decoder, decoder_events) = DecoderHandle::spawn()?;
        let cancel = CancellationToken::new();
        info!(
            control = %endpoints.control,
            telemetry = %endpoints.telemetry,
            streaming = %endpoints.streaming,
            reconnect_ms = reconnect_interval.as_millis() as u64,
            "connecting to backend"
        );

        let shared = &self.shared;
        tokio::spawn(supervise(ChannelTask {
            kind: ChannelKind::Control,
            url: endpoints.control,
            reconnect_interval,
            state: shared.control_state.clone(),
            outbound: shared.control_out.clone(),
            cancel: cancel.clone(),
            handler: ControlHandler {
                signaling_url: endpoints.signaling,
                selection: shared.selection.clone(),
            },
        }));
        tokio::spawn(supervise(ChannelTask {
            kind: ChannelKind::Telemetry,
            url: endpoints.telemetry,
            reconnect_interval,
            state: shared.telemetry_state.clone(),
            outbound: shared.telemetry_out.clone(),
            cancel: cancel.clone(),
            handler: TelemetryHandler {
                inbound: shared.telemetry_in.clone(),
            },
        }));
        tokio::spawn(pump_stream(StreamPump {
            shared: Arc::clone(shared),
            decoder,
            events: decoder_events,
            endpoint: endpoints.streaming,
            encoding: self.config.encoding.clone(),
            reconnect_interval,
            cancel: cancel.clone(),
        }));

        *session = Some(cancel);
        Ok(())
    }

    /// Close all channels, cancel pending reconnects and stop the decoder.
    ///
    /// Safe to call repeatedly, or without ever connecting.
    pub fn shutdown(&self) {
        let Some(cancel) = lock(&self.session).take() else {
            return;
        };
        info!("shutting down transport");
        cancel.cancel();
        self.shared.control_out.send_replace(None);
        self.shared.telemetry_out.send_replace(None);
        for kind in ChannelKind::ALL {
            self.shared.state(kind).send_replace(ChannelState::Closed);
        }
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.session).is_some()
    }

    // -----------------------------------------------------------------------
    // Channel state
    // -----------------------------------------------------------------------

    pub fn channel_state(&self, kind: ChannelKind) -> ChannelState {
        *self.shared.state(kind).borrow()
    }

    pub fn watch_channel_state(&self, kind: ChannelKind) -> watch::Receiver<ChannelState> {
        self.shared.state(kind).subscribe()
    }

    // -----------------------------------------------------------------------
    // Roster and selection
    // -----------------------------------------------------------------------

    pub fn selection(&self) -> SelectionState {
        self.shared.selection.borrow().clone()
    }

    pub fn watch_selection(&self) -> watch::Receiver<SelectionState> {
        self.shared.selection.subscribe()
    }

    pub fn robots(&self) -> Vec<RobotRecord> {
        self.shared.selection.borrow().roster.clone()
    }

    pub fn selected_robot(&self) -> Option<RobotRecord> {
        self.shared.selection.borrow().selected.clone()
    }

    pub fn is_switching_robot(&self) -> bool {
        self.shared.selection.borrow().switching
    }

    pub fn session_started_at(&self) -> Option<DateTime<Utc>> {
        self.shared.selection.borrow().session_started_at
    }

    /// Ask the backend to switch to the robot at `index` in the current
    /// roster.
    ///
    /// Returns `Ok(false)` without changing anything when the control
    /// channel is not open.
    pub fn switch_robot(&self, index: usize) -> Result<bool, TeleopError> {
        let robot_id = self
            .shared
            .selection
            .borrow()
            .roster
            .get(index)
            .map(|r| r.id.clone());
        let Some(robot_id) = robot_id else {
            warn!(index, "switch_robot: no robot at index");
            return Err(TeleopError::RobotNotFound(index));
        };
        if !self.channel_state(ChannelKind::Control).is_open() {
            debug!(robot = %robot_id, "switch_robot: control channel not open");
            return Ok(false);
        }

        self.shared.selection.send_modify(|s| s.switching = true);
        let sent = self.send_control(&ControlRequest::SwitchRobot { robot_id });
        if !sent {
            self.shared.selection.send_modify(|s| s.switching = false);
        }
        Ok(sent)
    }

    // -----------------------------------------------------------------------
    // Fire-and-forget sends
    // -----------------------------------------------------------------------

    pub fn switch_mode(&self, mode: impl Into<String>) -> bool {
        self.send_control(&ControlRequest::SwitchMode { mode: mode.into() })
    }

    pub fn init_bridge(&self, url: impl Into<String>) -> bool {
        self.send_control(&ControlRequest::InitBridge { url: url.into() })
    }

    /// Send a velocity command on the telemetry channel.
    ///
    /// Commands over the configured rate limit are dropped.
    pub fn send_command(&self, command: VelocityCommand) -> bool {
        if let Some(limiter) = &self.limiter {
            if limiter.check().is_err() {
                debug!("send_command: rate limited");
                return false;
            }
        }
        send_json(
            ChannelKind::Telemetry,
            &self.shared.telemetry_out,
            &TelemetryRequest::Command { command },
        )
    }

    fn send_control(&self, request: &ControlRequest) -> bool {
        send_json(ChannelKind::Control, &self.shared.control_out, request)
    }

    // -----------------------------------------------------------------------
    // Subscriptions
    // -----------------------------------------------------------------------

    /// Register `callback` for every decoded point-cloud frame.
    pub fn subscribe_to_point_cloud_data<F>(&self, callback: F) -> Subscription
    where
        F: Fn(Arc<DecodedFrame>) + Send + Sync + 'static,
    {
        self.shared.hub.subscribe(callback)
    }

    pub fn frame_hub(&self) -> FrameHub {
        self.shared.hub.clone()
    }

    /// Inbound telemetry messages, parsed as JSON.
    pub fn subscribe_to_telemetry(&self) -> broadcast::Receiver<serde_json::Value> {
        self.shared.telemetry_in.subscribe()
    }

    pub fn point_cloud(&self) -> Option<Arc<PointCloudObject>> {
        self.shared.point_cloud.clone()
    }
}

impl Default for TransportManager {
    fn default() -> Self {
        Self::new(TransportConfig::default())
    }
}

impl Drop for TransportManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn send_json<T: Serialize>(kind: ChannelKind, outbound: &Outbound, message: &T) -> bool {
    let json = match to_json(message) {
        Ok(json) => json,
        Err(e) => {
            error!(channel = %kind, error = %e, "failed to encode message");
            return false;
        }
    };
    let sent = send_on(outbound, Message::Text(json.into()));
    if !sent {
        debug!(channel = %kind, "channel not open, message dropped");
    }
    sent
}

// ────────────────────────────────────────────────────────────────────────────
// Channel handlers
// ────────────────────────────────────────────────────────────────────────────

struct ControlHandler {
    signaling_url: String,
    selection: watch::Sender<SelectionState>,
}

impl ChannelHandler for ControlHandler {
    fn on_open(&mut self, outbound: &mpsc::UnboundedSender<Message>) {
        let request = ControlRequest::InitBridge {
            url: self.signaling_url.clone(),
        };
        match to_json(&request) {
            Ok(json) => {
                let _ = outbound.send(Message::Text(json.into()));
            }
            Err(e) => error!(error = %e, "failed to encode initBridge"),
        }
    }

    fn on_text(&mut self, text: &str) {
        match ControlEvent::parse(text) {
            Ok(ControlEvent::UpdateRobots { robots }) => {
                debug!(count = robots.len(), "roster updated");
                self.selection.send_modify(|s| s.roster = robots);
            }
            Ok(ControlEvent::SwitchedRobot { robot_id }) => self.on_switched(robot_id),
            Err(e) => warn!(error = %e, "ignoring control message"),
        }
    }
}

impl ControlHandler {
    fn on_switched(&self, robot_id: RobotId) {
        self.selection.send_modify(|s| {
            match s.roster.iter().find(|r| r.id == robot_id) {
                Some(robot) => {
                    info!(robot = %robot.id, name = %robot.name, "switched robot");
                    s.selected = Some(robot.clone());
                    s.session_started_at = Some(Utc::now());
                }
                None => {
                    error!(robot = %robot_id, "switched to robot missing from roster");
                    s.selected = None;
                }
            }
            s.switching = false;
        });
    }
}

struct TelemetryHandler {
    inbound: broadcast::Sender<serde_json::Value>,
}

impl ChannelHandler for TelemetryHandler {
    fn on_text(&mut self, text: &str) {
        match serde_json::from_str::<serde_json::Value>(text) {
            // No subscribers is normal.
            Ok(value) => {
                let _ = self.inbound.send(value);
            }
            Err(e) => warn!(error = %e, "ignoring non-JSON telemetry message"),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Streaming pump
// ────────────────────────────────────────────────────────────────────────────

struct StreamPump {
    shared: Arc<Shared>,
    decoder: DecoderHandle,
    events: mpsc::UnboundedReceiver<DecoderEvent>,
    endpoint: String,
    encoding: String,
    reconnect_interval: Duration,
    cancel: CancellationToken,
}

/// Relay decoder events: track streaming state, re-init after a close, and
/// fan frames out to ingestion and subscribers in arrival order.
async fn pump_stream(mut pump: StreamPump) {
    let state = &pump.shared.streaming_state;
    publish(state, &pump.cancel, ChannelState::Connecting);
    pump.decoder.init(pump.endpoint.clone(), pump.encoding.clone());

    loop {
        let event = tokio::select! {
            biased;
            _ = pump.cancel.cancelled() => break,
            event = pump.events.recv() => event,
        };
        match event {
            Some(DecoderEvent::ConnectionState(next)) => {
                publish(state, &pump.cancel, next);
                if next == ChannelState::Closed {
                    info!(
                        channel = %ChannelKind::Streaming,
                        retry_in_ms = pump.reconnect_interval.as_millis() as u64,
                        "channel down, scheduling reconnect"
                    );
                    tokio::select! {
                        _ = pump.cancel.cancelled() => break,
                        _ = tokio::time::sleep(pump.reconnect_interval) => {}
                    }
                    pump.decoder.init(pump.endpoint.clone(), pump.encoding.clone());
                }
            }
            Some(DecoderEvent::UpdatePoints(frame)) => {
                if let Some(cloud) = &pump.shared.point_cloud {
                    cloud.ingest_frame(&frame);
                }
                pump.shared.hub.publish(Arc::new(frame));
            }
            Some(DecoderEvent::Error(e)) => {
                warn!(channel = %ChannelKind::Streaming, error = %e, "frame dropped");
            }
            None => {
                error!("stream decoder exited unexpectedly");
                publish(state, &pump.cancel, ChannelState::Closed);
                break;
            }
        }
    }

    pump.decoder.terminate();
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
