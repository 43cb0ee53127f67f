//! Round-trip latency measurement.
//!
//! The engine sends a distinctive velocity command (`linear.z = 1`) that the
//! robot side answers by painting its next point cloud in a known colour, or
//! by zeroing its positions.  The time from sending the command to the first
//! decoded frame carrying that signature is one latency sample.
//!
//! ```text
//!            test_once / start_continuous_test
//!   Idle ─────────────────────────────────────▶ Armed
//!    ▲                                            │
//!    │  match (single) / abort / stop             │ match (continuous):
//!    └────────────────────────────────────────────┤ record, re-arm
//!                                                 ▼
//!                                               Armed
//! ```
//!
//! An armed cycle never times out; use
//! [`abort_current_test`](LatencyTestEngine::abort_current_test) to give up
//! on it.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use teleop_transport::{FrameHub, Subscription, TransportManager};
use teleop_types::{ChannelKind, DecodedFrame, TeleopError, Vector3, VelocityCommand};
use tracing::{debug, error, info, warn};

use crate::clock::{ClockAnchor, TimeSync};

/// Number of leading array elements inspected when matching a frame.
pub const PROBE_WINDOW: usize = 100;

/// The command that asks the robot to mark its next frame.
pub fn trigger_command() -> VelocityCommand {
    VelocityCommand {
        linear: Vector3::new(0.0, 0.0, 1.0),
        angular: Vector3::default(),
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Collaborators
// ────────────────────────────────────────────────────────────────────────────

/// Where trigger commands go.
pub trait CommandSink: Send + Sync {
    /// `true` when the command was handed to an open channel.
    fn send_command(&self, command: VelocityCommand) -> bool;

    /// Start of the current robot session, used to name exports.
    fn session_started_at(&self) -> Option<DateTime<Utc>> {
        None
    }
}

impl CommandSink for TransportManager {
    fn send_command(&self, command: VelocityCommand) -> bool {
        TransportManager::send_command(self, command)
    }

    fn session_started_at(&self) -> Option<DateTime<Utc>> {
        TransportManager::session_started_at(self)
    }
}

/// Results of a finished continuous session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatencyReport {
    pub session_started_at: Option<DateTime<Utc>>,
    pub results: Vec<LatencyResult>,
}

/// Receives the results when a continuous session stops.
pub trait ExportSink: Send + Sync {
    fn export(&self, report: &LatencyReport) -> Result<(), TeleopError>;
}

// ────────────────────────────────────────────────────────────────────────────
// Results
// ────────────────────────────────────────────────────────────────────────────

/// Why a frame counted as the answer to a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchReason {
    /// Every probed colour equals the target RGB.
    TargetColor,
    /// Every probed position is exactly zero.
    ZeroedPositions,
    /// An operator confirmed the frame by hand.
    Manual,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatencyResult {
    /// Corrected wall-clock time of the match, Unix milliseconds.
    pub timestamp_ms: f64,
    pub latency_ms: f64,
    /// Trigger this result answers.
    pub id: u64,
    pub manual: bool,
    pub reason: MatchReason,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LatencyTestConfig {
    /// RGB the robot paints a marked frame with.
    pub target_color: [u8; 3],
}

impl Default for LatencyTestConfig {
    fn default() -> Self {
        Self {
            target_color: [0, 255, 0],
        }
    }
}

/// Does `frame` carry the marker signature?
///
/// Only the first [`PROBE_WINDOW`] elements of each array are inspected.
/// Empty frames never match, nor do arrays that are not whole RGBA / XYZ
/// groups.
pub fn match_frame(frame: &DecodedFrame, target: [u8; 3]) -> Option<MatchReason> {
    if colors_match(&frame.colors, target) {
        Some(MatchReason::TargetColor)
    } else if positions_zeroed(frame) {
        Some(MatchReason::ZeroedPositions)
    } else {
        None
    }
}

fn colors_match(colors: &[u8], [r, g, b]: [u8; 3]) -> bool {
    if colors.is_empty() || colors.len() % 4 != 0 {
        return false;
    }
    let window = &colors[..colors.len().min(PROBE_WINDOW)];
    window.chunks(4).all(|c| c.len() >= 3 && c[0] == r && c[1] == g && c[2] == b)
}

fn positions_zeroed(frame: &DecodedFrame) -> bool {
    let len = frame.positions.len();
    if len == 0 || len % 3 != 0 {
        return false;
    }
    (0..len.min(PROBE_WINDOW))
        .step_by(3)
        .all(|i| (i..i + 3).all(|j| frame.positions.get(j) == Some(0.0)))
}

// ────────────────────────────────────────────────────────────────────────────
// Engine
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct EngineState {
    test_id: u64,
    /// Set while Armed.
    armed_at: Option<Instant>,
    continuous: bool,
    results: Vec<LatencyResult>,
    last_latency: Option<f64>,
    anchor: Option<ClockAnchor>,
}

pub struct LatencyTestEngine {
    config: LatencyTestConfig,
    commands: Arc<dyn CommandSink>,
    export: Option<Arc<dyn ExportSink>>,
    time_sync: Option<Arc<dyn TimeSync>>,
    state: Mutex<EngineState>,
}

impl LatencyTestEngine {
    pub fn new(config: LatencyTestConfig, commands: Arc<dyn CommandSink>) -> Self {
        Self {
            config,
            commands,
            export: None,
            time_sync: None,
            state: Mutex::new(EngineState::default()),
        }
    }

    pub fn with_export(mut self, sink: Arc<dyn ExportSink>) -> Self {
        self.export = Some(sink);
        self
    }

    pub fn with_time_sync(mut self, sync: Arc<dyn TimeSync>) -> Self {
        self.time_sync = Some(sync);
        self
    }

    /// Feed every frame published on `hub` into the engine.
    ///
    /// The subscription holds only a weak reference to the engine.
    pub fn attach(self: &Arc<Self>, hub: &FrameHub) -> Subscription {
        let engine: Weak<Self> = Arc::downgrade(self);
        hub.subscribe(move |frame| {
            if let Some(engine) = engine.upgrade() {
                engine.on_frame(&frame);
            }
        })
    }

    fn state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Send the trigger and arm.  The caller holds the state lock.
    fn arm(&self, state: &mut EngineState) -> Result<u64, TeleopError> {
        let armed_at = Instant::now();
        if !self.commands.send_command(trigger_command()) {
            return Err(TeleopError::Connection {
                channel: ChannelKind::Telemetry,
                details: "trigger command not sent".to_string(),
            });
        }
        state.test_id += 1;
        state.armed_at = Some(armed_at);
        info!(test_id = state.test_id, "latency test triggered");
        Ok(state.test_id)
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    /// Run a single measurement.  Returns the new test id.
    pub fn test_once(&self) -> Result<u64, TeleopError> {
        let mut state = self.state();
        if state.armed_at.is_some() {
            warn!(test_id = state.test_id, "test_once: a test cycle is already in progress");
            return Err(TeleopError::Usage("a test cycle is already in progress".to_string()));
        }
        if state.continuous {
            warn!("test_once: continuous testing is active");
            return Err(TeleopError::Usage(
                "continuous testing is active; stop it first".to_string(),
            ));
        }
        self.arm(&mut state)
    }

    /// Clear previous results, anchor the session clock and arm the first
    /// cycle.
    pub fn start_continuous_test(&self) -> Result<u64, TeleopError> {
        let mut state = self.state();
        if state.armed_at.is_some() {
            warn!("start_continuous_test: a test cycle is already in progress");
            return Err(TeleopError::Usage(
                "cannot start continuous testing while a test is in progress".to_string(),
            ));
        }
        let anchor = ClockAnchor::from_sync(self.time_sync.as_deref());
        info!(anchor = %anchor.wall().to_rfc3339(), "continuous latency testing enabled");
        state.continuous = true;
        state.results.clear();
        state.anchor = Some(anchor);

        self.arm(&mut state).inspect_err(|e| {
            error!(error = %e, "failed to start the first continuous test");
            state.continuous = false;
        })
    }

    /// Disable continuous mode, disarm, and hand any results to the export
    /// sink.  Returns how many results were handed over.
    ///
    /// Results are taken before exporting, so a second call never exports
    /// the same data again.
    pub fn stop_continuous_test(&self) -> Result<usize, TeleopError> {
        let results = {
            let mut state = self.state();
            state.continuous = false;
            state.armed_at = None;
            std::mem::take(&mut state.results)
        };
        info!("continuous latency testing disabled");
        if results.is_empty() {
            return Ok(0);
        }

        let count = results.len();
        let report = LatencyReport {
            session_started_at: self.commands.session_started_at(),
            results,
        };
        match &self.export {
            Some(sink) => sink.export(&report)?,
            None => warn!(count, "no export sink configured; results discarded"),
        }
        Ok(count)
    }

    /// Give up on the armed cycle without recording.  Also ends a continuous
    /// chain, since nothing re-arms it.  Returns `false` when idle.
    pub fn abort_current_test(&self) -> bool {
        let mut state = self.state();
        if state.armed_at.take().is_some() {
            info!(test_id = state.test_id, "aborting current latency test");
            true
        } else {
            debug!("abort_current_test: no active test");
            false
        }
    }

    /// Operator confirmation that the marked frame is on screen.
    pub fn manual_color_frame_received(&self) -> Option<LatencyResult> {
        let result = self.complete(MatchReason::Manual);
        if result.is_none() {
            warn!("manual_color_frame_received: no test cycle is armed");
        }
        result
    }

    /// Inspect one decoded frame.  Returns the recorded result on a match.
    pub fn on_frame(&self, frame: &DecodedFrame) -> Option<LatencyResult> {
        if !self.is_testing() {
            return None;
        }
        let reason = match_frame(frame, self.config.target_color)?;
        self.complete(reason)
    }

    fn complete(&self, reason: MatchReason) -> Option<LatencyResult> {
        let now = Instant::now();
        let mut state = self.state();
        let armed_at = state.armed_at.take()?;

        let latency_ms = now.saturating_duration_since(armed_at).as_secs_f64() * 1000.0;
        let timestamp_ms = match &state.anchor {
            Some(anchor) => anchor.timestamp_ms(now),
            None => Utc::now().timestamp_millis() as f64,
        };
        let result = LatencyResult {
            timestamp_ms,
            latency_ms,
            id: state.test_id,
            manual: reason == MatchReason::Manual,
            reason,
        };
        info!(
            test_id = result.id,
            latency_ms,
            reason = ?reason,
            "latency sample recorded"
        );
        state.last_latency = Some(latency_ms);
        state.results.push(result.clone());

        if state.continuous {
            if let Err(e) = self.arm(&mut state) {
                error!(error = %e, "failed to re-arm continuous test; disabling");
                state.continuous = false;
            }
        }
        Some(result)
    }

    pub fn clear_results(&self) {
        self.state().results.clear();
    }

    // -----------------------------------------------------------------------
    // Read-outs
    // -----------------------------------------------------------------------

    /// Armed, waiting for the marked frame.
    pub fn is_testing(&self) -> bool {
        self.state().armed_at.is_some()
    }

    pub fn is_continuous(&self) -> bool {
        self.state().continuous
    }

    pub fn test_id(&self) -> u64 {
        self.state().test_id
    }

    pub fn last_latency(&self) -> Option<f64> {
        self.state().last_latency
    }

    /// Mean of the recorded latencies, `0.0` when there are none.
    pub fn average_latency(&self) -> f64 {
        let state = self.state();
        if state.results.is_empty() {
            return 0.0;
        }
        state.results.iter().map(|r| r.latency_ms).sum::<f64>() / state.results.len() as f64
    }

    pub fn results(&self) -> Vec<LatencyResult> {
        self.state().results.clone()
    }

    pub fn target_color(&self) -> [u8; 3] {
        self.config.target_color
    }
}
