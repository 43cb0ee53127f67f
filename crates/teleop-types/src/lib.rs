use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The three persistent connections held by the console.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelKind {
    /// JSON request/response channel used for roster and robot selection.
    Control,
    /// JSON command channel carrying velocity commands to the robot.
    Telemetry,
    /// Binary point-cloud stream, owned by the decoder worker.
    Streaming,
}

impl ChannelKind {
    pub const ALL: [ChannelKind; 3] = [
        ChannelKind::Control,
        ChannelKind::Telemetry,
        ChannelKind::Streaming,
    ];
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelKind::Control => write!(f, "control"),
            ChannelKind::Telemetry => write!(f, "telemetry"),
            ChannelKind::Streaming => write!(f, "streaming"),
        }
    }
}

/// Lifecycle state of a single channel.
///
/// Within one connection attempt the state only moves forward:
/// `Connecting → Open → Closed` or `Connecting → Error → Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ChannelState {
    #[default]
    Initializing,
    Connecting,
    Open,
    Closed,
    Error,
}

impl ChannelState {
    pub fn is_open(self) -> bool {
        self == ChannelState::Open
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChannelState::Initializing => "Initializing",
            ChannelState::Connecting => "Connecting",
            ChannelState::Open => "Open",
            ChannelState::Closed => "Closed",
            ChannelState::Error => "Error",
        };
        f.write_str(s)
    }
}

/// Opaque robot identifier as issued by the backend.
///
/// The backend is not consistent about sending ids as strings or numbers, so
/// two ids compare equal when their textual forms match (`7 == "7"`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RobotId {
    Number(i64),
    Text(String),
}

impl RobotId {
    fn key(&self) -> std::borrow::Cow<'_, str> {
        match self {
            RobotId::Number(n) => std::borrow::Cow::Owned(n.to_string()),
            RobotId::Text(s) => std::borrow::Cow::Borrowed(s.as_str()),
        }
    }
}

impl PartialEq for RobotId {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for RobotId {}

impl Hash for RobotId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl fmt::Display for RobotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

impl From<&str> for RobotId {
    fn from(s: &str) -> Self {
        RobotId::Text(s.to_string())
    }
}

impl From<i64> for RobotId {
    fn from(n: i64) -> Self {
        RobotId::Number(n)
    }
}

/// One controllable robot as listed in the backend roster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RobotRecord {
    pub id: RobotId,
    #[serde(default)]
    pub name: String,
    /// Battery charge in percent, absent when the robot does not report it.
    #[serde(default)]
    pub battery: Option<f32>,
    /// Backend connection ordinal, 0–5.
    #[serde(default)]
    pub connection_state: u8,
    #[serde(default)]
    pub description: String,
}

/// Cartesian triple used by [`VelocityCommand`].
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vector3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vector3 {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }
}

/// `geometry_msgs/Twist`-shaped command sent over the telemetry channel.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct VelocityCommand {
    pub linear: Vector3,
    pub angular: Vector3,
}

impl VelocityCommand {
    /// Differential drive command: forward speed and yaw rate.
    pub fn drive(linear_x: f64, angular_z: f64) -> Self {
        Self {
            linear: Vector3::new(linear_x, 0.0, 0.0),
            angular: Vector3::new(0.0, 0.0, angular_z),
        }
    }
}

/// Position payload of a decoded frame, in the numeric type of the wire
/// encoding.
#[derive(Debug, Clone, PartialEq)]
pub enum Positions {
    F32(Vec<f32>),
    I16(Vec<i16>),
}

impl Positions {
    /// Number of scalar elements (3 per point).
    pub fn len(&self) -> usize {
        match self {
            Positions::F32(v) => v.len(),
            Positions::I16(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Element `i` widened to `f32`.
    pub fn get(&self, i: usize) -> Option<f32> {
        match self {
            Positions::F32(v) => v.get(i).copied(),
            Positions::I16(v) => v.get(i).map(|&x| f32::from(x)),
        }
    }

    /// Copy of all elements widened to `f32`.
    pub fn to_f32_vec(&self) -> Vec<f32> {
        match self {
            Positions::F32(v) => v.clone(),
            Positions::I16(v) => v.iter().map(|&x| f32::from(x)).collect(),
        }
    }
}

/// A decoded point-cloud frame: `3·N` positions and `4·N` RGBA bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedFrame {
    pub positions: Positions,
    pub colors: Vec<u8>,
}

impl DecodedFrame {
    pub fn point_count(&self) -> usize {
        self.colors.len() / 4
    }

    pub fn is_empty(&self) -> bool {
        self.point_count() == 0
    }
}

/// Failure to decode a streaming frame. The decoder stays alive after any of
/// these.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecodeError {
    #[error("Invalid decoder: {0}")]
    UnknownEncoding(String),
}

/// Workspace-wide error type.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TeleopError {
    #[error("Connection error on {channel} channel: {details}")]
    Connection { channel: ChannelKind, details: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Rejected: {0}")]
    Usage(String),

    #[error("Robot at index {0} not found in current roster")]
    RobotNotFound(usize),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Unsupported point-cloud file: {0}")]
    Format(String),
}

impl From<std::io::Error> for TeleopError {
    fn from(e: std::io::Error) -> Self {
        TeleopError::Io(e.to_string())
    }
}
