//! `teleop-transport` – Backend connectivity
//!
//! Keeps the console connected to the robot backend and routes what comes
//! back without caring what the robot does with it.
//!
//! # Modules
//!
//! - [`manager`] – [`TransportManager`]: owns the control, telemetry and
//!   streaming channels, the robot roster and the selection state.
//! - [`hub`] – [`FrameHub`]: in-process fan-out of decoded point-cloud
//!   frames to any number of subscribers.
//! - [`protocol`] – JSON message shapes of the control and telemetry
//!   channels.

mod channel;
pub mod hub;
pub mod manager;
pub mod protocol;

pub use hub::{FrameCallback, FrameHub, Subscription};
pub use manager::{Endpoints, SelectionState, TransportConfig, TransportManager};
