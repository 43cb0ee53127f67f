//! `teleop-runtime` – session-level services built on the transport.
//!
//! # Modules
//!
//! - [`latency`] – [`LatencyTestEngine`]: measures the round trip from a
//!   trigger command to the first point-cloud frame that carries the robot's
//!   marker, singly or as a continuous series.
//! - [`clock`] – [`ClockAnchor`]: wall-clock timestamps derived from the
//!   monotonic clock, optionally anchored to an external [`TimeSync`].
//! - [`export`] – CSV rendering and file naming for latency results.
//! - [`telemetry`] – [`init_tracing`]: global `tracing` subscriber with an
//!   optional OTLP span exporter.

pub mod clock;
pub mod export;
pub mod latency;
pub mod telemetry;

pub use clock::{ClockAnchor, TimeSync};
pub use export::{CSV_HEADER, export_file_name, render_csv};
pub use latency::{
    CommandSink, ExportSink, LatencyReport, LatencyResult, LatencyTestConfig, LatencyTestEngine,
    MatchReason, match_frame,
};
pub use telemetry::{LogFormat, TracerProviderGuard, init_tracing};
