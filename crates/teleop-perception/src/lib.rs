//! `teleop-perception` – Point-cloud ingestion.
//!
//! Takes decoded stream frames (or offline files) and turns them into the
//! buffer the renderer draws.
//!
//! # Modules
//!
//! - [`transform`] – [`FrameConvention`][transform::FrameConvention]: the five
//!   supported axis conventions and their precomputed 3×3 matrices.
//! - [`point_cloud`] – [`PointCloudObject`][point_cloud::PointCloudObject]:
//!   owns the renderable buffer, derives size-adaptive shading parameters and
//!   publishes immutable snapshots.
//! - [`ply`] – Reader for ascii and binary little-endian PLY files.

pub mod ply;
pub mod point_cloud;
pub mod transform;

pub use point_cloud::{MaterialParams, PointBuffer, PointCloudConfig, PointCloudObject};
pub use transform::FrameConvention;
