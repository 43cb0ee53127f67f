//! Renderable point-cloud buffer.
//!
//! [`PointCloudObject`] owns the one buffer the renderer draws.  Every load
//! replaces positions and colours wholesale, re-derives the size-adaptive
//! shading parameters, and publishes the result as an immutable
//! [`Arc<PointBuffer>`] snapshot on a `watch` channel.  Readers never see a
//! half-written buffer.

use std::path::Path;
use std::sync::Arc;

use rand::Rng;
use serde::{Deserialize, Serialize};
use teleop_types::{DecodedFrame, TeleopError};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::ply::read_ply;
use crate::transform::{FrameConvention, Mat3, Vec3};

/// Shader parameters handed to the renderer alongside the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MaterialParams {
    /// Base point size in pixels.
    pub point_size: f32,
    /// Draw every point at `point_size` regardless of distance.
    pub fixed_size: bool,
    pub z_scale: f32,
    pub min_z_factor: f32,
}

impl Default for MaterialParams {
    fn default() -> Self {
        Self {
            point_size: 25.0,
            fixed_size: false,
            z_scale: 5.0,
            min_z_factor: 0.01,
        }
    }
}

impl MaterialParams {
    /// Re-derive the depth shading pair from the point count.
    ///
    /// `z_scale = max(0.5, 5 - sqrt(N / 10000))`,
    /// `min_z_factor = min(1, 1000 / N)`; an empty cloud gets `1.0`.
    pub fn adapt_to(&mut self, point_count: usize) {
        let n = point_count as f32;
        self.z_scale = (5.0 - (n / 10_000.0).sqrt()).max(0.5);
        self.min_z_factor = if point_count == 0 {
            1.0
        } else {
            (1000.0 / n).min(1.0)
        };
    }
}

/// Smallest sphere centred on the bounding-box centre that holds every point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingSphere {
    pub center: Vec3,
    pub radius: f32,
}

impl BoundingSphere {
    /// `None` for an empty buffer.
    pub fn from_positions(positions: &[f32]) -> Option<Self> {
        let mut points = positions.chunks_exact(3).map(|p| Vec3::new(p[0], p[1], p[2]));
        let first = points.next()?;
        let (min, max) = points.clone().fold((first, first), |(lo, hi), p| {
            (
                Vec3::new(lo.x.min(p.x), lo.y.min(p.y), lo.z.min(p.z)),
                Vec3::new(hi.x.max(p.x), hi.y.max(p.y), hi.z.max(p.z)),
            )
        });
        let center = Vec3::new(
            (min.x + max.x) * 0.5,
            (min.y + max.y) * 0.5,
            (min.z + max.z) * 0.5,
        );
        let radius_sq = std::iter::once(first)
            .chain(points)
            .map(|p| p.sub(center).length_squared())
            .fold(0.0f32, f32::max);
        Some(Self {
            center,
            radius: radius_sq.sqrt(),
        })
    }
}

/// One immutable snapshot of the renderable cloud.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PointBuffer {
    /// `3·N` positions in renderer space.
    pub positions: Vec<f32>,
    /// `4·N` RGBA bytes.
    pub colors: Vec<u8>,
    pub material: MaterialParams,
    /// Only maintained when frustum culling is on.
    pub bounding_sphere: Option<BoundingSphere>,
}

impl PointBuffer {
    pub fn point_count(&self) -> usize {
        self.positions.len() / 3
    }
}

/// Construction options for [`PointCloudObject`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PointCloudConfig {
    pub point_size: f32,
    pub fixed_size: bool,
    pub frame_convention: FrameConvention,
    pub frustum_culled: bool,
}

impl Default for PointCloudConfig {
    fn default() -> Self {
        Self {
            point_size: 25.0,
            fixed_size: false,
            frame_convention: FrameConvention::default(),
            frustum_culled: false,
        }
    }
}

/// Owner of the renderable point buffer.
pub struct PointCloudObject {
    frame_matrix: Mat3,
    frustum_culled: bool,
    buffer: watch::Sender<Arc<PointBuffer>>,
}

impl PointCloudObject {
    pub fn new(config: PointCloudConfig) -> Self {
        let material = MaterialParams {
            point_size: config.point_size,
            fixed_size: config.fixed_size,
            ..MaterialParams::default()
        };
        let (buffer, _) = watch::channel(Arc::new(PointBuffer {
            material,
            ..PointBuffer::default()
        }));
        Self {
            frame_matrix: config.frame_convention.matrix(),
            frustum_culled: config.frustum_culled,
            buffer,
        }
    }

    /// Receiver that observes every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Arc<PointBuffer>> {
        self.buffer.subscribe()
    }

    /// Latest published snapshot.
    pub fn snapshot(&self) -> Arc<PointBuffer> {
        self.buffer.borrow().clone()
    }

    pub fn material(&self) -> MaterialParams {
        self.buffer.borrow().material
    }

    pub fn frame_matrix(&self) -> Mat3 {
        self.frame_matrix
    }

    /// Replace the buffers wholesale.  Positions are taken as already in
    /// renderer space.
    pub fn load_from_points(&self, positions: Vec<f32>, colors: Vec<u8>) {
        let point_count = positions.len() / 3;
        let bounding_sphere = if self.frustum_culled {
            BoundingSphere::from_positions(&positions)
        } else {
            None
        };
        self.buffer.send_modify(|current| {
            let mut material = current.material;
            material.adapt_to(point_count);
            *current = Arc::new(PointBuffer {
                positions,
                colors,
                material,
                bounding_sphere,
            });
        });
    }

    /// Ingest one frame from the streaming decoder, converting positions
    /// into renderer space.
    pub fn ingest_frame(&self, frame: &DecodedFrame) {
        let positions = self.frame_matrix.apply_flat(&frame.positions.to_f32_vec());
        self.load_from_points(positions, frame.colors.clone());
    }

    /// Fill the buffer with `count` random points in the unit cube.
    pub fn load_random(&self, count: usize) {
        let mut rng = rand::rng();
        let mut positions = Vec::with_capacity(count * 3);
        let mut colors = Vec::with_capacity(count * 4);
        for _ in 0..count {
            for _ in 0..3 {
                positions.push(rng.random_range(-1.0f32..1.0));
            }
            colors.extend_from_slice(&[rng.random(), rng.random(), rng.random(), 255]);
        }
        self.load_from_points(self.frame_matrix.apply_flat(&positions), colors);
    }

    /// Load a PLY file, keeping roughly `decimation` of its points.
    ///
    /// Returns the number of points loaded.
    pub fn load_from_file(&self, path: impl AsRef<Path>, decimation: f32) -> Result<usize, TeleopError> {
        let path = path.as_ref();
        let cloud = read_ply(path)?;
        let total = cloud.point_count();
        let (positions, colors) =
            decimate(cloud.positions, cloud.colors, decimation, &mut rand::rng());
        let kept = positions.len() / 3;
        info!(path = %path.display(), total, kept, "loaded point cloud file");
        self.load_from_points(self.frame_matrix.apply_flat(&positions), colors);
        Ok(kept)
    }

    pub fn set_point_size(&self, point_size: f32) {
        self.update_material(|m| m.point_size = point_size);
    }

    pub fn set_fixed_size(&self, fixed_size: bool) {
        self.update_material(|m| m.fixed_size = fixed_size);
    }

    fn update_material(&self, f: impl FnOnce(&mut MaterialParams)) {
        self.buffer.send_modify(|current| {
            let mut next = PointBuffer::clone(current);
            f(&mut next.material);
            debug!(material = ?next.material, "material updated");
            *current = Arc::new(next);
        });
    }
}

impl Default for PointCloudObject {
    fn default() -> Self {
        Self::new(PointCloudConfig::default())
    }
}

/// Uniformly sample `floor(N · factor)` points, with replacement.
///
/// A factor of exactly `1.0` returns the input untouched.
pub fn decimate<R: Rng + ?Sized>(
    positions: Vec<f32>,
    colors: Vec<u8>,
    factor: f32,
    rng: &mut R,
) -> (Vec<f32>, Vec<u8>) {
    if factor == 1.0 {
        return (positions, colors);
    }
    let n = positions.len() / 3;
    let target = (n as f32 * factor).floor().max(0.0) as usize;
    if n == 0 || target == 0 {
        return (Vec::new(), Vec::new());
    }

    let mut out_positions = Vec::with_capacity(target * 3);
    let mut out_colors = Vec::with_capacity(target * 4);
    for _ in 0..target {
        let i = rng.random_range(0..n);
        out_positions.extend_from_slice(&positions[i * 3..i * 3 + 3]);
        match colors.get(i * 4..i * 4 + 4) {
            Some(c) => out_colors.extend_from_slice(c),
            None => out_colors.extend_from_slice(&[255, 255, 255, 255]),
        }
    }
    (out_positions, out_colors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use teleop_types::Positions;

    #[test]
    fn shading_params_follow_point_count() {
        let mut m = MaterialParams::default();
        m.adapt_to(10_000);
        assert!((m.z_scale - 4.0).abs() < 1e-6);
        assert!((m.min_z_factor - 0.1).abs() < 1e-6);

        m.adapt_to(1_000_000);
        assert_eq!(m.z_scale, 0.5);
        assert!((m.min_z_factor - 0.001).abs() < 1e-7);

        m.adapt_to(10);
        assert_eq!(m.min_z_factor, 1.0);
    }

    #[test]
    fn empty_load_is_finite() {
        let cloud = PointCloudObject::default();
        cloud.load_from_points(Vec::new(), Vec::new());
        let snap = cloud.snapshot();
        assert_eq!(snap.point_count(), 0);
        assert!(snap.colors.is_empty());
        assert!(snap.material.z_scale.is_finite());
        assert_eq!(snap.material.min_z_factor, 1.0);
    }

    #[test]
    fn load_replaces_buffers_wholesale() {
        let cloud = PointCloudObject::default();
        cloud.load_from_points(vec![0.0; 9], vec![1; 12]);
        cloud.load_from_points(vec![5.0; 3], vec![2; 4]);
        let snap = cloud.snapshot();
        assert_eq!(snap.positions, vec![5.0; 3]);
        assert_eq!(snap.colors, vec![2; 4]);
    }

    #[test]
    fn ingest_frame_applies_frame_convention() {
        let cloud = PointCloudObject::new(PointCloudConfig {
            frame_convention: FrameConvention::YUpRightHanded,
            ..PointCloudConfig::default()
        });
        let frame = DecodedFrame {
            positions: Positions::I16(vec![3, 4, 5]),
            colors: vec![9, 8, 7, 255],
        };
        cloud.ingest_frame(&frame);
        let snap = cloud.snapshot();
        assert_eq!(snap.positions, vec![-3.0, 4.0, 5.0]);
        assert_eq!(snap.colors, vec![9, 8, 7, 255]);
    }

    #[test]
    fn subscribers_see_new_snapshots() {
        let cloud = PointCloudObject::default();
        let mut rx = cloud.subscribe();
        cloud.load_random(50);
        assert!(rx.has_changed().unwrap());
        let snap = rx.borrow_and_update().clone();
        assert_eq!(snap.point_count(), 50);
        assert_eq!(snap.colors.len(), 200);
        assert!(snap.positions.iter().all(|v| (-1.0..=1.0).contains(v)));
    }

    #[test]
    fn material_setters_keep_buffers() {
        let cloud = PointCloudObject::default();
        cloud.load_from_points(vec![1.0, 2.0, 3.0], vec![0, 0, 0, 255]);
        cloud.set_point_size(4.0);
        cloud.set_fixed_size(true);
        let snap = cloud.snapshot();
        assert_eq!(snap.material.point_size, 4.0);
        assert!(snap.material.fixed_size);
        assert_eq!(snap.point_count(), 1);
    }

    #[test]
    fn bounding_sphere_only_when_culled() {
        let culled = PointCloudObject::new(PointCloudConfig {
            frustum_culled: true,
            ..PointCloudConfig::default()
        });
        culled.load_from_points(vec![-1.0, 0.0, 0.0, 3.0, 0.0, 0.0], vec![0; 8]);
        let sphere = culled.snapshot().bounding_sphere.unwrap();
        assert_eq!(sphere.center, Vec3::new(1.0, 0.0, 0.0));
        assert!((sphere.radius - 2.0).abs() < 1e-6);

        let plain = PointCloudObject::default();
        plain.load_from_points(vec![1.0, 1.0, 1.0], vec![0; 4]);
        assert!(plain.snapshot().bounding_sphere.is_none());
    }

    #[test]
    fn decimate_factor_one_is_identity() {
        let mut rng = StdRng::seed_from_u64(7);
        let (p, c) = decimate(vec![1.0, 2.0, 3.0], vec![1, 2, 3, 4], 1.0, &mut rng);
        assert_eq!(p, vec![1.0, 2.0, 3.0]);
        assert_eq!(c, vec![1, 2, 3, 4]);
    }

    #[test]
    fn decimate_samples_floor_of_factor() {
        let mut rng = StdRng::seed_from_u64(7);
        let positions: Vec<f32> = (0..30).map(|v| v as f32).collect();
        let colors: Vec<u8> = (0..40).collect();
        let (p, c) = decimate(positions, colors, 0.55, &mut rng);
        assert_eq!(p.len(), 5 * 3);
        assert_eq!(c.len(), 5 * 4);
        // Each sampled point keeps its own colour.
        for (pos, col) in p.chunks_exact(3).zip(c.chunks_exact(4)) {
            let i = pos[0] as usize / 3;
            assert_eq!(col[0] as usize, i * 4);
        }
    }

    #[test]
    fn load_from_file_decimates_and_transforms() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan.ply");
        std::fs::write(
            &path,
            "ply\nformat ascii 1.0\nelement vertex 2\nproperty float x\nproperty float y\nproperty float z\nend_header\n1 2 3\n4 5 6\n",
        )
        .unwrap();

        let cloud = PointCloudObject::new(PointCloudConfig {
            frame_convention: FrameConvention::YUpRightHanded,
            ..PointCloudConfig::default()
        });
        assert_eq!(cloud.load_from_file(&path, 1.0).unwrap(), 2);
        assert_eq!(cloud.snapshot().positions, vec![-1.0, 2.0, 3.0, -4.0, 5.0, 6.0]);
        assert_eq!(cloud.load_from_file(&path, 0.5).unwrap(), 1);
    }
}
