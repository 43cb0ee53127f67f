//! Coordinate-frame conventions.
//!
//! Robots publish clouds in whatever axis convention their sensor driver
//! uses.  The renderer is Y-up, left-handed.  Each [`FrameConvention`] maps
//! to a fixed 3×3 [`Mat3`] that is computed once when the point-cloud object
//! is built and then applied to every incoming point.
//!
//! # Example
//!
//! ```rust
//! use teleop_perception::transform::{FrameConvention, Vec3};
//!
//! // A Z-up sensor reporting a point 1 m above the origin.
//! let m = FrameConvention::ZUpLeftHanded.matrix();
//! let p = m.apply(Vec3::new(0.0, 0.0, 1.0));
//! assert!((p.y - 1.0).abs() < 1e-5);
//! ```

use std::f32::consts::FRAC_PI_2;

use serde::{Deserialize, Serialize};

// ────────────────────────────────────────────────────────────────────────────
// Primitive types
// ────────────────────────────────────────────────────────────────────────────

/// A 3-D point or direction.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    /// The zero vector.
    pub fn zero() -> Self {
        Self::new(0.0, 0.0, 0.0)
    }

    pub fn sub(self, rhs: Self) -> Self {
        Self::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }

    pub fn length_squared(self) -> f32 {
        self.x * self.x + self.y * self.y + self.z * self.z
    }
}

/// Row-major 3×3 matrix.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Mat3 {
    pub rows: [[f32; 3]; 3],
}

impl Mat3 {
    pub fn identity() -> Self {
        Self::from_rows([[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]])
    }

    pub fn from_rows(rows: [[f32; 3]; 3]) -> Self {
        Self { rows }
    }

    /// Non-uniform scale along the three axes.
    pub fn scale(sx: f32, sy: f32, sz: f32) -> Self {
        Self::from_rows([[sx, 0.0, 0.0], [0.0, sy, 0.0], [0.0, 0.0, sz]])
    }

    /// Right-handed rotation of `angle` radians about +X.
    pub fn rotation_x(angle: f32) -> Self {
        let (s, c) = angle.sin_cos();
        Self::from_rows([[1.0, 0.0, 0.0], [0.0, c, -s], [0.0, s, c]])
    }

    /// Right-handed rotation of `angle` radians about +Y.
    pub fn rotation_y(angle: f32) -> Self {
        let (s, c) = angle.sin_cos();
        Self::from_rows([[c, 0.0, s], [0.0, 1.0, 0.0], [-s, 0.0, c]])
    }

    /// Matrix product `self · rhs`: `rhs` is applied to a vector first.
    pub fn mul(self, rhs: Self) -> Self {
        let mut out = [[0.0f32; 3]; 3];
        for (r, row) in out.iter_mut().enumerate() {
            for (c, cell) in row.iter_mut().enumerate() {
                *cell = (0..3).map(|k| self.rows[r][k] * rhs.rows[k][c]).sum();
            }
        }
        Self::from_rows(out)
    }

    pub fn apply(&self, v: Vec3) -> Vec3 {
        let [a, b, c] = self.rows;
        Vec3::new(
            a[0] * v.x + a[1] * v.y + a[2] * v.z,
            b[0] * v.x + b[1] * v.y + b[2] * v.z,
            c[0] * v.x + c[1] * v.y + c[2] * v.z,
        )
    }

    /// Transform a flat `[x0, y0, z0, x1, …]` buffer into a new buffer.
    ///
    /// A trailing partial triplet is dropped.
    pub fn apply_flat(&self, positions: &[f32]) -> Vec<f32> {
        let mut out = Vec::with_capacity(positions.len() - positions.len() % 3);
        for p in positions.chunks_exact(3) {
            let v = self.apply(Vec3::new(p[0], p[1], p[2]));
            out.extend_from_slice(&[v.x, v.y, v.z]);
        }
        out
    }
}

impl Default for Mat3 {
    fn default() -> Self {
        Self::identity()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// FrameConvention
// ────────────────────────────────────────────────────────────────────────────

/// Axis convention of the incoming cloud.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FrameConvention {
    /// Z up, left-handed (typical CAD export): `(x, y, z) → (x, z, -y)`.
    ZUpLeftHanded,
    /// Z up, right-handed (ROS sensors): `(x, y, z) → (-x, z, -y)`.
    ZUpRightHanded,
    /// Renderer-native; no conversion.
    #[default]
    YUpLeftHanded,
    /// Y up with the X axis mirrored.
    YUpRightHanded,
    /// X forward, Z up, right-handed: `(x, y, z) → (-y, z, -x)`.
    XForwardZUpRightHanded,
}

impl FrameConvention {
    pub const ALL: [FrameConvention; 5] = [
        FrameConvention::ZUpLeftHanded,
        FrameConvention::ZUpRightHanded,
        FrameConvention::YUpLeftHanded,
        FrameConvention::YUpRightHanded,
        FrameConvention::XForwardZUpRightHanded,
    ];

    /// The matrix taking points from this convention into renderer space.
    pub fn matrix(self) -> Mat3 {
        match self {
            FrameConvention::ZUpLeftHanded => Mat3::rotation_x(-FRAC_PI_2),
            FrameConvention::ZUpRightHanded => {
                Mat3::rotation_x(-FRAC_PI_2).mul(Mat3::scale(-1.0, 1.0, 1.0))
            }
            FrameConvention::YUpLeftHanded => Mat3::identity(),
            FrameConvention::YUpRightHanded => Mat3::scale(-1.0, 1.0, 1.0),
            FrameConvention::XForwardZUpRightHanded => {
                Mat3::rotation_y(FRAC_PI_2).mul(Mat3::rotation_x(-FRAC_PI_2))
            }
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
