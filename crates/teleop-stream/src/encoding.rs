//! Point-cloud wire encodings.
//!
//! Every frame on the streaming socket is one flat buffer: all `N` positions
//! first, then all `N` color slots, little-endian.  [`WireEncoding`] fixes the
//! layout for the lifetime of one streaming configuration.
//!
//! | Tag | Bytes/pt | Positions | Colors |
//! |---|---|---|---|
//! | `XYZ_RGBA_f32` | 16 | `f32` ×3 | RGBA bytes in one 32-bit slot |
//! | `XYZ_RGBA_f32_NaN` | 16 | `f32` ×3 | RGBA bytes in one 32-bit slot |
//! | `XYZ_RGBA_i16` | 10 | `i16` ×3 | RGBA bytes |
//! | `XYZ_RGBA_i16_NaN` | 10 | `i16` ×3 | RGBA bytes |
//! | `XYZ_RGB16_i16` | 8 | `i16` ×3 | `u16` packed 6-6-4 RGB |
//! | `XYZ_RGB8_i16` | 7 | `i16` ×3 | `u8` packed 3-3-2 RGB, optional pad byte |

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use teleop_types::{DecodeError, DecodedFrame, Positions};

/// Scalar type of the position triplets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionType {
    F32,
    I16,
}

impl PositionType {
    /// Bytes taken by one `(x, y, z)` triplet.
    pub fn triplet_bytes(self) -> usize {
        match self {
            PositionType::F32 => 12,
            PositionType::I16 => 6,
        }
    }
}

/// How one point's color is stored on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorPacking {
    /// Four bytes R, G, B, A.
    Rgba8,
    /// One little-endian `u16`: 6 bits red, 6 bits green, 4 bits blue.
    Rgb16Packed,
    /// One byte: 3 bits red, 3 bits green, 2 bits blue.
    Rgb8Packed,
}

impl ColorPacking {
    pub fn bytes(self) -> usize {
        match self {
            ColorPacking::Rgba8 => 4,
            ColorPacking::Rgb16Packed => 2,
            ColorPacking::Rgb8Packed => 1,
        }
    }
}

/// Closed set of binary layouts understood by the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum WireEncoding {
    #[serde(rename = "XYZ_RGBA_f32")]
    XyzRgbaF32,
    #[default]
    #[serde(rename = "XYZ_RGBA_f32_NaN")]
    XyzRgbaF32NaN,
    #[serde(rename = "XYZ_RGBA_i16")]
    XyzRgbaI16,
    #[serde(rename = "XYZ_RGBA_i16_NaN")]
    XyzRgbaI16NaN,
    #[serde(rename = "XYZ_RGB16_i16")]
    XyzRgb16I16,
    #[serde(rename = "XYZ_RGB8_i16")]
    XyzRgb8I16,
}

impl WireEncoding {
    pub const ALL: [WireEncoding; 6] = [
        WireEncoding::XyzRgbaF32,
        WireEncoding::XyzRgbaF32NaN,
        WireEncoding::XyzRgbaI16,
        WireEncoding::XyzRgbaI16NaN,
        WireEncoding::XyzRgb16I16,
        WireEncoding::XyzRgb8I16,
    ];

    /// The tag used in configuration and on the control surface.
    pub fn tag(self) -> &'static str {
        match self {
            WireEncoding::XyzRgbaF32 => "XYZ_RGBA_f32",
            WireEncoding::XyzRgbaF32NaN => "XYZ_RGBA_f32_NaN",
            WireEncoding::XyzRgbaI16 => "XYZ_RGBA_i16",
            WireEncoding::XyzRgbaI16NaN => "XYZ_RGBA_i16_NaN",
            WireEncoding::XyzRgb16I16 => "XYZ_RGB16_i16",
            WireEncoding::XyzRgb8I16 => "XYZ_RGB8_i16",
        }
    }

    pub fn position_type(self) -> PositionType {
        match self {
            WireEncoding::XyzRgbaF32 | WireEncoding::XyzRgbaF32NaN => PositionType::F32,
            WireEncoding::XyzRgbaI16
            | WireEncoding::XyzRgbaI16NaN
            | WireEncoding::XyzRgb16I16
            | WireEncoding::XyzRgb8I16 => PositionType::I16,
        }
    }

    pub fn color_packing(self) -> ColorPacking {
        match self {
            WireEncoding::XyzRgbaF32
            | WireEncoding::XyzRgbaF32NaN
            | WireEncoding::XyzRgbaI16
            | WireEncoding::XyzRgbaI16NaN => ColorPacking::Rgba8,
            WireEncoding::XyzRgb16I16 => ColorPacking::Rgb16Packed,
            WireEncoding::XyzRgb8I16 => ColorPacking::Rgb8Packed,
        }
    }

    pub fn bytes_per_point(self) -> usize {
        self.position_type().triplet_bytes() + self.color_packing().bytes()
    }

    /// Number of whole points carried by a buffer of `len` bytes.
    ///
    /// `XYZ_RGB8_i16` frames may carry one trailing pad byte.
    pub fn point_count(self, len: usize) -> usize {
        match self {
            WireEncoding::XyzRgb8I16 => {
                if len % 7 == 0 {
                    len / 7
                } else {
                    len.saturating_sub(1) / 7
                }
            }
            _ => len / self.bytes_per_point(),
        }
    }

    /// Decode one raw frame.
    pub fn decode(self, buffer: &[u8]) -> DecodedFrame {
        let n = self.point_count(buffer.len());
        let position_bytes = n * self.position_type().triplet_bytes();
        let (position_region, color_region) = buffer.split_at(position_bytes);

        let positions = match self.position_type() {
            PositionType::F32 => Positions::F32(
                position_region
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            ),
            PositionType::I16 => Positions::I16(
                position_region
                    .chunks_exact(2)
                    .map(|c| i16::from_le_bytes([c[0], c[1]]))
                    .collect(),
            ),
        };

        let color_region = &color_region[..n * self.color_packing().bytes()];
        let colors = match self.color_packing() {
            ColorPacking::Rgba8 => color_region.to_vec(),
            ColorPacking::Rgb16Packed => color_region
                .chunks_exact(2)
                .flat_map(|c| unpack_rgb16(u16::from_le_bytes([c[0], c[1]])))
                .collect(),
            ColorPacking::Rgb8Packed => {
                color_region.iter().flat_map(|&c| unpack_rgb8(c)).collect()
            }
        };

        DecodedFrame { positions, colors }
    }
}

impl fmt::Display for WireEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for WireEncoding {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WireEncoding::ALL
            .into_iter()
            .find(|e| e.tag() == s)
            .ok_or_else(|| DecodeError::UnknownEncoding(s.to_string()))
    }
}

/// Decode `buffer` with the encoding named by `tag`.
///
/// Unknown tags are the only failure mode; the caller is expected to keep
/// accepting frames afterwards.
pub fn decode_tagged(tag: &str, buffer: &[u8]) -> Result<DecodedFrame, DecodeError> {
    Ok(tag.parse::<WireEncoding>()?.decode(buffer))
}

/// Expand a channel value in `0..=max` to 0–255 (truncating).
pub fn scale_channel(value: u16, max: u16) -> u8 {
    (f32::from(value) / f32::from(max) * 255.0) as u8
}

/// Unpack a 6-6-4 RGB word into RGBA bytes with opaque alpha.
pub fn unpack_rgb16(word: u16) -> [u8; 4] {
    [
        scale_channel((word >> 10) & 0b11_1111, 63),
        scale_channel((word >> 4) & 0b11_1111, 63),
        scale_channel(word & 0b1111, 15),
        255,
    ]
}

/// Unpack a 3-3-2 RGB byte into RGBA bytes with opaque alpha.
pub fn unpack_rgb8(byte: u8) -> [u8; 4] {
    let byte = u16::from(byte);
    [
        scale_channel((byte >> 5) & 0b111, 7),
        scale_channel((byte >> 2) & 0b111, 7),
        scale_channel(byte & 0b11, 3),
        255,
    ]
}
