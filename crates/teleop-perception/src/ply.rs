//! Minimal PLY reader for offline point clouds.
//!
//! Reads the `vertex` element of `ascii` and `binary_little_endian` files:
//! `x`/`y`/`z` positions and, when present, `red`/`green`/`blue`(/`alpha`)
//! colours.  Faces and other elements are ignored.  Files without colour
//! come back white.

use std::path::Path;

use teleop_types::TeleopError;

/// Positions (`3·N`, f32) and RGBA colours (`4·N`, u8) read from a file.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PlyCloud {
    pub positions: Vec<f32>,
    pub colors: Vec<u8>,
}

impl PlyCloud {
    pub fn point_count(&self) -> usize {
        self.positions.len() / 3
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Ascii,
    BinaryLittleEndian,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scalar {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    F32,
    F64,
}

impl Scalar {
    fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "char" | "int8" => Scalar::I8,
            "uchar" | "uint8" => Scalar::U8,
            "short" | "int16" => Scalar::I16,
            "ushort" | "uint16" => Scalar::U16,
            "int" | "int32" => Scalar::I32,
            "uint" | "uint32" => Scalar::U32,
            "float" | "float32" => Scalar::F32,
            "double" | "float64" => Scalar::F64,
            _ => return None,
        })
    }

    fn size(self) -> usize {
        match self {
            Scalar::I8 | Scalar::U8 => 1,
            Scalar::I16 | Scalar::U16 => 2,
            Scalar::I32 | Scalar::U32 | Scalar::F32 => 4,
            Scalar::F64 => 8,
        }
    }

    fn read_le(self, b: &[u8]) -> f64 {
        match self {
            Scalar::I8 => f64::from(b[0] as i8),
            Scalar::U8 => f64::from(b[0]),
            Scalar::I16 => f64::from(i16::from_le_bytes([b[0], b[1]])),
            Scalar::U16 => f64::from(u16::from_le_bytes([b[0], b[1]])),
            Scalar::I32 => f64::from(i32::from_le_bytes([b[0], b[1], b[2], b[3]])),
            Scalar::U32 => f64::from(u32::from_le_bytes([b[0], b[1], b[2], b[3]])),
            Scalar::F32 => f64::from(f32::from_le_bytes([b[0], b[1], b[2], b[3]])),
            Scalar::F64 => f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]),
        }
    }

    fn is_float(self) -> bool {
        matches!(self, Scalar::F32 | Scalar::F64)
    }
}

#[derive(Debug)]
struct Property {
    name: String,
    scalar: Scalar,
}

#[derive(Debug)]
struct Element {
    name: String,
    count: usize,
    properties: Vec<Property>,
    has_list: bool,
}

impl Element {
    fn stride(&self) -> usize {
        self.properties.iter().map(|p| p.scalar.size()).sum()
    }

    fn index_of(&self, name: &str) -> Option<usize> {
        self.properties.iter().position(|p| p.name == name)
    }
}

struct Header {
    format: Format,
    elements: Vec<Element>,
    body_offset: usize,
}

fn format_err(msg: impl Into<String>) -> TeleopError {
    TeleopError::Format(msg.into())
}

/// Read a PLY file from disk.
pub fn read_ply(path: impl AsRef<Path>) -> Result<PlyCloud, TeleopError> {
    let bytes = std::fs::read(path)?;
    parse_ply(&bytes)
}

/// Parse an in-memory PLY file.
pub fn parse_ply(bytes: &[u8]) -> Result<PlyCloud, TeleopError> {
    let header = parse_header(bytes)?;
    let body = &bytes[header.body_offset..];
    match header.format {
        Format::Ascii => read_ascii(&header, body),
        Format::BinaryLittleEndian => read_binary(&header, body),
    }
}

fn parse_header(bytes: &[u8]) -> Result<Header, TeleopError> {
    const END: &[u8] = b"end_header";
    let end = bytes
        .windows(END.len())
        .position(|w| w == END)
        .ok_or_else(|| format_err("missing end_header"))?;
    let body_offset = bytes[end..]
        .iter()
        .position(|&b| b == b'\n')
        .map(|i| end + i + 1)
        .unwrap_or(bytes.len());

    let text = std::str::from_utf8(&bytes[..end]).map_err(|_| format_err("header is not UTF-8"))?;
    let mut lines = text.lines().map(str::trim);
    if lines.next() != Some("ply") {
        return Err(format_err("missing ply magic"));
    }

    let mut format = None;
    let mut elements: Vec<Element> = Vec::new();
    for line in lines {
        let mut words = line.split_whitespace();
        match words.next() {
            Some("format") => {
                format = Some(match words.next() {
                    Some("ascii") => Format::Ascii,
                    Some("binary_little_endian") => Format::BinaryLittleEndian,
                    other => {
                        return Err(format_err(format!(
                            "unsupported format {}",
                            other.unwrap_or("<none>")
                        )));
                    }
                });
            }
            Some("element") => {
                let name = words.next().ok_or_else(|| format_err("element without name"))?;
                let count = words
                    .next()
                    .and_then(|c| c.parse().ok())
                    .ok_or_else(|| format_err(format!("element {name} without count")))?;
                elements.push(Element {
                    name: name.to_string(),
                    count,
                    properties: Vec::new(),
                    has_list: false,
                });
            }
            Some("property") => {
                let element = elements
                    .last_mut()
                    .ok_or_else(|| format_err("property before any element"))?;
                let ty = words.next().unwrap_or_default();
                if ty == "list" {
                    element.has_list = true;
                    continue;
                }
                let scalar = Scalar::parse(ty)
                    .ok_or_else(|| format_err(format!("unknown property type {ty}")))?;
                let name = words.next().ok_or_else(|| format_err("property without name"))?;
                element.properties.push(Property {
                    name: name.to_string(),
                    scalar,
                });
            }
            _ => {}
        }
    }

    Ok(Header {
        format: format.ok_or_else(|| format_err("missing format line"))?,
        elements,
        body_offset,
    })
}

/// Column indices of the vertex properties we care about.
struct VertexLayout {
    xyz: [usize; 3],
    rgb: Option<[usize; 3]>,
    alpha: Option<usize>,
}

impl VertexLayout {
    fn of(element: &Element) -> Result<Self, TeleopError> {
        let find = |n: &str| element.index_of(n);
        let xyz = match (find("x"), find("y"), find("z")) {
            (Some(x), Some(y), Some(z)) => [x, y, z],
            _ => return Err(format_err("vertex element lacks x/y/z")),
        };
        let rgb = match (find("red"), find("green"), find("blue")) {
            (Some(r), Some(g), Some(b)) => Some([r, g, b]),
            _ => None,
        };
        Ok(Self {
            xyz,
            rgb,
            alpha: find("alpha"),
        })
    }

    fn push(&self, element: &Element, row: &[f64], cloud: &mut PlyCloud) {
        for i in self.xyz {
            cloud.positions.push(row[i] as f32);
        }
        match self.rgb {
            Some(rgb) => {
                for i in rgb {
                    cloud.colors.push(color_byte(element.properties[i].scalar, row[i]));
                }
                let a = self
                    .alpha
                    .map(|i| color_byte(element.properties[i].scalar, row[i]))
                    .unwrap_or(255);
                cloud.colors.push(a);
            }
            None => cloud.colors.extend_from_slice(&[255, 255, 255, 255]),
        }
    }
}

/// Float colour channels are normalised 0–1, integer ones are already bytes.
fn color_byte(scalar: Scalar, v: f64) -> u8 {
    if scalar.is_float() {
        (v.clamp(0.0, 1.0) * 255.0) as u8
    } else {
        v.clamp(0.0, 255.0) as u8
    }
}

fn find_vertex(header: &Header) -> Result<usize, TeleopError> {
    header
        .elements
        .iter()
        .position(|e| e.name == "vertex")
        .ok_or_else(|| format_err("no vertex element"))
}

fn read_ascii(header: &Header, body: &[u8]) -> Result<PlyCloud, TeleopError> {
    let text = std::str::from_utf8(body).map_err(|_| format_err("ascii body is not UTF-8"))?;
    let vertex_idx = find_vertex(header)?;
    let mut lines = text.lines().filter(|l| !l.trim().is_empty());

    // Every element occupies one line per item in ascii, lists included.
    for element in &header.elements[..vertex_idx] {
        for _ in 0..element.count {
            if lines.next().is_none() {
                return Err(format_err(format!("truncated in element {}", element.name)));
            }
        }
    }

    let vertex = &header.elements[vertex_idx];
    let layout = VertexLayout::of(vertex)?;
    let mut cloud = PlyCloud::default();
    // A vertex line takes at least two bytes, so the body bounds the count.
    let expected = vertex.count.min(body.len() / 2);
    cloud.positions.reserve(expected * 3);
    cloud.colors.reserve(expected * 4);
    let mut row = Vec::with_capacity(vertex.properties.len());
    for n in 0..vertex.count {
        let line = lines
            .next()
            .ok_or_else(|| format_err(format!("truncated at vertex {n}")))?;
        row.clear();
        for word in line.split_whitespace().take(vertex.properties.len()) {
            row.push(
                word.parse::<f64>()
                    .map_err(|_| format_err(format!("bad number {word:?} at vertex {n}")))?,
            );
        }
        if row.len() < vertex.properties.len() {
            return Err(format_err(format!("short row at vertex {n}")));
        }
        layout.push(vertex, &row, &mut cloud);
    }
    Ok(cloud)
}

fn read_binary(header: &Header, body: &[u8]) -> Result<PlyCloud, TeleopError> {
    let vertex_idx = find_vertex(header)?;
    let mut offset = 0usize;
    for element in &header.elements[..vertex_idx] {
        if element.has_list {
            return Err(format_err(format!(
                "list element {} before vertex data",
                element.name
            )));
        }
        offset = element
            .stride()
            .checked_mul(element.count)
            .and_then(|len| offset.checked_add(len))
            .ok_or_else(|| format_err(format!("element {} count overflows", element.name)))?;
    }

    let vertex = &header.elements[vertex_idx];
    if vertex.has_list {
        return Err(format_err("vertex element with list property"));
    }
    let layout = VertexLayout::of(vertex)?;
    let stride = vertex.stride();
    let needed = stride
        .checked_mul(vertex.count)
        .and_then(|len| offset.checked_add(len))
        .ok_or_else(|| format_err(format!("vertex count {} overflows", vertex.count)))?;
    if body.len() < needed {
        return Err(format_err(format!(
            "binary body too short: {} bytes, need {needed}",
            body.len()
        )));
    }

    let mut cloud = PlyCloud::default();
    cloud.positions.reserve(vertex.count * 3);
    cloud.colors.reserve(vertex.count * 4);
    let mut row = Vec::with_capacity(vertex.properties.len());
    for record in body[offset..needed].chunks_exact(stride) {
        row.clear();
        let mut at = 0;
        for p in &vertex.properties {
            row.push(p.scalar.read_le(&record[at..at + p.scalar.size()]));
            at += p.scalar.size();
        }
        layout.push(vertex, &row, &mut cloud);
    }
    Ok(cloud)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ascii_with_colors() {
        let ply = b"ply\nformat ascii 1.0\ncomment test\nelement vertex 2\n\
property float x\nproperty float y\nproperty float z\n\
property uchar red\nproperty uchar green\nproperty uchar blue\n\
element face 0\nproperty list uchar int vertex_indices\nend_header\n\
1 2 3 255 0 0\n-1.5 0 0.5 0 128 255\n";
        let cloud = parse_ply(ply).unwrap();
        assert_eq!(cloud.point_count(), 2);
        assert_eq!(cloud.positions, vec![1.0, 2.0, 3.0, -1.5, 0.0, 0.5]);
        assert_eq!(cloud.colors, vec![255, 0, 0, 255, 0, 128, 255, 255]);
    }

    #[test]
    fn missing_color_defaults_to_white() {
        let ply = b"ply\nformat ascii 1.0\nelement vertex 1\n\
property float x\nproperty float y\nproperty float z\nend_header\n0 0 0\n";
        let cloud = parse_ply(ply).unwrap();
        assert_eq!(cloud.colors, vec![255, 255, 255, 255]);
    }

    #[test]
    fn parses_binary_little_endian() {
        let mut ply = b"ply\nformat binary_little_endian 1.0\nelement vertex 2\n\
property float x\nproperty float y\nproperty float z\n\
property float red\nproperty float green\nproperty float blue\nend_header\n"
            .to_vec();
        for v in [0.5f32, -1.0, 2.0, 1.0, 0.0, 0.5, 3.0, 4.0, 5.0, 0.0, 1.0, 0.0] {
            ply.extend_from_slice(&v.to_le_bytes());
        }
        let cloud = parse_ply(&ply).unwrap();
        assert_eq!(cloud.positions, vec![0.5, -1.0, 2.0, 3.0, 4.0, 5.0]);
        assert_eq!(cloud.colors, vec![255, 0, 127, 255, 0, 255, 0, 255]);
    }

    #[test]
    fn truncated_binary_is_rejected() {
        let mut ply = b"ply\nformat binary_little_endian 1.0\nelement vertex 2\n\
property float x\nproperty float y\nproperty float z\nend_header\n"
            .to_vec();
        ply.extend_from_slice(&[0u8; 12]);
        assert!(matches!(parse_ply(&ply), Err(TeleopError::Format(_))));
    }

    #[test]
    fn big_endian_is_unsupported() {
        let ply = b"ply\nformat binary_big_endian 1.0\nelement vertex 0\nend_header\n";
        let err = parse_ply(ply).unwrap_err();
        assert!(err.to_string().contains("binary_big_endian"));
    }

    #[test]
    fn read_ply_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cloud.ply");
        std::fs::write(
            &path,
            "ply\nformat ascii 1.0\nelement vertex 1\nproperty float x\nproperty float y\nproperty float z\nend_header\n1 1 1\n",
        )
        .unwrap();
        assert_eq!(read_ply(&path).unwrap().point_count(), 1);
    }

    #[test]
    fn oversized_ascii_count_is_rejected() {
        let ply = b"ply\nformat ascii 1.0\nelement vertex 6148914691236517206\n\
property float x\nproperty float y\nproperty float z\nend_header\n1 2 3\n";
        assert!(matches!(parse_ply(ply), Err(TeleopError::Format(_))));
    }

    #[test]
    fn oversized_leading_element_in_ascii_is_rejected() {
        let ply = b"ply\nformat ascii 1.0\nelement camera 18446744073709551615\n\
property float fov\nelement vertex 1\n\
property float x\nproperty float y\nproperty float z\nend_header\n60\n1 2 3\n";
        assert!(matches!(parse_ply(ply), Err(TeleopError::Format(_))));
    }

    #[test]
    fn oversized_binary_count_is_rejected() {
        let mut ply = b"ply\nformat binary_little_endian 1.0\nelement vertex 1537228672809129302\n\
property float x\nproperty float y\nproperty float z\nend_header\n"
            .to_vec();
        ply.extend_from_slice(&[0u8; 12]);
        assert!(matches!(parse_ply(&ply), Err(TeleopError::Format(_))));
    }

    #[test]
    fn overflowing_binary_offset_is_rejected() {
        let mut ply = b"ply\nformat binary_little_endian 1.0\n\
element camera 9223372036854775807\nproperty double fov\n\
element vertex 1\nproperty float x\nproperty float y\nproperty float z\nend_header\n"
            .to_vec();
        ply.extend_from_slice(&[0u8; 12]);
        assert!(matches!(parse_ply(&ply), Err(TeleopError::Format(_))));
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = read_ply("/definitely/not/here.ply").unwrap_err();
        assert!(matches!(err, TeleopError::Io(_)));
    }
}
