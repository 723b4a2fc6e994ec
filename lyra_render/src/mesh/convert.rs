//! Vertex attribute conversion into canonical engine formats.

use crate::driver::VertexFormat;

use super::{Error, Semantic};

fn read_u16(src: &[u8], i: usize) -> u16 {
    u16::from_le_bytes([src[i * 2], src[i * 2 + 1]])
}

fn read_f32(src: &[u8], i: usize) -> f32 {
    f32::from_le_bytes([src[i * 4], src[i * 4 + 1], src[i * 4 + 2], src[i * 4 + 3]])
}

fn push_f32(out: &mut Vec<u8>, value: f32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn push_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_le_bytes());
}

/// Converts `count` vertices of `format` into the canonical format of
/// `semantic`.
///
/// `src` holds exactly `count * format.size()` bytes, little-endian.
/// Canonical input is passed through unchanged. Unsupported combinations
/// fail with [`Error::UnsupportedFormat`].
pub(super) fn convert(
    semantic: Semantic,
    format: VertexFormat,
    src: &[u8],
    count: usize,
) -> Result<Vec<u8>, Error> {
    debug_assert_eq!(src.len(), count * format.size() as usize);

    if format == semantic.format() {
        return Ok(src.to_vec());
    }

    let mut out = Vec::with_capacity(count * semantic.format().size() as usize);

    match (semantic, format) {
        (Semantic::TexCoord0 | Semantic::TexCoord1, VertexFormat::Uint16x2) => {
            for v in 0..count {
                push_f32(&mut out, read_u16(src, v * 2) as f32 / 65535.0);
                push_f32(&mut out, read_u16(src, v * 2 + 1) as f32 / 65535.0);
            }
        }
        (Semantic::TexCoord0 | Semantic::TexCoord1, VertexFormat::Uint8x2) => {
            for v in 0..count {
                push_f32(&mut out, src[v * 2] as f32 / 255.0);
                push_f32(&mut out, src[v * 2 + 1] as f32 / 255.0);
            }
        }
        (Semantic::Color0, VertexFormat::Float32x3) => {
            for v in 0..count {
                for c in 0..3 {
                    push_f32(&mut out, read_f32(src, v * 3 + c));
                }
                push_f32(&mut out, 1.0);
            }
        }
        (Semantic::Color0, VertexFormat::Uint16x3 | VertexFormat::Uint16x4) => {
            let n = format.components() as usize;
            for v in 0..count {
                for c in 0..n {
                    push_f32(&mut out, read_u16(src, v * n + c) as f32 / 65535.0);
                }
                if n == 3 {
                    push_f32(&mut out, 1.0);
                }
            }
        }
        (Semantic::Color0, VertexFormat::Uint8x3 | VertexFormat::Uint8x4) => {
            let n = format.components() as usize;
            for v in 0..count {
                for c in 0..n {
                    push_f32(&mut out, src[v * n + c] as f32 / 255.0);
                }
                if n == 3 {
                    push_f32(&mut out, 1.0);
                }
            }
        }
        (Semantic::Joints0, VertexFormat::Uint8x4) => {
            for &joint in src.iter().take(count * 4) {
                push_u16(&mut out, joint as u16);
            }
        }
        (Semantic::Weights0, VertexFormat::Uint16x4) => {
            for v in 0..count * 4 {
                push_f32(&mut out, read_u16(src, v) as f32 / 65535.0);
            }
        }
        (Semantic::Weights0, VertexFormat::Uint8x4) => {
            for &weight in src.iter().take(count * 4) {
                push_f32(&mut out, weight as f32 / 255.0);
            }
        }
        _ => return Err(Error::UnsupportedFormat { semantic, format }),
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use crate::driver::VertexFormat;
    use crate::mesh::{Error, Semantic};

    use super::convert;

    fn as_f32(bytes: &[u8]) -> Vec<f32> {
        bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes(b.try_into().unwrap()))
            .collect()
    }

    #[test]
    fn convert_canonical_passthrough() {
        let src: Vec<u8> = bytemuck::cast_slice(&[1.0_f32, 2.0, 3.0, 4.0, 5.0, 6.0]).to_vec();
        let out = convert(Semantic::Position, VertexFormat::Float32x3, &src, 2).unwrap();
        assert_eq!(out, src);
    }

    #[test]
    fn convert_texcoord_normalized() {
        let src = [0_u16, 65535, 32767, 0];
        let bytes: Vec<u8> = src.iter().flat_map(|v| v.to_le_bytes()).collect();

        let out = convert(Semantic::TexCoord0, VertexFormat::Uint16x2, &bytes, 2).unwrap();
        let values = as_f32(&out);
        assert_eq!(values[0], 0.0);
        assert_eq!(values[1], 1.0);
        assert!((values[2] - 32767.0 / 65535.0).abs() < 1e-6);
        assert_eq!(values[3], 0.0);

        let src = [0_u8, 255];
        let out = convert(Semantic::TexCoord1, VertexFormat::Uint8x2, &src, 1).unwrap();
        assert_eq!(as_f32(&out), [0.0, 1.0]);
    }

    #[test]
    fn convert_color_appends_alpha() {
        let src: Vec<u8> = bytemuck::cast_slice(&[0.25_f32, 0.5, 0.75]).to_vec();
        let out = convert(Semantic::Color0, VertexFormat::Float32x3, &src, 1).unwrap();
        assert_eq!(as_f32(&out), [0.25, 0.5, 0.75, 1.0]);

        let out = convert(Semantic::Color0, VertexFormat::Uint8x3, &[0, 51, 255], 1).unwrap();
        let values = as_f32(&out);
        assert_eq!(values[0], 0.0);
        assert!((values[1] - 0.2).abs() < 1e-6);
        assert_eq!(values[2], 1.0);
        assert_eq!(values[3], 1.0);

        let out = convert(Semantic::Color0, VertexFormat::Uint8x4, &[255, 0, 0, 127], 1).unwrap();
        let values = as_f32(&out);
        assert_eq!(values[0], 1.0);
        assert!((values[3] - 127.0 / 255.0).abs() < 1e-6);
    }

    #[test]
    fn convert_joints_zero_extend() {
        let out = convert(Semantic::Joints0, VertexFormat::Uint8x4, &[1, 2, 3, 255], 1).unwrap();
        let values: Vec<u16> = out
            .chunks_exact(2)
            .map(|b| u16::from_le_bytes(b.try_into().unwrap()))
            .collect();
        assert_eq!(values, [1, 2, 3, 255]);
    }

    #[test]
    fn convert_weights_normalized() {
        let src = [0_u16, 65535, 32767, 1];
        let bytes: Vec<u8> = src.iter().flat_map(|v| v.to_le_bytes()).collect();
        let out = convert(Semantic::Weights0, VertexFormat::Uint16x4, &bytes, 1).unwrap();
        let values = as_f32(&out);
        assert_eq!(values[0], 0.0);
        assert_eq!(values[1], 1.0);
        assert!((values[2] - 32767.0 / 65535.0).abs() < 1e-6);
    }

    #[test]
    fn convert_rejects_unsupported() {
        assert_eq!(
            convert(Semantic::Position, VertexFormat::Uint8x3, &[0; 9], 3),
            Err(Error::UnsupportedFormat {
                semantic: Semantic::Position,
                format: VertexFormat::Uint8x3,
            }),
        );
        assert_eq!(
            convert(Semantic::Normal, VertexFormat::Sint16x3, &[0; 18], 3),
            Err(Error::UnsupportedFormat {
                semantic: Semantic::Normal,
                format: VertexFormat::Sint16x3,
            }),
        );
    }
}
