//! Image encoding of frames exchanged with the processing service

use super::RelayError;
use crate::config::{RelayConfig, RelayFrameFormat};
use crate::media::{PixelLayout, RawFrame};
use image::imageops::{self, FilterType};
use image::{ImageBuffer, Rgb, RgbImage, RgbaImage};

/// How frames are serialized into relay envelopes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameCodec {
    /// Baseline JPEG with the given quality
    Jpeg { quality: u8 },
    /// Packed RGBA bytes at a fixed resolution; frames are scaled to it
    Raw { width: u32, height: u32 },
}

impl From<&RelayConfig> for FrameCodec {
    fn from(config: &RelayConfig) -> Self {
        match config.frame_format {
            RelayFrameFormat::Jpeg => FrameCodec::Jpeg {
                quality: config.jpeg_quality,
            },
            RelayFrameFormat::Raw => FrameCodec::Raw {
                width: config.raw_width,
                height: config.raw_height,
            },
        }
    }
}

impl FrameCodec {
    /// Serialize a decoded frame
    pub fn encode(&self, frame: &RawFrame) -> Result<Vec<u8>, RelayError> {
        if !frame.is_well_formed() {
            return Err(RelayError::Image(format!("Malformed frame: {}", frame)));
        }

        match *self {
            FrameCodec::Jpeg { quality } => {
                let rgb = to_rgb(frame);
                let img: RgbImage = ImageBuffer::from_raw(frame.width, frame.height, rgb)
                    .ok_or_else(|| RelayError::Image("failed to create image buffer".to_string()))?;
                encode_jpeg(&img, quality)
            }
            FrameCodec::Raw { width, height } => {
                let rgba = to_rgba(frame);
                if (frame.width, frame.height) == (width, height) {
                    return Ok(rgba);
                }
                let img: RgbaImage = ImageBuffer::from_raw(frame.width, frame.height, rgba)
                    .ok_or_else(|| RelayError::Image("failed to create image buffer".to_string()))?;
                Ok(imageops::resize(&img, width, height, FilterType::Triangle).into_raw())
            }
        }
    }

    /// Parse a processed frame returned by the service
    pub fn decode(&self, data: &[u8]) -> Result<RawFrame, RelayError> {
        match *self {
            FrameCodec::Jpeg { .. } => {
                let img = image::load_from_memory(data)
                    .map_err(|e| RelayError::Image(format!("Image decode failed: {}", e)))?
                    .to_rgba8();
                let (width, height) = img.dimensions();
                Ok(RawFrame::new(width, height, PixelLayout::Rgba, img.into_raw()))
            }
            FrameCodec::Raw { width, height } => {
                let expected = PixelLayout::Rgba.frame_size(width, height);
                if data.len() != expected {
                    return Err(RelayError::Image(format!(
                        "Raw frame is {} bytes, expected {} for {}x{}",
                        data.len(),
                        expected,
                        width,
                        height
                    )));
                }
                Ok(RawFrame::new(width, height, PixelLayout::Rgba, data.to_vec()))
            }
        }
    }
}

fn encode_jpeg(img: &RgbImage, quality: u8) -> Result<Vec<u8>, RelayError> {
    use image::codecs::jpeg::JpegEncoder;
    use std::io::Cursor;

    let mut buf = Cursor::new(Vec::new());
    let encoder = JpegEncoder::new_with_quality(&mut buf, quality);
    img.write_with_encoder(encoder)
        .map_err(|e| RelayError::Image(format!("JPEG encode failed: {}", e)))?;
    Ok(buf.into_inner())
}

/// BT.601 limited-range YUV → RGB
fn yuv_to_rgb(y: u8, u: u8, v: u8) -> Rgb<u8> {
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    let clamp = |x: i32| ((x + 128) >> 8).clamp(0, 255) as u8;
    Rgb([
        clamp(298 * c + 409 * e),
        clamp(298 * c - 100 * d - 208 * e),
        clamp(298 * c + 516 * d),
    ])
}

/// Packed RGB copy of any frame layout
fn to_rgb(frame: &RawFrame) -> Vec<u8> {
    let (w, h) = (frame.width as usize, frame.height as usize);
    match frame.layout {
        PixelLayout::Rgb => frame.data.clone(),
        PixelLayout::Rgba => frame
            .data
            .chunks_exact(4)
            .flat_map(|px| [px[0], px[1], px[2]])
            .collect(),
        PixelLayout::I420 => {
            let cw = (w + 1) / 2;
            let ch = (h + 1) / 2;
            let (y_plane, rest) = frame.data.split_at(w * h);
            let (u_plane, v_plane) = rest.split_at(cw * ch);

            let mut out = Vec::with_capacity(w * h * 3);
            for row in 0..h {
                for col in 0..w {
                    let chroma = (row / 2) * cw + col / 2;
                    let px = yuv_to_rgb(y_plane[row * w + col], u_plane[chroma], v_plane[chroma]);
                    out.extend_from_slice(&px.0);
                }
            }
            out
        }
    }
}

/// Packed RGBA copy of any frame layout
fn to_rgba(frame: &RawFrame) -> Vec<u8> {
    match frame.layout {
        PixelLayout::Rgba => frame.data.clone(),
        _ => to_rgb(frame)
            .chunks_exact(3)
            .flat_map(|px| [px[0], px[1], px[2], 0xFF])
            .collect(),
    }
}
