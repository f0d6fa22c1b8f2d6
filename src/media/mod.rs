//! Media units exchanged between pipeline stages
//!
//! - `Sample`: one compressed frame rebuilt from RTP packets
//! - `RawFrame`: a decoded picture
//! - `EncodedFrame`: encoder output ready for the outbound track

pub mod reassembler;

pub use reassembler::{Reassembler, ReassemblyError, ReassemblyStats};

use crate::config::VideoCodec;
use bytes::Bytes;
use std::fmt;
use std::time::Duration;

/// Duration used when the RTP timestamp delta is zero or unknown (~30 fps)
pub const FALLBACK_SAMPLE_DURATION: Duration = Duration::from_millis(33);

/// RTP clock rate for every supported video codec
pub const VIDEO_CLOCK_RATE: u32 = 90_000;

/// A complete compressed frame reconstructed from one RTP timestamp group
#[derive(Debug, Clone)]
pub struct Sample {
    /// Depacketized codec bitstream
    pub data: Bytes,

    /// RTP timestamp shared by every packet of the group
    pub timestamp: u32,

    /// Presentation duration, always non-zero
    pub duration: Duration,

    /// Extended sequence number of the first packet (arrival order)
    pub sequence: u64,
}

impl fmt::Display for Sample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Sample({} bytes, ts={}, dur={:?}, seq={})",
            self.data.len(),
            self.timestamp,
            self.duration,
            self.sequence
        )
    }
}

/// Pixel layout of a raw frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelLayout {
    /// Planar YUV 4:2:0
    I420,
    /// Packed 8-bit RGBA
    Rgba,
    /// Packed 8-bit RGB
    Rgb,
}

impl PixelLayout {
    /// GStreamer raw video format name
    pub fn gst_format(&self) -> &'static str {
        match self {
            PixelLayout::I420 => "I420",
            PixelLayout::Rgba => "RGBA",
            PixelLayout::Rgb => "RGB",
        }
    }

    /// Parse a GStreamer raw video format name
    pub fn from_gst_format(format: &str) -> Option<Self> {
        match format {
            "I420" => Some(PixelLayout::I420),
            "RGBA" => Some(PixelLayout::Rgba),
            "RGB" => Some(PixelLayout::Rgb),
            _ => None,
        }
    }

    /// Tightly packed byte size of a frame with this layout
    pub fn frame_size(&self, width: u32, height: u32) -> usize {
        let (w, h) = (width as usize, height as usize);
        match self {
            PixelLayout::I420 => {
                let chroma = ((w + 1) / 2) * ((h + 1) / 2);
                w * h + 2 * chroma
            }
            PixelLayout::Rgba => w * h * 4,
            PixelLayout::Rgb => w * h * 3,
        }
    }
}

/// A decoded picture
#[derive(Debug, Clone)]
pub struct RawFrame {
    /// Frame width in pixels
    pub width: u32,

    /// Frame height in pixels
    pub height: u32,

    /// Pixel layout of `data`
    pub layout: PixelLayout,

    /// Tightly packed pixel bytes
    pub data: Vec<u8>,
}

impl RawFrame {
    pub fn new(width: u32, height: u32, layout: PixelLayout, data: Vec<u8>) -> Self {
        Self { width, height, layout, data }
    }

    /// True when the buffer length matches the declared geometry
    pub fn is_well_formed(&self) -> bool {
        self.width > 0
            && self.height > 0
            && self.data.len() == self.layout.frame_size(self.width, self.height)
    }
}

impl fmt::Display for RawFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RawFrame({}x{} {:?}, {} bytes)",
            self.width,
            self.height,
            self.layout,
            self.data.len()
        )
    }
}

/// Encoder output for one frame
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub data: Bytes,
    pub is_keyframe: bool,
}

/// Inspect a compressed frame and report whether it is independently decodable.
pub fn is_keyframe(codec: VideoCodec, data: &[u8]) -> bool {
    match codec {
        // Frame tag: bit 0 is the inverse key frame flag
        VideoCodec::VP8 => data.first().map(|b| b & 0x01 == 0).unwrap_or(false),
        VideoCodec::VP9 => vp9_is_keyframe(data),
        VideoCodec::H264 => h264_contains_idr(data),
    }
}

fn vp9_is_keyframe(data: &[u8]) -> bool {
    let Some(&byte) = data.first() else {
        return false;
    };
    let bit = |i: u32| (byte >> (7 - i)) & 0x01;

    // frame_marker must be 0b10
    if byte >> 6 != 0b10 {
        return false;
    }
    let profile = bit(2) | (bit(3) << 1);
    let mut pos = 4;
    if profile == 3 {
        pos += 1;
    }
    // show_existing_frame
    if bit(pos) == 1 {
        return false;
    }
    bit(pos + 1) == 0
}

fn h264_contains_idr(data: &[u8]) -> bool {
    let mut i = 0;
    while i + 3 < data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            let nal_type = data[i + 3] & 0x1F;
            if nal_type == 5 {
                return true;
            }
            i += 3;
        } else {
            i += 1;
        }
    }
    false
}
