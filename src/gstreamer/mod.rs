//! GStreamer integration for frame decoding and encoding
//!
//! Compressed samples from the inbound track are decoded into raw frames
//! through an appsrc/appsink pipeline, and processed frames are encoded back
//! to VP8/VP9/H.264 for the outbound track the same way.

pub mod decoder;
pub mod encoder;
pub mod pipeline;

pub use decoder::{DecoderSelection, GstFrameDecoder};
pub use encoder::{EncoderSelection, EncoderSettings, GstFrameEncoder};
pub use pipeline::AppPipeline;

use crate::media::{EncodedFrame, RawFrame, Sample};
use std::error::Error;
use std::fmt;

/// GStreamer-related errors
#[derive(Debug)]
pub enum GstError {
    /// GStreamer initialization failed
    InitFailed(String),
    /// Pipeline creation failed
    PipelineFailed(String),
    /// Encoder not available
    EncoderNotFound(String),
    /// Decoder not available
    DecoderNotFound(String),
    /// Element linking failed
    LinkFailed(String),
    /// State change failed
    StateChangeFailed(String),
    /// Buffer could not be pushed or mapped
    BufferFailed(String),
    /// Frame geometry does not match its data
    InvalidFrame(String),
}

impl fmt::Display for GstError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GstError::InitFailed(msg) => write!(f, "GStreamer init failed: {}", msg),
            GstError::PipelineFailed(msg) => write!(f, "Pipeline creation failed: {}", msg),
            GstError::EncoderNotFound(msg) => write!(f, "Encoder not found: {}", msg),
            GstError::DecoderNotFound(msg) => write!(f, "Decoder not found: {}", msg),
            GstError::LinkFailed(msg) => write!(f, "Element linking failed: {}", msg),
            GstError::StateChangeFailed(msg) => write!(f, "State change failed: {}", msg),
            GstError::BufferFailed(msg) => write!(f, "Buffer error: {}", msg),
            GstError::InvalidFrame(msg) => write!(f, "Invalid frame: {}", msg),
        }
    }
}

impl Error for GstError {}

/// Stateful decoder for one inbound stream.
///
/// `Ok(None)` means the decoder needs more input before a frame is ready.
pub trait FrameDecoder: Send {
    fn decode(&mut self, sample: &Sample) -> Result<Option<RawFrame>, GstError>;

    /// End of input: return every frame still held
    fn flush(&mut self) -> Vec<RawFrame> {
        Vec::new()
    }
}

/// Stateful encoder for one outbound stream
pub trait FrameEncoder: Send {
    fn encode(&mut self, frame: &RawFrame) -> Result<Option<EncodedFrame>, GstError>;

    /// Output that became ready along with the last `encode`, oldest first
    fn next_ready(&mut self) -> Option<EncodedFrame> {
        None
    }

    /// Force the next output to be a keyframe
    fn request_keyframe(&mut self);

    /// End of input: return every frame still held
    fn flush(&mut self) -> Vec<EncodedFrame> {
        Vec::new()
    }
}

/// Initialize GStreamer subsystem
pub fn init() -> Result<(), GstError> {
    gstreamer::init().map_err(|e| GstError::InitFailed(e.to_string()))
}

/// Check if a GStreamer element is available
pub(crate) fn element_available(name: &str) -> bool {
    gstreamer::ElementFactory::find(name).is_some()
}
