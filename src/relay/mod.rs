//! Streaming bridge to the external frame-processing service
//!
//! Decoded frames are serialized (`image`), sent over a bidirectional gRPC
//! stream (`proto`), and processed frames come back on the same call. The
//! send and receive sides run as independent tasks (`bridge`).

pub mod bridge;
pub mod image;
pub mod proto;

pub use bridge::{RelayBridge, RelayEnvelope, RelayResult, RelayStats};
pub use image::FrameCodec;

use std::error::Error;
use std::fmt;

/// Relay-related errors
#[derive(Debug)]
pub enum RelayError {
    /// Endpoint could not be reached
    Connect(String),
    /// The streaming call failed
    Stream(String),
    /// Outbound queue is at capacity; the frame was not accepted
    QueueFull,
    /// The bridge has been closed
    Closed,
    /// Frame could not be serialized or parsed
    Image(String),
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayError::Connect(msg) => write!(f, "Relay connect failed: {}", msg),
            RelayError::Stream(msg) => write!(f, "Relay stream error: {}", msg),
            RelayError::QueueFull => write!(f, "Relay queue is full"),
            RelayError::Closed => write!(f, "Relay bridge is closed"),
            RelayError::Image(msg) => write!(f, "Relay image error: {}", msg),
        }
    }
}

impl Error for RelayError {}
