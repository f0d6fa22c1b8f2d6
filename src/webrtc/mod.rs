//! WebRTC relay sessions
//!
//! - `signaling`: wire messages and the negotiation state machine
//! - `peer_connection`: shared API setup (`RtcEngine`)
//! - `session`: one peer connection and its media pipeline
//! - `pipeline`: reader / decode / encode / writer stages
//! - `media_track`: replaceable output track and sample writer
//! - `registry`: live connections

pub mod media_track;
pub mod peer_connection;
pub mod pipeline;
pub mod registry;
pub mod session;
pub mod signaling;

pub use peer_connection::RtcEngine;
pub use registry::ConnectionRegistry;
pub use session::{PeerSession, SessionPhase};
pub use signaling::{Effect, SignalingEvent, SignalingMachine, SignalingMessage};

use std::error::Error;
use std::fmt;

/// WebRTC-related errors
#[derive(Debug)]
pub enum WebRTCError {
    /// Peer connection creation failed
    ConnectionFailed(String),
    /// SDP processing failed
    SdpError(String),
    /// ICE candidate processing failed
    IceError(String),
    /// Media track or pipeline error
    MediaError(String),
    /// Invalid state transition
    InvalidState(String),
}

impl fmt::Display for WebRTCError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WebRTCError::ConnectionFailed(msg) => write!(f, "Connection failed: {}", msg),
            WebRTCError::SdpError(msg) => write!(f, "SDP error: {}", msg),
            WebRTCError::IceError(msg) => write!(f, "ICE error: {}", msg),
            WebRTCError::MediaError(msg) => write!(f, "Media error: {}", msg),
            WebRTCError::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
        }
    }
}

impl Error for WebRTCError {}
