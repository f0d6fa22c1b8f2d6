//! rtc-frame-relay - WebRTC frame relay
//!
//! Receives browser video over WebRTC, reassembles and decodes it with
//! GStreamer, forwards decoded frames through a gRPC frame-processing
//! service and streams the processed frames back to the same peer.

pub mod args;
pub mod config;
pub mod gstreamer;
pub mod media;
pub mod relay;
pub mod shutdown;
pub mod transport;
pub mod web;
pub mod webrtc;

// Re-exports
pub use config::{Config, HardwareEncoder, VideoCodec};
pub use media::{RawFrame, Reassembler, Sample};
pub use relay::RelayBridge;
pub use crate::webrtc::{ConnectionRegistry, PeerSession, RtcEngine, SignalingMessage};
