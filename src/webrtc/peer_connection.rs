//! WebRTC PeerConnection management
//!
//! `RtcEngine` carries the negotiation setup shared by every session: the
//! media engine with the single configured video codec, the default
//! interceptors (NACK, RTCP reports, TWCC) and the ICE server list. It is
//! built once at startup and handed to sessions behind an `Arc`.

use super::WebRTCError;
use crate::config::{VideoCodec, WebRTCConfig};
use crate::media::VIDEO_CLOCK_RATE;
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType};
use webrtc::rtp_transceiver::RTCPFeedback;

/// Shared peer connection factory
pub struct RtcEngine {
    api: API,
    codec: VideoCodec,
    payload_type: u8,
    ice_servers: Vec<String>,
}

impl RtcEngine {
    /// Build the API with the configured codec and default interceptors
    pub fn new(config: &WebRTCConfig) -> Result<Self, WebRTCError> {
        let mut media_engine = MediaEngine::default();

        media_engine
            .register_codec(
                RTCRtpCodecParameters {
                    capability: codec_capability(config.video_codec),
                    payload_type: config.payload_type,
                    ..Default::default()
                },
                RTPCodecType::Video,
            )
            .map_err(|e| {
                WebRTCError::ConnectionFailed(format!(
                    "Failed to register {}: {}",
                    config.video_codec.as_str(),
                    e
                ))
            })?;

        // Create interceptor registry for RTCP feedback
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| WebRTCError::ConnectionFailed(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self {
            api,
            codec: config.video_codec,
            payload_type: config.payload_type,
            ice_servers: config.ice_servers.clone(),
        })
    }

    pub fn codec(&self) -> VideoCodec {
        self.codec
    }

    pub fn payload_type(&self) -> u8 {
        self.payload_type
    }

    /// Capability of the registered video codec
    pub fn codec_capability(&self) -> RTCRtpCodecCapability {
        codec_capability(self.codec)
    }

    /// Create a new PeerConnection with the configured ICE servers
    pub async fn create_peer_connection(&self) -> Result<Arc<RTCPeerConnection>, WebRTCError> {
        let ice_servers = if self.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };

        let rtc_config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let peer_connection = self
            .api
            .new_peer_connection(rtc_config)
            .await
            .map_err(|e| WebRTCError::ConnectionFailed(format!("Failed to create peer connection: {}", e)))?;

        Ok(Arc::new(peer_connection))
    }
}

/// Capability advertised for `codec`, with NACK/PLI/FIR/REMB feedback
pub fn codec_capability(codec: VideoCodec) -> RTCRtpCodecCapability {
    let feedback = |typ: &str, parameter: &str| RTCPFeedback {
        typ: typ.to_string(),
        parameter: parameter.to_string(),
    };

    RTCRtpCodecCapability {
        mime_type: codec.mime_type().to_string(),
        clock_rate: VIDEO_CLOCK_RATE,
        channels: 0,
        sdp_fmtp_line: codec.sdp_fmtp_line().to_string(),
        rtcp_feedback: vec![
            feedback("goog-remb", ""),
            feedback("ccm", "fir"),
            feedback("nack", ""),
            feedback("nack", "pli"),
        ],
    }
}

/// Apply a remote offer, then create and apply the answer.
///
/// Candidates are trickled, so the answer is returned without waiting for
/// gathering to complete.
pub async fn answer_offer(peer_connection: &Arc<RTCPeerConnection>, sdp: &str) -> Result<String, WebRTCError> {
    let offer = RTCSessionDescription::offer(sdp.to_string())
        .map_err(|e| WebRTCError::SdpError(format!("Invalid SDP offer: {}", e)))?;

    peer_connection
        .set_remote_description(offer)
        .await
        .map_err(|e| WebRTCError::SdpError(format!("Failed to set remote description: {}", e)))?;

    let answer = peer_connection
        .create_answer(None)
        .await
        .map_err(|e| WebRTCError::SdpError(format!("Failed to create answer: {}", e)))?;

    peer_connection
        .set_local_description(answer.clone())
        .await
        .map_err(|e| WebRTCError::SdpError(format!("Failed to set local description: {}", e)))?;

    if let Some(local_desc) = peer_connection.local_description().await {
        return Ok(local_desc.sdp);
    }

    Ok(answer.sdp)
}

/// Add a remote ICE candidate
pub async fn add_ice_candidate(
    peer_connection: &Arc<RTCPeerConnection>,
    candidate: RTCIceCandidateInit,
) -> Result<(), WebRTCError> {
    peer_connection
        .add_ice_candidate(candidate)
        .await
        .map_err(|e| WebRTCError::IceError(format!("Failed to add ICE candidate: {}", e)))
}
