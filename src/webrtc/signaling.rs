//! WebRTC Signaling Protocol
//!
//! JSON messages exchanged over the signaling websocket, and the per-connection
//! negotiation state machine. The machine is a pure transition function: the
//! transport layer feeds it events and executes the effects it returns.

use super::WebRTCError;
use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

/// ICE candidate as carried in `candidate` messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "usernameFragment", default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

impl From<IceCandidate> for RTCIceCandidateInit {
    fn from(candidate: IceCandidate) -> Self {
        RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        }
    }
}

/// Wire message: `{type, sdp?, candidate?, payload?}`
///
/// The `type` field is kept as a string so that message kinds this server
/// does not act on (`re-negotiate`, `message`, `gameConfig`, ...) still parse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalingMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<IceCandidate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl SignalingMessage {
    fn new(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            sdp: None,
            candidate: None,
            payload: None,
            message: None,
        }
    }

    /// Parse a signaling message from JSON
    pub fn from_json(json: &str) -> Result<Self, WebRTCError> {
        serde_json::from_str(json)
            .map_err(|e| WebRTCError::SdpError(format!("Invalid signaling message: {}", e)))
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, WebRTCError> {
        serde_json::to_string(self)
            .map_err(|e| WebRTCError::SdpError(format!("Failed to serialize message: {}", e)))
    }

    pub fn offer(sdp: String) -> Self {
        Self {
            sdp: Some(sdp),
            ..Self::new("offer")
        }
    }

    /// Create an answer message
    pub fn answer(sdp: String) -> Self {
        Self {
            sdp: Some(sdp),
            ..Self::new("answer")
        }
    }

    /// Create an ICE candidate message
    pub fn candidate(candidate: IceCandidate) -> Self {
        Self {
            candidate: Some(candidate),
            ..Self::new("candidate")
        }
    }

    /// Create an error notification
    pub fn error(message: &str) -> Self {
        Self {
            message: Some(message.to_string()),
            ..Self::new("error")
        }
    }

    /// Map an inbound message onto a state machine event
    pub fn into_event(self) -> SignalingEvent {
        match (self.kind.as_str(), self.sdp, self.candidate) {
            ("offer", Some(sdp), _) => SignalingEvent::Offer(sdp),
            ("candidate", _, Some(candidate)) => SignalingEvent::RemoteCandidate(candidate),
            _ => SignalingEvent::Unrecognized(self.kind),
        }
    }
}

/// Negotiation state of one signaling connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    New,
    Negotiating,
    Active,
    Closed,
}

/// Inputs to the state machine
#[derive(Debug, Clone)]
pub enum SignalingEvent {
    /// Remote offer received
    Offer(String),
    /// Remote ICE candidate received
    RemoteCandidate(IceCandidate),
    /// Local answer produced by the peer session
    Negotiated(String),
    /// Negotiation failed with the given reason
    NegotiationFailed(String),
    /// Locally gathered ICE candidate
    LocalCandidate(IceCandidate),
    PeerStateChanged(RTCPeerConnectionState),
    /// The websocket closed or errored
    ChannelClosed,
    /// The session terminated itself (transport or relay failure)
    SessionEnded,
    /// A message type this server does not act on
    Unrecognized(String),
}

/// Actions requested by the state machine, executed in order by the driver
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Negotiate(String),
    SendAnswer(String),
    AddCandidate(IceCandidate),
    RejectOffer,
    SendCandidate(IceCandidate),
    Teardown(String),
    Ignore(String),
}

/// Per-connection negotiation state machine
#[derive(Debug)]
pub struct SignalingMachine {
    state: SignalingState,
    pending: Vec<IceCandidate>,
}

impl SignalingMachine {
    pub fn new() -> Self {
        Self {
            state: SignalingState::New,
            pending: Vec::new(),
        }
    }

    pub fn state(&self) -> SignalingState {
        self.state
    }

    /// Remote candidates waiting for the remote description
    pub fn pending_candidates(&self) -> usize {
        self.pending.len()
    }

    /// Apply one event and return the effects to execute
    pub fn handle(&mut self, event: SignalingEvent) -> Vec<Effect> {
        use SignalingState::*;

        if self.state == Closed {
            return Vec::new();
        }

        match event {
            SignalingEvent::Unrecognized(kind) => vec![Effect::Ignore(kind)],

            SignalingEvent::Offer(sdp) => match self.state {
                New => {
                    self.state = Negotiating;
                    vec![Effect::Negotiate(sdp)]
                }
                _ => vec![Effect::RejectOffer],
            },

            SignalingEvent::RemoteCandidate(candidate) => match self.state {
                Active => vec![Effect::AddCandidate(candidate)],
                _ => {
                    self.pending.push(candidate);
                    Vec::new()
                }
            },

            SignalingEvent::Negotiated(answer) => match self.state {
                Negotiating => {
                    self.state = Active;
                    let mut effects = Vec::with_capacity(self.pending.len() + 1);
                    effects.push(Effect::SendAnswer(answer));
                    effects.extend(self.pending.drain(..).map(Effect::AddCandidate));
                    effects
                }
                _ => vec![Effect::Ignore("negotiated".to_string())],
            },

            SignalingEvent::NegotiationFailed(reason) => match self.state {
                Negotiating => self.close(format!("negotiation failed: {}", reason)),
                _ => vec![Effect::Ignore("negotiation-failed".to_string())],
            },

            SignalingEvent::LocalCandidate(candidate) => vec![Effect::SendCandidate(candidate)],

            SignalingEvent::PeerStateChanged(state) => match state {
                RTCPeerConnectionState::Failed
                | RTCPeerConnectionState::Closed
                | RTCPeerConnectionState::Disconnected => {
                    self.close(format!("peer connection {}", state))
                }
                _ => Vec::new(),
            },

            SignalingEvent::ChannelClosed => self.close("signaling channel closed".to_string()),

            SignalingEvent::SessionEnded => self.close("session ended".to_string()),
        }
    }

    fn close(&mut self, reason: String) -> Vec<Effect> {
        self.state = SignalingState::Closed;
        self.pending.clear();
        vec![Effect::Teardown(reason)]
    }
}

impl Default for SignalingMachine {
    fn default() -> Self {
        Self::new()
    }
}
