//! Peer session lifecycle
//!
//! A `PeerSession` owns one peer connection, its output track slot, the
//! per-session shutdown signal and the media pipeline started for the first
//! inbound video track. WebRTC callbacks never act on the session directly:
//! they forward `SignalingEvent`s to the connection's signaling task, except
//! for track arrival which starts the pipeline in its own task.

use super::media_track::TrackSlot;
use super::peer_connection::{add_ice_candidate, answer_offer, RtcEngine};
use super::pipeline::{self, PipelineContext, PipelineHandle};
use super::signaling::{IceCandidate, SignalingEvent};
use super::WebRTCError;
use crate::config::Config;
use crate::shutdown::Shutdown;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Session lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Created, awaiting an offer
    Created,
    /// Offer being applied
    Negotiating,
    /// Answer sent, media may flow
    Active,
    /// Teardown in progress
    Closing,
    Closed,
}

/// Server side of one negotiated connection
pub struct PeerSession {
    /// Unique session ID
    pub id: String,
    engine: Arc<RtcEngine>,
    config: Arc<Config>,
    events: mpsc::UnboundedSender<SignalingEvent>,
    phase: Mutex<SessionPhase>,
    peer_connection: Mutex<Option<Arc<RTCPeerConnection>>>,
    sender: Mutex<Option<Arc<RTCRtpSender>>>,
    output: Arc<TrackSlot<TrackLocalStaticSample>>,
    shutdown: Shutdown,
    keyframe: Arc<Notify>,
    track_setup: Mutex<Option<JoinHandle<()>>>,
    pipeline: tokio::sync::Mutex<Option<PipelineHandle>>,
    track_claimed: AtomicBool,
    closed: AtomicBool,
    remote_candidates: AtomicU64,
    /// Session creation time
    pub created_at: Instant,
}

impl PeerSession {
    pub fn new(
        id: String,
        engine: Arc<RtcEngine>,
        config: Arc<Config>,
        events: mpsc::UnboundedSender<SignalingEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            engine,
            config,
            events,
            phase: Mutex::new(SessionPhase::Created),
            peer_connection: Mutex::new(None),
            sender: Mutex::new(None),
            output: Arc::new(TrackSlot::new()),
            shutdown: Shutdown::new(),
            keyframe: Arc::new(Notify::new()),
            track_setup: Mutex::new(None),
            pipeline: tokio::sync::Mutex::new(None),
            track_claimed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            remote_candidates: AtomicU64::new(0),
            created_at: Instant::now(),
        })
    }

    pub fn phase(&self) -> SessionPhase {
        *self.phase.lock()
    }

    /// Resolves once the session has been told to terminate, by `close()` or
    /// by a fatal transport or relay failure.
    pub async fn terminated(&self) {
        self.shutdown.triggered().await
    }

    /// Apply a remote offer and return the local answer SDP
    pub async fn negotiate(self: &Arc<Self>, offer_sdp: &str) -> Result<String, WebRTCError> {
        {
            let mut phase = self.phase.lock();
            if *phase != SessionPhase::Created {
                return Err(WebRTCError::InvalidState(format!(
                    "cannot negotiate in phase {:?}",
                    *phase
                )));
            }
            *phase = SessionPhase::Negotiating;
        }

        let peer_connection = self.engine.create_peer_connection().await?;

        let transceiver = peer_connection
            .add_transceiver_from_kind(
                RTPCodecType::Video,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Sendrecv,
                    send_encodings: vec![],
                }),
            )
            .await
            .map_err(|e| WebRTCError::MediaError(format!("Failed to add video transceiver: {}", e)))?;
        let sender = transceiver.sender().await;

        *self.peer_connection.lock() = Some(peer_connection.clone());
        *self.sender.lock() = Some(sender);

        // close() may have run while the connection was being created
        if self.closed.load(Ordering::SeqCst) {
            let stale = self.peer_connection.lock().take();
            self.sender.lock().take();
            if let Some(stale) = stale {
                let _ = stale.close().await;
            }
            return Err(WebRTCError::InvalidState("session closed during negotiation".to_string()));
        }

        self.install_handlers(&peer_connection);

        let answer = answer_offer(&peer_connection, offer_sdp).await?;

        let mut phase = self.phase.lock();
        if *phase == SessionPhase::Negotiating {
            *phase = SessionPhase::Active;
        }
        info!("[{}] Negotiated {} session", self.id, self.engine.codec().as_str());
        Ok(answer)
    }

    fn install_handlers(self: &Arc<Self>, peer_connection: &Arc<RTCPeerConnection>) {
        let events = self.events.clone();
        let id = self.id.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = events.clone();
            let id = id.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    debug!("[{}] ICE gathering complete", id);
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = events.send(SignalingEvent::LocalCandidate(init.into()));
                    }
                    Err(e) => warn!("[{}] Failed to serialize local candidate: {}", id, e),
                }
            })
        }));

        let events = self.events.clone();
        let id = self.id.clone();
        peer_connection.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            info!("[{}] Peer connection state: {}", id, state);
            let _ = events.send(SignalingEvent::PeerStateChanged(state));
            Box::pin(async {})
        }));

        let weak: Weak<Self> = Arc::downgrade(self);
        peer_connection.on_track(Box::new(
            move |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _transceiver: Arc<RTCRtpTransceiver>| {
                let weak = weak.clone();
                Box::pin(async move {
                    let Some(session) = weak.upgrade() else {
                        return;
                    };
                    if !session.claim_track(&track) {
                        return;
                    }
                    let handle = tokio::spawn(session.clone().handle_track(track));
                    *session.track_setup.lock() = Some(handle);
                })
            },
        ));
    }

    /// Accept the first inbound video track; everything else is ignored
    fn claim_track(&self, track: &TrackRemote) -> bool {
        if track.kind() != RTPCodecType::Video {
            info!("[{}] Ignoring inbound {} track", self.id, track.kind());
            return false;
        }
        if self.track_claimed.swap(true, Ordering::SeqCst) {
            info!(
                "[{}] Ignoring additional video track (ssrc {}); one pipeline per session",
                self.id,
                track.ssrc()
            );
            return false;
        }
        if self.shutdown.is_triggered() {
            return false;
        }
        true
    }

    async fn handle_track(self: Arc<Self>, track: Arc<TrackRemote>) {
        let codec = track.codec();
        info!(
            "[{}] Inbound video track: {} (ssrc {}, pt {})",
            self.id,
            codec.capability.mime_type,
            track.ssrc(),
            track.payload_type()
        );

        let peer_connection = self.peer_connection.lock().clone();
        let sender = self.sender.lock().clone();
        let (Some(peer_connection), Some(sender)) = (peer_connection, sender) else {
            self.fail("track arrived without a peer connection");
            return;
        };

        let local = Arc::new(TrackLocalStaticSample::new(
            codec.capability.clone(),
            "video".to_string(),
            format!("relay-{}", self.id),
        ));

        let bound = self
            .output
            .replace(local, |track| {
                let sender = sender.clone();
                async move {
                    sender
                        .replace_track(Some(track as Arc<dyn TrackLocal + Send + Sync>))
                        .await
                }
            })
            .await;
        if let Err(e) = bound {
            self.fail(&format!("failed to bind output track: {}", e));
            return;
        }

        let ctx = PipelineContext {
            session_id: self.id.clone(),
            config: self.config.clone(),
            shutdown: self.shutdown.clone(),
            keyframe: self.keyframe.clone(),
            output: self.output.clone(),
        };

        match pipeline::start(ctx, peer_connection, track, sender).await {
            Ok(handle) => {
                let mut guard = self.pipeline.lock().await;
                if self.closed.load(Ordering::SeqCst) {
                    drop(guard);
                    handle.stop(self.join_timeout()).await;
                } else {
                    *guard = Some(handle);
                }
            }
            Err(e) => self.fail(&format!("pipeline failed to start: {}", e)),
        }
    }

    fn fail(&self, reason: &str) {
        error!("[{}] {}; ending session", self.id, reason);
        self.shutdown.trigger();
    }

    fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.config.pipeline.stage_join_timeout_ms)
    }

    /// Add a remote ICE candidate to the peer connection
    pub async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), WebRTCError> {
        let peer_connection = self
            .peer_connection
            .lock()
            .clone()
            .ok_or_else(|| WebRTCError::InvalidState("no peer connection".to_string()))?;
        add_ice_candidate(&peer_connection, candidate.into()).await?;
        self.remote_candidates.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Remote candidates accepted by the peer connection
    pub fn remote_candidates(&self) -> u64 {
        self.remote_candidates.load(Ordering::Relaxed)
    }

    /// Ask the remote publisher for a keyframe
    pub fn request_keyframe(&self) {
        self.keyframe.notify_one();
    }

    /// Tear the session down. Later and concurrent calls return immediately.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.phase.lock() = SessionPhase::Closing;
        info!("[{}] Closing session", self.id);

        self.shutdown.trigger();

        let timeout = self.join_timeout();
        let setup = self.track_setup.lock().take();
        if let Some(mut setup) = setup {
            if tokio::time::timeout(timeout, &mut setup).await.is_err() {
                warn!("[{}] Track setup still running; aborting", self.id);
                setup.abort();
            }
        }

        let pipeline = self.pipeline.lock().await.take();
        if let Some(pipeline) = pipeline {
            pipeline.stop(timeout).await;
        }

        self.output.clear().await;
        self.sender.lock().take();

        let peer_connection = self.peer_connection.lock().take();
        if let Some(peer_connection) = peer_connection {
            if let Err(e) = peer_connection.close().await {
                warn!("[{}] Failed to close peer connection: {}", self.id, e);
            }
        }

        *self.phase.lock() = SessionPhase::Closed;
        info!(
            "[{}] Session closed after {:.1}s",
            self.id,
            self.created_at.elapsed().as_secs_f64()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WebRTCConfig;

    fn test_engine() -> Arc<RtcEngine> {
        let config = WebRTCConfig {
            ice_servers: Vec::new(),
            ..Default::default()
        };
        Arc::new(RtcEngine::new(&config).unwrap())
    }

    fn test_session(id: &str) -> (Arc<PeerSession>, mpsc::UnboundedReceiver<SignalingEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = PeerSession::new(id.to_string(), test_engine(), Arc::new(Config::default()), tx);
        (session, rx)
    }

    async fn browser_offer(engine: &RtcEngine) -> (Arc<RTCPeerConnection>, String) {
        let pc = engine.create_peer_connection().await.unwrap();
        pc.add_transceiver_from_kind(
            RTPCodecType::Video,
            Some(RTCRtpTransceiverInit {
                direction: RTCRtpTransceiverDirection::Sendrecv,
                send_encodings: vec![],
            }),
        )
        .await
        .unwrap();
        let offer = pc.create_offer(None).await.unwrap();
        pc.set_local_description(offer.clone()).await.unwrap();
        (pc, offer.sdp)
    }

    #[tokio::test]
    async fn test_negotiate_then_close() {
        let (session, _events) = test_session("s1");
        assert_eq!(session.phase(), SessionPhase::Created);

        let (browser, offer) = browser_offer(&test_engine()).await;
        let answer = session.negotiate(&offer).await.unwrap();
        assert!(answer.contains("VP8/90000"));
        assert!(answer.contains("a=sendrecv"));
        assert_eq!(session.phase(), SessionPhase::Active);

        // only one negotiation per session
        assert!(matches!(
            session.negotiate(&offer).await,
            Err(WebRTCError::InvalidState(_))
        ));

        session.close().await;
        assert_eq!(session.phase(), SessionPhase::Closed);
        tokio::time::timeout(Duration::from_millis(100), session.terminated())
            .await
            .expect("terminated after close");

        browser.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (session, _events) = test_session("s2");
        tokio::join!(session.close(), session.close());
        session.close().await;
        assert_eq!(session.phase(), SessionPhase::Closed);

        assert!(session.negotiate("v=0").await.is_err());
        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 1 127.0.0.1 9 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        };
        assert!(session.add_remote_candidate(candidate).await.is_err());
    }

    #[tokio::test]
    async fn test_bad_offer_fails_negotiation() {
        let (session, _events) = test_session("s3");
        assert!(session.negotiate("not an sdp").await.is_err());
        session.close().await;
        assert_eq!(session.phase(), SessionPhase::Closed);
    }
}
