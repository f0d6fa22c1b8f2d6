//! WebRTC Signaling Server
//!
//! One task per websocket. The task owns the socket, the connection's
//! `SignalingMachine` and its registry entry:
//! 1. Browser messages, peer-connection events and session termination are
//!    turned into `SignalingEvent`s
//! 2. The machine maps each event to effects, executed here in order
//! 3. Negotiation results are fed back into the machine as events
//!
//! Outgoing messages go through an mpsc to a dedicated sender task, which is
//! the only writer of the socket.

use crate::web::AppState;
use crate::webrtc::signaling::{Effect, SignalingEvent, SignalingMachine, SignalingMessage, SignalingState};
use crate::webrtc::PeerSession;
use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

/// How long the sender task may take to flush after the connection ends
const SENDER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Handle a WebRTC signaling WebSocket connection
pub async fn handle_signaling_connection(socket: WebSocket, state: AppState) {
    let id = Uuid::new_v4().to_string();
    info!("[{}] New signaling WebSocket connection established", id);

    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Create a channel for sending messages
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    // Spawn task to forward messages to WebSocket
    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_sender.send(Message::Text(msg.into())).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let session = PeerSession::new(id.clone(), state.engine.clone(), state.config.clone(), events_tx);

    if let Err(e) = state.registry.add(id.clone(), session.clone()) {
        warn!("[{}] Rejecting connection: {}", id, e);
        send(&tx, SignalingMessage::error(&e.to_string()));
    } else {
        let mut machine = SignalingMachine::new();

        while machine.state() != SignalingState::Closed {
            let event = tokio::select! {
                message = ws_receiver.next() => match message {
                    Some(Ok(Message::Text(text))) => match SignalingMessage::from_json(text.as_str()) {
                        Ok(message) => message.into_event(),
                        Err(e) => {
                            warn!("[{}] {}", id, e);
                            continue;
                        }
                    },
                    Some(Ok(Message::Close(_))) | None => SignalingEvent::ChannelClosed,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        debug!("[{}] WebSocket error: {}", id, e);
                        SignalingEvent::ChannelClosed
                    }
                },
                Some(event) = events_rx.recv() => event,
                _ = session.terminated() => SignalingEvent::SessionEnded,
            };

            drive(&mut machine, event, &session, &state, &tx).await;
        }
    }

    // Teardown effects normally remove the entry already; this covers the rest
    state.registry.remove(&id).await;

    drop(tx);
    if tokio::time::timeout(SENDER_DRAIN_TIMEOUT, &mut send_task).await.is_err() {
        send_task.abort();
    }
    info!("[{}] Signaling connection closed", id);
}

/// Feed one event through the machine, executing effects and any events they produce
async fn drive(
    machine: &mut SignalingMachine,
    event: SignalingEvent,
    session: &Arc<PeerSession>,
    state: &AppState,
    tx: &mpsc::UnboundedSender<String>,
) {
    let mut queue = VecDeque::from([event]);
    while let Some(event) = queue.pop_front() {
        for effect in machine.handle(event) {
            if let Some(follow_up) = execute(effect, session, state, tx).await {
                queue.push_back(follow_up);
            }
        }
    }
}

async fn execute(
    effect: Effect,
    session: &Arc<PeerSession>,
    state: &AppState,
    tx: &mpsc::UnboundedSender<String>,
) -> Option<SignalingEvent> {
    let id = &session.id;
    match effect {
        Effect::Negotiate(offer) => {
            info!("[{}] Received SDP offer ({} bytes)", id, offer.len());
            match session.negotiate(&offer).await {
                Ok(answer) => Some(SignalingEvent::Negotiated(answer)),
                Err(e) => {
                    send(tx, SignalingMessage::error(&e.to_string()));
                    Some(SignalingEvent::NegotiationFailed(e.to_string()))
                }
            }
        }
        Effect::SendAnswer(answer) => {
            debug!("[{}] Sending SDP answer", id);
            send(tx, SignalingMessage::answer(answer));
            None
        }
        Effect::AddCandidate(candidate) => {
            if let Err(e) = session.add_remote_candidate(candidate).await {
                warn!("[{}] {}", id, e);
            }
            None
        }
        Effect::SendCandidate(candidate) => {
            send(tx, SignalingMessage::candidate(candidate));
            None
        }
        Effect::RejectOffer => {
            warn!("[{}] Ignoring offer: session already negotiated", id);
            None
        }
        Effect::Ignore(kind) => {
            debug!("[{}] Ignoring '{}' message", id, kind);
            None
        }
        Effect::Teardown(reason) => {
            info!("[{}] Tearing down: {}", id, reason);
            state.registry.remove(id).await;
            None
        }
    }
}

fn send(tx: &mpsc::UnboundedSender<String>, message: SignalingMessage) {
    match message.to_json() {
        Ok(json) => {
            let _ = tx.send(json);
        }
        Err(e) => warn!("{}", e),
    }
}
