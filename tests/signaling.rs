//! End-to-end signaling over a real websocket

use futures::{SinkExt, StreamExt};
use rtc_frame_relay::config::{Config, WebRTCConfig};
use rtc_frame_relay::web::{router, AppState};
use rtc_frame_relay::webrtc::{ConnectionRegistry, RtcEngine};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;

fn test_config(max_connections: usize) -> Config {
    let mut config = Config::default();
    config.server.max_connections = max_connections;
    config.relay.enabled = false;
    config.webrtc = WebRTCConfig {
        ice_servers: Vec::new(),
        ..Default::default()
    };
    config
}

async fn start_server(config: Config) -> (SocketAddr, Arc<ConnectionRegistry>, Arc<RtcEngine>) {
    let engine = Arc::new(RtcEngine::new(&config.webrtc).unwrap());
    let registry = Arc::new(ConnectionRegistry::new(config.server.max_connections));
    let state = AppState::new(Arc::new(config), engine.clone(), registry.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router(state)).await.unwrap();
    });
    (addr, registry, engine)
}

async fn wait_for_connections(registry: &ConnectionRegistry, expected: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while registry.len() != expected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("registry reached expected size");
}

async fn next_json<S>(ws: &mut S) -> serde_json::Value
where
    S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("message before timeout")
            .expect("stream open")
            .expect("valid frame");
        if let Message::Text(text) = message {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

async fn health(addr: SocketAddr) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

#[tokio::test]
async fn offer_gets_answer_and_close_removes_connection() {
    let (addr, registry, engine) = start_server(test_config(0)).await;
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", addr))
        .await
        .unwrap();
    wait_for_connections(&registry, 1).await;
    assert!(health(addr).await.contains("\"connections\":1"));

    // messages the server does not act on leave the connection up
    ws.send(Message::Text(r#"{"type":"gameConfig","payload":{}}"#.into()))
        .await
        .unwrap();
    ws.send(Message::Text("{not json".into())).await.unwrap();

    let browser = engine.create_peer_connection().await.unwrap();
    browser
        .add_transceiver_from_kind(
            RTPCodecType::Video,
            Some(RTCRtpTransceiverInit {
                direction: RTCRtpTransceiverDirection::Sendrecv,
                send_encodings: vec![],
            }),
        )
        .await
        .unwrap();
    let offer = browser.create_offer(None).await.unwrap();
    browser.set_local_description(offer.clone()).await.unwrap();

    let message = serde_json::json!({ "type": "offer", "sdp": offer.sdp });
    ws.send(Message::Text(message.to_string().into())).await.unwrap();

    let answer = loop {
        let reply = next_json(&mut ws).await;
        match reply["type"].as_str() {
            Some("answer") => break reply,
            Some("candidate") => continue,
            other => panic!("unexpected reply {:?}", other),
        }
    };
    let sdp = answer["sdp"].as_str().unwrap();
    assert!(sdp.contains("VP8/90000"));
    assert_eq!(registry.len(), 1);

    ws.close(None).await.unwrap();
    wait_for_connections(&registry, 0).await;
    browser.close().await.unwrap();
}

fn candidate_message(n: u16) -> Message {
    let message = serde_json::json!({
        "type": "candidate",
        "candidate": {
            "candidate": format!("candidate:{} 1 udp 2122260223 192.0.2.{} {} typ host", n, n, 50000 + n),
            "sdpMid": "0",
            "sdpMLineIndex": 0,
        }
    });
    Message::Text(message.to_string().into())
}

#[tokio::test]
async fn candidates_around_offer_are_applied_after_remote_description() {
    let (addr, registry, engine) = start_server(test_config(0)).await;
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", addr))
        .await
        .unwrap();
    wait_for_connections(&registry, 1).await;
    let session = registry.sessions().pop().unwrap();

    // the peer connection rejects candidates until it has a remote description
    ws.send(candidate_message(1)).await.unwrap();
    ws.send(candidate_message(2)).await.unwrap();

    let browser = engine.create_peer_connection().await.unwrap();
    browser
        .add_transceiver_from_kind(
            RTPCodecType::Video,
            Some(RTCRtpTransceiverInit {
                direction: RTCRtpTransceiverDirection::Sendrecv,
                send_encodings: vec![],
            }),
        )
        .await
        .unwrap();
    let offer = browser.create_offer(None).await.unwrap();
    browser.set_local_description(offer.clone()).await.unwrap();
    let message = serde_json::json!({ "type": "offer", "sdp": offer.sdp });
    ws.send(Message::Text(message.to_string().into())).await.unwrap();
    ws.send(candidate_message(3)).await.unwrap();

    loop {
        let reply = next_json(&mut ws).await;
        match reply["type"].as_str() {
            Some("answer") => break,
            Some("candidate") => continue,
            other => panic!("unexpected reply {:?}", other),
        }
    }

    tokio::time::timeout(Duration::from_secs(5), async {
        while session.remote_candidates() != 3 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("all three candidates applied");

    ws.close(None).await.unwrap();
    wait_for_connections(&registry, 0).await;
    browser.close().await.unwrap();
}

#[tokio::test]
async fn connection_limit_rejects_extra_client() {
    let (addr, registry, _engine) = start_server(test_config(1)).await;
    let (_first, _) = tokio_tungstenite::connect_async(format!("ws://{}/webrtc", addr))
        .await
        .unwrap();
    wait_for_connections(&registry, 1).await;

    let (mut second, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", addr))
        .await
        .unwrap();
    let reply = next_json(&mut second).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(registry.len(), 1);
}

#[tokio::test]
async fn bad_offer_reports_error_and_tears_down() {
    let (addr, registry, _engine) = start_server(test_config(0)).await;
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", addr))
        .await
        .unwrap();
    wait_for_connections(&registry, 1).await;

    ws.send(Message::Text(r#"{"type":"offer","sdp":"garbage"}"#.into()))
        .await
        .unwrap();
    let reply = next_json(&mut ws).await;
    assert_eq!(reply["type"], "error");
    wait_for_connections(&registry, 0).await;
}
