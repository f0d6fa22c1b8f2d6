//! HTTP surface: signaling websocket, health check and the browser client

pub mod http_server;
pub use http_server::{router, run_http_server};

use crate::config::Config;
use crate::webrtc::{ConnectionRegistry, RtcEngine};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// State shared by every HTTP handler and signaling connection
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub engine: Arc<RtcEngine>,
    pub registry: Arc<ConnectionRegistry>,
    started_at: Instant,
}

impl AppState {
    pub fn new(config: Arc<Config>, engine: Arc<RtcEngine>, registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            config,
            engine,
            registry,
            started_at: Instant::now(),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}
