//! rtc-frame-relay - Main entry point

use clap::Parser;
use log::{error, info, warn};
use rtc_frame_relay::args::Args;
use rtc_frame_relay::web::{run_http_server, AppState};
use rtc_frame_relay::webrtc::{ConnectionRegistry, RtcEngine};
use std::sync::Arc;
use tokio::signal;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command line arguments
    let args = Args::parse();

    let config_result = args.load_config();
    let mut config = match &config_result {
        Ok(config) => config.clone(),
        Err(_) => Default::default(),
    };
    args.apply_overrides(&mut config);

    // Initialize logging with noise filtering for third-party WebRTC crates
    env_logger::Builder::new()
        .parse_filters(&std::env::var("RELAY_LOG").unwrap_or_else(|_| config.logging.level.clone()))
        .filter_module("webrtc_ice", log::LevelFilter::Error)
        .filter_module("webrtc_dtls", log::LevelFilter::Error)
        .filter_module("webrtc_mdns", log::LevelFilter::Error)
        .init();

    info!("rtc-frame-relay v{}", env!("CARGO_PKG_VERSION"));

    match config_result {
        Ok(_) => info!("Loaded configuration from {:?}", args.config),
        Err(e) => warn!("Failed to load config from {:?}: {}; using defaults", args.config, e),
    }

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        return Err(e);
    }

    info!("Initializing GStreamer...");
    rtc_frame_relay::gstreamer::init()?;
    let encoders = rtc_frame_relay::gstreamer::encoder::list_available_encoders();
    info!("Available encoders: {} found", encoders.len());
    for (name, codec, kind) in &encoders {
        info!("  {} ({}, {:?})", name, codec.as_str(), kind);
    }

    let engine = Arc::new(RtcEngine::new(&config.webrtc)?);
    info!(
        "WebRTC engine ready: {} (payload type {})",
        engine.codec().as_str(),
        engine.payload_type()
    );

    if config.relay.enabled {
        info!("Frame relay endpoint: {}", config.relay.endpoint);
    } else {
        info!("Frame relay disabled; mirroring decoded frames");
    }

    let registry = Arc::new(ConnectionRegistry::new(config.server.max_connections));
    let state = AppState::new(Arc::new(config), engine, registry.clone());

    let shutdown = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C, shutting down..."),
            Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
        }
    };

    let result = run_http_server(state, shutdown).await;

    registry.close_all().await;
    info!("Shutdown complete");

    result
}
