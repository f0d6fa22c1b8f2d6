//! Configuration management for rtc-frame-relay

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Video codec negotiated with the browser
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    #[default]
    VP8,
    VP9,
    H264,
}

impl VideoCodec {
    pub fn as_str(&self) -> &'static str {
        match self {
            VideoCodec::H264 => "h264",
            VideoCodec::VP8 => "vp8",
            VideoCodec::VP9 => "vp9",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            VideoCodec::H264 => "video/H264",
            VideoCodec::VP8 => "video/VP8",
            VideoCodec::VP9 => "video/VP9",
        }
    }

    /// Match a negotiated MIME type, case-insensitively
    pub fn from_mime_type(mime_type: &str) -> Option<Self> {
        [VideoCodec::VP8, VideoCodec::VP9, VideoCodec::H264]
            .into_iter()
            .find(|codec| codec.mime_type().eq_ignore_ascii_case(mime_type))
    }

    /// SDP fmtp line registered with the media engine
    pub fn sdp_fmtp_line(&self) -> &'static str {
        match self {
            VideoCodec::H264 => "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f",
            VideoCodec::VP9 => "profile-id=0",
            VideoCodec::VP8 => "",
        }
    }
}

impl std::str::FromStr for VideoCodec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "vp8" => Ok(VideoCodec::VP8),
            "vp9" => Ok(VideoCodec::VP9),
            "h264" => Ok(VideoCodec::H264),
            other => Err(format!("unsupported codec '{}' (expected vp8, vp9 or h264)", other)),
        }
    }
}

/// Hardware encoder selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HardwareEncoder {
    #[default]
    Auto,
    Software,
    Vaapi,   // Intel VA-API
    Nvenc,   // NVIDIA NVENC
    Qsv,     // Intel Quick Sync
}

/// Image format of frames exchanged with the processing service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RelayFrameFormat {
    #[default]
    Jpeg,
    Raw,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// HTTP / signaling server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// WebRTC negotiation configuration
    #[serde(default)]
    pub webrtc: WebRTCConfig,

    /// Per-track pipeline configuration
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Outbound encoder configuration
    #[serde(default)]
    pub encoder: EncoderConfig,

    /// Frame-processing relay configuration
    #[serde(default)]
    pub relay: RelayConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP bind address
    #[serde(default = "default_host")]
    pub host: String,

    /// HTTP port (signaling websocket, health, static files)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Directory with the browser client; static serving is off when unset
    #[serde(default)]
    pub web_root: Option<PathBuf>,

    /// Maximum concurrent connections (0 = unlimited)
    #[serde(default)]
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            web_root: None,
            max_connections: 0,
        }
    }
}

/// WebRTC negotiation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebRTCConfig {
    /// Video codec registered with the media engine
    #[serde(default)]
    pub video_codec: VideoCodec,

    /// Dynamic RTP payload type for the video codec
    #[serde(default = "default_payload_type")]
    pub payload_type: u8,

    /// STUN/TURN server URLs
    #[serde(default = "default_stun_servers")]
    pub ice_servers: Vec<String>,

    /// Number of PLIs sent once per second after the inbound track starts
    #[serde(default = "default_pli_startup_count")]
    pub pli_startup_count: u32,

    /// Periodic PLI interval in seconds once the startup burst is done (0 = off)
    #[serde(default = "default_pli_interval_secs")]
    pub pli_interval_secs: u64,
}

impl Default for WebRTCConfig {
    fn default() -> Self {
        Self {
            video_codec: VideoCodec::VP8,
            payload_type: default_payload_type(),
            ice_servers: default_stun_servers(),
            pli_startup_count: default_pli_startup_count(),
            pli_interval_secs: default_pli_interval_secs(),
        }
    }
}

/// Per-track pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Reorder window of the RTP reassembler, in packets
    #[serde(default = "default_reorder_window")]
    pub reorder_window: u16,

    /// Capacity of the reassembled sample queue
    #[serde(default = "default_queue_capacity")]
    pub sample_queue: usize,

    /// Capacity of the decoded frame queue
    #[serde(default = "default_queue_capacity")]
    pub frame_queue: usize,

    /// Capacity of the encoded frame queue
    #[serde(default = "default_queue_capacity")]
    pub encoded_queue: usize,

    /// Upper bound for joining stage tasks on close, in ms
    #[serde(default = "default_stage_join_timeout_ms")]
    pub stage_join_timeout_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            reorder_window: default_reorder_window(),
            sample_queue: default_queue_capacity(),
            frame_queue: default_queue_capacity(),
            encoded_queue: default_queue_capacity(),
            stage_join_timeout_ms: default_stage_join_timeout_ms(),
        }
    }
}

/// Outbound encoder configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncoderConfig {
    /// Target video bitrate in kbps
    #[serde(default = "default_bitrate_kbps")]
    pub bitrate_kbps: u32,

    /// Keyframe interval in frames
    #[serde(default = "default_keyframe_interval")]
    pub keyframe_interval: u32,

    /// Hardware encoder preference
    #[serde(default)]
    pub hardware_encoder: HardwareEncoder,

    /// Nominal framerate announced on the encoder caps
    #[serde(default = "default_framerate")]
    pub framerate: u32,

    /// Timeout for pulling encoder/decoder output, in ms
    #[serde(default = "default_pull_timeout_ms")]
    pub pull_timeout_ms: u64,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            bitrate_kbps: default_bitrate_kbps(),
            keyframe_interval: default_keyframe_interval(),
            hardware_encoder: HardwareEncoder::Auto,
            framerate: default_framerate(),
            pull_timeout_ms: default_pull_timeout_ms(),
        }
    }
}

/// Frame-processing relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Forward decoded frames to the processing service; mirror them back when false
    #[serde(default = "default_relay_enabled")]
    pub enabled: bool,

    /// gRPC endpoint of the processing service
    #[serde(default = "default_relay_endpoint")]
    pub endpoint: String,

    /// Dial timeout in ms
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Wait for the service to finish its response stream on close, in ms
    #[serde(default = "default_close_timeout_ms")]
    pub close_timeout_ms: u64,

    /// Capacity of the outbound and inbound relay queues
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Image format on the wire
    #[serde(default)]
    pub frame_format: RelayFrameFormat,

    /// JPEG quality (1-100)
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,

    /// Width of raw RGBA frames returned by the service
    #[serde(default = "default_raw_width")]
    pub raw_width: u32,

    /// Height of raw RGBA frames returned by the service
    #[serde(default = "default_raw_height")]
    pub raw_height: u32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            enabled: default_relay_enabled(),
            endpoint: default_relay_endpoint(),
            connect_timeout_ms: default_connect_timeout_ms(),
            close_timeout_ms: default_close_timeout_ms(),
            queue_capacity: default_queue_capacity(),
            frame_format: RelayFrameFormat::Jpeg,
            jpeg_quality: default_jpeg_quality(),
            raw_width: default_raw_width(),
            raw_height: default_raw_height(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            webrtc: WebRTCConfig::default(),
            pipeline: PipelineConfig::default(),
            encoder: EncoderConfig::default(),
            relay: RelayConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.server.port == 0 {
            return Err("Server port must be non-zero".into());
        }

        if !(96..=127).contains(&self.webrtc.payload_type) {
            return Err("WebRTC payload_type must be a dynamic payload type (96-127)".into());
        }

        for url in &self.webrtc.ice_servers {
            if !(url.starts_with("stun:") || url.starts_with("turn:") || url.starts_with("turns:")) {
                return Err(format!("Invalid ICE server URL: {}", url).into());
            }
        }

        if self.pipeline.reorder_window < 2 {
            return Err("Pipeline reorder_window must be at least 2".into());
        }

        if self.pipeline.sample_queue == 0
            || self.pipeline.frame_queue == 0
            || self.pipeline.encoded_queue == 0
        {
            return Err("Pipeline queue capacities must be non-zero".into());
        }

        if self.encoder.bitrate_kbps == 0 {
            return Err("Encoder bitrate must be non-zero".into());
        }
        if self.encoder.keyframe_interval == 0 {
            return Err("Encoder keyframe interval must be non-zero".into());
        }
        if self.encoder.framerate == 0 {
            return Err("Encoder framerate must be non-zero".into());
        }

        // Relay validation
        if self.relay.enabled {
            if !(self.relay.endpoint.starts_with("http://") || self.relay.endpoint.starts_with("https://")) {
                return Err("Relay endpoint must be an http:// or https:// URL".into());
            }
            if self.relay.queue_capacity == 0 {
                return Err("Relay queue capacity must be non-zero".into());
            }
            if self.relay.jpeg_quality == 0 || self.relay.jpeg_quality > 100 {
                return Err("Relay jpeg_quality must be between 1 and 100".into());
            }
            if self.relay.frame_format == RelayFrameFormat::Raw
                && (self.relay.raw_width == 0 || self.relay.raw_height == 0)
            {
                return Err("Relay raw frame dimensions must be non-zero".into());
            }
        }

        Ok(())
    }
}


fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    9912
}

fn default_stun_servers() -> Vec<String> {
    vec!["stun:stun.l.google.com:19302".to_string()]
}

fn default_relay_endpoint() -> String {
    "http://172.27.57.33:50052".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_relay_enabled() -> bool { true }
fn default_payload_type() -> u8 { 96 }
fn default_pli_startup_count() -> u32 { 5 }
fn default_pli_interval_secs() -> u64 { 3 }
fn default_reorder_window() -> u16 { 64 }
fn default_queue_capacity() -> usize { 8 }
fn default_stage_join_timeout_ms() -> u64 { 2000 }
fn default_bitrate_kbps() -> u32 { 2000 }
fn default_keyframe_interval() -> u32 { 60 }
fn default_framerate() -> u32 { 30 }
fn default_pull_timeout_ms() -> u64 { 100 }
fn default_connect_timeout_ms() -> u64 { 5000 }
fn default_close_timeout_ms() -> u64 { 1000 }
fn default_jpeg_quality() -> u8 { 85 }
fn default_raw_width() -> u32 { 640 }
fn default_raw_height() -> u32 { 480 }
