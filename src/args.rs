use clap::Parser;
use std::path::PathBuf;

use crate::config::{self, VideoCodec};

#[derive(Parser, Debug)]
#[command(name = "rtc-frame-relay")]
#[command(author = "Frame Relay Team")]
#[command(version = "0.1.0")]
#[command(about = "WebRTC relay that forwards browser video through a frame-processing service", long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/rtc-frame-relay.toml")]
    pub config: PathBuf,

    /// HTTP / signaling port
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Video codec (vp8, vp9, h264)
    #[arg(long)]
    pub codec: Option<VideoCodec>,

    /// Outbound encoder bitrate in kbps
    #[arg(long)]
    pub bitrate: Option<u32>,

    /// gRPC endpoint of the frame-processing service
    #[arg(long)]
    pub relay_endpoint: Option<String>,

    /// Mirror decoded frames back without the processing service
    #[arg(long, action)]
    pub no_relay: bool,

    /// Directory with the browser client
    #[arg(long)]
    pub web_root: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, action)]
    pub verbose: bool,
}

impl Args {
    pub fn load_config(&self) -> Result<config::Config, Box<dyn std::error::Error>> {
        config::Config::load(&self.config)
    }

    /// Apply command line overrides on top of the loaded file
    pub fn apply_overrides(&self, config: &mut config::Config) {
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(codec) = self.codec {
            config.webrtc.video_codec = codec;
        }
        if let Some(bitrate) = self.bitrate {
            config.encoder.bitrate_kbps = bitrate;
        }
        if let Some(ref endpoint) = self.relay_endpoint {
            config.relay.endpoint = endpoint.clone();
        }
        if self.no_relay {
            config.relay.enabled = false;
        }
        if let Some(ref root) = self.web_root {
            config.server.web_root = Some(root.clone());
        }
        if self.verbose {
            config.logging.level = "debug".to_string();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_apply_to_config() {
        let args = Args::parse_from([
            "rtc-frame-relay",
            "--port",
            "8080",
            "--codec",
            "h264",
            "--no-relay",
        ]);
        let mut cfg = config::Config::default();
        args.apply_overrides(&mut cfg);
        assert_eq!(cfg.server.port, 8080);
        assert_eq!(cfg.webrtc.video_codec, VideoCodec::H264);
        assert!(!cfg.relay.enabled);
        assert_eq!(cfg.encoder.bitrate_kbps, config::EncoderConfig::default().bitrate_kbps);
    }
}
