//! GStreamer encoder selection and the outbound frame encoder
//!
//! Handles automatic detection and selection of hardware/software encoders
//! based on system capabilities.

use super::decoder::make_element;
use super::pipeline::{raw_frame_to_buffer, video_info, AppPipeline};
use super::{element_available, FrameEncoder, GstError};
use crate::config::{EncoderConfig, HardwareEncoder, VideoCodec};
use crate::media::{EncodedFrame, PixelLayout, RawFrame};
use bytes::Bytes;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_video as gst_video;
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::time::Duration;

/// Encoder availability information
#[derive(Debug, Clone)]
pub struct EncoderInfo {
    pub name: &'static str,
    pub encoder_type: HardwareEncoder,
    pub codec: VideoCodec,
    pub priority: u8,  // Higher = preferred
}

/// Software encoders
const SOFTWARE_ENCODERS: &[EncoderInfo] = &[
    EncoderInfo { name: "x264enc", encoder_type: HardwareEncoder::Software, codec: VideoCodec::H264, priority: 50 },
    EncoderInfo { name: "openh264enc", encoder_type: HardwareEncoder::Software, codec: VideoCodec::H264, priority: 40 },
    EncoderInfo { name: "vp8enc", encoder_type: HardwareEncoder::Software, codec: VideoCodec::VP8, priority: 50 },
    EncoderInfo { name: "vp9enc", encoder_type: HardwareEncoder::Software, codec: VideoCodec::VP9, priority: 50 },
];

/// VA-API hardware encoders (Intel, AMD)
const VAAPI_ENCODERS: &[EncoderInfo] = &[
    EncoderInfo { name: "vaapih264enc", encoder_type: HardwareEncoder::Vaapi, codec: VideoCodec::H264, priority: 90 },
    EncoderInfo { name: "vaapivp8enc", encoder_type: HardwareEncoder::Vaapi, codec: VideoCodec::VP8, priority: 90 },
    EncoderInfo { name: "vaapivp9enc", encoder_type: HardwareEncoder::Vaapi, codec: VideoCodec::VP9, priority: 90 },
];

/// NVIDIA NVENC encoders
const NVENC_ENCODERS: &[EncoderInfo] = &[
    EncoderInfo { name: "nvh264enc", encoder_type: HardwareEncoder::Nvenc, codec: VideoCodec::H264, priority: 95 },
    EncoderInfo { name: "nvv4l2h264enc", encoder_type: HardwareEncoder::Nvenc, codec: VideoCodec::H264, priority: 85 },
];

/// Intel Quick Sync encoders
const QSV_ENCODERS: &[EncoderInfo] = &[
    EncoderInfo { name: "qsvh264enc", encoder_type: HardwareEncoder::Qsv, codec: VideoCodec::H264, priority: 92 },
    EncoderInfo { name: "qsvvp9enc", encoder_type: HardwareEncoder::Qsv, codec: VideoCodec::VP9, priority: 92 },
];

/// Detect available encoders for a codec, best first
pub fn detect_encoders(codec: VideoCodec) -> Vec<EncoderInfo> {
    let mut available = Vec::new();

    for table in [NVENC_ENCODERS, QSV_ENCODERS, VAAPI_ENCODERS, SOFTWARE_ENCODERS] {
        for encoder in table {
            if encoder.codec == codec && element_available(encoder.name) {
                debug!("Found {:?} encoder: {}", encoder.encoder_type, encoder.name);
                available.push(encoder.clone());
            }
        }
    }

    // Sort by priority (highest first)
    available.sort_by(|a, b| b.priority.cmp(&a.priority));

    available
}

/// Encoder selection result
pub struct EncoderSelection {
    pub info: EncoderInfo,
}

impl EncoderSelection {
    /// Select the best encoder for the given codec and hardware preference
    pub fn select(codec: VideoCodec, hw_pref: HardwareEncoder) -> Result<Self, GstError> {
        let available = detect_encoders(codec);

        // If specific hardware preference is requested, try to find it
        if hw_pref != HardwareEncoder::Auto {
            if let Some(encoder) = available.iter().find(|e| e.encoder_type == hw_pref) {
                info!("Selected requested encoder: {} ({:?})", encoder.name, hw_pref);
                return Ok(Self { info: encoder.clone() });
            }
            warn!("Requested encoder type {:?} not available, using best alternative", hw_pref);
        }

        let best = available.into_iter().next().ok_or_else(|| {
            GstError::EncoderNotFound(format!("No encoder available for {}", codec.as_str()))
        })?;
        info!("Selected encoder: {} (type: {:?}, priority: {})", best.name, best.encoder_type, best.priority);

        Ok(Self { info: best })
    }

    /// Create the GStreamer encoder element with appropriate settings
    pub fn create_encoder(&self, bitrate_kbps: u32, keyframe_interval: u32) -> Result<gst::Element, GstError> {
        let encoder = match self.info.name {
            // Software H.264 (x264)
            "x264enc" => {
                gst::ElementFactory::make("x264enc")
                    .name("encoder")
                    .property_from_str("tune", "zerolatency")
                    .property_from_str("speed-preset", "superfast")
                    .property("bitrate", bitrate_kbps)
                    .property("key-int-max", keyframe_interval)
                    .property("b-adapt", false)
                    .property("bframes", 0u32)
                    .build()
            }

            // OpenH264
            "openh264enc" => {
                gst::ElementFactory::make("openh264enc")
                    .name("encoder")
                    .property("bitrate", bitrate_kbps * 1000)  // bps
                    .property("gop-size", keyframe_interval)
                    .build()
            }

            // VP8/VP9 software
            "vp8enc" | "vp9enc" => {
                gst::ElementFactory::make(self.info.name)
                    .name("encoder")
                    .property("target-bitrate", (bitrate_kbps * 1000) as i32)
                    .property("keyframe-max-dist", keyframe_interval as i32)
                    .property("deadline", 1i64)  // Realtime
                    .property("cpu-used", 8i32)
                    .property("lag-in-frames", 0i32)
                    .build()
            }

            // VA-API H.264
            "vaapih264enc" => {
                gst::ElementFactory::make("vaapih264enc")
                    .name("encoder")
                    .property("bitrate", bitrate_kbps)
                    .property("keyframe-period", keyframe_interval)
                    .build()
            }

            // VA-API VP8/VP9
            "vaapivp8enc" | "vaapivp9enc" => {
                gst::ElementFactory::make(self.info.name)
                    .name("encoder")
                    .property("bitrate", bitrate_kbps)
                    .property("keyframe-period", keyframe_interval)
                    .build()
            }

            // NVIDIA NVENC H.264
            "nvh264enc" => {
                gst::ElementFactory::make("nvh264enc")
                    .name("encoder")
                    .property("bitrate", bitrate_kbps)
                    .property("gop-size", keyframe_interval as i32)
                    .property("zerolatency", true)
                    .build()
            }

            // NVIDIA V4L2 H.264
            "nvv4l2h264enc" => {
                gst::ElementFactory::make("nvv4l2h264enc")
                    .name("encoder")
                    .property("bitrate", bitrate_kbps * 1000)
                    .property("iframeinterval", keyframe_interval)
                    .build()
            }

            // Intel QSV
            "qsvh264enc" | "qsvvp9enc" => {
                gst::ElementFactory::make(self.info.name)
                    .name("encoder")
                    .property("bitrate", bitrate_kbps)
                    .property("gop-size", keyframe_interval)
                    .build()
            }

            _ => {
                return Err(GstError::EncoderNotFound(format!("Unknown encoder: {}", self.info.name)));
            }
        };

        encoder.map_err(|e| {
            GstError::EncoderNotFound(format!("Failed to create encoder '{}': {}", self.info.name, e))
        })
    }
}

/// Get a list of all available encoders for diagnostics
pub fn list_available_encoders() -> Vec<(String, VideoCodec, HardwareEncoder)> {
    let mut result = Vec::new();

    for codec in [VideoCodec::VP8, VideoCodec::VP9, VideoCodec::H264] {
        for encoder in detect_encoders(codec) {
            result.push((encoder.name.to_string(), encoder.codec, encoder.encoder_type));
        }
    }

    result
}

/// Encoder tuning
#[derive(Debug, Clone)]
pub struct EncoderSettings {
    /// Target bitrate in kbps
    pub bitrate_kbps: u32,
    /// Keyframe interval in frames
    pub keyframe_interval: u32,
    /// Hardware encoder preference
    pub hardware_encoder: HardwareEncoder,
    /// Nominal framerate for caps and timestamps
    pub framerate: u32,
    /// Wait for encoder output, per frame
    pub pull_timeout: Duration,
}

impl From<&EncoderConfig> for EncoderSettings {
    fn from(config: &EncoderConfig) -> Self {
        Self {
            bitrate_kbps: config.bitrate_kbps,
            keyframe_interval: config.keyframe_interval,
            hardware_encoder: config.hardware_encoder,
            framerate: config.framerate,
            pull_timeout: Duration::from_millis(config.pull_timeout_ms),
        }
    }
}

/// Geometry the current pipeline was built for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Geometry {
    width: u32,
    height: u32,
    layout: PixelLayout,
}

/// `appsrc ! videoconvert ! <encoder> [! h264parse] ! appsink`
///
/// The pipeline is built on the first frame and rebuilt whenever the frame
/// geometry changes.
pub struct GstFrameEncoder {
    codec: VideoCodec,
    settings: EncoderSettings,
    selection: EncoderSelection,
    pipeline: Option<(AppPipeline, Geometry, gst_video::VideoInfo)>,
    frame_count: u64,
    keyframe_pending: bool,
    /// Output pulled after the last push but not yet returned
    ready: VecDeque<EncodedFrame>,
}

impl GstFrameEncoder {
    pub fn new(codec: VideoCodec, settings: EncoderSettings) -> Result<Self, GstError> {
        let selection = EncoderSelection::select(codec, settings.hardware_encoder)?;
        let mut required = vec!["videoconvert"];
        if codec == VideoCodec::H264 {
            required.push("h264parse");
        }
        for name in required {
            if !element_available(name) {
                return Err(GstError::PipelineFailed(format!("Missing element: {}", name)));
            }
        }

        Ok(Self {
            codec,
            settings,
            selection,
            pipeline: None,
            frame_count: 0,
            keyframe_pending: false,
            ready: VecDeque::new(),
        })
    }

    /// Name of the selected encoder element
    pub fn encoder_name(&self) -> &str {
        self.selection.info.name
    }

    fn build_pipeline(&self, geometry: Geometry) -> Result<(AppPipeline, gst_video::VideoInfo), GstError> {
        let info = video_info(geometry.layout, geometry.width, geometry.height, self.settings.framerate)?;
        let src_caps = info
            .to_caps()
            .map_err(|e| GstError::PipelineFailed(format!("Invalid caps: {}", e)))?;

        let mut elements = vec![
            make_element("videoconvert")?,
            self.selection.create_encoder(self.settings.bitrate_kbps, self.settings.keyframe_interval)?,
        ];

        let sink_caps = if self.codec == VideoCodec::H264 {
            let parse = gst::ElementFactory::make("h264parse")
                .property("config-interval", -1i32)
                .build()
                .map_err(|e| GstError::PipelineFailed(format!("Failed to create h264parse: {}", e)))?;
            elements.push(parse);
            Some(
                "video/x-h264,stream-format=byte-stream,alignment=au"
                    .parse::<gst::Caps>()
                    .map_err(|e| GstError::PipelineFailed(format!("Invalid caps: {}", e)))?,
            )
        } else {
            None
        };

        let pipeline = AppPipeline::new(
            &format!("encode-{}-{}x{}", self.codec.as_str(), geometry.width, geometry.height),
            &src_caps,
            elements,
            sink_caps.as_ref(),
        )?;
        info!(
            "Encoder pipeline ready: {} {}x{} {:?} @ {} kbps",
            self.selection.info.name, geometry.width, geometry.height, geometry.layout, self.settings.bitrate_kbps
        );
        Ok((pipeline, info))
    }

    fn send_force_keyunit(pipeline: &AppPipeline) {
        if let Some(encoder) = pipeline.element("encoder") {
            let event = gst_video::UpstreamForceKeyUnitEvent::builder()
                .all_headers(true)
                .build();
            if !encoder.send_event(event) {
                warn!("Failed to send force-keyunit event to encoder");
            } else {
                debug!("Sent force-keyunit event to encoder");
            }
        } else {
            warn!("No encoder element found for keyframe request");
        }
    }

}

fn encoded_from_sample(sample: &gst::Sample) -> Option<EncodedFrame> {
    let buffer = sample.buffer()?;
    let map = buffer.map_readable().ok()?;
    Some(EncodedFrame {
        data: Bytes::copy_from_slice(map.as_slice()),
        is_keyframe: !buffer.flags().contains(gst::BufferFlags::DELTA_UNIT),
    })
}

impl FrameEncoder for GstFrameEncoder {
    fn encode(&mut self, frame: &RawFrame) -> Result<Option<EncodedFrame>, GstError> {
        let geometry = Geometry {
            width: frame.width,
            height: frame.height,
            layout: frame.layout,
        };

        let rebuild = match &self.pipeline {
            Some((_, current, _)) => *current != geometry,
            None => true,
        };
        if rebuild {
            if self.pipeline.is_some() {
                info!("Frame geometry changed to {}x{}, rebuilding encoder", frame.width, frame.height);
            }
            // Drop the old pipeline before building the new one
            self.pipeline = None;
            let (pipeline, info) = self.build_pipeline(geometry)?;
            self.pipeline = Some((pipeline, geometry, info));
        }

        let Some((pipeline, _, info)) = self.pipeline.as_ref() else {
            return Ok(None);
        };

        if self.keyframe_pending {
            Self::send_force_keyunit(pipeline);
            self.keyframe_pending = false;
        }

        let mut buffer = raw_frame_to_buffer(frame, info)?;
        {
            let frame_ns = 1_000_000_000u64 / self.settings.framerate.max(1) as u64;
            let buffer = buffer.make_mut();
            buffer.set_pts(gst::ClockTime::from_nseconds(self.frame_count * frame_ns));
            buffer.set_duration(gst::ClockTime::from_nseconds(frame_ns));
        }
        self.frame_count += 1;

        pipeline.push(buffer)?;

        // Wait for the first output, then take whatever else is already queued
        let mut wait = self.settings.pull_timeout;
        while let Some(sample) = pipeline.pull(wait)? {
            if let Some(encoded) = encoded_from_sample(&sample) {
                self.ready.push_back(encoded);
            }
            wait = Duration::ZERO;
        }

        Ok(self.ready.pop_front())
    }

    fn next_ready(&mut self) -> Option<EncodedFrame> {
        self.ready.pop_front()
    }

    fn request_keyframe(&mut self) {
        self.keyframe_pending = true;
    }

    fn flush(&mut self) -> Vec<EncodedFrame> {
        let mut out: Vec<EncodedFrame> = self.ready.drain(..).collect();
        if let Some((pipeline, _, _)) = self.pipeline.take() {
            out.extend(
                pipeline
                    .drain(self.settings.pull_timeout)
                    .iter()
                    .filter_map(encoded_from_sample),
            );
        }
        out
    }
}
