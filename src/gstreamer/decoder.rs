//! GStreamer decoder selection and the inbound frame decoder

use super::pipeline::{sample_to_raw_frame, AppPipeline};
use super::{element_available, FrameDecoder, GstError};
use crate::config::{HardwareEncoder, VideoCodec};
use crate::media::{is_keyframe, PixelLayout, RawFrame, Sample};
use gstreamer as gst;
use log::{debug, info, trace, warn};
use std::time::Duration;

/// Decoder availability information
#[derive(Debug, Clone)]
pub struct DecoderInfo {
    pub name: &'static str,
    pub decoder_type: HardwareEncoder,
    pub codec: VideoCodec,
    pub priority: u8,
}

const DECODERS: &[DecoderInfo] = &[
    DecoderInfo { name: "nvh264dec", decoder_type: HardwareEncoder::Nvenc, codec: VideoCodec::H264, priority: 95 },
    DecoderInfo { name: "vaapih264dec", decoder_type: HardwareEncoder::Vaapi, codec: VideoCodec::H264, priority: 90 },
    DecoderInfo { name: "vaapivp8dec", decoder_type: HardwareEncoder::Vaapi, codec: VideoCodec::VP8, priority: 90 },
    DecoderInfo { name: "vaapivp9dec", decoder_type: HardwareEncoder::Vaapi, codec: VideoCodec::VP9, priority: 90 },
    DecoderInfo { name: "avdec_h264", decoder_type: HardwareEncoder::Software, codec: VideoCodec::H264, priority: 50 },
    DecoderInfo { name: "openh264dec", decoder_type: HardwareEncoder::Software, codec: VideoCodec::H264, priority: 40 },
    DecoderInfo { name: "vp8dec", decoder_type: HardwareEncoder::Software, codec: VideoCodec::VP8, priority: 50 },
    DecoderInfo { name: "vp9dec", decoder_type: HardwareEncoder::Software, codec: VideoCodec::VP9, priority: 50 },
];

/// Detect available decoders for a codec, best first
pub fn detect_decoders(codec: VideoCodec) -> Vec<DecoderInfo> {
    let mut available: Vec<DecoderInfo> = DECODERS
        .iter()
        .filter(|d| d.codec == codec && element_available(d.name))
        .cloned()
        .collect();
    available.sort_by(|a, b| b.priority.cmp(&a.priority));
    available
}

/// Decoder selection result
pub struct DecoderSelection {
    pub info: DecoderInfo,
}

impl DecoderSelection {
    /// Select the best available decoder, honoring the hardware preference when possible
    pub fn select(codec: VideoCodec, hw_pref: HardwareEncoder) -> Result<Self, GstError> {
        let available = detect_decoders(codec);

        let chosen = if hw_pref == HardwareEncoder::Auto {
            available.first().cloned()
        } else {
            available
                .iter()
                .find(|d| d.decoder_type == hw_pref)
                .or_else(|| available.iter().find(|d| d.decoder_type == HardwareEncoder::Software))
                .or_else(|| available.first())
                .cloned()
        };

        let info = chosen.ok_or_else(|| {
            GstError::DecoderNotFound(format!("No decoder available for {}", codec.as_str()))
        })?;
        info!("Selected decoder: {} (type: {:?})", info.name, info.decoder_type);
        Ok(Self { info })
    }

    fn create_decoder(&self) -> Result<gst::Element, GstError> {
        gst::ElementFactory::make(self.info.name)
            .name("decoder")
            .build()
            .map_err(|e| GstError::DecoderNotFound(format!("Failed to create decoder '{}': {}", self.info.name, e)))
    }
}

/// Caps describing depacketized samples of a codec
fn compressed_caps(codec: VideoCodec) -> &'static str {
    match codec {
        VideoCodec::VP8 => "video/x-vp8",
        VideoCodec::VP9 => "video/x-vp9",
        VideoCodec::H264 => "video/x-h264,stream-format=byte-stream,alignment=au",
    }
}

/// `appsrc ! [h264parse] ! decoder ! videoconvert ! I420 ! appsink`
///
/// Input is skipped until the first keyframe. A pipeline error tears the
/// pipeline down; the next keyframe starts a fresh one.
pub struct GstFrameDecoder {
    codec: VideoCodec,
    selection: DecoderSelection,
    pipeline: Option<AppPipeline>,
    pull_timeout: Duration,
    running_time: gst::ClockTime,
    awaiting_keyframe: bool,
    decoded: u64,
    rebuilds: u64,
}

impl GstFrameDecoder {
    pub fn new(codec: VideoCodec, hw_pref: HardwareEncoder, pull_timeout: Duration) -> Result<Self, GstError> {
        let selection = DecoderSelection::select(codec, hw_pref)?;
        let pipeline = build_pipeline(codec, &selection)?;

        Ok(Self {
            codec,
            selection,
            pipeline: Some(pipeline),
            pull_timeout,
            running_time: gst::ClockTime::ZERO,
            awaiting_keyframe: true,
            decoded: 0,
            rebuilds: 0,
        })
    }

    pub fn decoder_name(&self) -> &str {
        self.selection.info.name
    }

    fn reset(&mut self, error: &GstError) {
        self.rebuilds += 1;
        warn!(
            "{} decoder failed (reset #{}), waiting for a keyframe: {}",
            self.codec.as_str(),
            self.rebuilds,
            error
        );
        self.pipeline = None;
        self.running_time = gst::ClockTime::ZERO;
        self.awaiting_keyframe = true;
    }

    fn timestamped_buffer(&mut self, sample: &Sample) -> gst::Buffer {
        let duration = gst::ClockTime::from_nseconds(sample.duration.as_nanos() as u64);
        let mut buffer = gst::Buffer::from_slice(sample.data.clone());
        {
            let buffer = buffer.make_mut();
            buffer.set_pts(self.running_time);
            buffer.set_duration(duration);
        }
        self.running_time = self.running_time.saturating_add(duration);
        buffer
    }
}

fn build_pipeline(codec: VideoCodec, selection: &DecoderSelection) -> Result<AppPipeline, GstError> {
    let src_caps = compressed_caps(codec)
        .parse::<gst::Caps>()
        .map_err(|e| GstError::PipelineFailed(format!("Invalid caps: {}", e)))?;
    let sink_caps = format!("video/x-raw,format={}", PixelLayout::I420.gst_format())
        .parse::<gst::Caps>()
        .map_err(|e| GstError::PipelineFailed(format!("Invalid caps: {}", e)))?;

    let mut elements = Vec::new();
    if codec == VideoCodec::H264 {
        elements.push(make_element("h264parse")?);
    }
    elements.push(selection.create_decoder()?);
    elements.push(make_element("videoconvert")?);

    AppPipeline::new(
        &format!("decode-{}", codec.as_str()),
        &src_caps,
        elements,
        Some(&sink_caps),
    )
}

impl FrameDecoder for GstFrameDecoder {
    fn decode(&mut self, sample: &Sample) -> Result<Option<RawFrame>, GstError> {
        if self.awaiting_keyframe && !is_keyframe(self.codec, &sample.data) {
            trace!("Skipping {} until the next keyframe", sample);
            return Ok(None);
        }

        if self.pipeline.is_none() {
            info!("Rebuilding {} decoder pipeline", self.codec.as_str());
            self.pipeline = Some(build_pipeline(self.codec, &self.selection)?);
        }
        self.awaiting_keyframe = false;

        let buffer = self.timestamped_buffer(sample);
        let result = match self.pipeline.as_ref() {
            Some(pipeline) => pipeline
                .push(buffer)
                .and_then(|()| pipeline.pull(self.pull_timeout)),
            None => Ok(None),
        };

        match result {
            Ok(Some(out)) => {
                let frame = sample_to_raw_frame(&out)?;
                self.decoded += 1;
                if self.decoded == 1 {
                    info!("First {} frame decoded: {}", self.codec.as_str(), frame);
                }
                Ok(Some(frame))
            }
            Ok(None) => {
                debug!("Decoder needs more input ({})", sample);
                Ok(None)
            }
            Err(e) => {
                self.reset(&e);
                Err(e)
            }
        }
    }

    fn flush(&mut self) -> Vec<RawFrame> {
        let Some(pipeline) = self.pipeline.take() else {
            return Vec::new();
        };
        pipeline
            .drain(self.pull_timeout)
            .iter()
            .filter_map(|s| sample_to_raw_frame(s).ok())
            .collect()
    }
}

pub(crate) fn make_element(name: &str) -> Result<gst::Element, GstError> {
    gst::ElementFactory::make(name)
        .build()
        .map_err(|e| GstError::PipelineFailed(format!("Failed to create {}: {}", name, e)))
}
