//! appsrc → elements → appsink pipeline shared by the decoder and encoder
//!
//! Also converts between tightly packed `RawFrame` bytes and GStreamer video
//! buffers, whose planes may carry stride padding.

use super::GstError;
use crate::media::{PixelLayout, RawFrame};
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use gstreamer_video::prelude::*;
use log::{debug, info, warn};
use std::time::Duration;

/// Linear pipeline fed through appsrc and drained through appsink
pub struct AppPipeline {
    name: String,
    pipeline: gst::Pipeline,
    appsrc: gst_app::AppSrc,
    appsink: gst_app::AppSink,
}

impl AppPipeline {
    /// Build and link `appsrc ! elements... ! appsink`
    pub fn new(
        name: &str,
        src_caps: &gst::Caps,
        elements: Vec<gst::Element>,
        sink_caps: Option<&gst::Caps>,
    ) -> Result<Self, GstError> {
        let pipeline = gst::Pipeline::with_name(name);

        let appsrc = gst_app::AppSrc::builder()
            .name("src")
            .caps(src_caps)
            .format(gst::Format::Time)
            .is_live(true)
            .build();

        let mut sink_builder = gst_app::AppSink::builder()
            .name("sink")
            .sync(false)
            .max_buffers(0)
            .drop(false);
        if let Some(caps) = sink_caps {
            sink_builder = sink_builder.caps(caps);
        }
        let appsink = sink_builder.build();

        let mut chain: Vec<gst::Element> = Vec::with_capacity(elements.len() + 2);
        chain.push(appsrc.clone().upcast());
        chain.extend(elements);
        chain.push(appsink.clone().upcast());

        pipeline
            .add_many(chain.iter())
            .map_err(|e| GstError::PipelineFailed(format!("Failed to add elements: {}", e)))?;

        for pair in chain.windows(2) {
            pair[0].link(&pair[1]).map_err(|e| {
                GstError::LinkFailed(format!("{}->{}: {}", pair[0].name(), pair[1].name(), e))
            })?;
        }

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| GstError::StateChangeFailed(format!("Failed to start {}: {}", name, e)))?;

        info!("Started GStreamer pipeline {}", name);

        Ok(Self {
            name: name.to_string(),
            pipeline,
            appsrc,
            appsink,
        })
    }

    /// Push one buffer into appsrc
    pub fn push(&self, buffer: gst::Buffer) -> Result<(), GstError> {
        self.appsrc
            .push_buffer(buffer)
            .map(|_| ())
            .map_err(|e| GstError::BufferFailed(format!("{} appsrc push failed: {:?}", self.name, e)))
    }

    /// Pull one sample, waiting at most `timeout`
    pub fn pull(&self, timeout: Duration) -> Result<Option<gst::Sample>, GstError> {
        let timeout = gst::ClockTime::from_mseconds(timeout.as_millis() as u64);
        match self.appsink.try_pull_sample(timeout) {
            Some(sample) => Ok(Some(sample)),
            None => {
                self.check_bus()?;
                Ok(None)
            }
        }
    }

    /// Signal end of stream and collect every sample still in flight
    pub fn drain(&self, timeout: Duration) -> Vec<gst::Sample> {
        if let Err(e) = self.appsrc.end_of_stream() {
            debug!("{} end_of_stream failed: {:?}", self.name, e);
            return Vec::new();
        }
        let timeout = gst::ClockTime::from_mseconds(timeout.as_millis() as u64);
        let mut samples = Vec::new();
        while let Some(sample) = self.appsink.try_pull_sample(timeout) {
            samples.push(sample);
        }
        samples
    }

    /// Look up an element of the pipeline by name
    pub fn element(&self, name: &str) -> Option<gst::Element> {
        self.pipeline.by_name(name)
    }

    /// Surface asynchronous pipeline errors posted on the bus
    fn check_bus(&self) -> Result<(), GstError> {
        let Some(bus) = self.pipeline.bus() else {
            return Ok(());
        };
        while let Some(msg) = bus.pop_filtered(&[gst::MessageType::Error, gst::MessageType::Warning]) {
            match msg.view() {
                gst::MessageView::Error(err) => {
                    return Err(GstError::PipelineFailed(format!(
                        "{}: {} ({:?})",
                        self.name,
                        err.error(),
                        err.debug()
                    )));
                }
                gst::MessageView::Warning(w) => {
                    warn!("{}: {} ({:?})", self.name, w.error(), w.debug());
                }
                _ => {}
            }
        }
        Ok(())
    }
}

impl Drop for AppPipeline {
    fn drop(&mut self) {
        if let Err(e) = self.pipeline.set_state(gst::State::Null) {
            warn!("Failed to stop pipeline {}: {}", self.name, e);
        }
    }
}

fn video_format(layout: PixelLayout) -> gst_video::VideoFormat {
    match layout {
        PixelLayout::I420 => gst_video::VideoFormat::I420,
        PixelLayout::Rgba => gst_video::VideoFormat::Rgba,
        PixelLayout::Rgb => gst_video::VideoFormat::Rgb,
    }
}

/// Bytes per row and row count of each plane, tightly packed
fn plane_geometry(layout: PixelLayout, width: u32, height: u32) -> Vec<(usize, usize)> {
    let (w, h) = (width as usize, height as usize);
    match layout {
        PixelLayout::I420 => {
            let (cw, ch) = ((w + 1) / 2, (h + 1) / 2);
            vec![(w, h), (cw, ch), (cw, ch)]
        }
        PixelLayout::Rgba => vec![(w * 4, h)],
        PixelLayout::Rgb => vec![(w * 3, h)],
    }
}

/// Video info for a raw frame of the given geometry
pub fn video_info(layout: PixelLayout, width: u32, height: u32, framerate: u32) -> Result<gst_video::VideoInfo, GstError> {
    gst_video::VideoInfo::builder(video_format(layout), width, height)
        .fps(gst::Fraction::new(framerate.max(1) as i32, 1))
        .build()
        .map_err(|e| GstError::InvalidFrame(format!("Bad video info {}x{}: {}", width, height, e)))
}

/// Copy a tightly packed frame into a GStreamer buffer with the layout's strides
pub fn raw_frame_to_buffer(frame: &RawFrame, info: &gst_video::VideoInfo) -> Result<gst::Buffer, GstError> {
    if !frame.is_well_formed() {
        return Err(GstError::InvalidFrame(frame.to_string()));
    }

    let buffer = gst::Buffer::with_size(info.size())
        .map_err(|e| GstError::BufferFailed(format!("Buffer alloc failed: {}", e)))?;
    let mut video_frame = gst_video::VideoFrame::from_buffer_writable(buffer, info)
        .map_err(|_| GstError::BufferFailed("Failed to map video frame".to_string()))?;

    let mut offset = 0;
    for (plane, (row_bytes, rows)) in plane_geometry(frame.layout, frame.width, frame.height).into_iter().enumerate() {
        let stride = video_frame.plane_stride()[plane] as usize;
        let dest = video_frame
            .plane_data_mut(plane as u32)
            .map_err(|e| GstError::BufferFailed(format!("Plane {} map failed: {}", plane, e)))?;
        for row in 0..rows {
            let src = &frame.data[offset + row * row_bytes..offset + (row + 1) * row_bytes];
            dest[row * stride..row * stride + row_bytes].copy_from_slice(src);
        }
        offset += row_bytes * rows;
    }

    Ok(video_frame.into_buffer())
}

/// Copy a decoded GStreamer sample into a tightly packed frame
pub fn sample_to_raw_frame(sample: &gst::Sample) -> Result<RawFrame, GstError> {
    let caps = sample
        .caps()
        .ok_or_else(|| GstError::BufferFailed("Sample without caps".to_string()))?;
    let info = gst_video::VideoInfo::from_caps(caps)
        .map_err(|e| GstError::BufferFailed(format!("Unreadable caps: {}", e)))?;
    let layout = PixelLayout::from_gst_format(info.format().to_str())
        .ok_or_else(|| GstError::InvalidFrame(format!("Unexpected format {}", info.format().to_str())))?;
    let buffer = sample
        .buffer()
        .ok_or_else(|| GstError::BufferFailed("Sample without buffer".to_string()))?;

    let video_frame = gst_video::VideoFrameRef::from_buffer_ref_readable(buffer, &info)
        .map_err(|e| GstError::BufferFailed(format!("Failed to map video frame: {}", e)))?;

    let (width, height) = (info.width(), info.height());
    let mut data = Vec::with_capacity(layout.frame_size(width, height));
    for (plane, (row_bytes, rows)) in plane_geometry(layout, width, height).into_iter().enumerate() {
        let stride = video_frame.plane_stride()[plane] as usize;
        let src = video_frame
            .plane_data(plane as u32)
            .map_err(|e| GstError::BufferFailed(format!("Plane {} map failed: {}", plane, e)))?;
        for row in 0..rows {
            data.extend_from_slice(&src[row * stride..row * stride + row_bytes]);
        }
    }

    Ok(RawFrame::new(width, height, layout, data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plane_geometry() {
        assert_eq!(plane_geometry(PixelLayout::I420, 5, 3), vec![(5, 3), (3, 2), (3, 2)]);
        assert_eq!(plane_geometry(PixelLayout::Rgba, 2, 2), vec![(8, 2)]);
    }

    #[test]
    fn test_raw_frame_buffer_conversion() {
        if gst::init().is_err() {
            return;
        }

        // Odd width forces stride padding in the GStreamer buffer
        let (w, h) = (7u32, 5u32);
        let size = PixelLayout::I420.frame_size(w, h);
        let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        let frame = RawFrame::new(w, h, PixelLayout::I420, data.clone());

        let info = video_info(PixelLayout::I420, w, h, 30).unwrap();
        let buffer = raw_frame_to_buffer(&frame, &info).unwrap();
        let sample = gst::Sample::builder().buffer(&buffer).caps(&info.to_caps().unwrap()).build();

        let back = sample_to_raw_frame(&sample).unwrap();
        assert_eq!(back.width, w);
        assert_eq!(back.height, h);
        assert_eq!(back.data, data);
    }

    #[test]
    fn test_malformed_frame_rejected() {
        if gst::init().is_err() {
            return;
        }
        let frame = RawFrame::new(4, 4, PixelLayout::Rgba, vec![0; 3]);
        let info = video_info(PixelLayout::Rgba, 4, 4, 30).unwrap();
        assert!(raw_frame_to_buffer(&frame, &info).is_err());
    }
}
