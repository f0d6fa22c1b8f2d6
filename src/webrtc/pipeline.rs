//! Per-track media pipeline
//!
//! ```text
//! read_rtp ─▶ [reader] ─samples─▶ [decode] ─┬─ relay submit ─▶ service ─▶ relay results ─┐
//!                                           └──────────── frames (mirror mode) ───────────┤
//!                                                                                          ▼
//!                  outbound track ◀── [writer] ◀─encoded── [encode] ◀─────────────────────┘
//! ```
//!
//! Reader and writer are async tasks; decode and encode run on blocking
//! threads and own their codec contexts. Every queue is bounded. A stage ends
//! when its input closes or the session shutdown fires, and dropping its
//! output sender lets the next stage drain and end in turn.

use super::media_track::{SampleWriter, TrackSlot};
use super::WebRTCError;
use crate::config::{Config, VideoCodec};
use crate::gstreamer::{EncoderSettings, FrameDecoder, FrameEncoder, GstFrameDecoder, GstFrameEncoder};
use crate::media::{is_keyframe, EncodedFrame, RawFrame, Reassembler, Sample, VIDEO_CLOCK_RATE};
use crate::relay::{FrameCodec, RelayBridge, RelayEnvelope, RelayError, RelayResult};
use crate::shutdown::Shutdown;
use log::{debug, error, info, warn};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::payload_feedbacks::full_intra_request::FullIntraRequest;
use webrtc::rtcp::packet::Packet as RtcpPacket;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

/// Spacing of the PLI burst sent right after the inbound track starts
const STARTUP_PLI_SPACING: Duration = Duration::from_secs(1);

/// Shared state a pipeline needs from its session
#[derive(Clone)]
pub struct PipelineContext {
    pub session_id: String,
    pub config: Arc<Config>,
    pub shutdown: Shutdown,
    /// Asks the remote publisher for a keyframe (PLI)
    pub keyframe: Arc<Notify>,
    pub output: Arc<TrackSlot<TrackLocalStaticSample>>,
}

/// Where decoded frames go
pub enum FrameSink {
    /// Serialize and submit to the processing service
    Relay {
        bridge: Arc<RelayBridge>,
        codec: FrameCodec,
    },
    /// Straight to the encoder (mirror mode)
    Direct(mpsc::Sender<RawFrame>),
}

/// Where the encoder takes frames from
pub enum FrameSource {
    Relay {
        results: mpsc::Receiver<RelayResult>,
        codec: FrameCodec,
    },
    Direct(mpsc::Receiver<RawFrame>),
}

/// Running stages of one pipeline
pub struct PipelineHandle {
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    relay: Option<Arc<RelayBridge>>,
}

impl PipelineHandle {
    /// Close the relay bridge, then wait for every stage to end.
    ///
    /// Stages still running after `timeout` are aborted. Blocking stages
    /// cannot be aborted, but they observe the shutdown signal at every
    /// queue operation.
    pub async fn stop(mut self, timeout: Duration) {
        if let Some(relay) = self.relay.take() {
            relay.close().await;
        }

        let deadline = tokio::time::Instant::now() + timeout;
        for (name, mut handle) in self.tasks.drain(..) {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => debug!("Pipeline stage '{}' finished", name),
                Ok(Err(e)) => warn!("Pipeline stage '{}' failed: {}", name, e),
                Err(_) => {
                    warn!("Pipeline stage '{}' did not stop within {:?}; aborting", name, timeout);
                    handle.abort();
                }
            }
        }
    }
}

impl Drop for PipelineHandle {
    fn drop(&mut self) {
        for (_, handle) in &self.tasks {
            handle.abort();
        }
    }
}

/// Build codec contexts, connect the relay and spawn every stage for an
/// inbound track. Nothing is spawned if any part fails to initialize.
pub async fn start(
    ctx: PipelineContext,
    peer_connection: Arc<RTCPeerConnection>,
    track: Arc<TrackRemote>,
    sender: Arc<RTCRtpSender>,
) -> Result<PipelineHandle, WebRTCError> {
    let config = ctx.config.clone();
    let mime_type = track.codec().capability.mime_type;
    let reassembler = Reassembler::for_mime_type(&mime_type, VIDEO_CLOCK_RATE, config.pipeline.reorder_window)
        .map_err(|e| WebRTCError::MediaError(e.to_string()))?;
    let codec = reassembler.codec();

    let pull_timeout = Duration::from_millis(config.encoder.pull_timeout_ms);
    let decoder = GstFrameDecoder::new(codec, config.encoder.hardware_encoder, pull_timeout)
        .map_err(|e| WebRTCError::MediaError(format!("Decoder setup failed: {}", e)))?;
    let encoder = GstFrameEncoder::new(codec, EncoderSettings::from(&config.encoder))
        .map_err(|e| WebRTCError::MediaError(format!("Encoder setup failed: {}", e)))?;

    let (sink, source, relay) = if config.relay.enabled {
        let bridge = RelayBridge::connect(&config.relay, ctx.shutdown.clone())
            .await
            .map_err(|e| WebRTCError::MediaError(e.to_string()))?;
        let bridge = Arc::new(bridge);
        let results = bridge
            .take_results()
            .ok_or_else(|| WebRTCError::InvalidState("relay results already taken".to_string()))?;
        let frame_codec = FrameCodec::from(&config.relay);
        (
            FrameSink::Relay {
                bridge: bridge.clone(),
                codec: frame_codec,
            },
            FrameSource::Relay {
                results,
                codec: frame_codec,
            },
            Some(bridge),
        )
    } else {
        let (tx, rx) = mpsc::channel(config.pipeline.frame_queue.max(1));
        (FrameSink::Direct(tx), FrameSource::Direct(rx), None)
    };

    info!(
        "[{}] Starting {} pipeline (decoder: {}, encoder: {}, relay: {})",
        ctx.session_id,
        codec.as_str(),
        decoder.decoder_name(),
        encoder.encoder_name(),
        if relay.is_some() { config.relay.endpoint.as_str() } else { "mirror" }
    );

    let (samples_tx, samples_rx) = mpsc::channel(config.pipeline.sample_queue.max(1));
    let (encoded_tx, encoded_rx) = mpsc::channel(config.pipeline.encoded_queue.max(1));
    let encoder_keyframe = Arc::new(AtomicBool::new(false));
    let shutdown = ctx.shutdown.clone();

    let mut tasks = Vec::with_capacity(6);

    let read_track = track.clone();
    tasks.push((
        "reader",
        tokio::spawn(run_reader(
            move || {
                let track = read_track.clone();
                async move { track.read_rtp().await.map(|(packet, _)| packet) }
            },
            reassembler,
            samples_tx,
            ctx.keyframe.clone(),
            shutdown.clone(),
        )),
    ));

    {
        let keyframe = ctx.keyframe.clone();
        let shutdown = shutdown.clone();
        tasks.push((
            "decode",
            tokio::task::spawn_blocking(move || {
                run_decode(Box::new(decoder), codec, samples_rx, sink, keyframe, shutdown)
            }),
        ));
    }

    {
        let keyframe = encoder_keyframe.clone();
        let shutdown = shutdown.clone();
        tasks.push((
            "encode",
            tokio::task::spawn_blocking(move || {
                run_encode(Box::new(encoder), source, encoded_tx, keyframe, shutdown)
            }),
        ));
    }

    tasks.push((
        "writer",
        tokio::spawn(run_writer(encoded_rx, SampleWriter::new(ctx.output.clone()), shutdown.clone())),
    ));

    tasks.push((
        "sender-rtcp",
        tokio::spawn(run_sender_rtcp(sender, encoder_keyframe, shutdown.clone())),
    ));

    let media_ssrc = track.ssrc();
    let pc = peer_connection;
    tasks.push((
        "pli",
        tokio::spawn(run_pli(
            move || {
                let pc = pc.clone();
                async move {
                    let pli: Box<dyn RtcpPacket + Send + Sync> = Box::new(PictureLossIndication {
                        sender_ssrc: 0,
                        media_ssrc,
                    });
                    pc.write_rtcp(&[pli]).await.map(|_| ())
                }
            },
            ctx.keyframe.clone(),
            config.webrtc.pli_startup_count,
            Duration::from_secs(config.webrtc.pli_interval_secs),
            shutdown,
        )),
    ));

    Ok(PipelineHandle { tasks, relay })
}

/// Read RTP packets, reassemble them and queue complete samples.
///
/// A read error ends the session; there is no retry. A stream restart in the
/// reassembler asks the publisher for a keyframe.
pub async fn run_reader<F, Fut, E>(
    mut read: F,
    mut reassembler: Reassembler,
    samples: mpsc::Sender<Sample>,
    keyframe: Arc<Notify>,
    shutdown: Shutdown,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Packet, E>>,
    E: fmt::Display,
{
    'read: loop {
        if shutdown.is_triggered() {
            break;
        }

        let packet = tokio::select! {
            _ = shutdown.triggered() => break,
            result = read() => match result {
                Ok(packet) => packet,
                Err(e) => {
                    warn!("RTP read failed, ending session: {}", e);
                    shutdown.trigger();
                    break;
                }
            },
        };

        let resyncs = reassembler.resyncs();
        reassembler.push(packet);
        if reassembler.resyncs() != resyncs {
            warn!("RTP sequence discontinuity, requesting keyframe");
            keyframe.notify_one();
        }
        while let Some(sample) = reassembler.pop() {
            tokio::select! {
                _ = shutdown.triggered() => break 'read,
                sent = samples.send(sample) => {
                    if sent.is_err() {
                        break 'read;
                    }
                }
            }
        }
    }

    info!("RTP reader stopped: {:?}", reassembler.stats());
}

/// Receive from `rx` on a blocking thread, giving up when shutdown fires
fn recv_blocking<T>(handle: &Handle, rx: &mut mpsc::Receiver<T>, shutdown: &Shutdown) -> Option<T> {
    handle.block_on(async {
        tokio::select! {
            _ = shutdown.triggered() => None,
            item = rx.recv() => item,
        }
    })
}

/// Send on a blocking thread; false when the receiver is gone or shutdown fired
fn send_blocking<T>(handle: &Handle, tx: &mpsc::Sender<T>, item: T, shutdown: &Shutdown) -> bool {
    handle.block_on(async {
        tokio::select! {
            _ = shutdown.triggered() => false,
            sent = tx.send(item) => sent.is_ok(),
        }
    })
}

/// Hand one decoded frame to the sink; false when the stage should stop
fn deliver(handle: &Handle, sink: &FrameSink, frame: RawFrame, is_keyframe: bool, shutdown: &Shutdown) -> bool {
    match sink {
        FrameSink::Direct(tx) => send_blocking(handle, tx, frame, shutdown),
        FrameSink::Relay { bridge, codec } => {
            let image = match codec.encode(&frame) {
                Ok(image) => image,
                Err(e) => {
                    warn!("Failed to serialize frame for relay: {}", e);
                    return true;
                }
            };
            match bridge.submit(RelayEnvelope { image, is_keyframe }) {
                Ok(()) | Err(RelayError::QueueFull) => true,
                Err(RelayError::Closed) => false,
                Err(e) => {
                    error!("Relay submit failed: {}", e);
                    shutdown.trigger();
                    false
                }
            }
        }
    }
}

/// Decode samples into raw frames and hand them to the sink.
///
/// Decode errors skip the sample and ask the publisher for a keyframe. When
/// the input ends, frames still held by the decoder are flushed to the sink.
/// Runs on a blocking thread.
pub fn run_decode(
    mut decoder: Box<dyn FrameDecoder>,
    codec: VideoCodec,
    mut samples: mpsc::Receiver<Sample>,
    sink: FrameSink,
    keyframe: Arc<Notify>,
    shutdown: Shutdown,
) {
    let handle = Handle::current();
    let mut decoded: u64 = 0;
    let mut errors: u64 = 0;
    let mut sink_open = true;

    while let Some(sample) = recv_blocking(&handle, &mut samples, &shutdown) {
        let frame = match decoder.decode(&sample) {
            Ok(Some(frame)) => frame,
            Ok(None) => continue,
            Err(e) => {
                errors += 1;
                if errors <= 5 || errors % 100 == 0 {
                    warn!("Decode failed for {} (error #{}): {}", sample, errors, e);
                }
                keyframe.notify_one();
                continue;
            }
        };
        decoded += 1;
        if decoded == 1 {
            info!("First frame decoded: {}", frame);
        }

        if !deliver(&handle, &sink, frame, is_keyframe(codec, &sample.data), &shutdown) {
            sink_open = false;
            break;
        }
    }

    if sink_open && !shutdown.is_triggered() {
        for frame in decoder.flush() {
            decoded += 1;
            if !deliver(&handle, &sink, frame, false, &shutdown) {
                break;
            }
        }
    }

    debug!("Decode stage stopped ({} frames, {} errors)", decoded, errors);
}

/// Encode frames from the source into the encoded queue.
///
/// Every output the encoder has ready is forwarded after each frame, and the
/// encoder is flushed when the source ends. Runs on a blocking thread.
pub fn run_encode(
    mut encoder: Box<dyn FrameEncoder>,
    mut source: FrameSource,
    encoded: mpsc::Sender<EncodedFrame>,
    keyframe_request: Arc<AtomicBool>,
    shutdown: Shutdown,
) {
    let handle = Handle::current();
    let mut frames: u64 = 0;
    let mut output_open = true;

    'frames: loop {
        let frame = match &mut source {
            FrameSource::Direct(rx) => match recv_blocking(&handle, rx, &shutdown) {
                Some(frame) => frame,
                None => break,
            },
            FrameSource::Relay { results, codec } => {
                let Some(result) = recv_blocking(&handle, results, &shutdown) else {
                    break;
                };
                match codec.decode(&result.image) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!("Discarding processed frame: {}", e);
                        continue;
                    }
                }
            }
        };

        if keyframe_request.swap(false, Ordering::AcqRel) {
            debug!("Forcing keyframe on receiver request");
            encoder.request_keyframe();
        }

        let first = match encoder.encode(&frame) {
            Ok(first) => first,
            Err(e) => {
                warn!("Encode failed for {}: {}", frame, e);
                continue;
            }
        };
        for output in first.into_iter().chain(std::iter::from_fn(|| encoder.next_ready())) {
            frames += 1;
            if !send_blocking(&handle, &encoded, output, &shutdown) {
                output_open = false;
                break 'frames;
            }
        }
    }

    if output_open && !shutdown.is_triggered() {
        for output in encoder.flush() {
            frames += 1;
            if !send_blocking(&handle, &encoded, output, &shutdown) {
                break;
            }
        }
    }

    debug!("Encode stage stopped ({} frames)", frames);
}

/// Write encoded frames to the outbound track
pub async fn run_writer(mut encoded: mpsc::Receiver<EncodedFrame>, mut writer: SampleWriter, shutdown: Shutdown) {
    loop {
        tokio::select! {
            _ = shutdown.triggered() => break,
            frame = encoded.recv() => match frame {
                Some(frame) => writer.write(frame).await,
                None => break,
            },
        }
    }

    debug!(
        "Writer stopped ({} samples written, {} failed)",
        writer.written(),
        writer.failed()
    );
}

/// Drain RTCP arriving for the outbound track; PLI/FIR from the receiver
/// force a keyframe from our encoder.
pub async fn run_sender_rtcp(sender: Arc<RTCRtpSender>, keyframe_request: Arc<AtomicBool>, shutdown: Shutdown) {
    loop {
        let packets = tokio::select! {
            _ = shutdown.triggered() => break,
            result = sender.read_rtcp() => match result {
                Ok((packets, _)) => packets,
                Err(e) => {
                    debug!("Sender RTCP reader stopped: {}", e);
                    break;
                }
            },
        };

        for packet in packets {
            let any = packet.as_any();
            if any.downcast_ref::<PictureLossIndication>().is_some()
                || any.downcast_ref::<FullIntraRequest>().is_some()
            {
                keyframe_request.store(true, Ordering::Release);
            }
        }
    }
}

/// Periodic PLI timer; `None` when the period is zero
fn periodic_timer(period: Duration) -> Option<Interval> {
    if period.is_zero() {
        return None;
    }
    let mut timer = tokio::time::interval_at(Instant::now() + period, period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    Some(timer)
}

async fn next_tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Send Picture Loss Indications to the publisher.
///
/// A burst of `startup_count` PLIs one second apart starts as soon as the
/// task does, then one every `interval` (zero disables the periodic PLI).
/// Each `request` notification sends one immediately without moving the
/// schedule.
pub async fn run_pli<F, Fut, E>(
    mut send: F,
    request: Arc<Notify>,
    startup_count: u32,
    interval: Duration,
    shutdown: Shutdown,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: fmt::Display,
{
    let mut startup = tokio::time::interval(STARTUP_PLI_SPACING);
    startup.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut startup_sent = 0u32;
    let mut periodic = if startup_count == 0 { periodic_timer(interval) } else { None };
    let mut failures = 0u64;

    let mut fire = |reason: &str| {
        debug!("Sending PLI ({})", reason);
        send()
    };

    loop {
        let in_startup = startup_sent < startup_count;
        let result = tokio::select! {
            _ = shutdown.triggered() => break,
            _ = request.notified() => fire("requested").await,
            _ = startup.tick(), if in_startup => {
                startup_sent += 1;
                if startup_sent == startup_count {
                    periodic = periodic_timer(interval);
                }
                fire("startup").await
            }
            _ = next_tick(&mut periodic), if !in_startup => fire("periodic").await,
        };

        if let Err(e) = result {
            failures += 1;
            if failures <= 3 || failures % 50 == 0 {
                debug!("PLI send failed (failure #{}): {}", failures, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gstreamer::GstError;
    use crate::media::PixelLayout;
    use crate::relay::proto::{ImageResponse, StreamImageRequest};
    use bytes::Bytes;
    use futures::StreamExt;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicU32;
    use tokio_stream::wrappers::ReceiverStream;
    use webrtc::rtp::header::Header;

    fn vp8_packet(seq: u16, timestamp: u32, fill: u8) -> Packet {
        Packet {
            header: Header {
                version: 2,
                marker: true,
                payload_type: 96,
                sequence_number: seq,
                timestamp,
                ssrc: 0x1234,
                ..Default::default()
            },
            payload: Bytes::from(vec![0x10, fill, fill, fill]),
        }
    }

    /// Emits a 2x2 I420 frame per sample; samples whose first byte is 0xEE fail
    struct FakeDecoder;

    impl FrameDecoder for FakeDecoder {
        fn decode(&mut self, sample: &Sample) -> Result<Option<RawFrame>, GstError> {
            if sample.data.first() == Some(&0xEE) {
                return Err(GstError::PipelineFailed("corrupt".to_string()));
            }
            let mut data = vec![128u8; PixelLayout::I420.frame_size(2, 2)];
            data[..4].fill(sample.data[0]);
            Ok(Some(RawFrame::new(2, 2, PixelLayout::I420, data)))
        }
    }

    /// Emits the frame's first byte; records keyframe requests
    struct FakeEncoder {
        keyframes: Arc<AtomicU32>,
    }

    impl FrameEncoder for FakeEncoder {
        fn encode(&mut self, frame: &RawFrame) -> Result<Option<EncodedFrame>, GstError> {
            Ok(Some(EncodedFrame {
                data: Bytes::from(vec![frame.data[0]]),
                is_keyframe: false,
            }))
        }

        fn request_keyframe(&mut self) {
            self.keyframes.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Holds every frame back until flushed, like a decoder with reorder delay
    struct HoldingDecoder {
        held: Vec<RawFrame>,
    }

    impl FrameDecoder for HoldingDecoder {
        fn decode(&mut self, sample: &Sample) -> Result<Option<RawFrame>, GstError> {
            let mut data = vec![128u8; PixelLayout::I420.frame_size(2, 2)];
            data[..4].fill(sample.data[0]);
            self.held.push(RawFrame::new(2, 2, PixelLayout::I420, data));
            Ok(None)
        }

        fn flush(&mut self) -> Vec<RawFrame> {
            std::mem::take(&mut self.held)
        }
    }

    /// Produces two outputs per frame: one returned, one left ready
    struct BurstEncoder {
        ready: VecDeque<EncodedFrame>,
        tail: Option<EncodedFrame>,
    }

    impl FrameEncoder for BurstEncoder {
        fn encode(&mut self, frame: &RawFrame) -> Result<Option<EncodedFrame>, GstError> {
            let out = |b: u8| EncodedFrame {
                data: Bytes::from(vec![b]),
                is_keyframe: false,
            };
            self.ready.push_back(out(frame.data[0] + 100));
            self.tail = Some(out(frame.data[0] + 200));
            Ok(Some(out(frame.data[0])))
        }

        fn next_ready(&mut self) -> Option<EncodedFrame> {
            self.ready.pop_front()
        }

        fn request_keyframe(&mut self) {}

        fn flush(&mut self) -> Vec<EncodedFrame> {
            self.tail.take().into_iter().collect()
        }
    }

    fn scripted_reads(packets: Vec<Packet>) -> impl FnMut() -> futures::future::Ready<Result<Packet, String>> {
        let mut queue: VecDeque<Packet> = packets.into();
        move || futures::future::ready(queue.pop_front().ok_or_else(|| "track ended".to_string()))
    }

    #[tokio::test]
    async fn test_reader_stops_and_signals_on_read_error() {
        let shutdown = Shutdown::new();
        let (tx, mut rx) = mpsc::channel(16);
        let reassembler = Reassembler::new(VideoCodec::VP8, VIDEO_CLOCK_RATE, 8).unwrap();
        let packets = (0..4u16).map(|i| vp8_packet(i, i as u32 * 3000, i as u8)).collect();

        run_reader(scripted_reads(packets), reassembler, tx, Arc::new(Notify::new()), shutdown.clone()).await;

        assert!(shutdown.is_triggered());
        let mut timestamps = Vec::new();
        while let Some(sample) = rx.recv().await {
            timestamps.push(sample.timestamp);
        }
        assert_eq!(timestamps, vec![0, 3000, 6000, 9000]);
    }

    #[tokio::test]
    async fn test_reader_requests_keyframe_after_sequence_jump() {
        let shutdown = Shutdown::new();
        let keyframe = Arc::new(Notify::new());
        let (tx, mut rx) = mpsc::channel(256);
        let reassembler = Reassembler::new(VideoCodec::VP8, VIDEO_CLOCK_RATE, 16).unwrap();
        let mut packets: Vec<Packet> = (0..10u16).map(|i| vp8_packet(i, i as u32 * 3000, 1)).collect();
        packets.extend((0..100u16).map(|i| vp8_packet(40010 + i, (10 + i as u32) * 3000, 2)));

        run_reader(scripted_reads(packets), reassembler, tx, keyframe.clone(), shutdown).await;

        tokio::time::timeout(Duration::from_millis(100), keyframe.notified())
            .await
            .expect("keyframe requested");
        let mut after_jump = 0;
        while let Some(sample) = rx.recv().await {
            if sample.data[0] == 2 {
                after_jump += 1;
            }
        }
        assert!(after_jump > 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_mirror_chain_and_decode_error_keyframe() {
        let shutdown = Shutdown::new();
        let keyframe = Arc::new(Notify::new());
        let (samples_tx, samples_rx) = mpsc::channel(4);
        let (frames_tx, frames_rx) = mpsc::channel(4);
        let (encoded_tx, mut encoded_rx) = mpsc::channel(4);
        let encoder_keyframe = Arc::new(AtomicBool::new(true));
        let keyframes = Arc::new(AtomicU32::new(0));

        let decode = {
            let (keyframe, shutdown) = (keyframe.clone(), shutdown.clone());
            tokio::task::spawn_blocking(move || {
                run_decode(
                    Box::new(FakeDecoder),
                    VideoCodec::VP8,
                    samples_rx,
                    FrameSink::Direct(frames_tx),
                    keyframe,
                    shutdown,
                )
            })
        };
        let encode = {
            let (keyframes, flag, shutdown) = (keyframes.clone(), encoder_keyframe.clone(), shutdown.clone());
            tokio::task::spawn_blocking(move || {
                run_encode(
                    Box::new(FakeEncoder { keyframes }),
                    FrameSource::Direct(frames_rx),
                    encoded_tx,
                    flag,
                    shutdown,
                )
            })
        };

        for first in [1u8, 0xEE, 2, 3] {
            let sample = Sample {
                data: Bytes::from(vec![first, 0, 0]),
                timestamp: 0,
                duration: Duration::from_millis(33),
                sequence: 0,
            };
            samples_tx.send(sample).await.unwrap();
        }
        drop(samples_tx);

        let mut out = Vec::new();
        while let Some(frame) = encoded_rx.recv().await {
            out.push(frame.data[0]);
        }
        assert_eq!(out, vec![1, 2, 3]);

        decode.await.unwrap();
        encode.await.unwrap();
        assert_eq!(keyframes.load(Ordering::SeqCst), 1);
        assert!(!encoder_keyframe.load(Ordering::SeqCst));
        // the corrupt sample left a keyframe request for the PLI task
        tokio::time::timeout(Duration::from_millis(100), keyframe.notified())
            .await
            .expect("keyframe requested");
        assert!(!shutdown.is_triggered());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_held_and_queued_output_reaches_the_track() {
        let shutdown = Shutdown::new();
        let (samples_tx, samples_rx) = mpsc::channel(4);
        let (frames_tx, frames_rx) = mpsc::channel(4);
        let (encoded_tx, mut encoded_rx) = mpsc::channel(16);

        let decode = {
            let shutdown = shutdown.clone();
            tokio::task::spawn_blocking(move || {
                run_decode(
                    Box::new(HoldingDecoder { held: Vec::new() }),
                    VideoCodec::VP8,
                    samples_rx,
                    FrameSink::Direct(frames_tx),
                    Arc::new(Notify::new()),
                    shutdown,
                )
            })
        };
        let encode = {
            let shutdown = shutdown.clone();
            tokio::task::spawn_blocking(move || {
                run_encode(
                    Box::new(BurstEncoder {
                        ready: VecDeque::new(),
                        tail: None,
                    }),
                    FrameSource::Direct(frames_rx),
                    encoded_tx,
                    Arc::new(AtomicBool::new(false)),
                    shutdown,
                )
            })
        };

        for first in [1u8, 2] {
            let sample = Sample {
                data: Bytes::from(vec![first, 0, 0]),
                timestamp: 0,
                duration: Duration::from_millis(33),
                sequence: 0,
            };
            samples_tx.send(sample).await.unwrap();
        }
        drop(samples_tx);

        let mut out = Vec::new();
        while let Some(frame) = encoded_rx.recv().await {
            out.push(frame.data[0]);
        }
        // decoder output only appears on flush; each encode yields its frame
        // and the queued one, and the encoder tail comes out at the end
        assert_eq!(out, vec![1, 101, 2, 102, 202]);

        decode.await.unwrap();
        encode.await.unwrap();
        assert!(!shutdown.is_triggered());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_relay_chain_round_trip() {
        let shutdown = Shutdown::new();
        let (requests_tx, requests_rx) = mpsc::channel::<StreamImageRequest>(4);
        let keyflags = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let responses = {
            let keyflags = keyflags.clone();
            ReceiverStream::new(requests_rx).map(move |request| {
                keyflags.lock().push(request.is_key_frame);
                Ok::<_, tonic::Status>(ImageResponse { image: request.image })
            })
        };
        let bridge = Arc::new(RelayBridge::from_stream(
            requests_tx,
            responses,
            4,
            Duration::from_secs(1),
            shutdown.clone(),
        ));
        let codec = FrameCodec::Raw { width: 2, height: 2 };
        let results = bridge.take_results().unwrap();

        let (samples_tx, samples_rx) = mpsc::channel(4);
        let (encoded_tx, mut encoded_rx) = mpsc::channel(4);

        let decode = {
            let (bridge, shutdown) = (bridge.clone(), shutdown.clone());
            tokio::task::spawn_blocking(move || {
                run_decode(
                    Box::new(FakeDecoder),
                    VideoCodec::VP8,
                    samples_rx,
                    FrameSink::Relay { bridge, codec },
                    Arc::new(Notify::new()),
                    shutdown,
                )
            })
        };
        let encode = {
            let shutdown = shutdown.clone();
            tokio::task::spawn_blocking(move || {
                run_encode(
                    Box::new(FakeEncoder {
                        keyframes: Arc::new(AtomicU32::new(0)),
                    }),
                    FrameSource::Relay { results, codec },
                    encoded_tx,
                    Arc::new(AtomicBool::new(false)),
                    shutdown,
                )
            })
        };

        // VP8 keyframe: P bit clear in the first payload byte
        let keyframe_sample = Sample {
            data: Bytes::from(vec![0x10, 0x02, 0x00, 0x9d, 0x01, 0x2a]),
            timestamp: 0,
            duration: Duration::from_millis(33),
            sequence: 0,
        };
        let delta_sample = Sample {
            data: Bytes::from(vec![0x31, 0x00, 0x00]),
            ..keyframe_sample.clone()
        };
        samples_tx.send(keyframe_sample).await.unwrap();
        let first = tokio::time::timeout(Duration::from_secs(2), encoded_rx.recv())
            .await
            .unwrap()
            .unwrap();
        samples_tx.send(delta_sample).await.unwrap();
        let second = tokio::time::timeout(Duration::from_secs(2), encoded_rx.recv())
            .await
            .unwrap()
            .unwrap();

        // luma survives the I420 -> RGBA -> encoder path as gray levels
        assert_eq!(first.data.len(), 1);
        assert_eq!(second.data.len(), 1);
        assert_eq!(*keyflags.lock(), vec![true, false]);

        drop(samples_tx);
        decode.await.unwrap();
        bridge.close().await;
        encode.await.unwrap();
        assert!(!shutdown.is_triggered());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pli_schedule() {
        let shutdown = Shutdown::new();
        let request = Arc::new(Notify::new());
        let sent = Arc::new(AtomicU32::new(0));

        let task = {
            let (sent, request, shutdown) = (sent.clone(), request.clone(), shutdown.clone());
            tokio::spawn(run_pli(
                move || {
                    sent.fetch_add(1, Ordering::SeqCst);
                    futures::future::ready(Ok::<(), String>(()))
                },
                request,
                3,
                Duration::from_secs(3),
                shutdown,
            ))
        };

        // burst at 0s, 1s, 2s
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(sent.load(Ordering::SeqCst), 3);

        // periodic at 5s
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(sent.load(Ordering::SeqCst), 4);

        request.notify_one();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(sent.load(Ordering::SeqCst), 5);

        shutdown.trigger();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_pli_requests_leave_periodic_schedule_alone() {
        let shutdown = Shutdown::new();
        let request = Arc::new(Notify::new());
        let sent = Arc::new(AtomicU32::new(0));

        let task = {
            let (sent, request, shutdown) = (sent.clone(), request.clone(), shutdown.clone());
            tokio::spawn(run_pli(
                move || {
                    sent.fetch_add(1, Ordering::SeqCst);
                    futures::future::ready(Ok::<(), String>(()))
                },
                request,
                0,
                Duration::from_secs(3),
                shutdown,
            ))
        };

        // a request every second; periodic PLIs still land at 3s, 6s and 9s
        for _ in 0..10 {
            tokio::time::sleep(Duration::from_secs(1)).await;
            request.notify_one();
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(sent.load(Ordering::SeqCst), 13);

        shutdown.trigger();
        task.await.unwrap();
    }
}
