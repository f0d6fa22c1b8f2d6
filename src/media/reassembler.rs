//! RTP sample reassembly
//!
//! Rebuilds complete compressed frames from a single RTP stream. Packets may
//! arrive out of network order; they are held in a bounded reorder window
//! keyed by extended sequence number and released one timestamp group at a
//! time. Groups that cannot be completed before the window moves past them
//! are dropped.
//!
//! A stream that jumps far enough that every new packet reads as late (a
//! sequence discontinuity of more than half the 16-bit space) is restarted
//! after a run of late packets; see `Reassembler::resyncs`.

use super::{Sample, FALLBACK_SAMPLE_DURATION};
use crate::config::VideoCodec;
use bytes::BytesMut;
use log::{debug, trace};
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::time::Duration;
use webrtc::rtp::codecs::h264::H264Packet;
use webrtc::rtp::codecs::vp8::Vp8Packet;
use webrtc::rtp::codecs::vp9::Vp9Packet;
use webrtc::rtp::packet::Packet;
use webrtc::rtp::packetizer::Depacketizer;

/// Extended sequence space starts here so early reordered packets never underflow.
const SEQUENCE_BASE: u64 = 1 << 32;

/// Smallest usable reorder window
pub const MIN_WINDOW: u16 = 2;

/// Consecutive late packets that restart the stream, for small windows
const MIN_RESYNC_RUN: u64 = 16;

/// Reassembly errors
#[derive(Debug)]
pub enum ReassemblyError {
    /// No depacketizer exists for the negotiated codec
    UnsupportedCodec(String),
    /// Reorder window too small
    InvalidWindow(u16),
}

impl fmt::Display for ReassemblyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReassemblyError::UnsupportedCodec(mime) => write!(f, "Unsupported codec for reassembly: {}", mime),
            ReassemblyError::InvalidWindow(size) => {
                write!(f, "Reorder window must be at least {} packets, got {}", MIN_WINDOW, size)
            }
        }
    }
}

impl Error for ReassemblyError {}

/// Reassembly counters
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReassemblyStats {
    /// Packets handed to `push`
    pub packets_pushed: u64,
    /// Packets already buffered
    pub duplicates: u64,
    /// Packets behind the emission head
    pub late: u64,
    /// Packets discarded by window eviction or incomplete groups
    pub evicted: u64,
    /// Groups whose payload the depacketizer rejected
    pub depacketize_errors: u64,
    /// Completed groups older than the last emitted sample
    pub out_of_order: u64,
    /// Samples returned by `pop`
    pub samples_emitted: u64,
    /// Stream restarts after a sequence discontinuity
    pub resyncs: u64,
}

/// Reorder buffer and depacketizer for one RTP stream
pub struct Reassembler {
    codec: VideoCodec,
    depacketizer: Box<dyn Depacketizer + Send>,
    clock_rate: u32,
    window: u64,
    buffer: BTreeMap<u64, Packet>,
    /// Next extended sequence number to emit
    head: Option<u64>,
    /// Highest extended sequence number seen
    highest: Option<u64>,
    /// Set once anything was emitted or evicted; the head may move backwards before that
    started: bool,
    last_timestamp: Option<u32>,
    /// Consecutive packets dropped as late
    late_run: u64,
    stats: ReassemblyStats,
}

impl Reassembler {
    /// Create a reassembler for a known codec
    pub fn new(codec: VideoCodec, clock_rate: u32, window: u16) -> Result<Self, ReassemblyError> {
        if window < MIN_WINDOW {
            return Err(ReassemblyError::InvalidWindow(window));
        }

        let depacketizer: Box<dyn Depacketizer + Send> = match codec {
            VideoCodec::VP8 => Box::new(Vp8Packet::default()),
            VideoCodec::VP9 => Box::new(Vp9Packet::default()),
            VideoCodec::H264 => Box::new(H264Packet::default()),
        };

        Ok(Self {
            codec,
            depacketizer,
            clock_rate: clock_rate.max(1),
            window: window as u64,
            buffer: BTreeMap::new(),
            head: None,
            highest: None,
            started: false,
            last_timestamp: None,
            late_run: 0,
            stats: ReassemblyStats::default(),
        })
    }

    /// Create a reassembler from a negotiated MIME type (e.g. `video/VP8`)
    pub fn for_mime_type(mime_type: &str, clock_rate: u32, window: u16) -> Result<Self, ReassemblyError> {
        let codec = VideoCodec::from_mime_type(mime_type)
            .ok_or_else(|| ReassemblyError::UnsupportedCodec(mime_type.to_string()))?;
        Self::new(codec, clock_rate, window)
    }

    pub fn codec(&self) -> VideoCodec {
        self.codec
    }

    pub fn stats(&self) -> &ReassemblyStats {
        &self.stats
    }

    /// Number of packets currently held in the reorder window
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Times the stream was restarted; a change means the decoder needs a keyframe
    pub fn resyncs(&self) -> u64 {
        self.stats.resyncs
    }

    /// Accept one packet in arrival order
    pub fn push(&mut self, packet: Packet) {
        self.stats.packets_pushed += 1;

        let seq = packet.header.sequence_number;
        let mut ext = self.extend(seq);

        if let Some(head) = self.head {
            if ext < head && self.started {
                self.late_run += 1;
                if self.late_run >= self.window.max(MIN_RESYNC_RUN) {
                    debug!(
                        "Sequence discontinuity at seq={} after {} late packets; restarting stream",
                        seq, self.late_run
                    );
                    self.resync();
                    ext = self.extend(seq);
                }
            }
        }

        if let Some(head) = self.head {
            if ext < head {
                let within_window = self.highest.map(|h| h - ext < self.window).unwrap_or(false);
                if self.started || !within_window {
                    self.stats.late += 1;
                    trace!("Dropping late packet seq={} (head={})", seq, head);
                    return;
                }
                // Nothing released yet: a reordered stream start moves the head back
                self.head = Some(ext);
            }
        }
        self.late_run = 0;

        if self.buffer.contains_key(&ext) {
            self.stats.duplicates += 1;
            return;
        }

        if self.head.is_none() {
            self.head = Some(ext);
        }
        if self.highest.map(|h| ext > h).unwrap_or(true) {
            self.highest = Some(ext);
        }

        self.buffer.insert(ext, packet);
        self.evict();
    }

    /// Unwrap a 16-bit sequence number relative to the highest one seen
    fn extend(&self, seq: u16) -> u64 {
        match self.highest {
            None => SEQUENCE_BASE + seq as u64,
            Some(highest) => {
                let delta = seq.wrapping_sub(highest as u16) as i16;
                (highest as i64 + delta as i64) as u64
            }
        }
    }

    /// Forget the current stream position; the next packet starts a new one
    fn resync(&mut self) {
        self.stats.evicted += self.buffer.len() as u64;
        self.buffer.clear();
        self.head = None;
        self.highest = None;
        self.started = false;
        self.last_timestamp = None;
        self.late_run = 0;
        self.stats.resyncs += 1;
    }

    /// Release the next complete sample, if any
    pub fn pop(&mut self) -> Option<Sample> {
        loop {
            let head = self.head?;
            let first = self.buffer.get(&head)?;
            let timestamp = first.header.timestamp;

            if !self.depacketizer.is_partition_head(&first.payload) {
                // Start of this group was lost
                self.drop_group(head, timestamp);
                continue;
            }

            let tail = self.find_tail(head, timestamp)?;

            let mut data = BytesMut::new();
            let mut failed = false;
            for seq in head..=tail {
                if let Some(packet) = self.buffer.remove(&seq) {
                    match self.depacketizer.depacketize(&packet.payload) {
                        Ok(chunk) => data.extend_from_slice(&chunk),
                        Err(e) => {
                            debug!("Depacketize failed for seq {}: {}", packet.header.sequence_number, e);
                            failed = true;
                        }
                    }
                }
            }
            self.head = Some(tail + 1);
            self.started = true;

            if failed {
                self.stats.depacketize_errors += 1;
                continue;
            }
            if data.is_empty() {
                continue;
            }

            if let Some(last) = self.last_timestamp {
                if (timestamp.wrapping_sub(last) as i32) < 0 {
                    self.stats.out_of_order += 1;
                    continue;
                }
            }

            let duration = self.duration_since_last(timestamp);
            self.last_timestamp = Some(timestamp);
            self.stats.samples_emitted += 1;

            return Some(Sample {
                data: data.freeze(),
                timestamp,
                duration,
                sequence: head,
            });
        }
    }

    /// Locate the last packet of the group starting at `head`.
    ///
    /// Returns `None` while the group still has a gap or no tail yet.
    fn find_tail(&self, head: u64, timestamp: u32) -> Option<u64> {
        let mut seq = head;
        loop {
            let packet = self.buffer.get(&seq)?;
            if packet.header.timestamp != timestamp {
                // A new group started without a marker on the previous packet
                return Some(seq - 1);
            }
            if self.depacketizer.is_partition_tail(packet.header.marker, &packet.payload) {
                return Some(seq);
            }
            seq += 1;
        }
    }

    /// Discard the contiguous packets at `head` that carry `timestamp`
    fn drop_group(&mut self, head: u64, timestamp: u32) {
        let mut seq = head;
        while let Some(packet) = self.buffer.get(&seq) {
            if packet.header.timestamp != timestamp {
                break;
            }
            self.buffer.remove(&seq);
            self.stats.evicted += 1;
            seq += 1;
        }
        self.head = Some(seq);
        self.started = true;
    }

    /// Advance the head until the newest packet fits inside the window
    fn evict(&mut self) {
        let (Some(head), Some(highest)) = (self.head, self.highest) else {
            return;
        };
        if highest - head < self.window {
            return;
        }

        let mut head = highest + 1 - self.window;
        let kept = self.buffer.split_off(&head);
        let dropped = std::mem::replace(&mut self.buffer, kept);
        let dropped_timestamp = dropped.values().next_back().map(|p| p.header.timestamp);
        self.stats.evicted += dropped.len() as u64;
        self.started = true;

        // Remaining fragments of a dropped group can never complete
        if let Some(timestamp) = dropped_timestamp {
            while let Some(packet) = self.buffer.get(&head) {
                if packet.header.timestamp != timestamp {
                    break;
                }
                self.buffer.remove(&head);
                self.stats.evicted += 1;
                head += 1;
            }
        }

        self.head = Some(head);
    }

    fn duration_since_last(&self, timestamp: u32) -> Duration {
        match self.last_timestamp {
            Some(last) => {
                let delta = timestamp.wrapping_sub(last);
                if delta == 0 {
                    FALLBACK_SAMPLE_DURATION
                } else {
                    Duration::from_secs_f64(delta as f64 / self.clock_rate as f64)
                }
            }
            None => FALLBACK_SAMPLE_DURATION,
        }
    }
}
