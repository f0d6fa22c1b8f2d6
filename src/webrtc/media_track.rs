//! Outbound media track handling
//!
//! `TrackSlot` holds the session's current output track. Replacement is
//! serialized by a writer lock held across the transceiver rebind, while
//! readers only take a short read lock to clone the `Arc`, so they always see
//! either the old or the new track.

use crate::media::{EncodedFrame, FALLBACK_SAMPLE_DURATION};
use log::{debug, warn};
use parking_lot::RwLock;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use webrtc::media::Sample;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

/// Slot for one replaceable output track
pub struct TrackSlot<T: ?Sized> {
    writer: tokio::sync::Mutex<()>,
    current: RwLock<Option<Arc<T>>>,
}

impl<T: ?Sized> TrackSlot<T> {
    pub fn new() -> Self {
        Self {
            writer: tokio::sync::Mutex::new(()),
            current: RwLock::new(None),
        }
    }

    /// Current track, if any
    pub fn current(&self) -> Option<Arc<T>> {
        self.current.read().clone()
    }

    /// Install `track`, running `bind` first under writer exclusion.
    ///
    /// The slot only changes when `bind` succeeds. Returns the previous track.
    pub async fn replace<F, Fut, E>(&self, track: Arc<T>, bind: F) -> Result<Option<Arc<T>>, E>
    where
        F: FnOnce(Arc<T>) -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        let _guard = self.writer.lock().await;
        bind(track.clone()).await?;
        Ok(self.current.write().replace(track))
    }

    /// Remove the current track
    pub async fn clear(&self) -> Option<Arc<T>> {
        let _guard = self.writer.lock().await;
        self.current.write().take()
    }
}

impl<T: ?Sized> Default for TrackSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Writes encoded frames to the slot's track with wall-clock durations
pub struct SampleWriter {
    slot: Arc<TrackSlot<TrackLocalStaticSample>>,
    last_write: Option<Instant>,
    written: u64,
    failed: u64,
}

impl SampleWriter {
    pub fn new(slot: Arc<TrackSlot<TrackLocalStaticSample>>) -> Self {
        Self {
            slot,
            last_write: None,
            written: 0,
            failed: 0,
        }
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn failed(&self) -> u64 {
        self.failed
    }

    /// Duration since the previous output, or the fallback for the first one
    fn next_duration(&mut self, now: Instant) -> Duration {
        let duration = match self.last_write {
            Some(last) => now.saturating_duration_since(last),
            None => FALLBACK_SAMPLE_DURATION,
        };
        self.last_write = Some(now);
        if duration.is_zero() {
            FALLBACK_SAMPLE_DURATION
        } else {
            duration
        }
    }

    /// Write one frame. Failures are logged and the frame skipped.
    pub async fn write(&mut self, frame: EncodedFrame) {
        let duration = self.next_duration(Instant::now());
        let Some(track) = self.slot.current() else {
            debug!("No output track installed; dropping encoded frame");
            return;
        };

        let sample = Sample {
            data: frame.data,
            duration,
            ..Default::default()
        };

        match track.write_sample(&sample).await {
            Ok(()) => {
                self.written += 1;
                if self.written <= 3 || self.written % 300 == 0 {
                    debug!(
                        "Wrote sample #{} ({} bytes, {:?}, keyframe={})",
                        self.written,
                        sample.data.len(),
                        duration,
                        frame.is_keyframe
                    );
                }
            }
            Err(e) => {
                self.failed += 1;
                if self.failed <= 5 || self.failed % 100 == 0 {
                    warn!("Failed to write sample (failure #{}): {}", self.failed, e);
                }
            }
        }
    }
}
