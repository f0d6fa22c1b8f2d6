//! Relay bridge: one bidirectional gRPC stream per peer session
//!
//! ```text
//! submit() ──try_send──▶ outbound queue ──▶ [submit task] ──▶ request stream
//! take_results() ◀── inbound queue ◀── [receive task] ◀── response stream
//! ```
//!
//! The two tasks share only the stream. Any stream failure fires the session
//! shutdown signal.

use super::proto::{Image, ImageResponse, ImageServiceClient, StreamImageRequest};
use super::RelayError;
use crate::config::RelayConfig;
use crate::shutdown::Shutdown;
use futures::{Stream, StreamExt, TryStreamExt};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;

/// Largest image message accepted in either direction
const MAX_MESSAGE_SIZE: usize = 32 * 1024 * 1024;

/// Frame sent to the processing service
#[derive(Debug, Clone)]
pub struct RelayEnvelope {
    pub image: Vec<u8>,
    pub is_keyframe: bool,
}

/// Frame returned by the processing service
#[derive(Debug, Clone)]
pub struct RelayResult {
    pub image: Vec<u8>,
}

/// Relay counters
#[derive(Debug, Default)]
pub struct RelayStats {
    pub submitted: AtomicU64,
    pub dropped: AtomicU64,
    pub sent: AtomicU64,
    pub received: AtomicU64,
}

pub struct RelayBridge {
    outbound: Mutex<Option<mpsc::Sender<RelayEnvelope>>>,
    results: Mutex<Option<mpsc::Receiver<RelayResult>>>,
    submit_task: Mutex<Option<JoinHandle<()>>>,
    receive_task: Mutex<Option<JoinHandle<()>>>,
    closing: Arc<AtomicBool>,
    close_timeout: Duration,
    stats: Arc<RelayStats>,
}

impl RelayBridge {
    /// Dial the processing service and open the `StreamImage` call
    pub async fn connect(config: &RelayConfig, shutdown: Shutdown) -> Result<Self, RelayError> {
        let channel = tonic::transport::Endpoint::from_shared(config.endpoint.clone())
            .map_err(|e| RelayError::Connect(format!("Invalid relay endpoint '{}': {}", config.endpoint, e)))?
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .connect()
            .await
            .map_err(|e| RelayError::Connect(format!("Failed to connect to '{}': {}", config.endpoint, e)))?;

        info!("Connected to frame-processing service at {}", config.endpoint);

        let mut client = ImageServiceClient::new(channel)
            .max_decoding_message_size(MAX_MESSAGE_SIZE)
            .max_encoding_message_size(MAX_MESSAGE_SIZE);

        let (request_tx, request_rx) = mpsc::channel(config.queue_capacity.max(1));

        // The call resolves only once the service sends headers, which may wait
        // for our first request, so it is opened inside the receive task.
        let responses = futures::stream::once(async move {
            client
                .stream_image(ReceiverStream::new(request_rx))
                .await
                .map(|response| response.into_inner())
        })
        .try_flatten();

        Ok(Self::from_stream(
            request_tx,
            responses,
            config.queue_capacity,
            Duration::from_millis(config.close_timeout_ms),
            shutdown,
        ))
    }

    /// Wire the bridge over any request sink / response stream pair
    pub fn from_stream<S>(
        requests: mpsc::Sender<StreamImageRequest>,
        responses: S,
        queue_capacity: usize,
        close_timeout: Duration,
        shutdown: Shutdown,
    ) -> Self
    where
        S: Stream<Item = Result<ImageResponse, tonic::Status>> + Send + 'static,
    {
        let (outbound_tx, outbound_rx) = mpsc::channel(queue_capacity.max(1));
        let (results_tx, results_rx) = mpsc::channel(queue_capacity.max(1));
        let closing = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(RelayStats::default());

        let submit_task = tokio::spawn(run_submit(outbound_rx, requests, shutdown.clone(), stats.clone()));
        let receive_task = tokio::spawn(run_receive(
            Box::pin(responses),
            results_tx,
            shutdown,
            closing.clone(),
            stats.clone(),
        ));

        Self {
            outbound: Mutex::new(Some(outbound_tx)),
            results: Mutex::new(Some(results_rx)),
            submit_task: Mutex::new(Some(submit_task)),
            receive_task: Mutex::new(Some(receive_task)),
            closing,
            close_timeout,
            stats,
        }
    }

    /// Queue a frame for the processing service without waiting.
    ///
    /// Returns `QueueFull` when the outbound queue is at capacity; the caller
    /// drops the frame.
    pub fn submit(&self, envelope: RelayEnvelope) -> Result<(), RelayError> {
        let guard = self.outbound.lock();
        let Some(tx) = guard.as_ref() else {
            return Err(RelayError::Closed);
        };

        match tx.try_send(envelope) {
            Ok(()) => {
                self.stats.submitted.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                let dropped = self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                if dropped < 5 || dropped % 100 == 0 {
                    warn!("Relay queue full, dropped {} frames so far", dropped + 1);
                }
                Err(RelayError::QueueFull)
            }
            Err(TrySendError::Closed(_)) => Err(RelayError::Closed),
        }
    }

    /// Take the queue of processed frames. Only the first call returns it.
    pub fn take_results(&self) -> Option<mpsc::Receiver<RelayResult>> {
        self.results.lock().take()
    }

    pub fn stats(&self) -> &RelayStats {
        &self.stats
    }

    /// Close the request half, wait for the service to end the response half,
    /// then stop whatever is left. Idempotent.
    pub async fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }

        // Submit task drains what is queued, then drops the request sender
        drop(self.outbound.lock().take());

        let submit = self.submit_task.lock().take();
        let receive = self.receive_task.lock().take();

        for (name, handle) in [("submit", submit), ("receive", receive)] {
            if let Some(mut handle) = handle {
                if tokio::time::timeout(self.close_timeout, &mut handle).await.is_err() {
                    debug!("Relay {} task did not finish within {:?}, aborting", name, self.close_timeout);
                    handle.abort();
                }
            }
        }

        drop(self.results.lock().take());

        info!(
            "Relay bridge closed (submitted={}, dropped={}, sent={}, received={})",
            self.stats.submitted.load(Ordering::Relaxed),
            self.stats.dropped.load(Ordering::Relaxed),
            self.stats.sent.load(Ordering::Relaxed),
            self.stats.received.load(Ordering::Relaxed),
        );
    }
}

impl Drop for RelayBridge {
    fn drop(&mut self) {
        for handle in [self.submit_task.lock().take(), self.receive_task.lock().take()].into_iter().flatten() {
            handle.abort();
        }
    }
}

async fn run_submit(
    mut outbound: mpsc::Receiver<RelayEnvelope>,
    requests: mpsc::Sender<StreamImageRequest>,
    shutdown: Shutdown,
    stats: Arc<RelayStats>,
) {
    loop {
        let envelope = tokio::select! {
            _ = shutdown.triggered() => break,
            next = outbound.recv() => match next {
                Some(envelope) => envelope,
                None => break,
            },
        };

        let request = StreamImageRequest {
            image: Some(Image {
                image_data: envelope.image,
            }),
            is_key_frame: envelope.is_keyframe,
        };

        let sent = tokio::select! {
            _ = shutdown.triggered() => break,
            sent = requests.send(request) => sent,
        };
        if sent.is_err() {
            error!("Relay request stream closed by transport");
            shutdown.trigger();
            break;
        }
        stats.sent.fetch_add(1, Ordering::Relaxed);
    }
    debug!("Relay submit task finished, closing request stream");
}

async fn run_receive(
    mut responses: std::pin::Pin<Box<dyn Stream<Item = Result<ImageResponse, tonic::Status>> + Send>>,
    results: mpsc::Sender<RelayResult>,
    shutdown: Shutdown,
    closing: Arc<AtomicBool>,
    stats: Arc<RelayStats>,
) {
    while let Some(item) = responses.next().await {
        match item {
            Ok(response) => {
                let Some(image) = response.image else {
                    debug!("Relay response without image, skipping");
                    continue;
                };
                let received = stats.received.fetch_add(1, Ordering::Relaxed) + 1;
                if received == 1 || received % 300 == 0 {
                    debug!("Relay received {} frames", received);
                }
                if results
                    .send(RelayResult {
                        image: image.image_data,
                    })
                    .await
                    .is_err()
                {
                    debug!("Relay results consumer gone");
                    return;
                }
            }
            Err(status) => {
                if !closing.load(Ordering::SeqCst) {
                    error!("Relay stream failed: {}", status);
                    shutdown.trigger();
                }
                return;
            }
        }
    }

    if !closing.load(Ordering::SeqCst) {
        warn!("Frame-processing service ended the stream");
        shutdown.trigger();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{sleep, timeout, Instant};

    fn envelope(tag: u8) -> RelayEnvelope {
        RelayEnvelope {
            image: vec![tag],
            is_keyframe: tag == 0,
        }
    }

    /// Echo service that takes `delay` per frame
    fn slow_echo(
        delay: Duration,
    ) -> (
        mpsc::Sender<StreamImageRequest>,
        ReceiverStream<Result<ImageResponse, tonic::Status>>,
    ) {
        let (req_tx, mut req_rx) = mpsc::channel::<StreamImageRequest>(4);
        let (resp_tx, resp_rx) = mpsc::channel(4);
        tokio::spawn(async move {
            while let Some(request) = req_rx.recv().await {
                sleep(delay).await;
                if resp_tx.send(Ok(ImageResponse { image: request.image })).await.is_err() {
                    break;
                }
            }
        });
        (req_tx, ReceiverStream::new(resp_rx))
    }

    #[tokio::test(start_paused = true)]
    async fn submit_is_not_blocked_by_slow_service() {
        let (requests, responses) = slow_echo(Duration::from_secs(2));
        let shutdown = Shutdown::new();
        let bridge = RelayBridge::from_stream(requests, responses, 4, Duration::from_secs(1), shutdown.clone());
        let mut results = bridge.take_results().unwrap();

        let start = Instant::now();
        for tag in 0..3 {
            bridge.submit(envelope(tag)).unwrap();
        }
        assert_eq!(start.elapsed(), Duration::ZERO);

        let first = results.recv().await.unwrap();
        assert_eq!(first.image, vec![0]);
        assert!(start.elapsed() >= Duration::from_secs(2));

        // Submissions keep going while the service is busy
        let before = Instant::now();
        bridge.submit(envelope(3)).unwrap();
        assert_eq!(before.elapsed(), Duration::ZERO);

        for expected in 1..4u8 {
            assert_eq!(results.recv().await.unwrap().image, vec![expected]);
        }
        assert!(!shutdown.is_triggered());
        bridge.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn ten_frames_against_slow_service_fill_the_bound() {
        let (requests, responses) = slow_echo(Duration::from_secs(2));
        let shutdown = Shutdown::new();
        let bridge = RelayBridge::from_stream(requests, responses, 4, Duration::from_secs(1), shutdown.clone());
        let mut results = bridge.take_results().unwrap();

        let start = Instant::now();
        let accepted: Vec<u8> = (0..10u8).filter(|&tag| bridge.submit(envelope(tag)).is_ok()).collect();
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(accepted, vec![0, 1, 2, 3]);
        assert_eq!(bridge.stats().dropped.load(Ordering::Relaxed), 6);

        for expected in accepted {
            let result = timeout(Duration::from_secs(10), results.recv())
                .await
                .expect("service answers")
                .unwrap();
            assert_eq!(result.image, vec![expected]);
        }
        assert!(start.elapsed() >= Duration::from_secs(8));

        // room again once the service caught up
        bridge.submit(envelope(10)).unwrap();
        assert_eq!(results.recv().await.unwrap().image, vec![10]);
        assert!(!shutdown.is_triggered());
        bridge.close().await;
    }

    #[tokio::test]
    async fn full_queue_rejects_without_blocking() {
        // Service never reads its requests
        let (requests, _held) = mpsc::channel::<StreamImageRequest>(1);
        let (_resp_tx, resp_rx) = mpsc::channel::<Result<ImageResponse, tonic::Status>>(1);
        let bridge = RelayBridge::from_stream(
            requests,
            ReceiverStream::new(resp_rx),
            2,
            Duration::from_millis(50),
            Shutdown::new(),
        );

        assert!(bridge.submit(envelope(0)).is_ok());
        assert!(bridge.submit(envelope(1)).is_ok());
        assert!(matches!(bridge.submit(envelope(2)), Err(RelayError::QueueFull)));
        assert_eq!(bridge.stats().dropped.load(Ordering::Relaxed), 1);
        bridge.close().await;
    }

    #[tokio::test]
    async fn close_half_closes_and_is_idempotent() {
        let (req_tx, mut req_rx) = mpsc::channel::<StreamImageRequest>(4);
        let (resp_tx, resp_rx) = mpsc::channel::<Result<ImageResponse, tonic::Status>>(4);
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let mut seen = 0;
            while req_rx.recv().await.is_some() {
                seen += 1;
            }
            // Request half closed: end the response half
            drop(resp_tx);
            let _ = done_tx.send(seen);
        });

        let shutdown = Shutdown::new();
        let bridge = RelayBridge::from_stream(
            req_tx,
            ReceiverStream::new(resp_rx),
            4,
            Duration::from_secs(1),
            shutdown.clone(),
        );
        bridge.submit(envelope(0)).unwrap();
        bridge.submit(envelope(1)).unwrap();

        bridge.close().await;
        bridge.close().await;

        assert_eq!(done_rx.await.unwrap(), 2);
        assert!(matches!(bridge.submit(envelope(2)), Err(RelayError::Closed)));
        assert!(bridge.take_results().is_none());
        // Orderly close is not a failure
        assert!(!shutdown.is_triggered());
    }

    #[tokio::test]
    async fn stream_error_fires_shutdown() {
        let (requests, _held) = mpsc::channel::<StreamImageRequest>(1);
        let responses = futures::stream::iter(vec![Err::<ImageResponse, _>(tonic::Status::internal("boom"))]);
        let shutdown = Shutdown::new();
        let bridge = RelayBridge::from_stream(requests, responses, 2, Duration::from_millis(50), shutdown.clone());

        timeout(Duration::from_secs(1), shutdown.triggered())
            .await
            .expect("shutdown fired");
        bridge.close().await;
    }

    #[tokio::test]
    async fn unexpected_end_of_stream_fires_shutdown() {
        let (requests, _held) = mpsc::channel::<StreamImageRequest>(1);
        let shutdown = Shutdown::new();
        let _bridge = RelayBridge::from_stream(
            requests,
            futures::stream::empty::<Result<ImageResponse, tonic::Status>>(),
            2,
            Duration::from_millis(50),
            shutdown.clone(),
        );

        timeout(Duration::from_secs(1), shutdown.triggered())
            .await
            .expect("shutdown fired");
    }
}
