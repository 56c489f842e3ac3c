//! Bundle polling
//!
//! A [`Downloader`] owns the fetch loop for one bundle:
//! 1. Wait a jittered interval (periodic) or issue a blocking request (long-poll).
//!    A long-poll answered "not modified" well before its wait elapsed means
//!    the server is not holding requests; the next one waits a periodic
//!    interval instead.
//! 2. Fetch through the [`Transport`]
//! 3. Classify the outcome into exactly one [`Update`]
//! 4. Back off exponentially after failures, capped at the max delay
//!
//! Eager bundles are decoded and assembled here, before the update is handed
//! on. Lazy bundles travel as raw bytes and are decoded during activation.

pub mod backoff;
pub mod transport;

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::bundle::assembler::load_eager;
use crate::bundle::{Bundle, BundleContent};
use crate::config::Trigger;
use crate::error::{BundleError, DecodeError};
use crate::metrics::{Metrics, COUNTER_BYTES, TIMER_DECODE, TIMER_DOWNLOAD};
use crate::storage::StoragePath;

pub use transport::{FetchRequest, FetchResponse, HttpTransport, Transport};

/// Outcome of one fetch
#[derive(Debug)]
pub enum Update {
    NotModified,
    NewBundle { bundle: Bundle, metrics: Metrics },
    Error(BundleError),
}

impl Update {
    pub fn is_error(&self) -> bool {
        matches!(self, Update::Error(_))
    }
}

/// Everything a downloader needs to know about its bundle
#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub name: String,
    pub resource: String,
    pub mount: StoragePath,
    pub trigger: Trigger,
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub long_poll_timeout: Option<Duration>,
    pub request_timeout: Duration,
    pub lazy: bool,
    pub size_limit: u64,
}

/// Last ETag seen, shared so a failed activation can force a full refetch
#[derive(Debug, Clone, Default)]
pub struct EtagCache(Arc<Mutex<Option<String>>>);

impl EtagCache {
    pub fn get(&self) -> Option<String> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn set(&self, etag: Option<String>) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = etag;
    }

    pub fn clear(&self) {
        self.set(None);
    }
}

pub struct Downloader {
    config: PollerConfig,
    transport: Arc<dyn Transport>,
    etag: EtagCache,
    retries: u32,
    /// Duration of the last transport call
    round_trip: Duration,
}

impl Downloader {
    pub fn new(config: PollerConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            config,
            transport,
            etag: EtagCache::default(),
            retries: 0,
            round_trip: Duration::ZERO,
        }
    }

    pub fn etag_cache(&self) -> EtagCache {
        self.etag.clone()
    }

    /// Consecutive failed attempts
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Perform a single fetch and classify it
    pub async fn once(&mut self) -> Update {
        let long_poll = match self.config.trigger {
            Trigger::LongPoll => self.config.long_poll_timeout,
            Trigger::Periodic => None,
        };
        let request = FetchRequest {
            resource: self.config.resource.clone(),
            etag: self.etag.get(),
            long_poll_timeout: long_poll,
            timeout: self.config.request_timeout,
        };

        let started = Instant::now();
        let fetched = self.transport.fetch(request).await;
        self.round_trip = started.elapsed();
        let (body, etag) = match fetched {
            Ok(FetchResponse::NotModified) => {
                debug!(bundle = %self.config.name, "Bundle not modified");
                return Update::NotModified;
            }
            Ok(FetchResponse::Ok { body, etag }) => (body, etag),
            Err(e) => return Update::Error(e.into()),
        };

        let mut metrics = Metrics::new();
        metrics.record(TIMER_DOWNLOAD, self.round_trip);
        metrics.add(COUNTER_BYTES, body.len() as u64);
        let size = body.len() as u64;

        let content = if self.config.lazy {
            BundleContent::Lazy {
                archive: body,
                size_limit: self.config.size_limit,
            }
        } else {
            let name = self.config.name.clone();
            let mount = self.config.mount.clone();
            let size_limit = self.config.size_limit;
            let decoded = tokio::task::spawn_blocking(move || {
                let started = Instant::now();
                let result = load_eager(&name, mount, &body, size_limit);
                (result, started.elapsed())
            })
            .await;
            match decoded {
                Ok((Ok(assembled), elapsed)) => {
                    metrics.record(TIMER_DECODE, elapsed);
                    BundleContent::Eager(assembled)
                }
                Ok((Err(e), _)) => return Update::Error(e),
                Err(e) => {
                    return Update::Error(DecodeError::new(format!("decode task failed: {}", e)).into())
                }
            }
        };

        self.etag.set(etag);
        info!(bundle = %self.config.name, size, lazy = self.config.lazy, "Downloaded bundle");

        Update::NewBundle {
            bundle: Bundle {
                name: self.config.name.clone(),
                mount: self.config.mount.clone(),
                size,
                content,
            },
            metrics,
        }
    }

    /// Delay before the next attempt, given the last outcome
    fn next_delay(&mut self, update: &Update) -> Duration {
        if update.is_error() {
            self.retries = self.retries.saturating_add(1);
            return backoff::backoff(self.retries, self.config.max_delay);
        }
        self.retries = 0;
        match self.config.trigger {
            Trigger::Periodic => {
                backoff::jittered_interval(self.config.min_delay, self.config.max_delay)
            }
            Trigger::LongPoll => {
                let wait = self.config.long_poll_timeout.unwrap_or_default();
                let held = self.round_trip >= wait / 2;
                if held || !matches!(update, Update::NotModified) {
                    return Duration::ZERO;
                }
                debug!(
                    bundle = %self.config.name,
                    round_trip_ms = self.round_trip.as_millis() as u64,
                    "Long-poll answered early, throttling"
                );
                backoff::jittered_interval(self.config.min_delay, self.config.max_delay)
            }
        }
    }

    /// Poll until shutdown, handing every update to `sink`
    pub async fn run<F>(mut self, mut sink: F, mut shutdown: broadcast::Receiver<()>)
    where
        F: FnMut(Update) + Send,
    {
        info!(
            bundle = %self.config.name,
            trigger = ?self.config.trigger,
            "Downloader started"
        );

        loop {
            let update = tokio::select! {
                update = self.once() => update,
                _ = shutdown.recv() => break,
            };

            let delay = self.next_delay(&update);
            sink(update);

            if delay.is_zero() {
                tokio::task::yield_now().await;
                continue;
            }
            debug!(bundle = %self.config.name, delay_ms = delay.as_millis() as u64, "Next poll scheduled");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.recv() => break,
            }
        }

        info!(bundle = %self.config.name, "Downloader stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::archive::write_tarball;
    use crate::error::NetworkError;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::collections::VecDeque;

    /// Replays canned responses and records the ETags it was sent
    struct Scripted {
        responses: Mutex<VecDeque<Result<FetchResponse, NetworkError>>>,
        seen_etags: Mutex<Vec<Option<String>>>,
    }

    impl Scripted {
        fn new(responses: Vec<Result<FetchResponse, NetworkError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                seen_etags: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Transport for Scripted {
        async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, NetworkError> {
            self.seen_etags.lock().unwrap().push(request.etag);
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(FetchResponse::NotModified))
        }
    }

    /// Answers 304 after holding the request for `hold`
    struct Holding {
        hold: Duration,
        requests: Mutex<usize>,
    }

    #[async_trait]
    impl Transport for Holding {
        async fn fetch(&self, _request: FetchRequest) -> Result<FetchResponse, NetworkError> {
            *self.requests.lock().unwrap() += 1;
            tokio::time::sleep(self.hold).await;
            Ok(FetchResponse::NotModified)
        }
    }

    fn long_poll(wait: Duration) -> PollerConfig {
        PollerConfig {
            trigger: Trigger::LongPoll,
            long_poll_timeout: Some(wait),
            min_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(40),
            ..config(false)
        }
    }

    fn config(lazy: bool) -> PollerConfig {
        PollerConfig {
            name: "b0".into(),
            resource: "bundles/b0".into(),
            mount: StoragePath::root(),
            trigger: Trigger::Periodic,
            min_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            long_poll_timeout: None,
            request_timeout: Duration::from_secs(1),
            lazy,
            size_limit: crate::bundle::archive::DEFAULT_SIZE_LIMIT_BYTES,
        }
    }

    fn tarball() -> Bytes {
        Bytes::from(
            write_tarball(vec![
                ("/.manifest", r#"{"revision": "r1"}"#),
                ("/a/data.json", r#"{"x": 1}"#),
            ])
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_eager_download_assembles_bundle() {
        let transport = Scripted::new(vec![Ok(FetchResponse::Ok {
            body: tarball(),
            etag: Some("\"e1\"".into()),
        })]);
        let mut downloader = Downloader::new(config(false), transport.clone());

        match downloader.once().await {
            Update::NewBundle { bundle, metrics } => {
                assert_eq!(bundle.manifest().unwrap().revision, "r1");
                assert!(metrics.timer(TIMER_DOWNLOAD).is_some());
            }
            other => panic!("unexpected update: {:?}", other),
        }

        // ETag is sent on the next request
        assert!(matches!(downloader.once().await, Update::NotModified));
        let seen = transport.seen_etags.lock().unwrap().clone();
        assert_eq!(seen, vec![None, Some("\"e1\"".to_string())]);
    }

    #[tokio::test]
    async fn test_lazy_download_keeps_raw_archive() {
        let transport = Scripted::new(vec![Ok(FetchResponse::Ok {
            body: tarball(),
            etag: None,
        })]);
        let mut downloader = Downloader::new(config(true), transport);
        match downloader.once().await {
            Update::NewBundle { bundle, .. } => {
                assert!(bundle.is_lazy());
                assert!(bundle.manifest().is_none());
            }
            other => panic!("unexpected update: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_corrupt_eager_bundle_is_decode_error() {
        let transport = Scripted::new(vec![Ok(FetchResponse::Ok {
            body: Bytes::from_static(b"not an archive"),
            etag: Some("\"bad\"".into()),
        })]);
        let mut downloader = Downloader::new(config(false), transport);
        match downloader.once().await {
            Update::Error(e) => assert_eq!(e.kind(), "decode_error"),
            other => panic!("unexpected update: {:?}", other),
        }
        // Failed bundles are not cached
        assert_eq!(downloader.etag_cache().get(), None);
    }

    #[tokio::test]
    async fn test_errors_back_off_and_success_resets() {
        let transport = Scripted::new(vec![
            Err(NetworkError::with_status(500, "boom")),
            Err(NetworkError::new("refused")),
        ]);
        let mut downloader = Downloader::new(config(false), transport);

        let first = downloader.once().await;
        downloader.next_delay(&first);
        let second = downloader.once().await;
        downloader.next_delay(&second);
        assert_eq!(downloader.retries(), 2);

        let third = downloader.once().await;
        assert!(matches!(third, Update::NotModified));
        let delay = downloader.next_delay(&third);
        assert_eq!(downloader.retries(), 0);
        assert!(delay <= Duration::from_millis(2));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let transport = Scripted::new(vec![]);
        let downloader = Downloader::new(config(false), transport);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let updates = Arc::new(Mutex::new(0usize));
        let counter = updates.clone();

        let handle = tokio::spawn(downloader.run(
            move |_update| *counter.lock().unwrap() += 1,
            shutdown_rx,
        ));
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(*updates.lock().unwrap() > 0);
    }

    #[tokio::test]
    async fn test_early_long_poll_answer_is_throttled() {
        let transport = Scripted::new(vec![]);
        let mut downloader = Downloader::new(long_poll(Duration::from_secs(10)), transport);

        let update = downloader.once().await;
        assert!(matches!(update, Update::NotModified));
        let delay = downloader.next_delay(&update);
        assert!(delay >= Duration::from_millis(20), "delay was {:?}", delay);
    }

    #[tokio::test]
    async fn test_held_long_poll_repolls_immediately() {
        let transport = Arc::new(Holding {
            hold: Duration::from_millis(60),
            requests: Mutex::new(0),
        });
        let mut downloader = Downloader::new(long_poll(Duration::from_millis(100)), transport);

        let update = downloader.once().await;
        assert_eq!(downloader.next_delay(&update), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_long_poll_against_non_holding_server_yields() {
        let transport = Arc::new(Holding {
            hold: Duration::ZERO,
            requests: Mutex::new(0),
        });
        let downloader = Downloader::new(long_poll(Duration::from_secs(10)), transport.clone());
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let handle = tokio::spawn(downloader.run(|_update| {}, shutdown_rx));
        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();

        // One request per throttled interval, not a spin
        let requests = *transport.requests.lock().unwrap();
        assert!(requests >= 2 && requests <= 15, "{} requests", requests);
    }
}
