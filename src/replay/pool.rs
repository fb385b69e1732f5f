//! Dynamic replay worker pool
//!
//! The replay output owns a queue of captured requests and a pool of
//! workers, each holding exactly one [`HttpClient`] (one socket). The pool
//! starts at 10 workers; when the queue grows deeper than the active
//! worker count it asks the master for more, up to `workers_max`, and
//! workers die back to `workers_min` after 2 seconds of idleness. A
//! single demand channel funnels every scaling decision through the
//! master task, which alone spawns.

use super::client::{HttpClient, HttpClientConfig};
use crate::config::defaults::{INITIAL_DYNAMIC_WORKERS, WORKER_IDLE_DEATH};
use crate::error::{ReflowError, Result};
use crate::payload::{self, PayloadKind, PayloadMeta};
use crate::proto;
use crate::sink::PayloadWrite;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info};

const IDLE_TICK: Duration = Duration::from_millis(100);

/// Replay output settings
#[derive(Debug, Clone)]
pub struct ReplayConfig {
    /// Replay target, `host[:port]` or a full `http(s)://` URL
    pub address: String,
    pub timeout: Duration,
    pub workers_min: usize,
    /// 0 = unlimited dynamic scaling
    pub workers_max: usize,
    pub queue_len: usize,
    pub redirect_limit: usize,
    /// Feed replayed responses back into the pipeline
    pub track_responses: bool,
    pub original_host: bool,
    pub response_buffer_size: usize,
    pub compatibility_mode: bool,
    pub debug: bool,
}

impl ReplayConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            timeout: Duration::from_secs(5),
            workers_min: 1,
            workers_max: 0,
            queue_len: 1000,
            redirect_limit: 0,
            track_responses: false,
            original_host: false,
            response_buffer_size: 0,
            compatibility_mode: false,
            debug: false,
        }
    }

    fn client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            follow_redirects: self.redirect_limit,
            debug: self.debug,
            original_host: self.original_host,
            connection_timeout: self.timeout,
            timeout: self.timeout,
            response_buffer_size: self.response_buffer_size,
            compatibility_mode: self.compatibility_mode,
        }
    }
}

/// Payload sink replaying captured requests against a live origin
pub struct ReplaySink {
    config: Arc<ReplayConfig>,
    queue_tx: mpsc::Sender<Bytes>,
    demand_tx: mpsc::Sender<usize>,
    active_workers: Arc<AtomicI64>,
    responses_rx: parking_lot::Mutex<Option<mpsc::Receiver<Bytes>>>,
}

impl ReplaySink {
    /// Validate the target/proxy configuration and start the pool
    pub fn new(config: ReplayConfig) -> Result<Self> {
        // surfaces bad URLs and unsupported proxy schemes before any
        // traffic flows
        HttpClient::new(&config.address, config.client_config())?;

        let config = Arc::new(config);
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_len);
        let (responses_tx, responses_rx) = mpsc::channel(config.queue_len);
        let (demand_tx, demand_rx) = mpsc::channel(64);
        let active_workers = Arc::new(AtomicI64::new(0));

        // demand grows the pool from here; the configured bounds only clamp
        let mut initial = INITIAL_DYNAMIC_WORKERS.max(config.workers_min);
        if config.workers_max > 0 {
            initial = initial.min(config.workers_max);
        }

        tokio::spawn(master(
            Arc::clone(&config),
            demand_rx,
            Arc::new(Mutex::new(queue_rx)),
            responses_tx,
            Arc::clone(&active_workers),
        ));

        let sink = Self {
            config,
            queue_tx,
            demand_tx,
            active_workers,
            responses_rx: parking_lot::Mutex::new(Some(responses_rx)),
        };
        let _ = sink.demand_tx.try_send(initial);
        Ok(sink)
    }

    /// Take the stream of replayed responses (kind 3) so the engine can
    /// feed it back through the emitter. Present only when response
    /// tracking is on.
    pub fn take_responses(&self) -> Option<mpsc::Receiver<Bytes>> {
        if !self.config.track_responses {
            return None;
        }
        self.responses_rx.lock().take()
    }

    /// Currently alive workers (for tests and stats logging)
    pub fn active_workers(&self) -> i64 {
        self.active_workers.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PayloadWrite for ReplaySink {
    async fn write(&self, data: Bytes) -> Result<()> {
        if !payload::is_request(&data) {
            return Ok(());
        }

        self.queue_tx
            .send(data)
            .await
            .map_err(|_| ReflowError::replay("enqueue", "worker pool stopped"))?;

        // scale up while the queue outgrows the pool
        if self.config.workers_max != self.config.workers_min {
            let depth = self.queue_tx.max_capacity() - self.queue_tx.capacity();
            let active = self.active_workers.load(Ordering::SeqCst).max(0) as usize;
            if depth > active {
                let mut extra = depth - active + 1;
                if self.config.workers_max > 0 {
                    extra = extra.min(self.config.workers_max.saturating_sub(active));
                }
                if extra > 0 {
                    let _ = self.demand_tx.try_send(extra);
                }
            }
        }
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "http"
    }
}

/// The master owns spawning: it keeps `active >= workers_min` implicitly
/// (workers refuse to die below it) and never exceeds `workers_max`
async fn master(
    config: Arc<ReplayConfig>,
    mut demand_rx: mpsc::Receiver<usize>,
    queue: Arc<Mutex<mpsc::Receiver<Bytes>>>,
    responses_tx: mpsc::Sender<Bytes>,
    active: Arc<AtomicI64>,
) {
    while let Some(count) = demand_rx.recv().await {
        for _ in 0..count {
            if config.workers_max > 0
                && active.load(Ordering::SeqCst) >= config.workers_max as i64
            {
                break;
            }
            tokio::spawn(worker(
                Arc::clone(&config),
                Arc::clone(&queue),
                responses_tx.clone(),
                Arc::clone(&active),
            ));
        }
    }
}

async fn worker(
    config: Arc<ReplayConfig>,
    queue: Arc<Mutex<mpsc::Receiver<Bytes>>>,
    responses_tx: mpsc::Sender<Bytes>,
    active: Arc<AtomicI64>,
) {
    let mut client = match HttpClient::new(&config.address, config.client_config()) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "replay worker could not build its client");
            return;
        }
    };

    active.fetch_add(1, Ordering::SeqCst);
    let idle_ticks_to_die = (WORKER_IDLE_DEATH.as_millis() / IDLE_TICK.as_millis()) as u32;
    let mut idle_ticks = 0u32;

    loop {
        let received = tokio::time::timeout(IDLE_TICK, async {
            queue.lock().await.recv().await
        })
        .await;

        match received {
            Ok(Some(data)) => {
                idle_ticks = 0;
                replay_request(&mut client, &data, &config, &responses_tx).await;
            }
            Ok(None) => break,
            Err(_) => {
                // fixed-size pools never shrink
                if config.workers_min == config.workers_max {
                    continue;
                }
                idle_ticks += 1;
                if idle_ticks > idle_ticks_to_die {
                    let count = active.load(Ordering::SeqCst);
                    if count != 1 && count > config.workers_min as i64 {
                        break;
                    }
                    idle_ticks = 0;
                }
            }
        }
    }

    active.fetch_sub(1, Ordering::SeqCst);
    debug!("replay worker stopped");
}

async fn replay_request(
    client: &mut HttpClient,
    data: &[u8],
    config: &ReplayConfig,
    responses_tx: &mpsc::Sender<Bytes>,
) {
    let meta = match PayloadMeta::parse(data) {
        Some(m) => m,
        None => return,
    };
    let uuid = meta.uuid.to_vec();
    let body = meta.body;
    if !proto::is_http_payload(body) {
        return;
    }

    let started = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let response = client.send(body).await;
    let stopped = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();

    if config.track_responses {
        let payload = payload::encode(
            PayloadKind::ReplayedResponse,
            &uuid,
            started,
            stopped - started,
            &response,
        );
        if responses_tx.send(payload).await.is_err() {
            info!("dropping replayed response, pipeline is gone");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::time::sleep;

    async fn echo_origin() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 8192];
                    loop {
                        let mut got = Vec::new();
                        loop {
                            match socket.read(&mut buf).await {
                                Ok(0) | Err(_) => return,
                                Ok(n) => got.extend_from_slice(&buf[..n]),
                            }
                            if proto::empty_line_offset(&got).is_some() {
                                break;
                            }
                        }
                        let reply = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok";
                        if socket.write_all(reply).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });
        addr
    }

    fn request_payload(uuid: &[u8]) -> Bytes {
        payload::encode(
            PayloadKind::Request,
            uuid,
            1000,
            -1,
            b"GET /replayed HTTP/1.1\r\nHost: original\r\n\r\n",
        )
    }

    #[tokio::test]
    async fn test_pool_spawns_initial_workers() {
        let addr = echo_origin().await;
        let mut config = ReplayConfig::new(addr.to_string());
        config.timeout = Duration::from_millis(500);
        let sink = ReplaySink::new(config).unwrap();

        sleep(Duration::from_millis(200)).await;
        assert_eq!(sink.active_workers(), INITIAL_DYNAMIC_WORKERS as i64);
    }

    #[tokio::test]
    async fn test_high_workers_max_does_not_inflate_initial_size() {
        let addr = echo_origin().await;
        let mut config = ReplayConfig::new(addr.to_string());
        config.workers_max = 30;
        config.timeout = Duration::from_millis(500);
        let sink = ReplaySink::new(config).unwrap();

        // scaling toward workers_max is demand-driven, not eager
        sleep(Duration::from_millis(200)).await;
        assert_eq!(sink.active_workers(), INITIAL_DYNAMIC_WORKERS as i64);
    }

    #[tokio::test]
    async fn test_small_workers_max_clamps_initial_size() {
        let addr = echo_origin().await;
        let mut config = ReplayConfig::new(addr.to_string());
        config.workers_max = 3;
        config.timeout = Duration::from_millis(500);
        let sink = ReplaySink::new(config).unwrap();

        sleep(Duration::from_millis(200)).await;
        assert_eq!(sink.active_workers(), 3);
    }

    #[tokio::test]
    async fn test_replayed_response_reenters_pipeline() {
        let addr = echo_origin().await;
        let mut config = ReplayConfig::new(addr.to_string());
        config.track_responses = true;
        config.timeout = Duration::from_millis(500);
        let sink = ReplaySink::new(config).unwrap();
        let mut responses = sink.take_responses().expect("tracking is on");

        let uuid = payload::uuid();
        sink.write(request_payload(&uuid)).await.unwrap();

        let replayed = tokio::time::timeout(Duration::from_secs(2), responses.recv())
            .await
            .expect("response within deadline")
            .expect("channel open");

        let meta = PayloadMeta::parse(&replayed).unwrap();
        assert_eq!(meta.kind, PayloadKind::ReplayedResponse);
        assert_eq!(meta.uuid, &uuid[..]);
        assert!(meta.extra >= 0);
        assert!(meta.body.starts_with(b"HTTP/1.1 200 OK"));
    }

    #[tokio::test]
    async fn test_non_requests_are_ignored() {
        let addr = echo_origin().await;
        let mut config = ReplayConfig::new(addr.to_string());
        config.track_responses = true;
        config.timeout = Duration::from_millis(200);
        let sink = ReplaySink::new(config).unwrap();
        let mut responses = sink.take_responses().expect("tracking is on");

        let uuid = payload::uuid();
        let response = payload::encode(
            PayloadKind::Response,
            &uuid,
            1000,
            5,
            b"HTTP/1.1 200 OK\r\n\r\n",
        );
        sink.write(response).await.unwrap();

        let got = tokio::time::timeout(Duration::from_millis(400), responses.recv()).await;
        assert!(got.is_err(), "captured responses must not be replayed");
    }

    #[tokio::test]
    async fn test_invalid_target_is_fatal() {
        assert!(ReplaySink::new(ReplayConfig::new("http://")).is_err());
    }
}
