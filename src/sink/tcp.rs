//! TCP peer sink
//!
//! Frames each payload with the payload separator and delivers it over
//! long-lived connections held by a pool of 10 workers. In sticky mode
//! every payload is routed to a fixed worker by the FNV-1a hash of its
//! UUID, so a request and its responses travel the same connection in
//! order. Connections are re-dialed forever with a 1 s pause; a payload
//! caught in a write failure is retried first on the fresh connection.

use super::PayloadWrite;
use crate::config::defaults::{
    TCP_RECONNECT_DELAY, TCP_SHARED_QUEUE_LEN, TCP_SINK_WORKERS, TCP_STICKY_QUEUE_LEN,
};
use crate::error::{ReflowError, Result};
use crate::payload::{self, fnv1a32, PayloadMeta, PAYLOAD_SEPARATOR};
use async_trait::async_trait;
use bytes::Bytes;
use rustls::pki_types::ServerName;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

/// TCP sink settings
#[derive(Debug, Clone)]
pub struct TcpSinkConfig {
    /// Peer address, `host:port`
    pub address: String,
    /// Wrap connections in TLS
    pub secure: bool,
    /// Route payloads sharing a UUID to the same worker connection
    pub sticky: bool,
}

impl TcpSinkConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            secure: false,
            sticky: false,
        }
    }

    pub fn with_sticky(mut self, sticky: bool) -> Self {
        self.sticky = sticky;
        self
    }

    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }
}

/// Worker index a payload UUID hashes to
pub fn sticky_index(uuid: &[u8], buckets: usize) -> usize {
    fnv1a32(uuid) as usize % buckets
}

enum SinkStream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl SinkStream {
    async fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        match self {
            SinkStream::Plain(s) => s.write_all(data).await,
            SinkStream::Tls(s) => s.write_all(data).await,
        }
    }
}

/// Payload sink feeding a pool of keep-alive TCP connections
pub struct TcpSink {
    config: Arc<TcpSinkConfig>,
    senders: Vec<mpsc::Sender<Bytes>>,
}

impl TcpSink {
    pub fn new(config: TcpSinkConfig) -> Self {
        let config = Arc::new(config);
        let mut senders = Vec::new();

        if config.sticky {
            for index in 0..TCP_SINK_WORKERS {
                let (tx, rx) = mpsc::channel(TCP_STICKY_QUEUE_LEN);
                senders.push(tx);
                tokio::spawn(worker(Arc::clone(&config), index, Arc::new(Mutex::new(rx))));
            }
        } else {
            let (tx, rx) = mpsc::channel(TCP_SHARED_QUEUE_LEN);
            senders.push(tx);
            let shared = Arc::new(Mutex::new(rx));
            for index in 0..TCP_SINK_WORKERS {
                tokio::spawn(worker(Arc::clone(&config), index, Arc::clone(&shared)));
            }
        }

        Self { config, senders }
    }

    fn buffer_index(&self, data: &[u8]) -> usize {
        if !self.config.sticky {
            return 0;
        }
        match PayloadMeta::parse(data) {
            Some(meta) => sticky_index(meta.uuid, self.senders.len()),
            None => 0,
        }
    }
}

#[async_trait]
impl PayloadWrite for TcpSink {
    async fn write(&self, data: Bytes) -> Result<()> {
        // replayed responses stay local; only wire-captured payloads peer
        if !payload::is_origin(&data) {
            return Ok(());
        }
        let index = self.buffer_index(&data);
        self.senders[index]
            .send(data)
            .await
            .map_err(|_| ReflowError::sink("tcp", "worker channel closed"))
    }

    fn kind(&self) -> &'static str {
        "tcp"
    }
}

async fn worker(config: Arc<TcpSinkConfig>, index: usize, queue: Arc<Mutex<mpsc::Receiver<Bytes>>>) {
    let mut conn = connect_with_retry(&config).await;
    let mut carry: Option<Bytes> = None;

    loop {
        let data = match carry.take() {
            Some(d) => d,
            None => {
                let received = {
                    let mut rx = queue.lock().await;
                    rx.recv().await
                };
                match received {
                    Some(d) => d,
                    None => return,
                }
            }
        };

        let wrote = async {
            conn.write_all(&data).await?;
            conn.write_all(PAYLOAD_SEPARATOR).await
        }
        .await;

        if let Err(e) = wrote {
            warn!(worker = index, error = %e, "tcp output connection closed, reconnecting");
            // the in-flight payload goes out first on the new connection
            carry = Some(data);
            conn = connect_with_retry(&config).await;
        }
    }
}

async fn connect_with_retry(config: &TcpSinkConfig) -> SinkStream {
    let mut retries: u64 = 0;
    loop {
        match connect(config).await {
            Ok(stream) => {
                if retries > 0 {
                    info!(address = %config.address, retries, "connected to peer after retries");
                }
                return stream;
            }
            Err(e) => {
                retries += 1;
                warn!(
                    address = %config.address,
                    retries,
                    error = %e,
                    "can't connect to peer, reconnecting in 1 second"
                );
                tokio::time::sleep(TCP_RECONNECT_DELAY).await;
            }
        }
    }
}

async fn connect(config: &TcpSinkConfig) -> Result<SinkStream> {
    let tcp = TcpStream::connect(&config.address)
        .await
        .map_err(|e| ReflowError::sink("connect", format!("{}: {}", config.address, e)))?;

    if !config.secure {
        return Ok(SinkStream::Plain(tcp));
    }

    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    let host = config
        .address
        .rsplit_once(':')
        .map(|(h, _)| h)
        .unwrap_or(&config.address)
        .to_string();
    let server_name = ServerName::try_from(host)
        .map_err(|e| ReflowError::sink("tls", format!("invalid peer name: {}", e)))?;

    let connector = TlsConnector::from(Arc::new(tls_config));
    let stream = connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| ReflowError::sink("tls", format!("handshake failed: {}", e)))?;
    debug!(address = %config.address, "peer connection wrapped in TLS");
    Ok(SinkStream::Tls(Box::new(stream)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[test]
    fn test_sticky_index_is_deterministic() {
        let uuid = payload::uuid();
        let first = sticky_index(&uuid, 10);
        for _ in 0..100 {
            assert_eq!(sticky_index(&uuid, 10), first);
        }
        assert_eq!(first, fnv1a32(&uuid) as usize % 10);
    }

    #[test]
    fn test_request_and_response_share_worker() {
        for _ in 0..1000 {
            let uuid = payload::uuid();
            let request = payload::encode(
                payload::PayloadKind::Request,
                &uuid,
                1,
                -1,
                b"GET / HTTP/1.1\r\n\r\n",
            );
            let response = payload::encode(
                payload::PayloadKind::Response,
                &uuid,
                2,
                1,
                b"HTTP/1.1 200 OK\r\n\r\n",
            );
            let req_meta = PayloadMeta::parse(&request).unwrap();
            let resp_meta = PayloadMeta::parse(&response).unwrap();
            assert_eq!(
                sticky_index(req_meta.uuid, 10),
                sticky_index(resp_meta.uuid, 10)
            );
        }
    }

    #[test]
    fn test_hash_distribution_is_even() {
        let mut buckets = [0u64; 10];
        let rounds = 1_000_000;
        for _ in 0..rounds {
            buckets[sticky_index(&payload::uuid(), 10)] += 1;
        }

        let mean = rounds as f64 / 10.0;
        for (i, &count) in buckets.iter().enumerate() {
            let deviation = (count as f64 - mean).abs() / mean;
            assert!(
                deviation < 0.2,
                "bucket {} holds {} of {} (deviation {:.3})",
                i,
                count,
                rounds,
                deviation
            );
        }
    }

    #[tokio::test]
    async fn test_payloads_arrive_framed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // every pool worker dials; aggregate whatever arrives on any of them
        let received = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink_side = Arc::clone(&received);
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                let buf = Arc::clone(&sink_side);
                tokio::spawn(async move {
                    let mut chunk = [0u8; 4096];
                    while let Ok(n) = socket.read(&mut chunk).await {
                        if n == 0 {
                            break;
                        }
                        buf.lock().extend_from_slice(&chunk[..n]);
                    }
                });
            }
        });

        let sink = TcpSink::new(TcpSinkConfig::new(addr.to_string()));
        let uuid = payload::uuid();
        let request = payload::encode(
            payload::PayloadKind::Request,
            &uuid,
            1,
            -1,
            b"GET / HTTP/1.1\r\n\r\n",
        );
        sink.write(request.clone()).await.unwrap();
        // replayed responses are filtered out of peering
        let replayed = payload::encode(
            payload::PayloadKind::ReplayedResponse,
            &uuid,
            2,
            1,
            b"HTTP/1.1 200 OK\r\n\r\n",
        );
        sink.write(replayed).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        drop(sink);

        let mut expected = request.to_vec();
        expected.extend_from_slice(PAYLOAD_SEPARATOR);
        assert_eq!(*received.lock(), expected);
    }
}
