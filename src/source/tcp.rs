//! TCP peering source
//!
//! Listens for connections from other instances and splits the inbound
//! byte stream on the payload separator. With a certificate configured
//! the listener speaks TLS.

use super::drain_payloads;
use crate::config::defaults::PIPELINE_QUEUE_LEN;
use crate::config::TlsIdentity;
use crate::error::{ReflowError, Result};
use bytes::Bytes;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

/// TCP source settings
#[derive(Debug, Clone)]
pub struct TcpSourceConfig {
    /// Listen address, `host:port` or `:port`
    pub address: String,
    /// Serve TLS with this certificate/key pair
    pub tls: Option<TlsIdentity>,
}

impl TcpSourceConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            tls: None,
        }
    }

    pub fn with_tls(mut self, identity: TlsIdentity) -> Self {
        self.tls = Some(identity);
        self
    }
}

/// Payload listener for peering with other instances
pub struct TcpSource {
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
}

impl TcpSource {
    /// Bind the listener and load TLS material when configured
    pub async fn bind(config: TcpSourceConfig) -> Result<Self> {
        let address = if config.address.starts_with(':') {
            format!("0.0.0.0{}", config.address)
        } else {
            config.address.clone()
        };
        let listener = TcpListener::bind(&address)
            .await
            .map_err(|e| ReflowError::source("bind", format!("{}: {}", address, e)))?;

        let acceptor = match &config.tls {
            Some(identity) => Some(load_tls_acceptor(identity)?),
            None => None,
        };

        info!(
            address = %listener.local_addr().map(|a| a.to_string()).unwrap_or_default(),
            tls = acceptor.is_some(),
            "tcp input listening"
        );
        Ok(Self { listener, acceptor })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Spawn the accept loop and hand back the payload stream
    pub fn spawn(self, shutdown: broadcast::Receiver<()>) -> mpsc::Receiver<Bytes> {
        let (tx, rx) = mpsc::channel(PIPELINE_QUEUE_LEN);

        tokio::spawn(async move {
            let mut shutdown = shutdown;
            loop {
                let accepted = tokio::select! {
                    _ = shutdown.recv() => return,
                    accepted = self.listener.accept() => accepted,
                };
                let (socket, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                debug!(peer = %peer, "peer connected");

                let tx = tx.clone();
                let acceptor = self.acceptor.clone();
                let shutdown = shutdown.resubscribe();
                tokio::spawn(async move {
                    match acceptor {
                        Some(acceptor) => match acceptor.accept(socket).await {
                            Ok(tls) => read_connection(tls, tx, shutdown).await,
                            Err(e) => warn!(peer = %peer, error = %e, "TLS accept failed"),
                        },
                        None => read_connection(socket, tx, shutdown).await,
                    }
                });
            }
        });

        rx
    }
}

async fn read_connection<S>(
    mut socket: S,
    tx: mpsc::Sender<Bytes>,
    mut shutdown: broadcast::Receiver<()>,
) where
    S: tokio::io::AsyncRead + Unpin + Send,
{
    let mut buf = Vec::new();
    let mut chunk = vec![0u8; 64 * 1024];

    loop {
        let n = tokio::select! {
            _ = shutdown.recv() => return,
            read = socket.read(&mut chunk) => match read {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            },
        };
        buf.extend_from_slice(&chunk[..n]);

        for payload in drain_payloads(&mut buf) {
            if tx.send(payload).await.is_err() {
                return;
            }
        }
    }
}

fn load_tls_acceptor(identity: &TlsIdentity) -> Result<TlsAcceptor> {
    let certs = load_certs(&identity.cert_path)?;
    let key = load_private_key(&identity.key_path)?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ReflowError::config("input-tcp-certificate", e.to_string()))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| ReflowError::config("input-tcp-certificate", format!("{}: {}", path, e)))?;
    let mut reader = BufReader::new(file);
    let certs: std::io::Result<Vec<_>> = rustls_pemfile::certs(&mut reader).collect();
    let certs = certs
        .map_err(|e| ReflowError::config("input-tcp-certificate", format!("{}: {}", path, e)))?;
    if certs.is_empty() {
        return Err(ReflowError::config(
            "input-tcp-certificate",
            format!("no certificates found in {}", path),
        ));
    }
    Ok(certs)
}

fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path).map_err(|e| {
        ReflowError::config("input-tcp-certificate-key", format!("{}: {}", path, e))
    })?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| ReflowError::config("input-tcp-certificate-key", format!("{}: {}", path, e)))?
        .ok_or_else(|| {
            ReflowError::config(
                "input-tcp-certificate-key",
                format!("no private key found in {}", path),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::{self, PayloadKind, PAYLOAD_SEPARATOR};
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn test_payloads_cross_the_wire() {
        let source = TcpSource::bind(TcpSourceConfig::new("127.0.0.1:0"))
            .await
            .unwrap();
        let addr = source.local_addr().unwrap();
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let mut rx = source.spawn(shutdown_rx);

        let uuid = payload::uuid();
        let first = payload::encode(PayloadKind::Request, &uuid, 1, -1, b"GET / HTTP/1.1\r\n\r\n");
        let second = payload::encode(PayloadKind::Response, &uuid, 2, 1, b"HTTP/1.1 200 OK\r\n\r\n");

        let mut peer = TcpStream::connect(addr).await.unwrap();
        peer.write_all(&first).await.unwrap();
        peer.write_all(PAYLOAD_SEPARATOR).await.unwrap();
        // split the second payload across two writes
        peer.write_all(&second[..10]).await.unwrap();
        peer.flush().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        peer.write_all(&second[10..]).await.unwrap();
        peer.write_all(PAYLOAD_SEPARATOR).await.unwrap();

        assert_eq!(rx.recv().await.expect("first payload"), first);
        assert_eq!(rx.recv().await.expect("second payload"), second);
    }

    #[tokio::test]
    async fn test_multiple_peers_feed_one_stream() {
        let source = TcpSource::bind(TcpSourceConfig::new("127.0.0.1:0"))
            .await
            .unwrap();
        let addr = source.local_addr().unwrap();
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let mut rx = source.spawn(shutdown_rx);

        for _ in 0..3 {
            let mut peer = TcpStream::connect(addr).await.unwrap();
            let p = payload::encode(
                PayloadKind::Request,
                &payload::uuid(),
                1,
                -1,
                b"GET / HTTP/1.1\r\n\r\n",
            );
            peer.write_all(&p).await.unwrap();
            peer.write_all(PAYLOAD_SEPARATOR).await.unwrap();
        }

        for _ in 0..3 {
            let got = rx.recv().await.expect("payload from some peer");
            assert!(payload::is_request(&got));
        }
    }

    #[tokio::test]
    async fn test_missing_certificate_is_fatal() {
        let config = TcpSourceConfig::new("127.0.0.1:0").with_tls(TlsIdentity {
            cert_path: "/missing/cert.pem".to_string(),
            key_path: "/missing/key.pem".to_string(),
        });
        assert!(TcpSource::bind(config).await.is_err());
    }
}
