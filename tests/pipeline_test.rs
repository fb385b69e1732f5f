//! End-to-end pipeline tests
//!
//! These exercise the whole data path the way the binary wires it:
//! recorded files through the emitter into sinks, capture feeds through
//! the reassembler, and replayed responses re-entering the pipeline.

use bytes::Bytes;
use reflow::payload::{self, PayloadKind, PayloadMeta, PAYLOAD_SEPARATOR};
use reflow::proto;
use reflow::sink::{FileSink, FileSinkConfig, PayloadWrite};
use reflow::source::read_payload_file;
use reflow::testing::{first_packet, response_packet};
use reflow::{AppConfig, Engine};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

fn sample_payloads(count: usize) -> Vec<Bytes> {
    (0..count)
        .map(|i| {
            let uuid = payload::uuid();
            let body = format!(
                "POST /items/{} HTTP/1.1\r\nHost: prod.internal\r\nContent-Length: 2\r\n\r\nok",
                i
            );
            payload::encode(PayloadKind::Request, &uuid, i as i64 + 1, -1, body.as_bytes())
        })
        .collect()
}

fn tuples(payloads: &[Bytes]) -> Vec<(PayloadKind, Vec<u8>, i64, i64, Vec<u8>)> {
    payloads
        .iter()
        .map(|p| {
            let meta = PayloadMeta::parse(p).expect("well-formed payload");
            (
                meta.kind,
                meta.uuid.to_vec(),
                meta.nanos,
                meta.extra,
                meta.body.to_vec(),
            )
        })
        .collect()
}

#[tokio::test]
async fn file_sink_and_source_are_symmetric() {
    let dir = TempDir::new().unwrap();
    let template = format!("{}/roundtrip.rec", dir.path().display());

    let originals = sample_payloads(50);
    let sink = FileSink::new(&template, FileSinkConfig::default());
    for p in &originals {
        sink.write(p.clone()).await.unwrap();
    }
    sink.close().await.unwrap();

    let read_back = read_payload_file(&format!("{}/roundtrip_0.rec", dir.path().display())).unwrap();
    assert_eq!(tuples(&read_back), tuples(&originals));
}

#[tokio::test]
async fn rotated_gzip_chunks_hold_every_payload() {
    let dir = TempDir::new().unwrap();
    let template = format!("{}/log.gz", dir.path().display());

    let originals = sample_payloads(1000);
    let sink = FileSink::new(
        &template,
        FileSinkConfig::default().with_queue_limit(300),
    );
    for p in &originals {
        sink.write(p.clone()).await.unwrap();
    }
    sink.close().await.unwrap();

    // rotation produced several indexed .gz chunks; their combined
    // uncompressed content is the original sequence
    let mut collected = Vec::new();
    for index in 0.. {
        let chunk = format!("{}/log_{}.gz", dir.path().display(), index);
        if !std::path::Path::new(&chunk).exists() {
            break;
        }
        collected.extend(read_payload_file(&chunk).unwrap());
    }

    assert!(collected.len() == 1000, "got {} payloads", collected.len());
    assert_eq!(tuples(&collected), tuples(&originals));
}

#[tokio::test]
async fn capture_feed_replays_against_origin() {
    // an origin that answers every request on one connection
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin_addr = listener.local_addr().unwrap();
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
                    let reply = b"HTTP/1.1 200 OK\r\nContent-Length: 8\r\n\r\nreplayed";
                    if socket.write_all(reply).await.is_err() {
                        return;
                    }
                }
            });
        }
    });

    let dir = TempDir::new().unwrap();
    let output_path = format!("{}/mirror.rec", dir.path().display());

    let mut config = AppConfig::default();
    config.capture.ports = vec![80];
    config.capture.expire = Duration::from_millis(20);
    config.capture.track_responses = true;
    config.output_files = vec![output_path];
    config.output_http = vec![origin_addr.to_string()];
    config.replay.track_responses = true;
    config.replay.timeout = Duration::from_millis(500);

    let mut engine = Engine::new(config);
    let handle = engine.shutdown_handle();
    let (packets_tx, packets_rx) = mpsc::channel(16);
    engine.attach_capture(packets_rx);
    let running = tokio::spawn(engine.run());

    let req = first_packet(b"GET /live HTTP/1.1\r\nHost: prod.internal\r\n\r\n");
    let resp = response_packet(&req, b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n");
    packets_tx.send(req).await.unwrap();
    packets_tx.send(resp).await.unwrap();

    tokio::time::sleep(Duration::from_millis(600)).await;
    let _ = handle.send(());
    running.await.unwrap().unwrap();

    let written =
        read_payload_file(&format!("{}/mirror_0.rec", dir.path().display())).unwrap();
    let metas: Vec<_> = written
        .iter()
        .map(|p| PayloadMeta::parse(p).expect("well-formed payload"))
        .collect();

    let request = metas
        .iter()
        .find(|m| m.kind == PayloadKind::Request)
        .expect("captured request in the mirror file");
    let response = metas
        .iter()
        .find(|m| m.kind == PayloadKind::Response)
        .expect("captured response in the mirror file");
    let replayed = metas
        .iter()
        .find(|m| m.kind == PayloadKind::ReplayedResponse)
        .expect("replayed response in the mirror file");

    // one exchange, one identifier across all three payloads
    assert_eq!(request.uuid, response.uuid);
    assert_eq!(request.uuid, replayed.uuid);
    assert_eq!(request.extra, -1);
    assert!(response.extra >= 0);
    assert!(replayed.extra >= 0);
    assert!(request.nanos <= response.nanos);
    assert!(replayed.body.starts_with(b"HTTP/1.1 200 OK"));
    assert_eq!(proto::body(replayed.body), b"replayed");
}

#[tokio::test]
async fn tcp_peering_carries_payloads_between_instances() {
    // downstream instance: tcp input -> file output
    let dir = TempDir::new().unwrap();
    let output_path = format!("{}/received.rec", dir.path().display());

    let source = reflow::source::TcpSource::bind(reflow::source::TcpSourceConfig::new(
        "127.0.0.1:0",
    ))
    .await
    .unwrap();
    let peer_addr = source.local_addr().unwrap();

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
    let mut stream = source.spawn(shutdown_tx.subscribe());

    let file = FileSink::new(&output_path, FileSinkConfig::default());
    let writer = tokio::spawn(async move {
        let mut count = 0;
        while let Some(p) = stream.recv().await {
            file.write(p).await.unwrap();
            count += 1;
            if count == 2 {
                break;
            }
        }
        file.close().await.unwrap();
    });

    // upstream instance side: a sticky tcp sink keeps the pair ordered on
    // one connection
    let sink = reflow::sink::TcpSink::new(
        reflow::sink::TcpSinkConfig::new(peer_addr.to_string()).with_sticky(true),
    );
    let uuid = payload::uuid();
    let request = payload::encode(PayloadKind::Request, &uuid, 10, -1, b"GET / HTTP/1.1\r\n\r\n");
    let response = payload::encode(PayloadKind::Response, &uuid, 20, 10, b"HTTP/1.1 200 OK\r\n\r\n");
    sink.write(request.clone()).await.unwrap();
    sink.write(response.clone()).await.unwrap();

    tokio::time::timeout(Duration::from_secs(2), writer)
        .await
        .expect("payloads arrive in time")
        .unwrap();

    let written =
        read_payload_file(&format!("{}/received_0.rec", dir.path().display())).unwrap();
    assert_eq!(tuples(&written), tuples(&[request, response]));
}

#[test]
fn separator_never_occurs_in_http_messages() {
    // the separator is non-ASCII; HTTP wire messages in these tests are
    // ASCII, so framing can never split a message in half
    assert!(PAYLOAD_SEPARATOR.iter().any(|&b| b >= 0x80));
    for p in sample_payloads(5) {
        assert!(!p
            .windows(PAYLOAD_SEPARATOR.len())
            .any(|w| w == PAYLOAD_SEPARATOR));
    }
}
