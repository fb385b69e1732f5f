//! Recorded-payload file source
//!
//! Symmetric reader for files the file sink writes: separator-delimited
//! payloads, optionally gzip-wrapped when the path ends in `.gz`. Loop
//! mode re-reads the file forever for load testing.

use super::drain_payloads;
use crate::config::defaults::PIPELINE_QUEUE_LEN;
use crate::error::{ReflowError, Result};
use bytes::Bytes;
use flate2::read::GzDecoder;
use std::fs::File;
use std::io::Read;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info};

/// Read a whole payload file into its payload sequence
pub fn read_payload_file(path: &str) -> Result<Vec<Bytes>> {
    let file = File::open(path).map_err(|e| ReflowError::source("open", format!("{}: {}", path, e)))?;

    let mut raw = Vec::new();
    if path.ends_with(".gz") {
        GzDecoder::new(file)
            .read_to_end(&mut raw)
            .map_err(|e| ReflowError::source("gunzip", format!("{}: {}", path, e)))?;
    } else {
        let mut file = file;
        file.read_to_end(&mut raw)
            .map_err(|e| ReflowError::source("read", format!("{}: {}", path, e)))?;
    }

    let mut buf = raw;
    let mut payloads = drain_payloads(&mut buf);
    // tolerate a final record missing its trailing separator
    if !buf.is_empty() {
        payloads.push(Bytes::from(buf));
    }
    Ok(payloads)
}

/// Replays a recorded payload file into the pipeline
pub struct FileSource {
    path: String,
    loop_file: bool,
}

impl FileSource {
    pub fn new(path: impl Into<String>, loop_file: bool) -> Self {
        Self {
            path: path.into(),
            loop_file,
        }
    }

    /// Spawn the reader task and hand back its payload stream
    pub fn spawn(self, mut shutdown: broadcast::Receiver<()>) -> mpsc::Receiver<Bytes> {
        let (tx, rx) = mpsc::channel(PIPELINE_QUEUE_LEN);

        tokio::spawn(async move {
            loop {
                let path = self.path.clone();
                let payloads =
                    match tokio::task::spawn_blocking(move || read_payload_file(&path)).await {
                        Ok(Ok(p)) => p,
                        Ok(Err(e)) => {
                            error!(path = %self.path, error = %e, "file input failed");
                            return;
                        }
                        Err(e) => {
                            error!(error = %e, "file input reader task failed");
                            return;
                        }
                    };

                for payload in payloads {
                    tokio::select! {
                        _ = shutdown.recv() => return,
                        sent = tx.send(payload) => {
                            if sent.is_err() {
                                return;
                            }
                        }
                    }
                }

                if !self.loop_file {
                    info!(path = %self.path, "file input finished");
                    return;
                }
            }
        });

        rx
    }
}
