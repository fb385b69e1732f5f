//! Many-to-many copy loop
//!
//! [`copy_multi`] is the heart of the pipeline: it reads payloads from one
//! input, runs requests through the modifier chain, optionally prettifies
//! bodies, and fans the result out to every writer (or round-robins when
//! splitting). Requests the modifier drops are remembered so their
//! responses are dropped too, with a periodic sweep keeping that table
//! bounded.

mod modifier;

pub use modifier::{HttpModifier, ModifierConfig};

use crate::error::Result;
use crate::payload::{PayloadKind, PayloadMeta};
use crate::proto;
use crate::sink::PayloadWrite;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

const FILTERED_SWEEP_EVERY: u64 = 1000;
const FILTERED_TTL: Duration = Duration::from_secs(60);

/// Copy-loop settings
#[derive(Debug, Clone, Default)]
pub struct EmitterConfig {
    /// Round-robin payloads across writers instead of broadcasting
    pub split_output: bool,
    /// Inflate gzip bodies and dechunk before emission
    pub prettify_http: bool,
    /// Skip payloads larger than this (0 = unlimited)
    pub copy_buffer_size: i64,
}

/// Copy payloads from one reader to many writers until the input ends or
/// shutdown fires. Write errors are forwarded to the caller as-is.
pub async fn copy_multi(
    mut input: mpsc::Receiver<Bytes>,
    writers: Vec<Arc<dyn PayloadWrite>>,
    modifier: Option<Arc<HttpModifier>>,
    config: EmitterConfig,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let mut writer_index = 0usize;
    let mut filtered_requests: HashMap<Vec<u8>, Instant> = HashMap::new();
    let mut last_sweep = Instant::now();
    let mut iterations: u64 = 0;

    loop {
        let payload = tokio::select! {
            _ = shutdown.recv() => return Ok(()),
            received = input.recv() => match received {
                Some(p) => p,
                None => return Ok(()),
            },
        };
        iterations += 1;

        if config.copy_buffer_size > 0 && payload.len() as i64 > config.copy_buffer_size {
            warn!(
                bytes = payload.len(),
                "payload too large to process, consider increasing --copy-buffer-size"
            );
            continue;
        }

        let (kind, uuid, body_start) = match PayloadMeta::parse(&payload) {
            Some(meta) => (meta.kind, meta.uuid.to_vec(), payload.len() - meta.body.len()),
            None => {
                debug!(bytes = payload.len(), "skipping malformed record");
                continue;
            }
        };

        let mut payload = payload;

        if let Some(modifier) = &modifier {
            if kind == PayloadKind::Request {
                let body = payload[body_start..].to_vec();
                match modifier.rewrite(body) {
                    None => {
                        filtered_requests.insert(uuid, Instant::now());
                        continue;
                    }
                    Some(rewritten) => {
                        if rewritten != &payload[body_start..] {
                            let mut rebuilt = payload[..body_start].to_vec();
                            rebuilt.extend_from_slice(&rewritten);
                            payload = Bytes::from(rebuilt);
                        }
                    }
                }
            } else if filtered_requests.remove(&uuid).is_some() {
                continue;
            }
        }

        if config.prettify_http {
            match proto::prettify_http(&payload[body_start..]) {
                Some(pretty) => {
                    let mut rebuilt = payload[..body_start].to_vec();
                    rebuilt.extend_from_slice(&pretty);
                    payload = Bytes::from(rebuilt);
                }
                None => {
                    debug!("skipping payload that failed to prettify");
                    continue;
                }
            }
        }

        if config.split_output {
            writers[writer_index].write(payload).await?;
            writer_index = (writer_index + 1) % writers.len();
        } else {
            for writer in &writers {
                writer.write(payload.clone()).await?;
            }
        }

        if iterations % FILTERED_SWEEP_EVERY == 0 && last_sweep.elapsed() > FILTERED_TTL {
            let now = Instant::now();
            filtered_requests.retain(|_, t| now.duration_since(*t) <= FILTERED_TTL);
            last_sweep = now;
        }
    }
}
