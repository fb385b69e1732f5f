#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

//! # Reflow
//!
//! Reflow is a live HTTP-traffic recording and replay engine. It passively
//! observes TCP traffic on one host, reconstructs HTTP request/response
//! pairs from raw packets, and re-emits them (possibly transformed) to
//! one or more sinks: a replica HTTP server, a rotating file, a TCP peer.
//! Its value is reproducing real production load against staging without
//! being in the request path.
//!
//! ## Quick Start
//!
//! ```bash
//! # Record traffic on port 80 to a rotating file
//! $ reflow --input-raw :80 --output-file ./requests.rec
//!
//! # Replay a recording against staging
//! $ reflow --input-file ./requests.rec --output-http http://staging.local
//!
//! # Mirror live traffic to staging, keeping only GETs
//! $ reflow --input-raw :80 --output-http http://staging.local \
//!     --http-allow-method GET
//! ```
//!
//! ## Architecture
//!
//! Payloads flow as opaque byte buffers tagged with a one-line envelope
//! (`kind uuid nanos extra`), so sinks can write without interpreting and
//! every component parses only what it needs:
//!
//! - [`capture`]: decoded TCP packet model, the boundary to the capture
//!   driver
//! - [`reassembly`]: per-flow ordering, HTTP message boundaries,
//!   request/response pairing, expiry
//! - [`payload`]: envelope encoding, UUIDs, the payload separator
//! - [`proto`]: byte-level HTTP scanning and editing
//! - [`emitter`]: the many-to-many copy loop and the modifier chain
//! - [`replay`]: manually-framed keep-alive HTTP client and its dynamic
//!   worker pool
//! - [`sink`] / [`source`]: file, TCP-peer and stdout endpoints
//! - [`engine`]: pipeline assembly, shutdown, lifecycle
//! - [`config`]: CLI arguments and the immutable process configuration
//! - [`error`]: error types and the `Result` alias
//!
//! Some sinks also produce payloads (the replay client emits kind-3
//! replayed responses), so the topology is a directed graph rather than a
//! straight pipeline.
//!
//! ## Library Usage
//!
//! ```no_run
//! use reflow::{AppConfig, Engine};
//!
//! #[tokio::main]
//! async fn main() -> reflow::Result<()> {
//!     let mut config = AppConfig::default();
//!     config.input_files = vec!["requests.rec".into()];
//!     config.output_http = vec!["http://staging.local".into()];
//!
//!     Engine::new(config).run().await
//! }
//! ```

pub mod capture;
pub mod config;
pub mod emitter;
pub mod engine;
pub mod error;
pub mod payload;
pub mod proto;
pub mod reassembly;
pub mod replay;
pub mod sink;
pub mod source;
pub mod testing;

pub use config::{AppConfig, ReflowArgs};
pub use engine::Engine;
pub use error::{ReflowError, Result};
