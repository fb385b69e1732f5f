//! Replay HTTP output
//!
//! Re-sends captured requests against a live origin over manually framed
//! keep-alive HTTP/1.1 connections. The [`client`] owns one socket and
//! all framing; the [`pool`] scales client-holding workers with load and
//! feeds replayed responses (kind 3) back into the pipeline.

mod client;
mod pool;

pub use client::{
    error_payload, HttpClient, HttpClientConfig, HTTP_CONNECTION_ERROR, HTTP_CONNECTION_TIMEOUT,
    HTTP_TIMEOUT, HTTP_UNKNOWN_ERROR, HTTP_UNREACHABLE,
};
pub use pool::{ReplayConfig, ReplaySink};
