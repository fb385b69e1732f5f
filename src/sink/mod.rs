//! Payload sinks
//!
//! A sink is anything that accepts envelope-tagged payloads: a rotating
//! file, a TCP peer, the replay HTTP pool, stdout. Sinks sit behind the
//! [`PayloadWrite`] trait so the emitter can fan out to a heterogeneous
//! set without interpreting the bytes it carries.

mod file;
mod tcp;

pub use file::{FileSink, FileSinkConfig};
pub use tcp::{TcpSink, TcpSinkConfig};

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;

/// Destination for payloads flowing out of the emitter
#[async_trait]
pub trait PayloadWrite: Send + Sync {
    /// Deliver one payload. Backpressure is exerted by awaiting; a fatal
    /// error here shuts the pipeline down.
    async fn write(&self, payload: Bytes) -> Result<()>;

    /// Flush buffered state and release resources. Must be idempotent.
    async fn close(&self) -> Result<()> {
        Ok(())
    }

    /// Short tag for logs
    fn kind(&self) -> &'static str;
}

/// Discards everything written to it
#[derive(Debug, Default)]
pub struct NullSink;

#[async_trait]
impl PayloadWrite for NullSink {
    async fn write(&self, _payload: Bytes) -> Result<()> {
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "null"
    }
}

/// Prints payloads to stdout, for wiring tests and debugging
#[derive(Debug, Default)]
pub struct StdoutSink;

#[async_trait]
impl PayloadWrite for StdoutSink {
    async fn write(&self, payload: Bytes) -> Result<()> {
        let text = String::from_utf8_lossy(&payload);
        println!("{}", text);
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "stdout"
    }
}
