//! Testing utilities for Reflow
//!
//! Shared helpers for unit and integration tests: synthetic TCP packet
//! builders mirroring real capture semantics, and a payload sink that
//! collects everything written to it.

use crate::capture::{TcpFlags, TcpPacket, LOOPBACK};
use crate::error::Result;
use crate::sink::PayloadWrite;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

/// Port used as the captured service side by packet builders
pub const TEST_CAPTURE_PORT: u16 = 80;

/// Build a synthetic decoded packet. `incoming` packets travel toward the
/// captured port, outgoing ones from it.
pub fn build_packet(incoming: bool, ack: u32, seq: u32, data: &[u8], timestamp: i64) -> TcpPacket {
    let (src_port, dst_port) = if incoming {
        (50000, TEST_CAPTURE_PORT)
    } else {
        (TEST_CAPTURE_PORT, 50000)
    };
    TcpPacket {
        src_addr: LOOPBACK,
        src_port,
        dst_addr: LOOPBACK,
        dst_port,
        seq,
        ack,
        flags: TcpFlags::default(),
        timestamp,
        data: Bytes::copy_from_slice(data),
    }
}

/// First packet of a new client connection
pub fn first_packet(payload: &[u8]) -> TcpPacket {
    build_packet(true, 1, 1, payload, 1)
}

/// Continuation in the same direction as `prev`
pub fn next_packet(prev: &TcpPacket, payload: &[u8]) -> TcpPacket {
    build_packet(
        prev.dst_port == TEST_CAPTURE_PORT,
        prev.ack,
        prev.seq.wrapping_add(prev.data.len() as u32),
        payload,
        prev.timestamp + 1,
    )
}

/// Reply from the opposite direction, acking everything `prev` carried
pub fn response_packet(prev: &TcpPacket, payload: &[u8]) -> TcpPacket {
    build_packet(
        prev.dst_port != TEST_CAPTURE_PORT,
        prev.seq.wrapping_add(prev.data.len() as u32),
        prev.ack,
        payload,
        prev.timestamp + 1,
    )
}

/// A sink that remembers every payload written to it
#[derive(Debug, Default)]
pub struct CollectSink {
    payloads: Mutex<Vec<Bytes>>,
    closed: Mutex<bool>,
}

impl CollectSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn payloads(&self) -> Vec<Bytes> {
        self.payloads.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.payloads.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock()
    }
}

#[async_trait]
impl PayloadWrite for CollectSink {
    async fn write(&self, payload: Bytes) -> Result<()> {
        self.payloads.lock().push(payload);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        *self.closed.lock() = true;
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "collect"
    }
}
