//! Payload sources
//!
//! Sources produce envelope-tagged payloads for the emitter: recorded
//! files written by the file sink (the symmetric reader) and TCP peering
//! connections from other instances. Both speak the same framing: raw
//! payload bytes delimited by the payload separator.

mod file;
mod tcp;

pub use file::{read_payload_file, FileSource};
pub use tcp::{TcpSource, TcpSourceConfig};

use crate::payload::PAYLOAD_SEPARATOR;
use bytes::Bytes;

/// Incrementally split a byte stream on the payload separator.
///
/// Complete payloads are drained out of `buf`; a trailing partial payload
/// stays buffered for the next read.
pub(crate) fn drain_payloads(buf: &mut Vec<u8>) -> Vec<Bytes> {
    let mut out = Vec::new();
    loop {
        let hit = buf
            .windows(PAYLOAD_SEPARATOR.len())
            .position(|w| w == PAYLOAD_SEPARATOR);
        match hit {
            Some(at) => {
                let mut rest = buf.split_off(at + PAYLOAD_SEPARATOR.len());
                buf.truncate(at);
                if !buf.is_empty() {
                    out.push(Bytes::from(std::mem::take(buf)));
                }
                std::mem::swap(buf, &mut rest);
            }
            None => return out,
        }
    }
}
