//! Request/response pairing indices
//!
//! Pairing is a logical relation kept as two flat maps, never a pointer
//! graph: completed requests indexed by their end-of-message seq (which a
//! response acks), and completed-but-unmatched responses stashed by that
//! same ack until the request finishes or expiry flushes them.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// What survives of a completed request for pairing its response
#[derive(Debug, Clone)]
pub struct RequestRecord {
    pub uuid: Vec<u8>,
    pub nanos: i64,
    pub is_head: bool,
    registered_at: Instant,
}

impl RequestRecord {
    pub fn new(uuid: Vec<u8>, nanos: i64, is_head: bool) -> Self {
        Self {
            uuid,
            nanos,
            is_head,
            registered_at: Instant::now(),
        }
    }
}

/// A response that completed before its request did
#[derive(Debug)]
pub struct PendingResponse {
    pub bytes: Vec<u8>,
    pub nanos: i64,
    stashed_at: Instant,
}

impl PendingResponse {
    pub fn new(bytes: Vec<u8>, nanos: i64) -> Self {
        Self {
            bytes,
            nanos,
            stashed_at: Instant::now(),
        }
    }
}

/// Indices linking in-progress requests to their responses
#[derive(Debug, Default)]
pub struct PairingTable {
    ack_to_request: HashMap<u32, RequestRecord>,
    pending_responses: HashMap<u32, PendingResponse>,
}

impl PairingTable {
    /// Index a completed request under the seq its response will ack
    pub fn register_request(&mut self, next_seq: u32, record: RequestRecord) {
        self.ack_to_request.insert(next_seq, record);
    }

    /// Look at a request record without consuming it
    pub fn peek_request(&self, ack: u32) -> Option<&RequestRecord> {
        self.ack_to_request.get(&ack)
    }

    /// Consume the request record matching a completed response
    pub fn take_request(&mut self, ack: u32) -> Option<RequestRecord> {
        self.ack_to_request.remove(&ack)
    }

    /// Stash a response whose request has not completed yet
    pub fn stash_response(&mut self, ack: u32, response: PendingResponse) {
        self.pending_responses.insert(ack, response);
    }

    /// Consume a stashed response the moment its request completes
    pub fn take_pending(&mut self, next_seq: u32) -> Option<PendingResponse> {
        self.pending_responses.remove(&next_seq)
    }

    /// Drop request records and flush stashed responses older than
    /// `expire`; the returned responses are emitted unpaired
    pub fn sweep(&mut self, expire: Duration) -> Vec<PendingResponse> {
        let now = Instant::now();
        self.ack_to_request
            .retain(|_, r| now.duration_since(r.registered_at) < expire);

        let mut flushed = Vec::new();
        let expired: Vec<u32> = self
            .pending_responses
            .iter()
            .filter(|(_, p)| now.duration_since(p.stashed_at) >= expire)
            .map(|(&k, _)| k)
            .collect();
        for key in expired {
            if let Some(p) = self.pending_responses.remove(&key) {
                flushed.push(p);
            }
        }
        flushed
    }

    pub fn request_count(&self) -> usize {
        self.ack_to_request.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending_responses.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_then_response() {
        let mut table = PairingTable::default();
        table.register_request(19, RequestRecord::new(b"aa".to_vec(), 100, false));

        let record = table.take_request(19).unwrap();
        assert_eq!(record.uuid, b"aa");
        assert!(table.take_request(19).is_none());
    }

    #[test]
    fn test_response_before_request() {
        let mut table = PairingTable::default();
        table.stash_response(19, PendingResponse::new(b"HTTP/1.1 200 OK\r\n\r\n".to_vec(), 200));

        let pending = table.take_pending(19).unwrap();
        assert_eq!(pending.nanos, 200);
        assert_eq!(table.pending_count(), 0);
    }

    #[test]
    fn test_sweep_flushes_stale_entries() {
        let mut table = PairingTable::default();
        table.register_request(19, RequestRecord::new(b"aa".to_vec(), 100, false));
        table.stash_response(42, PendingResponse::new(b"resp".to_vec(), 200));

        let flushed = table.sweep(Duration::ZERO);
        assert_eq!(flushed.len(), 1);
        assert_eq!(table.request_count(), 0);
        assert_eq!(table.pending_count(), 0);
    }
}
