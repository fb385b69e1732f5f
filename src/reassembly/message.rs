//! In-progress TCP message state
//!
//! A [`TcpMessage`] accumulates the segments of one HTTP message flowing in
//! one direction of a flow. Segments are kept in a seq-keyed ordered map
//! and joined into a contiguous byte run on demand; framing is committed
//! once the head becomes visible and only narrows from there.

use crate::capture::{Direction, TcpPacket};
use crate::proto;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::time::Instant;

/// How the end of the message body is determined
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Head not yet visible
    Unknown,
    /// No body: complete as soon as the head is
    None,
    /// Body runs for exactly this many bytes
    ContentLength(usize),
    /// Body ends with the terminal `0\r\n\r\n` chunk
    Chunked,
    /// Body ends when the peer closes its side (FIN/RST) or at expiry
    CloseTerminated,
}

/// One HTTP message being reassembled from TCP segments
#[derive(Debug)]
pub struct TcpMessage {
    pub direction: Direction,
    /// 24-hex identifier; assigned at creation for requests, inherited at
    /// pairing time for responses
    pub uuid: Vec<u8>,
    /// TCP ack of the first data segment; for responses this equals the
    /// paired request's end-of-message seq
    pub ack: u32,
    /// Capture timestamp of the first segment, nanoseconds
    pub started_at: i64,
    pub last_packet_at: Instant,
    pub headers_seen: bool,
    pub framing: Framing,
    /// Request declared `Expect: 100-continue` and completion is held
    /// until a 1xx is observed or the deadline passes
    pub awaiting_continue: bool,
    /// Content-Length exceeded or head failed to parse
    pub malformed: bool,
    /// Request method is HEAD (responses to it carry no body)
    pub is_head: bool,
    parts: BTreeMap<u32, Bytes>,
    head_len: usize,
}

impl TcpMessage {
    pub fn new(direction: Direction, packet: &TcpPacket) -> Self {
        let mut msg = Self {
            direction,
            uuid: Vec::new(),
            ack: packet.ack,
            started_at: packet.timestamp,
            last_packet_at: Instant::now(),
            headers_seen: false,
            framing: Framing::Unknown,
            awaiting_continue: false,
            malformed: false,
            is_head: false,
            parts: BTreeMap::new(),
            head_len: 0,
        };
        msg.insert(packet);
        msg
    }

    /// Insert a segment; equal-seq retransmissions replace the old bytes
    pub fn insert(&mut self, packet: &TcpPacket) {
        self.last_packet_at = Instant::now();
        if packet.data.is_empty() {
            return;
        }
        self.parts.insert(packet.seq, packet.data.clone());
        if !self.headers_seen {
            self.commit_framing();
        }
    }

    /// Lowest seq seen so far
    pub fn first_seq(&self) -> u32 {
        self.parts.keys().next().copied().unwrap_or(self.ack)
    }

    /// Seq one past the contiguous run, i.e. what a response acking this
    /// whole message will carry
    pub fn next_seq(&self) -> u32 {
        self.first_seq().wrapping_add(self.wire_len() as u32)
    }

    /// Length of the contiguous byte run starting at the lowest seq,
    /// overlapping segments coalesced by range
    pub fn wire_len(&self) -> usize {
        let mut len = 0usize;
        let mut expected = match self.parts.keys().next() {
            Some(&s) => s,
            None => return 0,
        };
        for (&seq, data) in &self.parts {
            if seq == expected {
                len += data.len();
                expected = expected.wrapping_add(data.len() as u32);
            } else if seq_before(seq, expected) {
                // overlap: only the bytes past the known run count
                let overlap = expected.wrapping_sub(seq) as usize;
                if data.len() > overlap {
                    let extra = data.len() - overlap;
                    len += extra;
                    expected = expected.wrapping_add(extra as u32);
                }
            } else {
                break;
            }
        }
        len
    }

    /// Join the contiguous run into one buffer
    pub fn joined(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.wire_len());
        let mut expected = match self.parts.keys().next() {
            Some(&s) => s,
            None => return out,
        };
        for (&seq, data) in &self.parts {
            if seq == expected {
                out.extend_from_slice(data);
                expected = expected.wrapping_add(data.len() as u32);
            } else if seq_before(seq, expected) {
                let overlap = expected.wrapping_sub(seq) as usize;
                if data.len() > overlap {
                    out.extend_from_slice(&data[overlap..]);
                    expected = expected.wrapping_add((data.len() - overlap) as u32);
                }
            } else {
                break;
            }
        }
        out
    }

    /// Commit framing once the contiguous run shows a complete HTTP head
    fn commit_framing(&mut self) {
        let joined = self.joined();
        if !proto::is_http_payload(&joined) {
            return;
        }
        let head_end = match proto::empty_line_offset(&joined) {
            Some(i) => i + 4,
            None => return,
        };

        self.headers_seen = true;
        self.head_len = head_end;
        let head = &joined[..head_end];

        if proto::header(head, b"Expect").map(|v| v.eq_ignore_ascii_case(b"100-continue"))
            == Some(true)
        {
            self.awaiting_continue = true;
        }

        let chunked =
            proto::header(head, b"Transfer-Encoding").map(|v| v == b"chunked") == Some(true);
        let content_length = match proto::header(head, b"Content-Length") {
            Some(v) => match std::str::from_utf8(v).ok().and_then(|s| s.parse::<usize>().ok()) {
                Some(n) => Some(n),
                None => {
                    self.malformed = true;
                    return;
                }
            },
            None => None,
        };

        self.framing = match self.direction {
            Direction::Incoming => {
                self.is_head = proto::method(head) == b"HEAD";
                if chunked {
                    Framing::Chunked
                } else if let Some(n) = content_length {
                    Framing::ContentLength(n)
                } else {
                    Framing::None
                }
            }
            Direction::Outgoing => {
                let status = match proto::status_code(head) {
                    Some(s) => s,
                    None => {
                        self.malformed = true;
                        return;
                    }
                };
                if status == 204 || status == 304 {
                    Framing::None
                } else if chunked {
                    Framing::Chunked
                } else if let Some(n) = content_length {
                    Framing::ContentLength(n)
                } else {
                    Framing::CloseTerminated
                }
            }
        };
    }

    /// Narrow framing to an empty body (responses to HEAD requests)
    pub fn force_empty_body(&mut self) {
        self.framing = Framing::None;
    }

    /// Bytes of body present in the contiguous run
    pub fn body_len(&self) -> usize {
        self.wire_len().saturating_sub(self.head_len)
    }

    /// True when framing says the message has all its bytes.
    ///
    /// Close-terminated messages never complete here; FIN/RST or expiry
    /// finish them. Content-Length overrun marks the message malformed.
    pub fn is_framing_complete(&mut self) -> bool {
        if !self.headers_seen {
            return false;
        }
        match self.framing {
            Framing::Unknown | Framing::CloseTerminated => false,
            Framing::None => true,
            Framing::ContentLength(n) => {
                if self.body_len() > n {
                    self.malformed = true;
                    false
                } else {
                    self.body_len() == n
                }
            }
            Framing::Chunked => proto::chunked_finished(&self.joined()),
        }
    }

    /// Wire bytes to emit; the `Expect` header is stripped from requests
    /// that were held for a 100-continue
    pub fn emit_bytes(&self) -> Vec<u8> {
        let joined = self.joined();
        if self.awaiting_continue {
            proto::delete_header(&joined, b"Expect")
        } else {
            joined
        }
    }
}

/// Wrapping less-than over TCP sequence space
pub fn seq_before(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}
