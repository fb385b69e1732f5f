//! Payload envelope encoding and decoding
//!
//! Every payload flowing through the pipeline is an opaque byte buffer that
//! begins with a single ASCII header line:
//!
//! ```text
//! <kind> <uuid> <nanos> <extra>\n
//! ```
//!
//! `kind` is `1` (request), `2` (response) or `3` (replayed response).
//! `uuid` is 24 lowercase hex characters shared by a request and its
//! responses. `nanos` is the capture wall-clock in nanoseconds. `extra`
//! carries the round-trip time for responses and is `-1` for requests.
//! The raw HTTP message follows the newline. Streams and files delimit
//! payloads with [`PAYLOAD_SEPARATOR`], a byte sequence that cannot occur
//! inside an HTTP message.

use bytes::Bytes;
use std::sync::atomic::{AtomicI64, Ordering};

/// Separator between payloads in files and TCP streams (18 bytes)
pub const PAYLOAD_SEPARATOR: &[u8] = "\n\u{1F435}\u{1F648}\u{1F649}\u{1F64A}\n".as_bytes();

/// The all-zero UUID used for responses emitted without a matched request
pub const ZERO_UUID: &[u8; 24] = b"000000000000000000000000";

/// Kind tag carried in the envelope's first field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Request,
    Response,
    ReplayedResponse,
}

impl PayloadKind {
    /// Wire representation of the kind
    pub fn as_byte(self) -> u8 {
        match self {
            PayloadKind::Request => b'1',
            PayloadKind::Response => b'2',
            PayloadKind::ReplayedResponse => b'3',
        }
    }

    /// Parse the wire representation
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            b'1' => Some(PayloadKind::Request),
            b'2' => Some(PayloadKind::Response),
            b'3' => Some(PayloadKind::ReplayedResponse),
            _ => None,
        }
    }
}

/// Parsed view of a payload's envelope line
#[derive(Debug, Clone, Copy)]
pub struct PayloadMeta<'a> {
    pub kind: PayloadKind,
    pub uuid: &'a [u8],
    pub nanos: i64,
    pub extra: i64,
    pub body: &'a [u8],
}

impl<'a> PayloadMeta<'a> {
    /// Parse the envelope header of `buf`.
    ///
    /// Returns `None` for malformed records: a missing header line, an
    /// unknown kind tag, or fewer than three fields. A missing fourth
    /// field defaults `extra` to `-1`.
    pub fn parse(buf: &'a [u8]) -> Option<Self> {
        let line_end = buf.iter().position(|&b| b == b'\n')?;
        let mut header = &buf[..line_end];
        if header.ends_with(b"\r") {
            header = &header[..header.len() - 1];
        }
        let mut fields = header.split(|&b| b == b' ').filter(|f| !f.is_empty());

        let kind_field = fields.next()?;
        if kind_field.len() != 1 {
            return None;
        }
        let kind = PayloadKind::from_byte(kind_field[0])?;
        let uuid = fields.next()?;
        let nanos = parse_i64(fields.next()?)?;
        let extra = match fields.next() {
            Some(f) => parse_i64(f)?,
            None => -1,
        };

        Some(Self {
            kind,
            uuid,
            nanos,
            extra,
            body: &buf[line_end + 1..],
        })
    }
}

fn parse_i64(field: &[u8]) -> Option<i64> {
    std::str::from_utf8(field).ok()?.parse().ok()
}

/// Encode an envelope line followed by the raw message bytes
pub fn encode(kind: PayloadKind, uuid: &[u8], nanos: i64, extra: i64, body: &[u8]) -> Bytes {
    let mut out = Vec::with_capacity(uuid.len() + body.len() + 32);
    out.push(kind.as_byte());
    out.push(b' ');
    out.extend_from_slice(uuid);
    out.push(b' ');
    out.extend_from_slice(nanos.to_string().as_bytes());
    out.push(b' ');
    out.extend_from_slice(extra.to_string().as_bytes());
    out.push(b'\n');
    out.extend_from_slice(body);
    Bytes::from(out)
}

/// Inspect only the first token of a payload
pub fn classify(buf: &[u8]) -> Option<PayloadKind> {
    if buf.len() < 2 || buf[1] != b' ' {
        return None;
    }
    PayloadKind::from_byte(buf[0])
}

/// True when the payload is a captured request
pub fn is_request(buf: &[u8]) -> bool {
    classify(buf) == Some(PayloadKind::Request)
}

/// True when the payload came off the wire (request or original response),
/// as opposed to a replayed response
pub fn is_origin(buf: &[u8]) -> bool {
    matches!(
        classify(buf),
        Some(PayloadKind::Request) | Some(PayloadKind::Response)
    )
}

static LAST_NANO_FRAGMENT: AtomicI64 = AtomicI64::new(0);

/// Generate a 24-hex-character payload UUID.
///
/// Twelve raw bytes are hex-encoded: a monotonically increasing 4-byte
/// nanosecond fragment followed by 8 random bytes, so lexicographically
/// sorted UUIDs approximate temporal order.
pub fn uuid() -> Vec<u8> {
    let nanos = chrono::Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or_default();
    let fragment = LAST_NANO_FRAGMENT
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
            Some(if nanos > last { nanos } else { last + 1 })
        })
        .map(|last| if nanos > last { nanos } else { last + 1 })
        .unwrap_or(nanos);

    let mut raw = [0u8; 12];
    raw[..4].copy_from_slice(&(fragment as u32).to_be_bytes());
    rand::Rng::fill(&mut rand::thread_rng(), &mut raw[4..12]);
    hex_encode(&raw)
}

/// FNV-1a 32-bit hash, used for sticky worker selection and hash limiters
pub fn fnv1a32(data: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c9dc5;
    for &b in data {
        hash ^= b as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

fn hex_encode(raw: &[u8]) -> Vec<u8> {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = Vec::with_capacity(raw.len() * 2);
    for &b in raw {
        out.push(HEX[(b >> 4) as usize]);
        out.push(HEX[(b & 0x0f) as usize]);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_separator_is_eighteen_bytes() {
        assert_eq!(PAYLOAD_SEPARATOR.len(), 18);
        assert_eq!(PAYLOAD_SEPARATOR[0], b'\n');
        assert_eq!(PAYLOAD_SEPARATOR[17], b'\n');
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let id = uuid();
        let payload = encode(PayloadKind::Request, &id, 1234567890, -1, b"GET / HTTP/1.1\r\n\r\n");
        let meta = PayloadMeta::parse(&payload).unwrap();

        assert_eq!(meta.kind, PayloadKind::Request);
        assert_eq!(meta.uuid, &id[..]);
        assert_eq!(meta.nanos, 1234567890);
        assert_eq!(meta.extra, -1);
        assert_eq!(meta.body, b"GET / HTTP/1.1\r\n\r\n");
    }

    #[test]
    fn test_parse_three_field_header() {
        let meta = PayloadMeta::parse(b"2 abc 42\nHTTP/1.1 200 OK\r\n\r\n").unwrap();
        assert_eq!(meta.kind, PayloadKind::Response);
        assert_eq!(meta.uuid, b"abc");
        assert_eq!(meta.nanos, 42);
        assert_eq!(meta.extra, -1);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(PayloadMeta::parse(b"").is_none());
        assert!(PayloadMeta::parse(b"no newline").is_none());
        assert!(PayloadMeta::parse(b"9 abc 42\nbody").is_none());
        assert!(PayloadMeta::parse(b"1 abc\nbody").is_none());
        assert!(PayloadMeta::parse(b"1 abc notanumber\nbody").is_none());
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify(b"1 abc 1 -1\n"), Some(PayloadKind::Request));
        assert_eq!(classify(b"2 abc 1 5\n"), Some(PayloadKind::Response));
        assert_eq!(classify(b"3 abc 1 5\n"), Some(PayloadKind::ReplayedResponse));
        assert_eq!(classify(b"GET / HTTP/1.1"), None);
        assert_eq!(classify(b""), None);
    }

    #[test]
    fn test_origin_and_request_predicates() {
        assert!(is_request(b"1 abc 1 -1\nbody"));
        assert!(!is_request(b"2 abc 1 5\nbody"));
        assert!(is_origin(b"2 abc 1 5\nbody"));
        assert!(!is_origin(b"3 abc 1 5\nbody"));
    }

    #[test]
    fn test_uuid_shape_and_uniqueness() {
        let a = uuid();
        let b = uuid();
        assert_eq!(a.len(), 24);
        assert_eq!(b.len(), 24);
        assert!(a.iter().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_uuid_time_prefix_approximates_order() {
        let ids: Vec<Vec<u8>> = (0..100).map(|_| uuid()).collect();
        // The 4-byte fragment wraps every ~4.3s, so allow at most one
        // inversion across a fast generation loop
        let inversions = ids.windows(2).filter(|p| p[0][..8] > p[1][..8]).count();
        assert!(inversions <= 1, "sorted UUIDs should approximate temporal order");
    }

    #[test]
    fn test_fnv1a32_vectors() {
        // Reference values for the 32-bit FNV-1a function
        assert_eq!(fnv1a32(b""), 0x811c9dc5);
        assert_eq!(fnv1a32(b"a"), 0xe40c292c);
        assert_eq!(fnv1a32(b"foobar"), 0xbf9cf968);
    }
}
