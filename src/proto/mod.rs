//! Framing-aware HTTP/1.1 byte utilities
//!
//! Everything here operates on a byte buffer holding an HTTP message in
//! wire form and works by header scanning, never full parsing. Header
//! names are matched case-insensitively. Editing functions return a new
//! buffer; `Content-Length` is never updated automatically, so callers
//! adjust it when they change the body.

use flate2::read::GzDecoder;
use std::io::Read;

/// CRLF CRLF boundary between head and body
pub const EMPTY_LINE: &[u8] = b"\r\n\r\n";

/// Terminal chunk of a chunked body
pub const CHUNKED_SUFFIX: &[u8] = b"0\r\n\r\n";

const HTTP_PREFIXES: [&[u8; 4]; 10] = [
    b"GET ", b"POST", b"PUT ", b"DELE", b"HEAD", b"OPTI", b"PATC", b"TRAC", b"CONN", b"HTTP",
];

/// Find `needle` in `haystack`
fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Offset of the `\r\n\r\n` head/body boundary, if present
pub fn empty_line_offset(buf: &[u8]) -> Option<usize> {
    find(buf, EMPTY_LINE)
}

/// Offset of the first body byte, if the head is complete
pub fn body_start(buf: &[u8]) -> Option<usize> {
    empty_line_offset(buf).map(|i| i + EMPTY_LINE.len())
}

/// The message body (empty until the head is complete)
pub fn body(buf: &[u8]) -> &[u8] {
    match body_start(buf) {
        Some(i) => &buf[i..],
        None => &[],
    }
}

/// True when the first four bytes look like an HTTP request or response
pub fn is_http_payload(buf: &[u8]) -> bool {
    if buf.len() < 4 {
        return false;
    }
    HTTP_PREFIXES.iter().any(|p| &buf[..4] == *p)
}

/// True when the buffer ends with the terminal chunk of a chunked body
pub fn chunked_finished(buf: &[u8]) -> bool {
    buf.ends_with(CHUNKED_SUFFIX)
}

fn first_line(buf: &[u8]) -> &[u8] {
    match find(buf, b"\r\n") {
        Some(i) => &buf[..i],
        None => buf,
    }
}

/// Request method (first token of the request line)
pub fn method(buf: &[u8]) -> &[u8] {
    let line = first_line(buf);
    match line.iter().position(|&b| b == b' ') {
        Some(i) => &line[..i],
        None => line,
    }
}

/// Request path (second token of the request line)
pub fn path(buf: &[u8]) -> &[u8] {
    let line = first_line(buf);
    let start = match line.iter().position(|&b| b == b' ') {
        Some(i) => i + 1,
        None => return &[],
    };
    let rest = &line[start..];
    match rest.iter().position(|&b| b == b' ') {
        Some(i) => &rest[..i],
        None => rest,
    }
}

/// Response status as raw digits (second token of the status line)
pub fn status(buf: &[u8]) -> &[u8] {
    if !buf.starts_with(b"HTTP") {
        return &[];
    }
    path(buf)
}

/// Response status parsed as a number
pub fn status_code(buf: &[u8]) -> Option<u16> {
    std::str::from_utf8(status(buf)).ok()?.parse().ok()
}

/// Byte range of one header line: (line_start, value_start, value_end,
/// line_end past the trailing CRLF)
fn header_span(buf: &[u8], name: &[u8]) -> Option<(usize, usize, usize, usize)> {
    let head_end = empty_line_offset(buf).unwrap_or(buf.len());
    let scan_end = (head_end + 2).min(buf.len());
    let mut pos = find(buf, b"\r\n")? + 2;

    while pos < head_end {
        let line_end = match find(&buf[pos..scan_end], b"\r\n") {
            Some(i) => pos + i,
            None => head_end,
        };
        let line = &buf[pos..line_end];
        if let Some(colon) = line.iter().position(|&b| b == b':') {
            if line[..colon].eq_ignore_ascii_case(name) {
                let mut value_start = pos + colon + 1;
                while value_start < line_end && buf[value_start] == b' ' {
                    value_start += 1;
                }
                return Some((pos, value_start, line_end, line_end + 2));
            }
        }
        pos = line_end + 2;
    }

    None
}

/// Value of a header, matched case-insensitively
pub fn header<'a>(buf: &'a [u8], name: &[u8]) -> Option<&'a [u8]> {
    header_span(buf, name).map(|(_, vs, ve, _)| &buf[vs..ve])
}

/// Set a header value, inserting the header after the start line when it
/// is not present
pub fn set_header(buf: &[u8], name: &[u8], value: &[u8]) -> Vec<u8> {
    if let Some((_, vs, ve, _)) = header_span(buf, name) {
        let mut out = Vec::with_capacity(buf.len() - (ve - vs) + value.len());
        out.extend_from_slice(&buf[..vs]);
        out.extend_from_slice(value);
        out.extend_from_slice(&buf[ve..]);
        return out;
    }

    let insert_at = match find(buf, b"\r\n") {
        Some(i) => i + 2,
        None => return buf.to_vec(),
    };
    let mut out = Vec::with_capacity(buf.len() + name.len() + value.len() + 4);
    out.extend_from_slice(&buf[..insert_at]);
    out.extend_from_slice(name);
    out.extend_from_slice(b": ");
    out.extend_from_slice(value);
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(&buf[insert_at..]);
    out
}

/// Remove a header line entirely
pub fn delete_header(buf: &[u8], name: &[u8]) -> Vec<u8> {
    match header_span(buf, name) {
        Some((ls, _, _, le)) => {
            let mut out = Vec::with_capacity(buf.len() - (le - ls));
            out.extend_from_slice(&buf[..ls]);
            out.extend_from_slice(&buf[le..]);
            out
        }
        None => buf.to_vec(),
    }
}

/// Replace the request path
pub fn set_path(buf: &[u8], new_path: &[u8]) -> Vec<u8> {
    let old = path(buf);
    if old.is_empty() {
        return buf.to_vec();
    }
    let start = old.as_ptr() as usize - buf.as_ptr() as usize;
    let mut out = Vec::with_capacity(buf.len() - old.len() + new_path.len());
    out.extend_from_slice(&buf[..start]);
    out.extend_from_slice(new_path);
    out.extend_from_slice(&buf[start + old.len()..]);
    out
}

/// Point the request at a new host. Absolute-URL request paths (HTTP/1.0
/// and proxied traffic) get their authority swapped; a path that still
/// carries `old` has it replaced; the `Host` header is always set.
pub fn set_host(buf: &[u8], old: &[u8], new: &[u8]) -> Vec<u8> {
    let p = path(buf);
    let rewritten = if p.starts_with(b"http://") || p.starts_with(b"https://") {
        let scheme_end = match find(p, b"://") {
            Some(i) => i + 3,
            None => 0,
        };
        let authority_end = p[scheme_end..]
            .iter()
            .position(|&b| b == b'/')
            .map(|i| scheme_end + i)
            .unwrap_or(p.len());
        let mut new_path = Vec::with_capacity(p.len());
        new_path.extend_from_slice(&p[..scheme_end]);
        new_path.extend_from_slice(new);
        new_path.extend_from_slice(&p[authority_end..]);
        set_path(buf, &new_path)
    } else if !old.is_empty() && p.starts_with(old) {
        let mut new_path = Vec::with_capacity(p.len());
        new_path.extend_from_slice(new);
        new_path.extend_from_slice(&p[old.len()..]);
        set_path(buf, &new_path)
    } else {
        buf.to_vec()
    };

    set_header(&rewritten, b"Host", new)
}

/// Value of a query-string parameter in the request path
pub fn path_param<'a>(buf: &'a [u8], name: &[u8]) -> Option<&'a [u8]> {
    let p = path(buf);
    let query_start = p.iter().position(|&b| b == b'?')? + 1;
    let query = &p[query_start..];

    for pair in query.split(|&b| b == b'&') {
        let eq = pair.iter().position(|&b| b == b'=');
        let (key, value) = match eq {
            Some(i) => (&pair[..i], &pair[i + 1..]),
            None => (pair, &[] as &[u8]),
        };
        if key == name {
            return Some(value);
        }
    }
    None
}

/// Set a query-string parameter, overwriting an existing value
pub fn set_path_param(buf: &[u8], name: &[u8], value: &[u8]) -> Vec<u8> {
    let p = path(buf).to_vec();
    let mut new_path = Vec::with_capacity(p.len() + name.len() + value.len() + 2);

    match path_param(buf, name) {
        Some(old) => {
            let start = old.as_ptr() as usize - path(buf).as_ptr() as usize;
            new_path.extend_from_slice(&p[..start]);
            new_path.extend_from_slice(value);
            new_path.extend_from_slice(&p[start + old.len()..]);
        }
        None => {
            new_path.extend_from_slice(&p);
            new_path.push(if p.contains(&b'?') { b'&' } else { b'?' });
            new_path.extend_from_slice(name);
            new_path.push(b'=');
            new_path.extend_from_slice(value);
        }
    }

    set_path(buf, &new_path)
}

/// Decode a chunked transfer encoding into the plain body bytes.
///
/// Returns `None` when the framing is malformed or incomplete.
fn dechunk(mut body: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(body.len());
    loop {
        let line_end = find(body, b"\r\n")?;
        let size_str = std::str::from_utf8(&body[..line_end]).ok()?;
        // chunk extensions after ';' are ignored
        let size_str = size_str.split(';').next().unwrap_or(size_str).trim();
        let size = usize::from_str_radix(size_str, 16).ok()?;

        body = &body[line_end + 2..];
        if size == 0 {
            return Some(out);
        }
        if body.len() < size + 2 {
            return None;
        }
        out.extend_from_slice(&body[..size]);
        body = &body[size + 2..];
    }
}

/// Inflate gzip bodies and decode chunked framing for human inspection.
///
/// Returns `None` when the message cannot be decoded; callers skip such
/// payloads. `Content-Length` is rewritten here because the body changes.
pub fn prettify_http(buf: &[u8]) -> Option<Vec<u8>> {
    let mut message = buf.to_vec();

    if header(&message, b"Transfer-Encoding").map(|v| v == b"chunked") == Some(true) {
        let plain = dechunk(body(&message))?;
        let head_end = body_start(&message)?;
        let mut rebuilt = message[..head_end].to_vec();
        rebuilt.extend_from_slice(&plain);
        rebuilt = delete_header(&rebuilt, b"Transfer-Encoding");
        message = set_header(&rebuilt, b"Content-Length", plain.len().to_string().as_bytes());
    }

    if header(&message, b"Content-Encoding").map(|v| v == b"gzip") == Some(true) {
        let mut plain = Vec::new();
        GzDecoder::new(body(&message)).read_to_end(&mut plain).ok()?;
        let head_end = body_start(&message)?;
        let mut rebuilt = message[..head_end].to_vec();
        rebuilt.extend_from_slice(&plain);
        rebuilt = delete_header(&rebuilt, b"Content-Encoding");
        message = set_header(&rebuilt, b"Content-Length", plain.len().to_string().as_bytes());
    }

    Some(message)
}
