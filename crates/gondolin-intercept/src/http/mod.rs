#![forbid(unsafe_code)]

//! HTTP/1.x request and response head parsing and emission.
//!
//! Header casing and order are preserved end to end; lookups are
//! case-insensitive. Bodies are framed by `Content-Length` or chunked
//! transfer coding; responses may additionally be close-delimited.

mod parser;

pub use parser::{
    decode_chunk_size, HttpRequestHead, HttpResponseHead, HttpVersion, ParseOutcome,
};

/// How a message body is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyMode {
    None,
    ContentLength(u64),
    Chunked,
    /// Responses only: body runs until the peer closes.
    CloseDelimited,
}

/// Emit a request head in origin-form, headers in their stored order.
pub fn write_request_head(method: &str, target: &str, headers: &[(String, String)]) -> Vec<u8> {
    let mut out = Vec::with_capacity(64 + headers.len() * 32);
    out.extend_from_slice(method.as_bytes());
    out.push(b' ');
    out.extend_from_slice(target.as_bytes());
    out.extend_from_slice(b" HTTP/1.1\r\n");
    for (name, value) in headers {
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out
}

/// Emit a response head, headers in their stored order.
pub fn write_response_head(status: u16, reason: &str, headers: &[(String, String)]) -> Vec<u8> {
    let mut out = Vec::with_capacity(64 + headers.len() * 32);
    out.extend_from_slice(format!("HTTP/1.1 {status} {reason}\r\n").as_bytes());
    for (name, value) in headers {
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out
}

/// A complete synthetic response (used for 502s). Always carries a
/// `Content-Length` so the keep-alive connection stays usable.
pub fn synthetic_response(status: u16, reason: &str, body: &str) -> Vec<u8> {
    let mut out = write_response_head(
        status,
        reason,
        &[
            ("Content-Type".to_string(), "text/plain".to_string()),
            ("Content-Length".to_string(), body.len().to_string()),
        ],
    );
    out.extend_from_slice(body.as_bytes());
    out
}

pub fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}
