#![forbid(unsafe_code)]

use super::BodyMode;
use crate::InterceptError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVersion {
    Http10,
    Http11,
}

/// Result of a head parse over a growing buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum ParseOutcome<T> {
    /// Head not complete yet; read more bytes.
    Incomplete,
    /// Parsed head plus the byte length it occupied in the buffer.
    Done(T, usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequestHead {
    pub method: String,
    pub target: String,
    pub version: HttpVersion,
    pub headers: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponseHead {
    pub status: u16,
    pub reason: String,
    pub version: HttpVersion,
    pub headers: Vec<(String, String)>,
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

fn parse_headers(lines: std::str::Split<'_, &str>) -> Result<Vec<(String, String)>, InterceptError> {
    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            return Err(InterceptError::BadRequest("obsolete header folding"));
        }
        let (name, value) = line
            .split_once(':')
            .ok_or(InterceptError::BadRequest("header without colon"))?;
        if name.is_empty() || name.contains(' ') {
            return Err(InterceptError::BadRequest("invalid header name"));
        }
        headers.push((name.to_string(), value.trim().to_string()));
    }
    Ok(headers)
}

fn body_mode_from_headers(
    headers: &[(String, String)],
    is_request: bool,
) -> Result<BodyMode, InterceptError> {
    let transfer_encoding = super::header_value(headers, "Transfer-Encoding");
    let content_length = super::header_value(headers, "Content-Length");

    if let Some(te) = transfer_encoding {
        // Reject smuggling-prone combinations outright.
        if content_length.is_some() {
            return Err(InterceptError::BadRequest(
                "both Transfer-Encoding and Content-Length",
            ));
        }
        let chunked_last = te
            .split(',')
            .map(str::trim)
            .last()
            .is_some_and(|t| t.eq_ignore_ascii_case("chunked"));
        if !chunked_last {
            return Err(InterceptError::BadRequest("unsupported transfer coding"));
        }
        return Ok(BodyMode::Chunked);
    }

    if let Some(len) = content_length {
        let len: u64 = len
            .trim()
            .parse()
            .map_err(|_| InterceptError::BadRequest("invalid Content-Length"))?;
        return Ok(if len == 0 {
            BodyMode::None
        } else {
            BodyMode::ContentLength(len)
        });
    }

    Ok(if is_request {
        BodyMode::None
    } else {
        BodyMode::CloseDelimited
    })
}

fn parse_version(token: &str) -> Result<HttpVersion, InterceptError> {
    match token {
        "HTTP/1.1" => Ok(HttpVersion::Http11),
        "HTTP/1.0" => Ok(HttpVersion::Http10),
        _ => Err(InterceptError::BadRequest("unsupported HTTP version")),
    }
}

impl HttpRequestHead {
    /// Parse from the front of `buf`.
    pub fn parse(buf: &[u8]) -> Result<ParseOutcome<Self>, InterceptError> {
        let Some(head_len) = find_head_end(buf) else {
            return Ok(ParseOutcome::Incomplete);
        };
        let head = std::str::from_utf8(&buf[..head_len - 4])
            .map_err(|_| InterceptError::BadRequest("head is not UTF-8"))?;
        let mut lines = head.split("\r\n");
        let request_line = lines
            .next()
            .ok_or(InterceptError::BadRequest("missing request line"))?;
        let mut parts = request_line.split(' ');
        let method = parts
            .next()
            .filter(|m| !m.is_empty() && m.chars().all(|c| c.is_ascii_uppercase()))
            .ok_or(InterceptError::BadRequest("invalid method"))?;
        let target = parts
            .next()
            .filter(|t| !t.is_empty())
            .ok_or(InterceptError::BadRequest("missing request target"))?;
        let version = parse_version(
            parts
                .next()
                .ok_or(InterceptError::BadRequest("missing HTTP version"))?,
        )?;
        if parts.next().is_some() {
            return Err(InterceptError::BadRequest("malformed request line"));
        }

        Ok(ParseOutcome::Done(
            Self {
                method: method.to_string(),
                target: target.to_string(),
                version,
                headers: parse_headers(lines)?,
            },
            head_len,
        ))
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        super::header_value(&self.headers, name)
    }

    pub fn body_mode(&self) -> Result<BodyMode, InterceptError> {
        body_mode_from_headers(&self.headers, true)
    }

    /// Keep-alive semantics: HTTP/1.1 defaults on, 1.0 defaults off.
    pub fn keep_alive(&self) -> bool {
        let connection = self.header("Connection").unwrap_or("");
        let close = connection
            .split(',')
            .any(|t| t.trim().eq_ignore_ascii_case("close"));
        let keep = connection
            .split(',')
            .any(|t| t.trim().eq_ignore_ascii_case("keep-alive"));
        match self.version {
            HttpVersion::Http11 => !close,
            HttpVersion::Http10 => keep,
        }
    }
}

impl HttpResponseHead {
    pub fn parse(buf: &[u8]) -> Result<ParseOutcome<Self>, InterceptError> {
        let Some(head_len) = find_head_end(buf) else {
            return Ok(ParseOutcome::Incomplete);
        };
        let head = std::str::from_utf8(&buf[..head_len - 4])
            .map_err(|_| InterceptError::BadRequest("head is not UTF-8"))?;
        let mut lines = head.split("\r\n");
        let status_line = lines
            .next()
            .ok_or(InterceptError::BadRequest("missing status line"))?;
        let mut parts = status_line.splitn(3, ' ');
        let version = parse_version(
            parts
                .next()
                .ok_or(InterceptError::BadRequest("missing HTTP version"))?,
        )?;
        let status: u16 = parts
            .next()
            .and_then(|s| s.parse().ok())
            .filter(|s| (100..=599).contains(s))
            .ok_or(InterceptError::BadRequest("invalid status code"))?;
        let reason = parts.next().unwrap_or("").to_string();

        Ok(ParseOutcome::Done(
            Self {
                status,
                reason,
                version,
                headers: parse_headers(lines)?,
            },
            head_len,
        ))
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        super::header_value(&self.headers, name)
    }

    /// Response body framing depends on the request method and status.
    pub fn body_mode(&self, request_method: &str) -> Result<BodyMode, InterceptError> {
        if request_method.eq_ignore_ascii_case("HEAD")
            || self.status / 100 == 1
            || self.status == 204
            || self.status == 304
        {
            return Ok(BodyMode::None);
        }
        body_mode_from_headers(&self.headers, false)
    }

    pub fn keep_alive(&self) -> bool {
        let connection = self.header("Connection").unwrap_or("");
        let close = connection
            .split(',')
            .any(|t| t.trim().eq_ignore_ascii_case("close"));
        match self.version {
            HttpVersion::Http11 => !close,
            HttpVersion::Http10 => connection
                .split(',')
                .any(|t| t.trim().eq_ignore_ascii_case("keep-alive")),
        }
    }
}

/// Parse one chunk-size line (hex size, optional extensions). Returns the
/// size and the line length including CRLF, or `None` when incomplete.
pub fn decode_chunk_size(buf: &[u8]) -> Result<Option<(u64, usize)>, InterceptError> {
    let Some(line_end) = buf.windows(2).position(|w| w == b"\r\n") else {
        if buf.len() > 1024 {
            return Err(InterceptError::BadRequest("chunk size line too long"));
        }
        return Ok(None);
    };
    let line = std::str::from_utf8(&buf[..line_end])
        .map_err(|_| InterceptError::BadRequest("chunk size not UTF-8"))?;
    let size_part = line.split(';').next().unwrap_or("").trim();
    let size = u64::from_str_radix(size_part, 16)
        .map_err(|_| InterceptError::BadRequest("invalid chunk size"))?;
    Ok(Some((size, line_end + 2)))
}
