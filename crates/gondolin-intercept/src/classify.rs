#![forbid(unsafe_code)]

//! First-bytes flow classification.
//!
//! Peeks at the start of a new TCP stream without consuming it and decides
//! plaintext HTTP vs TLS vs neither. The verdict is sticky for the flow's
//! lifetime. TLS wins any hypothetical tie: 0x16 is not an ASCII method
//! byte, so in practice the grammars are disjoint.

/// Bytes of prefix we are willing to inspect before giving up.
pub const CLASSIFY_MAX_PEEK: usize = 16 * 1024;

const HTTP_METHODS: &[&str] = &[
    "GET", "HEAD", "POST", "PUT", "DELETE", "OPTIONS", "PATCH", "TRACE", "CONNECT",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Not decidable yet; feed more bytes (up to [`CLASSIFY_MAX_PEEK`]).
    NeedMoreData,
    /// A TLS ClientHello record.
    Tls,
    /// An HTTP/1.x request line.
    PlaintextHttp,
    /// Neither; the flow gets reset.
    Other,
}

pub fn classify(prefix: &[u8]) -> Classification {
    if prefix.is_empty() {
        return Classification::NeedMoreData;
    }

    if prefix[0] == 0x16 {
        return classify_tls(prefix);
    }

    classify_http(prefix)
}

fn classify_tls(prefix: &[u8]) -> Classification {
    if prefix.len() < 6 {
        return Classification::NeedMoreData;
    }
    // Record header: content-type 0x16, legacy version 0x03 0x01..0x04,
    // then a handshake message that must be a ClientHello (type 1).
    if prefix[1] != 0x03 || prefix[2] > 0x04 {
        return Classification::Other;
    }
    if prefix[5] != 0x01 {
        return Classification::Other;
    }
    Classification::Tls
}

fn classify_http(prefix: &[u8]) -> Classification {
    // Match against method tokens; a strict prefix of one means we need
    // more bytes (e.g. "GE" so far).
    let upto_space = match prefix.iter().position(|&b| b == b' ') {
        Some(pos) => &prefix[..pos],
        None => {
            if prefix.len() >= CLASSIFY_MAX_PEEK
                || prefix.len() > HTTP_METHODS.iter().map(|m| m.len()).max().unwrap_or(0)
            {
                return Classification::Other;
            }
            return match std::str::from_utf8(prefix) {
                Ok(s) if HTTP_METHODS.iter().any(|m| m.starts_with(s)) => {
                    Classification::NeedMoreData
                }
                _ => Classification::Other,
            };
        }
    };

    match std::str::from_utf8(upto_space) {
        Ok(method) if HTTP_METHODS.contains(&method) => Classification::PlaintextHttp,
        _ => Classification::Other,
    }
}
