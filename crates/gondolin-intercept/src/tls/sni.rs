#![forbid(unsafe_code)]

//! ClientHello parsing, just deep enough to pull out the SNI host name
//! (RFC 6066 section 3). Handles TLS 1.2 and 1.3 hellos, including a
//! handshake message fragmented over several records, since the bytes
//! arrive from a reassembled TCP stream of arbitrary segmentation.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHello {
    pub sni: Option<String>,
    /// Total stream bytes the hello occupied (records included); callers
    /// replay exactly this prefix to the TLS engine.
    pub wire_len: usize,
}

/// Parse the start of a TLS stream. Returns `Ok(None)` when more bytes
/// are needed, `Err` when the bytes cannot be a ClientHello.
pub fn extract_client_hello(stream: &[u8]) -> Result<Option<ClientHello>, &'static str> {
    // Collect handshake-protocol bytes out of consecutive handshake
    // records until the full ClientHello message is present.
    let mut handshake: Vec<u8> = Vec::new();
    let mut offset = 0usize;
    let needed_msg_len = loop {
        if handshake.len() >= 4 {
            if handshake[0] != 0x01 {
                return Err("not a ClientHello");
            }
            let len = u32::from_be_bytes([0, handshake[1], handshake[2], handshake[3]]) as usize;
            if handshake.len() >= 4 + len {
                break len;
            }
        }
        if stream.len() < offset + 5 {
            return Ok(None);
        }
        let header = &stream[offset..offset + 5];
        if header[0] != 0x16 || header[1] != 0x03 {
            return Err("not a TLS handshake record");
        }
        let record_len = u16::from_be_bytes([header[3], header[4]]) as usize;
        if record_len == 0 || record_len > 1 << 14 {
            return Err("invalid record length");
        }
        if stream.len() < offset + 5 + record_len {
            return Ok(None);
        }
        handshake.extend_from_slice(&stream[offset + 5..offset + 5 + record_len]);
        offset += 5 + record_len;
    };

    let body = &handshake[4..4 + needed_msg_len];
    let sni = parse_hello_body(body)?;
    Ok(Some(ClientHello {
        sni,
        wire_len: offset,
    }))
}

fn parse_hello_body(body: &[u8]) -> Result<Option<String>, &'static str> {
    let mut cur = Cursor { buf: body, pos: 0 };

    let _client_version = cur.take(2)?;
    let _random = cur.take(32)?;
    let session_id_len = cur.take(1)?[0] as usize;
    cur.take(session_id_len)?;
    let cipher_len = cur.take_u16()? as usize;
    if cipher_len == 0 || cipher_len % 2 != 0 {
        return Err("bad cipher_suites length");
    }
    cur.take(cipher_len)?;
    let compression_len = cur.take(1)?[0] as usize;
    cur.take(compression_len)?;

    if cur.remaining() == 0 {
        // Legal: a hello without extensions has no SNI.
        return Ok(None);
    }

    let ext_total = cur.take_u16()? as usize;
    if ext_total != cur.remaining() {
        return Err("bad extensions length");
    }
    while cur.remaining() >= 4 {
        let ext_type = cur.take_u16()?;
        let ext_len = cur.take_u16()? as usize;
        let ext = cur.take(ext_len)?;
        if ext_type == 0 {
            return parse_server_name_extension(ext).map(Some);
        }
    }
    Ok(None)
}

fn parse_server_name_extension(ext: &[u8]) -> Result<String, &'static str> {
    let mut cur = Cursor { buf: ext, pos: 0 };
    let list_len = cur.take_u16()? as usize;
    if list_len != cur.remaining() {
        return Err("bad server_name list length");
    }
    while cur.remaining() >= 3 {
        let name_type = cur.take(1)?[0];
        let name_len = cur.take_u16()? as usize;
        let name = cur.take(name_len)?;
        if name_type == 0 {
            let host = std::str::from_utf8(name).map_err(|_| "server_name not UTF-8")?;
            if host.is_empty() || host.len() > 255 {
                return Err("server_name length out of range");
            }
            return Ok(host.trim_end_matches('.').to_ascii_lowercase());
        }
    }
    Err("no host_name entry in server_name")
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], &'static str> {
        if self.remaining() < n {
            return Err("truncated ClientHello");
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn take_u16(&mut self) -> Result<u16, &'static str> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    /// Hand-assemble a minimal ClientHello with the given SNI.
    fn build_hello(sni: Option<&str>) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&[0x03, 0x03]); // client_version
        body.extend_from_slice(&[0u8; 32]); // random
        body.push(0); // session_id
        body.extend_from_slice(&2u16.to_be_bytes()); // cipher_suites len
        body.extend_from_slice(&[0x13, 0x01]); // TLS_AES_128_GCM_SHA256
        body.push(1); // compression_methods len
        body.push(0); // null

        let mut exts = Vec::new();
        if let Some(host) = sni {
            let mut names = Vec::new();
            names.push(0u8); // host_name
            names.extend_from_slice(&(host.len() as u16).to_be_bytes());
            names.extend_from_slice(host.as_bytes());
            let mut ext = Vec::new();
            ext.extend_from_slice(&(names.len() as u16).to_be_bytes());
            ext.extend_from_slice(&names);
            exts.extend_from_slice(&0u16.to_be_bytes()); // type: server_name
            exts.extend_from_slice(&(ext.len() as u16).to_be_bytes());
            exts.extend_from_slice(&ext);
        }
        body.extend_from_slice(&(exts.len() as u16).to_be_bytes());
        body.extend_from_slice(&exts);

        let mut handshake = vec![0x01];
        handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
        handshake.extend_from_slice(&body);

        let mut record = vec![0x16, 0x03, 0x01];
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    #[test]
    fn extracts_sni_from_single_record() {
        let wire = build_hello(Some("API.Example.COM"));
        let hello = extract_client_hello(&wire).unwrap().unwrap();
        assert_eq!(hello.sni.as_deref(), Some("api.example.com"));
        assert_eq!(hello.wire_len, wire.len());
    }

    #[test]
    fn hello_without_sni_parses_as_none() {
        let wire = build_hello(None);
        let hello = extract_client_hello(&wire).unwrap().unwrap();
        assert_eq!(hello.sni, None);
    }

    #[test]
    fn partial_stream_asks_for_more() {
        let wire = build_hello(Some("example.com"));
        for cut in [1, 4, 5, wire.len() - 1] {
            assert_eq!(extract_client_hello(&wire[..cut]), Ok(None), "cut={cut}");
        }
    }

    #[test]
    fn hello_split_across_two_records_still_parses() {
        let single = build_hello(Some("example.com"));
        let handshake = &single[5..];
        let (a, b) = handshake.split_at(handshake.len() / 2);

        let mut wire = vec![0x16, 0x03, 0x01];
        wire.extend_from_slice(&(a.len() as u16).to_be_bytes());
        wire.extend_from_slice(a);
        wire.extend_from_slice(&[0x16, 0x03, 0x01]);
        wire.extend_from_slice(&(b.len() as u16).to_be_bytes());
        wire.extend_from_slice(b);

        let hello = extract_client_hello(&wire).unwrap().unwrap();
        assert_eq!(hello.sni.as_deref(), Some("example.com"));
        assert_eq!(hello.wire_len, wire.len());
    }

    #[test]
    fn non_hello_handshake_is_rejected() {
        // ServerHello (type 2) in the record.
        let mut wire = build_hello(Some("example.com"));
        wire[5] = 0x02;
        assert!(extract_client_hello(&wire).is_err());
    }
}
