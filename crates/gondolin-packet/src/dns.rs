#![forbid(unsafe_code)]

//! DNS messages, scoped to what the guest-facing stub needs: parse one
//! question out of a query, build an authoritative response carrying at
//! most one A record.
//!
//! Compression pointers in queries are followed with a bounded jump
//! budget; responses never compress, the question name is just written
//! twice.

use super::wire::Reader;
use super::ParseError;
use core::net::Ipv4Addr;

const HEADER_LEN: usize = 12;
const MAX_NAME_LEN: usize = 255;
const MAX_LABEL_LEN: usize = 63;
/// Pointer chain length a hostile query can make us follow.
const MAX_POINTER_JUMPS: u8 = 8;

const FLAG_RESPONSE: u16 = 1 << 15;
const FLAG_AUTHORITATIVE: u16 = 1 << 10;
const FLAG_RECURSION_DESIRED: u16 = 1 << 8;
const FLAG_RECURSION_AVAILABLE: u16 = 1 << 7;

const CLASS_IN: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsType {
    A = 1,
    Aaaa = 28,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsResponseCode {
    NoError = 0,
    FormatError = 1,
    ServerFailure = 2,
    NameError = 3,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuestion {
    pub name: String,
    pub qtype: u16,
    pub qclass: u16,
}

/// One parsed guest query. Only the first question matters to the stub;
/// trailing questions and records are ignored without being decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuery {
    pub id: u16,
    pub recursion_desired: bool,
    pub question: DnsQuestion,
}

impl DnsQuery {
    pub fn parse(buf: &[u8]) -> Result<Self, ParseError> {
        let mut r = Reader::new(buf);
        let id = r.u16()?;
        let flags = r.u16()?;
        if flags & FLAG_RESPONSE != 0 {
            return Err(ParseError::Invalid("DNS response, not a query"));
        }
        let qdcount = r.u16()?;
        if qdcount == 0 {
            return Err(ParseError::Invalid("no DNS questions"));
        }
        r.take(6)?; // ANCOUNT / NSCOUNT / ARCOUNT

        let name = read_name(&mut r)?;
        let qtype = r.u16()?;
        let qclass = r.u16()?;

        Ok(Self {
            id,
            recursion_desired: flags & FLAG_RECURSION_DESIRED != 0,
            question: DnsQuestion {
                name,
                qtype,
                qclass,
            },
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DnsAnswer {
    pub addr: Ipv4Addr,
    pub ttl_secs: u32,
}

/// Authoritative reply to a single question.
#[derive(Debug, Clone)]
pub struct DnsResponseBuilder<'a> {
    pub id: u16,
    pub recursion_desired: bool,
    pub question: &'a DnsQuestion,
    pub answer: Option<DnsAnswer>,
    pub rcode: DnsResponseCode,
}

impl DnsResponseBuilder<'_> {
    pub fn serialize(&self) -> Result<Vec<u8>, ParseError> {
        let question = self.question;
        let mut out = Vec::with_capacity(HEADER_LEN + 2 * (question.name.len() + 6) + 14);

        out.extend_from_slice(&self.id.to_be_bytes());
        let mut flags =
            FLAG_RESPONSE | FLAG_AUTHORITATIVE | FLAG_RECURSION_AVAILABLE | self.rcode as u16;
        if self.recursion_desired {
            flags |= FLAG_RECURSION_DESIRED;
        }
        out.extend_from_slice(&flags.to_be_bytes());
        for count in [1u16, u16::from(self.answer.is_some()), 0, 0] {
            out.extend_from_slice(&count.to_be_bytes());
        }

        push_name(&mut out, &question.name)?;
        out.extend_from_slice(&question.qtype.to_be_bytes());
        out.extend_from_slice(&question.qclass.to_be_bytes());

        if let Some(answer) = &self.answer {
            push_name(&mut out, &question.name)?;
            out.extend_from_slice(&(DnsType::A as u16).to_be_bytes());
            out.extend_from_slice(&CLASS_IN.to_be_bytes());
            out.extend_from_slice(&answer.ttl_secs.to_be_bytes());
            out.extend_from_slice(&4u16.to_be_bytes());
            out.extend_from_slice(&answer.addr.octets());
        }
        Ok(out)
    }
}

fn push_name(out: &mut Vec<u8>, name: &str) -> Result<(), ParseError> {
    let mut wire_len = 1usize; // terminal zero byte
    for label in name.trim_end_matches('.').split('.') {
        if label.is_empty() {
            continue;
        }
        if label.len() > MAX_LABEL_LEN {
            return Err(ParseError::Invalid("DNS label too long"));
        }
        wire_len += 1 + label.len();
        if wire_len > MAX_NAME_LEN {
            return Err(ParseError::Invalid("DNS name too long"));
        }
        out.push(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
    }
    out.push(0);
    Ok(())
}

/// Read the name at the reader's position, leaving the reader just past
/// it. A compression pointer hands off to [`chase_pointer`] and always
/// terminates the inline part.
fn read_name(r: &mut Reader<'_>) -> Result<String, ParseError> {
    let mut name = String::new();
    loop {
        let len = r.u8()?;
        if len == 0 {
            break;
        }
        if len & 0b1100_0000 == 0b1100_0000 {
            let low = r.u8()?;
            let target = usize::from(u16::from_be_bytes([len & 0b0011_1111, low]));
            chase_pointer(r.buf(), target, &mut name, MAX_POINTER_JUMPS)?;
            break;
        }
        if len & 0b1100_0000 != 0 {
            return Err(ParseError::Invalid("reserved DNS label type"));
        }
        let label = r.take(usize::from(len))?;
        append_label(&mut name, label)?;
    }
    Ok(name)
}

/// Resolve a compression target elsewhere in the message. Each nested
/// pointer burns one jump from the budget, which is what defeats loops.
fn chase_pointer(
    buf: &[u8],
    mut offset: usize,
    name: &mut String,
    jumps_left: u8,
) -> Result<(), ParseError> {
    if jumps_left == 0 {
        return Err(ParseError::Invalid("DNS pointer chain too deep"));
    }
    loop {
        let len = *buf.get(offset).ok_or(ParseError::Truncated)?;
        if len == 0 {
            return Ok(());
        }
        if len & 0b1100_0000 == 0b1100_0000 {
            let low = *buf.get(offset + 1).ok_or(ParseError::Truncated)?;
            let target = usize::from(u16::from_be_bytes([len & 0b0011_1111, low]));
            return chase_pointer(buf, target, name, jumps_left - 1);
        }
        if len & 0b1100_0000 != 0 {
            return Err(ParseError::Invalid("reserved DNS label type"));
        }
        let start = offset + 1;
        let end = start + usize::from(len);
        let label = buf.get(start..end).ok_or(ParseError::Truncated)?;
        append_label(name, label)?;
        offset = end;
    }
}

fn append_label(name: &mut String, label: &[u8]) -> Result<(), ParseError> {
    let text =
        core::str::from_utf8(label).map_err(|_| ParseError::Invalid("DNS label not UTF-8"))?;
    if !name.is_empty() {
        name.push('.');
    }
    name.push_str(text);
    if name.len() > MAX_NAME_LEN {
        return Err(ParseError::Invalid("DNS name too long"));
    }
    Ok(())
}
