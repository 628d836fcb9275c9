//! Multicast DNS message codec.
//!
//! Builds single-question queries and parses replies into typed [`Answer`]
//! records. Answer, authority and additional sections are read as one ordered
//! list because discovery consumers only care about what a device announced,
//! not which section it put it in.

use std::collections::HashMap;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use tracing::{debug, trace};

use crate::dns::{self, CodecError, DNS_HDR_LEN, Header, Reader};

pub const MDNS_ADDR: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);
pub const MDNS_PORT: u16 = 5353;

pub const CLASS_IN: u16 = 0x0001;
const CACHE_FLUSH_BIT: u16 = 0x8000;

const SRV_FIXED_LEN: usize = 6;
/// Root name plus type, class, TTL and data length.
const MIN_RECORD_LEN: usize = 11;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordType {
    A,
    Ptr,
    Txt,
    Aaaa,
    Srv,
    Any,
    Other(u16),
}

impl From<u16> for RecordType {
    fn from(value: u16) -> Self {
        match value {
            0x0001 => RecordType::A,
            0x000C => RecordType::Ptr,
            0x0010 => RecordType::Txt,
            0x001C => RecordType::Aaaa,
            0x0021 => RecordType::Srv,
            0x00FF => RecordType::Any,
            other => RecordType::Other(other),
        }
    }
}

impl From<RecordType> for u16 {
    fn from(value: RecordType) -> Self {
        match value {
            RecordType::A => 0x0001,
            RecordType::Ptr => 0x000C,
            RecordType::Txt => 0x0010,
            RecordType::Aaaa => 0x001C,
            RecordType::Srv => 0x0021,
            RecordType::Any => 0x00FF,
            RecordType::Other(other) => other,
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordType::A => write!(f, "A"),
            RecordType::Ptr => write!(f, "PTR"),
            RecordType::Txt => write!(f, "TXT"),
            RecordType::Aaaa => write!(f, "AAAA"),
            RecordType::Srv => write!(f, "SRV"),
            RecordType::Any => write!(f, "ANY"),
            RecordType::Other(other) => write!(f, "TYPE{other}"),
        }
    }
}

/// Payload of an SRV record. `target` is `None` when the record was too short.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    pub priority: u16,
    pub weight: u16,
    pub port: u16,
    pub target: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordData {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    Ptr(String),
    Txt(Vec<String>),
    Srv(Service),
    /// A type this codec does not decode; the record is kept so counts line up.
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Answer {
    pub name: String,
    pub rtype: RecordType,
    pub class: u16,
    pub cache_flush: bool,
    pub ttl: u32,
    pub data: RecordData,
}

impl Answer {
    pub fn ipv4(&self) -> Option<Ipv4Addr> {
        match self.data {
            RecordData::A(addr) => Some(addr),
            _ => None,
        }
    }

    pub fn ipv6(&self) -> Option<Ipv6Addr> {
        match self.data {
            RecordData::Aaaa(addr) => Some(addr),
            _ => None,
        }
    }

    pub fn domain(&self) -> Option<&str> {
        match &self.data {
            RecordData::Ptr(domain) => Some(domain),
            _ => None,
        }
    }

    pub fn texts(&self) -> Option<&[String]> {
        match &self.data {
            RecordData::Txt(texts) => Some(texts),
            _ => None,
        }
    }

    pub fn service(&self) -> Option<&Service> {
        match &self.data {
            RecordData::Srv(service) => Some(service),
            _ => None,
        }
    }
}

impl fmt::Display for Answer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.data {
            RecordData::A(addr) => write!(f, "'{}': IPv4 (A) = {addr}", self.name),
            RecordData::Aaaa(addr) => write!(f, "'{}': IPv6 (AAAA) = {addr}", self.name),
            RecordData::Ptr(domain) => write!(f, "'{}': Domain (PTR) = '{domain}'", self.name),
            RecordData::Txt(texts) => write!(f, "'{}': Text (TXT) = {texts:?}", self.name),
            RecordData::Srv(srv) => write!(
                f,
                "'{}': Server (SRV) = '{}:{}'",
                self.name,
                srv.target.as_deref().unwrap_or("?"),
                srv.port
            ),
            RecordData::Unknown => write!(f, "'{}': {} (not decoded)", self.name, self.rtype),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub name: String,
    pub qtype: RecordType,
    pub qclass: u16,
}

/// A parsed inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub header: Header,
    pub answers: Vec<Answer>,
}

/// Encodes the question section for `name`: labels, type and the `IN` class.
pub fn build_query(name: &str, rtype: RecordType) -> Result<Vec<u8>, CodecError> {
    let mut query: Vec<u8> = dns::encode_name(name)?;
    query.extend_from_slice(&u16::from(rtype).to_be_bytes());
    query.extend_from_slice(&CLASS_IN.to_be_bytes());
    Ok(query)
}

/// A complete query packet: header followed by a single question.
pub fn build_outbound_packet(name: &str, rtype: RecordType) -> Result<Vec<u8>, CodecError> {
    let query: Vec<u8> = build_query(name, rtype)?;
    let mut packet: Vec<u8> = Vec::with_capacity(DNS_HDR_LEN + query.len());
    packet.extend_from_slice(&Header::query().encode());
    packet.extend_from_slice(&query);
    Ok(packet)
}

/// Parses a reply into its header and every answer-like record, in wire order.
///
/// Any anomaly after the header invalidates the whole packet: no partial list
/// of answers is ever returned.
pub fn parse_inbound_packet(data: &[u8]) -> Result<Message, CodecError> {
    let header: Header = Header::decode(data)?;
    let expected: usize = header.record_count();
    if expected == 0 {
        return Ok(Message {
            header,
            answers: Vec::new(),
        });
    }

    let mut reader: Reader = Reader::at(data, DNS_HDR_LEN);
    for _ in 0..header.questions {
        let question: Question = read_question(&mut reader)?;
        trace!("mDNS query '{}', type = {}", question.name, question.qtype);
    }

    let mut answers: Vec<Answer> = Vec::with_capacity(answer_capacity(expected, reader.remaining()));
    for _ in 0..expected {
        answers.push(read_answer(&mut reader)?);
    }

    Ok(Message { header, answers })
}

/// Header counts are untrusted: reserve no more records than `remaining`
/// bytes could hold.
fn answer_capacity(expected: usize, remaining: usize) -> usize {
    expected.min(remaining / MIN_RECORD_LEN)
}

/// Reads the question section. Only diagnostics and tests need its contents.
pub fn parse_questions(data: &[u8]) -> Result<Vec<Question>, CodecError> {
    let header: Header = Header::decode(data)?;
    let mut reader: Reader = Reader::at(data, DNS_HDR_LEN);
    (0..header.questions)
        .map(|_| read_question(&mut reader))
        .collect()
}

fn read_question(reader: &mut Reader) -> Result<Question, CodecError> {
    Ok(Question {
        name: reader.read_name()?,
        qtype: RecordType::from(reader.read_u16()?),
        qclass: reader.read_u16()?,
    })
}

fn read_answer(reader: &mut Reader) -> Result<Answer, CodecError> {
    let name: String = reader.read_name()?;
    let rtype: RecordType = RecordType::from(reader.read_u16()?);
    let class: u16 = reader.read_u16()?;
    let ttl: u32 = reader.read_u32()?;
    let data_len: usize = usize::from(reader.read_u16()?);

    let start: usize = reader.position();
    if data_len > reader.remaining() {
        return Err(CodecError::RecordOverflow {
            offset: start,
            declared: data_len,
            remaining: reader.remaining(),
        });
    }
    let rdata: &[u8] = &reader.message()[start..start + data_len];

    let data: RecordData = match rtype {
        RecordType::A => RecordData::A(read_ipv4(rdata)),
        RecordType::Aaaa => RecordData::Aaaa(read_ipv6(rdata)),
        RecordType::Ptr => RecordData::Ptr(dns::decode_name(reader.message(), start)?.0),
        RecordType::Txt => RecordData::Txt(read_txt(rdata)),
        RecordType::Srv => RecordData::Srv(read_srv(reader.message(), start, data_len)?),
        RecordType::Any | RecordType::Other(_) => {
            debug!("mDNS answer type {rtype} for '{name}' is not decoded, skipping payload");
            RecordData::Unknown
        }
    };
    reader.seek(start + data_len);

    let answer: Answer = Answer {
        name,
        rtype,
        class: class & !CACHE_FLUSH_BIT,
        cache_flush: class & CACHE_FLUSH_BIT != 0,
        ttl,
        data,
    };
    debug!("mDNS answer for {answer}");
    Ok(answer)
}

fn read_ipv4(rdata: &[u8]) -> Ipv4Addr {
    match <[u8; 4]>::try_from(rdata) {
        Ok(octets) => Ipv4Addr::from(octets),
        Err(_) => {
            debug!("A record carries {} bytes instead of 4", rdata.len());
            Ipv4Addr::UNSPECIFIED
        }
    }
}

fn read_ipv6(rdata: &[u8]) -> Ipv6Addr {
    match <[u8; 16]>::try_from(rdata) {
        Ok(octets) => Ipv6Addr::from(octets),
        Err(_) => {
            debug!("AAAA record carries {} bytes instead of 16", rdata.len());
            Ipv6Addr::UNSPECIFIED
        }
    }
}

fn read_txt(rdata: &[u8]) -> Vec<String> {
    let mut texts: Vec<String> = Vec::new();
    let mut cursor: usize = 0;
    while cursor < rdata.len() {
        let len: usize = usize::from(rdata[cursor]);
        cursor += 1;
        let end: usize = (cursor + len).min(rdata.len());
        texts.push(String::from_utf8_lossy(&rdata[cursor..end]).into_owned());
        cursor = end;
    }
    texts
}

fn read_srv(message: &[u8], start: usize, data_len: usize) -> Result<Service, CodecError> {
    if data_len < SRV_FIXED_LEN {
        debug!("SRV record carries {data_len} bytes, need at least {SRV_FIXED_LEN}");
        return Ok(Service {
            priority: 0,
            weight: 0,
            port: 0,
            target: None,
        });
    }
    let mut reader: Reader = Reader::at(message, start);
    Ok(Service {
        priority: reader.read_u16()?,
        weight: reader.read_u16()?,
        port: reader.read_u16()?,
        target: Some(reader.read_name()?),
    })
}

/// Callback invoked with the matched filter and every answer of the packet.
pub type ResponseHandler = Arc<dyn Fn(&str, &[Answer]) + Send + Sync>;

/// Routes parsed answer lists to handlers keyed by an exact domain name.
///
/// At most one handler exists per filter; registering the same filter again
/// replaces the previous handler.
#[derive(Default, Clone)]
pub struct ResolutionTable {
    handlers: HashMap<String, ResponseHandler>,
}

impl ResolutionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if a handler for `filter` was replaced.
    pub fn register<F>(&mut self, filter: impl Into<String>, handler: F) -> bool
    where
        F: Fn(&str, &[Answer]) + Send + Sync + 'static,
    {
        self.handlers
            .insert(filter.into(), Arc::new(handler))
            .is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn filters(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    /// The name of the first answer, in wire order, that has a handler.
    pub fn find_trigger<'a>(&self, answers: &'a [Answer]) -> Option<&'a str> {
        answers
            .iter()
            .map(|answer| answer.name.as_str())
            .find(|name| self.handlers.contains_key(*name))
    }

    /// Picks the handler for these answers without calling it, so the
    /// caller may release any lock around the table first.
    pub fn route<'a>(&self, answers: &'a [Answer]) -> Option<Route<'a>> {
        let trigger: &str = self.find_trigger(answers)?;
        let handler: ResponseHandler = self.handlers.get(trigger)?.clone();
        Some(Route { trigger, handler })
    }
}

/// A matched trigger and the handler registered for it.
pub struct Route<'a> {
    pub trigger: &'a str,
    handler: ResponseHandler,
}

impl Route<'_> {
    /// Runs the handler once with the full answer list.
    pub fn invoke(&self, answers: &[Answer]) {
        (self.handler)(self.trigger, answers);
    }
}

impl fmt::Debug for ResolutionTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.handlers.keys()).finish()
    }
}

// ╔════════════════════════════════════════════╗
// ║ ████████╗███████╗███████╗████████╗███████╗ ║
// ║ ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝██╔════╝ ║
// ║    ██║   █████╗  ███████╗   ██║   ███████╗ ║
// ║    ██║   ██╔══╝  ╚════██║   ██║   ╚════██║ ║
// ║    ██║   ███████╗███████║   ██║   ███████║ ║
// ║    ╚═╝   ╚══════╝╚══════╝   ╚═╝   ╚══════╝ ║
// ╚════════════════════════════════════════════╝
