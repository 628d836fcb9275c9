//! Wire-level building blocks for DNS-shaped discovery protocols.
//!
//! Everything in here works on plain byte buffers in network byte order. Reads
//! are bounds-checked against the message they came from, so a hostile or
//! truncated datagram surfaces as a [`CodecError`] instead of a panic.

use thiserror::Error;

pub const DNS_HDR_LEN: usize = 12;
pub const MAX_LABEL_LEN: usize = 63;
pub const MAX_NAME_LEN: usize = 255;

const POINTER_TAG: u8 = 0xC0;
const POINTER_OFFSET_HIGH: u8 = 0x3F;
const RESPONSE_FLAG: u16 = 0x8000;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("packet is {len} bytes, shorter than the 12-byte header")]
    Undersized { len: usize },

    #[error("unexpected end of packet at offset {offset}")]
    Truncated { offset: usize },

    #[error("record at offset {offset} declares {declared} data bytes but only {remaining} remain")]
    RecordOverflow {
        offset: usize,
        declared: usize,
        remaining: usize,
    },

    #[error("compression pointer at offset {at} targets {target}, which is not an earlier name")]
    BadPointer { at: usize, target: usize },

    #[error("label type {0:#04x} is not supported")]
    UnsupportedLabel(u8),

    #[error("name exceeds 255 bytes")]
    NameTooLong,

    #[error("label '{0}' exceeds 63 bytes")]
    LabelTooLong(String),

    #[error("'{name}' is not a valid domain name: {reason}")]
    InvalidName { name: String, reason: String },
}

/// The fixed 12-byte message header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Header {
    pub id: u16,
    pub flags: u16,
    pub questions: u16,
    pub answers: u16,
    pub authorities: u16,
    pub additionals: u16,
}

impl Header {
    /// Header of an outbound query carrying a single question.
    pub fn query() -> Self {
        Self {
            questions: 1,
            ..Self::default()
        }
    }

    pub fn encode(&self) -> [u8; DNS_HDR_LEN] {
        let mut buffer: [u8; DNS_HDR_LEN] = [0u8; DNS_HDR_LEN];
        let fields: [u16; 6] = [
            self.id,
            self.flags,
            self.questions,
            self.answers,
            self.authorities,
            self.additionals,
        ];
        for (idx, field) in fields.iter().enumerate() {
            buffer[idx * 2..idx * 2 + 2].copy_from_slice(&field.to_be_bytes());
        }
        buffer
    }

    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() < DNS_HDR_LEN {
            return Err(CodecError::Undersized { len: data.len() });
        }
        let field = |idx: usize| u16::from_be_bytes([data[idx * 2], data[idx * 2 + 1]]);
        Ok(Self {
            id: field(0),
            flags: field(1),
            questions: field(2),
            answers: field(3),
            authorities: field(4),
            additionals: field(5),
        })
    }

    /// Answers, authority and additional records summed.
    ///
    /// Consumers treat all three sections alike, so they are parsed as one list.
    pub fn record_count(&self) -> usize {
        usize::from(self.answers) + usize::from(self.authorities) + usize::from(self.additionals)
    }

    pub fn is_response(&self) -> bool {
        self.flags & RESPONSE_FLAG != 0
    }
}

/// Normalizes a (possibly internationalized) domain name to its ASCII form.
pub fn normalize_name(name: &str) -> Result<String, CodecError> {
    idna::domain_to_ascii(name).map_err(|e| CodecError::InvalidName {
        name: name.to_string(),
        reason: e.to_string(),
    })
}

/// Encodes `name` as a sequence of length-prefixed labels ending in the root label.
pub fn encode_name(name: &str) -> Result<Vec<u8>, CodecError> {
    let ascii: String = normalize_name(name)?;
    let mut encoded: Vec<u8> = Vec::with_capacity(ascii.len() + 2);
    for label in ascii.split('.') {
        if label.is_empty() {
            continue;
        }
        if label.len() > MAX_LABEL_LEN {
            return Err(CodecError::LabelTooLong(label.to_string()));
        }
        encoded.push(label.len() as u8);
        encoded.extend_from_slice(label.as_bytes());
    }
    encoded.push(0);

    if encoded.len() > MAX_NAME_LEN {
        return Err(CodecError::NameTooLong);
    }
    Ok(encoded)
}

/// Decodes the name starting at `start`, following compression pointers.
///
/// Returns the dotted name and the offset right after it in the original
/// stream, i.e. after the terminating zero label or after the first pointer.
/// Every pointer must target an offset before the name (or pointer target) it
/// was found in, which bounds the walk to the message length.
pub fn decode_name(message: &[u8], start: usize) -> Result<(String, usize), CodecError> {
    let mut labels: Vec<String> = Vec::new();
    let mut total_len: usize = 0;
    let mut cursor: usize = start;
    let mut floor: usize = start;
    let mut resume: Option<usize> = None;

    loop {
        let len: u8 = *message
            .get(cursor)
            .ok_or(CodecError::Truncated { offset: cursor })?;

        match len & POINTER_TAG {
            0x00 if len == 0 => {
                cursor += 1;
                break;
            }
            0x00 => {
                let begin: usize = cursor + 1;
                let end: usize = begin + usize::from(len);
                let bytes: &[u8] = message
                    .get(begin..end)
                    .ok_or(CodecError::Truncated { offset: begin })?;

                total_len += usize::from(len) + 1;
                if total_len > MAX_NAME_LEN {
                    return Err(CodecError::NameTooLong);
                }
                labels.push(String::from_utf8_lossy(bytes).into_owned());
                cursor = end;
            }
            POINTER_TAG => {
                let low: u8 = *message
                    .get(cursor + 1)
                    .ok_or(CodecError::Truncated { offset: cursor + 1 })?;
                let target: usize = (usize::from(len & POINTER_OFFSET_HIGH) << 8) | usize::from(low);
                if target >= floor {
                    return Err(CodecError::BadPointer { at: cursor, target });
                }
                resume.get_or_insert(cursor + 2);
                floor = target;
                cursor = target;
            }
            other => return Err(CodecError::UnsupportedLabel(other)),
        }
    }

    Ok((labels.join("."), resume.unwrap_or(cursor)))
}

/// A forward-only cursor over one message.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    message: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(message: &'a [u8]) -> Self {
        Self { message, pos: 0 }
    }

    pub fn at(message: &'a [u8], pos: usize) -> Self {
        Self { message, pos }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.message.len().saturating_sub(self.pos)
    }

    pub fn message(&self) -> &'a [u8] {
        self.message
    }

    pub fn seek(&mut self, pos: usize) {
        self.pos = pos;
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        let bytes: &[u8] = self
            .message
            .get(self.pos..self.pos + len)
            .ok_or(CodecError::Truncated { offset: self.pos })?;
        self.pos += len;
        Ok(bytes)
    }

    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.read_bytes(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, CodecError> {
        let bytes: &[u8] = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32, CodecError> {
        let bytes: &[u8] = self.read_bytes(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_name(&mut self) -> Result<String, CodecError> {
        let (name, next) = decode_name(self.message, self.pos)?;
        self.pos = next;
        Ok(name)
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
