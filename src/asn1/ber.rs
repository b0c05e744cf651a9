// BER encoding and decoding for the Asn1 model (definite length only)

use super::length::{encode_length, BerLength};
use super::{tag, Asn1, Constructed, ConstructedKind, TagClass, Value};
use crate::error::DecodeError;

/// High tag numbers above this would overflow a u32.
const MAX_TAG_OCTETS: usize = 5;

/// Constructed values nested deeper than this are rejected.
pub const MAX_DEPTH: usize = 64;

/// Decode one top-level value from the start of `bytes`.
///
/// Returns the value and the number of bytes it occupied. Anything after it
/// is handed back in `trailing_data`.
pub fn decode(bytes: &[u8]) -> Result<(Asn1, usize), DecodeError> {
    let mut reader = BerReader::new(bytes);
    let mut value = reader.read_value()?;
    let consumed = reader.pos;
    if consumed < bytes.len() {
        value.trailing_data = Some(bytes[consumed..].to_vec());
    }
    Ok((value, consumed))
}

/// Decode a value embedded in an OCTET STRING (control values, extended
/// operation payloads). The blob must hold exactly one complete value.
pub fn decode_nested(bytes: &[u8]) -> Result<Asn1, DecodeError> {
    let (value, consumed) = decode(bytes).map_err(|e| match e {
        DecodeError::PartialData => DecodeError::malformed("truncated nested value"),
        other => other,
    })?;
    if consumed != bytes.len() {
        return Err(DecodeError::malformed(format!(
            "{} unexpected bytes after nested value",
            bytes.len() - consumed
        )));
    }
    Ok(value)
}

pub fn encode(value: &Asn1) -> Vec<u8> {
    let mut writer = BerWriter::new();
    writer.write_value(value);
    writer.into_vec()
}

/// Reinterpret an incomplete value as the given universal type.
///
/// The original class and tag number are kept, so an implicitly tagged
/// `[1] INTEGER` stays `[1]` but carries an integer value.
pub fn complete(value: &Asn1, universal_tag: u32) -> Result<Asn1, DecodeError> {
    let content = match &value.value {
        Value::Incomplete(content) => content,
        other => {
            if universal_tag_of(other) == Some(universal_tag) {
                return Ok(value.clone());
            }
            return Err(DecodeError::malformed(format!(
                "value tagged [{}] cannot be read as universal tag {}",
                value.tag, universal_tag
            )));
        }
    };

    let constructed = matches!(universal_tag, tag::SEQUENCE | tag::SET);
    if value.constructed != constructed {
        return Err(DecodeError::malformed(format!(
            "constructed flag of [{}] does not match universal tag {}",
            value.tag, universal_tag
        )));
    }
    let inner = build_value(TagClass::Universal, constructed, universal_tag, content, 0)?;
    if matches!(inner, Value::Incomplete(_)) {
        return Err(DecodeError::malformed(format!(
            "universal tag {} is not supported",
            universal_tag
        )));
    }
    Ok(Asn1 {
        class: value.class,
        tag: value.tag,
        constructed,
        value: inner,
        trailing_data: value.trailing_data.clone(),
    })
}

fn universal_tag_of(value: &Value) -> Option<u32> {
    match value {
        Value::Boolean(_) => Some(tag::BOOLEAN),
        Value::Integer(_) => Some(tag::INTEGER),
        Value::Enumerated(_) => Some(tag::ENUMERATED),
        Value::Null => Some(tag::NULL),
        Value::OctetString(_) => Some(tag::OCTET_STRING),
        Value::Constructed(c) => Some(match c.kind {
            ConstructedKind::Sequence => tag::SEQUENCE,
            ConstructedKind::Set => tag::SET,
        }),
        Value::Incomplete(_) => None,
    }
}

struct BerReader<'a> {
    data: &'a [u8],
    pos: usize,
    depth: usize,
}

impl<'a> BerReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self::nested(data, 0)
    }

    fn nested(data: &'a [u8], depth: usize) -> Self {
        Self { data, pos: 0, depth }
    }

    fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    fn read_byte(&mut self) -> Result<u8, DecodeError> {
        let b = *self.data.get(self.pos).ok_or(DecodeError::PartialData)?;
        self.pos += 1;
        Ok(b)
    }

    fn read_tag(&mut self) -> Result<(TagClass, bool, u32), DecodeError> {
        let first = self.read_byte()?;
        let class = TagClass::from_bits(first >> 6);
        let constructed = first & 0x20 != 0;
        let mut number = (first & 0x1F) as u32;

        if number == 0x1F {
            number = 0;
            let mut octets = 0;
            loop {
                let b = self.read_byte()?;
                octets += 1;
                if octets > MAX_TAG_OCTETS {
                    return Err(DecodeError::malformed("tag number too large"));
                }
                number = number
                    .checked_mul(128)
                    .ok_or_else(|| DecodeError::malformed("tag number too large"))?
                    | (b & 0x7F) as u32;
                if b & 0x80 == 0 {
                    break;
                }
            }
        }
        Ok((class, constructed, number))
    }

    fn read_length(&mut self) -> Result<usize, DecodeError> {
        let length = BerLength::parse(&self.data[self.pos..])?;
        self.pos += length.encoded_len;
        Ok(length.value)
    }

    fn read_value(&mut self) -> Result<Asn1, DecodeError> {
        let (class, constructed, number) = self.read_tag()?;
        let length = self.read_length()?;
        if self.remaining() < length {
            return Err(DecodeError::PartialData);
        }
        let content = &self.data[self.pos..self.pos + length];
        self.pos += length;

        let value = build_value(class, constructed, number, content, self.depth)?;
        Ok(Asn1 {
            class,
            tag: number,
            constructed,
            value,
            trailing_data: None,
        })
    }
}

fn build_value(
    class: TagClass,
    constructed: bool,
    number: u32,
    content: &[u8],
    depth: usize,
) -> Result<Value, DecodeError> {
    if class != TagClass::Universal {
        return Ok(Value::Incomplete(content.to_vec()));
    }
    let value = match (number, constructed) {
        (tag::BOOLEAN, false) => {
            if content.len() != 1 {
                return Err(DecodeError::malformed(format!(
                    "boolean must be 1 byte, got {}",
                    content.len()
                )));
            }
            Value::Boolean(content[0] != 0)
        }
        (tag::INTEGER, false) => Value::Integer(decode_integer(content)?),
        (tag::ENUMERATED, false) => Value::Enumerated(decode_integer(content)?),
        (tag::NULL, false) => {
            if !content.is_empty() {
                return Err(DecodeError::malformed("null must have no content"));
            }
            Value::Null
        }
        (tag::OCTET_STRING, false) => Value::OctetString(content.to_vec()),
        (tag::SEQUENCE, true) => Value::Constructed(Constructed::new(
            ConstructedKind::Sequence,
            decode_children(content, depth)?,
        )),
        (tag::SET, true) => {
            Value::Constructed(Constructed::new(ConstructedKind::Set, decode_children(content, depth)?))
        }
        _ => Value::Incomplete(content.to_vec()),
    };
    Ok(value)
}

fn decode_children(content: &[u8], depth: usize) -> Result<Vec<Asn1>, DecodeError> {
    if depth >= MAX_DEPTH {
        return Err(DecodeError::malformed(format!("values nested deeper than {}", MAX_DEPTH)));
    }
    let mut reader = BerReader::nested(content, depth + 1);
    let mut children = Vec::new();
    while reader.remaining() > 0 {
        // The parent's length said the content is all here.
        let child = reader.read_value().map_err(|e| match e {
            DecodeError::PartialData => DecodeError::malformed("child value overruns its parent"),
            other => other,
        })?;
        children.push(child);
    }
    Ok(children)
}

fn decode_integer(content: &[u8]) -> Result<i64, DecodeError> {
    if content.is_empty() {
        return Err(DecodeError::malformed("integer has no content"));
    }
    if content.len() > 8 {
        return Err(DecodeError::malformed(format!(
            "integer too large: {} bytes",
            content.len()
        )));
    }
    let seed: i64 = if content[0] & 0x80 != 0 { -1 } else { 0 };
    Ok(content.iter().fold(seed, |acc, b| (acc << 8) | *b as i64))
}

/// Minimal two's complement content octets.
fn integer_content(value: i64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let mut start = 0;
    while start < bytes.len() - 1 {
        let redundant = (bytes[start] == 0x00 && bytes[start + 1] & 0x80 == 0)
            || (bytes[start] == 0xFF && bytes[start + 1] & 0x80 != 0);
        if !redundant {
            break;
        }
        start += 1;
    }
    bytes[start..].to_vec()
}

struct BerWriter {
    buffer: Vec<u8>,
}

impl BerWriter {
    fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    fn write_tag(&mut self, class: TagClass, constructed: bool, number: u32) {
        let mut first = class.bits() << 6;
        if constructed {
            first |= 0x20;
        }
        if number < 0x1F {
            self.buffer.push(first | number as u8);
            return;
        }

        self.buffer.push(first | 0x1F);
        let mut octets = Vec::new();
        let mut n = number;
        loop {
            octets.push((n & 0x7F) as u8);
            n >>= 7;
            if n == 0 {
                break;
            }
        }
        octets.reverse();
        let last = octets.len() - 1;
        for (i, b) in octets.iter().enumerate() {
            self.buffer.push(if i < last { b | 0x80 } else { *b });
        }
    }

    fn write_length(&mut self, length: usize) {
        encode_length(length, &mut self.buffer);
    }

    fn write_value(&mut self, value: &Asn1) {
        self.write_tag(value.class, value.constructed, value.tag);
        match &value.value {
            Value::Boolean(b) => {
                self.write_length(1);
                self.buffer.push(if *b { 0xFF } else { 0x00 });
            }
            Value::Integer(i) | Value::Enumerated(i) => {
                let content = integer_content(*i);
                self.write_length(content.len());
                self.buffer.extend_from_slice(&content);
            }
            Value::Null => self.write_length(0),
            Value::OctetString(bytes) | Value::Incomplete(bytes) => {
                self.write_length(bytes.len());
                self.buffer.extend_from_slice(bytes);
            }
            Value::Constructed(c) => {
                let mut inner = BerWriter::new();
                for child in c.children() {
                    inner.write_value(child);
                }
                self.write_length(inner.buffer.len());
                self.buffer.extend_from_slice(&inner.buffer);
            }
        }
    }

    fn into_vec(self) -> Vec<u8> {
        self.buffer
    }
}
