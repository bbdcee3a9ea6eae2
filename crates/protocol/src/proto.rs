//! Minimal protobuf field codec
//!
//! Only what the interactive Trezor messages need: varints and
//! length-delimited fields. Bodies of the calls themselves are opaque bytes
//! supplied by the caller.

use crate::error::{ProtocolError, Result};

const WIRE_VARINT: u8 = 0;
const WIRE_FIXED64: u8 = 1;
const WIRE_LEN: u8 = 2;
const WIRE_FIXED32: u8 = 5;

/// A decoded field value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Varint(u64),
    Bytes(Vec<u8>),
    Fixed(u64),
}

/// One `(number, value)` pair from a message body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub number: u32,
    pub value: FieldValue,
}

pub fn encode_varint(mut value: u64, out: &mut Vec<u8>) {
    while value >= 0x80 {
        out.push((value as u8) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

pub fn decode_varint(buf: &[u8]) -> Result<(u64, usize)> {
    let mut value = 0u64;
    for (i, &byte) in buf.iter().enumerate().take(10) {
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    Err(ProtocolError::Protobuf("unterminated varint".to_string()))
}

/// Encode a single length-delimited string field
pub fn encode_string_field(number: u32, value: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(value.len() + 6);
    encode_varint(u64::from(number << 3 | u32::from(WIRE_LEN)), &mut out);
    encode_varint(value.len() as u64, &mut out);
    out.extend_from_slice(value.as_bytes());
    out
}

/// Split a message body into its fields
pub fn decode_fields(mut buf: &[u8]) -> Result<Vec<Field>> {
    let mut fields = Vec::new();

    while !buf.is_empty() {
        let (key, used) = decode_varint(buf)?;
        buf = &buf[used..];
        let number = (key >> 3) as u32;
        let wire_type = (key & 0x07) as u8;

        let value = match wire_type {
            WIRE_VARINT => {
                let (value, used) = decode_varint(buf)?;
                buf = &buf[used..];
                FieldValue::Varint(value)
            }
            WIRE_LEN => {
                let (length, used) = decode_varint(buf)?;
                buf = &buf[used..];
                let length = length as usize;
                if buf.len() < length {
                    return Err(ProtocolError::Protobuf(format!(
                        "field {} declares {} bytes, {} left",
                        number,
                        length,
                        buf.len()
                    )));
                }
                let (bytes, rest) = buf.split_at(length);
                buf = rest;
                FieldValue::Bytes(bytes.to_vec())
            }
            WIRE_FIXED64 | WIRE_FIXED32 => {
                let width = if wire_type == WIRE_FIXED64 { 8 } else { 4 };
                if buf.len() < width {
                    return Err(ProtocolError::Protobuf(format!(
                        "field {} truncated",
                        number
                    )));
                }
                let mut raw = [0u8; 8];
                raw[..width].copy_from_slice(&buf[..width]);
                buf = &buf[width..];
                FieldValue::Fixed(u64::from_le_bytes(raw))
            }
            other => {
                return Err(ProtocolError::Protobuf(format!(
                    "unsupported wire type {}",
                    other
                )));
            }
        };

        fields.push(Field { number, value });
    }

    Ok(fields)
}

/// First varint field with the given number
pub fn find_varint(fields: &[Field], number: u32) -> Option<u64> {
    fields.iter().find_map(|f| match f.value {
        FieldValue::Varint(v) if f.number == number => Some(v),
        _ => None,
    })
}

/// First length-delimited field with the given number, as UTF-8
pub fn find_string(fields: &[Field], number: u32) -> Option<String> {
    fields.iter().find_map(|f| match &f.value {
        FieldValue::Bytes(bytes) if f.number == number => {
            Some(String::from_utf8_lossy(bytes).into_owned())
        }
        _ => None,
    })
}
