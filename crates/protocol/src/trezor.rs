//! Trezor report framing
//!
//! A logical message is a protobuf body tagged with a numeric type. On the
//! wire it is prefixed with an 8-byte header and cut into 64-byte reports:
//!
//! ```text
//! first:  [0x3f][0x23 0x23][type: u16 BE][length: u32 BE][payload: 55 bytes]
//! next:   [0x3f][payload: 63 bytes]
//! ```
//!
//! The final report is zero padded. Replies use the same layout.

use crate::error::{ProtocolError, Result};
use crate::{REPORT_SIZE, Report};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

/// Leading byte of every report
pub const REPORT_ID: u8 = 0x3f;

/// Marker opening the first report of a frame
pub const MAGIC: [u8; 2] = [0x23, 0x23];

/// Magic + type + length
pub const HEADER_SIZE: usize = 8;

/// Payload bytes carried by one report after the report id
pub const CHUNK_PAYLOAD: usize = REPORT_SIZE - 1;

/// Largest message body accepted in either direction (1 MiB)
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// A reassembled Trezor message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    pub message_type: u16,
    pub payload: Vec<u8>,
}

/// Frame a message into the reports to write, in order
pub fn encode(message_type: u16, payload: &[u8]) -> Result<Vec<Report>> {
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: payload.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }

    let mut stream = Vec::with_capacity(HEADER_SIZE + payload.len());
    stream.extend_from_slice(&MAGIC);
    stream.write_u16::<BigEndian>(message_type)?;
    stream.write_u32::<BigEndian>(payload.len() as u32)?;
    stream.extend_from_slice(payload);

    let reports = stream
        .chunks(CHUNK_PAYLOAD)
        .map(|chunk| {
            let mut report = [0u8; REPORT_SIZE];
            report[0] = REPORT_ID;
            report[1..1 + chunk.len()].copy_from_slice(chunk);
            report
        })
        .collect();

    Ok(reports)
}

/// Incremental reassembly of one reply
///
/// Feed reports in the order they were read. The first report must carry the
/// frame header; once the declared length has been collected `push` returns
/// the message and the decoder is ready for the next one.
#[derive(Debug, Default)]
pub struct Decoder {
    header: Option<(u16, usize)>,
    buffer: Vec<u8>,
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a frame has been started but not finished
    pub fn in_progress(&self) -> bool {
        self.header.is_some()
    }

    /// Consume one report
    pub fn push(&mut self, report: &[u8]) -> Result<Option<Decoded>> {
        let Some(&report_id) = report.first() else {
            return Err(ProtocolError::Truncated {
                needed: 1,
                available: 0,
            });
        };
        if report_id != REPORT_ID {
            return Err(ProtocolError::BadReportId {
                expected: REPORT_ID,
                found: report_id,
            });
        }

        let (message_type, length, body) = match self.header {
            Some((message_type, length)) => (message_type, length, &report[1..]),
            None => {
                if report.len() < 1 + HEADER_SIZE {
                    return Err(ProtocolError::Truncated {
                        needed: 1 + HEADER_SIZE,
                        available: report.len(),
                    });
                }
                let (message_type, length) = read_header(&report[1..1 + HEADER_SIZE])?;
                self.header = Some((message_type, length));
                self.buffer = Vec::with_capacity(length);
                (message_type, length, &report[1 + HEADER_SIZE..])
            }
        };

        let wanted = length - self.buffer.len();
        self.buffer
            .extend_from_slice(&body[..wanted.min(body.len())]);

        if self.buffer.len() < length {
            return Ok(None);
        }

        self.header = None;
        Ok(Some(Decoded {
            message_type,
            payload: std::mem::take(&mut self.buffer),
        }))
    }
}

fn read_header(header: &[u8]) -> Result<(u16, usize)> {
    if header[..2] != MAGIC {
        return Err(ProtocolError::BadMagic {
            found: [header[0], header[1]],
        });
    }

    let mut cursor = Cursor::new(&header[2..]);
    let message_type = cursor.read_u16::<BigEndian>()?;
    let length = cursor.read_u32::<BigEndian>()? as usize;

    if length > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: length,
            max: MAX_MESSAGE_SIZE,
        });
    }

    Ok((message_type, length))
}

/// Reassemble a complete reply from already collected reports
pub fn decode(reports: &[Report]) -> Result<Decoded> {
    let mut decoder = Decoder::new();
    for report in reports {
        if let Some(decoded) = decoder.push(report)? {
            return Ok(decoded);
        }
    }

    let actual = decoder.buffer.len();
    let expected = decoder.header.map(|(_, length)| length).unwrap_or(HEADER_SIZE);
    Err(ProtocolError::IncompleteFrame { expected, actual })
}
