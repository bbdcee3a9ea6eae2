//! Ledger APDU framing over HID
//!
//! A command APDU is serialized as `[cla, ins, p1, p2, lc, data...]`, prefixed
//! with its total length as a big-endian `u16`, and cut into 64-byte reports:
//!
//! ```text
//! [channel: 0x01 0x01][tag: 0x05][seq: u16 BE][stream bytes: 59]
//! ```
//!
//! The device answers with the same report layout. The reassembled reply ends
//! with a two-byte status word.

use crate::error::{ProtocolError, Result};
use crate::{REPORT_SIZE, Report};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::fmt;
use std::io::Cursor;

/// HID channel used by the dashboard and every app
pub const CHANNEL: u16 = 0x0101;

/// Tag for APDU traffic
pub const TAG_APDU: u8 = 0x05;

/// channel + tag + sequence
pub const HEADER_SIZE: usize = 5;

/// Class byte shared by all Ledger apps
pub const DEFAULT_CLA: u8 = 0xe0;

/// Largest APDU body expressible with a one-byte Lc
pub const MAX_DATA_SIZE: usize = 255;

/// A command APDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Apdu {
    pub cla: u8,
    pub ins: u8,
    pub p1: u8,
    pub p2: u8,
    pub data: Vec<u8>,
}

impl Apdu {
    /// Create an APDU with the default class byte
    pub fn new(ins: u8, p1: u8, p2: u8, data: Vec<u8>) -> Self {
        Self {
            cla: DEFAULT_CLA,
            ins,
            p1,
            p2,
            data,
        }
    }

    /// Serialize to `[cla, ins, p1, p2, lc, data...]`
    pub fn serialize(&self) -> Result<Vec<u8>> {
        if self.data.len() > MAX_DATA_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: self.data.len(),
                max: MAX_DATA_SIZE,
            });
        }

        let mut bytes = Vec::with_capacity(5 + self.data.len());
        bytes.extend_from_slice(&[self.cla, self.ins, self.p1, self.p2, self.data.len() as u8]);
        bytes.extend_from_slice(&self.data);
        Ok(bytes)
    }
}

/// Status word closing every response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatusWord(pub u16);

impl StatusWord {
    pub const OK: StatusWord = StatusWord(0x9000);
    pub const SECURITY_STATUS_NOT_SATISFIED: StatusWord = StatusWord(0x6982);
    pub const LOCKED_DEVICE: StatusWord = StatusWord(0x5515);
    pub const CONDITIONS_NOT_SATISFIED: StatusWord = StatusWord(0x6985);
    pub const INS_NOT_SUPPORTED: StatusWord = StatusWord(0x6d00);
    pub const CLA_NOT_SUPPORTED: StatusWord = StatusWord(0x6e00);
    pub const APP_NOT_OPEN: StatusWord = StatusWord(0x6e01);
    pub const WRONG_APP: StatusWord = StatusWord(0x6511);

    pub fn is_ok(self) -> bool {
        self == Self::OK
    }

    /// The device is showing its PIN screen
    pub fn is_locked(self) -> bool {
        matches!(
            self,
            Self::SECURITY_STATUS_NOT_SATISFIED | Self::LOCKED_DEVICE
        )
    }

    /// The command was understood by nothing that is currently open
    pub fn is_wrong_app(self) -> bool {
        matches!(
            self,
            Self::CLA_NOT_SUPPORTED | Self::INS_NOT_SUPPORTED | Self::APP_NOT_OPEN | Self::WRONG_APP
        )
    }

    /// The user declined on the device
    pub fn is_rejected(self) -> bool {
        self == Self::CONDITIONS_NOT_SATISFIED
    }

    pub fn description(self) -> &'static str {
        if self.is_ok() {
            "success"
        } else if self.is_locked() {
            "locked device"
        } else if self.is_wrong_app() {
            "wrong application open"
        } else if self.is_rejected() {
            "rejected by user"
        } else {
            "unknown error"
        }
    }
}

impl fmt::Display for StatusWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "status word {:#06x} ({})", self.0, self.description())
    }
}

/// A reassembled response split into data and status word
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub data: Vec<u8>,
    pub status: StatusWord,
}

impl Response {
    /// Strip the trailing status word off a reassembled reply
    pub fn parse(mut bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() < 2 {
            return Err(ProtocolError::Truncated {
                needed: 2,
                available: bytes.len(),
            });
        }

        let split = bytes.len() - 2;
        let status = StatusWord(u16::from_be_bytes([bytes[split], bytes[split + 1]]));
        bytes.truncate(split);
        Ok(Self {
            data: bytes,
            status,
        })
    }
}

/// Frame a serialized command into the reports to write, in order
pub fn encode(command: &[u8]) -> Result<Vec<Report>> {
    if command.len() > u16::MAX as usize {
        return Err(ProtocolError::FrameTooLarge {
            size: command.len(),
            max: u16::MAX as usize,
        });
    }

    let mut stream = Vec::with_capacity(2 + command.len());
    stream.write_u16::<BigEndian>(command.len() as u16)?;
    stream.extend_from_slice(command);

    let mut reports = Vec::new();
    for (seq, chunk) in stream.chunks(REPORT_SIZE - HEADER_SIZE).enumerate() {
        let mut report = [0u8; REPORT_SIZE];
        let mut header = &mut report[..HEADER_SIZE];
        header.write_u16::<BigEndian>(CHANNEL)?;
        header.write_u8(TAG_APDU)?;
        header.write_u16::<BigEndian>(seq as u16)?;
        report[HEADER_SIZE..HEADER_SIZE + chunk.len()].copy_from_slice(chunk);
        reports.push(report);
    }

    Ok(reports)
}

/// Incremental reassembly of one response
#[derive(Debug, Default)]
pub struct Decoder {
    next_seq: u16,
    length: Option<usize>,
    buffer: Vec<u8>,
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume one report, returning the raw reply (status word included)
    /// once the declared length has been collected
    pub fn push(&mut self, report: &[u8]) -> Result<Option<Vec<u8>>> {
        if report.len() < HEADER_SIZE {
            return Err(ProtocolError::Truncated {
                needed: HEADER_SIZE,
                available: report.len(),
            });
        }

        let mut cursor = Cursor::new(report);
        let channel = cursor.read_u16::<BigEndian>()?;
        if channel != CHANNEL {
            return Err(ProtocolError::BadChannel {
                expected: CHANNEL,
                found: channel,
            });
        }
        let tag = cursor.read_u8()?;
        if tag != TAG_APDU {
            return Err(ProtocolError::BadTag {
                expected: TAG_APDU,
                found: tag,
            });
        }
        let seq = cursor.read_u16::<BigEndian>()?;
        if seq != self.next_seq {
            return Err(ProtocolError::BadSequence {
                expected: self.next_seq,
                found: seq,
            });
        }

        let length = match self.length {
            Some(length) => length,
            None => {
                let length = cursor.read_u16::<BigEndian>().map_err(|_| {
                    ProtocolError::Truncated {
                        needed: HEADER_SIZE + 2,
                        available: report.len(),
                    }
                })? as usize;
                self.buffer = Vec::with_capacity(length);
                self.length = Some(length);
                length
            }
        };

        let body = &report[cursor.position() as usize..];
        let wanted = length - self.buffer.len();
        self.buffer.extend_from_slice(&body[..wanted.min(body.len())]);
        self.next_seq = self.next_seq.wrapping_add(1);

        if self.buffer.len() < length {
            return Ok(None);
        }

        self.next_seq = 0;
        self.length = None;
        Ok(Some(std::mem::take(&mut self.buffer)))
    }
}

/// Reassemble a complete reply from already collected reports
pub fn decode(reports: &[Report]) -> Result<Vec<u8>> {
    let mut decoder = Decoder::new();
    for report in reports {
        if let Some(bytes) = decoder.push(report)? {
            return Ok(bytes);
        }
    }

    Err(ProtocolError::IncompleteFrame {
        expected: decoder.length.unwrap_or(2),
        actual: decoder.buffer.len(),
    })
}
