//! Persisted-state framing for the script runtime.
//!
//! A save is a sequence of records. Each record is a fixed-size header
//! followed by a MessagePack payload. Only the variable store and the minimal
//! resume point are persisted; the script slot table never is, so a loaded
//! game re-enters through its normal room/entry-script path.

use std::convert::TryFrom;

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};
use thiserror::Error;

/// Bytes that prefix every record ("SCVM").
pub const HEADER_MAGIC: [u8; 4] = *b"SCVM";

/// Save format revision written by this crate.
pub const FORMAT_VERSION: u16 = 0x0001;

/// Length of the binary header in bytes.
pub const HEADER_LEN: usize = 4 + 2 + 2 + 4;

/// Record kinds understood by format v1, in the order they are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize_repr, Deserialize_repr, Hash)]
#[repr(u16)]
pub enum RecordKind {
    VariableDump = 0x0001,
    ResumePoint = 0x0002,
}

impl TryFrom<u16> for RecordKind {
    type Error = ();

    fn try_from(value: u16) -> std::result::Result<Self, Self::Error> {
        match value {
            0x0001 => Ok(Self::VariableDump),
            0x0002 => Ok(Self::ResumePoint),
            _ => Err(()),
        }
    }
}

/// Envelope describing the upcoming payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHeader {
    pub version: u16,
    pub kind: RecordKind,
    pub length: u32,
}

impl RecordHeader {
    /// Appends the big-endian header to `out`.
    pub fn write_to(&self, out: &mut impl BufMut) {
        out.put_slice(&HEADER_MAGIC);
        out.put_u16(self.version);
        out.put_u16(self.kind as u16);
        out.put_u32(self.length);
    }

    /// Consumes one header from the front of `buf`.
    pub fn read_from(buf: &mut impl Buf) -> Result<Self, SaveError> {
        if buf.remaining() < HEADER_LEN {
            return Err(SaveError::TruncatedHeader);
        }
        let mut magic = [0u8; 4];
        buf.copy_to_slice(&mut magic);
        if magic != HEADER_MAGIC {
            return Err(SaveError::BadMagic);
        }
        let version = buf.get_u16();
        if version != FORMAT_VERSION {
            return Err(SaveError::UnsupportedVersion(version));
        }
        let raw_kind = buf.get_u16();
        let kind =
            RecordKind::try_from(raw_kind).map_err(|_| SaveError::UnknownRecordKind(raw_kind))?;
        Ok(Self {
            version,
            kind,
            length: buf.get_u32(),
        })
    }
}

/// Global word variables and packed bit flags, stored wholesale.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableDump {
    pub globals: Vec<i16>,
    pub bits: Vec<u16>,
}

/// Where the game re-enters after a load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumePoint {
    pub room: u16,
    pub entry_script: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveGame {
    pub vars: VariableDump,
    pub resume: ResumePoint,
}

/// Error conditions returned by the save helpers.
#[derive(Debug, Error)]
pub enum SaveError {
    #[error("header smaller than {HEADER_LEN} bytes")]
    TruncatedHeader,
    #[error("header magic mismatch")]
    BadMagic,
    #[error("save format version {0:#06x} is not supported")]
    UnsupportedVersion(u16),
    #[error("record kind {0:#06x} is unknown")]
    UnknownRecordKind(u16),
    #[error("expected {expected:?} record but found {found:?}")]
    UnexpectedRecord {
        expected: RecordKind,
        found: RecordKind,
    },
    #[error("payload length mismatch: header declared {expected} bytes but {actual} remain")]
    LengthMismatch { expected: u32, actual: usize },
    #[error("{0} trailing bytes after the last record")]
    TrailingBytes(usize),
    #[error("payload decode error: {0}")]
    PayloadDecode(#[from] rmp_serde::decode::Error),
    #[error("payload encode error: {0}")]
    PayloadEncode(#[from] rmp_serde::encode::Error),
}

/// Wraps a payload with a record header.
pub fn encode_record<T>(kind: RecordKind, payload: &T) -> Result<Vec<u8>, SaveError>
where
    T: Serialize,
{
    let payload_bytes = rmp_serde::to_vec_named(payload)?;
    let header = RecordHeader {
        version: FORMAT_VERSION,
        kind,
        length: u32::try_from(payload_bytes.len()).map_err(|_| SaveError::LengthMismatch {
            expected: u32::MAX,
            actual: payload_bytes.len(),
        })?,
    };
    let mut out = Vec::with_capacity(HEADER_LEN + payload_bytes.len());
    header.write_to(&mut out);
    out.put_slice(&payload_bytes);
    Ok(out)
}

/// Splits the first record off `bytes`, returning its header, its payload and
/// whatever follows it.
pub fn decode_record(bytes: &[u8]) -> Result<(RecordHeader, &[u8], &[u8]), SaveError> {
    let mut body = bytes;
    let header = RecordHeader::read_from(&mut body)?;
    let length = header.length as usize;
    if body.len() < length {
        return Err(SaveError::LengthMismatch {
            expected: header.length,
            actual: body.len(),
        });
    }
    let (payload, rest) = body.split_at(length);
    Ok((header, payload, rest))
}

/// Decode a payload straight into the requested type.
pub fn decode_payload<T>(payload: &[u8]) -> Result<T, SaveError>
where
    T: for<'de> Deserialize<'de>,
{
    let value = rmp_serde::from_slice(payload)?;
    Ok(value)
}

fn expect_record<'a, T>(
    bytes: &'a [u8],
    expected: RecordKind,
) -> Result<(T, &'a [u8]), SaveError>
where
    T: for<'de> Deserialize<'de>,
{
    let (header, payload, rest) = decode_record(bytes)?;
    if header.kind != expected {
        return Err(SaveError::UnexpectedRecord {
            expected,
            found: header.kind,
        });
    }
    Ok((decode_payload(payload)?, rest))
}

/// Serializes a complete save: the variable dump followed by the resume point.
pub fn encode_save(save: &SaveGame) -> Result<Vec<u8>, SaveError> {
    let mut out = encode_record(RecordKind::VariableDump, &save.vars)?;
    out.extend_from_slice(&encode_record(RecordKind::ResumePoint, &save.resume)?);
    Ok(out)
}

pub fn decode_save(bytes: &[u8]) -> Result<SaveGame, SaveError> {
    let (vars, rest) = expect_record::<VariableDump>(bytes, RecordKind::VariableDump)?;
    let (resume, rest) = expect_record::<ResumePoint>(rest, RecordKind::ResumePoint)?;
    if !rest.is_empty() {
        return Err(SaveError::TrailingBytes(rest.len()));
    }
    Ok(SaveGame { vars, resume })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SaveGame {
        SaveGame {
            vars: VariableDump {
                globals: vec![0, 42, -7, i16::MAX],
                bits: vec![0b1010, 0xFFFF],
            },
            resume: ResumePoint {
                room: 12,
                entry_script: 3,
            },
        }
    }

    #[test]
    fn save_survives_encode_decode() {
        let bytes = encode_save(&sample()).unwrap();
        assert_eq!(&bytes[..4], b"SCVM");
        assert_eq!(decode_save(&bytes).unwrap(), sample());
    }

    #[test]
    fn header_rejects_foreign_magic() {
        let mut bytes = encode_save(&sample()).unwrap();
        bytes[0] = b'X';
        assert!(matches!(decode_save(&bytes), Err(SaveError::BadMagic)));
    }

    #[test]
    fn header_rejects_future_version() {
        let mut bytes = encode_save(&sample()).unwrap();
        bytes[4..6].copy_from_slice(&0x0002u16.to_be_bytes());
        assert!(matches!(
            decode_save(&bytes),
            Err(SaveError::UnsupportedVersion(2))
        ));
    }

    #[test]
    fn header_read_consumes_exactly_its_bytes() {
        let header = RecordHeader {
            version: FORMAT_VERSION,
            kind: RecordKind::ResumePoint,
            length: 0x0102_0304,
        };
        let mut out = Vec::new();
        header.write_to(&mut out);
        out.push(0xAA);
        assert_eq!(out.len(), HEADER_LEN + 1);
        assert_eq!(&out[8..12], &[1, 2, 3, 4]);

        let mut input = &out[..];
        assert_eq!(RecordHeader::read_from(&mut input).unwrap(), header);
        assert_eq!(input, &[0xAA]);
    }

    #[test]
    fn header_rejects_short_input_and_unknown_kinds() {
        let mut short: &[u8] = &HEADER_MAGIC;
        assert!(matches!(
            RecordHeader::read_from(&mut short),
            Err(SaveError::TruncatedHeader)
        ));

        let mut bytes = encode_save(&sample()).unwrap();
        bytes[6..8].copy_from_slice(&0x0009u16.to_be_bytes());
        assert!(matches!(
            decode_save(&bytes),
            Err(SaveError::UnknownRecordKind(9))
        ));
    }

    #[test]
    fn records_must_arrive_in_order() {
        let resume = encode_record(RecordKind::ResumePoint, &sample().resume).unwrap();
        match decode_save(&resume) {
            Err(SaveError::UnexpectedRecord { expected, found }) => {
                assert_eq!(expected, RecordKind::VariableDump);
                assert_eq!(found, RecordKind::ResumePoint);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn truncated_payload_is_reported() {
        let bytes = encode_save(&sample()).unwrap();
        let cut = &bytes[..HEADER_LEN + 2];
        assert!(matches!(
            decode_save(cut),
            Err(SaveError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn trailing_garbage_is_rejected() {
        let mut bytes = encode_save(&sample()).unwrap();
        bytes.extend_from_slice(&[1, 2, 3]);
        assert!(matches!(
            decode_save(&bytes),
            Err(SaveError::TrailingBytes(3))
        ));
    }
}
