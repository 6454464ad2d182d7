//! Typed field codec
//!
//! Converts between host values and the big-endian field layout used by
//! 3-Space command payloads. Both directions are pure: the encoded size must
//! equal the schema's declared size exactly, and a mismatch never produces a
//! partially filled output.

use crate::core::error::{Error, Result};
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Wire field type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldType {
    /// Signed 32-bit integer
    I32,
    /// Unsigned 32-bit integer
    U32,
    /// IEEE-754 single
    F32,
    /// Signed 16-bit integer
    I16,
    /// Unsigned 16-bit integer
    U16,
    /// Signed byte
    I8,
    /// Unsigned byte
    U8,
    /// Boolean carried as one byte
    Bool,
    /// Single character of a fixed-length string
    Char,
    /// Padding byte, written as zero and skipped on decode
    Pad,
}

impl FieldType {
    /// Fixed wire width in bytes
    pub const fn width(self) -> usize {
        match self {
            Self::I32 | Self::U32 | Self::F32 => 4,
            Self::I16 | Self::U16 => 2,
            Self::I8 | Self::U8 | Self::Bool | Self::Char | Self::Pad => 1,
        }
    }
}

/// Total encoded size of a schema
pub fn schema_len(schema: &[FieldType]) -> usize {
    schema.iter().map(|t| t.width()).sum()
}

/// A single typed value
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Field {
    I32(i32),
    U32(u32),
    F32(f32),
    I16(i16),
    U16(u16),
    I8(i8),
    U8(u8),
    Bool(bool),
    Char(u8),
    Pad,
}

impl Field {
    /// Type tag of this value
    pub fn field_type(&self) -> FieldType {
        match self {
            Self::I32(_) => FieldType::I32,
            Self::U32(_) => FieldType::U32,
            Self::F32(_) => FieldType::F32,
            Self::I16(_) => FieldType::I16,
            Self::U16(_) => FieldType::U16,
            Self::I8(_) => FieldType::I8,
            Self::U8(_) => FieldType::U8,
            Self::Bool(_) => FieldType::Bool,
            Self::Char(_) => FieldType::Char,
            Self::Pad => FieldType::Pad,
        }
    }

    pub fn as_f32(&self) -> Option<f32> {
        match *self {
            Self::F32(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match *self {
            Self::U32(v) => Some(v),
            Self::U16(v) => Some(u32::from(v)),
            Self::U8(v) => Some(u32::from(v)),
            _ => None,
        }
    }

    pub fn as_u8(&self) -> Option<u8> {
        match *self {
            Self::U8(v) | Self::Char(v) => Some(v),
            Self::Bool(b) => Some(u8::from(b)),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            Self::Bool(b) => Some(b),
            Self::U8(v) => Some(v != 0),
            _ => None,
        }
    }

    fn put(&self, buf: &mut BytesMut) {
        match *self {
            Self::I32(v) => buf.put_i32(v),
            Self::U32(v) => buf.put_u32(v),
            Self::F32(v) => buf.put_f32(v),
            Self::I16(v) => buf.put_i16(v),
            Self::U16(v) => buf.put_u16(v),
            Self::I8(v) => buf.put_i8(v),
            Self::U8(v) | Self::Char(v) => buf.put_u8(v),
            Self::Bool(v) => buf.put_u8(u8::from(v)),
            Self::Pad => buf.put_u8(0),
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::I32(v) => write!(f, "{v}"),
            Self::U32(v) => write!(f, "{v}"),
            Self::F32(v) => write!(f, "{v:.4}"),
            Self::I16(v) => write!(f, "{v}"),
            Self::U16(v) => write!(f, "{v}"),
            Self::I8(v) => write!(f, "{v}"),
            Self::U8(v) => write!(f, "{v}"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Char(v) => write!(f, "{}", char::from(*v)),
            Self::Pad => write!(f, "_"),
        }
    }
}

/// Encode fields against a declared input schema
pub fn encode(schema: &[FieldType], fields: &[Field]) -> Result<Bytes> {
    if schema.len() != fields.len() {
        return Err(Error::Parameter(format!(
            "expected {} fields, got {}",
            schema.len(),
            fields.len()
        )));
    }

    let mut buf = BytesMut::with_capacity(schema_len(schema));
    for (idx, (expected, field)) in schema.iter().zip(fields).enumerate() {
        if field.field_type() != *expected {
            return Err(Error::Parameter(format!(
                "field {idx}: expected {expected:?}, got {:?}",
                field.field_type()
            )));
        }
        field.put(&mut buf);
    }
    Ok(buf.freeze())
}

/// Decode bytes against a declared output schema.
///
/// Padding bytes are consumed but not returned.
pub fn decode(schema: &[FieldType], data: &[u8]) -> Result<Vec<Field>> {
    let expected = schema_len(schema);
    if data.len() != expected {
        return Err(Error::Parameter(format!(
            "expected {expected} bytes, got {}",
            data.len()
        )));
    }

    let mut fields = Vec::with_capacity(schema.len());
    let mut offset = 0;
    for ty in schema {
        let w = ty.width();
        let b = &data[offset..offset + w];
        offset += w;
        let field = match ty {
            FieldType::I32 => Field::I32(i32::from_be_bytes([b[0], b[1], b[2], b[3]])),
            FieldType::U32 => Field::U32(u32::from_be_bytes([b[0], b[1], b[2], b[3]])),
            FieldType::F32 => Field::F32(f32::from_be_bytes([b[0], b[1], b[2], b[3]])),
            FieldType::I16 => Field::I16(i16::from_be_bytes([b[0], b[1]])),
            FieldType::U16 => Field::U16(u16::from_be_bytes([b[0], b[1]])),
            FieldType::I8 => Field::I8(i8::from_be_bytes([b[0]])),
            FieldType::U8 => Field::U8(b[0]),
            FieldType::Bool => Field::Bool(b[0] != 0),
            FieldType::Char => Field::Char(b[0]),
            FieldType::Pad => continue,
        };
        fields.push(field);
    }
    Ok(fields)
}

/// Collect every float field in order
pub fn floats(fields: &[Field]) -> Vec<f32> {
    fields.iter().filter_map(Field::as_f32).collect()
}

/// Join char fields into a string, trimming NUL and trailing whitespace
pub fn chars_to_string(fields: &[Field]) -> String {
    let bytes: Vec<u8> = fields
        .iter()
        .filter_map(|f| match f {
            Field::Char(c) => Some(*c),
            _ => None,
        })
        .take_while(|&c| c != 0)
        .collect();
    String::from_utf8_lossy(&bytes).trim_end().to_string()
}

/// Encoded command, ready for framing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFrame {
    /// Command byte
    pub command: u8,
    /// Encoded payload
    pub payload: Bytes,
    /// Expected response payload length
    pub response_len: usize,
}

impl CommandFrame {
    /// Build a frame by encoding typed fields against the input schema
    pub fn formatted(
        command: u8,
        input: &[FieldType],
        fields: &[Field],
        output: &[FieldType],
    ) -> Result<Self> {
        Ok(Self {
            command,
            payload: encode(input, fields)?,
            response_len: schema_len(output),
        })
    }

    /// Byte-exact pass-through with no schema and no endian conversion
    pub fn raw(command: u8, payload: &[u8], response_len: usize) -> Self {
        Self {
            command,
            payload: Bytes::copy_from_slice(payload),
            response_len,
        }
    }
}

/// Decoded response
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResponseFrame {
    /// Decoded output fields (empty for raw commands)
    pub fields: Vec<Field>,
    /// Undecoded payload bytes
    pub raw: Bytes,
    /// Timestamp per the session's timestamp mode
    pub timestamp: Option<u32>,
    /// Result came from an older-firmware substitute command
    pub emulated: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: &[FieldType] = &[
        FieldType::I32,
        FieldType::U32,
        FieldType::F32,
        FieldType::I16,
        FieldType::U16,
        FieldType::I8,
        FieldType::U8,
        FieldType::Bool,
        FieldType::Char,
    ];

    #[test]
    fn test_every_field_type_round_trips() {
        let fields = vec![
            Field::I32(-123_456),
            Field::U32(0xDEAD_BEEF),
            Field::F32(-1.5),
            Field::I16(-2),
            Field::U16(65_000),
            Field::I8(-7),
            Field::U8(200),
            Field::Bool(true),
            Field::Char(b'Z'),
        ];
        let bytes = encode(ALL, &fields).unwrap();
        assert_eq!(bytes.len(), schema_len(ALL));
        assert_eq!(decode(ALL, &bytes).unwrap(), fields);
    }

    #[test]
    fn test_big_endian_layout() {
        let bytes = encode(&[FieldType::U32, FieldType::U16], &[Field::U32(1), Field::U16(2)]).unwrap();
        assert_eq!(&bytes[..], &[0, 0, 0, 1, 0, 2]);
        let f = encode(&[FieldType::F32], &[Field::F32(1.0)]).unwrap();
        assert_eq!(&f[..], &[0x3F, 0x80, 0x00, 0x00]);
    }

    #[test]
    fn test_pad_is_written_and_skipped() {
        let schema = [FieldType::U8, FieldType::Pad, FieldType::U8];
        let bytes = encode(&schema, &[Field::U8(1), Field::Pad, Field::U8(3)]).unwrap();
        assert_eq!(&bytes[..], &[1, 0, 3]);
        assert_eq!(decode(&schema, &bytes).unwrap(), vec![Field::U8(1), Field::U8(3)]);
    }

    #[test]
    fn test_length_mismatch_is_parameter_error() {
        let schema = [FieldType::F32, FieldType::F32];
        assert!(matches!(decode(&schema, &[0; 7]), Err(Error::Parameter(_))));
        assert!(matches!(decode(&schema, &[0; 9]), Err(Error::Parameter(_))));
        assert!(matches!(encode(&schema, &[Field::F32(0.0)]), Err(Error::Parameter(_))));
    }

    #[test]
    fn test_type_mismatch_is_parameter_error() {
        let err = encode(&[FieldType::U16], &[Field::U32(1)]).unwrap_err();
        assert!(matches!(err, Error::Parameter(_)));
    }

    #[test]
    fn test_raw_frame_is_byte_exact() {
        let frame = CommandFrame::raw(0xAB, &[1, 2, 3], 4);
        assert_eq!(frame.command, 0xAB);
        assert_eq!(&frame.payload[..], &[1, 2, 3]);
        assert_eq!(frame.response_len, 4);
    }

    #[test]
    fn test_chars_to_string_stops_at_nul() {
        let fields: Vec<Field> = b"25Apr2013\0\0\0".iter().map(|&c| Field::Char(c)).collect();
        assert_eq!(chars_to_string(&fields), "25Apr2013");
    }
}
