//! Field-level protobuf walking. Fields are captured with their exact value bytes
//! so anything the codec does not interpret is written back unchanged.

use prost::encoding::{decode_key, decode_varint, encode_key, encode_varint, WireType};

use super::CodecError;

/// One top-level protobuf field. For length-delimited fields `value` is the payload
/// without its length prefix; for the other wire types it is the encoded scalar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RawField {
    pub(crate) tag: u32,
    pub(crate) wire_type: WireType,
    pub(crate) value: Vec<u8>,
}

impl RawField {
    pub(crate) fn bytes(tag: u32, value: Vec<u8>) -> Self {
        Self {
            tag,
            wire_type: WireType::LengthDelimited,
            value,
        }
    }

    pub(crate) fn varint(tag: u32, value: u64) -> Self {
        let mut encoded = Vec::new();
        encode_varint(value, &mut encoded);
        Self {
            tag,
            wire_type: WireType::Varint,
            value: encoded,
        }
    }

    /// Decode the value of a varint field.
    pub(crate) fn as_varint(&self) -> Result<u64, CodecError> {
        self.expect_wire_type(WireType::Varint)?;
        let mut buf = self.value.as_slice();
        decode_varint(&mut buf).map_err(malformed)
    }

    pub(crate) fn as_bytes(&self) -> Result<&[u8], CodecError> {
        self.expect_wire_type(WireType::LengthDelimited)?;
        Ok(&self.value)
    }

    pub(crate) fn as_string(&self) -> Result<String, CodecError> {
        let bytes = self.as_bytes()?;
        String::from_utf8(bytes.to_vec()).map_err(|err| {
            CodecError::Malformed(format!("field {} is not valid UTF-8: {err}", self.tag))
        })
    }

    fn expect_wire_type(&self, expected: WireType) -> Result<(), CodecError> {
        if self.wire_type != expected {
            return Err(CodecError::Malformed(format!(
                "field {} has wire type {:?}, expected {:?}",
                self.tag, self.wire_type, expected
            )));
        }
        Ok(())
    }
}

/// Split a message into its fields, in wire order.
pub(crate) fn read_fields(mut buf: &[u8]) -> Result<Vec<RawField>, CodecError> {
    let mut fields = Vec::new();
    while !buf.is_empty() {
        let (tag, wire_type) = decode_key(&mut buf).map_err(malformed)?;
        let value = match wire_type {
            WireType::Varint => {
                let start = buf;
                decode_varint(&mut buf).map_err(malformed)?;
                start[..start.len() - buf.len()].to_vec()
            }
            WireType::SixtyFourBit => take(&mut buf, 8, tag)?,
            WireType::ThirtyTwoBit => take(&mut buf, 4, tag)?,
            WireType::LengthDelimited => {
                let len = decode_varint(&mut buf).map_err(malformed)?;
                let len = usize::try_from(len).map_err(|_| {
                    CodecError::Malformed(format!("field {tag} length {len} overflows"))
                })?;
                take(&mut buf, len, tag)?
            }
            WireType::StartGroup | WireType::EndGroup => {
                return Err(CodecError::Malformed(format!(
                    "field {tag} uses unsupported group encoding"
                )));
            }
        };
        fields.push(RawField {
            tag,
            wire_type,
            value,
        });
    }
    Ok(fields)
}

/// Emit fields in the given order.
pub(crate) fn write_fields(fields: &[RawField], out: &mut Vec<u8>) {
    for field in fields {
        encode_key(field.tag, field.wire_type, out);
        if field.wire_type == WireType::LengthDelimited {
            encode_varint(field.value.len() as u64, out);
        }
        out.extend_from_slice(&field.value);
    }
}

fn take(buf: &mut &[u8], len: usize, tag: u32) -> Result<Vec<u8>, CodecError> {
    if buf.len() < len {
        return Err(CodecError::Malformed(format!(
            "field {tag} truncated: need {len} bytes, have {}",
            buf.len()
        )));
    }
    let (head, rest) = buf.split_at(len);
    *buf = rest;
    Ok(head.to_vec())
}

fn malformed(err: prost::DecodeError) -> CodecError {
    CodecError::Malformed(err.to_string())
}
