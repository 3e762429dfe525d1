//! Codec for the store's native binary encoding: a four byte magic prefix followed by
//! a `runtime.Unknown` envelope whose `raw` field holds the object's protobuf body.

pub(crate) mod wire;

use chrono::{DateTime, Utc};
use prost::Message;
use thiserror::Error;

use crate::resource::{ObjectMeta, TypeDescriptor, TypedResource};
use wire::{read_fields, write_fields, RawField};

/// Prefix of every protobuf-encoded object in the registry.
pub const ENVELOPE_MAGIC: [u8; 4] = [b'k', b'8', b's', 0];

const OBJECT_METADATA_TAG: u32 = 1;

const META_NAME_TAG: u32 = 1;
const META_NAMESPACE_TAG: u32 = 3;
const META_DELETION_TIMESTAMP_TAG: u32 = 9;
const META_DELETION_GRACE_PERIOD_TAG: u32 = 10;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("payload does not start with the protobuf envelope prefix")]
    MissingMagic,
    #[error("envelope carries {found}, expected {expected}")]
    TypeMismatch {
        expected: TypeDescriptor,
        found: TypeDescriptor,
    },
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("cannot encode resource: {0}")]
    Encode(String),
}

#[derive(Clone, PartialEq, Message)]
struct TypeMeta {
    #[prost(string, optional, tag = "1")]
    api_version: Option<String>,
    #[prost(string, optional, tag = "2")]
    kind: Option<String>,
}

#[derive(Clone, PartialEq, Message)]
struct Unknown {
    #[prost(message, optional, tag = "1")]
    type_meta: Option<TypeMeta>,
    #[prost(bytes = "vec", optional, tag = "2")]
    raw: Option<Vec<u8>>,
    #[prost(string, optional, tag = "3")]
    content_encoding: Option<String>,
    #[prost(string, optional, tag = "4")]
    content_type: Option<String>,
}

#[derive(Clone, PartialEq, Message)]
struct Time {
    #[prost(int64, optional, tag = "1")]
    seconds: Option<i64>,
    #[prost(int32, optional, tag = "2")]
    nanos: Option<i32>,
}

/// Decodes and encodes objects of exactly one type.
#[derive(Debug, Clone)]
pub struct ObjectCodec {
    expected: TypeDescriptor,
}

impl ObjectCodec {
    pub fn new(expected: TypeDescriptor) -> Self {
        Self { expected }
    }

    /// Decode a stored value, rejecting envelopes of any other type.
    pub fn decode(&self, bytes: &[u8]) -> Result<TypedResource, CodecError> {
        let payload = bytes
            .strip_prefix(&ENVELOPE_MAGIC)
            .ok_or(CodecError::MissingMagic)?;
        let envelope =
            Unknown::decode(payload).map_err(|err| CodecError::Malformed(err.to_string()))?;

        let type_meta = envelope
            .type_meta
            .ok_or_else(|| CodecError::Malformed("envelope has no type metadata".to_string()))?;
        let found = TypeDescriptor::from_api_version(
            type_meta.api_version.as_deref().unwrap_or_default(),
            type_meta.kind.as_deref().unwrap_or_default(),
        );
        if found != self.expected {
            return Err(CodecError::TypeMismatch {
                expected: self.expected.clone(),
                found,
            });
        }

        let raw = envelope.raw.unwrap_or_default();
        let mut metadata_bytes: Option<Vec<u8>> = None;
        let mut body = Vec::new();
        for field in read_fields(&raw)? {
            if field.tag == OBJECT_METADATA_TAG {
                // Repeated occurrences of an embedded message merge, which is concatenation.
                metadata_bytes
                    .get_or_insert_with(Vec::new)
                    .extend_from_slice(field.as_bytes()?);
            } else {
                body.push(field);
            }
        }
        let metadata_bytes = metadata_bytes
            .ok_or_else(|| CodecError::Malformed("object has no metadata".to_string()))?;
        body.sort_by_key(|field| field.tag);

        Ok(TypedResource {
            type_descriptor: found,
            metadata: decode_metadata(&metadata_bytes)?,
            body,
            content_encoding: envelope.content_encoding,
            content_type: envelope.content_type,
        })
    }

    /// Encode a resource back into envelope form.
    pub fn encode(&self, resource: &TypedResource) -> Result<Vec<u8>, CodecError> {
        let descriptor = &resource.type_descriptor;
        if descriptor.version.is_empty() || descriptor.kind.is_empty() {
            return Err(CodecError::Encode(format!(
                "incomplete type descriptor {descriptor}"
            )));
        }

        let mut raw = Vec::new();
        let mut fields = Vec::with_capacity(resource.body.len() + 1);
        fields.push(RawField::bytes(
            OBJECT_METADATA_TAG,
            encode_metadata(&resource.metadata)?,
        ));
        fields.extend(resource.body.iter().cloned());
        fields.sort_by_key(|field| field.tag);
        write_fields(&fields, &mut raw);

        let envelope = Unknown {
            type_meta: Some(TypeMeta {
                api_version: Some(descriptor.api_version()),
                kind: Some(descriptor.kind.clone()),
            }),
            raw: Some(raw),
            content_encoding: resource.content_encoding.clone(),
            content_type: resource.content_type.clone(),
        };

        let mut out = Vec::with_capacity(ENVELOPE_MAGIC.len() + envelope.encoded_len());
        out.extend_from_slice(&ENVELOPE_MAGIC);
        envelope
            .encode(&mut out)
            .map_err(|err| CodecError::Encode(err.to_string()))?;
        Ok(out)
    }
}

fn decode_metadata(bytes: &[u8]) -> Result<ObjectMeta, CodecError> {
    let mut meta = ObjectMeta::default();
    for field in read_fields(bytes)? {
        match field.tag {
            META_NAME_TAG => meta.name = Some(field.as_string()?),
            META_NAMESPACE_TAG => meta.namespace = Some(field.as_string()?),
            META_DELETION_TIMESTAMP_TAG => {
                meta.deletion_timestamp = Some(decode_time(field.as_bytes()?)?)
            }
            META_DELETION_GRACE_PERIOD_TAG => {
                meta.deletion_grace_period_seconds = Some(field.as_varint()? as i64)
            }
            _ => meta.retained.push(field),
        }
    }
    meta.retained.sort_by_key(|field| field.tag);
    Ok(meta)
}

fn encode_metadata(meta: &ObjectMeta) -> Result<Vec<u8>, CodecError> {
    let mut fields = meta.retained.clone();
    if let Some(name) = &meta.name {
        fields.push(RawField::bytes(META_NAME_TAG, name.as_bytes().to_vec()));
    }
    if let Some(namespace) = &meta.namespace {
        fields.push(RawField::bytes(
            META_NAMESPACE_TAG,
            namespace.as_bytes().to_vec(),
        ));
    }
    if let Some(ts) = &meta.deletion_timestamp {
        fields.push(RawField::bytes(META_DELETION_TIMESTAMP_TAG, encode_time(ts)?));
    }
    if let Some(grace) = meta.deletion_grace_period_seconds {
        fields.push(RawField::varint(META_DELETION_GRACE_PERIOD_TAG, grace as u64));
    }
    fields.sort_by_key(|field| field.tag);

    let mut out = Vec::new();
    write_fields(&fields, &mut out);
    Ok(out)
}

fn decode_time(bytes: &[u8]) -> Result<DateTime<Utc>, CodecError> {
    let time = Time::decode(bytes).map_err(|err| CodecError::Malformed(err.to_string()))?;
    let seconds = time.seconds.unwrap_or_default();
    let nanos = time.nanos.unwrap_or_default();
    u32::try_from(nanos)
        .ok()
        .filter(|nanos| *nanos < 1_000_000_000)
        .and_then(|nanos| DateTime::from_timestamp(seconds, nanos))
        .ok_or_else(|| {
            CodecError::Malformed(format!("timestamp {seconds}s {nanos}ns out of range"))
        })
}

fn encode_time(ts: &DateTime<Utc>) -> Result<Vec<u8>, CodecError> {
    let nanos = ts.timestamp_subsec_nanos();
    if nanos >= 1_000_000_000 {
        return Err(CodecError::Encode(format!(
            "timestamp {ts} falls on a leap second"
        )));
    }
    let time = Time {
        seconds: Some(ts.timestamp()),
        nanos: Some(nanos as i32),
    };
    Ok(time.encode_to_vec())
}
