use std::fmt;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::codec::wire::RawField;

/// Group/version/kind triple identifying a resource type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TypeDescriptor {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl TypeDescriptor {
    pub fn new(
        group: impl Into<String>,
        version: impl Into<String>,
        kind: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            kind: kind.into(),
        }
    }

    /// Core group `v1` PersistentVolumeClaim.
    pub fn persistent_volume_claim() -> Self {
        Self::new("", "v1", "PersistentVolumeClaim")
    }

    /// `apiVersion` as written into the envelope: `version` for the core group,
    /// `group/version` otherwise.
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    /// Inverse of [`TypeDescriptor::api_version`].
    pub fn from_api_version(api_version: &str, kind: &str) -> Self {
        match api_version.split_once('/') {
            Some((group, version)) => Self::new(group, version, kind),
            None => Self::new("", api_version, kind),
        }
    }
}

impl fmt::Display for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, Kind={}", self.api_version(), self.kind)
    }
}

/// Object metadata with the fields the repair touches decoded; the rest is kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ObjectMeta {
    pub(crate) name: Option<String>,
    pub(crate) namespace: Option<String>,
    pub deletion_timestamp: Option<DateTime<Utc>>,
    pub deletion_grace_period_seconds: Option<i64>,
    pub(crate) retained: Vec<RawField>,
}

impl ObjectMeta {
    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or_default()
    }

    pub fn namespace(&self) -> &str {
        self.namespace.as_deref().unwrap_or_default()
    }

    /// True when either half of the terminating-state marker is present.
    pub fn is_terminating(&self) -> bool {
        self.deletion_timestamp.is_some() || self.deletion_grace_period_seconds.is_some()
    }

    /// Drop both marker fields. Returns whether anything was present.
    pub fn clear_terminating_state(&mut self) -> bool {
        let was_terminating = self.is_terminating();
        self.deletion_timestamp = None;
        self.deletion_grace_period_seconds = None;
        was_terminating
    }
}

/// A decoded object: its type, metadata and every other field of the body as raw protobuf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypedResource {
    pub(crate) type_descriptor: TypeDescriptor,
    pub metadata: ObjectMeta,
    pub(crate) body: Vec<RawField>,
    pub(crate) content_encoding: Option<String>,
    pub(crate) content_type: Option<String>,
}

impl TypedResource {
    /// A bare resource carrying only identity.
    pub fn new(
        type_descriptor: TypeDescriptor,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            type_descriptor,
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some(namespace.into()),
                ..ObjectMeta::default()
            },
            body: Vec::new(),
            content_encoding: Some(String::new()),
            content_type: Some(String::new()),
        }
    }

    pub fn type_descriptor(&self) -> &TypeDescriptor {
        &self.type_descriptor
    }

    pub fn name(&self) -> &str {
        self.metadata.name()
    }

    pub fn namespace(&self) -> &str {
        self.metadata.namespace()
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("resource has an empty {field}")]
    Empty { field: &'static str },
    #[error("resource {field} {value:?} contains '/'")]
    Separator { field: &'static str, value: String },
}

/// Store key of a namespaced object: `<prefix>/<namespace>/<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyPath(String);

impl KeyPath {
    /// Segments must be non-empty and free of `/`, which keeps the mapping injective.
    pub fn derive(prefix: &str, namespace: &str, name: &str) -> Result<Self, IdentityError> {
        check_segment("namespace", namespace)?;
        check_segment("name", name)?;
        Ok(Self(format!(
            "{}/{}/{}",
            prefix.trim_end_matches('/'),
            namespace,
            name
        )))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn check_segment(field: &'static str, value: &str) -> Result<(), IdentityError> {
    if value.is_empty() {
        return Err(IdentityError::Empty { field });
    }
    if value.contains('/') {
        return Err(IdentityError::Separator {
            field,
            value: value.to_string(),
        });
    }
    Ok(())
}
