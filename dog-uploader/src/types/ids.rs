use serde::{Deserialize, Serialize};
use std::fmt;

/// Content-derived identity of a blob; basis for dedup and call correlation
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Checksum(pub String);

impl Checksum {
    /// Create a checksum from its string form
    pub fn from_string(value: String) -> Self {
        Self(value)
    }

    /// Get the inner string value
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for Checksum {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for Checksum {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Server-side identifier of a registered blob record
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlobId(pub String);

impl BlobId {
    pub fn from_string(id: String) -> Self {
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for BlobId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Server-side identifier of the blob-to-owner association
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttachmentId(pub String);

impl AttachmentId {
    pub fn from_string(id: String) -> Self {
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AttachmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AttachmentId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Identifier of the business entity that owns linked blobs
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerId(pub String);

impl OwnerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for OwnerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// The owning entity attachments are linked to (id plus entity type)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Owner {
    pub id: OwnerId,
    pub kind: String,
}

impl Owner {
    pub fn new(id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: OwnerId(id.into()),
            kind: kind.into(),
        }
    }
}
