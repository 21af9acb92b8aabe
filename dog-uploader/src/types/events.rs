use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{BlobState, Checksum};

/// Change notifications emitted by a blob collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CollectionEvent {
    /// A selected file became a new record
    Added {
        checksum: Checksum,
        at: DateTime<Utc>,
    },

    /// A record's fields were merged
    Updated {
        checksum: Checksum,
        state: BlobState,
        at: DateTime<Utc>,
    },

    /// A record left the collection for good
    Removed {
        checksum: Checksum,
        at: DateTime<Utc>,
    },

    /// Display order changed
    Reordered {
        at: DateTime<Utc>,
    },

    /// The primary pointer changed
    PrimaryChanged {
        primary: Option<Checksum>,
        at: DateTime<Utc>,
    },

    /// A primary change was validated and handed to the host that owns the pointer
    PrimaryRequested {
        primary: Option<Checksum>,
        at: DateTime<Utc>,
    },

    /// Owner or auto flags changed; records may have become actionable
    PolicyChanged {
        at: DateTime<Utc>,
    },
}

impl CollectionEvent {
    /// Get event type name as string
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Added { .. } => "added",
            Self::Updated { .. } => "updated",
            Self::Removed { .. } => "removed",
            Self::Reordered { .. } => "reordered",
            Self::PrimaryChanged { .. } => "primary_changed",
            Self::PrimaryRequested { .. } => "primary_requested",
            Self::PolicyChanged { .. } => "policy_changed",
        }
    }

    /// Get the record checksum for per-record events
    pub fn checksum(&self) -> Option<&Checksum> {
        match self {
            Self::Added { checksum, .. }
            | Self::Updated { checksum, .. }
            | Self::Removed { checksum, .. } => Some(checksum),
            _ => None,
        }
    }

    /// Get the timestamp from any event
    pub fn timestamp(&self) -> &DateTime<Utc> {
        match self {
            Self::Added { at, .. } => at,
            Self::Updated { at, .. } => at,
            Self::Removed { at, .. } => at,
            Self::Reordered { at } => at,
            Self::PrimaryChanged { at, .. } => at,
            Self::PrimaryRequested { at, .. } => at,
            Self::PolicyChanged { at } => at,
        }
    }
}
