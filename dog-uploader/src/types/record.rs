use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{AttachmentId, BlobId, BlobState, Checksum};

/// A file picked by the user, held until its bytes have been transferred
#[derive(Debug, Clone)]
pub struct SelectedFile {
    pub name: String,
    pub mime_type: String,
    pub bytes: Bytes,
}

impl SelectedFile {
    pub fn new(name: impl Into<String>, mime_type: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            bytes: bytes.into(),
        }
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }
}

/// Blob record - mutable pipeline state of one uploadable item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlobRecord {
    /// Content checksum, immutable identity within a collection
    pub checksum: Checksum,

    pub name: Option<String>,
    pub mime_type: Option<String>,
    pub size: Option<u64>,

    /// Current pipeline state
    pub state: BlobState,

    /// Direct-upload destination issued with the slot
    pub upload_url: Option<String>,

    /// Object-store key issued with the slot
    pub storage_key: Option<String>,

    pub preview_url: Option<String>,
    pub url: Option<String>,
    pub blob_id: Option<BlobId>,
    pub attachment_id: Option<AttachmentId>,

    /// Last step failure; set while the record is parked awaiting retry
    pub error_message: Option<String>,

    /// Retries left; never increases
    pub retry_count: u32,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BlobRecord {
    /// Create a freshly selected record
    pub fn selected(checksum: Checksum, file: &SelectedFile, retry_count: u32) -> Self {
        let mut record = Self::empty(checksum, BlobState::SelectedForUpload, retry_count);
        record.name = Some(file.name.clone());
        record.mime_type = Some(file.mime_type.clone());
        record.size = Some(file.size());
        record
    }

    /// Create a record for a blob already linked to its owner (editing an existing entity)
    pub fn linked(checksum: Checksum, blob_id: BlobId, attachment_id: AttachmentId, retry_count: u32) -> Self {
        let mut record = Self::empty(checksum, BlobState::Linked, retry_count);
        record.blob_id = Some(blob_id);
        record.attachment_id = Some(attachment_id);
        record
    }

    fn empty(checksum: Checksum, state: BlobState, retry_count: u32) -> Self {
        let now = Utc::now();
        Self {
            checksum,
            name: None,
            mime_type: None,
            size: None,
            state,
            upload_url: None,
            storage_key: None,
            preview_url: None,
            url: None,
            blob_id: None,
            attachment_id: None,
            error_message: None,
            retry_count,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_storage_key(mut self, key: impl Into<String>) -> Self {
        self.storage_key = Some(key.into());
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        let url = url.into();
        self.preview_url.get_or_insert_with(|| url.clone());
        self.url = Some(url);
        self
    }

    pub fn with_state(mut self, state: BlobState) -> Self {
        self.state = state;
        self
    }

    /// Check if a failure is parked on this record
    pub fn has_error(&self) -> bool {
        self.error_message.is_some()
    }

    /// Check if a parked failure may still be cleared for another attempt
    pub fn can_retry(&self) -> bool {
        self.retry_count > 0
    }

    /// Merge a partial update into this record.
    ///
    /// `retry_count` is clamped so it can only go down.
    pub fn merge(&mut self, patch: BlobPatch) {
        if let Some(state) = patch.state {
            self.state = state;
        }
        if let Some(upload_url) = patch.upload_url {
            self.upload_url = upload_url;
        }
        if let Some(storage_key) = patch.storage_key {
            self.storage_key = storage_key;
        }
        if let Some(preview_url) = patch.preview_url {
            self.preview_url = preview_url;
        }
        if let Some(url) = patch.url {
            self.url = url;
        }
        if let Some(blob_id) = patch.blob_id {
            self.blob_id = blob_id;
        }
        if let Some(attachment_id) = patch.attachment_id {
            self.attachment_id = attachment_id;
        }
        if let Some(error_message) = patch.error_message {
            self.error_message = error_message;
        }
        if let Some(retry_count) = patch.retry_count {
            self.retry_count = self.retry_count.min(retry_count);
        }
        self.updated_at = Utc::now();
    }
}

/// Partial update of a [`BlobRecord`].
///
/// Outer `None` leaves a field untouched; `Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BlobPatch {
    pub state: Option<BlobState>,
    pub upload_url: Option<Option<String>>,
    pub storage_key: Option<Option<String>>,
    pub preview_url: Option<Option<String>>,
    pub url: Option<Option<String>>,
    pub blob_id: Option<Option<BlobId>>,
    pub attachment_id: Option<Option<AttachmentId>>,
    pub error_message: Option<Option<String>>,
    pub retry_count: Option<u32>,
}

impl BlobPatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Patch that only moves the state
    pub fn state(state: BlobState) -> Self {
        Self {
            state: Some(state),
            ..Self::default()
        }
    }

    pub fn with_state(mut self, state: BlobState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_upload_url(mut self, url: impl Into<String>) -> Self {
        self.upload_url = Some(Some(url.into()));
        self
    }

    pub fn with_storage_key(mut self, key: impl Into<String>) -> Self {
        self.storage_key = Some(Some(key.into()));
        self
    }

    pub fn with_preview_url(mut self, url: Option<String>) -> Self {
        self.preview_url = Some(url);
        self
    }

    pub fn with_url(mut self, url: Option<String>) -> Self {
        self.url = Some(url);
        self
    }

    pub fn with_blob_id(mut self, blob_id: BlobId) -> Self {
        self.blob_id = Some(Some(blob_id));
        self
    }

    pub fn with_attachment_id(mut self, attachment_id: Option<AttachmentId>) -> Self {
        self.attachment_id = Some(attachment_id);
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(Some(message.into()));
        self
    }

    pub fn clear_error(mut self) -> Self {
        self.error_message = Some(None);
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = Some(retry_count);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> BlobRecord {
        let file = SelectedFile::new("cat.png", "image/png", vec![1u8, 2, 3]);
        BlobRecord::selected(Checksum::from("abc"), &file, 3)
    }

    #[test]
    fn selected_record_copies_file_metadata() {
        let r = record();
        assert_eq!(r.state, BlobState::SelectedForUpload);
        assert_eq!(r.name.as_deref(), Some("cat.png"));
        assert_eq!(r.mime_type.as_deref(), Some("image/png"));
        assert_eq!(r.size, Some(3));
        assert_eq!(r.retry_count, 3);
        assert!(!r.has_error());
    }

    #[test]
    fn merge_touches_only_patched_fields() {
        let mut r = record();
        r.merge(
            BlobPatch::state(BlobState::SlotReady)
                .with_upload_url("https://store/put")
                .with_storage_key("k/1"),
        );

        assert_eq!(r.state, BlobState::SlotReady);
        assert_eq!(r.upload_url.as_deref(), Some("https://store/put"));
        assert_eq!(r.storage_key.as_deref(), Some("k/1"));
        assert_eq!(r.name.as_deref(), Some("cat.png"));
        assert!(r.blob_id.is_none());
    }

    #[test]
    fn merge_can_clear_nullable_fields() {
        let mut r = record();
        r.merge(BlobPatch::new().with_error("boom"));
        assert_eq!(r.error_message.as_deref(), Some("boom"));

        r.merge(BlobPatch::new().clear_error());
        assert!(r.error_message.is_none());
    }

    #[test]
    fn merge_never_raises_retry_count() {
        let mut r = record();
        r.merge(BlobPatch::new().with_retry_count(1));
        assert_eq!(r.retry_count, 1);

        r.merge(BlobPatch::new().with_retry_count(5));
        assert_eq!(r.retry_count, 1);
    }

    #[test]
    fn record_roundtrips_through_json() {
        let r = record();
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["state"], "SELECTED_FOR_UPLOAD");
        assert_eq!(json["checksum"], "abc");

        let back: BlobRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, r);
    }
}
