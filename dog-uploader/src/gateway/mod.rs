//! Remote operations the pipeline depends on.
//!
//! The gateway is the only place where network or storage transport lives.
//! Every reply echoes the request checksum so results that complete out of
//! order can be correlated back to their record.

pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::{AttachmentId, BlobId, BlobState, Checksum, OwnerId};

/// Result type for gateway calls
pub type GatewayResult<T> = Result<T, GatewayError>;

/// What a gateway call can fail with
#[derive(Error, Debug)]
pub enum GatewayError {
    /// The remote side answered with a failure response
    #[error("Gateway rejected request for {checksum}: {message}")]
    Rejected { checksum: Checksum, message: String },

    /// The call itself blew up (network, serialization, panicking client, ...)
    #[error("Gateway transport error: {source}")]
    Transport {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl GatewayError {
    /// Create a failure response
    pub fn rejected<S: Into<String>>(checksum: &Checksum, message: S) -> Self {
        Self::Rejected {
            checksum: checksum.clone(),
            message: message.into(),
        }
    }

    /// Create a transport error from any error type
    pub fn transport<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Transport {
            source: Box::new(error),
        }
    }

    /// Message to surface on the record
    pub fn message(&self) -> String {
        match self {
            Self::Rejected { message, .. } => message.clone(),
            Self::Transport { source } => source.to_string(),
        }
    }
}

/// The five mutating pipeline steps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Step {
    RequestSlot,
    Transfer,
    Register,
    Link,
    Unlink,
}

impl Step {
    /// Message used when a failure carries no text of its own
    pub fn generic_failure(&self) -> &'static str {
        match self {
            Self::RequestSlot => "Failed to request upload slot",
            Self::Transfer => "Failed to transfer file",
            Self::Register => "Failed to register blob",
            Self::Link => "Failed to link attachment",
            Self::Unlink => "Failed to unlink blob",
        }
    }

    /// In-flight marker a record sits in while this step's call is outstanding
    pub fn pending_state(&self) -> BlobState {
        match self {
            Self::RequestSlot => BlobState::RequestingSlot,
            Self::Transfer => BlobState::Transferring,
            Self::Register => BlobState::Registering,
            Self::Link => BlobState::Linking,
            Self::Unlink => BlobState::Unlinking,
        }
    }

    /// Stable state a failed call parks the record in
    pub fn parked_state(&self) -> BlobState {
        self.pending_state().stable_predecessor()
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(Operation::from(*self).name())
    }
}

/// Every gateway operation, mutating or not
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    RequestSlot,
    Transfer,
    Register,
    Link,
    Unlink,
    FetchPreview,
}

impl Operation {
    pub const ALL: [Operation; 6] = [
        Operation::RequestSlot,
        Operation::Transfer,
        Operation::Register,
        Operation::Link,
        Operation::Unlink,
        Operation::FetchPreview,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::RequestSlot => "request_upload_slot",
            Self::Transfer => "transfer_file",
            Self::Register => "register_blob",
            Self::Link => "link_attachment",
            Self::Unlink => "unlink_attachment",
            Self::FetchPreview => "fetch_preview_url",
        }
    }

    pub(crate) fn index(&self) -> usize {
        match self {
            Self::RequestSlot => 0,
            Self::Transfer => 1,
            Self::Register => 2,
            Self::Link => 3,
            Self::Unlink => 4,
            Self::FetchPreview => 5,
        }
    }
}

impl From<Step> for Operation {
    fn from(step: Step) -> Self {
        match step {
            Step::RequestSlot => Self::RequestSlot,
            Step::Transfer => Self::Transfer,
            Step::Register => Self::Register,
            Step::Link => Self::Link,
            Step::Unlink => Self::Unlink,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Ask for a destination to upload a file to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotRequest {
    pub checksum: Checksum,
    pub name: String,
    pub mime_type: String,
    pub size: u64,
}

/// Upload slot issued by the server.
///
/// Three shapes are meaningful:
/// - `upload_url` + `storage_key`: transfer the bytes next
/// - `storage_key` + `blob_id`: the server already holds a finalized blob
/// - `storage_key` only: the bytes are already stored, register next
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotGrant {
    pub checksum: Checksum,
    pub upload_url: Option<String>,
    pub storage_key: String,
    pub blob_id: Option<BlobId>,
    pub preview_url: Option<String>,
    pub url: Option<String>,
}

/// Push the raw bytes to the issued upload URL.
///
/// The bytes are shared with the collection, not copied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub checksum: Checksum,
    pub upload_url: String,
    pub file: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferReceipt {
    pub checksum: Checksum,
}

/// Create the durable blob record for stored bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterRequest {
    pub checksum: Checksum,
    pub storage_key: String,
    pub name: String,
    pub mime_type: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub checksum: Checksum,
    pub blob_id: BlobId,
    pub storage_key: String,
    pub url: String,
    pub preview_url: Option<String>,
}

/// Associate a registered blob with its owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkRequest {
    pub checksum: Checksum,
    pub blob_id: BlobId,
    pub owner_id: OwnerId,
    pub owner_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkReceipt {
    pub checksum: Checksum,
    pub attachment_id: AttachmentId,
}

/// Remove the association between blob and owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnlinkRequest {
    pub checksum: Checksum,
    pub attachment_id: AttachmentId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnlinkReceipt {
    pub checksum: Checksum,
}

/// Resolve a displayable URL for a stored object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviewRequest {
    pub checksum: Checksum,
    pub storage_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreviewReceipt {
    pub checksum: Checksum,
    pub preview_url: String,
}

/// Remote operations behind the upload pipeline - implemented by the host
#[async_trait]
pub trait MutationGateway: Send + Sync {
    /// Request an upload slot (URL and/or key) for a file
    async fn request_upload_slot(&self, request: &SlotRequest) -> GatewayResult<SlotGrant>;

    /// Transfer file bytes directly to the object store
    async fn transfer_file(&self, request: &TransferRequest) -> GatewayResult<TransferReceipt>;

    /// Register the stored object as a durable blob record
    async fn register_blob(&self, request: &RegisterRequest) -> GatewayResult<Registration>;

    /// Link a registered blob to its owner
    async fn link_attachment(&self, request: &LinkRequest) -> GatewayResult<LinkReceipt>;

    /// Unlink an attachment
    async fn unlink_attachment(&self, request: &UnlinkRequest) -> GatewayResult<UnlinkReceipt>;

    /// Fetch a preview URL for a stored object
    async fn fetch_preview_url(&self, request: &PreviewRequest) -> GatewayResult<PreviewReceipt>;
}
