use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use thiserror::Error;

use super::{
    GatewayError, GatewayResult, LinkReceipt, LinkRequest, MutationGateway, Operation,
    PreviewReceipt, PreviewRequest, RegisterRequest, Registration, SlotGrant, SlotRequest,
    TransferReceipt, TransferRequest, UnlinkReceipt, UnlinkRequest,
};
use crate::{AttachmentId, BlobId, Checksum, OwnerId};

/// Shape of the slot the in-memory server hands out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlotMode {
    /// Upload URL + key, the client transfers the bytes itself
    #[default]
    Direct,
    /// Key + blob id, the server already holds a finalized blob
    Finalized,
    /// Key only, the bytes are stored but not registered
    KeyOnly,
}

/// One recorded gateway invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayCall {
    pub operation: Operation,
    pub checksum: Checksum,
}

#[derive(Debug, Clone)]
enum Fault {
    Always(String),
    Next { remaining: u32, message: String },
    Throw(String),
}

/// Raised by `throw_on` to stand in for a client that blew up mid-call
#[derive(Error, Debug)]
#[error("{0}")]
struct SimulatedFault(String);

#[derive(Default)]
struct ServerState {
    slot_mode: SlotMode,
    faults: HashMap<Operation, Fault>,
    calls: Vec<GatewayCall>,
    objects: HashMap<Checksum, Bytes>,
    attachments: HashMap<AttachmentId, (BlobId, OwnerId)>,
    next_attachment: u64,
}

/// In-memory gateway for testing and development.
///
/// Simulates the upload server: slots, object storage, blob registration and
/// attachments. Failures can be scripted per operation.
pub struct MemoryGateway {
    state: Mutex<ServerState>,
    latency: Option<Duration>,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ServerState::default()),
            latency: None,
        }
    }

    pub fn with_slot_mode(self, mode: SlotMode) -> Self {
        self.state.lock().slot_mode = mode;
        self
    }

    /// Delay every call, so concurrent passes actually overlap
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn set_slot_mode(&self, mode: SlotMode) {
        self.state.lock().slot_mode = mode;
    }

    /// Fail every call to `operation` with a failure response
    pub fn fail_always(&self, operation: Operation, message: impl Into<String>) {
        self.state
            .lock()
            .faults
            .insert(operation, Fault::Always(message.into()));
    }

    /// Fail the next `times` calls to `operation`, then succeed again
    pub fn fail_next(&self, operation: Operation, times: u32, message: impl Into<String>) {
        if times == 0 {
            return;
        }
        self.state.lock().faults.insert(
            operation,
            Fault::Next {
                remaining: times,
                message: message.into(),
            },
        );
    }

    /// Make every call to `operation` error out at the transport level
    pub fn throw_on(&self, operation: Operation, message: impl Into<String>) {
        self.state
            .lock()
            .faults
            .insert(operation, Fault::Throw(message.into()));
    }

    pub fn clear_failures(&self) {
        self.state.lock().faults.clear();
    }

    /// Every call made so far, in issue order
    pub fn calls(&self) -> Vec<GatewayCall> {
        self.state.lock().calls.clone()
    }

    pub fn call_count(&self, operation: Operation) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|call| call.operation == operation)
            .count()
    }

    pub fn total_calls(&self) -> usize {
        self.state.lock().calls.len()
    }

    /// Bytes received by `transfer_file` for a checksum
    pub fn stored_object(&self, checksum: &Checksum) -> Option<Bytes> {
        self.state.lock().objects.get(checksum).cloned()
    }

    /// Number of attachments currently linked
    pub fn attachment_count(&self) -> usize {
        self.state.lock().attachments.len()
    }

    /// Log the call and decide whether it fails.
    async fn enter(&self, operation: Operation, checksum: &Checksum) -> GatewayResult<()> {
        self.state.lock().calls.push(GatewayCall {
            operation,
            checksum: checksum.clone(),
        });

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state.lock();
        let mut exhausted = false;
        let fault = match state.faults.get_mut(&operation) {
            None => return Ok(()),
            Some(Fault::Always(message)) => GatewayError::rejected(checksum, message.clone()),
            Some(Fault::Throw(message)) => GatewayError::transport(SimulatedFault(message.clone())),
            Some(Fault::Next { remaining, message }) => {
                *remaining = remaining.saturating_sub(1);
                exhausted = *remaining == 0;
                GatewayError::rejected(checksum, message.clone())
            }
        };
        if exhausted {
            state.faults.remove(&operation);
        }
        Err(fault)
    }
}

impl Default for MemoryGateway {
    fn default() -> Self {
        Self::new()
    }
}

fn storage_key_for(checksum: &Checksum) -> String {
    format!("uploads/{}", checksum)
}

fn object_url(key: &str) -> String {
    format!("memory://objects/{}", key)
}

#[async_trait]
impl MutationGateway for MemoryGateway {
    async fn request_upload_slot(&self, request: &SlotRequest) -> GatewayResult<SlotGrant> {
        self.enter(Operation::RequestSlot, &request.checksum).await?;

        let storage_key = storage_key_for(&request.checksum);
        let mode = self.state.lock().slot_mode;
        let grant = match mode {
            SlotMode::Direct => SlotGrant {
                checksum: request.checksum.clone(),
                upload_url: Some(format!("memory://upload/{}", request.checksum)),
                storage_key,
                blob_id: None,
                preview_url: None,
                url: None,
            },
            SlotMode::Finalized => SlotGrant {
                checksum: request.checksum.clone(),
                upload_url: None,
                url: Some(object_url(&storage_key)),
                preview_url: None,
                blob_id: Some(BlobId(format!("blob-{}", request.checksum))),
                storage_key,
            },
            SlotMode::KeyOnly => SlotGrant {
                checksum: request.checksum.clone(),
                upload_url: None,
                storage_key,
                blob_id: None,
                preview_url: None,
                url: None,
            },
        };
        Ok(grant)
    }

    async fn transfer_file(&self, request: &TransferRequest) -> GatewayResult<TransferReceipt> {
        self.enter(Operation::Transfer, &request.checksum).await?;

        self.state
            .lock()
            .objects
            .insert(request.checksum.clone(), request.file.clone());
        Ok(TransferReceipt {
            checksum: request.checksum.clone(),
        })
    }

    async fn register_blob(&self, request: &RegisterRequest) -> GatewayResult<Registration> {
        self.enter(Operation::Register, &request.checksum).await?;

        Ok(Registration {
            checksum: request.checksum.clone(),
            blob_id: BlobId(format!("blob-{}", request.checksum)),
            storage_key: request.storage_key.clone(),
            url: object_url(&request.storage_key),
            preview_url: None,
        })
    }

    async fn link_attachment(&self, request: &LinkRequest) -> GatewayResult<LinkReceipt> {
        self.enter(Operation::Link, &request.checksum).await?;

        let mut state = self.state.lock();
        state.next_attachment += 1;
        let attachment_id = AttachmentId(format!("att-{}", state.next_attachment));
        state.attachments.insert(
            attachment_id.clone(),
            (request.blob_id.clone(), request.owner_id.clone()),
        );
        Ok(LinkReceipt {
            checksum: request.checksum.clone(),
            attachment_id,
        })
    }

    async fn unlink_attachment(&self, request: &UnlinkRequest) -> GatewayResult<UnlinkReceipt> {
        self.enter(Operation::Unlink, &request.checksum).await?;

        // Attachments made before this gateway existed are unknown; unlinking them still succeeds.
        self.state.lock().attachments.remove(&request.attachment_id);
        Ok(UnlinkReceipt {
            checksum: request.checksum.clone(),
        })
    }

    async fn fetch_preview_url(&self, request: &PreviewRequest) -> GatewayResult<PreviewReceipt> {
        self.enter(Operation::FetchPreview, &request.checksum).await?;

        Ok(PreviewReceipt {
            checksum: request.checksum.clone(),
            preview_url: format!("memory://preview/{}", request.storage_key),
        })
    }
}
