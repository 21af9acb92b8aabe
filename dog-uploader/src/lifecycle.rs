//! Per-record upload state machine.
//!
//! Policy only: [`BlobLifecycle::advance`] decides which single gateway call a
//! record needs next, [`BlobLifecycle::begin`] produces the pending-substate
//! patch that guards it, [`BlobLifecycle::perform`] issues the call and
//! normalizes whatever comes back, and [`BlobLifecycle::fold`] turns the
//! outcome into a patch for the collection. Scheduling lives in the driver.

use bytes::Bytes;
use tracing::debug;

use crate::gateway::{
    GatewayError, LinkReceipt, LinkRequest, MutationGateway, RegisterRequest, Registration,
    SlotGrant, SlotRequest, Step, TransferRequest, UnlinkRequest,
};
use crate::{BlobPatch, BlobRecord, BlobState, Checksum, Owner, StepFailure, UploaderConfig};

/// Everything `advance` looks at besides the record itself
#[derive(Debug, Clone, Copy, Default)]
pub struct Inputs<'a> {
    /// Raw bytes of the selected file, if still held
    pub file: Option<&'a Bytes>,

    /// Explicit caller request: ignores the auto flags, a parked error and
    /// the retry budget
    pub manual: bool,
}

impl<'a> Inputs<'a> {
    pub fn automatic(file: Option<&'a Bytes>) -> Self {
        Self { file, manual: false }
    }

    pub fn manual(file: Option<&'a Bytes>) -> Self {
        Self { file, manual: true }
    }
}

/// The next thing to do for one record
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    RequestSlot(SlotRequest),
    Transfer(TransferRequest),
    Register(RegisterRequest),
    Link(LinkRequest),
    Unlink(UnlinkRequest),
    /// Record reached `UNLINKED` and must leave the collection
    Discard(Checksum),
}

impl Effect {
    /// Pipeline step this effect performs; `None` for `Discard`
    pub fn step(&self) -> Option<Step> {
        match self {
            Self::RequestSlot(_) => Some(Step::RequestSlot),
            Self::Transfer(_) => Some(Step::Transfer),
            Self::Register(_) => Some(Step::Register),
            Self::Link(_) => Some(Step::Link),
            Self::Unlink(_) => Some(Step::Unlink),
            Self::Discard(_) => None,
        }
    }

    pub fn checksum(&self) -> &Checksum {
        match self {
            Self::RequestSlot(req) => &req.checksum,
            Self::Transfer(req) => &req.checksum,
            Self::Register(req) => &req.checksum,
            Self::Link(req) => &req.checksum,
            Self::Unlink(req) => &req.checksum,
            Self::Discard(checksum) => checksum,
        }
    }
}

/// Normalized successful reply of one step
#[derive(Debug, Clone, PartialEq)]
pub enum StepSuccess {
    Slot(SlotGrant),
    Transferred,
    Registered(Registration),
    Linked(LinkReceipt),
    Unlinked,
}

/// Where a removal request sends a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    /// Linked remotely: go through the unlink branch
    MarkForUnlink,
    /// Nothing remote to undo: drop it now
    Discard,
    /// Already on the removal branch
    AlreadyRemoving,
}

/// Transition policy for blob records
#[derive(Debug, Clone, PartialEq)]
pub struct BlobLifecycle {
    auto_upload: bool,
    auto_link: bool,
    owner: Option<Owner>,
}

impl BlobLifecycle {
    pub fn new(auto_upload: bool, auto_link: bool, owner: Option<Owner>) -> Self {
        Self {
            auto_upload,
            auto_link,
            owner,
        }
    }

    pub fn from_config(config: &UploaderConfig) -> Self {
        Self::new(config.auto_upload, config.auto_link, config.owner.clone())
    }

    pub fn auto_upload(&self) -> bool {
        self.auto_upload
    }

    /// Also governs link-sync: unlinking on removal
    pub fn auto_link(&self) -> bool {
        self.auto_link
    }

    pub fn owner(&self) -> Option<&Owner> {
        self.owner.as_ref()
    }

    pub(crate) fn set_auto_upload(&mut self, enabled: bool) {
        self.auto_upload = enabled;
    }

    pub(crate) fn set_auto_link(&mut self, enabled: bool) {
        self.auto_link = enabled;
    }

    pub(crate) fn set_owner(&mut self, owner: Option<Owner>) {
        self.owner = owner;
    }

    /// Decide the next effect for a record, if any.
    ///
    /// Pending substates never yield an effect; that is what keeps a record
    /// to one outstanding call.
    pub fn advance(&self, record: &BlobRecord, inputs: Inputs<'_>) -> Option<Effect> {
        if record.state == BlobState::Unlinked {
            return Some(Effect::Discard(record.checksum.clone()));
        }
        if record.state.is_pending() {
            return None;
        }
        // A parked failure waits for its error to be cleared
        if !inputs.manual && record.has_error() {
            return None;
        }

        let checksum = record.checksum.clone();
        match record.state {
            BlobState::SelectedForUpload => {
                if !(inputs.manual || self.auto_upload) {
                    return None;
                }
                let (name, mime_type, size) = file_metadata(record)?;
                Some(Effect::RequestSlot(SlotRequest {
                    checksum,
                    name,
                    mime_type,
                    size,
                }))
            }
            BlobState::SlotReady => {
                let upload_url = record.upload_url.clone()?;
                let file = inputs.file?.clone();
                Some(Effect::Transfer(TransferRequest {
                    checksum,
                    upload_url,
                    file,
                }))
            }
            BlobState::Transferred => {
                let storage_key = record.storage_key.clone()?;
                let (name, mime_type, size) = file_metadata(record)?;
                Some(Effect::Register(RegisterRequest {
                    checksum,
                    storage_key,
                    name,
                    mime_type,
                    size,
                }))
            }
            BlobState::Registered => {
                if !(inputs.manual || self.auto_link) {
                    return None;
                }
                let owner = self.owner.as_ref()?;
                let blob_id = record.blob_id.clone()?;
                Some(Effect::Link(LinkRequest {
                    checksum,
                    blob_id,
                    owner_id: owner.id.clone(),
                    owner_type: owner.kind.clone(),
                }))
            }
            BlobState::MarkedForUnlink => {
                if !(inputs.manual || self.auto_link) {
                    return None;
                }
                let attachment_id = record.attachment_id.clone()?;
                Some(Effect::Unlink(UnlinkRequest {
                    checksum,
                    attachment_id,
                }))
            }
            _ => None,
        }
    }

    /// Patch that moves a record into the pending substate of `step`
    pub fn begin(&self, step: Step) -> BlobPatch {
        BlobPatch::state(step.pending_state()).clear_error()
    }

    /// Issue the effect against the gateway.
    ///
    /// Rejections, transport errors and mismatched reply checksums all come
    /// back as the step's [`StepFailure`].
    pub async fn perform(
        &self,
        gateway: &dyn MutationGateway,
        effect: &Effect,
    ) -> Result<StepSuccess, StepFailure> {
        let step = match effect.step() {
            Some(step) => step,
            None => return Ok(StepSuccess::Unlinked),
        };
        let expected = effect.checksum();

        debug!(checksum = %expected, step = %step, "Issuing gateway call");

        let reply = match effect {
            Effect::RequestSlot(req) => gateway
                .request_upload_slot(req)
                .await
                .map(|grant| (grant.checksum.clone(), StepSuccess::Slot(grant))),
            Effect::Transfer(req) => gateway
                .transfer_file(req)
                .await
                .map(|receipt| (receipt.checksum, StepSuccess::Transferred)),
            Effect::Register(req) => gateway
                .register_blob(req)
                .await
                .map(|reg| (reg.checksum.clone(), StepSuccess::Registered(reg))),
            Effect::Link(req) => gateway
                .link_attachment(req)
                .await
                .map(|receipt| (receipt.checksum.clone(), StepSuccess::Linked(receipt))),
            Effect::Unlink(req) => gateway
                .unlink_attachment(req)
                .await
                .map(|receipt| (receipt.checksum, StepSuccess::Unlinked)),
            Effect::Discard(_) => Ok((expected.clone(), StepSuccess::Unlinked)),
        };

        let (echoed, success) = reply.map_err(|err| failure_from_gateway(step, &err))?;

        if &echoed != expected {
            return Err(StepFailure::for_step(
                step,
                format!("Reply for {} does not match request {}", echoed, expected),
            ));
        }

        if let StepSuccess::Slot(grant) = &success {
            if grant.upload_url.is_none() && grant.blob_id.is_none() && grant.storage_key.is_empty() {
                return Err(StepFailure::for_step(step, "Upload slot carried no storage key"));
            }
        }

        Ok(success)
    }

    /// Turn a step outcome into the patch that lands it on the record.
    ///
    /// `snapshot` is the record as it was when the call was claimed.
    pub fn fold(
        &self,
        snapshot: &BlobRecord,
        step: Step,
        outcome: Result<StepSuccess, StepFailure>,
    ) -> BlobPatch {
        let success = match outcome {
            Ok(success) => success,
            Err(failure) => {
                return BlobPatch::state(step.parked_state())
                    .with_error(failure.message())
                    .with_retry_count(snapshot.retry_count.saturating_sub(1));
            }
        };

        let patch = BlobPatch::new().clear_error();
        match success {
            StepSuccess::Slot(grant) => {
                if let Some(upload_url) = grant.upload_url {
                    patch
                        .with_state(BlobState::SlotReady)
                        .with_upload_url(upload_url)
                        .with_storage_key(grant.storage_key)
                } else if let Some(blob_id) = grant.blob_id {
                    let url = grant.url.or_else(|| snapshot.url.clone());
                    let preview_url = grant
                        .preview_url
                        .or_else(|| url.clone())
                        .or_else(|| snapshot.preview_url.clone());
                    patch
                        .with_state(BlobState::Registered)
                        .with_storage_key(grant.storage_key)
                        .with_blob_id(blob_id)
                        .with_url(url)
                        .with_preview_url(preview_url)
                } else {
                    patch
                        .with_state(BlobState::Transferred)
                        .with_storage_key(grant.storage_key)
                }
            }
            StepSuccess::Transferred => patch.with_state(BlobState::Transferred),
            StepSuccess::Registered(reg) => {
                let preview_url = reg.preview_url.unwrap_or_else(|| reg.url.clone());
                patch
                    .with_state(BlobState::Registered)
                    .with_blob_id(reg.blob_id)
                    .with_storage_key(reg.storage_key)
                    .with_url(Some(reg.url))
                    .with_preview_url(Some(preview_url))
            }
            StepSuccess::Linked(receipt) => patch
                .with_state(BlobState::Linked)
                .with_attachment_id(Some(receipt.attachment_id)),
            StepSuccess::Unlinked => patch
                .with_state(BlobState::Unlinked)
                .with_attachment_id(None),
        }
    }

    /// Route a removal request.
    ///
    /// Removing again a record whose unlink has failed with no retries left
    /// gives up on the remote side and drops it locally.
    pub fn route_removal(&self, record: &BlobRecord) -> Removal {
        match record.state {
            BlobState::MarkedForUnlink if record.has_error() && !record.can_retry() => {
                Removal::Discard
            }
            BlobState::MarkedForUnlink | BlobState::Unlinking => Removal::AlreadyRemoving,
            BlobState::Linked if self.auto_link && record.attachment_id.is_some() => {
                Removal::MarkForUnlink
            }
            _ => Removal::Discard,
        }
    }
}

fn file_metadata(record: &BlobRecord) -> Option<(String, String, u64)> {
    let name = record.name.clone().filter(|n| !n.is_empty())?;
    let mime_type = record.mime_type.clone().filter(|m| !m.is_empty())?;
    let size = record.size.filter(|s| *s > 0)?;
    Some((name, mime_type, size))
}

fn failure_from_gateway(step: Step, err: &GatewayError) -> StepFailure {
    StepFailure::for_step(step, err.message())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{PreviewReceipt, PreviewRequest, TransferReceipt, UnlinkReceipt};
    use crate::gateway::GatewayResult;
    use crate::{AttachmentId, BlobId, SelectedFile};
    use async_trait::async_trait;

    fn lifecycle() -> BlobLifecycle {
        BlobLifecycle::new(true, true, Some(Owner::new("post-1", "Post")))
    }

    fn selected() -> BlobRecord {
        let file = SelectedFile::new("cat.png", "image/png", vec![1u8, 2, 3]);
        BlobRecord::selected(Checksum::from("c1"), &file, 3)
    }

    #[test]
    fn selected_record_requests_a_slot() {
        let effect = lifecycle().advance(&selected(), Inputs::default()).unwrap();
        match effect {
            Effect::RequestSlot(req) => {
                assert_eq!(req.checksum, Checksum::from("c1"));
                assert_eq!(req.name, "cat.png");
                assert_eq!(req.size, 3);
            }
            other => panic!("unexpected effect {:?}", other),
        }
    }

    #[test]
    fn pending_states_never_issue() {
        let lc = lifecycle();
        for state in [
            BlobState::RequestingSlot,
            BlobState::Transferring,
            BlobState::Registering,
            BlobState::Linking,
            BlobState::Unlinking,
        ] {
            let record = selected().with_state(state);
            assert!(lc.advance(&record, Inputs::manual(None)).is_none(), "{}", state);
        }
    }

    #[test]
    fn parked_errors_block_automatic_progress() {
        let lc = lifecycle();
        let mut record = selected();
        record.error_message = Some("boom".into());
        record.retry_count = 2;
        assert!(lc.advance(&record, Inputs::default()).is_none());
        assert!(lc.advance(&record, Inputs::manual(None)).is_some());

        record.retry_count = 0;
        assert!(lc.advance(&record, Inputs::default()).is_none());
        assert!(lc.advance(&record, Inputs::manual(None)).is_some());

        record.error_message = None;
        record.retry_count = 2;
        assert!(lc.advance(&record, Inputs::default()).is_some());
    }

    #[test]
    fn empty_budget_without_error_still_progresses() {
        let mut record = selected();
        record.retry_count = 0;
        assert!(lifecycle().advance(&record, Inputs::default()).is_some());
    }

    #[test]
    fn auto_upload_off_waits_for_manual() {
        let lc = BlobLifecycle::new(false, false, None);
        assert!(lc.advance(&selected(), Inputs::default()).is_none());
        assert!(lc.advance(&selected(), Inputs::manual(None)).is_some());
    }

    #[test]
    fn transfer_needs_the_file_bytes() {
        let lc = lifecycle();
        let mut record = selected().with_state(BlobState::SlotReady);
        record.upload_url = Some("memory://upload/c1".into());

        assert!(lc.advance(&record, Inputs::default()).is_none());

        let bytes = Bytes::from_static(b"abc");
        match lc.advance(&record, Inputs::automatic(Some(&bytes))) {
            Some(Effect::Transfer(req)) => assert_eq!(req.file, bytes),
            other => panic!("unexpected effect {:?}", other),
        }
    }

    #[test]
    fn registered_links_only_with_owner_and_auto_link() {
        let record = BlobRecord::linked(Checksum::from("c1"), BlobId::from("b1"), AttachmentId::from("a1"), 3)
            .with_state(BlobState::Registered);

        assert!(lifecycle().advance(&record, Inputs::default()).is_some());
        assert!(BlobLifecycle::new(true, false, Some(Owner::new("p", "Post")))
            .advance(&record, Inputs::default())
            .is_none());
        assert!(BlobLifecycle::new(true, true, None)
            .advance(&record, Inputs::manual(None))
            .is_none());
        assert!(BlobLifecycle::new(true, false, Some(Owner::new("p", "Post")))
            .advance(&record, Inputs::manual(None))
            .is_some());
    }

    #[test]
    fn unlinked_records_are_discarded() {
        let record = selected().with_state(BlobState::Unlinked);
        assert_eq!(
            lifecycle().advance(&record, Inputs::default()),
            Some(Effect::Discard(Checksum::from("c1")))
        );
    }

    #[test]
    fn failure_parks_at_predecessor_and_spends_a_retry() {
        let snapshot = selected();
        let patch = lifecycle().fold(
            &snapshot,
            Step::RequestSlot,
            Err(StepFailure::for_step(Step::RequestSlot, "quota")),
        );
        assert_eq!(patch.state, Some(BlobState::SelectedForUpload));
        assert_eq!(patch.error_message, Some(Some("quota".to_string())));
        assert_eq!(patch.retry_count, Some(2));

        let mut exhausted = selected();
        exhausted.retry_count = 0;
        let patch = lifecycle().fold(
            &exhausted,
            Step::RequestSlot,
            Err(StepFailure::for_step(Step::RequestSlot, "")),
        );
        assert_eq!(patch.retry_count, Some(0));
        assert_eq!(patch.error_message, Some(Some("Failed to request upload slot".to_string())));
    }

    #[test]
    fn slot_shapes_pick_the_next_state() {
        let lc = lifecycle();
        let snapshot = selected();
        let grant = |upload_url: Option<&str>, blob_id: Option<&str>| SlotGrant {
            checksum: Checksum::from("c1"),
            upload_url: upload_url.map(String::from),
            storage_key: "k1".into(),
            blob_id: blob_id.map(BlobId::from),
            preview_url: None,
            url: None,
        };

        let direct = lc.fold(&snapshot, Step::RequestSlot, Ok(StepSuccess::Slot(grant(Some("u"), None))));
        assert_eq!(direct.state, Some(BlobState::SlotReady));
        assert_eq!(direct.upload_url, Some(Some("u".to_string())));

        let finalized = lc.fold(&snapshot, Step::RequestSlot, Ok(StepSuccess::Slot(grant(None, Some("b1")))));
        assert_eq!(finalized.state, Some(BlobState::Registered));
        assert_eq!(finalized.blob_id, Some(Some(BlobId::from("b1"))));

        let key_only = lc.fold(&snapshot, Step::RequestSlot, Ok(StepSuccess::Slot(grant(None, None))));
        assert_eq!(key_only.state, Some(BlobState::Transferred));
        assert_eq!(key_only.storage_key, Some(Some("k1".to_string())));
    }

    #[test]
    fn registration_falls_back_to_url_for_preview() {
        let patch = lifecycle().fold(
            &selected(),
            Step::Register,
            Ok(StepSuccess::Registered(Registration {
                checksum: Checksum::from("c1"),
                blob_id: BlobId::from("b1"),
                storage_key: "k1".into(),
                url: "https://cdn/k1".into(),
                preview_url: None,
            })),
        );
        assert_eq!(patch.preview_url, Some(Some("https://cdn/k1".to_string())));
    }

    #[test]
    fn removal_routing() {
        let lc = lifecycle();
        let linked = BlobRecord::linked(Checksum::from("c1"), BlobId::from("b1"), AttachmentId::from("a1"), 3);
        assert_eq!(lc.route_removal(&linked), Removal::MarkForUnlink);
        assert_eq!(
            BlobLifecycle::new(true, false, None).route_removal(&linked),
            Removal::Discard
        );
        assert_eq!(lc.route_removal(&selected()), Removal::Discard);
        assert_eq!(
            lc.route_removal(&linked.clone().with_state(BlobState::Unlinking)),
            Removal::AlreadyRemoving
        );

        let mut marked = linked.with_state(BlobState::MarkedForUnlink);
        marked.error_message = Some("Failed to unlink blob".into());
        assert_eq!(lc.route_removal(&marked), Removal::AlreadyRemoving);
        marked.retry_count = 0;
        assert_eq!(lc.route_removal(&marked), Removal::Discard);
    }

    struct Misbehaving;

    #[async_trait]
    impl MutationGateway for Misbehaving {
        async fn request_upload_slot(&self, _: &SlotRequest) -> GatewayResult<SlotGrant> {
            Ok(SlotGrant {
                checksum: Checksum::from("someone-else"),
                upload_url: Some("u".into()),
                storage_key: "k".into(),
                blob_id: None,
                preview_url: None,
                url: None,
            })
        }
        async fn transfer_file(&self, _: &TransferRequest) -> GatewayResult<TransferReceipt> {
            Err(GatewayError::transport(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "bucket connection reset",
            )))
        }
        async fn register_blob(&self, _: &RegisterRequest) -> GatewayResult<Registration> {
            unimplemented!()
        }
        async fn link_attachment(&self, _: &LinkRequest) -> GatewayResult<LinkReceipt> {
            unimplemented!()
        }
        async fn unlink_attachment(&self, req: &UnlinkRequest) -> GatewayResult<UnlinkReceipt> {
            Err(GatewayError::rejected(&req.checksum, ""))
        }
        async fn fetch_preview_url(&self, _: &PreviewRequest) -> GatewayResult<PreviewReceipt> {
            unimplemented!()
        }
    }

    #[tokio::test]
    async fn mismatched_reply_checksum_is_a_failure() {
        let lc = lifecycle();
        let effect = lc.advance(&selected(), Inputs::default()).unwrap();
        let failure = lc.perform(&Misbehaving, &effect).await.unwrap_err();
        assert_eq!(failure.step(), Step::RequestSlot);
    }

    #[tokio::test]
    async fn transport_errors_become_step_failures() {
        let effect = Effect::Transfer(TransferRequest {
            checksum: Checksum::from("c1"),
            upload_url: "u".into(),
            file: Bytes::from_static(b"x"),
        });
        let failure = lifecycle().perform(&Misbehaving, &effect).await.unwrap_err();
        assert_eq!(failure, StepFailure::TransferFailed("bucket connection reset".into()));
    }

    #[tokio::test]
    async fn blank_unlink_error_gets_generic_message() {
        let effect = Effect::Unlink(UnlinkRequest {
            checksum: Checksum::from("c1"),
            attachment_id: AttachmentId::from("a1"),
        });
        let failure = lifecycle().perform(&Misbehaving, &effect).await.unwrap_err();
        assert_eq!(failure, StepFailure::UnlinkFailed("Failed to unlink blob".into()));
    }
}
