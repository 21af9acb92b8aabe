//! Ordered, bounded set of blob records.
//!
//! The collection enforces dedup, capacity, ordering and the primary pointer,
//! and is the only place records are mutated. Pipeline results land through
//! [`RecordStore::apply_update`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::checksum::ChecksumService;
use crate::config::PrimarySource;
use crate::lifecycle::{BlobLifecycle, Removal};
use crate::{
    BlobPatch, BlobRecord, BlobState, Checksum, CollectionEvent, Owner, SelectedFile,
    UploaderConfig, UploaderError, UploaderResult,
};

/// Collection shared between the host and the driver.
///
/// The lock is only ever held for synchronous sections, never across an `.await`.
pub type SharedCollection = Arc<Mutex<BlobCollection>>;

/// The single mutation path for pipeline results
pub trait RecordStore {
    /// Merge `patch` into the record with `checksum`.
    ///
    /// Returns false without touching anything when the record is gone or the
    /// patch would break the state graph.
    fn apply_update(&mut self, checksum: &Checksum, patch: BlobPatch) -> bool;
}

/// Host callbacks, invoked synchronously while the collection is borrowed
pub trait CollectionHooks: Send + Sync {
    /// The record list changed
    fn on_change(&self, _records: &[BlobRecord]) {}

    /// The primary pointer changed, or a change is requested from an external owner
    fn on_primary(&self, _primary: Option<&Checksum>) {}
}

/// Result of offering one file to the collection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Added,
    Duplicate,
    AtCapacity,
}

/// Identifies one outstanding gateway call for a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ClaimToken(u64);

pub struct BlobCollection {
    config: UploaderConfig,
    lifecycle: BlobLifecycle,
    records: Vec<BlobRecord>,
    files: HashMap<Checksum, Bytes>,
    in_flight: HashMap<Checksum, ClaimToken>,
    next_claim: u64,
    primary: Option<Checksum>,
    locked: bool,
    hooks: Option<Arc<dyn CollectionHooks>>,
    events: broadcast::Sender<CollectionEvent>,
}

impl BlobCollection {
    pub fn new(config: UploaderConfig) -> Self {
        Self::with_records(config, Vec::new())
    }

    /// Load previously persisted records, e.g. when editing an existing owner.
    ///
    /// First occurrence of a checksum wins, the list is cut to `max_items`,
    /// pending substates fall back to their stable predecessor and a primary
    /// that is not a member is dropped.
    pub fn with_records(config: UploaderConfig, records: Vec<BlobRecord>) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));

        let mut seen = HashSet::new();
        let records: Vec<BlobRecord> = records
            .into_iter()
            .filter(|r| r.state != BlobState::Unlinked)
            .filter(|r| seen.insert(r.checksum.clone()))
            .take(config.max_items)
            .map(|mut r| {
                if r.state.is_pending() {
                    r.state = r.state.stable_predecessor();
                }
                r
            })
            .collect();

        let primary = config
            .primary
            .clone()
            .filter(|p| records.iter().any(|r| &r.checksum == p));

        Self {
            lifecycle: BlobLifecycle::from_config(&config),
            config,
            records,
            files: HashMap::new(),
            in_flight: HashMap::new(),
            next_claim: 0,
            primary,
            locked: false,
            hooks: None,
            events,
        }
    }

    /// Wrap for sharing with a driver
    pub fn into_shared(self) -> SharedCollection {
        Arc::new(Mutex::new(self))
    }

    pub fn config(&self) -> &UploaderConfig {
        &self.config
    }

    pub fn lifecycle(&self) -> &BlobLifecycle {
        &self.lifecycle
    }

    pub fn set_owner(&mut self, owner: Option<Owner>) {
        self.config.owner = owner.clone();
        self.lifecycle.set_owner(owner);
        self.emit(CollectionEvent::PolicyChanged { at: Utc::now() });
    }

    pub fn set_auto_upload(&mut self, enabled: bool) {
        self.config.auto_upload = enabled;
        self.lifecycle.set_auto_upload(enabled);
        self.emit(CollectionEvent::PolicyChanged { at: Utc::now() });
    }

    pub fn set_auto_link(&mut self, enabled: bool) {
        self.config.auto_link = enabled;
        self.lifecycle.set_auto_link(enabled);
        self.emit(CollectionEvent::PolicyChanged { at: Utc::now() });
    }

    /// While locked, caller-facing mutations fail with [`UploaderError::Locked`].
    /// In-flight pipeline results still land.
    pub fn set_locked(&mut self, locked: bool) {
        self.locked = locked;
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn set_hooks(&mut self, hooks: Arc<dyn CollectionHooks>) {
        self.hooks = Some(hooks);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CollectionEvent> {
        self.events.subscribe()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// All records in display order
    pub fn records(&self) -> &[BlobRecord] {
        &self.records
    }

    /// Records not on the removal branch
    pub fn visible_records(&self) -> Vec<&BlobRecord> {
        self.records.iter().filter(|r| !r.state.is_removing()).collect()
    }

    pub fn get(&self, checksum: &Checksum) -> Option<&BlobRecord> {
        self.records.iter().find(|r| &r.checksum == checksum)
    }

    pub fn contains(&self, checksum: &Checksum) -> bool {
        self.position(checksum).is_some()
    }

    /// Raw bytes still held for a record
    pub fn file(&self, checksum: &Checksum) -> Option<&Bytes> {
        self.files.get(checksum)
    }

    pub fn primary(&self) -> Option<&Checksum> {
        self.primary.as_ref()
    }

    pub fn remaining_capacity(&self) -> usize {
        self.config.max_items.saturating_sub(self.records.len())
    }

    /// Nothing left for the automatic pipeline to do
    pub fn is_settled(&self) -> bool {
        let auto_link = self.lifecycle.auto_link();
        self.records.iter().all(|r| match r.state {
            BlobState::Linked => true,
            BlobState::Registered => !auto_link,
            _ => false,
        })
    }

    pub fn has_errors(&self) -> bool {
        self.records.iter().any(|r| r.has_error())
    }

    /// Offer one selected file. Existing checksums and a full collection are no-ops.
    pub fn add_from_file(&mut self, file: SelectedFile, checksum: Checksum) -> UploaderResult<AddOutcome> {
        self.ensure_unlocked()?;

        if self.contains(&checksum) {
            debug!(checksum = %checksum, "Ignoring duplicate selection");
            return Ok(AddOutcome::Duplicate);
        }
        if self.records.len() >= self.config.max_items {
            debug!(checksum = %checksum, max_items = self.config.max_items, "Collection at capacity");
            return Ok(AddOutcome::AtCapacity);
        }

        let record = BlobRecord::selected(checksum.clone(), &file, self.config.max_retries);
        self.records.push(record);
        self.files.insert(checksum.clone(), file.bytes);

        info!(checksum = %checksum, name = %file.name, "Blob selected for upload");
        self.emit(CollectionEvent::Added {
            checksum,
            at: Utc::now(),
        });
        self.notify_change();
        Ok(AddOutcome::Added)
    }

    /// Hash and offer a batch of files, one outcome per file
    pub fn add_files(
        &mut self,
        files: Vec<SelectedFile>,
        hasher: &dyn ChecksumService,
    ) -> UploaderResult<Vec<AddOutcome>> {
        self.ensure_unlocked()?;

        files
            .into_iter()
            .map(|file| {
                let checksum = hasher.hash(&file.bytes);
                self.add_from_file(file, checksum)
            })
            .collect()
    }

    /// Request removal of a record.
    ///
    /// Linked records go through the unlink branch when link-sync is on;
    /// anything else leaves immediately, even with a call in flight.
    pub fn remove(&mut self, checksum: &Checksum) -> UploaderResult<Removal> {
        self.ensure_unlocked()?;

        let record = self.get(checksum).ok_or_else(|| UploaderError::not_found(checksum))?;
        let route = self.lifecycle.route_removal(record);

        match route {
            Removal::MarkForUnlink => {
                self.apply_update(checksum, BlobPatch::state(BlobState::MarkedForUnlink).clear_error());
                self.drop_primary_if(checksum);
            }
            Removal::Discard => {
                self.discard(checksum);
            }
            Removal::AlreadyRemoving => {}
        }
        Ok(route)
    }

    /// Move `from` to the position currently held by `to`
    pub fn reorder(&mut self, from: &Checksum, to: &Checksum) -> UploaderResult<()> {
        self.ensure_unlocked()?;

        let from_idx = self.position(from).ok_or_else(|| UploaderError::not_found(from))?;
        let to_idx = self.position(to).ok_or_else(|| UploaderError::not_found(to))?;
        if from_idx == to_idx {
            return Ok(());
        }

        let record = self.records.remove(from_idx);
        self.records.insert(to_idx, record);

        self.emit(CollectionEvent::Reordered { at: Utc::now() });
        self.notify_change();
        Ok(())
    }

    /// Clear a parked error so the next pass runs the step again.
    ///
    /// Only records with retries left are cleared; returns whether anything
    /// changed. An exhausted record stays parked until a forced
    /// [`UploadDriver::retry`](crate::UploadDriver::retry).
    pub fn retry(&mut self, checksum: &Checksum) -> UploaderResult<bool> {
        self.ensure_unlocked()?;

        let record = self.get(checksum).ok_or_else(|| UploaderError::not_found(checksum))?;
        if !record.has_error() || !record.can_retry() {
            return Ok(false);
        }
        Ok(self.apply_update(checksum, BlobPatch::new().clear_error()))
    }

    /// Make a registered or linked record the primary
    pub fn set_primary(&mut self, checksum: &Checksum) -> UploaderResult<()> {
        self.ensure_unlocked()?;

        let record = self.get(checksum).ok_or_else(|| UploaderError::not_found(checksum))?;
        if !record.state.can_be_primary() {
            return Err(UploaderError::NotPrimaryEligible {
                checksum: checksum.clone(),
                state: record.state,
            });
        }
        self.publish_primary(Some(checksum.clone()));
        Ok(())
    }

    pub fn clear_primary(&mut self) -> UploaderResult<()> {
        self.ensure_unlocked()?;
        self.publish_primary(None);
        Ok(())
    }

    /// Take over a primary chosen by an external owner
    pub fn adopt_primary(&mut self, primary: Option<Checksum>) -> UploaderResult<()> {
        if let Some(checksum) = &primary {
            if !self.contains(checksum) {
                return Err(UploaderError::not_found(checksum));
            }
        }
        if self.primary != primary {
            self.primary = primary.clone();
            self.emit(CollectionEvent::PrimaryChanged {
                primary,
                at: Utc::now(),
            });
        }
        Ok(())
    }

    /// Drop a record for good, releasing its file bytes
    pub(crate) fn discard(&mut self, checksum: &Checksum) -> bool {
        let idx = match self.position(checksum) {
            Some(idx) => idx,
            None => return false,
        };

        self.records.remove(idx);
        self.files.remove(checksum);
        self.in_flight.remove(checksum);
        self.drop_primary_if(checksum);

        info!(checksum = %checksum, "Blob removed from collection");
        self.emit(CollectionEvent::Removed {
            checksum: checksum.clone(),
            at: Utc::now(),
        });
        self.notify_change();
        true
    }

    /// Move a record into a pending substate and hand out the token its
    /// result must come back with
    pub(crate) fn claim(&mut self, checksum: &Checksum, patch: BlobPatch) -> Option<ClaimToken> {
        if !self.apply_update(checksum, patch) {
            return None;
        }
        self.next_claim += 1;
        let token = ClaimToken(self.next_claim);
        self.in_flight.insert(checksum.clone(), token);
        Some(token)
    }

    /// Land the result of a claimed call.
    ///
    /// Results whose claim is no longer current are dropped, which covers a
    /// record removed and selected again while the call was out.
    pub(crate) fn settle(&mut self, checksum: &Checksum, token: ClaimToken, patch: BlobPatch) -> bool {
        if self.in_flight.get(checksum) != Some(&token) {
            debug!(checksum = %checksum, "Dropping result of a stale claim");
            return false;
        }
        self.in_flight.remove(checksum);
        self.apply_update(checksum, patch)
    }

    fn position(&self, checksum: &Checksum) -> Option<usize> {
        self.records.iter().position(|r| &r.checksum == checksum)
    }

    fn ensure_unlocked(&self) -> UploaderResult<()> {
        if self.locked {
            return Err(UploaderError::Locked);
        }
        Ok(())
    }

    fn publish_primary(&mut self, primary: Option<Checksum>) {
        match self.config.primary_source {
            PrimarySource::Internal => {
                if self.primary == primary {
                    return;
                }
                self.primary = primary.clone();
                if let Some(hooks) = &self.hooks {
                    hooks.on_primary(primary.as_ref());
                }
                self.emit(CollectionEvent::PrimaryChanged {
                    primary,
                    at: Utc::now(),
                });
            }
            PrimarySource::External => {
                if let Some(hooks) = &self.hooks {
                    hooks.on_primary(primary.as_ref());
                }
                self.emit(CollectionEvent::PrimaryRequested {
                    primary,
                    at: Utc::now(),
                });
            }
        }
    }

    /// The pointer must never name a record that is leaving
    fn drop_primary_if(&mut self, checksum: &Checksum) {
        if self.primary.as_ref() != Some(checksum) {
            return;
        }
        self.primary = None;
        if let Some(hooks) = &self.hooks {
            hooks.on_primary(None);
        }
        let event = match self.config.primary_source {
            PrimarySource::Internal => CollectionEvent::PrimaryChanged {
                primary: None,
                at: Utc::now(),
            },
            PrimarySource::External => CollectionEvent::PrimaryRequested {
                primary: None,
                at: Utc::now(),
            },
        };
        self.emit(event);
    }

    fn emit(&self, event: CollectionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn notify_change(&self) {
        if let Some(hooks) = &self.hooks {
            hooks.on_change(&self.records);
        }
    }
}

impl RecordStore for BlobCollection {
    fn apply_update(&mut self, checksum: &Checksum, patch: BlobPatch) -> bool {
        let idx = match self.position(checksum) {
            Some(idx) => idx,
            None => {
                debug!(checksum = %checksum, "Dropping update for record no longer in collection");
                return false;
            }
        };

        let current = self.records[idx].state;
        if let Some(next) = patch.state {
            if !current.can_transition_to(next) {
                warn!(checksum = %checksum, from = %current, to = %next, "Rejected state transition");
                return false;
            }
        }

        self.records[idx].merge(patch);
        let state = self.records[idx].state;

        if state == BlobState::Unlinked {
            return self.discard(checksum);
        }
        if !state.holds_file() {
            self.files.remove(checksum);
        }
        if state == BlobState::Linked && current != BlobState::Linked {
            info!(checksum = %checksum, "Blob linked");
        }

        self.emit(CollectionEvent::Updated {
            checksum: checksum.clone(),
            state,
            at: Utc::now(),
        });
        self.notify_change();
        true
    }
}
