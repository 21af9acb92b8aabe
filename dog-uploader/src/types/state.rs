use serde::{Deserialize, Serialize};
use std::fmt;

/// Position of a blob in the upload pipeline
///
/// Forward pipeline:
/// `SELECTED_FOR_UPLOAD → REQUESTING_SLOT → SLOT_READY → TRANSFERRING → TRANSFERRED
///  → REGISTERING → REGISTERED → LINKING → LINKED`
///
/// Removal branch: `MARKED_FOR_UNLINK → UNLINKING → UNLINKED`
///
/// The `*ING` states are pending substates: a gateway call is in flight and
/// no rule fires until its result is folded back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlobState {
    SelectedForUpload,
    RequestingSlot,
    SlotReady,
    Transferring,
    Transferred,
    Registering,
    Registered,
    Linking,
    Linked,
    MarkedForUnlink,
    Unlinking,
    Unlinked,
}

impl BlobState {
    /// Check if a gateway call is in flight for this state
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            Self::RequestingSlot
                | Self::Transferring
                | Self::Registering
                | Self::Linking
                | Self::Unlinking
        )
    }

    /// Stable state a pending substate falls back to when its call fails
    pub fn stable_predecessor(&self) -> Self {
        match self {
            Self::RequestingSlot => Self::SelectedForUpload,
            Self::Transferring => Self::SlotReady,
            Self::Registering => Self::Transferred,
            Self::Linking => Self::Registered,
            Self::Unlinking => Self::MarkedForUnlink,
            other => *other,
        }
    }

    /// Check if the raw file bytes are still needed
    pub fn holds_file(&self) -> bool {
        matches!(
            self,
            Self::SelectedForUpload | Self::RequestingSlot | Self::SlotReady | Self::Transferring
        )
    }

    /// Check if the record is on the removal branch (hidden from presentation)
    pub fn is_removing(&self) -> bool {
        matches!(self, Self::MarkedForUnlink | Self::Unlinking | Self::Unlinked)
    }

    /// Only registered or linked blobs may be chosen as primary
    pub fn can_be_primary(&self) -> bool {
        matches!(self, Self::Registered | Self::Linked)
    }

    /// Check whether `next` is reachable in one step through the state graph.
    /// Field-only updates (same state) are always allowed.
    pub fn can_transition_to(&self, next: BlobState) -> bool {
        use BlobState::*;

        if *self == next {
            return true;
        }

        matches!(
            (*self, next),
            (SelectedForUpload, RequestingSlot)
                | (RequestingSlot, SlotReady)
                | (RequestingSlot, Transferred)
                | (RequestingSlot, Registered)
                | (RequestingSlot, SelectedForUpload)
                | (SlotReady, Transferring)
                | (Transferring, Transferred)
                | (Transferring, SlotReady)
                | (Transferred, Registering)
                | (Registering, Registered)
                | (Registering, Transferred)
                | (Registered, Linking)
                | (Linking, Linked)
                | (Linking, Registered)
                | (Linked, MarkedForUnlink)
                | (MarkedForUnlink, Unlinking)
                | (Unlinking, Unlinked)
                | (Unlinking, MarkedForUnlink)
        )
    }

    /// Get the state name as a string
    pub fn name(&self) -> &'static str {
        match self {
            Self::SelectedForUpload => "SELECTED_FOR_UPLOAD",
            Self::RequestingSlot => "REQUESTING_SLOT",
            Self::SlotReady => "SLOT_READY",
            Self::Transferring => "TRANSFERRING",
            Self::Transferred => "TRANSFERRED",
            Self::Registering => "REGISTERING",
            Self::Registered => "REGISTERED",
            Self::Linking => "LINKING",
            Self::Linked => "LINKED",
            Self::MarkedForUnlink => "MARKED_FOR_UNLINK",
            Self::Unlinking => "UNLINKING",
            Self::Unlinked => "UNLINKED",
        }
    }
}

impl fmt::Display for BlobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_as_screaming_snake_case() {
        let s = serde_json::to_string(&BlobState::MarkedForUnlink).unwrap();
        assert_eq!(s, "\"MARKED_FOR_UNLINK\"");

        let back: BlobState = serde_json::from_str("\"SLOT_READY\"").unwrap();
        assert_eq!(back, BlobState::SlotReady);
    }

    #[test]
    fn pending_states_fall_back_to_stable_predecessors() {
        assert_eq!(BlobState::RequestingSlot.stable_predecessor(), BlobState::SelectedForUpload);
        assert_eq!(BlobState::Transferring.stable_predecessor(), BlobState::SlotReady);
        assert_eq!(BlobState::Registering.stable_predecessor(), BlobState::Transferred);
        assert_eq!(BlobState::Linking.stable_predecessor(), BlobState::Registered);
        assert_eq!(BlobState::Unlinking.stable_predecessor(), BlobState::MarkedForUnlink);
        assert_eq!(BlobState::Linked.stable_predecessor(), BlobState::Linked);
    }

    #[test]
    fn graph_allows_shortcuts_from_slot_request_only() {
        assert!(BlobState::RequestingSlot.can_transition_to(BlobState::Registered));
        assert!(BlobState::RequestingSlot.can_transition_to(BlobState::Transferred));
        assert!(!BlobState::SelectedForUpload.can_transition_to(BlobState::Registered));
        assert!(!BlobState::SlotReady.can_transition_to(BlobState::Transferred));
        assert!(!BlobState::Linked.can_transition_to(BlobState::Registered));
    }

    #[test]
    fn display_matches_name() {
        assert_eq!(BlobState::Linked.to_string(), "LINKED");
        assert_eq!(BlobState::Unlinked.name(), "UNLINKED");
    }
}
