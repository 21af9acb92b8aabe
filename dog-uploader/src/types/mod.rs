pub mod ids;
pub mod state;
pub mod record;
pub mod events;

pub use ids::{AttachmentId, BlobId, Checksum, Owner, OwnerId};
pub use state::BlobState;
pub use record::{BlobPatch, BlobRecord, SelectedFile};
pub use events::CollectionEvent;
