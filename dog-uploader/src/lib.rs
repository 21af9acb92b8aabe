//! # dog-uploader: Upload Pipeline for Checksum-Identified Blobs
//!
//! Drives a bounded collection of selected files through a remote pipeline:
//! upload-slot issuance, direct object-store transfer, blob registration,
//! owner linking and unlinking. Every stage may fail; failures park the
//! record at its last stable state until the error is cleared, within a
//! bounded retry budget.
//!
//! ## Pieces
//!
//! - [`BlobLifecycle`]: pure per-record policy, `advance(record, inputs) -> Option<Effect>`
//! - [`BlobCollection`]: dedup, capacity, ordering and the primary pointer;
//!   the only mutation path is [`RecordStore::apply_update`]
//! - [`MutationGateway`]: the six remote operations, implemented by the host
//! - [`UploadDriver`]: runs passes, manual link/retry and the background worker
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use dog_uploader::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> UploaderResult<()> {
//! let config = UploaderConfig::default()
//!     .with_auto_link(true)
//!     .with_owner(Owner::new("post-17", "Post"));
//!
//! let collection = BlobCollection::new(config).into_shared();
//! let driver = UploadDriver::new(collection.clone(), Arc::new(MemoryGateway::new()));
//!
//! let file = SelectedFile::new("cat.png", "image/png", vec![1u8, 2, 3]);
//! let checksum = Sha256Checksum.hash(&file.bytes);
//! collection.lock().add_from_file(file, checksum.clone())?;
//!
//! driver.run_until_idle().await;
//! assert_eq!(collection.lock().get(&checksum).map(|r| r.state), Some(BlobState::Linked));
//! # Ok(())
//! # }
//! ```

pub mod types;
pub mod error;
pub mod gateway;
pub mod checksum;
pub mod config;
pub mod lifecycle;
pub mod collection;
pub mod driver;
pub mod observability;

pub use types::*;
pub use error::{StepFailure, UploaderError, UploaderResult};
pub use gateway::{GatewayError, GatewayResult, MutationGateway, Operation, Step};
pub use checksum::{ChecksumService, Sha256Checksum};
pub use config::{PrimarySource, UploaderConfig};
pub use lifecycle::{BlobLifecycle, Effect, Inputs, Removal, StepSuccess};
pub use collection::{AddOutcome, BlobCollection, CollectionHooks, RecordStore, SharedCollection};
pub use driver::{DriverHandle, PassReport, UploadDriver};
pub use observability::{MetricsSnapshot, UploadMetrics};

/// Common imports
pub mod prelude {
    pub use crate::{
        AddOutcome, BlobCollection, BlobLifecycle, BlobRecord, BlobState, Checksum,
        ChecksumService, CollectionEvent, CollectionHooks, MutationGateway, Owner, RecordStore,
        SelectedFile, Sha256Checksum, UploadDriver, UploaderConfig, UploaderError, UploaderResult,
    };
    pub use crate::gateway::memory::{MemoryGateway, SlotMode};
}
