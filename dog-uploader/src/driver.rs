//! Scheduling for the upload pipeline.
//!
//! A pass claims every actionable record under the collection lock, moving
//! each into its pending substate, then runs the claimed gateway calls
//! concurrently on the current task. Each result is folded back through
//! [`RecordStore::apply_update`] as soon as it arrives.

use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::collection::{ClaimToken, RecordStore, SharedCollection};
use crate::gateway::{MutationGateway, Operation, PreviewRequest, Step};
use crate::lifecycle::{BlobLifecycle, Effect, Inputs, StepSuccess};
use crate::observability::UploadMetrics;
use crate::{BlobPatch, BlobRecord, BlobState, Checksum, StepFailure, UploaderError, UploaderResult};

/// What one pass did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassReport {
    pub issued: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub discarded: usize,
}

impl PassReport {
    /// Nothing was issued or discarded
    pub fn is_idle(&self) -> bool {
        self.issued == 0 && self.discarded == 0
    }

    fn absorb(&mut self, other: PassReport) {
        self.issued += other.issued;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.discarded += other.discarded;
    }
}

/// A gateway call reserved for one record
struct Claim {
    token: ClaimToken,
    step: Step,
    snapshot: BlobRecord,
    effect: Effect,
}

struct Claims {
    lifecycle: BlobLifecycle,
    claims: Vec<Claim>,
    discarded: usize,
}

/// Drives a shared collection through the pipeline against a gateway
#[derive(Clone)]
pub struct UploadDriver {
    collection: SharedCollection,
    gateway: Arc<dyn MutationGateway>,
    metrics: Arc<UploadMetrics>,
}

impl UploadDriver {
    pub fn new(collection: SharedCollection, gateway: Arc<dyn MutationGateway>) -> Self {
        Self {
            collection,
            gateway,
            metrics: Arc::new(UploadMetrics::new()),
        }
    }

    pub fn collection(&self) -> &SharedCollection {
        &self.collection
    }

    pub fn metrics(&self) -> &UploadMetrics {
        &self.metrics
    }

    /// Evaluate every record once and await the calls that issues
    #[instrument(skip(self))]
    pub async fn run_pass(&self) -> PassReport {
        let claims = self.claim(None, false);
        self.execute_all(claims).await
    }

    /// Run passes until one issues nothing, bounded by `max_passes`
    #[instrument(skip(self))]
    pub async fn run_until_idle(&self) -> PassReport {
        let max_passes = self.collection.lock().config().max_passes;
        let mut total = PassReport::default();

        for pass in 0..max_passes {
            let report = self.run_pass().await;
            total.absorb(report);
            if report.is_idle() {
                debug!(passes = pass + 1, "Pipeline idle");
                return total;
            }
        }

        warn!(max_passes, "Pipeline still busy after pass limit");
        total
    }

    /// Apply the automatic rules to a single record
    #[instrument(skip(self, checksum), fields(checksum = %checksum))]
    pub async fn evaluate(&self, checksum: &Checksum) -> UploaderResult<PassReport> {
        if !self.collection.lock().contains(checksum) {
            return Err(UploaderError::not_found(checksum));
        }
        let claims = self.claim(Some(checksum), false);
        Ok(self.execute_all(claims).await)
    }

    /// Link a registered record now, whatever the auto-link flag says.
    ///
    /// A gateway failure parks the record like any other step failure and is
    /// also returned.
    #[instrument(skip(self, checksum), fields(checksum = %checksum))]
    pub async fn link(&self, checksum: &Checksum) -> UploaderResult<()> {
        let (lifecycle, claim) = {
            let mut guard = self.collection.lock();
            if guard.is_locked() {
                return Err(UploaderError::Locked);
            }
            let record = guard.get(checksum).ok_or_else(|| UploaderError::not_found(checksum))?;
            let not_linkable = UploaderError::NotLinkable {
                checksum: checksum.clone(),
                state: record.state,
            };
            if record.state != BlobState::Registered {
                return Err(not_linkable);
            }

            let lifecycle = guard.lifecycle().clone();
            let effect = match lifecycle.advance(record, Inputs::manual(None)) {
                Some(effect @ Effect::Link(_)) => effect,
                _ => return Err(not_linkable),
            };
            let snapshot = record.clone();
            let token = guard
                .claim(checksum, lifecycle.begin(Step::Link))
                .ok_or(not_linkable)?;

            (
                lifecycle,
                Claim {
                    token,
                    step: Step::Link,
                    snapshot,
                    effect,
                },
            )
        };

        self.metrics.record_issued(Operation::Link);
        self.execute(&lifecycle, claim).await?;
        Ok(())
    }

    /// Run the record's next step once, ignoring the retry budget and the
    /// auto flags. Also the way out for a record that has used up its retries.
    #[instrument(skip(self, checksum), fields(checksum = %checksum))]
    pub async fn retry(&self, checksum: &Checksum) -> UploaderResult<PassReport> {
        let cleared = self.collection.lock().retry(checksum)?;
        debug!(cleared, "Manual retry");

        let claims = self.claim(Some(checksum), true);
        Ok(self.execute_all(claims).await)
    }

    /// Fetch a fresh preview URL. Neither state nor retries change.
    #[instrument(skip(self, checksum), fields(checksum = %checksum))]
    pub async fn refresh_preview(&self, checksum: &Checksum) -> UploaderResult<String> {
        let storage_key = {
            let guard = self.collection.lock();
            let record = guard.get(checksum).ok_or_else(|| UploaderError::not_found(checksum))?;
            record.storage_key.clone().ok_or_else(|| UploaderError::PreviewFailed {
                checksum: checksum.clone(),
                message: "record has no storage key".to_string(),
            })?
        };

        let request = PreviewRequest {
            checksum: checksum.clone(),
            storage_key,
        };
        self.metrics.record_issued(Operation::FetchPreview);

        let receipt = match self.gateway.fetch_preview_url(&request).await {
            Ok(receipt) if &receipt.checksum == checksum => receipt,
            Ok(receipt) => {
                self.metrics.record_failure(Operation::FetchPreview);
                return Err(UploaderError::PreviewFailed {
                    checksum: checksum.clone(),
                    message: format!("reply for {} does not match", receipt.checksum),
                });
            }
            Err(err) => {
                self.metrics.record_failure(Operation::FetchPreview);
                warn!(error = %err, "Preview fetch failed");
                return Err(UploaderError::PreviewFailed {
                    checksum: checksum.clone(),
                    message: err.message(),
                });
            }
        };

        self.metrics.record_success(Operation::FetchPreview);
        self.collection.lock().apply_update(
            checksum,
            BlobPatch::new().with_preview_url(Some(receipt.preview_url.clone())),
        );
        Ok(receipt.preview_url)
    }

    /// Run the pipeline in the background whenever the collection changes
    pub fn start(&self) -> DriverHandle {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let events = self.collection.lock().subscribe();
        let driver = self.clone();

        let join_handle = tokio::spawn(async move { driver.work(events, shutdown_rx).await });
        info!("Upload driver started");

        DriverHandle {
            shutdown_tx,
            join_handle,
        }
    }

    async fn work(
        self,
        mut events: tokio::sync::broadcast::Receiver<crate::CollectionEvent>,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) {
        loop {
            // Passes are never cancelled: a claimed record would stay pending forever.
            self.run_until_idle().await;

            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("Upload driver shutdown requested");
                    break;
                }
                event = events.recv() => match event {
                    Ok(_) | Err(RecvError::Lagged(_)) => loop {
                        match events.try_recv() {
                            Ok(_) | Err(TryRecvError::Lagged(_)) => continue,
                            Err(_) => break,
                        }
                    },
                    Err(RecvError::Closed) => break,
                },
            }
        }

        info!("Upload driver stopped");
    }

    /// Reserve calls under the lock. Claimed records leave this function in
    /// their pending substate, so nothing else can claim them.
    fn claim(&self, only: Option<&Checksum>, manual: bool) -> Claims {
        let mut guard = self.collection.lock();
        let lifecycle = guard.lifecycle().clone();

        let checksums: Vec<Checksum> = match only {
            Some(checksum) => vec![checksum.clone()],
            None => guard.records().iter().map(|r| r.checksum.clone()).collect(),
        };

        let mut claims = Vec::new();
        let mut discarded = 0;

        for checksum in checksums {
            let (effect, snapshot) = match guard.get(&checksum) {
                Some(record) => {
                    let inputs = Inputs {
                        file: guard.file(&checksum),
                        manual,
                    };
                    (lifecycle.advance(record, inputs), record.clone())
                }
                None => continue,
            };

            let effect = match effect {
                Some(effect) => effect,
                None => continue,
            };

            let step = match effect.step() {
                Some(step) => step,
                None => {
                    if guard.discard(&checksum) {
                        self.metrics.record_discard();
                        discarded += 1;
                    }
                    continue;
                }
            };

            if let Some(token) = guard.claim(&checksum, lifecycle.begin(step)) {
                self.metrics.record_issued(step.into());
                claims.push(Claim {
                    token,
                    step,
                    snapshot,
                    effect,
                });
            }
        }

        Claims {
            lifecycle,
            claims,
            discarded,
        }
    }

    async fn execute_all(&self, claims: Claims) -> PassReport {
        let Claims {
            lifecycle,
            claims,
            discarded,
        } = claims;

        let mut report = PassReport {
            issued: claims.len(),
            discarded,
            ..PassReport::default()
        };
        if claims.is_empty() {
            return report;
        }

        debug!(issued = report.issued, "Running claimed steps");
        let outcomes = join_all(claims.into_iter().map(|claim| self.execute(&lifecycle, claim))).await;

        for outcome in outcomes {
            match outcome {
                Ok(()) => report.succeeded += 1,
                Err(_) => report.failed += 1,
            }
        }
        report
    }

    /// Issue one claimed call and land its outcome
    async fn execute(&self, lifecycle: &BlobLifecycle, claim: Claim) -> Result<(), StepFailure> {
        let outcome = lifecycle.perform(self.gateway.as_ref(), &claim.effect).await;
        let checksum = &claim.snapshot.checksum;
        let operation = Operation::from(claim.step);

        let result = match &outcome {
            Ok(success) => {
                self.metrics.record_success(operation);
                if matches!(success, StepSuccess::Unlinked) {
                    info!(checksum = %checksum, "Blob unlinked");
                } else {
                    debug!(checksum = %checksum, step = %claim.step, "Step succeeded");
                }
                Ok(())
            }
            Err(failure) => {
                self.metrics.record_failure(operation);
                warn!(
                    checksum = %checksum,
                    step = %claim.step,
                    retries_left = claim.snapshot.retry_count.saturating_sub(1),
                    error = %failure,
                    "Step failed"
                );
                Err(failure.clone())
            }
        };

        let patch = lifecycle.fold(&claim.snapshot, claim.step, outcome);
        if !self.collection.lock().settle(checksum, claim.token, patch) {
            debug!(checksum = %checksum, "Result arrived for a record that has left");
        }
        result
    }
}

/// Handle for the background driver
pub struct DriverHandle {
    shutdown_tx: oneshot::Sender<()>,
    join_handle: JoinHandle<()>,
}

impl DriverHandle {
    /// Stop after the current pass settles
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.join_handle.await {
            error!("Upload driver join error: {}", e);
        }
    }
}
