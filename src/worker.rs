use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::RetryPolicy;
use crate::discovery::ProbeSequence;
use crate::errors::MaterializeError;
use crate::fetch::{FetchOutcome, RetryingFetcher};
use crate::layout::{BatchLocator, DatasetLayout, LocalArtifact};
use crate::partition::PartitionKey;
use crate::scheduler::CancelToken;
use crate::transport::RemoteStore;
use crate::transport::fs::{remove_dir_tree, remove_empty_dir_best_effort, remove_file_best_effort};
use crate::validate::ArtifactValidator;

/// Lifecycle of one partition inside a worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PartitionState {
    /// Not started.
    Pending,
    /// Probing for the next batch.
    Discovering,
    /// Downloading batch `batch`.
    Fetching {
        /// 1-based batch number.
        batch: u32,
    },
    /// Every discovered batch is on disk and valid.
    Complete,
    /// A fault occurred; everything written for the partition was removed.
    Failed,
}

/// Outcome of materializing one partition.
#[derive(Debug)]
pub struct PartitionResult {
    /// Partition this result describes.
    pub partition: PartitionKey,
    /// Artifacts on disk, in batch order. Always empty on failure.
    pub artifacts: Vec<LocalArtifact>,
    /// Bytes written across all artifacts.
    pub bytes: u64,
    /// Transfer attempts across all batches, including retries.
    pub fetch_attempts: u32,
    /// Wall-clock time spent on the partition.
    pub elapsed: Duration,
    /// The fault that failed the partition, if any.
    pub error: Option<MaterializeError>,
}

impl PartitionResult {
    /// A failed result with no artifacts.
    pub fn failed(partition: PartitionKey, error: MaterializeError, elapsed: Duration) -> Self {
        Self {
            partition,
            artifacts: Vec::new(),
            bytes: 0,
            fetch_attempts: 0,
            elapsed,
            error: Some(error),
        }
    }

    /// True when the partition completed.
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Final state of the partition.
    pub fn state(&self) -> PartitionState {
        if self.is_success() {
            PartitionState::Complete
        } else {
            PartitionState::Failed
        }
    }
}

/// Materializes one partition at a time: discovery and fetch interleaved,
/// all-or-nothing on disk.
///
/// The worker owns its partition directory for the duration of a run. It
/// holds only shared, immutable handles, so one instance serves every
/// scheduler thread.
#[derive(Clone)]
pub struct PartitionWorker {
    remote: Arc<dyn RemoteStore>,
    validator: Arc<dyn ArtifactValidator>,
    layout: DatasetLayout,
    policy: RetryPolicy,
    max_batches: u32,
    retry_corrupt_once: bool,
}

impl PartitionWorker {
    /// Create a worker.
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        validator: Arc<dyn ArtifactValidator>,
        layout: DatasetLayout,
        policy: RetryPolicy,
        max_batches: u32,
    ) -> Self {
        Self {
            remote,
            validator,
            layout,
            policy,
            max_batches,
            retry_corrupt_once: true,
        }
    }

    /// Refetch a batch once when its content fails validation.
    pub fn with_retry_corrupt_once(mut self, enabled: bool) -> Self {
        self.retry_corrupt_once = enabled;
        self
    }

    /// Layout the worker writes into.
    pub fn layout(&self) -> &DatasetLayout {
        &self.layout
    }

    /// Materialize `partition`, replacing anything previously on disk for it.
    pub fn run(&self, partition: PartitionKey) -> PartitionResult {
        self.run_cancellable(partition, &CancelToken::default())
    }

    /// Like `run`, but stops before the next probe or fetch once `cancel` is
    /// raised, rolling back like any other fault.
    pub fn run_cancellable(
        &self,
        partition: PartitionKey,
        cancel: &CancelToken,
    ) -> PartitionResult {
        let started = Instant::now();
        let dir = self.layout.partition_dir(partition);
        let mut progress = Progress::new(partition);

        let outcome = remove_dir_tree(&dir)
            .map_err(MaterializeError::from)
            .and_then(|()| self.materialize(partition, cancel, &mut progress));

        match outcome {
            Ok(()) => {
                progress.enter(PartitionState::Complete);
                if progress.artifacts.is_empty() {
                    remove_empty_dir_best_effort(&dir);
                }
                info!(
                    "[lakefetch] partition {} complete: {} batch(es), {} bytes",
                    partition,
                    progress.artifacts.len(),
                    progress.bytes
                );
                PartitionResult {
                    partition,
                    artifacts: progress.artifacts,
                    bytes: progress.bytes,
                    fetch_attempts: progress.fetch_attempts,
                    elapsed: started.elapsed(),
                    error: None,
                }
            }
            Err(err) => {
                progress.enter(PartitionState::Failed);
                warn!(
                    "[lakefetch] partition {} failed ({}): {err}; rolling back {} artifact(s)",
                    partition,
                    err.kind(),
                    progress.artifacts.len()
                );
                rollback(&progress.artifacts, &dir);
                PartitionResult {
                    fetch_attempts: progress.fetch_attempts,
                    ..PartitionResult::failed(partition, err, started.elapsed())
                }
            }
        }
    }

    fn materialize(
        &self,
        partition: PartitionKey,
        cancel: &CancelToken,
        progress: &mut Progress,
    ) -> Result<(), MaterializeError> {
        let fetcher =
            RetryingFetcher::new(self.remote.as_ref(), self.validator.as_ref(), self.policy);
        let outcome = self.fetch_all(&fetcher, partition, cancel, progress);
        progress.fetch_attempts = fetcher.attempts();
        outcome
    }

    fn fetch_all(
        &self,
        fetcher: &RetryingFetcher<'_>,
        partition: PartitionKey,
        cancel: &CancelToken,
        progress: &mut Progress,
    ) -> Result<(), MaterializeError> {
        progress.enter(PartitionState::Discovering);
        let mut probes = ProbeSequence::new(
            self.remote.as_ref(),
            &self.layout,
            partition,
            self.max_batches,
        );
        loop {
            cancel.check(partition)?;
            let Some(locator) = probes.next() else {
                return Ok(());
            };
            let locator = locator?;
            progress.enter(PartitionState::Fetching {
                batch: locator.batch,
            });
            let path = self.layout.local_path(&locator);
            let outcome = self.fetch_batch(fetcher, &locator, &path, cancel)?;
            progress.bytes += outcome.bytes;
            progress.artifacts.push(LocalArtifact {
                partition,
                batch: locator.batch,
                path,
            });
            progress.enter(PartitionState::Discovering);
        }
    }

    fn fetch_batch(
        &self,
        fetcher: &RetryingFetcher<'_>,
        locator: &BatchLocator,
        path: &Path,
        cancel: &CancelToken,
    ) -> Result<FetchOutcome, MaterializeError> {
        cancel.check(locator.partition)?;
        let url = self.layout.remote_url(locator);
        match fetcher.fetch(&url, path) {
            Err(MaterializeError::CorruptArtifact { reason, .. }) if self.retry_corrupt_once => {
                warn!(
                    "[lakefetch] {locator} failed validation ({reason}); fetching it once more"
                );
                cancel.check(locator.partition)?;
                fetcher.fetch(&url, path)
            }
            other => other,
        }
    }
}

struct Progress {
    partition: PartitionKey,
    state: PartitionState,
    artifacts: Vec<LocalArtifact>,
    bytes: u64,
    fetch_attempts: u32,
}

impl Progress {
    fn new(partition: PartitionKey) -> Self {
        Self {
            partition,
            state: PartitionState::Pending,
            artifacts: Vec::new(),
            bytes: 0,
            fetch_attempts: 0,
        }
    }

    fn enter(&mut self, next: PartitionState) {
        debug!(partition = %self.partition, from = ?self.state, to = ?next, "partition state");
        self.state = next;
    }
}

/// Best-effort removal of everything a failed partition wrote.
fn rollback(artifacts: &[LocalArtifact], dir: &Path) {
    for artifact in artifacts {
        remove_file_best_effort(&artifact.path);
    }
    remove_empty_dir_best_effort(dir);
}
