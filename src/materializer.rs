use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::config::MaterializerConfig;
use crate::errors::MaterializeError;
use crate::layout::{DatasetLayout, LocalArtifact};
use crate::metrics::RunSummary;
use crate::partition::{PartitionKey, plan_partitions};
use crate::reader::MaterializedDatasetReader;
use crate::scheduler::{ConcurrencyScheduler, SchedulerConfig};
use crate::transport::fs::remove_dir_tree;
use crate::transport::{HttpRemote, RemoteStore};
use crate::validate::{ArtifactValidator, validator_for_extension};
use crate::worker::PartitionWorker;

/// Outcome of a successful materialization run.
#[derive(Clone, Debug)]
pub struct RunReport {
    /// Dataset name.
    pub dataset: String,
    /// Every planned partition, ascending.
    pub partitions: Vec<PartitionKey>,
    /// Every artifact written, sorted by partition then batch.
    pub artifacts: Vec<LocalArtifact>,
    /// Aggregate statistics.
    pub summary: RunSummary,
    /// Most partitions that ran at once.
    pub peak_in_flight: usize,
    /// When the run began, before the dataset directory was cleared.
    pub started_at: DateTime<Utc>,
    /// When the last partition was accounted for.
    pub finished_at: DateTime<Utc>,
}

/// Materializes one dataset's date range from a remote store onto local disk.
///
/// A run either succeeds for every planned partition or fails with
/// `MaterializeError::RunFailed`; no partition reported as failed leaves
/// artifacts behind.
pub struct Materializer {
    config: MaterializerConfig,
    remote: Arc<dyn RemoteStore>,
    validator: Arc<dyn ArtifactValidator>,
}

impl Materializer {
    /// Materializer that reads from HTTP using `config.request_timeout_seconds`.
    pub fn new(config: MaterializerConfig) -> Result<Self, MaterializeError> {
        config.validate()?;
        let remote = Arc::new(HttpRemote::new(config.request_timeout()));
        Self::with_remote(config, remote)
    }

    /// Materializer over any remote store.
    pub fn with_remote(
        config: MaterializerConfig,
        remote: Arc<dyn RemoteStore>,
    ) -> Result<Self, MaterializeError> {
        config.validate()?;
        let validator = validator_for_extension(&config.extension);
        Ok(Self {
            config,
            remote,
            validator,
        })
    }

    /// Replace the artifact validator chosen from the extension.
    pub fn with_validator(mut self, validator: Arc<dyn ArtifactValidator>) -> Self {
        self.validator = validator;
        self
    }

    /// Run configuration.
    pub fn config(&self) -> &MaterializerConfig {
        &self.config
    }

    /// Remote and local layout of the dataset.
    pub fn layout(&self) -> DatasetLayout {
        self.config.layout()
    }

    /// Reader over this materializer's local dataset directory.
    pub fn reader(&self) -> MaterializedDatasetReader {
        MaterializedDatasetReader::new(self.layout())
    }

    /// Plan, download, and validate every partition of the configured range.
    ///
    /// Anything previously materialized for the dataset is removed first.
    pub fn run(&self) -> Result<RunReport, MaterializeError> {
        let started_at = Utc::now();
        let range = self.config.date_range()?;
        let partitions = plan_partitions(&range);
        let layout = self.layout();
        info!(
            "[lakefetch] materializing '{}' for {} partition(s) ({} to {}) with {} worker(s)",
            layout.dataset(),
            partitions.len(),
            range.start(),
            range.end(),
            self.config.max_workers
        );

        remove_dir_tree(&layout.dataset_dir())?;

        let worker = PartitionWorker::new(
            Arc::clone(&self.remote),
            Arc::clone(&self.validator),
            layout.clone(),
            self.config.retry_policy()?,
            self.config.max_batches_per_partition,
        )
        .with_retry_corrupt_once(self.config.retry_corrupt_once);
        let scheduler = ConcurrencyScheduler::new(SchedulerConfig {
            max_workers: self.config.max_workers,
            partition_timeout: self.config.partition_timeout(),
            partition_retries: self.config.partition_retries,
            drain_timeout: self.config.cancel_grace(),
        });

        let report = scheduler.run(partitions.clone(), move |partition, cancel| {
            worker.run_cancellable(partition, cancel)
        })?;
        // Workers roll back their own faults; this covers panics and detached threads.
        for partition in report.failed_partitions() {
            if let Err(err) = remove_dir_tree(&layout.partition_dir(partition)) {
                warn!("[lakefetch] failed clearing partition {partition}: {err}");
            }
        }
        let report = report.into_result(layout.dataset())?;

        let summary = RunSummary::from_results(&report.results);
        let mut artifacts: Vec<LocalArtifact> = report
            .results
            .into_iter()
            .flat_map(|result| result.artifacts)
            .collect();
        artifacts.sort();

        info!(
            "[lakefetch] downloaded {} file(s) total for '{}' ({} bytes, {} retries)",
            artifacts.len(),
            layout.dataset(),
            summary.bytes,
            summary.retries
        );
        Ok(RunReport {
            dataset: layout.dataset().to_string(),
            partitions,
            artifacts,
            summary,
            peak_in_flight: report.peak_in_flight,
            started_at,
            finished_at: Utc::now(),
        })
    }
}
