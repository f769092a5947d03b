#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

/// Command-line front end used by the `lakefetch` binary.
pub mod cli;
/// Run configuration, retry policy, and upstream range descriptors.
pub mod config;
/// Centralized naming and default-value constants.
pub mod constants;
/// Lazy batch discovery by existence probes.
pub mod discovery;
/// Single-file download with retries and validation.
pub mod fetch;
/// Remote addressing and local placement of batch files.
pub mod layout;
/// Top-level run orchestration.
pub mod materializer;
/// Aggregate run statistics.
pub mod metrics;
/// Month partitions and date-range planning.
pub mod partition;
/// Reading a materialized dataset back as one logical dataset.
pub mod reader;
/// Bounded partition scheduling with timeouts and fail-fast.
pub mod scheduler;
/// Remote and local I/O (HTTP today; other stores plug in via `RemoteStore`).
pub mod transport;
/// Shared type aliases.
pub mod types;
/// Structural validation of downloaded artifacts.
pub mod validate;
/// Per-partition materialization with rollback.
pub mod worker;

mod errors;

#[cfg(test)]
mod test_support;

pub use config::{
    BackoffPolicy, BackoffStrategy, DateRangeDescriptor, MaterializerConfig, RetryPolicy,
};
pub use discovery::ProbeSequence;
pub use errors::{FaultKind, MaterializeError};
pub use fetch::{FetchOutcome, RetryingFetcher};
pub use layout::{BatchLocator, DatasetLayout, LocalArtifact};
pub use materializer::{Materializer, RunReport};
pub use metrics::RunSummary;
pub use partition::{DateRange, PartitionKey, plan_partitions};
pub use reader::{MaterializedDataset, MaterializedDatasetReader};
pub use scheduler::{CancelToken, ConcurrencyScheduler, ScheduleReport, SchedulerConfig};
pub use transport::{HttpRemote, ProbeOutcome, RemoteStore, TransferError};
pub use types::{ArtifactExtension, DatasetName, RemoteUrl};
pub use validate::{ArtifactStats, ArtifactValidator, ParquetFooterValidator};
pub use worker::{PartitionResult, PartitionState, PartitionWorker};
