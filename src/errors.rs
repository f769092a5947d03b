use std::fmt;
use std::io;

use thiserror::Error;

use crate::partition::PartitionKey;
use crate::types::{DatasetName, RemoteUrl};

/// Error type for planning, discovery, transfer, validation, and scheduling failures.
#[derive(Debug, Error)]
pub enum MaterializeError {
    #[error("invalid date range: {0}")]
    InvalidRange(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("existence probe for '{url}' failed: {reason}")]
    Probe { url: RemoteUrl, reason: String },
    #[error("transfer of '{url}' failed: {reason}")]
    Fetch { url: RemoteUrl, reason: String },
    #[error("transfer of '{url}' failed after {attempts} attempts: {reason}")]
    RetriesExhausted {
        url: RemoteUrl,
        attempts: u32,
        reason: String,
    },
    #[error("artifact '{path}' failed structural validation: {reason}")]
    CorruptArtifact { path: String, reason: String },
    #[error("partition {partition} served more than {limit} batches")]
    SafetyLimitExceeded { partition: PartitionKey, limit: u32 },
    #[error("partition {partition} exceeded its {timeout_secs}s wall-clock budget")]
    PartitionTimeout {
        partition: PartitionKey,
        timeout_secs: u64,
    },
    #[error("worker for partition {partition} panicked")]
    WorkerPanicked { partition: PartitionKey },
    #[error("artifact '{path}' does not match the dataset schema: {details}")]
    SchemaMismatch { path: String, details: String },
    #[error(
        "materializing '{dataset}' failed at partition {partition} ({kind}); failed partitions: {}: {source}",
        format_partitions(.failed_partitions)
    )]
    RunFailed {
        dataset: DatasetName,
        partition: PartitionKey,
        kind: FaultKind,
        failed_partitions: Vec<PartitionKey>,
        source: Box<MaterializeError>,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Stable classification of a failure, used in run reports and logs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FaultKind {
    /// Bad date range input.
    InvalidRange,
    /// Bad configuration values.
    Configuration,
    /// Discovery probe returned an unexpected status or failed.
    Probe,
    /// Non-transient transfer failure.
    Fetch,
    /// Transient failures persisted past the retry budget.
    RetriesExhausted,
    /// Downloaded content failed validation.
    CorruptArtifact,
    /// Discovery did not terminate within the batch cap.
    SafetyLimitExceeded,
    /// Partition exceeded its wall-clock budget.
    Timeout,
    /// Worker thread panicked.
    Panic,
    /// Artifacts disagree on schema.
    SchemaMismatch,
    /// Local filesystem failure.
    Io,
}

impl MaterializeError {
    /// Fault class of this error. `RunFailed` reports the class of its root cause.
    pub fn kind(&self) -> FaultKind {
        match self {
            Self::InvalidRange(_) => FaultKind::InvalidRange,
            Self::Configuration(_) => FaultKind::Configuration,
            Self::Probe { .. } => FaultKind::Probe,
            Self::Fetch { .. } => FaultKind::Fetch,
            Self::RetriesExhausted { .. } => FaultKind::RetriesExhausted,
            Self::CorruptArtifact { .. } => FaultKind::CorruptArtifact,
            Self::SafetyLimitExceeded { .. } => FaultKind::SafetyLimitExceeded,
            Self::PartitionTimeout { .. } => FaultKind::Timeout,
            Self::WorkerPanicked { .. } => FaultKind::Panic,
            Self::SchemaMismatch { .. } => FaultKind::SchemaMismatch,
            Self::RunFailed { kind, .. } => *kind,
            Self::Io(_) => FaultKind::Io,
        }
    }

    /// Partition named by the error, when it carries one.
    pub fn partition(&self) -> Option<PartitionKey> {
        match self {
            Self::SafetyLimitExceeded { partition, .. }
            | Self::PartitionTimeout { partition, .. }
            | Self::WorkerPanicked { partition }
            | Self::RunFailed { partition, .. } => Some(*partition),
            _ => None,
        }
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FaultKind::InvalidRange => "invalid-range",
            FaultKind::Configuration => "configuration",
            FaultKind::Probe => "probe",
            FaultKind::Fetch => "fetch",
            FaultKind::RetriesExhausted => "retries-exhausted",
            FaultKind::CorruptArtifact => "corrupt-artifact",
            FaultKind::SafetyLimitExceeded => "safety-limit-exceeded",
            FaultKind::Timeout => "timeout",
            FaultKind::Panic => "panic",
            FaultKind::SchemaMismatch => "schema-mismatch",
            FaultKind::Io => "io",
        };
        f.write_str(label)
    }
}

fn format_partitions(partitions: &[PartitionKey]) -> String {
    partitions
        .iter()
        .map(PartitionKey::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
