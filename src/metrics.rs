use crate::partition::PartitionKey;
use crate::worker::PartitionResult;

/// Aggregate statistics over the partition results of one run.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RunSummary {
    /// Partitions with a result.
    pub partitions: usize,
    /// Partitions that completed.
    pub succeeded: usize,
    /// Partitions that failed.
    pub failed: usize,
    /// Completed partitions with zero batches.
    pub empty_partitions: usize,
    /// Artifacts on disk.
    pub artifacts: usize,
    /// Bytes on disk.
    pub bytes: u64,
    /// Transfer attempts, failed partitions included.
    pub fetch_attempts: u64,
    /// Attempts beyond one per artifact.
    pub retries: u64,
    /// Fewest batches in a completed partition.
    pub min_batches: usize,
    /// Most batches in a completed partition.
    pub max_batches: usize,
    /// Mean batches per completed partition.
    pub mean_batches: f64,
    /// Partition holding the most batches; earliest partition wins ties.
    pub busiest: Option<PartitionShare>,
}

/// One partition's share of the artifacts in a run.
#[derive(Clone, Debug, PartialEq)]
pub struct PartitionShare {
    /// The partition.
    pub partition: PartitionKey,
    /// Its batch count.
    pub batches: usize,
    /// Fraction of all artifacts in the run.
    pub share: f64,
}

impl RunSummary {
    /// Summarize results in any order; batch statistics cover succeeded partitions only.
    pub fn from_results(results: &[PartitionResult]) -> Self {
        let mut summary = RunSummary {
            partitions: results.len(),
            ..RunSummary::default()
        };
        let mut counts: Vec<(PartitionKey, usize)> = Vec::new();
        for result in results {
            summary.fetch_attempts += u64::from(result.fetch_attempts);
            if !result.is_success() {
                summary.failed += 1;
                continue;
            }
            summary.succeeded += 1;
            summary.artifacts += result.artifacts.len();
            summary.bytes += result.bytes;
            if result.artifacts.is_empty() {
                summary.empty_partitions += 1;
            }
            counts.push((result.partition, result.artifacts.len()));
        }
        summary.retries = summary
            .fetch_attempts
            .saturating_sub(summary.artifacts as u64);

        if counts.is_empty() {
            return summary;
        }
        counts.sort();
        summary.min_batches = counts.iter().map(|(_, n)| *n).min().unwrap_or(0);
        summary.max_batches = counts.iter().map(|(_, n)| *n).max().unwrap_or(0);
        summary.mean_batches = summary.artifacts as f64 / counts.len() as f64;
        summary.busiest = counts
            .iter()
            .rev()
            .max_by_key(|(_, batches)| *batches)
            .map(|(partition, batches)| PartitionShare {
                partition: *partition,
                batches: *batches,
                share: if summary.artifacts == 0 {
                    0.0
                } else {
                    *batches as f64 / summary.artifacts as f64
                },
            });
        summary
    }
}
