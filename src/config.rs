use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::defaults;
use crate::errors::MaterializeError;
use crate::layout::DatasetLayout;
use crate::partition::DateRange;
use crate::types::{ArtifactExtension, DatasetName};

/// Delay shape between transfer attempts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// Same delay before every retry.
    Fixed,
    /// Delay doubles on each retry, capped at `backoff_max_seconds`.
    #[default]
    Exponential,
}

/// Resolved backoff policy.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum BackoffPolicy {
    /// Constant delay.
    Fixed(Duration),
    /// `base * 2^(retry - 1)`, never above `max`.
    Exponential {
        /// Delay before the first retry.
        base: Duration,
        /// Upper bound on any single delay.
        max: Duration,
    },
}

impl BackoffPolicy {
    /// Delay before retry number `retry` (1-based), without jitter.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        match *self {
            BackoffPolicy::Fixed(delay) => delay,
            BackoffPolicy::Exponential { base, max } => {
                let exponent = retry.saturating_sub(1).min(31);
                base.saturating_mul(1u32 << exponent).min(max)
            }
        }
    }
}

/// Retry budget and backoff for transient transfer faults.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
    /// Delay between attempts.
    pub backoff: BackoffPolicy,
    /// Fraction of each delay added as random extra wait (`0.0` disables).
    pub jitter: f64,
}

impl RetryPolicy {
    /// Total attempts including the first.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Policy with no delays, convenient for tests and local mirrors.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            backoff: BackoffPolicy::Fixed(Duration::ZERO),
            jitter: 0.0,
        }
    }
}

/// Upstream descriptor naming the months a dataset should cover.
///
/// Example: `{"start_year": 2022, "start_month": 3, "end_year": 2024, "end_month": 12}`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRangeDescriptor {
    /// First year.
    pub start_year: Option<u32>,
    /// First month.
    pub start_month: Option<u32>,
    /// Last year (inclusive).
    pub end_year: Option<u32>,
    /// Last month (inclusive).
    pub end_month: Option<u32>,
}

impl DateRangeDescriptor {
    /// Parse a descriptor from JSON text.
    pub fn from_json(text: &str) -> Result<Self, MaterializeError> {
        serde_json::from_str(text)
            .map_err(|err| MaterializeError::InvalidRange(format!("bad descriptor: {err}")))
    }

    /// Validate into a `DateRange`.
    pub fn to_range(&self) -> Result<DateRange, MaterializeError> {
        DateRange::from_optional(
            self.start_year,
            self.start_month,
            self.end_year,
            self.end_month,
        )
    }
}

/// Run configuration for materializing one dataset.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaterializerConfig {
    /// Dataset name; first remote and local path segment.
    pub dataset_name: DatasetName,
    /// Remote host prefix, e.g. `https://fastopendata.org`.
    pub base_url: String,
    /// Local root; the dataset lands under `<root_dir>/<dataset_name>`.
    pub root_dir: PathBuf,
    /// Batch file extension without the dot.
    pub extension: ArtifactExtension,
    /// First year of the range.
    pub start_year: Option<u32>,
    /// First month of the range.
    pub start_month: Option<u32>,
    /// Last year of the range (inclusive).
    pub end_year: Option<u32>,
    /// Last month of the range (inclusive).
    pub end_month: Option<u32>,
    /// Partitions materialized concurrently.
    pub max_workers: usize,
    /// Retries after the first attempt for transient transfer faults.
    pub max_retries: u32,
    /// Base delay between transfer attempts, in seconds.
    pub backoff_seconds: f64,
    /// Delay shape between attempts.
    pub backoff_strategy: BackoffStrategy,
    /// Ceiling for exponential delays, in seconds.
    pub backoff_max_seconds: f64,
    /// Fraction of each delay added as random jitter.
    pub backoff_jitter: f64,
    /// Wall-clock budget per partition; exceeding it fails the run.
    pub per_partition_timeout_seconds: u64,
    /// Budget for one HTTP request including its body.
    pub request_timeout_seconds: u64,
    /// Hard cap on batches per partition.
    pub max_batches_per_partition: u32,
    /// Extra runs for a partition whose discovery probe failed.
    pub partition_retries: u32,
    /// Refetch a batch once when its content fails validation.
    pub retry_corrupt_once: bool,
}

impl Default for MaterializerConfig {
    fn default() -> Self {
        Self {
            dataset_name: String::new(),
            base_url: defaults::BASE_URL.to_string(),
            root_dir: PathBuf::from(defaults::ROOT_DIR),
            extension: defaults::EXTENSION.to_string(),
            start_year: None,
            start_month: None,
            end_year: None,
            end_month: None,
            max_workers: defaults::MAX_WORKERS,
            max_retries: defaults::MAX_RETRIES,
            backoff_seconds: defaults::BACKOFF_SECONDS,
            backoff_strategy: BackoffStrategy::default(),
            backoff_max_seconds: defaults::BACKOFF_MAX_SECONDS,
            backoff_jitter: defaults::BACKOFF_JITTER,
            per_partition_timeout_seconds: defaults::PER_PARTITION_TIMEOUT_SECONDS,
            request_timeout_seconds: defaults::REQUEST_TIMEOUT_SECONDS,
            max_batches_per_partition: defaults::MAX_BATCHES_PER_PARTITION,
            partition_retries: defaults::PARTITION_RETRIES,
            retry_corrupt_once: true,
        }
    }
}

impl MaterializerConfig {
    /// Config for `dataset_name` with every other field at its default.
    pub fn for_dataset(dataset_name: impl Into<DatasetName>) -> Self {
        Self {
            dataset_name: dataset_name.into(),
            ..Self::default()
        }
    }

    /// Load a config from a JSON file; absent fields take defaults.
    pub fn from_json_file(path: &Path) -> Result<Self, MaterializeError> {
        let text = fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(|err| {
            MaterializeError::Configuration(format!("failed parsing {}: {err}", path.display()))
        })
    }

    /// Copy the range fields of an upstream descriptor into this config.
    pub fn with_descriptor(mut self, descriptor: &DateRangeDescriptor) -> Self {
        self.start_year = descriptor.start_year;
        self.start_month = descriptor.start_month;
        self.end_year = descriptor.end_year;
        self.end_month = descriptor.end_month;
        self
    }

    /// Reject values the materializer cannot run with.
    pub fn validate(&self) -> Result<(), MaterializeError> {
        let name = self.dataset_name.trim();
        if name.is_empty() {
            return Err(MaterializeError::Configuration(
                "dataset_name must not be empty".into(),
            ));
        }
        if name.contains(['/', '\\']) || name == "." || name == ".." {
            return Err(MaterializeError::Configuration(format!(
                "dataset_name '{name}' must be a single path segment"
            )));
        }
        if self.extension.trim_start_matches('.').is_empty() {
            return Err(MaterializeError::Configuration(
                "extension must not be empty".into(),
            ));
        }
        if self.base_url.trim().is_empty() {
            return Err(MaterializeError::Configuration(
                "base_url must not be empty".into(),
            ));
        }
        if self.max_workers == 0 {
            return Err(MaterializeError::Configuration(
                "max_workers must be at least 1".into(),
            ));
        }
        if self.max_batches_per_partition == 0 {
            return Err(MaterializeError::Configuration(
                "max_batches_per_partition must be at least 1".into(),
            ));
        }
        if self.per_partition_timeout_seconds == 0 {
            return Err(MaterializeError::Configuration(
                "per_partition_timeout_seconds must be at least 1".into(),
            ));
        }
        if self.request_timeout_seconds == 0 {
            return Err(MaterializeError::Configuration(
                "request_timeout_seconds must be at least 1".into(),
            ));
        }
        for (label, value) in [
            ("backoff_seconds", self.backoff_seconds),
            ("backoff_max_seconds", self.backoff_max_seconds),
            ("backoff_jitter", self.backoff_jitter),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(MaterializeError::Configuration(format!(
                    "{label} must be a finite non-negative number, got {value}"
                )));
            }
        }
        for (label, value) in [
            ("backoff_seconds", self.backoff_seconds),
            ("backoff_max_seconds", self.backoff_max_seconds),
        ] {
            seconds_to_duration(label, value)?;
        }
        Ok(())
    }

    /// Validated month range of this run.
    pub fn date_range(&self) -> Result<DateRange, MaterializeError> {
        DateRange::from_optional(
            self.start_year,
            self.start_month,
            self.end_year,
            self.end_month,
        )
    }

    /// Retry policy for transient transfer faults.
    pub fn retry_policy(&self) -> Result<RetryPolicy, MaterializeError> {
        let base = seconds_to_duration("backoff_seconds", self.backoff_seconds)?;
        let backoff = match self.backoff_strategy {
            BackoffStrategy::Fixed => BackoffPolicy::Fixed(base),
            BackoffStrategy::Exponential => BackoffPolicy::Exponential {
                base,
                max: seconds_to_duration("backoff_max_seconds", self.backoff_max_seconds)?
                    .max(base),
            },
        };
        Ok(RetryPolicy {
            max_retries: self.max_retries,
            backoff,
            jitter: self.backoff_jitter,
        })
    }

    /// Remote/local layout of the dataset.
    pub fn layout(&self) -> DatasetLayout {
        DatasetLayout::new(
            self.dataset_name.trim(),
            &self.base_url,
            self.root_dir.clone(),
            &self.extension,
        )
    }

    /// Per-partition wall-clock budget.
    pub fn partition_timeout(&self) -> Duration {
        Duration::from_secs(self.per_partition_timeout_seconds)
    }

    /// Per-request budget for the HTTP client.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    /// Longest a cancelled partition can keep running: one batch transfer
    /// with every attempt at the request budget and every backoff at its
    /// ceiling, plus one more request for slack.
    pub fn cancel_grace(&self) -> Duration {
        let attempts = self.max_retries.saturating_add(1);
        let ceiling =
            self.backoff_seconds.max(self.backoff_max_seconds) * (1.0 + self.backoff_jitter);
        let backoff = Duration::try_from_secs_f64(ceiling).unwrap_or(Duration::MAX);
        self.request_timeout()
            .saturating_mul(attempts.saturating_add(1))
            .saturating_add(backoff.saturating_mul(self.max_retries))
    }
}

fn seconds_to_duration(label: &str, seconds: f64) -> Result<Duration, MaterializeError> {
    Duration::try_from_secs_f64(seconds).map_err(|err| {
        MaterializeError::Configuration(format!("{label} = {seconds} is not a usable delay: {err}"))
    })
}
