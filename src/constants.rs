/// Constants describing the remote and local naming convention.
pub mod naming {
    /// Path segment prefix carrying the four-digit partition year.
    pub const YEAR_SEGMENT_PREFIX: &str = "year=";
    /// Path segment prefix carrying the two-digit partition month.
    pub const MONTH_SEGMENT_PREFIX: &str = "month=";
    /// Separator between dataset name, partition stamp, and batch number in file names.
    pub const FILE_NAME_SEPARATOR: char = '_';
    /// Suffix appended to in-flight downloads before they are validated and renamed.
    pub const PARTIAL_SUFFIX: &str = "part";
    /// First batch number probed in every partition.
    pub const FIRST_BATCH_NUMBER: u32 = 1;
}

/// Default values for `MaterializerConfig`.
pub mod defaults {
    /// Remote host serving partitioned batch files.
    pub const BASE_URL: &str = "https://fastopendata.org";
    /// Local root directory for materialized datasets.
    pub const ROOT_DIR: &str = "data/opendata";
    /// Artifact extension.
    pub const EXTENSION: &str = "parquet";
    /// Number of partitions materialized concurrently.
    pub const MAX_WORKERS: usize = 4;
    /// Retries after the first attempt for transient transfer faults.
    pub const MAX_RETRIES: u32 = 3;
    /// Base backoff delay between transfer attempts.
    pub const BACKOFF_SECONDS: f64 = 1.0;
    /// Ceiling for exponential backoff delays.
    pub const BACKOFF_MAX_SECONDS: f64 = 30.0;
    /// Fraction of the computed delay added as random jitter.
    pub const BACKOFF_JITTER: f64 = 0.1;
    /// Wall-clock budget for one partition.
    pub const PER_PARTITION_TIMEOUT_SECONDS: u64 = 3600;
    /// Budget for one HTTP request, including the body transfer.
    pub const REQUEST_TIMEOUT_SECONDS: u64 = 120;
    /// Hard cap on batches discovered in one partition.
    pub const MAX_BATCHES_PER_PARTITION: u32 = 1000;
    /// Extra runs granted to a partition whose discovery probe failed.
    pub const PARTITION_RETRIES: u32 = 1;
}

/// Constants used by the scheduler runtime.
pub mod scheduler {
    /// Thread name prefix for partition workers.
    pub const WORKER_THREAD_PREFIX: &str = "lakefetch-partition";
}
