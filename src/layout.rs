//! Remote addressing and local placement of batch files.
//!
//! Every path is derived from `(dataset, partition, batch)` alone, so two
//! workers never compute the same destination and re-runs land on identical
//! paths.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::constants::naming::{FILE_NAME_SEPARATOR, PARTIAL_SUFFIX};
use crate::partition::PartitionKey;
use crate::types::{ArtifactExtension, DatasetName, RemoteUrl};

/// Where a dataset lives remotely and locally.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DatasetLayout {
    dataset: DatasetName,
    base_url: String,
    root: PathBuf,
    extension: ArtifactExtension,
}

impl DatasetLayout {
    /// Create a layout; trailing slashes on `base_url` and a leading dot on `extension` are dropped.
    pub fn new(
        dataset: impl Into<DatasetName>,
        base_url: impl AsRef<str>,
        root: impl Into<PathBuf>,
        extension: impl AsRef<str>,
    ) -> Self {
        Self {
            dataset: dataset.into(),
            base_url: base_url.as_ref().trim_end_matches('/').to_string(),
            root: root.into(),
            extension: extension.as_ref().trim_start_matches('.').to_string(),
        }
    }

    /// Dataset name.
    pub fn dataset(&self) -> &str {
        &self.dataset
    }

    /// Artifact extension without the dot.
    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// Local root shared by all datasets.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/<dataset>`
    pub fn dataset_dir(&self) -> PathBuf {
        self.root.join(&self.dataset)
    }

    /// `<root>/<dataset>/year=YYYY/month=MM`
    pub fn partition_dir(&self, partition: PartitionKey) -> PathBuf {
        self.dataset_dir()
            .join(partition.year_segment())
            .join(partition.month_segment())
    }

    /// Locator for one batch of a partition.
    pub fn locator(&self, partition: PartitionKey, batch: u32) -> BatchLocator {
        BatchLocator {
            dataset: self.dataset.clone(),
            partition,
            batch,
        }
    }

    /// `<dataset>_<YYYYMM>_<batch>.<ext>`
    pub fn file_name(&self, locator: &BatchLocator) -> String {
        format!(
            "{}{sep}{}{sep}{}.{}",
            locator.dataset,
            locator.partition.compact(),
            locator.batch,
            self.extension,
            sep = FILE_NAME_SEPARATOR
        )
    }

    /// `<base-url>/<dataset>/year=YYYY/month=MM/<file>`
    pub fn remote_url(&self, locator: &BatchLocator) -> RemoteUrl {
        format!(
            "{}/{}/{}/{}/{}",
            self.base_url,
            locator.dataset,
            locator.partition.year_segment(),
            locator.partition.month_segment(),
            self.file_name(locator)
        )
    }

    /// `<root>/<dataset>/year=YYYY/month=MM/<file>`
    pub fn local_path(&self, locator: &BatchLocator) -> PathBuf {
        self.partition_dir(locator.partition)
            .join(self.file_name(locator))
    }

    /// Recover `(partition, batch)` from a batch file name produced by `file_name`.
    ///
    /// Temporary download files and foreign names return `None`.
    pub fn parse_file_name(&self, name: &str) -> Option<(PartitionKey, u32)> {
        let stem = name.strip_suffix(self.extension.as_str())?;
        let stem = stem.strip_suffix('.')?;
        let rest = stem.strip_prefix(self.dataset.as_str())?;
        let rest = rest.strip_prefix(FILE_NAME_SEPARATOR)?;
        let (stamp, batch) = rest.split_once(FILE_NAME_SEPARATOR)?;
        let partition = PartitionKey::parse_compact(stamp)?;
        if batch.is_empty() || !batch.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let batch = batch.parse::<u32>().ok().filter(|batch| *batch >= 1)?;
        Some((partition, batch))
    }
}

/// Identity of one remote batch file. Lives only while that file is probed and fetched.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BatchLocator {
    /// Dataset name.
    pub dataset: DatasetName,
    /// Month partition.
    pub partition: PartitionKey,
    /// 1-based batch number within the partition.
    pub batch: u32,
}

impl fmt::Display for BatchLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}#{}", self.dataset, self.partition, self.batch)
    }
}

/// A validated batch file on local storage.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LocalArtifact {
    /// Month partition the file belongs to.
    pub partition: PartitionKey,
    /// 1-based batch number.
    pub batch: u32,
    /// Absolute or root-relative file path.
    pub path: PathBuf,
}

/// Sibling path used while a download is in flight: `<file>.part`.
pub fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".");
    name.push(PARTIAL_SUFFIX);
    dest.with_file_name(name)
}
