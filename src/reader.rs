use std::collections::BTreeSet;
use std::fs::File;
use std::path::Path;

use parquet::file::reader::{FileReader, SerializedFileReader};
use parquet::record::reader::RowIter;
use rayon::prelude::*;
use serde_json::Value;
use tracing::{debug, info};

use crate::errors::MaterializeError;
use crate::layout::{DatasetLayout, LocalArtifact};
use crate::partition::PartitionKey;
use crate::transport::fs::TreeWalker;

/// Reads a materialized dataset back as one ordered logical dataset.
pub struct MaterializedDatasetReader {
    layout: DatasetLayout,
}

impl MaterializedDatasetReader {
    /// Reader over the dataset directory of `layout`.
    pub fn new(layout: DatasetLayout) -> Self {
        Self { layout }
    }

    /// Every batch file under the dataset directory, sorted by partition then batch.
    ///
    /// Files that do not follow the naming convention (including in-flight
    /// `.part` downloads) are ignored.
    pub fn artifacts(&self) -> Vec<LocalArtifact> {
        let mut artifacts: Vec<LocalArtifact> = TreeWalker::new(self.layout.dataset_dir())
            .files_with_extension(self.layout.extension())
            .into_iter()
            .filter_map(|path| {
                let name = path.file_name()?.to_str()?;
                let (partition, batch) = self.layout.parse_file_name(name)?;
                Some(LocalArtifact {
                    partition,
                    batch,
                    path,
                })
            })
            .collect();
        artifacts.sort();
        artifacts
    }

    /// Load the dataset, or `None` when nothing has been materialized.
    ///
    /// Reads parquet metadata of every artifact in parallel and rejects
    /// datasets whose artifacts disagree on columns.
    pub fn load(&self) -> Result<Option<MaterializedDataset>, MaterializeError> {
        let artifacts = self.artifacts();
        if artifacts.is_empty() {
            info!(
                "[lakefetch] no artifacts under {}",
                self.layout.dataset_dir().display()
            );
            return Ok(None);
        }
        if !self.layout.extension().eq_ignore_ascii_case("parquet") {
            return Err(MaterializeError::Configuration(format!(
                "cannot load '{}' artifacts; only parquet datasets are readable",
                self.layout.extension()
            )));
        }

        let entries = artifacts
            .into_par_iter()
            .map(|artifact| {
                let (rows, columns) = read_footer(&artifact.path)?;
                Ok::<_, MaterializeError>(DatasetEntry {
                    artifact,
                    rows,
                    columns,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let columns = entries[0].columns.clone();
        for entry in &entries[1..] {
            if entry.columns != columns {
                return Err(MaterializeError::SchemaMismatch {
                    path: entry.artifact.path.display().to_string(),
                    details: format!("expected columns {columns:?}, found {:?}", entry.columns),
                });
            }
        }

        let dataset = MaterializedDataset { entries, columns };
        info!(
            "[lakefetch] loaded {} artifact(s), {} row(s) across {} partition(s)",
            dataset.len(),
            dataset.num_rows(),
            dataset.partitions().len()
        );
        Ok(Some(dataset))
    }
}

struct DatasetEntry {
    artifact: LocalArtifact,
    rows: u64,
    columns: Vec<String>,
}

/// An ordered, read-only view over every artifact of a dataset.
pub struct MaterializedDataset {
    entries: Vec<DatasetEntry>,
    columns: Vec<String>,
}

impl MaterializedDataset {
    /// Artifacts in (partition, batch) order.
    pub fn artifacts(&self) -> impl Iterator<Item = &LocalArtifact> {
        self.entries.iter().map(|entry| &entry.artifact)
    }

    /// Number of artifacts.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Always false for a loaded dataset; empty datasets load as `None`.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total rows from parquet metadata.
    pub fn num_rows(&self) -> u64 {
        self.entries.iter().map(|entry| entry.rows).sum()
    }

    /// Distinct partitions holding at least one artifact, ascending.
    pub fn partitions(&self) -> Vec<PartitionKey> {
        self.entries
            .iter()
            .map(|entry| entry.artifact.partition)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Leaf column paths shared by every artifact.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Every row of every artifact, in artifact order, as JSON objects.
    ///
    /// Files are opened one at a time as the iterator advances.
    pub fn rows(&self) -> DatasetRows<'_> {
        DatasetRows {
            remaining: self.entries.iter(),
            current: None,
        }
    }
}

/// Lazy row iterator returned by `MaterializedDataset::rows`.
pub struct DatasetRows<'a> {
    remaining: std::slice::Iter<'a, DatasetEntry>,
    current: Option<(&'a Path, RowIter<'static>)>,
}

impl Iterator for DatasetRows<'_> {
    type Item = Result<Value, MaterializeError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some((path, rows)) = self.current.as_mut() {
                match rows.next() {
                    Some(Ok(row)) => return Some(Ok(row.to_json_value())),
                    Some(Err(err)) => {
                        let path = path.display().to_string();
                        self.current = None;
                        return Some(Err(MaterializeError::CorruptArtifact {
                            path,
                            reason: format!("failed reading parquet row: {err}"),
                        }));
                    }
                    None => self.current = None,
                }
            }
            let entry = self.remaining.next()?;
            let path = entry.artifact.path.as_path();
            debug!(path = %path.display(), "opening artifact");
            match open_reader(path) {
                Ok(reader) => self.current = Some((path, reader.into_iter())),
                Err(err) => return Some(Err(err)),
            }
        }
    }
}

fn open_reader(path: &Path) -> Result<SerializedFileReader<File>, MaterializeError> {
    let file = File::open(path)?;
    SerializedFileReader::new(file).map_err(|err| MaterializeError::CorruptArtifact {
        path: path.display().to_string(),
        reason: format!("failed reading parquet metadata: {err}"),
    })
}

fn read_footer(path: &Path) -> Result<(u64, Vec<String>), MaterializeError> {
    let reader = open_reader(path)?;
    let metadata = reader.metadata().file_metadata();
    let rows = u64::try_from(metadata.num_rows()).map_err(|_| MaterializeError::CorruptArtifact {
        path: path.display().to_string(),
        reason: format!("negative row count {}", metadata.num_rows()),
    })?;
    let columns = metadata
        .schema_descr()
        .columns()
        .iter()
        .map(|column| format!("{}: {}", column.path().string(), column.physical_type()))
        .collect();
    Ok((rows, columns))
}
