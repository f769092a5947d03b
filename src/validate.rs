//! Structural validation of downloaded batch files.

use std::fs::{self, File};
use std::path::Path;
use std::sync::Arc;

use parquet::file::reader::{FileReader, SerializedFileReader};

/// Facts learned while validating one artifact.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ArtifactStats {
    /// File size on disk.
    pub bytes: u64,
    /// Row count from format metadata, when the format records one.
    pub rows: Option<u64>,
    /// Row-group count, for parquet.
    pub row_groups: Option<usize>,
}

/// Checks that a complete download is well-formed before it is accepted.
///
/// Implementations should read format metadata only, not the full payload.
pub trait ArtifactValidator: Send + Sync {
    /// Validate the file at `path`; the error string is the rejection reason.
    fn validate(&self, path: &Path) -> Result<ArtifactStats, String>;
}

/// Parses the parquet footer (magic, metadata length, and file metadata).
#[derive(Clone, Copy, Debug, Default)]
pub struct ParquetFooterValidator;

impl ArtifactValidator for ParquetFooterValidator {
    fn validate(&self, path: &Path) -> Result<ArtifactStats, String> {
        let bytes = fs::metadata(path)
            .map_err(|err| format!("failed reading size of {}: {err}", path.display()))?
            .len();
        let file = File::open(path)
            .map_err(|err| format!("failed opening {}: {err}", path.display()))?;
        let reader = SerializedFileReader::new(file)
            .map_err(|err| format!("failed reading parquet metadata: {err}"))?;
        let metadata = reader.metadata();
        let rows = metadata.file_metadata().num_rows();
        let rows = u64::try_from(rows).map_err(|_| format!("negative row count {rows}"))?;
        let group_rows: i64 = metadata.row_groups().iter().map(|rg| rg.num_rows()).sum();
        if group_rows as u64 != rows && !metadata.row_groups().is_empty() {
            return Err(format!(
                "row groups hold {group_rows} rows but footer declares {rows}"
            ));
        }
        Ok(ArtifactStats {
            bytes,
            rows: Some(rows),
            row_groups: Some(metadata.num_row_groups()),
        })
    }
}

/// Accepts any non-empty file; used for formats without a cheap structural check.
#[derive(Clone, Copy, Debug, Default)]
pub struct NonEmptyValidator;

impl ArtifactValidator for NonEmptyValidator {
    fn validate(&self, path: &Path) -> Result<ArtifactStats, String> {
        let bytes = fs::metadata(path)
            .map_err(|err| format!("failed reading size of {}: {err}", path.display()))?
            .len();
        if bytes == 0 {
            return Err("file is empty".to_string());
        }
        Ok(ArtifactStats {
            bytes,
            rows: None,
            row_groups: None,
        })
    }
}

/// Default validator for an artifact extension.
pub fn validator_for_extension(extension: &str) -> Arc<dyn ArtifactValidator> {
    if extension.eq_ignore_ascii_case("parquet") {
        Arc::new(ParquetFooterValidator)
    } else {
        Arc::new(NonEmptyValidator)
    }
}
