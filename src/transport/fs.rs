use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::warn;
use walkdir::WalkDir;

/// Recursive file listing under a dataset root.
pub struct TreeWalker {
    root: PathBuf,
}

impl TreeWalker {
    /// Create a walker rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// All regular files under the root whose extension equals `extension`
    /// (case-insensitive), in lexicographic path order.
    ///
    /// A missing root yields an empty list.
    pub fn files_with_extension(&self, extension: &str) -> Vec<PathBuf> {
        if !self.root.exists() {
            return Vec::new();
        }
        let mut files: Vec<PathBuf> = WalkDir::new(&self.root)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .filter(|path| has_extension(path, extension))
            .collect();
        files.sort();
        files
    }
}

/// True if `path` has extension `extension` (case-insensitive).
pub fn has_extension(path: &Path, extension: &str) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case(extension))
        .unwrap_or(false)
}

/// Remove `path` if present. Failures are logged, never returned.
///
/// Returns `true` when the file is gone afterwards.
pub fn remove_file_best_effort(path: &Path) -> bool {
    match fs::remove_file(path) {
        Ok(()) => true,
        Err(err) if err.kind() == io::ErrorKind::NotFound => true,
        Err(err) => {
            warn!(
                "[lakefetch] failed removing {}: {err}",
                path.display()
            );
            false
        }
    }
}

/// Remove `dir` if it exists and is empty. Failures are logged, never returned.
pub fn remove_empty_dir_best_effort(dir: &Path) {
    match fs::remove_dir(dir) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => {
            warn!(
                "[lakefetch] left partition directory {} in place: {err}",
                dir.display()
            );
        }
    }
}

/// Delete `dir` and everything under it; a missing directory is not an error.
pub fn remove_dir_tree(dir: &Path) -> io::Result<()> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}
