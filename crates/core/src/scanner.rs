//! Recursive listing of assembly files under a package root.

use std::path::{Path, PathBuf};

use dexcloak_utils::errors::ScanError;
use walkdir::WalkDir;

/// Include/exclude lists of path-segment names applied during scanning.
///
/// A path passes when it contains at least one include segment (an empty
/// include list admits everything) and none of the exclude segments.
#[derive(Debug, Clone, Default)]
pub struct PathFilter {
    include: Vec<String>,
    exclude: Vec<String>,
}

impl PathFilter {
    pub fn new<I, S>(include: I, exclude: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            include: include.into_iter().map(Into::into).collect(),
            exclude: exclude.into_iter().map(Into::into).collect(),
        }
    }

    /// Filter with an exclude list only, the common case for passes that
    /// must stay out of framework packages.
    pub fn excluding<I, S>(exclude: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(Vec::<S>::new(), exclude.into_iter().collect())
    }

    pub fn allows(&self, path: &Path) -> bool {
        let segments: Vec<&str> = path
            .iter()
            .filter_map(std::ffi::OsStr::to_str)
            .collect();
        let included = self.include.is_empty()
            || self.include.iter().any(|i| segments.contains(&i.as_str()));
        let excluded = self.exclude.iter().any(|e| segments.contains(&e.as_str()));
        included && !excluded
    }

    fn prunes(&self, dir_name: &str) -> bool {
        self.exclude.iter().any(|e| e == dir_name)
    }
}

/// Recursively lists files under `root`, honoring the filter and an optional
/// extension. Excluded directory names are pruned without descending.
/// Results are sorted so a fixed seed yields a fixed rewrite order.
pub fn collect_files(
    root: &Path,
    extension: Option<&str>,
    filter: &PathFilter,
) -> Result<Vec<PathBuf>, ScanError> {
    let mut files = Vec::new();
    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            !(e.file_type().is_dir()
                && e.file_name().to_str().is_some_and(|n| filter.prunes(n)))
        });
    for entry in walker {
        let entry = entry.map_err(|source| ScanError::Walk {
            path: root.display().to_string(),
            source: source.into(),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        if let Some(ext) = extension {
            if entry.path().extension().and_then(|e| e.to_str()) != Some(ext) {
                continue;
            }
        }
        if filter.allows(entry.path()) {
            files.push(entry.into_path());
        }
    }
    tracing::debug!("collected {} files under {}", files.len(), root.display());
    Ok(files)
}
