//! Catalog of API signatures flagged for reflective indirection.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use dexcloak_utils::errors::TransformError;

/// Immutable set of fully-qualified method signatures
/// (`Lcls;->name(params)ret`, one per line in the source file).
#[derive(Debug, Clone, Default)]
pub struct DangerousApiCatalog {
    signatures: HashSet<String>,
}

impl DangerousApiCatalog {
    /// Parses newline-separated signatures. Blank lines and `#` comment
    /// lines are ignored.
    pub fn parse(text: &str) -> Self {
        let signatures = text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .map(str::to_string)
            .collect();
        Self { signatures }
    }

    pub fn load(path: &Path) -> Result<Self, TransformError> {
        let text = fs::read_to_string(path).map_err(|source| TransformError::FileRead {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Self::parse(&text))
    }

    pub fn contains(&self, signature: &str) -> bool {
        self.signatures.contains(signature)
    }

    pub fn len(&self) -> usize {
        self.signatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }
}
