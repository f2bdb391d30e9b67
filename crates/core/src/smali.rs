//! File model for one smali class file.

use std::fs;
use std::path::{Component, Path, PathBuf};

use dexcloak_utils::errors::TransformError;

use crate::patterns::{self, ClassHeader};

/// One assembly file: raw text plus where it came from.
///
/// A pass reads the file once, mutates a copy of the text, and rewrites the
/// file in place at the end of that invocation. Nothing is kept across
/// passes.
#[derive(Debug, Clone)]
pub struct SmaliFile {
    path: PathBuf,
    text: String,
}

impl SmaliFile {
    pub fn read(path: &Path) -> Result<Self, TransformError> {
        let text = fs::read_to_string(path).map_err(|source| TransformError::FileRead {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            text,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn class_header(&self) -> Option<ClassHeader> {
        patterns::parse_class_header(&self.text)
    }

    /// Replaces the contents and rewrites the file in place.
    pub fn rewrite(&mut self, new_text: String) -> Result<(), TransformError> {
        self.text = new_text;
        fs::write(&self.path, &self.text).map_err(|source| TransformError::FileWrite {
            path: self.path.display().to_string(),
            source,
        })
    }
}

/// Writes `text` to `path`, creating parent directories as needed. Used to
/// materialize per-project support classes.
pub fn write_support_file(path: &Path, text: &str) -> Result<(), TransformError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| TransformError::FileWrite {
            path: parent.display().to_string(),
            source,
        })?;
    }
    fs::write(path, text).map_err(|source| TransformError::FileWrite {
        path: path.display().to_string(),
        source,
    })
}

/// Returns the prefix of `path` ending at the first component named like a
/// smali root (`smali`, `smali_classes2`, …), where support classes are
/// placed.
pub fn smali_root(path: &Path) -> Option<PathBuf> {
    let mut acc = PathBuf::new();
    for comp in path.components() {
        acc.push(comp);
        if let Component::Normal(name) = comp {
            if name.to_str().is_some_and(|n| n.starts_with("smali")) {
                return Some(acc);
            }
        }
    }
    None
}
