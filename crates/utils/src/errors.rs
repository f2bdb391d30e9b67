use thiserror::Error;

/// Error type for directory scanning.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("could not walk directory '{path}': {source}")]
    Walk {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Error type for dex dump analysis.
#[derive(Debug, Error)]
pub enum DumpError {
    #[error("could not open dump '{path}': {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("read failed while streaming dump: {0}")]
    Read(#[from] std::io::Error),
}

/// Error type for transform passes.
///
/// Malformed individual files are not errors: a pass skips them and keeps
/// going. Only I/O failures and broken pass inputs (templates, catalogs,
/// manifest) abort an invocation.
#[derive(Debug, Error)]
pub enum TransformError {
    #[error("could not read file '{path}': {source}")]
    FileRead {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("could not write file '{path}': {source}")]
    FileWrite {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("directory scan failed: {0}")]
    Scan(#[from] ScanError),
    #[error("dump analysis failed: {0}")]
    Dump(#[from] DumpError),
    #[error("malformed junk template: {0}")]
    MalformedTemplate(String),
    #[error("no smali root in '{0}'")]
    NoSmaliRoot(String),
    #[error("package attribute not found in manifest")]
    ManifestPackage,
    #[error("invalid pass: {0}")]
    InvalidPass(String),
}

/// Errors that can occur while assembling an obfuscation run.
#[derive(Debug, Error)]
pub enum ObfuscateError {
    #[error("transform error: {0}")]
    Transform(#[from] TransformError),
    #[error("invalid budget spec '{0}', expected <dir>=<dump>")]
    InvalidBudgetSpec(String),
}
