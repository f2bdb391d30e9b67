//! Driver that applies a configured sequence of passes over a package tree.

use dexcloak_utils::errors::TransformError;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{PassReport, Transform};

/// Configuration for one obfuscation run.
pub struct ObfuscationConfig {
    /// Seed for the run's RNG; a fixed seed reproduces the output byte for
    /// byte.
    pub seed: u64,
    /// Passes, applied in order. Passes share no in-memory state.
    pub transforms: Vec<Box<dyn Transform>>,
}

impl std::fmt::Debug for ObfuscationConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObfuscationConfig")
            .field("seed", &self.seed)
            .field("transforms", &format!("{} transforms", self.transforms.len()))
            .finish()
    }
}

impl Default for ObfuscationConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            transforms: Vec::new(),
        }
    }
}

/// Per-pass slice of the run summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassSummary {
    pub name: String,
    #[serde(flatten)]
    pub report: PassReport,
}

/// Result of an obfuscation run, serializable for the CLI's report output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObfuscationSummary {
    pub seed_used: u64,
    pub passes: Vec<PassSummary>,
    pub total_mutations: usize,
}

/// Runs every configured pass sequentially against its targets.
///
/// The first I/O failure aborts the run; malformed individual files were
/// already skipped inside the passes and are not errors.
pub fn run(config: ObfuscationConfig) -> Result<ObfuscationSummary, TransformError> {
    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut passes = Vec::new();
    let mut total_mutations = 0;
    for pass in &config.transforms {
        let report = pass.apply(&mut rng)?;
        info!(
            "{:>19} {} files, {} mutations, {} methods",
            pass.name(),
            report.files_rewritten,
            report.mutations,
            report.methods_synthesized
        );
        total_mutations += report.mutations;
        passes.push(PassSummary {
            name: pass.name().to_string(),
            report,
        });
    }
    Ok(ObfuscationSummary {
        seed_used: config.seed,
        passes,
        total_mutations,
    })
}
