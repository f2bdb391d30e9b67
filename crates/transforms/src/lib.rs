pub mod arithmetic_branch;
pub mod call_indirection;
pub mod code_reorder;
pub mod junk_insertion;
pub mod nop_to_junk;
pub mod obfuscator;
pub mod reflection;
pub mod renaming;
pub mod string_encryption;
pub mod util;

use dexcloak_utils::errors::TransformError;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

/// Trait for assembly obfuscation passes.
///
/// A pass owns its target configuration only; every registry and counter
/// lives inside `apply`, constructed fresh per invocation. Invocations on
/// disjoint directory trees may therefore run from separate threads, each
/// with its own RNG. Invocations over the same tree must not overlap.
pub trait Transform: Send + Sync {
    /// Returns the pass name for logging and identification.
    fn name(&self) -> &'static str;
    /// Runs the pass over its target files, returning mutation counts.
    fn apply(&self, rng: &mut StdRng) -> Result<PassReport, TransformError>;
}

/// Mutation counts reported by one pass invocation.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PassReport {
    /// Files rewritten in place.
    pub files_rewritten: usize,
    /// Pass-specific mutations: call sites rewritten, instructions
    /// inserted, literals encrypted, identifiers renamed.
    pub mutations: usize,
    /// Methods synthesized into the tree.
    pub methods_synthesized: usize,
}
