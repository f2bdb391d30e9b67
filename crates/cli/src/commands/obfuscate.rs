/// Module for the `obfuscate` subcommand, which applies the selected passes
/// to a decompiled package tree, rewriting assembly files in place.
use clap::Args;
use dexcloak_core::catalog::DangerousApiCatalog;
use dexcloak_core::dexdump;
use dexcloak_core::scanner::PathFilter;
use dexcloak_transform::arithmetic_branch::ArithmeticBranching;
use dexcloak_transform::call_indirection::CallIndirection;
use dexcloak_transform::code_reorder::CodeReorder;
use dexcloak_transform::junk_insertion::JunkInsertion;
use dexcloak_transform::nop_to_junk::NopToJunk;
use dexcloak_transform::obfuscator::{self, ObfuscationConfig};
use dexcloak_transform::reflection::AdvancedReflection;
use dexcloak_transform::renaming::{IdentifierRenaming, RenameOperation};
use dexcloak_transform::string_encryption::StringEncryption;
use dexcloak_transform::Transform;
use dexcloak_utils::errors::{ObfuscateError, TransformError};
use std::error::Error;
use std::fs;
use std::path::PathBuf;

/// Arguments for the `obfuscate` subcommand.
#[derive(Args)]
pub struct ObfuscateArgs {
    /// Package directory holding the smali trees to rewrite.
    pub root: PathBuf,
    /// Random seed for pass application; a fixed seed reproduces the output.
    #[arg(long, default_value_t = 42)]
    seed: u64,
    /// Comma-separated pass list, applied in order. Available:
    /// call-indirection, reflection, arith-branch, reorder, junk, nop-junk,
    /// string-encrypt, rename.
    #[arg(long, default_value = "junk,arith-branch,string-encrypt")]
    passes: String,
    /// Manifest path for the rename pass (default: <root>/AndroidManifest.xml).
    #[arg(long)]
    manifest: Option<PathBuf>,
    /// What the rename pass renames: package, classes or all.
    #[arg(long, default_value = "all")]
    rename: String,
    /// `<dir>=<dump>` pair giving a smali directory its dex dump, repeatable;
    /// required by call-indirection.
    #[arg(long = "budget")]
    budgets: Vec<String>,
    /// Directory names to exclude, replacing each pass's framework defaults.
    #[arg(long = "exclude")]
    excludes: Vec<String>,
    /// Dangerous-API catalog file overriding the built-in one.
    #[arg(long)]
    catalog: Option<PathBuf>,
    /// Path to emit the run summary as JSON (optional).
    #[arg(long)]
    emit: Option<PathBuf>,
}

impl super::Command for ObfuscateArgs {
    fn execute(self) -> Result<(), Box<dyn Error>> {
        let mut transforms: Vec<Box<dyn Transform>> = Vec::new();
        for name in self.passes.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            transforms.push(self.build_pass(name)?);
        }
        let summary = obfuscator::run(ObfuscationConfig {
            seed: self.seed,
            transforms,
        })?;
        let rendered = serde_json::to_string_pretty(&summary)?;
        match &self.emit {
            Some(path) => fs::write(path, &rendered)?,
            None => println!("{rendered}"),
        }
        Ok(())
    }
}

impl ObfuscateArgs {
    fn build_pass(&self, name: &str) -> Result<Box<dyn Transform>, ObfuscateError> {
        let root = self.root.clone();
        let pass: Box<dyn Transform> = match name {
            "call-indirection" => {
                let mut dirs_by_budget = Vec::new();
                for spec in &self.budgets {
                    let (dir, dump) = spec
                        .split_once('=')
                        .ok_or_else(|| ObfuscateError::InvalidBudgetSpec(spec.clone()))?;
                    let budget = dexdump::method_budget(std::path::Path::new(dump))
                        .map_err(TransformError::from)?;
                    dirs_by_budget.push((PathBuf::from(dir), budget));
                }
                if dirs_by_budget.is_empty() {
                    return Err(TransformError::InvalidPass(
                        "call-indirection needs at least one --budget <dir>=<dump>".to_string(),
                    )
                    .into());
                }
                self.filtered(CallIndirection::new(dirs_by_budget), CallIndirection::with_filter)
            }
            "reflection" => {
                let mut pass = AdvancedReflection::new(root);
                if let Some(catalog) = &self.catalog {
                    pass = pass.with_catalog(DangerousApiCatalog::load(catalog)?);
                }
                self.filtered(pass, AdvancedReflection::with_filter)
            }
            "arith-branch" => self.filtered(ArithmeticBranching::new(root), ArithmeticBranching::with_filter),
            "reorder" => self.filtered(CodeReorder::new(root), CodeReorder::with_filter),
            "junk" => self.filtered(JunkInsertion::new(root), JunkInsertion::with_filter),
            "nop-junk" => self.filtered(NopToJunk::new(root), NopToJunk::with_filter),
            "string-encrypt" => self.filtered(StringEncryption::new(root), StringEncryption::with_filter),
            "rename" => {
                let manifest = self
                    .manifest
                    .clone()
                    .unwrap_or_else(|| PathBuf::from("AndroidManifest.xml"));
                let operation = match self.rename.as_str() {
                    "package" => RenameOperation::Package,
                    "classes" => RenameOperation::Classes,
                    "all" => RenameOperation::All,
                    other => {
                        return Err(TransformError::InvalidPass(format!(
                            "unknown rename operation: {other}"
                        ))
                        .into())
                    }
                };
                Box::new(IdentifierRenaming::new(root, &manifest, operation))
            }
            other => return Err(TransformError::InvalidPass(other.to_string()).into()),
        };
        Ok(pass)
    }

    /// Applies the user's exclude list, when given, in place of the pass's
    /// default framework excludes.
    fn filtered<P, F>(&self, pass: P, with_filter: F) -> Box<dyn Transform>
    where
        P: Transform + 'static,
        F: FnOnce(P, PathFilter) -> P,
    {
        if self.excludes.is_empty() {
            Box::new(pass)
        } else {
            Box::new(with_filter(pass, PathFilter::excluding(self.excludes.clone())))
        }
    }
}
