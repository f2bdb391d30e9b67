//! Nop-to-junk: replaces literal `nop` instructions with template blocks.
//!
//! Blocks touch no registers, so they are legal at any point a `nop` is.
//! The jump-pair block needs a fresh label per insertion; the other blocks
//! are inserted verbatim.

use std::path::PathBuf;

use dexcloak_core::patterns::{LS, TAB};
use dexcloak_core::scanner::{self, PathFilter};
use dexcloak_core::smali::SmaliFile;
use dexcloak_utils::errors::TransformError;
use rand::rngs::StdRng;
use rand::Rng;

use crate::util::parse_template_blocks;
use crate::{PassReport, Transform};

const DEFAULT_EXCLUDES: [&str; 1] = ["android"];

const DEFAULT_TEMPLATES: &str = include_str!("templates/nop_junk.txt");

/// Index of the block whose paired jump label must be made unique per
/// insertion.
const LABELED_BLOCK: usize = 1;

pub struct NopToJunk {
    root: PathBuf,
    filter: PathFilter,
    blocks: Vec<Vec<String>>,
}

impl std::fmt::Debug for NopToJunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NopToJunk")
            .field("root", &self.root)
            .field("blocks", &self.blocks.len())
            .finish()
    }
}

impl NopToJunk {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            filter: PathFilter::excluding(DEFAULT_EXCLUDES),
            blocks: parse_template_blocks(DEFAULT_TEMPLATES),
        }
    }

    pub fn with_filter(mut self, filter: PathFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_template_text(mut self, text: &str) -> Self {
        self.blocks = parse_template_blocks(text);
        self
    }
}

impl Transform for NopToJunk {
    fn name(&self) -> &'static str {
        "NopToJunk"
    }

    fn apply(&self, rng: &mut StdRng) -> Result<PassReport, TransformError> {
        if self.blocks.len() <= LABELED_BLOCK
            || self.blocks[LABELED_BLOCK].len() != 2
        {
            return Err(TransformError::MalformedTemplate(
                "block 1 must be the jump/label pair".to_string(),
            ));
        }
        let mut report = PassReport::default();
        let files = scanner::collect_files(&self.root, Some("smali"), &self.filter)?;
        for path in &files {
            let mut file = SmaliFile::read(path)?;
            let mut replaced = 0;
            let mut label_counter = 0usize;
            let mut out = String::with_capacity(file.text().len());
            for line in file.text().split_inclusive('\n') {
                if line.trim() != "nop" {
                    out.push_str(line);
                    continue;
                }
                let index = rng.random_range(0..self.blocks.len());
                let block = &self.blocks[index];
                if index == LABELED_BLOCK {
                    label_counter += 1;
                    out.push_str(&format!("{TAB}{}_{label_counter}{LS}", block[0]));
                    out.push_str(&format!("{TAB}{}_{label_counter}{LS}", block[1]));
                } else {
                    for template_line in block {
                        out.push_str(&format!("{TAB}{template_line}{LS}"));
                    }
                }
                replaced += 1;
            }
            if replaced > 0 {
                file.rewrite(out)?;
                report.files_rewritten += 1;
                report.mutations += replaced;
            }
        }
        Ok(report)
    }
}
