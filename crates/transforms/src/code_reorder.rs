//! Code reorder: permutes the textual order of straight-line instructions
//! while chaining them back together with labels and jumps, so the executed
//! order is unchanged.

use std::path::PathBuf;

use dexcloak_core::patterns::{self, LS};
use dexcloak_core::scanner::{self, PathFilter};
use dexcloak_core::smali::SmaliFile;
use dexcloak_utils::errors::TransformError;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use crate::{PassReport, Transform};

const DEFAULT_EXCLUDES: [&str; 3] = ["android", "androidx", "data"];

/// Any of these make instruction order load-bearing; a method containing one
/// is rewritten without modification.
const ORDER_SENSITIVE_MARKERS: [&str; 13] = [
    ".end sparse-switch",
    ".end packed-switch",
    ".end array-data",
    "value = {",
    ".end annotation",
    "if-eq",
    "if-ne",
    "if-lt",
    "if-ge",
    "if-gt",
    "if-le",
    "goto",
    "try_end",
];

#[derive(Debug)]
pub struct CodeReorder {
    root: PathBuf,
    filter: PathFilter,
}

impl CodeReorder {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            filter: PathFilter::excluding(DEFAULT_EXCLUDES),
        }
    }

    pub fn with_filter(mut self, filter: PathFilter) -> Self {
        self.filter = filter;
        self
    }
}

impl Transform for CodeReorder {
    fn name(&self) -> &'static str {
        "CodeReorder"
    }

    fn apply(&self, rng: &mut StdRng) -> Result<PassReport, TransformError> {
        let mut report = PassReport::default();
        let files = scanner::collect_files(&self.root, Some("smali"), &self.filter)?;
        for path in &files {
            let mut file = SmaliFile::read(path)?;
            let mut reordered = 0;
            let rewritten = patterns::rewrite_methods(file.text(), |_, body| {
                let new_body = reorder_method(body, rng)?;
                reordered += 1;
                Some(new_body)
            });
            if reordered > 0 {
                file.rewrite(rewritten)?;
                report.files_rewritten += 1;
                report.mutations += reordered;
            }
        }
        Ok(report)
    }
}

/// Reorders one method body, or returns `None` when the method must stay
/// untouched.
fn reorder_method(body: &str, rng: &mut StdRng) -> Option<String> {
    if ORDER_SENSITIVE_MARKERS.iter().any(|m| body.contains(m)) {
        return None;
    }
    let mut lines = body
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(str::to_string);

    // The first body line (normally the `.locals` directive) stays pinned.
    let local = lines.next()?;
    let units = atomic_units(lines);
    if units.is_empty() {
        return None;
    }

    let mut order: Vec<usize> = (1..=units.len()).collect();
    order.shuffle(rng);

    let mut out = String::with_capacity(body.len() + units.len() * 16);
    out.push_str(&local);
    out.push_str(LS);
    out.push_str(LS);
    out.push_str(&format!("goto :i_1{LS}"));
    for &k in &order {
        out.push_str(&format!(":i_{k}{LS}"));
        out.push_str(&units[k - 1]);
        out.push_str(LS);
        if k < units.len() {
            out.push_str(&format!("goto :i_{}{LS}", k + 1));
        }
    }
    Some(out)
}

/// Groups instruction lines into atomic units: an `invoke` is fused with an
/// immediately following `move-result`, which may never be separated from
/// it.
fn atomic_units(mut lines: impl Iterator<Item = String>) -> Vec<String> {
    let mut units = Vec::new();
    let mut pending: Option<String> = None;
    loop {
        let s = match pending.take() {
            Some(s) => s,
            None => match lines.next() {
                Some(s) => s,
                None => break,
            },
        };
        if !s.contains("invoke") {
            units.push(s);
            continue;
        }
        match lines.next() {
            Some(follow) if follow.contains("move") => {
                units.push(format!("{s}{LS}{follow}"));
            }
            Some(follow) => {
                units.push(s);
                if follow.contains("invoke") {
                    pending = Some(follow);
                } else {
                    units.push(follow);
                }
            }
            None => units.push(s),
        }
    }
    units
}
