//! Call indirection: replaces call sites with calls to synthesized static
//! methods that perform the original dispatch.
//!
//! Every class in a smali directory is compiled into one dex file, which can
//! hold at most 65536 method references, so the pass is constructed with a
//! per-directory budget of methods it may still add (see
//! [`dexcloak_core::dexdump`]).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use dexcloak_core::patterns::{self, ClassHeader, DispatchKind, InvocationSite, LS, TAB};
use dexcloak_core::scanner::{self, PathFilter};
use dexcloak_core::smali::SmaliFile;
use dexcloak_utils::errors::TransformError;
use rand::rngs::StdRng;
use tracing::{debug, info};

use crate::{PassReport, Transform};

const DEFAULT_EXCLUDES: [&str; 3] = ["android", "androidx", "kotlin"];

/// Cap on substitutions per class, so one dex's budget is spread over many
/// classes instead of drained by the first few files.
const PER_CLASS_CAP: usize = 3;

pub struct CallIndirection {
    dirs_by_budget: Vec<(PathBuf, usize)>,
    filter: PathFilter,
}

impl std::fmt::Debug for CallIndirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallIndirection")
            .field("dirs", &self.dirs_by_budget.len())
            .finish()
    }
}

impl CallIndirection {
    /// `dirs_by_budget` pairs each smali package directory with the number
    /// of methods its dex may still receive.
    pub fn new(dirs_by_budget: Vec<(PathBuf, usize)>) -> Self {
        Self {
            dirs_by_budget,
            filter: PathFilter::excluding(DEFAULT_EXCLUDES),
        }
    }

    pub fn with_filter(mut self, filter: PathFilter) -> Self {
        self.filter = filter;
        self
    }
}

impl Transform for CallIndirection {
    fn name(&self) -> &'static str {
        "CallIndirection"
    }

    fn apply(&self, _rng: &mut StdRng) -> Result<PassReport, TransformError> {
        let mut report = PassReport::default();
        for (dir, budget) in &self.dirs_by_budget {
            process_directory(dir, *budget, &self.filter, &mut report)?;
        }
        Ok(report)
    }
}

fn process_directory(
    dir: &Path,
    budget: usize,
    filter: &PathFilter,
    report: &mut PassReport,
) -> Result<(), TransformError> {
    let files = scanner::collect_files(dir, Some("smali"), filter)?;
    // Fresh registry per directory: a scope key never maps to two
    // synthesized methods within one invocation.
    let mut registry: HashMap<String, String> = HashMap::new();
    let mut method_number: usize = 1;
    let mut added = 0;
    for path in &files {
        let mut file = SmaliFile::read(path)?;
        let Some(header) = file.class_header() else {
            debug!("no class header, skipping {}", path.display());
            continue;
        };
        let guarded = guarded_fields(file.text());
        let outcome = rewrite_file(
            file.text(),
            &header,
            &guarded,
            &mut registry,
            &mut method_number,
            budget,
        );
        if let Some(text) = outcome.text {
            file.rewrite(text)?;
            report.files_rewritten += 1;
            report.mutations += outcome.sites;
            report.methods_synthesized += outcome.added;
            added += outcome.added;
        }
    }
    info!("{}: {} methods added", dir.display(), added);
    Ok(())
}

struct FileOutcome {
    text: Option<String>,
    sites: usize,
    added: usize,
}

fn rewrite_file(
    text: &str,
    header: &ClassHeader,
    guarded: &[String],
    registry: &mut HashMap<String, String>,
    method_number: &mut usize,
    budget: usize,
) -> FileOutcome {
    let mut out = String::with_capacity(text.len());
    let mut appended = String::new();
    let mut count = 0;
    let mut sites = 0;
    let mut added = 0;
    let mut offset = 0;
    for line in text.split_inclusive('\n') {
        let line_start = offset;
        offset += line.len();
        if count >= PER_CLASS_CAP {
            out.push_str(line);
            continue;
        }
        let Some(site) = patterns::parse_invocation(line) else {
            out.push_str(line);
            continue;
        };
        // Arguments holding the last-assigned value of a private volatile
        // field cannot legally cross into a method outside this class.
        if !guarded.is_empty()
            && registers_hold_guarded(&text[..line_start], &site.registers, guarded)
        {
            out.push_str(line);
            continue;
        }
        let signature = site.signature();
        let scoped = format!("{}{}", header.source, signature);
        let reused = registry
            .get(&signature)
            .or_else(|| registry.get(&scoped))
            .cloned();
        let method_ref = match reused {
            Some(m) => m,
            None => {
                if *method_number >= budget {
                    // Budget spent: existing indirections stay usable but no
                    // new method may be synthesized for this dex.
                    out.push_str(line);
                    continue;
                }
                let m = synthesized_reference(header, &site, *method_number);
                let key = if header.is_public() { signature.clone() } else { scoped };
                registry.insert(key, m.clone());
                appended.push_str(&synthesized_method(&site, *method_number, &signature));
                *method_number += 1;
                added += 1;
                m
            }
        };
        let indent = &line[..line.len() - line.trim_start().len()];
        let eol = if line.ends_with("\r\n") {
            "\r\n"
        } else if line.ends_with('\n') {
            "\n"
        } else {
            ""
        };
        out.push_str(&format!(
            "{indent}invoke-static {}, {method_ref}{eol}",
            site.registers
        ));
        sites += 1;
        count += 1;
    }
    if sites == 0 {
        return FileOutcome { text: None, sites, added };
    }
    out.push_str(LS);
    out.push_str(&appended);
    FileOutcome { text: Some(out), sites, added }
}

/// Names of `private volatile` fields declared by the class.
fn guarded_fields(text: &str) -> Vec<String> {
    text.lines()
        .filter_map(patterns::parse_field)
        .filter(|f| {
            let mods: Vec<&str> = f.modifiers.split_whitespace().collect();
            mods.contains(&"private") && mods.contains(&"volatile")
        })
        .map(|f| f.name)
        .collect()
}

/// Textual backward scan over the file up to the call site: for each
/// argument register, the last `<reg>, "<literal>"` assignment is compared
/// against the guarded field names. Not a dataflow analysis; around
/// branches it can under- or over-approximate.
fn registers_hold_guarded(prefix: &str, registers: &str, fields: &[String]) -> bool {
    for reg in patterns::register_tokens(registers) {
        let needle = format!("{reg}, \"");
        let mut last: Option<&str> = None;
        let mut from = 0;
        while let Some(pos) = prefix[from..].find(&needle) {
            let start = from + pos + needle.len();
            let line_end = prefix[start..]
                .find('\n')
                .map_or(prefix.len(), |i| start + i);
            if let Some(q) = prefix[start..line_end].rfind('"') {
                last = Some(&prefix[start..start + q]);
            }
            from = start;
        }
        if let Some(value) = last {
            if fields.iter().any(|f| f == value) {
                return true;
            }
        }
    }
    false
}

/// Reference to the synthesized method, as used at the rewritten call site.
/// For virtual dispatch the receiver's class is prepended to the parameter
/// list, matching the extra `p0` the new method takes.
fn synthesized_reference(header: &ClassHeader, site: &InvocationSite, n: usize) -> String {
    let receiver = match site.kind {
        DispatchKind::Virtual => site.class.as_str(),
        DispatchKind::Static => "",
    };
    format!(
        "{}->method{}({}{}){}",
        header.name, n, receiver, site.params, site.return_type
    )
}

/// Body of the synthesized static method: re-issues the original dispatch
/// against renumbered parameter registers, then moves and returns the
/// result with the type-appropriate variants.
fn synthesized_method(site: &InvocationSite, n: usize, signature: &str) -> String {
    let receiver = match site.kind {
        DispatchKind::Virtual => site.class.as_str(),
        DispatchKind::Static => "",
    };
    let (locals, suffix) = match site.return_type.as_str() {
        "V" => (0, format!("-void{LS}")),
        "J" | "D" => (2, format!("-wide v0{LS}")),
        r if r.starts_with('L') || r.starts_with('[') => (1, format!("-object v0{LS}")),
        _ => (1, format!(" v0{LS}")),
    };
    let mut body = format!(
        ".method public static method{n}({receiver}{}){}{LS}",
        site.params, site.return_type
    );
    body.push_str(&format!("{TAB}.locals {locals}{LS}{LS}"));
    body.push_str(&format!("{TAB}invoke-{} {{", site.kind));
    let registers = site.register_count();
    for i in 0..registers {
        body.push_str(&format!("p{i}"));
        if i + 1 != registers {
            body.push_str(", ");
        }
    }
    body.push_str(&format!("}}, {signature}{LS}{LS}"));
    if !site.is_void() {
        body.push_str(&format!("{TAB}move-result{suffix}{LS}"));
    }
    body.push_str(&format!("{TAB}return{suffix}"));
    body.push_str(&format!(".end method{LS}{LS}"));
    body
}
