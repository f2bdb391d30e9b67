//! Junk insertion: claims three fresh registers in small methods and weaves
//! inert arithmetic and never-taken conditional jumps through them.
//!
//! Junk that uses the new registers is only legal after the `.locals` bump
//! that allocates them, so insertion at an `invoke` is armed by the bump and
//! disarmed again at the end of the method.

use std::path::PathBuf;

use dexcloak_core::patterns::{self, LS};
use dexcloak_core::scanner::{self, PathFilter};
use dexcloak_core::smali::SmaliFile;
use dexcloak_utils::errors::TransformError;
use rand::rngs::StdRng;
use rand::Rng;

use crate::util::parse_templates;
use crate::{PassReport, Transform};

const DEFAULT_EXCLUDES: [&str; 3] = ["android", "adwo", "google"];

const DEFAULT_TEMPLATES: &str = include_str!("templates/junk_instr.txt");

/// Number of plain two-register templates at the head of the resource; the
/// entries after them are the conditional-jump compounds.
const TWO_REG_TEMPLATES: usize = 6;

/// `.locals` values above this are left alone; the three extra registers
/// must stay within the 4-bit register range of the junk instructions.
const LOCALS_CEILING: usize = 5;

/// New registers allocated per eligible method.
const NEW_REGISTERS: usize = 3;

pub struct JunkInsertion {
    root: PathBuf,
    filter: PathFilter,
    templates: Vec<String>,
}

impl std::fmt::Debug for JunkInsertion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JunkInsertion")
            .field("root", &self.root)
            .field("templates", &self.templates.len())
            .finish()
    }
}

impl JunkInsertion {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            filter: PathFilter::excluding(DEFAULT_EXCLUDES),
            templates: parse_templates(DEFAULT_TEMPLATES),
        }
    }

    pub fn with_filter(mut self, filter: PathFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Replaces the built-in template resource.
    pub fn with_template_text(mut self, text: &str) -> Self {
        self.templates = parse_templates(text);
        self
    }
}

impl Transform for JunkInsertion {
    fn name(&self) -> &'static str {
        "JunkInsertion"
    }

    fn apply(&self, rng: &mut StdRng) -> Result<PassReport, TransformError> {
        if self.templates.len() <= TWO_REG_TEMPLATES {
            return Err(TransformError::MalformedTemplate(
                "resource must hold two-register and jump templates".to_string(),
            ));
        }
        let mut report = PassReport::default();
        let files = scanner::collect_files(&self.root, Some("smali"), &self.filter)?;
        // One label counter per invocation keeps every jump-target pair
        // unique across all files.
        let mut label_counter = 0usize;
        for path in &files {
            let mut file = SmaliFile::read(path)?;
            let (text, inserted) =
                self.insert_junk(file.text(), rng, &mut label_counter)?;
            if inserted > 0 {
                file.rewrite(text)?;
                report.files_rewritten += 1;
                report.mutations += inserted;
            }
        }
        Ok(report)
    }
}

impl JunkInsertion {
    fn insert_junk(
        &self,
        text: &str,
        rng: &mut StdRng,
        label_counter: &mut usize,
    ) -> Result<(String, usize), TransformError> {
        let mut out = String::with_capacity(text.len());
        let mut regs: Vec<String> = Vec::new();
        let mut armed = false;
        let mut inserted = 0;
        for line in text.split_inclusive('\n') {
            if let Some(locals) = patterns::parse_locals(line) {
                if locals > LOCALS_CEILING {
                    out.push_str(line);
                    continue;
                }
                let eol = line_terminator(line);
                out.push_str(&patterns::with_locals(
                    line.trim_end_matches(['\r', '\n']),
                    locals + NEW_REGISTERS,
                ));
                out.push_str(eol);
                regs = (0..NEW_REGISTERS).map(|i| format!("v{}", locals + i)).collect();
                for reg in &regs {
                    out.push_str(&one_reg_const(reg));
                    inserted += 1;
                }
                // A register may be initialized more than once.
                for _ in 0..rng.random_range(1..=10) {
                    out.push_str(&one_reg_const(&regs[rng.random_range(0..regs.len())]));
                    inserted += 1;
                }
                for _ in 0..rng.random_range(1..=10) {
                    let template = &self.templates[rng.random_range(0..TWO_REG_TEMPLATES)];
                    out.push_str(&self.two_reg(
                        template,
                        &regs[rng.random_range(1..regs.len())],
                        &regs[rng.random_range(0..regs.len())],
                    )?);
                    inserted += 1;
                }
                armed = true;
                continue;
            }
            if line.contains("invoke-") {
                if armed {
                    for _ in 0..rng.random_range(1..=10) {
                        let template = &self.templates[rng.random_range(0..TWO_REG_TEMPLATES)];
                        out.push_str(&self.two_reg(
                            template,
                            &regs[rng.random_range(0..regs.len())],
                            &regs[rng.random_range(0..regs.len())],
                        )?);
                        inserted += 1;
                    }
                    for _ in 0..rng.random_range(1..=10) {
                        let template = &self.templates
                            [rng.random_range(TWO_REG_TEMPLATES..self.templates.len())];
                        out.push_str(&self.two_reg_jump(
                            template,
                            &regs[rng.random_range(0..regs.len())],
                            &regs[rng.random_range(0..regs.len())],
                            label_counter,
                        )?);
                        inserted += 2;
                    }
                    out.push_str(LS);
                    armed = false;
                }
                out.push_str(line);
                continue;
            }
            if line.contains(".end method") {
                armed = false;
            }
            out.push_str(line);
        }
        Ok((out, inserted))
    }

    /// Substitutes the two `VV` register slots of a plain template.
    fn two_reg(&self, template: &str, reg1: &str, reg2: &str) -> Result<String, TransformError> {
        let mut parts = template.split("VV");
        match (parts.next(), parts.next()) {
            (Some(a), Some(b)) => Ok(format!("{a}{reg1}{b}{reg2}{LS}")),
            _ => Err(TransformError::MalformedTemplate(template.to_string())),
        }
    }

    /// Substitutes the register slots of a jump template and gives its
    /// `TT` label pair a fresh unique name. The jump only ever reaches the
    /// next line.
    fn two_reg_jump(
        &self,
        template: &str,
        reg1: &str,
        reg2: &str,
        label_counter: &mut usize,
    ) -> Result<String, TransformError> {
        let mut parts = template.split("VV");
        let with_regs = match (parts.next(), parts.next(), parts.next()) {
            (Some(a), Some(b), Some(c)) => format!("{a}{reg1}{b}{reg2}{c}"),
            _ => return Err(TransformError::MalformedTemplate(template.to_string())),
        };
        let label = format!("Target_{label_counter}");
        *label_counter += 1;
        let mut parts = with_regs.split("TT");
        match (parts.next(), parts.next()) {
            (Some(a), Some(b)) => Ok(format!("{a}{label}{b}{label}{LS}")),
            _ => Err(TransformError::MalformedTemplate(template.to_string())),
        }
    }
}

fn one_reg_const(reg: &str) -> String {
    format!("const/4 {reg},0x0{LS}")
}

fn line_terminator(line: &str) -> &'static str {
    if line.ends_with("\r\n") {
        "\r\n"
    } else if line.ends_with('\n') {
        "\n"
    } else {
        ""
    }
}
