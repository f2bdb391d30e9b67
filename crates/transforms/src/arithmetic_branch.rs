//! Arithmetic branching: guards each method body with an always-satisfied
//! arithmetic condition whose alternate edge is structurally dead.
//!
//! Both outcomes of the inserted branch reach the original body exactly
//! once: the taken path falls straight through, the untaken path jumps past
//! the body to an unconditional jump back to its start. The shape is kept
//! exactly as documented even though one outcome can never fire.

use std::path::PathBuf;

use dexcloak_core::patterns::{self, LS, TAB};
use dexcloak_core::scanner::{self, PathFilter};
use dexcloak_core::smali::SmaliFile;
use dexcloak_utils::errors::TransformError;
use rand::rngs::StdRng;
use rand::Rng;

use crate::util::random_ident;
use crate::{PassReport, Transform};

const DEFAULT_EXCLUDES: [&str; 4] = ["android", "androidx", "kotlin", "google"];

const LABEL_LEN: usize = 16;

#[derive(Debug)]
pub struct ArithmeticBranching {
    root: PathBuf,
    filter: PathFilter,
}

impl ArithmeticBranching {
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

impl Transform for ArithmeticBranching {
    fn name(&self) -> &'static str {
        "ArithmeticBranching"
    }

    fn apply(&self, rng: &mut StdRng) -> Result<PassReport, TransformError> {
        let mut report = PassReport::default();
        let files = scanner::collect_files(&self.root, Some("smali"), &self.filter)?;
        for path in &files {
            let mut file = SmaliFile::read(path)?;
            let mut inserted = 0;
            let rewritten = patterns::rewrite_methods(file.text(), |header, body| {
                if header.contains("abstract") || header.contains("native") {
                    return None;
                }
                let branched = branch_body(body, rng)?;
                inserted += 1;
                Some(branched)
            });
            if inserted > 0 {
                file.rewrite(rewritten)?;
                report.files_rewritten += 1;
                report.mutations += inserted;
            }
        }
        Ok(report)
    }
}

/// Splits the body at its `.locals` directive and wraps the rest in the
/// branch shape. Methods without the directive or with fewer than two local
/// registers are left alone; the inserted constants and arithmetic need v0
/// and v1 to scribble on.
fn branch_body(body: &str, rng: &mut StdRng) -> Option<String> {
    let locals_at = body
        .split_inclusive('\n')
        .scan(0, |offset, line| {
            let start = *offset;
            *offset += line.len();
            Some((start, line))
        })
        .find(|(_, line)| patterns::parse_locals(line).is_some())?;
    let (locals_start, locals_line) = locals_at;
    let locals = patterns::parse_locals(locals_line)?;
    if locals < 2 {
        return None;
    }

    let directive = locals_line.trim_end_matches(['\r', '\n']);
    let rest = &body[locals_start + locals_line.len()..];

    let start_label = random_ident(rng, LABEL_LEN);
    let end_label = random_ident(rng, LABEL_LEN);
    let temp_label = random_ident(rng, LABEL_LEN);
    let a = rng.random_range(1..=32);
    let b = rng.random_range(1..=32);

    let mut out = String::with_capacity(body.len() + 256);
    out.push_str(&body[..locals_start]);
    out.push_str(directive);
    out.push_str(&format!("{LS}{LS}"));
    out.push_str(&format!("{TAB}const v0, 0x{a:X}{LS}{LS}"));
    out.push_str(&format!("{TAB}const v1, 0x{b:X}{LS}{LS}"));
    out.push_str(&format!("{TAB}add-int v0, v0, v1{LS}{LS}"));
    out.push_str(&format!("{TAB}rem-int v0, v0, v1{LS}{LS}"));
    out.push_str(&format!("{TAB}if-gtz v0, :{temp_label}{LS}{LS}"));
    out.push_str(&format!("{TAB}goto/32 :{end_label}{LS}{LS}"));
    out.push_str(&format!("{TAB}:{temp_label}{LS}{LS}"));
    out.push_str(&format!("{TAB}:{start_label}"));
    out.push_str(rest);
    out.push_str(LS);
    out.push_str(&format!("{TAB}:{end_label}{LS}{LS}"));
    out.push_str(&format!("{TAB}goto/32 :{start_label}{LS}"));
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use std::fs;

    fn write_class(dir: &std::path::Path, body: &str) -> std::path::PathBuf {
        let path = dir.join("Foo.smali");
        fs::write(
            &path,
            format!(".class public Lcom/app/Foo;\n.source \"Foo.java\"\n\n{body}"),
        )
        .unwrap();
        path
    }

    #[test]
    fn wraps_body_in_branch_shape() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_class(
            dir.path(),
            ".method public run()V\n    .locals 2\n\n    const/4 v0, 0x0\n\n    return-void\n.end method\n",
        );
        let pass = ArithmeticBranching::new(dir.path().to_path_buf());
        let mut rng = StdRng::seed_from_u64(9);
        let report = pass.apply(&mut rng).unwrap();
        assert_eq!(report.mutations, 1);

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("\tadd-int v0, v0, v1\n"));
        assert!(text.contains("\trem-int v0, v0, v1\n"));
        assert!(text.contains("\tif-gtz v0, :"));
        assert!(text.contains("\tgoto/32 :"));
        // The original body survives between the inserted labels.
        assert!(text.contains("const/4 v0, 0x0"));
        assert!(text.contains("return-void"));
        // Three distinct 16-char labels, each declared once.
        let labels: Vec<&str> = text
            .lines()
            .filter_map(|l| l.trim().strip_prefix(':'))
            .collect();
        assert_eq!(labels.len(), 3);
        assert!(labels.iter().all(|l| l.len() == 16));
    }

    #[test]
    fn deterministic_for_a_fixed_seed() {
        let make = || {
            let dir = tempfile::tempdir().unwrap();
            let path = write_class(
                dir.path(),
                ".method public run()V\n    .locals 2\n\n    return-void\n.end method\n",
            );
            let pass = ArithmeticBranching::new(dir.path().to_path_buf());
            let mut rng = StdRng::seed_from_u64(42);
            pass.apply(&mut rng).unwrap();
            fs::read_to_string(&path).unwrap()
        };
        assert_eq!(make(), make());
    }

    #[test]
    fn skips_abstract_native_and_small_methods() {
        let dir = tempfile::tempdir().unwrap();
        let body = ".method public abstract run()V\n.end method\n\n.method public native go()V\n.end method\n\n.method public tiny()V\n    .locals 1\n\n    return-void\n.end method\n";
        let path = write_class(dir.path(), body);
        let before = fs::read_to_string(&path).unwrap();
        let pass = ArithmeticBranching::new(dir.path().to_path_buf());
        let mut rng = StdRng::seed_from_u64(9);
        let report = pass.apply(&mut rng).unwrap();
        assert_eq!(report.mutations, 0);
        assert_eq!(fs::read_to_string(&path).unwrap(), before);
    }
}
