//! String encryption: Caesar-shifts string literals and chains a runtime
//! decrypt call onto the loaded register.

use std::path::PathBuf;

use dexcloak_core::patterns::{self, LS, TAB};
use dexcloak_core::scanner::{self, PathFilter};
use dexcloak_core::smali::{self, SmaliFile};
use dexcloak_utils::errors::TransformError;
use rand::rngs::StdRng;

use crate::{PassReport, Transform};

const DEFAULT_EXCLUDES: [&str; 4] = ["android", "androidx", "kotlin", "google"];

/// Literal rewrites per file.
const MAX_PER_FILE: usize = 15;

/// Shift applied when encrypting; the helper undoes it at runtime.
const SHIFT: i32 = 2;

const DECRYPT_CALL: &str =
    "Lcom/123456789/Decrypter;->applyCaesar(Ljava/lang/String;)Ljava/lang/String;";
const HELPER_FILE: &str = "Decrypter.smali";
const HELPER_TEMPLATE: &str = include_str!("templates/decrypter.smali");

#[derive(Debug)]
pub struct StringEncryption {
    root: PathBuf,
    filter: PathFilter,
}

impl StringEncryption {
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

impl Transform for StringEncryption {
    fn name(&self) -> &'static str {
        "StringEncryption"
    }

    fn apply(&self, _rng: &mut StdRng) -> Result<PassReport, TransformError> {
        let mut report = PassReport::default();
        let files = scanner::collect_files(&self.root, Some("smali"), &self.filter)?;
        for path in &files {
            let mut file = SmaliFile::read(path)?;
            let (text, encrypted) = encrypt_file(file.text());
            if encrypted > 0 {
                file.rewrite(text)?;
                report.files_rewritten += 1;
                report.mutations += encrypted;
            }
        }
        if report.mutations > 0 {
            materialize_helper(&self.root)?;
        }
        Ok(report)
    }
}

fn encrypt_file(text: &str) -> (String, usize) {
    let mut out = String::with_capacity(text.len());
    let mut encrypted = 0;
    for line in text.split_inclusive('\n') {
        if encrypted >= MAX_PER_FILE {
            out.push_str(line);
            continue;
        }
        let Some(load) = patterns::parse_const_string(line) else {
            out.push_str(line);
            continue;
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
            "{indent}{} {}, \"{}\"{LS}",
            load.mnemonic,
            load.register,
            apply_caesar(&load.literal, SHIFT)
        ));
        out.push_str(&format!(
            "{TAB}invoke-static {{{}}}, {DECRYPT_CALL}{LS}",
            load.register
        ));
        out.push_str(&format!("{TAB}move-result-object {}{eol}", load.register));
        encrypted += 1;
    }
    (out, encrypted)
}

/// Caesar shift over the printable range (32..=127, modulo 96).
///
/// Pass-through set: quote, space, newline, tab, apostrophe, `X` and `Z`,
/// plus a backslash and the up-to-five printable characters after it, so
/// escape sequences (including `\uXXXX`) survive untouched.
fn apply_caesar(text: &str, shift: i32) -> String {
    let mut out = String::with_capacity(text.len());
    let mut skip = 0u8;
    for c in text.chars() {
        if c == '\\' {
            skip = 5;
            out.push(c);
            continue;
        }
        if matches!(c, '"' | ' ' | '\n' | '\t' | '\'' | 'X' | 'Z') {
            out.push(c);
            continue;
        }
        if !('\u{20}'..='\u{7f}').contains(&c) {
            out.push(c);
            continue;
        }
        if skip > 0 {
            skip -= 1;
            out.push(c);
            continue;
        }
        let x = (c as i32 - 32 + shift).rem_euclid(96);
        out.push(char::from_u32((x + 32) as u32).unwrap_or(c));
    }
    out
}

fn materialize_helper(root: &std::path::Path) -> Result<(), TransformError> {
    let smali_root = smali::smali_root(root)
        .ok_or_else(|| TransformError::NoSmaliRoot(root.display().to_string()))?;
    let path = smali_root.join("com").join("123456789").join(HELPER_FILE);
    if !path.exists() {
        smali::write_support_file(&path, HELPER_TEMPLATE)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use std::fs;

    #[test]
    fn caesar_matches_the_documented_formula() {
        // (c - 32 + 2) mod 96 + 32 per character.
        assert_eq!(apply_caesar("Hi", 2), "Jk");
        // Pass-through characters survive unshifted.
        assert_eq!(apply_caesar("X Z'\t", 2), "X Z'\t");
        // Escapes keep their introducer and payload.
        assert_eq!(apply_caesar("\\n", 2), "\\n");
        assert_eq!(apply_caesar("\\u0041", 2), "\\u0041");
    }

    #[test]
    fn literal_gets_decrypt_call_on_same_register() {
        let dir = tempfile::tempdir().unwrap();
        let pkg = dir.path().join("smali").join("com").join("app");
        fs::create_dir_all(&pkg).unwrap();
        let path = pkg.join("Foo.smali");
        fs::write(
            &path,
            ".class public Lcom/app/Foo;\n.source \"Foo.java\"\n\n.method public run()V\n    .locals 1\n\n    const-string v0, \"Hi\"\n\n    return-void\n.end method\n",
        )
        .unwrap();

        let pass = StringEncryption::new(dir.path().join("smali").join("com").join("app"));
        let mut rng = StdRng::seed_from_u64(1);
        let report = pass.apply(&mut rng).unwrap();
        assert_eq!(report.mutations, 1);

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("const-string v0, \"Jk\""));
        assert!(text.contains(&format!("\tinvoke-static {{v0}}, {DECRYPT_CALL}")));
        assert!(text.contains("\tmove-result-object v0"));

        let helper = dir
            .path()
            .join("smali")
            .join("com")
            .join("123456789")
            .join(HELPER_FILE);
        assert!(helper.exists());
        assert!(fs::read_to_string(&helper)
            .unwrap()
            .contains(".method public static applyCaesar(Ljava/lang/String;)Ljava/lang/String;"));
    }

    #[test]
    fn per_file_cap_is_fifteen() {
        let dir = tempfile::tempdir().unwrap();
        let pkg = dir.path().join("smali").join("com").join("app");
        fs::create_dir_all(&pkg).unwrap();
        let path = pkg.join("Foo.smali");
        let loads = "    const-string v0, \"x\"\n\n".repeat(20);
        fs::write(
            &path,
            format!(
                ".class public Lcom/app/Foo;\n.source \"Foo.java\"\n\n.method public run()V\n    .locals 1\n\n{loads}    return-void\n.end method\n"
            ),
        )
        .unwrap();

        let pass = StringEncryption::new(dir.path().join("smali").join("com").join("app"));
        let mut rng = StdRng::seed_from_u64(1);
        let report = pass.apply(&mut rng).unwrap();
        assert_eq!(report.mutations, 15);

        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text.matches("const-string v0, \"x\"").count(), 5);
        assert_eq!(text.matches("move-result-object v0").count(), 15);
    }
}
