//! Identifier renaming: consistent random replacements for the application
//! package's last segment and for its class names, applied across assembly
//! files, resource XML and the manifest.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use dexcloak_core::scanner::{self, PathFilter};
use dexcloak_core::smali::SmaliFile;
use dexcloak_utils::errors::TransformError;
use rand::rngs::StdRng;

use crate::util::random_ident;
use crate::{PassReport, Transform};

const PACKAGE_NAME_LEN: usize = 5;
const CLASS_NAME_LEN: usize = 7;

/// What to rename.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenameOperation {
    Package,
    Classes,
    All,
}

impl RenameOperation {
    fn renames_package(self) -> bool {
        matches!(self, Self::Package | Self::All)
    }

    fn renames_classes(self) -> bool {
        matches!(self, Self::Classes | Self::All)
    }
}

#[derive(Debug)]
pub struct IdentifierRenaming {
    project_root: PathBuf,
    manifest_path: PathBuf,
    operation: RenameOperation,
}

impl IdentifierRenaming {
    /// `manifest` may be absolute or relative to the project root.
    pub fn new(project_root: PathBuf, manifest: &Path, operation: RenameOperation) -> Self {
        let manifest_path = if manifest.is_absolute() {
            manifest.to_path_buf()
        } else {
            project_root.join(manifest)
        };
        Self {
            project_root,
            manifest_path,
            operation,
        }
    }
}

impl Transform for IdentifierRenaming {
    fn name(&self) -> &'static str {
        "IdentifierRenaming"
    }

    fn apply(&self, rng: &mut StdRng) -> Result<PassReport, TransformError> {
        let mut report = PassReport::default();
        let mut manifest = read_text(&self.manifest_path)?;
        let (pkg_prefix, pkg_last) =
            extract_package(&manifest).ok_or(TransformError::ManifestPackage)?;
        let old_dotted = format!("{pkg_prefix}.{pkg_last}");
        let old_slashed = old_dotted.replace('.', "/");

        // Drawn unconditionally so a fixed seed names things identically
        // whatever the operation.
        let new_pkg = random_ident(rng, PACKAGE_NAME_LEN);
        let new_dotted = format!("{pkg_prefix}.{new_pkg}");
        let new_slashed = new_dotted.replace('.', "/");

        if self.operation.renames_package() {
            let res = self.project_root.join("res");
            if res.is_dir() {
                for path in scanner::collect_files(&res, Some("xml"), &PathFilter::default())? {
                    let text = read_text(&path)?;
                    if text.contains(&old_dotted) {
                        write_text(&path, &text.replace(&old_dotted, &new_dotted))?;
                        report.files_rewritten += 1;
                    }
                }
            }
            report.mutations += 1;
        }

        let smali_files = collect_smali_files(&self.project_root)?;

        // One collision-checked replacement name per class under the
        // package. Classes split across several file-parts get one entry
        // per part, keyed by the part's own path.
        let mut classes: HashMap<String, String> = HashMap::new();
        if self.operation.renames_classes() {
            for path in &smali_files {
                let Some(key) = class_key(path) else { continue };
                if !key.starts_with(&format!("{old_slashed}/")) {
                    continue;
                }
                let mut name = random_ident(rng, CLASS_NAME_LEN);
                while classes.values().any(|v| v == &name) {
                    name = random_ident(rng, CLASS_NAME_LEN);
                }
                classes.insert(key, name);
            }
            report.mutations += classes.len();
        }

        for path in &smali_files {
            let mut file = SmaliFile::read(path)?;
            let mut text = file.text().to_string();
            if self.operation.renames_classes() {
                text = rename_class_occurrences(&text, &old_slashed, &classes);
                if let Some(key) = class_key(path) {
                    if let Some(new_name) = classes.get(&key) {
                        text = rename_source_tag(&text, new_name);
                    }
                }
            }
            if self.operation.renames_package() {
                text = text.replace(&old_slashed, &new_slashed);
            }
            if text != file.text() {
                file.rewrite(text)?;
                report.files_rewritten += 1;
            }
        }

        if self.operation.renames_classes() {
            manifest = rename_manifest_classes(&manifest, &old_dotted, &old_slashed, &classes);
        }
        if self.operation.renames_package() {
            manifest = manifest.replace(&old_dotted, &new_dotted);
        }
        write_text(&self.manifest_path, &manifest)?;
        Ok(report)
    }
}

fn read_text(path: &Path) -> Result<String, TransformError> {
    fs::read_to_string(path).map_err(|source| TransformError::FileRead {
        path: path.display().to_string(),
        source,
    })
}

fn write_text(path: &Path, text: &str) -> Result<(), TransformError> {
    fs::write(path, text).map_err(|source| TransformError::FileWrite {
        path: path.display().to_string(),
        source,
    })
}

/// Extracts the manifest's `package` attribute, split into the dotted
/// prefix and the last segment (the part that gets renamed).
fn extract_package(manifest: &str) -> Option<(String, String)> {
    let at = manifest.find("package=\"")?;
    let value = &manifest[at + "package=\"".len()..];
    let end = value.find('"')?;
    let value = &value[..end];
    let (prefix, last) = value.rsplit_once('.')?;
    if last.is_empty() || !last.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_') {
        return None;
    }
    Some((prefix.to_string(), last.to_string()))
}

/// All `.smali` files below a smali root, leaving `support` trees alone.
fn collect_smali_files(project_root: &Path) -> Result<Vec<PathBuf>, TransformError> {
    let filter = PathFilter::excluding(["support"]);
    let files = scanner::collect_files(project_root, Some("smali"), &filter)?;
    Ok(files
        .into_iter()
        .filter(|p| {
            p.components().any(|c| {
                matches!(c, std::path::Component::Normal(n)
                    if n.to_str().is_some_and(|n| n.starts_with("smali")))
            })
        })
        .collect())
}

/// Class map key: the file's path below its smali root, without the
/// extension, e.g. `com/app/MainActivity`.
fn class_key(path: &Path) -> Option<String> {
    let comps: Vec<&str> = path
        .components()
        .filter_map(|c| match c {
            std::path::Component::Normal(n) => n.to_str(),
            _ => None,
        })
        .collect();
    let root = comps.iter().position(|c| c.starts_with("smali"))?;
    let rel = comps.get(root + 1..)?.join("/");
    rel.strip_suffix(".smali").map(str::to_string)
}

/// Rewrites every qualified occurrence of a renamed class. The scan anchors
/// at the package path and reads the longest plausible class-path run after
/// it, so nested classes (`Foo$Bar`) match their own entry rather than a
/// prefix of it.
fn rename_class_occurrences(
    text: &str,
    pkg_slashed: &str,
    classes: &HashMap<String, String>,
) -> String {
    let needle = format!("{pkg_slashed}/");
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = rest.find(&needle) {
        let after = pos + needle.len();
        out.push_str(&rest[..after]);
        let tail = &rest[after..];
        let run = tail
            .bytes()
            .take_while(|b| b.is_ascii_alphanumeric() || matches!(b, b'/' | b'$' | b'-' | b'_'))
            .count();
        let candidate = format!("{pkg_slashed}/{}", &tail[..run]);
        match classes.get(&candidate) {
            Some(new_name) => match tail[..run].rsplit_once('/') {
                Some((dirs, _)) => {
                    out.push_str(dirs);
                    out.push('/');
                    out.push_str(new_name);
                }
                None => out.push_str(new_name),
            },
            None => out.push_str(&tail[..run]),
        }
        rest = &tail[run..];
    }
    out.push_str(rest);
    out
}

/// Replaces the stem of the `.source` tag value, keeping any extension.
fn rename_source_tag(text: &str, new_name: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for line in text.split_inclusive('\n') {
        let trimmed = line.trim_start();
        let Some(rest) = trimmed.strip_prefix(".source \"") else {
            out.push_str(line);
            continue;
        };
        let Some(end) = rest.find('"') else {
            out.push_str(line);
            continue;
        };
        let value = &rest[..end];
        let stem_len = value.find('.').unwrap_or(value.len());
        let indent = &line[..line.len() - trimmed.len()];
        let eol = &rest[end + 1..];
        out.push_str(&format!(
            "{indent}.source \"{new_name}{}\"{eol}",
            &value[stem_len..]
        ));
    }
    out
}

/// Updates `android:name` attributes whose value resolves to a renamed
/// class: fully qualified, package-relative (`.Main`) or bare names.
fn rename_manifest_classes(
    manifest: &str,
    old_dotted: &str,
    old_slashed: &str,
    classes: &HashMap<String, String>,
) -> String {
    const ATTR: &str = "android:name=\"";
    let mut out = String::with_capacity(manifest.len());
    let mut rest = manifest;
    while let Some(pos) = rest.find(ATTR) {
        let after = pos + ATTR.len();
        out.push_str(&rest[..after]);
        let tail = &rest[after..];
        let Some(end) = tail.find('"') else {
            out.push_str(tail);
            return out;
        };
        let value = &tail[..end];
        let key = if let Some(relative) = value.strip_prefix('.') {
            Some(format!("{old_slashed}/{}", relative.replace('.', "/")))
        } else if value.contains('.') {
            value
                .starts_with(old_dotted)
                .then(|| value.replace('.', "/"))
        } else {
            Some(format!("{old_slashed}/{value}"))
        };
        match key.as_deref().and_then(|k| classes.get(k)) {
            Some(new_name) => {
                let prefix_len = value.rfind('.').map_or(0, |i| i + 1);
                out.push_str(&value[..prefix_len]);
                out.push_str(new_name);
            }
            None => out.push_str(value),
        }
        rest = &tail[end..];
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    const MANIFEST: &str = "<manifest package=\"com.example.app\">\n    <application>\n        <activity android:name=\".MainActivity\"/>\n    </application>\n</manifest>\n";

    fn build_project(dir: &Path) {
        let pkg = dir.join("smali").join("com").join("example").join("app");
        fs::create_dir_all(&pkg).unwrap();
        fs::create_dir_all(dir.join("res").join("layout")).unwrap();
        fs::write(dir.join("AndroidManifest.xml"), MANIFEST).unwrap();
        fs::write(
            dir.join("res").join("layout").join("main.xml"),
            "<LinearLayout><view class=\"com.example.app.Widget\"/></LinearLayout>\n",
        )
        .unwrap();
        fs::write(
            pkg.join("MainActivity.smali"),
            ".class public Lcom/example/app/MainActivity;\n.super Ljava/lang/Object;\n.source \"MainActivity.java\"\n\n.method public run()V\n    .locals 1\n\n    invoke-static {}, Lcom/example/app/Widget;->make()V\n\n    return-void\n.end method\n",
        )
        .unwrap();
        fs::write(
            pkg.join("Widget.smali"),
            ".class Lcom/example/app/Widget;\n.super Ljava/lang/Object;\n.source \"Widget.java\"\n",
        )
        .unwrap();
    }

    #[test]
    fn renaming_leaves_no_trace_of_the_old_package() {
        let dir = tempfile::tempdir().unwrap();
        build_project(dir.path());
        let pass = IdentifierRenaming::new(
            dir.path().to_path_buf(),
            Path::new("AndroidManifest.xml"),
            RenameOperation::All,
        );
        let mut rng = StdRng::seed_from_u64(21);
        let report = pass.apply(&mut rng).unwrap();
        assert!(report.mutations >= 3);

        let mut remaining = Vec::new();
        let everything =
            scanner::collect_files(dir.path(), None, &PathFilter::default()).unwrap();
        for path in everything {
            let text = fs::read_to_string(&path).unwrap();
            if text.contains("com/example/app") || text.contains("com.example.app") {
                remaining.push(path);
            }
        }
        assert!(remaining.is_empty(), "old package survives in {remaining:?}");

        let manifest = fs::read_to_string(dir.path().join("AndroidManifest.xml")).unwrap();
        assert!(!manifest.contains("MainActivity"));
        assert!(manifest.contains("android:name=\"."));
    }

    #[test]
    fn class_references_stay_consistent_across_files() {
        let dir = tempfile::tempdir().unwrap();
        build_project(dir.path());
        let pass = IdentifierRenaming::new(
            dir.path().to_path_buf(),
            Path::new("AndroidManifest.xml"),
            RenameOperation::Classes,
        );
        let mut rng = StdRng::seed_from_u64(21);
        pass.apply(&mut rng).unwrap();

        let pkg = dir.path().join("smali").join("com").join("example").join("app");
        let main = fs::read_to_string(pkg.join("MainActivity.smali")).unwrap();
        let widget = fs::read_to_string(pkg.join("Widget.smali")).unwrap();
        // Widget's declared name and the call-site reference agree.
        let declared = widget
            .lines()
            .next()
            .unwrap()
            .rsplit('/')
            .next()
            .unwrap()
            .trim_end_matches(';')
            .to_string();
        assert!(main.contains(&format!("Lcom/example/app/{declared};->make()V")));
        // Both source tags were re-stemmed.
        assert!(!widget.contains(".source \"Widget.java\""));
        assert!(widget.contains(".java\""));
    }

    #[test]
    fn missing_package_attribute_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("AndroidManifest.xml"), "<manifest/>\n").unwrap();
        let pass = IdentifierRenaming::new(
            dir.path().to_path_buf(),
            Path::new("AndroidManifest.xml"),
            RenameOperation::All,
        );
        let mut rng = StdRng::seed_from_u64(21);
        assert!(matches!(
            pass.apply(&mut rng),
            Err(TransformError::ManifestPackage)
        ));
    }
}
