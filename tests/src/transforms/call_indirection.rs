use dexcloak_core::dexdump;
use dexcloak_transform::call_indirection::CallIndirection;
use dexcloak_transform::Transform;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::fs;
use std::io::Cursor;
use std::path::Path;

fn write_caller(dir: &Path, class: &str, source: &str) {
    let name = class.rsplit('/').next().unwrap().trim_end_matches(';');
    fs::write(
        dir.join(format!("{name}.smali")),
        format!(
            ".class public {class}\n.super Ljava/lang/Object;\n.source \"{source}\"\n\n.method public run(Ljava/lang/String;)V\n    .locals 1\n\n    invoke-virtual {{p0}}, Ljava/lang/String;->trim()Ljava/lang/String;\n\n    move-result-object v0\n\n    return-void\n.end method\n"
        ),
    )
    .unwrap();
}

/// Budget flows from the streamed dump into the pass: the ceiling minus the
/// dump's method population is what the pass may spend.
#[test]
fn budget_from_dump_limits_synthesis() {
    let mut dump = String::new();
    for i in 0..100 {
        // One declared method per class, no shared references.
        dump.push_str(&format!(
            "Class #{i}            -\n  Direct methods    -\n    #0              : (in Lg/C{i};)\n      name          : 'm'\n      type          : '()V'\n  source_file_idx   : 0 (C.java)\n"
        ));
    }
    let counted = dexdump::count_methods(Cursor::new(&dump), 256).unwrap();
    assert_eq!(counted, 100);
    let budget = dexdump::DEX_METHOD_CEILING - counted;

    let dir = tempfile::tempdir().unwrap();
    write_caller(dir.path(), "Lcom/app/A;", "A.java");
    write_caller(dir.path(), "Lcom/app/B;", "B.java");

    let pass = CallIndirection::new(vec![(dir.path().to_path_buf(), budget)]);
    let mut rng = StdRng::seed_from_u64(1);
    let report = pass.apply(&mut rng).unwrap();
    assert!(report.methods_synthesized <= budget - 1);
    assert_eq!(report.mutations, 2);
}

/// Public classes dedup on the raw signature even across different source
/// tags; the second file reuses the first file's synthesized method.
#[test]
fn public_classes_dedup_across_files() {
    let dir = tempfile::tempdir().unwrap();
    write_caller(dir.path(), "Lcom/app/A;", "A.java");
    write_caller(dir.path(), "Lcom/app/B;", "B.java");

    let pass = CallIndirection::new(vec![(dir.path().to_path_buf(), 1000)]);
    let mut rng = StdRng::seed_from_u64(1);
    let report = pass.apply(&mut rng).unwrap();
    assert_eq!(report.methods_synthesized, 1);
    assert_eq!(report.mutations, 2);

    let b_text = fs::read_to_string(dir.path().join("B.smali")).unwrap();
    assert!(b_text.contains(
        "invoke-static {p0}, Lcom/app/A;->method1(Ljava/lang/String;)Ljava/lang/String;"
    ));
    assert!(!b_text.contains(".method public static"));
}
