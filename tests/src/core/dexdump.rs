use dexcloak_core::dexdump::{count_methods, method_budget, DEX_METHOD_CEILING};
use std::io::{Cursor, Write};

/// Builds a dump with `classes` classes, each declaring two methods and
/// referencing two shared external ones.
fn synthetic_dump(classes: usize) -> String {
    let mut dump = String::new();
    for i in 0..classes {
        dump.push_str(&format!("Class #{i}            -\n"));
        dump.push_str(&format!("  Class descriptor  : 'Lcom/gen/C{i};'\n"));
        dump.push_str("  Instance fields   -\n");
        dump.push_str("    #0              : (in Lcom/gen/C0;)\n");
        dump.push_str("      name          : 'field'\n");
        dump.push_str("  Direct methods    -\n");
        dump.push_str(&format!("    #0              : (in Lcom/gen/C{i};)\n"));
        dump.push_str("      name          : '<init>'\n");
        dump.push_str("      type          : '()V'\n");
        dump.push_str("      code          -\n");
        dump.push_str("        |0000: invoke-direct {v0}, Ljava/lang/Object;.<init>:()V // method@0001\n");
        dump.push_str("  Virtual methods   -\n");
        dump.push_str(&format!("    #0              : (in Lcom/gen/C{i};)\n"));
        dump.push_str("      name          : 'work'\n");
        dump.push_str("      type          : '(I)I'\n");
        dump.push_str("      code          -\n");
        dump.push_str("        |0000: invoke-static {v0}, Ljava/lang/Math;.abs:(I)I // method@0042\n");
        dump.push_str(&format!("  source_file_idx   : {i} (C{i}.java)\n\n"));
    }
    dump
}

#[test]
fn declared_and_referenced_methods_count_once() {
    let dump = synthetic_dump(10);
    // 2 declared per class plus the 2 shared references.
    let count = count_methods(Cursor::new(&dump), 1 << 20).unwrap();
    assert_eq!(count, 10 * 2 + 2);
}

#[test]
fn fields_sections_do_not_count() {
    let dump = synthetic_dump(1);
    // "name : 'field'" sits in the instance-fields table and must not be
    // picked up as a method.
    let count = count_methods(Cursor::new(&dump), 1 << 20).unwrap();
    assert_eq!(count, 4);
}

#[test]
fn tiny_chunks_agree_with_one_shot_reads() {
    let dump = synthetic_dump(40);
    let reference = count_methods(Cursor::new(&dump), dump.len()).unwrap();
    for chunk_size in [1, 13, 100, 4096] {
        assert_eq!(
            count_methods(Cursor::new(&dump), chunk_size).unwrap(),
            reference,
            "chunk size {chunk_size}"
        );
    }
}

#[test]
fn budget_is_ceiling_minus_count() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dump1.txt");
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(synthetic_dump(5).as_bytes()).unwrap();
    drop(file);

    let budget = method_budget(&path).unwrap();
    assert_eq!(budget, DEX_METHOD_CEILING - 12);
}
