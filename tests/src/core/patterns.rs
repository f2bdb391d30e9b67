use dexcloak_core::patterns::{
    parse_class_header, parse_invocation, parse_locals, register_tokens, DispatchKind,
};

/// The invocation scanner must keep the void-vs-typed return distinction
/// the passes branch on.
#[test]
fn return_tag_capture_semantics() {
    let void = parse_invocation("    invoke-static {v0, v1}, Lcom/a/B;->log(IJ)V").unwrap();
    assert!(void.is_void());
    assert_eq!(void.return_type, "V");

    let wide = parse_invocation("    invoke-virtual {p0}, Lcom/a/B;->now()J").unwrap();
    assert_eq!(wide.return_type, "J");
    assert!(!wide.is_void());

    let array = parse_invocation("    invoke-virtual {p0}, Ljava/lang/String;->getBytes()[B").unwrap();
    assert_eq!(array.return_type, "[B");

    let object = parse_invocation(
        "    invoke-virtual {p0}, Ljava/lang/Object;->toString()Ljava/lang/String;",
    )
    .unwrap();
    assert_eq!(object.return_type, "Ljava/lang/String;");
}

#[test]
fn dispatch_kinds_beyond_virtual_and_static_fall_through() {
    for line in [
        "    invoke-direct {p0}, Ljava/lang/Object;-><init>()V",
        "    invoke-interface {p0}, Ljava/util/List;->size()I",
        "    invoke-super {p0}, Landroid/app/Activity;->onResume()V",
        "    invoke-virtual/range {v0 .. v5}, Lcom/a/B;->big(IIIII)V",
    ] {
        assert!(parse_invocation(line).is_none(), "{line}");
    }
}

#[test]
fn virtual_receiver_is_first_register_token() {
    let site = parse_invocation("    invoke-virtual {v3, v1}, Lcom/a/B;->eat(I)V").unwrap();
    assert_eq!(site.kind, DispatchKind::Virtual);
    assert_eq!(register_tokens(&site.registers)[0], "v3");
}

#[test]
fn header_visibility_and_split_source_files() {
    // Two class files sharing one source tag, the shape big split classes
    // decompile into.
    let part1 = ".class Lcom/a/Big;\n.super Ljava/lang/Object;\n.source \"Big.java\"\n";
    let part2 = ".class Lcom/a/Big$Part;\n.super Ljava/lang/Object;\n.source \"Big.java\"\n";
    let h1 = parse_class_header(part1).unwrap();
    let h2 = parse_class_header(part2).unwrap();
    assert_eq!(h1.source, h2.source);
    assert!(!h1.is_public());
    assert_ne!(h1.name, h2.name);
}

#[test]
fn locals_directive_ignores_lookalikes() {
    assert_eq!(parse_locals("    .locals 12"), Some(12));
    assert_eq!(parse_locals("    .locals"), None);
    assert_eq!(parse_locals("    .local v0, \"x\":I"), None);
}
