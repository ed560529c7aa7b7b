//LICENSE Portions Copyright 2019-2021 ZomboDB, LLC.
//LICENSE
//LICENSE Portions Copyright 2021-2023 Technology Concepts & Design, Inc.
//LICENSE
//LICENSE Portions Copyright 2023-2023 PgCentral Foundation, Inc. <contact@pgcentral.org>
//LICENSE
//LICENSE All rights reserved.
//LICENSE
//LICENSE Use of this source code is governed by the MIT license that can be found in the LICENSE file.
//! End-to-end runs over small header trees.  These need libclang, so they only run with
//! `cargo test -- --ignored`.
use pgffi_bindgen::ir::{CType, DeclKind, DiagnosticKind, Unexpandable};
use pgffi_bindgen::*;
use std::path::Path;

const BASE_H: &str = r#"
#ifndef BASE_H
#define BASE_H

typedef int int32;

#define LIMIT 100
#define DOUBLE_LIMIT (LIMIT * 2)
#define twice(x) ((x) * 2)
#define CALLS twice(3)

extern int32 add(int32 a, int32 b);

static inline int32 fast_add(int32 a, int32 b) { return a + b; }

#endif
"#;

fn require_libclang() {
    if let Err(e) = pgffi_bindgen::extract::load_libclang() {
        panic!("libclang could not be loaded: {e}");
    }
}

fn header_tree(files: &[(&str, &str)]) -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    for (name, contents) in files {
        std::fs::write(dir.path().join(name), contents).unwrap();
    }
    dir
}

fn registry(version: u16, headers: &[&str]) -> HeaderSetRegistry {
    HeaderSetRegistry::from_sets([VersionedHeaderSet::new(
        version,
        headers.iter().map(|h| h.to_string()).collect(),
    )])
}

fn run(dir: &Path, registry: &HeaderSetRegistry, version: &str, rules: &RuleSet) -> GeneratedBindings {
    let env = BuildEnvironment::for_include_dir(dir);
    pgffi_bindgen::generate(registry, version, &env, rules).unwrap()
}

#[test]
#[ignore = "needs libclang"]
fn functions_and_macro_constants() {
    require_libclang();
    let dir = header_tree(&[("base.h", BASE_H)]);
    let out = run(dir.path(), &registry(16, &["base.h"]), "pg16", &RuleSet::default());

    assert!(out.source.contains("pub fn add(a: int32, b: int32) -> int32;"), "{}", out.source);
    assert!(out.source.contains("pub const LIMIT: i32 = 100;"), "{}", out.source);
    assert!(out.source.contains("pub const DOUBLE_LIMIT: i32 = 200;"), "{}", out.source);
    assert!(out.source.contains("pub type int32 = i32;"), "{}", out.source);

    let add = out.ir.get("add").unwrap();
    assert_eq!(add.variants[0].decl.header, "base.h");
    let DeclKind::Function(f) = &add.variants[0].decl.kind else { panic!("add is not a function") };
    assert_eq!(f.sig.params, [CType::named("int32"), CType::named("int32")]);
    assert!(!f.inline);

    // no linkable symbol, so left out unless a rule asks for it
    assert!(!out.source.contains("fast_add"));
    assert!(out.report.opaque.contains(&"fast_add".to_string()));
}

#[test]
#[ignore = "needs libclang"]
fn unexpandable_macros_are_reported_and_excluded() {
    require_libclang();
    let dir = header_tree(&[("base.h", BASE_H)]);
    let out = run(dir.path(), &registry(16, &["base.h"]), "16", &RuleSet::default());

    assert!(!out.source.contains("CALLS"));
    let diag = out.ir.diagnostics.iter().find(|d| d.symbol == "CALLS").unwrap();
    assert_eq!(diag.header, "base.h");
    assert_eq!(diag.kind, DiagnosticKind::UnexpandableMacro(Unexpandable::Call("twice".into())));

    let guard = out.ir.diagnostics.iter().find(|d| d.symbol == "BASE_H").unwrap();
    assert_eq!(guard.kind, DiagnosticKind::UnexpandableMacro(Unexpandable::Empty));
}

#[test]
#[ignore = "needs libclang"]
fn generation_is_deterministic() {
    require_libclang();
    let dir = header_tree(&[("base.h", BASE_H)]);
    let registry = registry(16, &["base.h"]);
    let first = run(dir.path(), &registry, "pg16", &RuleSet::default());
    let second = run(dir.path(), &registry, "pg16", &RuleSet::default());
    assert_eq!(first.source, second.source);
    assert_eq!(first.ir, second.ir);
}

#[test]
#[ignore = "needs libclang"]
fn adding_a_version_does_not_change_existing_output() {
    require_libclang();
    let dir = header_tree(&[("base.h", BASE_H), ("extra.h", "extern int extra_only(void);\n")]);
    let before = registry(16, &["base.h"]);
    let after = before
        .with_set(VersionedHeaderSet::new(17, vec!["base.h".into(), "extra.h".into()]), Path::new("test"))
        .unwrap();

    let old = run(dir.path(), &before, "pg16", &RuleSet::default());
    let new = run(dir.path(), &after, "pg16", &RuleSet::default());
    assert_eq!(old.source, new.source);
    assert!(run(dir.path(), &after, "pg17", &RuleSet::default()).source.contains("fn extra_only()"));
}

#[test]
#[ignore = "needs libclang"]
fn first_matching_rule_decides() {
    require_libclang();
    let dir = header_tree(&[("base.h", BASE_H)]);
    let registry = registry(16, &["base.h"]);

    let rules = RuleSet::new(vec![
        FilterRule::allow("fast_add").unwrap(),
        FilterRule::deny(".*add").unwrap(),
    ]);
    let out = run(dir.path(), &registry, "pg16", &rules);
    assert!(out.source.contains("pub fn fast_add(a: int32, b: int32) -> int32;"), "{}", out.source);
    assert!(!out.source.contains("pub fn add("));
    assert_eq!(out.report.denied, ["add"]);
}

#[test]
#[ignore = "needs libclang"]
fn records_with_nested_and_anonymous_members() {
    require_libclang();
    let header = r#"
typedef struct Outer {
    char tag;
    union { int i; double d; };
    unsigned flags:3, kind:5;
    struct { int x; } pos;
    int items[];
} Outer;

typedef struct Opaque Opaque;
extern Opaque *make_opaque(void);

enum Color { RED = -1, GREEN };
typedef enum { ANON_ONE = 1 } Anon;
enum { STANDALONE = 7 };
"#;
    let dir = header_tree(&[("records.h", header)]);
    let out = run(dir.path(), &registry(16, &["records.h"]), "pg16", &RuleSet::default());

    let DeclKind::Record(outer) = &out.ir.get("struct Outer").unwrap().variants[0].decl.kind else {
        panic!("struct Outer is not a record")
    };
    let names = outer.fields.iter().map(|f| f.name.as_str()).collect::<Vec<_>>();
    assert_eq!(names, ["tag", "__anon1", "flags", "kind", "pos", "items"]);
    assert_eq!(outer.fields[1].ty, CType::named("union Outer__anon1"));
    assert_eq!(outer.fields[1].offset_bits, 64);
    assert_eq!(outer.fields[2].bit_width, Some(3));
    assert_eq!(outer.fields[3].offset_bits, outer.fields[2].offset_bits + 3);
    assert_eq!(outer.fields[4].ty, CType::named("struct Outer__pos"));
    assert!(matches!(outer.fields[5].ty, CType::FlexibleArray { .. }));
    assert_eq!(outer.size, 24);

    let DeclKind::Record(opaque) = &out.ir.get("struct Opaque").unwrap().variants[0].decl.kind else {
        panic!("struct Opaque is not a record")
    };
    assert!(!opaque.complete);

    let src = &out.source;
    assert!(src.contains("pub struct Outer {"), "{src}");
    assert!(src.contains("pub union Outer__anon1 {"), "{src}");
    assert!(src.contains("pub _bitfield_0: [u8; 1]"), "{src}");
    assert!(src.contains("pub items: [i32; 0]"), "{src}");
    assert!(src.contains("_unused: [u8; 0]"), "{src}");
    assert!(src.contains("pub fn make_opaque() -> *mut Opaque;"), "{src}");
    assert!(src.contains("pub const RED: Color = -1;"), "{src}");
    assert!(src.contains("pub const ANON_ONE: Anon = 1;"), "{src}");
    assert!(src.contains("pub const STANDALONE: u32 = 7;"), "{src}");
}
