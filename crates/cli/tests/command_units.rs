use hotswap::commands::{
    demo_module, find_member, parse_identity, render_body, summarize_module, translate_member,
};
use hotswap_core::model::{opcodes, BodyBuilder, HandlerKind, TypeRef};
use hotswap_core::translate::VersionPolicy;
use tempfile::tempdir;

#[test]
fn find_member_matches_full_identity() {
    let image = demo_module("v1").expect("demo");
    let identity = parse_identity("TestMod.ModDialog.Show()").expect("identity");
    let (ty, method) = find_member(&image, &identity).expect("member");
    assert_eq!(ty.full_name, "TestMod.ModDialog");
    assert!(method.is_reloadable());

    let overload = parse_identity("TestMod.ModDialog.Show(System.Int32)").expect("identity");
    assert!(find_member(&image, &overload).is_err());
}

#[test]
fn parse_identity_rejects_missing_type() {
    assert!(parse_identity("Show").is_err());
}

#[test]
fn render_body_lists_regions() {
    let mut b = BodyBuilder::new();
    b.mark("try").op(opcodes::NOP).branch(opcodes::LEAVE, "done");
    b.mark("handler").op(opcodes::ENDFINALLY);
    b.mark("done").ret();
    b.region(HandlerKind::Finally, "try", "handler", "handler", "done");
    let lines = render_body(&b.build().expect("body"));
    assert_eq!(lines[1], "IL_0001: leave IL_0003");
    assert_eq!(lines.last().map(String::as_str), Some(".try IL_0000 to IL_0002 finally IL_0002 to IL_0003"));

    let mut c = BodyBuilder::new();
    c.local(TypeRef::named("System.Int32"));
    c.ldc(1).stloc(0).ret();
    assert_eq!(render_body(&c.build().expect("body"))[0], ".local V_0 System.Int32");
}

#[test]
fn summarize_module_reports_hash_and_members() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("TestMod.hsm");
    demo_module("v1").expect("demo").write(&path).expect("write");

    let summary = summarize_module(path.to_str().expect("utf8 path")).expect("summary");
    assert_eq!(summary.version, "1.0.0.0");
    assert_eq!(summary.types.len(), 1);
    assert_eq!(summary.types[0].members[0].identity, "TestMod.ModDialog.Show()");
    assert_eq!(summary.sha256.len(), 64);
}

#[test]
fn translate_member_fails_on_inert_only_reference() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("Caller.hsm");

    // Calls a type that only the (inert) target module defines.
    let mut image = demo_module("v1").expect("demo");
    let mut body = BodyBuilder::new();
    body.call(hotswap_core::model::MethodRef::new(
        TypeRef::named("TestMod.ModDialog"),
        "Show",
        vec![],
    ))
    .ret();
    let caller = hotswap_core::model::MethodDef::new("Call", TypeRef::named("System.Void"))
        .static_method()
        .with_body(body.build().expect("body"));
    image.types[0].methods.push(caller);
    image.write(&path).expect("write");
    let path = path.to_str().expect("utf8 path");

    let err = translate_member(path, "TestMod.ModDialog.Call()", &[], VersionPolicy::Lax)
        .unwrap_err();
    assert!(format!("{err:#}").contains("TestMod.ModDialog"));

    // With the same module loaded live the reference resolves.
    let live = vec![path.to_string()];
    let lines = translate_member(path, "TestMod.ModDialog.Call()", &live, VersionPolicy::Lax)
        .expect("translate");
    assert_eq!(lines.len(), 2);
}
