#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use hotswap_core::model::{
    BodyBuilder, IdentityKey, MethodDef, MethodRef, ModuleImage, ModuleName, ModuleVersion,
    TypeDef, TypeRef, VOID_TYPE,
};
use hotswap_core::runtime::{corelib, CapturedConsole, Runtime};

pub fn write_line() -> MethodRef {
    MethodRef::new(
        TypeRef::named(corelib::CONSOLE),
        "WriteLine",
        vec![TypeRef::named(corelib::STRING)],
    )
}

/// `static void Show()` that prints `text`, marked reloadable.
pub fn show(text: &str) -> MethodDef {
    let mut b = BodyBuilder::new();
    b.ldstr(text).call(write_line()).ret();
    MethodDef::new("Show", TypeRef::named(VOID_TYPE))
        .static_method()
        .reloadable()
        .with_body(b.build().unwrap())
}

pub fn test_mod_name() -> ModuleName {
    ModuleName::new("TestMod", ModuleVersion::new(1, 0, 0, 0))
}

pub fn test_mod(methods: Vec<MethodDef>) -> ModuleImage {
    let mut dialog = TypeDef::new("TestMod.ModDialog");
    for method in methods {
        dialog = dialog.with_method(method);
    }
    ModuleImage::new(test_mod_name()).with_type(dialog)
}

pub fn write_module(path: &Path, image: &ModuleImage) {
    image.write(path).unwrap();
}

pub fn show_key() -> IdentityKey {
    IdentityKey::parse("TestMod.ModDialog.Show").unwrap()
}

pub fn runtime() -> (Arc<Runtime>, Arc<CapturedConsole>) {
    let console = Arc::new(CapturedConsole::new());
    let runtime = Arc::new(Runtime::with_console(console.clone()).unwrap());
    (runtime, console)
}

/// Host module whose `Tick()` calls `TestMod.ModDialog.Show()`.
pub fn host_app() -> ModuleImage {
    let mut b = BodyBuilder::new();
    b.call(MethodRef::new(TypeRef::named("TestMod.ModDialog"), "Show", vec![])).ret();
    let tick = MethodDef::new("Tick", TypeRef::named(VOID_TYPE))
        .static_method()
        .with_body(b.build().unwrap());
    ModuleImage::new(ModuleName::new("TestApplication", ModuleVersion::new(1, 0, 0, 0)))
        .with_type(TypeDef::new("TestApplication.Program").with_method(tick))
}

pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(25));
    }
    condition()
}
