use anyhow::{Context, Result};
use hotswap_core::model::{
    BodyBuilder, MethodDef, MethodRef, ModuleImage, ModuleName, ModuleVersion, TypeDef, TypeRef,
    VOID_TYPE,
};
use hotswap_core::runtime::corelib;

use crate::canonicalize_or_current;

/// Sample module: `TestMod.ModDialog.Show()` prints `message` and is marked reloadable.
pub fn demo_module(message: &str) -> Result<ModuleImage> {
    let mut body = BodyBuilder::new();
    body.ldstr(message)
        .call(MethodRef::new(
            TypeRef::named(corelib::CONSOLE),
            "WriteLine",
            vec![TypeRef::named(corelib::STRING)],
        ))
        .ret();
    let show = MethodDef::new("Show", TypeRef::named(VOID_TYPE))
        .static_method()
        .reloadable()
        .with_body(body.build().context("Failed to build demo body")?);
    Ok(ModuleImage::new(ModuleName::new("TestMod", ModuleVersion::new(1, 0, 0, 0)))
        .with_type(TypeDef::new("TestMod.ModDialog").with_method(show)))
}

/// Write the sample module to `out`, replacing any previous revision.
pub fn demo_command(out: &str, message: &str) -> Result<()> {
    let path = canonicalize_or_current(out)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    demo_module(message)?
        .write(&path)
        .with_context(|| format!("Failed to write module {}", path.display()))?;
    println!("Wrote demo module to {}", path.display());
    Ok(())
}
