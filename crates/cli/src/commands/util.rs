use std::path::Path;

use anyhow::{anyhow, Context, Result};
use hotswap_core::model::{IdentityKey, MethodDef, ModuleImage, TypeDef};

/// Read and decode a module file.
pub fn load_image(path: &Path) -> Result<ModuleImage> {
    ModuleImage::read(path).with_context(|| format!("Failed to load module {}", path.display()))
}

/// Parse a member identity typed on the command line (`Type.Member(Param, ...)`).
pub fn parse_identity(raw: &str) -> Result<IdentityKey> {
    IdentityKey::parse(raw).with_context(|| format!("Invalid member identity '{raw}'"))
}

/// Find the method whose identity key equals `identity`.
pub fn find_member<'a>(
    image: &'a ModuleImage,
    identity: &IdentityKey,
) -> Result<(&'a TypeDef, &'a MethodDef)> {
    for ty in &image.types {
        for method in &ty.methods {
            if IdentityKey::for_def(&ty.full_name, method).ok().as_ref() == Some(identity) {
                return Ok((ty, method));
            }
        }
    }
    Err(anyhow!("Member {identity} not found in module {}", image.name))
}
