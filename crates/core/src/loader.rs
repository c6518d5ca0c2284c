//! Module loader: live first loads that register swappable members, inert revisioned reloads.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use log::{debug, info};
use sha2::{Digest, Sha256};

use crate::model::{read_module_bytes, LoadError, ModuleImage};
use crate::registry::MemberRegistry;
use crate::runtime::{LoadInterceptor, LoadedModule, Runtime};

/// Result of loading a new revision of a module file.
#[derive(Debug, Clone)]
pub struct ReloadedModule {
    /// Descriptive image, with its version already rewritten for this revision.
    pub image: ModuleImage,
    pub revision: u32,
    /// Hex SHA-256 of the file bytes that were read.
    pub content_hash: String,
    pub module: Arc<LoadedModule>,
}

pub struct ModuleLoader {
    registry: Arc<MemberRegistry>,
    revisions: DashMap<PathBuf, u32>,
}

impl ModuleLoader {
    pub fn new(registry: Arc<MemberRegistry>) -> Self {
        Self { registry, revisions: DashMap::new() }
    }

    pub fn registry(&self) -> &Arc<MemberRegistry> {
        &self.registry
    }

    /// First load of a module: load it live and register its reloadable members as originals.
    pub fn load_original(
        &self,
        runtime: &Runtime,
        path: &Path,
    ) -> Result<Arc<LoadedModule>, LoadError> {
        let image = ModuleImage::from_bytes(&read_module_bytes(path)?)?;
        let module = runtime.load_live(&image)?;
        info!("Loaded {} from {}", module.name(), path.display());

        for ty in module.types() {
            for method in ty.methods().iter().filter(|m| m.def().is_reloadable()) {
                let identity = method.identity().clone();
                if self.registry.register_original(identity.clone(), method.clone()) {
                    info!("Registered reloadable member {identity}");
                } else {
                    debug!("Reloadable member {identity} is already registered");
                }
            }
        }
        Ok(module)
    }

    /// Load a new revision of `path` for inspection only.
    ///
    /// The revision counter is bumped before anything is read, so every attempt (even a failing
    /// one) consumes a distinct revision.
    pub fn reload(&self, runtime: &Runtime, path: &Path) -> Result<ReloadedModule, LoadError> {
        let revision = self.next_revision(path);
        let bytes = read_module_bytes(path)?;
        let content_hash = sha256_bytes(&bytes);

        let mut image = ModuleImage::from_bytes(&bytes)?;
        image.name.version.revision = image.name.version.revision.saturating_add(revision);
        image.module_name = format!("{}_{revision}", image.name.name);

        let module = runtime.load_inert(&image)?;
        info!("Reloaded {} (revision {revision}) from {}", module.name(), path.display());
        Ok(ReloadedModule { image, revision, content_hash, module })
    }

    fn next_revision(&self, path: &Path) -> u32 {
        let mut counter = self.revisions.entry(revision_key(path)).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Latest revision handed out for `path` (0 if never reloaded).
    pub fn revision(&self, path: &Path) -> u32 {
        self.revisions.get(&revision_key(path)).map(|r| *r).unwrap_or(0)
    }
}

impl LoadInterceptor for ModuleLoader {
    fn load(&self, runtime: &Runtime, path: &Path) -> Result<Arc<LoadedModule>, LoadError> {
        self.load_original(runtime, path)
    }
}

fn revision_key(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

pub fn sha256_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BodyBuilder, MethodDef, ModuleName, ModuleVersion, TypeDef, TypeRef, VOID_TYPE};
    use crate::runtime::CapturedConsole;

    fn write_module(path: &Path) {
        let mut b = BodyBuilder::new();
        b.ret();
        let body = b.build().unwrap();
        let image = ModuleImage::new(ModuleName::new("TestMod", ModuleVersion::new(1, 0, 0, 0)))
            .with_type(
                TypeDef::new("TestMod.ModDialog")
                    .with_method(
                        MethodDef::new("Show", TypeRef::named(VOID_TYPE))
                            .reloadable()
                            .with_body(body.clone()),
                    )
                    .with_method(MethodDef::new("Hidden", TypeRef::named(VOID_TYPE)).with_body(body)),
            );
        image.write(path).unwrap();
    }

    fn setup() -> (tempfile::TempDir, PathBuf, Runtime, ModuleLoader) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("TestMod.hsm");
        write_module(&path);
        let runtime = Runtime::with_console(Arc::new(CapturedConsole::new())).unwrap();
        let loader = ModuleLoader::new(Arc::new(MemberRegistry::new()));
        (dir, path, runtime, loader)
    }

    #[test]
    fn first_load_registers_only_marked_members() {
        let (_dir, path, runtime, loader) = setup();
        let module = loader.load_original(&runtime, &path).unwrap();
        assert!(module.is_live());
        assert_eq!(
            loader.registry().original_identities(),
            vec![crate::model::IdentityKey::parse("TestMod.ModDialog.Show").unwrap()]
        );
    }

    #[test]
    fn reloads_get_distinct_revisions_and_versions() {
        let (_dir, path, runtime, loader) = setup();
        loader.load_original(&runtime, &path).unwrap();
        let first = loader.reload(&runtime, &path).unwrap();
        let second = loader.reload(&runtime, &path).unwrap();

        assert_eq!((first.revision, second.revision), (1, 2));
        assert_eq!(first.content_hash, second.content_hash);
        assert_ne!(first.module.id(), second.module.id());
        assert!(!first.module.is_live());
        assert_eq!(second.image.name.version.revision, 2);
        assert_eq!(second.image.module_name, "TestMod_2");
        assert_eq!(loader.revision(&path), 2);
    }

    #[test]
    fn failed_reload_still_consumes_a_revision() {
        let (dir, path, runtime, loader) = setup();
        let missing = dir.path().join("Missing.hsm");
        assert!(matches!(loader.reload(&runtime, &missing), Err(LoadError::Io { .. })));
        assert_eq!(loader.revision(&missing), 1);

        std::fs::write(&path, b"{ broken").unwrap();
        assert!(matches!(loader.reload(&runtime, &path), Err(LoadError::Malformed(_))));
    }
}
