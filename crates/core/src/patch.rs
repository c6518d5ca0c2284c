//! Patch installer: arms detours on originals so calls pick up the latest replacement body.
//!
//! Every reloadable member of a reloaded module is handled inside its own failure boundary and
//! lands in exactly one bucket of the returned [`PatchReport`].

use std::sync::{Arc, OnceLock};

use log::{debug, error, info, warn};
use serde::Serialize;
use thiserror::Error;

use crate::loader::ReloadedModule;
use crate::model::{IdentityError, IdentityKey, MethodDef};
use crate::registry::{MemberRegistry, Replacement};
use crate::runtime::{
    CompiledBody, Detour, DetourError, Emitter, MethodCode, Runtime, RuntimeMethod, VmError,
};
use crate::translate::{Translator, VersionPolicy};

#[derive(Debug, Error)]
pub enum PatchError {
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error("Signature of {identity} changed: {reason}")]
    SignatureMismatch { identity: IdentityKey, reason: String },
    #[error(transparent)]
    Detour(#[from] DetourError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemberIssue {
    pub member: String,
    pub reason: String,
}

/// Outcome of one reload, per reloadable member.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PatchReport {
    /// Detour (re)armed; the next call compiles the new body.
    pub armed: Vec<IdentityKey>,
    /// Replacement stored, but the original has never run so no detour was installed.
    pub deferred: Vec<IdentityKey>,
    /// Identity or signature problems; nothing was stored.
    pub skipped: Vec<MemberIssue>,
    /// No matching original: a new member with no live call sites.
    pub ignored: Vec<IdentityKey>,
    /// Detour installation failed for another reason.
    pub failed: Vec<MemberIssue>,
}

impl PatchReport {
    pub fn is_clean(&self) -> bool {
        self.skipped.is_empty() && self.failed.is_empty()
    }
}

enum Outcome {
    Armed(IdentityKey),
    Deferred(IdentityKey),
    Ignored(IdentityKey),
}

pub struct PatchInstaller {
    registry: Arc<MemberRegistry>,
    policy: VersionPolicy,
}

impl PatchInstaller {
    pub fn new(registry: Arc<MemberRegistry>, policy: VersionPolicy) -> Self {
        Self { registry, policy }
    }

    pub fn apply(&self, reloaded: &ReloadedModule) -> PatchReport {
        let mut report = PatchReport::default();
        for ty in &reloaded.image.types {
            for method in ty.reloadable_members() {
                match self.apply_member(&ty.full_name, method, reloaded) {
                    Ok(Outcome::Armed(identity)) => report.armed.push(identity),
                    Ok(Outcome::Deferred(identity)) => report.deferred.push(identity),
                    Ok(Outcome::Ignored(identity)) => report.ignored.push(identity),
                    Err(e @ PatchError::Detour(_)) => {
                        error!("Failed to arm detour for {}.{}: {e}", ty.full_name, method.name);
                        report.failed.push(issue(&ty.full_name, method, &e));
                    }
                    Err(e) => {
                        error!("Skipping {}.{}: {e}", ty.full_name, method.name);
                        report.skipped.push(issue(&ty.full_name, method, &e));
                    }
                }
            }
        }
        report
    }

    fn apply_member(
        &self,
        declaring_type: &str,
        method: &MethodDef,
        reloaded: &ReloadedModule,
    ) -> Result<Outcome, PatchError> {
        let identity = IdentityKey::for_def(declaring_type, method)?;
        let Some(original) = self.registry.lookup_original(&identity) else {
            debug!("Ignoring {identity}: no original is registered");
            return Ok(Outcome::Ignored(identity));
        };
        check_signature(&identity, &original, method)?;

        self.registry.register_replacement(
            identity.clone(),
            Replacement {
                identity: identity.clone(),
                module: reloaded.image.name.clone(),
                revision: reloaded.revision,
                method: method.clone(),
            },
        );

        let registry = self.registry.clone();
        let policy = self.policy;
        let trampoline_identity = identity.clone();
        let armed = original.install_detour(move |previous| {
            // Re-arming over a trampoline keeps only the body it settled on, not the trampoline.
            let previous = match previous {
                MethodCode::Detoured(detour) => {
                    detour.settled().map(MethodCode::Compiled).unwrap_or(MethodCode::Detoured(detour))
                }
                other => other,
            };
            Arc::new(Trampoline {
                identity: trampoline_identity,
                registry,
                policy,
                previous,
                built: OnceLock::new(),
            })
        });
        match armed {
            Ok(()) => {
                info!("Armed detour for {identity} (revision {})", reloaded.revision);
                Ok(Outcome::Armed(identity))
            }
            Err(DetourError::Unresolved(_)) => {
                warn!("Skipping detour for {identity}: it has not executed yet");
                Ok(Outcome::Deferred(identity))
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn check_signature(
    identity: &IdentityKey,
    original: &RuntimeMethod,
    replacement: &MethodDef,
) -> Result<(), PatchError> {
    let mismatch = |reason: String| PatchError::SignatureMismatch { identity: identity.clone(), reason };
    // Module scopes carry versions; only the written type matters here.
    if original.def().return_type.display_name() != replacement.return_type.display_name() {
        return Err(mismatch(format!(
            "return type {} became {}",
            original.def().return_type,
            replacement.return_type
        )));
    }
    if original.is_static() != replacement.is_static {
        return Err(mismatch("static-ness differs".to_string()));
    }
    Ok(())
}

fn issue(declaring_type: &str, method: &MethodDef, error: &PatchError) -> MemberIssue {
    MemberIssue { member: format!("{declaring_type}.{}", method.name), reason: error.to_string() }
}

/// Detour target that compiles the current replacement on its first call after arming.
struct Trampoline {
    identity: IdentityKey,
    registry: Arc<MemberRegistry>,
    policy: VersionPolicy,
    previous: MethodCode,
    built: OnceLock<Result<Arc<CompiledBody>, String>>,
}

impl Trampoline {
    fn build(&self, runtime: &Runtime) -> Result<Arc<CompiledBody>, String> {
        let replacement = self
            .registry
            .lookup_replacement(&self.identity)
            .ok_or_else(|| "no replacement is registered".to_string())?;
        let body = replacement
            .method
            .body
            .as_ref()
            .ok_or_else(|| "replacement has no body".to_string())?;
        let mut emitter = Emitter::new();
        let instructions = Translator::new(runtime, self.policy)
            .translate(body, &mut emitter)
            .map_err(|e| e.to_string())?;
        let name = format!("{}@r{}", self.identity, replacement.revision);
        let compiled = runtime.compile(&name, emitter, instructions).map_err(|e| e.to_string())?;
        info!("Compiled replacement body for {} (revision {})", self.identity, replacement.revision);
        Ok(compiled)
    }

    fn fallback(&self, runtime: &Runtime, method: &RuntimeMethod) -> Result<Arc<CompiledBody>, VmError> {
        match &self.previous {
            MethodCode::Compiled(body) => Ok(body.clone()),
            MethodCode::Detoured(detour) => detour.body(runtime, method),
            MethodCode::Pending | MethodCode::Native(_) => Err(VmError::Compile {
                method: self.identity.to_string(),
                reason: "no previous body to fall back to".into(),
            }),
        }
    }
}

impl Detour for Trampoline {
    fn body(&self, runtime: &Runtime, method: &RuntimeMethod) -> Result<Arc<CompiledBody>, VmError> {
        let built = self.built.get_or_init(|| {
            self.build(runtime).map_err(|reason| {
                error!("Failed to build replacement for {}: {reason}; keeping the previous body", self.identity);
                reason
            })
        });
        match built {
            Ok(body) => Ok(body.clone()),
            Err(_) => self.fallback(runtime, method),
        }
    }

    fn settled(&self) -> Option<Arc<CompiledBody>> {
        match self.built.get() {
            Some(Ok(body)) => Some(body.clone()),
            _ => match &self.previous {
                MethodCode::Compiled(body) => Some(body.clone()),
                MethodCode::Detoured(detour) => detour.settled(),
                MethodCode::Pending | MethodCode::Native(_) => None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::loader::ModuleLoader;
    use crate::model::{
        opcodes, BodyBuilder, MethodRef, ModuleImage, ModuleName, ModuleVersion, TypeDef, TypeRef,
        VOID_TYPE,
    };
    use crate::runtime::{corelib, CapturedConsole, Value};

    fn printer(text: &str) -> MethodDef {
        let mut b = BodyBuilder::new();
        b.ldstr(text)
            .call(MethodRef::new(
                TypeRef::named(corelib::CONSOLE),
                "WriteLine",
                vec![TypeRef::named(corelib::STRING)],
            ))
            .ret();
        MethodDef::new("Show", TypeRef::named(VOID_TYPE))
            .static_method()
            .reloadable()
            .with_body(b.build().unwrap())
    }

    fn write(path: &Path, show: MethodDef) {
        ModuleImage::new(ModuleName::new("TestMod", ModuleVersion::new(1, 0, 0, 0)))
            .with_type(TypeDef::new("TestMod.ModDialog").with_method(show))
            .write(path)
            .unwrap();
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        path: std::path::PathBuf,
        runtime: Runtime,
        console: Arc<CapturedConsole>,
        loader: ModuleLoader,
        installer: PatchInstaller,
        show: IdentityKey,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("TestMod.hsm");
        write(&path, printer("v1"));
        let console = Arc::new(CapturedConsole::new());
        let runtime = Runtime::with_console(console.clone()).unwrap();
        let registry = Arc::new(MemberRegistry::new());
        let loader = ModuleLoader::new(registry.clone());
        let installer = PatchInstaller::new(registry, VersionPolicy::Lax);
        loader.load_original(&runtime, &path).unwrap();
        let show = IdentityKey::parse("TestMod.ModDialog.Show").unwrap();
        Fixture { _dir: dir, path, runtime, console, loader, installer, show }
    }

    #[test]
    fn never_executed_original_is_deferred() {
        let f = fixture();
        write(&f.path, printer("v2"));
        let report = f.installer.apply(&f.loader.reload(&f.runtime, &f.path).unwrap());
        assert_eq!(report.deferred, vec![f.show.clone()]);
        assert!(report.armed.is_empty());
        assert!(f.loader.registry().lookup_replacement(&f.show).is_some());

        f.runtime.call(&f.show, vec![]).unwrap();
        assert_eq!(f.console.take(), vec!["v1".to_string()]);
    }

    #[test]
    fn latest_replacement_wins_across_reloads_before_a_call() {
        let f = fixture();
        f.runtime.call(&f.show, vec![]).unwrap();
        for text in ["v2", "v3"] {
            write(&f.path, printer(text));
            let report = f.installer.apply(&f.loader.reload(&f.runtime, &f.path).unwrap());
            assert_eq!(report.armed, vec![f.show.clone()]);
        }
        f.runtime.call(&f.show, vec![]).unwrap();
        assert_eq!(f.console.take(), vec!["v1".to_string(), "v3".to_string()]);
    }

    #[test]
    fn untranslatable_replacement_falls_back_to_previous_body() {
        let f = fixture();
        f.runtime.call(&f.show, vec![]).unwrap();

        let mut b = BodyBuilder::new();
        b.op(opcodes::LOCALLOC).ret();
        let broken = MethodDef::new("Show", TypeRef::named(VOID_TYPE))
            .static_method()
            .reloadable()
            .with_body(b.build().unwrap());
        write(&f.path, broken);
        let report = f.installer.apply(&f.loader.reload(&f.runtime, &f.path).unwrap());
        assert_eq!(report.armed.len(), 1);

        f.runtime.call(&f.show, vec![]).unwrap();
        f.runtime.call(&f.show, vec![]).unwrap();
        assert_eq!(f.console.take(), vec!["v1".to_string(), "v1".to_string()]);
    }

    #[test]
    fn rearming_keeps_the_settled_body_instead_of_the_old_trampoline() {
        let f = fixture();
        f.runtime.call(&f.show, vec![]).unwrap();
        write(&f.path, printer("v2"));
        f.installer.apply(&f.loader.reload(&f.runtime, &f.path).unwrap());
        f.runtime.call(&f.show, vec![]).unwrap();

        let method = f.runtime.find_method(&f.show).unwrap();
        let MethodCode::Detoured(v2) = method.code() else { panic!("Show is not detoured") };
        let v2_body = v2.settled().unwrap();

        let mut b = BodyBuilder::new();
        b.op(opcodes::LOCALLOC).ret();
        let broken = MethodDef::new("Show", TypeRef::named(VOID_TYPE))
            .static_method()
            .reloadable()
            .with_body(b.build().unwrap());
        write(&f.path, broken);
        f.installer.apply(&f.loader.reload(&f.runtime, &f.path).unwrap());

        // Only this test still holds the v2 trampoline.
        assert_eq!(Arc::strong_count(&v2), 1);
        let MethodCode::Detoured(v3) = method.code() else { panic!("Show is not detoured") };
        assert!(Arc::ptr_eq(&v3.settled().unwrap(), &v2_body));

        f.runtime.call(&f.show, vec![]).unwrap();
        assert_eq!(f.console.take(), vec!["v1".to_string(), "v2".to_string(), "v2".to_string()]);
    }

    #[test]
    fn return_type_scoped_to_another_module_version_is_the_same_signature() {
        let f = fixture();
        let scoped = |revision: u32, text: &str| {
            let mut b = BodyBuilder::new();
            b.ldstr(text).ret();
            let core = ModuleName::new("corelib", ModuleVersion::new(1, 0, 0, revision));
            MethodDef::new("Label", TypeRef::named(corelib::STRING).in_module(core))
                .static_method()
                .reloadable()
                .with_body(b.build().unwrap())
        };
        let image = |method: MethodDef| {
            ModuleImage::new(ModuleName::new("Labels", ModuleVersion::new(1, 0, 0, 0)))
                .with_type(TypeDef::new("Labels.Source").with_method(method))
        };
        let path = f.path.with_file_name("Labels.hsm");
        image(scoped(0, "v1")).write(&path).unwrap();
        f.loader.load_original(&f.runtime, &path).unwrap();
        let label = IdentityKey::parse("Labels.Source.Label").unwrap();
        assert_eq!(f.runtime.call(&label, vec![]).unwrap(), Value::str("v1"));

        image(scoped(1, "v2")).write(&path).unwrap();
        let report = f.installer.apply(&f.loader.reload(&f.runtime, &path).unwrap());
        assert!(report.skipped.is_empty(), "{:?}", report.skipped);
        assert_eq!(report.armed, vec![label.clone()]);
        assert_eq!(f.runtime.call(&label, vec![]).unwrap(), Value::str("v2"));
    }

    #[test]
    fn signature_change_is_skipped_and_new_members_ignored() {
        let f = fixture();
        f.runtime.call(&f.show, vec![]).unwrap();

        let mut b = BodyBuilder::new();
        b.ldc(1).ret();
        let changed = MethodDef::new("Show", TypeRef::named("System.Int32"))
            .static_method()
            .reloadable()
            .with_body(b.build().unwrap());
        let mut extra = printer("new");
        extra.name = "Extra".into();
        ModuleImage::new(ModuleName::new("TestMod", ModuleVersion::new(1, 0, 0, 0)))
            .with_type(TypeDef::new("TestMod.ModDialog").with_method(changed).with_method(extra))
            .write(&f.path)
            .unwrap();

        let report = f.installer.apply(&f.loader.reload(&f.runtime, &f.path).unwrap());
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.ignored, vec![IdentityKey::parse("TestMod.ModDialog.Extra").unwrap()]);
        assert_eq!(f.runtime.call(&f.show, vec![]).unwrap(), Value::Null);
        assert_eq!(f.console.take(), vec!["v1".to_string(), "v1".to_string()]);
    }
}
