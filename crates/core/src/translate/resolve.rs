//! Symbol resolution against the runtime's live modules.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{FieldRef, MethodRef, ModuleName, PropertyRef, TypeRef};
use crate::runtime::{
    FieldHandle, LoadedModule, MethodHandle, PropertyHandle, Runtime, RuntimeType, TypeHandle,
};

/// How strictly a reference's module scope must match a loaded module's name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionPolicy {
    /// Names compare case-insensitively; culture and token must match when requested;
    /// versions are ignored.
    #[default]
    Lax,
    /// As `Lax`, plus equal major.minor.build.
    Strict,
}

impl FromStr for VersionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lax" => Ok(VersionPolicy::Lax),
            "strict" => Ok(VersionPolicy::Strict),
            other => Err(format!("unknown version policy '{other}' (expected lax or strict)")),
        }
    }
}

impl fmt::Display for VersionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionPolicy::Lax => f.write_str("lax"),
            VersionPolicy::Strict => f.write_str("strict"),
        }
    }
}

impl VersionPolicy {
    pub fn matches(self, loaded: &ModuleName, requested: &ModuleName) -> bool {
        if !loaded.name.eq_ignore_ascii_case(&requested.name) {
            return false;
        }
        if let Some(token) = &requested.public_key_token {
            if loaded.public_key_token.as_deref().map(str::to_ascii_lowercase)
                != Some(token.to_ascii_lowercase())
            {
                return false;
            }
        }
        if let Some(culture) = &requested.culture {
            let loaded_culture = loaded.culture.as_deref().unwrap_or("neutral");
            if !loaded_culture.eq_ignore_ascii_case(culture) {
                return false;
            }
        }
        match self {
            VersionPolicy::Lax => true,
            VersionPolicy::Strict => {
                let (a, b) = (loaded.version, requested.version);
                (a.major, a.minor, a.build) == (b.major, b.minor, b.build)
            }
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("{what} {name} is not loaded in any live module")]
    NotFound { what: &'static str, name: String },
    #[error("{what} {name} exists only in an inert module and cannot be referenced")]
    InertOnly { what: &'static str, name: String },
}

pub struct SymbolResolver<'a> {
    runtime: &'a Runtime,
    policy: VersionPolicy,
}

impl<'a> SymbolResolver<'a> {
    pub fn new(runtime: &'a Runtime, policy: VersionPolicy) -> Self {
        Self { runtime, policy }
    }

    fn in_scope(&self, module: &LoadedModule, scope: Option<&ModuleName>) -> bool {
        scope.map_or(true, |requested| self.policy.matches(module.name(), requested))
    }

    /// Live definition of the referenced type, ignoring generic arguments.
    fn live_type(&self, ty: &TypeRef) -> Result<Arc<RuntimeType>, ResolveError> {
        let candidates: Vec<_> = self
            .runtime
            .find_types(&ty.full_name)
            .into_iter()
            .filter(|(module, _)| self.in_scope(module, ty.scope.as_ref()))
            .collect();
        if let Some((_, live)) = candidates.iter().find(|(module, _)| module.is_live()) {
            return Ok(live.clone());
        }
        if candidates.is_empty() {
            Err(ResolveError::NotFound { what: "type", name: ty.display_name() })
        } else {
            Err(ResolveError::InertOnly { what: "type", name: ty.display_name() })
        }
    }

    pub fn resolve_type(&self, ty: &TypeRef) -> Result<TypeHandle, ResolveError> {
        let def = self.live_type(ty)?;
        let args = ty
            .generic_args
            .iter()
            .map(|arg| self.resolve_type(arg))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(TypeHandle { ty: def, args })
    }

    pub fn resolve_method(&self, method: &MethodRef) -> Result<MethodHandle, ResolveError> {
        let owner = self.resolve_type(&method.declaring_type)?;
        let params = method
            .params
            .iter()
            .map(|p| self.resolve_type(p).map(|h| h.display_name()))
            .collect::<Result<Vec<_>, _>>()?;
        for arg in &method.generic_args {
            self.resolve_type(arg)?;
        }
        owner
            .ty
            .find_method(&method.name, &params)
            .ok_or_else(|| ResolveError::NotFound { what: "method", name: method.to_string() })
    }

    pub fn resolve_field(&self, field: &FieldRef) -> Result<FieldHandle, ResolveError> {
        let owner = self.live_type(&field.declaring_type)?;
        let def = owner.find_field(&field.name).ok_or_else(|| ResolveError::NotFound {
            what: "field",
            name: format!("{}::{}", field.declaring_type, field.name),
        })?;
        let is_static = def.is_static;
        Ok(FieldHandle { owner, name: field.name.clone(), is_static })
    }

    pub fn resolve_property(&self, property: &PropertyRef) -> Result<PropertyHandle, ResolveError> {
        let owner = self.live_type(&property.declaring_type)?;
        let def = owner.find_property(&property.name).ok_or_else(|| ResolveError::NotFound {
            what: "property",
            name: format!("{}::{}", property.declaring_type, property.name),
        })?;
        let getter = def.getter.as_deref().and_then(|name| owner.find_method(name, &[]));
        Ok(PropertyHandle { owner, name: property.name.clone(), getter })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ModuleImage, ModuleVersion, TypeDef};
    use crate::runtime::{corelib, CapturedConsole};

    fn runtime() -> Runtime {
        Runtime::with_console(Arc::new(CapturedConsole::new())).unwrap()
    }

    fn name(n: &str, version: ModuleVersion) -> ModuleName {
        ModuleName::new(n, version)
    }

    #[test]
    fn lax_policy_ignores_version_and_case() {
        let loaded = name("TestApplication", ModuleVersion::new(1, 0, 0, 0));
        let requested = name("testapplication", ModuleVersion::new(2, 5, 0, 7));
        assert!(VersionPolicy::Lax.matches(&loaded, &requested));
        assert!(!VersionPolicy::Strict.matches(&loaded, &requested));
    }

    #[test]
    fn strict_policy_ignores_revision() {
        let loaded = name("TestMod", ModuleVersion::new(1, 0, 0, 0));
        let requested = name("TestMod", ModuleVersion::new(1, 0, 0, 3));
        assert!(VersionPolicy::Strict.matches(&loaded, &requested));
    }

    #[test]
    fn requested_token_must_match() {
        let loaded = name("Lib", ModuleVersion::default());
        let mut requested = name("Lib", ModuleVersion::default());
        requested.public_key_token = Some("b77a5c561934e089".into());
        assert!(!VersionPolicy::Lax.matches(&loaded, &requested));
    }

    #[test]
    fn inert_only_type_is_rejected() {
        let rt = runtime();
        let image = ModuleImage::new(name("Ghost", ModuleVersion::default()))
            .with_type(TypeDef::new("Ghost.Thing"));
        rt.load_inert(&image).unwrap();
        let resolver = SymbolResolver::new(&rt, VersionPolicy::Lax);
        let err = resolver.resolve_type(&TypeRef::named("Ghost.Thing")).unwrap_err();
        assert!(matches!(err, ResolveError::InertOnly { what: "type", .. }));
        let err = resolver.resolve_type(&TypeRef::named("Ghost.Missing")).unwrap_err();
        assert!(matches!(err, ResolveError::NotFound { what: "type", .. }));
    }

    #[test]
    fn generic_arguments_resolve_recursively() {
        let rt = runtime();
        let image = ModuleImage::new(name("Gen", ModuleVersion::default()))
            .with_type(TypeDef::new("Gen.Box`1"));
        rt.load_live(&image).unwrap();
        let resolver = SymbolResolver::new(&rt, VersionPolicy::Lax);

        let ok = TypeRef::named("Gen.Box`1").with_args(vec![TypeRef::named(corelib::STRING)]);
        assert_eq!(resolver.resolve_type(&ok).unwrap().display_name(), "Gen.Box`1<System.String>");

        let bad = TypeRef::named("Gen.Box`1").with_args(vec![TypeRef::named("Gen.Nope")]);
        assert!(resolver.resolve_type(&bad).is_err());
    }

    #[test]
    fn methods_match_by_parameter_types() {
        let rt = runtime();
        let resolver = SymbolResolver::new(&rt, VersionPolicy::Lax);
        let console = TypeRef::named(corelib::CONSOLE);
        let by_string =
            MethodRef::new(console.clone(), "WriteLine", vec![TypeRef::named(corelib::STRING)]);
        assert!(resolver.resolve_method(&by_string).is_ok());
        let by_double =
            MethodRef::new(console, "WriteLine", vec![TypeRef::named("System.Double")]);
        assert!(matches!(
            resolver.resolve_method(&by_double),
            Err(ResolveError::NotFound { what: "method", .. })
        ));
    }
}
