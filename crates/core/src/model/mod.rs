//! Descriptive (on-disk) module schema.
//!
//! A module file holds a serialized [`ModuleImage`]: types, members, instruction streams and
//! exception regions, all described over instruction positions. Nothing here is executable;
//! the runtime and the translator turn these descriptions into callable code.

pub mod builder;
pub mod identity;
pub mod opcodes;

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use builder::BodyBuilder;
pub use identity::{IdentityError, IdentityKey};

/// Container format revision written into every module file.
pub const FORMAT_VERSION: u32 = 1;

/// Simple name of the attribute that marks a member as eligible for swapping.
pub const RELOADABLE_ATTRIBUTE: &str = "ReloadableAttribute";

/// Name used for instance constructors.
pub const CONSTRUCTOR_NAME: &str = ".ctor";

/// Name used for static initializers.
pub const STATIC_INITIALIZER_NAME: &str = ".cctor";

/// Full name of the void type.
pub const VOID_TYPE: &str = "System.Void";

/// Error raised while reading or decoding a module file.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("Failed to read module {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Malformed module: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("Unsupported module format {found}; expected {expected}")]
    UnsupportedFormat { found: u32, expected: u32 },
    #[error("Static initializer of {type_name} failed: {reason}")]
    Initializer { type_name: String, reason: String },
    #[error("Member of {type_name} has no usable identity: {reason}")]
    Identity { type_name: String, reason: String },
}

/// Four-part module version.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModuleVersion {
    pub major: u16,
    pub minor: u16,
    pub build: u16,
    pub revision: u32,
}

impl ModuleVersion {
    pub fn new(major: u16, minor: u16, build: u16, revision: u32) -> Self {
        Self { major, minor, build, revision }
    }
}

impl fmt::Display for ModuleVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}.{}", self.major, self.minor, self.build, self.revision)
    }
}

/// Self-reported identity of a module.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModuleName {
    pub name: String,
    #[serde(default)]
    pub version: ModuleVersion,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub culture: Option<String>,
    /// Hex-encoded public key token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key_token: Option<String>,
}

impl ModuleName {
    pub fn new(name: impl Into<String>, version: ModuleVersion) -> Self {
        Self { name: name.into(), version, culture: None, public_key_token: None }
    }
}

impl fmt::Display for ModuleName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}, Version={}, Culture={}, PublicKeyToken={}",
            self.name,
            self.version,
            self.culture.as_deref().unwrap_or("neutral"),
            self.public_key_token.as_deref().unwrap_or("null")
        )
    }
}

/// Reference to a type, possibly in another module, possibly generic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TypeRef {
    pub full_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<ModuleName>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub generic_args: Vec<TypeRef>,
}

impl TypeRef {
    pub fn named(full_name: impl Into<String>) -> Self {
        Self { full_name: full_name.into(), scope: None, generic_args: Vec::new() }
    }

    pub fn in_module(mut self, scope: ModuleName) -> Self {
        self.scope = Some(scope);
        self
    }

    pub fn with_args(mut self, args: Vec<TypeRef>) -> Self {
        self.generic_args = args;
        self
    }

    pub fn is_void(&self) -> bool {
        self.full_name == VOID_TYPE
    }

    /// Name including instantiated generic arguments, e.g. ``List`1<System.Int32>``.
    pub fn display_name(&self) -> String {
        if self.generic_args.is_empty() {
            return self.full_name.clone();
        }
        let args: Vec<String> = self.generic_args.iter().map(TypeRef::display_name).collect();
        format!("{}<{}>", self.full_name, args.join(","))
    }
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display_name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MethodRef {
    pub declaring_type: TypeRef,
    pub name: String,
    #[serde(default)]
    pub params: Vec<TypeRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub generic_args: Vec<TypeRef>,
}

impl MethodRef {
    pub fn new(declaring_type: TypeRef, name: impl Into<String>, params: Vec<TypeRef>) -> Self {
        Self { declaring_type, name: name.into(), params, generic_args: Vec::new() }
    }
}

impl fmt::Display for MethodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let params: Vec<String> = self.params.iter().map(TypeRef::display_name).collect();
        write!(f, "{}::{}({})", self.declaring_type, self.name, params.join(", "))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldRef {
    pub declaring_type: TypeRef,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PropertyRef {
    pub declaring_type: TypeRef,
    pub name: String,
}

/// Operand of a descriptive instruction.
///
/// Branch operands hold instruction positions within the same body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Operand {
    #[default]
    None,
    Int(i64),
    Float(f64),
    Str(String),
    Target(usize),
    Switch(Vec<usize>),
    Method(MethodRef),
    Field(FieldRef),
    Property(PropertyRef),
    Type(TypeRef),
    Local(u16),
    Arg(u16),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    pub opcode: u16,
    #[serde(default)]
    pub operand: Operand,
}

impl Instruction {
    pub fn new(opcode: u16, operand: Operand) -> Self {
        Self { opcode, operand }
    }

    pub fn simple(opcode: u16) -> Self {
        Self { opcode, operand: Operand::None }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerKind {
    Catch,
    Finally,
    Fault,
    Filter,
}

/// Protected region with one handler, described over instruction positions.
///
/// End positions are exclusive and may equal the instruction count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionRegion {
    pub try_start: usize,
    pub try_end: usize,
    pub handler_start: usize,
    pub handler_end: usize,
    pub kind: HandlerKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_start: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catch_type: Option<TypeRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalDef {
    pub ty: TypeRef,
    #[serde(default)]
    pub pinned: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MethodBody {
    #[serde(default)]
    pub locals: Vec<LocalDef>,
    pub instructions: Vec<Instruction>,
    #[serde(default)]
    pub regions: Vec<ExceptionRegion>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamDef {
    pub name: String,
    pub ty: TypeRef,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodDef {
    pub name: String,
    #[serde(default)]
    pub params: Vec<ParamDef>,
    pub return_type: TypeRef,
    #[serde(default)]
    pub is_static: bool,
    #[serde(default)]
    pub attributes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<MethodBody>,
}

impl MethodDef {
    pub fn new(name: impl Into<String>, return_type: TypeRef) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
            return_type,
            is_static: false,
            attributes: Vec::new(),
            body: None,
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, ty: TypeRef) -> Self {
        self.params.push(ParamDef { name: name.into(), ty });
        self
    }

    pub fn static_method(mut self) -> Self {
        self.is_static = true;
        self
    }

    pub fn with_attribute(mut self, attribute: impl Into<String>) -> Self {
        self.attributes.push(attribute.into());
        self
    }

    pub fn reloadable(self) -> Self {
        self.with_attribute(RELOADABLE_ATTRIBUTE)
    }

    pub fn with_body(mut self, body: MethodBody) -> Self {
        self.body = Some(body);
        self
    }

    pub fn is_constructor(&self) -> bool {
        self.name == CONSTRUCTOR_NAME
    }

    /// True when an attribute with the reloadable marker's simple name is present.
    pub fn is_reloadable(&self) -> bool {
        self.attributes
            .iter()
            .any(|attr| attr.rsplit('.').next().unwrap_or(attr) == RELOADABLE_ATTRIBUTE)
    }

    /// Number of arguments including the implicit receiver of instance methods.
    pub fn arg_count(&self) -> usize {
        self.params.len() + usize::from(!self.is_static)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub ty: TypeRef,
    #[serde(default)]
    pub is_static: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyDef {
    pub name: String,
    pub ty: TypeRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub getter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setter: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeDef {
    pub full_name: String,
    #[serde(default)]
    pub fields: Vec<FieldDef>,
    #[serde(default)]
    pub properties: Vec<PropertyDef>,
    #[serde(default)]
    pub methods: Vec<MethodDef>,
}

impl TypeDef {
    pub fn new(full_name: impl Into<String>) -> Self {
        Self {
            full_name: full_name.into(),
            fields: Vec::new(),
            properties: Vec::new(),
            methods: Vec::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, ty: TypeRef, is_static: bool) -> Self {
        self.fields.push(FieldDef { name: name.into(), ty, is_static });
        self
    }

    pub fn with_property(mut self, property: PropertyDef) -> Self {
        self.properties.push(property);
        self
    }

    pub fn with_method(mut self, method: MethodDef) -> Self {
        self.methods.push(method);
        self
    }

    /// Methods and constructors carrying the reloadable marker.
    pub fn reloadable_members(&self) -> impl Iterator<Item = &MethodDef> {
        self.methods.iter().filter(|m| m.is_reloadable())
    }
}

/// Descriptive form of a module, as stored on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleImage {
    pub format: u32,
    pub name: ModuleName,
    /// File-level name of the primary module (e.g. `TestMod.hsm`).
    pub module_name: String,
    #[serde(default)]
    pub types: Vec<TypeDef>,
}

impl ModuleImage {
    pub fn new(name: ModuleName) -> Self {
        let module_name = format!("{}.hsm", name.name);
        Self { format: FORMAT_VERSION, name, module_name, types: Vec::new() }
    }

    pub fn with_type(mut self, ty: TypeDef) -> Self {
        self.types.push(ty);
        self
    }

    pub fn find_type(&self, full_name: &str) -> Option<&TypeDef> {
        self.types.iter().find(|t| t.full_name == full_name)
    }

    /// Decode a module from its serialized bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, LoadError> {
        let image: ModuleImage = serde_json::from_slice(bytes)?;
        if image.format != FORMAT_VERSION {
            return Err(LoadError::UnsupportedFormat {
                found: image.format,
                expected: FORMAT_VERSION,
            });
        }
        Ok(image)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, LoadError> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn read(path: &Path) -> Result<Self, LoadError> {
        let bytes = read_module_bytes(path)?;
        Self::from_bytes(&bytes)
    }

    pub fn write(&self, path: &Path) -> Result<(), LoadError> {
        let bytes = self.to_bytes()?;
        std::fs::write(path, bytes)
            .map_err(|source| LoadError::Io { path: path.display().to_string(), source })
    }
}

/// Read raw module bytes, mapping IO failures to [`LoadError::Io`].
pub fn read_module_bytes(path: &Path) -> Result<Vec<u8>, LoadError> {
    std::fs::read(path).map_err(|source| LoadError::Io { path: path.display().to_string(), source })
}
