//! Host runtime: loaded modules, callable methods, detours and the function-compilation facility.
//!
//! The runtime keeps every loaded module in load order, tagged [`LoadKind::Live`] (callable,
//! statics initialized) or [`LoadKind::Inert`] (types visible for inspection, nothing callable).
//! Methods compile lazily on their first call. A resolved method can be detoured: its calls are
//! then served by a [`Detour`] object that supplies the body to run.

pub mod corelib;
pub mod emit;
pub mod interp;
pub mod ops;
pub mod value;

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use log::error;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;

use crate::model::{
    read_module_bytes, FieldDef, IdentityKey, LoadError, MethodDef, ModuleImage, ModuleName,
    PropertyDef, TypeDef, TypeRef, STATIC_INITIALIZER_NAME,
};
use crate::translate::{Translator, VersionPolicy};

pub use emit::{
    assemble, AssembleError, CompiledBody, Emitter, ExceptionBlock, ExecInstruction, ExecOperand,
    Label, LocalSlot, Symbol,
};
pub use ops::HostOp;
pub use value::{Object, Value, VmError};

/// Built-in implementation of a method.
pub type NativeFn = fn(&Runtime, &[Value]) -> Result<Value, VmError>;

pub type MethodHandle = Arc<RuntimeMethod>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleId(u32);

impl ModuleId {
    pub fn get(self) -> u32 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadKind {
    /// Callable; static initialization has run.
    Live,
    /// Introspection only; nothing in it can be invoked.
    Inert,
}

/// Supplies the body for calls to a detoured method.
pub trait Detour: Send + Sync {
    fn body(&self, runtime: &Runtime, method: &RuntimeMethod) -> Result<Arc<CompiledBody>, VmError>;

    /// Body this detour already settled on, if any, without building anything.
    fn settled(&self) -> Option<Arc<CompiledBody>> {
        None
    }
}

/// Current implementation behind a method.
#[derive(Clone)]
pub enum MethodCode {
    /// Not yet called, hence not yet compiled.
    Pending,
    Compiled(Arc<CompiledBody>),
    Native(NativeFn),
    Detoured(Arc<dyn Detour>),
}

impl fmt::Debug for MethodCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MethodCode::Pending => f.write_str("Pending"),
            MethodCode::Compiled(body) => write!(f, "Compiled({})", body.name),
            MethodCode::Native(_) => f.write_str("Native"),
            MethodCode::Detoured(_) => f.write_str("Detoured"),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DetourError {
    #[error("{0} has never executed; it has no compiled body to detour")]
    Unresolved(String),
    #[error("{0} is a native method and cannot be detoured")]
    Native(String),
    #[error("{0} belongs to an inert module")]
    Inert(String),
}

pub struct RuntimeMethod {
    declaring: Weak<RuntimeType>,
    declaring_name: String,
    identity: IdentityKey,
    def: MethodDef,
    param_types: Vec<String>,
    kind: LoadKind,
    code: RwLock<MethodCode>,
    calls: AtomicU64,
}

impl RuntimeMethod {
    fn new(
        declaring: Weak<RuntimeType>,
        declaring_name: &str,
        def: MethodDef,
        kind: LoadKind,
        native: Option<NativeFn>,
    ) -> Result<Self, LoadError> {
        let identity = IdentityKey::for_def(declaring_name, &def).map_err(|e| {
            LoadError::Identity { type_name: declaring_name.to_string(), reason: e.to_string() }
        })?;
        let param_types = def.params.iter().map(|p| p.ty.display_name()).collect();
        let code = match native {
            Some(f) => MethodCode::Native(f),
            None => MethodCode::Pending,
        };
        Ok(Self {
            declaring,
            declaring_name: declaring_name.to_string(),
            identity,
            def,
            param_types,
            kind,
            code: RwLock::new(code),
            calls: AtomicU64::new(0),
        })
    }

    pub fn identity(&self) -> &IdentityKey {
        &self.identity
    }

    pub fn name(&self) -> &str {
        &self.def.name
    }

    pub fn def(&self) -> &MethodDef {
        &self.def
    }

    pub fn declaring_type_name(&self) -> &str {
        &self.declaring_name
    }

    pub fn declaring_type(&self) -> Option<Arc<RuntimeType>> {
        self.declaring.upgrade()
    }

    pub fn param_types(&self) -> &[String] {
        &self.param_types
    }

    pub fn is_static(&self) -> bool {
        self.def.is_static
    }

    pub fn returns_value(&self) -> bool {
        !self.def.return_type.is_void()
    }

    pub fn kind(&self) -> LoadKind {
        self.kind
    }

    pub fn code(&self) -> MethodCode {
        self.code.read().clone()
    }

    /// True once the method has been compiled (or is native), i.e. it has run before.
    pub fn is_resolved(&self) -> bool {
        !matches!(*self.code.read(), MethodCode::Pending)
    }

    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    /// Redirect calls to a detour built from the currently installed code.
    ///
    /// `make` receives the code being replaced, so the detour can fall back to it.
    pub fn install_detour<F>(&self, make: F) -> Result<(), DetourError>
    where
        F: FnOnce(MethodCode) -> Arc<dyn Detour>,
    {
        if self.kind == LoadKind::Inert {
            return Err(DetourError::Inert(self.identity.to_string()));
        }
        let mut code = self.code.write();
        match &*code {
            MethodCode::Pending => Err(DetourError::Unresolved(self.identity.to_string())),
            MethodCode::Native(_) => Err(DetourError::Native(self.identity.to_string())),
            current => {
                let detour = make(current.clone());
                *code = MethodCode::Detoured(detour);
                Ok(())
            }
        }
    }

    fn publish_compiled(&self, body: Arc<CompiledBody>) -> Arc<CompiledBody> {
        let mut code = self.code.write();
        match &*code {
            MethodCode::Pending => {
                *code = MethodCode::Compiled(body.clone());
                body
            }
            MethodCode::Compiled(existing) => existing.clone(),
            _ => body,
        }
    }
}

impl fmt::Debug for RuntimeMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeMethod")
            .field("identity", &self.identity)
            .field("kind", &self.kind)
            .field("code", &*self.code.read())
            .finish()
    }
}

pub struct RuntimeType {
    full_name: String,
    module: ModuleId,
    kind: LoadKind,
    fields: Vec<FieldDef>,
    properties: Vec<PropertyDef>,
    methods: Vec<MethodHandle>,
    statics: Mutex<HashMap<String, Value>>,
}

impl RuntimeType {
    /// Members without a usable identity are left out of the type and logged; the rest of the
    /// type, and the module, still load.
    fn build(
        def: &TypeDef,
        module: ModuleId,
        kind: LoadKind,
        natives: &HashMap<String, NativeFn>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<RuntimeType>| {
            let mut methods = Vec::with_capacity(def.methods.len());
            for method in &def.methods {
                let native = IdentityKey::for_def(&def.full_name, method)
                    .ok()
                    .and_then(|key| natives.get(key.as_str()).copied());
                match RuntimeMethod::new(weak.clone(), &def.full_name, method.clone(), kind, native)
                {
                    Ok(m) => methods.push(Arc::new(m)),
                    Err(e) => error!("Leaving a member out of {}: {e}", def.full_name),
                }
            }
            let statics = def
                .fields
                .iter()
                .filter(|f| f.is_static)
                .map(|f| (f.name.clone(), Value::default_for(&f.ty.full_name)))
                .collect();
            RuntimeType {
                full_name: def.full_name.clone(),
                module,
                kind,
                fields: def.fields.clone(),
                properties: def.properties.clone(),
                methods,
                statics: Mutex::new(statics),
            }
        })
    }

    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    pub fn module(&self) -> ModuleId {
        self.module
    }

    pub fn kind(&self) -> LoadKind {
        self.kind
    }

    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    pub fn properties(&self) -> &[PropertyDef] {
        &self.properties
    }

    pub fn methods(&self) -> &[MethodHandle] {
        &self.methods
    }

    pub fn find_method(&self, name: &str, param_types: &[String]) -> Option<MethodHandle> {
        self.methods
            .iter()
            .find(|m| m.name() == name && m.param_types() == param_types)
            .cloned()
    }

    pub fn find_field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn find_property(&self, name: &str) -> Option<&PropertyDef> {
        self.properties.iter().find(|p| p.name == name)
    }

    pub fn get_static(&self, name: &str) -> Value {
        self.statics.lock().get(name).cloned().unwrap_or(Value::Null)
    }

    pub fn set_static(&self, name: &str, value: Value) {
        self.statics.lock().insert(name.to_string(), value);
    }
}

impl fmt::Debug for RuntimeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeType")
            .field("full_name", &self.full_name)
            .field("module", &self.module)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Resolved type, with resolved generic arguments.
#[derive(Debug, Clone)]
pub struct TypeHandle {
    pub ty: Arc<RuntimeType>,
    pub args: Vec<TypeHandle>,
}

impl TypeHandle {
    pub fn new(ty: Arc<RuntimeType>) -> Self {
        Self { ty, args: Vec::new() }
    }

    pub fn full_name(&self) -> &str {
        self.ty.full_name()
    }

    pub fn display_name(&self) -> String {
        if self.args.is_empty() {
            return self.ty.full_name().to_string();
        }
        let args: Vec<String> = self.args.iter().map(TypeHandle::display_name).collect();
        format!("{}<{}>", self.ty.full_name(), args.join(","))
    }

    /// Whether `value` is an instance of this type.
    pub fn accepts(&self, value: &Value) -> bool {
        let name = self.full_name();
        if name == corelib::OBJECT {
            return !matches!(value, Value::Null);
        }
        match value {
            Value::Null => false,
            Value::Int(_) => matches!(name, "System.Int32" | "System.Int64" | "System.Boolean"),
            Value::Float(_) => name == "System.Double",
            Value::Str(_) => name == corelib::STRING,
            Value::Object(obj) => obj.ty.full_name() == name,
        }
    }

    /// Whether a catch clause of this type handles the exception `value`.
    pub fn catches(&self, value: &Value) -> bool {
        self.full_name() == corelib::EXCEPTION || self.accepts(value)
    }
}

#[derive(Debug, Clone)]
pub struct FieldHandle {
    pub owner: Arc<RuntimeType>,
    pub name: String,
    pub is_static: bool,
}

impl fmt::Display for FieldHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.owner.full_name(), self.name)
    }
}

#[derive(Debug, Clone)]
pub struct PropertyHandle {
    pub owner: Arc<RuntimeType>,
    pub name: String,
    pub getter: Option<MethodHandle>,
}

impl fmt::Display for PropertyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.owner.full_name(), self.name)
    }
}

pub struct LoadedModule {
    id: ModuleId,
    name: ModuleName,
    module_name: String,
    kind: LoadKind,
    types: Vec<Arc<RuntimeType>>,
}

impl LoadedModule {
    pub fn id(&self) -> ModuleId {
        self.id
    }

    pub fn name(&self) -> &ModuleName {
        &self.name
    }

    pub fn module_name(&self) -> &str {
        &self.module_name
    }

    pub fn kind(&self) -> LoadKind {
        self.kind
    }

    pub fn is_live(&self) -> bool {
        self.kind == LoadKind::Live
    }

    pub fn types(&self) -> &[Arc<RuntimeType>] {
        &self.types
    }

    pub fn find_type(&self, full_name: &str) -> Option<Arc<RuntimeType>> {
        self.types.iter().find(|t| t.full_name() == full_name).cloned()
    }
}

impl fmt::Debug for LoadedModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedModule")
            .field("id", &self.id)
            .field("name", &self.name.to_string())
            .field("kind", &self.kind)
            .finish()
    }
}

/// Destination of `System.Console` output.
pub trait ConsoleSink: Send + Sync {
    fn write_line(&self, line: &str);
}

pub struct StdoutConsole;

impl ConsoleSink for StdoutConsole {
    fn write_line(&self, line: &str) {
        println!("{line}");
    }
}

/// Console that records lines, for hosts that inspect program output.
#[derive(Default)]
pub struct CapturedConsole {
    lines: Mutex<Vec<String>>,
}

impl CapturedConsole {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }

    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.lines.lock())
    }
}

impl ConsoleSink for CapturedConsole {
    fn write_line(&self, line: &str) {
        self.lines.lock().push(line.to_string());
    }
}

/// Receives calls to the runtime's module-loading entry point once installed.
pub trait LoadInterceptor: Send + Sync {
    fn load(&self, runtime: &Runtime, path: &Path) -> Result<Arc<LoadedModule>, LoadError>;
}

pub struct Runtime {
    modules: RwLock<Vec<Arc<LoadedModule>>>,
    next_module: AtomicU32,
    console: Arc<dyn ConsoleSink>,
    interceptor: RwLock<Option<Arc<dyn LoadInterceptor>>>,
    policy: VersionPolicy,
}

impl Runtime {
    /// Create a runtime with the core library loaded and output going to stdout.
    pub fn new() -> Result<Self, LoadError> {
        Self::with_console(Arc::new(StdoutConsole))
    }

    pub fn with_console(console: Arc<dyn ConsoleSink>) -> Result<Self, LoadError> {
        Self::with_options(console, VersionPolicy::default())
    }

    pub fn with_options(
        console: Arc<dyn ConsoleSink>,
        policy: VersionPolicy,
    ) -> Result<Self, LoadError> {
        let runtime = Self {
            modules: RwLock::new(Vec::new()),
            next_module: AtomicU32::new(0),
            console,
            interceptor: RwLock::new(None),
            policy,
        };
        runtime.load_image(&corelib::image(), LoadKind::Live, &corelib::natives())?;
        Ok(runtime)
    }

    pub fn console(&self) -> &Arc<dyn ConsoleSink> {
        &self.console
    }

    pub fn version_policy(&self) -> VersionPolicy {
        self.policy
    }

    pub fn modules(&self) -> Vec<Arc<LoadedModule>> {
        self.modules.read().clone()
    }

    /// Route future [`Runtime::load_from`] calls through `interceptor`.
    pub fn set_load_interceptor(&self, interceptor: Arc<dyn LoadInterceptor>) {
        *self.interceptor.write() = Some(interceptor);
    }

    /// The host's normal module-loading entry point.
    pub fn load_from(&self, path: &Path) -> Result<Arc<LoadedModule>, LoadError> {
        let interceptor = self.interceptor.read().clone();
        match interceptor {
            Some(interceptor) => interceptor.load(self, path),
            None => self.load_live_bytes(&read_module_bytes(path)?),
        }
    }

    pub fn load_live_bytes(&self, bytes: &[u8]) -> Result<Arc<LoadedModule>, LoadError> {
        self.load_live(&ModuleImage::from_bytes(bytes)?)
    }

    pub fn load_inert_bytes(&self, bytes: &[u8]) -> Result<Arc<LoadedModule>, LoadError> {
        self.load_inert(&ModuleImage::from_bytes(bytes)?)
    }

    pub fn load_live(&self, image: &ModuleImage) -> Result<Arc<LoadedModule>, LoadError> {
        self.load_image(image, LoadKind::Live, &HashMap::new())
    }

    pub fn load_inert(&self, image: &ModuleImage) -> Result<Arc<LoadedModule>, LoadError> {
        self.load_image(image, LoadKind::Inert, &HashMap::new())
    }

    fn load_image(
        &self,
        image: &ModuleImage,
        kind: LoadKind,
        natives: &HashMap<String, NativeFn>,
    ) -> Result<Arc<LoadedModule>, LoadError> {
        let module = {
            let mut modules = self.modules.write();
            // Module identity cache: same name and version means the same module.
            if let Some(existing) =
                modules.iter().find(|m| m.kind == kind && m.name == image.name)
            {
                return Ok(existing.clone());
            }
            let id = ModuleId(self.next_module.fetch_add(1, Ordering::Relaxed));
            let types = image
                .types
                .iter()
                .map(|def| RuntimeType::build(def, id, kind, natives))
                .collect();
            let module = Arc::new(LoadedModule {
                id,
                name: image.name.clone(),
                module_name: image.module_name.clone(),
                kind,
                types,
            });
            modules.push(module.clone());
            module
        };

        if kind == LoadKind::Live {
            self.run_static_initializers(&module)?;
        }
        Ok(module)
    }

    fn run_static_initializers(&self, module: &LoadedModule) -> Result<(), LoadError> {
        for ty in module.types() {
            let initializer = ty
                .methods()
                .iter()
                .find(|m| m.name() == STATIC_INITIALIZER_NAME && m.is_static())
                .cloned();
            if let Some(initializer) = initializer {
                self.invoke(&initializer, Vec::new()).map_err(|e| LoadError::Initializer {
                    type_name: ty.full_name().to_string(),
                    reason: e.to_string(),
                })?;
            }
        }
        Ok(())
    }

    /// Every loaded type with this full name, in load order, with its module.
    pub fn find_types(&self, full_name: &str) -> Vec<(Arc<LoadedModule>, Arc<RuntimeType>)> {
        self.modules
            .read()
            .iter()
            .filter_map(|m| m.find_type(full_name).map(|t| (m.clone(), t)))
            .collect()
    }

    /// First live type with this full name.
    pub fn find_live_type(&self, full_name: &str) -> Option<Arc<RuntimeType>> {
        self.modules.read().iter().filter(|m| m.is_live()).find_map(|m| m.find_type(full_name))
    }

    /// Live method with this identity key.
    pub fn find_method(&self, identity: &IdentityKey) -> Option<MethodHandle> {
        self.modules
            .read()
            .iter()
            .filter(|m| m.is_live())
            .flat_map(|m| m.types().iter())
            .flat_map(|t| t.methods().iter())
            .find(|m| m.identity() == identity)
            .cloned()
    }

    /// Call a live method by identity key.
    pub fn call(&self, identity: &IdentityKey, args: Vec<Value>) -> Result<Value, VmError> {
        let method =
            self.find_method(identity).ok_or_else(|| VmError::MissingMethod(identity.to_string()))?;
        self.invoke(&method, args)
    }

    pub fn invoke(&self, method: &RuntimeMethod, args: Vec<Value>) -> Result<Value, VmError> {
        if method.kind == LoadKind::Inert {
            return Err(VmError::NotInvocable {
                method: method.identity.to_string(),
                reason: "declared in an inert module".into(),
            });
        }
        let expected = method.def.arg_count();
        if args.len() != expected {
            return Err(VmError::NotInvocable {
                method: method.identity.to_string(),
                reason: format!("expected {expected} arguments, got {}", args.len()),
            });
        }
        method.calls.fetch_add(1, Ordering::Relaxed);

        let body = match method.code() {
            MethodCode::Native(f) => return f(self, &args),
            MethodCode::Compiled(body) => body,
            MethodCode::Detoured(detour) => detour.body(self, method)?,
            MethodCode::Pending => self.jit(method)?,
        };
        interp::execute(self, &body, args)
    }

    /// Compile a method from its own descriptive body and make it the method's code.
    fn jit(&self, method: &RuntimeMethod) -> Result<Arc<CompiledBody>, VmError> {
        let body = method.def.body.as_ref().ok_or_else(|| VmError::NotInvocable {
            method: method.identity.to_string(),
            reason: "method has no body".into(),
        })?;
        let mut emitter = Emitter::new();
        let instructions = Translator::new(self, self.policy)
            .translate(body, &mut emitter)
            .map_err(|e| VmError::Compile {
                method: method.identity.to_string(),
                reason: e.to_string(),
            })?;
        let compiled = self.compile(method.identity.as_str(), emitter, instructions)?;
        Ok(method.publish_compiled(compiled))
    }

    /// Function-compilation facility: assemble an executable sequence into a callable body.
    pub fn compile(
        &self,
        name: &str,
        emitter: Emitter,
        instructions: Vec<ExecInstruction>,
    ) -> Result<Arc<CompiledBody>, VmError> {
        assemble(name, emitter, instructions)
            .map(Arc::new)
            .map_err(|e| VmError::Compile { method: name.to_string(), reason: e.to_string() })
    }

    /// Build a managed exception object of a core exception type.
    pub fn new_exception(&self, type_name: &str, message: &str) -> Value {
        let ty = self
            .find_live_type(type_name)
            .or_else(|| self.find_live_type(corelib::EXCEPTION));
        match ty {
            Some(ty) => {
                let obj = Object::new(ty);
                obj.set(value::MESSAGE_FIELD, Value::str(message));
                Value::Object(Arc::new(obj))
            }
            None => Value::str(message),
        }
    }

    /// Error carrying a fresh managed exception.
    pub fn raise(&self, type_name: &str, message: &str) -> VmError {
        VmError::Exception(self.new_exception(type_name, message))
    }

    /// Resolve a [`TypeRef`] by full name against live modules only.
    pub fn type_handle(&self, ty: &TypeRef) -> Option<TypeHandle> {
        let def = self.find_live_type(&ty.full_name)?;
        let args = ty.generic_args.iter().map(|a| self.type_handle(a)).collect::<Option<Vec<_>>>()?;
        Some(TypeHandle { ty: def, args })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{opcodes, BodyBuilder, MethodRef, ModuleVersion, TypeDef, VOID_TYPE};

    fn sample_image(version: ModuleVersion) -> ModuleImage {
        let mut b = BodyBuilder::new();
        b.ldstr("hi")
            .call(MethodRef::new(
                TypeRef::named(corelib::CONSOLE),
                "WriteLine",
                vec![TypeRef::named(corelib::STRING)],
            ))
            .ret();
        let show = MethodDef::new("Show", TypeRef::named(VOID_TYPE))
            .static_method()
            .reloadable()
            .with_body(b.build().unwrap());
        ModuleImage::new(ModuleName::new("Sample", version))
            .with_type(TypeDef::new("Sample.Greeter").with_method(show))
    }

    fn captured_runtime() -> (Runtime, Arc<CapturedConsole>) {
        let console = Arc::new(CapturedConsole::new());
        let runtime = Runtime::with_console(console.clone()).unwrap();
        (runtime, console)
    }

    #[test]
    fn live_method_compiles_on_first_call() {
        let (runtime, console) = captured_runtime();
        runtime.load_live(&sample_image(ModuleVersion::new(1, 0, 0, 0))).unwrap();
        let key = IdentityKey::parse("Sample.Greeter.Show").unwrap();
        let method = runtime.find_method(&key).unwrap();
        assert!(!method.is_resolved());
        runtime.call(&key, vec![]).unwrap();
        assert!(method.is_resolved());
        assert_eq!(console.lines(), vec!["hi".to_string()]);
    }

    #[test]
    fn inert_methods_are_not_invocable() {
        let (runtime, _console) = captured_runtime();
        let module = runtime.load_inert(&sample_image(ModuleVersion::new(1, 0, 0, 0))).unwrap();
        let method = module.types()[0].methods()[0].clone();
        let err = runtime.invoke(&method, vec![]).unwrap_err();
        assert!(matches!(err, VmError::NotInvocable { .. }));
        assert!(runtime.find_method(method.identity()).is_none());
    }

    #[test]
    fn module_identity_cache_returns_existing_module() {
        let (runtime, _console) = captured_runtime();
        let first = runtime.load_inert(&sample_image(ModuleVersion::new(1, 0, 0, 1))).unwrap();
        let again = runtime.load_inert(&sample_image(ModuleVersion::new(1, 0, 0, 1))).unwrap();
        let bumped = runtime.load_inert(&sample_image(ModuleVersion::new(1, 0, 0, 2))).unwrap();
        assert_eq!(first.id(), again.id());
        assert_ne!(first.id(), bumped.id());
    }

    #[test]
    fn detour_requires_a_resolved_method() {
        let (runtime, _console) = captured_runtime();
        runtime.load_live(&sample_image(ModuleVersion::default())).unwrap();
        let key = IdentityKey::parse("Sample.Greeter.Show").unwrap();
        let method = runtime.find_method(&key).unwrap();

        struct Never;
        impl Detour for Never {
            fn body(&self, _: &Runtime, m: &RuntimeMethod) -> Result<Arc<CompiledBody>, VmError> {
                Err(VmError::MissingMethod(m.identity().to_string()))
            }
        }

        let err = method.install_detour(|_| Arc::new(Never)).unwrap_err();
        assert!(matches!(err, DetourError::Unresolved(_)));

        let write_line = runtime
            .find_method(&IdentityKey::new(corelib::CONSOLE, "WriteLine", [corelib::STRING]).unwrap())
            .unwrap();
        let err = write_line.install_detour(|_| Arc::new(Never)).unwrap_err();
        assert!(matches!(err, DetourError::Native(_)));
    }

    #[test]
    fn nameless_member_is_left_out_without_failing_the_load() {
        let (runtime, console) = captured_runtime();
        let mut image = sample_image(ModuleVersion::new(1, 0, 0, 0));
        image.types[0]
            .methods
            .push(MethodDef::new("", TypeRef::named(VOID_TYPE)).static_method().reloadable());

        let module = runtime.load_inert(&image).unwrap();
        assert_eq!(module.types()[0].methods().len(), 1);
        runtime.load_live(&image).unwrap();
        runtime.call(&IdentityKey::parse("Sample.Greeter.Show").unwrap(), vec![]).unwrap();
        assert_eq!(console.lines(), vec!["hi".to_string()]);
    }

    #[test]
    fn static_initializer_runs_on_live_load() {
        let (runtime, console) = captured_runtime();
        let mut b = BodyBuilder::new();
        b.ldstr("init")
            .call(MethodRef::new(
                TypeRef::named(corelib::CONSOLE),
                "WriteLine",
                vec![TypeRef::named(corelib::STRING)],
            ))
            .op(opcodes::RET);
        let cctor = MethodDef::new(STATIC_INITIALIZER_NAME, TypeRef::named(VOID_TYPE))
            .static_method()
            .with_body(b.build().unwrap());
        let image = ModuleImage::new(ModuleName::new("Init", ModuleVersion::default()))
            .with_type(TypeDef::new("Init.Boot").with_method(cctor));
        runtime.load_inert(&image).unwrap();
        assert!(console.lines().is_empty());
        runtime.load_live(&image).unwrap();
        assert_eq!(console.lines(), vec!["init".to_string()]);
    }
}
