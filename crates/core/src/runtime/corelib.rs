//! Built-in core library: primitive types, console output, string helpers and exceptions.

use std::collections::HashMap;

use super::value::{Value, VmError, MESSAGE_FIELD};
use super::{NativeFn, Runtime};
use crate::model::{
    IdentityKey, MethodDef, ModuleImage, ModuleName, ModuleVersion, PropertyDef, TypeDef, TypeRef,
    CONSTRUCTOR_NAME, VOID_TYPE,
};

pub const CORE_LIBRARY: &str = "System.Private.CoreLib";

pub const OBJECT: &str = "System.Object";
pub const STRING: &str = "System.String";
pub const CONSOLE: &str = "System.Console";
pub const EXCEPTION: &str = "System.Exception";
pub const DIVIDE_BY_ZERO: &str = "System.DivideByZeroException";
pub const NULL_REFERENCE: &str = "System.NullReferenceException";
pub const INVALID_CAST: &str = "System.InvalidCastException";
pub const INVALID_OPERATION: &str = "System.InvalidOperationException";
pub const ARGUMENT: &str = "System.ArgumentException";

const PRIMITIVES: &[&str] =
    &[VOID_TYPE, "System.Int32", "System.Int64", "System.Double", "System.Boolean"];

const EXCEPTIONS: &[&str] =
    &[EXCEPTION, DIVIDE_BY_ZERO, NULL_REFERENCE, INVALID_CAST, INVALID_OPERATION, ARGUMENT];

pub fn module_name() -> ModuleName {
    ModuleName::new(CORE_LIBRARY, ModuleVersion::new(4, 0, 0, 0))
}

fn t(name: &str) -> TypeRef {
    TypeRef::named(name)
}

/// Descriptive image of the core library. Every method is backed by a native function.
pub fn image() -> ModuleImage {
    let mut image = ModuleImage::new(module_name())
        .with_type(
            TypeDef::new(OBJECT).with_method(MethodDef::new(CONSTRUCTOR_NAME, t(VOID_TYPE))),
        )
        .with_type(
            TypeDef::new(STRING)
                .with_method(
                    MethodDef::new("Concat", t(STRING))
                        .static_method()
                        .with_param("str0", t(STRING))
                        .with_param("str1", t(STRING)),
                )
                .with_method(
                    MethodDef::new("Concat", t(STRING))
                        .static_method()
                        .with_param("arg0", t(OBJECT))
                        .with_param("arg1", t(OBJECT)),
                ),
        )
        .with_type(
            TypeDef::new(CONSOLE)
                .with_method(
                    MethodDef::new("WriteLine", t(VOID_TYPE))
                        .static_method()
                        .with_param("value", t(STRING)),
                )
                .with_method(
                    MethodDef::new("WriteLine", t(VOID_TYPE))
                        .static_method()
                        .with_param("value", t(OBJECT)),
                ),
        );
    for name in PRIMITIVES {
        image = image.with_type(TypeDef::new(*name));
    }
    for name in EXCEPTIONS {
        image = image.with_type(exception_type(name));
    }
    image
}

fn exception_type(name: &str) -> TypeDef {
    TypeDef::new(name)
        .with_field(MESSAGE_FIELD, t(STRING), false)
        .with_property(PropertyDef {
            name: MESSAGE_FIELD.to_string(),
            ty: t(STRING),
            getter: Some("get_Message".to_string()),
            setter: None,
        })
        .with_method(MethodDef::new(CONSTRUCTOR_NAME, t(VOID_TYPE)))
        .with_method(MethodDef::new(CONSTRUCTOR_NAME, t(VOID_TYPE)).with_param("message", t(STRING)))
        .with_method(MethodDef::new("get_Message", t(STRING)))
}

fn key(ty: &str, member: &str, params: &[&str]) -> String {
    IdentityKey::new(ty, member, params.iter().copied())
        .map(|k| k.to_string())
        .unwrap_or_default()
}

/// Native implementations keyed by identity key.
pub fn natives() -> HashMap<String, NativeFn> {
    let mut natives: HashMap<String, NativeFn> = HashMap::new();
    natives.insert(key(OBJECT, CONSTRUCTOR_NAME, &[]), object_ctor);
    natives.insert(key(STRING, "Concat", &[STRING, STRING]), concat);
    natives.insert(key(STRING, "Concat", &[OBJECT, OBJECT]), concat);
    natives.insert(key(CONSOLE, "WriteLine", &[STRING]), write_line);
    natives.insert(key(CONSOLE, "WriteLine", &[OBJECT]), write_line);
    for name in EXCEPTIONS {
        natives.insert(key(name, CONSTRUCTOR_NAME, &[]), exception_ctor);
        natives.insert(key(name, CONSTRUCTOR_NAME, &[STRING]), exception_ctor);
        natives.insert(key(name, "get_Message", &[]), exception_message);
    }
    natives
}

fn object_ctor(_: &Runtime, _: &[Value]) -> Result<Value, VmError> {
    Ok(Value::Null)
}

fn concat(_: &Runtime, args: &[Value]) -> Result<Value, VmError> {
    let text: String = args.iter().map(Value::to_display_string).collect();
    Ok(Value::str(&text))
}

fn write_line(runtime: &Runtime, args: &[Value]) -> Result<Value, VmError> {
    let line = args.first().map(Value::to_display_string).unwrap_or_default();
    runtime.console().write_line(&line);
    Ok(Value::Null)
}

fn exception_ctor(runtime: &Runtime, args: &[Value]) -> Result<Value, VmError> {
    let this = args
        .first()
        .and_then(Value::as_object)
        .ok_or_else(|| runtime.raise(NULL_REFERENCE, "constructor called without an instance"))?;
    let message = match args.get(1) {
        Some(message) => message.clone(),
        None => Value::str(&format!("Exception of type '{}' was thrown.", this.ty.full_name())),
    };
    this.set(MESSAGE_FIELD, message);
    Ok(Value::Null)
}

fn exception_message(runtime: &Runtime, args: &[Value]) -> Result<Value, VmError> {
    let this = args
        .first()
        .and_then(Value::as_object)
        .ok_or_else(|| runtime.raise(NULL_REFERENCE, "Message read on a null reference"))?;
    Ok(this.get(MESSAGE_FIELD))
}
