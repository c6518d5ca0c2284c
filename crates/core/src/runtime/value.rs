use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

use super::RuntimeType;

/// Field holding an exception's message.
pub const MESSAGE_FIELD: &str = "Message";

/// Heap object: an instance of a runtime type with named fields.
pub struct Object {
    pub ty: Arc<RuntimeType>,
    fields: Mutex<HashMap<String, Value>>,
}

impl Object {
    pub fn new(ty: Arc<RuntimeType>) -> Self {
        let fields = ty
            .fields()
            .iter()
            .filter(|f| !f.is_static)
            .map(|f| (f.name.clone(), Value::default_for(&f.ty.full_name)))
            .collect();
        Self { ty, fields: Mutex::new(fields) }
    }

    pub fn get(&self, name: &str) -> Value {
        self.fields.lock().get(name).cloned().unwrap_or(Value::Null)
    }

    pub fn set(&self, name: &str, value: Value) {
        self.fields.lock().insert(name.to_string(), value);
    }
}

/// Runtime value on the evaluation stack, in locals, arguments and fields.
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Int(i64),
    Float(f64),
    Str(Arc<str>),
    Object(Arc<Object>),
}

impl Value {
    pub fn str(value: &str) -> Self {
        Value::Str(Arc::from(value))
    }

    /// Zero value for a field or local of the given type.
    pub fn default_for(type_name: &str) -> Self {
        match type_name {
            "System.Int32" | "System.Int64" | "System.Boolean" => Value::Int(0),
            "System.Double" => Value::Float(0.0),
            _ => Value::Null,
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Int(v) => *v != 0,
            Value::Float(v) => *v != 0.0,
            Value::Str(_) | Value::Object(_) => true,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Float(v) => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Arc<Object>> {
        match self {
            Value::Object(obj) => Some(obj),
            _ => None,
        }
    }

    /// Full name of the value's runtime type.
    pub fn type_name(&self) -> String {
        match self {
            Value::Null => "null".to_string(),
            Value::Int(_) => "System.Int64".to_string(),
            Value::Float(_) => "System.Double".to_string(),
            Value::Str(_) => "System.String".to_string(),
            Value::Object(obj) => obj.ty.full_name().to_string(),
        }
    }

    /// Text used by console output and string concatenation.
    pub fn to_display_string(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Int(v) => v.to_string(),
            Value::Float(v) => v.to_string(),
            Value::Str(s) => s.to_string(),
            Value::Object(obj) => match obj.get(MESSAGE_FIELD) {
                Value::Str(msg) => format!("{}: {msg}", obj.ty.full_name()),
                _ => obj.ty.full_name().to_string(),
            },
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => Arc::ptr_eq(a, b),
            (a, b) => match (a.as_float(), b.as_float()) {
                (Some(x), Some(y)) => x == y,
                _ => false,
            },
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v:?}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::Object(obj) => write!(f, "<{}>", obj.ty.full_name()),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::str(v)
    }
}

/// Errors raised while invoking or executing code.
#[derive(Debug, Error)]
pub enum VmError {
    /// A managed exception that no handler in the call chain caught.
    #[error("Unhandled exception: {}", .0.to_display_string())]
    Exception(Value),
    #[error("Evaluation stack underflow in {0}")]
    StackUnderflow(String),
    #[error("Invalid program in {method}: {reason}")]
    InvalidProgram { method: String, reason: String },
    #[error("{method} cannot be invoked: {reason}")]
    NotInvocable { method: String, reason: String },
    #[error("Failed to compile {method}: {reason}")]
    Compile { method: String, reason: String },
    #[error("Method not found: {0}")]
    MissingMethod(String),
}

impl VmError {
    /// The managed exception object, if this error carries one.
    pub fn exception(&self) -> Option<&Value> {
        match self {
            VmError::Exception(value) => Some(value),
            _ => None,
        }
    }
}
