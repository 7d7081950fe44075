use stackil_bytecode::core::metadata::{MethodRef, TypeRef};
use stackil_bytecode::core::types::VerificationType;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Int32(i32),
    Int64(i64),
    NativeInt(i64),
    Float32(f32),
    Float64(f64),
    Null,
    Str(Arc<str>),
    Object(ObjectId),
    Struct(Box<StructValue>),
    /// Managed pointer into the current frame
    Ref(Place),
    /// Function pointer pushed by `ldftn`
    Method(MethodRef),
}

/// Heap address
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(pub(crate) usize);

#[derive(Clone, Debug, PartialEq)]
pub struct StructValue {
    pub ty: TypeRef,
    pub fields: BTreeMap<String, Value>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Place {
    Local(u16),
    Argument(u16),
}

impl Value {
    /// Zero value a local, field or array element of type `ty` starts with
    pub fn default_for(ty: &VerificationType) -> Value {
        match ty {
            VerificationType::Int32 => Value::Int32(0),
            VerificationType::Int64 => Value::Int64(0),
            VerificationType::NativeInt => Value::NativeInt(0),
            VerificationType::Float32 => Value::Float32(0.0),
            VerificationType::Float64 => Value::Float64(0.0),
            VerificationType::Value(ty) => Value::Struct(Box::new(StructValue {
                ty: ty.clone(),
                fields: BTreeMap::new(),
            })),
            VerificationType::Null
            | VerificationType::Object(_)
            | VerificationType::ManagedPtr(_)
            | VerificationType::UnmanagedPtr(_) => Value::Null,
        }
    }

    pub fn str(text: &str) -> Value {
        Value::Str(Arc::from(text))
    }

    /// Integer payload of any integer-typed value
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int32(n) => Some(i64::from(*n)),
            Value::Int64(n) | Value::NativeInt(n) => Some(*n),
            _ => None,
        }
    }

    pub(crate) fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float32(x) => Some(f64::from(*x)),
            Value::Float64(x) => Some(*x),
            _ => None,
        }
    }

    /// Truth as `brtrue` sees it: non-zero or non-null
    pub(crate) fn is_true(&self) -> bool {
        match self {
            Value::Int32(n) => *n != 0,
            Value::Int64(n) | Value::NativeInt(n) => *n != 0,
            Value::Float32(x) => *x != 0.0,
            Value::Float64(x) => *x != 0.0,
            Value::Null => false,
            _ => true,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int32(n) => write!(f, "{n}"),
            Value::Int64(n) => write!(f, "{n}L"),
            Value::NativeInt(n) => write!(f, "{n}n"),
            Value::Float32(x) => write!(f, "{x}f"),
            Value::Float64(x) => write!(f, "{x}"),
            Value::Null => f.write_str("null"),
            Value::Str(text) => write!(f, "{text:?}"),
            Value::Object(id) => write!(f, "#{}", id.0),
            Value::Struct(s) => write!(f, "{} {{ {} fields }}", s.ty, s.fields.len()),
            Value::Ref(place) => write!(f, "&{place:?}"),
            Value::Method(method) => write!(f, "&{method}"),
        }
    }
}
