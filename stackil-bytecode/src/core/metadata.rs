//! Type and member metadata
//!
//! Operands that name types, methods and fields are cheap shared references
//! (`Arc`-backed). The verifier never introspects a runtime; it asks a
//! [`TypeProvider`] for subtype facts and reads member signatures off the
//! references themselves.

use crate::core::types::VerificationType;
use crate::error::{BytecodeError, Result};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

/// Root of the reference-type hierarchy
pub const OBJECT_TYPE: &str = "System.Object";
pub const STRING_TYPE: &str = "System.String";
pub const EXCEPTION_TYPE: &str = "System.Exception";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeKind {
    Class,
    Interface,
    ValueType,
    /// Single-dimension, zero-based array of the element type
    Array(VerificationType),
}

#[derive(Debug, PartialEq, Eq, Hash)]
struct TypeData {
    name: String,
    kind: TypeKind,
}

/// Shared reference to a named type
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct TypeRef {
    inner: Arc<TypeData>,
}

impl TypeRef {
    fn with_kind(name: impl Into<String>, kind: TypeKind) -> Self {
        Self {
            inner: Arc::new(TypeData {
                name: name.into(),
                kind,
            }),
        }
    }

    pub fn class(name: impl Into<String>) -> Self {
        Self::with_kind(name, TypeKind::Class)
    }

    pub fn interface(name: impl Into<String>) -> Self {
        Self::with_kind(name, TypeKind::Interface)
    }

    pub fn value_type(name: impl Into<String>) -> Self {
        Self::with_kind(name, TypeKind::ValueType)
    }

    pub fn array_of(element: VerificationType) -> Self {
        Self::with_kind(format!("{element}[]"), TypeKind::Array(element))
    }

    pub fn object() -> Self {
        Self::class(OBJECT_TYPE)
    }

    pub fn string() -> Self {
        Self::class(STRING_TYPE)
    }

    pub fn exception() -> Self {
        Self::class(EXCEPTION_TYPE)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn kind(&self) -> &TypeKind {
        &self.inner.kind
    }

    pub fn is_value_type(&self) -> bool {
        self.inner.kind == TypeKind::ValueType
    }

    pub fn is_object(&self) -> bool {
        self.inner.name == OBJECT_TYPE && self.inner.kind == TypeKind::Class
    }

    /// Element type when this is an array type
    pub fn element_type(&self) -> Option<&VerificationType> {
        match &self.inner.kind {
            TypeKind::Array(element) => Some(element),
            _ => None,
        }
    }
}

impl fmt::Debug for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeRef({})", self.inner.name)
    }
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner.name)
    }
}

/// Read-only oracle for type relationships
pub trait TypeProvider {
    /// `true` when `from` derives from or implements `to`. Reflexive.
    fn is_subtype(&self, from: &TypeRef, to: &TypeRef) -> bool;
}

impl<T: TypeProvider + ?Sized> TypeProvider for Arc<T> {
    fn is_subtype(&self, from: &TypeRef, to: &TypeRef) -> bool {
        (**self).is_subtype(from, to)
    }
}

impl<T: TypeProvider + ?Sized> TypeProvider for &T {
    fn is_subtype(&self, from: &TypeRef, to: &TypeRef) -> bool {
        (**self).is_subtype(from, to)
    }
}

/// In-memory type hierarchy. Every type implicitly derives from
/// `System.Object`; arrays of references are covariant.
#[derive(Debug, Default, Clone)]
pub struct ClassHierarchy {
    bases: HashMap<TypeRef, Vec<TypeRef>>,
}

impl ClassHierarchy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare `ty` with its direct base class and interfaces
    pub fn declare(
        &mut self,
        ty: TypeRef,
        bases: impl IntoIterator<Item = TypeRef>,
    ) -> Result<&mut Self> {
        if self.bases.contains_key(&ty) {
            return Err(BytecodeError::DuplicateType(ty.name().to_string()));
        }
        let bases: Vec<TypeRef> = bases.into_iter().collect();
        if bases.iter().any(|base| self.is_subtype(base, &ty)) {
            return Err(BytecodeError::InheritanceCycle(ty.name().to_string()));
        }
        self.bases.insert(ty, bases);
        Ok(self)
    }

    /// Builder-style variant of [`ClassHierarchy::declare`]
    pub fn with(mut self, ty: TypeRef, bases: impl IntoIterator<Item = TypeRef>) -> Result<Self> {
        self.declare(ty, bases)?;
        Ok(self)
    }

    pub fn is_declared(&self, ty: &TypeRef) -> bool {
        self.bases.contains_key(ty)
    }

    fn derives(&self, from: &TypeRef, to: &TypeRef) -> bool {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([from]);
        while let Some(current) = queue.pop_front() {
            if current == to {
                return true;
            }
            if !seen.insert(current) {
                continue;
            }
            if let Some(bases) = self.bases.get(current) {
                queue.extend(bases.iter());
            }
        }
        false
    }
}

impl TypeProvider for ClassHierarchy {
    fn is_subtype(&self, from: &TypeRef, to: &TypeRef) -> bool {
        if from == to || to.is_object() {
            return true;
        }
        match (from.element_type(), to.element_type()) {
            (Some(VerificationType::Object(a)), Some(VerificationType::Object(b))) => {
                self.is_subtype(a, b)
            }
            (Some(a), Some(b)) => a == b,
            _ => self.derives(from, to),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MethodKind {
    Static,
    Instance,
    Virtual,
    Constructor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CallingConvention {
    #[default]
    Default,
    VarArgs,
}

#[derive(Debug, PartialEq, Eq, Hash)]
struct MethodData {
    declaring: TypeRef,
    name: String,
    kind: MethodKind,
    convention: CallingConvention,
    params: Vec<VerificationType>,
    ret: Option<VerificationType>,
}

/// Shared reference to a method
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct MethodRef {
    inner: Arc<MethodData>,
}

impl MethodRef {
    pub fn new(
        declaring: TypeRef,
        name: impl Into<String>,
        kind: MethodKind,
        params: impl IntoIterator<Item = VerificationType>,
        ret: Option<VerificationType>,
    ) -> Self {
        Self {
            inner: Arc::new(MethodData {
                declaring,
                name: name.into(),
                kind,
                convention: CallingConvention::Default,
                params: params.into_iter().collect(),
                ret,
            }),
        }
    }

    pub fn static_method(
        declaring: TypeRef,
        name: impl Into<String>,
        params: impl IntoIterator<Item = VerificationType>,
        ret: Option<VerificationType>,
    ) -> Self {
        Self::new(declaring, name, MethodKind::Static, params, ret)
    }

    pub fn instance_method(
        declaring: TypeRef,
        name: impl Into<String>,
        params: impl IntoIterator<Item = VerificationType>,
        ret: Option<VerificationType>,
    ) -> Self {
        Self::new(declaring, name, MethodKind::Instance, params, ret)
    }

    pub fn virtual_method(
        declaring: TypeRef,
        name: impl Into<String>,
        params: impl IntoIterator<Item = VerificationType>,
        ret: Option<VerificationType>,
    ) -> Self {
        Self::new(declaring, name, MethodKind::Virtual, params, ret)
    }

    pub fn constructor(declaring: TypeRef, params: impl IntoIterator<Item = VerificationType>) -> Self {
        Self::new(declaring, ".ctor", MethodKind::Constructor, params, None)
    }

    /// Copy of this reference with a different calling convention
    pub fn with_convention(&self, convention: CallingConvention) -> Self {
        let data = &self.inner;
        Self {
            inner: Arc::new(MethodData {
                declaring: data.declaring.clone(),
                name: data.name.clone(),
                kind: data.kind,
                convention,
                params: data.params.clone(),
                ret: data.ret.clone(),
            }),
        }
    }

    pub fn declaring_type(&self) -> &TypeRef {
        &self.inner.declaring
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn kind(&self) -> MethodKind {
        self.inner.kind
    }

    pub fn convention(&self) -> CallingConvention {
        self.inner.convention
    }

    pub fn params(&self) -> &[VerificationType] {
        &self.inner.params
    }

    pub fn return_type(&self) -> Option<&VerificationType> {
        self.inner.ret.as_ref()
    }

    pub fn has_this(&self) -> bool {
        !matches!(self.inner.kind, MethodKind::Static)
    }

    /// Type of the implicit `this` argument for instance methods
    pub fn this_type(&self) -> Option<VerificationType> {
        if !self.has_this() {
            return None;
        }
        let declaring = &self.inner.declaring;
        Some(if declaring.is_value_type() {
            VerificationType::managed_ptr(VerificationType::Value(declaring.clone()))
        } else {
            VerificationType::Object(declaring.clone())
        })
    }

    /// Arguments in push order, `this` first when present
    pub fn argument_types(&self) -> Vec<VerificationType> {
        self.this_type()
            .into_iter()
            .chain(self.inner.params.iter().cloned())
            .collect()
    }
}

impl fmt::Debug for MethodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MethodRef({self})")
    }
}

impl fmt::Display for MethodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = &self.inner;
        if let Some(ret) = &data.ret {
            write!(f, "{ret} ")?;
        } else {
            write!(f, "void ")?;
        }
        write!(f, "{}::{}(", data.declaring.name(), data.name)?;
        for (i, param) in data.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{param}")?;
        }
        write!(f, ")")
    }
}

#[derive(Debug, PartialEq, Eq, Hash)]
struct FieldData {
    declaring: TypeRef,
    name: String,
    ty: VerificationType,
    is_static: bool,
}

/// Shared reference to a field
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct FieldRef {
    inner: Arc<FieldData>,
}

impl FieldRef {
    pub fn instance(declaring: TypeRef, name: impl Into<String>, ty: VerificationType) -> Self {
        Self::new(declaring, name, ty, false)
    }

    pub fn static_field(declaring: TypeRef, name: impl Into<String>, ty: VerificationType) -> Self {
        Self::new(declaring, name, ty, true)
    }

    fn new(declaring: TypeRef, name: impl Into<String>, ty: VerificationType, is_static: bool) -> Self {
        Self {
            inner: Arc::new(FieldData {
                declaring,
                name: name.into(),
                ty,
                is_static,
            }),
        }
    }

    pub fn declaring_type(&self) -> &TypeRef {
        &self.inner.declaring
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn field_type(&self) -> &VerificationType {
        &self.inner.ty
    }

    pub fn is_static(&self) -> bool {
        self.inner.is_static
    }

    /// Type the instance operand of `ldfld`/`stfld` must be assignable to
    pub fn owner_operand(&self) -> VerificationType {
        let declaring = &self.inner.declaring;
        if declaring.is_value_type() {
            VerificationType::managed_ptr(VerificationType::Value(declaring.clone()))
        } else {
            VerificationType::Object(declaring.clone())
        }
    }
}

impl fmt::Debug for FieldRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FieldRef({self})")
    }
}

impl fmt::Display for FieldRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}::{}",
            self.inner.ty,
            self.inner.declaring.name(),
            self.inner.name
        )
    }
}

/// Signature of an indirect call target (`calli`)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallSignature {
    pub params: Vec<VerificationType>,
    pub ret: Option<VerificationType>,
    pub convention: CallingConvention,
}

impl CallSignature {
    pub fn new(
        params: impl IntoIterator<Item = VerificationType>,
        ret: Option<VerificationType>,
    ) -> Self {
        Self {
            params: params.into_iter().collect(),
            ret,
            convention: CallingConvention::Default,
        }
    }
}

impl From<&MethodRef> for CallSignature {
    fn from(method: &MethodRef) -> Self {
        Self {
            params: method.argument_types(),
            ret: method.return_type().cloned(),
            convention: method.convention(),
        }
    }
}

/// Signature of the method under construction
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct MethodSignature {
    /// Declaring type when the method has an implicit `this`
    pub this: Option<TypeRef>,
    pub params: Vec<VerificationType>,
    pub ret: Option<VerificationType>,
}

impl MethodSignature {
    pub fn new(
        params: impl IntoIterator<Item = VerificationType>,
        ret: Option<VerificationType>,
    ) -> Self {
        Self {
            this: None,
            params: params.into_iter().collect(),
            ret,
        }
    }

    pub fn with_this(mut self, declaring: TypeRef) -> Self {
        self.this = Some(declaring);
        self
    }

    /// Argument slot types, `this` at index 0 when present
    pub fn argument_types(&self) -> Vec<VerificationType> {
        let this = self.this.as_ref().map(|declaring| {
            if declaring.is_value_type() {
                VerificationType::managed_ptr(VerificationType::Value(declaring.clone()))
            } else {
                VerificationType::Object(declaring.clone())
            }
        });
        this.into_iter().chain(self.params.iter().cloned()).collect()
    }
}
