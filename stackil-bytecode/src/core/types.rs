//! Verification type lattice
//!
//! [`VerificationType`] is the static classification the verifier assigns to
//! every stack and local slot. [`TypeClass`] describes what an instruction
//! requires of an operand; it may be disjunctive ("int32 or native int").

use crate::core::metadata::{TypeProvider, TypeRef};
use std::fmt;

/// Static type of a stack or local slot
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VerificationType {
    Int32,
    Int64,
    NativeInt,
    Float32,
    Float64,
    /// The null reference: assignable to every object reference
    Null,
    /// Object reference whose static type is the payload
    Object(TypeRef),
    /// Managed pointer to a referent of the given type
    ManagedPtr(Box<VerificationType>),
    /// Unmanaged pointer to a referent of the given type
    UnmanagedPtr(Box<VerificationType>),
    /// Value-type instance
    Value(TypeRef),
}

impl VerificationType {
    pub fn object(ty: TypeRef) -> Self {
        VerificationType::Object(ty)
    }

    pub fn managed_ptr(referent: VerificationType) -> Self {
        VerificationType::ManagedPtr(Box::new(referent))
    }

    pub fn unmanaged_ptr(referent: VerificationType) -> Self {
        VerificationType::UnmanagedPtr(Box::new(referent))
    }

    /// Stack type of a value of `ty`: value types stay unboxed, everything
    /// else is an object reference
    pub fn of_type(ty: &TypeRef) -> Self {
        if ty.is_value_type() {
            VerificationType::Value(ty.clone())
        } else {
            VerificationType::Object(ty.clone())
        }
    }

    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            VerificationType::Int32 | VerificationType::Int64 | VerificationType::NativeInt
        )
    }

    pub fn is_float(&self) -> bool {
        matches!(self, VerificationType::Float32 | VerificationType::Float64)
    }

    pub fn is_numeric(&self) -> bool {
        self.is_integer() || self.is_float()
    }

    pub fn is_reference(&self) -> bool {
        matches!(self, VerificationType::Null | VerificationType::Object(_))
    }

    pub fn is_pointer(&self) -> bool {
        matches!(
            self,
            VerificationType::ManagedPtr(_) | VerificationType::UnmanagedPtr(_)
        )
    }

    /// Static type carried by an object reference, if any
    pub fn reference_type(&self) -> Option<&TypeRef> {
        match self {
            VerificationType::Object(ty) => Some(ty),
            _ => None,
        }
    }

    /// `true` when a value of `self` may flow into a slot typed `to`
    pub fn is_assignable_to(&self, to: &VerificationType, types: &dyn TypeProvider) -> bool {
        use VerificationType::*;
        match (self, to) {
            (a, b) if a == b => true,
            (Null, Object(_)) => true,
            (Object(from), Object(to)) => types.is_subtype(from, to),
            // Fixed and native width integers are interchangeable on assignment.
            (Int32, NativeInt) | (NativeInt, Int32) => true,
            _ => false,
        }
    }

    /// Result of a binary numeric operation, or `None` when the operand pair
    /// does not combine. Floats never combine across widths.
    pub fn binary_numeric(lhs: &VerificationType, rhs: &VerificationType) -> Option<Self> {
        use VerificationType::*;
        match (lhs, rhs) {
            (Int32, Int32) => Some(Int32),
            (Int64, Int64) => Some(Int64),
            (NativeInt, Int32) | (Int32, NativeInt) | (NativeInt, NativeInt) => Some(NativeInt),
            (Float32, Float32) => Some(Float32),
            (Float64, Float64) => Some(Float64),
            _ => None,
        }
    }

    /// Class the right operand of a binary numeric operation must satisfy
    /// given the left operand
    pub fn binary_partner(&self) -> TypeClass {
        match self {
            VerificationType::Int32 | VerificationType::NativeInt => TypeClass::Int32OrNativeInt,
            VerificationType::Int64 => TypeClass::Int64,
            VerificationType::Float32 => TypeClass::Float32,
            VerificationType::Float64 => TypeClass::Float64,
            _ => TypeClass::Numeric,
        }
    }
}

impl fmt::Display for VerificationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerificationType::Int32 => write!(f, "int32"),
            VerificationType::Int64 => write!(f, "int64"),
            VerificationType::NativeInt => write!(f, "native int"),
            VerificationType::Float32 => write!(f, "float32"),
            VerificationType::Float64 => write!(f, "float64"),
            VerificationType::Null => write!(f, "null"),
            VerificationType::Object(ty) => write!(f, "{}", ty.name()),
            VerificationType::ManagedPtr(inner) => write!(f, "{inner}&"),
            VerificationType::UnmanagedPtr(inner) => write!(f, "{inner}*"),
            VerificationType::Value(ty) => write!(f, "valuetype {}", ty.name()),
        }
    }
}

/// Requirement an instruction places on one operand
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeClass {
    Any,
    Int32,
    Int64,
    NativeInt,
    Float32,
    Float64,
    Int32OrNativeInt,
    Integer,
    Float,
    Numeric,
    Reference,
    Array,
    Pointer,
    /// Operand of `brtrue`/`brfalse`: an integer, pointer or object reference
    Condition,
    AssignableTo(VerificationType),
}

impl TypeClass {
    /// `Compatible(required, actual)`: pure predicate over the lattice
    pub fn accepts(&self, actual: &VerificationType, types: &dyn TypeProvider) -> bool {
        use VerificationType as V;
        match self {
            TypeClass::Any => true,
            TypeClass::Int32 => *actual == V::Int32,
            TypeClass::Int64 => *actual == V::Int64,
            TypeClass::NativeInt => *actual == V::NativeInt,
            TypeClass::Float32 => *actual == V::Float32,
            TypeClass::Float64 => *actual == V::Float64,
            TypeClass::Int32OrNativeInt => matches!(actual, V::Int32 | V::NativeInt),
            TypeClass::Integer => actual.is_integer(),
            TypeClass::Float => actual.is_float(),
            TypeClass::Numeric => actual.is_numeric(),
            TypeClass::Reference => actual.is_reference(),
            TypeClass::Array => match actual {
                V::Null => true,
                V::Object(ty) => ty.element_type().is_some(),
                _ => false,
            },
            TypeClass::Pointer => actual.is_pointer() || *actual == V::NativeInt,
            TypeClass::Condition => {
                actual.is_integer() || actual.is_reference() || actual.is_pointer()
            }
            TypeClass::AssignableTo(target) => actual.is_assignable_to(target, types),
        }
    }

    /// Display name prefixed with the matching indefinite article
    pub fn with_article(&self) -> String {
        let name = self.to_string();
        let article = match name.chars().next().map(|c| c.to_ascii_lowercase()) {
            Some('a' | 'e' | 'i' | 'o' | 'u') => "an",
            _ => "a",
        };
        format!("{article} {name}")
    }
}

impl fmt::Display for TypeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeClass::Any => write!(f, "value"),
            TypeClass::Int32 => write!(f, "int32"),
            TypeClass::Int64 => write!(f, "int64"),
            TypeClass::NativeInt => write!(f, "native int"),
            TypeClass::Float32 => write!(f, "float32"),
            TypeClass::Float64 => write!(f, "float64"),
            TypeClass::Int32OrNativeInt => write!(f, "int32 or native int"),
            TypeClass::Integer => write!(f, "integer"),
            TypeClass::Float => write!(f, "double or float"),
            TypeClass::Numeric => write!(f, "numeric value"),
            TypeClass::Reference => write!(f, "object reference"),
            TypeClass::Array => write!(f, "array reference"),
            TypeClass::Pointer => write!(f, "pointer"),
            TypeClass::Condition => write!(f, "integer, pointer or object reference"),
            TypeClass::AssignableTo(ty) => write!(f, "{ty}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::metadata::ClassHierarchy;

    fn hierarchy() -> (ClassHierarchy, TypeRef, TypeRef) {
        let animal = TypeRef::class("Animal");
        let dog = TypeRef::class("Dog");
        let mut types = ClassHierarchy::new();
        types.declare(animal.clone(), []).unwrap();
        types.declare(dog.clone(), [animal.clone()]).unwrap();
        (types, animal, dog)
    }

    #[test]
    fn test_binary_numeric() {
        use VerificationType::*;
        assert_eq!(VerificationType::binary_numeric(&Int32, &Int32), Some(Int32));
        assert_eq!(VerificationType::binary_numeric(&Int32, &NativeInt), Some(NativeInt));
        assert_eq!(VerificationType::binary_numeric(&Float32, &Float64), None);
        assert_eq!(VerificationType::binary_numeric(&Int32, &Int64), None);
    }

    #[test]
    fn test_reference_widening() {
        let (types, animal, dog) = hierarchy();
        let dog_ref = VerificationType::object(dog);
        let animal_ref = VerificationType::object(animal);
        assert!(dog_ref.is_assignable_to(&animal_ref, &types));
        assert!(!animal_ref.is_assignable_to(&dog_ref, &types));
        assert!(VerificationType::Null.is_assignable_to(&animal_ref, &types));
        assert!(!VerificationType::Null.is_assignable_to(&VerificationType::Int32, &types));
    }

    #[test]
    fn test_disjunctive_classes() {
        let types = ClassHierarchy::new();
        assert!(TypeClass::Int32OrNativeInt.accepts(&VerificationType::NativeInt, &types));
        assert!(!TypeClass::Int32OrNativeInt.accepts(&VerificationType::Int64, &types));
        assert!(TypeClass::Float.accepts(&VerificationType::Float32, &types));
        assert!(!TypeClass::Float.accepts(&VerificationType::Int32, &types));
        assert!(TypeClass::Condition.accepts(&VerificationType::Null, &types));
    }

    #[test]
    fn test_class_display_names() {
        assert_eq!(TypeClass::Int32.with_article(), "an int32");
        assert_eq!(TypeClass::Float.with_article(), "a double or float");
        let animal = VerificationType::Object(TypeRef::class("Animal"));
        assert_eq!(TypeClass::AssignableTo(animal).with_article(), "an Animal");
        assert_eq!(
            VerificationType::managed_ptr(VerificationType::Int32).to_string(),
            "int32&"
        );
    }
}
