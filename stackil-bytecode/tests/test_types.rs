use rstest::rstest;
use stackil_bytecode::core::types::*;
use stackil_bytecode::core::metadata::{ClassHierarchy, TypeRef};

fn animals() -> ClassHierarchy {
    ClassHierarchy::new()
        .with(TypeRef::class("Animal"), [])
        .and_then(|h| h.with(TypeRef::class("Dog"), [TypeRef::class("Animal")]))
        .unwrap()
}

#[rstest]
#[case(TypeClass::Int32, VerificationType::Int32, true)]
#[case(TypeClass::Int32, VerificationType::NativeInt, false)]
#[case(TypeClass::Int32OrNativeInt, VerificationType::NativeInt, true)]
#[case(TypeClass::Integer, VerificationType::Int64, true)]
#[case(TypeClass::Integer, VerificationType::Float64, false)]
#[case(TypeClass::Float, VerificationType::Float64, true)]
#[case(TypeClass::Numeric, VerificationType::Null, false)]
#[case(TypeClass::Reference, VerificationType::Null, true)]
#[case(TypeClass::Reference, VerificationType::Object(TypeRef::string()), true)]
#[case(TypeClass::Pointer, VerificationType::managed_ptr(VerificationType::Int32), true)]
#[case(TypeClass::Pointer, VerificationType::Object(TypeRef::string()), false)]
#[case(
    TypeClass::Array,
    VerificationType::Object(TypeRef::array_of(VerificationType::Int32)),
    true
)]
#[case(TypeClass::Array, VerificationType::Object(TypeRef::object()), false)]
fn test_type_class_accepts(
    #[case] class: TypeClass,
    #[case] actual: VerificationType,
    #[case] expected: bool,
) {
    assert_eq!(class.accepts(&actual, &animals()), expected);
}

#[rstest]
#[case("Dog", "Animal", true)]
#[case("Animal", "Dog", false)]
#[case("Dog", "System.Object", true)]
#[case("Animal", "Animal", true)]
fn test_reference_assignability(#[case] from: &str, #[case] to: &str, #[case] expected: bool) {
    let from = VerificationType::Object(TypeRef::class(from));
    let to = VerificationType::Object(TypeRef::class(to));
    assert_eq!(from.is_assignable_to(&to, &animals()), expected);
}

#[test]
fn test_floats_never_merge_across_width() {
    let types = animals();
    assert!(!VerificationType::Float32.is_assignable_to(&VerificationType::Float64, &types));
    assert!(!VerificationType::Float64.is_assignable_to(&VerificationType::Float32, &types));
    assert!(VerificationType::Int32.is_assignable_to(&VerificationType::NativeInt, &types));
}

#[test]
fn test_assignable_to_class() {
    let types = animals();
    let animal = VerificationType::Object(TypeRef::class("Animal"));
    let class = TypeClass::AssignableTo(animal.clone());
    assert!(class.accepts(&VerificationType::Object(TypeRef::class("Dog")), &types));
    assert!(!class.accepts(&VerificationType::Int32, &types));
    assert_eq!(class.with_article(), "an Animal");
}
