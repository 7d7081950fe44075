use stackil_bytecode::core::metadata::{ClassHierarchy, MethodRef, MethodSignature, TypeProvider, TypeRef};
use stackil_bytecode::core::types::VerificationType;
use stackil_emit::{Emitter, EmitterConfig};
use std::sync::Arc;

/// `Animal <- Dog`, `Animal <- Cat`
#[allow(dead_code)]
pub fn animals() -> Arc<dyn TypeProvider> {
    let hierarchy = ClassHierarchy::new()
        .with(animal(), [])
        .and_then(|h| h.with(dog(), [animal()]))
        .and_then(|h| h.with(cat(), [animal()]))
        .expect("hierarchy is acyclic");
    Arc::new(hierarchy)
}

#[allow(dead_code)]
pub fn animal() -> TypeRef {
    TypeRef::class("Animal")
}

#[allow(dead_code)]
pub fn dog() -> TypeRef {
    TypeRef::class("Dog")
}

#[allow(dead_code)]
pub fn cat() -> TypeRef {
    TypeRef::class("Cat")
}

/// `int32 Animal::Legs()`
#[allow(dead_code)]
pub fn legs() -> MethodRef {
    MethodRef::virtual_method(animal(), "Legs", [], Some(VerificationType::Int32))
}

/// Emitter for a static method with the given parameters and return type
#[allow(dead_code)]
pub fn emitter(
    params: impl IntoIterator<Item = VerificationType>,
    ret: Option<VerificationType>,
) -> Emitter {
    Emitter::new(MethodSignature::new(params, ret), animals())
}

#[allow(dead_code)]
pub fn emitter_with(
    params: impl IntoIterator<Item = VerificationType>,
    ret: Option<VerificationType>,
    config: EmitterConfig,
) -> Emitter {
    Emitter::with_config(MethodSignature::new(params, ret), animals(), config)
}

/// Zero-argument emitter returning int32
#[allow(dead_code)]
pub fn int_method() -> Emitter {
    emitter([], Some(VerificationType::Int32))
}

/// Zero-argument emitter returning nothing
#[allow(dead_code)]
pub fn void_method() -> Emitter {
    emitter([], None)
}
