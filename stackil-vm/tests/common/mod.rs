use anyhow::Result;
use stackil_bytecode::core::metadata::{
    ClassHierarchy, FieldRef, MethodRef, MethodSignature, TypeProvider, TypeRef,
};
use stackil_bytecode::core::types::VerificationType;
use stackil_emit::{Emitter, EmitterConfig};
use stackil_vm::{Loader, NativeHost, Value, VM};
use std::sync::Arc;

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

/// `Exception <- ArgumentException`
#[allow(dead_code)]
pub fn argument_exception() -> TypeRef {
    TypeRef::class("ArgumentException")
}

#[allow(dead_code)]
pub fn types() -> Arc<dyn TypeProvider> {
    let hierarchy = ClassHierarchy::new()
        .with(animal(), [])
        .and_then(|h| h.with(dog(), [animal()]))
        .and_then(|h| h.with(cat(), [animal()]))
        .and_then(|h| h.with(TypeRef::exception(), []))
        .and_then(|h| h.with(argument_exception(), [TypeRef::exception()]))
        .expect("hierarchy is acyclic");
    Arc::new(hierarchy)
}

/// `int32 Animal::Legs()`
#[allow(dead_code)]
pub fn legs() -> MethodRef {
    MethodRef::virtual_method(animal(), "Legs", [], Some(VerificationType::Int32))
}

/// `static int32 Counter.Hits`
#[allow(dead_code)]
pub fn hits() -> FieldRef {
    FieldRef::static_field(TypeRef::class("Counter"), "Hits", VerificationType::Int32)
}

/// Host where animals answer `Legs` by species
#[allow(dead_code)]
pub fn host() -> NativeHost {
    NativeHost::new(types())
        .register("Animal", "Legs", |_, _| Ok(Some(Value::Int32(0))))
        .register("Dog", "Legs", |_, _| Ok(Some(Value::Int32(4))))
        .register("Cat", "Legs", |_, _| Ok(Some(Value::Int32(4))))
}

#[allow(dead_code)]
pub fn emitter(
    params: impl IntoIterator<Item = VerificationType>,
    ret: Option<VerificationType>,
) -> Emitter {
    Emitter::new(MethodSignature::new(params, ret), types())
}

#[allow(dead_code)]
pub fn emitter_with(
    params: impl IntoIterator<Item = VerificationType>,
    ret: Option<VerificationType>,
    config: EmitterConfig,
) -> Emitter {
    Emitter::with_config(MethodSignature::new(params, ret), types(), config)
}

/// Finalize `il` through the loader and run it on a fresh VM
#[allow(dead_code)]
pub fn run(il: Emitter, args: Vec<Value>) -> Result<Option<Value>> {
    run_on(&mut VM::new(host()), il, args)
}

#[allow(dead_code)]
pub fn run_on(vm: &mut VM<NativeHost>, il: Emitter, args: Vec<Value>) -> Result<Option<Value>> {
    let executable = il.finalize_into(&mut Loader)?;
    vm.execute(&executable, args)
}
