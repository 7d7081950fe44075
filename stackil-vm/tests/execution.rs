mod common;

use anyhow::Result;
use common::*;
use pretty_assertions::assert_eq;
use rstest::rstest;
use stackil_bytecode::core::metadata::{FieldRef, MethodRef, TypeRef};
use stackil_bytecode::core::opcodes::Opcode;
use stackil_bytecode::core::types::VerificationType;
use stackil_emit::{Emitter, EmitterConfig, OptimizerConfig};
use stackil_vm::{ExecError, Executable, NativeHost, Value, VM};

fn int_method() -> Emitter {
    emitter([], Some(VerificationType::Int32))
}

fn exec_error(err: &anyhow::Error) -> Option<&ExecError> {
    err.downcast_ref::<ExecError>()
}

fn new_argument_exception() -> MethodRef {
    MethodRef::constructor(argument_exception(), [])
}

fn bump_hits(il: &mut Emitter, by: i32) -> Result<()> {
    il.ldsfld(&hits())?.ldc_i4(by)?.add()?.stsfld(&hits())?;
    Ok(())
}

#[test]
fn test_one_plus_two() -> Result<()> {
    let mut il = int_method();
    il.ldc_i4(1)?.ldc_i4(2)?.add()?.ret()?;
    assert_eq!(run(il, vec![])?, Some(Value::Int32(3)));
    Ok(())
}

#[rstest]
#[case(0, 0)]
#[case(1, 1)]
#[case(10, 55)]
fn test_loop_sums_to_argument(#[case] n: i32, #[case] expected: i32) -> Result<()> {
    let mut il = emitter([VerificationType::Int32], Some(VerificationType::Int32));
    let total = il.declare_named_local(VerificationType::Int32, "total")?;
    let i = il.declare_named_local(VerificationType::Int32, "i")?;
    let check = il.define_named_label("check");
    let done = il.define_named_label("done");

    il.ldc_i4(0)?.stloc(total)?.ldc_i4(1)?.stloc(i)?;
    il.mark_label(check)?;
    il.ldloc(i)?.ldarg(0)?.bgt(done)?;
    il.ldloc(total)?.ldloc(i)?.add()?.stloc(total)?;
    il.ldloc(i)?.ldc_i4(1)?.add()?.stloc(i)?;
    il.br(check)?;
    il.mark_label(done)?.ldloc(total)?.ret()?;

    assert_eq!(run(il, vec![Value::Int32(n)])?, Some(Value::Int32(expected)));
    Ok(())
}

/// `((Animal) new Dog()).Legs()`
fn dog_legs(elide: bool) -> Result<Emitter> {
    let config = EmitterConfig::default().optimizer(OptimizerConfig::default().elide_casts(elide));
    let mut il = emitter_with([], Some(VerificationType::Int32), config);
    il.newobj(&MethodRef::constructor(dog(), []))?
        .castclass(&animal())?
        .callvirt(&legs())?
        .ret()?;
    Ok(il)
}

#[rstest]
#[case(true, false)]
#[case(false, true)]
fn test_cast_elision_keeps_behaviour(#[case] elide: bool, #[case] has_cast: bool) -> Result<()> {
    let stream = dog_legs(elide)?.finalize()?;
    assert_eq!(
        stream
            .instructions
            .iter()
            .any(|instruction| instruction.opcode == Opcode::CASTCLASS),
        has_cast
    );

    let mut vm = VM::new(host());
    let result = vm.execute(&Executable::load(stream)?, vec![])?;
    assert_eq!(result, Some(Value::Int32(4)));
    assert_eq!(vm.host().calls(), &["Dog::Legs".to_string()]);
    Ok(())
}

#[test]
fn test_failed_downcast_aborts() -> Result<()> {
    let mut il = int_method();
    il.newobj(&MethodRef::constructor(cat(), []))?
        .castclass(&dog())?
        .callvirt(&legs())?
        .ret()?;

    let err = run(il, vec![]).unwrap_err();
    match exec_error(&err) {
        Some(ExecError::InvalidCast { from, to }) => {
            assert_eq!((from.as_str(), to.as_str()), ("Cat", "Dog"));
        }
        other => panic!("expected an invalid cast, got {other:?}"),
    }
    Ok(())
}

#[test]
fn test_isinst_yields_null_on_mismatch() -> Result<()> {
    let mut il = int_method();
    let not_dog = il.define_label();
    il.newobj(&MethodRef::constructor(cat(), []))?
        .isinst(&dog())?
        .brfalse(not_dog)?;
    il.ldc_i4(1)?.ret()?;
    il.mark_label(not_dog)?.ldc_i4(0)?.ret()?;
    assert_eq!(run(il, vec![])?, Some(Value::Int32(0)));
    Ok(())
}

/// `arg0 ? 1 : 0` with `filler` nops between the branch and its target
fn choose(filler: usize, config: EmitterConfig) -> Result<Emitter> {
    let mut il = emitter_with([VerificationType::Int32], Some(VerificationType::Int32), config);
    let yes = il.define_named_label("yes");
    il.ldarg(0)?.brtrue(yes)?;
    for _ in 0..filler {
        il.nop()?;
    }
    il.ldc_i4(0)?.ret()?;
    il.mark_label(yes)?.ldc_i4(1)?.ret()?;
    Ok(il)
}

#[rstest]
#[case(10, true, Opcode::BRTRUE_S)]
#[case(10, false, Opcode::BRTRUE)]
#[case(200, true, Opcode::BRTRUE)]
fn test_branch_form_does_not_change_result(
    #[case] filler: usize,
    #[case] shorten: bool,
    #[case] form: Opcode,
) -> Result<()> {
    let config =
        EmitterConfig::default().optimizer(OptimizerConfig::default().shorten_branches(shorten));
    let stream = choose(filler, config)?.finalize()?;
    assert_eq!(stream.instructions[1].opcode, form);

    let executable = Executable::load(stream)?;
    let mut vm = VM::new(host());
    assert_eq!(vm.execute(&executable, vec![Value::Int32(1)])?, Some(Value::Int32(1)));
    assert_eq!(vm.execute(&executable, vec![Value::Int32(0)])?, Some(Value::Int32(0)));
    Ok(())
}

#[rstest]
#[case(0, 10)]
#[case(1, 20)]
#[case(2, 30)]
#[case(3, -1)]
#[case(-1, -1)]
fn test_switch_dispatch(#[case] selector: i32, #[case] expected: i32) -> Result<()> {
    let mut il = emitter([VerificationType::Int32], Some(VerificationType::Int32));
    let arms = [il.define_label(), il.define_label(), il.define_label()];
    il.ldarg(0)?.switch(&arms)?;
    il.ldc_i4(-1)?.ret()?;
    for (arm, value) in arms.into_iter().zip([10, 20, 30]) {
        il.mark_label(arm)?.ldc_i4(value)?.ret()?;
    }
    assert_eq!(run(il, vec![Value::Int32(selector)])?, Some(Value::Int32(expected)));
    Ok(())
}

#[rstest]
#[case(TypeRef::exception(), Some(42))]
#[case(argument_exception(), Some(42))]
#[case(animal(), None)]
fn test_catch_filters_by_subtype(#[case] filter: TypeRef, #[case] expected: Option<i32>) -> Result<()> {
    let mut il = int_method();
    let result = il.declare_local(VerificationType::Int32)?;
    let block = il.begin_exception_block()?;
    il.newobj(&new_argument_exception())?.throw()?;
    il.begin_catch_block(block, &filter)?;
    il.pop()?.ldc_i4(42)?.stloc(result)?;
    il.end_catch_block(block)?;
    il.end_exception_block(block)?;
    il.ldloc(result)?.ret()?;

    match (run(il, vec![]), expected) {
        (Ok(value), Some(expected)) => assert_eq!(value, Some(Value::Int32(expected))),
        (Err(err), None) => {
            assert_eq!(err.to_string(), "unhandled exception of type ArgumentException");
        }
        (outcome, expected) => panic!("expected {expected:?}, got {outcome:?}"),
    }
    Ok(())
}

#[test]
fn test_finally_runs_on_leave() -> Result<()> {
    let mut il = int_method();
    let block = il.begin_exception_block()?;
    il.nop()?;
    il.begin_finally_block(block)?;
    bump_hits(&mut il, 1)?;
    il.end_finally_block(block)?;
    il.end_exception_block(block)?;
    il.ldsfld(&hits())?.ret()?;

    let mut vm = VM::new(host());
    assert_eq!(run_on(&mut vm, il, vec![])?, Some(Value::Int32(1)));
    assert_eq!(vm.static_field("Counter", "Hits"), Some(&Value::Int32(1)));
    Ok(())
}

#[test]
fn test_throw_runs_inner_finally_before_outer_catch() -> Result<()> {
    let mut il = int_method();
    let outer = il.begin_exception_block()?;
    let inner = il.begin_exception_block()?;
    il.newobj(&new_argument_exception())?.throw()?;
    il.begin_finally_block(inner)?;
    bump_hits(&mut il, 1)?;
    il.end_finally_block(inner)?;
    il.end_exception_block(inner)?;
    assert!(!il.is_reachable());

    // hits = hits * 10 only yields 10 if the finally ran first
    il.begin_catch_block(outer, &TypeRef::exception())?;
    il.pop()?;
    il.ldsfld(&hits())?.ldc_i4(10)?.mul()?.stsfld(&hits())?;
    il.end_catch_block(outer)?;
    il.end_exception_block(outer)?;
    il.ldsfld(&hits())?.ret()?;

    assert_eq!(run(il, vec![])?, Some(Value::Int32(10)));
    Ok(())
}

#[test]
fn test_rethrow_reaches_outer_handler() -> Result<()> {
    let mut il = int_method();
    let result = il.declare_local(VerificationType::Int32)?;
    let outer = il.begin_exception_block()?;
    let inner = il.begin_exception_block()?;
    il.newobj(&new_argument_exception())?.throw()?;
    il.begin_catch_block(inner, &TypeRef::exception())?;
    il.pop()?.rethrow()?;
    il.end_catch_block(inner)?;
    il.end_exception_block(inner)?;

    il.begin_catch_block(outer, &argument_exception())?;
    il.pop()?.ldc_i4(7)?.stloc(result)?;
    il.end_catch_block(outer)?;
    il.end_exception_block(outer)?;
    il.ldloc(result)?.ret()?;

    assert_eq!(run(il, vec![])?, Some(Value::Int32(7)));
    Ok(())
}

#[test]
fn test_array_store_load_and_length() -> Result<()> {
    let int32 = VerificationType::Int32;
    let mut il = int_method();
    let items = il.declare_named_local(
        VerificationType::Object(TypeRef::array_of(int32.clone())),
        "items",
    )?;
    il.ldc_i4(3)?.newarr(int32.clone())?.stloc(items)?;
    il.ldloc(items)?.ldc_i4(0)?.ldc_i4(5)?.stelem(int32.clone())?;
    il.ldloc(items)?.ldc_i4(2)?.ldc_i4(6)?.stelem(int32.clone())?;
    il.ldloc(items)?.ldc_i4(0)?.ldelem(int32.clone())?;
    il.ldloc(items)?.ldc_i4(2)?.ldelem(int32.clone())?.add()?;
    il.ldloc(items)?.ldlen()?.conv_i4()?.add()?;
    il.ret()?;

    assert_eq!(run(il, vec![])?, Some(Value::Int32(14)));
    Ok(())
}

#[test]
fn test_array_index_out_of_range() -> Result<()> {
    let mut il = int_method();
    il.ldc_i4(2)?
        .newarr(VerificationType::Int32)?
        .ldc_i4(2)?
        .ldelem(VerificationType::Int32)?
        .ret()?;

    let err = run(il, vec![]).unwrap_err();
    assert!(matches!(
        exec_error(&err),
        Some(ExecError::IndexOutOfRange { index: 2, len: 2, .. })
    ));
    Ok(())
}

#[test]
fn test_value_type_fields_through_address() -> Result<()> {
    let point = TypeRef::value_type("Point");
    let x = FieldRef::instance(point.clone(), "X", VerificationType::Int32);
    let mut il = int_method();
    let p = il.declare_named_local(VerificationType::Value(point.clone()), "p")?;
    il.ldloca(p)?.initobj(&point)?;
    il.ldloca(p)?.ldc_i4(3)?.stfld(&x)?;
    il.ldloca(p)?.ldfld(&x)?.ret()?;

    assert_eq!(run(il, vec![])?, Some(Value::Int32(3)));
    Ok(())
}

#[test]
fn test_division_by_zero_aborts() -> Result<()> {
    let mut il = emitter([VerificationType::Int32], Some(VerificationType::Int32));
    il.ldc_i4(1)?.ldarg(0)?.div()?.ret()?;

    let err = run(il, vec![Value::Int32(0)]).unwrap_err();
    assert!(matches!(exec_error(&err), Some(ExecError::DivideByZero { .. })));
    Ok(())
}

#[test]
fn test_tail_marked_call_runs_through_host() -> Result<()> {
    let twice = MethodRef::static_method(
        TypeRef::class("Math"),
        "Twice",
        [VerificationType::Int32],
        Some(VerificationType::Int32),
    );
    let mut il = emitter([VerificationType::Int32], Some(VerificationType::Int32));
    il.ldarg(0)?.call(&twice)?.ret()?;
    let stream = il.finalize()?;
    assert!(stream.instructions[1].is_tail_call());

    let host = host().register("Math", "Twice", |_, args| {
        let n = args.first().and_then(Value::as_int).unwrap_or_default();
        Ok(Some(Value::Int32((n * 2) as i32)))
    });
    let mut vm = VM::new(host);
    let result = vm.execute(&Executable::load(stream)?, vec![Value::Int32(21)])?;
    assert_eq!(result, Some(Value::Int32(42)));
    assert_eq!(vm.host().tail_calls(), 1);
    Ok(())
}

#[test]
fn test_unregistered_method_fails_with_context() -> Result<()> {
    let mut il = int_method();
    il.newobj(&MethodRef::constructor(dog(), []))?
        .callvirt(&legs())?
        .ret()?;

    let mut vm = VM::new(NativeHost::new(types()));
    let err = run_on(&mut vm, il, vec![]).unwrap_err();
    assert!(err.to_string().starts_with("call to "), "{err}");
    Ok(())
}

#[test]
fn test_fuel_stops_infinite_loop() -> Result<()> {
    let mut il = emitter([], None);
    let top = il.define_named_label("top");
    il.mark_label(top)?.br(top)?;

    let mut vm = VM::new(host()).with_fuel(100);
    let err = run_on(&mut vm, il, vec![]).unwrap_err();
    assert!(matches!(exec_error(&err), Some(ExecError::OutOfFuel(100))));
    assert_eq!(vm.steps(), 100);
    Ok(())
}

#[test]
fn test_argument_count_is_checked() -> Result<()> {
    let mut il = int_method();
    il.ldc_i4(1)?.ret()?;

    let err = run(il, vec![Value::Int32(1)]).unwrap_err();
    assert!(matches!(
        exec_error(&err),
        Some(ExecError::ArgumentCount {
            expected: 0,
            found: 1
        })
    ));
    Ok(())
}
