mod common;

use anyhow::Result;
use common::*;
use pretty_assertions::assert_eq;
use rstest::rstest;
use stackil_bytecode::core::metadata::{CallSignature, CallingConvention, MethodRef, TypeRef};
use stackil_bytecode::core::opcodes::{InstructionFlags, Opcode};
use stackil_bytecode::core::types::VerificationType;
use stackil_emit::{
    CallKind, Emitter, EmitterConfig, FinalizedStream, LabelPolicy, OptimizerConfig, Program,
    TailCallPolicy,
};

/// `ldc.i4 1; brtrue L; nop * filler; L: ret`
fn skip_over(filler: usize) -> Result<Emitter> {
    let mut il = void_method();
    let target = il.define_named_label("L");
    il.ldc_i4(1)?.brtrue(target)?;
    for _ in 0..filler {
        il.nop()?;
    }
    il.mark_label(target)?.ret()?;
    Ok(il)
}

#[rstest]
#[case(0, Opcode::BRTRUE_S)]
#[case(1, Opcode::BRTRUE_S)]
#[case(127, Opcode::BRTRUE_S)]
#[case(128, Opcode::BRTRUE)]
#[case(300, Opcode::BRTRUE)]
fn test_shortening_boundary(#[case] filler: usize, #[case] expected: Opcode) -> Result<()> {
    let stream = skip_over(filler)?.finalize()?;
    let branch = &stream.instructions[1];
    assert_eq!(branch.opcode, expected);

    let target = branch.targets()[0];
    assert_eq!(target.displacement, filler as i32);
    assert_eq!(target.index, filler + 2);
    assert_eq!(
        stream.instructions[target.index].offset,
        branch.offset + branch.size + filler as u32
    );
    Ok(())
}

#[test]
fn test_shortening_disabled_keeps_long_forms() -> Result<()> {
    let config = EmitterConfig::default().optimizer(OptimizerConfig::default().shorten_branches(false));
    let mut il = emitter_with([], None, config);
    let target = il.define_label();
    il.ldc_i4(1)?.brtrue(target)?.mark_label(target)?.ret()?;

    let stream = il.finalize()?;
    assert_eq!(stream.instructions[1].opcode, Opcode::BRTRUE);
    assert_eq!(stream.instructions[1].size, 5);
    Ok(())
}

/// The outer branch fits a signed byte only once the inner one is short.
#[test]
fn test_shortening_cascades() -> Result<()> {
    let mut il = void_method();
    let outer = il.define_named_label("outer");
    let inner = il.define_named_label("inner");
    il.ldc_i4(1)?.brtrue(outer)?;
    il.ldc_i4(1)?.brtrue(inner)?;
    for _ in 0..119 {
        il.nop()?;
    }
    il.mark_label(outer)?.mark_label(inner)?.ret()?;

    let mut program = il.verify()?;
    let report = program.optimize(&OptimizerConfig::default());
    assert_eq!(report.short_branches, 2);
    assert!(report.shortening_iterations >= 2);

    let stream = program.resolve();
    assert_eq!(stream.instructions[1].opcode, Opcode::BRTRUE_S);
    assert_eq!(stream.instructions[3].opcode, Opcode::BRTRUE_S);
    assert_eq!(stream.instructions[1].targets()[0].displacement, 5 + 2 + 119);
    Ok(())
}

#[test]
fn test_backward_branch_is_shortened() -> Result<()> {
    let config = EmitterConfig::default().label_policy(LabelPolicy::Lenient);
    let mut il = emitter_with([], None, config);
    let top = il.define_label();
    il.ldc_i4(3)?;
    il.mark_label(top)?;
    il.ldc_i4(1)?.sub()?.dup()?.brtrue(top)?.pop()?.ret()?;

    let stream = il.finalize()?;
    let branch = &stream.instructions[4];
    assert_eq!(branch.opcode, Opcode::BRTRUE_S);
    // ldc.i4 (5) + sub + dup + brtrue.s (2) back to the loop head
    assert_eq!(branch.targets()[0].displacement, -9);
    Ok(())
}

/// `ldarg.0; castclass Animal; callvirt Animal::Legs; ret` on a `Dog` argument
fn legs_of(argument: TypeRef, config: OptimizerConfig) -> Result<FinalizedStream> {
    let mut il = emitter_with(
        [VerificationType::Object(argument)],
        Some(VerificationType::Int32),
        EmitterConfig::default().optimizer(config),
    );
    il.ldarg(0)?.castclass(&animal())?.callvirt(&legs())?.ret()?;
    Ok(il.finalize()?)
}

fn has_cast(stream: &FinalizedStream) -> bool {
    stream
        .instructions
        .iter()
        .any(|instruction| instruction.opcode == Opcode::CASTCLASS)
}

#[test]
fn test_redundant_cast_is_elided() -> Result<()> {
    let stream = legs_of(dog(), OptimizerConfig::default())?;
    assert!(!has_cast(&stream));
    assert_eq!(stream.len(), 3);
    // Source positions still refer to the verified stream.
    assert_eq!(stream.instructions[1].source, 2);
    Ok(())
}

#[test]
fn test_cast_kept_when_elision_disabled() -> Result<()> {
    let stream = legs_of(dog(), OptimizerConfig::default().elide_casts(false))?;
    assert!(has_cast(&stream));
    assert_eq!(stream.len(), 4);
    Ok(())
}

#[test]
fn test_narrowing_cast_is_kept() -> Result<()> {
    let mut il = emitter(
        [VerificationType::Object(animal())],
        Some(VerificationType::Object(dog())),
    );
    il.ldarg(0)?.castclass(&dog())?.ret()?;
    assert!(has_cast(&il.finalize()?));
    Ok(())
}

#[test]
fn test_null_cast_is_elided() -> Result<()> {
    let mut il = emitter([], Some(VerificationType::Object(dog())));
    il.ldnull()?.castclass(&dog())?.ret()?;
    assert!(!has_cast(&il.finalize()?));
    Ok(())
}

#[test]
fn test_disagreeing_merge_forgets_known_type() -> Result<()> {
    let mut il = emitter(
        [
            VerificationType::Object(dog()),
            VerificationType::Object(cat()),
            VerificationType::Int32,
        ],
        Some(VerificationType::Int32),
    );
    let other = il.define_named_label("other");
    let join = il.define_named_label("join");
    il.ldarg(2)?.brfalse(other)?;
    il.ldarg(0)?.castclass(&animal())?.br(join)?;
    il.mark_label(other)?;
    il.ldarg(1)?.castclass(&animal())?;
    il.mark_label(join)?;
    il.castclass(&animal())?.callvirt(&legs())?.ret()?;

    let mut program = il.verify()?;
    let report = program.optimize(&OptimizerConfig::default());
    assert_eq!(report.elided_casts, 2);
    let elided: Vec<usize> = elided_positions(&program);
    assert_eq!(elided, vec![3, 6]);
    Ok(())
}

#[test]
fn test_dup_carries_known_type() -> Result<()> {
    let mut il = emitter(
        [VerificationType::Object(dog())],
        Some(VerificationType::Int32),
    );
    il.ldarg(0)?.dup()?.pop()?.castclass(&animal())?.callvirt(&legs())?.ret()?;
    let mut program = il.verify()?;
    program.optimize(&OptimizerConfig::default());
    assert_eq!(elided_positions(&program), vec![3]);
    Ok(())
}

fn elided_positions(program: &Program) -> Vec<usize> {
    program
        .entries()
        .iter()
        .enumerate()
        .filter(|(_, entry)| entry.is(InstructionFlags::ELIDED))
        .map(|(index, _)| index)
        .collect()
}

fn twice() -> MethodRef {
    MethodRef::static_method(
        TypeRef::class("Math"),
        "Twice",
        [VerificationType::Int32],
        Some(VerificationType::Int32),
    )
}

fn tail_marked(stream: &FinalizedStream) -> Vec<usize> {
    stream
        .instructions
        .iter()
        .enumerate()
        .filter(|(_, instruction)| instruction.is_tail_call())
        .map(|(index, _)| index)
        .collect()
}

#[test]
fn test_call_before_ret_is_tail_call() -> Result<()> {
    let mut il = emitter([VerificationType::Int32], Some(VerificationType::Int32));
    il.ldarg(0)?.call(&twice())?.nop()?.ret()?;

    let stream = il.finalize()?;
    assert_eq!(tail_marked(&stream), vec![1]);
    // The `tail.` prefix is part of the call's encoding.
    assert_eq!(stream.instructions[1].size, 5 + 2);
    Ok(())
}

#[test]
fn test_call_with_caller_values_below_is_not_tail_call() -> Result<()> {
    let log = MethodRef::static_method(
        TypeRef::class("Console"),
        "Log",
        [VerificationType::Int32],
        None,
    );
    let mut il = emitter([VerificationType::Int32], Some(VerificationType::Int32));
    il.ldc_i4(5)?.ldarg(0)?.call(&log)?.ret()?;
    assert!(tail_marked(&il.finalize()?).is_empty());
    Ok(())
}

#[test]
fn test_call_followed_by_work_is_not_tail_call() -> Result<()> {
    let mut il = emitter([VerificationType::Int32], Some(VerificationType::Int32));
    il.ldarg(0)?.call(&twice())?.ldc_i4(1)?.add()?.ret()?;
    assert!(tail_marked(&il.finalize()?).is_empty());
    Ok(())
}

#[rstest]
#[case::direct_denied(TailCallPolicy::default().deny(CallKind::Direct), false)]
#[case::default_policy(TailCallPolicy::default(), true)]
fn test_tail_call_policy(#[case] policy: TailCallPolicy, #[case] marked: bool) -> Result<()> {
    let config = EmitterConfig::default().optimizer(OptimizerConfig::default().tail_calls(policy));
    let mut il = emitter_with([VerificationType::Int32], Some(VerificationType::Int32), config);
    il.ldarg(0)?.call(&twice())?.ret()?;
    assert_eq!(!tail_marked(&il.finalize()?).is_empty(), marked);
    Ok(())
}

#[test]
fn test_vararg_and_indirect_calls_are_denied_by_default() -> Result<()> {
    let vararg = twice().with_convention(CallingConvention::VarArgs);
    let mut il = emitter([VerificationType::Int32], Some(VerificationType::Int32));
    il.ldarg(0)?.call(&vararg)?.ret()?;
    assert!(tail_marked(&il.finalize()?).is_empty());

    let mut il = emitter([VerificationType::Int32], Some(VerificationType::Int32));
    il.ldarg(0)?
        .ldftn(&twice())?
        .calli(CallSignature::new([VerificationType::Int32], Some(VerificationType::Int32)))?
        .ret()?;
    assert!(tail_marked(&il.finalize()?).is_empty());
    Ok(())
}

#[test]
fn test_tail_calls_can_be_disabled() -> Result<()> {
    let config = EmitterConfig::default().optimizer(OptimizerConfig::default().mark_tail_calls(false));
    let mut il = emitter_with([VerificationType::Int32], Some(VerificationType::Int32), config);
    il.ldarg(0)?.call(&twice())?.ret()?;
    assert!(tail_marked(&il.finalize()?).is_empty());
    Ok(())
}

/// Exercises every pass: a loop with a backward branch, a cast that
/// disappears, and a tail call.
fn everything() -> Result<Program> {
    let mut il = emitter(
        [VerificationType::Object(dog()), VerificationType::Int32],
        Some(VerificationType::Int32),
    );
    let count = il.declare_named_local(VerificationType::Int32, "count")?;
    let top = il.define_named_label("top");
    let done = il.define_named_label("done");
    il.ldarg(1)?.stloc(count)?;
    il.mark_label(top)?;
    il.ldloc(count)?.brfalse(done)?;
    il.ldloc(count)?.ldc_i4(1)?.sub()?.stloc(count)?.br(top)?;
    il.mark_label(done)?;
    il.ldarg(0)?.castclass(&animal())?.callvirt(&legs())?.ret()?;
    Ok(il.verify()?)
}

#[test]
fn test_optimizing_twice_is_idempotent() -> Result<()> {
    let mut program = everything()?;
    let config = OptimizerConfig::default();

    let first_report = program.optimize(&config);
    let first = program.resolve();
    let second_report = program.optimize(&config);
    let second = program.resolve();

    assert_eq!(first, second);
    assert_eq!(first_report.elided_casts, second_report.elided_casts);
    assert_eq!(first_report.tail_calls, second_report.tail_calls);
    assert_eq!(first_report.short_branches, second_report.short_branches);
    assert_eq!(first_report.elided_casts, 1);
    assert_eq!(first_report.tail_calls, 1);
    Ok(())
}

#[test]
fn test_disabled_optimizer_resets_flags() -> Result<()> {
    let mut program = everything()?;
    let unoptimized = program.resolve();
    program.optimize(&OptimizerConfig::default());
    program.optimize(&OptimizerConfig::disabled());
    assert_eq!(program.resolve(), unoptimized);
    assert_eq!(program.kept_len(), program.len());
    Ok(())
}
