mod common;

use anyhow::Result;
use common::*;
use pretty_assertions::assert_eq;
use stackil_bytecode::core::opcodes::Opcode;
use stackil_bytecode::core::types::VerificationType;
use stackil_emit::{EmitError, FinalizedStream, Operand, TargetBackend};
use thiserror::Error;

/// Records what it was handed and returns the code size
#[derive(Default)]
struct Recorder {
    calls: usize,
    opcodes: Vec<Opcode>,
}

impl TargetBackend for Recorder {
    type Output = u32;
    type Error = std::convert::Infallible;

    fn emit(&mut self, stream: &FinalizedStream) -> Result<u32, Self::Error> {
        self.calls += 1;
        self.opcodes = stream.instructions.iter().map(|i| i.opcode).collect();
        Ok(stream.code_size)
    }
}

#[derive(Debug, Error)]
#[error("stream too large: {0} bytes")]
struct TooLarge(u32);

struct Limited(u32);

impl TargetBackend for Limited {
    type Output = ();
    type Error = TooLarge;

    fn emit(&mut self, stream: &FinalizedStream) -> Result<(), TooLarge> {
        if stream.code_size > self.0 {
            return Err(TooLarge(stream.code_size));
        }
        Ok(())
    }
}

/// `1 + 2`
fn one_plus_two() -> stackil_emit::Emitter {
    let mut il = int_method();
    il.ldc_i4(1)
        .and_then(|il| il.ldc_i4(2))
        .and_then(|il| il.add())
        .and_then(|il| il.ret())
        .expect("valid sequence");
    il
}

#[test]
fn test_backend_receives_finalized_stream() -> Result<()> {
    let mut backend = Recorder::default();
    let size = one_plus_two().finalize_into(&mut backend)?;

    assert_eq!(backend.calls, 1);
    assert_eq!(
        backend.opcodes,
        vec![Opcode::LDC_I4, Opcode::LDC_I4, Opcode::ADD, Opcode::RET]
    );
    assert_eq!(size, 5 + 5 + 1 + 1);
    Ok(())
}

#[test]
fn test_backend_failure_is_wrapped() {
    let err = one_plus_two().finalize_into(&mut Limited(4)).unwrap_err();
    assert!(matches!(err, EmitError::Backend(_)));
    assert_eq!(err.to_string(), "target backend failed: stream too large: 12 bytes");
}

#[test]
fn test_backend_not_called_for_invalid_stream() {
    let mut il = int_method();
    il.ldc_i4(1).expect("push");

    let mut backend = Recorder::default();
    let err = il.finalize_into(&mut backend).unwrap_err();
    assert!(matches!(err, EmitError::FallsThroughEnd));
    assert_eq!(backend.calls, 0);
}

#[test]
fn test_finalized_stream_carries_method_shape() -> Result<()> {
    let mut il = emitter([VerificationType::Int64], Some(VerificationType::Int64));
    let scratch = il.declare_local(VerificationType::Int64)?;
    il.ldarg(0)?.stloc(scratch)?.ldloc(scratch)?.ldloc(scratch)?.mul()?.ret()?;
    let stream = il.finalize()?;

    assert_eq!(stream.locals, vec![VerificationType::Int64]);
    assert_eq!(stream.signature.params, vec![VerificationType::Int64]);
    assert_eq!(stream.max_stack, 2);
    assert_eq!(stream.instructions[1].operand, Operand::Local(0));
    assert_eq!(stream.index_at_offset(stream.instructions[2].offset), Some(2));
    Ok(())
}
