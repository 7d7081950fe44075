//! stackil instruction set
//!
//! Data model shared by the emitter and its backends: opcodes and their
//! encoded sizes, the verification type lattice, type and member metadata,
//! and the instruction tagged union.

#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

pub mod core;
pub mod error;

// Re-export commonly used types
pub use crate::core::{
    handles::{BuilderId, ExceptionBlock, Label, Local},
    instructions::{Instruction, Op},
    metadata::{ClassHierarchy, FieldRef, MethodRef, MethodSignature, TypeProvider, TypeRef},
    opcodes::{InstructionFlags, Opcode},
    types::{TypeClass, VerificationType},
};

pub use crate::error::{BytecodeError, Result};
