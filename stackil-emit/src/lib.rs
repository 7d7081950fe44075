//! stackil emitter
//!
//! Fluent builder that verifies a stack-machine instruction stream as it is
//! appended, optimizes the verified stream, and hands the resolved result to
//! a [`TargetBackend`].
//!
//! ## Usage
//! ```ignore
//! use stackil_emit::{Emitter, Listing};
//! use stackil_bytecode::{ClassHierarchy, MethodSignature, VerificationType};
//! use std::sync::Arc;
//!
//! let signature = MethodSignature::new([], Some(VerificationType::Int32));
//! let mut il = Emitter::new(signature, Arc::new(ClassHierarchy::new()));
//! let done = il.define_label();
//! il.ldc_i4(1)?.brtrue(done)?.ldc_i4(0)?.ret()?;
//! il.mark_label(done)?.ldc_i4(3)?.ret()?;
//!
//! let program = il.verify()?;
//! println!("{}", Listing::new().program(&program));
//! ```

#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

mod cfg;
pub mod config;
mod diagnostics;
mod emitter;
pub mod error;
mod finalize;
mod labels;
mod layout;
pub mod listing;
mod locals;
pub mod optimizer;
mod program;
pub mod regions;
pub mod stack;
mod verifier;

pub use crate::cfg::Cfg;
pub use crate::config::{CallKind, EmitterConfig, LabelPolicy, OptimizerConfig, TailCallPolicy};
pub use crate::emitter::Emitter;
pub use crate::error::{BadPath, EmitError, FailureContext, PathStep, RegionRule, Result};
pub use crate::finalize::{
    FinalizedStream, Operand, ResolvedHandler, ResolvedInstruction, ResolvedTarget, TargetBackend,
};
pub use crate::listing::{Listing, ListingConfig, ListingFormat};
pub use crate::optimizer::OptimizationReport;
pub use crate::program::{Entry, Program, ProgramLabel, ProgramLocal};
pub use crate::regions::{HandlerKind, HandlerRecord, ScopeId, ScopeKind};
pub use crate::stack::{ShapeDivergence, StackState};
