//! Error types for instruction emission
//!
//! Verification failures carry a [`FailureContext`] that can reconstruct the
//! stack at the failing point and, for merge failures, the distinct paths
//! from the entry that lead there.

use crate::stack::{ShapeDivergence, StackState};
use stackil_bytecode::core::types::VerificationType;
use std::fmt::{self, Write};
use std::panic::Location;
use thiserror::Error;

/// Main error type for emission
#[derive(Error, Debug)]
pub enum EmitError {
    #[error("{opcode} expects {expected} {} on the stack", values(.expected))]
    StackUnderflow {
        opcode: &'static str,
        expected: usize,
        context: Box<FailureContext>,
    },

    #[error("{opcode} expected {expected}; found {found} (stack position {position})")]
    TypeMismatch {
        opcode: &'static str,
        expected: String,
        found: VerificationType,
        position: usize,
        context: Box<FailureContext>,
    },

    #[error(
        "{opcode}: stack shape at {at} must be {expected} but is {found}; {divergence}"
    )]
    StackShapeMismatch {
        opcode: &'static str,
        at: String,
        expected: StackState,
        found: StackState,
        divergence: ShapeDivergence,
        context: Box<FailureContext>,
    },

    #[error("{opcode}: {rule}")]
    RegionDisciplineViolation {
        opcode: &'static str,
        rule: RegionRule,
        context: Box<FailureContext>,
    },

    #[error("{operation}: {handle} belongs to a different emitter")]
    OwnershipViolation {
        operation: &'static str,
        handle: String,
    },

    #[error("{opcode} at instruction {index} is unreachable")]
    UnreachableCode {
        opcode: &'static str,
        index: usize,
        context: Box<FailureContext>,
    },

    #[error("{operation}: local {local} has been released")]
    UseAfterRelease {
        operation: &'static str,
        local: String,
    },

    #[error("{operation}: argument {index} is out of range (method has {count})")]
    ArgumentOutOfRange {
        operation: &'static str,
        index: u16,
        count: usize,
    },

    #[error("{operation}: {reason}")]
    InvalidOperand {
        operation: &'static str,
        reason: String,
    },

    #[error("label {label} is already marked")]
    LabelAlreadyMarked { label: String },

    #[error("label {label} is branched to but never marked")]
    UnmarkedLabel { label: String },

    #[error("control falls through the end of the instruction stream")]
    FallsThroughEnd,

    #[error("cannot finalize an empty instruction stream")]
    EmptyStream,

    #[error("emitter is unusable after an earlier verification failure")]
    Poisoned,

    #[error("target backend failed: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

fn values(count: &usize) -> &'static str {
    if *count == 1 {
        "value"
    } else {
        "values"
    }
}

impl EmitError {
    /// Diagnostic context for verification failures
    pub fn context(&self) -> Option<&FailureContext> {
        match self {
            EmitError::StackUnderflow { context, .. }
            | EmitError::TypeMismatch { context, .. }
            | EmitError::StackShapeMismatch { context, .. }
            | EmitError::RegionDisciplineViolation { context, .. }
            | EmitError::UnreachableCode { context, .. } => Some(context),
            _ => None,
        }
    }

    /// Region rule for discipline violations
    pub fn region_rule(&self) -> Option<RegionRule> {
        match self {
            EmitError::RegionDisciplineViolation { rule, .. } => Some(*rule),
            _ => None,
        }
    }

    /// `false` for the eagerly detected misuse categories that leave the
    /// emitter usable
    pub fn poisons(&self) -> bool {
        !matches!(
            self,
            EmitError::OwnershipViolation { .. }
                | EmitError::UseAfterRelease { .. }
                | EmitError::ArgumentOutOfRange { .. }
                | EmitError::Poisoned
        )
    }
}

/// Convenient Result type
pub type Result<T> = std::result::Result<T, EmitError>;

/// Specific exception-region rule a violation broke
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionRule {
    AlreadyEnded,
    InnerStillOpen,
    NoHandlers,
    DuplicateFinally,
    CatchAfterFinally,
    HandlerStillOpen,
    NotInCatch,
    NotInFinally,
    OutsideHandler,
    BranchOutOfRegion,
    BranchIntoFinally,
    BranchIntoRegion,
    LeaveOutsideRegion,
    LeaveFromFinally,
    LeaveNotOutward,
    RethrowOutsideCatch,
    EndFinallyOutsideFinally,
    ReturnInsideRegion,
    UnendedRegion,
}

impl fmt::Display for RegionRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            RegionRule::AlreadyEnded => "exception block has already ended",
            RegionRule::InnerStillOpen => "cannot end outer while inner open",
            RegionRule::NoHandlers => "exception block needs a catch or finally before it ends",
            RegionRule::DuplicateFinally => "exception block already has a finally handler",
            RegionRule::CatchAfterFinally => "catch cannot follow the finally handler",
            RegionRule::HandlerStillOpen => "previous handler is still open",
            RegionRule::NotInCatch => "no catch handler is open",
            RegionRule::NotInFinally => "no finally handler is open",
            RegionRule::OutsideHandler => "code between handlers must belong to a handler",
            RegionRule::BranchOutOfRegion => "branch from inside region to outside; use leave",
            RegionRule::BranchIntoFinally => "branch into finally",
            RegionRule::BranchIntoRegion => "branch into a region from outside it",
            RegionRule::LeaveOutsideRegion => "leave outside any exception region",
            RegionRule::LeaveFromFinally => "leave cannot exit a finally handler",
            RegionRule::LeaveNotOutward => "leave must target an enclosing region",
            RegionRule::RethrowOutsideCatch => "rethrow outside a catch handler",
            RegionRule::EndFinallyOutsideFinally => "endfinally outside a finally handler",
            RegionRule::ReturnInsideRegion => "ret inside an exception region; use leave",
            RegionRule::UnendedRegion => "exception block was never ended",
        };
        f.write_str(text)
    }
}

/// One step of a reconstructed path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathStep {
    pub index: usize,
    pub instruction: String,
    /// Stack after the step; `None` after a terminal instruction
    pub stack_after: Option<StackState>,
}

/// An acyclic path from an entry point to the failure point
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BadPath {
    pub steps: Vec<PathStep>,
}

/// Where and in what state a verification failure happened
#[derive(Debug, Clone)]
pub struct FailureContext {
    /// Index the failing instruction would have had in the stream
    pub index: usize,
    pub location: &'static Location<'static>,
    /// Stack at the failure point; `None` when the point is unreachable
    pub stack: Option<StackState>,
    /// Paths leading to a merge failure; empty for other failures
    pub bad_paths: Vec<BadPath>,
}

impl FailureContext {
    pub fn new(
        index: usize,
        location: &'static Location<'static>,
        stack: Option<StackState>,
    ) -> Self {
        Self {
            index,
            location,
            stack,
            bad_paths: Vec::new(),
        }
    }

    pub fn with_bad_paths(mut self, bad_paths: Vec<BadPath>) -> Self {
        self.bad_paths = bad_paths;
        self
    }

    /// Format the stack at the failure point, top first
    pub fn stack_dump(&self) -> String {
        let mut out = format!(
            "at instruction {} ({}:{})\n",
            self.index,
            self.location.file(),
            self.location.line()
        );
        match &self.stack {
            None => out.push_str("  <unreachable>\n"),
            Some(stack) if stack.is_empty() => out.push_str("  <empty stack>\n"),
            Some(stack) => {
                for (position, ty) in stack.iter().enumerate() {
                    let _ = writeln!(out, "  {position:>3}: {ty}");
                }
            }
        }
        out
    }

    /// Format every reconstructed bad path
    pub fn bad_paths_dump(&self) -> String {
        let mut out = String::new();
        for (i, path) in self.bad_paths.iter().enumerate() {
            let _ = writeln!(out, "path {}:", i + 1);
            if path.steps.is_empty() {
                out.push_str("  <entry>\n");
            }
            for step in &path.steps {
                let stack = match &step.stack_after {
                    Some(stack) => stack.to_string(),
                    None => "-".to_string(),
                };
                let _ = writeln!(out, "  {:04}: {:<32} {}", step.index, step.instruction, stack);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> Box<FailureContext> {
        Box::new(FailureContext::new(
            1,
            Location::caller(),
            Some(StackState::from_top([VerificationType::Int32])),
        ))
    }

    #[test]
    fn test_underflow_message() {
        let err = EmitError::StackUnderflow {
            opcode: "Add",
            expected: 2,
            context: context(),
        };
        assert_eq!(err.to_string(), "Add expects 2 values on the stack");
        assert!(err.poisons());

        let err = EmitError::StackUnderflow {
            opcode: "Pop",
            expected: 1,
            context: context(),
        };
        assert_eq!(err.to_string(), "Pop expects 1 value on the stack");
    }

    #[test]
    fn test_type_mismatch_message() {
        let err = EmitError::TypeMismatch {
            opcode: "Shl",
            expected: "an int32 or native int".to_string(),
            found: VerificationType::Float64,
            position: 0,
            context: context(),
        };
        assert_eq!(
            err.to_string(),
            "Shl expected an int32 or native int; found float64 (stack position 0)"
        );
    }

    #[test]
    fn test_eager_errors_do_not_poison() {
        let err = EmitError::ArgumentOutOfRange {
            operation: "LdArg",
            index: 3,
            count: 1,
        };
        assert!(!err.poisons());
        assert!(err.context().is_none());
    }

    #[test]
    fn test_stack_dump() {
        let dump = context().stack_dump();
        assert!(dump.contains("at instruction 1"));
        assert!(dump.contains("0: int32"));

        let unreachable = FailureContext::new(0, Location::caller(), None);
        assert!(unreachable.stack_dump().contains("<unreachable>"));
    }

    #[test]
    fn test_bad_paths_dump() {
        let path = BadPath {
            steps: vec![PathStep {
                index: 0,
                instruction: "ldc.i4 1".to_string(),
                stack_after: Some(StackState::from_top([VerificationType::Int32])),
            }],
        };
        let ctx = FailureContext::new(1, Location::caller(), None).with_bad_paths(vec![path]);
        let dump = ctx.bad_paths_dump();
        assert!(dump.starts_with("path 1:"));
        assert!(dump.contains("0000: ldc.i4 1"));
        assert!(dump.contains("[int32]"));
    }
}
