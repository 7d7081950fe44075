//! Post-verification optimizer
//!
//! Passes run in a fixed order: cast elision, tail-call marking, then branch
//! shortening, which has to see the layout the first two leave behind.
//! A pass only toggles its own [`InstructionFlags`] and always recomputes
//! them from a cleared state; a disabled pass clears its flag.
//!
//! [`InstructionFlags`]: stackil_bytecode::InstructionFlags

mod branches;
mod casts;
mod tail_calls;

use crate::config::OptimizerConfig;
use crate::program::Program;
use stackil_bytecode::core::opcodes::InstructionFlags;
use tracing::debug;

pub use self::branches::shorten_branches;
pub use self::casts::elide_casts;
pub use self::tail_calls::mark_tail_calls;

/// What one optimizer run changed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OptimizationReport {
    pub elided_casts: usize,
    pub tail_calls: usize,
    pub short_branches: usize,
    /// Layout iterations branch shortening needed to settle
    pub shortening_iterations: usize,
}

pub(crate) fn run(program: &mut Program, config: &OptimizerConfig) -> OptimizationReport {
    let mut report = OptimizationReport::default();

    if config.elide_casts {
        report.elided_casts = elide_casts(program);
    } else {
        clear(program, InstructionFlags::ELIDED);
    }

    if config.mark_tail_calls {
        report.tail_calls = mark_tail_calls(program, &config.tail_calls);
    } else {
        clear(program, InstructionFlags::TAIL_CALL);
    }

    if config.shorten_branches {
        let (short, iterations) = shorten_branches(program);
        report.short_branches = short;
        report.shortening_iterations = iterations;
    } else {
        clear_branch_forms(program);
    }

    debug!(
        elided = report.elided_casts,
        tail_calls = report.tail_calls,
        short_branches = report.short_branches,
        iterations = report.shortening_iterations,
        "optimized {} instructions",
        program.len()
    );
    report
}

fn clear(program: &mut Program, flag: InstructionFlags) {
    for entry in &mut program.entries {
        entry.flags.remove(flag);
    }
}

/// Put every branch back in its long form. Short local and argument slots
/// are fixed when the instruction is appended and stay.
fn clear_branch_forms(program: &mut Program) {
    for entry in &mut program.entries {
        if entry.instruction.op.is_shortenable_branch() {
            entry.flags.remove(InstructionFlags::SHORT_FORM);
        }
    }
}
