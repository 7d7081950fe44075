//! Branch shortening
//!
//! Every branch starts in its long form. Each iteration lays the stream out
//! and shortens every long branch whose displacement, measured from the end
//! of its short encoding, fits a signed byte. Shrinking instructions only
//! ever pulls a branch and its target closer together, so a branch that fits
//! keeps fitting, total code size never grows, and the loop settles after at
//! most one iteration per branch plus a final one that changes nothing.

use crate::layout::{self, Layout};
use crate::program::Program;
use stackil_bytecode::core::opcodes::{InstructionFlags, SHORT_BRANCH_RANGE};
use tracing::{debug, warn};

/// Returns the number of short branches and the iterations it took
pub fn shorten_branches(program: &mut Program) -> (usize, usize) {
    let mut branches = Vec::new();
    for (index, entry) in program.entries.iter_mut().enumerate() {
        if entry.instruction.op.is_shortenable_branch() {
            entry.flags.remove(InstructionFlags::SHORT_FORM);
            if !entry.is(InstructionFlags::ELIDED) {
                branches.push(index);
            }
        }
    }

    let bound = branches.len() + 1;
    let mut iterations = 0;
    loop {
        iterations += 1;
        let layout = Layout::compute(&program.entries);
        let shrinkable: Vec<usize> = branches
            .iter()
            .copied()
            .filter(|&index| fits_short(program, &layout, index))
            .collect();

        if shrinkable.is_empty() {
            break;
        }
        for index in shrinkable {
            program.entries[index].flags.insert(InstructionFlags::SHORT_FORM);
        }
        if iterations >= bound {
            warn!(iterations, "branch shortening stopped at its iteration bound");
            break;
        }
    }

    let short = branches
        .iter()
        .filter(|&&index| program.entries[index].is(InstructionFlags::SHORT_FORM))
        .count();
    debug!(branches = branches.len(), short, iterations, "shortened branches");
    (short, iterations)
}

fn fits_short(program: &Program, layout: &Layout, index: usize) -> bool {
    let entry = &program.entries[index];
    if entry.is(InstructionFlags::SHORT_FORM) {
        return false;
    }
    let op = &entry.instruction.op;
    let Some(short) = layout::short_size(op) else {
        return false;
    };
    let Some(target) = op
        .branch_targets()
        .first()
        .and_then(|&label| program.label_position(label))
    else {
        return false;
    };

    let start = i64::from(layout.offset(index));
    let savings = i64::from(layout.size(index)) - i64::from(short);
    let mut target_offset = i64::from(layout.offset(target));
    // A forward target moves up by whatever this branch saves.
    if target > index {
        target_offset -= savings;
    }
    let displacement = target_offset - (start + i64::from(short));
    SHORT_BRANCH_RANGE.contains(&displacement)
}
