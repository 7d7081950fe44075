//! Redundant cast elision
//!
//! Forward dataflow over the instruction graph. The fact for each stack slot
//! is the statically known type of the value in it, or `Unknown` once two
//! incoming edges disagree. A `castclass T` whose input is known to be null
//! or a reference assignable to `T` is elided, and the input fact flows past
//! it unchanged; that keeps a second run over flagged output identical.

use crate::program::{Entry, Program};
use crate::verifier;
use stackil_bytecode::core::instructions::Op;
use stackil_bytecode::core::metadata::TypeProvider;
use stackil_bytecode::core::opcodes::InstructionFlags;
use stackil_bytecode::core::types::VerificationType;
use std::collections::VecDeque;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Fact {
    Known(VerificationType),
    Unknown,
}

/// Slot facts, bottom to top
type Facts = Vec<Fact>;

/// Flag redundant casts; returns how many were elided
pub fn elide_casts(program: &mut Program) -> usize {
    for entry in &mut program.entries {
        entry.flags.remove(InstructionFlags::ELIDED);
    }

    let in_states = solve(program);
    let types = program.types.clone();
    let mut elided = 0;
    for (entry, state) in program.entries.iter_mut().zip(&in_states) {
        let Some(state) = state else { continue };
        if let Op::CastClass(target) = &entry.instruction.op {
            if redundant(state, &VerificationType::Object(target.clone()), &*types) {
                entry.flags.insert(InstructionFlags::ELIDED);
                elided += 1;
            }
        }
    }
    debug!(elided, "elided redundant casts");
    elided
}

fn solve(program: &Program) -> Vec<Option<Facts>> {
    let cfg = program.cfg();
    let types = program.types();
    let mut in_states: Vec<Option<Facts>> = vec![None; program.len()];
    let mut work = VecDeque::new();

    if !program.is_empty() {
        in_states[0] = Some(Vec::new());
        work.push_back(0);
    }
    for (start, stack) in program.handler_entries() {
        if start < program.len() {
            let facts = stack.iter().rev().cloned().map(Fact::Known).collect();
            in_states[start] = Some(facts);
            work.push_back(start);
        }
    }

    while let Some(index) = work.pop_front() {
        let Some(state) = in_states[index].clone() else {
            continue;
        };
        let out = transfer(&program.entries[index], state, types);
        for &next in cfg.successors(index) {
            let changed = match &mut in_states[next] {
                slot @ None => {
                    *slot = Some(out.clone());
                    true
                }
                Some(existing) => meet_into(existing, &out),
            };
            if changed && !work.contains(&next) {
                work.push_back(next);
            }
        }
    }
    in_states
}

/// Merge `incoming` into `state`; returns `true` when `state` changed
fn meet_into(state: &mut Facts, incoming: &Facts) -> bool {
    let mut changed = false;
    for (fact, other) in state.iter_mut().zip(incoming) {
        if *fact != Fact::Unknown && fact != other {
            *fact = Fact::Unknown;
            changed = true;
        }
    }
    changed
}

fn transfer(entry: &Entry, mut facts: Facts, types: &dyn TypeProvider) -> Facts {
    let op = &entry.instruction.op;
    match op {
        Op::Dup => {
            let top = facts.last().cloned().unwrap_or(Fact::Unknown);
            facts.push(top);
        }
        Op::CastClass(target) => {
            let input = facts.pop().unwrap_or(Fact::Unknown);
            let target = VerificationType::Object(target.clone());
            if redundant_fact(&input, &target, types) {
                facts.push(input);
            } else {
                facts.push(Fact::Known(target));
            }
        }
        _ => {
            let pushes = verifier::pushes(op);
            let pops = (entry.stack_before.len() + pushes).saturating_sub(entry.stack_after.len());
            facts.truncate(facts.len().saturating_sub(pops));
            if pushes > 0 {
                let pushed = entry
                    .stack_after
                    .peek(0)
                    .cloned()
                    .map(Fact::Known)
                    .unwrap_or(Fact::Unknown);
                facts.push(pushed);
            }
        }
    }
    facts
}

fn redundant(state: &Facts, target: &VerificationType, types: &dyn TypeProvider) -> bool {
    state
        .last()
        .is_some_and(|input| redundant_fact(input, target, types))
}

fn redundant_fact(input: &Fact, target: &VerificationType, types: &dyn TypeProvider) -> bool {
    match input {
        Fact::Known(ty @ (VerificationType::Null | VerificationType::Object(_))) => {
            ty.is_assignable_to(target, types)
        }
        _ => false,
    }
}
