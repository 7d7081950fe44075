//! Per-instruction control-flow graph
//!
//! Nodes are stream indices. Edges are fallthrough plus every branch target
//! that resolves to an instruction; targets resolving to the end of the
//! stream produce no edge. Entry points are index 0 and each handler start.

use crate::program::Entry;
use smallvec::SmallVec;
use stackil_bytecode::core::handles::Label;
use std::collections::VecDeque;

#[derive(Debug, Clone)]
pub struct Cfg {
    successors: Vec<SmallVec<[usize; 2]>>,
    predecessors: Vec<SmallVec<[usize; 2]>>,
    roots: Vec<usize>,
}

impl Cfg {
    pub fn build(
        entries: &[Entry],
        position: impl Fn(Label) -> Option<usize>,
        roots: impl IntoIterator<Item = usize>,
    ) -> Self {
        let len = entries.len();
        let mut successors = vec![SmallVec::<[usize; 2]>::new(); len];
        let mut predecessors = vec![SmallVec::<[usize; 2]>::new(); len];

        for (index, entry) in entries.iter().enumerate() {
            let op = &entry.instruction.op;
            let mut edges: SmallVec<[usize; 2]> = SmallVec::new();
            if !op.is_unconditional_terminal() && index + 1 < len {
                edges.push(index + 1);
            }
            for target in op.branch_targets() {
                if let Some(at) = position(target).filter(|&at| at < len) {
                    if !edges.contains(&at) {
                        edges.push(at);
                    }
                }
            }
            for &to in &edges {
                predecessors[to].push(index);
            }
            successors[index] = edges;
        }

        let mut roots: Vec<usize> = roots.into_iter().filter(|&root| root < len).collect();
        if len > 0 && !roots.contains(&0) {
            roots.insert(0, 0);
        }

        Self {
            successors,
            predecessors,
            roots,
        }
    }

    pub fn len(&self) -> usize {
        self.successors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.successors.is_empty()
    }

    pub fn successors(&self, index: usize) -> &[usize] {
        &self.successors[index]
    }

    pub fn predecessors(&self, index: usize) -> &[usize] {
        &self.predecessors[index]
    }

    pub fn roots(&self) -> &[usize] {
        &self.roots
    }

    pub fn is_root(&self, index: usize) -> bool {
        self.roots.contains(&index)
    }

    /// Breadth-first reachability from every entry point
    pub fn reachable(&self) -> Vec<bool> {
        let mut seen = vec![false; self.len()];
        let mut queue: VecDeque<usize> = self.roots.iter().copied().collect();
        for &root in &self.roots {
            seen[root] = true;
        }
        while let Some(index) = queue.pop_front() {
            for &next in self.successors(index) {
                if !seen[next] {
                    seen[next] = true;
                    queue.push_back(next);
                }
            }
        }
        seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regions::ScopeId;
    use crate::stack::StackState;
    use pretty_assertions::assert_eq;
    use stackil_bytecode::core::handles::BuilderId;
    use stackil_bytecode::core::instructions::{BranchCondition, Instruction, Op};
    use stackil_bytecode::core::opcodes::InstructionFlags;

    fn entry(op: Op) -> Entry {
        Entry {
            instruction: Instruction::here(op),
            flags: InstructionFlags::empty(),
            scope: ScopeId::ROOT,
            stack_before: StackState::new(),
            stack_after: StackState::new(),
        }
    }

    #[test]
    fn test_edges_and_reachability() {
        let owner = BuilderId::fresh();
        let exit = Label::new(owner, 0);
        let entries = vec![
            entry(Op::LdcI4(1)),
            entry(Op::Branch {
                cond: BranchCondition::True,
                target: exit,
            }),
            entry(Op::Nop),
            entry(Op::Ret),
            entry(Op::Nop),
        ];
        let cfg = Cfg::build(&entries, |_| Some(3), []);

        assert_eq!(cfg.successors(1), &[2, 3]);
        assert_eq!(cfg.predecessors(3), &[1, 2]);
        assert!(cfg.successors(3).is_empty());
        assert_eq!(cfg.reachable(), vec![true, true, true, true, false]);
    }

    #[test]
    fn test_handler_roots() {
        let entries = vec![entry(Op::Ret), entry(Op::Pop), entry(Op::Rethrow)];
        let cfg = Cfg::build(&entries, |_| None, [1]);
        assert_eq!(cfg.roots(), &[0, 1]);
        assert_eq!(cfg.reachable(), vec![true, true, true]);
    }
}
