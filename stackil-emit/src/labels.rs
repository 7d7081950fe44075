//! Label identity, marking and merge-point shape reconciliation
//!
//! A label's incoming shape is fixed by whichever comes first: a branch that
//! targets it, or the point where it is marked. Every later arrival must flow
//! into that shape; until the label is marked, a `null` slot in it widens to
//! the first object reference that arrives in the same position. Branches to a label that is not marked yet are kept as
//! pending and checked against the region rules once the label is placed.

use crate::config::LabelPolicy;
use crate::error::RegionRule;
use crate::regions::{RegionManager, ScopeId};
use crate::stack::{ShapeDivergence, StackState};
use stackil_bytecode::core::handles::{next_display_id, BuilderId, Label};
use stackil_bytecode::core::metadata::TypeProvider;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchKind {
    Ordinary,
    Leave,
}

#[derive(Debug, Clone)]
pub struct PendingBranch {
    pub source: usize,
    pub scope: ScopeId,
    pub kind: BranchKind,
}

#[derive(Debug, Clone)]
pub struct LabelInfo {
    pub name: String,
    pub position: Option<usize>,
    pub scope: Option<ScopeId>,
    pub shape: Option<StackState>,
    /// Set once any branch has targeted the label
    pub branched: bool,
    /// Every instruction index that branches here
    pub sources: Vec<usize>,
    pending: Vec<PendingBranch>,
}

/// Why recording a branch or marking a label failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabelFault {
    AlreadyMarked,
    Shape {
        expected: StackState,
        found: StackState,
        divergence: ShapeDivergence,
    },
    Region(RegionRule),
}

#[derive(Debug, Clone)]
pub struct BranchGraph {
    owner: BuilderId,
    labels: Vec<LabelInfo>,
}

impl BranchGraph {
    pub fn new(owner: BuilderId) -> Self {
        Self {
            owner,
            labels: Vec::new(),
        }
    }

    pub fn define(&mut self, name: Option<String>) -> Label {
        let label = Label::new(self.owner, self.labels.len() as u32);
        let name = name.unwrap_or_else(|| format!("_label{}", next_display_id()));
        self.labels.push(LabelInfo {
            name,
            position: None,
            scope: None,
            shape: None,
            branched: false,
            sources: Vec::new(),
            pending: Vec::new(),
        });
        label
    }

    pub fn owns(&self, label: Label) -> bool {
        label.owner() == self.owner && label.index() < self.labels.len()
    }

    pub fn info(&self, label: Label) -> &LabelInfo {
        &self.labels[label.index()]
    }

    pub fn name(&self, label: Label) -> &str {
        &self.labels[label.index()].name
    }

    pub fn position(&self, label: Label) -> Option<usize> {
        self.labels[label.index()].position
    }

    pub fn labels(&self) -> impl Iterator<Item = (Label, &LabelInfo)> + '_ {
        self.labels
            .iter()
            .enumerate()
            .map(move |(i, info)| (Label::new(self.owner, i as u32), info))
    }

    /// Labels marked at stream index `at`
    pub fn marked_at(&self, at: usize) -> impl Iterator<Item = &LabelInfo> + '_ {
        self.labels
            .iter()
            .filter(move |info| info.position == Some(at))
    }

    /// First label some branch targets that was never marked
    pub fn first_unmarked(&self) -> Option<&LabelInfo> {
        self.labels
            .iter()
            .find(|info| info.branched && info.position.is_none())
    }

    /// Record a branch from instruction `source` carrying `stack`
    pub fn record_branch(
        &mut self,
        label: Label,
        stack: &StackState,
        source: usize,
        scope: ScopeId,
        kind: BranchKind,
        regions: &RegionManager,
        types: &dyn TypeProvider,
    ) -> Result<(), LabelFault> {
        let info = &mut self.labels[label.index()];
        if info.position.is_none() {
            if let Some(expected) = &mut info.shape {
                expected.widen_nulls(stack);
            }
        }
        match &info.shape {
            Some(expected) => {
                stack
                    .flows_into(expected, types)
                    .map_err(|divergence| LabelFault::Shape {
                        expected: expected.clone(),
                        found: stack.clone(),
                        divergence,
                    })?;
            }
            None => info.shape = Some(stack.clone()),
        }
        if let Some(target_scope) = info.scope {
            check_crossing(regions, kind, scope, target_scope).map_err(LabelFault::Region)?;
        } else {
            info.pending.push(PendingBranch {
                source,
                scope,
                kind,
            });
        }
        info.branched = true;
        info.sources.push(source);
        Ok(())
    }

    /// Mark `label` at stream index `at`. Returns the stack that holds
    /// after the mark; a marked label always makes its point reachable.
    pub fn mark(
        &mut self,
        label: Label,
        current: Option<&StackState>,
        at: usize,
        policy: LabelPolicy,
        regions: &RegionManager,
        types: &dyn TypeProvider,
    ) -> Result<StackState, LabelFault> {
        let scope = regions.current_scope();
        let info = &mut self.labels[label.index()];
        if info.position.is_some() {
            return Err(LabelFault::AlreadyMarked);
        }

        let shape = match (current, info.shape.take()) {
            (Some(current), Some(mut shape)) => {
                shape.widen_nulls(current);
                let merged = current.flows_into(&shape, types);
                info.shape = Some(shape.clone());
                merged.map_err(|divergence| LabelFault::Shape {
                    expected: shape.clone(),
                    found: current.clone(),
                    divergence,
                })?;
                shape
            }
            (Some(current), None) => match policy {
                LabelPolicy::Strict => {
                    let empty = StackState::new();
                    if let Err(divergence) = current.flows_into(&empty, types) {
                        return Err(LabelFault::Shape {
                            expected: empty,
                            found: current.clone(),
                            divergence,
                        });
                    }
                    empty
                }
                LabelPolicy::Lenient => current.clone(),
            },
            (None, Some(shape)) => shape,
            (None, None) => StackState::new(),
        };

        for pending in &info.pending {
            check_crossing(regions, pending.kind, pending.scope, scope)
                .map_err(LabelFault::Region)?;
        }
        info.pending.clear();
        info.shape = Some(shape.clone());
        info.position = Some(at);
        info.scope = Some(scope);
        trace!(label = %info.name, at, shape = %shape, "mark label");
        Ok(shape)
    }

    /// Place a label without making its point reachable. Used for the end
    /// label of an exception block nothing leaves to.
    pub fn place(&mut self, label: Label, at: usize, scope: ScopeId) {
        let info = &mut self.labels[label.index()];
        info.position = Some(at);
        info.scope = Some(scope);
    }
}

fn check_crossing(
    regions: &RegionManager,
    kind: BranchKind,
    from: ScopeId,
    to: ScopeId,
) -> Result<(), RegionRule> {
    match kind {
        BranchKind::Ordinary => regions.check_branch(from, to),
        BranchKind::Leave => regions.check_leave(from, to),
    }
}
