//! Exception region nesting
//!
//! Regions form a scope tree. The method body is the root scope; a protected
//! body is a child of the scope that opened it, and each handler is a sibling
//! of its protected body. Every instruction and every marked label records
//! the scope it was placed in, which is all the branch-crossing rules need.
//!
//! A region moves through
//! `Protected → (Catch → AfterCatch)* → (Finally → AfterFinally)? → Ended`.

use crate::error::RegionRule;
use stackil_bytecode::core::handles::{ExceptionBlock, Label};
use stackil_bytecode::core::metadata::TypeRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeId(u32);

impl ScopeId {
    pub const ROOT: ScopeId = ScopeId(0);

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Body,
    Protected,
    Catch,
    Finally,
}

#[derive(Debug, Clone)]
struct Scope {
    kind: ScopeKind,
    parent: Option<ScopeId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Protected,
    Catch,
    AfterCatch,
    Finally,
    AfterFinally,
    Ended,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerKind {
    Catch(TypeRef),
    Finally,
}

#[derive(Debug, Clone)]
pub struct HandlerSpan {
    pub kind: HandlerKind,
    pub scope: ScopeId,
    pub start: usize,
    pub end: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct Region {
    pub block: ExceptionBlock,
    pub protected: ScopeId,
    pub phase: Phase,
    /// Label every implicit `leave` targets; marked when the block ends
    pub end_label: Label,
    pub try_start: usize,
    pub try_end: Option<usize>,
    pub handlers: Vec<HandlerSpan>,
}

/// One row of the handler table, in stream indices with exclusive ends
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerRecord {
    pub kind: HandlerKind,
    pub try_start: usize,
    pub try_end: usize,
    pub handler_start: usize,
    pub handler_end: usize,
}

#[derive(Debug, Clone)]
pub struct RegionManager {
    scopes: Vec<Scope>,
    regions: Vec<Region>,
    open: Vec<usize>,
    ended: Vec<usize>,
    current: ScopeId,
}

impl Default for RegionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl RegionManager {
    pub fn new() -> Self {
        Self {
            scopes: vec![Scope {
                kind: ScopeKind::Body,
                parent: None,
            }],
            regions: Vec::new(),
            open: Vec::new(),
            ended: Vec::new(),
            current: ScopeId::ROOT,
        }
    }

    pub fn current_scope(&self) -> ScopeId {
        self.current
    }

    pub fn kind(&self, scope: ScopeId) -> ScopeKind {
        self.scopes[scope.index()].kind
    }

    pub fn parent(&self, scope: ScopeId) -> Option<ScopeId> {
        self.scopes[scope.index()].parent
    }

    pub fn is_ancestor_or_self(&self, ancestor: ScopeId, scope: ScopeId) -> bool {
        let mut cursor = Some(scope);
        while let Some(current) = cursor {
            if current == ancestor {
                return true;
            }
            cursor = self.parent(current);
        }
        false
    }

    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    pub fn region(&self, block: ExceptionBlock) -> Option<&Region> {
        self.regions.get(block.index())
    }

    pub fn innermost_open(&self) -> Option<&Region> {
        self.open.last().map(|&idx| &self.regions[idx])
    }

    /// Stream index of every handler opened so far, with its kind
    pub fn handler_starts(&self) -> impl Iterator<Item = (usize, &HandlerKind)> + '_ {
        self.regions
            .iter()
            .flat_map(|region| region.handlers.iter())
            .map(|handler| (handler.start, &handler.kind))
    }

    /// First region that was begun but never ended
    pub fn unended(&self) -> Option<&Region> {
        self.open.first().map(|&idx| &self.regions[idx])
    }

    fn push_scope(&mut self, kind: ScopeKind, parent: ScopeId) -> ScopeId {
        let id = ScopeId(self.scopes.len() as u32);
        self.scopes.push(Scope {
            kind,
            parent: Some(parent),
        });
        id
    }

    /// Reject placing code between two handlers of the same block
    pub fn check_placement(&self) -> Result<(), RegionRule> {
        match self.innermost_open().map(|region| region.phase) {
            Some(Phase::AfterCatch | Phase::AfterFinally) => Err(RegionRule::OutsideHandler),
            _ => Ok(()),
        }
    }

    pub fn begin(&mut self, block: ExceptionBlock, end_label: Label, at: usize) {
        let protected = self.push_scope(ScopeKind::Protected, self.current);
        self.regions.push(Region {
            block,
            protected,
            phase: Phase::Protected,
            end_label,
            try_start: at,
            try_end: None,
            handlers: Vec::new(),
        });
        self.open.push(self.regions.len() - 1);
        self.current = protected;
    }

    /// Index of `block` provided it is the innermost open region
    fn innermost(&self, block: ExceptionBlock) -> Result<usize, RegionRule> {
        let idx = block.index();
        match self.regions.get(idx) {
            Some(region) if region.phase == Phase::Ended => Err(RegionRule::AlreadyEnded),
            Some(_) if self.open.last() == Some(&idx) => Ok(idx),
            _ => Err(RegionRule::InnerStillOpen),
        }
    }

    pub fn phase(&self, block: ExceptionBlock) -> Result<Phase, RegionRule> {
        self.innermost(block).map(|idx| self.regions[idx].phase)
    }

    pub fn check_begin_catch(&self, block: ExceptionBlock) -> Result<Phase, RegionRule> {
        match self.phase(block)? {
            phase @ (Phase::Protected | Phase::AfterCatch) => Ok(phase),
            Phase::Catch => Err(RegionRule::HandlerStillOpen),
            Phase::Finally | Phase::AfterFinally => Err(RegionRule::CatchAfterFinally),
            Phase::Ended => Err(RegionRule::AlreadyEnded),
        }
    }

    pub fn check_begin_finally(&self, block: ExceptionBlock) -> Result<Phase, RegionRule> {
        match self.phase(block)? {
            phase @ (Phase::Protected | Phase::AfterCatch) => Ok(phase),
            Phase::Catch => Err(RegionRule::HandlerStillOpen),
            Phase::Finally | Phase::AfterFinally => Err(RegionRule::DuplicateFinally),
            Phase::Ended => Err(RegionRule::AlreadyEnded),
        }
    }

    pub fn check_end_catch(&self, block: ExceptionBlock) -> Result<(), RegionRule> {
        match self.phase(block)? {
            Phase::Catch => Ok(()),
            _ => Err(RegionRule::NotInCatch),
        }
    }

    pub fn check_end_finally(&self, block: ExceptionBlock) -> Result<(), RegionRule> {
        match self.phase(block)? {
            Phase::Finally => Ok(()),
            _ => Err(RegionRule::NotInFinally),
        }
    }

    pub fn check_end(&self, block: ExceptionBlock) -> Result<(), RegionRule> {
        match self.phase(block)? {
            Phase::AfterCatch | Phase::AfterFinally => Ok(()),
            Phase::Protected => Err(RegionRule::NoHandlers),
            Phase::Catch | Phase::Finally => Err(RegionRule::HandlerStillOpen),
            Phase::Ended => Err(RegionRule::AlreadyEnded),
        }
    }

    /// Open a handler at stream index `at`; callers validate first
    pub fn enter_handler(&mut self, block: ExceptionBlock, kind: HandlerKind, at: usize) {
        let idx = block.index();
        let outer = self
            .parent(self.regions[idx].protected)
            .unwrap_or(ScopeId::ROOT);
        let (scope_kind, phase) = match kind {
            HandlerKind::Catch(_) => (ScopeKind::Catch, Phase::Catch),
            HandlerKind::Finally => (ScopeKind::Finally, Phase::Finally),
        };
        let scope = self.push_scope(scope_kind, outer);
        let region = &mut self.regions[idx];
        if region.phase == Phase::Protected {
            region.try_end = Some(at);
        }
        region.phase = phase;
        region.handlers.push(HandlerSpan {
            kind,
            scope,
            start: at,
            end: None,
        });
        self.current = scope;
    }

    /// Close the open handler at stream index `at`
    pub fn exit_handler(&mut self, block: ExceptionBlock, at: usize) {
        let idx = block.index();
        let outer = self
            .parent(self.regions[idx].protected)
            .unwrap_or(ScopeId::ROOT);
        let region = &mut self.regions[idx];
        region.phase = match region.phase {
            Phase::Finally => Phase::AfterFinally,
            _ => Phase::AfterCatch,
        };
        if let Some(handler) = region.handlers.last_mut() {
            handler.end = Some(at);
        }
        self.current = outer;
    }

    pub fn end(&mut self, block: ExceptionBlock) -> &Region {
        let idx = block.index();
        self.regions[idx].phase = Phase::Ended;
        self.open.retain(|&open| open != idx);
        self.ended.push(idx);
        self.current = self
            .parent(self.regions[idx].protected)
            .unwrap_or(ScopeId::ROOT);
        &self.regions[idx]
    }

    /// Ordinary branch from `from` to a label placed in `to`
    pub fn check_branch(&self, from: ScopeId, to: ScopeId) -> Result<(), RegionRule> {
        if from == to {
            return Ok(());
        }
        if self.is_ancestor_or_self(to, from) {
            return Err(RegionRule::BranchOutOfRegion);
        }
        if self.kind(to) == ScopeKind::Finally {
            return Err(RegionRule::BranchIntoFinally);
        }
        Err(RegionRule::BranchIntoRegion)
    }

    /// Is `leave` legal from `from` at all
    pub fn check_leave_source(&self, from: ScopeId) -> Result<(), RegionRule> {
        match self.kind(from) {
            ScopeKind::Body => Err(RegionRule::LeaveOutsideRegion),
            ScopeKind::Finally => Err(RegionRule::LeaveFromFinally),
            ScopeKind::Protected | ScopeKind::Catch => Ok(()),
        }
    }

    /// `leave` from `from` to a label placed in `to`
    pub fn check_leave(&self, from: ScopeId, to: ScopeId) -> Result<(), RegionRule> {
        self.check_leave_source(from)?;
        if self.is_ancestor_or_self(to, from) {
            Ok(())
        } else {
            Err(RegionRule::LeaveNotOutward)
        }
    }

    /// Handler table in nesting order: inner regions first, catches before
    /// the finally of the same block
    pub fn handler_table(&self) -> Vec<HandlerRecord> {
        let mut table = Vec::new();
        for &idx in &self.ended {
            let region = &self.regions[idx];
            let try_end = region.try_end.unwrap_or(region.try_start);
            let mut guarded_end = try_end;
            for handler in &region.handlers {
                let handler_end = handler.end.unwrap_or(handler.start);
                let record = match &handler.kind {
                    HandlerKind::Catch(_) => HandlerRecord {
                        kind: handler.kind.clone(),
                        try_start: region.try_start,
                        try_end,
                        handler_start: handler.start,
                        handler_end,
                    },
                    // A finally also guards the catch handlers before it.
                    HandlerKind::Finally => HandlerRecord {
                        kind: HandlerKind::Finally,
                        try_start: region.try_start,
                        try_end: guarded_end,
                        handler_start: handler.start,
                        handler_end,
                    },
                };
                guarded_end = handler_end;
                table.push(record);
            }
        }
        table
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stackil_bytecode::core::handles::BuilderId;

    fn handles() -> (ExceptionBlock, ExceptionBlock, Label, Label) {
        let owner = BuilderId::fresh();
        (
            ExceptionBlock::new(owner, 0),
            ExceptionBlock::new(owner, 1),
            Label::new(owner, 0),
            Label::new(owner, 1),
        )
    }

    #[test]
    fn test_scope_tree() {
        let (outer, _, end, _) = handles();
        let mut regions = RegionManager::new();
        regions.begin(outer, end, 0);
        let protected = regions.current_scope();
        assert_eq!(regions.kind(protected), ScopeKind::Protected);
        assert!(regions.is_ancestor_or_self(ScopeId::ROOT, protected));

        regions.enter_handler(outer, HandlerKind::Catch(TypeRef::exception()), 3);
        let catch = regions.current_scope();
        assert_eq!(regions.parent(catch), Some(ScopeId::ROOT));
        assert!(!regions.is_ancestor_or_self(protected, catch));
    }

    #[test]
    fn test_phase_rules() {
        let (block, _, end, _) = handles();
        let mut regions = RegionManager::new();
        regions.begin(block, end, 0);

        assert_eq!(regions.check_end(block), Err(RegionRule::NoHandlers));
        assert_eq!(regions.check_end_catch(block), Err(RegionRule::NotInCatch));

        regions.enter_handler(block, HandlerKind::Finally, 2);
        assert_eq!(
            regions.check_begin_catch(block),
            Err(RegionRule::CatchAfterFinally)
        );
        assert_eq!(regions.check_end(block), Err(RegionRule::HandlerStillOpen));

        regions.exit_handler(block, 4);
        assert_eq!(
            regions.check_begin_finally(block),
            Err(RegionRule::DuplicateFinally)
        );
        assert_eq!(regions.check_placement(), Err(RegionRule::OutsideHandler));
        assert!(regions.check_end(block).is_ok());

        regions.end(block);
        assert_eq!(regions.check_end(block), Err(RegionRule::AlreadyEnded));
        assert!(regions.unended().is_none());
    }

    #[test]
    fn test_outer_cannot_end_while_inner_open() {
        let (outer, inner, end_outer, end_inner) = handles();
        let mut regions = RegionManager::new();
        regions.begin(outer, end_outer, 0);
        regions.begin(inner, end_inner, 0);
        assert_eq!(regions.check_end(outer), Err(RegionRule::InnerStillOpen));
        assert_eq!(regions.unended().map(|r| r.block), Some(outer));
    }

    #[test]
    fn test_branch_crossing() {
        let (block, _, end, _) = handles();
        let mut regions = RegionManager::new();
        regions.begin(block, end, 0);
        let protected = regions.current_scope();
        regions.enter_handler(block, HandlerKind::Finally, 1);
        let finally = regions.current_scope();

        assert!(regions.check_branch(protected, protected).is_ok());
        assert_eq!(
            regions.check_branch(protected, ScopeId::ROOT),
            Err(RegionRule::BranchOutOfRegion)
        );
        assert_eq!(
            regions.check_branch(ScopeId::ROOT, protected),
            Err(RegionRule::BranchIntoRegion)
        );
        assert_eq!(
            regions.check_branch(ScopeId::ROOT, finally),
            Err(RegionRule::BranchIntoFinally)
        );
        assert!(regions.check_leave(protected, ScopeId::ROOT).is_ok());
        assert_eq!(
            regions.check_leave(ScopeId::ROOT, ScopeId::ROOT),
            Err(RegionRule::LeaveOutsideRegion)
        );
        assert_eq!(
            regions.check_leave(finally, ScopeId::ROOT),
            Err(RegionRule::LeaveFromFinally)
        );
        assert_eq!(
            regions.check_leave(protected, finally),
            Err(RegionRule::LeaveNotOutward)
        );
    }

    #[test]
    fn test_handler_table_order() {
        let (outer, inner, end_outer, end_inner) = handles();
        let mut regions = RegionManager::new();
        regions.begin(outer, end_outer, 0);
        regions.begin(inner, end_inner, 0);
        regions.enter_handler(inner, HandlerKind::Catch(TypeRef::exception()), 2);
        regions.exit_handler(inner, 4);
        regions.end(inner);
        regions.enter_handler(outer, HandlerKind::Catch(TypeRef::exception()), 5);
        regions.exit_handler(outer, 7);
        regions.enter_handler(outer, HandlerKind::Finally, 7);
        regions.exit_handler(outer, 9);
        regions.end(outer);

        let table = regions.handler_table();
        assert_eq!(table.len(), 3);
        assert_eq!((table[0].try_start, table[0].try_end), (0, 2));
        assert_eq!((table[1].handler_start, table[1].handler_end), (5, 7));
        assert_eq!(table[2].kind, HandlerKind::Finally);
        assert_eq!((table[2].try_start, table[2].try_end), (0, 7));
    }
}
