//! Symbolic operand stack
//!
//! [`StackState`] stores slots bottom to top but displays and indexes them
//! top-first, which is how diagnostics talk about positions.
//! [`StackTracker`] applies one instruction's pops and pushes to a state and
//! reports the first violation it sees.

use smallvec::SmallVec;
use stackil_bytecode::core::metadata::TypeProvider;
use stackil_bytecode::core::types::{TypeClass, VerificationType};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct StackState {
    slots: SmallVec<[VerificationType; 8]>,
}

impl StackState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a state from slots listed top-first
    pub fn from_top(slots: impl IntoIterator<Item = VerificationType>) -> Self {
        let mut slots: SmallVec<[VerificationType; 8]> = slots.into_iter().collect();
        slots.reverse();
        Self { slots }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn push(&mut self, ty: VerificationType) {
        self.slots.push(ty);
    }

    pub fn pop(&mut self) -> Option<VerificationType> {
        self.slots.pop()
    }

    /// Slot at `depth` counted from the top (0 is the top)
    pub fn peek(&self, depth: usize) -> Option<&VerificationType> {
        self.slots.len().checked_sub(depth + 1).map(|i| &self.slots[i])
    }

    pub fn clear(&mut self) {
        self.slots.clear();
    }

    /// Slots top-first
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &VerificationType> + '_ {
        self.slots.iter().rev()
    }

    /// Replace each `null` slot with the reference `arriving` holds in the
    /// same position. Shapes of different depth are left alone.
    pub fn widen_nulls(&mut self, arriving: &StackState) -> bool {
        if self.len() != arriving.len() {
            return false;
        }
        let mut changed = false;
        for (slot, incoming) in self.slots.iter_mut().zip(&arriving.slots) {
            if *slot == VerificationType::Null && matches!(incoming, VerificationType::Object(_)) {
                *slot = incoming.clone();
                changed = true;
            }
        }
        changed
    }

    /// Check that a value shaped like `self` may flow into a point whose
    /// recorded shape is `expected`. Slot widening follows assignability.
    pub fn flows_into(
        &self,
        expected: &StackState,
        types: &dyn TypeProvider,
    ) -> Result<(), ShapeDivergence> {
        for (slot, (found, wanted)) in self.iter().zip(expected.iter()).enumerate() {
            if !found.is_assignable_to(wanted, types) {
                return Err(ShapeDivergence::Slot {
                    slot,
                    expected: wanted.clone(),
                    found: found.clone(),
                });
            }
        }
        if self.len() != expected.len() {
            return Err(ShapeDivergence::Depth {
                expected: expected.len(),
                found: self.len(),
            });
        }
        Ok(())
    }
}

impl fmt::Display for StackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, ty) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{ty}")?;
        }
        write!(f, "]")
    }
}

/// First point where two stack shapes disagree
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShapeDivergence {
    Slot {
        slot: usize,
        expected: VerificationType,
        found: VerificationType,
    },
    Depth {
        expected: usize,
        found: usize,
    },
}

impl fmt::Display for ShapeDivergence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShapeDivergence::Slot {
                slot,
                expected,
                found,
            } => write!(
                f,
                "stack position {slot} holds {found} where {expected} is required"
            ),
            ShapeDivergence::Depth { expected, found } => {
                write!(f, "stack depth is {found} where {expected} is required")
            }
        }
    }
}

/// Violation raised while applying one instruction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackFault {
    Underflow {
        expected: usize,
    },
    Mismatch {
        expected: TypeClass,
        found: VerificationType,
        position: usize,
    },
}

/// Applies pops and pushes to a [`StackState`], numbering positions from the
/// top as they were when the instruction started
pub struct StackTracker<'a> {
    stack: &'a mut StackState,
    types: &'a dyn TypeProvider,
    popped: usize,
}

impl<'a> StackTracker<'a> {
    pub fn new(stack: &'a mut StackState, types: &'a dyn TypeProvider) -> Self {
        Self {
            stack,
            types,
            popped: 0,
        }
    }

    pub fn types(&self) -> &'a dyn TypeProvider {
        self.types
    }

    /// Fail with an underflow unless `arity` values are available
    pub fn require(&self, arity: usize) -> Result<(), StackFault> {
        if self.stack.len() < arity {
            return Err(StackFault::Underflow { expected: arity });
        }
        Ok(())
    }

    /// Inspect the slot at `depth` below the current top without popping
    pub fn peek(&self, depth: usize) -> Result<&VerificationType, StackFault> {
        self.stack.peek(depth).ok_or(StackFault::Underflow {
            expected: self.popped + depth + 1,
        })
    }

    /// Check the slot at `depth` against `class` without popping
    pub fn check(&self, depth: usize, class: &TypeClass) -> Result<&VerificationType, StackFault> {
        let found = self.peek(depth)?;
        if class.accepts(found, self.types) {
            Ok(found)
        } else {
            Err(StackFault::Mismatch {
                expected: class.clone(),
                found: found.clone(),
                position: self.popped + depth,
            })
        }
    }

    pub fn pop(&mut self, class: &TypeClass) -> Result<VerificationType, StackFault> {
        self.check(0, class)?;
        self.popped += 1;
        self.stack.pop().ok_or(StackFault::Underflow {
            expected: self.popped,
        })
    }

    /// Pop arguments pushed in `params` order (the last one is on top)
    pub fn pop_arguments(&mut self, params: &[VerificationType]) -> Result<(), StackFault> {
        self.require(params.len())?;
        for param in params.iter().rev() {
            self.pop(&TypeClass::AssignableTo(param.clone()))?;
        }
        Ok(())
    }

    pub fn push(&mut self, ty: VerificationType) {
        self.stack.push(ty);
    }

    pub fn clear(&mut self) {
        self.stack.clear();
    }

    pub fn state(&self) -> &StackState {
        self.stack
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use stackil_bytecode::core::metadata::{ClassHierarchy, TypeRef};

    #[test]
    fn test_top_first_display() {
        let state = StackState::from_top([VerificationType::Int32, VerificationType::Float64]);
        assert_eq!(state.to_string(), "[int32, float64]");
        assert_eq!(state.peek(0), Some(&VerificationType::Int32));
        assert_eq!(state.peek(1), Some(&VerificationType::Float64));
        assert_eq!(state.peek(2), None);
        assert_eq!(StackState::new().to_string(), "[]");
    }

    #[test]
    fn test_iter_reverses_to_bottom_first() {
        let state = StackState::from_top([VerificationType::Int32, VerificationType::Float64]);
        let bottom_first: Vec<_> = state.iter().rev().cloned().collect();
        assert_eq!(bottom_first, vec![VerificationType::Float64, VerificationType::Int32]);
    }

    #[test]
    fn test_widen_nulls_adopts_arriving_reference() {
        let dog = VerificationType::Object(TypeRef::class("Dog"));
        let mut recorded = StackState::from_top([VerificationType::Null, VerificationType::Int32]);
        let arriving = StackState::from_top([dog.clone(), VerificationType::Int32]);
        assert!(recorded.widen_nulls(&arriving));
        assert_eq!(recorded, arriving);

        let mut shallow = StackState::from_top([VerificationType::Null]);
        assert!(!shallow.widen_nulls(&arriving));
        assert!(!recorded.widen_nulls(&StackState::from_top([VerificationType::Null, VerificationType::Int32])));
    }

    #[test]
    fn test_flows_into_allows_widening() {
        let animal = TypeRef::class("Animal");
        let dog = TypeRef::class("Dog");
        let types = ClassHierarchy::new()
            .with(animal.clone(), [])
            .and_then(|h| h.with(dog.clone(), [animal.clone()]))
            .unwrap();

        let recorded = StackState::from_top([VerificationType::Object(animal.clone())]);
        let incoming = StackState::from_top([VerificationType::Object(dog.clone())]);
        assert!(incoming.flows_into(&recorded, &types).is_ok());

        let err = recorded
            .flows_into(&StackState::from_top([VerificationType::Object(dog.clone())]), &types)
            .unwrap_err();
        assert!(matches!(err, ShapeDivergence::Slot { slot: 0, .. }));

        let err = StackState::from_top([VerificationType::Int32])
            .flows_into(&StackState::new(), &types)
            .unwrap_err();
        assert_eq!(
            err,
            ShapeDivergence::Depth {
                expected: 0,
                found: 1
            }
        );
    }

    #[test]
    fn test_tracker_positions() {
        let types = ClassHierarchy::new();
        let mut state = StackState::from_top([VerificationType::Int32, VerificationType::Float32]);
        let mut tracker = StackTracker::new(&mut state, &types);

        assert!(tracker.pop(&TypeClass::Int32).is_ok());
        let fault = tracker.pop(&TypeClass::Int32).unwrap_err();
        assert_eq!(
            fault,
            StackFault::Mismatch {
                expected: TypeClass::Int32,
                found: VerificationType::Float32,
                position: 1,
            }
        );
    }

    #[test]
    fn test_tracker_underflow() {
        let types = ClassHierarchy::new();
        let mut state = StackState::from_top([VerificationType::Int32]);
        let tracker = StackTracker::new(&mut state, &types);
        assert_eq!(
            tracker.require(2),
            Err(StackFault::Underflow { expected: 2 })
        );
    }
}
