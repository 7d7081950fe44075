//! Owner-tagged handles for labels, locals and exception blocks
//!
//! Handles are small `Copy` indices into arenas owned by one emitter. Each
//! handle carries the [`BuilderId`] of the emitter that created it, so using a
//! handle against a different emitter is detected structurally.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

static NEXT_BUILDER_ID: AtomicU32 = AtomicU32::new(1);

// Cosmetic only: feeds default names for labels and locals.
static NEXT_DISPLAY_ID: AtomicU64 = AtomicU64::new(0);

/// Identity of one emitter instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BuilderId(u32);

impl BuilderId {
    /// Allocate a process-unique builder id
    pub fn fresh() -> Self {
        Self(NEXT_BUILDER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Next value of the process-wide counter used for default display names.
/// Never consulted for correctness.
pub fn next_display_id() -> u64 {
    NEXT_DISPLAY_ID.fetch_add(1, Ordering::Relaxed)
}

/// A markable program point used as a branch target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label {
    owner: BuilderId,
    index: u32,
}

/// A declared local variable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Local {
    owner: BuilderId,
    index: u32,
}

/// An exception block opened by `begin_exception_block`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExceptionBlock {
    owner: BuilderId,
    index: u32,
}

macro_rules! owned_handle {
    ($ty:ident, $prefix:literal) => {
        impl $ty {
            pub fn new(owner: BuilderId, index: u32) -> Self {
                Self { owner, index }
            }

            pub fn owner(&self) -> BuilderId {
                self.owner
            }

            pub fn index(&self) -> usize {
                self.index as usize
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.index)
            }
        }
    };
}

owned_handle!(Label, "L");
owned_handle!(Local, "V_");
owned_handle!(ExceptionBlock, "EB");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_ids_are_unique() {
        let a = BuilderId::fresh();
        let b = BuilderId::fresh();
        assert_ne!(a, b);
    }

    #[test]
    fn test_handles_compare_by_owner() {
        let a = BuilderId::fresh();
        let b = BuilderId::fresh();
        assert_ne!(Label::new(a, 0), Label::new(b, 0));
        assert_eq!(Local::new(a, 3).index(), 3);
        assert_eq!(Label::new(a, 7).to_string(), "L7");
        assert_eq!(ExceptionBlock::new(a, 1).owner(), a);
    }
}
