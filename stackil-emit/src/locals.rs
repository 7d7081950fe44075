//! Local slot arena
//!
//! A [`Local`] is an owner-tagged handle; the storage slot behind it is an
//! index into the frame. Releasing a local retires the handle and returns the
//! slot to a free list, from which a later declaration of the identical type
//! can take it.

use stackil_bytecode::core::handles::{next_display_id, BuilderId, Local};
use stackil_bytecode::core::types::VerificationType;

#[derive(Debug, Clone)]
pub struct LocalInfo {
    pub name: String,
    pub slot: u16,
    pub ty: VerificationType,
    pub released: bool,
}

#[derive(Debug, Clone)]
struct Slot {
    ty: VerificationType,
    free: bool,
}

/// Result of a declaration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Declared {
    pub local: Local,
    /// The slot was previously used by a released local
    pub reused: bool,
}

#[derive(Debug, Clone)]
pub struct LocalArena {
    owner: BuilderId,
    locals: Vec<LocalInfo>,
    slots: Vec<Slot>,
}

impl LocalArena {
    pub fn new(owner: BuilderId) -> Self {
        Self {
            owner,
            locals: Vec::new(),
            slots: Vec::new(),
        }
    }

    /// Declare a local, reusing a free slot of the identical type if any.
    /// Returns `None` when the frame has no slot index left.
    pub fn declare(&mut self, ty: VerificationType, name: Option<String>) -> Option<Declared> {
        let reusable = self
            .slots
            .iter()
            .position(|slot| slot.free && slot.ty == ty);
        let (slot, reused) = match reusable {
            Some(slot) => {
                self.slots[slot].free = false;
                (slot, true)
            }
            None => {
                if self.slots.len() > u16::MAX as usize {
                    return None;
                }
                self.slots.push(Slot {
                    ty: ty.clone(),
                    free: false,
                });
                (self.slots.len() - 1, false)
            }
        };
        let local = Local::new(self.owner, self.locals.len() as u32);
        self.locals.push(LocalInfo {
            name: name.unwrap_or_else(|| format!("_local{}", next_display_id())),
            slot: slot as u16,
            ty,
            released: false,
        });
        Some(Declared { local, reused })
    }

    pub fn owns(&self, local: Local) -> bool {
        local.owner() == self.owner && local.index() < self.locals.len()
    }

    pub fn info(&self, local: Local) -> &LocalInfo {
        &self.locals[local.index()]
    }

    /// Retire `local` and free its slot. Returns `false` when it was already
    /// released.
    pub fn release(&mut self, local: Local) -> bool {
        let info = &mut self.locals[local.index()];
        if info.released {
            return false;
        }
        info.released = true;
        self.slots[info.slot as usize].free = true;
        true
    }

    /// Every declared local in declaration order, released ones included
    pub fn iter(&self) -> impl Iterator<Item = &LocalInfo> + '_ {
        self.locals.iter()
    }

    /// Declared type of every slot, in slot order
    pub fn slot_types(&self) -> Vec<VerificationType> {
        self.slots.iter().map(|slot| slot.ty.clone()).collect()
    }
}
