//! Slab storage for virtual connections.
//!
//! Connections are referred to by [`VcId`], a compact index plus a
//! generation counter. The generation catches use-after-free: once a slot
//! is freed and reused, stale ids referencing the old occupant fail to
//! resolve. That property is what makes late cross-thread re-enables
//! harmless — a re-enable racing a close finds nothing to enable.
//!
//! The id packs into a single `usize` for poller registration keys, with
//! the generation in the upper 32 bits.

use crate::vconn::NetVConnection;

/// Identifier for a virtual connection within its handler.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct VcId {
    index: u32,
    generation: u32,
}

impl VcId {
    const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Packs the id into a poller key.
    #[must_use]
    pub const fn as_key(self) -> usize {
        ((self.generation as usize) << 32) | (self.index as usize)
    }

    /// Unpacks a poller key.
    #[must_use]
    pub const fn from_key(key: usize) -> Self {
        Self {
            index: key as u32,
            generation: (key >> 32) as u32,
        }
    }
}

impl std::fmt::Display for VcId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "vc-{}.{}", self.index, self.generation)
    }
}

struct Slot {
    generation: u32,
    vc: Option<Box<NetVConnection>>,
}

/// Free-list slab of connections with generation-checked lookup.
pub(crate) struct VcSlab {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl VcSlab {
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    /// Reserves a slot and constructs the occupant with its id.
    pub(crate) fn insert_with(&mut self, build: impl FnOnce(VcId) -> NetVConnection) -> VcId {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            let id = VcId::new(index, slot.generation);
            slot.vc = Some(Box::new(build(id)));
            id
        } else {
            let index = u32::try_from(self.slots.len()).expect("slab index overflow");
            let id = VcId::new(index, 1);
            self.slots.push(Slot {
                generation: 1,
                vc: Some(Box::new(build(id))),
            });
            id
        }
    }

    pub(crate) fn get(&self, id: VcId) -> Option<&NetVConnection> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.vc.as_deref()
    }

    pub(crate) fn get_mut(&mut self, id: VcId) -> Option<&mut NetVConnection> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.vc.as_deref_mut()
    }

    pub(crate) fn contains(&self, id: VcId) -> bool {
        self.get(id).is_some()
    }

    /// Frees the slot, bumping its generation so stale ids miss.
    pub(crate) fn remove(&mut self, id: VcId) -> Option<Box<NetVConnection>> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let vc = slot.vc.take()?;
        slot.generation = slot.generation.wrapping_add(1).max(1);
        self.free.push(id.index);
        Some(vc)
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }
}
