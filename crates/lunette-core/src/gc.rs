//! Arena storage for collectable objects.
//!
//! Every object lives in a slot addressed by a `GcRef` (index + generation).
//! Freeing bumps the slot generation, so stale handles are detected instead
//! of aliasing a newer object. List membership and colors live in the
//! object's `GcHeader`; nothing is linked through the objects themselves.

use crate::object::{GcHeader, GcRef};

/// An object together with its collector header.
#[derive(Debug)]
pub struct GcBox<T> {
    pub header: GcHeader,
    pub value: T,
    /// Bytes charged to the allocation counters for this object.
    pub charged: usize,
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    cell: Option<GcBox<T>>,
}

/// Generation-checked arena.
#[derive(Debug)]
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    live: usize,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Arena {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
        }
    }

    /// Store an object and return its handle.
    pub fn insert(&mut self, header: GcHeader, value: T, charged: usize) -> GcRef {
        let cell = Some(GcBox {
            header,
            value,
            charged,
        });
        self.live += 1;
        if let Some(idx) = self.free.pop() {
            let slot = &mut self.slots[idx as usize];
            slot.cell = cell;
            GcRef::new(idx, slot.generation)
        } else {
            let idx = self.slots.len() as u32;
            self.slots.push(Slot {
                generation: 0,
                cell,
            });
            GcRef::new(idx, 0)
        }
    }

    /// Remove an object, invalidating every handle to it.
    pub fn remove(&mut self, r: GcRef) -> Option<GcBox<T>> {
        let slot = self.slots.get_mut(r.index())?;
        if slot.generation != r.generation() {
            return None;
        }
        let cell = slot.cell.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(r.index() as u32);
        self.live -= 1;
        Some(cell)
    }

    #[inline]
    pub fn get(&self, r: GcRef) -> Option<&GcBox<T>> {
        let slot = self.slots.get(r.index())?;
        if slot.generation != r.generation() {
            return None;
        }
        slot.cell.as_ref()
    }

    #[inline]
    pub fn get_mut(&mut self, r: GcRef) -> Option<&mut GcBox<T>> {
        let slot = self.slots.get_mut(r.index())?;
        if slot.generation != r.generation() {
            return None;
        }
        slot.cell.as_mut()
    }

    #[inline]
    pub fn contains(&self, r: GcRef) -> bool {
        self.get(r).is_some()
    }

    /// Number of live objects.
    #[inline]
    pub fn len(&self) -> usize {
        self.live
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Number of slots ever created (upper bound for cursors).
    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Handle of the object at slot `index`, if that slot is occupied.
    #[inline]
    pub fn handle_at(&self, index: usize) -> Option<GcRef> {
        let slot = self.slots.get(index)?;
        slot.cell
            .as_ref()
            .map(|_| GcRef::new(index as u32, slot.generation))
    }

    /// Handles of all live objects, in slot order.
    pub fn handles(&self) -> Vec<GcRef> {
        (0..self.slots.len())
            .filter_map(|i| self.handle_at(i))
            .collect()
    }
}
