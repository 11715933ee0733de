//! Fixed-capacity connection table.
//!
//! Slot indices are stable: a handle keeps its slot until it is removed,
//! and the write sweep walks slots in index order.

use crate::ble::ConnHandle;

/// Benign table misses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TableError {
    /// No empty slot left.
    Full,
    /// The handle is not registered (already removed, or never inserted).
    NotFound,
    /// The handle already occupies a slot.
    Duplicate,
}

/// Registry of up to `N` open connections.
#[derive(Clone, Debug)]
pub struct ConnectionTable<const N: usize> {
    slots: [Option<ConnHandle>; N],
}

impl<const N: usize> ConnectionTable<N> {
    pub const fn new() -> Self {
        Self { slots: [None; N] }
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    /// Empty every slot.
    pub fn reset(&mut self) {
        self.slots = [None; N];
    }

    /// Store `handle` in the lowest-indexed empty slot.
    pub fn insert(&mut self, handle: ConnHandle) -> Result<usize, TableError> {
        if self.slot_of(handle).is_some() {
            return Err(TableError::Duplicate);
        }
        let slot = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(TableError::Full)?;
        self.slots[slot] = Some(handle);
        Ok(slot)
    }

    /// Empty the slot holding `handle`.
    pub fn remove(&mut self, handle: ConnHandle) -> Result<usize, TableError> {
        let slot = self.slot_of(handle).ok_or(TableError::NotFound)?;
        self.slots[slot] = None;
        Ok(slot)
    }

    /// Handle at `slot`; `None` if empty or out of range.
    pub fn get(&self, slot: usize) -> Option<ConnHandle> {
        self.slots.get(slot).copied().flatten()
    }

    pub fn slot_of(&self, handle: ConnHandle) -> Option<usize> {
        self.slots.iter().position(|s| *s == Some(handle))
    }

    pub fn active_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_full(&self) -> bool {
        self.active_count() >= N
    }

    pub fn is_empty(&self) -> bool {
        self.active_count() == 0
    }

    /// Occupied slots as `(slot, handle)`, in index order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, ConnHandle)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.map(|h| (i, h)))
    }
}

impl<const N: usize> Default for ConnectionTable<N> {
    fn default() -> Self {
        Self::new()
    }
}
