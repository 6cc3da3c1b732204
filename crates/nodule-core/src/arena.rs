//! Slot storage with stable handles and an explicit order.
//!
//! Datasets expose regions both by handle ([`RegionId`]) and by position
//! (detection or merge order). Removing a region frees its slot and drops
//! its handle from the order vector, so every later position shifts down
//! by one without any per-clump bookkeeping, while handles held elsewhere
//! (clumps, linkage) stay valid. A freed slot is reused with a bumped
//! generation so stale handles never alias a new region.

use std::fmt;

/// Stable handle to a region stored in a [`RegionArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionId {
    slot: usize,
    generation: u32,
}

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}v{}", self.slot, self.generation)
    }
}

#[derive(Debug, Clone)]
struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Ordered slot map keyed by [`RegionId`].
#[derive(Debug, Clone)]
pub struct RegionArena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<usize>,
    order: Vec<RegionId>,
}

impl<T> Default for RegionArena<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            order: Vec::new(),
        }
    }
}

impl<T> RegionArena<T> {
    /// Create an empty arena.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.order.len()
    }

    /// Returns `true` if no entries are live.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Append a value at the end of the order and return its handle.
    pub fn insert(&mut self, value: T) -> RegionId {
        let id = if let Some(slot) = self.free.pop() {
            let entry = &mut self.slots[slot];
            entry.generation = entry.generation.wrapping_add(1);
            entry.value = Some(value);
            RegionId {
                slot,
                generation: entry.generation,
            }
        } else {
            self.slots.push(Slot {
                generation: 0,
                value: Some(value),
            });
            RegionId {
                slot: self.slots.len() - 1,
                generation: 0,
            }
        };
        self.order.push(id);
        id
    }

    /// Remove an entry, returning its value and former position.
    pub fn remove(&mut self, id: RegionId) -> Option<(usize, T)> {
        let position = self.position(id)?;
        let value = self.slots.get_mut(id.slot)?.value.take()?;
        self.order.remove(position);
        self.free.push(id.slot);
        Some((position, value))
    }

    /// Whether `id` refers to a live entry.
    #[must_use]
    pub fn contains(&self, id: RegionId) -> bool {
        self.get(id).is_some()
    }

    /// Borrow the value behind `id`.
    #[must_use]
    pub fn get(&self, id: RegionId) -> Option<&T> {
        self.slots
            .get(id.slot)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.value.as_ref())
    }

    /// Mutably borrow the value behind `id`.
    pub fn get_mut(&mut self, id: RegionId) -> Option<&mut T> {
        self.slots
            .get_mut(id.slot)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.value.as_mut())
    }

    /// Current position of `id` in the order.
    #[must_use]
    pub fn position(&self, id: RegionId) -> Option<usize> {
        if !self.contains(id) {
            return None;
        }
        self.order.iter().position(|&o| o == id)
    }

    /// Handle at a position.
    #[must_use]
    pub fn id_at(&self, index: usize) -> Option<RegionId> {
        self.order.get(index).copied()
    }

    /// Handles in order.
    #[must_use]
    pub fn ids(&self) -> &[RegionId] {
        &self.order
    }

    /// Iterate `(handle, value)` pairs in order.
    pub fn iter(&self) -> impl Iterator<Item = (RegionId, &T)> {
        self.order
            .iter()
            .filter_map(|&id| self.get(id).map(|v| (id, v)))
    }

    /// Remove every entry. Outstanding handles become stale.
    pub fn clear(&mut self) {
        for id in std::mem::take(&mut self.order) {
            if let Some(slot) = self.slots.get_mut(id.slot) {
                slot.value = None;
            }
            self.free.push(id.slot);
        }
    }

    /// Verify that the order vector lists every live slot exactly once.
    ///
    /// # Errors
    ///
    /// Returns a description of the first inconsistency found.
    pub fn check(&self) -> Result<(), String> {
        let live = self.slots.iter().filter(|s| s.value.is_some()).count();
        if live != self.order.len() {
            return Err(format!(
                "{} live slots but {} ordered handles",
                live,
                self.order.len()
            ));
        }
        let mut seen = vec![false; self.slots.len()];
        for &id in &self.order {
            if !self.contains(id) {
                return Err(format!("ordered handle {id} is stale"));
            }
            if std::mem::replace(&mut seen[id.slot], true) {
                return Err(format!("handle {id} is ordered twice"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn insert_appends_in_order() {
        let mut arena = RegionArena::new();
        let a = arena.insert("a");
        let b = arena.insert("b");
        assert_eq!(arena.ids(), &[a, b]);
        assert_eq!(arena.position(b), Some(1));
    }

    #[test]
    fn remove_shifts_later_positions() {
        let mut arena = RegionArena::new();
        let ids: Vec<_> = (0..4).map(|i| arena.insert(i)).collect();
        let (pos, value) = arena.remove(ids[1]).unwrap();
        assert_eq!((pos, value), (1, 1));
        assert_eq!(arena.position(ids[3]), Some(2));
        assert_eq!(arena.position(ids[0]), Some(0));
        assert!(arena.check().is_ok());
    }

    #[test]
    fn reused_slot_invalidates_old_handle() {
        let mut arena = RegionArena::new();
        let old = arena.insert(10);
        arena.remove(old).unwrap();
        let new = arena.insert(20);
        assert!(arena.get(old).is_none(), "stale handle must not alias");
        assert_eq!(arena.get(new), Some(&20));
        assert_ne!(old, new);
    }

    #[test]
    fn removing_twice_is_none() {
        let mut arena = RegionArena::new();
        let a = arena.insert(());
        assert!(arena.remove(a).is_some());
        assert!(arena.remove(a).is_none());
    }

    #[test]
    fn clear_makes_handles_stale() {
        let mut arena = RegionArena::new();
        let a = arena.insert(1);
        arena.clear();
        assert!(arena.is_empty());
        assert!(!arena.contains(a));
        assert!(arena.check().is_ok());
    }

    #[test]
    fn iter_follows_order() {
        let mut arena = RegionArena::new();
        let a = arena.insert('a');
        let b = arena.insert('b');
        let c = arena.insert('c');
        arena.remove(b).unwrap();
        let d = arena.insert('d');
        let seen: Vec<_> = arena.iter().map(|(id, v)| (id, *v)).collect();
        assert_eq!(seen, vec![(a, 'a'), (c, 'c'), (d, 'd')]);
    }
}
