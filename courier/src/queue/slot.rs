//! Slot storage shared by every queue.
//!
//! Slots live in an arena indexed by small integers. A freed index is
//! reused smallest-first, and each reuse bumps the index generation so a
//! stale [`SlotId`] can never reach the slot that replaced it.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::thread::ThreadId;

/// Callback invoked with the broadcast arguments.
pub type Callback<A> = Arc<dyn Fn(&A) + Send + Sync>;

/// Callback invoked once when the queue is torn down, with the last
/// broadcast arguments if any were ever sent.
pub type DestroyHandler<A> = Arc<dyn Fn(Option<&A>) + Send + Sync>;

/// Identifies a registered slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId {
    index: u32,
    generation: u32,
}

impl SlotId {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

pub(crate) enum SlotCallback<A> {
    Message(Callback<A>),
    DestroyHandler(DestroyHandler<A>),
}

pub(crate) struct Slot<A> {
    pub(crate) callback: SlotCallback<A>,
    pub(crate) locked: bool,
}

struct Entry<A> {
    generation: u32,
    slot: Option<Slot<A>>,
}

pub(crate) struct SlotTable<A> {
    entries: Vec<Entry<A>>,
    free: BTreeSet<u32>,
    // occupied indices in registration order
    order: Vec<u32>,
    max_slots: usize,
    pub(crate) last_args: Option<A>,
    pub(crate) dispatching: Vec<ThreadId>,
}

impl<A> SlotTable<A> {
    pub(crate) fn new(max_slots: usize) -> Self {
        Self {
            entries: Vec::new(),
            free: BTreeSet::new(),
            order: Vec::new(),
            max_slots,
            last_args: None,
            dispatching: Vec::new(),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.max_slots
    }

    /// All occupied slots, destroy handlers included.
    pub(crate) fn len(&self) -> usize {
        self.order.len()
    }

    /// Occupied slots that receive broadcasts.
    pub(crate) fn message_slot_count(&self) -> usize {
        self.order
            .iter()
            .filter(|&&index| {
                matches!(
                    self.slot_at(index).map(|slot| &slot.callback),
                    Some(SlotCallback::Message(_))
                )
            })
            .count()
    }

    /// Stores `callback` and returns its id, or `None` when the table is full.
    pub(crate) fn insert(&mut self, callback: SlotCallback<A>) -> Option<SlotId> {
        if self.order.len() >= self.max_slots {
            return None;
        }

        let index = match self.free.pop_first() {
            Some(index) => index,
            None => {
                self.entries.push(Entry {
                    generation: 0,
                    slot: None,
                });
                (self.entries.len() - 1) as u32
            }
        };

        let entry = &mut self.entries[index as usize];
        entry.slot = Some(Slot {
            callback,
            locked: false,
        });
        self.order.push(index);

        Some(SlotId {
            index,
            generation: entry.generation,
        })
    }

    pub(crate) fn remove(&mut self, id: SlotId) -> Option<Slot<A>> {
        let entry = self.entries.get_mut(id.index as usize)?;
        if entry.generation != id.generation {
            return None;
        }
        let slot = entry.slot.take()?;
        entry.generation = entry.generation.wrapping_add(1);
        self.free.insert(id.index);
        self.order.retain(|&index| index != id.index);
        Some(slot)
    }

    pub(crate) fn get_mut(&mut self, id: SlotId) -> Option<&mut Slot<A>> {
        let entry = self.entries.get_mut(id.index as usize)?;
        if entry.generation != id.generation {
            return None;
        }
        entry.slot.as_mut()
    }

    pub(crate) fn contains(&self, id: SlotId) -> bool {
        self.entries
            .get(id.index as usize)
            .is_some_and(|entry| entry.generation == id.generation && entry.slot.is_some())
    }

    /// Unlocked message callbacks in registration order, at most `max` of them.
    pub(crate) fn message_callbacks(&self, max: usize) -> Vec<Callback<A>> {
        self.order
            .iter()
            .filter_map(|&index| self.slot_at(index))
            .filter(|slot| !slot.locked)
            .filter_map(|slot| match &slot.callback {
                SlotCallback::Message(callback) => Some(Arc::clone(callback)),
                SlotCallback::DestroyHandler(_) => None,
            })
            .take(max)
            .collect()
    }

    /// Destroy handlers in registration order.
    pub(crate) fn destroy_handlers(&self) -> Vec<DestroyHandler<A>> {
        self.order
            .iter()
            .filter_map(|&index| self.slot_at(index))
            .filter_map(|slot| match &slot.callback {
                SlotCallback::DestroyHandler(handler) => Some(Arc::clone(handler)),
                SlotCallback::Message(_) => None,
            })
            .collect()
    }

    /// Drops every slot. Generations advance so outstanding ids go stale.
    pub(crate) fn clear(&mut self) -> Vec<Slot<A>> {
        let mut removed = Vec::with_capacity(self.order.len());
        for index in std::mem::take(&mut self.order) {
            let entry = &mut self.entries[index as usize];
            if let Some(slot) = entry.slot.take() {
                entry.generation = entry.generation.wrapping_add(1);
                self.free.insert(index);
                removed.push(slot);
            }
        }
        removed
    }

    fn slot_at(&self, index: u32) -> Option<&Slot<A>> {
        self.entries
            .get(index as usize)
            .and_then(|entry| entry.slot.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(table: &mut SlotTable<i32>) -> SlotId {
        table
            .insert(SlotCallback::Message(Arc::new(|_: &i32| {})))
            .unwrap()
    }

    #[test]
    fn test_smallest_freed_index_is_reused() {
        let mut table = SlotTable::new(8);
        let a = message(&mut table);
        let b = message(&mut table);
        let c = message(&mut table);
        assert_eq!((a.index(), b.index(), c.index()), (0, 1, 2));

        table.remove(c).unwrap();
        table.remove(a).unwrap();

        let d = message(&mut table);
        assert_eq!(d.index(), 0);
        assert_eq!(d.generation(), 1);
        let e = message(&mut table);
        assert_eq!(e.index(), 2);
    }

    #[test]
    fn test_stale_id_does_not_reach_new_slot() {
        let mut table = SlotTable::new(8);
        let old = message(&mut table);
        table.remove(old).unwrap();
        let new = message(&mut table);

        assert_eq!(old.index(), new.index());
        assert!(!table.contains(old));
        assert!(table.remove(old).is_none());
        assert!(table.contains(new));
    }

    #[test]
    fn test_capacity_counts_every_slot() {
        let mut table: SlotTable<i32> = SlotTable::new(2);
        message(&mut table);
        table
            .insert(SlotCallback::DestroyHandler(Arc::new(|_: Option<&i32>| {})))
            .unwrap();
        assert!(table.insert(SlotCallback::Message(Arc::new(|_: &i32| {}))).is_none());
        assert_eq!(table.len(), 2);
        assert_eq!(table.message_slot_count(), 1);
    }

    #[test]
    fn test_locked_slots_are_skipped() {
        let mut table = SlotTable::new(8);
        let a = message(&mut table);
        message(&mut table);
        table.get_mut(a).unwrap().locked = true;
        assert_eq!(table.message_callbacks(usize::MAX).len(), 1);
        assert_eq!(table.message_callbacks(0).len(), 0);
    }

    #[test]
    fn test_clear_invalidates_ids() {
        let mut table = SlotTable::new(8);
        let a = message(&mut table);
        assert_eq!(table.clear().len(), 1);
        assert!(!table.contains(a));
        assert_eq!(table.len(), 0);
    }
}
