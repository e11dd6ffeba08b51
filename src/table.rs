//! Promise table
//!
//! Every promise owns one slot in a generation-checked slab. The slab holds
//! only weak handles, so a promise that nothing references any more is
//! dropped (without running) and releases its slot; the next promise to use
//! that slot gets a higher generation and stale ids stop resolving.

use std::fmt;

use parking_lot::Mutex;
use serde::Serialize;

use crate::promise::{Promise, WeakPromise};

/// Stable identity of a promise: slot index plus generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PromiseId {
    index: u32,
    generation: u32,
}

impl PromiseId {
    pub const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    pub const fn index(self) -> u32 {
        self.index
    }

    pub const fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Display for PromiseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

enum Slot {
    Occupied { generation: u32, promise: WeakPromise },
    Vacant { generation: u32 },
}

impl Slot {
    fn generation(&self) -> u32 {
        match self {
            Slot::Occupied { generation, .. } | Slot::Vacant { generation } => *generation,
        }
    }
}

#[derive(Default)]
struct Slab {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

/// Weak registry of every live promise, shared by one execution boundary.
///
/// Upgraded promises are always returned to the caller and dropped outside
/// the lock; a promise's drop re-enters `release`.
#[derive(Default)]
pub struct PromiseTable {
    slab: Mutex<Slab>,
}

impl PromiseTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a slot and build the promise that will own it
    pub(crate) fn insert_with(&self, build: impl FnOnce(PromiseId) -> Promise) -> Promise {
        let mut slab = self.slab.lock();
        let id = match slab.free.pop() {
            Some(index) => PromiseId::new(index, slab.slots[index as usize].generation()),
            None => {
                let index = slab.slots.len() as u32;
                slab.slots.push(Slot::Vacant { generation: 0 });
                PromiseId::new(index, 0)
            }
        };
        let promise = build(id);
        slab.slots[id.index as usize] = Slot::Occupied {
            generation: id.generation,
            promise: promise.downgrade(),
        };
        slab.live += 1;
        promise
    }

    /// Look up a live promise. Stale ids and reclaimed promises yield `None`.
    pub fn get(&self, id: PromiseId) -> Option<Promise> {
        let slab = self.slab.lock();
        match slab.slots.get(id.index as usize) {
            Some(Slot::Occupied {
                generation,
                promise,
            }) if *generation == id.generation => promise.upgrade(),
            _ => None,
        }
    }

    /// Free the slot of a dropped promise. A stale id is ignored.
    pub(crate) fn release(&self, id: PromiseId) {
        let mut slab = self.slab.lock();
        let Some(slot) = slab.slots.get_mut(id.index as usize) else {
            return;
        };
        match slot {
            Slot::Occupied { generation, .. } if *generation == id.generation => {
                *slot = Slot::Vacant {
                    generation: generation.wrapping_add(1),
                };
            }
            _ => return,
        }
        slab.free.push(id.index);
        slab.live -= 1;
    }

    /// Number of promises still referenced somewhere
    pub fn live(&self) -> usize {
        self.slab.lock().live
    }

    pub fn capacity(&self) -> usize {
        self.slab.lock().slots.len()
    }
}

impl fmt::Debug for PromiseTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slab = self.slab.lock();
        f.debug_struct("PromiseTable")
            .field("live", &slab.live)
            .field("capacity", &slab.slots.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::promise::{PromiseSpec, Site};
    use crate::runtime::ExecutionBoundary;
    use crate::value::Value;

    #[test]
    fn test_id_display() {
        assert_eq!(PromiseId::new(3, 1).to_string(), "#3.1");
    }

    #[test]
    fn test_slot_reuse_bumps_generation() {
        let b = ExecutionBoundary::new(EngineConfig::default().with_workers(1)).unwrap();
        let first = b.defer(PromiseSpec::new(Site::host()), Box::new(|| Ok(Value::Unit)), None);
        let first_id = first.id();
        drop(first);

        let second = b.defer(PromiseSpec::new(Site::host()), Box::new(|| Ok(Value::Unit)), None);
        assert_eq!(second.id().index(), first_id.index());
        assert_eq!(second.id().generation(), first_id.generation() + 1);
        assert!(b.table().get(first_id).is_none());
        assert!(b.table().get(second.id()).is_some());
        assert_eq!(b.table().capacity(), 1);
    }

    #[test]
    fn test_live_count_tracks_drops() {
        let b = ExecutionBoundary::new(EngineConfig::default().with_workers(1)).unwrap();
        let promises: Vec<_> = (0..10)
            .map(|n| {
                b.defer(
                    PromiseSpec::new(Site::host()),
                    Box::new(move || Ok(Value::Int(n))),
                    None,
                )
            })
            .collect();
        assert_eq!(b.table().live(), 10);
        drop(promises);
        assert_eq!(b.table().live(), 0);
    }

    #[test]
    fn test_stale_release_is_ignored() {
        let table = PromiseTable::new();
        table.release(PromiseId::new(5, 0));
        assert_eq!(table.live(), 0);
    }
}
