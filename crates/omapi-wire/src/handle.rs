//! Handle table: maps wire handles to published objects.
//!
//! Publishing an object gives it a nonzero `u32` handle that peers use to
//! refer back to it. The table entry is a structural reference: it keeps the
//! object resolvable while its chain is alive, and is withdrawn when the
//! chain is torn down.

use crate::object::{Object, ObjectCell};
use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};
use tracing::debug;

struct HandleSlots {
    next: u32,
    objects: HashMap<u32, Arc<ObjectCell>>,
}

impl HandleSlots {
    fn allocate(&mut self) -> u32 {
        loop {
            let candidate = self.next;
            self.next = self.next.wrapping_add(1);
            if self.next == 0 {
                self.next = 1;
            }
            if candidate != 0 && !self.objects.contains_key(&candidate) {
                return candidate;
            }
        }
    }
}

/// Thread-safe table of published objects.
#[derive(Clone)]
pub struct HandleTable {
    slots: Arc<RwLock<HandleSlots>>,
}

impl HandleTable {
    /// Create a new empty table. The first handle issued is 1.
    pub fn new() -> Self {
        Self {
            slots: Arc::new(RwLock::new(HandleSlots {
                next: 1,
                objects: HashMap::new(),
            })),
        }
    }

    /// Publish an object, returning its handle. Publishing twice returns the
    /// handle assigned the first time.
    pub fn publish(&self, object: &Object) -> u32 {
        object.assign_handle(|| {
            let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
            let id = slots.allocate();
            slots.objects.insert(id, object.cell().clone());
            debug!("OMAPI: published {} object as handle {}", object.type_name(), id);
            PublishedHandle {
                id,
                table: Arc::downgrade(&self.slots),
            }
        })
    }

    /// Resolve a handle to an owning reference, if the object is still alive.
    pub fn lookup(&self, handle: u32) -> Option<Object> {
        let cell = {
            let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
            slots.objects.get(&handle).cloned()
        }?;
        Object::revive(&cell)
    }

    /// Number of published objects.
    pub fn len(&self) -> usize {
        let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
        slots.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

/// The table entry held by a published object.
pub(crate) struct PublishedHandle {
    id: u32,
    table: Weak<RwLock<HandleSlots>>,
}

impl PublishedHandle {
    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    /// Withdraw the handle. Called during teardown, outside the chain lock.
    pub(crate) fn unpublish(&self) {
        let Some(table) = self.table.upgrade() else {
            return;
        };
        let removed = {
            let mut slots = table.write().unwrap_or_else(|e| e.into_inner());
            slots.objects.remove(&self.id)
        };
        if removed.is_some() {
            debug!("OMAPI: withdrew handle {}", self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handles_start_at_one() {
        let table = HandleTable::new();
        let a = Object::generic();
        let b = Object::generic();
        assert_eq!(table.publish(&a), 1);
        assert_eq!(table.publish(&b), 2);
        assert_eq!(table.publish(&a), 1);
        assert_eq!(table.len(), 2);
        assert_eq!(a.handle(), 1);
    }

    #[test]
    fn test_lookup_returns_same_object() {
        let table = HandleTable::new();
        let object = Object::generic();
        let handle = table.publish(&object);

        let found = table.lookup(handle).unwrap();
        assert_eq!(found, object);
        assert!(table.lookup(handle + 1).is_none());
        assert!(table.lookup(0).is_none());
    }

    #[test]
    fn test_handle_counts_as_structural_reference() {
        let table = HandleTable::new();
        let object = Object::generic();
        assert_eq!(object.ref_count(), 1);
        let handle = table.publish(&object);
        assert_eq!(object.ref_count(), 2);

        // The table alone does not keep the object alive.
        drop(object);
        assert!(table.lookup(handle).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_allocation_skips_zero_and_live_handles() {
        let mut slots = HandleSlots {
            next: u32::MAX,
            objects: HashMap::new(),
        };
        assert_eq!(slots.allocate(), u32::MAX);
        assert_eq!(slots.next, 1);

        let object = Object::generic();
        slots.objects.insert(1, object.cell().clone());
        assert_eq!(slots.allocate(), 2);
    }
}
