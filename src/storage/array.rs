//! Slot table with an intrusive free list
//!
//! Design: Contiguous `Vec<Slot>` plus a free-list head:
//! 1. `add` pops the free-list head (O(1)), doubling capacity when resizable
//! 2. `remove` pushes the index back (O(1))
//! 3. GC passes (`visit_objects`, `update_moved_refs`, weak clearing) are a
//!    single linear scan under the write lock
//!
//! A non-resizable table allocates all of its slots up front and never
//! reallocates, so slot addresses stay valid for the table's lifetime.

use core::ptr::NonNull;
use parking_lot::RwLock;
use std::collections::VecDeque;

use super::class_histogram;
use super::slot::{Slot, FREE_LIST_END};
use crate::config::StorageConfig;
use crate::logging::{log_dump_entry, log_invalid_ref, log_near_capacity, log_storage_exhausted, trace};
use crate::object::ObjectPtr;
use crate::reference::{ObjectType, Reference};
use crate::roots::{GcRoot, RootType};

struct ArrayInner {
    slots: Vec<Slot>,
    first_free: u32,
    len: usize,
    /// Indices of the most recent adds, newest at the back (dumps only)
    recent: VecDeque<u32>,
    warned_near_capacity: bool,
}

/// Table backing one reference kind of `GlobalObjectStorage`
pub struct ArrayStorage {
    kind: ObjectType,
    inner: RwLock<ArrayInner>,
    max_size: usize,
    resizable: bool,
    validate: bool,
    dump_limit: usize,
    near_capacity_margin: usize,
}

impl ArrayStorage {
    /// Create a table
    ///
    /// A non-resizable table is allocated at `max_size` immediately.
    pub fn new(
        kind: ObjectType,
        initial_capacity: usize,
        max_size: usize,
        resizable: bool,
        config: &StorageConfig,
    ) -> Self {
        assert!(kind.is_table_backed(), "{} references are not table backed", kind);
        assert!(
            max_size > 0 && max_size <= Reference::MAX_TABLE_INDEX,
            "table size {} does not fit the reference encoding",
            max_size
        );

        let capacity = if resizable {
            initial_capacity.clamp(1, max_size)
        } else {
            max_size
        };

        let mut inner = ArrayInner {
            slots: Vec::with_capacity(capacity),
            first_free: FREE_LIST_END,
            len: 0,
            recent: VecDeque::with_capacity(config.dump_limit),
            warned_near_capacity: false,
        };
        Self::extend_free_list(&mut inner, capacity);

        Self {
            kind,
            inner: RwLock::new(inner),
            max_size,
            resizable,
            validate: config.validate_refs,
            dump_limit: config.dump_limit,
            near_capacity_margin: config.near_capacity_margin,
        }
    }

    /// Append free slots up to `new_capacity`, chained in index order ahead
    /// of the current free list
    fn extend_free_list(inner: &mut ArrayInner, new_capacity: usize) {
        let old_capacity = inner.slots.len();
        if new_capacity <= old_capacity {
            return;
        }

        let old_head = inner.first_free;
        for index in old_capacity..new_capacity {
            let next = if index + 1 == new_capacity {
                old_head
            } else {
                (index + 1) as u32
            };
            inner.slots.push(Slot::Free(next));
        }
        inner.first_free = old_capacity as u32;
    }

    #[inline]
    pub fn kind(&self) -> ObjectType {
        self.kind
    }

    /// Number of live references (cleared weak entries included)
    pub fn len(&self) -> usize {
        self.inner.read().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Slots currently allocated
    pub fn capacity(&self) -> usize {
        self.inner.read().slots.len()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Store `obj` and return a reference to it
    ///
    /// Returns `None` when the table is full and cannot grow; a dump of the
    /// most recent entries is logged. Callers surface this as an
    /// out-of-references condition.
    pub fn add(&self, obj: ObjectPtr) -> Option<Reference> {
        let mut inner = self.inner.write();

        if inner.first_free == FREE_LIST_END {
            let capacity = inner.slots.len();
            if self.resizable && capacity < self.max_size {
                let new_capacity = (capacity * 2).min(self.max_size);
                trace!(
                    target: "storage",
                    kind = %self.kind,
                    from = capacity,
                    to = new_capacity,
                    "growing reference table"
                );
                Self::extend_free_list(&mut inner, new_capacity);
            } else {
                log_storage_exhausted(self.kind, capacity);
                self.dump_recent(&inner);
                return None;
            }
        }

        let index = inner.first_free;
        let next = match inner.slots[index as usize] {
            Slot::Free(next) => next,
            slot => unreachable!("free list head {} holds {:?}", index, slot),
        };
        inner.slots[index as usize] = Slot::Occupied(obj);
        inner.first_free = next;
        inner.len += 1;

        if self.dump_limit > 0 {
            if let Some(pos) = inner.recent.iter().position(|&i| i == index) {
                inner.recent.remove(pos);
            }
            if inner.recent.len() == self.dump_limit {
                inner.recent.pop_front();
            }
            inner.recent.push_back(index);
        }

        if self.max_size - inner.len <= self.near_capacity_margin && !inner.warned_near_capacity {
            inner.warned_near_capacity = true;
            log_near_capacity(self.kind, inner.len, self.max_size);
            self.dump_recent(&inner);
        }

        Some(Reference::table(self.kind, index as usize))
    }

    /// Object behind `r`; `None` for cleared weak entries and dead references
    pub fn get(&self, r: Reference) -> Option<ObjectPtr> {
        debug_assert_eq!(r.kind(), self.kind);
        let inner = self.inner.read();
        match inner.slots.get(r.index()) {
            Some(Slot::Occupied(obj)) => Some(*obj),
            Some(Slot::Cleared) => None,
            _ => {
                if self.validate {
                    log_invalid_ref("get", &r);
                }
                None
            }
        }
    }

    /// Stable address of the slot behind `r`
    ///
    /// Only fixed tables have stable slots; resizable tables return `None`.
    /// The address stays valid for the table's lifetime.
    ///
    /// Reads through the pointer bypass the table lock. They are only sound
    /// while no other thread can `add`, `remove` or update this table: at a
    /// safepoint, or from the thread that owns the reference between GC
    /// pauses. Dereferencing is the caller's `unsafe` obligation.
    pub fn address_for_ref(&self, r: Reference) -> Option<NonNull<Slot>> {
        debug_assert_eq!(r.kind(), self.kind);
        if self.resizable {
            return None;
        }
        let inner = self.inner.read();
        match inner.slots.get(r.index()) {
            Some(slot) if slot.is_live() => Some(NonNull::from(slot)),
            _ => {
                if self.validate {
                    log_invalid_ref("address_for_ref", &r);
                }
                None
            }
        }
    }

    /// Release the index behind `r`
    pub fn remove(&self, r: Reference) {
        debug_assert_eq!(r.kind(), self.kind);
        let mut inner = self.inner.write();
        let index = r.index();

        match inner.slots.get(index) {
            Some(slot) if slot.is_live() => {}
            _ => {
                if self.validate {
                    log_invalid_ref("remove", &r);
                }
                return;
            }
        }

        inner.slots[index] = Slot::Free(inner.first_free);
        inner.first_free = index as u32;
        inner.len -= 1;

        if self.max_size - inner.len > self.near_capacity_margin {
            inner.warned_near_capacity = false;
        }
    }

    /// Live reference check: in bounds and not on the free list
    pub fn is_valid_ref(&self, r: Reference) -> bool {
        if r.kind() != self.kind {
            return false;
        }
        let inner = self.inner.read();
        matches!(inner.slots.get(r.index()), Some(slot) if slot.is_live())
    }

    /// Rewrite moved objects; returns how many slots changed
    ///
    /// Runs under the write lock, so only during a GC-exclusive phase.
    pub fn update_moved_refs<F>(&self, mut updater: F) -> usize
    where
        F: FnMut(&mut ObjectPtr) -> bool,
    {
        let mut inner = self.inner.write();
        let mut updated = 0;
        for slot in inner.slots.iter_mut() {
            if let Slot::Occupied(obj) = slot {
                let mut moved = *obj;
                if updater(&mut moved) {
                    *obj = moved;
                    updated += 1;
                }
            }
        }
        updated
    }

    /// Report every held object as a root of `root_type`
    ///
    /// The visitor must not call back into this table.
    pub fn visit_objects<F>(&self, mut visitor: F, root_type: RootType) -> usize
    where
        F: FnMut(&GcRoot),
    {
        let inner = self.inner.write();
        let mut visited = 0;
        for slot in inner.slots.iter() {
            if let Slot::Occupied(obj) = slot {
                visitor(&GcRoot::new(root_type, *obj));
                visited += 1;
            }
        }
        visited
    }

    /// Null out entries whose object satisfies `pred`, keeping their indices
    pub fn clear_weak_refs<P>(&self, mut pred: P) -> usize
    where
        P: FnMut(ObjectPtr) -> bool,
    {
        debug_assert_eq!(self.kind, ObjectType::Weak, "only weak tables are cleared");
        let mut inner = self.inner.write();
        let mut cleared = 0;
        for slot in inner.slots.iter_mut() {
            if let Slot::Occupied(obj) = *slot {
                if pred(obj) {
                    *slot = Slot::Cleared;
                    cleared += 1;
                }
            }
        }
        cleared
    }

    /// Every held object (debugging aid)
    pub fn all_objects(&self) -> Vec<ObjectPtr> {
        let inner = self.inner.read();
        inner.slots.iter().filter_map(Slot::object).collect()
    }

    /// Held objects grouped by class name, most frequent first
    pub fn class_histogram(&self, top_n: usize) -> Vec<(String, usize)> {
        let inner = self.inner.read();
        class_histogram(inner.slots.iter().filter_map(Slot::object), top_n)
    }

    fn dump_recent(&self, inner: &ArrayInner) {
        let live = inner
            .recent
            .iter()
            .rev()
            .filter_map(|&index| inner.slots[index as usize].object().map(|obj| (index, obj)))
            .take(self.dump_limit);

        for (index, obj) in live {
            // Occupied slots hold live objects.
            let class_name = unsafe { obj.class_name() };
            log_dump_entry(self.kind, index as usize, class_name);
        }
    }
}
