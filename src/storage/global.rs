//! Global and weak reference storage owned by the VM
//!
//! Three tables, selected by the reference tag:
//! - GLOBAL: resizable, for ordinary global references
//! - GLOBAL_FIXED: fixed size, slot addresses are stable
//! - WEAK: resizable, entries are cleared (not freed) when the referent dies

use core::ptr::NonNull;

use super::array::ArrayStorage;
use super::slot::Slot;
use crate::config::StorageConfig;
use crate::logging::{debug, log_invalid_ref};
use crate::object::ObjectPtr;
use crate::reference::{ObjectType, Reference};
use crate::roots::{GcRoot, MarkState, RootType};

pub struct GlobalObjectStorage {
    global: ArrayStorage,
    global_fixed: ArrayStorage,
    weak: ArrayStorage,
}

impl GlobalObjectStorage {
    pub fn new(config: &StorageConfig) -> Self {
        debug!(
            target: "storage",
            global_max = config.global_max_size,
            fixed = config.global_fixed_size,
            weak_max = config.weak_max_size,
            "creating global object storage"
        );

        Self {
            global: ArrayStorage::new(
                ObjectType::Global,
                config.global_initial_capacity,
                config.global_max_size,
                true,
                config,
            ),
            global_fixed: ArrayStorage::new(
                ObjectType::GlobalFixed,
                config.global_fixed_size,
                config.global_fixed_size,
                false,
                config,
            ),
            weak: ArrayStorage::new(
                ObjectType::Weak,
                config.weak_initial_capacity,
                config.weak_max_size,
                true,
                config,
            ),
        }
    }

    #[inline]
    fn storage_for(&self, kind: ObjectType) -> Option<&ArrayStorage> {
        match kind {
            ObjectType::Global => Some(&self.global),
            ObjectType::GlobalFixed => Some(&self.global_fixed),
            ObjectType::Weak => Some(&self.weak),
            ObjectType::Local | ObjectType::Stack => None,
        }
    }

    /// Store `obj` in the table for `kind`
    pub fn add(&self, obj: ObjectPtr, kind: ObjectType) -> Option<Reference> {
        match self.storage_for(kind) {
            Some(storage) => storage.add(obj),
            None => {
                log_invalid_ref("add", &kind);
                None
            }
        }
    }

    pub fn get(&self, r: Reference) -> Option<ObjectPtr> {
        match self.storage_for(r.kind()) {
            Some(storage) => storage.get(r),
            None => {
                log_invalid_ref("get", &r);
                None
            }
        }
    }

    pub fn remove(&self, r: Reference) {
        match self.storage_for(r.kind()) {
            Some(storage) => storage.remove(r),
            None => log_invalid_ref("remove", &r),
        }
    }

    /// Stable slot address of a GLOBAL_FIXED reference
    ///
    /// Reads through it skip the table lock; see
    /// `ArrayStorage::address_for_ref` for when that is sound.
    ///
    /// # Panics
    /// If `r` is not a GLOBAL_FIXED reference.
    pub fn address_for_ref(&self, r: Reference) -> Option<NonNull<Slot>> {
        assert_eq!(
            r.kind(),
            ObjectType::GlobalFixed,
            "only fixed global references have stable addresses"
        );
        self.global_fixed.address_for_ref(r)
    }

    /// Report every strongly held object
    ///
    /// Weak entries are not roots: their referents stay unmarked unless
    /// something else reaches them, which is what `clear_unmarked_weak_refs`
    /// relies on.
    pub fn visit_objects<F>(&self, mut visitor: F, root_type: RootType) -> usize
    where
        F: FnMut(&GcRoot),
    {
        self.global.visit_objects(&mut visitor, root_type)
            + self.global_fixed.visit_objects(&mut visitor, root_type)
    }

    /// Rewrite moved objects in all three tables, weak entries included
    pub fn update_moved_refs<F>(&self, mut updater: F) -> usize
    where
        F: FnMut(&mut ObjectPtr) -> bool,
    {
        self.global.update_moved_refs(&mut updater)
            + self.global_fixed.update_moved_refs(&mut updater)
            + self.weak.update_moved_refs(&mut updater)
    }

    /// Clear weak entries whose object satisfies `pred`
    pub fn clear_weak_refs<P>(&self, pred: P) -> usize
    where
        P: FnMut(ObjectPtr) -> bool,
    {
        let cleared = self.weak.clear_weak_refs(pred);
        debug!(target: "storage", cleared, "weak references cleared");
        cleared
    }

    /// Clear weak entries whose object is unmarked and satisfies `pred`
    pub fn clear_unmarked_weak_refs<P>(&self, gc: &dyn MarkState, mut pred: P) -> usize
    where
        P: FnMut(ObjectPtr) -> bool,
    {
        self.clear_weak_refs(|obj| !gc.is_marked(obj) && pred(obj))
    }

    /// Every object held by any table (debugging aid)
    pub fn all_objects(&self) -> Vec<ObjectPtr> {
        let mut objects = self.global.all_objects();
        objects.extend(self.global_fixed.all_objects());
        objects.extend(self.weak.all_objects());
        objects
    }

    /// Membership check used by reference validation
    pub fn is_valid_global_ref(&self, r: Reference) -> bool {
        self.storage_for(r.kind())
            .map_or(false, |storage| storage.is_valid_ref(r))
    }

    /// Live references across all tables
    pub fn len(&self) -> usize {
        self.global.len() + self.global_fixed.len() + self.weak.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn len_of(&self, kind: ObjectType) -> usize {
        self.storage_for(kind).map_or(0, ArrayStorage::len)
    }

    pub fn capacity_of(&self, kind: ObjectType) -> usize {
        self.storage_for(kind).map_or(0, ArrayStorage::capacity)
    }

    /// Class histogram of one table
    pub fn dump_classes(&self, kind: ObjectType, top_n: usize) -> Vec<(String, usize)> {
        self.storage_for(kind)
            .map(|storage| storage.class_histogram(top_n))
            .unwrap_or_default()
    }
}
