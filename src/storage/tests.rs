//! Tests for global tables and local frames

use super::*;
use crate::config::StorageConfig;
use crate::object::{Class, ObjectHeader, ObjectPtr};
use crate::reference::{ObjectType, Reference};
use crate::roots::{FrameKind, GcRoot, MarkState, MemRange, RootType, StackFrame, StackWalker, VRegInfo};
use proptest::prelude::*;
use std::collections::HashSet;
use std::ops::ControlFlow;
use std::sync::Arc;

static OBJECT_CLASS: Class = Class::new_static("std.core.Object");
static STRING_CLASS: Class = Class::new_static("std.core.String");

/// Test helper: contiguous run of published object headers
struct TestHeap {
    headers: Vec<ObjectHeader>,
}

impl TestHeap {
    fn new(count: usize, class: &'static Class) -> Self {
        Self {
            headers: (0..count).map(|_| ObjectHeader::new(class)).collect(),
        }
    }

    fn obj(&self, i: usize) -> ObjectPtr {
        ObjectPtr::from_header(&self.headers[i])
    }

    fn index_of(&self, obj: ObjectPtr) -> Option<usize> {
        let size = std::mem::size_of::<ObjectHeader>();
        let offset = obj.addr().checked_sub(self.headers.as_ptr() as usize)?;
        let index = offset / size;
        (offset % size == 0 && index < self.headers.len()).then_some(index)
    }
}

/// Updater moving every object of `from` to the same index in `to`
fn relocate<'a>(from: &'a TestHeap, to: &'a TestHeap) -> impl FnMut(&mut ObjectPtr) -> bool + 'a {
    move |obj| match from.index_of(*obj) {
        Some(index) => {
            *obj = to.obj(index);
            true
        }
        None => false,
    }
}

fn global_table(config: &StorageConfig) -> ArrayStorage {
    ArrayStorage::new(
        ObjectType::Global,
        config.global_initial_capacity,
        config.global_max_size,
        true,
        config,
    )
}

fn local_storage(config: &StorageConfig) -> ReferenceStorage {
    let global = Arc::new(GlobalObjectStorage::new(config));
    let mut storage = ReferenceStorage::new(global, None, config);
    assert!(storage.init());
    storage
}

/// Test helper: native frame owning a range of slot addresses
struct SlotFrame(MemRange);

impl StackFrame for SlotFrame {
    fn kind(&self) -> FrameKind {
        FrameKind::Native
    }

    fn method_name(&self) -> &str {
        "native"
    }

    fn contains_slot(&self, addr: usize) -> bool {
        self.0.contains(addr)
    }

    fn for_each_object_vreg(&mut self, _f: &mut dyn FnMut(VRegInfo, &mut ObjectPtr)) {}
}

struct SlotStack(Vec<MemRange>);

impl StackWalker for SlotStack {
    fn walk(&self, f: &mut dyn FnMut(&mut dyn StackFrame) -> ControlFlow<()>) {
        for range in &self.0 {
            if f(&mut SlotFrame(*range)).is_break() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod array_tests {
    use super::*;

    #[test]
    fn test_add_get_remove() {
        let config = StorageConfig::small();
        let heap = TestHeap::new(2, &OBJECT_CLASS);
        let table = global_table(&config);

        let r = table.add(heap.obj(0)).unwrap();
        assert_eq!(r.kind(), ObjectType::Global);
        assert_eq!(table.get(r), Some(heap.obj(0)));
        assert_eq!(table.len(), 1);
        assert!(table.is_valid_ref(r));

        table.remove(r);
        assert_eq!(table.len(), 0);
        assert!(!table.is_valid_ref(r));
        assert_eq!(table.get(r), None);
    }

    #[test]
    fn test_freed_index_is_reused() {
        let config = StorageConfig::small();
        let heap = TestHeap::new(4, &OBJECT_CLASS);
        let table = global_table(&config);

        let r1 = table.add(heap.obj(0)).unwrap();
        let r2 = table.add(heap.obj(1)).unwrap();
        let r3 = table.add(heap.obj(2)).unwrap();
        table.remove(r2);
        let r4 = table.add(heap.obj(3)).unwrap();

        assert_eq!(r4.index(), r2.index());
        assert_eq!(table.get(r1), Some(heap.obj(0)));
        assert_eq!(table.get(r3), Some(heap.obj(2)));
        assert_eq!(table.get(r4), Some(heap.obj(3)));
    }

    #[test]
    fn test_growth_preserves_entries() {
        let config = StorageConfig::small();
        let heap = TestHeap::new(8, &OBJECT_CLASS);
        let table = global_table(&config);
        assert_eq!(table.capacity(), 4);

        let refs: Vec<Reference> = (0..5).map(|i| table.add(heap.obj(i)).unwrap()).collect();
        assert_eq!(table.capacity(), 8);

        for (i, r) in refs.iter().enumerate() {
            assert_eq!(table.get(*r), Some(heap.obj(i)));
        }
    }

    #[test]
    fn test_growth_stops_at_max_size() {
        let config = StorageConfig::small();
        let heap = TestHeap::new(17, &STRING_CLASS);
        let table = global_table(&config);

        for i in 0..16 {
            assert!(table.add(heap.obj(i)).is_some(), "add {} failed", i);
        }
        assert_eq!(table.capacity(), 16);
        assert!(table.add(heap.obj(16)).is_none());
        assert_eq!(table.len(), 16);
    }

    #[test]
    fn test_fixed_table_exhaustion() {
        let config = StorageConfig::small();
        let heap = TestHeap::new(5, &OBJECT_CLASS);
        let table = ArrayStorage::new(ObjectType::GlobalFixed, 4, 4, false, &config);
        assert_eq!(table.capacity(), 4);

        let refs: Vec<Reference> = (0..4).map(|i| table.add(heap.obj(i)).unwrap()).collect();
        assert!(table.add(heap.obj(4)).is_none());

        table.remove(refs[1]);
        assert!(table.add(heap.obj(4)).is_some());
    }

    #[test]
    fn test_double_remove_is_ignored() {
        let config = StorageConfig::small();
        let heap = TestHeap::new(2, &OBJECT_CLASS);
        let table = global_table(&config);

        let r = table.add(heap.obj(0)).unwrap();
        table.add(heap.obj(1)).unwrap();
        table.remove(r);
        table.remove(r);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_fixed_address_is_stable() {
        let config = StorageConfig::small();
        let from = TestHeap::new(2, &OBJECT_CLASS);
        let to = TestHeap::new(2, &OBJECT_CLASS);
        let table = ArrayStorage::new(ObjectType::GlobalFixed, 4, 4, false, &config);

        let r = table.add(from.obj(1)).unwrap();
        let slot = table.address_for_ref(r).unwrap();
        assert_eq!(unsafe { *slot.as_ptr() }, Slot::Occupied(from.obj(1)));

        table.update_moved_refs(relocate(&from, &to));
        assert_eq!(table.address_for_ref(r), Some(slot));
        assert_eq!(unsafe { *slot.as_ptr() }, Slot::Occupied(to.obj(1)));
    }

    #[test]
    fn test_resizable_table_has_no_stable_address() {
        let config = StorageConfig::small();
        let heap = TestHeap::new(1, &OBJECT_CLASS);
        let table = global_table(&config);

        let r = table.add(heap.obj(0)).unwrap();
        assert!(table.address_for_ref(r).is_none());
    }

    #[test]
    fn test_update_moved_refs_relocates_every_entry() {
        let config = StorageConfig::small();
        let from = TestHeap::new(6, &OBJECT_CLASS);
        let to = TestHeap::new(6, &OBJECT_CLASS);
        let table = global_table(&config);

        let refs: Vec<Reference> = (0..6).map(|i| table.add(from.obj(i)).unwrap()).collect();
        table.remove(refs[2]);

        assert_eq!(table.update_moved_refs(relocate(&from, &to)), 5);
        for (i, r) in refs.iter().enumerate().filter(|(i, _)| *i != 2) {
            assert!(table.is_valid_ref(*r));
            assert_eq!(table.get(*r), Some(to.obj(i)));
        }
    }

    #[test]
    fn test_unchanged_pointers_are_not_counted() {
        let config = StorageConfig::small();
        let heap = TestHeap::new(3, &OBJECT_CLASS);
        let table = global_table(&config);
        for i in 0..3 {
            table.add(heap.obj(i)).unwrap();
        }

        assert_eq!(table.update_moved_refs(|_| false), 0);
        assert_eq!(table.all_objects().len(), 3);
    }

    #[test]
    fn test_visit_objects_reports_root_type() {
        let config = StorageConfig::small();
        let heap = TestHeap::new(3, &OBJECT_CLASS);
        let table = global_table(&config);
        for i in 0..3 {
            table.add(heap.obj(i)).unwrap();
        }

        let mut seen = HashSet::new();
        let visited = table.visit_objects(
            |root: &GcRoot| {
                assert_eq!(root.root_type(), RootType::NativeGlobal);
                assert!(root.from_object().is_none());
                seen.insert(root.object());
            },
            RootType::NativeGlobal,
        );
        assert_eq!(visited, 3);
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn test_clear_weak_refs_keeps_slots() {
        let config = StorageConfig::small();
        let heap = TestHeap::new(4, &OBJECT_CLASS);
        let table = ArrayStorage::new(ObjectType::Weak, 4, 16, true, &config);

        let refs: Vec<Reference> = (0..4).map(|i| table.add(heap.obj(i)).unwrap()).collect();
        let dead = [heap.obj(1), heap.obj(3)];

        assert_eq!(table.clear_weak_refs(|obj| dead.contains(&obj)), 2);
        assert_eq!(table.len(), 4);
        assert_eq!(table.get(refs[0]), Some(heap.obj(0)));
        assert_eq!(table.get(refs[1]), None);
        assert!(table.is_valid_ref(refs[1]));
        assert_eq!(table.get(refs[3]), None);

        table.remove(refs[1]);
        assert_eq!(table.len(), 3);
        assert!(!table.is_valid_ref(refs[1]));
    }

    #[test]
    fn test_class_histogram_orders_by_count() {
        let config = StorageConfig::small();
        let strings = TestHeap::new(3, &STRING_CLASS);
        let objects = TestHeap::new(1, &OBJECT_CLASS);
        let table = global_table(&config);

        for i in 0..3 {
            table.add(strings.obj(i)).unwrap();
        }
        table.add(objects.obj(0)).unwrap();

        let histogram = table.class_histogram(10);
        assert_eq!(
            histogram,
            vec![
                ("std.core.String".to_string(), 3),
                ("std.core.Object".to_string(), 1),
            ]
        );
        assert_eq!(table.class_histogram(1).len(), 1);
    }

    #[test]
    #[should_panic]
    fn test_local_kind_is_not_table_backed() {
        let config = StorageConfig::small();
        ArrayStorage::new(ObjectType::Local, 4, 4, true, &config);
    }
}

#[cfg(test)]
mod global_tests {
    use super::*;

    struct MarkedSet(HashSet<ObjectPtr>);

    impl MarkState for MarkedSet {
        fn is_marked(&self, obj: ObjectPtr) -> bool {
            self.0.contains(&obj)
        }
    }

    #[test]
    fn test_dispatch_by_kind() {
        let config = StorageConfig::small();
        let heap = TestHeap::new(3, &OBJECT_CLASS);
        let global = GlobalObjectStorage::new(&config);

        let g = global.add(heap.obj(0), ObjectType::Global).unwrap();
        let f = global.add(heap.obj(1), ObjectType::GlobalFixed).unwrap();
        let w = global.add(heap.obj(2), ObjectType::Weak).unwrap();

        assert_eq!(g.kind(), ObjectType::Global);
        assert_eq!(f.kind(), ObjectType::GlobalFixed);
        assert_eq!(w.kind(), ObjectType::Weak);
        assert_eq!(global.get(f), Some(heap.obj(1)));
        assert_eq!(global.len(), 3);
        assert_eq!(global.len_of(ObjectType::Weak), 1);
        assert_eq!(global.len_of(ObjectType::Local), 0);

        global.remove(g);
        assert!(!global.is_valid_global_ref(g));
        assert!(global.is_valid_global_ref(w));
        assert_eq!(global.len(), 2);
    }

    #[test]
    fn test_local_kind_is_rejected() {
        let config = StorageConfig::small();
        let heap = TestHeap::new(1, &OBJECT_CLASS);
        let global = GlobalObjectStorage::new(&config);

        assert!(global.add(heap.obj(0), ObjectType::Local).is_none());
        assert!(global.is_empty());
    }

    #[test]
    fn test_fixed_address_for_ref() {
        let config = StorageConfig::small();
        let heap = TestHeap::new(1, &OBJECT_CLASS);
        let global = GlobalObjectStorage::new(&config);

        let f = global.add(heap.obj(0), ObjectType::GlobalFixed).unwrap();
        let slot = global.address_for_ref(f).unwrap();
        assert_eq!(unsafe { (*slot.as_ptr()).object() }, Some(heap.obj(0)));
    }

    #[test]
    #[should_panic(expected = "stable addresses")]
    fn test_address_for_resizable_ref_panics() {
        let config = StorageConfig::small();
        let heap = TestHeap::new(1, &OBJECT_CLASS);
        let global = GlobalObjectStorage::new(&config);

        let g = global.add(heap.obj(0), ObjectType::Global).unwrap();
        global.address_for_ref(g);
    }

    #[test]
    fn test_visit_and_update_cover_all_tables() {
        let config = StorageConfig::small();
        let from = TestHeap::new(3, &OBJECT_CLASS);
        let to = TestHeap::new(3, &OBJECT_CLASS);
        let global = GlobalObjectStorage::new(&config);

        let refs = [
            global.add(from.obj(0), ObjectType::Global).unwrap(),
            global.add(from.obj(1), ObjectType::GlobalFixed).unwrap(),
            global.add(from.obj(2), ObjectType::Weak).unwrap(),
        ];

        let mut visited = 0;
        global.visit_objects(|_: &GcRoot| visited += 1, RootType::NativeGlobal);
        assert_eq!(visited, 2);

        assert_eq!(global.update_moved_refs(relocate(&from, &to)), 3);
        for (i, r) in refs.iter().enumerate() {
            assert_eq!(global.get(*r), Some(to.obj(i)));
        }
    }

    #[test]
    fn test_clear_unmarked_weak_refs() {
        let config = StorageConfig::small();
        let heap = TestHeap::new(3, &OBJECT_CLASS);
        let global = GlobalObjectStorage::new(&config);

        let weak: Vec<Reference> = (0..3)
            .map(|i| global.add(heap.obj(i), ObjectType::Weak).unwrap())
            .collect();
        let strong = global.add(heap.obj(1), ObjectType::Global).unwrap();
        let marked = MarkedSet([heap.obj(0)].into_iter().collect());

        let cleared = global.clear_unmarked_weak_refs(&marked, |obj| obj != heap.obj(2));
        assert_eq!(cleared, 1);
        assert_eq!(global.get(weak[0]), Some(heap.obj(0)));
        assert_eq!(global.get(weak[1]), None);
        assert_eq!(global.get(weak[2]), Some(heap.obj(2)));
        assert_eq!(global.get(strong), Some(heap.obj(1)));
        assert_eq!(global.len_of(ObjectType::Weak), 3);
    }

    #[test]
    fn test_weak_entries_are_not_roots() {
        let config = StorageConfig::small();
        let heap = TestHeap::new(2, &OBJECT_CLASS);
        let global = GlobalObjectStorage::new(&config);

        let weak = global.add(heap.obj(0), ObjectType::Weak).unwrap();
        let strong = global.add(heap.obj(1), ObjectType::Global).unwrap();

        let mut marked = HashSet::new();
        let visited = global.visit_objects(|root: &GcRoot| {
            marked.insert(root.object());
        }, RootType::NativeGlobal);
        assert_eq!(visited, 1);
        assert!(!marked.contains(&heap.obj(0)));

        assert_eq!(global.clear_unmarked_weak_refs(&MarkedSet(marked), |_| true), 1);
        assert_eq!(global.get(weak), None);
        assert!(global.is_valid_global_ref(weak));
        assert_eq!(global.get(strong), Some(heap.obj(1)));
    }

    #[test]
    fn test_dump_classes() {
        let config = StorageConfig::small();
        let strings = TestHeap::new(2, &STRING_CLASS);
        let global = GlobalObjectStorage::new(&config);
        global.add(strings.obj(0), ObjectType::Global).unwrap();
        global.add(strings.obj(1), ObjectType::Global).unwrap();

        assert_eq!(
            global.dump_classes(ObjectType::Global, 5),
            vec![("std.core.String".to_string(), 2)]
        );
        assert!(global.dump_classes(ObjectType::Weak, 5).is_empty());
        assert_eq!(global.all_objects().len(), 2);
    }
}

#[cfg(test)]
mod local_tests {
    use super::*;

    #[test]
    fn test_uninitialized_storage_refuses_locals() {
        let config = StorageConfig::small();
        let heap = TestHeap::new(1, &OBJECT_CLASS);
        let global = Arc::new(GlobalObjectStorage::new(&config));
        let mut storage = ReferenceStorage::new(global, None, &config);

        assert!(!storage.is_initialized());
        assert!(storage.new_ref(Some(heap.obj(0)), ObjectType::Local).is_none());
        assert!(!storage.push_local_frame(1));

        assert!(storage.init());
        assert_eq!(storage.local_frame_count(), 1);
        assert!(storage.new_ref(Some(heap.obj(0)), ObjectType::Local).is_some());
    }

    #[test]
    fn test_null_object_yields_null_reference() {
        let config = StorageConfig::small();
        let mut storage = local_storage(&config);

        assert!(storage.new_ref(None, ObjectType::Local).is_none());
        assert!(storage.new_ref(None, ObjectType::Global).is_none());
        storage.remove_ref(None);
        assert_eq!(storage.get_object(None), None);
        assert!(!storage.is_valid_ref(None));
    }

    #[test]
    fn test_local_add_get_remove() {
        let config = StorageConfig::small();
        let heap = TestHeap::new(2, &OBJECT_CLASS);
        let mut storage = local_storage(&config);

        let a = storage.new_ref(Some(heap.obj(0)), ObjectType::Local);
        let b = storage.new_ref(Some(heap.obj(1)), ObjectType::Local);
        assert_eq!(storage.local_object_storage_size(), 2);
        assert_eq!(storage.get_object(a), Some(heap.obj(0)));
        assert_eq!(storage.ref_type(b), Some(ObjectType::Local));

        storage.remove_ref(a);
        assert_eq!(storage.local_object_storage_size(), 1);
        assert!(!storage.is_valid_ref(a));
        assert_eq!(storage.ref_type(a), None);

        storage.remove_ref(a);
        assert_eq!(storage.local_object_storage_size(), 1);
    }

    #[test]
    fn test_global_kinds_go_to_shared_tables() {
        let config = StorageConfig::small();
        let heap = TestHeap::new(2, &OBJECT_CLASS);
        let mut storage = local_storage(&config);

        let g = storage.new_ref(Some(heap.obj(0)), ObjectType::Global);
        let w = storage.new_ref(Some(heap.obj(1)), ObjectType::Weak);
        assert_eq!(storage.global_storage().len(), 2);
        assert_eq!(storage.local_object_storage_size(), 0);
        assert_eq!(storage.get_object(w), Some(heap.obj(1)));

        storage.remove_ref(g);
        assert_eq!(storage.global_storage().len(), 1);
        assert!(!storage.is_valid_ref(g));
    }

    #[test]
    fn test_stack_kind_needs_a_slot() {
        let config = StorageConfig::small();
        let heap = TestHeap::new(1, &OBJECT_CLASS);
        let mut storage = local_storage(&config);

        assert!(storage.new_ref(Some(heap.obj(0)), ObjectType::Stack).is_none());
    }

    #[test]
    fn test_push_then_pop_keeps_size() {
        let config = StorageConfig::small();
        let heap = TestHeap::new(4, &OBJECT_CLASS);
        let mut storage = local_storage(&config);
        storage.new_ref(Some(heap.obj(0)), ObjectType::Local).unwrap();
        let before = storage.local_object_storage_size();

        assert!(storage.push_local_frame(16));
        assert_eq!(storage.pop_local_frame(None), None);
        assert_eq!(storage.local_object_storage_size(), before);

        assert!(storage.push_local_frame(16));
        for i in 1..4 {
            storage.new_ref(Some(heap.obj(i)), ObjectType::Local).unwrap();
        }
        assert_eq!(storage.local_object_storage_size(), before + 3);
        assert_eq!(storage.pop_local_frame(None), None);
        assert_eq!(storage.local_object_storage_size(), before);
        assert_eq!(storage.local_frame_count(), 1);
    }

    #[test]
    fn test_pop_carries_result_to_parent() {
        let config = StorageConfig::small();
        let heap = TestHeap::new(2, &OBJECT_CLASS);
        let mut storage = local_storage(&config);

        assert!(storage.push_local_frame(4));
        storage.new_ref(Some(heap.obj(0)), ObjectType::Local).unwrap();
        let inner = storage.new_ref(Some(heap.obj(1)), ObjectType::Local);

        let outer = storage.pop_local_frame(inner);
        assert!(outer.is_some());
        assert_ne!(outer, inner);
        assert_eq!(storage.get_object(outer), Some(heap.obj(1)));
        assert!(!storage.is_valid_ref(inner));
        assert_eq!(storage.get_object(inner), None);
        assert_eq!(storage.local_object_storage_size(), 1);
    }

    #[test]
    fn test_pop_carries_global_result_as_local() {
        let config = StorageConfig::small();
        let heap = TestHeap::new(1, &OBJECT_CLASS);
        let mut storage = local_storage(&config);

        assert!(storage.push_local_frame(1));
        let global = storage.new_ref(Some(heap.obj(0)), ObjectType::Global);
        let local = storage.pop_local_frame(global);

        assert_eq!(storage.ref_type(local), Some(ObjectType::Local));
        assert!(storage.is_same_object(local, global));
        assert!(storage.is_valid_ref(global));
    }

    #[test]
    fn test_main_frame_is_never_popped() {
        let config = StorageConfig::small();
        let heap = TestHeap::new(1, &OBJECT_CLASS);
        let mut storage = local_storage(&config);

        let r = storage.new_ref(Some(heap.obj(0)), ObjectType::Local);
        assert_eq!(storage.pop_local_frame(r), r);
        assert_eq!(storage.local_frame_count(), 1);
        assert_eq!(storage.get_object(r), Some(heap.obj(0)));
    }

    #[test]
    fn test_stale_handle_does_not_alias_reused_block() {
        let config = StorageConfig::small();
        let heap = TestHeap::new(2, &OBJECT_CLASS);
        let mut storage = local_storage(&config);

        assert!(storage.push_local_frame(1));
        let stale = storage.new_ref(Some(heap.obj(0)), ObjectType::Local);
        storage.pop_local_frame(None);

        assert!(storage.push_local_frame(1));
        let fresh = storage.new_ref(Some(heap.obj(1)), ObjectType::Local);
        let (s, f) = (stale.unwrap().local_handle(), fresh.unwrap().local_handle());
        assert_eq!((s.block, s.slot), (f.block, f.slot));
        assert_ne!(s.generation, f.generation);

        assert!(!storage.is_valid_ref(stale));
        assert_eq!(storage.get_object(stale), None);
        storage.remove_ref(stale);
        assert_eq!(storage.get_object(fresh), Some(heap.obj(1)));
    }

    #[test]
    fn test_stale_handle_stays_dead_across_many_frame_reuses() {
        let config = StorageConfig::small();
        let heap = TestHeap::new(2, &OBJECT_CLASS);
        let mut storage = local_storage(&config);

        assert!(storage.push_local_frame(1));
        let stale = storage.new_ref(Some(heap.obj(0)), ObjectType::Local);
        storage.pop_local_frame(None);

        // Past the point where a 16-bit generation would wrap
        for _ in 0..70_000 {
            assert!(storage.push_local_frame(1));
            storage.pop_local_frame(None);
        }

        assert!(storage.push_local_frame(1));
        let fresh = storage.new_ref(Some(heap.obj(1)), ObjectType::Local);
        assert_eq!(stale.unwrap().local_handle().block, fresh.unwrap().local_handle().block);
        assert!(!storage.is_valid_ref(stale));
        assert_eq!(storage.get_object(stale), None);
        assert_eq!(storage.get_object(fresh), Some(heap.obj(1)));
    }

    #[test]
    fn test_frame_grows_past_one_block() {
        let config = StorageConfig::small();
        let heap = TestHeap::new(RefBlock::REFS_IN_BLOCK * 2, &OBJECT_CLASS);
        let mut storage = local_storage(&config);

        let refs: Vec<Option<Reference>> = (0..RefBlock::REFS_IN_BLOCK * 2)
            .map(|i| storage.new_ref(Some(heap.obj(i)), ObjectType::Local))
            .collect();

        assert!(refs.iter().all(Option::is_some));
        assert_eq!(storage.get_object(refs[0]), Some(heap.obj(0)));
        assert_eq!(
            storage.get_object(refs[RefBlock::REFS_IN_BLOCK + 1]),
            Some(heap.obj(RefBlock::REFS_IN_BLOCK + 1))
        );
    }

    #[test]
    fn test_local_budget_exhaustion() {
        let config = StorageConfig::small();
        let limit = config.max_local_blocks * RefBlock::REFS_IN_BLOCK;
        let heap = TestHeap::new(limit + 1, &STRING_CLASS);
        let mut storage = local_storage(&config);

        for i in 0..limit {
            assert!(storage.new_ref(Some(heap.obj(i)), ObjectType::Local).is_some());
        }
        assert!(storage.new_ref(Some(heap.obj(limit)), ObjectType::Local).is_none());
        assert_eq!(storage.local_object_storage_size(), limit);
        assert!(!storage.push_local_frame(1));
    }

    #[test]
    fn test_push_respects_budget() {
        let config = StorageConfig::small();
        let heap = TestHeap::new(RefBlock::REFS_IN_BLOCK * 7 + 1, &OBJECT_CLASS);
        let mut storage = local_storage(&config);

        assert!(!storage.push_local_frame(RefBlock::REFS_IN_BLOCK * 8));
        assert_eq!(storage.local_frame_count(), 1);

        let reserved = RefBlock::REFS_IN_BLOCK * 7;
        assert!(storage.push_local_frame(reserved));
        for i in 0..reserved {
            assert!(storage.new_ref(Some(heap.obj(i)), ObjectType::Local).is_some());
        }
        assert!(storage.new_ref(Some(heap.obj(reserved)), ObjectType::Local).is_none());

        storage.pop_local_frame(None);
        assert!(storage.push_local_frame(reserved));
    }

    #[test]
    fn test_ensure_local_capacity() {
        let config = StorageConfig::small();
        let mut storage = local_storage(&config);

        assert!(storage.ensure_local_capacity(RefBlock::REFS_IN_BLOCK));
        assert!(storage.ensure_local_capacity(RefBlock::REFS_IN_BLOCK * 7 + 1));
        assert!(!storage.ensure_local_capacity(RefBlock::REFS_IN_BLOCK * 8 + 1));
        assert!(!storage.push_local_frame(1));
    }

    #[test]
    fn test_stack_reference_reads_through_slot() {
        let mut config = StorageConfig::small();
        config.validate_refs = false;
        let heap = TestHeap::new(2, &OBJECT_CLASS);
        let storage = local_storage(&config);

        let mut slot: Option<ObjectPtr> = Some(heap.obj(0));
        let r = unsafe { storage.new_stack_ref(std::ptr::NonNull::from(&mut slot)) };
        assert_eq!(r.kind(), ObjectType::Stack);
        assert_eq!(storage.get_object(Some(r)), Some(heap.obj(0)));

        slot = Some(heap.obj(1));
        assert_eq!(storage.get_object(Some(r)), Some(heap.obj(1)));
        assert!(slot.is_some());
    }

    #[test]
    fn test_stack_reference_validation_walks_frames() {
        let config = StorageConfig::small();
        let heap = TestHeap::new(1, &OBJECT_CLASS);
        let mut slots: [Option<ObjectPtr>; 4] = [Some(heap.obj(0)), None, None, None];
        let base = slots.as_ptr() as usize;
        let frame = MemRange::new(base, base + std::mem::size_of_val(&slots));

        let global = Arc::new(GlobalObjectStorage::new(&config));
        let stack: Arc<dyn StackWalker> = Arc::new(SlotStack(vec![MemRange::new(8, 64), frame]));
        let mut storage = ReferenceStorage::new(global.clone(), Some(stack), &config);
        storage.init();

        let inside = unsafe { storage.new_stack_ref(std::ptr::NonNull::from(&mut slots[0])) };
        assert!(storage.is_valid_ref(Some(inside)));
        assert_eq!(storage.ref_type(Some(inside)), Some(ObjectType::Stack));
        assert_eq!(storage.get_object(Some(inside)), Some(heap.obj(0)));

        let mut outside: Option<ObjectPtr> = None;
        let stray = unsafe { storage.new_stack_ref(std::ptr::NonNull::from(&mut outside)) };
        assert!(!storage.is_valid_ref(Some(stray)));

        let unwalked = ReferenceStorage::new(global, None, &config);
        assert!(!unwalked.is_valid_ref(Some(inside)));
        assert!(slots[0].is_some());
    }

    #[test]
    fn test_is_same_object() {
        let config = StorageConfig::small();
        let heap = TestHeap::new(2, &OBJECT_CLASS);
        let mut storage = local_storage(&config);

        let a = storage.new_ref(Some(heap.obj(0)), ObjectType::Local);
        let b = storage.new_ref(Some(heap.obj(0)), ObjectType::Global);
        let c = storage.new_ref(Some(heap.obj(1)), ObjectType::Local);

        assert!(storage.is_same_object(a, b));
        assert!(!storage.is_same_object(a, c));
        assert!(storage.is_same_object(None, None));
        assert!(!storage.is_same_object(a, None));
    }

    #[test]
    fn test_visit_and_update_local_refs() {
        let config = StorageConfig::small();
        let from = TestHeap::new(3, &OBJECT_CLASS);
        let to = TestHeap::new(3, &OBJECT_CLASS);
        let mut storage = local_storage(&config);

        let outer = storage.new_ref(Some(from.obj(0)), ObjectType::Local);
        assert!(storage.push_local_frame(2));
        let inner = storage.new_ref(Some(from.obj(1)), ObjectType::Local);
        storage.new_ref(Some(from.obj(2)), ObjectType::Global);

        let mut seen = Vec::new();
        let visited = storage.visit_objects(
            |root: &GcRoot| {
                assert_eq!(root.root_type(), RootType::NativeLocal);
                seen.push(root.object());
            },
            RootType::NativeLocal,
        );
        assert_eq!(visited, 2);
        seen.sort();
        let mut expected = vec![from.obj(0), from.obj(1)];
        expected.sort();
        assert_eq!(seen, expected);

        assert_eq!(storage.update_moved_refs(relocate(&from, &to)), 2);
        assert_eq!(storage.get_object(outer), Some(to.obj(0)));
        assert_eq!(storage.get_object(inner), Some(to.obj(1)));
    }

    #[test]
    fn test_dump_local_ref_classes() {
        let config = StorageConfig::small();
        let strings = TestHeap::new(3, &STRING_CLASS);
        let objects = TestHeap::new(1, &OBJECT_CLASS);
        let mut storage = local_storage(&config);

        for i in 0..3 {
            storage.new_ref(Some(strings.obj(i)), ObjectType::Local).unwrap();
        }
        assert!(storage.push_local_frame(1));
        storage.new_ref(Some(objects.obj(0)), ObjectType::Local).unwrap();

        storage.dump_local_refs();
        assert_eq!(
            storage.dump_local_ref_classes(10),
            vec![
                ("std.core.String".to_string(), 3),
                ("std.core.Object".to_string(), 1),
            ]
        );
    }
}

#[derive(Debug, Clone)]
enum TableOp {
    Add(usize),
    Remove(usize),
}

fn table_op() -> impl Strategy<Value = TableOp> {
    prop_oneof![
        3 => (0usize..32).prop_map(TableOp::Add),
        2 => any::<usize>().prop_map(TableOp::Remove),
    ]
}

#[derive(Debug, Clone)]
enum FrameOp {
    Push(usize),
    Pop { carry: bool },
    Add(usize),
    Remove(usize),
}

fn frame_op() -> impl Strategy<Value = FrameOp> {
    prop_oneof![
        1 => (0usize..200).prop_map(FrameOp::Push),
        1 => any::<bool>().prop_map(|carry| FrameOp::Pop { carry }),
        4 => (0usize..32).prop_map(FrameOp::Add),
        2 => any::<usize>().prop_map(FrameOp::Remove),
    ]
}

proptest! {
    /// size == successful adds - removes, and every live reference resolves
    #[test]
    fn table_size_tracks_adds_and_removes(ops in prop::collection::vec(table_op(), 0..120)) {
        let config = StorageConfig::small();
        let heap = TestHeap::new(32, &OBJECT_CLASS);
        let table = global_table(&config);
        let mut live: Vec<(Reference, ObjectPtr)> = Vec::new();
        let mut added = 0usize;
        let mut removed = 0usize;

        for op in ops {
            match op {
                TableOp::Add(i) => {
                    if let Some(r) = table.add(heap.obj(i)) {
                        prop_assert!(live.iter().all(|(other, _)| other.index() != r.index()));
                        live.push((r, heap.obj(i)));
                        added += 1;
                    } else {
                        prop_assert_eq!(live.len(), config.global_max_size);
                    }
                }
                TableOp::Remove(pick) if !live.is_empty() => {
                    let (r, _) = live.swap_remove(pick % live.len());
                    table.remove(r);
                    removed += 1;
                }
                TableOp::Remove(_) => {}
            }
            prop_assert_eq!(table.len(), added - removed);
        }

        for (r, obj) in &live {
            prop_assert_eq!(table.get(*r), Some(*obj));
        }
    }

    /// Relocating by a fixed offset keeps every reference valid
    #[test]
    fn relocation_keeps_references_valid(count in 1usize..16, removed in prop::collection::vec(any::<bool>(), 16)) {
        let config = StorageConfig::small();
        let from = TestHeap::new(16, &OBJECT_CLASS);
        let to = TestHeap::new(16, &OBJECT_CLASS);
        let global = GlobalObjectStorage::new(&config);

        let mut live = Vec::new();
        for i in 0..count {
            let r = global.add(from.obj(i), ObjectType::Global).unwrap();
            if removed[i] {
                global.remove(r);
            } else {
                live.push((r, i));
            }
        }

        prop_assert_eq!(global.update_moved_refs(relocate(&from, &to)), live.len());
        for (r, i) in live {
            prop_assert!(global.is_valid_global_ref(r));
            prop_assert_eq!(global.get(r), Some(to.obj(i)));
        }
    }

    /// Local storage size matches a frame-by-frame model
    #[test]
    fn local_frames_match_model(ops in prop::collection::vec(frame_op(), 0..150)) {
        let config = StorageConfig::small();
        let heap = TestHeap::new(32, &OBJECT_CLASS);
        let mut storage = local_storage(&config);
        let mut frames: Vec<Vec<(Reference, ObjectPtr)>> = vec![Vec::new()];

        for op in ops {
            match op {
                FrameOp::Push(capacity) => {
                    if storage.push_local_frame(capacity) {
                        frames.push(Vec::new());
                    }
                }
                FrameOp::Pop { carry } => {
                    if frames.len() > 1 {
                        let popped = frames.pop().unwrap_or_default();
                        let result = if carry { popped.first().copied() } else { None };
                        let carried = storage.pop_local_frame(result.map(|(r, _)| r));
                        for (stale, _) in &popped {
                            prop_assert!(!storage.is_valid_ref(Some(*stale)));
                        }
                        match (result, carried) {
                            (Some((_, obj)), Some(r)) => {
                                prop_assert_eq!(storage.get_object(Some(r)), Some(obj));
                                if let Some(top) = frames.last_mut() {
                                    top.push((r, obj));
                                }
                            }
                            (None, carried) => prop_assert!(carried.is_none()),
                            (Some(_), None) => {}
                        }
                    }
                }
                FrameOp::Add(i) => {
                    if let Some(r) = storage.new_ref(Some(heap.obj(i)), ObjectType::Local) {
                        if let Some(top) = frames.last_mut() {
                            top.push((r, heap.obj(i)));
                        }
                    }
                }
                FrameOp::Remove(pick) => {
                    if let Some(top) = frames.last_mut() {
                        if !top.is_empty() {
                            let (r, _) = top.swap_remove(pick % top.len());
                            storage.remove_ref(Some(r));
                        }
                    }
                }
            }

            let expected: usize = frames.iter().map(Vec::len).sum();
            prop_assert_eq!(storage.local_object_storage_size(), expected);
            prop_assert_eq!(storage.local_frame_count(), frames.len());
        }

        for (r, obj) in frames.iter().flatten() {
            prop_assert_eq!(storage.get_object(Some(*r)), Some(*obj));
        }
    }
}
