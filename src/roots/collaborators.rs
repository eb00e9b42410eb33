//! Interfaces of the runtime pieces root enumeration drives
//!
//! None of these are implemented here. The VM supplies them; tests supply
//! fakes. All calls happen at a safepoint, so implementations may assume the
//! mutator threads are stopped.
//!
//! Updaters follow one convention: `&mut dyn FnMut(&mut ObjectPtr) -> bool`
//! rewrites the pointer in place and returns whether it changed.

use std::ops::ControlFlow;

use super::flags::{CardTableProcessedFlag, VisitGcRootFlags};
use super::gc_root::GcRoot;
use crate::object::ObjectPtr;
use crate::storage::GlobalObjectStorage;

/// Half-open address range `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemRange {
    pub start: usize,
    pub end: usize,
}

impl MemRange {
    #[inline]
    pub const fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    #[inline]
    pub const fn contains(&self, addr: usize) -> bool {
        self.start <= addr && addr < self.end
    }

    #[inline]
    pub const fn len(&self) -> usize {
        self.end - self.start
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.start >= self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Interpreter,
    Compiled,
    Native,
}

/// Where a frame keeps an object-holding vreg
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VRegInfo {
    pub index: u32,
    /// Held in a callee-saved register rather than a frame slot
    pub in_register: bool,
}

/// One live call frame
pub trait StackFrame {
    fn kind(&self) -> FrameKind;

    fn method_name(&self) -> &str;

    /// Address lies inside this frame's vreg area
    fn contains_slot(&self, addr: usize) -> bool;

    /// Call `f` for every vreg that currently holds an object
    fn for_each_object_vreg(&mut self, f: &mut dyn FnMut(VRegInfo, &mut ObjectPtr));

    /// Interpreter accumulator, when it holds an object
    fn accumulator(&mut self) -> Option<&mut ObjectPtr> {
        None
    }
}

/// Walks the frames of one thread, innermost first
pub trait StackWalker: Send + Sync {
    fn walk(&self, f: &mut dyn FnMut(&mut dyn StackFrame) -> ControlFlow<()>);
}

pub trait ManagedThread {
    fn id(&self) -> u32;

    /// Objects held directly by the thread (THREAD) and by its local
    /// reference storage (NATIVE_LOCAL)
    fn visit_gc_roots(&self, visitor: &mut dyn FnMut(&GcRoot));

    /// Rewrite the pointers reported by `visit_gc_roots`
    fn update_gc_roots(&self, updater: &mut dyn FnMut(&mut ObjectPtr) -> bool) -> usize;

    fn stack(&self) -> &dyn StackWalker;
}

pub trait ThreadManager {
    fn for_each_thread(&self, f: &mut dyn FnMut(&dyn ManagedThread));
}

pub trait MonitorPool {
    /// Call `f` with the held object of every monitor that has one
    fn for_each_monitor_object(&self, f: &mut dyn FnMut(&mut ObjectPtr));
}

pub trait StringTable {
    /// Rewrite moved strings; true when any string object moved
    fn update_moved_strings(&self, updater: &mut dyn FnMut(&mut ObjectPtr) -> bool) -> bool;
}

/// String slots emitted by ahead-of-time compilation
pub trait AotStringRoots {
    fn visit_roots(&self, young_only: bool, f: &mut dyn FnMut(ObjectPtr));

    fn update_roots(&self, updater: &mut dyn FnMut(&mut ObjectPtr) -> bool) -> usize;
}

/// A class loader context and the objects it keeps alive
pub trait ClassLinkerContext {
    fn visit_gc_roots(&self, f: &mut dyn FnMut(ObjectPtr));

    fn update_gc_roots(&self, updater: &mut dyn FnMut(&mut ObjectPtr) -> bool) -> usize;
}

/// Outgoing reference found while scanning an object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldValue {
    Strong(ObjectPtr),
    /// Weakly-tagged dynamic value; never a root
    Weak(ObjectPtr),
}

/// Per-language capabilities of the hosting VM
pub trait LanguageConfig: Send + Sync {
    fn language(&self) -> &str;

    fn is_single_threaded(&self) -> bool;

    /// Managed mirror of every loaded class selected by `flags`
    fn enumerate_classes(&self, flags: VisitGcRootFlags, f: &mut dyn FnMut(ObjectPtr));

    fn enumerate_contexts(&self, f: &mut dyn FnMut(&dyn ClassLinkerContext));

    fn traverse_object_references(&self, obj: ObjectPtr, f: &mut dyn FnMut(FieldValue));
}

pub trait CardTable {
    fn visit_marked(&self, flag: CardTableProcessedFlag, f: &mut dyn FnMut(MemRange));

    /// Mark the card covering `range` as still needing a scan
    fn mark_card(&self, range: MemRange);
}

pub trait ObjectAllocator {
    fn iterate_over_objects_in_range(&self, range: MemRange, f: &mut dyn FnMut(ObjectPtr));
}

pub trait MarkState {
    fn is_marked(&self, obj: ObjectPtr) -> bool;
}

/// Everything root enumeration needs from the VM instance
pub trait VmContext {
    fn thread_manager(&self) -> &dyn ThreadManager;

    fn global_object_storage(&self) -> &GlobalObjectStorage;

    /// `None` for single-threaded VMs
    fn monitor_pool(&self) -> Option<&dyn MonitorPool>;

    fn string_table(&self) -> &dyn StringTable;

    fn aot_string_roots(&self) -> Option<&dyn AotStringRoots> {
        None
    }

    /// Roots owned by the VM itself (preallocated exceptions, caches)
    fn visit_vm_roots(&self, visitor: &mut dyn FnMut(&GcRoot));

    fn update_vm_refs(&self, updater: &mut dyn FnMut(&mut ObjectPtr) -> bool) -> usize;
}
