//! Root enumeration and post-compaction fixup
//!
//! `RootManager` borrows the VM for one GC pause. Visiting reports every
//! category exactly once per call; updating touches the same categories in
//! a fixed order, because AOT string slots are only rewritten when the
//! string table reports that a string moved.

use std::ops::ControlFlow;
use std::sync::Arc;

use tracing::instrument;

use super::checkers::{ObjectChecker, RangeChecker};
use super::collaborators::{
    CardTable, FieldValue, FrameKind, LanguageConfig, MemRange, ObjectAllocator, StackFrame,
    VmContext,
};
use super::flags::{CardTableProcessedFlag, VisitGcRootFlags};
use super::gc_root::{GcRoot, RootType};
use crate::logging::{debug, log_refs_updated, log_roots_visited, perf, trace};
use crate::object::ObjectPtr;

type Visitor<'a> = dyn FnMut(&GcRoot) + 'a;
type Updater<'a> = dyn FnMut(&mut ObjectPtr) -> bool + 'a;

/// Pointers rewritten per category by `update_refs_to_moved_objects`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateStats {
    pub strings_moved: bool,
    pub thread_vregs: usize,
    pub monitors: usize,
    pub aot_strings: usize,
    pub thread_locals: usize,
    pub vm_refs: usize,
    pub class_linker_contexts: usize,
    pub global_storage: usize,
}

impl UpdateStats {
    pub fn total(&self) -> usize {
        self.thread_vregs
            + self.monitors
            + self.aot_strings
            + self.thread_locals
            + self.vm_refs
            + self.class_linker_contexts
            + self.global_storage
    }
}

pub struct RootManager<'vm> {
    vm: &'vm dyn VmContext,
    lang: Arc<dyn LanguageConfig>,
}

impl<'vm> RootManager<'vm> {
    pub fn new(vm: &'vm dyn VmContext, lang: Arc<dyn LanguageConfig>) -> Self {
        Self { vm, lang }
    }

    pub fn language(&self) -> &dyn LanguageConfig {
        self.lang.as_ref()
    }

    // ===== Visiting =====

    /// Report every root outside the heap; returns how many were reported
    #[instrument(target = "roots", skip_all, fields(language = self.lang.language(), flags = ?flags))]
    pub fn visit_non_heap_roots<F>(&self, mut visitor: F, flags: VisitGcRootFlags) -> usize
    where
        F: FnMut(&GcRoot),
    {
        let _perf = perf::track("visit_non_heap_roots");

        self.visit_local_roots(&mut visitor)
            + self.visit_class_roots(&mut visitor, flags)
            + self.visit_aot_string_roots(&mut visitor, flags)
            + self.visit_class_linker_context_roots(&mut visitor)
            + self.visit_vm_roots(&mut visitor)
            + self.visit_global_roots(&mut visitor)
    }

    /// Thread-held objects, then every object vreg of every live frame
    pub fn visit_local_roots(&self, visitor: &mut Visitor<'_>) -> usize {
        let mut thread_roots = 0;
        let mut frame_roots = 0;

        self.vm.thread_manager().for_each_thread(&mut |thread| {
            thread.visit_gc_roots(&mut |root| {
                visitor(root);
                thread_roots += 1;
            });

            thread.stack().walk(&mut |frame| {
                frame_roots += visit_frame(frame, visitor);
                ControlFlow::Continue(())
            });
        });

        log_roots_visited(RootType::Thread, thread_roots);
        log_roots_visited(RootType::Frame, frame_roots);
        thread_roots + frame_roots
    }

    /// Managed mirrors of loaded classes
    pub fn visit_class_roots(&self, visitor: &mut Visitor<'_>, flags: VisitGcRootFlags) -> usize {
        let mut count = 0;
        self.lang.enumerate_classes(flags.class_flags(), &mut |mirror| {
            visitor(&GcRoot::new(RootType::Class, mirror));
            count += 1;
        });
        log_roots_visited(RootType::Class, count);
        count
    }

    pub fn visit_aot_string_roots(&self, visitor: &mut Visitor<'_>, flags: VisitGcRootFlags) -> usize {
        let Some(aot) = self.vm.aot_string_roots() else {
            return 0;
        };

        let mut count = 0;
        aot.visit_roots(flags.aot_strings_young_only(), &mut |string| {
            visitor(&GcRoot::new(RootType::AotStringSlot, string));
            count += 1;
        });
        log_roots_visited(RootType::AotStringSlot, count);
        count
    }

    pub fn visit_class_linker_context_roots(&self, visitor: &mut Visitor<'_>) -> usize {
        let mut count = 0;
        self.lang.enumerate_contexts(&mut |ctx| {
            ctx.visit_gc_roots(&mut |obj| {
                visitor(&GcRoot::new(RootType::ClassLinker, obj));
                count += 1;
            });
        });
        log_roots_visited(RootType::ClassLinker, count);
        count
    }

    pub fn visit_vm_roots(&self, visitor: &mut Visitor<'_>) -> usize {
        let mut count = 0;
        self.vm.visit_vm_roots(&mut |root| {
            visitor(root);
            count += 1;
        });
        debug!(target: "roots", event = "roots_visited", category = "vm", count, "root category visited");
        count
    }

    /// Global and fixed tables as NATIVE_GLOBAL roots; weak entries are skipped
    pub fn visit_global_roots(&self, visitor: &mut Visitor<'_>) -> usize {
        let count = self
            .vm
            .global_object_storage()
            .visit_objects(|root| visitor(root), RootType::NativeGlobal);
        log_roots_visited(RootType::NativeGlobal, count);
        count
    }

    /// Report old-generation objects in marked cards as TENURED roots
    ///
    /// Ranges rejected by `range_checker` are re-marked for a later pass.
    /// Objects whose class is not yet published are skipped; weak fields are
    /// never reported.
    #[allow(clippy::too_many_arguments)]
    #[instrument(target = "roots", skip_all, fields(flag = ?processed_flag))]
    pub fn visit_card_table_roots<F, R, O, P>(
        &self,
        card_table: &dyn CardTable,
        allocator: &dyn ObjectAllocator,
        mut visitor: F,
        mut range_checker: R,
        mut range_object_checker: O,
        mut from_object_checker: P,
        processed_flag: CardTableProcessedFlag,
    ) -> usize
    where
        F: FnMut(&GcRoot),
        R: RangeChecker,
        O: ObjectChecker,
        P: ObjectChecker,
    {
        let _perf = perf::track("visit_card_table_roots");
        let lang = self.lang.as_ref();
        let mut deferred: Vec<MemRange> = Vec::new();
        let mut count = 0;

        card_table.visit_marked(processed_flag, &mut |range| {
            if !range_checker.check(range) {
                deferred.push(range);
                return;
            }

            allocator.iterate_over_objects_in_range(range, &mut |from| {
                // Reported objects are live for the duration of the pause.
                if unsafe { from.header() }.class().is_none() {
                    return;
                }
                if !from_object_checker.check(from) {
                    return;
                }

                lang.traverse_object_references(from, &mut |field| {
                    if let FieldValue::Strong(object) = field {
                        if range_object_checker.check(object) {
                            visitor(&GcRoot::tenured(from, object));
                            count += 1;
                        }
                    }
                });
            });
        });

        // Marked after the walk so the table is not modified mid-iteration.
        for range in &deferred {
            card_table.mark_card(*range);
        }

        trace!(target: "roots", deferred = deferred.len(), "card ranges deferred");
        log_roots_visited(RootType::Tenured, count);
        count
    }

    // ===== Updating =====

    /// Rewrite every root pointer after objects moved
    #[instrument(target = "roots", skip_all, fields(language = self.lang.language()))]
    pub fn update_refs_to_moved_objects<F>(&self, mut updater: F) -> UpdateStats
    where
        F: FnMut(&mut ObjectPtr) -> bool,
    {
        let _perf = perf::track("update_refs_to_moved_objects");
        let updater: &mut Updater<'_> = &mut updater;
        let mut stats = UpdateStats::default();

        stats.strings_moved = self.vm.string_table().update_moved_strings(updater);
        stats.thread_vregs = self.update_thread_vregs(updater);
        if !self.lang.is_single_threaded() {
            stats.monitors = self.update_monitors(updater);
        }
        // AOT slots only ever point into the string table.
        if stats.strings_moved {
            stats.aot_strings = self.update_aot_string_roots(updater);
        }
        stats.thread_locals = self.update_thread_locals(updater);
        stats.vm_refs = self.update_vm_refs(updater);
        stats.class_linker_contexts = self.update_class_linker_context_roots(updater);
        stats.global_storage = self.update_global_object_storage(updater);

        trace!(target: "roots", total = stats.total(), ?stats, "moved references updated");
        stats
    }

    /// Vregs of every live frame; interpreter frames also carry an accumulator
    pub fn update_thread_vregs(&self, updater: &mut Updater<'_>) -> usize {
        let mut updated = 0;
        self.vm.thread_manager().for_each_thread(&mut |thread| {
            thread.stack().walk(&mut |frame| {
                updated += update_frame(frame, updater);
                ControlFlow::Continue(())
            });
        });
        log_refs_updated("thread_vregs", updated);
        updated
    }

    pub fn update_monitors(&self, updater: &mut Updater<'_>) -> usize {
        let Some(pool) = self.vm.monitor_pool() else {
            return 0;
        };

        let mut updated = 0;
        pool.for_each_monitor_object(&mut |obj| {
            if updater(obj) {
                updated += 1;
            }
        });
        log_refs_updated("monitors", updated);
        updated
    }

    pub fn update_aot_string_roots(&self, updater: &mut Updater<'_>) -> usize {
        let updated = self
            .vm
            .aot_string_roots()
            .map_or(0, |aot| aot.update_roots(updater));
        log_refs_updated("aot_strings", updated);
        updated
    }

    pub fn update_thread_locals(&self, updater: &mut Updater<'_>) -> usize {
        let mut updated = 0;
        self.vm.thread_manager().for_each_thread(&mut |thread| {
            updated += thread.update_gc_roots(updater);
        });
        log_refs_updated("thread_locals", updated);
        updated
    }

    pub fn update_vm_refs(&self, updater: &mut Updater<'_>) -> usize {
        let updated = self.vm.update_vm_refs(updater);
        log_refs_updated("vm_refs", updated);
        updated
    }

    pub fn update_class_linker_context_roots(&self, updater: &mut Updater<'_>) -> usize {
        let mut updated = 0;
        self.lang.enumerate_contexts(&mut |ctx| {
            updated += ctx.update_gc_roots(updater);
        });
        log_refs_updated("class_linker_contexts", updated);
        updated
    }

    pub fn update_global_object_storage(&self, updater: &mut Updater<'_>) -> usize {
        let updated = self.vm.global_object_storage().update_moved_refs(updater);
        log_refs_updated("global_storage", updated);
        updated
    }
}

fn visit_frame(frame: &mut dyn StackFrame, visitor: &mut Visitor<'_>) -> usize {
    // Native frames keep objects only through local references, which the
    // owning thread reports with its own roots.
    if frame.kind() == FrameKind::Native {
        return 0;
    }

    let mut count = 0;
    frame.for_each_object_vreg(&mut |_, obj| {
        visitor(&GcRoot::new(RootType::Frame, *obj));
        count += 1;
    });

    if frame.kind() == FrameKind::Interpreter {
        if let Some(acc) = frame.accumulator() {
            visitor(&GcRoot::new(RootType::Frame, *acc));
            count += 1;
        }
    }
    count
}

fn update_frame(frame: &mut dyn StackFrame, updater: &mut Updater<'_>) -> usize {
    let mut updated = 0;
    match frame.kind() {
        FrameKind::Interpreter => {
            frame.for_each_object_vreg(&mut |_, obj| {
                if updater(obj) {
                    updated += 1;
                }
            });
            if let Some(acc) = frame.accumulator() {
                if updater(acc) {
                    updated += 1;
                }
            }
        }
        FrameKind::Compiled => {
            let method = frame.method_name().to_string();
            frame.for_each_object_vreg(&mut |vreg, obj| {
                if updater(obj) {
                    trace!(
                        target: "roots",
                        method = %method,
                        vreg = vreg.index,
                        in_register = vreg.in_register,
                        "compiled frame vreg updated"
                    );
                    updated += 1;
                }
            });
        }
        FrameKind::Native => {}
    }
    updated
}
