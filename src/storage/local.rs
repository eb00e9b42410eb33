//! Per-thread local reference frames
//!
//! Design: A stack of frames, each a chain of fixed-size `RefBlock`s:
//! - Blocks live in an arena indexed by block id; a LOCAL reference names
//!   `{block, slot, generation}`, so lookup is an index, not a search
//! - A released block id bumps its generation, so stale references from a
//!   popped frame never resolve to a newer frame's slot. An id whose
//!   generation is exhausted is retired instead of reused
//! - One released block is kept for the next push (push/pop loops in native
//!   code would otherwise allocate and free a block per iteration)
//!
//! The storage is owned by its managed thread and is never shared, so no
//! locking happens here. GLOBAL and WEAK requests are forwarded to the VM's
//! `GlobalObjectStorage`.

use core::ptr::NonNull;
use std::ops::ControlFlow;
use std::sync::Arc;

use super::class_histogram;
use super::global::GlobalObjectStorage;
use crate::config::StorageConfig;
use crate::logging::{debug, log_dump_entry, log_invalid_ref, log_storage_exhausted, trace, warn};
use crate::object::ObjectPtr;
use crate::reference::{LocalHandle, ObjectType, Reference};
use crate::roots::{GcRoot, RootType, StackWalker};

/// Fixed-capacity unit of local reference storage
pub struct RefBlock {
    refs: [Option<ObjectPtr>; RefBlock::REFS_IN_BLOCK],
    /// Bit `i` set when `refs[i]` holds a live reference
    used: u64,
    /// Previous block of the same frame
    prev: Option<u32>,
}

impl RefBlock {
    pub const REFS_IN_BLOCK: usize = 60;

    /// Upper bound for a per-thread block budget
    pub const MAX_BLOCKS: usize = LocalHandle::MAX_BLOCK_IDS;

    const FULL: u64 = (1u64 << Self::REFS_IN_BLOCK) - 1;

    fn new(prev: Option<u32>) -> Self {
        Self {
            refs: [None; Self::REFS_IN_BLOCK],
            used: 0,
            prev,
        }
    }

    fn reset(&mut self, prev: Option<u32>) {
        self.refs = [None; Self::REFS_IN_BLOCK];
        self.used = 0;
        self.prev = prev;
    }

    #[inline]
    fn is_full(&self) -> bool {
        self.used == Self::FULL
    }

    #[inline]
    fn len(&self) -> usize {
        self.used.count_ones() as usize
    }

    #[inline]
    fn free_slots(&self) -> usize {
        Self::REFS_IN_BLOCK - self.len()
    }

    #[inline]
    fn is_live(&self, slot: u8) -> bool {
        (slot as usize) < Self::REFS_IN_BLOCK && self.used & (1 << slot) != 0
    }

    /// Store in the lowest free slot; caller checks `is_full` first
    fn add(&mut self, obj: ObjectPtr) -> u8 {
        debug_assert!(!self.is_full());
        let slot = (!self.used).trailing_zeros() as u8;
        self.used |= 1 << slot;
        self.refs[slot as usize] = Some(obj);
        slot
    }

    fn get(&self, slot: u8) -> Option<ObjectPtr> {
        if self.is_live(slot) {
            self.refs[slot as usize]
        } else {
            None
        }
    }

    fn remove(&mut self, slot: u8) {
        self.used &= !(1 << slot);
        self.refs[slot as usize] = None;
    }

    fn live(&self) -> impl Iterator<Item = (u8, ObjectPtr)> + '_ {
        self.refs
            .iter()
            .enumerate()
            .filter_map(|(slot, obj)| obj.map(|obj| (slot as u8, obj)))
    }
}

struct BlockEntry {
    generation: u32,
    /// `None` while the id is on the free list
    block: Option<Box<RefBlock>>,
}

struct LocalFrame {
    /// Newest block of the frame
    top: u32,
    blocks: usize,
    /// Blocks set aside by `push_local_frame` / `ensure_local_capacity`
    reserved: usize,
}

impl LocalFrame {
    #[inline]
    fn committed(&self) -> usize {
        self.blocks.max(self.reserved)
    }
}

/// Local reference frames of one managed thread
pub struct ReferenceStorage {
    global: Arc<GlobalObjectStorage>,
    stack: Option<Arc<dyn StackWalker>>,
    entries: Vec<BlockEntry>,
    free_ids: Vec<u32>,
    frames: Vec<LocalFrame>,
    cached_block: Option<Box<RefBlock>>,
    /// Blocks charged against `max_blocks` across all frames
    committed: usize,
    max_blocks: usize,
    local_refs: usize,
    validate: bool,
    dump_limit: usize,
}

impl ReferenceStorage {
    /// Create an uninitialized storage; call `init` before use
    ///
    /// `stack` is the owning thread's stack walker, needed to validate STACK
    /// references.
    pub fn new(
        global: Arc<GlobalObjectStorage>,
        stack: Option<Arc<dyn StackWalker>>,
        config: &StorageConfig,
    ) -> Self {
        Self {
            global,
            stack,
            entries: Vec::new(),
            free_ids: Vec::new(),
            frames: Vec::new(),
            cached_block: None,
            committed: 0,
            max_blocks: config.max_local_blocks.clamp(1, RefBlock::MAX_BLOCKS),
            local_refs: 0,
            validate: config.validate_refs,
            dump_limit: config.dump_limit,
        }
    }

    /// Create the permanent main frame
    pub fn init(&mut self) -> bool {
        if self.is_initialized() {
            return true;
        }
        let Some(id) = self.alloc_block(None) else {
            return false;
        };
        self.frames.push(LocalFrame {
            top: id,
            blocks: 1,
            reserved: 1,
        });
        self.committed = 1;
        trace!(target: "local_refs", max_blocks = self.max_blocks, "local reference storage initialized");
        true
    }

    #[inline]
    pub fn is_initialized(&self) -> bool {
        !self.frames.is_empty()
    }

    pub fn global_storage(&self) -> &Arc<GlobalObjectStorage> {
        &self.global
    }

    // ===== Block arena =====

    /// Take a free block id, `None` once every encodable id is in use or
    /// retired
    fn alloc_block(&mut self, prev: Option<u32>) -> Option<u32> {
        let id = match self.free_ids.pop() {
            Some(id) => id,
            None if self.entries.len() < LocalHandle::MAX_BLOCK_IDS => {
                self.entries.push(BlockEntry {
                    generation: 0,
                    block: None,
                });
                (self.entries.len() - 1) as u32
            }
            None => {
                warn!(target: "local_refs", "local block ids exhausted");
                return None;
            }
        };

        let block = match self.cached_block.take() {
            Some(mut block) => {
                block.reset(prev);
                block
            }
            None => Box::new(RefBlock::new(prev)),
        };
        self.entries[id as usize].block = Some(block);
        Some(id)
    }

    fn release_block(&mut self, id: u32) -> Option<u32> {
        let entry = &mut self.entries[id as usize];
        let block = entry.block.take()?;
        // A wrapped generation would let stale handles resolve again.
        if entry.generation == u32::MAX {
            trace!(target: "local_refs", block = id, "block id retired");
        } else {
            entry.generation += 1;
            self.free_ids.push(id);
        }

        let prev = block.prev;
        self.local_refs -= block.len();
        if self.cached_block.is_none() {
            self.cached_block = Some(block);
        }
        prev
    }

    #[inline]
    fn block(&self, id: u32) -> &RefBlock {
        match self.entries[id as usize].block.as_deref() {
            Some(block) => block,
            None => unreachable!("frame block {} was released", id),
        }
    }

    #[inline]
    fn block_mut(&mut self, id: u32) -> &mut RefBlock {
        match self.entries[id as usize].block.as_deref_mut() {
            Some(block) => block,
            None => unreachable!("frame block {} was released", id),
        }
    }

    /// Block holding a live local reference, if `handle` is still current
    fn resolve(&self, handle: LocalHandle) -> Option<&RefBlock> {
        let entry = self.entries.get(handle.block as usize)?;
        if entry.generation != handle.generation {
            return None;
        }
        let block = entry.block.as_deref()?;
        block.is_live(handle.slot).then_some(block)
    }

    // ===== References =====

    /// Create a reference of `kind` to `obj`
    ///
    /// A null object yields no reference. GLOBAL, GLOBAL_FIXED and WEAK are
    /// stored in the global tables; LOCAL goes into the current frame.
    /// Returns `None` when the storage is exhausted.
    pub fn new_ref(&mut self, obj: Option<ObjectPtr>, kind: ObjectType) -> Option<Reference> {
        let obj = obj?;
        match kind {
            ObjectType::Local => self.new_local_ref(obj),
            ObjectType::Global | ObjectType::GlobalFixed | ObjectType::Weak => {
                self.global.add(obj, kind)
            }
            ObjectType::Stack => {
                warn!(target: "local_refs", "stack references alias a slot, use new_stack_ref");
                None
            }
        }
    }

    fn new_local_ref(&mut self, obj: ObjectPtr) -> Option<Reference> {
        let Some(frame) = self.frames.last() else {
            warn!(target: "local_refs", "local reference requested before init");
            return None;
        };
        let mut top = frame.top;

        if self.block(top).is_full() {
            let within_reservation = frame.blocks < frame.reserved;
            if !within_reservation && self.committed >= self.max_blocks {
                log_storage_exhausted(ObjectType::Local, self.max_blocks);
                self.dump_local_ref_classes(self.dump_limit);
                return None;
            }

            top = match self.alloc_block(Some(top)) {
                Some(id) => id,
                None => {
                    log_storage_exhausted(ObjectType::Local, self.max_blocks);
                    return None;
                }
            };
            if let Some(frame) = self.frames.last_mut() {
                let before = frame.committed();
                frame.top = top;
                frame.blocks += 1;
                self.committed = self.committed + frame.committed() - before;
            }
        }

        let slot = self.block_mut(top).add(obj);
        self.local_refs += 1;

        Some(Reference::local(LocalHandle {
            block: top,
            slot,
            generation: self.entries[top as usize].generation,
        }))
    }

    /// Create a STACK reference aliasing a vreg slot
    ///
    /// # Safety
    /// `slot` must be an object slot of a live frame of the owning thread,
    /// and the reference must not be used after that frame exits.
    pub unsafe fn new_stack_ref(&self, slot: NonNull<Option<ObjectPtr>>) -> Reference {
        Reference::stack(slot.as_ptr() as usize)
    }

    /// Release a reference; null is a no-op
    pub fn remove_ref(&mut self, r: Option<Reference>) {
        let Some(r) = r else { return };
        match r.kind() {
            ObjectType::Local => {
                let handle = r.local_handle();
                if self.resolve(handle).is_none() {
                    if self.validate {
                        log_invalid_ref("remove_ref", &r);
                    }
                    return;
                }
                self.block_mut(handle.block).remove(handle.slot);
                self.local_refs -= 1;
            }
            ObjectType::Global | ObjectType::GlobalFixed | ObjectType::Weak => self.global.remove(r),
            // Stack references own no storage.
            ObjectType::Stack => {}
        }
    }

    /// Object behind a reference; `None` for null, dead, or cleared refs
    pub fn get_object(&self, r: Option<Reference>) -> Option<ObjectPtr> {
        let r = r?;
        match r.kind() {
            ObjectType::Local => {
                let handle = r.local_handle();
                match self.resolve(handle) {
                    Some(block) => block.get(handle.slot),
                    None => {
                        if self.validate {
                            log_invalid_ref("get_object", &r);
                        }
                        None
                    }
                }
            }
            ObjectType::Global | ObjectType::GlobalFixed | ObjectType::Weak => self.global.get(r),
            ObjectType::Stack => {
                let addr = r.stack_address();
                if self.validate && !self.stack_reference_check(addr) {
                    log_invalid_ref("get_object", &r);
                    return None;
                }
                // new_stack_ref's contract keeps the slot alive.
                unsafe { *(addr as *const Option<ObjectPtr>) }
            }
        }
    }

    /// Check that `r` currently names a live reference
    pub fn is_valid_ref(&self, r: Option<Reference>) -> bool {
        let Some(r) = r else { return false };
        match r.kind() {
            ObjectType::Local => self.resolve(r.local_handle()).is_some(),
            ObjectType::Global | ObjectType::GlobalFixed | ObjectType::Weak => {
                self.global.is_valid_global_ref(r)
            }
            ObjectType::Stack => self.stack_reference_check(r.stack_address()),
        }
    }

    /// Kind of a live reference, `None` for null or invalid ones
    pub fn ref_type(&self, r: Option<Reference>) -> Option<ObjectType> {
        if self.is_valid_ref(r) {
            r.map(Reference::kind)
        } else {
            None
        }
    }

    /// Both references resolve to the same object (two nulls are the same)
    pub fn is_same_object(&self, a: Option<Reference>, b: Option<Reference>) -> bool {
        a == b || self.get_object(a) == self.get_object(b)
    }

    /// Walk the owning thread's frames looking for the slot address
    ///
    /// O(stack depth); only used for validation.
    fn stack_reference_check(&self, addr: usize) -> bool {
        let Some(stack) = &self.stack else {
            return false;
        };
        let mut found = false;
        stack.walk(&mut |frame| {
            if frame.contains_slot(addr) {
                found = true;
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        });
        found
    }

    // ===== Frames =====

    /// Open a frame able to hold `capacity` references
    ///
    /// Fails without allocating when the blocks needed exceed what is left
    /// of the thread's budget.
    pub fn push_local_frame(&mut self, capacity: usize) -> bool {
        if !self.is_initialized() {
            warn!(target: "local_refs", "push_local_frame before init");
            return false;
        }

        let need = capacity.div_ceil(RefBlock::REFS_IN_BLOCK).max(1);
        if self.committed + need > self.max_blocks {
            debug!(
                target: "local_refs",
                capacity,
                need,
                committed = self.committed,
                max_blocks = self.max_blocks,
                "local frame does not fit the block budget"
            );
            return false;
        }

        let Some(id) = self.alloc_block(None) else {
            return false;
        };
        self.frames.push(LocalFrame {
            top: id,
            blocks: 1,
            reserved: need,
        });
        self.committed += need;
        true
    }

    /// Close the current frame, carrying `result` into the parent frame
    ///
    /// Returns a new LOCAL reference in the parent frame to the object behind
    /// `result`, or `None` when `result` is null. The main frame is never
    /// popped; popping it returns `result` unchanged.
    pub fn pop_local_frame(&mut self, result: Option<Reference>) -> Option<Reference> {
        if self.frames.len() <= 1 {
            warn!(target: "local_refs", "attempt to pop the main local frame ignored");
            return result;
        }

        let obj = self.get_object(result);

        if let Some(frame) = self.frames.pop() {
            self.committed -= frame.committed();
            let mut next = Some(frame.top);
            while let Some(id) = next {
                next = self.release_block(id);
            }
        }

        obj.and_then(|obj| self.new_local_ref(obj))
    }

    /// Make room for `capacity` more references in the current frame
    pub fn ensure_local_capacity(&mut self, capacity: usize) -> bool {
        let Some(frame) = self.frames.last() else {
            return false;
        };

        let free = self.block(frame.top).free_slots();
        if capacity <= free {
            return true;
        }

        let wanted = frame.blocks + (capacity - free).div_ceil(RefBlock::REFS_IN_BLOCK);
        let before = frame.committed();
        if wanted <= before {
            return true;
        }
        if self.committed + (wanted - before) > self.max_blocks {
            return false;
        }

        self.committed += wanted - before;
        if let Some(frame) = self.frames.last_mut() {
            frame.reserved = wanted;
        }
        true
    }

    /// Frames including the main frame
    pub fn local_frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Live local references across all frames
    pub fn local_object_storage_size(&self) -> usize {
        self.local_refs
    }

    // ===== GC =====

    fn live_blocks(&self) -> impl Iterator<Item = &RefBlock> + '_ {
        self.entries.iter().filter_map(|entry| entry.block.as_deref())
    }

    /// Report every local reference as a root of `root_type`
    pub fn visit_objects<F>(&self, mut visitor: F, root_type: RootType) -> usize
    where
        F: FnMut(&GcRoot),
    {
        let mut visited = 0;
        for block in self.live_blocks() {
            for (_, obj) in block.live() {
                visitor(&GcRoot::new(root_type, obj));
                visited += 1;
            }
        }
        visited
    }

    /// Rewrite moved objects held by local references
    pub fn update_moved_refs<F>(&mut self, mut updater: F) -> usize
    where
        F: FnMut(&mut ObjectPtr) -> bool,
    {
        let mut updated = 0;
        for entry in self.entries.iter_mut() {
            let Some(block) = entry.block.as_deref_mut() else { continue };
            for obj in block.refs.iter_mut().flatten() {
                let mut moved = *obj;
                if updater(&mut moved) {
                    *obj = moved;
                    updated += 1;
                }
            }
        }
        updated
    }

    // ===== Diagnostics =====

    /// Log live local references, newest frame first
    pub fn dump_local_refs(&self) {
        let mut position = 0;
        for frame in self.frames.iter().rev() {
            let mut next = Some(frame.top);
            while let Some(id) = next {
                let block = self.block(id);
                for (_, obj) in block.live() {
                    if position >= self.dump_limit {
                        return;
                    }
                    // Local slots hold live objects.
                    log_dump_entry(ObjectType::Local, position, unsafe { obj.class_name() });
                    position += 1;
                }
                next = block.prev;
            }
        }
    }

    /// Local references grouped by class, most frequent first
    pub fn dump_local_ref_classes(&self, top_n: usize) -> Vec<(String, usize)> {
        let histogram = class_histogram(
            self.live_blocks().flat_map(|block| block.live().map(|(_, obj)| obj)),
            top_n,
        );
        for (class_name, count) in &histogram {
            warn!(target: "local_refs", class = %class_name, count, "local references by class");
        }
        histogram
    }
}
