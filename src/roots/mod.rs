//! GC roots - discovering and rewriting every pointer the collector must see
//!
//! Categories:
//! - Thread-held objects and frame vregs (THREAD, FRAME)
//! - Class mirrors and class loader contexts (CLASS, CLASS_LINKER)
//! - AOT string slots, VM-internal roots
//! - Global reference tables (NATIVE_GLOBAL) and local frames (NATIVE_LOCAL)
//! - Old-generation objects in marked cards (TENURED)
//!
//! The runtime pieces behind each category are reached through the traits in
//! `collaborators`.

mod checkers;
mod collaborators;
mod flags;
mod gc_root;
mod manager;


pub use checkers::{AcceptAll, ObjectChecker, RangeChecker};
pub use collaborators::{
    AotStringRoots, CardTable, ClassLinkerContext, FieldValue, FrameKind, LanguageConfig,
    ManagedThread, MarkState, MemRange, MonitorPool, ObjectAllocator, StackFrame, StackWalker,
    StringTable, ThreadManager, VRegInfo, VmContext,
};
pub use flags::{CardTableProcessedFlag, VisitGcRootFlags};
pub use gc_root::{GcRoot, RootType};
pub use manager::{RootManager, UpdateStats};
