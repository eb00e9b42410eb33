//! vm-roots - managed reference storage and GC root enumeration
//!
//! This crate provides the layer a moving collector uses to find and fix up
//! every object pointer held outside the heap:
//! - `storage`: global/weak reference tables and per-thread local frames
//! - `roots`: root categories, the `RootManager`, and the runtime interfaces
//!   it drives

pub mod config;
pub mod error;
pub mod logging;
pub mod object;
pub mod reference;
pub mod roots;
pub mod storage;

// Re-export core types
pub use config::{RuntimeConfig, StorageConfig};
pub use error::ConfigError;
pub use object::{Class, ObjectHeader, ObjectPtr};
pub use reference::{ObjectType, Reference};
pub use roots::{GcRoot, RootManager, RootType, VisitGcRootFlags};
pub use storage::{ArrayStorage, GlobalObjectStorage, ReferenceStorage};
