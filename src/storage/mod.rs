//! Reference storage - where native code's handles to managed objects live
//!
//! Two layers:
//! - `GlobalObjectStorage`: VM-wide GLOBAL, GLOBAL_FIXED and WEAK tables,
//!   each an `ArrayStorage` guarded by its own lock
//! - `ReferenceStorage`: per-thread stack of LOCAL frames, forwarding
//!   global kinds to the VM tables
//!
//! Both hand out `Reference`s and report their contents to the root
//! enumerator as NATIVE_GLOBAL / NATIVE_LOCAL roots.

mod array;
mod global;
mod local;
mod slot;

#[cfg(test)]
mod tests;

pub use array::ArrayStorage;
pub use global::GlobalObjectStorage;
pub use local::{RefBlock, ReferenceStorage};
pub use slot::Slot;

use std::collections::HashMap;

use crate::object::ObjectPtr;

/// Count objects per class name, most frequent first, ties by name
pub(crate) fn class_histogram(
    objects: impl Iterator<Item = ObjectPtr>,
    top_n: usize,
) -> Vec<(String, usize)> {
    let mut counts: HashMap<&'static str, usize> = HashMap::new();
    for obj in objects {
        // Callers only pass objects held by live references.
        let name = unsafe { obj.class_name() };
        *counts.entry(name).or_default() += 1;
    }

    let mut histogram: Vec<(String, usize)> = counts
        .into_iter()
        .map(|(name, count)| (name.to_string(), count))
        .collect();
    histogram.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    histogram.truncate(top_n);
    histogram
}
