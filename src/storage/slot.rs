//! Table slot - tagged union of a live entry or a free-list link

use crate::object::ObjectPtr;

/// Terminates the intrusive free list
pub(crate) const FREE_LIST_END: u32 = u32::MAX;

/// One entry of an `ArrayStorage`
///
/// Every index is reachable exactly once: either it holds a live entry
/// (`Occupied` or `Cleared`) or it is linked into the free chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Occupied(ObjectPtr),
    /// Weak entry whose referent was collected; the index stays allocated
    /// until the holder removes the reference.
    Cleared,
    /// Free slot, payload is the next free index
    Free(u32),
}

impl Slot {
    /// Object held by the slot, `None` for cleared and free slots
    #[inline]
    pub fn object(&self) -> Option<ObjectPtr> {
        match self {
            Self::Occupied(obj) => Some(*obj),
            Self::Cleared | Self::Free(_) => None,
        }
    }

    /// Slot owns an index handed out by `add`
    #[inline]
    pub fn is_live(&self) -> bool {
        !matches!(self, Self::Free(_))
    }
}
