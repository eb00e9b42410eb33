//! Filters the collector passes to a card-table scan
//!
//! Closures work directly; `AcceptAll` is the no-filter case.

use super::collaborators::MemRange;
use crate::object::ObjectPtr;

pub trait RangeChecker {
    fn check(&mut self, range: MemRange) -> bool;
}

pub trait ObjectChecker {
    fn check(&mut self, obj: ObjectPtr) -> bool;
}

impl<F> RangeChecker for F
where
    F: FnMut(MemRange) -> bool,
{
    #[inline]
    fn check(&mut self, range: MemRange) -> bool {
        self(range)
    }
}

impl<F> ObjectChecker for F
where
    F: FnMut(ObjectPtr) -> bool,
{
    #[inline]
    fn check(&mut self, obj: ObjectPtr) -> bool {
        self(obj)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl RangeChecker for AcceptAll {
    #[inline]
    fn check(&mut self, _range: MemRange) -> bool {
        true
    }
}

impl ObjectChecker for AcceptAll {
    #[inline]
    fn check(&mut self, _obj: ObjectPtr) -> bool {
        true
    }
}
