//! Object layout primitives - the part of a heap object this layer can see
//!
//! Design: The reference layer never interprets object bodies. It needs:
//! 1. A stable, aligned, never-null address per object (`ObjectPtr`)
//! 2. The class word of the header, published atomically by the allocator
//!
//! The class word doubles as the "object is fully initialized" signal used by
//! card-table scanning: a header whose class is still null belongs to an
//! allocation that has not been published yet.

use core::ptr::NonNull;
use std::borrow::Cow;
use std::fmt;
use std::sync::atomic::{AtomicPtr, Ordering};

/// Every object address is aligned to at least this many bytes.
pub const OBJECT_ALIGNMENT: usize = 8;

/// Object header - prefixed before every managed object
#[repr(C, align(8))]
pub struct ObjectHeader {
    class: AtomicPtr<Class>,
}

impl ObjectHeader {
    /// Create header with its class already published
    #[inline]
    pub fn new(class: &'static Class) -> Self {
        Self {
            class: AtomicPtr::new(class as *const Class as *mut Class),
        }
    }

    /// Create header for an allocation whose class is not yet published
    #[inline]
    pub const fn unpublished() -> Self {
        Self {
            class: AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    /// Publish the class word (allocator side of the handshake)
    #[inline]
    pub fn publish_class(&self, class: &'static Class) {
        self.class
            .store(class as *const Class as *mut Class, Ordering::Release);
    }

    /// Class of this object, `None` while the allocation is unpublished
    #[inline]
    pub fn class(&self) -> Option<&'static Class> {
        let ptr = self.class.load(Ordering::Acquire);
        // Only `&'static Class` values are ever stored.
        unsafe { ptr.as_ref() }
    }
}

/// Per-class metadata shared by every instance
#[derive(Debug)]
pub struct Class {
    name: Cow<'static, str>,
}

impl Class {
    #[inline]
    pub const fn new_static(name: &'static str) -> Self {
        Self {
            name: Cow::Borrowed(name),
        }
    }

    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: Cow::Owned(name.into()),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Opaque pointer to a live managed object
///
/// The layer stores, compares, and rewrites these values; it only
/// dereferences them to read the class word for diagnostics and card scans.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectPtr(NonNull<ObjectHeader>);

// Safety: an ObjectPtr is an address. Dereferencing happens only under the
// GC contract (objects are live while referenced from a root or a table).
unsafe impl Send for ObjectPtr {}
unsafe impl Sync for ObjectPtr {}

impl ObjectPtr {
    #[inline]
    pub fn new(ptr: NonNull<ObjectHeader>) -> Self {
        debug_assert_eq!(
            ptr.as_ptr() as usize % OBJECT_ALIGNMENT,
            0,
            "object address must be aligned"
        );
        Self(ptr)
    }

    #[inline]
    pub fn from_header(header: &ObjectHeader) -> Self {
        Self::new(NonNull::from(header))
    }

    /// Rebuild from a raw address; `None` for null
    #[inline]
    pub fn from_addr(addr: usize) -> Option<Self> {
        NonNull::new(addr as *mut ObjectHeader).map(Self::new)
    }

    #[inline]
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    #[inline]
    pub fn as_ptr(self) -> *mut ObjectHeader {
        self.0.as_ptr()
    }

    /// Borrow the header
    ///
    /// # Safety
    /// The object must be live for the duration of the borrow.
    #[inline]
    pub unsafe fn header<'a>(self) -> &'a ObjectHeader {
        &*self.0.as_ptr()
    }

    /// Class name for diagnostics
    ///
    /// # Safety
    /// The object must be live.
    pub unsafe fn class_name(self) -> &'static str {
        match self.header().class() {
            Some(class) => class.name(),
            None => "<unpublished>",
        }
    }
}

impl fmt::Debug for ObjectPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectPtr({:#x})", self.addr())
    }
}

impl fmt::Pointer for ObjectPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Pointer::fmt(&self.0, f)
    }
}
