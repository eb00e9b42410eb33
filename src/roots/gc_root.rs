//! Root record handed to visitors

use std::fmt;

use crate::object::ObjectPtr;

/// Category a root was discovered in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RootType {
    Class,
    Frame,
    Thread,
    /// Old-generation object found through a marked card
    Tenured,
    NativeGlobal,
    NativeLocal,
    AotStringSlot,
    ClassLinker,
    Unknown,
}

impl RootType {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Class => "class",
            Self::Frame => "frame",
            Self::Thread => "thread",
            Self::Tenured => "tenured",
            Self::NativeGlobal => "native_global",
            Self::NativeLocal => "native_local",
            Self::AotStringSlot => "aot_string_slot",
            Self::ClassLinker => "class_linker",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for RootType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One discovered root, created fresh for each visitor call
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct GcRoot {
    root_type: RootType,
    object: ObjectPtr,
    from_object: Option<ObjectPtr>,
}

impl GcRoot {
    #[inline]
    pub fn new(root_type: RootType, object: ObjectPtr) -> Self {
        Self {
            root_type,
            object,
            from_object: None,
        }
    }

    /// Card-table root: `from` is the old-generation object holding `object`
    #[inline]
    pub fn tenured(from: ObjectPtr, object: ObjectPtr) -> Self {
        Self {
            root_type: RootType::Tenured,
            object,
            from_object: Some(from),
        }
    }

    #[inline]
    pub fn root_type(&self) -> RootType {
        self.root_type
    }

    #[inline]
    pub fn object(&self) -> ObjectPtr {
        self.object
    }

    /// Referring object, set only for `RootType::Tenured`
    #[inline]
    pub fn from_object(&self) -> Option<ObjectPtr> {
        self.from_object
    }
}

impl fmt::Debug for GcRoot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.from_object {
            Some(from) => write!(f, "GcRoot({} {:?} <- {:?})", self.root_type, self.object, from),
            None => write!(f, "GcRoot({} {:?})", self.root_type, self.object),
        }
    }
}
