//! Reference encoding - opaque handles handed out to native code
//!
//! Layout (64-bit word, never zero):
//! - Bits 0-2: `ObjectType` tag
//! - Table kinds (GLOBAL, GLOBAL_FIXED, WEAK): `(index + 1) << 3`
//! - LOCAL: `(packed handle + 1) << 3`, handle = generation:32 | block:20 | slot:6
//! - STACK: address of the referenced vreg slot (8-byte aligned, low bits free)
//!
//! The `+ 1` keeps index 0 distinguishable from "no reference", which is
//! `Option<Reference>::None` on the Rust side.

use std::fmt;
use std::num::NonZeroU64;

use crate::logging::error;

const TYPE_BITS: u32 = 3;
const TYPE_MASK: u64 = (1 << TYPE_BITS) - 1;

const INDEX_BITS: u32 = 32;

const LOCAL_SLOT_BITS: u32 = 6;
const LOCAL_BLOCK_BITS: u32 = 20;
const LOCAL_GENERATION_BITS: u32 = 32;
const LOCAL_SLOT_MASK: u64 = (1 << LOCAL_SLOT_BITS) - 1;
const LOCAL_BLOCK_MASK: u64 = (1 << LOCAL_BLOCK_BITS) - 1;
const LOCAL_GENERATION_MASK: u64 = (1 << LOCAL_GENERATION_BITS) - 1;

/// Storage kind carried in the low bits of every reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ObjectType {
    Local = 0,
    Global = 1,
    GlobalFixed = 2,
    Weak = 3,
    Stack = 4,
}

impl ObjectType {
    #[inline]
    const fn from_tag(tag: u64) -> Option<Self> {
        match tag {
            0 => Some(Self::Local),
            1 => Some(Self::Global),
            2 => Some(Self::GlobalFixed),
            3 => Some(Self::Weak),
            4 => Some(Self::Stack),
            _ => None,
        }
    }

    /// Kinds resolved through a `GlobalObjectStorage` table
    #[inline]
    pub const fn is_table_backed(self) -> bool {
        matches!(self, Self::Global | Self::GlobalFixed | Self::Weak)
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Global => "global",
            Self::GlobalFixed => "global_fixed",
            Self::Weak => "weak",
            Self::Stack => "stack",
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Decoded LOCAL reference payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LocalHandle {
    pub block: u32,
    pub slot: u8,
    pub generation: u32,
}

impl LocalHandle {
    /// Slots addressable inside one block
    pub const MAX_SLOTS: usize = 1 << LOCAL_SLOT_BITS;

    /// Block ids addressable by a handle
    pub const MAX_BLOCK_IDS: usize = 1 << LOCAL_BLOCK_BITS;

    #[inline]
    const fn pack(self) -> u64 {
        ((self.generation as u64) << (LOCAL_BLOCK_BITS + LOCAL_SLOT_BITS))
            | ((self.block as u64) << LOCAL_SLOT_BITS)
            | self.slot as u64
    }

    #[inline]
    const fn unpack(bits: u64) -> Self {
        Self {
            block: ((bits >> LOCAL_SLOT_BITS) & LOCAL_BLOCK_MASK) as u32,
            slot: (bits & LOCAL_SLOT_MASK) as u8,
            generation: ((bits >> (LOCAL_BLOCK_BITS + LOCAL_SLOT_BITS)) & LOCAL_GENERATION_MASK)
                as u32,
        }
    }
}

/// Tagged handle to a managed object
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Reference(NonZeroU64);

impl Reference {
    /// Largest index a table may hand out; table sizes are checked against it
    pub const MAX_TABLE_INDEX: usize = (1usize << INDEX_BITS) - 2;

    /// Create a table-backed reference
    #[inline]
    pub(crate) fn table(kind: ObjectType, index: usize) -> Self {
        debug_assert!(kind.is_table_backed(), "{} is not table backed", kind);
        debug_assert!(index <= Self::MAX_TABLE_INDEX, "index {} out of range", index);
        Self::encode(((index as u64) + 1) << TYPE_BITS, kind)
    }

    #[inline]
    pub(crate) fn local(handle: LocalHandle) -> Self {
        Self::encode((handle.pack() + 1) << TYPE_BITS, ObjectType::Local)
    }

    #[inline]
    pub(crate) fn stack(slot_addr: usize) -> Self {
        debug_assert!(slot_addr != 0, "stack reference to null slot");
        debug_assert_eq!(slot_addr as u64 & TYPE_MASK, 0, "stack slot must be aligned");
        Self::encode(slot_addr as u64, ObjectType::Stack)
    }

    #[inline]
    fn encode(payload: u64, kind: ObjectType) -> Self {
        // Payload is always non-zero: table/local payloads carry `+ 1`,
        // stack payloads are non-null addresses.
        match NonZeroU64::new(payload | kind as u64) {
            Some(bits) => Self(bits),
            None => unreachable!("encoded reference is never zero"),
        }
    }

    /// Rebuild a reference from bits previously returned by `into_raw`
    #[inline]
    pub fn from_raw(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Self)
    }

    #[inline]
    pub fn into_raw(self) -> u64 {
        self.0.get()
    }

    /// Storage kind
    ///
    /// An unknown tag means the handle was corrupted; the process aborts.
    #[inline]
    pub fn kind(self) -> ObjectType {
        match ObjectType::from_tag(self.0.get() & TYPE_MASK) {
            Some(kind) => kind,
            None => corrupted(self.0.get()),
        }
    }

    /// Table index of a GLOBAL, GLOBAL_FIXED or WEAK reference
    #[inline]
    pub fn index(self) -> usize {
        debug_assert!(self.kind().is_table_backed());
        ((self.0.get() >> TYPE_BITS) - 1) as usize
    }

    #[inline]
    pub fn local_handle(self) -> LocalHandle {
        debug_assert_eq!(self.kind(), ObjectType::Local);
        LocalHandle::unpack((self.0.get() >> TYPE_BITS) - 1)
    }

    /// Address of the vreg slot a STACK reference aliases
    #[inline]
    pub fn stack_address(self) -> usize {
        debug_assert_eq!(self.kind(), ObjectType::Stack);
        (self.0.get() & !TYPE_MASK) as usize
    }
}

impl fmt::Debug for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            ObjectType::Local => {
                let h = self.local_handle();
                write!(f, "Reference(local {}:{} gen {})", h.block, h.slot, h.generation)
            }
            ObjectType::Stack => write!(f, "Reference(stack {:#x})", self.stack_address()),
            kind => write!(f, "Reference({} #{})", kind, self.index()),
        }
    }
}

#[cold]
fn corrupted(raw: u64) -> ! {
    error!(
        target: "storage",
        raw = %format_args!("{:#x}", raw),
        "reference carries an unknown type tag"
    );
    std::process::abort()
}
