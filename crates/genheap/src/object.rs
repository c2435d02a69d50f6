//! Addresses, object references and the object header word

use std::fmt;
use std::num::NonZeroUsize;

use crate::types::TypeId;

/// A raw heap address
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address(usize);

impl Address {
    /// The null address
    pub const NULL: Address = Address(0);

    /// Wrap a raw address
    #[inline(always)]
    pub const fn from_usize(addr: usize) -> Self {
        Self(addr)
    }

    /// Raw address value
    #[inline(always)]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// True for the null address
    #[inline(always)]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Address `bytes` further on
    #[inline(always)]
    pub const fn offset(self, bytes: usize) -> Self {
        Self(self.0 + bytes)
    }

    /// Distance in bytes from `origin` up to `self`
    #[inline(always)]
    pub const fn offset_from(self, origin: Address) -> usize {
        debug_assert!(self.0 >= origin.0);
        self.0 - origin.0
    }

    /// True if aligned to `align` (a power of two)
    #[inline(always)]
    pub const fn is_aligned(self, align: usize) -> bool {
        self.0 & (align - 1) == 0
    }

    /// Pointer to this address.
    ///
    /// Heap memory exposes its provenance when the arena is reserved, so the
    /// pointer is valid for any address inside the arena.
    #[inline(always)]
    pub fn as_mut_ptr<T>(self) -> *mut T {
        std::ptr::with_exposed_provenance_mut(self.0)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Handle to a formatted heap object.
///
/// Only the allocator hands these out, and only after the object's header
/// (and length, for arrays) has been written and its payload initialized.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectRef(NonZeroUsize);

impl ObjectRef {
    /// Reference to the object starting at `addr`, `None` for null
    #[inline(always)]
    pub const fn from_address(addr: Address) -> Option<Self> {
        match NonZeroUsize::new(addr.as_usize()) {
            Some(raw) => Some(Self(raw)),
            None => None,
        }
    }

    /// Start address (where the header lives)
    #[inline(always)]
    pub const fn address(self) -> Address {
        Address::from_usize(self.0.get())
    }

    /// Encoding used in reference slots; 0 is null
    #[inline(always)]
    pub const fn to_slot(this: Option<Self>) -> u64 {
        match this {
            Some(obj) => obj.0.get() as u64,
            None => 0,
        }
    }

    /// Decode a reference slot
    #[inline(always)]
    pub const fn from_slot(slot: u64) -> Option<Self> {
        Self::from_address(Address::from_usize(slot as usize))
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectRef({:#x})", self.0)
    }
}

/// Header bit: object may need card marking
pub const REMEMBERED_SET_BIT: u64 = 1 << 0;

/// Header bit: object lives in an unaligned chunk
pub const UNALIGNED_BIT: u64 = 1 << 1;

const TYPE_SHIFT: u32 = 8;

/// The header word at offset 0 of every object.
///
/// ```text
/// bit  0      remembered set
/// bit  1      unaligned chunk
/// bits 2-7    reserved for the collector
/// bits 8-39   type id
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectHeader(u64);

impl ObjectHeader {
    /// Encode a header
    #[inline(always)]
    pub const fn new(type_id: TypeId, remembered_set: bool, unaligned: bool) -> Self {
        let mut bits = (type_id.as_u32() as u64) << TYPE_SHIFT;
        if remembered_set {
            bits |= REMEMBERED_SET_BIT;
        }
        if unaligned {
            bits |= UNALIGNED_BIT;
        }
        Self(bits)
    }

    /// Reinterpret a raw header word
    #[inline(always)]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// Raw header word
    #[inline(always)]
    pub const fn bits(self) -> u64 {
        self.0
    }

    /// Type of the object
    #[inline(always)]
    pub const fn type_id(self) -> TypeId {
        TypeId::from_u32((self.0 >> TYPE_SHIFT) as u32)
    }

    /// Remembered-set bit
    #[inline(always)]
    pub const fn has_remembered_set(self) -> bool {
        self.0 & REMEMBERED_SET_BIT != 0
    }

    /// Unaligned-chunk bit
    #[inline(always)]
    pub const fn is_unaligned(self) -> bool {
        self.0 & UNALIGNED_BIT != 0
    }
}

impl fmt::Debug for ObjectHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectHeader")
            .field("type_id", &self.type_id())
            .field("remembered_set", &self.has_remembered_set())
            .field("unaligned", &self.is_unaligned())
            .finish()
    }
}
