//! Typed offsets into an arena's storage area

use std::{
    cmp::Ordering,
    fmt,
    hash::{Hash, Hasher},
    marker::PhantomData,
};

/// Reference to a `T` expressed as a byte offset from the storage base
///
/// An `OffsetPtr` carries no address and cannot be dereferenced on its own;
/// it resolves through [`crate::arena::Arena::resolve`] for whichever mapping
/// of the segment the caller holds. `u64::MAX` is the null sentinel, and offset
/// 0 is reserved by the allocator so it never names live data either.
#[repr(transparent)]
pub struct OffsetPtr<T> {
    offset: u64,
    _marker: PhantomData<fn() -> T>,
}

impl<T> OffsetPtr<T> {
    /// Raw value of the null sentinel
    pub const NULL_OFFSET: u64 = u64::MAX;

    /// Null pointer
    pub const fn null() -> Self {
        Self::from_offset(Self::NULL_OFFSET)
    }

    /// Pointer from a raw storage offset
    pub const fn from_offset(offset: u64) -> Self {
        Self {
            offset,
            _marker: PhantomData,
        }
    }

    /// Raw storage offset
    pub const fn offset(self) -> u64 {
        self.offset
    }

    /// True for the null sentinel
    pub const fn is_null(self) -> bool {
        self.offset == Self::NULL_OFFSET
    }

    /// Reinterpret as a pointer to another type at the same offset
    pub const fn cast<U>(self) -> OffsetPtr<U> {
        OffsetPtr::from_offset(self.offset)
    }

    /// Pointer `count` elements of `T` further along
    ///
    /// Null stays null.
    pub fn add(self, count: u64) -> Self {
        if self.is_null() {
            return self;
        }
        Self::from_offset(self.offset + count * std::mem::size_of::<T>() as u64)
    }
}

impl<T> Clone for OffsetPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for OffsetPtr<T> {}

impl<T> Default for OffsetPtr<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T> PartialEq for OffsetPtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.offset == other.offset
    }
}

impl<T> Eq for OffsetPtr<T> {}

impl<T> PartialOrd for OffsetPtr<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for OffsetPtr<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.offset.cmp(&other.offset)
    }
}

impl<T> Hash for OffsetPtr<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.offset.hash(state);
    }
}

impl<T> fmt::Debug for OffsetPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "OffsetPtr(null)")
        } else {
            write!(f, "OffsetPtr({:#x})", self.offset)
        }
    }
}
