//! Move-only ownership handle for arena objects

use std::fmt;

use super::{Arena, OffsetPtr, ShmValue};
use crate::error::Result;

/// Owning handle to a `T` constructed in an arena
///
/// Created by [`Arena::new_object`] / [`Arena::new_with`] and consumed by
/// [`Arena::delete`]. The handle is not `Clone`, so each object has exactly
/// one owner and cannot be deleted twice. Dropping a handle without deleting
/// it leaks the object for the lifetime of the segment.
///
/// # Arena binding
/// The handle carries only an offset. It must be resolved through an arena
/// of the segment that created it; [`Arena::get`] on any other arena checks
/// bounds and alignment but reads whatever bytes sit at that offset. For a
/// `T` with invalid bit patterns (`bool`, `char`, enums) such a read is
/// undefined behavior.
#[repr(transparent)]
#[must_use = "arena objects leak unless passed to Arena::delete"]
pub struct ShmBox<T> {
    ptr: OffsetPtr<T>,
}

impl<T> ShmBox<T> {
    pub(crate) fn new(ptr: OffsetPtr<T>) -> Self {
        Self { ptr }
    }

    /// Offset of the owned object
    pub fn as_ptr(&self) -> OffsetPtr<T> {
        self.ptr
    }

    /// Give up ownership, returning the raw offset
    ///
    /// Used to publish an object in a segment root slot or another container.
    pub fn into_raw(self) -> OffsetPtr<T> {
        self.ptr
    }

    /// Take ownership of an object previously released with [`ShmBox::into_raw`]
    ///
    /// # Safety
    /// `ptr` must name a live `T` created by an arena of the same segment, and
    /// no other `ShmBox` may own it.
    pub unsafe fn from_raw(ptr: OffsetPtr<T>) -> Self {
        Self { ptr }
    }
}

impl<T> fmt::Debug for ShmBox<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ShmBox").field(&self.ptr).finish()
    }
}

// A box stored inside another container owns its target: copies are deep and
// releasing the box deletes the target.
unsafe impl<T: ShmValue> ShmValue for ShmBox<T> {
    fn clone_in(&self, arena: &Arena) -> Result<Self> {
        let copy = arena.get(self)?.clone_in(arena)?;
        arena.new_object(copy)
    }

    fn release(&mut self, arena: &Arena) -> Result<()> {
        let ptr = std::mem::replace(&mut self.ptr, OffsetPtr::null());
        if ptr.is_null() {
            return Ok(());
        }
        arena.delete(ShmBox::new(ptr))
    }
}
