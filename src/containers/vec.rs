//! Growable array stored in an arena

use std::fmt;

use crate::{
    arena::{Arena, OffsetPtr, ShmValue},
    error::{Result, ShmError},
};

/// Capacity of the first storage block
pub const MIN_VEC_CAPACITY: u64 = 4;

/// Contiguous sequence of `T` whose storage lives in an arena
///
/// Elements are position independent, so growth relocates them with a bitwise
/// copy into a block twice the size and frees the old block afterwards.
#[repr(C)]
pub struct ShmVec<T> {
    data: OffsetPtr<T>,
    len: u64,
    capacity: u64,
}

impl<T> ShmVec<T> {
    /// Empty vector without storage
    pub const fn new() -> Self {
        Self {
            data: OffsetPtr::null(),
            len: 0,
            capacity: 0,
        }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Offset of the element storage; null when no storage is held
    pub fn data_ptr(&self) -> OffsetPtr<T> {
        self.data
    }

    pub fn as_slice<'a>(&'a self, arena: &'a Arena) -> Result<&'a [T]> {
        // SAFETY: the first `len` slots are initialized and owned by `self`.
        unsafe { arena.slice(self.data, self.len) }
    }

    pub fn as_mut_slice<'a>(&'a mut self, arena: &'a Arena) -> Result<&'a mut [T]> {
        // SAFETY: as above, with exclusive access through `&mut self`.
        unsafe { arena.slice_mut(self.data, self.len) }
    }

    pub fn iter<'a>(&'a self, arena: &'a Arena) -> Result<std::slice::Iter<'a, T>> {
        Ok(self.as_slice(arena)?.iter())
    }

    /// Element at `index`
    pub fn get<'a>(&'a self, arena: &'a Arena, index: u64) -> Result<&'a T> {
        if index >= self.len {
            return Err(ShmError::index_out_of_bounds(index, self.len));
        }
        // SAFETY: `index < len`, slot initialized.
        unsafe { arena.deref(self.data.add(index)) }
    }

    pub fn get_mut<'a>(&'a mut self, arena: &'a Arena, index: u64) -> Result<&'a mut T> {
        if index >= self.len {
            return Err(ShmError::index_out_of_bounds(index, self.len));
        }
        // SAFETY: `index < len`, exclusive through `&mut self`.
        unsafe { arena.deref_mut(self.data.add(index)) }
    }

    pub fn front<'a>(&'a self, arena: &'a Arena) -> Result<&'a T> {
        if self.is_empty() {
            return Err(ShmError::empty("ShmVec"));
        }
        self.get(arena, 0)
    }

    pub fn back<'a>(&'a self, arena: &'a Arena) -> Result<&'a T> {
        if self.is_empty() {
            return Err(ShmError::empty("ShmVec"));
        }
        self.get(arena, self.len - 1)
    }

    /// Make room for at least `additional` more elements
    pub fn reserve(&mut self, arena: &Arena, additional: u64) -> Result<()> {
        let needed = self
            .len
            .checked_add(additional)
            .ok_or_else(|| ShmError::exhausted(u64::MAX, arena.available_bytes()))?;
        if needed <= self.capacity {
            return Ok(());
        }
        let doubled = self.capacity.saturating_mul(2);
        self.relocate(arena, needed.max(doubled).max(MIN_VEC_CAPACITY))
    }

    fn relocate(&mut self, arena: &Arena, capacity: u64) -> Result<()> {
        let data = arena.alloc_array::<T>(capacity)?;
        if self.len > 0 {
            let moved = arena
                .resolve_range(self.data, self.len)
                .and_then(|src| Ok((src, arena.resolve_range(data, self.len)?)));
            match moved {
                Ok((src, dst)) => {
                    // SAFETY: distinct blocks, both hold at least `len` elements.
                    unsafe {
                        std::ptr::copy_nonoverlapping(src.as_ptr(), dst.as_ptr(), self.len as usize)
                    };
                }
                Err(e) => {
                    arena.free_array(data, capacity)?;
                    return Err(e);
                }
            }
        }
        if !self.data.is_null() {
            arena.free_array(self.data, self.capacity)?;
        }
        tracing::trace!(from = self.capacity, to = capacity, "vector relocated");
        self.data = data;
        self.capacity = capacity;
        Ok(())
    }
}

impl<T: ShmValue> ShmVec<T> {
    /// Empty vector with room for `capacity` elements
    pub fn with_capacity(arena: &Arena, capacity: u64) -> Result<Self> {
        let mut vec = Self::new();
        vec.reserve(arena, capacity)?;
        Ok(vec)
    }

    /// Append `value`
    ///
    /// When growth fails the value is released and the vector is unchanged.
    pub fn push(&mut self, arena: &Arena, mut value: T) -> Result<()> {
        let slot = self
            .reserve(arena, 1)
            .and_then(|()| arena.resolve(self.data.add(self.len)));
        match slot {
            Ok(slot) => {
                // SAFETY: slot `len` is inside capacity and uninitialized.
                unsafe { slot.as_ptr().write(value) };
                self.len += 1;
                Ok(())
            }
            Err(e) => {
                value.release(arena)?;
                Err(e)
            }
        }
    }

    /// Remove and return the last element; the caller owns its storage
    pub fn pop(&mut self, arena: &Arena) -> Result<Option<T>> {
        if self.is_empty() {
            return Ok(None);
        }
        let slot = arena.resolve(self.data.add(self.len - 1))?;
        self.len -= 1;
        // SAFETY: slot was initialized and is now outside `len`.
        Ok(Some(unsafe { slot.as_ptr().read() }))
    }

    /// Release trailing elements so that `len` becomes `new_len`
    ///
    /// An element whose release fails stays in the vector.
    pub fn truncate(&mut self, arena: &Arena, new_len: u64) -> Result<()> {
        while self.len > new_len {
            let slot = arena.resolve(self.data.add(self.len - 1))?;
            // SAFETY: `slot` holds the initialized last element.
            unsafe { (*slot.as_ptr()).release(arena)? };
            self.len -= 1;
        }
        Ok(())
    }

    /// Release every element, keeping the storage
    pub fn clear(&mut self, arena: &Arena) -> Result<()> {
        self.truncate(arena, 0)
    }

    /// Release every element and the storage
    pub fn clear_deep(&mut self, arena: &Arena) -> Result<()> {
        self.clear(arena)?;
        if !self.data.is_null() {
            arena.free_array(self.data, self.capacity)?;
        }
        *self = Self::new();
        Ok(())
    }

    /// Grow with clones of `fill` or shrink by releasing trailing elements
    ///
    /// If a clone fails, the slots constructed so far are released again and
    /// the vector keeps its previous length.
    pub fn resize(&mut self, arena: &Arena, new_len: u64, fill: &T) -> Result<()> {
        if new_len <= self.len {
            return self.truncate(arena, new_len);
        }
        let old_len = self.len;
        self.reserve(arena, new_len - old_len)?;
        while self.len < new_len {
            let grown = arena
                .resolve(self.data.add(self.len))
                .and_then(|slot| Ok((fill.clone_in(arena)?, slot)));
            match grown {
                Ok((value, slot)) => {
                    // SAFETY: inside capacity and uninitialized.
                    unsafe { slot.as_ptr().write(value) };
                    self.len += 1;
                }
                Err(e) => {
                    self.truncate(arena, old_len)?;
                    return Err(e);
                }
            }
        }
        Ok(())
    }
}

impl<T> Default for ShmVec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for ShmVec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShmVec")
            .field("data", &self.data)
            .field("len", &self.len)
            .field("capacity", &self.capacity)
            .finish()
    }
}

unsafe impl<T: ShmValue> ShmValue for ShmVec<T> {
    fn clone_in(&self, arena: &Arena) -> Result<Self> {
        let mut copy = Self::with_capacity(arena, self.len)?;
        for item in self.iter(arena)? {
            let cloned = match item.clone_in(arena) {
                Ok(cloned) => cloned,
                Err(e) => {
                    copy.clear_deep(arena)?;
                    return Err(e);
                }
            };
            if let Err(e) = copy.push(arena, cloned) {
                copy.clear_deep(arena)?;
                return Err(e);
            }
        }
        Ok(copy)
    }

    fn release(&mut self, arena: &Arena) -> Result<()> {
        self.clear_deep(arena)
    }
}
