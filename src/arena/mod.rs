//! Allocating façade over the buddy allocator
//!
//! An [`Arena`] binds a buddy allocator to the base address at which *this*
//! process mapped the storage area. Everything stored in the segment refers to
//! other objects through [`OffsetPtr`]s; resolving one always goes through an
//! explicit arena, so several segments can be used side by side and a segment
//! may be mapped at a different address in every process.
//!
//! ```text
//!  process A                       process B
//!  base 0x7f00_0000_0000           base 0x7e12_3400_0000
//!        │                                │
//!        ▼  OffsetPtr(0x140)              ▼  OffsetPtr(0x140)
//!  ┌──────────────────────── storage area ───────────────────────┐
//!  │ reserved │ ... │ ShmList header @0x140 │ ... │ nodes ...      │
//!  └──────────────────────────────────────────────────────────────┘
//! ```

pub mod boxed;
pub mod heap;
pub mod pointer;
pub mod value;

pub use boxed::ShmBox;
pub use heap::HeapArena;
pub use pointer::OffsetPtr;
pub use value::{ShmKey, ShmValue};

use std::ptr::NonNull;

use crate::{
    allocators::{BuddyAllocator, BuddyStats, OffsetAllocator},
    error::{Result, ShmError},
};

/// Alignment of the storage base; the largest element alignment supported
pub const STORAGE_ALIGN: usize = 64;

/// Typed allocation, construction and offset resolution for one mapping
#[derive(Debug)]
pub struct Arena {
    /// Storage base in this process
    storage: NonNull<u8>,
    /// Length of the storage area
    storage_len: u64,
    /// Allocator whose index lives in the same segment
    allocator: BuddyAllocator,
}

impl Arena {
    /// Lay out a fresh allocator over `index` and `storage`
    ///
    /// # Safety
    /// - `index` must be valid for `index_len` bytes, `storage` for
    ///   `2^max_order` bytes, both writable and disjoint
    /// - Both regions must outlive the arena
    pub unsafe fn format(
        index: NonNull<u8>,
        index_len: usize,
        storage: NonNull<u8>,
        min_order: u32,
        max_order: u32,
    ) -> Result<Self> {
        Self::check_storage_alignment(storage)?;
        let allocator = BuddyAllocator::format(index, index_len, min_order, max_order)?;
        Ok(Self {
            storage,
            storage_len: allocator.total_size(),
            allocator,
        })
    }

    /// Attach to an allocator previously laid out by [`Arena::format`]
    ///
    /// # Safety
    /// Same requirements as [`Arena::format`], with `storage_len` the number of
    /// bytes valid at `storage`.
    pub unsafe fn attach(
        index: NonNull<u8>,
        index_len: usize,
        storage: NonNull<u8>,
        storage_len: usize,
    ) -> Result<Self> {
        Self::check_storage_alignment(storage)?;
        let allocator = BuddyAllocator::attach(index, index_len)?;
        if (storage_len as u64) < allocator.total_size() {
            return Err(ShmError::corruption(format!(
                "storage area of {} bytes cannot hold a buddy tree of {} bytes",
                storage_len,
                allocator.total_size()
            )));
        }
        Ok(Self {
            storage,
            storage_len: allocator.total_size(),
            allocator,
        })
    }

    fn check_storage_alignment(storage: NonNull<u8>) -> Result<()> {
        if storage.as_ptr() as usize % STORAGE_ALIGN != 0 {
            return Err(ShmError::Alignment {
                offset: storage.as_ptr() as u64,
                alignment: STORAGE_ALIGN,
            });
        }
        Ok(())
    }

    /// The underlying allocator
    pub fn allocator(&self) -> &BuddyAllocator {
        &self.allocator
    }

    /// Storage base address in this process
    pub fn storage_base(&self) -> *const u8 {
        self.storage.as_ptr()
    }

    /// Allocate `size` raw bytes
    pub fn allocate(&self, size: u64) -> Result<OffsetPtr<u8>> {
        self.allocator.allocate(size).map(OffsetPtr::from_offset)
    }

    /// Free `size` raw bytes at `ptr`
    pub fn free(&self, ptr: OffsetPtr<u8>, size: u64) -> Result<()> {
        if ptr.is_null() {
            return Err(ShmError::NullPointer);
        }
        self.allocator.deallocate(ptr.offset(), size)
    }

    /// Allocate uninitialized storage for `count` values of `T`
    pub fn alloc_array<T>(&self, count: u64) -> Result<OffsetPtr<T>> {
        let alignment = std::mem::align_of::<T>();
        if alignment > STORAGE_ALIGN {
            return Err(ShmError::Alignment { offset: 0, alignment });
        }
        let bytes = (std::mem::size_of::<T>() as u64)
            .checked_mul(count)
            .ok_or_else(|| ShmError::exhausted(u64::MAX, self.available_bytes()))?;
        self.allocate(bytes).map(OffsetPtr::cast)
    }

    /// Free storage obtained from [`Arena::alloc_array`]
    ///
    /// The values are not released; that is the caller's job.
    pub fn free_array<T>(&self, ptr: OffsetPtr<T>, count: u64) -> Result<()> {
        self.free(ptr.cast(), std::mem::size_of::<T>() as u64 * count)
    }

    /// Move `value` into newly allocated storage
    ///
    /// If no block is available, `value` is released before the error is
    /// returned so that its own storage does not leak.
    pub fn new_object<T: ShmValue>(&self, mut value: T) -> Result<ShmBox<T>> {
        let placed = self.alloc_array::<T>(1).and_then(|ptr| match self.resolve(ptr) {
            Ok(slot) => Ok((ptr, slot)),
            Err(e) => {
                self.free_array(ptr, 1)?;
                Err(e)
            }
        });
        let (ptr, slot) = match placed {
            Ok(placed) => placed,
            Err(e) => {
                if let Err(release_err) = value.release(self) {
                    tracing::warn!(error = %release_err, "failed to release unplaced value");
                }
                return Err(e);
            }
        };
        // SAFETY: freshly allocated, aligned and in bounds.
        unsafe { slot.as_ptr().write(value) };
        Ok(ShmBox::new(ptr))
    }

    /// Allocate storage first, then construct the value in it
    ///
    /// A failing constructor frees the block before its error is returned.
    pub fn new_with<T, F>(&self, init: F) -> Result<ShmBox<T>>
    where
        F: FnOnce(&Arena) -> Result<T>,
    {
        let ptr = self.alloc_array::<T>(1)?;
        let slot = match self.resolve(ptr) {
            Ok(slot) => slot,
            Err(e) => {
                self.free_array(ptr, 1)?;
                return Err(e);
            }
        };
        match init(self) {
            Ok(value) => {
                // SAFETY: freshly allocated, aligned and in bounds.
                unsafe { slot.as_ptr().write(value) };
                Ok(ShmBox::new(ptr))
            }
            Err(e) => {
                self.free_array(ptr, 1)?;
                Err(e)
            }
        }
    }

    /// Release the object's storage, then free the object itself
    ///
    /// The object's block is freed even when `release` fails; the release
    /// error is returned afterwards.
    pub fn delete<T: ShmValue>(&self, boxed: ShmBox<T>) -> Result<()> {
        let ptr = boxed.into_raw();
        // SAFETY: the handle was the unique owner of this object.
        let value = unsafe { self.deref_mut(ptr)? };
        let released = value.release(self);
        self.free_array(ptr, 1)?;
        released
    }

    /// Borrow the object owned by `boxed`
    ///
    /// `boxed` must come from this arena's segment; see the arena binding
    /// notes on [`ShmBox`].
    pub fn get<'a, T>(&'a self, boxed: &'a ShmBox<T>) -> Result<&'a T> {
        // SAFETY: the handle owns the object; shared borrow of the handle.
        unsafe { self.deref(boxed.as_ptr()) }
    }

    /// Mutably borrow the object owned by `boxed`
    pub fn get_mut<'a, T>(&'a self, boxed: &'a mut ShmBox<T>) -> Result<&'a mut T> {
        // SAFETY: the handle owns the object; exclusive borrow of the handle.
        unsafe { self.deref_mut(boxed.as_ptr()) }
    }

    /// Translate an offset into an address in this process
    ///
    /// Null, the reserved offset 0, out-of-range and misaligned offsets are
    /// rejected.
    pub fn resolve<T>(&self, ptr: OffsetPtr<T>) -> Result<NonNull<T>> {
        self.resolve_range(ptr, 1)
    }

    /// Like [`Arena::resolve`], checking that `count` consecutive values fit
    pub fn resolve_range<T>(&self, ptr: OffsetPtr<T>, count: u64) -> Result<NonNull<T>> {
        if ptr.is_null() || ptr.offset() == 0 {
            return Err(ShmError::NullPointer);
        }
        let offset = ptr.offset();
        let size = (std::mem::size_of::<T>() as u64).saturating_mul(count);
        let in_bounds = offset
            .checked_add(size)
            .is_some_and(|end| end <= self.storage_len);
        if !in_bounds {
            tracing::error!(offset, size, limit = self.storage_len, "offset outside storage area");
            return Err(ShmError::out_of_bounds(offset, size, self.storage_len));
        }
        let alignment = std::mem::align_of::<T>();
        if offset % alignment as u64 != 0 {
            return Err(ShmError::Alignment { offset, alignment });
        }
        // SAFETY: offset + size lies inside the storage area.
        Ok(unsafe {
            NonNull::new_unchecked(self.storage.as_ptr().add(offset as usize).cast::<T>())
        })
    }

    /// Borrow the `T` at `ptr`
    ///
    /// # Safety
    /// `ptr` must name an initialized `T` that is not mutably borrowed for `'a`.
    pub unsafe fn deref<'a, T>(&'a self, ptr: OffsetPtr<T>) -> Result<&'a T> {
        Ok(&*self.resolve(ptr)?.as_ptr())
    }

    /// Mutably borrow the `T` at `ptr`
    ///
    /// # Safety
    /// `ptr` must name an initialized `T` that is not otherwise borrowed for `'a`.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn deref_mut<'a, T>(&'a self, ptr: OffsetPtr<T>) -> Result<&'a mut T> {
        Ok(&mut *self.resolve(ptr)?.as_ptr())
    }

    /// Borrow `len` consecutive values starting at `ptr`; empty for `len == 0`
    ///
    /// # Safety
    /// As for [`Arena::deref`], for every value in the range.
    pub unsafe fn slice<'a, T>(&'a self, ptr: OffsetPtr<T>, len: u64) -> Result<&'a [T]> {
        if len == 0 {
            return Ok(&[]);
        }
        let base = self.resolve_range(ptr, len)?;
        Ok(std::slice::from_raw_parts(base.as_ptr(), len as usize))
    }

    /// Mutably borrow `len` consecutive values starting at `ptr`
    ///
    /// # Safety
    /// As for [`Arena::deref_mut`], for every value in the range.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn slice_mut<'a, T>(&'a self, ptr: OffsetPtr<T>, len: u64) -> Result<&'a mut [T]> {
        if len == 0 {
            return Ok(&mut []);
        }
        let base = self.resolve_range(ptr, len)?;
        Ok(std::slice::from_raw_parts_mut(base.as_ptr(), len as usize))
    }

    /// Convert an address inside this mapping back into an offset
    pub fn to_offset_ptr<T>(&self, address: *const T) -> Result<OffsetPtr<T>> {
        let base = self.storage.as_ptr() as usize;
        let address = address as usize;
        let size = std::mem::size_of::<T>() as u64;
        if address < base || (address - base) as u64 >= self.storage_len {
            return Err(ShmError::out_of_bounds(
                address.wrapping_sub(base) as u64,
                size,
                self.storage_len,
            ));
        }
        Ok(OffsetPtr::from_offset((address - base) as u64))
    }

    /// Bytes held by live allocations
    pub fn used_bytes(&self) -> u64 {
        self.allocator.used_size()
    }

    /// Size of the storage area
    pub fn total_bytes(&self) -> u64 {
        self.allocator.total_size()
    }

    /// Bytes still obtainable
    pub fn available_bytes(&self) -> u64 {
        self.allocator.available_size()
    }

    /// Allocator accounting snapshot
    pub fn stats(&self) -> BuddyStats {
        self.allocator.stats()
    }
}

// SAFETY: allocator state is serialized by the buddy allocator's lock;
// object access goes through `&`/`&mut` borrows of handles and containers.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}
