//! Process-local arena backed by heap memory

use std::{ops::Deref, ptr::NonNull};

use super::{Arena, STORAGE_ALIGN};
use crate::{allocators::BuddyAllocator, error::Result};

#[derive(Clone, Copy)]
#[repr(C, align(64))]
struct CacheLine([u8; STORAGE_ALIGN]);

/// An [`Arena`] over ordinary heap memory
///
/// Behaves exactly like a segment's arena but is visible to this process only.
/// Useful for tests, benchmarks and for building container images before
/// copying them into a segment.
pub struct HeapArena {
    arena: Arena,
    _index: Vec<u64>,
    _storage: Vec<CacheLine>,
}

impl HeapArena {
    /// Create an arena with `2^max_order` bytes of storage
    pub fn new(min_order: u32, max_order: u32) -> Result<Self> {
        BuddyAllocator::validate_orders(min_order, max_order)?;

        let index_len = BuddyAllocator::index_size(min_order, max_order);
        let mut index = vec![0u64; index_len / 8];
        let storage_lines = ((1usize << max_order) / STORAGE_ALIGN).max(1);
        let mut storage = vec![CacheLine([0; STORAGE_ALIGN]); storage_lines];

        let index_ptr = NonNull::new(index.as_mut_ptr().cast::<u8>())
            .ok_or_else(|| crate::ShmError::platform("heap index allocation returned null"))?;
        let storage_ptr = NonNull::new(storage.as_mut_ptr().cast::<u8>())
            .ok_or_else(|| crate::ShmError::platform("heap storage allocation returned null"))?;

        // SAFETY: both vectors are sized for the layout, never reallocated, and
        // owned by the returned value alongside the arena.
        let arena =
            unsafe { Arena::format(index_ptr, index_len, storage_ptr, min_order, max_order)? };

        Ok(Self {
            arena,
            _index: index,
            _storage: storage,
        })
    }
}

impl Deref for HeapArena {
    type Target = Arena;

    fn deref(&self) -> &Arena {
        &self.arena
    }
}

impl std::fmt::Debug for HeapArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapArena")
            .field("total_bytes", &self.arena.total_bytes())
            .field("used_bytes", &self.arena.used_bytes())
            .finish()
    }
}
