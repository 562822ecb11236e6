//! Allocator trait definition

use crate::error::Result;

/// Trait for allocators that hand out offsets into a shared storage area
///
/// Offsets are relative to the start of the storage area, so the same value is
/// meaningful in every process that maps the segment, whatever its base address.
pub trait OffsetAllocator: Send + Sync + std::fmt::Debug {
    /// Allocate a block of at least `size` bytes and return its offset
    fn allocate(&self, size: u64) -> Result<u64>;

    /// Return a block previously obtained from [`OffsetAllocator::allocate`]
    fn deallocate(&self, offset: u64, size: u64) -> Result<()>;

    /// Get the size of the managed storage area
    fn total_size(&self) -> u64;

    /// Get the number of bytes held by live allocations
    fn used_size(&self) -> u64;

    /// Get the amount of available memory
    fn available_size(&self) -> u64 {
        self.total_size().saturating_sub(self.used_size())
    }

    /// Check if an offset falls inside the managed storage area
    fn owns(&self, offset: u64) -> bool {
        offset < self.total_size()
    }

    /// Bytes actually reserved for a request of `size` bytes, if it can ever be served
    fn block_size_for(&self, size: u64) -> Option<u64>;

    /// Get allocator type name for debugging
    fn type_name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Common allocator operations
pub trait OffsetAllocatorExt: OffsetAllocator {
    /// Check if allocator has enough space for allocation
    fn can_allocate(&self, size: u64) -> bool {
        self.block_size_for(size)
            .is_some_and(|block| self.available_size() >= block)
    }

    /// Get utilization percentage (0.0 to 1.0)
    fn utilization(&self) -> f64 {
        if self.total_size() == 0 {
            return 0.0;
        }
        self.used_size() as f64 / self.total_size() as f64
    }
}

// Blanket implementation for all OffsetAllocators
impl<T: OffsetAllocator + ?Sized> OffsetAllocatorExt for T {}
