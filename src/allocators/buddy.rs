//! Binary buddy allocator whose bookkeeping lives inside the segment
//!
//! The index area holds a small header followed by a complete binary tree with
//! one state byte per node. Node 0 covers the whole storage area
//! (`2^max_order` bytes); the children of node `i` are `2i + 1` (left half) and
//! `2i + 2` (right half); leaves are blocks of `2^min_order` bytes.
//!
//! ```text
//! ┌──────────────┬───────────────────────────────┐
//! │ IndexHeader  │ tree: [state; 2^(L+1) - 1]    │   L = max_order - min_order
//! └──────────────┴───────────────────────────────┘
//! ```
//!
//! Only offsets are recorded, never addresses, so any process that maps the
//! segment can attach to the same index and keep allocating.

use std::{
    ptr::{addr_of, addr_of_mut, NonNull},
    sync::{Mutex, MutexGuard},
};

use super::traits::OffsetAllocator;
use crate::{
    error::{Result, ShmError},
    utils::{align_up, ceil_log2},
};

/// Smallest supported block order (16-byte blocks)
pub const MIN_ORDER_LIMIT: u32 = 4;

/// Largest supported storage order
pub const MAX_ORDER_LIMIT: u32 = 40;

/// Largest supported distance between `min_order` and `max_order`
pub const MAX_TREE_DEPTH: u32 = 28;

/// Magic number of the index header ("BUDY")
pub const INDEX_MAGIC: u32 = 0x4255_4459;

/// Index layout version
pub const INDEX_VERSION: u32 = 1;

const INDEX_HEADER_SIZE: usize = 64;

/// Allocator bookkeeping stored at the front of the index area
#[repr(C)]
struct IndexHeader {
    magic: u32,
    version: u32,
    min_order: u32,
    max_order: u32,
    used_bytes: u64,
    live_blocks: u64,
    _reserved: [u8; 32],
}

const _: () = assert!(std::mem::size_of::<IndexHeader>() == INDEX_HEADER_SIZE);

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeState {
    Unused = 0,
    Used = 1,
    Split = 2,
    Full = 3,
}

impl NodeState {
    fn from_u8(value: u8, index: usize) -> Result<Self> {
        match value {
            0 => Ok(Self::Unused),
            1 => Ok(Self::Used),
            2 => Ok(Self::Split),
            3 => Ok(Self::Full),
            other => Err(ShmError::corruption(format!(
                "buddy node {} has invalid state {}",
                index, other
            ))),
        }
    }
}

/// Snapshot of allocator accounting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuddyStats {
    /// Size of the storage area
    pub total_bytes: u64,
    /// Bytes held by live allocations (rounded to block sizes)
    pub used_bytes: u64,
    /// Bytes still obtainable
    pub available_bytes: u64,
    /// Number of live allocations
    pub live_blocks: u64,
    /// Largest block that can currently be allocated
    pub largest_free_block: u64,
    /// Smallest block order
    pub min_order: u32,
    /// Order of the whole storage area
    pub max_order: u32,
}

/// Buddy allocator over an index area living in shared memory
#[derive(Debug)]
pub struct BuddyAllocator {
    /// Header at the front of the index area
    header: NonNull<IndexHeader>,
    /// First tree node
    tree: NonNull<u8>,
    /// Number of tree nodes
    node_count: usize,
    min_order: u32,
    max_order: u32,
    /// Serializes allocator calls made by threads of this process
    lock: Mutex<()>,
}

impl BuddyAllocator {
    /// Bytes needed for the index area of an allocator with the given orders
    pub fn index_size(min_order: u32, max_order: u32) -> usize {
        align_up(INDEX_HEADER_SIZE + Self::node_count(min_order, max_order), 64)
    }

    fn node_count(min_order: u32, max_order: u32) -> usize {
        (1usize << (max_order - min_order + 1)) - 1
    }

    /// Check that a pair of orders describes a supported allocator
    pub fn validate_orders(min_order: u32, max_order: u32) -> Result<()> {
        if min_order < MIN_ORDER_LIMIT {
            return Err(ShmError::invalid_parameter(
                "min_order",
                format!("must be at least {}", MIN_ORDER_LIMIT),
            ));
        }
        if max_order > MAX_ORDER_LIMIT {
            return Err(ShmError::invalid_parameter(
                "max_order",
                format!("must be at most {}", MAX_ORDER_LIMIT),
            ));
        }
        if max_order <= min_order {
            return Err(ShmError::invalid_parameter(
                "max_order",
                "must be greater than min_order",
            ));
        }
        if max_order - min_order > MAX_TREE_DEPTH {
            return Err(ShmError::invalid_parameter(
                "max_order",
                format!("at most {} orders above min_order are supported", MAX_TREE_DEPTH),
            ));
        }
        Ok(())
    }

    /// Write a fresh index into `index` and reserve offset 0
    ///
    /// # Safety
    /// - `index` must be valid for reads and writes of `index_len` bytes and
    ///   aligned to 8 bytes
    /// - The memory must remain valid for the lifetime of the allocator
    pub unsafe fn format(
        index: NonNull<u8>,
        index_len: usize,
        min_order: u32,
        max_order: u32,
    ) -> Result<Self> {
        Self::validate_orders(min_order, max_order)?;
        let required = Self::index_size(min_order, max_order);
        if index_len < required {
            return Err(ShmError::invalid_parameter(
                "index_len",
                format!("index area needs {} bytes, got {}", required, index_len),
            ));
        }

        std::ptr::write_bytes(index.as_ptr(), 0, required);
        let header = index.cast::<IndexHeader>();
        header.as_ptr().write(IndexHeader {
            magic: INDEX_MAGIC,
            version: INDEX_VERSION,
            min_order,
            max_order,
            used_bytes: 0,
            live_blocks: 0,
            _reserved: [0; 32],
        });

        let allocator = Self::from_parts(index, min_order, max_order);
        allocator.set_node(0, NodeState::Unused);

        // The first minimum-order block is consumed here and never returned,
        // so offset 0 never denotes user data.
        let reserved = allocator.alloc_order(min_order)?;
        if reserved != Some(0) {
            return Err(ShmError::corruption("failed to reserve offset 0"));
        }

        tracing::debug!(
            min_order,
            max_order,
            index_bytes = required,
            "formatted buddy index"
        );
        Ok(allocator)
    }

    /// Reinterpret an existing index in place
    ///
    /// # Safety
    /// Same requirements as [`BuddyAllocator::format`]; the memory must hold an
    /// index previously written by `format`.
    pub unsafe fn attach(index: NonNull<u8>, index_len: usize) -> Result<Self> {
        if index_len < INDEX_HEADER_SIZE {
            return Err(ShmError::corruption("index area smaller than its header"));
        }

        let header = index.cast::<IndexHeader>().as_ptr();
        let magic = addr_of!((*header).magic).read();
        if magic != INDEX_MAGIC {
            return Err(ShmError::corruption(format!(
                "buddy index magic {:#010x}, expected {:#010x}",
                magic, INDEX_MAGIC
            )));
        }
        let version = addr_of!((*header).version).read();
        if version != INDEX_VERSION {
            return Err(ShmError::corruption(format!(
                "unsupported buddy index version {}",
                version
            )));
        }

        let min_order = addr_of!((*header).min_order).read();
        let max_order = addr_of!((*header).max_order).read();
        Self::validate_orders(min_order, max_order)
            .map_err(|e| ShmError::corruption(format!("buddy index orders: {}", e)))?;
        if index_len < Self::index_size(min_order, max_order) {
            return Err(ShmError::corruption("index area truncated"));
        }

        let allocator = Self::from_parts(index, min_order, max_order);
        if allocator.node(0)? == NodeState::Unused {
            return Err(ShmError::corruption("reserved block missing from buddy index"));
        }
        Ok(allocator)
    }

    fn from_parts(index: NonNull<u8>, min_order: u32, max_order: u32) -> Self {
        // SAFETY: callers guarantee the index area covers header and tree.
        let tree = unsafe { NonNull::new_unchecked(index.as_ptr().add(INDEX_HEADER_SIZE)) };
        Self {
            header: index.cast(),
            tree,
            node_count: Self::node_count(min_order, max_order),
            min_order,
            max_order,
            lock: Mutex::new(()),
        }
    }

    /// Smallest block order
    pub fn min_order(&self) -> u32 {
        self.min_order
    }

    /// Order of the whole storage area
    pub fn max_order(&self) -> u32 {
        self.max_order
    }

    /// Block order serving a request of `size` bytes
    pub fn order_for(&self, size: u64) -> Result<u32> {
        let order = ceil_log2(size).max(self.min_order);
        if order > self.max_order {
            return Err(ShmError::exhausted(size, self.available_size()));
        }
        Ok(order)
    }

    /// Number of outstanding allocations
    pub fn live_blocks(&self) -> u64 {
        // SAFETY: header validated at construction.
        unsafe { addr_of!((*self.header.as_ptr()).live_blocks).read() }
    }

    /// Largest block that could be allocated right now
    pub fn largest_free_block(&self) -> u64 {
        let _guard = self.guard();
        self.largest_free(0, 1u64 << self.max_order).unwrap_or(0)
    }

    /// Allocator accounting snapshot
    pub fn stats(&self) -> BuddyStats {
        BuddyStats {
            total_bytes: self.total_size(),
            used_bytes: self.used_size(),
            available_bytes: self.available_size(),
            live_blocks: self.live_blocks(),
            largest_free_block: self.largest_free_block(),
            min_order: self.min_order,
            max_order: self.max_order,
        }
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn node(&self, index: usize) -> Result<NodeState> {
        if index >= self.node_count {
            return Err(ShmError::corruption(format!(
                "buddy node {} outside tree of {} nodes",
                index, self.node_count
            )));
        }
        // SAFETY: index checked against the tree length.
        let raw = unsafe { self.tree.as_ptr().add(index).read() };
        NodeState::from_u8(raw, index)
    }

    fn set_node(&self, index: usize, state: NodeState) {
        debug_assert!(index < self.node_count);
        // SAFETY: every caller derives `index` from a node inside the tree.
        unsafe { self.tree.as_ptr().add(index).write(state as u8) }
    }

    fn adjust_accounting(&self, bytes: u64, allocated: bool) {
        let header = self.header.as_ptr();
        // SAFETY: header validated at construction; callers hold the lock.
        unsafe {
            let used = addr_of_mut!((*header).used_bytes);
            let live = addr_of_mut!((*header).live_blocks);
            if allocated {
                used.write(used.read() + bytes);
                live.write(live.read() + 1);
            } else {
                used.write(used.read().saturating_sub(bytes));
                live.write(live.read().saturating_sub(1));
            }
        }
    }

    fn index_offset(&self, index: usize, length: u64) -> u64 {
        (index as u64 + 1) * length - (1u64 << self.max_order)
    }

    /// Depth-first, left-first search so the lowest free offset wins
    fn alloc_order(&self, order: u32) -> Result<Option<u64>> {
        let target = 1u64 << order;
        let mut index = 0usize;
        let mut length = 1u64 << self.max_order;

        loop {
            let state = self.node(index)?;
            if length == target {
                if state == NodeState::Unused {
                    self.set_node(index, NodeState::Used);
                    self.mark_parent(index)?;
                    return Ok(Some(self.index_offset(index, length)));
                }
            } else {
                match state {
                    NodeState::Used | NodeState::Full => {}
                    NodeState::Unused => {
                        self.set_node(index, NodeState::Split);
                        self.set_node(index * 2 + 1, NodeState::Unused);
                        self.set_node(index * 2 + 2, NodeState::Unused);
                        index = index * 2 + 1;
                        length /= 2;
                        continue;
                    }
                    NodeState::Split => {
                        index = index * 2 + 1;
                        length /= 2;
                        continue;
                    }
                }
            }

            // Left child exhausted: try its right sibling.
            if index % 2 == 1 {
                index += 1;
                continue;
            }
            // Right child exhausted: climb until an untried right sibling exists.
            loop {
                if index == 0 {
                    return Ok(None);
                }
                index = (index - 1) / 2;
                length *= 2;
                if index % 2 == 1 {
                    index += 1;
                    break;
                }
            }
        }
    }

    fn mark_parent(&self, mut index: usize) -> Result<()> {
        while index > 0 {
            let buddy = if index % 2 == 1 { index + 1 } else { index - 1 };
            match self.node(buddy)? {
                NodeState::Used | NodeState::Full => {
                    index = (index - 1) / 2;
                    self.set_node(index, NodeState::Full);
                }
                _ => break,
            }
        }
        Ok(())
    }

    fn free_block(&self, offset: u64, order: u32) -> Result<()> {
        let mut left = 0u64;
        let mut length = 1u64 << self.max_order;
        let mut index = 0usize;

        loop {
            match self.node(index)? {
                NodeState::Used => {
                    if offset != left {
                        return Err(ShmError::invalid_free(
                            offset,
                            format!("offset lies inside the live block at {:#x}", left),
                        ));
                    }
                    if length != 1u64 << order {
                        return Err(ShmError::invalid_free(
                            offset,
                            format!(
                                "block holds {} bytes, free asked for {}",
                                length,
                                1u64 << order
                            ),
                        ));
                    }
                    return self.combine(index);
                }
                NodeState::Unused => {
                    return Err(ShmError::invalid_free(offset, "block is not allocated"));
                }
                NodeState::Split | NodeState::Full => {
                    if length == 1u64 << self.min_order {
                        return Err(ShmError::corruption(format!(
                            "leaf node {} is marked split",
                            index
                        )));
                    }
                    length /= 2;
                    if offset < left + length {
                        index = index * 2 + 1;
                    } else {
                        left += length;
                        index = index * 2 + 2;
                    }
                }
            }
        }
    }

    /// Release `index` and merge upwards while the buddy is free
    fn combine(&self, mut index: usize) -> Result<()> {
        loop {
            if index == 0 {
                self.set_node(0, NodeState::Unused);
                return Ok(());
            }
            let buddy = if index % 2 == 1 { index + 1 } else { index - 1 };
            if self.node(buddy)? != NodeState::Unused {
                self.set_node(index, NodeState::Unused);
                while index > 0 {
                    index = (index - 1) / 2;
                    if self.node(index)? == NodeState::Full {
                        self.set_node(index, NodeState::Split);
                    } else {
                        break;
                    }
                }
                return Ok(());
            }
            index = (index - 1) / 2;
        }
    }

    fn largest_free(&self, index: usize, length: u64) -> Result<u64> {
        Ok(match self.node(index)? {
            NodeState::Unused => length,
            NodeState::Used | NodeState::Full => 0,
            NodeState::Split => {
                let left = self.largest_free(index * 2 + 1, length / 2)?;
                let right = self.largest_free(index * 2 + 2, length / 2)?;
                left.max(right)
            }
        })
    }
}

impl OffsetAllocator for BuddyAllocator {
    fn allocate(&self, size: u64) -> Result<u64> {
        let order = self.order_for(size)?;
        let _guard = self.guard();

        match self.alloc_order(order)? {
            Some(offset) => {
                self.adjust_accounting(1u64 << order, true);
                tracing::debug!(offset = format_args!("{:#010x}", offset), size, order, "malloc");
                Ok(offset)
            }
            None => Err(ShmError::exhausted(size, self.available_size())),
        }
    }

    fn deallocate(&self, offset: u64, size: u64) -> Result<()> {
        if offset == 0 {
            return Err(ShmError::invalid_free(0, "offset 0 is reserved"));
        }
        if !self.owns(offset) {
            return Err(ShmError::invalid_free(offset, "offset outside the storage area"));
        }
        let order = self
            .order_for(size)
            .map_err(|_| {
                ShmError::invalid_free(offset, format!("no block can hold {} bytes", size))
            })?;

        let _guard = self.guard();
        if let Err(e) = self.free_block(offset, order) {
            tracing::warn!(
                offset = format_args!("{:#010x}", offset),
                size,
                error = %e,
                "rejected free"
            );
            return Err(e);
        }
        self.adjust_accounting(1u64 << order, false);
        tracing::debug!(offset = format_args!("{:#010x}", offset), size, order, "free");
        Ok(())
    }

    fn total_size(&self) -> u64 {
        1u64 << self.max_order
    }

    fn used_size(&self) -> u64 {
        // SAFETY: header validated at construction.
        unsafe { addr_of!((*self.header.as_ptr()).used_bytes).read() }
    }

    fn available_size(&self) -> u64 {
        // The reserved block at offset 0 is never available.
        self.total_size()
            .saturating_sub(self.used_size())
            .saturating_sub(1u64 << self.min_order)
    }

    fn block_size_for(&self, size: u64) -> Option<u64> {
        self.order_for(size).ok().map(|order| 1u64 << order)
    }
}

// SAFETY: the allocator only touches shared memory through raw pointers while
// holding `lock`.
unsafe impl Send for BuddyAllocator {}
unsafe impl Sync for BuddyAllocator {}

#[cfg(test)]
mod tests {
    use super::*;

    /// 8-byte aligned scratch index
    fn index_buffer(min_order: u32, max_order: u32) -> Vec<u64> {
        vec![0u64; BuddyAllocator::index_size(min_order, max_order) / 8]
    }

    fn format(buffer: &mut [u64], min_order: u32, max_order: u32) -> BuddyAllocator {
        let ptr = NonNull::new(buffer.as_mut_ptr().cast::<u8>()).unwrap();
        unsafe { BuddyAllocator::format(ptr, buffer.len() * 8, min_order, max_order).unwrap() }
    }

    #[test]
    fn test_offset_zero_is_reserved() {
        let mut buffer = index_buffer(4, 10);
        let buddy = format(&mut buffer, 4, 10);

        assert_eq!(buddy.used_size(), 0);
        assert_eq!(buddy.allocate(1).unwrap(), 16);
        assert_eq!(buddy.allocate(16).unwrap(), 32);
        assert!(buddy.deallocate(0, 16).is_err());
    }

    #[test]
    fn test_order_clamping() {
        let mut buffer = index_buffer(4, 10);
        let buddy = format(&mut buffer, 4, 10);

        assert_eq!(buddy.order_for(0).unwrap(), 4);
        assert_eq!(buddy.order_for(3).unwrap(), 4);
        assert_eq!(buddy.order_for(17).unwrap(), 5);
        assert_eq!(buddy.order_for(1024).unwrap(), 10);
        assert!(matches!(buddy.order_for(1025), Err(ShmError::Exhausted { .. })));
        assert_eq!(buddy.block_size_for(100), Some(128));
    }

    #[test]
    fn test_coalescing_reuses_parent_block() {
        let mut buffer = index_buffer(4, 12);
        let buddy = format(&mut buffer, 4, 12);

        let x = buddy.allocate(64).unwrap();
        let y = buddy.allocate(64).unwrap();
        let z = buddy.allocate(64).unwrap();
        assert_eq!((x, y, z), (64, 128, 192));
        assert_eq!(y ^ 64, z, "y and z are buddies");

        buddy.deallocate(y, 64).unwrap();
        buddy.deallocate(z, 64).unwrap();
        assert_eq!(buddy.allocate(128).unwrap(), y);
    }

    #[test]
    fn test_used_bytes_round_trip() {
        let mut buffer = index_buffer(4, 14);
        let buddy = format(&mut buffer, 4, 14);

        let before = buddy.used_size();
        let blocks: Vec<(u64, u64)> = [10u64, 100, 1000, 33, 16, 500]
            .iter()
            .map(|&size| (buddy.allocate(size).unwrap(), size))
            .collect();
        assert_eq!(buddy.used_size(), 16 + 128 + 1024 + 64 + 16 + 512);
        assert_eq!(buddy.live_blocks(), 6);

        for (offset, size) in blocks.into_iter().rev() {
            buddy.deallocate(offset, size).unwrap();
        }
        assert_eq!(buddy.used_size(), before);
        assert_eq!(buddy.live_blocks(), 0);
        assert_eq!(buddy.largest_free_block(), 1 << 13);
    }

    #[test]
    fn test_exhaustion_and_recovery() {
        let mut buffer = index_buffer(4, 8);
        let buddy = format(&mut buffer, 4, 8);

        // 256 bytes of storage, 16 reserved: fifteen 16-byte blocks fit
        let blocks: Vec<u64> = (0..15).map(|_| buddy.allocate(16).unwrap()).collect();
        assert!(matches!(buddy.allocate(1), Err(ShmError::Exhausted { .. })));
        assert_eq!(buddy.available_size(), 0);

        buddy.deallocate(blocks[3], 16).unwrap();
        assert_eq!(buddy.allocate(16).unwrap(), blocks[3]);
    }

    #[test]
    fn test_invalid_frees_are_rejected() {
        let mut buffer = index_buffer(4, 10);
        let buddy = format(&mut buffer, 4, 10);

        let offset = buddy.allocate(64).unwrap();
        assert!(matches!(buddy.deallocate(offset + 16, 16), Err(ShmError::InvalidFree { .. })));
        assert!(matches!(buddy.deallocate(offset, 16), Err(ShmError::InvalidFree { .. })));
        assert!(matches!(buddy.deallocate(4096, 16), Err(ShmError::InvalidFree { .. })));

        buddy.deallocate(offset, 64).unwrap();
        assert!(matches!(buddy.deallocate(offset, 64), Err(ShmError::InvalidFree { .. })));
        assert_eq!(buddy.used_size(), 0);
    }

    #[test]
    fn test_attach_reinterprets_existing_index() {
        let mut buffer = index_buffer(4, 12);
        let first = buddy_offsets(&mut buffer);

        let ptr = NonNull::new(buffer.as_mut_ptr().cast::<u8>()).unwrap();
        let attached = unsafe { BuddyAllocator::attach(ptr, buffer.len() * 8).unwrap() };
        assert_eq!(attached.used_size(), 256 + 32);
        assert_eq!(attached.live_blocks(), 2);

        let next = attached.allocate(256).unwrap();
        assert_ne!(next, first.0);
        attached.deallocate(first.0, 256).unwrap();
        attached.deallocate(first.1, 32).unwrap();
        attached.deallocate(next, 256).unwrap();
        assert_eq!(attached.used_size(), 0);
    }

    fn buddy_offsets(buffer: &mut [u64]) -> (u64, u64) {
        let buddy = format(buffer, 4, 12);
        (buddy.allocate(256).unwrap(), buddy.allocate(32).unwrap())
    }

    #[test]
    fn test_attach_rejects_garbage() {
        let mut buffer = index_buffer(4, 10);
        let ptr = NonNull::new(buffer.as_mut_ptr().cast::<u8>()).unwrap();
        let result = unsafe { BuddyAllocator::attach(ptr, buffer.len() * 8) };
        assert!(matches!(result, Err(ShmError::Corruption { .. })));
    }

    #[test]
    fn test_order_validation() {
        assert!(BuddyAllocator::validate_orders(4, 20).is_ok());
        assert!(BuddyAllocator::validate_orders(3, 20).is_err());
        assert!(BuddyAllocator::validate_orders(10, 10).is_err());
        assert!(BuddyAllocator::validate_orders(4, 41).is_err());
        assert!(BuddyAllocator::validate_orders(4, 33).is_err());
    }
}
