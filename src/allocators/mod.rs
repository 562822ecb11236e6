//! Memory allocation traits and utilities

pub mod buddy;
pub mod traits;

pub use buddy::{BuddyAllocator, BuddyStats};
pub use traits::{OffsetAllocator, OffsetAllocatorExt};
