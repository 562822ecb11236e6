//! # shmkit - Position-Independent Containers for Shared Memory
//!
//! shmkit builds data structures inside one fixed-size block of shared memory
//! so that independent processes can map the block at different virtual
//! addresses and still see the same strings, arrays, lists and hash tables.
//!
//! ## Features
//!
//! - **Segments**: File-backed and memfd mappings with a validated header
//! - **Buddy allocator**: Power-of-two blocks, bookkeeping kept inside the segment
//! - **Offset pointers**: Every link is a byte offset from the storage base
//! - **Containers**: `ShmString`, `ShmVec`, `ShmList`, `ShmHashMap`, `ShmHashSet`
//! - **Root slots**: Publish container handles in the header for other processes
//! - **Snapshots**: Flatten containers and named objects into portable bytes
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      Segment                             │
//! ├────────────┬──────────────────┬──────────────────────────┤
//! │  Header    │  Buddy index     │  Storage area            │
//! │  - magic   │  - node states   │  - container headers     │
//! │  - visits  │  - used bytes    │  - elements, nodes       │
//! │  - roots   │                  │  - bucket arrays         │
//! └────────────┴──────────────────┴──────────────────────────┘
//!                        │
//!                        ▼
//!        ┌─────────────────────────────────┐
//!        │  Arena (per process base addr)  │
//!        │  OffsetPtr<T> ⇄ &T              │
//!        └─────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use shmkit::{ShmHashMap, ShmString, Segment, SegmentConfig};
//!
//! # fn main() -> shmkit::Result<()> {
//! let segment = Segment::attach(SegmentConfig::new("sessions"))?;
//! let arena = segment.arena();
//!
//! let mut names = arena.new_object(ShmHashMap::<u64, ShmString>::new())?;
//! let name = ShmString::from_str(arena, "alice")?;
//! arena.get_mut(&mut names)?.insert(arena, 7, name)?;
//! segment.set_root(0, names.into_raw())?;
//! # Ok(())
//! # }
//! ```

pub mod allocators;
pub mod arena;
pub mod containers;
pub mod error;
pub mod memory;
pub mod utils;

// Main API re-exports
pub use allocators::{BuddyAllocator, BuddyStats, OffsetAllocator, OffsetAllocatorExt};
pub use arena::{Arena, HeapArena, OffsetPtr, ShmBox, ShmKey, ShmValue};
pub use containers::{
    HashCursor, ListCursor, ObjType, ShmHashMap, ShmHashSet, ShmList, ShmNamed, ShmSnapshot,
    ShmString, ShmVec,
};
pub use error::{Result, ShmError};
pub use memory::{
    BackingType, OpenMode, Segment, SegmentConfig, SegmentManager, SegmentStats, ROOT_SLOTS,
};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
