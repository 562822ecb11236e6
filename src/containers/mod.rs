//! Position-independent containers
//!
//! Container headers are plain `#[repr(C)]` data holding offsets and counters.
//! They can live on the Rust stack, inside a [`crate::arena::ShmBox`], or
//! nested in another container; their elements always live in the arena
//! passed to each call. Every container implements
//! [`crate::arena::ShmValue`], so `clone_in` deep-copies and `release` frees
//! everything it owns. [`ShmSnapshot`] flattens a container into a
//! portable byte image and rebuilds it in any arena.

pub mod hash;
pub mod list;
pub mod named;
pub mod snapshot;
pub mod string;
pub mod vec;

pub use hash::{stable_hash, HashCursor, HashIter, ShmHashMap, ShmHashSet};
pub use list::{ListCursor, ListIter, ShmList};
pub use named::ShmNamed;
pub use snapshot::{peek_obj_type, ObjType, ShmSnapshot};
pub use string::ShmString;
pub use vec::ShmVec;
