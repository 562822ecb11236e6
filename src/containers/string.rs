//! Growable byte string stored in an arena

use std::cmp::Ordering;

use crate::{
    arena::{Arena, OffsetPtr, ShmKey, ShmValue},
    error::Result,
    utils::next_pow2,
};

/// Smallest backing block a string ever allocates
pub const MIN_STRING_CAPACITY: u64 = 16;

/// Capacity chosen for a request of `requested` bytes
pub fn expected_capacity(requested: u64) -> u64 {
    next_pow2(requested).max(MIN_STRING_CAPACITY)
}

/// Variable-length byte sequence whose storage lives in an arena
///
/// The header holds only an offset and two counters, so it can itself be
/// stored in shared memory (inside a [`crate::arena::ShmBox`] or another
/// container). Capacities are powers of two, matching the buddy block sizes.
#[repr(C)]
#[derive(Debug)]
pub struct ShmString {
    data: OffsetPtr<u8>,
    len: u64,
    capacity: u64,
}

impl ShmString {
    /// Empty string without backing storage
    pub const fn new() -> Self {
        Self {
            data: OffsetPtr::null(),
            len: 0,
            capacity: 0,
        }
    }

    /// Empty string with room for at least `capacity` bytes
    pub fn with_capacity(arena: &Arena, capacity: u64) -> Result<Self> {
        let capacity = expected_capacity(capacity);
        let data = arena.alloc_array::<u8>(capacity)?;
        Ok(Self {
            data,
            len: 0,
            capacity,
        })
    }

    /// Copy `bytes` into a new string
    pub fn from_bytes(arena: &Arena, bytes: &[u8]) -> Result<Self> {
        let mut string = Self::with_capacity(arena, bytes.len() as u64)?;
        string.write_at(arena, 0, bytes)?;
        string.len = bytes.len() as u64;
        Ok(string)
    }

    /// Copy `text` into a new string
    pub fn from_str(arena: &Arena, text: &str) -> Result<Self> {
        Self::from_bytes(arena, text.as_bytes())
    }

    /// Number of bytes stored
    pub fn len(&self) -> u64 {
        self.len
    }

    /// True when no bytes are stored
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes available without reallocating
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Offset of the backing bytes; null when no storage is held
    pub fn data_ptr(&self) -> OffsetPtr<u8> {
        self.data
    }

    /// Stored bytes
    pub fn as_bytes<'a>(&'a self, arena: &'a Arena) -> Result<&'a [u8]> {
        if self.data.is_null() {
            return Ok(&[]);
        }
        // SAFETY: `data` is owned by this string; `&self` prevents mutation.
        unsafe { arena.slice(self.data, self.len) }
    }

    /// Stored bytes as UTF-8 text
    pub fn as_str<'a>(&'a self, arena: &'a Arena) -> Result<&'a str> {
        Ok(std::str::from_utf8(self.as_bytes(arena)?)?)
    }

    /// Copy out as a Rust `String`, replacing invalid UTF-8
    pub fn to_string_lossy(&self, arena: &Arena) -> Result<String> {
        Ok(String::from_utf8_lossy(self.as_bytes(arena)?).into_owned())
    }

    /// Replace the contents with `bytes`
    ///
    /// Existing capacity is reused when large enough. Otherwise a new block is
    /// allocated before the old one is freed, so on failure the string keeps
    /// its previous contents.
    pub fn assign(&mut self, arena: &Arena, bytes: &[u8]) -> Result<()> {
        let needed = bytes.len() as u64;
        if needed > self.capacity || self.data.is_null() {
            self.reallocate(arena, needed, false)?;
        }
        self.write_at(arena, 0, bytes)?;
        self.len = needed;
        Ok(())
    }

    /// Append `bytes`, growing to the next power of two when full
    pub fn append(&mut self, arena: &Arena, bytes: &[u8]) -> Result<()> {
        let needed = self.len + bytes.len() as u64;
        if needed > self.capacity || self.data.is_null() {
            self.reallocate(arena, needed, true)?;
        }
        self.write_at(arena, self.len, bytes)?;
        self.len = needed;
        Ok(())
    }

    /// Append a single byte
    pub fn push(&mut self, arena: &Arena, byte: u8) -> Result<()> {
        self.append(arena, &[byte])
    }

    /// Forget the contents, keeping the storage
    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Forget the contents and return the storage to the allocator
    pub fn clear_deep(&mut self, arena: &Arena) -> Result<()> {
        if !self.data.is_null() {
            arena.free_array(self.data, self.capacity)?;
        }
        *self = Self::new();
        Ok(())
    }

    /// Three-way comparison: bytewise, shorter prefix first
    pub fn compare(&self, arena: &Arena, other: &ShmString) -> Result<Ordering> {
        Ok(self.as_bytes(arena)?.cmp(other.as_bytes(arena)?))
    }

    /// Byte equality
    pub fn equals(&self, arena: &Arena, other: &ShmString) -> Result<bool> {
        Ok(self.len == other.len && self.as_bytes(arena)? == other.as_bytes(arena)?)
    }

    fn reallocate(&mut self, arena: &Arena, needed: u64, keep: bool) -> Result<()> {
        let capacity = expected_capacity(needed);
        let data = arena.alloc_array::<u8>(capacity)?;

        if keep && self.len > 0 {
            let copied = self.as_bytes(arena).and_then(|old| {
                let dst = arena.resolve_range(data, old.len() as u64)?;
                // SAFETY: distinct live blocks, both sized for `old.len()`.
                unsafe { std::ptr::copy_nonoverlapping(old.as_ptr(), dst.as_ptr(), old.len()) };
                Ok(())
            });
            if let Err(e) = copied {
                arena.free_array(data, capacity)?;
                return Err(e);
            }
        }

        if !self.data.is_null() {
            arena.free_array(self.data, self.capacity)?;
        }
        self.data = data;
        self.capacity = capacity;
        Ok(())
    }

    fn write_at(&mut self, arena: &Arena, at: u64, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        let dst = arena.resolve_range(self.data.add(at), bytes.len() as u64)?;
        // SAFETY: capacity checked by callers; `bytes` cannot alias our block
        // because `&mut self` excludes borrows of it.
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst.as_ptr(), bytes.len()) };
        Ok(())
    }
}

impl Default for ShmString {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl ShmValue for ShmString {
    fn clone_in(&self, arena: &Arena) -> Result<Self> {
        Self::from_bytes(arena, self.as_bytes(arena)?)
    }

    fn release(&mut self, arena: &Arena) -> Result<()> {
        self.clear_deep(arena)
    }
}

impl ShmKey for ShmString {
    type Lookup = [u8];

    fn lookup<'a>(&'a self, arena: &'a Arena) -> Result<&'a [u8]> {
        self.as_bytes(arena)
    }
}
