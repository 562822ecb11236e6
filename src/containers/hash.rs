//! Hash map and hash set stored in an arena
//!
//! Both use separate chaining over a bucket array of node offsets. Bucket
//! counts come from [`PRIME_TABLE`]; the table is allocated at the first
//! insert and grows to the next prime once the load factor would exceed 1.0.
//!
//! Hashes are computed with a fixed-seed `foldhash` hasher, so every process
//! attached to a segment finds an entry in the same bucket. Each node caches
//! its hash, which makes rehashing a pure relink.

use std::{
    fmt,
    hash::{BuildHasher, Hash},
};

use foldhash::fast::FixedState;

use crate::{
    arena::{Arena, OffsetPtr, ShmKey, ShmValue},
    error::{Result, ShmError},
    utils::{next_prime, PRIME_TABLE},
};

/// Seed shared by every process that hashes keys of a segment
///
/// Bucket placement is part of the segment layout: it depends on this seed,
/// on the exact `foldhash` release (pinned in `Cargo.toml`) and on the
/// pointer width, since `usize` keys and slice length prefixes hash at
/// native width. Processes sharing a segment must agree on all three.
const HASH_SEED: u64 = 0x5348_4d4b_4954_0001;

/// Maximum entries per bucket before the table grows
pub const MAX_LOAD_FACTOR: f64 = 1.0;

/// Hash a lookup value the way the containers do
pub fn stable_hash<Q: Hash + ?Sized>(value: &Q) -> u64 {
    FixedState::with_seed(HASH_SEED).hash_one(value)
}

type Link<K, V> = OffsetPtr<HashNode<K, V>>;

/// One chained entry
#[repr(C)]
pub struct HashNode<K, V> {
    key: K,
    value: V,
    hash: u64,
    next: Link<K, V>,
}

/// Position in a [`ShmHashMap`] or [`ShmHashSet`]
///
/// Traversal order is bucket index ascending, then chain order. A cursor is
/// invalidated by any insert that rehashes and by erasing its own entry.
///
/// Invalid cursors are not detected: the freed node may have been reused,
/// and [`ShmHashMap::entry`] or [`ShmHashMap::erase`] would read it as an
/// entry. For keys or values with invalid bit patterns that is undefined
/// behavior, so re-`find` after any rehash or erase.
pub struct HashCursor<K, V> {
    bucket: u64,
    node: Link<K, V>,
}

impl<K, V> HashCursor<K, V> {
    pub const fn end() -> Self {
        Self {
            bucket: 0,
            node: OffsetPtr::null(),
        }
    }

    pub fn is_end(&self) -> bool {
        self.node.is_null()
    }
}

impl<K, V> Clone for HashCursor<K, V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K, V> Copy for HashCursor<K, V> {}

impl<K, V> PartialEq for HashCursor<K, V> {
    fn eq(&self, other: &Self) -> bool {
        self.node == other.node
    }
}

impl<K, V> Eq for HashCursor<K, V> {}

impl<K, V> fmt::Debug for HashCursor<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashCursor")
            .field("bucket", &self.bucket)
            .field("node", &self.node)
            .finish()
    }
}

/// Unordered key/value map
///
/// Inserting an existing key replaces the stored value and releases both the
/// old value and the incoming duplicate key.
#[repr(C)]
pub struct ShmHashMap<K, V> {
    buckets: OffsetPtr<Link<K, V>>,
    bucket_count: u64,
    len: u64,
}

impl<K, V> ShmHashMap<K, V> {
    pub const fn new() -> Self {
        Self {
            buckets: OffsetPtr::null(),
            bucket_count: 0,
            len: 0,
        }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Current bucket count; 0 before the first insert
    pub fn bucket_count(&self) -> u64 {
        self.bucket_count
    }

    pub fn load_factor(&self) -> f64 {
        if self.bucket_count == 0 {
            return 0.0;
        }
        self.len as f64 / self.bucket_count as f64
    }

    fn bucket_slice<'a>(&'a self, arena: &'a Arena) -> Result<&'a [Link<K, V>]> {
        if self.buckets.is_null() {
            return Ok(&[]);
        }
        // SAFETY: the bucket array is owned by this map and fully initialized.
        unsafe { arena.slice(self.buckets, self.bucket_count) }
    }

    fn bucket_head(&self, arena: &Arena, bucket: u64) -> Result<Link<K, V>> {
        // SAFETY: as above; the caller keeps `bucket < bucket_count`.
        Ok(*unsafe { arena.deref(self.buckets.add(bucket))? })
    }

    fn set_bucket_head(&mut self, arena: &Arena, bucket: u64, head: Link<K, V>) -> Result<()> {
        // SAFETY: exclusive through `&mut self`.
        *unsafe { arena.deref_mut(self.buckets.add(bucket))? } = head;
        Ok(())
    }

    fn node<'a>(&'a self, arena: &'a Arena, ptr: Link<K, V>) -> Result<&'a HashNode<K, V>> {
        // SAFETY: every non-null link of this map names a live node it owns.
        unsafe { arena.deref(ptr) }
    }

    #[allow(clippy::mut_from_ref)]
    fn node_mut<'a>(arena: &'a Arena, ptr: Link<K, V>) -> Result<&'a mut HashNode<K, V>> {
        // SAFETY: callers hold `&mut` on the owning map and keep one node
        // borrow alive at a time.
        unsafe { arena.deref_mut(ptr) }
    }

    /// First entry in traversal order
    pub fn begin(&self, arena: &Arena) -> Result<HashCursor<K, V>> {
        self.first_from(arena, 0)
    }

    fn first_from(&self, arena: &Arena, bucket: u64) -> Result<HashCursor<K, V>> {
        let buckets = self.bucket_slice(arena)?;
        for (index, head) in buckets.iter().enumerate().skip(bucket as usize) {
            if !head.is_null() {
                return Ok(HashCursor {
                    bucket: index as u64,
                    node: *head,
                });
            }
        }
        Ok(HashCursor::end())
    }

    /// Entry after `cursor`
    pub fn advance(&self, arena: &Arena, cursor: HashCursor<K, V>) -> Result<HashCursor<K, V>> {
        if cursor.is_end() {
            return Ok(cursor);
        }
        let next = self.node(arena, cursor.node)?.next;
        if !next.is_null() {
            return Ok(HashCursor {
                bucket: cursor.bucket,
                node: next,
            });
        }
        self.first_from(arena, cursor.bucket + 1)
    }

    /// Key and value under `cursor`
    pub fn entry<'a>(
        &'a self,
        arena: &'a Arena,
        cursor: HashCursor<K, V>,
    ) -> Result<(&'a K, &'a V)> {
        if cursor.is_end() {
            return Err(ShmError::invalid_parameter("cursor", "end cursor names no entry"));
        }
        let node = self.node(arena, cursor.node)?;
        Ok((&node.key, &node.value))
    }

    /// Iterate entries in traversal order
    pub fn iter<'a>(&'a self, arena: &'a Arena) -> HashIter<'a, K, V> {
        HashIter {
            map: self,
            arena,
            cursor: self.begin(arena),
        }
    }
}

impl<K: ShmKey, V: ShmValue> ShmHashMap<K, V> {
    /// Insert or overwrite; returns true when `key` was not present
    pub fn insert(&mut self, arena: &Arena, mut key: K, mut value: V) -> Result<bool> {
        let located = key.lookup(arena).and_then(|lookup| {
            let hash = stable_hash(lookup);
            Ok((hash, self.find_hashed(arena, lookup, hash)?))
        });
        let (hash, existing) = match located {
            Ok(found) => found,
            Err(e) => {
                release_pair(arena, &mut key, &mut value);
                return Err(e);
            }
        };

        if !existing.is_end() {
            let node = match Self::node_mut(arena, existing.node) {
                Ok(node) => node,
                Err(e) => {
                    release_pair(arena, &mut key, &mut value);
                    return Err(e);
                }
            };
            let mut old = std::mem::replace(&mut node.value, value);
            let old_released = old.release(arena);
            let key_released = key.release(arena);
            old_released.and(key_released)?;
            return Ok(false);
        }

        if let Err(e) = self.reserve_one(arena) {
            release_pair(arena, &mut key, &mut value);
            return Err(e);
        }
        let bucket = hash % self.bucket_count;
        let placed = self.bucket_head(arena, bucket).and_then(|head| {
            let ptr = arena.alloc_array::<HashNode<K, V>>(1)?;
            match arena.resolve(ptr) {
                Ok(slot) => Ok((head, ptr, slot)),
                Err(e) => {
                    arena.free_array(ptr, 1)?;
                    Err(e)
                }
            }
        });
        let (head, ptr, slot) = match placed {
            Ok(placed) => placed,
            Err(e) => {
                release_pair(arena, &mut key, &mut value);
                return Err(e);
            }
        };
        // SAFETY: freshly allocated node slot.
        unsafe {
            slot.as_ptr().write(HashNode {
                key,
                value,
                hash,
                next: head,
            })
        };
        self.set_bucket_head(arena, bucket, ptr)?;
        self.len += 1;
        Ok(true)
    }

    /// Cursor to the entry for `key`, or the end cursor
    pub fn find(&self, arena: &Arena, key: &K::Lookup) -> Result<HashCursor<K, V>> {
        self.find_hashed(arena, key, stable_hash(key))
    }

    fn find_hashed(&self, arena: &Arena, key: &K::Lookup, hash: u64) -> Result<HashCursor<K, V>> {
        if self.bucket_count == 0 {
            return Ok(HashCursor::end());
        }
        let bucket = hash % self.bucket_count;
        let mut ptr = self.bucket_head(arena, bucket)?;
        while !ptr.is_null() {
            let node = self.node(arena, ptr)?;
            if node.hash == hash && node.key.lookup(arena)? == key {
                return Ok(HashCursor { bucket, node: ptr });
            }
            ptr = node.next;
        }
        Ok(HashCursor::end())
    }

    pub fn get<'a>(&'a self, arena: &'a Arena, key: &K::Lookup) -> Result<Option<&'a V>> {
        let cursor = self.find(arena, key)?;
        if cursor.is_end() {
            return Ok(None);
        }
        Ok(Some(&self.node(arena, cursor.node)?.value))
    }

    pub fn get_mut<'a>(
        &'a mut self,
        arena: &'a Arena,
        key: &K::Lookup,
    ) -> Result<Option<&'a mut V>> {
        let cursor = self.find(arena, key)?;
        if cursor.is_end() {
            return Ok(None);
        }
        Ok(Some(&mut Self::node_mut(arena, cursor.node)?.value))
    }

    pub fn contains_key(&self, arena: &Arena, key: &K::Lookup) -> Result<bool> {
        Ok(!self.find(arena, key)?.is_end())
    }

    /// Number of entries with `key`: 0 or 1
    pub fn count(&self, arena: &Arena, key: &K::Lookup) -> Result<u64> {
        Ok(u64::from(self.contains_key(arena, key)?))
    }

    /// Remove the entry for `key`, returning its value
    ///
    /// The stored key is released; the value is handed to the caller.
    pub fn remove(&mut self, arena: &Arena, key: &K::Lookup) -> Result<Option<V>> {
        let cursor = self.find(arena, key)?;
        if cursor.is_end() {
            return Ok(None);
        }
        let (mut key, value) = self.unlink(arena, cursor)?;
        key.release(arena)?;
        Ok(Some(value))
    }

    /// Remove and release the entry under `cursor`, returning the next cursor
    pub fn erase(&mut self, arena: &Arena, cursor: HashCursor<K, V>) -> Result<HashCursor<K, V>> {
        if cursor.is_end() {
            return Err(ShmError::invalid_parameter("cursor", "end cursor names no entry"));
        }
        let next = self.advance(arena, cursor)?;
        let (mut key, mut value) = self.unlink(arena, cursor)?;
        key.release(arena)?;
        value.release(arena)?;
        Ok(next)
    }

    /// Keep only the entries for which `keep` returns true
    pub fn retain<F>(&mut self, arena: &Arena, mut keep: F) -> Result<()>
    where
        F: FnMut(&K, &mut V) -> bool,
    {
        let mut cursor = self.begin(arena)?;
        while !cursor.is_end() {
            let node = Self::node_mut(arena, cursor.node)?;
            cursor = if keep(&node.key, &mut node.value) {
                self.advance(arena, cursor)?
            } else {
                self.erase(arena, cursor)?
            };
        }
        Ok(())
    }

    /// Release every entry, keeping the bucket array
    pub fn clear(&mut self, arena: &Arena) -> Result<()> {
        for bucket in 0..self.bucket_count {
            let mut ptr = self.bucket_head(arena, bucket)?;
            self.set_bucket_head(arena, bucket, OffsetPtr::null())?;
            while !ptr.is_null() {
                let slot = arena.resolve(ptr)?;
                // SAFETY: detached from the table; read once then freed.
                let mut node = unsafe { slot.as_ptr().read() };
                arena.free_array(ptr, 1)?;
                self.len -= 1;
                node.key.release(arena)?;
                node.value.release(arena)?;
                ptr = node.next;
            }
        }
        Ok(())
    }

    fn unlink(&mut self, arena: &Arena, cursor: HashCursor<K, V>) -> Result<(K, V)> {
        let target_next = self.node(arena, cursor.node)?.next;
        let head = self.bucket_head(arena, cursor.bucket)?;
        if head == cursor.node {
            self.set_bucket_head(arena, cursor.bucket, target_next)?;
        } else {
            let mut ptr = head;
            loop {
                if ptr.is_null() {
                    return Err(ShmError::corruption(format!(
                        "hash node {:?} missing from bucket {}",
                        cursor.node, cursor.bucket
                    )));
                }
                let node = Self::node_mut(arena, ptr)?;
                if node.next == cursor.node {
                    node.next = target_next;
                    break;
                }
                ptr = node.next;
            }
        }
        self.len -= 1;

        let slot = arena.resolve(cursor.node)?;
        // SAFETY: unlinked; moved out once before the block is freed.
        let node = unsafe { slot.as_ptr().read() };
        arena.free_array(cursor.node, 1)?;
        Ok((node.key, node.value))
    }

    fn reserve_one(&mut self, arena: &Arena) -> Result<()> {
        if self.bucket_count == 0 {
            return self.rehash(arena, PRIME_TABLE[0]);
        }
        if (self.len + 1) as f64 > self.bucket_count as f64 * MAX_LOAD_FACTOR {
            let target = next_prime(self.bucket_count + 1);
            if target > self.bucket_count {
                return self.rehash(arena, target);
            }
        }
        Ok(())
    }

    /// Move every node into a fresh bucket array of `bucket_count` entries
    ///
    /// The new array is allocated first; on failure the table is untouched.
    fn rehash(&mut self, arena: &Arena, bucket_count: u64) -> Result<()> {
        let buckets = arena.alloc_array::<Link<K, V>>(bucket_count)?;
        // SAFETY: freshly allocated; every slot is written before use.
        match unsafe { arena.slice_mut(buckets, bucket_count) } {
            Ok(slots) => slots.fill(OffsetPtr::null()),
            Err(e) => {
                arena.free_array(buckets, bucket_count)?;
                return Err(e);
            }
        }

        for bucket in 0..self.bucket_count {
            let mut ptr = self.bucket_head(arena, bucket)?;
            while !ptr.is_null() {
                let node = Self::node_mut(arena, ptr)?;
                let next = node.next;
                let target = node.hash % bucket_count;
                // SAFETY: new bucket array owned by this call.
                let head = unsafe { arena.deref_mut(buckets.add(target))? };
                node.next = *head;
                *head = ptr;
                ptr = next;
            }
        }

        if !self.buckets.is_null() {
            arena.free_array(self.buckets, self.bucket_count)?;
        }
        tracing::debug!(from = self.bucket_count, to = bucket_count, len = self.len, "rehash");
        self.buckets = buckets;
        self.bucket_count = bucket_count;
        Ok(())
    }
}

fn release_pair<K: ShmValue, V: ShmValue>(arena: &Arena, key: &mut K, value: &mut V) {
    if let Err(e) = key.release(arena).and_then(|()| value.release(arena)) {
        tracing::warn!(error = %e, "failed to release rejected entry");
    }
}

impl<K, V> Default for ShmHashMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> fmt::Debug for ShmHashMap<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShmHashMap")
            .field("buckets", &self.buckets)
            .field("bucket_count", &self.bucket_count)
            .field("len", &self.len)
            .finish()
    }
}

unsafe impl<K: ShmKey, V: ShmValue> ShmValue for ShmHashMap<K, V> {
    fn clone_in(&self, arena: &Arena) -> Result<Self> {
        let mut copy = Self::new();
        let mut cursor = self.begin(arena)?;
        while !cursor.is_end() {
            let (key, value) = self.entry(arena, cursor)?;
            let inserted = key.clone_in(arena).and_then(|key| match value.clone_in(arena) {
                Ok(value) => copy.insert(arena, key, value),
                Err(e) => {
                    let mut key = key;
                    key.release(arena)?;
                    Err(e)
                }
            });
            if let Err(e) = inserted {
                copy.release(arena)?;
                return Err(e);
            }
            cursor = self.advance(arena, cursor)?;
        }
        Ok(copy)
    }

    /// Release every entry and the bucket array
    fn release(&mut self, arena: &Arena) -> Result<()> {
        self.clear(arena)?;
        if !self.buckets.is_null() {
            arena.free_array(self.buckets, self.bucket_count)?;
        }
        *self = Self::new();
        Ok(())
    }
}

/// Iterator over map entries in traversal order
pub struct HashIter<'a, K, V> {
    map: &'a ShmHashMap<K, V>,
    arena: &'a Arena,
    cursor: Result<HashCursor<K, V>>,
}

impl<'a, K, V> Iterator for HashIter<'a, K, V> {
    type Item = Result<(&'a K, &'a V)>;

    fn next(&mut self) -> Option<Self::Item> {
        let cursor = match std::mem::replace(&mut self.cursor, Ok(HashCursor::end())) {
            Ok(cursor) if cursor.is_end() => return None,
            Ok(cursor) => cursor,
            Err(e) => return Some(Err(e)),
        };
        let entry = match self.map.entry(self.arena, cursor) {
            Ok(entry) => entry,
            Err(e) => return Some(Err(e)),
        };
        self.cursor = self.map.advance(self.arena, cursor);
        Some(Ok(entry))
    }
}

/// Unordered set of unique values
///
/// Inserting a value that is already present is rejected: the incoming value
/// is released and the stored one is kept.
#[repr(transparent)]
pub struct ShmHashSet<T> {
    map: ShmHashMap<T, ()>,
}

impl<T> ShmHashSet<T> {
    pub const fn new() -> Self {
        Self {
            map: ShmHashMap::new(),
        }
    }

    pub fn len(&self) -> u64 {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn bucket_count(&self) -> u64 {
        self.map.bucket_count()
    }

    pub fn load_factor(&self) -> f64 {
        self.map.load_factor()
    }

    pub fn begin(&self, arena: &Arena) -> Result<HashCursor<T, ()>> {
        self.map.begin(arena)
    }

    pub fn advance(&self, arena: &Arena, cursor: HashCursor<T, ()>) -> Result<HashCursor<T, ()>> {
        self.map.advance(arena, cursor)
    }

    /// Value under `cursor`
    pub fn get<'a>(&'a self, arena: &'a Arena, cursor: HashCursor<T, ()>) -> Result<&'a T> {
        self.map.entry(arena, cursor).map(|(value, ())| value)
    }

    pub fn iter<'a>(&'a self, arena: &'a Arena) -> impl Iterator<Item = Result<&'a T>> + 'a {
        self.map.iter(arena).map(|entry| entry.map(|(value, ())| value))
    }
}

impl<T: ShmKey> ShmHashSet<T> {
    /// Insert `value`; returns false and releases it when already present
    pub fn insert(&mut self, arena: &Arena, mut value: T) -> Result<bool> {
        let present = value.lookup(arena).and_then(|lookup| self.map.contains_key(arena, lookup));
        match present {
            Ok(false) => self.map.insert(arena, value, ()),
            Ok(true) => {
                value.release(arena)?;
                Ok(false)
            }
            Err(e) => {
                value.release(arena)?;
                Err(e)
            }
        }
    }

    pub fn find(&self, arena: &Arena, value: &T::Lookup) -> Result<HashCursor<T, ()>> {
        self.map.find(arena, value)
    }

    pub fn contains(&self, arena: &Arena, value: &T::Lookup) -> Result<bool> {
        self.map.contains_key(arena, value)
    }

    pub fn count(&self, arena: &Arena, value: &T::Lookup) -> Result<u64> {
        self.map.count(arena, value)
    }

    /// Remove and release `value`; returns whether it was present
    pub fn remove(&mut self, arena: &Arena, value: &T::Lookup) -> Result<bool> {
        Ok(self.map.remove(arena, value)?.is_some())
    }

    pub fn erase(&mut self, arena: &Arena, cursor: HashCursor<T, ()>) -> Result<HashCursor<T, ()>> {
        self.map.erase(arena, cursor)
    }

    pub fn retain<F>(&mut self, arena: &Arena, mut keep: F) -> Result<()>
    where
        F: FnMut(&T) -> bool,
    {
        self.map.retain(arena, |value, ()| keep(value))
    }

    pub fn clear(&mut self, arena: &Arena) -> Result<()> {
        self.map.clear(arena)
    }
}

impl<T> Default for ShmHashSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for ShmHashSet<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShmHashSet")
            .field("bucket_count", &self.map.bucket_count)
            .field("len", &self.map.len)
            .finish()
    }
}

unsafe impl<T: ShmKey> ShmValue for ShmHashSet<T> {
    fn clone_in(&self, arena: &Arena) -> Result<Self> {
        Ok(Self {
            map: self.map.clone_in(arena)?,
        })
    }

    fn release(&mut self, arena: &Arena) -> Result<()> {
        self.map.release(arena)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{arena::HeapArena, containers::ShmString};

    #[test]
    fn test_set_scenario() {
        let arena = HeapArena::new(4, 16).unwrap();
        let mut set = ShmHashSet::new();
        for v in 10000..10010i32 {
            assert!(set.insert(&arena, v).unwrap());
        }
        assert_eq!(set.len(), 10);
        assert!(!set.find(&arena, &10000).unwrap().is_end());
        assert!(!set.find(&arena, &10008).unwrap().is_end());
        assert!(set.find(&arena, &10).unwrap().is_end());
        assert_eq!(set.count(&arena, &10005).unwrap(), 1);
        assert_eq!(set.count(&arena, &10).unwrap(), 0);

        let mut cursor = set.begin(&arena).unwrap();
        while !cursor.is_end() {
            cursor = set.erase(&arena, cursor).unwrap();
        }
        assert_eq!(set.len(), 0);
        assert_eq!(set.bucket_count(), 53);

        set.release(&arena).unwrap();
        assert_eq!(arena.used_bytes(), 0);
    }

    #[test]
    fn test_map_overwrites_and_set_rejects() {
        let arena = HeapArena::new(4, 16).unwrap();
        let mut map = ShmHashMap::new();
        assert!(map.insert(&arena, 1u64, 10u64).unwrap());
        assert!(!map.insert(&arena, 1u64, 20u64).unwrap());
        assert_eq!(map.len(), 1);
        assert_eq!(map.get(&arena, &1).unwrap(), Some(&20));

        let mut set = ShmHashSet::new();
        let baseline = arena.used_bytes();
        assert!(set.insert(&arena, ShmString::from_str(&arena, "dup").unwrap()).unwrap());
        let after_first = arena.used_bytes();
        assert!(after_first > baseline);
        assert!(!set.insert(&arena, ShmString::from_str(&arena, "dup").unwrap()).unwrap());
        assert_eq!(arena.used_bytes(), after_first);
        assert_eq!(set.len(), 1);

        map.release(&arena).unwrap();
        set.release(&arena).unwrap();
        assert_eq!(arena.used_bytes(), 0);
    }

    #[test]
    fn test_string_keys_overwrite_releases_old_value() {
        let arena = HeapArena::new(4, 16).unwrap();
        let mut map: ShmHashMap<ShmString, ShmString> = ShmHashMap::new();
        let key = ShmString::from_str(&arena, "name").unwrap();
        let value = ShmString::from_str(&arena, "first").unwrap();
        assert!(map.insert(&arena, key, value).unwrap());
        let used = arena.used_bytes();

        let key = ShmString::from_str(&arena, "name").unwrap();
        let value = ShmString::from_str(&arena, "second").unwrap();
        assert!(!map.insert(&arena, key, value).unwrap());
        assert_eq!(arena.used_bytes(), used);

        let stored = map.get(&arena, b"name".as_slice()).unwrap().unwrap();
        assert_eq!(stored.as_str(&arena).unwrap(), "second");
        assert!(map.get(&arena, b"other".as_slice()).unwrap().is_none());

        map.get_mut(&arena, b"name".as_slice())
            .unwrap()
            .unwrap()
            .append(&arena, b"!")
            .unwrap();
        let mut removed = map.remove(&arena, b"name".as_slice()).unwrap().unwrap();
        assert_eq!(removed.as_str(&arena).unwrap(), "second!");
        removed.release(&arena).unwrap();

        map.release(&arena).unwrap();
        assert_eq!(arena.used_bytes(), 0);
    }

    #[test]
    fn test_rehash_keeps_entries() {
        let arena = HeapArena::new(4, 18).unwrap();
        let mut map = ShmHashMap::new();
        for i in 0..54u64 {
            map.insert(&arena, i, i * 2).unwrap();
        }
        assert_eq!(map.bucket_count(), 97);
        assert!(map.load_factor() <= MAX_LOAD_FACTOR);
        for i in 54..500u64 {
            map.insert(&arena, i, i * 2).unwrap();
        }
        assert_eq!(map.bucket_count(), 769);
        for i in 0..500u64 {
            assert_eq!(map.get(&arena, &i).unwrap(), Some(&(i * 2)));
        }
        assert_eq!(map.iter(&arena).count(), 500);
        map.release(&arena).unwrap();
        assert_eq!(arena.used_bytes(), 0);
    }

    #[test]
    fn test_retain_and_clear_keep_buckets() {
        let arena = HeapArena::new(4, 16).unwrap();
        let mut map = ShmHashMap::new();
        for i in 0..20u32 {
            map.insert(&arena, i, i).unwrap();
        }
        map.retain(&arena, |k, v| {
            *v += 100;
            k % 2 == 0
        })
        .unwrap();
        assert_eq!(map.len(), 10);
        assert_eq!(map.get(&arena, &4).unwrap(), Some(&104));
        assert!(!map.contains_key(&arena, &5).unwrap());

        map.clear(&arena).unwrap();
        assert!(map.is_empty());
        assert_eq!(map.bucket_count(), 53);
        map.release(&arena).unwrap();
        assert_eq!(map.bucket_count(), 0);
        assert_eq!(arena.used_bytes(), 0);
    }

    #[test]
    fn test_traversal_order_is_bucket_order() {
        let arena = HeapArena::new(4, 16).unwrap();
        let mut set = ShmHashSet::new();
        for v in 0..30u64 {
            set.insert(&arena, v).unwrap();
        }
        let buckets: Vec<u64> = set
            .iter(&arena)
            .map(|v| stable_hash(v.unwrap()) % set.bucket_count())
            .collect();
        assert!(buckets.windows(2).all(|w| w[0] <= w[1]));
        set.release(&arena).unwrap();
    }

    #[test]
    fn test_stable_hash_is_deterministic() {
        assert_eq!(stable_hash(&42u64), stable_hash(&42u64));
        assert_eq!(stable_hash(b"abc".as_slice()), stable_hash(b"abc".as_slice()));
        assert_ne!(stable_hash(&1u64), stable_hash(&2u64));
    }

    #[test]
    fn test_deep_copy_is_independent() {
        let arena = HeapArena::new(4, 16).unwrap();
        let mut map = ShmHashMap::new();
        map.insert(&arena, ShmString::from_str(&arena, "k").unwrap(), 1u32).unwrap();
        let mut copy = map.clone_in(&arena).unwrap();
        *copy.get_mut(&arena, b"k".as_slice()).unwrap().unwrap() = 2;
        assert_eq!(map.get(&arena, b"k".as_slice()).unwrap(), Some(&1));
        assert_eq!(copy.get(&arena, b"k".as_slice()).unwrap(), Some(&2));
        map.release(&arena).unwrap();
        copy.release(&arena).unwrap();
        assert_eq!(arena.used_bytes(), 0);
    }
}
