//! Reliability tests: caller mistakes, exhaustion and accounting

use shmkit::{
    allocators::OffsetAllocator, Arena, HeapArena, OffsetPtr, Result, ShmError, ShmHashMap,
    ShmList, ShmString, ShmValue, ShmVec,
};

/// Value whose release frees its name, then reports failure when `fail` is set
#[repr(C)]
struct Fragile {
    name: ShmString,
    fail: bool,
}

impl Fragile {
    fn new(arena: &Arena, name: &str, fail: bool) -> Self {
        Self {
            name: ShmString::from_str(arena, name).unwrap(),
            fail,
        }
    }
}

unsafe impl ShmValue for Fragile {
    fn clone_in(&self, arena: &Arena) -> Result<Self> {
        Ok(Self {
            name: self.name.clone_in(arena)?,
            fail: self.fail,
        })
    }

    fn release(&mut self, arena: &Arena) -> Result<()> {
        self.name.release(arena)?;
        if self.fail {
            return Err(ShmError::invalid_parameter("fail", "release refused"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_double_free_rejected() {
        let arena = HeapArena::new(4, 12).unwrap();
        let block = arena.allocate(48).unwrap();
        let used = arena.used_bytes();
        assert_eq!(used, 64);

        arena.free(block, 48).unwrap();
        assert!(matches!(arena.free(block, 48), Err(ShmError::InvalidFree { .. })));
        assert_eq!(arena.used_bytes(), 0);
    }

    #[test]
    fn test_foreign_and_mismatched_frees_rejected() {
        let arena = HeapArena::new(4, 12).unwrap();
        let block = arena.allocate(100).unwrap();

        // Never allocated
        assert!(arena.free(OffsetPtr::from_offset(2048), 16).is_err());
        // Misaligned inside a live block
        assert!(arena.free(block.add(8), 16).is_err());
        // Wrong size class
        assert!(matches!(arena.free(block, 512), Err(ShmError::InvalidFree { .. })));
        // Outside storage
        assert!(arena.free(OffsetPtr::from_offset(1 << 20), 16).is_err());
        assert!(matches!(arena.free(OffsetPtr::null(), 16), Err(ShmError::NullPointer)));

        assert_eq!(arena.stats().live_blocks, 1);
        arena.free(block, 100).unwrap();
        assert_eq!(arena.used_bytes(), 0);
    }

    #[test]
    fn test_null_and_reserved_offsets_never_resolve() {
        let arena = HeapArena::new(4, 12).unwrap();
        assert!(matches!(arena.resolve(OffsetPtr::<u64>::null()), Err(ShmError::NullPointer)));
        assert!(matches!(
            arena.resolve(OffsetPtr::<u64>::from_offset(0)),
            Err(ShmError::NullPointer)
        ));
        assert!(arena.resolve(OffsetPtr::<u64>::from_offset(4096)).unwrap_err().is_corruption());
        assert!(matches!(
            arena.resolve(OffsetPtr::<u64>::from_offset(20)),
            Err(ShmError::Alignment { .. })
        ));
    }

    #[test]
    fn test_buddies_coalesce_into_parent() {
        let arena = HeapArena::new(4, 12).unwrap();
        let allocator = arena.allocator();

        // Offset 0 is reserved, so the first 64 byte block lands beside it.
        let first = allocator.allocate(64).unwrap();
        let left = allocator.allocate(64).unwrap();
        let right = allocator.allocate(64).unwrap();
        assert_eq!(left ^ right, 64);
        assert_eq!(left % 128, 0);

        allocator.deallocate(left, 64).unwrap();
        allocator.deallocate(right, 64).unwrap();
        let parent = allocator.allocate(128).unwrap();
        assert_eq!(parent, left);

        allocator.deallocate(parent, 128).unwrap();
        allocator.deallocate(first, 64).unwrap();
        assert_eq!(allocator.used_size(), 0);
        assert_eq!(arena.stats().largest_free_block, 2048);
    }

    #[test]
    fn test_exhaustion_leaves_vec_intact() {
        let arena = HeapArena::new(4, 10).unwrap();
        let mut vec = ShmVec::new();
        let mut pushed = 0u64;
        let err = loop {
            match vec.push(&arena, pushed) {
                Ok(()) => pushed += 1,
                Err(e) => break e,
            }
        };

        assert!(matches!(err, ShmError::Exhausted { .. }));
        assert!(pushed > 0);
        assert_eq!(vec.len(), pushed);
        let expected: Vec<u64> = (0..pushed).collect();
        assert_eq!(vec.as_slice(&arena).unwrap(), expected.as_slice());

        vec.release(&arena).unwrap();
        assert_eq!(arena.used_bytes(), 0);
    }

    #[test]
    fn test_exhaustion_leaves_string_and_list_intact() {
        let arena = HeapArena::new(4, 10).unwrap();
        let mut text = ShmString::from_str(&arena, "persistent").unwrap();
        assert!(text.append(&arena, &[b'x'; 900]).is_err());
        assert_eq!(text.as_str(&arena).unwrap(), "persistent");

        let mut list = ShmList::new();
        let mut count = 0u64;
        while list.push_back(&arena, count).is_ok() {
            count += 1;
        }
        assert_eq!(list.len(), count);
        assert_eq!(*list.back(&arena).unwrap(), count - 1);

        // No node fits; the rejected value is released, nothing leaks.
        let before = arena.used_bytes();
        let mut strings = ShmList::new();
        let orphan = ShmString::new();
        assert!(strings.push_back(&arena, orphan).is_err());
        assert_eq!(arena.used_bytes(), before);

        list.release(&arena).unwrap();
        text.release(&arena).unwrap();
        assert_eq!(arena.used_bytes(), 0);
    }

    #[test]
    fn test_exhausted_rehash_keeps_map_usable() {
        let arena = HeapArena::new(4, 11).unwrap();
        let mut map = ShmHashMap::new();
        let mut inserted = 0u64;
        while map.insert(&arena, inserted, inserted).is_ok() {
            inserted += 1;
        }

        assert_eq!(map.len(), inserted);
        for key in 0..inserted {
            assert_eq!(map.get(&arena, &key).unwrap(), Some(&key));
        }
        assert!(map.remove(&arena, &0).unwrap().is_some());
        assert!(map.insert(&arena, 0, 0).unwrap());

        map.release(&arena).unwrap();
        assert_eq!(arena.used_bytes(), 0);
    }

    #[test]
    fn test_no_leak_after_mixed_workload() {
        let arena = HeapArena::new(4, 20).unwrap();
        let before = arena.used_bytes();

        let mut index: ShmHashMap<ShmString, ShmVec<u64>> = ShmHashMap::new();
        for round in 0..20u64 {
            for id in 0..25u64 {
                let key = ShmString::from_str(&arena, &format!("user-{}", id)).unwrap();
                let mut values = ShmVec::new();
                values.resize(&arena, round % 7, &round).unwrap();
                index.insert(&arena, key, values).unwrap();
            }
            index
                .retain(&arena, |_, values| values.len() % 2 == 0)
                .unwrap();
            if round % 5 == 0 {
                let mut copy = index.clone_in(&arena).unwrap();
                copy.clear(&arena).unwrap();
                copy.release(&arena).unwrap();
            }
        }

        index.release(&arena).unwrap();
        assert_eq!(arena.used_bytes(), before);
        assert_eq!(arena.stats().live_blocks, 0);
    }

    #[test]
    fn test_new_object_failure_releases_value() {
        let arena = HeapArena::new(4, 8).unwrap();
        let text = ShmString::from_str(&arena, "hi").unwrap();
        assert_eq!(arena.used_bytes(), 16);

        let mut fillers = Vec::new();
        while let Ok(block) = arena.allocate(16) {
            fillers.push(block);
        }
        let before = arena.used_bytes();
        assert_eq!(before, 240);

        // The header needs a fresh block; the string's bytes go back on failure.
        let result = arena.new_object(text);
        assert!(matches!(result, Err(ShmError::Exhausted { .. })));
        assert_eq!(arena.used_bytes(), before - 16);

        for block in fillers {
            arena.free(block, 16).unwrap();
        }
        assert_eq!(arena.used_bytes(), 0);
    }

    #[test]
    fn test_delete_frees_block_when_release_fails() {
        let arena = HeapArena::new(4, 10).unwrap();
        let boxed = arena.new_object(Fragile::new(&arena, "doomed", true)).unwrap();
        assert!(arena.used_bytes() > 0);

        assert!(matches!(arena.delete(boxed), Err(ShmError::InvalidParameter { .. })));
        assert_eq!(arena.used_bytes(), 0);
        assert_eq!(arena.stats().live_blocks, 0);
    }

    #[test]
    fn test_truncate_keeps_element_whose_release_fails() {
        let arena = HeapArena::new(4, 12).unwrap();
        let mut vec = ShmVec::new();
        for (name, fail) in [("a", false), ("b", true), ("c", false)] {
            vec.push(&arena, Fragile::new(&arena, name, fail)).unwrap();
        }

        assert!(vec.truncate(&arena, 0).is_err());
        assert_eq!(vec.len(), 2);
        assert!(vec.back(&arena).unwrap().fail);

        vec.get_mut(&arena, 1).unwrap().fail = false;
        vec.release(&arena).unwrap();
        assert_eq!(arena.used_bytes(), 0);
    }

    #[test]
    fn test_map_overwrite_installs_value_when_old_release_fails() {
        let arena = HeapArena::new(4, 12).unwrap();
        let mut map = ShmHashMap::new();
        assert!(map.insert(&arena, 1u64, Fragile::new(&arena, "old", true)).unwrap());

        let result = map.insert(&arena, 1u64, Fragile::new(&arena, "new", false));
        assert!(matches!(result, Err(ShmError::InvalidParameter { .. })));
        assert_eq!(map.len(), 1);
        let current = map.get(&arena, &1).unwrap().unwrap();
        assert_eq!(current.name.as_str(&arena).unwrap(), "new");
        assert!(!current.fail);

        map.release(&arena).unwrap();
        assert_eq!(arena.used_bytes(), 0);
    }
}
