//! Integration tests for the shared containers on heap and file arenas

use shmkit::{
    memory::{OpenMode, Segment, SegmentConfig},
    Arena, HeapArena, ObjType, OffsetPtr, Result, ShmBox, ShmHashMap, ShmHashSet, ShmList,
    ShmNamed, ShmSnapshot, ShmString, ShmValue, ShmVec,
};
use tempfile::TempDir;

/// Player record mixing plain fields with owned shared storage
#[repr(C)]
struct TestPointer {
    id: u64,
    name: ShmString,
    scores: ShmVec<u32>,
    parent: OffsetPtr<TestPointer>,
}

unsafe impl ShmValue for TestPointer {
    fn clone_in(&self, arena: &Arena) -> Result<Self> {
        let name = self.name.clone_in(arena)?;
        let scores = match self.scores.clone_in(arena) {
            Ok(scores) => scores,
            Err(e) => {
                let mut name = name;
                name.release(arena)?;
                return Err(e);
            }
        };
        Ok(Self {
            id: self.id,
            name,
            scores,
            parent: self.parent,
        })
    }

    fn release(&mut self, arena: &Arena) -> Result<()> {
        self.name.release(arena)?;
        self.scores.release(arena)
    }
}

const LONG_TEXT: &str = "the quick brown fox jumps over the lazy dog, 54 bytes!";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_round_trip_does_not_leak() {
        let arena = HeapArena::new(4, 16).unwrap();
        let before = arena.used_bytes();

        let mut parent = arena
            .new_with(|arena| {
                Ok(TestPointer {
                    id: 1,
                    name: ShmString::from_str(arena, "parent")?,
                    scores: ShmVec::new(),
                    parent: OffsetPtr::null(),
                })
            })
            .unwrap();
        for score in [10u32, 20, 30] {
            let record = arena.get_mut(&mut parent).unwrap();
            record.scores.push(&arena, score).unwrap();
        }

        let child = arena
            .new_object(TestPointer {
                id: 2,
                name: ShmString::from_str(&arena, "child").unwrap(),
                scores: ShmVec::new(),
                parent: parent.as_ptr(),
            })
            .unwrap();

        let child_ref = arena.get(&child).unwrap();
        let resolved_parent = unsafe { arena.deref(child_ref.parent) }.unwrap();
        assert_eq!(resolved_parent.id, 1);
        assert_eq!(resolved_parent.name.as_str(&arena).unwrap(), "parent");
        assert_eq!(resolved_parent.scores.as_slice(&arena).unwrap(), &[10, 20, 30]);

        let copy = arena.new_object(arena.get(&parent).unwrap().clone_in(&arena).unwrap()).unwrap();
        assert_ne!(
            arena.get(&copy).unwrap().name.data_ptr(),
            arena.get(&parent).unwrap().name.data_ptr()
        );

        arena.delete(copy).unwrap();
        arena.delete(child).unwrap();
        arena.delete(parent).unwrap();
        assert_eq!(arena.used_bytes(), before);
        assert_eq!(arena.stats().live_blocks, 0);
    }

    #[test]
    fn test_string_capacity_and_reallocation() {
        let arena = HeapArena::new(4, 16).unwrap();
        let mut text = ShmString::with_capacity(&arena, 16).unwrap();
        assert!(text.capacity() >= 16);

        text.assign(&arena, b"hello").unwrap();
        assert_eq!(text.len(), 5);
        assert_eq!(text.to_string_lossy(&arena).unwrap(), "hello");
        let small_data = text.data_ptr();

        assert_eq!(LONG_TEXT.len(), 54);
        text.assign(&arena, LONG_TEXT.as_bytes()).unwrap();
        assert_ne!(text.data_ptr(), small_data);
        assert_eq!(text.len(), 54);
        assert_eq!(text.as_str(&arena).unwrap(), LONG_TEXT);

        text.release(&arena).unwrap();
        assert_eq!(arena.used_bytes(), 0);
    }

    #[test]
    fn test_push_101_pop_100() {
        let arena = HeapArena::new(4, 18).unwrap();

        let mut vec = ShmVec::new();
        let mut list = ShmList::new();
        for i in 0..101 {
            let text = format!("entry-{}", i);
            vec.push(&arena, ShmString::from_str(&arena, &text).unwrap()).unwrap();
            list.push_back(&arena, ShmString::from_str(&arena, &text).unwrap()).unwrap();
        }
        for _ in 0..100 {
            vec.pop(&arena).unwrap().unwrap().release(&arena).unwrap();
            list.pop_back(&arena).unwrap().unwrap().release(&arena).unwrap();
        }

        assert_eq!(vec.len(), 1);
        assert_eq!(list.len(), 1);
        assert_eq!(vec.front(&arena).unwrap().as_str(&arena).unwrap(), "entry-0");
        assert_eq!(list.front(&arena).unwrap().as_str(&arena).unwrap(), "entry-0");

        vec.release(&arena).unwrap();
        list.release(&arena).unwrap();
        assert_eq!(arena.used_bytes(), 0);
    }

    #[test]
    fn test_hash_set_find_and_erase_all() {
        let arena = HeapArena::new(4, 16).unwrap();
        let mut set = ShmHashSet::new();
        for key in 10000u64..10010 {
            assert!(set.insert(&arena, key).unwrap());
        }
        assert_eq!(set.len(), 10);

        assert!(!set.find(&arena, &10000).unwrap().is_end());
        assert!(!set.find(&arena, &10008).unwrap().is_end());
        assert!(set.find(&arena, &10).unwrap().is_end());

        let mut cursor = set.begin(&arena).unwrap();
        while !cursor.is_end() {
            cursor = set.erase(&arena, cursor).unwrap();
        }

        assert_eq!(set.len(), 0);
        for key in [10000u64, 10008, 10] {
            assert!(set.find(&arena, &key).unwrap().is_end());
        }
        set.release(&arena).unwrap();
        assert_eq!(arena.used_bytes(), 0);
    }

    #[test]
    fn test_duplicate_key_policies() {
        let arena = HeapArena::new(4, 16).unwrap();

        let mut map = ShmHashMap::new();
        assert!(map.insert(&arena, 7u64, ShmString::from_str(&arena, "first").unwrap()).unwrap());
        assert!(!map.insert(&arena, 7u64, ShmString::from_str(&arena, "second").unwrap()).unwrap());
        assert_eq!(map.len(), 1);
        assert_eq!(map.get(&arena, &7).unwrap().unwrap().as_str(&arena).unwrap(), "second");

        let mut set = ShmHashSet::new();
        assert!(set.insert(&arena, ShmString::from_str(&arena, "only").unwrap()).unwrap());
        assert!(!set.insert(&arena, ShmString::from_str(&arena, "only").unwrap()).unwrap());
        assert_eq!(set.len(), 1);
        assert!(set.contains(&arena, b"only".as_slice()).unwrap());

        map.release(&arena).unwrap();
        set.release(&arena).unwrap();
        assert_eq!(arena.used_bytes(), 0);
    }

    #[test]
    fn test_deep_copy_independence() {
        let arena = HeapArena::new(4, 18).unwrap();

        let mut original: ShmHashMap<ShmString, ShmVec<u64>> = ShmHashMap::new();
        for (name, len) in [("a", 1u64), ("b", 2), ("c", 3)] {
            let mut values = ShmVec::new();
            for i in 0..len {
                values.push(&arena, i).unwrap();
            }
            original.insert(&arena, ShmString::from_str(&arena, name).unwrap(), values).unwrap();
        }

        let mut copy = original.clone_in(&arena).unwrap();
        assert_eq!(copy.len(), 3);
        let original_b = original.get(&arena, b"b".as_slice()).unwrap().unwrap().data_ptr();
        let copy_b = copy.get(&arena, b"b".as_slice()).unwrap().unwrap().data_ptr();
        assert_ne!(original_b, copy_b);

        copy.get_mut(&arena, b"b".as_slice()).unwrap().unwrap().push(&arena, 99).unwrap();
        let removed = original.remove(&arena, b"c".as_slice()).unwrap();
        removed.unwrap().release(&arena).unwrap();

        assert_eq!(original.get(&arena, b"b".as_slice()).unwrap().unwrap().len(), 2);
        let copied_b = copy.get(&arena, b"b".as_slice()).unwrap().unwrap();
        assert_eq!(copied_b.as_slice(&arena).unwrap(), &[0, 1, 99]);
        assert!(copy.contains_key(&arena, b"c".as_slice()).unwrap());
        assert!(!original.contains_key(&arena, b"c".as_slice()).unwrap());

        original.release(&arena).unwrap();
        copy.release(&arena).unwrap();
        assert_eq!(arena.used_bytes(), 0);
    }

    #[test]
    fn test_erase_while_iterating_visits_each_once() {
        let arena = HeapArena::new(4, 18).unwrap();

        let mut list = ShmList::new();
        for i in 0u64..50 {
            list.push_back(&arena, i).unwrap();
        }
        let mut visited = Vec::new();
        let mut cursor = list.cursor_front();
        while !cursor.is_end() {
            let value = *list.get(&arena, cursor).unwrap();
            visited.push(value);
            cursor = if value % 3 == 0 {
                list.erase(&arena, cursor).unwrap()
            } else {
                list.next(&arena, cursor).unwrap()
            };
        }
        assert_eq!(visited, (0..50).collect::<Vec<_>>());
        assert!(list.iter(&arena).all(|v| *v.unwrap() % 3 != 0));

        let mut map = ShmHashMap::new();
        for i in 0u64..200 {
            map.insert(&arena, i, i * 2).unwrap();
        }
        let mut seen = std::collections::HashSet::new();
        let mut cursor = map.begin(&arena).unwrap();
        while !cursor.is_end() {
            let (key, _) = map.entry(&arena, cursor).unwrap();
            let key = *key;
            assert!(seen.insert(key), "key {} visited twice", key);
            cursor = if key % 2 == 0 {
                map.erase(&arena, cursor).unwrap()
            } else {
                map.advance(&arena, cursor).unwrap()
            };
        }
        assert_eq!(seen.len(), 200);
        assert_eq!(map.len(), 100);
        assert!(map.iter(&arena).all(|entry| *entry.unwrap().0 % 2 == 1));

        list.release(&arena).unwrap();
        map.release(&arena).unwrap();
        assert_eq!(arena.used_bytes(), 0);
    }

    #[test]
    fn test_growth_keeps_sibling_offsets() {
        let arena = HeapArena::new(4, 18).unwrap();
        let mut first = ShmVec::new();
        let mut text = ShmString::from_str(&arena, "sibling").unwrap();
        let mut second = ShmVec::new();
        first.push(&arena, 1u64).unwrap();
        second.push(&arena, 2u64).unwrap();

        let text_data = text.data_ptr();
        let second_data = second.data_ptr();
        for i in 0..500 {
            first.push(&arena, i).unwrap();
        }
        text.append(&arena, LONG_TEXT.as_bytes()).unwrap();

        assert_eq!(second.data_ptr(), second_data);
        assert_eq!(second.as_slice(&arena).unwrap(), &[2]);
        assert_ne!(text.data_ptr(), text_data);
        assert!(text.as_str(&arena).unwrap().starts_with("sibling"));

        first.release(&arena).unwrap();
        second.release(&arena).unwrap();
        text.release(&arena).unwrap();
        assert_eq!(arena.used_bytes(), 0);
    }

    #[test]
    fn test_containers_survive_reattach() {
        let temp_dir = TempDir::new().unwrap();
        let config = SegmentConfig::new("containers")
            .with_file_path(temp_dir.path().join("containers"))
            .with_orders(4, 18);

        let (registry_ptr, used) = {
            let segment = Segment::attach(config.clone()).unwrap();
            let arena = segment.arena();
            let mut registry = arena
                .new_object(ShmHashMap::<ShmString, ShmList<u64>>::new())
                .unwrap();
            for (name, visits) in [("alice", 3u64), ("bob", 1), ("carol", 7)] {
                let mut history = ShmList::new();
                for visit in 0..visits {
                    history.push_back(arena, visit).unwrap();
                }
                let key = ShmString::from_str(arena, name).unwrap();
                arena.get_mut(&mut registry).unwrap().insert(arena, key, history).unwrap();
            }
            let ptr = registry.into_raw();
            segment.set_root(2, ptr).unwrap();
            segment.flush().unwrap();
            (ptr, arena.used_bytes())
        };

        let segment = Segment::attach(config.with_mode(OpenMode::Open)).unwrap();
        let arena = segment.arena();
        assert_eq!(arena.used_bytes(), used);
        let stored = segment.root::<ShmHashMap<ShmString, ShmList<u64>>>(2).unwrap();
        assert_eq!(stored, registry_ptr);

        let mut registry = unsafe { ShmBox::from_raw(stored) };
        {
            let map = arena.get_mut(&mut registry).unwrap();
            assert_eq!(map.len(), 3);
            let carol = map.get(arena, b"carol".as_slice()).unwrap().unwrap();
            assert_eq!(carol.len(), 7);
            assert_eq!(*carol.back(arena).unwrap(), 6);

            let bob = map.get_mut(arena, b"bob".as_slice()).unwrap().unwrap();
            bob.push_back(arena, 42).unwrap();
            assert_eq!(*bob.back(arena).unwrap(), 42);
        }

        segment.set_root(2, OffsetPtr::<u8>::null()).unwrap();
        arena.delete(registry).unwrap();
        assert_eq!(arena.used_bytes(), 0);
    }

    #[test]
    fn test_named_snapshot_moves_segment_data_to_heap() {
        let temp_dir = TempDir::new().unwrap();
        let config = SegmentConfig::new("snapshot")
            .with_file_path(temp_dir.path().join("snapshot"))
            .with_orders(4, 16);

        let bytes = {
            let segment = Segment::attach(config).unwrap();
            let arena = segment.arena();
            let mut sessions = ShmHashMap::<u64, ShmString>::new();
            for (id, user) in [(7u64, "alice"), (9, "bob"), (12, "carol")] {
                let user = ShmString::from_str(arena, user).unwrap();
                sessions.insert(arena, id, user).unwrap();
            }
            let named = ShmNamed::new(arena, "sessions", sessions).unwrap();
            let boxed = arena.new_object(named).unwrap();
            segment.set_root(0, boxed.into_raw()).unwrap();

            let stored = segment.root::<ShmNamed<ShmHashMap<u64, ShmString>>>(0).unwrap();
            let boxed = unsafe { ShmBox::from_raw(stored) };
            let bytes = boxed.to_snapshot(arena).unwrap();
            segment.set_root(0, OffsetPtr::<u8>::null()).unwrap();
            arena.delete(boxed).unwrap();
            assert_eq!(arena.used_bytes(), 0);
            bytes
        };
        assert_eq!(shmkit::containers::peek_obj_type(&bytes).unwrap(), ObjType::Named);

        let heap = HeapArena::new(4, 14).unwrap();
        let mut named =
            ShmNamed::<ShmHashMap<u64, ShmString>>::from_snapshot(&heap, &bytes).unwrap();
        assert_eq!(named.name_str(&heap).unwrap(), "sessions");
        let sessions = named.value();
        assert_eq!(sessions.len(), 3);
        let bob = sessions.get(&heap, &9).unwrap().unwrap();
        assert_eq!(bob.as_str(&heap).unwrap(), "bob");
        assert!(sessions.get(&heap, &8).unwrap().is_none());

        named.release(&heap).unwrap();
        assert_eq!(heap.used_bytes(), 0);
    }
}
