//! Portable snapshots of arena containers
//!
//! A snapshot is a flat byte image of a value and everything it owns, with
//! no offsets in it, so it can be written to a file or sent to a process that
//! does not map the segment and rebuilt in any arena. Containers lead with
//! an [`ObjType`] tag; plain values are encoded with `bincode` and carry no
//! tag. Lengths are `bincode` u64s.
//!
//! ```text
//!  ShmHashMap<ShmString, u32>
//!  ┌─────┬─────┬──────────────────────────┬─────┬────────────┐
//!  │ Map │ len │ String │ len │ bytes...  │ u32 │ next entry │
//!  └─────┴─────┴──────────────────────────┴─────┴────────────┘
//! ```

use serde::{de::DeserializeOwned, Serialize};

use super::{ShmHashMap, ShmHashSet, ShmList, ShmString, ShmVec};
use crate::{
    arena::{Arena, ShmBox, ShmKey, ShmValue},
    error::{Result, ShmError},
};

/// Kind of object at the start of a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ObjType {
    /// Plain value without a tag
    Plain = 0,
    String = 1,
    Vec = 2,
    List = 3,
    Map = 4,
    Set = 5,
    Named = 6,
}

impl ObjType {
    /// Decode a tag byte
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Self::String),
            2 => Some(Self::Vec),
            3 => Some(Self::List),
            4 => Some(Self::Map),
            5 => Some(Self::Set),
            6 => Some(Self::Named),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Plain => "plain",
            Self::String => "string",
            Self::Vec => "vec",
            Self::List => "list",
            Self::Map => "map",
            Self::Set => "set",
            Self::Named => "named",
        }
    }
}

/// A [`ShmValue`] that can be flattened into a snapshot and rebuilt
pub trait ShmSnapshot: ShmValue {
    /// Tag written in front of the value
    const OBJ_TYPE: ObjType;

    /// Append the snapshot of `self` to `out`
    fn serialize_into(&self, arena: &Arena, out: &mut Vec<u8>) -> Result<()>;

    /// Rebuild a value from the front of `input`, advancing it
    ///
    /// On error nothing allocated by the partial rebuild remains live.
    fn deserialize_from(arena: &Arena, input: &mut &[u8]) -> Result<Self>;

    /// Snapshot of `self` as a new buffer
    fn to_snapshot(&self, arena: &Arena) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.serialize_into(arena, &mut out)?;
        Ok(out)
    }

    /// Rebuild a value from a complete snapshot
    fn from_snapshot(arena: &Arena, bytes: &[u8]) -> Result<Self> {
        let mut input = bytes;
        let mut value = Self::deserialize_from(arena, &mut input)?;
        if !input.is_empty() {
            let trailing = input.len();
            if let Err(e) = value.release(arena) {
                tracing::warn!(error = %e, "failed to release rejected snapshot value");
            }
            return Err(ShmError::serialization(format!(
                "{} trailing bytes after {} snapshot",
                trailing,
                Self::OBJ_TYPE.name()
            )));
        }
        Ok(value)
    }
}

/// Object type at the front of a snapshot, without decoding it
///
/// Plain values carry no tag, so the answer only means something for
/// snapshots of containers and named objects.
pub fn peek_obj_type(bytes: &[u8]) -> Result<ObjType> {
    let tag = *bytes
        .first()
        .ok_or_else(|| ShmError::serialization("empty snapshot"))?;
    Ok(ObjType::from_tag(tag).unwrap_or(ObjType::Plain))
}

/// Encode a plain value
pub fn write_plain<T: Serialize + ?Sized>(out: &mut Vec<u8>, value: &T) -> Result<()> {
    bincode::serialize_into(out, value)?;
    Ok(())
}

/// Decode a plain value from the front of `input`
pub fn read_plain<T: DeserializeOwned>(input: &mut &[u8]) -> Result<T> {
    Ok(bincode::deserialize_from(input)?)
}

pub(super) fn write_tag(out: &mut Vec<u8>, obj_type: ObjType) {
    out.push(obj_type as u8);
}

pub(super) fn read_tag(input: &mut &[u8], expected: ObjType) -> Result<()> {
    let (&tag, rest) = input
        .split_first()
        .ok_or_else(|| ShmError::serialization("snapshot ended before its tag"))?;
    if tag != expected as u8 {
        return Err(ShmError::serialization(format!(
            "expected {} snapshot, found tag {}",
            expected.name(),
            tag
        )));
    }
    *input = rest;
    Ok(())
}

/// Run `fill` on a fresh container, releasing it if filling fails
fn rebuild<C, F>(arena: &Arena, mut container: C, fill: F) -> Result<C>
where
    C: ShmValue,
    F: FnOnce(&mut C) -> Result<()>,
{
    match fill(&mut container) {
        Ok(()) => Ok(container),
        Err(e) => {
            if let Err(release_err) = container.release(arena) {
                tracing::warn!(error = %release_err, "failed to release partial snapshot");
            }
            Err(e)
        }
    }
}

/// Implement [`ShmSnapshot`] for plain types that are `serde` serializable
///
/// ```rust,ignore
/// #[derive(Clone, Copy, serde::Serialize, serde::Deserialize)]
/// #[repr(C)]
/// struct RoleState { role_id: u64, hp: i32 }
///
/// shmkit::impl_shm_plain!(RoleState);
/// shmkit::impl_shm_snapshot_plain!(RoleState);
/// ```
#[macro_export]
macro_rules! impl_shm_snapshot_plain {
    ($($ty:ty),* $(,)?) => {
        $(
            impl $crate::containers::snapshot::ShmSnapshot for $ty {
                const OBJ_TYPE: $crate::containers::snapshot::ObjType =
                    $crate::containers::snapshot::ObjType::Plain;

                fn serialize_into(
                    &self,
                    _arena: &$crate::arena::Arena,
                    out: &mut Vec<u8>,
                ) -> $crate::Result<()> {
                    $crate::containers::snapshot::write_plain(out, self)
                }

                fn deserialize_from(
                    _arena: &$crate::arena::Arena,
                    input: &mut &[u8],
                ) -> $crate::Result<Self> {
                    $crate::containers::snapshot::read_plain(input)
                }
            }
        )*
    };
}

impl_shm_snapshot_plain!(
    u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize, bool, char, (), f32, f64
);

impl ShmSnapshot for ShmString {
    const OBJ_TYPE: ObjType = ObjType::String;

    fn serialize_into(&self, arena: &Arena, out: &mut Vec<u8>) -> Result<()> {
        write_tag(out, Self::OBJ_TYPE);
        write_plain(out, self.as_bytes(arena)?)
    }

    fn deserialize_from(arena: &Arena, input: &mut &[u8]) -> Result<Self> {
        read_tag(input, Self::OBJ_TYPE)?;
        let bytes: Vec<u8> = read_plain(input)?;
        ShmString::from_bytes(arena, &bytes)
    }
}

impl<T: ShmSnapshot> ShmSnapshot for ShmVec<T> {
    const OBJ_TYPE: ObjType = ObjType::Vec;

    fn serialize_into(&self, arena: &Arena, out: &mut Vec<u8>) -> Result<()> {
        write_tag(out, Self::OBJ_TYPE);
        write_plain(out, &self.len())?;
        for value in self.iter(arena)? {
            value.serialize_into(arena, out)?;
        }
        Ok(())
    }

    fn deserialize_from(arena: &Arena, input: &mut &[u8]) -> Result<Self> {
        read_tag(input, Self::OBJ_TYPE)?;
        let len: u64 = read_plain(input)?;
        rebuild(arena, ShmVec::new(), |vec| {
            for _ in 0..len {
                vec.push(arena, T::deserialize_from(arena, input)?)?;
            }
            Ok(())
        })
    }
}

impl<T: ShmSnapshot> ShmSnapshot for ShmList<T> {
    const OBJ_TYPE: ObjType = ObjType::List;

    fn serialize_into(&self, arena: &Arena, out: &mut Vec<u8>) -> Result<()> {
        write_tag(out, Self::OBJ_TYPE);
        write_plain(out, &self.len())?;
        for value in self.iter(arena) {
            value?.serialize_into(arena, out)?;
        }
        Ok(())
    }

    fn deserialize_from(arena: &Arena, input: &mut &[u8]) -> Result<Self> {
        read_tag(input, Self::OBJ_TYPE)?;
        let len: u64 = read_plain(input)?;
        rebuild(arena, ShmList::new(), |list| {
            for _ in 0..len {
                list.push_back(arena, T::deserialize_from(arena, input)?)?;
            }
            Ok(())
        })
    }
}

impl<K, V> ShmSnapshot for ShmHashMap<K, V>
where
    K: ShmKey + ShmSnapshot,
    V: ShmSnapshot,
{
    const OBJ_TYPE: ObjType = ObjType::Map;

    fn serialize_into(&self, arena: &Arena, out: &mut Vec<u8>) -> Result<()> {
        write_tag(out, Self::OBJ_TYPE);
        write_plain(out, &self.len())?;
        for entry in self.iter(arena) {
            let (key, value) = entry?;
            key.serialize_into(arena, out)?;
            value.serialize_into(arena, out)?;
        }
        Ok(())
    }

    fn deserialize_from(arena: &Arena, input: &mut &[u8]) -> Result<Self> {
        read_tag(input, Self::OBJ_TYPE)?;
        let len: u64 = read_plain(input)?;
        rebuild(arena, ShmHashMap::new(), |map| {
            for _ in 0..len {
                let mut key = K::deserialize_from(arena, input)?;
                let value = match V::deserialize_from(arena, input) {
                    Ok(value) => value,
                    Err(e) => {
                        if let Err(release_err) = key.release(arena) {
                            tracing::warn!(error = %release_err, "failed to release snapshot key");
                        }
                        return Err(e);
                    }
                };
                map.insert(arena, key, value)?;
            }
            Ok(())
        })
    }
}

impl<T: ShmKey + ShmSnapshot> ShmSnapshot for ShmHashSet<T> {
    const OBJ_TYPE: ObjType = ObjType::Set;

    fn serialize_into(&self, arena: &Arena, out: &mut Vec<u8>) -> Result<()> {
        write_tag(out, Self::OBJ_TYPE);
        write_plain(out, &self.len())?;
        for value in self.iter(arena) {
            value?.serialize_into(arena, out)?;
        }
        Ok(())
    }

    fn deserialize_from(arena: &Arena, input: &mut &[u8]) -> Result<Self> {
        read_tag(input, Self::OBJ_TYPE)?;
        let len: u64 = read_plain(input)?;
        rebuild(arena, ShmHashSet::new(), |set| {
            for _ in 0..len {
                set.insert(arena, T::deserialize_from(arena, input)?)?;
            }
            Ok(())
        })
    }
}

// A boxed object is written inline; rebuilding allocates a fresh box.
impl<T: ShmSnapshot> ShmSnapshot for ShmBox<T> {
    const OBJ_TYPE: ObjType = T::OBJ_TYPE;

    fn serialize_into(&self, arena: &Arena, out: &mut Vec<u8>) -> Result<()> {
        arena.get(self)?.serialize_into(arena, out)
    }

    fn deserialize_from(arena: &Arena, input: &mut &[u8]) -> Result<Self> {
        let value = T::deserialize_from(arena, input)?;
        arena.new_object(value)
    }
}
