//! Named objects
//!
//! A [`ShmNamed`] pairs a value with a name stored beside it in the arena, so
//! a root slot or snapshot can say what it holds.

use super::{
    snapshot::{read_tag, write_tag, ObjType, ShmSnapshot},
    ShmString,
};
use crate::{
    arena::{Arena, ShmValue},
    error::Result,
};

/// A value tagged with a name
#[derive(Debug)]
#[repr(C)]
pub struct ShmNamed<T> {
    name: ShmString,
    value: T,
}

impl<T: ShmValue> ShmNamed<T> {
    /// Store `name` in the arena and attach it to `value`
    ///
    /// If the name cannot be allocated, `value` is released.
    pub fn new(arena: &Arena, name: &str, mut value: T) -> Result<Self> {
        match ShmString::from_str(arena, name) {
            Ok(name) => Ok(Self { name, value }),
            Err(e) => {
                if let Err(release_err) = value.release(arena) {
                    tracing::warn!(error = %release_err, "failed to release unnamed value");
                }
                Err(e)
            }
        }
    }

    pub fn name(&self) -> &ShmString {
        &self.name
    }

    pub fn name_str<'a>(&'a self, arena: &'a Arena) -> Result<&'a str> {
        self.name.as_str(arena)
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn value_mut(&mut self) -> &mut T {
        &mut self.value
    }

    /// Rename in place, reusing the name's storage when it fits
    pub fn rename(&mut self, arena: &Arena, name: &str) -> Result<()> {
        self.name.assign(arena, name.as_bytes())
    }

    /// Free the name and hand back the value
    pub fn into_value(mut self, arena: &Arena) -> Result<T> {
        self.name.release(arena)?;
        Ok(self.value)
    }
}

unsafe impl<T: ShmValue> ShmValue for ShmNamed<T> {
    fn clone_in(&self, arena: &Arena) -> Result<Self> {
        let mut name = self.name.clone_in(arena)?;
        match self.value.clone_in(arena) {
            Ok(value) => Ok(Self { name, value }),
            Err(e) => {
                name.release(arena)?;
                Err(e)
            }
        }
    }

    fn release(&mut self, arena: &Arena) -> Result<()> {
        let name_released = self.name.release(arena);
        let value_released = self.value.release(arena);
        name_released.and(value_released)
    }
}

impl<T: ShmSnapshot> ShmSnapshot for ShmNamed<T> {
    const OBJ_TYPE: ObjType = ObjType::Named;

    fn serialize_into(&self, arena: &Arena, out: &mut Vec<u8>) -> Result<()> {
        write_tag(out, Self::OBJ_TYPE);
        self.name.serialize_into(arena, out)?;
        self.value.serialize_into(arena, out)
    }

    fn deserialize_from(arena: &Arena, input: &mut &[u8]) -> Result<Self> {
        read_tag(input, Self::OBJ_TYPE)?;
        let mut name = ShmString::deserialize_from(arena, input)?;
        match T::deserialize_from(arena, input) {
            Ok(value) => Ok(Self { name, value }),
            Err(e) => {
                if let Err(release_err) = name.release(arena) {
                    tracing::warn!(error = %release_err, "failed to release snapshot name");
                }
                Err(e)
            }
        }
    }
}
