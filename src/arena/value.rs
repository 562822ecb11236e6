//! Traits for values that may live inside an arena

use std::hash::Hash;

use super::{Arena, OffsetPtr};
use crate::error::Result;

/// A value that may be stored in shared memory
///
/// Containers call [`ShmValue::clone_in`] for deep copies and
/// [`ShmValue::release`] before freeing a slot. Neither is tied to `Clone` or
/// `Drop`, because both need the arena that owns the storage.
///
/// # Safety
/// Implementors must be position independent: no native pointers, references,
/// or process-local handles (`Box`, `Vec`, `String`, file descriptors...). A
/// value must remain valid after a bitwise move to another offset or another
/// mapping of the same segment.
pub unsafe trait ShmValue: Sized {
    /// Deep copy into fresh arena storage
    fn clone_in(&self, arena: &Arena) -> Result<Self>;

    /// Return any arena storage owned by this value
    ///
    /// After `release` the value is empty but still valid.
    fn release(&mut self, arena: &Arena) -> Result<()>;
}

/// A [`ShmValue`] usable as a hash container key
///
/// `lookup` exposes a borrowed view used for hashing and equality, so that
/// lookups can be made with plain Rust values (`&[u8]` for strings, `&u64` for
/// integers) without building a shared copy of the key first.
pub trait ShmKey: ShmValue {
    /// Borrowed form of the key
    type Lookup: ?Sized + Hash + Eq;

    /// View the key through the arena holding its storage
    fn lookup<'a>(&'a self, arena: &'a Arena) -> Result<&'a Self::Lookup>;
}

/// Implement [`ShmValue`] for plain `Copy` types
///
/// ```rust,ignore
/// #[derive(Clone, Copy)]
/// #[repr(C)]
/// struct RoleState { role_id: u64, hp: i32 }
///
/// shmkit::impl_shm_plain!(RoleState);
/// ```
#[macro_export]
macro_rules! impl_shm_plain {
    ($($ty:ty),* $(,)?) => {
        $(
            unsafe impl $crate::arena::ShmValue for $ty {
                fn clone_in(&self, _arena: &$crate::arena::Arena) -> $crate::Result<Self> {
                    Ok(*self)
                }

                fn release(&mut self, _arena: &$crate::arena::Arena) -> $crate::Result<()> {
                    Ok(())
                }
            }
        )*
    };
}

/// Implement [`ShmValue`] and [`ShmKey`] for plain `Copy + Hash + Eq` types
#[macro_export]
macro_rules! impl_shm_key {
    ($($ty:ty),* $(,)?) => {
        $(
            $crate::impl_shm_plain!($ty);

            impl $crate::arena::ShmKey for $ty {
                type Lookup = $ty;

                fn lookup<'a>(
                    &'a self,
                    _arena: &'a $crate::arena::Arena,
                ) -> $crate::Result<&'a $ty> {
                    Ok(self)
                }
            }
        )*
    };
}

impl_shm_key!(u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize, bool, char, ());
impl_shm_plain!(f32, f64);

unsafe impl<T> ShmValue for OffsetPtr<T> {
    fn clone_in(&self, _arena: &Arena) -> Result<Self> {
        Ok(*self)
    }

    fn release(&mut self, _arena: &Arena) -> Result<()> {
        Ok(())
    }
}

impl<T> ShmKey for OffsetPtr<T> {
    type Lookup = Self;

    fn lookup<'a>(&'a self, _arena: &'a Arena) -> Result<&'a Self> {
        Ok(self)
    }
}

unsafe impl<T: ShmValue + Copy, const N: usize> ShmValue for [T; N] {
    fn clone_in(&self, _arena: &Arena) -> Result<Self> {
        Ok(*self)
    }

    fn release(&mut self, _arena: &Arena) -> Result<()> {
        Ok(())
    }
}
