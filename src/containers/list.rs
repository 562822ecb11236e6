//! Doubly-linked list stored in an arena

use std::{fmt, marker::PhantomData};

use crate::{
    arena::{Arena, OffsetPtr, ShmValue},
    error::{Result, ShmError},
};

/// One list element with its links
#[repr(C)]
pub struct ListNode<T> {
    value: T,
    next: OffsetPtr<ListNode<T>>,
    prev: OffsetPtr<ListNode<T>>,
}

/// Position in a [`ShmList`]
///
/// A cursor is a plain offset: it stays valid until the node it names is
/// erased and may be stored in shared memory. The end cursor names no node.
/// Cursors are not checked for membership; using one from another list is a
/// logic error caught only by offset validation.
///
/// A cursor whose node was erased may name a block that has since been
/// reused. Passing it to [`ShmList::get`], [`ShmList::get_mut`] or
/// [`ShmList::erase`] reads that block as a node, which is undefined
/// behavior when `T` has invalid bit patterns. Keep cursors only while
/// their node is known to be live.
pub struct ListCursor<T> {
    node: OffsetPtr<ListNode<T>>,
}

impl<T> ListCursor<T> {
    /// Cursor one past the last element
    pub const fn end() -> Self {
        Self {
            node: OffsetPtr::null(),
        }
    }

    pub fn is_end(&self) -> bool {
        self.node.is_null()
    }

    /// Offset of the node under the cursor
    pub fn node_ptr(&self) -> OffsetPtr<ListNode<T>> {
        self.node
    }
}

impl<T> Clone for ListCursor<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ListCursor<T> {}

impl<T> PartialEq for ListCursor<T> {
    fn eq(&self, other: &Self) -> bool {
        self.node == other.node
    }
}

impl<T> Eq for ListCursor<T> {}

impl<T> fmt::Debug for ListCursor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ListCursor").field(&self.node).finish()
    }
}

/// Doubly-linked list of `T` with O(1) insertion and removal at both ends
#[repr(C)]
pub struct ShmList<T> {
    head: OffsetPtr<ListNode<T>>,
    tail: OffsetPtr<ListNode<T>>,
    len: u64,
}

impl<T> ShmList<T> {
    pub const fn new() -> Self {
        Self {
            head: OffsetPtr::null(),
            tail: OffsetPtr::null(),
            len: 0,
        }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn cursor_front(&self) -> ListCursor<T> {
        ListCursor { node: self.head }
    }

    pub fn cursor_back(&self) -> ListCursor<T> {
        ListCursor { node: self.tail }
    }

    /// Cursor after `cursor`; the end cursor stays at the end
    pub fn next(&self, arena: &Arena, cursor: ListCursor<T>) -> Result<ListCursor<T>> {
        if cursor.is_end() {
            return Ok(cursor);
        }
        Ok(ListCursor {
            node: self.node(arena, cursor.node)?.next,
        })
    }

    /// Cursor before `cursor`; stepping back from the end yields the tail
    pub fn prev(&self, arena: &Arena, cursor: ListCursor<T>) -> Result<ListCursor<T>> {
        if cursor.is_end() {
            return Ok(self.cursor_back());
        }
        Ok(ListCursor {
            node: self.node(arena, cursor.node)?.prev,
        })
    }

    /// Element under `cursor`
    pub fn get<'a>(&'a self, arena: &'a Arena, cursor: ListCursor<T>) -> Result<&'a T> {
        Self::check_cursor(cursor)?;
        Ok(&self.node(arena, cursor.node)?.value)
    }

    pub fn get_mut<'a>(&'a mut self, arena: &'a Arena, cursor: ListCursor<T>) -> Result<&'a mut T> {
        Self::check_cursor(cursor)?;
        let node = Self::node_mut(arena, cursor.node)?;
        Ok(&mut node.value)
    }

    pub fn front<'a>(&'a self, arena: &'a Arena) -> Result<&'a T> {
        if self.is_empty() {
            return Err(ShmError::empty("ShmList"));
        }
        self.get(arena, self.cursor_front())
    }

    pub fn back<'a>(&'a self, arena: &'a Arena) -> Result<&'a T> {
        if self.is_empty() {
            return Err(ShmError::empty("ShmList"));
        }
        self.get(arena, self.cursor_back())
    }

    /// Iterate head to tail
    pub fn iter<'a>(&'a self, arena: &'a Arena) -> ListIter<'a, T> {
        ListIter {
            arena,
            node: self.head,
            remaining: self.len,
            _list: PhantomData,
        }
    }

    fn check_cursor(cursor: ListCursor<T>) -> Result<()> {
        if cursor.is_end() {
            return Err(ShmError::invalid_parameter("cursor", "end cursor names no element"));
        }
        Ok(())
    }

    fn node<'a>(
        &'a self,
        arena: &'a Arena,
        ptr: OffsetPtr<ListNode<T>>,
    ) -> Result<&'a ListNode<T>> {
        // SAFETY: every non-null link of this list names a live node it owns.
        unsafe { arena.deref(ptr) }
    }

    #[allow(clippy::mut_from_ref)]
    fn node_mut<'a>(arena: &'a Arena, ptr: OffsetPtr<ListNode<T>>) -> Result<&'a mut ListNode<T>> {
        // SAFETY: callers hold `&mut` on the owning list and keep at most one
        // node borrow alive at a time.
        unsafe { arena.deref_mut(ptr) }
    }
}

impl<T: ShmValue> ShmList<T> {
    pub fn push_front(&mut self, arena: &Arena, value: T) -> Result<()> {
        self.insert_before(arena, self.cursor_front(), value).map(|_| ())
    }

    pub fn push_back(&mut self, arena: &Arena, value: T) -> Result<()> {
        self.insert_before(arena, ListCursor::end(), value).map(|_| ())
    }

    pub fn pop_front(&mut self, arena: &Arena) -> Result<Option<T>> {
        if self.is_empty() {
            return Ok(None);
        }
        self.unlink(arena, self.head).map(Some)
    }

    pub fn pop_back(&mut self, arena: &Arena) -> Result<Option<T>> {
        if self.is_empty() {
            return Ok(None);
        }
        self.unlink(arena, self.tail).map(Some)
    }

    /// Insert `value` in front of `cursor`, returning a cursor to it
    ///
    /// Inserting before the end cursor appends. If the node cannot be
    /// allocated the value is released and the list is unchanged.
    pub fn insert_before(
        &mut self,
        arena: &Arena,
        cursor: ListCursor<T>,
        mut value: T,
    ) -> Result<ListCursor<T>> {
        let prev = if cursor.is_end() {
            self.tail
        } else {
            match self.node(arena, cursor.node) {
                Ok(node) => node.prev,
                Err(e) => {
                    value.release(arena)?;
                    return Err(e);
                }
            }
        };

        let ptr = match arena.alloc_array::<ListNode<T>>(1) {
            Ok(ptr) => ptr,
            Err(e) => {
                value.release(arena)?;
                return Err(e);
            }
        };
        let slot = arena.resolve(ptr)?;
        // SAFETY: freshly allocated node slot.
        unsafe {
            slot.as_ptr().write(ListNode {
                value,
                next: cursor.node,
                prev,
            })
        };

        if prev.is_null() {
            self.head = ptr;
        } else {
            Self::node_mut(arena, prev)?.next = ptr;
        }
        if cursor.is_end() {
            self.tail = ptr;
        } else {
            Self::node_mut(arena, cursor.node)?.prev = ptr;
        }
        self.len += 1;
        Ok(ListCursor { node: ptr })
    }

    /// Remove and release the element under `cursor`
    ///
    /// Returns the cursor of the element that followed it.
    pub fn erase(&mut self, arena: &Arena, cursor: ListCursor<T>) -> Result<ListCursor<T>> {
        Self::check_cursor(cursor)?;
        let next = self.node(arena, cursor.node)?.next;
        let mut value = self.unlink(arena, cursor.node)?;
        value.release(arena)?;
        Ok(ListCursor { node: next })
    }

    /// Keep only the elements for which `keep` returns true
    pub fn retain<F>(&mut self, arena: &Arena, mut keep: F) -> Result<()>
    where
        F: FnMut(&T) -> bool,
    {
        let mut cursor = self.cursor_front();
        while !cursor.is_end() {
            cursor = if keep(self.get(arena, cursor)?) {
                self.next(arena, cursor)?
            } else {
                self.erase(arena, cursor)?
            };
        }
        Ok(())
    }

    /// Release every element and node
    pub fn clear(&mut self, arena: &Arena) -> Result<()> {
        while let Some(mut value) = self.pop_front(arena)? {
            value.release(arena)?;
        }
        Ok(())
    }

    fn unlink(&mut self, arena: &Arena, ptr: OffsetPtr<ListNode<T>>) -> Result<T> {
        let (prev, next) = {
            let node = self.node(arena, ptr)?;
            (node.prev, node.next)
        };
        if prev.is_null() {
            self.head = next;
        } else {
            Self::node_mut(arena, prev)?.next = next;
        }
        if next.is_null() {
            self.tail = prev;
        } else {
            Self::node_mut(arena, next)?.prev = prev;
        }
        self.len -= 1;

        let slot = arena.resolve(ptr)?;
        // SAFETY: the node is unlinked; its value is moved out exactly once
        // before the block is freed.
        let node = unsafe { slot.as_ptr().read() };
        arena.free_array(ptr, 1)?;
        Ok(node.value)
    }
}

impl<T> Default for ShmList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for ShmList<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShmList")
            .field("head", &self.head)
            .field("tail", &self.tail)
            .field("len", &self.len)
            .finish()
    }
}

unsafe impl<T: ShmValue> ShmValue for ShmList<T> {
    fn clone_in(&self, arena: &Arena) -> Result<Self> {
        let mut copy = Self::new();
        for item in self.iter(arena) {
            let cloned = item.and_then(|value| value.clone_in(arena));
            match cloned {
                Ok(value) => {
                    if let Err(e) = copy.push_back(arena, value) {
                        copy.clear(arena)?;
                        return Err(e);
                    }
                }
                Err(e) => {
                    copy.clear(arena)?;
                    return Err(e);
                }
            }
        }
        Ok(copy)
    }

    fn release(&mut self, arena: &Arena) -> Result<()> {
        self.clear(arena)
    }
}

/// Head-to-tail iterator over a [`ShmList`]
pub struct ListIter<'a, T> {
    arena: &'a Arena,
    node: OffsetPtr<ListNode<T>>,
    remaining: u64,
    _list: PhantomData<&'a ShmList<T>>,
}

impl<'a, T> Iterator for ListIter<'a, T> {
    type Item = Result<&'a T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.node.is_null() || self.remaining == 0 {
            return None;
        }
        // SAFETY: the list is borrowed for 'a, so its nodes stay put.
        match unsafe { self.arena.deref(self.node) } {
            Ok(node) => {
                self.node = node.next;
                self.remaining -= 1;
                Some(Ok(&node.value))
            }
            Err(e) => {
                self.remaining = 0;
                Some(Err(e))
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.remaining as usize))
    }
}
