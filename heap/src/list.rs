use std::ptr;

use object::Cell;

/// One of the collector's two intrusive doubly-linked lists.
///
/// A cell is a member of exactly one list at any time; membership moves by
/// pointer splicing, never by copying cells.
pub(crate) struct CellList {
    pub head: *mut Cell,
    pub tail: *mut Cell,
    pub len: usize,
}

impl CellList {
    pub fn new() -> Self {
        CellList {
            head: ptr::null_mut(),
            tail: ptr::null_mut(),
            len: 0,
        }
    }

    /// Unlink `cell` from `src` and link it at the head of `dst`.
    ///
    /// # Safety
    ///
    /// `cell` must currently be a member of `src`, and both lists must be
    /// well formed.
    pub unsafe fn splice_to_head(
        cell: *mut Cell,
        src: &mut CellList,
        dst: &mut CellList,
    ) {
        // unlink from src
        if (*cell).prev.is_null() {
            src.head = (*cell).next;
        } else {
            (*(*cell).prev).next = (*cell).next;
        }
        if (*cell).next.is_null() {
            src.tail = (*cell).prev;
        } else {
            (*(*cell).next).prev = (*cell).prev;
        }
        src.len -= 1;

        // link at the head of dst
        if dst.head.is_null() {
            dst.head = cell;
            dst.tail = cell;
            (*cell).prev = ptr::null_mut();
            (*cell).next = ptr::null_mut();
        } else {
            (*cell).prev = ptr::null_mut();
            (*cell).next = dst.head;
            (*dst.head).prev = cell;
            dst.head = cell;
        }
        dst.len += 1;
    }

    /// Append all of `src` to the tail of `dst`, leaving `src` empty.
    ///
    /// # Safety
    ///
    /// Both lists must be well formed and disjoint.
    pub unsafe fn append(dst: &mut CellList, src: &mut CellList) {
        if src.head.is_null() {
            return;
        }
        if dst.tail.is_null() {
            dst.head = src.head;
            dst.tail = src.tail;
        } else {
            (*dst.tail).next = src.head;
            (*src.head).prev = dst.tail;
            dst.tail = src.tail;
        }
        dst.len += src.len;

        src.head = ptr::null_mut();
        src.tail = ptr::null_mut();
        src.len = 0;
    }

    /// Walk the list and check every link. Test and debugging aid only; far
    /// too slow for normal operation.
    #[cfg(test)]
    pub unsafe fn validate(&self) {
        if self.head.is_null() || self.tail.is_null() {
            assert!(self.head.is_null() && self.tail.is_null());
            assert_eq!(self.len, 0, "empty list with nonzero count");
            return;
        }
        assert!((*self.head).prev.is_null(), "head prev must be null");
        assert!((*self.tail).next.is_null(), "tail next must be null");
        let mut count = 1usize;
        let mut cursor = self.head;
        while cursor != self.tail {
            let next = (*cursor).next;
            assert!(!next.is_null(), "broken forward link at {count}");
            assert_eq!((*next).prev, cursor, "broken back link at {count}");
            cursor = next;
            count += 1;
        }
        assert_eq!(count, self.len, "list count out of sync");
    }
}
