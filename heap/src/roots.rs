use object::Value;

/// The explicit root registration stack.
///
/// Entries are *addresses* of value holders, not values: the collector reads
/// the holder at collection time, so a reassignment between push and pop is
/// seen. Pops tolerate out-of-order removal by scanning back; an address
/// that was never registered is a protocol violation in the VM or a
/// primitive and aborts the process.
pub struct RootStack {
    slots: Vec<*mut Value>,
}

impl RootStack {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        RootStack {
            slots: Vec::with_capacity(capacity),
        }
    }

    /// Register the address of a value holder.
    ///
    /// # Safety
    ///
    /// `addr` must point to a live `Value` that outlives its registration;
    /// the matching [`RootStack::pop`] must happen before the holder does.
    pub unsafe fn push(&mut self, addr: *mut Value) {
        self.slots.push(addr);
    }

    /// Remove the most recent registration of `addr`.
    ///
    /// Panics if `addr` is not registered: that means a push/pop imbalance
    /// somewhere, and the collector can no longer be trusted to see every
    /// live value.
    pub fn pop(&mut self, addr: *mut Value) {
        match self.slots.last() {
            Some(&top) if top == addr => {
                self.slots.pop();
            }
            _ => {
                let index = self
                    .slots
                    .iter()
                    .rposition(|&p| p == addr)
                    .unwrap_or_else(|| {
                        panic!("pop of unregistered root {addr:p}")
                    });
                self.slots.remove(index);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    #[inline(always)]
    pub(crate) fn get(&self, index: usize) -> *mut Value {
        self.slots[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object::{Cell, CellData, Tag};

    fn value(cell: &mut Box<Cell>) -> Value {
        Value::from_ptr(&mut **cell as *mut Cell)
    }

    #[test]
    fn lifo_push_pop() {
        let mut a = Box::new(Cell::free(0));
        let mut b = Box::new(Cell::free(0));
        let mut va = value(&mut a);
        let mut vb = value(&mut b);

        let mut roots = RootStack::with_capacity(4);
        unsafe {
            roots.push(&mut va);
            roots.push(&mut vb);
        }
        assert_eq!(roots.len(), 2);
        roots.pop(&mut vb);
        roots.pop(&mut va);
        assert!(roots.is_empty());
    }

    #[test]
    fn out_of_order_pop_scans_back() {
        let mut cells: Vec<Box<Cell>> = (0..3).map(|_| Box::new(Cell::free(0))).collect();
        let mut v0 = value(&mut cells[0]);
        let mut v1 = value(&mut cells[1]);
        let mut v2 = value(&mut cells[2]);

        let mut roots = RootStack::with_capacity(4);
        unsafe {
            roots.push(&mut v0);
            roots.push(&mut v1);
            roots.push(&mut v2);
        }
        // remove the middle registration first
        roots.pop(&mut v1);
        assert_eq!(roots.len(), 2);
        assert_eq!(roots.get(0), &mut v0 as *mut Value);
        assert_eq!(roots.get(1), &mut v2 as *mut Value);
        roots.pop(&mut v2);
        roots.pop(&mut v0);
        assert!(roots.is_empty());
    }

    #[test]
    #[should_panic(expected = "pop of unregistered root")]
    fn pop_of_unregistered_address_is_fatal() {
        let mut a = Box::new(Cell::free(0));
        let mut va = value(&mut a);
        let mut roots = RootStack::with_capacity(4);
        roots.pop(&mut va);
    }

    #[test]
    fn collector_sees_reassignment_through_registration() {
        let mut a = Box::new(Cell::free(0));
        a.data = CellData::Fixnum(1);
        a.tag = Tag::Fixnum;
        let mut b = Box::new(Cell::free(0));
        b.data = CellData::Fixnum(2);
        b.tag = Tag::Fixnum;

        let mut holder = value(&mut a);
        let mut roots = RootStack::with_capacity(4);
        unsafe { roots.push(&mut holder) };
        holder = value(&mut b);
        let seen = unsafe { *roots.get(0) };
        assert_eq!(seen, holder, "registration tracks the holder, not a snapshot");
        roots.pop(&mut holder);
    }
}
