use std::ptr;

use object::{Cell, CellData, Specials, Tag, Value};

use crate::list::CellList;
use crate::roots::RootStack;

/// Supplies the persistent roots (globals, interning table, singletons) at
/// allocation and collection time.
///
/// Transient roots (VM locals, primitive temporaries) go through the
/// [`RootStack`] instead, which records holder addresses.
pub trait RootProvider {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(Value));
}

/// Provider with no roots. Bootstrap and tests only.
pub struct NoRoots;

impl RootProvider for NoRoots {
    fn visit_roots(&mut self, _visitor: &mut dyn FnMut(Value)) {}
}

/// Provider over a plain vector of values. Handy for multi-step
/// construction where intermediate cells are not yet reachable from
/// anywhere else.
#[derive(Default)]
pub struct ValueRoots(pub Vec<Value>);

impl ValueRoots {
    pub fn new() -> Self {
        ValueRoots(Vec::new())
    }
}

impl RootProvider for ValueRoots {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(Value)) {
        for &v in &self.0 {
            visitor(v);
        }
    }
}

/// Configuration for the cell heap.
#[derive(Debug, Clone)]
pub struct HeapSettings {
    /// Cells allocated at startup.
    pub initial_cells: usize,
    /// Size of the first on-demand extension; each further extension grows
    /// by `extension_factor`.
    pub extension_start: usize,
    /// Geometric growth factor for extensions.
    pub extension_factor: usize,
    /// Initial capacity of the root stack.
    pub root_capacity: usize,
}

impl Default for HeapSettings {
    fn default() -> Self {
        HeapSettings {
            initial_cells: 1000,
            extension_start: 1000,
            extension_factor: 3,
            root_capacity: 400,
        }
    }
}

impl HeapSettings {
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.initial_cells == 0 || self.extension_start == 0 {
            return Err("cell counts must be > 0");
        }
        if self.extension_factor < 2 {
            return Err("extension_factor must be >= 2");
        }
        Ok(())
    }
}

/// The cell heap and its tracing collector.
///
/// Cells live in chunks whose addresses never change; list membership is the
/// only thing that moves. Between collections, fresh cells are handed out by
/// advancing `next_free` through the `active` list. A collection appends
/// `old` to `active`, splices everything reachable back onto `old`, and the
/// residue of `active` becomes the free pool.
pub struct Heap {
    chunks: Vec<Box<[Cell]>>,
    active: CellList,
    old: CellList,
    next_free: *mut Cell,
    color: u32,
    roots: RootStack,
    finalizable: Vec<*mut Cell>,
    finalizable_spare: Vec<*mut Cell>,
    next_extension: usize,
    extension_factor: usize,
    cells_total: usize,
}

impl Heap {
    pub fn new(settings: HeapSettings) -> Self {
        if let Err(msg) = settings.validate() {
            panic!("invalid heap settings: {msg}");
        }
        let mut heap = Heap {
            chunks: Vec::new(),
            active: CellList::new(),
            old: CellList::new(),
            next_free: ptr::null_mut(),
            color: 0,
            roots: RootStack::with_capacity(settings.root_capacity),
            finalizable: Vec::new(),
            finalizable_spare: Vec::new(),
            next_extension: settings.extension_start,
            extension_factor: settings.extension_factor,
            cells_total: 0,
        };
        heap.extend(settings.initial_cells);
        heap
    }

    pub fn cells_total(&self) -> usize {
        self.cells_total
    }

    pub fn color(&self) -> u32 {
        self.color
    }

    // ── root stack ─────────────────────────────────────────────────

    /// Register the address of a value holder until the matching
    /// [`Heap::pop_root`].
    ///
    /// # Safety
    ///
    /// See [`RootStack::push`].
    pub unsafe fn push_root(&mut self, holder: *mut Value) {
        self.roots.push(holder);
    }

    pub fn pop_root(&mut self, holder: *mut Value) {
        self.roots.pop(holder);
    }

    pub fn roots_len(&self) -> usize {
        self.roots.len()
    }

    // ── allocation ─────────────────────────────────────────────────

    /// Take a cell from the free pool and initialise it.
    ///
    /// May run a collection: every value handle inside `data`, and every
    /// live temporary in the caller, must be reachable through the root
    /// stack or `roots` before the call. The returned cell carries the
    /// current colour and, for buffer-owning tags, a finalizable-set entry.
    pub fn alloc(
        &mut self,
        tag: Tag,
        data: CellData,
        roots: &mut dyn RootProvider,
    ) -> Value {
        if self.next_free.is_null() {
            let freed = self.collect(roots);
            if freed == 0 || self.next_extension / freed > 2 {
                let extension = self.next_extension;
                self.extend(extension);
                self.next_extension *= self.extension_factor;
            }
            if self.next_free.is_null() {
                panic!("out of memory: heap extension produced no free cells");
            }
        }

        let cell = self.next_free;
        unsafe {
            self.next_free = (*cell).next;
            (*cell).color = self.color;
            (*cell).tag = tag;
            (*cell).data = data;
        }
        if tag.needs_finalization() {
            self.finalizable.push(cell);
        }
        Value::from_ptr(cell)
    }

    /// Grow the heap by `count` cells, linked as a run at the head of the
    /// active list. New cells carry the current colour so a collection
    /// running immediately afterwards does not treat them as already marked
    /// garbage from a stale epoch.
    fn extend(&mut self, count: usize) {
        debug_assert!(count > 0);
        let mut chunk: Box<[Cell]> = (0..count)
            .map(|_| Cell::free(self.color))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        unsafe {
            let base = chunk.as_mut_ptr();
            for i in 0..count {
                let cell = base.add(i);
                (*cell).prev =
                    if i == 0 { ptr::null_mut() } else { base.add(i - 1) };
                (*cell).next = if i + 1 == count {
                    ptr::null_mut()
                } else {
                    base.add(i + 1)
                };
            }

            let first = base;
            let last = base.add(count - 1);
            (*last).next = self.active.head;
            if self.active.head.is_null() {
                self.active.tail = last;
            } else {
                (*self.active.head).prev = last;
            }
            self.active.head = first;
            self.next_free = first;
        }

        self.active.len += count;
        self.cells_total += count;
        self.chunks.push(chunk);
        tracing::debug!(cells = count, total = self.cells_total, "extended heap");
    }

    // ── collection ─────────────────────────────────────────────────

    /// Run a full collection and return the number of free cells.
    ///
    /// Everything reachable from the root stack and `roots` is spliced onto
    /// the `old` list; the residue of `active` becomes the free pool.
    /// Finalizable cells left behind have their external buffers released.
    pub fn collect(&mut self, roots: &mut dyn RootProvider) -> usize {
        // fold the whole heap into one provisional-garbage list
        unsafe {
            CellList::append(&mut self.active, &mut self.old);
        }

        self.color = self.color.wrapping_add(1);

        for i in 0..self.roots.len() {
            let holder = self.roots.get(i);
            let v = unsafe { *holder };
            self.move_reachable(v);
        }
        roots.visit_roots(&mut |v| self.move_reachable(v));

        // release buffers of finalizable cells that did not survive
        let mut retained = std::mem::take(&mut self.finalizable_spare);
        let color = self.color;
        for cell in self.finalizable.drain(..) {
            unsafe {
                if (*cell).color != color {
                    (*cell).data.finalize();
                } else {
                    retained.push(cell);
                }
            }
        }
        self.finalizable_spare =
            std::mem::replace(&mut self.finalizable, retained);

        // advance past the mark colour so fresh allocations never alias it
        self.color = self.color.wrapping_add(1);

        self.next_free = self.active.head;
        let freed = self.active.len;
        tracing::debug!(freed, live = self.old.len, "collection finished");
        freed
    }

    /// Colour `v`, splice it onto the head of `old`, then scan from the
    /// head towards older entries. Children of each scanned cell splice in
    /// front of the cursor, so the walk drains a queue that grows at its
    /// own head.
    fn move_reachable(&mut self, v: Value) {
        let root = v.as_ptr();
        unsafe {
            if (*root).color == self.color {
                return;
            }
            (*root).color = self.color;
            CellList::splice_to_head(root, &mut self.active, &mut self.old);

            let color = self.color;
            let active = &mut self.active;
            let old = &mut self.old;
            let mut scan = old.head;
            while !scan.is_null() {
                (*ptr::addr_of!((*scan).data)).for_each_child(&mut |child| {
                    let cell = child.as_ptr();
                    // SAFETY: `cell` is a live heap cell; uncoloured cells
                    // are members of `active`.
                    unsafe {
                        if (*cell).color != color {
                            (*cell).color = color;
                            CellList::splice_to_head(cell, active, old);
                        }
                    }
                });
                scan = (*scan).prev;
            }
        }
    }

    // ── typed constructors ─────────────────────────────────────────

    pub fn make_pair(
        &mut self,
        car: Value,
        cdr: Value,
        roots: &mut dyn RootProvider,
    ) -> Value {
        let mut car = car;
        let mut cdr = cdr;
        unsafe {
            self.roots.push(&mut car);
            self.roots.push(&mut cdr);
        }
        let v = self.alloc(Tag::Pair, CellData::Pair { car, cdr }, roots);
        self.roots.pop(&mut cdr);
        self.roots.pop(&mut car);
        v
    }

    pub fn make_vector(
        &mut self,
        len: usize,
        fill: Value,
        roots: &mut dyn RootProvider,
    ) -> Value {
        let mut fill = fill;
        unsafe {
            self.roots.push(&mut fill);
        }
        let v =
            self.alloc(Tag::Vector, CellData::Vector(vec![fill; len]), roots);
        self.roots.pop(&mut fill);
        v
    }

    /// Allocate a vector holding `elements`.
    ///
    /// # Safety
    ///
    /// Every element must already be rooted: the allocation may collect,
    /// and the slice itself is invisible to the collector.
    pub unsafe fn make_vector_from(
        &mut self,
        elements: &[Value],
        roots: &mut dyn RootProvider,
    ) -> Value {
        self.alloc(Tag::Vector, CellData::Vector(elements.to_vec()), roots)
    }

    pub fn make_string(
        &mut self,
        text: &str,
        roots: &mut dyn RootProvider,
    ) -> Value {
        self.alloc(Tag::Str, CellData::Str(text.as_bytes().to_vec()), roots)
    }

    pub fn make_bytes(
        &mut self,
        bytes: Vec<u8>,
        roots: &mut dyn RootProvider,
    ) -> Value {
        self.alloc(Tag::Str, CellData::Str(bytes), roots)
    }

    /// Raw symbol constructor. Interning lives with the runtime; equal
    /// names are only pointer-equal when they go through the intern table.
    pub fn make_symbol(
        &mut self,
        name: &str,
        roots: &mut dyn RootProvider,
    ) -> Value {
        self.alloc(Tag::Symbol, CellData::Symbol(name.to_string()), roots)
    }

    pub fn make_fixnum(
        &mut self,
        n: i64,
        roots: &mut dyn RootProvider,
    ) -> Value {
        self.alloc(Tag::Fixnum, CellData::Fixnum(n), roots)
    }

    pub fn make_character(
        &mut self,
        c: char,
        roots: &mut dyn RootProvider,
    ) -> Value {
        self.alloc(Tag::Character, CellData::Character(c), roots)
    }

    pub fn make_compiled_proc(
        &mut self,
        bytecode: Value,
        env: Value,
        roots: &mut dyn RootProvider,
    ) -> Value {
        let mut bytecode = bytecode;
        let mut env = env;
        unsafe {
            self.roots.push(&mut bytecode);
            self.roots.push(&mut env);
        }
        let v = self.alloc(
            Tag::CompiledProc,
            CellData::CompiledProc { bytecode, env },
            roots,
        );
        self.roots.pop(&mut env);
        self.roots.pop(&mut bytecode);
        v
    }

    pub fn make_meta_proc(
        &mut self,
        inner: Value,
        meta: Value,
        roots: &mut dyn RootProvider,
    ) -> Value {
        let mut inner = inner;
        let mut meta = meta;
        unsafe {
            self.roots.push(&mut inner);
            self.roots.push(&mut meta);
        }
        let v =
            self.alloc(Tag::MetaProc, CellData::MetaProc { inner, meta }, roots);
        self.roots.pop(&mut meta);
        self.roots.pop(&mut inner);
        v
    }

    pub fn make_primitive_proc(
        &mut self,
        index: u32,
        roots: &mut dyn RootProvider,
    ) -> Value {
        self.alloc(Tag::PrimitiveProc, CellData::PrimitiveProc(index), roots)
    }

    pub fn make_hash_table(&mut self, roots: &mut dyn RootProvider) -> Value {
        self.alloc(
            Tag::HashTable,
            CellData::HashTable(Default::default()),
            roots,
        )
    }

    /// Create the singleton set. Runs once, right after heap construction.
    pub fn bootstrap_specials(&mut self) -> Specials {
        let mut boot = ValueRoots::new();
        let empty_list =
            self.alloc(Tag::EmptyList, CellData::EmptyList, &mut boot);
        boot.0.push(empty_list);
        let true_obj =
            self.alloc(Tag::Boolean, CellData::Boolean(true), &mut boot);
        boot.0.push(true_obj);
        let false_obj =
            self.alloc(Tag::Boolean, CellData::Boolean(false), &mut boot);
        boot.0.push(false_obj);
        let empty_vector =
            self.alloc(Tag::Vector, CellData::Vector(Vec::new()), &mut boot);
        boot.0.push(empty_vector);
        let nil_sym = self.alloc(
            Tag::Symbol,
            CellData::Symbol("nil".to_string()),
            &mut boot,
        );
        Specials {
            empty_list,
            true_obj,
            false_obj,
            empty_vector,
            nil_sym,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn small_heap() -> Heap {
        Heap::new(HeapSettings {
            initial_cells: 64,
            extension_start: 64,
            ..Default::default()
        })
    }

    /// Collect the cell addresses reachable from `v` by following tagged
    /// payload pointers, mirroring what the collector should retain.
    fn reachable_set(v: Value) -> HashSet<*mut Cell> {
        let mut seen = HashSet::new();
        let mut queue = vec![v];
        while let Some(v) = queue.pop() {
            if !seen.insert(v.as_ptr()) {
                continue;
            }
            unsafe { &v.cell().data }.for_each_child(&mut |child| {
                queue.push(child);
            });
        }
        seen
    }

    fn old_list_set(heap: &Heap) -> HashSet<*mut Cell> {
        let mut set = HashSet::new();
        let mut cursor = heap.old.head;
        while !cursor.is_null() {
            set.insert(cursor);
            cursor = unsafe { (*cursor).next };
        }
        set
    }

    /// Property: the returned cell carries the requested tag and the
    /// current colour.
    #[test]
    fn alloc_colours_and_tags_the_cell() {
        let mut heap = small_heap();
        let v = heap.make_fixnum(42, &mut NoRoots);
        assert_eq!(v.tag(), Tag::Fixnum);
        assert_eq!(v.fixnum(), 42);
        assert_eq!(unsafe { v.cell() }.color, heap.color());
    }

    #[test]
    fn collection_frees_everything_without_roots() {
        let mut heap = small_heap();
        for i in 0..32 {
            heap.make_fixnum(i, &mut NoRoots);
        }
        let freed = heap.collect(&mut NoRoots);
        assert_eq!(freed, heap.cells_total());
        assert_eq!(heap.old.len, 0);
        unsafe {
            heap.active.validate();
            heap.old.validate();
        }
    }

    /// Property: after a collection, the cells reachable from the roots are
    /// exactly the cells on the old list.
    #[test]
    fn reachable_set_equals_old_list() {
        let mut heap = small_heap();
        let mut boot = ValueRoots::new();
        let empty = heap.alloc(Tag::EmptyList, CellData::EmptyList, &mut boot);
        boot.0.push(empty);

        // (2 1 0) built back to front, with garbage interleaved
        let mut list = empty;
        for i in 0..3 {
            heap.make_fixnum(100 + i, &mut boot); // garbage
            let mut tail = list;
            unsafe { heap.push_root(&mut tail) };
            let n = heap.make_fixnum(i, &mut boot);
            heap.pop_root(&mut tail);
            list = heap.make_pair(n, tail, &mut boot);
        }
        boot.0.push(list);

        heap.collect(&mut boot);

        let mut expected = reachable_set(empty);
        expected.extend(reachable_set(list));
        assert_eq!(
            expected,
            old_list_set(&heap),
            "old list must hold exactly the reachable cells"
        );
        unsafe {
            heap.active.validate();
            heap.old.validate();
        }

        // payloads intact
        assert_eq!(list.car().fixnum(), 2);
        assert_eq!(list.cdr().car().fixnum(), 1);
        assert_eq!(list.cdr().cdr().car().fixnum(), 0);
    }

    /// Property: a pushed root's holder is read at collection time, so a
    /// reassignment between push and collect keeps the new value alive.
    #[test]
    fn root_holder_reassignment_is_seen() {
        let mut heap = small_heap();
        let mut holder = heap.make_fixnum(1, &mut NoRoots);
        unsafe { heap.push_root(&mut holder) };
        holder = heap.make_fixnum(2, &mut NoRoots);
        heap.collect(&mut NoRoots);
        assert_eq!(holder.fixnum(), 2);
        assert_eq!(
            unsafe { holder.cell() }.color,
            heap.color().wrapping_sub(1),
            "survivor carries the mark colour of the last cycle"
        );
        heap.pop_root(&mut holder);
    }

    /// Property: around an allocating block, a rooted holder refers to the
    /// same cell before and after.
    #[test]
    fn rooted_value_identity_is_stable() {
        let mut heap = small_heap();
        let mut v = heap.make_fixnum(7, &mut NoRoots);
        let before = v.as_ptr();
        unsafe { heap.push_root(&mut v) };
        for i in 0..200 {
            heap.make_fixnum(i, &mut NoRoots); // churn through collections
        }
        heap.pop_root(&mut v);
        assert_eq!(v.as_ptr(), before);
        assert_eq!(v.fixnum(), 7);
    }

    /// Property: at the end of a collection, every cell still in the
    /// finalizable set is reachable; swept cells had their buffers released.
    #[test]
    fn finalizable_sweep_releases_only_garbage() {
        let mut heap = small_heap();
        let empty = heap.alloc(Tag::EmptyList, CellData::EmptyList, &mut NoRoots);
        let mut live = heap.make_vector(3, empty, &mut NoRoots);
        let dead = {
            let mut fill = live;
            unsafe { heap.push_root(&mut fill) };
            let dead = heap.make_vector(3, fill, &mut NoRoots);
            heap.pop_root(&mut fill);
            dead
        };
        assert_eq!(heap.finalizable.len(), 2);

        unsafe { heap.push_root(&mut live) };
        heap.collect(&mut NoRoots);
        heap.pop_root(&mut live);

        assert_eq!(heap.finalizable.len(), 1);
        assert_eq!(heap.finalizable[0], live.as_ptr());
        assert!(
            matches!(unsafe { &dead.cell().data }, CellData::EmptyList),
            "swept vector's buffer must be released"
        );
        assert_eq!(live.vector_len(), 3, "live vector keeps its buffer");
    }

    /// The colour epoch advances twice per collection, so the allocation
    /// colour never equals the mark colour of the cycle that just ran.
    #[test]
    fn colour_epoch_advances_past_mark() {
        let mut heap = small_heap();
        let before = heap.color();
        heap.collect(&mut NoRoots);
        assert_eq!(heap.color(), before.wrapping_add(2));
    }

    /// When a collection frees nothing, the heap extends by the growing
    /// increment and allocation proceeds.
    #[test]
    fn extension_when_everything_is_live() {
        let mut heap = small_heap();
        let total = heap.cells_total();
        let mut live = ValueRoots::new();
        loop {
            let v = heap.make_fixnum(live.0.len() as i64, &mut live);
            live.0.push(v);
            if heap.cells_total() > total {
                break;
            }
            assert!(live.0.len() <= total + 1, "heap never extended");
        }
        assert_eq!(heap.cells_total(), total + 64);
        for (i, v) in live.0.iter().enumerate() {
            assert_eq!(v.fixnum(), i as i64, "value {i} lost across extension");
        }
    }

    #[test]
    fn no_extension_while_collection_keeps_up() {
        let mut heap = small_heap();
        let total = heap.cells_total();
        for i in 0..(total as i64 * 5) {
            heap.make_fixnum(i, &mut NoRoots);
        }
        assert_eq!(
            heap.cells_total(),
            total,
            "garbage alone must not grow the heap"
        );
    }

    #[test]
    fn settings_validation() {
        assert!(HeapSettings::default().validate().is_ok());
        assert!(HeapSettings {
            initial_cells: 0,
            ..Default::default()
        }
        .validate()
        .is_err());
        assert!(HeapSettings {
            extension_factor: 1,
            ..Default::default()
        }
        .validate()
        .is_err());
    }

    #[test]
    fn bootstrap_specials_shapes() {
        let mut heap = small_heap();
        let specials = heap.bootstrap_specials();
        assert_eq!(specials.empty_list.tag(), Tag::EmptyList);
        assert!(specials.true_obj.boolean());
        assert!(!specials.false_obj.boolean());
        assert_eq!(specials.empty_vector.vector_len(), 0);
        assert_eq!(unsafe { specials.nil_sym.symbol_name() }, "nil");
        assert!(specials.is_falselike(specials.nil_sym));
    }

    /// A vector of 10000 pairs is the only structural root; repeated
    /// collections under garbage churn must preserve every pair, by
    /// identity and by payload.
    #[test]
    fn gc_survival_of_large_rooted_structure() {
        let mut heap = Heap::new(HeapSettings {
            initial_cells: 1000,
            extension_start: 1000,
            ..Default::default()
        });
        let specials = heap.bootstrap_specials();
        let mut roots = ValueRoots(vec![
            specials.empty_list,
            specials.true_obj,
            specials.false_obj,
            specials.empty_vector,
            specials.nil_sym,
        ]);

        const N: usize = 10_000;
        let table = heap.make_vector(N, specials.empty_list, &mut roots);
        roots.0.push(table);

        for i in 0..N {
            let p = heap.make_pair(
                specials.empty_list,
                specials.empty_list,
                &mut roots,
            );
            table.vector_set(i, p);
            let car = heap.make_fixnum(i as i64, &mut roots);
            p.set_car(car);
            let cdr = heap.make_fixnum((i * 2) as i64, &mut roots);
            p.set_cdr(cdr);
        }

        let identities: Vec<*mut Cell> =
            (0..N).map(|i| table.vector_ref(i).as_ptr()).collect();

        // churn garbage to force several more collections
        for _ in 0..3 {
            for i in 0..2000 {
                let a = heap.make_fixnum(i, &mut roots);
                heap.make_pair(a, a, &mut roots);
            }
            heap.collect(&mut roots);
        }

        for i in 0..N {
            let p = table.vector_ref(i);
            assert_eq!(p.as_ptr(), identities[i], "pair {i} changed identity");
            assert_eq!(p.car().fixnum(), i as i64, "car of pair {i} corrupted");
            assert_eq!(
                p.cdr().fixnum(),
                (i * 2) as i64,
                "cdr of pair {i} corrupted"
            );
        }
    }

    /// Cells handed back by a collection are reused by later allocations.
    #[test]
    fn free_pool_is_reused() {
        let mut heap = small_heap();
        let first = heap.make_fixnum(1, &mut NoRoots).as_ptr();
        heap.collect(&mut NoRoots);
        let mut seen = false;
        for i in 0..heap.cells_total() {
            let v = heap.make_fixnum(i as i64, &mut NoRoots);
            if v.as_ptr() == first {
                seen = true;
                break;
            }
        }
        assert!(seen, "swept cell was never handed out again");
    }
}
