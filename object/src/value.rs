use core::fmt;
use std::ptr::NonNull;

use crate::cell::{Cell, CellData, Tag};

/// A handle to a heap cell.
///
/// Values are created by the heap and stay valid for the heap's lifetime;
/// cells are never moved or individually deallocated, only recycled. Equality
/// and hashing are cell identity, which is what symbol interning and
/// hash-table keys rely on.
///
/// Typed accessors panic when the tag does not match; callers that cannot
/// trust a tag should check it first.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Value(NonNull<Cell>);

impl Value {
    pub fn from_ptr(ptr: *mut Cell) -> Self {
        Value(NonNull::new(ptr).expect("null cell pointer"))
    }

    #[inline(always)]
    pub fn as_ptr(self) -> *mut Cell {
        self.0.as_ptr()
    }

    /// Borrow the underlying cell.
    ///
    /// # Safety
    ///
    /// The heap that created this value must still be alive, and no mutable
    /// borrow of the same cell may be live.
    #[inline(always)]
    pub unsafe fn cell<'a>(self) -> &'a Cell {
        &*self.0.as_ptr()
    }

    #[inline(always)]
    pub fn tag(self) -> Tag {
        unsafe { (*self.0.as_ptr()).tag }
    }

    /// Re-tag this cell. Only meaningful for tags sharing a payload shape,
    /// such as turning a compiled procedure into a syntax procedure.
    pub fn set_tag(self, tag: Tag) {
        unsafe {
            (*self.0.as_ptr()).tag = tag;
        }
    }

    // ── predicates ─────────────────────────────────────────────────

    #[inline(always)]
    pub fn is_pair(self) -> bool {
        self.tag() == Tag::Pair
    }

    #[inline(always)]
    pub fn is_fixnum(self) -> bool {
        self.tag() == Tag::Fixnum
    }

    #[inline(always)]
    pub fn is_compiled(self) -> bool {
        self.tag().is_compiled()
    }

    // ── scalar readers ─────────────────────────────────────────────

    pub fn fixnum(self) -> i64 {
        match unsafe { &(*self.0.as_ptr()).data } {
            CellData::Fixnum(n) => *n,
            _ => panic!("not a fixnum: {:?}", self),
        }
    }

    pub fn character(self) -> char {
        match unsafe { &(*self.0.as_ptr()).data } {
            CellData::Character(c) => *c,
            _ => panic!("not a character: {:?}", self),
        }
    }

    pub fn boolean(self) -> bool {
        match unsafe { &(*self.0.as_ptr()).data } {
            CellData::Boolean(b) => *b,
            _ => panic!("not a boolean: {:?}", self),
        }
    }

    /// The interned name of a symbol cell.
    ///
    /// # Safety
    ///
    /// The returned borrow is detached from the cell; it must not outlive
    /// the heap. Symbol payloads are never mutated, so the bytes stay valid
    /// as long as the heap does.
    pub unsafe fn symbol_name<'a>(self) -> &'a str {
        match &(*self.0.as_ptr()).data {
            CellData::Symbol(name) => &*(name.as_str() as *const str),
            _ => panic!("not a symbol: {:?}", self),
        }
    }

    // ── pairs ──────────────────────────────────────────────────────

    pub fn car(self) -> Value {
        match unsafe { &(*self.0.as_ptr()).data } {
            CellData::Pair { car, .. } => *car,
            _ => panic!("car of non-pair: {:?}", self),
        }
    }

    pub fn cdr(self) -> Value {
        match unsafe { &(*self.0.as_ptr()).data } {
            CellData::Pair { cdr, .. } => *cdr,
            _ => panic!("cdr of non-pair: {:?}", self),
        }
    }

    pub fn set_car(self, value: Value) {
        match unsafe { &mut (*self.0.as_ptr()).data } {
            CellData::Pair { car, .. } => *car = value,
            _ => panic!("set-car of non-pair: {:?}", self),
        }
    }

    pub fn set_cdr(self, value: Value) {
        match unsafe { &mut (*self.0.as_ptr()).data } {
            CellData::Pair { cdr, .. } => *cdr = value,
            _ => panic!("set-cdr of non-pair: {:?}", self),
        }
    }

    // ── vectors ────────────────────────────────────────────────────

    pub fn vector_len(self) -> usize {
        match unsafe { &(*self.0.as_ptr()).data } {
            CellData::Vector(elements) => elements.len(),
            _ => panic!("vector-length of non-vector: {:?}", self),
        }
    }

    pub fn vector_ref(self, index: usize) -> Value {
        match unsafe { &(*self.0.as_ptr()).data } {
            CellData::Vector(elements) => elements[index],
            _ => panic!("vector-ref of non-vector: {:?}", self),
        }
    }

    pub fn vector_set(self, index: usize, value: Value) {
        match unsafe { &mut (*self.0.as_ptr()).data } {
            CellData::Vector(elements) => elements[index] = value,
            _ => panic!("vector-set of non-vector: {:?}", self),
        }
    }

    /// Grow or shrink the backing buffer, filling fresh slots with `fill`.
    pub fn vector_resize(self, new_len: usize, fill: Value) {
        match unsafe { &mut (*self.0.as_ptr()).data } {
            CellData::Vector(elements) => elements.resize(new_len, fill),
            _ => panic!("vector-resize of non-vector: {:?}", self),
        }
    }

    /// Borrow the element buffer.
    ///
    /// # Safety
    ///
    /// The borrow is detached from the cell. It must not be held across
    /// anything that can resize this vector, and the heap must stay alive.
    pub unsafe fn vector_slice<'a>(self) -> &'a [Value] {
        match &(*self.0.as_ptr()).data {
            CellData::Vector(elements) => {
                &*(elements.as_slice() as *const [Value])
            }
            _ => panic!("vector-slice of non-vector: {:?}", self),
        }
    }

    // ── strings ────────────────────────────────────────────────────

    pub fn str_len(self) -> usize {
        match unsafe { &(*self.0.as_ptr()).data } {
            CellData::Str(bytes) => bytes.len(),
            _ => panic!("string-length of non-string: {:?}", self),
        }
    }

    /// Borrow the byte buffer.
    ///
    /// # Safety
    ///
    /// Same contract as [`Value::vector_slice`]: no mutation of this string
    /// while the borrow is held, and the heap must stay alive.
    pub unsafe fn str_bytes<'a>(self) -> &'a [u8] {
        match &(*self.0.as_ptr()).data {
            CellData::Str(bytes) => &*(bytes.as_slice() as *const [u8]),
            _ => panic!("string-bytes of non-string: {:?}", self),
        }
    }

    // ── procedures ─────────────────────────────────────────────────

    pub fn proc_bytecode(self) -> Value {
        match unsafe { &(*self.0.as_ptr()).data } {
            CellData::CompiledProc { bytecode, .. } => *bytecode,
            _ => panic!("bytecode of non-procedure: {:?}", self),
        }
    }

    pub fn proc_env(self) -> Value {
        match unsafe { &(*self.0.as_ptr()).data } {
            CellData::CompiledProc { env, .. } => *env,
            _ => panic!("environment of non-procedure: {:?}", self),
        }
    }

    pub fn primitive_index(self) -> u32 {
        match unsafe { &(*self.0.as_ptr()).data } {
            CellData::PrimitiveProc(index) => *index,
            _ => panic!("primitive index of non-primitive: {:?}", self),
        }
    }

    pub fn meta_inner(self) -> Value {
        match unsafe { &(*self.0.as_ptr()).data } {
            CellData::MetaProc { inner, .. } => *inner,
            _ => panic!("meta-inner of non-meta: {:?}", self),
        }
    }

    pub fn meta_data(self) -> Value {
        match unsafe { &(*self.0.as_ptr()).data } {
            CellData::MetaProc { meta, .. } => *meta,
            _ => panic!("meta-data of non-meta: {:?}", self),
        }
    }

    // ── hash tables ────────────────────────────────────────────────

    pub fn table_get(self, key: Value) -> Option<Value> {
        match unsafe { &(*self.0.as_ptr()).data } {
            CellData::HashTable(table) => table.get(&key).copied(),
            _ => panic!("table-get of non-table: {:?}", self),
        }
    }

    pub fn table_insert(self, key: Value, value: Value) {
        match unsafe { &mut (*self.0.as_ptr()).data } {
            CellData::HashTable(table) => {
                table.insert(key, value);
            }
            _ => panic!("table-insert of non-table: {:?}", self),
        }
    }

    pub fn table_remove(self, key: Value) -> Option<Value> {
        match unsafe { &mut (*self.0.as_ptr()).data } {
            CellData::HashTable(table) => table.remove(&key),
            _ => panic!("table-remove of non-table: {:?}", self),
        }
    }

    pub fn table_len(self) -> usize {
        match unsafe { &(*self.0.as_ptr()).data } {
            CellData::HashTable(table) => table.len(),
            _ => panic!("table-length of non-table: {:?}", self),
        }
    }
}

const MAX_DEBUG_DEPTH: usize = 12;

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_value(f, *self, MAX_DEBUG_DEPTH)
    }
}

/// Render a value as an s-expression, depth-limited so cyclic structures
/// (environment chains, continuations) terminate.
fn write_value(
    f: &mut fmt::Formatter<'_>,
    v: Value,
    depth: usize,
) -> fmt::Result {
    if depth == 0 {
        return write!(f, "...");
    }
    let cell = unsafe { v.cell() };
    match &cell.data {
        CellData::EmptyList => write!(f, "()"),
        CellData::Boolean(true) => write!(f, "#t"),
        CellData::Boolean(false) => write!(f, "#f"),
        CellData::Fixnum(n) => write!(f, "{n}"),
        CellData::Character(c) => write!(f, "#\\{c}"),
        CellData::Symbol(name) => write!(f, "{name}"),
        CellData::Str(bytes) => {
            write!(f, "\"{}\"", String::from_utf8_lossy(bytes))
        }
        CellData::Pair { .. } => write_list(f, v, depth),
        CellData::Vector(elements) => {
            write!(f, "#(")?;
            for (i, &e) in elements.iter().enumerate().take(depth) {
                if i > 0 {
                    write!(f, " ")?;
                }
                write_value(f, e, depth - 1)?;
            }
            if elements.len() > depth {
                write!(f, " ...")?;
            }
            write!(f, ")")
        }
        CellData::CompiledProc { .. } => {
            if cell.tag == Tag::CompiledSyntaxProc {
                write!(f, "#<syntax-proc>")
            } else {
                write!(f, "#<compiled-proc>")
            }
        }
        CellData::PrimitiveProc(index) => write!(f, "#<primitive {index}>"),
        CellData::MetaProc { .. } => write!(f, "#<meta-proc>"),
        CellData::HashTable(table) => {
            write!(f, "#<hash-table {}>", table.len())
        }
    }
}

fn write_list(
    f: &mut fmt::Formatter<'_>,
    v: Value,
    depth: usize,
) -> fmt::Result {
    write!(f, "(")?;
    let mut cursor = v;
    let mut remaining = depth;
    loop {
        write_value(f, cursor.car(), depth - 1)?;
        let tail = cursor.cdr();
        remaining -= 1;
        match (tail.tag(), remaining) {
            (Tag::EmptyList, _) => break,
            (Tag::Pair, 0) => {
                write!(f, " ...")?;
                break;
            }
            (Tag::Pair, _) => {
                write!(f, " ")?;
                cursor = tail;
            }
            _ => {
                write!(f, " . ")?;
                write_value(f, tail, depth - 1)?;
                break;
            }
        }
    }
    write!(f, ")")
}
