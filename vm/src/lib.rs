//! The stack-based evaluator and its runtime context.
//!
//! [`Runtime`] owns the heap and the process-wide tables: interned symbols,
//! the global environment, the continuation-thunk template, and the
//! primitive dispatch table. Every allocation goes through a split-borrow
//! [`RootProvider`] over these fields, so the collector always sees the
//! persistent roots; transient values use the heap's root stack.

pub mod assemble;
pub mod interpreter;
pub mod primitives;

use std::collections::HashMap;

use heap::{Heap, HeapSettings, RootProvider, ValueRoots};
use object::{Specials, Tag, Value};

pub use interpreter::{execute, RuntimeError};

/// One entry of the primitive dispatch table. `PrimitiveProc` cells carry
/// an index into this table.
pub struct PrimitiveDesc {
    pub name: &'static str,
    pub func: PrimitiveFn,
}

/// The primitive calling convention: runtime context, the operand-stack
/// cell, the argument count, and the stack top. Arguments sit at
/// `stack[top - argc .. top]` and are unwound by the VM after the call.
/// A primitive that allocates must root any live temporaries first.
pub type PrimitiveFn =
    fn(&mut Runtime, Value, i64, i64) -> Result<Value, RuntimeError>;

pub struct Runtime {
    pub heap: Heap,
    pub specials: Specials,
    /// Interned symbols: name → symbol cell. Interning makes equal names
    /// pointer-equal.
    symbols: HashMap<String, Value>,
    /// The global environment: a hash-table cell mapping symbol cells to
    /// value cells.
    globals: Value,
    /// Template of the fixed continuation thunk, built at bootstrap.
    pub(crate) cc_bytecode: Value,
    pub(crate) primitives: Vec<PrimitiveDesc>,
    /// Rooted temporaries for multi-step construction; holders park values
    /// here while building structures the collector cannot yet reach.
    pub(crate) scratch: Vec<Value>,
}

/// Split-borrow adapter visiting the runtime's persistent roots.
pub(crate) struct RuntimeRoots<'a> {
    specials: &'a Specials,
    symbols: &'a HashMap<String, Value>,
    globals: Value,
    cc_bytecode: Value,
    scratch: &'a [Value],
}

impl RootProvider for RuntimeRoots<'_> {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(Value)) {
        visitor(self.specials.empty_list);
        visitor(self.specials.true_obj);
        visitor(self.specials.false_obj);
        visitor(self.specials.empty_vector);
        visitor(self.specials.nil_sym);
        visitor(self.globals);
        visitor(self.cc_bytecode);
        for &v in self.symbols.values() {
            visitor(v);
        }
        for &v in self.scratch {
            visitor(v);
        }
    }
}

impl Runtime {
    pub fn new() -> Self {
        Self::with_settings(HeapSettings::default())
    }

    /// Bootstrap order: heap, singletons, symbol table, global environment,
    /// continuation thunk, primitives.
    pub fn with_settings(settings: HeapSettings) -> Self {
        let mut heap = Heap::new(settings);
        let specials = heap.bootstrap_specials();

        let mut symbols = HashMap::new();
        symbols.insert("nil".to_string(), specials.nil_sym);

        let mut boot = ValueRoots(vec![
            specials.empty_list,
            specials.true_obj,
            specials.false_obj,
            specials.empty_vector,
            specials.nil_sym,
        ]);
        let globals = heap.make_hash_table(&mut boot);

        let mut rt = Runtime {
            heap,
            specials,
            symbols,
            globals,
            cc_bytecode: specials.empty_list,
            primitives: Vec::new(),
            scratch: Vec::new(),
        };
        rt.cc_bytecode = assemble::cc_template(&mut rt);
        primitives::install(&mut rt);
        rt
    }

    pub(crate) fn split(&mut self) -> (&mut Heap, RuntimeRoots<'_>) {
        let Runtime {
            heap,
            specials,
            symbols,
            globals,
            cc_bytecode,
            scratch,
            ..
        } = self;
        (
            heap,
            RuntimeRoots {
                specials,
                symbols,
                globals: *globals,
                cc_bytecode: *cc_bytecode,
                scratch: scratch.as_slice(),
            },
        )
    }

    // ── symbols and globals ────────────────────────────────────────

    /// The unique symbol cell for `name`.
    pub fn intern(&mut self, name: &str) -> Value {
        if let Some(&sym) = self.symbols.get(name) {
            return sym;
        }
        let sym = {
            let (heap, mut roots) = self.split();
            heap.make_symbol(name, &mut roots)
        };
        self.symbols.insert(name.to_string(), sym);
        sym
    }

    /// Define or update a global binding.
    pub fn define_global(&mut self, sym: Value, value: Value) {
        debug_assert_eq!(sym.tag(), Tag::Symbol);
        self.globals.table_insert(sym, value);
    }

    pub fn lookup_global(&self, sym: Value) -> Option<Value> {
        self.globals.table_get(sym)
    }

    pub fn global_bound(&self, sym: Value) -> bool {
        self.globals.table_get(sym).is_some()
    }

    // ── constructors ───────────────────────────────────────────────

    pub fn make_pair(&mut self, car: Value, cdr: Value) -> Value {
        let (heap, mut roots) = self.split();
        heap.make_pair(car, cdr, &mut roots)
    }

    pub fn make_vector(&mut self, len: usize, fill: Value) -> Value {
        let (heap, mut roots) = self.split();
        heap.make_vector(len, fill, &mut roots)
    }

    pub fn make_fixnum(&mut self, n: i64) -> Value {
        let (heap, mut roots) = self.split();
        heap.make_fixnum(n, &mut roots)
    }

    pub fn make_character(&mut self, c: char) -> Value {
        let (heap, mut roots) = self.split();
        heap.make_character(c, &mut roots)
    }

    pub fn make_string(&mut self, text: &str) -> Value {
        let (heap, mut roots) = self.split();
        heap.make_string(text, &mut roots)
    }

    pub fn make_bytes(&mut self, bytes: Vec<u8>) -> Value {
        let (heap, mut roots) = self.split();
        heap.make_bytes(bytes, &mut roots)
    }

    pub fn make_compiled_proc(&mut self, bytecode: Value, env: Value) -> Value {
        let (heap, mut roots) = self.split();
        heap.make_compiled_proc(bytecode, env, &mut roots)
    }

    pub fn make_meta_proc(&mut self, inner: Value, meta: Value) -> Value {
        let (heap, mut roots) = self.split();
        heap.make_meta_proc(inner, meta, &mut roots)
    }

    pub fn make_hash_table(&mut self) -> Value {
        let (heap, mut roots) = self.split();
        heap.make_hash_table(&mut roots)
    }

    /// Run a collection against the runtime's persistent roots plus
    /// whatever is registered on the heap's root stack.
    pub fn collect(&mut self) -> usize {
        let (heap, mut roots) = self.split();
        heap.collect(&mut roots)
    }

    /// Build an operand stack, push `args`, and run `f` to completion.
    pub fn call(
        &mut self,
        f: Value,
        args: &[Value],
    ) -> Result<Value, RuntimeError> {
        let base = self.scratch.len();
        self.scratch.push(f);
        self.scratch.extend_from_slice(args);

        let capacity = (args.len() + 8).max(16);
        let stack = self.make_vector(capacity, self.specials.empty_list);
        for (i, &arg) in args.iter().enumerate() {
            stack.vector_set(i, arg);
        }
        self.scratch.truncate(base);

        execute(self, f, stack, args.len() as i64, args.len() as i64)
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_gives_pointer_equality() {
        let mut rt = Runtime::new();
        let a = rt.intern("fold");
        let b = rt.intern("fold");
        let c = rt.intern("map");
        assert_eq!(a, b, "equal names intern to the same cell");
        assert_ne!(a, c);
        assert_eq!(unsafe { a.symbol_name() }, "fold");
    }

    #[test]
    fn nil_is_interned_at_bootstrap() {
        let mut rt = Runtime::new();
        let nil = rt.intern("nil");
        assert_eq!(nil, rt.specials.nil_sym);
    }

    #[test]
    fn globals_define_lookup_and_probe() {
        let mut rt = Runtime::new();
        let sym = rt.intern("x");
        assert!(!rt.global_bound(sym));
        assert_eq!(rt.lookup_global(sym), None);

        let v1 = rt.make_fixnum(1);
        rt.define_global(sym, v1);
        assert!(rt.global_bound(sym));
        assert_eq!(rt.lookup_global(sym), Some(v1));

        let v2 = rt.make_fixnum(2);
        rt.define_global(sym, v2);
        assert_eq!(rt.lookup_global(sym), Some(v2), "define updates in place");
    }

    #[test]
    fn runtime_tables_survive_collection() {
        let mut rt = Runtime::new();
        let sym = rt.intern("kept");
        let v = rt.make_fixnum(99);
        rt.define_global(sym, v);

        for i in 0..5000 {
            rt.make_fixnum(i); // garbage
        }
        rt.collect();
        rt.collect();

        assert_eq!(rt.lookup_global(sym), Some(v));
        assert_eq!(v.fixnum(), 99);
        assert_eq!(rt.intern("kept"), sym);
        assert!(rt.specials.true_obj.boolean());
    }

    #[test]
    fn global_bindings_are_traced_through_the_table_cell() {
        let mut rt = Runtime::new();
        let sym = rt.intern("boxed");
        let empty = rt.specials.empty_list;
        let pair = rt.make_pair(empty, empty);
        rt.define_global(sym, pair);
        let inner = rt.make_fixnum(5);
        pair.set_car(inner);

        for i in 0..5000 {
            rt.make_fixnum(i);
        }
        rt.collect();

        let found = rt.lookup_global(sym).unwrap();
        assert_eq!(found, pair);
        assert_eq!(found.car().fixnum(), 5, "value reachable only via a global");
    }
}
