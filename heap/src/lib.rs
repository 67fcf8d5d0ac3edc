//! Cell allocator and tracing collector.
//!
//! A Baker-style list-splicing scheme: the whole heap lives on two intrusive
//! doubly-linked lists. Fresh cells are handed out from the `active` list;
//! a collection splices everything reachable onto the `old` list and the
//! residue becomes the free pool, with finalizers releasing the external
//! buffers of swept strings, vectors, and hash tables.
//!
//! Liveness comes from two sources: the [`RootStack`] of registered holder
//! addresses (VM locals, primitive temporaries), and a [`RootProvider`]
//! enumerating the persistent roots (globals, interning table, singletons).

mod heap;
mod list;
mod roots;

pub use heap::{Heap, HeapSettings, NoRoots, RootProvider, ValueRoots};
pub use roots::RootStack;
