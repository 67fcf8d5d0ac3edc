//! Packed instruction encoding.
//!
//! The compiler-facing instruction form is a stream of triples
//! `(opcode, arg1, arg2)`; this crate fixes the packed layout (three
//! little-endian 16-bit slots per instruction) and provides the builder
//! and decoder over it. Constant hoisting into per-procedure pools happens
//! in the assembler that sits on top (the `vm` crate), where heap values
//! are available.

mod builder;
mod decoder;
mod instr;
mod op;

pub use builder::{Builder, Label};
pub use decoder::{decode_at, instr_count, DecodeError, Decoder};
pub use instr::{Instr, INSTR_SIZE, NO_ARG};
pub use op::Op;
