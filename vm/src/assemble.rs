//! Assembler from the compiler-facing instruction form to packed templates.
//!
//! The compiler emits a vector of instruction lists `(opcode-char arg1
//! arg2)`, the empty list standing for an absent argument. Assembly packs
//! the stream into three-slot triples and hoists the constants referenced
//! by `const`, `fn`, `gvar`, and `gset` into a per-procedure constant
//! vector. The result is a *template*: a two-slot vector cell
//! `[code bytes, constant vector]`, the `bytecode` payload of compiled
//! procedures.

use core::fmt;

use bytecode::{Builder, Decoder, Label, Op};
use object::{Tag, Value};

use crate::{Runtime, RuntimeRoots};

#[derive(Debug, Clone, PartialEq)]
pub enum AssembleError {
    ExpectedVector { got: Value },
    MalformedInstruction { index: usize },
    UnknownOpcode { index: usize },
    ArgOutOfRange { index: usize },
}

impl fmt::Display for AssembleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssembleError::ExpectedVector { got } => {
                write!(f, "expected an instruction vector, got {got:?}")
            }
            AssembleError::MalformedInstruction { index } => {
                write!(f, "malformed instruction at {index}")
            }
            AssembleError::UnknownOpcode { index } => {
                write!(f, "unknown opcode at {index}")
            }
            AssembleError::ArgOutOfRange { index } => {
                write!(f, "argument out of range at {index}")
            }
        }
    }
}

/// Assemble a vector of instruction lists into a packed template.
pub fn assemble(rt: &mut Runtime, listing: Value) -> Result<Value, AssembleError> {
    let base = rt.scratch.len();
    let result = assemble_inner(rt, listing);
    if result.is_err() {
        // release pool constants parked before the failure
        rt.scratch.truncate(base);
    }
    result
}

fn assemble_inner(
    rt: &mut Runtime,
    listing: Value,
) -> Result<Value, AssembleError> {
    if listing.tag() != Tag::Vector {
        return Err(AssembleError::ExpectedVector { got: listing });
    }
    let empty = rt.specials.empty_list;
    let mut asm = ProcAssembler::new(rt);
    for index in 0..listing.vector_len() {
        let instr = listing.vector_ref(index);
        let (op_cell, arg1, arg2) = instr_parts(empty, instr)
            .ok_or(AssembleError::MalformedInstruction { index })?;

        if op_cell.tag() != Tag::Character {
            return Err(AssembleError::UnknownOpcode { index });
        }
        let code = u32::from(op_cell.character());
        let op = u8::try_from(code)
            .ok()
            .and_then(|b| Op::try_from(b).ok())
            .ok_or(AssembleError::UnknownOpcode { index })?;

        match op {
            Op::Const | Op::Fn | Op::GVar | Op::GSet => {
                asm.emit_pooled(rt, op, arg1);
            }
            Op::LVar | Op::LSet => {
                let a = num_arg(arg1, index)?;
                let b = num_arg(arg2, index)?;
                asm.emit(op, a, b);
            }
            Op::Args
            | Op::ArgsDot
            | Op::Jump
            | Op::TJump
            | Op::FJump
            | Op::Save
            | Op::CallJ
            | Op::FCallJ => {
                let a = num_arg(arg1, index)?;
                asm.emit1(op, a);
            }
            Op::Return | Op::SetCC | Op::CC | Op::Pop => {
                asm.emit0(op);
            }
        }
    }
    Ok(asm.finish(rt))
}

/// Split `(op a b)` into its parts, filling missing tail positions with the
/// empty list.
fn instr_parts(empty: Value, instr: Value) -> Option<(Value, Value, Value)> {
    if !instr.is_pair() {
        return None;
    }
    let op = instr.car();
    let rest = instr.cdr();
    let (a, rest) = if rest.is_pair() {
        (rest.car(), rest.cdr())
    } else {
        (empty, empty)
    };
    let b = if rest.is_pair() { rest.car() } else { empty };
    Some((op, a, b))
}

fn num_arg(v: Value, index: usize) -> Result<i16, AssembleError> {
    if v.tag() != Tag::Fixnum {
        return Err(AssembleError::MalformedInstruction { index });
    }
    i16::try_from(v.fixnum()).map_err(|_| AssembleError::ArgOutOfRange { index })
}

/// Assembles one procedure from Rust callers (bootstrap, tests, demos),
/// managing the constant pool.
///
/// Pool entries are parked on the runtime's scratch roots while the
/// procedure is under construction, so they survive collections triggered
/// by later allocations. Do not interleave other scratch use between
/// [`ProcAssembler::new`] and [`ProcAssembler::finish`].
pub struct ProcAssembler {
    builder: Builder,
    base: usize,
}

impl ProcAssembler {
    pub fn new(rt: &mut Runtime) -> Self {
        ProcAssembler {
            builder: Builder::new(),
            base: rt.scratch.len(),
        }
    }

    /// Instruction index the next emit will occupy.
    pub fn here(&self) -> i16 {
        self.builder.here()
    }

    pub fn emit(&mut self, op: Op, a: i16, b: i16) {
        self.builder.emit(op, a, b);
    }

    pub fn emit1(&mut self, op: Op, a: i16) {
        self.builder.emit1(op, a);
    }

    pub fn emit0(&mut self, op: Op) {
        self.builder.emit0(op);
    }

    /// Emit `op` with a constant-pool argument, interning `v` into the
    /// pool (deduplicated by cell identity).
    pub fn emit_pooled(&mut self, rt: &mut Runtime, op: Op, v: Value) {
        let index = self.pool_index(rt, v);
        self.builder.emit1(op, index);
    }

    /// Park `v` in the constant pool without emitting anything. Useful to
    /// keep a prebuilt cell rooted for the rest of the assembly; a later
    /// pooled emit of the same cell reuses the slot.
    pub fn intern_constant(&mut self, rt: &mut Runtime, v: Value) -> i16 {
        self.pool_index(rt, v)
    }

    fn pool_index(&mut self, rt: &mut Runtime, v: Value) -> i16 {
        if let Some(i) = rt.scratch[self.base..].iter().position(|&c| c == v) {
            return i as i16;
        }
        rt.scratch.push(v);
        (rt.scratch.len() - 1 - self.base) as i16
    }

    // ── mnemonic helpers ───────────────────────────────────────────

    pub fn args(&mut self, n: i16) {
        self.emit1(Op::Args, n);
    }

    pub fn argsdot(&mut self, n: i16) {
        self.emit1(Op::ArgsDot, n);
    }

    pub fn ret(&mut self) {
        self.emit0(Op::Return);
    }

    pub fn constant(&mut self, rt: &mut Runtime, v: Value) {
        self.emit_pooled(rt, Op::Const, v);
    }

    /// `fn` over a prototype: either a template vector or a compiled
    /// procedure whose bytecode is shared.
    pub fn fn_proto(&mut self, rt: &mut Runtime, proto: Value) {
        self.emit_pooled(rt, Op::Fn, proto);
    }

    pub fn gvar(&mut self, rt: &mut Runtime, sym: Value) {
        self.emit_pooled(rt, Op::GVar, sym);
    }

    pub fn gset(&mut self, rt: &mut Runtime, sym: Value) {
        self.emit_pooled(rt, Op::GSet, sym);
    }

    pub fn lvar(&mut self, frame: i16, slot: i16) {
        self.emit(Op::LVar, frame, slot);
    }

    pub fn lset(&mut self, frame: i16, slot: i16) {
        self.emit(Op::LSet, frame, slot);
    }

    pub fn jump(&mut self) -> Label {
        self.builder.jump()
    }

    pub fn jump_to(&mut self, target: i16) {
        self.emit1(Op::Jump, target);
    }

    pub fn tjump(&mut self) -> Label {
        self.builder.tjump()
    }

    pub fn fjump(&mut self) -> Label {
        self.builder.fjump()
    }

    pub fn save(&mut self) -> Label {
        self.builder.save()
    }

    pub fn bind(&mut self, label: Label) {
        self.builder.bind(label);
    }

    pub fn callj(&mut self, n: i16) {
        self.emit1(Op::CallJ, n);
    }

    pub fn fcallj(&mut self, n: i16) {
        self.emit1(Op::FCallJ, n);
    }

    pub fn setcc(&mut self) {
        self.emit0(Op::SetCC);
    }

    pub fn cc(&mut self) {
        self.emit0(Op::CC);
    }

    pub fn pop(&mut self) {
        self.emit0(Op::Pop);
    }

    /// Materialise the template cell and release the parked pool entries.
    pub fn finish(self, rt: &mut Runtime) -> Value {
        finish_template(rt, self.base, self.builder)
    }
}

fn finish_template(rt: &mut Runtime, base: usize, builder: Builder) -> Value {
    let code = rt.make_bytes(builder.into_bytes());
    rt.scratch.push(code);

    let consts = {
        let Runtime {
            heap,
            specials,
            symbols,
            globals,
            cc_bytecode,
            scratch,
            ..
        } = rt;
        // the pool sits between `base` and the just-pushed code cell
        let scratch = scratch.as_slice();
        let pool = &scratch[base..scratch.len() - 1];
        let mut roots = RuntimeRoots {
            specials,
            symbols,
            globals: *globals,
            cc_bytecode: *cc_bytecode,
            scratch,
        };
        // SAFETY: every pool entry is parked on the scratch roots above.
        unsafe { heap.make_vector_from(pool, &mut roots) }
    };
    rt.scratch.push(consts);

    let template = rt.make_vector(2, rt.specials.empty_list);
    template.vector_set(0, code);
    template.vector_set(1, consts);
    rt.scratch.truncate(base);
    template
}

/// The fixed continuation thunk: restore the saved operand stack and top,
/// then yield the value handed to the continuation.
pub(crate) fn cc_template(rt: &mut Runtime) -> Value {
    let mut a = ProcAssembler::new(rt);
    a.args(1);
    a.lvar(1, 1); // saved top
    a.lvar(1, 0); // saved stack
    a.setcc();
    a.lvar(0, 0); // the value handed to the continuation
    a.ret();
    a.finish(rt)
}

/// Render a template's instructions, annotating pool references.
pub fn disassemble(template: Value) -> String {
    use std::fmt::Write;

    if template.tag() != Tag::Vector || template.vector_len() != 2 {
        return "<not a bytecode template>".to_string();
    }
    let code = template.vector_ref(0);
    let consts = template.vector_ref(1);
    if code.tag() != Tag::Str || consts.tag() != Tag::Vector {
        return "<not a bytecode template>".to_string();
    }

    let bytes = unsafe { code.str_bytes() };
    let mut out = String::new();
    for (i, instr) in Decoder::new(bytes).enumerate() {
        let _ = write!(out, "{i:>4}: {instr}");
        if matches!(instr.op, Op::Const | Op::Fn | Op::GVar | Op::GSet)
            && instr.a >= 0
            && (instr.a as usize) < consts.vector_len()
        {
            let _ = write!(out, "    ; {:?}", consts.vector_ref(instr.a as usize));
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytecode::{decode_at, instr_count, Instr, NO_ARG};

    /// Build the `(op a b)` instruction list the compiler would emit.
    fn instr_cells(
        rt: &mut Runtime,
        name: &str,
        a: Option<Value>,
        b: Option<Value>,
    ) -> Value {
        let op = Op::from_mnemonic(name).expect("known mnemonic");
        let empty = rt.specials.empty_list;
        let a = a.unwrap_or(empty);
        let b = b.unwrap_or(empty);

        rt.scratch.push(a);
        let tail = rt.make_pair(b, empty);
        rt.scratch.pop();
        let rest = rt.make_pair(a, tail);
        rt.scratch.push(rest);
        let opc = rt.make_character(op as u8 as char);
        rt.scratch.pop();
        rt.make_pair(opc, rest)
    }

    fn fixnum_instr(rt: &mut Runtime, name: &str, a: i64, b: Option<i64>) -> Value {
        let av = rt.make_fixnum(a);
        rt.scratch.push(av);
        let bv = b.map(|n| rt.make_fixnum(n));
        rt.scratch.pop();
        instr_cells(rt, name, Some(av), bv)
    }

    fn listing(rt: &mut Runtime, instrs: &[Value]) -> Value {
        let empty = rt.specials.empty_list;
        let base = rt.scratch.len();
        rt.scratch.extend_from_slice(instrs);
        let v = rt.make_vector(instrs.len(), empty);
        for (i, &instr) in instrs.iter().enumerate() {
            v.vector_set(i, instr);
        }
        rt.scratch.truncate(base);
        v
    }

    #[test]
    fn assembles_the_identity_procedure() {
        let mut rt = Runtime::new();
        let i0 = fixnum_instr(&mut rt, "args", 1, None);
        rt.scratch.push(i0);
        let i1 = fixnum_instr(&mut rt, "lvar", 0, Some(0));
        rt.scratch.push(i1);
        let i2 = instr_cells(&mut rt, "return", None, None);
        rt.scratch.truncate(rt.scratch.len() - 2);
        let listing = listing(&mut rt, &[i0, i1, i2]);

        let template = assemble(&mut rt, listing).unwrap();
        let f = {
            let empty = rt.specials.empty_list;
            rt.make_compiled_proc(template, empty)
        };
        let x = rt.make_fixnum(41);
        assert_eq!(rt.call(f, &[x]).unwrap(), x);

        let code = template.vector_ref(0);
        let bytes = unsafe { code.str_bytes() };
        assert_eq!(instr_count(bytes), 3);
        assert_eq!(
            decode_at(bytes, 1).unwrap(),
            Instr::new(Op::LVar, 0, 0)
        );
    }

    #[test]
    fn hoists_and_deduplicates_constants() {
        let mut rt = Runtime::new();
        let seven = rt.make_fixnum(7);
        rt.scratch.push(seven);
        let plus = rt.intern("+");
        let i0 = fixnum_instr(&mut rt, "args", 0, None);
        rt.scratch.push(i0);
        let i1 = instr_cells(&mut rt, "const", Some(seven), None);
        rt.scratch.push(i1);
        let i2 = instr_cells(&mut rt, "const", Some(seven), None);
        rt.scratch.push(i2);
        let i3 = instr_cells(&mut rt, "gvar", Some(plus), None);
        rt.scratch.push(i3);
        let i4 = fixnum_instr(&mut rt, "callj", 2, None);
        rt.scratch.truncate(rt.scratch.len() - 5);
        let listing = listing(&mut rt, &[i0, i1, i2, i3, i4]);

        let template = assemble(&mut rt, listing).unwrap();
        let consts = template.vector_ref(1);
        assert_eq!(
            consts.vector_len(),
            2,
            "7 appears once, + appears once: {consts:?}"
        );
        assert_eq!(consts.vector_ref(0), seven);
        assert_eq!(consts.vector_ref(1), plus);

        // and it runs: (+ 7 7)
        let f = {
            let empty = rt.specials.empty_list;
            rt.make_compiled_proc(template, empty)
        };
        assert_eq!(rt.call(f, &[]).unwrap().fixnum(), 14);
    }

    #[test]
    fn rejects_unknown_opcodes_and_bad_args() {
        let mut rt = Runtime::new();

        let bogus = {
            let c = rt.make_character('\u{7f}');
            rt.scratch.push(c);
            let empty = rt.specials.empty_list;
            let i = rt.make_pair(c, empty);
            rt.scratch.pop();
            i
        };
        let l = listing(&mut rt, &[bogus]);
        assert_eq!(
            assemble(&mut rt, l),
            Err(AssembleError::UnknownOpcode { index: 0 })
        );

        let wide = fixnum_instr(&mut rt, "args", 100_000, None);
        let l = listing(&mut rt, &[wide]);
        assert_eq!(
            assemble(&mut rt, l),
            Err(AssembleError::ArgOutOfRange { index: 0 })
        );

        let not_a_list = rt.make_fixnum(5);
        let l = listing(&mut rt, &[not_a_list]);
        assert_eq!(
            assemble(&mut rt, l),
            Err(AssembleError::MalformedInstruction { index: 0 })
        );

        let not_a_vector = rt.make_fixnum(5);
        assert!(matches!(
            assemble(&mut rt, not_a_vector),
            Err(AssembleError::ExpectedVector { .. })
        ));
    }

    /// The continuation thunk has the fixed six-instruction shape.
    #[test]
    fn cc_template_shape() {
        let mut rt = Runtime::new();
        let template = rt.cc_bytecode;
        let code = template.vector_ref(0);
        let bytes = unsafe { code.str_bytes() };
        let decoded: Vec<Instr> = Decoder::new(bytes).collect();
        assert_eq!(decoded, vec![
            Instr::new(Op::Args, 1, NO_ARG),
            Instr::new(Op::LVar, 1, 1),
            Instr::new(Op::LVar, 1, 0),
            Instr::new(Op::SetCC, NO_ARG, NO_ARG),
            Instr::new(Op::LVar, 0, 0),
            Instr::new(Op::Return, NO_ARG, NO_ARG),
        ]);
    }

    #[test]
    fn disassembly_names_ops_and_constants() {
        let mut rt = Runtime::new();
        let mut a = ProcAssembler::new(&mut rt);
        a.args(0);
        let sym = rt.intern("target");
        a.gvar(&mut rt, sym);
        a.ret();
        let template = a.finish(&mut rt);

        let text = disassemble(template);
        assert!(text.contains("args 0"), "{text}");
        assert!(text.contains("gvar 0"), "{text}");
        assert!(text.contains("; target"), "{text}");
        assert!(text.contains("return"), "{text}");

        let n = rt.make_fixnum(1);
        assert_eq!(disassemble(n), "<not a bytecode template>");
    }
}
