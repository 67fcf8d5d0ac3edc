//! Primitive dispatch-table scaffolding and the built-in entries.
//!
//! A primitive receives the runtime, the operand-stack cell, the argument
//! count, and the stack top; its arguments sit at `stack[top - argc .. top]`
//! and are unwound by the VM afterwards. Besides the bytecode bridge
//! (`symbol->bytecode`, `bytecode->symbol`, `set-macro!`), a small
//! arithmetic and list set is installed; the full library lives upstream.

use bytecode::Op;
use object::{Tag, Value};

use crate::interpreter::RuntimeError;
use crate::{PrimitiveDesc, PrimitiveFn, Runtime};

pub fn install(rt: &mut Runtime) {
    define(rt, "symbol->bytecode", symbol_to_bytecode);
    define(rt, "bytecode->symbol", bytecode_to_symbol);
    define(rt, "set-macro!", set_macro);
    define(rt, "+", add);
    define(rt, "-", sub);
    define(rt, "*", mul);
    define(rt, "zero?", zero_p);
    define(rt, "cons", cons);
    define(rt, "car", car);
    define(rt, "cdr", cdr);
    define(rt, "null?", null_p);
    define(rt, "eq?", eq_p);
}

fn define(rt: &mut Runtime, name: &'static str, func: PrimitiveFn) {
    let index = rt.primitives.len() as u32;
    rt.primitives.push(PrimitiveDesc { name, func });
    let sym = rt.intern(name);
    let cell = {
        let (heap, mut roots) = rt.split();
        heap.make_primitive_proc(index, &mut roots)
    };
    rt.define_global(sym, cell);
}

// ── argument access ────────────────────────────────────────────────

fn arg(stack: Value, argc: i64, top: i64, i: i64) -> Value {
    stack.vector_ref((top - argc + i) as usize)
}

fn expect_argc(argc: i64, expected: i64) -> Result<(), RuntimeError> {
    if argc != expected {
        return Err(RuntimeError::ArityMismatch {
            expected,
            got: argc,
            rest: false,
        });
    }
    Ok(())
}

fn fixnum_arg(
    stack: Value,
    argc: i64,
    top: i64,
    i: i64,
) -> Result<i64, RuntimeError> {
    let v = arg(stack, argc, top, i);
    if v.tag() != Tag::Fixnum {
        return Err(RuntimeError::TypeError {
            expected: "fixnum",
            got: v,
        });
    }
    Ok(v.fixnum())
}

// ── bytecode bridge ────────────────────────────────────────────────

fn symbol_to_bytecode(
    rt: &mut Runtime,
    stack: Value,
    argc: i64,
    top: i64,
) -> Result<Value, RuntimeError> {
    expect_argc(argc, 1)?;
    let sym = arg(stack, argc, top, 0);
    if sym.tag() != Tag::Symbol {
        return Err(RuntimeError::TypeError {
            expected: "symbol",
            got: sym,
        });
    }
    match Op::from_mnemonic(unsafe { sym.symbol_name() }) {
        Some(op) => Ok(rt.make_character(op as u8 as char)),
        None => Ok(rt.specials.false_obj),
    }
}

fn bytecode_to_symbol(
    rt: &mut Runtime,
    stack: Value,
    argc: i64,
    top: i64,
) -> Result<Value, RuntimeError> {
    expect_argc(argc, 1)?;
    let code = arg(stack, argc, top, 0);
    if code.tag() != Tag::Character {
        return Err(RuntimeError::TypeError {
            expected: "character",
            got: code,
        });
    }
    let byte = u32::from(code.character());
    match u8::try_from(byte).ok().and_then(|b| Op::try_from(b).ok()) {
        Some(op) => Ok(rt.intern(op.mnemonic())),
        None => Ok(rt.specials.false_obj),
    }
}

/// Re-tag a compiled procedure as syntax.
fn set_macro(
    _rt: &mut Runtime,
    stack: Value,
    argc: i64,
    top: i64,
) -> Result<Value, RuntimeError> {
    expect_argc(argc, 1)?;
    let proc = arg(stack, argc, top, 0);
    if !proc.is_compiled() {
        return Err(RuntimeError::TypeError {
            expected: "compiled procedure",
            got: proc,
        });
    }
    proc.set_tag(Tag::CompiledSyntaxProc);
    Ok(proc)
}

// ── arithmetic ─────────────────────────────────────────────────────

fn add(
    rt: &mut Runtime,
    stack: Value,
    argc: i64,
    top: i64,
) -> Result<Value, RuntimeError> {
    let mut sum = 0i64;
    for i in 0..argc {
        sum = sum.wrapping_add(fixnum_arg(stack, argc, top, i)?);
    }
    Ok(rt.make_fixnum(sum))
}

fn sub(
    rt: &mut Runtime,
    stack: Value,
    argc: i64,
    top: i64,
) -> Result<Value, RuntimeError> {
    if argc < 1 {
        return Err(RuntimeError::ArityMismatch {
            expected: 1,
            got: argc,
            rest: true,
        });
    }
    let first = fixnum_arg(stack, argc, top, 0)?;
    if argc == 1 {
        return Ok(rt.make_fixnum(first.wrapping_neg()));
    }
    let mut acc = first;
    for i in 1..argc {
        acc = acc.wrapping_sub(fixnum_arg(stack, argc, top, i)?);
    }
    Ok(rt.make_fixnum(acc))
}

fn mul(
    rt: &mut Runtime,
    stack: Value,
    argc: i64,
    top: i64,
) -> Result<Value, RuntimeError> {
    let mut product = 1i64;
    for i in 0..argc {
        product = product.wrapping_mul(fixnum_arg(stack, argc, top, i)?);
    }
    Ok(rt.make_fixnum(product))
}

fn zero_p(
    rt: &mut Runtime,
    stack: Value,
    argc: i64,
    top: i64,
) -> Result<Value, RuntimeError> {
    expect_argc(argc, 1)?;
    let n = fixnum_arg(stack, argc, top, 0)?;
    Ok(rt.specials.boolean(n == 0))
}

// ── pairs ──────────────────────────────────────────────────────────

fn cons(
    rt: &mut Runtime,
    stack: Value,
    argc: i64,
    top: i64,
) -> Result<Value, RuntimeError> {
    expect_argc(argc, 2)?;
    let a = arg(stack, argc, top, 0);
    let b = arg(stack, argc, top, 1);
    Ok(rt.make_pair(a, b))
}

fn car(
    _rt: &mut Runtime,
    stack: Value,
    argc: i64,
    top: i64,
) -> Result<Value, RuntimeError> {
    expect_argc(argc, 1)?;
    let p = arg(stack, argc, top, 0);
    if !p.is_pair() {
        return Err(RuntimeError::TypeError {
            expected: "pair",
            got: p,
        });
    }
    Ok(p.car())
}

fn cdr(
    _rt: &mut Runtime,
    stack: Value,
    argc: i64,
    top: i64,
) -> Result<Value, RuntimeError> {
    expect_argc(argc, 1)?;
    let p = arg(stack, argc, top, 0);
    if !p.is_pair() {
        return Err(RuntimeError::TypeError {
            expected: "pair",
            got: p,
        });
    }
    Ok(p.cdr())
}

fn null_p(
    rt: &mut Runtime,
    stack: Value,
    argc: i64,
    top: i64,
) -> Result<Value, RuntimeError> {
    expect_argc(argc, 1)?;
    let v = arg(stack, argc, top, 0);
    Ok(rt.specials.boolean(v == rt.specials.empty_list))
}

fn eq_p(
    rt: &mut Runtime,
    stack: Value,
    argc: i64,
    top: i64,
) -> Result<Value, RuntimeError> {
    expect_argc(argc, 2)?;
    let a = arg(stack, argc, top, 0);
    let b = arg(stack, argc, top, 1);
    let same = a == b
        || match (a.tag(), b.tag()) {
            (Tag::Fixnum, Tag::Fixnum) => a.fixnum() == b.fixnum(),
            (Tag::Character, Tag::Character) => {
                a.character() == b.character()
            }
            _ => false,
        };
    Ok(rt.specials.boolean(same))
}
