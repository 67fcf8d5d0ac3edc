use core::fmt;

use bytecode::{decode_at, instr_count, DecodeError, Op};
use object::{Tag, Value};

use crate::Runtime;

/// Errors that abort the current VM invocation.
///
/// The invoker decides whether to report and continue or to terminate;
/// nothing here unwinds the process.
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeError {
    ArityMismatch { expected: i64, got: i64, rest: bool },
    NotCallable { got: Value },
    TypeError { expected: &'static str, got: Value },
    PcOverrun { pc: usize, len: usize },
    InvalidOpcode { code: i16 },
    BadConstant { index: i16 },
    UnboundGlobal { name: String },
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::ArityMismatch {
                expected,
                got,
                rest: false,
            } => {
                write!(f, "wrong number of arguments: expected {expected}, got {got}")
            }
            RuntimeError::ArityMismatch { expected, got, .. } => {
                write!(
                    f,
                    "wrong number of arguments: expected at least {expected}, got {got}"
                )
            }
            RuntimeError::NotCallable { got } => {
                write!(f, "not callable: {got:?}")
            }
            RuntimeError::TypeError { expected, got } => {
                write!(f, "expected {expected}, got {got:?}")
            }
            RuntimeError::PcOverrun { pc, len } => {
                write!(f, "program counter {pc} past the end of code ({len} instructions)")
            }
            RuntimeError::InvalidOpcode { code } => {
                write!(f, "invalid opcode {code}")
            }
            RuntimeError::BadConstant { index } => {
                write!(f, "constant index {index} out of range")
            }
            RuntimeError::UnboundGlobal { name } => {
                write!(f, "unbound global {name}")
            }
        }
    }
}

/// Run `f` against an operand stack holding `n_args` arguments below
/// `stack_top`, until a terminal `return` leaves a single value above the
/// entry mark.
///
/// The VM's working values (the active procedure, the environment, the
/// operand stack, and one scratch slot) are registered on the root stack
/// for the whole invocation, so any allocation inside the loop sees them.
pub fn execute(
    rt: &mut Runtime,
    f: Value,
    stack: Value,
    stack_top: i64,
    n_args: i64,
) -> Result<Value, RuntimeError> {
    let mut fn_ = f;
    let mut stack = stack;
    let mut env = rt.specials.empty_list;
    let mut scratch = rt.specials.empty_list;
    unsafe {
        rt.heap.push_root(&mut fn_);
        rt.heap.push_root(&mut stack);
        rt.heap.push_root(&mut env);
        rt.heap.push_root(&mut scratch);
    }
    let result = run(
        rt,
        &mut fn_,
        &mut stack,
        &mut env,
        &mut scratch,
        stack_top,
        n_args,
    );
    rt.heap.pop_root(&mut scratch);
    rt.heap.pop_root(&mut env);
    rt.heap.pop_root(&mut stack);
    rt.heap.pop_root(&mut fn_);
    result
}

fn run(
    rt: &mut Runtime,
    fn_: &mut Value,
    stack: &mut Value,
    env: &mut Value,
    scratch: &mut Value,
    mut stack_top: i64,
    mut n_args: i64,
) -> Result<Value, RuntimeError> {
    let initial_top = stack_top - n_args;
    let mut pc: usize = 0;

    expect_compiled(*fn_)?;
    // entry frame; callj/fcallj build frames for their callees
    *env = rt.make_pair(rt.specials.empty_vector, (*fn_).proc_env());

    'procedure: loop {
        expect_compiled(*fn_)?;
        let (code, consts) = proc_template(*fn_)?;
        // Detached borrow of the code bytes: bytecode strings are never
        // mutated, and the cell stays reachable through the rooted `fn_`.
        let code: &[u8] = unsafe { code.str_bytes() };
        let count = instr_count(code);
        tracing::debug!(instrs = count, n_args, "entering procedure");

        loop {
            if pc >= count {
                return Err(RuntimeError::PcOverrun { pc, len: count });
            }
            let instr = decode_at(code, pc).map_err(|e| match e {
                DecodeError::BadOpcode { code: bad } => {
                    RuntimeError::InvalidOpcode { code: bad }
                }
                DecodeError::OutOfRange { .. } => {
                    RuntimeError::PcOverrun { pc, len: count }
                }
            })?;
            pc += 1;
            tracing::trace!(pc = pc - 1, instr = %instr, top = stack_top, "dispatch");

            match instr.op {
                Op::Args => {
                    let expected = instr.a as i64;
                    if n_args != expected {
                        return Err(RuntimeError::ArityMismatch {
                            expected,
                            got: n_args,
                            rest: false,
                        });
                    }
                    let empty = rt.specials.empty_list;
                    let frame = ensure_frame(rt, *env, expected as usize)?;
                    for slot in (0..expected as usize).rev() {
                        let v = pop(*stack, &mut stack_top, empty);
                        frame.vector_set(slot, v);
                    }
                }
                Op::ArgsDot => {
                    let required = instr.a as i64;
                    if n_args < required {
                        return Err(RuntimeError::ArityMismatch {
                            expected: required,
                            got: n_args,
                            rest: true,
                        });
                    }
                    let empty = rt.specials.empty_list;
                    let size = required as usize + 1;
                    let frame = ensure_frame(rt, *env, size)?;

                    // excess arguments, newest first, cons up in order
                    frame.vector_set(size - 1, empty);
                    for _ in 0..(n_args - required) {
                        *scratch = pop(*stack, &mut stack_top, empty);
                        let rest =
                            rt.make_pair(*scratch, frame.vector_ref(size - 1));
                        frame.vector_set(size - 1, rest);
                    }
                    for slot in (0..required as usize).rev() {
                        let v = pop(*stack, &mut stack_top, empty);
                        frame.vector_set(slot, v);
                    }
                }
                Op::Const => {
                    let v = const_ref(consts, instr.a)?;
                    push(*stack, &mut stack_top, v, rt.specials.empty_list);
                }
                Op::LVar => {
                    let frame = env_frame(*env, instr.a)?;
                    let v = frame_ref(frame, instr.b)?;
                    push(*stack, &mut stack_top, v, rt.specials.empty_list);
                }
                Op::LSet => {
                    let frame = env_frame(*env, instr.a)?;
                    check_slot(frame, instr.b)?;
                    // non-destructive: the value stays on the stack
                    let v = (*stack).vector_ref(stack_top as usize - 1);
                    frame.vector_set(instr.b as usize, v);
                }
                Op::GVar => {
                    let sym = const_ref(consts, instr.a)?;
                    if sym.tag() != Tag::Symbol {
                        return Err(RuntimeError::TypeError {
                            expected: "symbol",
                            got: sym,
                        });
                    }
                    let v = rt.lookup_global(sym).ok_or_else(|| {
                        RuntimeError::UnboundGlobal {
                            name: unsafe { sym.symbol_name() }.to_string(),
                        }
                    })?;
                    push(*stack, &mut stack_top, v, rt.specials.empty_list);
                }
                Op::GSet => {
                    let sym = const_ref(consts, instr.a)?;
                    if sym.tag() != Tag::Symbol {
                        return Err(RuntimeError::TypeError {
                            expected: "symbol",
                            got: sym,
                        });
                    }
                    // non-destructive: the value stays on the stack
                    let v = (*stack).vector_ref(stack_top as usize - 1);
                    rt.define_global(sym, v);
                }
                Op::Pop => {
                    pop(*stack, &mut stack_top, rt.specials.empty_list);
                }
                Op::Jump => {
                    pc = instr.a as usize;
                }
                Op::TJump => {
                    let v =
                        pop(*stack, &mut stack_top, rt.specials.empty_list);
                    if !rt.specials.is_falselike(v) {
                        pc = instr.a as usize;
                    }
                }
                Op::FJump => {
                    let v =
                        pop(*stack, &mut stack_top, rt.specials.empty_list);
                    if rt.specials.is_falselike(v) {
                        pc = instr.a as usize;
                    }
                }
                Op::Fn => {
                    let proto = const_ref(consts, instr.a)?;
                    let template = match proto.tag() {
                        Tag::CompiledProc | Tag::CompiledSyntaxProc => {
                            proto.proc_bytecode()
                        }
                        Tag::Vector => proto,
                        _ => {
                            return Err(RuntimeError::TypeError {
                                expected: "procedure prototype",
                                got: proto,
                            })
                        }
                    };
                    let closure = rt.make_compiled_proc(template, *env);
                    push(
                        *stack,
                        &mut stack_top,
                        closure,
                        rt.specials.empty_list,
                    );
                }
                Op::Save => {
                    *scratch = rt.make_pair(*fn_, *env);
                    let label = rt.make_fixnum(instr.a as i64);
                    let record = rt.make_pair(label, *scratch);
                    push(*stack, &mut stack_top, record, rt.specials.empty_list);
                }
                Op::Return => {
                    match unwind_return(
                        rt,
                        fn_,
                        env,
                        *stack,
                        &mut stack_top,
                        &mut pc,
                        initial_top,
                    )? {
                        Some(value) => return Ok(value),
                        None => continue 'procedure,
                    }
                }
                Op::CallJ | Op::FCallJ => {
                    let empty = rt.specials.empty_list;
                    let mut target = pop(*stack, &mut stack_top, empty);
                    if target.tag() == Tag::MetaProc {
                        target = target.meta_inner();
                    }
                    *scratch = target;

                    let mut argc = instr.a as i64;
                    if instr.op == Op::CallJ && argc == -1 {
                        // apply: expand the argument list under the target;
                        // apply always compiles to callj
                        let mut list = pop(*stack, &mut stack_top, empty);
                        argc = 0;
                        while list.is_pair() {
                            push(*stack, &mut stack_top, list.car(), empty);
                            list = list.cdr();
                            argc += 1;
                        }
                    }

                    match target.tag() {
                        Tag::CompiledProc | Tag::CompiledSyntaxProc => {
                            n_args = argc;
                            pc = 0;
                            if instr.op == Op::CallJ {
                                // tail position: reuse the env spine cell,
                                // the callee's args rebuilds the frame
                                (*env).set_cdr(target.proc_env());
                            } else {
                                let frame = rt.make_vector(
                                    (argc + 1).max(0) as usize,
                                    empty,
                                );
                                *env =
                                    rt.make_pair(frame, target.proc_env());
                            }
                            *fn_ = target;
                            continue 'procedure;
                        }
                        Tag::PrimitiveProc => {
                            let index = target.primitive_index() as usize;
                            let func = rt
                                .primitives
                                .get(index)
                                .ok_or(RuntimeError::NotCallable {
                                    got: target,
                                })?
                                .func;
                            let result = func(rt, *stack, argc, stack_top)?;
                            for _ in 0..argc {
                                pop(*stack, &mut stack_top, empty);
                            }
                            push(*stack, &mut stack_top, result, empty);
                            match unwind_return(
                                rt,
                                fn_,
                                env,
                                *stack,
                                &mut stack_top,
                                &mut pc,
                                initial_top,
                            )? {
                                Some(value) => return Ok(value),
                                None => continue 'procedure,
                            }
                        }
                        _ => {
                            return Err(RuntimeError::NotCallable {
                                got: target,
                            })
                        }
                    }
                }
                Op::CC => {
                    let empty = rt.specials.empty_list;
                    // saved-state frame: (copy of the operand stack, top)
                    *scratch = rt.make_vector(2, empty);
                    let copy =
                        rt.make_vector((*stack).vector_len(), empty);
                    for i in 0..stack_top as usize {
                        copy.vector_set(i, (*stack).vector_ref(i));
                    }
                    (*scratch).vector_set(0, copy);
                    let top_mark = rt.make_fixnum(stack_top);
                    (*scratch).vector_set(1, top_mark);
                    *scratch = rt.make_pair(*scratch, empty);
                    let k = rt.make_compiled_proc(rt.cc_bytecode, *scratch);
                    push(*stack, &mut stack_top, k, empty);
                }
                Op::SetCC => {
                    let empty = rt.specials.empty_list;
                    let new_stack = pop(*stack, &mut stack_top, empty);
                    let new_top = pop(*stack, &mut stack_top, empty);
                    if new_stack.tag() != Tag::Vector {
                        return Err(RuntimeError::TypeError {
                            expected: "saved operand stack",
                            got: new_stack,
                        });
                    }
                    if new_top.tag() != Tag::Fixnum {
                        return Err(RuntimeError::TypeError {
                            expected: "saved stack top",
                            got: new_top,
                        });
                    }
                    *stack = new_stack;
                    stack_top = new_top.fixnum();
                }
            }
        }
    }
}

// ── operand stack ──────────────────────────────────────────────────

const STACK_GROWTH: f64 = 1.8;

/// Push, growing the backing buffer geometrically. Fresh slots are filled
/// with the empty list so tracing never reads stale values.
fn push(stack: Value, top: &mut i64, value: Value, empty: Value) {
    let len = stack.vector_len();
    if *top as usize == len {
        let grown = ((len as f64 * STACK_GROWTH) as usize).max(len + 1);
        stack.vector_resize(grown, empty);
    }
    stack.vector_set(*top as usize, value);
    *top += 1;
}

/// Pop, resetting the vacated slot to the empty list.
fn pop(stack: Value, top: &mut i64, empty: Value) -> Value {
    *top -= 1;
    let value = stack.vector_ref(*top as usize);
    stack.vector_set(*top as usize, empty);
    value
}

// ── helpers ────────────────────────────────────────────────────────

fn expect_compiled(v: Value) -> Result<(), RuntimeError> {
    if v.is_compiled() {
        Ok(())
    } else {
        Err(RuntimeError::NotCallable { got: v })
    }
}

/// Pull the `[code bytes, constant vector]` template out of a procedure.
fn proc_template(f: Value) -> Result<(Value, Value), RuntimeError> {
    let template = f.proc_bytecode();
    if template.tag() != Tag::Vector || template.vector_len() != 2 {
        return Err(RuntimeError::TypeError {
            expected: "bytecode template",
            got: template,
        });
    }
    let code = template.vector_ref(0);
    let consts = template.vector_ref(1);
    if code.tag() != Tag::Str || consts.tag() != Tag::Vector {
        return Err(RuntimeError::TypeError {
            expected: "bytecode template",
            got: template,
        });
    }
    Ok((code, consts))
}

fn const_ref(consts: Value, index: i16) -> Result<Value, RuntimeError> {
    if index < 0 || index as usize >= consts.vector_len() {
        return Err(RuntimeError::BadConstant { index });
    }
    Ok(consts.vector_ref(index as usize))
}

/// Walk the environment list `depth` links and return that frame.
fn env_frame(env: Value, depth: i16) -> Result<Value, RuntimeError> {
    let mut cursor = env;
    for _ in 0..depth {
        if !cursor.is_pair() {
            return Err(RuntimeError::TypeError {
                expected: "environment frame",
                got: cursor,
            });
        }
        cursor = cursor.cdr();
    }
    if !cursor.is_pair() {
        return Err(RuntimeError::TypeError {
            expected: "environment frame",
            got: cursor,
        });
    }
    Ok(cursor.car())
}

fn check_slot(frame: Value, index: i16) -> Result<(), RuntimeError> {
    if frame.tag() != Tag::Vector
        || index < 0
        || index as usize >= frame.vector_len()
    {
        return Err(RuntimeError::TypeError {
            expected: "frame slot",
            got: frame,
        });
    }
    Ok(())
}

fn frame_ref(frame: Value, index: i16) -> Result<Value, RuntimeError> {
    check_slot(frame, index)?;
    Ok(frame.vector_ref(index as usize))
}

/// Make sure the environment's head frame has at least `want` slots,
/// replacing it with a fresh vector when it is too small. The head cons is
/// mutated in place, so closures over this environment observe the new
/// frame.
fn ensure_frame(
    rt: &mut Runtime,
    env: Value,
    want: usize,
) -> Result<Value, RuntimeError> {
    if !env.is_pair() {
        return Err(RuntimeError::TypeError {
            expected: "environment frame",
            got: env,
        });
    }
    let frame = env.car();
    if frame.tag() != Tag::Vector {
        return Err(RuntimeError::TypeError {
            expected: "frame vector",
            got: frame,
        });
    }
    if want > frame.vector_len() {
        let fresh = rt.make_vector(want, rt.specials.empty_list);
        env.set_car(fresh);
        Ok(fresh)
    } else {
        Ok(frame)
    }
}

/// The shared return sequence of `return` and the primitive call paths.
///
/// One value above the entry mark means the invocation is done; otherwise
/// pop (result, return record), restore `(pc, fn, env)` from the record,
/// and resume with the result pushed.
fn unwind_return(
    rt: &mut Runtime,
    fn_: &mut Value,
    env: &mut Value,
    stack: Value,
    stack_top: &mut i64,
    pc: &mut usize,
    initial_top: i64,
) -> Result<Option<Value>, RuntimeError> {
    let empty = rt.specials.empty_list;
    if *stack_top == initial_top + 1 {
        return Ok(Some(pop(stack, stack_top, empty)));
    }

    let value = pop(stack, stack_top, empty);
    let record = pop(stack, stack_top, empty);
    if !record.is_pair()
        || !record.cdr().is_pair()
        || record.car().tag() != Tag::Fixnum
    {
        return Err(RuntimeError::TypeError {
            expected: "return record",
            got: record,
        });
    }
    *pc = record.car().fixnum() as usize;
    let rest = record.cdr();
    *fn_ = rest.car();
    *env = rest.cdr();
    push(stack, stack_top, value, empty);
    Ok(None)
}
