use std::process;

use clap::Parser;

use heap::HeapSettings;
use object::Value;
use vm::assemble::{disassemble, ProcAssembler};
use vm::{Runtime, RuntimeError};

#[derive(Parser, Debug)]
#[command(author, version, about = "Run a built-in bytecode program")]
struct Cli {
    /// Program to run: countdown, adder, callcc
    #[arg(default_value = "countdown")]
    program: String,

    /// Iterations for the countdown program
    #[arg(long, default_value_t = 100_000)]
    n: i64,

    /// Print the assembled bytecode before running
    #[arg(long)]
    disasm: bool,

    /// Initial heap size in cells
    #[arg(long, default_value_t = 1000)]
    heap_cells: usize,
}

fn main() {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let mut rt = Runtime::with_settings(HeapSettings {
        initial_cells: cli.heap_cells,
        ..Default::default()
    });

    let result = match cli.program.as_str() {
        "countdown" => run_countdown(&mut rt, cli.n, cli.disasm),
        "adder" => run_adder(&mut rt, cli.disasm),
        "callcc" => run_callcc(&mut rt, cli.disasm),
        other => {
            eprintln!("unknown program: {other} (try countdown, adder, callcc)");
            process::exit(2);
        }
    };

    match result {
        Ok(value) => println!("{value:?}"),
        Err(err) => {
            eprintln!("error: {err}");
            process::exit(1);
        }
    }
}

/// A tail-recursive countdown: `(define (loop n) (if (zero? n) 0 (loop (- n 1))))`.
fn run_countdown(
    rt: &mut Runtime,
    n: i64,
    disasm: bool,
) -> Result<Value, RuntimeError> {
    let loop_sym = rt.intern("loop");
    let zero_sym = rt.intern("zero?");
    let minus_sym = rt.intern("-");

    let mut a = ProcAssembler::new(rt);
    a.args(1);
    let after_test = a.save();
    a.lvar(0, 0);
    a.gvar(rt, zero_sym);
    a.fcallj(1);
    a.bind(after_test);
    let recurse = a.fjump();
    let zero = rt.make_fixnum(0);
    a.constant(rt, zero);
    a.ret();
    a.bind(recurse);
    let after_sub = a.save();
    a.lvar(0, 0);
    let one = rt.make_fixnum(1);
    a.constant(rt, one);
    a.gvar(rt, minus_sym);
    a.fcallj(2);
    a.bind(after_sub);
    a.gvar(rt, loop_sym);
    a.callj(1);
    let template = a.finish(rt);

    let f = make_proc(rt, template, disasm);
    rt.define_global(loop_sym, f);
    let start = rt.make_fixnum(n);
    rt.call(f, &[start])
}

/// `((lambda (x) (lambda (y) (+ x y))) 3)` applied to 4.
fn run_adder(rt: &mut Runtime, disasm: bool) -> Result<Value, RuntimeError> {
    let plus_sym = rt.intern("+");
    let outer_sym = rt.intern("make-adder");
    let adder_sym = rt.intern("adder");

    let mut inner = ProcAssembler::new(rt);
    inner.args(1);
    inner.lvar(1, 0);
    inner.lvar(0, 0);
    inner.gvar(rt, plus_sym);
    inner.callj(2);
    let inner_template = inner.finish(rt);

    let mut outer = ProcAssembler::new(rt);
    outer.intern_constant(rt, inner_template);
    outer.args(1);
    outer.fn_proto(rt, inner_template);
    outer.ret();
    let outer_template = outer.finish(rt);

    let f = make_proc(rt, outer_template, disasm);
    rt.define_global(outer_sym, f);
    let three = rt.make_fixnum(3);
    let adder = rt.call(f, &[three])?;
    rt.define_global(adder_sym, adder);
    let four = rt.make_fixnum(4);
    rt.call(adder, &[four])
}

/// `(+ 1 (call/cc (lambda (k) (+ 2 (k 10)))))`.
fn run_callcc(rt: &mut Runtime, disasm: bool) -> Result<Value, RuntimeError> {
    let plus_sym = rt.intern("+");
    let demo_sym = rt.intern("escape-demo");

    let mut inner = ProcAssembler::new(rt);
    inner.args(1);
    let two = rt.make_fixnum(2);
    inner.constant(rt, two);
    let after_k = inner.save();
    let ten = rt.make_fixnum(10);
    inner.constant(rt, ten);
    inner.lvar(0, 0);
    inner.fcallj(1);
    inner.bind(after_k);
    inner.gvar(rt, plus_sym);
    inner.callj(2);
    let inner_template = inner.finish(rt);

    let mut outer = ProcAssembler::new(rt);
    outer.intern_constant(rt, inner_template);
    outer.args(0);
    let one = rt.make_fixnum(1);
    outer.constant(rt, one);
    let resume = outer.save();
    outer.cc();
    outer.fn_proto(rt, inner_template);
    outer.fcallj(1);
    outer.bind(resume);
    outer.gvar(rt, plus_sym);
    outer.callj(2);
    let outer_template = outer.finish(rt);

    let f = make_proc(rt, outer_template, disasm);
    rt.define_global(demo_sym, f);
    rt.call(f, &[])
}

fn make_proc(rt: &mut Runtime, template: Value, disasm: bool) -> Value {
    if disasm {
        eprint!("{}", disassemble(template));
    }
    let empty = rt.specials.empty_list;
    rt.make_compiled_proc(template, empty)
}
