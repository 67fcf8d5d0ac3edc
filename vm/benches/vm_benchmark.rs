use criterion::{black_box, criterion_group, criterion_main, Criterion};

use heap::HeapSettings;
use object::Value;
use vm::assemble::ProcAssembler;
use vm::Runtime;

/// Build the tail-recursive countdown procedure and bind it globally.
fn countdown_proc(rt: &mut Runtime) -> Value {
    let loop_sym = rt.intern("bench-loop");
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

    let empty = rt.specials.empty_list;
    let f = rt.make_compiled_proc(template, empty);
    rt.define_global(loop_sym, f);
    f
}

fn bench_tail_calls(c: &mut Criterion) {
    let mut rt = Runtime::new();
    let f = countdown_proc(&mut rt);

    c.bench_function("tail_call_countdown_10k", |b| {
        b.iter(|| {
            let n = rt.make_fixnum(black_box(10_000));
            let r = rt.call(f, &[n]).unwrap();
            black_box(r.fixnum())
        })
    });
}

fn bench_allocation_churn(c: &mut Criterion) {
    let mut rt = Runtime::with_settings(HeapSettings {
        initial_cells: 4096,
        extension_start: 4096,
        ..Default::default()
    });

    c.bench_function("alloc_churn_pairs", |b| {
        b.iter(|| {
            for i in 0..1000 {
                let n = rt.make_fixnum(black_box(i));
                black_box(rt.make_pair(n, n));
            }
        })
    });

    c.bench_function("collect_small_live_set", |b| {
        b.iter(|| {
            for i in 0..2000 {
                rt.make_fixnum(black_box(i));
            }
            black_box(rt.collect())
        })
    });
}

criterion_group!(benches, bench_tail_calls, bench_allocation_churn);
criterion_main!(benches);
