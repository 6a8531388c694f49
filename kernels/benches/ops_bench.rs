use criterion::{Criterion, criterion_group, criterion_main};
use shardex_kernels::{
    ArgView, BinaryOp, CsrView, Instr, Program, ReduceOp, UnaryOp, tree_reduce,
};
use std::hint::black_box;

fn benchmark_program(c: &mut Criterion) {
    let mut group = c.benchmark_group("program");
    let sizes = [1 << 12, 1 << 16, 1 << 20];

    // sqrt(2 * x) + y
    let program = Program::new(
        vec![
            Instr::Scalar(0),
            Instr::Vector(1),
            Instr::Binary(BinaryOp::Mul),
            Instr::Unary(UnaryOp::Sqrt),
            Instr::Vector(2),
            Instr::Binary(BinaryOp::Add),
        ],
        None,
    )
    .unwrap();

    for &n in &sizes {
        let x = vec![1.0f64; n];
        let y = vec![2.0f64; n];
        let args = [
            ArgView::Scalar(2.0),
            ArgView::Vector(&x[..]),
            ArgView::Vector(&y[..]),
        ];
        group.bench_function(format!("eval_{}", n), |b| {
            b.iter(|| program.eval(black_box(n), black_box(&args)).unwrap())
        });
    }
    group.finish();
}

fn benchmark_reduce(c: &mut Criterion) {
    let mut group = c.benchmark_group("tree_reduce");
    for &n in &[1 << 12, (1 << 16) + 1, 1 << 20] {
        let data = vec![1.0f64; n];
        group.bench_function(format!("sum_{}", n), |b| {
            b.iter(|| tree_reduce(black_box(data.clone()), ReduceOp::Sum))
        });
    }
    group.finish();
}

fn benchmark_spmv(c: &mut Criterion) {
    let mut group = c.benchmark_group("spmv");
    for &n in &[1 << 12, 1 << 16] {
        // 1D Poisson stencil
        let mut row_ptr = vec![0usize];
        let mut col = Vec::new();
        let mut val = Vec::new();
        for i in 0..n {
            if i > 0 {
                col.push(i - 1);
                val.push(-1.0f64);
            }
            col.push(i);
            val.push(2.0);
            if i + 1 < n {
                col.push(i + 1);
                val.push(-1.0);
            }
            row_ptr.push(col.len());
        }
        let empty_row = vec![0usize; n + 1];
        let local = CsrView::new(&row_ptr, &col, &val, n).unwrap();
        let remote = CsrView::new(&empty_row, &[], &[], 0).unwrap();
        let x = vec![1.0f64; n];
        let program = Program::new(vec![Instr::SpMv(0)], None).unwrap();
        let args = [ArgView::SpMv {
            local,
            remote,
            x: &x[..],
            imports: &[],
        }];

        group.bench_function(format!("poisson_{}", n), |b| {
            b.iter(|| program.eval(black_box(n), black_box(&args)).unwrap())
        });
    }
    group.finish();
}

criterion_group!(benches, benchmark_program, benchmark_reduce, benchmark_spmv);
criterion_main!(benches);
