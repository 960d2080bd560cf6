use RustedMultilarge::Examples::multilarge_examples::solve_exponential;
use RustedMultilarge::numerical::multilarge::parameters::{
    MultilargeParameters, SolverKind, TrsKind,
};
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use std::hint::black_box;
use strum::IntoEnumIterator;

fn bench_subproblems(c: &mut Criterion) {
    let mut group = c.benchmark_group("exponential fit, n = 10000");
    for trs in TrsKind::iter() {
        group.bench_with_input(BenchmarkId::from_parameter(trs), &trs, |b, &trs| {
            b.iter(|| {
                let params = MultilargeParameters::default().with_trs(trs);
                solve_exponential(black_box(10_000), params)
            })
        });
    }
    group.finish();
}

fn bench_linear_solvers(c: &mut Criterion) {
    let mut group = c.benchmark_group("lm linear solvers, n = 10000");
    for solver in [SolverKind::Cholesky, SolverKind::Qr, SolverKind::Svd] {
        group.bench_with_input(BenchmarkId::from_parameter(solver), &solver, |b, &solver| {
            b.iter(|| {
                let params = MultilargeParameters::default().with_solver(solver);
                solve_exponential(black_box(10_000), params)
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_subproblems, bench_linear_solvers);
criterion_main!(benches);
