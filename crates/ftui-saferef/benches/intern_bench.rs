//! Benchmarks for reference construction and resolution.
//!
//! Performance budgets:
//! - Interning hit (existing wrapper): < 200ns
//! - Resolve live method reference: < 50ns
//!
//! Run with: cargo bench -p ftui-saferef --bench intern_bench

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use ftui_saferef::{
    BoundMethod, Callback, MethodFn, MethodRegistry, Reference, RegistryConfig, Tracked,
    make_reference_in,
};
use std::hint::black_box;

struct Receiver {
    base: u64,
}

type Handler = MethodFn<Receiver, u64, u64>;
type Handle = Reference<Receiver, Handler>;

fn pairing() -> (Tracked<Receiver>, Tracked<Handler>) {
    (
        Tracked::labeled("receiver", Receiver { base: 1 }),
        Tracked::method("handle", |r: &Receiver, n: &u64| r.base + n),
    )
}

// =============================================================================
// Interning
// =============================================================================

fn bench_intern(c: &mut Criterion) {
    let mut group = c.benchmark_group("saferef/intern");
    let registry = MethodRegistry::new(RegistryConfig::default());
    let (receiver, handler) = pairing();

    // Existing wrapper, no callback appended.
    let bound = BoundMethod::bind(receiver.clone(), handler.clone());
    let _keep = make_reference_in(&registry, &bound, None).unwrap();
    group.bench_function("hit", |b| {
        b.iter(|| black_box(make_reference_in(&registry, black_box(&bound), None).unwrap()))
    });

    // Fresh wrapper built and torn down each iteration.
    let lonely = BoundMethod::bind(receiver.clone(), handler.clone());
    let cold = MethodRegistry::new(RegistryConfig::default());
    group.bench_function("miss", |b| {
        b.iter(|| {
            let h: Handle = make_reference_in(&cold, black_box(&lonely), None).unwrap();
            black_box(h)
        })
    });

    group.finish();
}

// =============================================================================
// Populated registry
// =============================================================================

fn bench_populated(c: &mut Criterion) {
    let mut group = c.benchmark_group("saferef/populated");

    for size in [16usize, 256, 4096] {
        let registry = MethodRegistry::new(RegistryConfig::default().with_initial_capacity(size));
        let handler: Tracked<Handler> = Tracked::method("handle", |r: &Receiver, n: &u64| r.base * n);
        let receivers: Vec<_> = (0..size as u64)
            .map(|base| Tracked::new(Receiver { base }))
            .collect();
        let handles: Vec<Handle> = receivers
            .iter()
            .map(|r| {
                make_reference_in(&registry, &BoundMethod::bind(r.clone(), handler.clone()), None)
                    .unwrap()
            })
            .collect();
        let probe = BoundMethod::bind(receivers[size / 2].clone(), handler.clone());

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::new("hit", size), &probe, |b, probe| {
            b.iter(|| black_box(make_reference_in(&registry, probe, None).unwrap()))
        });
        drop(handles);
    }

    group.finish();
}

// =============================================================================
// Resolution and release
// =============================================================================

fn bench_resolve(c: &mut Criterion) {
    let mut group = c.benchmark_group("saferef/resolve");
    let registry = MethodRegistry::new(RegistryConfig::default());
    let (receiver, handler) = pairing();
    let method: Handle = make_reference_in(
        &registry,
        &BoundMethod::bind(receiver.clone(), handler.clone()),
        None,
    )
    .unwrap();
    let object: Handle = make_reference_in(&registry, &receiver, None).unwrap();

    group.bench_function("method_live", |b| b.iter(|| black_box(method.resolve())));
    group.bench_function("object_live", |b| b.iter(|| black_box(object.resolve())));

    group.bench_function("method_call", |b| {
        b.iter(|| {
            method
                .resolve()
                .and_then(|t| t.into_method())
                .map(|m| m.call(black_box(&3)))
        })
    });

    group.finish();
}

fn bench_release(c: &mut Criterion) {
    let mut group = c.benchmark_group("saferef/release");
    let registry = MethodRegistry::new(RegistryConfig::default());

    for callbacks in [1usize, 8, 64] {
        group.bench_with_input(
            BenchmarkId::new("fire", callbacks),
            &callbacks,
            |b, &callbacks| {
                b.iter(|| {
                    let (receiver, handler) = pairing();
                    let bound = BoundMethod::bind(receiver, handler.clone());
                    let handles: Vec<Handle> = (0..callbacks)
                        .map(|_| {
                            make_reference_in(
                                &registry,
                                &bound,
                                Some(Callback::new(|h: &Handle| {
                                    black_box(h);
                                })),
                            )
                            .unwrap()
                        })
                        .collect();
                    drop(bound);
                    black_box(handles)
                })
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_intern,
    bench_populated,
    bench_resolve,
    bench_release
);
criterion_main!(benches);
