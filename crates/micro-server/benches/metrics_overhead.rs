// Cost of the per-call RPC metrics and of rendering /metrics

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use micro_server::MetricsRegistry;
use std::hint::black_box;
use std::time::Duration;

fn bench_rpc_recording(c: &mut Criterion) {
    let mut group = c.benchmark_group("rpc_recording");
    let registry = MetricsRegistry::new();
    let rpc = registry.rpc();

    group.bench_function("record_started", |b| {
        b.iter(|| rpc.record_started(black_box("helloworld.Greeter"), black_box("SayHello")));
    });

    group.bench_function("record_handled", |b| {
        b.iter(|| {
            rpc.record_handled(
                black_box("helloworld.Greeter"),
                black_box("SayHello"),
                black_box(tonic::Code::Ok),
                black_box(Duration::from_micros(250)),
            )
        });
    });

    group.finish();
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");

    for methods in [1usize, 16, 128] {
        let registry = MetricsRegistry::new();
        let rpc = registry.rpc();
        for i in 0..methods {
            let method = format!("Method{}", i);
            rpc.record_started("bench.Service", &method);
            rpc.record_handled("bench.Service", &method, tonic::Code::Ok, Duration::from_millis(1));
        }

        group.bench_with_input(BenchmarkId::from_parameter(methods), &registry, |b, registry| {
            b.iter(|| black_box(registry.encode().map(|text| text.len())));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_rpc_recording, bench_encode);
criterion_main!(benches);
