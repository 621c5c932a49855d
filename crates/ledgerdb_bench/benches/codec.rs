//! Value codec benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use ledgerdb_bench::random_text;
use ledgerdb_codec::{from_bytes, to_bytes, Value};

fn samples() -> Vec<(&'static str, Option<Value>)> {
    vec![
        ("absent", None),
        ("null", Some(Value::Null)),
        ("bool", Some(Value::Bool(true))),
        ("integer", Some(Value::Integer(-1_234_567_890))),
        ("text_short", Some(Value::Text("hello".into()))),
        ("bytes_256", Some(Value::Bytes(vec![0u8; 256]))),
    ]
}

/// Benchmark encoding each kind of value.
fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");

    for (name, value) in samples() {
        group.bench_function(name, |b| {
            b.iter(|| black_box(to_bytes(black_box(&value)).unwrap()));
        });
    }

    group.finish();
}

/// Benchmark decoding each kind of value.
fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");

    for (name, value) in samples() {
        let encoded = to_bytes(&value).unwrap();
        group.bench_function(name, |b| {
            b.iter(|| {
                let decoded: Option<Value> = from_bytes(black_box(&encoded)).unwrap();
                black_box(decoded);
            });
        });
    }

    group.finish();
}

/// Benchmark text values of growing size.
fn bench_text_size(c: &mut Criterion) {
    let mut group = c.benchmark_group("text_size");

    for size in [64, 1024, 16384].iter() {
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let value = random_text(size);
            b.iter(|| {
                let encoded = to_bytes(black_box(&value)).unwrap();
                let decoded: Value = from_bytes(&encoded).unwrap();
                black_box(decoded);
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode, bench_text_size);

criterion_main!(benches);
