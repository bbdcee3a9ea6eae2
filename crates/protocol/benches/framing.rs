//! Benchmarks for report framing
//!
//! Measures chunking and reassembly throughput for both device families at
//! a small (single report) and a large (transaction-sized) body.

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use protocol::{ledger, trezor};
use rand::Rng;

fn random_payload(len: usize) -> Vec<u8> {
    let mut rng = rand::rng();
    (0..len).map(|_| rng.random()).collect()
}

fn benchmark_trezor(c: &mut Criterion) {
    let mut group = c.benchmark_group("trezor");

    for len in [32usize, 4096] {
        let payload = random_payload(len);
        group.throughput(Throughput::Bytes(len as u64));

        group.bench_with_input(BenchmarkId::new("encode", len), &payload, |b, payload| {
            b.iter(|| trezor::encode(black_box(0x0037), black_box(payload)))
        });

        let reports = trezor::encode(0x0037, &payload).unwrap();
        group.bench_with_input(BenchmarkId::new("decode", len), &reports, |b, reports| {
            b.iter(|| trezor::decode(black_box(reports)))
        });
    }

    group.finish();
}

fn benchmark_ledger(c: &mut Criterion) {
    let mut group = c.benchmark_group("ledger");

    for len in [32usize, 4096] {
        let command = random_payload(len);
        group.throughput(Throughput::Bytes(len as u64));

        group.bench_with_input(BenchmarkId::new("encode", len), &command, |b, command| {
            b.iter(|| ledger::encode(black_box(command)))
        });

        let reports = ledger::encode(&command).unwrap();
        group.bench_with_input(BenchmarkId::new("decode", len), &reports, |b, reports| {
            b.iter(|| ledger::decode(black_box(reports)))
        });
    }

    group.finish();
}

criterion_group!(benches, benchmark_trezor, benchmark_ledger);
criterion_main!(benches);
