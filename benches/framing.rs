//! Throughput of the channel-demux framing state machine against frames of a
//! few representative sizes, fed a byte at a time and in one shot.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut wire = Vec::with_capacity(4 + payload.len());
    wire.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    wire.extend_from_slice(payload);
    wire
}

fn bench_whole_frame(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse_frame/whole");
    for size in [0usize, 64, 4096, 65536] {
        let payload = vec![0xABu8; size];
        let wire = encode_frame(&payload);
        group.bench_with_input(BenchmarkId::from_parameter(size), &wire, |b, wire| {
            b.iter(|| {
                let mut buf = wire.clone();
                assert!(vmsession::bench_support::parse_frame(black_box(&mut buf)));
            });
        });
    }
    group.finish();
}

fn bench_byte_at_a_time(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse_frame/byte_at_a_time");
    for size in [64usize, 4096] {
        let payload = vec![0xCDu8; size];
        let wire = encode_frame(&payload);
        group.bench_with_input(BenchmarkId::from_parameter(size), &wire, |b, wire| {
            b.iter(|| {
                let mut buf = Vec::new();
                for &byte in wire {
                    buf.push(byte);
                    vmsession::bench_support::parse_frame(&mut buf);
                }
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_whole_frame, bench_byte_at_a_time);
criterion_main!(benches);
