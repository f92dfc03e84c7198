//! Codec benchmarks for presence-protocol.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use presence_protocol::{codec, Frame, StatusEntry};

fn snapshot_result(n: usize) -> Frame {
    Frame::SnapshotResult {
        id: 1,
        statuses: (0..n)
            .map(|i| StatusEntry {
                account_id: format!("account-{i}"),
                can_show_status: i % 3 != 0,
                is_online: (i % 3 != 0).then_some(i % 2 == 0),
                last_online_at: (i % 3 != 0).then_some(1_700_000_000 + i as u64),
            })
            .collect(),
    }
}

fn bench_encode_ping(c: &mut Criterion) {
    let frame = Frame::ping();

    c.bench_function("encode_ping", |b| b.iter(|| codec::encode(black_box(&frame))));
}

fn bench_snapshot_result(c: &mut Criterion) {
    let frame = snapshot_result(200);
    let encoded = codec::encode(&frame).unwrap();

    let mut group = c.benchmark_group("snapshot_result_200");
    group.throughput(Throughput::Bytes(encoded.len() as u64));
    group.bench_function("encode", |b| b.iter(|| codec::encode(black_box(&frame))));
    group.bench_function("decode", |b| b.iter(|| codec::decode(black_box(&encoded))));
    group.finish();
}

fn bench_snapshot_query(c: &mut Criterion) {
    let frame = Frame::snapshot(1, (0..200).map(|i| format!("account-{i}")));

    c.bench_function("roundtrip_snapshot_query_200", |b| {
        b.iter(|| {
            let encoded = codec::encode(black_box(&frame)).unwrap();
            codec::decode(black_box(&encoded)).unwrap()
        })
    });
}

criterion_group!(
    benches,
    bench_encode_ping,
    bench_snapshot_result,
    bench_snapshot_query
);
criterion_main!(benches);
