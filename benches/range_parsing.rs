//! Benchmarks for Range header parsing and HDHomeRun control packet encoding.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tunerflow::streaming::RangeSpec;
use tunerflow::tuners::control::{crc32, decode_packet, encode_getset};

fn bench_range_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("range_parse");

    for header in ["bytes=0-", "bytes=500000-999999", "bytes=-4096", "bytes=0-10,20-30"] {
        group.bench_function(header, |b| {
            b.iter(|| black_box(RangeSpec::parse(black_box(header), Some(1_000_000))).is_ok())
        });
    }

    group.finish();
}

fn bench_control_packets(c: &mut Criterion) {
    let mut group = c.benchmark_group("control_packet");

    group.bench_function("encode_getset", |b| {
        b.iter(|| encode_getset(black_box("/tuner0/channel"), Some(black_box("auto:543000000")), Some(0x1234)))
    });

    let packet = encode_getset("/tuner1/target", Some("udp://192.168.1.10:5000"), Some(42));
    group.bench_function("decode", |b| b.iter(|| decode_packet(black_box(&packet)).is_ok()));

    let block = vec![0xA5u8; 64 * 1024];
    group.bench_function("crc32_64k", |b| b.iter(|| crc32(black_box(&block))));

    group.finish();
}

criterion_group!(benches, bench_range_parse, bench_control_packets);
criterion_main!(benches);
