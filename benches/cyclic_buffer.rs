use criterion::{criterion_group, criterion_main, Criterion, Throughput};

use reverb::buffer::CyclicBuffer;

/// Fill the ring with 512-byte chunks, then drain it, one full cycle per
/// iteration.
fn bench_fill_drain(c: &mut Criterion) {
    let mut group = c.benchmark_group("cyclic_buffer");
    group.throughput(Throughput::Bytes(4096 * 2));
    group.bench_function("fill_drain_4k", |b| {
        let mut buffer = CyclicBuffer::new(4096).unwrap();
        b.iter(|| {
            while buffer.free() > 0 {
                let (first, _) = buffer.prepared();
                let n = first.len().min(512);
                first[..n].fill(0xA5);
                buffer.commit(n);
            }
            while buffer.filled() > 0 {
                let (first, _) = buffer.data();
                let n = first.len().min(512);
                std::hint::black_box(&first[..n]);
                buffer.consume(n);
            }
        });
    });
    group.finish();
}

/// Staggered commit/consume that keeps the cursors wrapping, the shape the
/// echo loop produces under a slow reader.
fn bench_wrapping_echo(c: &mut Criterion) {
    let mut group = c.benchmark_group("cyclic_buffer");
    group.throughput(Throughput::Bytes(48 * 1024));
    group.bench_function("wrapping_echo_1k", |b| {
        let mut buffer = CyclicBuffer::new(1024).unwrap();
        b.iter(|| {
            for _ in 0..1024 {
                if buffer.free() >= 48 {
                    let (first, _) = buffer.prepared();
                    let n = first.len().min(48);
                    first[..n].fill(0x5A);
                    buffer.commit(n);
                } else {
                    let (first, second) = buffer.data();
                    let n = (first.len() + second.len()).min(32);
                    std::hint::black_box((first, second));
                    buffer.consume(n);
                }
            }
            buffer.reset();
        });
    });
    group.finish();
}

criterion_group!(benches, bench_fill_drain, bench_wrapping_echo);
criterion_main!(benches);
