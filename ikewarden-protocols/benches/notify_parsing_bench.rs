#[macro_use]
extern crate criterion;

use bytes::Bytes;
use criterion::{black_box, Criterion};

use ikewarden_protocols::{Cookies, DpdKind, DpdNotify};

fn benchmark_notify_parsing(c: &mut Criterion) {
    let cookies = Cookies::new([0x5a; 8], [0xa5; 8]);
    let datagram: Bytes = DpdNotify::new(DpdKind::RUThere, cookies, 0x1234_5678).to_datagram([0; 4]);

    c.bench_function("dpd_notify_parsing", |b| {
        b.iter(|| {
            black_box(DpdNotify::from_datagram(&datagram)).unwrap();
        })
    });
}

fn benchmark_notify_encoding(c: &mut Criterion) {
    let notify = DpdNotify::new(DpdKind::RUThereAck, Cookies::new([1; 8], [2; 8]), 7);

    c.bench_function("dpd_notify_encoding", |b| {
        b.iter(|| {
            black_box(notify.to_datagram([0, 0, 0, 1]));
        })
    });
}

criterion_group!(benches, benchmark_notify_parsing, benchmark_notify_encoding);
criterion_main!(benches);
