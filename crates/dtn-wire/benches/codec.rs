use bytes::{Bytes, BytesMut};
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use dtn_wire::bundle::{Bundle, BundleInfo};
use dtn_wire::eid::EidRegistry;
use dtn_wire::message::Message;
use dtn_wire::sdnv;
use dtn_wire::tlv::RawTlv;

/// SDNV encode/decode across one- to five-byte values.
fn bench_sdnv(c: &mut Criterion) {
    let values: Vec<u64> = vec![5, 300, 70_000, 10_000_000, u32::MAX as u64];
    let mut encoded = BytesMut::new();
    for v in &values {
        sdnv::encode(*v, &mut encoded);
    }
    let encoded = encoded.freeze();

    let mut group = c.benchmark_group("sdnv");
    group.throughput(Throughput::Elements(values.len() as u64));

    group.bench_function("encode", |b| {
        let mut buf = BytesMut::with_capacity(32);
        b.iter(|| {
            buf.clear();
            for v in &values {
                sdnv::encode(black_box(*v), &mut buf);
            }
        });
    });

    group.bench_function("decode", |b| {
        b.iter(|| {
            let mut bytes = encoded.clone();
            for _ in 0..values.len() {
                black_box(sdnv::decode_u64(&mut bytes).unwrap());
            }
        });
    });

    group.finish();
}

/// Control message with a handful of TLVs, as a routing exchange sends.
fn bench_message(c: &mut Criterion) {
    let eids = EidRegistry::new();
    let mut msg = Message::new(0x4242, 0x1717, 99).unwrap();
    for i in 0..8u8 {
        msg.push(RawTlv::new(0xA0 + i, 0, vec![i; 40]));
    }
    let encoded = msg.encode();

    let mut group = c.benchmark_group("message");
    group.throughput(Throughput::Bytes(encoded.len() as u64));

    group.bench_function("encode", |b| {
        b.iter(|| black_box(msg.encode()));
    });

    group.bench_function("decode", |b| {
        b.iter(|| black_box(Message::<RawTlv>::decode(encoded.clone(), &eids).unwrap()));
    });

    group.finish();
}

fn bench_bundle(c: &mut Criterion) {
    let eids = EidRegistry::new();
    let info = BundleInfo::new(
        &eids,
        eids.host("alpha").unwrap(),
        eids.host("beta").unwrap(),
        700_000_000,
        1,
        3600,
    );
    let bundle = Bundle::new(info, Bytes::from(vec![0xABu8; 1024]));
    let encoded = bundle.encode();

    let mut group = c.benchmark_group("bundle");
    group.throughput(Throughput::Bytes(encoded.len() as u64));

    group.bench_function("encode_1k", |b| {
        b.iter(|| black_box(bundle.encode()));
    });

    group.bench_function("decode_1k", |b| {
        b.iter(|| black_box(Bundle::decode(encoded.clone(), &eids).unwrap()));
    });

    group.finish();
}

criterion_group!(benches, bench_sdnv, bench_message, bench_bundle);
criterion_main!(benches);
