use criterion::{black_box, criterion_group, criterion_main, Criterion};

use tensorvan::{decode_key, encode_key, Message, Meta, Segment};

pub fn benchmark_key_codec(c: &mut Criterion) {
    c.bench_function("key-codec", |b| {
        b.iter(|| {
            let bytes = encode_key(black_box(0x0102_0304_0506_0708));
            black_box(decode_key(&bytes))
        })
    });
}

pub fn benchmark_meta_pack(c: &mut Criterion) {
    let meta = Meta {
        push: true,
        request: true,
        key: 42,
        addr: 0x7fff_0000_1000,
        val_len: 1 << 20,
        option: 0xabcd,
        body: vec![0u8; 64],
        ..Meta::default()
    };
    let mut buf = vec![0u8; meta.packed_len()];

    c.bench_function("meta-pack", |b| {
        b.iter(|| black_box(meta.pack(black_box(&mut buf))))
    });
    c.bench_function("meta-unpack", |b| b.iter(|| black_box(Meta::unpack(&buf))));
}

pub fn benchmark_segment_clone(c: &mut Criterion) {
    let mut msg = Message::default();
    msg.data.push(Segment::from_vec(vec![0u8; 4096]));
    msg.data.push(Segment::from_vec(vec![0u8; 4096]));
    msg.data.push(Segment::from_vec(vec![0u8; 4096]));

    c.bench_function("segment-clone", |b| b.iter(|| black_box(msg.data.clone())));
}

criterion_group!(
    benches,
    benchmark_key_codec,
    benchmark_meta_pack,
    benchmark_segment_clone
);
criterion_main!(benches);
