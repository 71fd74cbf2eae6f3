use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use jvm_probe_weaver::classfile::ClassFile;
use jvm_probe_weaver::config::InstrumentConfig;
use jvm_probe_weaver::pass::ClassInstrumentor;

fn utf8(bytes: &mut Vec<u8>, s: &str) {
    bytes.push(1);
    bytes.extend_from_slice(&(s.len() as u16).to_be_bytes());
    bytes.extend_from_slice(s.as_bytes());
}

fn method(bytes: &mut Vec<u8>, name_index: u16, code: &[u8]) {
    // public static, Code attribute only
    bytes.extend_from_slice(&0x0009_u16.to_be_bytes());
    bytes.extend_from_slice(&name_index.to_be_bytes());
    bytes.extend_from_slice(&7_u16.to_be_bytes());
    bytes.extend_from_slice(&1_u16.to_be_bytes());

    bytes.extend_from_slice(&5_u16.to_be_bytes());
    bytes.extend_from_slice(&(12 + code.len() as u32).to_be_bytes());
    bytes.extend_from_slice(&2_u16.to_be_bytes());
    bytes.extend_from_slice(&2_u16.to_be_bytes());
    bytes.extend_from_slice(&(code.len() as u32).to_be_bytes());
    bytes.extend_from_slice(code);
    bytes.extend_from_slice(&0_u16.to_be_bytes());
    bytes.extend_from_slice(&0_u16.to_be_bytes());
}

/// `static int sum(int)` with a loop, plus `static int branches(int)` made of
/// `segments` early returns.
fn build_class(segments: usize) -> Vec<u8> {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&0xCAFEBABE_u32.to_be_bytes());
    bytes.extend_from_slice(&0_u16.to_be_bytes());
    bytes.extend_from_slice(&50_u16.to_be_bytes());

    // constant pool count = 9
    bytes.extend_from_slice(&9_u16.to_be_bytes());
    utf8(&mut bytes, "Bench");
    bytes.push(7);
    bytes.extend_from_slice(&1_u16.to_be_bytes());
    utf8(&mut bytes, "java/lang/Object");
    bytes.push(7);
    bytes.extend_from_slice(&3_u16.to_be_bytes());
    utf8(&mut bytes, "Code");
    utf8(&mut bytes, "sum");
    utf8(&mut bytes, "(I)I");
    utf8(&mut bytes, "branches");

    // access_flags, this_class, super_class, interfaces, fields
    bytes.extend_from_slice(&0x0021_u16.to_be_bytes());
    bytes.extend_from_slice(&2_u16.to_be_bytes());
    bytes.extend_from_slice(&4_u16.to_be_bytes());
    bytes.extend_from_slice(&0_u16.to_be_bytes());
    bytes.extend_from_slice(&0_u16.to_be_bytes());

    bytes.extend_from_slice(&2_u16.to_be_bytes());
    let sum = [
        0x03, 0x3c, 0x1a, 0x9e, 0x00, 0x0d, 0x1b, 0x1a, 0x60, 0x3c, 0x84, 0x00, 0xff, 0xa7, 0xff, 0xf5, 0x1b, 0xac,
    ];
    method(&mut bytes, 6, &sum);

    let mut branches = Vec::with_capacity(segments * 6 + 2);
    for _ in 0..segments {
        // iload_0; ifeq +5; iload_0; ireturn
        branches.extend_from_slice(&[0x1a, 0x99, 0x00, 0x05, 0x1a, 0xac]);
    }
    branches.extend_from_slice(&[0x03, 0xac]);
    method(&mut bytes, 8, &branches);

    // class attributes
    bytes.extend_from_slice(&0_u16.to_be_bytes());
    bytes
}

fn bench_instrument(c: &mut Criterion) {
    let instrumentor = ClassInstrumentor::new(InstrumentConfig::default());

    let mut group = c.benchmark_group("instrument_class");
    for segments in [10usize, 500] {
        let bytes = build_class(segments);
        group.bench_with_input(BenchmarkId::from_parameter(segments), &bytes, |b, bytes| {
            b.iter(|| instrumentor.instrument_class(black_box(bytes)).unwrap())
        });
    }
    group.finish();

    let bytes = build_class(500);
    c.bench_function("classfile_round_trip", |b| {
        b.iter(|| ClassFile::parse(black_box(&bytes)).unwrap().to_bytes().unwrap())
    });
}

criterion_group!(benches, bench_instrument);
criterion_main!(benches);
