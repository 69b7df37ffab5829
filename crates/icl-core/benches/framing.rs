use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use icl_core::frame::{encode_error_response, PacketPrefix, RequestBuilder, ResponseStatus, TaskCode};
use icl_core::{validate_request, FieldLimits};

fn bench_prefix_parse(c: &mut Criterion) {
    let pkt = RequestBuilder::new(TaskCode(0x10)).raw(&[0u8; 64]).build();
    c.bench_function("prefix_parse", |b| {
        b.iter(|| {
            let p = PacketPrefix::parse(black_box(&pkt)).ok();
            black_box(p.map(|p| p.check_length(1 << 20)));
        });
    });
}

fn bench_validate(c: &mut Criterion) {
    let mut group = c.benchmark_group("validate");
    let limits = FieldLimits::default();
    for credential_len in [16usize, 1024, 16384] {
        let credential = vec![0xA5u8; credential_len];
        let pkt = RequestBuilder::new(TaskCode::CREDENTIALS)
            .string("alice")
            .bytes(&credential)
            .string("L7")
            .unicode("en_US")
            .build();
        group.bench_with_input(
            BenchmarkId::new("credentials", credential_len),
            &pkt,
            |b, pkt| {
                b.iter(|| black_box(validate_request(black_box(pkt), &limits).is_ok()));
            },
        );
    }
    let begin = RequestBuilder::new(TaskCode::BEGIN)
        .string("sales")
        .string("alice")
        .u16(1)
        .unicode("report-tool")
        .bytes(&[0; 32])
        .build();
    group.bench_function("begin", |b| {
        b.iter(|| black_box(validate_request(black_box(&begin), &limits).is_ok()));
    });
    group.finish();
}

fn bench_error_response(c: &mut Criterion) {
    let mut out = Vec::with_capacity(64);
    c.bench_function("error_response", |b| {
        b.iter(|| {
            encode_error_response(&mut out, TaskCode(0x42), black_box(7), ResponseStatus::ServerIdMismatch);
            black_box(out.len());
        });
    });
}

criterion_group!(framing_benches, bench_prefix_parse, bench_validate, bench_error_response);
criterion_main!(framing_benches);
