//! Dispatch and framing benchmarks

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use lni_native_bridge::module::{BUFFER_TO_STRING, STRING_TO_BUFFER, STRING_TO_BYTE_LENGTH};
use lni_native_bridge::{
    register_module, ArgKind, BridgeConfig, FrameReader, FrameWriter, HostRuntime, HostValue,
    MethodRegistration, NativeLibrary, QueuedCallInvoker, Ret, ReturnKind, Scalar, ScalarKind,
    TypeTag,
};
use std::sync::Arc;

struct EchoLibrary;

impl NativeLibrary for EchoLibrary {
    fn name(&self) -> &str {
        "echo"
    }

    fn contract_version(&self) -> u32 {
        lni_native_bridge::CONTRACT_VERSION
    }

    fn checksum(&self, _method: &str) -> Option<u16> {
        None
    }

    fn object_types(&self) -> Vec<TypeTag> {
        Vec::new()
    }

    fn methods(&self) -> Vec<MethodRegistration> {
        vec![MethodRegistration::new("echo_add", |_, args| {
            Ok(Ret::Scalar(Scalar::U32(args.u32(0)? + args.u32(1)?)))
        })
        .arg(ArgKind::Scalar(ScalarKind::U32))
        .arg(ArgKind::Scalar(ScalarKind::U32))
        .returns(ReturnKind::Scalar(ScalarKind::U32))]
    }
}

fn bench_dispatch(c: &mut Criterion) {
    let host = HostRuntime::new();
    let (invoker, _host_loop) = QueuedCallInvoker::new();
    let module = register_module(
        &host,
        Arc::new(invoker),
        &EchoLibrary,
        BridgeConfig::default()
            .with_worker_threads(1)
            .with_checksum_verification(false),
    )
    .unwrap();

    let mut group = c.benchmark_group("dispatch");

    group.bench_function("scalar_add", |b| {
        b.iter(|| {
            black_box(
                module
                    .call(
                        "echo_add",
                        vec![HostValue::Number(20.0), HostValue::Number(22.0)],
                    )
                    .unwrap(),
            )
        });
    });

    group.bench_function("unknown_method", |b| {
        b.iter(|| black_box(module.call("echo_missing", vec![]).is_err()));
    });

    for len in [16usize, 1024, 64 * 1024] {
        let text = "x".repeat(len);
        group.bench_with_input(BenchmarkId::new("string_round_trip", len), &text, |b, text| {
            b.iter(|| {
                let length = module
                    .call(STRING_TO_BYTE_LENGTH, vec![HostValue::from(text.as_str())])
                    .unwrap();
                let bytes = module
                    .call(STRING_TO_BUFFER, vec![HostValue::from(text.as_str())])
                    .unwrap();
                black_box((length, module.call(BUFFER_TO_STRING, vec![bytes]).unwrap()))
            });
        });
    }

    group.finish();
}

fn bench_framing(c: &mut Criterion) {
    let mut group = c.benchmark_group("framing");
    let records: Vec<String> = (0..64).map(|i| format!("invoice-{}", i)).collect();

    group.bench_function("write_sequence", |b| {
        b.iter(|| {
            let mut writer = FrameWriter::new();
            writer
                .write_sequence(&records, |w, s| w.write_string(s).map(|_| ()))
                .unwrap();
            black_box(writer.finish())
        });
    });

    let mut writer = FrameWriter::new();
    writer
        .write_sequence(&records, |w, s| w.write_string(s).map(|_| ()))
        .unwrap();
    let frame = writer.finish();

    group.bench_function("read_sequence", |b| {
        b.iter(|| {
            let mut reader = FrameReader::new(frame.as_slice());
            let decoded = reader.read_sequence(|r| r.read_string()).unwrap();
            reader.finish().unwrap();
            black_box(decoded)
        });
    });

    group.finish();
}

criterion_group!(benches, bench_dispatch, bench_framing);
criterion_main!(benches);
