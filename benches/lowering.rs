//! Benchmarks for method lowering.
//!
//! Measures the per-method cost of the importer on a long straight-line body with one join, and
//! the cost of a whole session run over the same method, including C++ unit assembly.

extern crate cilaot;

use std::{hint::black_box, sync::Arc};

use cilaot::prelude::*;
use criterion::{criterion_group, criterion_main, Criterion};

/// `int32 Sum(int32 a, int32 b)`: a conditional `nop`, then `a = a + b` repeated `count` times.
fn sum_session(count: usize) -> (CompilationSession, MethodId) {
    let mut builder = StoreBuilder::new().with_core_library();
    let object = builder.core_type("Object");
    let program = builder.add_type("Bench", "Program", TypeAttributes::empty(), object);
    let sum = builder.add_method(
        program,
        "Sum",
        MethodAttributes::STATIC,
        MethodSig::new_static(TypeSig::I4, vec![TypeSig::I4, TypeSig::I4]),
    );

    // ldarg.1; brfalse.s +1; nop
    let mut body = vec![0x03, 0x2C, 0x01, 0x00];
    for _ in 0..count {
        // ldarg.0; ldarg.1; add; starg.s 0
        body.extend_from_slice(&[0x02, 0x03, 0x58, 0x10, 0x00]);
    }
    // ldarg.0; ret
    body.extend_from_slice(&[0x02, 0x2A]);
    builder.set_body(sum, &body);

    let session = CompilationSession::new(
        Arc::new(builder.build()),
        CompilerConfig::default().with_parallel(false),
    );
    let method = session
        .context()
        .resolve_method_token(sum, &GenericContext::empty())
        .unwrap();
    (session, method)
}

/// Benchmark importing a 1000-statement body into C++.
fn bench_lower_method(c: &mut Criterion) {
    let (session, method) = sum_session(1000);
    let il = session
        .provider()
        .method_il(session.context(), method)
        .unwrap()
        .unwrap();

    c.bench_function("lower_method_1000_adds", |b| {
        b.iter(|| {
            let lowered = lower_method(session.context(), black_box(method), &il).unwrap();
            black_box(lowered)
        });
    });
}

/// Benchmark a full session run over one method.
fn bench_compile_session(c: &mut Criterion) {
    let (session, method) = sum_session(100);

    c.bench_function("compile_session_100_adds", |b| {
        b.iter(|| {
            let output = session.compile(&[Node::method(black_box(method))]).unwrap();
            black_box(output.methods_compiled)
        });
    });
}

criterion_group!(benches, bench_lower_method, bench_compile_session);
criterion_main!(benches);
