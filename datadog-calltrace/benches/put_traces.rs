// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use criterion::*;
use datadog_calltrace::{CallFrame, CallTraceStorage};

fn synthetic_traces(count: u64, depth: u64) -> Vec<Vec<CallFrame>> {
    (0..count)
        .map(|trace| {
            (0..depth)
                .map(|frame| CallFrame {
                    ip: trace.wrapping_mul(0x9e3779b97f4a7c15) ^ frame,
                    meta: frame,
                })
                .collect()
        })
        .collect()
}

pub fn put_distinct_traces(c: &mut Criterion) {
    let traces = synthetic_traces(10_000, 16);

    c.bench_function("put 10k distinct traces", |b| {
        b.iter(|| {
            let storage = CallTraceStorage::try_new().unwrap();
            for trace in &traces {
                black_box(storage.put(trace));
            }
            storage
        })
    });
}

pub fn put_warm_traces(c: &mut Criterion) {
    let traces = synthetic_traces(10_000, 16);
    let storage = CallTraceStorage::try_new().unwrap();
    for trace in &traces {
        black_box(storage.put(trace));
    }

    // Every put is a dedup hit against the warm table.
    c.bench_function("re-put 10k warm traces", |b| {
        b.iter(|| {
            for trace in &traces {
                black_box(storage.put(trace));
            }
        })
    });
}

criterion_group!(benches, put_distinct_traces, put_warm_traces);
criterion_main!(benches);
