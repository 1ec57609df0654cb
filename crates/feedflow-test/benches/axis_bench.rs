//! Benchmarks for message diffing and axis sets

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use feedflow_core::{AxisSet, AxisValue, Message, MessageAxis, MessageEntry};

fn bench_entry_diff(c: &mut Criterion) {
    let previous = MessageEntry::of(1u64);
    let next = previous.edit().data(Some(2)).transient(true).build();

    c.bench_function("entry_diff_builtin", |b| {
        b.iter(|| black_box(black_box(&previous).diff(black_box(&next))))
    });
}

fn bench_entry_diff_custom_axes(c: &mut Criterion) {
    let axes: Vec<MessageAxis> = (0..8)
        .map(|i| MessageAxis::register(&format!("bench-axis-{}", i)))
        .collect();

    let mut builder = MessageEntry::of(1u64).edit();
    for axis in &axes {
        builder = builder.axis(*axis, Some(AxisValue::new(axis.index())));
    }
    let previous = builder.build();
    let next = previous
        .edit()
        .axis(axes[3], Some(AxisValue::new(99u32)))
        .build();

    c.bench_function("entry_diff_custom_axes", |b| {
        b.iter(|| black_box(black_box(&previous).diff(black_box(&next))))
    });
}

fn bench_message_next(c: &mut Criterion) {
    let message = Message::initial().next(MessageEntry::of(String::from("value")));

    c.bench_function("message_update", |b| {
        b.iter(|| black_box(message.update(|builder| builder.transient(true))))
    });
}

fn bench_axis_set_intersection(c: &mut Criterion) {
    let changes = AxisSet::from([MessageAxis::DATA, MessageAxis::PROGRESS]);
    let touched = AxisSet::from([MessageAxis::ERROR, MessageAxis::PROGRESS]);

    c.bench_function("axis_set_first_common", |b| {
        b.iter(|| black_box(black_box(&changes).first_common(black_box(&touched))))
    });
}

criterion_group!(
    benches,
    bench_entry_diff,
    bench_entry_diff_custom_axes,
    bench_message_next,
    bench_axis_set_intersection,
);
criterion_main!(benches);
