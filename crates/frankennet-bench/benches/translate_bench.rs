//! Readiness translation benchmarks.

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use frankennet_channel::{SelectableChannel, SelectorProvider};
use frankennet_core::poll::{
    OP_ACCEPT, POLLERR, POLLHUP, POLLIN, POLLNVAL, accept_interest_to_events,
    translate_accept_ready_ops,
};

const EVENTS: &[(&str, i32)] = &[
    ("pollin", POLLIN),
    ("pollerr", POLLERR),
    ("pollhup", POLLHUP),
    ("pollnval", POLLNVAL),
    ("err_hup", POLLERR | POLLHUP),
];

fn bench_pure_translation(c: &mut Criterion) {
    let mut group = c.benchmark_group("translate_accept_ready_ops");
    for &(name, events) in EVENTS {
        group.bench_with_input(BenchmarkId::new("core", name), &events, |b, &ev| {
            b.iter(|| {
                criterion::black_box(translate_accept_ready_ops(
                    criterion::black_box(ev),
                    0,
                    OP_ACCEPT,
                    0,
                ))
            });
        });
    }
    group.bench_function("interest_to_events", |b| {
        b.iter(|| criterion::black_box(accept_interest_to_events(criterion::black_box(OP_ACCEPT))));
    });
    group.finish();
}

fn bench_channel_callbacks(c: &mut Criterion) {
    let provider = SelectorProvider::new();
    let selector = provider.open_selector().unwrap();
    let channel = provider.open_server_socket_channel().unwrap();
    channel
        .bind(Some("127.0.0.1:0".parse().unwrap()), 0)
        .unwrap();
    channel.configure_blocking(false).unwrap();
    let key = channel.register(&selector.handle(), OP_ACCEPT).unwrap();

    let mut group = c.benchmark_group("channel_translate");
    group.bench_function("set_ready_pollin", |b| {
        b.iter(|| criterion::black_box(channel.translate_and_set_ready_ops(POLLIN, &key)));
    });
    group.bench_function("update_ready_pollin", |b| {
        b.iter(|| criterion::black_box(channel.translate_and_update_ready_ops(POLLIN, &key)));
    });
    group.bench_function("set_interest_accept", |b| {
        b.iter(|| channel.translate_and_set_interest_ops(OP_ACCEPT, &key));
    });
    group.finish();
}

criterion_group!(benches, bench_pure_translation, bench_channel_callbacks);
criterion_main!(benches);
