//! Throughput Benchmark for sysmon
//!
//! This benchmark measures the hot paths of a request: framing and parsing
//! the head, canonicalizing the path, and the timer traffic each connection
//! generates.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::time::{Duration, Instant};
use sysmon::endpoints::Registry;
use sysmon::http::{canonicalize_path, parse_request, Framing, RequestScanner};
use sysmon::timer::Scheduler;

const SIMPLE: &[u8] = b"GET /smver HTTP/1.0\r\n\r\n";
const BROWSER: &[u8] = b"GET /all?fmt=json HTTP/1.1\r\n\
Host: monitor.example.com:7070\r\n\
User-Agent: Mozilla/5.0 (X11; Linux x86_64; rv:120.0) Gecko/20100101 Firefox/120.0\r\n\
Accept: application/json,text/html;q=0.9,*/*;q=0.8\r\n\
Accept-Language: en-US,en;q=0.5\r\n\
Accept-Encoding: gzip, deflate\r\n\
Connection: keep-alive\r\n\r\n";

/// Benchmark the request-completion scanner
fn bench_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("scan");

    for (name, req) in [("simple", SIMPLE), ("browser", BROWSER)] {
        group.throughput(Throughput::Bytes(req.len() as u64));
        group.bench_with_input(BenchmarkId::new("whole", name), req, |b, req| {
            b.iter(|| {
                let mut scanner = RequestScanner::new();
                black_box(scanner.scan(black_box(req)))
            });
        });
    }

    // Worst case for incremental framing: one byte per read.
    group.throughput(Throughput::Bytes(BROWSER.len() as u64));
    group.bench_function("byte_at_a_time", |b| {
        b.iter(|| {
            let mut scanner = RequestScanner::new();
            let mut framing = Framing::NoRequest;
            for end in 1..=BROWSER.len() {
                framing = scanner.scan(&BROWSER[..end]);
            }
            black_box(framing)
        });
    });

    group.finish();
}

/// Benchmark request-line and header parsing
fn bench_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse");
    group.throughput(Throughput::Elements(1));

    group.bench_function("simple", |b| {
        b.iter(|| parse_request(black_box(SIMPLE)))
    });

    group.bench_function("browser", |b| {
        b.iter(|| parse_request(black_box(BROWSER)))
    });

    group.bench_function("rejected_method", |b| {
        b.iter(|| parse_request(black_box(b"DELETE /cpu HTTP/1.0\r\n\r\n")))
    });

    group.finish();
}

/// Benchmark path canonicalization
fn bench_canonicalize(c: &mut Criterion) {
    let mut group = c.benchmark_group("canonicalize");
    group.throughput(Throughput::Elements(1));

    for path in ["/cpu", "/a/./b//c/../d", "/x/y/z/../../../../etc"] {
        group.bench_with_input(BenchmarkId::from_parameter(path), path, |b, path| {
            b.iter(|| canonicalize_path(black_box(path)))
        });
    }

    group.finish();
}

/// Benchmark scheduler traffic: schedule, cancel and expiry
fn bench_scheduler(c: &mut Criterion) {
    let mut group = c.benchmark_group("scheduler");

    for n in [100usize, 10_000] {
        group.throughput(Throughput::Elements(n as u64));

        group.bench_with_input(BenchmarkId::new("schedule_cancel", n), &n, |b, &n| {
            let mut timers: Scheduler<usize> = Scheduler::new();
            let mut handles = Vec::with_capacity(n);
            b.iter(|| {
                let base = Instant::now();
                for i in 0..n {
                    let period = Duration::from_millis((i % 500) as u64);
                    handles.push(timers.schedule(Some(base), period, false, i));
                }
                for handle in handles.drain(..) {
                    timers.cancel(handle);
                }
            });
        });

        group.bench_with_input(BenchmarkId::new("run_due", n), &n, |b, &n| {
            let mut timers: Scheduler<usize> = Scheduler::new();
            b.iter(|| {
                let base = Instant::now();
                for i in 0..n {
                    timers.schedule(Some(base), Duration::from_millis((i % 50) as u64), false, i);
                }
                let fired = timers.run_due(base + Duration::from_secs(1), |_, data| {
                    black_box(data);
                });
                black_box(fired)
            });
        });
    }

    group.finish();
}

/// Benchmark serving a cached document
fn bench_registry(c: &mut Criterion) {
    let registry = Registry::with_defaults();

    let mut group = c.benchmark_group("registry");
    group.throughput(Throughput::Elements(1));

    for path in ["smver", "all", "nope"] {
        group.bench_with_input(BenchmarkId::new("body", path), path, |b, path| {
            b.iter(|| registry.body(black_box(path)))
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_scan,
    bench_parse,
    bench_canonicalize,
    bench_scheduler,
    bench_registry,
);

criterion_main!(benches);
