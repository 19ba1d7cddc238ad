use criterion::{black_box, criterion_group, criterion_main, Criterion};

use sqllog::dialect::sqlite::SqliteDialect;
use sqllog::{decode, Dialect};

fn append_throughput(c: &mut Criterion) {
    let dialect = SqliteDialect::open_in_memory("kine").expect("open in-memory dialect");
    let mut prev = 0i64;
    let mut group = c.benchmark_group("append");
    group.bench_function("sequential_insert", |b| {
        b.iter(|| {
            let next = dialect
                .insert(b"/bench/key", prev == 0, false, 0, prev, 0, black_box(b"value"), b"")
                .expect("insert");
            prev = next;
        });
    });
    group.finish();
}

fn decode_throughput(c: &mut Criterion) {
    let dialect = SqliteDialect::open_in_memory("kine").expect("open in-memory dialect");
    let mut prev = dialect.insert(b"/bench/key", true, false, 0, 0, 0, b"v0", b"").unwrap();
    for i in 1..1000 {
        prev = dialect
            .insert(b"/bench/key", false, false, prev, prev, 0, format!("v{i}").as_bytes(), b"")
            .unwrap();
    }

    let mut group = c.benchmark_group("decode");
    group.bench_function("decode_after_full_history", |b| {
        b.iter(|| {
            let row_set = dialect.after("/bench/key", 0, 0).expect("after");
            black_box(decode(&row_set));
        });
    });
    group.finish();
}

criterion_group!(benches, append_throughput, decode_throughput);
criterion_main!(benches);
