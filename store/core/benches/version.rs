//! Version comparator microbenchmarks.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use cairn_core::{compare, Version};

fn bench_compare(c: &mut Criterion) {
    let a = Version::new(1, 100, 42, 1, 0);
    let b = Version::new(1, 101, 43, 2, 0);

    c.bench_function("version_compare", |bench| {
        bench.iter(|| compare(black_box(&a), black_box(&b), false));
    });

    c.bench_function("version_compare_ignore_time", |bench| {
        bench.iter(|| compare(black_box(&a), black_box(&b), true));
    });
}

criterion_group!(benches, bench_compare);
criterion_main!(benches);
