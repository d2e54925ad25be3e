// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::path::PathBuf;

use criterion::{criterion_group, criterion_main, Criterion};
use skiff::targets::file::to_stop_tailing;

fn to_stop_tailing_bench(c: &mut Criterion) {
    let new_paths: Vec<PathBuf> = [
        "file1", "file2", "file3", "file4", "file5", "file6", "file7", "file11", "file12",
        "file15",
    ]
    .iter()
    .map(PathBuf::from)
    .collect();

    let mut existing: HashMap<PathBuf, ()> = HashMap::with_capacity(15);
    for i in 1..=15 {
        existing.insert(PathBuf::from(format!("file{}", i)), ());
    }

    c.bench_function("to_stop_tailing", |b| {
        b.iter(|| to_stop_tailing(&new_paths, &existing))
    });
}

criterion_group!(benches, to_stop_tailing_bench);
criterion_main!(benches);
