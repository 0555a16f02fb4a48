//! Benchmarks for the fingerprint sampling schemes across file sizes.

use divan::Bencher;
use polybuild::{fingerprint::full_sync, path::AbsFilePath};
use tempfile::TempDir;

fn main() {
    divan::main();
}

fn file_of_size(size: usize) -> (TempDir, AbsFilePath) {
    let dir = tempfile::tempdir().expect("create temp dir");
    let path = dir.path().join("sample");
    std::fs::write(&path, vec![0x42u8; size]).expect("write sample file");
    let abs = AbsFilePath::try_from(path).expect("absolute path");
    (dir, abs)
}

#[divan::bench(sample_count = 20)]
fn whole_scheme(bencher: Bencher) {
    bencher
        .with_inputs(|| file_of_size(2 * 1024))
        .bench_values(|(_dir, path)| full_sync(&path).expect("fingerprint"));
}

#[divan::bench(sample_count = 20)]
fn chunked_scheme(bencher: Bencher) {
    bencher
        .with_inputs(|| file_of_size(512 * 1024))
        .bench_values(|(_dir, path)| full_sync(&path).expect("fingerprint"));
}

#[divan::bench(sample_count = 10)]
fn sampled_scheme(bencher: Bencher) {
    bencher
        .with_inputs(|| file_of_size(10 * 1024 * 1024))
        .bench_values(|(_dir, path)| full_sync(&path).expect("fingerprint"));
}
