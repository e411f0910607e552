#![forbid(unsafe_code)]

use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use fractree::{
    primitives::compress::{compress_to_vec, decompress, CompressionMethod},
    storage::{
        loader::{open_loader, IndexSpec},
        LoaderOptions, TreeOptions,
    },
    types::x1764,
    FtContext,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tempfile::TempDir;

const BLOCK: usize = 64 << 10;
const ROWS: usize = 20_000;

fn leafish_block() -> Vec<u8> {
    let mut rng = ChaCha8Rng::seed_from_u64(7);
    let mut out = Vec::with_capacity(BLOCK);
    let mut i = 0u64;
    while out.len() < BLOCK {
        out.extend_from_slice(format!("user:{i:08}").as_bytes());
        out.extend((0..24).map(|_| rng.gen_range(b'a'..=b'f')));
        i += 1;
    }
    out.truncate(BLOCK);
    out
}

fn micro_codec(c: &mut Criterion) {
    let block = leafish_block();
    let mut group = c.benchmark_group("micro/codec");
    group.throughput(Throughput::Bytes(BLOCK as u64));
    group.bench_function("x1764", |b| b.iter(|| x1764(&block)));
    for method in [
        CompressionMethod::None,
        CompressionMethod::Fast,
        CompressionMethod::Default,
        CompressionMethod::Small,
    ] {
        group.bench_with_input(
            BenchmarkId::new("compress", format!("{method:?}")),
            &method,
            |b, &method| b.iter(|| compress_to_vec(method, &block)),
        );
        let packed = compress_to_vec(method, &block);
        let mut dst = vec![0u8; BLOCK];
        group.bench_with_input(
            BenchmarkId::new("decompress", format!("{method:?}")),
            &method,
            |b, _| b.iter(|| decompress(&mut dst, &packed).expect("decompress")),
        );
    }
    group.finish();
}

fn micro_bulk_load(c: &mut Criterion) {
    let mut rng = ChaCha8Rng::seed_from_u64(11);
    let rows: Vec<(Vec<u8>, Vec<u8>)> = (0..ROWS)
        .map(|i| {
            let key = format!("{:016x}{i:08}", rng.gen::<u64>()).into_bytes();
            let val: Vec<u8> = (0..32).map(|_| rng.gen()).collect();
            (key, val)
        })
        .collect();
    let tmpdir = TempDir::new().expect("tempdir");
    let ctx = Arc::new(FtContext::with_threads(0).expect("context"));

    let mut group = c.benchmark_group("micro/loader");
    group.sample_size(10);
    group.throughput(Throughput::Elements(ROWS as u64));
    for (name, budget) in [("in_memory", 64 << 20), ("spilling", 256 << 10)] {
        group.bench_function(name, |b| {
            let mut n = 0u64;
            b.iter(|| {
                n += 1;
                let path = tmpdir.path().join(format!("{name}-{n}.ft"));
                let opts = LoaderOptions::default()
                    .memory_budget(budget)
                    .temp_dir(tmpdir.path())
                    .tree(TreeOptions::default().node_size(64 << 10).basement_node_size(8 << 10));
                let mut loader =
                    open_loader(vec![IndexSpec::new(&path)], opts, Arc::clone(&ctx)).expect("open loader");
                for (k, v) in &rows {
                    loader.put(k, v).expect("put");
                }
                loader.close().expect("close");
                std::fs::remove_file(&path).expect("remove tree");
            });
        });
    }
    group.finish();
}

criterion_group!(benches, micro_codec, micro_bulk_load);
criterion_main!(benches);
