use criterion::{criterion_group, criterion_main, Criterion};

use broker::search::merge::{kway_merge, ShardDocs};
use shardzilla_engine::collect::sort::{SortCell, SortKey};
use shardzilla_engine::model::Document;

fn shard(shard: u32, n: u64) -> ShardDocs {
    let docs = (0..n)
        .map(|d| Document {
            leaf_ord: 0,
            leaf_doc: d as u32,
            global_doc: d,
            primary_key: format!("{shard}-{d}"),
            score: (n - d) as f32,
            sort_key: SortKey(vec![SortCell::from_f64(true, (n - d) as f64)]),
            fields: Vec::new(),
            children: Vec::new(),
        })
        .collect();
    ShardDocs { shard, docs }
}

fn bench_merge(c: &mut Criterion) {
    c.bench_function("kway_merge 4x1000 take 100", |b| {
        b.iter(|| {
            let parts = (0..4).map(|s| shard(s, 1_000)).collect::<Vec<_>>();
            kway_merge(parts, 100)
        })
    });
}

criterion_group!(benches, bench_merge);
criterion_main!(benches);
