use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tessera_core::Pool;

fn insert_erase_churn(c: &mut Criterion) {
    c.bench_function("pool insert/erase churn 1k", |b| {
        let mut pool = Pool::with_capacity(1024);
        let mut live = Vec::with_capacity(1024);
        b.iter(|| {
            for i in 0..1024u32 {
                live.push(pool.insert(i));
            }
            for handle in live.drain(..).step_by(2) {
                black_box(pool.erase(handle).ok());
            }
            pool.drain();
        });
    });
}

fn lookup(c: &mut Criterion) {
    let mut pool = Pool::new();
    let handles: Vec<_> = (0..4096u32).map(|i| pool.insert(i)).collect();
    c.bench_function("pool get 4k", |b| {
        b.iter(|| {
            let mut sum = 0u64;
            for handle in &handles {
                sum += u64::from(*pool.get(*handle).unwrap_or(&0));
            }
            black_box(sum)
        });
    });
}

criterion_group!(benches, insert_erase_churn, lookup);
criterion_main!(benches);
