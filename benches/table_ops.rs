use std::hash::BuildHasher;
use std::hint::black_box;

use criterion::criterion_group;
use criterion::criterion_main;
use criterion::Criterion;
use criterion::Throughput;
use rand::rngs::OsRng;
use rand::TryRngCore;
use rho_map::CountMap;
use rho_map::HashMap as RhoHashMap;
use rho_map::ReplaceReducer;
use siphasher::sip::SipHasher;

#[derive(Clone)]
struct SipState {
    k0: u64,
    k1: u64,
}

impl SipState {
    fn random() -> Self {
        let mut rng = OsRng;
        Self {
            k0: rng.try_next_u64().unwrap(),
            k1: rng.try_next_u64().unwrap(),
        }
    }
}

impl BuildHasher for SipState {
    type Hasher = SipHasher;

    fn build_hasher(&self) -> SipHasher {
        SipHasher::new_with_keys(self.k0, self.k1)
    }
}

const SIZES: &[usize] = &[1 << 12, 1 << 16, 1 << 20];

/// 2-bit packed 21-mers with a skewed multiplicity distribution, the shape a
/// counting pipeline actually sees.
fn kmer_stream(len: usize) -> Vec<(u64, u32)> {
    let mut rng = OsRng;
    let distinct = (len / 2).max(1);
    let pool: Vec<u64> = (0..distinct)
        .map(|_| rng.try_next_u64().unwrap() & ((1 << 42) - 1))
        .collect();
    (0..len)
        .map(|_| {
            let index = (rng.try_next_u64().unwrap() as usize) % pool.len();
            // Low pool indices repeat far more often than high ones.
            let index = index.min((rng.try_next_u64().unwrap() as usize) % pool.len());
            (pool[index], 1u32)
        })
        .collect()
}

fn bench_insert_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert_batch");

    for &size in SIZES {
        let items = kmer_stream(size);
        group.throughput(Throughput::Elements(size as u64));

        group.bench_function(format!("rho_map/{size}"), |b| {
            b.iter(|| {
                let mut counts: CountMap<u64, u32, _> =
                    CountMap::with_hasher(SipState::random());
                counts.insert_batch(black_box(&items)).unwrap();
                black_box(counts.len())
            })
        });

        group.bench_function(format!("hashbrown/{size}"), |b| {
            b.iter(|| {
                let mut counts: hashbrown::HashMap<u64, u32, SipState> =
                    hashbrown::HashMap::with_hasher(SipState::random());
                for (kmer, increment) in black_box(&items) {
                    *counts.entry(*kmer).or_insert(0) += increment;
                }
                black_box(counts.len())
            })
        });
    }

    group.finish();
}

fn bench_find_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("find_batch");

    for &size in SIZES {
        let items = kmer_stream(size);
        let keys: Vec<u64> = items.iter().map(|(kmer, _)| *kmer).collect();

        let mut rho: RhoHashMap<u64, u32, _, ReplaceReducer> =
            RhoHashMap::with_hasher(SipState::random());
        rho.insert_batch(&items).unwrap();

        let mut brown: hashbrown::HashMap<u64, u32, SipState> =
            hashbrown::HashMap::with_hasher(SipState::random());
        for (kmer, count) in &items {
            brown.insert(*kmer, *count);
        }

        group.throughput(Throughput::Elements(size as u64));

        group.bench_function(format!("rho_map/{size}"), |b| {
            b.iter(|| {
                let counts = rho.count_batch(black_box(&keys));
                black_box(counts.iter().map(|&c| c as u64).sum::<u64>())
            })
        });

        group.bench_function(format!("hashbrown/{size}"), |b| {
            b.iter(|| {
                let mut hits = 0u64;
                for key in black_box(&keys) {
                    hits += brown.contains_key(key) as u64;
                }
                black_box(hits)
            })
        });
    }

    group.finish();
}

fn bench_erase_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("erase_batch");

    for &size in SIZES {
        let items = kmer_stream(size);
        let keys: Vec<u64> = items.iter().map(|(kmer, _)| *kmer).collect();
        group.throughput(Throughput::Elements(size as u64));

        group.bench_function(format!("rho_map/{size}"), |b| {
            b.iter_batched(
                || {
                    let mut map: RhoHashMap<u64, u32, _, ReplaceReducer> =
                        RhoHashMap::with_hasher(SipState::random());
                    map.insert_batch(&items).unwrap();
                    map
                },
                |mut map| black_box(map.remove_batch(black_box(&keys))),
                criterion::BatchSize::LargeInput,
            )
        });

        group.bench_function(format!("hashbrown/{size}"), |b| {
            b.iter_batched(
                || {
                    let mut map: hashbrown::HashMap<u64, u32, SipState> =
                        hashbrown::HashMap::with_hasher(SipState::random());
                    for (kmer, count) in &items {
                        map.insert(*kmer, *count);
                    }
                    map
                },
                |mut map| {
                    let mut removed = 0u64;
                    for key in black_box(&keys) {
                        removed += map.remove(key).is_some() as u64;
                    }
                    black_box(removed)
                },
                criterion::BatchSize::LargeInput,
            )
        });
    }

    group.finish();
}

criterion_group!(benches, bench_insert_batch, bench_find_batch, bench_erase_batch);
criterion_main!(benches);
