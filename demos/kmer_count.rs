use std::collections::hash_map::RandomState;
use std::time::Instant;

use clap::Parser;
use rho_map::CountMap;

/// Count randomly generated 2-bit packed k-mers and report table behavior.
#[derive(Parser, Debug)]
struct Args {
    /// Number of k-mer occurrences to stream through the counter.
    #[arg(short = 'n', long = "occurrences", default_value_t = 10_000_000)]
    occurrences: usize,

    /// Number of distinct k-mers in the simulated genome.
    #[arg(short = 'd', long = "distinct", default_value_t = 1_000_000)]
    distinct: usize,

    /// k-mer length (2 bits per base, at most 31).
    #[arg(short = 'k', long, default_value_t = 21)]
    k: u32,
}

fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9e3779b97f4a7c15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d049bb133111eb);
    z ^ (z >> 31)
}

fn main() {
    let args = Args::parse();
    assert!(args.k <= 31, "k-mers longer than 31 bases do not pack into 64 bits");
    let kmer_mask = (1u64 << (2 * args.k)) - 1;

    println!(
        "streaming {} occurrences of {} distinct {}-mers",
        args.occurrences, args.distinct, args.k
    );

    let mut seed = 0xdeadbeefu64;
    let pool: Vec<u64> = (0..args.distinct)
        .map(|_| splitmix64(&mut seed) & kmer_mask)
        .collect();
    let stream: Vec<(u64, u32)> = (0..args.occurrences)
        .map(|_| {
            let index = (splitmix64(&mut seed) as usize) % pool.len();
            (pool[index], 1u32)
        })
        .collect();

    let mut counts: CountMap<u64, u32, RandomState> = CountMap::with_hasher(RandomState::new());

    let start = Instant::now();
    counts.insert_batch(&stream).expect("table allocation failed");
    let elapsed = start.elapsed();

    println!(
        "counted in {:.3}s ({:.1}M occurrences/s)",
        elapsed.as_secs_f64(),
        args.occurrences as f64 / elapsed.as_secs_f64() / 1e6
    );
    println!("distinct k-mers counted:  {}", counts.len());
    println!(
        "sketch estimate:          {:.0}",
        counts.cardinality_estimate()
    );

    let total: u64 = counts.to_vec().iter().map(|&(_, c)| c as u64).sum();
    println!("total occurrences:        {total}");

    let mut histogram = [0usize; 8];
    for (_, count) in counts.to_vec() {
        histogram[(count as usize).min(histogram.len()) - 1] += 1;
    }
    println!("multiplicity histogram (1..=7, 8+):");
    for (multiplicity, bucket) in histogram.iter().enumerate() {
        println!("  {:>2}: {}", multiplicity + 1, bucket);
    }

    #[cfg(feature = "stats")]
    counts.stats().print();
}
