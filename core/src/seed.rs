//! Deterministic seed variation engine (§4.6).
//!
//! All four strategies are pure functions of `(count, base_seed)`; nothing
//! here suspends or performs I/O.

use crate::models::SeedStrategy;

pub const MIN_SEED: u64 = 0;
pub const MAX_SEED: u64 = (1u64 << 63) - 1;
const MIN_RANDOM_DISTANCE: u64 = 1_000_000;
const PHI: f64 = 1.6180339887498949;

#[derive(Debug, Clone, thiserror::Error)]
pub enum SeedError {
    #[error("count must be non-negative, got {0}")]
    NegativeCount(i64),
}

fn clamp_seed(seed: u64) -> u64 {
    seed % (MAX_SEED + 1)
}

/// A small seeded xorshift64* generator. The teacher's dependency set has no
/// `rand` crate; this mirrors `random.Random(seed)` closely enough to give
/// deterministic, well-distributed candidates for the `random` strategy
/// without pulling in a dependency nothing else in the workspace needs.
struct Xorshift64(u64);

impl Xorshift64 {
    fn new(seed: u64) -> Self {
        // xorshift64* requires a non-zero state.
        Self(seed ^ 0x9E3779B97F4A7C15)
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.0 = x;
        x.wrapping_mul(0x2545F4914F6CDD1D)
    }

    /// Uniform value in `[0, bound)`.
    fn below(&mut self, bound: u64) -> u64 {
        if bound == 0 {
            return 0;
        }
        self.next_u64() % bound
    }
}

/// Generate `count` unique 63-bit seeds under `strategy`.
///
/// `count == 0` returns the empty list. `count < 0` is a validation error.
/// When `base_seed` is `None` a base is drawn uniformly from
/// `[0, MAX_SEED - count * MIN_RANDOM_DISTANCE]` (floored at 0), so random
/// draws still leave headroom for the minimum-distance rule.
pub fn generate_seeds(
    count: i64,
    strategy: SeedStrategy,
    base_seed: Option<u64>,
) -> Result<Vec<u64>, SeedError> {
    if count < 0 {
        return Err(SeedError::NegativeCount(count));
    }
    if count == 0 {
        return Ok(Vec::new());
    }
    let count = count as u64;

    let base = match base_seed {
        Some(b) => clamp_seed(b),
        None => {
            let span = MAX_SEED.saturating_sub(count.saturating_mul(MIN_RANDOM_DISTANCE));
            let mut rng = Xorshift64::new(std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(0x1234_5678));
            rng.below(span + 1)
        }
    };

    let seeds = match strategy {
        SeedStrategy::Sequential => sequential_seeds(count, base),
        SeedStrategy::Fibonacci => fibonacci_seeds(count, base),
        SeedStrategy::GoldenRatio => golden_ratio_seeds(count, base),
        SeedStrategy::Random => random_seeds(count, base),
    };
    Ok(seeds)
}

fn sequential_seeds(count: u64, base: u64) -> Vec<u64> {
    (0..count).map(|i| clamp_seed(base.wrapping_add(i))).collect()
}

fn fibonacci_seeds(count: u64, base: u64) -> Vec<u64> {
    let mut seeds = vec![clamp_seed(base)];
    if count == 1 {
        return seeds;
    }
    let mut fib = vec![1u64, 1u64];
    let mut offset = 0u64;
    for i in 0..(count - 1) {
        if i < fib.len() as u64 {
            offset = offset.wrapping_add(fib[i as usize].wrapping_mul(1000));
        } else {
            let next = fib[fib.len() - 1] + fib[fib.len() - 2];
            fib.push(next);
            offset = offset.wrapping_add(next.wrapping_mul(1000));
        }
        seeds.push(clamp_seed(base.wrapping_add(offset)));
    }
    seeds
}

fn golden_ratio_seeds(count: u64, base: u64) -> Vec<u64> {
    let mut seeds = vec![clamp_seed(base)];
    for i in 1..count {
        let offset = (base as f64 * (PHI.powi(i as i32) - 1.0)) as i64;
        let candidate = (base as i64).wrapping_add(offset);
        seeds.push(clamp_seed(candidate as u64));
    }
    seeds
}

fn random_seeds(count: u64, base: u64) -> Vec<u64> {
    let mut rng = Xorshift64::new(base);
    let mut seeds = vec![clamp_seed(base)];
    for _ in 1..count {
        let mut chosen = None;
        for _ in 0..100 {
            let candidate = rng.below(MAX_SEED + 1);
            if seeds
                .iter()
                .all(|s| candidate.abs_diff(*s) >= MIN_RANDOM_DISTANCE)
            {
                chosen = Some(candidate);
                break;
            }
        }
        let value = chosen.unwrap_or_else(|| {
            let candidate = rng.below(MAX_SEED + 1);
            tracing::warn!(
                candidate,
                "random seed strategy exhausted 100 attempts at minimum distance; \
                 emitting a non-conforming candidate"
            );
            candidate
        });
        seeds.push(value);
    }
    seeds
}

/// All seeds pairwise distinct and within range — used by callers (C11) to
/// validate generated output before building child jobs.
pub fn validate_seeds(seeds: &[u64]) -> bool {
    let unique: std::collections::HashSet<_> = seeds.iter().collect();
    unique.len() == seeds.len() && seeds.iter().all(|s| *s <= MAX_SEED)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_zero_is_empty() {
        assert_eq!(generate_seeds(0, SeedStrategy::Sequential, Some(1)).unwrap(), Vec::<u64>::new());
    }

    #[test]
    fn negative_count_is_error() {
        assert!(generate_seeds(-1, SeedStrategy::Sequential, Some(1)).is_err());
    }

    #[test]
    fn sequential_is_consecutive() {
        let seeds = generate_seeds(5, SeedStrategy::Sequential, Some(42)).unwrap();
        assert_eq!(seeds, vec![42, 43, 44, 45, 46]);
    }

    #[test]
    fn sequential_wraps_modulo_max() {
        let seeds = generate_seeds(2, SeedStrategy::Sequential, Some(MAX_SEED)).unwrap();
        assert_eq!(seeds, vec![MAX_SEED, 0]);
    }

    #[test]
    fn golden_ratio_matches_spec_example() {
        let seeds = generate_seeds(4, SeedStrategy::GoldenRatio, Some(100)).unwrap();
        assert_eq!(seeds[0], 100);
        for (i, seed) in seeds.iter().enumerate().skip(1) {
            let offset = (100f64 * (PHI.powi(i as i32) - 1.0)) as i64;
            let expected = clamp_seed((100i64 + offset) as u64);
            assert_eq!(*seed, expected);
        }
    }

    #[test]
    fn random_is_deterministic_given_base() {
        let a = generate_seeds(8, SeedStrategy::Random, Some(7)).unwrap();
        let b = generate_seeds(8, SeedStrategy::Random, Some(7)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn random_respects_minimum_distance() {
        let seeds = generate_seeds(10, SeedStrategy::Random, Some(123456)).unwrap();
        for i in 0..seeds.len() {
            for j in (i + 1)..seeds.len() {
                assert!(seeds[i].abs_diff(seeds[j]) >= MIN_RANDOM_DISTANCE);
            }
        }
    }

    #[test]
    fn all_strategies_produce_seeds_in_range() {
        for strategy in [
            SeedStrategy::Sequential,
            SeedStrategy::Fibonacci,
            SeedStrategy::GoldenRatio,
            SeedStrategy::Random,
        ] {
            let seeds = generate_seeds(6, strategy, Some(99)).unwrap();
            assert!(seeds.iter().all(|s| *s <= MAX_SEED));
        }
    }

    #[test]
    fn fibonacci_is_deterministic() {
        let a = generate_seeds(6, SeedStrategy::Fibonacci, Some(10)).unwrap();
        let b = generate_seeds(6, SeedStrategy::Fibonacci, Some(10)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn fibonacci_matches_spec_example() {
        let seeds = generate_seeds(6, SeedStrategy::Fibonacci, Some(0)).unwrap();
        assert_eq!(seeds, vec![0, 1000, 2000, 4000, 7000, 12000]);
    }
}
