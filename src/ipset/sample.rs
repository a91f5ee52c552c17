//! Deterministic (given a seed) sampling of an `IPset`'s addresses.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use super::IpSet;
use crate::ip::IpAddress;

/// How to sample an `IPset`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SampleMode {
    /// Visit each address independently and include it with probability
    /// `ratio` (0.0-1.0).
    Ratio(f64),
    /// Draw exactly `n` distinct addresses uniformly without replacement.
    Size(u128),
}

pub fn sample(set: &IpSet, mode: SampleMode, seed: u64) -> IpSet {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut out = IpSet::create(set.width());
    match mode {
        SampleMode::Ratio(p) => {
            for cidr in set.leaves() {
                for addr in cidr.iter() {
                    if rng.gen_bool(p.clamp(0.0, 1.0)) {
                        insert_single(&mut out, addr);
                    }
                }
            }
        }
        SampleMode::Size(n) => {
            // Sequential selection: track remaining-count and
            // remaining-quota, drawing `rand < quota/remaining` per
            // address, per spec.md's reservoir-style algorithm.
            let leaves = set.leaves();
            let total: u128 = leaves.iter().map(|c| c.size()).sum();
            let mut remaining = total;
            let mut quota = n.min(total);
            'outer: for cidr in leaves {
                for addr in cidr.iter() {
                    if quota == 0 {
                        break 'outer;
                    }
                    let draw: f64 = rng.gen();
                    if draw < quota as f64 / remaining as f64 {
                        insert_single(&mut out, addr);
                        quota -= 1;
                    }
                    remaining -= 1;
                }
            }
        }
    }
    out
}

fn insert_single(set: &mut IpSet, addr: IpAddress) {
    set.insert(addr, addr.width() * 8)
        .expect("sampled address matches set width");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ip::IpAddress;

    #[test]
    fn ratio_sample_is_deterministic_given_seed() {
        let mut set = IpSet::create(4);
        set.insert(IpAddress::V4(0x0A00_0000), 24).unwrap();
        let a = sample(&set, SampleMode::Ratio(0.25), 1);
        let b = sample(&set, SampleMode::Ratio(0.25), 1);
        assert_eq!(a.leaves(), b.leaves());
        assert!(a.count().to_u128().unwrap() <= 256);
    }

    #[test]
    fn size_sample_draws_exact_count() {
        let mut set = IpSet::create(4);
        set.insert(IpAddress::V4(0x0A00_0000), 24).unwrap();
        let sampled = sample(&set, SampleMode::Size(10), 42);
        assert_eq!(sampled.count().to_u128().unwrap(), 10);
    }
}
