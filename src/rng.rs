//! Uniform random selection used throughout placement and merge.
//!
//! One thread-local generator per server thread rather than a fresh one
//! per call; overridable to a fixed seed so placement/merge decisions are
//! reproducible under test.

use std::cell::RefCell;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

thread_local! {
    static RNG: RefCell<StdRng> = RefCell::new(StdRng::from_os_rng());
}

/// Reseed this thread's generator. Tests call this to make placement and
/// merge destination choices deterministic.
pub fn seed_from_u64(seed: u64) {
    RNG.with(|rng| *rng.borrow_mut() = StdRng::seed_from_u64(seed));
}

/// Pick a uniformly random element from a non-empty slice.
pub fn choose<'a, T>(items: &'a [T]) -> Option<&'a T> {
    if items.is_empty() {
        return None;
    }
    RNG.with(|rng| {
        let idx = rng.borrow_mut().random_range(0..items.len());
        items.get(idx)
    })
}

/// Pick a uniformly random element out of an iterator of owned-by-reference
/// candidates, without requiring a contiguous slice.
pub fn choose_from<T: Clone>(items: impl Iterator<Item = T>) -> Option<T> {
    let collected: Vec<T> = items.collect();
    choose(&collected).cloned()
}

/// Uniform random integer in `[0, bound)`.
pub fn gen_range(bound: usize) -> usize {
    RNG.with(|rng| rng.borrow_mut().random_range(0..bound))
}

/// Fisher-Yates shuffle in place, using the thread-local generator.
pub fn shuffle<T>(items: &mut [T]) {
    RNG.with(|rng| {
        let mut rng = rng.borrow_mut();
        for i in (1..items.len()).rev() {
            let j = rng.random_range(0..=i);
            items.swap(i, j);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_under_seed() {
        seed_from_u64(42);
        let a: Vec<usize> = (0..5).map(|_| gen_range(1000)).collect();
        seed_from_u64(42);
        let b: Vec<usize> = (0..5).map(|_| gen_range(1000)).collect();
        assert_eq!(a, b);
    }

    #[test]
    fn choose_picks_a_member() {
        seed_from_u64(7);
        let items = vec![10, 20, 30];
        let picked = *choose(&items).unwrap();
        assert!(items.contains(&picked));
    }

    #[test]
    fn choose_empty_is_none() {
        let items: Vec<i32> = vec![];
        assert!(choose(&items).is_none());
    }

    #[test]
    fn shuffle_is_a_permutation() {
        seed_from_u64(3);
        let mut items: Vec<u32> = (0..20).collect();
        let mut sorted = items.clone();
        shuffle(&mut items);
        sorted.sort();
        let mut check = items.clone();
        check.sort();
        assert_eq!(sorted, check);
    }
}
