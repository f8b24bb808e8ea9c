//! Random partition selection.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Mutex;

/// Source of uniform random indexes, injected so selection can be made
/// deterministic.
pub trait Randomizer: Send + Sync {
    /// Uniform index in `0..upper`. `upper` is never zero.
    fn next_index(&self, upper: usize) -> usize;
}

/// Thread-local RNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRandomizer;

impl Randomizer for ThreadRandomizer {
    fn next_index(&self, upper: usize) -> usize {
        rand::thread_rng().gen_range(0..upper)
    }
}

/// Reproducible sequence from a seed.
#[derive(Debug)]
pub struct SeededRandomizer {
    rng: Mutex<StdRng>,
}

impl SeededRandomizer {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl Randomizer for SeededRandomizer {
    fn next_index(&self, upper: usize) -> usize {
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        rng.gen_range(0..upper)
    }
}

/// Always the first candidate.
#[derive(Debug, Default, Clone, Copy)]
pub struct FirstIndex;

impl Randomizer for FirstIndex {
    fn next_index(&self, _upper: usize) -> usize {
        0
    }
}

/// Remove and return a random element, so repeated calls pick without
/// replacement.
pub(crate) fn take_random<T>(randomizer: &dyn Randomizer, items: &mut Vec<T>) -> Option<T> {
    if items.is_empty() {
        return None;
    }
    let idx = randomizer.next_index(items.len()).min(items.len() - 1);
    Some(items.swap_remove(idx))
}
