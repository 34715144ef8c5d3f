use super::ReplacementPolicy;
use crate::cache::AccessDescriptor;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

/// Uniform random victim selection; keeps no recency state.
pub struct Random {
    ways: usize,
    rng: SmallRng,
}

impl Random {
    #[must_use]
    pub fn new(ways: usize) -> Self {
        Self {
            ways,
            rng: SmallRng::seed_from_u64(0x5eed),
        }
    }
}

impl ReplacementPolicy for Random {
    fn name(&self) -> &'static str {
        "random"
    }

    fn update_state(&mut self, _desc: &AccessDescriptor) {}

    fn find_victim(&mut self, desc: &AccessDescriptor) -> usize {
        if let Some(way) = desc.ways.iter().position(|way| !way.valid) {
            return way;
        }
        self.rng.gen_range(0..self.ways)
    }
}

#[cfg(test)]
mod tests {
    use super::Random;
    use crate::replacement::testing::{all_valid, desc};
    use crate::replacement::ReplacementPolicy;

    #[test]
    fn victim_in_range() {
        let mut random = Random::new(8);
        let ways = all_valid(8);
        for _ in 0..100 {
            assert!(random.find_victim(&desc(0, None, &ways, false)) < 8);
        }
    }
}
