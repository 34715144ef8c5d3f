use super::ReplacementPolicy;
use crate::cache::AccessDescriptor;

const MAX_RRPV: u8 = 3;

/// Static RRIP: hits promote to 0, fills insert at `MAX_RRPV - 1`,
/// victims found by aging every way until one reaches `MAX_RRPV`.
pub struct Srrip {
    rrpv: Vec<Vec<u8>>,
}

impl Srrip {
    #[must_use]
    pub fn new(sets: usize, ways: usize) -> Self {
        Self {
            rrpv: vec![vec![MAX_RRPV; ways]; sets],
        }
    }
}

impl ReplacementPolicy for Srrip {
    fn name(&self) -> &'static str {
        "srrip"
    }

    fn update_state(&mut self, desc: &AccessDescriptor) {
        let Some(way) = desc.way else { return };
        self.rrpv[desc.set][way] = if desc.hit { 0 } else { MAX_RRPV - 1 };
    }

    fn find_victim(&mut self, desc: &AccessDescriptor) -> usize {
        if let Some(way) = desc.ways.iter().position(|way| !way.valid) {
            return way;
        }
        // Terminates: every pass without a hit ages all ways by one, so at
        // most MAX_RRPV passes are needed.
        loop {
            if let Some(way) = self.rrpv[desc.set].iter().position(|&r| r == MAX_RRPV) {
                return way;
            }
            for rrpv in &mut self.rrpv[desc.set] {
                *rrpv += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Srrip, MAX_RRPV};
    use crate::replacement::testing::{all_valid, desc};
    use crate::replacement::ReplacementPolicy;

    #[test]
    fn victim_has_max_rrpv_after_aging() {
        let mut srrip = Srrip::new(1, 4);
        let ways = all_valid(4);
        for way in 0..4 {
            srrip.update_state(&desc(0, Some(way), &ways, false));
        }
        srrip.update_state(&desc(0, Some(2), &ways, true));

        let victim = srrip.find_victim(&desc(0, None, &ways, false));
        assert_ne!(victim, 2);
        assert_eq!(srrip.rrpv[0][victim], MAX_RRPV);
    }

    #[test]
    fn aging_is_bounded() {
        let mut srrip = Srrip::new(1, 4);
        let ways = all_valid(4);
        // All promoted to 0; still terminates.
        for way in 0..4 {
            srrip.update_state(&desc(0, Some(way), &ways, true));
        }
        let victim = srrip.find_victim(&desc(0, None, &ways, false));
        assert!(victim < 4);
    }
}
