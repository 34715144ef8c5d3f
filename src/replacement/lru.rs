use super::ReplacementPolicy;
use crate::cache::AccessDescriptor;
use crate::packet::AccessKind;

/// True-LRU: age counters per way, 0 = MRU, `ways - 1` = LRU.
pub struct Lru {
    ages: Vec<Vec<u8>>,
}

impl Lru {
    #[must_use]
    pub fn new(sets: usize, ways: usize) -> Self {
        Self {
            ages: vec![(0..ways).map(|way| way as u8).collect(); sets],
        }
    }
}

impl ReplacementPolicy for Lru {
    fn name(&self) -> &'static str {
        "lru"
    }

    fn update_state(&mut self, desc: &AccessDescriptor) {
        // Writeback hits do not touch recency.
        if desc.hit && desc.kind == AccessKind::Writeback {
            return;
        }
        let Some(way) = desc.way else { return };
        let touched = self.ages[desc.set][way];
        for age in &mut self.ages[desc.set] {
            if *age < touched {
                *age += 1;
            }
        }
        self.ages[desc.set][way] = 0;
    }

    fn find_victim(&mut self, desc: &AccessDescriptor) -> usize {
        if let Some(way) = desc.ways.iter().position(|way| !way.valid) {
            return way;
        }
        self.ages[desc.set]
            .iter()
            .enumerate()
            .max_by_key(|(_, &age)| age)
            .map(|(way, _)| way)
            .unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::Lru;
    use crate::replacement::testing::{all_valid, desc};
    use crate::replacement::ReplacementPolicy;

    #[test]
    fn victim_is_least_recently_touched() {
        // 1 set, 4 ways; touch 0,1,2,3,0 -> way holding block 1 is LRU.
        let mut lru = Lru::new(1, 4);
        let ways = all_valid(4);
        for way in [0, 1, 2, 3, 0] {
            lru.update_state(&desc(0, Some(way), &ways, true));
        }
        assert_eq!(lru.find_victim(&desc(0, None, &ways, false)), 1);
    }

    #[test]
    fn invalid_way_preempts_order() {
        let mut lru = Lru::new(1, 4);
        let mut ways = all_valid(4);
        ways[2].valid = false;
        assert_eq!(lru.find_victim(&desc(0, None, &ways, false)), 2);
    }

    #[test]
    fn writeback_hit_leaves_order_alone() {
        let mut lru = Lru::new(1, 2);
        let ways = all_valid(2);
        lru.update_state(&desc(0, Some(0), &ways, true));

        let mut wb = desc(0, Some(1), &ways, true);
        wb.kind = crate::packet::AccessKind::Writeback;
        lru.update_state(&wb);

        // way 1 was never promoted, so it stays the victim
        assert_eq!(lru.find_victim(&desc(0, None, &ways, false)), 1);
    }
}
