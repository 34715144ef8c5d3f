use crate::cache::AccessDescriptor;
use crate::address;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;

#[derive(Debug, Clone, Default)]
struct SamplerEntry {
    valid: bool,
    used: bool,
    lru: u8,
    tag: u64,
    pc: u64,
}

/// Sampler-based dead-block predictor: a random subset of cache sets is
/// shadowed by a small LRU sampler; a per-PC saturating counter learns
/// which PCs install lines that die unused.
pub struct DeadBlockPredictor {
    sampler: Vec<Vec<SamplerEntry>>,
    sampling_map: HashMap<usize, usize>,
    prediction_table: Vec<u8>,
    cache_sets: usize,
    block_size: u64,
    threshold: u8,
    high_conf_threshold: u8,
}

impl DeadBlockPredictor {
    #[must_use]
    pub fn new(
        sampler_sets: usize,
        sampler_ways: usize,
        cache_sets: usize,
        block_size: u64,
        prediction_table_size: usize,
        threshold: u8,
        high_conf_threshold: u8,
    ) -> Self {
        let mut rng = SmallRng::seed_from_u64(0xdead);
        let mut sampling_map = HashMap::new();
        let wanted = sampler_sets.min(cache_sets);
        while sampling_map.len() < wanted {
            let cache_set = rng.gen_range(0..cache_sets);
            let next = sampling_map.len();
            sampling_map.entry(cache_set).or_insert(next);
        }

        let mut sampler = vec![vec![SamplerEntry::default(); sampler_ways]; wanted];
        for set in &mut sampler {
            for entry in set.iter_mut() {
                entry.lru = sampler_ways as u8 - 1;
            }
        }

        Self {
            sampler,
            sampling_map,
            prediction_table: vec![0; prediction_table_size.max(1)],
            cache_sets,
            block_size,
            threshold,
            high_conf_threshold,
        }
    }

    #[must_use]
    pub fn is_set_sampled(&self, set: usize) -> bool {
        self.sampling_map.contains_key(&set)
    }

    fn tag(&self, full_addr: address) -> u64 {
        full_addr >> crate::hash::lg2(self.block_size * self.cache_sets as u64)
    }

    fn table_slot(&self, pc: u64) -> usize {
        pc as usize % self.prediction_table.len()
    }

    /// Observes one access to a sampled set.
    pub fn update_sampler(&mut self, desc: &AccessDescriptor) {
        let Some(&sampler_set) = self.sampling_map.get(&desc.set) else {
            return;
        };
        let tag = self.tag(desc.full_addr);
        let ways = self.sampler[sampler_set].len();

        let touched = if let Some(way) = self.sampler[sampler_set]
            .iter()
            .position(|e| e.valid && e.tag == tag)
        {
            // Reuse: the installing PC gets less dead.
            let slot = self.table_slot(self.sampler[sampler_set][way].pc);
            self.prediction_table[slot] = self.prediction_table[slot].saturating_sub(1);
            self.sampler[sampler_set][way].used = true;
            way
        } else {
            let way = self.sampler[sampler_set]
                .iter()
                .position(|e| !e.valid || e.lru == ways as u8 - 1)
                .unwrap();
            let victim = self.sampler[sampler_set][way].clone();
            if victim.valid && !victim.used {
                // Evicted without reuse: the installing PC gets deader.
                let slot = self.table_slot(victim.pc);
                self.prediction_table[slot] = (self.prediction_table[slot] + 1).min(0x7);
            }
            self.sampler[sampler_set][way] = SamplerEntry {
                valid: true,
                used: false,
                lru: victim.lru,
                tag,
                pc: desc.ip,
            };
            way
        };

        let touched_lru = self.sampler[sampler_set][touched].lru;
        for entry in &mut self.sampler[sampler_set] {
            if entry.lru < touched_lru {
                entry.lru += 1;
            }
        }
        self.sampler[sampler_set][touched].lru = 0;
    }

    #[must_use]
    pub fn predict_dead(&self, pc: u64) -> bool {
        self.prediction_table[self.table_slot(pc)] >= self.threshold
    }

    #[must_use]
    pub fn predict_dead_high_confidence(&self, pc: u64) -> bool {
        self.prediction_table[self.table_slot(pc)] >= self.high_conf_threshold
    }
}

#[cfg(test)]
mod tests {
    use super::DeadBlockPredictor;
    use crate::cache::{AccessDescriptor, WayView};
    use crate::packet::AccessKind;

    fn desc(set: usize, full_addr: u64, ip: u64) -> AccessDescriptor<'static> {
        AccessDescriptor {
            cpu: 0,
            set,
            way: None,
            full_addr,
            v_addr: full_addr,
            victim_addr: None,
            ip,
            kind: AccessKind::Load,
            hit: false,
            ways: &[] as &[WayView],
            cycle: 0,
        }
    }

    #[test]
    fn dead_pc_gets_flagged() {
        // 1 cache set, fully sampled, 2-way sampler: a PC streaming
        // unique blocks evicts its own unused lines over and over.
        let mut dbp = DeadBlockPredictor::new(1, 2, 1, 64, 64, 3, 6);
        for i in 0..32u64 {
            dbp.update_sampler(&desc(0, 0x10000 + i * 0x40, 0x400));
        }
        assert!(dbp.predict_dead(0x400));
    }

    #[test]
    fn reused_pc_stays_alive() {
        let mut dbp = DeadBlockPredictor::new(1, 2, 1, 64, 64, 3, 6);
        for _ in 0..32 {
            dbp.update_sampler(&desc(0, 0x10000, 0x400));
        }
        assert!(!dbp.predict_dead(0x400));
    }
}
