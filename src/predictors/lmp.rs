use crate::packet::{Level, Packet, Route};

/// Two-level load-miss predictor: a PC-indexed rolling hit/miss history
/// selects a second-level table entry holding the last outcome seen after
/// that history.
pub struct LoadMissPredictor {
    histories: Vec<u32>,
    outcomes: Vec<bool>,
    pub stats: stats::Lmp,
}

impl LoadMissPredictor {
    #[must_use]
    pub fn new(num_pc: usize, num_histories: usize) -> Self {
        Self {
            histories: vec![0; num_pc.max(1)],
            outcomes: vec![false; num_histories.max(1)],
            stats: stats::Lmp::default(),
        }
    }

    #[must_use]
    pub fn predict(&self, ip: u64) -> bool {
        let history = self.histories[ip as usize % self.histories.len()];
        self.outcomes[history as usize % self.outcomes.len()]
    }

    /// Rolls the observed outcome into the PC's history and retargets the
    /// second level; accuracy is judged against where the packet was
    /// actually served from, route and bypass flags included.
    pub fn update(&mut self, ip: u64, packet: &Packet) {
        let missed_all = packet.served_from == Some(Level::Dram);

        let slot = ip as usize % self.histories.len();
        let history = &mut self.histories[slot];
        *history = ((*history << 1) as usize % self.outcomes.len()) as u32;
        *history |= u32::from(missed_all);

        let idx = *history as usize % self.outcomes.len();
        self.outcomes[idx] = missed_all;

        if packet.is_demand() {
            let accurate = match packet.route {
                Some(Route::Dram) => packet.served_from == Some(Level::Dram),
                None if packet.bypassed_l2c_llc => {
                    !matches!(packet.served_from, Some(Level::L2C | Level::Llc))
                }
                None => matches!(packet.served_from, Some(Level::L2C | Level::Llc)),
                _ => false,
            };
            if accurate {
                self.stats.accurate += 1;
            } else {
                self.stats.inaccurate += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::LoadMissPredictor;
    use crate::packet::{AccessKind, Level, Packet};

    fn served(level: Level) -> Packet {
        let mut packet = Packet::new(0, AccessKind::Load, 0x1000, 0x1000);
        packet.serve_from(level);
        packet
    }

    #[test]
    fn repeated_dram_service_predicts_miss() {
        let mut lmp = LoadMissPredictor::new(64, 16);
        for _ in 0..8 {
            lmp.update(0x400, &served(Level::Dram));
        }
        assert!(lmp.predict(0x400));
    }

    #[test]
    fn repeated_hits_predict_hit() {
        let mut lmp = LoadMissPredictor::new(64, 16);
        for _ in 0..8 {
            lmp.update(0x400, &served(Level::L2C));
        }
        assert!(!lmp.predict(0x400));
    }
}
