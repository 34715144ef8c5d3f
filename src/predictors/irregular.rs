use crate::packet::{Level, Packet};
use crate::address;

#[derive(Debug, Clone, Default)]
struct Entry {
    valid: bool,
    repl_state: u32,
    stride: u64,
    old_addr: address,
    pc: u64,
}

#[derive(Debug, Clone, Default)]
pub struct Metrics {
    pub accesses: u64,
    pub hits: u64,
    pub misses: u64,
    pub prediction_changes: u64,
}

/// PC-keyed stride tracker flagging irregular (large-stride) loads, with a
/// PSEL feedback loop that retunes the stride threshold from where
/// requests were ultimately served.
pub struct IrregularPredictor {
    table: Vec<Vec<Entry>>,
    threshold: u64,
    stride_max: u64,
    psel: i64,
    psel_max: i64,
    latency: u8,
    prev_prediction: bool,
    metrics: Metrics,
}

impl IrregularPredictor {
    #[must_use]
    pub fn new(sets: u32, ways: u32, stride_bits: u8, psel_bits: u8, latency: u8) -> Self {
        let stride_max = (1u64 << stride_bits) - 1;
        let psel_max = (1i64 << psel_bits) - 1;
        let mut table = vec![vec![Entry::default(); ways as usize]; sets.max(1) as usize];
        for set in &mut table {
            let lru = set.len() as u32 - 1;
            for entry in set.iter_mut() {
                entry.repl_state = lru;
            }
        }
        Self {
            table,
            threshold: stride_max,
            stride_max,
            psel: psel_max >> 1,
            psel_max,
            latency,
            prev_prediction: false,
            metrics: Metrics::default(),
        }
    }

    #[must_use]
    pub fn latency(&self) -> u8 {
        self.latency
    }

    #[must_use]
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Set index keeps plain modulo over the PC; kept as the reference
    /// implementation computes it, sets-bits notwithstanding.
    fn table_index(&self, pc: u64) -> usize {
        (pc % self.table.len() as u64) as usize
    }

    pub fn update(&mut self, pc: u64, vaddr: address) {
        let set_idx = self.table_index(pc);
        let set = &mut self.table[set_idx];

        if let Some(way) = set.iter().position(|e| e.pc == pc) {
            let entry = &mut set[way];
            let stride = vaddr.abs_diff(entry.old_addr).min(self.stride_max);
            entry.stride = (entry.stride + stride).min(self.stride_max) >> 1;
            entry.old_addr = vaddr;
            Self::promote(set, way, true);
            self.metrics.hits += 1;
        } else {
            let way = set
                .iter()
                .position(|e| !e.valid || e.repl_state == set.len() as u32 - 1)
                .expect("no victim in irregular predictor set");
            set[way] = Entry {
                valid: set[way].valid,
                repl_state: set[way].repl_state,
                stride: 0,
                old_addr: vaddr,
                pc,
            };
            Self::promote(set, way, false);
            self.metrics.misses += 1;
        }
        self.metrics.accesses += 1;
    }

    fn promote(set: &mut [Entry], way: usize, hit: bool) {
        let touched = set[way].repl_state;
        for entry in set.iter_mut() {
            if entry.repl_state < touched {
                entry.repl_state += 1;
            }
        }
        set[way].repl_state = 0;
        if !hit {
            set[way].valid = true;
        }
    }

    /// `true` when the PC's averaged stride crosses the threshold.
    pub fn predict(&mut self, pc: u64) -> bool {
        let set_idx = self.table_index(pc);
        let prediction = self.table[set_idx]
            .iter()
            .find(|e| e.pc == pc)
            .map_or(false, |e| e.stride >= self.threshold);

        if prediction != self.prev_prediction {
            self.metrics.prediction_changes += 1;
        }
        self.prev_prediction = prediction;
        prediction
    }

    /// Feedback from a completed demand load on the conventional path.
    pub fn feedback(&mut self, packet: &Packet) {
        match packet.served_from {
            Some(Level::L1D | Level::Sdc) => return,
            Some(Level::L2C | Level::Llc) => {
                self.psel = (self.psel + 1).clamp(0, self.psel_max);
            }
            _ => {
                self.psel = (self.psel - 1).clamp(0, self.psel_max);
            }
        }

        let limits = (8u64, (self.stride_max >> 2).max(8));
        if self.psel == self.psel_max {
            self.threshold = (self.threshold * 2).clamp(limits.0, limits.1);
            self.psel = self.psel_max >> 1;
        } else if self.psel == 0 {
            self.threshold = (self.threshold / 2).clamp(limits.0, limits.1);
            self.psel = self.psel_max >> 1;
        }
    }

    pub fn clear_stats(&mut self) {
        self.metrics = Metrics::default();
    }
}

#[cfg(test)]
mod tests {
    use super::IrregularPredictor;

    #[test]
    fn large_strides_predict_irregular() {
        let mut pred = IrregularPredictor::new(1, 4, 20, 4, 1);
        let mut addr = 0x1000u64;
        for _ in 0..8 {
            pred.update(0x400, addr);
            addr += 1 << 21; // saturating stride
        }
        assert!(pred.predict(0x400));
    }

    #[test]
    fn sequential_strides_predict_regular() {
        let mut pred = IrregularPredictor::new(1, 4, 20, 4, 1);
        for i in 0..16u64 {
            pred.update(0x400, 0x1000 + i * 8);
        }
        assert!(!pred.predict(0x400));
    }

    #[test]
    fn unknown_pc_is_regular() {
        let mut pred = IrregularPredictor::new(4, 4, 20, 4, 1);
        assert!(!pred.predict(0xdead));
    }
}
