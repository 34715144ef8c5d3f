use crate::hash::{fnv1a64, folded_xor, jenkins};
use crate::packet::Packet;
use crate::{address, LOG2_BLOCK_SIZE, LOG2_PAGE_SIZE};
use bitvec::vec::BitVec;
use std::collections::VecDeque;

const PAGE_BUFFER_SETS: usize = 64;
const PAGE_BUFFER_WAYS: usize = 16;
const HISTORY_DEPTH: usize = 4;
const WEIGHT_TABLE_SIZE: usize = 1 << 12;
const WEIGHT_MAX: i32 = 31;
const WEIGHT_MIN: i32 = -32;
/// Training margin: weights keep adjusting while the sum is weaker than
/// this, even on correct predictions.
const ACTIVATION_MARGIN: f32 = 17.0;
const STLB_DIM: usize = 0x40;
const STLB_THRESHOLD: u32 = 15;

/// Feature kinds selectable from the configuration `features[]` arrays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feature {
    Pc,
    DataIndex,
    VirtualAddress,
    VirtualPage,
    PageOffset,
    ClOffset,
    ClWordOffset,
    ClDwordOffset,
    FirstAccess,
    LastNLoadPcs,
    LastNPcs,
    LastNVpns,
}

impl Feature {
    /// Config encodes features by ordinal.
    #[must_use]
    pub fn from_id(id: u32) -> Option<Self> {
        use Feature::*;
        [
            Pc,
            DataIndex,
            VirtualAddress,
            VirtualPage,
            PageOffset,
            ClOffset,
            ClWordOffset,
            ClDwordOffset,
            FirstAccess,
            LastNLoadPcs,
            LastNPcs,
            LastNVpns,
        ]
        .get(id as usize)
        .copied()
    }
}

/// Micro-architectural state captured at issue time, both for prediction
/// and for replaying the same features during training.
#[derive(Debug, Clone, Default)]
pub struct UarchState {
    pub pc: u64,
    pub data_index: u64,
    pub vaddr: address,
    pub vpage: u64,
    pub voffset: u64,
    pub cl_offset: u64,
    pub cl_word_offset: u64,
    pub cl_dword_offset: u64,
    pub first_access: bool,
    pub last_n_load_pc_sig: u64,
    pub last_n_pc_sig: u64,
    pub last_n_vpn_sig: u64,
}

impl UarchState {
    fn feature_value(&self, feature: Feature) -> u64 {
        match feature {
            Feature::Pc => self.pc,
            Feature::DataIndex => self.data_index,
            Feature::VirtualAddress => self.vaddr,
            Feature::VirtualPage => self.vpage,
            Feature::PageOffset => self.voffset,
            Feature::ClOffset => self.cl_offset,
            Feature::ClWordOffset => self.cl_word_offset,
            Feature::ClDwordOffset => self.cl_dword_offset,
            Feature::FirstAccess => u64::from(self.first_access),
            Feature::LastNLoadPcs => self.last_n_load_pc_sig,
            Feature::LastNPcs => self.last_n_pc_sig,
            Feature::LastNVpns => self.last_n_vpn_sig,
        }
    }
}

/// One perceptron: a signed saturating weight table per feature.
struct Perceptron {
    features: Vec<Feature>,
    weights: Vec<Vec<i32>>,
    threshold: f32,
}

impl Perceptron {
    fn new(features: Vec<Feature>, threshold: f32) -> Self {
        let weights = vec![vec![0; WEIGHT_TABLE_SIZE]; features.len()];
        Self {
            features,
            weights,
            threshold,
        }
    }

    fn index(value: u64) -> usize {
        jenkins(u64::from(folded_xor(value, 2))) as usize % WEIGHT_TABLE_SIZE
    }

    fn sum(&self, state: &UarchState) -> f32 {
        self.features
            .iter()
            .enumerate()
            .map(|(i, &feature)| self.weights[i][Self::index(state.feature_value(feature))])
            .sum::<i32>() as f32
    }

    fn predict(&self, state: &UarchState) -> (bool, f32) {
        let sum = self.sum(state);
        (sum >= self.threshold, sum)
    }

    /// +-1 updates with saturation, applied on a mispredict or whenever the
    /// sum sits inside the activation margin.
    fn train(&mut self, state: &UarchState, sum: f32, predicted: bool, actual: bool) {
        let mispredicted = predicted != actual;
        let weak = sum.abs() < ACTIVATION_MARGIN;
        if !mispredicted && !weak {
            return;
        }
        let step = if actual { 1 } else { -1 };
        for (i, &feature) in self.features.iter().enumerate() {
            let idx = Self::index(state.feature_value(feature));
            let weight = &mut self.weights[i][idx];
            *weight = (*weight + step).clamp(WEIGHT_MIN, WEIGHT_MAX);
        }
    }
}

/// Set-associative LRU cache of per-page touch bitmaps; detects the first
/// access to each block offset of a page.
struct PageBuffer {
    sets: Vec<VecDeque<PageEntry>>,
}

struct PageEntry {
    page: u64,
    accessed: BitVec,
}

impl PageBuffer {
    fn new() -> Self {
        Self {
            sets: (0..PAGE_BUFFER_SETS).map(|_| VecDeque::new()).collect(),
        }
    }

    /// Returns whether `voffset` is the first touch of its slot in `vpage`.
    fn lookup(&mut self, vpage: u64, voffset: u64) -> bool {
        let set = fnv1a64(vpage) as usize % self.sets.len();
        let ways = &mut self.sets[set];
        let voffset = voffset as usize % (crate::PAGE_BLOCKS as usize);

        if let Some(at) = ways.iter().position(|entry| entry.page == vpage) {
            let mut entry = ways.remove(at).unwrap();
            let first = !entry.accessed[voffset];
            entry.accessed.set(voffset, true);
            ways.push_back(entry);
            return first;
        }

        if ways.len() >= PAGE_BUFFER_WAYS {
            ways.pop_front();
        }
        let mut accessed = BitVec::repeat(false, crate::PAGE_BLOCKS as usize);
        accessed.set(voffset, true);
        ways.push_back(PageEntry {
            page: vpage,
            accessed,
        });
        true
    }
}

/// Per-CPU off-chip predictor: one perceptron for demand loads (two
/// thresholds) and an independent one for prefetches, plus the page
/// buffers feeding the first-access feature and a small STLB-PTE history.
pub struct OffchipPredictor {
    cpu: usize,

    demand: Perceptron,
    prefetch: Perceptron,
    tau_1: f32,
    tau_2: f32,

    page_buffer: PageBuffer,
    pf_page_buffer: PageBuffer,

    last_n_load_pcs: VecDeque<u64>,
    last_n_vpns: VecDeque<u64>,

    stlb_history: Vec<Vec<u32>>,

    pub stats_demand: stats::OffchipPrediction,
    pub stats_prefetch: stats::OffchipPrediction,
}

impl OffchipPredictor {
    #[must_use]
    pub fn new(
        cpu: usize,
        demand_features: &[u32],
        tau_1: f32,
        tau_2: f32,
        prefetch_features: &[u32],
        prefetch_threshold: f32,
    ) -> Self {
        let decode = |ids: &[u32]| -> Vec<Feature> {
            let features: Vec<Feature> = ids.iter().filter_map(|&id| Feature::from_id(id)).collect();
            if features.is_empty() {
                // Default feature mix of the reference configuration.
                vec![
                    Feature::PageOffset,
                    Feature::FirstAccess,
                    Feature::LastNLoadPcs,
                    Feature::LastNVpns,
                    Feature::Pc,
                ]
            } else {
                features
            }
        };
        Self {
            cpu,
            demand: Perceptron::new(decode(demand_features), tau_2),
            prefetch: Perceptron::new(decode(prefetch_features), prefetch_threshold),
            tau_1,
            tau_2,
            page_buffer: PageBuffer::new(),
            pf_page_buffer: PageBuffer::new(),
            last_n_load_pcs: VecDeque::with_capacity(HISTORY_DEPTH),
            last_n_vpns: VecDeque::with_capacity(HISTORY_DEPTH),
            stlb_history: vec![vec![0; STLB_DIM]; STLB_DIM],
            stats_demand: stats::OffchipPrediction::default(),
            stats_prefetch: stats::OffchipPrediction::default(),
        }
    }

    #[must_use]
    pub fn cpu(&self) -> usize {
        self.cpu
    }

    /// Captures the feature state of a demand load at issue time.
    ///
    /// `recent_pcs` is the ROB-walk window ending at the load itself.
    pub fn capture_state(
        &mut self,
        pc: u64,
        data_index: u64,
        vaddr: address,
        paddr: address,
        recent_pcs: &[u64],
    ) -> UarchState {
        let vpage = vaddr >> LOG2_PAGE_SIZE;
        let voffset = (vaddr >> LOG2_BLOCK_SIZE) & ((1 << (LOG2_PAGE_SIZE - LOG2_BLOCK_SIZE)) - 1);
        let cl_offset = vaddr & ((1 << LOG2_BLOCK_SIZE) - 1);

        let first_access = self.page_buffer.lookup(vpage, voffset);

        push_capped(&mut self.last_n_load_pcs, pc);
        push_capped(&mut self.last_n_vpns, paddr >> LOG2_PAGE_SIZE);

        UarchState {
            pc,
            data_index,
            vaddr,
            vpage,
            voffset,
            cl_offset,
            cl_word_offset: cl_offset >> 2,
            cl_dword_offset: cl_offset >> 4,
            first_access,
            last_n_load_pc_sig: signature(self.last_n_load_pcs.iter()),
            last_n_pc_sig: signature(recent_pcs.iter()),
            last_n_vpn_sig: signature(self.last_n_vpns.iter()),
        }
    }

    /// Predicts whether a demand load misses every cache level.
    pub fn predict(&mut self, state: &UarchState) -> (bool, f32) {
        self.demand.predict(state)
    }

    /// Prefetch-side prediction; fills the packet's feature capture.
    pub fn predict_on_prefetch(&mut self, packet: &mut Packet) -> bool {
        let vaddr = packet.v_addr;
        let vpage = vaddr >> LOG2_PAGE_SIZE;
        let voffset = (vaddr >> LOG2_BLOCK_SIZE) & ((1 << (LOG2_PAGE_SIZE - LOG2_BLOCK_SIZE)) - 1);
        let cl_offset = vaddr & ((1 << LOG2_BLOCK_SIZE) - 1);
        let first_access = self.pf_page_buffer.lookup(vpage, voffset);

        let state = UarchState {
            pc: packet.ip,
            vaddr,
            vpage,
            voffset,
            cl_offset,
            cl_word_offset: cl_offset >> 2,
            cl_dword_offset: cl_offset >> 4,
            first_access,
            ..UarchState::default()
        };
        let (prediction, sum) = self.prefetch.predict(&state);
        packet.perceptron_sum = sum;
        packet.info = Some(Box::new(state));
        prediction
    }

    /// Trains the demand perceptron on the observed outcome.
    pub fn train(&mut self, state: &UarchState, sum: f32, predicted: bool, actual: bool) {
        self.stats_demand.record(predicted, actual);
        self.demand.train(state, sum, predicted, actual);
    }

    /// Trains the prefetch perceptron from a completed prefetch packet.
    pub fn train_on_prefetch(&mut self, packet: &Packet) {
        let Some(state) = packet.info.as_deref() else {
            return;
        };
        let predicted = packet.went_offchip_pred;
        let actual = packet.went_offchip;
        self.stats_prefetch.record(predicted, actual);
        self.prefetch
            .train(state, packet.perceptron_sum, predicted, actual);
    }

    /// The prediction strength gates where the fast DRAM probe is issued.
    #[must_use]
    pub fn consume_from_core(&self, sum: f32) -> bool {
        sum >= self.tau_1
    }

    #[must_use]
    pub fn consume_from_l1d(&self, sum: f32) -> bool {
        sum >= self.tau_2
    }

    /// STLB-PTE side prediction from the hashed PC/VPN history matrix.
    #[must_use]
    pub fn predict_on_stlb_pte(&self, pc: u64, vpage: u64) -> bool {
        let idx_1 = jenkins(u64::from(folded_xor(pc, 2))) as usize % STLB_DIM;
        let idx_2 = jenkins(u64::from(folded_xor(vpage, 2))) as usize % STLB_DIM;
        self.stlb_history[idx_1][idx_2] > STLB_THRESHOLD
    }

    pub fn record_stlb_pte(&mut self, pc: u64, vpage: u64, went_offchip: bool) {
        let idx_1 = jenkins(u64::from(folded_xor(pc, 2))) as usize % STLB_DIM;
        let idx_2 = jenkins(u64::from(folded_xor(vpage, 2))) as usize % STLB_DIM;
        let counter = &mut self.stlb_history[idx_1][idx_2];
        if went_offchip {
            *counter = counter.saturating_add(1);
        } else {
            *counter = counter.saturating_sub(1);
        }
    }

    pub fn clear_stats(&mut self) {
        self.stats_demand = stats::OffchipPrediction::default();
        self.stats_prefetch = stats::OffchipPrediction::default();
    }
}

fn push_capped(history: &mut VecDeque<u64>, value: u64) {
    if history.len() >= HISTORY_DEPTH {
        history.pop_front();
    }
    history.push_back(value);
}

/// Rolling shift-xor signature over a history window.
fn signature<'a>(values: impl Iterator<Item = &'a u64>) -> u64 {
    values.fold(0u64, |sig, &value| (sig << 1) ^ value)
}

#[cfg(test)]
mod tests {
    use super::{OffchipPredictor, UarchState};

    fn predictor() -> OffchipPredictor {
        OffchipPredictor::new(0, &[0, 8], 1.0, 3.0, &[0], 2.0)
    }

    #[test]
    fn training_moves_weights_toward_actual() {
        // Two features, zero weights, threshold 0: five off-chip outcomes
        // each add +1 per feature (the sums stay inside the activation
        // margin), so both weights end at +5.
        let mut pred = OffchipPredictor::new(0, &[0, 8], 0.0, 0.0, &[0], 0.0);
        let state = UarchState {
            pc: 0x400,
            first_access: true,
            ..UarchState::default()
        };
        for _ in 0..5 {
            let (predicted, sum) = pred.predict(&state);
            pred.train(&state, sum, predicted, true);
        }
        let (_, sum) = pred.predict(&state);
        assert_eq!(sum, 10.0);
    }

    #[test]
    fn strong_correct_predictions_stop_training() {
        let mut pred = OffchipPredictor::new(0, &[0, 8], 0.0, 0.0, &[0], 0.0);
        let state = UarchState {
            pc: 0x400,
            ..UarchState::default()
        };
        for _ in 0..40 {
            let (predicted, sum) = pred.predict(&state);
            pred.train(&state, sum, predicted, true);
        }
        // saturates at the margin instead of the counter limits
        let (_, sum) = pred.predict(&state);
        assert!(sum >= 17.0 && sum < 20.0);
    }

    #[test]
    fn first_access_bit_clears_on_revisit() {
        let mut pred = predictor();
        let first = pred.capture_state(0x400, 0, 0x1000, 0x2000, &[]);
        let second = pred.capture_state(0x400, 0, 0x1000, 0x2000, &[]);
        assert!(first.first_access);
        assert!(!second.first_access);
    }

    #[test]
    fn stlb_history_saturates_up() {
        let mut pred = predictor();
        assert!(!pred.predict_on_stlb_pte(0x400, 7));
        for _ in 0..20 {
            pred.record_stlb_pte(0x400, 7, true);
        }
        assert!(pred.predict_on_stlb_pte(0x400, 7));
    }
}
