use crate::config;
use crate::packet::{AccessKind, Packet, Requester};
use crate::predictors::offchip::UarchState;
use crate::predictors::{IrregularPredictor, OffchipPredictor};
use crate::translate::{Fault, Translator};
use crate::{address, block_addr, LOG2_PAGE_SIZE};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use trace_model::InstructionReader;

const RECENT_PC_WINDOW: usize = 4;
const ISSUE_WIDTH: usize = 4;
const PENDING_HIGH_WATER: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Warmup,
    Simulation,
    Done,
}

/// Tallies where this core's loads get served and flags the level that
/// dominates once its share crosses the configured thresholds.
#[derive(Debug, Clone)]
pub struct PopularLevelDetector {
    threshold_1: u64,
    threshold_2: u64,
    counts: [u64; 6],
}

impl PopularLevelDetector {
    #[must_use]
    pub fn new(threshold_1: u64, threshold_2: u64) -> Self {
        Self {
            threshold_1,
            threshold_2,
            counts: [0; 6],
        }
    }

    pub fn record(&mut self, level: crate::packet::Level) {
        self.counts[level as usize] += 1;
    }

    fn leader(&self) -> Option<(usize, u64)> {
        self.counts
            .iter()
            .copied()
            .enumerate()
            .max_by_key(|(_, count)| *count)
            .filter(|(_, count)| *count > 0)
    }

    /// The dominating level once it has crossed the first threshold.
    #[must_use]
    pub fn popular_level(&self) -> Option<crate::packet::Level> {
        use strum::IntoEnumIterator;
        let (idx, count) = self.leader()?;
        (count >= self.threshold_1).then(|| crate::packet::Level::iter().nth(idx))?
    }

    /// Whether the popular level holds with high confidence.
    #[must_use]
    pub fn high_confidence(&self) -> bool {
        self.leader()
            .is_some_and(|(_, count)| count >= self.threshold_2)
    }

    #[must_use]
    pub fn counts(&self) -> &[u64; 6] {
        &self.counts
    }

    pub fn clear(&mut self) {
        self.counts = [0; 6];
    }
}

/// Which first-level cache an access targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    L1i,
    L1d,
    Sdc,
}

#[derive(Debug)]
pub struct PreparedAccess {
    pub target: Target,
    pub packet: Packet,
}

/// Issue-time capture of a demand load, consumed at completion to train
/// the off-chip predictor.
struct LedgerEntry {
    state: UarchState,
    sum: f32,
    predicted: bool,
    ip: u64,
    vpage: u64,
}

/// Thin trace-driven front-end of one core: produces demand requests for
/// the first-level caches, counts retirement, and keeps the PC/VPN
/// histories the off-chip predictor samples.
pub struct Core {
    pub cpu: usize,
    reader: InstructionReader,
    pub irreg_arrays: Vec<(u64, u64)>,

    pub offchip: Arc<Mutex<OffchipPredictor>>,
    pub irreg_pred: IrregularPredictor,
    pub pld: PopularLevelDetector,
    sdc_enabled: bool,
    hermes: config::Hermes,

    warmup_instructions: u64,
    simulation_instructions: u64,
    retired: u64,
    instr_id: u64,
    stall_until: u64,
    page_table_latency: u64,
    swap_latency: u64,

    recent_pcs: VecDeque<u64>,
    last_fetch_block: address,
    ledger: HashMap<u64, LedgerEntry>,

    pending: VecDeque<PreparedAccess>,
    pub ddrp_probes: Vec<address>,

    pub sim: stats::Sim,
    pub minor_faults: u64,
    pub major_faults: u64,
}

impl Core {
    pub fn new(
        cpu: usize,
        reader: InstructionReader,
        offchip: Arc<Mutex<OffchipPredictor>>,
        irreg_pred: IrregularPredictor,
        pld: PopularLevelDetector,
        sdc_enabled: bool,
        hermes: config::Hermes,
        warmup_instructions: u64,
        simulation_instructions: u64,
        page_table_latency: u64,
        swap_latency: u64,
    ) -> Self {
        let irreg_arrays = reader.header().irreg_arrays.clone();
        Self {
            cpu,
            reader,
            irreg_arrays,
            offchip,
            irreg_pred,
            pld,
            sdc_enabled,
            hermes,
            warmup_instructions,
            simulation_instructions,
            retired: 0,
            instr_id: 0,
            stall_until: 0,
            page_table_latency,
            swap_latency,
            recent_pcs: VecDeque::with_capacity(RECENT_PC_WINDOW),
            last_fetch_block: 0,
            ledger: HashMap::new(),
            pending: VecDeque::new(),
            ddrp_probes: Vec::new(),
            sim: stats::Sim::default(),
            minor_faults: 0,
            major_faults: 0,
        }
    }

    #[must_use]
    pub fn retired(&self) -> u64 {
        self.retired
    }

    #[must_use]
    pub fn warmup_complete(&self) -> bool {
        self.retired >= self.warmup_instructions
    }

    #[must_use]
    pub fn simulation_complete(&self) -> bool {
        self.retired >= self.warmup_instructions + self.simulation_instructions
    }

    #[must_use]
    pub fn stalled(&self, cycle: u64) -> bool {
        self.stall_until > cycle
    }

    /// Decodes up to the issue width of instructions into prepared
    /// accesses; translation faults stall the core.
    pub fn prepare(&mut self, cycle: u64, translator: &mut Translator) -> Result<(), trace_model::Error> {
        if self.pending.len() >= PENDING_HIGH_WATER || self.simulation_complete() {
            return Ok(());
        }

        for _ in 0..ISSUE_WIDTH {
            if self.stalled(cycle) {
                break;
            }
            let instruction = self.reader.next_instruction()?;
            self.instr_id += 1;
            self.retired += 1;
            self.sim.instructions += 1;

            if self.recent_pcs.len() >= RECENT_PC_WINDOW {
                self.recent_pcs.pop_front();
            }
            self.recent_pcs.push_back(instruction.ip);

            self.fetch(cycle, &instruction, translator);

            for (data_index, reference) in instruction.memory_references().enumerate() {
                let translation = translator.translate(self.cpu, reference.vaddr);
                match translation.fault {
                    Fault::Minor => {
                        self.minor_faults += 1;
                        self.stall_until = cycle + self.page_table_latency;
                    }
                    Fault::Major => {
                        self.major_faults += 1;
                        self.stall_until = cycle + self.swap_latency;
                    }
                    Fault::None => {}
                }

                if reference.is_store {
                    self.issue_store(cycle, instruction.ip, reference.vaddr, translation.paddr);
                } else {
                    self.issue_load(
                        cycle,
                        instruction.ip,
                        data_index as u64,
                        reference.vaddr,
                        translation.paddr,
                    );
                }
            }
        }
        Ok(())
    }

    fn fetch(&mut self, cycle: u64, instruction: &trace_model::Instruction, translator: &mut Translator) {
        let fetch_block = block_addr(instruction.ip);
        if fetch_block == self.last_fetch_block {
            return;
        }
        self.last_fetch_block = fetch_block;
        let translation = translator.translate(self.cpu, instruction.ip);

        let mut packet = Packet::new(self.cpu, AccessKind::Load, translation.paddr, instruction.ip);
        packet.ip = instruction.ip;
        packet.instr_id = self.instr_id;
        packet.birth_cycle = cycle;
        packet.requester = Requester::None;
        self.pending.push_back(PreparedAccess {
            target: Target::L1i,
            packet,
        });
    }

    fn issue_load(&mut self, cycle: u64, ip: u64, data_index: u64, vaddr: address, paddr: address) {
        let mut packet = Packet::new(self.cpu, AccessKind::Load, paddr, vaddr);
        packet.ip = ip;
        packet.instr_id = self.instr_id;
        packet.birth_cycle = cycle;
        packet.requester = Requester::Core;

        // Irregular-access classification decides the SDC detour.
        self.irreg_pred.update(ip, vaddr);
        let target = if self.sdc_enabled && self.irreg_pred.predict(ip) {
            Target::Sdc
        } else {
            Target::L1d
        };

        // Off-chip prediction at issue time; the capture is replayed at
        // completion for training.
        let recent: Vec<u64> = self.recent_pcs.iter().copied().collect();
        let mut offchip = self.offchip.lock().unwrap();
        let state = offchip.capture_state(ip, data_index, vaddr, paddr, &recent);
        let (predicted, sum) = offchip.predict(&state);
        packet.went_offchip_pred = predicted;
        packet.perceptron_sum = sum;

        // Fast off-chip path: probe DRAM in parallel from the core side.
        if self.hermes.enable_fsp
            && (!self.hermes.enable_delayed_fsp || self.hermes.enable_bimodal_fsp)
            && offchip.consume_from_core(sum)
        {
            self.ddrp_probes.push(packet.address);
        }
        drop(offchip);

        self.ledger.insert(
            packet.uid,
            LedgerEntry {
                state,
                sum,
                predicted,
                ip,
                vpage: vaddr >> LOG2_PAGE_SIZE,
            },
        );
        self.sim.loads_issued += 1;
        self.pending.push_back(PreparedAccess { target, packet });
    }

    fn issue_store(&mut self, cycle: u64, ip: u64, vaddr: address, paddr: address) {
        let mut packet = Packet::new(self.cpu, AccessKind::Rfo, paddr, vaddr);
        packet.ip = ip;
        packet.instr_id = self.instr_id;
        packet.birth_cycle = cycle;
        packet.requester = Requester::Core;
        self.sim.stores_issued += 1;
        self.pending.push_back(PreparedAccess { target: Target::L1d, packet });
    }

    #[must_use]
    pub fn peek_pending(&self) -> Option<&PreparedAccess> {
        self.pending.front()
    }

    pub fn pop_pending(&mut self) -> Option<PreparedAccess> {
        self.pending.pop_front()
    }

    /// A demand access completed somewhere in the hierarchy.
    pub fn complete(&mut self, packet: &Packet) {
        if packet.kind != AccessKind::Load {
            return;
        }
        if let Some(level) = packet.served_from {
            self.pld.record(level);
        }
        self.irreg_pred.feedback(packet);

        if let Some(entry) = self.ledger.remove(&packet.uid) {
            let mut offchip = self.offchip.lock().unwrap();
            offchip.train(&entry.state, entry.sum, entry.predicted, packet.went_offchip);
            offchip.record_stlb_pte(entry.ip, entry.vpage, packet.went_offchip);
        }
    }

    pub fn clear_stats(&mut self) {
        self.sim = stats::Sim::default();
        self.minor_faults = 0;
        self.major_faults = 0;
        self.offchip.lock().unwrap().clear_stats();
        self.irreg_pred.clear_stats();
        self.pld.clear();
    }
}
