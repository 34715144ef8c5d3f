use crate::address;
use crate::predictors::offchip::UarchState;
use std::sync::atomic::{AtomicU64, Ordering};

pub use stats::cache::{AccessKind, AccessStatus};

static PACKET_UID: AtomicU64 = AtomicU64::new(0);

#[must_use]
pub fn generate_uid() -> u64 {
    PACKET_UID.fetch_add(1, Ordering::SeqCst)
}

/// A level of the modeled hierarchy.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, strum::Display, strum::EnumIter,
)]
pub enum Level {
    L1I,
    L1D,
    Sdc,
    L2C,
    Llc,
    Dram,
}

/// Which cache a prefetch wants the data installed into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, strum::Display)]
pub enum FillLevel {
    L1,
    L2,
    Llc,
}

/// Alternative fill paths between a first-level cache and memory.
///
/// Enumeration order is the round-robin sniffing order and the tie-break
/// order of the routing engine.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, strum::Display, strum::EnumIter,
)]
pub enum Route {
    /// Straight to DRAM, bypassing both on-chip levels below.
    Dram,
    /// Through L2C (the full conventional path).
    L2cDram,
    /// Through the LLC, bypassing L2C.
    LlcDram,
}

/// Who gets notified when the request completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requester {
    /// The issuing core (`Packet::cpu`).
    Core,
    /// A cache node in the hierarchy arena.
    Cache(usize),
    /// Fire and forget (prefetches, writebacks).
    None,
}

/// An in-flight memory request.
#[derive(Debug, Clone)]
pub struct Packet {
    pub uid: u64,
    pub cpu: usize,
    pub kind: AccessKind,
    /// Block (or sector) aligned physical address.
    pub address: address,
    pub full_addr: address,
    pub v_addr: address,
    pub ip: u64,
    pub instr_id: u64,
    pub size: u32,
    pub fill_level: FillLevel,
    pub requester: Requester,

    pub route: Option<Route>,
    pub sniffer: bool,
    pub birth_cycle: u64,
    pub death_cycle: u64,
    /// Cycle at which the owning queue may act on the packet.
    pub event_cycle: u64,

    /// Which level ultimately answered.
    pub served_from: Option<Level>,
    pub went_offchip_pred: bool,
    pub went_offchip: bool,
    pub bypassed_l2c_llc: bool,
    /// Parallel DRAM probe issued by the off-chip predictor fast path.
    pub ddrp: bool,

    /// Sectored caches: the requested word range `[lo, hi)` within the sector.
    pub word_range: Option<(u16, u16)>,
    /// Sectored caches: the slice's parent packet.
    pub parent_uid: Option<u64>,

    /// Feature snapshot for off-chip predictor training on prefetches.
    pub info: Option<Box<UarchState>>,
    pub perceptron_sum: f32,
    /// Level whose prefetcher created this packet.
    pub pf_origin: Option<Level>,
}

impl Packet {
    #[must_use]
    pub fn new(cpu: usize, kind: AccessKind, full_addr: address, v_addr: address) -> Self {
        Self {
            uid: generate_uid(),
            cpu,
            kind,
            address: crate::block_addr(full_addr),
            full_addr,
            v_addr,
            ip: 0,
            instr_id: 0,
            size: 8,
            fill_level: FillLevel::L1,
            requester: Requester::None,
            route: None,
            sniffer: false,
            birth_cycle: 0,
            death_cycle: 0,
            event_cycle: 0,
            served_from: None,
            went_offchip_pred: false,
            went_offchip: false,
            bypassed_l2c_llc: false,
            ddrp: false,
            word_range: None,
            parent_uid: None,
            info: None,
            perceptron_sum: 0.0,
            pf_origin: None,
        }
    }

    #[must_use]
    pub fn is_demand(&self) -> bool {
        matches!(self.kind, AccessKind::Load | AccessKind::Rfo)
    }

    #[must_use]
    pub fn is_prefetch(&self) -> bool {
        self.kind == AccessKind::Prefetch
    }

    /// Marks the final service point; `went_offchip` follows from it.
    pub fn serve_from(&mut self, level: Level) {
        self.served_from = Some(level);
        self.went_offchip = level == Level::Dram;
    }
}

impl std::fmt::Display for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}#{}@{:#x}(cpu{})",
            self.kind, self.uid, self.address, self.cpu
        )
    }
}

#[cfg(test)]
mod tests {
    use super::{AccessKind, Level, Packet};

    #[test]
    fn new_packet_aligns_address() {
        let packet = Packet::new(0, AccessKind::Load, 0x1234, 0x5234);
        assert_eq!(packet.address, 0x1200);
        assert_eq!(packet.full_addr, 0x1234);
    }

    #[test]
    fn serving_from_dram_flags_offchip() {
        let mut packet = Packet::new(0, AccessKind::Load, 0x40, 0x40);
        packet.serve_from(Level::Llc);
        assert!(!packet.went_offchip);
        packet.serve_from(Level::Dram);
        assert!(packet.went_offchip);
    }
}
