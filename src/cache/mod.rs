pub mod block;
pub mod blocked;
pub mod mshr;
pub mod sectored;

pub use block::{Block, Footprint};
pub use blocked::Blocked;
pub use sectored::Sectored;

use crate::address;
use crate::fifo::Fifo;
use crate::fill_path::PathTargets;
use crate::instrument::{MemoryRegion, UsageTracker};
use crate::packet::{AccessKind, AccessStatus, Level, Packet};
use crate::prefetch::Prefetcher;
use crate::replacement::ReplacementPolicy;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

/// Refined hit taxonomy; blocked caches only ever see `LocHit`/`LineMiss`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum HitKind {
    /// Tag match and every requested word valid.
    LocHit,
    /// Tag match, some requested words already resident.
    WocHit,
    /// Tag match, sector partially valid, none of the requested words.
    HoleMiss,
    /// No tag match.
    LineMiss,
}

impl HitKind {
    #[must_use]
    pub fn is_hit(self) -> bool {
        self == Self::LocHit
    }

    #[must_use]
    pub fn tag_present(self) -> bool {
        !matches!(self, Self::LineMiss)
    }

    #[must_use]
    pub fn status(self) -> AccessStatus {
        match self {
            Self::LocHit => AccessStatus::Hit,
            Self::WocHit => AccessStatus::WordHit,
            Self::HoleMiss => AccessStatus::HoleMiss,
            Self::LineMiss => AccessStatus::Miss,
        }
    }
}

/// Snapshot of one way handed to replacement policies.
#[derive(Debug, Clone, Copy)]
pub struct WayView {
    pub valid: bool,
    pub dirty: bool,
    pub full_addr: address,
}

/// Everything a replacement policy or prefetcher fill hook may look at.
#[derive(Debug)]
pub struct AccessDescriptor<'a> {
    pub cpu: usize,
    pub set: usize,
    pub way: Option<usize>,
    pub full_addr: address,
    pub v_addr: address,
    pub victim_addr: Option<address>,
    pub ip: u64,
    pub kind: AccessKind,
    pub hit: bool,
    pub ways: &'a [WayView],
    pub cycle: u64,
}

/// Queues a packet can be pushed into at a lower level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Read,
    Write,
    Prefetch,
}

/// Mutable window onto the nodes strictly below the operating cache.
///
/// The engine implements this over the arena slice; caches never hold
/// references to each other.
pub trait Downstream {
    fn try_send(&mut self, target: usize, queue: QueueKind, packet: Packet) -> Result<(), Packet>;
    fn can_accept(&self, target: usize, queue: QueueKind) -> bool;
    /// Residency probe used by the routing oracle.
    fn resident(&self, target: usize, addr: address) -> bool;
    /// Runs the target cache's prefetcher on a synthesized descriptor
    /// (prefetch escalation across bypassed levels).
    fn escalate_prefetch(&mut self, target: usize, desc: crate::prefetch::Descriptor);
    /// Registers a predictor-issued parallel DRAM probe.
    fn ddrp_probe(&mut self, dram: usize, addr: address, request_latency: u64);
}

/// Per-cycle products the engine routes after `operate` returns.
#[derive(Debug, Default)]
pub struct CycleOutput {
    /// Completed packets, addressed by `Packet::requester`.
    pub completions: Vec<Packet>,
}

/// Geometry shared by both cache layouts.
#[derive(Debug, Clone, Copy)]
pub struct Geometry {
    pub sets: usize,
    pub ways: usize,
    pub block_size: u32,
    pub offset_bits: u32,
    pub index_bits: u32,
}

impl Geometry {
    #[must_use]
    pub fn new(sets: usize, ways: usize, block_size: u32) -> Self {
        Self {
            sets,
            ways,
            block_size,
            offset_bits: crate::hash::lg2(u64::from(block_size)),
            index_bits: crate::hash::lg2(sets as u64),
        }
    }

    #[must_use]
    pub fn set_index(&self, addr: address) -> usize {
        ((addr >> self.offset_bits) as usize) & (self.sets - 1)
    }

    #[must_use]
    pub fn block_addr(&self, addr: address) -> address {
        addr & !(u64::from(self.block_size) - 1)
    }

    /// Sector tag: the address shifted past offset and index bits.
    #[must_use]
    pub fn tag(&self, addr: address) -> address {
        addr >> (self.offset_bits + self.index_bits)
    }
}

/// State common to the blocked and sectored layouts: queues, MSHRs,
/// plugin bindings, instrumentation and the downstream wiring.
pub struct CacheCore {
    pub name: String,
    pub level: Level,
    pub cpu: usize,
    pub node_id: usize,
    pub geometry: Geometry,
    pub hit_latency: u64,
    pub fill_latency: u64,
    pub read_width: usize,
    pub write_width: usize,
    pub fill_width: usize,

    pub rq: Fifo<Packet>,
    pub wq: Fifo<Packet>,
    pub pq: Fifo<Packet>,
    pub mshrs: mshr::Table,

    pub replacement: Box<dyn ReplacementPolicy>,
    pub prefetcher: Box<dyn Prefetcher>,
    pub targets: PathTargets,

    pub stats: Arc<Mutex<stats::Cache>>,
    pub usage: UsageTracker,
    pub region: MemoryRegion,
    pub warmup_complete: Arc<AtomicBool>,
}

impl std::fmt::Debug for CacheCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheCore")
            .field("name", &self.name)
            .field("level", &self.level)
            .field("rq", &self.rq.len())
            .field("wq", &self.wq.len())
            .field("pq", &self.pq.len())
            .field("mshrs", &self.mshrs.len())
            .finish()
    }
}

impl CacheCore {
    pub fn stats_inc(&self, kind: AccessKind, status: AccessStatus) {
        self.stats.lock().unwrap().inc(kind, status, 1);
    }

    #[must_use]
    pub fn warmed_up(&self) -> bool {
        self.warmup_complete
            .load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Inbound demand/translation traffic. Rejection models back-pressure.
    pub fn add_read_queue(&mut self, mut packet: Packet, cycle: u64) -> Result<(), Packet> {
        packet.event_cycle = cycle + self.hit_latency;
        self.rq.enqueue(packet).map_err(|packet| {
            self.stats_inc(packet.kind, AccessStatus::ReservationFail);
            packet
        })
    }

    /// Inbound writebacks from upstream evictions.
    pub fn add_write_queue(&mut self, mut packet: Packet, cycle: u64) -> Result<(), Packet> {
        packet.event_cycle = cycle + self.hit_latency;
        self.wq.enqueue(packet).map_err(|packet| {
            self.stats_inc(packet.kind, AccessStatus::ReservationFail);
            packet
        })
    }

    /// Inbound prefetch hints.
    pub fn add_prefetch_queue(&mut self, mut packet: Packet, cycle: u64) -> Result<(), Packet> {
        packet.event_cycle = cycle + self.hit_latency;
        self.pq.enqueue(packet).map_err(|packet| {
            self.stats_inc(packet.kind, AccessStatus::ReservationFail);
            packet
        })
    }
}

/// The two storage layouts behind one dispatch surface.
///
/// Tagged dispatch is deliberate: the data arrays differ, while the
/// prefetcher/replacement plugins stay trait objects behind `CacheCore`.
pub enum Model {
    Blocked(Blocked),
    Sectored(Sectored),
}

impl Model {
    #[must_use]
    pub fn core(&self) -> &CacheCore {
        match self {
            Self::Blocked(cache) => &cache.core,
            Self::Sectored(cache) => &cache.core,
        }
    }

    pub fn core_mut(&mut self) -> &mut CacheCore {
        match self {
            Self::Blocked(cache) => &mut cache.core,
            Self::Sectored(cache) => &mut cache.core,
        }
    }

    pub fn operate(&mut self, cycle: u64, down: &mut dyn Downstream, out: &mut CycleOutput) {
        match self {
            Self::Blocked(cache) => cache.operate(cycle, down, out),
            Self::Sectored(cache) => cache.operate(cycle, down, out),
        }
    }

    /// Completion reported by the level below.
    pub fn return_data(&mut self, packet: Packet, cycle: u64) {
        match self {
            Self::Blocked(cache) => cache.return_data(packet, cycle),
            Self::Sectored(cache) => cache.return_data(packet, cycle),
        }
    }

    /// Residency probe (no state update).
    #[must_use]
    pub fn resident(&self, addr: address) -> bool {
        match self {
            Self::Blocked(cache) => cache.resident(addr),
            Self::Sectored(cache) => cache.resident(addr),
        }
    }

    pub fn escalate_prefetch(&mut self, desc: crate::prefetch::Descriptor) {
        match self {
            Self::Blocked(cache) => cache.prefetch_on_upstream(desc),
            Self::Sectored(cache) => cache.prefetch_on_upstream(desc),
        }
    }

    /// Inbound demand traffic; sectored caches slice sector-crossing
    /// requests here.
    pub fn add_read_queue(&mut self, packet: Packet, cycle: u64) -> Result<(), Packet> {
        match self {
            Self::Blocked(cache) => cache.core.add_read_queue(packet, cycle),
            Self::Sectored(cache) => cache.add_read_queue(packet, cycle),
        }
    }

    pub fn add_write_queue(&mut self, packet: Packet, cycle: u64) -> Result<(), Packet> {
        self.core_mut().add_write_queue(packet, cycle)
    }

    pub fn add_prefetch_queue(&mut self, packet: Packet, cycle: u64) -> Result<(), Packet> {
        self.core_mut().add_prefetch_queue(packet, cycle)
    }

    /// Sanity sweep over the data arrays; panics on a broken invariant.
    pub fn check_invariants(&self) {
        match self {
            Self::Blocked(cache) => cache.check_invariants(),
            Self::Sectored(cache) => cache.check_invariants(),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::fifo::Fifo;
    use crate::fill_path::PathTargets;

    /// Downstream stub recording what a cache under test sends below.
    #[derive(Default)]
    pub struct StubDown {
        pub sent: Vec<(usize, QueueKind, Packet)>,
        pub reject: bool,
        pub resident_in: Vec<usize>,
    }

    impl Downstream for StubDown {
        fn try_send(
            &mut self,
            target: usize,
            queue: QueueKind,
            packet: Packet,
        ) -> Result<(), Packet> {
            if self.reject {
                return Err(packet);
            }
            self.sent.push((target, queue, packet));
            Ok(())
        }

        fn can_accept(&self, _target: usize, _queue: QueueKind) -> bool {
            !self.reject
        }

        fn resident(&self, target: usize, _addr: address) -> bool {
            self.resident_in.contains(&target)
        }

        fn escalate_prefetch(&mut self, _target: usize, _desc: crate::prefetch::Descriptor) {}

        fn ddrp_probe(&mut self, _dram: usize, _addr: address, _request_latency: u64) {}
    }

    pub fn make_core(level: Level, sets: usize, ways: usize, block_size: u32) -> CacheCore {
        CacheCore {
            name: format!("test-{level}"),
            level,
            cpu: 0,
            node_id: 0,
            geometry: Geometry::new(sets, ways, block_size),
            hit_latency: 0,
            fill_latency: 0,
            read_width: 4,
            write_width: 4,
            fill_width: 4,
            rq: Fifo::new(Some(16)),
            wq: Fifo::new(Some(16)),
            pq: Fifo::new(Some(16)),
            mshrs: mshr::Table::new(8),
            replacement: Box::new(crate::replacement::lru::Lru::new(sets, ways)),
            prefetcher: Box::new(crate::prefetch::no_op::NoOp),
            targets: PathTargets {
                lower: Some(1),
                l2c: Some(1),
                llc: Some(2),
                dram: Some(3),
            },
            stats: Arc::new(Mutex::new(stats::Cache::default())),
            usage: crate::instrument::UsageTracker::new(
                sets,
                ways,
                block_size as usize,
                4,
            ),
            region: crate::instrument::MemoryRegion::new(0, 8),
            warmup_complete: Arc::new(AtomicBool::new(true)),
        }
    }
}
