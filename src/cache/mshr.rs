use crate::address;
use crate::packet::{AccessKind, Packet};

/// One outstanding miss and everyone waiting on it.
#[derive(Debug)]
pub struct Entry {
    pub cpu: usize,
    pub block_addr: address,
    /// The request forwarded downstream; upgraded in place when a stricter
    /// request merges onto an outstanding prefetch.
    pub packet: Packet,
    pub allocation_cycle: u64,
    /// Set once the lower level reported completion.
    pub ready_cycle: Option<u64>,
    /// Subscribers in allocation order, including the originator.
    pub subscribers: Vec<Subscriber>,
}

#[derive(Debug)]
pub struct Subscriber {
    pub packet: Packet,
    /// Sectored caches: requested word range for partial wake-up.
    pub word_range: Option<(u16, u16)>,
}

/// Miss status holding registers of one cache.
///
/// At most one entry exists per `(cpu, block address)`; later requests for
/// the same block attach as subscribers and wake in allocation order.
#[derive(Debug, Default)]
pub struct Table {
    entries: Vec<Entry>,
    capacity: usize,
}

impl Table {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    #[must_use]
    pub fn probe(&self, cpu: usize, block_addr: address) -> Option<&Entry> {
        self.entries
            .iter()
            .find(|entry| entry.cpu == cpu && entry.block_addr == block_addr)
    }

    pub fn probe_mut(&mut self, cpu: usize, block_addr: address) -> Option<&mut Entry> {
        self.entries
            .iter_mut()
            .find(|entry| entry.cpu == cpu && entry.block_addr == block_addr)
    }

    /// Allocates a fresh entry: `forwarded` is the request sent downstream,
    /// `subscriber` the original packet awaiting the fill.
    pub fn allocate(
        &mut self,
        block_addr: address,
        forwarded: Packet,
        subscriber: Packet,
        word_range: Option<(u16, u16)>,
        cycle: u64,
    ) -> Result<&mut Entry, (Packet, Packet)> {
        if self.full() {
            return Err((forwarded, subscriber));
        }
        debug_assert!(
            self.probe(forwarded.cpu, block_addr).is_none(),
            "duplicate MSHR entry for {block_addr:#x}"
        );
        self.entries.push(Entry {
            cpu: forwarded.cpu,
            block_addr,
            packet: forwarded,
            allocation_cycle: cycle,
            ready_cycle: None,
            subscribers: vec![Subscriber {
                packet: subscriber,
                word_range,
            }],
        });
        Ok(self.entries.last_mut().unwrap())
    }

    /// Attaches a request to the outstanding entry for its block.
    ///
    /// A demand merging onto a prefetch upgrades the in-flight request so
    /// the fill is treated as demand traffic.
    pub fn merge(&mut self, cpu: usize, block_addr: address, packet: Packet, word_range: Option<(u16, u16)>) {
        let entry = self
            .probe_mut(cpu, block_addr)
            .expect("merge without outstanding entry");
        if entry.packet.kind == AccessKind::Prefetch && packet.is_demand() {
            entry.packet.kind = packet.kind;
            entry.packet.fill_level = packet.fill_level;
            entry.packet.ip = packet.ip;
            entry.packet.instr_id = packet.instr_id;
        }
        entry.subscribers.push(Subscriber { packet, word_range });
    }

    /// Lower level reported data; the fill becomes visible `fill_latency`
    /// cycles later.
    pub fn mark_ready(&mut self, cpu: usize, block_addr: address, ready_cycle: u64, served_from: crate::packet::Level) {
        if let Some(entry) = self.probe_mut(cpu, block_addr) {
            entry.ready_cycle = Some(ready_cycle);
            entry.packet.serve_from(served_from);
        } else {
            log::debug!("spurious fill for {block_addr:#x}");
        }
    }

    /// Oldest entry whose fill has become visible, in allocation order.
    pub fn pop_ready(&mut self, cycle: u64) -> Option<Entry> {
        let idx = self
            .entries
            .iter()
            .position(|entry| entry.ready_cycle.is_some_and(|ready| ready <= cycle))?;
        Some(self.entries.remove(idx))
    }

    /// Puts a drained entry back at the head of the ready order after a
    /// downstream stall (e.g. the victim writeback found a full queue).
    pub fn push_front(&mut self, entry: Entry) {
        self.entries.insert(0, entry);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entry> {
        self.entries.iter()
    }

    /// Panics when an entry overstays; a stuck MSHR is a modeling bug.
    pub fn check_for_stuck(&self, cycle: u64, max_fill_latency: u64) {
        for entry in &self.entries {
            assert!(
                cycle.saturating_sub(entry.allocation_cycle) <= max_fill_latency,
                "MSHR entry for {:#x} allocated at {} still unfilled at {}",
                entry.block_addr,
                entry.allocation_cycle,
                cycle,
            );
        }
    }
}

impl std::fmt::Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.entries.len(), self.capacity)
    }
}

#[cfg(test)]
mod tests {
    use super::Table;
    use crate::packet::{AccessKind, Level, Packet, Requester};

    fn load(addr: u64) -> Packet {
        let mut packet = Packet::new(0, AccessKind::Load, addr, addr);
        packet.requester = Requester::Core;
        packet
    }

    #[test]
    fn coalesces_to_one_entry() {
        // Two demand loads to 0x1000 at cycles 10 and 12 share one MSHR.
        let mut mshrs = Table::new(4);
        mshrs.allocate(0x1000, load(0x1000), load(0x1000), None, 10).unwrap();
        assert!(mshrs.probe(0, 0x1000).is_some());
        mshrs.merge(0, 0x1000, load(0x1008), None);

        assert_eq!(mshrs.len(), 1);
        let entry = mshrs.probe(0, 0x1000).unwrap();
        assert_eq!(entry.subscribers.len(), 2);
        assert_eq!(entry.allocation_cycle, 10);
    }

    #[test]
    fn fill_wakes_all_subscribers_once() {
        let mut mshrs = Table::new(4);
        mshrs.allocate(0x1000, load(0x1000), load(0x1000), None, 10).unwrap();
        mshrs.merge(0, 0x1000, load(0x1000), None);

        assert!(mshrs.pop_ready(99).is_none());
        mshrs.mark_ready(0, 0x1000, 100, Level::Dram);
        assert!(mshrs.pop_ready(99).is_none());

        let entry = mshrs.pop_ready(100).unwrap();
        assert_eq!(entry.subscribers.len(), 2);
        assert!(entry.packet.went_offchip);
        assert!(mshrs.pop_ready(100).is_none());
    }

    #[test]
    fn demand_upgrades_outstanding_prefetch() {
        let mut mshrs = Table::new(4);
        let mut prefetch = Packet::new(0, AccessKind::Prefetch, 0x2000, 0x2000);
        prefetch.requester = Requester::None;
        mshrs.allocate(0x2000, prefetch.clone(), prefetch, None, 5).unwrap();

        mshrs.merge(0, 0x2000, load(0x2000), None);
        assert_eq!(mshrs.probe(0, 0x2000).unwrap().packet.kind, AccessKind::Load);
    }

    #[test]
    fn rejects_when_full() {
        let mut mshrs = Table::new(1);
        mshrs.allocate(0x1000, load(0x1000), load(0x1000), None, 0).unwrap();
        assert!(mshrs.allocate(0x2000, load(0x2000), load(0x2000), None, 0).is_err());
    }
}
