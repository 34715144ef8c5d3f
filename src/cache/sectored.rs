use super::blocked::HermesWiring;
use super::mshr;
use super::{AccessDescriptor, Block, CacheCore, CycleOutput, Downstream, HitKind, QueueKind, WayView};
use crate::fill_path;
use crate::instrument::ReuseTracker;
use crate::packet::{AccessKind, AccessStatus, Packet, Requester};
use crate::predictors::routing::Residency;
use crate::predictors::{LoadMissPredictor, OffchipPredictor, RoutingEngine};
use crate::prefetch::{Descriptor, FillEvent, IssueBuffer};
use crate::address;
use bitvec::vec::BitVec;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Sectored cache: a small tag array over large sectors with per-word
/// valid/dirty bits. Tag hits with missing words trigger partial fills
/// that retain the tag and only pull the requested word range.
pub struct Sectored {
    pub core: CacheCore,
    tags: Vec<Vec<address>>,
    blocks: Vec<Vec<Block>>,
    valid: Vec<Vec<BitVec>>,
    dirty: Vec<Vec<BitVec>>,

    word_granularity: u32,
    words: usize,

    pub routing: Option<RoutingEngine>,
    pub offchip: Option<Arc<Mutex<OffchipPredictor>>>,
    pub hermes: Option<HermesWiring>,
    pub lmp: LoadMissPredictor,
    pub reuse: ReuseTracker,

    /// Sliced packets waiting for all their sub-requests: uid of the
    /// parent maps to `(parent, remaining slices)`.
    pending_slices: HashMap<u64, (Packet, usize)>,
}

impl Sectored {
    #[must_use]
    pub fn new(core: CacheCore, word_granularity: u32, reuse: ReuseTracker) -> Self {
        let words = (core.geometry.block_size / word_granularity) as usize;
        let geometry = core.geometry;
        Self {
            tags: vec![vec![0; geometry.ways]; geometry.sets],
            blocks: vec![vec![Block::default(); geometry.ways]; geometry.sets],
            valid: vec![vec![BitVec::repeat(false, words); geometry.ways]; geometry.sets],
            dirty: vec![vec![BitVec::repeat(false, words); geometry.ways]; geometry.sets],
            word_granularity,
            words,
            routing: None,
            offchip: None,
            hermes: None,
            lmp: LoadMissPredictor::new(1024, 64),
            reuse,
            pending_slices: HashMap::new(),
            core,
        }
    }

    /// Requested word range `[lo, hi)` of a packet within its sector.
    fn word_range(&self, packet: &Packet) -> (u16, u16) {
        let sector_size = u64::from(self.core.geometry.block_size);
        let offset = packet.full_addr % sector_size;
        let lo = offset / u64::from(self.word_granularity);
        let hi = (offset + u64::from(packet.size.max(1)) + u64::from(self.word_granularity) - 1)
            / u64::from(self.word_granularity);
        (lo as u16, (hi as u16).min(self.words as u16))
    }

    fn way_valid(&self, set: usize, way: usize) -> bool {
        self.valid[set][way].any()
    }

    fn tag_match(&self, set: usize, addr: address) -> Option<usize> {
        let tag = self.core.geometry.tag(addr);
        (0..self.core.geometry.ways)
            .find(|&way| self.way_valid(set, way) && self.tags[set][way] == tag)
    }

    /// Four-way hit classification over the requested word range.
    fn classify(&self, packet: &Packet) -> (HitKind, Option<usize>) {
        let set = self.core.geometry.set_index(packet.address);
        let Some(way) = self.tag_match(set, packet.address) else {
            return (HitKind::LineMiss, None);
        };
        let (lo, hi) = self.word_range(packet);
        let valid = &self.valid[set][way];
        let covered = (lo..hi).filter(|&w| valid[w as usize]).count();
        let wanted = usize::from(hi - lo);
        let kind = if covered == wanted {
            HitKind::LocHit
        } else if covered > 0 {
            HitKind::WocHit
        } else {
            HitKind::HoleMiss
        };
        (kind, Some(way))
    }

    #[must_use]
    pub fn resident(&self, addr: address) -> bool {
        let set = self.core.geometry.set_index(addr);
        self.tag_match(set, addr).is_some()
    }

    fn ways_view(&self, set: usize) -> Vec<WayView> {
        (0..self.core.geometry.ways)
            .map(|way| WayView {
                valid: self.way_valid(set, way),
                dirty: self.dirty[set][way].any(),
                full_addr: self.blocks[set][way].full_addr,
            })
            .collect()
    }

    /// Splits a request crossing the sector boundary into word-aligned
    /// sub-requests completing independently; the parent completes when
    /// the last slice does.
    pub fn add_read_queue(&mut self, packet: Packet, cycle: u64) -> Result<(), Packet> {
        let sector_size = u64::from(self.core.geometry.block_size);
        let offset = packet.full_addr % sector_size;
        if offset + u64::from(packet.size) <= sector_size {
            return self.core.add_read_queue(packet, cycle);
        }

        let first_size = (sector_size - offset) as u32;
        if self.core.rq.headroom() < 2 {
            self.core.stats_inc(packet.kind, AccessStatus::ReservationFail);
            return Err(packet);
        }

        let mut first = packet.clone();
        first.uid = crate::packet::generate_uid();
        first.size = first_size;
        first.parent_uid = Some(packet.uid);

        let mut second = packet.clone();
        second.uid = crate::packet::generate_uid();
        second.full_addr = (packet.full_addr - offset) + sector_size;
        second.v_addr = (packet.v_addr - (packet.v_addr % sector_size)) + sector_size;
        second.address = second.full_addr;
        second.size = packet.size - first_size;
        second.parent_uid = Some(packet.uid);

        self.pending_slices.insert(packet.uid, (packet, 2));
        self.core.add_read_queue(first, cycle).expect("headroom checked");
        self.core.add_read_queue(second, cycle).expect("headroom checked");
        Ok(())
    }

    /// Completes a packet, folding slices back into their parent.
    fn complete(&mut self, packet: Packet, cycle: u64, out: &mut CycleOutput) {
        let Some(parent_uid) = packet.parent_uid else {
            if !matches!(packet.requester, Requester::None) {
                out.completions.push(packet);
            }
            return;
        };
        if let Some((parent, remaining)) = self.pending_slices.get_mut(&parent_uid) {
            parent.served_from = match (parent.served_from, packet.served_from) {
                // The slowest slice defines the service point.
                (Some(prev), Some(new)) => Some(prev.max(new)),
                (prev, new) => new.or(prev),
            };
            parent.went_offchip |= packet.went_offchip;
            *remaining -= 1;
            if *remaining == 0 {
                let (mut parent, _) = self.pending_slices.remove(&parent_uid).unwrap();
                parent.death_cycle = cycle;
                if !matches!(parent.requester, Requester::None) {
                    out.completions.push(parent);
                }
            }
        }
    }

    pub fn operate(&mut self, cycle: u64, down: &mut dyn Downstream, out: &mut CycleOutput) {
        self.handle_fill(cycle, down, out);
        self.handle_writeback(cycle, down);
        self.handle_read(cycle, down, out);
        self.handle_prefetch(cycle, down);
    }

    pub fn return_data(&mut self, packet: Packet, cycle: u64) {
        let served_from = packet.served_from.unwrap_or(crate::packet::Level::Dram);
        let sector_addr = self.core.geometry.block_addr(packet.address);
        self.core
            .mshrs
            .mark_ready(packet.cpu, sector_addr, cycle + self.core.fill_latency, served_from);
    }

    fn handle_fill(&mut self, cycle: u64, down: &mut dyn Downstream, out: &mut CycleOutput) {
        for _ in 0..self.core.fill_width {
            let Some(entry) = self.core.mshrs.pop_ready(cycle) else {
                break;
            };
            if !self.fill_one(entry, cycle, down, out) {
                break;
            }
        }
    }

    fn fill_one(
        &mut self,
        entry: mshr::Entry,
        cycle: u64,
        down: &mut dyn Downstream,
        out: &mut CycleOutput,
    ) -> bool {
        let set = self.core.geometry.set_index(entry.block_addr);
        let tag = self.core.geometry.tag(entry.block_addr);

        let way = match (0..self.core.geometry.ways)
            .find(|&way| self.way_valid(set, way) && self.tags[set][way] == tag)
        {
            // Tag retained: partial fill into the existing sector.
            Some(way) => way,
            None => {
                let ways = self.ways_view(set);
                let desc = AccessDescriptor {
                    cpu: entry.packet.cpu,
                    set,
                    way: None,
                    full_addr: entry.packet.full_addr,
                    v_addr: entry.packet.v_addr,
                    victim_addr: None,
                    ip: entry.packet.ip,
                    kind: entry.packet.kind,
                    hit: false,
                    ways: &ways,
                    cycle,
                };
                let victim_way = self.core.replacement.find_victim(&desc);
                assert!(victim_way < self.core.geometry.ways);

                if !self.evict_sector(set, victim_way, cycle, down) {
                    self.core.mshrs.push_front(entry);
                    return false;
                }
                self.tags[set][victim_way] = tag;
                self.blocks[set][victim_way].fill(tag, &entry.packet);
                victim_way
            }
        };

        // Mark the union of all subscribed word ranges valid.
        let dirty_fill = matches!(entry.packet.kind, AccessKind::Rfo | AccessKind::Writeback);
        for subscriber in &entry.subscribers {
            let (lo, hi) = subscriber
                .word_range
                .unwrap_or((0, self.words as u16));
            for word in lo..hi {
                self.valid[set][way].set(word as usize, true);
                if dirty_fill {
                    self.dirty[set][way].set(word as usize, true);
                }
            }
        }
        self.blocks[set][way].valid = true;
        self.blocks[set][way].dirty = self.dirty[set][way].any();

        let ways = self.ways_view(set);
        self.core.replacement.update_state(&AccessDescriptor {
            cpu: entry.packet.cpu,
            set,
            way: Some(way),
            full_addr: entry.packet.full_addr,
            v_addr: entry.packet.v_addr,
            victim_addr: None,
            ip: entry.packet.ip,
            kind: entry.packet.kind,
            hit: false,
            ways: &ways,
            cycle,
        });
        self.core.prefetcher.fill(&FillEvent {
            cpu: entry.packet.cpu,
            addr: entry.packet.full_addr,
            v_addr: entry.packet.v_addr,
            ip: entry.packet.ip,
            set,
            way,
            prefetch: entry.packet.is_prefetch(),
            victim_addr: None,
            cycle,
        });

        if let Some(routing) = &mut self.routing {
            let mut routed = entry.packet.clone();
            routed.death_cycle = cycle;
            if routed.sniffer {
                routing.collect_sniffer(&routed);
            }
        }
        if entry.packet.is_prefetch() {
            if let Some(offchip) = &self.offchip {
                let mut completed = entry.packet.clone();
                completed.death_cycle = cycle;
                offchip.lock().unwrap().train_on_prefetch(&completed);
            }
        }
        if entry.packet.is_demand() {
            let mut observed = entry.packet.clone();
            observed.death_cycle = cycle;
            self.lmp.update(observed.ip, &observed);
        }

        for subscriber in entry.subscribers {
            let mut packet = subscriber.packet;
            packet.served_from = entry.packet.served_from;
            packet.went_offchip = entry.packet.went_offchip;
            packet.death_cycle = cycle;

            let (lo, _) = subscriber.word_range.unwrap_or((0, 0));
            self.core.usage.touch(
                set,
                way,
                lo as usize * self.word_granularity as usize,
                packet.size as usize,
            );
            self.complete(packet, cycle, out);
        }
        true
    }

    /// Writes back any dirty words and invalidates the whole victim way.
    fn evict_sector(&mut self, set: usize, way: usize, _cycle: u64, down: &mut dyn Downstream) -> bool {
        if self.dirty[set][way].any() {
            let victim = &self.blocks[set][way];
            let mut writeback =
                Packet::new(victim.cpu, AccessKind::Writeback, victim.full_addr, victim.v_addr);
            writeback.size = self.core.geometry.block_size;
            writeback.ip = victim.ip;
            if fill_path::forward_miss(
                &self.core.targets,
                self.core.node_id,
                down,
                writeback,
                QueueKind::Write,
            )
            .is_err()
            {
                return false;
            }
            self.core.stats.lock().unwrap().writebacks_sent += 1;
        }

        if self.way_valid(set, way) {
            self.core.stats.lock().unwrap().evictions += 1;
        }
        self.core.usage.evict(set, way, self.core.warmed_up());
        self.valid[set][way].fill(false);
        self.dirty[set][way].fill(false);
        self.blocks[set][way].invalidate();
        true
    }

    fn handle_writeback(&mut self, cycle: u64, down: &mut dyn Downstream) {
        for _ in 0..self.core.write_width {
            let ready = self
                .core
                .wq
                .first()
                .is_some_and(|packet| packet.event_cycle <= cycle);
            if !ready {
                break;
            }
            let packet = self.core.wq.first().unwrap().clone();
            let (kind, way) = self.classify(&packet);
            let set = self.core.geometry.set_index(packet.address);

            if let Some(way) = way {
                // Tag present: the touched words become valid and dirty.
                let (lo, hi) = self.word_range(&packet);
                for word in lo..hi {
                    self.valid[set][way].set(word as usize, true);
                    self.dirty[set][way].set(word as usize, true);
                }
                self.blocks[set][way].dirty = true;
                self.core.stats_inc(AccessKind::Writeback, kind.status());
                self.core.wq.dequeue();
                continue;
            }

            let mut fetch = packet.clone();
            fetch.kind = AccessKind::Rfo;
            if !self.allocate_miss(&fetch, cycle, down) {
                break;
            }
            self.core.stats_inc(AccessKind::Writeback, AccessStatus::Miss);
            self.core.wq.dequeue();
        }
    }

    fn handle_read(&mut self, cycle: u64, down: &mut dyn Downstream, out: &mut CycleOutput) {
        for _ in 0..self.core.read_width {
            let ready = self
                .core
                .rq
                .first()
                .is_some_and(|packet| packet.event_cycle <= cycle);
            if !ready {
                break;
            }
            let mut packet = self.core.rq.first().unwrap().clone();
            self.core.region.record_access(packet.full_addr);

            let (kind, way) = self.classify(&packet);
            self.reuse.add_usage(
                packet.v_addr,
                packet.full_addr,
                packet.ip,
                kind.is_hit(),
                self.core.warmed_up(),
            );

            match kind {
                HitKind::LocHit => {
                    let way = way.unwrap();
                    self.serve_hit(&mut packet, way, cycle, down, out);
                    self.core.rq.dequeue();
                }
                HitKind::WocHit | HitKind::HoleMiss | HitKind::LineMiss => {
                    if !self.serve_miss(&mut packet, kind, cycle, down) {
                        break;
                    }
                    self.core.rq.dequeue();
                }
            }
        }
    }

    fn serve_hit(
        &mut self,
        packet: &mut Packet,
        way: usize,
        cycle: u64,
        down: &mut dyn Downstream,
        out: &mut CycleOutput,
    ) {
        let set = self.core.geometry.set_index(packet.address);
        let (lo, hi) = self.word_range(packet);
        if packet.kind == AccessKind::Rfo {
            for word in lo..hi {
                self.dirty[set][way].set(word as usize, true);
            }
            self.blocks[set][way].dirty = true;
        }
        self.blocks[set][way].used = true;
        self.core.usage.touch(
            set,
            way,
            lo as usize * self.word_granularity as usize,
            packet.size as usize,
        );

        let ways = self.ways_view(set);
        self.core.replacement.update_state(&AccessDescriptor {
            cpu: packet.cpu,
            set,
            way: Some(way),
            full_addr: packet.full_addr,
            v_addr: packet.v_addr,
            victim_addr: None,
            ip: packet.ip,
            kind: packet.kind,
            hit: true,
            ways: &ways,
            cycle,
        });

        self.run_prefetcher(packet, true, cycle, down);

        packet.serve_from(self.core.level);
        packet.death_cycle = cycle;
        self.core.stats_inc(packet.kind, AccessStatus::Hit);
        self.complete(packet.clone(), cycle, out);
    }

    fn serve_miss(
        &mut self,
        packet: &mut Packet,
        kind: HitKind,
        cycle: u64,
        down: &mut dyn Downstream,
    ) -> bool {
        let sector_addr = self.core.geometry.block_addr(packet.address);
        let word_range = self.word_range(packet);

        if self.core.mshrs.probe(packet.cpu, sector_addr).is_some() {
            self.core
                .mshrs
                .merge(packet.cpu, sector_addr, packet.clone(), Some(word_range));
            self.core.stats_inc(packet.kind, AccessStatus::MshrMerge);
            return true;
        }
        if self.core.mshrs.full() {
            return false;
        }

        // Every miss variant goes down one of the alternative routes.
        if let Some(routing) = &mut self.routing {
            if packet.is_demand() {
                if routing.should_sniff() {
                    routing.mark_sniffer(packet, cycle);
                } else {
                    packet.route = Some(routing.predict());
                }
                routing.inc_packet_counter();
                if let Some(route) = packet.route {
                    let residency = Residency {
                        in_l2c: self
                            .core
                            .targets
                            .l2c
                            .is_some_and(|id| down.resident(id, packet.address)),
                        in_llc: self
                            .core
                            .targets
                            .llc
                            .is_some_and(|id| down.resident(id, packet.address)),
                    };
                    if !packet.sniffer {
                        routing.check_prediction(route, residency);
                    }
                }
            }
        }

        if let (Some(hermes), Some(offchip)) = (&self.hermes, &self.offchip) {
            if (hermes.delayed || hermes.bimodal)
                && packet.is_demand()
                && offchip.lock().unwrap().consume_from_l1d(packet.perceptron_sum)
            {
                if let Some(dram) = self.core.targets.dram {
                    down.ddrp_probe(dram, packet.address, hermes.ddrp_request_latency);
                }
            }
        }

        if !self.allocate_miss(packet, cycle, down) {
            return false;
        }

        self.core.stats_inc(packet.kind, kind.status());
        self.run_prefetcher(packet, false, cycle, down);
        fill_path::escalate_prefetch(&self.core.targets, down, packet, false, cycle);
        true
    }

    fn allocate_miss(&mut self, packet: &Packet, cycle: u64, down: &mut dyn Downstream) -> bool {
        if self.core.mshrs.full() {
            return false;
        }
        let sector_addr = self.core.geometry.block_addr(packet.address);
        let word_range = self.word_range(packet);

        // The lower hierarchy speaks cache lines; request the words we
        // need, aligned out to the line the range lives in.
        let mut forwarded = packet.clone();
        forwarded.address = crate::block_addr(packet.full_addr);
        forwarded.size = crate::BLOCK_SIZE as u32;
        forwarded.birth_cycle = if packet.sniffer { packet.birth_cycle } else { cycle };

        if fill_path::forward_miss(
            &self.core.targets,
            self.core.node_id,
            down,
            forwarded.clone(),
            QueueKind::Read,
        )
        .is_err()
        {
            return false;
        }

        let mut primary = forwarded;
        primary.address = sector_addr;
        self.core
            .mshrs
            .allocate(sector_addr, primary, packet.clone(), Some(word_range), cycle)
            .expect("MSHR capacity checked above");
        true
    }

    fn handle_prefetch(&mut self, cycle: u64, down: &mut dyn Downstream) {
        for _ in 0..self.core.read_width {
            let ready = self
                .core
                .pq
                .first()
                .is_some_and(|packet| packet.event_cycle <= cycle);
            if !ready {
                break;
            }
            let packet = self.core.pq.first().unwrap().clone();
            let (kind, _) = self.classify(&packet);
            if kind == HitKind::LocHit {
                self.core.stats_inc(AccessKind::Prefetch, AccessStatus::Hit);
                self.core.pq.dequeue();
                continue;
            }

            let sector_addr = self.core.geometry.block_addr(packet.address);
            if self.core.mshrs.probe(packet.cpu, sector_addr).is_some() {
                let range = self.word_range(&packet);
                self.core
                    .mshrs
                    .merge(packet.cpu, sector_addr, packet.clone(), Some(range));
                self.core
                    .stats_inc(AccessKind::Prefetch, AccessStatus::MshrMerge);
                self.core.pq.dequeue();
                continue;
            }

            if !self.allocate_miss(&packet, cycle, down) {
                break;
            }
            self.core.stats_inc(AccessKind::Prefetch, kind.status());
            self.core.pq.dequeue();
        }
    }

    fn run_prefetcher(&mut self, packet: &Packet, hit: bool, cycle: u64, down: &mut dyn Downstream) {
        if !packet.is_demand() {
            return;
        }
        let desc = Descriptor {
            hit,
            offchip_pred: packet.went_offchip_pred,
            kind: packet.kind,
            cpu: packet.cpu,
            addr: packet.full_addr,
            v_addr: packet.v_addr,
            ip: packet.ip,
            size: packet.size,
            cycle,
            mshr_size: self.core.mshrs.capacity(),
            mshr_occupancy: self.core.mshrs.len(),
            pq_size: self.core.pq.capacity().unwrap_or(usize::MAX),
            pq_occupancy: self.core.pq.len(),
        };
        let mut issue = IssueBuffer::default();
        self.core.prefetcher.operate(&desc, &mut issue);
        for request in issue.requests {
            let mut pf =
                Packet::new(request.cpu, AccessKind::Prefetch, request.pf_addr, request.pf_addr);
            pf.address = self.core.geometry.block_addr(request.pf_addr);
            pf.ip = request.ip;
            pf.size = request.size.min(self.core.geometry.block_size);
            pf.fill_level = request.fill_level;
            pf.went_offchip_pred = request.offchip_pred;
            pf.pf_origin = Some(self.core.level);
            pf.birth_cycle = cycle;
            if let Some(offchip) = &self.offchip {
                pf.went_offchip_pred = offchip.lock().unwrap().predict_on_prefetch(&mut pf);
            }
            let mut stats = self.core.stats.lock().unwrap();
            if self.core.pq.enqueue(pf).is_ok() {
                stats.prefetch_issued += 1;
            } else {
                stats.prefetch_dropped += 1;
            }
        }
    }

    pub fn prefetch_on_upstream(&mut self, desc: Descriptor) {
        let mut issue = IssueBuffer::default();
        self.core.prefetcher.operate(&desc, &mut issue);
        for request in issue.requests {
            let mut pf =
                Packet::new(request.cpu, AccessKind::Prefetch, request.pf_addr, request.pf_addr);
            pf.address = self.core.geometry.block_addr(request.pf_addr);
            pf.ip = request.ip;
            pf.pf_origin = Some(self.core.level);
            let mut stats = self.core.stats.lock().unwrap();
            if self.core.pq.enqueue(pf).is_ok() {
                stats.prefetch_issued += 1;
            } else {
                stats.prefetch_dropped += 1;
            }
        }
    }

    /// Sector invariants: any dirty bit implies its valid bit; a way with
    /// no valid bits is invalid as a whole.
    pub fn check_invariants(&self) {
        for set in 0..self.core.geometry.sets {
            for way in 0..self.core.geometry.ways {
                for word in 0..self.words {
                    assert!(
                        !self.dirty[set][way][word] || self.valid[set][way][word],
                        "{}: dirty word {word} without valid bit at ({set}, {way})",
                        self.core.name
                    );
                }
                if !self.way_valid(set, way) {
                    assert!(
                        !self.dirty[set][way].any(),
                        "{}: invalid way ({set}, {way}) holds dirty words",
                        self.core.name
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Sectored;
    use crate::cache::testing::{make_core, StubDown};
    use crate::cache::{CycleOutput, HitKind};
    use crate::instrument::ReuseTracker;
    use crate::packet::{AccessKind, Level, Packet, Requester};

    fn sdc() -> Sectored {
        // 4 sets, 2 ways, 512-byte sectors, 8-byte words.
        let core = make_core(Level::Sdc, 4, 2, 512);
        Sectored::new(core, 8, ReuseTracker::new(16, None))
    }

    fn load(addr: u64, size: u32) -> Packet {
        let mut packet = Packet::new(0, AccessKind::Load, addr, addr);
        packet.address = addr & !511;
        packet.size = size;
        packet.requester = Requester::Core;
        packet
    }

    fn fill_words(cache: &mut Sectored, addr: u64, size: u32, cycle: u64) {
        let mut down = StubDown::default();
        let mut out = CycleOutput::default();
        cache.add_read_queue(load(addr, size), cycle).unwrap();
        cache.operate(cycle, &mut down, &mut out);
        let mut reply = down.sent.last().unwrap().2.clone();
        reply.serve_from(Level::Dram);
        cache.return_data(reply, cycle + 1);
        cache.operate(cycle + 1, &mut down, &mut out);
    }

    #[test]
    fn line_miss_then_partial_residency() {
        let mut cache = sdc();
        // touch words [0, 2) of the sector at 0x10000
        fill_words(&mut cache, 0x10000, 16, 0);

        // the filled words hit
        assert_eq!(cache.classify(&load(0x10000, 8)).0, HitKind::LocHit);
        assert_eq!(cache.classify(&load(0x10008, 8)).0, HitKind::LocHit);
        // same sector, untouched words: tag present, no data
        assert_eq!(cache.classify(&load(0x10100, 8)).0, HitKind::HoleMiss);
        // spanning filled and unfilled words
        assert_eq!(cache.classify(&load(0x10008, 16)).0, HitKind::WocHit);
        // different sector entirely
        assert_eq!(cache.classify(&load(0x20000, 8)).0, HitKind::LineMiss);
    }

    #[test]
    fn touching_a_range_sets_exactly_those_valid_bits() {
        let mut cache = sdc();
        // 24 bytes starting at byte 16: words 2, 3 and 4
        fill_words(&mut cache, 0x10010, 24, 0);

        let set = cache.core.geometry.set_index(0x10000);
        let valid = &cache.valid[set][0];
        let expected: Vec<usize> = vec![2, 3, 4];
        let actual: Vec<usize> = valid.iter_ones().collect();
        assert_eq!(actual, expected);
    }

    #[test]
    fn hole_miss_keeps_the_tag() {
        let mut cache = sdc();
        fill_words(&mut cache, 0x10000, 8, 0);

        // partial fill of another word range must not evict the sector
        fill_words(&mut cache, 0x10100, 8, 10);
        assert_eq!(cache.classify(&load(0x10000, 8)).0, HitKind::LocHit);
        assert_eq!(cache.classify(&load(0x10100, 8)).0, HitKind::LocHit);
        assert_eq!(cache.core.stats.lock().unwrap().evictions, 0);
    }

    #[test]
    fn sector_crossing_requests_slice_and_rejoin() {
        let mut cache = sdc();
        let mut down = StubDown::default();
        let mut out = CycleOutput::default();

        // 32 bytes starting 8 bytes before the sector boundary
        let addr = 0x10000 + 512 - 8;
        cache.add_read_queue(load(addr, 32), 0).unwrap();
        assert_eq!(cache.core.rq.len(), 2, "two word-aligned slices");

        cache.operate(0, &mut down, &mut out);
        assert_eq!(down.sent.len(), 2);
        for (_, _, sent) in &down.sent {
            let mut reply = sent.clone();
            reply.serve_from(Level::Dram);
            cache.return_data(reply, 1);
        }
        cache.operate(1, &mut down, &mut out);

        // exactly one completion: the rejoined parent
        assert_eq!(out.completions.len(), 1);
        assert_eq!(out.completions[0].size, 32);
        assert!(out.completions[0].went_offchip);
    }
}
