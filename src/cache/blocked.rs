use super::mshr;
use super::{AccessDescriptor, Block, CacheCore, CycleOutput, Downstream, QueueKind, WayView};
use crate::fill_path;
use crate::packet::{AccessKind, AccessStatus, FillLevel, Level, Packet, Requester};
use crate::predictors::routing::Residency;
use crate::predictors::{DeadBlockPredictor, OffchipPredictor, RoutingEngine};
use crate::prefetch::{Descriptor, FillEvent, IssueBuffer};
use crate::address;
use std::sync::{Arc, Mutex};

/// Set-dueling style counter throttling an L1D prefetcher that keeps
/// polluting the cache.
#[derive(Debug, Clone, Copy)]
pub struct PrefetchPsel {
    counter: i64,
    max: i64,
    threshold: i64,
}

impl PrefetchPsel {
    #[must_use]
    pub fn new(bits: u8, threshold: u64) -> Self {
        let max = (1i64 << bits) - 1;
        Self {
            counter: max >> 1,
            max,
            threshold: threshold as i64,
        }
    }

    fn useful(&mut self) {
        self.counter = (self.counter + 1).min(self.max);
    }

    fn useless(&mut self) {
        self.counter = (self.counter - 1).max(0);
    }

    #[must_use]
    pub fn enabled(&self) -> bool {
        self.counter >= self.threshold
    }
}

/// Off-chip fast-path wiring for the L1D boundary.
#[derive(Debug, Clone, Copy, Default)]
pub struct HermesWiring {
    pub ddrp_request_latency: u64,
    /// Probe from the L1D on the stronger threshold instead of the core.
    pub delayed: bool,
    /// Probe from both boundaries, each on its own threshold.
    pub bimodal: bool,
}

/// Standard blocked cache: one valid/dirty bit per line, write-allocate,
/// MSHR-coalesced misses, pluggable replacement and prefetching.
pub struct Blocked {
    pub core: CacheCore,
    sets: Vec<Vec<Block>>,

    /// L1D/SDC front caches carry the fill-path routing engine.
    pub routing: Option<RoutingEngine>,
    /// L1D: shared off-chip predictor for prefetch-time prediction and
    /// prefetch training.
    pub offchip: Option<Arc<Mutex<OffchipPredictor>>>,
    pub hermes: Option<HermesWiring>,
    /// LLC: sampler-based dead-block observation.
    pub dead_block: Option<DeadBlockPredictor>,
    /// L1D: prefetch enable/disable duel.
    pub pf_psel: Option<PrefetchPsel>,
}

impl Blocked {
    #[must_use]
    pub fn new(core: CacheCore) -> Self {
        let sets = vec![vec![Block::default(); core.geometry.ways]; core.geometry.sets];
        Self {
            core,
            sets,
            routing: None,
            offchip: None,
            hermes: None,
            dead_block: None,
            pf_psel: None,
        }
    }

    fn lookup(&self, addr: address) -> Option<(usize, usize)> {
        let block_addr = self.core.geometry.block_addr(addr);
        let set = self.core.geometry.set_index(addr);
        self.sets[set]
            .iter()
            .position(|block| block.valid && block.tag == block_addr)
            .map(|way| (set, way))
    }

    #[must_use]
    pub fn resident(&self, addr: address) -> bool {
        self.lookup(addr).is_some()
    }

    fn ways_view(&self, set: usize) -> Vec<WayView> {
        self.sets[set]
            .iter()
            .map(|block| WayView {
                valid: block.valid,
                dirty: block.dirty,
                full_addr: block.full_addr,
            })
            .collect()
    }

    pub fn operate(&mut self, cycle: u64, down: &mut dyn Downstream, out: &mut CycleOutput) {
        self.handle_fill(cycle, down, out);
        self.handle_writeback(cycle, down);
        self.handle_read(cycle, down, out);
        self.handle_prefetch(cycle, down);
    }

    /// Completion from the level below: stamp the MSHR entry; the fill
    /// becomes architecturally visible after `fill_latency`.
    pub fn return_data(&mut self, packet: Packet, cycle: u64) {
        let served_from = packet.served_from.unwrap_or(Level::Dram);
        let block_addr = self.core.geometry.block_addr(packet.address);
        log::trace!("{}: return data for {packet}", self.core.name);
        // Carry the downstream verdict into the waiting entry.
        if let Some(entry) = self.core.mshrs.probe_mut(packet.cpu, block_addr) {
            entry.packet.route = packet.route.or(entry.packet.route);
            entry.packet.bypassed_l2c_llc |= packet.bypassed_l2c_llc;
        }
        self.core
            .mshrs
            .mark_ready(packet.cpu, block_addr, cycle + self.core.fill_latency, served_from);
    }

    /// (a) Drain completed MSHRs into the data array and wake subscribers.
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

    /// Installs one completed miss. Returns false on a downstream stall
    /// (the entry is put back and retried next cycle).
    fn fill_one(
        &mut self,
        entry: mshr::Entry,
        cycle: u64,
        down: &mut dyn Downstream,
        out: &mut CycleOutput,
    ) -> bool {
        let set = self.core.geometry.set_index(entry.block_addr);
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
        assert!(
            victim_way < self.core.geometry.ways,
            "{}: victim {victim_way} out of range",
            self.core.name
        );

        // A dirty victim writes back below before it can be replaced.
        let victim = self.sets[set][victim_way].clone();
        if victim.valid && victim.dirty {
            let mut writeback = Packet::new(victim.cpu, AccessKind::Writeback, victim.full_addr, victim.v_addr);
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
                self.core.mshrs.push_front(entry);
                return false;
            }
            self.core.stats.lock().unwrap().writebacks_sent += 1;
        }

        let warmed_up = self.core.warmed_up();
        self.core.usage.evict(set, victim_way, warmed_up);
        if victim.valid {
            self.core.stats.lock().unwrap().evictions += 1;
            if victim.prefetched && !victim.used {
                if let Some(psel) = &mut self.pf_psel {
                    psel.useless();
                }
            }
        }

        let tag = self.core.geometry.block_addr(entry.block_addr);
        self.sets[set][victim_way].fill(tag, &entry.packet);

        let victim_addr = victim.valid.then_some(victim.full_addr);
        let ways = self.ways_view(set);
        let fill_desc = AccessDescriptor {
            way: Some(victim_way),
            victim_addr,
            ways: &ways,
            ..desc
        };
        self.core.replacement.update_state(&fill_desc);
        self.core.prefetcher.fill(&FillEvent {
            cpu: entry.packet.cpu,
            addr: entry.packet.full_addr,
            v_addr: entry.packet.v_addr,
            ip: entry.packet.ip,
            set,
            way: victim_way,
            prefetch: entry.packet.is_prefetch(),
            victim_addr,
            cycle,
        });

        // Fill-path accounting at the routed boundary.
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

        // Wake subscribers in allocation order.
        for subscriber in entry.subscribers {
            let mut packet = subscriber.packet;
            packet.served_from = entry.packet.served_from;
            packet.went_offchip = entry.packet.went_offchip;
            packet.route = entry.packet.route;
            packet.bypassed_l2c_llc = entry.packet.bypassed_l2c_llc;
            packet.death_cycle = cycle;

            let offset = (packet.full_addr % u64::from(self.core.geometry.block_size)) as usize;
            self.core
                .usage
                .touch(set, victim_way, offset, packet.size as usize);

            if !matches!(packet.requester, Requester::None) {
                out.completions.push(packet);
            }
        }
        true
    }

    /// (b) Absorb writebacks from upstream evictions (write-allocate).
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

            if let Some((set, way)) = self.lookup(packet.address) {
                let block = &mut self.sets[set][way];
                block.dirty = true;
                block.used = true;
                let offset = (packet.full_addr % u64::from(self.core.geometry.block_size)) as usize;
                self.core.usage.touch(set, way, offset, packet.size as usize);

                let ways = self.ways_view(set);
                self.core.replacement.update_state(&AccessDescriptor {
                    cpu: packet.cpu,
                    set,
                    way: Some(way),
                    full_addr: packet.full_addr,
                    v_addr: packet.v_addr,
                    victim_addr: None,
                    ip: packet.ip,
                    kind: AccessKind::Writeback,
                    hit: true,
                    ways: &ways,
                    cycle,
                });
                self.core.stats_inc(AccessKind::Writeback, AccessStatus::Hit);
                self.core.wq.dequeue();
                continue;
            }

            // Write-allocate: fetch the line like a read miss; the fetch
            // itself goes down as an RFO.
            let mut fetch = packet.clone();
            fetch.kind = AccessKind::Rfo;
            if !self.allocate_miss(&fetch, QueueKind::Read, cycle, down) {
                break;
            }
            self.core.stats_inc(AccessKind::Writeback, AccessStatus::Miss);
            self.core.wq.dequeue();
        }
    }

    /// (c) Serve demand reads; allocate MSHRs on miss.
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

            if let Some((set, way)) = self.lookup(packet.address) {
                self.serve_hit(&mut packet, set, way, cycle, down, out);
                self.core.rq.dequeue();
                continue;
            }

            if !self.serve_miss(&mut packet, cycle, down) {
                break;
            }
            self.core.rq.dequeue();
        }
    }

    fn serve_hit(
        &mut self,
        packet: &mut Packet,
        set: usize,
        way: usize,
        cycle: u64,
        down: &mut dyn Downstream,
        out: &mut CycleOutput,
    ) {
        {
            let block = &mut self.sets[set][way];
            if block.prefetched && !block.used {
                self.core.stats.lock().unwrap().prefetch_useful += 1;
                if let Some(psel) = &mut self.pf_psel {
                    psel.useful();
                }
            }
            block.used = true;
            if packet.kind == AccessKind::Rfo {
                block.dirty = true;
            }
        }
        let offset = (packet.full_addr % u64::from(self.core.geometry.block_size)) as usize;
        self.core.usage.touch(set, way, offset, packet.size as usize);

        let ways = self.ways_view(set);
        let desc = AccessDescriptor {
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
        };
        self.core.replacement.update_state(&desc);
        if let Some(dead_block) = &mut self.dead_block {
            dead_block.update_sampler(&desc);
        }

        self.run_prefetcher(packet, true, cycle, down);

        packet.serve_from(self.core.level);
        packet.death_cycle = cycle;
        self.core.stats_inc(packet.kind, AccessStatus::Hit);
        if !matches!(packet.requester, Requester::None) {
            out.completions.push(packet.clone());
        }
    }

    /// Returns false when the miss cannot make progress this cycle.
    fn serve_miss(&mut self, packet: &mut Packet, cycle: u64, down: &mut dyn Downstream) -> bool {
        let block_addr = self.core.geometry.block_addr(packet.address);

        if self.core.mshrs.probe(packet.cpu, block_addr).is_some() {
            self.core
                .mshrs
                .merge(packet.cpu, block_addr, packet.clone(), None);
            self.core.stats_inc(packet.kind, AccessStatus::MshrMerge);
            self.run_prefetcher(packet, false, cycle, down);
            return true;
        }

        if self.core.mshrs.full() {
            return false;
        }

        // Route selection and sniffing happen once, at the first-level miss.
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

        // Delayed/bimodal fast path: probe DRAM from the L1D boundary.
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

        if !self.allocate_miss(packet, QueueKind::Read, cycle, down) {
            return false;
        }

        self.core.stats_inc(packet.kind, AccessStatus::Miss);
        if self.dead_block.is_some() {
            let set = self.core.geometry.set_index(packet.address);
            let ways = self.ways_view(set);
            let dead_block = self.dead_block.as_mut().unwrap();
            dead_block.update_sampler(&AccessDescriptor {
                cpu: packet.cpu,
                set,
                way: None,
                full_addr: packet.full_addr,
                v_addr: packet.v_addr,
                victim_addr: None,
                ip: packet.ip,
                kind: packet.kind,
                hit: false,
                ways: &ways,
                cycle,
            });
        }
        self.run_prefetcher(packet, false, cycle, down);
        fill_path::escalate_prefetch(&self.core.targets, down, packet, false, cycle);
        true
    }

    /// Forwards a miss downstream and allocates its MSHR entry.
    fn allocate_miss(
        &mut self,
        packet: &Packet,
        queue: QueueKind,
        cycle: u64,
        down: &mut dyn Downstream,
    ) -> bool {
        if self.core.mshrs.full() {
            return false;
        }
        let block_addr = self.core.geometry.block_addr(packet.address);

        let mut forwarded = packet.clone();
        forwarded.address = block_addr;
        forwarded.size = self.core.geometry.block_size;
        forwarded.birth_cycle = if packet.sniffer { packet.birth_cycle } else { cycle };

        if fill_path::forward_miss(
            &self.core.targets,
            self.core.node_id,
            down,
            forwarded.clone(),
            queue,
        )
        .is_err()
        {
            return false;
        }

        self.core
            .mshrs
            .allocate(block_addr, forwarded, packet.clone(), None, cycle)
            .expect("MSHR capacity checked above");
        true
    }

    /// (d) Prefetch queue: as reads, but nothing returns to a requester.
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

            if self.lookup(packet.address).is_some() {
                // Already resident; the hint is satisfied.
                self.core.stats_inc(AccessKind::Prefetch, AccessStatus::Hit);
                self.core.pq.dequeue();
                continue;
            }

            let block_addr = self.core.geometry.block_addr(packet.address);
            if self.core.mshrs.probe(packet.cpu, block_addr).is_some() {
                self.core
                    .mshrs
                    .merge(packet.cpu, block_addr, packet.clone(), None);
                self.core
                    .stats_inc(AccessKind::Prefetch, AccessStatus::MshrMerge);
                self.core.pq.dequeue();
                continue;
            }

            if !self.allocate_miss(&packet, QueueKind::Prefetch, cycle, down) {
                break;
            }
            self.core.stats_inc(AccessKind::Prefetch, AccessStatus::Miss);
            self.core.pq.dequeue();
        }
    }

    /// Runs the bound prefetcher on a demand opportunity and issues what
    /// it asked for.
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
        let throttled = self.pf_psel.is_some_and(|psel| !psel.enabled());
        for request in issue.requests {
            if throttled {
                self.core.stats.lock().unwrap().prefetch_dropped += 1;
                continue;
            }
            self.prefetch_line(&request, cycle, down);
        }
    }

    /// Validates and enqueues one prefetch request from the bound policy.
    pub fn prefetch_line(
        &mut self,
        request: &crate::prefetch::Request,
        cycle: u64,
        down: &mut dyn Downstream,
    ) {
        let mut packet = Packet::new(request.cpu, AccessKind::Prefetch, request.pf_addr, request.pf_addr);
        packet.ip = request.ip;
        packet.size = request.size;
        packet.fill_level = request.fill_level;
        packet.went_offchip_pred = request.offchip_pred;
        packet.pf_origin = Some(self.core.level);
        packet.birth_cycle = cycle;

        // Prefetch-time off-chip prediction runs its own perceptron.
        if let Some(offchip) = &self.offchip {
            packet.went_offchip_pred = offchip.lock().unwrap().predict_on_prefetch(&mut packet);
        }

        let wants_lower = match (self.core.level, request.fill_level) {
            (Level::L1D | Level::L1I | Level::Sdc, FillLevel::L2 | FillLevel::Llc) => true,
            (Level::L2C, FillLevel::Llc) => true,
            _ => false,
        };

        let accepted = if wants_lower {
            let target = match request.fill_level {
                FillLevel::Llc => self.core.targets.llc.or(self.core.targets.lower),
                _ => self.core.targets.lower,
            };
            match target {
                Some(target) => down
                    .try_send(target, QueueKind::Prefetch, packet)
                    .is_ok(),
                None => false,
            }
        } else {
            self.core.add_prefetch_queue(packet, cycle).is_ok()
        };

        let mut stats = self.core.stats.lock().unwrap();
        if accepted {
            stats.prefetch_issued += 1;
        } else {
            stats.prefetch_dropped += 1;
        }
    }

    /// Prefetch escalation entry point (invoked from an upper, bypassing
    /// cache through the engine).
    pub fn prefetch_on_upstream(&mut self, desc: Descriptor) {
        let desc = Descriptor {
            mshr_size: self.core.mshrs.capacity(),
            mshr_occupancy: self.core.mshrs.len(),
            pq_size: self.core.pq.capacity().unwrap_or(usize::MAX),
            pq_occupancy: self.core.pq.len(),
            ..desc
        };
        let mut issue = IssueBuffer::default();
        self.core.prefetcher.operate(&desc, &mut issue);
        // Bypassed level: requests land in the local prefetch queue only.
        for request in issue.requests {
            let mut packet =
                Packet::new(request.cpu, AccessKind::Prefetch, request.pf_addr, request.pf_addr);
            packet.ip = request.ip;
            packet.size = request.size;
            packet.fill_level = request.fill_level;
            packet.pf_origin = Some(self.core.level);
            let mut stats = self.core.stats.lock().unwrap();
            if self.core.pq.enqueue(packet).is_ok() {
                stats.prefetch_issued += 1;
            } else {
                stats.prefetch_dropped += 1;
            }
        }
    }

    /// Data-array invariants: dirty implies valid, tags match their set.
    pub fn check_invariants(&self) {
        for (set_idx, set) in self.sets.iter().enumerate() {
            for (way, block) in set.iter().enumerate() {
                assert!(
                    !block.dirty || block.valid,
                    "{}: dirty invalid block at ({set_idx}, {way})",
                    self.core.name
                );
                if block.valid {
                    assert_eq!(
                        self.core.geometry.set_index(block.tag),
                        set_idx,
                        "{}: tag {:#x} stored in wrong set {set_idx}",
                        self.core.name,
                        block.tag
                    );
                }
            }
        }
        // An address a cpu is waiting on is not resident for it yet. At
        // shared levels another cpu may have filled the same block, so the
        // check is scoped to the owner.
        for entry in self.core.mshrs.iter() {
            let refilled = self
                .lookup(entry.block_addr)
                .is_some_and(|(set, way)| self.sets[set][way].cpu == entry.cpu);
            assert!(
                !refilled,
                "{}: {:#x} both in MSHR and data array",
                self.core.name,
                entry.block_addr
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Blocked;
    use crate::cache::testing::{make_core, StubDown};
    use crate::cache::{CycleOutput, QueueKind};
    use crate::packet::{AccessKind, Level, Packet, Requester};

    fn load(addr: u64) -> Packet {
        let mut packet = Packet::new(0, AccessKind::Load, addr, addr);
        packet.requester = Requester::Core;
        packet
    }

    fn l1d() -> Blocked {
        Blocked::new(make_core(Level::L1D, 16, 4, 64))
    }

    #[test]
    fn miss_forwards_once_and_coalesces() {
        // Two loads to the same block at cycles 10 and 12: one MSHR, one
        // downstream request, both complete after the fill at cycle 100.
        let mut cache = l1d();
        let mut down = StubDown::default();
        let mut out = CycleOutput::default();

        cache.core.add_read_queue(load(0x1000), 10).unwrap();
        cache.operate(10, &mut down, &mut out);
        assert_eq!(cache.core.mshrs.len(), 1);
        assert_eq!(down.sent.len(), 1);
        assert_eq!(down.sent[0].1, QueueKind::Read);

        cache.core.add_read_queue(load(0x1008), 12).unwrap();
        cache.operate(12, &mut down, &mut out);
        assert_eq!(cache.core.mshrs.len(), 1, "second load merges");
        assert_eq!(down.sent.len(), 1, "nothing new goes below");
        assert!(out.completions.is_empty());

        let mut reply = down.sent[0].2.clone();
        reply.serve_from(Level::Dram);
        cache.return_data(reply, 100);
        cache.operate(100, &mut down, &mut out);

        assert_eq!(out.completions.len(), 2);
        assert!(out.completions.iter().all(|p| p.death_cycle >= 100));
        assert!(out.completions.iter().all(|p| p.went_offchip));
        assert!(cache.resident(0x1000));
    }

    #[test]
    fn hit_completes_without_going_below() {
        let mut cache = l1d();
        let mut down = StubDown::default();
        let mut out = CycleOutput::default();

        // install the block via a fill
        cache.core.add_read_queue(load(0x2000), 0).unwrap();
        cache.operate(0, &mut down, &mut out);
        let mut reply = down.sent[0].2.clone();
        reply.serve_from(Level::L2C);
        cache.return_data(reply, 5);
        cache.operate(5, &mut down, &mut out);
        out.completions.clear();
        let sent_before = down.sent.len();

        cache.core.add_read_queue(load(0x2000), 20).unwrap();
        cache.operate(20, &mut down, &mut out);
        assert_eq!(out.completions.len(), 1);
        assert_eq!(out.completions[0].served_from, Some(Level::L1D));
        assert_eq!(down.sent.len(), sent_before);
    }

    #[test]
    fn dirty_victim_writes_back() {
        // 1-set cache: fill ways with RFOs (dirty), then one more miss
        // must push a writeback below before installing.
        let mut cache = Blocked::new(make_core(Level::L1D, 1, 2, 64));
        let mut down = StubDown::default();
        let mut out = CycleOutput::default();

        for (i, addr) in [0x1000u64, 0x2000, 0x3000].iter().enumerate() {
            let mut rfo = Packet::new(0, AccessKind::Rfo, *addr, *addr);
            rfo.requester = Requester::Core;
            let cycle = (i as u64) * 10;
            cache.core.add_read_queue(rfo, cycle).unwrap();
            cache.operate(cycle, &mut down, &mut out);
            let mut reply = down.sent.last().unwrap().2.clone();
            reply.serve_from(Level::Dram);
            cache.return_data(reply, cycle + 1);
            cache.operate(cycle + 1, &mut down, &mut out);
        }

        let writebacks: Vec<_> = down
            .sent
            .iter()
            .filter(|(_, queue, _)| *queue == QueueKind::Write)
            .collect();
        assert_eq!(writebacks.len(), 1);
        assert_eq!(writebacks[0].2.kind, AccessKind::Writeback);
    }

    #[test]
    fn full_mshr_backpressures_the_queue() {
        let mut cache = l1d();
        let mut down = StubDown::default();
        let mut out = CycleOutput::default();

        // fill every MSHR with distinct blocks
        let capacity = cache.core.mshrs.capacity();
        for i in 0..capacity as u64 {
            cache
                .core
                .add_read_queue(load(0x10_000 + i * 0x40), 0)
                .unwrap();
        }
        cache.core.add_read_queue(load(0xF0_000), 0).unwrap();
        cache.operate(0, &mut down, &mut out);
        cache.operate(1, &mut down, &mut out);

        assert_eq!(cache.core.mshrs.len(), capacity);
        assert_eq!(cache.core.rq.len(), 1, "overflow load waits its turn");
    }
}
