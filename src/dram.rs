use crate::cache::CycleOutput;
use crate::fifo::Fifo;
use crate::packet::{AccessKind, Level, Packet, Requester};
use crate::{address, LOG2_BLOCK_SIZE};
use std::collections::HashMap;
use std::io::Write;

/// `(channel, rank, bank, row, column)` of a physical address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DramCoordinates {
    pub channel: u32,
    pub rank: u32,
    pub bank: u32,
    pub row: u32,
    pub column: u32,
}

const RANK_BITS: u32 = 1;
const BANK_BITS: u32 = 3;
const COLUMN_BITS: u32 = 7;

/// Fixed-latency DRAM model: per-channel read/write/prefetch queues served
/// strictly by arrival time; writes are absorbed, reads and prefetches
/// return upward after `latency` cycles.
pub struct DramController {
    pub node_id: usize,
    latency: u64,
    channel_bits: u32,

    read_queues: Vec<Fifo<Packet>>,
    write_queues: Vec<Fifo<Packet>>,
    prefetch_queues: Vec<Fifo<Packet>>,

    /// Blocks with a parallel predictor-issued probe in flight; a matching
    /// demand read completes at the probe's ready time instead of paying
    /// the full latency again.
    ddrp_inflight: HashMap<address, u64>,

    /// Optional off-chip access trace sink.
    trace: Option<std::io::BufWriter<std::fs::File>>,

    pub reads_served: u64,
    pub writes_served: u64,
    pub ddrp_hits: u64,
}

impl DramController {
    #[must_use]
    pub fn new(node_id: usize, channels: usize, latency: u64, queue_sizes: (usize, usize, usize)) -> Self {
        let channels = channels.max(1);
        let (read, write, prefetch) = queue_sizes;
        Self {
            node_id,
            latency,
            channel_bits: crate::hash::lg2(channels as u64),
            read_queues: (0..channels).map(|_| Fifo::new(Some(read))).collect(),
            write_queues: (0..channels).map(|_| Fifo::new(Some(write))).collect(),
            prefetch_queues: (0..channels).map(|_| Fifo::new(Some(prefetch))).collect(),
            ddrp_inflight: HashMap::new(),
            trace: None,
            reads_served: 0,
            writes_served: 0,
            ddrp_hits: 0,
        }
    }

    /// Streams every served access as `<cycle> <r|w> <addr> <channel>
    /// <rank> <bank> <row> <column>` lines into `directory`.
    pub fn enable_memory_trace(&mut self, directory: &std::path::Path) {
        let path = directory.join("dram.trace");
        match std::fs::File::create(&path) {
            Ok(file) => self.trace = Some(std::io::BufWriter::new(file)),
            Err(err) => log::warn!("cannot open memory trace {}: {err}", path.display()),
        }
    }

    fn trace_access(&mut self, cycle: u64, write: bool, addr: address) {
        let coords = self.decode(addr);
        if let Some(trace) = &mut self.trace {
            let _ = writeln!(
                trace,
                "{cycle} {} {addr:#x} {} {} {} {} {}",
                if write { 'w' } else { 'r' },
                coords.channel,
                coords.rank,
                coords.bank,
                coords.row,
                coords.column,
            );
        }
    }

    #[must_use]
    pub fn decode(&self, addr: address) -> DramCoordinates {
        let mut cursor = addr >> LOG2_BLOCK_SIZE;
        let take = |cursor: &mut u64, bits: u32| -> u32 {
            let value = (*cursor & ((1 << bits) - 1)) as u32;
            *cursor >>= bits;
            value
        };
        let channel = if self.channel_bits == 0 {
            0
        } else {
            take(&mut cursor, self.channel_bits)
        };
        let column = take(&mut cursor, COLUMN_BITS);
        let bank = take(&mut cursor, BANK_BITS);
        let rank = take(&mut cursor, RANK_BITS);
        let row = cursor as u32;
        DramCoordinates {
            channel,
            rank,
            bank,
            row,
            column,
        }
    }

    fn channel(&self, addr: address) -> usize {
        self.decode(addr).channel as usize % self.read_queues.len()
    }

    pub fn add_read_queue(&mut self, mut packet: Packet, cycle: u64) -> Result<(), Packet> {
        let channel = self.channel(packet.address);
        packet.event_cycle = match self.ddrp_inflight.get(&packet.address) {
            // The probe already started the access; ride its tail.
            Some(&ready) if ready > cycle => {
                self.ddrp_hits += 1;
                ready
            }
            Some(_) => {
                self.ddrp_hits += 1;
                cycle + 1
            }
            None => cycle + self.latency,
        };
        self.read_queues[channel].enqueue(packet)
    }

    pub fn add_write_queue(&mut self, mut packet: Packet, cycle: u64) -> Result<(), Packet> {
        let channel = self.channel(packet.address);
        packet.event_cycle = cycle + self.latency;
        self.write_queues[channel].enqueue(packet)
    }

    pub fn add_prefetch_queue(&mut self, mut packet: Packet, cycle: u64) -> Result<(), Packet> {
        let channel = self.channel(packet.address);
        packet.event_cycle = cycle + self.latency;
        self.prefetch_queues[channel].enqueue(packet)
    }

    /// Registers a predictor-issued parallel probe for `addr`.
    pub fn add_ddrp_request(&mut self, addr: address, cycle: u64, request_latency: u64) {
        let block = crate::block_addr(addr);
        self.ddrp_inflight
            .entry(block)
            .or_insert(cycle + request_latency + self.latency);
    }

    pub fn operate(&mut self, cycle: u64, out: &mut CycleOutput) {
        for channel in 0..self.read_queues.len() {
            // Demand reads drain before prefetches.
            while let Some(front) = self.read_queues[channel].first() {
                if front.event_cycle > cycle {
                    break;
                }
                let mut packet = self.read_queues[channel].dequeue().unwrap();
                self.ddrp_inflight.remove(&packet.address);
                packet.serve_from(Level::Dram);
                self.reads_served += 1;
                self.trace_access(cycle, false, packet.address);
                log::trace!("dram served {packet} at {cycle}");
                if !matches!(packet.requester, Requester::None) {
                    out.completions.push(packet);
                }
            }

            while let Some(front) = self.prefetch_queues[channel].first() {
                if front.event_cycle > cycle {
                    break;
                }
                let mut packet = self.prefetch_queues[channel].dequeue().unwrap();
                packet.serve_from(Level::Dram);
                self.reads_served += 1;
                if !matches!(packet.requester, Requester::None) {
                    out.completions.push(packet);
                }
            }

            while let Some(front) = self.write_queues[channel].first() {
                if front.event_cycle > cycle {
                    break;
                }
                let packet = self.write_queues[channel].dequeue().unwrap();
                debug_assert!(matches!(
                    packet.kind,
                    AccessKind::Writeback | AccessKind::Rfo
                ));
                self.writes_served += 1;
                self.trace_access(cycle, true, packet.address);
            }
        }

        // Expired probes nobody claimed.
        self.ddrp_inflight
            .retain(|_, &mut ready| ready + 10_000 > cycle);
    }

    #[must_use]
    pub fn read_queue_occupancy(&self) -> usize {
        self.read_queues.iter().map(Fifo::len).sum()
    }

    #[must_use]
    pub fn busy(&self) -> bool {
        self.read_queues.iter().any(|q| !q.is_empty())
            || self.write_queues.iter().any(|q| !q.is_empty())
            || self.prefetch_queues.iter().any(|q| !q.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::DramController;
    use crate::cache::CycleOutput;
    use crate::packet::{AccessKind, Level, Packet, Requester};

    fn controller() -> DramController {
        DramController::new(0, 1, 100, (8, 8, 8))
    }

    fn read(addr: u64) -> Packet {
        let mut packet = Packet::new(0, AccessKind::Load, addr, addr);
        packet.requester = Requester::Cache(1);
        packet
    }

    #[test]
    fn fixed_latency_service() {
        let mut dram = controller();
        dram.add_read_queue(read(0x1000), 10).unwrap();

        let mut out = CycleOutput::default();
        dram.operate(109, &mut out);
        assert!(out.completions.is_empty());

        dram.operate(110, &mut out);
        assert_eq!(out.completions.len(), 1);
        assert_eq!(out.completions[0].served_from, Some(Level::Dram));
        assert!(out.completions[0].went_offchip);
    }

    #[test]
    fn ddrp_probe_shortens_the_demand() {
        let mut dram = controller();
        dram.add_ddrp_request(0x1000, 0, 5);
        // demand arrives late; completes at the probe's ready time, not
        // cycle + latency
        dram.add_read_queue(read(0x1000), 50).unwrap();
        let mut out = CycleOutput::default();
        dram.operate(105, &mut out);
        assert_eq!(out.completions.len(), 1);
        assert_eq!(dram.ddrp_hits, 1);
    }

    #[test]
    fn decode_slices_the_address() {
        let dram = DramController::new(0, 2, 100, (8, 8, 8));
        let a = dram.decode(0x40);
        let b = dram.decode(0x80);
        assert_ne!((a.channel, a.column), (b.channel, b.column));
    }
}
