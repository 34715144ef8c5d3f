use crate::packet::{AccessKind, FillLevel, Packet};
use crate::address;
use bitvec::vec::BitVec;

/// State of one cache line.
///
/// `dirty` implies `valid`; the blocked cache keeps the two plain bits,
/// the sectored cache additionally tracks per-word valid/dirty bitmaps
/// next to the block (see `cache::sectored`).
#[derive(Debug, Clone, Default)]
pub struct Block {
    pub valid: bool,
    pub dirty: bool,
    pub tag: address,
    pub full_addr: address,
    pub v_addr: address,
    pub ip: u64,
    pub cpu: usize,
    pub kind: Option<AccessKind>,
    pub fill_level: Option<FillLevel>,
    pub prefetched: bool,
    pub used: bool,
}

impl Block {
    pub fn fill(&mut self, tag: address, packet: &Packet) {
        debug_assert!(!self.dirty || self.valid);
        self.valid = true;
        self.dirty = matches!(packet.kind, AccessKind::Rfo | AccessKind::Writeback);
        self.tag = tag;
        self.full_addr = packet.full_addr;
        self.v_addr = packet.v_addr;
        self.ip = packet.ip;
        self.cpu = packet.cpu;
        self.kind = Some(packet.kind);
        self.fill_level = Some(packet.fill_level);
        self.prefetched = packet.is_prefetch();
        self.used = false;
    }

    pub fn invalidate(&mut self) {
        self.valid = false;
        self.dirty = false;
        self.prefetched = false;
        self.used = false;
    }
}

/// Footprint of touched words inside a block, sized
/// `block_size / word_granularity`.
#[derive(Debug, Clone)]
pub struct Footprint {
    bits: BitVec,
}

impl Footprint {
    #[must_use]
    pub fn new(words: usize) -> Self {
        Self {
            bits: BitVec::repeat(false, words),
        }
    }

    /// Marks a `size`-byte run starting at byte `offset`, wrapping modulo
    /// the block size.
    pub fn touch(&mut self, offset: usize, size: usize, word_granularity: usize) {
        let words = self.bits.len();
        let block_size = words * word_granularity;
        for i in 0..size {
            let byte = (offset + i) % block_size;
            self.bits.set(byte / word_granularity, true);
        }
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.bits.count_ones()
    }

    pub fn clear(&mut self) {
        self.bits.fill(false);
    }
}

#[cfg(test)]
mod tests {
    use super::Footprint;

    #[test]
    fn touch_sets_word_bits() {
        // 64-byte block, 4-byte words.
        let mut footprint = Footprint::new(16);
        footprint.touch(0, 4, 4);
        footprint.touch(8, 4, 4);
        footprint.touch(40, 4, 4);
        assert_eq!(footprint.count(), 3);
    }

    #[test]
    fn touch_wraps_modulo_block() {
        let mut footprint = Footprint::new(16);
        footprint.touch(62, 4, 4);
        // bytes 62,63,0,1 -> words 15 and 0
        assert_eq!(footprint.count(), 2);
    }
}
