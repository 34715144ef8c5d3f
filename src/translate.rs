use crate::hash::{lg2, rotr64};
use crate::{address, LOG2_BLOCK_SIZE, LOG2_PAGE_SIZE};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, HashSet, VecDeque};

const RECENT_PAGES_TRACKED: usize = 32 << 10;

/// Page-fault class of one translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    None,
    /// Fresh allocation.
    Minor,
    /// An NRU page was swapped out to make room.
    Major,
}

#[derive(Debug, Clone, Copy)]
pub struct Translation {
    pub paddr: address,
    pub fault: Fault,
}

/// Process-wide virtual-to-physical mapping.
///
/// Pages are handed out preferentially adjacent to the previous allocation;
/// when physical memory is exhausted, a page absent from the recent-access
/// window is re-mapped (major fault). Mutated only from the serial core-step
/// phase.
pub struct Translator {
    num_cpus: usize,
    dram_pages: u64,

    page_table: BTreeMap<u64, u64>,
    inverse_table: BTreeMap<u64, u64>,
    page_queue: VecDeque<u64>,
    recent_pages: VecDeque<u64>,
    recent_set: HashSet<u64>,

    previous_ppage: u64,
    num_adjacent_pages: u64,
    allocated_pages: u64,

    unique_lines: Vec<HashSet<u64>>,
    pub num_pages: Vec<u64>,
    pub minor_faults: Vec<u64>,
    pub major_faults: Vec<u64>,

    rng: SmallRng,
}

impl Translator {
    #[must_use]
    pub fn new(num_cpus: usize, dram_pages: u64) -> Self {
        Self {
            num_cpus,
            dram_pages,
            page_table: BTreeMap::new(),
            inverse_table: BTreeMap::new(),
            page_queue: VecDeque::new(),
            recent_pages: VecDeque::new(),
            recent_set: HashSet::new(),
            previous_ppage: 0,
            num_adjacent_pages: 0,
            allocated_pages: 0,
            unique_lines: vec![HashSet::new(); num_cpus],
            num_pages: vec![0; num_cpus],
            minor_faults: vec![0; num_cpus],
            major_faults: vec![0; num_cpus],
            rng: SmallRng::seed_from_u64(0xcafe),
        }
    }

    /// Physical page currently backing `vpage`, if any.
    #[must_use]
    pub fn lookup(&self, vpage: u64) -> Option<u64> {
        self.page_table.get(&vpage).copied()
    }

    /// Virtual page currently mapped onto `ppage`, if any.
    #[must_use]
    pub fn inverse_lookup(&self, ppage: u64) -> Option<u64> {
        self.inverse_table.get(&ppage).copied()
    }

    #[must_use]
    pub fn unique_lines(&self, cpu: usize) -> u64 {
        self.unique_lines[cpu].len() as u64
    }

    pub fn translate(&mut self, cpu: usize, vaddr: address) -> Translation {
        // Disambiguate homogeneous multi-programmed workloads by folding the
        // cpu id into the upper address bits.
        let high_bit_mask = rotr64(cpu as u64, lg2(self.num_cpus as u64));
        let unique_va = vaddr | high_bit_mask;
        let vpage = (vaddr >> LOG2_PAGE_SIZE) | high_bit_mask;
        let voffset = unique_va & ((1 << LOG2_PAGE_SIZE) - 1);

        self.unique_lines[cpu].insert(unique_va >> LOG2_BLOCK_SIZE);

        let mut fault = Fault::None;
        if !self.page_table.contains_key(&vpage) {
            fault = if self.allocated_pages >= self.dram_pages {
                self.swap_in(vpage);
                Fault::Major
            } else {
                self.allocate(cpu, vpage);
                Fault::Minor
            };
            match fault {
                Fault::Major => self.major_faults[cpu] += 1,
                _ => self.minor_faults[cpu] += 1,
            }
        }

        self.touch_recent(vpage);

        let ppage = self.page_table[&vpage];
        Translation {
            paddr: (ppage << LOG2_PAGE_SIZE) | voffset,
            fault,
        }
    }

    fn allocate(&mut self, cpu: usize, vpage: u64) {
        let mut fragmented = false;
        let mut ppage = if self.num_adjacent_pages > 0 {
            self.previous_ppage + 1
        } else {
            fragmented = true;
            self.random_ppage()
        };

        while self.inverse_table.contains_key(&ppage) {
            if self.num_adjacent_pages > 0 {
                fragmented = true;
            }
            ppage = self.random_ppage();
        }

        self.page_table.insert(vpage, ppage);
        self.inverse_table.insert(ppage, vpage);
        self.page_queue.push_back(vpage);
        self.previous_ppage = ppage;
        self.num_adjacent_pages = self.num_adjacent_pages.saturating_sub(1);
        self.num_pages[cpu] += 1;
        self.allocated_pages += 1;

        if fragmented {
            self.num_adjacent_pages = 1 << (self.rng.gen_range(0u32..10));
        }
    }

    /// Re-maps a page that has not been touched recently onto `vpage`.
    fn swap_in(&mut self, vpage: u64) {
        let nru_vpage = self
            .page_table
            .keys()
            .find(|candidate| !self.recent_set.contains(candidate))
            .copied()
            .or_else(|| self.page_table.keys().next().copied())
            .expect("swap with an empty page table");

        let ppage = self.page_table.remove(&nru_vpage).unwrap();
        self.page_table.insert(vpage, ppage);
        self.inverse_table.insert(ppage, vpage);

        self.page_queue.pop_front();
        self.page_queue.push_back(vpage);
        log::trace!("[swap] {nru_vpage:#x} -> {vpage:#x} on ppage {ppage:#x}");
    }

    fn touch_recent(&mut self, vpage: u64) {
        if self.recent_set.insert(vpage) {
            self.recent_pages.push_back(vpage);
            if self.recent_pages.len() > RECENT_PAGES_TRACKED {
                let evicted = self.recent_pages.pop_front().unwrap();
                self.recent_set.remove(&evicted);
            }
        }
    }

    fn random_ppage(&mut self) -> u64 {
        self.rng.gen_range(0..self.dram_pages)
    }
}

#[cfg(test)]
mod tests {
    use super::{Fault, Translator};

    #[test]
    fn translation_is_stable() {
        let mut translator = Translator::new(1, 1 << 10);
        let first = translator.translate(0, 0x1234_5678);
        let second = translator.translate(0, 0x1234_5678);
        assert_eq!(first.paddr, second.paddr);
        assert_eq!(first.fault, Fault::Minor);
        assert_eq!(second.fault, Fault::None);
    }

    #[test]
    fn offset_bits_pass_through() {
        let mut translator = Translator::new(1, 1 << 10);
        let translation = translator.translate(0, 0xABCD_E123);
        assert_eq!(translation.paddr & 0xFFF, 0x123);
    }

    #[test]
    fn inverse_table_matches() {
        let mut translator = Translator::new(1, 1 << 10);
        let translation = translator.translate(0, 0x8000_0000);
        let ppage = translation.paddr >> 12;
        assert_eq!(translator.inverse_lookup(ppage), Some(0x8000_0000 >> 12));
    }

    #[test]
    fn exhaustion_swaps_with_major_fault() {
        let mut translator = Translator::new(1, 4);
        for page in 0..4u64 {
            assert_eq!(translator.translate(0, page << 12).fault, Fault::Minor);
        }
        let faulted = translator.translate(0, 0x40_0000);
        assert_eq!(faulted.fault, Fault::Major);
        assert_eq!(translator.major_faults[0], 1);
    }
}
