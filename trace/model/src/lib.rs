pub mod reader;
pub mod topt;

pub use reader::InstructionReader;

use serde::{Deserialize, Serialize};

/// Number of source operands of a trace instruction record.
pub const NUM_INSTR_SOURCES: usize = 4;
/// Number of destination operands of a trace instruction record.
pub const NUM_INSTR_DESTINATIONS: usize = 2;

/// On-disk size of one little-endian x86 instruction record.
///
/// ip (8) + is_branch (1) + branch_taken (1)
/// + destination registers (2) + source registers (4)
/// + destination memory (2 x 8) + source memory (4 x 8)
pub const INSTRUCTION_RECORD_SIZE: usize =
    8 + 1 + 1 + NUM_INSTR_DESTINATIONS + NUM_INSTR_SOURCES + 8 * NUM_INSTR_DESTINATIONS + 8 * NUM_INSTR_SOURCES;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("trace file {path} could not be opened")]
    Open {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[error("trace ended in the middle of a record ({got} of {want} bytes)")]
    TruncatedRecord { got: usize, want: usize },

    #[error("malformed trace header: {0}")]
    Header(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Boundaries `(begin, end)` of one irregular virtual-address range
/// flagged in the trace header (e.g. a graph vertex or edge array).
pub type IrregArrayBounds = (u64, u64);

/// The header every trace starts with: the irregular-array ranges
/// that downstream predictors and the T-OPT tooling care about.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceHeader {
    pub irreg_arrays: Vec<IrregArrayBounds>,
}

impl TraceHeader {
    /// Serialized size in bytes: a `u64` count followed by the pairs.
    #[must_use]
    pub fn byte_len(&self) -> usize {
        8 + 16 * self.irreg_arrays.len()
    }

    pub fn read(reader: &mut impl std::io::Read) -> Result<Self, Error> {
        let mut buf = [0u8; 8];
        reader.read_exact(&mut buf)?;
        let pairs = u64::from_le_bytes(buf);
        // An absurd count is a corrupt header, not an allocation request.
        if pairs > 1 << 20 {
            return Err(Error::Header(format!("{pairs} irregular array pairs")));
        }
        let mut irreg_arrays = Vec::with_capacity(pairs as usize);
        for _ in 0..pairs {
            let mut pair = [0u8; 16];
            reader.read_exact(&mut pair)?;
            let begin = u64::from_le_bytes(pair[..8].try_into().unwrap());
            let end = u64::from_le_bytes(pair[8..].try_into().unwrap());
            if begin > end {
                return Err(Error::Header(format!(
                    "inverted array bounds {begin:#x}..{end:#x}"
                )));
            }
            irreg_arrays.push((begin, end));
        }
        Ok(Self { irreg_arrays })
    }

    pub fn write(&self, writer: &mut impl std::io::Write) -> Result<(), Error> {
        writer.write_all(&(self.irreg_arrays.len() as u64).to_le_bytes())?;
        for (begin, end) in &self.irreg_arrays {
            writer.write_all(&begin.to_le_bytes())?;
            writer.write_all(&end.to_le_bytes())?;
        }
        Ok(())
    }

    /// Vertex id of `vaddr` if it falls inside one of the irregular arrays.
    ///
    /// Ids are indices of 4-byte elements counted from the array base.
    #[must_use]
    pub fn vertex_id(&self, vaddr: u64) -> Option<u32> {
        self.irreg_arrays
            .iter()
            .find(|(begin, end)| vaddr >= *begin && vaddr <= *end)
            .map(|(begin, _)| ((vaddr - begin) / 4) as u32)
    }
}

/// One decoded x86 instruction record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    pub ip: u64,
    pub is_branch: bool,
    pub branch_taken: bool,
    pub destination_registers: [u8; NUM_INSTR_DESTINATIONS],
    pub source_registers: [u8; NUM_INSTR_SOURCES],
    pub destination_memory: [u64; NUM_INSTR_DESTINATIONS],
    pub source_memory: [u64; NUM_INSTR_SOURCES],
}

impl Instruction {
    #[must_use]
    pub fn from_le_bytes(raw: &[u8; INSTRUCTION_RECORD_SIZE]) -> Self {
        let mut at = 0usize;
        let mut take_u64 = |raw: &[u8]| {
            let v = u64::from_le_bytes(raw[at..at + 8].try_into().unwrap());
            at += 8;
            v
        };
        let ip = take_u64(raw);
        let is_branch = raw[at] != 0;
        let branch_taken = raw[at + 1] != 0;
        at += 2;

        let mut destination_registers = [0u8; NUM_INSTR_DESTINATIONS];
        destination_registers.copy_from_slice(&raw[at..at + NUM_INSTR_DESTINATIONS]);
        at += NUM_INSTR_DESTINATIONS;

        let mut source_registers = [0u8; NUM_INSTR_SOURCES];
        source_registers.copy_from_slice(&raw[at..at + NUM_INSTR_SOURCES]);
        at += NUM_INSTR_SOURCES;

        let mut take_u64 = |raw: &[u8]| {
            let v = u64::from_le_bytes(raw[at..at + 8].try_into().unwrap());
            at += 8;
            v
        };
        let mut destination_memory = [0u64; NUM_INSTR_DESTINATIONS];
        for slot in &mut destination_memory {
            *slot = take_u64(raw);
        }
        let mut source_memory = [0u64; NUM_INSTR_SOURCES];
        for slot in &mut source_memory {
            *slot = take_u64(raw);
        }

        Self {
            ip,
            is_branch,
            branch_taken,
            destination_registers,
            source_registers,
            destination_memory,
            source_memory,
        }
    }

    #[must_use]
    pub fn to_le_bytes(&self) -> [u8; INSTRUCTION_RECORD_SIZE] {
        let mut raw = [0u8; INSTRUCTION_RECORD_SIZE];
        let mut at = 0usize;
        raw[at..at + 8].copy_from_slice(&self.ip.to_le_bytes());
        at += 8;
        raw[at] = u8::from(self.is_branch);
        raw[at + 1] = u8::from(self.branch_taken);
        at += 2;
        raw[at..at + NUM_INSTR_DESTINATIONS].copy_from_slice(&self.destination_registers);
        at += NUM_INSTR_DESTINATIONS;
        raw[at..at + NUM_INSTR_SOURCES].copy_from_slice(&self.source_registers);
        at += NUM_INSTR_SOURCES;
        for mem in self
            .destination_memory
            .iter()
            .chain(self.source_memory.iter())
        {
            raw[at..at + 8].copy_from_slice(&mem.to_le_bytes());
            at += 8;
        }
        raw
    }

    /// Memory references of this instruction, sources before destinations.
    pub fn memory_references(&self) -> impl Iterator<Item = MemoryReference> + '_ {
        let loads = self
            .source_memory
            .iter()
            .filter(|&&vaddr| vaddr != 0)
            .map(|&vaddr| MemoryReference {
                vaddr,
                is_store: false,
            });
        let stores = self
            .destination_memory
            .iter()
            .filter(|&&vaddr| vaddr != 0)
            .map(|&vaddr| MemoryReference {
                vaddr,
                is_store: true,
            });
        loads.chain(stores)
    }

    #[must_use]
    pub fn is_memory(&self) -> bool {
        self.memory_references().next().is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryReference {
    pub vaddr: u64,
    pub is_store: bool,
}

#[cfg(test)]
mod tests {
    use super::{Instruction, TraceHeader, INSTRUCTION_RECORD_SIZE};

    #[test]
    fn header_round_trip() {
        let header = TraceHeader {
            irreg_arrays: vec![(0x1000, 0x1FFF), (0x8000_0000, 0x8010_0000)],
        };
        let mut buf = Vec::new();
        header.write(&mut buf).unwrap();
        assert_eq!(buf.len(), header.byte_len());

        let decoded = TraceHeader::read(&mut buf.as_slice()).unwrap();
        similar_asserts::assert_eq!(header, decoded);
    }

    #[test]
    fn header_rejects_inverted_bounds() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&1u64.to_le_bytes());
        buf.extend_from_slice(&0x2000u64.to_le_bytes());
        buf.extend_from_slice(&0x1000u64.to_le_bytes());
        assert!(TraceHeader::read(&mut buf.as_slice()).is_err());
    }

    #[test]
    fn instruction_round_trip() {
        let instr = Instruction {
            ip: 0xdead_beef_0000_1234,
            is_branch: true,
            branch_taken: false,
            destination_registers: [3, 0],
            source_registers: [1, 2, 0, 0],
            destination_memory: [0x7000_0000, 0],
            source_memory: [0x1000, 0x2040, 0, 0],
        };
        let raw = instr.to_le_bytes();
        assert_eq!(raw.len(), INSTRUCTION_RECORD_SIZE);
        similar_asserts::assert_eq!(instr, Instruction::from_le_bytes(&raw));
    }

    #[test]
    fn vertex_id_is_element_index() {
        let header = TraceHeader {
            irreg_arrays: vec![(0x1000, 0x1FFF)],
        };
        assert_eq!(header.vertex_id(0x1000), Some(0));
        assert_eq!(header.vertex_id(0x100C), Some(3));
        assert_eq!(header.vertex_id(0x2000), None);
    }

    #[test]
    fn memory_references_skip_empty_slots() {
        let instr = Instruction {
            source_memory: [0x10, 0, 0x20, 0],
            destination_memory: [0, 0x30],
            ..Instruction::default()
        };
        let refs: Vec<_> = instr.memory_references().collect();
        assert_eq!(refs.len(), 3);
        assert!(!refs[0].is_store);
        assert!(refs[2].is_store);
        assert_eq!(refs[2].vaddr, 0x30);
    }
}
