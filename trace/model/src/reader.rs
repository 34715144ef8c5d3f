use super::{Error, Instruction, TraceHeader, INSTRUCTION_RECORD_SIZE};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use xz2::read::XzDecoder;

/// Streaming reader over an xz-compressed instruction trace.
///
/// The trace is consumed lazily and restarted transparently on EOF, so a
/// warmup + measurement window longer than the trace keeps producing
/// instructions. The irregular-array header is parsed once up front and
/// skipped again on every restart.
pub struct InstructionReader {
    path: PathBuf,
    header: TraceHeader,
    decoder: XzDecoder<File>,
    restarts: u64,
}

impl std::fmt::Debug for InstructionReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstructionReader")
            .field("path", &self.path)
            .field("irreg_arrays", &self.header.irreg_arrays.len())
            .field("restarts", &self.restarts)
            .finish()
    }
}

impl InstructionReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let mut decoder = Self::decoder(&path)?;
        let header = TraceHeader::read(&mut decoder)?;
        log::debug!(
            "opened trace {} ({} irregular arrays)",
            path.display(),
            header.irreg_arrays.len()
        );
        Ok(Self {
            path,
            header,
            decoder,
            restarts: 0,
        })
    }

    fn decoder(path: &Path) -> Result<XzDecoder<File>, Error> {
        let file = File::open(path).map_err(|source| Error::Open {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(XzDecoder::new(file))
    }

    #[must_use]
    pub fn header(&self) -> &TraceHeader {
        &self.header
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// How often the trace wrapped around so far.
    #[must_use]
    pub fn restarts(&self) -> u64 {
        self.restarts
    }

    /// Next decoded instruction, restarting the trace on EOF.
    pub fn next_instruction(&mut self) -> Result<Instruction, Error> {
        let mut raw = [0u8; INSTRUCTION_RECORD_SIZE];
        loop {
            match read_record(&mut self.decoder, &mut raw)? {
                Record::Full => return Ok(Instruction::from_le_bytes(&raw)),
                Record::Eof => {
                    self.restart()?;
                }
            }
        }
    }

    fn restart(&mut self) -> Result<(), Error> {
        self.decoder = Self::decoder(&self.path)?;
        let header = TraceHeader::read(&mut self.decoder)?;
        if header != self.header {
            return Err(Error::Header(
                "trace header changed between loops".to_string(),
            ));
        }
        self.restarts += 1;
        log::debug!(
            "trace {} wrapped around (restart #{})",
            self.path.display(),
            self.restarts
        );
        Ok(())
    }
}

enum Record {
    Full,
    Eof,
}

/// Reads exactly one record, distinguishing a clean EOF from a torn one.
fn read_record(reader: &mut impl Read, buf: &mut [u8]) -> Result<Record, Error> {
    let mut got = 0usize;
    while got < buf.len() {
        match reader.read(&mut buf[got..])? {
            0 if got == 0 => return Ok(Record::Eof),
            0 => {
                return Err(Error::TruncatedRecord {
                    got,
                    want: buf.len(),
                })
            }
            n => got += n,
        }
    }
    Ok(Record::Full)
}

#[cfg(test)]
mod tests {
    use super::InstructionReader;
    use crate::{Instruction, TraceHeader};
    use std::io::Write;
    use xz2::write::XzEncoder;

    fn write_trace(header: &TraceHeader, instructions: &[Instruction]) -> tempfile::NamedTempFile {
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut encoder = XzEncoder::new(file.reopen().unwrap(), 6);
        header.write(&mut encoder).unwrap();
        for instr in instructions {
            encoder.write_all(&instr.to_le_bytes()).unwrap();
        }
        encoder.finish().unwrap();
        file
    }

    fn load(ip: u64, vaddr: u64) -> Instruction {
        Instruction {
            ip,
            source_memory: [vaddr, 0, 0, 0],
            ..Instruction::default()
        }
    }

    #[test]
    fn reads_header_then_instructions() {
        let header = TraceHeader {
            irreg_arrays: vec![(0x4000, 0x4FFF)],
        };
        let instructions = vec![load(0x100, 0x4000), load(0x104, 0x4004)];
        let file = write_trace(&header, &instructions);

        let mut reader = InstructionReader::open(file.path()).unwrap();
        similar_asserts::assert_eq!(&header, reader.header());
        assert_eq!(reader.next_instruction().unwrap(), instructions[0]);
        assert_eq!(reader.next_instruction().unwrap(), instructions[1]);
    }

    #[test]
    fn wraps_around_on_eof() {
        let header = TraceHeader::default();
        let instructions = vec![load(0x100, 0x4000)];
        let file = write_trace(&header, &instructions);

        let mut reader = InstructionReader::open(file.path()).unwrap();
        for _ in 0..3 {
            assert_eq!(reader.next_instruction().unwrap(), instructions[0]);
        }
        assert_eq!(reader.restarts(), 2);
    }
}
