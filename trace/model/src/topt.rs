//! The `.topttrace` side format: the future vertex-id access sequence an
//! offline pass derives from a trace, consumed by the T-OPT replacement
//! policy as its reuse oracle.

use super::Error;
use std::io::{Read, Write};
use std::path::Path;

/// Writes vertex ids as a flat little-endian `u32` sequence.
pub struct ToptWriter<W: Write> {
    sink: W,
    written: u64,
}

impl<W: Write> ToptWriter<W> {
    pub fn new(sink: W) -> Self {
        Self { sink, written: 0 }
    }

    pub fn push(&mut self, vertex_id: u32) -> Result<(), Error> {
        self.sink.write_all(&vertex_id.to_le_bytes())?;
        self.written += 1;
        Ok(())
    }

    #[must_use]
    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn finish(mut self) -> Result<u64, Error> {
        self.sink.flush()?;
        Ok(self.written)
    }
}

/// Loads a whole `.topttrace` file into memory.
pub fn read_vertex_trace(path: impl AsRef<Path>) -> Result<Vec<u32>, Error> {
    let path = path.as_ref();
    let raw = std::fs::read(path).map_err(|source| Error::Open {
        path: path.to_path_buf(),
        source,
    })?;
    decode_vertex_trace(&mut raw.as_slice())
}

pub fn decode_vertex_trace(reader: &mut impl Read) -> Result<Vec<u32>, Error> {
    let mut vertices = Vec::new();
    let mut buf = [0u8; 4];
    loop {
        let mut got = 0;
        while got < buf.len() {
            match reader.read(&mut buf[got..])? {
                0 if got == 0 => return Ok(vertices),
                0 => return Err(Error::TruncatedRecord { got, want: 4 }),
                n => got += n,
            }
        }
        vertices.push(u32::from_le_bytes(buf));
    }
}

/// Name of the `.topttrace` sibling for a given trace path,
/// e.g. `foo.trace.xz` -> `foo.topttrace`.
#[must_use]
pub fn sibling_name(trace_path: &Path) -> std::path::PathBuf {
    let mut stem = trace_path
        .file_stem()
        .map(Path::new)
        .and_then(Path::file_stem)
        .unwrap_or_default()
        .to_os_string();
    stem.push(".topttrace");
    stem.into()
}

#[cfg(test)]
mod tests {
    use super::{decode_vertex_trace, sibling_name, ToptWriter};
    use std::path::Path;

    #[test]
    fn round_trip() {
        let mut buf = Vec::new();
        let mut writer = ToptWriter::new(&mut buf);
        for id in [0u32, 7, 42, u32::MAX] {
            writer.push(id).unwrap();
        }
        assert_eq!(writer.finish().unwrap(), 4);

        let decoded = decode_vertex_trace(&mut buf.as_slice()).unwrap();
        assert_eq!(decoded, vec![0, 7, 42, u32::MAX]);
    }

    #[test]
    fn truncated_stream_is_an_error() {
        let buf = vec![1u8, 0, 0, 0, 0xFF];
        assert!(decode_vertex_trace(&mut buf.as_slice()).is_err());
    }

    #[test]
    fn sibling_strips_both_extensions() {
        assert_eq!(
            sibling_name(Path::new("/traces/bfs.trace.xz")),
            Path::new("bfs.topttrace")
        );
    }
}
