//! # Chunk-Buffered Reader
//!
//! Random-access reads over an index or scratch file. The reader keeps one
//! chunk (default 512 KiB) in memory; sequential reads inside the chunk cost
//! nothing, a `seek` outside it triggers a single `pread`-sized refill.
//!
//! ## EOF Semantics
//!
//! Any read that would cross the end of file fails with
//! [`IndexError::Eof`] carrying the logical position. The merge stage of
//! the build pipeline relies on this to detect run exhaustion, so `Eof`
//! must stay recognizable through `eyre` context wrapping (see
//! `IndexError::is_eof`).

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use eyre::{ensure, Result, WrapErr};

use crate::config::READER_CHUNK_SIZE;
use crate::error::IndexError;

pub struct BinaryReader {
    file: File,
    file_len: u64,
    chunk: Vec<u8>,
    chunk_start: u64,
    chunk_size: usize,
    pos: u64,
}

impl BinaryReader {
    pub fn open(path: &Path) -> Result<Self> {
        Self::with_chunk_size(path, READER_CHUNK_SIZE)
    }

    pub fn with_chunk_size(path: &Path, chunk_size: usize) -> Result<Self> {
        ensure!(chunk_size > 0, "reader chunk size must be nonzero");
        let file = File::open(path)
            .wrap_err_with(|| format!("opening {} for reading", path.display()))?;
        let file_len = file.metadata()?.len();
        Ok(Self {
            file,
            file_len,
            chunk: Vec::new(),
            chunk_start: 0,
            chunk_size,
            pos: 0,
        })
    }

    pub fn len(&self) -> u64 {
        self.file_len
    }

    pub fn is_empty(&self) -> bool {
        self.file_len == 0
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Moves the logical read position. Cheap when the target is inside the
    /// buffered chunk.
    pub fn seek(&mut self, pos: u64) {
        self.pos = pos;
    }

    /// Drops the buffered chunk and re-reads the file length. Must be
    /// called after the underlying file was written through another
    /// handle.
    pub fn invalidate(&mut self) -> Result<()> {
        self.chunk.clear();
        self.chunk_start = 0;
        self.file_len = self.file.metadata()?.len();
        Ok(())
    }

    pub fn skip(&mut self, n: u64) {
        self.pos += n;
    }

    fn chunk_end(&self) -> u64 {
        self.chunk_start + self.chunk.len() as u64
    }

    fn refill(&mut self, at: u64) -> Result<()> {
        let remaining = self.file_len.saturating_sub(at);
        let want = (self.chunk_size as u64).min(remaining) as usize;
        self.chunk.resize(want, 0);
        self.file.seek(SeekFrom::Start(at))?;
        self.file.read_exact(&mut self.chunk)?;
        self.chunk_start = at;
        Ok(())
    }

    /// Copies exactly `buf.len()` bytes from the current position.
    pub fn get_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let n = buf.len() as u64;
        if self.pos + n > self.file_len {
            return Err(IndexError::Eof(self.pos).into());
        }

        // Oversized reads bypass the chunk buffer entirely.
        if buf.len() > self.chunk_size {
            self.file.seek(SeekFrom::Start(self.pos))?;
            self.file.read_exact(buf)?;
            self.pos += n;
            return Ok(());
        }

        if self.pos < self.chunk_start || self.pos + n > self.chunk_end() {
            self.refill(self.pos)?;
        }
        let start = (self.pos - self.chunk_start) as usize;
        buf.copy_from_slice(&self.chunk[start..start + buf.len()]);
        self.pos += n;
        Ok(())
    }

    pub fn get(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; n];
        self.get_exact(&mut buf)?;
        Ok(buf)
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        let mut b = [0u8; 1];
        self.get_exact(&mut b)?;
        Ok(b[0])
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        let mut b = [0u8; 2];
        self.get_exact(&mut b)?;
        Ok(u16::from_be_bytes(b))
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        let mut b = [0u8; 4];
        self.get_exact(&mut b)?;
        Ok(u32::from_be_bytes(b))
    }

    /// 48-bit big-endian pointer, widened to u64.
    pub fn get_u48(&mut self) -> Result<u64> {
        let mut b = [0u8; 8];
        self.get_exact(&mut b[2..])?;
        Ok(u64::from_be_bytes(b))
    }

    pub fn get_i64(&mut self) -> Result<i64> {
        let mut b = [0u8; 8];
        self.get_exact(&mut b)?;
        Ok(i64::from_be_bytes(b))
    }

    pub fn get_f64(&mut self) -> Result<f64> {
        let mut b = [0u8; 8];
        self.get_exact(&mut b)?;
        Ok(f64::from_be_bytes(b))
    }
}

impl std::fmt::Debug for BinaryReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinaryReader")
            .field("file_len", &self.file_len)
            .field("pos", &self.pos)
            .field("chunk_start", &self.chunk_start)
            .field("chunk_len", &self.chunk.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    fn file_with(bytes: &[u8]) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(bytes)
            .unwrap();
        (dir, path)
    }

    #[test]
    fn sequential_reads_cross_chunk_boundary() {
        let data: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let (_dir, path) = file_with(&data);
        let mut reader = BinaryReader::with_chunk_size(&path, 64).unwrap();

        let mut out = Vec::new();
        for _ in 0..1000 {
            out.push(reader.get_u8().unwrap());
        }
        assert_eq!(out, data);
    }

    #[test]
    fn seek_backwards_refills_chunk() {
        let data: Vec<u8> = (0..200u8).collect();
        let (_dir, path) = file_with(&data);
        let mut reader = BinaryReader::with_chunk_size(&path, 32).unwrap();

        reader.seek(150);
        assert_eq!(reader.get_u8().unwrap(), 150);
        reader.seek(3);
        assert_eq!(reader.get_u8().unwrap(), 3);
    }

    #[test]
    fn big_endian_integers() {
        let (_dir, path) = file_with(&[0x01, 0x02, 0x03, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0x2A]);
        let mut reader = BinaryReader::open(&path).unwrap();

        assert_eq!(reader.get_u32().unwrap(), 0x01020304);
        assert_eq!(reader.get_u48().unwrap(), 0x2A);
    }

    #[test]
    fn read_past_end_is_typed_eof() {
        let (_dir, path) = file_with(&[1, 2, 3]);
        let mut reader = BinaryReader::open(&path).unwrap();

        reader.seek(2);
        let err = reader.get_u32().unwrap_err();
        assert!(IndexError::is_eof(&err));
    }

    #[test]
    fn oversized_read_bypasses_chunk() {
        let data = vec![7u8; 300];
        let (_dir, path) = file_with(&data);
        let mut reader = BinaryReader::with_chunk_size(&path, 16).unwrap();

        let out = reader.get(300).unwrap();
        assert_eq!(out, data);
        assert_eq!(reader.position(), 300);
    }
}
