//! # Append/Patch Writer
//!
//! Tree builds stream bytes forward but must fix up a handful of fields
//! whose values are only known at the end (tree byte length, entry and value
//! counts). The [`BinaryWriter`] trait models exactly that: `append` for the
//! streaming path, `write_at` for the patches.
//!
//! [`FileWriter`] buffers appends in memory and keeps track of how much has
//! reached the file; a patch landing inside the unflushed tail is applied to
//! the buffer directly, anything earlier is an explicit seek-write-seek.
//! [`BufferWriter`] backs the same trait with a growable `Vec<u8>` for
//! in-memory tree construction in tests and for small rebuild targets.

use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use eyre::{ensure, Result, WrapErr};

const APPEND_BUFFER_LIMIT: usize = 256 * 1024;

pub trait BinaryWriter {
    /// Appends bytes at the end, returning the offset they were written at.
    fn append(&mut self, bytes: &[u8]) -> Result<u64>;

    /// Overwrites previously appended bytes at an absolute offset.
    fn write_at(&mut self, bytes: &[u8], pos: u64) -> Result<()>;

    /// Total bytes appended so far (the next append offset).
    fn position(&self) -> u64;

    /// Flushes buffered appends and syncs to durable storage where the sink
    /// has one.
    fn sync(&mut self) -> Result<()>;
}

pub struct FileWriter {
    file: File,
    flushed: u64,
    pending: Vec<u8>,
}

impl FileWriter {
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)
            .wrap_err_with(|| format!("creating {} for writing", path.display()))?;
        Ok(Self {
            file,
            flushed: 0,
            pending: Vec::new(),
        })
    }

    pub fn into_file(mut self) -> Result<File> {
        self.flush_pending()?;
        Ok(self.file)
    }

    fn flush_pending(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        self.file.seek(SeekFrom::Start(self.flushed))?;
        self.file.write_all(&self.pending)?;
        self.flushed += self.pending.len() as u64;
        self.pending.clear();
        Ok(())
    }
}

impl BinaryWriter for FileWriter {
    fn append(&mut self, bytes: &[u8]) -> Result<u64> {
        let offset = self.position();
        self.pending.extend_from_slice(bytes);
        if self.pending.len() >= APPEND_BUFFER_LIMIT {
            self.flush_pending()?;
        }
        Ok(offset)
    }

    fn write_at(&mut self, bytes: &[u8], pos: u64) -> Result<()> {
        let end = pos + bytes.len() as u64;
        ensure!(
            end <= self.position(),
            "patch at {}..{} beyond written length {}",
            pos,
            end,
            self.position()
        );

        if pos >= self.flushed {
            let start = (pos - self.flushed) as usize;
            self.pending[start..start + bytes.len()].copy_from_slice(bytes);
            return Ok(());
        }

        // Patch straddling the flush boundary: push everything out first.
        self.flush_pending()?;
        self.file.seek(SeekFrom::Start(pos))?;
        self.file.write_all(bytes)?;
        Ok(())
    }

    fn position(&self) -> u64 {
        self.flushed + self.pending.len() as u64
    }

    fn sync(&mut self) -> Result<()> {
        self.flush_pending()?;
        self.file.sync_all()?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct BufferWriter {
    buf: Vec<u8>,
}

impl BufferWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }
}

impl BinaryWriter for BufferWriter {
    fn append(&mut self, bytes: &[u8]) -> Result<u64> {
        let offset = self.buf.len() as u64;
        self.buf.extend_from_slice(bytes);
        Ok(offset)
    }

    fn write_at(&mut self, bytes: &[u8], pos: u64) -> Result<()> {
        let start = pos as usize;
        let end = start + bytes.len();
        ensure!(
            end <= self.buf.len(),
            "patch at {}..{} beyond written length {}",
            start,
            end,
            self.buf.len()
        );
        self.buf[start..end].copy_from_slice(bytes);
        Ok(())
    }

    fn position(&self) -> u64 {
        self.buf.len() as u64
    }

    fn sync(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn buffer_writer_append_and_patch() {
        let mut w = BufferWriter::new();
        assert_eq!(w.append(b"hello ").unwrap(), 0);
        assert_eq!(w.append(b"world").unwrap(), 6);

        w.write_at(b"WORLD", 6).unwrap();
        assert_eq!(w.as_bytes(), b"hello WORLD");
    }

    #[test]
    fn buffer_writer_rejects_patch_past_end() {
        let mut w = BufferWriter::new();
        w.append(b"abc").unwrap();
        assert!(w.write_at(b"xy", 2).is_err());
    }

    #[test]
    fn file_writer_patches_flushed_and_pending_regions() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.bin");

        let mut w = FileWriter::create(&path).unwrap();
        w.append(&[0u8; 10]).unwrap();
        w.sync().unwrap(); // force the first region to disk
        w.append(&[1u8; 10]).unwrap();

        w.write_at(&[0xAA, 0xAB], 4).unwrap(); // flushed region
        w.write_at(&[0xBB], 15).unwrap(); // pending region
        w.sync().unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len(), 20);
        assert_eq!(&bytes[4..6], &[0xAA, 0xAB]);
        assert_eq!(bytes[15], 0xBB);
        assert_eq!(bytes[0], 0);
        assert_eq!(bytes[19], 1);
    }

    #[test]
    fn file_writer_position_tracks_appends() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.bin");

        let mut w = FileWriter::create(&path).unwrap();
        assert_eq!(w.position(), 0);
        w.append(&[0u8; 7]).unwrap();
        assert_eq!(w.position(), 7);
    }
}
