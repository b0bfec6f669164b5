//! Append-only commitment journal
//!
//! The journal exists purely so an accepted commitment is never lost: once
//! `JournalWriter::submit` returns, the record is on disk and fsynced,
//! regardless of what happens to the in-memory aggregator/calendar state
//! afterwards. Everything else (the pending set, the unconfirmed Bitcoin
//! tx, the `CalendarStore`) can be rebuilt by replaying the journal.
//!
//! Grounded on `otsserver/calendar.py`'s `Journal`/`JournalWriter`: one
//! append handle, one (or more) read handles doing positional reads, fixed
//! record size, startup padding to the next record boundary.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use thiserror::Error;

/// Size in bytes of a single journal record: `t[4] (big-endian seconds) ||
/// root[32] (Merkle root the calendar committed) || mac[8] (truncated
/// per-time-bucket MAC)`. Derived from the Calendar facade's commitment
/// construction (§4.3), not chosen independently.
pub const RECORD_SIZE: u64 = 44;

/// Errors from journal reads and writes.
#[derive(Debug, Error)]
pub enum JournalError {
    /// Underlying filesystem operation failed.
    #[error("journal I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// `submit` was called with a commitment that isn't exactly
    /// [`RECORD_SIZE`] bytes.
    #[error("journal commitment must be exactly {RECORD_SIZE} bytes, got {0}")]
    WrongSize(usize),

    /// Requested an index past the end of the journal.
    #[error("journal index {0} not yet written")]
    NotFound(u64),
}

type Result<T> = std::result::Result<T, JournalError>;

/// Read-only handle onto the journal file. Safe to open many of these
/// concurrently with a single [`JournalWriter`] appending — reads are
/// positional (`seek` + `read`) and never touch the writer's append cursor.
pub struct Journal {
    read_fd: File,
}

impl Journal {
    /// Open the journal at `path` for reading. The file must already exist
    /// (created by [`JournalWriter::open`]).
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self { read_fd: File::open(path)? })
    }

    /// Read the `idx`-th record.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::NotFound`] if `idx` is beyond the current
    /// end of the file (including a trailing partial record, which never
    /// happens once [`JournalWriter`] has padded it away, but could in a
    /// read-only mirror racing a writer).
    pub fn get(&mut self, idx: u64) -> Result<[u8; RECORD_SIZE as usize]> {
        self.read_fd.seek(SeekFrom::Start(idx * RECORD_SIZE))?;
        let mut buf = [0u8; RECORD_SIZE as usize];
        self.read_fd.read_exact(&mut buf).map_err(|_| JournalError::NotFound(idx))?;
        Ok(buf)
    }

    /// Number of complete records currently in the file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file's metadata can't be read.
    pub fn len(&self) -> Result<u64> {
        Ok(self.read_fd.metadata()?.len() / RECORD_SIZE)
    }

    /// Whether the journal has no complete records yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the file's metadata can't be read.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

/// Single-writer append handle onto the journal file.
pub struct JournalWriter {
    append_fd: File,
}

impl JournalWriter {
    /// Open (creating if needed) the journal at `path` for appending. If
    /// the file's length isn't a multiple of [`RECORD_SIZE`] — a previous
    /// write was interrupted mid-record — pad it with zero bytes up to the
    /// next boundary before accepting new writes. The padding record is
    /// inert: it has no valid `mac`, so no reader will ever match it to a
    /// real commitment.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or the padding write
    /// fails.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut append_fd = OpenOptions::new().create(true).append(true).open(path)?;

        let pos = append_fd.stream_position()?;
        let excess = pos % RECORD_SIZE;
        if excess != 0 {
            log::error!(
                "journal size not a multiple of record size; {} bytes excess; writing padding",
                excess
            );
            let padding = vec![0u8; (RECORD_SIZE - excess) as usize];
            append_fd.write_all(&padding)?;
            append_fd.sync_all()?;
        }

        log::info!("journal has {} entries", append_fd.stream_position()? / RECORD_SIZE);
        Ok(Self { append_fd })
    }

    /// Append `commitment` to the journal. Returns only once the write is
    /// flushed and fsynced to disk — the caller (the calendar, via the
    /// aggregator) must not acknowledge the submission before this returns.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::WrongSize`] if `commitment` isn't exactly
    /// [`RECORD_SIZE`] bytes, or an I/O error if the write or fsync fails.
    pub fn submit(&mut self, commitment: &[u8]) -> Result<()> {
        if commitment.len() != RECORD_SIZE as usize {
            return Err(JournalError::WrongSize(commitment.len()));
        }
        debug_assert_eq!(self.append_fd.stream_position()? % RECORD_SIZE, 0);
        self.append_fd.write_all(commitment)?;
        self.append_fd.flush()?;
        self.append_fd.sync_all()?;
        Ok(())
    }

    /// Open a fresh read-only [`Journal`] handle onto the same file. The
    /// writer keeps its own append cursor; readers always seek
    /// explicitly, so this never interferes with ongoing writes.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be reopened for reading.
    pub fn reader(&self, path: impl AsRef<Path>) -> Result<Journal> {
        Journal::open(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record(byte: u8) -> Vec<u8> {
        vec![byte; RECORD_SIZE as usize]
    }

    #[test]
    fn submit_then_read_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("journal");

        let mut writer = JournalWriter::open(&path).unwrap();
        writer.submit(&record(0xaa)).unwrap();
        writer.submit(&record(0xbb)).unwrap();

        let mut reader = Journal::open(&path).unwrap();
        assert_eq!(reader.get(0).unwrap(), [0xaa; RECORD_SIZE as usize]);
        assert_eq!(reader.get(1).unwrap(), [0xbb; RECORD_SIZE as usize]);
        assert_eq!(reader.len().unwrap(), 2);
    }

    #[test]
    fn reading_past_the_end_is_not_found() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("journal");

        let mut writer = JournalWriter::open(&path).unwrap();
        writer.submit(&record(1)).unwrap();

        let mut reader = Journal::open(&path).unwrap();
        assert!(matches!(reader.get(1), Err(JournalError::NotFound(1))));
    }

    #[test]
    fn wrong_size_commitment_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("journal");
        let mut writer = JournalWriter::open(&path).unwrap();
        let err = writer.submit(&[0u8; 10]).unwrap_err();
        assert!(matches!(err, JournalError::WrongSize(10)));
    }

    #[test]
    fn reopen_pads_a_partial_trailing_record() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("journal");

        {
            let mut writer = JournalWriter::open(&path).unwrap();
            writer.submit(&record(0x11)).unwrap();
        }
        // simulate a crash mid-write: truncate to a non-multiple length
        {
            let file = OpenOptions::new().write(true).open(&path).unwrap();
            file.set_len(RECORD_SIZE + 10).unwrap();
        }

        let mut writer = JournalWriter::open(&path).unwrap();
        // after padding, the next write lands at index 2, not inside the
        // partial record
        writer.submit(&record(0x22)).unwrap();
        drop(writer);

        let mut reader = Journal::open(&path).unwrap();
        assert_eq!(reader.len().unwrap(), 3);
        assert_eq!(reader.get(0).unwrap(), [0x11; RECORD_SIZE as usize]);
        assert_eq!(reader.get(2).unwrap(), [0x22; RECORD_SIZE as usize]);
    }

    #[test]
    fn empty_journal_reports_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("journal");
        let _writer = JournalWriter::open(&path).unwrap();
        let reader = Journal::open(&path).unwrap();
        assert!(reader.is_empty().unwrap());
    }
}
