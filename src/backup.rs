//! Backup producer
//!
//! Exposes the calendar's history as a sequence of deterministic, immutable
//! byte chunks, each covering [`PAGING`] consecutive journal entries.
//! Grounded on `otsserver/backup.py`'s `Backup`: walk each covered journal
//! entry's full timestamp tree out of the store, flatten every reachable
//! node into a `message -> shallow encoding` map, sort by key, and
//! concatenate as length-prefixed records.
//!
//! Unlike the Python original, completed chunks are cached to disk at
//! `backup_cache/kkk/kkkkkk`: confirmation is monotone (a chunk that's
//! complete stays complete), so once written a cache entry never needs
//! invalidating.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;

use crate::calendar::{Calendar, CalendarError};
use crate::calendar_store::{CalendarStore, StoreError};
use crate::journal::Journal;
use crate::ots::{OtsError, Serializer, Timestamp};

/// Number of journal entries per chunk.
pub const PAGING: u64 = 1000;

/// Errors from producing or reading a backup chunk.
#[derive(Debug, Error)]
pub enum BackupError {
    /// Chunk `k` isn't fully available: some journal entry in its range is
    /// missing, or its timestamp tree isn't fully present in the store yet.
    #[error("backup chunk {0} is not yet complete")]
    NotFound(u64),

    /// The calendar store reported an error unrelated to a missing entry.
    #[error("calendar store error: {0}")]
    Store(#[from] StoreError),

    /// Encoding a node's shallow form failed.
    #[error("codec error: {0}")]
    Codec(#[from] OtsError),

    /// The on-disk cache could not be read or written.
    #[error("backup cache I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Producer and cache for backup chunks.
///
/// Holds its own journal read handle behind a `Mutex`, since `Journal::get`
/// takes `&mut self` but many HTTP handlers may call `get_chunk` at once.
pub struct Backup {
    store: CalendarStore,
    journal: Mutex<Journal>,
    cache_dir: PathBuf,
}

impl Backup {
    /// Build a backup producer over `calendar`'s store and journal, caching
    /// completed chunks under `cache_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal cannot be opened for reading.
    pub fn new(calendar: &Calendar, cache_dir: impl AsRef<Path>) -> Result<Self, CalendarError> {
        let journal = calendar.open_journal_reader()?;
        Ok(Self {
            store: calendar.store_handle(),
            journal: Mutex::new(journal),
            cache_dir: cache_dir.as_ref().to_path_buf(),
        })
    }

    /// Return chunk `k`'s bytes, serving from the disk cache if present.
    ///
    /// # Errors
    ///
    /// Returns [`BackupError::NotFound`] if chunk `k` isn't fully available
    /// yet. Propagates any store or I/O error encountered along the way.
    pub fn get_chunk(&self, k: u64) -> Result<Vec<u8>, BackupError> {
        if let Some(cached) = self.read_cache(k)? {
            return Ok(cached);
        }
        let bytes = self.compute_chunk(k)?;
        self.write_cache(k, &bytes)?;
        Ok(bytes)
    }

    fn compute_chunk(&self, k: u64) -> Result<Vec<u8>, BackupError> {
        let start = k * PAGING;
        let end = start + PAGING;
        let mut kv: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();

        // walk in reverse so an incomplete chunk fails on its own newest,
        // most-likely-unattested entry before wasting work on the rest
        for idx in (start..end).rev() {
            let commitment = {
                let mut journal = self.journal.lock().expect("journal mutex poisoned");
                journal.get(idx).map_err(|_| BackupError::NotFound(k))?
            };
            let tree = self.store.get(&commitment).map_err(|_| BackupError::NotFound(k))?;
            collect_nodes(&tree, &mut kv)?;
        }

        let mut buf = Vec::new();
        let mut ser = Serializer::new(&mut buf);
        for (key, value) in &kv {
            ser.write_bytes(key)?;
            ser.write_bytes(value)?;
        }
        Ok(buf)
    }

    fn cache_path(&self, k: u64) -> PathBuf {
        let index = format!("{k:06}");
        self.cache_dir.join(&index[..3]).join(index)
    }

    fn read_cache(&self, k: u64) -> Result<Option<Vec<u8>>, BackupError> {
        match fs::read(self.cache_path(k)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn write_cache(&self, k: u64, bytes: &[u8]) -> Result<(), BackupError> {
        let path = self.cache_path(k);
        fs::create_dir_all(path.parent().expect("cache path always has a parent"))?;
        fs::write(path, bytes)?;
        Ok(())
    }
}

/// Depth-first collect every reachable node's `message -> shallow encoding`
/// pair into `kv`, skipping a message already recorded (two journal entries
/// in the same chunk can share intermediate Merkle nodes).
fn collect_nodes(node: &Timestamp, kv: &mut BTreeMap<Vec<u8>, Vec<u8>>) -> Result<(), BackupError> {
    if !kv.contains_key(&node.message) {
        let mut buf = Vec::new();
        let mut ser = Serializer::new(&mut buf);
        node.serialize_shallow(&mut ser)?;
        kv.insert(node.message.clone(), buf);
    }
    for child in node.ops.values() {
        collect_nodes(child, kv)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ots::Attestation;
    use tempfile::tempdir;

    /// Submit `root` and return the exact `RECORD_SIZE` bytes the calendar
    /// journaled for it (the `Prepend(t)`/`Append(mac)` tip), which is what
    /// the store keys a committed journal entry's root node by.
    fn submit_and_journal(calendar: &mut Calendar, root: Vec<u8>, idx: u64) -> Vec<u8> {
        calendar.submit(root).unwrap();
        let mut reader = calendar.open_journal_reader().unwrap();
        reader.get(idx).unwrap().to_vec()
    }

    #[test]
    fn chunk_is_not_found_until_every_entry_is_attested() {
        let dir = tempdir().unwrap();
        let mut calendar = Calendar::open(dir.path(), "https://cal.example").unwrap();

        let commitment_a = submit_and_journal(&mut calendar, vec![0xaa; 32], 0);
        let _commitment_b = submit_and_journal(&mut calendar, vec![0xbb; 32], 1);

        let mut attested = Timestamp::new(commitment_a);
        attested.add_attestation(Attestation::Bitcoin { height: 10 });
        calendar.add_commitment_timestamp(attested).unwrap();
        // commitment_b is never stored, so the chunk stays incomplete

        let backup = Backup::new(&calendar, dir.path().join("backup_cache")).unwrap();
        let err = backup.get_chunk(0).unwrap_err();
        assert!(matches!(err, BackupError::NotFound(0)));
    }

    #[test]
    fn complete_chunk_is_deterministic_and_cached() {
        let dir = tempdir().unwrap();
        let mut calendar = Calendar::open(dir.path(), "https://cal.example").unwrap();

        for i in 0..PAGING {
            let byte = (i % 256) as u8;
            let commitment = submit_and_journal(&mut calendar, vec![byte; 32], i);
            let mut attested = Timestamp::new(commitment);
            attested.add_attestation(Attestation::Bitcoin { height: 1 });
            calendar.add_commitment_timestamp(attested).unwrap();
        }

        let backup = Backup::new(&calendar, dir.path().join("backup_cache")).unwrap();
        let first = backup.get_chunk(0).unwrap();
        let second = backup.get_chunk(0).unwrap();
        assert_eq!(first, second);
        assert!(dir.path().join("backup_cache/000/000000").exists());
    }
}
