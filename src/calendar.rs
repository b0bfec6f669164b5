//! Server-side calendar facade
//!
//! Binds together the [`Journal`](crate::journal), the
//! [`CalendarStore`](crate::calendar_store), and this server's identity
//! (`uri`, `hmac-key`). Grounded on `otsserver/calendar.py`'s `Calendar`
//! class, which wraps the same three things (`JournalWriter`,
//! `LevelDbCalendar`, `uri`) read from files in one directory.
//!
//! `submit` only ever touches the journal — the durability guarantee the
//! aggregator needs ("fsynced before we acknowledge") doesn't need the
//! store at all, and the in-memory node it returns is everything the HTTP
//! caller needs for an immediate response. The store only gets written
//! later, by the stamper, once a commitment has a real Bitcoin attestation
//! to go with it (see `otsserver/rpc.py`'s `get_timestamp`, which looks a
//! pending commitment up in the store and 404s — pending commitments are
//! never stored, only journaled and held in the stamper's own `pending`
//! set).

use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::calendar_store::{CalendarStore, StoreError};
use crate::journal::{Journal, JournalError, JournalWriter};
use crate::ots::{Attestation, Op, Timestamp};

/// Number of levels in the HMAC key-derivation tree: one per bit of the
/// `u32` seconds-since-epoch index.
const KEY_TREE_LEVELS: u32 = 32;

/// Errors from calendar operations.
#[derive(Debug, Error)]
pub enum CalendarError {
    /// Underlying filesystem operation failed.
    #[error("calendar I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Journal read or write failed.
    #[error("journal error: {0}")]
    Journal(#[from] JournalError),

    /// Calendar store read or write failed.
    #[error("calendar store error: {0}")]
    Store(#[from] StoreError),
}

type Result<T> = std::result::Result<T, CalendarError>;

/// A calendar server's identity plus its two durable components.
pub struct Calendar {
    uri: String,
    hmac_key: [u8; 32],
    journal: JournalWriter,
    journal_path: PathBuf,
    store: CalendarStore,
}

impl Calendar {
    /// Open (creating if needed) a calendar rooted at `path`. `uri` is
    /// written to `path/uri` the first time; an `hmac-key` file is
    /// generated once and reused on every subsequent open.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or any of its files can't be
    /// created or read.
    pub fn open(path: impl AsRef<Path>, uri: &str) -> Result<Self> {
        let store = CalendarStore::open(path.as_ref().join("db"))?;
        Self::open_with_store(path, uri, store)
    }

    /// Build another handle onto the calendar rooted at `path`, reusing an
    /// already-open `store` instead of opening the `sled` database again —
    /// `sled` holds an exclusive lock on its directory, so a second
    /// [`CalendarStore::open`] on the same path would fail. Lets the
    /// stamper hold its own `Calendar` (for its own journal reader and to
    /// write confirmed proofs) alongside the one the aggregator owns and
    /// appends through.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or any of its files can't be
    /// created or read.
    pub fn open_with_store(path: impl AsRef<Path>, uri: &str, store: CalendarStore) -> Result<Self> {
        let path = path.as_ref();
        fs::create_dir_all(path)?;

        let uri_path = path.join("uri");
        if !uri_path.exists() {
            fs::write(&uri_path, uri)?;
        }
        let uri = fs::read_to_string(&uri_path)?.trim().to_string();

        let hmac_key = load_or_create_hmac_key(&path.join("hmac-key"))?;

        let journal_path = path.join("journal");
        let journal = JournalWriter::open(&journal_path)?;

        Ok(Self { uri, hmac_key, journal, journal_path, store })
    }

    /// This calendar's URI, as embedded in every `Pending` attestation it
    /// issues.
    #[must_use]
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Read-only access to the backing store, for callers (the stamper,
    /// the backup producer, the HTTP `/timestamp` handler) that need to
    /// look up already-committed proofs.
    #[must_use]
    pub fn store(&self) -> &CalendarStore {
        &self.store
    }

    /// A cloneable handle onto the backing store, independent of this
    /// `Calendar`'s lifetime — for callers (the HTTP layer) that need to
    /// hold a store reference after `Calendar` itself has been moved into
    /// the aggregator task.
    #[must_use]
    pub fn store_handle(&self) -> CalendarStore {
        self.store.clone()
    }

    /// Open a fresh read-only handle onto the journal. The stamper uses
    /// this to ingest commitments independently of the aggregator's append
    /// cursor.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal file cannot be opened.
    pub fn open_journal_reader(&self) -> Result<Journal> {
        Ok(self.journal.reader(&self.journal_path)?)
    }

    /// Path to the stamper's journal read-cursor checkpoint, alongside the
    /// journal itself. Lets a restarted stamper resume past whatever prefix
    /// it already confirmed and flushed instead of re-ingesting from index 0.
    #[must_use]
    pub fn journal_checkpoint_path(&self) -> PathBuf {
        self.journal_path.with_file_name("journal.known-good")
    }

    /// Commit a fully-attested proof (a journal commitment's subtree, now
    /// carrying a `Bitcoin` attestation) into the calendar store. Called by
    /// the stamper once a batch has reached `min_confirmations`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store write fails.
    pub fn add_commitment_timestamp(&self, timestamp: Timestamp) -> Result<()> {
        self.store.add(timestamp)?;
        Ok(())
    }

    /// Batch form of [`Calendar::add_commitment_timestamp`]: commits every
    /// timestamp in one atomic write. Used by the stamper when a
    /// transaction reaches burial depth and all the commitments it covers
    /// become final at once.
    ///
    /// # Errors
    ///
    /// Returns an error if the store write fails.
    pub fn add_commitment_timestamps(
        &self,
        timestamps: impl IntoIterator<Item = Timestamp>,
    ) -> Result<()> {
        self.store.add_many(timestamps)?;
        Ok(())
    }

    /// Take the aggregator's computed Merkle root for one commitment
    /// interval and turn it into a journaled, time-bucketed, MAC'd,
    /// `Pending`-attested commitment.
    ///
    /// Returns the continuation chain rooted at `root`: `Prepend(t)` then
    /// `Append(mac)`, with the `Pending{uri}` attestation on the tip. The
    /// caller (the aggregator) merges this onto every leaf whose own chain
    /// converges on `root`, giving each submitter a self-contained proof
    /// without a store round-trip.
    ///
    /// Returns only after the journal write is flushed and fsynced.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal write fails.
    pub fn submit(&mut self, root: Vec<u8>) -> Result<Timestamp> {
        let t = now_seconds();

        let mut continuation = Timestamp::new(root);
        let prepended = continuation.add_op(Op::Prepend(t.to_be_bytes().to_vec()));

        let per_idx_key = derive_key(&self.hmac_key, t);
        let mut mac_hasher = Sha256::new();
        mac_hasher.update(&prepended.message);
        mac_hasher.update(per_idx_key);
        let mac_full = mac_hasher.finalize().to_vec();
        let mac = mac_full[..8].to_vec();

        let commitment = prepended.add_op(Op::Append(mac));
        commitment.add_attestation(Attestation::Pending { uri: self.uri.clone() });

        self.journal.submit(&commitment.message)?;

        Ok(continuation)
    }
}

fn now_seconds() -> u32 {
    let secs = SystemTime::now().duration_since(UNIX_EPOCH).expect("clock before epoch").as_secs();
    u32::try_from(secs).expect("seconds-since-epoch overflowed u32")
}

/// Derive the per-index key used to MAC a journal commitment: a 32-level
/// binary tree of domain-separated SHA-256, walking `idx`'s bits
/// most-significant-first, appending `0xff` for a set bit and `0x00` for a
/// clear one at each level.
fn derive_key(hmac_key: &[u8; 32], idx: u32) -> [u8; 32] {
    let mut key = *hmac_key;
    for level in 0..KEY_TREE_LEVELS {
        let bit = (idx >> (KEY_TREE_LEVELS - 1 - level)) & 1;
        let marker: u8 = if bit == 1 { 0xff } else { 0x00 };
        let mut hasher = Sha256::new();
        hasher.update(key);
        hasher.update([marker]);
        key = hasher.finalize().into();
    }
    key
}

fn load_or_create_hmac_key(path: &PathBuf) -> std::io::Result<[u8; 32]> {
    if let Ok(bytes) = fs::read(path) {
        if bytes.len() == 32 {
            let mut key = [0u8; 32];
            key.copy_from_slice(&bytes);
            return Ok(key);
        }
        log::warn!("hmac-key at {} has unexpected length, regenerating", path.display());
    }
    let key: [u8; 32] = rand::random();
    let mut file = fs::File::create(path)?;
    file.write_all(&key)?;
    file.sync_all()?;
    Ok(key)
}
