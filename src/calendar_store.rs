//! Persistent `message -> Timestamp` mapping
//!
//! Grounded on `otsserver/calendar.py`'s `LevelDbCalendar`: every node is
//! stored non-recursively (its own attestations plus its own outgoing op
//! tags — children are separate keys, looked up by `op.execute(message)`),
//! reads reconstruct the full tree by recursing through those lookups, and
//! writes union a new node into whatever's already at that key inside a
//! single atomic batch.
//!
//! Uses `sled` rather than the teacher's `leveldb` binding — both are
//! ordered byte-keyed embedded stores with atomic batched writes; `sled`
//! is pure Rust and needs no system library.

use std::io::Cursor;

use thiserror::Error;

use crate::ots::{Deserializer, Op, OtsError, Serializer, Timestamp, RECURSION_LIMIT};

/// Errors from store reads and writes.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The underlying `sled` database reported an error.
    #[error("calendar store error: {0}")]
    Sled(#[from] sled::Error),

    /// A stored node's bytes could not be decoded.
    #[error("corrupt calendar store entry for {message}: {source}")]
    Corrupt {
        /// Hex-encoded message of the offending key, for logs.
        message: String,
        /// The underlying codec error.
        source: OtsError,
    },

    /// `message` has no entry in the store.
    #[error("message {0} not found in calendar store")]
    NotFound(String),

    /// Tree reconstruction exceeded the recursion limit — almost
    /// certainly a cycle, which should never occur in a well-formed store.
    #[error("calendar store recursion limit exceeded reconstructing {0}")]
    TooDeep(String),
}

type Result<T> = std::result::Result<T, StoreError>;

/// Ordered key-value store mapping a `Timestamp` node's message to its
/// shallow (non-recursive) encoding.
///
/// Cloning is cheap (`sled::Tree` is a reference-counted handle onto the
/// same database), so a read-only handle can be held by the HTTP layer
/// independently of whoever owns the [`Calendar`](crate::calendar::Calendar)
/// that writes to it.
#[derive(Clone)]
pub struct CalendarStore {
    tree: sled::Tree,
}

impl CalendarStore {
    /// Open (creating if needed) a calendar store backed by a `sled`
    /// database at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened.
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let db = sled::open(path)?;
        let tree = db.open_tree("nodes")?;
        Ok(Self { tree })
    }

    /// Whether `message` has an entry in the store.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying read fails.
    pub fn contains(&self, message: &[u8]) -> Result<bool> {
        Ok(self.tree.contains_key(message)?)
    }

    /// Read a single node's own attestations and outgoing op tags, without
    /// descending into children.
    fn get_shallow(&self, message: &[u8]) -> Result<Option<(Timestamp, Vec<Op>)>> {
        let Some(bytes) = self.tree.get(message)? else { return Ok(None) };
        let mut deser = Deserializer::new(Cursor::new(bytes.as_ref()));
        let (node, ops) = Timestamp::deserialize_shallow(&mut deser, message.to_vec())
            .map_err(|source| StoreError::Corrupt { message: hex::encode(message), source })?;
        Ok(Some((node, ops)))
    }

    /// Reconstruct the full tree rooted at `message`, recursively
    /// resolving every outgoing operation's child by looking it up under
    /// `op.execute(message)`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if `message` has no entry, and
    /// [`StoreError::TooDeep`] if reconstruction recurses past
    /// [`RECURSION_LIMIT`].
    pub fn get(&self, message: &[u8]) -> Result<Timestamp> {
        self.get_limited(message, RECURSION_LIMIT)
    }

    fn get_limited(&self, message: &[u8], limit: usize) -> Result<Timestamp> {
        if limit == 0 {
            return Err(StoreError::TooDeep(hex::encode(message)));
        }
        let Some((mut node, ops)) = self.get_shallow(message)? else {
            return Err(StoreError::NotFound(hex::encode(message)));
        };
        for op in ops {
            let child_message = op.execute(message);
            let child = self.get_limited(&child_message, limit - 1)?;
            node.ops.insert(op, child);
        }
        Ok(node)
    }

    /// Atomically union `timestamps` into the store: every node reachable
    /// from each root (through its own `ops`) gets merged into whatever is
    /// already stored at that message, attestations union and shared
    /// children recurse, and the whole set of changes commits in one
    /// batch.
    ///
    /// Root timestamps in the same call that share a message (e.g. several
    /// leaves of one `merkle::make_merkle_tree` converging on the journal
    /// commitment) are unioned against each other too, via `staged`, not
    /// just against what was already on disk before this call started.
    ///
    /// # Errors
    ///
    /// Returns an error if reading an existing entry is corrupt, or if the
    /// batch fails to apply.
    pub fn add_many(&self, timestamps: impl IntoIterator<Item = Timestamp>) -> Result<()> {
        let mut staged: std::collections::HashMap<Vec<u8>, Timestamp> =
            std::collections::HashMap::new();
        for timestamp in timestamps {
            self.stage_add(timestamp, &mut staged)?;
        }

        let mut batch = sled::Batch::default();
        for node in staged.into_values() {
            let mut buf = Vec::new();
            let mut ser = Serializer::new(&mut buf);
            node.serialize_shallow(&mut ser).map_err(|source| StoreError::Corrupt {
                message: hex::encode(&node.message),
                source,
            })?;
            batch.insert(node.message.clone(), buf);
        }
        self.tree.apply_batch(batch)?;
        self.tree.flush()?;
        Ok(())
    }

    /// Convenience wrapper around [`CalendarStore::add_many`] for a single
    /// timestamp.
    ///
    /// # Errors
    ///
    /// See [`CalendarStore::add_many`].
    pub fn add(&self, timestamp: Timestamp) -> Result<()> {
        self.add_many([timestamp])
    }

    /// Directly import already shallow-encoded `(message, encoded node)`
    /// pairs, such as those parsed out of a backup chunk pulled from a peer
    /// calendar. Unlike [`CalendarStore::add_many`], this does not decode
    /// or union against an existing entry — a backup chunk is only ever
    /// produced from an already-consistent store, so overwriting is safe
    /// and far cheaper than round-tripping every node through `Timestamp`.
    ///
    /// # Errors
    ///
    /// Returns an error if the batch fails to apply.
    pub fn import_raw(&self, entries: impl IntoIterator<Item = (Vec<u8>, Vec<u8>)>) -> Result<()> {
        let mut batch = sled::Batch::default();
        for (key, value) in entries {
            batch.insert(key, value);
        }
        self.tree.apply_batch(batch)?;
        self.tree.flush()?;
        Ok(())
    }

    /// Merge `new_timestamp` into whatever is already staged (checked
    /// first) or stored at its message, and recurse into its children.
    /// Leaves the merged shallow node in `staged`, keyed by message;
    /// `add_many` serialises and batches everything in `staged` once all
    /// roots have been processed.
    fn stage_add(
        &self,
        new_timestamp: Timestamp,
        staged: &mut std::collections::HashMap<Vec<u8>, Timestamp>,
    ) -> Result<()> {
        let mut merged = if let Some(node) = staged.remove(&new_timestamp.message) {
            node
        } else if let Some((node, ops)) = self.get_shallow(&new_timestamp.message)? {
            let mut node = node;
            for op in ops {
                // shallow lookup only needs the tag to exist as an edge;
                // the actual child content is merged recursively below via
                // `new_timestamp.ops`, so an empty placeholder is enough to
                // remember the edge survives (shallow serialization never
                // touches child content, only child op tags).
                node.ops.entry(op).or_insert_with(|| Timestamp::new(Vec::new()));
            }
            node
        } else {
            Timestamp::new(new_timestamp.message.clone())
        };

        merged.attestations.extend(new_timestamp.attestations);
        for (op, child) in new_timestamp.ops {
            merged.ops.entry(op.clone()).or_insert_with(|| Timestamp::new(Vec::new()));
            self.stage_add(child, staged)?;
        }

        staged.insert(merged.message.clone(), merged);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ots::Attestation;
    use tempfile::tempdir;

    fn store() -> CalendarStore {
        let dir = tempdir().unwrap();
        CalendarStore::open(dir.path().join("db")).unwrap()
    }

    #[test]
    fn add_then_get_round_trips() {
        let store = store();
        let mut ts = Timestamp::new(vec![1, 2, 3]);
        ts.add_attestation(Attestation::Pending { uri: "https://cal".into() });
        ts.add_op(Op::Sha256).add_attestation(Attestation::Bitcoin { height: 5 });

        store.add(ts.clone()).unwrap();
        let fetched = store.get(&[1, 2, 3]).unwrap();
        assert_eq!(fetched, ts);
    }

    #[test]
    fn not_found_for_unknown_message() {
        let store = store();
        let err = store.get(b"nope").unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn re_adding_same_node_is_idempotent() {
        let store = store();
        let mut ts = Timestamp::new(vec![9]);
        ts.add_attestation(Attestation::Pending { uri: "https://cal".into() });
        store.add(ts.clone()).unwrap();
        store.add(ts.clone()).unwrap();

        let fetched = store.get(&[9]).unwrap();
        assert_eq!(fetched.attestations.len(), 1);
    }

    #[test]
    fn union_merges_attestations_added_later() {
        let store = store();

        let mut pending = Timestamp::new(vec![7]);
        pending.add_attestation(Attestation::Pending { uri: "https://cal".into() });
        store.add(pending).unwrap();

        let mut confirmed = Timestamp::new(vec![7]);
        confirmed.add_attestation(Attestation::Bitcoin { height: 42 });
        store.add(confirmed).unwrap();

        let fetched = store.get(&[7]).unwrap();
        assert_eq!(fetched.attestations.len(), 2);
        assert_eq!(fetched.find_bitcoin_attestation(), Some(42));
    }

    #[test]
    fn union_merges_shared_children_across_two_adds() {
        let store = store();

        let mut a = Timestamp::new(vec![1]);
        a.add_op(Op::Sha256).add_attestation(Attestation::Pending { uri: "https://cal".into() });
        store.add(a).unwrap();

        let mut b = Timestamp::new(vec![1]);
        b.add_op(Op::Sha256).add_attestation(Attestation::Bitcoin { height: 100 });
        store.add(b).unwrap();

        let fetched = store.get(&[1]).unwrap();
        assert_eq!(fetched.ops.len(), 1);
        let child = &fetched.ops[&Op::Sha256];
        assert_eq!(child.attestations.len(), 2);
    }

    #[test]
    fn add_many_commits_atomically() {
        let store = store();
        let a = Timestamp::new(vec![1]);
        let b = Timestamp::new(vec![2]);
        store.add_many([a, b]).unwrap();

        assert!(store.contains(&[1]).unwrap());
        assert!(store.contains(&[2]).unwrap());
    }

    #[test]
    fn reconstructs_multi_level_tree() {
        let store = store();
        let mut ts = Timestamp::new(vec![0xaa]);
        ts.add_op(Op::Sha256).add_op(Op::Ripemd160).add_attestation(Attestation::Bitcoin {
            height: 1,
        });
        store.add(ts.clone()).unwrap();

        let fetched = store.get(&[0xaa]).unwrap();
        assert_eq!(fetched, ts);
    }
}
