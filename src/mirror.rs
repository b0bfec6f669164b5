//! Backup mirror
//!
//! Pulls another calendar's backup chunks over HTTP and imports them
//! directly into a local [`CalendarStore`], letting this process act as a
//! read replica of a remote calendar without running its own aggregator or
//! stamper. Grounded on `calendar_client.rs`'s `CalendarClient`: a thin
//! `reqwest::Client` wrapper, one method per remote endpoint, `404` treated
//! as a distinct, expected outcome rather than an error.

use std::io::Cursor;
use std::time::Duration;

use log::{debug, info, warn};
use reqwest::{Client, StatusCode};
use thiserror::Error;

use crate::backup::PAGING;
use crate::calendar_store::{CalendarStore, StoreError};
use crate::ots::Deserializer;

/// Errors from pulling or importing a remote backup chunk.
#[derive(Debug, Error)]
pub enum MirrorError {
    /// The HTTP request itself failed (connection, timeout, non-404 error
    /// status).
    #[error("backup pull from {0} failed: {1}")]
    Request(String, reqwest::Error),

    /// The remote returned a non-success, non-404 status.
    #[error("calendar {0} returned status {1} for a backup chunk")]
    Status(String, StatusCode),

    /// The chunk body wasn't a well-formed key/value record stream.
    #[error("malformed backup chunk from {0}")]
    Malformed(String),

    /// Writing the imported entries to the local store failed.
    #[error("local store error: {0}")]
    Store(#[from] StoreError),
}

/// Pulls backup chunks from one remote calendar into a local store.
pub struct Mirror {
    client: Client,
    remote_uri: String,
    store: CalendarStore,
}

impl Mirror {
    /// Build a mirror pulling from `remote_uri` into `store`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(remote_uri: String, store: CalendarStore, timeout: Duration) -> reqwest::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, remote_uri, store })
    }

    /// Pull and import every chunk starting at `from_chunk` until the
    /// remote returns `404` (not yet produced). Returns the index of the
    /// next chunk to try on a future call.
    ///
    /// # Errors
    ///
    /// Returns an error on the first request or import failure; chunks
    /// already imported before the failing one stay imported.
    pub async fn sync_from(&self, from_chunk: u64) -> Result<u64, MirrorError> {
        let mut chunk = from_chunk;
        loop {
            match self.pull_chunk(chunk).await? {
                Some(bytes) => {
                    let entries = parse_chunk(&bytes)
                        .map_err(|()| MirrorError::Malformed(self.remote_uri.clone()))?;
                    let n = entries.len();
                    self.store.import_raw(entries)?;
                    info!(
                        "imported backup chunk {chunk} ({n} nodes, {} commitments) from {}",
                        PAGING,
                        self.remote_uri
                    );
                    chunk += 1;
                }
                None => {
                    debug!("chunk {chunk} not yet available from {}", self.remote_uri);
                    return Ok(chunk);
                }
            }
        }
    }

    async fn pull_chunk(&self, chunk: u64) -> Result<Option<Vec<u8>>, MirrorError> {
        let url = format!("{}/experimental/backup/{chunk}", self.remote_uri);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| MirrorError::Request(self.remote_uri.clone(), e))?;

        match response.status() {
            StatusCode::OK => {
                let bytes = response
                    .bytes()
                    .await
                    .map_err(|e| MirrorError::Request(self.remote_uri.clone(), e))?;
                Ok(Some(bytes.to_vec()))
            }
            StatusCode::NOT_FOUND => Ok(None),
            other => {
                warn!("unexpected status {other} pulling chunk {chunk} from {}", self.remote_uri);
                Err(MirrorError::Status(self.remote_uri.clone(), other))
            }
        }
    }
}

/// Parse a backup chunk's `(varuint(keylen), key, varuint(vallen), value)*`
/// records. Each value is already a [`Timestamp::serialize_shallow`]
/// encoding, so it can go straight into the store unparsed.
///
/// [`Timestamp::serialize_shallow`]: crate::ots::Timestamp::serialize_shallow
fn parse_chunk(bytes: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, ()> {
    let mut deser = Deserializer::new(Cursor::new(bytes));
    let mut entries = Vec::new();

    loop {
        let key_len = match deser.read_uint() {
            Ok(n) => n,
            Err(_) => break,
        };
        let key = deser.read_fixed_bytes(key_len).map_err(|_| ())?;
        let value_len = deser.read_uint().map_err(|_| ())?;
        let value = deser.read_fixed_bytes(value_len).map_err(|_| ())?;
        entries.push((key, value));
    }

    Ok(entries)
}
