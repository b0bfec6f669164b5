//! Stamper
//!
//! Drives journaled commitments from "pending" to "buried under
//! `min_confirmations` blocks", and writes the resulting fully-attested
//! proofs into the [`CalendarStore`](crate::calendar_store::CalendarStore).
//! Structurally grounded on `otsserver/stamper.py`'s `Stamper`: an ingest
//! step that reads forward through the journal, a block-sync step that
//! detects reorgs and checks mined blocks against outstanding
//! transactions, and an emit/bump step that builds or fee-bumps one
//! opt-in-RBF transaction per cycle.
//!
//! Bitcoin node access goes through [`BitcoinRpc`], an `async_trait`
//! abstraction over the handful of RPCs this component needs — the same
//! shape as the teacher's `BlockVerifier`/`ElectrumVerifier`: a thin async
//! trait whose real implementation wraps a synchronous client in
//! `tokio::task::spawn_blocking`. This lets the state machine above be
//! exercised against a mock in tests without a live `bitcoind`.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bitcoin::absolute::LockTime;
use bitcoin::blockdata::opcodes::all::OP_RETURN;
use bitcoin::blockdata::script::{Builder, PushBytesBuf, ScriptBuf};
use bitcoin::transaction::Version;
use bitcoin::{Amount, OutPoint, Sequence, Transaction, TxIn, TxOut, Txid, Witness};
use bitcoin_hashes::{sha256d, Hash as _};
use rand::Rng;
use thiserror::Error;

use crate::calendar::{Calendar, CalendarError};
use crate::journal::{JournalError, RECORD_SIZE};
use crate::merkle;
use crate::ots::{Attestation, Op, Timestamp};

/// Bitcoin's own dust threshold in satoshis, matching the Python original's
/// `find_unspent` filter.
const DUST_SATS: i64 = 546;
/// RPC error code for mempool-policy rejection (fee too low / replacement underpriced).
const INSUFFICIENT_PRIORITY_CODE: i32 = -26;

/// Errors surfaced by a [`BitcoinRpc`] implementation.
#[derive(Debug, Error)]
pub enum RpcError {
    /// The node rejected a call or returned malformed data.
    #[error("bitcoin rpc call failed: {0}")]
    Call(String),

    /// `sendrawtransaction` was rejected with error `-26`: fee too low, or
    /// (on a bump) the replacement doesn't pay enough more than the
    /// original.
    #[error("transaction rejected, insufficient priority: {0}")]
    InsufficientPriority(String),

    /// The blocking RPC task panicked or was cancelled.
    #[error("bitcoin rpc task did not complete: {0}")]
    Join(String),
}

/// Errors from one stamper loop iteration.
#[derive(Debug, Error)]
pub enum StamperError {
    /// A Bitcoin RPC call failed in a way the caller must react to (most
    /// are swallowed and retried internally; this is for the few that
    /// aren't).
    #[error("bitcoin rpc error: {0}")]
    Rpc(#[from] RpcError),

    /// Reading or re-validating the journal failed.
    #[error("journal error: {0}")]
    Journal(#[from] JournalError),

    /// Writing a confirmed batch to the calendar store failed.
    #[error("calendar error: {0}")]
    Calendar(#[from] CalendarError),

    /// `journal[idx]` for `idx < next_journal_idx` could not be read. This
    /// is the one failure mode the spec calls fatal: the journal is
    /// supposed to be the durable source of truth, so a hole in it below
    /// the stamper's own cursor means the on-disk invariant has already
    /// been violated.
    #[error("missing journal entry at index {0}, below the stamper's own cursor")]
    MissingJournalEntry(u64),
}

type Result<T> = std::result::Result<T, StamperError>;

/// A block this component has observed, kept for reorg detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct KnownBlock {
    height: u64,
    hash: [u8; 32],
}

/// The subset of a Bitcoin block's contents the stamper needs: its own
/// transaction-id list (for the block's Merkle tree, and to check whether
/// an outstanding tx was mined) and the header's merkle root (to sanity
/// check the reconstruction).
pub struct BlockData {
    /// The block's transaction ids, in on-chain order.
    pub txids: Vec<[u8; 32]>,
    /// The block header's own merkle root, for sanity-checking
    /// reconstruction against [`merkle::block_merkle_root`].
    pub merkle_root: [u8; 32],
}

/// A spendable wallet output, already normalised out of whatever shape the
/// node's RPC returns it in.
pub struct UnspentOutput {
    /// The outpoint itself.
    pub outpoint: OutPoint,
    /// Its value.
    pub amount: Amount,
    /// Confirmations at the time it was listed (0 for mempool).
    pub confirmations: u32,
}

/// Bitcoin node operations the stamper needs.
#[async_trait]
pub trait BitcoinRpc: Send + Sync {
    /// Hash of the current best block.
    async fn best_block_hash(&self) -> std::result::Result<[u8; 32], RpcError>;

    /// Hash of the block at `height`, or `None` if the chain isn't that
    /// tall (used both for walking forward and for reorg detection).
    async fn block_hash(&self, height: u64) -> std::result::Result<Option<[u8; 32]>, RpcError>;

    /// Current chain height, used to seed `known_blocks` on first run.
    async fn block_count(&self) -> std::result::Result<u64, RpcError>;

    /// Fetch a block's txid list and merkle root.
    async fn block(&self, hash: [u8; 32]) -> std::result::Result<BlockData, RpcError>;

    /// Raw wire bytes of an already-signed transaction the wallet
    /// previously broadcast, used to locate this commitment's byte range
    /// once it's mined. `None` if the node doesn't know it.
    async fn raw_transaction(&self, txid: [u8; 32]) -> std::result::Result<Option<Vec<u8>>, RpcError>;

    /// List outputs with at least `minconf` and at most `maxconf`
    /// confirmations, largest-value-last.
    async fn list_unspent(&self, minconf: u32, maxconf: u32) -> std::result::Result<Vec<UnspentOutput>, RpcError>;

    /// Whether `outpoint`'s parent transaction is a single-input,
    /// opt-in-RBF transaction the wallet itself created — i.e. safe to
    /// spend an unconfirmed change output from a previous timestamp tx.
    async fn is_own_rbf_tx(&self, txid: [u8; 32]) -> std::result::Result<bool, RpcError>;

    /// A fresh wallet address' `scriptPubKey`, for the tx's change output.
    async fn new_change_script(&self) -> std::result::Result<ScriptBuf, RpcError>;

    /// Sign `tx`'s inputs with the wallet's own keys.
    async fn sign_raw_transaction(&self, tx: &Transaction) -> std::result::Result<Transaction, RpcError>;

    /// Broadcast `tx`. Returns [`RpcError::InsufficientPriority`] on
    /// mempool policy code `-26`; any other rejection propagates as
    /// [`RpcError::Call`].
    async fn send_raw_transaction(&self, tx: &Transaction) -> std::result::Result<Txid, RpcError>;
}

/// [`BitcoinRpc`] backed by a real node, via `bitcoincore-rpc`. That crate's
/// client is synchronous, so every call goes through
/// `tokio::task::spawn_blocking`, the same pattern the teacher's
/// `ElectrumVerifier` uses for its own synchronous client.
pub struct BitcoinCoreRpc {
    client: Arc<bitcoincore_rpc::Client>,
}

impl BitcoinCoreRpc {
    /// Connect to a node at `url` with the given credentials.
    ///
    /// # Errors
    ///
    /// Returns an error if the client cannot be constructed (this does not
    /// itself perform any I/O; connection failures surface on first call).
    pub fn new(url: &str, auth: bitcoincore_rpc::Auth) -> std::result::Result<Self, RpcError> {
        let client =
            bitcoincore_rpc::Client::new(url, auth).map_err(|e| RpcError::Call(e.to_string()))?;
        Ok(Self { client: Arc::new(client) })
    }

    async fn blocking<F, T>(&self, f: F) -> std::result::Result<T, RpcError>
    where
        F: FnOnce(&bitcoincore_rpc::Client) -> bitcoincore_rpc::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let client = self.client.clone();
        tokio::task::spawn_blocking(move || f(&client))
            .await
            .map_err(|e| RpcError::Join(e.to_string()))?
            .map_err(classify_rpc_error)
    }
}

/// Turn a raw `bitcoincore-rpc` error into our classified [`RpcError`],
/// picking out mempool policy code `-26` so the fee-search loop can react
/// to it specifically rather than aborting.
fn classify_rpc_error(err: bitcoincore_rpc::Error) -> RpcError {
    if let bitcoincore_rpc::Error::JsonRpc(bitcoincore_rpc::jsonrpc::error::Error::Rpc(ref rpc_err)) = err {
        if rpc_err.code == INSUFFICIENT_PRIORITY_CODE {
            return RpcError::InsufficientPriority(rpc_err.message.clone());
        }
    }
    RpcError::Call(err.to_string())
}

#[async_trait]
impl BitcoinRpc for BitcoinCoreRpc {
    async fn best_block_hash(&self) -> std::result::Result<[u8; 32], RpcError> {
        self.blocking(bitcoincore_rpc::RpcApi::get_best_block_hash).await.map(|h| h.to_byte_array())
    }

    async fn block_hash(&self, height: u64) -> std::result::Result<Option<[u8; 32]>, RpcError> {
        match self.blocking(move |c| bitcoincore_rpc::RpcApi::get_block_hash(c, height)).await {
            Ok(hash) => Ok(Some(hash.to_byte_array())),
            Err(RpcError::Call(_)) => Ok(None),
            Err(other) => Err(other),
        }
    }

    async fn block_count(&self) -> std::result::Result<u64, RpcError> {
        self.blocking(bitcoincore_rpc::RpcApi::get_block_count).await
    }

    async fn block(&self, hash: [u8; 32]) -> std::result::Result<BlockData, RpcError> {
        let block_hash = bitcoin::BlockHash::from_byte_array(hash);
        let block = self.blocking(move |c| bitcoincore_rpc::RpcApi::get_block(c, &block_hash)).await?;
        Ok(BlockData {
            txids: block.txdata.iter().map(|tx| tx.compute_txid().to_byte_array()).collect(),
            merkle_root: block.header.merkle_root.to_byte_array(),
        })
    }

    async fn raw_transaction(&self, txid: [u8; 32]) -> std::result::Result<Option<Vec<u8>>, RpcError> {
        let txid = Txid::from_byte_array(txid);
        match self
            .blocking(move |c| bitcoincore_rpc::RpcApi::get_raw_transaction(c, &txid, None))
            .await
        {
            Ok(tx) => Ok(Some(bitcoin::consensus::encode::serialize(&tx))),
            Err(RpcError::Call(_)) => Ok(None),
            Err(other) => Err(other),
        }
    }

    async fn list_unspent(&self, minconf: u32, maxconf: u32) -> std::result::Result<Vec<UnspentOutput>, RpcError> {
        let entries = self
            .blocking(move |c| {
                bitcoincore_rpc::RpcApi::list_unspent(
                    c,
                    Some(minconf as usize),
                    Some(maxconf as usize),
                    None,
                    None,
                    None,
                )
            })
            .await?;
        Ok(entries
            .into_iter()
            .map(|u| UnspentOutput {
                outpoint: OutPoint { txid: u.txid, vout: u.vout },
                amount: u.amount,
                confirmations: u.confirmations,
            })
            .collect())
    }

    async fn is_own_rbf_tx(&self, txid: [u8; 32]) -> std::result::Result<bool, RpcError> {
        let txid = Txid::from_byte_array(txid);
        let tx = self
            .blocking(move |c| bitcoincore_rpc::RpcApi::get_raw_transaction(c, &txid, None))
            .await?;
        Ok(tx.input.len() == 1 && tx.input[0].sequence == Sequence::ENABLE_RBF_NO_LOCKTIME)
    }

    async fn new_change_script(&self) -> std::result::Result<ScriptBuf, RpcError> {
        let address = self
            .blocking(|c| {
                bitcoincore_rpc::RpcApi::get_new_address(
                    c,
                    None,
                    Some(bitcoincore_rpc::json::AddressType::Bech32),
                )
            })
            .await?;
        Ok(address.assume_checked().script_pubkey())
    }

    async fn sign_raw_transaction(&self, tx: &Transaction) -> std::result::Result<Transaction, RpcError> {
        let tx = tx.clone();
        let signed = self
            .blocking(move |c| bitcoincore_rpc::RpcApi::sign_raw_transaction_with_wallet(c, &tx, None, None))
            .await?;
        bitcoin::consensus::encode::deserialize(&signed.hex).map_err(|e| RpcError::Call(e.to_string()))
    }

    async fn send_raw_transaction(&self, tx: &Transaction) -> std::result::Result<Txid, RpcError> {
        let tx = tx.clone();
        self.blocking(move |c| bitcoincore_rpc::RpcApi::send_raw_transaction(c, &tx)).await
    }
}

/// A transaction the stamper has broadcast but that has not yet been mined.
struct UnconfirmedTx {
    tx: Transaction,
    txid: Txid,
    /// This transaction's `OP_RETURN` payload: the root of the Merkle
    /// tree over `commitments`.
    tip_root: Vec<u8>,
    /// One node per covered commitment, each rooted at the raw journal
    /// commitment bytes with a `Sha256` child leading into the Merkle
    /// tree that reaches `tip_root`. Completed with a block attestation
    /// once this tx is mined.
    commitments: Vec<Timestamp>,
    /// Each covered commitment's own journal index, aligned with
    /// `commitments`, so a reorg can restore them to `pending` without
    /// losing their place and a flush can advance the journal checkpoint.
    journal_indices: Vec<u64>,
}

/// A transaction that has been mined but hasn't yet reached
/// `min_confirmations`.
struct ConfirmedTx {
    /// Fully-attested commitments: each already carries `Sha256` → Merkle
    /// path → `Bitcoin` attestation, ready to write straight into the
    /// store once buried deep enough.
    commitments: Vec<Timestamp>,
    txid: Txid,
    mined_height: u64,
    /// Carried through from [`UnconfirmedTx::journal_indices`].
    journal_indices: Vec<u64>,
}

/// Why a commitment hasn't been written to the calendar store yet, for the
/// `GET /timestamp` 404 body and `GET /status`.
#[derive(Debug, Clone)]
pub enum PendingReason {
    /// Ingested from the journal but not yet part of any broadcast tx.
    Ingested,
    /// Covered by a broadcast tx still waiting to be mined.
    InMempool {
        txid: Txid,
    },
    /// Mined, waiting to be buried `confirmations_left` blocks deeper.
    WaitingConfirmations {
        txid: Txid,
        confirmations_left: u64,
    },
}

/// A point-in-time view of the stamper's state, published after every tick
/// for the HTTP layer to read without touching the stamper's own loop.
#[derive(Debug, Clone, Default)]
pub struct StamperStatus {
    /// The most recently broadcast tx's tip root, i.e. the Merkle root
    /// committed to by its `OP_RETURN` output.
    pub tip: Option<Vec<u8>>,
    /// Every commitment not yet in the calendar store, and why.
    pub pending: HashMap<Vec<u8>, PendingReason>,
}

impl StamperStatus {
    /// Look up why `commitment` hasn't reached the store yet, for a
    /// `GET /timestamp` 404 response.
    #[must_use]
    pub fn reason_for(&self, commitment: &[u8]) -> Option<&PendingReason> {
        self.pending.get(commitment)
    }
}

/// Handle to a running [`Stamper`], returned by [`Stamper::spawn`].
#[derive(Clone)]
pub struct StamperHandle {
    status: tokio::sync::watch::Receiver<StamperStatus>,
}

impl StamperHandle {
    /// The stamper's latest published status.
    #[must_use]
    pub fn status(&self) -> StamperStatus {
        self.status.borrow().clone()
    }
}

/// Tunable parameters of the stamper's main loop, mirroring the spec's
/// named quantities directly.
pub struct StamperConfig {
    /// Upper bound on `pending`'s size; ingestion pauses above this.
    pub max_pending: usize,
    /// Number of block descendants required before a commitment is final.
    pub min_confirmations: u64,
    /// Minimum spacing between successive timestamp transactions.
    pub min_tx_interval: Duration,
    /// Starting feerate (satoshis per byte) for a new emission cycle.
    pub relay_feerate: u64,
    /// Hard ceiling on total fee; exceeding it abandons the emission tick.
    pub max_fee: Amount,
}

/// The stamper: owns the pending/unconfirmed/waiting state and drives it
/// forward one `tick` at a time.
pub struct Stamper<R: BitcoinRpc> {
    calendar: Calendar,
    rpc: Arc<R>,
    config: StamperConfig,

    /// Journal index of the next commitment to read. Seeded at construction
    /// from the calendar's `journal.known-good` checkpoint, so a restart
    /// resumes past whatever prefix was already confirmed and flushed.
    next_journal_idx: u64,
    /// Commitments read from the journal but not yet in the calendar store,
    /// oldest first, each tagged with its own journal index.
    pending: Vec<(u64, Vec<u8>)>,

    unconfirmed_txs: Vec<UnconfirmedTx>,
    txs_waiting_for_confirmation: HashMap<u64, ConfirmedTx>,
    known_blocks: Vec<KnownBlock>,
    next_timestamp_tx: SystemTime,
}

impl<R: BitcoinRpc> Stamper<R> {
    /// Build a stamper, resuming `next_journal_idx` from the calendar's
    /// `journal.known-good` checkpoint if one exists (0 otherwise).
    #[must_use]
    pub fn new(calendar: Calendar, rpc: Arc<R>, config: StamperConfig) -> Self {
        let next_journal_idx = read_checkpoint(&calendar.journal_checkpoint_path());
        Self {
            calendar,
            rpc,
            config,
            next_journal_idx,
            pending: Vec::new(),
            unconfirmed_txs: Vec::new(),
            txs_waiting_for_confirmation: HashMap::new(),
            known_blocks: Vec::new(),
            next_timestamp_tx: SystemTime::now(),
        }
    }

    /// Spawn the stamper's main loop on the Tokio runtime and return a
    /// handle the HTTP layer can poll for status, mirroring
    /// [`Aggregator::spawn`](crate::aggregator::Aggregator::spawn).
    #[must_use]
    pub fn spawn(
        self,
        poll_interval: Duration,
        shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> StamperHandle
    where
        R: Send + Sync + 'static,
    {
        let (status_tx, status_rx) = tokio::sync::watch::channel(StamperStatus::default());
        tokio::spawn(self.run(poll_interval, shutdown, status_tx));
        StamperHandle { status: status_rx }
    }

    /// Run the stamper forever, ticking every `poll_interval` until
    /// `shutdown` is signalled. Every Bitcoin RPC failure inside a tick is
    /// logged and swallowed — see module docs — so this only returns on
    /// shutdown.
    pub async fn run(
        mut self,
        poll_interval: Duration,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
        status: tokio::sync::watch::Sender<StamperStatus>,
    ) {
        loop {
            if *shutdown.borrow() {
                return;
            }
            if let Err(err) = self.tick().await {
                log::error!("stamper tick failed: {err}");
            }
            status.send_replace(self.snapshot());
            tokio::select! {
                () = tokio::time::sleep(poll_interval) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    /// Build a [`StamperStatus`] snapshot of the current state.
    fn snapshot(&self) -> StamperStatus {
        let mut pending = HashMap::new();

        if let Some(last) = self.unconfirmed_txs.last() {
            for (_, commitment) in &self.pending {
                pending.insert(commitment.clone(), PendingReason::InMempool { txid: last.txid });
            }
        } else {
            for (_, commitment) in &self.pending {
                pending.insert(commitment.clone(), PendingReason::Ingested);
            }
        }

        let tip_height = self.known_blocks.last().map(|b| b.height);
        for confirmed in self.txs_waiting_for_confirmation.values() {
            let confirmations_so_far =
                tip_height.map_or(1, |tip| tip.saturating_sub(confirmed.mined_height) + 1);
            let confirmations_left = self.config.min_confirmations.saturating_sub(confirmations_so_far);
            for commitment in &confirmed.commitments {
                pending.insert(
                    commitment.message.clone(),
                    PendingReason::WaitingConfirmations { txid: confirmed.txid, confirmations_left },
                );
            }
        }

        StamperStatus { tip: self.unconfirmed_txs.last().map(|u| u.tip_root.clone()), pending }
    }

    /// One iteration of the main loop: ingest, sync against Bitcoin, then
    /// emit or fee-bump.
    ///
    /// # Errors
    ///
    /// Returns [`StamperError::MissingJournalEntry`] if a journal index
    /// below the stamper's own cursor can't be read — the one failure mode
    /// the spec treats as unrecoverable corruption. All transient Bitcoin
    /// RPC failures are logged and swallowed inside this call.
    pub async fn tick(&mut self) -> Result<()> {
        self.ingest()?;
        self.sync_bitcoin().await;
        self.emit_or_bump().await;
        Ok(())
    }

    /// Step A: read forward through the journal while there's room in
    /// `pending`, skipping anything already finalised in the store.
    fn ingest(&mut self) -> Result<()> {
        let mut reader = self.calendar.open_journal_reader()?;
        while self.pending.len() < self.config.max_pending {
            let record = match reader.get(self.next_journal_idx) {
                Ok(record) => record,
                Err(JournalError::NotFound(_)) => break,
                Err(err) => {
                    if self.next_journal_idx > 0 {
                        return Err(StamperError::MissingJournalEntry(self.next_journal_idx));
                    }
                    return Err(err.into());
                }
            };
            let commitment = record.to_vec();
            debug_assert_eq!(commitment.len(), RECORD_SIZE as usize);

            if !self.calendar.store().contains(&commitment).unwrap_or(false) {
                self.pending.push((self.next_journal_idx, commitment));
            }
            self.next_journal_idx += 1;
        }
        Ok(())
    }

    /// Step B: advance `known_blocks` (rolling back on reorg), and for
    /// every newly observed block check burial depth, reorg fallback, and
    /// whether it mined one of `unconfirmed_txs`.
    async fn sync_bitcoin(&mut self) {
        let new_blocks = match self.update_known_blocks().await {
            Ok(blocks) => blocks,
            Err(err) => {
                log::warn!("bitcoin sync failed, will retry next tick: {err}");
                return;
            }
        };

        for block in new_blocks {
            log::info!("new block at height {}", block.height);

            if block.height >= self.config.min_confirmations {
                let buried_height = block.height - self.config.min_confirmations + 1;
                if let Some(confirmed) = self.txs_waiting_for_confirmation.remove(&buried_height) {
                    let count = confirmed.commitments.len();
                    let checkpoint = confirmed.journal_indices.iter().max().copied();
                    if let Err(err) = self.calendar.add_commitment_timestamps(confirmed.commitments) {
                        log::error!("failed to persist buried commitments: {err}");
                    } else {
                        log::info!("{count} commitments buried {} blocks deep, persisted", self.config.min_confirmations);
                        if let Some(idx) = checkpoint {
                            write_checkpoint(&self.calendar.journal_checkpoint_path(), idx + 1);
                        }
                    }
                }
            }

            if let Some(reorged) = self.txs_waiting_for_confirmation.remove(&block.height) {
                log::warn!(
                    "tx at height {} was replaced by a reorg, returning {} commitments to pending",
                    block.height,
                    reorged.commitments.len()
                );
                let mut restored: Vec<(u64, Vec<u8>)> = reorged
                    .journal_indices
                    .into_iter()
                    .zip(reorged.commitments.iter().map(|t| t.message.clone()))
                    .collect();
                restored.extend(self.pending.drain(..));
                self.pending = restored;
            }

            if let Err(err) = self.check_block_for_mined_tx(block).await {
                log::warn!("failed to check block {} for mined txs: {err}", block.height);
            }
        }
    }

    async fn update_known_blocks(&mut self) -> std::result::Result<Vec<KnownBlock>, RpcError> {
        let mut observed = Vec::new();
        loop {
            let best = self.rpc.best_block_hash().await?;
            if self.known_blocks.last().map(|b| b.hash) == Some(best) {
                break;
            }

            // roll back any blocks this node no longer agrees with
            while let Some(last) = self.known_blocks.last() {
                match self.rpc.block_hash(last.height).await? {
                    Some(hash) if hash == last.hash => break,
                    _ => {
                        log::warn!("reorg detected at height {}, rolling back", last.height);
                        self.known_blocks.pop();
                    }
                }
            }

            let next_height = match self.known_blocks.last() {
                Some(last) => last.height + 1,
                None => self.rpc.block_count().await?,
            };
            let Some(hash) = self.rpc.block_hash(next_height).await? else {
                // best_block_hash() raced ahead of block_hash(); try again next loop
                continue;
            };
            let block = KnownBlock { height: next_height, hash };
            self.known_blocks.push(block);
            observed.push(block);
        }
        Ok(observed)
    }

    async fn check_block_for_mined_tx(&mut self, block: KnownBlock) -> std::result::Result<(), RpcError> {
        let data = self.rpc.block(block.hash).await?;
        let block_txids: std::collections::HashSet<[u8; 32]> = data.txids.iter().copied().collect();

        // most recent first: a later unconfirmed tx commits to a bigger tree
        let mined_index = self
            .unconfirmed_txs
            .iter()
            .rposition(|utx| block_txids.contains(&utx.txid.to_byte_array()));

        let Some(mined_index) = mined_index else { return Ok(()) };
        let mined = self.unconfirmed_txs.remove(mined_index);

        let Some(found_at) = data.txids.iter().position(|t| *t == mined.txid.to_byte_array()) else {
            return Ok(());
        };

        let mut block_attestation = Timestamp::new(mined.tip_root.clone());
        let proof_root = attach_block_merkle_proof(&mut block_attestation, &data.txids, found_at);
        debug_assert_eq!(proof_root, data.merkle_root, "reconstructed merkle root mismatch");
        if let Some(tip_of_proof) = merkle::find_node_mut(&mut block_attestation, &proof_root) {
            tip_of_proof.add_attestation(Attestation::Bitcoin { height: block.height });
        }

        // graft the block attestation onto every commitment's own Merkle
        // path, which already reaches `tip_root` (built at emission time)
        let mut commitments = mined.commitments;
        let covered = commitments.len();
        for commitment in &mut commitments {
            if let Some(tip) = merkle::find_node_mut(commitment, &mined.tip_root) {
                tip.merge(block_attestation.clone());
            } else {
                log::error!("commitment's merkle path didn't reach its own tx's tip root, this is a bug");
            }
        }

        self.pending.drain(..covered);

        log::info!(
            "tx {} mined at height {}, {} commitments waiting for {} more confirmations",
            mined.txid,
            block.height,
            commitments.len(),
            self.config.min_confirmations.saturating_sub(1)
        );

        self.txs_waiting_for_confirmation.insert(
            block.height,
            ConfirmedTx {
                commitments,
                txid: mined.txid,
                mined_height: block.height,
                journal_indices: mined.journal_indices,
            },
        );
        self.unconfirmed_txs.clear();

        let jitter = rand::thread_rng().gen_range(1.0..2.0);
        self.next_timestamp_tx =
            SystemTime::now() + self.config.min_tx_interval.mul_f64(jitter);

        Ok(())
    }

    /// Step C: if the minimum interval has elapsed and there's something
    /// pending, either bump the current unconfirmed tx's fee or, if none
    /// is outstanding, fund and broadcast a fresh one.
    async fn emit_or_bump(&mut self) {
        if SystemTime::now() < self.next_timestamp_tx {
            return;
        }
        if self.pending.is_empty() {
            return;
        }

        // each commitment's wrapper keeps the raw journal bytes as its own
        // message (what eventually gets written to the store); the Merkle
        // tree itself is built over a separate standalone node per
        // commitment's Sha256 hash, per the spec's `[SHA256(c) for c in
        // pending]` tree construction
        let journal_indices: Vec<u64> = self.pending.iter().map(|(idx, _)| *idx).collect();
        let mut wrappers: Vec<Timestamp> = self
            .pending
            .iter()
            .map(|(_, m)| {
                let mut wrapper = Timestamp::new(m.clone());
                wrapper.add_op(Op::Sha256);
                wrapper
            })
            .collect();
        let mut hash_leaves: Vec<Timestamp> = wrappers
            .iter()
            .map(|w| Timestamp::new(w.ops.get(&Op::Sha256).expect("just added").message.clone()))
            .collect();
        let tip_root = merkle::make_merkle_tree(&mut hash_leaves);

        let result = if let Some(prev) = self.unconfirmed_txs.last() {
            self.bump(prev.tx.clone(), &tip_root).await
        } else {
            self.fund_and_build(&tip_root).await
        };

        let unsigned = match result {
            Ok(tx) => tx,
            Err(err) => {
                log::error!("could not build timestamp tx: {err}");
                return;
            }
        };

        match self.broadcast_with_fee_search(unsigned).await {
            Ok(tx) => {
                let txid = tx.compute_txid();
                for (wrapper, hash_leaf) in wrappers.iter_mut().zip(hash_leaves) {
                    if let Some(sha_node) = wrapper.ops.get_mut(&Op::Sha256) {
                        sha_node.merge(hash_leaf);
                    }
                }
                self.unconfirmed_txs.push(UnconfirmedTx { tx, txid, tip_root, commitments: wrappers, journal_indices });
            }
            Err(err) => {
                log::error!("could not broadcast timestamp tx: {err}");
            }
        }
    }

    async fn fund_and_build(&self, tip_root: &[u8]) -> std::result::Result<Transaction, RpcError> {
        let mut unspent = self.find_unspent().await?;
        unspent.sort_by_key(|u| u.amount);
        let Some(utxo) = unspent.into_iter().last() else {
            return Err(RpcError::Call("no spendable outputs".into()));
        };

        let change_script = self.rpc.new_change_script().await?;
        Ok(build_template(utxo.outpoint, utxo.amount, change_script, tip_root))
    }

    async fn find_unspent(&self) -> std::result::Result<Vec<UnspentOutput>, RpcError> {
        let confirmed: Vec<UnspentOutput> = self
            .rpc
            .list_unspent(1, 9_999_999)
            .await?
            .into_iter()
            .filter(|u| u.amount.to_sat() as i64 > DUST_SATS)
            .collect();
        if !confirmed.is_empty() {
            return Ok(confirmed);
        }

        log::info!("no confirmed output, trying unconfirmed change from our own prior tx");
        let mut fallback = Vec::new();
        for utxo in self.rpc.list_unspent(0, 1).await? {
            if utxo.amount.to_sat() as i64 <= DUST_SATS {
                continue;
            }
            if self.rpc.is_own_rbf_tx(utxo.outpoint.txid.to_byte_array()).await? {
                fallback.push(utxo);
            }
        }
        Ok(fallback)
    }

    /// Build a replacement for `prev_tx` committing to `tip_root` instead,
    /// reusing its inputs and its own (as-is) change value as the base
    /// [`broadcast_with_fee_search`] will subtract this round's fee from —
    /// mirroring `otsserver/stamper.py`'s retry loop, which always passes
    /// the unchanging previously-broadcast tx as `prev_tx` to
    /// `__update_timestamp_tx` rather than a running, already-reduced one.
    async fn bump(&self, prev_tx: Transaction, tip_root: &[u8]) -> std::result::Result<Transaction, RpcError> {
        let change = &prev_tx.output[0];
        let op_return_script = op_return_script(tip_root);
        Ok(Transaction {
            version: prev_tx.version,
            lock_time: prev_tx.lock_time,
            input: prev_tx.input.clone(),
            output: vec![
                TxOut { value: change.value, script_pubkey: change.script_pubkey.clone() },
                TxOut { value: Amount::from_sat(0), script_pubkey: op_return_script },
            ],
        })
    }

    /// Fee-search loop: every iteration, including the first, signs and
    /// broadcasts `base` with its change output reduced by
    /// `ceil(len(tx)*feerate)` computed fresh off `base`'s own change value —
    /// never off a previous iteration's already-reduced value, so retries
    /// don't compound. On `-26` the feerate doubles and the next iteration
    /// recomputes from the same unchanged `base`, until `max_fee` is
    /// exceeded. Mirrors `otsserver/stamper.py`'s retry `while` loop, which
    /// calls `__update_timestamp_tx(prev_tx, ...)` against the same `prev_tx`
    /// on every pass.
    async fn broadcast_with_fee_search(&self, base: Transaction) -> std::result::Result<Transaction, RpcError> {
        let mut feerate = self.config.relay_feerate.max(1);
        let base_value = base.output[0].value;
        let size = base.total_size() as u64;

        loop {
            let fee = Amount::from_sat(size * feerate);
            if fee > self.config.max_fee {
                return Err(RpcError::Call("max_fee exceeded before a broadcast succeeded".into()));
            }
            let new_value = base_value
                .checked_sub(fee)
                .ok_or_else(|| RpcError::Call("fee would exhaust the change output".into()))?;

            let mut unsigned = base.clone();
            unsigned.output[0].value = new_value;

            let signed = self.rpc.sign_raw_transaction(&unsigned).await?;
            match self.rpc.send_raw_transaction(&signed).await {
                Ok(_txid) => return Ok(signed),
                Err(RpcError::InsufficientPriority(_)) => feerate *= 2,
                Err(other) => return Err(other),
            }
        }
    }
}

fn build_template(outpoint: OutPoint, value: Amount, change_script: ScriptBuf, tip_root: &[u8]) -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: outpoint,
            script_sig: ScriptBuf::new(),
            sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
            witness: Witness::new(),
        }],
        output: vec![
            TxOut { value, script_pubkey: change_script },
            TxOut { value: Amount::from_sat(0), script_pubkey: op_return_script(tip_root) },
        ],
    }
}

/// Read the journal read-cursor checkpoint, defaulting to 0 if the file is
/// missing or unparseable (first run, or a checkpoint from before this
/// feature existed).
fn read_checkpoint(path: &Path) -> u64 {
    match std::fs::read_to_string(path) {
        Ok(contents) => contents.trim().parse().unwrap_or_else(|_| {
            log::warn!("journal checkpoint at {} is not a valid index, starting from 0", path.display());
            0
        }),
        Err(_) => 0,
    }
}

/// Persist `idx` as the journal read-cursor checkpoint, logging but
/// otherwise ignoring write failures — losing a checkpoint update only
/// costs a wider re-ingest on the next restart, it isn't fatal.
fn write_checkpoint(path: &Path, idx: u64) {
    if let Err(err) = std::fs::write(path, idx.to_string()) {
        log::error!("failed to write journal checkpoint to {}: {err}", path.display());
    }
}

fn op_return_script(payload: &[u8]) -> ScriptBuf {
    let push = PushBytesBuf::try_from(payload.to_vec()).expect("merkle roots fit in a single push");
    Builder::new().push_opcode(OP_RETURN).push_slice(push).into_script()
}

/// Reconstruct the Bitcoin block's own Merkle path from `leaf`'s message
/// (the mined transaction's txid) up to the block's merkle root, extending
/// `leaf` in place with the `Prepend`/`Append`/`Sha256`/`Sha256` op chain a
/// `sha256d` reduction requires (two chained `Sha256` ops, since this
/// codec has no native double-hash op). Returns the reconstructed root.
///
/// Mirrors `otsserver/stamper.py`'s `make_btc_block_merkle_tree`: odd
/// levels duplicate the last element, same as [`merkle::block_merkle_root`].
fn attach_block_merkle_proof(leaf: &mut Timestamp, txids: &[[u8; 32]], target_index: usize) -> Vec<u8> {
    let mut level: Vec<[u8; 32]> = txids.to_vec();
    let mut idx = target_index;
    let mut cursor = leaf.message.clone();

    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        let mut next_idx = idx / 2;
        let mut i = 0;
        while i < level.len() {
            let left = level[i];
            let right = if i + 1 < level.len() { level[i + 1] } else { left };
            let parent = sha256d_bytes(&left, &right);

            if i == idx {
                extend_double(leaf, &cursor, Op::Append(right.to_vec()), &parent);
                cursor = parent.to_vec();
            } else if i + 1 == idx {
                extend_double(leaf, &cursor, Op::Prepend(left.to_vec()), &parent);
                cursor = parent.to_vec();
            }
            next.push(parent);
            i += 2;
        }
        if level.len() % 2 == 1 && idx == level.len() - 1 {
            next_idx = next.len() - 1;
        }
        level = next;
        idx = next_idx;
    }

    cursor
}

fn sha256d_bytes(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut buf = Vec::with_capacity(64);
    buf.extend_from_slice(left);
    buf.extend_from_slice(right);
    sha256d::Hash::hash(&buf).to_byte_array()
}

/// Extend `leaf`'s node at message `from` with `op` then two `Sha256` ops
/// (the double-hash a `sha256d` combine requires), asserting the result
/// lands on `expected`.
fn extend_double(leaf: &mut Timestamp, from: &[u8], op: Op, expected: &[u8]) {
    let Some(node) = merkle::find_node_mut(leaf, from) else {
        debug_assert!(false, "merkle proof cursor not found in its own leaf");
        return;
    };
    let child = node.add_op(op).add_op(Op::Sha256).add_op(Op::Sha256);
    debug_assert_eq!(child.message, expected, "block merkle op chain landed on the wrong message");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_tx_block_proof_doubles_against_itself() {
        let txid = [0x42u8; 32];
        let mut leaf = Timestamp::new(txid.to_vec());
        let root = attach_block_merkle_proof(&mut leaf, &[txid], 0);
        let expected = sha256d_bytes(&txid, &txid);
        assert_eq!(root, expected);

        let appended = leaf.ops.get(&Op::Append(txid.to_vec())).unwrap();
        let h1 = appended.ops.get(&Op::Sha256).unwrap();
        let h2 = h1.ops.get(&Op::Sha256).unwrap();
        assert_eq!(h2.message, root);
    }

    #[test]
    fn three_tx_block_proof_matches_block_merkle_root() {
        let a = [0x01u8; 32];
        let b = [0x02u8; 32];
        let c = [0x03u8; 32];
        let mut leaf = Timestamp::new(b.to_vec());
        let root = attach_block_merkle_proof(&mut leaf, &[a, b, c], 1);
        assert_eq!(root, merkle::block_merkle_root(&[a, b, c]).to_vec());
    }

    #[test]
    fn checkpoint_round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.known-good");
        assert_eq!(read_checkpoint(&path), 0, "missing checkpoint defaults to 0");
        write_checkpoint(&path, 42);
        assert_eq!(read_checkpoint(&path), 42);
    }

    #[test]
    fn checkpoint_defaults_to_zero_on_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.known-good");
        std::fs::write(&path, "not a number\n").unwrap();
        assert_eq!(read_checkpoint(&path), 0);
    }

    /// Signs transactions as-is and rejects `send_raw_transaction` with
    /// `-26` a fixed number of times before accepting.
    struct RejectNTimes {
        rejects_left: std::sync::atomic::AtomicU64,
    }

    impl RejectNTimes {
        fn new(n: u64) -> Self {
            Self { rejects_left: std::sync::atomic::AtomicU64::new(n) }
        }
    }

    #[async_trait]
    impl BitcoinRpc for RejectNTimes {
        async fn best_block_hash(&self) -> std::result::Result<[u8; 32], RpcError> {
            unimplemented!()
        }
        async fn block_hash(&self, _height: u64) -> std::result::Result<Option<[u8; 32]>, RpcError> {
            unimplemented!()
        }
        async fn block_count(&self) -> std::result::Result<u64, RpcError> {
            unimplemented!()
        }
        async fn block(&self, _hash: [u8; 32]) -> std::result::Result<BlockData, RpcError> {
            unimplemented!()
        }
        async fn raw_transaction(&self, _txid: [u8; 32]) -> std::result::Result<Option<Vec<u8>>, RpcError> {
            unimplemented!()
        }
        async fn list_unspent(&self, _minconf: u32, _maxconf: u32) -> std::result::Result<Vec<UnspentOutput>, RpcError> {
            unimplemented!()
        }
        async fn is_own_rbf_tx(&self, _txid: [u8; 32]) -> std::result::Result<bool, RpcError> {
            unimplemented!()
        }
        async fn new_change_script(&self) -> std::result::Result<ScriptBuf, RpcError> {
            unimplemented!()
        }
        async fn sign_raw_transaction(&self, tx: &Transaction) -> std::result::Result<Transaction, RpcError> {
            Ok(tx.clone())
        }
        async fn send_raw_transaction(&self, _tx: &Transaction) -> std::result::Result<Txid, RpcError> {
            let left = self.rejects_left.load(std::sync::atomic::Ordering::SeqCst);
            if left > 0 {
                self.rejects_left.store(left - 1, std::sync::atomic::Ordering::SeqCst);
                Err(RpcError::InsufficientPriority("fee too low".into()))
            } else {
                Ok(Txid::from_byte_array([0u8; 32]))
            }
        }
    }

    fn test_stamper(rpc: RejectNTimes, relay_feerate: u64, max_fee_sats: u64) -> (Stamper<RejectNTimes>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let calendar = Calendar::open(dir.path(), "https://cal.example").unwrap();
        let config = StamperConfig {
            max_pending: 100,
            min_confirmations: 6,
            min_tx_interval: Duration::from_secs(60),
            relay_feerate,
            max_fee: Amount::from_sat(max_fee_sats),
        };
        (Stamper::new(calendar, Arc::new(rpc), config), dir)
    }

    fn make_base_tx(value_sats: u64) -> Transaction {
        let outpoint = OutPoint { txid: Txid::from_byte_array([0x11u8; 32]), vout: 0 };
        build_template(outpoint, Amount::from_sat(value_sats), ScriptBuf::new(), &[0x22u8; 32])
    }

    #[tokio::test]
    async fn first_attempt_already_pays_a_fee() {
        let base_value = 100_000u64;
        let base = make_base_tx(base_value);
        let size = base.total_size() as u64;
        let feerate = 2u64;

        let (stamper, _dir) = test_stamper(RejectNTimes::new(0), feerate, 1_000_000);
        let signed = stamper.broadcast_with_fee_search(base).await.unwrap();
        assert_eq!(signed.output[0].value, Amount::from_sat(base_value - size * feerate));
    }

    #[tokio::test]
    async fn retries_recompute_fee_fresh_instead_of_compounding() {
        let base_value = 1_000_000u64;
        let base = make_base_tx(base_value);
        let size = base.total_size() as u64;
        let feerate = 2u64;

        let (stamper, _dir) = test_stamper(RejectNTimes::new(1), feerate, 10_000_000);
        let signed = stamper.broadcast_with_fee_search(base).await.unwrap();

        // one `-26` doubles the feerate to 4; the fee must come out of the
        // original base value, not a second deduction stacked on top of
        // the first attempt's already-reduced value.
        let expected_value = base_value - size * (feerate * 2);
        assert_eq!(signed.output[0].value, Amount::from_sat(expected_value));
    }

    #[tokio::test]
    async fn max_fee_aborts_before_any_broadcast() {
        let base = make_base_tx(1_000);
        let (stamper, _dir) = test_stamper(RejectNTimes::new(0), 1, 0);
        let err = stamper.broadcast_with_fee_search(base).await.unwrap_err();
        assert!(matches!(err, RpcError::Call(_)));
    }
}
