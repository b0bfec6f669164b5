//! Submission aggregator
//!
//! Collapses concurrent client submissions into one Bitcoin commitment per
//! `commitment_interval`. Grounded on `otsserver/aggregator.py`'s
//! `Aggregator`/`AggregationQueue`: one background task draining a queue on
//! a fixed tick, building one Merkle tree per tick, and waking every waiter
//! in the batch once the calendar has journaled the root.
//!
//! The queue and the wakeups are plain Tokio channels rather than the
//! original's condition-variable/greenlet machinery: an
//! `mpsc::UnboundedSender` for submissions, paired per-submission with a
//! `oneshot::Sender` the background task fires once the batch it landed in
//! has been committed.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::calendar::Calendar;
use crate::merkle;
use crate::ots::{Op, Timestamp};

/// `wrapper` is the object eventually handed back to the submitter, rooted
/// at their own message; `nonced_message` is `wrapper`'s nonced-hash
/// descendant's message — the actual value the batch's Merkle tree is
/// built over, per the nonced-leaf contract.
struct Submission {
    wrapper: Timestamp,
    nonced_message: Vec<u8>,
    done: oneshot::Sender<Timestamp>,
}

/// Handle used by submitters (the HTTP `/digest` endpoint) to hand a digest
/// to the aggregator and await its `Pending`-attested `Timestamp`.
///
/// Cheap to clone: cloning just clones the channel sender.
#[derive(Clone)]
pub struct Aggregator {
    tx: mpsc::UnboundedSender<Submission>,
}

impl Aggregator {
    /// Spawn the aggregator's background task and return a handle to it.
    /// `calendar` is moved into the task — nothing else may call
    /// `Calendar::submit` concurrently, since the journal has a single
    /// append cursor.
    #[must_use]
    pub fn spawn(calendar: Calendar, commitment_interval: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(calendar, commitment_interval, rx));
        Self { tx }
    }

    /// Submit `message` for aggregation. Wraps it in a nonced leaf (`
    /// Append(16 random bytes)` then `Sha256`) so the server's tree shape
    /// and co-submitted messages never leak back to the submitter, then
    /// blocks until the next interval tick has committed a batch containing
    /// it.
    ///
    /// # Errors
    ///
    /// Returns an error if the aggregator task has shut down, which only
    /// happens if it panicked or the process is exiting.
    pub async fn submit(&self, message: Vec<u8>) -> Result<Timestamp, AggregatorError> {
        let mut wrapper = Timestamp::new(message);
        let nonce: [u8; 16] = rand::random();
        let nonced_message =
            wrapper.add_op(Op::Append(nonce.to_vec())).add_op(Op::Sha256).message.clone();

        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(Submission { wrapper, nonced_message, done: done_tx })
            .map_err(|_| AggregatorError::ShutDown)?;
        done_rx.await.map_err(|_| AggregatorError::ShutDown)
    }
}

/// Errors from submitting to the aggregator.
#[derive(Debug, thiserror::Error)]
pub enum AggregatorError {
    /// The aggregator's background task is no longer running.
    #[error("aggregator has shut down")]
    ShutDown,
}

/// The aggregator's internal loop: one iteration per `commitment_interval`
/// tick. Skips entirely if nothing was submitted since the last tick.
async fn run(mut calendar: Calendar, commitment_interval: Duration, mut rx: mpsc::UnboundedReceiver<Submission>) {
    let mut ticker = tokio::time::interval(commitment_interval);
    // the first tick fires immediately; skip it so we always wait a full
    // interval before the first batch
    ticker.tick().await;

    loop {
        ticker.tick().await;

        let mut batch = Vec::new();
        while let Ok(item) = rx.try_recv() {
            batch.push(item);
        }
        if batch.is_empty() {
            continue;
        }

        // the Merkle tree is built over each submission's nonced-hash
        // value, standalone nodes separate from the wrapper that carries
        // the original message and will be handed back to the submitter
        let mut leaves: Vec<Timestamp> =
            batch.iter().map(|s| Timestamp::new(s.nonced_message.clone())).collect();
        let root = merkle::make_merkle_tree(&mut leaves);

        let continuation = match calendar.submit(root.clone()) {
            Ok(continuation) => continuation,
            Err(err) => {
                log::error!("calendar commitment failed, dropping batch of {}: {}", batch.len(), err);
                continue;
            }
        };

        for (submission, mut leaf) in batch.into_iter().zip(leaves) {
            let Submission { mut wrapper, nonced_message, done } = submission;

            if let Some(tip) = merkle::find_node_mut(&mut leaf, &root) {
                tip.merge(continuation.clone());
            } else {
                log::error!("merkle tip for a submission didn't reach the batch root; dropping its attestation");
            }

            // graft the now fully-extended standalone leaf back onto the
            // wrapper's own nonced-hash node, so the returned `Timestamp`
            // is rooted at the submitter's original message again
            if let Some(nonced_node) = merkle::find_node_mut(&mut wrapper, &nonced_message) {
                nonced_node.merge(leaf);
            } else {
                log::error!("nonced node missing from its own wrapper, this is a bug");
            }

            // ignore a closed receiver: the submitter gave up waiting
            let _ = done.send(wrapper);
        }
    }
}
