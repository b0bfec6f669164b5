//! Merkle tree construction
//!
//! Two trees get built over the lifetime of a single client digest: the
//! aggregator's tree over pending client commitments (plain SHA-256,
//! duplicate-last odd rule), and the stamper's tree over journal
//! commitments once it decides to mine a block (SHA-256d, the same
//! duplicate-last rule Bitcoin itself uses for its own transaction tree —
//! grounded on `otsserver/stamper.py`'s `make_merkle_tree` and
//! `make_timestamp_from_block_tx`).

use bitcoin_hashes::{sha256d, Hash};
use sha2::{Digest, Sha256};

use crate::ots::{Op, Timestamp};

/// Build a Merkle tree over `leaves` in place: every leaf gets extended,
/// through a chain of `Prepend`/`Append`/`Sha256` ops, down to a single
/// shared root message. Returns that root message; the caller commits each
/// extended leaf to the store separately (they converge at the root
/// because they share op tags and output messages at every branch point,
/// and the store unions them there).
///
/// Odd levels duplicate the last element rather than reversing it — the
/// same rule Bitcoin's own block Merkle tree uses, so both trees in this
/// codebase behave identically.
///
/// # Panics
///
/// Panics if `leaves` is empty — callers must not invoke the aggregator's
/// tree-building step with no pending submissions.
pub fn make_merkle_tree(leaves: &mut [Timestamp]) -> Vec<u8> {
    assert!(!leaves.is_empty(), "cannot build a Merkle tree with no leaves");

    // groups[i] lists the indices into `leaves` that feed the i'th node of
    // the current level; messages[i] is that node's message.
    let mut groups: Vec<Vec<usize>> = (0..leaves.len()).map(|i| vec![i]).collect();
    let mut messages: Vec<Vec<u8>> = leaves.iter().map(|l| l.message.clone()).collect();

    while groups.len() > 1 {
        let mut next_groups = Vec::with_capacity(groups.len().div_ceil(2));
        let mut next_messages = Vec::with_capacity(groups.len().div_ceil(2));

        let mut pairs = groups.into_iter().zip(messages.into_iter());
        while let Some((left_group, left_msg)) = pairs.next() {
            match pairs.next() {
                Some((right_group, right_msg)) => {
                    let parent_msg = combine_messages(&left_msg, &right_msg);
                    for &idx in &left_group {
                        extend(&mut leaves[idx], Op::Append(right_msg.clone()), &parent_msg);
                    }
                    for &idx in &right_group {
                        extend(&mut leaves[idx], Op::Prepend(left_msg.clone()), &parent_msg);
                    }
                    let mut combined = left_group;
                    combined.extend(right_group);
                    next_groups.push(combined);
                    next_messages.push(parent_msg);
                }
                None => {
                    // odd one out: duplicate it against itself (Satoshi rule)
                    let parent_msg = combine_messages(&left_msg, &left_msg);
                    for &idx in &left_group {
                        extend(&mut leaves[idx], Op::Append(left_msg.clone()), &parent_msg);
                    }
                    next_groups.push(left_group);
                    next_messages.push(parent_msg);
                }
            }
        }

        groups = next_groups;
        messages = next_messages;
    }

    messages.into_iter().next().expect("non-empty tree always reduces to one root")
}

/// Depth-first search through `node`'s own op tree for the descendant whose
/// message is `target`. Shared by the aggregator (locating the batch root
/// under a leaf after [`make_merkle_tree`] extended it) and the stamper
/// (locating a commitment's tip inside the Merkle tree it itself built).
pub(crate) fn find_node_mut<'a>(node: &'a mut Timestamp, target: &[u8]) -> Option<&'a mut Timestamp> {
    if node.message == target {
        return Some(node);
    }
    for child in node.ops.values_mut() {
        if let Some(found) = find_node_mut(child, target) {
            return Some(found);
        }
    }
    None
}

fn combine_messages(left: &[u8], right: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().to_vec()
}

/// Chain `op` then `Sha256` onto `leaf`'s current tip and check the result
/// lands on `expected`. The op/tip machinery lives in `leaf.ops`, keyed by
/// message, so repeated calls across levels walk deeper into the same tree
/// rather than clobbering earlier extensions.
fn extend(leaf: &mut Timestamp, op: Op, expected: &[u8]) {
    let child = leaf.add_op(op).add_op(Op::Sha256);
    debug_assert_eq!(child.message, expected, "merkle op chain landed on the wrong message");
}

/// A single element of a Bitcoin block's own transaction Merkle tree,
/// reduced the same way `make_merkle_tree` reduces client commitments, but
/// with `sha256d` (double SHA-256) instead of single SHA-256, matching
/// Bitcoin consensus rules exactly.
#[must_use]
pub fn block_merkle_root(txids: &[[u8; 32]]) -> [u8; 32] {
    assert!(!txids.is_empty(), "a block always has at least the coinbase");

    let mut level: Vec<[u8; 32]> = txids.to_vec();
    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        let mut iter = level.into_iter();
        loop {
            let Some(left) = iter.next() else { break };
            let right = iter.next().unwrap_or(left);
            let mut buf = Vec::with_capacity(64);
            buf.extend_from_slice(&left);
            buf.extend_from_slice(&right);
            next.push(sha256d::Hash::hash(&buf).to_byte_array());
        }
        level = next;
    }
    level[0]
}
