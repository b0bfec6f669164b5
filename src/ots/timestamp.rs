//! Timestamp DAG nodes
//!
//! Unlike a client walking one proof from a single starting digest down to a
//! single attestation, a calendar server holds a directed acyclic graph: many
//! submitted digests can share intermediate nodes (the Merkle tree built by
//! the aggregator), and a single node can carry more than one attestation
//! (a Pending one attached at submission time, a Bitcoin one attached once
//! mined) and more than one outgoing operation. A node is keyed by its own
//! message; all the data that matters about it is what's reachable from
//! that message forward.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io::{Read, Write};

use super::attestation::Attestation;
use super::error::{OtsError, Result, RECURSION_LIMIT};
use super::op::Op;
use super::ser::{Deserializer, Serializer};

/// A node in the timestamp DAG.
///
/// `attestations` is the set of claims about `message` itself. `ops` maps
/// each outgoing operation to the child node reached by applying it to
/// `message` — `op.execute(&message) == ops[&op].message` always holds.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Timestamp {
    /// The message (digest, or aggregate commitment) this node is keyed by
    pub message: Vec<u8>,
    /// Claims that `message` existed at some point, attested to by someone
    pub attestations: BTreeSet<Attestation>,
    /// Operations leading to child nodes
    pub ops: BTreeMap<Op, Timestamp>,
}

impl Timestamp {
    /// A fresh node for `message` with no attestations or children yet
    #[must_use]
    pub fn new(message: Vec<u8>) -> Self {
        Self { message, attestations: BTreeSet::new(), ops: BTreeMap::new() }
    }

    /// Record that `message` is attested to by `attestation`. Returns `true`
    /// if this attestation wasn't already present.
    pub fn add_attestation(&mut self, attestation: Attestation) -> bool {
        self.attestations.insert(attestation)
    }

    /// Get (or create) the child reached by applying `op` to this node's
    /// message, and return a mutable reference to it for chaining further
    /// ops or attestations onto the tip.
    pub fn add_op(&mut self, op: Op) -> &mut Timestamp {
        let message = &self.message;
        self.ops.entry(op.clone()).or_insert_with(|| {
            let output = op.execute(message);
            Timestamp::new(output)
        })
    }

    /// Merge `other` into `self` in place. `other.message` must equal
    /// `self.message` — merging is only ever done between two views of the
    /// same node. Attestation sets union; for each op present in both,
    /// children are merged recursively; an op present only in `other` is
    /// adopted wholesale.
    ///
    /// This is how a newly mined Bitcoin attestation (arriving as a fresh
    /// chain of ops rooted at a journal commitment) combines with the
    /// `Pending` attestation the calendar already attached to that same
    /// commitment at submission time — both survive, per the append-only
    /// invariant that attestations and edges are only ever added, never
    /// removed.
    pub fn merge(&mut self, other: Timestamp) {
        debug_assert_eq!(self.message, other.message, "merge between different messages");
        self.attestations.extend(other.attestations);
        for (op, child) in other.ops {
            match self.ops.get_mut(&op) {
                Some(existing) => existing.merge(child),
                None => {
                    self.ops.insert(op, child);
                }
            }
        }
    }

    /// Encode this node's own attestations and the tags of its own outgoing
    /// operations — no child content. This is the calendar store's
    /// on-disk value format: `varuint(|attestations|) || attestations* ||
    /// varuint(|ops|) || op-tags*`. Returns the list of ops so the caller
    /// (the store) can resolve each child by looking up `op.execute(message)`.
    ///
    /// # Errors
    ///
    /// Returns an error if the write operation fails.
    pub fn serialize_shallow<W: Write>(&self, ser: &mut Serializer<W>) -> Result<()> {
        ser.write_uint(self.attestations.len())?;
        for attestation in &self.attestations {
            attestation.serialize(ser)?;
        }
        ser.write_uint(self.ops.len())?;
        for op in self.ops.keys() {
            op.serialize(ser)?;
        }
        Ok(())
    }

    /// Inverse of [`Timestamp::serialize_shallow`]. Returns a node with its
    /// attestation set populated and an empty `ops` map, plus the list of
    /// operations whose children the caller still needs to resolve.
    ///
    /// # Errors
    ///
    /// Returns an error if deserialization of any component fails.
    pub fn deserialize_shallow<R: Read>(
        deser: &mut Deserializer<R>,
        message: Vec<u8>,
    ) -> Result<(Self, Vec<Op>)> {
        let mut node = Timestamp::new(message);
        let n_attestations = deser.read_uint()?;
        for _ in 0..n_attestations {
            node.attestations.insert(Attestation::deserialize(deser)?);
        }
        let n_ops = deser.read_uint()?;
        let mut ops = Vec::with_capacity(n_ops);
        for _ in 0..n_ops {
            let tag = deser.read_byte()?;
            ops.push(Op::deserialize_with_tag(deser, tag)?);
        }
        Ok((node, ops))
    }

    /// Encode the full subtree rooted at this node: same grammar as
    /// [`Timestamp::serialize_shallow`], except each op is immediately
    /// followed by its child's own full encoding rather than stopping at
    /// the tag. Used for the `/timestamp` HTTP response and for backup
    /// chunks, both of which need a self-contained byte string a reader can
    /// walk without going back to the store.
    ///
    /// # Errors
    ///
    /// Returns an error if the write operation fails.
    pub fn serialize_recursive<W: Write>(&self, ser: &mut Serializer<W>) -> Result<()> {
        self.serialize_recursive_limited(ser, RECURSION_LIMIT)
    }

    fn serialize_recursive_limited<W: Write>(
        &self,
        ser: &mut Serializer<W>,
        limit: usize,
    ) -> Result<()> {
        if limit == 0 {
            return Err(OtsError::StackOverflow);
        }
        ser.write_uint(self.attestations.len())?;
        for attestation in &self.attestations {
            attestation.serialize(ser)?;
        }
        ser.write_uint(self.ops.len())?;
        for (op, child) in &self.ops {
            op.serialize(ser)?;
            child.serialize_recursive_limited(ser, limit - 1)?;
        }
        Ok(())
    }

    /// Inverse of [`Timestamp::serialize_recursive`].
    ///
    /// # Errors
    ///
    /// Returns an error if the recursion limit is exceeded or deserializing
    /// any component fails.
    pub fn deserialize_recursive<R: Read>(
        deser: &mut Deserializer<R>,
        message: Vec<u8>,
    ) -> Result<Self> {
        Self::deserialize_recursive_limited(deser, message, RECURSION_LIMIT)
    }

    fn deserialize_recursive_limited<R: Read>(
        deser: &mut Deserializer<R>,
        message: Vec<u8>,
        limit: usize,
    ) -> Result<Self> {
        if limit == 0 {
            return Err(OtsError::StackOverflow);
        }
        let mut node = Timestamp::new(message.clone());
        let n_attestations = deser.read_uint()?;
        for _ in 0..n_attestations {
            node.attestations.insert(Attestation::deserialize(deser)?);
        }
        let n_ops = deser.read_uint()?;
        for _ in 0..n_ops {
            let tag = deser.read_byte()?;
            let op = Op::deserialize_with_tag(deser, tag)?;
            let child_message = op.execute(&message);
            let child = Self::deserialize_recursive_limited(deser, child_message, limit - 1)?;
            node.ops.insert(op, child);
        }
        Ok(node)
    }

    /// Depth-first search for the first node reachable from here whose
    /// attestation set contains a `Bitcoin` entry, returning its height.
    /// Used by `is_pending` style queries and by tests; the calendar's own
    /// resolution logic walks every reachable node, not just the first.
    #[must_use]
    pub fn find_bitcoin_attestation(&self) -> Option<usize> {
        for attestation in &self.attestations {
            if let Attestation::Bitcoin { height } = attestation {
                return Some(*height);
            }
        }
        self.ops.values().find_map(Timestamp::find_bitcoin_attestation)
    }
}

fn fmt_recurse(node: &Timestamp, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
    fn indent(f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        for _ in 0..depth {
            f.write_str("    ")?;
        }
        Ok(())
    }

    for attestation in &node.attestations {
        indent(f, depth)?;
        writeln!(f, "attested by {attestation}")?;
    }
    for (op, child) in &node.ops {
        indent(f, depth)?;
        writeln!(f, "--> {op} --> {}", hex::encode(&child.message))?;
        fmt_recurse(child, f, depth + 1)?;
    }
    Ok(())
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "message: {}", hex::encode(&self.message))?;
        fmt_recurse(self, f, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_node_is_empty() {
        let ts = Timestamp::new(vec![1, 2, 3]);
        assert!(ts.attestations.is_empty());
        assert!(ts.ops.is_empty());
    }

    #[test]
    fn add_op_executes_and_is_idempotent() {
        let mut ts = Timestamp::new(b"hello".to_vec());
        let child_message = Op::Sha256.execute(b"hello");
        {
            let child = ts.add_op(Op::Sha256);
            assert_eq!(child.message, child_message);
        }
        assert_eq!(ts.ops.len(), 1);
        // adding the same op again must not create a second child
        ts.add_op(Op::Sha256);
        assert_eq!(ts.ops.len(), 1);
    }

    #[test]
    fn add_attestation_dedups() {
        let mut ts = Timestamp::new(vec![0xaa]);
        assert!(ts.add_attestation(Attestation::Pending { uri: "https://a".into() }));
        assert!(!ts.add_attestation(Attestation::Pending { uri: "https://a".into() }));
        assert_eq!(ts.attestations.len(), 1);
    }

    #[test]
    fn merge_unions_attestations_and_ops() {
        let mut a = Timestamp::new(vec![1]);
        a.add_attestation(Attestation::Pending { uri: "https://cal".into() });

        let mut b = Timestamp::new(vec![1]);
        b.add_op(Op::Sha256).add_attestation(Attestation::Bitcoin { height: 700_000 });

        a.merge(b);

        assert_eq!(a.attestations.len(), 1);
        assert_eq!(a.ops.len(), 1);
        let child = &a.ops[&Op::Sha256];
        assert!(child.attestations.contains(&Attestation::Bitcoin { height: 700_000 }));
    }

    #[test]
    fn merge_combines_same_child_recursively() {
        let mut a = Timestamp::new(vec![1]);
        a.add_op(Op::Sha256).add_attestation(Attestation::Pending { uri: "https://x".into() });

        let mut b = Timestamp::new(vec![1]);
        b.add_op(Op::Sha256).add_attestation(Attestation::Bitcoin { height: 5 });

        a.merge(b);

        let child = &a.ops[&Op::Sha256];
        assert_eq!(child.attestations.len(), 2);
    }

    #[test]
    fn shallow_round_trip() {
        let mut ts = Timestamp::new(vec![0xaa; 32]);
        ts.add_attestation(Attestation::Pending { uri: "https://cal.example".into() });
        ts.add_op(Op::Sha256);
        ts.add_op(Op::Ripemd160);

        let mut buf = Vec::new();
        let mut ser = Serializer::new(&mut buf);
        ts.serialize_shallow(&mut ser).unwrap();

        let mut deser = Deserializer::new(&buf[..]);
        let (node, ops) = Timestamp::deserialize_shallow(&mut deser, vec![0xaa; 32]).unwrap();

        assert_eq!(node.attestations, ts.attestations);
        assert_eq!(node.ops.len(), 0);
        assert_eq!(ops.len(), 2);
        assert!(ops.contains(&Op::Sha256));
        assert!(ops.contains(&Op::Ripemd160));
    }

    #[test]
    fn recursive_round_trip() {
        let mut ts = Timestamp::new(vec![0x01, 0x02]);
        ts.add_op(Op::Sha256).add_attestation(Attestation::Bitcoin { height: 123 });

        let mut buf = Vec::new();
        let mut ser = Serializer::new(&mut buf);
        ts.serialize_recursive(&mut ser).unwrap();

        let mut deser = Deserializer::new(&buf[..]);
        let deserialized = Timestamp::deserialize_recursive(&mut deser, vec![0x01, 0x02]).unwrap();

        assert_eq!(ts, deserialized);
    }

    #[test]
    fn find_bitcoin_attestation_walks_children() {
        let mut ts = Timestamp::new(vec![0x00]);
        ts.add_op(Op::Sha256).add_op(Op::Ripemd160).add_attestation(Attestation::Bitcoin {
            height: 42,
        });

        assert_eq!(ts.find_bitcoin_attestation(), Some(42));
    }

    #[test]
    fn find_bitcoin_attestation_none_when_only_pending() {
        let mut ts = Timestamp::new(vec![0x00]);
        ts.add_attestation(Attestation::Pending { uri: "https://cal".into() });
        assert_eq!(ts.find_bitcoin_attestation(), None);
    }

    #[test]
    fn display_does_not_panic() {
        let mut ts = Timestamp::new(vec![0xde, 0xad]);
        ts.add_attestation(Attestation::Pending { uri: "https://cal".into() });
        ts.add_op(Op::Sha256).add_attestation(Attestation::Bitcoin { height: 1 });
        let rendered = format!("{ts}");
        assert!(rendered.contains("attested by"));
        assert!(rendered.contains("Bitcoin block 1"));
    }
}
