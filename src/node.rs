// Copyright 2015-2020 Parity Technologies (UK) Ltd.
// This file is part of OpenEthereum.

// OpenEthereum is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// OpenEthereum is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with OpenEthereum.  If not, see <http://www.gnu.org/licenses/>.

//! Trie node model and on-disk codec.
//!
//! Serialized shape: a flags byte (`has_value`), the 16-bit child mask,
//! the nibble-path length and packed nibbles, one 48-byte descriptor per
//! set child in ascending index order (`offset ∥ fingerprint ∥
//! min_version`), and finally the optional `value_length ∥ value`.
//! In memory a parent refers to children by offset plus an optional
//! lazily-loaded cache, never by pointer.

use byteorder::{ByteOrder, LittleEndian};
use ethereum_types::H256;
use keccak_hash::keccak;
use parity_bytes::Bytes;

use triedb_pool::{ChunkOffset, INVALID_OFFSET};

use crate::nibbles::Nibbles;

/// Ceiling on a leaf value; the layer above splits larger payloads across
/// several keys with a chunk-index suffix.
pub const MAX_VALUE_LEN_OF_LEAF: usize = (1 << 20) - 1024;

/// Ceiling on one node's compressed path.
pub const MAX_PATH_NIBBLES: usize = 255;

const FLAG_HAS_VALUE: u8 = 1;
const CHILD_DESCRIPTOR_LEN: usize = 8 + 32 + 8;

/// Codec failure modes. `Truncated` is not corruption: the reader fetches
/// at least `needed` bytes and retries.
#[derive(Debug, PartialEq, Eq)]
pub enum DecodeError {
    Truncated { needed: usize },
    Corrupt(&'static str),
}

/// One occupied child slot.
#[derive(Clone)]
pub struct Child {
    /// Location of the serialized child; invalid while the child is dirty.
    pub offset: ChunkOffset,
    /// 32-byte digest of the child subtree.
    pub fingerprint: H256,
    /// Smallest write version in the child subtree.
    pub min_version: u64,
    /// Lazily-loaded cache. Evicting it never invalidates the parent.
    pub node: Option<Box<Node>>,
}

impl Child {
    pub fn from_node(node: Box<Node>) -> Child {
        Child {
            offset: node.offset,
            fingerprint: node.fingerprint,
            min_version: node.min_version,
            node: Some(node),
        }
    }
}

/// A position in the trie covering the nibble path `path`.
#[derive(Clone)]
pub struct Node {
    pub path: Nibbles,
    pub value: Option<Bytes>,
    pub children: [Option<Box<Child>>; 16],
    /// Version at which this node's own record was last written.
    pub version: u64,
    /// Smallest write version of any reachable leaf.
    pub min_version: u64,
    /// Digest over path, value and child fingerprints.
    pub fingerprint: H256,
    /// Where this exact serialization lives; invalid while dirty.
    pub offset: ChunkOffset,
}

impl Node {
    pub fn new_leaf(path: Nibbles, value: Bytes, version: u64) -> Node {
        let mut node = Node {
            path,
            value: Some(value),
            children: Default::default(),
            version,
            min_version: version,
            fingerprint: H256::zero(),
            offset: INVALID_OFFSET,
        };
        node.refresh_meta();
        node
    }

    pub fn new_branch(path: Nibbles, version: u64) -> Node {
        Node {
            path,
            value: None,
            children: Default::default(),
            version,
            min_version: version,
            fingerprint: H256::zero(),
            offset: INVALID_OFFSET,
        }
    }

    pub fn has_value(&self) -> bool {
        self.value.is_some()
    }

    pub fn child(&self, index: u8) -> Option<&Child> {
        self.children[index as usize].as_deref()
    }

    pub fn child_mut(&mut self, index: u8) -> Option<&mut Child> {
        self.children[index as usize].as_deref_mut()
    }

    pub fn set_child(&mut self, index: u8, child: Child) {
        self.children[index as usize] = Some(Box::new(child));
    }

    pub fn take_child(&mut self, index: u8) -> Option<Box<Child>> {
        self.children[index as usize].take()
    }

    pub fn child_count(&self) -> usize {
        self.children.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn child_mask(&self) -> u16 {
        let mut mask = 0u16;
        for (index, slot) in self.children.iter().enumerate() {
            if slot.is_some() {
                mask |= 1 << index;
            }
        }
        mask
    }

    /// Index of the only child. Meaningful after a deletion left exactly
    /// one slot occupied.
    pub fn sole_child_index(&self) -> Option<u8> {
        let mut found = None;
        for (index, slot) in self.children.iter().enumerate() {
            if slot.is_some() {
                if found.is_some() {
                    return None;
                }
                found = Some(index as u8);
            }
        }
        found
    }

    /// Copy of this node carrying child descriptors but no caches. Only
    /// meaningful when every child has a committed offset to be reloaded
    /// from.
    pub fn shallow_clone(&self) -> Node {
        let mut children: [Option<Box<Child>>; 16] = Default::default();
        for (index, slot) in self.children.iter().enumerate() {
            if let Some(child) = slot {
                debug_assert!(child.offset.is_valid());
                children[index] = Some(Box::new(Child {
                    offset: child.offset,
                    fingerprint: child.fingerprint,
                    min_version: child.min_version,
                    node: None,
                }));
            }
        }
        Node {
            path: self.path.clone(),
            value: self.value.clone(),
            children,
            version: self.version,
            min_version: self.min_version,
            fingerprint: self.fingerprint,
            offset: self.offset,
        }
    }

    /// Mark dirty and recompute fingerprint and minimum version after a
    /// content or child change.
    pub fn refresh_meta(&mut self) {
        self.offset = INVALID_OFFSET;
        self.min_version = self
            .children
            .iter()
            .flatten()
            .map(|child| child.min_version)
            .chain(std::iter::once(self.version))
            .min()
            .expect("iterator never empty; qed");
        self.fingerprint = self.compute_fingerprint();
    }

    /// Deterministic digest of path, value and child fingerprints. Equal
    /// trees hash equal; offsets deliberately do not participate.
    pub fn compute_fingerprint(&self) -> H256 {
        let mut preimage = Vec::with_capacity(64 + self.value.as_ref().map_or(0, |v| v.len()));
        preimage.push(self.path.len() as u8);
        preimage.extend_from_slice(&self.path.to_packed());
        match &self.value {
            Some(value) => {
                preimage.push(1);
                let mut len = [0u8; 4];
                LittleEndian::write_u32(&mut len, value.len() as u32);
                preimage.extend_from_slice(&len);
                preimage.extend_from_slice(value);
            }
            None => preimage.push(0),
        }
        for (index, slot) in self.children.iter().enumerate() {
            if let Some(child) = slot {
                preimage.push(index as u8);
                preimage.extend_from_slice(child.fingerprint.as_bytes());
            }
        }
        keccak(&preimage)
    }

    /// Serialized length of this node.
    pub fn encoded_len(&self) -> usize {
        4 + self.path.len().div_ceil(2)
            + self.child_count() * CHILD_DESCRIPTOR_LEN
            + self.value.as_ref().map_or(0, |value| 4 + value.len())
    }

    /// Serialize. Every child must already have a valid offset.
    pub fn encode(&self) -> Vec<u8> {
        debug_assert!(self.path.len() <= MAX_PATH_NIBBLES);
        let mut out = Vec::with_capacity(self.encoded_len());
        let mut flags = 0u8;
        if self.value.is_some() {
            flags |= FLAG_HAS_VALUE;
        }
        out.push(flags);
        let mut mask = [0u8; 2];
        LittleEndian::write_u16(&mut mask, self.child_mask());
        out.extend_from_slice(&mask);
        out.push(self.path.len() as u8);
        out.extend_from_slice(&self.path.to_packed());
        for slot in &self.children {
            if let Some(child) = slot {
                debug_assert!(child.offset.is_valid(), "dirty child in encode");
                let mut word = [0u8; 8];
                LittleEndian::write_u64(&mut word, child.offset.raw());
                out.extend_from_slice(&word);
                out.extend_from_slice(child.fingerprint.as_bytes());
                LittleEndian::write_u64(&mut word, child.min_version);
                out.extend_from_slice(&word);
            }
        }
        if let Some(value) = &self.value {
            debug_assert!(value.len() <= MAX_VALUE_LEN_OF_LEAF);
            let mut len = [0u8; 4];
            LittleEndian::write_u32(&mut len, value.len() as u32);
            out.extend_from_slice(&len);
            out.extend_from_slice(value);
        }
        out
    }

    /// Decode a node from `buf`. `min_version_hint` is the descriptor
    /// value of the parent slot this node was reached through; the node's
    /// own write version is not serialized.
    pub fn decode(buf: &[u8], min_version_hint: u64) -> Result<Node, DecodeError> {
        if buf.len() < 4 {
            return Err(DecodeError::Truncated { needed: 4 });
        }
        let flags = buf[0];
        if flags & !FLAG_HAS_VALUE != 0 {
            return Err(DecodeError::Corrupt("unknown flag bits"));
        }
        let has_value = flags & FLAG_HAS_VALUE != 0;
        let mask = LittleEndian::read_u16(&buf[1..3]);
        let path_len = buf[3] as usize;
        let child_count = mask.count_ones() as usize;
        if !has_value && child_count == 1 {
            return Err(DecodeError::Corrupt("valueless single-child node"));
        }
        if !has_value && child_count == 0 {
            return Err(DecodeError::Corrupt("empty node"));
        }

        let header_len = 4 + path_len.div_ceil(2);
        let children_end = header_len + child_count * CHILD_DESCRIPTOR_LEN;
        let fixed_end = children_end + if has_value { 4 } else { 0 };
        if buf.len() < fixed_end {
            return Err(DecodeError::Truncated { needed: fixed_end });
        }

        let path = Nibbles::from_packed(&buf[4..header_len], path_len);
        let mut node = Node {
            path,
            value: None,
            children: Default::default(),
            version: min_version_hint,
            min_version: min_version_hint,
            fingerprint: H256::zero(),
            offset: INVALID_OFFSET,
        };

        let mut cursor = header_len;
        for index in 0..16u8 {
            if mask & (1 << index) == 0 {
                continue;
            }
            let offset = ChunkOffset::from_raw(LittleEndian::read_u64(&buf[cursor..cursor + 8]));
            if !offset.is_valid() {
                return Err(DecodeError::Corrupt("invalid child offset"));
            }
            let fingerprint = H256::from_slice(&buf[cursor + 8..cursor + 40]);
            let min_version = LittleEndian::read_u64(&buf[cursor + 40..cursor + 48]);
            node.children[index as usize] = Some(Box::new(Child {
                offset,
                fingerprint,
                min_version,
                node: None,
            }));
            cursor += CHILD_DESCRIPTOR_LEN;
        }

        if has_value {
            let value_len = LittleEndian::read_u32(&buf[cursor..cursor + 4]) as usize;
            if value_len > MAX_VALUE_LEN_OF_LEAF {
                return Err(DecodeError::Corrupt("value above leaf ceiling"));
            }
            let total = fixed_end + value_len;
            if buf.len() < total {
                return Err(DecodeError::Truncated { needed: total });
            }
            node.value = Some(buf[fixed_end..total].to_vec());
        }

        node.min_version = node
            .children
            .iter()
            .flatten()
            .map(|child| child.min_version)
            .chain(std::iter::once(min_version_hint))
            .min()
            .expect("iterator never empty; qed");
        node.fingerprint = node.compute_fingerprint();
        Ok(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nib(nibbles: &[u8]) -> Nibbles {
        Nibbles::from_nibbles(nibbles)
    }

    fn leaf(path: &[u8], value: &[u8]) -> Node {
        let mut node = Node::new_leaf(nib(path), value.to_vec(), 7);
        node.offset = ChunkOffset::new(1, 4096);
        node
    }

    #[test]
    fn leaf_round_trips() {
        let node = leaf(&[1, 2, 3], b"payload");
        let encoded = node.encode();
        assert_eq!(encoded.len(), node.encoded_len());
        let decoded = Node::decode(&encoded, 7).unwrap();
        assert_eq!(decoded.path, node.path);
        assert_eq!(decoded.value.as_deref(), Some(&b"payload"[..]));
        assert_eq!(decoded.fingerprint, node.fingerprint);
        assert_eq!(decoded.min_version, 7);
    }

    #[test]
    fn branch_round_trips() {
        let mut branch = Node::new_branch(nib(&[9]), 9);
        for index in [0u8, 7, 15] {
            let mut child_leaf = leaf(&[index], b"v");
            child_leaf.offset = ChunkOffset::new(2, 8192 * index as u64);
            branch.set_child(index, Child::from_node(Box::new(child_leaf)));
        }
        branch.refresh_meta();
        branch.offset = ChunkOffset::new(3, 0);

        let encoded = branch.encode();
        let decoded = Node::decode(&encoded, 9).unwrap();
        assert_eq!(decoded.child_mask(), branch.child_mask());
        assert_eq!(decoded.child_count(), 3);
        for index in [0u8, 7, 15] {
            let child = decoded.child(index).unwrap();
            assert_eq!(child.offset, ChunkOffset::new(2, 8192 * index as u64));
            assert!(child.node.is_none());
        }
        assert_eq!(decoded.fingerprint, branch.fingerprint);
        // leaves written at version 7, branch refreshed at 9
        assert_eq!(decoded.min_version, 7);
    }

    #[test]
    fn truncation_reports_needed_bytes() {
        let node = leaf(&[1, 2, 3, 4], &vec![0xaa; 100]);
        let encoded = node.encode();
        match Node::decode(&encoded[..2], 0).err() {
            Some(DecodeError::Truncated { needed }) => assert_eq!(needed, 4),
            other => panic!("unexpected: {other:?}"),
        }
        match Node::decode(&encoded[..8], 0).err() {
            Some(DecodeError::Truncated { needed }) => {
                assert!(needed > 8 && needed <= encoded.len())
            }
            other => panic!("unexpected: {other:?}"),
        }
        match Node::decode(&encoded[..encoded.len() - 1], 0).err() {
            Some(DecodeError::Truncated { needed }) => assert_eq!(needed, encoded.len()),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(Node::decode(&encoded, 0).is_ok());
    }

    fn decode_err(buf: &[u8]) -> DecodeError {
        Node::decode(buf, 0).err().expect("decode must fail")
    }

    #[test]
    fn corrupt_nodes_are_refused() {
        // unknown flags
        assert_eq!(decode_err(&[0x80, 0, 0, 0]), DecodeError::Corrupt("unknown flag bits"));
        // no value, single child
        assert_eq!(
            decode_err(&[0, 0x02, 0, 0]),
            DecodeError::Corrupt("valueless single-child node")
        );
        // no value, no children
        assert_eq!(decode_err(&[0, 0, 0, 0]), DecodeError::Corrupt("empty node"));
        // child with all-ones offset
        let mut branch = Node::new_branch(nib(&[]), 0);
        branch.value = Some(b"v".to_vec());
        let mut child_leaf = leaf(&[0], b"x");
        child_leaf.offset = ChunkOffset::new(0, 0);
        branch.set_child(3, Child::from_node(Box::new(child_leaf)));
        branch.refresh_meta();
        let mut encoded = branch.encode();
        // descriptor of child 3 directly follows the 4-byte header
        for byte in encoded.iter_mut().skip(4).take(8) {
            *byte = 0xff;
        }
        assert_eq!(decode_err(&encoded), DecodeError::Corrupt("invalid child offset"));
    }

    #[test]
    fn fingerprints_are_content_addressed() {
        let a = leaf(&[1, 2], b"same");
        let mut b = leaf(&[1, 2], b"same");
        b.offset = ChunkOffset::new(9, 12288);
        // same content at different offsets hashes equal
        assert_eq!(a.fingerprint, b.fingerprint);

        let c = leaf(&[1, 2], b"different");
        assert_ne!(a.fingerprint, c.fingerprint);
        let d = leaf(&[1, 3], b"same");
        assert_ne!(a.fingerprint, d.fingerprint);
    }

    #[test]
    fn oversized_value_is_corrupt() {
        let mut encoded = vec![FLAG_HAS_VALUE, 0, 0, 0];
        let mut len = [0u8; 4];
        LittleEndian::write_u32(&mut len, (MAX_VALUE_LEN_OF_LEAF + 1) as u32);
        encoded.extend_from_slice(&len);
        assert_eq!(decode_err(&encoded), DecodeError::Corrupt("value above leaf ceiling"));
    }
}
