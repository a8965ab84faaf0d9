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

//! Versioned Merkle-Patricia trie database over a chunked storage pool.
//!
//! The database keeps one copy-on-write trie per committed version. A
//! bounded ring in the pool metadata maps versions to root-node locations;
//! updating produces a fresh root without touching prior versions, so any
//! still-retained version stays readable, in this process or from a
//! read-only opener of the same files.
//!
//! All mutation funnels through a single worker thread owning the writer's
//! [`UpdateAux`] and its async I/O executor; clients talk to it through a
//! bounded request channel (see [`Database`]). Ethereum-specific encodings
//! are out of scope: keys and values are opaque byte strings the caller
//! prepares, with [`finalized_prefix`] and [`proposal_prefix`] composing
//! the two reserved namespaces.

#[macro_use]
extern crate log;

mod aux;
mod compact;
mod db;
mod error;
mod find;
mod nibbles;
mod node;
mod traverse;
mod update;
mod upsert;

pub use aux::UpdateAux;
pub use db::{Database, DatabaseConfig, ReadOnlyDatabase, ReadOnlyDatabaseConfig};
pub use error::{DbError, Result};
pub use find::{find_blocking, FindOutcome};
pub use nibbles::Nibbles;
pub use node::{Child, Node, MAX_PATH_NIBBLES, MAX_VALUE_LEN_OF_LEAF};
pub use traverse::{preorder_traverse, TraverseMachine, ROOT_BRANCH};
pub use update::{Update, UpdateList};

pub use ethereum_types::H256;
pub use triedb_pool::{ChunkOffset, INVALID_OFFSET};

/// Namespace nibble of the finalized tree.
pub const FINALIZED_NIBBLE: u8 = 0x0;

/// Namespace nibble proposals live under, followed by the block id nibbles.
pub const PROPOSAL_NIBBLE: u8 = 0x1;

/// Key prefix of the finalized namespace.
pub fn finalized_prefix() -> Nibbles {
    Nibbles::from_nibbles(&[FINALIZED_NIBBLE])
}

/// Key prefix of the proposal tree for `block_id`.
pub fn proposal_prefix(block_id: &H256) -> Nibbles {
    let mut prefix = Nibbles::from_nibbles(&[PROPOSAL_NIBBLE]);
    prefix.extend(&Nibbles::from_bytes(block_id.as_bytes()));
    prefix
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_prefixes_are_disjoint() {
        let block_id = H256::repeat_byte(0x42);
        let finalized = finalized_prefix();
        let proposal = proposal_prefix(&block_id);
        assert_eq!(finalized.len(), 1);
        assert_eq!(proposal.len(), 1 + 64);
        assert_ne!(finalized.at(0), proposal.at(0));
    }
}
