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

//! End-to-end scenarios over the on-disk database.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

use tempdir::TempDir;
use triedb::{
    finalized_prefix, proposal_prefix, Database, DatabaseConfig, DbError, H256, Nibbles, Node,
    ReadOnlyDatabase, ReadOnlyDatabaseConfig, TraverseMachine, Update, UpdateList, ROOT_BRANCH,
};

fn config(dir: &TempDir, history_length: u64) -> DatabaseConfig {
    DatabaseConfig {
        paths: vec![dir.path().join("db")],
        truncate: true,
        create_file_size: 64 * 1024 * 1024,
        chunk_capacity: 1 << 20,
        history_length,
        compaction: true,
        rd_buffers: 16,
        wr_buffers: 4,
        ..Default::default()
    }
}

/// io_uring may be unavailable under seccomp; such environments skip the
/// on-disk scenarios rather than failing them.
fn try_open(config: DatabaseConfig) -> Option<Database> {
    match Database::open(config) {
        Ok(db) => Some(db),
        Err(DbError::Device(err)) => {
            eprintln!("skipping on-disk scenario: {err}");
            None
        }
        Err(err) => panic!("database open failed: {err}"),
    }
}

fn key(bytes: &[u8]) -> Nibbles {
    Nibbles::from_bytes(bytes)
}

fn one(key: Nibbles, value: Vec<u8>, version: u64) -> UpdateList {
    vec![Update::insert(key, value, version)].into_iter().collect()
}

#[test]
fn single_leaf() {
    let dir = TempDir::new("triedb").unwrap();
    let Some(db) = try_open(config(&dir, 16)) else { return };

    db.upsert(one(key(b"leaf"), b"payload".to_vec(), 0), 0, false, true)
        .unwrap();
    assert_eq!(db.get(key(b"leaf"), 0).unwrap(), b"payload".to_vec());
    assert!(matches!(db.get(key(b"lead"), 0), Err(DbError::KeyNotFound)));
    assert!(matches!(db.get(key(b"leaf"), 1), Err(DbError::VersionUnknown)));
    assert_eq!(db.earliest_version().unwrap(), Some(0));
    assert_eq!(db.latest_version().unwrap(), Some(0));
}

#[test]
fn values_survive_reopen() {
    let dir = TempDir::new("triedb").unwrap();
    let mut cfg = config(&dir, 16);
    {
        let Some(db) = try_open(cfg.clone()) else { return };
        for version in 0..8u64 {
            db.upsert(
                one(key(&[version as u8]), vec![version as u8; 32], version),
                version,
                false,
                true,
            )
            .unwrap();
        }
    }
    cfg.truncate = false;
    let db = Database::open(cfg).unwrap();
    assert_eq!(db.latest_version().unwrap(), Some(7));
    for version in 0..8u64 {
        assert_eq!(
            db.get(key(&[version as u8]), 7).unwrap(),
            vec![version as u8; 32]
        );
    }
}

#[test]
fn overwrite_churn_stays_readable() {
    let dir = TempDir::new("triedb").unwrap();
    let Some(db) = try_open(config(&dir, 64)) else { return };

    let keys: Vec<Nibbles> = (0..20u8).map(|i| key(&[i, 0xaa, i])).collect();
    for version in 0..50u64 {
        let target = (version % 20) as usize;
        let mut value = b"A".to_vec();
        value.extend_from_slice(&version.to_le_bytes());
        db.upsert(one(keys[target].clone(), value, version), version, false, true)
            .unwrap();
    }
    // at the latest version, every key holds the value of its last write
    for (index, k) in keys.iter().enumerate() {
        let last_write = (0..50u64).rev().find(|v| (*v % 20) as usize == index).unwrap();
        let mut expected = b"A".to_vec();
        expected.extend_from_slice(&last_write.to_le_bytes());
        assert_eq!(db.get(k.clone(), 49).unwrap(), expected);
    }
    // and historic versions still serve their own view
    let mut expected = b"A".to_vec();
    expected.extend_from_slice(&7u64.to_le_bytes());
    assert_eq!(db.get(keys[7].clone(), 7).unwrap(), expected);
    assert!(matches!(db.get(keys[8].clone(), 7), Err(DbError::KeyNotFound)));
}

#[test]
fn proposal_then_finalize() {
    let dir = TempDir::new("triedb").unwrap();
    let Some(db) = try_open(config(&dir, 16)) else { return };

    let block_id = H256::repeat_byte(0x3c);
    let mut proposal_key = proposal_prefix(&block_id);
    proposal_key.extend(&key(b"acct"));
    db.upsert(one(proposal_key, b"balance".to_vec(), 10), 10, false, true)
        .unwrap();

    let mut finalized_key = finalized_prefix();
    finalized_key.extend(&key(b"acct"));
    assert!(matches!(
        db.get(finalized_key.clone(), 10),
        Err(DbError::KeyNotFound)
    ));

    db.finalize(10, block_id).unwrap();
    assert_eq!(db.get(finalized_key, 10).unwrap(), b"balance".to_vec());
    assert_eq!(db.latest_finalized().unwrap(), Some(10));

    // a second finalization of the same version violates monotonicity
    assert!(matches!(
        db.finalize(10, block_id),
        Err(DbError::InvariantViolation(_))
    ));
}

#[test]
fn history_eviction() {
    let dir = TempDir::new("triedb").unwrap();
    let Some(db) = try_open(config(&dir, 4)) else { return };

    for version in 0..8u64 {
        db.upsert(
            one(key(b"slot"), version.to_le_bytes().to_vec(), version),
            version,
            false,
            true,
        )
        .unwrap();
    }
    assert!(matches!(db.get(key(b"slot"), 3), Err(DbError::VersionUnknown)));
    assert_eq!(db.get(key(b"slot"), 4).unwrap(), 4u64.to_le_bytes().to_vec());
    assert_eq!(db.get(key(b"slot"), 7).unwrap(), 7u64.to_le_bytes().to_vec());
    assert_eq!(db.earliest_version().unwrap(), Some(4));
    assert_eq!(db.latest_version().unwrap(), Some(7));
}

/// Collects every `(key, value)` pair it walks over; clones share the
/// sink, so parallel sub-walks aggregate into one view.
struct Collector {
    out: Arc<Mutex<Vec<(Vec<u8>, Vec<u8>)>>>,
    key: Vec<u8>,
    frames: Vec<usize>,
}

impl Collector {
    fn new(out: Arc<Mutex<Vec<(Vec<u8>, Vec<u8>)>>>) -> Collector {
        Collector {
            out,
            key: Vec::new(),
            frames: Vec::new(),
        }
    }
}

impl TraverseMachine for Collector {
    fn down(&mut self, branch: u8, node: &Node) -> Result<bool, DbError> {
        self.frames.push(self.key.len());
        if branch != ROOT_BRANCH {
            self.key.push(branch);
        }
        self.key.extend_from_slice(node.path.as_slice());
        if let Some(value) = &node.value {
            self.out
                .lock()
                .unwrap()
                .push((self.key.clone(), value.clone()));
        }
        Ok(true)
    }

    fn up(&mut self, _branch: u8, _node: &Node) -> Result<(), DbError> {
        let len = self.frames.pop().expect("balanced traversal; qed");
        self.key.truncate(len);
        Ok(())
    }

    fn clone_machine(&self) -> Box<dyn TraverseMachine> {
        Box::new(Collector {
            out: self.out.clone(),
            key: self.key.clone(),
            frames: self.frames.clone(),
        })
    }
}

#[test]
fn read_only_view_sees_writer_state() {
    let dir = TempDir::new("triedb").unwrap();
    let Some(db) = try_open(config(&dir, 256)) else { return };

    for version in 0..32u64 {
        db.upsert(
            one(key(&[version as u8, 7]), vec![0xb0 | (version as u8 & 0xf); 16], version),
            version,
            false,
            true,
        )
        .unwrap();
    }

    let ro = ReadOnlyDatabase::open(ReadOnlyDatabaseConfig {
        paths: vec![dir.path().join("db")],
        interleave_chunks: false,
    })
    .unwrap();
    assert_eq!(ro.earliest_version(), Some(0));
    assert_eq!(ro.latest_version(), Some(31));
    assert!(ro.is_latest());

    // coherent with the writer at every retained version
    for version in [0u64, 5, 17, 31] {
        let k = key(&[version as u8, 7]);
        assert_eq!(ro.get(k.clone(), version).unwrap(), db.get(k, version).unwrap());
    }
    // keys written later are absent in older versions
    assert!(matches!(ro.get(key(&[9, 7]), 5), Err(DbError::KeyNotFound)));

    // a full traversal of one historic version sees exactly its pairs
    let out = Arc::new(Mutex::new(Vec::new()));
    let mut machine = Collector::new(out.clone());
    assert!(ro.traverse(Nibbles::new(), &mut machine, 10, 4).unwrap());
    let mut pairs = out.lock().unwrap().clone();
    pairs.sort();
    assert_eq!(pairs.len(), 11);
    for (k, v) in pairs {
        let version = k[0] as u64 * 16 + k[1] as u64;
        assert!(version <= 10);
        assert_eq!(v, vec![0xb0 | (version as u8 & 0xf); 16]);
    }
}

#[test]
fn read_only_view_survives_concurrent_writes() {
    let dir = TempDir::new("triedb").unwrap();
    let Some(db) = try_open(config(&dir, 8)) else { return };
    db.upsert(one(key(&[0]), vec![0; 8], 0), 0, false, true).unwrap();

    let ro = ReadOnlyDatabase::open(ReadOnlyDatabaseConfig {
        paths: vec![dir.path().join("db")],
        interleave_chunks: false,
    })
    .unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let reader = {
        let stop = stop.clone();
        std::thread::spawn(move || {
            let mut sampled = 0u64;
            let mut state = 0x243f_6a88_85a3_08d3u64;
            while !stop.load(Ordering::Acquire) {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
                let (Some(earliest), Some(latest)) = (ro.earliest_version(), ro.latest_version())
                else {
                    continue;
                };
                let version = earliest + state % (latest - earliest + 1);
                match ro.get(key(&[(version % 64) as u8]), version) {
                    Ok(value) => assert_eq!(value, vec![(version % 64) as u8; 8]),
                    // pruned between sampling and lookup, or a key not
                    // yet written at that version
                    Err(DbError::VersionUnknown) | Err(DbError::KeyNotFound) => {}
                    Err(err) => panic!("reader saw {err}"),
                }
                sampled += 1;
            }
            sampled
        })
    };

    for version in 1..64u64 {
        db.upsert(
            one(key(&[(version % 64) as u8]), vec![(version % 64) as u8; 8], version),
            version,
            false,
            true,
        )
        .unwrap();
    }
    stop.store(true, Ordering::Release);
    let sampled = reader.join().unwrap();
    assert!(sampled > 0);
}

#[test]
fn compaction_reclaims_chunks() {
    let dir = TempDir::new("triedb").unwrap();
    let mut cfg = config(&dir, 4);
    // a deliberately tight pool: seven 1 MiB sequential chunks
    cfg.create_file_size = 24 * 1024 * 1024;
    let Some(db) = try_open(cfg) else { return };

    // churn more bytes through the pool than it holds; the writes can
    // only keep succeeding if exhausted chunks return to the free list
    let value = vec![0x77u8; 64 * 1024];
    for version in 0..200u64 {
        let target = (version % 8) as u8;
        db.upsert(
            one(key(&[target, target]), value.clone(), version),
            version,
            true,
            true,
        )
        .unwrap();
    }
    for target in 0..8u8 {
        assert_eq!(db.get(key(&[target, target]), 199).unwrap(), value);
    }
    drop(db);

    let pool = triedb_pool::StoragePool::open(
        &[dir.path().join("db")],
        triedb_pool::Mode::OpenExisting,
        triedb_pool::PoolOptions {
            read_only: true,
            chunk_capacity: 1 << 20,
            ..Default::default()
        },
    )
    .unwrap();
    // the churn wrote ~13MiB of history through a 7MiB pool; without
    // reclamation the free list would have been exhausted long ago
    assert!(pool.free_capacity() >= pool.chunk_capacity() * 2);
}

#[test]
fn dirty_pool_rewinds_on_open() {
    let dir = TempDir::new("triedb").unwrap();
    let mut cfg = config(&dir, 16);
    {
        let Some(db) = try_open(cfg.clone()) else { return };
        for version in 0..4u64 {
            db.upsert(one(key(&[version as u8]), vec![1; 64], version), version, false, true)
                .unwrap();
        }
    }
    {
        // simulate a crash mid-commit: bytes appended past the wip
        // offsets with the dirty byte left high
        let pool = triedb_pool::StoragePool::open(
            &[dir.path().join("db")],
            triedb_pool::Mode::OpenExisting,
            triedb_pool::PoolOptions {
                chunk_capacity: 1 << 20,
                ..Default::default()
            },
        )
        .unwrap();
        let head = pool
            .meta()
            .list_tail(triedb_pool::ListId::Fast)
            .expect("writes landed on the fast list");
        let chunk = pool
            .activate_chunk(triedb_pool::ChunkClass::Sequential, head)
            .unwrap();
        chunk.try_reserve(8192).unwrap();
        std::mem::forget(pool.meta().hold_dirty());
    }
    cfg.truncate = false;
    let db = Database::open(cfg).unwrap();
    assert_eq!(db.latest_version().unwrap(), Some(3));
    for version in 0..4u64 {
        assert_eq!(db.get(key(&[version as u8]), 3).unwrap(), vec![1; 64]);
    }
}

#[test]
fn verified_and_voted_watermarks() {
    let dir = TempDir::new("triedb").unwrap();
    let Some(db) = try_open(config(&dir, 16)) else { return };

    db.update_verified(5).unwrap();
    assert!(matches!(db.update_verified(5), Err(DbError::InvariantViolation(_))));
    assert!(matches!(db.update_verified(3), Err(DbError::InvariantViolation(_))));
    db.update_verified(6).unwrap();

    db.update_voted(9, H256::repeat_byte(0x11)).unwrap();
    db.update_voted(10, H256::repeat_byte(0x22)).unwrap();
}

#[test]
fn fingerprints_match_across_instances() {
    let dir_a = TempDir::new("triedb").unwrap();
    let dir_b = TempDir::new("triedb").unwrap();
    let Some(a) = try_open(config(&dir_a, 16)) else { return };
    let Some(b) = try_open(config(&dir_b, 16)) else { return };

    // same updates in different order produce the same subtree digests
    let forward: UpdateList = (0..32u8)
        .map(|i| Update::insert(key(&[i, 0x5c]), vec![i; 40], 0))
        .collect();
    let backward: UpdateList = (0..32u8)
        .rev()
        .map(|i| Update::insert(key(&[i, 0x5c]), vec![i; 40], 0))
        .collect();
    a.upsert(forward, 0, false, true).unwrap();
    b.upsert(backward, 0, false, true).unwrap();

    let fp_a = a.get_data(key(&[4, 0x5c]), 0).unwrap();
    let fp_b = b.get_data(key(&[4, 0x5c]), 0).unwrap();
    assert_eq!(fp_a.len(), 32);
    assert_eq!(fp_a, fp_b);
    assert_eq!(
        a.get_data(Nibbles::new(), 0).unwrap(),
        b.get_data(Nibbles::new(), 0).unwrap()
    );
}

#[test]
fn prefetch_warms_the_cache() {
    let dir = TempDir::new("triedb").unwrap();
    let mut cfg = config(&dir, 16);
    {
        let Some(db) = try_open(cfg.clone()) else { return };
        for version in 0..4u64 {
            db.upsert(
                one(key(&[version as u8, 1, 2]), vec![9; 128], version),
                version,
                false,
                true,
            )
            .unwrap();
        }
    }
    cfg.truncate = false;
    let db = Database::open(cfg).unwrap();
    // a fresh worker has only the root cached; prefetch loads the rest
    let loaded = db.prefetch().unwrap();
    assert!(loaded > 0);
    assert_eq!(db.prefetch().unwrap(), 0);
}

#[test]
fn in_memory_database_round_trips() {
    let db = Database::in_memory(16);
    db.upsert(one(key(b"alpha"), b"1".to_vec(), 0), 0, false, true)
        .unwrap();
    db.upsert(one(key(b"beta"), b"2".to_vec(), 1), 1, false, true)
        .unwrap();
    assert_eq!(db.get(key(b"alpha"), 1).unwrap(), b"1".to_vec());
    assert_eq!(db.get(key(b"beta"), 1).unwrap(), b"2".to_vec());
    assert!(matches!(db.get(key(b"gamma"), 1), Err(DbError::KeyNotFound)));
    assert!(matches!(db.get(key(b"alpha"), 9), Err(DbError::VersionUnknown)));

    let out = Arc::new(Mutex::new(Vec::new()));
    db.traverse(Nibbles::new(), Box::new(Collector::new(out.clone())), 1, 1)
        .unwrap();
    assert_eq!(out.lock().unwrap().len(), 2);
}

#[test]
fn in_memory_proposal_promotion() {
    let db = Database::in_memory(16);
    let block_id = H256::repeat_byte(0x99);
    let mut proposal_key = proposal_prefix(&block_id);
    proposal_key.extend(&key(b"k"));
    db.upsert(one(proposal_key, b"v".to_vec(), 0), 0, false, true)
        .unwrap();
    db.finalize(0, block_id).unwrap();
    let mut finalized_key = finalized_prefix();
    finalized_key.extend(&key(b"k"));
    assert_eq!(db.get(finalized_key, 0).unwrap(), b"v".to_vec());
}
