//! Persistent key-value storage shared by the chain and the state layer.
use std::collections::hash_map::HashMap;

use parking_lot::RwLock;

/// Byte-oriented persistent store. Writes are visible to subsequent reads right away; a backend
/// decides on its own when to flush.
pub trait Database: Send + Sync {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;
    fn put(&self, key: &[u8], val: &[u8]);
    fn delete(&self, key: &[u8]);

    fn has(&self, key: &[u8]) -> bool {
        self.get(key).is_some()
    }
}

/// Keys of the chain's singleton records.
pub mod keys {
    pub const LAST_BLOCK: &[u8] = b"LastBlock";
    pub const GENESIS_BLOCK: &[u8] = b"GenesisBlock";
    pub const CHAIN_ID: &[u8] = b"ChainID";
    pub const LATEST_CHECKPOINT: &[u8] = b"LatestCheckPoint";
    pub const LTD: &[u8] = b"LTD";

    /// `hash || "Info"`
    pub fn block_info(hash: &crate::common::Hash) -> Vec<u8> {
        let mut key = hash.as_bytes().to_vec();
        key.extend_from_slice(b"Info");
        key
    }

    /// `"state:" || root`
    pub fn state(root: &crate::common::Hash) -> Vec<u8> {
        let mut key = b"state:".to_vec();
        key.extend_from_slice(root.as_bytes());
        key
    }
}

/// In-memory [Database], used by tests and ephemeral nodes.
#[derive(Default)]
pub struct MemDatabase {
    inner: RwLock<HashMap<Vec<u8>, Vec<u8>>>,
}

impl MemDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

impl Database for MemDatabase {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.inner.read().get(key).cloned()
    }

    fn put(&self, key: &[u8], val: &[u8]) {
        self.inner.write().insert(key.to_vec(), val.to_vec());
    }

    fn delete(&self, key: &[u8]) {
        self.inner.write().remove(key);
    }
}

#[test]
fn test_mem_database() {
    let db = MemDatabase::new();
    assert!(db.is_empty());
    db.put(keys::LAST_BLOCK, b"abc");
    assert_eq!(db.get(keys::LAST_BLOCK), Some(b"abc".to_vec()));
    assert!(db.has(keys::LAST_BLOCK));
    db.delete(keys::LAST_BLOCK);
    assert!(!db.has(keys::LAST_BLOCK));
    let h = crate::common::Hash::hash(b"x");
    assert_eq!(&keys::block_info(&h)[32..], b"Info");
    assert_eq!(&keys::state(&h)[..6], b"state:");
}
