//! # Cache / Snapshot Manager
//!
//! Holds the current committed metadata state as a persistent treap and
//! serializes committed mutations through the batch log. The cache is
//! eager: it holds the entire metadata state in memory, so snapshot reads
//! never touch the backend. Metadata is small next to the block payloads
//! it indexes, and the eager policy removes a failure mode from every read.
//!
//! A snapshot is a clone of the current root. Path copying means the clone
//! is O(1) and pins exactly the committed state it was taken from for as
//! long as the snapshot lives; any number of snapshots coexist with
//! ongoing commits.
//!
//! Commit protocol: append one batch frame to the log (durability point),
//! then merge the deltas into the current root and publish the new root
//! under the lock. A failed append leaves the published root untouched, so
//! readers can never observe a state the log does not contain.

use std::path::Path;

use bytes::Bytes;
use eyre::Result as SetupResult;
use parking_lot::RwLock;
use tracing::debug;

use crate::error::{Error, Result};
use crate::storage::meta_log::{BatchOp, MetaLog};
use crate::treap::{Immutable, Mutable};

/// An immutable view of the committed metadata state.
#[derive(Clone)]
pub struct Snapshot {
    root: Immutable,
}

impl Snapshot {
    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        self.root.get(key)
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.root.contains(key)
    }

    pub(crate) fn root(&self) -> &Immutable {
        &self.root
    }
}

/// Owns the committed metadata root and its durable log.
pub struct MetaCache {
    log: MetaLog,
    current: RwLock<Immutable>,
}

impl MetaCache {
    /// Opens the metadata log under `dir` and reconstructs the committed
    /// state from it.
    pub fn open(dir: &Path) -> SetupResult<Self> {
        let (log, state) = MetaLog::open(dir)?;
        debug!(keys = state.len(), "metadata cache loaded");
        Ok(Self {
            log,
            current: RwLock::new(state),
        })
    }

    /// Returns a snapshot of the current committed state.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            root: self.current.read().clone(),
        }
    }

    /// Atomically applies a transaction's key-value deltas: one durable
    /// batch append, then a single root publish. On append failure the
    /// published root is unchanged.
    pub fn commit(&self, pending_keys: &Mutable, pending_remove: &Mutable) -> Result<()> {
        let mut ops: Vec<BatchOp> =
            Vec::with_capacity(pending_keys.len() + pending_remove.len());
        for (key, _) in pending_remove.freeze().iter() {
            ops.push((key, None));
        }
        for (key, value) in pending_keys.freeze().iter() {
            ops.push((key, Some(value)));
        }
        if ops.is_empty() {
            return Ok(());
        }

        self.log
            .append_batch(&ops)
            .map_err(|e| Error::driver("failed to flush metadata batch", e))?;

        let mut current = self.current.write();
        let mut root = current.clone();
        for (key, value) in &ops {
            root = match value {
                Some(value) => root.insert(key.clone(), value.clone()),
                None => root.remove(key),
            };
        }
        *current = root;
        Ok(())
    }

    /// Compacts the log down to the current state. Called on database
    /// close, when no transaction can be mid-commit.
    pub fn close(&self) -> SetupResult<()> {
        self.log.rewrite(&self.current.read())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[test]
    fn snapshots_are_stable_across_commits() {
        let dir = tempdir().unwrap();
        let cache = MetaCache::open(dir.path()).unwrap();

        let mut keys = Mutable::default();
        keys.insert(b("a"), b("1"));
        cache.commit(&keys, &Mutable::default()).unwrap();

        let before = cache.snapshot();

        let mut keys = Mutable::default();
        keys.insert(b("b"), b("2"));
        let mut remove = Mutable::default();
        remove.insert(b("a"), Bytes::new());
        cache.commit(&keys, &remove).unwrap();

        let after = cache.snapshot();

        assert!(before.contains(b"a"));
        assert!(!before.contains(b"b"));
        assert!(!after.contains(b"a"));
        assert_eq!(after.get(b"b"), Some(b("2")));
    }

    #[test]
    fn committed_state_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let cache = MetaCache::open(dir.path()).unwrap();
            let mut keys = Mutable::default();
            keys.insert(b("k"), b("v"));
            cache.commit(&keys, &Mutable::default()).unwrap();
            cache.close().unwrap();
        }
        let cache = MetaCache::open(dir.path()).unwrap();
        assert_eq!(cache.snapshot().get(b"k"), Some(b("v")));
    }
}
