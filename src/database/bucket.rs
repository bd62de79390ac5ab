//! # Buckets
//!
//! A bucket is a hierarchical namespace over the flat sorted key space. It
//! is a value-object view, not an owned resource: it holds the transaction
//! it reads through and a 4-byte id, and every key it touches is physically
//! stored as `id || user_key`.
//!
//! Nested buckets are entries in a reserved registry subspace:
//! `b"bidx" || parent_id || child_name` maps to the child's 4-byte id.
//! The registry prefix is ASCII while bucket ids are small big-endian
//! integers, so registry keys and bucket contents never interleave and a
//! bucket's cursor sees only its own keys.
//!
//! Ids come from a monotonic counter stored at a reserved key; the root
//! metadata bucket and the block index have fixed ids below the counter's
//! starting point.

use bytes::{BufMut, Bytes, BytesMut};

use crate::config::constants::{BUCKET_ID_SIZE, BUCKET_INDEX_PREFIX};
use crate::error::{Error, ErrorKind, Result};

use super::cursor::Cursor;
use super::transaction::Transaction;

/// Physical key of `key` inside the bucket `id`.
pub(crate) fn bucketized_key(id: [u8; BUCKET_ID_SIZE], key: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(BUCKET_ID_SIZE + key.len());
    buf.put_slice(&id);
    buf.put_slice(key);
    buf.freeze()
}

/// Registry key holding the id of `parent`'s child named `name`.
pub(crate) fn bucket_index_key(parent: [u8; BUCKET_ID_SIZE], name: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(BUCKET_INDEX_PREFIX.len() + BUCKET_ID_SIZE + name.len());
    buf.put_slice(BUCKET_INDEX_PREFIX);
    buf.put_slice(&parent);
    buf.put_slice(name);
    buf.freeze()
}

/// Smallest key strictly greater than every key with the given prefix, or
/// `None` when the prefix is all `0xff` and the range is unbounded.
pub(crate) fn prefix_end(prefix: &[u8]) -> Option<Bytes> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.last_mut() {
        if *last < 0xff {
            *last += 1;
            return Some(Bytes::from(end));
        }
        end.pop();
    }
    None
}

fn bucket_range(id: [u8; BUCKET_ID_SIZE]) -> (Bytes, Option<Bytes>) {
    (Bytes::copy_from_slice(&id), prefix_end(&id))
}

/// A named, prefixed sub-namespace within the metadata key space.
#[derive(Clone, Copy)]
pub struct Bucket<'tx, 'db> {
    tx: &'tx Transaction<'db>,
    id: [u8; BUCKET_ID_SIZE],
}

impl<'tx, 'db> std::fmt::Debug for Bucket<'tx, 'db> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bucket").field("id", &self.id).finish()
    }
}

impl<'tx, 'db> Bucket<'tx, 'db> {
    pub(crate) fn new(tx: &'tx Transaction<'db>, id: [u8; BUCKET_ID_SIZE]) -> Self {
        Self { tx, id }
    }

    fn key_in_bucket(&self, key: &[u8]) -> Bytes {
        bucketized_key(self.id, key)
    }

    fn require_key(key: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(Error::new(ErrorKind::DriverSpecific, "key required"));
        }
        Ok(())
    }

    /// Returns the value stored under `key`, or `None` if absent. The
    /// returned bytes are valid only while the transaction is open.
    pub fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        self.tx.check_closed()?;
        if key.is_empty() {
            return Ok(None);
        }
        Ok(self.tx.fetch_key(&self.key_in_bucket(key)))
    }

    /// Stages `key = value` for commit.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.tx.check_closed()?;
        self.tx.check_writable("put")?;
        Self::require_key(key)?;
        self.tx
            .put_key(self.key_in_bucket(key), Bytes::copy_from_slice(value));
        Ok(())
    }

    /// Stages removal of `key` for commit. Removing an absent key is not
    /// an error.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.tx.check_closed()?;
        self.tx.check_writable("delete")?;
        Self::require_key(key)?;
        self.tx.delete_key(&self.key_in_bucket(key), true);
        Ok(())
    }

    /// Looks up the nested bucket named `name`, or `None` if it does not
    /// exist.
    pub fn bucket(&self, name: &[u8]) -> Result<Option<Bucket<'tx, 'db>>> {
        self.tx.check_closed()?;
        let Some(raw) = self.tx.fetch_key(&bucket_index_key(self.id, name)) else {
            return Ok(None);
        };
        let id: [u8; BUCKET_ID_SIZE] = raw
            .as_ref()
            .try_into()
            .map_err(|_| Error::corruption("malformed child bucket id"))?;
        Ok(Some(Bucket::new(self.tx, id)))
    }

    /// Creates a nested bucket named `name`, failing if it already exists.
    pub fn create_bucket(&self, name: &[u8]) -> Result<Bucket<'tx, 'db>> {
        self.tx.check_closed()?;
        self.tx.check_writable("create bucket")?;
        if name.is_empty() {
            return Err(Error::new(
                ErrorKind::DriverSpecific,
                "bucket name required",
            ));
        }
        let index_key = bucket_index_key(self.id, name);
        if self.tx.has_key(&index_key) {
            return Err(Error::new(
                ErrorKind::DriverSpecific,
                format!(
                    "bucket '{}' already exists",
                    String::from_utf8_lossy(name)
                ),
            ));
        }

        let id = self.tx.next_bucket_id()?;
        self.tx.put_key(index_key, Bytes::copy_from_slice(&id));
        Ok(Bucket::new(self.tx, id))
    }

    /// Returns the nested bucket named `name`, creating it if needed.
    pub fn create_bucket_if_not_exists(&self, name: &[u8]) -> Result<Bucket<'tx, 'db>> {
        self.tx.check_closed()?;
        self.tx.check_writable("create bucket")?;
        if let Some(bucket) = self.bucket(name)? {
            return Ok(bucket);
        }
        self.create_bucket(name)
    }

    /// Removes the nested bucket named `name`, all of its keys, and all of
    /// its nested buckets, recursively. Iterator notification is deferred
    /// to one pass at the end of the bulk delete.
    pub fn delete_bucket(&self, name: &[u8]) -> Result<()> {
        self.tx.check_closed()?;
        self.tx.check_writable("delete bucket")?;
        let child = self.bucket(name)?.ok_or_else(|| {
            Error::new(
                ErrorKind::DriverSpecific,
                format!(
                    "bucket '{}' does not exist",
                    String::from_utf8_lossy(name)
                ),
            )
        })?;

        delete_bucket_tree(self.tx, child.id)?;
        self.tx.delete_key(&bucket_index_key(self.id, name), false);
        self.tx.notify_active_iters();
        Ok(())
    }

    /// Returns an ordered cursor over this bucket's keys, honoring the
    /// transaction's pending overlays.
    pub fn cursor(&self) -> Result<Cursor<'tx, 'db>> {
        self.tx.check_closed()?;
        let (start, limit) = bucket_range(self.id);
        Cursor::new(self.tx, start, limit)
    }

    /// Invokes `f` for every key/value pair in the bucket in key order,
    /// stopping at the first error.
    pub fn for_each<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> Result<()>,
    {
        let mut cursor = self.cursor()?;
        let mut valid = cursor.first();
        while valid {
            let key = cursor.key().expect("cursor is positioned");
            let value = cursor.value().expect("cursor is positioned");
            f(&key, &value)?;
            valid = cursor.next();
        }
        Ok(())
    }
}

/// Recursively stages deletion of every key under `id`, descending into
/// nested buckets through the registry subspace first.
fn delete_bucket_tree(tx: &Transaction<'_>, id: [u8; BUCKET_ID_SIZE]) -> Result<()> {
    let registry_start = bucket_index_key(id, &[]);
    let registry_limit = prefix_end(&registry_start);
    for (key, value) in tx.entries_in_range(&registry_start, registry_limit.as_deref()) {
        let child: [u8; BUCKET_ID_SIZE] = value
            .as_ref()
            .try_into()
            .map_err(|_| Error::corruption("malformed child bucket id"))?;
        delete_bucket_tree(tx, child)?;
        tx.delete_key(&key, false);
    }

    let (start, limit) = bucket_range(id);
    for (key, _) in tx.entries_in_range(&start, limit.as_deref()) {
        tx.delete_key(&key, false);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_end_increments_last_byte() {
        assert_eq!(prefix_end(&[0, 0, 0, 1]).unwrap().as_ref(), &[0, 0, 0, 2]);
        assert_eq!(prefix_end(b"bidx").unwrap().as_ref(), b"bidy");
    }

    #[test]
    fn prefix_end_carries_past_ff() {
        assert_eq!(prefix_end(&[1, 0xff]).unwrap().as_ref(), &[2]);
        assert_eq!(prefix_end(&[0xff, 0xff]), None);
    }

    #[test]
    fn bucketized_key_concatenates() {
        let key = bucketized_key([0, 0, 0, 7], b"name");
        assert_eq!(key.as_ref(), &[0, 0, 0, 7, b'n', b'a', b'm', b'e']);
    }
}
