//! # Transactions
//!
//! A [`Transaction`] is the single façade over both substrates: metadata
//! reads and writes against a committed snapshot plus pending overlays, and
//! block reads and writes against staged payloads plus the flat-file store.
//!
//! ## Read Path
//!
//! Every lookup consults the transaction's own pending state first, then
//! the snapshot taken at `begin`, and only then (for block payload bytes)
//! the flat-file store:
//!
//! ```text
//! pending_remove ──hides──▶ pending_keys ──shadows──▶ snapshot ──▶ block files
//! ```
//!
//! This gives a write transaction read-your-writes without touching disk,
//! and gives every read transaction a view frozen at `begin` no matter
//! what commits afterwards.
//!
//! ## Write Path
//!
//! Nothing touches either substrate until commit. `store_block` stages
//! payloads in memory; bucket mutations stage key-value deltas in ordered
//! overlay maps; pruning stages file numbers. Commit then runs a fixed
//! sequence: delete pruned files (not undoable, so first), append staged
//! blocks (undoable via a truncation anchor), update the write-cursor row,
//! sync the block files, and finally flush the key-value deltas as one
//! batch and publish the new committed root. Any failure after the anchor
//! truncates the block files back to it and leaves the committed root
//! unpublished.
//!
//! ## Ownership and Locking
//!
//! A transaction is used from one thread, but its mutable state sits
//! behind `parking_lot` locks and atomics so that buckets and cursors can
//! be plain borrowing views (`&Transaction`) without threading `&mut`
//! through every read. The locks are uncontended in practice; the iterator
//! registry is the only structure shared with long-lived helpers and has
//! its own reader-writer lock.
//!
//! ## Lifecycle
//!
//! `begin → active → commit | rollback → closed`. Close is idempotent,
//! drops all pending state, releases the snapshot, and releases the
//! close-barrier hold (and the writer lock for write transactions). A
//! dropped transaction that was never closed closes itself. Managed
//! transactions (from [`Database::view`]/[`Database::update`]) panic if
//! user code calls commit or rollback, after closing so nothing leaks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Weak;

use bytes::Bytes;
use hashbrown::{HashMap, HashSet};
use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard};
use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::config::constants::{
    BLOCK_HEADER_SIZE, BLOCK_INDEX_BUCKET_ID, BUCKET_ID_SIZE, CUR_BUCKET_ID_KEY,
    METADATA_BUCKET_ID, WRITE_LOC_KEY,
};
use crate::error::{Error, ErrorKind, Result};
use crate::storage::block_files::{
    deserialize_location, serialize_location, BlockLocation, WriteCursor,
};
use crate::treap::{Immutable, Mutable};
use crate::types::{Block, BlockHash, BlockRegion};

use super::bucket::{bucketized_key, prefix_end, Bucket};
use super::cache::Snapshot;
use super::cursor::CursorHandle;
use super::Database;

/// Serialized write-cursor row stored under the reserved metadata key.
#[repr(C)]
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    zerocopy::IntoBytes,
    zerocopy::FromBytes,
    zerocopy::Immutable,
    zerocopy::KnownLayout,
)]
pub(crate) struct WriteLocRow {
    pub file_num: u32,
    pub offset: u32,
}

pub(crate) fn serialize_write_loc(cursor: WriteCursor) -> Bytes {
    let row = WriteLocRow {
        file_num: cursor.file_num,
        offset: cursor.offset,
    };
    Bytes::copy_from_slice(zerocopy::IntoBytes::as_bytes(&row))
}

pub(crate) fn deserialize_write_loc(row: &[u8]) -> Result<WriteCursor> {
    let row: WriteLocRow = zerocopy::FromBytes::read_from_bytes(row)
        .map_err(|_| Error::corruption(format!("malformed write cursor row: {} bytes", row.len())))?;
    Ok(WriteCursor {
        file_num: row.file_num,
        offset: row.offset,
    })
}

#[derive(Default)]
struct PendingKv {
    keys: Mutable,
    remove: Mutable,
}

#[derive(Default)]
struct PendingBlocks {
    /// Hash to index into `data`, for O(1) presence checks.
    map: HashMap<BlockHash, usize>,
    /// Staged blocks in insertion order; commit appends in this order.
    data: Vec<Block>,
    /// File numbers scheduled for deletion by pruning.
    del_file_nums: SmallVec<[u32; 8]>,
}

/// A snapshot-isolated database transaction, read-only or read-write.
pub struct Transaction<'db> {
    db: &'db Database,
    writable: bool,
    managed: AtomicBool,
    closed: AtomicBool,
    snapshot: Mutex<Option<Snapshot>>,
    pending_kv: RwLock<PendingKv>,
    pending_blocks: RwLock<PendingBlocks>,
    active_iters: RwLock<Vec<Weak<CursorHandle>>>,
    close_hold: Mutex<Option<RwLockReadGuard<'db, ()>>>,
    write_hold: Mutex<Option<MutexGuard<'db, ()>>>,
}

impl<'db> std::fmt::Debug for Transaction<'db> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("writable", &self.writable)
            .finish_non_exhaustive()
    }
}

impl<'db> Transaction<'db> {
    pub(crate) fn new(
        db: &'db Database,
        writable: bool,
        snapshot: Snapshot,
        close_hold: RwLockReadGuard<'db, ()>,
        write_hold: Option<MutexGuard<'db, ()>>,
    ) -> Self {
        Self {
            db,
            writable,
            managed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            snapshot: Mutex::new(Some(snapshot)),
            pending_kv: RwLock::new(PendingKv::default()),
            pending_blocks: RwLock::new(PendingBlocks::default()),
            active_iters: RwLock::new(Vec::new()),
            close_hold: Mutex::new(Some(close_hold)),
            write_hold: Mutex::new(write_hold),
        }
    }

    /// Whether this transaction accepts mutations.
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub(crate) fn set_managed(&self, managed: bool) {
        self.managed.store(managed, Ordering::Relaxed);
    }

    pub(crate) fn check_closed(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::tx_closed());
        }
        Ok(())
    }

    pub(crate) fn check_writable(&self, op: &str) -> Result<()> {
        if !self.writable {
            return Err(Error::tx_not_writable(op));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Key-level helpers used by buckets and cursors.
    // ------------------------------------------------------------------

    pub(crate) fn has_key(&self, key: &[u8]) -> bool {
        if self.writable {
            let pending = self.pending_kv.read();
            if pending.remove.contains(key) {
                return false;
            }
            if pending.keys.contains(key) {
                return true;
            }
        }
        self.snapshot
            .lock()
            .as_ref()
            .is_some_and(|snap| snap.contains(key))
    }

    /// Fetches `key` honoring the overlay precedence: a pending removal
    /// hides everything, a pending write shadows the snapshot.
    pub(crate) fn fetch_key(&self, key: &[u8]) -> Option<Bytes> {
        if self.writable {
            let pending = self.pending_kv.read();
            if pending.remove.contains(key) {
                return None;
            }
            if let Some(value) = pending.keys.get(key) {
                return Some(value);
            }
        }
        self.snapshot.lock().as_ref().and_then(|snap| snap.get(key))
    }

    pub(crate) fn put_key(&self, key: Bytes, value: Bytes) {
        {
            let mut pending = self.pending_kv.write();
            pending.remove.remove(&key);
            pending.keys.insert(key, value);
        }
        self.notify_active_iters();
    }

    /// Stages a deletion. `notify` exists so bulk deletions can defer
    /// iterator notification to a single final pass.
    pub(crate) fn delete_key(&self, key: &[u8], notify: bool) {
        {
            let mut pending = self.pending_kv.write();
            pending.keys.remove(key);
            pending
                .remove
                .insert(Bytes::copy_from_slice(key), Bytes::new());
        }
        if notify {
            self.notify_active_iters();
        }
    }

    /// Allocates the next 4-byte bucket id from the reserved counter key.
    pub(crate) fn next_bucket_id(&self) -> Result<[u8; BUCKET_ID_SIZE]> {
        let current = match self.fetch_key(CUR_BUCKET_ID_KEY) {
            None => u32::from_be_bytes(BLOCK_INDEX_BUCKET_ID),
            Some(raw) => {
                let raw: [u8; 4] = raw.as_ref().try_into().map_err(|_| {
                    Error::corruption("malformed bucket id counter")
                })?;
                u32::from_be_bytes(raw)
            }
        };
        let next = current.checked_add(1).ok_or_else(|| {
            Error::new(ErrorKind::DriverSpecific, "bucket id space exhausted")
        })?;
        let id = next.to_be_bytes();
        self.put_key(
            Bytes::from_static(CUR_BUCKET_ID_KEY),
            Bytes::copy_from_slice(&id),
        );
        Ok(id)
    }

    // ------------------------------------------------------------------
    // Cursor support.
    // ------------------------------------------------------------------

    pub(crate) fn register_cursor(&self, handle: &std::sync::Arc<CursorHandle>) {
        let mut iters = self.active_iters.write();
        iters.retain(|weak| weak.strong_count() > 0);
        iters.push(std::sync::Arc::downgrade(handle));
    }

    pub(crate) fn deregister_cursor(&self, handle: &std::sync::Arc<CursorHandle>) {
        self.active_iters
            .write()
            .retain(|weak| !weak.ptr_eq(&std::sync::Arc::downgrade(handle)));
    }

    pub(crate) fn notify_active_iters(&self) {
        let iters = self.active_iters.read();
        for weak in iters.iter() {
            if let Some(handle) = weak.upgrade() {
                handle.force_reseek();
            }
        }
    }

    /// Frozen capture of the pending-keys overlay, for cursors.
    pub(crate) fn freeze_pending_keys(&self) -> Immutable {
        if !self.writable {
            return Immutable::default();
        }
        self.pending_kv.read().keys.freeze()
    }

    /// Live hide-filter check against the pending removals.
    pub(crate) fn is_pending_removed(&self, key: &[u8]) -> bool {
        self.writable && self.pending_kv.read().remove.contains(key)
    }

    pub(crate) fn snapshot_map(&self) -> Result<Immutable> {
        self.snapshot
            .lock()
            .as_ref()
            .map(|snap| snap.root().clone())
            .ok_or_else(Error::tx_closed)
    }

    /// Merged view of `[start, limit)`: snapshot entries minus pending
    /// removals, overlaid with pending writes. Used by bulk operations
    /// that then stage deletions key by key.
    pub(crate) fn entries_in_range(
        &self,
        start: &[u8],
        limit: Option<&[u8]>,
    ) -> Vec<(Bytes, Bytes)> {
        let snapshot = self
            .snapshot
            .lock()
            .as_ref()
            .map(|snap| snap.root().clone())
            .unwrap_or_default();
        let (pending_keys, pending_remove) = if self.writable {
            let pending = self.pending_kv.read();
            (pending.keys.freeze(), pending.remove.freeze())
        } else {
            (Immutable::default(), Immutable::default())
        };

        enum Take {
            Snapshot,
            Pending,
            PendingShadowsSnapshot,
        }

        let mut merged = Vec::new();
        let mut snap_iter = snapshot
            .range_iter(start, limit)
            .filter(|(key, _)| !pending_remove.contains(key))
            .peekable();
        let mut pend_iter = pending_keys.range_iter(start, limit).peekable();

        loop {
            let take = match (snap_iter.peek(), pend_iter.peek()) {
                (None, None) => break,
                (Some(_), None) => Take::Snapshot,
                (None, Some(_)) => Take::Pending,
                (Some((snap_key, _)), Some((pend_key, _))) => {
                    match snap_key.cmp(pend_key) {
                        std::cmp::Ordering::Less => Take::Snapshot,
                        std::cmp::Ordering::Equal => Take::PendingShadowsSnapshot,
                        std::cmp::Ordering::Greater => Take::Pending,
                    }
                }
            };
            match take {
                Take::Snapshot => merged.push(snap_iter.next().expect("peeked")),
                Take::Pending => merged.push(pend_iter.next().expect("peeked")),
                Take::PendingShadowsSnapshot => {
                    snap_iter.next();
                    merged.push(pend_iter.next().expect("peeked"));
                }
            }
        }
        merged
    }

    // ------------------------------------------------------------------
    // Metadata surface.
    // ------------------------------------------------------------------

    /// The root bucket for all metadata storage.
    pub fn metadata(&self) -> Bucket<'_, 'db> {
        Bucket::new(self, METADATA_BUCKET_ID)
    }

    fn block_index_key(hash: &BlockHash) -> Bytes {
        bucketized_key(BLOCK_INDEX_BUCKET_ID, hash.as_ref())
    }

    // ------------------------------------------------------------------
    // Block surface.
    // ------------------------------------------------------------------

    fn has_block_inner(&self, hash: &BlockHash) -> bool {
        if self.pending_blocks.read().map.contains_key(hash) {
            return true;
        }
        self.has_key(&Self::block_index_key(hash))
    }

    /// Whether a block with the given hash exists, staged or committed.
    pub fn has_block(&self, hash: &BlockHash) -> Result<bool> {
        self.check_closed()?;
        Ok(self.has_block_inner(hash))
    }

    /// Batch form of [`Transaction::has_block`].
    pub fn has_blocks(&self, hashes: &[BlockHash]) -> Result<Vec<bool>> {
        self.check_closed()?;
        Ok(hashes.iter().map(|h| self.has_block_inner(h)).collect())
    }

    /// Stages a block for storage on commit. The payload is not written to
    /// disk until the transaction commits.
    pub fn store_block(&self, block: &Block) -> Result<()> {
        self.check_closed()?;
        self.check_writable("store block")?;
        if self.has_block_inner(block.hash()) {
            return Err(Error::new(
                ErrorKind::BlockExists,
                format!("block {} already exists", block.hash()),
            ));
        }

        let mut pending = self.pending_blocks.write();
        let index = pending.data.len();
        pending.map.insert(*block.hash(), index);
        pending.data.push(block.clone());
        trace!(hash = %block.hash(), height = block.height(), "staged block for commit");
        Ok(())
    }

    fn fetch_block_row(&self, hash: &BlockHash) -> Result<Bytes> {
        self.fetch_key(&Self::block_index_key(hash)).ok_or_else(|| {
            Error::new(
                ErrorKind::BlockNotFound,
                format!("block {hash} does not exist"),
            )
        })
    }

    /// Returns the full serialized payload of the block with `hash`.
    ///
    /// The returned bytes alias internal buffers and are valid only while
    /// the transaction is open.
    pub fn fetch_block(&self, hash: &BlockHash) -> Result<Bytes> {
        self.check_closed()?;

        {
            let pending = self.pending_blocks.read();
            if let Some(&index) = pending.map.get(hash) {
                return Ok(pending.data[index].bytes().clone());
            }
        }

        let row = self.fetch_block_row(hash)?;
        let location = deserialize_location(&row)?;
        self.db.store().read_block(hash, location)
    }

    /// Batch form of [`Transaction::fetch_block`]; fails on the first
    /// missing or unreadable block.
    pub fn fetch_blocks(&self, hashes: &[BlockHash]) -> Result<Vec<Bytes>> {
        self.check_closed()?;
        hashes.iter().map(|hash| self.fetch_block(hash)).collect()
    }

    fn region_invalid(region: &BlockRegion, block_len: usize) -> Error {
        Error::new(
            ErrorKind::BlockRegionInvalid,
            format!(
                "block {} region offset {}, length {} exceeds block length of {}",
                region.hash, region.offset, region.len, block_len
            ),
        )
    }

    /// Resolves a region against the staged blocks, bounds-checking it
    /// against the staged payload. `Ok(None)` when the block is not
    /// staged.
    fn fetch_pending_region(&self, region: &BlockRegion) -> Result<Option<Bytes>> {
        let pending = self.pending_blocks.read();
        let Some(&index) = pending.map.get(&region.hash) else {
            return Ok(None);
        };
        let bytes = pending.data[index].bytes();
        let end = region
            .offset
            .checked_add(region.len)
            .filter(|end| *end as usize <= bytes.len())
            .ok_or_else(|| Self::region_invalid(region, bytes.len()))?;
        Ok(Some(bytes.slice(region.offset as usize..end as usize)))
    }

    /// Returns `region.len` payload bytes starting `region.offset` into
    /// the block. Overflow of `offset + len` or an end past the payload
    /// is [`ErrorKind::BlockRegionInvalid`].
    pub fn fetch_block_region(&self, region: &BlockRegion) -> Result<Bytes> {
        self.check_closed()?;

        if let Some(bytes) = self.fetch_pending_region(region)? {
            return Ok(bytes);
        }

        let row = self.fetch_block_row(&region.hash)?;
        let location = deserialize_location(&row)?;
        let end = region
            .offset
            .checked_add(region.len)
            .filter(|end| *end <= location.block_len)
            .ok_or_else(|| Self::region_invalid(region, location.block_len as usize))?;
        debug_assert!(end >= region.offset);
        self.db
            .store()
            .read_block_region(location, region.offset, region.len)
    }

    /// Batch region fetch. Staged regions are answered inline; disk reads
    /// are issued in `(file_num, offset)` order to keep file access
    /// grouped and linear, while results come back in input order.
    pub fn fetch_block_regions(&self, regions: &[BlockRegion]) -> Result<Vec<Bytes>> {
        self.check_closed()?;

        let mut results: Vec<Bytes> = vec![Bytes::new(); regions.len()];
        let mut fetch_list: SmallVec<[(BlockLocation, usize); 16]> =
            SmallVec::with_capacity(regions.len());

        for (reply_index, region) in regions.iter().enumerate() {
            if let Some(bytes) = self.fetch_pending_region(region)? {
                results[reply_index] = bytes;
                continue;
            }

            let row = self.fetch_block_row(&region.hash)?;
            let location = deserialize_location(&row)?;
            region
                .offset
                .checked_add(region.len)
                .filter(|end| *end <= location.block_len)
                .ok_or_else(|| Self::region_invalid(region, location.block_len as usize))?;
            fetch_list.push((location, reply_index));
        }

        fetch_list.sort_unstable_by_key(|(location, _)| (location.file_num, location.offset));

        for (location, reply_index) in fetch_list {
            let region = &regions[reply_index];
            results[reply_index] =
                self.db
                    .store()
                    .read_block_region(location, region.offset, region.len)?;
        }
        Ok(results)
    }

    /// Returns the serialized block header: the first
    /// [`BLOCK_HEADER_SIZE`] bytes of the block.
    pub fn fetch_block_header(&self, hash: &BlockHash) -> Result<Bytes> {
        self.fetch_block_region(&BlockRegion {
            hash: *hash,
            offset: 0,
            len: BLOCK_HEADER_SIZE,
        })
    }

    /// Batch form of [`Transaction::fetch_block_header`].
    pub fn fetch_block_headers(&self, hashes: &[BlockHash]) -> Result<Vec<Bytes>> {
        let regions: Vec<BlockRegion> = hashes
            .iter()
            .map(|hash| BlockRegion {
                hash: *hash,
                offset: 0,
                len: BLOCK_HEADER_SIZE,
            })
            .collect();
        self.fetch_block_regions(&regions)
    }

    // ------------------------------------------------------------------
    // Pruning.
    // ------------------------------------------------------------------

    /// Schedules block files for deletion until total block storage would
    /// drop to `target_size` bytes, and removes the index entries of every
    /// block stored in those files. Returns the hashes of the removed
    /// blocks. The newest file is never pruned.
    pub fn prune_blocks(&self, target_size: u64) -> Result<Vec<BlockHash>> {
        self.check_closed()?;
        self.check_writable("prune blocks")?;

        let max_size = self.db.store().max_file_size() as u64;
        if target_size < max_size {
            return Err(Error::new(
                ErrorKind::DriverSpecific,
                format!(
                    "got target size of {target_size} but it must be greater than {max_size}, \
                     the max size of a single block file"
                ),
            ));
        }

        let (first, last, last_file_size) = self.db.store().scan_files()?;
        if first == last {
            return Ok(Vec::new());
        }

        // Every file but the last is at the maximum size.
        let full_file_count = (last - first) as u64;
        let mut total_size = last_file_size + max_size * full_file_count;
        if total_size <= target_size {
            return Ok(Vec::new());
        }
        debug!(
            over = total_size - target_size,
            target = target_size,
            "pruning block files"
        );

        let mut chosen: HashSet<u32> = HashSet::new();
        {
            let mut pending = self.pending_blocks.write();
            // `<` and not `<=`: the last file is never eligible.
            for file_num in first..last {
                pending.del_file_nums.push(file_num);
                chosen.insert(file_num);
                total_size -= max_size;
                if total_size <= target_size {
                    break;
                }
            }
        }

        // Drop the index entries of every block living in a chosen file.
        let start = Bytes::copy_from_slice(&BLOCK_INDEX_BUCKET_ID);
        let limit = prefix_end(&BLOCK_INDEX_BUCKET_ID);
        let mut deleted_hashes = Vec::new();
        for (key, value) in self.entries_in_range(&start, limit.as_deref()) {
            let location = deserialize_location(&value)?;
            if !chosen.contains(&location.file_num) {
                continue;
            }
            let hash = BlockHash::from_slice(&key[BUCKET_ID_SIZE..])
                .ok_or_else(|| Error::corruption("malformed block index key"))?;
            deleted_hashes.push(hash);
            self.delete_key(&key, false);
        }
        self.notify_active_iters();

        trace!(
            files = chosen.len(),
            blocks = deleted_hashes.len(),
            "scheduled prune"
        );
        Ok(deleted_hashes)
    }

    /// Whether the store has ever been pruned: file zero is gone and at
    /// least two files remain.
    pub fn been_pruned(&self) -> Result<bool> {
        self.check_closed()?;
        let (first, last, _) = self.db.store().scan_files()?;
        Ok(first != 0 && first != last)
    }

    // ------------------------------------------------------------------
    // Commit / rollback.
    // ------------------------------------------------------------------

    fn has_pending_data(&self) -> bool {
        {
            let pending = self.pending_kv.read();
            if !pending.keys.is_empty() || !pending.remove.is_empty() {
                return true;
            }
        }
        let pending = self.pending_blocks.read();
        !pending.data.is_empty() || !pending.del_file_nums.is_empty()
    }

    /// Writes pending block data to the flat files, records their
    /// locations and the new write cursor in the pending overlay, and
    /// commits the overlay through the cache. Only called with pending
    /// data present.
    fn write_pending_and_commit(&self) -> Result<()> {
        let store = self.db.store();
        let pending = self.pending_blocks.read();

        // File deletions cannot be undone, so they go first: a failure
        // later can only leave pruned files gone, never the index pointing
        // at blocks that were silently dropped mid-append.
        for &file_num in pending.del_file_nums.iter() {
            store.delete_file(file_num)?;
        }

        // Anchor for rolling the append log back. Only this transaction
        // can advance the cursor, so the read is stable.
        let anchor = store.write_cursor();
        let rollback = || store.handle_rollback(anchor.file_num, anchor.offset);

        for block in pending.data.iter() {
            trace!(hash = %block.hash(), "storing block");
            let location = match store.write_block(block.height(), block.bytes()) {
                Ok(location) => location,
                Err(e) => {
                    rollback();
                    return Err(e);
                }
            };
            self.put_key(
                Self::block_index_key(block.hash()),
                serialize_location(&location),
            );
        }

        let cursor = store.write_cursor();
        self.put_key(
            bucketized_key(METADATA_BUCKET_ID, WRITE_LOC_KEY),
            serialize_write_loc(cursor),
        );

        if let Err(e) = store.sync() {
            rollback();
            return Err(e);
        }

        let kv = self.pending_kv.read();
        if let Err(e) = self.db.cache().commit(&kv.keys, &kv.remove) {
            rollback();
            return Err(e);
        }
        Ok(())
    }

    /// Commits all pending metadata and block writes.
    ///
    /// # Panics
    ///
    /// Panics if called on a managed transaction (one inside
    /// [`Database::view`] or [`Database::update`]); the transaction is
    /// closed first so nothing leaks.
    pub fn commit(&self) -> Result<()> {
        if self.managed.load(Ordering::Relaxed) {
            self.close_internal();
            panic!("managed transaction commit not allowed");
        }
        self.check_closed()?;

        let result = if !self.writable {
            Err(Error::tx_not_writable("commit"))
        } else if self.has_pending_data() {
            self.write_pending_and_commit()
        } else {
            Ok(())
        };
        self.close_internal();
        result
    }

    /// Discards all pending state and closes the transaction.
    ///
    /// # Panics
    ///
    /// Panics if called on a managed transaction, after closing it.
    pub fn rollback(&self) -> Result<()> {
        if self.managed.load(Ordering::Relaxed) {
            self.close_internal();
            panic!("managed transaction rollback not allowed");
        }
        self.check_closed()?;
        self.close_internal();
        Ok(())
    }

    /// Marks the transaction closed, drops pending state, releases the
    /// snapshot, then releases the close-barrier hold and the writer lock.
    /// Safe to call more than once.
    pub(crate) fn close_internal(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        {
            let mut pending = self.pending_blocks.write();
            pending.map.clear();
            pending.data.clear();
            pending.del_file_nums.clear();
        }
        {
            let mut pending = self.pending_kv.write();
            pending.keys.clear();
            pending.remove.clear();
        }
        self.active_iters.write().clear();

        *self.snapshot.lock() = None;
        *self.close_hold.lock() = None;
        *self.write_hold.lock() = None;
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            self.close_internal();
        }
    }
}
