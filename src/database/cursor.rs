//! # Cursors
//!
//! Ordered iteration over one bucket, merging three sources in key order:
//! the committed snapshot restricted to the bucket's prefix range, the
//! frozen capture of the pending-keys overlay, and the pending removals as
//! a hide filter over the snapshot side. Pending entries shadow snapshot
//! entries with the same key.
//!
//! ## Invalidation
//!
//! Every pending-set mutation notifies registered cursors through a weak
//! handle, setting a reseek flag. The next movement re-captures the
//! pending overlay and continues relative to the cursor's current logical
//! key. The snapshot side is immutable and never needs re-capture.
//!
//! Movement is implemented as positional searches keyed off the current
//! key rather than as stateful tree walks, so a re-seek is just "search
//! again against the fresh capture" — there is no iterator state that can
//! dangle. Each step costs O(log n) on both sources.
//!
//! The registry holds `Weak` handles: dropping a cursor deregisters it,
//! and a transaction outliving its cursors never keeps them alive.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, ErrorKind, Result};
use crate::treap::Immutable;

use super::transaction::Transaction;

/// Shared flag between a cursor and its transaction's iterator registry.
pub(crate) struct CursorHandle {
    reseek: AtomicBool,
}

impl CursorHandle {
    fn new() -> Self {
        Self {
            reseek: AtomicBool::new(false),
        }
    }

    /// Called by the transaction when the pending sets change.
    pub(crate) fn force_reseek(&self) {
        self.reseek.store(true, Ordering::Release);
    }

    fn take_reseek(&self) -> bool {
        self.reseek.swap(false, Ordering::AcqRel)
    }
}

enum Position {
    /// No movement yet; `next` behaves like `first`, `prev` like `last`.
    Unpositioned,
    /// Positioned on a live entry (full physical key + value).
    At(Bytes, Bytes),
    /// Ran off either end; only `first`/`last`/`seek` reposition.
    Exhausted,
}

/// An ordered iterator over one bucket's keys.
pub struct Cursor<'tx, 'db> {
    tx: &'tx Transaction<'db>,
    start: Bytes,
    limit: Option<Bytes>,
    handle: Arc<CursorHandle>,
    snapshot: Immutable,
    pending: Immutable,
    position: Position,
}

impl<'tx, 'db> Cursor<'tx, 'db> {
    pub(crate) fn new(tx: &'tx Transaction<'db>, start: Bytes, limit: Option<Bytes>) -> Result<Self> {
        let snapshot = tx.snapshot_map()?;
        let pending = tx.freeze_pending_keys();
        let handle = Arc::new(CursorHandle::new());
        tx.register_cursor(&handle);
        Ok(Self {
            tx,
            start,
            limit,
            handle,
            snapshot,
            pending,
            position: Position::Unpositioned,
        })
    }

    fn refresh_if_notified(&mut self) {
        if self.handle.take_reseek() {
            self.pending = self.tx.freeze_pending_keys();
        }
    }

    fn limit(&self) -> Option<&[u8]> {
        self.limit.as_deref()
    }

    /// Advances a snapshot-side candidate past entries hidden by pending
    /// removals.
    fn skip_hidden_forward(&self, mut entry: Option<(Bytes, Bytes)>) -> Option<(Bytes, Bytes)> {
        while let Some((key, _)) = &entry {
            if !self.tx.is_pending_removed(key) {
                return entry;
            }
            entry = self
                .snapshot
                .successor_in_range(key, &self.start, self.limit());
        }
        None
    }

    fn skip_hidden_backward(&self, mut entry: Option<(Bytes, Bytes)>) -> Option<(Bytes, Bytes)> {
        while let Some((key, _)) = &entry {
            if !self.tx.is_pending_removed(key) {
                return entry;
            }
            entry = self
                .snapshot
                .predecessor_in_range(key, &self.start, self.limit());
        }
        None
    }

    /// Pending entries shadow snapshot entries at the same key.
    fn min_of(
        snap: Option<(Bytes, Bytes)>,
        pend: Option<(Bytes, Bytes)>,
    ) -> Option<(Bytes, Bytes)> {
        match (snap, pend) {
            (None, other) | (other, None) => other,
            (Some(snap), Some(pend)) => {
                if pend.0 <= snap.0 {
                    Some(pend)
                } else {
                    Some(snap)
                }
            }
        }
    }

    fn max_of(
        snap: Option<(Bytes, Bytes)>,
        pend: Option<(Bytes, Bytes)>,
    ) -> Option<(Bytes, Bytes)> {
        match (snap, pend) {
            (None, other) | (other, None) => other,
            (Some(snap), Some(pend)) => {
                if pend.0 >= snap.0 {
                    Some(pend)
                } else {
                    Some(snap)
                }
            }
        }
    }

    fn settle(&mut self, entry: Option<(Bytes, Bytes)>) -> bool {
        match entry {
            Some((key, value)) => {
                self.position = Position::At(key, value);
                true
            }
            None => {
                self.position = Position::Exhausted;
                false
            }
        }
    }

    /// Positions on the first key in the bucket.
    pub fn first(&mut self) -> bool {
        self.refresh_if_notified();
        let snap =
            self.skip_hidden_forward(self.snapshot.first_in_range(&self.start, self.limit()));
        let pend = self.pending.first_in_range(&self.start, self.limit());
        let merged = Self::min_of(snap, pend);
        self.settle(merged)
    }

    /// Positions on the last key in the bucket.
    pub fn last(&mut self) -> bool {
        self.refresh_if_notified();
        let snap =
            self.skip_hidden_backward(self.snapshot.last_in_range(&self.start, self.limit()));
        let pend = self.pending.last_in_range(&self.start, self.limit());
        let merged = Self::max_of(snap, pend);
        self.settle(merged)
    }

    /// Moves to the next key in sorted order. On an unpositioned cursor
    /// this is `first`; an exhausted cursor stays exhausted.
    pub fn next(&mut self) -> bool {
        self.refresh_if_notified();
        let key = match &self.position {
            Position::Unpositioned => return self.first(),
            Position::Exhausted => return false,
            Position::At(key, _) => key.clone(),
        };
        let snap = self.skip_hidden_forward(self.snapshot.successor_in_range(
            &key,
            &self.start,
            self.limit(),
        ));
        let pend = self
            .pending
            .successor_in_range(&key, &self.start, self.limit());
        let merged = Self::min_of(snap, pend);
        self.settle(merged)
    }

    /// Moves to the previous key in sorted order. On an unpositioned
    /// cursor this is `last`; an exhausted cursor stays exhausted.
    pub fn prev(&mut self) -> bool {
        self.refresh_if_notified();
        let key = match &self.position {
            Position::Unpositioned => return self.last(),
            Position::Exhausted => return false,
            Position::At(key, _) => key.clone(),
        };
        let snap = self.skip_hidden_backward(self.snapshot.predecessor_in_range(
            &key,
            &self.start,
            self.limit(),
        ));
        let pend = self
            .pending
            .predecessor_in_range(&key, &self.start, self.limit());
        let merged = Self::max_of(snap, pend);
        self.settle(merged)
    }

    /// Positions on the smallest key `>=` the given user key.
    pub fn seek(&mut self, key: &[u8]) -> bool {
        self.refresh_if_notified();
        let mut probe = BytesMut::with_capacity(self.start.len() + key.len());
        probe.put_slice(&self.start);
        probe.put_slice(key);
        let probe = probe.freeze();

        let snap = self.skip_hidden_forward(self.snapshot.ceiling_in_range(
            &probe,
            &self.start,
            self.limit(),
        ));
        let pend = self
            .pending
            .ceiling_in_range(&probe, &self.start, self.limit());
        let merged = Self::min_of(snap, pend);
        self.settle(merged)
    }

    /// The current key relative to the bucket, or `None` when the cursor
    /// is not positioned.
    pub fn key(&self) -> Option<Bytes> {
        match &self.position {
            Position::At(key, _) => Some(key.slice(self.start.len()..)),
            _ => None,
        }
    }

    /// The current value, or `None` when the cursor is not positioned.
    pub fn value(&self) -> Option<Bytes> {
        match &self.position {
            Position::At(_, value) => Some(value.clone()),
            _ => None,
        }
    }

    /// Stages removal of the current key through the transaction's pending
    /// overlay. The cursor keeps its logical position; the next movement
    /// lands on the deleted key's neighbor.
    pub fn delete(&mut self) -> Result<()> {
        self.tx.check_closed()?;
        self.tx.check_writable("cursor delete")?;
        let Position::At(key, _) = &self.position else {
            return Err(Error::new(
                ErrorKind::DriverSpecific,
                "cursor is not positioned on a key",
            ));
        };
        let key = key.clone();
        self.tx.delete_key(&key, true);
        Ok(())
    }
}

impl Drop for Cursor<'_, '_> {
    fn drop(&mut self) {
        self.tx.deregister_cursor(&self.handle);
    }
}
