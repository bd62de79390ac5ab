//! # Database Handle
//!
//! [`Database`] owns the two substrates and hands out transactions. It
//! enforces the concurrency contract:
//!
//! - at most one write transaction at a time, via the writer lock;
//! - any number of read transactions alongside it, each on the snapshot
//!   taken at `begin`;
//! - [`Database::close`] blocks until every outstanding transaction
//!   finishes, via a close barrier every transaction holds shared.
//!
//! ## Open-Time Reconciliation
//!
//! Block appends and the metadata flush are not covered by one atomic
//! commit across both substrates; a crash between them can leave block
//! bytes on disk that metadata never acknowledged. Open compares the
//! persisted write-cursor row against the files actually present:
//!
//! - files ahead of metadata: the unacknowledged tail is truncated away
//!   (the crashed commit never happened);
//! - metadata ahead of files: block data the index references is missing,
//!   which is unrecoverable corruption and fails the open.
//!
//! ## Managed Transactions
//!
//! [`Database::view`] and [`Database::update`] wrap a transaction around a
//! closure and own its outcome: rollback for `view`, commit for `update`,
//! rollback if the closure errors. User code inside the closure must not
//! call commit or rollback itself; doing so closes the transaction and
//! panics, since letting it slide would double-settle the transaction.

pub mod bucket;
pub mod cache;
pub mod cursor;
pub mod transaction;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use eyre::{ensure, Result as SetupResult, WrapErr};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::constants::{
    BLOCKS_DIR_NAME, DEFAULT_MAX_FILE_SIZE, DEFAULT_MAX_OPEN_FILES, DEFAULT_NETWORK_MAGIC,
    META_DIR_NAME, METADATA_BUCKET_ID, WRITE_LOC_KEY,
};
use crate::error::{Error, ErrorKind, Result};
use crate::storage::block_files::{BlockStore, WriteCursor};

use bucket::bucketized_key;
use cache::MetaCache;
use transaction::{deserialize_write_loc, Transaction};

/// Configuration for opening a [`Database`].
///
/// ```ignore
/// let db = Options::new("./chainstate")
///     .network(0xd9b4bef9)
///     .max_file_size(512 * 1024 * 1024)
///     .open()?;
/// ```
#[derive(Debug, Clone)]
pub struct Options {
    path: PathBuf,
    network: u32,
    max_file_size: u32,
    max_open_files: usize,
}

impl Options {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            network: DEFAULT_NETWORK_MAGIC,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            max_open_files: DEFAULT_MAX_OPEN_FILES,
        }
    }

    /// Network magic stamped into every block file entry.
    pub fn network(mut self, network: u32) -> Self {
        self.network = network;
        self
    }

    /// Maximum size of a single block file. Smaller values make pruning
    /// finer-grained at the cost of more files.
    pub fn max_file_size(mut self, max_file_size: u32) -> Self {
        self.max_file_size = max_file_size;
        self
    }

    /// Cap on concurrently mapped block files on the read path.
    pub fn max_open_files(mut self, max_open_files: usize) -> Self {
        self.max_open_files = max_open_files;
        self
    }

    /// Opens (or creates) the database at the configured path.
    pub fn open(self) -> SetupResult<Database> {
        Database::open_with_options(self)
    }
}

/// Handle to an open block-and-metadata store.
pub struct Database {
    store: BlockStore,
    cache: MetaCache,
    write_lock: Mutex<()>,
    close_lock: RwLock<()>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

impl Database {
    /// Opens (or creates) a database at `path` with default options.
    pub fn open(path: impl AsRef<Path>) -> SetupResult<Database> {
        Options::new(path.as_ref()).open()
    }

    fn open_with_options(options: Options) -> SetupResult<Database> {
        std::fs::create_dir_all(&options.path).wrap_err_with(|| {
            format!(
                "failed to create database directory '{}'",
                options.path.display()
            )
        })?;

        let cache = MetaCache::open(&options.path.join(META_DIR_NAME))?;
        let store = BlockStore::open(
            options.path.join(BLOCKS_DIR_NAME),
            options.network,
            options.max_file_size,
            options.max_open_files,
        )?;

        let db = Database {
            store,
            cache,
            write_lock: Mutex::new(()),
            close_lock: RwLock::new(()),
            closed: AtomicBool::new(false),
        };
        db.reconcile_write_cursor()?;
        info!(path = %options.path.display(), "database opened");
        Ok(db)
    }

    /// Compares the persisted write-cursor row with the files on disk and
    /// repairs the crash window between block append and metadata flush.
    fn reconcile_write_cursor(&self) -> SetupResult<()> {
        let snapshot = self.cache.snapshot();
        let row = snapshot.get(&bucketized_key(METADATA_BUCKET_ID, WRITE_LOC_KEY));
        let persisted = match row {
            None => WriteCursor {
                file_num: 0,
                offset: 0,
            },
            Some(row) => deserialize_write_loc(&row)
                .map_err(|e| eyre::eyre!("invalid write cursor metadata: {e}"))?,
        };
        let on_disk = self.store.write_cursor();

        ensure!(
            persisted <= on_disk,
            "metadata claims block data at {}:{} but the files end at {}:{}; \
             required block data is missing",
            persisted.file_num,
            persisted.offset,
            on_disk.file_num,
            on_disk.offset
        );
        if on_disk > persisted {
            warn!(
                from_file = on_disk.file_num,
                from_offset = on_disk.offset,
                to_file = persisted.file_num,
                to_offset = persisted.offset,
                "block files extend past committed metadata; truncating unacknowledged tail"
            );
            self.store
                .handle_rollback(persisted.file_num, persisted.offset);
        }
        Ok(())
    }

    pub(crate) fn store(&self) -> &BlockStore {
        &self.store
    }

    pub(crate) fn cache(&self) -> &MetaCache {
        &self.cache
    }

    /// Begins a transaction. A writable transaction blocks until it is the
    /// only writer; read transactions run concurrently with each other and
    /// with one writer, each on the snapshot taken here.
    pub fn begin(&self, writable: bool) -> Result<Transaction<'_>> {
        // Writer lock first, close barrier second: a closing database
        // wakes pending writers without handing them a transaction.
        let write_hold = if writable {
            Some(self.write_lock.lock())
        } else {
            None
        };
        let close_hold = self.close_lock.read();
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::new(
                ErrorKind::DriverSpecific,
                "database is not open",
            ));
        }

        let snapshot = self.cache.snapshot();
        Ok(Transaction::new(
            self,
            writable,
            snapshot,
            close_hold,
            write_hold,
        ))
    }

    /// Runs `f` inside a managed read-only transaction, rolling back when
    /// it returns.
    pub fn view<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&Transaction<'_>) -> Result<()>,
    {
        let tx = self.begin(false)?;
        tx.set_managed(true);
        let result = f(&tx);
        tx.set_managed(false);
        match result {
            Ok(()) => tx.rollback(),
            Err(e) => {
                let _ = tx.rollback();
                Err(e)
            }
        }
    }

    /// Runs `f` inside a managed write transaction: commit when it returns
    /// `Ok`, rollback when it returns an error.
    pub fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&Transaction<'_>) -> Result<()>,
    {
        let tx = self.begin(true)?;
        tx.set_managed(true);
        let result = f(&tx);
        tx.set_managed(false);
        match result {
            Ok(()) => tx.commit(),
            Err(e) => {
                let _ = tx.rollback();
                Err(e)
            }
        }
    }

    /// Closes the database: blocks until every outstanding transaction
    /// finishes, then flushes and compacts the metadata log. Idempotent.
    pub fn close(&self) -> SetupResult<()> {
        let _barrier = self.close_lock.write();
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        debug!("closing database");
        self.store.sync().map_err(|e| eyre::eyre!(e))?;
        self.cache.close()?;
        Ok(())
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            if let Err(e) = self.close() {
                warn!(%e, "failed to close database cleanly on drop");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_creates_layout() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db");
        let db = Database::open(&path).unwrap();
        drop(db);

        assert!(path.join(META_DIR_NAME).is_dir());
        assert!(path.join(BLOCKS_DIR_NAME).is_dir());
    }

    #[test]
    fn begin_after_close_fails() {
        let dir = tempdir().unwrap();
        let db = Database::open(dir.path()).unwrap();
        db.close().unwrap();

        let err = db.begin(false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DriverSpecific);
    }

    #[test]
    fn close_is_idempotent() {
        let dir = tempdir().unwrap();
        let db = Database::open(dir.path()).unwrap();
        db.close().unwrap();
        db.close().unwrap();
    }
}
