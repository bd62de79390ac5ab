//! # Flat-File Block Store
//!
//! Append-only writer and random-access reader for block payloads across
//! numbered files (`000000000.blk`, `000000001.blk`, ...). Files are filled
//! to at most `max_file_size` bytes; the last file is the only one allowed
//! to be smaller.
//!
//! ## Entry Envelope
//!
//! ```text
//! +----------+-------------+------------------+----------+
//! | network  | payload len | payload          | CRC-32   |
//! | (4, LE)  | (4, LE)     | (len bytes)      | (4, LE)  |
//! +----------+-------------+------------------+----------+
//! ```
//!
//! The checksum is CRC-32/iSCSI over the payload. Full reads verify magic,
//! length, and checksum; region reads skip the checksum on purpose — they
//! are the performance path and their bounds are validated by the caller
//! against the indexed payload length.
//!
//! ## Write Protocol
//!
//! A single write cursor `(file_num, offset)` advances through the current
//! file; when an entry would overflow `max_file_size` the current file is
//! synced and the cursor rotates to a fresh file. Only the sole write
//! transaction ever advances the cursor, so readers take the cursor lock
//! only to observe it.
//!
//! ## Rollback
//!
//! [`BlockStore::handle_rollback`] truncates the append log back to an
//! anchor captured before a commit's first append: files newer than the
//! anchor are unlinked, the anchor file is truncated to the anchor offset,
//! and the cursor is reset. Failures along the way are logged and repair
//! continues; the caller is already propagating the error that triggered
//! the rollback.
//!
//! ## Read Path
//!
//! Reads go through per-file memory maps held in a small cache bounded by
//! `max_open_files`, evicting the least recently used mapping. Mappings
//! are invalidated whenever their file is appended to, truncated, or
//! deleted, since a stale map would expose the old file length.

use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use crc::{Crc, CRC_32_ISCSI};
use eyre::{ensure, Result as SetupResult, WrapErr};
use hashbrown::HashMap;
use memmap2::Mmap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, trace, warn};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::config::constants::{
    BLOCK_ENTRY_HEADER_SIZE, BLOCK_ENTRY_OVERHEAD, BLOCK_FILE_EXTENSION, BLOCK_FILE_NUM_DIGITS,
    MIN_MAX_OPEN_FILES,
};
use crate::error::{Error, Result};
use crate::types::BlockHash;

const PAYLOAD_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Where a block payload lives in the flat store.
///
/// `offset` addresses the start of the entry envelope; `block_len` is the
/// payload length (excluding the envelope). The serialized 12-byte row is
/// the value stored in the block index.
#[repr(C)]
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout,
)]
pub struct BlockLocation {
    pub file_num: u32,
    pub offset: u32,
    pub block_len: u32,
}

/// Serialized size of a [`BlockLocation`] row.
pub const BLOCK_LOCATION_SIZE: usize = std::mem::size_of::<BlockLocation>();

/// Serializes a location into the row format stored in the block index.
pub fn serialize_location(location: &BlockLocation) -> Bytes {
    Bytes::copy_from_slice(location.as_bytes())
}

/// Parses a block-index row back into a location.
pub fn deserialize_location(row: &[u8]) -> Result<BlockLocation> {
    BlockLocation::read_from_bytes(row).map_err(|_| {
        Error::corruption(format!(
            "malformed block location row: {} bytes, want {}",
            row.len(),
            BLOCK_LOCATION_SIZE
        ))
    })
}

/// The append position of the flat store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct WriteCursor {
    pub file_num: u32,
    pub offset: u32,
}

struct OpenWriter {
    file_num: u32,
    file: File,
}

struct CachedMap {
    mmap: Arc<Mmap>,
    last_used: u64,
}

struct ReadCache {
    files: HashMap<u32, CachedMap>,
    tick: u64,
    cap: usize,
}

impl ReadCache {
    fn touch(&mut self, file_num: u32) -> Option<Arc<Mmap>> {
        self.tick += 1;
        let tick = self.tick;
        let cached = self.files.get_mut(&file_num)?;
        cached.last_used = tick;
        Some(Arc::clone(&cached.mmap))
    }

    fn insert(&mut self, file_num: u32, mmap: Arc<Mmap>) {
        if self.files.len() >= self.cap {
            if let Some(oldest) = self
                .files
                .iter()
                .min_by_key(|(_, c)| c.last_used)
                .map(|(num, _)| *num)
            {
                self.files.remove(&oldest);
            }
        }
        self.tick += 1;
        let tick = self.tick;
        self.files.insert(
            file_num,
            CachedMap {
                mmap,
                last_used: tick,
            },
        );
    }
}

/// Append-only store of block payloads across numbered flat files.
pub struct BlockStore {
    base_path: PathBuf,
    network: u32,
    max_file_size: u32,
    write_cursor: RwLock<WriteCursor>,
    writer: Mutex<Option<OpenWriter>>,
    read_cache: Mutex<ReadCache>,
}

impl BlockStore {
    /// Opens the store rooted at `base_path`, creating the directory if
    /// needed and positioning the write cursor at the end of the newest
    /// file found on disk.
    pub fn open(
        base_path: PathBuf,
        network: u32,
        max_file_size: u32,
        max_open_files: usize,
    ) -> SetupResult<Self> {
        ensure!(
            max_file_size > BLOCK_ENTRY_OVERHEAD,
            "max block file size {} cannot hold a single entry envelope",
            max_file_size
        );
        ensure!(
            max_open_files >= MIN_MAX_OPEN_FILES,
            "max open files {} is below the minimum of {}",
            max_open_files,
            MIN_MAX_OPEN_FILES
        );
        fs::create_dir_all(&base_path).wrap_err_with(|| {
            format!(
                "failed to create block directory '{}'",
                base_path.display()
            )
        })?;

        let (_, last, last_size) = scan_block_files(&base_path)?;
        ensure!(
            last_size <= max_file_size as u64,
            "block file {} is {} bytes, larger than the configured maximum of {}",
            last,
            last_size,
            max_file_size
        );

        Ok(Self {
            base_path,
            network,
            max_file_size,
            write_cursor: RwLock::new(WriteCursor {
                file_num: last,
                offset: last_size as u32,
            }),
            writer: Mutex::new(None),
            read_cache: Mutex::new(ReadCache {
                files: HashMap::new(),
                tick: 0,
                cap: max_open_files,
            }),
        })
    }

    pub fn max_file_size(&self) -> u32 {
        self.max_file_size
    }

    /// The current append position.
    pub fn write_cursor(&self) -> WriteCursor {
        *self.write_cursor.read()
    }

    fn block_file_path(&self, file_num: u32) -> PathBuf {
        block_file_path(&self.base_path, file_num)
    }

    /// Scans the block directory, reporting the lowest and highest file
    /// numbers present and the size of the highest. All zero when the
    /// directory is empty.
    pub fn scan_files(&self) -> Result<(u32, u32, u64)> {
        scan_block_files(&self.base_path)
            .map_err(|e| Error::driver("failed to scan block files", e))
    }

    /// Appends a block payload at the write cursor, rotating to a new file
    /// when the entry would overflow the current one. Returns the location
    /// the payload can be read back from.
    pub fn write_block(&self, height: u32, bytes: &[u8]) -> Result<BlockLocation> {
        let payload_len: u32 = bytes
            .len()
            .try_into()
            .ok()
            .filter(|len| *len <= u32::MAX - BLOCK_ENTRY_OVERHEAD)
            .ok_or_else(|| {
                Error::new(
                    crate::error::ErrorKind::DriverSpecific,
                    format!("block payload of {} bytes is too large to store", bytes.len()),
                )
            })?;
        let entry_len = BLOCK_ENTRY_OVERHEAD + payload_len;
        if entry_len > self.max_file_size {
            return Err(Error::new(
                crate::error::ErrorKind::DriverSpecific,
                format!(
                    "block entry of {entry_len} bytes exceeds the maximum block file size of {}",
                    self.max_file_size
                ),
            ));
        }

        let mut cursor = self.write_cursor.write();
        let mut writer = self.writer.lock();

        if cursor.offset > 0 && cursor.offset as u64 + entry_len as u64 > self.max_file_size as u64
        {
            if let Some(old) = writer.take() {
                if let Err(e) = old.file.sync_all() {
                    return Err(Error::driver(
                        format!("failed to sync block file {} before rotation", old.file_num),
                        e,
                    ));
                }
            }
            cursor.file_num += 1;
            cursor.offset = 0;
        }

        if writer.as_ref().map(|w| w.file_num) != Some(cursor.file_num) {
            let path = self.block_file_path(cursor.file_num);
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .open(&path)
                .map_err(|e| {
                    Error::driver(
                        format!("failed to open block file '{}'", path.display()),
                        e,
                    )
                })?;
            file.seek(SeekFrom::Start(cursor.offset as u64))
                .map_err(|e| Error::driver("failed to seek block file to write cursor", e))?;
            *writer = Some(OpenWriter {
                file_num: cursor.file_num,
                file,
            });
        }

        let mut entry = Vec::with_capacity(entry_len as usize);
        entry.extend_from_slice(&self.network.to_le_bytes());
        entry.extend_from_slice(&payload_len.to_le_bytes());
        entry.extend_from_slice(bytes);
        entry.extend_from_slice(&PAYLOAD_CRC.checksum(bytes).to_le_bytes());

        let open_writer = writer.as_mut().expect("writer opened above");
        open_writer
            .file
            .write_all(&entry)
            .map_err(|e| {
                Error::driver(
                    format!("failed to append block to file {}", cursor.file_num),
                    e,
                )
            })?;

        let location = BlockLocation {
            file_num: cursor.file_num,
            offset: cursor.offset,
            block_len: payload_len,
        };
        cursor.offset += entry_len;

        // The file just grew; any cached mapping is short now.
        self.read_cache.lock().files.remove(&location.file_num);

        trace!(
            height,
            file_num = location.file_num,
            offset = location.offset,
            len = payload_len,
            "appended block payload"
        );
        Ok(location)
    }

    fn mapped_file(&self, file_num: u32) -> Result<Arc<Mmap>> {
        let mut cache = self.read_cache.lock();
        if let Some(mmap) = cache.touch(file_num) {
            return Ok(mmap);
        }

        let path = self.block_file_path(file_num);
        let file = File::open(&path).map_err(|e| {
            Error::driver(
                format!("failed to open block file '{}'", path.display()),
                e,
            )
        })?;
        // SAFETY: mapping a file that another process mutates is undefined
        // behavior. This is safe because:
        // 1. Block files are owned exclusively by this store.
        // 2. Committed entries are immutable; the only in-place mutation is
        //    truncation during rollback, which drops the cached map first.
        // 3. The map is re-created after any append to the same file.
        let mmap = unsafe { Mmap::map(&file) }.map_err(|e| {
            Error::driver(
                format!("failed to memory-map block file '{}'", path.display()),
                e,
            )
        })?;
        let mmap = Arc::new(mmap);
        cache.insert(file_num, Arc::clone(&mmap));
        Ok(mmap)
    }

    /// Reads a full block payload and verifies the envelope: magic, stored
    /// length against the index row, and checksum.
    pub fn read_block(&self, hash: &BlockHash, location: BlockLocation) -> Result<Bytes> {
        let mmap = self.mapped_file(location.file_num)?;
        let start = location.offset as usize;
        let entry_len = BLOCK_ENTRY_OVERHEAD as usize + location.block_len as usize;
        let end = start
            .checked_add(entry_len)
            .filter(|end| *end <= mmap.len())
            .ok_or_else(|| {
                Error::corruption(format!(
                    "block {hash} entry at {}:{} runs past the end of the file ({} bytes)",
                    location.file_num,
                    location.offset,
                    mmap.len()
                ))
            })?;
        let entry = &mmap[start..end];

        let magic = u32::from_le_bytes(entry[0..4].try_into().expect("slice is 4 bytes"));
        if magic != self.network {
            return Err(Error::corruption(format!(
                "block {hash} has network mismatch: got {magic:#010x}, want {:#010x}",
                self.network
            )));
        }
        let stored_len = u32::from_le_bytes(entry[4..8].try_into().expect("slice is 4 bytes"));
        if stored_len != location.block_len {
            return Err(Error::corruption(format!(
                "block {hash} length mismatch: entry says {stored_len}, index says {}",
                location.block_len
            )));
        }

        let payload_end = BLOCK_ENTRY_HEADER_SIZE as usize + location.block_len as usize;
        let payload = &entry[BLOCK_ENTRY_HEADER_SIZE as usize..payload_end];
        let stored_checksum =
            u32::from_le_bytes(entry[payload_end..].try_into().expect("slice is 4 bytes"));
        let computed = PAYLOAD_CRC.checksum(payload);
        if computed != stored_checksum {
            return Err(Error::corruption(format!(
                "block {hash} checksum mismatch: computed {computed:#010x}, stored {stored_checksum:#010x}"
            )));
        }

        Ok(Bytes::copy_from_slice(payload))
    }

    /// Reads a slice of a block payload without checksumming. The caller
    /// has already validated `offset + len` against the indexed payload
    /// length; reads past the physical file still fail.
    pub fn read_block_region(
        &self,
        location: BlockLocation,
        offset: u32,
        len: u32,
    ) -> Result<Bytes> {
        let mmap = self.mapped_file(location.file_num)?;
        let start =
            location.offset as usize + BLOCK_ENTRY_HEADER_SIZE as usize + offset as usize;
        let end = start.checked_add(len as usize).filter(|end| *end <= mmap.len());
        let Some(end) = end else {
            return Err(Error::corruption(format!(
                "region read at {}:{} (+{} for {} bytes) runs past the end of the file",
                location.file_num, location.offset, offset, len
            )));
        };
        Ok(Bytes::copy_from_slice(&mmap[start..end]))
    }

    /// Unlinks one block file. Used by pruning; the write cursor is never
    /// inside a deleted file because the newest file is never pruned.
    pub fn delete_file(&self, file_num: u32) -> Result<()> {
        self.read_cache.lock().files.remove(&file_num);
        let path = self.block_file_path(file_num);
        fs::remove_file(&path).map_err(|e| {
            Error::driver(
                format!("failed to delete block file '{}'", path.display()),
                e,
            )
        })?;
        debug!(file_num, "deleted block file");
        Ok(())
    }

    /// Truncates the append log back to `(file_num, offset)`: unlinks
    /// files newer than the anchor, truncates the anchor file, and resets
    /// the write cursor. Failures are logged and repair continues; by the
    /// time this runs the caller is already propagating the commit error.
    pub fn handle_rollback(&self, file_num: u32, offset: u32) {
        let mut cursor = self.write_cursor.write();
        let mut writer = self.writer.lock();
        if cursor.file_num == file_num && cursor.offset == offset {
            return;
        }
        warn!(
            from_file = cursor.file_num,
            from_offset = cursor.offset,
            to_file = file_num,
            to_offset = offset,
            "rolling back block file writes"
        );

        *writer = None;
        self.read_cache
            .lock()
            .files
            .retain(|num, _| *num < file_num);

        for num in (file_num + 1)..=cursor.file_num {
            let path = self.block_file_path(num);
            if let Err(e) = fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    error!(file_num = num, %e, "failed to unlink block file during rollback");
                }
            }
        }

        let anchor_path = self.block_file_path(file_num);
        if anchor_path.exists() {
            match OpenOptions::new().write(true).open(&anchor_path) {
                Ok(file) => {
                    if let Err(e) = file.set_len(offset as u64) {
                        error!(file_num, offset, %e, "failed to truncate block file during rollback");
                    } else if let Err(e) = file.sync_all() {
                        error!(file_num, %e, "failed to sync truncated block file");
                    }
                }
                Err(e) => {
                    error!(file_num, %e, "failed to open block file for truncation");
                }
            }
        }

        cursor.file_num = file_num;
        cursor.offset = offset;
    }

    /// Flushes the current append file to disk.
    pub fn sync(&self) -> Result<()> {
        let writer = self.writer.lock();
        if let Some(w) = writer.as_ref() {
            w.file
                .sync_all()
                .map_err(|e| Error::driver(format!("failed to sync block file {}", w.file_num), e))?;
        }
        Ok(())
    }
}

fn block_file_path(base: &Path, file_num: u32) -> PathBuf {
    base.join(format!(
        "{file_num:0width$}.{BLOCK_FILE_EXTENSION}",
        width = BLOCK_FILE_NUM_DIGITS
    ))
}

/// Scans `dir` for block files, returning `(first, last, last_file_size)`.
/// All zero when no block files exist.
pub fn scan_block_files(dir: &Path) -> SetupResult<(u32, u32, u64)> {
    if !dir.exists() {
        return Ok((0, 0, 0));
    }

    let mut first: Option<u32> = None;
    let mut last: Option<u32> = None;
    let entries = fs::read_dir(dir)
        .wrap_err_with(|| format!("failed to read block directory '{}'", dir.display()))?;
    for entry in entries {
        let entry = entry.wrap_err("failed to read block directory entry")?;
        let name = entry.file_name();
        let Some(num) = parse_block_file_name(&name.to_string_lossy()) else {
            continue;
        };
        first = Some(first.map_or(num, |f| f.min(num)));
        last = Some(last.map_or(num, |l| l.max(num)));
    }

    let (Some(first), Some(last)) = (first, last) else {
        return Ok((0, 0, 0));
    };
    let last_path = block_file_path(dir, last);
    let last_size = fs::metadata(&last_path)
        .wrap_err_with(|| format!("failed to stat block file '{}'", last_path.display()))?
        .len();
    Ok((first, last, last_size))
}

fn parse_block_file_name(name: &str) -> Option<u32> {
    let stem = name.strip_suffix(&format!(".{BLOCK_FILE_EXTENSION}"))?;
    if stem.len() != BLOCK_FILE_NUM_DIGITS || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use tempfile::tempdir;

    fn open_store(dir: &Path, max_file_size: u32) -> BlockStore {
        BlockStore::open(dir.to_path_buf(), 0xaa55_aa55, max_file_size, 8).unwrap()
    }

    fn hash(tag: u8) -> BlockHash {
        BlockHash([tag; 32])
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path(), 1024 * 1024);

        let payload = b"serialized block bytes".as_slice();
        let location = store.write_block(1, payload).unwrap();
        assert_eq!(location.file_num, 0);
        assert_eq!(location.offset, 0);
        assert_eq!(location.block_len, payload.len() as u32);

        let read = store.read_block(&hash(1), location).unwrap();
        assert_eq!(read.as_ref(), payload);

        let cursor = store.write_cursor();
        assert_eq!(cursor.offset, BLOCK_ENTRY_OVERHEAD + payload.len() as u32);
    }

    #[test]
    fn region_read_returns_slice() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path(), 1024 * 1024);

        let payload: Vec<u8> = (0u8..100).collect();
        let location = store.write_block(1, &payload).unwrap();

        let region = store.read_block_region(location, 10, 20).unwrap();
        assert_eq!(region.as_ref(), &payload[10..30]);
    }

    #[test]
    fn checksum_failure_is_corruption() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path(), 1024 * 1024);

        let location = store.write_block(1, b"payload under test").unwrap();
        store.sync().unwrap();

        // Flip one payload byte on disk.
        let path = block_file_path(dir.path(), 0);
        let mut contents = fs::read(&path).unwrap();
        let idx = BLOCK_ENTRY_HEADER_SIZE as usize + 3;
        contents[idx] ^= 0xff;
        fs::write(&path, &contents).unwrap();

        let err = store.read_block(&hash(1), location).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Corruption);
    }

    #[test]
    fn writes_rotate_into_new_files() {
        let dir = tempdir().unwrap();
        // Fits exactly one 20-byte payload plus envelope per file.
        let store = open_store(dir.path(), 32 + BLOCK_ENTRY_OVERHEAD);

        let first = store.write_block(1, &[1u8; 20]).unwrap();
        let second = store.write_block(2, &[2u8; 20]).unwrap();
        assert_eq!(first.file_num, 0);
        assert_eq!(second.file_num, 1);
        assert_eq!(second.offset, 0);

        let (first_num, last_num, last_size) = store.scan_files().unwrap();
        assert_eq!((first_num, last_num), (0, 1));
        assert_eq!(last_size, 20 + BLOCK_ENTRY_OVERHEAD as u64);
    }

    #[test]
    fn reopen_resumes_at_end_of_last_file() {
        let dir = tempdir().unwrap();
        let payload = [7u8; 40];
        let location;
        {
            let store = open_store(dir.path(), 1024);
            location = store.write_block(1, &payload).unwrap();
            store.sync().unwrap();
        }

        let store = open_store(dir.path(), 1024);
        let cursor = store.write_cursor();
        assert_eq!(cursor.file_num, 0);
        assert_eq!(cursor.offset, 40 + BLOCK_ENTRY_OVERHEAD);
        assert_eq!(
            store.read_block(&hash(1), location).unwrap().as_ref(),
            &payload
        );
    }

    #[test]
    fn rollback_truncates_and_unlinks() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path(), 100);

        let keep = store.write_block(1, &[1u8; 30]).unwrap();
        let anchor = store.write_cursor();
        store.write_block(2, &[2u8; 20]).unwrap();
        store.write_block(3, &[3u8; 60]).unwrap(); // rotates into file 1
        assert_eq!(store.write_cursor().file_num, 1);

        store.handle_rollback(anchor.file_num, anchor.offset);

        assert_eq!(store.write_cursor(), anchor);
        assert!(!block_file_path(dir.path(), 1).exists());
        let len = fs::metadata(block_file_path(dir.path(), 0)).unwrap().len();
        assert_eq!(len, anchor.offset as u64);
        // The surviving block is still readable.
        assert_eq!(
            store.read_block(&hash(1), keep).unwrap().as_ref(),
            &[1u8; 30]
        );
    }

    #[test]
    fn delete_file_removes_from_disk() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path(), 40 + BLOCK_ENTRY_OVERHEAD);
        store.write_block(1, &[1u8; 40]).unwrap();
        store.write_block(2, &[2u8; 40]).unwrap();

        store.delete_file(0).unwrap();
        assert!(!block_file_path(dir.path(), 0).exists());
        let (first, last, _) = store.scan_files().unwrap();
        assert_eq!((first, last), (1, 1));
    }

    #[test]
    fn scan_of_empty_directory_is_all_zero() {
        let dir = tempdir().unwrap();
        assert_eq!(scan_block_files(dir.path()).unwrap(), (0, 0, 0));
    }

    #[test]
    fn location_row_round_trips() {
        let location = BlockLocation {
            file_num: 3,
            offset: 4096,
            block_len: 777,
        };
        let row = serialize_location(&location);
        assert_eq!(row.len(), BLOCK_LOCATION_SIZE);
        assert_eq!(deserialize_location(&row).unwrap(), location);
        assert!(deserialize_location(&row[..8]).is_err());
    }
}
