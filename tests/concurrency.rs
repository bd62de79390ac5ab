//! Concurrency contracts: snapshot isolation between writers and readers,
//! stability of reader views across commits, and single-writer
//! serialization.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Barrier;
use std::time::Duration;

use bytes::Bytes;
use chaindb::{Block, BlockHash, Database};
use tempfile::tempdir;

fn hash(tag: u8) -> BlockHash {
    BlockHash([tag; 32])
}

fn block(tag: u8) -> Block {
    Block::new(hash(tag), tag as u32, Bytes::from(vec![tag; 100]))
}

#[test]
fn readers_never_see_uncommitted_state() {
    let dir = tempdir().unwrap();
    let db = Database::open(dir.path()).unwrap();

    db.update(|tx| {
        let bucket = tx.metadata().create_bucket(b"state")?;
        bucket.put(b"k", b"before")
    })
    .unwrap();

    let writer = db.begin(true).unwrap();
    writer.store_block(&block(1)).unwrap();
    writer
        .metadata()
        .bucket(b"state")
        .unwrap()
        .unwrap()
        .put(b"k", b"after")
        .unwrap();

    // A reader that starts while the writer holds pending data sees none
    // of it.
    let reader_before = db.begin(false).unwrap();
    assert!(!reader_before.has_block(&hash(1)).unwrap());
    assert_eq!(
        reader_before
            .metadata()
            .bucket(b"state")
            .unwrap()
            .unwrap()
            .get(b"k")
            .unwrap(),
        Some(Bytes::from_static(b"before"))
    );

    writer.commit().unwrap();

    // The pre-commit reader's view is unchanged; a fresh reader sees the
    // commit.
    assert!(!reader_before.has_block(&hash(1)).unwrap());
    assert_eq!(
        reader_before
            .metadata()
            .bucket(b"state")
            .unwrap()
            .unwrap()
            .get(b"k")
            .unwrap(),
        Some(Bytes::from_static(b"before"))
    );

    let reader_after = db.begin(false).unwrap();
    assert!(reader_after.has_block(&hash(1)).unwrap());
    assert_eq!(
        reader_after
            .metadata()
            .bucket(b"state")
            .unwrap()
            .unwrap()
            .get(b"k")
            .unwrap(),
        Some(Bytes::from_static(b"after"))
    );

    reader_before.rollback().unwrap();
    reader_after.rollback().unwrap();
}

#[test]
fn concurrent_readers_share_the_database() {
    let dir = tempdir().unwrap();
    let db = Database::open(dir.path()).unwrap();

    db.update(|tx| {
        for tag in 0..4 {
            tx.store_block(&block(tag))?;
        }
        Ok(())
    })
    .unwrap();

    std::thread::scope(|scope| {
        for tag in 0..4u8 {
            let db = &db;
            scope.spawn(move || {
                for _ in 0..50 {
                    db.view(|tx| {
                        let bytes = tx.fetch_block(&hash(tag))?;
                        assert_eq!(bytes, *block(tag).bytes());
                        Ok(())
                    })
                    .unwrap();
                }
            });
        }
    });
}

#[test]
fn write_transactions_serialize() {
    let dir = tempdir().unwrap();
    let db = Database::open(dir.path()).unwrap();
    let in_write = AtomicU32::new(0);
    let start = Barrier::new(4);

    std::thread::scope(|scope| {
        for tag in 0..4u8 {
            let db = &db;
            let in_write = &in_write;
            let start = &start;
            scope.spawn(move || {
                start.wait();
                db.update(|tx| {
                    // Only one writer may ever be inside an update.
                    assert_eq!(in_write.fetch_add(1, Ordering::SeqCst), 0);
                    tx.store_block(&block(tag))?;
                    std::thread::sleep(Duration::from_millis(20));
                    assert_eq!(in_write.fetch_sub(1, Ordering::SeqCst), 1);
                    Ok(())
                })
                .unwrap();
            });
        }
    });

    db.view(|tx| {
        let present = tx.has_blocks(&[hash(0), hash(1), hash(2), hash(3)])?;
        assert_eq!(present, vec![true; 4]);
        Ok(())
    })
    .unwrap();
}

#[test]
fn readers_run_alongside_a_writer() {
    let dir = tempdir().unwrap();
    let db = Database::open(dir.path()).unwrap();
    db.update(|tx| tx.store_block(&block(0))).unwrap();

    let rendezvous = Barrier::new(2);

    std::thread::scope(|scope| {
        let db_ref = &db;
        let rendezvous = &rendezvous;

        scope.spawn(move || {
            db_ref
                .update(|tx| {
                    tx.store_block(&block(1))?;
                    // Hold the write open while the reader works.
                    rendezvous.wait();
                    rendezvous.wait();
                    Ok(())
                })
                .unwrap();
        });

        rendezvous.wait(); // writer now holds pending data
        db.view(|tx| {
            assert!(tx.has_block(&hash(0)).unwrap());
            assert!(!tx.has_block(&hash(1)).unwrap());
            Ok(())
        })
        .unwrap();
        rendezvous.wait(); // release the writer
    });

    db.view(|tx| {
        assert!(tx.has_block(&hash(1)).unwrap());
        Ok(())
    })
    .unwrap();
}

#[test]
fn close_blocks_until_transactions_finish() {
    let dir = tempdir().unwrap();
    let db = Database::open(dir.path()).unwrap();
    db.update(|tx| tx.store_block(&block(0))).unwrap();

    let entered = Barrier::new(2);

    std::thread::scope(|scope| {
        let db_ref = &db;
        let entered = &entered;

        scope.spawn(move || {
            db_ref
                .view(|tx| {
                    entered.wait();
                    std::thread::sleep(Duration::from_millis(50));
                    assert!(tx.has_block(&hash(0)).unwrap());
                    Ok(())
                })
                .unwrap();
        });

        entered.wait();
        // Blocks until the reader above finishes, then closes cleanly.
        db.close().unwrap();
    });

    assert!(db.begin(false).is_err());
}
