//! Metadata bucket semantics: overlay precedence, nested buckets, cursor
//! iteration with pending overlays, iterator invalidation, and persistence
//! across reopen.

use bytes::Bytes;
use chaindb::{Database, ErrorKind};
use tempfile::tempdir;

#[test]
fn put_then_delete_leaves_no_trace() {
    let dir = tempdir().unwrap();
    let db = Database::open(dir.path()).unwrap();

    db.update(|tx| {
        let bucket = tx.metadata().create_bucket(b"state")?;
        bucket.put(b"k", b"v")?;
        bucket.delete(b"k")?;
        assert_eq!(bucket.get(b"k")?, None);
        Ok(())
    })
    .unwrap();

    db.view(|tx| {
        let bucket = tx.metadata().bucket(b"state")?.expect("bucket committed");
        assert_eq!(bucket.get(b"k")?, None);
        Ok(())
    })
    .unwrap();
}

#[test]
fn delete_then_put_restores_value() {
    let dir = tempdir().unwrap();
    let db = Database::open(dir.path()).unwrap();

    db.update(|tx| {
        let bucket = tx.metadata().create_bucket(b"state")?;
        bucket.put(b"k", b"old")?;
        Ok(())
    })
    .unwrap();

    db.update(|tx| {
        let bucket = tx.metadata().bucket(b"state")?.expect("bucket exists");
        bucket.delete(b"k")?;
        bucket.put(b"k", b"new")?;
        assert_eq!(bucket.get(b"k")?, Some(Bytes::from_static(b"new")));
        Ok(())
    })
    .unwrap();

    db.view(|tx| {
        let bucket = tx.metadata().bucket(b"state")?.expect("bucket exists");
        assert_eq!(bucket.get(b"k")?, Some(Bytes::from_static(b"new")));
        Ok(())
    })
    .unwrap();
}

#[test]
fn pending_write_shadows_committed_value() {
    let dir = tempdir().unwrap();
    let db = Database::open(dir.path()).unwrap();

    db.update(|tx| {
        let bucket = tx.metadata().create_bucket(b"state")?;
        bucket.put(b"k", b"committed")
    })
    .unwrap();

    db.update(|tx| {
        let bucket = tx.metadata().bucket(b"state")?.expect("bucket exists");
        bucket.put(b"k", b"pending")?;
        assert_eq!(bucket.get(b"k")?, Some(Bytes::from_static(b"pending")));
        bucket.delete(b"k")?;
        assert_eq!(bucket.get(b"k")?, None);
        Ok(())
    })
    .unwrap();
}

#[test]
fn committed_metadata_survives_reopen() {
    let dir = tempdir().unwrap();
    {
        let db = Database::open(dir.path()).unwrap();
        db.update(|tx| {
            let bucket = tx.metadata().create_bucket(b"chainstate")?;
            bucket.put(b"besthash", &[0xab; 32])?;
            bucket.put(b"height", &42u32.to_be_bytes())?;
            Ok(())
        })
        .unwrap();
        db.close().unwrap();
    }

    let db = Database::open(dir.path()).unwrap();
    db.view(|tx| {
        let bucket = tx
            .metadata()
            .bucket(b"chainstate")?
            .expect("bucket persisted");
        assert_eq!(bucket.get(b"besthash")?, Some(Bytes::from(vec![0xab; 32])));
        assert_eq!(
            bucket.get(b"height")?,
            Some(Bytes::copy_from_slice(&42u32.to_be_bytes()))
        );
        Ok(())
    })
    .unwrap();
}

#[test]
fn nested_buckets_are_isolated() {
    let dir = tempdir().unwrap();
    let db = Database::open(dir.path()).unwrap();

    db.update(|tx| {
        let outer = tx.metadata().create_bucket(b"outer")?;
        let inner = outer.create_bucket(b"inner")?;
        outer.put(b"k", b"outer-value")?;
        inner.put(b"k", b"inner-value")?;
        Ok(())
    })
    .unwrap();

    db.view(|tx| {
        let outer = tx.metadata().bucket(b"outer")?.expect("outer exists");
        let inner = outer.bucket(b"inner")?.expect("inner exists");
        assert_eq!(outer.get(b"k")?, Some(Bytes::from_static(b"outer-value")));
        assert_eq!(inner.get(b"k")?, Some(Bytes::from_static(b"inner-value")));
        // The child registration is not visible as a key.
        assert_eq!(outer.get(b"inner")?, None);
        // Unknown names resolve to no bucket.
        assert!(tx.metadata().bucket(b"missing")?.is_none());
        Ok(())
    })
    .unwrap();
}

#[test]
fn create_bucket_twice_fails_but_if_not_exists_succeeds() {
    let dir = tempdir().unwrap();
    let db = Database::open(dir.path()).unwrap();

    db.update(|tx| {
        tx.metadata().create_bucket(b"dup")?;
        let err = tx.metadata().create_bucket(b"dup").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DriverSpecific);

        let again = tx.metadata().create_bucket_if_not_exists(b"dup")?;
        again.put(b"k", b"v")?;
        Ok(())
    })
    .unwrap();
}

#[test]
fn delete_bucket_removes_nested_tree() {
    let dir = tempdir().unwrap();
    let db = Database::open(dir.path()).unwrap();

    db.update(|tx| {
        let outer = tx.metadata().create_bucket(b"outer")?;
        outer.put(b"a", b"1")?;
        let inner = outer.create_bucket(b"inner")?;
        inner.put(b"b", b"2")?;
        let deepest = inner.create_bucket(b"deepest")?;
        deepest.put(b"c", b"3")?;
        Ok(())
    })
    .unwrap();

    db.update(|tx| tx.metadata().delete_bucket(b"outer")).unwrap();

    db.view(|tx| {
        assert!(tx.metadata().bucket(b"outer")?.is_none());
        Ok(())
    })
    .unwrap();

    // Deleting a missing bucket is an error.
    let err = db
        .update(|tx| tx.metadata().delete_bucket(b"outer"))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DriverSpecific);
}

#[test]
fn cursor_iterates_merged_view_in_order() {
    let dir = tempdir().unwrap();
    let db = Database::open(dir.path()).unwrap();

    db.update(|tx| {
        let bucket = tx.metadata().create_bucket(b"data")?;
        bucket.put(b"b", b"committed-b")?;
        bucket.put(b"d", b"committed-d")?;
        bucket.put(b"f", b"committed-f")?;
        Ok(())
    })
    .unwrap();

    db.update(|tx| {
        let bucket = tx.metadata().bucket(b"data")?.expect("bucket exists");
        bucket.put(b"c", b"pending-c")?; // new key between committed ones
        bucket.put(b"d", b"pending-d")?; // shadows committed value
        bucket.delete(b"f")?; // hides committed key

        let mut cursor = bucket.cursor()?;
        let mut seen = Vec::new();
        let mut valid = cursor.first();
        while valid {
            seen.push((cursor.key().unwrap(), cursor.value().unwrap()));
            valid = cursor.next();
        }
        let keys: Vec<&[u8]> = seen.iter().map(|(k, _)| k.as_ref()).collect();
        assert_eq!(keys, vec![b"b".as_ref(), b"c", b"d"]);
        assert_eq!(seen[1].1.as_ref(), b"pending-c");
        assert_eq!(seen[2].1.as_ref(), b"pending-d");
        Ok(())
    })
    .unwrap();
}

#[test]
fn cursor_reseeks_after_interleaved_mutation() {
    let dir = tempdir().unwrap();
    let db = Database::open(dir.path()).unwrap();

    db.update(|tx| {
        let bucket = tx.metadata().create_bucket(b"data")?;
        bucket.put(b"a", b"1")?;
        bucket.put(b"c", b"3")?;
        bucket.put(b"e", b"5")?;
        Ok(())
    })
    .unwrap();

    db.update(|tx| {
        let bucket = tx.metadata().bucket(b"data")?.expect("bucket exists");
        let mut cursor = bucket.cursor()?;
        assert!(cursor.first());
        assert_eq!(cursor.key().unwrap().as_ref(), b"a");

        // Mutations land while the cursor is parked on "a".
        bucket.put(b"b", b"2")?;
        bucket.delete(b"c")?;

        assert!(cursor.next());
        assert_eq!(cursor.key().unwrap().as_ref(), b"b");
        assert!(cursor.next());
        assert_eq!(cursor.key().unwrap().as_ref(), b"e");
        assert!(!cursor.next());
        Ok(())
    })
    .unwrap();
}

#[test]
fn cursor_seek_prev_and_delete() {
    let dir = tempdir().unwrap();
    let db = Database::open(dir.path()).unwrap();

    db.update(|tx| {
        let bucket = tx.metadata().create_bucket(b"data")?;
        for key in [b"a", b"b", b"c", b"d"] {
            bucket.put(key, b"v")?;
        }
        Ok(())
    })
    .unwrap();

    db.update(|tx| {
        let bucket = tx.metadata().bucket(b"data")?.expect("bucket exists");
        let mut cursor = bucket.cursor()?;

        assert!(cursor.seek(b"bb"));
        assert_eq!(cursor.key().unwrap().as_ref(), b"c");

        assert!(cursor.prev());
        assert_eq!(cursor.key().unwrap().as_ref(), b"b");

        cursor.delete()?;
        assert!(cursor.next());
        assert_eq!(cursor.key().unwrap().as_ref(), b"c");
        assert!(cursor.prev());
        assert_eq!(cursor.key().unwrap().as_ref(), b"a");

        assert!(cursor.last());
        assert_eq!(cursor.key().unwrap().as_ref(), b"d");
        assert!(!cursor.next());
        // Exhausted cursors stay put until repositioned.
        assert!(!cursor.next());
        assert!(cursor.first());
        assert_eq!(cursor.key().unwrap().as_ref(), b"a");
        Ok(())
    })
    .unwrap();
}

#[test]
fn for_each_visits_sorted_pairs() {
    let dir = tempdir().unwrap();
    let db = Database::open(dir.path()).unwrap();

    db.update(|tx| {
        let bucket = tx.metadata().create_bucket(b"data")?;
        bucket.put(b"z", b"26")?;
        bucket.put(b"a", b"1")?;
        bucket.put(b"m", b"13")?;
        Ok(())
    })
    .unwrap();

    db.view(|tx| {
        let bucket = tx.metadata().bucket(b"data")?.expect("bucket exists");
        let mut keys = Vec::new();
        bucket.for_each(|key, _| {
            keys.push(key.to_vec());
            Ok(())
        })?;
        assert_eq!(keys, vec![b"a".to_vec(), b"m".to_vec(), b"z".to_vec()]);
        Ok(())
    })
    .unwrap();
}

#[test]
fn bucket_ids_stay_unique_across_reopen() {
    let dir = tempdir().unwrap();
    {
        let db = Database::open(dir.path()).unwrap();
        db.update(|tx| {
            let first = tx.metadata().create_bucket(b"first")?;
            first.put(b"k", b"first-value")?;
            Ok(())
        })
        .unwrap();
        db.close().unwrap();
    }

    let db = Database::open(dir.path()).unwrap();
    db.update(|tx| {
        let second = tx.metadata().create_bucket(b"second")?;
        second.put(b"k", b"second-value")?;
        Ok(())
    })
    .unwrap();

    db.view(|tx| {
        let first = tx.metadata().bucket(b"first")?.expect("first exists");
        let second = tx.metadata().bucket(b"second")?.expect("second exists");
        assert_eq!(first.get(b"k")?, Some(Bytes::from_static(b"first-value")));
        assert_eq!(second.get(b"k")?, Some(Bytes::from_static(b"second-value")));
        Ok(())
    })
    .unwrap();
}
