use std::path::PathBuf;

use burrowdb::{Config, Db, Error, Result};

#[test]
fn for_each_yields_stable_key_order() -> Result<()> {
    let path = unique_path("iter-order");
    let db = Db::open_with(&path, Config::default())?;

    db.update(|tx| {
        let b = tx.create_bucket(b"widgets")?;
        b.put(b"bar", b"0002")?;
        b.put(b"baz", b"0001")?;
        b.put(b"foo", b"0000")?;
        b.create_bucket(b"csubbucket")?;
        Ok(())
    })?;

    db.view(|tx| {
        let b = tx.bucket(b"widgets").ok_or(Error::BucketNotFound)?;
        let mut seen: Vec<(Vec<u8>, Option<Vec<u8>>)> = Vec::new();
        b.for_each(|k, v| {
            seen.push((k.to_vec(), v.map(|v| v.to_vec())));
            Ok(())
        })?;
        assert_eq!(
            seen,
            vec![
                (b"bar".to_vec(), Some(b"0002".to_vec())),
                (b"baz".to_vec(), Some(b"0001".to_vec())),
                (b"csubbucket".to_vec(), None),
                (b"foo".to_vec(), Some(b"0000".to_vec())),
            ]
        );
        Ok(())
    })
}

#[test]
fn for_each_short_circuits_on_callback_error() -> Result<()> {
    let path = unique_path("iter-stop");
    let db = Db::open_with(&path, Config::default())?;

    db.update(|tx| {
        let b = tx.create_bucket(b"widgets")?;
        b.put(b"a", b"1")?;
        b.put(b"b", b"2")?;
        b.put(b"c", b"3")?;
        Ok(())
    })?;

    db.view(|tx| {
        let b = tx.bucket(b"widgets").ok_or(Error::BucketNotFound)?;
        let mut visited = 0;
        let res = b.for_each(|_, _| {
            visited += 1;
            if visited == 2 {
                return Err(Error::Other("sentinel".into()));
            }
            Ok(())
        });
        match res {
            Err(Error::Other(msg)) => assert_eq!(msg, "sentinel"),
            other => panic!("expected the sentinel error back, got {:?}", other),
        }
        assert_eq!(visited, 2, "exactly two callbacks must run");
        Ok(())
    })
}

#[test]
fn cursor_walks_both_directions() -> Result<()> {
    let path = unique_path("cursor-walk");
    let db = Db::open_with(&path, Config::default())?;

    let keys: Vec<Vec<u8>> = (0..500u32)
        .map(|i| format!("key-{:05}", i).into_bytes())
        .collect();
    db.update(|tx| {
        let b = tx.create_bucket(b"walk")?;
        for k in &keys {
            b.put(k, b"v")?;
        }
        Ok(())
    })?;

    db.view(|tx| {
        let b = tx.bucket(b"walk").ok_or(Error::BucketNotFound)?;
        let mut c = b.cursor();

        let mut forward = Vec::new();
        let mut item = c.first();
        while let Some((k, _)) = item {
            forward.push(k);
            item = c.next();
        }
        assert_eq!(forward, keys);

        let mut backward = Vec::new();
        let mut item = c.last();
        while let Some((k, _)) = item {
            backward.push(k);
            item = c.prev();
        }
        backward.reverse();
        assert_eq!(backward, keys);
        Ok(())
    })
}

#[test]
fn seek_lands_on_first_key_at_or_after_target() -> Result<()> {
    let path = unique_path("cursor-seek");
    let db = Db::open_with(&path, Config::default())?;

    db.update(|tx| {
        let b = tx.create_bucket(b"s")?;
        for k in [&b"bar"[..], b"baz", b"foo"] {
            b.put(k, b"v")?;
        }
        Ok(())
    })?;

    db.view(|tx| {
        let b = tx.bucket(b"s").ok_or(Error::BucketNotFound)?;
        let mut c = b.cursor();
        assert_eq!(c.seek(b"baz").map(|(k, _)| k), Some(b"baz".to_vec()));
        assert_eq!(c.seek(b"bb").map(|(k, _)| k), Some(b"foo".to_vec()));
        assert_eq!(c.seek(b"a").map(|(k, _)| k), Some(b"bar".to_vec()));
        assert_eq!(c.seek(b"zzz"), None);
        Ok(())
    })
}

#[test]
fn seek_crosses_leaf_boundaries() -> Result<()> {
    let path = unique_path("cursor-seek-split");
    let db = Db::open_with(&path, Config::default())?;

    // Enough keys to force a multi-level tree.
    db.update(|tx| {
        let b = tx.create_bucket(b"s")?;
        for i in 0..5_000u32 {
            let k = format!("{:06}", i * 2).into_bytes();
            b.put(&k, b"v")?;
        }
        Ok(())
    })?;

    db.view(|tx| {
        let b = tx.bucket(b"s").ok_or(Error::BucketNotFound)?;
        let mut c = b.cursor();
        // Odd targets sit between stored keys: seek must land on the
        // next even key, wherever the leaf boundary falls.
        for i in (1..9_999u32).step_by(730) {
            let target = format!("{:06}", i).into_bytes();
            let expect = format!("{:06}", i + 1).into_bytes();
            assert_eq!(c.seek(&target).map(|(k, _)| k), Some(expect));
        }
        Ok(())
    })
}

#[test]
fn cursor_delete_removes_current_element() -> Result<()> {
    let path = unique_path("cursor-delete");
    let db = Db::open_with(&path, Config::default())?;

    db.update(|tx| {
        let b = tx.create_bucket(b"d")?;
        b.put(b"a", b"1")?;
        b.put(b"b", b"2")?;
        b.put(b"c", b"3")?;
        b.create_bucket(b"sub")?;

        let mut c = b.cursor();
        let (k, _) = c.seek(b"b").ok_or(Error::BucketNotFound)?;
        assert_eq!(k, b"b");
        c.delete()?;
        assert_eq!(b.get(b"b")?, None);

        // Deleting a sub-bucket element through the cursor is refused.
        let mut c = b.cursor();
        assert!(c.seek(b"sub").is_some());
        assert!(matches!(c.delete(), Err(Error::IncompatibleValue)));
        Ok(())
    })
}

#[test]
fn empty_bucket_cursor_is_empty() -> Result<()> {
    let path = unique_path("cursor-empty");
    let db = Db::open_with(&path, Config::default())?;
    db.update(|tx| {
        let b = tx.create_bucket(b"empty")?;
        let mut c = b.cursor();
        assert_eq!(c.first(), None);
        assert_eq!(c.last(), None);
        assert_eq!(c.seek(b"anything"), None);
        Ok(())
    })
}

#[test]
fn uncommitted_writes_visible_to_own_cursor() -> Result<()> {
    let path = unique_path("cursor-dirty");
    let db = Db::open_with(&path, Config::default())?;
    db.update(|tx| {
        let b = tx.create_bucket(b"mix")?;
        b.put(b"committed", b"no")?;
        Ok(())
    })?;
    db.update(|tx| {
        let b = tx.bucket(b"mix").ok_or(Error::BucketNotFound)?;
        b.put(b"added", b"yes")?;
        b.delete(b"committed")?;
        let mut seen = Vec::new();
        b.for_each(|k, _| {
            seen.push(k.to_vec());
            Ok(())
        })?;
        assert_eq!(seen, vec![b"added".to_vec()]);
        Ok(())
    })
}

fn unique_path(prefix: &str) -> PathBuf {
    let pid = std::process::id();
    let t = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    std::env::temp_dir().join(format!("burrow-{}-{}-{}.db", prefix, pid, t))
}
