use std::path::PathBuf;

use burrowdb::{Config, Db, Error, Result};

#[test]
fn basic_round_trip() -> Result<()> {
    let path = unique_path("basic");
    let db = Db::open_with(&path, Config::default())?;

    // 1) writer: create bucket + put, visible within the same tx
    {
        let tx = db.begin_rw()?;
        let b = tx.create_bucket(b"widgets")?;
        b.put(b"foo", b"bar")?;
        assert_eq!(b.get(b"foo")?.as_deref(), Some(&b"bar"[..]));
        tx.commit()?;
    }

    // 2) reader: committed value visible in a fresh snapshot
    {
        let mut tx = db.begin()?;
        let b = tx.bucket(b"widgets").expect("widgets must exist");
        assert_eq!(b.get(b"foo")?.as_deref(), Some(&b"bar"[..]));
        assert_eq!(b.get(b"missing")?, None);
        tx.rollback();
    }
    Ok(())
}

#[test]
fn overwrite_and_delete_within_one_tx() -> Result<()> {
    let path = unique_path("overwrite");
    let db = Db::open_with(&path, Config::default())?;

    db.update(|tx| {
        let b = tx.create_bucket(b"widgets")?;
        b.put(b"foo", b"bar")?;
        b.put(b"foo", b"baz")?;
        assert_eq!(b.get(b"foo")?.as_deref(), Some(&b"baz"[..]));
        b.delete(b"foo")?;
        assert_eq!(b.get(b"foo")?, None);
        // deleting an absent key is a no-op
        b.delete(b"foo")?;
        Ok(())
    })
}

#[test]
fn zero_length_value_is_accepted() -> Result<()> {
    let path = unique_path("empty-value");
    let db = Db::open_with(&path, Config::default())?;
    db.update(|tx| {
        let b = tx.create_bucket(b"widgets")?;
        b.put(b"empty", b"")
    })?;
    db.view(|tx| {
        let b = tx.bucket(b"widgets").ok_or(Error::BucketNotFound)?;
        assert_eq!(b.get(b"empty")?.as_deref(), Some(&b""[..]));
        Ok(())
    })
}

#[test]
fn close_and_reopen_preserves_data() -> Result<()> {
    let path = unique_path("reopen");
    {
        let db = Db::open_with(&path, Config::default())?;
        db.update(|tx| {
            let b = tx.create_bucket(b"widgets")?;
            for i in 0..100u32 {
                let k = format!("key-{:04}", i).into_bytes();
                let v = format!("val-{:04}", i).into_bytes();
                b.put(&k, &v)?;
            }
            Ok(())
        })?;
    }
    {
        let db = Db::open_with(&path, Config::default())?;
        db.view(|tx| {
            let b = tx.bucket(b"widgets").ok_or(Error::BucketNotFound)?;
            for i in 0..100u32 {
                let k = format!("key-{:04}", i).into_bytes();
                let v = format!("val-{:04}", i).into_bytes();
                assert_eq!(b.get(&k)?.as_deref(), Some(v.as_slice()));
            }
            Ok(())
        })?;
    }
    Ok(())
}

#[test]
fn txid_increases_across_commits() -> Result<()> {
    let path = unique_path("txid");
    let db = Db::open_with(&path, Config::default())?;
    let first = {
        let tx = db.begin_rw()?;
        let id = tx.id();
        tx.create_bucket(b"a")?;
        tx.commit()?;
        id
    };
    let second = {
        let tx = db.begin_rw()?;
        let id = tx.id();
        tx.create_bucket(b"b")?;
        tx.commit()?;
        id
    };
    assert!(second > first, "txid must be strictly increasing");
    Ok(())
}

#[test]
fn page_size_is_fixed_at_creation() -> Result<()> {
    let path = unique_path("page-size");
    {
        let db = Db::builder().page_size(8192).open(&path)?;
        assert_eq!(db.page_size(), 8192);
        db.update(|tx| tx.create_bucket(b"a").map(|_| ()))?;
    }
    {
        // A different configured size is ignored on an existing file.
        let db = Db::builder().page_size(4096).open(&path)?;
        assert_eq!(db.page_size(), 8192);
    }
    Ok(())
}

fn unique_path(prefix: &str) -> PathBuf {
    let pid = std::process::id();
    let t = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    std::env::temp_dir().join(format!("burrow-{}-{}-{}.db", prefix, pid, t))
}
