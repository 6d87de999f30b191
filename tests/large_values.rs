use std::path::PathBuf;

use burrowdb::{Config, Db, Error, Result};

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    let mut v = vec![seed; len];
    if len >= 8 {
        v[len / 2] = seed ^ 0x11;
        v[len - 1] = seed ^ 0x22;
    }
    v
}

#[test]
fn values_spanning_overflow_pages_round_trip() -> Result<()> {
    let path = unique_path("overflow");
    let db = Db::builder().page_size(4096).open(&path)?;
    let big = pattern(3 * 4096, 0xAB);

    db.update(|tx| {
        let b = tx.create_bucket(b"blobs")?;
        b.put(b"big", &big)?;
        b.put(b"small", b"s")?;
        Ok(())
    })?;

    db.view(|tx| {
        let b = tx.bucket(b"blobs").ok_or(Error::BucketNotFound)?;
        let got = b.get(b"big")?.expect("big must exist");
        assert_eq!(got.len(), big.len());
        assert_eq!(got, big);
        assert_eq!(b.get(b"small")?.as_deref(), Some(&b"s"[..]));
        Ok(())
    })
}

#[test]
fn many_large_values_then_delete_releases_pages() -> Result<()> {
    let path = unique_path("overflow-churn");
    let db = Db::builder().page_size(4096).open(&path)?;

    db.update(|tx| {
        let b = tx.create_bucket(b"blobs")?;
        for i in 0..50u32 {
            let k = format!("blob-{:03}", i).into_bytes();
            b.put(&k, &pattern(2 * 4096, i as u8))?;
        }
        Ok(())
    })?;

    db.update(|tx| {
        let b = tx.bucket(b"blobs").ok_or(Error::BucketNotFound)?;
        for i in 0..50u32 {
            let k = format!("blob-{:03}", i).into_bytes();
            b.delete(&k)?;
        }
        Ok(())
    })?;

    let stats = db.stats();
    assert!(
        stats.free_page_n + stats.pending_page_n > 100,
        "overflow runs must return to the freelist, have {} free + {} pending",
        stats.free_page_n,
        stats.pending_page_n
    );

    // Freed pages are reused instead of growing the file further.
    let len_before = std::fs::metadata(&path)?.len();
    db.update(|tx| {
        let b = tx.bucket(b"blobs").ok_or(Error::BucketNotFound)?;
        for i in 0..50u32 {
            let k = format!("blob-{:03}", i).into_bytes();
            b.put(&k, &pattern(2 * 4096, i as u8))?;
        }
        Ok(())
    })?;
    let len_after = std::fs::metadata(&path)?.len();
    assert_eq!(len_before, len_after, "rewrites must reuse freed pages");

    let tx = db.begin()?;
    let violations = tx.check();
    assert!(violations.is_empty(), "check reported: {:?}", violations);
    Ok(())
}

#[test]
fn reopen_after_overflow_values() -> Result<()> {
    let path = unique_path("overflow-reopen");
    let big = pattern(5 * 4096 + 123, 0x5A);
    {
        let db = Db::builder().page_size(4096).open(&path)?;
        db.update(|tx| {
            let b = tx.create_bucket(b"blobs")?;
            b.put(b"big", &big)
        })?;
    }
    {
        let db = Db::open_with(&path, Config::default())?;
        db.view(|tx| {
            let b = tx.bucket(b"blobs").ok_or(Error::BucketNotFound)?;
            assert_eq!(b.get(b"big")?.as_deref(), Some(big.as_slice()));
            Ok(())
        })?;
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
