use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use burrowdb::{Config, Db, Error, Result};

#[test]
fn readers_see_their_snapshot_only() -> Result<()> {
    let path = unique_path("snapshot");
    let db = Db::open_with(&path, Config::default())?;

    db.update(|tx| {
        let b = tx.create_bucket(b"iso")?;
        b.put(b"k", b"v1")
    })?;

    // A reader begun before the next commit keeps observing v1.
    let mut reader = db.begin()?;

    db.update(|tx| {
        let b = tx.bucket(b"iso").ok_or(Error::BucketNotFound)?;
        b.put(b"k", b"v2")
    })?;

    {
        let b = reader.bucket(b"iso").ok_or(Error::BucketNotFound)?;
        assert_eq!(b.get(b"k")?.as_deref(), Some(&b"v1"[..]));
    }
    reader.rollback();

    // A reader begun after the commit sees v2.
    db.view(|tx| {
        let b = tx.bucket(b"iso").ok_or(Error::BucketNotFound)?;
        assert_eq!(b.get(b"k")?.as_deref(), Some(&b"v2"[..]));
        Ok(())
    })
}

#[test]
fn rolled_back_tx_reports_closed() -> Result<()> {
    let path = unique_path("closed");
    let db = Db::open_with(&path, Config::default())?;
    db.update(|tx| tx.create_bucket(b"b").map(|_| ()))?;

    let mut tx = db.begin_rw()?;
    {
        let b = tx.bucket(b"b").ok_or(Error::BucketNotFound)?;
        b.put(b"k", b"v")?;
    }
    tx.rollback();

    assert!(matches!(tx.create_bucket(b"x"), Err(Error::TxClosed)));
    assert!(matches!(tx.delete_bucket(b"b"), Err(Error::TxClosed)));
    assert!(matches!(tx.for_each(|_, _| Ok(())), Err(Error::TxClosed)));
    assert!(tx.bucket(b"b").is_none());
    drop(tx);

    // The rollback really dropped the uncommitted put.
    db.view(|tx| {
        let b = tx.bucket(b"b").ok_or(Error::BucketNotFound)?;
        assert_eq!(b.get(b"k")?, None);
        Ok(())
    })
}

#[test]
fn mutations_require_a_writable_tx() -> Result<()> {
    let path = unique_path("not-writable");
    let db = Db::open_with(&path, Config::default())?;
    db.update(|tx| {
        let b = tx.create_bucket(b"b")?;
        b.put(b"k", b"v")
    })?;

    db.view(|tx| {
        let b = tx.bucket(b"b").ok_or(Error::BucketNotFound)?;
        assert!(matches!(b.put(b"k", b"x"), Err(Error::TxNotWritable)));
        assert!(matches!(b.delete(b"k"), Err(Error::TxNotWritable)));
        assert!(matches!(b.next_sequence(), Err(Error::TxNotWritable)));
        assert!(matches!(b.set_sequence(9), Err(Error::TxNotWritable)));
        assert!(matches!(tx.create_bucket(b"c"), Err(Error::TxNotWritable)));
        assert!(matches!(tx.delete_bucket(b"b"), Err(Error::TxNotWritable)));
        assert!(matches!(b.cursor().delete(), Err(Error::TxNotWritable)));
        Ok(())
    })
}

#[test]
fn update_rolls_back_on_callback_error() -> Result<()> {
    let path = unique_path("update-error");
    let db = Db::open_with(&path, Config::default())?;
    db.update(|tx| tx.create_bucket(b"b").map(|_| ()))?;

    let res: Result<()> = db.update(|tx| {
        let b = tx.bucket(b"b").ok_or(Error::BucketNotFound)?;
        b.put(b"k", b"v")?;
        Err(Error::Other("abort".into()))
    });
    match res {
        Err(Error::Other(msg)) => assert_eq!(msg, "abort"),
        other => panic!("callback error must propagate verbatim, got {:?}", other),
    }

    db.view(|tx| {
        let b = tx.bucket(b"b").ok_or(Error::BucketNotFound)?;
        assert_eq!(b.get(b"k")?, None);
        Ok(())
    })
}

#[test]
fn update_rolls_back_on_panic_and_repropagates() -> Result<()> {
    let path = unique_path("update-panic");
    let db = Db::open_with(&path, Config::default())?;
    db.update(|tx| tx.create_bucket(b"b").map(|_| ()))?;

    let outcome = catch_unwind(AssertUnwindSafe(|| {
        let _: Result<()> = db.update(|tx| {
            let b = tx.bucket(b"b").ok_or(Error::BucketNotFound)?;
            b.put(b"k", b"v")?;
            panic!("boom");
        });
    }));
    assert!(outcome.is_err(), "the panic must re-propagate");

    // On-disk state equals pre-begin: the put is gone, and the writer
    // mutex was released so the next update proceeds.
    db.update(|tx| {
        let b = tx.bucket(b"b").ok_or(Error::BucketNotFound)?;
        assert_eq!(b.get(b"k")?, None);
        Ok(())
    })
}

#[test]
fn commit_hooks_run_after_successful_commit_only() -> Result<()> {
    let path = unique_path("hooks");
    let db = Db::open_with(&path, Config::default())?;

    let fired = Arc::new(AtomicBool::new(false));
    {
        let fired = fired.clone();
        let tx = db.begin_rw()?;
        tx.create_bucket(b"b")?;
        tx.on_commit(move || fired.store(true, Ordering::SeqCst))?;
        tx.commit()?;
    }
    assert!(fired.load(Ordering::SeqCst));

    let fired = Arc::new(AtomicBool::new(false));
    {
        let fired = fired.clone();
        let mut tx = db.begin_rw()?;
        tx.on_commit(move || fired.store(true, Ordering::SeqCst))?;
        tx.rollback();
    }
    assert!(!fired.load(Ordering::SeqCst), "rollback must not fire hooks");
    Ok(())
}

#[test]
fn dropping_an_unfinished_tx_rolls_it_back() -> Result<()> {
    let path = unique_path("drop-rollback");
    let db = Db::open_with(&path, Config::default())?;
    db.update(|tx| tx.create_bucket(b"b").map(|_| ()))?;

    {
        let tx = db.begin_rw()?;
        let b = tx.bucket(b"b").ok_or(Error::BucketNotFound)?;
        b.put(b"k", b"v")?;
        // dropped without commit
    }

    db.view(|tx| {
        let b = tx.bucket(b"b").ok_or(Error::BucketNotFound)?;
        assert_eq!(b.get(b"k")?, None);
        Ok(())
    })
}

#[test]
fn read_only_handle_refuses_writes() -> Result<()> {
    let path = unique_path("read-only");
    {
        let db = Db::open_with(&path, Config::default())?;
        db.update(|tx| {
            let b = tx.create_bucket(b"b")?;
            b.put(b"k", b"v")
        })?;
    }

    let db = Db::open_with(&path, Config::default().with_read_only(true))?;
    assert!(db.is_read_only());
    assert!(matches!(db.begin_rw(), Err(Error::DatabaseReadOnly)));
    db.view(|tx| {
        let b = tx.bucket(b"b").ok_or(Error::BucketNotFound)?;
        assert_eq!(b.get(b"k")?.as_deref(), Some(&b"v"[..]));
        Ok(())
    })
}

#[test]
fn second_writable_handle_is_refused() -> Result<()> {
    let path = unique_path("second-handle");
    let db = Db::open_with(&path, Config::default())?;
    db.update(|tx| tx.create_bucket(b"b").map(|_| ()))?;

    match Db::open_with(&path, Config::default()) {
        Err(Error::DatabaseOpen) => {}
        other => panic!("expected DatabaseOpen, got {:?}", other.map(|_| ())),
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
