//! burrowdb — embedded, single-writer, single-file key/value store.
//!
//! An ordered mapping from byte-string keys to byte-string values,
//! organized as a copy-on-write B+tree with nested buckets, fully
//! serializable transactions and crash-consistent durability via a
//! double-buffered meta page pair. Readers never block the writer and
//! the writer never blocks readers: every committed transaction is a
//! self-consistent snapshot.
//!
//! ```no_run
//! use burrowdb::{Db, Error};
//!
//! let db = Db::open("app.db")?;
//! db.update(|tx| {
//!     let b = tx.create_bucket_if_not_exists(b"widgets")?;
//!     b.put(b"foo", b"bar")
//! })?;
//! db.view(|tx| {
//!     let b = tx.bucket(b"widgets").ok_or(Error::BucketNotFound)?;
//!     assert_eq!(b.get(b"foo")?.as_deref(), Some(&b"bar"[..]));
//!     Ok(())
//! })?;
//! # Ok::<(), Error>(())
//! ```

pub mod config;
pub mod consts;
pub mod errors;

mod bucket;
mod check;
mod cursor;
mod db;
mod freelist;
mod lock;
mod node;
mod page;
mod tx;

pub use bucket::{Bucket, BucketStats};
pub use config::Config;
pub use cursor::Cursor;
pub use db::{Db, DbBuilder, DbStats};
pub use errors::{Error, Result};
pub use page::{PgId, TxId};
pub use tx::Tx;
