//! Error taxonomy for the engine.
//!
//! Three propagation classes:
//! - precondition errors (KeyRequired, TxNotWritable, ...) return without
//!   touching the store;
//! - Unexpected marks an invariant violation; the transaction must be
//!   rolled back and not reused;
//! - Io/Checksum/Invalid are fatal to the open or to the transaction.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("database not open")]
    DatabaseNotOpen,

    #[error("database already open")]
    DatabaseOpen,

    #[error("invalid database")]
    Invalid,

    #[error("version mismatch")]
    VersionMismatch,

    #[error("checksum error")]
    Checksum,

    #[error("transaction closed")]
    TxClosed,

    #[error("database is in read-only mode")]
    DatabaseReadOnly,

    #[error("transaction not writable")]
    TxNotWritable,

    #[error("key required")]
    KeyRequired,

    #[error("key too large")]
    KeyTooLarge,

    #[error("value too large")]
    ValueTooLarge,

    #[error("bucket not found")]
    BucketNotFound,

    #[error("bucket already exists")]
    BucketExists,

    #[error("bucket name required")]
    BucketNameRequired,

    #[error("incompatible value")]
    IncompatibleValue,

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("unexpected: {0}")]
    Unexpected(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Kind equality, ignoring payloads. Used by tests and by callers that
    /// dispatch on the taxonomy rather than on message text.
    pub fn is_kind(&self, other: &Error) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}
