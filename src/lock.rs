//! Advisory file locking on the database file.
//!
//! Cross-platform (fs2):
//! - Exclusive: one writable handle per file across processes.
//! - Shared: read-only handles coexist with each other.
//!
//! The lock is held on the database file itself (no sidecar) and is
//! released on Drop.

use std::fs::File;

use crate::errors::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LockMode {
    Shared,
    Exclusive,
}

pub(crate) struct LockGuard {
    file: File,
}

impl LockGuard {
    /// Lock `file` in the requested mode without blocking. A file already
    /// locked by another process maps to `DatabaseOpen`.
    pub(crate) fn try_acquire(file: File, mode: LockMode) -> Result<Self> {
        let res = match mode {
            LockMode::Shared => fs2::FileExt::try_lock_shared(&file),
            LockMode::Exclusive => fs2::FileExt::try_lock_exclusive(&file),
        };
        res.map_err(|_| Error::DatabaseOpen)?;
        Ok(Self { file })
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        // fs2 unlock errors on drop are ignored deliberately.
        let _ = self.file.unlock();
    }
}
