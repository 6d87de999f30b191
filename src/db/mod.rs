//! db — the database handle: mapping lifecycle, transaction begin,
//! managed closures, growth and stats.
//!
//! Concurrency model: one writer mutex serializes writable
//! transactions; a reader registry (the meta mutex's role) tracks which
//! snapshots are live so pending pages are not recycled under them; the
//! mapping is an Arc that every transaction clones at begin — growth
//! installs a new Arc after commit and old mappings die with their last
//! reader, so readers never block and never observe a torn remap.

pub(crate) mod open;

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::ops::Deref;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use crate::config::Config;
use crate::consts::{MAX_GROW_STEP, MIN_GROW_SIZE};
use crate::errors::{Error, Result};
use crate::freelist::Freelist;
use crate::lock::LockGuard;
use crate::page::{Meta, PgId, TxId};
use crate::tx::{Tx, TxInner};

/// The bytes of the database file as seen by transactions.
pub(crate) enum Mapping {
    File(memmap2::Mmap),
    #[cfg(test)]
    Mem(Vec<u8>),
}

impl Mapping {
    #[cfg(test)]
    pub(crate) fn mem(buf: Vec<u8>) -> Self {
        Mapping::Mem(buf)
    }
}

impl Deref for Mapping {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            Mapping::File(m) => m,
            #[cfg(test)]
            Mapping::Mem(v) => v,
        }
    }
}

/// Counters exposed by `Db::stats`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DbStats {
    /// Pages ready for reuse.
    pub free_page_n: usize,
    /// Pages freed but still visible to some reader snapshot.
    pub pending_page_n: usize,
    /// Bytes allocated to free and pending pages.
    pub free_alloc: usize,
    /// Bytes the persisted freelist occupies.
    pub freelist_inuse: usize,
    /// Read transactions started over the handle's lifetime.
    pub tx_n: u64,
    /// Currently open read transactions.
    pub open_tx_n: usize,
}

pub struct Db {
    pub(crate) path: PathBuf,
    pub(crate) file: Mutex<File>,
    _lock: LockGuard,
    pub(crate) page_size: usize,
    read_only: bool,
    data_fsync: bool,
    fill_percent: f32,
    mmap: Mutex<Arc<Mapping>>,
    /// At most one writable transaction at a time.
    writer: Mutex<()>,
    pub(crate) freelist: Mutex<Freelist>,
    /// Snapshot txids of live read transactions.
    readers: Mutex<Vec<TxId>>,
    tx_n: AtomicU64,
}

impl Db {
    /// Open (or create) a database with configuration from the
    /// environment. See `Config` for the tunables.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Db> {
        Self::open_with(path, Config::from_env())
    }

    pub fn builder() -> DbBuilder {
        DbBuilder::new()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    // ---------- transactions ----------

    /// Begin a read-only transaction: a stable snapshot of the last
    /// committed state. Never blocks and is never blocked by the writer.
    pub fn begin(&self) -> Result<Tx<'_>> {
        let map = self.mmap.lock().clone();
        let meta = {
            let mut readers = self.readers.lock();
            let meta = self.current_meta(&map)?;
            readers.push(meta.txid);
            meta
        };
        self.tx_n.fetch_add(1, Ordering::Relaxed);
        let inner = TxInner::new(meta, map, self.page_size, self.fill_percent, false);
        Ok(Tx::new(self, inner, None))
    }

    /// Begin the writable transaction, blocking while another one is
    /// live. Pending pages no longer visible to any reader are released
    /// for reuse here.
    pub fn begin_rw(&self) -> Result<Tx<'_>> {
        if self.read_only {
            return Err(Error::DatabaseReadOnly);
        }
        let guard = self.writer.lock();
        let map = self.mmap.lock().clone();
        let mut meta = self.current_meta(&map)?;
        meta.txid += 1;
        {
            let readers = self.readers.lock();
            let min = readers.iter().min().copied().unwrap_or(TxId::MAX);
            if min > 0 {
                self.freelist.lock().release(min - 1);
            }
        }
        let inner = TxInner::new(meta, map, self.page_size, self.fill_percent, true);
        Ok(Tx::new(self, inner, Some(guard)))
    }

    /// Run a writable transaction through a closure. The transaction is
    /// committed when the closure returns Ok, rolled back when it
    /// returns an error (propagated verbatim) and rolled back when it
    /// panics (the panic is then resumed).
    pub fn update<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Tx<'_>) -> Result<T>,
    {
        let mut tx = self.begin_rw()?;
        match catch_unwind(AssertUnwindSafe(|| f(&mut tx))) {
            Ok(Ok(v)) => {
                tx.commit()?;
                Ok(v)
            }
            Ok(Err(e)) => {
                tx.rollback();
                Err(e)
            }
            Err(panic) => {
                tx.rollback();
                resume_unwind(panic)
            }
        }
    }

    /// Run a read-only transaction through a closure; the callback's
    /// error is propagated verbatim.
    pub fn view<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Tx<'_>) -> Result<T>,
    {
        let mut tx = self.begin()?;
        match catch_unwind(AssertUnwindSafe(|| f(&tx))) {
            Ok(res) => {
                tx.rollback();
                res
            }
            Err(panic) => {
                tx.rollback();
                resume_unwind(panic)
            }
        }
    }

    /// Freelist and transaction counters.
    pub fn stats(&self) -> DbStats {
        let fl = self.freelist.lock();
        let readers = self.readers.lock();
        DbStats {
            free_page_n: fl.free_count(),
            pending_page_n: fl.pending_count(),
            free_alloc: fl.count() * self.page_size,
            freelist_inuse: fl.size(),
            tx_n: self.tx_n.load(Ordering::Relaxed),
            open_tx_n: readers.len(),
        }
    }

    /// Explicit fsync of the database file.
    pub fn sync(&self) -> Result<()> {
        self.file.lock().sync_all()?;
        Ok(())
    }

    // ---------- internals used by the commit pipeline ----------

    /// Pick the valid meta slot with the higher txid.
    pub(crate) fn current_meta(&self, map: &Mapping) -> Result<Meta> {
        let ps = self.page_size;
        let m0 = Meta::read(&map[0..ps]);
        let m1 = Meta::read(&map[ps..2 * ps]);
        match (m0, m1) {
            (Ok(a), Ok(b)) => Ok(if a.txid >= b.txid { a } else { b }),
            (Ok(a), Err(e)) => {
                log::warn!("meta slot 1 invalid ({}), falling back to slot 0", e);
                Ok(a)
            }
            (Err(e), Ok(b)) => {
                log::warn!("meta slot 0 invalid ({}), falling back to slot 1", e);
                Ok(b)
            }
            (Err(_), Err(_)) => Err(Error::Invalid),
        }
    }

    pub(crate) fn remove_reader(&self, txid: TxId) {
        let mut readers = self.readers.lock();
        if let Some(pos) = readers.iter().position(|&t| t == txid) {
            readers.swap_remove(pos);
        }
    }

    /// Ensure the file covers `min_pages`. Growth doubles from 32 KiB up
    /// to 1 GiB, then steps by 1 GiB, page aligned.
    pub(crate) fn grow(&self, min_pages: u64) -> Result<()> {
        let needed = min_pages * self.page_size as u64;
        let file = self.file.lock();
        let current = file.metadata()?.len();
        if needed <= current {
            return Ok(());
        }
        let target = self.grow_size(needed);
        file.set_len(target)?;
        debug!("grow file {} -> {} bytes", current, target);
        Ok(())
    }

    fn grow_size(&self, needed: u64) -> u64 {
        let mut step = MIN_GROW_SIZE;
        while step < MAX_GROW_STEP {
            if needed <= step {
                return step;
            }
            step *= 2;
        }
        let mut size = needed;
        let rem = size % MAX_GROW_STEP;
        if rem > 0 {
            size += MAX_GROW_STEP - rem;
        }
        let ps = self.page_size as u64;
        if size % ps != 0 {
            size = (size / ps + 1) * ps;
        }
        size
    }

    /// Write all dirty page images at their file offsets.
    pub(crate) fn write_pages(&self, pages: &BTreeMap<PgId, Vec<u8>>) -> Result<()> {
        let mut file = self.file.lock();
        for (&pgid, buf) in pages {
            file.seek(SeekFrom::Start(pgid * self.page_size as u64))?;
            file.write_all(buf)?;
        }
        Ok(())
    }

    /// Publish a meta into the slot selected by txid parity; the other
    /// slot keeps the last known-good state.
    pub(crate) fn write_meta(&self, meta: &Meta) -> Result<()> {
        let slot = meta.txid % 2;
        let mut buf = vec![0u8; self.page_size];
        meta.write(&mut buf, slot);
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(slot * self.page_size as u64))?;
        file.write_all(&buf)?;
        Ok(())
    }

    pub(crate) fn sync_data(&self) -> Result<()> {
        if self.data_fsync {
            self.file.lock().sync_all()?;
        }
        Ok(())
    }

    /// Install a fresh mapping when the file outgrew the current one.
    /// Live transactions keep their Arc; new ones see the larger file.
    pub(crate) fn remap_if_grown(&self) -> Result<()> {
        let file = self.file.lock();
        let len = file.metadata()?.len() as usize;
        let mut map = self.mmap.lock();
        if map.len() < len {
            *map = Arc::new(open::map_file(&file)?);
            debug!("remapped to {} bytes", len);
        }
        Ok(())
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        // Best-effort flush for handles running with data_fsync off.
        if !self.read_only {
            let _ = self.file.lock().sync_all();
        }
    }
}

/// Fluent construction of a configured handle (`Db::builder()`).
#[derive(Clone, Debug, Default)]
pub struct DbBuilder {
    cfg: Config,
}

impl DbBuilder {
    pub fn new() -> Self {
        Self {
            cfg: Config::default(),
        }
    }

    pub fn page_size(mut self, page_size: u32) -> Self {
        self.cfg.page_size = Some(page_size);
        self
    }

    pub fn read_only(mut self, on: bool) -> Self {
        self.cfg.read_only = on;
        self
    }

    pub fn data_fsync(mut self, on: bool) -> Self {
        self.cfg.data_fsync = on;
        self
    }

    pub fn fill_percent(mut self, fill: f32) -> Self {
        self.cfg.fill_percent = fill;
        self
    }

    pub fn open<P: AsRef<Path>>(self, path: P) -> Result<Db> {
        Db::open_with(path, self.cfg)
    }
}
