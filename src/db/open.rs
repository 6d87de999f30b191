//! db/open — file creation, meta recovery and mapping setup.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;

use crate::config::Config;
use crate::consts::{
    INIT_PAGE_COUNT, MAX_PAGE_SIZE, META_PAGE_SIZE, MIN_PAGE_SIZE,
};
use crate::errors::{Error, Result};
use crate::freelist::Freelist;
use crate::lock::{LockGuard, LockMode};
use crate::page::{write_page_header, BucketHeader, Meta, PageFlags, PageRef};

use super::{Db, Mapping};

impl Db {
    /// Open (or create) the database file at `path`.
    ///
    /// Creation lays out the four initial pages: the meta double buffer,
    /// an empty freelist at page 2 and an empty root leaf at page 3.
    /// Opening validates both meta slots and adopts the valid one with
    /// the higher txid.
    pub fn open_with<P: AsRef<Path>>(path: P, cfg: Config) -> Result<Db> {
        let path = path.as_ref().to_path_buf();
        let mut opts = OpenOptions::new();
        opts.read(true);
        if !cfg.read_only {
            opts.write(true).create(true);
        }
        let file = opts.open(&path)?;
        let mode = if cfg.read_only {
            LockMode::Shared
        } else {
            LockMode::Exclusive
        };
        let lock = LockGuard::try_acquire(file.try_clone()?, mode)?;

        if file.metadata()?.len() == 0 {
            if cfg.read_only {
                return Err(Error::Invalid);
            }
            let ps = resolve_page_size(&cfg)?;
            init_file(&file, ps)?;
            debug!("initialized {} with page_size={}", path.display(), ps);
        }

        let boot = read_boot_meta(&file)?;
        let page_size = boot.page_size as usize;
        let map = map_file(&file)?;

        let db = Db {
            path,
            file: Mutex::new(file),
            _lock: lock,
            page_size,
            read_only: cfg.read_only,
            data_fsync: cfg.data_fsync,
            fill_percent: cfg.clamped_fill_percent(),
            mmap: Mutex::new(Arc::new(map)),
            writer: Mutex::new(()),
            freelist: Mutex::new(Freelist::new()),
            readers: Mutex::new(Vec::new()),
            tx_n: AtomicU64::new(0),
        };

        // Load the freelist for the current meta.
        {
            let map = db.mmap.lock().clone();
            let meta = db.current_meta(&map)?;
            let off = meta.freelist as usize * page_size;
            let head = PageRef::new(&map[off..off + page_size]);
            let span = (1 + head.overflow() as usize) * page_size;
            db.freelist.lock().read(PageRef::new(&map[off..off + span]));
            debug!(
                "opened {} page_size={} txid={} free={}",
                db.path.display(),
                page_size,
                meta.txid,
                db.freelist.lock().free_count()
            );
        }
        Ok(db)
    }
}

/// Page size for a new file: configured, or the OS page size, always a
/// power of two within the supported range.
fn resolve_page_size(cfg: &Config) -> Result<u32> {
    match cfg.page_size {
        Some(ps) => {
            if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&ps) || !ps.is_power_of_two() {
                return Err(Error::Other(format!(
                    "page_size must be a power of two in [{}, {}], got {}",
                    MIN_PAGE_SIZE, MAX_PAGE_SIZE, ps
                )));
            }
            Ok(ps)
        }
        None => Ok((page_size::get() as u32).clamp(MIN_PAGE_SIZE, MAX_PAGE_SIZE)),
    }
}

/// Lay out the initial four pages and fsync them.
fn init_file(file: &File, page_size: u32) -> Result<()> {
    let ps = page_size as usize;
    let mut buf = vec![0u8; ps * INIT_PAGE_COUNT as usize];
    for slot in 0..2u64 {
        let mut m = Meta::new(page_size);
        m.root = BucketHeader { root: 3, sequence: 0 };
        m.freelist = 2;
        m.pgid = INIT_PAGE_COUNT;
        m.txid = slot;
        m.write(&mut buf[slot as usize * ps..(slot as usize + 1) * ps], slot);
    }
    write_page_header(&mut buf[2 * ps..3 * ps], 2, PageFlags::FREELIST, 0, 0);
    write_page_header(&mut buf[3 * ps..4 * ps], 3, PageFlags::LEAF, 0, 0);
    let mut f = file.try_clone()?;
    f.seek(SeekFrom::Start(0))?;
    f.write_all(&buf)?;
    f.sync_all()?;
    Ok(())
}

/// Meta used to learn the page size before the mapping exists. Slot 0
/// lives at offset 0 regardless of page size; when it is torn, slot 1
/// is probed at every candidate page size.
fn read_boot_meta(file: &File) -> Result<Meta> {
    let len = file.metadata()?.len();
    let mut f = file.try_clone()?;

    let mut head = vec![0u8; META_PAGE_SIZE.min(len as usize)];
    f.seek(SeekFrom::Start(0))?;
    f.read_exact(&mut head)?;
    let slot0 = Meta::read(&head);
    if let Ok(m) = &slot0 {
        return Ok(*m);
    }

    let mut ps = MIN_PAGE_SIZE as u64;
    while ps <= MAX_PAGE_SIZE as u64 {
        if len >= ps + META_PAGE_SIZE as u64 {
            let mut buf = vec![0u8; META_PAGE_SIZE];
            f.seek(SeekFrom::Start(ps))?;
            f.read_exact(&mut buf)?;
            if let Ok(m) = Meta::read(&buf) {
                if m.page_size as u64 == ps {
                    warn!("meta slot 0 invalid, recovered from slot 1 at {}", ps);
                    return Ok(m);
                }
            }
        }
        ps *= 2;
    }
    slot0
}

/// Map the whole file read-only. Transactions only dereference offsets
/// below their snapshot's high-water mark, which the copy-on-write
/// discipline keeps immutable for the mapping's lifetime.
pub(crate) fn map_file(file: &File) -> Result<Mapping> {
    // Safety: the mapping is read-only and the pages a snapshot can
    // reach are never rewritten while any transaction holds the Arc.
    let mmap = unsafe { memmap2::MmapOptions::new().map(file)? };
    Ok(Mapping::File(mmap))
}
