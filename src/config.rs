//! Centralized configuration and builder.
//!
//! Single place for tunables instead of scattered env lookups.
//! `Config::from_env()` reads the `BURROW_*` variables; the fluent
//! `with_*` setters override specific fields.

use crate::consts::{DEFAULT_FILL_PERCENT, MAX_FILL_PERCENT, MIN_FILL_PERCENT};

/// Top-level configuration for a database handle.
#[derive(Clone, Debug)]
pub struct Config {
    /// Page size used when creating a new database file. `None` means the
    /// OS page size. Ignored when opening an existing file (the size is
    /// read from the meta page).
    /// Env: BURROW_PAGE_SIZE
    pub page_size: Option<u32>,

    /// Open with a shared lock; writable transactions are refused.
    /// Env: BURROW_READ_ONLY ("1|true|on|yes" => true)
    pub read_only: bool,

    /// Whether commit fsyncs the data and meta phases. Disabling trades
    /// durability for speed; the file stays consistent, but the last
    /// transactions may be lost on power failure.
    /// Env: BURROW_DATA_FSYNC (default true; "0|false|off|no" => false)
    pub data_fsync: bool,

    /// Split-point fraction of a page during spill, clamped to [0.1, 1.0].
    /// Env: BURROW_FILL_PERCENT
    pub fill_percent: f32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            page_size: None,
            read_only: false,
            data_fsync: true,
            fill_percent: DEFAULT_FILL_PERCENT,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("BURROW_PAGE_SIZE") {
            if let Ok(n) = v.trim().parse::<u32>() {
                cfg.page_size = Some(n);
            }
        }

        if let Ok(v) = std::env::var("BURROW_READ_ONLY") {
            let s = v.trim().to_ascii_lowercase();
            cfg.read_only = s == "1" || s == "true" || s == "on" || s == "yes";
        }

        if let Ok(v) = std::env::var("BURROW_DATA_FSYNC") {
            let s = v.trim().to_ascii_lowercase();
            cfg.data_fsync = !(s == "0" || s == "false" || s == "off" || s == "no");
        }

        if let Ok(v) = std::env::var("BURROW_FILL_PERCENT") {
            if let Ok(f) = v.trim().parse::<f32>() {
                cfg.fill_percent = f;
            }
        }

        cfg
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = Some(page_size);
        self
    }

    pub fn with_read_only(mut self, on: bool) -> Self {
        self.read_only = on;
        self
    }

    pub fn with_data_fsync(mut self, on: bool) -> Self {
        self.data_fsync = on;
        self
    }

    pub fn with_fill_percent(mut self, fill: f32) -> Self {
        self.fill_percent = fill;
        self
    }

    /// Fill percent clamped to its legal range.
    pub(crate) fn clamped_fill_percent(&self) -> f32 {
        self.fill_percent.clamp(MIN_FILL_PERCENT, MAX_FILL_PERCENT)
    }
}
