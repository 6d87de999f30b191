//! Central constants for the on-disk format and engine limits.

/// 32-bit marker at the head of every meta page.
pub const MAGIC: u32 = 0xED0C_DAED;

/// On-disk format version.
pub const VERSION: u32 = 2;

/// Fixed page header: id u64 | flags u16 | count u16 | overflow u32.
pub const PAGE_HEADER_SIZE: usize = 16;

/// Branch element: pos u32 | ksize u32 | pgid u64.
pub const BRANCH_ELEM_SIZE: usize = 16;

/// Leaf element: flags u32 | pos u32 | ksize u32 | vsize u32.
pub const LEAF_ELEM_SIZE: usize = 16;

/// Bucket header stored in a bucket-flagged leaf value: root u64 | sequence u64.
pub const BUCKET_HEADER_SIZE: usize = 16;

/// Meta payload ends at this page offset; the u64 checksum follows.
pub const META_CHECKSUM_OFFSET: usize = 72;

/// Serialized meta page length (header + payload + checksum).
pub const META_PAGE_SIZE: usize = 80;

/// Largest accepted key, in bytes. A 32768-byte key is rejected.
pub const MAX_KEY_SIZE: usize = 32767;

/// Largest accepted value, in bytes.
pub const MAX_VALUE_SIZE: usize = (1 << 31) - 2;

/// Freelist page count field saturates here; the real count moves into
/// the first u64 of the payload.
pub const FREELIST_COUNT_OVERFLOW: usize = 0xFFFF;

/// Page size bounds for database creation (power of two required).
pub const MIN_PAGE_SIZE: u32 = 512;
pub const MAX_PAGE_SIZE: u32 = 65536;

/// Split point fraction of a page during spill, and its clamp range.
pub const DEFAULT_FILL_PERCENT: f32 = 0.5;
pub const MIN_FILL_PERCENT: f32 = 0.1;
pub const MAX_FILL_PERCENT: f32 = 1.0;

/// A node with fewer keys than this (per kind) is merged on rebalance.
pub const MIN_KEYS_PER_BRANCH: usize = 2;
pub const MIN_KEYS_PER_LEAF: usize = 1;

/// Nodes are split only while they hold more than twice this many keys.
pub const MIN_KEYS_PER_PAGE: usize = 2;

/// File/mapping growth: double from 32 KiB up to 1 GiB, then 1 GiB steps.
pub const MIN_GROW_SIZE: u64 = 1 << 15;
pub const MAX_GROW_STEP: u64 = 1 << 30;

/// Number of pages in a freshly initialized database
/// (meta0, meta1, freelist, root leaf).
pub const INIT_PAGE_COUNT: u64 = 4;
