//! On-page layout of B-tree nodes.
//!
//! A page is one 8 KiB block formatted as: a 48-byte header, a chunk
//! directory, the high-key region, then the item area. Chunks partition the
//! page's items so a search touches one cacheline-dense offset table instead
//! of the whole page. Layout summary, offsets relative to page start:
//!
//! ```text
//! [ header 48 ][ chunk directory 8*chunks ][ hikeys .. hikeys_end ][ items .. data_size ][ free ]
//! ```
//!
//! Item offsets inside a chunk are stored relative to the chunk start with
//! the tuple's format flags packed into the low three bits (offsets are
//! always MAXALIGNed). The header's first word is the page state: a
//! monotonically increasing change count observed by lock-free readers, plus
//! a read-blocked flag bit.

pub mod chunks;
pub mod inmem;
pub mod split;

use crate::error::{EngineError, Result};
use crate::types::{max_align, Csn, Downlink, LocationIndex, BLCKSZ, CSN_FROZEN};

/// Size of the fixed page header.
pub const PAGE_HEADER_LEN: usize = 48;

/// Size of one chunk directory entry.
pub const CHUNK_DESC_LEN: usize = 8;

/// Hard cap on chunks per page.
pub const MAX_PAGE_CHUNKS: usize = 32;

/// Target byte size of one chunk's offset table plus items.
pub const CHUNK_SIZE_TARGET: usize = 512;

/// Leaf page flag.
pub const PAGE_FLAG_LEAF: u16 = 0x01;
/// Set on the rightmost page of a level; such pages have no high key.
pub const PAGE_FLAG_RIGHTMOST: u16 = 0x02;
/// Set on the leftmost page of a level.
pub const PAGE_FLAG_LEFTMOST: u16 = 0x04;
/// Every chunk high key occupies exactly the fixed key stride.
pub const PAGE_FLAG_HIKEYS_FIXED: u16 = 0x08;
/// Marks a root page that is also a leaf.
pub const PAGE_FLAG_ROOT_INIT: u16 = 0x10;

/// Mask of the change-count bits in the page state word.
pub const PAGE_STATE_CHANGE_COUNT_MASK: u64 = 0xFFFF_FFFF;
/// State bit set while a writer blocks lock-free readers.
pub const PAGE_STATE_READ_BLOCKED: u64 = 1 << 32;

/// Right-link value meaning "no right sibling".
pub const INVALID_RIGHT_LINK: u64 = u64::MAX;

/// Size of a leaf item's tuple header (transaction word + undo location).
pub const LEAF_TUPLE_HEADER_LEN: usize = 16;

/// Size of a non-leaf item's tuple header (the downlink).
pub const NONLEAF_TUPLE_HEADER_LEN: usize = 8;

const OFF_STATE: usize = 0;
const OFF_CSN: usize = 8;
const OFF_RIGHT_LINK: usize = 16;
const OFF_CHECKPOINT_NUM: usize = 24;
const OFF_FLAGS: usize = 28;
const OFF_LEVEL: usize = 30;
const OFF_ITEMS_COUNT: usize = 32;
const OFF_CHUNKS_COUNT: usize = 34;
const OFF_DATA_SIZE: usize = 36;
const OFF_HIKEYS_END: usize = 38;
const OFF_MAX_KEY_LEN: usize = 40;
const OFF_N_ONDISK: usize = 42;

const ITEM_FLAGS_MASK: u16 = 0x7;

/// Owned 8 KiB page image.
pub type PageBuf = Box<[u8; BLCKSZ]>;

/// Allocates a zeroed page image.
pub fn new_page_buf() -> PageBuf {
    vec![0u8; BLCKSZ]
        .into_boxed_slice()
        .try_into()
        .expect("vec has BLCKSZ bytes")
}

#[inline]
fn read_u16(img: &[u8], off: usize) -> u16 {
    u16::from_le_bytes(img[off..off + 2].try_into().expect("slice is 2 bytes"))
}

#[inline]
fn write_u16(img: &mut [u8], off: usize, value: u16) {
    img[off..off + 2].copy_from_slice(&value.to_le_bytes());
}

#[inline]
fn read_u32(img: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(img[off..off + 4].try_into().expect("slice is 4 bytes"))
}

#[inline]
fn read_u64(img: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(img[off..off + 8].try_into().expect("slice is 8 bytes"))
}

#[inline]
fn write_u64(img: &mut [u8], off: usize, value: u64) {
    img[off..off + 8].copy_from_slice(&value.to_le_bytes());
}

/// Reads the page state word.
#[inline]
pub fn page_state(img: &[u8]) -> u64 {
    read_u64(img, OFF_STATE)
}

/// Change-count portion of the page state.
#[inline]
pub fn page_change_count(img: &[u8]) -> u64 {
    page_state(img) & PAGE_STATE_CHANGE_COUNT_MASK
}

/// True when the state word blocks lock-free reads.
#[inline]
pub fn state_read_is_blocked(state: u64) -> bool {
    state & PAGE_STATE_READ_BLOCKED != 0
}

/// Increments the page's change count; called by every mutator.
pub fn bump_change_count(img: &mut [u8]) {
    let state = page_state(img);
    let count = ((state & PAGE_STATE_CHANGE_COUNT_MASK) + 1) & PAGE_STATE_CHANGE_COUNT_MASK;
    write_u64(img, OFF_STATE, (state & !PAGE_STATE_CHANGE_COUNT_MASK) | count);
}

/// Page flag accessors.
#[inline]
pub fn page_flags(img: &[u8]) -> u16 {
    read_u16(img, OFF_FLAGS)
}

/// Replaces the page flags.
#[inline]
pub fn set_page_flags(img: &mut [u8], flags: u16) {
    write_u16(img, OFF_FLAGS, flags);
}

/// True when `flag` is set on the page.
#[inline]
pub fn page_is(img: &[u8], flag: u16) -> bool {
    page_flags(img) & flag != 0
}

/// B-tree level of the page; zero for leaves.
#[inline]
pub fn page_level(img: &[u8]) -> u8 {
    img[OFF_LEVEL]
}

/// Number of items stored on the page.
#[inline]
pub fn page_items_count(img: &[u8]) -> usize {
    read_u16(img, OFF_ITEMS_COUNT) as usize
}

/// Number of chunks on the page.
#[inline]
pub fn page_chunks_count(img: &[u8]) -> usize {
    read_u16(img, OFF_CHUNKS_COUNT) as usize
}

/// Absolute end offset of the item area.
#[inline]
pub fn page_data_size(img: &[u8]) -> usize {
    read_u16(img, OFF_DATA_SIZE) as usize
}

/// Absolute end offset of the high-key region.
#[inline]
pub fn page_hikeys_end(img: &[u8]) -> usize {
    read_u16(img, OFF_HIKEYS_END) as usize
}

/// Bytes still available in the item area.
#[inline]
pub fn page_free_space(img: &[u8]) -> usize {
    BLCKSZ - page_data_size(img)
}

/// Records the count of items carrying on-disk downlinks.
pub fn set_page_n_ondisk(img: &mut [u8], n: usize) {
    write_u16(img, OFF_N_ONDISK, n as u16);
}

/// Count of items carrying on-disk downlinks.
pub fn page_n_ondisk(img: &[u8]) -> usize {
    read_u16(img, OFF_N_ONDISK) as usize
}

/// Decoded page header, for callers that want every field at once.
#[derive(Clone, Debug)]
pub struct PageHeader {
    /// State word (change count + reader-blocking flag).
    pub state: u64,
    /// Commit sequence number of the page contents.
    pub csn: Csn,
    /// Right sibling link, or [`INVALID_RIGHT_LINK`].
    pub right_link: u64,
    /// Checkpoint the page image belongs to.
    pub checkpoint_num: u32,
    /// Page flags.
    pub flags: u16,
    /// Tree level.
    pub level: u8,
    /// Item count.
    pub items_count: u16,
    /// Chunk count.
    pub chunks_count: u16,
    /// Absolute end of the item area.
    pub data_size: u16,
    /// Absolute end of the high-key region.
    pub hikeys_end: u16,
    /// Largest key length observed on the page.
    pub max_key_len: u16,
    /// Items with on-disk downlinks.
    pub n_ondisk: u16,
}

impl PageHeader {
    /// Decodes and validates the header of `img`.
    pub fn parse(img: &[u8]) -> Result<Self> {
        if img.len() != BLCKSZ {
            return Err(EngineError::Corruption(
                "page image is not exactly one block".into(),
            ));
        }
        let header = Self {
            state: read_u64(img, OFF_STATE),
            csn: read_u64(img, OFF_CSN),
            right_link: read_u64(img, OFF_RIGHT_LINK),
            checkpoint_num: read_u32(img, OFF_CHECKPOINT_NUM),
            flags: read_u16(img, OFF_FLAGS),
            level: img[OFF_LEVEL],
            items_count: read_u16(img, OFF_ITEMS_COUNT),
            chunks_count: read_u16(img, OFF_CHUNKS_COUNT),
            data_size: read_u16(img, OFF_DATA_SIZE),
            hikeys_end: read_u16(img, OFF_HIKEYS_END),
            max_key_len: read_u16(img, OFF_MAX_KEY_LEN),
            n_ondisk: read_u16(img, OFF_N_ONDISK),
        };
        let dir_end = PAGE_HEADER_LEN + header.chunks_count as usize * CHUNK_DESC_LEN;
        if header.chunks_count == 0 || header.chunks_count as usize > MAX_PAGE_CHUNKS {
            return Err(EngineError::Corruption(
                "page chunk count out of range".into(),
            ));
        }
        if (header.hikeys_end as usize) < dir_end || header.hikeys_end > header.data_size {
            return Err(EngineError::Corruption(
                "page hikeys region out of range".into(),
            ));
        }
        if header.data_size as usize > BLCKSZ {
            return Err(EngineError::Corruption(
                "page data size beyond block".into(),
            ));
        }
        Ok(header)
    }
}

/// One chunk directory entry.
#[derive(Clone, Copy, Debug)]
pub struct ChunkDesc {
    /// Absolute offset of the chunk's offset table.
    pub location: u16,
    /// Absolute offset of the chunk's high key.
    pub hikey_location: u16,
    /// Format flags of the chunk's high key.
    pub hikey_flags: u8,
    /// Index of the chunk's first item among all page items.
    pub offset: u16,
    /// True when every key in the chunk occupies the fixed stride.
    pub keys_fixed: bool,
}

const CHUNK_FLAG_KEYS_FIXED: u16 = 0x1;

/// Reads chunk descriptor `idx`.
pub fn chunk_desc(img: &[u8], idx: usize) -> ChunkDesc {
    debug_assert!(idx < page_chunks_count(img));
    let base = PAGE_HEADER_LEN + idx * CHUNK_DESC_LEN;
    let hikey_raw = read_u16(img, base + 2);
    ChunkDesc {
        location: read_u16(img, base),
        hikey_location: hikey_raw & !ITEM_FLAGS_MASK,
        hikey_flags: (hikey_raw & ITEM_FLAGS_MASK) as u8,
        offset: read_u16(img, base + 4),
        keys_fixed: read_u16(img, base + 6) & CHUNK_FLAG_KEYS_FIXED != 0,
    }
}

/// Writes chunk descriptor `idx`.
pub fn write_chunk_desc(img: &mut [u8], idx: usize, desc: &ChunkDesc) {
    debug_assert!(desc.hikey_location & ITEM_FLAGS_MASK == 0);
    let base = PAGE_HEADER_LEN + idx * CHUNK_DESC_LEN;
    write_u16(img, base, desc.location);
    write_u16(
        img,
        base + 2,
        desc.hikey_location | desc.hikey_flags as u16,
    );
    write_u16(img, base + 4, desc.offset);
    write_u16(
        img,
        base + 6,
        if desc.keys_fixed { CHUNK_FLAG_KEYS_FIXED } else { 0 },
    );
}

/// Initializes `img` as an empty page with a single chunk.
pub fn init_page(img: &mut [u8], flags: u16, level: u8) {
    let prev_state = page_state(img);
    img.fill(0);
    write_u64(img, OFF_STATE, prev_state);
    write_u64(img, OFF_CSN, CSN_FROZEN);
    write_u64(img, OFF_RIGHT_LINK, INVALID_RIGHT_LINK);
    write_u16(img, OFF_FLAGS, flags);
    img[OFF_LEVEL] = level;
    write_u16(img, OFF_CHUNKS_COUNT, 1);
    let hikeys_end = max_align(PAGE_HEADER_LEN + CHUNK_DESC_LEN);
    write_u16(img, OFF_HIKEYS_END, hikeys_end as u16);
    write_u16(img, OFF_DATA_SIZE, hikeys_end as u16);
    write_chunk_desc(
        img,
        0,
        &ChunkDesc {
            location: hikeys_end as u16,
            hikey_location: hikeys_end as u16,
            hikey_flags: 0,
            offset: 0,
            keys_fixed: false,
        },
    );
    bump_change_count(img);
}

/// Sets header fields mutated between init and write-out.
pub fn set_page_counts(img: &mut [u8], items: usize, data_size: usize) {
    write_u16(img, OFF_ITEMS_COUNT, items as u16);
    write_u16(img, OFF_DATA_SIZE, data_size as u16);
}

pub(crate) fn set_page_hikeys_end(img: &mut [u8], end: usize) {
    write_u16(img, OFF_HIKEYS_END, end as u16);
}

pub(crate) fn set_page_chunks_count(img: &mut [u8], count: usize) {
    write_u16(img, OFF_CHUNKS_COUNT, count as u16);
}

pub(crate) fn set_page_max_key_len(img: &mut [u8], len: usize) {
    write_u16(img, OFF_MAX_KEY_LEN, len as u16);
}

/// Packs an in-chunk item offset with its format flags.
#[inline]
pub fn pack_item_offset(off: usize, flags: u8) -> LocationIndex {
    debug_assert!(off % crate::types::MAX_ALIGN == 0);
    debug_assert!(flags as u16 & !ITEM_FLAGS_MASK == 0);
    off as u16 | flags as u16
}

/// Splits a packed in-chunk offset entry into offset and flags.
#[inline]
pub fn unpack_item_offset(packed: LocationIndex) -> (usize, u8) {
    (
        (packed & !ITEM_FLAGS_MASK) as usize,
        (packed & ITEM_FLAGS_MASK) as u8,
    )
}

/// Header of a leaf item: transaction word plus undo location.
#[derive(Clone, Copy, Debug)]
pub struct LeafTupleHeader {
    /// Packed transaction info (oxid, lock mode, deleted flag).
    pub xact_info: u64,
    /// Undo log position, or [`crate::types::INVALID_UNDO_LOCATION`].
    pub undo_location: u64,
}

impl LeafTupleHeader {
    /// Encodes the header into its 16-byte stored form.
    pub fn write_to(&self, dst: &mut [u8]) {
        dst[0..8].copy_from_slice(&self.xact_info.to_le_bytes());
        dst[8..16].copy_from_slice(&self.undo_location.to_le_bytes());
    }

    /// Decodes a header from a leaf item's leading bytes.
    pub fn parse(bytes: &[u8]) -> Self {
        Self {
            xact_info: u64::from_le_bytes(bytes[0..8].try_into().expect("slice is 8 bytes")),
            undo_location: u64::from_le_bytes(bytes[8..16].try_into().expect("slice is 8 bytes")),
        }
    }
}

/// Header of a non-leaf item: the downlink to the child page.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct NonLeafTupleHeader {
    /// Child reference.
    pub downlink: Downlink,
}

impl NonLeafTupleHeader {
    /// Encodes the header into its 8-byte stored form.
    pub fn write_to(&self, dst: &mut [u8]) {
        dst[0..8].copy_from_slice(&self.downlink.to_le_bytes());
    }

    /// Decodes a header from a non-leaf item's leading bytes.
    pub fn parse(bytes: &[u8]) -> Self {
        Self {
            downlink: u64::from_le_bytes(bytes[0..8].try_into().expect("slice is 8 bytes")),
        }
    }
}

/// Copies the right-link field.
#[inline]
pub fn page_right_link(img: &[u8]) -> u64 {
    read_u64(img, OFF_RIGHT_LINK)
}

/// CSN recorded on the page.
#[inline]
pub fn page_csn(img: &[u8]) -> Csn {
    read_u64(img, OFF_CSN)
}
