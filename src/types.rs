//! Shared value types and on-disk constants.
//!
//! Everything here is deliberately small: block geometry, the passed-by-value
//! datum representation for fixed-width columns, commit-sequence constants,
//! and the 64-bit downlink encoding shared by the builder and the readers.

use std::cmp::Ordering;

/// Size in bytes of one block, which is also the size of one B-tree page.
pub const BLCKSZ: usize = 8192;

/// Alignment of items, headers, and fixed-format fields inside a page.
pub const MAX_ALIGN: usize = 8;

/// Rounds `n` up to the next [`MAX_ALIGN`] boundary.
#[inline]
pub const fn max_align(n: usize) -> usize {
    (n + MAX_ALIGN - 1) & !(MAX_ALIGN - 1)
}

/// Aligns `off` up to `align`, which must be a power of two.
#[inline]
pub const fn align_up(off: usize, align: usize) -> usize {
    (off + align - 1) & !(align - 1)
}

/// Offset of an item inside a page, in bytes.
pub type LocationIndex = u16;

/// Block number inside one tag's file space.
pub type BlockNumber = u64;

/// Identifier of an in-memory page used by the descent fast path.
pub type InMemoryBlkno = u32;

/// Commit sequence number attached to MVCC versions.
pub type Csn = u64;

/// CSN marking permanently visible data, used for all pages a build emits.
pub const CSN_FROZEN: Csn = u64::MAX;

/// CSN placeholder for rows whose transaction has not committed.
pub const CSN_INPROGRESS: Csn = u64::MAX - 1;

/// Transaction identifier.
pub type Oxid = u64;

/// Transaction id stamped on tuples written by a bulk build.
pub const BOOTSTRAP_OXID: Oxid = 1;

/// Row lock strength recorded in a leaf tuple's transaction word.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RowLockMode {
    /// Shared row lock.
    Read = 0,
    /// Lock taken by a non-key update.
    NoKeyUpdate = 1,
    /// Lock taken by a key update or delete.
    Update = 2,
}

const XACT_INFO_OXID_MASK: u64 = (1 << 56) - 1;
const XACT_INFO_LOCK_SHIFT: u32 = 56;
const XACT_INFO_DELETED: u64 = 1 << 58;

/// Packs a transaction id, lock mode, and deleted flag into one word.
#[inline]
pub fn pack_xact_info(oxid: Oxid, lock: RowLockMode, deleted: bool) -> u64 {
    debug_assert!(oxid <= XACT_INFO_OXID_MASK);
    let mut info = oxid | ((lock as u64) << XACT_INFO_LOCK_SHIFT);
    if deleted {
        info |= XACT_INFO_DELETED;
    }
    info
}

/// Extracts the transaction id from a packed transaction word.
#[inline]
pub fn xact_info_oxid(info: u64) -> Oxid {
    info & XACT_INFO_OXID_MASK
}

/// Marker for an unset undo location.
pub const INVALID_UNDO_LOCATION: u64 = u64::MAX;

/// Relation identity: database oid plus relation file node.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct RelOids {
    /// Database oid.
    pub datoid: u32,
    /// Relation file node.
    pub relnode: u64,
}

/// Physical row address: heap block plus offset inside the block.
///
/// Ordering is block-major, matching the TID opclass.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct ItemPointer {
    /// Heap block number.
    pub block: u32,
    /// 1-based position within the block.
    pub offset: u16,
}

impl ItemPointer {
    /// Serialized size of an item pointer inside a fixed-format tuple.
    pub const LEN: usize = 6;

    /// Decodes an item pointer from its 6-byte on-page form.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let block = u32::from_le_bytes(bytes[0..4].try_into().expect("slice is 4 bytes"));
        let offset = u16::from_le_bytes(bytes[4..6].try_into().expect("slice is 2 bytes"));
        Self { block, offset }
    }

    /// Encodes the item pointer into its 6-byte on-page form.
    pub fn write_to(&self, dst: &mut [u8]) {
        dst[0..4].copy_from_slice(&self.block.to_le_bytes());
        dst[4..6].copy_from_slice(&self.offset.to_le_bytes());
    }
}

impl Ord for ItemPointer {
    fn cmp(&self, other: &Self) -> Ordering {
        self.block
            .cmp(&other.block)
            .then(self.offset.cmp(&other.offset))
    }
}

impl PartialOrd for ItemPointer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Fixed-width column value passed by register.
///
/// The bit pattern depends on the column kind: integers are stored
/// sign-extended into the low bits, floats as their IEEE-754 bits, item
/// pointers as `block << 16 | offset`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Datum(pub u64);

impl Datum {
    /// Wraps an object id.
    #[inline]
    pub fn from_oid(v: u32) -> Self {
        Datum(v as u64)
    }

    /// Wraps a 16-bit integer.
    #[inline]
    pub fn from_i16(v: i16) -> Self {
        Datum(v as u16 as u64)
    }

    /// Wraps a 32-bit integer.
    #[inline]
    pub fn from_i32(v: i32) -> Self {
        Datum(v as u32 as u64)
    }

    /// Wraps a 64-bit integer.
    #[inline]
    pub fn from_i64(v: i64) -> Self {
        Datum(v as u64)
    }

    /// Wraps a 32-bit float by bit pattern.
    #[inline]
    pub fn from_f32(v: f32) -> Self {
        Datum(v.to_bits() as u64)
    }

    /// Wraps a 64-bit float by bit pattern.
    #[inline]
    pub fn from_f64(v: f64) -> Self {
        Datum(v.to_bits())
    }

    /// Wraps an item pointer.
    #[inline]
    pub fn from_item_pointer(v: ItemPointer) -> Self {
        Datum(((v.block as u64) << 16) | v.offset as u64)
    }

    /// Reads back an object id.
    #[inline]
    pub fn as_oid(self) -> u32 {
        self.0 as u32
    }

    /// Reads back a 16-bit integer.
    #[inline]
    pub fn as_i16(self) -> i16 {
        self.0 as u16 as i16
    }

    /// Reads back a 32-bit integer.
    #[inline]
    pub fn as_i32(self) -> i32 {
        self.0 as u32 as i32
    }

    /// Reads back a 64-bit integer.
    #[inline]
    pub fn as_i64(self) -> i64 {
        self.0 as i64
    }

    /// Reads back a 32-bit float.
    #[inline]
    pub fn as_f32(self) -> f32 {
        f32::from_bits(self.0 as u32)
    }

    /// Reads back a 64-bit float.
    #[inline]
    pub fn as_f64(self) -> f64 {
        f64::from_bits(self.0)
    }

    /// Reads back an item pointer.
    #[inline]
    pub fn as_item_pointer(self) -> ItemPointer {
        ItemPointer {
            block: (self.0 >> 16) as u32,
            offset: self.0 as u16,
        }
    }
}

/// Compares two 32-bit floats under btree opclass semantics: NaN sorts
/// greater than every non-NaN value, and NaNs compare equal to each other.
#[inline]
pub fn cmp_f32(a: f32, b: f32) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => a.partial_cmp(&b).expect("non-NaN floats are ordered"),
    }
}

/// Compares two 64-bit floats under btree opclass semantics (NaN greatest).
#[inline]
pub fn cmp_f64(a: f64, b: f64) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => a.partial_cmp(&b).expect("non-NaN floats are ordered"),
    }
}

/// Column datatype of an index field.
///
/// The first six kinds are fixed-width and form the closed set eligible for
/// the fixed-stride descent fast path. `Int16` exists for the synthesized
/// TOAST sort columns; `Bytes` is a variable-length payload column and can
/// never be a key.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ColumnKind {
    /// Object identifier, unsigned 32-bit.
    Oid,
    /// Signed 32-bit integer.
    Int32,
    /// Signed 64-bit integer.
    Int64,
    /// IEEE-754 single-precision float.
    Float32,
    /// IEEE-754 double-precision float.
    Float64,
    /// Physical row address.
    ItemPointer,
    /// Signed 16-bit integer.
    Int16,
    /// Variable-length byte payload.
    Bytes,
}

impl ColumnKind {
    /// Stored width of the column, or `None` for variable-length kinds.
    pub fn fixed_len(self) -> Option<usize> {
        match self {
            ColumnKind::Oid | ColumnKind::Int32 | ColumnKind::Float32 => Some(4),
            ColumnKind::Int64 | ColumnKind::Float64 => Some(8),
            ColumnKind::ItemPointer => Some(ItemPointer::LEN),
            ColumnKind::Int16 => Some(2),
            ColumnKind::Bytes => None,
        }
    }

    /// Required alignment of the column's stored form.
    pub fn align(self) -> usize {
        match self {
            ColumnKind::Oid | ColumnKind::Int32 | ColumnKind::Float32 => 4,
            ColumnKind::Int64 | ColumnKind::Float64 => 8,
            ColumnKind::ItemPointer | ColumnKind::Int16 => 2,
            ColumnKind::Bytes => 4,
        }
    }

    /// True for kinds the fixed-stride fast path can search.
    pub fn supports_stride_search(self) -> bool {
        !matches!(self, ColumnKind::Int16 | ColumnKind::Bytes)
    }

    /// Compares two datums of this kind. Must not be called for `Bytes`.
    pub fn compare_datums(self, a: Datum, b: Datum) -> Ordering {
        match self {
            ColumnKind::Oid => a.as_oid().cmp(&b.as_oid()),
            ColumnKind::Int16 => a.as_i16().cmp(&b.as_i16()),
            ColumnKind::Int32 => a.as_i32().cmp(&b.as_i32()),
            ColumnKind::Int64 => a.as_i64().cmp(&b.as_i64()),
            ColumnKind::Float32 => cmp_f32(a.as_f32(), b.as_f32()),
            ColumnKind::Float64 => cmp_f64(a.as_f64(), b.as_f64()),
            ColumnKind::ItemPointer => a.as_item_pointer().cmp(&b.as_item_pointer()),
            ColumnKind::Bytes => {
                debug_assert!(false, "byte columns are not comparable by datum");
                Ordering::Equal
            }
        }
    }

    /// Reads a datum of this kind from its stored little-endian form.
    pub fn read_datum(self, bytes: &[u8]) -> Datum {
        match self {
            ColumnKind::Oid => Datum::from_oid(u32::from_le_bytes(
                bytes[0..4].try_into().expect("slice is 4 bytes"),
            )),
            ColumnKind::Int16 => Datum::from_i16(i16::from_le_bytes(
                bytes[0..2].try_into().expect("slice is 2 bytes"),
            )),
            ColumnKind::Int32 => Datum::from_i32(i32::from_le_bytes(
                bytes[0..4].try_into().expect("slice is 4 bytes"),
            )),
            ColumnKind::Int64 => Datum::from_i64(i64::from_le_bytes(
                bytes[0..8].try_into().expect("slice is 8 bytes"),
            )),
            ColumnKind::Float32 => Datum(u32::from_le_bytes(
                bytes[0..4].try_into().expect("slice is 4 bytes"),
            ) as u64),
            ColumnKind::Float64 => Datum(u64::from_le_bytes(
                bytes[0..8].try_into().expect("slice is 8 bytes"),
            )),
            ColumnKind::ItemPointer => Datum::from_item_pointer(ItemPointer::from_bytes(bytes)),
            ColumnKind::Bytes => {
                debug_assert!(false, "byte columns have no datum form");
                Datum::default()
            }
        }
    }

    /// Writes a datum of this kind in its stored little-endian form.
    pub fn write_datum(self, datum: Datum, dst: &mut [u8]) {
        match self {
            ColumnKind::Oid => dst[0..4].copy_from_slice(&datum.as_oid().to_le_bytes()),
            ColumnKind::Int16 => dst[0..2].copy_from_slice(&datum.as_i16().to_le_bytes()),
            ColumnKind::Int32 => dst[0..4].copy_from_slice(&datum.as_i32().to_le_bytes()),
            ColumnKind::Int64 => dst[0..8].copy_from_slice(&datum.as_i64().to_le_bytes()),
            ColumnKind::Float32 => dst[0..4].copy_from_slice(&(datum.0 as u32).to_le_bytes()),
            ColumnKind::Float64 => dst[0..8].copy_from_slice(&datum.0.to_le_bytes()),
            ColumnKind::ItemPointer => datum.as_item_pointer().write_to(dst),
            ColumnKind::Bytes => debug_assert!(false, "byte columns have no datum form"),
        }
    }
}

/// 64-bit reference from a non-leaf item to a child page.
///
/// The high bit distinguishes on-disk references (checkpoint number plus
/// block within the data file) from in-memory block numbers. The bulk
/// builder emits on-disk downlinks exclusively.
pub type Downlink = u64;

const DOWNLINK_DISK_BIT: u64 = 1 << 63;
const DOWNLINK_BLOCK_BITS: u32 = 48;
const DOWNLINK_BLOCK_MASK: u64 = (1 << DOWNLINK_BLOCK_BITS) - 1;

/// Downlink value that refers to nothing.
pub const INVALID_DOWNLINK: Downlink = u64::MAX;

/// Builds an on-disk downlink from a checkpoint number and block number.
#[inline]
pub fn make_disk_downlink(checkpoint_num: u32, block: BlockNumber) -> Downlink {
    debug_assert!(block <= DOWNLINK_BLOCK_MASK);
    debug_assert!(checkpoint_num < (1 << 15));
    DOWNLINK_DISK_BIT | ((checkpoint_num as u64) << DOWNLINK_BLOCK_BITS) | block
}

/// True when the downlink refers to an on-disk page.
#[inline]
pub fn downlink_is_disk(downlink: Downlink) -> bool {
    downlink != INVALID_DOWNLINK && downlink & DOWNLINK_DISK_BIT != 0
}

/// Extracts the block number from an on-disk downlink.
#[inline]
pub fn disk_downlink_block(downlink: Downlink) -> BlockNumber {
    debug_assert!(downlink_is_disk(downlink));
    downlink & DOWNLINK_BLOCK_MASK
}

/// Extracts the checkpoint number from an on-disk downlink.
#[inline]
pub fn disk_downlink_checkpoint(downlink: Downlink) -> u32 {
    debug_assert!(downlink_is_disk(downlink));
    ((downlink >> DOWNLINK_BLOCK_BITS) & 0x7FFF) as u32
}
