//! Fixed-stride intra-page downlink search.
//!
//! The fast path finds a downlink without decoding tuples or copying chunk
//! contents: when every non-leaf key attribute is fixed width and the page
//! layout is stride-regular, the high-key region and a chunk's key array can
//! be binary-searched as flat arrays. Each phase is bracketed by snapshots
//! of the live page's state word; any change count movement or a raised
//! read-blocked flag turns the result into `Retry`, and any layout the
//! stride formulas cannot describe falls back to `Slowpath`.

use lru::LruCache;
use std::num::NonZeroUsize;

use crate::btree::find::{
    decompose_key, BTreeKey, KEY_FLAG_MINUS_INF, KEY_FLAG_PLUS_INF, SEARCH_MAX_KEYS,
};
use crate::descr::IndexDescriptor;
use crate::error::Result;
use crate::page::chunks::ItemLocator;
use crate::page::inmem::InMemoryPage;
use crate::page::{
    chunk_desc, page_change_count, page_chunks_count, page_hikeys_end, page_is,
    state_read_is_blocked, NonLeafTupleHeader, NONLEAF_TUPLE_HEADER_LEN,
    PAGE_FLAG_HIKEYS_FIXED, PAGE_FLAG_RIGHTMOST, PAGE_STATE_CHANGE_COUNT_MASK,
};
use crate::types::{cmp_f32, cmp_f64, max_align, ColumnKind, Datum, InMemoryBlkno, ItemPointer};

/// Maximum key attributes the fast path can search.
pub const FASTPATH_MAX_KEYS: usize = SEARCH_MAX_KEYS;

/// A stride search narrows `[lower, upper)` to the run of array elements
/// equal to `key`, given elements of one type laid out `stride` bytes apart.
pub type StrideSearchFn = fn(&[u8], usize, &mut usize, &mut usize, Datum);

/// Outcome of a fast-path search.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FastpathResult<T> {
    /// The search completed; the payload is valid.
    Found(T),
    /// The page changed underneath the search; re-copy and retry.
    Retry,
    /// Unreachable; defined for parity with the outcome set.
    Failure,
    /// The layout declined the fast path; use the generic search.
    Slowpath,
}

struct StrideSearchDesc {
    kind: ColumnKind,
    len: usize,
    align: usize,
    func: StrideSearchFn,
}

static STRIDE_SEARCH_DESCS: [StrideSearchDesc; 6] = [
    StrideSearchDesc {
        kind: ColumnKind::Oid,
        len: 4,
        align: 4,
        func: oid_stride_search,
    },
    StrideSearchDesc {
        kind: ColumnKind::Int32,
        len: 4,
        align: 4,
        func: int32_stride_search,
    },
    StrideSearchDesc {
        kind: ColumnKind::Int64,
        len: 8,
        align: 8,
        func: int64_stride_search,
    },
    StrideSearchDesc {
        kind: ColumnKind::Float32,
        len: 4,
        align: 4,
        func: float32_stride_search,
    },
    StrideSearchDesc {
        kind: ColumnKind::Float64,
        len: 8,
        align: 8,
        func: float64_stride_search,
    },
    StrideSearchDesc {
        kind: ColumnKind::ItemPointer,
        len: ItemPointer::LEN,
        align: 2,
        func: tid_stride_search,
    },
];

fn stride_search_desc(kind: ColumnKind) -> Option<&'static StrideSearchDesc> {
    STRIDE_SEARCH_DESCS.iter().find(|d| d.kind == kind)
}

/// What the descent is doing; only point fetches take the fast path.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SearchPurpose {
    /// Point fetch of a single key.
    Fetch,
    /// Range scan positioning.
    Scan,
}

/// Decomposed search state for fast-path descents.
///
/// Built once per descent by [`can_fastpath_find_downlink`] and reused for
/// every page along the way; carries a one-entry chunk cache keyed by
/// `(blkno, change count)`.
#[derive(Clone, Debug)]
pub struct FastpathMeta {
    /// False when the fast path cannot serve this search at all.
    pub enabled: bool,
    inclusive: bool,
    num_keys: usize,
    /// Key stride inside item and hikey arrays.
    length: usize,
    offsets: [usize; FASTPATH_MAX_KEYS],
    funcs: [StrideSearchFn; FASTPATH_MAX_KEYS],
    values: [Datum; FASTPATH_MAX_KEYS],
    flags: [u8; FASTPATH_MAX_KEYS],
    cache_valid: bool,
    cached_blkno: InMemoryBlkno,
    cached_change_count: u64,
    cached_chunk: usize,
}

impl FastpathMeta {
    /// Meta that always declines.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            inclusive: false,
            num_keys: 0,
            length: 0,
            offsets: [0; FASTPATH_MAX_KEYS],
            funcs: [noop_stride_search; FASTPATH_MAX_KEYS],
            values: [Datum::default(); FASTPATH_MAX_KEYS],
            flags: [0; FASTPATH_MAX_KEYS],
            cache_valid: false,
            cached_blkno: 0,
            cached_change_count: 0,
            cached_chunk: 0,
        }
    }
}

fn noop_stride_search(_: &[u8], _: usize, _: &mut usize, _: &mut usize, _: Datum) {}

/// LRU cache of chunk positions for hot pages, validated by change count.
///
/// Entries are only meaningful for descents with the same search key, so a
/// cache belongs to one cursor; repeated descents after `Retry` are the
/// intended hit case.
pub struct FastpathChunkCache {
    entries: LruCache<InMemoryBlkno, (u64, usize)>,
}

impl FastpathChunkCache {
    /// Cache remembering up to `capacity` pages.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: LruCache::new(
                NonZeroUsize::new(capacity.max(1)).expect("capacity is at least one"),
            ),
        }
    }

    /// Cached chunk index for `blkno` at exactly `change_count`.
    pub fn lookup(&mut self, blkno: InMemoryBlkno, change_count: u64) -> Option<usize> {
        match self.entries.get(&blkno) {
            Some((cc, chunk)) if *cc == change_count => Some(*chunk),
            _ => None,
        }
    }

    /// Records the chunk index found for `blkno` at `change_count`.
    pub fn insert(&mut self, blkno: InMemoryBlkno, change_count: u64, chunk: usize) {
        self.entries.put(blkno, (change_count, chunk));
    }
}

/// Decides whether the fast path applies to this search and, if so, builds
/// the per-attribute search plan.
///
/// Requirements: a point fetch; at most [`FASTPATH_MAX_KEYS`] key
/// attributes, all pure fixed-format, all from the supported type set with
/// default (ascending) ordering; and a key that decomposes into datums and
/// ±∞ markers.
pub fn can_fastpath_find_downlink(
    desc: &IndexDescriptor,
    key: BTreeKey<'_>,
    purpose: SearchPurpose,
) -> Result<FastpathMeta> {
    if purpose != SearchPurpose::Fetch {
        return Ok(FastpathMeta::disabled());
    }
    if desc.nonleaf_tupdesc.natts() > FASTPATH_MAX_KEYS || !desc.nonleaf_fixed() {
        return Ok(FastpathMeta::disabled());
    }

    let mut meta = FastpathMeta::disabled();
    let Some(dec) = decompose_key(desc, key)? else {
        return Ok(meta);
    };
    meta.num_keys = dec.num_keys;
    meta.inclusive = dec.inclusive;
    meta.values = dec.values;
    meta.flags = dec.flags;

    let mut offset = 0usize;
    for i in 0..meta.num_keys {
        let field = &desc.fields[i];
        let Some(search) = stride_search_desc(field.kind) else {
            return Ok(FastpathMeta::disabled());
        };
        if !field.ascending {
            return Ok(FastpathMeta::disabled());
        }
        offset = crate::types::align_up(offset, search.align);
        meta.offsets[i] = offset;
        meta.funcs[i] = search.func;
        offset += search.len;
    }

    meta.length = max_align(desc.nonleaf_spec.len as usize);
    meta.enabled = true;
    Ok(meta)
}

fn run_stride_searches(
    meta: &FastpathMeta,
    img: &[u8],
    base: usize,
    stride: usize,
    count: usize,
) -> (usize, usize) {
    let mut lower = 0usize;
    let mut upper = count;
    for i in 0..meta.num_keys {
        if lower >= upper {
            break;
        }
        if meta.flags[i] == 0 {
            (meta.funcs[i])(
                &img[base + meta.offsets[i]..],
                stride,
                &mut lower,
                &mut upper,
                meta.values[i],
            );
        } else if meta.flags[i] & KEY_FLAG_MINUS_INF != 0 {
            upper = lower;
        } else if meta.flags[i] & KEY_FLAG_PLUS_INF != 0 {
            lower = upper;
        }
    }
    (lower, upper)
}

fn validate(live: &InMemoryPage, image_change_count: u64) -> bool {
    let state = live.state();
    !state_read_is_blocked(state)
        && state & PAGE_STATE_CHANGE_COUNT_MASK == image_change_count
}

/// Locates the chunk covering the search key via the fixed-stride high-key
/// array.
///
/// `img` is the caller's copy of the page; `live` is the resident page whose
/// state word validates the copy.
pub fn fastpath_find_chunk(
    img: &[u8],
    live: &InMemoryPage,
    meta: &FastpathMeta,
) -> FastpathResult<usize> {
    debug_assert!(meta.enabled);
    let image_change_count = page_change_count(img);

    if !page_is(img, PAGE_FLAG_HIKEYS_FIXED) {
        return FastpathResult::Slowpath;
    }
    let chunks = page_chunks_count(img);
    if chunks == 0 {
        return FastpathResult::Slowpath;
    }
    let count = if page_is(img, PAGE_FLAG_RIGHTMOST) {
        chunks - 1
    } else {
        chunks
    };
    let offset = chunk_desc(img, 0).hikey_location as usize;
    match page_hikeys_end(img).checked_sub(offset) {
        Some(region) if region == count * meta.length => {}
        _ => return FastpathResult::Slowpath,
    }

    let (lower, upper) = run_stride_searches(meta, img, offset, meta.length, count);
    let chunk = if meta.inclusive { lower } else { upper };

    // Right of every bounded chunk: the right-link may need following.
    if chunk >= count {
        return FastpathResult::Slowpath;
    }
    if !validate(live, image_change_count) {
        return FastpathResult::Retry;
    }
    FastpathResult::Found(chunk)
}

struct FixedChunk {
    base: usize,
    key_count: usize,
    items_count: usize,
}

/// Checks the stride-regularity formula for `chunk` and computes its search
/// geometry. Returns `None` when the chunk cannot be stride-searched.
fn fixed_chunk_geometry(img: &[u8], chunk: usize, meta: &FastpathMeta) -> Option<FixedChunk> {
    let desc = chunk_desc(img, chunk);
    if !desc.keys_fixed {
        return None;
    }
    let chunks = page_chunks_count(img);
    let start = desc.location as usize;
    let end = if chunk + 1 < chunks {
        chunk_desc(img, chunk + 1).location as usize
    } else {
        crate::page::page_data_size(img)
    };
    let first = desc.offset as usize;
    let next = if chunk + 1 < chunks {
        chunk_desc(img, chunk + 1).offset as usize
    } else {
        crate::page::page_items_count(img)
    };
    let items_count = next.checked_sub(first)?;
    let size = end.checked_sub(start)?;
    if end > img.len() {
        return None;
    }

    let table = max_align(2 * items_count);
    let hdr = NONLEAF_TUPLE_HEADER_LEN;
    let (key_count, base) = if chunk == 0 {
        (items_count.checked_sub(1)?, start + table + hdr)
    } else {
        (items_count, start + table)
    };
    if size != table + hdr * items_count + meta.length * key_count {
        return None;
    }
    Some(FixedChunk {
        base,
        key_count,
        items_count,
    })
}

/// Finds the downlink for the decomposed key on a non-leaf page image.
///
/// `blkno` identifies the live page for the chunk caches. On success the
/// returned locator addresses the chosen item and the header carries its
/// downlink.
pub fn fastpath_find_downlink(
    img: &[u8],
    live: &InMemoryPage,
    blkno: InMemoryBlkno,
    meta: &mut FastpathMeta,
    mut cache: Option<&mut FastpathChunkCache>,
) -> FastpathResult<(ItemLocator, NonLeafTupleHeader)> {
    debug_assert!(meta.enabled);
    let image_change_count = page_change_count(img);
    let hdr = NONLEAF_TUPLE_HEADER_LEN;
    let stride = hdr + meta.length;

    // Chunk location, cheapest source first: the meta's one-entry cache,
    // the shared LRU, then the stride search over the high-key array.
    let mut chunk = None;
    if meta.cache_valid
        && meta.cached_blkno == blkno
        && meta.cached_change_count == image_change_count
    {
        chunk = Some(meta.cached_chunk);
    }
    if chunk.is_none() {
        if let Some(cache) = cache.as_deref_mut() {
            chunk = cache.lookup(blkno, image_change_count);
        }
    }
    let mut chunk = match chunk {
        Some(found) => found,
        None => match fastpath_find_chunk(img, live, meta) {
            FastpathResult::Found(found) => {
                meta.cache_valid = true;
                meta.cached_blkno = blkno;
                meta.cached_change_count = image_change_count;
                meta.cached_chunk = found;
                if let Some(cache) = cache.as_deref_mut() {
                    cache.insert(blkno, image_change_count, found);
                }
                found
            }
            FastpathResult::Retry => return FastpathResult::Retry,
            FastpathResult::Slowpath => return FastpathResult::Slowpath,
            FastpathResult::Failure => return FastpathResult::Failure,
        },
    };

    let Some(geometry) = fixed_chunk_geometry(img, chunk, meta) else {
        return FastpathResult::Slowpath;
    };

    let (lower, upper) = run_stride_searches(
        meta,
        img,
        geometry.base + hdr,
        stride,
        geometry.key_count,
    );
    let item_index = if meta.inclusive { lower } else { upper };

    if !validate(live, image_change_count) {
        return FastpathResult::Retry;
    }

    let located = if chunk == 0 {
        // The first chunk's first item is the minus-infinity downlink.
        let header_off = if item_index == 0 {
            geometry.base - hdr
        } else {
            geometry.base + stride * (item_index - 1)
        };
        (
            ItemLocator {
                chunk,
                item: item_index,
            },
            header_off,
        )
    } else if item_index > 0 {
        (
            ItemLocator {
                chunk,
                item: item_index - 1,
            },
            geometry.base + stride * (item_index - 1),
        )
    } else {
        // Left edge of a later chunk: the covering item is the previous
        // chunk's last.
        chunk -= 1;
        let Some(prev) = fixed_chunk_geometry(img, chunk, meta) else {
            return FastpathResult::Slowpath;
        };
        let item = prev.items_count - 1;
        let header_off = if chunk == 0 && item == 0 {
            prev.base - hdr
        } else {
            prev.base + stride * (prev.key_count - 1)
        };
        (ItemLocator { chunk, item }, header_off)
    };

    if !validate(live, image_change_count) {
        return FastpathResult::Retry;
    }

    let header = NonLeafTupleHeader::parse(&img[located.1..located.1 + hdr]);
    FastpathResult::Found((located.0, header))
}

fn lower_upper<T: Copy, F: Fn(&[u8], usize) -> T, C: Fn(T, T) -> std::cmp::Ordering>(
    base: &[u8],
    stride: usize,
    lower: &mut usize,
    upper: &mut usize,
    key: T,
    read: F,
    cmp: C,
) {
    use std::cmp::Ordering;
    // First element >= key.
    let (mut lo, mut hi) = (*lower, *upper);
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if cmp(read(base, mid * stride), key) == Ordering::Less {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    *lower = lo;
    // First element > key.
    let mut hi = *upper;
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if cmp(read(base, mid * stride), key) == Ordering::Greater {
            hi = mid;
        } else {
            lo = mid + 1;
        }
    }
    *upper = lo;
}

fn oid_stride_search(base: &[u8], stride: usize, lower: &mut usize, upper: &mut usize, key: Datum) {
    lower_upper(
        base,
        stride,
        lower,
        upper,
        key.as_oid(),
        |b, off| u32::from_le_bytes(b[off..off + 4].try_into().expect("4 bytes")),
        |a, b| a.cmp(&b),
    );
}

fn int32_stride_search(
    base: &[u8],
    stride: usize,
    lower: &mut usize,
    upper: &mut usize,
    key: Datum,
) {
    lower_upper(
        base,
        stride,
        lower,
        upper,
        key.as_i32(),
        |b, off| i32::from_le_bytes(b[off..off + 4].try_into().expect("4 bytes")),
        |a, b| a.cmp(&b),
    );
}

fn int64_stride_search(
    base: &[u8],
    stride: usize,
    lower: &mut usize,
    upper: &mut usize,
    key: Datum,
) {
    lower_upper(
        base,
        stride,
        lower,
        upper,
        key.as_i64(),
        |b, off| i64::from_le_bytes(b[off..off + 8].try_into().expect("8 bytes")),
        |a, b| a.cmp(&b),
    );
}

fn float32_stride_search(
    base: &[u8],
    stride: usize,
    lower: &mut usize,
    upper: &mut usize,
    key: Datum,
) {
    lower_upper(
        base,
        stride,
        lower,
        upper,
        key.as_f32(),
        |b, off| f32::from_le_bytes(b[off..off + 4].try_into().expect("4 bytes")),
        cmp_f32,
    );
}

fn float64_stride_search(
    base: &[u8],
    stride: usize,
    lower: &mut usize,
    upper: &mut usize,
    key: Datum,
) {
    lower_upper(
        base,
        stride,
        lower,
        upper,
        key.as_f64(),
        |b, off| f64::from_le_bytes(b[off..off + 8].try_into().expect("8 bytes")),
        cmp_f64,
    );
}

fn tid_stride_search(base: &[u8], stride: usize, lower: &mut usize, upper: &mut usize, key: Datum) {
    lower_upper(
        base,
        stride,
        lower,
        upper,
        key.as_item_pointer(),
        |b, off| ItemPointer::from_bytes(&b[off..off + ItemPointer::LEN]),
        |a, b| a.cmp(&b),
    );
}
