//! Chunked item storage inside a page.
//!
//! Pages under construction hold a single chunk and only ever append at the
//! tail; [`rebuild_page`] repartitions a page into cacheline-dense chunks
//! (and installs a new high key) when it is split or written out.

use bytes::Bytes;
use smallvec::SmallVec;

use crate::descr::IndexDescriptor;
use crate::error::{EngineError, Result};
use crate::page::{
    bump_change_count, chunk_desc, page_chunks_count, page_data_size, page_flags,
    page_hikeys_end, page_is, page_items_count, pack_item_offset, set_page_chunks_count,
    set_page_counts, set_page_flags, set_page_hikeys_end, set_page_max_key_len,
    unpack_item_offset, write_chunk_desc, ChunkDesc, CHUNK_DESC_LEN, CHUNK_SIZE_TARGET,
    LEAF_TUPLE_HEADER_LEN, MAX_PAGE_CHUNKS, NONLEAF_TUPLE_HEADER_LEN, PAGE_FLAG_HIKEYS_FIXED,
    PAGE_FLAG_LEAF, PAGE_HEADER_LEN,
};
use crate::tuple::{Tuple, TUPLE_FLAG_FIXED_FORMAT};
use crate::types::{max_align, BLCKSZ};

/// Position of one item on a page: chunk index plus index within the chunk.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ItemLocator {
    /// Chunk index.
    pub chunk: usize,
    /// Item index within the chunk.
    pub item: usize,
}

/// An item lifted off a page: raw bytes (header included) plus format flags.
#[derive(Clone, Debug)]
pub struct PageItem {
    /// Item bytes: tuple header followed by tuple body.
    pub bytes: Vec<u8>,
    /// Tuple format flags from the offset entry.
    pub flags: u8,
}

impl PageItem {
    /// Space the item occupies in a chunk's data area.
    pub fn stored_size(&self) -> usize {
        max_align(self.bytes.len())
    }
}

/// Number of items in chunk `idx`.
pub fn chunk_items_count(img: &[u8], idx: usize) -> usize {
    let chunks = page_chunks_count(img);
    debug_assert!(idx < chunks);
    let first = chunk_desc(img, idx).offset as usize;
    if idx + 1 < chunks {
        chunk_desc(img, idx + 1).offset as usize - first
    } else {
        page_items_count(img) - first
    }
}

/// Absolute byte range `[start, end)` of chunk `idx`.
pub fn chunk_bounds(img: &[u8], idx: usize) -> (usize, usize) {
    let chunks = page_chunks_count(img);
    debug_assert!(idx < chunks);
    let start = chunk_desc(img, idx).location as usize;
    let end = if idx + 1 < chunks {
        chunk_desc(img, idx + 1).location as usize
    } else {
        page_data_size(img)
    };
    (start, end)
}

/// Reads the item at `loc`, returning its bytes and format flags.
pub fn item_at<'a>(img: &'a [u8], loc: ItemLocator) -> Result<(&'a [u8], u8)> {
    let count = chunk_items_count(img, loc.chunk);
    if loc.item >= count {
        return Err(EngineError::Corruption(
            "item locator beyond chunk items".into(),
        ));
    }
    let (start, end) = chunk_bounds(img, loc.chunk);
    let entry_off = start + 2 * loc.item;
    let packed = u16::from_le_bytes(img[entry_off..entry_off + 2].try_into().expect("2 bytes"));
    let (rel, flags) = unpack_item_offset(packed);
    let item_start = start + rel;
    let item_end = if loc.item + 1 < count {
        let next = u16::from_le_bytes(
            img[entry_off + 2..entry_off + 4]
                .try_into()
                .expect("2 bytes"),
        );
        start + unpack_item_offset(next).0
    } else {
        end
    };
    if item_start > item_end || item_end > img.len() {
        return Err(EngineError::Corruption("item extent out of range".into()));
    }
    Ok((&img[item_start..item_end], flags))
}

/// Reads the item at global index `idx` in page order.
pub fn item_at_global(img: &[u8], idx: usize) -> Result<(&[u8], u8)> {
    item_at(img, locator_for_global(img, idx)?)
}

/// Maps a global item index to a chunk-relative locator.
pub fn locator_for_global(img: &[u8], idx: usize) -> Result<ItemLocator> {
    if idx >= page_items_count(img) {
        return Err(EngineError::Corruption(
            "global item index beyond page items".into(),
        ));
    }
    let chunks = page_chunks_count(img);
    for chunk in (0..chunks).rev() {
        let first = chunk_desc(img, chunk).offset as usize;
        if idx >= first {
            return Ok(ItemLocator {
                chunk,
                item: idx - first,
            });
        }
    }
    Err(EngineError::Corruption("chunk offsets are inconsistent".into()))
}

/// Lifts every item off the page, in order.
pub fn page_items(img: &[u8]) -> Result<Vec<PageItem>> {
    let mut items = Vec::with_capacity(page_items_count(img));
    for chunk in 0..page_chunks_count(img) {
        for item in 0..chunk_items_count(img, chunk) {
            let (bytes, flags) = item_at(img, ItemLocator { chunk, item })?;
            // Item extents are offset-to-offset, so lifted items keep their
            // alignment padding and round-trip byte-identical.
            items.push(PageItem {
                bytes: bytes.to_vec(),
                flags,
            });
        }
    }
    Ok(items)
}

/// High key of chunk `idx`, or `None` when the chunk has none.
pub fn chunk_hikey(img: &[u8], idx: usize) -> Option<(&[u8], u8)> {
    let chunks = page_chunks_count(img);
    debug_assert!(idx < chunks);
    let desc = chunk_desc(img, idx);
    let start = desc.hikey_location as usize;
    let end = if idx + 1 < chunks {
        chunk_desc(img, idx + 1).hikey_location as usize
    } else {
        page_hikeys_end(img)
    };
    if start >= end {
        None
    } else {
        Some((&img[start..end], desc.hikey_flags))
    }
}

/// The page-level high key (the last chunk's), absent on rightmost pages.
pub fn page_hikey(img: &[u8]) -> Option<(&[u8], u8)> {
    chunk_hikey(img, page_chunks_count(img) - 1)
}

/// True when an item of `size` bytes (header plus aligned body) can be
/// appended to the page's single open chunk.
pub fn page_fits_item(img: &[u8], size: usize) -> bool {
    let count = page_items_count(img);
    let table_growth = max_align(2 * (count + 1)) - max_align(2 * count);
    BLCKSZ - page_data_size(img) >= table_growth + max_align(size)
}

/// Appends an item at the page's tail.
///
/// Only valid on single-chunk pages, which is the only shape the builder
/// appends to; written pages are repartitioned by [`rebuild_page`].
pub fn page_append_item(img: &mut [u8], hdr: &[u8], body: &[u8], flags: u8) -> Result<()> {
    debug_assert_eq!(page_chunks_count(img), 1);
    debug_assert_eq!(hdr.len(), max_align(hdr.len()));
    let count = page_items_count(img);
    let data_size = page_data_size(img);
    let loc = chunk_desc(img, 0).location as usize;

    let old_table = max_align(2 * count);
    let new_table = max_align(2 * (count + 1));
    let shift = new_table - old_table;
    let item_size = hdr.len() + max_align(body.len());
    let new_data_size = data_size + shift + item_size;
    if new_data_size > BLCKSZ {
        return Err(EngineError::InvalidArgument(
            "item does not fit on page".into(),
        ));
    }

    if shift > 0 {
        img.copy_within(loc + old_table..data_size, loc + new_table);
        for entry in 0..count {
            let off = loc + 2 * entry;
            let packed = u16::from_le_bytes(img[off..off + 2].try_into().expect("2 bytes"));
            img[off..off + 2].copy_from_slice(&(packed + shift as u16).to_le_bytes());
        }
    }

    let item_start = data_size + shift;
    let entry_off = loc + 2 * count;
    let packed = pack_item_offset(item_start - loc, flags);
    img[entry_off..entry_off + 2].copy_from_slice(&packed.to_le_bytes());
    img[item_start..item_start + hdr.len()].copy_from_slice(hdr);
    let body_start = item_start + hdr.len();
    img[body_start..body_start + body.len()].copy_from_slice(body);
    // Zero the alignment tail so page images are deterministic.
    let body_end = body_start + body.len();
    let item_end = item_start + item_size;
    img[body_end..item_end].fill(0);

    set_page_counts(img, count + 1, new_data_size);
    bump_change_count(img);
    Ok(())
}

/// Key bytes of a page item: the stored key of a non-leaf item, or the
/// extracted key prefix of a leaf tuple.
pub fn item_key(desc: &IndexDescriptor, is_leaf: bool, item: &PageItem) -> Result<(Vec<u8>, u8)> {
    if is_leaf {
        let tuple = Tuple::new(
            item.flags,
            Bytes::copy_from_slice(&item.bytes[LEAF_TUPLE_HEADER_LEN..]),
        );
        let key = desc.make_key(&tuple)?;
        Ok((key.data.to_vec(), key.flags))
    } else {
        Ok((
            item.bytes[NONLEAF_TUPLE_HEADER_LEN..].to_vec(),
            item.flags,
        ))
    }
}

struct ChunkPlan {
    first_item: usize,
    item_count: usize,
    data_bytes: usize,
}

fn partition_items(sizes: &[usize], target: usize) -> SmallVec<[ChunkPlan; 8]> {
    let mut plans: SmallVec<[ChunkPlan; 8]> = SmallVec::new();
    let mut start = 0usize;
    let mut bytes = 0usize;
    for (idx, &size) in sizes.iter().enumerate() {
        let count = idx - start;
        if count > 0 && max_align(2 * (count + 1)) + bytes + size > target {
            plans.push(ChunkPlan {
                first_item: start,
                item_count: count,
                data_bytes: bytes,
            });
            start = idx;
            bytes = 0;
        }
        bytes += size;
    }
    plans.push(ChunkPlan {
        first_item: start,
        item_count: sizes.len() - start,
        data_bytes: bytes,
    });
    plans
}

/// Rebuilds the page from `items`, repartitioning chunks and installing
/// `hikey` as the page high key (absent for rightmost pages).
///
/// Preserves the identity fields of the header (flags, level, csn,
/// right-link, checkpoint number) and commits a fresh state with an
/// incremented change count. `HIKEYS_FIXED` and the per-chunk
/// `keys_fixed` markers are recomputed from the new layout.
pub fn rebuild_page(
    img: &mut [u8],
    desc: &IndexDescriptor,
    items: &[PageItem],
    hikey: Option<(&[u8], u8)>,
) -> Result<()> {
    let is_leaf = page_is(img, PAGE_FLAG_LEAF);
    let stride = max_align(desc.nonleaf_spec.len as usize);
    let sizes: Vec<usize> = items.iter().map(PageItem::stored_size).collect();

    // Boundary keys become chunk high keys; compute them once.
    let mut plans: SmallVec<[ChunkPlan; 8]> = SmallVec::new();
    let mut hikeys: Vec<(Vec<u8>, u8)> = Vec::new();
    let mut layout_ok = false;
    let mut hikeys_end = 0usize;
    let mut target = CHUNK_SIZE_TARGET;
    while !layout_ok {
        plans = partition_items(&sizes, target);
        if plans.len() > MAX_PAGE_CHUNKS {
            target *= 2;
            continue;
        }
        hikeys.clear();
        for plan in plans.iter().skip(1) {
            hikeys.push(item_key(desc, is_leaf, &items[plan.first_item])?);
        }
        if let Some((bytes, flags)) = hikey {
            hikeys.push((bytes.to_vec(), flags));
        }
        let dir_end = PAGE_HEADER_LEN + plans.len() * CHUNK_DESC_LEN;
        hikeys_end = max_align(dir_end)
            + hikeys
                .iter()
                .map(|(k, _)| max_align(k.len()))
                .sum::<usize>();
        let data_end = hikeys_end
            + plans
                .iter()
                .map(|p| max_align(2 * p.item_count) + p.data_bytes)
                .sum::<usize>();
        if data_end <= BLCKSZ {
            layout_ok = true;
        } else if plans.len() == 1 {
            return Err(EngineError::Corruption(
                "page contents exceed block even as a single chunk".into(),
            ));
        } else {
            target *= 2;
        }
    }

    let mut fresh = vec![0u8; BLCKSZ];
    fresh[..PAGE_HEADER_LEN].copy_from_slice(&img[..PAGE_HEADER_LEN]);

    // High-key region.
    let dir_end = PAGE_HEADER_LEN + plans.len() * CHUNK_DESC_LEN;
    let hikeys_start = max_align(dir_end);
    let mut hk_cursor = hikeys_start;
    let mut hk_locations: Vec<(usize, u8)> = Vec::with_capacity(plans.len());
    for (key, flags) in &hikeys {
        hk_locations.push((hk_cursor, *flags));
        fresh[hk_cursor..hk_cursor + key.len()].copy_from_slice(key);
        hk_cursor += max_align(key.len());
    }
    debug_assert_eq!(hk_cursor, hikeys_end);

    // Item area, chunk by chunk.
    let mut cursor = hikeys_end;
    let mut max_key_len = hikeys.iter().map(|(k, _)| k.len()).max().unwrap_or(0);
    for (chunk_idx, plan) in plans.iter().enumerate() {
        let location = cursor;
        let table = max_align(2 * plan.item_count);
        let mut item_cursor = table;
        let mut keys_fixed = !is_leaf && plan.item_count > 0 && stride > 0;
        for (pos, item) in items[plan.first_item..plan.first_item + plan.item_count]
            .iter()
            .enumerate()
        {
            let entry_off = location + 2 * pos;
            let packed = pack_item_offset(item_cursor, item.flags);
            fresh[entry_off..entry_off + 2].copy_from_slice(&packed.to_le_bytes());
            let start = location + item_cursor;
            fresh[start..start + item.bytes.len()].copy_from_slice(&item.bytes);
            item_cursor += item.stored_size();
            if !is_leaf {
                let global = plan.first_item + pos;
                let expected = if global == 0 {
                    NONLEAF_TUPLE_HEADER_LEN
                } else {
                    NONLEAF_TUPLE_HEADER_LEN + stride
                };
                if item.stored_size() != expected {
                    keys_fixed = false;
                }
                max_key_len = max_key_len
                    .max(item.bytes.len().saturating_sub(NONLEAF_TUPLE_HEADER_LEN));
            }
        }
        cursor = location + table + plan.data_bytes;
        debug_assert_eq!(location + item_cursor, cursor);

        let (hikey_location, hikey_flags) = hk_locations
            .get(chunk_idx)
            .copied()
            .unwrap_or((hikeys_end, 0));
        write_chunk_desc(
            &mut fresh,
            chunk_idx,
            &ChunkDesc {
                location: location as u16,
                hikey_location: hikey_location as u16,
                hikey_flags,
                offset: plan.first_item as u16,
                keys_fixed,
            },
        );
    }

    // Header bookkeeping on the fresh image.
    set_page_chunks_count(&mut fresh, plans.len());
    set_page_hikeys_end(&mut fresh, hikeys_end);
    set_page_counts(&mut fresh, items.len(), cursor);
    set_page_max_key_len(&mut fresh, max_key_len);

    let hikeys_fixed = desc.nonleaf_fixed()
        && hikeys.iter().all(|(k, flags)| {
            flags & TUPLE_FLAG_FIXED_FORMAT != 0 && max_align(k.len()) == stride
        });
    let mut flags = page_flags(&fresh) & !PAGE_FLAG_HIKEYS_FIXED;
    if hikeys_fixed {
        flags |= PAGE_FLAG_HIKEYS_FIXED;
    }
    set_page_flags(&mut fresh, flags);

    img.copy_from_slice(&fresh);
    bump_change_count(img);
    Ok(())
}

/// Repartitions a page in place, keeping its items and high key.
///
/// Called on every page image right before it is written out, so on-disk
/// pages always carry search-friendly chunks.
pub fn split_page_by_chunks(img: &mut [u8], desc: &IndexDescriptor) -> Result<()> {
    let items = page_items(img)?;
    let hikey_owned: Option<(Vec<u8>, u8)> =
        page_hikey(img).map(|(bytes, flags)| (bytes.to_vec(), flags));
    rebuild_page(
        img,
        desc,
        &items,
        hikey_owned.as_ref().map(|(b, f)| (b.as_slice(), *f)),
    )
}
