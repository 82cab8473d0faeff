//! Search keys and the generic in-page downlink search.
//!
//! The descent works over a *decomposed* key: per attribute either a datum
//! or a ±∞ marker, plus an inclusive bit. Hikey searches are inclusive
//! (lower-bound semantics), tuple searches exclusive (upper-bound), giving
//! the standard B-tree "rightmost item with key ≤ search key" downlink rule:
//! the chosen item is the one *before* the computed bound position, wrapping
//! to the minus-infinity item at position zero.
//!
//! This module is the slow path; [`crate::btree::fastpath`] computes the
//! identical answer on fixed-stride pages without decoding tuples.

use std::cmp::Ordering;

use crate::descr::{apply_sort_comparator, IndexDescriptor, IndexKind};
use crate::error::{EngineError, Result};
use crate::page::chunks::{chunk_hikey, item_at_global, locator_for_global, ItemLocator};
use crate::page::{
    page_chunks_count, page_is, page_items_count, NonLeafTupleHeader, PAGE_FLAG_LEAF,
    PAGE_FLAG_RIGHTMOST, NONLEAF_TUPLE_HEADER_LEN,
};
use crate::tuple::{read_datum_raw, Tuple};
use crate::types::{ColumnKind, Datum};

/// Maximum number of key attributes a decomposed search carries.
pub const SEARCH_MAX_KEYS: usize = 4;

/// Decomposed-attribute flag: the attribute is unbounded below.
pub const KEY_FLAG_MINUS_INF: u8 = 1;
/// Decomposed-attribute flag: the attribute is unbounded above.
pub const KEY_FLAG_PLUS_INF: u8 = 2;

/// One attribute of an explicit range bound.
#[derive(Clone, Copy, Debug)]
pub struct BoundKey {
    /// Datatype the bound value claims to be.
    pub kind: ColumnKind,
    /// The bound for this attribute.
    pub value: BoundValue,
}

/// Value of one bound attribute.
#[derive(Clone, Copy, Debug)]
pub enum BoundValue {
    /// A concrete value.
    Value(Datum),
    /// Unbounded below (matches everything from the left).
    LowerUnbounded,
    /// Unbounded above.
    UpperUnbounded,
}

/// Explicit multi-attribute range bound.
#[derive(Clone, Debug)]
pub struct KeyBound {
    /// Per-attribute bounds, leading attributes first.
    pub keys: Vec<BoundKey>,
}

/// The search key handed to a descent.
#[derive(Clone, Copy, Debug)]
pub enum BTreeKey<'a> {
    /// Leftmost descent (minus infinity).
    None,
    /// Rightmost descent (plus infinity).
    Rightmost,
    /// A leaf tuple whose key prefix drives the search.
    LeafTuple(&'a Tuple),
    /// A non-leaf (key-only) tuple.
    NonLeafKey(&'a Tuple),
    /// A page high key; searches inclusively.
    PageHiKey(&'a Tuple),
    /// An explicit range bound.
    Bound(&'a KeyBound),
    /// Range bound over the unique-field prefix, lower side.
    UniqueLowerBound(&'a KeyBound),
    /// Range bound over the unique-field prefix, upper side.
    UniqueUpperBound(&'a KeyBound),
}

/// A search key decomposed into per-attribute datums and ±∞ markers.
#[derive(Clone, Copy, Debug)]
pub struct DecomposedKey {
    /// Number of meaningful attributes.
    pub num_keys: usize,
    /// Inclusive (lower-bound) search.
    pub inclusive: bool,
    /// Attribute values; meaningless where a flag is set.
    pub values: [Datum; SEARCH_MAX_KEYS],
    /// Per-attribute ±∞ flags.
    pub flags: [u8; SEARCH_MAX_KEYS],
}

/// Number of attributes a search with this key compares.
pub fn search_key_attrs(desc: &IndexDescriptor, key: BTreeKey<'_>) -> usize {
    match key {
        BTreeKey::UniqueLowerBound(_) | BTreeKey::UniqueUpperBound(_) => desc.n_unique_fields,
        _ if desc.kind != IndexKind::Toast && desc.kind != IndexKind::Bridge => desc.n_key_fields,
        _ => desc.nonleaf_spec.natts as usize,
    }
}

/// Decomposes `key` into datums and ±∞ flags for stride or slow-path search.
///
/// Returns `None` when the key cannot be decomposed (e.g. a bound whose
/// attribute types do not match the index), in which case the caller must
/// compare whole tuples instead.
pub fn decompose_key(
    desc: &IndexDescriptor,
    key: BTreeKey<'_>,
) -> Result<Option<DecomposedKey>> {
    let num_keys = search_key_attrs(desc, key).min(SEARCH_MAX_KEYS);
    let mut out = DecomposedKey {
        num_keys,
        inclusive: false,
        values: [Datum::default(); SEARCH_MAX_KEYS],
        flags: [0; SEARCH_MAX_KEYS],
    };

    match key {
        BTreeKey::None | BTreeKey::Rightmost => {
            let flag = if matches!(key, BTreeKey::None) {
                KEY_FLAG_MINUS_INF
            } else {
                KEY_FLAG_PLUS_INF
            };
            out.flags[..num_keys].fill(flag);
            Ok(Some(out))
        }
        BTreeKey::Bound(bound)
        | BTreeKey::UniqueLowerBound(bound)
        | BTreeKey::UniqueUpperBound(bound) => {
            let num = num_keys.min(bound.keys.len());
            for (i, key) in bound.keys[..num].iter().enumerate() {
                if key.kind != desc.fields[i].kind {
                    return Ok(None);
                }
                match key.value {
                    BoundValue::Value(v) => out.values[i] = v,
                    BoundValue::LowerUnbounded => out.flags[i] = KEY_FLAG_MINUS_INF,
                    BoundValue::UpperUnbounded => out.flags[i] = KEY_FLAG_PLUS_INF,
                }
            }
            // Attributes past the supplied bound stay unbounded below, so a
            // short bound behaves as a prefix search.
            for i in num..num_keys {
                out.flags[i] = KEY_FLAG_MINUS_INF;
            }
            Ok(Some(out))
        }
        BTreeKey::LeafTuple(tuple) => {
            decompose_tuple(desc, tuple, false, &mut out)?;
            Ok(Some(out))
        }
        BTreeKey::NonLeafKey(tuple) => {
            decompose_tuple(desc, tuple, true, &mut out)?;
            Ok(Some(out))
        }
        BTreeKey::PageHiKey(tuple) => {
            out.inclusive = true;
            decompose_tuple(desc, tuple, true, &mut out)?;
            Ok(Some(out))
        }
    }
}

fn decompose_tuple(
    desc: &IndexDescriptor,
    tuple: &Tuple,
    nonleaf: bool,
    out: &mut DecomposedKey,
) -> Result<()> {
    let (tupdesc, spec) = if nonleaf {
        (&desc.nonleaf_tupdesc, &desc.nonleaf_spec)
    } else {
        (&desc.leaf_tupdesc, &desc.leaf_spec)
    };
    for i in 0..out.num_keys {
        let (datum, isnull) =
            read_datum_raw(&tuple.data, tuple.flags, (i + 1) as u16, tupdesc, spec)?;
        if isnull {
            out.flags[i] = if desc.fields[i].nulls_first {
                KEY_FLAG_MINUS_INF
            } else {
                KEY_FLAG_PLUS_INF
            };
        } else {
            out.values[i] = datum;
        }
    }
    Ok(())
}

/// Compares a decomposed key against a stored non-leaf key.
pub fn compare_decomposed_to_key(
    desc: &IndexDescriptor,
    dec: &DecomposedKey,
    key_bytes: &[u8],
    key_flags: u8,
) -> Result<Ordering> {
    for i in 0..dec.num_keys {
        if dec.flags[i] & KEY_FLAG_MINUS_INF != 0 {
            return Ok(Ordering::Less);
        }
        if dec.flags[i] & KEY_FLAG_PLUS_INF != 0 {
            return Ok(Ordering::Greater);
        }
        let (stored, isnull) = read_datum_raw(
            key_bytes,
            key_flags,
            (i + 1) as u16,
            &desc.nonleaf_tupdesc,
            &desc.nonleaf_spec,
        )?;
        let cmp = apply_sort_comparator(
            &desc.fields[i],
            (dec.values[i], false),
            (stored, isnull),
        );
        if cmp != Ordering::Equal {
            return Ok(cmp);
        }
    }
    Ok(Ordering::Equal)
}

/// Result of a slow-path downlink search.
#[derive(Clone, Copy, Debug)]
pub struct DownlinkLocation {
    /// Locator of the chosen item.
    pub loc: ItemLocator,
    /// The chosen item's header.
    pub header: NonLeafTupleHeader,
}

/// Generic binary search for the downlink covering `dec` on a non-leaf page.
///
/// The matching item is the rightmost whose key compares ≤ the search key
/// (inclusive searches admit equality on the bound side); position zero is
/// the minus-infinity item.
pub fn find_downlink_slowpath(
    desc: &IndexDescriptor,
    img: &[u8],
    dec: &DecomposedKey,
) -> Result<DownlinkLocation> {
    if page_is(img, PAGE_FLAG_LEAF) {
        return Err(EngineError::InvalidArgument(
            "downlink search requires a non-leaf page".into(),
        ));
    }
    let n = page_items_count(img);
    if n == 0 {
        return Err(EngineError::Corruption("non-leaf page with no items".into()));
    }

    let key_of = |j: usize| -> Result<Ordering> {
        let (bytes, flags) = item_at_global(img, j)?;
        compare_decomposed_to_key(desc, dec, &bytes[NONLEAF_TUPLE_HEADER_LEN..], flags)
    };

    // First item with key >= search key.
    let (mut lo, mut hi) = (1usize, n);
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if key_of(mid)? == Ordering::Greater {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    let lower = lo;

    // First item with key > search key.
    let (mut lo, mut hi) = (lower, n);
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if key_of(mid)? == Ordering::Less {
            hi = mid;
        } else {
            lo = mid + 1;
        }
    }
    let upper = lo;

    let chosen = if dec.inclusive { lower } else { upper };
    let global = chosen - 1;
    let loc = locator_for_global(img, global)?;
    let (bytes, _) = item_at_global(img, global)?;
    Ok(DownlinkLocation {
        loc,
        header: NonLeafTupleHeader::parse(bytes),
    })
}

/// Generic chunk search: index of the chunk whose key range covers `dec`.
///
/// Returns `None` when the key lies right of every chunk's high key, which
/// on a non-rightmost page means the right-link must be followed.
pub fn find_chunk_slowpath(
    desc: &IndexDescriptor,
    img: &[u8],
    dec: &DecomposedKey,
) -> Result<Option<usize>> {
    let chunks = page_chunks_count(img);
    let searchable = if page_is(img, PAGE_FLAG_RIGHTMOST) {
        chunks - 1
    } else {
        chunks
    };
    // First chunk whose hikey satisfies the bound side.
    let (mut lo, mut hi) = (0usize, searchable);
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        let Some((bytes, flags)) = chunk_hikey(img, mid) else {
            return Err(EngineError::Corruption("chunk missing its high key".into()));
        };
        let cmp = compare_decomposed_to_key(desc, dec, bytes, flags)?;
        let descend_right = if dec.inclusive {
            cmp == Ordering::Greater
        } else {
            cmp != Ordering::Less
        };
        if descend_right {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    if lo >= searchable {
        // Right of every bounded chunk: the rightmost chunk on a rightmost
        // page covers everything, otherwise the caller follows the right
        // link.
        if page_is(img, PAGE_FLAG_RIGHTMOST) {
            return Ok(Some(chunks - 1));
        }
        return Ok(None);
    }
    Ok(Some(lo))
}
