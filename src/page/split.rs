//! Split-point selection.
//!
//! Shared between the bulk builder and the online insert path: given the
//! items a page must hold (the incoming one included), pick how many stay on
//! the left so the left page lands closest to the configured fill target.
//! Bulk builds append monotonically, so the oracle deliberately left-loads:
//! the right page starts nearly empty and fills as the stream continues.

use crate::page::chunks::PageItem;
use crate::page::PAGE_HEADER_LEN;
use crate::types::{max_align, BLCKSZ};

/// Returns the number of items to keep on the left page.
///
/// The result is always in `[1, items.len() - 1]`, so both sides of the
/// split are non-empty.
pub fn split_location(items: &[PageItem], fillfactor: u8) -> usize {
    debug_assert!(items.len() >= 2);
    let usable = BLCKSZ - PAGE_HEADER_LEN;
    let budget = usable * fillfactor as usize / 100;

    let mut used = 0usize;
    let mut left_count = 0usize;
    for item in items {
        let cost = max_align(2) + item.stored_size();
        if left_count > 0 && used + cost > budget {
            break;
        }
        used += cost;
        left_count += 1;
    }
    left_count.clamp(1, items.len() - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_items(count: usize, size: usize) -> Vec<PageItem> {
        (0..count)
            .map(|_| PageItem {
                bytes: vec![0u8; size],
                flags: 0,
            })
            .collect()
    }

    #[test]
    fn split_keeps_both_sides_nonempty() {
        let items = fixed_items(2, 64);
        let left = split_location(&items, 90);
        assert_eq!(left, 1);
    }

    #[test]
    fn split_tracks_fillfactor() {
        let items = fixed_items(400, 32);
        let left_90 = split_location(&items, 90);
        let left_50 = split_location(&items, 50);
        assert!(left_50 < left_90);
        assert!(left_90 < items.len());
        // A 90% target over 8 KiB of 40-byte slots lands near 180 items.
        let per_item = max_align(2) + 32;
        let expect = (BLCKSZ - PAGE_HEADER_LEN) * 90 / 100 / per_item;
        assert!((left_90 as i64 - expect as i64).unsigned_abs() <= 1);
    }
}
