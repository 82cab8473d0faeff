//! Sort-based bulk B-tree building.
//!
//! The builder consumes tuples in ascending key order and assembles the tree
//! bottom-up, one open page image per level, without any random I/O: a page
//! is written exactly once, when it overflows (or at finish), and its
//! downlink plus separator key are pushed to the level above.

use bytes::Bytes;
use tracing::debug;

use crate::btree::io::{BuildMeta, SegmentManager};
use crate::btree::{CheckpointFileHeader, MAX_DEPTH, MAX_TUPLE_SIZE};
use crate::descr::IndexDescriptor;
use crate::error::{EngineError, Result};
use crate::page::chunks::{
    item_key, page_append_item, page_fits_item, page_items, rebuild_page, split_page_by_chunks,
    PageItem,
};
use crate::page::split::split_location;
use crate::page::{
    init_page, new_page_buf, page_flags, page_free_space, page_items_count, set_page_flags,
    set_page_n_ondisk, LeafTupleHeader, NonLeafTupleHeader, PageBuf, LEAF_TUPLE_HEADER_LEN,
    NONLEAF_TUPLE_HEADER_LEN, PAGE_FLAG_LEAF, PAGE_FLAG_LEFTMOST, PAGE_FLAG_RIGHTMOST,
    PAGE_FLAG_ROOT_INIT,
};
use crate::sort::IndexBuildSorter;
use crate::tuple::{tuple_size, Tuple};
use crate::types::{
    max_align, pack_xact_info, Downlink, RowLockMode, BLCKSZ, BOOTSTRAP_OXID,
    INVALID_UNDO_LOCATION,
};
use std::sync::atomic::Ordering;
use std::sync::Arc;

struct LevelState {
    img: PageBuf,
    /// Separator to attach to the next downlink pushed from this level;
    /// `None` until the level's first page has been written.
    separator: Option<Tuple>,
}

/// State of one in-progress bulk build.
pub struct BuildState {
    desc: Arc<IndexDescriptor>,
    smgr: SegmentManager,
    meta: BuildMeta,
    stack: Vec<LevelState>,
    root_level: usize,
}

impl BuildState {
    /// Starts a build; tuples must then arrive in ascending key order.
    pub fn start(
        desc: Arc<IndexDescriptor>,
        smgr: SegmentManager,
        ctid: u64,
        bridge_ctid: u64,
    ) -> Self {
        let mut stack = Vec::with_capacity(MAX_DEPTH);
        for level in 0..MAX_DEPTH {
            let mut img = new_page_buf();
            let mut flags = PAGE_FLAG_LEFTMOST | PAGE_FLAG_RIGHTMOST;
            if level == 0 {
                flags |= PAGE_FLAG_LEAF;
            }
            init_page(&mut img[..], flags, level as u8);
            stack.push(LevelState {
                img,
                separator: None,
            });
        }
        Self {
            desc,
            smgr,
            meta: BuildMeta::new(ctid, bridge_ctid),
            stack,
            root_level: 0,
        }
    }

    /// Appends the next tuple of the sorted stream.
    pub fn add_tuple(&mut self, tuple: &Tuple) -> Result<()> {
        let size = tuple_size(tuple, &self.desc.leaf_spec);
        assert!(
            size <= MAX_TUPLE_SIZE,
            "tuple of {size} bytes exceeds the tree's tuple limit"
        );
        let mut hdr = [0u8; LEAF_TUPLE_HEADER_LEN];
        LeafTupleHeader {
            xact_info: pack_xact_info(BOOTSTRAP_OXID, RowLockMode::Update, false),
            undo_location: INVALID_UNDO_LOCATION,
        }
        .write_to(&mut hdr);
        self.put_item(0, &hdr, &tuple.data, tuple.flags)
    }

    /// Updates the position counters emitted in the file header.
    pub fn set_positions(&mut self, ctid: u64, bridge_ctid: u64) {
        self.meta.ctid.store(ctid, Ordering::Relaxed);
        self.meta.bridge_ctid.store(bridge_ctid, Ordering::Relaxed);
    }

    fn put_downlink(
        &mut self,
        level: usize,
        downlink: Downlink,
        key: Option<Tuple>,
    ) -> Result<()> {
        let mut hdr = [0u8; NONLEAF_TUPLE_HEADER_LEN];
        NonLeafTupleHeader { downlink }.write_to(&mut hdr);
        match key {
            Some(tuple) => self.put_item(level, &hdr, &tuple.data, tuple.flags),
            // The level's first downlink carries no key: it is the
            // minus-infinity item.
            None => self.put_item(level, &hdr, &[], 0),
        }
    }

    fn put_item(&mut self, level: usize, hdr: &[u8], body: &[u8], flags: u8) -> Result<()> {
        if level >= MAX_DEPTH {
            return Err(EngineError::InvalidArgument(
                "tree exceeds the maximum build depth".into(),
            ));
        }
        let item_size = hdr.len() + max_align(body.len());
        let slack = BLCKSZ * (100 - self.desc.fillfactor as usize) / 100;

        let fits = {
            let img = &self.stack[level].img;
            page_free_space(&img[..]) >= item_size + slack
                && page_fits_item(&img[..], hdr.len() + body.len())
        };
        if fits {
            let img = &mut self.stack[level].img;
            return page_append_item(&mut img[..], hdr, body, flags);
        }
        self.split_level(level, hdr, body, flags)
    }

    fn split_level(&mut self, level: usize, hdr: &[u8], body: &[u8], flags: u8) -> Result<()> {
        let is_leaf = level == 0;

        let mut items = page_items(&self.stack[level].img[..])?;
        let mut incoming = Vec::with_capacity(hdr.len() + body.len());
        incoming.extend_from_slice(hdr);
        incoming.extend_from_slice(body);
        items.push(PageItem {
            bytes: incoming,
            flags,
        });

        let left_count = split_location(&items, self.desc.fillfactor);
        let (hikey_bytes, hikey_flags) = item_key(&self.desc, is_leaf, &items[left_count])?;

        // The old image becomes the left page: it loses RIGHTMOST, gains the
        // new high key, and is written out.
        {
            let img = &mut self.stack[level].img;
            let new_flags = page_flags(&img[..]) & !PAGE_FLAG_RIGHTMOST;
            set_page_flags(&mut img[..], new_flags);
            rebuild_page(
                &mut img[..],
                &self.desc,
                &items[..left_count],
                Some((&hikey_bytes, hikey_flags)),
            )?;
            if !is_leaf {
                set_page_n_ondisk(&mut img[..], left_count);
            }
        }

        if level == self.root_level {
            // First split at the top: the pre-initialized page above becomes
            // the new root.
            self.root_level = level + 1;
            debug!(root_level = self.root_level, "tree grew a level");
        }

        let downlink = self
            .smgr
            .perform_page_io_build(&self.stack[level].img[..], &self.meta)?;
        if is_leaf {
            self.meta.leaf_pages_num.fetch_add(1, Ordering::Relaxed);
        }

        // The new right sibling becomes the level's open page. Its first
        // item turns into the minus-infinity downlink on non-leaf levels:
        // the key is redundant with the separator pushed upwards.
        let mut right = new_page_buf();
        let mut right_flags = PAGE_FLAG_RIGHTMOST;
        if is_leaf {
            right_flags |= PAGE_FLAG_LEAF;
        }
        init_page(&mut right[..], right_flags, level as u8);
        for (pos, item) in items[left_count..].iter().enumerate() {
            if !is_leaf && pos == 0 {
                page_append_item(
                    &mut right[..],
                    &item.bytes[..NONLEAF_TUPLE_HEADER_LEN],
                    &[],
                    0,
                )?;
            } else {
                page_append_item(&mut right[..], &[], &item.bytes, item.flags)?;
            }
        }

        let prev_separator = self.stack[level].separator.take();
        self.stack[level].separator = Some(Tuple::new(
            hikey_flags,
            Bytes::copy_from_slice(&hikey_bytes),
        ));
        self.stack[level].img = right;

        self.put_downlink(level + 1, downlink, prev_separator)
    }

    /// Flushes every open page bottom-up, finalizes the root, and returns
    /// the tree's checkpoint file header. The segment manager is synced
    /// before returning.
    pub fn finish(mut self) -> Result<CheckpointFileHeader> {
        // Pushing a level's final downlink can split the level above, which
        // grows the tree; re-reading root_level keeps the walk complete.
        let mut level = 0;
        while level < self.root_level {
            {
                let img = &mut self.stack[level].img;
                if level != 0 {
                    let n = page_items_count(&img[..]);
                    set_page_n_ondisk(&mut img[..], n);
                }
                split_page_by_chunks(&mut img[..], &self.desc)?;
            }
            let downlink = self
                .smgr
                .perform_page_io_build(&self.stack[level].img[..], &self.meta)?;
            if level == 0 {
                self.meta.leaf_pages_num.fetch_add(1, Ordering::Relaxed);
            }
            let separator = self.stack[level].separator.take();
            self.put_downlink(level + 1, downlink, separator)?;
            level += 1;
        }

        let root_level = self.root_level;
        {
            let img = &mut self.stack[root_level].img;
            if root_level == 0 {
                set_page_flags(
                    &mut img[..],
                    PAGE_FLAG_ROOT_INIT
                        | PAGE_FLAG_LEAF
                        | PAGE_FLAG_LEFTMOST
                        | PAGE_FLAG_RIGHTMOST,
                );
            } else {
                let n = page_items_count(&img[..]);
                set_page_n_ondisk(&mut img[..], n);
            }
            split_page_by_chunks(&mut img[..], &self.desc)?;
        }
        let root_downlink = self
            .smgr
            .perform_page_io_build(&self.stack[root_level].img[..], &self.meta)?;
        if root_level == 0 {
            self.meta.leaf_pages_num.fetch_add(1, Ordering::Relaxed);
        }

        self.smgr.close(&self.meta)?;

        let slot = (self.smgr.checkpoint_num() % 2) as usize;
        let header = CheckpointFileHeader {
            root_downlink,
            datafile_length: self.meta.datafile_length[slot].load(Ordering::Acquire),
            num_free_blocks: self.meta.num_free_blocks.load(Ordering::Acquire),
            leaf_pages_num: self.meta.leaf_pages_num.load(Ordering::Acquire),
            ctid: self.meta.ctid.load(Ordering::Acquire),
            bridge_ctid: self.meta.bridge_ctid.load(Ordering::Acquire),
        };
        debug!(
            leaf_pages = header.leaf_pages_num,
            root_level, "bulk build finished"
        );
        Ok(header)
    }
}

/// Drains a sorted tuple stream into a fresh tree.
///
/// The sorter must already have been fed; the first fetch performs the sort
/// and tuples come out in index order. The resulting header describes the
/// finished tree.
pub fn write_index_data(
    desc: Arc<IndexDescriptor>,
    smgr: SegmentManager,
    sorter: &mut IndexBuildSorter,
    ctid: u64,
    bridge_ctid: u64,
) -> Result<CheckpointFileHeader> {
    let mut state = BuildState::start(desc, smgr, ctid, bridge_ctid);
    while let Some(tuple) = sorter.get_tuple()? {
        state.add_tuple(&tuple)?;
    }
    state.finish()
}
