//! Reading finished trees back from disk.
//!
//! The builder's output is verified by walking downlinks depth-first: an
//! in-order traversal of the leaves must reproduce the sorted input stream.
//! This reader is also what consistency checks and tests use to inspect
//! page images level by level.

use std::sync::Arc;

use bytes::Bytes;

use crate::buffers::{BufferCache, BufferTag};
use crate::descr::IndexDescriptor;
use crate::error::{EngineError, Result};
use crate::page::chunks::{chunk_items_count, item_at, ItemLocator};
use crate::page::{
    new_page_buf, page_chunks_count, page_is, NonLeafTupleHeader, PageBuf,
    LEAF_TUPLE_HEADER_LEN, NONLEAF_TUPLE_HEADER_LEN, PAGE_FLAG_LEAF,
};
use crate::tuple::{tuple_size_raw, Tuple};
use crate::types::{disk_downlink_block, downlink_is_disk, Downlink, BLCKSZ};

/// Read-only access to a tree rooted at a known downlink.
pub struct TreeReader {
    cache: Arc<BufferCache>,
    tag: BufferTag,
    desc: Arc<IndexDescriptor>,
}

impl TreeReader {
    /// Reader over the relation's data file space.
    pub fn new(cache: Arc<BufferCache>, tag: BufferTag, desc: Arc<IndexDescriptor>) -> Self {
        Self { cache, tag, desc }
    }

    /// Fetches the page image a downlink refers to.
    pub fn read_page(&self, downlink: Downlink) -> Result<PageBuf> {
        if !downlink_is_disk(downlink) {
            return Err(EngineError::InvalidArgument(
                "reader requires an on-disk downlink".into(),
            ));
        }
        let mut img = new_page_buf();
        let offset = disk_downlink_block(downlink) * BLCKSZ as u64;
        self.cache.read(self.tag, offset, &mut img[..])?;
        Ok(img)
    }

    /// Collects every leaf tuple under `root` in key order.
    pub fn scan_tuples(&self, root: Downlink) -> Result<Vec<Tuple>> {
        let mut out = Vec::new();
        self.collect(root, &mut out)?;
        Ok(out)
    }

    fn collect(&self, downlink: Downlink, out: &mut Vec<Tuple>) -> Result<()> {
        let img = self.read_page(downlink)?;
        if page_is(&img[..], PAGE_FLAG_LEAF) {
            for chunk in 0..page_chunks_count(&img[..]) {
                for item in 0..chunk_items_count(&img[..], chunk) {
                    let (bytes, flags) = item_at(&img[..], ItemLocator { chunk, item })?;
                    let data = &bytes[LEAF_TUPLE_HEADER_LEN..];
                    let size = tuple_size_raw(data, flags, &self.desc.leaf_spec);
                    if size > data.len() {
                        return Err(EngineError::Corruption(
                            "leaf tuple extends past its item".into(),
                        ));
                    }
                    out.push(Tuple::new(flags, Bytes::copy_from_slice(&data[..size])));
                }
            }
        } else {
            for chunk in 0..page_chunks_count(&img[..]) {
                for item in 0..chunk_items_count(&img[..], chunk) {
                    let (bytes, _) = item_at(&img[..], ItemLocator { chunk, item })?;
                    let header = NonLeafTupleHeader::parse(&bytes[..NONLEAF_TUPLE_HEADER_LEN]);
                    self.collect(header.downlink, out)?;
                }
            }
        }
        Ok(())
    }

    /// Number of levels from root to leaves, following leftmost downlinks.
    pub fn depth(&self, root: Downlink) -> Result<usize> {
        let mut depth = 1;
        let mut img = self.read_page(root)?;
        while !page_is(&img[..], PAGE_FLAG_LEAF) {
            let (bytes, _) = item_at(&img[..], ItemLocator { chunk: 0, item: 0 })?;
            let header = NonLeafTupleHeader::parse(&bytes[..NONLEAF_TUPLE_HEADER_LEN]);
            img = self.read_page(header.downlink)?;
            depth += 1;
        }
        Ok(depth)
    }

    /// Walks every page under `root`, calling `f(image, level)` pre-order.
    pub fn visit_pages(
        &self,
        root: Downlink,
        f: &mut dyn FnMut(&[u8], u8) -> Result<()>,
    ) -> Result<()> {
        let img = self.read_page(root)?;
        let level = crate::page::page_level(&img[..]);
        f(&img[..], level)?;
        if !page_is(&img[..], PAGE_FLAG_LEAF) {
            for chunk in 0..page_chunks_count(&img[..]) {
                for item in 0..chunk_items_count(&img[..], chunk) {
                    let (bytes, _) = item_at(&img[..], ItemLocator { chunk, item })?;
                    let header = NonLeafTupleHeader::parse(&bytes[..NONLEAF_TUPLE_HEADER_LEN]);
                    self.visit_pages(header.downlink, f)?;
                }
            }
        }
        Ok(())
    }
}
