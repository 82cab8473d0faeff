//! In-memory pages shared with lock-free readers.
//!
//! The descent fast path never takes a lock: it works on a copied page image
//! and validates the copy against the live page's atomic state word. Writers
//! raise the read-blocked bit for the duration of a mutation and advance the
//! change count when they finish, so a reader can tell whether the bytes it
//! copied were consistent.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::page::{
    new_page_buf, PageBuf, PAGE_STATE_CHANGE_COUNT_MASK, PAGE_STATE_READ_BLOCKED,
};
use crate::types::BLCKSZ;

/// A page resident in memory, observable by lock-free readers.
pub struct InMemoryPage {
    state: AtomicU64,
    image: RwLock<PageBuf>,
}

impl Default for InMemoryPage {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryPage {
    /// Creates an empty in-memory page.
    pub fn new() -> Self {
        Self {
            state: AtomicU64::new(0),
            image: RwLock::new(new_page_buf()),
        }
    }

    /// Creates an in-memory page holding `image`.
    pub fn from_image(image: &[u8]) -> Self {
        let page = Self::new();
        page.with_write(|img| img.copy_from_slice(image));
        page
    }

    /// Current state word.
    #[inline]
    pub fn state(&self) -> u64 {
        self.state.load(Ordering::Acquire)
    }

    /// Runs `f` over the page bytes under the write lock, blocking lock-free
    /// readers for the duration and bumping the change count afterwards.
    pub fn with_write<R>(&self, f: impl FnOnce(&mut [u8; BLCKSZ]) -> R) -> R {
        let mut guard = self.image.write();
        self.state
            .fetch_or(PAGE_STATE_READ_BLOCKED, Ordering::AcqRel);
        let result = f(&mut guard);
        let state = self.state.load(Ordering::Acquire);
        let next = ((state & PAGE_STATE_CHANGE_COUNT_MASK) + 1) & PAGE_STATE_CHANGE_COUNT_MASK;
        self.state.store(next, Ordering::Release);
        result
    }

    /// Copies the page into `dst`, stamping the copy's header state word
    /// with the change count the copy corresponds to.
    ///
    /// The returned value is that change count; a later state snapshot that
    /// differs (or shows the read-blocked bit) invalidates the copy.
    pub fn copy_image(&self, dst: &mut [u8; BLCKSZ]) -> u64 {
        let guard = self.image.read();
        dst.copy_from_slice(&guard[..]);
        drop(guard);
        let state = self.state();
        let change_count = state & PAGE_STATE_CHANGE_COUNT_MASK;
        dst[0..8].copy_from_slice(&change_count.to_le_bytes());
        change_count
    }

    /// Reads the page under the shared lock without copying.
    pub fn with_read<R>(&self, f: impl FnOnce(&[u8; BLCKSZ]) -> R) -> R {
        let guard = self.image.read();
        f(&guard)
    }

    /// Raises the read-blocked bit without mutating, for tests that need to
    /// force `Retry` outcomes.
    pub fn block_reads(&self) {
        self.state
            .fetch_or(PAGE_STATE_READ_BLOCKED, Ordering::AcqRel);
    }

    /// Clears the read-blocked bit.
    pub fn unblock_reads(&self) {
        self.state
            .fetch_and(!PAGE_STATE_READ_BLOCKED, Ordering::AcqRel);
    }
}
