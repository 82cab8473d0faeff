//! Tag-partitioned block buffer cache over segmented, versioned files.
//!
//! The cache maps `(tag, block)` identities to fixed-size slots. Slots are
//! sharded into groups of four; a block always lands in group
//! `block % groups_count`, so a lookup scans at most four slots. Eviction is
//! clock-like: every miss halves the usage counters of the group it scans
//! and replaces the slot with the smallest one. While a victim is being
//! reloaded its previous identity stays published as a *shadow*, letting
//! concurrent seekers of the old block wait on the slot instead of racing to
//! reload it elsewhere.
//!
//! Every tag owns a file space cut into `single_file_size` segments, named
//! through a printf-style template over the two halves of the 64-bit file
//! number. Files are versioned by `.N` suffix: reads open the newest extant
//! version and, when it is older than the configured current version, run
//! the tag's transform callback over the block in place.
//!
//! File handles are cached per worker, one slot per thread: opening another
//! file closes the previous one, and no lock is held across file I/O. The
//! group and slot locks are the cache's only shared locks.

use std::cell::RefCell;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::error::{EngineError, Result};
use crate::io::{FileIo, Vfs};
use crate::types::{BlockNumber, BLCKSZ};

/// Slots per group; lookups scan at most this many entries.
pub const BUFFERS_PER_GROUP: usize = 4;

/// Maximum number of tag-partitioned file spaces per cache.
pub const MAX_TAGS: usize = 4;

/// Index of one tag's file space within a cache.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct BufferTag(pub u32);

/// printf-style filename template over the halves of a 64-bit file number.
///
/// The pattern must contain two `%08X` slots; the first receives the upper
/// 32 bits of the file number and the second the lower 32 bits.
#[derive(Clone, Debug)]
pub struct FileTemplate {
    pattern: String,
}

impl FileTemplate {
    /// Wraps a pattern, e.g. `"data/seg-%08X%08X"`.
    pub fn new(pattern: impl Into<String>) -> Self {
        let pattern = pattern.into();
        debug_assert_eq!(pattern.matches("%08X").count(), 2, "two %08X slots required");
        Self { pattern }
    }

    /// Renders the base (unversioned) path for `file_num`.
    pub fn path(&self, file_num: u64) -> PathBuf {
        let hi = format!("{:08X}", (file_num >> 32) as u32);
        let lo = format!("{:08X}", file_num as u32);
        let with_hi = self.pattern.replacen("%08X", &hi, 1);
        PathBuf::from(with_hi.replacen("%08X", &lo, 1))
    }

    /// Renders the path of `file_num` at `version` (0 means unversioned).
    pub fn versioned_path(&self, file_num: u64, version: u32) -> PathBuf {
        let base = self.path(file_num);
        if version == 0 {
            base
        } else {
            let mut os = base.into_os_string();
            os.push(format!(".{version}"));
            PathBuf::from(os)
        }
    }
}

/// Callback upgrading one block read from an older file version.
///
/// Receives the block bytes, the tag, and the version pair; returns false to
/// signal an unrecoverable transform failure.
pub type TransformFn = Box<dyn Fn(&mut [u8], BufferTag, u32, u32) -> bool + Send + Sync>;

/// Per-tag configuration.
pub struct TagConfig {
    /// Filename template of the tag's file space.
    pub template: FileTemplate,
    /// Current format version; 0 means unversioned.
    pub version: u32,
    /// Optional read-time upgrade callback for older versions.
    pub transform: Option<TransformFn>,
}

impl TagConfig {
    /// Unversioned tag over `template`.
    pub fn new(template: FileTemplate) -> Self {
        Self {
            template,
            version: 0,
            transform: None,
        }
    }
}

/// Cache construction parameters.
pub struct BufferCacheOptions {
    /// Total slot count; rounded up to whole groups of four.
    pub buffers_count: u32,
    /// Bytes per on-disk file; must be a multiple of the block size.
    pub single_file_size: u64,
    /// One entry per tag, at most [`MAX_TAGS`].
    pub tags: Vec<TagConfig>,
}

struct SlotBody {
    dirty: bool,
    data: Box<[u8; BLCKSZ]>,
}

impl SlotBody {
    fn new() -> Self {
        Self {
            dirty: false,
            data: vec![0u8; BLCKSZ]
                .into_boxed_slice()
                .try_into()
                .expect("vec has BLCKSZ bytes"),
        }
    }
}

type SlotKey = (BufferTag, BlockNumber);

struct BufferGroup {
    /// Slot identities; the group-level lock tranche.
    idents: RwLock<[Option<SlotKey>; BUFFERS_PER_GROUP]>,
    /// Identities being replaced, published while the victim reloads.
    shadow: Mutex<[Option<SlotKey>; BUFFERS_PER_GROUP]>,
    usage: [AtomicU32; BUFFERS_PER_GROUP],
    slots: [RwLock<SlotBody>; BUFFERS_PER_GROUP],
}

impl BufferGroup {
    fn new() -> Self {
        Self {
            idents: RwLock::new([None; BUFFERS_PER_GROUP]),
            shadow: Mutex::new([None; BUFFERS_PER_GROUP]),
            usage: Default::default(),
            slots: [
                RwLock::new(SlotBody::new()),
                RwLock::new(SlotBody::new()),
                RwLock::new(SlotBody::new()),
                RwLock::new(SlotBody::new()),
            ],
        }
    }
}

/// Distinguishes cache instances inside the per-worker file slot.
static NEXT_CACHE_ID: AtomicU64 = AtomicU64::new(1);

struct WorkerFile {
    cache_id: u64,
    tag: BufferTag,
    file_num: u64,
    version: u32,
    io: Box<dyn FileIo>,
}

thread_local! {
    /// The worker's single open-file slot.
    static WORKER_FILE: RefCell<Option<WorkerFile>> = const { RefCell::new(None) };
}

/// The buffer cache handle. Construct once and share via `Arc`.
pub struct BufferCache {
    id: u64,
    groups: Vec<BufferGroup>,
    tags: Vec<TagConfig>,
    single_file_size: u64,
    vfs: Arc<dyn Vfs>,
}

impl BufferCache {
    /// Builds a cache over `vfs` with the given options.
    pub fn new(options: BufferCacheOptions, vfs: Arc<dyn Vfs>) -> Result<Self> {
        if options.buffers_count == 0 {
            return Err(EngineError::InvalidArgument(
                "buffer count must be greater than zero".into(),
            ));
        }
        if options.single_file_size == 0 || options.single_file_size % BLCKSZ as u64 != 0 {
            return Err(EngineError::InvalidArgument(
                "single file size must be a positive multiple of the block size".into(),
            ));
        }
        if options.tags.is_empty() || options.tags.len() > MAX_TAGS {
            return Err(EngineError::InvalidArgument(format!(
                "tag count must be between 1 and {MAX_TAGS}"
            )));
        }
        let groups_count =
            (options.buffers_count as usize + BUFFERS_PER_GROUP - 1) / BUFFERS_PER_GROUP;
        let groups = (0..groups_count).map(|_| BufferGroup::new()).collect();
        Ok(Self {
            id: NEXT_CACHE_ID.fetch_add(1, Ordering::Relaxed),
            groups,
            tags: options.tags,
            single_file_size: options.single_file_size,
            vfs,
        })
    }

    /// Number of slot groups.
    pub fn groups_count(&self) -> usize {
        self.groups.len()
    }

    /// Blocks stored per on-disk file.
    pub fn blocks_per_file(&self) -> u64 {
        self.single_file_size / BLCKSZ as u64
    }

    fn tag_config(&self, tag: BufferTag) -> Result<&TagConfig> {
        self.tags.get(tag.0 as usize).ok_or_else(|| {
            EngineError::InvalidArgument(format!("buffer tag {} out of range", tag.0))
        })
    }

    /// Reads `dst.len()` bytes starting at byte `offset` of the tag's space.
    pub fn read(&self, tag: BufferTag, offset: u64, dst: &mut [u8]) -> Result<()> {
        self.tag_config(tag)?;
        if dst.is_empty() {
            return Err(EngineError::InvalidArgument("empty buffer read".into()));
        }
        self.rw(tag, offset, RwBuf::Read(dst))
    }

    /// Writes `src` starting at byte `offset` of the tag's space.
    ///
    /// Writes only dirty cache slots; [`Self::sync`] flushes them to disk.
    pub fn write(&self, tag: BufferTag, offset: u64, src: &[u8]) -> Result<()> {
        self.tag_config(tag)?;
        if src.is_empty() {
            return Err(EngineError::InvalidArgument("empty buffer write".into()));
        }
        self.rw(tag, offset, RwBuf::Write(src))
    }

    fn rw(&self, tag: BufferTag, offset: u64, mut buf: RwBuf<'_, '_>) -> Result<()> {
        let size = buf.len() as u64;
        let first_block = offset / BLCKSZ as u64;
        let last_block = (offset + size - 1) / BLCKSZ as u64;
        let mut cursor = 0usize;
        for block in first_block..=last_block {
            let copy_offset = if block == first_block {
                (offset % BLCKSZ as u64) as usize
            } else {
                0
            };
            let copy_size = if first_block == last_block {
                size as usize
            } else if block == first_block {
                BLCKSZ - copy_offset
            } else if block == last_block {
                ((offset + size - 1) % BLCKSZ as u64) as usize + 1
            } else {
                BLCKSZ
            };
            let exclusive = matches!(buf, RwBuf::Write(_));
            let mut guard = self.acquire_slot(tag, block, exclusive)?;
            match &mut buf {
                RwBuf::Read(dst) => {
                    dst[cursor..cursor + copy_size]
                        .copy_from_slice(&guard.data()[copy_offset..copy_offset + copy_size]);
                }
                RwBuf::Write(src) => {
                    let body = guard.data_mut();
                    body.data[copy_offset..copy_offset + copy_size]
                        .copy_from_slice(&src[cursor..cursor + copy_size]);
                    body.dirty = true;
                }
            }
            cursor += copy_size;
        }
        Ok(())
    }

    fn acquire_slot(
        &self,
        tag: BufferTag,
        block: BlockNumber,
        exclusive: bool,
    ) -> Result<SlotGuard<'_>> {
        let key = (tag, block);
        let group = &self.groups[(block % self.groups.len() as u64) as usize];
        loop {
            // Fast path: the block is resident.
            {
                let idents = group.idents.read();
                for (i, ident) in idents.iter().enumerate() {
                    if *ident == Some(key) {
                        let guard = lock_slot(&group.slots[i], exclusive);
                        bump_usage(&group.usage[i]);
                        return Ok(guard);
                    }
                }
            }

            // Miss: retake the group lock exclusively and re-scan, because a
            // concurrent seeker may have loaded the block meanwhile.
            let mut idents = group.idents.write();
            let mut hit = None;
            for (i, ident) in idents.iter().enumerate() {
                if *ident == Some(key) {
                    hit = Some(i);
                    break;
                }
            }
            if let Some(i) = hit {
                let guard = lock_slot(&group.slots[i], exclusive);
                bump_usage(&group.usage[i]);
                return Ok(guard);
            }

            // A reload of this block may be in progress: wait on the slot
            // whose shadow matches rather than loading a second copy.
            let waiting_on = {
                let shadow = group.shadow.lock();
                shadow.iter().position(|s| *s == Some(key))
            };
            if let Some(i) = waiting_on {
                drop(idents);
                drop(group.slots[i].read());
                continue;
            }

            // Choose a victim: smallest usage count wins, halving every
            // counter along the way so hot slots age.
            let mut victim = 0usize;
            let mut victim_usage = 0u32;
            for i in 0..BUFFERS_PER_GROUP {
                let usage = group.usage[i].load(Ordering::Relaxed);
                if i == 0 || usage < victim_usage {
                    victim = i;
                    victim_usage = usage;
                }
                group.usage[i].store(usage / 2, Ordering::Relaxed);
            }

            let prev = idents[victim].replace(key);
            group.shadow.lock()[victim] = prev;
            group.usage[victim].store(1, Ordering::Relaxed);

            let mut body = group.slots[victim].write();
            drop(idents);

            let was_dirty = body.dirty;
            body.dirty = false;
            if was_dirty {
                let (prev_tag, prev_block) =
                    prev.expect("dirty slot always has an identity");
                debug!(
                    tag = prev_tag.0,
                    block = prev_block,
                    "evicting dirty buffer, writing back"
                );
                self.write_block_data(prev_tag, prev_block, &body.data[..])?;
            }
            self.read_block(tag, block, &mut body.data[..])?;
            group.shadow.lock()[victim] = None;
            return Ok(SlotGuard::Write(body));
        }
    }

    /// Runs `f` over the worker's open file for `(tag, file_num)`, opening
    /// it first when the thread's slot holds something else.
    ///
    /// The slot is thread-local, so file I/O never contends on a shared
    /// lock; the slot remembers which cache it belongs to so independent
    /// caches on one thread stay apart.
    fn with_worker_file<R>(
        &self,
        tag: BufferTag,
        file_num: u64,
        f: impl FnOnce(&WorkerFile) -> Result<R>,
    ) -> Result<R> {
        WORKER_FILE.with(|slot| {
            let mut slot = slot.borrow_mut();
            let reusable = matches!(
                slot.as_ref(),
                Some(open)
                    if open.cache_id == self.id && open.tag == tag && open.file_num == file_num
            );
            if !reusable {
                // Opening a new file closes the previous one.
                *slot = None;

                let cfg = self.tag_config(tag)?;
                let mut opened = None;
                for version in (0..=cfg.version).rev() {
                    let path = cfg.template.versioned_path(file_num, version);
                    if let Some(io) = self.vfs.open(&path, false)? {
                        opened = Some((io, version));
                        break;
                    }
                }
                let (io, version) = match opened {
                    Some(found) => found,
                    None => {
                        // No version exists yet: create the file at the
                        // current version.
                        let path = cfg.template.versioned_path(file_num, cfg.version);
                        let io = self.vfs.open(&path, true)?.ok_or_else(|| {
                            EngineError::Corruption(format!(
                                "could not create buffer file {}",
                                path.display()
                            ))
                        })?;
                        (io, cfg.version)
                    }
                };
                *slot = Some(WorkerFile {
                    cache_id: self.id,
                    tag,
                    file_num,
                    version,
                    io,
                });
            }
            f(slot.as_ref().expect("slot was just filled"))
        })
    }

    fn file_position(&self, block: BlockNumber) -> (u64, u64) {
        let byte = block * BLCKSZ as u64;
        (byte / self.single_file_size, byte % self.single_file_size)
    }

    fn read_block(&self, tag: BufferTag, block: BlockNumber, data: &mut [u8]) -> Result<()> {
        let (file_num, off) = self.file_position(block);
        let file_version = self.with_worker_file(tag, file_num, |file| {
            let read = file.io.read_at_partial(off, data)?;
            // Short reads past EOF zero-fill the remainder of the block.
            data[read..].fill(0);
            Ok(file.version)
        })?;
        let cfg = self.tag_config(tag)?;
        if file_version < cfg.version {
            if let Some(transform) = &cfg.transform {
                debug!(
                    tag = tag.0,
                    block,
                    from = file_version,
                    to = cfg.version,
                    "transforming block read from older file version"
                );
                if !transform(data, tag, file_version, cfg.version) {
                    return Err(EngineError::VersionTransform {
                        from: file_version,
                        to: cfg.version,
                    });
                }
            }
        }
        Ok(())
    }

    fn write_block_data(&self, tag: BufferTag, block: BlockNumber, data: &[u8]) -> Result<()> {
        let (file_num, off) = self.file_position(block);
        self.with_worker_file(tag, file_num, |file| file.io.write_at(off, data))
    }

    /// Flushes dirty resident blocks of `tag` within `[first, last]`.
    fn flush_blocks(&self, tag: BufferTag, first: BlockNumber, last: BlockNumber) -> Result<()> {
        for group in &self.groups {
            let idents = group.idents.read();
            for (i, ident) in idents.iter().enumerate() {
                let Some((slot_tag, block)) = *ident else {
                    continue;
                };
                if slot_tag != tag || block < first || block > last {
                    continue;
                }
                let mut body = group.slots[i].write();
                if body.dirty {
                    self.write_block_data(slot_tag, block, &body.data[..])?;
                    body.dirty = false;
                }
            }
        }
        Ok(())
    }

    /// Invalidates resident blocks of `tag` within `[first, last]` without
    /// writing them back.
    fn wipe_blocks(&self, tag: BufferTag, first: BlockNumber, last: BlockNumber) {
        for group in &self.groups {
            let mut idents = group.idents.write();
            for (i, ident) in idents.iter_mut().enumerate() {
                let Some((slot_tag, block)) = *ident else {
                    continue;
                };
                if slot_tag != tag || block < first || block > last {
                    continue;
                }
                let mut body = group.slots[i].write();
                body.dirty = false;
                *ident = None;
                drop(body);
            }
        }
    }

    /// Flushes dirty blocks covering `[from, to)` and fsyncs every file the
    /// range touches.
    pub fn sync(&self, tag: BufferTag, from: u64, to: u64) -> Result<()> {
        self.tag_config(tag)?;
        if to <= from {
            return Ok(());
        }
        let first_block = from / BLCKSZ as u64;
        let mut last_block = to / BLCKSZ as u64;
        if to % BLCKSZ as u64 == 0 {
            last_block -= 1;
        }
        self.flush_blocks(tag, first_block, last_block)?;

        let first_file = from / self.single_file_size;
        let mut last_file = to / self.single_file_size;
        if to % self.single_file_size == 0 {
            last_file -= 1;
        }
        for file_num in first_file..=last_file {
            self.with_worker_file(tag, file_num, |file| file.io.sync_all())?;
        }
        Ok(())
    }

    /// Invalidates every resident block backed by files
    /// `[first_file, last_file]` of `tag`, then unlinks each file, newest
    /// version first.
    pub fn unlink_files_range(
        &self,
        tag: BufferTag,
        first_file: u64,
        last_file: u64,
    ) -> Result<()> {
        let cfg = self.tag_config(tag)?;
        let bpf = self.blocks_per_file();
        self.wipe_blocks(tag, first_file * bpf, (last_file + 1) * bpf - 1);

        // Drop this worker's cached handle if it points into the doomed
        // range; other workers' slots turn over on their next open.
        WORKER_FILE.with(|slot| {
            let mut slot = slot.borrow_mut();
            if let Some(open) = slot.as_ref() {
                if open.cache_id == self.id
                    && open.tag == tag
                    && (first_file..=last_file).contains(&open.file_num)
                {
                    *slot = None;
                }
            }
        });

        for file_num in first_file..=last_file {
            for version in (0..=cfg.version).rev() {
                let path = cfg.template.versioned_path(file_num, version);
                if !self.vfs.unlink(&path)? {
                    continue;
                }
                debug!(tag = tag.0, file = %path.display(), "unlinked buffer file");
            }
        }
        Ok(())
    }

    /// Flushes every dirty block of `tag`; used at shutdown and by tests.
    pub fn flush_all(&self, tag: BufferTag) -> Result<()> {
        self.tag_config(tag)?;
        self.flush_blocks(tag, 0, BlockNumber::MAX)
    }
}

impl Drop for BufferCache {
    fn drop(&mut self) {
        for tag in 0..self.tags.len() {
            if let Err(err) = self.flush_all(BufferTag(tag as u32)) {
                warn!(tag, error = %err, "failed to flush buffers on drop");
            }
        }
    }
}

enum RwBuf<'r, 'w> {
    Read(&'r mut [u8]),
    Write(&'w [u8]),
}

impl RwBuf<'_, '_> {
    fn len(&self) -> usize {
        match self {
            RwBuf::Read(b) => b.len(),
            RwBuf::Write(b) => b.len(),
        }
    }
}

enum SlotGuard<'a> {
    Read(parking_lot::RwLockReadGuard<'a, SlotBody>),
    Write(parking_lot::RwLockWriteGuard<'a, SlotBody>),
}

impl SlotGuard<'_> {
    fn data(&self) -> &[u8] {
        match self {
            SlotGuard::Read(g) => &g.data[..],
            SlotGuard::Write(g) => &g.data[..],
        }
    }

    fn data_mut(&mut self) -> &mut SlotBody {
        match self {
            SlotGuard::Read(_) => unreachable!("writers always hold the slot exclusively"),
            SlotGuard::Write(g) => g,
        }
    }
}

fn lock_slot(slot: &RwLock<SlotBody>, exclusive: bool) -> SlotGuard<'_> {
    if exclusive {
        SlotGuard::Write(slot.write())
    } else {
        SlotGuard::Read(slot.read())
    }
}

fn bump_usage(usage: &AtomicU32) {
    let _ = usage.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |u| {
        if u == u32::MAX {
            None
        } else {
            Some(u + 1)
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::StdVfs;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn multi_tag_cache(dir: &TempDir, buffers: u32, file_size: u64, n_tags: u32) -> BufferCache {
        let tags = (0..n_tags)
            .map(|i| {
                TagConfig::new(FileTemplate::new(format!(
                    "{}/t{}-%08X%08X",
                    dir.path().display(),
                    i
                )))
            })
            .collect();
        BufferCache::new(
            BufferCacheOptions {
                buffers_count: buffers,
                single_file_size: file_size,
                tags,
            },
            Arc::new(StdVfs),
        )
        .expect("cache")
    }

    fn simple_cache(dir: &TempDir, buffers: u32, file_size: u64) -> BufferCache {
        multi_tag_cache(dir, buffers, file_size, 1)
    }

    const TAG: BufferTag = BufferTag(0);

    #[test]
    fn write_then_read_same_bytes() {
        let dir = TempDir::new().expect("tempdir");
        let cache = simple_cache(&dir, 16, 4 * BLCKSZ as u64);
        let src: Vec<u8> = (0..1000u32).map(|i| i as u8).collect();
        cache.write(TAG, 100, &src).expect("write");
        let mut dst = vec![0u8; src.len()];
        cache.read(TAG, 100, &mut dst).expect("read");
        assert_eq!(src, dst);
    }

    #[test]
    fn read_write_spanning_blocks() {
        let dir = TempDir::new().expect("tempdir");
        let cache = simple_cache(&dir, 16, 4 * BLCKSZ as u64);
        let src: Vec<u8> = (0..3 * BLCKSZ).map(|i| (i % 251) as u8).collect();
        let offset = BLCKSZ as u64 / 2;
        cache.write(TAG, offset, &src).expect("write");
        let mut dst = vec![0u8; src.len()];
        cache.read(TAG, offset, &mut dst).expect("read");
        assert_eq!(src, dst);
    }

    #[test]
    fn eviction_writes_back_and_reload_restores() {
        let dir = TempDir::new().expect("tempdir");
        // 4 buffers = 1 group; writing 8 distinct blocks forces eviction.
        let cache = simple_cache(&dir, 4, 2 * BLCKSZ as u64);
        for block in 0..8u64 {
            let payload = vec![block as u8 + 1; BLCKSZ];
            cache
                .write(TAG, block * BLCKSZ as u64, &payload)
                .expect("write");
        }
        for block in 0..8u64 {
            let mut dst = vec![0u8; BLCKSZ];
            cache
                .read(TAG, block * BLCKSZ as u64, &mut dst)
                .expect("read");
            assert!(dst.iter().all(|&b| b == block as u8 + 1), "block {block}");
        }
        // Two files exist: blocks 0..2 and 2..4 etc. With 16 KiB files and 8
        // blocks, files 0..4 must all be present.
        for file_num in 0..4u64 {
            let path = cache.tags[0].template.path(file_num);
            assert!(path.exists(), "missing {}", path.display());
        }
    }

    #[test]
    fn eviction_terminates_when_every_slot_is_hot() {
        let dir = TempDir::new().expect("tempdir");
        let cache = simple_cache(&dir, 4, 4 * BLCKSZ as u64);
        // Heat up all four slots of the single group.
        for block in 0..4u64 {
            let payload = vec![9u8; BLCKSZ];
            cache
                .write(TAG, block * BLCKSZ as u64, &payload)
                .expect("write");
            let mut dst = vec![0u8; BLCKSZ];
            for _ in 0..10 {
                cache
                    .read(TAG, block * BLCKSZ as u64, &mut dst)
                    .expect("read");
            }
        }
        // A fifth block must still find a victim.
        let payload = vec![1u8; BLCKSZ];
        cache
            .write(TAG, 4 * BLCKSZ as u64, &payload)
            .expect("write evicts");
        let mut dst = vec![0u8; BLCKSZ];
        cache.read(TAG, 4 * BLCKSZ as u64, &mut dst).expect("read");
        assert_eq!(dst, payload);
    }

    #[test]
    fn zero_fill_past_eof() {
        let dir = TempDir::new().expect("tempdir");
        let cache = simple_cache(&dir, 8, 4 * BLCKSZ as u64);
        let mut dst = vec![0xAAu8; 64];
        cache.read(TAG, 0, &mut dst).expect("read from empty file");
        assert!(dst.iter().all(|&b| b == 0));
    }

    #[test]
    fn sync_persists_written_range() {
        let dir = TempDir::new().expect("tempdir");
        let src = vec![0x5Au8; BLCKSZ];
        {
            let cache = simple_cache(&dir, 8, 4 * BLCKSZ as u64);
            cache.write(TAG, 0, &src).expect("write");
            cache.sync(TAG, 0, BLCKSZ as u64).expect("sync");
        }
        // Fresh cache (simulated restart) observes the synced contents.
        let cache = simple_cache(&dir, 8, 4 * BLCKSZ as u64);
        let mut dst = vec![0u8; BLCKSZ];
        cache.read(TAG, 0, &mut dst).expect("read");
        assert_eq!(src, dst);
    }

    #[test]
    fn unlink_files_range_wipes_and_removes() {
        let dir = TempDir::new().expect("tempdir");
        let cache = simple_cache(&dir, 8, 2 * BLCKSZ as u64);
        for block in 0..12u64 {
            let payload = vec![block as u8; BLCKSZ];
            cache
                .write(TAG, block * BLCKSZ as u64, &payload)
                .expect("write");
        }
        cache.sync(TAG, 0, 12 * BLCKSZ as u64).expect("sync");
        // Dirty a block inside file 4 (blocks 8..10), then unlink files 3..5.
        cache
            .write(TAG, 8 * BLCKSZ as u64, &vec![0xFFu8; BLCKSZ])
            .expect("dirty");
        cache.unlink_files_range(TAG, 3, 5).expect("unlink");
        for file_num in 3..=5u64 {
            assert!(!cache.tags[0].template.path(file_num).exists());
        }
        assert!(cache.tags[0].template.path(0).exists());
        // The wiped block re-reads as zeros, not the dirty bytes.
        let mut dst = vec![0u8; BLCKSZ];
        cache.read(TAG, 8 * BLCKSZ as u64, &mut dst).expect("read");
        assert!(dst.iter().all(|&b| b == 0));
    }

    #[test]
    fn versioned_open_prefers_newest_and_transforms() {
        let dir = TempDir::new().expect("tempdir");
        // Write a block with an unversioned (version 0) tag.
        {
            let cache = simple_cache(&dir, 8, 4 * BLCKSZ as u64);
            let mut payload = vec![7u8; BLCKSZ];
            payload[0] = 42;
            cache.write(TAG, 0, &payload).expect("write");
            cache.sync(TAG, 0, BLCKSZ as u64).expect("sync");
        }
        // Reopen configured at version 2 with a transform zeroing byte 0.
        let tags = vec![TagConfig {
            template: FileTemplate::new(format!("{}/t0-%08X%08X", dir.path().display())),
            version: 2,
            transform: Some(Box::new(|data, _tag, from, to| {
                assert_eq!(from, 0);
                assert_eq!(to, 2);
                data[0] = 0;
                true
            })),
        }];
        let cache = BufferCache::new(
            BufferCacheOptions {
                buffers_count: 8,
                single_file_size: 4 * BLCKSZ as u64,
                tags,
            },
            Arc::new(StdVfs),
        )
        .expect("cache");
        let mut dst = vec![0u8; BLCKSZ];
        cache.read(TAG, 0, &mut dst).expect("read");
        assert_eq!(dst[0], 0, "transform must zero byte 0");
        assert!(dst[1..].iter().all(|&b| b == 7));
    }

    #[test]
    fn failing_transform_is_fatal() {
        let dir = TempDir::new().expect("tempdir");
        {
            let cache = simple_cache(&dir, 8, 4 * BLCKSZ as u64);
            cache.write(TAG, 0, &[1u8; 16]).expect("write");
            cache.sync(TAG, 0, BLCKSZ as u64).expect("sync");
        }
        let tags = vec![TagConfig {
            template: FileTemplate::new(format!("{}/t0-%08X%08X", dir.path().display())),
            version: 1,
            transform: Some(Box::new(|_, _, _, _| false)),
        }];
        let cache = BufferCache::new(
            BufferCacheOptions {
                buffers_count: 8,
                single_file_size: 4 * BLCKSZ as u64,
                tags,
            },
            Arc::new(StdVfs),
        )
        .expect("cache");
        let mut dst = vec![0u8; 16];
        let err = cache.read(TAG, 0, &mut dst).expect_err("transform fails");
        assert!(matches!(err, EngineError::VersionTransform { from: 0, to: 1 }));
    }

    #[test]
    fn concurrent_workers_stay_coherent_across_tags_and_files() {
        let dir = TempDir::new().expect("tempdir");
        // Two tags and tiny files, so every worker's file slot keeps
        // turning over between tags and segment files.
        let cache = Arc::new(multi_tag_cache(&dir, 8, 2 * BLCKSZ as u64, 2));
        let mut handles = Vec::new();
        for t in 0..4u64 {
            let cache = Arc::clone(&cache);
            handles.push(std::thread::spawn(move || {
                for round in 0..50u64 {
                    let tag = BufferTag(((t + round) % 2) as u32);
                    let block = (t * 7 + round) % 16;
                    let payload = vec![(tag.0 as u8) * 31 + block as u8 + 1; 128];
                    cache
                        .write(tag, block * BLCKSZ as u64 + 64, &payload)
                        .expect("write");
                    let mut dst = vec![0u8; 128];
                    cache
                        .read(tag, block * BLCKSZ as u64 + 64, &mut dst)
                        .expect("read");
                    assert_eq!(dst, payload);
                }
            }));
        }
        for handle in handles {
            handle.join().expect("thread");
        }
    }

    #[test]
    fn worker_file_slot_is_per_cache() {
        let dir_a = TempDir::new().expect("tempdir");
        let dir_b = TempDir::new().expect("tempdir");
        {
            let cache_a = simple_cache(&dir_a, 8, 4 * BLCKSZ as u64);
            let cache_b = simple_cache(&dir_b, 8, 4 * BLCKSZ as u64);
            cache_a.write(TAG, 0, &[0xAAu8; BLCKSZ]).expect("write a");
            cache_b.write(TAG, 0, &[0xBBu8; BLCKSZ]).expect("write b");
            cache_a.sync(TAG, 0, BLCKSZ as u64).expect("sync a");
            cache_b.sync(TAG, 0, BLCKSZ as u64).expect("sync b");
        }
        // Fresh caches, same thread, same tag and file number: the second
        // read must not be served through the first cache's open file.
        let cache_a = simple_cache(&dir_a, 8, 4 * BLCKSZ as u64);
        let cache_b = simple_cache(&dir_b, 8, 4 * BLCKSZ as u64);
        let mut dst = vec![0u8; BLCKSZ];
        cache_a.read(TAG, 0, &mut dst).expect("read a");
        assert!(dst.iter().all(|&b| b == 0xAA));
        cache_b.read(TAG, 0, &mut dst).expect("read b");
        assert!(dst.iter().all(|&b| b == 0xBB));
    }

    #[test]
    fn invalid_tag_is_rejected() {
        let dir = TempDir::new().expect("tempdir");
        let cache = simple_cache(&dir, 8, 4 * BLCKSZ as u64);
        let err = cache
            .read(BufferTag(9), 0, &mut [0u8; 8])
            .expect_err("tag out of range");
        assert!(matches!(err, EngineError::InvalidArgument(_)));
    }

    #[test]
    fn file_template_renders_halves() {
        let template = FileTemplate::new("/data/seg-%08X%08X");
        assert_eq!(
            template.path(0x0000_0001_0000_0002),
            PathBuf::from("/data/seg-0000000100000002")
        );
        assert_eq!(
            template.versioned_path(5, 3),
            PathBuf::from("/data/seg-0000000000000005.3")
        );
    }
}
