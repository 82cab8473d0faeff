//! Page I/O for builds, checkpoint-header emission, and the collaborating
//! services the builder consumes: checkpoint numbering, the evicted-tree
//! registry for temporary relations, and the optional part-upload scheduler.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::btree::{CheckpointFileHeader, CHECKPOINT_FILE_HEADER_LEN};
use crate::buffers::{BufferCache, BufferTag};
use crate::descr::{IndexDescriptor, IndexKind, StorageKind};
use crate::error::{EngineError, Result};
use crate::io::Vfs;
use crate::types::{make_disk_downlink, Downlink, RelOids, BLCKSZ};

/// Position counters accumulated across one build.
pub struct BuildMeta {
    /// Data-file length per checkpoint parity slot.
    pub datafile_length: [AtomicU64; 2],
    /// Free blocks available for reuse.
    pub num_free_blocks: AtomicU64,
    /// Count of leaf pages written.
    pub leaf_pages_num: AtomicU32,
    /// Next ctid counter.
    pub ctid: AtomicU64,
    /// Next bridge ctid counter.
    pub bridge_ctid: AtomicU64,
}

impl BuildMeta {
    /// Fresh counters starting from the given position hints.
    pub fn new(ctid: u64, bridge_ctid: u64) -> Self {
        Self {
            datafile_length: [AtomicU64::new(0), AtomicU64::new(0)],
            num_free_blocks: AtomicU64::new(0),
            leaf_pages_num: AtomicU32::new(0),
            ctid: AtomicU64::new(ctid),
            bridge_ctid: AtomicU64::new(bridge_ctid),
        }
    }
}

/// Source of checkpoint numbers, provided by the checkpoint orchestrator.
pub trait CheckpointBroker: Send + Sync {
    /// Checkpoint number new pages of the relation belong to.
    fn current_checkpoint(&self, oids: RelOids, kind: IndexKind) -> u32;
    /// Records the newest checkpoint a relation has a header for.
    fn update_latest(&self, datoid: u32, relnode: u64, checkpoint: u32);
}

/// Trivial broker pinned to one checkpoint number; the embedding database
/// process supplies the real one.
pub struct FixedCheckpointBroker {
    current: AtomicU32,
    latest: Mutex<HashMap<(u32, u64), u32>>,
}

impl FixedCheckpointBroker {
    /// Broker reporting `current` for every relation.
    pub fn new(current: u32) -> Self {
        Self {
            current: AtomicU32::new(current),
            latest: Mutex::new(HashMap::new()),
        }
    }

    /// Latest checkpoint recorded for a relation, if any.
    pub fn latest_for(&self, datoid: u32, relnode: u64) -> Option<u32> {
        self.latest.lock().get(&(datoid, relnode)).copied()
    }
}

impl CheckpointBroker for FixedCheckpointBroker {
    fn current_checkpoint(&self, _oids: RelOids, _kind: IndexKind) -> u32 {
        self.current.load(Ordering::Relaxed)
    }

    fn update_latest(&self, datoid: u32, relnode: u64, checkpoint: u32) {
        self.latest.lock().insert((datoid, relnode), checkpoint);
    }
}

/// Opaque position of a scheduled upload task.
pub type TaskLocation = u64;

/// Asynchronous object-storage uploader, active in S3 mode only.
pub trait PartUploadScheduler: Send + Sync {
    /// Schedules an async part write for the relation's files.
    fn schedule_file_part_write(
        &self,
        checkpoint: u32,
        datoid: u32,
        relnode: u64,
        part: i32,
        segment: i32,
    ) -> TaskLocation;
}

/// Registry holding the file headers of evicted temporary trees.
#[derive(Default)]
pub struct EvictedTreeRegistry {
    map: Mutex<HashMap<RelOids, CheckpointFileHeader>>,
}

impl EvictedTreeRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the header for a temporary relation.
    pub fn insert(&self, oids: RelOids, header: CheckpointFileHeader) {
        self.map.lock().insert(oids, header);
    }

    /// Looks up a stored header.
    pub fn get(&self, oids: RelOids) -> Option<CheckpointFileHeader> {
        self.map.lock().get(&oids).copied()
    }

    /// Removes and returns a stored header.
    pub fn take(&self, oids: RelOids) -> Option<CheckpointFileHeader> {
        self.map.lock().remove(&oids)
    }
}

/// Environment threaded through build-time I/O.
pub struct StorageEnv {
    /// File-system surface.
    pub vfs: Arc<dyn Vfs>,
    /// Directory seq-buf files live under.
    pub data_dir: PathBuf,
    /// Checkpoint number source.
    pub checkpoints: Arc<dyn CheckpointBroker>,
    /// Registry for temporary relations' headers.
    pub evicted: Arc<EvictedTreeRegistry>,
    /// Part-upload scheduler; `Some` only in S3 mode.
    pub uploads: Option<Arc<dyn PartUploadScheduler>>,
}

impl StorageEnv {
    /// Environment over the real file system with a fixed checkpoint broker.
    pub fn new(vfs: Arc<dyn Vfs>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            vfs,
            data_dir: data_dir.into(),
            checkpoints: Arc::new(FixedCheckpointBroker::new(0)),
            evicted: Arc::new(EvictedTreeRegistry::new()),
            uploads: None,
        }
    }
}

/// Identity of a seq-buf file.
#[derive(Clone, Copy, Debug)]
pub struct SeqBufTag {
    /// Database oid.
    pub datoid: u32,
    /// Relation file node.
    pub relnode: u64,
    /// Checkpoint number.
    pub num: u32,
    /// File type marker; `'m'` for tree headers.
    pub typ: char,
}

/// Renders the file name a seq-buf tag maps to.
pub fn seq_buf_filename(data_dir: &Path, tag: &SeqBufTag) -> PathBuf {
    data_dir.join(format!(
        "{:08X}{:016X}-{}.{}",
        tag.datoid, tag.relnode, tag.num, tag.typ
    ))
}

/// Sequential page writer for one relation's data file.
///
/// All page writes go through the buffer cache; the downlink returned for a
/// page encodes the checkpoint number and the block it landed on.
pub struct SegmentManager {
    cache: Arc<BufferCache>,
    tag: BufferTag,
    checkpoint_num: u32,
}

impl SegmentManager {
    /// Opens the segment manager for a build.
    pub fn open(cache: Arc<BufferCache>, tag: BufferTag, checkpoint_num: u32) -> Self {
        Self {
            cache,
            tag,
            checkpoint_num,
        }
    }

    /// Checkpoint number stamped into emitted downlinks.
    pub fn checkpoint_num(&self) -> u32 {
        self.checkpoint_num
    }

    /// Buffer tag the relation's data file space uses.
    pub fn tag(&self) -> BufferTag {
        self.tag
    }

    /// Appends one page image to the data file, returning its downlink.
    pub fn perform_page_io_build(&self, img: &[u8], meta: &BuildMeta) -> Result<Downlink> {
        debug_assert_eq!(img.len(), BLCKSZ);
        let slot = (self.checkpoint_num % 2) as usize;
        let offset = meta.datafile_length[slot].fetch_add(BLCKSZ as u64, Ordering::AcqRel);
        self.cache.write(self.tag, offset, img)?;
        let block = offset / BLCKSZ as u64;
        debug!(block, checkpoint = self.checkpoint_num, "page written by build");
        Ok(make_disk_downlink(self.checkpoint_num, block))
    }

    /// Flushes and fsyncs everything the build wrote.
    pub fn close(&self, meta: &BuildMeta) -> Result<()> {
        let slot = (self.checkpoint_num % 2) as usize;
        let len = meta.datafile_length[slot].load(Ordering::Acquire);
        if len > 0 {
            self.cache.sync(self.tag, 0, len)?;
        }
        Ok(())
    }
}

/// Writes a finished build's file header to its durable home.
///
/// Persistent and unlogged relations get a seq-buf file named after
/// `{datoid, relnode, checkpoint, 'm'}` and the checkpoint broker learns the
/// new latest header; temporary relations hand the header to the evicted-tree
/// registry instead. In S3 mode, a part upload is scheduled after the local
/// write and its task location returned.
pub fn write_file_header(
    env: &StorageEnv,
    desc: &IndexDescriptor,
    header: &CheckpointFileHeader,
) -> Result<Option<TaskLocation>> {
    let checkpoint = env
        .checkpoints
        .current_checkpoint(desc.oids, desc.kind);

    match desc.storage {
        StorageKind::Persistent | StorageKind::Unlogged => {
            let tag = SeqBufTag {
                datoid: desc.oids.datoid,
                relnode: desc.oids.relnode,
                num: checkpoint,
                typ: 'm',
            };
            let path = seq_buf_filename(&env.data_dir, &tag);
            let file = env.vfs.open(&path, true)?.ok_or_else(|| {
                EngineError::Corruption(format!(
                    "could not create checkpoint header file {}",
                    path.display()
                ))
            })?;
            file.write_at(0, &header.encode())?;
            file.sync_all()?;
            env.checkpoints
                .update_latest(desc.oids.datoid, desc.oids.relnode, checkpoint);

            if let Some(uploads) = &env.uploads {
                let location = uploads.schedule_file_part_write(
                    checkpoint,
                    desc.oids.datoid,
                    desc.oids.relnode,
                    -1,
                    -1,
                );
                return Ok(Some(location));
            }
            Ok(None)
        }
        StorageKind::Temporary => {
            env.evicted.insert(desc.oids, *header);
            Ok(None)
        }
    }
}

/// Reads a relation's checkpoint file header back, for reopen paths.
pub fn read_file_header(
    env: &StorageEnv,
    oids: RelOids,
    checkpoint: u32,
) -> Result<Option<CheckpointFileHeader>> {
    let tag = SeqBufTag {
        datoid: oids.datoid,
        relnode: oids.relnode,
        num: checkpoint,
        typ: 'm',
    };
    let path = seq_buf_filename(&env.data_dir, &tag);
    let Some(file) = env.vfs.open(&path, false)? else {
        return Ok(None);
    };
    let mut buf = [0u8; CHECKPOINT_FILE_HEADER_LEN];
    file.read_at(0, &mut buf)?;
    Ok(Some(CheckpointFileHeader::decode(&buf)?))
}
