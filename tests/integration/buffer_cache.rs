//! Buffer-cache scenarios over real files: segmented rollover, eviction,
//! restart visibility, versioned upgrade, and range unlink.

use std::path::PathBuf;
use std::sync::Arc;

use tempfile::TempDir;

use tanager::buffers::{BufferCache, BufferCacheOptions, BufferTag, FileTemplate, TagConfig};
use tanager::error::EngineError;
use tanager::io::StdVfs;
use tanager::types::BLCKSZ;

const TAG: BufferTag = BufferTag(0);

fn template(dir: &TempDir) -> FileTemplate {
    FileTemplate::new(format!("{}/seg-%08X%08X", dir.path().display()))
}

fn cache(dir: &TempDir, buffers: u32, file_size: u64, version: u32) -> BufferCache {
    BufferCache::new(
        BufferCacheOptions {
            buffers_count: buffers,
            single_file_size: file_size,
            tags: vec![TagConfig {
                template: template(dir),
                version,
                transform: None,
            }],
        },
        Arc::new(StdVfs),
    )
    .expect("cache")
}

fn base_path(dir: &TempDir, file_num: u64) -> PathBuf {
    template(dir).path(file_num)
}

#[test]
fn distinct_blocks_survive_eviction_and_restart() {
    let dir = TempDir::new().expect("tempdir");
    // 16 slots in 4 groups, two blocks per 16 KiB file.
    {
        let cache = cache(&dir, 16, 2 * BLCKSZ as u64, 0);
        for block in 0..8u64 {
            let payload = vec![0x10 + block as u8; BLCKSZ];
            cache
                .write(TAG, block * BLCKSZ as u64, &payload)
                .expect("write");
        }
        cache.sync(TAG, 0, 8 * BLCKSZ as u64).expect("sync");
    }
    // Fresh cache: everything must come back from disk byte-identical.
    let cache = cache(&dir, 16, 2 * BLCKSZ as u64, 0);
    for block in 0..8u64 {
        let mut dst = vec![0u8; BLCKSZ];
        cache
            .read(TAG, block * BLCKSZ as u64, &mut dst)
            .expect("read");
        assert!(
            dst.iter().all(|&b| b == 0x10 + block as u8),
            "block {block} corrupted"
        );
    }
    // The writes rolled over into further segment files.
    assert!(base_path(&dir, 0).exists());
    assert!(base_path(&dir, 1).exists(), "second file must exist");
    assert!(base_path(&dir, 3).exists());
}

#[test]
fn version_upgrade_zeroes_the_transformed_byte() {
    let dir = TempDir::new().expect("tempdir");
    // Write one block under version 1: the file gets a `.1` suffix.
    {
        let cache = cache(&dir, 8, 4 * BLCKSZ as u64, 1);
        let mut payload = vec![7u8; BLCKSZ];
        payload[0] = 0xEE;
        cache.write(TAG, 0, &payload).expect("write");
        cache.sync(TAG, 0, BLCKSZ as u64).expect("sync");
    }
    let versioned: PathBuf = {
        let mut os = base_path(&dir, 0).into_os_string();
        os.push(".1");
        os.into()
    };
    assert!(versioned.exists(), "version-1 file must carry the .1 suffix");

    // Reopen at version 2 with an upgrade callback. The open searches `.2`
    // first, falls back to `.1`, and transforms after the read.
    let upgraded = BufferCache::new(
        BufferCacheOptions {
            buffers_count: 8,
            single_file_size: 4 * BLCKSZ as u64,
            tags: vec![TagConfig {
                template: template(&dir),
                version: 2,
                transform: Some(Box::new(|data, tag, from, to| {
                    assert_eq!(tag, TAG);
                    assert_eq!((from, to), (1, 2));
                    data[0] = 0;
                    true
                })),
            }],
        },
        Arc::new(StdVfs),
    )
    .expect("cache");
    let mut dst = vec![0u8; BLCKSZ];
    upgraded.read(TAG, 0, &mut dst).expect("read");
    assert_eq!(dst[0], 0);
    assert!(dst[1..].iter().all(|&b| b == 7));
}

#[test]
fn failed_transform_surfaces_as_fatal_error() {
    let dir = TempDir::new().expect("tempdir");
    {
        let cache = cache(&dir, 8, 4 * BLCKSZ as u64, 0);
        cache.write(TAG, 0, &[9u8; 64]).expect("write");
        cache.sync(TAG, 0, BLCKSZ as u64).expect("sync");
    }
    let broken = BufferCache::new(
        BufferCacheOptions {
            buffers_count: 8,
            single_file_size: 4 * BLCKSZ as u64,
            tags: vec![TagConfig {
                template: template(&dir),
                version: 3,
                transform: Some(Box::new(|_, _, _, _| false)),
            }],
        },
        Arc::new(StdVfs),
    )
    .expect("cache");
    let err = broken
        .read(TAG, 0, &mut [0u8; 64])
        .expect_err("failing transform is fatal");
    assert!(matches!(
        err,
        EngineError::VersionTransform { from: 0, to: 3 }
    ));
}

#[test]
fn unlink_files_range_removes_every_version_and_wipes_slots() {
    let dir = TempDir::new().expect("tempdir");
    let cache = cache(&dir, 8, 2 * BLCKSZ as u64, 1);
    for block in 0..12u64 {
        cache
            .write(TAG, block * BLCKSZ as u64, &vec![block as u8 + 1; BLCKSZ])
            .expect("write");
    }
    cache.sync(TAG, 0, 12 * BLCKSZ as u64).expect("sync");

    // Plant a stale unversioned file for one doomed segment: unlink must
    // remove every version, newest first.
    std::fs::write(base_path(&dir, 4), b"stale").expect("plant stale file");

    // Dirty a block covered by file 4 (blocks 8..10) without syncing.
    cache
        .write(TAG, 8 * BLCKSZ as u64, &[0xFFu8; 16])
        .expect("dirty");

    cache.unlink_files_range(TAG, 3, 5).expect("unlink");
    for file_num in 3..=5u64 {
        let base = base_path(&dir, file_num);
        let mut versioned = base.clone().into_os_string();
        versioned.push(".1");
        assert!(!base.exists(), "file {file_num} base must be gone");
        assert!(
            !PathBuf::from(versioned).exists(),
            "file {file_num} version 1 must be gone"
        );
    }
    // Files outside the range survive.
    let mut survivor = base_path(&dir, 0).into_os_string();
    survivor.push(".1");
    assert!(PathBuf::from(survivor).exists());

    // The dirtied block was wiped, not written: a fresh read sees zeros.
    let mut dst = vec![0u8; BLCKSZ];
    cache.read(TAG, 8 * BLCKSZ as u64, &mut dst).expect("read");
    assert!(dst.iter().all(|&b| b == 0));
}

#[test]
fn sync_makes_bytes_visible_after_simulated_crash() {
    let dir = TempDir::new().expect("tempdir");
    let payload: Vec<u8> = (0..BLCKSZ * 2).map(|i| (i % 253) as u8).collect();
    {
        let cache = cache(&dir, 8, 8 * BLCKSZ as u64, 0);
        cache.write(TAG, 512, &payload).expect("write");
        cache
            .sync(TAG, 512, 512 + payload.len() as u64)
            .expect("sync");
        // Dropping without further flushing simulates the crash.
    }
    let reopened = cache(&dir, 8, 8 * BLCKSZ as u64, 0);
    let mut dst = vec![0u8; payload.len()];
    reopened.read(TAG, 512, &mut dst).expect("read");
    assert_eq!(dst, payload);
}
