//! Generic external merge sorter.
//!
//! Entries accumulate in memory with their leading-column datum cached, so
//! most comparisons never decode the stored record. When memory use crosses
//! the configured threshold a sorted run spills to an anonymous temp file;
//! draining merges the runs with the in-memory tail. Spilled records carry a
//! CRC so a damaged spill surfaces as corruption rather than bad output.

use std::cmp::Ordering;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::mem;

use tracing::debug;

use crate::error::{EngineError, Result};
use crate::types::Datum;

/// One record held by the sorter: the packed payload plus the cached
/// leading-column value.
pub struct SortEntry {
    /// Leading sort column value.
    pub datum1: Datum,
    /// Whether the leading column is null.
    pub isnull1: bool,
    /// Flavor-packed record bytes.
    pub payload: Vec<u8>,
}

/// Record codec and comparator for one sort flavor.
///
/// `compare` must be a total order. A codec that enforces uniqueness records
/// the violation internally and reports it from `take_violation`; the sorter
/// checks after sorting and after every merge step, so the error surfaces
/// before the offending records are returned.
pub trait SortCodec {
    /// Full record comparison, leading column first via the cached datum.
    fn compare(&self, a: &SortEntry, b: &SortEntry) -> Ordering;
    /// Extracts the leading column from a packed record.
    fn leading(&self, payload: &[u8]) -> Result<(Datum, bool)>;
    /// Returns and clears an error recorded during comparisons.
    fn take_violation(&self) -> Option<EngineError>;
}

enum SorterState {
    Filling,
    Draining,
}

/// External merge sorter over one [`SortCodec`].
pub struct ExternalSorter<C: SortCodec> {
    codec: C,
    work_mem: usize,
    mem_used: usize,
    entries: Vec<SortEntry>,
    drained: usize,
    runs: Vec<RunReader>,
    state: SorterState,
}

impl<C: SortCodec> ExternalSorter<C> {
    /// Sorter keeping at most roughly `work_mem` bytes in memory.
    pub fn new(codec: C, work_mem: usize) -> Self {
        Self {
            codec,
            work_mem: work_mem.max(64 * 1024),
            mem_used: 0,
            entries: Vec::new(),
            drained: 0,
            runs: Vec::new(),
            state: SorterState::Filling,
        }
    }

    /// The flavor codec, for callers that need its descriptors.
    pub fn codec(&self) -> &C {
        &self.codec
    }

    /// Accepts one packed record.
    pub fn put(&mut self, payload: Vec<u8>) -> Result<()> {
        debug_assert!(matches!(self.state, SorterState::Filling));
        let (datum1, isnull1) = self.codec.leading(&payload)?;
        self.mem_used += payload.len() + mem::size_of::<SortEntry>();
        self.entries.push(SortEntry {
            datum1,
            isnull1,
            payload,
        });
        if self.mem_used > self.work_mem {
            self.spill_run()?;
        }
        Ok(())
    }

    fn sort_entries(&mut self) -> Result<()> {
        let codec = &self.codec;
        self.entries.sort_by(|a, b| codec.compare(a, b));
        match self.codec.take_violation() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn spill_run(&mut self) -> Result<()> {
        self.sort_entries()?;
        debug!(
            records = self.entries.len(),
            bytes = self.mem_used,
            "spilling sort run"
        );
        let mut writer = BufWriter::new(tempfile::tempfile()?);
        for entry in &self.entries {
            let len = entry.payload.len() as u32;
            let crc = crc32fast::hash(&entry.payload);
            writer.write_all(&len.to_le_bytes())?;
            writer.write_all(&crc.to_le_bytes())?;
            writer.write_all(&entry.payload)?;
        }
        let mut file = writer
            .into_inner()
            .map_err(|e| EngineError::Io(e.into_error()))?;
        file.flush()?;
        file.seek(SeekFrom::Start(0))?;
        self.runs.push(RunReader::new(file));
        self.entries.clear();
        self.mem_used = 0;
        Ok(())
    }

    /// Finishes the fill phase; records come out of [`Self::next`] after.
    pub fn perform_sort(&mut self) -> Result<()> {
        if matches!(self.state, SorterState::Draining) {
            return Ok(());
        }
        if self.runs.is_empty() {
            self.sort_entries()?;
        } else {
            if !self.entries.is_empty() {
                self.spill_run()?;
            }
            for i in 0..self.runs.len() {
                let head = self.runs[i].read_record(&self.codec)?;
                self.runs[i].head = head;
            }
        }
        self.drained = 0;
        self.state = SorterState::Draining;
        Ok(())
    }

    /// Returns the next record in sort order, or `None` when exhausted.
    pub fn next(&mut self) -> Result<Option<Vec<u8>>> {
        if matches!(self.state, SorterState::Filling) {
            self.perform_sort()?;
        }
        if self.runs.is_empty() {
            if self.drained >= self.entries.len() {
                return Ok(None);
            }
            let payload = mem::take(&mut self.entries[self.drained].payload);
            self.drained += 1;
            return Ok(Some(payload));
        }

        // Merge step: pick the smallest head. Run counts are small, so a
        // linear scan beats heap bookkeeping here.
        let mut best: Option<usize> = None;
        for i in 0..self.runs.len() {
            let Some(head) = &self.runs[i].head else {
                continue;
            };
            match best {
                None => best = Some(i),
                Some(j) => {
                    let other = self.runs[j].head.as_ref().expect("best has a head");
                    if self.codec.compare(head, other) == Ordering::Less {
                        best = Some(i);
                    }
                }
            }
        }
        if let Some(err) = self.codec.take_violation() {
            return Err(err);
        }
        let Some(i) = best else {
            return Ok(None);
        };
        let next_head = self.runs[i].read_record(&self.codec)?;
        let entry = mem::replace(&mut self.runs[i].head, next_head)
            .ok_or_else(|| EngineError::Corruption("merge head vanished".into()))?;
        Ok(Some(entry.payload))
    }
}

struct RunReader {
    reader: BufReader<File>,
    head: Option<SortEntry>,
}

impl RunReader {
    fn new(file: File) -> Self {
        Self {
            reader: BufReader::new(file),
            head: None,
        }
    }

    fn read_record<C: SortCodec>(&mut self, codec: &C) -> Result<Option<SortEntry>> {
        let mut header = [0u8; 8];
        match self.reader.read_exact(&mut header) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(err) => return Err(err.into()),
        }
        let len = u32::from_le_bytes(header[0..4].try_into().expect("4 bytes")) as usize;
        let crc = u32::from_le_bytes(header[4..8].try_into().expect("4 bytes"));
        let mut payload = vec![0u8; len];
        self.reader.read_exact(&mut payload)?;
        if crc32fast::hash(&payload) != crc {
            return Err(EngineError::Corruption(
                "sort spill record failed its checksum".into(),
            ));
        }
        let (datum1, isnull1) = codec.leading(&payload)?;
        Ok(Some(SortEntry {
            datum1,
            isnull1,
            payload,
        }))
    }
}
