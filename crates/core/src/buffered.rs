use h5mbl_store::{StoreFile, TableInfo};
use tracing::warn;

use crate::error::{MergeError, Result};

pub const DEFAULT_MAX_RECORDS: usize = 1000;

#[derive(Debug)]
struct Run {
    offset: u64,
    extent: u64,
    bytes: Vec<u8>,
}

/// Stages single-record insertions at scattered rows and writes them out
/// as contiguous slabs. Thousands of realizations each contribute one
/// record to a target table; issuing those writes one by one is what this
/// buffer exists to avoid.
#[derive(Debug)]
pub struct BufferedTableInfo {
    pub table: TableInfo,
    runs: Vec<Run>,
    buffered: usize,
    max_records: usize,
}

impl BufferedTableInfo {
    pub fn new(table: TableInfo) -> Self {
        Self::with_max_records(table, DEFAULT_MAX_RECORDS)
    }

    pub fn with_max_records(table: TableInfo, max_records: usize) -> Self {
        Self { table, runs: Vec::new(), buffered: 0, max_records: max_records.max(1) }
    }

    pub fn buffered_records(&self) -> usize {
        self.buffered
    }

    /// Offsets and extents of the staged runs, in insertion order.
    pub fn runs(&self) -> Vec<(u64, u64)> {
        self.runs.iter().map(|r| (r.offset, r.extent)).collect()
    }

    /// Whether row `index` is currently staged and not yet written.
    pub fn is_staged(&self, index: u64) -> bool {
        self.runs
            .iter()
            .any(|r| index >= r.offset && index < r.offset + r.extent)
    }

    /// Stages one record at row `index`. A record adjacent to the end of
    /// an existing run extends it; anything else opens a new run. Hitting
    /// a row that is already staged means the seed index failed to dedup
    /// upstream, which is a logic error.
    pub fn insert(&mut self, tgt: &mut StoreFile, record: &[u8], index: u64) -> Result<()> {
        let record_bytes = self.table.record_bytes.unwrap_or(0);
        if record_bytes == 0 || record.len() != record_bytes {
            return Err(MergeError::Logic(format!(
                "record is {} bytes but [{}] expects {record_bytes}",
                record.len(),
                self.path()
            )));
        }
        if self
            .runs
            .iter()
            .any(|r| index >= r.offset && index < r.offset + r.extent)
        {
            return Err(MergeError::Logic(format!(
                "duplicate insertion at row {index} of [{}]",
                self.path()
            )));
        }
        match self.runs.iter_mut().find(|r| r.offset + r.extent == index) {
            Some(run) => {
                run.bytes.extend_from_slice(record);
                run.extent += 1;
            }
            None => self.runs.push(Run { offset: index, extent: 1, bytes: record.to_vec() }),
        }
        self.buffered += 1;
        if self.buffered >= self.max_records {
            self.flush(tgt)?;
        }
        Ok(())
    }

    /// One ranged write per staged run. Runs stay staged if a write fails.
    pub fn flush(&mut self, tgt: &mut StoreFile) -> Result<()> {
        for run in &self.runs {
            tgt.write_table_records(&mut self.table, run.offset, &run.bytes)?;
        }
        self.runs.clear();
        self.buffered = 0;
        Ok(())
    }

    fn path(&self) -> &str {
        self.table.table_path.as_deref().unwrap_or("?")
    }
}

impl Drop for BufferedTableInfo {
    fn drop(&mut self) {
        if self.buffered > 0 {
            warn!(
                "dropping {} unflushed records for [{}]",
                self.buffered,
                self.path()
            );
        }
    }
}
