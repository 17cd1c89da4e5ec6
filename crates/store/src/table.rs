use crate::error::{Result, StoreError};
use crate::file::StoreFile;
use crate::node::{Node, RecordType, Table};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableSelection {
    First,
    Last,
    All,
}

/// Cached table metadata, with the same invalidate-and-refill lifecycle as
/// `DsetInfo`.
#[derive(Debug, Clone, Default)]
pub struct TableInfo {
    pub table_path: Option<String>,
    pub table_title: Option<String>,
    pub table_exists: Option<bool>,
    pub num_records: Option<u64>,
    pub record_bytes: Option<usize>,
    pub record_type: Option<RecordType>,
    pub chunk_records: Option<u64>,
}

impl TableInfo {
    pub fn exists(&self) -> bool {
        self.table_exists.unwrap_or(false)
    }

    pub fn path(&self) -> Result<&str> {
        self.table_path
            .as_deref()
            .ok_or_else(|| StoreError::Missing("table info has no path".to_string()))
    }
}

impl StoreFile {
    pub fn get_table_info(&self, path: &str) -> TableInfo {
        let mut info = TableInfo { table_path: Some(path.to_string()), ..Default::default() };
        self.fill_table_info(&mut info);
        info
    }

    /// Refreshes every file-specific field of `info` from this file.
    pub fn fill_table_info(&self, info: &mut TableInfo) {
        let Some(path) = info.table_path.clone() else {
            info.table_exists = Some(false);
            return;
        };
        match self.node(&path) {
            Some(Node::Table(t)) => {
                info.table_exists = Some(true);
                info.table_title = Some(t.title.clone());
                info.num_records = Some(t.num_records);
                info.record_bytes = Some(t.rectype.record_bytes());
                info.record_type = Some(t.rectype.clone());
                info.chunk_records = Some(t.chunk_records);
            }
            _ => info.table_exists = Some(false),
        }
    }

    /// Creates an empty table. Returns the info of an existing table
    /// unchanged if the path is already a table.
    pub fn create_table(
        &mut self,
        path: &str,
        rectype: RecordType,
        title: &str,
        chunk_records: u64,
        deflate: u8,
    ) -> Result<TableInfo> {
        match self.node(path) {
            Some(Node::Table(_)) => return Ok(self.get_table_info(path)),
            Some(_) => return Err(StoreError::Kind { path: path.to_string(), expected: "table" }),
            None => {}
        }
        let table = Table {
            rectype,
            title: title.to_string(),
            chunk_records,
            deflate,
            num_records: 0,
            raw: Vec::new(),
            attrs: Default::default(),
        };
        self.insert(path, Node::Table(table))?;
        Ok(self.get_table_info(path))
    }

    /// Writes whole records starting at row `offset`, extending the record
    /// count to cover the written range. Unwritten gaps read back as zeros.
    pub fn write_table_records(
        &mut self,
        info: &mut TableInfo,
        offset: u64,
        data: &[u8],
    ) -> Result<()> {
        self.check_writable()?;
        let path = info.path()?.to_string();
        let node = self
            .node_mut(&path)
            .ok_or_else(|| StoreError::Missing(path.clone()))?;
        let Node::Table(t) = node else {
            return Err(StoreError::Kind { path, expected: "table" });
        };
        let rb = t.rectype.record_bytes();
        if rb == 0 || data.len() % rb != 0 {
            return Err(StoreError::Type {
                path,
                detail: format!("{} bytes is not a whole number of {rb}-byte records", data.len()),
            });
        }
        let extent = (data.len() / rb) as u64;
        let need = (offset + extent) as usize * rb;
        if t.raw.len() < need {
            t.raw.resize(need, 0);
        }
        let start = offset as usize * rb;
        t.raw[start..start + data.len()].copy_from_slice(data);
        t.num_records = t.num_records.max(offset + extent);
        self.mark_dirty();
        self.fill_table_info(info);
        Ok(())
    }

    pub fn read_table_records(&self, path: &str, offset: u64, extent: u64) -> Result<Vec<u8>> {
        let Node::Table(t) = self.require(path)? else {
            return Err(StoreError::Kind { path: path.to_string(), expected: "table" });
        };
        if offset + extent > t.num_records {
            return Err(StoreError::Range {
                path: path.to_string(),
                detail: format!(
                    "records [{offset}, {}) of {}",
                    offset + extent,
                    t.num_records
                ),
            });
        }
        let rb = t.rectype.record_bytes();
        let start = offset as usize * rb;
        let end = start + extent as usize * rb;
        Ok(t.raw[start..end].to_vec())
    }

    fn read_one_record(&self, path: &str, selection: TableSelection) -> Result<(RecordType, Vec<u8>)> {
        let Node::Table(t) = self.require(path)? else {
            return Err(StoreError::Kind { path: path.to_string(), expected: "table" });
        };
        if t.num_records == 0 {
            return Err(StoreError::Range { path: path.to_string(), detail: "empty table".into() });
        }
        let row = match selection {
            TableSelection::First => 0,
            TableSelection::Last => t.num_records - 1,
            TableSelection::All => {
                return Err(StoreError::Range {
                    path: path.to_string(),
                    detail: "field read needs a single record".into(),
                })
            }
        };
        let rb = t.rectype.record_bytes();
        let start = row as usize * rb;
        Ok((t.rectype.clone(), t.raw[start..start + rb].to_vec()))
    }

    pub fn read_table_field_i64(
        &self,
        path: &str,
        field: &str,
        selection: TableSelection,
    ) -> Result<i64> {
        let (rectype, rec) = self.read_one_record(path, selection)?;
        rectype
            .read_i64(&rec, field)
            .ok_or_else(|| field_err(path, field))
    }

    pub fn read_table_field_u64(
        &self,
        path: &str,
        field: &str,
        selection: TableSelection,
    ) -> Result<u64> {
        let (rectype, rec) = self.read_one_record(path, selection)?;
        rectype
            .read_u64(&rec, field)
            .ok_or_else(|| field_err(path, field))
    }

    pub fn read_table_field_f64(
        &self,
        path: &str,
        field: &str,
        selection: TableSelection,
    ) -> Result<f64> {
        let (rectype, rec) = self.read_one_record(path, selection)?;
        rectype
            .read_f64(&rec, field)
            .ok_or_else(|| field_err(path, field))
    }

    /// Copies the selected records of a source table into this file's
    /// table starting at row `index`. Record layouts must agree.
    pub fn copy_table_records(
        &mut self,
        src: &StoreFile,
        src_info: &TableInfo,
        selection: TableSelection,
        tgt_info: &mut TableInfo,
        index: u64,
    ) -> Result<()> {
        let src_path = src_info.path()?;
        let Node::Table(t) = src.require(src_path)? else {
            return Err(StoreError::Kind { path: src_path.to_string(), expected: "table" });
        };
        if t.num_records == 0 {
            return Err(StoreError::Range {
                path: src_path.to_string(),
                detail: "empty table".into(),
            });
        }
        let rb = t.rectype.record_bytes();
        if tgt_info.record_bytes.is_some_and(|b| b != rb) {
            return Err(StoreError::Type {
                path: tgt_info.path()?.to_string(),
                detail: format!(
                    "source records are {rb} bytes, target expects {}",
                    tgt_info.record_bytes.unwrap_or(0)
                ),
            });
        }
        let (start, extent) = match selection {
            TableSelection::First => (0, 1),
            TableSelection::Last => (t.num_records - 1, 1),
            TableSelection::All => (0, t.num_records),
        };
        let bytes = t.raw[start as usize * rb..(start + extent) as usize * rb].to_vec();
        self.write_table_records(tgt_info, index, &bytes)
    }
}

fn field_err(path: &str, field: &str) -> StoreError {
    StoreError::Type {
        path: path.to_string(),
        detail: format!("no numeric field [{field}]"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::Access;
    use crate::node::{Dtype, Field};
    use tempfile::tempdir;

    fn measurements() -> RecordType {
        RecordType::new(vec![
            Field::new("iter", Dtype::U64),
            Field::new("energy", Dtype::F64),
        ])
    }

    fn rec(iter: u64, energy: f64) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&iter.to_le_bytes());
        out.extend_from_slice(&energy.to_le_bytes());
        out
    }

    #[test]
    fn write_read_and_field_access() {
        let dir = tempdir().unwrap();
        let mut f = StoreFile::open(dir.path().join("t.h5"), Access::Replace).unwrap();
        let mut info = f.create_table("m", measurements(), "Measurements", 1000, 4).unwrap();
        f.write_table_records(&mut info, 0, &rec(0, -1.25)).unwrap();
        f.write_table_records(&mut info, 1, &rec(1, -1.5)).unwrap();
        assert_eq!(info.num_records, Some(2));
        assert_eq!(f.read_table_field_u64("m", "iter", TableSelection::Last).unwrap(), 1);
        assert_eq!(f.read_table_field_f64("m", "energy", TableSelection::First).unwrap(), -1.25);
        assert_eq!(f.read_table_records("m", 1, 1).unwrap(), rec(1, -1.5));
        assert!(f.read_table_records("m", 1, 2).is_err());
    }

    #[test]
    fn out_of_order_write_zero_fills() {
        let dir = tempdir().unwrap();
        let mut f = StoreFile::open(dir.path().join("t.h5"), Access::Replace).unwrap();
        let mut info = f.create_table("m", measurements(), "Measurements", 1000, 4).unwrap();
        f.write_table_records(&mut info, 3, &rec(3, 0.5)).unwrap();
        assert_eq!(info.num_records, Some(4));
        assert_eq!(f.read_table_records("m", 0, 1).unwrap(), vec![0u8; 16]);
        assert_eq!(f.read_table_records("m", 3, 1).unwrap(), rec(3, 0.5));
    }

    #[test]
    fn copy_last_record_between_files() {
        let dir = tempdir().unwrap();
        let mut src = StoreFile::open(dir.path().join("src.h5"), Access::Replace).unwrap();
        let mut sinfo = src.create_table("m", measurements(), "Measurements", 1000, 4).unwrap();
        src.write_table_records(&mut sinfo, 0, &[rec(0, 1.0), rec(1, 2.0)].concat()).unwrap();

        let mut tgt = StoreFile::open(dir.path().join("tgt.h5"), Access::Replace).unwrap();
        let mut tinfo = tgt.create_table("agg", measurements(), "Measurements", 1000, 4).unwrap();
        tgt.copy_table_records(&src, &sinfo, TableSelection::Last, &mut tinfo, 5).unwrap();
        assert_eq!(tinfo.num_records, Some(6));
        assert_eq!(tgt.read_table_records("agg", 5, 1).unwrap(), rec(1, 2.0));
    }

    #[test]
    fn record_size_mismatch_rejected() {
        let dir = tempdir().unwrap();
        let mut f = StoreFile::open(dir.path().join("t.h5"), Access::Replace).unwrap();
        let mut info = f.create_table("m", measurements(), "Measurements", 1000, 4).unwrap();
        assert!(matches!(
            f.write_table_records(&mut info, 0, &[0u8; 10]),
            Err(StoreError::Type { .. })
        ));
    }

    #[test]
    fn persisted_tables_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.h5");
        {
            let mut f = StoreFile::open(&path, Access::Replace).unwrap();
            let mut info = f.create_table("m", measurements(), "Measurements", 1000, 4).unwrap();
            f.write_table_records(&mut info, 0, &rec(7, 3.5)).unwrap();
        }
        let f = StoreFile::open(&path, Access::ReadOnly).unwrap();
        let info = f.get_table_info("m");
        assert!(info.exists());
        assert_eq!(info.num_records, Some(1));
        assert_eq!(f.read_table_field_u64("m", "iter", TableSelection::First).unwrap(), 7);
    }
}
