use std::collections::HashMap;
use std::path::PathBuf;

use h5mbl_store::{DsetInfo, NodeKind, StoreFile, TableInfo, Value};
use tracing::{debug, info, warn};

use crate::buffered::BufferedTableInfo;
use crate::error::{MergeError, Result};
use crate::id::{FileId, FileIdStatus, InfoId, SeedId};
use crate::model::ModelId;

pub const FILE_DB_PATH: &str = ".db/files";

/// In-memory maps of the target objects being written, keyed by target
/// path. Lives for the whole run; seed indexes are persisted and buffers
/// flushed at every parameter-set boundary.
#[derive(Default)]
pub struct TgtDb {
    pub file: HashMap<String, FileId>,
    pub model: HashMap<String, InfoId<TableInfo>>,
    pub table: HashMap<String, InfoId<TableInfo>>,
    pub dset: HashMap<String, InfoId<DsetInfo>>,
    pub crono: HashMap<String, InfoId<BufferedTableInfo>>,
    pub scale: HashMap<String, InfoId<BufferedTableInfo>>,
}

impl TgtDb {
    pub fn load(tgt: &StoreFile) -> Result<Self> {
        let mut db = TgtDb { file: load_file_db(tgt)?, ..Default::default() };
        load_seed_databases(tgt, &mut db)?;
        Ok(db)
    }

    /// Flushes every buffered table, rewrites every dirty seed index and
    /// the file database, and syncs the container to disk.
    pub fn persist(&mut self, tgt: &mut StoreFile) -> Result<()> {
        save_seed_db(tgt, &mut self.model)?;
        save_seed_db(tgt, &mut self.table)?;
        save_seed_db(tgt, &mut self.dset)?;
        save_seed_db(tgt, &mut self.crono)?;
        save_seed_db(tgt, &mut self.scale)?;
        save_file_db(tgt, &self.file)?;
        tgt.flush()?;
        Ok(())
    }
}

/// Transient maps of source-side objects, reused across the files of one
/// parameter set and dropped wholesale when the parent directory changes.
#[derive(Default)]
pub struct SrcDb {
    pub parent: Option<PathBuf>,
    pub model: HashMap<String, ModelId>,
    pub table: HashMap<String, TableInfo>,
    pub dset: HashMap<String, DsetInfo>,
}

impl SrcDb {
    pub fn reset(&mut self, parent: PathBuf) {
        self.parent = Some(parent);
        self.model.clear();
        self.table.clear();
        self.dset.clear();
    }
}

/// Blank the file-specific fields of a cached source dataset info so the
/// next `fill_dset_info` reads them from the current file.
pub fn clear_dset_info(info: &mut DsetInfo) {
    info.dset_exists = None;
    info.dims = None;
    info.dset_size = None;
    info.dset_byte = None;
    info.chunk = None;
}

pub fn clear_table_info(info: &mut TableInfo) {
    info.table_exists = None;
    info.num_records = None;
}

pub fn load_file_db(tgt: &StoreFile) -> Result<HashMap<String, FileId>> {
    let mut db = HashMap::new();
    if !tgt.link_exists(FILE_DB_PATH) {
        return Ok(db);
    }
    let info = tgt.get_table_info(FILE_DB_PATH);
    let records = info.num_records.unwrap_or(0);
    if records == 0 {
        return Ok(db);
    }
    let raw = tgt.read_table_records(FILE_DB_PATH, 0, records)?;
    for record in raw.chunks(FileId::record_bytes()) {
        match FileId::decode(record) {
            Some(id) => {
                db.insert(id.path.clone(), id);
            }
            None => warn!("discarding malformed file-database record"),
        }
    }
    info!("loaded {} entries from [{FILE_DB_PATH}]", db.len());
    Ok(db)
}

pub fn save_file_db(tgt: &mut StoreFile, db: &HashMap<String, FileId>) -> Result<()> {
    if db.is_empty() {
        return Ok(());
    }
    let mut info = tgt.create_table(
        FILE_DB_PATH,
        FileId::record_type(),
        "File database",
        1000,
        3,
    )?;
    let mut ids: Vec<&FileId> = db.values().collect();
    ids.sort_by(|a, b| a.seed.cmp(&b.seed).then_with(|| a.path.cmp(&b.path)));
    let mut raw = Vec::with_capacity(ids.len() * FileId::record_bytes());
    for id in ids {
        raw.extend_from_slice(&id.encode());
    }
    debug!("writing database: [{FILE_DB_PATH}]");
    tgt.write_table_records(&mut info, 0, &raw)
        .map_err(Into::into)
}

/// Classifies a candidate source file against the persisted database.
/// The two mixed cases can never arise from a healthy corpus and abort
/// the run.
pub fn file_id_status(
    db: &HashMap<String, FileId>,
    new_id: &FileId,
) -> Result<FileIdStatus> {
    let Some(old_id) = db.get(&new_id.path) else {
        return Ok(FileIdStatus::Missing);
    };
    let seed_match = old_id.seed == new_id.seed;
    let hash_match = old_id.same_hash(new_id);
    match (seed_match, hash_match) {
        (true, true) => Ok(FileIdStatus::UpToDate),
        (true, false) => Ok(FileIdStatus::Stale),
        (false, true) => Err(MergeError::Logic(format!(
            "hash match without seed match\n old entry {}\n new entry {}",
            old_id.describe(),
            new_id.describe()
        ))),
        (false, false) => Err(MergeError::Inconsistent(format!(
            "seeds and hashes both differ\n old entry {}\n new entry {}",
            old_id.describe(),
            new_id.describe()
        ))),
    }
}

/// Anything wrapped in an `InfoId` whose seed index can be persisted.
pub trait TargetInfo {
    fn target_path(&self) -> Option<&str>;
    fn flush(&mut self, _tgt: &mut StoreFile) -> Result<()> {
        Ok(())
    }
}

impl TargetInfo for DsetInfo {
    fn target_path(&self) -> Option<&str> {
        self.dset_path.as_deref()
    }
}

impl TargetInfo for TableInfo {
    fn target_path(&self) -> Option<&str> {
        self.table_path.as_deref()
    }
}

impl TargetInfo for BufferedTableInfo {
    fn target_path(&self) -> Option<&str> {
        self.table.table_path.as_deref()
    }

    fn flush(&mut self, tgt: &mut StoreFile) -> Result<()> {
        BufferedTableInfo::flush(self, tgt)
    }
}

/// Sidecar location of one target object's seed index.
fn sidecar_path(tgt_path: &str) -> String {
    match tgt_path.rsplit_once('/') {
        Some((parent, name)) => format!("{parent}/.db/{name}"),
        None => format!(".db/{tgt_path}"),
    }
}

/// Writes each dirty seed index to `<parent>/.db/<name>`, sorted by seed,
/// with `key` and `path` attributes pointing back at the map entry and
/// the real object.
pub fn save_seed_db<I: TargetInfo>(
    tgt: &mut StoreFile,
    db: &mut HashMap<String, InfoId<I>>,
) -> Result<()> {
    for (map_key, id) in db.iter_mut() {
        id.info.flush(tgt)?;
        if !id.dirty() {
            continue;
        }
        let Some(path) = id.info.target_path().map(str::to_string) else {
            continue;
        };
        let db_path = sidecar_path(&path);
        debug!("writing database: [{db_path}]");
        let mut info = tgt.create_table(
            &db_path,
            SeedId::record_type(),
            "Seed index database",
            1000,
            4,
        )?;
        tgt.write_attr(&db_path, "key", Value::Str(map_key.clone()))?;
        tgt.write_attr(&db_path, "path", Value::Str(path))?;
        let mut raw = Vec::with_capacity(id.db().len() * SeedId::record_bytes());
        for (seed, index) in id.db() {
            raw.extend_from_slice(&SeedId { seed: *seed, index: *index }.encode());
        }
        if !raw.is_empty() {
            tgt.write_table_records(&mut info, 0, &raw)?;
        }
        id.clear_dirty();
    }
    Ok(())
}

/// Re-populates the target maps from every `.db` sidecar in the file.
/// Which map an entry belongs to follows from the kind and path shape of
/// the object it points at.
fn load_seed_databases(tgt: &StoreFile, db: &mut TgtDb) -> Result<()> {
    let db_groups = tgt.find_groups(".db", "", -1, -1);
    debug!("found {} groups matching [.db]", db_groups.len());
    for group in &db_groups {
        for name in tgt.find_tables("", group, -1, 0) {
            let db_path = format!("{group}/{name}");
            if db_path == FILE_DB_PATH {
                continue;
            }
            let (Ok(map_key), Ok(path)) = (
                tgt.read_attr_str(&db_path, "key"),
                tgt.read_attr_str(&db_path, "path"),
            ) else {
                debug!("skipping sidecar without key/path attributes: [{db_path}]");
                continue;
            };
            let entries = read_seed_ids(tgt, &db_path)?;
            match tgt.kind(&path) {
                Some(NodeKind::Dset) => {
                    let mut id = InfoId::new(tgt.get_dset_info(&path));
                    id.load(entries);
                    db.dset.insert(map_key, id);
                }
                Some(NodeKind::Table) => {
                    let info = tgt.get_table_info(&path);
                    if path.contains("/cronos/") {
                        let mut id = InfoId::new(BufferedTableInfo::new(info));
                        id.load(entries);
                        db.crono.insert(map_key, id);
                    } else if path.contains("/scale/") {
                        let mut id = InfoId::new(BufferedTableInfo::new(info));
                        id.load(entries);
                        db.scale.insert(map_key, id);
                    } else if path.ends_with("/model/hamiltonian") {
                        let mut id = InfoId::new(info);
                        id.load(entries);
                        db.model.insert(map_key, id);
                    } else {
                        let mut id = InfoId::new(info);
                        id.load(entries);
                        db.table.insert(map_key, id);
                    }
                }
                _ => warn!("seed database [{db_path}] points at a missing object [{path}]"),
            }
        }
    }
    Ok(())
}

fn read_seed_ids(tgt: &StoreFile, db_path: &str) -> Result<Vec<SeedId>> {
    let info = tgt.get_table_info(db_path);
    let records = info.num_records.unwrap_or(0);
    if records == 0 {
        return Ok(Vec::new());
    }
    let raw = tgt.read_table_records(db_path, 0, records)?;
    Ok(raw.chunks(SeedId::record_bytes()).filter_map(SeedId::decode).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use h5mbl_store::Access;
    use tempfile::tempdir;

    fn fid(seed: i64, path: &str, hash: &str) -> FileId {
        FileId::new(seed, path, hash)
    }

    #[test]
    fn status_classification_covers_all_branches() {
        let mut db = HashMap::new();
        db.insert("/a/1.h5".to_string(), fid(1, "/a/1.h5", &"a".repeat(32)));

        let missing = fid(2, "/a/2.h5", &"b".repeat(32));
        assert_eq!(file_id_status(&db, &missing).unwrap(), FileIdStatus::Missing);

        let same = fid(1, "/a/1.h5", &"a".repeat(32));
        assert_eq!(file_id_status(&db, &same).unwrap(), FileIdStatus::UpToDate);

        let touched = fid(1, "/a/1.h5", &"c".repeat(32));
        assert_eq!(file_id_status(&db, &touched).unwrap(), FileIdStatus::Stale);

        let reseeded = fid(9, "/a/1.h5", &"a".repeat(32));
        assert!(matches!(file_id_status(&db, &reseeded), Err(MergeError::Logic(_))));

        let mangled = fid(9, "/a/1.h5", &"d".repeat(32));
        assert!(matches!(
            file_id_status(&db, &mangled),
            Err(MergeError::Inconsistent(_))
        ));
    }

    #[test]
    fn file_db_roundtrips_sorted_by_seed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.h5");
        let mut db = HashMap::new();
        for (seed, p) in [(30i64, "/s/30.h5"), (10, "/s/10.h5"), (20, "/s/20.h5")] {
            db.insert(p.to_string(), fid(seed, p, &"f".repeat(32)));
        }
        {
            let mut tgt = StoreFile::open(&path, Access::Replace).unwrap();
            save_file_db(&mut tgt, &db).unwrap();
        }
        let tgt = StoreFile::open(&path, Access::ReadOnly).unwrap();
        let loaded = load_file_db(&tgt).unwrap();
        assert_eq!(loaded, db);
        // Persisted order is strictly increasing in seed.
        let raw = tgt.read_table_records(FILE_DB_PATH, 0, 3).unwrap();
        let seeds: Vec<i64> = raw
            .chunks(FileId::record_bytes())
            .map(|r| FileId::decode(r).unwrap().seed)
            .collect();
        assert_eq!(seeds, [10, 20, 30]);
    }

    #[test]
    fn seed_databases_roundtrip_through_sidecars() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.h5");
        let tgt_table = "L_16/xDMRG/state_0/tables/measurements";
        {
            let mut tgt = StoreFile::open(&path, Access::Replace).unwrap();
            let rectype = h5mbl_store::RecordType::new(vec![h5mbl_store::Field::new(
                "x",
                h5mbl_store::Dtype::F64,
            )]);
            let mut info = tgt.create_table(tgt_table, rectype, "Measurements", 1000, 4).unwrap();
            tgt.write_table_records(&mut info, 0, &[0u8; 16]).unwrap();
            let mut map: HashMap<String, InfoId<TableInfo>> = HashMap::new();
            let mut id = InfoId::new(info);
            id.insert(101, 1);
            id.insert(100, 0);
            map.insert(tgt_table.to_string(), id);
            save_seed_db(&mut tgt, &mut map).unwrap();
            assert!(!map[tgt_table].dirty());
        }
        let tgt = StoreFile::open(&path, Access::ReadOnly).unwrap();
        let db = TgtDb::load(&tgt).unwrap();
        let id = &db.table[tgt_table];
        assert_eq!(id.get_index(100), Some(0));
        assert_eq!(id.get_index(101), Some(1));
        let sidecar = "L_16/xDMRG/state_0/tables/.db/measurements";
        assert_eq!(tgt.read_attr_str(sidecar, "key").unwrap(), tgt_table);
        assert_eq!(tgt.read_attr_str(sidecar, "path").unwrap(), tgt_table);
    }

    #[test]
    fn crono_sidecars_reload_into_buffered_tables() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.h5");
        let tgt_table = "L_16/fLBIT/state_real/cronos/iter_3/measurements";
        {
            let mut tgt = StoreFile::open(&path, Access::Replace).unwrap();
            let rectype = h5mbl_store::RecordType::new(vec![h5mbl_store::Field::new(
                "iter",
                h5mbl_store::Dtype::U64,
            )]);
            let info = tgt.create_table(tgt_table, rectype, "Measurements", 1000, 4).unwrap();
            let mut map: HashMap<String, InfoId<BufferedTableInfo>> = HashMap::new();
            let mut id = InfoId::new(BufferedTableInfo::new(info));
            id.insert(100, 0);
            map.insert(tgt_table.to_string(), id);
            save_seed_db(&mut tgt, &mut map).unwrap();
        }
        let tgt = StoreFile::open(&path, Access::ReadOnly).unwrap();
        let db = TgtDb::load(&tgt).unwrap();
        assert!(db.crono.contains_key(tgt_table));
        assert_eq!(db.crono[tgt_table].get_index(100), Some(0));
        assert!(db.table.is_empty());
    }
}
