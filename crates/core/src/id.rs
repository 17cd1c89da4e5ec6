use std::collections::BTreeMap;

use h5mbl_store::{Dtype, Field, RecordType};

pub const FILE_PATH_BYTES: usize = 256;
pub const FILE_HASH_BYTES: usize = 32;

/// One source file: user-assigned seed, absolute path and the mtime-based
/// fingerprint. Strings are length-tagged in memory and null-padded to the
/// declared widths when written to the file database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileId {
    pub seed: i64,
    pub path: String,
    pub hash: String,
}

impl FileId {
    pub fn new(seed: i64, path: impl Into<String>, hash: impl Into<String>) -> Self {
        Self { seed, path: path.into(), hash: hash.into() }
    }

    pub fn describe(&self) -> String {
        format!("path [{}] | seed {} | hash {}", self.path, self.seed, self.hash)
    }

    pub fn record_type() -> RecordType {
        RecordType::new(vec![
            Field::new("seed", Dtype::I64),
            Field::new("path", Dtype::FixedStr(FILE_PATH_BYTES)),
            Field::new("hash", Dtype::FixedStr(FILE_HASH_BYTES)),
        ])
    }

    pub fn record_bytes() -> usize {
        Self::record_type().record_bytes()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::record_bytes());
        out.extend_from_slice(&self.seed.to_le_bytes());
        // The path keeps a null terminator; the hash is exactly 32 hex
        // chars and must survive whole or re-runs misclassify as stale.
        out.extend_from_slice(&pad_str(&self.path, FILE_PATH_BYTES - 1));
        out.push(0);
        out.extend_from_slice(&pad_str(&self.hash, FILE_HASH_BYTES));
        out
    }

    pub fn decode(record: &[u8]) -> Option<FileId> {
        if record.len() != Self::record_bytes() {
            return None;
        }
        let seed = i64::from_le_bytes(record[..8].try_into().ok()?);
        let path = unpad_str(&record[8..8 + FILE_PATH_BYTES]);
        let hash = unpad_str(&record[8 + FILE_PATH_BYTES..]);
        Some(FileId { seed, path, hash })
    }

    /// True when both fingerprints name the same observable file version.
    pub fn same_hash(&self, other: &FileId) -> bool {
        self.hash == other.hash
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileIdStatus {
    UpToDate,
    Stale,
    Missing,
}

/// One row of a persisted seed index: which row or column `seed` occupies
/// inside its target object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeedId {
    pub seed: i64,
    pub index: u64,
}

impl SeedId {
    pub fn record_type() -> RecordType {
        RecordType::new(vec![
            Field::new("seed", Dtype::I64),
            Field::new("index", Dtype::U64),
        ])
    }

    pub fn record_bytes() -> usize {
        16
    }

    pub fn encode(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[..8].copy_from_slice(&self.seed.to_le_bytes());
        out[8..].copy_from_slice(&self.index.to_le_bytes());
        out
    }

    pub fn decode(record: &[u8]) -> Option<SeedId> {
        if record.len() != 16 {
            return None;
        }
        Some(SeedId {
            seed: i64::from_le_bytes(record[..8].try_into().ok()?),
            index: u64::from_le_bytes(record[8..].try_into().ok()?),
        })
    }
}

fn pad_str(s: &str, width: usize) -> Vec<u8> {
    let mut out = vec![0u8; width];
    let bytes = s.as_bytes();
    let n = bytes.len().min(width);
    out[..n].copy_from_slice(&bytes[..n]);
    out
}

fn unpad_str(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Per-parameter-set progress counters.
#[derive(Debug, Default, Clone)]
pub struct FileStats {
    pub files: u64,
    pub count: u64,
    pub bytes: u64,
    pub elaps: f64,
}

impl FileStats {
    pub fn rate(&self) -> f64 {
        if self.elaps == 0.0 {
            0.0
        } else {
            self.count as f64 / self.elaps
        }
    }
}

/// Directory component of a file path, used as the prefix of source-side
/// cache keys so entries expire with the parameter set.
pub(crate) fn parent_dir(path: &std::path::Path) -> String {
    path.parent()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Matches one path component against a key pattern: `prefix*` matches by
/// prefix, anything else must be equal.
pub(crate) fn component_matches(comp: &str, pattern: &str) -> bool {
    match pattern.split_once('*') {
        Some((prefix, _)) => comp.starts_with(prefix),
        None => comp == pattern,
    }
}

/// Source and target locations of one `<algo>/<state>/<point>` group,
/// fixed once constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathId {
    pub base: String,
    pub algo: String,
    pub state: String,
    pub point: String,
    pub src_path: String,
    pub tgt_path: String,
}

impl PathId {
    pub fn new(base: &str, algo: &str, state: &str, point: &str) -> Self {
        Self {
            base: base.to_string(),
            algo: algo.to_string(),
            state: state.to_string(),
            point: point.to_string(),
            src_path: format!("{algo}/{state}/{point}"),
            tgt_path: format!("{base}/{algo}/{state}/{point}"),
        }
    }

    pub fn matches(&self, algo_pattern: &str, state_pattern: &str, point_pattern: &str) -> bool {
        component_matches(&self.algo, algo_pattern)
            && component_matches(&self.state, state_pattern)
            && component_matches(&self.point, point_pattern)
    }

    pub fn dset_path(&self, name: &str) -> String {
        format!("{}/{name}", self.tgt_path)
    }

    pub fn table_path(&self, name: &str) -> String {
        format!("{}/{}/{}/tables/{name}", self.base, self.algo, self.state)
    }

    /// A crono source table holds the whole time series of one
    /// realization; each iteration is collected in its own target table.
    pub fn crono_path(&self, name: &str, iter: u64) -> String {
        format!("{}/{}/{}/cronos/iter_{iter}/{name}", self.base, self.algo, self.state)
    }

    pub fn scale_path(&self, name: &str, chi: u64) -> String {
        format!("{}/{}/{}/scale/chi_{chi}/{name}", self.base, self.algo, self.state)
    }
}

/// Wraps target-object metadata with its seed index and a dirty flag that
/// tracks whether the index needs rewriting.
#[derive(Debug)]
pub struct InfoId<I> {
    pub info: I,
    db: BTreeMap<i64, u64>,
    dirty: bool,
}

impl<I> InfoId<I> {
    pub fn new(info: I) -> Self {
        Self { info, db: BTreeMap::new(), dirty: false }
    }

    pub fn has_index(&self, seed: i64) -> bool {
        self.db.contains_key(&seed)
    }

    pub fn get_index(&self, seed: i64) -> Option<u64> {
        self.db.get(&seed).copied()
    }

    /// Idempotent for an equal `(seed, index)` pair; anything new marks
    /// the index dirty.
    pub fn insert(&mut self, seed: i64, index: u64) {
        if self.db.insert(seed, index) != Some(index) {
            self.dirty = true;
        }
    }

    /// Seeds the index from a persisted database without dirtying it.
    pub fn load(&mut self, entries: impl IntoIterator<Item = SeedId>) {
        for entry in entries {
            self.db.insert(entry.seed, entry.index);
        }
    }

    pub fn db(&self) -> &BTreeMap<i64, u64> {
        &self.db
    }

    pub fn dirty(&self) -> bool {
        self.dirty
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    /// Row or column for a seed not yet present: one past everything known
    /// to the object or its index, whichever is larger. Buffered writers
    /// lag `num_records` behind the index, so both must be consulted.
    pub fn tail_index(&self, num_records: u64) -> u64 {
        let indexed = self.db.values().max().map(|m| m + 1).unwrap_or(0);
        num_records.max(indexed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_id_roundtrips_and_pads() {
        let id = FileId::new(42, "/data/L16/1042.h5", "abcd".repeat(8));
        let rec = id.encode();
        assert_eq!(rec.len(), FileId::record_bytes());
        assert_eq!(FileId::decode(&rec), Some(id));
    }

    #[test]
    fn file_id_truncates_overlong_paths_but_keeps_full_hashes() {
        let long = "x".repeat(400);
        let rec = FileId::new(1, long, "h".repeat(32)).encode();
        let back = FileId::decode(&rec).unwrap();
        assert_eq!(back.path.len(), FILE_PATH_BYTES - 1);
        assert_eq!(back.hash.len(), FILE_HASH_BYTES);
    }

    #[test]
    fn path_id_paths_and_matching() {
        let p = PathId::new("L_16/l_0.0500/d_+0.0000", "xDMRG", "state_0", "finished");
        assert_eq!(p.src_path, "xDMRG/state_0/finished");
        assert!(p.matches("xDMRG", "state_*", "finished"));
        assert!(!p.matches("fLBIT", "state_*", "finished"));
        assert_eq!(
            p.dset_path("bond_dimensions"),
            "L_16/l_0.0500/d_+0.0000/xDMRG/state_0/finished/bond_dimensions"
        );
        assert_eq!(
            p.table_path("measurements"),
            "L_16/l_0.0500/d_+0.0000/xDMRG/state_0/tables/measurements"
        );
        assert_eq!(
            p.crono_path("measurements", 3),
            "L_16/l_0.0500/d_+0.0000/xDMRG/state_0/cronos/iter_3/measurements"
        );
        assert_eq!(
            p.scale_path("measurements", 128),
            "L_16/l_0.0500/d_+0.0000/xDMRG/state_0/scale/chi_128/measurements"
        );
    }

    #[test]
    fn info_id_dirty_tracking_and_tail() {
        let mut id: InfoId<()> = InfoId::new(());
        assert!(!id.dirty());
        id.insert(100, 0);
        assert!(id.dirty());
        id.clear_dirty();
        id.insert(100, 0);
        assert!(!id.dirty(), "re-inserting an equal pair stays clean");
        assert_eq!(id.get_index(100), Some(0));
        assert_eq!(id.tail_index(0), 1);
        assert_eq!(id.tail_index(5), 5);
        id.load([SeedId { seed: 7, index: 9 }]);
        assert!(!id.dirty());
        assert_eq!(id.tail_index(0), 10);
    }
}
