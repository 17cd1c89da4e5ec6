use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::warn;

use crate::error::{Result, StoreError};
use crate::node::{Node, NodeKind, Scalar, Value};

const MAGIC: &[u8; 8] = b"h5mbls1\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    ReadOnly,
    ReadWrite,
    Replace,
}

/// One container file: a tree of groups, datasets, tables and scalars,
/// loaded fully on open and rewritten atomically on flush. A writable
/// handle flushes on drop.
pub struct StoreFile {
    path: PathBuf,
    access: Access,
    root: Node,
    deflate: u32,
    dirty: bool,
}

impl StoreFile {
    pub fn open(path: impl AsRef<Path>, access: Access) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let root = match access {
            Access::Replace => Node::group(),
            Access::ReadOnly => Self::load(&path)?,
            Access::ReadWrite => {
                if path.exists() {
                    Self::load(&path)?
                } else {
                    Node::group()
                }
            }
        };
        Ok(Self {
            path,
            access,
            root,
            deflate: 4,
            dirty: matches!(access, Access::Replace),
        })
    }

    fn load(path: &Path) -> Result<Node> {
        let mut file = File::open(path)?;
        let mut magic = [0u8; 8];
        file.read_exact(&mut magic)
            .map_err(|_| StoreError::BadMagic(path.to_path_buf()))?;
        if &magic != MAGIC {
            return Err(StoreError::BadMagic(path.to_path_buf()));
        }
        let mut buf = Vec::new();
        GzDecoder::new(file).read_to_end(&mut buf)?;
        let (root, _) = bincode::decode_from_slice(&buf, bincode::config::standard())
            .map_err(|err| StoreError::Codec(err.to_string()))?;
        Ok(root)
    }

    /// Serializes the tree to a sibling temp file and renames it into
    /// place, so readers never observe a half-written container.
    pub fn flush(&mut self) -> Result<()> {
        if !self.dirty || matches!(self.access, Access::ReadOnly) {
            return Ok(());
        }
        let bytes = bincode::encode_to_vec(&self.root, bincode::config::standard())
            .map_err(|err| StoreError::Codec(err.to_string()))?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut tmp_name = self.path.as_os_str().to_os_string();
        tmp_name.push(".tmp");
        let tmp = PathBuf::from(tmp_name);
        let mut out = File::create(&tmp)?;
        out.write_all(MAGIC)?;
        let mut enc = GzEncoder::new(out, Compression::new(self.deflate));
        enc.write_all(&bytes)?;
        enc.finish()?;
        fs::rename(&tmp, &self.path)?;
        self.dirty = false;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn writable(&self) -> bool {
        !matches!(self.access, Access::ReadOnly)
    }

    pub fn set_compression(&mut self, level: u32) {
        self.deflate = level.min(9);
    }

    pub(crate) fn check_writable(&self) -> Result<()> {
        if self.writable() {
            Ok(())
        } else {
            Err(StoreError::ReadOnly(self.path.clone()))
        }
    }

    pub(crate) fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    fn split(path: &str) -> Vec<&str> {
        path.split('/').filter(|s| !s.is_empty()).collect()
    }

    pub(crate) fn node(&self, path: &str) -> Option<&Node> {
        let mut cur = &self.root;
        for seg in Self::split(path) {
            match cur {
                Node::Group { children, .. } => cur = children.get(seg)?,
                _ => return None,
            }
        }
        Some(cur)
    }

    pub(crate) fn node_mut(&mut self, path: &str) -> Option<&mut Node> {
        let mut cur = &mut self.root;
        for seg in Self::split(path) {
            match cur {
                Node::Group { children, .. } => cur = children.get_mut(seg)?,
                _ => return None,
            }
        }
        Some(cur)
    }

    pub(crate) fn require(&self, path: &str) -> Result<&Node> {
        self.node(path).ok_or_else(|| StoreError::Missing(path.to_string()))
    }

    /// Inserts `node` at `path`, creating intermediate groups and replacing
    /// any existing link at the leaf.
    pub(crate) fn insert(&mut self, path: &str, node: Node) -> Result<()> {
        self.check_writable()?;
        let segs = Self::split(path);
        let Some((leaf, parents)) = segs.split_last() else {
            return Err(StoreError::Kind { path: path.to_string(), expected: "link" });
        };
        let mut cur = &mut self.root;
        for seg in parents {
            let children = match cur {
                Node::Group { children, .. } => children,
                _ => {
                    return Err(StoreError::Kind { path: path.to_string(), expected: "group" })
                }
            };
            cur = children.entry((*seg).to_string()).or_insert_with(Node::group);
        }
        match cur {
            Node::Group { children, .. } => {
                children.insert((*leaf).to_string(), node);
            }
            _ => return Err(StoreError::Kind { path: path.to_string(), expected: "group" }),
        }
        self.dirty = true;
        Ok(())
    }

    pub fn link_exists(&self, path: &str) -> bool {
        self.node(path).is_some()
    }

    pub fn kind(&self, path: &str) -> Option<NodeKind> {
        self.node(path).map(Node::kind)
    }

    /// Group paths under `root` whose basename matches `pattern`, relative
    /// to `root`. `max_hits <= 0` is unbounded; `depth` limits how many
    /// levels below `root` are searched (`0` = immediate children,
    /// negative = unlimited). An empty pattern matches every name.
    pub fn find_groups(&self, pattern: &str, root: &str, max_hits: i64, depth: i64) -> Vec<String> {
        self.find_kind(NodeKind::Group, pattern, root, max_hits, depth)
    }

    pub fn find_tables(&self, pattern: &str, root: &str, max_hits: i64, depth: i64) -> Vec<String> {
        self.find_kind(NodeKind::Table, pattern, root, max_hits, depth)
    }

    pub fn find_dsets(&self, pattern: &str, root: &str, max_hits: i64, depth: i64) -> Vec<String> {
        self.find_kind(NodeKind::Dset, pattern, root, max_hits, depth)
    }

    fn find_kind(
        &self,
        want: NodeKind,
        pattern: &str,
        root: &str,
        max_hits: i64,
        depth: i64,
    ) -> Vec<String> {
        let mut out = Vec::new();
        let Some(node) = self.node(root) else { return out };
        Self::visit(node, want, pattern, max_hits, depth, 0, "", &mut out);
        out
    }

    #[allow(clippy::too_many_arguments)]
    fn visit(
        node: &Node,
        want: NodeKind,
        pattern: &str,
        max_hits: i64,
        depth: i64,
        level: i64,
        prefix: &str,
        out: &mut Vec<String>,
    ) {
        let Node::Group { children, .. } = node else { return };
        for (name, child) in children {
            if max_hits > 0 && out.len() as i64 >= max_hits {
                return;
            }
            let rel = if prefix.is_empty() { name.clone() } else { format!("{prefix}/{name}") };
            if child.kind() == want && name_matches(name, pattern) && !out.contains(&rel) {
                out.push(rel.clone());
            }
            if matches!(child, Node::Group { .. }) && (depth < 0 || level < depth) {
                Self::visit(child, want, pattern, max_hits, depth, level + 1, &rel, out);
            }
        }
    }

    pub fn write_attr(&mut self, path: &str, name: &str, value: Value) -> Result<()> {
        self.check_writable()?;
        let node = self
            .node_mut(path)
            .ok_or_else(|| StoreError::Missing(path.to_string()))?;
        node.attrs_mut().insert(name.to_string(), value);
        self.dirty = true;
        Ok(())
    }

    pub fn has_attr(&self, path: &str, name: &str) -> bool {
        self.node(path).is_some_and(|n| n.attrs().contains_key(name))
    }

    pub fn read_attr(&self, path: &str, name: &str) -> Result<Value> {
        self.require(path)?
            .attrs()
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::Missing(format!("{path}@{name}")))
    }

    pub fn read_attr_i64(&self, path: &str, name: &str) -> Result<i64> {
        self.read_attr(path, name)?
            .as_i64()
            .ok_or_else(|| attr_type_err(path, name, "i64"))
    }

    pub fn read_attr_u64(&self, path: &str, name: &str) -> Result<u64> {
        self.read_attr(path, name)?
            .as_u64()
            .ok_or_else(|| attr_type_err(path, name, "u64"))
    }

    pub fn read_attr_f64(&self, path: &str, name: &str) -> Result<f64> {
        self.read_attr(path, name)?
            .as_f64()
            .ok_or_else(|| attr_type_err(path, name, "f64"))
    }

    pub fn read_attr_str(&self, path: &str, name: &str) -> Result<String> {
        self.read_attr(path, name)?
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| attr_type_err(path, name, "string"))
    }

    pub fn write_scalar(&mut self, path: &str, value: Value) -> Result<()> {
        match self.node_mut(path) {
            Some(Node::Scalar(s)) => {
                s.value = value;
                self.dirty = true;
                Ok(())
            }
            Some(_) => Err(StoreError::Kind { path: path.to_string(), expected: "scalar" }),
            None => self.insert(path, Node::Scalar(Scalar { value, attrs: Default::default() })),
        }
    }

    pub fn read_scalar(&self, path: &str) -> Result<Value> {
        match self.require(path)? {
            Node::Scalar(s) => Ok(s.value.clone()),
            _ => Err(StoreError::Kind { path: path.to_string(), expected: "scalar" }),
        }
    }

    pub fn create_ext_link(&mut self, path: &str, file: &str, target: &str) -> Result<()> {
        self.insert(
            path,
            Node::ExtLink {
                file: file.to_string(),
                path: target.to_string(),
                attrs: Default::default(),
            },
        )
    }

    pub fn read_ext_link(&self, path: &str) -> Result<(String, String)> {
        match self.require(path)? {
            Node::ExtLink { file, path: target, .. } => Ok((file.clone(), target.clone())),
            _ => Err(StoreError::Kind { path: path.to_string(), expected: "external link" }),
        }
    }
}

impl Drop for StoreFile {
    fn drop(&mut self) {
        if self.dirty && self.writable() {
            if let Err(err) = self.flush() {
                warn!("failed to flush {} on drop: {err}", self.path.display());
            }
        }
    }
}

fn attr_type_err(path: &str, name: &str, expected: &str) -> StoreError {
    StoreError::Type {
        path: format!("{path}@{name}"),
        detail: format!("expected {expected}"),
    }
}

pub(crate) fn name_matches(name: &str, pattern: &str) -> bool {
    if pattern.is_empty() {
        return true;
    }
    match pattern.strip_suffix('*') {
        Some(prefix) => name.starts_with(prefix),
        None => name.ends_with(pattern),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn roundtrip_groups_scalars_and_attrs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.h5");
        {
            let mut f = StoreFile::open(&path, Access::Replace).unwrap();
            f.write_scalar("common/finished_all", Value::Bool(true)).unwrap();
            f.write_scalar("a/b/n", Value::U64(7)).unwrap();
            f.write_attr("a/b", "note", Value::Str("hello".into())).unwrap();
            f.flush().unwrap();
        }
        let f = StoreFile::open(&path, Access::ReadOnly).unwrap();
        assert_eq!(f.read_scalar("common/finished_all").unwrap(), Value::Bool(true));
        assert_eq!(f.read_attr_str("a/b", "note").unwrap(), "hello");
        assert_eq!(f.read_attr_u64("a/b/n", "nope").ok(), None);
        assert!(f.link_exists("a/b"));
        assert!(!f.link_exists("a/c"));
    }

    #[test]
    fn readonly_rejects_writes_and_missing_file_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.h5");
        StoreFile::open(&path, Access::Replace).unwrap().flush().unwrap();
        let mut f = StoreFile::open(&path, Access::ReadOnly).unwrap();
        assert!(matches!(
            f.write_scalar("x", Value::I64(1)),
            Err(StoreError::ReadOnly(_))
        ));
        assert!(StoreFile::open(dir.path().join("gone.h5"), Access::ReadOnly).is_err());
    }

    #[test]
    fn bad_magic_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("junk.h5");
        std::fs::write(&path, b"definitely not a container").unwrap();
        assert!(matches!(
            StoreFile::open(&path, Access::ReadOnly),
            Err(StoreError::BadMagic(_))
        ));
    }

    #[test]
    fn find_groups_matches_prefix_and_suffix() {
        let dir = tempdir().unwrap();
        let mut f = StoreFile::open(dir.path().join("t.h5"), Access::Replace).unwrap();
        for g in [
            "xDMRG/state_0/finished",
            "xDMRG/state_1/finished",
            "xDMRG/state_1/checkpoint/iter_5",
            "fLBIT/state_real/finished",
        ] {
            f.write_scalar(&format!("{g}/marker"), Value::Bool(true)).unwrap();
        }
        assert_eq!(f.find_groups("state_*", "xDMRG", -1, 0), ["state_0", "state_1"]);
        assert_eq!(f.find_groups("finished", "xDMRG/state_1", -1, 0), ["finished"]);
        assert_eq!(
            f.find_groups("finished", "", -1, -1),
            [
                "fLBIT/state_real/finished",
                "xDMRG/state_0/finished",
                "xDMRG/state_1/finished"
            ]
        );
        assert_eq!(f.find_groups("state_*", "xDMRG", 1, 0), ["state_0"]);
        assert!(f.find_groups("state_*", "missing/root", -1, 0).is_empty());
    }

    #[test]
    fn ext_links_roundtrip() {
        let dir = tempdir().unwrap();
        let mut f = StoreFile::open(dir.path().join("t.h5"), Access::Replace).unwrap();
        f.create_ext_link("parts/run1", "run1/merged.h5", "/L_16").unwrap();
        let (file, target) = f.read_ext_link("parts/run1").unwrap();
        assert_eq!(file, "run1/merged.h5");
        assert_eq!(target, "/L_16");
    }
}
