use crate::error::{Result, StoreError};
use crate::node::{Dset, Dtype, Node};
use crate::file::StoreFile;

/// Cached dataset metadata. File-specific fields are `Option` so a caller
/// holding one of these across files can blank them and refill from the
/// next file handle with a single `fill_dset_info` call.
#[derive(Debug, Clone, Default)]
pub struct DsetInfo {
    pub dset_path: Option<String>,
    pub dset_exists: Option<bool>,
    pub dtype: Option<Dtype>,
    pub dims: Option<Vec<u64>>,
    pub dset_size: Option<u64>,
    pub dset_byte: Option<u64>,
    pub chunk: Option<Vec<u64>>,
}

impl DsetInfo {
    pub fn exists(&self) -> bool {
        self.dset_exists.unwrap_or(false)
    }

    pub fn path(&self) -> Result<&str> {
        self.dset_path
            .as_deref()
            .ok_or_else(|| StoreError::Missing("dset info has no path".to_string()))
    }
}

impl StoreFile {
    pub fn get_dset_info(&self, path: &str) -> DsetInfo {
        let mut info = DsetInfo { dset_path: Some(path.to_string()), ..Default::default() };
        self.fill_dset_info(&mut info);
        info
    }

    /// Refreshes every file-specific field of `info` from this file.
    pub fn fill_dset_info(&self, info: &mut DsetInfo) {
        let Some(path) = info.dset_path.clone() else {
            info.dset_exists = Some(false);
            return;
        };
        match self.node(&path) {
            Some(Node::Dset(d)) => {
                let size: u64 = d.dims.iter().product();
                info.dset_exists = Some(true);
                info.dtype = Some(d.dtype);
                info.dims = Some(d.dims.clone());
                info.dset_size = Some(size);
                info.dset_byte = Some(size * d.dtype.size() as u64);
                info.chunk = Some(d.chunk.clone());
            }
            _ => info.dset_exists = Some(false),
        }
    }

    /// Creates a chunked dataset. A zero extent on one axis marks the axis
    /// that grows as slabs are appended. Returns the info of an existing
    /// dataset unchanged if the path is already a dataset.
    pub fn create_dset(
        &mut self,
        path: &str,
        dtype: Dtype,
        dims: &[u64],
        chunk: &[u64],
        deflate: u8,
    ) -> Result<DsetInfo> {
        match self.node(path) {
            Some(Node::Dset(_)) => return Ok(self.get_dset_info(path)),
            Some(_) => {
                return Err(StoreError::Kind { path: path.to_string(), expected: "dataset" })
            }
            None => {}
        }
        let size: u64 = dims.iter().product();
        let dset = Dset {
            dtype,
            dims: dims.to_vec(),
            chunk: chunk.to_vec(),
            deflate,
            raw: vec![0; size as usize * dtype.size()],
            attrs: Default::default(),
        };
        self.insert(path, Node::Dset(dset))?;
        Ok(self.get_dset_info(path))
    }

    /// Writes one slab (the full cross-section of every other axis) at
    /// position `index` along `axis`, growing that axis as needed.
    pub fn write_dset_slab(
        &mut self,
        info: &mut DsetInfo,
        axis: usize,
        index: u64,
        data: &[u8],
    ) -> Result<()> {
        self.check_writable()?;
        let path = info.path()?.to_string();
        let node = self
            .node_mut(&path)
            .ok_or_else(|| StoreError::Missing(path.clone()))?;
        let Node::Dset(d) = node else {
            return Err(StoreError::Kind { path, expected: "dataset" });
        };
        if axis >= d.dims.len() {
            return Err(StoreError::Range {
                path,
                detail: format!("axis {axis} out of rank {}", d.dims.len()),
            });
        }
        let esize = d.dtype.size();
        let slab_elems: u64 = d
            .dims
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != axis)
            .map(|(_, n)| *n)
            .product();
        if data.len() != slab_elems as usize * esize {
            return Err(StoreError::Type {
                path,
                detail: format!(
                    "slab is {} bytes, dataset expects {}",
                    data.len(),
                    slab_elems as usize * esize
                ),
            });
        }
        if index >= d.dims[axis] {
            grow_axis(d, axis, index + 1);
        }
        let inner: usize =
            d.dims[axis + 1..].iter().product::<u64>() as usize * esize;
        let outer: usize = d.dims[..axis].iter().product::<u64>() as usize;
        let axis_len = d.dims[axis] as usize;
        for k in 0..outer {
            let dst = (k * axis_len + index as usize) * inner;
            let src = k * inner;
            d.raw[dst..dst + inner].copy_from_slice(&data[src..src + inner]);
        }
        self.mark_dirty();
        self.fill_dset_info(info);
        Ok(())
    }

    /// Writes a whole dataset in one call, creating or replacing it.
    pub fn write_dset(
        &mut self,
        path: &str,
        dtype: Dtype,
        dims: &[u64],
        data: &[u8],
    ) -> Result<DsetInfo> {
        let size: u64 = dims.iter().product();
        if data.len() != size as usize * dtype.size() {
            return Err(StoreError::Type {
                path: path.to_string(),
                detail: format!(
                    "{} bytes for {size} elements of {}",
                    data.len(),
                    dtype.size()
                ),
            });
        }
        let dset = Dset {
            dtype,
            dims: dims.to_vec(),
            chunk: dims.to_vec(),
            deflate: 0,
            raw: data.to_vec(),
            attrs: Default::default(),
        };
        self.insert(path, Node::Dset(dset))?;
        Ok(self.get_dset_info(path))
    }

    pub fn read_dset_raw(&self, path: &str) -> Result<(Dtype, Vec<u64>, Vec<u8>)> {
        match self.require(path)? {
            Node::Dset(d) => Ok((d.dtype, d.dims.clone(), d.raw.clone())),
            _ => Err(StoreError::Kind { path: path.to_string(), expected: "dataset" }),
        }
    }

    /// Reads back the slab at `index` along `axis`.
    pub fn read_dset_slab(&self, path: &str, axis: usize, index: u64) -> Result<Vec<u8>> {
        let Node::Dset(d) = self.require(path)? else {
            return Err(StoreError::Kind { path: path.to_string(), expected: "dataset" });
        };
        if axis >= d.dims.len() || index >= d.dims[axis] {
            return Err(StoreError::Range {
                path: path.to_string(),
                detail: format!("axis {axis} index {index} in dims {:?}", d.dims),
            });
        }
        let esize = d.dtype.size();
        let inner: usize = d.dims[axis + 1..].iter().product::<u64>() as usize * esize;
        let outer: usize = d.dims[..axis].iter().product::<u64>() as usize;
        let axis_len = d.dims[axis] as usize;
        let mut out = Vec::with_capacity(outer * inner);
        for k in 0..outer {
            let src = (k * axis_len + index as usize) * inner;
            out.extend_from_slice(&d.raw[src..src + inner]);
        }
        Ok(out)
    }
}

/// Grows `axis` to `new_len`, re-laying the row-major buffer and
/// zero-filling the new region.
fn grow_axis(d: &mut Dset, axis: usize, new_len: u64) {
    let esize = d.dtype.size();
    let old_dims = d.dims.clone();
    let inner: usize = old_dims[axis + 1..].iter().product::<u64>() as usize * esize;
    let outer: usize = old_dims[..axis].iter().product::<u64>() as usize;
    let old_len = old_dims[axis] as usize;
    let new_len = new_len as usize;
    let mut new_raw = vec![0u8; outer * new_len * inner];
    for k in 0..outer {
        for j in 0..old_len {
            let src = (k * old_len + j) * inner;
            let dst = (k * new_len + j) * inner;
            new_raw[dst..dst + inner].copy_from_slice(&d.raw[src..src + inner]);
        }
    }
    d.raw = new_raw;
    d.dims[axis] = new_len as u64;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::Access;
    use tempfile::tempdir;

    fn f64s(vals: &[f64]) -> Vec<u8> {
        vals.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    #[test]
    fn column_appends_grow_axis_one() {
        let dir = tempdir().unwrap();
        let mut f = StoreFile::open(dir.path().join("t.h5"), Access::Replace).unwrap();
        let mut info = f
            .create_dset("bond_dimensions", Dtype::F64, &[3, 0], &[3, 100], 4)
            .unwrap();
        f.write_dset_slab(&mut info, 1, 0, &f64s(&[1.0, 2.0, 3.0])).unwrap();
        f.write_dset_slab(&mut info, 1, 1, &f64s(&[4.0, 5.0, 6.0])).unwrap();
        assert_eq!(info.dims.as_deref(), Some(&[3u64, 2][..]));
        // Row-major layout interleaves the two columns.
        let (_, dims, raw) = f.read_dset_raw("bond_dimensions").unwrap();
        assert_eq!(dims, [3, 2]);
        assert_eq!(raw, f64s(&[1.0, 4.0, 2.0, 5.0, 3.0, 6.0]));
        assert_eq!(f.read_dset_slab("bond_dimensions", 1, 0).unwrap(), f64s(&[1.0, 2.0, 3.0]));
        assert_eq!(f.read_dset_slab("bond_dimensions", 1, 1).unwrap(), f64s(&[4.0, 5.0, 6.0]));
    }

    #[test]
    fn out_of_order_writes_zero_fill_the_gap() {
        let dir = tempdir().unwrap();
        let mut f = StoreFile::open(dir.path().join("t.h5"), Access::Replace).unwrap();
        let mut info = f.create_dset("d", Dtype::F64, &[2, 0], &[2, 10], 0).unwrap();
        f.write_dset_slab(&mut info, 1, 2, &f64s(&[7.0, 8.0])).unwrap();
        assert_eq!(info.dims.as_deref(), Some(&[2u64, 3][..]));
        assert_eq!(f.read_dset_slab("d", 1, 0).unwrap(), f64s(&[0.0, 0.0]));
        assert_eq!(f.read_dset_slab("d", 1, 2).unwrap(), f64s(&[7.0, 8.0]));
    }

    #[test]
    fn slab_size_mismatch_is_an_error() {
        let dir = tempdir().unwrap();
        let mut f = StoreFile::open(dir.path().join("t.h5"), Access::Replace).unwrap();
        let mut info = f.create_dset("d", Dtype::F64, &[4, 0], &[4, 10], 0).unwrap();
        let err = f.write_dset_slab(&mut info, 1, 0, &f64s(&[1.0])).unwrap_err();
        assert!(matches!(err, StoreError::Type { .. }));
    }

    #[test]
    fn info_invalidation_refills_from_other_file() {
        let dir = tempdir().unwrap();
        let mut a = StoreFile::open(dir.path().join("a.h5"), Access::Replace).unwrap();
        let mut info = a.create_dset("d", Dtype::I64, &[2, 0], &[2, 10], 0).unwrap();
        a.write_dset_slab(&mut info, 1, 0, &[0u8; 16]).unwrap();

        let b = StoreFile::open(dir.path().join("b.h5"), Access::Replace).unwrap();
        info.dset_exists = None;
        info.dims = None;
        b.fill_dset_info(&mut info);
        assert_eq!(info.dset_exists, Some(false));
    }
}
