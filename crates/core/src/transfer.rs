use std::collections::HashMap;

use h5mbl_store::{DsetInfo, StoreFile, TableInfo, TableSelection};
use tracing::{debug, info, warn};

use crate::buffered::BufferedTableInfo;
use crate::db::{clear_dset_info, clear_table_info, SrcDb};
use crate::error::{MergeError, Result};
use crate::id::{parent_dir, FileId, InfoId, PathId};
use crate::keys::{CronoKey, DsetKey, DsetSize, ScaleKey, TableKey};
use crate::pathcache::PathCache;

/// Growing-axis chunking for stacked datasets: about half a megabyte per
/// chunk, bounded to keep tiny and huge slabs sane.
fn dset_chunk_records(slab_bytes: usize) -> u64 {
    ((500_000 / slab_bytes.max(1)) as u64).clamp(10, 1000)
}

/// Table chunks target roughly 10 KiB.
fn table_chunk_records(record_bytes: usize) -> u64 {
    ((10_240 / record_bytes.max(1)) as u64).clamp(10, 1000)
}

#[derive(Debug, Clone)]
pub struct GatheredDset {
    pub name: String,
    pub size: DsetSize,
    pub axis: usize,
    pub src_key: String,
}

#[derive(Debug, Clone)]
pub struct GatheredTable {
    pub name: String,
    pub src_key: String,
}

#[derive(Debug, Clone)]
pub struct GatheredScale {
    pub name: String,
    pub chi: u64,
    pub src_key: String,
}

fn missing_key(key: &str) -> MergeError {
    MergeError::Logic(format!("key [{key}] was not found in the source map"))
}

/// Resolves each matching dataset key against the current file through the
/// per-directory info cache, dropping keys whose object this file lacks.
pub fn gather_dsets(
    src: &StoreFile,
    src_db: &mut SrcDb,
    pathid: &PathId,
    keys: &[&DsetKey],
) -> Vec<GatheredDset> {
    let parent = parent_dir(src.path());
    let mut out = Vec::new();
    for key in keys {
        let dset_path = format!("{}/{}", pathid.src_path, key.name);
        let src_key = format!("{parent}|{dset_path}");
        let entry = src_db.dset.entry(src_key.clone()).or_insert_with(|| {
            debug!("detected new source dset [{src_key}]");
            DsetInfo { dset_path: Some(dset_path.clone()), ..Default::default() }
        });
        clear_dset_info(entry);
        src.fill_dset_info(entry);
        if !entry.exists() {
            debug!("dset [{dset_path}] is absent from this file");
            continue;
        }
        out.push(GatheredDset {
            name: key.name.clone(),
            size: key.size,
            axis: key.axis,
            src_key,
        });
    }
    out
}

fn gather_table_like(
    src: &StoreFile,
    src_db: &mut SrcDb,
    table_path: String,
    parent: &str,
) -> Option<String> {
    let src_key = format!("{parent}|{table_path}");
    let entry = src_db.table.entry(src_key.clone()).or_insert_with(|| {
        debug!("detected new source table [{src_key}]");
        TableInfo { table_path: Some(table_path.clone()), ..Default::default() }
    });
    clear_table_info(entry);
    src.fill_table_info(entry);
    if !entry.exists() {
        debug!("table [{table_path}] is absent from this file");
        return None;
    }
    Some(src_key)
}

pub fn gather_tables(
    src: &StoreFile,
    src_db: &mut SrcDb,
    pathid: &PathId,
    keys: &[&TableKey],
) -> Vec<GatheredTable> {
    let parent = parent_dir(src.path());
    keys.iter()
        .filter_map(|key| {
            let table_path = format!("{}/{}", pathid.src_path, key.name);
            gather_table_like(src, src_db, table_path, &parent)
                .map(|src_key| GatheredTable { name: key.name.clone(), src_key })
        })
        .collect()
}

pub fn gather_cronos(
    src: &StoreFile,
    src_db: &mut SrcDb,
    pathid: &PathId,
    keys: &[&CronoKey],
) -> Vec<GatheredTable> {
    let parent = parent_dir(src.path());
    keys.iter()
        .filter_map(|key| {
            let table_path = format!("{}/{}", pathid.src_path, key.name);
            gather_table_like(src, src_db, table_path, &parent)
                .map(|src_key| GatheredTable { name: key.name.clone(), src_key })
        })
        .collect()
}

/// Scans the subgroups matching each key's scale pattern (e.g. `chi_*`)
/// and resolves the table inside every one of them.
pub fn gather_scales(
    src: &StoreFile,
    src_db: &mut SrcDb,
    cache: &mut PathCache,
    pathid: &PathId,
    keys: &[&ScaleKey],
) -> Vec<GatheredScale> {
    let parent = parent_dir(src.path());
    let mut out = Vec::new();
    for key in keys {
        let groups = cache.find_keys(src, &pathid.src_path, &[key.pattern.clone()], -1, 0);
        for group in groups {
            let Some(chi) = group.rsplit('_').next().and_then(|s| s.parse().ok()) else {
                warn!("cannot read a bond dimension out of group [{group}]");
                continue;
            };
            let table_path = format!("{}/{group}/{}", pathid.src_path, key.name);
            if let Some(src_key) = gather_table_like(src, src_db, table_path, &parent) {
                out.push(GatheredScale { name: key.name.clone(), chi, src_key });
            }
        }
    }
    out
}

/// Stacks each gathered dataset into its target, one slab per realization
/// along the key's axis. The target is created on first contact, sized
/// from the source (or from `status.chi_lim_max` for `Var` keys) with a
/// zero extent on the stacking axis.
pub fn transfer_dsets(
    tgt: &mut StoreFile,
    tgt_dsets: &mut HashMap<String, InfoId<DsetInfo>>,
    src: &StoreFile,
    src_db: &SrcDb,
    pathid: &PathId,
    gathered: &[GatheredDset],
    file_id: &FileId,
) -> Result<()> {
    for g in gathered {
        let src_info = src_db.dset.get(&g.src_key).ok_or_else(|| missing_key(&g.src_key))?;
        let tgt_path = pathid.dset_path(&g.name);
        if !tgt_dsets.contains_key(&tgt_path) {
            let mut info = tgt.get_dset_info(&tgt_path);
            if !info.exists() {
                let dtype = src_info
                    .dtype
                    .ok_or_else(|| missing_key(&g.src_key))?;
                let src_dims = src_info.dims.clone().unwrap_or_default();
                let mut dims = if src_dims.is_empty() { vec![1] } else { src_dims };
                if let DsetSize::Var = g.size {
                    let status_path = format!("{}/status", pathid.src_path);
                    dims[0] = src.read_table_field_u64(
                        &status_path,
                        "chi_lim_max",
                        TableSelection::First,
                    )?;
                }
                let slab_bytes = dims.iter().product::<u64>() as usize * dtype.size();
                let axis = g.axis.min(dims.len());
                let mut tgt_dims = dims.clone();
                tgt_dims.insert(axis, 0);
                let mut chunk = dims;
                chunk.insert(axis, dset_chunk_records(slab_bytes));
                info!("adding target dset [{tgt_path}]");
                info = tgt.create_dset(&tgt_path, dtype, &tgt_dims, &chunk, 4)?;
            }
            tgt_dsets.insert(tgt_path.clone(), InfoId::new(info));
        }
        let id = tgt_dsets.get_mut(&tgt_path).expect("entry exists");
        let tail = id.info.dims.as_ref().and_then(|d| d.get(g.axis)).copied().unwrap_or(0);
        let index = id.get_index(file_id.seed).unwrap_or_else(|| id.tail_index(tail));

        let (_, _, mut raw) = src.read_dset_raw(src_info.path()?)?;
        let esize = id.info.dtype.map(|t| t.size()).unwrap_or(1);
        let slab_bytes: usize = id
            .info
            .dims
            .as_ref()
            .map(|dims| {
                dims.iter()
                    .enumerate()
                    .filter(|(i, _)| *i != g.axis)
                    .map(|(_, n)| *n as usize)
                    .product::<usize>()
                    * esize
            })
            .unwrap_or(raw.len());
        // Variable-length sources are padded up to the declared extent;
        // anything longer is truncated.
        if raw.len() < slab_bytes {
            raw.resize(slab_bytes, 0);
        } else if raw.len() > slab_bytes {
            warn!(
                "dset [{}] holds {} bytes, clipping to {slab_bytes}",
                g.src_key,
                raw.len()
            );
            raw.truncate(slab_bytes);
        }
        tgt.write_dset_slab(&mut id.info, g.axis, index, &raw)?;
        id.insert(file_id.seed, index);
    }
    Ok(())
}

/// Appends the last record of each gathered table at the seed's row.
pub fn transfer_tables(
    tgt: &mut StoreFile,
    tgt_tables: &mut HashMap<String, InfoId<TableInfo>>,
    src: &StoreFile,
    src_db: &SrcDb,
    pathid: &PathId,
    gathered: &[GatheredTable],
    file_id: &FileId,
) -> Result<()> {
    for g in gathered {
        let src_info = src_db.table.get(&g.src_key).ok_or_else(|| missing_key(&g.src_key))?;
        let tgt_path = pathid.table_path(&g.name);
        if !tgt_tables.contains_key(&tgt_path) {
            let mut info = tgt.get_table_info(&tgt_path);
            if !info.exists() {
                let rectype = src_info
                    .record_type
                    .clone()
                    .ok_or_else(|| missing_key(&g.src_key))?;
                let title = src_info.table_title.clone().unwrap_or_else(|| g.name.clone());
                let chunk = table_chunk_records(rectype.record_bytes());
                info!("adding target table [{tgt_path}]");
                info = tgt.create_table(&tgt_path, rectype, &title, chunk, 4)?;
            }
            tgt_tables.insert(tgt_path.clone(), InfoId::new(info));
        }
        let id = tgt_tables.get_mut(&tgt_path).expect("entry exists");
        let tail = id.info.num_records.unwrap_or(0);
        let index = id.get_index(file_id.seed).unwrap_or_else(|| id.tail_index(tail));
        tgt.copy_table_records(src, src_info, TableSelection::Last, &mut id.info, index)?;
        id.insert(file_id.seed, index);
    }
    Ok(())
}

/// Pivots each gathered time series: row `r` of the source (iteration
/// number taken from the `iter` column when present, the row number
/// otherwise) lands in the target table for that iteration, at the seed's
/// row. A row whose target slot is still staged in the write buffer is a
/// double-written terminal iteration and is skipped; a slot known from a
/// previous run is overwritten in place, which is what makes stale
/// re-merges converge.
pub fn transfer_cronos(
    tgt: &mut StoreFile,
    tgt_cronos: &mut HashMap<String, InfoId<BufferedTableInfo>>,
    src: &StoreFile,
    src_db: &SrcDb,
    pathid: &PathId,
    gathered: &[GatheredTable],
    file_id: &FileId,
) -> Result<()> {
    for g in gathered {
        let src_info = src_db.table.get(&g.src_key).ok_or_else(|| missing_key(&g.src_key))?;
        let Some(rectype) = src_info.record_type.clone() else { continue };
        let records = src_info.num_records.unwrap_or(0);
        if records == 0 {
            continue;
        }
        let record_bytes = rectype.record_bytes();
        let title = src_info.table_title.clone().unwrap_or_else(|| g.name.clone());
        let raw = src.read_table_records(src_info.path()?, 0, records)?;
        let has_iter = rectype.offset_of("iter").is_some();
        for (row, record) in raw.chunks(record_bytes).enumerate() {
            let iter = if has_iter {
                rectype.read_u64(record, "iter").unwrap_or(row as u64)
            } else {
                row as u64
            };
            let tgt_path = pathid.crono_path(&g.name, iter);
            insert_buffered(
                tgt,
                tgt_cronos,
                &tgt_path,
                rectype.clone(),
                &title,
                record,
                file_id.seed,
            )?;
        }
    }
    Ok(())
}

/// Takes the last record of the table inside each matching scale subgroup
/// and lands it at the seed's row of `.../scale/chi_<chi>/<name>`.
pub fn transfer_scales(
    tgt: &mut StoreFile,
    tgt_scales: &mut HashMap<String, InfoId<BufferedTableInfo>>,
    src: &StoreFile,
    src_db: &SrcDb,
    pathid: &PathId,
    gathered: &[GatheredScale],
    file_id: &FileId,
) -> Result<()> {
    for g in gathered {
        let src_info = src_db.table.get(&g.src_key).ok_or_else(|| missing_key(&g.src_key))?;
        let Some(rectype) = src_info.record_type.clone() else { continue };
        let records = src_info.num_records.unwrap_or(0);
        if records == 0 {
            continue;
        }
        let title = src_info.table_title.clone().unwrap_or_else(|| g.name.clone());
        let record = src.read_table_records(src_info.path()?, records - 1, 1)?;
        let tgt_path = pathid.scale_path(&g.name, g.chi);
        insert_buffered(
            tgt,
            tgt_scales,
            &tgt_path,
            rectype,
            &title,
            &record,
            file_id.seed,
        )?;
    }
    Ok(())
}

fn insert_buffered(
    tgt: &mut StoreFile,
    map: &mut HashMap<String, InfoId<BufferedTableInfo>>,
    tgt_path: &str,
    rectype: h5mbl_store::RecordType,
    title: &str,
    record: &[u8],
    seed: i64,
) -> Result<()> {
    if !map.contains_key(tgt_path) {
        let mut info = tgt.get_table_info(tgt_path);
        if !info.exists() {
            let chunk = table_chunk_records(rectype.record_bytes());
            info!("adding target table [{tgt_path}]");
            info = tgt.create_table(tgt_path, rectype, title, chunk, 4)?;
        }
        map.insert(tgt_path.to_string(), InfoId::new(BufferedTableInfo::new(info)));
    }
    let id = map.get_mut(tgt_path).expect("entry exists");
    let index = match id.get_index(seed) {
        Some(index) => {
            if id.info.is_staged(index) {
                debug!("row {index} of [{tgt_path}] already staged for seed {seed}, skipping");
                return Ok(());
            }
            index
        }
        None => id.tail_index(id.info.table.num_records.unwrap_or(0)),
    };
    id.info.insert(tgt, record, index)?;
    id.insert(seed, index);
    Ok(())
}
