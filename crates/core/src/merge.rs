use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use h5mbl_store::{Access, StoreFile, Value};
use regex::Regex;
use serde::Serialize;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::db::{file_id_status, SrcDb, TgtDb};
use crate::error::{MergeError, Result};
use crate::hash::file_meta_hash;
use crate::id::{FileId, FileIdStatus, FileStats, PathId};
use crate::keys::{KeySet, ModelKind};
use crate::link;
use crate::model;
use crate::pathcache::PathCache;
use crate::seed::seed_from_filename;
use crate::transfer;

#[derive(Debug, Clone)]
pub struct MergeConfig {
    pub src_dirs: Vec<PathBuf>,
    pub tgt_dir: PathBuf,
    pub tgt_file: String,
    pub model: ModelKind,
    pub require_finished: bool,
    pub replace: bool,
    pub use_temp: bool,
    pub link_only: bool,
    pub max_files: Option<u64>,
    pub max_dirs: Option<u64>,
    pub min_seed: Option<i64>,
    pub max_seed: Option<i64>,
    pub include: Option<String>,
    pub exclude: Option<String>,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            src_dirs: Vec::new(),
            tgt_dir: PathBuf::from("."),
            tgt_file: "merged.h5".to_string(),
            model: ModelKind::Sdual,
            require_finished: false,
            replace: false,
            use_temp: false,
            link_only: false,
            max_files: None,
            max_dirs: None,
            min_seed: None,
            max_seed: None,
            include: None,
            exclude: None,
        }
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct MergeReport {
    pub target: String,
    pub files_seen: u64,
    pub files_merged: u64,
    pub files_uptodate: u64,
    pub files_skipped: u64,
    pub files_failed: u64,
    pub sets: u64,
    pub bytes: u64,
    pub seconds: f64,
    pub links: u64,
}

/// Moves the staged target into place exactly once, on success or while
/// unwinding from a fatal error.
struct TempTarget {
    work: PathBuf,
    dest: PathBuf,
    done: bool,
}

impl TempTarget {
    fn finalize(&mut self) -> std::io::Result<()> {
        if self.done {
            return Ok(());
        }
        self.done = true;
        if !self.work.exists() {
            return Ok(());
        }
        if let Some(parent) = self.dest.parent() {
            fs::create_dir_all(parent)?;
        }
        match fs::rename(&self.work, &self.dest) {
            Ok(()) => Ok(()),
            // Cross-device staging falls back to copy and remove.
            Err(_) => {
                fs::copy(&self.work, &self.dest)?;
                fs::remove_file(&self.work)
            }
        }
    }
}

impl Drop for TempTarget {
    fn drop(&mut self) {
        if let Err(err) = self.finalize() {
            warn!(
                "failed to move staged target {} into {}: {err}",
                self.work.display(),
                self.dest.display()
            );
        }
    }
}

/// Resolves each requested source root: existing directories are taken as
/// given, anything else is treated as a glob-like prefix.
fn resolve_sources(dirs: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for dir in dirs {
        if dir.is_dir() {
            out.push(fs::canonicalize(dir)?);
            continue;
        }
        let pattern = format!("{}*", dir.display());
        let hits: Vec<PathBuf> = glob::glob(&pattern)
            .map_err(|_| MergeError::BadSource(dir.display().to_string()))?
            .filter_map(|entry| entry.ok())
            .filter(|p| p.is_dir())
            .collect();
        if hits.is_empty() {
            return Err(MergeError::BadSource(dir.display().to_string()));
        }
        for hit in hits {
            out.push(fs::canonicalize(hit)?);
        }
    }
    out.sort();
    out.dedup();
    Ok(out)
}

/// All `.h5` regular files below the source roots, sorted by path. When
/// roots nest, a file is attributed to its longest (deepest) root.
fn collect_files(src_dirs: &[PathBuf]) -> BTreeMap<PathBuf, PathBuf> {
    let mut files: BTreeMap<PathBuf, PathBuf> = BTreeMap::new();
    for root in src_dirs {
        for entry in WalkDir::new(root).follow_links(true).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("h5") {
                continue;
            }
            let abs = path.to_path_buf();
            match files.get(&abs) {
                Some(prev) if prev.as_os_str().len() >= root.as_os_str().len() => {}
                _ => {
                    files.insert(abs, root.clone());
                }
            }
        }
    }
    files
}

pub fn run(cfg: &MergeConfig) -> Result<MergeReport> {
    let started = Instant::now();
    let include = cfg.include.as_deref().map(Regex::new).transpose()?;
    let exclude = cfg.exclude.as_deref().map(Regex::new).transpose()?;
    let src_dirs = resolve_sources(&cfg.src_dirs)?;
    if src_dirs.is_empty() {
        return Err(MergeError::BadSource("no source roots given".to_string()));
    }
    let keyset = KeySet::for_model(cfg.model);

    fs::create_dir_all(&cfg.tgt_dir)?;
    let dest_path = cfg.tgt_dir.join(&cfg.tgt_file);
    let mut staging: Option<TempTarget> = None;
    let work_path = if cfg.use_temp {
        let work_dir = std::env::temp_dir().join(format!("h5mbl-{}", std::process::id()));
        fs::create_dir_all(&work_dir)?;
        let work = work_dir.join(&cfg.tgt_file);
        if dest_path.exists() && !cfg.replace {
            fs::copy(&dest_path, &work)?;
        }
        staging = Some(TempTarget { work: work.clone(), dest: dest_path.clone(), done: false });
        work
    } else {
        dest_path.clone()
    };
    let access = if cfg.replace { Access::Replace } else { Access::ReadWrite };
    info!("opening target {}", work_path.display());
    let mut tgt = StoreFile::open(&work_path, access)?;
    tgt.set_compression(4);

    let mut report = MergeReport { target: dest_path.display().to_string(), ..Default::default() };

    if cfg.link_only {
        report.links = link::collect(&mut tgt, &src_dirs, &cfg.tgt_file)? as u64;
        tgt.flush()?;
        drop(tgt);
        if let Some(mut staging) = staging {
            staging.finalize()?;
        }
        report.seconds = started.elapsed().as_secs_f64();
        return Ok(report);
    }

    let mut tgtdb = TgtDb::load(&tgt)?;
    let mut srcdb = SrcDb::default();
    let mut cache = PathCache::default();

    let files = collect_files(&src_dirs);
    info!("found {} source files under {} roots", files.len(), src_dirs.len());

    let mut stats = FileStats::default();
    let mut set_started = Instant::now();
    let mut sets_done: u64 = 0;
    let mut dir_cap_reached = false;

    for (abs, _root) in &files {
        report.files_seen += 1;
        let parent = abs.parent().unwrap_or_else(|| Path::new("")).to_path_buf();

        // A new parent directory means a new parameter set: persist
        // everything, log progress and drop the per-set caches. This is
        // what keeps memory bounded over 10^6 files.
        if srcdb.parent.as_deref() != Some(parent.as_path()) {
            if srcdb.parent.is_some() {
                stats.elaps = set_started.elapsed().as_secs_f64();
                log_set(&srcdb, &stats);
                tgtdb.persist(&mut tgt)?;
                sets_done += 1;
                if cfg.max_dirs.is_some_and(|max| sets_done >= max) {
                    info!("parameter-set cap reached after {sets_done} sets");
                    dir_cap_reached = true;
                    break;
                }
            }
            srcdb.reset(parent.clone());
            report.sets += 1;
            stats = FileStats::default();
            set_started = Instant::now();
        }
        stats.files += 1;

        let fname = abs.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
        let Some(seed) = seed_from_filename(&fname) else {
            warn!("no seed in filename [{fname}], skipping");
            report.files_skipped += 1;
            continue;
        };
        // Out-of-range seeds leave no trace, not even in the file db.
        if cfg.min_seed.is_some_and(|min| seed < min) || cfg.max_seed.is_some_and(|max| seed > max)
        {
            report.files_skipped += 1;
            continue;
        }
        let path_str = abs.to_string_lossy();
        if include.as_ref().is_some_and(|re| !re.is_match(&path_str)) {
            report.files_skipped += 1;
            continue;
        }
        if exclude.as_ref().is_some_and(|re| re.is_match(&path_str)) {
            report.files_skipped += 1;
            continue;
        }
        if cfg.max_files.is_some_and(|max| stats.count >= max) {
            debug!("file cap reached for this parameter set");
            report.files_skipped += 1;
            continue;
        }

        let hash = match file_meta_hash(abs) {
            Ok(hash) => hash,
            Err(err) => {
                warn!("cannot fingerprint {}: {err}", abs.display());
                report.files_skipped += 1;
                continue;
            }
        };
        let file_id = FileId::new(seed, path_str.clone(), hash);
        match file_id_status(&tgtdb.file, &file_id)? {
            FileIdStatus::UpToDate => {
                debug!("{} is up to date", abs.display());
                report.files_uptodate += 1;
                continue;
            }
            FileIdStatus::Stale => info!("{} is stale, re-merging seed {seed}", abs.display()),
            FileIdStatus::Missing => {}
        }

        let src = match StoreFile::open(abs, Access::ReadOnly) {
            Ok(src) => src,
            Err(err) => {
                warn!("skipping broken file {}: {err}", abs.display());
                report.files_skipped += 1;
                continue;
            }
        };
        match src.read_scalar("common/finished_all") {
            Ok(Value::Bool(done)) => {
                if cfg.require_finished && !done {
                    debug!("{} is not finished, skipping", abs.display());
                    report.files_skipped += 1;
                    continue;
                }
            }
            _ => {
                debug!("{} lacks common/finished_all, skipping", abs.display());
                report.files_skipped += 1;
                continue;
            }
        }

        match merge_file(&mut tgt, &mut tgtdb, &src, &mut srcdb, &mut cache, &keyset, &file_id) {
            Ok(()) => {
                let bytes = fs::metadata(abs).map(|m| m.len()).unwrap_or(0);
                stats.count += 1;
                stats.bytes += bytes;
                report.files_merged += 1;
                report.bytes += bytes;
            }
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                warn!("failed to merge {}: {err}", abs.display());
                report.files_failed += 1;
            }
        }
    }

    if srcdb.parent.is_some() && !dir_cap_reached {
        stats.elaps = set_started.elapsed().as_secs_f64();
        log_set(&srcdb, &stats);
    }
    tgtdb.persist(&mut tgt)?;
    tgt.flush()?;
    drop(tgt);
    if let Some(mut staging) = staging {
        staging.finalize()?;
    }
    report.seconds = started.elapsed().as_secs_f64();
    info!(
        "merged {} of {} files into {} ({} up to date, {} skipped, {} failed) in {:.2}s",
        report.files_merged,
        report.files_seen,
        report.target,
        report.files_uptodate,
        report.files_skipped,
        report.files_failed,
        report.seconds
    );
    Ok(report)
}

fn log_set(srcdb: &SrcDb, stats: &FileStats) {
    let parent = srcdb
        .parent
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_default();
    info!(
        "[{parent}] merged {}/{} files, {} bytes in {:.2}s ({:.1} files/s)",
        stats.count,
        stats.files,
        stats.bytes,
        stats.elaps,
        stats.rate()
    );
}

/// One source file through the whole pipeline: model, then every matching
/// `<algo>/<state>/<point>` group through the four transfer categories.
/// Each category owns its error boundary; only logic and consistency
/// errors escape.
fn merge_file(
    tgt: &mut StoreFile,
    tgtdb: &mut TgtDb,
    src: &StoreFile,
    srcdb: &mut SrcDb,
    cache: &mut PathCache,
    keyset: &KeySet,
    file_id: &FileId,
) -> Result<()> {
    let algo_patterns = keyset.algo_patterns();
    let state_patterns = keyset.state_patterns();
    let point_patterns = keyset.point_patterns();

    for algo in cache.find_keys(src, "", &algo_patterns, -1, 0) {
        let mut base = None;
        for model_key in keyset.model_keys_for(&algo) {
            match model::load_model(src, &mut srcdb.model, keyset.kind, model_key, &algo) {
                Ok(Some(cache_key)) => {
                    let model = srcdb.model.get(&cache_key).expect("just loaded").clone();
                    model::save_model(tgt, &mut tgtdb.model, &model, file_id)?;
                    base = Some(model.basepath);
                }
                Ok(None) => {
                    warn!("no hamiltonian under [{algo}] in {}", file_id.path);
                }
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => warn!("model transfer failed under [{algo}]: {err}"),
            }
        }
        let Some(base) = base else { continue };

        for state in cache.find_keys(src, &algo, &state_patterns, -1, 0) {
            let state_root = format!("{algo}/{state}");
            for point in cache.find_keys(src, &state_root, &point_patterns, -1, 0) {
                let pathid = PathId::new(&base, &algo, &state, &point);
                let classified = keyset.classify(&pathid);

                if !classified.dsets.is_empty() {
                    let gathered = transfer::gather_dsets(src, srcdb, &pathid, &classified.dsets);
                    boundary(
                        transfer::transfer_dsets(
                            tgt, &mut tgtdb.dset, src, srcdb, &pathid, &gathered, file_id,
                        ),
                        "dset",
                        &pathid,
                    )?;
                }
                if !classified.tables.is_empty() {
                    let gathered = transfer::gather_tables(src, srcdb, &pathid, &classified.tables);
                    boundary(
                        transfer::transfer_tables(
                            tgt, &mut tgtdb.table, src, srcdb, &pathid, &gathered, file_id,
                        ),
                        "table",
                        &pathid,
                    )?;
                }
                if !classified.cronos.is_empty() {
                    let gathered = transfer::gather_cronos(src, srcdb, &pathid, &classified.cronos);
                    boundary(
                        transfer::transfer_cronos(
                            tgt, &mut tgtdb.crono, src, srcdb, &pathid, &gathered, file_id,
                        ),
                        "crono",
                        &pathid,
                    )?;
                }
                if !classified.scales.is_empty() {
                    let gathered =
                        transfer::gather_scales(src, srcdb, cache, &pathid, &classified.scales);
                    boundary(
                        transfer::transfer_scales(
                            tgt, &mut tgtdb.scale, src, srcdb, &pathid, &gathered, file_id,
                        ),
                        "scale",
                        &pathid,
                    )?;
                }
            }
        }
    }
    tgtdb.file.insert(file_id.path.clone(), file_id.clone());
    Ok(())
}

/// Demotes a category failure to a warning so the remaining categories of
/// the same file still run. Logic and consistency errors stay fatal.
fn boundary(result: Result<()>, what: &str, pathid: &PathId) -> Result<()> {
    match result {
        Err(err) if err.is_fatal() => Err(err),
        Err(err) => {
            warn!("{what} transfer failed under [{}]: {err}", pathid.src_path);
            Ok(())
        }
        Ok(()) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_source_root_is_fatal() {
        let err = resolve_sources(&[PathBuf::from("/definitely/not/here")]).unwrap_err();
        assert!(matches!(err, MergeError::BadSource(_)));
    }

    #[test]
    fn nested_roots_attribute_files_to_the_deepest() {
        let dir = tempfile::tempdir().unwrap();
        let outer = dir.path().join("corpus");
        let inner = outer.join("L16");
        fs::create_dir_all(&inner).unwrap();
        fs::write(inner.join("100.h5"), b"x").unwrap();
        let files = collect_files(&[outer.clone(), inner.clone()]);
        assert_eq!(files.len(), 1);
        assert_eq!(files.values().next().unwrap(), &inner);
    }
}
