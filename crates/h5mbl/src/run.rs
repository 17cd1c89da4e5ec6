use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use h5mbl_core::{merge, MergeConfig};
use tracing::info;

use crate::cli::Cli;

pub fn run(cli: Cli) -> Result<()> {
    let cfg = MergeConfig {
        src_dirs: cli.src.iter().map(PathBuf::from).collect(),
        tgt_dir: PathBuf::from(&cli.tgt),
        tgt_file: cli.name.clone(),
        model: cli.model.into(),
        require_finished: cli.finished,
        replace: cli.replace,
        use_temp: cli.temp,
        link_only: cli.link,
        max_files: cli.max_files,
        max_dirs: cli.max_dirs,
        min_seed: cli.minseed,
        max_seed: cli.maxseed,
        include: cli.inc,
        exclude: cli.exc,
    };
    let report = merge::run(&cfg).context("merge failed")?;
    let report_path = cfg.tgt_dir.join(format!("{}.report.json", cfg.tgt_file));
    fs::write(&report_path, serde_json::to_vec_pretty(&report)?)
        .with_context(|| format!("failed to write {}", report_path.display()))?;
    info!("report written to {}", report_path.display());
    Ok(())
}
