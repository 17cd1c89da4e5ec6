use std::path::PathBuf;

use h5mbl_store::{Access, StoreFile};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::Result;

/// Link-collection mode: instead of copying data, graft external links to
/// the per-directory merged files produced by a fanned-out run. Each part
/// is linked once per `<base>/<algo>` group it contains.
pub fn collect(tgt: &mut StoreFile, src_dirs: &[PathBuf], merged_name: &str) -> Result<usize> {
    let tgt_path = tgt.path().to_path_buf();
    let mut linked = 0;
    for root in src_dirs {
        for entry in WalkDir::new(root).follow_links(true).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            if entry.file_name().to_string_lossy() != merged_name {
                continue;
            }
            let part_path = entry.path();
            if part_path == tgt_path {
                continue;
            }
            let part = match StoreFile::open(part_path, Access::ReadOnly) {
                Ok(part) => part,
                Err(err) => {
                    warn!("skipping unreadable part {}: {err}", part_path.display());
                    continue;
                }
            };
            // Every `<base>/<algo>/model` group marks one linkable
            // parameter point inside the part.
            for model_group in part.find_groups("model", "", -1, -1) {
                let Some(link_path) = model_group.strip_suffix("/model") else {
                    continue;
                };
                if tgt.link_exists(link_path) {
                    debug!("[{link_path}] already linked, skipping");
                    continue;
                }
                tgt.create_ext_link(
                    link_path,
                    &part_path.to_string_lossy(),
                    &format!("/{link_path}"),
                )?;
                linked += 1;
            }
        }
    }
    info!("collected {linked} external links into {}", tgt_path.display());
    Ok(linked)
}
