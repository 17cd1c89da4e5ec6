use std::collections::HashMap;

use h5mbl_store::StoreFile;
use tracing::trace;

use crate::id::component_matches;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    root: String,
    pattern: String,
    max_hits: i64,
    depth: i64,
}

/// Memoizes group-pattern lookups across the thousands of source files
/// that share one directory layout. Entries never expire: the filesystem
/// and file layouts are not mutated during a run.
#[derive(Debug, Default)]
pub struct PathCache {
    cache: HashMap<CacheKey, Vec<String>>,
}

impl PathCache {
    /// Concrete group paths under `root` matching any of `patterns`,
    /// deduplicated in first-seen order. An empty pattern contributes the
    /// empty-string sentinel. A cached result is reused when it already
    /// satisfies the requested `max_hits` (any nonempty result, for
    /// unbounded searches); otherwise the file is queried again and the
    /// entry replaced.
    pub fn find_keys(
        &mut self,
        file: &StoreFile,
        root: &str,
        patterns: &[String],
        max_hits: i64,
        depth: i64,
    ) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for pattern in patterns {
            if pattern.is_empty() {
                push_unique(&mut out, String::new());
                continue;
            }
            let key = CacheKey {
                root: root.to_string(),
                pattern: pattern.clone(),
                max_hits,
                depth,
            };
            let reusable = self.cache.get(&key).filter(|hits| {
                if max_hits > 0 {
                    hits.len() as i64 >= max_hits
                } else {
                    !hits.is_empty()
                }
            });
            let hits = match reusable {
                Some(hits) => hits.clone(),
                None => {
                    let hits = query(file, root, pattern, max_hits, depth);
                    trace!("find_keys [{root}] [{pattern}] -> {hits:?}");
                    self.cache.insert(key, hits.clone());
                    hits
                }
            };
            for hit in hits {
                push_unique(&mut out, hit);
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

/// Single-component patterns go straight to the store. Patterns with a
/// `/` are path fragments like `checkpoint/iter_*`: the search descends
/// to the fragment's depth and every component must match.
fn query(file: &StoreFile, root: &str, pattern: &str, max_hits: i64, depth: i64) -> Vec<String> {
    if !pattern.contains('/') {
        return file.find_groups(pattern, root, max_hits, depth);
    }
    let comps: Vec<&str> = pattern.split('/').filter(|c| !c.is_empty()).collect();
    let Some(last) = comps.last() else { return Vec::new() };
    let frag_depth = comps.len() as i64 - 1;
    let search_depth = if depth < 0 { -1 } else { depth + frag_depth };
    let mut hits = Vec::new();
    for rel in file.find_groups(last, root, -1, search_depth) {
        let rel_comps: Vec<&str> = rel.split('/').collect();
        if rel_comps.len() < comps.len() {
            continue;
        }
        let tail = &rel_comps[rel_comps.len() - comps.len()..];
        if tail
            .iter()
            .zip(&comps)
            .all(|(comp, pat)| component_matches(comp, pat))
        {
            hits.push(rel);
            if max_hits > 0 && hits.len() as i64 >= max_hits {
                break;
            }
        }
    }
    hits
}

fn push_unique(out: &mut Vec<String>, item: String) {
    if !out.contains(&item) {
        out.push(item);
    }
}
