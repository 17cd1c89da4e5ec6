use std::path::Path;
use std::time::UNIX_EPOCH;

use crate::error::Result;

pub const HASH_LEN: usize = 32;

/// Fingerprint of one observable version of a file: MD5 over the path and
/// mtime. The corpus is append-only by convention, so hashing content
/// would cost a full read per file and buy nothing.
pub fn file_meta_hash(path: &Path) -> Result<String> {
    let meta = std::fs::metadata(path)?;
    let nanos = meta
        .modified()?
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let mut text = String::with_capacity(512);
    text.push_str(&path.to_string_lossy());
    text.push('\n');
    text.push_str(&nanos.to_string());
    Ok(hex::encode(md5::compute(text.as_bytes()).0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::FileTime;
    use tempfile::tempdir;

    #[test]
    fn hash_is_stable_and_mtime_sensitive() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("1234.h5");
        std::fs::write(&path, b"payload").unwrap();
        let first = file_meta_hash(&path).unwrap();
        assert_eq!(first.len(), HASH_LEN);
        assert_eq!(file_meta_hash(&path).unwrap(), first);

        filetime::set_file_mtime(&path, FileTime::from_unix_time(1_700_000_000, 0)).unwrap();
        assert_ne!(file_meta_hash(&path).unwrap(), first);
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(file_meta_hash(Path::new("/no/such/file.h5")).is_err());
    }
}
