use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec error: {0}")]
    Codec(String),
    #[error("not a container file: {0}")]
    BadMagic(PathBuf),
    #[error("no such link: {0}")]
    Missing(String),
    #[error("wrong object kind at [{path}]: expected {expected}")]
    Kind { path: String, expected: &'static str },
    #[error("type mismatch at [{path}]: {detail}")]
    Type { path: String, detail: String },
    #[error("out of range at [{path}]: {detail}")]
    Range { path: String, detail: String },
    #[error("file is read-only: {0}")]
    ReadOnly(PathBuf),
}

pub type Result<T> = std::result::Result<T, StoreError>;
