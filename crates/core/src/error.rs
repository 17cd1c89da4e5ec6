use thiserror::Error;

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Store(#[from] h5mbl_store::StoreError),
    #[error("logic error: {0}")]
    Logic(String),
    #[error("inconsistent file database entry: {0}")]
    Inconsistent(String),
    #[error("invalid filter pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error("no readable source root: {0}")]
    BadSource(String),
}

impl MergeError {
    /// Fatal conditions unwind past the merge driver; everything else is
    /// caught at a category or file boundary and logged.
    pub fn is_fatal(&self) -> bool {
        matches!(self, MergeError::Logic(_) | MergeError::Inconsistent(_))
    }
}

pub type Result<T> = std::result::Result<T, MergeError>;
