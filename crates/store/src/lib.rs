mod dset;
mod error;
mod file;
mod node;
mod table;

pub use dset::DsetInfo;
pub use error::{Result, StoreError};
pub use file::{Access, StoreFile};
pub use node::{Attrs, Dtype, Field, NodeKind, RecordType, Value};
pub use table::{TableInfo, TableSelection};
