use std::collections::BTreeMap;

use bincode::{Decode, Encode};

/// Element types for datasets and table fields. Values are stored
/// little-endian; `C128` is a complex double stored as two `f64`s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub enum Dtype {
    I32,
    I64,
    U64,
    F64,
    C128,
    Bool,
    FixedStr(usize),
}

impl Dtype {
    pub fn size(&self) -> usize {
        match self {
            Dtype::I32 => 4,
            Dtype::I64 | Dtype::U64 | Dtype::F64 => 8,
            Dtype::C128 => 16,
            Dtype::Bool => 1,
            Dtype::FixedStr(n) => *n,
        }
    }
}

/// Attribute and scalar-dataset values.
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub enum Value {
    I64(i64),
    U64(u64),
    F64(f64),
    Bool(bool),
    Str(String),
}

impl Value {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::I64(v) => Some(*v),
            Value::U64(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::U64(v) => Some(*v),
            Value::I64(v) => u64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::F64(v) => Some(*v),
            Value::I64(v) => Some(*v as f64),
            Value::U64(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(v) => Some(v),
            _ => None,
        }
    }
}

pub type Attrs = BTreeMap<String, Value>;

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct Field {
    pub name: String,
    pub dtype: Dtype,
}

impl Field {
    pub fn new(name: impl Into<String>, dtype: Dtype) -> Self {
        Self { name: name.into(), dtype }
    }
}

/// Ordered field layout of one table record. Records are raw byte strings
/// of exactly `record_bytes()` bytes each.
#[derive(Debug, Clone, PartialEq, Eq, Default, Encode, Decode)]
pub struct RecordType {
    pub fields: Vec<Field>,
}

impl RecordType {
    pub fn new(fields: Vec<Field>) -> Self {
        Self { fields }
    }

    pub fn record_bytes(&self) -> usize {
        self.fields.iter().map(|f| f.dtype.size()).sum()
    }

    /// Byte offset and type of the named field.
    pub fn offset_of(&self, name: &str) -> Option<(usize, Dtype)> {
        let mut offset = 0;
        for field in &self.fields {
            if field.name == name {
                return Some((offset, field.dtype));
            }
            offset += field.dtype.size();
        }
        None
    }

    /// Keeps only the named fields, in the order given. Unknown names are
    /// silently dropped.
    pub fn project(&self, names: &[&str]) -> RecordType {
        let fields = names
            .iter()
            .filter_map(|n| self.fields.iter().find(|f| f.name == *n).cloned())
            .collect();
        RecordType { fields }
    }

    pub fn read_i64(&self, record: &[u8], name: &str) -> Option<i64> {
        let (offset, dtype) = self.offset_of(name)?;
        let bytes = record.get(offset..offset + dtype.size())?;
        match dtype {
            Dtype::I32 => Some(i64::from(i32::from_le_bytes(bytes.try_into().ok()?))),
            Dtype::I64 => Some(i64::from_le_bytes(bytes.try_into().ok()?)),
            Dtype::U64 => i64::try_from(u64::from_le_bytes(bytes.try_into().ok()?)).ok(),
            _ => None,
        }
    }

    pub fn read_u64(&self, record: &[u8], name: &str) -> Option<u64> {
        let (offset, dtype) = self.offset_of(name)?;
        let bytes = record.get(offset..offset + dtype.size())?;
        match dtype {
            Dtype::I32 => u64::try_from(i32::from_le_bytes(bytes.try_into().ok()?)).ok(),
            Dtype::I64 => u64::try_from(i64::from_le_bytes(bytes.try_into().ok()?)).ok(),
            Dtype::U64 => Some(u64::from_le_bytes(bytes.try_into().ok()?)),
            _ => None,
        }
    }

    pub fn read_f64(&self, record: &[u8], name: &str) -> Option<f64> {
        let (offset, dtype) = self.offset_of(name)?;
        let bytes = record.get(offset..offset + dtype.size())?;
        match dtype {
            Dtype::F64 => Some(f64::from_le_bytes(bytes.try_into().ok()?)),
            Dtype::I64 => Some(i64::from_le_bytes(bytes.try_into().ok()?) as f64),
            Dtype::U64 => Some(u64::from_le_bytes(bytes.try_into().ok()?) as f64),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Group,
    Dset,
    Table,
    Scalar,
    ExtLink,
}

#[derive(Debug, Clone, Encode, Decode)]
pub(crate) struct Dset {
    pub dtype: Dtype,
    pub dims: Vec<u64>,
    pub chunk: Vec<u64>,
    pub deflate: u8,
    pub raw: Vec<u8>,
    pub attrs: Attrs,
}

#[derive(Debug, Clone, Encode, Decode)]
pub(crate) struct Table {
    pub rectype: RecordType,
    pub title: String,
    pub chunk_records: u64,
    pub deflate: u8,
    pub num_records: u64,
    pub raw: Vec<u8>,
    pub attrs: Attrs,
}

#[derive(Debug, Clone, Encode, Decode)]
pub(crate) struct Scalar {
    pub value: Value,
    pub attrs: Attrs,
}

#[derive(Debug, Clone, Encode, Decode)]
pub(crate) enum Node {
    Group { children: BTreeMap<String, Node>, attrs: Attrs },
    Dset(Dset),
    Table(Table),
    Scalar(Scalar),
    ExtLink { file: String, path: String, attrs: Attrs },
}

impl Node {
    pub fn group() -> Node {
        Node::Group { children: BTreeMap::new(), attrs: Attrs::new() }
    }

    pub fn kind(&self) -> NodeKind {
        match self {
            Node::Group { .. } => NodeKind::Group,
            Node::Dset(_) => NodeKind::Dset,
            Node::Table(_) => NodeKind::Table,
            Node::Scalar(_) => NodeKind::Scalar,
            Node::ExtLink { .. } => NodeKind::ExtLink,
        }
    }

    pub fn attrs(&self) -> &Attrs {
        match self {
            Node::Group { attrs, .. } => attrs,
            Node::Dset(d) => &d.attrs,
            Node::Table(t) => &t.attrs,
            Node::Scalar(s) => &s.attrs,
            Node::ExtLink { attrs, .. } => attrs,
        }
    }

    pub fn attrs_mut(&mut self) -> &mut Attrs {
        match self {
            Node::Group { attrs, .. } => attrs,
            Node::Dset(d) => &mut d.attrs,
            Node::Table(t) => &mut t.attrs,
            Node::Scalar(s) => &mut s.attrs,
            Node::ExtLink { attrs, .. } => attrs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_type_offsets_and_sizes() {
        let rt = RecordType::new(vec![
            Field::new("iter", Dtype::U64),
            Field::new("energy", Dtype::F64),
            Field::new("tag", Dtype::FixedStr(16)),
        ]);
        assert_eq!(rt.record_bytes(), 32);
        assert_eq!(rt.offset_of("iter"), Some((0, Dtype::U64)));
        assert_eq!(rt.offset_of("energy"), Some((8, Dtype::F64)));
        assert_eq!(rt.offset_of("tag"), Some((16, Dtype::FixedStr(16))));
        assert_eq!(rt.offset_of("missing"), None);
    }

    #[test]
    fn record_type_projection_preserves_requested_order() {
        let rt = RecordType::new(vec![
            Field::new("a", Dtype::F64),
            Field::new("b", Dtype::F64),
            Field::new("c", Dtype::U64),
        ]);
        let proj = rt.project(&["c", "a", "nope"]);
        let names: Vec<_> = proj.fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, ["c", "a"]);
    }

    #[test]
    fn field_decode_coerces_integers() {
        let rt = RecordType::new(vec![
            Field::new("n", Dtype::I32),
            Field::new("x", Dtype::F64),
        ]);
        let mut rec = Vec::new();
        rec.extend_from_slice(&42i32.to_le_bytes());
        rec.extend_from_slice(&1.5f64.to_le_bytes());
        assert_eq!(rt.read_i64(&rec, "n"), Some(42));
        assert_eq!(rt.read_u64(&rec, "n"), Some(42));
        assert_eq!(rt.read_f64(&rec, "x"), Some(1.5));
        assert_eq!(rt.read_f64(&rec, "n"), None);
    }
}
