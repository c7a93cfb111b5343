//! Documents, typed field values, and the binary record serializer.

mod schema;
mod serializer;

pub use schema::{GlobalProperty, Schema, SchemaError};
pub use serializer::{SERIALIZER_VERSION, decode_record, encode_record};

use std::fmt;

use thiserror::Error;

/// Record identifier: physical cluster plus position within it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Rid {
    pub cluster: i16,
    pub position: i64,
}

impl Rid {
    pub const fn new(cluster: i16, position: i64) -> Self {
        Self { cluster, position }
    }
}

impl fmt::Display for Rid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}:{}", self.cluster, self.position)
    }
}

/// Arbitrary-precision decimal as it travels on the wire: a scale and a
/// big-endian two's-complement magnitude.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Decimal {
    pub scale: i32,
    pub magnitude: Vec<u8>,
}

/// A typed field value. Closed union: the exhaustive list of wire type
/// codes stays auditable in one place ([`TypeTag`]).
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Decimal(Decimal),
    String(String),
    Bytes(Vec<u8>),
    Embedded(Document),
    List(Vec<Value>),
    Set(Vec<Value>),
    Map(Vec<(String, Value)>),
    Link(Rid),
    LinkList(Vec<Rid>),
    LinkSet(Vec<Rid>),
    LinkMap(Vec<(String, Rid)>),
    /// Milliseconds since the Unix epoch.
    DateTime(i64),
    /// Days since the Unix epoch (one day is 86_400_000 ms on the wire).
    Date(i64),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Byte(v) => Some(i64::from(*v)),
            Value::Short(v) => Some(i64::from(*v)),
            Value::Int(v) => Some(i64::from(*v)),
            Value::Long(v) => Some(*v),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

/// A document: class name (possibly empty for schemaless records) and an
/// ordered field list. Field order is the caller's insertion order and is
/// preserved across a serialize/deserialize round trip.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Document {
    class: String,
    fields: Vec<(String, Value)>,
}

impl Document {
    pub fn new(class: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            fields: Vec::new(),
        }
    }

    pub fn schemaless() -> Self {
        Self::default()
    }

    pub fn class(&self) -> &str {
        &self.class
    }

    pub fn with_field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.set(name, value);
        self
    }

    /// Sets a field, replacing an existing value in place (order kept).
    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        if let Some(slot) = self.fields.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = value;
        } else {
            self.fields.push((name, value));
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Wire type codes, stable with the OrientDB binary serializer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum TypeTag {
    Boolean = 0,
    Integer = 1,
    Short = 2,
    Long = 3,
    Float = 4,
    Double = 5,
    DateTime = 6,
    String = 7,
    Binary = 8,
    Embedded = 9,
    EmbeddedList = 10,
    EmbeddedSet = 11,
    EmbeddedMap = 12,
    Link = 13,
    LinkList = 14,
    LinkSet = 15,
    LinkMap = 16,
    Byte = 17,
    Date = 19,
    Decimal = 21,
    /// Placeholder tag; inside collections it marks a null element.
    Any = 23,
}

impl TypeTag {
    pub fn from_u8(code: u8) -> Result<Self, RecordError> {
        Ok(match code {
            0 => TypeTag::Boolean,
            1 => TypeTag::Integer,
            2 => TypeTag::Short,
            3 => TypeTag::Long,
            4 => TypeTag::Float,
            5 => TypeTag::Double,
            6 => TypeTag::DateTime,
            7 => TypeTag::String,
            8 => TypeTag::Binary,
            9 => TypeTag::Embedded,
            10 => TypeTag::EmbeddedList,
            11 => TypeTag::EmbeddedSet,
            12 => TypeTag::EmbeddedMap,
            13 => TypeTag::Link,
            14 => TypeTag::LinkList,
            15 => TypeTag::LinkSet,
            16 => TypeTag::LinkMap,
            17 => TypeTag::Byte,
            19 => TypeTag::Date,
            21 => TypeTag::Decimal,
            23 => TypeTag::Any,
            other => return Err(RecordError::UnknownTypeCode(other)),
        })
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Parses the textual type name used by the schema record.
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "BOOLEAN" => TypeTag::Boolean,
            "INTEGER" => TypeTag::Integer,
            "SHORT" => TypeTag::Short,
            "LONG" => TypeTag::Long,
            "FLOAT" => TypeTag::Float,
            "DOUBLE" => TypeTag::Double,
            "DATETIME" => TypeTag::DateTime,
            "STRING" => TypeTag::String,
            "BINARY" => TypeTag::Binary,
            "EMBEDDED" => TypeTag::Embedded,
            "EMBEDDEDLIST" => TypeTag::EmbeddedList,
            "EMBEDDEDSET" => TypeTag::EmbeddedSet,
            "EMBEDDEDMAP" => TypeTag::EmbeddedMap,
            "LINK" => TypeTag::Link,
            "LINKLIST" => TypeTag::LinkList,
            "LINKSET" => TypeTag::LinkSet,
            "LINKMAP" => TypeTag::LinkMap,
            "BYTE" => TypeTag::Byte,
            "DATE" => TypeTag::Date,
            "DECIMAL" => TypeTag::Decimal,
            "ANY" => TypeTag::Any,
            _ => return None,
        })
    }

    pub fn for_value(value: &Value) -> Self {
        match value {
            Value::Null => TypeTag::Any,
            Value::Bool(_) => TypeTag::Boolean,
            Value::Byte(_) => TypeTag::Byte,
            Value::Short(_) => TypeTag::Short,
            Value::Int(_) => TypeTag::Integer,
            Value::Long(_) => TypeTag::Long,
            Value::Float(_) => TypeTag::Float,
            Value::Double(_) => TypeTag::Double,
            Value::Decimal(_) => TypeTag::Decimal,
            Value::String(_) => TypeTag::String,
            Value::Bytes(_) => TypeTag::Binary,
            Value::Embedded(_) => TypeTag::Embedded,
            Value::List(_) => TypeTag::EmbeddedList,
            Value::Set(_) => TypeTag::EmbeddedSet,
            Value::Map(_) => TypeTag::EmbeddedMap,
            Value::Link(_) => TypeTag::Link,
            Value::LinkList(_) => TypeTag::LinkList,
            Value::LinkSet(_) => TypeTag::LinkSet,
            Value::LinkMap(_) => TypeTag::LinkMap,
            Value::DateTime(_) => TypeTag::DateTime,
            Value::Date(_) => TypeTag::Date,
        }
    }
}

/// Record payload codec failures. `UnknownPropertyId` is retryable after
/// a schema refetch; the rest mean the payload is unusable.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("record payload truncated")]
    Truncated,
    #[error("unsupported serializer version {0}")]
    UnsupportedVersion(u8),
    #[error("unknown global property id {0}")]
    UnknownPropertyId(u32),
    #[error("unknown type code {0}")]
    UnknownTypeCode(u8),
    #[error("malformed record: {0}")]
    Malformed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rid_display() {
        assert_eq!(Rid::new(9, 0).to_string(), "#9:0");
        assert_eq!(Rid::new(-2, 17).to_string(), "#-2:17");
    }

    #[test]
    fn document_set_replaces_in_place() {
        let mut doc = Document::new("Ticket");
        doc.set("a", Value::Int(1));
        doc.set("b", Value::Int(2));
        doc.set("a", Value::Int(3));
        let order: Vec<&str> = doc.fields().map(|(n, _)| n).collect();
        assert_eq!(order, ["a", "b"]);
        assert_eq!(doc.get("a"), Some(&Value::Int(3)));
    }

    #[test]
    fn type_tags_roundtrip_through_codes() {
        for code in [0u8, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 19, 21, 23] {
            let tag = TypeTag::from_u8(code).unwrap();
            assert_eq!(tag.as_u8(), code);
        }
        assert_eq!(TypeTag::from_u8(18), Err(RecordError::UnknownTypeCode(18)));
        assert_eq!(TypeTag::from_u8(42), Err(RecordError::UnknownTypeCode(42)));
    }

    #[test]
    fn type_names_map_to_tags() {
        assert_eq!(TypeTag::from_name("STRING"), Some(TypeTag::String));
        assert_eq!(TypeTag::from_name("LINKMAP"), Some(TypeTag::LinkMap));
        assert_eq!(TypeTag::from_name("TIMESTAMP"), None);
    }
}
