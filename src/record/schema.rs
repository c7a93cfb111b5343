//! Global-property schema, parsed from the schema record at `#0:1`.

use std::collections::BTreeMap;

use thiserror::Error;

use super::{Document, TypeTag, Value};

/// One schemaful field declaration, referenced from record field tables
/// by its small integer id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GlobalProperty {
    pub id: u32,
    pub name: String,
    pub type_tag: TypeTag,
}

/// Cached mapping from global property id to `(name, type)`, with the
/// reverse name index used by the encoder. Replaced wholesale on refetch.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Schema {
    by_id: BTreeMap<u32, GlobalProperty>,
    by_name: BTreeMap<String, u32>,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("schema record has no globalProperties list")]
    MissingGlobalProperties,
    #[error("global property entry is malformed: {0}")]
    BadProperty(String),
    #[error("unknown property type name {0:?}")]
    UnknownTypeName(String),
}

impl Schema {
    pub fn from_properties(properties: impl IntoIterator<Item = GlobalProperty>) -> Self {
        let mut schema = Schema::default();
        for prop in properties {
            schema.by_name.insert(prop.name.clone(), prop.id);
            schema.by_id.insert(prop.id, prop);
        }
        schema
    }

    /// Parses the `globalProperties` list of the schema document: each
    /// element an embedded document carrying `id`, `name`, and `type`
    /// (textual type name; a numeric code is accepted too).
    pub fn from_document(doc: &Document) -> Result<Self, SchemaError> {
        let list = match doc.get("globalProperties") {
            Some(Value::List(items)) | Some(Value::Set(items)) => items,
            _ => return Err(SchemaError::MissingGlobalProperties),
        };

        let mut properties = Vec::with_capacity(list.len());
        for item in list {
            let Value::Embedded(entry) = item else {
                return Err(SchemaError::BadProperty(
                    "globalProperties element is not an embedded document".to_string(),
                ));
            };
            properties.push(parse_property(entry)?);
        }
        Ok(Self::from_properties(properties))
    }

    pub fn property(&self, id: u32) -> Option<&GlobalProperty> {
        self.by_id.get(&id)
    }

    pub fn id_of(&self, name: &str) -> Option<u32> {
        self.by_name.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

fn parse_property(entry: &Document) -> Result<GlobalProperty, SchemaError> {
    let id = entry
        .get("id")
        .and_then(Value::as_i64)
        .ok_or_else(|| SchemaError::BadProperty("missing or non-integer id".to_string()))?;
    let id = u32::try_from(id)
        .map_err(|_| SchemaError::BadProperty(format!("negative property id {id}")))?;

    let name = entry
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| SchemaError::BadProperty("missing name".to_string()))?
        .to_string();

    let type_tag = match entry.get("type") {
        Some(Value::String(type_name)) => TypeTag::from_name(type_name)
            .ok_or_else(|| SchemaError::UnknownTypeName(type_name.clone()))?,
        Some(other) if other.as_i64().is_some() => {
            let code = other.as_i64().unwrap_or_default();
            let code = u8::try_from(code)
                .map_err(|_| SchemaError::BadProperty(format!("type code {code} out of range")))?;
            TypeTag::from_u8(code)
                .map_err(|_| SchemaError::BadProperty(format!("unknown type code {code}")))?
        }
        _ => return Err(SchemaError::BadProperty("missing type".to_string())),
    };

    Ok(GlobalProperty { id, name, type_tag })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn property_doc(id: i32, name: &str, type_name: &str) -> Value {
        Value::Embedded(
            Document::schemaless()
                .with_field("id", Value::Int(id))
                .with_field("name", Value::String(name.to_string()))
                .with_field("type", Value::String(type_name.to_string())),
        )
    }

    #[test]
    fn parses_global_properties_list() {
        let doc = Document::schemaless().with_field(
            "globalProperties",
            Value::List(vec![
                property_doc(0, "name", "STRING"),
                property_doc(1, "size", "LONG"),
            ]),
        );
        let schema = Schema::from_document(&doc).unwrap();
        assert_eq!(schema.len(), 2);
        assert_eq!(schema.id_of("size"), Some(1));
        let prop = schema.property(0).unwrap();
        assert_eq!(prop.name, "name");
        assert_eq!(prop.type_tag, TypeTag::String);
    }

    #[test]
    fn accepts_numeric_type_codes() {
        let entry = Document::schemaless()
            .with_field("id", Value::Int(3))
            .with_field("name", Value::String("flag".to_string()))
            .with_field("type", Value::Int(0));
        let doc = Document::schemaless()
            .with_field("globalProperties", Value::List(vec![Value::Embedded(entry)]));
        let schema = Schema::from_document(&doc).unwrap();
        assert_eq!(schema.property(3).unwrap().type_tag, TypeTag::Boolean);
    }

    #[test]
    fn missing_list_is_an_error() {
        let doc = Document::schemaless().with_field("other", Value::Int(1));
        assert_eq!(
            Schema::from_document(&doc),
            Err(SchemaError::MissingGlobalProperties)
        );
    }

    #[test]
    fn unknown_type_name_is_an_error() {
        let doc = Document::schemaless().with_field(
            "globalProperties",
            Value::List(vec![property_doc(0, "x", "TIMESTAMP")]),
        );
        assert_eq!(
            Schema::from_document(&doc),
            Err(SchemaError::UnknownTypeName("TIMESTAMP".to_string()))
        );
    }
}
