//! Explicit schema descriptors for modeled entity types.
//!
//! A descriptor is built once at registration time and handed to the record
//! store by value; nothing is derived by introspecting user types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::Payload;
use crate::error::{ErrorCode, RewindError, RewindResult};

/// Semantic type of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum FieldType {
    Text,
    Integer,
    Float,
    Boolean,
    /// RFC 3339 string.
    Timestamp,
    /// Arbitrary JSON value.
    Json,
    /// Fixed-size embedding stored as an array of numbers.
    Vector { dimension: usize },
}

impl FieldType {
    /// Whether `value` is acceptable for this type. `null` is always accepted.
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) => true,
            (FieldType::Text | FieldType::Timestamp, Value::String(_)) => true,
            (FieldType::Integer, Value::Number(n)) => n.is_i64() || n.is_u64(),
            (FieldType::Float, Value::Number(_)) => true,
            (FieldType::Boolean, Value::Bool(_)) => true,
            (FieldType::Json, _) => true,
            (FieldType::Vector { dimension }, Value::Array(items)) => {
                items.len() == *dimension && items.iter().all(Value::is_number)
            }
            _ => false,
        }
    }
}

/// How a field is indexed by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexKind {
    #[default]
    None,
    /// The logical key: identity of the entity across versions.
    Key,
    /// Secondary index on the payload field.
    Indexed,
    /// Similarity-searchable embedding.
    Vector,
}

/// One field of a schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub field_type: FieldType,
    #[serde(default)]
    pub index: IndexKind,
}

/// Ordered field list of an entity type with its logical key designation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDescriptor {
    name: String,
    fields: Vec<FieldSpec>,
    key_position: usize,
}

/// Whether `name` is a plain identifier safe to splice into SQL and JSON paths.
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl SchemaDescriptor {
    /// Start building a descriptor for the entity type `name`.
    pub fn builder(name: impl Into<String>) -> SchemaBuilder {
        SchemaBuilder {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    /// Entity type name, also the physical namespace name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Look up a field or fail with `UnknownField`.
    pub fn require_field(&self, name: &str) -> RewindResult<&FieldSpec> {
        self.field(name).ok_or_else(|| RewindError::UnknownField {
            namespace: self.name.clone(),
            field: name.to_string(),
        })
    }

    /// The logical key field.
    pub fn key_field(&self) -> &FieldSpec {
        &self.fields[self.key_position]
    }

    /// Fields indexed for similarity search.
    pub fn vector_fields(&self) -> impl Iterator<Item = &FieldSpec> {
        self.fields.iter().filter(|f| f.index == IndexKind::Vector)
    }

    /// Extract the logical key from a payload.
    pub fn logical_key(&self, payload: &Payload) -> RewindResult<String> {
        let key = self.key_field();
        match payload.get(&key.name) {
            Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
            Some(Value::Number(n)) if n.is_i64() || n.is_u64() => Ok(n.to_string()),
            Some(Value::Null) | None => Err(RewindError::validation_code(
                ErrorCode::ValMissingKey,
                format!("Payload for '{}' is missing key field '{}'", self.name, key.name),
            )),
            Some(other) => Err(RewindError::validation_code(
                ErrorCode::ValMissingKey,
                format!(
                    "Key field '{}' of '{}' must be a non-empty string or integer, got {}",
                    key.name, self.name, other
                ),
            )),
        }
    }

    /// Type-check declared fields. Undeclared fields pass through untouched.
    pub fn validate_payload(&self, payload: &Payload) -> RewindResult<()> {
        for field in &self.fields {
            if let Some(value) = payload.get(&field.name) {
                if !field.field_type.accepts(value) {
                    return Err(RewindError::validation(format!(
                        "Field '{}' of '{}' expects {:?}, got {}",
                        field.name, self.name, field.field_type, value
                    )));
                }
            }
        }
        Ok(())
    }

    /// Read the embedding stored in a vector field.
    pub fn vector_of(&self, payload: &Payload, field: &str) -> Option<Vec<f32>> {
        payload.get(field)?.as_array().map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_f64().map(|f| f as f32))
                .collect()
        })
    }
}

/// Builder for [`SchemaDescriptor`].
#[derive(Debug, Clone)]
pub struct SchemaBuilder {
    name: String,
    fields: Vec<FieldSpec>,
}

impl SchemaBuilder {
    fn push(mut self, name: impl Into<String>, field_type: FieldType, index: IndexKind) -> Self {
        self.fields.push(FieldSpec {
            name: name.into(),
            field_type,
            index,
        });
        self
    }

    /// Declare the logical key field.
    pub fn key(self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.push(name, field_type, IndexKind::Key)
    }

    /// Declare a plain field.
    pub fn field(self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.push(name, field_type, IndexKind::None)
    }

    /// Declare a field with a secondary index.
    pub fn indexed(self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.push(name, field_type, IndexKind::Indexed)
    }

    /// Declare a similarity-searchable embedding field.
    pub fn vector(self, name: impl Into<String>, dimension: usize) -> Self {
        self.push(name, FieldType::Vector { dimension }, IndexKind::Vector)
    }

    /// Validate and build the descriptor.
    pub fn build(self) -> RewindResult<SchemaDescriptor> {
        let invalid = |msg: String| RewindError::validation_code(ErrorCode::ValInvalidSchema, msg);

        if !is_identifier(&self.name) {
            return Err(invalid(format!("Invalid entity type name '{}'", self.name)));
        }

        let mut key_position = None;
        for (i, field) in self.fields.iter().enumerate() {
            if !is_identifier(&field.name) {
                return Err(invalid(format!("Invalid field name '{}'", field.name)));
            }
            if self.fields[..i].iter().any(|f| f.name == field.name) {
                return Err(invalid(format!("Duplicate field '{}'", field.name)));
            }
            match (field.index, field.field_type) {
                (IndexKind::Key, FieldType::Text | FieldType::Integer) => {
                    if key_position.replace(i).is_some() {
                        return Err(invalid(format!("'{}' declares more than one key", self.name)));
                    }
                }
                (IndexKind::Key, other) => {
                    return Err(invalid(format!(
                        "Key field '{}' must be text or integer, got {:?}",
                        field.name, other
                    )));
                }
                (_, FieldType::Vector { dimension: 0 }) => {
                    return Err(invalid(format!(
                        "Vector field '{}' has zero dimension",
                        field.name
                    )));
                }
                _ => {}
            }
        }

        let key_position = key_position
            .ok_or_else(|| invalid(format!("'{}' has no key field", self.name)))?;

        Ok(SchemaDescriptor {
            name: self.name,
            fields: self.fields,
            key_position,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn users() -> SchemaDescriptor {
        SchemaDescriptor::builder("users")
            .key("id", FieldType::Text)
            .field("name", FieldType::Text)
            .indexed("age", FieldType::Integer)
            .vector("embedding", 3)
            .build()
            .unwrap()
    }

    fn payload(value: Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_builder_designates_key() {
        let schema = users();
        assert_eq!(schema.key_field().name, "id");
        assert_eq!(schema.vector_fields().count(), 1);
        assert!(schema.require_field("nickname").is_err());
    }

    #[test]
    fn test_builder_rejects_bad_schemas() {
        assert!(SchemaDescriptor::builder("users")
            .field("name", FieldType::Text)
            .build()
            .is_err());
        assert!(SchemaDescriptor::builder("users")
            .key("id", FieldType::Text)
            .key("other", FieldType::Text)
            .build()
            .is_err());
        assert!(SchemaDescriptor::builder("drop table")
            .key("id", FieldType::Text)
            .build()
            .is_err());
        assert!(SchemaDescriptor::builder("users")
            .key("id", FieldType::Float)
            .build()
            .is_err());
    }

    #[test]
    fn test_logical_key_extraction() {
        let schema = users();
        assert_eq!(schema.logical_key(&payload(json!({"id": "u1"}))).unwrap(), "u1");
        assert_eq!(schema.logical_key(&payload(json!({"id": 42}))).unwrap(), "42");

        let err = schema.logical_key(&payload(json!({"name": "x"}))).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValMissingKey);
    }

    #[test]
    fn test_payload_validation() {
        let schema = users();
        assert!(schema
            .validate_payload(&payload(json!({"id": "u1", "age": 30, "extra": [1]})))
            .is_ok());
        assert!(schema
            .validate_payload(&payload(json!({"id": "u1", "age": "thirty"})))
            .is_err());
        assert!(schema
            .validate_payload(&payload(json!({"id": "u1", "embedding": [1.0, 2.0]})))
            .is_err());
    }
}
