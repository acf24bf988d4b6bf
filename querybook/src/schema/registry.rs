use super::parser::parse_schema_str;
use super::types::{resolve_path, FieldDefinition, FieldList, FieldType};
use crate::error::{QueryBookError, Result};
use std::collections::HashMap;

/// The declared shape of one collection.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionSchema {
    pub name: String,
    pub fields: FieldList,
}

impl CollectionSchema {
    pub fn new(name: impl Into<String>) -> Self {
        CollectionSchema {
            name: name.into(),
            fields: FieldList::new(),
        }
    }

    /// Builder-style field declaration; field names must be unique.
    pub fn field(self, name: &str, field_type: FieldType) -> Result<Self> {
        self.with(FieldDefinition::new(name, field_type))
    }

    pub fn nullable_field(self, name: &str, field_type: FieldType) -> Result<Self> {
        self.with(FieldDefinition::new(name, field_type).nullable())
    }

    fn with(mut self, field: FieldDefinition) -> Result<Self> {
        self.fields
            .push(field)
            .map_err(|field| QueryBookError::DuplicateField {
                collection: self.name.clone(),
                field,
            })?;
        Ok(self)
    }
}

/// Process-wide, read-only set of collection schemas.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: Vec<CollectionSchema>,
    index: HashMap<String, usize>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from schema YAML (`collections:` mapping).
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        parse_schema_str(content)?.into_registry()
    }

    pub fn register(&mut self, schema: CollectionSchema) -> Result<()> {
        if self.index.contains_key(&schema.name) {
            return Err(QueryBookError::DuplicateSchema(schema.name));
        }
        log::debug!(
            "Registered collection '{}' ({} fields)",
            schema.name,
            schema.fields.len()
        );
        self.index.insert(schema.name.clone(), self.schemas.len());
        self.schemas.push(schema);
        Ok(())
    }

    pub fn get(&self, collection: &str) -> Option<&CollectionSchema> {
        self.index.get(collection).map(|&i| &self.schemas[i])
    }

    pub fn contains(&self, collection: &str) -> bool {
        self.index.contains_key(collection)
    }

    /// Collections in registration order.
    pub fn collections(&self) -> impl Iterator<Item = &CollectionSchema> {
        self.schemas.iter()
    }

    pub fn schema(&self, collection: &str) -> Result<&CollectionSchema> {
        self.get(collection)
            .ok_or_else(|| QueryBookError::UnknownCollection(collection.to_string()))
    }

    /// Resolve a dotted field path in a collection to its declared type.
    pub fn resolve_field(&self, collection: &str, path: &str) -> Result<&FieldType> {
        let schema = self.schema(collection)?;
        resolve_path(&schema.fields, path).map_err(|_| QueryBookError::UnknownField {
            collection: collection.to_string(),
            path: path.to_string(),
        })
    }
}
