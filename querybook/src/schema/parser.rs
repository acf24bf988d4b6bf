use super::registry::{CollectionSchema, SchemaRegistry};
use super::types::FieldList;
use crate::error::{QueryBookError, Result};
use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer};
use std::fmt;
use std::path::Path;

/// Top-level schema file, parsed from schema.yaml
#[derive(Debug, Clone, Deserialize)]
pub struct SchemaDefinition {
    #[serde(default, deserialize_with = "ordered_collections")]
    pub collections: Vec<CollectionSchema>,
}

#[derive(Deserialize)]
struct CollectionBody {
    #[serde(default)]
    fields: FieldList,
}

fn ordered_collections<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Vec<CollectionSchema>, D::Error> {
    struct CollectionsVisitor;

    impl<'de> Visitor<'de> for CollectionsVisitor {
        type Value = Vec<CollectionSchema>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a mapping of collection name to collection definition")
        }

        fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> std::result::Result<Self::Value, A::Error> {
            let mut collections = Vec::new();
            while let Some((name, body)) = access.next_entry::<String, CollectionBody>()? {
                collections.push(CollectionSchema {
                    name,
                    fields: body.fields,
                });
            }
            Ok(collections)
        }
    }

    deserializer.deserialize_map(CollectionsVisitor)
}

/// Parse a schema.yaml file into a SchemaDefinition
pub fn parse_schema(path: &Path) -> Result<SchemaDefinition> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        QueryBookError::Schema(format!("cannot read {}: {e}", path.display()))
    })?;
    parse_schema_str(&content)
}

/// Parse a schema YAML string into a SchemaDefinition
pub fn parse_schema_str(content: &str) -> Result<SchemaDefinition> {
    let schema: SchemaDefinition = serde_yaml::from_str(content)?;
    Ok(schema)
}

impl SchemaDefinition {
    /// Register every collection in declaration order.
    pub fn into_registry(self) -> Result<SchemaRegistry> {
        let mut registry = SchemaRegistry::new();
        for collection in self.collections {
            registry.register(collection)?;
        }
        Ok(registry)
    }
}
