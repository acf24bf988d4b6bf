mod parser;
mod registry;
mod types;

pub use parser::{parse_schema, parse_schema_str, SchemaDefinition};
pub use registry::{CollectionSchema, SchemaRegistry};
pub use types::{resolve_path, FieldDefinition, FieldList, FieldType};
