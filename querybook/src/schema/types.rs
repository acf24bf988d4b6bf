use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Field type tag. Nested objects and lists carry their own definitions so
/// dotted paths can be resolved segment by segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldType {
    String,
    Number,
    Integer,
    /// Fixed-point money: arithmetic over it runs on scaled integers
    Currency,
    Boolean,
    Date,
    ObjectId,
    Object {
        #[serde(default)]
        fields: FieldList,
    },
    List {
        items: Box<FieldType>,
    },
    /// Shape unknown; every sub-path resolves
    Any,
}

impl FieldType {
    pub fn type_name(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Number => "number",
            FieldType::Integer => "integer",
            FieldType::Currency => "currency",
            FieldType::Boolean => "boolean",
            FieldType::Date => "date",
            FieldType::ObjectId => "object_id",
            FieldType::Object { .. } => "object",
            FieldType::List { .. } => "list",
            FieldType::Any => "any",
        }
    }

    pub fn is_currency(&self) -> bool {
        matches!(self, FieldType::Currency)
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            FieldType::Number | FieldType::Integer | FieldType::Currency
        )
    }

    pub fn object(fields: FieldList) -> Self {
        FieldType::Object { fields }
    }

    pub fn list_of(items: FieldType) -> Self {
        FieldType::List {
            items: Box::new(items),
        }
    }
}

/// A named field with its type and nullability.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDefinition {
    pub name: String,
    pub field_type: FieldType,
    pub nullable: bool,
}

impl FieldDefinition {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        FieldDefinition {
            name: name.into(),
            field_type,
            nullable: false,
        }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }
}

/// The YAML form of a field body: `{ type: ..., nullable: ... }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct FieldBody {
    #[serde(flatten)]
    field_type: FieldType,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    nullable: bool,
}

/// Ordered field set. Declaration order is kept because it drives column
/// order in reports; names are unique.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldList(Vec<FieldDefinition>);

impl FieldList {
    pub fn new() -> Self {
        FieldList(Vec::new())
    }

    /// Append a field. Returns the rejected name on a duplicate.
    pub fn push(&mut self, field: FieldDefinition) -> std::result::Result<(), String> {
        if self.get(&field.name).is_some() {
            return Err(field.name);
        }
        self.0.push(field);
        Ok(())
    }

    /// Insert or replace a top-level field, keeping its position if present.
    pub fn upsert(&mut self, field: FieldDefinition) {
        match self.0.iter_mut().find(|f| f.name == field.name) {
            Some(existing) => *existing = field,
            None => self.0.push(field),
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<FieldDefinition> {
        let pos = self.0.iter().position(|f| f.name == name)?;
        Some(self.0.remove(pos))
    }

    pub fn get(&self, name: &str) -> Option<&FieldDefinition> {
        self.0.iter().find(|f| f.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FieldDefinition> {
        self.0.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|f| f.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Set the type at a dotted path, creating intermediate objects. Used to
    /// build reshaped documents (`$project`, `$group`, `$addFields`).
    pub fn insert_path(&mut self, path: &str, field_type: FieldType) {
        match path.split_once('.') {
            None => self.upsert(FieldDefinition::new(path, field_type)),
            Some((head, rest)) => {
                let mut nested = match self.get(head).map(|f| &f.field_type) {
                    Some(FieldType::Object { fields }) => fields.clone(),
                    _ => FieldList::new(),
                };
                nested.insert_path(rest, field_type);
                self.upsert(FieldDefinition::new(head, FieldType::object(nested)));
            }
        }
    }
}

impl FromIterator<FieldDefinition> for FieldList {
    fn from_iter<I: IntoIterator<Item = FieldDefinition>>(iter: I) -> Self {
        let mut list = FieldList::new();
        for field in iter {
            list.upsert(field);
        }
        list
    }
}

impl Serialize for FieldList {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;

        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for field in &self.0 {
            map.serialize_entry(
                &field.name,
                &FieldBody {
                    field_type: field.field_type.clone(),
                    nullable: field.nullable,
                },
            )?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for FieldList {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct FieldListVisitor;

        impl<'de> Visitor<'de> for FieldListVisitor {
            type Value = FieldList;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a mapping of field name to field definition")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> std::result::Result<FieldList, A::Error> {
                let mut list = FieldList::new();
                while let Some((name, body)) = access.next_entry::<String, FieldBody>()? {
                    let field = FieldDefinition {
                        name,
                        field_type: body.field_type,
                        nullable: body.nullable,
                    };
                    list.push(field).map_err(|name| {
                        serde::de::Error::custom(format!("duplicate field '{name}'"))
                    })?;
                }
                Ok(list)
            }
        }

        deserializer.deserialize_map(FieldListVisitor)
    }
}

static OBJECT_ID: FieldType = FieldType::ObjectId;
static ANY: FieldType = FieldType::Any;

/// Resolve a dotted path against a field list.
///
/// List levels are transparent: `direcciones.ciudad` resolves against the
/// item definition of `direcciones`. A numeric segment directly on a list is
/// an element index, so `telefonos.1` resolves to the item type. `_id` is
/// implicit at the top level. Returns the failing prefix on error.
pub fn resolve_path<'a>(fields: &'a FieldList, path: &str) -> std::result::Result<&'a FieldType, String> {
    let mut current: Option<&'a FieldType> = None;
    let mut consumed = String::new();

    for segment in path.split('.') {
        if !consumed.is_empty() {
            consumed.push('.');
        }
        consumed.push_str(segment);

        if segment.is_empty() {
            return Err(consumed);
        }

        let mut scope = current;
        loop {
            match scope {
                None => {
                    current = match fields.get(segment) {
                        Some(field) => Some(&field.field_type),
                        None if segment == "_id" => Some(&OBJECT_ID),
                        None => return Err(consumed),
                    };
                    break;
                }
                Some(FieldType::Any) => return Ok(&ANY),
                Some(FieldType::List { items }) => {
                    if segment.chars().all(|c| c.is_ascii_digit()) {
                        current = Some(items.as_ref());
                        break;
                    }
                    scope = Some(items.as_ref());
                }
                Some(FieldType::Object { fields: nested }) => {
                    current = match nested.get(segment) {
                        Some(field) => Some(&field.field_type),
                        None => return Err(consumed),
                    };
                    break;
                }
                Some(_) => return Err(consumed),
            }
        }
    }

    current.ok_or_else(|| path.to_string())
}
