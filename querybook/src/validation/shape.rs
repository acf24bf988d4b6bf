//! The document shape flowing through an aggregation pipeline.
//!
//! Every reshaping stage produces a new field list, so later stages resolve
//! their paths and infer currency arithmetic against what the previous stage
//! actually emits rather than the stored collection.

use crate::schema::{resolve_path, FieldDefinition, FieldList, FieldType, SchemaRegistry};
use serde_json::Value;

static ANY: FieldType = FieldType::Any;

#[derive(Debug, Clone, PartialEq)]
pub struct Shape {
    fields: FieldList,
    /// Unknown shape: every path resolves to `any`.
    opaque: bool,
}

/// `"$a.b"` as a path, skipping `$$variables`.
pub fn field_reference(value: &Value) -> Option<&str> {
    match value {
        Value::String(s) if s.starts_with('$') && !s.starts_with("$$") => Some(&s[1..]),
        _ => None,
    }
}

/// The single `$operator` key of an operator expression.
pub fn operator_of(map: &serde_json::Map<String, Value>) -> Option<(&str, &Value)> {
    if map.len() != 1 {
        return None;
    }
    let (key, value) = map.iter().next()?;
    key.starts_with('$').then_some((key.as_str(), value))
}

/// Whether a projection value includes (`1`/`true`) rather than computes.
pub fn projection_flag(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => Some(n.as_f64().map_or(false, |f| f != 0.0)),
        _ => None,
    }
}

fn with_id(mut fields: FieldList) -> FieldList {
    if fields.get("_id").is_none() {
        let mut out = FieldList::new();
        out.upsert(FieldDefinition::new("_id", FieldType::ObjectId));
        for field in fields.iter() {
            out.upsert(field.clone());
        }
        fields = out;
    }
    fields
}

impl Shape {
    pub fn new(fields: FieldList) -> Self {
        Shape {
            fields,
            opaque: false,
        }
    }

    pub fn of_collection(registry: &SchemaRegistry, collection: &str) -> Self {
        match registry.get(collection) {
            Some(schema) => Shape::new(schema.fields.clone()),
            None => Shape::opaque(),
        }
    }

    pub fn opaque() -> Self {
        Shape {
            fields: FieldList::new(),
            opaque: true,
        }
    }

    pub fn is_opaque(&self) -> bool {
        self.opaque
    }

    pub fn resolve(&self, path: &str) -> Result<&FieldType, String> {
        if self.opaque {
            return Ok(&ANY);
        }
        resolve_path(&self.fields, path)
    }

    /// Currency field, or a list of currency values reached through arrays.
    pub fn is_currency(&self, path: &str) -> bool {
        match self.resolve(path) {
            Ok(FieldType::Currency) => true,
            Ok(FieldType::List { items }) => items.is_currency(),
            _ => false,
        }
    }

    /// Static type of an aggregation expression.
    pub fn infer(&self, expr: &Value) -> FieldType {
        if let Some(path) = field_reference(expr) {
            return self.resolve(path).cloned().unwrap_or(FieldType::Any);
        }
        match expr {
            Value::Number(n) if n.is_i64() || n.is_u64() => FieldType::Integer,
            Value::Number(_) => FieldType::Number,
            Value::String(_) => FieldType::String,
            Value::Bool(_) => FieldType::Boolean,
            Value::Array(items) => {
                FieldType::list_of(items.first().map_or(FieldType::Any, |i| self.infer(i)))
            }
            Value::Object(map) => match operator_of(map) {
                Some((op, args)) => self.infer_operator(op, args),
                None => FieldType::object(
                    map.iter()
                        .map(|(k, v)| FieldDefinition::new(k.clone(), self.infer(v)))
                        .collect(),
                ),
            },
            Value::Null => FieldType::Any,
        }
    }

    fn args_of<'v>(args: &'v Value) -> Vec<&'v Value> {
        match args {
            Value::Array(items) => items.iter().collect(),
            other => vec![other],
        }
    }

    fn infer_operator(&self, op: &str, args: &Value) -> FieldType {
        match op {
            "$add" | "$subtract" | "$multiply" | "$divide" | "$round" | "$abs" | "$sum"
            | "$avg" => {
                if Self::args_of(args)
                    .iter()
                    .any(|arg| self.infer(arg).is_currency())
                {
                    FieldType::Currency
                } else {
                    FieldType::Number
                }
            }
            "$concat" | "$toUpper" | "$toLower" => FieldType::String,
            "$eq" | "$ne" | "$gt" | "$gte" | "$lt" | "$lte" | "$and" | "$or" | "$not" => {
                FieldType::Boolean
            }
            "$size" | "$year" | "$month" | "$dayOfMonth" | "$dayOfWeek" | "$count" => {
                FieldType::Integer
            }
            "$ifNull" | "$first" | "$last" | "$min" | "$max" => Self::args_of(args)
                .first()
                .map_or(FieldType::Any, |arg| self.infer(arg)),
            "$cond" => match args {
                Value::Array(items) if items.len() == 3 => self.infer(&items[1]),
                Value::Object(map) => map.get("then").map_or(FieldType::Any, |t| self.infer(t)),
                _ => FieldType::Any,
            },
            "$switch" => args
                .get("branches")
                .and_then(|b| b.get(0))
                .and_then(|b| b.get("then"))
                .map_or(FieldType::Any, |t| self.infer(t)),
            "$push" | "$addToSet" => FieldType::list_of(self.infer(args)),
            "$literal" => match args {
                Value::Number(n) if n.is_i64() => FieldType::Integer,
                Value::Number(_) => FieldType::Number,
                Value::String(_) => FieldType::String,
                Value::Bool(_) => FieldType::Boolean,
                _ => FieldType::Any,
            },
            _ => FieldType::Any,
        }
    }

    /// Shape emitted by one pipeline stage.
    pub fn after_stage(&self, name: &str, body: &Value, registry: &SchemaRegistry) -> Shape {
        if self.opaque {
            return self.clone();
        }
        match name {
            "$match" | "$sort" | "$limit" | "$skip" => self.clone(),
            "$project" => self.after_project(body),
            "$addFields" | "$set" => {
                let mut fields = self.fields.clone();
                if let Value::Object(map) = body {
                    for (path, expr) in map {
                        fields.insert_path(path, self.infer(expr));
                    }
                }
                Shape::new(fields)
            }
            "$unwind" => self.after_unwind(body),
            "$group" => {
                let mut fields = FieldList::new();
                if let Value::Object(map) = body {
                    for (name, spec) in map {
                        fields.upsert(FieldDefinition::new(name.clone(), self.infer(spec)));
                    }
                }
                Shape::new(fields)
            }
            "$lookup" => {
                let foreign = body
                    .get("from")
                    .and_then(Value::as_str)
                    .and_then(|from| registry.get(from));
                let as_field = body.get("as").and_then(Value::as_str);
                match (foreign, as_field) {
                    (Some(schema), Some(as_field)) => {
                        let mut fields = self.fields.clone();
                        let joined = FieldType::object(with_id(schema.fields.clone()));
                        fields.insert_path(as_field, FieldType::list_of(joined));
                        Shape::new(fields)
                    }
                    _ => Shape::opaque(),
                }
            }
            "$count" => {
                let mut fields = FieldList::new();
                if let Some(name) = body.as_str() {
                    fields.upsert(FieldDefinition::new(name, FieldType::Integer));
                }
                Shape::new(fields)
            }
            _ => Shape::opaque(),
        }
    }

    fn after_project(&self, body: &Value) -> Shape {
        let Value::Object(map) = body else {
            return Shape::opaque();
        };
        let inclusion = map
            .iter()
            .any(|(k, v)| k != "_id" && projection_flag(v) != Some(false));

        if !inclusion {
            let mut fields = self.fields.clone();
            for (path, _) in map {
                if !path.contains('.') {
                    fields.remove(path);
                }
            }
            return Shape::new(fields);
        }

        let mut fields = FieldList::new();
        if map.get("_id").and_then(projection_flag) != Some(false) {
            let id_type = self.resolve("_id").cloned().unwrap_or(FieldType::ObjectId);
            fields.upsert(FieldDefinition::new("_id", id_type));
        }
        for (path, value) in map {
            if path == "_id" {
                if projection_flag(value).is_none() {
                    fields.upsert(FieldDefinition::new("_id", self.infer(value)));
                }
                continue;
            }
            let field_type = match projection_flag(value) {
                Some(_) => self.resolve(path).cloned().unwrap_or(FieldType::Any),
                None => self.infer(value),
            };
            fields.insert_path(path, field_type);
        }
        Shape::new(fields)
    }

    fn after_unwind(&self, body: &Value) -> Shape {
        let (path, index_field) = match body {
            Value::String(_) => (field_reference(body), None),
            Value::Object(map) => (
                map.get("path").and_then(field_reference),
                map.get("includeArrayIndex").and_then(Value::as_str),
            ),
            _ => (None, None),
        };
        let Some(path) = path else {
            return Shape::opaque();
        };
        let mut fields = self.fields.clone();
        if let Ok(FieldType::List { items }) = self.resolve(path) {
            fields.insert_path(path, items.as_ref().clone());
        }
        if let Some(index_field) = index_field {
            fields.insert_path(index_field, FieldType::Integer);
        }
        Shape::new(fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> SchemaRegistry {
        SchemaRegistry::from_yaml_str(
            r#"
collections:
  ventas:
    fields:
      cliente_ref: { type: object_id }
      fecha_compra: { type: date }
      total: { type: currency }
      items:
        type: list
        items:
          type: object
          fields:
            cantidad: { type: integer }
            total: { type: currency }
  clientes:
    fields:
      nombre: { type: string }
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_group_reshapes_document() {
        let registry = registry();
        let shape = Shape::of_collection(&registry, "ventas");
        let grouped = shape.after_stage(
            "$group",
            &json!({
                "_id": {"mes": {"$month": "$fecha_compra"}},
                "total_ventas": {"$sum": "$total"},
                "cantidad": {"$count": {}}
            }),
            &registry,
        );
        assert_eq!(grouped.resolve("_id.mes").unwrap(), &FieldType::Integer);
        assert!(grouped.is_currency("total_ventas"));
        assert_eq!(grouped.resolve("cantidad").unwrap(), &FieldType::Integer);
        assert!(grouped.resolve("total").is_err());
    }

    #[test]
    fn test_lookup_then_unwind() {
        let registry = registry();
        let shape = Shape::of_collection(&registry, "ventas")
            .after_stage(
                "$lookup",
                &json!({"from": "clientes", "localField": "cliente_ref", "foreignField": "_id", "as": "cliente"}),
                &registry,
            )
            .after_stage("$unwind", &json!("$cliente"), &registry);
        assert_eq!(shape.resolve("cliente.nombre").unwrap(), &FieldType::String);
        assert_eq!(shape.resolve("cliente._id").unwrap(), &FieldType::ObjectId);
    }

    #[test]
    fn test_currency_through_arrays() {
        let registry = registry();
        let shape = Shape::of_collection(&registry, "ventas");
        assert!(shape.is_currency("items.total"));
        assert!(!shape.is_currency("items.cantidad"));
        assert_eq!(
            shape.infer(&json!({"$multiply": ["$items.cantidad", "$total"]})),
            FieldType::Currency
        );
    }

    #[test]
    fn test_inclusion_projection_drops_other_fields() {
        let registry = registry();
        let shape = Shape::of_collection(&registry, "ventas").after_stage(
            "$project",
            &json!({"total": 1, "cliente": {"$concat": ["a", "b"]}}),
            &registry,
        );
        assert!(shape.resolve("total").is_ok());
        assert!(shape.resolve("_id").is_ok());
        assert_eq!(shape.resolve("cliente").unwrap(), &FieldType::String);
        assert!(shape.resolve("fecha_compra").is_err());
    }

    #[test]
    fn test_unknown_stage_makes_shape_opaque() {
        let registry = registry();
        let shape = Shape::of_collection(&registry, "ventas").after_stage("$facet", &json!({}), &registry);
        assert!(shape.is_opaque());
        assert_eq!(shape.resolve("anything.at.all").unwrap(), &FieldType::Any);
    }
}
