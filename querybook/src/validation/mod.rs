//! Static validation of query definitions against the schema registry.
//!
//! Every field reference is resolved; failures are collected rather than
//! short-circuited, so one pass reports every bad path of a definition.

mod shape;

pub use shape::{field_reference, operator_of, projection_flag, Shape};

use crate::error::{PathProblem, ValidationError};
use crate::query::{QueryBody, QueryDefinition};
use crate::schema::SchemaRegistry;
use serde_json::Value;

struct Checker<'r> {
    registry: &'r SchemaRegistry,
    problems: Vec<PathProblem>,
}

impl<'r> Checker<'r> {
    fn problem(&mut self, location: &str, path: &str, reason: String) {
        self.problems.push(PathProblem {
            location: location.to_string(),
            path: path.to_string(),
            reason,
        });
    }

    fn path(&mut self, shape: &Shape, location: &str, path: &str) {
        if let Err(prefix) = shape.resolve(path) {
            let reason = if prefix == path {
                "no such field".to_string()
            } else {
                format!("no field '{prefix}'")
            };
            self.problem(location, path, reason);
        }
    }

    fn filter(&mut self, shape: &Shape, location: &str, filter: &Value) {
        let Value::Object(map) = filter else {
            return;
        };
        for (key, value) in map {
            match key.as_str() {
                "$and" | "$or" | "$nor" => {
                    if let Value::Array(parts) = value {
                        for part in parts {
                            self.filter(shape, location, part);
                        }
                    }
                }
                "$expr" => self.expr(shape, location, value),
                other if other.starts_with('$') => {}
                path => self.path(shape, location, path),
            }
        }
    }

    fn expr(&mut self, shape: &Shape, location: &str, expr: &Value) {
        if let Some(path) = field_reference(expr) {
            self.path(shape, location, path);
            return;
        }
        match expr {
            Value::Object(map) => {
                if operator_of(map).is_some_and(|(op, _)| op == "$literal") {
                    return;
                }
                for value in map.values() {
                    self.expr(shape, location, value);
                }
            }
            Value::Array(items) => {
                for item in items {
                    self.expr(shape, location, item);
                }
            }
            _ => {}
        }
    }

    fn projection(&mut self, shape: &Shape, location: &str, projection: &Value) {
        let Value::Object(map) = projection else {
            return;
        };
        for (path, value) in map {
            if projection_flag(value).is_some() {
                self.path(shape, location, path);
            } else {
                self.expr(shape, location, value);
            }
        }
    }

    fn sort(&mut self, shape: &Shape, location: &str, sort: &Value) {
        if let Value::Object(map) = sort {
            for path in map.keys() {
                self.path(shape, location, path);
            }
        }
    }

    fn update(&mut self, shape: &Shape, update: &Value) {
        let Value::Object(map) = update else {
            return;
        };
        for (operator, targets) in map {
            if let Value::Object(targets) = targets {
                let location = format!("update.{operator}");
                for path in targets.keys() {
                    self.path(shape, &location, path);
                }
            }
        }
    }

    fn pipeline(&mut self, mut shape: Shape, pipeline: &[Value]) {
        for (index, stage) in pipeline.iter().enumerate() {
            let Some((name, body)) = stage.as_object().and_then(operator_of) else {
                continue;
            };
            let location = format!("pipeline[{index}].{name}");
            match name {
                "$match" => self.filter(&shape, &location, body),
                "$project" => self.projection(&shape, &location, body),
                "$addFields" | "$set" => {
                    if let Value::Object(map) = body {
                        for value in map.values() {
                            self.expr(&shape, &location, value);
                        }
                    }
                }
                "$unwind" => {
                    let path = match body {
                        Value::Object(map) => map.get("path"),
                        other => Some(other),
                    };
                    if let Some(path) = path {
                        self.expr(&shape, &location, path);
                    }
                }
                "$group" => {
                    if let Value::Object(map) = body {
                        for value in map.values() {
                            self.expr(&shape, &location, value);
                        }
                    }
                }
                "$sort" => self.sort(&shape, &location, body),
                "$lookup" => self.lookup(&shape, &location, body),
                _ => {}
            }
            shape = shape.after_stage(name, body, self.registry);
        }
    }

    fn lookup(&mut self, shape: &Shape, location: &str, body: &Value) {
        let from = body.get("from").and_then(Value::as_str).unwrap_or_default();
        if let Some(local) = body.get("localField").and_then(Value::as_str) {
            self.path(shape, location, local);
        }
        if !self.registry.contains(from) {
            self.problem(location, from, "unknown collection".to_string());
            return;
        }
        if let Some(foreign) = body.get("foreignField").and_then(Value::as_str) {
            let foreign_shape = Shape::of_collection(self.registry, from);
            self.path(&foreign_shape, location, foreign);
        }
    }
}

/// Resolve every field reference of `definition` against its collection
/// (and, for aggregations, against the shape each stage produces).
pub fn validate(
    definition: &QueryDefinition,
    registry: &SchemaRegistry,
) -> std::result::Result<(), ValidationError> {
    let mut checker = Checker {
        registry,
        problems: Vec::new(),
    };

    if !registry.contains(&definition.collection) {
        checker.problem(
            "collection",
            &definition.collection,
            "unknown collection".to_string(),
        );
    } else {
        let shape = Shape::of_collection(registry, &definition.collection);
        match &definition.body {
            QueryBody::Find {
                filter,
                projection,
                sort,
                ..
            } => {
                checker.filter(&shape, "filter", filter);
                if let Some(projection) = projection {
                    checker.projection(&shape, "projection", projection);
                }
                if let Some(sort) = sort {
                    checker.sort(&shape, "sort", sort);
                }
            }
            QueryBody::Aggregate { pipeline } => checker.pipeline(shape, pipeline),
            QueryBody::Update { filter, update, .. } => {
                checker.filter(&shape, "filter", filter);
                checker.update(&shape, update);
            }
        }
    }

    if checker.problems.is_empty() {
        Ok(())
    } else {
        log::debug!(
            "Query '{}' has {} unresolved field references",
            definition.id,
            checker.problems.len()
        );
        Err(ValidationError {
            query_id: definition.id.clone(),
            problems: checker.problems,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn registry() -> SchemaRegistry {
        SchemaRegistry::from_yaml_str(
            r#"
collections:
  productos:
    fields:
      nombre: { type: string }
      precio_venta: { type: currency }
      activo: { type: boolean }
      stock:
        type: object
        fields:
          actual: { type: integer }
          minimo: { type: integer }
  clientes:
    fields:
      nombre: { type: string }
      telefonos:
        type: list
        items:
          type: object
          fields:
            numero: { type: string }
  ventas:
    fields:
      cliente_ref: { type: object_id }
      total: { type: currency }
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_valid_find_passes() {
        let def = QueryDefinition::find(
            "6.1",
            "productos",
            json!({"$expr": {"$lte": ["$stock.actual", "$stock.minimo"]}}),
        )
        .with_projection(json!({"nombre": 1, "stock.actual": 1, "_id": 0}))
        .with_sort(json!({"precio_venta": -1}));
        assert!(validate(&def, &registry()).is_ok());
    }

    #[test]
    fn test_empty_filter_trivially_valid() {
        let def = QueryDefinition::find("all", "clientes", json!({}));
        assert!(validate(&def, &registry()).is_ok());
    }

    #[test]
    fn test_reports_every_bad_path() {
        let def = QueryDefinition::find(
            "bad",
            "productos",
            json!({"stock.maximo": {"$gt": 1}, "$or": [{"marca": "Oakley"}, {"activo": true}]}),
        )
        .with_sort(json!({"nombre": 1, "precio": 1}));
        let err = validate(&def, &registry()).unwrap_err();
        assert_eq!(err.query_id, "bad");
        assert_eq!(err.paths(), vec!["stock.maximo", "marca", "precio"]);
        assert_eq!(err.problems[0].location, "filter");
        assert_eq!(err.problems[2].location, "sort");
    }

    #[test]
    fn test_numeric_index_into_list() {
        let ok = QueryDefinition::find("7.1", "clientes", json!({"telefonos.1": {"$exists": true}}));
        assert!(validate(&ok, &registry()).is_ok());
        let bad = QueryDefinition::find("x", "clientes", json!({"telefonos.1.extension": 1}));
        assert!(validate(&bad, &registry())
            .unwrap_err()
            .contains_path("telefonos.1.extension"));
    }

    #[test]
    fn test_unknown_collection() {
        let def = QueryDefinition::find("x", "bodegas", json!({}));
        let err = validate(&def, &registry()).unwrap_err();
        assert_eq!(err.problems[0].location, "collection");
        assert_eq!(err.paths(), vec!["bodegas"]);
    }

    #[test]
    fn test_pipeline_resolves_against_reshaped_document() {
        let def = QueryDefinition::aggregate(
            "11.3",
            "ventas",
            vec![
                json!({"$group": {"_id": "$cliente_ref", "gasto_total": {"$sum": "$total"}}}),
                json!({"$lookup": {"from": "clientes", "localField": "_id", "foreignField": "_id", "as": "cliente"}}),
                json!({"$unwind": "$cliente"}),
                json!({"$project": {"nombre": "$cliente.nombre", "gasto_total": 1}}),
                json!({"$sort": {"gasto_total": -1}}),
            ],
        );
        assert!(validate(&def, &registry()).is_ok());

        let stale = QueryDefinition::aggregate(
            "stale",
            "ventas",
            vec![
                json!({"$group": {"_id": "$cliente_ref", "gasto_total": {"$sum": "$total"}}}),
                json!({"$sort": {"total": -1}}),
            ],
        );
        let err = validate(&stale, &registry()).unwrap_err();
        assert_eq!(err.paths(), vec!["total"]);
        assert_eq!(err.problems[0].location, "pipeline[1].$sort");
    }

    #[test]
    fn test_lookup_from_unknown_collection() {
        let def = QueryDefinition::aggregate(
            "x",
            "ventas",
            vec![json!({"$lookup": {"from": "bodegas", "localField": "cliente_ref", "foreignField": "_id", "as": "b"}})],
        );
        let err = validate(&def, &registry()).unwrap_err();
        assert_eq!(err.paths(), vec!["bodegas"]);
    }

    #[test]
    fn test_update_targets_checked() {
        let def = QueryDefinition::update(
            "12.1",
            "productos",
            json!({"nombre": "Lente"}),
            json!({"$inc": {"stock.actual": -2, "stock.reservado": 1}}),
            false,
        );
        let err = validate(&def, &registry()).unwrap_err();
        assert_eq!(err.paths(), vec!["stock.reservado"]);
        assert_eq!(err.problems[0].location, "update.$inc");
    }
}
