//! Runs query definitions: validate, translate to the native plan, submit
//! to the store driver, and hand back rows or an update summary.

mod translate;

pub use translate::Translator;

use crate::engine::value::expression_path;
use crate::engine::{Filter, FindQuery, Pipeline, ProjectField, ProjectSpec, UpdateDoc};
use crate::error::{QueryBookError, Result};
use crate::query::{QueryBody, QueryDefinition, QueryKind};
use crate::schema::SchemaRegistry;
use crate::store::{RowStream, StoreDriver, UpdateSummary};
use crate::validation::validate;
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;

/// Output field name → value, in output order.
pub type Row = Map<String, Value>;

/// Lazy, one-pass sequence of result rows.
pub struct Rows<'a> {
    stream: RowStream<'a>,
    columns: Option<Vec<String>>,
}

impl<'a> Rows<'a> {
    /// With `columns`, every row is flattened to exactly those paths
    /// (missing paths become null). Without, rows are the top-level
    /// fields of each document.
    pub fn new(stream: RowStream<'a>, columns: Option<Vec<String>>) -> Self {
        Rows { stream, columns }
    }

    pub fn from_documents(docs: Vec<Value>, columns: Option<Vec<String>>) -> Self {
        Rows::new(Box::new(docs.into_iter().map(Ok)), columns)
    }

    /// Columns known before the first row is read.
    pub fn columns(&self) -> Option<&[String]> {
        self.columns.as_deref()
    }

    fn to_row(&self, doc: Value) -> Result<Row> {
        if let Some(columns) = &self.columns {
            return Ok(columns
                .iter()
                .map(|column| {
                    let value = expression_path(&doc, column).unwrap_or(Value::Null);
                    (column.clone(), value)
                })
                .collect());
        }
        match doc {
            Value::Object(map) => Ok(map),
            other => Err(QueryBookError::execution(format!(
                "result is not a document: {other}"
            ))),
        }
    }
}

impl Iterator for Rows<'_> {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        let doc = self.stream.next()?;
        Some(doc.and_then(|doc| self.to_row(doc)))
    }
}

impl fmt::Debug for Rows<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rows")
            .field("columns", &self.columns)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub enum ExecutionOutput<'a> {
    Rows(Rows<'a>),
    Summary(UpdateSummary),
}

impl ExecutionOutput<'_> {
    /// Drain rows into memory. Summaries yield an empty list.
    pub fn collect_rows(self) -> Result<Vec<Row>> {
        match self {
            ExecutionOutput::Rows(rows) => rows.collect(),
            ExecutionOutput::Summary(_) => Ok(Vec::new()),
        }
    }
}

/// Translated, store-native form of a definition.
#[derive(Debug, Clone)]
pub enum NativePlan {
    Find(FindQuery),
    Aggregate(Pipeline),
    Update {
        filter: Filter,
        update: UpdateDoc,
        multi: bool,
    },
}

#[derive(Debug, Clone)]
pub struct Plan {
    pub query_id: String,
    pub collection: String,
    pub kind: QueryKind,
    pub native: NativePlan,
}

impl Plan {
    /// Stage names in execution order; empty for non-aggregations.
    pub fn stages(&self) -> Vec<&'static str> {
        match &self.native {
            NativePlan::Aggregate(pipeline) => pipeline.stage_names(),
            _ => Vec::new(),
        }
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} ({} on {})",
            self.query_id, self.kind, self.collection
        )?;
        if let NativePlan::Aggregate(_) = self.native {
            writeln!(f, "stages: {}", self.stages().join(" -> "))?;
        }
        write!(f, "{:#?}", self.native)
    }
}

/// Columns a `find` declares up front: the inclusion projection's paths in
/// declared order, `_id` first unless suppressed.
fn declared_columns(projection: &ProjectSpec) -> Option<Vec<String>> {
    if !projection.is_inclusion() {
        return None;
    }
    let mut columns = Vec::new();
    if projection.include_id {
        columns.push("_id".to_string());
    }
    for (path, field) in &projection.fields {
        if !matches!(field, ProjectField::Exclude) {
            columns.push(path.clone());
        }
    }
    Some(columns)
}

pub struct Executor<'a> {
    registry: &'a SchemaRegistry,
    driver: &'a dyn StoreDriver,
    timeout: Option<Duration>,
}

impl<'a> Executor<'a> {
    pub fn new(registry: &'a SchemaRegistry, driver: &'a dyn StoreDriver) -> Self {
        Executor {
            registry,
            driver,
            timeout: None,
        }
    }

    /// Bound every store call; expiry surfaces as `StoreUnavailable`.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn registry(&self) -> &'a SchemaRegistry {
        self.registry
    }

    /// Validate and translate without touching the store.
    pub fn explain(&self, definition: &QueryDefinition) -> Result<Plan> {
        validate(definition, self.registry)?;
        let translator = Translator::new(self.registry, self.driver.capabilities());
        let collection = definition.collection.as_str();

        let native = match &definition.body {
            QueryBody::Find {
                filter,
                projection,
                sort,
                skip,
                limit,
            } => NativePlan::Find(translator.find(
                collection,
                filter,
                projection.as_ref(),
                sort.as_ref(),
                *skip,
                *limit,
            )?),
            QueryBody::Aggregate { pipeline } => {
                NativePlan::Aggregate(translator.pipeline(collection, pipeline)?)
            }
            QueryBody::Update {
                filter,
                update,
                multi,
            } => NativePlan::Update {
                filter: translator.update_filter(collection, filter)?,
                update: translator.update(collection, update)?,
                multi: *multi,
            },
        };

        Ok(Plan {
            query_id: definition.id.clone(),
            collection: definition.collection.clone(),
            kind: definition.kind(),
            native,
        })
    }

    pub fn run(&self, definition: &QueryDefinition) -> Result<ExecutionOutput<'a>> {
        let plan = self.explain(definition)?;
        log::debug!("Running {} '{}'", plan.kind, plan.query_id);

        let driver = self.driver;
        let collection = plan.collection.as_str();
        match plan.native {
            NativePlan::Find(query) => {
                let columns = query.projection.as_ref().and_then(declared_columns);
                let stream = driver.find(collection, &query, self.timeout)?;
                Ok(ExecutionOutput::Rows(Rows::new(stream, columns)))
            }
            NativePlan::Aggregate(pipeline) => {
                let stream = driver.aggregate(collection, &pipeline, self.timeout)?;
                Ok(ExecutionOutput::Rows(Rows::new(stream, None)))
            }
            NativePlan::Update {
                filter,
                update,
                multi,
            } => {
                let summary = if multi {
                    driver.update_many(collection, &filter, &update, self.timeout)?
                } else {
                    driver.update_one(collection, &filter, &update, self.timeout)?
                };
                Ok(ExecutionOutput::Summary(summary))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Capabilities, SqliteStore};
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
      stock:
        type: object
        fields:
          actual: { type: integer }
          minimo: { type: integer }
  ventas:
    fields:
      numero_factura: { type: string }
      subtotal: { type: currency }
      descuento: { type: currency }
"#,
        )
        .unwrap()
    }

    fn store() -> SqliteStore {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .insert_many(
                "productos",
                vec![
                    json!({"_id": "p1", "nombre": "Lente A", "precio_venta": 250000, "stock": {"actual": 5, "minimo": 10}}),
                    json!({"_id": "p2", "nombre": "Montura B", "precio_venta": 180000, "stock": {"actual": 40, "minimo": 10}}),
                ],
            )
            .unwrap();
        store
            .insert_many(
                "ventas",
                vec![
                    json!({"_id": "v1", "numero_factura": "F-1", "subtotal": 400000, "descuento": 50000}),
                    json!({"_id": "v2", "numero_factura": "F-2", "subtotal": 100000, "descuento": 5000}),
                ],
            )
            .unwrap();
        store
    }

    #[test]
    fn test_find_rows_follow_projection_columns() {
        let registry = registry();
        let store = store();
        let executor = Executor::new(&registry, &store);
        let def = QueryDefinition::find("2.2", "productos", json!({}))
            .with_projection(json!({"nombre": 1, "stock.actual": 1, "_id": 0}));

        let output = executor.run(&def).unwrap();
        let ExecutionOutput::Rows(rows) = output else {
            panic!("expected rows");
        };
        assert_eq!(
            rows.columns(),
            Some(&["nombre".to_string(), "stock.actual".to_string()][..])
        );
        let rows: Vec<Row> = rows.collect::<Result<_>>().unwrap();
        assert_eq!(
            Value::Object(rows[0].clone()),
            json!({"nombre": "Lente A", "stock.actual": 5})
        );
    }

    #[test]
    fn test_currency_ratio_filter() {
        let registry = registry();
        let store = store();
        let executor = Executor::new(&registry, &store);
        let def = QueryDefinition::find(
            "6.2",
            "ventas",
            json!({"$expr": {"$gt": [{"$divide": ["$descuento", "$subtotal"]}, 0.10]}}),
        );
        let rows = executor.run(&def).unwrap().collect_rows().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["numero_factura"], json!("F-1"));

        let ratio = QueryDefinition::aggregate(
            "ratio",
            "ventas",
            vec![
                json!({"$match": {"numero_factura": "F-1"}}),
                json!({"$project": {"_id": 0, "ratio": {"$divide": ["$descuento", "$subtotal"]}}}),
            ],
        );
        let rows = executor.run(&ratio).unwrap().collect_rows().unwrap();
        assert_eq!(rows[0]["ratio"], json!(0.125));
    }

    #[test]
    fn test_update_dispatch_and_summary() {
        let registry = registry();
        let store = store();
        let executor = Executor::new(&registry, &store);
        let def = QueryDefinition::update(
            "12.5",
            "productos",
            json!({}),
            json!({"$mul": {"precio_venta": 1.05}}),
            true,
        );
        match executor.run(&def).unwrap() {
            ExecutionOutput::Summary(summary) => {
                assert_eq!(summary, UpdateSummary { matched: 2, modified: 2 })
            }
            other => panic!("unexpected {other:?}"),
        }
        let after = store.load_collection("productos").unwrap();
        assert_eq!(after[1]["precio_venta"], json!(189000));
    }

    #[test]
    fn test_validation_runs_before_translation() {
        let registry = registry();
        let store = store();
        let executor = Executor::new(&registry, &store);
        let def = QueryDefinition::find("bad", "productos", json!({"marca": {"$elemMatch": {}}}));
        assert!(matches!(
            executor.run(&def),
            Err(QueryBookError::Validation(e)) if e.paths() == vec!["marca"]
        ));
    }

    #[test]
    fn test_capabilities_refuse_stage() {
        let registry = registry();
        let store = store().with_capabilities(Capabilities::full().without_stage("$group"));
        let executor = Executor::new(&registry, &store);
        let def = QueryDefinition::aggregate(
            "9.4",
            "productos",
            vec![json!({"$group": {"_id": null, "n": {"$sum": 1}}})],
        );
        assert!(matches!(
            executor.run(&def),
            Err(QueryBookError::Translation(_))
        ));
    }

    #[test]
    fn test_expired_timeout_is_store_unavailable() {
        let registry = registry();
        let store = store();
        let executor = Executor::new(&registry, &store).with_timeout(Some(Duration::ZERO));
        let def = QueryDefinition::find("1.2", "productos", json!({}));
        let err = executor.run(&def).unwrap_err();
        assert!(err.is_retryable(), "{err}");
    }

    #[test]
    fn test_explain_lists_stages() {
        let registry = registry();
        let store = store();
        let executor = Executor::new(&registry, &store);
        let def = QueryDefinition::aggregate(
            "x",
            "productos",
            vec![json!({"$limit": 1}), json!({"$match": {"nombre": "Lente A"}})],
        );
        let plan = executor.explain(&def).unwrap();
        assert_eq!(plan.stages(), vec!["$limit", "$match"]);
        assert!(plan.to_string().starts_with("x (aggregate on productos)\nstages: $limit -> $match"));
    }
}
