//! Native query representation and the in-process evaluator behind the
//! bundled store: filters, aggregation expressions, pipeline stages,
//! update operators and the numeric model they share.

pub mod expr;
pub mod filter;
pub mod numeric;
pub mod pipeline;
pub mod update;
pub mod value;

pub use expr::{Datum, Expr, Operator};
pub use filter::{FieldPredicate, Filter, Predicate};
pub use numeric::{Fixed, Num};
pub use pipeline::{
    run_pipeline, Accumulator, AccumulatorKind, CollectionSource, GroupSpec, LookupSpec,
    Pipeline, ProjectField, ProjectSpec, SortKey, Stage, UnwindSpec,
};
pub use update::{UpdateDoc, UpdateOp};

use crate::error::{QueryBookError, Result};
use serde_json::Value;
use std::time::{Duration, Instant};

/// Point in time after which a store call gives up.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Option<Instant>,
    budget: Option<Duration>,
}

impl Deadline {
    pub fn none() -> Self {
        Deadline {
            at: None,
            budget: None,
        }
    }

    pub fn after(timeout: Option<Duration>) -> Self {
        Deadline {
            at: timeout.and_then(|t| Instant::now().checked_add(t)),
            budget: timeout,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.at.is_some_and(|at| Instant::now() >= at)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_expired() {
            let budget = self.budget.unwrap_or_default();
            return Err(QueryBookError::StoreUnavailable(format!(
                "operation exceeded its {}ms timeout",
                budget.as_millis()
            )));
        }
        Ok(())
    }
}

/// Native form of a `find`.
#[derive(Debug, Clone)]
pub struct FindQuery {
    pub filter: Filter,
    pub projection: Option<ProjectSpec>,
    pub sort: Vec<SortKey>,
    pub skip: usize,
    pub limit: Option<usize>,
}

impl FindQuery {
    pub fn new(filter: Filter) -> Self {
        FindQuery {
            filter,
            projection: None,
            sort: Vec::new(),
            skip: 0,
            limit: None,
        }
    }

    /// Evaluate over a full collection scan, in filter, sort, skip, limit,
    /// projection order.
    pub fn evaluate(&self, docs: Vec<Value>, deadline: &Deadline) -> Result<Vec<Value>> {
        let mut matched = Vec::new();
        for doc in docs {
            deadline.check()?;
            if self.filter.matches(&doc).map_err(QueryBookError::execution)? {
                matched.push(doc);
            }
        }
        pipeline::sort_documents(&mut matched, &self.sort);

        let window = matched
            .into_iter()
            .skip(self.skip)
            .take(self.limit.unwrap_or(usize::MAX));

        let Some(projection) = &self.projection else {
            return Ok(window.collect());
        };
        let stage = Pipeline::new(vec![Stage::Project(projection.clone())]);
        run_pipeline(window.collect(), &stage, &NoForeignCollections, deadline).map_err(
            |err| match err {
                QueryBookError::Execution { message, .. } => QueryBookError::execution(message),
                other => other,
            },
        )
    }
}

struct NoForeignCollections;

impl CollectionSource for NoForeignCollections {
    fn scan(&self, collection: &str, _deadline: &Deadline) -> Result<Vec<Value>> {
        Err(QueryBookError::UnknownCollection(collection.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn productos() -> Vec<Value> {
        vec![
            json!({"_id": "p1", "nombre": "Armazón", "precio_venta": 250000}),
            json!({"_id": "p2", "nombre": "Lente", "precio_venta": 90000}),
            json!({"_id": "p3", "nombre": "Estuche", "precio_venta": 15000}),
        ]
    }

    #[test]
    fn test_find_sort_skip_limit_project() {
        let mut query = FindQuery::new(Filter::field(
            "precio_venta",
            Predicate::Gt(json!(10000)),
        ));
        query.sort = vec![SortKey {
            path: "precio_venta".into(),
            descending: false,
        }];
        query.skip = 1;
        query.limit = Some(1);
        query.projection = Some(ProjectSpec {
            include_id: false,
            fields: vec![("nombre".into(), ProjectField::Include)],
        });

        let out = query.evaluate(productos(), &Deadline::none()).unwrap();
        assert_eq!(out, vec![json!({"nombre": "Lente"})]);
    }

    #[test]
    fn test_deadline_without_timeout_never_expires() {
        assert!(Deadline::none().check().is_ok());
        assert!(Deadline::after(Some(Duration::from_secs(60))).check().is_ok());
        assert!(Deadline::after(Some(Duration::MAX)).check().is_ok());
    }
}
