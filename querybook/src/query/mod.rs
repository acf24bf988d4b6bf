//! Declarative, data-only query definitions as they appear in a catalog.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// One catalogued `find`, `aggregate` or `update`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryDefinition {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub collection: String,
    #[serde(flatten)]
    pub body: QueryBody,
    /// Column headers to print when a tabular result has no rows.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<String>,
}

fn empty_filter() -> Value {
    Value::Object(Map::new())
}

/// Kind-specific payload, tagged by `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueryBody {
    Find {
        #[serde(default = "empty_filter")]
        filter: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        projection: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sort: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        skip: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<u64>,
    },
    Aggregate {
        pipeline: Vec<Value>,
    },
    Update {
        #[serde(default = "empty_filter")]
        filter: Value,
        update: Value,
        #[serde(default)]
        multi: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryKind {
    Find,
    Aggregate,
    Update,
}

impl QueryKind {
    /// Reads can be retried; updates are not idempotent.
    pub fn is_read(&self) -> bool {
        !matches!(self, QueryKind::Update)
    }
}

impl fmt::Display for QueryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            QueryKind::Find => "find",
            QueryKind::Aggregate => "aggregate",
            QueryKind::Update => "update",
        })
    }
}

impl QueryDefinition {
    fn new(id: &str, collection: &str, body: QueryBody) -> Self {
        QueryDefinition {
            id: id.to_string(),
            section: None,
            title: None,
            collection: collection.to_string(),
            body,
            headers: Vec::new(),
        }
    }

    pub fn find(id: &str, collection: &str, filter: Value) -> Self {
        Self::new(
            id,
            collection,
            QueryBody::Find {
                filter,
                projection: None,
                sort: None,
                skip: None,
                limit: None,
            },
        )
    }

    pub fn aggregate(id: &str, collection: &str, pipeline: Vec<Value>) -> Self {
        Self::new(id, collection, QueryBody::Aggregate { pipeline })
    }

    pub fn update(id: &str, collection: &str, filter: Value, update: Value, multi: bool) -> Self {
        Self::new(
            id,
            collection,
            QueryBody::Update {
                filter,
                update,
                multi,
            },
        )
    }

    /// Set the projection of a `find`; ignored for other kinds.
    pub fn with_projection(mut self, value: Value) -> Self {
        if let QueryBody::Find { projection, .. } = &mut self.body {
            *projection = Some(value);
        }
        self
    }

    pub fn with_sort(mut self, value: Value) -> Self {
        if let QueryBody::Find { sort, .. } = &mut self.body {
            *sort = Some(value);
        }
        self
    }

    pub fn with_limit(mut self, n: u64) -> Self {
        if let QueryBody::Find { limit, .. } = &mut self.body {
            *limit = Some(n);
        }
        self
    }

    pub fn with_title(mut self, section: &str, title: &str) -> Self {
        self.section = Some(section.to_string());
        self.title = Some(title.to_string());
        self
    }

    pub fn with_headers(mut self, headers: &[&str]) -> Self {
        self.headers = headers.iter().map(|h| h.to_string()).collect();
        self
    }

    pub fn kind(&self) -> QueryKind {
        match self.body {
            QueryBody::Find { .. } => QueryKind::Find,
            QueryBody::Aggregate { .. } => QueryKind::Aggregate,
            QueryBody::Update { .. } => QueryKind::Update,
        }
    }

    /// `id` plus title, for headings and log lines.
    pub fn label(&self) -> String {
        match &self.title {
            Some(title) => format!("{} {}", self.id, title),
            None => self.id.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_parse_find_from_yaml() {
        let def: QueryDefinition = serde_yaml::from_str(
            r#"
id: "2.1"
section: Proyecciones
title: Lista de clientes
collection: clientes
kind: find
projection: { nombre: 1, apellido: 1, email: 1, _id: 0 }
"#,
        )
        .unwrap();
        assert_eq!(def.kind(), QueryKind::Find);
        assert_eq!(def.label(), "2.1 Lista de clientes");
        match &def.body {
            QueryBody::Find {
                filter, projection, ..
            } => {
                assert_eq!(filter, &json!({}));
                let keys: Vec<&String> = projection.as_ref().unwrap().as_object().unwrap().keys().collect();
                assert_eq!(keys, vec!["nombre", "apellido", "email", "_id"]);
            }
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[test]
    fn test_parse_update_defaults() {
        let def: QueryDefinition = serde_yaml::from_str(
            r#"
id: "12.1"
collection: productos
kind: update
filter: { codigo_barras: "7890123456001" }
update: { $inc: { stock.actual: -2 } }
"#,
        )
        .unwrap();
        assert_eq!(def.kind(), QueryKind::Update);
        assert!(!def.kind().is_read());
        assert!(matches!(def.body, QueryBody::Update { multi: false, .. }));
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let result: Result<QueryDefinition, _> =
            serde_yaml::from_str("id: x\ncollection: clientes\nkind: delete\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_builders() {
        let def = QueryDefinition::find("1.1", "clientes", json!({"email": "ana.perez@mail.com"}))
            .with_limit(1)
            .with_headers(&["nombre", "email"]);
        assert_eq!(def.headers, vec!["nombre".to_string(), "email".to_string()]);
        assert!(matches!(def.body, QueryBody::Find { limit: Some(1), .. }));
    }
}
