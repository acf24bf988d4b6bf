//! Ordered, id-unique collection of query definitions and the sequential
//! runner that executes and reports each one.

use crate::error::{QueryBookError, Result};
use crate::executor::Executor;
use crate::query::{QueryDefinition, QueryKind};
use crate::report::ReportFormatter;
use crate::schema::SchemaRegistry;
use crate::validation::validate;
use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

/// Backoff for `StoreUnavailable` on read entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn none() -> Self {
        RetryPolicy {
            max_attempts: 1,
            base_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `retry` (1-based): base, 2·base, 4·base, ...
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 1u32 << retry.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(factor)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
        }
    }
}

/// A catalog entry that failed to parse or validate at load time.
#[derive(Debug)]
pub struct RejectedEntry {
    pub id: String,
    pub error: QueryBookError,
}

#[derive(Debug)]
enum Slot {
    Query(QueryDefinition),
    Rejected(RejectedEntry),
}

impl Slot {
    fn id(&self) -> &str {
        match self {
            Slot::Query(def) => &def.id,
            Slot::Rejected(entry) => &entry.id,
        }
    }
}

#[derive(Debug, Default)]
pub struct QueryCatalog {
    slots: Vec<Slot>,
    index: HashMap<String, usize>,
    retry: RetryPolicy,
}

impl QueryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn retry(&self) -> RetryPolicy {
        self.retry
    }

    /// Append a definition. Ids are unique whatever the payloads.
    pub fn add(&mut self, definition: QueryDefinition) -> Result<()> {
        self.insert(Slot::Query(definition))
    }

    /// Record an entry that will be reported as failed without running.
    pub fn reject(&mut self, entry: RejectedEntry) -> Result<()> {
        self.insert(Slot::Rejected(entry))
    }

    fn insert(&mut self, slot: Slot) -> Result<()> {
        if self.index.contains_key(slot.id()) {
            return Err(QueryBookError::DuplicateId(slot.id().to_string()));
        }
        self.index.insert(slot.id().to_string(), self.slots.len());
        self.slots.push(slot);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&QueryDefinition> {
        match self.slots.get(*self.index.get(id)?)? {
            Slot::Query(def) => Some(def),
            Slot::Rejected(_) => None,
        }
    }

    /// Runnable definitions in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &QueryDefinition> {
        self.slots.iter().filter_map(|slot| match slot {
            Slot::Query(def) => Some(def),
            Slot::Rejected(_) => None,
        })
    }

    pub fn ids(&self) -> Vec<&str> {
        self.iter().map(|def| def.id.as_str()).collect()
    }

    pub fn rejected(&self) -> impl Iterator<Item = &RejectedEntry> {
        self.slots.iter().filter_map(|slot| match slot {
            Slot::Rejected(entry) => Some(entry),
            Slot::Query(_) => None,
        })
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Execute and report every entry in declaration order. A failing entry
    /// is logged, reported in place and does not stop the run.
    pub fn run_all<W: Write + ?Sized>(
        &self,
        executor: &Executor<'_>,
        formatter: &ReportFormatter,
        sink: &mut W,
    ) -> RunReport {
        let mut report = RunReport::default();
        for slot in &self.slots {
            report.outcomes.push(self.run_slot(slot, executor, formatter, sink));
        }
        report
    }

    /// Like [`run_all`](Self::run_all), restricted to `ids` (still in
    /// declaration order). Unknown ids fail before anything runs.
    pub fn run_selected<W: Write + ?Sized>(
        &self,
        ids: &[String],
        executor: &Executor<'_>,
        formatter: &ReportFormatter,
        sink: &mut W,
    ) -> Result<RunReport> {
        if let Some(missing) = ids.iter().find(|id| !self.index.contains_key(id.as_str())) {
            return Err(QueryBookError::Other(format!("unknown query id '{missing}'")));
        }
        let mut report = RunReport::default();
        for slot in self.slots.iter().filter(|s| ids.iter().any(|id| id == s.id())) {
            report.outcomes.push(self.run_slot(slot, executor, formatter, sink));
        }
        Ok(report)
    }

    fn run_slot<W: Write + ?Sized>(
        &self,
        slot: &Slot,
        executor: &Executor<'_>,
        formatter: &ReportFormatter,
        sink: &mut W,
    ) -> EntryOutcome {
        match slot {
            Slot::Query(def) => self.run_entry(def, executor, formatter, sink),
            Slot::Rejected(entry) => {
                log::error!("Query '{}' was rejected at load: {}", entry.id, entry.error);
                report_failure(formatter, &entry.id, &entry.id, &entry.error, sink);
                EntryOutcome {
                    id: entry.id.clone(),
                    kind: None,
                    attempts: 0,
                    status: EntryStatus::Failed(entry.error.to_string()),
                }
            }
        }
    }

    fn run_entry<W: Write + ?Sized>(
        &self,
        def: &QueryDefinition,
        executor: &Executor<'_>,
        formatter: &ReportFormatter,
        sink: &mut W,
    ) -> EntryOutcome {
        let kind = def.kind();
        let mut attempts = 0;
        let status = loop {
            attempts += 1;
            let mut section = Vec::new();
            let result = executor
                .run(def)
                .and_then(|output| formatter.render(def, output, &mut section))
                .and_then(|()| sink.write_all(&section).map_err(QueryBookError::from));

            match result {
                Ok(()) => break EntryStatus::Succeeded,
                Err(err)
                    if err.is_retryable() && kind.is_read() && attempts < self.retry.max_attempts =>
                {
                    let delay = self.retry.delay_for(attempts);
                    log::warn!(
                        "Query '{}' attempt {attempts} failed ({err}); retrying in {}ms",
                        def.id,
                        delay.as_millis()
                    );
                    std::thread::sleep(delay);
                }
                Err(err) => {
                    log::error!("Query '{}' failed: {err}", def.id);
                    report_failure(formatter, &def.id, &def.label(), &err, sink);
                    break EntryStatus::Failed(err.to_string());
                }
            }
        };
        EntryOutcome {
            id: def.id.clone(),
            kind: Some(kind),
            attempts,
            status,
        }
    }
}

fn report_failure<W: Write + ?Sized>(
    formatter: &ReportFormatter,
    id: &str,
    label: &str,
    error: &QueryBookError,
    sink: &mut W,
) {
    if let Err(e) = formatter.render_error(id, label, error, sink) {
        log::warn!("Could not write error section for '{id}': {e}");
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryStatus {
    Succeeded,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryOutcome {
    pub id: String,
    /// `None` for entries rejected at load
    pub kind: Option<QueryKind>,
    pub attempts: u32,
    pub status: EntryStatus,
}

impl EntryOutcome {
    pub fn succeeded(&self) -> bool {
        self.status == EntryStatus::Succeeded
    }
}

/// Per-entry outcomes of a run, in execution order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub outcomes: Vec<EntryOutcome>,
}

impl RunReport {
    pub fn all_succeeded(&self) -> bool {
        self.outcomes.iter().all(EntryOutcome::succeeded)
    }

    pub fn failed(&self) -> impl Iterator<Item = &EntryOutcome> {
        self.outcomes.iter().filter(|o| !o.succeeded())
    }

    pub fn outcome(&self, id: &str) -> Option<&EntryOutcome> {
        self.outcomes.iter().find(|o| o.id == id)
    }
}

/// Parses a YAML catalog (a sequence of definitions) and validates every
/// entry against the registry.
pub struct CatalogLoader<'r> {
    registry: &'r SchemaRegistry,
}

impl<'r> CatalogLoader<'r> {
    pub fn new(registry: &'r SchemaRegistry) -> Self {
        CatalogLoader { registry }
    }

    pub fn load_file(&self, path: &Path) -> Result<QueryCatalog> {
        let content = std::fs::read_to_string(path)?;
        self.load_str(&content)
    }

    /// Malformed or invalid entries are kept as rejected; only a document
    /// that is not a sequence, or a duplicated id, fails the whole load.
    pub fn load_str(&self, content: &str) -> Result<QueryCatalog> {
        let entries: Vec<serde_yaml::Value> = serde_yaml::from_str(content)?;
        let mut catalog = QueryCatalog::new();

        for (position, entry) in entries.into_iter().enumerate() {
            let id = entry
                .get("id")
                .and_then(|id| match id {
                    serde_yaml::Value::String(s) => Some(s.clone()),
                    serde_yaml::Value::Number(n) => Some(n.to_string()),
                    _ => None,
                })
                .unwrap_or_else(|| format!("#{}", position + 1));

            let checked = serde_yaml::from_value::<QueryDefinition>(entry)
                .map_err(QueryBookError::from)
                .and_then(|def| {
                    validate(&def, self.registry)?;
                    Ok(def)
                });
            match checked {
                Ok(def) => catalog.add(def)?,
                Err(error) => {
                    log::warn!("Rejecting catalog entry '{id}': {error}");
                    catalog.reject(RejectedEntry { id, error })?;
                }
            }
        }

        log::info!(
            "Loaded {} queries ({} rejected)",
            catalog.len(),
            catalog.rejected().count()
        );
        Ok(catalog)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Filter, FindQuery, Pipeline, UpdateDoc};
    use crate::report::ReportStyle;
    use crate::store::{Capabilities, RowStream, StoreDriver, UpdateSummary};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::cell::Cell;

    /// Fails the first `outages` calls with `StoreUnavailable`.
    struct FlakyStore {
        capabilities: Capabilities,
        outages: Cell<u32>,
        calls: Cell<u32>,
    }

    impl FlakyStore {
        fn new(outages: u32) -> Self {
            FlakyStore {
                capabilities: Capabilities::full(),
                outages: Cell::new(outages),
                calls: Cell::new(0),
            }
        }

        fn call(&self) -> Result<()> {
            self.calls.set(self.calls.get() + 1);
            if self.outages.get() > 0 {
                self.outages.set(self.outages.get() - 1);
                return Err(QueryBookError::StoreUnavailable("connection reset".into()));
            }
            Ok(())
        }
    }

    impl StoreDriver for FlakyStore {
        fn capabilities(&self) -> &Capabilities {
            &self.capabilities
        }

        fn find<'a>(&'a self, _: &str, _: &FindQuery, _: Option<Duration>) -> Result<RowStream<'a>> {
            self.call()?;
            Ok(Box::new(vec![Ok(json!({"nombre": "Ana"}))].into_iter()))
        }

        fn aggregate<'a>(&'a self, _: &str, _: &Pipeline, _: Option<Duration>) -> Result<RowStream<'a>> {
            self.call()?;
            Ok(Box::new(std::iter::empty()))
        }

        fn update_one(&self, _: &str, _: &Filter, _: &UpdateDoc, _: Option<Duration>) -> Result<UpdateSummary> {
            self.call()?;
            Ok(UpdateSummary { matched: 1, modified: 1 })
        }

        fn update_many(&self, c: &str, f: &Filter, u: &UpdateDoc, t: Option<Duration>) -> Result<UpdateSummary> {
            self.update_one(c, f, u, t)
        }
    }

    fn registry() -> SchemaRegistry {
        SchemaRegistry::from_yaml_str(
            "collections:\n  clientes:\n    fields:\n      nombre: { type: string }\n      activo: { type: boolean }\n",
        )
        .unwrap()
    }

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::ZERO,
        }
    }

    #[test]
    fn test_duplicate_id() {
        let mut catalog = QueryCatalog::new();
        catalog.add(QueryDefinition::find("1.1", "clientes", json!({}))).unwrap();
        let err = catalog
            .add(QueryDefinition::find("1.1", "clientes", json!({"activo": true})))
            .unwrap_err();
        assert!(matches!(err, QueryBookError::DuplicateId(id) if id == "1.1"));
        assert_eq!(catalog.len(), 1);
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_millis(50),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(50));
        assert_eq!(policy.delay_for(3), Duration::from_millis(200));
    }

    #[test]
    fn test_read_entry_retried_until_success() {
        let registry = registry();
        let store = FlakyStore::new(2);
        let executor = Executor::new(&registry, &store);
        let mut catalog = QueryCatalog::new().with_retry(fast_retry(3));
        catalog.add(QueryDefinition::find("1.2", "clientes", json!({}))).unwrap();

        let mut sink = Vec::new();
        let report = catalog.run_all(&executor, &ReportFormatter::default(), &mut sink);
        assert!(report.all_succeeded());
        assert_eq!(report.outcomes[0].attempts, 3);
        assert_eq!(store.calls.get(), 3);
        let text = String::from_utf8(sink).unwrap();
        assert_eq!(text.matches("=== 1.2 ===").count(), 1);
    }

    #[test]
    fn test_update_entry_never_retried() {
        let registry = registry();
        let store = FlakyStore::new(1);
        let executor = Executor::new(&registry, &store);
        let mut catalog = QueryCatalog::new().with_retry(fast_retry(5));
        catalog
            .add(QueryDefinition::update(
                "12.4",
                "clientes",
                json!({"nombre": "Ana"}),
                json!({"$set": {"activo": false}}),
                false,
            ))
            .unwrap();

        let report = catalog.run_all(&executor, &ReportFormatter::default(), &mut Vec::new());
        assert_eq!(report.outcomes[0].attempts, 1);
        assert!(matches!(&report.outcomes[0].status, EntryStatus::Failed(m) if m.contains("connection reset")));
    }

    #[test]
    fn test_loader_keeps_rejected_entries_in_order() {
        let registry = registry();
        let catalog = CatalogLoader::new(&registry)
            .load_str(
                r#"
- id: "1.1"
  collection: clientes
  kind: find
  filter: { nombre: Ana }
- id: "1.2"
  collection: clientes
  kind: find
  filter: { email: ana@mail.com }
- id: "1.3"
  collection: clientes
  kind: delete
- id: "1.4"
  collection: clientes
  kind: aggregate
  pipeline: [ { $count: total } ]
"#,
            )
            .unwrap();
        assert_eq!(catalog.ids(), vec!["1.1", "1.4"]);
        let rejected: Vec<&str> = catalog.rejected().map(|r| r.id.as_str()).collect();
        assert_eq!(rejected, vec!["1.2", "1.3"]);
        assert!(matches!(
            &catalog.rejected().next().unwrap().error,
            QueryBookError::Validation(v) if v.paths() == vec!["email"]
        ));

        let store = FlakyStore::new(0);
        let executor = Executor::new(&registry, &store);
        let mut sink = Vec::new();
        let report = catalog.run_all(
            &executor,
            &ReportFormatter::new(ReportStyle::Structured),
            &mut sink,
        );
        let ids: Vec<&str> = report.outcomes.iter().map(|o| o.id.as_str()).collect();
        assert_eq!(ids, vec!["1.1", "1.2", "1.3", "1.4"]);
        let failed: Vec<&str> = report.failed().map(|o| o.id.as_str()).collect();
        assert_eq!(failed, vec!["1.2", "1.3"]);
    }

    #[test]
    fn test_run_selected() {
        let registry = registry();
        let store = FlakyStore::new(0);
        let executor = Executor::new(&registry, &store);
        let mut catalog = QueryCatalog::new();
        for id in ["a", "b", "c"] {
            catalog.add(QueryDefinition::find(id, "clientes", json!({}))).unwrap();
        }
        let formatter = ReportFormatter::default();
        let report = catalog
            .run_selected(&["c".to_string(), "a".to_string()], &executor, &formatter, &mut Vec::new())
            .unwrap();
        let ids: Vec<&str> = report.outcomes.iter().map(|o| o.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);

        assert!(catalog
            .run_selected(&["z".to_string()], &executor, &formatter, &mut Vec::new())
            .is_err());
    }
}
