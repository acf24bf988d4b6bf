use super::{Capabilities, RowStream, StoreDriver, UpdateSummary, MAX_TIMEOUT};
use crate::engine::{run_pipeline, CollectionSource, Deadline, Filter, FindQuery, Pipeline, UpdateDoc};
use crate::error::{QueryBookError, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::Path;
use std::time::Duration;

/// Embedded document store: one SQLite table of JSON documents, with
/// queries evaluated in-process by the engine.
pub struct SqliteStore {
    conn: Connection,
    capabilities: Capabilities,
    label: String,
}

impl SqliteStore {
    /// Open or create the store database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| {
            QueryBookError::StoreUnavailable(format!("cannot open {}: {e}", path.display()))
        })?;
        Self::init(conn, path.display().to_string())
    }

    /// Open an in-memory store (demo and tests).
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?, ":memory:".to_string())
    }

    fn init(conn: Connection, label: String) -> Result<Self> {
        let store = SqliteStore {
            conn,
            capabilities: Capabilities::full(),
            label,
        };
        store.initialize_tables()?;
        log::debug!("Opened document store {}", store.label);
        Ok(store)
    }

    /// Restrict what this store accepts.
    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    fn initialize_tables(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS documents (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                collection TEXT NOT NULL,
                id TEXT NOT NULL,
                data_json TEXT NOT NULL,
                UNIQUE (collection, id)
            );

            CREATE INDEX IF NOT EXISTS idx_documents_collection ON documents(collection);

            CREATE TABLE IF NOT EXISTS seed_state (
                collection TEXT PRIMARY KEY,
                hash TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            ",
        )?;
        Ok(())
    }

    fn arm(&self, timeout: Option<Duration>) -> Result<Deadline> {
        if let Some(timeout) = timeout {
            if timeout > MAX_TIMEOUT {
                return Err(QueryBookError::Config(format!(
                    "timeout of {}ms exceeds the maximum of {}ms",
                    timeout.as_millis(),
                    MAX_TIMEOUT.as_millis()
                )));
            }
            self.conn.busy_timeout(timeout)?;
        }
        Ok(Deadline::after(timeout))
    }

    // ── Documents ────────────────────────────────────────────────────

    /// Insert documents in order. A document without `_id` gets a fresh ULID.
    pub fn insert_many(&self, collection: &str, docs: Vec<Value>) -> Result<usize> {
        let tx = self.conn.unchecked_transaction()?;
        let mut inserted = 0;
        for mut doc in docs {
            let Some(map) = doc.as_object_mut() else {
                return Err(QueryBookError::Other(format!(
                    "documents in '{collection}' must be objects"
                )));
            };
            let id = match map.get("_id") {
                Some(Value::String(id)) => id.clone(),
                Some(other) => other.to_string(),
                None => {
                    let id = ulid::Ulid::new().to_string();
                    map.insert("_id".to_string(), Value::String(id.clone()));
                    id
                }
            };
            let data_json = serde_json::to_string(&doc)?;
            tx.execute(
                "INSERT INTO documents (collection, id, data_json) VALUES (?1, ?2, ?3)",
                params![collection, id, data_json],
            )
            .map_err(|e| match e.sqlite_error_code() {
                Some(rusqlite::ErrorCode::ConstraintViolation) => QueryBookError::Other(format!(
                    "duplicate _id '{id}' in collection '{collection}'"
                )),
                _ => e.into(),
            })?;
            inserted += 1;
        }
        tx.commit()?;
        Ok(inserted)
    }

    /// Every document of a collection in insertion order.
    pub fn load_collection(&self, collection: &str) -> Result<Vec<Value>> {
        Ok(self
            .load_records(collection)?
            .into_iter()
            .map(|(_, doc)| doc)
            .collect())
    }

    fn load_records(&self, collection: &str) -> Result<Vec<(i64, Value)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT seq, data_json FROM documents WHERE collection = ?1 ORDER BY seq")?;
        let rows = stmt.query_map(params![collection], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut docs = Vec::new();
        for row in rows {
            let (seq, data_json) = row?;
            docs.push((seq, serde_json::from_str(&data_json)?));
        }
        Ok(docs)
    }

    fn replace_record(&self, seq: i64, doc: &Value) -> Result<()> {
        self.conn.execute(
            "UPDATE documents SET data_json = ?1 WHERE seq = ?2",
            params![serde_json::to_string(doc)?, seq],
        )?;
        Ok(())
    }

    pub fn count(&self, collection: &str) -> Result<u64> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM documents WHERE collection = ?1",
            params![collection],
            |row| row.get(0),
        )?;
        Ok(n as u64)
    }

    pub fn clear_collection(&self, collection: &str) -> Result<()> {
        self.conn.execute(
            "DELETE FROM documents WHERE collection = ?1",
            params![collection],
        )?;
        Ok(())
    }

    /// Drop every document and seed marker.
    pub fn clear_all(&self) -> Result<()> {
        self.conn
            .execute_batch("DELETE FROM documents; DELETE FROM seed_state;")?;
        Ok(())
    }

    // ── Seed State ───────────────────────────────────────────────────

    pub fn seed_hash(&self, collection: &str) -> Result<Option<String>> {
        let result = self
            .conn
            .query_row(
                "SELECT hash FROM seed_state WHERE collection = ?1",
                params![collection],
                |row| row.get(0),
            )
            .optional()?;
        Ok(result)
    }

    pub fn set_seed_hash(&self, collection: &str, hash: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO seed_state (collection, hash) VALUES (?1, ?2)",
            params![collection, hash],
        )?;
        Ok(())
    }

    fn update(
        &self,
        collection: &str,
        filter: &Filter,
        update: &UpdateDoc,
        timeout: Option<Duration>,
        multi: bool,
    ) -> Result<UpdateSummary> {
        let deadline = self.arm(timeout)?;
        let tx = self.conn.unchecked_transaction()?;
        let mut summary = UpdateSummary::default();

        for (seq, mut doc) in self.load_records(collection)? {
            deadline.check()?;
            if !filter.matches(&doc).map_err(QueryBookError::execution)? {
                continue;
            }
            summary.matched += 1;
            if update.apply(&mut doc).map_err(QueryBookError::execution)? {
                self.replace_record(seq, &doc)?;
                summary.modified += 1;
            }
            if !multi {
                break;
            }
        }

        tx.commit()?;
        log::debug!(
            "update on '{collection}': matched {}, modified {}",
            summary.matched,
            summary.modified
        );
        Ok(summary)
    }
}

impl CollectionSource for SqliteStore {
    fn scan(&self, collection: &str, deadline: &Deadline) -> Result<Vec<Value>> {
        deadline.check()?;
        self.load_collection(collection)
    }
}

impl StoreDriver for SqliteStore {
    fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    fn find<'a>(
        &'a self,
        collection: &str,
        query: &FindQuery,
        timeout: Option<Duration>,
    ) -> Result<RowStream<'a>> {
        let deadline = self.arm(timeout)?;
        let docs = self.scan(collection, &deadline)?;
        let rows = query.evaluate(docs, &deadline)?;
        Ok(Box::new(rows.into_iter().map(Ok)))
    }

    fn aggregate<'a>(
        &'a self,
        collection: &str,
        pipeline: &Pipeline,
        timeout: Option<Duration>,
    ) -> Result<RowStream<'a>> {
        let deadline = self.arm(timeout)?;
        let docs = self.scan(collection, &deadline)?;
        let rows = run_pipeline(docs, pipeline, self, &deadline)?;
        Ok(Box::new(rows.into_iter().map(Ok)))
    }

    fn update_one(
        &self,
        collection: &str,
        filter: &Filter,
        update: &UpdateDoc,
        timeout: Option<Duration>,
    ) -> Result<UpdateSummary> {
        self.update(collection, filter, update, timeout, false)
    }

    fn update_many(
        &self,
        collection: &str,
        filter: &Filter,
        update: &UpdateDoc,
        timeout: Option<Duration>,
    ) -> Result<UpdateSummary> {
        self.update(collection, filter, update, timeout, true)
    }
}

impl Drop for SqliteStore {
    fn drop(&mut self) {
        log::debug!("Closing document store {}", self.label);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Predicate, UpdateOp};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn store_with_citas() -> SqliteStore {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .insert_many(
                "citas",
                vec![
                    json!({"_id": "a1", "estado": "programada"}),
                    json!({"_id": "a2", "estado": "programada"}),
                    json!({"_id": "a3", "estado": "completada"}),
                ],
            )
            .unwrap();
        store
    }

    fn confirmar() -> UpdateDoc {
        UpdateDoc::new(vec![UpdateOp::Set {
            path: "estado".into(),
            value: json!("confirmada"),
        }])
    }

    #[test]
    fn test_insert_keeps_order_and_generates_ids() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .insert_many("clientes", vec![json!({"nombre": "Ana"}), json!({"nombre": "Luis"})])
            .unwrap();
        let docs = store.load_collection("clientes").unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0]["nombre"], json!("Ana"));
        assert_eq!(docs[0]["_id"].as_str().unwrap().len(), 26);
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let store = store_with_citas();
        let err = store
            .insert_many("citas", vec![json!({"_id": "a1"})])
            .unwrap_err();
        assert!(err.to_string().contains("duplicate _id 'a1'"));
        assert_eq!(store.count("citas").unwrap(), 3);
    }

    #[test]
    fn test_update_one_and_many() {
        let store = store_with_citas();
        let programada = Filter::field("estado", Predicate::Eq(json!("programada")));

        let one = store.update_one("citas", &programada, &confirmar(), None).unwrap();
        assert_eq!(one, UpdateSummary { matched: 1, modified: 1 });

        let many = store.update_many("citas", &programada, &confirmar(), None).unwrap();
        assert_eq!(many, UpdateSummary { matched: 1, modified: 1 });

        let estados: Vec<Value> = store
            .load_collection("citas")
            .unwrap()
            .into_iter()
            .map(|d| d["estado"].clone())
            .collect();
        assert_eq!(estados, vec![json!("confirmada"), json!("confirmada"), json!("completada")]);
    }

    #[test]
    fn test_update_matched_but_unmodified() {
        let store = store_with_citas();
        let done = Filter::field("estado", Predicate::Eq(json!("completada")));
        let same = UpdateDoc::new(vec![UpdateOp::Set {
            path: "estado".into(),
            value: json!("completada"),
        }]);
        let summary = store.update_many("citas", &done, &same, None).unwrap();
        assert_eq!(summary, UpdateSummary { matched: 1, modified: 0 });
    }

    #[test]
    fn test_find_streams_rows() {
        let store = store_with_citas();
        let query = FindQuery::new(Filter::field("estado", Predicate::Eq(json!("programada"))));
        let ids: Vec<Value> = store
            .find("citas", &query, Some(Duration::from_secs(5)))
            .unwrap()
            .map(|row| row.unwrap()["_id"].clone())
            .collect();
        assert_eq!(ids, vec![json!("a1"), json!("a2")]);
    }

    #[test]
    fn test_oversized_timeout_is_refused() {
        let store = store_with_citas();
        let query = FindQuery::new(Filter::field("estado", Predicate::Eq(json!("programada"))));
        for timeout in [MAX_TIMEOUT + Duration::from_millis(1), Duration::MAX] {
            assert!(matches!(
                store.find("citas", &query, Some(timeout)),
                Err(QueryBookError::Config(_))
            ));
        }
        assert!(store.find("citas", &query, Some(MAX_TIMEOUT)).is_ok());
    }

    #[test]
    fn test_seed_hash_roundtrip_and_clear() {
        let store = store_with_citas();
        assert!(store.seed_hash("citas").unwrap().is_none());
        store.set_seed_hash("citas", "abc").unwrap();
        assert_eq!(store.seed_hash("citas").unwrap(), Some("abc".to_string()));

        store.clear_all().unwrap();
        assert!(store.seed_hash("citas").unwrap().is_none());
        assert_eq!(store.count("citas").unwrap(), 0);
    }

    #[test]
    fn test_persists_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("_store.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.insert_many("asesores", vec![json!({"_id": "s1"})]).unwrap();
        }
        let reopened = SqliteStore::open(&path).unwrap();
        assert_eq!(reopened.count("asesores").unwrap(), 1);
    }
}
