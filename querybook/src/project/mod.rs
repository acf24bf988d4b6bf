//! A querybook project: schema, catalog, optional settings and the seeded
//! document store, opened together.
//!
//! ```text
//! my-project/
//!   schema.yaml       collections
//!   catalog.yaml      query definitions
//!   querybook.yaml    optional settings
//!   data/*.json       fixtures, one JSON array per collection
//!   _store.db         created on first open
//! ```

use crate::catalog::{CatalogLoader, QueryCatalog, RetryPolicy};
use crate::error::{QueryBookError, Result};
use crate::executor::Executor;
use crate::optica;
use crate::report::{ReportFormatter, ReportStyle};
use crate::schema::{parse_schema, SchemaRegistry};
use crate::store::{seed_collection, seed_directory, SeedReport, SqliteStore, MAX_TIMEOUT};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const SCHEMA_FILE: &str = "schema.yaml";
const CATALOG_FILE: &str = "catalog.yaml";
const CONFIG_FILE: &str = "querybook.yaml";
const DATA_DIR: &str = "data";
const STORE_FILE: &str = "_store.db";
const SCHEMA_HASH_KEY: &str = "$schema";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        RetryConfig {
            max_attempts: policy.max_attempts,
            base_delay_ms: policy.base_delay.as_millis() as u64,
        }
    }
}

/// Contents of `querybook.yaml`. Every key is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProjectConfig {
    /// Per store call; unset means no limit
    pub timeout_ms: Option<u64>,
    pub retry: RetryConfig,
    pub style: ReportStyle,
}

impl ProjectConfig {
    /// Read the config file; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(ProjectConfig::default());
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: ProjectConfig = serde_yaml::from_str(content)
            .map_err(|e| QueryBookError::Config(format!("{CONFIG_FILE}: {e}")))?;
        if config.retry.max_attempts == 0 {
            return Err(QueryBookError::Config(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        check_timeout(config.timeout_ms)?;
        Ok(config)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
        }
    }
}

fn check_timeout(timeout_ms: Option<u64>) -> Result<()> {
    match timeout_ms {
        Some(ms) if Duration::from_millis(ms) > MAX_TIMEOUT => Err(QueryBookError::Config(format!(
            "timeout_ms must be at most {}, got {ms}",
            MAX_TIMEOUT.as_millis()
        ))),
        _ => Ok(()),
    }
}

/// Where `reset` reloads fixtures from.
#[derive(Debug)]
enum Fixtures {
    Directory(PathBuf),
    Bundled,
}

pub struct Project {
    registry: SchemaRegistry,
    catalog: QueryCatalog,
    config: ProjectConfig,
    store: SqliteStore,
    fixtures: Fixtures,
    schema_hash: Option<String>,
}

fn hash_schema(content: &str) -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    content.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

impl Project {
    /// Open a project directory, creating its store on first use and
    /// reseeding fixtures that changed since the last open.
    pub fn open(path: &Path) -> Result<Self> {
        let root = path.to_path_buf();
        if !root.exists() {
            return Err(QueryBookError::Other(format!(
                "Data directory does not exist: {}",
                root.display()
            )));
        }

        let schema_path = root.join(SCHEMA_FILE);
        if !schema_path.exists() {
            return Err(QueryBookError::Schema(format!(
                "{SCHEMA_FILE} not found in {}",
                root.display()
            )));
        }
        let schema_yaml = std::fs::read_to_string(&schema_path)?;
        let registry = parse_schema(&schema_path)?.into_registry()?;

        let catalog_path = root.join(CATALOG_FILE);
        if !catalog_path.exists() {
            return Err(QueryBookError::Config(format!(
                "{CATALOG_FILE} not found in {}",
                root.display()
            )));
        }
        let config = ProjectConfig::load(&root.join(CONFIG_FILE))?;
        let catalog = CatalogLoader::new(&registry)
            .load_file(&catalog_path)?
            .with_retry(config.retry_policy());

        let store = SqliteStore::open(&root.join(STORE_FILE))?;
        let project = Project {
            registry,
            catalog,
            config,
            store,
            fixtures: Fixtures::Directory(root.join(DATA_DIR)),
            schema_hash: Some(hash_schema(&schema_yaml)),
        };
        project.boot()?;
        Ok(project)
    }

    /// The bundled optical-store demo, in memory.
    pub fn demo() -> Result<Self> {
        let registry = optica::registry()?;
        let catalog = optica::catalog(&registry)?;
        let project = Project {
            registry,
            catalog,
            config: ProjectConfig::default(),
            store: SqliteStore::open_in_memory()?,
            fixtures: Fixtures::Bundled,
            schema_hash: None,
        };
        project.seed(true)?;
        Ok(project)
    }

    /// A schema change invalidates every stored collection.
    fn boot(&self) -> Result<()> {
        let current = self.schema_hash.clone().unwrap_or_default();
        let last = self.store.seed_hash(SCHEMA_HASH_KEY)?;
        let changed = last.as_deref() != Some(current.as_str());
        if changed {
            log::info!("Schema changed (or first open); reseeding every collection");
            self.store.clear_all()?;
        }
        let report = self.seed(changed)?;
        self.store.set_seed_hash(SCHEMA_HASH_KEY, &current)?;
        log::debug!(
            "Seeded {} collections, {} unchanged",
            report.seeded.len(),
            report.unchanged.len()
        );
        Ok(())
    }

    fn seed(&self, force: bool) -> Result<SeedReport> {
        match &self.fixtures {
            Fixtures::Directory(dir) if dir.exists() => {
                seed_directory(&self.store, &self.registry, dir, force)
            }
            Fixtures::Directory(dir) => {
                log::warn!("No fixture directory at {}", dir.display());
                Ok(SeedReport::default())
            }
            Fixtures::Bundled => {
                let mut report = SeedReport::default();
                for (collection, docs) in optica::fixtures()? {
                    let schema = self.registry.schema(collection)?;
                    let count = seed_collection(&self.store, schema, docs)?;
                    report.seeded.push((collection.to_string(), count));
                }
                Ok(report)
            }
        }
    }

    /// Drop all stored documents and reload every fixture, undoing the
    /// catalog's updates.
    pub fn reset(&self) -> Result<SeedReport> {
        self.store.clear_all()?;
        let report = self.seed(true)?;
        if let Some(hash) = &self.schema_hash {
            self.store.set_seed_hash(SCHEMA_HASH_KEY, hash)?;
        }
        log::info!("Reset {} collections", report.seeded.len());
        Ok(report)
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    pub fn catalog(&self) -> &QueryCatalog {
        &self.catalog
    }

    pub fn config(&self) -> &ProjectConfig {
        &self.config
    }

    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    /// Executor over this project's store, bounded by the configured timeout.
    pub fn executor(&self) -> Executor<'_> {
        Executor::new(&self.registry, &self.store).with_timeout(self.config.timeout())
    }

    pub fn formatter(&self) -> ReportFormatter {
        ReportFormatter::new(self.config.style)
    }

    /// Command-line overrides win over `querybook.yaml`.
    pub fn override_config(
        &mut self,
        timeout_ms: Option<u64>,
        style: Option<ReportStyle>,
    ) -> Result<()> {
        check_timeout(timeout_ms)?;
        if timeout_ms.is_some() {
            self.config.timeout_ms = timeout_ms;
        }
        if let Some(style) = style {
            self.config.style = style;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn write_project(dir: &Path) {
        std::fs::write(
            dir.join(SCHEMA_FILE),
            "collections:\n  clientes:\n    fields:\n      nombre: { type: string }\n      activo: { type: boolean }\n",
        )
        .unwrap();
        std::fs::write(
            dir.join(CATALOG_FILE),
            "- id: \"1.2\"\n  collection: clientes\n  kind: find\n  filter: { activo: true }\n",
        )
        .unwrap();
        std::fs::create_dir(dir.join(DATA_DIR)).unwrap();
        std::fs::write(
            dir.join(DATA_DIR).join("clientes.json"),
            r#"[{"_id": "c1", "nombre": "Ana", "activo": true}, {"_id": "c2", "nombre": "Luis", "activo": false}]"#,
        )
        .unwrap();
    }

    #[test]
    fn test_config_defaults_and_overrides() {
        let config = ProjectConfig::from_yaml_str("timeout_ms: 250\nretry:\n  max_attempts: 5\nstyle: structured\n").unwrap();
        assert_eq!(config.timeout(), Some(Duration::from_millis(250)));
        assert_eq!(config.retry_policy().max_attempts, 5);
        assert_eq!(config.retry_policy().base_delay, Duration::from_millis(100));
        assert_eq!(config.style, ReportStyle::Structured);

        assert!(matches!(
            ProjectConfig::from_yaml_str("retry: { max_attempts: 0 }"),
            Err(QueryBookError::Config(_))
        ));
        assert!(matches!(
            ProjectConfig::from_yaml_str("colour: red"),
            Err(QueryBookError::Config(_))
        ));
    }

    #[test]
    fn test_timeout_out_of_range() {
        assert!(ProjectConfig::from_yaml_str("timeout_ms: 2147483647").is_ok());
        for yaml in ["timeout_ms: 3000000000", "timeout_ms: 18446744073709551615"] {
            assert!(matches!(
                ProjectConfig::from_yaml_str(yaml),
                Err(QueryBookError::Config(_))
            ));
        }

        let mut project = Project::demo().unwrap();
        assert!(matches!(
            project.override_config(Some(u64::MAX), None),
            Err(QueryBookError::Config(_))
        ));
        assert_eq!(project.config().timeout_ms, None);
        project.override_config(Some(500), Some(ReportStyle::Structured)).unwrap();
        assert_eq!(project.config().timeout(), Some(Duration::from_millis(500)));
    }

    #[test]
    fn test_open_seeds_and_runs() {
        let dir = tempfile::tempdir().unwrap();
        write_project(dir.path());

        let project = Project::open(dir.path()).unwrap();
        assert_eq!(project.catalog().ids(), vec!["1.2"]);
        assert_eq!(project.store().count("clientes").unwrap(), 2);

        let mut out = Vec::new();
        let report = project
            .catalog()
            .run_all(&project.executor(), &project.formatter(), &mut out);
        assert!(report.all_succeeded());
        assert!(String::from_utf8(out).unwrap().contains("Ana"));
    }

    #[test]
    fn test_reset_undoes_updates() {
        let dir = tempfile::tempdir().unwrap();
        write_project(dir.path());
        let project = Project::open(dir.path()).unwrap();
        project.store().clear_collection("clientes").unwrap();
        assert_eq!(project.store().count("clientes").unwrap(), 0);

        let report = project.reset().unwrap();
        assert_eq!(report.seeded, vec![("clientes".to_string(), 2)]);
        assert_eq!(project.store().count("clientes").unwrap(), 2);
    }

    #[test]
    fn test_missing_schema() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            Project::open(dir.path()),
            Err(QueryBookError::Schema(_))
        ));
    }
}
