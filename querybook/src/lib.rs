pub mod catalog;
pub mod engine;
pub mod error;
pub mod executor;
pub mod optica;
pub mod project;
pub mod query;
pub mod report;
pub mod schema;
pub mod store;
pub mod validation;

pub use catalog::{CatalogLoader, EntryOutcome, EntryStatus, QueryCatalog, RetryPolicy, RunReport};
pub use error::{QueryBookError, Result};
pub use executor::{ExecutionOutput, Executor, Plan, Row, Rows};
pub use project::{Project, ProjectConfig};
pub use query::{QueryDefinition, QueryKind};
pub use report::{ReportFormatter, ReportStyle};
pub use schema::SchemaRegistry;
pub use store::{Capabilities, SqliteStore, StoreDriver, UpdateSummary};
