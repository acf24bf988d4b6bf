//! The document store seen through a small capability-checked driver trait.

mod seed;
mod sqlite;

pub use seed::{normalize_document, seed_collection, seed_directory, SeedReport};
pub use sqlite::SqliteStore;

use crate::engine::{Filter, FindQuery, Pipeline, UpdateDoc};
use crate::error::Result;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::time::Duration;

/// Longest per-call timeout a driver accepts (SQLite's busy timeout is an
/// `i32` of milliseconds).
pub const MAX_TIMEOUT: Duration = Duration::from_millis(i32::MAX as u64);

/// One-pass stream of result documents. The bundled [`SqliteStore`]
/// evaluates the whole query before handing back the stream.
pub type RowStream<'a> = Box<dyn Iterator<Item = Result<Value>> + 'a>;

/// Outcome of an update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpdateSummary {
    pub matched: u64,
    pub modified: u64,
}

const ALL_STAGES: &[&str] = &[
    "$match",
    "$project",
    "$addFields",
    "$unwind",
    "$group",
    "$sort",
    "$limit",
    "$skip",
    "$lookup",
    "$count",
];

const ALL_UPDATE_OPERATORS: &[&str] = &["$set", "$unset", "$inc", "$mul", "$push"];

/// What a driver can execute. The translator refuses anything outside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capabilities {
    stages: BTreeSet<String>,
    update_operators: BTreeSet<String>,
}

impl Capabilities {
    pub fn full() -> Self {
        Capabilities {
            stages: ALL_STAGES.iter().map(|s| s.to_string()).collect(),
            update_operators: ALL_UPDATE_OPERATORS.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn without_stage(mut self, stage: &str) -> Self {
        self.stages.remove(stage);
        self
    }

    pub fn without_update_operator(mut self, operator: &str) -> Self {
        self.update_operators.remove(operator);
        self
    }

    pub fn supports_stage(&self, stage: &str) -> bool {
        self.stages.contains(stage)
    }

    pub fn supports_update_operator(&self, operator: &str) -> bool {
        self.update_operators.contains(operator)
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Capabilities::full()
    }
}

/// A document store the executor can submit native operations to.
///
/// Every call takes the caller's timeout; exceeding it fails with
/// [`QueryBookError::StoreUnavailable`](crate::QueryBookError::StoreUnavailable).
pub trait StoreDriver {
    fn capabilities(&self) -> &Capabilities;

    fn find<'a>(
        &'a self,
        collection: &str,
        query: &FindQuery,
        timeout: Option<Duration>,
    ) -> Result<RowStream<'a>>;

    fn aggregate<'a>(
        &'a self,
        collection: &str,
        pipeline: &Pipeline,
        timeout: Option<Duration>,
    ) -> Result<RowStream<'a>>;

    fn update_one(
        &self,
        collection: &str,
        filter: &Filter,
        update: &UpdateDoc,
        timeout: Option<Duration>,
    ) -> Result<UpdateSummary>;

    fn update_many(
        &self,
        collection: &str,
        filter: &Filter,
        update: &UpdateDoc,
        timeout: Option<Duration>,
    ) -> Result<UpdateSummary>;
}
