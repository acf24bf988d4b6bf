use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueryBookError {
    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Duplicate schema: collection '{0}' is already registered")]
    DuplicateSchema(String),

    #[error("Duplicate field '{field}' in collection '{collection}'")]
    DuplicateField { collection: String, field: String },

    #[error("Unknown collection: {0}")]
    UnknownCollection(String),

    #[error("Unknown field '{path}' in collection '{collection}'")]
    UnknownField { collection: String, path: String },

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Duplicate query id: {0}")]
    DuplicateId(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Translation error: {0}")]
    Translation(String),

    #[error("Execution error{}: {message}", stage_suffix(.stage))]
    Execution { stage: Option<usize>, message: String },

    #[error("Empty result: no rows to infer column headers from")]
    EmptyResult,

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

fn stage_suffix(stage: &Option<usize>) -> String {
    match stage {
        Some(index) => format!(" at stage {index}"),
        None => String::new(),
    }
}

impl QueryBookError {
    /// Only transport-level failures are worth retrying; everything else is a
    /// defect in a definition, schema or document.
    pub fn is_retryable(&self) -> bool {
        matches!(self, QueryBookError::StoreUnavailable(_))
    }

    pub(crate) fn execution(message: impl Into<String>) -> Self {
        QueryBookError::Execution {
            stage: None,
            message: message.into(),
        }
    }
}

impl From<rusqlite::Error> for QueryBookError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        match err.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy)
            | Some(ErrorCode::DatabaseLocked)
            | Some(ErrorCode::CannotOpen)
            | Some(ErrorCode::SystemIoFailure)
            | Some(ErrorCode::OperationInterrupted) => {
                QueryBookError::StoreUnavailable(err.to_string())
            }
            _ => QueryBookError::execution(err.to_string()),
        }
    }
}

/// A single field reference that failed to resolve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathProblem {
    /// Where in the definition the reference appeared, e.g. `filter` or `pipeline[2].$group`
    pub location: String,
    pub path: String,
    pub reason: String,
}

/// Every unresolved field reference of one definition, collected in one pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub query_id: String,
    pub problems: Vec<PathProblem>,
}

impl ValidationError {
    /// The offending paths, in the order they were found.
    pub fn paths(&self) -> Vec<&str> {
        self.problems.iter().map(|p| p.path.as_str()).collect()
    }

    pub fn contains_path(&self, path: &str) -> bool {
        self.problems.iter().any(|p| p.path == path)
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Query '{}' failed validation ({} problem{}):",
            self.query_id,
            self.problems.len(),
            if self.problems.len() == 1 { "" } else { "s" }
        )?;
        for problem in &self.problems {
            write!(
                f,
                "\n  - {} '{}': {}",
                problem.location, problem.path, problem.reason
            )?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationError {}

pub type Result<T> = std::result::Result<T, QueryBookError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_store_unavailable_is_retryable() {
        assert!(QueryBookError::StoreUnavailable("timeout".into()).is_retryable());
        assert!(!QueryBookError::Translation("$facet".into()).is_retryable());
        assert!(!QueryBookError::execution("type mismatch").is_retryable());
        assert!(!QueryBookError::EmptyResult.is_retryable());
    }

    #[test]
    fn test_execution_error_mentions_stage() {
        let err = QueryBookError::Execution {
            stage: Some(2),
            message: "can't $divide by zero".into(),
        };
        assert_eq!(
            err.to_string(),
            "Execution error at stage 2: can't $divide by zero"
        );
    }

    #[test]
    fn test_validation_error_lists_every_path() {
        let err = ValidationError {
            query_id: "6.1".into(),
            problems: vec![
                PathProblem {
                    location: "filter".into(),
                    path: "stock.actaul".into(),
                    reason: "unknown field".into(),
                },
                PathProblem {
                    location: "projection".into(),
                    path: "precio".into(),
                    reason: "unknown field".into(),
                },
            ],
        };
        let text = err.to_string();
        assert!(text.contains("stock.actaul"));
        assert!(text.contains("precio"));
        assert_eq!(err.paths(), vec!["stock.actaul", "precio"]);
    }
}
