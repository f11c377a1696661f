use thiserror::Error;

/// Main error type for the memquery engine
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Plan error: {0}")]
    Plan(#[from] PlanError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Load error: {0}")]
    Load(#[from] LoadError),

    #[error("Query returned {0} results where at most one was expected")]
    NonUniqueResult(usize),

    #[error("Invalid plan state: {0}")]
    InvalidPlanState(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Malformed query plans, detected while the plan is being built
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PlanError {
    #[error("Table not found: {0}")]
    UnknownTable(String),

    #[error("Alias '{0}' is not bound in this query")]
    UnboundAlias(String),

    #[error("Alias '{0}' is already bound in this query")]
    DuplicateAlias(String),

    #[error("Column '{column}' does not exist on '{alias}'")]
    UnknownColumn { alias: String, column: String },

    #[error("Association '{association}' does not exist on '{alias}'")]
    UnknownAssociation { alias: String, association: String },

    #[error("Association '{association}' references {expected}, not {actual}")]
    AssociationTarget {
        association: String,
        expected: String,
        actual: String,
    },

    #[error("Fetch join on '{0}' requires a join through an association")]
    FetchWithoutAssociation(String),

    #[error("Aggregate not allowed here: {0}")]
    MisplacedAggregate(String),

    #[error("Invalid subquery: {0}")]
    InvalidSubquery(String),

    #[error("Invalid group by reference: {0}")]
    InvalidGroupBy(String),

    #[error("Invalid order by reference: {0}")]
    InvalidOrderBy(String),

    #[error("Subquery references outer alias '{0}'")]
    CorrelatedSubquery(String),

    #[error("Invalid projection: {0}")]
    InvalidProjection(String),

    #[error("Invalid like pattern: {0}")]
    InvalidPattern(String),

    #[error("Query has no source table")]
    MissingSource,
}

/// Row store errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum StoreError {
    #[error("Table not found: {0}")]
    TableNotFound(String),

    #[error("Table already exists: {0}")]
    TableExists(String),

    #[error("Duplicate primary key {id} in table {table}")]
    DuplicateKey { table: String, id: i64 },

    #[error("Table {table} expects {expected} values, got {actual}")]
    ArityMismatch {
        table: String,
        expected: usize,
        actual: usize,
    },

    #[error("Column {table}.{column} cannot hold value {value}")]
    TypeMismatch {
        table: String,
        column: String,
        value: String,
    },

    #[error("Column {table}.{column} does not exist")]
    UnknownColumn { table: String, column: String },

    #[error("Column {table}.{column} is not nullable")]
    NullViolation { table: String, column: String },

    #[error("No primary key left after the largest id in table {0}")]
    KeyExhausted(String),
}

/// Failures while loading table data from files
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("Failed to read {path}: {message}")]
    Io { path: String, message: String },

    #[error("Failed to parse {path}: {message}")]
    Parse { path: String, message: String },

    #[error("Unsupported data source: {0}")]
    UnsupportedSource(String),
}

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_error_from_plan_error() {
        let plan_error = PlanError::UnboundAlias("team".to_string());
        let engine_error: EngineError = plan_error.into();

        match engine_error {
            EngineError::Plan(PlanError::UnboundAlias(alias)) => assert_eq!(alias, "team"),
            _ => panic!("Expected Plan error"),
        }
    }

    #[test]
    fn test_engine_error_from_store_error() {
        let store_error = StoreError::TableNotFound("Club".to_string());
        let engine_error: EngineError = store_error.into();

        match engine_error {
            EngineError::Store(StoreError::TableNotFound(table)) => assert_eq!(table, "Club"),
            _ => panic!("Expected Store error"),
        }
    }

    #[test]
    fn test_error_display() {
        let error = EngineError::NonUniqueResult(4);
        assert!(error.to_string().contains("returned 4 results"));

        let error = EngineError::Plan(PlanError::UnknownColumn {
            alias: "member".to_string(),
            column: "email".to_string(),
        });
        assert!(error.to_string().contains("Column 'email' does not exist on 'member'"));
    }

    #[test]
    fn test_engine_result_type() {
        let failure: EngineResult<String> = Err(EngineError::InvalidPlanState("reused".to_string()));

        match failure {
            Err(EngineError::InvalidPlanState(msg)) => assert_eq!(msg, "reused"),
            _ => panic!("Expected InvalidPlanState error"),
        }
    }
}
