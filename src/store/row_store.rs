use parking_lot::{RwLock, RwLockReadGuard};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use crate::engine::query_planner::Catalog;
use crate::utils::{
    config::StoreConfig,
    error::{EngineResult, StoreError},
    types::{Row, RowId, Schema, Value},
};

/// A row as held by the store, tagged with its id
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    pub id: RowId,
    pub row: Row,
}

#[derive(Debug)]
struct Table {
    schema: Arc<Schema>,
    rows: Vec<StoredRow>,
    next_id: i64,
}

#[derive(Debug, Default)]
struct Tables {
    by_name: HashMap<String, Table>,
    /// Creation order, used for listing
    order: Vec<String>,
}

impl Tables {
    fn table(&self, name: &str) -> Result<&Table, StoreError> {
        self.by_name
            .get(name)
            .ok_or_else(|| StoreError::TableNotFound(name.to_string()))
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut Table, StoreError> {
        self.by_name
            .get_mut(name)
            .ok_or_else(|| StoreError::TableNotFound(name.to_string()))
    }
}

/// In-memory row store.
///
/// All tables sit behind one reader/writer lock: inserts and deletes take it
/// exclusively, while a query holds a [`Snapshot`] (a shared guard) for its
/// whole execution, subqueries included.
#[derive(Debug)]
pub struct RowStore {
    tables: RwLock<Tables>,
    auto_increment_start: i64,
}

impl RowStore {
    pub fn new() -> Self {
        Self::with_config(&StoreConfig::default())
    }

    pub fn with_config(config: &StoreConfig) -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            auto_increment_start: config.auto_increment_start,
        }
    }

    /// Register a table
    pub fn create_table(&self, schema: Schema) -> EngineResult<()> {
        let mut tables = self.tables.write();
        if tables.by_name.contains_key(&schema.name) {
            return Err(StoreError::TableExists(schema.name).into());
        }

        debug!(table = %schema.name, columns = schema.columns.len(), "created table");
        tables.order.push(schema.name.clone());
        tables.by_name.insert(
            schema.name.clone(),
            Table {
                schema: Arc::new(schema),
                rows: Vec::new(),
                next_id: self.auto_increment_start,
            },
        );
        Ok(())
    }

    /// Insert a row given positionally; a null primary key is generated
    pub fn insert(&self, table: &str, values: Vec<Value>) -> EngineResult<RowId> {
        let mut tables = self.tables.write();
        let table_ref = tables.table_mut(table)?;
        let schema = table_ref.schema.clone();

        if values.len() != schema.columns.len() {
            return Err(StoreError::ArityMismatch {
                table: table.to_string(),
                expected: schema.columns.len(),
                actual: values.len(),
            }
            .into());
        }

        let pk_index = schema.primary_key_index().ok_or_else(|| StoreError::UnknownColumn {
            table: table.to_string(),
            column: schema.primary_key.clone(),
        })?;

        let mut values: Vec<Value> = values
            .into_iter()
            .zip(&schema.columns)
            .map(|(value, column)| column.data_type.coerce(value))
            .collect();

        let id = match values[pk_index].clone() {
            Value::Null => {
                let id = table_ref.next_id;
                values[pk_index] = Value::Integer(id);
                id
            }
            Value::Integer(id) => id,
            other => {
                return Err(StoreError::TypeMismatch {
                    table: table.to_string(),
                    column: schema.primary_key.clone(),
                    value: other.to_string(),
                }
                .into())
            }
        };

        for (value, column) in values.iter().zip(&schema.columns) {
            if value.is_null() && !column.nullable {
                return Err(StoreError::NullViolation {
                    table: table.to_string(),
                    column: column.name.clone(),
                }
                .into());
            }
            if !column.data_type.accepts(value) {
                return Err(StoreError::TypeMismatch {
                    table: table.to_string(),
                    column: column.name.clone(),
                    value: value.to_string(),
                }
                .into());
            }
        }

        if table_ref.rows.iter().any(|r| r.id.0 == id) {
            return Err(StoreError::DuplicateKey {
                table: table.to_string(),
                id,
            }
            .into());
        }

        let following = id.checked_add(1).ok_or_else(|| StoreError::KeyExhausted(table.to_string()))?;
        table_ref.next_id = table_ref.next_id.max(following);
        table_ref.rows.push(StoredRow {
            id: RowId(id),
            row: Row::new(values),
        });

        debug!(table, id, "inserted row");
        Ok(RowId(id))
    }

    /// Insert a row given by column name; unspecified columns are null
    pub fn insert_named(&self, table: &str, values: &[(&str, Value)]) -> EngineResult<RowId> {
        let schema = self.schema(table)?;
        let mut row = vec![Value::Null; schema.columns.len()];

        for (name, value) in values {
            let index = schema.column_index(name).ok_or_else(|| StoreError::UnknownColumn {
                table: table.to_string(),
                column: name.to_string(),
            })?;
            row[index] = value.clone();
        }

        self.insert(table, row)
    }

    pub fn get(&self, table: &str, id: RowId) -> EngineResult<Option<Row>> {
        let tables = self.tables.read();
        let table_ref = tables.table(table)?;
        Ok(table_ref
            .rows
            .iter()
            .find(|r| r.id == id)
            .map(|r| r.row.clone()))
    }

    /// Remove a row, returning it if it existed
    pub fn delete(&self, table: &str, id: RowId) -> EngineResult<Option<Row>> {
        let mut tables = self.tables.write();
        let table_ref = tables.table_mut(table)?;

        let removed = table_ref
            .rows
            .iter()
            .position(|r| r.id == id)
            .map(|index| table_ref.rows.remove(index).row);

        debug!(table, id = id.0, removed = removed.is_some(), "deleted row");
        Ok(removed)
    }

    /// Remove every row of a table, returning how many were removed
    pub fn truncate(&self, table: &str) -> EngineResult<usize> {
        let mut tables = self.tables.write();
        let table_ref = tables.table_mut(table)?;
        let count = table_ref.rows.len();
        table_ref.rows.clear();
        Ok(count)
    }

    /// All rows of a table in insertion order
    pub fn scan(&self, table: &str) -> EngineResult<Vec<Row>> {
        let tables = self.tables.read();
        let table_ref = tables.table(table)?;
        Ok(table_ref.rows.iter().map(|r| r.row.clone()).collect())
    }

    pub fn row_count(&self, table: &str) -> EngineResult<usize> {
        let tables = self.tables.read();
        Ok(tables.table(table)?.rows.len())
    }

    pub fn schema(&self, table: &str) -> EngineResult<Arc<Schema>> {
        let tables = self.tables.read();
        Ok(tables.table(table)?.schema.clone())
    }

    pub fn has_table(&self, table: &str) -> bool {
        self.tables.read().by_name.contains_key(table)
    }

    /// Table names in creation order
    pub fn table_names(&self) -> Vec<String> {
        self.tables.read().order.clone()
    }

    /// Take a read-consistent view of the whole store
    pub fn snapshot(&self) -> Snapshot<'_> {
        Snapshot {
            guard: self.tables.read(),
        }
    }
}

impl Default for RowStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Catalog for RowStore {
    fn resolve_table(&self, name: &str) -> Option<Arc<Schema>> {
        self.tables.read().by_name.get(name).map(|t| t.schema.clone())
    }
}

/// Shared view of the store held for the duration of one query
pub struct Snapshot<'a> {
    guard: RwLockReadGuard<'a, Tables>,
}

impl Catalog for Snapshot<'_> {
    fn resolve_table(&self, name: &str) -> Option<Arc<Schema>> {
        self.guard.by_name.get(name).map(|t| t.schema.clone())
    }
}

impl<'a> Snapshot<'a> {
    pub fn rows(&self, table: &str) -> EngineResult<&[StoredRow]> {
        Ok(&self.guard.table(table)?.rows)
    }

    pub fn schema(&self, table: &str) -> EngineResult<&Arc<Schema>> {
        Ok(&self.guard.table(table)?.schema)
    }

    pub fn get(&self, table: &str, id: RowId) -> EngineResult<Option<&StoredRow>> {
        Ok(self.guard.table(table)?.rows.iter().find(|r| r.id == id))
    }
}
