//! Mapping of executor output into caller-facing records.

use std::sync::Arc;
use std::time::Duration;
use crate::engine::expression::Expr;
use crate::store::StoredRow;
use crate::utils::{
    error::{EngineError, EngineResult},
    types::{ColumnMetadata, Row, RowId, Schema, Value},
};

/// Whether an association's target has been materialized
#[derive(Debug, Clone, PartialEq)]
pub enum LoadState {
    /// Target was fetched together with the owner, or resolved later
    Loaded(Box<Entity>),
    /// Target exists under this id but has not been read
    NotLoaded(RowId),
    /// Foreign key is null: there is nothing to load
    Absent,
}

/// A foreign-key reference held by an entity
#[derive(Debug, Clone, PartialEq)]
pub struct Association {
    pub name: String,
    pub target_table: String,
    pub state: LoadState,
}

impl Association {
    pub fn is_loaded(&self) -> bool {
        !matches!(self.state, LoadState::NotLoaded(_))
    }

    pub fn target_id(&self) -> Option<RowId> {
        match &self.state {
            LoadState::Loaded(entity) => Some(entity.id()),
            LoadState::NotLoaded(id) => Some(*id),
            LoadState::Absent => None,
        }
    }
}

/// A materialized table row
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    schema: Arc<Schema>,
    id: RowId,
    values: Vec<Value>,
    associations: Vec<Association>,
}

impl Entity {
    /// Build an entity whose associations are all unloaded
    pub fn from_row(schema: Arc<Schema>, stored: &StoredRow) -> Self {
        let associations = schema
            .foreign_keys
            .iter()
            .map(|fk| {
                let target = schema
                    .column_index(&fk.column)
                    .and_then(|i| stored.row.get(i))
                    .and_then(Value::as_i64);
                Association {
                    name: fk.association.clone(),
                    target_table: fk.references.clone(),
                    state: match target {
                        Some(id) => LoadState::NotLoaded(RowId(id)),
                        None => LoadState::Absent,
                    },
                }
            })
            .collect();

        Self {
            id: stored.id,
            values: stored.row.values.clone(),
            associations,
            schema,
        }
    }

    pub fn table(&self) -> &str {
        &self.schema.name
    }

    pub fn id(&self) -> RowId {
        self.id
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.schema.column_index(column).and_then(|i| self.values.get(i))
    }

    pub fn get_str(&self, column: &str) -> Option<&str> {
        self.get(column).and_then(Value::as_str)
    }

    pub fn get_i64(&self, column: &str) -> Option<i64> {
        self.get(column).and_then(Value::as_i64)
    }

    pub fn associations(&self) -> &[Association] {
        &self.associations
    }

    pub fn association(&self, name: &str) -> Option<&Association> {
        self.associations.iter().find(|a| a.name == name)
    }

    /// Load-state introspection; unknown association names report false
    pub fn is_loaded(&self, name: &str) -> bool {
        self.association(name).map(Association::is_loaded).unwrap_or(false)
    }

    /// The associated entity, if it has been loaded
    pub fn related(&self, name: &str) -> Option<&Entity> {
        match &self.association(name)?.state {
            LoadState::Loaded(entity) => Some(entity),
            _ => None,
        }
    }

    pub(crate) fn mark_loaded(&mut self, name: &str, related: Entity) {
        if let Some(association) = self.associations.iter_mut().find(|a| a.name == name) {
            if association.target_id() == Some(related.id()) {
                association.state = LoadState::Loaded(Box::new(related));
            }
        }
    }
}

/// One projected value as produced by the executor
#[derive(Debug, Clone, PartialEq)]
pub enum Datum {
    Value(Value),
    /// Entity projection; `None` for the unmatched side of a left join
    Entity(Option<Entity>),
}

impl Datum {
    /// Scalar view: entities collapse to their primary key
    pub fn to_value(&self) -> Value {
        match self {
            Datum::Value(value) => value.clone(),
            Datum::Entity(entity) => entity
                .as_ref()
                .map(|e| Value::Integer(e.id().0))
                .unwrap_or(Value::Null),
        }
    }
}

/// Multi-projection result row, addressed by the projected expressions
#[derive(Debug, Clone, PartialEq)]
pub struct Tuple {
    projections: Arc<[Expr]>,
    data: Vec<Datum>,
}

impl Tuple {
    pub fn new(projections: Arc<[Expr]>, data: Vec<Datum>) -> Self {
        Self { projections, data }
    }

    fn position(&self, expr: &Expr) -> Option<usize> {
        self.projections.iter().position(|p| p == expr)
    }

    /// Value of a projected expression; entity projections yield their primary key
    pub fn get(&self, expr: &Expr) -> Option<Value> {
        self.position(expr).map(|i| self.data[i].to_value())
    }

    pub fn get_entity(&self, expr: &Expr) -> Option<&Entity> {
        match self.data.get(self.position(expr)?)? {
            Datum::Entity(entity) => entity.as_ref(),
            Datum::Value(_) => None,
        }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn data(&self) -> &[Datum] {
        &self.data
    }
}

/// Conversion from one executor output row into the caller's record type
pub trait FromProjection: Sized {
    fn from_projection(projections: &Arc<[Expr]>, data: Vec<Datum>) -> EngineResult<Self>;
}

fn single(data: Vec<Datum>) -> EngineResult<Datum> {
    let width = data.len();
    let mut data = data.into_iter();
    match (data.next(), data.next()) {
        (Some(datum), None) => Ok(datum),
        _ => Err(EngineError::Internal(format!(
            "expected a single projected value, got {}",
            width
        ))),
    }
}

impl FromProjection for Option<Entity> {
    fn from_projection(_projections: &Arc<[Expr]>, data: Vec<Datum>) -> EngineResult<Self> {
        match single(data)? {
            Datum::Entity(entity) => Ok(entity),
            Datum::Value(value) => Err(EngineError::Internal(format!(
                "expected an entity projection, got value {}",
                value
            ))),
        }
    }
}

impl FromProjection for Entity {
    fn from_projection(projections: &Arc<[Expr]>, data: Vec<Datum>) -> EngineResult<Self> {
        Option::<Entity>::from_projection(projections, data)?.ok_or_else(|| {
            EngineError::Execution("entity projection is null; select it as Option<Entity>".to_string())
        })
    }
}

impl FromProjection for Value {
    fn from_projection(_projections: &Arc<[Expr]>, data: Vec<Datum>) -> EngineResult<Self> {
        Ok(single(data)?.to_value())
    }
}

impl FromProjection for Tuple {
    fn from_projection(projections: &Arc<[Expr]>, data: Vec<Datum>) -> EngineResult<Self> {
        Ok(Tuple::new(projections.clone(), data))
    }
}

/// One page of content plus the total from the independent count query
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResults<T> {
    pub results: Vec<T>,
    pub total: u64,
    pub limit: Option<u64>,
    pub offset: u64,
}

impl<T> QueryResults<T> {
    pub fn results(&self) -> &[T] {
        &self.results
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn limit(&self) -> Option<u64> {
        self.limit
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> QueryResults<U> {
        QueryResults {
            results: self.results.into_iter().map(f).collect(),
            total: self.total,
            limit: self.limit,
            offset: self.offset,
        }
    }
}

/// Flatten executor output for display; entity projections expand to all of their columns
pub fn to_query_result(
    columns: &[Vec<ColumnMetadata>],
    rows: Vec<Vec<Datum>>,
    execution_time: Duration,
) -> EngineResult<crate::utils::types::QueryResult> {
    let mut flattened = Vec::with_capacity(rows.len());
    for data in rows {
        if data.len() != columns.len() {
            return Err(EngineError::Internal(format!(
                "row has {} projections, plan declares {}",
                data.len(),
                columns.len()
            )));
        }

        let mut values = Vec::with_capacity(columns.iter().map(Vec::len).sum());
        for (datum, group) in data.into_iter().zip(columns) {
            match datum {
                Datum::Value(value) => values.push(value),
                Datum::Entity(Some(entity)) => values.extend(entity.values),
                Datum::Entity(None) => values.extend(std::iter::repeat(Value::Null).take(group.len())),
            }
        }
        flattened.push(Row::new(values));
    }

    Ok(crate::utils::types::QueryResult {
        columns: columns.iter().flatten().cloned().collect(),
        rows: flattened,
        execution_time,
    })
}
