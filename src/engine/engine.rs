use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};
use crate::{
    engine::{
        expression::EntityPath,
        materializer::{to_query_result, Datum, Entity, LoadState},
        query_builder::{Projection, Query},
        query_executor::{DefaultQueryExecutor, QueryExecutor},
        query_planner::{DefaultQueryPlanner, ExecutionPlan, QueryPlan, QueryPlanner},
    },
    store::RowStore,
    utils::{
        config::EngineConfig,
        error::{EngineError, EngineResult, PlanError},
        types::{QueryResult, Row, RowId, Schema, Value},
    },
};

/// Main engine: owns the row store and hands out query builders over it
pub struct Engine {
    config: EngineConfig,
    store: Arc<RowStore>,
    query_planner: Arc<dyn QueryPlanner>,
    query_executor: Arc<dyn QueryExecutor>,
}

impl Engine {
    /// Create an engine with an empty store and the default planner and executor
    pub fn new(config: EngineConfig) -> Self {
        let store = Arc::new(RowStore::with_config(&config.store));
        let query_planner =
            Arc::new(DefaultQueryPlanner::new().with_null_ordering(config.query.default_null_ordering));

        Self {
            config,
            store,
            query_planner,
            query_executor: Arc::new(DefaultQueryExecutor::new()),
        }
    }

    /// Create an engine with custom components
    pub fn with_components(
        config: EngineConfig,
        store: Arc<RowStore>,
        query_planner: Arc<dyn QueryPlanner>,
        query_executor: Arc<dyn QueryExecutor>,
    ) -> Self {
        Self {
            config,
            store,
            query_planner,
            query_executor,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<RowStore> {
        &self.store
    }

    pub fn create_table(&self, schema: Schema) -> EngineResult<()> {
        self.store.create_table(schema)
    }

    pub fn insert(&self, table: &str, values: Vec<Value>) -> EngineResult<RowId> {
        self.store.insert(table, values)
    }

    pub fn insert_named(&self, table: &str, values: &[(&str, Value)]) -> EngineResult<RowId> {
        self.store.insert_named(table, values)
    }

    pub fn delete(&self, table: &str, id: RowId) -> EngineResult<Option<Row>> {
        self.store.delete(table, id)
    }

    /// Load one row as an entity, associations unloaded
    pub fn get(&self, table: &str, id: RowId) -> EngineResult<Option<Entity>> {
        let snapshot = self.store.snapshot();
        let schema = snapshot.schema(table)?.clone();
        Ok(snapshot.get(table, id)?.map(|stored| Entity::from_row(schema, stored)))
    }

    /// Start a query selecting `projection`
    pub fn select<P: Projection>(&self, projection: P) -> Query<'_, P::Output> {
        Query::new(self, projection.into_exprs())
    }

    /// Select whole entities of `path` from `path`
    pub fn select_from(&self, path: &EntityPath) -> Query<'_, Entity> {
        self.select(path).from(path)
    }

    /// Load an association that was not fetch-joined; returns the target if there is one
    pub fn resolve_association<'a>(&self, entity: &'a mut Entity, name: &str) -> EngineResult<Option<&'a Entity>> {
        let pending = match entity.association(name) {
            None => {
                return Err(PlanError::UnknownAssociation {
                    alias: entity.table().to_string(),
                    association: name.to_string(),
                }
                .into())
            }
            Some(association) => match &association.state {
                LoadState::NotLoaded(id) => Some((association.target_table.clone(), *id)),
                LoadState::Loaded(_) | LoadState::Absent => None,
            },
        };

        if let Some((table, id)) = pending {
            let loaded = {
                let snapshot = self.store.snapshot();
                let schema = snapshot.schema(&table)?.clone();
                snapshot.get(&table, id)?.map(|stored| Entity::from_row(schema, stored))
            };
            match loaded {
                Some(related) => {
                    debug!(table = %table, id = id.0, association = name, "resolved association");
                    entity.mark_loaded(name, related);
                }
                None => warn!(table = %table, id = id.0, association = name, "association points at a missing row"),
            }
        }

        Ok(entity.related(name))
    }

    /// Plan a query without running it
    pub fn explain(&self, plan: &QueryPlan) -> EngineResult<ExecutionPlan> {
        let snapshot = self.store.snapshot();
        self.query_planner.create_execution_plan(plan, &snapshot)
    }

    pub(crate) fn execute(&self, plan: &QueryPlan) -> EngineResult<Vec<Vec<Datum>>> {
        let snapshot = self.store.snapshot();
        let execution_plan = self.query_planner.create_execution_plan(plan, &snapshot)?;
        self.query_executor.execute_plan(&execution_plan, &snapshot)
    }

    pub(crate) fn count(&self, plan: &QueryPlan) -> EngineResult<u64> {
        let snapshot = self.store.snapshot();
        let count_plan = self.query_planner.create_count_plan(plan, &snapshot)?;
        let total = count_from(self.query_executor.execute_plan(&count_plan, &snapshot)?)?;

        debug!(total, "executed count query");
        Ok(total)
    }

    /// Content and total under one snapshot, so both see the same rows
    pub(crate) fn execute_page(&self, plan: &QueryPlan) -> EngineResult<(Vec<Vec<Datum>>, u64)> {
        let snapshot = self.store.snapshot();
        let content_plan = self.query_planner.create_execution_plan(plan, &snapshot)?;
        let count_plan = self.query_planner.create_count_plan(plan, &snapshot)?;

        let rows = self.query_executor.execute_plan(&content_plan, &snapshot)?;
        let total = count_from(self.query_executor.execute_plan(&count_plan, &snapshot)?)?;

        debug!(rows = rows.len(), total, offset = plan.offset, limit = ?plan.limit, "executed paged query");
        Ok((rows, total))
    }

    pub(crate) fn execute_result_set(&self, plan: &QueryPlan) -> EngineResult<QueryResult> {
        let start = Instant::now();
        let snapshot = self.store.snapshot();
        let execution_plan = self.query_planner.create_execution_plan(plan, &snapshot)?;
        let rows = self.query_executor.execute_plan(&execution_plan, &snapshot)?;
        to_query_result(&execution_plan.columns, rows, start.elapsed())
    }
}

fn count_from(rows: Vec<Vec<Datum>>) -> EngineResult<u64> {
    match rows.first().and_then(|row| row.first()) {
        Some(Datum::Value(Value::Integer(n))) if *n >= 0 => Ok(*n as u64),
        other => Err(EngineError::Internal(format!("count plan produced {:?}", other))),
    }
}

/// Builder for creating Engine instances
pub struct EngineBuilder {
    config: Option<EngineConfig>,
    store: Option<Arc<RowStore>>,
    query_planner: Option<Arc<dyn QueryPlanner>>,
    query_executor: Option<Arc<dyn QueryExecutor>>,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            store: None,
            query_planner: None,
            query_executor: None,
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Share an existing store
    pub fn with_store(mut self, store: Arc<RowStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_query_planner(mut self, planner: Arc<dyn QueryPlanner>) -> Self {
        self.query_planner = Some(planner);
        self
    }

    pub fn with_query_executor(mut self, executor: Arc<dyn QueryExecutor>) -> Self {
        self.query_executor = Some(executor);
        self
    }

    /// Build the engine; missing components fall back to the defaults for the configuration
    pub fn build(self) -> EngineResult<Engine> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let defaults = Engine::new(config);
        Ok(Engine::with_components(
            defaults.config,
            self.store.unwrap_or(defaults.store),
            self.query_planner.unwrap_or(defaults.query_planner),
            self.query_executor.unwrap_or(defaults.query_executor),
        ))
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}
