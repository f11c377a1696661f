use std::marker::PhantomData;
use std::sync::Arc;
use crate::engine::{
    engine::Engine,
    expression::{EntityPath, Expr, OrderSpecifier, Relation},
    materializer::{Datum, Entity, FromProjection, QueryResults, Tuple},
    query_planner::{check_expr, AliasScope, Catalog, JoinClause, JoinKind, QueryPlan},
};
use crate::store::RowStore;
use crate::utils::{
    error::{EngineError, EngineResult, PlanError},
    types::{QueryResult, Value},
};

/// Something that can be selected, fixing the record type the query yields
pub trait Projection {
    type Output: FromProjection;

    fn into_exprs(self) -> Vec<Expr>;
}

impl Projection for &EntityPath {
    type Output = Entity;

    fn into_exprs(self) -> Vec<Expr> {
        vec![self.entity()]
    }
}

impl Projection for Expr {
    type Output = Value;

    fn into_exprs(self) -> Vec<Expr> {
        vec![self]
    }
}

impl Projection for Vec<Expr> {
    type Output = Tuple;

    fn into_exprs(self) -> Vec<Expr> {
        self
    }
}

impl<const N: usize> Projection for [Expr; N] {
    type Output = Tuple;

    fn into_exprs(self) -> Vec<Expr> {
        self.into()
    }
}

/// Builder phases; steps may only move forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Selecting,
    Joining,
    Filtering,
    Grouping,
    Ordering,
    Paging,
    Terminated,
}

/// Fluent query over an [`Engine`].
///
/// Each step consumes the builder and returns it. The first failing step is
/// remembered and reported by the terminal call, which may only be made once.
///
/// Unknown tables, aliases and columns are detected by the step that names
/// them. Callers that want to fail fast can check [`Query::error`] right after
/// building instead of waiting for the terminal call.
pub struct Query<'e, R> {
    engine: &'e Engine,
    plan: QueryPlan,
    scope: AliasScope,
    phase: Phase,
    projections_checked: bool,
    error: Option<EngineError>,
    _output: PhantomData<fn() -> R>,
}

impl<'e, R> Query<'e, R> {
    pub(crate) fn new(engine: &'e Engine, projections: Vec<Expr>) -> Self {
        Self {
            engine,
            plan: QueryPlan::new(projections),
            scope: AliasScope::new(),
            phase: Phase::Selecting,
            projections_checked: false,
            error: None,
            _output: PhantomData,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn plan(&self) -> &QueryPlan {
        &self.plan
    }

    /// First error recorded by a builder step, if any
    pub fn error(&self) -> Option<&EngineError> {
        self.error.as_ref()
    }

    fn catalog(&self) -> &'e dyn Catalog {
        let store: &'e RowStore = self.engine.store();
        store
    }

    fn step(mut self, operation: &str, target: Phase, apply: impl FnOnce(&mut Self) -> EngineResult<()>) -> Self {
        if self.error.is_some() || self.phase == Phase::Terminated {
            return self;
        }

        let result = match self.enter(operation, target) {
            Ok(()) => apply(&mut self),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            self.error = Some(e);
        }
        self
    }

    fn enter(&mut self, operation: &str, target: Phase) -> EngineResult<()> {
        if target < self.phase {
            return Err(EngineError::InvalidPlanState(format!(
                "{} cannot follow the {:?} phase",
                operation, self.phase
            )));
        }
        if self.phase == Phase::Selecting && target > Phase::Joining {
            return Err(PlanError::MissingSource.into());
        }
        if target > Phase::Joining {
            self.check_projections()?;
        }
        self.phase = target;
        Ok(())
    }

    /// Projections may name joined aliases, so they are checked once joining is over
    fn check_projections(&mut self) -> EngineResult<()> {
        if self.projections_checked {
            return Ok(());
        }
        if self.plan.projections.is_empty() {
            return Err(PlanError::InvalidProjection("query selects nothing".to_string()).into());
        }
        for expr in &self.plan.projections {
            check_expr(self.catalog(), expr, &self.scope)?;
        }
        self.projections_checked = true;
        Ok(())
    }

    fn check(&self, expr: &Expr) -> EngineResult<()> {
        check_expr(self.catalog(), expr, &self.scope)?;
        Ok(())
    }

    /// Add a source table; several sources form a cartesian product
    pub fn from(self, path: &EntityPath) -> Self {
        self.step("from", Phase::Joining, |q| {
            if !q.plan.joins.is_empty() {
                return Err(EngineError::InvalidPlanState("from cannot follow a join".to_string()));
            }
            let catalog = q.catalog();
            q.scope.bind(path, catalog)?;
            q.plan.sources.push(path.clone());
            Ok(())
        })
    }

    fn add_join(self, operation: &str, clause: JoinClause) -> Self {
        self.step(operation, Phase::Joining, |q| {
            if q.plan.sources.is_empty() {
                return Err(PlanError::MissingSource.into());
            }
            let catalog = q.catalog();
            q.scope.bind_join(&clause, catalog)?;
            q.plan.joins.push(clause);
            Ok(())
        })
    }

    /// Inner join through a declared association
    pub fn join(self, relation: Relation, target: &EntityPath) -> Self {
        self.add_join("join", JoinClause::new(JoinKind::Inner, target, Some(relation)))
    }

    /// Left join through a declared association
    pub fn left_join(self, relation: Relation, target: &EntityPath) -> Self {
        self.add_join("left_join", JoinClause::new(JoinKind::Left, target, Some(relation)))
    }

    /// Inner join on an unrelated table; constrain it with [`Query::on`]
    pub fn join_entity(self, target: &EntityPath) -> Self {
        self.add_join("join_entity", JoinClause::new(JoinKind::Inner, target, None))
    }

    pub fn left_join_entity(self, target: &EntityPath) -> Self {
        self.add_join("left_join_entity", JoinClause::new(JoinKind::Left, target, None))
    }

    /// Attach a condition to the most recent join
    pub fn on(self, condition: Expr) -> Self {
        self.step("on", Phase::Joining, |q| {
            if q.plan.joins.is_empty() {
                return Err(EngineError::InvalidPlanState("on requires a preceding join".to_string()));
            }
            if condition.contains_aggregate() {
                return Err(PlanError::MisplacedAggregate(format!("join condition {}", condition)).into());
            }
            q.check(&condition)?;

            if let Some(join) = q.plan.joins.last_mut() {
                join.condition = Some(match join.condition.take() {
                    Some(existing) => existing.and(condition),
                    None => condition,
                });
            }
            Ok(())
        })
    }

    /// Materialize the most recent join's target together with its owner
    pub fn fetch_join(self) -> Self {
        self.step("fetch_join", Phase::Joining, |q| match q.plan.joins.last_mut() {
            None => Err(EngineError::InvalidPlanState("fetch_join requires a preceding join".to_string())),
            Some(join) if join.relation.is_none() => {
                Err(PlanError::FetchWithoutAssociation(join.target.alias.clone()).into())
            }
            Some(join) => {
                join.fetch = true;
                Ok(())
            }
        })
    }

    fn add_predicate(&mut self, predicate: Expr) -> EngineResult<()> {
        if predicate.contains_aggregate() {
            return Err(PlanError::MisplacedAggregate(format!("filter {}", predicate)).into());
        }
        self.check(&predicate)?;
        self.plan.predicate = Some(match self.plan.predicate.take() {
            Some(existing) => existing.and(predicate),
            None => predicate,
        });
        Ok(())
    }

    /// Restrict matched rows; repeated calls are conjoined
    pub fn filter(self, predicate: Expr) -> Self {
        self.step("filter", Phase::Filtering, |q| q.add_predicate(predicate))
    }

    /// Conjoin the present predicates, dropping absent ones; all absent means no filter
    pub fn filter_all<I>(self, predicates: I) -> Self
    where
        I: IntoIterator<Item = Option<Expr>>,
    {
        self.step("filter_all", Phase::Filtering, |q| match Expr::all_of(predicates) {
            Some(predicate) => q.add_predicate(predicate),
            None => Ok(()),
        })
    }

    pub fn group_by<I>(self, keys: I) -> Self
    where
        I: IntoIterator<Item = Expr>,
    {
        self.step("group_by", Phase::Grouping, |q| {
            for key in keys {
                if key.contains_aggregate() {
                    return Err(PlanError::InvalidGroupBy(format!("cannot group by aggregate {}", key)).into());
                }
                q.check(&key)?;
                q.plan.group_by.push(key);
            }
            Ok(())
        })
    }

    /// Restrict groups; repeated calls are conjoined
    pub fn having(self, predicate: Expr) -> Self {
        self.step("having", Phase::Grouping, |q| {
            q.check(&predicate)?;
            q.plan.having = Some(match q.plan.having.take() {
                Some(existing) => existing.and(predicate),
                None => predicate,
            });
            Ok(())
        })
    }

    pub fn order_by<I>(self, specs: I) -> Self
    where
        I: IntoIterator<Item = OrderSpecifier>,
    {
        self.step("order_by", Phase::Ordering, |q| {
            for spec in specs {
                q.check(&spec.expr)?;
                q.plan.order_by.push(spec);
            }
            Ok(())
        })
    }

    pub fn offset(self, offset: u64) -> Self {
        self.step("offset", Phase::Paging, |q| {
            q.plan.offset = offset;
            Ok(())
        })
    }

    pub fn limit(self, limit: u64) -> Self {
        self.step("limit", Phase::Paging, |q| {
            q.plan.limit = Some(limit);
            Ok(())
        })
    }

    /// Move to the terminal phase, surfacing any error recorded while building
    fn begin_terminal(&mut self, operation: &str) -> EngineResult<()> {
        if self.phase == Phase::Terminated {
            return Err(EngineError::InvalidPlanState(format!(
                "{} called on a query that was already executed",
                operation
            )));
        }

        let entered = match self.error.take() {
            Some(e) => Err(e),
            None if self.phase == Phase::Selecting => Err(PlanError::MissingSource.into()),
            None => self.check_projections(),
        };
        self.phase = Phase::Terminated;
        entered
    }

    /// Total number of rows the query would return without offset and limit
    pub fn fetch_count(&mut self) -> EngineResult<u64> {
        self.begin_terminal("fetch_count")?;
        self.engine.count(&self.plan)
    }

    /// Flattened, display-ready result
    pub fn fetch_result_set(&mut self) -> EngineResult<QueryResult> {
        self.begin_terminal("fetch_result_set")?;
        self.engine.execute_result_set(&self.plan)
    }
}

impl<'e, R: FromProjection> Query<'e, R> {
    fn materialize(&self, rows: Vec<Vec<Datum>>) -> EngineResult<Vec<R>> {
        let projections: Arc<[Expr]> = Arc::from(self.plan.projections.clone());
        rows.into_iter()
            .map(|data| R::from_projection(&projections, data))
            .collect()
    }

    pub fn fetch(&mut self) -> EngineResult<Vec<R>> {
        self.begin_terminal("fetch")?;
        let rows = self.engine.execute(&self.plan)?;
        self.materialize(rows)
    }

    /// At most one result; more than one is a [`EngineError::NonUniqueResult`]
    pub fn fetch_one(&mut self) -> EngineResult<Option<R>> {
        self.begin_terminal("fetch_one")?;
        let rows = self.engine.execute(&self.plan)?;
        if rows.len() > 1 {
            return Err(EngineError::NonUniqueResult(rows.len()));
        }
        Ok(self.materialize(rows)?.into_iter().next())
    }

    /// First result in plan order, if any
    pub fn fetch_first(&mut self) -> EngineResult<Option<R>> {
        self.begin_terminal("fetch_first")?;
        let mut plan = self.plan.clone();
        plan.limit = Some(plan.limit.map_or(1, |limit| limit.min(1)));
        let rows = self.engine.execute(&plan)?;
        Ok(self.materialize(rows)?.into_iter().next())
    }

    /// Content page plus the total from a separate count query
    pub fn fetch_results(&mut self) -> EngineResult<QueryResults<R>> {
        self.begin_terminal("fetch_results")?;
        let (rows, total) = self.engine.execute_page(&self.plan)?;
        Ok(QueryResults {
            results: self.materialize(rows)?,
            total,
            limit: self.plan.limit,
            offset: self.plan.offset,
        })
    }
}

/// Nested query used as an expression operand.
///
/// Validation happens when the enclosing query binds it.
#[derive(Debug, Clone, PartialEq)]
pub struct SubQuery {
    plan: QueryPlan,
    problem: Option<String>,
}

/// Start a subquery selecting a single expression
pub fn sub_select(projection: impl Into<Expr>) -> SubQuery {
    SubQuery {
        plan: QueryPlan::new(vec![projection.into()]),
        problem: None,
    }
}

impl SubQuery {
    pub fn plan(&self) -> &QueryPlan {
        &self.plan
    }

    /// Misuse recorded while building, reported when the enclosing query is bound
    pub fn problem(&self) -> Option<&str> {
        self.problem.as_deref()
    }

    fn record(mut self, problem: &str) -> Self {
        if self.problem.is_none() {
            self.problem = Some(problem.to_string());
        }
        self
    }

    pub fn from(mut self, path: &EntityPath) -> Self {
        if !self.plan.joins.is_empty() {
            return self.record("from cannot follow a join");
        }
        self.plan.sources.push(path.clone());
        self
    }

    pub fn join(mut self, relation: Relation, target: &EntityPath) -> Self {
        self.plan.joins.push(JoinClause::new(JoinKind::Inner, target, Some(relation)));
        self
    }

    pub fn left_join(mut self, relation: Relation, target: &EntityPath) -> Self {
        self.plan.joins.push(JoinClause::new(JoinKind::Left, target, Some(relation)));
        self
    }

    pub fn join_entity(mut self, target: &EntityPath) -> Self {
        self.plan.joins.push(JoinClause::new(JoinKind::Inner, target, None));
        self
    }

    pub fn on(mut self, condition: Expr) -> Self {
        match self.plan.joins.last_mut() {
            Some(join) => {
                join.condition = Some(match join.condition.take() {
                    Some(existing) => existing.and(condition),
                    None => condition,
                });
                self
            }
            None => self.record("on requires a preceding join"),
        }
    }

    pub fn filter(mut self, predicate: Expr) -> Self {
        self.plan.predicate = Some(match self.plan.predicate.take() {
            Some(existing) => existing.and(predicate),
            None => predicate,
        });
        self
    }

    pub fn filter_all<I>(self, predicates: I) -> Self
    where
        I: IntoIterator<Item = Option<Expr>>,
    {
        match Expr::all_of(predicates) {
            Some(predicate) => self.filter(predicate),
            None => self,
        }
    }

    pub fn group_by<I>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = Expr>,
    {
        self.plan.group_by.extend(keys);
        self
    }

    pub fn having(mut self, predicate: Expr) -> Self {
        self.plan.having = Some(match self.plan.having.take() {
            Some(existing) => existing.and(predicate),
            None => predicate,
        });
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::fixture;
    use crate::utils::config::EngineConfig;

    fn engine() -> Engine {
        let engine = Engine::new(EngineConfig::default());
        fixture::create_tables(engine.store()).unwrap();
        fixture::seed(engine.store()).unwrap();
        engine
    }

    #[test]
    fn test_phases_advance() {
        let engine = engine();
        let member = fixture::member();

        let query = engine.select(&member);
        assert_eq!(query.phase(), Phase::Selecting);
        let query = query.from(&member);
        assert_eq!(query.phase(), Phase::Joining);
        let query = query.filter(member.col("age").gt(10)).order_by([member.col("age").asc()]).limit(1);
        assert_eq!(query.phase(), Phase::Paging);
        assert!(query.error().is_none());
    }

    #[test]
    fn test_backtracking_is_rejected() {
        let engine = engine();
        let member = fixture::member();

        let mut query = engine
            .select_from(&member)
            .order_by([member.col("age").asc()])
            .filter(member.col("age").gt(10));

        match query.fetch() {
            Err(EngineError::InvalidPlanState(msg)) => assert!(msg.contains("filter")),
            other => panic!("Expected InvalidPlanState error, got {:?}", other.map(|r| r.len())),
        }
    }

    #[test]
    fn test_second_terminal_call_fails() {
        let engine = engine();
        let mut query = engine.select_from(&fixture::member());

        assert_eq!(query.fetch().unwrap().len(), 4);
        match query.fetch_count() {
            Err(EngineError::InvalidPlanState(_)) => {}
            other => panic!("Expected InvalidPlanState error, got {:?}", other),
        }
    }

    #[test]
    fn test_first_error_is_kept() {
        let engine = engine();
        let member = fixture::member();

        let mut query = engine
            .select_from(&member)
            .filter(fixture::team().col("name").eq("teamA"))
            .filter(member.col("email").eq("x"));

        match query.fetch() {
            Err(EngineError::Plan(PlanError::UnboundAlias(alias))) => assert_eq!(alias, "team"),
            other => panic!("Expected UnboundAlias error, got {:?}", other.map(|r| r.len())),
        }
    }

    #[test]
    fn test_missing_source() {
        let engine = engine();
        let member = fixture::member();

        let mut query = engine.select(member.col("age")).filter(member.col("age").gt(1));
        match query.fetch() {
            Err(EngineError::Plan(PlanError::MissingSource)) => {}
            other => panic!("Expected MissingSource error, got {:?}", other),
        }
    }

    #[test]
    fn test_projection_checked_after_joins() {
        let engine = engine();
        let member = fixture::member();
        let team = fixture::team();

        let query = engine
            .select(vec![member.col("username"), team.col("name")])
            .from(&member)
            .join(member.relation("team"), &team)
            .filter(team.col("name").eq("teamA"));
        assert!(query.error().is_none());

        let query = engine.select(vec![member.col("username"), team.col("name")]).from(&member).limit(1);
        assert!(matches!(query.error(), Some(EngineError::Plan(PlanError::UnboundAlias(_)))));
    }

    #[test]
    fn test_on_and_fetch_join_need_a_join() {
        let engine = engine();
        let member = fixture::member();
        let team = fixture::team();

        let query = engine.select_from(&member).on(member.col("age").gt(1));
        assert!(matches!(query.error(), Some(EngineError::InvalidPlanState(_))));

        let query = engine
            .select_from(&member)
            .join_entity(&team)
            .on(member.col("username").eq(team.col("name")))
            .fetch_join();
        assert!(matches!(
            query.error(),
            Some(EngineError::Plan(PlanError::FetchWithoutAssociation(_)))
        ));
    }

    #[test]
    fn test_subquery_records_misuse() {
        let member_sub = fixture::member_as("memberSub");
        let subquery = sub_select(member_sub.col("age")).from(&member_sub).on(member_sub.col("age").gt(1));
        assert_eq!(subquery.problem(), Some("on requires a preceding join"));

        let engine = engine();
        let member = fixture::member();
        let mut query = engine.select_from(&member).filter(member.col("age").in_subquery(subquery));
        match query.fetch() {
            Err(EngineError::Plan(PlanError::InvalidSubquery(_))) => {}
            other => panic!("Expected InvalidSubquery error, got {:?}", other.map(|r| r.len())),
        }
    }
}
