use std::sync::Arc;
use tracing::debug;
use crate::engine::expression::{
    AggregateFunc, CompareOp, EntityPath, Expr, LikePattern, NullOrdering, OrderDirection,
    OrderSpecifier, Relation,
};
use crate::engine::query_builder::SubQuery;
use crate::utils::{
    config::NullOrderingDefault,
    error::{EngineResult, PlanError},
    types::{ColumnMetadata, DataType, Schema, Value},
};

/// Source of table schemas for plan binding
pub trait Catalog {
    fn resolve_table(&self, name: &str) -> Option<Arc<Schema>>;
}

/// Join kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    /// Keeps unmatched left-side frames with a null right side
    Left,
    /// Cartesian product, used for additional `from` sources
    Cross,
}

/// A join as declared on the query builder
#[derive(Debug, Clone, PartialEq)]
pub struct JoinClause {
    pub kind: JoinKind,
    pub target: EntityPath,
    /// Declared association driving the join, if any
    pub relation: Option<Relation>,
    /// Extra condition attached with `on`
    pub condition: Option<Expr>,
    pub fetch: bool,
}

impl JoinClause {
    pub fn new(kind: JoinKind, target: &EntityPath, relation: Option<Relation>) -> Self {
        Self {
            kind,
            target: target.clone(),
            relation,
            condition: None,
            fetch: false,
        }
    }
}

/// Logical description of a query, as accumulated by the builder
#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueryPlan {
    pub projections: Vec<Expr>,
    pub sources: Vec<EntityPath>,
    pub joins: Vec<JoinClause>,
    pub predicate: Option<Expr>,
    pub group_by: Vec<Expr>,
    pub having: Option<Expr>,
    pub order_by: Vec<OrderSpecifier>,
    pub offset: u64,
    pub limit: Option<u64>,
}

impl QueryPlan {
    pub fn new(projections: Vec<Expr>) -> Self {
        Self {
            projections,
            ..Self::default()
        }
    }

    /// Whether output rows are formed from groups rather than single frames
    pub fn is_aggregating(&self) -> bool {
        !self.group_by.is_empty()
            || self.having.is_some()
            || self.projections.iter().any(Expr::contains_aggregate)
            || self.order_by.iter().any(|o| o.expr.contains_aggregate())
    }
}

/// One bound alias: its position in an execution frame and its table schema
#[derive(Debug, Clone)]
pub struct ScopeSlot {
    pub alias: String,
    pub schema: Arc<Schema>,
}

/// Aliases introduced so far, in declaration order; doubles as the frame layout
#[derive(Debug, Clone, Default)]
pub struct AliasScope {
    slots: Vec<ScopeSlot>,
}

impl AliasScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a table alias, returning its slot
    pub fn bind(&mut self, path: &EntityPath, catalog: &dyn Catalog) -> Result<usize, PlanError> {
        let schema = catalog
            .resolve_table(&path.table)
            .ok_or_else(|| PlanError::UnknownTable(path.table.clone()))?;
        if self.slot(&path.alias).is_some() {
            return Err(PlanError::DuplicateAlias(path.alias.clone()));
        }

        self.slots.push(ScopeSlot {
            alias: path.alias.clone(),
            schema,
        });
        Ok(self.slots.len() - 1)
    }

    /// Bind the target of a join, resolving its association first
    pub fn bind_join(
        &mut self,
        join: &JoinClause,
        catalog: &dyn Catalog,
    ) -> Result<(usize, Option<JoinLink>), PlanError> {
        let link = match &join.relation {
            Some(relation) => Some(self.resolve_relation(relation, &join.target)?),
            None if join.fetch => {
                return Err(PlanError::FetchWithoutAssociation(join.target.alias.clone()))
            }
            None => None,
        };
        let slot = self.bind(&join.target, catalog)?;
        Ok((slot, link))
    }

    fn resolve_relation(&self, relation: &Relation, target: &EntityPath) -> Result<JoinLink, PlanError> {
        let owner_slot = self
            .slot(&relation.owner_alias)
            .ok_or_else(|| PlanError::UnboundAlias(relation.owner_alias.clone()))?;
        let owner = &self.slots[owner_slot].schema;

        let fk = owner
            .foreign_key(&relation.association)
            .ok_or_else(|| PlanError::UnknownAssociation {
                alias: relation.owner_alias.clone(),
                association: relation.association.clone(),
            })?;
        if fk.references != target.table {
            return Err(PlanError::AssociationTarget {
                association: relation.association.clone(),
                expected: fk.references.clone(),
                actual: target.table.clone(),
            });
        }

        let fk_index = owner.column_index(&fk.column).ok_or_else(|| PlanError::UnknownColumn {
            alias: relation.owner_alias.clone(),
            column: fk.column.clone(),
        })?;

        Ok(JoinLink {
            owner_slot,
            fk_index,
            association: relation.association.clone(),
        })
    }

    pub fn slot(&self, alias: &str) -> Option<usize> {
        self.slots.iter().position(|s| s.alias == alias)
    }

    pub fn slots(&self) -> &[ScopeSlot] {
        &self.slots
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Check that an expression only references aliases and columns visible in `scope`
pub fn check_expr(catalog: &dyn Catalog, expr: &Expr, scope: &AliasScope) -> Result<(), PlanError> {
    let mut binder = Binder::new(catalog, NullOrderingDefault::NullsLargest);
    binder.bind_expr(expr, scope, &[]).map(|_| ())
}

/// Foreign-key link between an already bound alias and a join target
#[derive(Debug, Clone, PartialEq)]
pub struct JoinLink {
    pub owner_slot: usize,
    /// Index of the foreign-key column in the owner's schema
    pub fk_index: usize,
    pub association: String,
}

/// Association eagerly materialized by a fetch join
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedAssociation {
    pub owner_slot: usize,
    pub association: String,
    pub target_slot: usize,
}

/// Expression with every alias and column resolved to frame positions
#[derive(Debug, Clone)]
pub enum BoundExpr {
    Column { slot: usize, index: usize },
    /// Primary key of the row in `slot`, null when the slot is empty
    Entity { slot: usize },
    Literal(Value),
    Compare {
        op: CompareOp,
        left: Box<BoundExpr>,
        right: Box<BoundExpr>,
    },
    Between {
        expr: Box<BoundExpr>,
        low: Box<BoundExpr>,
        high: Box<BoundExpr>,
    },
    InList {
        expr: Box<BoundExpr>,
        list: Vec<BoundExpr>,
        negated: bool,
    },
    InSubquery {
        expr: Box<BoundExpr>,
        subquery: BoundSubquery,
        negated: bool,
    },
    IsNull {
        expr: Box<BoundExpr>,
        negated: bool,
    },
    And(Vec<BoundExpr>),
    Or(Vec<BoundExpr>),
    Not(Box<BoundExpr>),
    Like {
        expr: Box<BoundExpr>,
        pattern: LikePattern,
    },
    Concat(Box<BoundExpr>, Box<BoundExpr>),
    StringValue(Box<BoundExpr>),
    Aggregate {
        func: AggregateFunc,
        arg: Box<BoundExpr>,
    },
    Case {
        branches: Vec<(BoundExpr, BoundExpr)>,
        otherwise: Box<BoundExpr>,
    },
    Subquery(BoundSubquery),
}

/// Uncorrelated subquery compiled to its own plan; `id` keys the per-execution result cache
#[derive(Debug, Clone)]
pub struct BoundSubquery {
    pub id: usize,
    pub plan: Box<ExecutionPlan>,
}

/// Sort key with its null placement already decided
#[derive(Debug, Clone)]
pub struct SortKey {
    pub expr: BoundExpr,
    pub descending: bool,
    pub nulls_first: bool,
}

/// One projected output position
#[derive(Debug, Clone)]
pub enum ProjectedColumn {
    Entity { slot: usize },
    Value(BoundExpr),
}

/// Execution pipeline stages
#[derive(Debug, Clone)]
pub enum PlanNode {
    /// Produce one frame per row of the first source
    Scan { table: String, slot: usize },
    /// Extend every frame with rows of another table
    Join {
        table: String,
        slot: usize,
        kind: JoinKind,
        link: Option<JoinLink>,
        condition: Option<BoundExpr>,
    },
    Filter { predicate: BoundExpr },
    /// Partition frames into groups; without keys everything forms one group
    Aggregate {
        group_by: Vec<BoundExpr>,
        having: Option<BoundExpr>,
    },
    Sort { keys: Vec<SortKey> },
    Slice { offset: u64, limit: Option<u64> },
    Projection { columns: Vec<ProjectedColumn> },
    /// Replace the input with its cardinality
    Count,
}

/// Complete execution plan for a query: stages run in order over one frame layout
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub nodes: Vec<PlanNode>,
    pub scope: AliasScope,
    pub fetched: Vec<FetchedAssociation>,
    /// Display columns, grouped per projection
    pub columns: Vec<Vec<ColumnMetadata>>,
    pub estimated_cost: f64,
}

impl ExecutionPlan {
    pub fn new(scope: AliasScope) -> Self {
        Self {
            nodes: Vec::new(),
            scope,
            fetched: Vec::new(),
            columns: Vec::new(),
            estimated_cost: 0.0,
        }
    }

    pub fn add_node(&mut self, node: PlanNode) {
        self.nodes.push(node);
    }

    /// Final stage of the pipeline
    pub fn root_node(&self) -> Option<&PlanNode> {
        self.nodes.last()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn is_count(&self) -> bool {
        matches!(self.root_node(), Some(PlanNode::Count))
    }
}

/// Trait for query planning functionality
pub trait QueryPlanner: Send + Sync {
    /// Bind and validate a query, producing the content plan
    fn create_execution_plan(&self, plan: &QueryPlan, catalog: &dyn Catalog) -> EngineResult<ExecutionPlan>;

    /// Plan the total-count query over the same sources and filter, without projection, order or paging
    fn create_count_plan(&self, plan: &QueryPlan, catalog: &dyn Catalog) -> EngineResult<ExecutionPlan>;

    fn estimate_cost(&self, plan: &QueryPlan, catalog: &dyn Catalog) -> EngineResult<f64>;
}

/// Default implementation of QueryPlanner
pub struct DefaultQueryPlanner {
    /// Base cost for table scans and each joined table
    base_scan_cost: f64,
    /// Cost per predicate leaf
    predicate_cost_multiplier: f64,
    /// Cost for sorting and grouping
    sort_cost: f64,
    /// Cost for offset/limit
    limit_cost: f64,
    null_ordering: NullOrderingDefault,
}

impl DefaultQueryPlanner {
    pub fn new() -> Self {
        Self {
            base_scan_cost: 1.0,
            predicate_cost_multiplier: 0.1,
            sort_cost: 0.5,
            limit_cost: 0.1,
            null_ordering: NullOrderingDefault::NullsLargest,
        }
    }

    /// Create a query planner with custom cost parameters
    pub fn with_costs(
        base_scan_cost: f64,
        predicate_cost_multiplier: f64,
        sort_cost: f64,
        limit_cost: f64,
    ) -> Self {
        Self {
            base_scan_cost,
            predicate_cost_multiplier,
            sort_cost,
            limit_cost,
            null_ordering: NullOrderingDefault::NullsLargest,
        }
    }

    /// Set the null placement used by order specifiers without an explicit policy
    pub fn with_null_ordering(mut self, null_ordering: NullOrderingDefault) -> Self {
        self.null_ordering = null_ordering;
        self
    }

    fn calculate_cost(&self, plan: &ExecutionPlan) -> f64 {
        plan.nodes.iter().map(|node| self.node_cost(node)).sum()
    }

    fn node_cost(&self, node: &PlanNode) -> f64 {
        match node {
            PlanNode::Scan { .. } => self.base_scan_cost,
            PlanNode::Join { condition, .. } => {
                self.base_scan_cost + condition.as_ref().map(|c| self.expr_cost(c)).unwrap_or(0.0)
            }
            PlanNode::Filter { predicate } => self.expr_cost(predicate),
            PlanNode::Aggregate { group_by, having } => {
                let keys: f64 = group_by.iter().map(|e| self.expr_cost(e)).sum();
                self.sort_cost + keys + having.as_ref().map(|h| self.expr_cost(h)).unwrap_or(0.0)
            }
            PlanNode::Sort { keys } => {
                self.sort_cost + keys.iter().map(|k| self.expr_cost(&k.expr)).sum::<f64>()
            }
            PlanNode::Slice { .. } => self.limit_cost,
            PlanNode::Projection { columns } => columns
                .iter()
                .map(|c| match c {
                    ProjectedColumn::Value(expr) => self.expr_cost(expr),
                    ProjectedColumn::Entity { .. } => 0.0,
                })
                .sum(),
            PlanNode::Count => 0.0,
        }
    }

    /// Predicate leaves cost a fixed amount; subqueries add their own plan's cost
    fn expr_cost(&self, expr: &BoundExpr) -> f64 {
        match expr {
            BoundExpr::Column { .. } | BoundExpr::Entity { .. } | BoundExpr::Literal(_) => 0.0,
            BoundExpr::Compare { left, right, .. } => {
                self.predicate_cost_multiplier + self.expr_cost(left) + self.expr_cost(right)
            }
            BoundExpr::Between { expr, low, high } => {
                self.predicate_cost_multiplier + self.expr_cost(expr) + self.expr_cost(low) + self.expr_cost(high)
            }
            BoundExpr::InList { expr, list, .. } => {
                self.predicate_cost_multiplier
                    + self.expr_cost(expr)
                    + list.iter().map(|e| self.expr_cost(e)).sum::<f64>()
            }
            BoundExpr::InSubquery { expr, subquery, .. } => {
                self.predicate_cost_multiplier + self.expr_cost(expr) + self.calculate_cost(&subquery.plan)
            }
            BoundExpr::IsNull { expr, .. } | BoundExpr::Like { expr, .. } => {
                self.predicate_cost_multiplier + self.expr_cost(expr)
            }
            BoundExpr::And(operands) | BoundExpr::Or(operands) => {
                operands.iter().map(|e| self.expr_cost(e)).sum()
            }
            BoundExpr::Not(expr) | BoundExpr::StringValue(expr) => self.expr_cost(expr),
            BoundExpr::Aggregate { arg, .. } => self.expr_cost(arg),
            BoundExpr::Concat(left, right) => self.expr_cost(left) + self.expr_cost(right),
            BoundExpr::Case { branches, otherwise } => {
                branches
                    .iter()
                    .map(|(c, r)| self.expr_cost(c) + self.expr_cost(r))
                    .sum::<f64>()
                    + self.expr_cost(otherwise)
            }
            BoundExpr::Subquery(subquery) => self.calculate_cost(&subquery.plan),
        }
    }
}

impl Default for DefaultQueryPlanner {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryPlanner for DefaultQueryPlanner {
    fn create_execution_plan(&self, plan: &QueryPlan, catalog: &dyn Catalog) -> EngineResult<ExecutionPlan> {
        let mut binder = Binder::new(catalog, self.null_ordering);
        let mut execution_plan = binder.bind_query(plan, &[])?.into_execution_plan();
        execution_plan.estimated_cost = self.calculate_cost(&execution_plan);

        debug!(
            nodes = execution_plan.nodes.len(),
            subqueries = binder.next_subquery,
            cost = execution_plan.estimated_cost,
            "created execution plan"
        );
        Ok(execution_plan)
    }

    fn create_count_plan(&self, plan: &QueryPlan, catalog: &dyn Catalog) -> EngineResult<ExecutionPlan> {
        let mut binder = Binder::new(catalog, self.null_ordering);
        let mut count_plan = binder.bind_query(plan, &[])?.into_count_plan();
        count_plan.estimated_cost = self.calculate_cost(&count_plan);

        debug!(nodes = count_plan.nodes.len(), cost = count_plan.estimated_cost, "created count plan");
        Ok(count_plan)
    }

    fn estimate_cost(&self, plan: &QueryPlan, catalog: &dyn Catalog) -> EngineResult<f64> {
        Ok(self.create_execution_plan(plan, catalog)?.estimated_cost)
    }
}

/// Bound parts of a query, assembled into either a content or a count pipeline
struct BoundQuery {
    scope: AliasScope,
    sources: Vec<PlanNode>,
    fetched: Vec<FetchedAssociation>,
    predicate: Option<BoundExpr>,
    aggregate: Option<(Vec<BoundExpr>, Option<BoundExpr>)>,
    sort_keys: Vec<SortKey>,
    projections: Vec<ProjectedColumn>,
    columns: Vec<Vec<ColumnMetadata>>,
    offset: u64,
    limit: Option<u64>,
}

impl BoundQuery {
    fn filtered(self) -> (ExecutionPlan, BoundRest) {
        let mut plan = ExecutionPlan::new(self.scope);
        plan.fetched = self.fetched;
        plan.columns = self.columns;
        for node in self.sources {
            plan.add_node(node);
        }
        if let Some(predicate) = self.predicate {
            plan.add_node(PlanNode::Filter { predicate });
        }
        if let Some((group_by, having)) = self.aggregate {
            plan.add_node(PlanNode::Aggregate { group_by, having });
        }

        let rest = BoundRest {
            sort_keys: self.sort_keys,
            projections: self.projections,
            offset: self.offset,
            limit: self.limit,
        };
        (plan, rest)
    }

    fn into_execution_plan(self) -> ExecutionPlan {
        let (mut plan, rest) = self.filtered();
        if !rest.sort_keys.is_empty() {
            plan.add_node(PlanNode::Sort { keys: rest.sort_keys });
        }
        if rest.offset > 0 || rest.limit.is_some() {
            plan.add_node(PlanNode::Slice {
                offset: rest.offset,
                limit: rest.limit,
            });
        }
        plan.add_node(PlanNode::Projection {
            columns: rest.projections,
        });
        plan
    }

    fn into_count_plan(self) -> ExecutionPlan {
        let (mut plan, _) = self.filtered();
        plan.fetched.clear();
        plan.columns = vec![vec![ColumnMetadata::new("count", DataType::Integer, false)]];
        plan.add_node(PlanNode::Count);
        plan
    }
}

struct BoundRest {
    sort_keys: Vec<SortKey>,
    projections: Vec<ProjectedColumn>,
    offset: u64,
    limit: Option<u64>,
}

/// Resolves a [`QueryPlan`] against a catalog, validating as it goes
struct Binder<'a> {
    catalog: &'a dyn Catalog,
    null_ordering: NullOrderingDefault,
    next_subquery: usize,
}

impl<'a> Binder<'a> {
    fn new(catalog: &'a dyn Catalog, null_ordering: NullOrderingDefault) -> Self {
        Self {
            catalog,
            null_ordering,
            next_subquery: 0,
        }
    }

    fn bind_query(&mut self, plan: &QueryPlan, outer: &[&AliasScope]) -> Result<BoundQuery, PlanError> {
        if plan.sources.is_empty() {
            return Err(PlanError::MissingSource);
        }

        let mut scope = AliasScope::new();
        let mut sources = Vec::with_capacity(plan.sources.len() + plan.joins.len());
        let mut fetched = Vec::new();

        for (i, source) in plan.sources.iter().enumerate() {
            let slot = scope.bind(source, self.catalog)?;
            sources.push(if i == 0 {
                PlanNode::Scan {
                    table: source.table.clone(),
                    slot,
                }
            } else {
                PlanNode::Join {
                    table: source.table.clone(),
                    slot,
                    kind: JoinKind::Cross,
                    link: None,
                    condition: None,
                }
            });
        }

        for join in &plan.joins {
            let (slot, link) = scope.bind_join(join, self.catalog)?;
            let condition = match &join.condition {
                Some(condition) => {
                    if condition.contains_aggregate() {
                        return Err(PlanError::MisplacedAggregate(format!("join condition {}", condition)));
                    }
                    Some(self.bind_expr(condition, &scope, outer)?)
                }
                None => None,
            };
            if let (true, Some(link)) = (join.fetch, &link) {
                fetched.push(FetchedAssociation {
                    owner_slot: link.owner_slot,
                    association: link.association.clone(),
                    target_slot: slot,
                });
            }
            sources.push(PlanNode::Join {
                table: join.target.table.clone(),
                slot,
                kind: join.kind,
                link,
                condition,
            });
        }

        if plan.projections.is_empty() {
            return Err(PlanError::InvalidProjection("query selects nothing".to_string()));
        }
        let mut projections = Vec::with_capacity(plan.projections.len());
        let mut columns = Vec::with_capacity(plan.projections.len());
        for expr in &plan.projections {
            let (projected, metadata) = self.bind_projection(expr, &scope, outer)?;
            projections.push(projected);
            columns.push(metadata);
        }

        let predicate = match &plan.predicate {
            Some(predicate) => {
                if predicate.contains_aggregate() {
                    return Err(PlanError::MisplacedAggregate(format!("filter {}", predicate)));
                }
                Some(self.bind_expr(predicate, &scope, outer)?)
            }
            None => None,
        };

        let aggregate = if plan.is_aggregating() {
            let mut group_by = Vec::with_capacity(plan.group_by.len());
            for key in &plan.group_by {
                if key.contains_aggregate() {
                    return Err(PlanError::InvalidGroupBy(format!("cannot group by aggregate {}", key)));
                }
                group_by.push(self.bind_expr(key, &scope, outer)?);
            }

            for expr in &plan.projections {
                if !is_grouped(expr, &plan.group_by) {
                    return Err(PlanError::InvalidGroupBy(format!(
                        "{} is neither grouped nor aggregated",
                        expr
                    )));
                }
            }
            if let Some(having) = &plan.having {
                if !is_grouped(having, &plan.group_by) {
                    return Err(PlanError::InvalidGroupBy(format!(
                        "having {} references ungrouped values",
                        having
                    )));
                }
            }
            for spec in &plan.order_by {
                if !is_grouped(&spec.expr, &plan.group_by) {
                    return Err(PlanError::InvalidOrderBy(format!(
                        "{} is neither grouped nor aggregated",
                        spec.expr
                    )));
                }
            }

            let having = match &plan.having {
                Some(having) => Some(self.bind_expr(having, &scope, outer)?),
                None => None,
            };
            Some((group_by, having))
        } else {
            None
        };

        let mut sort_keys = Vec::with_capacity(plan.order_by.len());
        for spec in &plan.order_by {
            sort_keys.push(self.bind_sort_key(spec, &scope, outer)?);
        }

        Ok(BoundQuery {
            scope,
            sources,
            fetched,
            predicate,
            aggregate,
            sort_keys,
            projections,
            columns,
            offset: plan.offset,
            limit: plan.limit,
        })
    }

    fn bind_projection(
        &mut self,
        expr: &Expr,
        scope: &AliasScope,
        outer: &[&AliasScope],
    ) -> Result<(ProjectedColumn, Vec<ColumnMetadata>), PlanError> {
        if let Expr::Entity(alias) = expr {
            let slot = resolve_alias(alias, scope, outer)?;
            let metadata = scope.slots[slot]
                .schema
                .columns
                .iter()
                .map(|c| ColumnMetadata::new(&format!("{}.{}", alias, c.name), c.data_type, true))
                .collect();
            return Ok((ProjectedColumn::Entity { slot }, metadata));
        }

        let bound = self.bind_expr(expr, scope, outer)?;
        let data_type = infer_type(&bound, scope);
        Ok((
            ProjectedColumn::Value(bound),
            vec![ColumnMetadata::new(&expr.to_string(), data_type, true)],
        ))
    }

    fn bind_sort_key(
        &mut self,
        spec: &OrderSpecifier,
        scope: &AliasScope,
        outer: &[&AliasScope],
    ) -> Result<SortKey, PlanError> {
        let descending = spec.direction == OrderDirection::Descending;
        let nulls_first = match (spec.nulls, self.null_ordering) {
            (Some(NullOrdering::NullsFirst), _) => true,
            (Some(NullOrdering::NullsLast), _) => false,
            (None, NullOrderingDefault::NullsLargest) => descending,
            (None, NullOrderingDefault::NullsSmallest) => !descending,
        };

        Ok(SortKey {
            expr: self.bind_expr(&spec.expr, scope, outer)?,
            descending,
            nulls_first,
        })
    }

    fn bind_subquery(
        &mut self,
        subquery: &SubQuery,
        scope: &AliasScope,
        outer: &[&AliasScope],
    ) -> Result<BoundSubquery, PlanError> {
        if let Some(problem) = subquery.problem() {
            return Err(PlanError::InvalidSubquery(problem.to_string()));
        }
        let plan = subquery.plan();
        if plan.projections.len() != 1 {
            return Err(PlanError::InvalidSubquery(format!(
                "expected exactly one projection, found {}",
                plan.projections.len()
            )));
        }

        let mut enclosing: Vec<&AliasScope> = outer.to_vec();
        enclosing.push(scope);

        let id = self.next_subquery;
        self.next_subquery += 1;
        let bound = self.bind_query(plan, &enclosing)?;

        Ok(BoundSubquery {
            id,
            plan: Box::new(bound.into_execution_plan()),
        })
    }

    fn bind_expr(&mut self, expr: &Expr, scope: &AliasScope, outer: &[&AliasScope]) -> Result<BoundExpr, PlanError> {
        let bound = match expr {
            Expr::Column(col) => {
                let slot = resolve_alias(&col.alias, scope, outer)?;
                let index = scope.slots[slot]
                    .schema
                    .column_index(&col.column)
                    .ok_or_else(|| PlanError::UnknownColumn {
                        alias: col.alias.clone(),
                        column: col.column.clone(),
                    })?;
                BoundExpr::Column { slot, index }
            }
            Expr::Entity(alias) => BoundExpr::Entity {
                slot: resolve_alias(alias, scope, outer)?,
            },
            Expr::Literal(value) => BoundExpr::Literal(value.clone()),
            Expr::Compare { op, left, right } => BoundExpr::Compare {
                op: *op,
                left: Box::new(self.bind_expr(left, scope, outer)?),
                right: Box::new(self.bind_expr(right, scope, outer)?),
            },
            Expr::Between { expr, low, high } => BoundExpr::Between {
                expr: Box::new(self.bind_expr(expr, scope, outer)?),
                low: Box::new(self.bind_expr(low, scope, outer)?),
                high: Box::new(self.bind_expr(high, scope, outer)?),
            },
            Expr::InList { expr, list, negated } => BoundExpr::InList {
                expr: Box::new(self.bind_expr(expr, scope, outer)?),
                list: self.bind_all(list, scope, outer)?,
                negated: *negated,
            },
            Expr::InSubquery { expr, subquery, negated } => BoundExpr::InSubquery {
                expr: Box::new(self.bind_expr(expr, scope, outer)?),
                subquery: self.bind_subquery(subquery, scope, outer)?,
                negated: *negated,
            },
            Expr::IsNull { expr, negated } => BoundExpr::IsNull {
                expr: Box::new(self.bind_expr(expr, scope, outer)?),
                negated: *negated,
            },
            Expr::And(operands) => BoundExpr::And(self.bind_all(operands, scope, outer)?),
            Expr::Or(operands) => BoundExpr::Or(self.bind_all(operands, scope, outer)?),
            Expr::Not(expr) => BoundExpr::Not(Box::new(self.bind_expr(expr, scope, outer)?)),
            Expr::Like { expr, pattern } => {
                if pattern.regex().is_none() {
                    return Err(PlanError::InvalidPattern(pattern.as_str().to_string()));
                }
                BoundExpr::Like {
                    expr: Box::new(self.bind_expr(expr, scope, outer)?),
                    pattern: pattern.clone(),
                }
            }
            Expr::Concat(left, right) => BoundExpr::Concat(
                Box::new(self.bind_expr(left, scope, outer)?),
                Box::new(self.bind_expr(right, scope, outer)?),
            ),
            Expr::StringValue(expr) => BoundExpr::StringValue(Box::new(self.bind_expr(expr, scope, outer)?)),
            Expr::Aggregate { func, arg } => {
                if arg.contains_aggregate() {
                    return Err(PlanError::MisplacedAggregate(format!("nested aggregate in {}", expr)));
                }
                BoundExpr::Aggregate {
                    func: *func,
                    arg: Box::new(self.bind_expr(arg, scope, outer)?),
                }
            }
            Expr::Case { branches, otherwise } => {
                let mut bound_branches = Vec::with_capacity(branches.len());
                for (condition, result) in branches {
                    bound_branches.push((
                        self.bind_expr(condition, scope, outer)?,
                        self.bind_expr(result, scope, outer)?,
                    ));
                }
                BoundExpr::Case {
                    branches: bound_branches,
                    otherwise: Box::new(self.bind_expr(otherwise, scope, outer)?),
                }
            }
            Expr::Subquery(subquery) => BoundExpr::Subquery(self.bind_subquery(subquery, scope, outer)?),
        };
        Ok(bound)
    }

    fn bind_all(&mut self, exprs: &[Expr], scope: &AliasScope, outer: &[&AliasScope]) -> Result<Vec<BoundExpr>, PlanError> {
        exprs.iter().map(|e| self.bind_expr(e, scope, outer)).collect()
    }
}

fn resolve_alias(alias: &str, scope: &AliasScope, outer: &[&AliasScope]) -> Result<usize, PlanError> {
    scope.slot(alias).ok_or_else(|| {
        if outer.iter().any(|s| s.slot(alias).is_some()) {
            PlanError::CorrelatedSubquery(alias.to_string())
        } else {
            PlanError::UnboundAlias(alias.to_string())
        }
    })
}

/// Whether `expr` yields one value per group: grouping keys, aggregates and constants
fn is_grouped(expr: &Expr, group_by: &[Expr]) -> bool {
    if group_by.contains(expr) {
        return true;
    }
    match expr {
        Expr::Aggregate { .. } | Expr::Literal(_) | Expr::Subquery(_) => true,
        // grouping by an entity fixes every column of that entity
        Expr::Column(col) => group_by
            .iter()
            .any(|key| matches!(key, Expr::Entity(alias) if *alias == col.alias)),
        Expr::Entity(_) => false,
        other => other.children().into_iter().all(|child| is_grouped(child, group_by)),
    }
}

fn infer_type(expr: &BoundExpr, scope: &AliasScope) -> DataType {
    match expr {
        BoundExpr::Column { slot, index } => scope.slots[*slot].schema.columns[*index].data_type,
        BoundExpr::Entity { .. } => DataType::Integer,
        BoundExpr::Literal(value) => value.data_type().unwrap_or(DataType::Text),
        BoundExpr::Compare { .. }
        | BoundExpr::Between { .. }
        | BoundExpr::InList { .. }
        | BoundExpr::InSubquery { .. }
        | BoundExpr::IsNull { .. }
        | BoundExpr::And(_)
        | BoundExpr::Or(_)
        | BoundExpr::Not(_)
        | BoundExpr::Like { .. } => DataType::Boolean,
        BoundExpr::Concat(..) | BoundExpr::StringValue(_) => DataType::Text,
        BoundExpr::Aggregate { func, arg } => match func {
            AggregateFunc::Count => DataType::Integer,
            AggregateFunc::Avg => DataType::Float,
            AggregateFunc::Sum | AggregateFunc::Min | AggregateFunc::Max => infer_type(arg, scope),
        },
        BoundExpr::Case { branches, otherwise } => branches
            .first()
            .map(|(_, result)| infer_type(result, scope))
            .unwrap_or_else(|| infer_type(otherwise, scope)),
        BoundExpr::Subquery(subquery) => subquery
            .plan
            .columns
            .first()
            .and_then(|c| c.first())
            .map(|c| c.data_type)
            .unwrap_or(DataType::Text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::query_builder::sub_select;
    use crate::store::{fixture, RowStore};
    use crate::utils::error::EngineError;

    fn store() -> RowStore {
        let store = RowStore::new();
        fixture::create_tables(&store).unwrap();
        store
    }

    fn member_plan() -> QueryPlan {
        let mut plan = QueryPlan::new(vec![fixture::member().entity()]);
        plan.sources.push(fixture::member());
        plan
    }

    fn plan_error(result: EngineResult<ExecutionPlan>) -> PlanError {
        match result {
            Err(EngineError::Plan(e)) => e,
            other => panic!("Expected Plan error, got {:?}", other.map(|p| p.nodes.len())),
        }
    }

    #[test]
    fn test_default_query_planner_creation() {
        let planner = DefaultQueryPlanner::new();

        assert_eq!(planner.base_scan_cost, 1.0);
        assert_eq!(planner.predicate_cost_multiplier, 0.1);
        assert_eq!(planner.sort_cost, 0.5);
        assert_eq!(planner.limit_cost, 0.1);
        assert_eq!(planner.null_ordering, NullOrderingDefault::NullsLargest);
    }

    #[test]
    fn test_simple_select_pipeline() {
        let store = store();
        let plan = DefaultQueryPlanner::new().create_execution_plan(&member_plan(), &store).unwrap();

        assert_eq!(plan.nodes.len(), 2);
        assert!(matches!(plan.nodes[0], PlanNode::Scan { slot: 0, .. }));
        assert!(matches!(plan.root_node(), Some(PlanNode::Projection { .. })));
        assert_eq!(plan.columns[0].len(), 4);
        assert_eq!(plan.columns[0][1].name, "member.username");
        assert_eq!(plan.estimated_cost, 1.0);
    }

    #[test]
    fn test_pipeline_order_and_cost() {
        let store = store();
        let member = fixture::member();
        let mut query = member_plan();
        query.predicate = Some(member.col("age").gt(10));
        query.order_by.push(member.col("age").desc());
        query.offset = 1;
        query.limit = Some(2);

        let plan = DefaultQueryPlanner::new().create_execution_plan(&query, &store).unwrap();
        let kinds: Vec<&str> = plan
            .nodes
            .iter()
            .map(|n| match n {
                PlanNode::Scan { .. } => "scan",
                PlanNode::Filter { .. } => "filter",
                PlanNode::Sort { .. } => "sort",
                PlanNode::Slice { .. } => "slice",
                PlanNode::Projection { .. } => "projection",
                _ => "other",
            })
            .collect();
        assert_eq!(kinds, vec!["scan", "filter", "sort", "slice", "projection"]);
        assert!((plan.estimated_cost - 1.7).abs() < 1e-9);
    }

    #[test]
    fn test_count_plan_drops_order_and_paging() {
        let store = store();
        let member = fixture::member();
        let mut query = member_plan();
        query.predicate = Some(member.col("age").gt(10));
        query.order_by.push(member.col("age").desc());
        query.limit = Some(2);

        let plan = DefaultQueryPlanner::new().create_count_plan(&query, &store).unwrap();
        assert_eq!(plan.nodes.len(), 3);
        assert!(matches!(plan.nodes[1], PlanNode::Filter { .. }));
        assert!(plan.is_count());
    }

    #[test]
    fn test_null_ordering_defaults() {
        let store = store();
        let member = fixture::member();
        let mut query = member_plan();
        query.order_by = vec![
            member.col("username").asc(),
            member.col("age").desc(),
            member.col("username").desc().nulls_last(),
        ];

        let keys = |planner: DefaultQueryPlanner| -> Vec<bool> {
            let plan = planner.create_execution_plan(&query, &store).unwrap();
            plan.nodes
                .iter()
                .find_map(|n| match n {
                    PlanNode::Sort { keys } => Some(keys.iter().map(|k| k.nulls_first).collect()),
                    _ => None,
                })
                .unwrap()
        };

        assert_eq!(keys(DefaultQueryPlanner::new()), vec![false, true, false]);
        assert_eq!(
            keys(DefaultQueryPlanner::new().with_null_ordering(NullOrderingDefault::NullsSmallest)),
            vec![true, false, false]
        );
    }

    #[test]
    fn test_association_join_binding() {
        let store = store();
        let member = fixture::member();
        let team = fixture::team();
        let mut query = member_plan();
        let mut join = JoinClause::new(JoinKind::Inner, &team, Some(member.relation("team")));
        join.fetch = true;
        query.joins.push(join);

        let plan = DefaultQueryPlanner::new().create_execution_plan(&query, &store).unwrap();
        match &plan.nodes[1] {
            PlanNode::Join { slot, link: Some(link), .. } => {
                assert_eq!(*slot, 1);
                assert_eq!(link.owner_slot, 0);
                assert_eq!(link.fk_index, 3);
            }
            other => panic!("Expected linked Join node, got {:?}", other),
        }
        assert_eq!(plan.fetched.len(), 1);
        assert_eq!(plan.fetched[0].target_slot, 1);
    }

    #[test]
    fn test_unknown_names_are_rejected() {
        let store = store();
        let planner = DefaultQueryPlanner::new();
        let member = fixture::member();

        let mut query = member_plan();
        query.sources[0] = EntityPath::new("Club", "club");
        assert_eq!(plan_error(planner.create_execution_plan(&query, &store)), PlanError::UnknownTable("Club".into()));

        let mut query = member_plan();
        query.predicate = Some(fixture::team().col("name").eq("teamA"));
        assert_eq!(plan_error(planner.create_execution_plan(&query, &store)), PlanError::UnboundAlias("team".into()));

        let mut query = member_plan();
        query.predicate = Some(member.col("email").eq("x"));
        assert!(matches!(
            plan_error(planner.create_execution_plan(&query, &store)),
            PlanError::UnknownColumn { .. }
        ));

        let mut query = member_plan();
        query.sources.push(fixture::member());
        assert_eq!(plan_error(planner.create_execution_plan(&query, &store)), PlanError::DuplicateAlias("member".into()));

        let query = QueryPlan::new(vec![member.entity()]);
        assert_eq!(plan_error(planner.create_execution_plan(&query, &store)), PlanError::MissingSource);
    }

    #[test]
    fn test_association_must_match_target() {
        let store = store();
        let member = fixture::member();
        let mut query = member_plan();
        query
            .joins
            .push(JoinClause::new(JoinKind::Inner, &fixture::member_as("other"), Some(member.relation("team"))));

        assert!(matches!(
            plan_error(DefaultQueryPlanner::new().create_execution_plan(&query, &store)),
            PlanError::AssociationTarget { .. }
        ));

        let mut query = member_plan();
        query
            .joins
            .push(JoinClause::new(JoinKind::Inner, &fixture::team(), Some(member.relation("club"))));
        assert!(matches!(
            plan_error(DefaultQueryPlanner::new().create_execution_plan(&query, &store)),
            PlanError::UnknownAssociation { .. }
        ));
    }

    #[test]
    fn test_grouping_validation() {
        let store = store();
        let member = fixture::member();
        let planner = DefaultQueryPlanner::new();

        let mut query = member_plan();
        query.projections = vec![member.col("username"), member.col("age").avg()];
        query.group_by = vec![member.col("team_id")];
        assert!(matches!(
            plan_error(planner.create_execution_plan(&query, &store)),
            PlanError::InvalidGroupBy(_)
        ));

        let mut query = member_plan();
        query.projections = vec![member.col("team_id"), member.col("age").avg()];
        query.group_by = vec![member.col("team_id")];
        query.order_by = vec![member.col("username").asc()];
        assert!(matches!(
            plan_error(planner.create_execution_plan(&query, &store)),
            PlanError::InvalidOrderBy(_)
        ));

        query.order_by = vec![member.col("age").avg().desc()];
        let plan = planner.create_execution_plan(&query, &store).unwrap();
        assert!(plan.nodes.iter().any(|n| matches!(n, PlanNode::Aggregate { .. })));
        assert_eq!(plan.columns[1][0].data_type, DataType::Float);
    }

    #[test]
    fn test_aggregate_in_filter_is_rejected() {
        let store = store();
        let member = fixture::member();
        let mut query = member_plan();
        query.predicate = Some(member.col("age").max().eq(40));

        assert!(matches!(
            plan_error(DefaultQueryPlanner::new().create_execution_plan(&query, &store)),
            PlanError::MisplacedAggregate(_)
        ));
    }

    #[test]
    fn test_subquery_binding() {
        let store = store();
        let member = fixture::member();
        let member_sub = fixture::member_as("memberSub");

        let mut query = member_plan();
        query.predicate = Some(member.col("age").eq(sub_select(member_sub.col("age").max()).from(&member_sub)));
        let plan = DefaultQueryPlanner::new().create_execution_plan(&query, &store).unwrap();
        match &plan.nodes[1] {
            PlanNode::Filter {
                predicate: BoundExpr::Compare { right, .. },
            } => assert!(matches!(right.as_ref(), BoundExpr::Subquery(BoundSubquery { id: 0, .. }))),
            other => panic!("Expected Filter with subquery, got {:?}", other),
        }
    }

    #[test]
    fn test_correlated_subquery_is_rejected() {
        let store = store();
        let member = fixture::member();
        let member_sub = fixture::member_as("memberSub");

        let mut query = member_plan();
        query.predicate = Some(
            member.col("age").eq(sub_select(member_sub.col("age").max())
                .from(&member_sub)
                .filter(member_sub.col("team_id").eq(member.col("team_id")))),
        );

        assert_eq!(
            plan_error(DefaultQueryPlanner::new().create_execution_plan(&query, &store)),
            PlanError::CorrelatedSubquery("member".into())
        );
    }

    #[test]
    fn test_check_expr_against_partial_scope() {
        let store = store();
        let mut scope = AliasScope::new();
        scope.bind(&fixture::member(), &store).unwrap();

        assert!(check_expr(&store, &fixture::member().col("age").gt(1), &scope).is_ok());
        assert_eq!(
            check_expr(&store, &fixture::team().col("name").is_null(), &scope),
            Err(PlanError::UnboundAlias("team".into()))
        );
        assert_eq!(
            check_expr(&store, &fixture::member().col("username").like("a\\"), &scope),
            Ok(())
        );
    }
}
