use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Instant;
use tracing::debug;
use crate::{
    engine::{
        expression::{AggregateFunc, CompareOp},
        materializer::{Datum, Entity},
        query_planner::{
            BoundExpr, BoundSubquery, ExecutionPlan, JoinKind, JoinLink, PlanNode, ProjectedColumn, SortKey,
        },
    },
    store::{Snapshot, StoredRow},
    utils::{
        error::{EngineError, EngineResult},
        types::Value,
    },
};

/// Trait for query execution functionality
pub trait QueryExecutor: Send + Sync {
    /// Run a plan against one consistent view of the store
    fn execute_plan(&self, plan: &ExecutionPlan, snapshot: &Snapshot<'_>) -> EngineResult<Vec<Vec<Datum>>>;
}

/// Default implementation of QueryExecutor: nested-loop joins and in-memory sort and grouping
pub struct DefaultQueryExecutor;

impl DefaultQueryExecutor {
    pub fn new() -> Self {
        Self
    }
}

impl Default for DefaultQueryExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryExecutor for DefaultQueryExecutor {
    fn execute_plan(&self, plan: &ExecutionPlan, snapshot: &Snapshot<'_>) -> EngineResult<Vec<Vec<Datum>>> {
        let start = Instant::now();
        let context = ExecContext::new(snapshot);
        let output = context.run(plan)?;

        debug!(
            rows_scanned = context.scanned.get(),
            rows_produced = output.len(),
            subqueries = context.subqueries.borrow().len(),
            elapsed_us = start.elapsed().as_micros() as u64,
            "executed plan"
        );
        Ok(output)
    }
}

/// One candidate output row: a stored row (or nothing, after a left join miss) per bound alias
type Frame<'s> = Vec<Option<&'s StoredRow>>;

/// Data flowing between pipeline stages
enum Tuples<'s> {
    Rows(Vec<Frame<'s>>),
    Groups(Vec<Vec<Frame<'s>>>),
    Output(Vec<Vec<Datum>>),
}

impl Tuples<'_> {
    fn len(&self) -> usize {
        match self {
            Tuples::Rows(rows) => rows.len(),
            Tuples::Groups(groups) => groups.len(),
            Tuples::Output(output) => output.len(),
        }
    }
}

/// What an expression is evaluated against
#[derive(Clone, Copy)]
enum EvalScope<'a, 's> {
    Row(&'a [Option<&'s StoredRow>]),
    /// Non-aggregate expressions read the group's first frame
    Group(&'a [Frame<'s>]),
}

impl<'a, 's> EvalScope<'a, 's> {
    fn row(&self, slot: usize) -> Option<&'s StoredRow> {
        match self {
            EvalScope::Row(frame) => frame.get(slot).copied().flatten(),
            EvalScope::Group(frames) => frames.first().and_then(|f| f.get(slot).copied().flatten()),
        }
    }
}

trait ScopeSource<'s> {
    fn scope(&self) -> EvalScope<'_, 's>;
}

impl<'s> ScopeSource<'s> for Frame<'s> {
    fn scope(&self) -> EvalScope<'_, 's> {
        EvalScope::Row(self)
    }
}

impl<'s> ScopeSource<'s> for Vec<Frame<'s>> {
    fn scope(&self) -> EvalScope<'_, 's> {
        EvalScope::Group(self)
    }
}

/// Per-execution state: the snapshot and the results of subqueries run so far
struct ExecContext<'s, 'g> {
    snapshot: &'s Snapshot<'g>,
    subqueries: RefCell<HashMap<usize, Rc<Vec<Value>>>>,
    scanned: Cell<usize>,
}

impl<'s, 'g> ExecContext<'s, 'g> {
    fn new(snapshot: &'s Snapshot<'g>) -> Self {
        Self {
            snapshot,
            subqueries: RefCell::new(HashMap::new()),
            scanned: Cell::new(0),
        }
    }

    fn run(&self, plan: &ExecutionPlan) -> EngineResult<Vec<Vec<Datum>>> {
        let mut tuples = Tuples::Rows(Vec::new());
        for node in &plan.nodes {
            tuples = self.apply(node, tuples, plan)?;
        }

        match tuples {
            Tuples::Output(output) => Ok(output),
            _ => Err(EngineError::Internal(
                "execution plan does not end in a projection or count".to_string(),
            )),
        }
    }

    fn apply(&self, node: &PlanNode, input: Tuples<'s>, plan: &ExecutionPlan) -> EngineResult<Tuples<'s>> {
        let width = plan.scope.len();
        let output = match (node, input) {
            (PlanNode::Scan { table, slot }, _) => {
                let rows = self.snapshot.rows(table)?;
                self.scanned.set(self.scanned.get() + rows.len());
                Tuples::Rows(
                    rows.iter()
                        .map(|row| {
                            let mut frame = vec![None; width];
                            frame[*slot] = Some(row);
                            frame
                        })
                        .collect(),
                )
            }
            (PlanNode::Join { table, slot, kind, link, condition }, Tuples::Rows(frames)) => {
                Tuples::Rows(self.join(frames, table, *slot, *kind, link.as_ref(), condition.as_ref())?)
            }
            (PlanNode::Filter { predicate }, Tuples::Rows(frames)) => {
                let mut kept = Vec::with_capacity(frames.len());
                for frame in frames {
                    if self.is_true(predicate, EvalScope::Row(&frame))? {
                        kept.push(frame);
                    }
                }
                Tuples::Rows(kept)
            }
            (PlanNode::Aggregate { group_by, having }, Tuples::Rows(frames)) => {
                Tuples::Groups(self.group(frames, group_by, having.as_ref())?)
            }
            (PlanNode::Sort { keys }, Tuples::Rows(frames)) => Tuples::Rows(self.sort(frames, keys)?),
            (PlanNode::Sort { keys }, Tuples::Groups(groups)) => Tuples::Groups(self.sort(groups, keys)?),
            (PlanNode::Slice { offset, limit }, Tuples::Rows(frames)) => Tuples::Rows(slice(frames, *offset, *limit)),
            (PlanNode::Slice { offset, limit }, Tuples::Groups(groups)) => {
                Tuples::Groups(slice(groups, *offset, *limit))
            }
            (PlanNode::Projection { columns }, Tuples::Rows(frames)) => {
                Tuples::Output(self.project(&frames, columns, plan)?)
            }
            (PlanNode::Projection { columns }, Tuples::Groups(groups)) => {
                Tuples::Output(self.project(&groups, columns, plan)?)
            }
            (PlanNode::Count, input) => {
                Tuples::Output(vec![vec![Datum::Value(Value::Integer(input.len() as i64))]])
            }
            (node, _) => {
                return Err(EngineError::Internal(format!(
                    "plan stage out of order: {:?}",
                    std::mem::discriminant(node)
                )))
            }
        };
        Ok(output)
    }

    fn join(
        &self,
        frames: Vec<Frame<'s>>,
        table: &str,
        slot: usize,
        kind: JoinKind,
        link: Option<&JoinLink>,
        condition: Option<&BoundExpr>,
    ) -> EngineResult<Vec<Frame<'s>>> {
        let targets = self.snapshot.rows(table)?;
        self.scanned.set(self.scanned.get() + targets.len());

        let mut joined = Vec::new();
        for frame in frames {
            let mut matched = false;
            for target in targets {
                if let Some(link) = link {
                    if !link_matches(&frame, link, target) {
                        continue;
                    }
                }

                let mut candidate = frame.clone();
                candidate[slot] = Some(target);
                if let Some(condition) = condition {
                    if !self.is_true(condition, EvalScope::Row(&candidate))? {
                        continue;
                    }
                }

                matched = true;
                joined.push(candidate);
            }

            if !matched && kind == JoinKind::Left {
                joined.push(frame);
            }
        }
        Ok(joined)
    }

    /// Partition frames by key, keeping groups in first-encountered order
    fn group(
        &self,
        frames: Vec<Frame<'s>>,
        group_by: &[BoundExpr],
        having: Option<&BoundExpr>,
    ) -> EngineResult<Vec<Vec<Frame<'s>>>> {
        let mut groups: Vec<(Vec<Value>, Vec<Frame<'s>>)> = Vec::new();

        if group_by.is_empty() {
            groups.push((Vec::new(), frames));
        } else {
            for frame in frames {
                let key = group_by
                    .iter()
                    .map(|expr| self.evaluate(expr, EvalScope::Row(&frame)))
                    .collect::<EngineResult<Vec<_>>>()?;

                match groups.iter_mut().find(|(existing, _)| keys_equal(existing, &key)) {
                    Some((_, members)) => members.push(frame),
                    None => groups.push((key, vec![frame])),
                }
            }
        }

        let mut kept = Vec::with_capacity(groups.len());
        for (_, members) in groups {
            if let Some(having) = having {
                if !self.is_true(having, EvalScope::Group(&members))? {
                    continue;
                }
            }
            kept.push(members);
        }
        Ok(kept)
    }

    /// Stable multi-key sort; keys are evaluated once per item
    fn sort<T: ScopeSource<'s>>(&self, items: Vec<T>, keys: &[SortKey]) -> EngineResult<Vec<T>> {
        let mut keyed = Vec::with_capacity(items.len());
        for item in items {
            let values = keys
                .iter()
                .map(|key| self.evaluate(&key.expr, item.scope()))
                .collect::<EngineResult<Vec<_>>>()?;
            keyed.push((values, item));
        }

        keyed.sort_by(|(a, _), (b, _)| compare_keys(a, b, keys));
        Ok(keyed.into_iter().map(|(_, item)| item).collect())
    }

    fn project<T: ScopeSource<'s>>(
        &self,
        items: &[T],
        columns: &[ProjectedColumn],
        plan: &ExecutionPlan,
    ) -> EngineResult<Vec<Vec<Datum>>> {
        let mut output = Vec::with_capacity(items.len());
        for item in items {
            let scope = item.scope();
            let mut row = Vec::with_capacity(columns.len());
            for column in columns {
                row.push(match column {
                    ProjectedColumn::Entity { slot } => Datum::Entity(self.entity_at(plan, scope, *slot)),
                    ProjectedColumn::Value(expr) => Datum::Value(self.evaluate(expr, scope)?),
                });
            }
            output.push(row);
        }
        Ok(output)
    }

    /// Materialize the row in `slot`, attaching associations that were fetch-joined alongside it
    fn entity_at(&self, plan: &ExecutionPlan, scope: EvalScope<'_, 's>, slot: usize) -> Option<Entity> {
        let stored = scope.row(slot)?;
        let schema = plan.scope.slots()[slot].schema.clone();
        let mut entity = Entity::from_row(schema, stored);

        for fetched in plan.fetched.iter().filter(|f| f.owner_slot == slot) {
            if let Some(related) = self.entity_at(plan, scope, fetched.target_slot) {
                entity.mark_loaded(&fetched.association, related);
            }
        }
        Some(entity)
    }

    fn is_true(&self, expr: &BoundExpr, scope: EvalScope<'_, 's>) -> EngineResult<bool> {
        Ok(truth(self.evaluate(expr, scope)?)? == Some(true))
    }

    fn evaluate(&self, expr: &BoundExpr, scope: EvalScope<'_, 's>) -> EngineResult<Value> {
        match expr {
            BoundExpr::Column { slot, index } => Ok(scope
                .row(*slot)
                .and_then(|r| r.row.get(*index).cloned())
                .unwrap_or(Value::Null)),
            BoundExpr::Entity { slot } => Ok(scope
                .row(*slot)
                .map(|r| Value::Integer(r.id.0))
                .unwrap_or(Value::Null)),
            BoundExpr::Literal(value) => Ok(value.clone()),
            BoundExpr::Compare { op, left, right } => {
                let left = self.evaluate(left, scope)?;
                let right = self.evaluate(right, scope)?;
                compare(*op, &left, &right)
            }
            BoundExpr::Between { expr, low, high } => {
                let value = self.evaluate(expr, scope)?;
                let above = compare(CompareOp::Ge, &value, &self.evaluate(low, scope)?)?;
                let below = compare(CompareOp::Le, &value, &self.evaluate(high, scope)?)?;
                Ok(and3(truth(above)?, truth(below)?))
            }
            BoundExpr::InList { expr, list, negated } => {
                let value = self.evaluate(expr, scope)?;
                let items = list
                    .iter()
                    .map(|item| self.evaluate(item, scope))
                    .collect::<EngineResult<Vec<_>>>()?;
                Ok(membership(&value, &items, *negated))
            }
            BoundExpr::InSubquery { expr, subquery, negated } => {
                let value = self.evaluate(expr, scope)?;
                let items = self.subquery_values(subquery)?;
                Ok(membership(&value, &items, *negated))
            }
            BoundExpr::IsNull { expr, negated } => {
                Ok(Value::Boolean(self.evaluate(expr, scope)?.is_null() != *negated))
            }
            BoundExpr::And(operands) => {
                let mut saw_null = false;
                for operand in operands {
                    match truth(self.evaluate(operand, scope)?)? {
                        Some(false) => return Ok(Value::Boolean(false)),
                        Some(true) => {}
                        None => saw_null = true,
                    }
                }
                Ok(if saw_null { Value::Null } else { Value::Boolean(true) })
            }
            BoundExpr::Or(operands) => {
                let mut saw_null = false;
                for operand in operands {
                    match truth(self.evaluate(operand, scope)?)? {
                        Some(true) => return Ok(Value::Boolean(true)),
                        Some(false) => {}
                        None => saw_null = true,
                    }
                }
                Ok(if saw_null { Value::Null } else { Value::Boolean(false) })
            }
            BoundExpr::Not(expr) => Ok(match truth(self.evaluate(expr, scope)?)? {
                Some(b) => Value::Boolean(!b),
                None => Value::Null,
            }),
            BoundExpr::Like { expr, pattern } => match self.evaluate(expr, scope)? {
                Value::Null => Ok(Value::Null),
                Value::Text(text) => Ok(Value::Boolean(pattern.matches(&text))),
                other => Err(EngineError::Execution(format!(
                    "like '{}' applied to non-text value {}",
                    pattern.as_str(),
                    other
                ))),
            },
            BoundExpr::Concat(left, right) => {
                let left = self.evaluate(left, scope)?;
                let right = self.evaluate(right, scope)?;
                if left.is_null() || right.is_null() {
                    Ok(Value::Null)
                } else {
                    Ok(Value::Text(format!("{}{}", left, right)))
                }
            }
            BoundExpr::StringValue(expr) => match self.evaluate(expr, scope)? {
                Value::Null => Ok(Value::Null),
                value => Ok(Value::Text(value.to_string())),
            },
            BoundExpr::Aggregate { func, arg } => match scope {
                EvalScope::Group(frames) => self.aggregate(*func, arg, frames),
                EvalScope::Row(_) => Err(EngineError::Execution(format!(
                    "{} evaluated outside a group",
                    func
                ))),
            },
            BoundExpr::Case { branches, otherwise } => {
                for (condition, result) in branches {
                    if self.is_true(condition, scope)? {
                        return self.evaluate(result, scope);
                    }
                }
                self.evaluate(otherwise, scope)
            }
            BoundExpr::Subquery(subquery) => {
                let values = self.subquery_values(subquery)?;
                match values.len() {
                    0 => Ok(Value::Null),
                    1 => Ok(values[0].clone()),
                    n => Err(EngineError::Execution(format!(
                        "scalar subquery returned {} rows",
                        n
                    ))),
                }
            }
        }
    }

    fn aggregate(&self, func: AggregateFunc, arg: &BoundExpr, frames: &[Frame<'s>]) -> EngineResult<Value> {
        let mut values = Vec::with_capacity(frames.len());
        for frame in frames {
            let value = self.evaluate(arg, EvalScope::Row(frame))?;
            if !value.is_null() {
                values.push(value);
            }
        }

        match func {
            AggregateFunc::Count => Ok(Value::Integer(values.len() as i64)),
            AggregateFunc::Sum => sum(&values),
            AggregateFunc::Avg => {
                if values.is_empty() {
                    return Ok(Value::Null);
                }
                let mut total = 0.0;
                for value in &values {
                    total += value
                        .as_f64()
                        .ok_or_else(|| EngineError::Execution(format!("avg over non-numeric value {}", value)))?;
                }
                Ok(Value::Float(total / values.len() as f64))
            }
            AggregateFunc::Min => extreme(values, Ordering::Less),
            AggregateFunc::Max => extreme(values, Ordering::Greater),
        }
    }

    /// Run a subquery once per execution and reuse its column afterwards
    fn subquery_values(&self, subquery: &BoundSubquery) -> EngineResult<Rc<Vec<Value>>> {
        let cached = self.subqueries.borrow().get(&subquery.id).cloned();
        if let Some(values) = cached {
            return Ok(values);
        }

        let values: Vec<Value> = self
            .run(&subquery.plan)?
            .into_iter()
            .map(|mut row| match row.pop() {
                Some(Datum::Value(value)) => value,
                Some(Datum::Entity(Some(entity))) => Value::Integer(entity.id().0),
                Some(Datum::Entity(None)) | None => Value::Null,
            })
            .collect();

        debug!(subquery = subquery.id, rows = values.len(), "evaluated subquery");
        let values = Rc::new(values);
        self.subqueries.borrow_mut().insert(subquery.id, values.clone());
        Ok(values)
    }
}

fn link_matches(frame: &[Option<&StoredRow>], link: &JoinLink, target: &StoredRow) -> bool {
    frame
        .get(link.owner_slot)
        .copied()
        .flatten()
        .and_then(|owner| owner.row.get(link.fk_index))
        .and_then(Value::as_i64)
        == Some(target.id.0)
}

fn slice<T>(items: Vec<T>, offset: u64, limit: Option<u64>) -> Vec<T> {
    let offset = usize::try_from(offset).unwrap_or(usize::MAX);
    let limit = limit
        .map(|l| usize::try_from(l).unwrap_or(usize::MAX))
        .unwrap_or(usize::MAX);
    items.into_iter().skip(offset).take(limit).collect()
}

fn keys_equal(a: &[Value], b: &[Value]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.group_eq(y))
}

/// Interpret a value as a SQL truth value
fn truth(value: Value) -> EngineResult<Option<bool>> {
    match value {
        Value::Boolean(b) => Ok(Some(b)),
        Value::Null => Ok(None),
        other => Err(EngineError::Execution(format!(
            "expected a boolean condition, found {}",
            other
        ))),
    }
}

fn and3(a: Option<bool>, b: Option<bool>) -> Value {
    match (a, b) {
        (Some(false), _) | (_, Some(false)) => Value::Boolean(false),
        (Some(true), Some(true)) => Value::Boolean(true),
        _ => Value::Null,
    }
}

fn compare(op: CompareOp, left: &Value, right: &Value) -> EngineResult<Value> {
    if left.is_null() || right.is_null() {
        return Ok(Value::Null);
    }

    let ordering = left
        .compare(right)
        .ok_or_else(|| EngineError::Execution(format!("cannot compare {} with {}", left, right)))?;
    let result = match op {
        CompareOp::Eq => ordering == Ordering::Equal,
        CompareOp::Ne => ordering != Ordering::Equal,
        CompareOp::Lt => ordering == Ordering::Less,
        CompareOp::Le => ordering != Ordering::Greater,
        CompareOp::Gt => ordering == Ordering::Greater,
        CompareOp::Ge => ordering != Ordering::Less,
    };
    Ok(Value::Boolean(result))
}

/// `in` semantics: a null operand, or no match with a null in the list, is unknown
fn membership(value: &Value, items: &[Value], negated: bool) -> Value {
    if value.is_null() {
        return Value::Null;
    }

    let mut saw_null = false;
    for item in items {
        if item.is_null() {
            saw_null = true;
        } else if value.compare(item) == Some(Ordering::Equal) {
            return Value::Boolean(!negated);
        }
    }

    if saw_null {
        Value::Null
    } else {
        Value::Boolean(negated)
    }
}

fn sum(values: &[Value]) -> EngineResult<Value> {
    if values.is_empty() {
        return Ok(Value::Null);
    }

    if values.iter().all(|v| matches!(v, Value::Integer(_))) {
        let mut total: i64 = 0;
        for value in values {
            if let Value::Integer(i) = value {
                total = total
                    .checked_add(*i)
                    .ok_or_else(|| EngineError::Execution("integer overflow in sum".to_string()))?;
            }
        }
        return Ok(Value::Integer(total));
    }

    let mut total = 0.0;
    for value in values {
        total += value
            .as_f64()
            .ok_or_else(|| EngineError::Execution(format!("sum over non-numeric value {}", value)))?;
    }
    Ok(Value::Float(total))
}

/// Smallest (`Less`) or largest (`Greater`) value
fn extreme(values: Vec<Value>, wanted: Ordering) -> EngineResult<Value> {
    let mut best: Option<Value> = None;
    for value in values {
        best = match best {
            None => Some(value),
            Some(current) => {
                let ordering = value.compare(&current).ok_or_else(|| {
                    EngineError::Execution(format!("cannot compare {} with {}", value, current))
                })?;
                Some(if ordering == wanted { value } else { current })
            }
        };
    }
    Ok(best.unwrap_or(Value::Null))
}

/// Order two sort-key tuples; null placement is fixed regardless of direction
fn compare_keys(a: &[Value], b: &[Value], keys: &[SortKey]) -> Ordering {
    for ((x, y), key) in a.iter().zip(b).zip(keys) {
        let ordering = match (x.is_null(), y.is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) if key.nulls_first => Ordering::Less,
            (true, false) => Ordering::Greater,
            (false, true) if key.nulls_first => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => {
                let ordering = compare_values(x, y);
                if key.descending {
                    ordering.reverse()
                } else {
                    ordering
                }
            }
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

/// Total order for sorting: numeric and textual comparison, then by type for mixed keys
fn compare_values(a: &Value, b: &Value) -> Ordering {
    fn rank(value: &Value) -> u8 {
        match value {
            Value::Null => 0,
            Value::Boolean(_) => 1,
            Value::Integer(_) | Value::Float(_) => 2,
            Value::Text(_) => 3,
        }
    }

    match (a, b) {
        (Value::Integer(x), Value::Integer(y)) => x.cmp(y),
        // NaN has no partial order; total_cmp places it after every other number
        (Value::Integer(_) | Value::Float(_), Value::Integer(_) | Value::Float(_)) => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x.total_cmp(&y),
            _ => Ordering::Equal,
        },
        _ => a.compare(b).unwrap_or_else(|| rank(a).cmp(&rank(b))),
    }
}
