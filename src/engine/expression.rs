//! Composable predicate and projection expressions.
//!
//! Expressions are plain immutable trees. Builder methods consume their
//! receiver and return a new node; nothing is evaluated until a query runs.

use regex::Regex;
use std::fmt;
use crate::engine::query_builder::SubQuery;
use crate::utils::types::Value;

/// Reference to a column of an aliased table
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnRef {
    pub alias: String,
    pub column: String,
}

/// Comparison operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    fn symbol(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "<>",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        }
    }
}

/// Aggregate functions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFunc {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl fmt::Display for AggregateFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AggregateFunc::Count => "count",
            AggregateFunc::Sum => "sum",
            AggregateFunc::Avg => "avg",
            AggregateFunc::Min => "min",
            AggregateFunc::Max => "max",
        };
        f.write_str(name)
    }
}

/// SQL `like` pattern compiled to an anchored regex.
///
/// `%` matches any run of characters, `_` exactly one, and `\` escapes the
/// next character.
#[derive(Debug, Clone)]
pub struct LikePattern {
    source: String,
    regex: Option<Regex>,
}

impl LikePattern {
    pub fn new(pattern: &str) -> Self {
        let mut translated = String::with_capacity(pattern.len() * 2 + 2);
        translated.push('^');

        let mut chars = pattern.chars();
        while let Some(c) = chars.next() {
            match c {
                '%' => translated.push_str("(?s:.*)"),
                '_' => translated.push_str("(?s:.)"),
                '\\' => match chars.next() {
                    Some(escaped) => translated.push_str(&regex::escape(&escaped.to_string())),
                    None => translated.push_str(&regex::escape("\\")),
                },
                other => translated.push_str(&regex::escape(&other.to_string())),
            }
        }
        translated.push('$');

        Self {
            source: pattern.to_string(),
            regex: Regex::new(&translated).ok(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Compiled form; `None` only for patterns the regex engine rejected
    pub fn regex(&self) -> Option<&Regex> {
        self.regex.as_ref()
    }

    pub fn matches(&self, text: &str) -> bool {
        self.regex.as_ref().map(|r| r.is_match(text)).unwrap_or(false)
    }
}

impl PartialEq for LikePattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

/// Escape `like` wildcards so the text matches literally
pub fn escape_like(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Expression tree node
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Column of an aliased table
    Column(ColumnRef),
    /// Whole row of an aliased table; evaluates to its primary key in value contexts
    Entity(String),
    Literal(Value),
    Compare {
        op: CompareOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Between {
        expr: Box<Expr>,
        low: Box<Expr>,
        high: Box<Expr>,
    },
    InList {
        expr: Box<Expr>,
        list: Vec<Expr>,
        negated: bool,
    },
    InSubquery {
        expr: Box<Expr>,
        subquery: Box<SubQuery>,
        negated: bool,
    },
    IsNull {
        expr: Box<Expr>,
        negated: bool,
    },
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Not(Box<Expr>),
    Like {
        expr: Box<Expr>,
        pattern: LikePattern,
    },
    Concat(Box<Expr>, Box<Expr>),
    /// Render the operand as text
    StringValue(Box<Expr>),
    Aggregate {
        func: AggregateFunc,
        arg: Box<Expr>,
    },
    /// Searched case: first branch whose condition is true wins
    Case {
        branches: Vec<(Expr, Expr)>,
        otherwise: Box<Expr>,
    },
    /// Scalar subquery: single column, at most one row
    Subquery(Box<SubQuery>),
}

impl Expr {
    pub fn column(alias: &str, column: &str) -> Self {
        Expr::Column(ColumnRef {
            alias: alias.to_string(),
            column: column.to_string(),
        })
    }

    /// Literal projected as-is for every row
    pub fn constant(value: impl Into<Value>) -> Self {
        Expr::Literal(value.into())
    }

    /// Conjunction of the present predicates; `None` when every entry is absent
    pub fn all_of<I>(predicates: I) -> Option<Expr>
    where
        I: IntoIterator<Item = Option<Expr>>,
    {
        predicates
            .into_iter()
            .flatten()
            .fold(None, |acc, predicate| match acc {
                None => Some(predicate),
                Some(acc) => Some(acc.and(predicate)),
            })
    }

    fn compare(self, op: CompareOp, other: impl Into<Expr>) -> Self {
        Expr::Compare {
            op,
            left: Box::new(self),
            right: Box::new(other.into()),
        }
    }

    pub fn eq(self, other: impl Into<Expr>) -> Self {
        self.compare(CompareOp::Eq, other)
    }

    pub fn ne(self, other: impl Into<Expr>) -> Self {
        self.compare(CompareOp::Ne, other)
    }

    pub fn lt(self, other: impl Into<Expr>) -> Self {
        self.compare(CompareOp::Lt, other)
    }

    pub fn loe(self, other: impl Into<Expr>) -> Self {
        self.compare(CompareOp::Le, other)
    }

    pub fn gt(self, other: impl Into<Expr>) -> Self {
        self.compare(CompareOp::Gt, other)
    }

    pub fn goe(self, other: impl Into<Expr>) -> Self {
        self.compare(CompareOp::Ge, other)
    }

    /// Inclusive range test
    pub fn between(self, low: impl Into<Expr>, high: impl Into<Expr>) -> Self {
        Expr::Between {
            expr: Box::new(self),
            low: Box::new(low.into()),
            high: Box::new(high.into()),
        }
    }

    pub fn is_in<I, V>(self, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Expr>,
    {
        Expr::InList {
            expr: Box::new(self),
            list: values.into_iter().map(Into::into).collect(),
            negated: false,
        }
    }

    pub fn not_in<I, V>(self, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Expr>,
    {
        Expr::InList {
            expr: Box::new(self),
            list: values.into_iter().map(Into::into).collect(),
            negated: true,
        }
    }

    pub fn in_subquery(self, subquery: SubQuery) -> Self {
        Expr::InSubquery {
            expr: Box::new(self),
            subquery: Box::new(subquery),
            negated: false,
        }
    }

    pub fn not_in_subquery(self, subquery: SubQuery) -> Self {
        Expr::InSubquery {
            expr: Box::new(self),
            subquery: Box::new(subquery),
            negated: true,
        }
    }

    pub fn is_null(self) -> Self {
        Expr::IsNull {
            expr: Box::new(self),
            negated: false,
        }
    }

    pub fn is_not_null(self) -> Self {
        Expr::IsNull {
            expr: Box::new(self),
            negated: true,
        }
    }

    pub fn like(self, pattern: &str) -> Self {
        Expr::Like {
            expr: Box::new(self),
            pattern: LikePattern::new(pattern),
        }
    }

    pub fn contains(self, text: &str) -> Self {
        self.like(&format!("%{}%", escape_like(text)))
    }

    pub fn starts_with(self, text: &str) -> Self {
        self.like(&format!("{}%", escape_like(text)))
    }

    pub fn ends_with(self, text: &str) -> Self {
        self.like(&format!("%{}", escape_like(text)))
    }

    pub fn and(self, other: impl Into<Expr>) -> Self {
        match self {
            Expr::And(mut operands) => {
                operands.push(other.into());
                Expr::And(operands)
            }
            first => Expr::And(vec![first, other.into()]),
        }
    }

    pub fn or(self, other: impl Into<Expr>) -> Self {
        match self {
            Expr::Or(mut operands) => {
                operands.push(other.into());
                Expr::Or(operands)
            }
            first => Expr::Or(vec![first, other.into()]),
        }
    }

    pub fn not(self) -> Self {
        Expr::Not(Box::new(self))
    }

    pub fn concat(self, other: impl Into<Expr>) -> Self {
        Expr::Concat(Box::new(self), Box::new(other.into()))
    }

    pub fn string_value(self) -> Self {
        Expr::StringValue(Box::new(self))
    }

    fn aggregate(self, func: AggregateFunc) -> Self {
        Expr::Aggregate {
            func,
            arg: Box::new(self),
        }
    }

    /// Number of non-null values (rows, for an entity)
    pub fn count(self) -> Self {
        self.aggregate(AggregateFunc::Count)
    }

    pub fn sum(self) -> Self {
        self.aggregate(AggregateFunc::Sum)
    }

    pub fn avg(self) -> Self {
        self.aggregate(AggregateFunc::Avg)
    }

    pub fn min(self) -> Self {
        self.aggregate(AggregateFunc::Min)
    }

    pub fn max(self) -> Self {
        self.aggregate(AggregateFunc::Max)
    }

    pub fn asc(self) -> OrderSpecifier {
        OrderSpecifier::new(self, OrderDirection::Ascending)
    }

    pub fn desc(self) -> OrderSpecifier {
        OrderSpecifier::new(self, OrderDirection::Descending)
    }

    /// Start a simple case over this expression: `when(v)` tests equality with `v`
    pub fn when(self, value: impl Into<Expr>) -> CaseWhen {
        CaseBuilder {
            operand: Some(Box::new(self)),
            branches: Vec::new(),
        }
        .when(value)
    }

    /// Direct sub-expressions, not descending into subquery plans
    pub fn children(&self) -> Vec<&Expr> {
        match self {
            Expr::Column(_) | Expr::Entity(_) | Expr::Literal(_) | Expr::Subquery(_) => Vec::new(),
            Expr::Compare { left, right, .. } => vec![left, right],
            Expr::Between { expr, low, high } => vec![expr, low, high],
            Expr::InList { expr, list, .. } => {
                let mut children: Vec<&Expr> = vec![expr];
                children.extend(list.iter());
                children
            }
            Expr::InSubquery { expr, .. } => vec![expr],
            Expr::IsNull { expr, .. } => vec![expr],
            Expr::And(operands) | Expr::Or(operands) => operands.iter().collect(),
            Expr::Not(expr) => vec![expr],
            Expr::Like { expr, .. } => vec![expr],
            Expr::Concat(left, right) => vec![left, right],
            Expr::StringValue(expr) => vec![expr],
            Expr::Aggregate { arg, .. } => vec![arg],
            Expr::Case { branches, otherwise } => {
                let mut children = Vec::with_capacity(branches.len() * 2 + 1);
                for (condition, result) in branches {
                    children.push(condition);
                    children.push(result);
                }
                children.push(otherwise.as_ref());
                children
            }
        }
    }

    pub fn contains_aggregate(&self) -> bool {
        matches!(self, Expr::Aggregate { .. }) || self.children().into_iter().any(Expr::contains_aggregate)
    }

    /// Aliases referenced directly by this expression, outside nested subqueries
    pub fn referenced_aliases(&self) -> Vec<&str> {
        let mut aliases = Vec::new();
        self.collect_aliases(&mut aliases);
        aliases
    }

    fn collect_aliases<'a>(&'a self, aliases: &mut Vec<&'a str>) {
        match self {
            Expr::Column(col) => aliases.push(&col.alias),
            Expr::Entity(alias) => aliases.push(alias),
            _ => {
                for child in self.children() {
                    child.collect_aliases(aliases);
                }
            }
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Column(col) => write!(f, "{}.{}", col.alias, col.column),
            Expr::Entity(alias) => f.write_str(alias),
            Expr::Literal(Value::Text(s)) => write!(f, "'{}'", s),
            Expr::Literal(value) => write!(f, "{}", value),
            Expr::Compare { op, left, right } => write!(f, "{} {} {}", left, op.symbol(), right),
            Expr::Between { expr, low, high } => write!(f, "{} between {} and {}", expr, low, high),
            Expr::InList { expr, list, negated } => {
                let items: Vec<String> = list.iter().map(|e| e.to_string()).collect();
                let keyword = if *negated { "not in" } else { "in" };
                write!(f, "{} {} ({})", expr, keyword, items.join(", "))
            }
            Expr::InSubquery { expr, negated, .. } => {
                let keyword = if *negated { "not in" } else { "in" };
                write!(f, "{} {} (subquery)", expr, keyword)
            }
            Expr::IsNull { expr, negated } => {
                write!(f, "{} is {}null", expr, if *negated { "not " } else { "" })
            }
            Expr::And(operands) | Expr::Or(operands) => {
                let joiner = if matches!(self, Expr::And(_)) { " and " } else { " or " };
                let parts: Vec<String> = operands.iter().map(|e| e.to_string()).collect();
                write!(f, "({})", parts.join(joiner))
            }
            Expr::Not(expr) => write!(f, "not {}", expr),
            Expr::Like { expr, pattern } => write!(f, "{} like '{}'", expr, pattern.as_str()),
            Expr::Concat(left, right) => write!(f, "concat({}, {})", left, right),
            Expr::StringValue(expr) => write!(f, "str({})", expr),
            Expr::Aggregate { func, arg } => write!(f, "{}({})", func, arg),
            Expr::Case { branches, otherwise } => {
                f.write_str("case")?;
                for (condition, result) in branches {
                    write!(f, " when {} then {}", condition, result)?;
                }
                write!(f, " else {} end", otherwise)
            }
            Expr::Subquery(_) => f.write_str("(subquery)"),
        }
    }
}

impl From<Value> for Expr {
    fn from(value: Value) -> Self {
        Expr::Literal(value)
    }
}

impl From<i64> for Expr {
    fn from(value: i64) -> Self {
        Expr::Literal(Value::Integer(value))
    }
}

impl From<i32> for Expr {
    fn from(value: i32) -> Self {
        Expr::Literal(Value::Integer(value as i64))
    }
}

impl From<f64> for Expr {
    fn from(value: f64) -> Self {
        Expr::Literal(Value::Float(value))
    }
}

impl From<bool> for Expr {
    fn from(value: bool) -> Self {
        Expr::Literal(Value::Boolean(value))
    }
}

impl From<&str> for Expr {
    fn from(value: &str) -> Self {
        Expr::Literal(Value::Text(value.to_string()))
    }
}

impl From<String> for Expr {
    fn from(value: String) -> Self {
        Expr::Literal(Value::Text(value))
    }
}

impl From<&Expr> for Expr {
    fn from(value: &Expr) -> Self {
        value.clone()
    }
}

impl From<SubQuery> for Expr {
    fn from(value: SubQuery) -> Self {
        Expr::Subquery(Box::new(value))
    }
}

/// Association of an aliased entity, named by its foreign key's association name
#[derive(Debug, Clone, PartialEq)]
pub struct Relation {
    pub owner_alias: String,
    pub association: String,
}

/// Typed handle on an aliased table, the starting point for column expressions
#[derive(Debug, Clone, PartialEq)]
pub struct EntityPath {
    pub table: String,
    pub alias: String,
}

impl EntityPath {
    pub fn new(table: &str, alias: &str) -> Self {
        Self {
            table: table.to_string(),
            alias: alias.to_string(),
        }
    }

    pub fn col(&self, column: &str) -> Expr {
        Expr::column(&self.alias, column)
    }

    pub fn entity(&self) -> Expr {
        Expr::Entity(self.alias.clone())
    }

    /// Row count of this entity
    pub fn count(&self) -> Expr {
        self.entity().count()
    }

    pub fn relation(&self, association: &str) -> Relation {
        Relation {
            owner_alias: self.alias.clone(),
            association: association.to_string(),
        }
    }
}

/// Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderDirection {
    Ascending,
    Descending,
}

/// Explicit null placement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NullOrdering {
    NullsFirst,
    NullsLast,
}

/// One sort key of an `order_by`
#[derive(Debug, Clone, PartialEq)]
pub struct OrderSpecifier {
    pub expr: Expr,
    pub direction: OrderDirection,
    /// `None` defers to the engine's configured default
    pub nulls: Option<NullOrdering>,
}

impl OrderSpecifier {
    pub fn new(expr: Expr, direction: OrderDirection) -> Self {
        Self {
            expr,
            direction,
            nulls: None,
        }
    }

    pub fn nulls_first(mut self) -> Self {
        self.nulls = Some(NullOrdering::NullsFirst);
        self
    }

    pub fn nulls_last(mut self) -> Self {
        self.nulls = Some(NullOrdering::NullsLast);
        self
    }
}

/// Builder for searched and simple case expressions
#[derive(Debug, Clone, Default)]
pub struct CaseBuilder {
    operand: Option<Box<Expr>>,
    branches: Vec<(Expr, Expr)>,
}

/// A case branch waiting for its result
#[derive(Debug, Clone)]
pub struct CaseWhen {
    builder: CaseBuilder,
    condition: Expr,
}

impl CaseBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a branch; for simple cases the argument is compared to the operand
    pub fn when(self, condition: impl Into<Expr>) -> CaseWhen {
        let condition = match &self.operand {
            Some(operand) => operand.as_ref().clone().eq(condition),
            None => condition.into(),
        };
        CaseWhen {
            builder: self,
            condition,
        }
    }

    pub fn otherwise(self, value: impl Into<Expr>) -> Expr {
        Expr::Case {
            branches: self.branches,
            otherwise: Box::new(value.into()),
        }
    }
}

impl CaseWhen {
    pub fn then(mut self, value: impl Into<Expr>) -> CaseBuilder {
        self.builder.branches.push((self.condition, value.into()));
        self.builder
    }
}
