use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::time::Duration;

/// Identifier of a stored row; always equal to the row's primary-key value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RowId(pub i64);

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Supported column data types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    Text,
    Integer,
    Float,
    Boolean,
}

impl DataType {
    /// Check whether a non-null value can be stored in a column of this type
    pub fn accepts(&self, value: &Value) -> bool {
        matches!(
            (self, value),
            (_, Value::Null)
                | (DataType::Text, Value::Text(_))
                | (DataType::Integer, Value::Integer(_))
                | (DataType::Float, Value::Float(_))
                | (DataType::Float, Value::Integer(_))
                | (DataType::Boolean, Value::Boolean(_))
        )
    }

    /// Coerce a value into this type where the conversion is lossless
    pub fn coerce(&self, value: Value) -> Value {
        match (self, value) {
            (DataType::Float, Value::Integer(i)) => Value::Float(i as f64),
            (_, other) => other,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::Text => "TEXT",
            DataType::Integer => "INTEGER",
            DataType::Float => "FLOAT",
            DataType::Boolean => "BOOLEAN",
        };
        f.write_str(name)
    }
}

/// Individual cell values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Text(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Null,
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric view of the value; integers widen to floats
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Data type of a non-null value
    pub fn data_type(&self) -> Option<DataType> {
        match self {
            Value::Text(_) => Some(DataType::Text),
            Value::Integer(_) => Some(DataType::Integer),
            Value::Float(_) => Some(DataType::Float),
            Value::Boolean(_) => Some(DataType::Boolean),
            Value::Null => None,
        }
    }

    /// SQL comparison between two values.
    ///
    /// Returns `None` when either side is null or the types are not comparable.
    /// Integers and floats compare numerically.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Null, _) | (_, Value::Null) => None,
            (Value::Integer(a), Value::Integer(b)) => Some(a.cmp(b)),
            (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
            (Value::Boolean(a), Value::Boolean(b)) => Some(a.cmp(b)),
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x.partial_cmp(&y),
                _ => None,
            },
        }
    }

    /// Equality used for grouping and IN lists: nulls are equal to each other
    pub fn group_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            _ => self.compare(other) == Some(Ordering::Equal),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Text(s) => f.write_str(s),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Float(v) => write!(f, "{}", v),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Null => f.write_str("NULL"),
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Integer(value as i64)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Boolean(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Metadata for a table or result column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnMetadata {
    pub name: String,
    pub data_type: DataType,
    pub nullable: bool,
}

impl ColumnMetadata {
    pub fn new(name: &str, data_type: DataType, nullable: bool) -> Self {
        Self {
            name: name.to_string(),
            data_type,
            nullable,
        }
    }
}

/// Declared relationship from a referencing column to another table's primary key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForeignKey {
    /// Column holding the referenced id, e.g. `team_id`
    pub column: String,
    /// Association name used by joins and entities, e.g. `team`
    pub association: String,
    /// Referenced table
    pub references: String,
}

/// Schema information for a table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    pub name: String,
    pub columns: Vec<ColumnMetadata>,
    pub primary_key: String,
    pub foreign_keys: Vec<ForeignKey>,
}

impl Schema {
    /// Create a schema whose primary key is an integer `id` column
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            columns: vec![ColumnMetadata::new("id", DataType::Integer, false)],
            primary_key: "id".to_string(),
            foreign_keys: Vec::new(),
        }
    }

    pub fn with_column(mut self, name: &str, data_type: DataType, nullable: bool) -> Self {
        self.columns.push(ColumnMetadata::new(name, data_type, nullable));
        self
    }

    /// Add a nullable integer column referencing another table
    pub fn with_foreign_key(mut self, column: &str, association: &str, references: &str) -> Self {
        self.columns.push(ColumnMetadata::new(column, DataType::Integer, true));
        self.foreign_keys.push(ForeignKey {
            column: column.to_string(),
            association: association.to_string(),
            references: references.to_string(),
        });
        self
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn column(&self, name: &str) -> Option<&ColumnMetadata> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn primary_key_index(&self) -> Option<usize> {
        self.column_index(&self.primary_key)
    }

    pub fn foreign_key(&self, association: &str) -> Option<&ForeignKey> {
        self.foreign_keys.iter().find(|fk| fk.association == association)
    }
}

/// A row of values, positionally aligned with its table schema or result columns
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub values: Vec<Value>,
}

impl Row {
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }
}

/// Flattened query output used for display
#[derive(Debug, Clone)]
pub struct QueryResult {
    pub columns: Vec<ColumnMetadata>,
    pub rows: Vec<Row>,
    pub execution_time: Duration,
}

impl QueryResult {
    pub fn new() -> Self {
        Self {
            columns: Vec::new(),
            rows: Vec::new(),
            execution_time: Duration::from_millis(0),
        }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl Default for QueryResult {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_compare_numeric_mixed() {
        assert_eq!(Value::Integer(30).compare(&Value::Float(25.0)), Some(Ordering::Greater));
        assert_eq!(Value::Float(25.0).compare(&Value::Integer(25)), Some(Ordering::Equal));
        assert_eq!(Value::Integer(1).compare(&Value::Null), None);
        assert_eq!(Value::Text("a".into()).compare(&Value::Integer(1)), None);
    }

    #[test]
    fn test_value_group_eq_treats_nulls_equal() {
        assert!(Value::Null.group_eq(&Value::Null));
        assert!(!Value::Null.group_eq(&Value::Integer(0)));
        assert!(Value::Text("teamA".into()).group_eq(&Value::Text("teamA".into())));
    }

    #[test]
    fn test_data_type_accepts_and_coerces() {
        assert!(DataType::Float.accepts(&Value::Integer(3)));
        assert!(!DataType::Integer.accepts(&Value::Text("3".into())));
        assert!(DataType::Text.accepts(&Value::Null));
        assert_eq!(DataType::Float.coerce(Value::Integer(3)), Value::Float(3.0));
    }

    #[test]
    fn test_schema_builder() {
        let schema = Schema::new("Member")
            .with_column("username", DataType::Text, true)
            .with_foreign_key("team_id", "team", "Team");

        assert_eq!(schema.columns.len(), 3);
        assert_eq!(schema.primary_key_index(), Some(0));
        assert_eq!(schema.column_index("team_id"), Some(2));
        assert_eq!(schema.foreign_key("team").map(|fk| fk.references.as_str()), Some("Team"));
        assert!(schema.foreign_key("club").is_none());
    }

    #[test]
    fn test_row_creation_and_access() {
        let row = Row::new(vec![Value::Integer(1), Value::from("member1")]);
        assert_eq!(row.get(1), Some(&Value::Text("member1".to_string())));
        assert_eq!(row.get(2), None);
    }

    #[test]
    fn test_query_result_creation() {
        let result = QueryResult::new();
        assert!(result.is_empty());
        assert_eq!(result.row_count(), 0);
    }
}
