//! Table descriptions and the record-kind abstraction.
//!
//! A queue table always carries the queue-management columns listed in
//! [`QUEUE_COLUMNS`]. A [`TableSpec`] adds the kind-specific domain columns,
//! the dequeue ordering and the natural key used by `is_queued`.

use core::cmp::Ordering;
use core::fmt::Debug;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{QueueError, StoreError};

/// Columns every queue table has, managed by the store.
pub const QUEUE_COLUMNS: [&str; 9] = [
    "id",
    "state",
    "queued_at",
    "started_at",
    "finished_at",
    "failure_summary",
    "failure_stacktrace",
    "process_after",
    "num_resets",
];

const MAX_IDENTIFIER_LEN: usize = 63;

/// SQL type of a domain column.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Integer,
    Text,
    Timestamp,
}

impl ColumnType {
    pub fn sql_type(&self) -> &'static str {
        match self {
            ColumnType::Integer => "BIGINT",
            ColumnType::Text => "TEXT",
            ColumnType::Timestamp => "TIMESTAMPTZ",
        }
    }
}

/// A single column value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    Null,
    Integer(i64),
    Text(String),
    Timestamp(DateTime<Utc>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Timestamp(v) => Some(*v),
            _ => None,
        }
    }

    /// Whether this value may be stored in a column of type `ty`.
    pub fn fits(&self, ty: ColumnType, nullable: bool) -> bool {
        match (self, ty) {
            (Value::Null, _) => nullable,
            (Value::Integer(_), ColumnType::Integer) => true,
            (Value::Text(_), ColumnType::Text) => true,
            (Value::Timestamp(_), ColumnType::Timestamp) => true,
            _ => false,
        }
    }

    /// Ordering used by `ORDER BY ... ASC`: nulls sort last.
    pub fn sort_cmp(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Null, _) => Ordering::Greater,
            (_, Value::Null) => Ordering::Less,
            (Value::Integer(a), Value::Integer(b)) => a.cmp(b),
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            (Value::Timestamp(a), Value::Timestamp(b)) => a.cmp(b),
            (a, b) => a.type_rank().cmp(&b.type_rank()),
        }
    }

    fn type_rank(&self) -> u8 {
        match self {
            Value::Null => 3,
            Value::Integer(_) => 0,
            Value::Text(_) => 1,
            Value::Timestamp(_) => 2,
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
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

impl From<DateTime<Utc>> for Value {
    fn from(value: DateTime<Utc>) -> Self {
        Value::Timestamp(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}

/// A kind-specific column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub ty: ColumnType,
    pub nullable: bool,
}

/// One term of the dequeue ordering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    pub column: String,
    pub descending: bool,
}

impl OrderBy {
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            descending: false,
        }
    }

    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            descending: true,
        }
    }
}

/// Description of one queue table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSpec {
    name: String,
    columns: Vec<Column>,
    order_by: Vec<OrderBy>,
    natural_key: Vec<String>,
}

impl TableSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            order_by: Vec::new(),
            natural_key: Vec::new(),
        }
    }

    pub fn column(mut self, name: impl Into<String>, ty: ColumnType) -> Self {
        self.columns.push(Column {
            name: name.into(),
            ty,
            nullable: false,
        });
        self
    }

    pub fn nullable_column(mut self, name: impl Into<String>, ty: ColumnType) -> Self {
        self.columns.push(Column {
            name: name.into(),
            ty,
            nullable: true,
        });
        self
    }

    pub fn order_by(mut self, term: OrderBy) -> Self {
        self.order_by.push(term);
        self
    }

    pub fn natural_key<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.natural_key = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn natural_key_columns(&self) -> &[String] {
        &self.natural_key
    }

    /// Dequeue ordering; defaults to oldest first.
    pub fn ordering(&self) -> Vec<OrderBy> {
        if self.order_by.is_empty() {
            vec![OrderBy::asc("queued_at"), OrderBy::asc("id")]
        } else {
            self.order_by.clone()
        }
    }

    /// Index of a domain column by name.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Validate identifiers and references. Call once when a store is built.
    pub fn validate(&self) -> Result<(), StoreError> {
        check_identifier(&self.name)?;

        for (i, column) in self.columns.iter().enumerate() {
            check_identifier(&column.name)?;
            if QUEUE_COLUMNS.contains(&column.name.as_str()) {
                return Err(StoreError::invalid_spec(format!(
                    "column '{}' of table '{}' shadows a queue column",
                    column.name, self.name
                )));
            }
            if self.columns[..i].iter().any(|c| c.name == column.name) {
                return Err(StoreError::invalid_spec(format!(
                    "duplicate column '{}' in table '{}'",
                    column.name, self.name
                )));
            }
        }

        for term in &self.order_by {
            if !self.is_known_column(&term.column) {
                return Err(StoreError::invalid_spec(format!(
                    "order by unknown column '{}' in table '{}'",
                    term.column, self.name
                )));
            }
        }

        if self.natural_key.is_empty() {
            return Err(StoreError::invalid_spec(format!(
                "table '{}' has no natural key",
                self.name
            )));
        }
        for key in &self.natural_key {
            if self.column_index(key).is_none() {
                return Err(StoreError::invalid_spec(format!(
                    "natural key column '{}' is not a domain column of '{}'",
                    key, self.name
                )));
            }
        }

        Ok(())
    }

    /// Check encoded values against the declared columns.
    pub fn check_values(&self, values: &[Value]) -> Result<(), StoreError> {
        if values.len() != self.columns.len() {
            return Err(StoreError::decode(format!(
                "table '{}' expects {} columns, got {}",
                self.name,
                self.columns.len(),
                values.len()
            )));
        }
        for (column, value) in self.columns.iter().zip(values) {
            if !value.fits(column.ty, column.nullable) {
                return Err(StoreError::decode(format!(
                    "value {:?} does not fit column '{}' ({:?})",
                    value, column.name, column.ty
                )));
            }
        }
        Ok(())
    }

    /// Project a natural key out of encoded domain values.
    pub fn key_of(&self, values: &[Value]) -> NaturalKey {
        NaturalKey(
            self.natural_key
                .iter()
                .filter_map(|key| self.column_index(key))
                .filter_map(|i| values.get(i).cloned())
                .collect(),
        )
    }

    /// Check that `key` has one value of the right type per key column.
    pub fn check_key(&self, key: &NaturalKey) -> Result<(), QueueError> {
        if key.0.len() != self.natural_key.len() {
            return Err(QueueError::InvalidKey(format!(
                "'{}' is keyed by {} columns, got {} values",
                self.name,
                self.natural_key.len(),
                key.0.len()
            )));
        }
        for (name, value) in self.natural_key.iter().zip(&key.0) {
            let fits = self
                .column_index(name)
                .map(|i| &self.columns[i])
                .is_some_and(|c| value.fits(c.ty, c.nullable));
            if !fits {
                return Err(QueueError::InvalidKey(format!(
                    "{:?} does not fit key column '{}'",
                    value, name
                )));
            }
        }
        Ok(())
    }

    fn is_known_column(&self, name: &str) -> bool {
        QUEUE_COLUMNS.contains(&name) || self.column_index(name).is_some()
    }
}

fn check_identifier(name: &str) -> Result<(), StoreError> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');

    if !valid_start || !valid_rest || name.len() > MAX_IDENTIFIER_LEN {
        return Err(StoreError::invalid_spec(format!(
            "'{}' is not a valid identifier",
            name
        )));
    }
    Ok(())
}

/// Values of a table's natural key columns, in declaration order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NaturalKey(pub Vec<Value>);

/// A record kind stored in one queue table.
///
/// Implementors describe the table and convert their payload to and from
/// the domain column values (in [`TableSpec::columns`] order).
pub trait RecordKind: Send + Sync + 'static {
    type Payload: Clone + Debug + Send + Sync + 'static;

    /// Short label used in logs and metric names.
    const NAME: &'static str;

    fn table() -> TableSpec;

    fn encode(payload: &Self::Payload) -> Vec<Value>;

    fn decode(values: &[Value]) -> Result<Self::Payload, StoreError>;
}

/// Sequential reader over decoded column values.
pub struct ValueReader<'a> {
    values: core::slice::Iter<'a, Value>,
}

impl<'a> ValueReader<'a> {
    pub fn new(values: &'a [Value]) -> Self {
        Self {
            values: values.iter(),
        }
    }

    fn next(&mut self, column: &str) -> Result<&'a Value, StoreError> {
        self.values
            .next()
            .ok_or_else(|| StoreError::decode(format!("missing column '{}'", column)))
    }

    pub fn integer(&mut self, column: &str) -> Result<i64, StoreError> {
        let value = self.next(column)?;
        value
            .as_i64()
            .ok_or_else(|| mismatch(column, "integer", value))
    }

    pub fn text(&mut self, column: &str) -> Result<String, StoreError> {
        let value = self.next(column)?;
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| mismatch(column, "text", value))
    }

    pub fn optional_integer(&mut self, column: &str) -> Result<Option<i64>, StoreError> {
        match self.next(column)? {
            Value::Null => Ok(None),
            Value::Integer(v) => Ok(Some(*v)),
            other => Err(mismatch(column, "integer", other)),
        }
    }

    pub fn optional_text(&mut self, column: &str) -> Result<Option<String>, StoreError> {
        match self.next(column)? {
            Value::Null => Ok(None),
            Value::Text(v) => Ok(Some(v.clone())),
            other => Err(mismatch(column, "text", other)),
        }
    }

    pub fn optional_timestamp(
        &mut self,
        column: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        match self.next(column)? {
            Value::Null => Ok(None),
            Value::Timestamp(v) => Ok(Some(*v)),
            other => Err(mismatch(column, "timestamp", other)),
        }
    }
}

fn mismatch(column: &str, expected: &str, got: &Value) -> StoreError {
    StoreError::decode(format!(
        "column '{}' expected {}, got {:?}",
        column, expected, got
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> TableSpec {
        TableSpec::new("widgets")
            .column("repository_id", ColumnType::Integer)
            .column("commit", ColumnType::Text)
            .nullable_column("note", ColumnType::Text)
            .natural_key(["repository_id", "commit"])
    }

    #[test]
    fn valid_spec_passes() {
        spec().validate().unwrap();
    }

    #[test]
    fn natural_keys_must_match_key_columns() {
        let spec = spec();
        spec.check_key(&NaturalKey(vec![Value::from(7), Value::from("cafe")]))
            .unwrap();

        let short = NaturalKey(vec![Value::from(7)]);
        assert!(matches!(spec.check_key(&short), Err(QueueError::InvalidKey(_))));

        let swapped = NaturalKey(vec![Value::from("cafe"), Value::from(7)]);
        assert!(matches!(spec.check_key(&swapped), Err(QueueError::InvalidKey(_))));
    }

    #[test]
    fn default_ordering_is_oldest_first() {
        let ordering = spec().ordering();
        assert_eq!(ordering, vec![OrderBy::asc("queued_at"), OrderBy::asc("id")]);
    }

    #[test]
    fn rejects_bad_identifiers() {
        let bad = TableSpec::new("widgets; drop table x")
            .column("a", ColumnType::Integer)
            .natural_key(["a"]);
        assert!(matches!(bad.validate(), Err(StoreError::InvalidSpec(_))));

        let upper = TableSpec::new("widgets")
            .column("Name", ColumnType::Text)
            .natural_key(["Name"]);
        assert!(upper.validate().is_err());
    }

    #[test]
    fn rejects_shadowed_queue_columns() {
        let spec = TableSpec::new("widgets")
            .column("state", ColumnType::Text)
            .natural_key(["state"]);
        assert!(spec.validate().is_err());
    }

    #[test]
    fn rejects_unknown_order_column() {
        let spec = spec().order_by(OrderBy::desc("priority"));
        assert!(spec.validate().is_err());

        let ok = spec_with_order();
        ok.validate().unwrap();
    }

    fn spec_with_order() -> TableSpec {
        spec()
            .order_by(OrderBy::desc("repository_id"))
            .order_by(OrderBy::asc("id"))
    }

    #[test]
    fn check_values_enforces_types_and_nullability() {
        let spec = spec();
        spec.check_values(&[Value::Integer(1), "abc".into(), Value::Null])
            .unwrap();
        assert!(spec.check_values(&[Value::Null, "abc".into(), Value::Null]).is_err());
        assert!(spec.check_values(&["1".into(), "abc".into(), Value::Null]).is_err());
        assert!(spec.check_values(&[Value::Integer(1), "abc".into()]).is_err());
    }

    #[test]
    fn key_projection_follows_declared_columns() {
        let key = spec().key_of(&[Value::Integer(7), "deadbeef".into(), "n".into()]);
        assert_eq!(key, NaturalKey(vec![Value::Integer(7), "deadbeef".into()]));
    }

    #[test]
    fn nulls_sort_last() {
        assert_eq!(Value::Null.sort_cmp(&Value::Integer(1)), Ordering::Greater);
        assert_eq!(Value::Integer(1).sort_cmp(&Value::Integer(2)), Ordering::Less);
    }

    #[test]
    fn reader_reports_type_mismatch() {
        let values = vec![Value::from("x")];
        let mut reader = ValueReader::new(&values);
        let err = reader.integer("repository_id").unwrap_err();
        assert!(err.to_string().contains("repository_id"));
    }
}
