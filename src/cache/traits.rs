//! Core types for cached records and query results.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

/// Resource key identifying a single record for bypass tracking.
pub fn resource_key(table: &str, id: &str) -> String {
  format!("{}:{}", table, id)
}

/// A record as held by the Local Store.
///
/// Identity is `(table, id)`. The payload is stored as JSON; typed views are
/// produced with [`CachedRecord::decode`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedRecord<T = Value> {
  pub id: String,
  pub table: String,
  pub payload: T,
  /// When this row was last written, by a fetch or a local mutation
  pub fetched_at: DateTime<Utc>,
}

impl CachedRecord<Value> {
  /// Deserialize the payload into a concrete type.
  pub fn decode<U: DeserializeOwned>(self) -> Result<CachedRecord<U>, serde_json::Error> {
    Ok(CachedRecord {
      payload: serde_json::from_value(self.payload)?,
      id: self.id,
      table: self.table,
      fetched_at: self.fetched_at,
    })
  }

  pub fn resource_key(&self) -> String {
    resource_key(&self.table, &self.id)
  }
}

/// One emission of a subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult<T> {
  /// Records in query order
  pub records: Vec<CachedRecord<T>>,
  /// When the query last revalidated successfully against the remote
  pub last_revalidated_at: Option<DateTime<Utc>>,
  /// True until a revalidation succeeds (or while it is known to be outdated)
  pub is_stale: bool,
  /// Most recent revalidation failure, if any
  pub error: Option<String>,
  /// Emitted by the loading watchdog rather than a completed fetch
  pub forced: bool,
}

impl<T> QueryResult<T> {
  pub fn len(&self) -> usize {
    self.records.len()
  }

  pub fn is_empty(&self) -> bool {
    self.records.is_empty()
  }

  /// Iterate over the record ids in order.
  pub fn ids(&self) -> impl Iterator<Item = &str> {
    self.records.iter().map(|r| r.id.as_str())
  }

  pub fn payloads(&self) -> impl Iterator<Item = &T> {
    self.records.iter().map(|r| &r.payload)
  }
}

/// Kind of remote write carried by a sync queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
  Create,
  Update,
  Delete,
}

impl Operation {
  pub fn as_str(&self) -> &'static str {
    match self {
      Operation::Create => "create",
      Operation::Update => "update",
      Operation::Delete => "delete",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "create" => Some(Operation::Create),
      "update" => Some(Operation::Update),
      "delete" => Some(Operation::Delete),
      _ => None,
    }
  }
}

impl std::fmt::Display for Operation {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Comparison used in a filter condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompareOp {
  Eq,
  Neq,
  Gt,
  Gte,
  Lt,
  Lte,
}

impl CompareOp {
  pub fn as_str(&self) -> &'static str {
    match self {
      CompareOp::Eq => "eq",
      CompareOp::Neq => "neq",
      CompareOp::Gt => "gt",
      CompareOp::Gte => "gte",
      CompareOp::Lt => "lt",
      CompareOp::Lte => "lte",
    }
  }

  fn accepts(&self, ordering: Option<Ordering>) -> bool {
    match (self, ordering) {
      (CompareOp::Eq, Some(o)) => o == Ordering::Equal,
      (CompareOp::Neq, Some(o)) => o != Ordering::Equal,
      (CompareOp::Neq, None) => true,
      (CompareOp::Gt, Some(o)) => o == Ordering::Greater,
      (CompareOp::Gte, Some(o)) => o != Ordering::Less,
      (CompareOp::Lt, Some(o)) => o == Ordering::Less,
      (CompareOp::Lte, Some(o)) => o != Ordering::Greater,
      (_, None) => false,
    }
  }
}

/// A single `field <op> value` condition on a JSON payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
  pub field: String,
  pub op: CompareOp,
  pub value: Value,
}

/// Conjunction of conditions. The empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
  pub conditions: Vec<Condition>,
}

impl Filter {
  pub fn new() -> Self {
    Self::default()
  }

  /// Add an equality condition.
  pub fn eq(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
    self.with(field, CompareOp::Eq, value)
  }

  pub fn with(mut self, field: impl Into<String>, op: CompareOp, value: impl Into<Value>) -> Self {
    self.conditions.push(Condition {
      field: field.into(),
      op,
      value: value.into(),
    });
    self
  }

  pub fn is_empty(&self) -> bool {
    self.conditions.is_empty()
  }

  /// Check a payload against every condition. Missing fields read as null.
  pub fn matches(&self, payload: &Value) -> bool {
    self.conditions.iter().all(|c| {
      let actual = payload.get(&c.field).unwrap_or(&Value::Null);
      c.op.accepts(compare_values(actual, &c.value))
    })
  }
}

/// Compare two JSON scalars. Numbers compare numerically, strings
/// lexicographically (which orders ISO 8601 timestamps correctly).
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
  match (a, b) {
    (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
    (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
    (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
    (Value::Null, Value::Null) => Some(Ordering::Equal),
    _ if a == b => Some(Ordering::Equal),
    _ => None,
  }
}

/// Sort order for a query's local read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
  pub field: String,
  #[serde(default)]
  pub descending: bool,
}

impl OrderBy {
  pub fn asc(field: impl Into<String>) -> Self {
    Self {
      field: field.into(),
      descending: false,
    }
  }

  pub fn desc(field: impl Into<String>) -> Self {
    Self {
      field: field.into(),
      descending: true,
    }
  }
}

/// Definition of a logical query.
///
/// The key must be stable across subscriptions; it is the unit of staleness
/// tracking and of bypass marking for derived views.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryDef {
  pub key: String,
  /// Table the fetched rows are written to
  pub table: String,
  pub filter: Filter,
  pub order_by: Option<OrderBy>,
  pub limit: Option<usize>,
  /// Other tables whose mutations invalidate this query
  pub derives_from: Vec<String>,
}

impl QueryDef {
  pub fn new(key: impl Into<String>, table: impl Into<String>) -> Self {
    Self {
      key: key.into(),
      table: table.into(),
      filter: Filter::default(),
      order_by: None,
      limit: None,
      derives_from: Vec::new(),
    }
  }

  pub fn with_filter(mut self, filter: Filter) -> Self {
    self.filter = filter;
    self
  }

  pub fn order_by(mut self, order: OrderBy) -> Self {
    self.order_by = Some(order);
    self
  }

  pub fn limit(mut self, limit: usize) -> Self {
    self.limit = Some(limit);
    self
  }

  /// Declare that mutations on `table` also invalidate this query.
  pub fn derives_from(mut self, table: impl Into<String>) -> Self {
    self.derives_from.push(table.into());
    self
  }

  /// Whether a mutation on `table` affects this query.
  pub fn depends_on(&self, table: &str) -> bool {
    self.table == table || self.derives_from.iter().any(|t| t == table)
  }

  /// Apply ordering and limit to rows already filtered from the store.
  pub fn shape(&self, mut records: Vec<CachedRecord>) -> Vec<CachedRecord> {
    if let Some(order) = &self.order_by {
      records.sort_by(|a, b| {
        let av = a.payload.get(&order.field).unwrap_or(&Value::Null);
        let bv = b.payload.get(&order.field).unwrap_or(&Value::Null);
        let ord = compare_values(av, bv)
          .unwrap_or(Ordering::Equal)
          .then_with(|| a.id.cmp(&b.id));
        if order.descending {
          ord.reverse()
        } else {
          ord
        }
      });
    }
    if let Some(limit) = self.limit {
      records.truncate(limit);
    }
    records
  }
}
