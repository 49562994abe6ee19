//! Per-table schemas used to validate mutations at the boundary.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::error::ValidationError;

fn default_primary_key() -> String {
  "id".to_string()
}

/// Shape of one logical table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
  pub name: String,
  /// Field holding the record id
  #[serde(default = "default_primary_key")]
  pub primary_key: String,
  /// Fields that must be present and non-null on every stored record
  #[serde(default)]
  pub required: Vec<String>,
  /// Extra resource keys (aggregate views) a delete on this table affects
  #[serde(default)]
  pub affects: Vec<String>,
}

impl TableSchema {
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      primary_key: default_primary_key(),
      required: Vec::new(),
      affects: Vec::new(),
    }
  }

  pub fn primary_key(mut self, field: impl Into<String>) -> Self {
    self.primary_key = field.into();
    self
  }

  pub fn required(mut self, fields: &[&str]) -> Self {
    self.required.extend(fields.iter().map(|f| f.to_string()));
    self
  }

  pub fn affects(mut self, resource_key: impl Into<String>) -> Self {
    self.affects.push(resource_key.into());
    self
  }

  /// Extract the record id from a row.
  pub fn record_id(&self, row: &Value) -> Option<String> {
    row.get(&self.primary_key).and_then(id_from_value)
  }

  /// Check that `payload` is a complete record of this table.
  pub fn validate(&self, payload: &Value) -> Result<(), ValidationError> {
    let obj = payload.as_object().ok_or_else(|| ValidationError::NotAnObject {
      table: self.name.clone(),
    })?;

    if self.record_id(payload).is_none() {
      return Err(ValidationError::MissingPrimaryKey {
        table: self.name.clone(),
        field: self.primary_key.clone(),
      });
    }

    for field in &self.required {
      match obj.get(field) {
        Some(v) if !v.is_null() => {}
        _ => {
          return Err(ValidationError::MissingField {
            table: self.name.clone(),
            field: field.clone(),
          })
        }
      }
    }

    Ok(())
  }
}

/// Turn a JSON id (string or integer) into the string form used as a key.
pub fn id_from_value(value: &Value) -> Option<String> {
  match value {
    Value::String(s) if !s.is_empty() => Some(s.clone()),
    Value::Number(n) => Some(n.to_string()),
    _ => None,
  }
}

/// Registry of known tables.
#[derive(Debug, Clone, Default)]
pub struct Schemas {
  tables: HashMap<String, TableSchema>,
}

impl Schemas {
  pub fn new(tables: impl IntoIterator<Item = TableSchema>) -> Self {
    Self {
      tables: tables.into_iter().map(|t| (t.name.clone(), t)).collect(),
    }
  }

  pub fn get(&self, table: &str) -> Option<&TableSchema> {
    self.tables.get(table)
  }

  /// Look up a table, rejecting unknown names.
  pub fn require(&self, table: &str) -> Result<&TableSchema, ValidationError> {
    self
      .get(table)
      .ok_or_else(|| ValidationError::UnknownTable(table.to_string()))
  }

  /// Record id of a row, using the table's primary key (or `id` for tables
  /// that are only ever read).
  pub fn id_of(&self, table: &str, row: &Value) -> Option<String> {
    match self.get(table) {
      Some(schema) => schema.record_id(row),
      None => row.get("id").and_then(id_from_value),
    }
  }

  pub fn names(&self) -> impl Iterator<Item = &str> {
    self.tables.keys().map(String::as_str)
  }
}
