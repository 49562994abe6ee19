//! REST remote for a PostgREST-style backend.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{RequestBuilder, StatusCode};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::{RemoteSource, RemoteWrite};
use crate::cache::{CompareOp, Filter, Operation};
use crate::error::RemoteError;
use crate::schema::Schemas;

/// HTTP client for the backend's REST endpoint.
#[derive(Clone)]
pub struct HttpRemote {
  client: reqwest::Client,
  base: Url,
  schemas: Arc<Schemas>,
  /// Postgres schema selected through the profile headers
  profile: Option<String>,
}

impl HttpRemote {
  /// Create a client rooted at `base_url` (e.g. `https://x.supabase.co/rest/v1`).
  pub fn new(
    base_url: &str,
    api_key: Option<&str>,
    schemas: Arc<Schemas>,
    timeout: Duration,
  ) -> Result<Self, RemoteError> {
    let mut base = Url::parse(base_url)
      .map_err(|e| RemoteError::Terminal(format!("invalid remote url '{}': {}", base_url, e)))?;
    // Url::join replaces the last segment unless the path ends in '/'
    if !base.path().ends_with('/') {
      let path = format!("{}/", base.path());
      base.set_path(&path);
    }

    let mut headers = HeaderMap::new();
    if let Some(key) = api_key {
      let invalid = |_| RemoteError::Terminal("api key is not a valid header value".into());
      headers.insert("apikey", HeaderValue::from_str(key).map_err(invalid)?);
      headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {}", key)).map_err(invalid)?,
      );
    }

    let client = reqwest::Client::builder()
      .default_headers(headers)
      .timeout(timeout)
      .build()
      .map_err(|e| RemoteError::Terminal(format!("failed to build http client: {}", e)))?;

    Ok(Self {
      client,
      base,
      schemas,
      profile: None,
    })
  }

  /// Target a Postgres schema other than the server's default.
  pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
    self.profile = Some(schema.into());
    self
  }

  fn table_url(&self, table: &str) -> Result<Url, RemoteError> {
    self
      .base
      .join(table)
      .map_err(|e| RemoteError::Terminal(format!("invalid table name '{}': {}", table, e)))
  }

  fn primary_key(&self, table: &str) -> String {
    self
      .schemas
      .get(table)
      .map(|s| s.primary_key.clone())
      .unwrap_or_else(|| "id".to_string())
  }

  async fn send(&self, mut request: RequestBuilder) -> Result<Option<Value>, RemoteError> {
    if let Some(profile) = &self.profile {
      request = request
        .header("Accept-Profile", profile.as_str())
        .header("Content-Profile", profile.as_str());
    }
    let response = request.send().await.map_err(classify_transport)?;
    let status = response.status();
    let body = response.text().await.map_err(classify_transport)?;

    if !status.is_success() {
      return Err(classify_status(status, &body));
    }
    if body.trim().is_empty() {
      return Ok(None);
    }
    let value: Value = serde_json::from_str(&body)
      .map_err(|e| RemoteError::Transient(format!("unreadable response body: {}", e)))?;
    Ok(Some(value))
  }
}

#[async_trait]
impl RemoteSource for HttpRemote {
  async fn query(&self, table: &str, filter: &Filter) -> Result<Vec<Value>, RemoteError> {
    let url = self.table_url(table)?;
    debug!(table, conditions = filter.conditions.len(), "remote query");

    let request = self.client.get(url).query(&filter_params(filter));
    match self.send(request).await? {
      Some(Value::Array(rows)) => Ok(rows),
      Some(other) => Err(RemoteError::Terminal(format!(
        "expected an array of rows from {}, got {}",
        table, other
      ))),
      None => Ok(Vec::new()),
    }
  }

  async fn mutate(&self, write: RemoteWrite<'_>) -> Result<Option<Value>, RemoteError> {
    let url = self.table_url(write.table)?;
    let by_id = [(
      self.primary_key(write.table),
      format!("eq.{}", write.record_id),
    )];
    debug!(table = write.table, id = write.record_id, op = %write.operation, "remote write");

    let request = match write.operation {
      Operation::Create => self
        .client
        .post(url)
        .header("Prefer", "return=representation,resolution=merge-duplicates")
        .json(write.payload),
      Operation::Update => self
        .client
        .patch(url)
        .query(&by_id)
        .header("Prefer", "return=representation")
        .json(write.payload),
      Operation::Delete => self.client.delete(url).query(&by_id),
    }
    .header("Idempotency-Key", write.idempotency_key);

    let committed = match self.send(request).await? {
      // PostgREST answers with the affected rows
      Some(Value::Array(mut rows)) => {
        if rows.is_empty() {
          None
        } else {
          Some(rows.swap_remove(0))
        }
      }
      other => other,
    };
    Ok(committed)
  }
}

/// Render a filter as PostgREST query parameters.
fn filter_params(filter: &Filter) -> Vec<(String, String)> {
  filter
    .conditions
    .iter()
    .map(|c| {
      let rendered = match (&c.op, &c.value) {
        (CompareOp::Eq, Value::Null) => "is.null".to_string(),
        (CompareOp::Neq, Value::Null) => "not.is.null".to_string(),
        (op, Value::String(s)) => format!("{}.{}", op.as_str(), s),
        (op, other) => format!("{}.{}", op.as_str(), other),
      };
      (c.field.clone(), rendered)
    })
    .collect()
}

/// Map an HTTP status to the error taxonomy.
fn classify_status(status: StatusCode, body: &str) -> RemoteError {
  let message = format!("{}: {}", status, body.trim());
  if status.is_server_error()
    || status == StatusCode::REQUEST_TIMEOUT
    || status == StatusCode::TOO_MANY_REQUESTS
  {
    RemoteError::Transient(message)
  } else {
    RemoteError::Terminal(message)
  }
}

fn classify_transport(err: reqwest::Error) -> RemoteError {
  if err.is_builder() {
    RemoteError::Terminal(err.to_string())
  } else {
    RemoteError::Transient(err.to_string())
  }
}
