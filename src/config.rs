use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::query::QueryOptions;
use crate::schema::TableSchema;
use crate::sync::{RetryPolicy, DEFAULT_CONCURRENCY, MAX_CONCURRENCY};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub remote: RemoteConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  /// SQLite file for the Local Store (defaults to the data directory)
  pub database_path: Option<PathBuf>,
  #[serde(default)]
  pub tables: Vec<TableSchema>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
  /// REST root, e.g. `https://xyz.supabase.co/rest/v1`
  pub url: String,
  /// Postgres schema to target instead of the server default
  pub schema: Option<String>,
  #[serde(default = "default_request_timeout_ms")]
  pub request_timeout_ms: u64,
}

fn default_request_timeout_ms() -> u64 {
  30_000
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Cached data younger than this is served without revalidating
  pub stale_after_ms: u64,
  /// How long a subscriber waits for the remote before cached rows are forced
  pub loading_timeout_ms: u64,
  /// How long a delete suppresses reads that started before it
  pub bypass_window_ms: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      stale_after_ms: 0,
      loading_timeout_ms: 15_000,
      bypass_window_ms: 10_000,
    }
  }
}

impl CacheConfig {
  pub fn query_options(&self) -> QueryOptions {
    QueryOptions::default()
      .with_stale_after(Duration::from_millis(self.stale_after_ms))
      .with_timeout(Duration::from_millis(self.loading_timeout_ms))
  }

  pub fn bypass_window(&self) -> chrono::Duration {
    chrono::Duration::milliseconds(self.bypass_window_ms as i64)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Records synced in parallel (1 to 4)
  pub concurrency: usize,
  pub max_attempts: u32,
  pub backoff_base_ms: u64,
  pub backoff_cap_ms: u64,
  pub jitter_ratio: f64,
  /// Bound on a single remote write
  pub attempt_timeout_ms: u64,
  /// Idle wake-up interval of the background drain loop
  pub poll_interval_ms: u64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      concurrency: DEFAULT_CONCURRENCY,
      max_attempts: 10,
      backoff_base_ms: 1_000,
      backoff_cap_ms: 60_000,
      jitter_ratio: 0.2,
      attempt_timeout_ms: 10_000,
      poll_interval_ms: 30_000,
    }
  }
}

impl SyncConfig {
  pub fn retry_policy(&self) -> RetryPolicy {
    RetryPolicy {
      base: chrono::Duration::milliseconds(self.backoff_base_ms as i64),
      cap: chrono::Duration::milliseconds(self.backoff_cap_ms as i64),
      jitter_ratio: self.jitter_ratio,
      max_attempts: self.max_attempts.max(1),
    }
  }

  pub fn concurrency(&self) -> usize {
    self.concurrency.clamp(1, MAX_CONCURRENCY)
  }

  pub fn attempt_timeout(&self) -> Duration {
    Duration::from_millis(self.attempt_timeout_ms)
  }

  pub fn poll_interval(&self) -> Duration {
    Duration::from_millis(self.poll_interval_ms.max(1))
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./gymsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/gymsync/config.yaml
  /// 4. ~/.config/gymsync/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/gymsync/config.yaml\n\
                 See gymsync.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("gymsync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("gymsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    if config.remote.url.trim().is_empty() {
      return Err(eyre!("remote.url must not be empty"));
    }
    Ok(config)
  }

  /// Get the backend API key from environment variables.
  ///
  /// Checks GYMSYNC_API_KEY first, then SUPABASE_ANON_KEY as fallback.
  /// Without either, requests go out unauthenticated.
  pub fn api_key() -> Option<String> {
    std::env::var("GYMSYNC_API_KEY")
      .or_else(|_| std::env::var("SUPABASE_ANON_KEY"))
      .ok()
      .filter(|k| !k.is_empty())
  }

  pub fn request_timeout(&self) -> Duration {
    Duration::from_millis(self.remote.request_timeout_ms)
  }
}
