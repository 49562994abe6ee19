use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use gymsync::cache::{Filter, OrderBy, QueryDef, SqliteStorage};
use gymsync::config::Config;
use gymsync::SyncEngine;
use serde_json::Value;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "gymsync")]
#[command(about = "Local-first cache and sync for workout data")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/gymsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Print cached rows of a table, then revalidate against the remote
  List {
    table: String,
    /// Equality filter, repeatable (field=value)
    #[arg(short = 'w', long = "where", value_name = "FIELD=VALUE")]
    conditions: Vec<String>,
    /// Sort field
    #[arg(short, long)]
    order: Option<String>,
    /// Sort descending
    #[arg(long)]
    desc: bool,
    #[arg(short, long)]
    limit: Option<usize>,
  },
  /// Create a record from a JSON object
  Create {
    table: String,
    json: String,
    /// Only queue the write, do not contact the remote
    #[arg(long)]
    offline: bool,
  },
  /// Merge a JSON object into the cached record with the same primary key
  Update {
    table: String,
    json: String,
    #[arg(long)]
    offline: bool,
  },
  /// Delete a record by primary key
  Delete {
    table: String,
    id: String,
    #[arg(long)]
    offline: bool,
  },
  /// Send queued writes to the remote
  Sync,
  /// Show queued writes and failures
  Status,
  /// Requeue a failed write
  Retry { sequence_id: u64 },
  /// Drop a failed write
  Discard { sequence_id: u64 },
  /// Delete all cached records (queued writes are kept)
  ClearCache,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = init_logging(&config)?;

  let api_key = Config::api_key();
  let engine = SyncEngine::from_config(&config, api_key.as_deref())
    .map_err(|e| eyre!("Failed to open sync engine: {}", e))?;

  match args.command {
    Command::List {
      table,
      conditions,
      order,
      desc,
      limit,
    } => list(&engine, &config, table, &conditions, order, desc, limit).await,
    Command::Create { table, json, offline } => {
      let record = engine.create(&table, &parse_json(&json)?)?;
      finish_write(&engine, record, offline).await
    }
    Command::Update { table, json, offline } => {
      let record = engine.update(&table, &parse_json(&json)?)?;
      finish_write(&engine, record, offline).await
    }
    Command::Delete { table, id, offline } => {
      let record = engine.delete(&table, &id)?;
      finish_write(&engine, record, offline).await
    }
    Command::Sync => {
      let report = engine.drain_once().await?;
      println!(
        "committed {}, retrying {}, failed {}, still queued {}",
        report.committed.len(),
        report.retried.len(),
        report.failed.len(),
        report.remaining
      );
      Ok(())
    }
    Command::Status => status(&engine),
    Command::Retry { sequence_id } => {
      let item = engine.retry(sequence_id)?;
      println!("#{} {} {}:{} requeued", item.sequence_id, item.operation, item.table, item.record_id);
      Ok(())
    }
    Command::Discard { sequence_id } => {
      let item = engine.discard(sequence_id)?;
      println!("#{} {} {}:{} discarded", item.sequence_id, item.operation, item.table, item.record_id);
      Ok(())
    }
    Command::ClearCache => {
      engine.clear_cache()?;
      println!("cache cleared");
      Ok(())
    }
  }
}

/// Log to a daily file next to the database so stdout stays machine-readable.
fn init_logging(config: &Config) -> Result<WorkerGuard> {
  let db_path = match &config.database_path {
    Some(p) => p.clone(),
    None => SqliteStorage::default_path()?,
  };
  let log_dir = db_path.parent().unwrap_or_else(|| Path::new(".")).join("logs");
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(&log_dir, "gymsync.log"));
  let filter = EnvFilter::try_from_env("GYMSYNC_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_writer(writer).with_ansi(false))
    .init();

  Ok(guard)
}

fn parse_json(raw: &str) -> Result<Value> {
  serde_json::from_str(raw).map_err(|e| eyre!("Invalid JSON payload: {}", e))
}

/// `field=value`, where the value is read as JSON when it parses and as a
/// plain string otherwise.
fn parse_condition(raw: &str) -> Result<(String, Value)> {
  let (field, value) = raw
    .split_once('=')
    .ok_or_else(|| eyre!("Expected FIELD=VALUE, got '{}'", raw))?;
  let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
  Ok((field.trim().to_string(), value))
}

async fn list(
  engine: &SyncEngine,
  config: &Config,
  table: String,
  conditions: &[String],
  order: Option<String>,
  desc: bool,
  limit: Option<usize>,
) -> Result<()> {
  let mut filter = Filter::new();
  for raw in conditions {
    let (field, value) = parse_condition(raw)?;
    filter = filter.eq(field, value);
  }

  let key = list_key(&table, conditions, order.as_deref(), desc, limit);
  let mut def = QueryDef::new(key, table).with_filter(filter);
  if let Some(field) = order {
    def = def.order_by(if desc { OrderBy::desc(field) } else { OrderBy::asc(field) });
  }
  if let Some(n) = limit {
    def = def.limit(n);
  }

  let mut sub = engine.subscribe_table::<Value>(def)?;
  let mut result = sub.recv().await.ok_or_else(|| eyre!("Subscription closed"))?;

  // Wait for the revalidation (or the loading watchdog) unless the cache was fresh
  if result.is_stale {
    let wait = std::time::Duration::from_millis(config.cache.loading_timeout_ms + 1_000);
    if let Ok(Some(next)) = tokio::time::timeout(wait, sub.recv()).await {
      result = next;
    }
  }

  let rows: Vec<&Value> = result.payloads().collect();
  println!("{}", serde_json::to_string_pretty(&rows)?);

  if let Some(err) = &result.error {
    eprintln!("showing cached rows: {}", err);
  } else if result.is_stale {
    eprintln!("showing cached rows: remote did not answer in time");
  }
  Ok(())
}

/// Query key for a `list` invocation. Shape options are part of it, since a
/// registered key keeps its first definition.
fn list_key(table: &str, conditions: &[String], order: Option<&str>, desc: bool, limit: Option<usize>) -> String {
  let order = order.map_or(String::new(), |field| format!("{}.{}", field, if desc { "desc" } else { "asc" }));
  let limit = limit.map_or(String::new(), |n| n.to_string());
  format!("cli:{}:{}:{}:{}", table, conditions.join("&"), order, limit)
}

async fn finish_write(engine: &SyncEngine, record: Value, offline: bool) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(&record)?);
  if offline {
    return Ok(());
  }

  let report = engine.drain_once().await?;
  if report.remaining > 0 {
    eprintln!(
      "{} write(s) still queued; run `gymsync status` for details",
      report.remaining
    );
  }
  Ok(())
}

fn status(engine: &SyncEngine) -> Result<()> {
  let items = engine.queue().items()?;
  let mut tables: BTreeSet<String> = engine.schemas().names().map(str::to_string).collect();
  tables.extend(items.iter().map(|i| i.table.clone()));

  for table in &tables {
    let pending = engine.pending_count(table)?;
    match engine.last_error(table)? {
      Some(err) => println!("{:<24} {:>4} queued  last error: {}", table, pending, err),
      None => println!("{:<24} {:>4} queued", table, pending),
    }
  }

  for item in &items {
    let due = item
      .next_attempt_at
      .map(|at| format!(" next attempt {}", at.to_rfc3339()))
      .unwrap_or_default();
    println!(
      "#{:<6} {:<6} {}:{} {} (attempts {}){}",
      item.sequence_id,
      item.operation,
      item.table,
      item.record_id,
      item.state.as_str(),
      item.attempts,
      due
    );
  }
  Ok(())
}
