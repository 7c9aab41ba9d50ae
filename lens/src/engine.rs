//! Embedded query engine session.
//!
//! A session owns one DataFusion [`SessionContext`]. Uploaded Parquet files are
//! decoded off the async runtime and registered as in-memory tables; queries run
//! the fixed `input, y_pred, y_test` projection over any subset of them.
//!
//! The session is an explicit handle returned by [`QueryEngine::initialize`]
//! and passed to every later call. Nothing is global.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use datafusion::datasource::MemTable;
use datafusion::prelude::{SessionConfig, SessionContext};
use indexmap::IndexMap;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::common::{PROJECTION, SourceFile};

// ============================================================================
// Configuration
// ============================================================================

/// Default number of rows per decoded record batch.
pub const DEFAULT_BATCH_SIZE: usize = 8192;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// DataFusion target partitions. With 1, results come back in file order
    /// and in-file row order.
    pub target_partitions: usize,
    /// Rows per decoded batch.
    pub batch_size: usize,
    /// Upper bound on a single register/query call. `None` waits forever.
    pub call_timeout: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            target_partitions: 1,
            batch_size: DEFAULT_BATCH_SIZE,
            call_timeout: None,
        }
    }
}

impl EngineConfig {
    pub fn with_target_partitions(mut self, target_partitions: usize) -> Self {
        self.target_partitions = target_partitions.max(1);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_call_timeout(mut self, call_timeout: Option<Duration>) -> Self {
        self.call_timeout = call_timeout;
        self
    }
}

// ============================================================================
// Error Type
// ============================================================================

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("failed to initialize query engine: {0}")]
    Initialization(String),

    #[error("failed to register '{name}': {reason}")]
    Registration { name: String, reason: String },

    #[error("query failed: {0}")]
    Query(String),

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("query engine session has been terminated")]
    Terminated,
}

pub type Result<T> = std::result::Result<T, EngineError>;

fn registration(name: &str, reason: impl std::fmt::Display) -> EngineError {
    EngineError::Registration {
        name: name.to_string(),
        reason: reason.to_string(),
    }
}

/// Run `fut`, failing with [`EngineError::Timeout`] if it outlives `limit`.
async fn bounded<T>(
    limit: Option<Duration>,
    operation: &'static str,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match limit {
        Some(after) => tokio::time::timeout(after, fut)
            .await
            .map_err(|_| EngineError::Timeout { operation, after })?,
        None => fut.await,
    }
}

// ============================================================================
// Engine Trait
// ============================================================================

pub trait QueryEngine: Sized + Send {
    type Config: Clone + Send + Sync;

    /// Start an engine and return the session handle.
    fn initialize(config: &Self::Config) -> impl Future<Output = Result<Self>> + Send;

    /// Make each file queryable under its name. Names must be unique within one
    /// call; a name that is already registered is replaced. Registrations stay
    /// staged until [`commit`](Self::commit) or [`rollback`](Self::rollback).
    fn register_files(&mut self, files: &[SourceFile]) -> impl Future<Output = Result<()>> + Send;

    /// Keep every staged registration and release the tables they replaced.
    fn commit(&mut self) -> impl Future<Output = ()> + Send;

    /// Undo every staged registration, restoring replaced names.
    fn rollback(&mut self) -> impl Future<Output = ()> + Send;

    /// Run the fixed projection over the named files, in the given order.
    fn query(&self, names: &[String]) -> impl Future<Output = Result<Vec<RecordBatch>>> + Send;

    /// Best-effort unregistration. Never fails; problems are logged.
    fn drop_files(&mut self, names: &[String]) -> impl Future<Output = ()> + Send;

    /// Release all engine resources. Safe to call more than once.
    fn terminate(&mut self) -> impl Future<Output = ()> + Send;
}

// ============================================================================
// DataFusion Implementation
// ============================================================================

/// A registration not yet committed.
#[derive(Debug)]
struct Staged {
    name: String,
    table: String,
    /// Table the name pointed at before, released on commit.
    replaced: Option<String>,
}

pub struct DataFusionEngine {
    ctx: Option<SessionContext>,
    config: EngineConfig,
    /// File name -> catalog table name, in registration order.
    tables: IndexMap<String, String>,
    staged: Vec<Staged>,
    next_table: usize,
}

impl DataFusionEngine {
    fn context(&self) -> Result<&SessionContext> {
        self.ctx.as_ref().ok_or(EngineError::Terminated)
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    pub fn registered_files(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    pub fn has_staged(&self) -> bool {
        !self.staged.is_empty()
    }

    pub fn is_terminated(&self) -> bool {
        self.ctx.is_none()
    }

    /// The SQL text for the projection over `tables`.
    fn projection_sql(tables: &[&str]) -> String {
        let columns = PROJECTION
            .iter()
            .map(|c| format!("\"{c}\""))
            .collect::<Vec<_>>()
            .join(", ");
        tables
            .iter()
            .map(|t| format!("SELECT {columns} FROM \"{t}\""))
            .collect::<Vec<_>>()
            .join(" UNION ALL ")
    }
}

/// Decode a Parquet buffer into one in-memory partition.
async fn decode_parquet(file: SourceFile, batch_size: usize) -> Result<(SchemaRef, Vec<RecordBatch>)> {
    let name = file.name.clone();
    tokio::task::spawn_blocking(move || {
        let builder = ParquetRecordBatchReaderBuilder::try_new(file.bytes)
            .map_err(|e| registration(&file.name, e))?;
        let schema = builder.schema().clone();
        let reader = builder
            .with_batch_size(batch_size)
            .build()
            .map_err(|e| registration(&file.name, e))?;
        let batches = reader
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| registration(&file.name, e))?;
        Ok((schema, batches))
    })
    .await
    .map_err(|e| registration(&name, format!("decode task failed: {e}")))?
}

impl QueryEngine for DataFusionEngine {
    type Config = EngineConfig;

    async fn initialize(config: &EngineConfig) -> Result<Self> {
        info!(
            "Starting query engine (target_partitions={}, batch_size={}, timeout={:?})",
            config.target_partitions, config.batch_size, config.call_timeout
        );
        let session_config = SessionConfig::new()
            .with_target_partitions(config.target_partitions)
            .with_batch_size(config.batch_size)
            .set_bool("datafusion.sql_parser.enable_ident_normalization", false);
        let ctx = SessionContext::new_with_config(session_config);

        // Probe so a broken engine fails here rather than on the first load.
        let probe = ctx
            .sql("SELECT 1 AS probe")
            .await
            .map_err(|e| EngineError::Initialization(e.to_string()))?;
        probe
            .collect()
            .await
            .map_err(|e| EngineError::Initialization(e.to_string()))?;

        Ok(Self {
            ctx: Some(ctx),
            config: config.clone(),
            tables: IndexMap::new(),
            staged: Vec::new(),
            next_table: 0,
        })
    }

    async fn register_files(&mut self, files: &[SourceFile]) -> Result<()> {
        self.context()?;
        let mut seen = HashSet::new();
        for file in files {
            if !seen.insert(file.name.as_str()) {
                return Err(registration(&file.name, "name appears twice in one registration"));
            }
        }

        for file in files {
            let (schema, batches) = bounded(
                self.config.call_timeout,
                "register",
                decode_parquet(file.clone(), self.config.batch_size),
            )
            .await?;
            let rows: usize = batches.iter().map(RecordBatch::num_rows).sum();
            let table = MemTable::try_new(schema, vec![batches])
                .map_err(|e| registration(&file.name, e))?;

            let table_name = format!("file_{}", self.next_table);
            self.next_table += 1;
            self.context()?
                .register_table(table_name.as_str(), Arc::new(table))
                .map_err(|e| registration(&file.name, e))?;
            info!(
                "Registered {} ({} bytes, {} rows) as {table_name}",
                file.name,
                file.len(),
                rows
            );
            let replaced = self.tables.insert(file.name.clone(), table_name.clone());
            if let Some(old) = &replaced {
                debug!("'{}' now shadows {old} until commit", file.name);
            }
            self.staged.push(Staged {
                name: file.name.clone(),
                table: table_name,
                replaced,
            });
        }
        Ok(())
    }

    async fn commit(&mut self) {
        let staged = std::mem::take(&mut self.staged);
        let Some(ctx) = self.ctx.as_ref() else {
            return;
        };
        for old in staged.into_iter().filter_map(|s| s.replaced) {
            match ctx.deregister_table(old.as_str()) {
                Ok(_) => debug!("Released replaced table {old}"),
                Err(e) => warn!("failed to release replaced table {old}: {e}"),
            }
        }
    }

    async fn rollback(&mut self) {
        let staged = std::mem::take(&mut self.staged);
        let Some(ctx) = self.ctx.as_ref() else {
            return;
        };
        if !staged.is_empty() {
            info!("Rolling back {} staged registration(s)", staged.len());
        }
        // Newest first, so a name staged twice ends on its oldest table.
        for s in staged.into_iter().rev() {
            if let Err(e) = ctx.deregister_table(s.table.as_str()) {
                warn!("failed to release staged table {} of '{}': {e}", s.table, s.name);
            }
            match s.replaced {
                Some(old) => {
                    debug!("'{}' restored to {old}", s.name);
                    self.tables.insert(s.name, old);
                }
                None => {
                    self.tables.shift_remove(&s.name);
                }
            }
        }
    }

    async fn query(&self, names: &[String]) -> Result<Vec<RecordBatch>> {
        let ctx = self.context()?;
        if names.is_empty() {
            return Ok(Vec::new());
        }
        let tables = names
            .iter()
            .map(|n| {
                self.tables
                    .get(n)
                    .map(String::as_str)
                    .ok_or_else(|| EngineError::Query(format!("'{n}' is not registered")))
            })
            .collect::<Result<Vec<_>>>()?;
        let sql = Self::projection_sql(&tables);
        debug!("query: {sql}");

        let partitions = bounded(self.config.call_timeout, "query", async {
            let df = ctx
                .sql(&sql)
                .await
                .map_err(|e| EngineError::Query(e.to_string()))?;
            // Partitions come back in plan order, which keeps file order.
            df.collect_partitioned()
                .await
                .map_err(|e| EngineError::Query(e.to_string()))
        })
        .await?;

        let batches: Vec<RecordBatch> = partitions.into_iter().flatten().collect();
        let rows: usize = batches.iter().map(RecordBatch::num_rows).sum();
        info!("Query over {} file(s) returned {rows} rows", names.len());
        Ok(batches)
    }

    async fn drop_files(&mut self, names: &[String]) {
        let Some(ctx) = self.ctx.as_ref() else {
            warn!("drop of {} file(s) after termination ignored", names.len());
            return;
        };
        for name in names {
            // A dropped name has nothing left to restore.
            self.staged.retain(|s| {
                if s.name != *name {
                    return true;
                }
                if let Some(old) = &s.replaced {
                    if let Err(e) = ctx.deregister_table(old.as_str()) {
                        warn!("failed to release replaced table {old}: {e}");
                    }
                }
                false
            });
            let Some(table) = self.tables.shift_remove(name) else {
                warn!("'{name}' is not registered, nothing to drop");
                continue;
            };
            match ctx.deregister_table(table.as_str()) {
                Ok(Some(_)) => debug!("Dropped {name} ({table})"),
                Ok(None) => warn!("'{name}' ({table}) was already released by the engine"),
                Err(e) => warn!("failed to drop '{name}' ({table}): {e}"),
            }
        }
    }

    async fn terminate(&mut self) {
        match self.ctx.take() {
            Some(_) => {
                info!(
                    "Query engine terminated ({} file(s) released)",
                    self.tables.len()
                );
                self.tables.clear();
                self.staged.clear();
            }
            None => debug!("Query engine already terminated"),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{EvalRow, eval_parquet};
    use crate::normalize::normalize_batches;

    fn file(name: &str, labels: &[i64]) -> SourceFile {
        let rows: Vec<EvalRow> = labels
            .iter()
            .map(|&l| EvalRow::one_hot(vec![0.0; 4], l as usize, 3, l))
            .collect();
        SourceFile::new(name, eval_parquet(&rows).unwrap())
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_config_default() {
        let config = EngineConfig::default();
        assert_eq!(config.target_partitions, 1);
        assert_eq!(config.batch_size, DEFAULT_BATCH_SIZE);
        assert!(config.call_timeout.is_none());
        assert_eq!(EngineConfig::default().with_target_partitions(0).target_partitions, 1);
    }

    #[test]
    fn test_projection_sql() {
        assert_eq!(
            DataFusionEngine::projection_sql(&["file_0", "file_3"]),
            "SELECT \"input\", \"y_pred\", \"y_test\" FROM \"file_0\" UNION ALL \
             SELECT \"input\", \"y_pred\", \"y_test\" FROM \"file_3\""
        );
    }

    #[tokio::test]
    async fn test_register_and_query_in_file_order() {
        let mut engine = DataFusionEngine::initialize(&EngineConfig::default())
            .await
            .unwrap();
        engine
            .register_files(&[file("a.parquet", &[0, 1]), file("b.parquet", &[2])])
            .await
            .unwrap();

        let batches = engine.query(&names(&["b.parquet", "a.parquet"])).await.unwrap();
        let labels: Vec<Option<i64>> = normalize_batches(&batches)
            .iter()
            .map(|r| r.true_label)
            .collect();
        assert_eq!(labels, vec![Some(2), Some(0), Some(1)]);
        assert!(engine.query(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reregistering_a_name_replaces_it() {
        let mut engine = DataFusionEngine::initialize(&EngineConfig::default())
            .await
            .unwrap();
        engine.register_files(&[file("a.parquet", &[0])]).await.unwrap();
        engine.commit().await;
        engine.register_files(&[file("a.parquet", &[1, 1])]).await.unwrap();
        assert_eq!(engine.registered_files().count(), 1);

        let batches = engine.query(&names(&["a.parquet"])).await.unwrap();
        assert_eq!(normalize_batches(&batches).len(), 2);

        engine.commit().await;
        assert!(!engine.has_staged());
        let batches = engine.query(&names(&["a.parquet"])).await.unwrap();
        assert_eq!(normalize_batches(&batches).len(), 2);
    }

    #[tokio::test]
    async fn test_rollback_restores_replaced_and_drops_new() {
        let mut engine = DataFusionEngine::initialize(&EngineConfig::default())
            .await
            .unwrap();
        engine.register_files(&[file("a.parquet", &[1])]).await.unwrap();
        engine.commit().await;

        engine
            .register_files(&[file("a.parquet", &[7, 8]), file("b.parquet", &[2])])
            .await
            .unwrap();
        engine.register_files(&[file("a.parquet", &[9])]).await.unwrap();
        engine.rollback().await;

        assert!(!engine.has_staged());
        assert!(!engine.is_registered("b.parquet"));
        let batches = engine.query(&names(&["a.parquet"])).await.unwrap();
        let labels: Vec<Option<i64>> = normalize_batches(&batches)
            .iter()
            .map(|r| r.true_label)
            .collect();
        assert_eq!(labels, vec![Some(1)]);
    }

    #[tokio::test]
    async fn test_register_times_out() {
        let config = EngineConfig::default().with_call_timeout(Some(Duration::from_nanos(1)));
        let mut engine = DataFusionEngine::initialize(&config).await.unwrap();
        let rows = vec![EvalRow::one_hot(vec![0.5; 784], 1, 10, 1); 5000];
        let big = SourceFile::new("big.parquet", eval_parquet(&rows).unwrap());

        let result = engine.register_files(&[big]).await;
        assert!(matches!(
            result,
            Err(EngineError::Timeout {
                operation: "register",
                ..
            })
        ));
        assert!(!engine.is_registered("big.parquet"));
        assert!(!engine.has_staged());
    }

    #[tokio::test]
    async fn test_registration_errors() {
        let mut engine = DataFusionEngine::initialize(&EngineConfig::default())
            .await
            .unwrap();
        let dup = engine
            .register_files(&[file("a.parquet", &[0]), file("a.parquet", &[1])])
            .await;
        assert!(matches!(dup, Err(EngineError::Registration { .. })));

        let garbage = SourceFile::new("junk.parquet", b"definitely not parquet".to_vec());
        let corrupt = engine.register_files(&[garbage]).await;
        assert!(matches!(corrupt, Err(EngineError::Registration { .. })));
        assert!(!engine.is_registered("junk.parquet"));
    }

    #[tokio::test]
    async fn test_query_errors() {
        let mut engine = DataFusionEngine::initialize(&EngineConfig::default())
            .await
            .unwrap();
        let unknown = engine.query(&names(&["missing.parquet"])).await;
        assert!(matches!(unknown, Err(EngineError::Query(_))));

        let batch = RecordBatch::try_from_iter(vec![(
            "other",
            Arc::new(arrow::array::Int64Array::from(vec![1i64])) as arrow::array::ArrayRef,
        )])
        .unwrap();
        let bytes = crate::fixtures::to_parquet_bytes(&[batch]).unwrap();
        engine
            .register_files(&[SourceFile::new("wrong.parquet", bytes)])
            .await
            .unwrap();
        let wrong_schema = engine.query(&names(&["wrong.parquet"])).await;
        assert!(matches!(wrong_schema, Err(EngineError::Query(_))));
    }

    #[tokio::test]
    async fn test_drop_and_terminate() {
        let mut engine = DataFusionEngine::initialize(&EngineConfig::default())
            .await
            .unwrap();
        engine.register_files(&[file("a.parquet", &[0])]).await.unwrap();
        engine.drop_files(&names(&["a.parquet", "never.parquet"])).await;
        assert!(!engine.is_registered("a.parquet"));
        assert!(engine.query(&names(&["a.parquet"])).await.is_err());

        engine.terminate().await;
        engine.terminate().await;
        assert!(engine.is_terminated());
        assert!(matches!(
            engine.query(&names(&["a.parquet"])).await,
            Err(EngineError::Terminated)
        ));
        assert!(matches!(
            engine.register_files(&[file("b.parquet", &[0])]).await,
            Err(EngineError::Terminated)
        ));
        engine.drop_files(&names(&["b.parquet"])).await;
    }
}
