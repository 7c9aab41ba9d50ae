//! Ingestion controller.
//!
//! Owns the engine session, the set of loaded file names and the current sample
//! records, and walks the session lifecycle:
//!
//! ```text
//! Uninitialized -> Initializing -> ReadyEmpty <-> Loading <-> ReadyWithData
//!                        |                          |
//!                        +--------> Error <---------+
//! any state -> unmount -> Terminated
//! ```
//!
//! Every engine call is awaited before the next one is issued; `&mut self`
//! keeps one operation in flight per controller.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use indexmap::{IndexMap, IndexSet};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::common::{SampleRecord, SourceFile, is_parquet_name};
use crate::engine::{EngineError, QueryEngine};
use crate::normalize::normalize_batches;
use crate::scorer::{EvaluationSummary, NoVerdictPolicy, summarize};

// ============================================================================
// Cancellation
// ============================================================================

/// Shared flag telling an in-flight initialization that its result is unwanted.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ============================================================================
// State and Errors
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    Initialization,
    Registration,
    Query,
    Timeout,
    NotReady,
}

/// A session-level failure as shown to the user.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[error("{message}")]
pub struct ControllerError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ControllerError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    fn not_ready() -> Self {
        Self::new(ErrorKind::NotReady, "engine not initialized")
    }
}

impl From<EngineError> for ControllerError {
    fn from(e: EngineError) -> Self {
        let kind = match &e {
            EngineError::Initialization(_) => ErrorKind::Initialization,
            EngineError::Registration { .. } => ErrorKind::Registration,
            EngineError::Query(_) => ErrorKind::Query,
            EngineError::Timeout { .. } => ErrorKind::Timeout,
            EngineError::Terminated => ErrorKind::NotReady,
        };
        Self::new(kind, e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Uninitialized,
    Initializing,
    /// Engine up, nothing to show.
    ReadyEmpty,
    Loading,
    ReadyWithData,
    Error(ControllerError),
    Terminated,
}

// ============================================================================
// Controller
// ============================================================================

pub struct IngestionController<E: QueryEngine> {
    config: E::Config,
    session: Option<E>,
    state: SessionState,
    loaded: IndexSet<String>,
    data: Vec<SampleRecord>,
    cancel: CancelToken,
    state_tx: watch::Sender<SessionState>,
}

impl<E: QueryEngine> IngestionController<E> {
    pub fn new(config: E::Config) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Uninitialized);
        Self {
            config,
            session: None,
            state: SessionState::Uninitialized,
            loaded: IndexSet::new(),
            data: Vec::new(),
            cancel: CancelToken::new(),
            state_tx,
        }
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            debug!("session state {:?} -> {:?}", self.state, state);
        }
        self.state_tx.send_replace(state.clone());
        self.state = state;
    }

    fn ready_state(&self) -> SessionState {
        if self.data.is_empty() {
            SessionState::ReadyEmpty
        } else {
            SessionState::ReadyWithData
        }
    }

    /// Start the engine session.
    ///
    /// A no-op once a session exists. `cancel` is checked after initialization
    /// resolves; a cancelled mount terminates the fresh session instead of
    /// installing it.
    pub async fn mount(&mut self, cancel: &CancelToken) -> Result<(), ControllerError> {
        if self.session.is_some() {
            debug!("mount ignored, session already live");
            return Ok(());
        }
        if self.state == SessionState::Terminated {
            return Err(ControllerError::not_ready());
        }
        self.cancel = cancel.clone();
        self.set_state(SessionState::Initializing);

        let result = E::initialize(&self.config).await;

        if cancel.is_cancelled() {
            if let Ok(mut session) = result {
                info!("mount cancelled, discarding freshly initialized session");
                session.terminate().await;
            }
            self.set_state(SessionState::Terminated);
            return Ok(());
        }

        match result {
            Ok(session) => {
                info!("Query engine ready");
                self.session = Some(session);
                let ready = self.ready_state();
                self.set_state(ready);
                Ok(())
            }
            Err(e) => {
                let err = ControllerError::from(e);
                warn!("initialization failed: {err}");
                self.set_state(SessionState::Error(err.clone()));
                Err(err)
            }
        }
    }

    /// Ingest dropped files and replace `data` with rows from every loaded file.
    ///
    /// Names without a `.parquet` extension are ignored. Within one drop the last
    /// file with a given name wins; a name that is already loaded is replaced. On
    /// failure every registration made by this call is rolled back, replaced
    /// names included, and the previous `data` stays visible.
    pub async fn load_files(&mut self, files: Vec<SourceFile>) -> Result<(), ControllerError> {
        let mut accepted: IndexMap<String, SourceFile> = IndexMap::new();
        for file in files {
            if is_parquet_name(&file.name) {
                accepted.insert(file.name.clone(), file);
            } else {
                warn!("ignoring '{}': not a .parquet file", file.name);
            }
        }
        if accepted.is_empty() {
            debug!("no parquet files in drop");
            return Ok(());
        }

        if self.session.is_none() {
            let err = ControllerError::not_ready();
            if self.state != SessionState::Terminated {
                self.set_state(SessionState::Error(err.clone()));
            }
            return Err(err);
        }

        let files: Vec<SourceFile> = accepted.into_values().collect();
        let newly_added: Vec<String> = files
            .iter()
            .filter(|f| !self.loaded.contains(&f.name))
            .map(|f| f.name.clone())
            .collect();
        let names: Vec<String> = self
            .loaded
            .iter()
            .cloned()
            .chain(newly_added.iter().cloned())
            .collect();

        info!(
            "Loading {} file(s), {} new, {} total",
            files.len(),
            newly_added.len(),
            names.len()
        );
        self.set_state(SessionState::Loading);

        let Some(session) = self.session.as_mut() else {
            return Err(ControllerError::not_ready());
        };
        match ingest(session, &files, &names).await {
            Ok(records) => {
                session.commit().await;
                self.loaded.extend(newly_added);
                self.data = records;
                info!(
                    "Loaded {} rows from {} file(s)",
                    self.data.len(),
                    self.loaded.len()
                );
                let ready = self.ready_state();
                self.set_state(ready);
                Ok(())
            }
            Err(e) => {
                let err = ControllerError::from(e);
                warn!("load failed: {err}");
                session.rollback().await;
                self.set_state(SessionState::Error(err.clone()));
                Err(err)
            }
        }
    }

    /// Unregister every loaded file and forget the current rows.
    pub async fn clear(&mut self) {
        let names: Vec<String> = self.loaded.drain(..).collect();
        if let Some(session) = self.session.as_mut() {
            if !names.is_empty() {
                session.drop_files(&names).await;
            }
        }
        self.data.clear();
        info!("Cleared {} file(s)", names.len());

        let next = match (&self.state, &self.session) {
            (SessionState::Terminated, _) => SessionState::Terminated,
            (_, Some(_)) => SessionState::ReadyEmpty,
            (_, None) => SessionState::Uninitialized,
        };
        self.set_state(next);
    }

    /// Recover from the `Error` state.
    ///
    /// Without a live session this re-runs initialization from scratch;
    /// otherwise the load error is dismissed and the controller is ready again.
    pub async fn retry(&mut self, cancel: &CancelToken) -> Result<(), ControllerError> {
        if !matches!(self.state, SessionState::Error(_)) {
            return Ok(());
        }
        if self.session.is_none() {
            info!("Retrying engine initialization");
            self.set_state(SessionState::Uninitialized);
            return self.mount(cancel).await;
        }
        let ready = self.ready_state();
        self.set_state(ready);
        Ok(())
    }

    /// Tear the session down. Results of anything still pending are discarded.
    pub async fn unmount(&mut self) {
        self.cancel.cancel();
        if let Some(mut session) = self.session.take() {
            session.terminate().await;
        }
        self.loaded.clear();
        self.data.clear();
        self.set_state(SessionState::Terminated);
    }

    // ------------------------------------------------------------------------
    // Observers
    // ------------------------------------------------------------------------

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Receiver that sees every state change.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub fn is_loading(&self) -> bool {
        matches!(
            self.state,
            SessionState::Initializing | SessionState::Loading
        )
    }

    pub fn is_ready(&self) -> bool {
        matches!(
            self.state,
            SessionState::ReadyEmpty | SessionState::ReadyWithData
        )
    }

    pub fn error(&self) -> Option<&ControllerError> {
        match &self.state {
            SessionState::Error(e) => Some(e),
            _ => None,
        }
    }

    pub fn data(&self) -> &[SampleRecord] {
        &self.data
    }

    pub fn loaded_files(&self) -> Vec<&str> {
        self.loaded.iter().map(String::as_str).collect()
    }

    pub fn summary(&self, policy: NoVerdictPolicy) -> EvaluationSummary {
        summarize(&self.data, policy)
    }

    /// With nothing to show, the presentation layer falls back to the drop zone.
    pub fn show_drop_zone(&self) -> bool {
        self.data.is_empty()
    }
}

/// Register `files`, then run the projection over `names` and decode the rows.
async fn ingest<E: QueryEngine>(
    session: &mut E,
    files: &[SourceFile],
    names: &[String],
) -> Result<Vec<SampleRecord>, EngineError> {
    session.register_files(files).await?;
    let batches = session.query(names).await?;
    Ok(normalize_batches(&batches))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use arrow::record_batch::RecordBatch;
    use bytes::Bytes;

    use super::*;
    use crate::engine;
    use crate::fixtures::{EvalRow, eval_batch};

    /// Engine double. A file's bytes hold its row count as text; `corrupt`
    /// fails registration and `no-columns` fails the query.
    #[derive(Clone, Default)]
    struct Script {
        init_failures: Arc<AtomicUsize>,
        init_delay: Option<Duration>,
        inits: Arc<AtomicUsize>,
        terminations: Arc<AtomicUsize>,
        dropped: Arc<Mutex<Vec<String>>>,
        rolled_back: Arc<Mutex<Vec<String>>>,
    }

    struct MockEngine {
        script: Script,
        tables: IndexMap<String, Bytes>,
        staged: Vec<(String, Option<Bytes>)>,
    }

    impl QueryEngine for MockEngine {
        type Config = Script;

        async fn initialize(script: &Script) -> engine::Result<Self> {
            if let Some(delay) = script.init_delay {
                tokio::time::sleep(delay).await;
            }
            script.inits.fetch_add(1, Ordering::SeqCst);
            let remaining = script.init_failures.load(Ordering::SeqCst);
            if remaining > 0 {
                script.init_failures.store(remaining - 1, Ordering::SeqCst);
                return Err(EngineError::Initialization("worker failed to start".into()));
            }
            Ok(Self {
                script: script.clone(),
                tables: IndexMap::new(),
                staged: Vec::new(),
            })
        }

        async fn register_files(&mut self, files: &[SourceFile]) -> engine::Result<()> {
            for file in files {
                if file.bytes.as_ref() == b"corrupt" {
                    return Err(EngineError::Registration {
                        name: file.name.clone(),
                        reason: "not a parquet file".into(),
                    });
                }
                if file.bytes.as_ref() == b"stall" {
                    return Err(EngineError::Timeout {
                        operation: "register",
                        after: Duration::from_millis(5),
                    });
                }
                let replaced = self.tables.insert(file.name.clone(), file.bytes.clone());
                self.staged.push((file.name.clone(), replaced));
            }
            Ok(())
        }

        async fn commit(&mut self) {
            self.staged.clear();
        }

        async fn rollback(&mut self) {
            for (name, replaced) in self.staged.drain(..).rev() {
                match replaced {
                    Some(bytes) => {
                        self.tables.insert(name.clone(), bytes);
                    }
                    None => {
                        self.tables.shift_remove(&name);
                    }
                }
                self.script.rolled_back.lock().unwrap().push(name);
            }
        }

        async fn query(&self, names: &[String]) -> engine::Result<Vec<RecordBatch>> {
            let mut batches = Vec::new();
            for name in names {
                let bytes = self
                    .tables
                    .get(name)
                    .ok_or_else(|| EngineError::Query(format!("'{name}' is not registered")))?;
                let text = std::str::from_utf8(bytes).unwrap_or_default();
                let rows: usize = text
                    .parse()
                    .map_err(|_| EngineError::Query(format!("column y_pred not found in {name}")))?;
                let rows = vec![EvalRow::one_hot(vec![0.0; 4], 1, 2, 1); rows];
                batches.push(eval_batch(&rows).unwrap());
            }
            Ok(batches)
        }

        async fn drop_files(&mut self, names: &[String]) {
            for name in names {
                self.tables.shift_remove(name);
                self.script.dropped.lock().unwrap().push(name.clone());
            }
        }

        async fn terminate(&mut self) {
            self.script.terminations.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn file(name: &str, contents: &str) -> SourceFile {
        SourceFile::new(name, contents.as_bytes().to_vec())
    }

    async fn mounted(script: &Script) -> IngestionController<MockEngine> {
        let mut controller = IngestionController::<MockEngine>::new(script.clone());
        controller.mount(&CancelToken::new()).await.unwrap();
        controller
    }

    #[tokio::test]
    async fn test_mount_reaches_ready_empty_once() {
        let script = Script::default();
        let mut controller = mounted(&script).await;
        assert_eq!(controller.state(), &SessionState::ReadyEmpty);
        assert!(controller.is_ready());
        assert!(controller.show_drop_zone());

        controller.mount(&CancelToken::new()).await.unwrap();
        assert_eq!(script.inits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_init_failure_then_retry() {
        let script = Script {
            init_failures: Arc::new(AtomicUsize::new(1)),
            ..Script::default()
        };
        let mut controller = IngestionController::<MockEngine>::new(script.clone());
        let err = controller.mount(&CancelToken::new()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Initialization);
        assert_eq!(controller.error(), Some(&err));
        assert!(!controller.is_ready());

        controller.retry(&CancelToken::new()).await.unwrap();
        assert_eq!(controller.state(), &SessionState::ReadyEmpty);
        assert_eq!(script.inits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancelled_mount_terminates_late_session() {
        let script = Script {
            init_delay: Some(Duration::from_millis(20)),
            ..Script::default()
        };
        let mut controller = IngestionController::<MockEngine>::new(script.clone());
        let token = CancelToken::new();
        let remote = token.clone();
        tokio::spawn(async move { remote.cancel() });

        controller.mount(&token).await.unwrap();
        assert_eq!(controller.state(), &SessionState::Terminated);
        assert_eq!(script.terminations.load(Ordering::SeqCst), 1);
        assert!(controller.load_files(vec![file("a.parquet", "1")]).await.is_err());
        assert_eq!(controller.state(), &SessionState::Terminated);
    }

    #[tokio::test]
    async fn test_load_before_mount_is_not_ready() {
        let mut controller = IngestionController::<MockEngine>::new(Script::default());
        let err = controller
            .load_files(vec![file("a.parquet", "1")])
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotReady);
        assert_eq!(err.message, "engine not initialized");
        assert!(matches!(controller.state(), SessionState::Error(_)));
    }

    #[tokio::test]
    async fn test_two_files_concatenate() {
        let script = Script::default();
        let mut controller = mounted(&script).await;
        controller
            .load_files(vec![file("a.parquet", "1"), file("b.parquet", "1")])
            .await
            .unwrap();
        assert_eq!(controller.data().len(), 2);
        assert_eq!(controller.loaded_files(), vec!["a.parquet", "b.parquet"]);
        assert_eq!(controller.state(), &SessionState::ReadyWithData);
        assert!(!controller.show_drop_zone());
        assert_eq!(controller.summary(NoVerdictPolicy::default()).accuracy, 100.0);

        controller.load_files(vec![file("c.parquet", "3")]).await.unwrap();
        assert_eq!(controller.data().len(), 5);
        assert_eq!(controller.loaded_files().len(), 3);
    }

    #[tokio::test]
    async fn test_non_parquet_names_are_ignored() {
        let script = Script::default();
        let mut controller = mounted(&script).await;
        controller
            .load_files(vec![file("notes.txt", "1"), file("a.PARQUET", "2")])
            .await
            .unwrap();
        assert_eq!(controller.loaded_files(), vec!["a.PARQUET"]);

        let before = controller.state().clone();
        controller.load_files(vec![file("x.csv", "1")]).await.unwrap();
        assert_eq!(controller.state(), &before);
    }

    #[tokio::test]
    async fn test_duplicate_names_last_wins() {
        let script = Script::default();
        let mut controller = mounted(&script).await;
        controller
            .load_files(vec![file("a.parquet", "1"), file("a.parquet", "4")])
            .await
            .unwrap();
        assert_eq!(controller.data().len(), 4);

        controller.load_files(vec![file("a.parquet", "2")]).await.unwrap();
        assert_eq!(controller.data().len(), 2);
        assert_eq!(controller.loaded_files(), vec!["a.parquet"]);
    }

    #[tokio::test]
    async fn test_failed_load_keeps_previous_data() {
        let script = Script::default();
        let mut controller = mounted(&script).await;
        controller.load_files(vec![file("a.parquet", "2")]).await.unwrap();

        let err = controller
            .load_files(vec![file("b.parquet", "corrupt")])
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Registration);
        assert_eq!(controller.data().len(), 2);
        assert_eq!(controller.loaded_files(), vec!["a.parquet"]);

        let err = controller
            .load_files(vec![file("c.parquet", "no-columns")])
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Query);
        assert_eq!(controller.data().len(), 2);
        assert_eq!(controller.loaded_files(), vec!["a.parquet"]);
        assert_eq!(*script.rolled_back.lock().unwrap(), vec!["c.parquet".to_string()]);

        controller.retry(&CancelToken::new()).await.unwrap();
        assert_eq!(controller.state(), &SessionState::ReadyWithData);
        assert_eq!(script.inits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_load_restores_replaced_file() {
        let script = Script::default();
        let mut controller = mounted(&script).await;
        controller.load_files(vec![file("a.parquet", "1")]).await.unwrap();

        let err = controller
            .load_files(vec![file("a.parquet", "3"), file("b.parquet", "no-columns")])
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Query);
        assert_eq!(controller.data().len(), 1);
        assert_eq!(controller.loaded_files(), vec!["a.parquet"]);

        controller.retry(&CancelToken::new()).await.unwrap();
        controller.load_files(vec![file("c.parquet", "2")]).await.unwrap();
        assert_eq!(controller.data().len(), 3);
        assert_eq!(controller.loaded_files(), vec!["a.parquet", "c.parquet"]);
    }

    #[tokio::test]
    async fn test_timeout_keeps_previous_data() {
        let script = Script::default();
        let mut controller = mounted(&script).await;
        controller.load_files(vec![file("a.parquet", "2")]).await.unwrap();

        let err = controller
            .load_files(vec![file("b.parquet", "stall")])
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
        assert_eq!(controller.error(), Some(&err));
        assert_eq!(controller.data().len(), 2);
        assert_eq!(controller.loaded_files(), vec!["a.parquet"]);

        controller.retry(&CancelToken::new()).await.unwrap();
        assert_eq!(controller.state(), &SessionState::ReadyWithData);
    }

    #[tokio::test]
    async fn test_clear_then_reload_same_name() {
        let script = Script::default();
        let mut controller = mounted(&script).await;
        controller.load_files(vec![file("a.parquet", "3")]).await.unwrap();

        controller.clear().await;
        assert!(controller.data().is_empty());
        assert!(controller.loaded_files().is_empty());
        assert_eq!(controller.state(), &SessionState::ReadyEmpty);
        assert_eq!(*script.dropped.lock().unwrap(), vec!["a.parquet".to_string()]);

        controller.load_files(vec![file("a.parquet", "1")]).await.unwrap();
        assert_eq!(controller.data().len(), 1);
    }

    #[tokio::test]
    async fn test_unmount_terminates_exactly_once() {
        let script = Script::default();
        let mut controller = mounted(&script).await;
        let mut states = controller.subscribe();
        controller.load_files(vec![file("a.parquet", "1")]).await.unwrap();

        controller.unmount().await;
        controller.unmount().await;
        assert_eq!(script.terminations.load(Ordering::SeqCst), 1);
        assert_eq!(controller.state(), &SessionState::Terminated);
        assert!(controller.data().is_empty());
        assert_eq!(*states.borrow_and_update(), SessionState::Terminated);

        controller.clear().await;
        assert_eq!(controller.state(), &SessionState::Terminated);
        assert!(controller.mount(&CancelToken::new()).await.is_err());
    }

    #[test]
    fn test_engine_errors_map_to_kinds() {
        let timeout = EngineError::Timeout {
            operation: "query",
            after: Duration::from_secs(1),
        };
        assert_eq!(ControllerError::from(timeout).kind, ErrorKind::Timeout);
        assert_eq!(
            ControllerError::from(EngineError::Query("bad".into())).kind,
            ErrorKind::Query
        );
        assert_eq!(
            ControllerError::from(EngineError::Terminated).kind,
            ErrorKind::NotReady
        );
    }
}
