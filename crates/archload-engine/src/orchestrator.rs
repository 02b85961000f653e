//! Pipeline orchestrator: plans dataset runs, drives each through extract,
//! gate, read, project, and load, and records run history.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use archload_state::{RunLedger, StateError};
use archload_types::dataset::{DatasetDefinition, DatasetId};
use archload_types::state::{RunState, RunStats};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;

use crate::config::types::{PipelineConfig, SchemaPolicy};
use crate::errors::{compute_backoff, IngestError, PipelineError, Stage, Violation};
use crate::extract::{list_entries, SharedExtraction};
use crate::gate::await_completion;
use crate::loader::Loader;
use crate::plan::execution_order;
use crate::project::ProjectedRows;
use crate::readers;
use crate::registry;
use crate::resolve::{check_backends, create_run_ledger, create_store};
use crate::result::{CycleReport, DatasetOutcome, LoadSummary};
use crate::store::DestinationStore;

/// Runtime settings derived from the pipeline file.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub archive: PathBuf,
    pub extract_dir: PathBuf,
    pub table: String,
    pub schema_policy: SchemaPolicy,
    pub concurrency: usize,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub gate_timeout: Duration,
    pub gate_poll_interval: Duration,
}

impl PipelineSettings {
    #[must_use]
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            archive: config.archive.path.clone(),
            extract_dir: config.archive.extract_dir.clone(),
            table: config.destination.table.clone(),
            schema_policy: config.destination.schema_policy,
            concurrency: usize::try_from(config.resources.concurrency).unwrap_or(1).max(1),
            max_retries: config.resources.max_retries,
            retry_delay: config.resources.retry_delay(),
            gate_timeout: config.dependencies.timeout(),
            gate_poll_interval: config.dependencies.poll_interval(),
        }
    }
}

struct Inner {
    definitions: Vec<DatasetDefinition>,
    order: Vec<usize>,
    settings: PipelineSettings,
    store: Arc<dyn DestinationStore>,
    ledger: Arc<dyn RunLedger>,
    /// Serializes extraction into `settings.extract_dir` across cycles and
    /// single-dataset triggers.
    extraction_lock: Arc<Mutex<()>>,
}

/// A validated, planned set of dataset pipelines bound to a store and ledger.
///
/// Cheap to clone.
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<Inner>,
}

impl Pipeline {
    /// Plan `definitions`, rejecting dependency cycles before any I/O.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::DependencyCycle`] if the dependency graph has a
    /// cycle, or a configuration error if a dependency is unknown.
    pub fn new(
        definitions: Vec<DatasetDefinition>,
        settings: PipelineSettings,
        store: Arc<dyn DestinationStore>,
        ledger: Arc<dyn RunLedger>,
    ) -> Result<Self, IngestError> {
        let order = execution_order(&definitions)?;
        Ok(Self {
            inner: Arc::new(Inner {
                definitions,
                order,
                settings,
                store,
                ledger,
                extraction_lock: Arc::new(Mutex::new(())),
            }),
        })
    }

    /// Validate `config`, open its store and ledger, and plan the datasets.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, the dependency graph
    /// has a cycle, or a backend cannot be opened.
    pub async fn from_config(config: PipelineConfig) -> Result<Self> {
        let definitions = registry::load_pipeline(&config)?;
        let settings = PipelineSettings::from_config(&config);
        // Plan before touching any backend.
        execution_order(&definitions)?;

        let (store, ledger) = tokio::task::spawn_blocking(move || -> Result<_> {
            Ok((create_store(&config)?, create_run_ledger(&config)?))
        })
        .await
        .context("backend setup task failed")??;

        Ok(Self::new(definitions, settings, store, ledger)?)
    }

    #[must_use]
    pub fn definitions(&self) -> &[DatasetDefinition] {
        &self.inner.definitions
    }

    #[must_use]
    pub fn settings(&self) -> &PipelineSettings {
        &self.inner.settings
    }

    #[must_use]
    pub fn ledger(&self) -> Arc<dyn RunLedger> {
        Arc::clone(&self.inner.ledger)
    }

    /// Run every dataset once.
    ///
    /// Each dataset gets a `pending` run up front, so dependents gate on this
    /// cycle's run of their dependency. Worker permits are taken in
    /// dependency order; a dataset waiting on its dependency gives its
    /// permit back until the gate opens. Dataset failures are reported in
    /// the returned outcomes, not as an `Err`.
    ///
    /// Dropping the returned future aborts the dataset tasks; a load already
    /// on the blocking pool still commits or rolls back as a whole.
    ///
    /// # Errors
    ///
    /// Returns an error only if the runs cannot be recorded in the ledger.
    pub async fn run_cycle(&self) -> Result<CycleReport, IngestError> {
        let started = Instant::now();
        let inner = &self.inner;
        let ids: Vec<DatasetId> = inner.definitions.iter().map(|d| d.id.clone()).collect();
        let run_ids = ledger_call(&inner.ledger, move |ledger| {
            ids.iter()
                .map(|id| ledger.start_run(id))
                .collect::<Result<Vec<_>, _>>()
        })
        .await?;

        tracing::info!(
            datasets = run_ids.len(),
            concurrency = inner.settings.concurrency,
            archive = %inner.settings.archive.display(),
            "Starting ingestion cycle"
        );

        let extraction = Arc::new(inner.extraction());
        let semaphore = Arc::new(Semaphore::new(inner.settings.concurrency));
        let mut tasks = JoinSet::new();

        for &idx in &inner.order {
            let permit = Arc::clone(&semaphore)
                .acquire_owned()
                .await
                .map_err(|e| IngestError::Internal(format!("worker pool closed: {e}")))?;
            let inner = Arc::clone(&self.inner);
            let extraction = Arc::clone(&extraction);
            let run_id = run_ids[idx];
            let mut slot = WorkerSlot::held(Arc::clone(&semaphore), permit);
            tasks.spawn(async move {
                let outcome = run_dataset_task(&inner, idx, run_id, &extraction, &mut slot).await;
                drop(slot);
                (idx, outcome)
            });
        }

        let mut slots: Vec<Option<DatasetOutcome>> = inner.definitions.iter().map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((idx, outcome)) => slots[idx] = Some(outcome),
                Err(e) => tracing::error!(error = %e, "Dataset task aborted"),
            }
        }

        let mut outcomes = Vec::with_capacity(slots.len());
        for (idx, slot) in slots.into_iter().enumerate() {
            let outcome = match slot {
                Some(outcome) => outcome,
                None => abandoned(inner, idx, run_ids[idx]).await,
            };
            outcomes.push(outcome);
        }

        let report = CycleReport {
            outcomes,
            duration_secs: started.elapsed().as_secs_f64(),
        };
        tracing::info!(
            succeeded = report.succeeded(),
            failed = report.failed(),
            rows_written = report.rows_written(),
            duration_secs = report.duration_secs,
            "Ingestion cycle finished"
        );
        Ok(report)
    }

    /// Run one dataset on its own, e.g. from an external trigger.
    ///
    /// A declared dependency gates on that dependency's most recent run.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an unknown dataset, or a ledger
    /// error if the run cannot be recorded.
    pub async fn run_dataset(&self, id: &DatasetId) -> Result<DatasetOutcome, IngestError> {
        let inner = &self.inner;
        let Some(idx) = inner.definitions.iter().position(|d| &d.id == id) else {
            return Err(crate::errors::ConfigurationError {
                violations: vec![Violation::setting(
                    "dataset",
                    format!("unknown dataset '{id}'"),
                )],
            }
            .into());
        };

        let dataset = id.clone();
        let run_id = ledger_call(&inner.ledger, move |ledger| ledger.start_run(&dataset)).await?;
        let extraction = inner.extraction();
        let mut slot = WorkerSlot::unbounded();
        Ok(run_dataset_task(inner, idx, run_id, &extraction, &mut slot).await)
    }
}

impl Inner {
    fn extraction(&self) -> SharedExtraction {
        SharedExtraction::with_lock(
            self.settings.archive.clone(),
            self.settings.extract_dir.clone(),
            Arc::clone(&self.extraction_lock),
        )
    }
}

/// A dataset task's claim on the worker pool.
///
/// The permit is given back while the task waits on its dependency gate and
/// taken again before reading and loading.
struct WorkerSlot {
    semaphore: Arc<Semaphore>,
    permit: Option<OwnedSemaphorePermit>,
}

impl WorkerSlot {
    fn held(semaphore: Arc<Semaphore>, permit: OwnedSemaphorePermit) -> Self {
        Self {
            semaphore,
            permit: Some(permit),
        }
    }

    /// A slot outside any cycle's pool.
    fn unbounded() -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(1)),
            permit: None,
        }
    }

    fn release(&mut self) {
        self.permit = None;
    }

    async fn acquire(&mut self) -> Result<(), IngestError> {
        if self.permit.is_none() {
            let permit = Arc::clone(&self.semaphore)
                .acquire_owned()
                .await
                .map_err(|e| IngestError::Internal(format!("worker pool closed: {e}")))?;
            self.permit = Some(permit);
        }
        Ok(())
    }
}

/// Failure detail of one attempt, with the rows pulled before it failed.
struct AttemptFailure {
    error: PipelineError,
    rows_read: u64,
}

async fn run_dataset_task(
    inner: &Arc<Inner>,
    idx: usize,
    run_id: i64,
    extraction: &SharedExtraction,
    slot: &mut WorkerSlot,
) -> DatasetOutcome {
    let def = &inner.definitions[idx];
    let started = Instant::now();

    if let Err(e) =
        ledger_call(&inner.ledger, move |ledger| ledger.set_run_state(run_id, RunState::Running))
            .await
    {
        tracing::warn!(dataset = %def.id, run_id, error = %e, "Failed to mark run as running");
    }

    let max_retries = inner.settings.max_retries;
    let mut attempt = 0u32;
    let result = loop {
        attempt += 1;
        match execute_once(inner, def, extraction, slot).await {
            Ok((rows_read, rows_written)) => {
                break Ok(LoadSummary {
                    rows_read,
                    rows_written,
                    duration_secs: started.elapsed().as_secs_f64(),
                    attempts: attempt,
                });
            }
            Err(failure) if failure.error.is_retryable() && attempt <= max_retries => {
                let delay = compute_backoff(inner.settings.retry_delay, attempt);
                #[allow(clippy::cast_possible_truncation)]
                let delay_ms = delay.as_millis() as u64;
                tracing::warn!(
                    dataset = %def.id,
                    attempt,
                    max_retries,
                    delay_ms,
                    stage = %failure.error.stage,
                    error = %failure.error.source,
                    "Retryable error, will retry"
                );
                tokio::time::sleep(delay).await;
            }
            Err(failure) => {
                if failure.error.is_retryable() {
                    tracing::error!(
                        dataset = %def.id,
                        attempt,
                        max_retries,
                        stage = %failure.error.stage,
                        error = %failure.error.source,
                        "Max retries exhausted, failing dataset"
                    );
                } else {
                    tracing::error!(
                        dataset = %def.id,
                        stage = %failure.error.stage,
                        error = %failure.error.source,
                        "Dataset failed"
                    );
                }
                break Err(failure);
            }
        }
    };

    let (state, stats) = match &result {
        Ok(summary) => {
            tracing::info!(
                dataset = %def.id,
                rows_read = summary.rows_read,
                rows_written = summary.rows_written,
                attempts = summary.attempts,
                duration_secs = summary.duration_secs,
                "Dataset loaded"
            );
            (
                RunState::Success,
                RunStats {
                    rows_read: summary.rows_read,
                    rows_written: summary.rows_written,
                    error_message: None,
                },
            )
        }
        Err(failure) => (
            RunState::Failed,
            RunStats {
                rows_read: failure.rows_read,
                rows_written: 0,
                error_message: Some(failure.error.to_string()),
            },
        ),
    };
    complete(inner, &def.id, run_id, state, stats).await;

    DatasetOutcome {
        dataset: def.id.clone(),
        run_id,
        result: result.map_err(|failure| failure.error),
    }
}

/// One attempt: extract, gate, then read, project, and load on the blocking
/// pool. Returns `(rows_read, rows_written)`.
async fn execute_once(
    inner: &Arc<Inner>,
    def: &DatasetDefinition,
    extraction: &SharedExtraction,
    slot: &mut WorkerSlot,
) -> Result<(u64, u64), AttemptFailure> {
    let fail = |stage: Stage, error: IngestError| AttemptFailure {
        error: PipelineError::at(stage, def.id.clone(), error),
        rows_read: 0,
    };

    extraction
        .ensure()
        .await
        .map_err(|e| fail(Stage::Extract, e))?;

    if let Some(dependency) = &def.depends_on {
        tracing::debug!(dataset = %def.id, dependency = %dependency, "Checking dependency");
        slot.release();
        await_completion(
            Arc::clone(&inner.ledger),
            dependency,
            inner.settings.gate_timeout,
            inner.settings.gate_poll_interval,
        )
        .await
        .map_err(|e| fail(Stage::Gate, e))?;
    }
    slot.acquire().await.map_err(|e| fail(Stage::Load, e))?;

    let task_inner = Arc::clone(inner);
    let task_def = def.clone();
    let path = extraction.destination().join(&def.file_name);
    tokio::task::spawn_blocking(move || load_dataset(&task_inner, &task_def, &path))
        .await
        .map_err(|e| {
            fail(
                Stage::Load,
                IngestError::Internal(format!("load task failed: {e}")),
            )
        })?
}

fn load_dataset(
    inner: &Inner,
    def: &DatasetDefinition,
    path: &std::path::Path,
) -> Result<(u64, u64), AttemptFailure> {
    let rows = readers::read(path, def.format).map_err(|e| AttemptFailure {
        error: PipelineError::new(def.id.clone(), e),
        rows_read: 0,
    })?;
    let mut projected = ProjectedRows::new(rows, def.columns.clone());
    let loader = Loader::new(
        inner.store.as_ref(),
        &inner.settings.table,
        inner.settings.schema_policy,
    );

    let result = loader.load(&def.columns, &mut projected);
    let rows_read = projected.rows_read();
    match result {
        Ok(written) => Ok((rows_read, written)),
        Err(e) => Err(AttemptFailure {
            error: PipelineError::new(def.id.clone(), e),
            rows_read,
        }),
    }
}

/// Outcome for a dataset whose task ended without reporting (panic).
async fn abandoned(inner: &Arc<Inner>, idx: usize, run_id: i64) -> DatasetOutcome {
    let id = inner.definitions[idx].id.clone();
    let error = PipelineError::at(
        Stage::Load,
        id.clone(),
        IngestError::Internal("dataset task ended unexpectedly".to_string()),
    );
    let stats = RunStats {
        error_message: Some(error.to_string()),
        ..RunStats::default()
    };
    complete(inner, &id, run_id, RunState::Failed, stats).await;
    DatasetOutcome {
        dataset: id,
        run_id,
        result: Err(error),
    }
}

async fn complete(inner: &Arc<Inner>, id: &DatasetId, run_id: i64, state: RunState, stats: RunStats) {
    let result =
        ledger_call(&inner.ledger, move |ledger| ledger.complete_run(run_id, state, &stats)).await;
    if let Err(e) = result {
        tracing::error!(
            dataset = %id,
            run_id,
            state = %state,
            error = %e,
            "Failed to record run completion"
        );
    }
}

/// Run a ledger call on the blocking pool.
async fn ledger_call<T, F>(ledger: &Arc<dyn RunLedger>, f: F) -> Result<T, IngestError>
where
    T: Send + 'static,
    F: FnOnce(&dyn RunLedger) -> Result<T, StateError> + Send + 'static,
{
    let ledger = Arc::clone(ledger);
    tokio::task::spawn_blocking(move || f(ledger.as_ref()))
        .await
        .map_err(|e| IngestError::Internal(format!("ledger task failed: {e}")))?
        .map_err(IngestError::from)
}

/// Open the run ledger named by `config`, for history queries.
///
/// # Errors
///
/// Returns an error if the ledger cannot be opened.
pub async fn open_run_ledger(config: &PipelineConfig) -> Result<Arc<dyn RunLedger>> {
    let config = config.clone();
    tokio::task::spawn_blocking(move || create_run_ledger(&config))
        .await
        .context("run ledger task failed")?
}

/// Result of a pipeline check.
#[derive(Debug)]
pub struct CheckResult {
    pub definitions: Vec<DatasetDefinition>,
    /// Admission order, by dataset.
    pub order: Vec<DatasetId>,
    pub archive_entries: usize,
    /// Datasets whose source file is not in the archive.
    pub missing_files: Vec<(DatasetId, String)>,
    pub backends_ok: bool,
}

/// Validate a pipeline without loading anything: configuration, dependency
/// plan, archive contents, and backend reachability.
///
/// # Errors
///
/// Returns an error if the configuration is invalid, the dependency graph
/// has a cycle, or the archive cannot be read.
pub async fn check_pipeline(config: &PipelineConfig) -> Result<CheckResult> {
    let definitions = registry::load_pipeline(config)?;
    let order = execution_order(&definitions)?
        .into_iter()
        .map(|i| definitions[i].id.clone())
        .collect();
    tracing::info!(datasets = definitions.len(), "Configuration valid");

    let archive = config.archive.path.clone();
    let entries = tokio::task::spawn_blocking(move || list_entries(&archive))
        .await
        .context("archive listing task failed")??;
    let present: HashSet<&str> = entries.iter().map(String::as_str).collect();
    let missing_files = definitions
        .iter()
        .filter(|d| !present.contains(d.file_name.as_str()))
        .map(|d| (d.id.clone(), d.file_name.clone()))
        .collect();

    let backend_config = config.clone();
    let backends_ok = match tokio::task::spawn_blocking(move || check_backends(&backend_config))
        .await
        .context("backend check task failed")?
    {
        Ok(()) => true,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "Backend check failed");
            false
        }
    };

    Ok(CheckResult {
        definitions,
        order,
        archive_entries: entries.len(),
        missing_files,
        backends_ok,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use archload_state::SqliteRunLedger;
    use archload_types::dataset::SourceFormat;

    use crate::store::SqliteStore;

    fn def(id: &str, depends_on: Option<&str>) -> DatasetDefinition {
        DatasetDefinition {
            id: DatasetId::new(id),
            file_name: format!("{id}.csv"),
            columns: vec!["x".into()],
            format: SourceFormat::Csv,
            depends_on: depends_on.map(DatasetId::new),
        }
    }

    fn settings(dir: &std::path::Path) -> PipelineSettings {
        PipelineSettings {
            archive: dir.join("missing.zip"),
            extract_dir: dir.join("out"),
            table: "unified_rows".into(),
            schema_policy: SchemaPolicy::Exact,
            concurrency: 2,
            max_retries: 0,
            retry_delay: Duration::ZERO,
            gate_timeout: Duration::from_millis(50),
            gate_poll_interval: Duration::from_millis(10),
        }
    }

    fn backends() -> (Arc<dyn DestinationStore>, Arc<dyn RunLedger>) {
        (
            Arc::new(SqliteStore::in_memory().unwrap()),
            Arc::new(SqliteRunLedger::in_memory().unwrap()),
        )
    }

    #[test]
    fn cycle_rejected_at_construction() {
        let dir = tempfile::tempdir().unwrap();
        let (store, ledger) = backends();
        let err = Pipeline::new(
            vec![def("a", Some("b")), def("b", Some("a"))],
            settings(dir.path()),
            store,
            ledger,
        )
        .err()
        .unwrap();
        assert!(matches!(err, IngestError::DependencyCycle { .. }));
        assert!(!dir.path().join("out").exists());
    }

    #[tokio::test]
    async fn missing_archive_fails_every_dataset_and_records_it() {
        let dir = tempfile::tempdir().unwrap();
        let (store, ledger) = backends();
        let pipeline = Pipeline::new(
            vec![def("a", None), def("b", Some("a"))],
            settings(dir.path()),
            store,
            Arc::clone(&ledger),
        )
        .unwrap();

        let report = pipeline.run_cycle().await.unwrap();
        assert_eq!(report.failed(), 2);
        let stages: Vec<_> = report.failures().map(|e| e.stage).collect();
        assert_eq!(stages, vec![Stage::Extract, Stage::Extract]);
        assert_eq!(
            ledger.latest_run_state(&DatasetId::new("a")).unwrap(),
            Some(RunState::Failed)
        );
    }

    #[tokio::test]
    async fn unknown_dataset_trigger_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (store, ledger) = backends();
        let pipeline =
            Pipeline::new(vec![def("a", None)], settings(dir.path()), store, ledger).unwrap();
        let err = pipeline.run_dataset(&DatasetId::new("zzz")).await.unwrap_err();
        assert!(err.to_string().contains("unknown dataset 'zzz'"));
    }

    fn write_archive(path: &std::path::Path, entries: &[(&str, &str)]) {
        use std::io::Write;
        let mut writer = zip::ZipWriter::new(std::fs::File::create(path).unwrap());
        for (name, data) in entries {
            writer
                .start_file(*name, zip::write::SimpleFileOptions::default())
                .unwrap();
            writer.write_all(data.as_bytes()).unwrap();
        }
        writer.finish().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_triggers_share_one_extraction_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings(dir.path());
        settings.archive = dir.path().join("drop.zip");
        write_archive(
            &settings.archive,
            &[("a.csv", "x\n1\n2\n"), ("b.csv", "x\n3\n")],
        );
        let (store, ledger) = backends();
        let pipeline =
            Pipeline::new(vec![def("a", None), def("b", None)], settings, store, ledger).unwrap();
        let other = pipeline.clone();

        let id_a = DatasetId::new("a");
        let id_b = DatasetId::new("b");
        let (a, b) = tokio::join!(
            pipeline.run_dataset(&id_a),
            other.run_dataset(&id_b),
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.result.as_ref().unwrap().rows_written, 2);
        assert_eq!(b.result.as_ref().unwrap().rows_written, 1);

        let mut files: Vec<_> = std::fs::read_dir(dir.path().join("out"))
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        files.sort();
        assert_eq!(files, vec!["a.csv", "b.csv"]);
    }

    #[tokio::test]
    async fn worker_slot_gives_permit_back_while_released() {
        let semaphore = Arc::new(Semaphore::new(1));
        let permit = Arc::clone(&semaphore).acquire_owned().await.unwrap();
        let mut slot = WorkerSlot::held(Arc::clone(&semaphore), permit);
        assert_eq!(semaphore.available_permits(), 0);

        slot.release();
        assert_eq!(semaphore.available_permits(), 1);

        slot.acquire().await.unwrap();
        assert_eq!(semaphore.available_permits(), 0);
        drop(slot);
        assert_eq!(semaphore.available_permits(), 1);
    }

    #[test]
    fn settings_from_config_defaults() {
        let config = crate::config::parser::parse_pipeline_str("datasets: []").unwrap();
        let settings = PipelineSettings::from_config(&config);
        assert_eq!(settings.concurrency, 4);
        assert_eq!(settings.max_retries, 1);
        assert_eq!(settings.retry_delay, Duration::from_secs(300));
        assert_eq!(settings.gate_timeout, Duration::from_secs(600));
        assert_eq!(settings.gate_poll_interval, Duration::from_secs(30));
    }
}
