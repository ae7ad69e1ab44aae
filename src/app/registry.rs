use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::app::hint_store::{HintStore, LocalFsHintStore, ResumeHint};
use crate::app::model::{Job, JobProgress, JobRequest, JobStatus};
use crate::app::queue::InProcessQueue;
use crate::app::resume::{ResumableBook, ResumeScanner};
use crate::book::ChapterStatus;
use crate::config::AppConfig;
use crate::events::{EventBus, PipelineEvent, SubscriptionId, event_type};
use crate::fetch::{FetchTransport, Fetcher};
use crate::pipeline::{
    ChapterUpdate, PipelineRun, RunObserver, RunOutcome, RunRequest, RunStatsSnapshot, RunSummary,
};
use crate::progress::{ProgressStore, is_valid_book_id};
use crate::translate::{TranslateBackend, Translator};

/// Extra time granted on top of the run's own grace period before a cancel gives up waiting.
const CANCEL_MARGIN: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("job not found: {0}")]
    NotFound(String),
    #[error("job {job_id} is {status}, not pending")]
    NotPending { job_id: String, status: JobStatus },
    #[error("book {0} already has a running job")]
    BookBusy(String),
}

struct JobEntry {
    seq: u64,
    job: Job,
    cancel: CancellationToken,
    status_tx: Arc<watch::Sender<JobStatus>>,
}

struct Inner {
    config: AppConfig,
    store: ProgressStore,
    hints: Arc<dyn HintStore>,
    bus: Arc<EventBus>,
    queue: InProcessQueue,
    transport: Arc<dyn FetchTransport>,
    backend: Arc<dyn TranslateBackend>,
    jobs: Mutex<HashMap<String, JobEntry>>,
    next_seq: AtomicU64,
}

/// Runs pipeline jobs in the background and tracks their lifecycle.
#[derive(Clone)]
pub struct JobRegistry {
    inner: Arc<Inner>,
}

impl JobRegistry {
    pub fn new(
        config: &AppConfig,
        transport: Arc<dyn FetchTransport>,
        backend: Arc<dyn TranslateBackend>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self::with_hint_store(
            config,
            transport,
            backend,
            bus,
            Arc::new(LocalFsHintStore::new(&config.books_dir)),
        )
    }

    pub fn with_hint_store(
        config: &AppConfig,
        transport: Arc<dyn FetchTransport>,
        backend: Arc<dyn TranslateBackend>,
        bus: Arc<EventBus>,
        hints: Arc<dyn HintStore>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config: config.clone(),
                store: ProgressStore::new(&config.books_dir),
                hints,
                bus,
                queue: InProcessQueue::new(config.pipeline.max_concurrent_jobs),
                transport,
                backend,
                jobs: Mutex::new(HashMap::new()),
                next_seq: AtomicU64::new(0),
            }),
        }
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.inner.bus
    }

    pub fn create_job(&self, request: JobRequest) -> Job {
        let job_id = uuid::Uuid::new_v4().simple().to_string();
        let job = Job::new(&job_id, request);
        let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
        let (status_tx, _) = watch::channel(JobStatus::Pending);
        self.inner.lock_jobs().insert(
            job_id.clone(),
            JobEntry {
                seq,
                job: job.clone(),
                cancel: CancellationToken::new(),
                status_tx: Arc::new(status_tx),
            },
        );
        tracing::info!(job_id = %job_id, book = %job.book_id, "job created");
        job
    }

    /// Flips a pending job to running and spawns its pipeline run.
    pub async fn start_job(&self, job_id: &str) -> Result<Job, RegistryError> {
        let (job, cancel) = {
            let mut jobs = self.inner.lock_jobs();
            let (status, book_id) = match jobs.get(job_id) {
                Some(entry) => (entry.job.status, entry.job.book_id.clone()),
                None => return Err(RegistryError::NotFound(job_id.to_owned())),
            };
            if status != JobStatus::Pending {
                return Err(RegistryError::NotPending {
                    job_id: job_id.to_owned(),
                    status,
                });
            }
            let busy = jobs
                .values()
                .any(|e| e.job.book_id == book_id && e.job.status == JobStatus::Running);
            if busy {
                return Err(RegistryError::BookBusy(book_id));
            }
            let Some(entry) = jobs.get_mut(job_id) else {
                return Err(RegistryError::NotFound(job_id.to_owned()));
            };
            entry.job.status = JobStatus::Running;
            entry.job.started_at = Some(Utc::now());
            entry.status_tx.send_replace(JobStatus::Running);
            (entry.job.clone(), entry.cancel.clone())
        };

        tracing::info!(job_id, book = %job.book_id, stage = job.request.stage.as_str(), "job started");
        self.inner.emit(
            event_type::JOB_STARTED,
            job_id,
            serde_json::json!({ "book_id": job.book_id, "request": job.request }),
        );

        // Unknown books fail in the run; no hint is left behind for them.
        if is_valid_book_id(&job.book_id)
            && self
                .inner
                .store
                .has_book(&self.inner.store.book_dir(&job.book_id))
                .await
            && let Err(err) = self
                .inner
                .hints
                .put(&job.book_id, &ResumeHint::from_request(&job.request))
                .await
        {
            tracing::warn!(job_id, err = %format!("{err:#}"), "failed to write resume hint");
        }

        let inner = Arc::clone(&self.inner);
        let id = job_id.to_owned();
        let request = job.request.clone();
        self.inner.queue.spawn(cancel.clone(), async move {
            inner.run_job(id, request, cancel).await
        });

        Ok(job)
    }

    /// Requests cancellation and waits (bounded) for the run to acknowledge it.
    pub async fn cancel_job(&self, job_id: &str) -> Result<Job, RegistryError> {
        let (status, cancel, mut status_rx) = {
            let jobs = self.inner.lock_jobs();
            let entry = jobs
                .get(job_id)
                .ok_or_else(|| RegistryError::NotFound(job_id.to_owned()))?;
            (
                entry.job.status,
                entry.cancel.clone(),
                entry.status_tx.subscribe(),
            )
        };

        match status {
            JobStatus::Pending => {
                cancel.cancel();
                if self.inner.settle(job_id, Settled::cancelled(None)) {
                    tracing::info!(job_id, "pending job cancelled");
                }
            }
            JobStatus::Running => {
                tracing::info!(job_id, "cancelling job");
                cancel.cancel();
                let wait = self.inner.config.pipeline.grace_period() + CANCEL_MARGIN;
                let acknowledged = matches!(
                    tokio::time::timeout(wait, status_rx.wait_for(|s| s.is_terminal())).await,
                    Ok(Ok(_))
                );
                if !acknowledged {
                    tracing::warn!(job_id, "run did not acknowledge cancellation in time");
                    self.inner.settle(
                        job_id,
                        Settled {
                            error: Some("cancellation timed out".to_owned()),
                            ..Settled::cancelled(None)
                        },
                    );
                }
            }
            _ => {}
        }
        self.get_job(job_id)
            .ok_or_else(|| RegistryError::NotFound(job_id.to_owned()))
    }

    /// Resolves once the job reaches a terminal status.
    pub async fn wait_job(&self, job_id: &str) -> Result<Job, RegistryError> {
        let mut status_rx = {
            let jobs = self.inner.lock_jobs();
            let entry = jobs
                .get(job_id)
                .ok_or_else(|| RegistryError::NotFound(job_id.to_owned()))?;
            entry.status_tx.subscribe()
        };
        let _ = status_rx.wait_for(|s| s.is_terminal()).await;
        self.get_job(job_id)
            .ok_or_else(|| RegistryError::NotFound(job_id.to_owned()))
    }

    pub fn get_job(&self, job_id: &str) -> Option<Job> {
        self.inner.lock_jobs().get(job_id).map(|e| e.job.clone())
    }

    /// Newest first.
    pub fn list_jobs(&self) -> Vec<Job> {
        let jobs = self.inner.lock_jobs();
        let mut entries: Vec<&JobEntry> = jobs.values().collect();
        entries.sort_by(|a, b| b.seq.cmp(&a.seq));
        entries.into_iter().map(|e| e.job.clone()).collect()
    }

    pub fn subscribe<F>(&self, job_id: &str, callback: F) -> SubscriptionId
    where
        F: Fn(&PipelineEvent) + Send + Sync + 'static,
    {
        self.inner.bus.subscribe_job(job_id, callback)
    }

    pub fn subscribe_channel(&self, job_id: &str) -> mpsc::UnboundedReceiver<PipelineEvent> {
        self.inner.bus.subscribe_channel(job_id)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.bus.unsubscribe(id)
    }

    pub async fn resumable_books(&self) -> anyhow::Result<Vec<ResumableBook>> {
        ResumeScanner::with_hint_store(&self.inner.config, Arc::clone(&self.inner.hints))
            .scan()
            .await
    }
}

impl Inner {
    fn lock_jobs(&self) -> MutexGuard<'_, HashMap<String, JobEntry>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, kind: &str, job_id: &str, payload: serde_json::Value) {
        self.bus
            .emit(PipelineEvent::new(kind, job_id).with_payload(payload));
    }

    async fn run_job(self: Arc<Self>, job_id: String, request: JobRequest, cancel: CancellationToken) {
        if cancel.is_cancelled() {
            tracing::info!(job_id = %job_id, "job cancelled while queued");
            self.settle(&job_id, Settled::cancelled(Some(RunSummary::default())));
            return;
        }
        if !is_valid_book_id(&request.book_id) {
            let message = format!("invalid book id: {:?}", request.book_id);
            tracing::warn!(job_id = %job_id, "{message}");
            self.settle(&job_id, Settled::failed(message));
            return;
        }

        let observer = Arc::new(JobObserver {
            job_id: job_id.clone(),
            inner: Arc::clone(&self),
        });
        let run = PipelineRun::new(
            &self.config,
            Fetcher::new(Arc::clone(&self.transport), &self.config.crawler),
            Translator::new(Arc::clone(&self.backend), &self.config.translation),
            observer,
            cancel,
        );
        let run_request = RunRequest {
            book_dir: self.store.book_dir(&request.book_id),
            stage: request.stage,
            chapters: request.chapters.clone(),
            workers: request.workers,
            force: request.force,
            style: request.style.clone(),
            glossary: request.glossary,
        };

        match run.run(run_request).await {
            Ok(RunOutcome::Completed(summary)) => {
                tracing::info!(
                    job_id = %job_id,
                    translated = summary.translated,
                    errors = summary.errors,
                    "job completed"
                );
                self.settle(
                    &job_id,
                    Settled {
                        status: JobStatus::Completed,
                        summary: Some(summary),
                        error: None,
                    },
                );
            }
            Ok(RunOutcome::Cancelled(summary)) => {
                tracing::info!(job_id = %job_id, "job cancelled");
                self.settle(&job_id, Settled::cancelled(Some(summary)));
            }
            Err(err) => {
                let message = format!("{err:#}");
                tracing::error!(job_id = %job_id, err = %message, "job failed");
                self.settle(&job_id, Settled::failed(message));
            }
        }
    }

    /// Moves a job into a terminal status, emits the matching event, then wakes
    /// waiters. Returns `false` (and does nothing) if the job already finished.
    fn settle(&self, job_id: &str, settled: Settled) -> bool {
        let status_tx = {
            let mut jobs = self.lock_jobs();
            let Some(entry) = jobs.get_mut(job_id) else {
                return false;
            };
            if entry.job.status.is_terminal() {
                return false;
            }
            entry.job.status = settled.status;
            entry.job.finished_at = Some(Utc::now());
            if settled.summary.is_some() {
                entry.job.summary = settled.summary.clone();
            }
            if settled.error.is_some() {
                entry.job.error = settled.error.clone();
            }
            Arc::clone(&entry.status_tx)
        };

        let (kind, payload) = match settled.status {
            JobStatus::Completed => (
                event_type::JOB_COMPLETED,
                serde_json::to_value(&settled.summary).unwrap_or_default(),
            ),
            JobStatus::Failed => (
                event_type::JOB_FAILED,
                serde_json::json!({ "error": settled.error }),
            ),
            _ => (
                event_type::JOB_CANCELLED,
                serde_json::to_value(&settled.summary).unwrap_or_default(),
            ),
        };
        self.emit(kind, job_id, payload);
        status_tx.send_replace(settled.status);
        true
    }

    fn record_progress(&self, job_id: &str, snapshot: &RunStatsSnapshot) {
        if let Some(entry) = self.lock_jobs().get_mut(job_id) {
            entry.job.progress = Some(JobProgress::from_snapshot(snapshot));
        }
    }
}

struct Settled {
    status: JobStatus,
    summary: Option<RunSummary>,
    error: Option<String>,
}

impl Settled {
    fn cancelled(summary: Option<RunSummary>) -> Self {
        Self {
            status: JobStatus::Cancelled,
            summary,
            error: None,
        }
    }

    fn failed(message: String) -> Self {
        Self {
            status: JobStatus::Failed,
            summary: None,
            error: Some(message),
        }
    }
}

/// Bridges one run's callbacks onto the event bus and the job record.
struct JobObserver {
    job_id: String,
    inner: Arc<Inner>,
}

impl RunObserver for JobObserver {
    fn on_chapter(&self, update: &ChapterUpdate) {
        let kind = match update.status {
            ChapterStatus::Crawled => event_type::CHAPTER_CRAWLED,
            ChapterStatus::Translated => event_type::CHAPTER_TRANSLATED,
            _ => event_type::CHAPTER_ERROR,
        };
        let payload = serde_json::to_value(update).unwrap_or_default();
        self.inner.emit(kind, &self.job_id, payload);
    }

    fn on_progress(&self, snapshot: &RunStatsSnapshot) {
        self.inner.record_progress(&self.job_id, snapshot);
        let payload = serde_json::to_value(snapshot).unwrap_or_default();
        self.inner.emit(event_type::PROGRESS, &self.job_id, payload);
    }
}
