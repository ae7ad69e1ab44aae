use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OnceCell};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::queue::{QueueConsumer, QueueProducer, chapter_queue};
use super::stats::{RunStats, RunStatsSnapshot};
use crate::book::{Book, ChapterStatus};
use crate::config::AppConfig;
use crate::extract;
use crate::fetch::{FetchError, Fetcher};
use crate::glossary::{Glossary, SharedGlossary};
use crate::progress::ProgressStore;
use crate::style::{DEFAULT_STYLE, StyleTemplate};
use crate::translate::{TranslateError, Translator};

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum RunStage {
    /// Fetch chapters only.
    Fetch,
    /// Translate chapters that are already fetched.
    Translate,
    /// Fetch, then translate.
    #[default]
    Full,
}

impl RunStage {
    pub fn fetches(self) -> bool {
        matches!(self, Self::Fetch | Self::Full)
    }

    pub fn translates(self) -> bool {
        matches!(self, Self::Translate | Self::Full)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fetch => "fetch",
            Self::Translate => "translate",
            Self::Full => "full",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub book_dir: PathBuf,
    pub stage: RunStage,
    /// Range spec such as `"1-10,15"`; `None` selects every chapter.
    pub chapters: Option<String>,
    pub workers: usize,
    /// Reprocess chapters regardless of their current status.
    pub force: bool,
    pub style: String,
    /// Load, use and grow the book's glossary.
    pub glossary: bool,
}

impl RunRequest {
    pub fn new(book_dir: impl Into<PathBuf>) -> Self {
        Self {
            book_dir: book_dir.into(),
            stage: RunStage::Full,
            chapters: None,
            workers: 3,
            force: false,
            style: DEFAULT_STYLE.to_owned(),
            glossary: true,
        }
    }
}

/// A persisted chapter transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChapterUpdate {
    pub index: u32,
    pub title: String,
    pub status: ChapterStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Supplied once at construction; called from the run's tasks.
pub trait RunObserver: Send + Sync {
    /// After every persisted chapter transition.
    fn on_chapter(&self, _update: &ChapterUpdate) {}

    /// Periodically while running, and once at the end.
    fn on_progress(&self, _snapshot: &RunStatsSnapshot) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl RunObserver for NoopObserver {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub total: usize,
    pub fetched: usize,
    pub translated: usize,
    pub skipped: usize,
    pub fetch_errors: usize,
    pub translate_errors: usize,
    pub errors: usize,
    pub glossary_size: usize,
    pub error_messages: Vec<String>,
    pub elapsed_ms: u64,
}

impl RunSummary {
    fn from_snapshot(snapshot: &RunStatsSnapshot, error_messages: &[String]) -> Self {
        Self {
            total: snapshot.total,
            fetched: snapshot.fetched,
            translated: snapshot.translated,
            skipped: snapshot.skipped,
            fetch_errors: snapshot.fetch_errors,
            translate_errors: snapshot.translate_errors,
            errors: snapshot.errors,
            glossary_size: snapshot.glossary_size,
            error_messages: error_messages.to_vec(),
            elapsed_ms: snapshot.elapsed_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed(RunSummary),
    Cancelled(RunSummary),
}

impl RunOutcome {
    pub fn summary(&self) -> &RunSummary {
        match self {
            Self::Completed(summary) | Self::Cancelled(summary) => summary,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
}

/// Run-level faults. Per-chapter failures never surface here.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("{0}")]
    Setup(String),
    #[error("{0:#}")]
    Io(anyhow::Error),
}

/// Drives one book toward the requested stage.
pub struct PipelineRun {
    config: AppConfig,
    store: ProgressStore,
    fetcher: Fetcher,
    translator: Translator,
    observer: Arc<dyn RunObserver>,
    cancel: CancellationToken,
}

impl PipelineRun {
    pub fn new(
        config: &AppConfig,
        fetcher: Fetcher,
        translator: Translator,
        observer: Arc<dyn RunObserver>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config: config.clone(),
            store: ProgressStore::new(&config.books_dir),
            fetcher,
            translator,
            observer,
            cancel,
        }
    }

    pub async fn run(self, request: RunRequest) -> Result<RunOutcome, RunError> {
        let started = Instant::now();
        let book_dir = request.book_dir.clone();

        if request.workers == 0 {
            return Err(RunError::Setup("workers must be at least 1".to_owned()));
        }
        let Some(book) = self.store.load(&book_dir).await else {
            return Err(RunError::Setup(format!(
                "book not found: {}",
                book_dir.display()
            )));
        };
        if book.chapters.is_empty() {
            return Err(RunError::Setup(format!(
                "book has no chapters: {}",
                book_dir.display()
            )));
        }
        let style = StyleTemplate::load(&self.config.styles_dir, &request.style)
            .map_err(|err| RunError::Setup(format!("{err:#}")))?;
        let glossary = if request.glossary {
            Glossary::load(&book_dir).await.map_err(RunError::Io)?
        } else {
            Glossary::default()
        };

        let plan = self.plan(&book, &request).await?;
        let total = book.chapters.len();
        let to_fetch = plan.iter().filter(|p| p.fetch).count();
        let to_translate = plan.iter().filter(|p| p.translate).count();
        let skipped = total - plan.len();
        let workers = if to_translate > 0 {
            request.workers.min(to_translate)
        } else {
            0
        };

        tracing::info!(
            book = %book_dir.display(),
            stage = request.stage.as_str(),
            force = request.force,
            to_fetch,
            to_translate,
            skipped,
            workers,
            "run started"
        );

        let shared = Arc::new(Shared {
            book_dir: book_dir.clone(),
            encoding: book.encoding.clone(),
            store: self.store.clone(),
            fetcher: self.fetcher.clone(),
            translator: self.translator.clone(),
            observer: Arc::clone(&self.observer),
            cancel: self.cancel.clone(),
            style,
            glossary: SharedGlossary::new(glossary),
            grow_glossary: request.glossary && self.translator.config().progressive_glossary,
            seeded: OnceCell::new(),
            started,
            state: Mutex::new(RunState {
                book,
                stats: RunStats::new(total, to_fetch, to_translate, skipped, workers),
            }),
        });

        if plan.is_empty() {
            tracing::info!(book = %book_dir.display(), "nothing to do");
            return Ok(RunOutcome::Completed(shared.finish().await));
        }

        if to_translate > 0 {
            shared.translate_book_metadata().await;
        }

        let mut tasks = JoinSet::new();
        let producer = if workers > 0 {
            let (producer, consumer) = chapter_queue(self.config.pipeline.queue_capacity);
            for worker in 0..workers {
                tasks.spawn(translate_worker(
                    Arc::clone(&shared),
                    worker,
                    consumer.clone(),
                ));
            }
            Some(producer)
        } else {
            None
        };
        tasks.spawn(produce(Arc::clone(&shared), plan, producer));

        let reporter_stop = self.cancel.child_token();
        let reporter = tokio::spawn(report_progress(
            Arc::clone(&shared),
            self.config.pipeline.report_interval(),
            reporter_stop.clone(),
        ));

        let finished = tokio::select! {
            _ = drain(&mut tasks) => true,
            _ = self.cancel.cancelled() => false,
        };
        if !finished {
            let grace = self.config.pipeline.grace_period();
            tracing::info!(
                book = %book_dir.display(),
                grace_ms = grace.as_millis() as u64,
                "cancellation requested; waiting for in-flight chapters"
            );
            if tokio::time::timeout(grace, drain(&mut tasks)).await.is_err() {
                tracing::warn!(book = %book_dir.display(), "grace period elapsed; aborting tasks");
                tasks.abort_all();
                drain(&mut tasks).await;
            }
        }
        reporter_stop.cancel();
        let _ = reporter.await;

        let summary = shared.finish().await;
        tracing::info!(
            book = %book_dir.display(),
            fetched = summary.fetched,
            translated = summary.translated,
            errors = summary.errors,
            elapsed_ms = summary.elapsed_ms,
            cancelled = self.cancel.is_cancelled(),
            "run finished"
        );
        if self.cancel.is_cancelled() {
            Ok(RunOutcome::Cancelled(summary))
        } else {
            Ok(RunOutcome::Completed(summary))
        }
    }

    /// Chapters to work on, ascending by index.
    async fn plan(&self, book: &Book, request: &RunRequest) -> Result<Vec<Planned>, RunError> {
        let selected = book
            .select(request.chapters.as_deref())
            .map_err(|err| RunError::Setup(format!("{err:#}")))?;
        if selected.is_empty() {
            return Err(RunError::Setup(format!(
                "chapter range {:?} matches no chapters",
                request.chapters.as_deref().unwrap_or_default()
            )));
        }

        let stage = request.stage;
        let mut plan = Vec::new();
        for chapter in selected {
            let fetch = stage.fetches() && (request.force || chapter.status == ChapterStatus::Pending);
            let translate = stage.translates()
                && (fetch
                    || if request.force {
                        self.store.has_raw(&request.book_dir, chapter.index).await
                    } else {
                        chapter.status == ChapterStatus::Crawled
                    });
            if fetch || translate {
                plan.push(Planned {
                    index: chapter.index,
                    url: chapter.url.clone(),
                    fetch,
                    translate,
                });
            }
        }
        Ok(plan)
    }
}

#[derive(Debug)]
struct Planned {
    index: u32,
    url: String,
    fetch: bool,
    translate: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Done,
    Failed,
    Cancelled,
}

enum Transition {
    Crawled { title: Option<String> },
    Translated { title: Option<String> },
    FetchFailed(String),
    TranslateFailed(String),
}

struct RunState {
    book: Book,
    stats: RunStats,
}

/// State shared by the fetch task, the workers and the reporter.
struct Shared {
    book_dir: PathBuf,
    encoding: String,
    store: ProgressStore,
    fetcher: Fetcher,
    translator: Translator,
    observer: Arc<dyn RunObserver>,
    cancel: CancellationToken,
    style: StyleTemplate,
    glossary: SharedGlossary,
    grow_glossary: bool,
    seeded: OnceCell<()>,
    started: Instant,
    state: Mutex<RunState>,
}

impl Shared {
    /// The single update path: status, counters, `book.json`, then the observer.
    async fn persist(&self, index: u32, transition: Transition) {
        let mut guard = self.state.lock().await;
        let RunState { book, stats } = &mut *guard;

        let (status, error) = match &transition {
            Transition::Crawled { .. } => (ChapterStatus::Crawled, None),
            Transition::Translated { .. } => (ChapterStatus::Translated, None),
            Transition::FetchFailed(msg) | Transition::TranslateFailed(msg) => {
                (ChapterStatus::Error, Some(msg.clone()))
            }
        };
        if !book.set_status(index, status.clone(), error.clone()) {
            tracing::warn!(chapter = index, "chapter vanished from book state");
            return;
        }
        match transition {
            Transition::Crawled { title } => {
                stats.record_fetched();
                if let Some(title) = title
                    && let Some(chapter) = book.chapter_mut(index)
                    && chapter.title_source.trim().is_empty()
                {
                    chapter.title_source = title;
                }
            }
            Transition::Translated { title } => {
                stats.record_translated();
                if let Some(title) = title
                    && let Some(chapter) = book.chapter_mut(index)
                {
                    chapter.title_target = Some(title);
                }
            }
            Transition::FetchFailed(msg) => stats.record_fetch_error(index, &msg),
            Transition::TranslateFailed(msg) => stats.record_translate_error(index, &msg),
        }

        if let Err(err) = self.store.save(&self.book_dir, book).await {
            tracing::error!(chapter = index, err = %format!("{err:#}"), "failed to save book state");
        }

        let title = book
            .chapter(index)
            .map(|c| c.title_source.clone())
            .unwrap_or_default();
        self.observer.on_chapter(&ChapterUpdate {
            index,
            title,
            status,
            error,
        });
    }

    async fn set_fetching(&self, chapter: Option<u32>) {
        self.state.lock().await.stats.set_fetching(chapter);
    }

    async fn set_worker(&self, worker: usize, chapter: Option<u32>) {
        self.state.lock().await.stats.set_worker(worker, chapter);
    }

    async fn snapshot(&self) -> RunStatsSnapshot {
        let glossary_size = self.glossary.len().await;
        let elapsed_ms = self.started.elapsed().as_millis() as u64;
        self.state.lock().await.stats.snapshot(glossary_size, elapsed_ms)
    }

    /// Final save, final progress report, summary.
    async fn finish(&self) -> RunSummary {
        let glossary_size = self.glossary.len().await;
        let elapsed_ms = self.started.elapsed().as_millis() as u64;
        let (snapshot, summary) = {
            let mut guard = self.state.lock().await;
            let RunState { book, stats } = &mut *guard;
            if let Err(err) = self.store.save(&self.book_dir, book).await {
                tracing::error!(err = %format!("{err:#}"), "failed to save book state");
            }
            let snapshot = stats.snapshot(glossary_size, elapsed_ms);
            let summary = RunSummary::from_snapshot(&snapshot, stats.error_messages());
            (snapshot, summary)
        };
        self.observer.on_progress(&snapshot);
        summary
    }

    async fn fetch_chapter(&self, index: u32, url: &str) -> Step {
        let page = match self.fetcher.fetch(url, &self.encoding, &self.cancel).await {
            Ok(page) => page,
            Err(FetchError::Cancelled) => return Step::Cancelled,
            Err(err) => {
                tracing::warn!(chapter = index, url, %err, "chapter fetch failed");
                self.persist(index, Transition::FetchFailed(err.to_string()))
                    .await;
                return Step::Failed;
            }
        };

        let page_url = url.to_owned();
        let text = match tokio::task::spawn_blocking(move || extract::chapter_text(&page, &page_url))
            .await
        {
            Ok(text) => text,
            Err(err) => {
                tracing::warn!(chapter = index, url, %err, "chapter extraction failed");
                self.persist(index, Transition::FetchFailed(format!("extract: {err}")))
                    .await;
                return Step::Failed;
            }
        };
        if text.body.trim().is_empty() {
            tracing::warn!(chapter = index, url, "fetched page has no chapter text");
            self.persist(
                index,
                Transition::FetchFailed("empty chapter body".to_owned()),
            )
            .await;
            return Step::Failed;
        }
        if let Err(err) = self.store.write_raw(&self.book_dir, index, &text.body).await {
            let message = format!("{err:#}");
            tracing::warn!(chapter = index, err = %message, "failed to store chapter");
            self.persist(index, Transition::FetchFailed(message)).await;
            return Step::Failed;
        }
        self.persist(index, Transition::Crawled { title: text.title })
            .await;
        Step::Done
    }

    async fn translate_chapter(&self, index: u32) -> Step {
        let source = match self.store.read_raw(&self.book_dir, index).await {
            Ok(source) => source,
            Err(err) => {
                let message = format!("{err:#}");
                tracing::warn!(chapter = index, err = %message, "raw chapter unreadable");
                self.persist(index, Transition::TranslateFailed(message))
                    .await;
                return Step::Failed;
            }
        };
        self.ensure_glossary_seeded().await;

        let translated = match self
            .translator
            .translate(&source, &self.glossary, &self.style, &self.cancel)
            .await
        {
            Ok(text) => text,
            Err(TranslateError::Cancelled) => {
                tracing::debug!(chapter = index, "translation cancelled; status unchanged");
                return Step::Cancelled;
            }
            Err(err) => {
                tracing::warn!(chapter = index, %err, "chapter translation failed");
                self.persist(index, Transition::TranslateFailed(err.to_string()))
                    .await;
                return Step::Failed;
            }
        };

        let title = match self.untranslated_title(index).await {
            Some(title) => self.translate_label(&title).await,
            None => None,
        };

        if let Err(err) = self
            .store
            .write_translated(&self.book_dir, index, &translated)
            .await
        {
            let message = format!("{err:#}");
            tracing::warn!(chapter = index, err = %message, "failed to store translation");
            self.persist(index, Transition::TranslateFailed(message))
                .await;
            return Step::Failed;
        }
        self.persist(index, Transition::Translated { title }).await;

        if self.grow_glossary {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {}
                added = self.translator.grow_glossary(&self.book_dir, &source, &self.glossary) => {
                    if added > 0 {
                        tracing::info!(chapter = index, added, "glossary grew");
                    }
                }
            }
        }
        Step::Done
    }

    /// Best-effort title translation that gives up on cancellation.
    async fn translate_label(&self, text: &str) -> Option<String> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            out = self.translator.translate_title(text, &self.glossary, &self.style) => out,
        }
    }

    /// Translates the book title and author once per book.
    async fn translate_book_metadata(&self) {
        let (title, author) = {
            let state = self.state.lock().await;
            if !state.book.title_target.trim().is_empty() {
                return;
            }
            (state.book.title_source.clone(), state.book.author.clone())
        };
        // The title marks the book as done; without it the next run retries.
        let Some(title_target) = self.translate_label(&title).await else {
            return;
        };
        let author_target = if author.trim().is_empty() {
            None
        } else {
            self.translate_label(&author).await
        };

        let mut guard = self.state.lock().await;
        let book = &mut guard.book;
        book.title_target = title_target;
        if let Some(author_target) = author_target {
            book.author_target = author_target;
        }
        if let Err(err) = self.store.save(&self.book_dir, book).await {
            tracing::error!(err = %format!("{err:#}"), "failed to save book state");
        }
        tracing::info!(
            title = %book.title_target,
            author = %book.author_target,
            "book metadata translated"
        );
    }

    async fn untranslated_title(&self, index: u32) -> Option<String> {
        let state = self.state.lock().await;
        let chapter = state.book.chapter(index)?;
        if chapter.title_target.is_some() || chapter.title_source.trim().is_empty() {
            return None;
        }
        Some(chapter.title_source.clone())
    }

    /// Seeds an empty glossary from the first fetched chapters, once per run.
    async fn ensure_glossary_seeded(&self) {
        if !self.grow_glossary {
            return;
        }
        self.seeded
            .get_or_init(|| async {
                if self.glossary.len().await > 0 {
                    return;
                }
                let limit = self.translator.config().glossary_sample_chapters;
                let indices: Vec<u32> = {
                    let state = self.state.lock().await;
                    let mut fetched: Vec<u32> = state
                        .book
                        .chapters
                        .iter()
                        .filter(|c| c.status.reached(&ChapterStatus::Crawled))
                        .map(|c| c.index)
                        .collect();
                    fetched.sort_unstable();
                    fetched.truncate(limit);
                    fetched
                };
                let mut samples = Vec::with_capacity(indices.len());
                for index in indices {
                    if let Ok(text) = self.store.read_raw(&self.book_dir, index).await {
                        samples.push(text);
                    }
                }
                self.translator
                    .seed_glossary(&self.book_dir, &samples, &self.glossary)
                    .await;
            })
            .await;
    }
}

/// Fetches in ascending index order and feeds the translator pool.
async fn produce(shared: Arc<Shared>, plan: Vec<Planned>, producer: Option<QueueProducer>) {
    for item in plan {
        if shared.cancel.is_cancelled() {
            break;
        }

        let slot = match (&producer, item.translate) {
            (Some(producer), true) => {
                let reserved = tokio::select! {
                    biased;
                    _ = shared.cancel.cancelled() => break,
                    slot = producer.reserve() => slot,
                };
                match reserved {
                    Some(slot) => Some(slot),
                    None => break,
                }
            }
            _ => None,
        };

        if item.fetch {
            shared.set_fetching(Some(item.index)).await;
            let step = shared.fetch_chapter(item.index, &item.url).await;
            shared.set_fetching(None).await;
            match step {
                Step::Done => {}
                Step::Failed => continue,
                Step::Cancelled => break,
            }
        }

        if let (Some(producer), Some(slot)) = (&producer, slot)
            && !producer.enqueue(slot, item.index).await
        {
            tracing::warn!(chapter = item.index, "translator pool is gone; stopping fetch");
            break;
        }
    }
    tracing::debug!("fetch task finished");
}

async fn translate_worker(shared: Arc<Shared>, worker: usize, queue: QueueConsumer) {
    loop {
        let next = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => None,
            item = queue.recv() => item,
        };
        let Some(item) = next else {
            break;
        };

        shared.set_worker(worker, Some(item.index)).await;
        tracing::debug!(worker, chapter = item.index, "translating chapter");
        let step = shared.translate_chapter(item.index).await;
        shared.set_worker(worker, None).await;
        drop(item);

        if step == Step::Cancelled {
            break;
        }
    }
    tracing::debug!(worker, "translator worker finished");
}

async fn report_progress(shared: Arc<Shared>, every: Duration, stop: CancellationToken) {
    let mut ticker = tokio::time::interval(every.max(Duration::from_millis(10)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {
                let snapshot = shared.snapshot().await;
                shared.observer.on_progress(&snapshot);
            }
        }
    }
}

async fn drain(tasks: &mut JoinSet<()>) {
    while let Some(joined) = tasks.join_next().await {
        if let Err(err) = joined
            && !err.is_cancelled()
        {
            tracing::error!(%err, "pipeline task failed");
        }
    }
}
