//! Subcommand bodies for the `chapterflow` binary.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context as _;
use tokio_util::sync::CancellationToken;

use crate::app::model::{JobRequest, JobStatus};
use crate::app::registry::JobRegistry;
use crate::app::resume::ResumeScanner;
use crate::book::Book;
use crate::cli::{BookInitArgs, BookStatusArgs, LlmArgs, RunArgs};
use crate::config::AppConfig;
use crate::events::{EventBus, PipelineEvent, event_type};
use crate::extract::{self, ChapterLink};
use crate::fetch::{Fetcher, HttpTransport};
use crate::llm::{self, LlmSettings};
use crate::progress::{ProgressStore, is_valid_book_id};

pub async fn run(args: RunArgs, mut config: AppConfig) -> anyhow::Result<()> {
    if args.polish {
        config.translation.polish = true;
    }
    let transport = Arc::new(HttpTransport::new(&config.crawler).context("build http client")?);
    let backend = llm::backend(&llm_settings(&args.llm)).context("build translation backend")?;
    let bus = Arc::new(EventBus::new());
    bus.subscribe(log_event);

    let registry = JobRegistry::new(&config, transport, backend, bus);
    let job = registry.create_job(JobRequest {
        book_id: args.book,
        stage: args.stage,
        chapters: args.chapters,
        workers: args.workers.unwrap_or(config.pipeline.workers),
        force: args.force,
        style: args.style,
        glossary: !args.no_glossary,
    });
    let job_id = job.job_id;
    registry.start_job(&job_id).await?;

    let job = tokio::select! {
        finished = registry.wait_job(&job_id) => finished?,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("stopping; in-flight chapters get a grace period to finish");
            registry.cancel_job(&job_id).await?
        }
    };

    if let Some(summary) = &job.summary {
        println!(
            "{}",
            serde_json::to_string_pretty(summary).context("serialize run summary")?
        );
    }
    match job.status {
        JobStatus::Completed => Ok(()),
        JobStatus::Cancelled => anyhow::bail!("run cancelled"),
        status => anyhow::bail!(
            "run {status}: {}",
            job.error.as_deref().unwrap_or("unknown error")
        ),
    }
}

fn llm_settings(args: &LlmArgs) -> LlmSettings {
    LlmSettings {
        engine: args.engine,
        target_language: args.target_language.clone(),
        command: args.command.clone(),
        command_args: args.command_args.clone(),
        openai_model: args.openai_model.clone(),
        openai_base_url: args.openai_base_url.clone(),
        ..LlmSettings::default()
    }
}

fn log_event(event: &PipelineEvent) {
    if event.event_type == event_type::PROGRESS {
        let field = |name: &str| event.payload.get(name).and_then(|v| v.as_u64()).unwrap_or(0);
        tracing::info!(
            fetched = field("fetched"),
            translated = field("translated"),
            errors = field("errors"),
            glossary = field("glossary_size"),
            "progress"
        );
    } else {
        tracing::debug!(event = %event.event_type, payload = %event.payload, "event");
    }
}

pub async fn resumable(config: &AppConfig) -> anyhow::Result<()> {
    let books = ResumeScanner::new(config)
        .scan()
        .await
        .context("scan books")?;
    if books.is_empty() {
        println!("no resumable books");
        return Ok(());
    }
    for book in books {
        let last_run = book
            .hint
            .last_run_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "never".to_owned());
        println!(
            "{}\t{}/{} translated\terrors={}\tattention={}\tstyle={}\tworkers={}\tlast_run={}\t{}",
            book.book_id,
            book.done,
            book.total,
            book.errors,
            book.needs_attention,
            book.hint.style,
            book.hint.workers,
            last_run,
            book.title,
        );
    }
    Ok(())
}

pub async fn book_init(args: BookInitArgs, config: &AppConfig) -> anyhow::Result<()> {
    if !is_valid_book_id(&args.book) {
        anyhow::bail!("invalid book id: {:?}", args.book);
    }
    let base = url::Url::parse(&args.url).with_context(|| format!("parse url: {}", args.url))?;
    let store = ProgressStore::new(&config.books_dir);
    let book_dir = store.book_dir(&args.book);
    if !args.force && store.load(&book_dir).await.is_some() {
        anyhow::bail!(
            "book already exists: {} (use --force to overwrite)",
            book_dir.display()
        );
    }

    let chapters = match &args.chapters_file {
        Some(path) => chapters_from_file(path, &base).await?,
        None => chapters_from_index(&base, &args.encoding, config).await?,
    };
    if chapters.is_empty() {
        anyhow::bail!("no chapters found for {}", args.book);
    }

    let mut book = Book::new(base.as_str(), &args.title);
    book.author = args.author;
    book.encoding = args.encoding;
    for link in chapters {
        book.push_chapter(link.url, link.title);
    }
    store.save(&book_dir, &mut book).await?;
    tracing::info!(book = %args.book, chapters = book.chapters.len(), "book initialized");
    println!("{}", book_dir.display());
    Ok(())
}

async fn chapters_from_file(path: &Path, base: &url::Url) -> anyhow::Result<Vec<ChapterLink>> {
    let listing = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("read chapters file: {}", path.display()))?;
    let mut chapters = Vec::new();
    for (line_no, line) in listing.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (href, title) = match line.split_once('\t') {
            Some((href, title)) => (href.trim(), title.trim()),
            None => (line, ""),
        };
        let url = base
            .join(href)
            .with_context(|| format!("chapters file line {}: bad url {href:?}", line_no + 1))?;
        chapters.push(ChapterLink {
            url: url.to_string(),
            title: title.to_owned(),
        });
    }
    Ok(chapters)
}

async fn chapters_from_index(
    index: &url::Url,
    encoding: &str,
    config: &AppConfig,
) -> anyhow::Result<Vec<ChapterLink>> {
    let transport = Arc::new(HttpTransport::new(&config.crawler).context("build http client")?);
    let fetcher = Fetcher::new(transport, &config.crawler);
    let html = fetcher
        .fetch(index.as_str(), encoding, &CancellationToken::new())
        .await
        .with_context(|| format!("fetch index page: {index}"))?;
    let links = extract::chapter_links(&html, index);
    tracing::info!(url = %index, chapters = links.len(), "chapter links collected");
    Ok(links)
}

pub async fn book_status(args: BookStatusArgs, config: &AppConfig) -> anyhow::Result<()> {
    let store = ProgressStore::new(&config.books_dir);
    let book_dir = store.book_dir(&args.book);
    let Some(book) = store.load(&book_dir).await else {
        anyhow::bail!("book not found: {}", book_dir.display());
    };

    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for chapter in &book.chapters {
        *counts.entry(chapter.status.as_str().to_owned()).or_default() += 1;
    }
    println!("{}\t{}", args.book, book.title_source);
    println!("total\t{}", book.chapters.len());
    for (status, count) in counts {
        println!("{status}\t{count}");
    }
    for chapter in book.chapters.iter().filter(|c| c.error_message.is_some()) {
        println!(
            "error\t{:04}\t{}",
            chapter.index,
            chapter.error_message.as_deref().unwrap_or_default()
        );
    }
    Ok(())
}
