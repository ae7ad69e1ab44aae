use std::path::PathBuf;

use anyhow::Context as _;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::app::model::JobRequest;
use crate::json_file::{read_json, write_json_atomic};
use crate::pipeline::RunStage;
use crate::style::DEFAULT_STYLE;

pub const HINT_FILE: &str = "last_run.json";

/// Settings of the last run started for a book. Survives process restarts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResumeHint {
    pub style: String,
    pub workers: usize,
    #[serde(default)]
    pub chapters: Option<String>,
    #[serde(default)]
    pub stage: RunStage,
    #[serde(default)]
    pub force: bool,
    #[serde(default = "default_true")]
    pub glossary: bool,
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
}

fn default_true() -> bool {
    true
}

impl Default for ResumeHint {
    fn default() -> Self {
        Self {
            style: DEFAULT_STYLE.to_owned(),
            workers: JobRequest::default_workers(),
            chapters: None,
            stage: RunStage::Full,
            force: false,
            glossary: true,
            last_run_at: None,
        }
    }
}

impl ResumeHint {
    pub fn from_request(request: &JobRequest) -> Self {
        Self {
            style: request.style.clone(),
            workers: request.workers,
            chapters: request.chapters.clone(),
            stage: request.stage,
            force: request.force,
            glossary: request.glossary,
            last_run_at: Some(Utc::now()),
        }
    }

    /// A request that continues where the hinted run left off.
    pub fn to_request(&self, book_id: &str) -> JobRequest {
        JobRequest {
            book_id: book_id.to_owned(),
            stage: self.stage,
            chapters: self.chapters.clone(),
            workers: self.workers.max(1),
            force: false,
            style: self.style.clone(),
            glossary: self.glossary,
        }
    }
}

#[async_trait]
pub trait HintStore: Send + Sync {
    async fn get(&self, book_id: &str) -> anyhow::Result<Option<ResumeHint>>;
    async fn put(&self, book_id: &str, hint: &ResumeHint) -> anyhow::Result<()>;
}

/// Stores the hint inside the book's own directory.
#[derive(Debug, Clone)]
pub struct LocalFsHintStore {
    books_dir: PathBuf,
}

impl LocalFsHintStore {
    pub fn new(books_dir: impl Into<PathBuf>) -> Self {
        Self {
            books_dir: books_dir.into(),
        }
    }

    fn hint_path(&self, book_id: &str) -> PathBuf {
        self.books_dir.join(book_id).join(HINT_FILE)
    }
}

#[async_trait]
impl HintStore for LocalFsHintStore {
    async fn get(&self, book_id: &str) -> anyhow::Result<Option<ResumeHint>> {
        let path = self.hint_path(book_id);
        read_json(&path)
            .await
            .with_context(|| format!("read resume hint for {book_id}"))
    }

    async fn put(&self, book_id: &str, hint: &ResumeHint) -> anyhow::Result<()> {
        write_json_atomic(&self.hint_path(book_id), hint)
            .await
            .with_context(|| format!("write resume hint for {book_id}"))
    }
}
