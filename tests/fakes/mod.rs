#![allow(dead_code)]

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chapterflow::book::Book;
use chapterflow::config::AppConfig;
use chapterflow::fetch::{FetchError, FetchTransport};
use chapterflow::progress::ProgressStore;
use chapterflow::translate::{TranslateBackend, TranslateContext};
use tokio::sync::Semaphore;

pub fn chapter_url(index: u32) -> String {
    format!("https://novel.test/book/{index}.html")
}

pub fn chapter_page(index: u32) -> String {
    format!("<html><body><h1>第{index}章</h1><p>正文{index}。</p></body></html>")
}

/// Test config: no politeness delay, no retry, fast reporting.
pub fn test_config(books_dir: &Path) -> AppConfig {
    let mut config = AppConfig {
        books_dir: books_dir.to_path_buf(),
        styles_dir: books_dir.join("styles"),
        ..AppConfig::default()
    };
    config.crawler.delay_ms = 0;
    config.crawler.max_retries = 0;
    config.translation.max_retries = 0;
    config.translation.retry_backoff_ms = 1;
    config.translation.progressive_glossary = false;
    config.pipeline.report_interval_ms = 20;
    config.pipeline.grace_period_ms = 500;
    config
}

/// Writes a book with `chapters` pending chapters and returns its directory.
pub async fn seed_book(books_dir: &Path, book_id: &str, chapters: u32) -> PathBuf {
    let store = ProgressStore::new(books_dir);
    let dir = store.book_dir(book_id);
    let mut book = Book::new("https://novel.test/book/", book_id);
    for index in 1..=chapters {
        book.push_chapter(chapter_url(index), "");
    }
    store.save(&dir, &mut book).await.unwrap();
    dir
}

pub async fn load_book(dir: &Path) -> Book {
    ProgressStore::new(dir.parent().unwrap())
        .load(dir)
        .await
        .expect("book exists")
}

/// Serves every chapter page except the ones marked as failing.
#[derive(Default)]
pub struct FakeSite {
    failing: HashSet<String>,
    poisoned: HashSet<u32>,
    delay: Duration,
    calls: Mutex<Vec<String>>,
}

impl FakeSite {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(mut self, index: u32) -> Self {
        self.failing.insert(chapter_url(index));
        self
    }

    /// The chapter's text makes [`FakeTranslator`] fail.
    pub fn poisoned(mut self, index: u32) -> Self {
        self.poisoned.insert(index);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl FetchTransport for FakeSite {
    async fn fetch_once(&self, url: &str, _encoding: &str) -> Result<String, FetchError> {
        self.calls.lock().unwrap().push(url.to_owned());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.failing.contains(url) {
            return Err(FetchError::Status {
                status: 503,
                url: url.to_owned(),
            });
        }
        let index = url
            .rsplit('/')
            .next()
            .and_then(|name| name.strip_suffix(".html"))
            .and_then(|n| n.parse::<u32>().ok())
            .ok_or_else(|| FetchError::Status {
                status: 404,
                url: url.to_owned(),
            })?;
        if self.poisoned.contains(&index) {
            return Ok(format!("<html><body><p>FAIL {index}</p></body></html>"));
        }
        Ok(chapter_page(index))
    }
}

/// Prefixes text with `VI:`. Bodies can be slowed down or held at a gate.
#[derive(Default)]
pub struct FakeTranslator {
    delay: Duration,
    gate: Option<Arc<Semaphore>>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl FakeTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Every body translation waits for a permit on `gate`.
    pub fn with_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl TranslateBackend for FakeTranslator {
    async fn translate(&self, text: &str, _ctx: &TranslateContext) -> anyhow::Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        if let Some(gate) = &self.gate {
            gate.acquire().await?.forget();
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if text.contains("FAIL") {
            anyhow::bail!("backend refused the chunk");
        }
        Ok(format!("VI:{text}"))
    }

    async fn translate_title(&self, title: &str, _ctx: &TranslateContext) -> anyhow::Result<String> {
        Ok(format!("VI:{title}"))
    }
}

/// Polls until `cond` holds, panicking after two seconds.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "condition never held");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
