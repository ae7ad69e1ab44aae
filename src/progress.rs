//! Durable per-book chapter state.
//!
//! Layout of a book directory:
//!
//! ```text
//! <books_dir>/<book_id>/
//!   book.json              chapter statuses (sole source of truth)
//!   glossary.json
//!   last_run.json          resume hint
//!   raw/0001.txt           fetched chapter text
//!   translated/0001.txt    translated chapter text
//! ```

use std::path::{Path, PathBuf};

use anyhow::Context as _;
use chrono::Utc;
use tokio::fs;

use crate::book::Book;
use crate::json_file::{read_json, write_atomic, write_json_atomic};

pub const BOOK_FILE: &str = "book.json";

#[derive(Debug, Clone)]
pub struct ProgressStore {
    books_dir: PathBuf,
}

impl ProgressStore {
    pub fn new(books_dir: impl Into<PathBuf>) -> Self {
        Self {
            books_dir: books_dir.into(),
        }
    }

    pub fn books_dir(&self) -> &Path {
        &self.books_dir
    }

    pub fn book_dir(&self, book_id: &str) -> PathBuf {
        self.books_dir.join(book_id)
    }

    /// Loads a book; missing or malformed state is reported as `None`.
    pub async fn load(&self, book_dir: &Path) -> Option<Book> {
        let path = book_dir.join(BOOK_FILE);
        match read_json::<Book>(&path).await {
            Ok(Some(book)) if book.has_unique_indices() => Some(book),
            Ok(Some(_)) => {
                tracing::warn!(path = %path.display(), "duplicate chapter index; ignoring book");
                None
            }
            Ok(None) => None,
            Err(err) => {
                tracing::warn!(path = %path.display(), err = %format!("{err:#}"), "unreadable book state");
                None
            }
        }
    }

    pub async fn has_book(&self, book_dir: &Path) -> bool {
        fs::try_exists(book_dir.join(BOOK_FILE))
            .await
            .unwrap_or(false)
    }

    /// Full atomic overwrite of `book.json`.
    pub async fn save(&self, book_dir: &Path, book: &mut Book) -> anyhow::Result<()> {
        book.updated_at = Utc::now();
        write_json_atomic(&book_dir.join(BOOK_FILE), book)
            .await
            .with_context(|| format!("save book state: {}", book_dir.display()))
    }

    pub async fn write_raw(&self, book_dir: &Path, index: u32, text: &str) -> anyhow::Result<()> {
        write_atomic(&raw_path(book_dir, index), text.as_bytes())
            .await
            .with_context(|| format!("write raw chapter {index}"))
    }

    pub async fn read_raw(&self, book_dir: &Path, index: u32) -> anyhow::Result<String> {
        let path = raw_path(book_dir, index);
        fs::read_to_string(&path)
            .await
            .with_context(|| format!("read raw chapter: {}", path.display()))
    }

    pub async fn has_raw(&self, book_dir: &Path, index: u32) -> bool {
        fs::try_exists(raw_path(book_dir, index))
            .await
            .unwrap_or(false)
    }

    pub async fn write_translated(
        &self,
        book_dir: &Path,
        index: u32,
        text: &str,
    ) -> anyhow::Result<()> {
        write_atomic(&translated_path(book_dir, index), text.as_bytes())
            .await
            .with_context(|| format!("write translated chapter {index}"))
    }

    pub async fn read_translated(&self, book_dir: &Path, index: u32) -> anyhow::Result<String> {
        let path = translated_path(book_dir, index);
        fs::read_to_string(&path)
            .await
            .with_context(|| format!("read translated chapter: {}", path.display()))
    }

    /// Directories under the books root that carry a `book.json`.
    pub async fn list_book_dirs(&self) -> anyhow::Result<Vec<PathBuf>> {
        let mut out = Vec::new();
        let mut entries = match fs::read_dir(&self.books_dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("list books: {}", self.books_dir.display()));
            }
        };
        while let Some(entry) = entries.next_entry().await.context("read books dir entry")? {
            let path = entry.path();
            if fs::try_exists(path.join(BOOK_FILE)).await.unwrap_or(false) {
                out.push(path);
            }
        }
        out.sort();
        Ok(out)
    }
}

/// A book id is a single directory name under the books root.
pub fn is_valid_book_id(book_id: &str) -> bool {
    !book_id.trim().is_empty()
        && !book_id.contains(['/', '\\'])
        && book_id != "."
        && book_id != ".."
}

pub fn raw_path(book_dir: &Path, index: u32) -> PathBuf {
    book_dir.join("raw").join(format!("{index:04}.txt"))
}

pub fn translated_path(book_dir: &Path, index: u32) -> PathBuf {
    book_dir.join("translated").join(format!("{index:04}.txt"))
}
