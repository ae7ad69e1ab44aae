use std::cmp::Reverse;
use std::sync::Arc;

use serde::Serialize;

use crate::app::hint_store::{HintStore, LocalFsHintStore, ResumeHint};
use crate::book::ChapterStatus;
use crate::config::AppConfig;
use crate::progress::ProgressStore;

/// A book with chapters that have not reached `translated` yet.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ResumableBook {
    pub book_id: String,
    pub title: String,
    pub total: usize,
    pub done: usize,
    pub remaining: usize,
    pub errors: usize,
    /// Chapters whose stored status is not one this build understands.
    pub needs_attention: usize,
    pub hint: ResumeHint,
}

pub struct ResumeScanner {
    store: ProgressStore,
    hints: Arc<dyn HintStore>,
}

impl ResumeScanner {
    pub fn new(config: &AppConfig) -> Self {
        Self::with_hint_store(config, Arc::new(LocalFsHintStore::new(&config.books_dir)))
    }

    pub fn with_hint_store(config: &AppConfig, hints: Arc<dyn HintStore>) -> Self {
        Self {
            store: ProgressStore::new(&config.books_dir),
            hints,
        }
    }

    /// Reads every book from disk; nothing is cached between scans.
    pub async fn scan(&self) -> anyhow::Result<Vec<ResumableBook>> {
        let mut out = Vec::new();
        for book_dir in self.store.list_book_dirs().await? {
            let Some(book_id) = book_dir
                .file_name()
                .and_then(|name| name.to_str())
                .map(str::to_owned)
            else {
                continue;
            };
            let Some(book) = self.store.load(&book_dir).await else {
                continue;
            };
            if book.chapters.is_empty() {
                continue;
            }

            let total = book.chapters.len();
            let done = book
                .chapters
                .iter()
                .filter(|c| c.status.reached(&ChapterStatus::Translated))
                .count();
            if done == total {
                continue;
            }

            let hint = match self.hints.get(&book_id).await {
                Ok(Some(hint)) => hint,
                Ok(None) => ResumeHint::default(),
                Err(err) => {
                    tracing::warn!(book = %book_id, err = %format!("{err:#}"), "ignoring unreadable resume hint");
                    ResumeHint::default()
                }
            };
            out.push(ResumableBook {
                title: if book.title_target.is_empty() {
                    book.title_source.clone()
                } else {
                    book.title_target.clone()
                },
                total,
                done,
                remaining: total - done,
                errors: book.count_status(&ChapterStatus::Error),
                needs_attention: book.chapters.iter().filter(|c| c.status.is_unknown()).count(),
                hint,
                book_id,
            });
        }
        out.sort_by(|a, b| {
            Reverse(a.hint.last_run_at)
                .cmp(&Reverse(b.hint.last_run_at))
                .then_with(|| a.book_id.cmp(&b.book_id))
        });
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::*;
    use crate::book::Book;

    fn config(dir: &std::path::Path) -> AppConfig {
        AppConfig {
            books_dir: dir.to_path_buf(),
            ..AppConfig::default()
        }
    }

    async fn write_book(store: &ProgressStore, id: &str, statuses: &[ChapterStatus]) {
        let mut book = Book::new(format!("https://example.com/{id}/"), id);
        for (i, status) in statuses.iter().enumerate() {
            let index = book.push_chapter(format!("https://example.com/{id}/{i}.html"), "t");
            book.set_status(index, status.clone(), None);
        }
        store.save(&store.book_dir(id), &mut book).await.unwrap();
    }

    #[tokio::test]
    async fn finished_and_empty_books_are_not_resumable() {
        let temp = tempfile::TempDir::new().unwrap();
        let config = config(temp.path());
        let store = ProgressStore::new(temp.path());
        write_book(&store, "done", &[ChapterStatus::Translated, ChapterStatus::Exported]).await;
        write_book(&store, "empty", &[]).await;
        write_book(
            &store,
            "half",
            &[
                ChapterStatus::Translated,
                ChapterStatus::Error,
                ChapterStatus::Unknown("reviewing".to_owned()),
            ],
        )
        .await;

        let books = ResumeScanner::new(&config).scan().await.unwrap();
        assert_eq!(books.len(), 1);
        let half = &books[0];
        assert_eq!(half.book_id, "half");
        assert_eq!((half.total, half.done, half.remaining), (3, 1, 2));
        assert_eq!(half.errors, 1);
        assert_eq!(half.needs_attention, 1);
        assert_eq!(half.hint, ResumeHint::default());
    }

    #[tokio::test]
    async fn most_recently_run_books_come_first() {
        let temp = tempfile::TempDir::new().unwrap();
        let config = config(temp.path());
        let store = ProgressStore::new(temp.path());
        let hints = LocalFsHintStore::new(temp.path());
        for id in ["a", "b", "c"] {
            write_book(&store, id, &[ChapterStatus::Pending]).await;
        }
        let older = ResumeHint {
            last_run_at: Some(Utc::now() - Duration::hours(1)),
            ..ResumeHint::default()
        };
        let newer = ResumeHint {
            last_run_at: Some(Utc::now()),
            ..ResumeHint::default()
        };
        hints.put("a", &older).await.unwrap();
        hints.put("b", &newer).await.unwrap();

        let ids: Vec<_> = ResumeScanner::new(&config)
            .scan()
            .await
            .unwrap()
            .into_iter()
            .map(|b| b.book_id)
            .collect();
        assert_eq!(ids, ["b", "a", "c"]);
    }
}
