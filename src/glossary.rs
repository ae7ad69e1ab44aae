use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::json_file::{read_json, write_json_atomic};

pub const GLOSSARY_FILE: &str = "glossary.json";

const CATEGORIES: &[&str] = &[
    "character",
    "realm",
    "technique",
    "location",
    "item",
    "organization",
    "general",
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GlossaryEntry {
    pub source: String,
    pub target: String,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

fn default_category() -> String {
    "general".to_owned()
}

impl GlossaryEntry {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            category: default_category(),
            notes: None,
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Glossary {
    entries: Vec<GlossaryEntry>,
    #[serde(skip)]
    index: HashMap<String, usize>,
}

impl Glossary {
    pub fn new(entries: Vec<GlossaryEntry>) -> Self {
        let mut glossary = Self::default();
        for entry in entries {
            glossary.upsert(entry);
        }
        glossary
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[GlossaryEntry] {
        &self.entries
    }

    pub fn contains(&self, source: &str) -> bool {
        self.index.contains_key(source)
    }

    pub fn lookup(&self, source: &str) -> Option<&GlossaryEntry> {
        self.index.get(source).map(|&i| &self.entries[i])
    }

    /// Inserts or replaces an entry (explicit user edits).
    pub fn upsert(&mut self, entry: GlossaryEntry) {
        match self.index.get(&entry.source) {
            Some(&i) => self.entries[i] = entry,
            None => {
                self.index.insert(entry.source.clone(), self.entries.len());
                self.entries.push(entry);
            }
        }
    }

    /// Adds only terms not already present. Returns how many were added.
    pub fn extend_new(&mut self, entries: impl IntoIterator<Item = GlossaryEntry>) -> usize {
        let mut added = 0;
        for entry in entries {
            if entry.source.trim().is_empty() || self.contains(&entry.source) {
                continue;
            }
            self.upsert(entry);
            added += 1;
        }
        added
    }

    /// Glossary rendered for inclusion in a prompt, grouped by category.
    pub fn to_prompt(&self) -> String {
        if self.entries.is_empty() {
            return String::new();
        }
        let mut lines = Vec::new();
        let mut emit = |category: &str, entries: Vec<&GlossaryEntry>| {
            if entries.is_empty() {
                return;
            }
            lines.push(format!("### {category}"));
            for e in entries {
                lines.push(format!("- {} → {}", e.source, e.target));
            }
            lines.push(String::new());
        };
        for &category in CATEGORIES {
            emit(
                category,
                self.entries
                    .iter()
                    .filter(|e| e.category == category)
                    .collect(),
            );
        }
        emit(
            "other",
            self.entries
                .iter()
                .filter(|e| !CATEGORIES.contains(&e.category.as_str()))
                .collect(),
        );
        lines.join("\n")
    }

    pub async fn load(book_dir: &Path) -> anyhow::Result<Self> {
        let path = book_dir.join(GLOSSARY_FILE);
        let loaded: Option<Glossary> = read_json(&path).await?;
        Ok(loaded.map(|g| Self::new(g.entries)).unwrap_or_default())
    }

    pub async fn save(&self, book_dir: &Path) -> anyhow::Result<()> {
        write_json_atomic(&book_dir.join(GLOSSARY_FILE), self)
            .await
            .context("save glossary")
    }
}

/// Glossary shared by the translator workers of one run.
#[derive(Debug, Clone, Default)]
pub struct SharedGlossary {
    inner: Arc<RwLock<Glossary>>,
}

impl SharedGlossary {
    pub fn new(glossary: Glossary) -> Self {
        Self {
            inner: Arc::new(RwLock::new(glossary)),
        }
    }

    pub async fn snapshot(&self) -> Glossary {
        self.inner.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn prompt(&self) -> String {
        self.inner.read().await.to_prompt()
    }

    /// Merges new terms and persists the glossary when anything was added.
    pub async fn grow(
        &self,
        book_dir: &Path,
        entries: Vec<GlossaryEntry>,
    ) -> anyhow::Result<usize> {
        let mut guard = self.inner.write().await;
        let added = guard.extend_new(entries);
        if added > 0 {
            guard.save(book_dir).await?;
        }
        Ok(added)
    }
}
