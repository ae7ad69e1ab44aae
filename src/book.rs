use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Per-chapter lifecycle status, persisted as an opaque string.
///
/// Values written by a newer version deserialize into [`ChapterStatus::Unknown`]
/// and are written back untouched.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChapterStatus {
    Pending,
    Crawled,
    Translated,
    Formatted,
    Exported,
    Error,
    Unknown(String),
}

impl ChapterStatus {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Pending => "pending",
            Self::Crawled => "crawled",
            Self::Translated => "translated",
            Self::Formatted => "formatted",
            Self::Exported => "exported",
            Self::Error => "error",
            Self::Unknown(raw) => raw,
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "pending" => Self::Pending,
            "crawled" => Self::Crawled,
            "translated" => Self::Translated,
            "formatted" => Self::Formatted,
            "exported" => Self::Exported,
            "error" => Self::Error,
            other => Self::Unknown(other.to_owned()),
        }
    }

    /// Position on the success path. `None` for `Error` and unknown values.
    pub fn rank(&self) -> Option<u8> {
        match self {
            Self::Pending => Some(0),
            Self::Crawled => Some(1),
            Self::Translated => Some(2),
            Self::Formatted => Some(3),
            Self::Exported => Some(4),
            Self::Error | Self::Unknown(_) => None,
        }
    }

    /// True when the chapter is at or above `target` on the success path.
    pub fn reached(&self, target: &ChapterStatus) -> bool {
        match (self.rank(), target.rank()) {
            (Some(have), Some(want)) => have >= want,
            _ => false,
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Self::Unknown(_))
    }
}

impl fmt::Display for ChapterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ChapterStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ChapterStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::parse(&raw))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chapter {
    pub index: u32,
    pub id: String,
    #[serde(default)]
    pub title_source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title_target: Option<String>,
    pub url: String,
    #[serde(default = "default_status")]
    pub status: ChapterStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crawled_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub translated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

fn default_status() -> ChapterStatus {
    ChapterStatus::Pending
}

fn default_encoding() -> String {
    "utf-8".to_owned()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Book {
    pub url: String,
    #[serde(default)]
    pub title_source: String,
    #[serde(default)]
    pub title_target: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub author_target: String,
    #[serde(default = "default_encoding")]
    pub encoding: String,
    #[serde(default)]
    pub chapters: Vec<Chapter>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Book {
    pub fn new(url: impl Into<String>, title_source: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            url: url.into(),
            title_source: title_source.into(),
            title_target: String::new(),
            author: String::new(),
            author_target: String::new(),
            encoding: default_encoding(),
            chapters: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Appends a pending chapter with the next 1-based index.
    pub fn push_chapter(&mut self, url: impl Into<String>, title: impl Into<String>) -> u32 {
        let url = url.into();
        let index = self.chapters.iter().map(|c| c.index).max().unwrap_or(0) + 1;
        self.chapters.push(Chapter {
            index,
            id: chapter_id_from_url(&url, index),
            title_source: title.into(),
            title_target: None,
            url,
            status: ChapterStatus::Pending,
            crawled_at: None,
            translated_at: None,
            error_message: None,
        });
        index
    }

    pub fn chapter(&self, index: u32) -> Option<&Chapter> {
        self.chapters.iter().find(|c| c.index == index)
    }

    pub fn chapter_mut(&mut self, index: u32) -> Option<&mut Chapter> {
        self.chapters.iter_mut().find(|c| c.index == index)
    }

    /// Applies a status transition and stamps the matching timestamp.
    pub fn set_status(
        &mut self,
        index: u32,
        status: ChapterStatus,
        error: Option<String>,
    ) -> bool {
        let now = Utc::now();
        let Some(chapter) = self.chapter_mut(index) else {
            return false;
        };
        match status {
            ChapterStatus::Crawled => chapter.crawled_at = Some(now),
            ChapterStatus::Translated => chapter.translated_at = Some(now),
            _ => {}
        }
        chapter.status = status;
        chapter.error_message = error;
        self.updated_at = now;
        true
    }

    pub fn has_unique_indices(&self) -> bool {
        let mut seen = BTreeSet::new();
        self.chapters.iter().all(|c| seen.insert(c.index))
    }

    pub fn count_status(&self, status: &ChapterStatus) -> usize {
        self.chapters.iter().filter(|c| &c.status == status).count()
    }

    /// Chapters selected by an optional range spec, ascending by index.
    pub fn select(&self, spec: Option<&str>) -> anyhow::Result<Vec<&Chapter>> {
        let mut chapters: Vec<&Chapter> = match spec.map(str::trim).filter(|s| !s.is_empty()) {
            None => self.chapters.iter().collect(),
            Some(spec) => {
                let max = self.chapters.iter().map(|c| c.index).max().unwrap_or(0);
                let wanted = parse_chapter_range(spec, max)?;
                self.chapters
                    .iter()
                    .filter(|c| wanted.contains(&c.index))
                    .collect()
            }
        };
        chapters.sort_by_key(|c| c.index);
        Ok(chapters)
    }
}

fn chapter_id_from_url(url: &str, index: u32) -> String {
    let from_path = url::Url::parse(url).ok().and_then(|parsed| {
        parsed
            .path_segments()
            .and_then(|mut segments| segments.rfind(|s| !s.is_empty()).map(str::to_owned))
    });
    match from_path {
        Some(segment) => segment
            .rsplit_once('.')
            .map(|(stem, _)| stem.to_owned())
            .unwrap_or(segment),
        None => format!("{index}"),
    }
}

/// Parses specs like `"1-10,15,20-25"` into a set of indices clamped to `1..=max`.
pub fn parse_chapter_range(spec: &str, max: u32) -> anyhow::Result<BTreeSet<u32>> {
    let mut out = BTreeSet::new();
    for part in spec.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if let Some((start, end)) = part.split_once('-') {
            let start = parse_index(start, spec)?;
            let end = parse_index(end, spec)?;
            if start > end {
                anyhow::bail!("invalid chapter range {part:?} in {spec:?}: start > end");
            }
            out.extend(start.max(1)..=end.min(max));
        } else {
            let idx = parse_index(part, spec)?;
            if (1..=max).contains(&idx) {
                out.insert(idx);
            }
        }
    }
    Ok(out)
}

fn parse_index(raw: &str, spec: &str) -> anyhow::Result<u32> {
    raw.trim()
        .parse::<u32>()
        .map_err(|_| anyhow::anyhow!("invalid chapter range {spec:?}: {raw:?} is not a number"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_status_survives_round_trip() {
        let json = r#"{"index":1,"id":"a","url":"http://x/1","status":"proofread"}"#;
        let chapter: Chapter = serde_json::from_str(json).unwrap();
        assert_eq!(chapter.status, ChapterStatus::Unknown("proofread".to_owned()));
        let back = serde_json::to_string(&chapter).unwrap();
        assert!(back.contains(r#""status":"proofread""#));
    }

    #[test]
    fn rank_ordering() {
        assert!(ChapterStatus::Translated.reached(&ChapterStatus::Crawled));
        assert!(ChapterStatus::Exported.reached(&ChapterStatus::Translated));
        assert!(!ChapterStatus::Crawled.reached(&ChapterStatus::Translated));
        assert!(!ChapterStatus::Error.reached(&ChapterStatus::Pending));
        assert!(!ChapterStatus::Unknown("x".into()).reached(&ChapterStatus::Pending));
    }

    #[test]
    fn range_parsing() {
        let set = parse_chapter_range("1-3, 5,9-20", 10).unwrap();
        assert_eq!(set.into_iter().collect::<Vec<_>>(), vec![1, 2, 3, 5, 9, 10]);
        assert!(parse_chapter_range("x-3", 10).is_err());
        assert!(parse_chapter_range("5-1", 10).is_err());
        assert!(parse_chapter_range("42", 10).unwrap().is_empty());
    }

    #[test]
    fn push_chapter_assigns_contiguous_indices() {
        let mut book = Book::new("http://example.com/book", "书");
        assert_eq!(book.push_chapter("http://example.com/book/101.html", "第一章"), 1);
        assert_eq!(book.push_chapter("http://example.com/book/102.html", "第二章"), 2);
        assert_eq!(book.chapters[0].id, "101");
        assert!(book.has_unique_indices());
    }

    #[test]
    fn set_status_stamps_timestamps() {
        let mut book = Book::new("u", "t");
        book.push_chapter("http://e/1", "");
        assert!(book.set_status(1, ChapterStatus::Crawled, None));
        assert!(book.chapters[0].crawled_at.is_some());
        assert!(book.set_status(1, ChapterStatus::Error, Some("boom".into())));
        assert_eq!(book.chapters[0].error_message.as_deref(), Some("boom"));
        assert!(!book.set_status(7, ChapterStatus::Crawled, None));
    }
}
