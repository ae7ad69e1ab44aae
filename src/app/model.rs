use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::pipeline::{RunStage, RunStatsSnapshot, RunSummary};
use crate::style::DEFAULT_STYLE;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobRequest {
    pub book_id: String,
    #[serde(default)]
    pub stage: RunStage,
    #[serde(default)]
    pub chapters: Option<String>,
    #[serde(default = "JobRequest::default_workers")]
    pub workers: usize,
    #[serde(default)]
    pub force: bool,
    #[serde(default = "JobRequest::default_style")]
    pub style: String,
    #[serde(default = "JobRequest::default_glossary")]
    pub glossary: bool,
}

impl JobRequest {
    pub fn new(book_id: impl Into<String>) -> Self {
        Self {
            book_id: book_id.into(),
            stage: RunStage::Full,
            chapters: None,
            workers: Self::default_workers(),
            force: false,
            style: Self::default_style(),
            glossary: Self::default_glossary(),
        }
    }

    pub fn default_workers() -> usize {
        3
    }
    pub fn default_style() -> String {
        DEFAULT_STYLE.to_owned()
    }
    pub fn default_glossary() -> bool {
        true
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct JobProgress {
    pub percent: u32,
    pub snapshot: RunStatsSnapshot,
    pub updated_at: DateTime<Utc>,
}

impl JobProgress {
    pub fn from_snapshot(snapshot: &RunStatsSnapshot) -> Self {
        let planned = snapshot.to_fetch + snapshot.to_translate;
        let done = snapshot.fetched + snapshot.translated + snapshot.errors;
        let percent = if planned == 0 {
            100
        } else {
            ((done.min(planned) * 100) / planned) as u32
        };
        Self {
            percent,
            snapshot: snapshot.clone(),
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub job_id: String,
    pub book_id: String,
    pub status: JobStatus,
    pub request: JobRequest,
    pub progress: Option<JobProgress>,
    pub summary: Option<RunSummary>,
    pub error: Option<String>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(job_id: impl Into<String>, request: JobRequest) -> Self {
        Self {
            job_id: job_id.into(),
            book_id: request.book_id.clone(),
            status: JobStatus::Pending,
            request,
            progress: None,
            summary: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_defaults_fill_missing_fields() {
        let request: JobRequest = serde_json::from_str(r#"{"book_id":"b1"}"#).unwrap();
        assert_eq!(request, JobRequest::new("b1"));
    }

    #[test]
    fn progress_percent_counts_errors_as_done() {
        let snapshot = RunStatsSnapshot {
            to_fetch: 2,
            to_translate: 2,
            fetched: 1,
            translated: 0,
            errors: 1,
            ..RunStatsSnapshot::default()
        };
        assert_eq!(JobProgress::from_snapshot(&snapshot).percent, 50);
        assert_eq!(
            JobProgress::from_snapshot(&RunStatsSnapshot::default()).percent,
            100
        );
    }

    #[test]
    fn only_finished_statuses_are_terminal() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert_eq!(
            serde_json::to_string(&JobStatus::Completed).unwrap(),
            "\"completed\""
        );
    }
}
