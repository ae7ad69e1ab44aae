use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context as _;

/// Runtime context handed to every component at construction.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub books_dir: PathBuf,
    pub styles_dir: PathBuf,
    pub crawler: CrawlerConfig,
    pub translation: TranslationConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone)]
pub struct CrawlerConfig {
    /// Delay before each outbound request (politeness).
    pub delay_ms: u64,
    pub max_retries: usize,
    pub timeout_seconds: u64,
    pub user_agent: String,
}

#[derive(Debug, Clone)]
pub struct TranslationConfig {
    /// Characters per chunk.
    pub chunk_size: usize,
    /// Characters of the previous chunk handed over as context.
    pub chunk_overlap: usize,
    pub concurrent_requests: usize,
    pub max_retries: usize,
    pub retry_backoff_ms: u64,
    pub polish: bool,
    pub polish_retries: usize,
    pub progressive_glossary: bool,
    pub glossary_sample_chapters: usize,
    pub glossary_sample_size: usize,
    pub glossary_max_new_terms: usize,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    pub report_interval_ms: u64,
    pub grace_period_ms: u64,
    pub max_concurrent_jobs: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            books_dir: PathBuf::from("books"),
            styles_dir: PathBuf::from("styles"),
            crawler: CrawlerConfig::default(),
            translation: TranslationConfig::default(),
            pipeline: PipelineConfig::default(),
        }
    }
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            delay_ms: 1000,
            max_retries: 3,
            timeout_seconds: 30,
            user_agent: "Mozilla/5.0 (compatible; chapterflow/0.1)".to_owned(),
        }
    }
}

impl Default for TranslationConfig {
    fn default() -> Self {
        Self {
            chunk_size: 2000,
            chunk_overlap: 300,
            concurrent_requests: 3,
            max_retries: 3,
            retry_backoff_ms: 1000,
            polish: false,
            polish_retries: 1,
            progressive_glossary: true,
            glossary_sample_chapters: 5,
            glossary_sample_size: 3000,
            glossary_max_new_terms: 3,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 3,
            queue_capacity: 8,
            report_interval_ms: 3000,
            grace_period_ms: 5000,
            max_concurrent_jobs: 2,
        }
    }
}

impl AppConfig {
    /// Defaults overridden by environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let mut config = Self::default();
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_owned())
                .filter(|v| !v.is_empty())
        };

        if let Some(dir) = get("CHAPTERFLOW_BOOKS_DIR") {
            config.books_dir = PathBuf::from(dir);
        }
        if let Some(dir) = get("CHAPTERFLOW_STYLES_DIR") {
            config.styles_dir = PathBuf::from(dir);
        }

        let crawler = &mut config.crawler;
        override_parsed(&get, "CRAWLER_DELAY_MS", &mut crawler.delay_ms)?;
        override_parsed(&get, "CRAWLER_MAX_RETRIES", &mut crawler.max_retries)?;
        override_parsed(&get, "CRAWLER_TIMEOUT_SECONDS", &mut crawler.timeout_seconds)?;
        if let Some(agent) = get("CRAWLER_USER_AGENT") {
            crawler.user_agent = agent;
        }

        let tr = &mut config.translation;
        override_parsed(&get, "TRANSLATION_CHUNK_SIZE", &mut tr.chunk_size)?;
        override_parsed(&get, "TRANSLATION_CHUNK_OVERLAP", &mut tr.chunk_overlap)?;
        override_parsed(
            &get,
            "TRANSLATION_CONCURRENT_REQUESTS",
            &mut tr.concurrent_requests,
        )?;
        override_parsed(&get, "TRANSLATION_MAX_RETRIES", &mut tr.max_retries)?;
        override_parsed(&get, "TRANSLATION_RETRY_BACKOFF_MS", &mut tr.retry_backoff_ms)?;
        override_bool(&get, "TRANSLATION_POLISH", &mut tr.polish)?;
        override_parsed(&get, "TRANSLATION_POLISH_RETRIES", &mut tr.polish_retries)?;
        override_bool(
            &get,
            "TRANSLATION_PROGRESSIVE_GLOSSARY",
            &mut tr.progressive_glossary,
        )?;
        override_parsed(
            &get,
            "TRANSLATION_GLOSSARY_SAMPLE_CHAPTERS",
            &mut tr.glossary_sample_chapters,
        )?;
        override_parsed(
            &get,
            "TRANSLATION_GLOSSARY_SAMPLE_SIZE",
            &mut tr.glossary_sample_size,
        )?;
        override_parsed(
            &get,
            "TRANSLATION_GLOSSARY_MAX_NEW_TERMS",
            &mut tr.glossary_max_new_terms,
        )?;

        let pl = &mut config.pipeline;
        override_parsed(&get, "PIPELINE_WORKERS", &mut pl.workers)?;
        override_parsed(&get, "PIPELINE_QUEUE_CAPACITY", &mut pl.queue_capacity)?;
        override_parsed(&get, "PIPELINE_REPORT_INTERVAL_MS", &mut pl.report_interval_ms)?;
        override_parsed(&get, "PIPELINE_GRACE_PERIOD_MS", &mut pl.grace_period_ms)?;
        override_parsed(
            &get,
            "PIPELINE_MAX_CONCURRENT_JOBS",
            &mut pl.max_concurrent_jobs,
        )?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.translation.chunk_size == 0 {
            anyhow::bail!("translation chunk size must be > 0");
        }
        if self.translation.chunk_overlap >= self.translation.chunk_size {
            anyhow::bail!(
                "translation chunk overlap ({}) must be smaller than chunk size ({})",
                self.translation.chunk_overlap,
                self.translation.chunk_size
            );
        }
        if self.pipeline.queue_capacity == 0 {
            anyhow::bail!("pipeline queue capacity must be > 0");
        }
        Ok(())
    }
}

impl CrawlerConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

impl PipelineConfig {
    pub fn report_interval(&self) -> Duration {
        Duration::from_millis(self.report_interval_ms.max(1))
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

fn override_parsed<T>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    slot: &mut T,
) -> anyhow::Result<()>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    if let Some(raw) = get(key) {
        *slot = raw
            .parse::<T>()
            .with_context(|| format!("invalid {key}={raw:?}"))?;
    }
    Ok(())
}

fn override_bool(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    slot: &mut bool,
) -> anyhow::Result<()> {
    let Some(raw) = get(key) else {
        return Ok(());
    };
    *slot = parse_bool(&raw).with_context(|| format!("invalid {key}={raw:?}"))?;
    Ok(())
}

fn parse_bool(raw: &str) -> anyhow::Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => anyhow::bail!("expected a boolean, got {other}"),
    }
}
