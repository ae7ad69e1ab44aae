use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::TranslationConfig;
use crate::glossary::{Glossary, GlossaryEntry, SharedGlossary};
use crate::style::StyleTemplate;

const DIALOGUE_QUOTES: &[char] = &['"', '“', '”', '「', '」', '『', '』'];
const DIALOGUE_MARKERS: &[&str] = &["说道", "道：", "说：", "问道", "笑道", "叫道"];
const SENTENCE_ENDS: &[char] = &['。', '！', '？', '.', '!', '?'];
/// Short narration wedged between two dialogue paragraphs stays in the block.
const INTERJECTION_MAX_CHARS: usize = 100;

/// Prompt material handed to the backend with every request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TranslateContext {
    pub style: String,
    pub glossary: String,
    /// Source text immediately preceding the chunk, for continuity only.
    pub context: Option<String>,
}

/// The model that actually turns text into the target language.
#[async_trait]
pub trait TranslateBackend: Send + Sync {
    async fn translate(&self, text: &str, ctx: &TranslateContext) -> anyhow::Result<String>;

    async fn polish(
        &self,
        _source: &str,
        draft: &str,
        _ctx: &TranslateContext,
    ) -> anyhow::Result<String> {
        Ok(draft.to_owned())
    }

    async fn translate_title(&self, title: &str, ctx: &TranslateContext) -> anyhow::Result<String> {
        self.translate(title, ctx).await
    }

    /// Proposes up to `max` terms from `text` that `known` does not cover yet.
    async fn extract_terms(
        &self,
        _text: &str,
        _known: &Glossary,
        _max: usize,
    ) -> anyhow::Result<Vec<GlossaryEntry>> {
        Ok(Vec::new())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TranslateError {
    #[error("chunk {index} failed after {attempts} attempt(s): {message}")]
    Chunk {
        index: usize,
        attempts: usize,
        message: String,
    },
    #[error("nothing to translate")]
    Empty,
    #[error("translation cancelled")]
    Cancelled,
    #[error("chunk task aborted: {0}")]
    Join(String),
}

/// One unit of work sent to the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub text: String,
    pub context: Option<String>,
}

#[derive(Clone)]
pub struct Translator {
    backend: Arc<dyn TranslateBackend>,
    config: TranslationConfig,
}

impl Translator {
    pub fn new(backend: Arc<dyn TranslateBackend>, config: &TranslationConfig) -> Self {
        Self {
            backend,
            config: config.clone(),
        }
    }

    pub fn config(&self) -> &TranslationConfig {
        &self.config
    }

    /// Splits `text` into chunks of at most `chunk_size` characters.
    ///
    /// Paragraph boundaries are respected. A run of dialogue paragraphs is kept
    /// together when it fits in one chunk with up to 20% overflow. Paragraphs
    /// longer than a chunk are split on sentence terminators, then by length.
    pub fn chunk_text(&self, text: &str) -> Vec<String> {
        let chunk_size = self.config.chunk_size.max(1);
        let dialogue_limit = chunk_size + chunk_size / 5;
        let normalized = text.replace("\r\n", "\n");
        let paragraphs: Vec<&str> = normalized
            .split("\n\n")
            .map(|p| p.trim_matches('\n'))
            .filter(|p| !p.trim().is_empty())
            .collect();

        let mut builder = ChunkBuilder::new(chunk_size);
        let mut i = 0;
        while i < paragraphs.len() {
            let para = paragraphs[i];

            if is_dialogue(para) {
                let end = dialogue_block_end(&paragraphs, i);
                let block = &paragraphs[i..=end];
                let block_len = joined_len(block);
                if builder.fits(block_len) {
                    builder.extend(block, block_len);
                    i = end + 1;
                    continue;
                }
                if block_len <= dialogue_limit {
                    builder.flush();
                    builder.extend(block, block_len);
                    i = end + 1;
                    continue;
                }
            }

            let para_len = char_len(para);
            if para_len > chunk_size {
                builder.flush();
                let mut pieces = split_long_paragraph(para, chunk_size);
                let last = pieces.pop();
                for piece in pieces {
                    builder.push_chunk(piece);
                }
                if let Some(last) = last {
                    let len = char_len(&last);
                    builder.extend(&[last.as_str()], len);
                }
            } else {
                if !builder.fits(para_len) {
                    builder.flush();
                }
                builder.extend(&[para], para_len);
            }
            i += 1;
        }
        builder.finish()
    }

    /// Chunks paired with the tail of the preceding chunk as context.
    pub fn chunks(&self, text: &str) -> Vec<Chunk> {
        let raw = self.chunk_text(text);
        let overlap = self.config.chunk_overlap;
        raw.iter()
            .enumerate()
            .map(|(i, chunk)| Chunk {
                text: chunk.clone(),
                context: (i > 0 && overlap > 0).then(|| tail_chars(&raw[i - 1], overlap)),
            })
            .collect()
    }

    /// Translates one chapter body, chunk by chunk, preserving chunk order.
    pub async fn translate(
        &self,
        content: &str,
        glossary: &SharedGlossary,
        style: &StyleTemplate,
        cancel: &CancellationToken,
    ) -> Result<String, TranslateError> {
        let chunks = self.chunks(content);
        if chunks.is_empty() {
            return Err(TranslateError::Empty);
        }

        let style_prompt = style.to_prompt();
        let glossary_prompt = glossary.prompt().await;
        let concurrency = self.config.concurrent_requests.max(1).min(chunks.len());
        let total = chunks.len();

        let mut join_set = tokio::task::JoinSet::new();
        let mut pending = chunks.into_iter().enumerate();
        let mut results: Vec<Option<String>> = vec![None; total];

        loop {
            while join_set.len() < concurrency {
                let Some((index, chunk)) = pending.next() else {
                    break;
                };
                let ctx = TranslateContext {
                    style: style_prompt.clone(),
                    glossary: glossary_prompt.clone(),
                    context: chunk.context,
                };
                let worker = self.clone();
                join_set.spawn(async move {
                    let outcome = worker.translate_chunk(index, &chunk.text, &ctx).await;
                    (index, outcome)
                });
            }

            let joined = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    join_set.abort_all();
                    return Err(TranslateError::Cancelled);
                }
                joined = join_set.join_next() => joined,
            };
            let Some(joined) = joined else {
                break;
            };
            let (index, outcome) = joined.map_err(|err| TranslateError::Join(err.to_string()))?;
            match outcome {
                Ok(text) => results[index] = Some(text),
                Err(err) => {
                    join_set.abort_all();
                    return Err(err);
                }
            }
        }

        let mut out = Vec::with_capacity(total);
        for (index, text) in results.into_iter().enumerate() {
            out.push(text.ok_or_else(|| TranslateError::Chunk {
                index,
                attempts: 0,
                message: "missing chunk result".to_owned(),
            })?);
        }
        tracing::debug!(chunks = total, concurrency, "chapter translated");
        Ok(out.join("\n\n"))
    }

    async fn translate_chunk(
        &self,
        index: usize,
        text: &str,
        ctx: &TranslateContext,
    ) -> Result<String, TranslateError> {
        let attempts = self.config.max_retries.saturating_add(1);
        let mut backoff = Duration::from_millis(self.config.retry_backoff_ms);
        let mut last_error = String::new();

        let mut draft = None;
        for attempt in 1..=attempts {
            match self.backend.translate(text, ctx).await {
                Ok(out) if !out.trim().is_empty() => {
                    draft = Some(out.trim().to_owned());
                    break;
                }
                Ok(_) => last_error = "translation output is empty".to_owned(),
                Err(err) => last_error = format!("{err:#}"),
            }
            tracing::warn!(chunk = index, attempt, attempts, error = %last_error, "chunk translation failed");
            if attempt < attempts {
                tokio::time::sleep(backoff).await;
                backoff = backoff.saturating_mul(2);
            }
        }
        let Some(draft) = draft else {
            return Err(TranslateError::Chunk {
                index,
                attempts,
                message: last_error,
            });
        };

        if !self.config.polish {
            return Ok(draft);
        }
        Ok(self.polish_chunk(index, text, draft, ctx).await)
    }

    /// Best-effort second pass; any failure keeps the draft.
    async fn polish_chunk(
        &self,
        index: usize,
        source: &str,
        draft: String,
        ctx: &TranslateContext,
    ) -> String {
        let attempts = self.config.polish_retries.saturating_add(1);
        for attempt in 1..=attempts {
            match self.backend.polish(source, &draft, ctx).await {
                Ok(polished) if !polished.trim().is_empty() => return polished.trim().to_owned(),
                Ok(_) => {
                    tracing::warn!(chunk = index, attempt, attempts, "polish returned empty output");
                }
                Err(err) => {
                    tracing::warn!(chunk = index, attempt, attempts, err = %format!("{err:#}"), "polish failed");
                }
            }
        }
        tracing::info!(chunk = index, "keeping unpolished draft");
        draft
    }

    /// Returns `None` when the title could not be translated.
    pub async fn translate_title(
        &self,
        title: &str,
        glossary: &SharedGlossary,
        style: &StyleTemplate,
    ) -> Option<String> {
        if title.trim().is_empty() {
            return None;
        }
        let ctx = TranslateContext {
            style: style.to_prompt(),
            glossary: glossary.prompt().await,
            context: None,
        };
        match self.backend.translate_title(title, &ctx).await {
            Ok(out) if !out.trim().is_empty() => Some(out.trim().to_owned()),
            Ok(_) => None,
            Err(err) => {
                tracing::warn!(title, err = %format!("{err:#}"), "title translation failed");
                None
            }
        }
    }

    /// Asks the backend for terms introduced by `source` and merges the new ones.
    pub async fn grow_glossary(
        &self,
        book_dir: &Path,
        source: &str,
        glossary: &SharedGlossary,
    ) -> usize {
        if !self.config.progressive_glossary || self.config.glossary_max_new_terms == 0 {
            return 0;
        }
        self.merge_terms(book_dir, source, glossary, self.config.glossary_max_new_terms)
            .await
    }

    /// Builds an initial glossary from a few raw chapters when none exists yet.
    pub async fn seed_glossary(
        &self,
        book_dir: &Path,
        samples: &[String],
        glossary: &SharedGlossary,
    ) -> usize {
        if !self.config.progressive_glossary || samples.is_empty() || glossary.len().await > 0 {
            return 0;
        }
        let text = samples
            .iter()
            .take(self.config.glossary_sample_chapters)
            .map(|s| head_chars(s, self.config.glossary_sample_size))
            .collect::<Vec<_>>()
            .join("\n\n");
        let max = self
            .config
            .glossary_max_new_terms
            .max(1)
            .saturating_mul(samples.len().max(1));
        let added = self.merge_terms(book_dir, &text, glossary, max).await;
        tracing::info!(samples = samples.len(), added, "glossary seeded");
        added
    }

    async fn merge_terms(
        &self,
        book_dir: &Path,
        text: &str,
        glossary: &SharedGlossary,
        max: usize,
    ) -> usize {
        let known = glossary.snapshot().await;
        let terms = match self.backend.extract_terms(text, &known, max).await {
            Ok(terms) => terms,
            Err(err) => {
                tracing::warn!(err = %format!("{err:#}"), "glossary term extraction failed");
                return 0;
            }
        };
        let fresh: Vec<GlossaryEntry> = terms
            .into_iter()
            .filter(|t| !known.contains(&t.source))
            .take(max)
            .collect();
        if fresh.is_empty() {
            return 0;
        }
        match glossary.grow(book_dir, fresh).await {
            Ok(added) => added,
            Err(err) => {
                tracing::warn!(err = %format!("{err:#}"), "failed to persist glossary growth");
                0
            }
        }
    }
}

struct ChunkBuilder {
    limit: usize,
    chunks: Vec<String>,
    current: Vec<String>,
    current_len: usize,
}

impl ChunkBuilder {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            chunks: Vec::new(),
            current: Vec::new(),
            current_len: 0,
        }
    }

    fn fits(&self, len: usize) -> bool {
        let needed = if self.current.is_empty() {
            len
        } else {
            self.current_len + 2 + len
        };
        needed <= self.limit
    }

    fn extend(&mut self, paragraphs: &[&str], len: usize) {
        if !self.current.is_empty() {
            self.current_len += 2;
        }
        self.current.extend(paragraphs.iter().map(|p| (*p).to_owned()));
        self.current_len += len;
    }

    fn push_chunk(&mut self, chunk: String) {
        self.flush();
        self.chunks.push(chunk);
    }

    fn flush(&mut self) {
        if self.current.is_empty() {
            return;
        }
        self.chunks.push(self.current.join("\n\n"));
        self.current.clear();
        self.current_len = 0;
    }

    fn finish(mut self) -> Vec<String> {
        self.flush();
        self.chunks
    }
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

fn joined_len(paragraphs: &[&str]) -> usize {
    let chars: usize = paragraphs.iter().map(|p| char_len(p)).sum();
    chars + 2 * paragraphs.len().saturating_sub(1)
}

fn is_dialogue(para: &str) -> bool {
    para.contains(DIALOGUE_QUOTES) || DIALOGUE_MARKERS.iter().any(|m| para.contains(m))
}

fn dialogue_block_end(paragraphs: &[&str], start: usize) -> usize {
    let mut end = start;
    for i in start..paragraphs.len() {
        if is_dialogue(paragraphs[i]) {
            end = i;
            continue;
        }
        let bridges = char_len(paragraphs[i]) < INTERJECTION_MAX_CHARS
            && paragraphs.get(i + 1).is_some_and(|next| is_dialogue(next));
        if !bridges {
            break;
        }
    }
    end
}

/// Greedily packs sentences into pieces of at most `limit` characters.
fn split_long_paragraph(para: &str, limit: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for sentence in split_sentences(para) {
        let len = char_len(sentence);
        if len > limit {
            if !current.is_empty() {
                pieces.push(std::mem::take(&mut current));
                current_len = 0;
            }
            let chars: Vec<char> = sentence.chars().collect();
            pieces.extend(chars.chunks(limit).map(|c| c.iter().collect::<String>()));
        } else if current_len + len > limit {
            pieces.push(std::mem::replace(&mut current, sentence.to_owned()));
            current_len = len;
        } else {
            current.push_str(sentence);
            current_len += len;
        }
    }
    if !current.is_empty() {
        pieces.push(current);
    }
    pieces
}

/// Sentences with their terminator attached.
fn split_sentences(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    for (i, c) in text.char_indices() {
        if SENTENCE_ENDS.contains(&c) {
            let end = i + c.len_utf8();
            out.push(&text[start..end]);
            start = end;
        }
    }
    if start < text.len() {
        out.push(&text[start..]);
    }
    out
}

fn tail_chars(s: &str, n: usize) -> String {
    let len = char_len(s);
    s.chars().skip(len.saturating_sub(n)).collect()
}

fn head_chars(s: &str, n: usize) -> String {
    s.chars().take(n).collect()
}
