use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::AsyncWriteExt as _;

use crate::glossary::{Glossary, GlossaryEntry};
use crate::openai::ResponsesClient;
use crate::translate::{TranslateBackend, TranslateContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LlmEngine {
    /// Returns the source text unchanged.
    Noop,
    /// Pipes each chunk through an external program (stdin to stdout).
    Command,
    /// Calls the OpenAI Responses API.
    Openai,
}

#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub engine: LlmEngine,
    pub target_language: String,
    pub command: Option<String>,
    pub command_args: Vec<String>,
    pub openai_model: String,
    pub openai_base_url: String,
    pub openai_temperature: f32,
    pub openai_timeout: Duration,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            engine: LlmEngine::Noop,
            target_language: "Vietnamese".to_owned(),
            command: None,
            command_args: Vec::new(),
            openai_model: "gpt-4.1-mini".to_owned(),
            openai_base_url: crate::openai::DEFAULT_BASE_URL.to_owned(),
            openai_temperature: 0.7,
            openai_timeout: Duration::from_secs(300),
        }
    }
}

/// Builds the backend selected by `settings.engine`.
pub fn backend(settings: &LlmSettings) -> anyhow::Result<Arc<dyn TranslateBackend>> {
    let backend: Arc<dyn TranslateBackend> = match settings.engine {
        LlmEngine::Noop => Arc::new(NoopBackend),
        LlmEngine::Command => {
            let Some(program) = settings.command.clone() else {
                anyhow::bail!("missing --command (required when --engine=command)");
            };
            Arc::new(CommandBackend {
                program,
                args: settings.command_args.clone(),
                target_language: settings.target_language.clone(),
            })
        }
        LlmEngine::Openai => {
            let api_key = std::env::var("OPENAI_API_KEY")
                .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY is not set"))?;
            Arc::new(OpenAiBackend::new(
                ResponsesClient::new(
                    &settings.openai_base_url,
                    api_key,
                    &settings.openai_model,
                    settings.openai_temperature,
                    settings.openai_timeout,
                )?,
                &settings.target_language,
            ))
        }
    };
    tracing::info!(engine = ?settings.engine, "translation backend ready");
    Ok(backend)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopBackend;

#[async_trait]
impl TranslateBackend for NoopBackend {
    async fn translate(&self, text: &str, _ctx: &TranslateContext) -> anyhow::Result<String> {
        Ok(text.to_owned())
    }
}

/// Runs `program args..` once per request with the text on stdin.
///
/// Prompt material is exported through `CHAPTERFLOW_*` environment variables
/// so wrapper scripts can build their own prompt.
#[derive(Debug, Clone)]
pub struct CommandBackend {
    program: String,
    args: Vec<String>,
    target_language: String,
}

impl CommandBackend {
    pub fn new(program: impl Into<String>, args: Vec<String>, target_language: &str) -> Self {
        Self {
            program: program.into(),
            args,
            target_language: target_language.to_owned(),
        }
    }

    async fn run(&self, task: &str, input: &str, ctx: &TranslateContext) -> anyhow::Result<String> {
        tracing::debug!(engine = "command", command = %self.program, task, "spawn translator");
        let mut child = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .env("CHAPTERFLOW_TASK", task)
            .env("CHAPTERFLOW_TRANSLATE_TO", &self.target_language)
            .env("CHAPTERFLOW_STYLE_PROMPT", &ctx.style)
            .env("CHAPTERFLOW_GLOSSARY_PROMPT", &ctx.glossary)
            .env("CHAPTERFLOW_CONTEXT", ctx.context.as_deref().unwrap_or(""))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawn translator command: {}", self.program))?;

        {
            let mut stdin = child.stdin.take().context("open translator stdin")?;
            stdin
                .write_all(input.as_bytes())
                .await
                .context("write translator stdin")?;
        }

        let output = child
            .wait_with_output()
            .await
            .context("wait translator process")?;
        if !output.status.success() {
            anyhow::bail!(
                "translator command failed: {} ({})",
                self.program,
                output.status
            );
        }
        String::from_utf8(output.stdout).context("translator stdout is not valid UTF-8")
    }
}

#[async_trait]
impl TranslateBackend for CommandBackend {
    async fn translate(&self, text: &str, ctx: &TranslateContext) -> anyhow::Result<String> {
        self.run("translate", text, ctx).await
    }

    async fn translate_title(&self, title: &str, ctx: &TranslateContext) -> anyhow::Result<String> {
        self.run("title", title, ctx).await
    }
}

pub struct OpenAiBackend {
    client: ResponsesClient,
    target_language: String,
}

impl OpenAiBackend {
    pub fn new(client: ResponsesClient, target_language: &str) -> Self {
        Self {
            client,
            target_language: target_language.to_owned(),
        }
    }

    fn translate_instructions(&self, ctx: &TranslateContext) -> String {
        format!(
            "You are a professional literary translator.\n\
Task: Translate the Chinese web-novel text between BEGIN_SOURCE and END_SOURCE into {to}.\n\
\n\
{style}\n\
Hard rules:\n\
- Keep the paragraph structure and line breaks.\n\
- Use glossary terms exactly as given.\n\
- Do not summarize and do not add commentary or notes.\n\
- The PREVIOUS_CONTEXT block is for continuity only; never translate it.\n\
\n\
Output:\n- Output ONLY the translated text.\n",
            to = self.target_language,
            style = ctx.style,
        )
    }

    fn user_input(ctx: &TranslateContext, text: &str) -> String {
        let mut parts = Vec::new();
        if !ctx.glossary.is_empty() {
            parts.push(format!("GLOSSARY\n{}\n", ctx.glossary));
        }
        if let Some(context) = ctx.context.as_deref() {
            parts.push(format!("PREVIOUS_CONTEXT\n{context}\n"));
        }
        parts.push(format!("BEGIN_SOURCE\n{text}\nEND_SOURCE"));
        parts.join("\n")
    }
}

#[async_trait]
impl TranslateBackend for OpenAiBackend {
    async fn translate(&self, text: &str, ctx: &TranslateContext) -> anyhow::Result<String> {
        let instructions = self.translate_instructions(ctx);
        self.client
            .text(&instructions, &Self::user_input(ctx, text))
            .await
            .with_context(|| format!("translate via OpenAI ({})", self.client.model()))
    }

    async fn polish(
        &self,
        source: &str,
        draft: &str,
        ctx: &TranslateContext,
    ) -> anyhow::Result<String> {
        let instructions = format!(
            "You are a senior editor of {to} web fiction.\n\
You receive a source text and a draft translation. Edit the draft so it reads naturally \
while keeping the exact meaning and the paragraph structure.\n\
{style}\n\
Rules:\n\
- If a sentence is already good, keep it unchanged.\n\
- Never add, drop, or reorder content.\n\
- Output ONLY the edited translation.\n",
            to = self.target_language,
            style = ctx.style,
        );
        let mut input = String::new();
        if !ctx.glossary.is_empty() {
            input.push_str(&format!("GLOSSARY\n{}\n\n", ctx.glossary));
        }
        input.push_str(&format!(
            "BEGIN_SOURCE\n{source}\nEND_SOURCE\n\nBEGIN_DRAFT\n{draft}\nEND_DRAFT"
        ));
        self.client
            .text(&instructions, &input)
            .await
            .context("polish via OpenAI")
    }

    async fn translate_title(&self, title: &str, ctx: &TranslateContext) -> anyhow::Result<String> {
        let instructions = format!(
            "Translate the chapter title between BEGIN_SOURCE and END_SOURCE into {to}. \
Keep chapter numbering (e.g. 第一章 惊蛰 -> Chương 1: Kinh Trập). Output ONLY the title.",
            to = self.target_language,
        );
        let input = Self::user_input(
            &TranslateContext {
                context: None,
                ..ctx.clone()
            },
            title,
        );
        let out = self
            .client
            .text(&instructions, &input)
            .await
            .context("translate title via OpenAI")?;
        Ok(out.lines().next().unwrap_or_default().trim().to_owned())
    }

    async fn extract_terms(
        &self,
        text: &str,
        known: &Glossary,
        max: usize,
    ) -> anyhow::Result<Vec<GlossaryEntry>> {
        let instructions = format!(
            "Find at most {max} recurring proper nouns or genre terms in the text between \
BEGIN_TERMS_SOURCE and END_TERMS_SOURCE that are NOT in the known list, and give their {to} \
translation. Categories: character, realm, technique, location, item, organization, general.\n\
Reply with a JSON array only: [{{\"source\": \"..\", \"target\": \"..\", \"category\": \"..\"}}]",
            to = self.target_language,
        );
        let known_terms = known
            .entries()
            .iter()
            .map(|e| e.source.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        let input = format!("KNOWN\n{known_terms}\n\nBEGIN_TERMS_SOURCE\n{text}\nEND_TERMS_SOURCE");
        let raw = self
            .client
            .text(&instructions, &input)
            .await
            .context("extract glossary terms via OpenAI")?;
        let mut terms = parse_terms(&raw)?;
        terms.truncate(max);
        Ok(terms)
    }
}

#[derive(Debug, Deserialize)]
struct ProposedTerm {
    source: String,
    target: String,
    #[serde(default)]
    category: Option<String>,
}

/// Accepts a bare JSON array, optionally wrapped in a code fence.
fn parse_terms(raw: &str) -> anyhow::Result<Vec<GlossaryEntry>> {
    let start = raw.find('[').context("term list has no JSON array")?;
    let end = raw.rfind(']').context("term list has no JSON array")?;
    if end < start {
        anyhow::bail!("term list has no JSON array");
    }
    let proposed: Vec<ProposedTerm> =
        serde_json::from_str(&raw[start..=end]).context("parse term list")?;
    Ok(proposed
        .into_iter()
        .filter(|t| !t.source.trim().is_empty() && !t.target.trim().is_empty())
        .map(|t| {
            let entry = GlossaryEntry::new(t.source.trim(), t.target.trim());
            match t.category {
                Some(category) if !category.trim().is_empty() => {
                    entry.with_category(category.trim())
                }
                _ => entry,
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_terms_tolerates_fences_and_blanks() {
        let raw = "```json\n[{\"source\":\"宁姚\",\"target\":\"Ninh Diêu\",\"category\":\"character\"},\
{\"source\":\" \",\"target\":\"x\"},{\"source\":\"剑气\",\"target\":\"kiếm khí\"}]\n```";
        let terms = parse_terms(raw).unwrap();
        assert_eq!(terms.len(), 2);
        assert_eq!(terms[0].category, "character");
        assert_eq!(terms[1].category, "general");
        assert!(parse_terms("no terms").is_err());
    }

    #[test]
    fn command_engine_requires_program() {
        let settings = LlmSettings {
            engine: LlmEngine::Command,
            ..LlmSettings::default()
        };
        let err = backend(&settings).err().unwrap();
        assert!(err.to_string().contains("--command"));
    }

    #[tokio::test]
    async fn command_backend_pipes_stdin_to_stdout() {
        let backend = CommandBackend::new(
            "sh",
            vec!["-c".to_owned(), "printf '%s:' \"$CHAPTERFLOW_TASK\"; cat".to_owned()],
            "Vietnamese",
        );
        let out = backend
            .translate("你好", &TranslateContext::default())
            .await
            .unwrap();
        assert_eq!(out, "translate:你好");
    }

    #[tokio::test]
    async fn failing_command_is_an_error() {
        let backend = CommandBackend::new("sh", vec!["-c".to_owned(), "exit 3".to_owned()], "vi");
        assert!(
            backend
                .translate("x", &TranslateContext::default())
                .await
                .is_err()
        );
    }
}
