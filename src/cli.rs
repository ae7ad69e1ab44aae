use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::llm::LlmEngine;
use crate::pipeline::RunStage;

#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Cli {
    /// Root directory holding one directory per book (overrides `CHAPTERFLOW_BOOKS_DIR`).
    #[arg(long, global = true)]
    pub books_dir: Option<PathBuf>,

    /// Directory with `<name>.yaml` style templates (overrides `CHAPTERFLOW_STYLES_DIR`).
    #[arg(long, global = true)]
    pub styles_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Fetch and/or translate a book's chapters. Ctrl-C stops the run safely.
    Run(RunArgs),
    /// List books with chapters left to translate.
    Resumable,
    Book {
        #[command(subcommand)]
        command: BookCommand,
    },
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Book id (directory name under the books dir).
    #[arg(long)]
    pub book: String,

    #[arg(long, value_enum, default_value_t = RunStage::Full)]
    pub stage: RunStage,

    /// Translation workers (defaults to `PIPELINE_WORKERS`).
    #[arg(long)]
    pub workers: Option<usize>,

    /// Chapter range such as `1-10,15`.
    #[arg(long)]
    pub chapters: Option<String>,

    /// Reprocess chapters regardless of their status.
    #[arg(long, default_value_t = false)]
    pub force: bool,

    /// Style template name.
    #[arg(long, default_value = crate::style::DEFAULT_STYLE)]
    pub style: String,

    /// Do not load, use or grow the book glossary.
    #[arg(long, default_value_t = false)]
    pub no_glossary: bool,

    /// Polish each translated chunk with a second pass.
    #[arg(long, default_value_t = false)]
    pub polish: bool,

    #[command(flatten)]
    pub llm: LlmArgs,
}

#[derive(Debug, Args)]
pub struct LlmArgs {
    /// Translation engine.
    #[arg(long, value_enum, default_value_t = LlmEngine::Noop)]
    pub engine: LlmEngine,

    /// Target language.
    #[arg(long, default_value = "Vietnamese")]
    pub target_language: String,

    /// Program for `--engine command` (reads stdin, writes stdout).
    #[arg(long)]
    pub command: Option<String>,

    /// OpenAI model (for `--engine openai`).
    #[arg(long, default_value = "gpt-4.1-mini")]
    pub openai_model: String,

    /// OpenAI API base URL (for `--engine openai`).
    #[arg(long, default_value = crate::openai::DEFAULT_BASE_URL)]
    pub openai_base_url: String,

    /// Arguments passed to `--command` (after `--`).
    #[arg(last = true)]
    pub command_args: Vec<String>,
}

#[derive(Debug, Subcommand)]
pub enum BookCommand {
    /// Create `book.json` from a list of chapter URLs.
    Init(BookInitArgs),
    /// Show per-status chapter counts.
    Status(BookStatusArgs),
}

#[derive(Debug, Args)]
pub struct BookInitArgs {
    /// Book id (directory name under the books dir).
    #[arg(long)]
    pub book: String,

    /// Book index page; relative chapter URLs are resolved against it.
    #[arg(long)]
    pub url: String,

    /// Book title in the source language.
    #[arg(long)]
    pub title: String,

    /// Author name in the source language.
    #[arg(long, default_value = "")]
    pub author: String,

    /// One chapter per line: `URL` or `URL<TAB>title`. `#` starts a comment.
    #[arg(long, required_unless_present = "from_index", conflicts_with = "from_index")]
    pub chapters_file: Option<PathBuf>,

    /// Fetch `--url` and take the chapter list from its links.
    #[arg(long, default_value_t = false)]
    pub from_index: bool,

    /// Charset of the chapter pages.
    #[arg(long, default_value = "utf-8")]
    pub encoding: String,

    /// Overwrite an existing `book.json`.
    #[arg(long, default_value_t = false)]
    pub force: bool,
}

#[derive(Debug, Args)]
pub struct BookStatusArgs {
    /// Book id (directory name under the books dir).
    #[arg(long)]
    pub book: String,
}
