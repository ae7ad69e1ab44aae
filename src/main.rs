use std::process::ExitCode;

use anyhow::Context as _;
use clap::Parser as _;

use chapterflow::cli::{BookCommand, Cli, Command};
use chapterflow::config::AppConfig;

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(err) = try_main().await {
        eprintln!("{err:#}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

async fn try_main() -> anyhow::Result<()> {
    chapterflow::logging::init().context("init logging")?;

    let cli = Cli::parse();
    tracing::debug!(?cli, "parsed cli");

    let mut config = AppConfig::from_env().context("load config")?;
    if let Some(dir) = cli.books_dir {
        config.books_dir = dir;
    }
    if let Some(dir) = cli.styles_dir {
        config.styles_dir = dir;
    }

    match cli.command {
        Command::Run(args) => {
            chapterflow::commands::run(args, config).await.context("run")?;
        }
        Command::Resumable => {
            chapterflow::commands::resumable(&config)
                .await
                .context("resumable")?;
        }
        Command::Book {
            command: BookCommand::Init(args),
        } => {
            chapterflow::commands::book_init(args, &config)
                .await
                .context("book init")?;
        }
        Command::Book {
            command: BookCommand::Status(args),
        } => {
            chapterflow::commands::book_status(args, &config)
                .await
                .context("book status")?;
        }
    }

    Ok(())
}
