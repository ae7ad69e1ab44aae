#![forbid(unsafe_code)]

pub mod app;
pub mod book;
pub mod cli;
pub mod commands;
pub mod config;
pub mod events;
pub mod extract;
pub mod fetch;
pub mod glossary;
pub mod json_file;
pub mod llm;
pub mod logging;
pub mod openai;
pub mod pipeline;
pub mod progress;
pub mod style;
pub mod translate;
