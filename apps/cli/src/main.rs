//! regwatch CLI: regulatory announcement ingestion and relevance scoring.
//!
//! Runs the ingestion pipeline once, replays single stages, serves the HTTP
//! control API, and records subscriber feedback.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
