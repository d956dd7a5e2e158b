//! riskwatch CLI — scheduled risk monitoring for web pages.
//!
//! Runs the HTTP API with the scheduler, manages jobs offline, executes
//! single checks in the foreground, and hosts a local webhook receiver.

mod api;
mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
