mod bridges;
mod cli;
mod compose;
mod config;
mod error;
mod generator;
mod logging;
mod matrix;
mod orchestrator;
#[cfg(feature = "tui")]
mod tui;

use clap::Parser;

#[tokio::main]
async fn main() {
    let args = cli::Cli::parse();

    if let Err(e) = cli::run(args).await {
        tracing::error!("{e:#}");
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}
