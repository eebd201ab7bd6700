use std::io;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

mod commands;
mod error;
mod utils;

#[derive(Parser)]
#[command(name = "rummage")]
#[command(about = "List the files in a container image without extracting it")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List files in a container image, like tar -t or tar -tv
    List(commands::list::ListArgs),
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::debug!("interrupted, cancelling");
            on_interrupt.cancel();
        }
    });

    let result = match cli.command {
        Commands::List(args) => commands::list::execute(args, &cancel).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        // A closed pipe (e.g. `rummage list img | head`) is not worth reporting.
        Err(e) if utils::is_broken_pipe(&e) => ExitCode::SUCCESS,
        Err(e) => {
            utils::print_error(&format!("{e:#}"));
            ExitCode::FAILURE
        }
    }
}
