mod app;
mod cmd;
mod config;
mod core;
mod platform;

use anyhow::Result;
use clap::Parser;

use crate::config::Cli;
use crate::config::Commands;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();

    match cli.command {
        Commands::Monitor(args) => cmd::run_monitor(args).await,
        Commands::Register(args) => cmd::run_register(args).await,
        Commands::Allocate(args) => cmd::run_allocate(*args).await,
        Commands::ShowShm(args) => cmd::run_show_shm(args).await,
    }
}
