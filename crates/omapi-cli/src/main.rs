//! OMAPI CLI: run a protocol listener or send a single request.

mod cli;
mod cmd;
mod ui;

use crate::cli::{Cli, Commands};
use clap::Parser;

fn init_tracing_stderr() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing_stderr();

    let config = omapi_types::load_config(cli.config.as_deref())
        .unwrap_or_else(|e| ui::fail(&e.to_string()));

    match cli.command {
        Commands::Serve { port, backlog } => cmd::serve::cmd_serve(config, port, backlog),
        Commands::Send {
            host,
            port,
            op,
            set,
            object,
            timeout,
            json,
        } => cmd::send::cmd_send(config, &host, port, &op, &set, &object, timeout, json),
    }
}
