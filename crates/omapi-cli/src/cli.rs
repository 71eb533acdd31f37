//! Clap CLI definitions for the `omapi` binary.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
\x1b[1;36mExamples:\x1b[0m
  omapi serve                               Listen on the default port (7911)
  omapi serve --port 9000                   Listen on another port
  omapi send --op open --set type=host      Send one message and print the reply
  omapi send --object name=ns1 --json       Attach object values, print JSON";

/// OMAPI: object management over a persistent TCP connection.
#[derive(Parser)]
#[command(name = "omapi", version, about, after_help = AFTER_HELP)]
pub struct Cli {
    /// Path to a TOML config file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Accept connections and answer every request with STATUS "ok".
    Serve {
        /// Port to listen on (overrides config).
        #[arg(long)]
        port: Option<u16>,
        /// Listen backlog (overrides config).
        #[arg(long)]
        backlog: Option<u32>,
    },
    /// Connect, send one message and print the reply.
    Send {
        /// Server host.
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        /// Server port (overrides config).
        #[arg(long)]
        port: Option<u16>,
        /// Opcode name: open, refresh, update, notify, status, delete.
        #[arg(long, default_value = "open")]
        op: String,
        /// Message value NAME=VALUE; numeric values are sent as integers.
        #[arg(long = "set", value_name = "NAME=VALUE", value_parser = parse_pair)]
        set: Vec<(String, String)>,
        /// Attached object value NAME=VALUE.
        #[arg(long = "object", value_name = "NAME=VALUE", value_parser = parse_pair)]
        object: Vec<(String, String)>,
        /// Seconds to wait for the handshake and for the reply.
        #[arg(long, default_value_t = 10)]
        timeout: u64,
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },
}

/// Parse `NAME=VALUE`.
pub fn parse_pair(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name.to_string(), value.to_string())),
        _ => Err(format!("expected NAME=VALUE, got '{raw}'")),
    }
}
