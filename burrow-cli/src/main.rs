//! burrow-cli - Command-line client for burrow
//!
//! Sends command batches to a server and prints the acknowledgements and
//! state snapshots that come back.

mod commands;

use burrow_client::{ClientConfig, NetClient, RecordingClient, SystemClient};
use burrow_protocol::Id;
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "burrow-cli")]
#[command(about = "Command-line client for the burrow RPC tunnel")]
#[command(version)]
struct Cli {
    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:8080")]
    server: SocketAddr,

    /// Host header value (defaults to the server address)
    #[arg(long)]
    host: Option<String>,

    /// Session id as 32 hex digits (random if omitted)
    #[arg(long, env = "BURROW_SESSION")]
    session: Option<String>,

    /// Caller id as 32 hex digits (random if omitted)
    #[arg(long, env = "BURROW_CALLER")]
    caller: Option<String>,

    /// Seconds to wait for the response
    #[arg(long, default_value = "10")]
    timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send one command and print the response
    Send {
        /// System number
        #[arg(short = 'S', long)]
        system: u32,

        /// Request number echoed back in the acknowledgement
        #[arg(short, long, default_value = "1")]
        request: u32,

        /// Command payload as hex
        payload: String,
    },

    /// Send an empty batch and print the state a system reports
    Poll {
        /// System number
        #[arg(short = 'S', long, default_value = "1")]
        system: u32,
    },

    /// Send a payload to the echo system and verify it comes back
    Echo {
        /// Payload as hex
        #[arg(default_value = "010000000000000003040506")]
        payload: String,

        /// Echo system number
        #[arg(short = 'S', long, default_value = "1")]
        system: u32,
    },
}

impl Commands {
    fn system(&self) -> u32 {
        match self {
            Commands::Send { system, .. }
            | Commands::Poll { system }
            | Commands::Echo { system, .. } => *system,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = ClientConfig::new(cli.server);
    if let Some(ref host) = cli.host {
        config = config.with_host(host.clone());
    }
    if let Some(ref session) = cli.session {
        config = config.with_session_id(parse_id(session)?);
    }
    if let Some(ref caller) = cli.caller {
        config = config.with_caller_id(parse_id(caller)?);
    }

    let recording = Arc::new(RecordingClient::new(cli.command.system()));
    let mut client = NetClient::new(
        config,
        [recording.clone() as Arc<dyn SystemClient>],
        Handle::current(),
    )?;

    let timeout = Duration::from_secs(cli.timeout);
    match commands::execute(&mut client, &recording, cli.command, timeout).await {
        Ok(output) => {
            println!("{}", output);
        }
        Err(e) => {
            eprintln!("{}: {}", "Error".red(), e);
            std::process::exit(1);
        }
    }

    client.disconnect();
    Ok(())
}

/// Parses an id written as 32 hex digits, first word first.
fn parse_id(text: &str) -> Result<Id, Box<dyn std::error::Error>> {
    let bytes = hex::decode(text.trim())?;
    let words: [u8; 16] = bytes
        .try_into()
        .map_err(|_| "an id is exactly 16 bytes (32 hex digits)")?;
    let mut first = [0u8; 8];
    let mut second = [0u8; 8];
    first.copy_from_slice(&words[..8]);
    second.copy_from_slice(&words[8..]);
    Ok(Id::new(u64::from_be_bytes(first), u64::from_be_bytes(second)))
}
