//! Command execution.

use crate::Commands;
use burrow_client::{NetClient, RecordingClient};
use burrow_protocol::WireBuffer;
use colored::Colorize;
use std::time::Duration;

const PUMP_INTERVAL: Duration = Duration::from_millis(5);

/// Executes a command and returns the formatted output.
pub async fn execute(
    client: &mut NetClient,
    recording: &RecordingClient,
    cmd: Commands,
    timeout: Duration,
) -> Result<String, Box<dyn std::error::Error>> {
    match cmd {
        Commands::Send {
            system,
            request,
            payload,
        } => {
            let payload = parse_hex_arg(&payload)?;
            send(client, system, request, payload, timeout).await?;
            Ok(format_response(recording))
        }

        Commands::Poll { .. } => {
            client.request_state();
            client.pump_until_response(PUMP_INTERVAL, timeout).await?;
            Ok(format_response(recording))
        }

        Commands::Echo { payload, system } => {
            let payload = parse_hex_arg(&payload)?;
            send(client, system, 1, payload.clone(), timeout).await?;

            match recording.last_update() {
                Some(update) if update.as_ref() == payload.as_slice() => Ok(format!(
                    "{} {} bytes from system {}",
                    "Echoed".green(),
                    payload.len(),
                    system.to_string().cyan()
                )),
                Some(update) => Ok(format!(
                    "{} sent {} but got {}",
                    "Mismatch:".red(),
                    hex::encode(&payload),
                    hex::encode(&update)
                )),
                None => Ok(format!("{} no state from system {}", "Missing:".yellow(), system)),
            }
        }
    }
}

async fn send(
    client: &mut NetClient,
    system: u32,
    request: u32,
    payload: Vec<u8>,
    timeout: Duration,
) -> Result<(), Box<dyn std::error::Error>> {
    client.schedule_send(
        system,
        request,
        Box::new(move |buf: &mut WireBuffer| buf.write_bytes(&payload)),
    );
    client.pump_until_response(PUMP_INTERVAL, timeout).await?;
    Ok(())
}

/// Parses a hex argument, ignoring whitespace.
fn parse_hex_arg(arg: &str) -> Result<Vec<u8>, hex::FromHexError> {
    let compact: String = arg.chars().filter(|c| !c.is_whitespace()).collect();
    hex::decode(compact)
}

/// Formats the acknowledgements and snapshots recorded so far.
fn format_response(recording: &RecordingClient) -> String {
    let mut output = String::new();
    for (request, id) in recording.accepted() {
        output.push_str(&format!(
            "  {} request {} as {}\n",
            "Accepted".green(),
            request,
            id.to_string().cyan()
        ));
    }
    match recording.last_update() {
        Some(update) => output.push_str(&format!("  State: {}", hex::encode(&update))),
        None => output.push_str(&format!("  State: {}", "none".dimmed())),
    }
    output
}
