//! Operator console for the relay
//!
//! Reads one command per line from stdin. `authority <node>` is the only way
//! to move the time authority once the relay is running.

use crate::router::RelayRouter;
use std::sync::Arc;
use timesync_timing::is_valid_sender_id;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Console command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminCommand {
    SetAuthority(String),
    Peers,
    Status,
    Help,
}

const HELP: &str = "commands: authority <node> | peers | status | help";

/// Parse one console line; `Ok(None)` for a blank line
pub fn parse_command(line: &str) -> Result<Option<AdminCommand>, String> {
    let mut words = line.split_whitespace();
    let Some(command) = words.next() else {
        return Ok(None);
    };

    let parsed = match command.to_ascii_lowercase().as_str() {
        "authority" => match (words.next(), words.next()) {
            (Some(node), None) if is_valid_sender_id(node) => {
                AdminCommand::SetAuthority(node.to_string())
            }
            (Some(node), None) => return Err(format!("invalid node id: {}", node)),
            _ => return Err("usage: authority <node>".to_string()),
        },
        "peers" => AdminCommand::Peers,
        "status" => AdminCommand::Status,
        "help" | "?" => AdminCommand::Help,
        other => return Err(format!("unknown command: {} ({})", other, HELP)),
    };

    if words.next().is_some() && !matches!(parsed, AdminCommand::SetAuthority(_)) {
        return Err(format!("unexpected arguments ({})", HELP));
    }
    Ok(Some(parsed))
}

/// Run a command against the router and render the reply
pub fn execute(router: &RelayRouter, command: AdminCommand) -> String {
    match command {
        AdminCommand::SetAuthority(node) => match router.set_authority(&node) {
            Some(previous) if previous == node => format!("{} is already the time authority", node),
            Some(previous) => format!("time authority moved from {} to {}", previous, node),
            None => format!("time authority set to {}", node),
        },
        AdminCommand::Peers => {
            let authority = router.authority();
            let peers = router.peers();
            if peers.is_empty() {
                return "no nodes connected".to_string();
            }
            peers
                .into_iter()
                .map(|(id, connected_at_ms)| {
                    let since = chrono::DateTime::from_timestamp_millis(connected_at_ms)
                        .map(|t| t.format("%H:%M:%S").to_string())
                        .unwrap_or_default();
                    let marker = if authority.as_deref() == Some(id.as_str()) { " (authority)" } else { "" };
                    format!("{}{} connected since {}", id, marker, since)
                })
                .collect::<Vec<_>>()
                .join("\n")
        }
        AdminCommand::Status => serde_json::to_string_pretty(&router.stats())
            .unwrap_or_else(|e| format!("failed to render status: {}", e)),
        AdminCommand::Help => HELP.to_string(),
    }
}

/// Serve console commands from stdin until it closes
pub fn spawn_console(router: Arc<RelayRouter>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => match parse_command(&line) {
                    Ok(Some(command)) => println!("{}", execute(&router, command)),
                    Ok(None) => {}
                    Err(e) => println!("{}", e),
                },
                Ok(None) => {
                    tracing::debug!("Admin console closed");
                    break;
                }
                Err(e) => {
                    tracing::warn!("Admin console read error: {}", e);
                    break;
                }
            }
        }
    })
}
