//! Line-oriented console: stdin lines become messages, delivered messages go to stdout.

use std::sync::Arc;

use flare_core::{ConnectionState, DeviceId, LinkFailure, MessageEnvelope, MessageType};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::mesh::MeshService;
use crate::supervisor::SupervisorHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Broadcast(String),
    Sos(String),
    Direct { target: DeviceId, text: String },
    Peers,
    Host,
    Status,
    Help,
    Invalid(&'static str),
}

pub fn parse_command(line: &str) -> Option<Command> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Some(Command::Broadcast(line.to_string()));
    };
    let (word, args) = match rest.split_once(char::is_whitespace) {
        Some((w, a)) => (w, a.trim()),
        None => (rest, ""),
    };
    Some(match word {
        "sos" if args.is_empty() => Command::Sos("SOS".to_string()),
        "sos" => Command::Sos(args.to_string()),
        "to" => match args.split_once(char::is_whitespace) {
            Some((target, text)) if !text.trim().is_empty() => Command::Direct {
                target: DeviceId::new(target),
                text: text.trim().to_string(),
            },
            _ => Command::Invalid("usage: /to <device-id> <text>"),
        },
        "peers" => Command::Peers,
        "host" => Command::Host,
        "status" => Command::Status,
        "help" => Command::Help,
        _ => Command::Invalid("unknown command, try /help"),
    })
}

const HELP: &str = "\
  <text>               broadcast to the mesh
  /sos [text]          emergency broadcast
  /to <id> <text>      direct message
  /peers               known devices
  /host                host a group now
  /status              connection state";

/// Read commands from stdin until EOF.
pub async fn run_input(mesh: Arc<MeshService>, link: SupervisorHandle) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(l)) => l,
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "stdin closed");
                break;
            }
        };
        let Some(command) = parse_command(&line) else {
            continue;
        };
        match command {
            Command::Broadcast(text) => {
                mesh.submit(None, MessageType::Text, text);
            }
            Command::Sos(text) => {
                mesh.submit(None, MessageType::Sos, text);
            }
            Command::Direct { target, text } => {
                mesh.submit(Some(target), MessageType::Text, text);
            }
            Command::Peers => {
                let identities = mesh.identities().await;
                if identities.is_empty() {
                    println!("no peers yet");
                }
                for i in identities {
                    let mark = if i.is_connected { "*" } else { " " };
                    println!("{mark} {}  {}", i.id, i.display_name);
                }
            }
            Command::Host => link.create_group(),
            Command::Status => {
                let state = link.state();
                println!(
                    "{}: mode {:?}, role {:?}, {} linked, {} pending",
                    mesh.local_id().await,
                    state.mode,
                    state.role,
                    mesh.connected_peers().await.len(),
                    mesh.pending_len().await
                );
            }
            Command::Help => println!("{HELP}"),
            Command::Invalid(why) => println!("{why}"),
        }
    }
}

pub fn format_message(env: &MessageEnvelope) -> String {
    let target = match &env.target_id {
        Some(t) => format!(" -> {t}"),
        None => String::new(),
    };
    let tag = if env.is_emergency { "!!" } else { "" };
    format!(
        "{tag}[{}] {}{}: {}",
        env.message_type.as_str(),
        env.sender_name,
        target,
        env.payload
    )
}

/// Print delivered messages, link failures and role changes until the channels close.
pub async fn run_output(
    mut messages: mpsc::UnboundedReceiver<MessageEnvelope>,
    mut failures: mpsc::UnboundedReceiver<LinkFailure>,
    mut state: watch::Receiver<ConnectionState>,
) {
    let mut state_open = true;
    loop {
        tokio::select! {
            Some(env) = messages.recv() => println!("{}", format_message(&env)),
            Some(failure) = failures.recv() => println!("link: {failure:?}"),
            changed = state.changed(), if state_open => match changed {
                Ok(()) => {
                    let s = *state.borrow_and_update();
                    println!("link: {:?} as {:?}", s.mode, s.role);
                }
                Err(_) => state_open = false,
            },
            else => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flare_core::LocalIdentity;

    #[test]
    fn plain_line_is_broadcast() {
        assert_eq!(
            parse_command("  hello all "),
            Some(Command::Broadcast("hello all".into()))
        );
        assert_eq!(parse_command("   "), None);
    }

    #[test]
    fn commands_parse() {
        assert_eq!(parse_command("/sos"), Some(Command::Sos("SOS".into())));
        assert_eq!(
            parse_command("/sos need water"),
            Some(Command::Sos("need water".into()))
        );
        assert_eq!(
            parse_command("/to aa:bb:cc:dd:ee:ff  meet at gate"),
            Some(Command::Direct {
                target: DeviceId::from("aa:bb:cc:dd:ee:ff"),
                text: "meet at gate".into()
            })
        );
        assert!(matches!(parse_command("/to bob"), Some(Command::Invalid(_))));
        assert_eq!(parse_command("/peers"), Some(Command::Peers));
        assert!(matches!(parse_command("/launch"), Some(Command::Invalid(_))));
    }

    #[test]
    fn emergency_lines_are_marked() {
        let local = LocalIdentity::new("ana", "p");
        let env = MessageEnvelope::outbound(&local, None, MessageType::Sos, "help", 3);
        assert_eq!(format_message(&env), "!![sos] ana: help");
    }
}
