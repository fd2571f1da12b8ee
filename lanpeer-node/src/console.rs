//! Interactive commands on stdin: `devices`, `talk`, `sendfile`.

use std::sync::Arc;
use std::time::Instant;

use lanpeer_core::{EndStatus, Node};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};

const HELP: &str = "\
Available commands:
  devices                       list known peers
  talk <peer> <message>         send a message
  sendfile <peer> <file>        send a file from the outgoing directory";

#[derive(Debug, PartialEq, Eq)]
pub enum Command<'a> {
    Devices,
    Talk { peer: &'a str, text: &'a str },
    SendFile { peer: &'a str, file: &'a str },
    Help,
}

/// Parse one input line. Anything unrecognised (or missing arguments) is `Help`.
pub fn parse(line: &str) -> Command<'_> {
    let mut parts = line.trim().splitn(3, ' ');
    let verb = parts.next().unwrap_or_default();
    let peer = parts.next().filter(|s| !s.is_empty());
    let rest = parts.next().filter(|s| !s.is_empty());
    match (verb.to_ascii_lowercase().as_str(), peer, rest) {
        ("devices", _, _) => Command::Devices,
        ("talk", Some(peer), Some(text)) => Command::Talk { peer, text },
        ("sendfile", Some(peer), Some(file)) => Command::SendFile {
            peer,
            file: file.trim(),
        },
        _ => Command::Help,
    }
}

/// Read commands until stdin closes.
pub async fn run(node: Arc<Node>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => {}
            Ok(Some(line)) => execute(&node, parse(&line)).await,
            Ok(None) => {
                info!("stdin closed, console stopped");
                return;
            }
            Err(e) => {
                error!(error = %e, "cannot read stdin, console stopped");
                return;
            }
        }
    }
}

async fn execute(node: &Node, command: Command<'_>) {
    match command {
        Command::Devices => print!("{}", render_devices(node, Instant::now())),
        Command::Talk { peer, text } => {
            if let Err(e) = node.talk(peer, text) {
                println!("error: {e}");
            }
        }
        Command::SendFile { peer, file } => match node.send_file(peer, file).await {
            Ok(report) => {
                let verdict = match &report.end {
                    EndStatus::Verified => "verified by receiver".to_string(),
                    EndStatus::Rejected(reason) => format!("rejected by receiver: {reason}"),
                    EndStatus::Unacknowledged => "END not acknowledged".to_string(),
                };
                println!(
                    "sent {file} to {peer}: {} bytes in {} chunks, {} failed, {verdict}",
                    report.size,
                    report.chunks,
                    report.failed_chunks.len()
                );
            }
            Err(e) => println!("error: {e}"),
        },
        Command::Help => println!("{HELP}"),
    }
}

fn render_devices(node: &Node, now: Instant) -> String {
    let snapshot = node.devices(now);
    let mut out = String::from("Active devices:\n");
    for view in snapshot.iter() {
        let this = if node.is_local(&view.record.name) {
            " (this device)"
        } else {
            ""
        };
        out.push_str(&format!(
            "- {} ({}) {}s ago{}\n",
            view.record.name,
            view.record.addr,
            view.idle.as_secs(),
            this
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use lanpeer_core::{NodeOptions, Outbox};
    use std::net::SocketAddr;

    struct Discard;

    impl Outbox for Discard {
        fn send_to(&self, _: SocketAddr, _: Vec<u8>) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn parses_commands() {
        assert_eq!(parse("devices"), Command::Devices);
        assert_eq!(parse("DEVICES"), Command::Devices);
        assert_eq!(
            parse("talk bob hello there: friend"),
            Command::Talk {
                peer: "bob",
                text: "hello there: friend"
            }
        );
        assert_eq!(
            parse("sendfile bob report.pdf"),
            Command::SendFile {
                peer: "bob",
                file: "report.pdf"
            }
        );
    }

    #[test]
    fn incomplete_or_unknown_is_help() {
        assert_eq!(parse("talk bob"), Command::Help);
        assert_eq!(parse("sendfile"), Command::Help);
        assert_eq!(parse("dance"), Command::Help);
    }

    #[test]
    fn devices_listing_flags_local_node() {
        let node = Node::new("alice", NodeOptions::default(), Arc::new(Discard));
        let now = Instant::now();
        node.on_datagram(SocketAddr::from(([10, 0, 0, 1], 8080)), b"HEARTBEAT:alice", now)
            .unwrap();
        node.on_datagram(SocketAddr::from(([10, 0, 0, 2], 8080)), b"HEARTBEAT:bob", now)
            .unwrap();
        let text = render_devices(&node, now);
        assert!(text.contains("- alice (10.0.0.1:8080) 0s ago (this device)"));
        assert!(text.contains("- bob (10.0.0.2:8080) 0s ago\n"));
    }
}
