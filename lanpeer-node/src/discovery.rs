//! LAN discovery: broadcast heartbeat and reap silent peers.
//! Heartbeats are received by the transport loop like any other frame.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use lanpeer_core::{Node, Outbox};
use tracing::debug;

use crate::tasks::{self, TaskError};

/// Broadcast `HEARTBEAT:<name>` every `period`.
pub fn spawn_beacon(
    node: Arc<Node>,
    outbox: Arc<dyn Outbox>,
    broadcast: Ipv4Addr,
    port: u16,
    period: Duration,
) -> tokio::task::JoinHandle<()> {
    let dest = SocketAddr::from((broadcast, port));
    let beacon = node.heartbeat();
    tasks::spawn_periodic("beacon", period, move || -> Result<(), TaskError> {
        outbox.send_to(dest, beacon.clone())?;
        debug!(%dest, "heartbeat sent");
        Ok(())
    })
}

/// Evict peers silent past the inactivity threshold, checked every `period`.
pub fn spawn_reaper(node: Arc<Node>, period: Duration) -> tokio::task::JoinHandle<()> {
    tasks::spawn_periodic("reaper", period, move || -> Result<(), TaskError> {
        node.reap(Instant::now());
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use lanpeer_core::NodeOptions;
    use std::io;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(SocketAddr, Vec<u8>)>>);

    impl Outbox for Recorder {
        fn send_to(&self, addr: SocketAddr, bytes: Vec<u8>) -> io::Result<()> {
            self.0.lock().unwrap().push((addr, bytes));
            Ok(())
        }
    }

    #[tokio::test]
    async fn beacon_broadcasts_heartbeat() {
        let recorder = Arc::new(Recorder::default());
        let node = Arc::new(Node::new("alice", NodeOptions::default(), recorder.clone()));
        let handle = spawn_beacon(
            node,
            recorder.clone(),
            Ipv4Addr::BROADCAST,
            8080,
            Duration::from_millis(10),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.abort();
        let sent = recorder.0.lock().unwrap();
        assert!(sent.len() >= 2);
        assert_eq!(sent[0].0, SocketAddr::from((Ipv4Addr::BROADCAST, 8080)));
        assert_eq!(sent[0].1, b"HEARTBEAT:alice".to_vec());
    }

    #[tokio::test]
    async fn reaper_evicts_silent_peer() {
        let recorder = Arc::new(Recorder::default());
        let options = NodeOptions {
            peer_timeout: Duration::from_millis(20),
            ..NodeOptions::default()
        };
        let node = Arc::new(Node::new("alice", options, recorder));
        node.on_datagram(
            SocketAddr::from(([10, 0, 0, 2], 8080)),
            b"HEARTBEAT:bob",
            Instant::now(),
        )
        .unwrap();
        let handle = spawn_reaper(node.clone(), Duration::from_millis(5));
        tokio::time::sleep(Duration::from_millis(80)).await;
        handle.abort();
        assert!(node.peers().lookup("bob").is_none());
    }
}
