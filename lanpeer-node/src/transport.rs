//! UDP transport: one socket for everything, a single receive loop, a writer task
//! draining the outbound queue, and the retransmit monitor.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use lanpeer_core::{FrameKind, Node, Outbox};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::tasks::{self, TaskError};

const RECV_BUF_SIZE: usize = 65536;
const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Outbound datagrams queued for the writer task.
pub type OutboundQueue = mpsc::UnboundedReceiver<(SocketAddr, Vec<u8>)>;

/// [`Outbox`] that hands datagrams to the writer task without blocking.
#[derive(Clone)]
pub struct ChannelOutbox {
    tx: mpsc::UnboundedSender<(SocketAddr, Vec<u8>)>,
}

impl ChannelOutbox {
    pub fn channel() -> (Self, OutboundQueue) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Outbox for ChannelOutbox {
    fn send_to(&self, addr: SocketAddr, bytes: Vec<u8>) -> io::Result<()> {
        self.tx
            .send((addr, bytes))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "writer task stopped"))
    }
}

/// Bind the shared port on all interfaces with broadcast enabled.
pub fn bind(port: u16) -> io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))?;
    std_sock.set_broadcast(true)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

/// Send queued datagrams. A failed send is logged; the datagram is dropped and
/// the delivery tracker decides whether it goes out again.
pub async fn run_writer(socket: Arc<UdpSocket>, mut queue: OutboundQueue) {
    while let Some((addr, bytes)) = queue.recv().await {
        if let Err(e) = socket.send_to(&bytes, addr).await {
            warn!(to = %addr, error = %e, "udp send failed");
        }
    }
    debug!("outbound queue closed");
}

/// The one inbound path. Only waits on the socket; every frame is handled inline.
pub async fn run_receiver(socket: Arc<UdpSocket>, node: Arc<Node>) {
    let mut buf = vec![0u8; RECV_BUF_SIZE];
    info!(local = ?socket.local_addr().ok(), "listening");
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((n, from)) if is_end_frame(&buf[..n]) => {
                // END hashes the whole received file; keep the socket draining meanwhile.
                let node = node.clone();
                let bytes = buf[..n].to_vec();
                tokio::task::spawn_blocking(move || node.handle_datagram(from, &bytes));
            }
            Ok((n, from)) => node.handle_datagram(from, &buf[..n]),
            Err(e) => {
                warn!(error = %e, "udp receive failed");
                tokio::time::sleep(RECV_ERROR_BACKOFF).await;
            }
        }
    }
}

fn is_end_frame(bytes: &[u8]) -> bool {
    bytes
        .strip_prefix(FrameKind::End.tag().as_bytes())
        .is_some_and(|rest| rest.first() == Some(&b':'))
}

/// Periodically resend overdue ack-expecting frames and drop exhausted ones.
pub fn spawn_retransmit_monitor(node: Arc<Node>, period: Duration) -> tokio::task::JoinHandle<()> {
    tasks::spawn_periodic("retransmit", period, move || -> Result<(), TaskError> {
        let resend = node.retransmit_tick(Instant::now());
        node.dispatch(resend);
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use lanpeer_core::NodeOptions;

    #[test]
    fn only_end_frames_leave_the_receive_loop() {
        assert!(is_end_frame(b"END:4:abcd:A"));
        assert!(!is_end_frame(b"ENDX:4:abcd:A"));
        assert!(!is_end_frame(b"END"));
        assert!(!is_end_frame(b"CHUNK:4:0:YWJj:A"));
        assert!(!is_end_frame(b"TALK:1:A:END:now"));
    }

    #[tokio::test]
    async fn talk_and_ack_over_loopback() {
        let dir = tempfile::tempdir().unwrap();
        let mut nodes = Vec::new();
        let mut addrs = Vec::new();
        for name in ["A", "B"] {
            let std_sock = std::net::UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
            std_sock.set_nonblocking(true).unwrap();
            let socket = Arc::new(UdpSocket::from_std(std_sock).unwrap());
            addrs.push(socket.local_addr().unwrap());
            let (outbox, queue) = ChannelOutbox::channel();
            let options = NodeOptions {
                incoming_dir: dir.path().join(name),
                ..NodeOptions::default()
            };
            let node = Arc::new(Node::new(name, options, Arc::new(outbox)));
            tokio::spawn(run_writer(socket.clone(), queue));
            tokio::spawn(run_receiver(socket, node.clone()));
            nodes.push(node);
        }
        let (a, b) = (&nodes[0], &nodes[1]);

        a.dispatch(vec![lanpeer_core::Datagram {
            to: addrs[1],
            bytes: a.heartbeat(),
        }]);
        b.dispatch(vec![lanpeer_core::Datagram {
            to: addrs[0],
            bytes: b.heartbeat(),
        }]);
        for _ in 0..100 {
            if a.peers().lookup("B").is_some() && b.peers().lookup("A").is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(a.peers().lookup("B").unwrap().addr, addrs[1]);

        a.talk("B", "hello:world").unwrap();
        for _ in 0..100 {
            if a.tracker().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(a.tracker().is_empty());
    }
}
