//! Peer link layer: FIFO delivery over short-lived TCP connections.
//!
//! Every outbound message carries a sequence number drawn from one
//! monotonic per-sender counter, regardless of destination. Receivers
//! stash messages that overtake their predecessors and release them in
//! order, so the ordering engines see each peer's messages in send
//! order even though every message travels on its own delayed
//! connection.

use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::Rng;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::message::{Message, VectorMessage};

const CONNECT_ATTEMPTS: u32 = 5;
const CONNECT_BACKOFF: Duration = Duration::from_millis(200);

/// Accessors shared by both replication message kinds so the link
/// layer can sequence them uniformly.
pub trait Sequenced {
    fn sender(&self) -> usize;
    fn seq_num(&self) -> u64;
    fn set_seq_num(&mut self, seq_num: u64);
}

impl Sequenced for Message {
    fn sender(&self) -> usize {
        self.sender
    }

    fn seq_num(&self) -> u64 {
        self.seq_num
    }

    fn set_seq_num(&mut self, seq_num: u64) {
        self.seq_num = seq_num;
    }
}

impl Sequenced for VectorMessage {
    fn sender(&self) -> usize {
        self.sender
    }

    fn seq_num(&self) -> u64 {
        self.seq_num
    }

    fn set_seq_num(&mut self, seq_num: u64) {
        self.seq_num = seq_num;
    }
}

/// Outbound half of the link layer.
///
/// `multicast` stamps the next sequence number, then hands the message
/// to a background task that sleeps the simulated delay and writes one
/// frame per peer, one connection per frame. A message accepted here is
/// never silently dropped: exhausted sends escalate through the fatal
/// channel and take the replica down.
pub struct PeerLink {
    peers: Vec<String>,
    next_send: Mutex<u64>,
    delay_ms: (u64, u64),
    fatal: mpsc::UnboundedSender<anyhow::Error>,
}

impl PeerLink {
    pub fn new(
        peers: Vec<String>,
        delay_ms: (u64, u64),
        fatal: mpsc::UnboundedSender<anyhow::Error>,
    ) -> Self {
        Self {
            peers,
            next_send: Mutex::new(0),
            delay_ms,
            fatal,
        }
    }

    pub fn multicast<M>(&self, mut frame: M)
    where
        M: Sequenced + Serialize + Send + Sync + 'static,
    {
        let seq_num = {
            let mut next = self.next_send.lock().unwrap();
            let assigned = *next;
            *next += 1;
            assigned
        };
        frame.set_seq_num(seq_num);

        let (min, max) = self.delay_ms;
        let delay = Duration::from_millis(rand::thread_rng().gen_range(min..=max));
        let peers = self.peers.clone();
        let fatal = self.fatal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            for addr in &peers {
                if let Err(err) = send_frame(addr, &frame).await {
                    let _ = fatal.send(err);
                    return;
                }
            }
            debug!(seq_num, peers = peers.len(), "multicast transmitted");
        });
    }
}

/// Writes one newline-delimited JSON value and closes the connection.
/// The payload is encoded before dialing so an encoding failure never
/// costs a connection.
async fn send_frame<M: Serialize>(addr: &str, frame: &M) -> Result<()> {
    let mut payload = serde_json::to_vec(frame).context("failed to encode peer frame")?;
    payload.push(b'\n');

    let mut stream = connect_with_retry(addr).await?;
    stream
        .write_all(&payload)
        .await
        .with_context(|| format!("failed to write frame to peer {addr}"))?;
    let _ = stream.shutdown().await;
    Ok(())
}

/// Peers are presumed permanently reachable once the cluster is up;
/// the retries cover startup races where a replica multicasts before a
/// sibling has bound its listener.
async fn connect_with_retry(addr: &str) -> Result<TcpStream> {
    let mut attempt = 0;
    loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                attempt += 1;
                if attempt >= CONNECT_ATTEMPTS {
                    return Err(anyhow::Error::new(err).context(format!(
                        "failed to connect to peer {addr} after {CONNECT_ATTEMPTS} attempts"
                    )));
                }
                warn!(%addr, attempt, error = %err, "peer connection failed, retrying");
                tokio::time::sleep(CONNECT_BACKOFF).await;
            }
        }
    }
}

/// Inbound half of the link layer: one lane per source replica, each
/// with its expected-next counter and a stash of messages that arrived
/// early. `accept` returns the batch of messages released in order by
/// the arrival, which may be empty.
pub struct FifoSequencer<M> {
    lanes: Vec<Lane<M>>,
}

struct Lane<M> {
    expected: Mutex<u64>,
    stash: Mutex<Vec<M>>,
}

impl<M: Sequenced> FifoSequencer<M> {
    pub fn new(replicas: usize) -> Self {
        Self {
            lanes: (0..replicas)
                .map(|_| Lane {
                    expected: Mutex::new(0),
                    stash: Mutex::new(Vec::new()),
                })
                .collect(),
        }
    }

    pub fn accept(&self, frame: M) -> Vec<M> {
        let lane = &self.lanes[frame.sender()];
        let mut expected = lane.expected.lock().unwrap();
        if frame.seq_num() != *expected {
            let mut stash = lane.stash.lock().unwrap();
            let position = stash
                .iter()
                .position(|waiting| waiting.seq_num() > frame.seq_num())
                .unwrap_or(stash.len());
            stash.insert(position, frame);
            return Vec::new();
        }

        *expected += 1;
        let mut released = vec![frame];
        let mut stash = lane.stash.lock().unwrap();
        while stash.first().map(|next| next.seq_num()) == Some(*expected) {
            released.push(stash.remove(0));
            *expected += 1;
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MessageId, MessageKind, Operation};

    fn frame(sender: usize, seq_num: u64) -> Message {
        Message {
            id: MessageId {
                id: seq_num,
                origin: sender,
            },
            key: "k".into(),
            value: "v".into(),
            op: Some(Operation::Put),
            clock: seq_num + 1,
            kind: MessageKind::Request,
            sender,
            seq_num,
        }
    }

    fn seq_nums(batch: &[Message]) -> Vec<u64> {
        batch.iter().map(|m| m.seq_num).collect()
    }

    #[test]
    fn in_order_frames_pass_straight_through() {
        let sequencer = FifoSequencer::new(2);
        assert_eq!(seq_nums(&sequencer.accept(frame(1, 0))), vec![0]);
        assert_eq!(seq_nums(&sequencer.accept(frame(1, 1))), vec![1]);
    }

    #[test]
    fn early_frames_are_stashed_until_the_gap_closes() {
        let sequencer = FifoSequencer::new(2);
        assert!(sequencer.accept(frame(1, 2)).is_empty());
        assert!(sequencer.accept(frame(1, 1)).is_empty());
        // Frame 0 releases the whole stash in send order.
        assert_eq!(seq_nums(&sequencer.accept(frame(1, 0))), vec![0, 1, 2]);
        assert_eq!(seq_nums(&sequencer.accept(frame(1, 3))), vec![3]);
    }

    #[test]
    fn lanes_are_independent_per_sender() {
        let sequencer = FifoSequencer::new(3);
        assert!(sequencer.accept(frame(2, 1)).is_empty());
        // Sender 1's stream is unaffected by sender 2's gap.
        assert_eq!(seq_nums(&sequencer.accept(frame(1, 0))), vec![0]);
        assert_eq!(seq_nums(&sequencer.accept(frame(2, 0))), vec![0, 1]);
    }

    #[tokio::test]
    async fn exhausted_connect_retries_escalate_on_the_fatal_channel() {
        let (fatal_tx, mut fatal_rx) = tokio::sync::mpsc::unbounded_channel();
        // Port 1 on loopback has no listener, so every attempt is
        // refused and the retry budget runs out.
        let link = PeerLink::new(vec!["127.0.0.1:1".into()], (0, 0), fatal_tx);
        link.multicast(frame(0, 0));

        let err = tokio::time::timeout(Duration::from_secs(10), fatal_rx.recv())
            .await
            .expect("escalation within the retry budget")
            .expect("fatal channel still open");
        let rendered = format!("{err:#}");
        assert!(
            rendered.contains("127.0.0.1:1"),
            "error should name the unreachable peer: {rendered}"
        );
    }
}
