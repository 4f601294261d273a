//! Totally-ordered multicast engine (Lamport clocks with ACKs).
//!
//! Every client write becomes a REQUEST that is enqueued locally,
//! multicast to the peers, and acknowledged by every replica. A
//! REQUEST is applied once it heads the hold-back queue with a
//! later-clock message from every other replica on record. Client
//! reads are local events sequenced through the same queue, so a read
//! observes exactly the prefix of the total order preceding it.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::clock::LamportClock;
use crate::engine::JournalEntry;
use crate::link::{FifoSequencer, PeerLink};
use crate::message::{Message, MessageId, MessageKind, Operation};
use crate::queue::HoldBackQueue;
use crate::store::KvStore;

pub struct SequentialEngine {
    id: usize,
    replicas: usize,
    store: Arc<KvStore>,
    clock: LamportClock,
    queue: HoldBackQueue,
    sequencer: FifoSequencer<Message>,
    link: PeerLink,
    next_id: AtomicU64,
    /// Parked responders for local reads, keyed by the read's message
    /// id and completed when the read is delivered from the queue.
    pending_reads: Mutex<HashMap<u64, oneshot::Sender<Option<String>>>>,
    /// Serialises deliveries so concurrent drains cannot apply
    /// messages out of queue order. The queue guard itself is released
    /// while the store is updated.
    drain_lock: Mutex<()>,
    journal: Mutex<Vec<JournalEntry>>,
}

impl SequentialEngine {
    pub fn new(id: usize, replicas: usize, store: Arc<KvStore>, link: PeerLink) -> Self {
        Self {
            id,
            replicas,
            store,
            clock: LamportClock::new(),
            queue: HoldBackQueue::new(replicas, id),
            sequencer: FifoSequencer::new(replicas),
            link,
            next_id: AtomicU64::new(0),
            pending_reads: Mutex::new(HashMap::new()),
            drain_lock: Mutex::new(()),
            journal: Mutex::new(Vec::new()),
        }
    }

    /// Sequences a local read and waits for its delivery. The read is
    /// not multicast; its position in the queue is its delivery point.
    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let clock = self.clock.tick();
        let id = self.allocate_id();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending_reads.lock().unwrap().insert(id.id, reply_tx);
        self.queue.insert(Message {
            id,
            key: key.to_string(),
            value: String::new(),
            op: Some(Operation::Get),
            clock,
            kind: MessageKind::Request,
            sender: self.id,
            seq_num: 0,
        });
        self.drain();
        reply_rx
            .await
            .context("replica stopped before the read was sequenced")
    }

    pub fn put(&self, key: String, value: String) {
        self.submit_write(Operation::Put, key, value);
    }

    pub fn delete(&self, key: String) {
        self.submit_write(Operation::Delete, key, String::new());
    }

    /// Sends a write: enqueue the REQUEST locally (the sender acts as
    /// if it had received its own message), multicast it, then send
    /// the sender's own ACK so every receiver gets this replica's
    /// later-clock evidence.
    fn submit_write(&self, op: Operation, key: String, value: String) {
        let clock = self.clock.tick();
        let id = self.allocate_id();
        let request = Message {
            id,
            key,
            value,
            op: Some(op),
            clock,
            kind: MessageKind::Request,
            sender: self.id,
            seq_num: 0,
        };
        self.queue.insert(request.clone());
        self.link.multicast(request);
        self.send_ack(id);
    }

    /// Processes one frame from the link layer, which may release a
    /// batch of messages stalled behind it in the per-sender stream.
    pub fn handle_frame(&self, frame: Message) {
        if frame.sender >= self.replicas {
            warn!(sender = frame.sender, "dropping frame from unknown replica");
            return;
        }
        for message in self.sequencer.accept(frame) {
            self.receive(message);
        }
    }

    fn receive(&self, message: Message) {
        self.clock.witness(message.clock);
        match message.kind {
            MessageKind::Request => {
                let id = message.id;
                self.queue.insert(message);
                self.send_ack(id);
            }
            MessageKind::Ack => self.queue.insert(message),
        }
        self.drain();
    }

    /// ACKs carry the acknowledged REQUEST's identifier and a fresh,
    /// strictly larger clock. No self-ACK is enqueued: the sender
    /// already holds the REQUEST itself.
    fn send_ack(&self, id: MessageId) {
        let clock = self.clock.tick();
        self.link.multicast(Message {
            id,
            key: String::new(),
            value: String::new(),
            op: None,
            clock,
            kind: MessageKind::Ack,
            sender: self.id,
            seq_num: 0,
        });
    }

    fn drain(&self) {
        let _delivering = self.drain_lock.lock().unwrap();
        while let Some(message) = self.queue.pop_deliverable() {
            self.deliver(message);
        }
    }

    fn deliver(&self, message: Message) {
        match message.op {
            Some(Operation::Get) => {
                let value = self.store.get(&message.key);
                debug!(key = %message.key, clock = message.clock, "delivered local get");
                if let Some(reply) = self.pending_reads.lock().unwrap().remove(&message.id.id) {
                    let _ = reply.send(value);
                }
            }
            Some(Operation::Put) => {
                debug!(
                    key = %message.key,
                    value = %message.value,
                    origin = message.id.origin,
                    clock = message.clock,
                    "delivered put"
                );
                self.store.put(message.key.clone(), message.value.clone());
                self.record(Operation::Put, message.key, message.value, message.id.origin);
                self.queue.purge_acks(message.id);
            }
            Some(Operation::Delete) => {
                debug!(
                    key = %message.key,
                    origin = message.id.origin,
                    clock = message.clock,
                    "delivered delete"
                );
                self.store.delete(&message.key);
                self.record(Operation::Delete, message.key, String::new(), message.id.origin);
                self.queue.purge_acks(message.id);
            }
            // The queue never yields ACKs.
            None => {}
        }
    }

    fn allocate_id(&self) -> MessageId {
        MessageId {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            origin: self.id,
        }
    }

    fn record(&self, op: Operation, key: String, value: String, origin: usize) {
        self.journal.lock().unwrap().push(JournalEntry {
            op,
            key,
            value,
            origin,
        });
    }

    pub fn holdback_len(&self) -> usize {
        self.queue.len()
    }

    pub fn journal(&self) -> Vec<JournalEntry> {
        self.journal.lock().unwrap().clone()
    }
}
