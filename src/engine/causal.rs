//! Causally-ordered multicast engine (vector clocks, no ACKs).
//!
//! A replica applies its own writes immediately: same-replica events
//! are already ordered by program order. Remote writes wait until the
//! vector-clock predicate confirms every message they causally depend
//! on has been delivered. Concurrent writes may land in different
//! orders on different replicas, which causal consistency allows.

use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::clock::VectorClock;
use crate::engine::JournalEntry;
use crate::link::{FifoSequencer, PeerLink};
use crate::message::{Operation, VectorMessage};
use crate::queue::CausalBuffer;
use crate::store::KvStore;

pub struct CausalEngine {
    id: usize,
    replicas: usize,
    store: Arc<KvStore>,
    clock: Mutex<VectorClock>,
    buffer: CausalBuffer,
    sequencer: FifoSequencer<VectorMessage>,
    link: PeerLink,
    journal: Mutex<Vec<JournalEntry>>,
}

impl CausalEngine {
    pub fn new(id: usize, replicas: usize, store: Arc<KvStore>, link: PeerLink) -> Self {
        Self {
            id,
            replicas,
            store,
            clock: Mutex::new(VectorClock::new(id, replicas)),
            buffer: CausalBuffer::new(),
            sequencer: FifoSequencer::new(replicas),
            link,
            journal: Mutex::new(Vec::new()),
        }
    }

    /// Reads are purely local: no clock change, no multicast.
    pub fn get(&self, key: &str) -> Option<String> {
        self.store.get(key)
    }

    pub fn put(&self, key: String, value: String) {
        self.store.put(key.clone(), value.clone());
        self.send_update(Operation::Put, key, value);
    }

    pub fn delete(&self, key: String) {
        self.store.delete(&key);
        self.send_update(Operation::Delete, key, String::new());
    }

    /// The store is already updated; peers observe the post-increment
    /// clock, matching the delivery predicate's `ts[sender] = V[sender] + 1`.
    fn send_update(&self, op: Operation, key: String, value: String) {
        let timestamp = {
            let mut clock = self.clock.lock().unwrap();
            let timestamp = clock.record_send();
            self.record(op, &key, &value, self.id);
            timestamp
        };
        self.link.multicast(VectorMessage {
            key,
            value,
            op,
            clock: timestamp,
            sender: self.id,
            seq_num: 0,
        });
    }

    pub fn handle_frame(&self, frame: VectorMessage) {
        if frame.sender >= self.replicas || frame.clock.len() != self.replicas {
            warn!(
                sender = frame.sender,
                clock_len = frame.clock.len(),
                "dropping malformed causal frame"
            );
            return;
        }
        for message in self.sequencer.accept(frame) {
            self.receive(message);
        }
    }

    /// One critical section on the clock covers the whole
    /// check-update-scan cycle; the predicate depends on the clock
    /// value, and each delivery can make further buffered messages
    /// deliverable.
    fn receive(&self, message: VectorMessage) {
        let mut clock = self.clock.lock().unwrap();
        if !clock.permits(&message.clock, message.sender) {
            drop(clock);
            self.buffer.push(message);
            return;
        }

        clock.observe(&message.clock);
        self.apply(&message);
        while let Some(next) = self.buffer.take_deliverable(&clock) {
            clock.observe(&next.clock);
            self.apply(&next);
        }
    }

    fn apply(&self, message: &VectorMessage) {
        match message.op {
            Operation::Put => {
                debug!(
                    key = %message.key,
                    value = %message.value,
                    sender = message.sender,
                    "delivered put"
                );
                self.store.put(message.key.clone(), message.value.clone());
            }
            Operation::Delete => {
                debug!(key = %message.key, sender = message.sender, "delivered delete");
                self.store.delete(&message.key);
            }
            // Reads are never multicast.
            Operation::Get => return,
        }
        self.record(message.op, &message.key, &message.value, message.sender);
    }

    fn record(&self, op: Operation, key: &str, value: &str, origin: usize) {
        self.journal.lock().unwrap().push(JournalEntry {
            op,
            key: key.to_string(),
            value: value.to_string(),
            origin,
        });
    }

    pub fn holdback_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn journal(&self) -> Vec<JournalEntry> {
        self.journal.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn engine(id: usize, replicas: usize) -> (CausalEngine, Arc<KvStore>) {
        let (fatal_tx, _fatal_rx) = mpsc::unbounded_channel();
        let link = PeerLink::new(Vec::new(), (0, 0), fatal_tx);
        let store = Arc::new(KvStore::new());
        (CausalEngine::new(id, replicas, store.clone(), link), store)
    }

    fn update(sender: usize, clock: Vec<u64>, key: &str, value: &str, seq_num: u64) -> VectorMessage {
        VectorMessage {
            key: key.into(),
            value: value.into(),
            op: Operation::Put,
            clock,
            sender,
            seq_num,
        }
    }

    #[tokio::test]
    async fn local_writes_apply_immediately() {
        let (engine, store) = engine(0, 3);
        engine.put("x".into(), "a".into());
        assert_eq!(engine.get("x"), Some("a".into()));
        engine.delete("x".into());
        assert_eq!(engine.get("x"), None);
        assert!(store.dump().is_empty());
    }

    #[tokio::test]
    async fn dependent_write_waits_for_its_cause() {
        let (engine, store) = engine(0, 3);

        // Replica 2's write depends on replica 1's, which has not
        // arrived yet, so it is buffered.
        engine.handle_frame(update(2, vec![0, 1, 1], "y", "b", 0));
        assert_eq!(store.get("y"), None);
        assert_eq!(engine.holdback_len(), 1);

        // The cause arrives and both deliveries land, in causal order.
        engine.handle_frame(update(1, vec![0, 1, 0], "x", "a", 0));
        assert_eq!(store.get("x"), Some("a".into()));
        assert_eq!(store.get("y"), Some("b".into()));
        assert_eq!(engine.holdback_len(), 0);

        let keys: Vec<_> = engine.journal().into_iter().map(|e| e.key).collect();
        assert_eq!(keys, vec!["x", "y"]);
    }

    #[tokio::test]
    async fn send_timestamps_advance_the_own_slot() {
        let (engine, _store) = engine(1, 3);
        engine.put("x".into(), "a".into());
        engine.put("x".into(), "b".into());
        assert_eq!(engine.clock.lock().unwrap().snapshot(), vec![0, 2, 0]);
    }
}
