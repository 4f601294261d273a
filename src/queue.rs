//! Hold-back queues for the two ordering engines.
//!
//! Messages wait here until their delivery predicate holds. The
//! sequential queue is kept sorted by clock; the causal buffer is an
//! unordered set scanned against the vector clock.

use std::collections::HashSet;
use std::sync::Mutex;

use crate::clock::VectorClock;
use crate::message::{Message, MessageId, MessageKind, Operation, VectorMessage};

/// Sequential-mode hold-back queue.
///
/// Sorted by `(clock, origin, sender)`; ties between REQUESTs are
/// broken by the lower origin id. The head REQUEST is deliverable once
/// every replica other than its origin and the queue owner has some
/// later-clock message in the queue. Local GETs are deliverable
/// unconditionally on reaching the head: their queue position is their
/// delivery point and no ACKs exist for them.
pub struct HoldBackQueue {
    replicas: usize,
    owner: usize,
    inner: Mutex<QueueInner>,
}

struct QueueInner {
    messages: Vec<Message>,
    /// Identifiers of REQUESTs already delivered on this replica.
    /// An ACK reaching the head is late (and discarded) only if its
    /// REQUEST is recorded here; otherwise the ACK is evidence for a
    /// REQUEST still in flight and must be retained.
    delivered: HashSet<MessageId>,
}

enum HeadAction {
    Deliver,
    DiscardAck,
    Hold,
}

impl HoldBackQueue {
    pub fn new(replicas: usize, owner: usize) -> Self {
        Self {
            replicas,
            owner,
            inner: Mutex::new(QueueInner {
                messages: Vec::new(),
                delivered: HashSet::new(),
            }),
        }
    }

    /// Inserts a message at its sorted position.
    pub fn insert(&self, message: Message) {
        let mut inner = self.inner.lock().unwrap();
        let key = sort_key(&message);
        let position = inner
            .messages
            .iter()
            .position(|other| sort_key(other) > key)
            .unwrap_or(inner.messages.len());
        inner.messages.insert(position, message);
    }

    /// Removes and returns the head if it is deliverable, discarding
    /// any late ACKs encountered on the way. Returns `None` when the
    /// head must keep waiting (or the queue is empty).
    pub fn pop_deliverable(&self) -> Option<Message> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            let action = match inner.messages.first() {
                None => return None,
                Some(head) => match head.kind {
                    MessageKind::Ack if inner.delivered.contains(&head.id) => {
                        HeadAction::DiscardAck
                    }
                    MessageKind::Ack => HeadAction::Hold,
                    MessageKind::Request => {
                        if head.op == Some(Operation::Get) || self.evidence_complete(&inner, head)
                        {
                            HeadAction::Deliver
                        } else {
                            HeadAction::Hold
                        }
                    }
                },
            };
            match action {
                HeadAction::DiscardAck => {
                    inner.messages.remove(0);
                }
                HeadAction::Deliver => {
                    let message = inner.messages.remove(0);
                    inner.delivered.insert(message.id);
                    return Some(message);
                }
                HeadAction::Hold => return None,
            }
        }
    }

    /// Removes every ACK carrying the identifier of a delivered
    /// REQUEST.
    pub fn purge_acks(&self, id: MessageId) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .messages
            .retain(|message| !(message.kind == MessageKind::Ack && message.id == id));
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when every replica other than the head's origin and the
    /// queue owner has a later-clock message somewhere in the queue.
    /// FIFO links guarantee such a replica will never send anything
    /// ordered before the head.
    fn evidence_complete(&self, inner: &QueueInner, head: &Message) -> bool {
        (0..self.replicas)
            .filter(|&replica| replica != head.id.origin && replica != self.owner)
            .all(|replica| {
                inner
                    .messages
                    .iter()
                    .any(|message| message.sender == replica && message.clock > head.clock)
            })
    }
}

fn sort_key(message: &Message) -> (u64, usize, usize) {
    (message.clock, message.id.origin, message.sender)
}

/// Causal-mode pending buffer: an unordered set of messages awaiting
/// the vector-clock delivery predicate.
pub struct CausalBuffer {
    pending: Mutex<Vec<VectorMessage>>,
}

impl CausalBuffer {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, message: VectorMessage) {
        self.pending.lock().unwrap().push(message);
    }

    /// Removes and returns the first pending message the clock now
    /// permits, if any. The caller holds the clock guard, merges the
    /// timestamp, and scans again until nothing is deliverable.
    pub fn take_deliverable(&self, clock: &VectorClock) -> Option<VectorMessage> {
        let mut pending = self.pending.lock().unwrap();
        let position = pending
            .iter()
            .position(|message| clock.permits(&message.clock, message.sender))?;
        Some(pending.remove(position))
    }

    pub fn len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for CausalBuffer {
    fn default() -> Self {
        Self::new()
    }
}
