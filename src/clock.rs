//! Logical clocks for the two ordering engines.
//!
//! The scalar Lamport clock backs the totally-ordered multicast; the
//! vector clock backs the causally-ordered multicast. Both update and
//! snapshot inside a single critical section, so two concurrent local
//! events can never stamp the same value into a message.

use std::sync::Mutex;

/// Scalar Lamport clock. Strictly increasing on every local event;
/// receives advance it to `max(local, observed) + 1`.
pub struct LamportClock {
    value: Mutex<u64>,
}

impl LamportClock {
    pub fn new() -> Self {
        Self {
            value: Mutex::new(0),
        }
    }

    /// Advances the clock for a local event and returns the new value.
    pub fn tick(&self) -> u64 {
        let mut value = self.value.lock().unwrap();
        *value += 1;
        *value
    }

    /// Advances the clock past an observed remote timestamp and returns
    /// the new value.
    pub fn witness(&self, observed: u64) -> u64 {
        let mut value = self.value.lock().unwrap();
        *value = (*value).max(observed) + 1;
        *value
    }

    pub fn current(&self) -> u64 {
        *self.value.lock().unwrap()
    }
}

impl Default for LamportClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Vector clock summarising the causal history of one replica.
///
/// The owner slot is incremented only when a local write is sent;
/// deliveries merge the message timestamp pointwise. Callers wrap the
/// clock in a mutex and hold it across the whole check-update-scan
/// cycle of the causal engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VectorClock {
    owner: usize,
    slots: Vec<u64>,
}

impl VectorClock {
    pub fn new(owner: usize, replicas: usize) -> Self {
        Self {
            owner,
            slots: vec![0; replicas],
        }
    }

    /// Records a local send: bumps the owner slot and returns the
    /// timestamp to embed in the outgoing message.
    pub fn record_send(&mut self) -> Vec<u64> {
        self.slots[self.owner] += 1;
        self.slots.clone()
    }

    /// Merges a delivered message timestamp: `V[k] = max(V[k], ts[k])`.
    pub fn observe(&mut self, timestamp: &[u64]) {
        debug_assert_eq!(timestamp.len(), self.slots.len());
        for (slot, &seen) in self.slots.iter_mut().zip(timestamp) {
            if seen > *slot {
                *slot = seen;
            }
        }
    }

    /// Delivery predicate for a message from `sender`: it must be the
    /// next message expected from that sender, and every causal
    /// dependency it carries must already be reflected locally.
    pub fn permits(&self, timestamp: &[u64], sender: usize) -> bool {
        debug_assert_eq!(timestamp.len(), self.slots.len());
        if timestamp[sender] != self.slots[sender] + 1 {
            return false;
        }
        timestamp
            .iter()
            .enumerate()
            .all(|(k, &seen)| k == sender || seen <= self.slots[k])
    }

    pub fn snapshot(&self) -> Vec<u64> {
        self.slots.clone()
    }
}
