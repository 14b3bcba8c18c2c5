use std::collections::VecDeque;

use log::debug;

use super::types::NetworkEvent;

pub const MAX_EVENTS_PER_PACKAGE: usize = 32;

/// Outgoing events of one connection.
///
/// Events leave the queue when they are packed into a package. Reliable
/// events of a package reported lost come back to the front.
#[derive(Debug)]
pub struct EventQueue {
    pending: VecDeque<NetworkEvent>,
    max_pending: usize,
}

impl EventQueue {
    pub fn new(max_pending: usize) -> Self {
        Self {
            pending: VecDeque::with_capacity(max_pending),
            max_pending,
        }
    }

    pub fn push(&mut self, event: NetworkEvent) {
        if self.pending.len() >= self.max_pending {
            self.evict_oldest_unreliable();
        }
        self.pending.push_back(event);
    }

    /// Takes up to `max` events for the next package, oldest first.
    pub fn take_for_send(&mut self, max: usize) -> Vec<NetworkEvent> {
        let count = self.pending.len().min(max);
        self.pending.drain(..count).collect()
    }

    /// Requeues the reliable events of a lost package ahead of newer ones.
    pub fn requeue_lost(&mut self, events: Vec<NetworkEvent>) {
        let mut requeued = 0;
        for event in events
            .into_iter()
            .rev()
            .filter(|e| e.reliability.is_reliable())
        {
            self.pending.push_front(event);
            requeued += 1;
        }
        if requeued > 0 {
            debug!("requeued {requeued} reliable events");
        }
    }

    /// Puts events that did not fit into a package back at the front,
    /// unreliable ones included.
    pub fn requeue_unsent(&mut self, events: Vec<NetworkEvent>) {
        for event in events.into_iter().rev() {
            self.pending.push_front(event);
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    fn evict_oldest_unreliable(&mut self) {
        if let Some(idx) = self
            .pending
            .iter()
            .position(|e| !e.reliability.is_reliable())
        {
            self.pending.remove(idx);
        }
    }
}
