use std::collections::VecDeque;

use crate::net::{tick_diff, tick_greater_than};

/// Highest id an entity can carry on the wire.
pub const MAX_ENTITY_ID: u32 = u16::MAX as u32;

/// Hands out 16-bit entity ids.
///
/// Despawned ids are parked until no client can still delta against a
/// snapshot in which the id meant the old entity.
#[derive(Debug)]
pub struct EntityIds {
    next_id: u32,
    free: VecDeque<u16>,
    retired: VecDeque<(u16, u32)>,
}

impl Default for EntityIds {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityIds {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            free: VecDeque::new(),
            retired: VecDeque::new(),
        }
    }

    pub fn allocate(&mut self) -> u16 {
        if let Some(id) = self.free.pop_front() {
            return id;
        }
        assert!(self.next_id <= MAX_ENTITY_ID, "entity ids exhausted");
        let id = self.next_id as u16;
        self.next_id += 1;
        id
    }

    /// Parks `id`, which no longer appears from snapshot `despawn_sequence` on.
    pub fn retire(&mut self, id: u16, despawn_sequence: u32) {
        self.retired.push_back((id, despawn_sequence));
    }

    /// Frees retired ids that every client has moved past.
    ///
    /// `min_ack` is the oldest snapshot acknowledged across connections, or
    /// `None` while some connection has acknowledged nothing. Ids whose
    /// despawn snapshot has left a ring of `cache_size` are freed either way.
    pub fn release(&mut self, min_ack: Option<u32>, server_sequence: u32, cache_size: usize) -> usize {
        let mut released = 0;
        while let Some(&(id, despawned_at)) = self.retired.front() {
            let acked = min_ack.is_some_and(|ack| !tick_greater_than(despawned_at, ack));
            let aged_out = tick_diff(server_sequence, despawned_at) >= cache_size as i64;
            if !acked && !aged_out {
                break;
            }
            self.retired.pop_front();
            self.free.push_back(id);
            released += 1;
        }
        released
    }

    pub fn retired_count(&self) -> usize {
        self.retired.len()
    }

    pub fn clear(&mut self) {
        *self = Self::new();
    }
}
