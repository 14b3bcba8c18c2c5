/// Words reserved per snapshot unless configured otherwise.
pub const DEFAULT_SNAPSHOT_WORDS: usize = 32 * 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntityEntry {
    pub id: u16,
    pub type_id: u16,
    /// Sequence of the first snapshot the entity appeared in.
    pub spawn_sequence: u32,
    offset: u32,
    len: u32,
}

impl EntityEntry {
    /// Whether both entries describe the same spawned entity.
    pub fn same_entity(&self, other: &EntityEntry) -> bool {
        self.id == other.id
            && self.type_id == other.type_id
            && self.spawn_sequence == other.spawn_sequence
    }
}

/// World state at one tick: an entity index sorted by id over a word arena.
///
/// The arena is reserved up front and never grows; running out of room is a
/// fatal error.
#[derive(Debug, Clone, Default)]
pub struct WorldSnapshot {
    pub sequence: u32,
    pub server_time: u32,
    entities: Vec<EntityEntry>,
    data: Vec<u32>,
    capacity: usize,
}

impl WorldSnapshot {
    pub fn with_capacity(words: usize) -> Self {
        let mut snapshot = Self::default();
        snapshot.reset(0, 0, words);
        snapshot
    }

    /// Clears the snapshot for reuse, keeping its allocations.
    pub fn reset(&mut self, sequence: u32, server_time: u32, words: usize) {
        self.sequence = sequence;
        self.server_time = server_time;
        self.entities.clear();
        self.data.clear();
        if self.data.capacity() < words {
            self.data.reserve_exact(words);
        }
        self.capacity = words;
    }

    /// Appends an entity, returning its zeroed words for filling in.
    ///
    /// Entities must be pushed in ascending id order.
    pub fn push_entity(&mut self, id: u16, type_id: u16, spawn_sequence: u32, words: usize) -> &mut [u32] {
        if let Some(last) = self.entities.last() {
            assert!(last.id < id, "entity {id} pushed after {}", last.id);
        }
        let offset = self.data.len();
        assert!(
            offset + words <= self.capacity,
            "snapshot {} arena overflow ({} + {words} > {} words)",
            self.sequence,
            offset,
            self.capacity
        );

        self.entities.push(EntityEntry {
            id,
            type_id,
            spawn_sequence,
            offset: offset as u32,
            len: words as u32,
        });
        self.data.resize(offset + words, 0);
        &mut self.data[offset..]
    }

    pub fn entities(&self) -> &[EntityEntry] {
        &self.entities
    }

    pub fn find(&self, id: u16) -> Option<&EntityEntry> {
        self.entities
            .binary_search_by_key(&id, |e| e.id)
            .ok()
            .map(|index| &self.entities[index])
    }

    pub fn data(&self, entry: &EntityEntry) -> &[u32] {
        &self.data[entry.offset as usize..(entry.offset + entry.len) as usize]
    }

    pub fn entity(&self, id: u16) -> Option<(&EntityEntry, &[u32])> {
        self.find(id).map(|entry| (entry, self.data(entry)))
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn words_used(&self) -> usize {
        self.data.len()
    }

    /// Words the arena can hold in total.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entities_are_found_by_id() {
        let mut snapshot = WorldSnapshot::with_capacity(16);
        snapshot.push_entity(2, 0, 1, 3).copy_from_slice(&[1, 2, 3]);
        snapshot.push_entity(7, 1, 4, 2).copy_from_slice(&[9, 9]);

        let (entry, data) = snapshot.entity(7).unwrap();
        assert_eq!(entry.type_id, 1);
        assert_eq!(data, &[9, 9]);
        assert!(snapshot.find(3).is_none());
        assert_eq!(snapshot.words_used(), 5);
    }

    #[test]
    fn test_reset_keeps_allocation() {
        let mut snapshot = WorldSnapshot::with_capacity(64);
        snapshot.push_entity(1, 0, 1, 10);
        let ptr = snapshot.data.as_ptr();
        snapshot.reset(5, 9, 64);
        assert_eq!(snapshot.entity_count(), 0);
        assert_eq!(snapshot.sequence, 5);
        assert_eq!(snapshot.data.as_ptr(), ptr);
    }

    #[test]
    #[should_panic(expected = "arena overflow")]
    fn test_arena_overflow_panics() {
        let mut snapshot = WorldSnapshot::with_capacity(4);
        snapshot.push_entity(1, 0, 1, 5);
    }

    #[test]
    #[should_panic]
    fn test_unsorted_push_panics() {
        let mut snapshot = WorldSnapshot::with_capacity(8);
        snapshot.push_entity(3, 0, 1, 1);
        snapshot.push_entity(2, 0, 1, 1);
    }
}
