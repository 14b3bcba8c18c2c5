use std::collections::BTreeMap;

use log::{debug, info};

use crate::net::SequenceBuffer;
use crate::schema::{FieldWriter, NetworkSchema, SchemaCategory, SchemaError, SchemaRegistry};

use super::entity::EntityIds;
use super::world::WorldSnapshot;

/// Fills in the replicated fields of one entity while a snapshot is built.
pub trait EntitySerializer {
    fn serialize_entity(&mut self, id: u16, type_id: u16, writer: &mut FieldWriter<'_>);
}

#[derive(Debug, Clone, Copy)]
struct SpawnedEntity {
    type_id: u16,
    spawn_sequence: u32,
}

/// Server side world replication: live entities and the snapshot ring.
#[derive(Debug)]
pub struct SnapshotEngine {
    schemas: SchemaRegistry,
    entities: BTreeMap<u16, SpawnedEntity>,
    ids: EntityIds,
    snapshots: SequenceBuffer<WorldSnapshot>,
    snapshot_words: usize,
    server_sequence: Option<u32>,
    last_server_time: Option<u32>,
    sim_time_ms: u8,
}

impl SnapshotEngine {
    pub fn new(cache_size: usize, snapshot_words: usize) -> Self {
        Self {
            schemas: SchemaRegistry::new(),
            entities: BTreeMap::new(),
            ids: EntityIds::new(),
            snapshots: SequenceBuffer::new(cache_size),
            snapshot_words,
            server_sequence: None,
            last_server_time: None,
            sim_time_ms: 0,
        }
    }

    pub fn register_entity_type(&mut self, schema: NetworkSchema) -> Result<(), SchemaError> {
        self.schemas.register(SchemaCategory::Entity, schema)
    }

    pub fn schemas(&self) -> &SchemaRegistry {
        &self.schemas
    }

    fn next_sequence(&self) -> u32 {
        self.server_sequence.map_or(1, |s| s.wrapping_add(1))
    }

    /// Spawns an entity of a registered type. It shows up in the next snapshot.
    pub fn spawn(&mut self, type_id: u16) -> u16 {
        assert!(
            self.schemas.get(SchemaCategory::Entity, type_id).is_some(),
            "entity type {type_id} spawned without a schema"
        );
        let id = self.ids.allocate();
        let spawn_sequence = self.next_sequence();
        self.entities.insert(id, SpawnedEntity { type_id, spawn_sequence });
        debug!("spawned entity {id} of type {type_id}");
        id
    }

    pub fn despawn(&mut self, id: u16) -> bool {
        if self.entities.remove(&id).is_none() {
            return false;
        }
        self.ids.retire(id, self.next_sequence());
        debug!("despawned entity {id}");
        true
    }

    pub fn is_spawned(&self, id: u16) -> bool {
        self.entities.contains_key(&id)
    }

    pub fn entity_type(&self, id: u16) -> Option<u16> {
        self.entities.get(&id).map(|e| e.type_id)
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    /// Writes the snapshot for server tick `server_time` and returns its
    /// sequence.
    ///
    /// Only the first call per tick builds anything; later calls for the same
    /// tick return the entry already in the ring.
    pub fn generate_snapshot(
        &mut self,
        server_time: u32,
        sim_time_ms: u8,
        serializer: &mut dyn EntitySerializer,
    ) -> u32 {
        if let (Some(sequence), Some(last)) = (self.server_sequence, self.last_server_time) {
            if last == server_time {
                return sequence;
            }
        }

        let sequence = self.next_sequence();
        let snapshot = self.snapshots.acquire(sequence);
        snapshot.reset(sequence, server_time, self.snapshot_words);

        for (&id, entity) in &self.entities {
            let Some(schema) = self.schemas.get(SchemaCategory::Entity, entity.type_id) else {
                continue;
            };
            let record =
                snapshot.push_entity(id, entity.type_id, entity.spawn_sequence, schema.word_count());
            let mut writer = FieldWriter::new(schema, record);
            serializer.serialize_entity(id, entity.type_id, &mut writer);
            writer.finish();
        }

        self.server_sequence = Some(sequence);
        self.last_server_time = Some(server_time);
        self.sim_time_ms = sim_time_ms;
        sequence
    }

    /// Sequence of the newest snapshot, `None` before the first one.
    pub fn server_sequence(&self) -> Option<u32> {
        self.server_sequence
    }

    pub fn sim_time_ms(&self) -> u8 {
        self.sim_time_ms
    }

    pub fn snapshot(&self, sequence: u32) -> Option<&WorldSnapshot> {
        self.snapshots.get(sequence)
    }

    pub fn latest(&self) -> Option<&WorldSnapshot> {
        self.server_sequence.and_then(|s| self.snapshots.get(s))
    }

    pub fn cache_size(&self) -> usize {
        self.snapshots.capacity()
    }

    /// Recycles despawned ids that no connection can reference any more.
    pub fn release_despawned(&mut self, min_ack: Option<u32>) -> usize {
        let Some(sequence) = self.server_sequence else {
            return 0;
        };
        let released = self.ids.release(min_ack, sequence, self.snapshots.capacity());
        if released > 0 {
            debug!("recycled {released} entity ids");
        }
        released
    }

    /// Drops every entity and snapshot, keeping registered schemas.
    pub fn reset(&mut self) {
        self.entities.clear();
        self.ids.clear();
        self.snapshots.clear();
        self.server_sequence = None;
        self.last_server_time = None;
        info!("snapshot engine reset");
    }
}

#[cfg(test)]
mod tests {
    use glam::Vec3;

    use super::*;
    use crate::schema::{FieldReader, FieldType};

    struct Positions(f32);

    impl EntitySerializer for Positions {
        fn serialize_entity(&mut self, id: u16, _type_id: u16, writer: &mut FieldWriter<'_>) {
            writer.write_vec3(Vec3::new(self.0, id as f32, 0.0));
        }
    }

    fn engine() -> SnapshotEngine {
        let mut engine = SnapshotEngine::new(16, 1024);
        engine
            .register_entity_type(NetworkSchema::new(0).with_field("pos", FieldType::Vector3, 20, 2))
            .unwrap();
        engine
    }

    #[test]
    fn test_one_snapshot_per_tick() {
        let mut engine = engine();
        engine.spawn(0);

        let first = engine.generate_snapshot(10, 0, &mut Positions(1.0));
        let again = engine.generate_snapshot(10, 0, &mut Positions(2.0));
        assert_eq!(first, again);

        let schema = engine.schemas().get(SchemaCategory::Entity, 0).unwrap().clone();
        let snapshot = engine.snapshot(first).unwrap();
        let (_, words) = snapshot.entity(1).unwrap();
        assert_eq!(FieldReader::new(&schema, words).read_vec3().x, 1.0);

        let next = engine.generate_snapshot(11, 0, &mut Positions(2.0));
        assert_eq!(next, first + 1);
        assert_eq!(engine.latest().unwrap().server_time, 11);
    }

    #[test]
    fn test_spawn_sequence_is_first_snapshot() {
        let mut engine = engine();
        engine.generate_snapshot(1, 0, &mut Positions(0.0));
        let id = engine.spawn(0);
        let sequence = engine.generate_snapshot(2, 0, &mut Positions(0.0));

        let (entry, _) = engine.snapshot(sequence).unwrap().entity(id).unwrap();
        assert_eq!(entry.spawn_sequence, sequence);
    }

    #[test]
    fn test_despawned_ids_wait_for_acks() {
        let mut engine = engine();
        let a = engine.spawn(0);
        engine.generate_snapshot(1, 0, &mut Positions(0.0));
        assert!(engine.despawn(a));
        assert!(!engine.despawn(a));
        let gone = engine.generate_snapshot(2, 0, &mut Positions(0.0));
        assert!(engine.snapshot(gone).unwrap().find(a).is_none());

        assert_eq!(engine.release_despawned(Some(gone - 1)), 0);
        assert_ne!(engine.spawn(0), a);
        assert_eq!(engine.release_despawned(Some(gone)), 1);
        assert_eq!(engine.spawn(0), a);
    }

    #[test]
    fn test_ring_keeps_cache_size_snapshots() {
        let mut engine = engine();
        for tick in 0..40 {
            engine.generate_snapshot(tick, 0, &mut Positions(0.0));
        }
        let newest = engine.server_sequence().unwrap();
        assert!(engine.snapshot(newest - 15).is_some());
        assert!(engine.snapshot(newest - 16).is_none());
    }

    #[test]
    #[should_panic(expected = "without a schema")]
    fn test_spawning_unknown_type_panics() {
        engine().spawn(9);
    }
}
