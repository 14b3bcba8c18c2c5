use crate::net::{BitReader, BitWriter, ProtocolError, SequenceBuffer};
use crate::schema::{
    AckedSchemas, NetworkSchema, SchemaCategory, SchemaRegistry, copy_fields_from_buffer,
    copy_fields_to_buffer, predict_record, read_schema, write_schema,
};

use super::world::{EntityEntry, WorldSnapshot};

const ENTITY_ID_BITS: u32 = 16;

/// Snapshots taking part in one encode, newest first.
#[derive(Debug, Clone, Copy)]
pub struct SnapshotFrame<'a> {
    pub current: &'a WorldSnapshot,
    pub baseline: Option<&'a WorldSnapshot>,
    pub prediction: Option<(&'a WorldSnapshot, &'a WorldSnapshot)>,
    pub sim_time_ms: u8,
}

/// What a decoded snapshot message referenced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotHeader {
    pub sequence: u32,
    pub server_time: u32,
    pub sim_time_ms: u8,
    pub baseline: Option<u32>,
    pub prediction: Option<(u32, u32)>,
}

/// Words an entity is delta coded against.
///
/// Entities present as the same spawn in all three baselines get the
/// extrapolated record, everything else the plain baseline record.
fn reference_words<'a>(
    schema: &NetworkSchema,
    entry: &EntityEntry,
    baseline: &'a WorldSnapshot,
    prediction: Option<(&WorldSnapshot, &WorldSnapshot)>,
    predicted: &'a mut Vec<u32>,
) -> &'a [u32] {
    let b0 = baseline.data(entry);
    let Some((s1, s2)) = prediction else {
        return b0;
    };
    let (Some(b1), Some(b2)) = (same_spawn(s1, entry), same_spawn(s2, entry)) else {
        return b0;
    };

    predicted.clear();
    predicted.resize(schema.word_count(), 0);
    predict_record(schema, b0, b1, b2, predicted);
    predicted
}

fn same_spawn<'s>(snapshot: &'s WorldSnapshot, entry: &EntityEntry) -> Option<&'s [u32]> {
    snapshot
        .find(entry.id)
        .filter(|e| e.same_entity(entry))
        .map(|e| snapshot.data(e))
}

fn entity_schema(schemas: &SchemaRegistry, type_id: u16) -> Result<&NetworkSchema, ProtocolError> {
    schemas
        .get(SchemaCategory::Entity, type_id)
        .ok_or(ProtocolError::MissingEntitySchema(type_id))
}

/// Schema of a baseline entity, checked against the words stored for it.
fn baseline_schema<'s>(
    schemas: &'s SchemaRegistry,
    baseline: &WorldSnapshot,
    entry: &EntityEntry,
) -> Result<&'s NetworkSchema, ProtocolError> {
    let schema = entity_schema(schemas, entry.type_id)?;
    if baseline.data(entry).len() != schema.word_count() {
        return Err(ProtocolError::InvalidSchema(format!(
            "entity {} no longer matches schema {}",
            entry.id, entry.type_id
        )));
    }
    Ok(schema)
}

/// Snapshot message encoder and decoder with reusable scratch records.
#[derive(Debug, Default)]
pub struct SnapshotCodec {
    predicted: Vec<u32>,
    zeros: Vec<u32>,
}

impl SnapshotCodec {
    pub fn new() -> Self {
        Self::default()
    }

    fn zeros(&mut self, words: usize) -> &[u32] {
        if self.zeros.len() < words {
            self.zeros.resize(words, 0);
        }
        &self.zeros[..words]
    }

    /// Writes `frame.current` relative to its baselines.
    ///
    /// Entities of the baseline missing from the current snapshot go out as
    /// a despawn list. Unchanged entities are left out, new entities carry
    /// their type and, until the peer acks it, their schema. Types whose
    /// schema was written are appended to `sent_schemas`.
    pub fn write(
        &mut self,
        writer: &mut BitWriter,
        frame: &SnapshotFrame<'_>,
        schemas: &SchemaRegistry,
        acked: &AckedSchemas,
        sent_schemas: &mut Vec<u16>,
    ) -> Result<(), ProtocolError> {
        let current = frame.current;
        let prediction = frame.baseline.and(frame.prediction);

        writer.write_bool(frame.baseline.is_some());
        if let Some(baseline) = frame.baseline {
            writer.write_packed_u32(current.sequence.wrapping_sub(baseline.sequence));
        }
        writer.write_bool(prediction.is_some());
        if let (Some(baseline), Some((s1, s2))) = (frame.baseline, prediction) {
            writer.write_packed_u32(baseline.sequence.wrapping_sub(s1.sequence));
            writer.write_packed_u32(s1.sequence.wrapping_sub(s2.sequence));
        }
        writer.write_bits(current.sequence, 32);
        match frame.baseline {
            Some(baseline) => {
                writer.write_packed_i32(current.server_time.wrapping_sub(baseline.server_time) as i32)
            }
            None => writer.write_bits(current.server_time, 32),
        }
        writer.write_bits(frame.sim_time_ms as u32, 8);

        let despawned = |entry: &&EntityEntry| {
            !current
                .find(entry.id)
                .is_some_and(|e| e.same_entity(entry))
        };
        let baseline_entities = frame.baseline.map_or(&[][..], |b| b.entities());
        writer.write_packed_u32(baseline_entities.iter().filter(despawned).count() as u32);
        for entry in baseline_entities.iter().filter(despawned) {
            writer.write_bits(entry.id as u32, ENTITY_ID_BITS);
        }

        let mut updates = 0u32;
        for entry in current.entities() {
            if self.needs_update(frame, schemas, entry)? {
                updates += 1;
            }
        }
        writer.write_packed_u32(updates);

        for entry in current.entities() {
            if !self.needs_update(frame, schemas, entry)? {
                continue;
            }
            let schema = entity_schema(schemas, entry.type_id)?;
            let record = current.data(entry);
            writer.write_bits(entry.id as u32, ENTITY_ID_BITS);

            match frame.baseline.and_then(|b| Self::base_entry(b, entry).map(|e| (b, e))) {
                Some((baseline, base)) => {
                    writer.write_bool(false);
                    let reference =
                        reference_words(schema, base, baseline, prediction, &mut self.predicted);
                    copy_fields_from_buffer(writer, schema, record, Some(reference));
                }
                None => {
                    writer.write_bool(true);
                    writer.write_bits(entry.type_id as u32, SchemaCategory::Entity.id_bits());
                    writer.write_packed_u32(current.sequence.wrapping_sub(entry.spawn_sequence));
                    let send_schema = !acked.is_acked(SchemaCategory::Entity, entry.type_id)
                        && !sent_schemas.contains(&entry.type_id);
                    writer.write_bool(send_schema);
                    if send_schema {
                        write_schema(writer, schema);
                        sent_schemas.push(entry.type_id);
                    }
                    let zeros = self.zeros(schema.word_count());
                    copy_fields_from_buffer(writer, schema, record, Some(zeros));
                }
            }
        }
        Ok(())
    }

    fn base_entry<'b>(baseline: &'b WorldSnapshot, entry: &EntityEntry) -> Option<&'b EntityEntry> {
        baseline.find(entry.id).filter(|e| e.same_entity(entry))
    }

    fn needs_update(
        &mut self,
        frame: &SnapshotFrame<'_>,
        schemas: &SchemaRegistry,
        entry: &EntityEntry,
    ) -> Result<bool, ProtocolError> {
        let Some(baseline) = frame.baseline else {
            return Ok(true);
        };
        let Some(base) = Self::base_entry(baseline, entry) else {
            return Ok(true);
        };
        let schema = entity_schema(schemas, entry.type_id)?;
        let reference =
            reference_words(schema, base, baseline, frame.prediction, &mut self.predicted);
        Ok(frame.current.data(entry) != reference)
    }

    /// Decodes a snapshot message into `out`, resolving baselines from
    /// `snapshots`. Schemas carried by the message are stored in `schemas`.
    pub fn read(
        &mut self,
        reader: &mut BitReader<'_>,
        snapshots: &SequenceBuffer<WorldSnapshot>,
        schemas: &mut SchemaRegistry,
        out: &mut WorldSnapshot,
        words: usize,
    ) -> Result<SnapshotHeader, ProtocolError> {
        let baseline_delta = if reader.read_bool()? {
            Some(reader.read_packed_u32()?)
        } else {
            None
        };
        let prediction_deltas = if reader.read_bool()? {
            Some((reader.read_packed_u32()?, reader.read_packed_u32()?))
        } else {
            None
        };
        let sequence = reader.read_bits(32)?;

        let lookup = |seq: u32| snapshots.get(seq).ok_or(ProtocolError::MissingBaseline(seq));
        let baseline = baseline_delta
            .map(|delta| lookup(sequence.wrapping_sub(delta)))
            .transpose()?;
        let prediction = match (baseline, prediction_deltas) {
            (Some(b0), Some((d1, d2))) => {
                let s1 = b0.sequence.wrapping_sub(d1);
                let s2 = s1.wrapping_sub(d2);
                Some((lookup(s1)?, lookup(s2)?))
            }
            (None, Some(_)) => return Err(ProtocolError::InvalidHeader),
            _ => None,
        };

        let server_time = match baseline {
            Some(b0) => b0.server_time.wrapping_add(reader.read_packed_i32()? as u32),
            None => reader.read_bits(32)?,
        };
        let sim_time_ms = reader.read_bits(8)? as u8;
        out.reset(sequence, server_time, words);

        let despawn_count = reader.read_packed_u32()? as usize;
        if despawn_count > baseline.map_or(0, |b| b.entity_count()) {
            return Err(ProtocolError::InvalidHeader);
        }
        let mut despawned = Vec::with_capacity(despawn_count);
        for _ in 0..despawn_count {
            despawned.push(reader.read_bits(ENTITY_ID_BITS)? as u16);
        }

        let base_entities = baseline.map_or(&[][..], |b| b.entities());
        let mut next_base = 0;
        let update_count = reader.read_packed_u32()?;

        for _ in 0..update_count {
            let id = reader.read_bits(ENTITY_ID_BITS)? as u16;
            let is_new = reader.read_bool()?;
            if out.entities().last().is_some_and(|last| last.id >= id) {
                return Err(ProtocolError::InvalidHeader);
            }

            while let Some(entry) = base_entities.get(next_base).filter(|e| e.id < id) {
                next_base += 1;
                if let Some(b0) = baseline.filter(|_| !despawned.contains(&entry.id)) {
                    self.carry_over(out, entry, b0, prediction, schemas)?;
                }
            }

            if is_new {
                if let Some(entry) = base_entities.get(next_base).filter(|e| e.id == id) {
                    if !despawned.contains(&entry.id) {
                        return Err(ProtocolError::InvalidHeader);
                    }
                    next_base += 1;
                }

                let type_id = reader.read_bits(SchemaCategory::Entity.id_bits())? as u16;
                let spawn_sequence = sequence.wrapping_sub(reader.read_packed_u32()?);
                if reader.read_bool()? {
                    let schema = read_schema(reader, type_id)?;
                    schemas
                        .replace(SchemaCategory::Entity, schema)
                        .map_err(|e| ProtocolError::InvalidSchema(e.to_string()))?;
                }
                let schema = entity_schema(schemas, type_id)?;
                let count = schema.word_count();
                check_room(out, count)?;
                if self.zeros.len() < count {
                    self.zeros.resize(count, 0);
                }
                let record = out.push_entity(id, type_id, spawn_sequence, count);
                copy_fields_to_buffer(reader, schema, record, Some(&self.zeros[..count]))?;
            } else {
                let (Some(b0), Some(entry)) =
                    (baseline, base_entities.get(next_base).filter(|e| e.id == id))
                else {
                    return Err(ProtocolError::UnknownEntity(id));
                };
                if despawned.contains(&id) {
                    return Err(ProtocolError::UnknownEntity(id));
                }
                next_base += 1;

                let schema = baseline_schema(schemas, b0, entry)?;
                check_room(out, schema.word_count())?;
                let reference = reference_words(schema, entry, b0, prediction, &mut self.predicted);
                let record =
                    out.push_entity(id, entry.type_id, entry.spawn_sequence, schema.word_count());
                copy_fields_to_buffer(reader, schema, record, Some(reference))?;
            }
        }

        if let Some(b0) = baseline {
            for entry in &base_entities[next_base..] {
                if !despawned.contains(&entry.id) {
                    self.carry_over(out, entry, b0, prediction, schemas)?;
                }
            }
        }

        Ok(SnapshotHeader {
            sequence,
            server_time,
            sim_time_ms,
            baseline: baseline.map(|b| b.sequence),
            prediction: prediction.map(|(s1, s2)| (s1.sequence, s2.sequence)),
        })
    }

    /// Copies an entity the message left out, at its reference value.
    fn carry_over(
        &mut self,
        out: &mut WorldSnapshot,
        entry: &EntityEntry,
        baseline: &WorldSnapshot,
        prediction: Option<(&WorldSnapshot, &WorldSnapshot)>,
        schemas: &SchemaRegistry,
    ) -> Result<(), ProtocolError> {
        let schema = baseline_schema(schemas, baseline, entry)?;
        check_room(out, schema.word_count())?;
        let reference = reference_words(schema, entry, baseline, prediction, &mut self.predicted);
        out.push_entity(entry.id, entry.type_id, entry.spawn_sequence, schema.word_count())
            .copy_from_slice(reference);
        Ok(())
    }
}

fn check_room(out: &WorldSnapshot, words: usize) -> Result<(), ProtocolError> {
    if out.words_used() + words > out.capacity() {
        return Err(ProtocolError::SnapshotOverflow(out.sequence));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use glam::Vec3;

    use super::*;
    use crate::schema::{FieldReader, FieldType, FieldWriter};

    const WORDS: usize = 512;

    fn schemas() -> SchemaRegistry {
        let mut registry = SchemaRegistry::new();
        registry
            .register(
                SchemaCategory::Entity,
                NetworkSchema::new(1)
                    .with_field("pos", FieldType::Vector3, 24, 2)
                    .with_field("health", FieldType::Int, 8, 0),
            )
            .unwrap();
        registry
    }

    fn snapshot(
        schemas: &SchemaRegistry,
        sequence: u32,
        entities: &[(u16, u32, f32, i32)],
    ) -> WorldSnapshot {
        let schema = schemas.get(SchemaCategory::Entity, 1).unwrap();
        let mut snapshot = WorldSnapshot::with_capacity(WORDS);
        snapshot.reset(sequence, sequence * 2, WORDS);
        for &(id, spawn, x, health) in entities {
            let record = snapshot.push_entity(id, 1, spawn, schema.word_count());
            let mut writer = FieldWriter::new(schema, record);
            writer.write_vec3(Vec3::new(x, 1.0, -2.0));
            writer.write_int(health);
            writer.finish();
        }
        snapshot
    }

    fn ring(snapshots: &[&WorldSnapshot]) -> SequenceBuffer<WorldSnapshot> {
        let mut ring = SequenceBuffer::new(16);
        for s in snapshots {
            ring.insert(s.sequence, (*s).clone());
        }
        ring
    }

    fn roundtrip(
        frame: SnapshotFrame<'_>,
        client_ring: &SequenceBuffer<WorldSnapshot>,
        client_schemas: &mut SchemaRegistry,
    ) -> (WorldSnapshot, SnapshotHeader, usize) {
        let server_schemas = schemas();
        let mut writer = BitWriter::new();
        let mut sent = Vec::new();
        SnapshotCodec::new()
            .write(&mut writer, &frame, &server_schemas, &AckedSchemas::new(), &mut sent)
            .unwrap();
        let bits = writer.bit_len();
        let data = writer.finish();

        let mut out = WorldSnapshot::with_capacity(WORDS);
        let header = SnapshotCodec::new()
            .read(&mut BitReader::new(&data), client_ring, client_schemas, &mut out, WORDS)
            .unwrap();
        (out, header, bits)
    }

    fn assert_same(a: &WorldSnapshot, b: &WorldSnapshot) {
        assert_eq!(a.entities(), b.entities());
        for entry in a.entities() {
            assert_eq!(a.data(entry), b.data(entry), "entity {}", entry.id);
        }
    }

    #[test]
    fn test_full_snapshot_sends_schemas() {
        let server = schemas();
        let current = snapshot(&server, 3, &[(1, 1, 0.5, 100), (4, 3, -7.25, 20)]);
        let mut client_schemas = SchemaRegistry::new();

        let frame = SnapshotFrame {
            current: &current,
            baseline: None,
            prediction: None,
            sim_time_ms: 7,
        };
        let (out, header, _) = roundtrip(frame, &ring(&[]), &mut client_schemas);

        assert_same(&out, &current);
        assert_eq!(header.server_time, 6);
        assert_eq!(header.sim_time_ms, 7);
        assert_eq!(header.baseline, None);
        assert!(client_schemas.get(SchemaCategory::Entity, 1).is_some());
    }

    #[test]
    fn test_delta_handles_spawn_despawn_and_unchanged() {
        let server = schemas();
        let base = snapshot(&server, 10, &[(1, 1, 0.0, 100), (2, 1, 5.0, 50), (3, 1, 9.0, 10)]);
        let current = snapshot(&server, 12, &[(1, 1, 0.0, 100), (3, 12, 1.0, 30), (5, 12, 2.0, 40)]);

        let frame = SnapshotFrame {
            current: &current,
            baseline: Some(&base),
            prediction: None,
            sim_time_ms: 0,
        };
        let mut client_schemas = schemas();
        let (out, header, _) = roundtrip(frame, &ring(&[&base]), &mut client_schemas);

        assert_same(&out, &current);
        assert_eq!(header.baseline, Some(10));
        assert_eq!(out.find(3).unwrap().spawn_sequence, 12);
    }

    #[test]
    fn test_unchanged_world_costs_almost_nothing() {
        let server = schemas();
        let entities: Vec<_> = (1..40).map(|id| (id, 1, id as f32, 1)).collect();
        let base = snapshot(&server, 20, &entities);
        let mut current = base.clone();
        current.sequence = 21;
        current.server_time = 42;

        let frame = SnapshotFrame {
            current: &current,
            baseline: Some(&base),
            prediction: None,
            sim_time_ms: 0,
        };
        let (out, _, bits) = roundtrip(frame, &ring(&[&base]), &mut schemas());
        assert_same(&out, &current);
        assert!(bits < 96, "{bits} bits for an unchanged world");
    }

    #[test]
    fn test_linear_motion_is_predicted() {
        let server = schemas();
        let s2 = snapshot(&server, 30, &[(1, 1, 1.0, 90)]);
        let s1 = snapshot(&server, 31, &[(1, 1, 2.0, 90)]);
        let b0 = snapshot(&server, 32, &[(1, 1, 3.0, 90)]);
        let current = snapshot(&server, 33, &[(1, 1, 4.0, 90)]);

        let frame = SnapshotFrame {
            current: &current,
            baseline: Some(&b0),
            prediction: Some((&s1, &s2)),
            sim_time_ms: 0,
        };
        let client_ring = ring(&[&s2, &s1, &b0]);
        let (out, header, predicted_bits) = roundtrip(frame, &client_ring, &mut schemas());
        assert_same(&out, &current);
        assert_eq!(header.prediction, Some((31, 30)));

        let plain = SnapshotFrame {
            prediction: None,
            ..frame
        };
        let (_, _, plain_bits) = roundtrip(plain, &client_ring, &mut schemas());
        assert!(predicted_bits < plain_bits);

        let schema = server.get(SchemaCategory::Entity, 1).unwrap();
        let (_, words) = out.entity(1).unwrap();
        assert!(FieldReader::new(schema, words).read_vec3().abs_diff_eq(Vec3::new(4.0, 1.0, -2.0), 1e-3));
    }

    #[test]
    fn test_respawned_id_is_not_predicted_from_old_spawn() {
        let server = schemas();
        let s2 = snapshot(&server, 40, &[(1, 1, 1.0, 90)]);
        let s1 = snapshot(&server, 41, &[(1, 1, 2.0, 90)]);
        let b0 = snapshot(&server, 42, &[(1, 42, 0.0, 100)]);
        let current = snapshot(&server, 43, &[(1, 42, 0.0, 100)]);

        let frame = SnapshotFrame {
            current: &current,
            baseline: Some(&b0),
            prediction: Some((&s1, &s2)),
            sim_time_ms: 0,
        };
        let (out, _, _) = roundtrip(frame, &ring(&[&s2, &s1, &b0]), &mut schemas());
        assert_same(&out, &current);
    }

    #[test]
    fn test_missing_baseline_is_reported() {
        let server = schemas();
        let base = snapshot(&server, 50, &[(1, 1, 0.0, 1)]);
        let current = snapshot(&server, 51, &[(1, 1, 1.0, 1)]);

        let mut writer = BitWriter::new();
        SnapshotCodec::new()
            .write(
                &mut writer,
                &SnapshotFrame {
                    current: &current,
                    baseline: Some(&base),
                    prediction: None,
                    sim_time_ms: 0,
                },
                &server,
                &AckedSchemas::new(),
                &mut Vec::new(),
            )
            .unwrap();
        let data = writer.finish();

        let mut out = WorldSnapshot::with_capacity(WORDS);
        let err = SnapshotCodec::new()
            .read(&mut BitReader::new(&data), &ring(&[]), &mut schemas(), &mut out, WORDS)
            .unwrap_err();
        assert_eq!(err, ProtocolError::MissingBaseline(50));
    }

    #[test]
    fn test_acked_schema_is_not_resent() {
        let server = schemas();
        let current = snapshot(&server, 3, &[(1, 3, 0.0, 1), (2, 3, 0.0, 1)]);
        let frame = SnapshotFrame {
            current: &current,
            baseline: None,
            prediction: None,
            sim_time_ms: 0,
        };

        let mut sent = Vec::new();
        let mut writer = BitWriter::new();
        SnapshotCodec::new()
            .write(&mut writer, &frame, &server, &AckedSchemas::new(), &mut sent)
            .unwrap();
        assert_eq!(sent, vec![1]);
        let with_schema = writer.bit_len();

        let mut acked = AckedSchemas::new();
        acked.acknowledge(SchemaCategory::Entity, 1);
        let mut sent = Vec::new();
        let mut writer = BitWriter::new();
        SnapshotCodec::new()
            .write(&mut writer, &frame, &server, &acked, &mut sent)
            .unwrap();
        assert!(sent.is_empty());
        assert!(writer.bit_len() < with_schema);
    }

    #[test]
    fn test_client_without_schema_fails_cleanly() {
        let server = schemas();
        let current = snapshot(&server, 3, &[(1, 3, 0.0, 1)]);
        let mut acked = AckedSchemas::new();
        acked.acknowledge(SchemaCategory::Entity, 1);

        let mut writer = BitWriter::new();
        SnapshotCodec::new()
            .write(
                &mut writer,
                &SnapshotFrame {
                    current: &current,
                    baseline: None,
                    prediction: None,
                    sim_time_ms: 0,
                },
                &server,
                &acked,
                &mut Vec::new(),
            )
            .unwrap();
        let data = writer.finish();

        let mut out = WorldSnapshot::with_capacity(WORDS);
        let err = SnapshotCodec::new()
            .read(&mut BitReader::new(&data), &ring(&[]), &mut SchemaRegistry::new(), &mut out, WORDS)
            .unwrap_err();
        assert_eq!(err, ProtocolError::MissingEntitySchema(1));
    }
}
