use crate::net::{BitReader, BitWriter, ProtocolError};
use crate::schema::{
    AckedSchemas, FieldWriter, NetworkSchema, SchemaCategory, SchemaRegistry,
    copy_fields_from_buffer, copy_fields_to_buffer, read_schema, write_schema,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReliabilityMode {
    #[default]
    Unreliable,
    Reliable,
}

impl ReliabilityMode {
    pub fn is_reliable(&self) -> bool {
        matches!(self, Self::Reliable)
    }
}

/// One game event: a record laid out by the event schema `type_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkEvent {
    pub type_id: u16,
    pub reliability: ReliabilityMode,
    pub words: Vec<u32>,
}

impl NetworkEvent {
    /// Builds an event by writing every field of `schema` through `fill`.
    pub fn new(
        schema: &NetworkSchema,
        reliability: ReliabilityMode,
        fill: impl FnOnce(&mut FieldWriter<'_>),
    ) -> Self {
        let mut words = vec![0; schema.word_count()];
        let mut writer = FieldWriter::new(schema, &mut words);
        fill(&mut writer);
        writer.finish();
        Self {
            type_id: schema.id,
            reliability,
            words,
        }
    }
}

/// Writes a batch of events. Schemas the peer has not acked are sent inline
/// once per batch and appended to `sent_schemas`.
pub fn write_events(
    writer: &mut BitWriter,
    events: &[NetworkEvent],
    schemas: &SchemaRegistry,
    acked: &AckedSchemas,
    sent_schemas: &mut Vec<u16>,
) -> Result<(), ProtocolError> {
    writer.write_packed_u32(events.len() as u32);
    for event in events {
        let schema = schemas
            .get(SchemaCategory::Event, event.type_id)
            .ok_or(ProtocolError::UnknownSchema {
                category: SchemaCategory::Event.name(),
                id: event.type_id,
            })?;
        writer.write_bits(event.type_id as u32, SchemaCategory::Event.id_bits());
        writer.write_bool(event.reliability.is_reliable());
        let send_schema = !acked.is_acked(SchemaCategory::Event, event.type_id)
            && !sent_schemas.contains(&event.type_id);
        writer.write_bool(send_schema);
        if send_schema {
            write_schema(writer, schema);
            sent_schemas.push(event.type_id);
        }
        copy_fields_from_buffer(writer, schema, &event.words, None);
    }
    Ok(())
}

pub fn read_events(
    reader: &mut BitReader<'_>,
    schemas: &mut SchemaRegistry,
) -> Result<Vec<NetworkEvent>, ProtocolError> {
    let count = reader.read_packed_u32()? as usize;
    // Every event costs at least its type id and two flag bits.
    let min_bits = SchemaCategory::Event.id_bits() as usize + 2;
    if count * min_bits > reader.remaining_bits() {
        return Err(ProtocolError::InvalidHeader);
    }

    let mut events = Vec::with_capacity(count);
    for _ in 0..count {
        let type_id = reader.read_bits(SchemaCategory::Event.id_bits())? as u16;
        let reliability = if reader.read_bool()? {
            ReliabilityMode::Reliable
        } else {
            ReliabilityMode::Unreliable
        };
        if reader.read_bool()? {
            let schema = read_schema(reader, type_id)?;
            schemas
                .replace(SchemaCategory::Event, schema)
                .map_err(|e| ProtocolError::InvalidSchema(e.to_string()))?;
        }
        let schema = schemas
            .get(SchemaCategory::Event, type_id)
            .ok_or(ProtocolError::UnknownSchema {
                category: SchemaCategory::Event.name(),
                id: type_id,
            })?;
        let mut words = vec![0; schema.word_count()];
        copy_fields_to_buffer(reader, schema, &mut words, None)?;
        events.push(NetworkEvent {
            type_id,
            reliability,
            words,
        });
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use glam::Vec3;

    use super::*;
    use crate::schema::{FieldReader, FieldType};

    fn registry() -> SchemaRegistry {
        let mut registry = SchemaRegistry::new();
        registry
            .register(
                SchemaCategory::Event,
                NetworkSchema::new(4)
                    .with_field("position", FieldType::Vector3, 20, 1)
                    .with_field("damage", FieldType::UInt, 10, 0),
            )
            .unwrap();
        registry
    }

    fn hit(registry: &SchemaRegistry, damage: u32) -> NetworkEvent {
        let schema = registry.get(SchemaCategory::Event, 4).unwrap();
        NetworkEvent::new(schema, ReliabilityMode::Reliable, |w| {
            w.write_vec3(Vec3::new(1.5, 0.0, -4.0));
            w.write_uint(damage);
        })
    }

    #[test]
    fn test_events_roundtrip_with_inline_schema() {
        let server = registry();
        let events = vec![hit(&server, 25), hit(&server, 90)];

        let mut writer = BitWriter::new();
        let mut sent = Vec::new();
        write_events(&mut writer, &events, &server, &AckedSchemas::new(), &mut sent).unwrap();
        assert_eq!(sent, vec![4]);
        let data = writer.finish();

        let mut client = SchemaRegistry::new();
        let decoded = read_events(&mut BitReader::new(&data), &mut client).unwrap();
        assert_eq!(decoded, events);

        let schema = client.get(SchemaCategory::Event, 4).unwrap();
        let mut reader = FieldReader::new(schema, &decoded[1].words);
        assert!(reader.read_vec3().abs_diff_eq(Vec3::new(1.5, 0.0, -4.0), 1e-3));
        assert_eq!(reader.read_uint(), 90);
    }

    #[test]
    fn test_unknown_event_schema_is_an_error() {
        let server = registry();
        let mut acked = AckedSchemas::new();
        acked.acknowledge(SchemaCategory::Event, 4);

        let mut writer = BitWriter::new();
        write_events(&mut writer, &[hit(&server, 1)], &server, &acked, &mut Vec::new()).unwrap();
        let data = writer.finish();

        let err = read_events(&mut BitReader::new(&data), &mut SchemaRegistry::new()).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownSchema { id: 4, .. }));
    }
}
