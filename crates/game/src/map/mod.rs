use crate::net::{BitReader, BitWriter, ProtocolError, sequence_greater_than};
use crate::schema::{
    FieldWriter, NetworkSchema, SchemaCategory, SchemaRegistry, copy_fields_from_buffer,
    copy_fields_to_buffer, read_schema, skip_fields, write_schema,
};

/// Description of the running map, one record of a map schema.
///
/// `map_id` grows with every map change so peers can tell a newer map from
/// a late copy of an older one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapInfo {
    pub map_id: u16,
    pub schema: NetworkSchema,
    pub words: Vec<u32>,
}

impl MapInfo {
    pub fn new(map_id: u16, schema: NetworkSchema, fill: impl FnOnce(&mut FieldWriter<'_>)) -> Self {
        let mut words = vec![0; schema.word_count()];
        let mut writer = FieldWriter::new(&schema, &mut words);
        fill(&mut writer);
        writer.finish();
        Self {
            map_id,
            schema,
            words,
        }
    }

    pub fn is_newer_than(&self, map_id: Option<u16>) -> bool {
        map_id.is_none_or(|current| sequence_greater_than(self.map_id, current))
    }

    pub fn write(&self, writer: &mut BitWriter, send_schema: bool) {
        writer.write_bits(self.map_id as u32, 16);
        writer.write_bits(self.schema.id as u32, SchemaCategory::Map.id_bits());
        writer.write_bool(send_schema);
        if send_schema {
            write_schema(writer, &self.schema);
        }
        copy_fields_from_buffer(writer, &self.schema, &self.words, None);
    }

    /// Reads a map info block. Returns `None`, with the fields skipped, when
    /// the map is not newer than `current`.
    pub fn read(
        reader: &mut BitReader<'_>,
        schemas: &mut SchemaRegistry,
        current: Option<u16>,
    ) -> Result<Option<MapInfo>, ProtocolError> {
        let map_id = reader.read_bits(16)? as u16;
        let schema_id = reader.read_bits(SchemaCategory::Map.id_bits())? as u16;
        if reader.read_bool()? {
            let schema = read_schema(reader, schema_id)?;
            schemas
                .replace(SchemaCategory::Map, schema)
                .map_err(|e| ProtocolError::InvalidSchema(e.to_string()))?;
        }
        let schema = schemas
            .get(SchemaCategory::Map, schema_id)
            .ok_or(ProtocolError::UnknownSchema {
                category: SchemaCategory::Map.name(),
                id: schema_id,
            })?;

        if current.is_some_and(|current| !sequence_greater_than(map_id, current)) {
            skip_fields(reader, schema, false)?;
            return Ok(None);
        }

        let mut words = vec![0; schema.word_count()];
        copy_fields_to_buffer(reader, schema, &mut words, None)?;
        Ok(Some(MapInfo {
            map_id,
            schema: schema.clone(),
            words,
        }))
    }
}
