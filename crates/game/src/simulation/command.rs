use crate::net::{BitReader, BitWriter, ProtocolError, SequenceBuffer, tick_greater_than};
use crate::schema::{
    AckedSchemas, NetworkSchema, SchemaCategory, SchemaRegistry, copy_fields_from_buffer,
    copy_fields_to_buffer, read_schema, write_schema,
};

/// Player input for one tick, laid out by a command schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserCommand {
    pub tick: u32,
    pub words: Vec<u32>,
}

/// Commands keyed by tick in a fixed ring.
#[derive(Debug)]
pub struct CommandBuffer {
    commands: SequenceBuffer<Vec<u32>>,
    newest_tick: Option<u32>,
}

impl CommandBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            commands: SequenceBuffer::new(capacity),
            newest_tick: None,
        }
    }

    pub fn store(&mut self, tick: u32, words: &[u32]) {
        let slot = self.commands.acquire(tick);
        slot.clear();
        slot.extend_from_slice(words);
        if self.newest_tick.is_none_or(|newest| tick_greater_than(tick, newest)) {
            self.newest_tick = Some(tick);
        }
    }

    pub fn get(&self, tick: u32) -> Option<&[u32]> {
        self.commands.get(tick).map(Vec::as_slice)
    }

    pub fn newest_tick(&self) -> Option<u32> {
        self.newest_tick
    }

    pub fn clear(&mut self) {
        self.commands.clear();
        self.newest_tick = None;
    }

    /// Writes up to `count` consecutive commands ending at the newest one and
    /// returns the newest tick written.
    ///
    /// The oldest command goes out in full, the rest as deltas against the
    /// command before them. The schema is sent inline until acked, in which
    /// case `sent_schema` is set.
    pub fn write(
        &self,
        writer: &mut BitWriter,
        schema: &NetworkSchema,
        acked: &AckedSchemas,
        count: usize,
        sent_schema: &mut bool,
    ) -> Option<u32> {
        let newest = self.newest_tick?;
        let available = (0..count.max(1) as u32)
            .take_while(|&age| self.commands.contains(newest.wrapping_sub(age)))
            .count() as u32;

        writer.write_bits(schema.id as u32, SchemaCategory::Command.id_bits());
        *sent_schema = !acked.is_acked(SchemaCategory::Command, schema.id);
        writer.write_bool(*sent_schema);
        if *sent_schema {
            write_schema(writer, schema);
        }
        writer.write_packed_u32(available);
        writer.write_bits(newest, 32);

        let mut previous: Option<&[u32]> = None;
        for age in (0..available).rev() {
            let tick = newest.wrapping_sub(age);
            let words = self.get(tick)?;
            copy_fields_from_buffer(writer, schema, words, previous);
            previous = Some(words);
        }
        Some(newest)
    }
}

/// Decodes a command block into its schema id and the commands, oldest
/// first.
pub fn read_commands(
    reader: &mut BitReader<'_>,
    schemas: &mut SchemaRegistry,
) -> Result<(u16, Vec<UserCommand>), ProtocolError> {
    let type_id = reader.read_bits(SchemaCategory::Command.id_bits())? as u16;
    if reader.read_bool()? {
        let schema = read_schema(reader, type_id)?;
        schemas
            .replace(SchemaCategory::Command, schema)
            .map_err(|e| ProtocolError::InvalidSchema(e.to_string()))?;
    }
    let schema = schemas
        .get(SchemaCategory::Command, type_id)
        .ok_or(ProtocolError::UnknownSchema {
            category: SchemaCategory::Command.name(),
            id: type_id,
        })?;

    let count = reader.read_packed_u32()?;
    if count as usize > reader.remaining_bits() {
        return Err(ProtocolError::InvalidHeader);
    }
    let newest = reader.read_bits(32)?;

    let mut commands: Vec<UserCommand> = Vec::with_capacity(count as usize);
    for age in (0..count).rev() {
        let mut words = vec![0; schema.word_count()];
        let previous = commands.last().map(|c| c.words.as_slice());
        copy_fields_to_buffer(reader, schema, &mut words, previous)?;
        commands.push(UserCommand {
            tick: newest.wrapping_sub(age),
            words,
        });
    }
    Ok((type_id, commands))
}
