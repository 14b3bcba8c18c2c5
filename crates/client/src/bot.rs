use glam::{Vec2, Vec3};
use log::{info, warn};

use steelnet::{
    ClientGame, ClientTimeline, FieldReader, FieldType, FieldWriter, MapInfo, NetworkClient,
    NetworkEvent, NetworkSchema, SchemaCategory, SchemaRegistry, WorldSnapshot,
};

const PLAYER_TYPE: u16 = 2;
const JOINED_EVENT: u16 = 0;
const TURN_RATE: f32 = 0.02;

/// Headless player that walks in circles and reports where the server
/// says it is.
pub struct Bot {
    report_interval: u32,
    level: Option<String>,
    frames: u32,
}

impl Bot {
    pub fn new(report_interval: u32) -> Self {
        Self {
            report_interval,
            level: None,
            frames: 0,
        }
    }
}

fn starts_with_position(schema: &NetworkSchema) -> bool {
    schema
        .fields()
        .first()
        .is_some_and(|field| field.field_type == FieldType::Vector3)
}

fn position(snapshot: &WorldSnapshot, schemas: &SchemaRegistry, id: u16) -> Option<Vec3> {
    let (entry, data) = snapshot.entity(id)?;
    let schema = schemas.get(SchemaCategory::Entity, entry.type_id)?;
    if !starts_with_position(schema) {
        return None;
    }
    Some(FieldReader::new(schema, data).read_vec3())
}

/// Entity id of the player body owned by `client_id`.
fn own_player(snapshot: &WorldSnapshot, schemas: &SchemaRegistry, client_id: u8) -> Option<u16> {
    let schema = schemas.get(SchemaCategory::Entity, PLAYER_TYPE)?;
    let layout = [FieldType::Vector3, FieldType::Quaternion, FieldType::UInt];
    let matches = schema.fields().len() == layout.len()
        && schema.fields().iter().zip(layout).all(|(f, ty)| f.field_type == ty);
    if !matches {
        return None;
    }
    snapshot
        .entities()
        .iter()
        .filter(|entry| entry.type_id == PLAYER_TYPE)
        .find(|entry| {
            let mut reader = FieldReader::new(schema, snapshot.data(entry));
            reader.read_vec3();
            reader.read_quat();
            reader.read_uint() == client_id as u32
        })
        .map(|entry| entry.id)
}

impl ClientGame for Bot {
    fn command_schema(&self) -> NetworkSchema {
        NetworkSchema::new(0)
            .with_field("move", FieldType::Vector2, 16, 2)
            .with_field("yaw", FieldType::Float, 16, 3)
            .with_field("sprint", FieldType::Bool, 1, 0)
    }

    fn begin_load(&mut self, map: &MapInfo) {
        let is_named = map
            .schema
            .fields()
            .first()
            .is_some_and(|field| field.field_type == FieldType::String);
        self.level = is_named.then(|| FieldReader::new(&map.schema, &map.words).read_string());
        info!("Loading map {} ({:?})", map.map_id, self.level);
    }

    fn poll_loaded(&mut self) -> bool {
        true
    }

    fn sample_command(&mut self, tick: u32, writer: &mut FieldWriter<'_>) {
        writer.write_vec2(Vec2::new(0.0, 1.0));
        writer.write_float((tick as f32 * TURN_RATE) % std::f32::consts::TAU);
        writer.write_bool(tick % 300 < 60);
    }

    fn on_event(&mut self, event: &NetworkEvent, schemas: &SchemaRegistry) {
        let Some(schema) = schemas.get(SchemaCategory::Event, event.type_id) else {
            warn!("Event of unknown type {}", event.type_id);
            return;
        };
        let is_join = event.type_id == JOINED_EVENT
            && schema.fields().first().is_some_and(|f| f.field_type == FieldType::UInt);
        if is_join {
            let client = FieldReader::new(schema, &event.words).read_uint();
            info!("Client {client} joined");
        }
    }

    fn present(&mut self, network: &NetworkClient, timeline: &ClientTimeline) {
        self.frames += 1;
        if self.report_interval == 0 || self.frames % self.report_interval != 0 {
            return;
        }
        let Some((from, to, t)) = network.interpolation_pair(timeline.render()) else {
            return;
        };
        let schemas = network.schemas();
        let Some(id) = network
            .client_id()
            .and_then(|client| own_player(to, schemas, client))
        else {
            info!("{} entities, no player yet", to.entity_count());
            return;
        };
        let to_position = position(to, schemas, id);
        let from_position = position(from, schemas, id).or(to_position);
        if let (Some(a), Some(b)) = (from_position, to_position) {
            let counters = timeline.counters();
            info!(
                "Player {id} at {:.2} | predicted tick {} render tick {} | {counters:?}",
                a.lerp(b, t),
                timeline.predicted().tick,
                timeline.render().tick,
            );
        }
    }
}
