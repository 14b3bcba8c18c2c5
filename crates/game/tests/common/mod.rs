#![allow(dead_code)]

use std::collections::BTreeMap;

use glam::{Vec2, Vec3};

use steelnet::client::ClientTimeline;
use steelnet::snapshot::EntitySerializer;
use steelnet::{
    ClientGame, ClientGameLoop, FieldReader, FieldType, FieldWriter, LoopbackNetwork, MapInfo,
    NetworkClient, NetworkConfig, NetworkEvent, NetworkSchema, NetworkServer, ReconciliationConfig,
    ReliabilityMode, SchemaError, SchemaRegistry, ServerGame, ServerGameLoop,
};
use steelnet::net::ConnectionId;

pub const FRAME_MS: u64 = 16;
pub const ORB_TYPE: u16 = 0;
pub const WELCOME_EVENT: u16 = 0;

pub fn orb_schema() -> NetworkSchema {
    NetworkSchema::new(ORB_TYPE)
        .with_field("position", FieldType::Vector3, 20, 2)
        .with_field("label", FieldType::UInt, 16, 0)
}

pub fn welcome_schema() -> NetworkSchema {
    NetworkSchema::new(WELCOME_EVENT).with_field("client", FieldType::UInt, 8, 0)
}

pub fn move_schema() -> NetworkSchema {
    NetworkSchema::new(0)
        .with_field("move", FieldType::Vector2, 16, 2)
        .with_field("tick", FieldType::UInt, 8, 0)
}

pub fn orbit(label: u32, tick: u32) -> Vec3 {
    let angle = tick as f32 * 0.05 + label as f32;
    Vec3::new(angle.cos() * 10.0, label as f32, angle.sin() * 10.0)
}

/// Server game with a few orbiting entities.
#[derive(Default)]
pub struct OrbitServer {
    pub orbs: BTreeMap<u16, u32>,
    pub orb_count: u32,
    pub tick: u32,
    /// Tick at which the newest orb is despawned.
    pub despawn_at: Option<u32>,
    pub commands_seen: usize,
    pub connected: Vec<ConnectionId>,
    pub disconnected: Vec<ConnectionId>,
    pub oversized: Vec<ConnectionId>,
}

impl OrbitServer {
    pub fn new(orb_count: u32) -> Self {
        Self {
            orb_count,
            ..Default::default()
        }
    }
}

impl EntitySerializer for OrbitServer {
    fn serialize_entity(&mut self, id: u16, _type_id: u16, writer: &mut FieldWriter<'_>) {
        let label = self.orbs.get(&id).copied().unwrap_or_default();
        writer.write_vec3(orbit(label, self.tick));
        writer.write_uint(label);
    }
}

impl ServerGame for OrbitServer {
    fn setup(&mut self, server: &mut NetworkServer) -> Result<(), SchemaError> {
        server.register_entity_type(orb_schema())?;
        server.register_event_type(welcome_schema())
    }

    fn begin_load(&mut self) {}

    fn poll_loaded(&mut self) -> bool {
        true
    }

    fn map_schema(&self) -> NetworkSchema {
        NetworkSchema::new(0).with_field("level", FieldType::String, 0, 0)
    }

    fn write_map(&self, writer: &mut FieldWriter<'_>) {
        writer.write_string("orbit_arena");
    }

    fn tick(&mut self, tick: u32, server: &mut NetworkServer) {
        self.tick = tick;
        if self.orbs.is_empty() {
            for label in 0..self.orb_count {
                let id = server.engine_mut().spawn(ORB_TYPE);
                self.orbs.insert(id, label);
            }
        }
        if self.despawn_at == Some(tick) {
            if let Some((&id, _)) = self.orbs.iter().next_back() {
                server.engine_mut().despawn(id);
                self.orbs.remove(&id);
            }
        }
        self.commands_seen += server
            .connections()
            .filter(|c| c.command(tick).is_some())
            .count();
    }

    fn client_connected(&mut self, id: ConnectionId, server: &mut NetworkServer) {
        self.connected.push(id);
        if let Some(schema) = server.event_schema(WELCOME_EVENT) {
            let event = NetworkEvent::new(schema, ReliabilityMode::Reliable, |w| {
                w.write_uint(id.0 as u32)
            });
            server.queue_event_to(id, event);
        }
    }

    fn client_disconnected(&mut self, id: ConnectionId, _server: &mut NetworkServer) {
        self.disconnected.push(id);
    }

    fn snapshot_too_large(&mut self, id: ConnectionId, _server: &mut NetworkServer) {
        self.oversized.push(id);
    }
}

/// Client game that loads instantly and steers in a circle.
#[derive(Default)]
pub struct OrbitClient {
    pub level: Option<String>,
    pub welcomes: Vec<u32>,
    pub commands_sampled: usize,
    pub interpolated_frames: usize,
}

impl ClientGame for OrbitClient {
    fn command_schema(&self) -> NetworkSchema {
        move_schema()
    }

    fn begin_load(&mut self, map: &MapInfo) {
        let mut reader = FieldReader::new(&map.schema, &map.words);
        self.level = Some(reader.read_string());
    }

    fn poll_loaded(&mut self) -> bool {
        self.level.is_some()
    }

    fn sample_command(&mut self, tick: u32, writer: &mut FieldWriter<'_>) {
        let angle = tick as f32 * 0.1;
        writer.write_vec2(Vec2::new(angle.cos(), angle.sin()));
        writer.write_uint(tick % 256);
        self.commands_sampled += 1;
    }

    fn on_event(&mut self, event: &NetworkEvent, schemas: &SchemaRegistry) {
        if event.type_id != WELCOME_EVENT {
            return;
        }
        if let Some(schema) = schemas.get(steelnet::SchemaCategory::Event, event.type_id) {
            self.welcomes.push(FieldReader::new(schema, &event.words).read_uint());
        }
    }

    fn present(&mut self, network: &NetworkClient, timeline: &ClientTimeline) {
        if network.interpolation_pair(timeline.render()).is_some() {
            self.interpolated_frames += 1;
        }
    }
}

pub struct Session {
    pub server: ServerGameLoop<OrbitServer>,
    pub client: ClientGameLoop<OrbitClient>,
    pub now_ms: u64,
}

impl Session {
    pub fn new(network: &LoopbackNetwork, game: OrbitServer) -> Self {
        let config = NetworkConfig::default();
        let server = ServerGameLoop::new(game, Box::new(network.endpoint()), config.clone()).unwrap();
        let client = ClientGameLoop::new(
            OrbitClient::default(),
            Box::new(network.endpoint()),
            config,
            ReconciliationConfig::default(),
        )
        .unwrap();

        let mut session = Self {
            server,
            client,
            now_ms: 1_000,
        };
        session.server.start(session.now_ms);
        session.client.start(session.now_ms);
        session
    }

    pub fn run_for(&mut self, millis: u64) {
        let end = self.now_ms + millis;
        while self.now_ms < end {
            self.now_ms += FRAME_MS;
            self.server.update(self.now_ms);
            self.client.update(self.now_ms);
        }
    }
}
