use std::collections::BTreeMap;

use glam::{EulerRot, Quat, Vec2, Vec3};
use log::{debug, info, warn};

use steelnet::{
    ConnectionId, EntitySerializer, FieldReader, FieldType, FieldWriter, NetworkEvent,
    NetworkSchema, NetworkServer, ReliabilityMode, SchemaError, ServerGame,
};

pub const ORB_TYPE: u16 = 0;
pub const PROJECTILE_TYPE: u16 = 1;
pub const PLAYER_TYPE: u16 = 2;
pub const JOINED_EVENT: u16 = 0;

const GRAVITY: f32 = 9.8;
const ORBIT_RADIUS: f32 = 12.0;
const WALK_SPEED: f32 = 5.0;
const SPRINT_SPEED: f32 = 10.0;
const PROJECTILE_REST_TICKS: u32 = 60;
/// Players are kept inside a square of this half width.
const ARENA_HALF_EXTENT: f32 = 100.0;

#[derive(Debug, Clone, Copy)]
enum Body {
    Orb {
        phase: f32,
        height: f32,
    },
    Projectile {
        position: Vec3,
        velocity: Vec3,
        resting_ticks: u32,
    },
    Player {
        owner: ConnectionId,
        position: Vec3,
        yaw: f32,
    },
}

/// Input a client sampled for one tick.
#[derive(Debug, Clone, Copy, PartialEq)]
struct PlayerInput {
    movement: Vec2,
    yaw: f32,
    sprint: bool,
}

/// Layout clients must announce for their commands.
fn command_layout_matches(schema: &NetworkSchema) -> bool {
    let expected = [FieldType::Vector2, FieldType::Float, FieldType::Bool];
    schema.fields().len() == expected.len()
        && schema
            .fields()
            .iter()
            .zip(expected)
            .all(|(field, ty)| field.field_type == ty)
}

fn read_input(server: &NetworkServer, id: ConnectionId, tick: u32) -> Option<PlayerInput> {
    let connection = server.connection(id)?;
    let schema = connection.command_schema()?;
    if !command_layout_matches(schema) {
        return None;
    }
    let words = connection.command(tick)?;
    let mut reader = FieldReader::new(schema, words);
    Some(PlayerInput {
        movement: reader.read_vec2(),
        yaw: reader.read_float(),
        sprint: reader.read_bool(),
    })
}

/// Replicated demo content: orbs circling the origin, projectiles falling
/// under gravity and one player body per connected client.
pub struct Arena {
    level: String,
    orb_count: u32,
    projectile_interval: u32,
    bodies: BTreeMap<u16, Body>,
    players: BTreeMap<ConnectionId, u16>,
    orbs_spawned: bool,
    tick: u32,
    dt: f32,
    loaded: bool,
}

impl Arena {
    pub fn new(level: String, orb_count: u32, projectile_interval: u32, tick_rate: u32) -> Self {
        Self {
            level,
            orb_count,
            projectile_interval: projectile_interval.max(1),
            bodies: BTreeMap::new(),
            players: BTreeMap::new(),
            orbs_spawned: false,
            tick: 0,
            dt: 1.0 / tick_rate.max(1) as f32,
            loaded: false,
        }
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    fn orb_angle(&self, phase: f32) -> f32 {
        phase + self.tick as f32 * self.dt
    }

    fn spawn_orbs(&mut self, server: &mut NetworkServer) {
        for i in 0..self.orb_count {
            let id = server.engine_mut().spawn(ORB_TYPE);
            let phase = i as f32 / self.orb_count as f32 * std::f32::consts::TAU;
            self.bodies.insert(id, Body::Orb {
                phase,
                height: 1.0 + i as f32 * 0.5,
            });
        }
        self.orbs_spawned = true;
        info!("Spawned {} orbs", self.orb_count);
    }

    fn launch_projectile(&mut self, server: &mut NetworkServer) {
        let id = server.engine_mut().spawn(PROJECTILE_TYPE);
        let heading = self.tick as f32 * 0.37;
        self.bodies.insert(id, Body::Projectile {
            position: Vec3::new(0.0, 1.0, 0.0),
            velocity: Vec3::new(heading.cos() * 6.0, 8.0, heading.sin() * 6.0),
            resting_ticks: 0,
        });
        debug!("Launched projectile {id}");
    }

    fn simulate_projectiles(&mut self, server: &mut NetworkServer) {
        let dt = self.dt;
        let mut expired = Vec::new();
        for (&id, body) in &mut self.bodies {
            let Body::Projectile {
                position,
                velocity,
                resting_ticks,
            } = body
            else {
                continue;
            };
            velocity.y -= GRAVITY * dt;
            *position += *velocity * dt;
            if position.y < 0.0 {
                position.y = 0.0;
                *velocity = Vec3::ZERO;
                *resting_ticks += 1;
            }
            if *resting_ticks > PROJECTILE_REST_TICKS {
                expired.push(id);
            }
        }
        for id in expired {
            self.bodies.remove(&id);
            server.engine_mut().despawn(id);
        }
    }

    /// Moves every player by the command its client sampled for this tick.
    /// Ticks without a command keep the player still.
    fn apply_commands(&mut self, server: &NetworkServer) {
        let dt = self.dt;
        for (&owner, &entity) in &self.players {
            let Some(input) = read_input(server, owner, self.tick) else {
                continue;
            };
            let Some(Body::Player { position, yaw, .. }) = self.bodies.get_mut(&entity) else {
                continue;
            };
            let movement = input.movement.clamp_length_max(1.0);
            let speed = if input.sprint { SPRINT_SPEED } else { WALK_SPEED };
            let (sin_yaw, cos_yaw) = input.yaw.sin_cos();
            let world_move = Vec3::new(
                movement.x * cos_yaw + movement.y * sin_yaw,
                0.0,
                -movement.x * sin_yaw + movement.y * cos_yaw,
            );
            *position += world_move * speed * dt;
            position.x = position.x.clamp(-ARENA_HALF_EXTENT, ARENA_HALF_EXTENT);
            position.z = position.z.clamp(-ARENA_HALF_EXTENT, ARENA_HALF_EXTENT);
            *yaw = input.yaw;
        }
    }
}

impl EntitySerializer for Arena {
    fn serialize_entity(&mut self, id: u16, type_id: u16, writer: &mut FieldWriter<'_>) {
        match (type_id, self.bodies.get(&id).copied()) {
            (_, Some(Body::Orb { phase, height })) => {
                let angle = self.orb_angle(phase);
                writer.write_vec3(Vec3::new(
                    angle.cos() * ORBIT_RADIUS,
                    height,
                    angle.sin() * ORBIT_RADIUS,
                ));
                writer.write_quat(Quat::from_rotation_y(angle));
            }
            (_, Some(Body::Projectile { position, velocity, .. })) => {
                writer.write_vec3(position);
                writer.write_vec3(velocity);
            }
            (_, Some(Body::Player { owner, position, yaw })) => {
                writer.write_vec3(position);
                writer.write_quat(Quat::from_euler(EulerRot::YXZ, yaw, 0.0, 0.0));
                writer.write_uint(owner.0 as u32);
            }
            (PROJECTILE_TYPE, None) => {
                warn!("Entity {id} has no body");
                writer.write_vec3(Vec3::ZERO);
                writer.write_vec3(Vec3::ZERO);
            }
            (PLAYER_TYPE, None) => {
                warn!("Entity {id} has no body");
                writer.write_vec3(Vec3::ZERO);
                writer.write_quat(Quat::IDENTITY);
                writer.write_uint(0);
            }
            (_, None) => {
                warn!("Entity {id} has no body");
                writer.write_vec3(Vec3::ZERO);
                writer.write_quat(Quat::IDENTITY);
            }
        }
    }
}

impl ServerGame for Arena {
    fn setup(&mut self, server: &mut NetworkServer) -> Result<(), SchemaError> {
        server.register_entity_type(
            NetworkSchema::new(ORB_TYPE)
                .with_field("position", FieldType::Vector3, 20, 2)
                .with_field("rotation", FieldType::Quaternion, 16, 3),
        )?;
        server.register_entity_type(
            NetworkSchema::new(PROJECTILE_TYPE)
                .with_field("position", FieldType::Vector3, 20, 2)
                .with_field("velocity", FieldType::Vector3, 16, 2),
        )?;
        server.register_entity_type(
            NetworkSchema::new(PLAYER_TYPE)
                .with_field("position", FieldType::Vector3, 20, 2)
                .with_field("rotation", FieldType::Quaternion, 16, 3)
                .with_field("owner", FieldType::UInt, 8, 0),
        )?;
        server.register_event_type(
            NetworkSchema::new(JOINED_EVENT).with_field("client", FieldType::UInt, 8, 0),
        )
    }

    fn begin_load(&mut self) {
        info!("Loading level {}", self.level);
        self.loaded = true;
    }

    fn poll_loaded(&mut self) -> bool {
        self.loaded
    }

    fn map_schema(&self) -> NetworkSchema {
        NetworkSchema::new(0).with_field("level", FieldType::String, 0, 0)
    }

    fn write_map(&self, writer: &mut FieldWriter<'_>) {
        writer.write_string(&self.level);
    }

    fn tick(&mut self, tick: u32, server: &mut NetworkServer) {
        self.tick = tick;
        if !self.orbs_spawned {
            self.spawn_orbs(server);
        }
        if tick % self.projectile_interval == 0 {
            self.launch_projectile(server);
        }
        self.apply_commands(server);
        self.simulate_projectiles(server);
    }

    fn client_connected(&mut self, id: ConnectionId, server: &mut NetworkServer) {
        let entity = server.engine_mut().spawn(PLAYER_TYPE);
        self.bodies.insert(entity, Body::Player {
            owner: id,
            position: Vec3::new(0.0, 1.0, 0.0),
            yaw: 0.0,
        });
        self.players.insert(id, entity);
        info!("Client {id} controls entity {entity}");

        if let Some(schema) = server.event_schema(JOINED_EVENT) {
            let event = NetworkEvent::new(schema, ReliabilityMode::Reliable, |w| {
                w.write_uint(id.0 as u32)
            });
            server.queue_event(event);
        }
    }

    fn client_disconnected(&mut self, id: ConnectionId, server: &mut NetworkServer) {
        if let Some(entity) = self.players.remove(&id) {
            self.bodies.remove(&entity);
            server.engine_mut().despawn(entity);
            info!("Client {id} left, removed entity {entity}");
        }
    }
}
