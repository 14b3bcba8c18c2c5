pub mod client;
pub mod config;
pub mod event;
pub mod game_loop;
pub mod map;
pub mod net;
pub mod schema;
pub mod server;
pub mod simulation;
pub mod snapshot;

pub use client::{ClientConnectionState, ClientTimeline, NetworkClient, TimeSync};
pub use config::{ConfigError, NetworkConfig, ReconciliationConfig, UdpSettings};
pub use event::{EventQueue, NetworkEvent, ReliabilityMode};
pub use game_loop::{
    ClientGame, ClientGameLoop, ClientState, ServerGame, ServerGameLoop, ServerState,
    StateMachine,
};
pub use map::MapInfo;
pub use net::{
    ConnectionId, DEFAULT_PORT, DEFAULT_TICK_RATE, LoopbackNetwork, NetworkConnection,
    PacketLossSimulation, ProtocolError, Transport, TransportError, TransportEvent, UdpTransport,
};
pub use schema::{
    FieldReader, FieldType, FieldWriter, NetworkSchema, SchemaCategory, SchemaError,
    SchemaRegistry,
};
pub use server::{NetworkServer, ServerEvent};
pub use simulation::{CommandBuffer, GameTime, TickScheduler, UserCommand};
pub use snapshot::{EntitySerializer, SnapshotEngine, WorldSnapshot};
