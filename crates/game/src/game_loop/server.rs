use log::{info, warn};

use crate::config::NetworkConfig;
use crate::event::NetworkEvent;
use crate::net::{ConnectionId, Transport};
use crate::schema::{FieldWriter, NetworkSchema, SchemaError};
use crate::server::{NetworkServer, ServerEvent};
use crate::simulation::TickScheduler;
use crate::snapshot::EntitySerializer;

use super::state_machine::StateMachine;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerState {
    Connecting,
    Loading,
    Active,
}

/// Game side hooks the server loop drives.
///
/// The game also serializes its entities into every snapshot.
pub trait ServerGame: EntitySerializer {
    /// Registers entity and event schemas before anything is sent.
    fn setup(&mut self, server: &mut NetworkServer) -> Result<(), SchemaError>;

    fn begin_load(&mut self);

    fn poll_loaded(&mut self) -> bool;

    fn map_schema(&self) -> NetworkSchema;

    fn write_map(&self, writer: &mut FieldWriter<'_>);

    /// Advances the simulation to `tick`.
    fn tick(&mut self, tick: u32, server: &mut NetworkServer);

    fn client_connected(&mut self, _id: ConnectionId, _server: &mut NetworkServer) {}

    fn client_disconnected(&mut self, _id: ConnectionId, _server: &mut NetworkServer) {}

    fn on_event(&mut self, _from: ConnectionId, _event: &NetworkEvent, _server: &mut NetworkServer) {}

    /// The world grew past what one package carries for client `id`.
    fn snapshot_too_large(&mut self, _id: ConnectionId, _server: &mut NetworkServer) {}
}

struct ServerContext<G> {
    game: G,
    network: NetworkServer,
    scheduler: TickScheduler,
    now_ms: u64,
    tick: u32,
}

/// Server lifecycle: host the session, load the level, run the tick loop.
pub struct ServerGameLoop<G: ServerGame> {
    machine: StateMachine<ServerState, ServerContext<G>>,
    context: ServerContext<G>,
}

impl<G: ServerGame> ServerGameLoop<G> {
    pub fn new(mut game: G, transport: Box<dyn Transport>, config: NetworkConfig) -> Result<Self, SchemaError> {
        let scheduler = TickScheduler::new(config.server_tick_rate, config.max_tick_backlog_secs);
        if scheduler.interval() * 1000.0 > u8::MAX as f64 {
            warn!(
                "Tick interval {:.0} ms exceeds the 8-bit sim time, snapshots will report {} ms",
                scheduler.interval() * 1000.0,
                u8::MAX
            );
        }
        let mut network = NetworkServer::new(transport, config);
        game.setup(&mut network)?;

        let mut machine: StateMachine<ServerState, ServerContext<G>> = StateMachine::new();
        machine.add(
            ServerState::Connecting,
            Some(enter_connecting::<G>),
            Some(update_connecting::<G>),
            None,
        );
        machine.add(
            ServerState::Loading,
            Some(enter_loading::<G>),
            Some(update_loading::<G>),
            None,
        );
        machine.add(
            ServerState::Active,
            Some(enter_active::<G>),
            Some(update_active::<G>),
            None,
        );

        Ok(Self {
            machine,
            context: ServerContext {
                game,
                network,
                scheduler,
                now_ms: 0,
                tick: 0,
            },
        })
    }

    pub fn start(&mut self, now_ms: u64) {
        self.context.now_ms = now_ms;
        self.machine.switch_to(ServerState::Connecting, &mut self.context);
    }

    /// Runs one frame: receive, update the current state, send.
    pub fn update(&mut self, now_ms: u64) {
        let ctx = &mut self.context;
        ctx.now_ms = now_ms;
        ctx.network.update(now_ms);

        for event in ctx.network.take_events() {
            match event {
                ServerEvent::ClientConnected { id } => ctx.game.client_connected(id, &mut ctx.network),
                ServerEvent::ClientDisconnected { id } => {
                    ctx.game.client_disconnected(id, &mut ctx.network)
                }
                ServerEvent::SnapshotTooLarge { id } => {
                    ctx.game.snapshot_too_large(id, &mut ctx.network)
                }
                ServerEvent::SessionJoined | ServerEvent::SessionLost => {}
            }
        }
        for (from, event) in ctx.network.take_client_events() {
            ctx.game.on_event(from, &event, &mut ctx.network);
        }

        self.machine.update(&mut self.context);
        self.context.network.send_data(now_ms);
    }

    pub fn state(&self) -> Option<ServerState> {
        self.machine.current()
    }

    /// Newest simulated tick.
    pub fn tick(&self) -> u32 {
        self.context.tick
    }

    pub fn network(&self) -> &NetworkServer {
        &self.context.network
    }

    pub fn network_mut(&mut self) -> &mut NetworkServer {
        &mut self.context.network
    }

    pub fn game(&self) -> &G {
        &self.context.game
    }

    pub fn game_mut(&mut self) -> &mut G {
        &mut self.context.game
    }

    pub fn shutdown(&mut self) {
        self.machine.shutdown(&mut self.context);
        self.context.network.shutdown();
    }
}

fn enter_connecting<G: ServerGame>(ctx: &mut ServerContext<G>) {
    ctx.network.start();
}

fn update_connecting<G: ServerGame>(ctx: &mut ServerContext<G>) -> Option<ServerState> {
    ctx.network.is_joined().then_some(ServerState::Loading)
}

fn enter_loading<G: ServerGame>(ctx: &mut ServerContext<G>) {
    ctx.game.begin_load();
}

fn update_loading<G: ServerGame>(ctx: &mut ServerContext<G>) -> Option<ServerState> {
    ctx.game.poll_loaded().then_some(ServerState::Active)
}

fn enter_active<G: ServerGame>(ctx: &mut ServerContext<G>) {
    let schema = ctx.game.map_schema();
    let game = &ctx.game;
    let map_id = ctx.network.set_map(schema, |writer| game.write_map(writer));
    ctx.scheduler.reset(ctx.now_ms as f64 / 1000.0);
    info!(
        "Server active on map {map_id} at {} Hz",
        ctx.scheduler.tick_rate()
    );
}

fn update_active<G: ServerGame>(ctx: &mut ServerContext<G>) -> Option<ServerState> {
    if !ctx.network.is_joined() {
        warn!("Session lost, reconnecting");
        return Some(ServerState::Connecting);
    }

    let now = ctx.now_ms as f64 / 1000.0;
    let sim_time_ms = (ctx.scheduler.interval() * 1000.0).round().min(u8::MAX as f64) as u8;
    while ctx.scheduler.consume_tick(now) {
        ctx.tick = ctx.tick.wrapping_add(1);
        ctx.game.tick(ctx.tick, &mut ctx.network);
        ctx.network.generate_snapshot(ctx.tick, sim_time_ms, &mut ctx.game);
    }
    None
}
