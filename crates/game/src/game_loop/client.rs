use log::{info, warn};

use crate::client::{ClientConnectionState, ClientTimeline, NetworkClient, TimeSync};
use crate::config::{NetworkConfig, ReconciliationConfig};
use crate::event::NetworkEvent;
use crate::map::MapInfo;
use crate::net::{Transport, tick_diff};
use crate::schema::{FieldWriter, NetworkSchema, SchemaError, SchemaRegistry};

use super::state_machine::StateMachine;

/// Most commands sampled in one frame when predicted time jumps ahead.
const MAX_COMMANDS_PER_FRAME: i64 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientState {
    Connecting,
    Loading,
    Playing,
    Leaving,
}

/// Game side hooks the client loop drives.
pub trait ClientGame {
    fn command_schema(&self) -> NetworkSchema;

    /// Starts loading the level `map` describes.
    fn begin_load(&mut self, map: &MapInfo);

    fn poll_loaded(&mut self) -> bool;

    /// Fills in the command for predicted tick `tick`.
    fn sample_command(&mut self, tick: u32, writer: &mut FieldWriter<'_>);

    fn on_event(&mut self, _event: &NetworkEvent, _schemas: &SchemaRegistry) {}

    /// Called once per playing frame after the clocks moved.
    fn present(&mut self, _network: &NetworkClient, _timeline: &ClientTimeline) {}
}

struct ClientContext<G> {
    game: G,
    network: NetworkClient,
    timeline: ClientTimeline,
    now_ms: u64,
    frame_duration: f64,
    state_entered_ms: u64,
    connect_timeout_ms: u64,
    loading_map: Option<u16>,
    loaded_map: Option<u16>,
    last_command_tick: Option<u32>,
}

/// Client lifecycle: connect, load the server's map, play, leave.
pub struct ClientGameLoop<G: ClientGame> {
    machine: StateMachine<ClientState, ClientContext<G>>,
    context: ClientContext<G>,
    last_frame_ms: Option<u64>,
}

impl<G: ClientGame> ClientGameLoop<G> {
    pub fn new(
        game: G,
        transport: Box<dyn Transport>,
        config: NetworkConfig,
        reconciliation: ReconciliationConfig,
    ) -> Result<Self, SchemaError> {
        let connect_timeout_ms = (config.connect_timeout_secs * 1000.0) as u64;
        let mut network = NetworkClient::new(transport, config);
        network.register_command_type(game.command_schema())?;

        let mut machine: StateMachine<ClientState, ClientContext<G>> = StateMachine::new();
        machine.add(
            ClientState::Connecting,
            Some(enter_connecting::<G>),
            Some(update_connecting::<G>),
            None,
        );
        machine.add(
            ClientState::Loading,
            Some(enter_loading::<G>),
            Some(update_loading::<G>),
            None,
        );
        machine.add(
            ClientState::Playing,
            Some(enter_playing::<G>),
            Some(update_playing::<G>),
            None,
        );
        machine.add(ClientState::Leaving, Some(enter_leaving::<G>), None, None);

        Ok(Self {
            machine,
            context: ClientContext {
                game,
                network,
                timeline: ClientTimeline::new(reconciliation),
                now_ms: 0,
                frame_duration: 0.0,
                state_entered_ms: 0,
                connect_timeout_ms,
                loading_map: None,
                loaded_map: None,
                last_command_tick: None,
            },
            last_frame_ms: None,
        })
    }

    /// Starts connecting at `now_ms`.
    pub fn start(&mut self, now_ms: u64) {
        self.context.now_ms = now_ms;
        self.last_frame_ms = Some(now_ms);
        self.machine.switch_to(ClientState::Connecting, &mut self.context);
    }

    /// Runs one frame: receive, update the current state, send.
    pub fn update(&mut self, now_ms: u64) {
        let last = self.last_frame_ms.replace(now_ms).unwrap_or(now_ms);
        self.context.now_ms = now_ms;
        self.context.frame_duration = now_ms.saturating_sub(last) as f64 / 1000.0;

        self.context.network.update(now_ms);
        self.machine.update(&mut self.context);
        self.context.network.send_data(now_ms);
    }

    pub fn state(&self) -> Option<ClientState> {
        self.machine.current()
    }

    pub fn network(&self) -> &NetworkClient {
        &self.context.network
    }

    pub fn network_mut(&mut self) -> &mut NetworkClient {
        &mut self.context.network
    }

    pub fn timeline(&self) -> &ClientTimeline {
        &self.context.timeline
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

fn enter_connecting<G: ClientGame>(ctx: &mut ClientContext<G>) {
    ctx.state_entered_ms = ctx.now_ms;
    ctx.network.connect();
}

fn update_connecting<G: ClientGame>(ctx: &mut ClientContext<G>) -> Option<ClientState> {
    match ctx.network.state() {
        ClientConnectionState::Connected => return Some(ClientState::Loading),
        ClientConnectionState::Disconnected => {
            warn!("Connection attempt failed");
            return Some(ClientState::Leaving);
        }
        ClientConnectionState::Connecting => {}
    }
    if ctx.now_ms.saturating_sub(ctx.state_entered_ms) >= ctx.connect_timeout_ms {
        warn!(
            "No connection after {:.1}s, giving up",
            ctx.connect_timeout_ms as f64 / 1000.0
        );
        return Some(ClientState::Leaving);
    }
    None
}

fn enter_loading<G: ClientGame>(ctx: &mut ClientContext<G>) {
    ctx.loading_map = None;
}

fn update_loading<G: ClientGame>(ctx: &mut ClientContext<G>) -> Option<ClientState> {
    if !ctx.network.is_connected() {
        return Some(ClientState::Leaving);
    }

    let map_id = ctx.network.map().map(|m| m.map_id);
    if map_id.is_some() && map_id != ctx.loading_map {
        ctx.network.take_map_change();
        if let Some(map) = ctx.network.map() {
            info!("Loading map {}", map.map_id);
            ctx.game.begin_load(map);
        }
        ctx.loading_map = map_id;
    }

    if ctx.loading_map.is_some() && ctx.game.poll_loaded() {
        ctx.loaded_map = ctx.loading_map;
        return Some(ClientState::Playing);
    }
    None
}

fn enter_playing<G: ClientGame>(ctx: &mut ClientContext<G>) {
    info!("Playing map {:?}", ctx.loaded_map);
    ctx.timeline.reset();
    ctx.last_command_tick = None;
}

fn update_playing<G: ClientGame>(ctx: &mut ClientContext<G>) -> Option<ClientState> {
    if !ctx.network.is_connected() {
        warn!("Disconnected while playing");
        return Some(ClientState::Leaving);
    }
    if ctx.network.take_map_change() {
        return Some(ClientState::Loading);
    }

    for event in ctx.network.take_events() {
        ctx.game.on_event(&event, ctx.network.schemas());
    }

    let server_time = ctx.network.server_time()?;
    let sync = TimeSync {
        tick_rate: ctx.network.server_tick_rate(),
        server_time,
        time_since_snapshot_ms: ctx.network.time_since_snapshot_ms(ctx.now_ms) as f64,
        rtt_ms: ctx.network.rtt_ms() as f64,
        buffered_commands: ctx.network.buffered_commands(),
    };
    ctx.timeline.update(ctx.frame_duration, &sync);

    sample_commands(ctx);
    ctx.game.present(&ctx.network, &ctx.timeline);
    None
}

/// Samples one command per predicted tick not yet covered.
fn sample_commands<G: ClientGame>(ctx: &mut ClientContext<G>) {
    let predicted = ctx.timeline.predicted().tick;
    let pending = match ctx.last_command_tick {
        Some(last) => tick_diff(predicted, last),
        None => 1,
    };
    if pending <= 0 {
        return;
    }

    let first = predicted.wrapping_sub(pending.min(MAX_COMMANDS_PER_FRAME) as u32 - 1);
    for offset in 0..pending.min(MAX_COMMANDS_PER_FRAME) as u32 {
        let tick = first.wrapping_add(offset);
        let game = &mut ctx.game;
        ctx.network
            .store_command(tick, |writer| game.sample_command(tick, writer));
    }
    ctx.last_command_tick = Some(predicted);
}

fn enter_leaving<G: ClientGame>(ctx: &mut ClientContext<G>) {
    info!("Leaving game");
    ctx.network.disconnect();
}
