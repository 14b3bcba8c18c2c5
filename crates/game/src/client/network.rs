use std::mem;

use log::{debug, error, info, warn};

use crate::config::NetworkConfig;
use crate::event::{EventQueue, MAX_EVENTS_PER_PACKAGE, NetworkEvent, read_events, write_events};
use crate::map::MapInfo;
use crate::net::{
    BitReader, BitWriter, ConnectionId, ConnectionStats, MAX_PACKAGE_BODY, NetworkConnection,
    NetworkMessage,
    ProtocolError, SequenceBuffer, Transport, TransportEvent, format_stats_table, tick_diff,
    tick_greater_than,
};
use crate::schema::{
    AckedSchemas, FieldWriter, NetworkSchema, SchemaCategory, SchemaError, SchemaRegistry,
};
use crate::simulation::{CommandBuffer, GameTime};
use crate::snapshot::{DEFAULT_SNAPSHOT_WORDS, SnapshotCodec, SnapshotHeader, WorldSnapshot};

const COMMAND_BUFFER_SIZE: usize = 128;
const MAX_PENDING_EVENTS: usize = 256;

/// What the client remembers about each sent package.
#[derive(Debug, Default)]
pub struct ClientPackageInfo {
    pub command_tick: Option<u32>,
    pub client_config: bool,
    pub schemas: Vec<(SchemaCategory, u16)>,
    pub events: Vec<NetworkEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Client end of the replication protocol, talking to the session host.
pub struct NetworkClient {
    transport: Box<dyn Transport>,
    config: NetworkConfig,
    state: ClientConnectionState,
    connection: Option<NetworkConnection<ClientPackageInfo>>,
    client_id: Option<u8>,
    server_tick_rate: u32,
    /// Schemas announced by the server.
    schemas: SchemaRegistry,
    /// Schemas of what this client sends.
    outgoing_schemas: SchemaRegistry,
    acked_schemas: AckedSchemas,
    map: Option<MapInfo>,
    map_changed: bool,
    snapshots: SequenceBuffer<WorldSnapshot>,
    scratch: WorldSnapshot,
    snapshot_words: usize,
    codec: SnapshotCodec,
    latest: Option<SnapshotHeader>,
    snapshot_received_ms: u64,
    command_schema: Option<u16>,
    commands: CommandBuffer,
    last_acked_command_tick: Option<u32>,
    client_config_acked: bool,
    events_out: EventQueue,
    events_in: Vec<NetworkEvent>,
    frame: u64,
}

impl NetworkClient {
    pub fn new(transport: Box<dyn Transport>, config: NetworkConfig) -> Self {
        Self {
            transport,
            snapshots: SequenceBuffer::new(config.snapshot_delta_cache_size),
            server_tick_rate: config.server_tick_rate,
            config,
            state: ClientConnectionState::Disconnected,
            connection: None,
            client_id: None,
            schemas: SchemaRegistry::new(),
            outgoing_schemas: SchemaRegistry::new(),
            acked_schemas: AckedSchemas::new(),
            map: None,
            map_changed: false,
            scratch: WorldSnapshot::default(),
            snapshot_words: DEFAULT_SNAPSHOT_WORDS,
            codec: SnapshotCodec::new(),
            latest: None,
            snapshot_received_ms: 0,
            command_schema: None,
            commands: CommandBuffer::new(COMMAND_BUFFER_SIZE),
            last_acked_command_tick: None,
            client_config_acked: false,
            events_out: EventQueue::new(MAX_PENDING_EVENTS),
            events_in: Vec::new(),
            frame: 0,
        }
    }

    pub fn connect(&mut self) {
        if self.state != ClientConnectionState::Disconnected {
            return;
        }
        match self.transport.connect() {
            Ok(()) => {
                info!("Connecting to server");
                self.state = ClientConnectionState::Connecting;
            }
            Err(e) => error!("Failed to start connecting: {e}"),
        }
    }

    pub fn disconnect(&mut self) {
        if self.state == ClientConnectionState::Disconnected {
            return;
        }
        info!("Disconnecting from server");
        self.transport.disconnect();
        self.teardown();
    }

    pub fn shutdown(&mut self) {
        self.disconnect();
        self.transport.shutdown();
    }

    fn teardown(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            connection.shutdown();
        }
        self.state = ClientConnectionState::Disconnected;
        self.client_id = None;
        self.acked_schemas.reset();
        self.map = None;
        self.map_changed = false;
        self.snapshots.clear();
        self.latest = None;
        self.commands.clear();
        self.last_acked_command_tick = None;
        self.client_config_acked = false;
        self.events_out.clear();
    }

    pub fn state(&self) -> ClientConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ClientConnectionState::Connected
    }

    /// Id the server assigned to this client, once `ClientInfo` arrived.
    pub fn client_id(&self) -> Option<u8> {
        self.client_id
    }

    pub fn server_tick_rate(&self) -> u32 {
        self.server_tick_rate
    }

    pub fn map(&self) -> Option<&MapInfo> {
        self.map.as_ref()
    }

    /// Whether a new map arrived since the last call.
    pub fn take_map_change(&mut self) -> bool {
        mem::take(&mut self.map_changed)
    }

    pub fn schemas(&self) -> &SchemaRegistry {
        &self.schemas
    }

    /// Tick of the newest accepted snapshot.
    pub fn server_time(&self) -> Option<u32> {
        self.latest.map(|h| h.server_time)
    }

    pub fn time_since_snapshot_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.snapshot_received_ms)
    }

    pub fn latest_snapshot(&self) -> Option<&WorldSnapshot> {
        self.latest.and_then(|h| self.snapshots.get(h.sequence))
    }

    pub fn snapshot(&self, sequence: u32) -> Option<&WorldSnapshot> {
        self.snapshots.get(sequence)
    }

    pub fn rtt_ms(&self) -> f32 {
        self.connection.as_ref().map_or(0.0, |c| c.rtt_ms())
    }

    pub fn stats(&self) -> Option<ConnectionStats> {
        self.connection.as_ref().map(|c| c.stats())
    }

    /// Commands the server holds beyond the newest snapshot, as far as acks
    /// tell.
    pub fn buffered_commands(&self) -> Option<i64> {
        let acked = self.last_acked_command_tick?;
        let server_time = self.server_time()?;
        Some(tick_diff(acked, server_time))
    }

    pub fn register_command_type(&mut self, schema: NetworkSchema) -> Result<(), SchemaError> {
        let id = schema.id;
        self.outgoing_schemas.register(SchemaCategory::Command, schema)?;
        self.command_schema = Some(id);
        Ok(())
    }

    pub fn register_event_type(&mut self, schema: NetworkSchema) -> Result<(), SchemaError> {
        self.outgoing_schemas.register(SchemaCategory::Event, schema)
    }

    pub fn outgoing_schema(&self, category: SchemaCategory, id: u16) -> Option<&NetworkSchema> {
        self.outgoing_schemas.get(category, id)
    }

    /// Records the command for `tick`, filled in through `fill`.
    pub fn store_command(&mut self, tick: u32, fill: impl FnOnce(&mut FieldWriter<'_>)) {
        let schema = self
            .command_schema
            .and_then(|id| self.outgoing_schemas.get(SchemaCategory::Command, id));
        let Some(schema) = schema else {
            warn!("No command schema registered, dropping command for tick {tick}");
            return;
        };
        let mut words = vec![0; schema.word_count()];
        let mut writer = FieldWriter::new(schema, &mut words);
        fill(&mut writer);
        writer.finish();
        self.commands.store(tick, &words);
    }

    pub fn queue_event(&mut self, event: NetworkEvent) {
        self.events_out.push(event);
    }

    pub fn take_events(&mut self) -> Vec<NetworkEvent> {
        mem::take(&mut self.events_in)
    }

    /// Polls the transport and processes everything that arrived.
    pub fn update(&mut self, now_ms: u64) {
        if let Err(e) = self.transport.update() {
            warn!("Transport update failed: {e}");
        }

        while let Some(event) = self.transport.next_event() {
            match event {
                TransportEvent::Connect(id) if id.is_local() => {
                    debug!("Joined session");
                }
                TransportEvent::Connect(ConnectionId::HOST) => {
                    if self.connection.is_none() {
                        info!(
                            "Connected to server {}",
                            self.transport.connection_description(ConnectionId::HOST)
                        );
                        self.connection = Some(NetworkConnection::new(ConnectionId::HOST));
                        self.state = ClientConnectionState::Connected;
                    }
                }
                TransportEvent::Disconnect(id) if id.is_local() || id == ConnectionId::HOST => {
                    if self.state != ClientConnectionState::Disconnected {
                        warn!("Lost connection to server");
                        self.teardown();
                    }
                }
                TransportEvent::Data(ConnectionId::HOST, data) => self.process_package(&data, now_ms),
                other => debug!("Ignoring transport event {other:?}"),
            }
        }
    }

    fn process_package(&mut self, data: &[u8], now_ms: u64) {
        let Some(connection) = self.connection.as_mut() else {
            return;
        };
        let package = connection.process_package(data, now_ms);
        self.handle_deliveries();

        let Some(package) = package else {
            return;
        };
        let mut reader = BitReader::new(&package.body);
        if let Err(e) = self.read_package(&mut reader, package.content, now_ms) {
            error!("Dropping rest of package {}: {e}", package.sequence);
        }
    }

    fn handle_deliveries(&mut self) {
        let Some(connection) = self.connection.as_mut() else {
            return;
        };
        for delivery in connection.drain_deliveries() {
            if !delivery.made_it {
                self.events_out.requeue_lost(delivery.info.events);
                continue;
            }
            if delivery.info.client_config {
                self.client_config_acked = true;
            }
            for (category, id) in delivery.info.schemas {
                self.acked_schemas.acknowledge(category, id);
            }
            if let Some(tick) = delivery.info.command_tick {
                if self
                    .last_acked_command_tick
                    .is_none_or(|acked| tick_greater_than(tick, acked))
                {
                    self.last_acked_command_tick = Some(tick);
                }
            }
        }
    }

    fn read_package(
        &mut self,
        reader: &mut BitReader<'_>,
        content: NetworkMessage,
        now_ms: u64,
    ) -> Result<(), ProtocolError> {
        if content.contains(NetworkMessage::CLIENT_INFO) {
            let id = reader.read_bits(8)? as u8;
            let tick_rate = (reader.read_bits(8)?).max(1);
            if self.client_id != Some(id) || self.server_tick_rate != tick_rate {
                info!("Server assigned client id {id}, tick rate {tick_rate}");
            }
            self.client_id = Some(id);
            self.server_tick_rate = tick_rate;
        }

        if content.contains(NetworkMessage::MAP_INFO) {
            let current = self.map.as_ref().map(|m| m.map_id);
            if let Some(map) = MapInfo::read(reader, &mut self.schemas, current)? {
                info!("Received map {}", map.map_id);
                self.map = Some(map);
                self.map_changed = true;
            }
        }

        if content.contains(NetworkMessage::SNAPSHOT) {
            self.read_snapshot(reader, now_ms)?;
        }

        if content.contains(NetworkMessage::EVENTS) {
            let events = read_events(reader, &mut self.schemas)?;
            self.events_in.extend(events);
        }
        Ok(())
    }

    fn read_snapshot(&mut self, reader: &mut BitReader<'_>, now_ms: u64) -> Result<(), ProtocolError> {
        let header = self.codec.read(
            reader,
            &self.snapshots,
            &mut self.schemas,
            &mut self.scratch,
            self.snapshot_words,
        )?;
        // The server counts this snapshot as received once the package is
        // acked, so it is kept as a baseline even when it is not accepted.
        mem::swap(self.snapshots.acquire(header.sequence), &mut self.scratch);

        match self.latest {
            Some(latest) if !tick_greater_than(header.server_time, latest.server_time) => {
                debug!(
                    "Snapshot {} for tick {} is not newer than tick {}",
                    header.sequence, header.server_time, latest.server_time
                );
            }
            _ => {
                self.latest = Some(header);
                self.snapshot_received_ms = now_ms;
            }
        }
        Ok(())
    }

    /// Sends one package with acks, pending client config, the newest
    /// commands and queued events.
    pub fn send_data(&mut self, now_ms: u64) {
        let Some(connection) = self.connection.as_mut() else {
            return;
        };
        if !connection.ready_to_send(now_ms) {
            return;
        }

        connection.begin_send_package();
        let mut writer = BitWriter::new();
        let mut content = NetworkMessage::empty();
        let mut info = ClientPackageInfo::default();

        if !self.client_config_acked {
            content |= NetworkMessage::CLIENT_CONFIG;
            writer.write_bits(self.config.client_update_rate, 32);
            writer.write_bits(self.config.client_update_interval.min(255), 8);
            info.client_config = true;
        }

        let command_schema = self
            .command_schema
            .and_then(|id| self.outgoing_schemas.get(SchemaCategory::Command, id));
        if let Some(schema) = command_schema.filter(|_| self.commands.newest_tick().is_some()) {
            content |= NetworkMessage::COMMANDS;
            let mut sent_schema = false;
            info.command_tick = self.commands.write(
                &mut writer,
                schema,
                &self.acked_schemas,
                self.config.commands_per_package,
                &mut sent_schema,
            );
            if sent_schema {
                info.schemas.push((SchemaCategory::Command, schema.id));
            }
        }

        let events = self.events_out.take_for_send(MAX_EVENTS_PER_PACKAGE);
        if !events.is_empty() {
            let mut sent = Vec::new();
            let mut event_writer = BitWriter::new();
            match write_events(
                &mut event_writer,
                &events,
                &self.outgoing_schemas,
                &self.acked_schemas,
                &mut sent,
            ) {
                Ok(()) if writer.fits_with(&event_writer, MAX_PACKAGE_BODY) => {
                    content |= NetworkMessage::EVENTS;
                    writer.append(&event_writer);
                    info.schemas.extend(sent.into_iter().map(|id| (SchemaCategory::Event, id)));
                    info.events = events;
                }
                Ok(()) => {
                    debug!("{} events wait for a package with room", events.len());
                    self.events_out.requeue_unsent(events);
                }
                Err(e) => error!("Dropping {} events: {e}", events.len()),
            }
        }

        let body = writer.finish();
        let sent =
            connection.complete_send_package(info, content, &body, now_ms, self.transport.as_mut());
        if let Err(e) = &sent {
            error!("Failed to send package: {e}");
        }

        self.frame += 1;
        let interval = self.config.stats_interval as u64;
        if interval > 0 && self.frame % interval == 0 {
            info!("Client network stats\n{}", format_stats_table(&[connection.stats()]));
        }
        if sent.is_err() {
            self.handle_deliveries();
        }
    }

    /// The two snapshots surrounding `render` and how far between them it is.
    pub fn interpolation_pair(&self, render: &GameTime) -> Option<(&WorldSnapshot, &WorldSnapshot, f32)> {
        let render_ticks = render.tick_fraction();
        let mut from: Option<(&WorldSnapshot, f64)> = None;
        let mut to: Option<(&WorldSnapshot, f64)> = None;

        for sequence in self.snapshots.sequences() {
            let Some(snapshot) = self.snapshots.get(sequence) else {
                continue;
            };
            let offset = tick_diff(snapshot.server_time, render.tick) as f64 - render_ticks;
            if offset <= 0.0 {
                if from.is_none_or(|(_, best)| offset > best) {
                    from = Some((snapshot, offset));
                }
            } else if to.is_none_or(|(_, best)| offset < best) {
                to = Some((snapshot, offset));
            }
        }

        let (from, from_offset) = from?;
        match to {
            Some((to, to_offset)) => {
                let t = -from_offset / (to_offset - from_offset);
                Some((from, to, t as f32))
            }
            None => Some((from, from, 0.0)),
        }
    }
}
