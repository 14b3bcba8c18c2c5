use log::{debug, error, info, warn};

use crate::config::NetworkConfig;
use crate::event::{EventQueue, MAX_EVENTS_PER_PACKAGE, NetworkEvent, read_events, write_events};
use crate::map::MapInfo;
use crate::net::{
    BitReader, BitWriter, ConnectionId, ConnectionStats, MAX_PACKAGE_BODY, NetworkConnection,
    NetworkMessage, ProtocolError, Transport, sequence_greater_than, tick_diff, tick_greater_than,
};
use crate::schema::{AckedSchemas, NetworkSchema, SchemaCategory, SchemaRegistry};
use crate::simulation::{CommandBuffer, read_commands};
use crate::snapshot::{AckHistory, SnapshotCodec, SnapshotEngine, SnapshotFrame, select_baseline};

const COMMAND_BUFFER_SIZE: usize = 128;
const MAX_PENDING_EVENTS: usize = 256;

/// What the server remembers about each sent package.
#[derive(Debug, Default)]
pub struct ServerPackageInfo {
    pub snapshot: Option<u32>,
    pub client_info: bool,
    pub map_id: Option<u16>,
    pub schemas: Vec<(SchemaCategory, u16)>,
    pub events: Vec<NetworkEvent>,
}

/// Shared server state every connection writes from.
#[derive(Debug, Clone, Copy)]
pub struct OutgoingWorld<'a> {
    pub tick_rate: u32,
    pub map: Option<&'a MapInfo>,
    pub engine: &'a SnapshotEngine,
    pub event_schemas: &'a SchemaRegistry,
    pub network_prediction: bool,
}

/// Server side of one client connection.
///
/// A client first gets `ClientInfo`, then the current map. Snapshots start
/// once both were acknowledged.
pub struct ServerConnection {
    connection: NetworkConnection<ServerPackageInfo>,
    client_id: u8,
    client_info_acked: bool,
    acked_map_id: Option<u16>,
    max_snapshot_ack: Option<u32>,
    ack_history: AckHistory,
    acked_schemas: AckedSchemas,
    /// Command and event schemas announced by the client.
    peer_schemas: SchemaRegistry,
    events_out: EventQueue,
    events_in: Vec<NetworkEvent>,
    commands: CommandBuffer,
    command_type: Option<u16>,
    update_interval: u32,
    last_snapshot_time: Option<u32>,
    codec: SnapshotCodec,
}

impl ServerConnection {
    pub fn new(id: ConnectionId, config: &NetworkConfig) -> Self {
        Self {
            connection: NetworkConnection::new(id),
            client_id: id.0,
            client_info_acked: false,
            acked_map_id: None,
            max_snapshot_ack: None,
            ack_history: AckHistory::new(config.client_ack_cache_size),
            acked_schemas: AckedSchemas::new(),
            peer_schemas: SchemaRegistry::new(),
            events_out: EventQueue::new(MAX_PENDING_EVENTS),
            events_in: Vec::new(),
            commands: CommandBuffer::new(COMMAND_BUFFER_SIZE),
            command_type: None,
            update_interval: 1,
            last_snapshot_time: None,
            codec: SnapshotCodec::new(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.connection.id()
    }

    pub fn client_id(&self) -> u8 {
        self.client_id
    }

    pub fn stats(&self) -> ConnectionStats {
        self.connection.stats()
    }

    /// Snapshots left out of packages because they did not fit.
    pub fn snapshots_skipped(&self) -> u64 {
        self.connection.counters().snapshots_skipped_out
    }

    pub fn rtt_ms(&self) -> f32 {
        self.connection.rtt_ms()
    }

    /// Whether the client has everything it needs to decode snapshots for
    /// the map `map_id`.
    pub fn is_ready(&self, map_id: Option<u16>) -> bool {
        self.client_info_acked && map_id.is_some() && self.acked_map_id == map_id
    }

    /// Newest snapshot the client is known to hold.
    pub fn max_snapshot_ack(&self) -> Option<u32> {
        self.max_snapshot_ack
    }

    pub fn update_interval(&self) -> u32 {
        self.update_interval
    }

    pub fn newest_command_tick(&self) -> Option<u32> {
        self.commands.newest_tick()
    }

    /// Command the client sampled for `tick`, if it arrived.
    pub fn command(&self, tick: u32) -> Option<&[u32]> {
        self.commands.get(tick)
    }

    pub fn command_schema(&self) -> Option<&NetworkSchema> {
        self.command_type
            .and_then(|id| self.peer_schemas.get(SchemaCategory::Command, id))
    }

    pub fn peer_schemas(&self) -> &SchemaRegistry {
        &self.peer_schemas
    }

    pub fn queue_event(&mut self, event: NetworkEvent) {
        self.events_out.push(event);
    }

    pub fn take_events(&mut self) -> Vec<NetworkEvent> {
        std::mem::take(&mut self.events_in)
    }

    pub fn shutdown(&mut self) {
        self.connection.shutdown();
    }

    pub fn process_package(&mut self, data: &[u8], now_ms: u64) {
        let package = self.connection.process_package(data, now_ms);
        self.handle_deliveries();

        let Some(package) = package else {
            return;
        };
        let mut reader = BitReader::new(&package.body);
        if let Err(e) = self.read_package(&mut reader, package.content) {
            error!(
                "Client {}: dropping rest of package {}: {e}",
                self.client_id, package.sequence
            );
        }
    }

    fn handle_deliveries(&mut self) {
        for delivery in self.connection.drain_deliveries() {
            if !delivery.made_it {
                self.events_out.requeue_lost(delivery.info.events);
                continue;
            }
            let info = delivery.info;
            if info.client_info && !self.client_info_acked {
                debug!("Client {} acked client info", self.client_id);
                self.client_info_acked = true;
            }
            if let Some(map_id) = info.map_id {
                if self
                    .acked_map_id
                    .is_none_or(|acked| sequence_greater_than(map_id, acked))
                {
                    info!("Client {} acked map {map_id}", self.client_id);
                    self.acked_map_id = Some(map_id);
                }
            }
            for (category, id) in info.schemas {
                self.acked_schemas.acknowledge(category, id);
            }
            if let Some(snapshot) = info.snapshot {
                self.ack_history.acknowledge(delivery.sequence);
                if self
                    .max_snapshot_ack
                    .is_none_or(|acked| tick_greater_than(snapshot, acked))
                {
                    self.max_snapshot_ack = Some(snapshot);
                }
            }
        }
    }

    fn read_package(
        &mut self,
        reader: &mut BitReader<'_>,
        content: NetworkMessage,
    ) -> Result<(), ProtocolError> {
        if content.contains(NetworkMessage::CLIENT_CONFIG) {
            let update_rate = reader.read_bits(32)?;
            let update_interval = reader.read_bits(8)?.max(1);
            if update_interval != self.update_interval {
                debug!(
                    "Client {}: update rate {update_rate} B/s, interval {update_interval}",
                    self.client_id
                );
            }
            self.connection.set_update_rate(update_rate);
            self.update_interval = update_interval;
        }

        if content.contains(NetworkMessage::COMMANDS) {
            let (type_id, commands) = read_commands(reader, &mut self.peer_schemas)?;
            for command in &commands {
                self.commands.store(command.tick, &command.words);
            }
            self.command_type = Some(type_id);
        }

        if content.contains(NetworkMessage::EVENTS) {
            let events = read_events(reader, &mut self.peer_schemas)?;
            self.events_in.extend(events);
        }
        Ok(())
    }

    /// Writes and sends one package. Returns whether anything was sent.
    pub fn send_data(
        &mut self,
        world: &OutgoingWorld<'_>,
        now_ms: u64,
        transport: &mut dyn Transport,
    ) -> bool {
        if !self.connection.ready_to_send(now_ms) {
            return false;
        }

        let package = self.connection.begin_send_package();
        let mut writer = BitWriter::new();
        let mut content = NetworkMessage::empty();
        let mut info = ServerPackageInfo::default();

        if !self.client_info_acked {
            content |= NetworkMessage::CLIENT_INFO;
            writer.write_bits(self.client_id as u32, 8);
            writer.write_bits(world.tick_rate.min(255), 8);
            info.client_info = true;
        }

        if let Some(map) = world.map.filter(|m| self.acked_map_id != Some(m.map_id)) {
            content |= NetworkMessage::MAP_INFO;
            let send_schema = !self.acked_schemas.is_acked(SchemaCategory::Map, map.schema.id);
            map.write(&mut writer, send_schema);
            if send_schema {
                info.schemas.push((SchemaCategory::Map, map.schema.id));
            }
            info.map_id = Some(map.map_id);
        }

        if self.is_ready(world.map.map(|m| m.map_id)) {
            self.write_snapshot(&mut writer, &mut content, &mut info, package, world);
        }

        let events = self.events_out.take_for_send(MAX_EVENTS_PER_PACKAGE);
        if !events.is_empty() {
            let mut sent = Vec::new();
            let mut event_writer = BitWriter::new();
            match write_events(
                &mut event_writer,
                &events,
                world.event_schemas,
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
                    debug!(
                        "Client {}: {} events wait for a package with room",
                        self.client_id,
                        events.len()
                    );
                    self.events_out.requeue_unsent(events);
                }
                Err(e) => error!("Client {}: dropping {} events: {e}", self.client_id, events.len()),
            }
        }

        self.ack_history.record_sent(package, info.snapshot);
        let body = writer.finish();
        if let Err(e) = self
            .connection
            .complete_send_package(info, content, &body, now_ms, transport)
        {
            error!("Client {}: failed to send package {package}: {e}", self.client_id);
            self.handle_deliveries();
        }
        true
    }

    fn write_snapshot(
        &mut self,
        writer: &mut BitWriter,
        content: &mut NetworkMessage,
        info: &mut ServerPackageInfo,
        package: u16,
        world: &OutgoingWorld<'_>,
    ) {
        let engine = world.engine;
        let Some(sequence) = engine.server_sequence() else {
            return;
        };
        let Some(current) = engine.snapshot(sequence) else {
            return;
        };
        let due = self.last_snapshot_time.is_none_or(|last| {
            tick_diff(current.server_time, last) >= self.update_interval as i64
        });
        if !due {
            return;
        }

        let cache_size = engine.cache_size();
        let baseline = select_baseline(sequence, self.max_snapshot_ack, cache_size)
            .and_then(|b| engine.snapshot(b).map(|snapshot| (b, snapshot)));
        let prediction = match baseline {
            Some((b0, _)) if world.network_prediction => self
                .ack_history
                .select_baselines(package.wrapping_sub(1), b0, sequence, cache_size)
                .and_then(|(s1, s2)| Some((engine.snapshot(s1)?, engine.snapshot(s2)?))),
            _ => None,
        };

        let frame = SnapshotFrame {
            current,
            baseline: baseline.map(|(_, snapshot)| snapshot),
            prediction,
            sim_time_ms: engine.sim_time_ms(),
        };
        let mut sent = Vec::new();
        let mut snapshot_writer = BitWriter::new();
        match self.codec.write(
            &mut snapshot_writer,
            &frame,
            engine.schemas(),
            &self.acked_schemas,
            &mut sent,
        ) {
            Ok(()) if !writer.fits_with(&snapshot_writer, MAX_PACKAGE_BODY) => {
                self.connection.record_skipped_snapshot();
                let skipped = self.connection.counters().snapshots_skipped_out;
                let message = format!(
                    "Client {}: snapshot {sequence} needs {} bytes, more than a package holds",
                    self.client_id,
                    snapshot_writer.byte_len()
                );
                if skipped == 1 {
                    warn!("{message}");
                } else {
                    debug!("{message} ({skipped} skipped)");
                }
            }
            Ok(()) => {
                *content |= NetworkMessage::SNAPSHOT;
                writer.append(&snapshot_writer);
                info.snapshot = Some(sequence);
                info.schemas.extend(sent.into_iter().map(|id| (SchemaCategory::Entity, id)));
                self.last_snapshot_time = Some(current.server_time);
            }
            Err(e) => error!("Client {}: failed to write snapshot {sequence}: {e}", self.client_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use glam::Vec3;

    use super::*;
    use crate::event::ReliabilityMode;
    use crate::net::{MessageKind, PackageHeader, TransportError, TransportEvent};
    use crate::schema::{FieldType, FieldWriter};
    use crate::snapshot::{DEFAULT_SNAPSHOT_WORDS, EntitySerializer};

    #[derive(Default)]
    struct CaptureTransport {
        sent: VecDeque<Vec<u8>>,
    }

    impl Transport for CaptureTransport {
        fn connect(&mut self) -> Result<(), TransportError> {
            Ok(())
        }
        fn disconnect(&mut self) {}
        fn shutdown(&mut self) {}
        fn update(&mut self) -> Result<(), TransportError> {
            Ok(())
        }
        fn next_event(&mut self) -> Option<TransportEvent> {
            None
        }
        fn send_data(
            &mut self,
            _connection: ConnectionId,
            _kind: MessageKind,
            data: &[u8],
        ) -> Result<(), TransportError> {
            self.sent.push_back(data.to_vec());
            Ok(())
        }
        fn connection_description(&self, connection: ConnectionId) -> String {
            connection.to_string()
        }
    }

    struct Spread;

    impl EntitySerializer for Spread {
        fn serialize_entity(&mut self, id: u16, _type_id: u16, writer: &mut FieldWriter<'_>) {
            let x = id as f32;
            writer.write_vec3(Vec3::new(x, -x, x * 0.5));
        }
    }

    fn crowded_engine(entities: u16) -> SnapshotEngine {
        let mut engine = SnapshotEngine::new(64, DEFAULT_SNAPSHOT_WORDS);
        engine
            .register_entity_type(
                NetworkSchema::new(0).with_field("position", FieldType::Vector3, 20, 2),
            )
            .unwrap();
        for _ in 0..entities {
            engine.spawn(0);
        }
        engine.generate_snapshot(1, 16, &mut Spread);
        engine
    }

    fn ping_schema() -> NetworkSchema {
        NetworkSchema::new(0).with_field("value", FieldType::UInt, 8, 0)
    }

    fn ready_connection() -> ServerConnection {
        let mut connection = ServerConnection::new(ConnectionId(2), &NetworkConfig::default());
        connection.client_info_acked = true;
        connection.acked_map_id = Some(1);
        for value in 0..3 {
            connection.queue_event(NetworkEvent::new(
                &ping_schema(),
                ReliabilityMode::Reliable,
                |w| w.write_uint(value),
            ));
        }
        connection
    }

    #[test]
    fn test_oversized_snapshot_is_skipped_and_events_still_go_out() {
        let engine = crowded_engine(4000);
        let mut event_schemas = SchemaRegistry::new();
        event_schemas.register(SchemaCategory::Event, ping_schema()).unwrap();
        let map = MapInfo::new(1, NetworkSchema::new(0), |_| {});
        let world = OutgoingWorld {
            tick_rate: 60,
            map: Some(&map),
            engine: &engine,
            event_schemas: &event_schemas,
            network_prediction: true,
        };
        let mut connection = ready_connection();
        let mut wire = CaptureTransport::default();

        assert!(connection.send_data(&world, 0, &mut wire));

        assert_eq!(connection.snapshots_skipped(), 1);
        assert_eq!(connection.stats().counters.packages_oversized_out, 0);
        assert!(connection.events_out.is_empty());
        assert_eq!(wire.sent.len(), 1);
        let (header, _) = PackageHeader::read(&wire.sent[0]).unwrap();
        assert!(header.content.contains(NetworkMessage::EVENTS));
        assert!(!header.content.contains(NetworkMessage::SNAPSHOT));
    }

    #[test]
    fn test_events_of_a_package_too_large_to_send_are_requeued() {
        let mut connection = ready_connection();
        let mut wire = CaptureTransport::default();
        let events = connection.events_out.take_for_send(MAX_EVENTS_PER_PACKAGE);
        assert!(connection.events_out.is_empty());

        connection.connection.begin_send_package();
        let info = ServerPackageInfo {
            events,
            ..Default::default()
        };
        let body = vec![0u8; MAX_PACKAGE_BODY + 1];
        let result = connection.connection.complete_send_package(
            info,
            NetworkMessage::EVENTS,
            &body,
            0,
            &mut wire,
        );
        assert!(matches!(result, Err(ProtocolError::PackageTooLarge { .. })));
        assert!(wire.sent.is_empty());

        connection.handle_deliveries();
        assert_eq!(connection.events_out.len(), 3);
    }
}
