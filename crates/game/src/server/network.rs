use std::collections::BTreeMap;
use std::mem;

use log::{debug, error, info, warn};

use crate::config::{MAX_TICK_RATE, NetworkConfig};
use crate::event::NetworkEvent;
use crate::map::MapInfo;
use crate::net::{ConnectionId, MessageKind, Transport, TransportEvent, format_stats_table, tick_diff};
use crate::schema::{FieldWriter, NetworkSchema, SchemaCategory, SchemaError, SchemaRegistry};
use crate::snapshot::{DEFAULT_SNAPSHOT_WORDS, EntitySerializer, SnapshotEngine};

use super::connection::{OutgoingWorld, ServerConnection};

/// Session changes reported to the server game.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerEvent {
    SessionJoined,
    SessionLost,
    ClientConnected { id: ConnectionId },
    ClientDisconnected { id: ConnectionId },
    /// The world no longer fits into one package for this client. Reported
    /// once per connection; the client keeps getting everything else.
    SnapshotTooLarge { id: ConnectionId },
}

/// Server end of the replication protocol: every client connection plus the
/// replicated world.
pub struct NetworkServer {
    transport: Box<dyn Transport>,
    config: NetworkConfig,
    joined: bool,
    connections: BTreeMap<ConnectionId, ServerConnection>,
    engine: SnapshotEngine,
    event_schemas: SchemaRegistry,
    map: Option<MapInfo>,
    pending_events: Vec<ServerEvent>,
    frame: u64,
}

impl NetworkServer {
    pub fn new(transport: Box<dyn Transport>, config: NetworkConfig) -> Self {
        if config.server_tick_rate > MAX_TICK_RATE {
            warn!(
                "Tick rate {} does not fit ClientInfo, clients will see {MAX_TICK_RATE}",
                config.server_tick_rate
            );
        }
        Self {
            transport,
            engine: SnapshotEngine::new(config.snapshot_delta_cache_size, DEFAULT_SNAPSHOT_WORDS),
            config,
            joined: false,
            connections: BTreeMap::new(),
            event_schemas: SchemaRegistry::new(),
            map: None,
            pending_events: Vec::new(),
            frame: 0,
        }
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Joins the relay session as its host.
    pub fn start(&mut self) {
        if let Err(e) = self.transport.connect() {
            error!("Failed to start hosting: {e}");
        }
    }

    pub fn is_joined(&self) -> bool {
        self.joined
    }

    pub fn engine(&self) -> &SnapshotEngine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut SnapshotEngine {
        &mut self.engine
    }

    pub fn register_entity_type(&mut self, schema: NetworkSchema) -> Result<(), SchemaError> {
        self.engine.register_entity_type(schema)
    }

    pub fn register_event_type(&mut self, schema: NetworkSchema) -> Result<(), SchemaError> {
        self.event_schemas.register(SchemaCategory::Event, schema)
    }

    pub fn event_schema(&self, id: u16) -> Option<&NetworkSchema> {
        self.event_schemas.get(SchemaCategory::Event, id)
    }

    pub fn map(&self) -> Option<&MapInfo> {
        self.map.as_ref()
    }

    /// Publishes a new map and returns its id. Clients stop receiving
    /// snapshots until they acknowledged it.
    pub fn set_map(&mut self, schema: NetworkSchema, fill: impl FnOnce(&mut FieldWriter<'_>)) -> u16 {
        let map_id = self.map.as_ref().map_or(1, |m| m.map_id.wrapping_add(1));
        self.map = Some(MapInfo::new(map_id, schema, fill));
        info!("Map {map_id} published");
        map_id
    }

    pub fn connection(&self, id: ConnectionId) -> Option<&ServerConnection> {
        self.connections.get(&id)
    }

    pub fn connections(&self) -> impl Iterator<Item = &ServerConnection> {
        self.connections.values()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Queues an event for every connected client.
    pub fn queue_event(&mut self, event: NetworkEvent) {
        for connection in self.connections.values_mut() {
            connection.queue_event(event.clone());
        }
    }

    pub fn queue_event_to(&mut self, id: ConnectionId, event: NetworkEvent) -> bool {
        match self.connections.get_mut(&id) {
            Some(connection) => {
                connection.queue_event(event);
                true
            }
            None => false,
        }
    }

    pub fn take_events(&mut self) -> Vec<ServerEvent> {
        mem::take(&mut self.pending_events)
    }

    /// Events received from clients since the last call.
    pub fn take_client_events(&mut self) -> Vec<(ConnectionId, NetworkEvent)> {
        let mut events = Vec::new();
        for (&id, connection) in &mut self.connections {
            events.extend(connection.take_events().into_iter().map(|e| (id, e)));
        }
        events
    }

    /// Polls the transport and processes everything that arrived.
    pub fn update(&mut self, now_ms: u64) {
        if let Err(e) = self.transport.update() {
            warn!("Transport update failed: {e}");
        }

        while let Some(event) = self.transport.next_event() {
            match event {
                TransportEvent::Connect(id) if id.is_local() => {
                    info!("Hosting session");
                    self.joined = true;
                    self.pending_events.push(ServerEvent::SessionJoined);
                }
                TransportEvent::Connect(id) => self.accept(id),
                TransportEvent::Disconnect(id) if id.is_local() => {
                    if self.joined {
                        warn!("Lost the session, dropping {} clients", self.connections.len());
                        self.joined = false;
                        for (id, mut connection) in mem::take(&mut self.connections) {
                            connection.shutdown();
                            self.pending_events.push(ServerEvent::ClientDisconnected { id });
                        }
                        self.pending_events.push(ServerEvent::SessionLost);
                    }
                }
                TransportEvent::Disconnect(id) => {
                    if let Some(mut connection) = self.connections.remove(&id) {
                        info!("Client {id} disconnected");
                        connection.shutdown();
                        self.pending_events.push(ServerEvent::ClientDisconnected { id });
                    }
                }
                TransportEvent::Data(id, data) => match self.connections.get_mut(&id) {
                    Some(connection) => connection.process_package(&data, now_ms),
                    None => debug!("Data from unknown connection {id}"),
                },
            }
        }
    }

    fn accept(&mut self, id: ConnectionId) {
        if self.connections.contains_key(&id) {
            return;
        }
        info!(
            "Client {id} connected from {}",
            self.transport.connection_description(id)
        );
        self.connections.insert(id, ServerConnection::new(id, &self.config));
        if let Err(e) = self.transport.send_data(id, MessageKind::Connect, &[]) {
            warn!("Failed to confirm connection {id}: {e}");
        }
        self.pending_events.push(ServerEvent::ClientConnected { id });
    }

    pub fn disconnect_client(&mut self, id: ConnectionId) {
        if let Some(mut connection) = self.connections.remove(&id) {
            info!("Disconnecting client {id}");
            if let Err(e) = self.transport.send_data(id, MessageKind::Disconnect, &[]) {
                debug!("Disconnect notice to {id} failed: {e}");
            }
            connection.shutdown();
            self.pending_events.push(ServerEvent::ClientDisconnected { id });
        }
    }

    /// Captures the world for `server_time`; see [`SnapshotEngine::generate_snapshot`].
    pub fn generate_snapshot(
        &mut self,
        server_time: u32,
        sim_time_ms: u8,
        serializer: &mut dyn EntitySerializer,
    ) -> u32 {
        self.engine.generate_snapshot(server_time, sim_time_ms, serializer)
    }

    /// Oldest snapshot any client may still use as a baseline.
    fn min_snapshot_ack(&self) -> Option<u32> {
        let mut min: Option<u32> = None;
        for connection in self.connections.values() {
            let ack = connection.max_snapshot_ack()?;
            if min.is_none_or(|m| tick_diff(ack, m) < 0) {
                min = Some(ack);
            }
        }
        min
    }

    /// Sends a package to every client whose send budget allows it.
    pub fn send_data(&mut self, now_ms: u64) {
        let world = OutgoingWorld {
            tick_rate: self.config.server_tick_rate,
            map: self.map.as_ref(),
            engine: &self.engine,
            event_schemas: &self.event_schemas,
            network_prediction: self.config.network_prediction,
        };
        for (&id, connection) in &mut self.connections {
            let skipped = connection.snapshots_skipped();
            connection.send_data(&world, now_ms, self.transport.as_mut());
            if skipped == 0 && connection.snapshots_skipped() > 0 {
                self.pending_events.push(ServerEvent::SnapshotTooLarge { id });
            }
        }

        let min_ack = self.min_snapshot_ack();
        self.engine.release_despawned(min_ack);

        self.frame += 1;
        let interval = self.config.stats_interval as u64;
        if interval > 0 && self.frame % interval == 0 && !self.connections.is_empty() {
            let rows: Vec<_> = self.connections.values().map(|c| c.stats()).collect();
            info!("Server network stats\n{}", format_stats_table(&rows));
        }
    }

    pub fn shutdown(&mut self) {
        let ids: Vec<ConnectionId> = self.connections.keys().copied().collect();
        for id in ids {
            self.disconnect_client(id);
        }
        self.transport.shutdown();
        self.joined = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::LoopbackNetwork;

    #[test]
    fn test_clients_are_accepted_and_confirmed() {
        let network = LoopbackNetwork::new(1);
        let mut server = NetworkServer::new(Box::new(network.endpoint()), NetworkConfig::default());
        server.start();
        server.update(0);
        assert!(server.is_joined());

        let mut client = network.endpoint();
        client.connect().unwrap();
        server.update(0);
        assert_eq!(server.connection_count(), 1);
        assert_eq!(
            server.take_events(),
            vec![
                ServerEvent::SessionJoined,
                ServerEvent::ClientConnected { id: client.id() }
            ]
        );

        client.update().unwrap();
        let events: Vec<_> = std::iter::from_fn(|| client.next_event()).collect();
        assert!(events.contains(&TransportEvent::Connect(ConnectionId::HOST)));

        drop(client);
        server.update(0);
        assert_eq!(server.connection_count(), 0);
    }

    #[test]
    fn test_map_ids_increase() {
        let network = LoopbackNetwork::new(1);
        let mut server = NetworkServer::new(Box::new(network.endpoint()), NetworkConfig::default());
        let schema = NetworkSchema::new(0);
        assert_eq!(server.set_map(schema.clone(), |_| {}), 1);
        assert_eq!(server.set_map(schema, |_| {}), 2);
        assert_eq!(server.map().map(|m| m.map_id), Some(2));
    }
}
