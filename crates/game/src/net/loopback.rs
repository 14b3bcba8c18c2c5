use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use log::debug;
use rand::SeedableRng;
use rand::rngs::StdRng;

use super::stats::PacketLossSimulation;
use super::transport::{ConnectionId, MessageKind, Transport, TransportError, TransportEvent};

#[derive(Debug)]
struct InFlight {
    remaining_updates: u32,
    event: TransportEvent,
}

#[derive(Debug, Default)]
struct Endpoint {
    joined: bool,
    in_flight: Vec<InFlight>,
}

#[derive(Debug)]
struct Hub {
    endpoints: HashMap<u8, Endpoint>,
    next_id: u8,
    simulation: PacketLossSimulation,
    rng: StdRng,
}

impl Hub {
    fn push(&mut self, to: u8, event: TransportEvent, lossy: bool) {
        if lossy && self.simulation.should_drop(&mut self.rng) {
            return;
        }
        let remaining_updates = if lossy {
            self.simulation.delay_updates(&mut self.rng)
        } else {
            0
        };
        if let Some(endpoint) = self.endpoints.get_mut(&to) {
            endpoint.in_flight.push(InFlight {
                remaining_updates,
                event,
            });
        }
    }
}

/// In-process relay session connecting one host and any number of peers.
///
/// Datagrams pass through the configured [`PacketLossSimulation`] using a
/// seeded generator so runs are reproducible. Session events (join, leave)
/// are never dropped.
#[derive(Debug, Clone)]
pub struct LoopbackNetwork {
    hub: Rc<RefCell<Hub>>,
}

impl LoopbackNetwork {
    pub fn new(seed: u64) -> Self {
        Self::with_simulation(seed, PacketLossSimulation::default())
    }

    pub fn with_simulation(seed: u64, simulation: PacketLossSimulation) -> Self {
        Self {
            hub: Rc::new(RefCell::new(Hub {
                endpoints: HashMap::new(),
                next_id: ConnectionId::HOST.0,
                simulation,
                rng: StdRng::seed_from_u64(seed),
            })),
        }
    }

    pub fn set_simulation(&self, simulation: PacketLossSimulation) {
        self.hub.borrow_mut().simulation = simulation;
    }

    /// Creates a transport endpoint. The first one created is the host.
    pub fn endpoint(&self) -> LoopbackTransport {
        let mut hub = self.hub.borrow_mut();
        let id = hub.next_id;
        hub.next_id = hub.next_id.wrapping_add(1);
        hub.endpoints.insert(id, Endpoint::default());
        LoopbackTransport {
            hub: Rc::clone(&self.hub),
            id,
            events: VecDeque::new(),
        }
    }
}

#[derive(Debug)]
pub struct LoopbackTransport {
    hub: Rc<RefCell<Hub>>,
    id: u8,
    events: VecDeque<TransportEvent>,
}

impl LoopbackTransport {
    pub fn id(&self) -> ConnectionId {
        ConnectionId(self.id)
    }

    fn is_host(&self) -> bool {
        self.id == ConnectionId::HOST.0
    }

    fn leave(&mut self) {
        let mut hub = self.hub.borrow_mut();
        let Some(endpoint) = hub.endpoints.get_mut(&self.id) else {
            return;
        };
        if !endpoint.joined {
            return;
        }
        endpoint.joined = false;
        endpoint.in_flight.clear();

        let peers: Vec<u8> = hub
            .endpoints
            .iter()
            .filter(|(id, e)| **id != self.id && e.joined)
            .map(|(id, _)| *id)
            .collect();
        for peer in peers {
            hub.push(peer, TransportEvent::Disconnect(ConnectionId(self.id)), false);
        }
        self.events
            .push_back(TransportEvent::Disconnect(ConnectionId::LOCAL));
    }
}

impl Transport for LoopbackTransport {
    fn connect(&mut self) -> Result<(), TransportError> {
        let mut hub = self.hub.borrow_mut();
        if let Some(endpoint) = hub.endpoints.get_mut(&self.id) {
            endpoint.joined = true;
        }
        self.events.push_back(TransportEvent::Connect(ConnectionId::LOCAL));

        let host = ConnectionId::HOST.0;
        let host_joined = hub.endpoints.get(&host).is_some_and(|e| e.joined);
        if !self.is_host() && host_joined {
            hub.push(host, TransportEvent::Connect(ConnectionId(self.id)), false);
        }
        Ok(())
    }

    fn disconnect(&mut self) {
        self.leave();
    }

    fn shutdown(&mut self) {
        self.leave();
        self.events.clear();
    }

    fn update(&mut self) -> Result<(), TransportError> {
        let mut hub = self.hub.borrow_mut();
        let Some(endpoint) = hub.endpoints.get_mut(&self.id) else {
            return Ok(());
        };

        let mut waiting = Vec::with_capacity(endpoint.in_flight.len());
        for mut in_flight in endpoint.in_flight.drain(..) {
            if in_flight.remaining_updates == 0 {
                self.events.push_back(in_flight.event);
            } else {
                in_flight.remaining_updates -= 1;
                waiting.push(in_flight);
            }
        }
        endpoint.in_flight = waiting;
        Ok(())
    }

    fn next_event(&mut self) -> Option<TransportEvent> {
        self.events.pop_front()
    }

    fn send_data(
        &mut self,
        connection: ConnectionId,
        kind: MessageKind,
        data: &[u8],
    ) -> Result<(), TransportError> {
        let mut hub = self.hub.borrow_mut();
        if !hub.endpoints.get(&self.id).is_some_and(|e| e.joined) {
            return Err(TransportError::NotConnected);
        }
        if !hub.endpoints.get(&connection.0).is_some_and(|e| e.joined) {
            debug!("Loopback {}: peer {connection} is gone", self.id);
            return Err(TransportError::UnknownConnection(connection));
        }

        let from = ConnectionId(self.id);
        match kind {
            MessageKind::Data => hub.push(connection.0, TransportEvent::Data(from, data.to_vec()), true),
            MessageKind::Connect => hub.push(connection.0, TransportEvent::Connect(from), false),
            MessageKind::Disconnect => {
                hub.push(connection.0, TransportEvent::Disconnect(from), false)
            }
        }
        Ok(())
    }

    fn connection_description(&self, connection: ConnectionId) -> String {
        format!("loopback:{}", connection.0)
    }
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        self.leave();
        self.hub.borrow_mut().endpoints.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(transport: &mut LoopbackTransport) -> Vec<TransportEvent> {
        transport.update().unwrap();
        std::iter::from_fn(|| transport.next_event()).collect()
    }

    #[test]
    fn test_join_and_exchange() {
        let network = LoopbackNetwork::new(1);
        let mut host = network.endpoint();
        let mut peer = network.endpoint();

        host.connect().unwrap();
        peer.connect().unwrap();
        assert_eq!(drain(&mut host), vec![
            TransportEvent::Connect(ConnectionId::LOCAL),
            TransportEvent::Connect(peer.id()),
        ]);

        host.send_data(peer.id(), MessageKind::Connect, &[]).unwrap();
        host.send_data(peer.id(), MessageKind::Data, b"hi").unwrap();
        assert_eq!(drain(&mut peer), vec![
            TransportEvent::Connect(ConnectionId::LOCAL),
            TransportEvent::Connect(ConnectionId::HOST),
            TransportEvent::Data(ConnectionId::HOST, b"hi".to_vec()),
        ]);
    }

    #[test]
    fn test_join_without_host_goes_nowhere() {
        let network = LoopbackNetwork::new(1);
        let _host = network.endpoint();
        let mut peer = network.endpoint();

        peer.connect().unwrap();
        assert_eq!(drain(&mut peer), vec![TransportEvent::Connect(ConnectionId::LOCAL)]);
        assert!(matches!(
            peer.send_data(ConnectionId::HOST, MessageKind::Data, b"x"),
            Err(TransportError::UnknownConnection(_))
        ));
    }

    #[test]
    fn test_leaving_notifies_peers() {
        let network = LoopbackNetwork::new(1);
        let mut host = network.endpoint();
        let mut peer = network.endpoint();
        host.connect().unwrap();
        peer.connect().unwrap();
        drain(&mut host);

        peer.disconnect();
        assert_eq!(drain(&mut host), vec![TransportEvent::Disconnect(peer.id())]);
        assert_eq!(drain(&mut peer).last(), Some(&TransportEvent::Disconnect(ConnectionId::LOCAL)));
    }

    #[test]
    fn test_simulated_delay_reorders() {
        let network = LoopbackNetwork::with_simulation(9, PacketLossSimulation {
            enabled: true,
            loss_percent: 0.0,
            min_delay_updates: 0,
            max_delay_updates: 3,
        });
        let mut host = network.endpoint();
        let mut peer = network.endpoint();
        host.connect().unwrap();
        peer.connect().unwrap();

        for i in 0..50u8 {
            peer.send_data(ConnectionId::HOST, MessageKind::Data, &[i]).unwrap();
        }

        let mut received = Vec::new();
        for _ in 0..5 {
            for event in drain(&mut host) {
                if let TransportEvent::Data(_, data) = event {
                    received.push(data[0]);
                }
            }
        }
        assert_eq!(received.len(), 50);
        assert!(received.windows(2).any(|w| w[0] > w[1]));
    }
}
