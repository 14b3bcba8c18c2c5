use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use rkyv::util::AlignedVec;
use rkyv::{Archive, Deserialize, Serialize, rancor};

use crate::config::UdpSettings;

use super::protocol::{MAX_PACKAGE_SIZE, PROTOCOL_MAGIC, PROTOCOL_VERSION};
use super::transport::{ConnectionId, MessageKind, Transport, TransportError, TransportEvent};

const RECV_BUFFER_SIZE: usize = MAX_PACKAGE_SIZE + 64;

/// Envelope around every datagram on the socket.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct Datagram {
    pub magic: u32,
    pub version: u32,
    pub kind: u8,
    pub payload: Vec<u8>,
}

impl Datagram {
    pub fn new(kind: MessageKind, payload: &[u8]) -> Self {
        Self {
            magic: PROTOCOL_MAGIC,
            version: PROTOCOL_VERSION,
            kind: kind as u8,
            payload: payload.to_vec(),
        }
    }

    pub fn serialize(&self) -> Result<Vec<u8>, TransportError> {
        rkyv::to_bytes::<rancor::Error>(self)
            .map(|aligned| aligned.into_vec())
            .map_err(TransportError::Encode)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, TransportError> {
        let mut aligned = AlignedVec::<16>::with_capacity(data.len());
        aligned.extend_from_slice(data);
        rkyv::from_bytes::<Self, rancor::Error>(&aligned).map_err(TransportError::Decode)
    }

    pub fn is_valid(&self) -> bool {
        self.magic == PROTOCOL_MAGIC && self.version == PROTOCOL_VERSION
    }
}

#[derive(Debug, Clone, Copy)]
enum Role {
    Host { bind: SocketAddr },
    Client { server: SocketAddr },
}

#[derive(Debug)]
struct Peer {
    addr: SocketAddr,
    last_receive: Instant,
}

#[derive(Debug)]
struct JoinAttempt {
    attempts: u32,
    last_attempt: Instant,
}

/// Non-blocking UDP transport.
///
/// A host binds a known port and assigns ids to peers as their join requests
/// arrive; a client joins one host which it addresses as [`ConnectionId::HOST`].
pub struct UdpTransport {
    role: Role,
    settings: UdpSettings,
    socket: Option<UdpSocket>,
    peers: HashMap<ConnectionId, Peer>,
    ids_by_addr: HashMap<SocketAddr, ConnectionId>,
    next_id: u8,
    join: Option<JoinAttempt>,
    events: VecDeque<TransportEvent>,
    recv_buffer: [u8; RECV_BUFFER_SIZE],
}

impl UdpTransport {
    pub fn host(bind: SocketAddr, settings: UdpSettings) -> Self {
        Self::with_role(Role::Host { bind }, settings)
    }

    pub fn client(server: SocketAddr, settings: UdpSettings) -> Self {
        Self::with_role(Role::Client { server }, settings)
    }

    fn with_role(role: Role, settings: UdpSettings) -> Self {
        Self {
            role,
            settings,
            socket: None,
            peers: HashMap::new(),
            ids_by_addr: HashMap::new(),
            next_id: ConnectionId::HOST.0 + 1,
            join: None,
            events: VecDeque::new(),
            recv_buffer: [0u8; RECV_BUFFER_SIZE],
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    fn send_to(&self, addr: SocketAddr, kind: MessageKind, data: &[u8]) -> Result<(), TransportError> {
        let socket = self.socket.as_ref().ok_or(TransportError::NotConnected)?;
        let bytes = Datagram::new(kind, data).serialize()?;
        match socket.send_to(&bytes, addr) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                debug!("Socket busy, dropping datagram to {addr}");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn add_peer(&mut self, id: ConnectionId, addr: SocketAddr) {
        self.peers.insert(id, Peer {
            addr,
            last_receive: Instant::now(),
        });
        self.ids_by_addr.insert(addr, id);
        self.events.push_back(TransportEvent::Connect(id));
    }

    fn remove_peer(&mut self, id: ConnectionId) {
        if let Some(peer) = self.peers.remove(&id) {
            self.ids_by_addr.remove(&peer.addr);
            self.events.push_back(TransportEvent::Disconnect(id));
        }
    }

    fn handle_datagram(&mut self, datagram: Datagram, addr: SocketAddr) {
        let Some(kind) = MessageKind::from_u8(datagram.kind) else {
            debug!("Unknown datagram kind {} from {addr}", datagram.kind);
            return;
        };

        let known = self.ids_by_addr.get(&addr).copied();
        if let Some(id) = known {
            if let Some(peer) = self.peers.get_mut(&id) {
                peer.last_receive = Instant::now();
            }
        }

        match (self.role, kind, known) {
            (_, MessageKind::Data, Some(id)) => {
                self.events.push_back(TransportEvent::Data(id, datagram.payload));
            }
            (_, MessageKind::Disconnect, Some(id)) => {
                info!("Peer {id} at {addr} left");
                self.remove_peer(id);
            }
            (Role::Host { .. }, MessageKind::Connect, None) => {
                if self.next_id == 0 {
                    warn!("Out of connection ids, ignoring join from {addr}");
                    return;
                }
                let id = ConnectionId(self.next_id);
                self.next_id = self.next_id.wrapping_add(1);
                info!("Peer {id} joined from {addr}");
                self.add_peer(id, addr);
            }
            (Role::Client { server }, MessageKind::Connect, None) if addr == server => {
                self.join = None;
                info!("Joined host at {addr}");
                self.add_peer(ConnectionId::HOST, addr);
            }
            (_, MessageKind::Connect, Some(_)) => {}
            (_, _, None) => debug!("Ignoring datagram from unknown peer {addr}"),
        }
    }

    fn retry_join(&mut self) -> Result<(), TransportError> {
        let Role::Client { server } = self.role else {
            return Ok(());
        };
        let Some(join) = &self.join else {
            return Ok(());
        };
        if join.last_attempt.elapsed() < Duration::from_millis(self.settings.connect_retry_ms) {
            return Ok(());
        }
        if join.attempts >= self.settings.max_connect_attempts {
            warn!("No answer from {server} after {} attempts", join.attempts);
            self.join = None;
            return Ok(());
        }

        let attempts = join.attempts + 1;
        self.send_to(server, MessageKind::Connect, &[])?;
        self.join = Some(JoinAttempt {
            attempts,
            last_attempt: Instant::now(),
        });
        Ok(())
    }

    fn expire_silent_peers(&mut self) {
        let timeout = Duration::from_millis(self.settings.peer_timeout_ms);
        let silent: Vec<ConnectionId> = self
            .peers
            .iter()
            .filter(|(_, peer)| peer.last_receive.elapsed() > timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in silent {
            warn!("Peer {id} timed out");
            self.remove_peer(id);
        }
    }
}

impl Transport for UdpTransport {
    fn connect(&mut self) -> Result<(), TransportError> {
        let bind = match self.role {
            Role::Host { bind } => bind,
            Role::Client { server } if server.is_ipv4() => SocketAddr::from(([0, 0, 0, 0], 0)),
            Role::Client { .. } => SocketAddr::from(([0u16; 8], 0)),
        };
        let socket = UdpSocket::bind(bind)?;
        socket.set_nonblocking(true)?;
        info!("UDP transport bound to {}", socket.local_addr()?);
        self.socket = Some(socket);
        self.events.push_back(TransportEvent::Connect(ConnectionId::LOCAL));

        if let Role::Client { server } = self.role {
            self.send_to(server, MessageKind::Connect, &[])?;
            self.join = Some(JoinAttempt {
                attempts: 1,
                last_attempt: Instant::now(),
            });
        }
        Ok(())
    }

    fn disconnect(&mut self) {
        if self.socket.is_none() {
            return;
        }
        let peers: Vec<(ConnectionId, SocketAddr)> =
            self.peers.iter().map(|(id, p)| (*id, p.addr)).collect();
        for (id, addr) in peers {
            if let Err(e) = self.send_to(addr, MessageKind::Disconnect, &[]) {
                debug!("Failed to notify {id} of disconnect: {e}");
            }
            self.remove_peer(id);
        }
        self.join = None;
        self.socket = None;
        self.events.push_back(TransportEvent::Disconnect(ConnectionId::LOCAL));
    }

    fn shutdown(&mut self) {
        self.disconnect();
        self.events.clear();
    }

    fn update(&mut self) -> Result<(), TransportError> {
        if self.socket.is_none() {
            return Ok(());
        }

        loop {
            let Some(socket) = self.socket.as_ref() else {
                break;
            };
            match socket.recv_from(&mut self.recv_buffer) {
                Ok((size, addr)) => match Datagram::deserialize(&self.recv_buffer[..size]) {
                    Ok(datagram) if datagram.is_valid() => self.handle_datagram(datagram, addr),
                    Ok(_) => debug!("Datagram with foreign magic from {addr}"),
                    Err(e) => debug!("Undecodable datagram from {addr}: {e}"),
                },
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::ConnectionReset => continue,
                Err(e) => return Err(e.into()),
            }
        }

        self.retry_join()?;
        self.expire_silent_peers();
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
        let addr = self
            .peers
            .get(&connection)
            .map(|peer| peer.addr)
            .ok_or(TransportError::UnknownConnection(connection))?;
        self.send_to(addr, kind, data)?;
        if kind == MessageKind::Disconnect {
            self.remove_peer(connection);
        }
        Ok(())
    }

    fn connection_description(&self, connection: ConnectionId) -> String {
        match self.peers.get(&connection) {
            Some(peer) => format!("udp:{}", peer.addr),
            None => format!("udp:{connection}"),
        }
    }
}
