//! UDP transport layer and main packet loop.
//!
//! Datagrams carry bincode-encoded [`Packet`] values. Decoding happens
//! here, before anything reaches the engine; the decoded commands are
//! processed sequentially on the main loop, which is what gives each
//! principal's updates their submission-order delivery guarantee.

use crate::connections::{ConnectionRegistry, OutboundMessage, Session};
use crate::dispatcher::Dispatcher;
use crate::enrichment::EnrichmentClient;
use crate::proximity::RolePair;
use crate::regions::{RegionPatch, RegionSpec};
use bincode::{deserialize, serialize};
use log::{debug, error, info, warn};
use shared::{Coordinates, Packet, EVENT_LOG_CAPACITY};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::time::interval;

/// Messages sent from network tasks to main server loop
#[derive(Debug)]
pub enum ServerMessage {
    PacketReceived {
        packet: Packet,
        addr: SocketAddr,
    },
    SessionExpired {
        session: Session,
    },
    #[allow(dead_code)]
    Shutdown,
}

/// Runtime configuration for the server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// Period of the reconciliation sweep; None disables it.
    pub sweep_interval: Option<Duration>,
    pub session_timeout: Duration,
    pub roles: RolePair,
    pub enrichment_url: Option<String>,
}

/// Main server coordinating the transport tasks and the engine
pub struct GeoServer {
    socket: Arc<UdpSocket>,
    dispatcher: Arc<Dispatcher>,
    connections: Arc<ConnectionRegistry>,
    config: ServerConfig,

    // Communication channels
    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
    out_tx: mpsc::UnboundedSender<OutboundMessage>,
    out_rx: mpsc::UnboundedReceiver<OutboundMessage>,
    shutdown_tx: watch::Sender<bool>,
}

impl GeoServer {
    pub async fn new(config: ServerConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let socket = Arc::new(UdpSocket::bind(&config.bind_addr).await?);
        info!("Server listening on {}", config.bind_addr);

        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);

        let connections = Arc::new(ConnectionRegistry::new(out_tx.clone()));
        let enrichment = config
            .enrichment_url
            .as_deref()
            .map(|url| Arc::new(EnrichmentClient::new(url)));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&connections),
            config.roles.clone(),
            enrichment,
        ));

        Ok(GeoServer {
            socket,
            dispatcher,
            connections,
            config,
            server_tx,
            server_rx,
            out_tx,
            out_rx,
            shutdown_tx,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Spawns task that continuously listens for incoming packets
    fn spawn_network_receiver(&self) {
        let socket = Arc::clone(&self.socket);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut buffer = [0u8; 2048];

            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => {
                        if let Ok(packet) = deserialize::<Packet>(&buffer[0..len]) {
                            if let Err(e) =
                                server_tx.send(ServerMessage::PacketReceived { packet, addr })
                            {
                                error!("Failed to send packet to main loop: {}", e);
                                break;
                            }
                        } else {
                            warn!("Failed to deserialize packet from {}", addr);
                        }
                    }
                    Err(e) => {
                        error!("Error receiving packet: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }

    /// Spawns task that drains the outgoing packet queue to the socket
    fn spawn_network_sender(&mut self) {
        let socket = Arc::clone(&self.socket);
        let mut out_rx = std::mem::replace(&mut self.out_rx, mpsc::unbounded_channel().1);

        tokio::spawn(async move {
            while let Some(OutboundMessage { addr, packet }) = out_rx.recv().await {
                match serialize(&packet) {
                    Ok(data) => {
                        if let Err(e) = socket.send_to(&data, addr).await {
                            error!("Failed to send packet to {}: {}", addr, e);
                        }
                    }
                    Err(e) => error!("Failed to serialize outbound packet: {}", e),
                }
            }
        });
    }

    /// Spawns task that monitors session timeouts
    fn spawn_timeout_checker(&self) {
        let connections = Arc::clone(&self.connections);
        let server_tx = self.server_tx.clone();
        let session_timeout = self.config.session_timeout;

        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(1));

            loop {
                ticker.tick().await;

                for session in connections.check_timeouts(session_timeout) {
                    if let Err(e) = server_tx.send(ServerMessage::SessionExpired { session }) {
                        error!("Failed to send timeout message: {}", e);
                        return;
                    }
                }
            }
        });
    }

    /// Spawns the periodic membership sweep, if enabled. The task exits
    /// after finishing its current pass once shutdown is signalled.
    fn spawn_sweeper(&self) {
        let Some(period) = self.config.sweep_interval else {
            info!("Periodic sweep disabled");
            return;
        };

        let dispatcher = Arc::clone(&self.dispatcher);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = interval(period);
            // The first tick of a tokio interval fires immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        dispatcher.sweep();
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("Sweeper shutting down");
                        break;
                    }
                }
            }
        });
    }

    fn reply(&self, addr: SocketAddr, packet: Packet) {
        if let Err(e) = self.out_tx.send(OutboundMessage { addr, packet }) {
            error!("Failed to queue reply for {}: {}", addr, e);
        }
    }

    fn reply_error(&self, addr: SocketAddr, message: String) {
        self.reply(addr, Packet::Error { message });
    }

    /// Resolves the live session behind a transport address, refreshing
    /// its activity marker.
    fn session_at(&self, addr: SocketAddr) -> Option<Session> {
        let session = self.connections.find_by_addr(addr);
        if session.is_some() {
            self.connections.touch_addr(addr);
        }
        session
    }

    /// Decodes one inbound command and drives the dispatcher
    fn handle_packet(&self, packet: Packet, addr: SocketAddr) {
        match packet {
            Packet::Connect {
                principal_id,
                role,
                display_name,
                client_version,
            } => {
                info!(
                    "Principal {} connecting from {} (version: {})",
                    principal_id, addr, client_version
                );
                self.dispatcher
                    .register_session(&principal_id, &role, display_name, addr);
            }

            Packet::SubmitPosition {
                latitude,
                longitude,
                accuracy,
                speed,
                heading,
                timestamp,
            } => {
                let Some(session) = self.session_at(addr) else {
                    self.reply_error(addr, "not connected".to_string());
                    return;
                };

                match self.dispatcher.submit_position(
                    &session.principal_id,
                    latitude,
                    longitude,
                    accuracy,
                    speed,
                    heading,
                    timestamp,
                ) {
                    Ok(position) => self.reply(addr, Packet::PositionStored { position }),
                    Err(e) => self.reply_error(addr, e.to_string()),
                }
            }

            Packet::CreateRegion {
                name,
                description,
                latitude,
                longitude,
                radius_meters,
                pairing_key,
            } => {
                let Some(session) = self.session_at(addr) else {
                    self.reply_error(addr, "not connected".to_string());
                    return;
                };

                let spec = RegionSpec {
                    name,
                    description,
                    center: Coordinates::new(latitude, longitude),
                    radius_meters,
                    owner_id: session.principal_id,
                    pairing_key,
                };

                match self.dispatcher.create_region(spec) {
                    Ok(region) => self.reply(addr, Packet::RegionCreated { region }),
                    Err(e) => self.reply_error(addr, e.to_string()),
                }
            }

            Packet::UpdateRegion {
                region_id,
                name,
                description,
                radius_meters,
                active,
            } => {
                let Some(session) = self.session_at(addr) else {
                    self.reply_error(addr, "not connected".to_string());
                    return;
                };

                let patch = RegionPatch {
                    name,
                    description,
                    center: None,
                    radius_meters,
                    active,
                };

                match self
                    .dispatcher
                    .update_region(&region_id, &session.principal_id, patch)
                {
                    Ok(region) => self.reply(addr, Packet::RegionUpdated { region }),
                    Err(e) => self.reply_error(addr, e.to_string()),
                }
            }

            Packet::DeleteRegion { region_id } => {
                let Some(session) = self.session_at(addr) else {
                    self.reply_error(addr, "not connected".to_string());
                    return;
                };

                match self
                    .dispatcher
                    .delete_region(&region_id, &session.principal_id)
                {
                    Ok(region) => self.reply(addr, Packet::RegionDeleted { region_id: region.id }),
                    Err(e) => self.reply_error(addr, e.to_string()),
                }
            }

            Packet::ListRegions => {
                let Some(session) = self.session_at(addr) else {
                    self.reply_error(addr, "not connected".to_string());
                    return;
                };

                let regions = self.dispatcher.list_regions_for_owner(&session.principal_id);
                self.reply(addr, Packet::Regions { regions });
            }

            Packet::QueryEvents { region_id, limit } => {
                if self.session_at(addr).is_none() {
                    self.reply_error(addr, "not connected".to_string());
                    return;
                }

                let events = self
                    .dispatcher
                    .region_events(region_id.as_deref(), limit.min(EVENT_LOG_CAPACITY));
                self.reply(addr, Packet::Events { events });
            }

            Packet::Subscribe {
                principal_id,
                pairing_key,
            } => {
                let Some(session) = self.session_at(addr) else {
                    self.reply_error(addr, "not connected".to_string());
                    return;
                };

                if !self
                    .dispatcher
                    .subscribe(&session.id, &principal_id, &pairing_key)
                {
                    self.reply_error(addr, "subscription failed".to_string());
                }
            }

            Packet::Unsubscribe {
                principal_id,
                pairing_key,
            } => {
                if let Some(session) = self.session_at(addr) {
                    self.dispatcher
                        .unsubscribe(&session.id, &principal_id, &pairing_key);
                }
            }

            Packet::Disconnect => {
                if let Some(session) = self.connections.find_by_addr(addr) {
                    self.dispatcher.unregister_session(&session.id);
                }
            }

            _ => {
                warn!("Unexpected packet type from client at {}", addr);
            }
        }
    }

    /// Main server loop coordinating all operations
    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.spawn_network_receiver();
        self.spawn_network_sender();
        self.spawn_timeout_checker();
        self.spawn_sweeper();

        info!("Server started successfully");

        loop {
            match self.server_rx.recv().await {
                Some(ServerMessage::PacketReceived { packet, addr }) => {
                    self.handle_packet(packet, addr);
                }
                Some(ServerMessage::SessionExpired { session }) => {
                    self.dispatcher.session_expired(&session);
                }
                Some(ServerMessage::Shutdown) | None => {
                    info!("Server shutting down");
                    // Let the sweeper finish its current pass and exit.
                    let _ = self.shutdown_tx.send(true);
                    break;
                }
            }
        }

        Ok(())
    }

    /// Sender half used to inject control messages (e.g. shutdown)
    pub fn control_sender(&self) -> mpsc::UnboundedSender<ServerMessage> {
        self.server_tx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(bind: &str) -> ServerConfig {
        ServerConfig {
            bind_addr: bind.to_string(),
            sweep_interval: None,
            session_timeout: Duration::from_secs(30),
            roles: RolePair::new("customer", "technician"),
            enrichment_url: None,
        }
    }

    fn connect_packet(principal: &str) -> Packet {
        Packet::Connect {
            principal_id: principal.to_string(),
            role: "customer".to_string(),
            display_name: None,
            client_version: 1,
        }
    }

    fn drain(server: &mut GeoServer) -> Vec<OutboundMessage> {
        let mut messages = Vec::new();
        while let Ok(message) = server.out_rx.try_recv() {
            messages.push(message);
        }
        messages
    }

    #[tokio::test]
    async fn test_connect_then_submit() {
        let mut server = GeoServer::new(config("127.0.0.1:0")).await.unwrap();
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();

        server.handle_packet(connect_packet("p"), addr);

        let acks = drain(&mut server);
        assert!(matches!(acks[0].packet, Packet::ConnectionAck { .. }));

        server.handle_packet(
            Packet::SubmitPosition {
                latitude: 10.0,
                longitude: 20.0,
                accuracy: None,
                speed: None,
                heading: None,
                timestamp: None,
            },
            addr,
        );

        let replies = drain(&mut server);
        assert!(replies
            .iter()
            .any(|m| matches!(&m.packet, Packet::PositionStored { position }
                if position.principal_id == "p")));
    }

    #[tokio::test]
    async fn test_submit_without_session_rejected() {
        let mut server = GeoServer::new(config("127.0.0.1:0")).await.unwrap();
        let addr: SocketAddr = "127.0.0.1:9001".parse().unwrap();

        server.handle_packet(
            Packet::SubmitPosition {
                latitude: 10.0,
                longitude: 20.0,
                accuracy: None,
                speed: None,
                heading: None,
                timestamp: None,
            },
            addr,
        );

        let replies = drain(&mut server);
        assert!(matches!(replies[0].packet, Packet::Error { .. }));
    }

    #[tokio::test]
    async fn test_invalid_position_yields_error_reply() {
        let mut server = GeoServer::new(config("127.0.0.1:0")).await.unwrap();
        let addr: SocketAddr = "127.0.0.1:9002".parse().unwrap();

        server.handle_packet(connect_packet("p"), addr);
        drain(&mut server);

        server.handle_packet(
            Packet::SubmitPosition {
                latitude: 91.0,
                longitude: 0.0,
                accuracy: None,
                speed: None,
                heading: None,
                timestamp: None,
            },
            addr,
        );

        let replies = drain(&mut server);
        assert!(matches!(replies[0].packet, Packet::Error { .. }));
    }

    #[tokio::test]
    async fn test_region_lifecycle_over_transport() {
        let mut server = GeoServer::new(config("127.0.0.1:0")).await.unwrap();
        let addr: SocketAddr = "127.0.0.1:9003".parse().unwrap();

        server.handle_packet(connect_packet("owner"), addr);
        drain(&mut server);

        server.handle_packet(
            Packet::CreateRegion {
                name: "depot".to_string(),
                description: None,
                latitude: 0.0,
                longitude: 0.0,
                radius_meters: None,
                pairing_key: None,
            },
            addr,
        );

        let replies = drain(&mut server);
        let region_id = match &replies[0].packet {
            Packet::RegionCreated { region } => {
                assert_eq!(region.radius_meters, shared::DEFAULT_REGION_RADIUS_METERS);
                region.id.clone()
            }
            other => panic!("Unexpected reply: {:?}", other),
        };

        server.handle_packet(Packet::ListRegions, addr);
        let replies = drain(&mut server);
        assert!(matches!(&replies[0].packet,
            Packet::Regions { regions } if regions.len() == 1));

        server.handle_packet(Packet::DeleteRegion { region_id }, addr);
        let replies = drain(&mut server);
        assert!(matches!(replies[0].packet, Packet::RegionDeleted { .. }));
    }

    #[tokio::test]
    async fn test_query_events_over_transport() {
        let mut server = GeoServer::new(config("127.0.0.1:0")).await.unwrap();
        let addr: SocketAddr = "127.0.0.1:9005".parse().unwrap();

        server.handle_packet(connect_packet("p"), addr);
        server.handle_packet(
            Packet::CreateRegion {
                name: "depot".to_string(),
                description: None,
                latitude: 0.0,
                longitude: 0.0,
                radius_meters: Some(100.0),
                pairing_key: None,
            },
            addr,
        );
        server.handle_packet(
            Packet::SubmitPosition {
                latitude: 0.0,
                longitude: 0.0,
                accuracy: None,
                speed: None,
                heading: None,
                timestamp: None,
            },
            addr,
        );
        drain(&mut server);

        server.handle_packet(
            Packet::QueryEvents {
                region_id: None,
                limit: 10,
            },
            addr,
        );

        let replies = drain(&mut server);
        match &replies[0].packet {
            Packet::Events { events } => assert!(!events.is_empty()),
            other => panic!("Unexpected reply: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_disconnect_removes_session() {
        let mut server = GeoServer::new(config("127.0.0.1:0")).await.unwrap();
        let addr: SocketAddr = "127.0.0.1:9004".parse().unwrap();

        server.handle_packet(connect_packet("p"), addr);
        assert_eq!(server.connections.len(), 1);

        server.handle_packet(Packet::Disconnect, addr);
        assert!(server.connections.is_empty());
        drain(&mut server);
    }

    #[test]
    fn test_server_message_creation() {
        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        let msg = ServerMessage::PacketReceived {
            packet: Packet::Disconnect,
            addr,
        };

        match msg {
            ServerMessage::PacketReceived { packet, addr: a } => {
                assert_eq!(a, addr);
                assert!(matches!(packet, Packet::Disconnect));
            }
            _ => panic!("Unexpected message type"),
        }
    }
}
