//! Live session registry and subscription fan-out.
//!
//! Holds the transport sessions, their topic subscriptions, and the
//! outbound channel to the transport's sender task. This is the only
//! component that pushes packets toward a session; delivery is
//! best-effort and a session that vanished between subscribe and
//! deliver is silently skipped.

use crate::error::{EngineError, Result};
use log::{info, warn};
use parking_lot::RwLock;
use shared::{now_millis, Packet};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Packet routed to one transport address by the sender task.
#[derive(Debug)]
pub struct OutboundMessage {
    pub addr: SocketAddr,
    pub packet: Packet,
}

/// A live transport connection bound to one principal. Exists only
/// while the connection is open.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub principal_id: String,
    pub role: String,
    pub display_name: Option<String>,
    pub connected_at: u64,
    pub addr: SocketAddr,
    pub last_seen: Instant,
}

/// Subscription topic: updates about one principal within one
/// pairing context.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic {
    pub principal_id: String,
    pub pairing_key: String,
}

impl Topic {
    pub fn new(principal_id: &str, pairing_key: &str) -> Self {
        Self {
            principal_id: principal_id.to_string(),
            pairing_key: pairing_key.to_string(),
        }
    }
}

pub struct ConnectionRegistry {
    outbound: mpsc::UnboundedSender<OutboundMessage>,
    sessions: RwLock<HashMap<String, Session>>,
    by_principal: RwLock<HashMap<String, String>>,
    subscriptions: RwLock<HashMap<Topic, HashSet<String>>>,
}

impl ConnectionRegistry {
    pub fn new(outbound: mpsc::UnboundedSender<OutboundMessage>) -> Self {
        Self {
            outbound,
            sessions: RwLock::new(HashMap::new()),
            by_principal: RwLock::new(HashMap::new()),
            subscriptions: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a live session for a principal. A principal holds at
    /// most one session; any previous one is dropped first.
    pub fn register(
        &self,
        principal_id: &str,
        role: &str,
        display_name: Option<String>,
        addr: SocketAddr,
    ) -> Session {
        if let Some(existing) = self.session_for_principal(principal_id) {
            info!(
                "Replacing existing session {} for principal {}",
                existing.id, principal_id
            );
            self.unregister(&existing.id);
        }

        let session = Session {
            id: Uuid::new_v4().to_string(),
            principal_id: principal_id.to_string(),
            role: role.to_string(),
            display_name,
            connected_at: now_millis(),
            addr,
            last_seen: Instant::now(),
        };

        info!(
            "Session {} registered for principal {} ({}) from {}",
            session.id, principal_id, role, addr
        );

        self.by_principal
            .write()
            .insert(principal_id.to_string(), session.id.clone());
        self.sessions
            .write()
            .insert(session.id.clone(), session.clone());

        session
    }

    /// Removes a session along with all of its subscriptions. The
    /// caller is responsible for the principal's offline transition.
    pub fn unregister(&self, session_id: &str) -> Option<Session> {
        let session = self.sessions.write().remove(session_id)?;

        {
            let mut by_principal = self.by_principal.write();
            if by_principal.get(&session.principal_id) == Some(&session.id) {
                by_principal.remove(&session.principal_id);
            }
        }

        {
            let mut subscriptions = self.subscriptions.write();
            for subscribers in subscriptions.values_mut() {
                subscribers.remove(session_id);
            }
            subscriptions.retain(|_, subscribers| !subscribers.is_empty());
        }

        info!(
            "Session {} for principal {} unregistered",
            session.id, session.principal_id
        );
        Some(session)
    }

    /// Subscribes a session to a topic. False if the session is gone.
    pub fn subscribe(&self, session_id: &str, topic: Topic) -> bool {
        if !self.sessions.read().contains_key(session_id) {
            return false;
        }

        self.subscriptions
            .write()
            .entry(topic)
            .or_default()
            .insert(session_id.to_string());
        true
    }

    pub fn unsubscribe(&self, session_id: &str, topic: &Topic) -> bool {
        let mut subscriptions = self.subscriptions.write();
        let removed = subscriptions
            .get_mut(topic)
            .map(|subscribers| subscribers.remove(session_id))
            .unwrap_or(false);
        subscriptions.retain(|_, subscribers| !subscribers.is_empty());
        removed
    }

    /// Pushes a packet to every live subscriber of a topic. Returns the
    /// number of sessions it was queued for.
    pub fn deliver(&self, topic: &Topic, packet: &Packet) -> usize {
        let subscriber_ids: Vec<String> = {
            let subscriptions = self.subscriptions.read();
            match subscriptions.get(topic) {
                Some(subscribers) => subscribers.iter().cloned().collect(),
                None => return 0,
            }
        };

        let mut delivered = 0;
        let sessions = self.sessions.read();
        for session_id in subscriber_ids {
            // Disconnected between subscribe and deliver: skip silently.
            let Some(session) = sessions.get(&session_id) else {
                continue;
            };

            if self.push(session.addr, packet.clone()) {
                delivered += 1;
            }
        }

        delivered
    }

    /// Direct delivery to a principal's own session. Fails soft with
    /// [`EngineError::DeliveryTargetOffline`] when no live session
    /// exists; callers skip the delivery, they do not propagate this.
    pub fn deliver_to_principal(&self, principal_id: &str, packet: &Packet) -> Result<()> {
        match self.session_for_principal(principal_id) {
            Some(session) => {
                self.push(session.addr, packet.clone());
                Ok(())
            }
            None => Err(EngineError::DeliveryTargetOffline(
                principal_id.to_string(),
            )),
        }
    }

    fn push(&self, addr: SocketAddr, packet: Packet) -> bool {
        if let Err(e) = self.outbound.send(OutboundMessage { addr, packet }) {
            warn!("Failed to queue outbound packet for {}: {}", addr, e);
            return false;
        }
        true
    }

    pub fn session_for_principal(&self, principal_id: &str) -> Option<Session> {
        let session_id = self.by_principal.read().get(principal_id).cloned()?;
        self.sessions.read().get(&session_id).cloned()
    }

    pub fn find_by_addr(&self, addr: SocketAddr) -> Option<Session> {
        self.sessions
            .read()
            .values()
            .find(|s| s.addr == addr)
            .cloned()
    }

    /// Marks the session at `addr` as recently active.
    pub fn touch_addr(&self, addr: SocketAddr) {
        let mut sessions = self.sessions.write();
        if let Some(session) = sessions.values_mut().find(|s| s.addr == addr) {
            session.last_seen = Instant::now();
        }
    }

    /// Removes sessions idle for longer than `timeout` and returns them
    /// so the caller can run the offline transition.
    pub fn check_timeouts(&self, timeout: Duration) -> Vec<Session> {
        let timed_out: Vec<String> = {
            let sessions = self.sessions.read();
            sessions
                .values()
                .filter(|s| s.last_seen.elapsed() > timeout)
                .map(|s| s.id.clone())
                .collect()
        };

        timed_out
            .iter()
            .filter_map(|session_id| self.unregister(session_id))
            .collect()
    }

    pub fn role_of(&self, principal_id: &str) -> Option<String> {
        self.session_for_principal(principal_id)
            .map(|s| s.role)
    }

    /// Snapshot of every live principal's role, used by the proximity
    /// pair check.
    pub fn roles_snapshot(&self) -> HashMap<String, String> {
        self.sessions
            .read()
            .values()
            .map(|s| (s.principal_id.clone(), s.role.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}
