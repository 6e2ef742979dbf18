//! Orchestrating façade over the engine services.
//!
//! The transport hands every decoded inbound command to one of these
//! methods on its single packet loop; because that loop is sequential,
//! events derived from one principal's updates are delivered in
//! submission order. The dispatcher drives the evaluator, the proximity
//! watcher, and the connection registry, and owns the cascade cleanup
//! on region deletion.

use crate::connections::{ConnectionRegistry, Session, Topic};
use crate::enrichment::EnrichmentClient;
use crate::error::Result;
use crate::evaluator::GeofenceEvaluator;
use crate::events::EventLog;
use crate::location::{LocationStore, PositionReader};
use crate::proximity::{ProximityWatcher, RolePair};
use crate::regions::{GeofenceRegistry, RegionPatch, RegionSpec};
use log::{debug, info};
use shared::{
    now_millis, Coordinates, Packet, Position, PresenceStatus, Region, RegionEvent,
};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

/// History and event entries older than this are dropped by the
/// housekeeping pass that runs with the periodic sweep.
const RETENTION_MILLIS: u64 = 24 * 60 * 60 * 1000;

pub struct Dispatcher {
    locations: Arc<LocationStore>,
    regions: Arc<GeofenceRegistry>,
    events: Arc<EventLog>,
    evaluator: GeofenceEvaluator,
    proximity: ProximityWatcher,
    connections: Arc<ConnectionRegistry>,
    enrichment: Option<Arc<EnrichmentClient>>,
}

impl Dispatcher {
    pub fn new(
        connections: Arc<ConnectionRegistry>,
        roles: RolePair,
        enrichment: Option<Arc<EnrichmentClient>>,
    ) -> Self {
        let locations = Arc::new(LocationStore::new());
        let events = Arc::new(EventLog::new());
        let evaluator = GeofenceEvaluator::new(
            Arc::clone(&locations) as Arc<dyn PositionReader>,
            Arc::clone(&events),
        );

        Self {
            locations,
            regions: Arc::new(GeofenceRegistry::new()),
            events,
            evaluator,
            proximity: ProximityWatcher::new(roles),
            connections,
            enrichment,
        }
    }

    pub fn locations(&self) -> &LocationStore {
        &self.locations
    }

    pub fn connections(&self) -> &ConnectionRegistry {
        &self.connections
    }

    /// Opens a session for a principal and acknowledges it.
    pub fn register_session(
        &self,
        principal_id: &str,
        role: &str,
        display_name: Option<String>,
        addr: SocketAddr,
    ) -> Session {
        let session = self
            .connections
            .register(principal_id, role, display_name, addr);

        if let Err(e) = self.connections.deliver_to_principal(
            principal_id,
            &Packet::ConnectionAck {
                principal_id: principal_id.to_string(),
            },
        ) {
            debug!("Connection ack for {} not delivered: {}", principal_id, e);
        }

        session
    }

    /// Closes a session and transitions the principal offline. The last
    /// known position and region memberships stay; they age out through
    /// the regular retention bounds.
    pub fn unregister_session(&self, session_id: &str) -> Option<Session> {
        let session = self.connections.unregister(session_id)?;
        self.locations
            .set_status(&session.principal_id, PresenceStatus::Offline);
        Some(session)
    }

    /// Offline transition for a session the timeout checker already
    /// removed.
    pub fn session_expired(&self, session: &Session) {
        info!(
            "Session for principal {} timed out",
            session.principal_id
        );
        self.locations
            .set_status(&session.principal_id, PresenceStatus::Offline);
    }

    /// Records a position report and runs the event-driven evaluation
    /// across all active regions, fanning out the resulting events and
    /// any due proximity alert.
    pub fn submit_position(
        &self,
        principal_id: &str,
        latitude: f64,
        longitude: f64,
        accuracy: Option<f64>,
        speed: Option<f64>,
        heading: Option<f64>,
        timestamp: Option<u64>,
    ) -> Result<Position> {
        let position = Position {
            principal_id: principal_id.to_string(),
            coordinates: Coordinates::new(latitude, longitude),
            accuracy,
            speed,
            heading,
            timestamp: timestamp.unwrap_or_else(now_millis),
        };

        let stored = self.locations.record_position(position)?;

        let active = self.regions.list_active();
        let emitted = self.evaluator.evaluate_position(&active, &stored);

        self.fan_out(&emitted, &active);
        self.run_proximity(&emitted, &active, Some(principal_id));

        Ok(stored)
    }

    pub fn create_region(&self, spec: RegionSpec) -> Result<Region> {
        self.regions.create(spec)
    }

    pub fn update_region(
        &self,
        region_id: &str,
        principal_id: &str,
        patch: RegionPatch,
    ) -> Result<Region> {
        self.regions.update(region_id, principal_id, patch)
    }

    /// Deletes a region and cascades the cleanup of its membership
    /// snapshot and alert-sent markers.
    pub fn delete_region(&self, region_id: &str, principal_id: &str) -> Result<Region> {
        let removed = self.regions.delete(region_id, principal_id)?;
        self.evaluator.forget_region(region_id);
        self.proximity.forget_region(region_id);
        Ok(removed)
    }

    pub fn list_regions_for_owner(&self, owner_id: &str) -> Vec<Region> {
        self.regions.list_by_owner(owner_id)
    }

    pub fn region_events(&self, region_id: Option<&str>, limit: usize) -> Vec<RegionEvent> {
        self.events.recent(region_id, limit)
    }

    pub fn subscribe(&self, session_id: &str, principal_id: &str, pairing_key: &str) -> bool {
        self.connections
            .subscribe(session_id, Topic::new(principal_id, pairing_key))
    }

    pub fn unsubscribe(&self, session_id: &str, principal_id: &str, pairing_key: &str) -> bool {
        self.connections
            .unsubscribe(session_id, &Topic::new(principal_id, pairing_key))
    }

    /// Periodic pass: sweeps every active region against all current
    /// positions and runs retention housekeeping.
    pub fn sweep(&self) {
        let active = self.regions.list_active();
        let emitted = self.evaluator.sweep(&active);

        if !emitted.is_empty() {
            debug!("Sweep produced {} events", emitted.len());
        }

        self.fan_out(&emitted, &active);
        self.run_proximity(&emitted, &active, None);

        let cutoff = now_millis().saturating_sub(RETENTION_MILLIS);
        let purged = self.locations.purge_older_than(cutoff);
        if purged > 0 {
            debug!("Retention purge removed {} entries", purged);
        }
    }

    /// Groups events per (principal, pairing context) topic and pushes
    /// one location_update packet per topic. Regions without a pairing
    /// key have no subscribable topic.
    fn fan_out(&self, emitted: &[RegionEvent], active: &[Region]) {
        if emitted.is_empty() {
            return;
        }

        let pairing_keys: HashMap<&str, &str> = active
            .iter()
            .filter_map(|r| {
                r.pairing_key
                    .as_deref()
                    .map(|key| (r.id.as_str(), key))
            })
            .collect();

        let mut by_topic: HashMap<Topic, Vec<RegionEvent>> = HashMap::new();
        for event in emitted {
            if let Some(key) = pairing_keys.get(event.region_id.as_str()) {
                by_topic
                    .entry(Topic::new(&event.principal_id, key))
                    .or_default()
                    .push(event.clone());
            }
        }

        for (topic, events) in by_topic {
            self.connections
                .deliver(&topic, &Packet::LocationUpdate { events });
        }
    }

    /// Runs the proximity pair check for every pairing-key region the
    /// batch touched. For the event-driven path the triggering principal
    /// is the submitter; for sweeps each event's principal is its own
    /// trigger.
    fn run_proximity(
        &self,
        emitted: &[RegionEvent],
        active: &[Region],
        triggering: Option<&str>,
    ) {
        if emitted.is_empty() {
            return;
        }

        let touched: HashSet<&str> = emitted.iter().map(|e| e.region_id.as_str()).collect();
        let roles = self.connections.roles_snapshot();

        for region in active
            .iter()
            .filter(|r| r.pairing_key.is_some() && touched.contains(r.id.as_str()))
        {
            let members = self.evaluator.members(&region.id);

            let triggers: Vec<&str> = match triggering {
                Some(principal) => vec![principal],
                None => {
                    let mut principals: Vec<&str> = emitted
                        .iter()
                        .filter(|e| e.region_id == region.id)
                        .map(|e| e.principal_id.as_str())
                        .collect();
                    principals.sort_unstable();
                    principals.dedup();
                    principals
                }
            };

            for principal in triggers {
                if self
                    .proximity
                    .should_alert(region, &members, &roles, principal)
                {
                    self.emit_alert(region, principal);
                }
            }
        }
    }

    /// Delivers a proximity alert to the triggering principal's own
    /// session. With an enrichment backend configured, the lookup and
    /// the delivery run on a detached task so no engine lock spans the
    /// await; enrichment failure still delivers the alert, just without
    /// a payload.
    fn emit_alert(&self, region: &Region, principal_id: &str) {
        let Some(pairing_key) = region.pairing_key.clone() else {
            return;
        };

        info!(
            "Proximity alert for {} in region {} (pairing {})",
            principal_id, region.id, pairing_key
        );

        match &self.enrichment {
            None => {
                if let Err(e) = self.connections.deliver_to_principal(
                    principal_id,
                    &Packet::ProximityAlert {
                        region_id: region.id.clone(),
                        pairing_key,
                        enrichment: None,
                        timestamp: now_millis(),
                    },
                ) {
                    debug!("Proximity alert for {} skipped: {}", principal_id, e);
                }
            }
            Some(client) => {
                let client = Arc::clone(client);
                let connections = Arc::clone(&self.connections);
                let region_id = region.id.clone();
                let principal_id = principal_id.to_string();

                tokio::spawn(async move {
                    // Enrichment failure still delivers the alert, just
                    // without a payload.
                    let enrichment = client.lookup(&pairing_key).await.ok();
                    if let Err(e) = connections.deliver_to_principal(
                        &principal_id,
                        &Packet::ProximityAlert {
                            region_id,
                            pairing_key,
                            enrichment,
                            timestamp: now_millis(),
                        },
                    ) {
                        debug!("Proximity alert for {} skipped: {}", principal_id, e);
                    }
                });
            }
        }
    }
}
