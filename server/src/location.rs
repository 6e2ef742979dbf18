//! In-memory store of each principal's most recent position and a
//! bounded movement history.
//!
//! Writers for different principals never block each other: the outer
//! map lock is only held long enough to fetch or create the per-principal
//! entry, and each entry is serialized by its own mutex. Out-of-order
//! submissions are resolved by timestamp, so the newest report wins the
//! "current" slot regardless of arrival order.

use crate::error::{EngineError, Result};
use log::debug;
use parking_lot::{Mutex, RwLock};
use shared::{validate_coordinates, Position, PresenceStatus, MAX_HISTORY_ENTRIES};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// Narrow read capability consumed by the geofence evaluator. Keeps the
/// evaluator structurally independent of the full store.
pub trait PositionReader: Send + Sync {
    /// Latest known position for one principal.
    fn current_position(&self, principal_id: &str) -> Option<Position>;

    /// Point-in-time copy of every principal's latest position.
    fn all_current_positions(&self) -> Vec<Position>;
}

#[derive(Debug)]
struct PrincipalTrack {
    current: Position,
    history: VecDeque<Position>,
}

/// Thread-safe location store with per-principal fine-grained locking.
pub struct LocationStore {
    tracks: RwLock<HashMap<String, Arc<Mutex<PrincipalTrack>>>>,
    statuses: RwLock<HashMap<String, PresenceStatus>>,
}

impl LocationStore {
    pub fn new() -> Self {
        Self {
            tracks: RwLock::new(HashMap::new()),
            statuses: RwLock::new(HashMap::new()),
        }
    }

    fn validate(position: &Position) -> Result<()> {
        if !validate_coordinates(position.coordinates.latitude, position.coordinates.longitude) {
            return Err(EngineError::InvalidPosition(format!(
                "coordinates ({}, {}) out of range",
                position.coordinates.latitude, position.coordinates.longitude
            )));
        }

        if let Some(accuracy) = position.accuracy {
            if !accuracy.is_finite() || accuracy < 0.0 {
                return Err(EngineError::InvalidPosition(format!(
                    "accuracy {} must be non-negative",
                    accuracy
                )));
            }
        }

        Ok(())
    }

    /// Validates and records a position report.
    ///
    /// The report is appended to the principal's bounded history (oldest
    /// dropped first) and replaces the current position unless an
    /// already-stored report carries a newer timestamp. Recording marks
    /// the principal online. Returns the current position after the
    /// merge, which is the submitted report unless a newer one already
    /// won the slot; downstream evaluation must use this, not the raw
    /// submission.
    pub fn record_position(&self, position: Position) -> Result<Position> {
        Self::validate(&position)?;

        let track = {
            let mut tracks = self.tracks.write();
            Arc::clone(
                tracks
                    .entry(position.principal_id.clone())
                    .or_insert_with(|| {
                        Arc::new(Mutex::new(PrincipalTrack {
                            current: position.clone(),
                            history: VecDeque::new(),
                        }))
                    }),
            )
        };

        let current = {
            let mut track = track.lock();

            if position.timestamp >= track.current.timestamp {
                track.current = position.clone();
            } else {
                debug!(
                    "Keeping newer position for {} ({} > {})",
                    position.principal_id, track.current.timestamp, position.timestamp
                );
            }

            track.history.push_back(position.clone());
            while track.history.len() > MAX_HISTORY_ENTRIES {
                track.history.pop_front();
            }

            track.current.clone()
        };

        self.set_status(&position.principal_id, PresenceStatus::Online);
        Ok(current)
    }

    /// Latest position for a principal, or None if never seen.
    pub fn current_position(&self, principal_id: &str) -> Option<Position> {
        let track = {
            let tracks = self.tracks.read();
            tracks.get(principal_id).map(Arc::clone)
        };
        track.map(|t| t.lock().current.clone())
    }

    /// Point-in-time snapshot of every principal's latest position, used
    /// by the evaluator's periodic sweep.
    pub fn all_current_positions(&self) -> Vec<Position> {
        let tracks: Vec<Arc<Mutex<PrincipalTrack>>> = {
            let guard = self.tracks.read();
            guard.values().map(Arc::clone).collect()
        };

        tracks.iter().map(|t| t.lock().current.clone()).collect()
    }

    /// The most recent `limit` history entries for a principal, newest
    /// last. Empty if the principal is unknown.
    pub fn history(&self, principal_id: &str, limit: usize) -> Vec<Position> {
        let track = {
            let tracks = self.tracks.read();
            tracks.get(principal_id).map(Arc::clone)
        };

        match track {
            Some(track) => {
                let track = track.lock();
                let skip = track.history.len().saturating_sub(limit);
                track.history.iter().skip(skip).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    pub fn set_status(&self, principal_id: &str, status: PresenceStatus) {
        self.statuses
            .write()
            .insert(principal_id.to_string(), status);
    }

    /// Presence status for a principal; Unknown if never set.
    pub fn status(&self, principal_id: &str) -> PresenceStatus {
        self.statuses
            .read()
            .get(principal_id)
            .copied()
            .unwrap_or(PresenceStatus::Unknown)
    }

    /// Drops history entries older than `cutoff_millis` and forgets
    /// principals whose latest report is itself older than the cutoff.
    /// Advisory housekeeping; returns the number of entries removed.
    pub fn purge_older_than(&self, cutoff_millis: u64) -> usize {
        let mut removed = 0;

        let entries: Vec<(String, Arc<Mutex<PrincipalTrack>>)> = {
            let tracks = self.tracks.read();
            tracks
                .iter()
                .map(|(id, track)| (id.clone(), Arc::clone(track)))
                .collect()
        };

        let mut stale_principals = Vec::new();
        for (principal_id, track) in entries {
            let mut track = track.lock();
            let before = track.history.len();
            track.history.retain(|p| p.timestamp >= cutoff_millis);
            removed += before - track.history.len();

            if track.current.timestamp < cutoff_millis {
                stale_principals.push(principal_id);
            }
        }

        if !stale_principals.is_empty() {
            let mut tracks = self.tracks.write();
            for principal_id in &stale_principals {
                tracks.remove(principal_id);
                removed += 1;
            }
            debug!("Purged {} stale principals", stale_principals.len());
        }

        removed
    }

    /// Number of principals with at least one recorded position.
    pub fn len(&self) -> usize {
        self.tracks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.read().is_empty()
    }
}

impl Default for LocationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PositionReader for LocationStore {
    fn current_position(&self, principal_id: &str) -> Option<Position> {
        LocationStore::current_position(self, principal_id)
    }

    fn all_current_positions(&self) -> Vec<Position> {
        LocationStore::all_current_positions(self)
    }
}
