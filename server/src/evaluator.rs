//! Geofence membership evaluation.
//!
//! Two triggers share one algorithm: an event-driven pass when a single
//! principal reports a position, and a periodic sweep over all active
//! regions that catches changes no position report can signal (radius
//! edits, newly created regions, purged principals).
//!
//! The per-region membership snapshot is the evaluator's only state.
//! Each snapshot has its own mutex; the diff-and-replace step and the
//! append of the resulting events to the event log happen inside that
//! critical section, so the two triggers can never interleave a
//! read-modify-write and no snapshot update is observable without its
//! events having been queued.

use crate::events::EventLog;
use crate::location::PositionReader;
use log::warn;
use parking_lot::Mutex;
use shared::{
    now_millis, validate_coordinates, Position, Region, RegionEvent, RegionEventKind,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

type MemberSet = Arc<Mutex<HashSet<String>>>;

pub struct GeofenceEvaluator {
    positions: Arc<dyn PositionReader>,
    events: Arc<EventLog>,
    snapshots: Mutex<HashMap<String, MemberSet>>,
}

impl GeofenceEvaluator {
    pub fn new(positions: Arc<dyn PositionReader>, events: Arc<EventLog>) -> Self {
        Self {
            positions,
            events,
            snapshots: Mutex::new(HashMap::new()),
        }
    }

    fn snapshot_for(&self, region_id: &str) -> MemberSet {
        let mut snapshots = self.snapshots.lock();
        Arc::clone(
            snapshots
                .entry(region_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(HashSet::new()))),
        )
    }

    fn make_event(
        kind: RegionEventKind,
        region: &Region,
        principal_id: &str,
        position: Option<&Position>,
        timestamp: u64,
    ) -> RegionEvent {
        RegionEvent {
            kind,
            region_id: region.id.clone(),
            region_name: region.name.clone(),
            principal_id: principal_id.to_string(),
            coordinates: position.map(|p| p.coordinates),
            timestamp,
        }
    }

    /// Event-driven pass: recomputes this principal's membership against
    /// every active region in `regions`.
    ///
    /// Emits `entry`/`exit` on state change and a `location_update` for
    /// each region the principal currently occupies. A malformed position
    /// is logged and skipped without touching any snapshot.
    pub fn evaluate_position(&self, regions: &[Region], position: &Position) -> Vec<RegionEvent> {
        if !validate_coordinates(position.coordinates.latitude, position.coordinates.longitude) {
            warn!(
                "Skipping evaluation of malformed position for {}",
                position.principal_id
            );
            return Vec::new();
        }

        let now = now_millis();
        let mut emitted = Vec::new();

        for region in regions.iter().filter(|r| r.active) {
            let inside = region.contains(position.coordinates);
            let snapshot = self.snapshot_for(&region.id);

            let mut members = snapshot.lock();
            let was_inside = members.contains(&position.principal_id);

            let mut batch = Vec::new();
            if inside && !was_inside {
                members.insert(position.principal_id.clone());
                batch.push(Self::make_event(
                    RegionEventKind::Entry,
                    region,
                    &position.principal_id,
                    Some(position),
                    now,
                ));
            } else if !inside && was_inside {
                members.remove(&position.principal_id);
                batch.push(Self::make_event(
                    RegionEventKind::Exit,
                    region,
                    &position.principal_id,
                    Some(position),
                    now,
                ));
            }

            if inside {
                batch.push(Self::make_event(
                    RegionEventKind::LocationUpdate,
                    region,
                    &position.principal_id,
                    Some(position),
                    now,
                ));
            }

            // Queued while the snapshot lock is held: membership and
            // event emission stay in lockstep.
            self.events.record_all(&batch);
            drop(members);

            emitted.extend(batch);
        }

        emitted
    }

    /// Interval sweep: recomputes the full membership set of every
    /// active region from a point-in-time copy of all current positions
    /// and diffs it against the stored snapshot.
    ///
    /// A single malformed position or region never aborts the sweep.
    pub fn sweep(&self, regions: &[Region]) -> Vec<RegionEvent> {
        let positions = self.positions.all_current_positions();
        let now = now_millis();
        let mut emitted = Vec::new();

        let valid: Vec<&Position> = positions
            .iter()
            .filter(|p| {
                let ok =
                    validate_coordinates(p.coordinates.latitude, p.coordinates.longitude);
                if !ok {
                    warn!("Skipping malformed stored position for {}", p.principal_id);
                }
                ok
            })
            .collect();

        for region in regions.iter().filter(|r| r.active) {
            let mut new_members: HashSet<String> = HashSet::new();
            let mut by_principal: HashMap<&str, &Position> = HashMap::new();

            for position in &valid {
                if region.contains(position.coordinates) {
                    new_members.insert(position.principal_id.clone());
                    by_principal.insert(position.principal_id.as_str(), *position);
                }
            }

            let snapshot = self.snapshot_for(&region.id);
            let mut members = snapshot.lock();

            let mut batch = Vec::new();
            for principal_id in new_members.difference(&members) {
                batch.push(Self::make_event(
                    RegionEventKind::Entry,
                    region,
                    principal_id,
                    by_principal.get(principal_id.as_str()).copied(),
                    now,
                ));
            }
            for principal_id in members.difference(&new_members) {
                batch.push(Self::make_event(
                    RegionEventKind::Exit,
                    region,
                    principal_id,
                    None,
                    now,
                ));
            }

            *members = new_members;
            self.events.record_all(&batch);
            drop(members);

            emitted.extend(batch);
        }

        emitted
    }

    /// Current membership snapshot for a region. Empty if unknown.
    pub fn members(&self, region_id: &str) -> HashSet<String> {
        let snapshot = {
            let snapshots = self.snapshots.lock();
            snapshots.get(region_id).map(Arc::clone)
        };
        snapshot.map(|s| s.lock().clone()).unwrap_or_default()
    }

    /// Drops the membership snapshot for a deleted region so a reused id
    /// or pairing key starts clean.
    pub fn forget_region(&self, region_id: &str) {
        self.snapshots.lock().remove(region_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::LocationStore;
    use shared::Coordinates;

    const METERS_PER_DEGREE_LAT: f64 =
        shared::EARTH_RADIUS_METERS * std::f64::consts::PI / 180.0;

    fn position(principal_id: &str, lat: f64, lon: f64) -> Position {
        Position {
            principal_id: principal_id.to_string(),
            coordinates: Coordinates::new(lat, lon),
            accuracy: None,
            speed: None,
            heading: None,
            timestamp: shared::now_millis(),
        }
    }

    fn region(id: &str, lat: f64, lon: f64, radius: f64) -> Region {
        Region {
            id: id.to_string(),
            name: format!("region-{}", id),
            description: None,
            center: Coordinates::new(lat, lon),
            radius_meters: radius,
            owner_id: "owner".to_string(),
            active: true,
            pairing_key: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    fn evaluator() -> (Arc<LocationStore>, Arc<EventLog>, GeofenceEvaluator) {
        let store = Arc::new(LocationStore::new());
        let events = Arc::new(EventLog::new());
        let evaluator = GeofenceEvaluator::new(
            Arc::clone(&store) as Arc<dyn PositionReader>,
            Arc::clone(&events),
        );
        (store, events, evaluator)
    }

    fn kinds(events: &[RegionEvent]) -> Vec<RegionEventKind> {
        events.iter().map(|e| e.kind).collect()
    }

    #[test]
    fn test_first_position_inside_emits_entry_and_update() {
        let (_, _, evaluator) = evaluator();
        let regions = vec![region("r-1", 0.0, 0.0, 100.0)];

        let emitted = evaluator.evaluate_position(&regions, &position("p", 0.0, 0.0));
        assert_eq!(
            kinds(&emitted),
            vec![RegionEventKind::Entry, RegionEventKind::LocationUpdate]
        );
        assert!(evaluator.members("r-1").contains("p"));
    }

    #[test]
    fn test_second_position_inside_emits_only_update() {
        let (_, _, evaluator) = evaluator();
        let regions = vec![region("r-1", 0.0, 0.0, 100.0)];

        evaluator.evaluate_position(&regions, &position("p", 0.0, 0.0));
        let emitted = evaluator.evaluate_position(&regions, &position("p", 0.0001, 0.0));

        assert_eq!(kinds(&emitted), vec![RegionEventKind::LocationUpdate]);
    }

    #[test]
    fn test_idempotent_on_unchanged_position() {
        let (_, _, evaluator) = evaluator();
        let regions = vec![region("r-1", 0.0, 0.0, 100.0)];
        let pos = position("p", 0.0, 0.0);

        evaluator.evaluate_position(&regions, &pos);
        let second = evaluator.evaluate_position(&regions, &pos);

        // No entry/exit the second time.
        assert!(second
            .iter()
            .all(|e| e.kind == RegionEventKind::LocationUpdate));
    }

    #[test]
    fn test_leaving_emits_exit() {
        let (_, _, evaluator) = evaluator();
        let regions = vec![region("r-1", 0.0, 0.0, 100.0)];

        evaluator.evaluate_position(&regions, &position("p", 0.0, 0.0));
        let emitted = evaluator.evaluate_position(&regions, &position("p", 1.0, 1.0));

        assert_eq!(kinds(&emitted), vec![RegionEventKind::Exit]);
        assert!(!evaluator.members("r-1").contains("p"));
    }

    #[test]
    fn test_principal_can_occupy_multiple_regions() {
        let (_, _, evaluator) = evaluator();
        let regions = vec![
            region("r-1", 0.0, 0.0, 100.0),
            region("r-2", 0.0, 0.0, 500.0),
        ];

        let emitted = evaluator.evaluate_position(&regions, &position("p", 0.0, 0.0));
        let entries = emitted
            .iter()
            .filter(|e| e.kind == RegionEventKind::Entry)
            .count();
        assert_eq!(entries, 2);
        assert!(evaluator.members("r-1").contains("p"));
        assert!(evaluator.members("r-2").contains("p"));
    }

    #[test]
    fn test_inactive_region_skipped() {
        let (_, _, evaluator) = evaluator();
        let mut inactive = region("r-1", 0.0, 0.0, 100.0);
        inactive.active = false;

        let emitted = evaluator.evaluate_position(&[inactive], &position("p", 0.0, 0.0));
        assert!(emitted.is_empty());
        assert!(evaluator.members("r-1").is_empty());
    }

    #[test]
    fn test_malformed_position_skipped() {
        let (_, _, evaluator) = evaluator();
        let regions = vec![region("r-1", 0.0, 0.0, 100.0)];

        let emitted = evaluator.evaluate_position(&regions, &position("p", 91.0, 0.0));
        assert!(emitted.is_empty());
    }

    #[test]
    fn test_events_recorded_in_log() {
        let (_, events, evaluator) = evaluator();
        let regions = vec![region("r-1", 0.0, 0.0, 100.0)];

        evaluator.evaluate_position(&regions, &position("p", 0.0, 0.0));
        assert_eq!(events.recent(Some("r-1"), 10).len(), 2);
    }

    #[test]
    fn test_sweep_detects_entries_and_exits() {
        let (store, _, evaluator) = evaluator();
        let regions = vec![region("r-1", 0.0, 0.0, 100.0)];

        store
            .record_position(position("inside", 0.0, 0.0))
            .unwrap();
        store
            .record_position(position("outside", 1.0, 1.0))
            .unwrap();

        let emitted = evaluator.sweep(&regions);
        assert_eq!(kinds(&emitted), vec![RegionEventKind::Entry]);
        assert_eq!(emitted[0].principal_id, "inside");

        // Principal moves out; the next sweep sees the exit.
        store
            .record_position(position("inside", 2.0, 2.0))
            .unwrap();
        let emitted = evaluator.sweep(&regions);
        assert_eq!(kinds(&emitted), vec![RegionEventKind::Exit]);
    }

    #[test]
    fn test_sweep_idempotent_when_nothing_moves() {
        let (store, _, evaluator) = evaluator();
        let regions = vec![region("r-1", 0.0, 0.0, 100.0)];

        store.record_position(position("p", 0.0, 0.0)).unwrap();
        evaluator.sweep(&regions);
        let second = evaluator.sweep(&regions);
        assert!(second.is_empty());
    }

    #[test]
    fn test_sweep_picks_up_radius_change() {
        let (store, _, evaluator) = evaluator();

        // ~150 m north of the origin: outside a 100 m region.
        let offset = 150.0 / METERS_PER_DEGREE_LAT;
        store
            .record_position(position("p", offset, 0.0))
            .unwrap();

        let narrow = vec![region("r-1", 0.0, 0.0, 100.0)];
        assert!(evaluator.sweep(&narrow).is_empty());

        // Region radius grows; only the sweep can observe this.
        let wide = vec![region("r-1", 0.0, 0.0, 200.0)];
        let emitted = evaluator.sweep(&wide);
        assert_eq!(kinds(&emitted), vec![RegionEventKind::Entry]);
    }

    #[test]
    fn test_sweep_skips_inactive_regions() {
        let (store, _, evaluator) = evaluator();
        store.record_position(position("p", 0.0, 0.0)).unwrap();

        let mut inactive = region("r-1", 0.0, 0.0, 100.0);
        inactive.active = false;
        assert!(evaluator.sweep(&[inactive]).is_empty());
    }

    #[test]
    fn test_forget_region_clears_snapshot() {
        let (_, _, evaluator) = evaluator();
        let regions = vec![region("r-1", 0.0, 0.0, 100.0)];

        evaluator.evaluate_position(&regions, &position("p", 0.0, 0.0));
        assert!(!evaluator.members("r-1").is_empty());

        evaluator.forget_region("r-1");
        assert!(evaluator.members("r-1").is_empty());

        // A fresh region reusing the id starts clean: entry fires again.
        let emitted = evaluator.evaluate_position(&regions, &position("p", 0.0, 0.0));
        assert!(emitted
            .iter()
            .any(|e| e.kind == RegionEventKind::Entry));
    }
}
