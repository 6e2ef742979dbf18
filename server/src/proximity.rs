//! Proximity alert deduplication.
//!
//! A region carrying a pairing key represents one logical transaction
//! (a job, a ticket). When its membership contains at least one session
//! of each required role, each member is owed exactly one alert until
//! the pair condition becomes false again; re-entry after that fires a
//! fresh alert.

use log::debug;
use parking_lot::Mutex;
use shared::Region;
use std::collections::{HashMap, HashSet};

/// The two roles whose joint presence inside a region triggers an alert.
#[derive(Debug, Clone)]
pub struct RolePair {
    pub role_a: String,
    pub role_b: String,
}

impl RolePair {
    pub fn new(role_a: &str, role_b: &str) -> Self {
        Self {
            role_a: role_a.to_string(),
            role_b: role_b.to_string(),
        }
    }
}

pub struct ProximityWatcher {
    roles: RolePair,
    /// Per-region set of principals already alerted in the current
    /// pair-present episode.
    alerted: Mutex<HashMap<String, HashSet<String>>>,
}

impl ProximityWatcher {
    pub fn new(roles: RolePair) -> Self {
        Self {
            roles,
            alerted: Mutex::new(HashMap::new()),
        }
    }

    fn pair_present(
        &self,
        members: &HashSet<String>,
        roles_of: &HashMap<String, String>,
    ) -> bool {
        let mut has_a = false;
        let mut has_b = false;

        for member in members {
            match roles_of.get(member) {
                Some(role) if *role == self.roles.role_a => has_a = true,
                Some(role) if *role == self.roles.role_b => has_b = true,
                _ => {}
            }
            if has_a && has_b {
                return true;
            }
        }

        false
    }

    /// Decides whether a proximity alert should be delivered to
    /// `triggering` for `region`, given the region's current membership
    /// and the role of each live principal.
    ///
    /// Called after every membership change for the region; this is also
    /// where the alert-sent marker is cleared once the pair condition
    /// stops holding.
    pub fn should_alert(
        &self,
        region: &Region,
        members: &HashSet<String>,
        roles_of: &HashMap<String, String>,
        triggering: &str,
    ) -> bool {
        if region.pairing_key.is_none() {
            return false;
        }

        let mut alerted = self.alerted.lock();

        if !self.pair_present(members, roles_of) {
            // Pair-absent transition: reset so a future re-entry
            // re-fires for everyone.
            if alerted.remove(&region.id).is_some() {
                debug!("Pair no longer present in region {}, alert state reset", region.id);
            }
            return false;
        }

        if !members.contains(triggering) {
            return false;
        }

        alerted
            .entry(region.id.clone())
            .or_default()
            .insert(triggering.to_string())
    }

    /// Drops the alert markers for a deleted region so a new region
    /// reusing its pairing key starts with a clean alert state.
    pub fn forget_region(&self, region_id: &str) {
        self.alerted.lock().remove(region_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::Coordinates;

    fn region(id: &str, pairing_key: Option<&str>) -> Region {
        Region {
            id: id.to_string(),
            name: format!("region-{}", id),
            description: None,
            center: Coordinates::new(0.0, 0.0),
            radius_meters: 100.0,
            owner_id: "owner".to_string(),
            active: true,
            pairing_key: pairing_key.map(|k| k.to_string()),
            created_at: 0,
            updated_at: 0,
        }
    }

    fn watcher() -> ProximityWatcher {
        ProximityWatcher::new(RolePair::new("customer", "technician"))
    }

    fn roles(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(p, r)| (p.to_string(), r.to_string()))
            .collect()
    }

    fn members(ids: &[&str]) -> HashSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_no_pairing_key_never_alerts() {
        let watcher = watcher();
        let region = region("r-1", None);
        let roles = roles(&[("a", "customer"), ("b", "technician")]);

        assert!(!watcher.should_alert(&region, &members(&["a", "b"]), &roles, "a"));
    }

    #[test]
    fn test_single_role_not_enough() {
        let watcher = watcher();
        let region = region("r-1", Some("job-1"));
        let roles = roles(&[("a", "customer"), ("b", "customer")]);

        assert!(!watcher.should_alert(&region, &members(&["a", "b"]), &roles, "a"));
    }

    #[test]
    fn test_both_roles_alert_each_member_once() {
        let watcher = watcher();
        let region = region("r-1", Some("job-1"));
        let roles = roles(&[("a", "customer"), ("b", "technician")]);
        let inside = members(&["a", "b"]);

        assert!(watcher.should_alert(&region, &inside, &roles, "a"));
        assert!(watcher.should_alert(&region, &inside, &roles, "b"));

        // Repeated updates while the pair holds: no re-fire.
        assert!(!watcher.should_alert(&region, &inside, &roles, "a"));
        assert!(!watcher.should_alert(&region, &inside, &roles, "b"));
    }

    #[test]
    fn test_triggering_principal_must_be_member() {
        let watcher = watcher();
        let region = region("r-1", Some("job-1"));
        let roles = roles(&[("a", "customer"), ("b", "technician"), ("c", "customer")]);

        assert!(!watcher.should_alert(&region, &members(&["a", "b"]), &roles, "c"));
    }

    #[test]
    fn test_reentry_after_pair_absent_refires() {
        let watcher = watcher();
        let region = region("r-1", Some("job-1"));
        let roles = roles(&[("a", "customer"), ("b", "technician")]);

        assert!(watcher.should_alert(&region, &members(&["a", "b"]), &roles, "a"));

        // "a" leaves: pair condition false, marker cleared.
        assert!(!watcher.should_alert(&region, &members(&["b"]), &roles, "b"));

        // "a" re-enters: fresh episode, alert fires again.
        assert!(watcher.should_alert(&region, &members(&["a", "b"]), &roles, "a"));
        assert!(watcher.should_alert(&region, &members(&["a", "b"]), &roles, "b"));
    }

    #[test]
    fn test_offline_members_have_no_role() {
        let watcher = watcher();
        let region = region("r-1", Some("job-1"));
        // "b" has no live session, so no role is known for it.
        let roles = roles(&[("a", "customer")]);

        assert!(!watcher.should_alert(&region, &members(&["a", "b"]), &roles, "a"));
    }

    #[test]
    fn test_forget_region_resets_state() {
        let watcher = watcher();
        let region = region("r-1", Some("job-1"));
        let roles = roles(&[("a", "customer"), ("b", "technician")]);
        let inside = members(&["a", "b"]);

        assert!(watcher.should_alert(&region, &inside, &roles, "a"));
        watcher.forget_region("r-1");
        assert!(watcher.should_alert(&region, &inside, &roles, "a"));
    }

    #[test]
    fn test_regions_tracked_independently() {
        let watcher = watcher();
        let r1 = region("r-1", Some("job-1"));
        let r2 = region("r-2", Some("job-2"));
        let roles = roles(&[("a", "customer"), ("b", "technician")]);
        let inside = members(&["a", "b"]);

        assert!(watcher.should_alert(&r1, &inside, &roles, "a"));
        assert!(watcher.should_alert(&r2, &inside, &roles, "a"));
        assert!(!watcher.should_alert(&r1, &inside, &roles, "a"));
    }
}
