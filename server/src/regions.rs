//! Registry of named circular geofences.
//!
//! Regions are owned by their creator; mutation by anyone else is
//! rejected without touching state. Deactivating a region only removes
//! it from the active set consulted by sweeps, its stored data survives.

use crate::error::{EngineError, Result};
use log::info;
use parking_lot::RwLock;
use shared::{
    now_millis, validate_coordinates, Coordinates, Region, DEFAULT_REGION_RADIUS_METERS,
};
use std::collections::HashMap;
use uuid::Uuid;

/// Creation parameters for a region. Radius falls back to
/// [`DEFAULT_REGION_RADIUS_METERS`] when not given.
#[derive(Debug, Clone)]
pub struct RegionSpec {
    pub name: String,
    pub description: Option<String>,
    pub center: Coordinates,
    pub radius_meters: Option<f64>,
    pub owner_id: String,
    pub pairing_key: Option<String>,
}

/// Partial update applied by [`GeofenceRegistry::update`]. Only the
/// provided fields are merged.
#[derive(Debug, Clone, Default)]
pub struct RegionPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub center: Option<Coordinates>,
    pub radius_meters: Option<f64>,
    pub active: Option<bool>,
}

pub struct GeofenceRegistry {
    regions: RwLock<HashMap<String, Region>>,
}

impl GeofenceRegistry {
    pub fn new() -> Self {
        Self {
            regions: RwLock::new(HashMap::new()),
        }
    }

    /// Creates a region with a fresh uuid, defaulted radius, and the
    /// active flag set.
    pub fn create(&self, spec: RegionSpec) -> Result<Region> {
        if !validate_coordinates(spec.center.latitude, spec.center.longitude) {
            return Err(EngineError::InvalidPosition(format!(
                "region center ({}, {}) out of range",
                spec.center.latitude, spec.center.longitude
            )));
        }

        let radius = spec.radius_meters.unwrap_or(DEFAULT_REGION_RADIUS_METERS);
        if !radius.is_finite() || radius <= 0.0 {
            return Err(EngineError::InvalidPosition(format!(
                "region radius {} must be positive",
                radius
            )));
        }

        let now = now_millis();
        let region = Region {
            id: Uuid::new_v4().to_string(),
            name: spec.name,
            description: spec.description,
            center: spec.center,
            radius_meters: radius,
            owner_id: spec.owner_id,
            active: true,
            pairing_key: spec.pairing_key,
            created_at: now,
            updated_at: now,
        };

        info!(
            "Created region {} ({}) radius {}m owner {}",
            region.id, region.name, region.radius_meters, region.owner_id
        );

        self.regions
            .write()
            .insert(region.id.clone(), region.clone());
        Ok(region)
    }

    /// Merges the provided fields into an existing region. Only the
    /// owner may update; `updated_at` is bumped on success.
    pub fn update(&self, region_id: &str, principal_id: &str, patch: RegionPatch) -> Result<Region> {
        let mut regions = self.regions.write();

        let region = regions
            .get_mut(region_id)
            .ok_or_else(|| EngineError::RegionNotFound(region_id.to_string()))?;

        if region.owner_id != principal_id {
            return Err(EngineError::Unauthorized {
                region_id: region_id.to_string(),
                principal_id: principal_id.to_string(),
            });
        }

        if let Some(center) = patch.center {
            if !validate_coordinates(center.latitude, center.longitude) {
                return Err(EngineError::InvalidPosition(format!(
                    "region center ({}, {}) out of range",
                    center.latitude, center.longitude
                )));
            }
            region.center = center;
        }
        if let Some(name) = patch.name {
            region.name = name;
        }
        if let Some(description) = patch.description {
            region.description = Some(description);
        }
        if let Some(radius) = patch.radius_meters {
            if !radius.is_finite() || radius <= 0.0 {
                return Err(EngineError::InvalidPosition(format!(
                    "region radius {} must be positive",
                    radius
                )));
            }
            region.radius_meters = radius;
        }
        if let Some(active) = patch.active {
            if region.active != active {
                info!(
                    "Region {} {}",
                    region.id,
                    if active { "activated" } else { "deactivated" }
                );
            }
            region.active = active;
        }

        region.updated_at = now_millis();
        Ok(region.clone())
    }

    /// Removes a region. The caller is responsible for cascading the
    /// cleanup of the membership snapshot and alert-sent markers; the
    /// removed region is returned to drive that.
    pub fn delete(&self, region_id: &str, principal_id: &str) -> Result<Region> {
        let mut regions = self.regions.write();

        match regions.get(region_id) {
            Some(region) if region.owner_id != principal_id => {
                return Err(EngineError::Unauthorized {
                    region_id: region_id.to_string(),
                    principal_id: principal_id.to_string(),
                });
            }
            Some(_) => {}
            None => return Err(EngineError::RegionNotFound(region_id.to_string())),
        }

        let removed = regions
            .remove(region_id)
            .ok_or_else(|| EngineError::RegionNotFound(region_id.to_string()))?;
        info!("Deleted region {} ({})", removed.id, removed.name);
        Ok(removed)
    }

    pub fn get(&self, region_id: &str) -> Option<Region> {
        self.regions.read().get(region_id).cloned()
    }

    pub fn list_by_owner(&self, owner_id: &str) -> Vec<Region> {
        self.regions
            .read()
            .values()
            .filter(|r| r.owner_id == owner_id)
            .cloned()
            .collect()
    }

    /// Snapshot of every active region, consulted by evaluation passes.
    pub fn list_active(&self) -> Vec<Region> {
        self.regions
            .read()
            .values()
            .filter(|r| r.active)
            .cloned()
            .collect()
    }

    pub fn list_by_pairing_key(&self, pairing_key: &str) -> Vec<Region> {
        self.regions
            .read()
            .values()
            .filter(|r| r.pairing_key.as_deref() == Some(pairing_key))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.regions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.read().is_empty()
    }
}

impl Default for GeofenceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
