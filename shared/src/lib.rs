//! Wire protocol and domain types shared between the geofence server and
//! its transport clients: coordinates, positions, regions, region events,
//! the bincode-serialized packet enum, and the spatial math used for
//! point-in-circle membership checks.

use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Mean Earth radius in meters, used by the haversine distance.
pub const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

/// Radius applied to a region when the creator does not specify one.
pub const DEFAULT_REGION_RADIUS_METERS: f64 = 90.0;

/// Maximum number of history entries retained per principal.
pub const MAX_HISTORY_ENTRIES: usize = 100;

/// Capacity of the process-wide region event ring.
pub const EVENT_LOG_CAPACITY: usize = 1000;

/// Current timestamp in milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}

/// A WGS84 latitude/longitude pair in decimal degrees.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }
}

/// Returns true iff the pair is a well-formed coordinate:
/// latitude in [-90, 90], longitude in [-180, 180], both finite.
pub fn validate_coordinates(latitude: f64, longitude: f64) -> bool {
    latitude.is_finite()
        && longitude.is_finite()
        && (-90.0..=90.0).contains(&latitude)
        && (-180.0..=180.0).contains(&longitude)
}

/// Great-circle distance between two coordinates in meters (haversine).
pub fn distance_meters(a: Coordinates, b: Coordinates) -> f64 {
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let dlat = (b.latitude - a.latitude).to_radians();
    let dlon = (b.longitude - a.longitude).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);

    2.0 * EARTH_RADIUS_METERS * h.sqrt().asin()
}

/// Returns true iff `point` lies within `radius_meters` of `center`.
/// The boundary is inclusive.
pub fn is_inside(point: Coordinates, center: Coordinates, radius_meters: f64) -> bool {
    distance_meters(point, center) <= radius_meters
}

/// A recorded position report for one principal. Immutable once stored;
/// newer reports supersede it rather than mutating it.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Position {
    pub principal_id: String,
    pub coordinates: Coordinates,
    pub accuracy: Option<f64>,
    pub speed: Option<f64>,
    pub heading: Option<f64>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
}

/// A named circular geofence owned by its creator.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Region {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub center: Coordinates,
    pub radius_meters: f64,
    pub owner_id: String,
    pub active: bool,
    /// Scopes proximity matching to one logical transaction (e.g. a job).
    pub pairing_key: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Region {
    /// Membership test against this region's circle.
    pub fn contains(&self, point: Coordinates) -> bool {
        is_inside(point, self.center, self.radius_meters)
    }
}

/// Kind of region event produced by an evaluation pass.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum RegionEventKind {
    Entry,
    Exit,
    LocationUpdate,
}

/// Write-once record of a principal's relation to a region at one
/// evaluation instant.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RegionEvent {
    pub kind: RegionEventKind,
    pub region_id: String,
    pub region_name: String,
    pub principal_id: String,
    pub coordinates: Option<Coordinates>,
    pub timestamp: u64,
}

/// Presence marker for a principal, driven by session lifecycle and
/// position submissions.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum PresenceStatus {
    Unknown,
    Online,
    Offline,
    Busy,
    Away,
}

/// Asset/context record attached to a proximity alert when the external
/// enrichment lookup answers in time. Absent on timeout or error.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct EnrichmentContext {
    pub pairing_key: String,
    pub label: Option<String>,
    pub vehicle: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub enum Packet {
    // Client -> server
    Connect {
        principal_id: String,
        role: String,
        display_name: Option<String>,
        client_version: u32,
    },
    SubmitPosition {
        latitude: f64,
        longitude: f64,
        accuracy: Option<f64>,
        speed: Option<f64>,
        heading: Option<f64>,
        /// Milliseconds since the Unix epoch; server time when omitted.
        timestamp: Option<u64>,
    },
    CreateRegion {
        name: String,
        description: Option<String>,
        latitude: f64,
        longitude: f64,
        radius_meters: Option<f64>,
        pairing_key: Option<String>,
    },
    UpdateRegion {
        region_id: String,
        name: Option<String>,
        description: Option<String>,
        radius_meters: Option<f64>,
        active: Option<bool>,
    },
    DeleteRegion {
        region_id: String,
    },
    ListRegions,
    QueryEvents {
        region_id: Option<String>,
        limit: usize,
    },
    Subscribe {
        principal_id: String,
        pairing_key: String,
    },
    Unsubscribe {
        principal_id: String,
        pairing_key: String,
    },
    Disconnect,

    // Server -> client
    ConnectionAck {
        principal_id: String,
    },
    PositionStored {
        position: Position,
    },
    RegionCreated {
        region: Region,
    },
    RegionUpdated {
        region: Region,
    },
    RegionDeleted {
        region_id: String,
    },
    Regions {
        regions: Vec<Region>,
    },
    Events {
        events: Vec<RegionEvent>,
    },
    LocationUpdate {
        events: Vec<RegionEvent>,
    },
    ProximityAlert {
        region_id: String,
        pairing_key: String,
        enrichment: Option<EnrichmentContext>,
        timestamp: u64,
    },
    Error {
        message: String,
    },
}
