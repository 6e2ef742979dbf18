//! Error taxonomy for the geofence engine.
//!
//! Validation failures surface synchronously to the submitter; soft
//! failures (enrichment, delivery) are logged and never abort the
//! evaluation pipeline.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Coordinates outside [-90, 90] / [-180, 180], or a negative
    /// accuracy. Rejected at the boundary, never stored.
    #[error("invalid position: {0}")]
    InvalidPosition(String),

    /// Stale or unknown region id reference.
    #[error("region not found: {0}")]
    RegionNotFound(String),

    /// Region mutation attempted by a principal that does not own it.
    #[error("principal {principal_id} is not the owner of region {region_id}")]
    Unauthorized {
        region_id: String,
        principal_id: String,
    },

    /// Enrichment lookup timed out or failed. Soft: the alert is still
    /// delivered without an enrichment payload.
    #[error("enrichment unavailable for pairing key {0}")]
    EnrichmentUnavailable(String),

    /// Delivery target has no live session. Soft: delivery is skipped.
    #[error("no live session for principal {0}")]
    DeliveryTargetOffline(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
