//! Best-effort alert enrichment from an external context backend.
//!
//! The lookup runs under a hard timeout and any failure (timeout,
//! connection error, non-2xx, bad body) degrades to "no enrichment".
//! It must never block or fail the alert delivery path.

use crate::error::{EngineError, Result};
use log::warn;
use shared::EnrichmentContext;
use std::time::Duration;
use tokio::time::timeout;

pub const DEFAULT_ENRICHMENT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct EnrichmentClient {
    base_url: String,
    http: reqwest::Client,
    timeout: Duration,
}

impl EnrichmentClient {
    pub fn new(base_url: &str) -> Self {
        Self::with_timeout(base_url, DEFAULT_ENRICHMENT_TIMEOUT)
    }

    pub fn with_timeout(base_url: &str, timeout: Duration) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
            timeout,
        }
    }

    /// Fetches the asset/context record for a pairing key. Any timeout,
    /// transport error, non-2xx answer or unreadable body fails soft
    /// with [`EngineError::EnrichmentUnavailable`]; the caller attaches
    /// whatever comes back to the alert as-is.
    pub async fn lookup(&self, pairing_key: &str) -> Result<EnrichmentContext> {
        let url = format!("{}/context/{}", self.base_url, pairing_key);
        let unavailable = || EngineError::EnrichmentUnavailable(pairing_key.to_string());

        let response = match timeout(self.timeout, self.http.get(&url).send()).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                warn!("Enrichment request for {} failed: {}", pairing_key, e);
                return Err(unavailable());
            }
            Err(_) => {
                warn!(
                    "Enrichment request for {} timed out after {:?}",
                    pairing_key, self.timeout
                );
                return Err(unavailable());
            }
        };

        if !response.status().is_success() {
            warn!(
                "Enrichment backend answered {} for {}",
                response.status(),
                pairing_key
            );
            return Err(unavailable());
        }

        match timeout(self.timeout, response.json::<EnrichmentContext>()).await {
            Ok(Ok(context)) => Ok(context),
            Ok(Err(e)) => {
                warn!("Enrichment body for {} unreadable: {}", pairing_key, e);
                Err(unavailable())
            }
            Err(_) => {
                warn!("Enrichment body read for {} timed out", pairing_key);
                Err(unavailable())
            }
        }
    }
}
