use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::debug;

use crate::fetch::Fetcher;

/// Nominatim asks for at most one request per second per client.
const RATE_LIMIT_WINDOW_MS: u64 = 1100;

#[derive(Debug, Clone)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
    pub country_code: Option<String>,
}

/// Free-text → coordinates lookup. The pipeline only depends on this
/// contract; tests substitute a table-backed fake.
#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn geocode(&self, query: &str) -> Option<GeoPoint>;
}

pub struct NominatimGeocoder {
    fetcher: Fetcher,
    last_request: Mutex<Option<Instant>>,
}

#[derive(Debug, Deserialize)]
struct NominatimHit {
    lat: String,
    lon: String,
    #[serde(default)]
    address: Option<NominatimAddress>,
}

#[derive(Debug, Deserialize)]
struct NominatimAddress {
    country_code: Option<String>,
}

impl NominatimGeocoder {
    pub fn new() -> Self {
        Self {
            fetcher: Fetcher::new(1),
            last_request: Mutex::new(None),
        }
    }

    async fn wait_for_rate_limit(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(previous) = *last {
            let window = Duration::from_millis(RATE_LIMIT_WINDOW_MS);
            let elapsed = previous.elapsed();
            if elapsed < window {
                sleep(window - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

impl Default for NominatimGeocoder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Geocoder for NominatimGeocoder {
    async fn geocode(&self, query: &str) -> Option<GeoPoint> {
        self.wait_for_rate_limit().await;

        let url = "https://nominatim.openstreetmap.org/search";
        let response = self
            .fetcher
            .execute(url, |client| {
                client.get(url).query(&[
                    ("q", query),
                    ("format", "jsonv2"),
                    ("limit", "1"),
                    ("addressdetails", "1"),
                ])
            })
            .await
            .ok()?;

        let hits: Vec<NominatimHit> = response.json().await.ok()?;
        let hit = hits.into_iter().next()?;
        let latitude = hit.lat.parse().ok()?;
        let longitude = hit.lon.parse().ok()?;
        let country_code = hit
            .address
            .and_then(|address| address.country_code)
            .map(|code| code.to_uppercase());

        debug!(query, latitude, longitude, ?country_code, "geocoded");
        Some(GeoPoint {
            latitude,
            longitude,
            country_code,
        })
    }
}
