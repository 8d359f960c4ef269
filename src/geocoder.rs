use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::geo::GeoPoint;
use crate::mapbox::{check_status, FeatureCollection, MapboxSettings};

/// Best provider match for an address. Never persisted on its own.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeocodeResult {
    pub coordinates: [f64; 2],
    pub formatted_address: String,
}

impl GeocodeResult {
    pub fn point(&self) -> GeoPoint {
        GeoPoint::from_coordinates(self.coordinates)
    }
}

/// Turns free-text addresses into points.
///
/// `Ok(None)` means the provider answered but found nothing; callers must not
/// retry it. Errors are `MissingAddress`, `RateLimited` or `Provider`.
#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn geocode(&self, address: &str) -> AppResult<Option<GeocodeResult>>;
}

pub struct MapboxGeocoder {
    http: Client,
    settings: MapboxSettings,
    rate_limit_backoff: Duration,
    calls: AtomicUsize,
}

impl MapboxGeocoder {
    pub fn new(settings: MapboxSettings, rate_limit_backoff: Duration) -> AppResult<Self> {
        Ok(Self {
            http: settings.http_client()?,
            settings,
            rate_limit_backoff,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn from_config(config: &AppConfig) -> AppResult<Option<Self>> {
        match MapboxSettings::from_config(config) {
            Some(settings) => Self::new(settings, config.rate_limit_backoff()).map(Some),
            None => Ok(None),
        }
    }

    /// Number of outbound provider requests issued so far.
    pub fn provider_calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn request(&self, address: &str) -> AppResult<Option<GeocodeResult>> {
        let mut url = self.settings.places_url(address)?;
        url.query_pairs_mut()
            .append_pair("limit", "1")
            .append_pair("country", &self.settings.country);

        self.calls.fetch_add(1, Ordering::SeqCst);
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|err| AppError::Provider(err.without_url().to_string()))?;
        check_status(response.status())?;

        let parsed: FeatureCollection = response
            .json()
            .await
            .map_err(|err| {
                AppError::Provider(format!(
                    "malformed geocoding response: {}",
                    err.without_url()
                ))
            })?;
        let Some(feature) = parsed.features.into_iter().next() else {
            return Ok(None);
        };

        let point = feature
            .point()
            .ok_or_else(|| AppError::Provider("geocoding feature missing center".into()))?;
        point
            .validate()
            .map_err(|reason| AppError::Provider(format!("provider returned {reason}")))?;
        let formatted_address = feature
            .place_name
            .filter(|name| !name.trim().is_empty())
            .ok_or_else(|| AppError::Provider("geocoding feature missing place_name".into()))?;

        Ok(Some(GeocodeResult {
            coordinates: point.coordinates(),
            formatted_address,
        }))
    }
}

#[async_trait]
impl Geocoder for MapboxGeocoder {
    async fn geocode(&self, address: &str) -> AppResult<Option<GeocodeResult>> {
        let address = address.trim();
        if address.is_empty() {
            return Err(AppError::MissingAddress);
        }

        match self.request(address).await {
            Err(AppError::RateLimited) => {
                warn!(
                    target: "geocoder",
                    backoff_ms = self.rate_limit_backoff.as_millis() as u64,
                    "rate limited by geocoding provider; retrying once after back-off"
                );
                sleep(self.rate_limit_backoff).await;
                self.request(address).await
            }
            other => {
                if let Ok(None) = &other {
                    debug!(target: "geocoder", address, "no geocoding match");
                }
                other
            }
        }
    }
}

/// Geocoder used when no provider token is configured.
#[derive(Default)]
pub struct UnconfiguredGeocoder;

#[async_trait]
impl Geocoder for UnconfiguredGeocoder {
    async fn geocode(&self, address: &str) -> AppResult<Option<GeocodeResult>> {
        if address.trim().is_empty() {
            return Err(AppError::MissingAddress);
        }
        Err(AppError::Config("MAPBOX_ACCESS_TOKEN is not configured".into()))
    }
}

pub fn geocoder_from_config(config: &AppConfig) -> AppResult<Arc<dyn Geocoder>> {
    Ok(match MapboxGeocoder::from_config(config)? {
        Some(geocoder) => Arc::new(geocoder),
        None => {
            warn!(target: "geocoder", "MAPBOX_ACCESS_TOKEN missing; geocoding disabled");
            Arc::new(UnconfiguredGeocoder)
        }
    })
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use httptest::matchers::{all_of, contains, request, url_decoded};
    use httptest::responders::{cycle, json_encoded, status_code};
    use httptest::{Expectation, Server};
    use secrecy::SecretString;
    use serde_json::json;

    use super::*;

    fn geocoder(server: &Server, backoff: Duration) -> MapboxGeocoder {
        let settings = MapboxSettings {
            access_token: SecretString::from("pk.test".to_string()),
            api_base: server.url("/").to_string(),
            country: "IN".into(),
            timeout: Duration::from_secs(2),
        };
        MapboxGeocoder::new(settings, backoff).unwrap()
    }

    fn baker_street() -> serde_json::Value {
        json!({
            "features": [{
                "id": "address.1",
                "center": [-0.1586, 51.5237],
                "place_name": "221B Baker Street, London, UK"
            }]
        })
    }

    #[tokio::test]
    async fn returns_top_match_longitude_first() {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method("GET"),
                request::path(
                    "/geocoding/v5/mapbox.places/221B%20Baker%20Street,%20London.json"
                ),
                request::query(url_decoded(contains(("limit", "1")))),
                request::query(url_decoded(contains(("country", "IN")))),
            ])
            .respond_with(json_encoded(baker_street())),
        );

        let result = geocoder(&server, Duration::from_millis(10))
            .geocode("221B Baker Street, London")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.coordinates, [-0.1586, 51.5237]);
        assert_eq!(result.formatted_address, "221B Baker Street, London, UK");
    }

    #[tokio::test]
    async fn empty_address_never_reaches_provider() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method("GET"))
                .times(0)
                .respond_with(status_code(500)),
        );

        let geocoder = geocoder(&server, Duration::from_millis(10));
        for address in ["", "   "] {
            let err = geocoder.geocode(address).await.unwrap_err();
            assert!(matches!(err, AppError::MissingAddress));
        }
        assert_eq!(geocoder.provider_calls(), 0);
    }

    #[tokio::test]
    async fn zero_candidates_is_no_match() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method("GET"))
                .times(1)
                .respond_with(json_encoded(json!({ "features": [] }))),
        );

        let result = geocoder(&server, Duration::from_millis(10))
            .geocode("nowhere at all")
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn retries_once_after_rate_limit_backoff() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method("GET"))
                .times(2)
                .respond_with(cycle![status_code(429), json_encoded(baker_street())]),
        );

        let backoff = Duration::from_millis(150);
        let geocoder = geocoder(&server, backoff);
        let started = Instant::now();
        let result = geocoder.geocode("221B Baker Street").await.unwrap().unwrap();
        assert!(started.elapsed() >= backoff);
        assert_eq!(result.coordinates, [-0.1586, 51.5237]);
        assert_eq!(geocoder.provider_calls(), 2);
    }

    #[tokio::test]
    async fn second_rate_limit_is_surfaced() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method("GET"))
                .times(2)
                .respond_with(status_code(429)),
        );

        let err = geocoder(&server, Duration::from_millis(10))
            .geocode("Pune")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::RateLimited));
    }

    #[tokio::test]
    async fn auth_failures_and_bad_payloads_are_provider_errors() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method("GET"))
                .times(3)
                .respond_with(cycle![
                    status_code(401),
                    status_code(200).body("not json"),
                    json_encoded(json!({
                        "features": [{ "center": [200.0, 10.0], "place_name": "Bad" }]
                    })),
                ]),
        );

        let geocoder = geocoder(&server, Duration::from_millis(10));
        for _ in 0..3 {
            let err = geocoder.geocode("Mumbai").await.unwrap_err();
            assert!(matches!(err, AppError::Provider(_)), "got {err:?}");
        }
    }
}
