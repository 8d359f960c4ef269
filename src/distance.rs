use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::errors::{AppError, AppResult};
use crate::geo::{haversine_km, GeoPoint};
use crate::mapbox::{check_status, MapboxSettings};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteDistance {
    pub meters: f64,
    /// Kilometres rounded to one decimal place.
    pub km: f64,
    pub seconds: f64,
    pub duration_text: String,
}

impl RouteDistance {
    pub fn new(meters: f64, seconds: f64) -> Self {
        Self {
            meters,
            km: (meters / 100.0).round() / 10.0,
            seconds,
            duration_text: format_duration(seconds),
        }
    }
}

/// Travel distance between two points.
#[async_trait]
pub trait DistanceCalculator: Send + Sync {
    async fn route_distance(
        &self,
        origin: GeoPoint,
        destination: GeoPoint,
    ) -> AppResult<Option<RouteDistance>>;
}

/// `"2h 5m"` from one hour up, `"12 min"` below, `"N/A"` when unknown.
pub fn format_duration(seconds: f64) -> String {
    if !seconds.is_finite() || seconds <= 0.0 {
        return "N/A".to_string();
    }
    let total = seconds as u64;
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    if hours > 0 {
        format!("{hours}h {minutes}m")
    } else {
        format!("{minutes} min")
    }
}

fn validate_pair(origin: GeoPoint, destination: GeoPoint) -> AppResult<()> {
    origin.validate().map_err(AppError::InvalidQuery)?;
    destination.validate().map_err(AppError::InvalidQuery)
}

pub struct MapboxDistanceCalculator {
    http: Client,
    settings: MapboxSettings,
}

impl MapboxDistanceCalculator {
    pub fn new(settings: MapboxSettings) -> AppResult<Self> {
        Ok(Self {
            http: settings.http_client()?,
            settings,
        })
    }
}

#[derive(Deserialize)]
struct MatrixResponse {
    distances: Option<Vec<Vec<Option<f64>>>>,
    durations: Option<Vec<Vec<Option<f64>>>>,
}

#[async_trait]
impl DistanceCalculator for MapboxDistanceCalculator {
    async fn route_distance(
        &self,
        origin: GeoPoint,
        destination: GeoPoint,
    ) -> AppResult<Option<RouteDistance>> {
        validate_pair(origin, destination)?;
        let mut url = self.settings.matrix_url(origin, destination)?;
        url.query_pairs_mut()
            .append_pair("sources", "0")
            .append_pair("destinations", "1")
            .append_pair("annotations", "distance,duration");

        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|err| AppError::Provider(err.without_url().to_string()))?;
        check_status(response.status())?;
        let parsed: MatrixResponse = response
            .json()
            .await
            .map_err(|err| AppError::Provider(err.without_url().to_string()))?;

        let first_cell = |matrix: Option<Vec<Vec<Option<f64>>>>| {
            matrix
                .and_then(|rows| rows.into_iter().next())
                .and_then(|row| row.into_iter().next())
                .flatten()
        };
        let Some(meters) = first_cell(parsed.distances) else {
            return Ok(None);
        };
        let seconds = first_cell(parsed.durations).unwrap_or(0.0);
        Ok(Some(RouteDistance::new(meters, seconds)))
    }
}

/// Straight-line fallback that needs no provider. Duration is unknown.
#[derive(Default)]
pub struct GreatCircleDistance;

#[async_trait]
impl DistanceCalculator for GreatCircleDistance {
    async fn route_distance(
        &self,
        origin: GeoPoint,
        destination: GeoPoint,
    ) -> AppResult<Option<RouteDistance>> {
        validate_pair(origin, destination)?;
        Ok(Some(RouteDistance::new(
            haversine_km(origin, destination) * 1000.0,
            0.0,
        )))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use httptest::matchers::{all_of, request};
    use httptest::responders::json_encoded;
    use httptest::{Expectation, Server};
    use secrecy::SecretString;
    use serde_json::json;

    use super::*;

    #[test]
    fn formats_durations() {
        assert_eq!(format_duration(0.0), "N/A");
        assert_eq!(format_duration(59.0), "0 min");
        assert_eq!(format_duration(754.0), "12 min");
        assert_eq!(format_duration(7_500.0), "2h 5m");
    }

    #[test]
    fn rounds_kilometres_to_one_decimal() {
        let route = RouteDistance::new(12_345.0, 900.0);
        assert_eq!(route.km, 12.3);
        assert_eq!(route.duration_text, "15 min");
    }

    #[tokio::test]
    async fn reads_first_matrix_cell() {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method("GET"),
                request::path("/directions-matrix/v1/mapbox/driving/73.8567,18.5204;72.8777,19.076"),
            ])
            .respond_with(json_encoded(json!({
                "code": "Ok",
                "distances": [[148_250.5]],
                "durations": [[11_040.0]]
            }))),
        );
        let calculator = MapboxDistanceCalculator::new(MapboxSettings {
            access_token: SecretString::from("pk.test".to_string()),
            api_base: server.url("/").to_string(),
            country: "IN".into(),
            timeout: Duration::from_secs(2),
        })
        .unwrap();

        let route = calculator
            .route_distance(GeoPoint::new(73.8567, 18.5204), GeoPoint::new(72.8777, 19.076))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(route.km, 148.3);
        assert_eq!(route.duration_text, "3h 4m");
    }

    #[tokio::test]
    async fn great_circle_rejects_invalid_points() {
        let err = GreatCircleDistance
            .route_distance(GeoPoint::new(0.0, 95.0), GeoPoint::new(0.0, 0.0))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidQuery(_)));
    }
}
