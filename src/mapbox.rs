use std::time::Duration;

use reqwest::{Client, StatusCode, Url};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::geo::GeoPoint;

/// Connection details shared by every Mapbox-backed capability.
#[derive(Clone)]
pub struct MapboxSettings {
    pub access_token: SecretString,
    pub api_base: String,
    pub country: String,
    pub timeout: Duration,
}

impl MapboxSettings {
    pub fn from_config(config: &AppConfig) -> Option<Self> {
        let access_token = config.mapbox_access_token.clone()?;
        Some(Self {
            access_token,
            api_base: config.mapbox_api_base.clone(),
            country: config.geocode_country.clone(),
            timeout: config.geocode_timeout(),
        })
    }

    pub fn http_client(&self) -> AppResult<Client> {
        Ok(Client::builder()
            .user_agent(concat!("materials-geosearch/", env!("CARGO_PKG_VERSION")))
            .timeout(self.timeout)
            .build()?)
    }

    /// `{base}/geocoding/v5/mapbox.places/{query}.json`, with the free-text
    /// query percent-encoded as a single path segment.
    pub fn places_url(&self, query: &str) -> AppResult<Url> {
        let mut url = self.base_url()?;
        url.path_segments_mut()
            .map_err(|_| AppError::Config(format!("invalid Mapbox base url: {}", self.api_base)))?
            .pop_if_empty()
            .extend(["geocoding", "v5", "mapbox.places", &format!("{query}.json")]);
        url.query_pairs_mut()
            .append_pair("access_token", self.access_token.expose_secret());
        Ok(url)
    }

    /// `{base}/directions-matrix/v1/mapbox/driving/{lng,lat;lng,lat}`.
    pub fn matrix_url(&self, origin: GeoPoint, destination: GeoPoint) -> AppResult<Url> {
        let coordinates = format!(
            "{},{};{},{}",
            origin.lng, origin.lat, destination.lng, destination.lat
        );
        let mut url = self.base_url()?;
        url.path_segments_mut()
            .map_err(|_| AppError::Config(format!("invalid Mapbox base url: {}", self.api_base)))?
            .pop_if_empty()
            .extend(["directions-matrix", "v1", "mapbox", "driving", &coordinates]);
        url.query_pairs_mut()
            .append_pair("access_token", self.access_token.expose_secret());
        Ok(url)
    }

    fn base_url(&self) -> AppResult<Url> {
        Url::parse(&self.api_base)
            .map_err(|err| AppError::Config(format!("invalid Mapbox base url: {err}")))
    }
}

/// Subset of the Mapbox geocoding response used by the geocoder and the
/// autocompleter.
#[derive(Debug, Deserialize)]
pub(crate) struct FeatureCollection {
    #[serde(default)]
    pub features: Vec<Feature>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Feature {
    pub id: Option<String>,
    pub center: Option<Vec<f64>>,
    pub place_name: Option<String>,
}

impl Feature {
    pub fn point(&self) -> Option<GeoPoint> {
        match self.center.as_deref() {
            Some([lng, lat]) => Some(GeoPoint::new(*lng, *lat)),
            _ => None,
        }
    }
}

/// Maps a provider status to the error taxonomy. Only 429 counts as rate
/// limiting; 401/403 are credential problems.
pub(crate) fn check_status(status: StatusCode) -> AppResult<()> {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(AppError::RateLimited);
    }
    if !status.is_success() {
        return Err(AppError::Provider(format!("provider responded with {status}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(base: &str) -> MapboxSettings {
        MapboxSettings {
            access_token: SecretString::from("pk.test".to_string()),
            api_base: base.into(),
            country: "IN".into(),
            timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn encodes_address_as_single_segment() {
        let url = settings("https://api.mapbox.com")
            .places_url("221B Baker Street/Flat 2, London")
            .unwrap();
        assert_eq!(
            url.path(),
            "/geocoding/v5/mapbox.places/221B%20Baker%20Street%2FFlat%202,%20London.json"
        );
        assert!(url.query().unwrap().contains("access_token=pk.test"));
    }

    #[test]
    fn keeps_base_path_prefix() {
        let url = settings("http://127.0.0.1:9000/mapbox/")
            .matrix_url(GeoPoint::new(73.8, 18.5), GeoPoint::new(72.8, 19.0))
            .unwrap();
        assert_eq!(
            url.path(),
            "/mapbox/directions-matrix/v1/mapbox/driving/73.8,18.5;72.8,19"
        );
    }

    #[test]
    fn classifies_statuses() {
        assert!(matches!(
            check_status(StatusCode::TOO_MANY_REQUESTS),
            Err(AppError::RateLimited)
        ));
        assert!(matches!(
            check_status(StatusCode::FORBIDDEN),
            Err(AppError::Provider(_))
        ));
        assert!(check_status(StatusCode::OK).is_ok());
    }
}
