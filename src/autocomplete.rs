use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::warn;

use crate::errors::AppResult;
use crate::geo::GeoPoint;
use crate::mapbox::{check_status, FeatureCollection, MapboxSettings};

const MIN_QUERY_CHARS: usize = 3;
const MAX_SUGGESTIONS: usize = 5;
const SUGGESTION_TYPES: &str = "place,address,poi";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Suggestion {
    pub id: String,
    pub text: String,
    pub point: GeoPoint,
}

/// Address suggestions for partially typed input. Never fails: provider
/// problems degrade to an empty list.
#[async_trait]
pub trait AddressAutocompleter: Send + Sync {
    async fn suggest(&self, query: &str) -> Vec<Suggestion>;
}

pub struct MapboxAutocompleter {
    http: Client,
    settings: MapboxSettings,
}

impl MapboxAutocompleter {
    pub fn new(settings: MapboxSettings) -> AppResult<Self> {
        Ok(Self {
            http: settings.http_client()?,
            settings,
        })
    }

    async fn fetch(&self, query: &str) -> AppResult<Vec<Suggestion>> {
        let mut url = self.settings.places_url(query)?;
        url.query_pairs_mut()
            .append_pair("country", &self.settings.country)
            .append_pair("limit", &MAX_SUGGESTIONS.to_string())
            .append_pair("types", SUGGESTION_TYPES);

        let response = self.http.get(url).send().await?;
        check_status(response.status())?;
        let parsed: FeatureCollection = response.json().await?;

        Ok(parsed
            .features
            .into_iter()
            .filter_map(|feature| {
                let point = feature.point().filter(GeoPoint::is_valid)?;
                Some(Suggestion {
                    id: feature.id?,
                    text: feature.place_name?,
                    point,
                })
            })
            .take(MAX_SUGGESTIONS)
            .collect())
    }
}

#[async_trait]
impl AddressAutocompleter for MapboxAutocompleter {
    async fn suggest(&self, query: &str) -> Vec<Suggestion> {
        let query = query.trim();
        if query.chars().count() < MIN_QUERY_CHARS {
            return Vec::new();
        }
        match self.fetch(query).await {
            Ok(suggestions) => suggestions,
            Err(err) => {
                warn!(target: "autocomplete", error = %err, "address autocomplete failed");
                Vec::new()
            }
        }
    }
}

/// Autocompleter used when no provider token is configured.
#[derive(Default)]
pub struct NoSuggestions;

#[async_trait]
impl AddressAutocompleter for NoSuggestions {
    async fn suggest(&self, _query: &str) -> Vec<Suggestion> {
        Vec::new()
    }
}
