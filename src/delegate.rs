use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Deserialize;
use tracing::debug;

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};

/// Which response shapes are accepted from the recommendation service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdExtraction {
    /// Only `{ "productIds": [...] }`.
    #[default]
    Canonical,
    /// Canonical first, then a bare array, `ids` or `product_ids`.
    LegacyCompatible,
}

#[derive(Deserialize)]
struct CanonicalResponse {
    #[serde(rename = "productIds")]
    product_ids: Vec<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum LegacyResponse {
    Bare(Vec<String>),
    Ids { ids: Vec<String> },
    SnakeCase { product_ids: Vec<String> },
}

impl LegacyResponse {
    fn into_ids(self) -> Vec<String> {
        match self {
            LegacyResponse::Bare(ids)
            | LegacyResponse::Ids { ids }
            | LegacyResponse::SnakeCase { product_ids: ids } => ids,
        }
    }
}

impl IdExtraction {
    /// Decodes product identifiers from a delegate response body. Blank
    /// identifiers are discarded.
    pub fn extract_ids(&self, body: &[u8]) -> AppResult<Vec<String>> {
        let ids = match serde_json::from_slice::<CanonicalResponse>(body) {
            Ok(canonical) => canonical.product_ids,
            Err(strict_err) => match self {
                IdExtraction::Canonical => {
                    return Err(AppError::DelegateUnavailable(format!(
                        "unrecognised recommendation payload: {strict_err}"
                    )))
                }
                IdExtraction::LegacyCompatible => serde_json::from_slice::<LegacyResponse>(body)
                    .map(LegacyResponse::into_ids)
                    .map_err(|err| {
                        AppError::DelegateUnavailable(format!(
                            "unrecognised recommendation payload: {err}"
                        ))
                    })?,
            },
        };
        Ok(ids
            .into_iter()
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .collect())
    }
}

/// External service proposing product ids for a text query. Any error is
/// reported as `DelegateUnavailable`.
#[async_trait]
pub trait RecommendationDelegate: Send + Sync {
    async fn recommend(&self, query: &str) -> AppResult<Vec<String>>;
}

pub struct HttpRecommendationDelegate {
    http: Client,
    endpoint: Url,
    extraction: IdExtraction,
}

impl HttpRecommendationDelegate {
    pub fn new(base_url: &str, timeout: Duration, extraction: IdExtraction) -> AppResult<Self> {
        let mut endpoint = Url::parse(base_url).map_err(|err| {
            AppError::Config(format!("invalid recommendation delegate url: {err}"))
        })?;
        endpoint
            .path_segments_mut()
            .map_err(|_| {
                AppError::Config(format!("invalid recommendation delegate url: {base_url}"))
            })?
            .pop_if_empty()
            .push("recommend");
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            endpoint,
            extraction,
        })
    }

    pub fn from_config(config: &AppConfig) -> AppResult<Option<Self>> {
        let Some(base_url) = config.recommendation_delegate_url.as_deref() else {
            return Ok(None);
        };
        let extraction = if config.recommendation_legacy_shapes {
            IdExtraction::LegacyCompatible
        } else {
            IdExtraction::Canonical
        };
        Self::new(base_url, config.recommendation_timeout(), extraction).map(Some)
    }
}

#[async_trait]
impl RecommendationDelegate for HttpRecommendationDelegate {
    async fn recommend(&self, query: &str) -> AppResult<Vec<String>> {
        let unavailable = |err: reqwest::Error| AppError::DelegateUnavailable(err.to_string());
        let response = self
            .http
            .get(self.endpoint.clone())
            .query(&[("query", query)])
            .send()
            .await
            .map_err(unavailable)?;
        let status = response.status();
        if !status.is_success() {
            return Err(AppError::DelegateUnavailable(format!(
                "recommendation delegate responded with {status}"
            )));
        }
        let body = response.bytes().await.map_err(unavailable)?;
        let ids = self.extraction.extract_ids(&body)?;
        debug!(target: "search", count = ids.len(), "recommendation delegate answered");
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use httptest::matchers::{all_of, contains, request, url_decoded};
    use httptest::responders::{json_encoded, status_code};
    use httptest::{Expectation, Server};
    use serde_json::json;

    use super::*;

    #[test]
    fn canonical_shape_is_always_accepted() {
        let body = br#"{ "productIds": ["a", " ", "b"] }"#;
        for mode in [IdExtraction::Canonical, IdExtraction::LegacyCompatible] {
            assert_eq!(mode.extract_ids(body).unwrap(), vec!["a", "b"]);
        }
    }

    #[test]
    fn legacy_shapes_require_the_compatibility_mode() {
        let bodies: [&[u8]; 3] = [
            br#"["a", "b"]"#,
            br#"{ "ids": ["a", "b"] }"#,
            br#"{ "product_ids": ["a", "b"] }"#,
        ];
        for body in bodies {
            assert!(matches!(
                IdExtraction::Canonical.extract_ids(body),
                Err(AppError::DelegateUnavailable(_))
            ));
            assert_eq!(
                IdExtraction::LegacyCompatible.extract_ids(body).unwrap(),
                vec!["a", "b"]
            );
        }
        assert!(IdExtraction::LegacyCompatible
            .extract_ids(br#"{ "results": [] }"#)
            .is_err());
    }

    #[tokio::test]
    async fn calls_recommend_endpoint_with_query() {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method("GET"),
                request::path("/api/recommend"),
                request::query(url_decoded(contains(("query", "red bricks")))),
            ])
            .respond_with(json_encoded(json!({ "productIds": ["p1", "p2"] }))),
        );

        let delegate = HttpRecommendationDelegate::new(
            &server.url("/api/").to_string(),
            Duration::from_secs(1),
            IdExtraction::Canonical,
        )
        .unwrap();
        assert_eq!(delegate.recommend("red bricks").await.unwrap(), vec!["p1", "p2"]);
    }

    #[tokio::test]
    async fn non_success_status_is_unavailable() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method("GET")).respond_with(status_code(500)),
        );

        let delegate = HttpRecommendationDelegate::new(
            &server.url("/").to_string(),
            Duration::from_secs(1),
            IdExtraction::Canonical,
        )
        .unwrap();
        assert!(matches!(
            delegate.recommend("cement").await,
            Err(AppError::DelegateUnavailable(_))
        ));
    }
}
