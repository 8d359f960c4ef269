//! Single entry point for product search.
//!
//! Text queries go to the recommendation delegate first (when one is
//! configured) and fall back to a local substring match whenever the delegate
//! fails, times out, or yields nothing that resolves. Geo queries never leave
//! the process: they are answered by the product store's radius query.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::delegate::RecommendationDelegate;
use crate::errors::{AppError, AppResult};
use crate::geo::GeoPoint;
use crate::store::{Product, ProductStore};

#[derive(Debug, Clone, PartialEq)]
pub enum SearchRequest {
    Text { query: String },
    Geo { point: GeoPoint, radius_km: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchSource {
    Delegate,
    Local,
    Geo,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchOutcome {
    pub products: Vec<Product>,
    pub source: SearchSource,
}

#[derive(Clone)]
pub struct SearchCoordinator {
    store: ProductStore,
    delegate: Option<Arc<dyn RecommendationDelegate>>,
    delegate_timeout: Duration,
    page_size: usize,
}

impl SearchCoordinator {
    pub fn new(
        store: ProductStore,
        delegate: Option<Arc<dyn RecommendationDelegate>>,
        delegate_timeout: Duration,
        page_size: usize,
    ) -> Self {
        Self {
            store,
            delegate,
            delegate_timeout,
            page_size: page_size.max(1),
        }
    }

    pub fn from_config(
        store: ProductStore,
        delegate: Option<Arc<dyn RecommendationDelegate>>,
        config: &AppConfig,
    ) -> Self {
        Self::new(
            store,
            delegate,
            config.recommendation_timeout(),
            config.search_page_size,
        )
    }

    pub async fn search(&self, request: SearchRequest) -> AppResult<SearchOutcome> {
        match request {
            SearchRequest::Text { query } => {
                let query = query.trim();
                if query.is_empty() {
                    return Err(AppError::InvalidRequest("query must not be empty".into()));
                }
                self.search_text(query).await
            }
            SearchRequest::Geo { point, radius_km } => {
                let products = self.store.find_within_radius(point, radius_km)?;
                Ok(SearchOutcome {
                    products,
                    source: SearchSource::Geo,
                })
            }
        }
    }

    async fn search_text(&self, query: &str) -> AppResult<SearchOutcome> {
        if let Some(delegate) = &self.delegate {
            match self.delegated(delegate.as_ref(), query).await {
                Ok(products) if !products.is_empty() => {
                    info!(target: "search", count = products.len(), "serving delegate recommendations");
                    return Ok(SearchOutcome {
                        products,
                        source: SearchSource::Delegate,
                    });
                }
                Ok(_) => {
                    debug!(target: "search", "delegate returned no resolvable products; using local search");
                }
                Err(AppError::DelegateUnavailable(reason)) => {
                    warn!(target: "search", %reason, "recommendation delegate failed; using local search");
                }
                Err(err) => return Err(err),
            }
        }

        let products = self.store.search_text(query, self.page_size)?;
        debug!(target: "search", count = products.len(), "local search complete");
        Ok(SearchOutcome {
            products,
            source: SearchSource::Local,
        })
    }

    /// Delegate ids resolved against the store. Every delegate-side failure,
    /// including the timeout, comes back as `DelegateUnavailable`; store
    /// failures pass through untouched.
    async fn delegated(
        &self,
        delegate: &dyn RecommendationDelegate,
        query: &str,
    ) -> AppResult<Vec<Product>> {
        let ids = match timeout(self.delegate_timeout, delegate.recommend(query)).await {
            Ok(Ok(ids)) => ids,
            Ok(Err(AppError::DelegateUnavailable(reason))) => {
                return Err(AppError::DelegateUnavailable(reason))
            }
            Ok(Err(err)) => return Err(AppError::DelegateUnavailable(err.to_string())),
            Err(_) => {
                return Err(AppError::DelegateUnavailable(format!(
                    "no answer within {} ms",
                    self.delegate_timeout.as_millis()
                )))
            }
        };
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.store.find_by_ids(&ids)
    }
}
