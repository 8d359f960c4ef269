//! HTTP surface of the marketplace search backend.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/api/products/search` | Text search (delegate first, local fallback) or geo search |
//! | `GET`  | `/api/products/nearby` | Products within `radius` km of `lat`/`lng` |
//! | `POST` | `/api/products` | Create a product, geocoding its address inline |
//! | `GET`  | `/api/products/categories` | Fixed material category list |
//! | `GET`  | `/api/products/{id}` | Single product |
//! | `PUT`  | `/api/products/{id}/address` | Change the address and re-geocode |
//! | `GET`  | `/api/geo/suggest` | Address autocomplete |
//! | `GET`  | `/api/geo/distance` | Driving distance between two points |
//! | `GET`  | `/api/health` | Liveness plus redacted configuration |
//!
//! Creates and address updates are pushed to the catalog webhook when one is
//! configured.
//!
//! Errors are returned as `{ "error": { "code": "...", "message": "..." } }`.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{debug, error, info, warn};

use crate::autocomplete::{AddressAutocompleter, MapboxAutocompleter, NoSuggestions, Suggestion};
use crate::config::{AppConfig, PublicAppConfig};
use crate::delegate::{HttpRecommendationDelegate, RecommendationDelegate};
use crate::distance::{DistanceCalculator, GreatCircleDistance, MapboxDistanceCalculator, RouteDistance};
use crate::errors::{AppError, AppResult};
use crate::geo::GeoPoint;
use crate::geocoder::{geocoder_from_config, Geocoder};
use crate::mapbox::MapboxSettings;
use crate::search::{SearchCoordinator, SearchOutcome, SearchRequest};
use crate::store::{NewProduct, Product, ProductStore, MATERIAL_CATEGORIES};
use crate::webhook::{CatalogChange, CatalogNotifier, HttpCatalogNotifier};

/// Shared handler state. Every member is cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub store: ProductStore,
    pub search: SearchCoordinator,
    pub geocoder: Arc<dyn Geocoder>,
    pub inline_geocode_timeout: Duration,
    pub notifier: Option<Arc<dyn CatalogNotifier>>,
    pub autocompleter: Arc<dyn AddressAutocompleter>,
    pub distance: Arc<dyn DistanceCalculator>,
    pub profile: Arc<PublicAppConfig>,
}

impl AppState {
    /// Wires every capability from configuration. Missing provider settings
    /// select the offline implementations.
    pub fn from_config(config: &AppConfig) -> AppResult<Self> {
        let store = ProductStore::open(&config.database_path)?;
        let geocoder = geocoder_from_config(config)?;
        let delegate = HttpRecommendationDelegate::from_config(config)?
            .map(|delegate| Arc::new(delegate) as Arc<dyn RecommendationDelegate>);
        if delegate.is_none() {
            info!(target: "server", "no recommendation delegate configured; text search is local only");
        }

        let notifier = HttpCatalogNotifier::from_config(config)?
            .map(|notifier| Arc::new(notifier) as Arc<dyn CatalogNotifier>);

        let (autocompleter, distance): (Arc<dyn AddressAutocompleter>, Arc<dyn DistanceCalculator>) =
            match MapboxSettings::from_config(config) {
                Some(settings) => (
                    Arc::new(MapboxAutocompleter::new(settings.clone())?),
                    Arc::new(MapboxDistanceCalculator::new(settings)?),
                ),
                None => (Arc::new(NoSuggestions), Arc::new(GreatCircleDistance)),
            };

        Ok(Self {
            search: SearchCoordinator::from_config(store.clone(), delegate, config),
            store,
            geocoder,
            inline_geocode_timeout: config.inline_geocode_timeout(),
            notifier,
            autocompleter,
            distance,
            profile: Arc::new(config.public_profile()),
        })
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(handle_health))
        .route("/api/products", post(handle_create_product))
        .route("/api/products/search", post(handle_search))
        .route("/api/products/nearby", get(handle_nearby))
        .route("/api/products/categories", get(handle_categories))
        .route("/api/products/{id}", get(handle_get_product))
        .route("/api/products/{id}/address", put(handle_update_address))
        .route("/api/geo/suggest", get(handle_suggest))
        .route("/api/geo/distance", get(handle_distance))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(tracing::Level::INFO))
                .on_response(DefaultOnResponse::new().level(tracing::Level::INFO)),
        )
        .layer(cors)
        .with_state(state)
}

/// Binds `config.bind_addr` and serves until Ctrl-C.
pub async fn run_server(config: &AppConfig) -> anyhow::Result<()> {
    let state = AppState::from_config(config)?;
    let listener = TcpListener::bind(&config.bind_addr).await?;
    info!(target: "server", addr = %config.bind_addr, "listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!(target: "server", "shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(target: "server", error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

#[derive(Debug)]
pub struct HttpError(AppError);

impl From<AppError> for HttpError {
    fn from(err: AppError) -> Self {
        Self(err)
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let (status, code) = match &self.0 {
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            err if err.is_client_error() => (StatusCode::BAD_REQUEST, "bad_request"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        let message = if status.is_server_error() {
            error!(target: "server", error = %self.0, "request failed");
            "internal server error".to_string()
        } else {
            self.0.to_string()
        };
        (
            status,
            Json(ErrorBody {
                error: ErrorDetail { code, message },
            }),
        )
            .into_response()
    }
}

type HttpResult<T> = Result<T, HttpError>;

fn bad_body(rejection: JsonRejection) -> HttpError {
    AppError::InvalidRequest(rejection.body_text()).into()
}

fn bad_query(rejection: QueryRejection) -> HttpError {
    AppError::InvalidQuery(rejection.body_text()).into()
}

// ============ Products ============

/// `{ "query": ... }` for text search or `{ "point": [lng, lat], "radiusKm": ... }`
/// for geo search.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchBody {
    query: Option<String>,
    point: Option<[f64; 2]>,
    radius_km: Option<f64>,
}

impl SearchBody {
    fn into_request(self) -> AppResult<SearchRequest> {
        match self {
            SearchBody {
                query: Some(query), ..
            } => Ok(SearchRequest::Text { query }),
            SearchBody {
                point: Some(point),
                radius_km: Some(radius_km),
                ..
            } => Ok(SearchRequest::Geo {
                point: GeoPoint::from_coordinates(point),
                radius_km,
            }),
            _ => Err(AppError::InvalidRequest(
                "either query or point with radiusKm is required".into(),
            )),
        }
    }
}

async fn handle_search(
    State(state): State<AppState>,
    body: Result<Json<SearchBody>, JsonRejection>,
) -> HttpResult<Json<SearchOutcome>> {
    let Json(body) = body.map_err(bad_body)?;
    let outcome = state.search.search(body.into_request()?).await?;
    Ok(Json(outcome))
}

#[derive(Deserialize)]
struct NearbyParams {
    lat: Option<f64>,
    lng: Option<f64>,
    radius: Option<f64>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct NearbyResponse {
    products: Vec<Product>,
    results_count: usize,
}

async fn handle_nearby(
    State(state): State<AppState>,
    params: Result<Query<NearbyParams>, QueryRejection>,
) -> HttpResult<Json<NearbyResponse>> {
    let Query(params) = params.map_err(bad_query)?;
    let (Some(lat), Some(lng), Some(radius_km)) = (params.lat, params.lng, params.radius) else {
        return Err(AppError::InvalidQuery("lat, lng and radius are required".into()).into());
    };
    let outcome = state
        .search
        .search(SearchRequest::Geo {
            point: GeoPoint::new(lng, lat),
            radius_km,
        })
        .await?;
    Ok(Json(NearbyResponse {
        results_count: outcome.products.len(),
        products: outcome.products,
    }))
}

async fn handle_create_product(
    State(state): State<AppState>,
    body: Result<Json<NewProduct>, JsonRejection>,
) -> HttpResult<(StatusCode, Json<Product>)> {
    let Json(new) = body.map_err(bad_body)?;
    let created = state.store.create_product(new)?;
    let product = geocode_inline(&state, created).await?;
    notify_catalog(&state, &product, CatalogChange::Added).await;
    Ok((StatusCode::CREATED, Json(product)))
}

async fn handle_get_product(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> HttpResult<Json<Product>> {
    let product = state
        .store
        .get_product(&id)?
        .ok_or_else(|| AppError::NotFound(format!("product {id}")))?;
    Ok(Json(product))
}

#[derive(Deserialize)]
struct AddressBody {
    address: String,
}

async fn handle_update_address(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Result<Json<AddressBody>, JsonRejection>,
) -> HttpResult<Json<Product>> {
    let Json(body) = body.map_err(bad_body)?;
    let updated = state.store.update_address(&id, &body.address)?;
    let product = geocode_inline(&state, updated).await?;
    notify_catalog(&state, &product, CatalogChange::Updated).await;
    Ok(Json(product))
}

async fn handle_categories() -> Json<&'static [&'static str]> {
    Json(MATERIAL_CATEGORIES)
}

/// Best-effort geocode of a freshly written address, bounded by
/// `inline_geocode_timeout`. Failures are logged and the product is returned
/// as stored; the migration picks it up later.
async fn geocode_inline(state: &AppState, product: Product) -> AppResult<Product> {
    let lookup = timeout(
        state.inline_geocode_timeout,
        state.geocoder.geocode(&product.address),
    );
    let Ok(outcome) = lookup.await else {
        warn!(
            target: "server",
            product_id = %product.id,
            timeout_ms = state.inline_geocode_timeout.as_millis() as u64,
            "inline geocoding timed out"
        );
        return Ok(product);
    };
    match outcome {
        Ok(Some(result)) => {
            if let Err(err) =
                state
                    .store
                    .set_location(&product.id, result.coordinates, &result.formatted_address)
            {
                warn!(target: "server", product_id = %product.id, error = %err, "could not store geocoded location");
                return Ok(product);
            }
            Ok(state.store.get_product(&product.id)?.unwrap_or(product))
        }
        Ok(None) => {
            debug!(target: "server", product_id = %product.id, "address did not geocode");
            Ok(product)
        }
        Err(err) => {
            warn!(target: "server", product_id = %product.id, error = %err, "inline geocoding failed");
            Ok(product)
        }
    }
}

async fn notify_catalog(state: &AppState, product: &Product, change: CatalogChange) {
    if let Some(notifier) = &state.notifier {
        notifier.product_changed(product, change).await;
    }
}

// ============ Geo helpers ============

#[derive(Deserialize)]
struct SuggestParams {
    q: Option<String>,
}

#[derive(Serialize)]
struct SuggestResponse {
    suggestions: Vec<Suggestion>,
}

async fn handle_suggest(
    State(state): State<AppState>,
    params: Result<Query<SuggestParams>, QueryRejection>,
) -> HttpResult<Json<SuggestResponse>> {
    let Query(params) = params.map_err(bad_query)?;
    let suggestions = state
        .autocompleter
        .suggest(params.q.as_deref().unwrap_or_default())
        .await;
    Ok(Json(SuggestResponse { suggestions }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DistanceParams {
    from_lat: f64,
    from_lng: f64,
    to_lat: f64,
    to_lng: f64,
}

#[derive(Serialize)]
struct DistanceResponse {
    route: Option<RouteDistance>,
}

async fn handle_distance(
    State(state): State<AppState>,
    params: Result<Query<DistanceParams>, QueryRejection>,
) -> HttpResult<Json<DistanceResponse>> {
    let Query(params) = params.map_err(bad_query)?;
    let route = state
        .distance
        .route_distance(
            GeoPoint::new(params.from_lng, params.from_lat),
            GeoPoint::new(params.to_lng, params.to_lat),
        )
        .await?;
    Ok(Json(DistanceResponse { route }))
}

// ============ Health ============

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    products: usize,
    products_needing_geocode: usize,
    config: PublicAppConfig,
}

async fn handle_health(State(state): State<AppState>) -> HttpResult<Json<HealthResponse>> {
    Ok(Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        products: state.store.count_products()?,
        products_needing_geocode: state.store.count_needing_geocode()?,
        config: state.profile.as_ref().clone(),
    }))
}
