use std::time::Duration;
use std::{env, io};

use secrecy::SecretString;
use serde::Serialize;
use tracing::debug;

const DEFAULT_MAPBOX_API_BASE: &str = "https://api.mapbox.com";
const DEFAULT_GEOCODE_COUNTRY: &str = "IN";
const DEFAULT_RATE_LIMIT_BACKOFF_MS: u64 = 60_000;
const DEFAULT_SEARCH_PAGE_SIZE: usize = 50;
const DEFAULT_INLINE_GEOCODE_TIMEOUT_MS: u64 = 3_000;
const DEFAULT_CATALOG_WEBHOOK_TIMEOUT_MS: u64 = 10_000;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database_path: String,
    pub bind_addr: String,
    pub mapbox_access_token: Option<SecretString>,
    pub mapbox_api_base: String,
    pub geocode_country: String,
    pub geocode_timeout_ms: u64,
    pub geocode_rate_limit_backoff_ms: u64,
    /// Upper bound on the geocode done while serving a create or address update.
    pub inline_geocode_timeout_ms: u64,
    pub recommendation_delegate_url: Option<String>,
    pub recommendation_timeout_ms: u64,
    pub recommendation_legacy_shapes: bool,
    /// Base URL for product-change webhooks. Falls back to the delegate URL.
    pub catalog_webhook_url: Option<String>,
    pub catalog_webhook_timeout_ms: u64,
    pub search_page_size: usize,
    pub migration_batch_size: usize,
    pub migration_delay_ms: u64,
    pub migration_cooldown_ms: u64,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicAppConfig {
    pub database_path: String,
    pub mapbox_api_base: String,
    pub geocode_country: String,
    pub has_mapbox_token: bool,
    pub has_recommendation_delegate: bool,
    pub recommendation_timeout_ms: u64,
    pub recommendation_legacy_shapes: bool,
    pub has_catalog_webhook: bool,
    pub inline_geocode_timeout_ms: u64,
    pub search_page_size: usize,
    pub migration_batch_size: usize,
    pub migration_delay_ms: u64,
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        Self {
            database_path: env::var("DATABASE_PATH").unwrap_or_else(|_| "materials.db".to_string()),
            bind_addr: env::var("BIND_ADDR").unwrap_or_else(|_| "127.0.0.1:5000".to_string()),
            mapbox_access_token: non_empty_var("MAPBOX_ACCESS_TOKEN").map(SecretString::from),
            mapbox_api_base: non_empty_var("MAPBOX_API_BASE")
                .unwrap_or_else(|| DEFAULT_MAPBOX_API_BASE.to_string()),
            geocode_country: non_empty_var("GEOCODE_COUNTRY")
                .unwrap_or_else(|| DEFAULT_GEOCODE_COUNTRY.to_string()),
            geocode_timeout_ms: parse_u64("GEOCODE_TIMEOUT_MS", 10_000),
            geocode_rate_limit_backoff_ms: parse_u64(
                "GEOCODE_RATE_LIMIT_BACKOFF_MS",
                DEFAULT_RATE_LIMIT_BACKOFF_MS,
            ),
            inline_geocode_timeout_ms: parse_u64(
                "INLINE_GEOCODE_TIMEOUT_MS",
                DEFAULT_INLINE_GEOCODE_TIMEOUT_MS,
            ),
            recommendation_delegate_url: non_empty_var("RECOMMENDATION_DELEGATE_URL"),
            recommendation_timeout_ms: parse_u64("RECOMMENDATION_TIMEOUT_MS", 5_000),
            recommendation_legacy_shapes: parse_bool("RECOMMENDATION_LEGACY_SHAPES", false),
            catalog_webhook_url: non_empty_var("CATALOG_WEBHOOK_URL"),
            catalog_webhook_timeout_ms: parse_u64(
                "CATALOG_WEBHOOK_TIMEOUT_MS",
                DEFAULT_CATALOG_WEBHOOK_TIMEOUT_MS,
            ),
            search_page_size: parse_usize("SEARCH_PAGE_SIZE", DEFAULT_SEARCH_PAGE_SIZE).max(1),
            migration_batch_size: parse_usize("MIGRATION_BATCH_SIZE", 50).max(1),
            migration_delay_ms: parse_u64("MIGRATION_DELAY_MS", 220),
            migration_cooldown_ms: parse_u64("MIGRATION_COOLDOWN_MS", DEFAULT_RATE_LIMIT_BACKOFF_MS),
        }
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            database_path: self.database_path.clone(),
            mapbox_api_base: self.mapbox_api_base.clone(),
            geocode_country: self.geocode_country.clone(),
            has_mapbox_token: self.mapbox_access_token.is_some(),
            has_recommendation_delegate: self.recommendation_delegate_url.is_some(),
            recommendation_timeout_ms: self.recommendation_timeout_ms,
            recommendation_legacy_shapes: self.recommendation_legacy_shapes,
            has_catalog_webhook: self.catalog_webhook_base().is_some(),
            inline_geocode_timeout_ms: self.inline_geocode_timeout_ms,
            search_page_size: self.search_page_size,
            migration_batch_size: self.migration_batch_size,
            migration_delay_ms: self.migration_delay_ms,
        }
    }

    pub fn geocode_timeout(&self) -> Duration {
        Duration::from_millis(self.geocode_timeout_ms)
    }

    pub fn rate_limit_backoff(&self) -> Duration {
        Duration::from_millis(self.geocode_rate_limit_backoff_ms)
    }

    pub fn recommendation_timeout(&self) -> Duration {
        Duration::from_millis(self.recommendation_timeout_ms)
    }

    pub fn inline_geocode_timeout(&self) -> Duration {
        Duration::from_millis(self.inline_geocode_timeout_ms)
    }

    pub fn catalog_webhook_timeout(&self) -> Duration {
        Duration::from_millis(self.catalog_webhook_timeout_ms)
    }

    /// The service receiving product-change webhooks, if any.
    pub fn catalog_webhook_base(&self) -> Option<&str> {
        self.catalog_webhook_url
            .as_deref()
            .or(self.recommendation_delegate_url.as_deref())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_path: "materials.db".into(),
            bind_addr: "127.0.0.1:5000".into(),
            mapbox_access_token: None,
            mapbox_api_base: DEFAULT_MAPBOX_API_BASE.into(),
            geocode_country: DEFAULT_GEOCODE_COUNTRY.into(),
            geocode_timeout_ms: 10_000,
            geocode_rate_limit_backoff_ms: DEFAULT_RATE_LIMIT_BACKOFF_MS,
            inline_geocode_timeout_ms: DEFAULT_INLINE_GEOCODE_TIMEOUT_MS,
            recommendation_delegate_url: None,
            recommendation_timeout_ms: 5_000,
            recommendation_legacy_shapes: false,
            catalog_webhook_url: None,
            catalog_webhook_timeout_ms: DEFAULT_CATALOG_WEBHOOK_TIMEOUT_MS,
            search_page_size: DEFAULT_SEARCH_PAGE_SIZE,
            migration_batch_size: 50,
            migration_delay_ms: 220,
            migration_cooldown_ms: DEFAULT_RATE_LIMIT_BACKOFF_MS,
        }
    }
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}
