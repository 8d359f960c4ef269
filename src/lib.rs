pub mod autocomplete;
pub mod config;
pub mod db;
pub mod delegate;
pub mod distance;
pub mod errors;
pub mod geo;
pub mod geocoder;
pub mod mapbox;
pub mod migration;
pub mod search;
pub mod server;
pub mod store;
pub mod webhook;

use once_cell::sync::OnceCell;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use config::AppConfig;
pub use errors::{AppError, AppResult};
pub use geo::GeoPoint;
pub use geocoder::{GeocodeResult, Geocoder};
pub use migration::{MigrationOptions, MigrationRunner, MigrationSummary};
pub use search::{SearchCoordinator, SearchOutcome, SearchRequest, SearchSource};
pub use store::{Location, NewProduct, Product, ProductStore};

pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,materials_geosearch=debug"));
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    });
}
